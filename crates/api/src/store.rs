//! `UserStore` implementation over the application's user table.
//!
//! The auth layer owns this table; column names are camelCase and quoted
//! to match its schema.

use async_trait::async_trait;
use corral_billing::UserStore;
use sqlx::PgPool;

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn set_plan(&self, user_id: &str, plan_id: &str) -> anyhow::Result<()> {
        let result =
            sqlx::query(r#"UPDATE "user" SET "plan" = $1, "updatedAt" = NOW() WHERE "id" = $2"#)
                .bind(plan_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("no user with id {user_id}");
        }
        Ok(())
    }

    async fn set_flag(&self, user_id: &str, key: &str, value: bool) -> anyhow::Result<()> {
        // Flags live in dedicated boolean columns; unknown keys are
        // rejected rather than interpolated into SQL.
        let query = match key {
            "paymentFailed" => {
                r#"UPDATE "user" SET "paymentFailed" = $1, "updatedAt" = NOW() WHERE "id" = $2"#
            }
            _ => anyhow::bail!("unknown user flag: {key}"),
        };

        sqlx::query(query)
            .bind(value)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as(r#"SELECT "id" FROM "user" WHERE "email" = $1"#)
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn stripe_customer_id(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as(r#"SELECT "stripeCustomerId" FROM "user" WHERE "id" = $1"#)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(id,)| id))
    }

    async fn set_stripe_customer(&self, user_id: &str, customer_id: &str) -> anyhow::Result<()> {
        sqlx::query(r#"UPDATE "user" SET "stripeCustomerId" = $1 WHERE "id" = $2"#)
            .bind(customer_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
