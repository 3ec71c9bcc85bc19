//! Catalog synchronization between local plan definitions and the remote
//! Stripe product/price catalog.
//!
//! The synchronizer only ever creates missing objects or converges display
//! names; it never deletes. Re-running against an unchanged plan set is a
//! no-op, so operators can run it as often as they like.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use stripe::{
    CreatePrice, CreatePriceRecurring, CreatePriceRecurringInterval, CreateProduct, Currency,
    IdOrCreate, ListPrices, ListProducts, Price, PriceId, Product, ProductId, UpdateProduct,
};

use corral_shared::types::{BillingInterval, PlanConfig};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Metadata key tagging a remote product with the local plan it mirrors.
/// Future runs find the product by this tag, which is what makes product
/// creation idempotent.
pub const PLAN_TAG_KEY: &str = "corral_plan_id";

/// Remote product, reduced to the fields the synchronizer cares about.
#[derive(Debug, Clone)]
pub struct RemoteProduct {
    pub id: String,
    pub name: String,
    pub plan_tag: Option<String>,
}

/// Remote price, reduced to the fields the synchronizer cares about.
#[derive(Debug, Clone)]
pub struct RemotePrice {
    pub id: String,
    pub active: bool,
    pub unit_amount: Option<i64>,
    pub interval: Option<BillingInterval>,
}

/// The remote catalog operations the synchronizer performs. Object-safe so
/// tests can substitute an in-memory catalog.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn list_active_products(&self) -> BillingResult<Vec<RemoteProduct>>;
    async fn create_product(&self, name: &str, plan_tag: &str) -> BillingResult<RemoteProduct>;
    async fn rename_product(&self, product_id: &str, name: &str) -> BillingResult<()>;
    /// `None` when the price no longer exists remotely.
    async fn retrieve_price(&self, price_id: &str) -> BillingResult<Option<RemotePrice>>;
    async fn list_active_prices(&self, product_id: &str) -> BillingResult<Vec<RemotePrice>>;
    async fn create_price(
        &self,
        product_id: &str,
        unit_amount: i64,
        interval: BillingInterval,
        plan_tag: &str,
    ) -> BillingResult<RemotePrice>;
}

/// `CatalogApi` over the Stripe SDK.
pub struct StripeCatalog {
    stripe: StripeClient,
}

impl StripeCatalog {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

fn interval_of(price: &Price) -> Option<BillingInterval> {
    price.recurring.as_ref().and_then(|r| match r.interval {
        stripe::RecurringInterval::Month => Some(BillingInterval::Month),
        _ => None,
    })
}

#[async_trait]
impl CatalogApi for StripeCatalog {
    async fn list_active_products(&self) -> BillingResult<Vec<RemoteProduct>> {
        let params = ListProducts {
            active: Some(true),
            limit: Some(100),
            ..Default::default()
        };
        let products = Product::list(self.stripe.inner(), &params).await?;
        Ok(products
            .data
            .into_iter()
            .map(|p| RemoteProduct {
                id: p.id.to_string(),
                name: p.name.unwrap_or_default(),
                plan_tag: p
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get(PLAN_TAG_KEY))
                    .cloned(),
            })
            .collect())
    }

    async fn create_product(&self, name: &str, plan_tag: &str) -> BillingResult<RemoteProduct> {
        let mut params = CreateProduct::new(name);
        let mut metadata = HashMap::new();
        metadata.insert(PLAN_TAG_KEY.to_string(), plan_tag.to_string());
        params.metadata = Some(metadata);

        let product = Product::create(self.stripe.inner(), params).await?;
        Ok(RemoteProduct {
            id: product.id.to_string(),
            name: product.name.unwrap_or_default(),
            plan_tag: Some(plan_tag.to_string()),
        })
    }

    async fn rename_product(&self, product_id: &str, name: &str) -> BillingResult<()> {
        let id = product_id
            .parse::<ProductId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid product id: {e}")))?;
        let params = UpdateProduct {
            name: Some(name),
            ..Default::default()
        };
        Product::update(self.stripe.inner(), &id, params).await?;
        Ok(())
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<Option<RemotePrice>> {
        let id = price_id
            .parse::<PriceId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid price id: {e}")))?;
        match Price::retrieve(self.stripe.inner(), &id, &[]).await {
            Ok(price) => Ok(Some(RemotePrice {
                id: price.id.to_string(),
                active: price.active.unwrap_or(false),
                unit_amount: price.unit_amount,
                interval: interval_of(&price),
            })),
            Err(stripe::StripeError::Stripe(e)) if e.http_status == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_active_prices(&self, product_id: &str) -> BillingResult<Vec<RemotePrice>> {
        let params = ListPrices {
            product: Some(IdOrCreate::Id(product_id)),
            active: Some(true),
            limit: Some(100),
            ..Default::default()
        };
        let prices = Price::list(self.stripe.inner(), &params).await?;
        Ok(prices
            .data
            .iter()
            .map(|price| RemotePrice {
                id: price.id.to_string(),
                active: price.active.unwrap_or(false),
                unit_amount: price.unit_amount,
                interval: interval_of(price),
            })
            .collect())
    }

    async fn create_price(
        &self,
        product_id: &str,
        unit_amount: i64,
        interval: BillingInterval,
        plan_tag: &str,
    ) -> BillingResult<RemotePrice> {
        let recurring_interval = match interval {
            BillingInterval::Month => CreatePriceRecurringInterval::Month,
        };

        let mut params = CreatePrice::new(Currency::USD);
        params.product = Some(IdOrCreate::Id(product_id));
        params.unit_amount = Some(unit_amount);
        params.recurring = Some(CreatePriceRecurring {
            interval: recurring_interval,
            interval_count: None,
            aggregate_usage: None,
            trial_period_days: None,
            usage_type: None,
        });
        let mut metadata = HashMap::new();
        metadata.insert(PLAN_TAG_KEY.to_string(), plan_tag.to_string());
        params.metadata = Some(metadata);

        let price = Price::create(self.stripe.inner(), params).await?;
        Ok(RemotePrice {
            id: price.id.to_string(),
            active: price.active.unwrap_or(true),
            unit_amount: price.unit_amount,
            interval: Some(interval),
        })
    }
}

/// What the synchronizer did for one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// The recorded price still matches; nothing was touched.
    Unchanged,
    /// An existing remote price matched and was adopted.
    Found,
    /// A new remote price was created.
    Created,
    /// This plan failed; see `error`. Other plans are unaffected.
    Error,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncAction::Unchanged => "unchanged",
            SyncAction::Found => "found",
            SyncAction::Created => "created",
            SyncAction::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Per-plan outcome of a catalog run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSyncResult {
    pub plan_id: String,
    pub action: SyncAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_price_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pushes local plan definitions into the remote catalog and writes the
/// resolved price ids back into the in-memory definitions. The caller is
/// responsible for persisting the updated definitions.
pub struct CatalogSynchronizer {
    catalog: Arc<dyn CatalogApi>,
}

impl CatalogSynchronizer {
    pub fn new(catalog: Arc<dyn CatalogApi>) -> Self {
        Self { catalog }
    }

    pub fn with_stripe(stripe: StripeClient) -> Self {
        Self::new(Arc::new(StripeCatalog::new(stripe)))
    }

    /// Synchronize every paid plan. Free plans are skipped entirely: no
    /// remote object ever exists for a zero-price plan.
    pub async fn sync(&self, plans: &mut [PlanConfig]) -> Vec<PlanSyncResult> {
        let mut results = Vec::new();

        // Plans run sequentially so racing create calls cannot duplicate
        // remote objects for the same plan.
        for plan in plans.iter_mut() {
            if plan.is_free() {
                tracing::debug!(plan_id = %plan.id, "Free plan, skipping catalog sync");
                continue;
            }

            match self.sync_plan(plan).await {
                Ok((action, price_id)) => {
                    plan.remote_price_id = Some(price_id.clone());
                    results.push(PlanSyncResult {
                        plan_id: plan.id.clone(),
                        action,
                        remote_price_id: Some(price_id),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::error!(plan_id = %plan.id, error = %e, "Catalog sync failed for plan");
                    results.push(PlanSyncResult {
                        plan_id: plan.id.clone(),
                        action: SyncAction::Error,
                        remote_price_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        results
    }

    async fn sync_plan(&self, plan: &PlanConfig) -> BillingResult<(SyncAction, String)> {
        let amount = plan.price_minor_units();

        // Product resolution runs unconditionally so display-name drift
        // converges even when the price is already settled.
        let product = self.resolve_product(plan).await?;

        // The recorded price id wins when it still matches exactly.
        if let Some(price_id) = plan.remote_price_id.as_deref() {
            if let Some(price) = self.catalog.retrieve_price(price_id).await? {
                if price.active
                    && price.unit_amount == Some(amount)
                    && price.interval == Some(plan.billing_interval)
                {
                    return Ok((SyncAction::Unchanged, price.id));
                }
            }
            tracing::info!(
                plan_id = %plan.id,
                price_id = %price_id,
                "Recorded price id is stale, re-resolving"
            );
        }

        // Adopt an existing active price when amount and interval match.
        let prices = self.catalog.list_active_prices(&product.id).await?;
        if let Some(price) = prices
            .iter()
            .find(|p| p.unit_amount == Some(amount) && p.interval == Some(plan.billing_interval))
        {
            return Ok((SyncAction::Found, price.id.clone()));
        }

        let price = self
            .catalog
            .create_price(&product.id, amount, plan.billing_interval, &plan.id)
            .await?;
        tracing::info!(
            plan_id = %plan.id,
            price_id = %price.id,
            amount_minor = amount,
            "Created remote price"
        );
        Ok((SyncAction::Created, price.id))
    }

    /// Find the product tagged with this plan, creating it if absent and
    /// converging its display name if it drifted.
    async fn resolve_product(&self, plan: &PlanConfig) -> BillingResult<RemoteProduct> {
        let products = self.catalog.list_active_products().await?;
        let mut tagged: Vec<RemoteProduct> = products
            .into_iter()
            .filter(|p| p.plan_tag.as_deref() == Some(plan.id.as_str()))
            .collect();

        match tagged.len() {
            0 => {
                let product = self
                    .catalog
                    .create_product(&plan.display_name, &plan.id)
                    .await?;
                tracing::info!(
                    plan_id = %plan.id,
                    product_id = %product.id,
                    "Created remote product"
                );
                Ok(product)
            }
            1 => {
                let product = tagged.remove(0);
                if product.name != plan.display_name {
                    self.catalog
                        .rename_product(&product.id, &plan.display_name)
                        .await?;
                    tracing::info!(
                        plan_id = %plan.id,
                        product_id = %product.id,
                        "Updated product display name"
                    );
                }
                Ok(product)
            }
            n => Err(BillingError::RemoteCatalog {
                plan_id: plan.id.clone(),
                message: format!("{n} remote products tagged for this plan"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCatalog {
        products: Mutex<Vec<RemoteProduct>>,
        prices: Mutex<Vec<(String, RemotePrice)>>,
        create_calls: AtomicUsize,
        next_id: AtomicUsize,
    }

    impl FakeCatalog {
        fn next(&self, prefix: &str) -> String {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            format!("{prefix}_{n}")
        }

        fn creates(&self) -> usize {
            self.create_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CatalogApi for FakeCatalog {
        async fn list_active_products(&self) -> BillingResult<Vec<RemoteProduct>> {
            Ok(self.products.lock().unwrap().clone())
        }

        async fn create_product(&self, name: &str, plan_tag: &str) -> BillingResult<RemoteProduct> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let product = RemoteProduct {
                id: self.next("prod"),
                name: name.to_string(),
                plan_tag: Some(plan_tag.to_string()),
            };
            self.products.lock().unwrap().push(product.clone());
            Ok(product)
        }

        async fn rename_product(&self, product_id: &str, name: &str) -> BillingResult<()> {
            for product in self.products.lock().unwrap().iter_mut() {
                if product.id == product_id {
                    product.name = name.to_string();
                }
            }
            Ok(())
        }

        async fn retrieve_price(&self, price_id: &str) -> BillingResult<Option<RemotePrice>> {
            Ok(self
                .prices
                .lock()
                .unwrap()
                .iter()
                .map(|(_, price)| price)
                .find(|price| price.id == price_id)
                .cloned())
        }

        async fn list_active_prices(&self, product_id: &str) -> BillingResult<Vec<RemotePrice>> {
            Ok(self
                .prices
                .lock()
                .unwrap()
                .iter()
                .filter(|(owner, price)| owner == product_id && price.active)
                .map(|(_, price)| price.clone())
                .collect())
        }

        async fn create_price(
            &self,
            product_id: &str,
            unit_amount: i64,
            interval: BillingInterval,
            _plan_tag: &str,
        ) -> BillingResult<RemotePrice> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let price = RemotePrice {
                id: self.next("price"),
                active: true,
                unit_amount: Some(unit_amount),
                interval: Some(interval),
            };
            self.prices
                .lock()
                .unwrap()
                .push((product_id.to_string(), price.clone()));
            Ok(price)
        }
    }

    fn plan(id: &str, price: f64) -> PlanConfig {
        PlanConfig {
            id: id.to_string(),
            display_name: format!("{id} plan"),
            price,
            billing_interval: BillingInterval::Month,
            remote_price_id: None,
        }
    }

    #[tokio::test]
    async fn second_run_is_unchanged_and_creates_nothing() {
        let fake = Arc::new(FakeCatalog::default());
        let sync = CatalogSynchronizer::new(fake.clone());
        let mut plans = vec![plan("pro", 29.0)];

        let first = sync.sync(&mut plans).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].action, SyncAction::Created);
        assert!(plans[0].remote_price_id.is_some());
        let creates_after_first = fake.creates();

        let second = sync.sync(&mut plans).await;
        assert_eq!(second[0].action, SyncAction::Unchanged);
        assert_eq!(fake.creates(), creates_after_first);
    }

    #[tokio::test]
    async fn price_change_creates_new_price_under_same_product() {
        let fake = Arc::new(FakeCatalog::default());
        let sync = CatalogSynchronizer::new(fake.clone());
        let mut plans = vec![plan("pro", 29.0)];

        sync.sync(&mut plans).await;
        let old_price = plans[0].remote_price_id.clone().unwrap();

        plans[0].price = 39.0;
        let results = sync.sync(&mut plans).await;
        assert_eq!(results[0].action, SyncAction::Created);

        let new_price = plans[0].remote_price_id.clone().unwrap();
        assert_ne!(old_price, new_price);
        // The product reference stays intact.
        assert_eq!(fake.products.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn free_plans_never_touch_the_catalog() {
        let fake = Arc::new(FakeCatalog::default());
        let sync = CatalogSynchronizer::new(fake.clone());
        let mut plans = vec![plan("free", 0.0)];

        let results = sync.sync(&mut plans).await;
        assert!(results.is_empty());
        assert_eq!(fake.creates(), 0);
        assert!(plans[0].remote_price_id.is_none());
    }

    #[tokio::test]
    async fn adopts_matching_existing_price() {
        let fake = Arc::new(FakeCatalog::default());
        let product = fake.create_product("pro plan", "pro").await.unwrap();
        fake.create_price(&product.id, 2900, BillingInterval::Month, "pro")
            .await
            .unwrap();
        let seeded_creates = fake.creates();

        let sync = CatalogSynchronizer::new(fake.clone());
        let mut plans = vec![plan("pro", 29.0)];
        let results = sync.sync(&mut plans).await;

        assert_eq!(results[0].action, SyncAction::Found);
        assert_eq!(fake.creates(), seeded_creates);
    }

    #[tokio::test]
    async fn display_name_drift_is_converged() {
        let fake = Arc::new(FakeCatalog::default());
        let product = fake.create_product("Old name", "pro").await.unwrap();
        fake.create_price(&product.id, 2900, BillingInterval::Month, "pro")
            .await
            .unwrap();

        let sync = CatalogSynchronizer::new(fake.clone());
        let mut plans = vec![plan("pro", 29.0)];
        sync.sync(&mut plans).await;

        assert_eq!(fake.products.lock().unwrap()[0].name, "pro plan");
    }

    #[tokio::test]
    async fn one_bad_plan_does_not_abort_the_batch() {
        let fake = Arc::new(FakeCatalog::default());
        // Two products tagged for the same plan make "pro" ambiguous.
        fake.create_product("Pro", "pro").await.unwrap();
        fake.create_product("Pro again", "pro").await.unwrap();

        let sync = CatalogSynchronizer::new(fake.clone());
        let mut plans = vec![plan("pro", 29.0), plan("team", 99.0)];
        let results = sync.sync(&mut plans).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].action, SyncAction::Error);
        assert!(results[0].error.is_some());
        assert!(plans[0].remote_price_id.is_none());
        assert_eq!(results[1].action, SyncAction::Created);
        assert!(plans[1].remote_price_id.is_some());
    }

    #[tokio::test]
    async fn name_drift_converges_even_when_price_is_unchanged() {
        let fake = Arc::new(FakeCatalog::default());
        let sync = CatalogSynchronizer::new(fake.clone());
        let mut plans = vec![plan("pro", 29.0)];
        sync.sync(&mut plans).await;

        // Rename the plan locally; the price itself is untouched.
        plans[0].display_name = "Pro (annual billing soon)".to_string();
        let results = sync.sync(&mut plans).await;

        assert_eq!(results[0].action, SyncAction::Unchanged);
        assert_eq!(
            fake.products.lock().unwrap()[0].name,
            "Pro (annual billing soon)"
        );
    }

    #[tokio::test]
    async fn stale_recorded_price_id_is_reresolved() {
        let fake = Arc::new(FakeCatalog::default());
        let sync = CatalogSynchronizer::new(fake.clone());

        let mut plans = vec![plan("pro", 29.0)];
        plans[0].remote_price_id = Some("price_gone".to_string());

        let results = sync.sync(&mut plans).await;
        assert_eq!(results[0].action, SyncAction::Created);
        assert_ne!(plans[0].remote_price_id.as_deref(), Some("price_gone"));
    }
}
