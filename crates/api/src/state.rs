//! Application state
//!
//! Every handle is constructed once at startup and passed by reference;
//! there is no runtime-registerable global state.

use std::sync::Arc;

use corral_billing::BillingService;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub billing: Arc<BillingService>,
}
