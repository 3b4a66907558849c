// Quota gateway - HTTP surface for quota display, consumption, and operator actions
use axum::{
    routing::{get, post, put},
    Router,
};
use quota_common::Result;
use quota_engine::{
    BillingProvider, InMemoryBilling, InMemorySettings, InMemoryStore, PlanCatalog, QuotaManager,
    SettingsCache, SqliteStore, SystemClock, UsageStore,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub mod config;
pub mod error;
pub mod handlers;
pub mod http_billing;
pub mod principal;

pub use config::GatewayConfig;
pub use http_billing::HttpBillingProvider;

#[derive(Clone)]
pub struct AppState {
    pub quota: Arc<QuotaManager>,
    pub settings: Arc<SettingsCache>,
    pub settings_store: Arc<InMemorySettings>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub async fn new(
        quota: Arc<QuotaManager>,
        settings_store: Arc<InMemorySettings>,
        config: GatewayConfig,
    ) -> Self {
        for (key, value) in &config.initial_settings {
            settings_store.set(key.clone(), value.clone()).await;
        }
        let settings = Arc::new(SettingsCache::new(settings_store.clone()));

        Self {
            quota,
            settings,
            settings_store,
            config: Arc::new(config),
        }
    }

    /// Wire the engine from configuration.
    pub async fn from_config(config: GatewayConfig) -> Result<Self> {
        let catalog = match &config.plan_catalog {
            Some(path) => {
                info!("Loading plan catalog from {}", path.display());
                PlanCatalog::from_path(path)?
            }
            None => PlanCatalog::builtin(),
        };

        let store: Arc<dyn UsageStore> = match &config.database_url {
            Some(url) => Arc::new(SqliteStore::connect(url).await?),
            None => {
                info!("No QUOTA_DATABASE_URL set, usage is kept in memory");
                Arc::new(InMemoryStore::new())
            }
        };

        let billing: Arc<dyn BillingProvider> = match &config.billing_url {
            Some(url) => {
                info!("Resolving subscriptions via {}", url);
                Arc::new(HttpBillingProvider::new(url.clone()))
            }
            None => Arc::new(InMemoryBilling::new()),
        };

        let quota = Arc::new(QuotaManager::new(
            store,
            Arc::new(catalog),
            billing,
            Arc::new(SystemClock),
            config.quota_config(),
        ));

        Ok(Self::new(quota, Arc::new(InMemorySettings::new()), config).await)
    }
}

pub fn create_app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/users/:id/reset", post(handlers::admin_reset_user))
        .route("/users/:id/block", post(handlers::admin_block_user))
        .route("/guests/purge", post(handlers::admin_purge_guests))
        .route("/settings", put(handlers::admin_update_setting))
        .route("/settings/invalidate", post(handlers::admin_invalidate_settings));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/plans", get(handlers::list_plans))
        .route("/api/v1/users", post(handlers::register_user))
        .route("/api/v1/quota", get(handlers::get_quota))
        .route("/api/v1/quota/consume", post(handlers::consume_quota))
        .route("/api/v1/guest/usage", get(handlers::guest_usage))
        .route("/api/v1/webhooks/subscription", post(handlers::subscription_webhook))
        .nest("/api/v1/admin", admin)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests;
