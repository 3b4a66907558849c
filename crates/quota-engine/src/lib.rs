// Quota engine - plan catalog, subscription resolution, lazy-reset usage metering
use chrono::{FixedOffset, Offset, Utc};
use std::time::Duration;

pub mod billing;
pub mod catalog;
pub mod clock;
mod manager;
pub mod reset;
pub mod settings;
pub mod sqlite;
mod storage;
pub mod subscription;
mod types;

pub use billing::{BillingError, BillingProvider, InMemoryBilling, SubscriptionRecord, SubscriptionStatus};
pub use catalog::{CatalogError, PlanCatalog, PlanTier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::QuotaManager;
pub use reset::{next_reset_at, period_window, PeriodWindow};
pub use settings::{InMemorySettings, SettingsCache, SettingsSnapshot, SettingsSource};
pub use sqlite::SqliteStore;
pub use storage::{InMemoryStore, UsageStore};
pub use subscription::{SubscriptionResolver, TierResolution};
pub use types::*;

pub const DEFAULT_BILLING_TIMEOUT: Duration = Duration::from_millis(1500);

/// Engine-wide knobs.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Offset that defines the server-local calendar day.
    pub utc_offset: FixedOffset,
    /// Upper bound on a single billing lookup.
    pub billing_timeout: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            billing_timeout: DEFAULT_BILLING_TIMEOUT,
        }
    }
}
