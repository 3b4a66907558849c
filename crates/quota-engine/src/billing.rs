//! Billing collaborator abstraction
//!
//! The engine never talks to a payment provider directly. It asks a
//! [`BillingProvider`] for the subscription on record for `(user, service)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quota_common::ServiceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Billing service unavailable: {0}")]
    Unavailable(String),
    #[error("Billing lookup timed out after {0}ms")]
    Timeout(u64),
    #[error("Invalid billing response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    Canceled,
}

impl SubscriptionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

/// Subscription as reported by billing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub service: ServiceId,
    pub price_id: String,
    pub status: SubscriptionStatus,
    /// Start of the subscription. Its day-of-month anchors monthly resets.
    pub started_at: DateTime<Utc>,
    /// End of the paid period once the subscription has been canceled.
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn subscription(
        &self,
        user_id: Uuid,
        service: ServiceId,
    ) -> Result<Option<SubscriptionRecord>, BillingError>;
}

/// In-process billing state for development and tests.
#[derive(Default)]
pub struct InMemoryBilling {
    subscriptions: RwLock<HashMap<(Uuid, ServiceId), SubscriptionRecord>>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, user_id: Uuid, record: SubscriptionRecord) {
        self.subscriptions
            .write()
            .await
            .insert((user_id, record.service), record);
    }

    /// Make every lookup fail as if billing were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Delay every lookup, e.g. to exercise lookup timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl BillingProvider for InMemoryBilling {
    async fn subscription(
        &self,
        user_id: Uuid,
        service: ServiceId,
    ) -> Result<Option<SubscriptionRecord>, BillingError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.unavailable.load(Ordering::Relaxed) {
            return Err(BillingError::Unavailable("billing marked down".to_string()));
        }

        Ok(self
            .subscriptions
            .read()
            .await
            .get(&(user_id, service))
            .cloned())
    }
}
