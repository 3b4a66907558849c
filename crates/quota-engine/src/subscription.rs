use crate::billing::{BillingError, BillingProvider, SubscriptionRecord};
use crate::catalog::PlanCatalog;
use chrono::{DateTime, Utc};
use quota_common::{QuotaError, Result, ServiceId, TierName};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tier a user is entitled to right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierResolution {
    pub tier: TierName,
    /// Set while a canceled subscription is still inside its paid period.
    pub grace_period_ends_at: Option<DateTime<Utc>>,
    /// Subscription start, anchors monthly resets. `None` on the free tier.
    pub anchor: Option<DateTime<Utc>>,
}

impl TierResolution {
    pub fn free() -> Self {
        Self {
            tier: TierName::Free,
            grace_period_ends_at: None,
            anchor: None,
        }
    }
}

pub struct SubscriptionResolver {
    billing: Arc<dyn BillingProvider>,
    catalog: Arc<PlanCatalog>,
    timeout: Duration,
}

impl SubscriptionResolver {
    pub fn new(
        billing: Arc<dyn BillingProvider>,
        catalog: Arc<PlanCatalog>,
        timeout: Duration,
    ) -> Self {
        Self {
            billing,
            catalog,
            timeout,
        }
    }

    /// Resolve the user's tier for `service`.
    ///
    /// Fails with [`QuotaError::SubscriptionLookupFailed`] when billing errors
    /// or does not answer within the configured timeout. Callers decide
    /// whether that degrades or blocks.
    pub async fn current_tier(
        &self,
        user_id: Uuid,
        service: ServiceId,
        now: DateTime<Utc>,
    ) -> Result<TierResolution> {
        let lookup = self.billing.subscription(user_id, service);
        let record = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                warn!(user_id = %user_id, service = %service, error = %e, "Subscription lookup failed");
                return Err(QuotaError::SubscriptionLookupFailed(e.to_string()));
            }
            Err(_) => {
                let e = BillingError::Timeout(self.timeout.as_millis() as u64);
                warn!(user_id = %user_id, service = %service, "Subscription lookup timed out");
                return Err(QuotaError::SubscriptionLookupFailed(e.to_string()));
            }
        };

        let resolution = resolve_record(&self.catalog, service, record.as_ref(), now);
        debug!(
            user_id = %user_id,
            service = %service,
            tier = %resolution.tier,
            grace = resolution.grace_period_ends_at.is_some(),
            "Resolved subscription tier"
        );
        Ok(resolution)
    }
}

/// Map a billing record to an entitlement.
///
/// A canceled subscription keeps its tier until `ends_at`; afterwards, or
/// when no valid subscription exists, the user is on the free tier.
pub fn resolve_record(
    catalog: &PlanCatalog,
    service: ServiceId,
    record: Option<&SubscriptionRecord>,
    now: DateTime<Utc>,
) -> TierResolution {
    let Some(record) = record.filter(|r| r.service == service) else {
        return TierResolution::free();
    };

    let grace_period_ends_at = match record.ends_at {
        Some(ends_at) if ends_at > now => Some(ends_at),
        Some(_) => return TierResolution::free(),
        None if record.status.is_active() => None,
        None => return TierResolution::free(),
    };

    TierResolution {
        tier: catalog.tier_for_price(service, &record.price_id),
        grace_period_ends_at,
        anchor: Some(record.started_at),
    }
}
