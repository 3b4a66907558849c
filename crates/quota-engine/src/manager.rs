use crate::catalog::{PlanCatalog, PlanTier};
use crate::clock::Clock;
use crate::reset::{period_window, PeriodWindow};
use crate::storage::UsageStore;
use crate::subscription::{SubscriptionResolver, TierResolution};
use crate::types::{
    ConsumeOutcome, ConsumeRequest, CounterKey, GuestUsageCounter, NewUser, SubscriptionEvent,
    UsageCounter, UserRecord,
};
use crate::QuotaConfig;
use chrono::{DateTime, Utc};
use quota_common::{
    GuestFingerprint, Period, Principal, QuotaError, QuotaSnapshot, Result, ServiceId, TierName,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a billing failure is handled for the current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    /// Show free-tier numbers and flag the snapshot as degraded.
    Display,
    /// Refuse: an outage must never hand out quota.
    Consume,
}

/// Everything needed to meter one principal for one request.
struct Entitlement {
    key: CounterKey,
    tier: TierName,
    limit: u64,
    period: Period,
    window: PeriodWindow,
    grace_period_ends_at: Option<DateTime<Utc>>,
    degraded: bool,
}

impl Entitlement {
    fn snapshot(&self, used: u64) -> QuotaSnapshot {
        QuotaSnapshot {
            used,
            limit: self.limit,
            remaining: self.limit.saturating_sub(used),
            tier: self.tier,
            period: self.period,
            period_start: self.window.start,
            next_reset_at: self.window.next_reset,
            grace_period_ends_at: self.grace_period_ends_at,
            degraded: self.degraded,
        }
    }
}

pub struct QuotaManager {
    store: Arc<dyn UsageStore>,
    catalog: Arc<PlanCatalog>,
    subscriptions: SubscriptionResolver,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
}

impl QuotaManager {
    pub fn new(
        store: Arc<dyn UsageStore>,
        catalog: Arc<PlanCatalog>,
        billing: Arc<dyn crate::billing::BillingProvider>,
        clock: Arc<dyn Clock>,
        config: QuotaConfig,
    ) -> Self {
        let subscriptions =
            SubscriptionResolver::new(billing, catalog.clone(), config.billing_timeout);
        Self {
            store,
            catalog,
            subscriptions,
            clock,
            config,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    // ====================
    // Quota operations
    // ====================

    /// Current entitlement of `principal` on `service`.
    ///
    /// Rolls a stale counter into the current period (lazy reset). Repeated
    /// calls inside one period return the same snapshot and write nothing.
    /// Billing failures degrade to free-tier numbers instead of failing.
    pub async fn check_quota(
        &self,
        principal: &Principal,
        service: ServiceId,
    ) -> Result<QuotaSnapshot> {
        let now = self.clock.now();
        let entitlement = self
            .entitlement(principal, service, Lookup::Display, now)
            .await?;

        let used = if entitlement.degraded {
            // Degraded numbers come from a guessed tier and window. Resetting
            // the stored counter on their account could wipe real usage.
            let counter = match &entitlement.key {
                CounterKey::User(user_id) => self.store.load(*user_id).await?,
                CounterKey::Guest(_) => UsageCounter::zero(now),
            };
            if entitlement.window.is_stale(counter.reset_at) {
                0
            } else {
                counter.used
            }
        } else {
            self.store
                .roll_over(&entitlement.key, entitlement.window.start, now)
                .await?
                .used
        };

        let snapshot = entitlement.snapshot(used);
        debug!(
            principal = %principal,
            service = %service,
            used = snapshot.used,
            limit = snapshot.limit,
            tier = %snapshot.tier,
            degraded = snapshot.degraded,
            "Checked quota"
        );
        Ok(snapshot)
    }

    /// Record `amount` units of usage, all or nothing.
    ///
    /// The store applies the lazy reset and the conditional increment as one
    /// atomic step, so concurrent calls can never push usage past the limit.
    /// Billing and storage failures fail the call.
    pub async fn consume(
        &self,
        principal: &Principal,
        service: ServiceId,
        amount: u64,
    ) -> Result<QuotaSnapshot> {
        if amount == 0 {
            return Err(QuotaError::InvalidAmount);
        }

        let now = self.clock.now();
        let entitlement = self
            .entitlement(principal, service, Lookup::Consume, now)
            .await?;

        let request = ConsumeRequest {
            amount,
            limit: entitlement.limit,
            period_start: entitlement.window.start,
            now,
        };

        match self.store.try_consume(&entitlement.key, request).await? {
            ConsumeOutcome::Consumed(counter) => {
                debug!(
                    principal = %principal,
                    service = %service,
                    amount,
                    used = counter.used,
                    limit = entitlement.limit,
                    "Consumed quota"
                );
                Ok(entitlement.snapshot(counter.used))
            }
            ConsumeOutcome::Denied(counter) => {
                info!(
                    principal = %principal,
                    service = %service,
                    amount,
                    used = counter.used,
                    limit = entitlement.limit,
                    "Quota exceeded"
                );
                Err(QuotaError::QuotaExceeded {
                    snapshot: Box::new(entitlement.snapshot(counter.used)),
                })
            }
        }
    }

    /// Administrative override: usage back to zero with the period starting now.
    pub async fn reset_to_zero(&self, principal: &Principal, service: ServiceId) -> Result<()> {
        let now = self.clock.now();
        match principal {
            Principal::User { user_id } => {
                self.store.save(*user_id, &UsageCounter::zero(now)).await?;
            }
            Principal::Guest { fingerprint } => {
                self.store
                    .save_guest(&GuestUsageCounter {
                        fingerprint: fingerprint.clone(),
                        counter: UsageCounter::zero(now),
                    })
                    .await?;
            }
        }

        info!(principal = %principal, service = %service, "Usage reset to zero");
        Ok(())
    }

    /// Units a guest has used today. Applies the guest's own daily reset.
    pub async fn guest_usage(
        &self,
        fingerprint: &GuestFingerprint,
        service: ServiceId,
    ) -> Result<u64> {
        ensure_tenant(fingerprint.service, service)?;

        let now = self.clock.now();
        let window = self.window(Period::Daily, None, now)?;
        let counter = self
            .store
            .roll_over(&CounterKey::Guest(fingerprint.clone()), window.start, now)
            .await?;

        debug!(guest = %fingerprint.key(), used = counter.used, "Read guest usage");
        Ok(counter.used)
    }

    /// Billing webhook hook. Plan changes clear accumulated usage.
    ///
    /// Returns whether the event caused a reset.
    pub async fn on_subscription_changed(
        &self,
        user_id: Uuid,
        event: SubscriptionEvent,
    ) -> Result<bool> {
        if !event.resets_usage() {
            debug!(user_id = %user_id, ?event, "Ignoring subscription event");
            return Ok(false);
        }

        let user = self.store.get_user(user_id).await?;
        self.reset_to_zero(&Principal::user(user.id), user.service_type)
            .await?;
        info!(user_id = %user_id, ?event, "Subscription changed, usage cleared");
        Ok(true)
    }

    /// Drop guest counters whose period started more than `retention` ago.
    pub async fn purge_guests(&self, retention: chrono::Duration) -> Result<u64> {
        let cutoff = self.clock.now() - retention;
        let purged = self.store.purge_guests(cutoff).await?;
        info!(purged, cutoff = %cutoff, "Purged guest counters");
        Ok(purged)
    }

    // ====================
    // Accounts
    // ====================

    pub async fn register_user(&self, user: NewUser) -> Result<UserRecord> {
        let record = self.store.register_user(user, self.clock.now()).await?;
        info!(
            user_id = %record.id,
            service = %record.service_type,
            admin = record.is_admin,
            "Registered user"
        );
        Ok(record)
    }

    pub async fn user(&self, user_id: Uuid) -> Result<UserRecord> {
        self.store.get_user(user_id).await
    }

    pub async fn set_blocked(&self, user_id: Uuid, blocked: bool) -> Result<UserRecord> {
        let record = self.store.set_blocked(user_id, blocked).await?;
        info!(user_id = %user_id, blocked, "Updated block flag");
        Ok(record)
    }

    // ====================
    // Helpers
    // ====================

    async fn entitlement(
        &self,
        principal: &Principal,
        service: ServiceId,
        lookup: Lookup,
        now: DateTime<Utc>,
    ) -> Result<Entitlement> {
        match principal {
            Principal::User { user_id } => {
                let user = self.store.get_user(*user_id).await?;
                ensure_tenant(user.service_type, service)?;
                if lookup == Lookup::Consume && user.is_blocked {
                    return Err(QuotaError::UserBlocked(user.id));
                }

                let (resolution, degraded) = match self
                    .subscriptions
                    .current_tier(user.id, service, now)
                    .await
                {
                    Ok(resolution) => (resolution, false),
                    Err(QuotaError::SubscriptionLookupFailed(reason))
                        if lookup == Lookup::Display =>
                    {
                        warn!(
                            user_id = %user.id,
                            service = %service,
                            reason = %reason,
                            "Billing unavailable, showing free tier"
                        );
                        (TierResolution::free(), true)
                    }
                    Err(e) => return Err(e),
                };

                let plan = self.catalog.tier(service, resolution.tier)?;
                self.build(
                    CounterKey::User(user.id),
                    plan,
                    &resolution,
                    degraded,
                    now,
                )
            }
            Principal::Guest { fingerprint } => {
                ensure_tenant(fingerprint.service, service)?;
                let plan = self.catalog.tier(service, TierName::Free)?;
                self.build(
                    CounterKey::Guest(fingerprint.clone()),
                    plan,
                    &TierResolution::free(),
                    false,
                    now,
                )
            }
        }
    }

    fn build(
        &self,
        key: CounterKey,
        plan: &PlanTier,
        resolution: &TierResolution,
        degraded: bool,
        now: DateTime<Utc>,
    ) -> Result<Entitlement> {
        // Monthly plans without a subscription anchor reset daily.
        let period = match (plan.period, resolution.anchor) {
            (Period::Monthly, None) => Period::Daily,
            (period, _) => period,
        };
        let window = self.window(period, resolution.anchor, now)?;

        Ok(Entitlement {
            key,
            tier: plan.tier,
            limit: plan.limit,
            period,
            window,
            grace_period_ends_at: resolution.grace_period_ends_at,
            degraded,
        })
    }

    fn window(
        &self,
        period: Period,
        anchor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<PeriodWindow> {
        period_window(period, anchor, now, self.config.utc_offset).ok_or_else(|| {
            QuotaError::Config(format!("no {period} reset boundary representable for {now}"))
        })
    }
}

fn ensure_tenant(owner: ServiceId, requested: ServiceId) -> Result<()> {
    if owner == requested {
        Ok(())
    } else {
        Err(QuotaError::TenantMismatch {
            user_service: owner,
            requested,
        })
    }
}
