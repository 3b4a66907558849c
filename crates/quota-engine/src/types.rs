use chrono::{DateTime, Utc};
use quota_common::{GuestFingerprint, ServiceId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registered account. Belongs to exactly one tenant for its whole life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub service_type: ServiceId,
    pub daily_usage: u64,
    pub last_quota_reset: DateTime<Utc>,
    pub is_blocked: bool,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn counter(&self) -> UsageCounter {
        UsageCounter {
            used: self.daily_usage,
            reset_at: self.last_quota_reset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub service_type: ServiceId,
    pub is_admin: bool,
}

impl NewUser {
    pub fn new(email: impl Into<String>, service_type: ServiceId) -> Self {
        Self {
            email: email.into(),
            service_type,
            is_admin: false,
        }
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}

/// Usage within the current counting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub used: u64,
    /// Start of the period this count belongs to.
    pub reset_at: DateTime<Utc>,
}

impl UsageCounter {
    pub fn zero(now: DateTime<Utc>) -> Self {
        Self {
            used: 0,
            reset_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestUsageCounter {
    pub fingerprint: GuestFingerprint,
    pub counter: UsageCounter,
}

/// Row a counter operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterKey {
    User(Uuid),
    Guest(GuestFingerprint),
}

/// Conditional increment evaluated atomically by the store.
///
/// A row whose `reset_at` is before `period_start` is first reset to zero at
/// `now`. The increment is applied only if `used + amount <= limit`.
#[derive(Debug, Clone, Copy)]
pub struct ConsumeRequest {
    pub amount: u64,
    pub limit: u64,
    pub period_start: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed(UsageCounter),
    Denied(UsageCounter),
}

/// Billing event forwarded by the subscription webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEvent {
    Created,
    Updated,
    Deleted,
    #[serde(other)]
    Other,
}

impl SubscriptionEvent {
    /// Tier changes clear accumulated usage.
    pub fn resets_usage(&self) -> bool {
        matches!(self, SubscriptionEvent::Created | SubscriptionEvent::Updated)
    }
}
