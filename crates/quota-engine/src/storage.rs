use crate::types::{
    ConsumeOutcome, ConsumeRequest, CounterKey, GuestUsageCounter, NewUser, UsageCounter,
    UserRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quota_common::{GuestFingerprint, QuotaError, Result, ServiceId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for accounts and usage counters.
///
/// `try_consume` and `roll_over` must be atomic per counter row: the quota
/// guarantees rely on no other writer interleaving between the period check
/// and the increment.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn register_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<UserRecord>;
    async fn get_user(&self, user_id: Uuid) -> Result<UserRecord>;
    async fn find_user(&self, email: &str, service: ServiceId) -> Result<Option<UserRecord>>;
    async fn set_blocked(&self, user_id: Uuid, blocked: bool) -> Result<UserRecord>;

    async fn load(&self, user_id: Uuid) -> Result<UsageCounter>;
    async fn save(&self, user_id: Uuid, counter: &UsageCounter) -> Result<()>;
    async fn load_guest(&self, fingerprint: &GuestFingerprint) -> Result<Option<GuestUsageCounter>>;
    async fn save_guest(&self, guest: &GuestUsageCounter) -> Result<()>;

    /// Reset the counter if it started before `period_start`, then return it.
    /// Missing guest rows read as zero and are not created.
    async fn roll_over(
        &self,
        key: &CounterKey,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UsageCounter>;

    /// Atomic roll-over plus compare-and-increment. Guest rows are created
    /// on first use.
    async fn try_consume(&self, key: &CounterKey, request: ConsumeRequest)
        -> Result<ConsumeOutcome>;

    /// Drop guest rows whose period started before `cutoff`.
    async fn purge_guests(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Roll the counter into the current period if needed. Returns whether it was reset.
pub(crate) fn apply_roll_over(
    counter: &mut UsageCounter,
    period_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if counter.reset_at < period_start {
        *counter = UsageCounter::zero(now);
        true
    } else {
        false
    }
}

pub(crate) fn apply_consume(counter: &mut UsageCounter, request: &ConsumeRequest) -> ConsumeOutcome {
    apply_roll_over(counter, request.period_start, request.now);
    match counter.used.checked_add(request.amount) {
        Some(total) if total <= request.limit => {
            counter.used = total;
            ConsumeOutcome::Consumed(*counter)
        }
        _ => ConsumeOutcome::Denied(*counter),
    }
}

// In-memory storage implementation for development/testing
#[derive(Default)]
pub struct InMemoryStore {
    users: Arc<RwLock<HashMap<Uuid, UserRecord>>>,
    guests: Arc<RwLock<HashMap<String, GuestUsageCounter>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn register_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<UserRecord> {
        let email = normalize_email(&user.email);
        let mut users = self.users.write().await;

        if users
            .values()
            .any(|u| u.email == email && u.service_type == user.service_type)
        {
            return Err(QuotaError::DuplicateUser {
                email,
                service: user.service_type,
            });
        }

        let record = UserRecord {
            id: Uuid::new_v4(),
            email,
            service_type: user.service_type,
            daily_usage: 0,
            last_quota_reset: now,
            is_blocked: false,
            is_admin: user.is_admin,
            created_at: now,
        };
        users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<UserRecord> {
        self.users
            .read()
            .await
            .get(&user_id)
            .cloned()
            .ok_or(QuotaError::UserNotFound(user_id))
    }

    async fn find_user(&self, email: &str, service: ServiceId) -> Result<Option<UserRecord>> {
        let email = normalize_email(email);
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email == email && u.service_type == service)
            .cloned())
    }

    async fn set_blocked(&self, user_id: Uuid, blocked: bool) -> Result<UserRecord> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&user_id)
            .ok_or(QuotaError::UserNotFound(user_id))?;
        user.is_blocked = blocked;
        Ok(user.clone())
    }

    async fn load(&self, user_id: Uuid) -> Result<UsageCounter> {
        self.get_user(user_id).await.map(|u| u.counter())
    }

    async fn save(&self, user_id: Uuid, counter: &UsageCounter) -> Result<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&user_id)
            .ok_or(QuotaError::UserNotFound(user_id))?;
        user.daily_usage = counter.used;
        user.last_quota_reset = counter.reset_at;
        Ok(())
    }

    async fn load_guest(&self, fingerprint: &GuestFingerprint) -> Result<Option<GuestUsageCounter>> {
        Ok(self.guests.read().await.get(&fingerprint.key()).cloned())
    }

    async fn save_guest(&self, guest: &GuestUsageCounter) -> Result<()> {
        self.guests
            .write()
            .await
            .insert(guest.fingerprint.key(), guest.clone());
        Ok(())
    }

    async fn roll_over(
        &self,
        key: &CounterKey,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UsageCounter> {
        match key {
            CounterKey::User(user_id) => {
                let mut users = self.users.write().await;
                let user = users
                    .get_mut(user_id)
                    .ok_or(QuotaError::UserNotFound(*user_id))?;
                let mut counter = user.counter();
                if apply_roll_over(&mut counter, period_start, now) {
                    user.daily_usage = counter.used;
                    user.last_quota_reset = counter.reset_at;
                }
                Ok(counter)
            }
            CounterKey::Guest(fingerprint) => {
                let mut guests = self.guests.write().await;
                match guests.get_mut(&fingerprint.key()) {
                    Some(guest) => {
                        apply_roll_over(&mut guest.counter, period_start, now);
                        Ok(guest.counter)
                    }
                    None => Ok(UsageCounter::zero(now)),
                }
            }
        }
    }

    async fn try_consume(
        &self,
        key: &CounterKey,
        request: ConsumeRequest,
    ) -> Result<ConsumeOutcome> {
        match key {
            CounterKey::User(user_id) => {
                let mut users = self.users.write().await;
                let user = users
                    .get_mut(user_id)
                    .ok_or(QuotaError::UserNotFound(*user_id))?;
                let mut counter = user.counter();
                let outcome = apply_consume(&mut counter, &request);
                user.daily_usage = counter.used;
                user.last_quota_reset = counter.reset_at;
                Ok(outcome)
            }
            CounterKey::Guest(fingerprint) => {
                let mut guests = self.guests.write().await;
                let guest = guests
                    .entry(fingerprint.key())
                    .or_insert_with(|| GuestUsageCounter {
                        fingerprint: fingerprint.clone(),
                        counter: UsageCounter::zero(request.now),
                    });
                Ok(apply_consume(&mut guest.counter, &request))
            }
        }
    }

    async fn purge_guests(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut guests = self.guests.write().await;
        let before = guests.len();
        guests.retain(|_, g| g.counter.reset_at >= cutoff);
        Ok((before - guests.len()) as u64)
    }
}
