//! SQLite backed usage store.
//!
//! Counter updates are single conditional `UPDATE` statements, so concurrent
//! requests on any number of connections cannot push a counter past its limit.

use crate::storage::{normalize_email, UsageStore};
use crate::types::{
    ConsumeOutcome, ConsumeRequest, CounterKey, GuestUsageCounter, NewUser, UsageCounter,
    UserRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quota_common::{GuestFingerprint, QuotaError, Result, ServiceId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const USER_COLUMNS: &str =
    "id, email, service_type, daily_usage, last_quota_reset, is_blocked, is_admin, created_at";

/// Column names of one counter-bearing table.
struct CounterTable {
    table: &'static str,
    key: &'static str,
    used: &'static str,
    reset_at: &'static str,
}

const USER_COUNTERS: CounterTable = CounterTable {
    table: "users",
    key: "id",
    used: "daily_usage",
    reset_at: "last_quota_reset",
};

const GUEST_COUNTERS: CounterTable = CounterTable {
    table: "guest_usage",
    key: "fingerprint",
    used: "used",
    reset_at: "reset_at",
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(store_err)?;

        Self::with_pool(pool).await
    }

    /// Connect with a `sqlite:` URL. In-memory databases are pinned to one
    /// long-lived connection so every query sees the same database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(store_err)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let mut pool_options = SqlitePoolOptions::new().max_connections(8);
        if url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(store_err)?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        info!("SQLite usage store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                service_type TEXT NOT NULL,
                daily_usage INTEGER NOT NULL DEFAULT 0,
                last_quota_reset INTEGER NOT NULL,
                is_blocked INTEGER NOT NULL DEFAULT 0,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(email, service_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guest_usage (
                fingerprint TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                user_agent_hash TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                reset_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_guest_usage_reset_at ON guest_usage(reset_at)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(())
    }

    async fn ensure_guest_row(&self, fingerprint: &GuestFingerprint, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO guest_usage (fingerprint, service, ip_address, user_agent_hash, used, reset_at)
            VALUES (?, ?, ?, ?, 0, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(fingerprint.key())
        .bind(fingerprint.service.as_str())
        .bind(&fingerprint.ip_address)
        .bind(&fingerprint.user_agent_hash)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Conditional reset of one counter row. Returns whether a row was reset.
    async fn reset_if_stale(
        &self,
        table: &CounterTable,
        key: &str,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {t} SET {u} = 0, {r} = ? WHERE {k} = ? AND {r} < ?",
            t = table.table,
            u = table.used,
            r = table.reset_at,
            k = table.key,
        );
        let result = sqlx::query(&sql)
            .bind(now.timestamp_millis())
            .bind(key)
            .bind(period_start.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn read_counter(&self, table: &CounterTable, key: &str) -> Result<Option<UsageCounter>> {
        let sql = format!(
            "SELECT {u} AS used, {r} AS reset_at FROM {t} WHERE {k} = ?",
            t = table.table,
            u = table.used,
            r = table.reset_at,
            k = table.key,
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|row| counter_from_row(&row)).transpose()
    }

    async fn write_counter(&self, table: &CounterTable, key: &str, counter: &UsageCounter) -> Result<u64> {
        let sql = format!(
            "UPDATE {t} SET {u} = ?, {r} = ? WHERE {k} = ?",
            t = table.table,
            u = table.used,
            r = table.reset_at,
            k = table.key,
        );
        let result = sqlx::query(&sql)
            .bind(to_i64(counter.used)?)
            .bind(counter.reset_at.timestamp_millis())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn denied(
        &self,
        table: &CounterTable,
        row_key: &str,
        key: &CounterKey,
    ) -> Result<ConsumeOutcome> {
        match (self.read_counter(table, row_key).await?, key) {
            (Some(counter), _) => Ok(ConsumeOutcome::Denied(counter)),
            (None, CounterKey::User(user_id)) => Err(QuotaError::UserNotFound(*user_id)),
            (None, CounterKey::Guest(_)) => Err(QuotaError::Store(format!(
                "guest counter {row_key} vanished during consume"
            ))),
        }
    }

    fn locate(key: &CounterKey) -> (&'static CounterTable, String) {
        match key {
            CounterKey::User(user_id) => (&USER_COUNTERS, user_id.to_string()),
            CounterKey::Guest(fingerprint) => (&GUEST_COUNTERS, fingerprint.key()),
        }
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn register_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<UserRecord> {
        let email = normalize_email(&user.email);
        let id = Uuid::new_v4();

        let sql = format!(
            "INSERT INTO users ({USER_COLUMNS}) VALUES (?, ?, ?, 0, ?, 0, ?, ?) RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(&email)
            .bind(user.service_type.as_str())
            .bind(now.timestamp_millis())
            .bind(user.is_admin)
            .bind(now.timestamp_millis())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => QuotaError::DuplicateUser {
                    email: email.clone(),
                    service: user.service_type,
                },
                other => store_err(other),
            })?;

        user_from_row(&row)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<UserRecord> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or(QuotaError::UserNotFound(user_id))?;
        user_from_row(&row)
    }

    async fn find_user(&self, email: &str, service: ServiceId) -> Result<Option<UserRecord>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ? AND service_type = ?");
        let row = sqlx::query(&sql)
            .bind(normalize_email(email))
            .bind(service.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|row| user_from_row(&row)).transpose()
    }

    async fn set_blocked(&self, user_id: Uuid, blocked: bool) -> Result<UserRecord> {
        let sql = format!("UPDATE users SET is_blocked = ? WHERE id = ? RETURNING {USER_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(blocked)
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or(QuotaError::UserNotFound(user_id))?;
        user_from_row(&row)
    }

    async fn load(&self, user_id: Uuid) -> Result<UsageCounter> {
        self.read_counter(&USER_COUNTERS, &user_id.to_string())
            .await?
            .ok_or(QuotaError::UserNotFound(user_id))
    }

    async fn save(&self, user_id: Uuid, counter: &UsageCounter) -> Result<()> {
        match self
            .write_counter(&USER_COUNTERS, &user_id.to_string(), counter)
            .await?
        {
            0 => Err(QuotaError::UserNotFound(user_id)),
            _ => Ok(()),
        }
    }

    async fn load_guest(&self, fingerprint: &GuestFingerprint) -> Result<Option<GuestUsageCounter>> {
        Ok(self
            .read_counter(&GUEST_COUNTERS, &fingerprint.key())
            .await?
            .map(|counter| GuestUsageCounter {
                fingerprint: fingerprint.clone(),
                counter,
            }))
    }

    async fn save_guest(&self, guest: &GuestUsageCounter) -> Result<()> {
        self.ensure_guest_row(&guest.fingerprint, guest.counter.reset_at)
            .await?;
        self.write_counter(&GUEST_COUNTERS, &guest.fingerprint.key(), &guest.counter)
            .await?;
        Ok(())
    }

    async fn roll_over(
        &self,
        key: &CounterKey,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UsageCounter> {
        let (table, row_key) = Self::locate(key);
        self.reset_if_stale(table, &row_key, period_start, now).await?;

        match (self.read_counter(table, &row_key).await?, key) {
            (Some(counter), _) => Ok(counter),
            (None, CounterKey::User(user_id)) => Err(QuotaError::UserNotFound(*user_id)),
            (None, CounterKey::Guest(_)) => Ok(UsageCounter::zero(now)),
        }
    }

    async fn try_consume(
        &self,
        key: &CounterKey,
        request: ConsumeRequest,
    ) -> Result<ConsumeOutcome> {
        if let CounterKey::Guest(fingerprint) = key {
            self.ensure_guest_row(fingerprint, request.now).await?;
        }

        let (table, row_key) = Self::locate(key);
        self.reset_if_stale(table, &row_key, request.period_start, request.now)
            .await?;

        // Can never fit, and may not be representable as an SQLite integer.
        if request.amount > request.limit {
            return self.denied(table, &row_key, key).await;
        }

        // The period guard keeps a racing roll-over from being counted
        // against the previous period.
        let sql = format!(
            "UPDATE {t} SET {u} = {u} + ? \
             WHERE {k} = ? AND {r} >= ? AND {u} + ? <= ? \
             RETURNING {u} AS used, {r} AS reset_at",
            t = table.table,
            u = table.used,
            r = table.reset_at,
            k = table.key,
        );
        let amount = to_i64(request.amount)?;
        let row = sqlx::query(&sql)
            .bind(amount)
            .bind(&row_key)
            .bind(request.period_start.timestamp_millis())
            .bind(amount)
            .bind(to_i64(request.limit)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => Ok(ConsumeOutcome::Consumed(counter_from_row(&row)?)),
            None => self.denied(table, &row_key, key).await,
        }
    }

    async fn purge_guests(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM guest_usage WHERE reset_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}

fn store_err(err: sqlx::Error) -> QuotaError {
    QuotaError::Store(err.to_string())
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| QuotaError::Store(format!("value {value} out of range")))
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| QuotaError::Store(format!("timestamp {millis} out of range")))
}

fn counter_from_row(row: &SqliteRow) -> Result<UsageCounter> {
    let used: i64 = row.try_get("used").map_err(store_err)?;
    let reset_at: i64 = row.try_get("reset_at").map_err(store_err)?;
    Ok(UsageCounter {
        used: used.max(0) as u64,
        reset_at: millis_to_datetime(reset_at)?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<UserRecord> {
    let id: String = row.try_get("id").map_err(store_err)?;
    let service_type: String = row.try_get("service_type").map_err(store_err)?;
    let daily_usage: i64 = row.try_get("daily_usage").map_err(store_err)?;

    Ok(UserRecord {
        id: Uuid::parse_str(&id).map_err(|e| QuotaError::Store(e.to_string()))?,
        email: row.try_get("email").map_err(store_err)?,
        service_type: service_type.parse()?,
        daily_usage: daily_usage.max(0) as u64,
        last_quota_reset: millis_to_datetime(row.try_get("last_quota_reset").map_err(store_err)?)?,
        is_blocked: row.try_get("is_blocked").map_err(store_err)?,
        is_admin: row.try_get("is_admin").map_err(store_err)?,
        created_at: millis_to_datetime(row.try_get("created_at").map_err(store_err)?)?,
    })
}
