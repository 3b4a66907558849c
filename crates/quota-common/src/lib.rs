// Shared domain types for the quota engine and its HTTP surface

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
pub use uuid;
use uuid::Uuid;

mod tenant;

pub use tenant::resolve_service;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error(
        "Quota exceeded: {} of {} used on the {} plan",
        .snapshot.used,
        .snapshot.limit,
        .snapshot.tier
    )]
    QuotaExceeded { snapshot: Box<QuotaSnapshot> },

    #[error("Subscription lookup failed: {0}")]
    SubscriptionLookupFailed(String),

    #[error("User not found: {0}")]
    UserNotFound(Uuid),

    #[error("User {email} is already registered on {service}")]
    DuplicateUser { email: String, service: ServiceId },

    #[error("User belongs to {user_service}, not {requested}")]
    TenantMismatch {
        user_service: ServiceId,
        requested: ServiceId,
    },

    #[error("User is blocked: {0}")]
    UserBlocked(Uuid),

    #[error("Consumption amount must be positive")]
    InvalidAmount,

    #[error("Plan catalog error: {0}")]
    Catalog(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, QuotaError>;

/// Tenant a request or user belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceId {
    #[default]
    Youtube,
    Zillow,
}

impl ServiceId {
    pub const ALL: [ServiceId; 2] = [ServiceId::Youtube, ServiceId::Zillow];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Youtube => "youtube",
            ServiceId::Zillow => "zillow",
        }
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "youtube" => Ok(ServiceId::Youtube),
            "zillow" => Ok(ServiceId::Zillow),
            other => Err(QuotaError::Config(format!("Unknown service: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Free,
    Plus,
    Pro,
}

impl TierName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Free => "free",
            TierName::Plus => "plus",
            TierName::Pro => "pro",
        }
    }
}

impl Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierName {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(TierName::Free),
            "plus" => Ok(TierName::Plus),
            "pro" => Ok(TierName::Pro),
            other => Err(QuotaError::Catalog(format!("Unknown tier: {other}"))),
        }
    }
}

/// Counting period of a plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Monthly,
}

impl Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Period::Daily => f.write_str("daily"),
            Period::Monthly => f.write_str("monthly"),
        }
    }
}

/// Anonymous visitor identity. Only the aggregated counter is ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuestFingerprint {
    pub ip_address: String,
    pub user_agent_hash: String,
    pub service: ServiceId,
}

impl GuestFingerprint {
    pub fn new(ip_address: impl Into<String>, user_agent: &str, service: ServiceId) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent_hash: format!("{:x}", Sha256::digest(user_agent.as_bytes())),
            service,
        }
    }

    /// Storage key for the guest counter row.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.service, self.ip_address, self.user_agent_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Principal {
    User { user_id: Uuid },
    Guest { fingerprint: GuestFingerprint },
}

impl Principal {
    pub fn user(user_id: Uuid) -> Self {
        Principal::User { user_id }
    }

    pub fn guest(fingerprint: GuestFingerprint) -> Self {
        Principal::Guest { fingerprint }
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::User { user_id } => write!(f, "user:{user_id}"),
            Principal::Guest { fingerprint } => write!(f, "guest:{}", fingerprint.key()),
        }
    }
}

/// Entitlement of a principal at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub tier: TierName,
    pub period: Period,
    pub period_start: DateTime<Utc>,
    pub next_reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_ends_at: Option<DateTime<Utc>>,
    /// Set when billing could not be reached and free-tier display semantics were used.
    #[serde(default)]
    pub degraded: bool,
}
