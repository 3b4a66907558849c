//! Platform settings snapshot
//!
//! Settings are read once into an immutable [`SettingsSnapshot`] and served
//! from a cache until someone calls [`SettingsCache::invalidate`].

use async_trait::async_trait;
use quota_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const SIGNUP_ENABLED: &str = "signup_enabled";
pub const MAINTENANCE_MODE: &str = "maintenance_mode";
pub const ADMIN_ONLY: &str = "admin_only";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub signup_enabled: bool,
    pub maintenance_mode: bool,
    pub admin_only: bool,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            signup_enabled: true,
            maintenance_mode: false,
            admin_only: false,
        }
    }
}

impl SettingsSnapshot {
    /// Build a snapshot from raw key/value pairs. Missing keys keep their defaults.
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| pairs.get(key).map_or(default, |v| parse_flag(v));

        Self {
            signup_enabled: flag(SIGNUP_ENABLED, defaults.signup_enabled),
            maintenance_mode: flag(MAINTENANCE_MODE, defaults.maintenance_mode),
            admin_only: flag(ADMIN_ONLY, defaults.admin_only),
        }
    }

    /// Whether non-admin quota requests are turned away. Maintenance mode
    /// only stops consumption; reads keep working.
    pub fn gates(&self, consuming: bool) -> bool {
        self.admin_only || (consuming && self.maintenance_mode)
    }
}

pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// Where settings are stored.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, String>>;
}

#[derive(Default)]
pub struct InMemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl InMemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().await.insert(key.into(), value.into());
    }
}

#[async_trait]
impl SettingsSource for InMemorySettings {
    async fn load(&self) -> Result<HashMap<String, String>> {
        Ok(self.values.read().await.clone())
    }
}

pub struct SettingsCache {
    source: Arc<dyn SettingsSource>,
    cached: RwLock<Option<Arc<SettingsSnapshot>>>,
}

impl SettingsCache {
    pub fn new(source: Arc<dyn SettingsSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
        }
    }

    pub async fn snapshot(&self) -> Result<Arc<SettingsSnapshot>> {
        if let Some(snapshot) = self.cached.read().await.as_ref() {
            return Ok(snapshot.clone());
        }

        let mut cached = self.cached.write().await;
        // Another task may have filled the cache while we waited.
        if let Some(snapshot) = cached.as_ref() {
            return Ok(snapshot.clone());
        }

        let snapshot = Arc::new(SettingsSnapshot::from_pairs(&self.source.load().await?));
        debug!(?snapshot, "Loaded settings snapshot");
        *cached = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn invalidate(&self) {
        self.cached.write().await.take();
        info!("Settings cache invalidated");
    }
}
