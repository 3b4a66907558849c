use chrono::FixedOffset;
use quota_common::{QuotaError, Result};
use quota_engine::settings::{ADMIN_ONLY, MAINTENANCE_MODE, SIGNUP_ENABLED};
use quota_engine::QuotaConfig;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Gateway settings, read from `QUOTA_*` environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// `sqlite:` URL. Unset keeps all state in memory.
    pub database_url: Option<String>,
    /// Plan catalog YAML. Unset uses the built-in plans.
    pub plan_catalog: Option<PathBuf>,
    /// Billing service base URL. Unset uses in-process billing.
    pub billing_url: Option<String>,
    pub billing_timeout: Duration,
    pub utc_offset: FixedOffset,
    /// Shared secret for admin and webhook routes. Unset disables them.
    pub admin_token: Option<String>,
    pub guest_retention: chrono::Duration,
    /// Proxies whose `X-Forwarded-For` header is believed.
    pub trusted_proxies: Vec<IpAddr>,
    /// Initial platform settings, keyed like the settings store.
    pub initial_settings: Vec<(String, String)>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let utc_offset = match non_empty("QUOTA_UTC_OFFSET") {
            Some(raw) => raw.trim().parse::<FixedOffset>().map_err(|e| {
                QuotaError::Config(format!("QUOTA_UTC_OFFSET {raw:?} is not an offset: {e}"))
            })?,
            None => FixedOffset::east_opt(0)
                .ok_or_else(|| QuotaError::Config("UTC offset out of range".to_string()))?,
        };

        let trusted_proxies = non_empty("QUOTA_TRUSTED_PROXIES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(|entry| {
                        entry.parse::<IpAddr>().map_err(|e| {
                            QuotaError::Config(format!(
                                "QUOTA_TRUSTED_PROXIES entry {entry:?} is not an IP address: {e}"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let initial_settings = [
            ("QUOTA_SIGNUP_ENABLED", SIGNUP_ENABLED),
            ("QUOTA_MAINTENANCE_MODE", MAINTENANCE_MODE),
            ("QUOTA_ADMIN_ONLY", ADMIN_ONLY),
        ]
        .into_iter()
        .filter_map(|(var, key)| non_empty(var).map(|value| (key.to_string(), value)))
        .collect();

        Ok(Self {
            host: non_empty("QUOTA_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: non_empty("QUOTA_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            database_url: non_empty("QUOTA_DATABASE_URL"),
            plan_catalog: non_empty("QUOTA_PLAN_CATALOG").map(PathBuf::from),
            billing_url: non_empty("QUOTA_BILLING_URL"),
            billing_timeout: Duration::from_millis(
                non_empty("QUOTA_BILLING_TIMEOUT_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1500),
            ),
            utc_offset,
            admin_token: non_empty("QUOTA_ADMIN_TOKEN"),
            guest_retention: chrono::Duration::hours(
                non_empty("QUOTA_GUEST_RETENTION_HOURS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(48),
            ),
            trusted_proxies,
            initial_settings,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn quota_config(&self) -> QuotaConfig {
        QuotaConfig {
            utc_offset: self.utc_offset,
            billing_timeout: self.billing_timeout,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let quota = QuotaConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_url: None,
            plan_catalog: None,
            billing_url: None,
            billing_timeout: quota.billing_timeout,
            utc_offset: quota.utc_offset,
            admin_token: None,
            guest_retention: chrono::Duration::hours(48),
            trusted_proxies: Vec::new(),
            initial_settings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<GatewayConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.billing_timeout, Duration::from_millis(1500));
        assert_eq!(config.utc_offset.local_minus_utc(), 0);
        assert_eq!(config.guest_retention, chrono::Duration::hours(48));
        assert!(config.database_url.is_none());
        assert!(config.admin_token.is_none());
        assert!(config.initial_settings.is_empty());
        assert!(config.trusted_proxies.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("QUOTA_PORT", "9090"),
            ("QUOTA_UTC_OFFSET", "+02:00"),
            ("QUOTA_ADMIN_TOKEN", "s3cret"),
            ("QUOTA_DATABASE_URL", "sqlite://quota.db"),
            ("QUOTA_MAINTENANCE_MODE", "on"),
            ("QUOTA_TRUSTED_PROXIES", "10.0.0.1, ::1"),
        ])
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.utc_offset.local_minus_utc(), 2 * 3600);
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.database_url.as_deref(), Some("sqlite://quota.db"));
        assert_eq!(
            config.trusted_proxies,
            vec!["10.0.0.1".parse::<IpAddr>().unwrap(), "::1".parse().unwrap()]
        );
        assert_eq!(
            config.initial_settings,
            vec![(MAINTENANCE_MODE.to_string(), "on".to_string())]
        );
    }

    #[test]
    fn test_bad_offset_is_rejected() {
        assert!(matches!(
            config(&[("QUOTA_UTC_OFFSET", "CEST")]),
            Err(QuotaError::Config(_))
        ));
    }

    #[test]
    fn test_bad_trusted_proxy_is_rejected() {
        assert!(matches!(
            config(&[("QUOTA_TRUSTED_PROXIES", "10.0.0.1,proxy.internal")]),
            Err(QuotaError::Config(_))
        ));
    }
}
