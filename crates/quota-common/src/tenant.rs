//! Host based tenant resolution
//!
//! Every request path resolves its tenant here once and passes the
//! resulting [`ServiceId`] downstream.

use crate::ServiceId;

/// Host substrings that select a non-default tenant.
const TENANT_MARKERS: &[(&str, ServiceId)] = &[("zillow", ServiceId::Zillow)];

/// Map a request host to its tenant.
///
/// `None` stands for a non-HTTP context (CLI, scheduled job) and always yields
/// the default tenant.
pub fn resolve_service(host: Option<&str>) -> ServiceId {
    let Some(host) = host else {
        return ServiceId::default();
    };
    let host = host.to_ascii_lowercase();

    TENANT_MARKERS
        .iter()
        .find(|(marker, _)| host.contains(marker))
        .map(|(_, service)| *service)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_selects_tenant() {
        assert_eq!(resolve_service(Some("zillow.example.com")), ServiceId::Zillow);
        assert_eq!(resolve_service(Some("app.ZILLOW-insights.io:8443")), ServiceId::Zillow);
    }

    #[test]
    fn test_default_tenant() {
        assert_eq!(resolve_service(Some("digest.example.com")), ServiceId::Youtube);
        assert_eq!(resolve_service(Some("")), ServiceId::Youtube);
        assert_eq!(resolve_service(None), ServiceId::Youtube);
    }
}
