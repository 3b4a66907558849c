//! Who is asking, and for which tenant.
//!
//! The upstream auth layer forwards the authenticated account as `X-User-Id`.
//! Requests without it are guests, identified by client address and user agent.
//! The client address comes from the socket unless the peer is a trusted proxy.

use crate::error::AppError;
use axum::http::{header, HeaderMap};
use quota_common::{resolve_service, GuestFingerprint, Principal, ServiceId};
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub service: ServiceId,
    pub principal: Principal,
}

pub fn service_from_headers(headers: &HeaderMap) -> ServiceId {
    resolve_service(headers.get(header::HOST).and_then(|v| v.to_str().ok()))
}

/// Client address of the request.
///
/// `X-Forwarded-For` is only believed when the socket peer is a trusted
/// proxy. The client is then the rightmost hop that is not itself trusted.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[IpAddr],
) -> Option<IpAddr> {
    let peer_ip = peer.map(|addr| addr.ip());
    match peer_ip {
        Some(ip) if trusted_proxies.contains(&ip) => {
            forwarded_client(headers, trusted_proxies).or(peer_ip)
        }
        _ => peer_ip,
    }
}

fn forwarded_client(headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> Option<IpAddr> {
    let raw = headers.get(FORWARDED_FOR_HEADER)?.to_str().ok()?;
    let hops = raw
        .split(',')
        .map(|hop| hop.trim().parse::<IpAddr>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    hops.iter()
        .rev()
        .find(|ip| !trusted_proxies.contains(ip))
        .or_else(|| hops.first())
        .copied()
}

pub fn guest_fingerprint(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[IpAddr],
    service: ServiceId,
) -> GuestFingerprint {
    let ip = client_ip(headers, peer, trusted_proxies)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    GuestFingerprint::new(ip, user_agent, service)
}

pub fn request_context(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[IpAddr],
) -> Result<RequestContext, AppError> {
    let service = service_from_headers(headers);

    let principal = match headers.get(USER_ID_HEADER) {
        Some(raw) => {
            let user_id = raw
                .to_str()
                .ok()
                .and_then(|v| Uuid::parse_str(v.trim()).ok())
                .ok_or_else(|| AppError::BadRequest("Invalid X-User-Id header".to_string()))?;
            Principal::user(user_id)
        }
        None => Principal::guest(guest_fingerprint(headers, peer, trusted_proxies, service)),
    };

    Ok(RequestContext { service, principal })
}
