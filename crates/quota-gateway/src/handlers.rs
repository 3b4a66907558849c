//! HTTP endpoint handlers

use crate::error::AppError;
use crate::principal::{guest_fingerprint, request_context, service_from_headers, RequestContext};
use crate::AppState;
use axum::{
    extract::{ConnectInfo, FromRequest, Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use quota_common::{Principal, QuotaSnapshot, ServiceId, TierName};
use quota_engine::{NewUser, PlanTier, SettingsSnapshot, SubscriptionEvent, UserRecord};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{info, instrument};
use uuid::Uuid;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

type Peer = Option<ConnectInfo<SocketAddr>>;

fn peer_addr(peer: Peer) -> Option<SocketAddr> {
    peer.map(|ConnectInfo(addr)| addr)
}

// ============================================================================
// Request / response types
// ============================================================================

/// JSON request body. Rejections are reported as [`AppError::BadRequest`].
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct JsonBody<T>(pub T);

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeBody {
    pub amount: u64,
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub blocked: bool,
}

#[derive(Debug, Deserialize)]
pub struct SettingUpdate {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionWebhook {
    pub user_id: Uuid,
    pub event: SubscriptionEvent,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuotaResponse {
    pub service: ServiceId,
    #[serde(flatten)]
    pub quota: QuotaSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlansResponse {
    pub service: ServiceId,
    pub plans: Vec<PlanTier>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GuestUsageResponse {
    pub service: ServiceId,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub user_id: Uuid,
    pub reset: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

// ============================================================================
// Guards
// ============================================================================

fn authorize_admin(headers: &HeaderMap, state: &AppState) -> Result<(), AppError> {
    let expected = state.config.admin_token.as_deref().ok_or_else(|| AppError::Forbidden {
        code: "ADMIN_DISABLED",
        message: "Admin routes are disabled".to_string(),
    })?;

    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing admin token".to_string()))?;

    if provided != expected {
        return Err(AppError::Unauthorized("Invalid admin token".to_string()));
    }
    Ok(())
}

/// Apply the maintenance and admin-only switches to a quota request.
async fn enforce_settings(
    state: &AppState,
    ctx: &RequestContext,
    consuming: bool,
) -> Result<(), AppError> {
    let settings = state.settings.snapshot().await?;
    if !settings.gates(consuming) {
        return Ok(());
    }

    let is_admin = match &ctx.principal {
        Principal::User { user_id } => state.quota.user(*user_id).await?.is_admin,
        Principal::Guest { .. } => false,
    };
    if is_admin {
        return Ok(());
    }

    if settings.admin_only {
        Err(AppError::Forbidden {
            code: "ADMIN_ONLY",
            message: "The service is currently restricted to administrators".to_string(),
        })
    } else {
        Err(AppError::Unavailable {
            code: "MAINTENANCE",
            message: "The service is under maintenance".to_string(),
        })
    }
}

// ============================================================================
// Public routes
// ============================================================================

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[instrument(skip(state, headers))]
pub async fn list_plans(State(state): State<AppState>, headers: HeaderMap) -> Json<PlansResponse> {
    let service = service_from_headers(&headers);
    let plans = state
        .quota
        .catalog()
        .tiers(service)
        .into_iter()
        .cloned()
        .collect();
    Json(PlansResponse { service, plans })
}

#[instrument(skip(state, headers, request))]
pub async fn register_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(request): JsonBody<RegisterRequest>,
) -> Result<(StatusCode, Json<UserRecord>), AppError> {
    let settings = state.settings.snapshot().await?;
    if !settings.signup_enabled {
        return Err(AppError::Forbidden {
            code: "SIGNUP_DISABLED",
            message: "Sign-up is currently disabled".to_string(),
        });
    }

    let email = request.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest("A valid email is required".to_string()));
    }

    let service = service_from_headers(&headers);
    let user = state
        .quota
        .register_user(NewUser::new(email, service))
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, headers, peer))]
pub async fn get_quota(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Peer,
) -> Result<Json<QuotaResponse>, AppError> {
    let ctx = request_context(&headers, peer_addr(peer), &state.config.trusted_proxies)?;
    enforce_settings(&state, &ctx, false).await?;

    let quota = state.quota.check_quota(&ctx.principal, ctx.service).await?;
    Ok(Json(QuotaResponse {
        service: ctx.service,
        quota,
    }))
}

#[instrument(skip(state, headers, peer, body))]
pub async fn consume_quota(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Peer,
    JsonBody(body): JsonBody<ConsumeBody>,
) -> Result<Json<QuotaResponse>, AppError> {
    let ctx = request_context(&headers, peer_addr(peer), &state.config.trusted_proxies)?;
    enforce_settings(&state, &ctx, true).await?;

    let quota = state
        .quota
        .consume(&ctx.principal, ctx.service, body.amount)
        .await?;
    Ok(Json(QuotaResponse {
        service: ctx.service,
        quota,
    }))
}

#[instrument(skip(state, headers, peer))]
pub async fn guest_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Peer,
) -> Result<Json<GuestUsageResponse>, AppError> {
    let service = service_from_headers(&headers);
    let fingerprint =
        guest_fingerprint(&headers, peer_addr(peer), &state.config.trusted_proxies, service);

    let used = state.quota.guest_usage(&fingerprint, service).await?;
    let limit = state
        .quota
        .catalog()
        .tier(service, TierName::Free)
        .map_err(quota_common::QuotaError::from)?
        .limit;

    Ok(Json(GuestUsageResponse {
        service,
        used,
        limit,
        remaining: limit.saturating_sub(used),
    }))
}

// ============================================================================
// Admin routes
// ============================================================================

#[instrument(skip(state, headers))]
pub async fn admin_reset_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ResetResponse>, AppError> {
    authorize_admin(&headers, &state)?;

    let user = state.quota.user(user_id).await?;
    state
        .quota
        .reset_to_zero(&Principal::user(user.id), user.service_type)
        .await?;
    info!(user_id = %user_id, "Admin reset usage");
    Ok(Json(ResetResponse {
        user_id,
        reset: true,
    }))
}

#[instrument(skip(state, headers, request))]
pub async fn admin_block_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    JsonBody(request): JsonBody<BlockRequest>,
) -> Result<Json<UserRecord>, AppError> {
    authorize_admin(&headers, &state)?;
    let user = state.quota.set_blocked(user_id, request.blocked).await?;
    Ok(Json(user))
}

#[instrument(skip(state, headers))]
pub async fn admin_purge_guests(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PurgeResponse>, AppError> {
    authorize_admin(&headers, &state)?;
    let purged = state
        .quota
        .purge_guests(state.config.guest_retention)
        .await?;
    Ok(Json(PurgeResponse { purged }))
}

#[instrument(skip(state, headers))]
pub async fn admin_invalidate_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SettingsSnapshot>, AppError> {
    authorize_admin(&headers, &state)?;
    state.settings.invalidate().await;
    let snapshot = state.settings.snapshot().await?;
    Ok(Json((*snapshot).clone()))
}

#[instrument(skip(state, headers, update))]
pub async fn admin_update_setting(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(update): JsonBody<SettingUpdate>,
) -> Result<Json<SettingsSnapshot>, AppError> {
    authorize_admin(&headers, &state)?;

    state
        .settings_store
        .set(update.key.clone(), update.value.clone())
        .await;
    state.settings.invalidate().await;
    info!(key = %update.key, value = %update.value, "Setting updated");

    let snapshot = state.settings.snapshot().await?;
    Ok(Json((*snapshot).clone()))
}

// ============================================================================
// Webhooks
// ============================================================================

#[instrument(skip(state, headers, webhook))]
pub async fn subscription_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(webhook): JsonBody<SubscriptionWebhook>,
) -> Result<Json<ResetResponse>, AppError> {
    authorize_admin(&headers, &state)?;

    let reset = state
        .quota
        .on_subscription_changed(webhook.user_id, webhook.event)
        .await?;

    Ok(Json(ResetResponse {
        user_id: webhook.user_id,
        reset,
    }))
}
