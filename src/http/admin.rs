//! Admin control plane: tenant, credential, and policy management plus
//! upstream pool operations. Every mutation is audited and issues the
//! matching cache invalidation.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{error_response, ErrorResponse, GatewayState};
use crate::crypto::generate_client_credential;
use crate::resolver::QuotaPolicy;
use crate::store::{now_millis, ApiKeyRecord, SqliteStore, StoreError, TenantRecord};

const ACTION_CREATE_TENANT: &str = "CREATE_TENANT";
const ACTION_CREATE_KEY: &str = "CREATE_KEY";
const ACTION_REVOKE_KEY: &str = "REVOKE_KEY";
const ACTION_UPDATE_POLICY: &str = "UPDATE_POLICY";
const ACTION_REFRESH_KEYS: &str = "REFRESH_KEYS";

const TARGET_TENANT: &str = "tenant";
const TARGET_API_KEY: &str = "api_key";
const TARGET_QUOTA_POLICY: &str = "quota_policy";
const TARGET_UPSTREAM_KEY: &str = "upstream_key";

const PLANS: &[&str] = &["basic", "pro", "enterprise"];

type AdminResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

#[derive(Debug, Deserialize)]
pub(super) struct CreateTenantRequest {
    tenant_id: String,
    name: String,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    rpm_limit: Option<u32>,
    #[serde(default)]
    tpm_limit: Option<u32>,
    #[serde(default)]
    monthly_token_cap: Option<u64>,
    #[serde(default)]
    burst_multiplier: Option<f64>,
}

#[derive(Debug, Serialize)]
pub(super) struct TenantResponse {
    tenant_id: String,
    name: String,
    plan: String,
    status: String,
    quota_policy: QuotaPolicy,
}

impl TenantResponse {
    fn new(tenant: TenantRecord, quota_policy: QuotaPolicy) -> Self {
        Self {
            tenant_id: tenant.tenant_id,
            name: tenant.name,
            plan: tenant.plan,
            status: tenant.status,
            quota_policy,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateKeyRequest {
    user_id: String,
    #[serde(default)]
    scopes: Option<String>,
    #[serde(default)]
    expires_at_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateKeyResponse {
    key_id: String,
    tenant_id: String,
    user_id: String,
    key_prefix: String,
    /// The plaintext credential. Returned exactly once, at creation.
    api_key: String,
    scopes: String,
    expires_at_ms: Option<i64>,
    created_at_ms: i64,
}

#[derive(Debug, Serialize)]
pub(super) struct ApiKeySummary {
    key_id: String,
    tenant_id: String,
    user_id: String,
    key_prefix: String,
    status: String,
    scopes: String,
    expires_at_ms: Option<i64>,
    created_at_ms: i64,
}

impl From<ApiKeyRecord> for ApiKeySummary {
    fn from(record: ApiKeyRecord) -> Self {
        Self {
            key_id: record.key_id,
            tenant_id: record.tenant_id,
            user_id: record.user_id,
            key_prefix: record.key_prefix,
            status: record.status,
            scopes: record.scopes,
            expires_at_ms: record.expires_at_ms,
            created_at_ms: record.created_at_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct UpdatePolicyRequest {
    rpm_limit: u32,
    #[serde(default)]
    tpm_limit: Option<u32>,
    #[serde(default)]
    monthly_token_cap: Option<u64>,
    #[serde(default)]
    burst_multiplier: Option<f64>,
}

#[derive(Debug, Serialize)]
pub(super) struct RevokeKeyResponse {
    key_id: String,
    tenant_id: String,
    key_prefix: String,
    status: String,
}

#[derive(Debug, Serialize)]
pub(super) struct RefreshResponse {
    status: &'static str,
    key_count: usize,
}

#[derive(Debug, Serialize)]
pub(super) struct KeyPoolStatus {
    key_count: usize,
    database_enabled: bool,
}

pub(super) async fn create_tenant(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<CreateTenantRequest>,
) -> AdminResult<(StatusCode, Json<TenantResponse>)> {
    let actor = ensure_admin(&state, &headers)?;
    let store = require_store(&state)?;

    if !is_valid_tenant_id(&request.tenant_id) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "tenant_id must be 3-64 characters of [A-Za-z0-9_-]",
        ));
    }
    let plan = request.plan.clone().unwrap_or_else(|| "basic".to_string());
    if !PLANS.contains(&plan.as_str()) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "plan must be one of basic, pro, enterprise",
        ));
    }

    let policy = QuotaPolicy {
        rpm_limit: request.rpm_limit.unwrap_or(state.default_rpm),
        tpm_limit: request.tpm_limit,
        monthly_token_cap: request.monthly_token_cap,
        burst_multiplier: request.burst_multiplier.unwrap_or(1.5),
    };
    validate_policy(&policy)?;

    let now = now_millis();
    let tenant = TenantRecord {
        tenant_id: request.tenant_id.clone(),
        name: request.name.clone(),
        plan,
        status: "active".to_string(),
        created_at_ms: now,
        updated_at_ms: now,
    };

    match store.insert_tenant(&tenant).await {
        Ok(()) => {}
        Err(StoreError::TenantExists(tenant_id)) => {
            return Err(error_response(
                StatusCode::CONFLICT,
                "conflict",
                format!("tenant already exists: {tenant_id}"),
            ));
        }
        Err(err) => return Err(storage_error(err)),
    }
    store
        .upsert_quota_policy(&tenant.tenant_id, &policy)
        .await
        .map_err(storage_error)?;

    append_audit(
        &state,
        &actor,
        ACTION_CREATE_TENANT,
        TARGET_TENANT,
        &tenant.tenant_id,
        serde_json::json!({"plan": &tenant.plan, "rpm_limit": policy.rpm_limit}),
        &client_ip(&headers),
    )
    .await;
    info!(tenant_id = %tenant.tenant_id, actor = %actor, "created tenant");

    Ok((StatusCode::CREATED, Json(TenantResponse::new(tenant, policy))))
}

pub(super) async fn get_tenant(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> AdminResult<Json<TenantResponse>> {
    ensure_admin(&state, &headers)?;
    let store = require_store(&state)?;

    let tenant = store
        .find_tenant(&tenant_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| tenant_not_found(&tenant_id))?;
    let policy = store
        .find_quota_policy(&tenant_id)
        .await
        .map_err(storage_error)?
        .unwrap_or_else(|| QuotaPolicy::default_policy(state.default_rpm));

    Ok(Json(TenantResponse::new(tenant, policy)))
}

pub(super) async fn create_api_key(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateKeyRequest>,
) -> AdminResult<(StatusCode, Json<CreateKeyResponse>)> {
    let actor = ensure_admin(&state, &headers)?;
    let store = require_store(&state)?;

    store
        .find_tenant(&tenant_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| tenant_not_found(&tenant_id))?;

    let generated = generate_client_credential().map_err(|err| {
        warn!(error = %err, "credential generation failed");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "crypto_error",
            "failed to generate credential",
        )
    })?;

    let now = now_millis();
    let record = ApiKeyRecord {
        key_id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.clone(),
        user_id: request.user_id.clone(),
        key_prefix: generated.prefix.clone(),
        key_hash: generated.hash.clone(),
        status: "active".to_string(),
        scopes: request.scopes.clone().unwrap_or_else(|| "messages".to_string()),
        expires_at_ms: request.expires_at_ms,
        created_at_ms: now,
        updated_at_ms: now,
    };
    store.insert_api_key(&record).await.map_err(storage_error)?;

    append_audit(
        &state,
        &actor,
        ACTION_CREATE_KEY,
        TARGET_API_KEY,
        &record.key_id,
        serde_json::json!({
            "tenant_id": &tenant_id,
            "user_id": &record.user_id,
            "key_prefix": &record.key_prefix,
        }),
        &client_ip(&headers),
    )
    .await;
    info!(key_id = %record.key_id, tenant_id = %tenant_id, actor = %actor, "created API key");

    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            key_id: record.key_id,
            tenant_id: record.tenant_id,
            user_id: record.user_id,
            key_prefix: record.key_prefix,
            api_key: generated.plaintext,
            scopes: record.scopes,
            expires_at_ms: record.expires_at_ms,
            created_at_ms: record.created_at_ms,
        }),
    ))
}

pub(super) async fn list_api_keys(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> AdminResult<Json<Vec<ApiKeySummary>>> {
    ensure_admin(&state, &headers)?;
    let store = require_store(&state)?;

    let keys = store
        .list_api_keys(&tenant_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(keys.into_iter().map(ApiKeySummary::from).collect()))
}

pub(super) async fn revoke_key(
    State(state): State<GatewayState>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
) -> AdminResult<Json<RevokeKeyResponse>> {
    let actor = ensure_admin(&state, &headers)?;
    let store = require_store(&state)?;

    let record = store
        .revoke_api_key(&key_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("API key not found: {key_id}"),
            )
        })?;

    if let Some(cache) = &state.cache {
        cache.invalidate_api_key(&record.key_hash).await;
    }

    append_audit(
        &state,
        &actor,
        ACTION_REVOKE_KEY,
        TARGET_API_KEY,
        &record.key_id,
        serde_json::json!({
            "tenant_id": &record.tenant_id,
            "key_prefix": &record.key_prefix,
        }),
        &client_ip(&headers),
    )
    .await;
    info!(key_id = %record.key_id, tenant_id = %record.tenant_id, actor = %actor, "revoked API key");

    Ok(Json(RevokeKeyResponse {
        key_id: record.key_id,
        tenant_id: record.tenant_id,
        key_prefix: record.key_prefix,
        status: record.status,
    }))
}

pub(super) async fn update_policy(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdatePolicyRequest>,
) -> AdminResult<Json<QuotaPolicy>> {
    let actor = ensure_admin(&state, &headers)?;
    let store = require_store(&state)?;

    store
        .find_tenant(&tenant_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| tenant_not_found(&tenant_id))?;

    let policy = QuotaPolicy {
        rpm_limit: request.rpm_limit,
        tpm_limit: request.tpm_limit,
        monthly_token_cap: request.monthly_token_cap,
        burst_multiplier: request.burst_multiplier.unwrap_or(1.5),
    };
    validate_policy(&policy)?;

    store
        .upsert_quota_policy(&tenant_id, &policy)
        .await
        .map_err(storage_error)?;

    if let Some(cache) = &state.cache {
        cache.invalidate_quota_policy(&tenant_id).await;
    }

    append_audit(
        &state,
        &actor,
        ACTION_UPDATE_POLICY,
        TARGET_QUOTA_POLICY,
        &tenant_id,
        serde_json::json!({
            "rpm_limit": policy.rpm_limit,
            "burst_multiplier": policy.burst_multiplier,
        }),
        &client_ip(&headers),
    )
    .await;
    info!(tenant_id = %tenant_id, actor = %actor, "updated quota policy");

    Ok(Json(policy))
}

pub(super) async fn refresh_key_pool(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> AdminResult<Json<RefreshResponse>> {
    let actor = ensure_admin(&state, &headers)?;

    let key_count = state.pool.refresh().await.map_err(|err| {
        warn!(error = %err, "upstream key pool refresh failed");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            "failed to refresh upstream key pool",
        )
    })?;

    append_audit(
        &state,
        &actor,
        ACTION_REFRESH_KEYS,
        TARGET_UPSTREAM_KEY,
        "pool",
        serde_json::json!({"key_count": key_count}),
        &client_ip(&headers),
    )
    .await;
    info!(key_count, actor = %actor, "upstream key pool refreshed");

    Ok(Json(RefreshResponse {
        status: "success",
        key_count,
    }))
}

pub(super) async fn key_pool_status(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> AdminResult<Json<KeyPoolStatus>> {
    ensure_admin(&state, &headers)?;
    Ok(Json(KeyPoolStatus {
        key_count: state.pool.key_count(),
        database_enabled: state.pool.database_enabled(),
    }))
}

/// Validate the admin header against the allow-list. Returns the audit
/// actor, `admin:` plus the presented key's display prefix.
fn ensure_admin(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    if state.admin_keys.is_empty() {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "admin API not configured",
        ));
    }

    let provided = headers
        .get(state.admin_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match provided {
        Some(key) if state.admin_keys.iter().any(|expected| expected == key) => {
            Ok(format!("admin:{}", mask_admin_key(key)))
        }
        Some(_) => {
            warn!("invalid admin API key presented");
            Err(error_response(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid admin API key",
            ))
        }
        None => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            format!("missing {} header", state.admin_header),
        )),
    }
}

fn require_store(
    state: &GatewayState,
) -> Result<Arc<SqliteStore>, (StatusCode, Json<ErrorResponse>)> {
    state.store.clone().ok_or_else(|| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "not_configured",
            "durable store not configured",
        )
    })
}

fn tenant_not_found(tenant_id: &str) -> (StatusCode, Json<ErrorResponse>) {
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("tenant not found: {tenant_id}"),
    )
}

fn storage_error(err: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    warn!(error = %err, "admin store operation failed");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "storage_error",
        err.to_string(),
    )
}

fn validate_policy(policy: &QuotaPolicy) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if policy.rpm_limit == 0 {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "rpm_limit must be at least 1",
        ));
    }
    if !(1.0..=10.0).contains(&policy.burst_multiplier) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "burst_multiplier must be between 1.0 and 10.0",
        ));
    }
    if policy.tpm_limit.is_some_and(|tpm| tpm < 1) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "tpm_limit must be at least 1",
        ));
    }
    Ok(())
}

fn is_valid_tenant_id(tenant_id: &str) -> bool {
    (3..=64).contains(&tenant_id.len())
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

async fn append_audit(
    state: &GatewayState,
    actor: &str,
    action: &str,
    target_type: &str,
    target_id: &str,
    detail: serde_json::Value,
    client_ip: &str,
) {
    if let Some(store) = &state.store {
        if let Err(err) = store
            .append_audit_log(actor, action, target_type, target_id, detail, client_ip)
            .await
        {
            warn!(error = %err, action, "failed to append audit record");
        }
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|value| value.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "unknown".to_string()
}

fn mask_admin_key(key: &str) -> String {
    if key.len() < 8 {
        return "****".to_string();
    }
    format!("{}...", &key[..8])
}
