use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ApiCache;
use crate::config::GatewayConfig;
use crate::crypto::MasterKeyring;
use crate::error::GatewayError;
use crate::limiter::RateLimiter;
use crate::pool::UpstreamKeyPool;
use crate::resolver::{
    CredentialSource, StaticTenantSource, StoreTenantSource, TenantResolver,
};
use crate::store::SqliteStore;
use crate::upstream::UpstreamClient;

mod admin;

/// Headers that apply to a single transport hop and must never be
/// forwarded by a proxy. Names the upstream lists in its own `Connection`
/// header are stripped as well.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
pub struct GatewayState {
    resolver: Arc<TenantResolver>,
    limiter: Arc<RateLimiter>,
    upstream: Arc<UpstreamClient>,
    pool: Arc<UpstreamKeyPool>,
    store: Option<Arc<SqliteStore>>,
    cache: Option<Arc<ApiCache>>,
    admin_header: String,
    admin_keys: Vec<String>,
    default_rpm: u32,
    max_body_bytes: usize,
    forward_timeout: Duration,
}

impl GatewayState {
    /// Assemble the full pipeline from configuration: keyring, store,
    /// cache, upstream pool (refreshed once, must be non-empty), resolver
    /// sources, and the upstream client.
    pub async fn initialize(config: GatewayConfig) -> Result<Self, GatewayError> {
        let keyring = Arc::new(match &config.crypto {
            Some(crypto) => match MasterKeyring::load(crypto) {
                Ok(keyring) => {
                    info!(version = crypto.current_key_version, "loaded master key");
                    keyring
                }
                Err(err) => {
                    warn!(error = %err, "master key unavailable, upstream secret decryption disabled");
                    MasterKeyring::empty(crypto.current_key_version)
                }
            },
            None => MasterKeyring::empty(1),
        });

        let store = match &config.sqlite_path {
            Some(path) => {
                let store = Arc::new(SqliteStore::new(path.clone()));
                store.init().await?;
                Some(store)
            }
            None => None,
        };
        if config.auth.use_database && store.is_none() {
            return Err(GatewayError::Config(
                "auth.use_database requires sqlite_path".to_string(),
            ));
        }

        let cache = match &config.cache {
            Some(cache_config) => Some(Arc::new(ApiCache::new(cache_config).map_err(|err| {
                GatewayError::Config(format!("invalid cache configuration: {err}"))
            })?)),
            None => None,
        };

        let pool_store = if config.auth.use_database {
            store.clone()
        } else {
            None
        };
        let pool = Arc::new(UpstreamKeyPool::new(
            config.upstream_api_keys.clone(),
            pool_store,
            Arc::clone(&keyring),
        ));
        let key_count = pool.refresh().await?;
        if key_count == 0 {
            return Err(GatewayError::Config(
                "no upstream API keys available; configure upstream_api_keys or seed upstream_key_secret"
                    .to_string(),
            ));
        }
        info!(key_count, "upstream key pool loaded");

        let mut sources: Vec<Box<dyn CredentialSource>> = Vec::new();
        if config.auth.use_static_tenants {
            info!(count = config.tenants.len(), "static tenant table enabled");
            sources.push(Box::new(StaticTenantSource::new(
                &config.tenants,
                config.default_rpm,
            )));
        }
        if config.auth.use_database {
            if let Some(store) = store.clone() {
                sources.push(Box::new(StoreTenantSource::new(
                    store,
                    cache.clone(),
                    config.default_rpm,
                )));
            }
        }

        let upstream = Arc::new(UpstreamClient::new(
            &config.upstream_base_url,
            &config.anthropic_version,
            config.request_timeout(),
            Arc::clone(&pool),
        )?);

        Ok(Self {
            resolver: Arc::new(TenantResolver::new(sources)),
            limiter: Arc::new(RateLimiter::new()),
            upstream,
            pool,
            store,
            cache,
            admin_header: config.admin.api_key_header.to_ascii_lowercase(),
            admin_keys: config.admin.admin_api_keys.clone(),
            default_rpm: config.default_rpm,
            max_body_bytes: config.max_body_bytes.max(1),
            forward_timeout: config.request_timeout(),
        })
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/anthropic/v1/messages", post(handle_messages))
        .route("/admin/tenants", post(admin::create_tenant))
        .route("/admin/tenants/:tenant_id", get(admin::get_tenant))
        .route(
            "/admin/tenants/:tenant_id/keys",
            post(admin::create_api_key).get(admin::list_api_keys),
        )
        .route("/admin/tenants/:tenant_id/policy", put(admin::update_policy))
        .route("/admin/keys/:key_id/revoke", post(admin::revoke_key))
        .route("/admin/keys/refresh", post(admin::refresh_key_pool))
        .route("/admin/keys/status", get(admin::key_pool_status))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorDetail {
    pub(crate) code: &'static str,
    pub(crate) message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: ErrorDetail,
}

pub(crate) fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Terminal log record for one data-plane request. Emitted exactly once,
/// after the response is complete: immediately for unary responses and
/// failures, at stream end (completed, error, or client abort) for SSE.
struct RequestLog {
    request_id: String,
    tenant_id: String,
    stream: bool,
}

impl RequestLog {
    fn emit(&self, status: u16) {
        info!(
            request_id = %self.request_id,
            tenant_id = %self.tenant_id,
            stream = self.stream,
            status,
            "request complete"
        );
    }
}

async fn handle_messages(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let mut tenant_id: Option<String> = None;
    let mut stream_mode = false;

    let outcome = async {
        let bytes = to_bytes(body, state.max_body_bytes)
            .await
            .map_err(|_| GatewayError::BodyTooLarge {
                max: state.max_body_bytes,
            })?;
        let stream = detect_stream(&bytes)?;
        stream_mode = stream;

        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let context = state.resolver.resolve(authorization).await.map_err(|err| {
            debug!(request_id = %request_id, error = %err, "authentication failed");
            GatewayError::Auth(err)
        })?;
        tenant_id = Some(context.tenant_id.clone());

        // Admission strictly precedes any upstream work.
        if !state.limiter.try_consume(&context) {
            return Err(GatewayError::RateLimited);
        }

        let upstream_response = tokio::time::timeout(
            state.forward_timeout,
            state.upstream.forward(bytes, stream),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        let log = RequestLog {
            request_id: request_id.clone(),
            tenant_id: context.tenant_id.clone(),
            stream,
        };
        relay_upstream_response(upstream_response, stream, log).await
    }
    .await;

    match outcome {
        Ok(response) => response,
        Err(err) => {
            let (status, body) = map_gateway_error(&err);
            RequestLog {
                request_id,
                tenant_id: tenant_id.unwrap_or_else(|| "-".to_string()),
                stream: stream_mode,
            }
            .emit(status.as_u16());
            (status, body).into_response()
        }
    }
}

/// True iff the body parses as a JSON object whose top-level `stream`
/// member is boolean `true`. Parse failure is a client error; every other
/// shape means non-streaming.
fn detect_stream(body: &[u8]) -> Result<bool, GatewayError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| GatewayError::InvalidJson)?;
    Ok(matches!(
        value.get("stream"),
        Some(serde_json::Value::Bool(true))
    ))
}

pub(crate) fn map_gateway_error(err: &GatewayError) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        // One body for every authentication failure; the classification
        // stays in internal logs so responses carry no enumeration signal.
        GatewayError::Auth(_) => error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid or unknown credential",
        ),
        GatewayError::InvalidJson => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", "Invalid JSON body")
        }
        GatewayError::BodyTooLarge { max } => error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("request body exceeds {max} bytes"),
        ),
        GatewayError::RateLimited => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Rate limit exceeded",
        ),
        GatewayError::Timeout => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream_timeout",
            "request timed out",
        ),
        _ => error_response(
            StatusCode::BAD_GATEWAY,
            "bad_gateway",
            "upstream request failed",
        ),
    }
}

/// Copy the upstream response to the client. Status and body pass through
/// unchanged; hop-by-hop headers are stripped; streaming responses are
/// relayed chunk-by-chunk with the SSE headers forced.
async fn relay_upstream_response(
    upstream: reqwest::Response,
    stream: bool,
    log: RequestLog,
) -> Result<Response, GatewayError> {
    let status = upstream.status();
    let mut headers = relay_headers(upstream.headers());

    if stream {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );
        headers.remove(header::CONTENT_LENGTH);

        let relay = StreamRelay {
            upstream: upstream.bytes_stream().boxed(),
            log: Some((log, status.as_u16())),
        };
        let body_stream = futures_util::stream::try_unfold(relay, |mut relay| async move {
            match relay.upstream.next().await {
                Some(Ok(chunk)) => Ok(Some((chunk, relay))),
                Some(Err(err)) => {
                    relay.finish();
                    Err(std::io::Error::other(err))
                }
                None => {
                    relay.finish();
                    Ok(None)
                }
            }
        });

        let mut response = Response::new(Body::from_stream(body_stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    } else {
        let bytes = upstream
            .bytes()
            .await
            .map_err(|err| GatewayError::Upstream(err.to_string()))?;
        log.emit(status.as_u16());

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Relay stream state. The terminal log fires exactly once whether the
/// stream completes, errors, or the client disconnects (drop).
struct StreamRelay {
    upstream: BoxStream<'static, Result<bytes::Bytes, reqwest::Error>>,
    log: Option<(RequestLog, u16)>,
}

impl StreamRelay {
    fn finish(&mut self) {
        if let Some((log, status)) = self.log.take() {
            log.emit(status);
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        self.finish();
    }
}

fn relay_headers(upstream_headers: &HeaderMap) -> HeaderMap {
    let mut connection_named: HashSet<String> = HashSet::new();
    for value in upstream_headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            for name in value.split(',') {
                let name = name.trim().to_ascii_lowercase();
                if !name.is_empty() {
                    connection_named.insert(name);
                }
            }
        }
    }

    let mut headers = HeaderMap::new();
    for (name, value) in upstream_headers.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) || connection_named.contains(name_str) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
