use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::ApiCache;
use crate::config::StaticTenant;
use crate::crypto::sha256_hex;
use crate::store::{now_millis, ApiKeyRecord, SqliteStore};

/// Authentication failure classification. Internal only: the handler maps
/// every variant to one identical 401 so clients cannot probe credentials.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("invalid Authorization scheme")]
    InvalidScheme,
    #[error("missing credential")]
    MissingCredential,
    #[error("unknown credential")]
    UnknownCredential,
    #[error("credential expired")]
    Expired,
    #[error("credential revoked")]
    Revoked,
    #[error("tenant not found")]
    TenantMissing,
}

/// Per-tenant quota policy as carried in the tenant context and the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub rpm_limit: u32,
    pub tpm_limit: Option<u32>,
    pub monthly_token_cap: Option<u64>,
    pub burst_multiplier: f64,
}

impl QuotaPolicy {
    pub fn default_policy(default_rpm: u32) -> Self {
        Self {
            rpm_limit: default_rpm.max(1),
            tpm_limit: None,
            monthly_token_cap: None,
            burst_multiplier: 1.5,
        }
    }

    pub fn burst_capacity(&self) -> u32 {
        ((f64::from(self.rpm_limit)) * self.burst_multiplier).ceil().max(1.0) as u32
    }
}

/// Cacheable projection of an api_key row; never contains the plaintext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    pub key_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub status: String,
    pub scopes: String,
    pub expires_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

impl ApiKeyInfo {
    pub fn from_record(record: &ApiKeyRecord) -> Self {
        Self {
            key_id: record.key_id.clone(),
            tenant_id: record.tenant_id.clone(),
            user_id: record.user_id.clone(),
            status: record.status.clone(),
            scopes: record.scopes.clone(),
            expires_at_ms: record.expires_at_ms,
            created_at_ms: record.created_at_ms,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    pub fn is_valid(&self, now_ms: i64) -> bool {
        self.is_active() && !self.is_expired(now_ms)
    }
}

/// Immutable per-request identity. Holds only what downstream stages
/// consume; the plaintext bearer credential is never retained.
#[derive(Clone, Debug)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: String,
    pub plan: String,
    pub quota_policy: QuotaPolicy,
}

/// One way of turning a bearer credential into a tenant context. Sources
/// are composed in order; `Ok(None)` means "not mine, try the next one".
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<Option<TenantContext>, AuthError>;
}

pub struct TenantResolver {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl TenantResolver {
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self { sources }
    }

    /// Resolve the raw `Authorization` header value into a tenant context.
    ///
    /// The scheme check is exact: `Bearer ` with a single space, case
    /// sensitive. Surrounding whitespace is trimmed from the remainder;
    /// internal bytes are never altered.
    pub async fn resolve(&self, authorization: Option<&str>) -> Result<TenantContext, AuthError> {
        let header = authorization.ok_or(AuthError::MissingHeader)?;
        let rest = header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidScheme)?;
        let credential = rest.trim();
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        for source in &self.sources {
            if let Some(context) = source.resolve(credential).await? {
                return Ok(context);
            }
        }
        Err(AuthError::UnknownCredential)
    }
}

/// In-process tenant table from configuration. Bypasses hashing, cache,
/// and store entirely; exists to seed small deployments and to keep the
/// gateway serving during store outages.
pub struct StaticTenantSource {
    tenants: HashMap<String, StaticEntry>,
    default_rpm: u32,
}

struct StaticEntry {
    tenant_id: String,
    user_id: String,
    plan: String,
}

impl StaticTenantSource {
    pub fn new(tenants: &[StaticTenant], default_rpm: u32) -> Self {
        let tenants = tenants
            .iter()
            .map(|tenant| {
                (
                    tenant.api_key.clone(),
                    StaticEntry {
                        tenant_id: tenant.tenant_id.clone(),
                        user_id: tenant.user_id.clone(),
                        plan: tenant.plan.clone(),
                    },
                )
            })
            .collect();
        Self {
            tenants,
            default_rpm,
        }
    }
}

#[async_trait]
impl CredentialSource for StaticTenantSource {
    async fn resolve(&self, credential: &str) -> Result<Option<TenantContext>, AuthError> {
        Ok(self.tenants.get(credential).map(|entry| {
            debug!(tenant_id = %entry.tenant_id, "resolved tenant from static table");
            TenantContext {
                tenant_id: entry.tenant_id.clone(),
                user_id: entry.user_id.clone(),
                plan: entry.plan.clone(),
                quota_policy: QuotaPolicy::default_policy(self.default_rpm),
            }
        }))
    }
}

/// Store-backed resolution: SHA-256 the credential, consult the cache,
/// fall through to the store, and write back through the cache.
pub struct StoreTenantSource {
    store: Arc<SqliteStore>,
    cache: Option<Arc<ApiCache>>,
    default_rpm: u32,
}

impl StoreTenantSource {
    pub fn new(store: Arc<SqliteStore>, cache: Option<Arc<ApiCache>>, default_rpm: u32) -> Self {
        Self {
            store,
            cache,
            default_rpm,
        }
    }

    async fn quota_policy_for(&self, tenant_id: &str) -> QuotaPolicy {
        if let Some(cache) = &self.cache {
            if let Some(policy) = cache.get_quota_policy(tenant_id).await {
                return policy;
            }
        }

        match self.store.find_quota_policy(tenant_id).await {
            Ok(Some(policy)) => {
                if let Some(cache) = &self.cache {
                    let cache = Arc::clone(cache);
                    let tenant_id = tenant_id.to_string();
                    let cached = policy.clone();
                    tokio::spawn(async move {
                        cache.put_quota_policy(&tenant_id, &cached).await;
                    });
                }
                policy
            }
            Ok(None) => QuotaPolicy::default_policy(self.default_rpm),
            Err(err) => {
                warn!(tenant_id, error = %err, "quota policy lookup failed, using default");
                QuotaPolicy::default_policy(self.default_rpm)
            }
        }
    }
}

#[async_trait]
impl CredentialSource for StoreTenantSource {
    async fn resolve(&self, credential: &str) -> Result<Option<TenantContext>, AuthError> {
        let key_hash = sha256_hex(credential);
        let now_ms = now_millis();

        let mut identity: Option<(String, String)> = None;
        if let Some(cache) = &self.cache {
            if let Some(info) = cache.get_api_key_info(&key_hash).await {
                if info.is_valid(now_ms) {
                    identity = Some((info.tenant_id, info.user_id));
                }
                // A cached record that is no longer valid is treated as a
                // miss; the store remains the authority.
            }
        }

        let (tenant_id, user_id) = match identity {
            Some(identity) => identity,
            None => {
                let record = match self.store.find_credential_by_key_hash(&key_hash).await {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(error = %err, "credential store lookup failed");
                        return Ok(None);
                    }
                };
                let Some(record) = record else {
                    return Ok(None);
                };

                let info = ApiKeyInfo::from_record(&record);
                if !info.is_active() {
                    return Err(AuthError::Revoked);
                }
                if info.is_expired(now_ms) {
                    return Err(AuthError::Expired);
                }

                if let Some(cache) = &self.cache {
                    let cache = Arc::clone(cache);
                    let key_hash = key_hash.clone();
                    tokio::spawn(async move {
                        cache.put_api_key_info(&key_hash, &info).await;
                    });
                }

                (record.tenant_id, record.user_id)
            }
        };

        let tenant = match self.store.find_tenant(&tenant_id).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) => return Err(AuthError::TenantMissing),
            Err(err) => {
                warn!(tenant_id = %tenant_id, error = %err, "tenant lookup failed");
                return Err(AuthError::TenantMissing);
            }
        };

        let quota_policy = self.quota_policy_for(&tenant_id).await;
        debug!(tenant_id = %tenant.tenant_id, "resolved tenant from store");
        Ok(Some(TenantContext {
            tenant_id: tenant.tenant_id,
            user_id,
            plan: tenant.plan,
            quota_policy,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TenantRecord;

    fn static_source() -> StaticTenantSource {
        StaticTenantSource::new(
            &[StaticTenant {
                api_key: "demo-key".to_string(),
                tenant_id: "demo".to_string(),
                user_id: "demo-user".to_string(),
                plan: "basic".to_string(),
            }],
            60,
        )
    }

    fn static_resolver() -> TenantResolver {
        TenantResolver::new(vec![Box::new(static_source())])
    }

    async fn seeded_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("gw.sqlite")));
        store.init().await.unwrap();

        let now = now_millis();
        store
            .insert_tenant(&TenantRecord {
                tenant_id: "acme".to_string(),
                name: "Acme".to_string(),
                plan: "pro".to_string(),
                status: "active".to_string(),
                created_at_ms: now,
                updated_at_ms: now,
            })
            .await
            .unwrap();
        store
            .upsert_quota_policy(
                "acme",
                &QuotaPolicy {
                    rpm_limit: 120,
                    tpm_limit: Some(50_000),
                    monthly_token_cap: None,
                    burst_multiplier: 2.0,
                },
            )
            .await
            .unwrap();

        for (key_id, plaintext, status, expires_at_ms) in [
            ("key-ok", "cred-ok", "active", None),
            ("key-revoked", "cred-revoked", "revoked", None),
            ("key-expired", "cred-expired", "active", Some(now - 1_000)),
            ("key-orphan", "cred-orphan", "active", None),
        ] {
            let tenant_id = if key_id == "key-orphan" {
                "gone"
            } else {
                "acme"
            };
            store
                .insert_api_key(&ApiKeyRecord {
                    key_id: key_id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    user_id: "u1".to_string(),
                    key_prefix: plaintext.chars().take(12).collect(),
                    key_hash: sha256_hex(plaintext),
                    status: status.to_string(),
                    scopes: "messages".to_string(),
                    expires_at_ms,
                    created_at_ms: now,
                    updated_at_ms: now,
                })
                .await
                .unwrap();
        }

        (dir, store)
    }

    #[tokio::test]
    async fn header_parsing_classifies_failures() {
        let resolver = static_resolver();

        assert_eq!(
            resolver.resolve(None).await.unwrap_err(),
            AuthError::MissingHeader
        );
        assert_eq!(
            resolver.resolve(Some("Token demo-key")).await.unwrap_err(),
            AuthError::InvalidScheme
        );
        // The scheme comparison is case sensitive.
        assert_eq!(
            resolver.resolve(Some("bearer demo-key")).await.unwrap_err(),
            AuthError::InvalidScheme
        );
        assert_eq!(
            resolver.resolve(Some("Bearer ")).await.unwrap_err(),
            AuthError::MissingCredential
        );
        assert_eq!(
            resolver.resolve(Some("Bearer   ")).await.unwrap_err(),
            AuthError::MissingCredential
        );
    }

    #[tokio::test]
    async fn static_table_resolves_with_default_policy() {
        let resolver = static_resolver();
        let context = resolver.resolve(Some("Bearer demo-key")).await.unwrap();
        assert_eq!(context.tenant_id, "demo");
        assert_eq!(context.user_id, "demo-user");
        assert_eq!(context.plan, "basic");
        assert_eq!(context.quota_policy, QuotaPolicy::default_policy(60));
    }

    #[tokio::test]
    async fn surrounding_whitespace_is_trimmed_after_scheme_strip() {
        let resolver = static_resolver();
        let context = resolver.resolve(Some("Bearer  demo-key ")).await.unwrap();
        assert_eq!(context.tenant_id, "demo");
    }

    #[tokio::test]
    async fn unknown_credential_falls_through_all_sources() {
        let resolver = static_resolver();
        assert_eq!(
            resolver.resolve(Some("Bearer nope")).await.unwrap_err(),
            AuthError::UnknownCredential
        );
    }

    #[tokio::test]
    async fn store_source_classifies_credential_state() {
        let (_dir, store) = seeded_store().await;
        let resolver = TenantResolver::new(vec![Box::new(StoreTenantSource::new(
            store, None, 60,
        ))]);

        let context = resolver.resolve(Some("Bearer cred-ok")).await.unwrap();
        assert_eq!(context.tenant_id, "acme");
        assert_eq!(context.plan, "pro");
        assert_eq!(context.quota_policy.rpm_limit, 120);
        assert_eq!(context.quota_policy.burst_capacity(), 240);

        assert_eq!(
            resolver
                .resolve(Some("Bearer cred-revoked"))
                .await
                .unwrap_err(),
            AuthError::Revoked
        );
        assert_eq!(
            resolver
                .resolve(Some("Bearer cred-expired"))
                .await
                .unwrap_err(),
            AuthError::Expired
        );
        assert_eq!(
            resolver.resolve(Some("Bearer nope")).await.unwrap_err(),
            AuthError::UnknownCredential
        );
        assert_eq!(
            resolver
                .resolve(Some("Bearer cred-orphan"))
                .await
                .unwrap_err(),
            AuthError::TenantMissing
        );
    }

    #[tokio::test]
    async fn missing_policy_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("gw.sqlite")));
        store.init().await.unwrap();

        let now = now_millis();
        // No quota_policy row for this tenant: resolution has to fall back.
        store
            .insert_tenant(&TenantRecord {
                tenant_id: "bare".to_string(),
                name: "Bare".to_string(),
                plan: "basic".to_string(),
                status: "active".to_string(),
                created_at_ms: now,
                updated_at_ms: now,
            })
            .await
            .unwrap();
        store
            .insert_api_key(&ApiKeyRecord {
                key_id: "k".to_string(),
                tenant_id: "bare".to_string(),
                user_id: "u".to_string(),
                key_prefix: "cred-bare".to_string(),
                key_hash: sha256_hex("cred-bare"),
                status: "active".to_string(),
                scopes: "messages".to_string(),
                expires_at_ms: None,
                created_at_ms: now,
                updated_at_ms: now,
            })
            .await
            .unwrap();

        let resolver =
            TenantResolver::new(vec![Box::new(StoreTenantSource::new(store, None, 42))]);
        let context = resolver.resolve(Some("Bearer cred-bare")).await.unwrap();
        assert_eq!(context.quota_policy, QuotaPolicy::default_policy(42));
    }

    #[test]
    fn burst_capacity_rounds_up_with_floor_of_one() {
        let policy = QuotaPolicy {
            rpm_limit: 3,
            tpm_limit: None,
            monthly_token_cap: None,
            burst_multiplier: 1.5,
        };
        assert_eq!(policy.burst_capacity(), 5);
        assert_eq!(QuotaPolicy::default_policy(0).rpm_limit, 1);
    }
}
