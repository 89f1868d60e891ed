use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration, loaded from a JSON file at startup.
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub upstream_base_url: String,
    pub anthropic_version: String,
    #[serde(default)]
    pub upstream_api_keys: Vec<String>,
    #[serde(default = "default_rpm")]
    pub default_rpm: u32,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub tenants: Vec<StaticTenant>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    #[serde(default)]
    pub crypto: Option<CryptoConfig>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("upstream_base_url", &self.upstream_base_url)
            .field("anthropic_version", &self.anthropic_version)
            .field("upstream_api_keys", &"<redacted>")
            .field("default_rpm", &self.default_rpm)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("tenants", &self.tenants)
            .field("auth", &self.auth)
            .field("sqlite_path", &self.sqlite_path)
            .field("crypto", &self.crypto)
            .field("cache", &self.cache)
            .field("admin", &self.admin)
            .finish()
    }
}

/// Entry in the static fallback tenant table. The credential here is the
/// plaintext the client presents; static tenants bypass the store entirely.
#[derive(Clone, Serialize, Deserialize)]
pub struct StaticTenant {
    pub api_key: String,
    pub tenant_id: String,
    pub user_id: String,
    pub plan: String,
}

impl std::fmt::Debug for StaticTenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTenant")
            .field("api_key", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("user_id", &self.user_id)
            .field("plan", &self.plan)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub use_static_tenants: bool,
    #[serde(default)]
    pub use_database: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            use_static_tenants: true,
            use_database: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CryptoConfig {
    pub master_key_path: PathBuf,
    #[serde(default = "default_key_version")]
    pub current_key_version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub url: String,
    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_api_key_ttl_seconds")]
    pub api_key_ttl_seconds: u64,
    #[serde(default = "default_quota_policy_ttl_seconds")]
    pub quota_policy_ttl_seconds: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_header")]
    pub api_key_header: String,
    #[serde(default)]
    pub admin_api_keys: Vec<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            api_key_header: default_admin_header(),
            admin_api_keys: Vec::new(),
        }
    }
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("api_key_header", &self.api_key_header)
            .field("admin_api_keys", &"<redacted>")
            .finish()
    }
}

fn default_rpm() -> u32 {
    60
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_request_timeout_seconds() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_key_version() -> u32 {
    1
}

fn default_cache_prefix() -> String {
    "gw:".to_string()
}

fn default_api_key_ttl_seconds() -> u64 {
    300
}

fn default_quota_policy_ttl_seconds() -> u64 {
    60
}

fn default_admin_header() -> String {
    "x-admin-api-key".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "upstream_base_url": "https://api.anthropic.com",
            "anthropic_version": "2023-06-01",
        }))
        .unwrap();

        assert_eq!(config.default_rpm, 60);
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.request_timeout_seconds, 300);
        assert!(config.auth.use_static_tenants);
        assert!(!config.auth.use_database);
        assert!(config.cache.is_none());
        assert!(config.admin.admin_api_keys.is_empty());
        assert_eq!(config.admin.api_key_header, "x-admin-api-key");
    }

    #[test]
    fn cache_section_fills_ttl_defaults() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "upstream_base_url": "https://api.anthropic.com",
            "anthropic_version": "2023-06-01",
            "cache": {"url": "redis://127.0.0.1/"},
        }))
        .unwrap();

        let cache = config.cache.expect("cache config");
        assert_eq!(cache.key_prefix, "gw:");
        assert_eq!(cache.api_key_ttl_seconds, 300);
        assert_eq!(cache.quota_policy_ttl_seconds, 60);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "upstream_base_url": "https://api.anthropic.com",
            "anthropic_version": "2023-06-01",
            "upstream_api_keys": ["sk-secret"],
            "tenants": [{"api_key": "aic_secret", "tenant_id": "t", "user_id": "u", "plan": "basic"}],
            "admin": {"admin_api_keys": ["admin-secret"]},
        }))
        .unwrap();

        let rendered = format!("{config:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("sk-secret"));
        assert!(!rendered.contains("aic_secret"));
        assert!(!rendered.contains("admin-secret"));
    }
}
