use std::time::Duration;

use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::resolver::{ApiKeyInfo, QuotaPolicy};

/// Every cache operation is bounded well below the entry TTLs; a slow or
/// dead cache degrades to misses instead of stalling requests.
const CACHE_OP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cache operation timed out")]
    Timeout,
}

/// Read-through cache for credential-info and quota-policy records.
///
/// The only in-process state is the configured prefix and TTLs; entries
/// live in an external redis. Failures are never user visible: `get`
/// errors read as misses, `put`/`delete` errors are logged and dropped.
#[derive(Clone)]
pub struct ApiCache {
    client: redis::Client,
    prefix: String,
    api_key_ttl: Duration,
    quota_policy_ttl: Duration,
}

impl ApiCache {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(config.url.as_str())?,
            prefix: config.key_prefix.clone(),
            api_key_ttl: Duration::from_secs(config.api_key_ttl_seconds),
            quota_policy_ttl: Duration::from_secs(config.quota_policy_ttl_seconds),
        })
    }

    fn api_key_cache_key(&self, key_hash: &str) -> String {
        format!("{}apikey:{key_hash}", self.prefix)
    }

    fn quota_cache_key(&self, tenant_id: &str) -> String {
        format!("{}quota:{tenant_id}", self.prefix)
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let operation = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let _: Option<String> = conn.get(format!("{}__ping__", self.prefix)).await?;
            Ok(())
        };
        tokio::time::timeout(CACHE_OP_TIMEOUT, operation)
            .await
            .map_err(|_| CacheError::Timeout)?
    }

    pub async fn get_api_key_info(&self, key_hash: &str) -> Option<ApiKeyInfo> {
        match self.get_json(self.api_key_cache_key(key_hash)).await {
            Ok(Some(info)) => {
                debug!(key = %mask_hash(key_hash), "credential cache hit");
                Some(info)
            }
            Ok(None) => None,
            Err(err) => {
                debug!(key = %mask_hash(key_hash), error = %err, "credential cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn put_api_key_info(&self, key_hash: &str, info: &ApiKeyInfo) {
        if let Err(err) = self
            .put_json(self.api_key_cache_key(key_hash), info, self.api_key_ttl)
            .await
        {
            warn!(key = %mask_hash(key_hash), error = %err, "failed to cache credential info");
        }
    }

    pub async fn invalidate_api_key(&self, key_hash: &str) {
        if let Err(err) = self.delete(self.api_key_cache_key(key_hash)).await {
            warn!(key = %mask_hash(key_hash), error = %err, "failed to invalidate credential cache entry");
        }
    }

    pub async fn get_quota_policy(&self, tenant_id: &str) -> Option<QuotaPolicy> {
        match self.get_json(self.quota_cache_key(tenant_id)).await {
            Ok(Some(policy)) => {
                debug!(tenant_id, "quota policy cache hit");
                Some(policy)
            }
            Ok(None) => None,
            Err(err) => {
                debug!(tenant_id, error = %err, "quota policy cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn put_quota_policy(&self, tenant_id: &str, policy: &QuotaPolicy) {
        if let Err(err) = self
            .put_json(self.quota_cache_key(tenant_id), policy, self.quota_policy_ttl)
            .await
        {
            warn!(tenant_id, error = %err, "failed to cache quota policy");
        }
    }

    pub async fn invalidate_quota_policy(&self, tenant_id: &str) {
        if let Err(err) = self.delete(self.quota_cache_key(tenant_id)).await {
            warn!(tenant_id, error = %err, "failed to invalidate quota policy cache entry");
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>, CacheError> {
        let operation = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let raw: Option<String> = conn.get(&key).await?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        };
        tokio::time::timeout(CACHE_OP_TIMEOUT, operation)
            .await
            .map_err(|_| CacheError::Timeout)?
    }

    async fn put_json<T: Serialize>(
        &self,
        key: String,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        let operation = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let _: () = conn.set_ex(&key, raw, ttl.as_secs().max(1)).await?;
            Ok(())
        };
        tokio::time::timeout(CACHE_OP_TIMEOUT, operation)
            .await
            .map_err(|_| CacheError::Timeout)?
    }

    async fn delete(&self, key: String) -> Result<(), CacheError> {
        let operation = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let _: () = conn.del(&key).await?;
            Ok(())
        };
        tokio::time::timeout(CACHE_OP_TIMEOUT, operation)
            .await
            .map_err(|_| CacheError::Timeout)?
    }
}

fn mask_hash(hash: &str) -> String {
    if hash.len() < 16 {
        return "****".to_string();
    }
    format!("{}...{}", &hash[..8], &hash[hash.len() - 4..])
}
