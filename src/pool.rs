use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::crypto::MasterKeyring;
use crate::error::GatewayError;
use crate::store::SqliteStore;

/// Pool of decrypted upstream API keys with round-robin selection and
/// atomic hot-swap.
///
/// Readers take one immutable snapshot per call; `refresh` publishes a new
/// snapshot without disturbing in-flight readers. The rotation counter is
/// deliberately not reset on refresh.
pub struct UpstreamKeyPool {
    keys: RwLock<Arc<Vec<String>>>,
    counter: AtomicI64,
    static_keys: Vec<String>,
    store: Option<Arc<SqliteStore>>,
    keyring: Arc<MasterKeyring>,
}

impl UpstreamKeyPool {
    pub fn new(
        static_keys: Vec<String>,
        store: Option<Arc<SqliteStore>>,
        keyring: Arc<MasterKeyring>,
    ) -> Self {
        Self {
            keys: RwLock::new(Arc::new(Vec::new())),
            counter: AtomicI64::new(0),
            static_keys,
            store,
            keyring,
        }
    }

    /// Reload the pool: decrypt active store records, then append the
    /// static fallback list deduplicated against them (store keys first).
    /// A record that fails to decrypt is logged and skipped; it aborts
    /// nothing. Returns the resulting key count.
    pub async fn refresh(&self) -> Result<usize, GatewayError> {
        let mut loaded: Vec<String> = Vec::new();

        if let Some(store) = &self.store {
            if self.keyring.is_enabled() {
                let records = store.list_active_upstream_credentials().await?;
                for record in records {
                    match self.keyring.decrypt(&record.secret) {
                        Ok(plaintext) => loaded.push(plaintext),
                        Err(err) => {
                            warn!(
                                upstream_key_id = %record.upstream_key_id,
                                error = %err,
                                "skipping upstream credential that failed to decrypt"
                            );
                        }
                    }
                }
            }
        }

        for key in &self.static_keys {
            let key = key.trim();
            if !key.is_empty() && !loaded.iter().any(|existing| existing == key) {
                loaded.push(key.to_string());
            }
        }

        for (idx, key) in loaded.iter().enumerate() {
            info!(index = idx, key = %mask_key(key), length = key.len(), "loaded upstream key");
        }

        let count = loaded.len();
        self.swap(loaded);
        Ok(count)
    }

    fn swap(&self, keys: Vec<String>) {
        *self.keys.write().expect("upstream pool lock poisoned") = Arc::new(keys);
    }

    fn snapshot(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.keys.read().expect("upstream pool lock poisoned"))
    }

    /// Next key in rotation. `rem_euclid` keeps the index valid even after
    /// the counter wraps into negative territory.
    pub fn next_key(&self) -> Result<String, GatewayError> {
        let keys = self.snapshot();
        if keys.is_empty() {
            return Err(GatewayError::NoUpstreamKeys);
        }
        let ticket = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = ticket.rem_euclid(keys.len() as i64) as usize;
        Ok(keys[index].clone())
    }

    pub fn key_count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn database_enabled(&self) -> bool {
        self.store.is_some() && self.keyring.is_enabled()
    }
}

/// First 10 characters only; enough to identify a key in logs without
/// disclosing it.
pub(crate) fn mask_key(key: &str) -> String {
    if key.len() <= 10 {
        return "***".to_string();
    }
    format!("{}...", &key[..10])
}
