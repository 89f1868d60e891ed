use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use thiserror::Error;

use crate::crypto::EncryptedSecret;
use crate::resolver::QuotaPolicy;

/// Durable record of tenants, hashed client credentials, quota policies,
/// encrypted upstream credentials, and the admin audit log. Each operation
/// opens its own connection inside `spawn_blocking`; sqlite serializes
/// writers, and WAL keeps readers off the write path.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tenant already exists: {0}")]
    TenantExists(String),
}

#[derive(Clone, Debug)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub name: String,
    pub plan: String,
    pub status: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub key_prefix: String,
    pub key_hash: String,
    pub status: String,
    pub scopes: String,
    pub expires_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct UpstreamKeyRecord {
    pub upstream_key_id: String,
    pub provider: String,
    pub status: String,
    pub secret: EncryptedSecret,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct AuditLogRecord {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub detail_json: String,
    pub client_ip: String,
    pub created_at_ms: i64,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// The credential row for a key hash, regardless of status. The
    /// resolver classifies revoked and expired rows; a status filter here
    /// would collapse them into "unknown".
    pub async fn find_credential_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKeyRecord>, StoreError> {
        let path = self.path.clone();
        let key_hash = key_hash.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ApiKeyRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let record = conn
                .query_row(
                    "SELECT key_id, tenant_id, user_id, key_prefix, key_hash, status, scopes,
                            expires_at_ms, created_at_ms, updated_at_ms
                     FROM api_key WHERE key_hash = ?1",
                    rusqlite::params![key_hash],
                    map_api_key_row,
                )
                .optional()?;
            Ok(record)
        })
        .await?
    }

    pub async fn find_tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError> {
        let path = self.path.clone();
        let tenant_id = tenant_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<TenantRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let record = conn
                .query_row(
                    "SELECT tenant_id, name, plan, status, created_at_ms, updated_at_ms
                     FROM tenant WHERE tenant_id = ?1",
                    rusqlite::params![tenant_id],
                    |row| {
                        Ok(TenantRecord {
                            tenant_id: row.get(0)?,
                            name: row.get(1)?,
                            plan: row.get(2)?,
                            status: row.get(3)?,
                            created_at_ms: row.get(4)?,
                            updated_at_ms: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await?
    }

    pub async fn find_quota_policy(
        &self,
        tenant_id: &str,
    ) -> Result<Option<QuotaPolicy>, StoreError> {
        let path = self.path.clone();
        let tenant_id = tenant_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<QuotaPolicy>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let policy = conn
                .query_row(
                    "SELECT rpm_limit, tpm_limit, monthly_token_cap, burst_multiplier
                     FROM quota_policy WHERE tenant_id = ?1",
                    rusqlite::params![tenant_id],
                    |row| {
                        Ok(QuotaPolicy {
                            rpm_limit: row.get::<_, i64>(0)?.max(1) as u32,
                            tpm_limit: row.get::<_, Option<i64>>(1)?.map(|v| v.max(0) as u32),
                            monthly_token_cap: row
                                .get::<_, Option<i64>>(2)?
                                .map(|v| v.max(0) as u64),
                            burst_multiplier: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(policy)
        })
        .await?
    }

    pub async fn list_active_upstream_credentials(
        &self,
    ) -> Result<Vec<UpstreamKeyRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<UpstreamKeyRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT upstream_key_id, provider, status, key_version, iv, ciphertext, tag, aad,
                        created_at_ms
                 FROM upstream_key_secret WHERE status = 'active' ORDER BY upstream_key_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(UpstreamKeyRecord {
                    upstream_key_id: row.get(0)?,
                    provider: row.get(1)?,
                    status: row.get(2)?,
                    secret: EncryptedSecret {
                        key_version: row.get::<_, i64>(3)?.max(0) as u32,
                        iv: row.get(4)?,
                        ciphertext: row.get(5)?,
                        tag: row.get(6)?,
                        aad: row.get(7)?,
                    },
                    created_at_ms: row.get(8)?,
                })
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await?
    }

    pub async fn insert_tenant(&self, tenant: &TenantRecord) -> Result<(), StoreError> {
        let path = self.path.clone();
        let tenant = tenant.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM tenant WHERE tenant_id = ?1",
                    rusqlite::params![tenant.tenant_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::TenantExists(tenant.tenant_id));
            }

            tx.execute(
                "INSERT INTO tenant (tenant_id, name, plan, status, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    tenant.tenant_id,
                    tenant.name,
                    tenant.plan,
                    tenant.status,
                    tenant.created_at_ms,
                    tenant.updated_at_ms,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError> {
        let path = self.path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO api_key (key_id, tenant_id, user_id, key_prefix, key_hash, status,
                                      scopes, expires_at_ms, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    record.key_id,
                    record.tenant_id,
                    record.user_id,
                    record.key_prefix,
                    record.key_hash,
                    record.status,
                    record.scopes,
                    record.expires_at_ms,
                    record.created_at_ms,
                    record.updated_at_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_api_keys(&self, tenant_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let path = self.path.clone();
        let tenant_id = tenant_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<ApiKeyRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT key_id, tenant_id, user_id, key_prefix, key_hash, status, scopes,
                        expires_at_ms, created_at_ms, updated_at_ms
                 FROM api_key WHERE tenant_id = ?1 ORDER BY created_at_ms",
            )?;
            let rows = stmt.query_map(rusqlite::params![tenant_id], map_api_key_row)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await?
    }

    /// Revoke a credential. Returns the post-revoke record (including the
    /// key hash, which the caller needs for cache invalidation), or `None`
    /// when no such key exists.
    pub async fn revoke_api_key(&self, key_id: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let path = self.path.clone();
        let key_id = key_id.to_string();
        let now = now_millis();
        tokio::task::spawn_blocking(move || -> Result<Option<ApiKeyRecord>, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let record = tx
                .query_row(
                    "SELECT key_id, tenant_id, user_id, key_prefix, key_hash, status, scopes,
                            expires_at_ms, created_at_ms, updated_at_ms
                     FROM api_key WHERE key_id = ?1",
                    rusqlite::params![key_id],
                    map_api_key_row,
                )
                .optional()?;
            let Some(mut record) = record else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE api_key SET status = 'revoked', updated_at_ms = ?2 WHERE key_id = ?1",
                rusqlite::params![key_id, now],
            )?;
            tx.commit()?;

            record.status = "revoked".to_string();
            record.updated_at_ms = now;
            Ok(Some(record))
        })
        .await?
    }

    pub async fn upsert_quota_policy(
        &self,
        tenant_id: &str,
        policy: &QuotaPolicy,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let tenant_id = tenant_id.to_string();
        let policy = policy.clone();
        let now = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO quota_policy (tenant_id, rpm_limit, tpm_limit, monthly_token_cap,
                                           burst_multiplier, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(tenant_id) DO UPDATE SET
                     rpm_limit = excluded.rpm_limit,
                     tpm_limit = excluded.tpm_limit,
                     monthly_token_cap = excluded.monthly_token_cap,
                     burst_multiplier = excluded.burst_multiplier,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![
                    tenant_id,
                    i64::from(policy.rpm_limit),
                    policy.tpm_limit.map(i64::from),
                    policy.monthly_token_cap.map(|v| v.min(i64::MAX as u64) as i64),
                    policy.burst_multiplier,
                    now,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn insert_upstream_credential(
        &self,
        record: &UpstreamKeyRecord,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO upstream_key_secret (upstream_key_id, provider, status, key_version,
                                                  iv, ciphertext, tag, aad, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    record.upstream_key_id,
                    record.provider,
                    record.status,
                    i64::from(record.secret.key_version),
                    record.secret.iv,
                    record.secret.ciphertext,
                    record.secret.tag,
                    record.secret.aad,
                    record.created_at_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn append_audit_log(
        &self,
        actor: &str,
        action: &str,
        target_type: &str,
        target_id: &str,
        detail: serde_json::Value,
        client_ip: &str,
    ) -> Result<(), StoreError> {
        let path = self.path.clone();
        let actor = actor.to_string();
        let action = action.to_string();
        let target_type = target_type.to_string();
        let target_id = target_id.to_string();
        let detail_json = serde_json::to_string(&detail)?;
        let client_ip = client_ip.to_string();
        let now = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO admin_audit_log (actor, action, target_type, target_id, detail_json,
                                              client_ip, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![actor, action, target_type, target_id, detail_json, client_ip, now],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_audit_logs(&self, limit: usize) -> Result<Vec<AuditLogRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<AuditLogRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, actor, action, target_type, target_id, detail_json, client_ip,
                        created_at_ms
                 FROM admin_audit_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
                Ok(AuditLogRecord {
                    id: row.get(0)?,
                    actor: row.get(1)?,
                    action: row.get(2)?,
                    target_type: row.get(3)?,
                    target_id: row.get(4)?,
                    detail_json: row.get(5)?,
                    client_ip: row.get(6)?,
                    created_at_ms: row.get(7)?,
                })
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await?
    }
}

fn map_api_key_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        key_id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        key_prefix: row.get(3)?,
        key_hash: row.get(4)?,
        status: row.get(5)?,
        scopes: row.get(6)?,
        expires_at_ms: row.get(7)?,
        created_at_ms: row.get(8)?,
        updated_at_ms: row.get(9)?,
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tenant (
            tenant_id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            plan TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_key (
            key_id TEXT PRIMARY KEY NOT NULL,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            key_prefix TEXT NOT NULL,
            key_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            scopes TEXT NOT NULL,
            expires_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_api_key_hash
            ON api_key(key_hash);
        CREATE INDEX IF NOT EXISTS idx_api_key_tenant_status
            ON api_key(tenant_id, status);

        CREATE TABLE IF NOT EXISTS quota_policy (
            tenant_id TEXT PRIMARY KEY NOT NULL,
            rpm_limit INTEGER NOT NULL,
            tpm_limit INTEGER,
            monthly_token_cap INTEGER,
            burst_multiplier REAL NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS upstream_key_secret (
            upstream_key_id TEXT PRIMARY KEY NOT NULL,
            provider TEXT NOT NULL,
            status TEXT NOT NULL,
            key_version INTEGER NOT NULL,
            iv BLOB NOT NULL,
            ciphertext BLOB NOT NULL,
            tag BLOB NOT NULL,
            aad TEXT,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS admin_audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            detail_json TEXT NOT NULL,
            client_ip TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_admin_audit_log_created
            ON admin_audit_log(created_at_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
