use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use ulid::Ulid;
use warden_contracts::Reason;

mod policies;
mod sessions;

pub use policies::{PolicyRecord, PolicyVersion, PolicyWriteError, PublishedPolicy};
pub use sessions::{NewSession, SessionMutation, SessionRow};

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
    Corrupt(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
            StoreError::Corrupt(what) => write!(f, "stored row failed to decode: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

/// All persistence behind the decision path: policies and their immutable
/// versions, sessions, audit entries, API keys, and rate windows.
#[derive(Clone)]
pub struct Store {
    pool: sqlx::PgPool,
    timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: String,
    pub env_id: String,
    pub key_hash: String,
    pub revoked: bool,
}

/// One audit row, written exactly once per decision.
pub struct AuditEntry<'a> {
    pub session_row_id: &'a str,
    pub ts_ms: i64,
    pub tool_name: &'a str,
    pub action_type: Option<&'a str>,
    pub redacted_payload: &'a Value,
    pub allowed: bool,
    pub reasons: &'a [Reason],
    pub error_code: Option<&'a str>,
    pub policy_version_used: i64,
    pub policy_hash: &'a str,
    pub state_before: &'a str,
    pub state_after: &'a str,
    pub counters_before: &'a BTreeMap<String, i64>,
    pub counters_after: &'a BTreeMap<String, i64>,
    pub execution_duration_ms: i64,
}

impl Store {
    pub async fn connect(db_dsn: &str, timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_dsn),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self { pool, timeout })
    }

    pub async fn connect_and_migrate(
        db_dsn: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_dsn, timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub(crate) fn op_timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn create_environment(&self, name: &str) -> Result<String, StoreError> {
        let env_id = Ulid::new().to_string();
        tokio::time::timeout(
            self.timeout,
            sqlx::query("INSERT INTO warden_environments (env_id, name) VALUES ($1, $2)")
                .bind(&env_id)
                .bind(name)
                .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(env_id)
    }

    /// Seed a key row. Only the prefix and the hex SHA-256 of the secret are
    /// stored.
    pub async fn insert_api_key(
        &self,
        env_id: &str,
        key_prefix: &str,
        key_hash: &str,
    ) -> Result<String, StoreError> {
        let id = Ulid::new().to_string();
        tokio::time::timeout(
            self.timeout,
            sqlx::query(
                "INSERT INTO warden_api_keys (id, env_id, key_prefix, key_hash) VALUES ($1, $2, $3, $4)",
            )
            .bind(&id)
            .bind(env_id)
            .bind(key_prefix)
            .bind(key_hash)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(id)
    }

    pub async fn revoke_api_key(&self, id: &str) -> Result<(), StoreError> {
        tokio::time::timeout(
            self.timeout,
            sqlx::query("UPDATE warden_api_keys SET revoked_at = now() WHERE id = $1")
                .bind(id)
                .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    /// At most `max` rows sharing the presented prefix. Revoked rows are
    /// included so a matching revoked key can be reported as revoked rather
    /// than unknown.
    pub async fn find_api_key_candidates(
        &self,
        key_prefix: &str,
        max: i64,
    ) -> Result<Vec<ApiKeyRow>, StoreError> {
        let rows = tokio::time::timeout(
            self.timeout,
            sqlx::query(
                "SELECT id, env_id, key_hash, revoked_at IS NOT NULL AS revoked \
                 FROM warden_api_keys WHERE key_prefix = $1 ORDER BY created_at LIMIT $2",
            )
            .bind(key_prefix)
            .bind(max)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ApiKeyRow {
                id: row.try_get("id")?,
                env_id: row.try_get("env_id")?,
                key_hash: row.try_get("key_hash")?,
                revoked: row.try_get("revoked")?,
            });
        }
        Ok(out)
    }

    /// Atomic upsert-and-increment of one minute window; returns the
    /// post-increment count so enforcement cannot double-spend the last
    /// token under concurrency.
    pub async fn increment_rate_window(
        &self,
        api_key_id: &str,
        window_start_ms: i64,
    ) -> Result<i64, StoreError> {
        let row = tokio::time::timeout(
            self.timeout,
            sqlx::query(
                "INSERT INTO warden_rate_windows (api_key_id, window_start, request_count) \
                 VALUES ($1, $2, 1) \
                 ON CONFLICT (api_key_id, window_start) \
                 DO UPDATE SET request_count = warden_rate_windows.request_count + 1 \
                 RETURNING request_count",
            )
            .bind(api_key_id)
            .bind(window_start_ms)
            .fetch_one(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(row.try_get("request_count")?)
    }

    /// Append one audit entry. Uses the shared pool rather than the
    /// session's transaction: the record must survive even when the state
    /// write is abandoned.
    pub async fn append_audit(&self, entry: &AuditEntry<'_>) -> Result<String, StoreError> {
        let audit_id = Ulid::new().to_string();
        let reasons_json =
            serde_json::to_value(entry.reasons).unwrap_or_else(|_| serde_json::json!([]));
        let counters_before = serde_json::to_value(entry.counters_before)
            .unwrap_or_else(|_| serde_json::json!({}));
        let counters_after = serde_json::to_value(entry.counters_after)
            .unwrap_or_else(|_| serde_json::json!({}));
        let decision = if entry.allowed { "allowed" } else { "blocked" };

        tokio::time::timeout(
            self.timeout,
            sqlx::query(
                "INSERT INTO warden_audit_entries (\
                     audit_id, execution_session_id, ts_ms, tool_name, action_type, \
                     redacted_payload_json, decision, reasons_json, error_code, \
                     policy_version_used, policy_hash, state_before, state_after, \
                     counters_before_json, counters_after_json, execution_duration_ms\
                 ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)",
            )
            .bind(&audit_id)
            .bind(entry.session_row_id)
            .bind(entry.ts_ms)
            .bind(entry.tool_name)
            .bind(entry.action_type)
            .bind(entry.redacted_payload)
            .bind(decision)
            .bind(&reasons_json)
            .bind(entry.error_code)
            .bind(entry.policy_version_used)
            .bind(entry.policy_hash)
            .bind(entry.state_before)
            .bind(entry.state_after)
            .bind(&counters_before)
            .bind(&counters_after)
            .bind(entry.execution_duration_ms)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(audit_id)
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
