use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use ulid::Ulid;

use warden_contracts::SessionSnapshot;

use crate::{Store, StoreError};

/// One session row. The five mutable state fields always move together
/// through [`Store::update_session_state`].
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub env_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub policy_id: String,
    pub policy_version_locked: i64,
    pub initial_state: String,
    pub current_state: String,
    pub counters: BTreeMap<String, i64>,
    pub tool_calls_history: Vec<String>,
    pub tool_call_counts: BTreeMap<String, u32>,
    pub last_tool_call_times: BTreeMap<String, i64>,
}

impl SessionRow {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            current_state: self.current_state.clone(),
            counters: self.counters.clone(),
            tool_calls_history: self.tool_calls_history.clone(),
            tool_call_counts: self.tool_call_counts.clone(),
            last_tool_call_times: self.last_tool_call_times.clone(),
        }
    }
}

/// Values frozen into a session at creation, taken from the policy
/// published at the moment of first contact.
pub struct NewSession<'a> {
    pub agent_id: &'a str,
    pub policy_id: &'a str,
    pub policy_version_locked: i64,
    pub initial_state: &'a str,
    pub counters: &'a BTreeMap<String, i64>,
    pub metadata: Option<&'a Value>,
}

/// The atomic post-decision state write.
pub struct SessionMutation<'a> {
    pub current_state: &'a str,
    pub counters: &'a BTreeMap<String, i64>,
    pub tool_calls_history: &'a [String],
    pub tool_call_counts: &'a BTreeMap<String, u32>,
    pub last_tool_call_times: &'a BTreeMap<String, i64>,
}

fn decode_json<T: serde::de::DeserializeOwned>(
    value: Value,
    what: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|_| StoreError::Corrupt(what))
}

fn session_from_row(row: &PgRow) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        id: row.try_get("id")?,
        env_id: row.try_get("env_id")?,
        session_id: row.try_get("session_id")?,
        agent_id: row.try_get("agent_id")?,
        policy_id: row.try_get("policy_id")?,
        policy_version_locked: row.try_get("policy_version_locked")?,
        initial_state: row.try_get("initial_state")?,
        current_state: row.try_get("current_state")?,
        counters: decode_json(row.try_get("counters_json")?, "session counters")?,
        tool_calls_history: decode_json(
            row.try_get("tool_calls_history_json")?,
            "session tool call history",
        )?,
        tool_call_counts: decode_json(
            row.try_get("tool_call_counts_json")?,
            "session tool call counts",
        )?,
        last_tool_call_times: decode_json(
            row.try_get("last_tool_call_times_json")?,
            "session last tool call times",
        )?,
    })
}

const SESSION_COLUMNS: &str = "id, env_id, session_id, agent_id, policy_id, \
    policy_version_locked, initial_state, current_state, counters_json, \
    tool_calls_history_json, tool_call_counts_json, last_tool_call_times_json";

impl Store {
    /// Idempotent on `(env_id, session_id)`: racing creators collapse onto
    /// one row and every caller gets the winner back. Runs directly on the
    /// pool so the row is committed before the caller's lock transaction
    /// starts; audit rows reference it immediately.
    pub async fn get_or_create_session(
        &self,
        env_id: &str,
        session_id: &str,
        defaults: &NewSession<'_>,
    ) -> Result<(SessionRow, bool), StoreError> {
        let row_id = Ulid::new().to_string();
        let counters_json =
            serde_json::to_value(defaults.counters).unwrap_or_else(|_| serde_json::json!({}));

        let inserted = tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(
                "INSERT INTO warden_sessions (\
                     id, env_id, session_id, agent_id, policy_id, policy_version_locked, \
                     initial_state, current_state, counters_json, metadata_json\
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8, $9) \
                 ON CONFLICT (env_id, session_id) DO NOTHING",
            )
            .bind(&row_id)
            .bind(env_id)
            .bind(session_id)
            .bind(defaults.agent_id)
            .bind(defaults.policy_id)
            .bind(defaults.policy_version_locked)
            .bind(defaults.initial_state)
            .bind(&counters_json)
            .bind(defaults.metadata)
            .execute(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let created = inserted.rows_affected() == 1;

        let query = format!(
            "SELECT {} FROM warden_sessions WHERE env_id = $1 AND session_id = $2",
            SESSION_COLUMNS
        );
        let row = tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(&query)
                .bind(env_id)
                .bind(session_id)
                .fetch_one(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok((session_from_row(&row)?, created))
    }

    /// Row-level write lock for the rest of the request. Re-reads the row so
    /// the caller evaluates against the state the lock protects.
    ///
    /// NO KEY strength: audit inserts reference this row through a foreign
    /// key (`FOR KEY SHARE`) from another connection while the lock is held.
    /// The session PK never changes, so concurrent mutators still serialize
    /// against each other without blocking those FK checks.
    pub async fn lock_session(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row_id: &str,
    ) -> Result<SessionRow, StoreError> {
        let query = format!(
            "SELECT {} FROM warden_sessions WHERE id = $1 FOR NO KEY UPDATE",
            SESSION_COLUMNS
        );
        let row = tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(&query).bind(row_id).fetch_one(&mut **tx),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        session_from_row(&row)
    }

    /// Move all five state fields in one statement.
    pub async fn update_session_state(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row_id: &str,
        mutation: &SessionMutation<'_>,
    ) -> Result<(), StoreError> {
        let counters =
            serde_json::to_value(mutation.counters).unwrap_or_else(|_| serde_json::json!({}));
        let history = serde_json::to_value(mutation.tool_calls_history)
            .unwrap_or_else(|_| serde_json::json!([]));
        let counts = serde_json::to_value(mutation.tool_call_counts)
            .unwrap_or_else(|_| serde_json::json!({}));
        let last_times = serde_json::to_value(mutation.last_tool_call_times)
            .unwrap_or_else(|_| serde_json::json!({}));

        tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(
                "UPDATE warden_sessions SET current_state = $2, counters_json = $3, \
                 tool_calls_history_json = $4, tool_call_counts_json = $5, \
                 last_tool_call_times_json = $6, updated_at = now() WHERE id = $1",
            )
            .bind(row_id)
            .bind(mutation.current_state)
            .bind(&counters)
            .bind(&history)
            .bind(&counts)
            .bind(&last_times)
            .execute(&mut **tx),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(())
    }
}
