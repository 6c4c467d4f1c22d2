use serde_json::Value;
use sqlx::Row;
use ulid::Ulid;

use warden_contracts::canonical;
use warden_policy::ValidationIssue;

use crate::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct PolicyRecord {
    pub policy_id: String,
    pub env_id: String,
    pub name: String,
    pub version: i64,
    pub status: String,
    pub spec: Value,
}

/// The currently published policy of an environment.
#[derive(Debug, Clone)]
pub struct PublishedPolicy {
    pub policy_id: String,
    pub env_id: String,
    pub version: i64,
    pub spec: Value,
    pub hash: String,
}

/// An immutable `(policy_id, version)` snapshot.
#[derive(Debug, Clone)]
pub struct PolicyVersion {
    pub policy_id: String,
    pub version: i64,
    pub spec: Value,
    pub hash: String,
}

#[derive(Debug)]
pub enum PolicyWriteError {
    NotFound,
    Invalid(Vec<ValidationIssue>),
    Store(StoreError),
}

impl std::fmt::Display for PolicyWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyWriteError::NotFound => write!(f, "policy not found"),
            PolicyWriteError::Invalid(issues) => {
                write!(f, "policy spec is invalid ({} issues)", issues.len())
            }
            PolicyWriteError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for PolicyWriteError {}

impl From<StoreError> for PolicyWriteError {
    fn from(value: StoreError) -> Self {
        PolicyWriteError::Store(value)
    }
}

impl From<sqlx::Error> for PolicyWriteError {
    fn from(value: sqlx::Error) -> Self {
        PolicyWriteError::Store(StoreError::Sqlx(value))
    }
}

impl Store {
    pub async fn create_draft(
        &self,
        env_id: &str,
        name: &str,
    ) -> Result<PolicyRecord, StoreError> {
        let policy_id = Ulid::new().to_string();
        tokio::time::timeout(
            self.op_timeout(),
            sqlx::query("INSERT INTO warden_policies (policy_id, env_id, name) VALUES ($1, $2, $3)")
                .bind(&policy_id)
                .bind(env_id)
                .bind(name)
                .execute(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(PolicyRecord {
            policy_id,
            env_id: env_id.to_string(),
            name: name.to_string(),
            version: 0,
            status: "draft".to_string(),
            spec: serde_json::json!({}),
        })
    }

    /// Replace the working spec of a draft. The document must already pass
    /// validation; drafts never hold specs the evaluator could choke on.
    /// Published rows are not editable in place: `get_published` serves
    /// their `spec_json`, which must stay consistent with the stored hash
    /// and version.
    pub async fn save_draft(&self, policy_id: &str, spec: &Value) -> Result<(), PolicyWriteError> {
        if let Err(issues) = warden_policy::parse_validated(spec) {
            return Err(PolicyWriteError::Invalid(issues));
        }

        let result = tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(
                "UPDATE warden_policies SET spec_json = $2 \
                 WHERE policy_id = $1 AND status = 'draft'",
            )
            .bind(policy_id)
            .bind(spec)
            .execute(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)
        .map_err(PolicyWriteError::from)??;

        if result.rows_affected() == 0 {
            return Err(PolicyWriteError::NotFound);
        }
        Ok(())
    }

    /// Validate, hash, and publish the working spec as the next immutable
    /// version. The row lock serializes racing publishes so versions stay
    /// strictly monotonic with no gaps per policy id.
    pub async fn publish(
        &self,
        policy_id: &str,
        published_by: &str,
    ) -> Result<PublishedPolicy, PolicyWriteError> {
        let mut tx = tokio::time::timeout(self.op_timeout(), self.pool().begin())
            .await
            .map_err(|_| StoreError::Timeout)
            .map_err(PolicyWriteError::from)??;

        let row = tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(
                "SELECT env_id, version, spec_json FROM warden_policies \
                 WHERE policy_id = $1 FOR UPDATE",
            )
            .bind(policy_id)
            .fetch_optional(&mut *tx),
        )
        .await
        .map_err(|_| StoreError::Timeout)
        .map_err(PolicyWriteError::from)??;

        let Some(row) = row else {
            return Err(PolicyWriteError::NotFound);
        };

        let env_id: String = row.try_get("env_id")?;
        let version: i64 = row.try_get("version")?;
        let spec: Value = row.try_get("spec_json")?;

        if let Err(issues) = warden_policy::parse_validated(&spec) {
            return Err(PolicyWriteError::Invalid(issues));
        }

        // Hash only after the spec has passed validation.
        let hash = canonical::hash_canonical_json(&spec);
        let next_version = version + 1;

        tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(
                "UPDATE warden_policies SET version = $2, status = 'published', \
                 spec_hash = $3, published_at = now() WHERE policy_id = $1",
            )
            .bind(policy_id)
            .bind(next_version)
            .bind(&hash)
            .execute(&mut *tx),
        )
        .await
        .map_err(|_| StoreError::Timeout)
        .map_err(PolicyWriteError::from)??;

        tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(
                "INSERT INTO warden_policy_versions \
                 (policy_id, version, spec_json, spec_hash, published_by) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(policy_id)
            .bind(next_version)
            .bind(&spec)
            .bind(&hash)
            .bind(published_by)
            .execute(&mut *tx),
        )
        .await
        .map_err(|_| StoreError::Timeout)
        .map_err(PolicyWriteError::from)??;

        tokio::time::timeout(self.op_timeout(), tx.commit())
            .await
            .map_err(|_| StoreError::Timeout)
            .map_err(PolicyWriteError::from)??;

        Ok(PublishedPolicy {
            policy_id: policy_id.to_string(),
            env_id,
            version: next_version,
            spec,
            hash,
        })
    }

    /// The policy new sessions lock onto: the highest-versioned published
    /// policy of the environment.
    pub async fn get_published(
        &self,
        env_id: &str,
    ) -> Result<Option<PublishedPolicy>, StoreError> {
        let row = tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(
                "SELECT policy_id, version, spec_json, spec_hash FROM warden_policies \
                 WHERE env_id = $1 AND status = 'published' \
                 ORDER BY version DESC LIMIT 1",
            )
            .bind(env_id)
            .fetch_optional(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        let hash: Option<String> = row.try_get("spec_hash")?;
        let Some(hash) = hash else {
            return Err(StoreError::Corrupt("published policy without spec_hash"));
        };

        Ok(Some(PublishedPolicy {
            policy_id: row.try_get("policy_id")?,
            env_id: env_id.to_string(),
            version: row.try_get("version")?,
            spec: row.try_get("spec_json")?,
            hash,
        }))
    }

    /// Exact immutable spec for a locked `(policy_id, version)` pair.
    pub async fn get_by_id_and_version(
        &self,
        policy_id: &str,
        version: i64,
    ) -> Result<Option<PolicyVersion>, StoreError> {
        let row = tokio::time::timeout(
            self.op_timeout(),
            sqlx::query(
                "SELECT spec_json, spec_hash FROM warden_policy_versions \
                 WHERE policy_id = $1 AND version = $2",
            )
            .bind(policy_id)
            .bind(version)
            .fetch_optional(self.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(PolicyVersion {
            policy_id: policy_id.to_string(),
            version,
            spec: row.try_get("spec_json")?,
            hash: row.try_get("spec_hash")?,
        }))
    }
}
