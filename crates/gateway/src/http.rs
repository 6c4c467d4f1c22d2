use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use warden_auth::{CandidateKey, KeyPolicy, KeyRejection};
use warden_contracts::{ActionType, PolicySpec, Reason, ReasonCode};
use warden_ledger::{AuditEntry, NewSession, SessionMutation, Store, StoreError};
use warden_policy::{EvalRequest, evaluate, redact};

use crate::config::{GatewayConfig, StartupError};
use crate::metrics;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    store: Store,
}

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let store = Store::connect_and_migrate(
        &config.db_dsn,
        Duration::from_millis(config.db_timeout_ms),
    )
    .await
    .map_err(|_| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: "failed to initialize decision store".to_string(),
    })?;

    Ok(router_with_store(config, store))
}

/// Router over an already-connected store; the e2e harness uses this to
/// point the gateway at a schema-isolated database.
pub fn router_with_store(config: GatewayConfig, store: Store) -> Router {
    let max_payload_bytes = config.max_payload_bytes;
    let state = AppState { config, store };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/runtime-check", post(runtime_check).options(preflight))
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint() -> Response {
    match metrics::render() {
        Ok((buffer, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], buffer).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "content-type, x-api-key, x-request-id",
            ),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeCheckRequest {
    session_id: String,
    agent_id: String,
    tool_name: String,
    #[serde(default)]
    action_type: Option<ActionType>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecisionResponse {
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<ReasonCode>,
    decision_reasons: Vec<Reason>,
    policy_version_used: i64,
    policy_hash: String,
    state_before: String,
    state_after: String,
    counters: BTreeMap<String, i64>,
    execution_duration_ms: i64,
}

/// Shared shape of every non-200 response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FailureBody {
    allowed: bool,
    error_code: ReasonCode,
    decision_reasons: Vec<Reason>,
    execution_duration_ms: i64,
}

#[derive(Debug)]
struct Failure {
    status: StatusCode,
    code: ReasonCode,
    message: String,
    retry_after_secs: Option<u32>,
}

fn fail(status: StatusCode, code: ReasonCode, message: impl Into<String>) -> Failure {
    Failure {
        status,
        code,
        message: message.into(),
        retry_after_secs: None,
    }
}

/// Every store error past input validation is fail-closed.
fn store_failure(err: StoreError) -> Failure {
    match err {
        StoreError::Corrupt(_) => fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            ReasonCode::SessionCorrupted,
            "stored state failed to decode",
        ),
        StoreError::Timeout | StoreError::Sqlx(_) => fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            ReasonCode::DatabaseUnavailable,
            "decision store unavailable",
        ),
    }
}

async fn runtime_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RuntimeCheckRequest>, JsonRejection>,
) -> Response {
    let t0 = Instant::now();
    let request_id = extract_request_id(&headers);
    let deadline = Duration::from_millis(state.config.request_deadline_ms.max(1));

    let outcome = match tokio::time::timeout(
        deadline,
        handle_runtime_check(&state, &headers, body, &request_id, t0),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(request_id = %request_id, "gateway.deadline_exceeded");
            Err(fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                ReasonCode::InternalError,
                "request deadline exceeded",
            ))
        }
    };

    let duration_ms = duration_ms_since(t0);
    let response = match outcome {
        Ok(decision) => {
            metrics::observe_decision(
                decision.allowed,
                decision.error_code.map(ReasonCode::as_str).unwrap_or(""),
            );
            let mut response = (StatusCode::OK, Json(decision)).into_response();
            allow_any_origin(&mut response);
            response
        }
        Err(failure) => failure_response(&failure, duration_ms),
    };

    metrics::observe_http_request(
        "/runtime-check",
        "POST",
        response.status().as_u16(),
        t0.elapsed(),
    );
    response
}

async fn handle_runtime_check(
    state: &AppState,
    headers: &HeaderMap,
    body: Result<Json<RuntimeCheckRequest>, JsonRejection>,
    request_id: &str,
    t0: Instant,
) -> Result<DecisionResponse, Failure> {
    if let Some(declared) = content_length(headers)
        && declared > state.config.max_payload_bytes as u64
    {
        return Err(fail(
            StatusCode::PAYLOAD_TOO_LARGE,
            ReasonCode::PayloadTooLarge,
            "declared content-length exceeds the payload ceiling",
        ));
    }

    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            fail(
                StatusCode::UNAUTHORIZED,
                ReasonCode::InvalidApiKey,
                "missing x-api-key header",
            )
        })?;

    let key_policy = KeyPolicy {
        prefix_length: state.config.api_key_prefix_length,
        min_length: state.config.api_key_min_length,
    };
    let prefix = warden_auth::key_prefix(presented, &key_policy).ok_or_else(|| {
        fail(
            StatusCode::UNAUTHORIZED,
            ReasonCode::InvalidApiKey,
            "api key is malformed",
        )
    })?;

    let candidates = state
        .store
        .find_api_key_candidates(prefix, state.config.api_key_max_candidates)
        .await
        .map_err(store_failure)?
        .into_iter()
        .map(|row| CandidateKey {
            id: row.id,
            env_id: row.env_id,
            key_hash: row.key_hash,
            revoked: row.revoked,
        })
        .collect::<Vec<_>>();

    let key = warden_auth::verify_key(presented, &candidates, &key_policy).map_err(
        |rejection| match rejection {
            KeyRejection::InvalidApiKey => fail(
                StatusCode::UNAUTHORIZED,
                ReasonCode::InvalidApiKey,
                "api key is not recognized",
            ),
            KeyRejection::ApiKeyRevoked => fail(
                StatusCode::UNAUTHORIZED,
                ReasonCode::ApiKeyRevoked,
                "api key has been revoked",
            ),
        },
    )?;

    let now_ms = unix_epoch_ms_now();
    let window_start = rate_window_start(now_ms);
    let window_count = state
        .store
        .increment_rate_window(&key.id, window_start)
        .await
        .map_err(store_failure)?;
    if window_count > state.config.rate_limit_requests_per_minute {
        metrics::inc_rate_limited();
        return Err(Failure {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: ReasonCode::RateLimited,
            message: "per-key request quota exhausted for this minute".to_string(),
            retry_after_secs: Some(60),
        });
    }

    let Json(request) = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            fail(
                StatusCode::PAYLOAD_TOO_LARGE,
                ReasonCode::PayloadTooLarge,
                "request body exceeds the payload ceiling",
            )
        } else {
            fail(
                StatusCode::BAD_REQUEST,
                ReasonCode::InvalidInput,
                "request body is not a valid JSON document of the expected shape",
            )
        }
    })?;
    validate_request(&request)?;
    let payload = request.payload.clone().unwrap_or_else(|| serde_json::json!({}));

    let published = state
        .store
        .get_published(&key.env_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| {
            fail(
                StatusCode::NOT_FOUND,
                ReasonCode::PolicyNotFound,
                "no published policy for this environment",
            )
        })?;
    let published_spec: PolicySpec = serde_json::from_value(published.spec.clone())
        .map_err(|_| {
            fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                ReasonCode::InternalError,
                "published policy failed to parse",
            )
        })?;

    // Creation freezes the policy pair; later requests reuse it even after
    // re-publishes.
    let initial_counters = published_spec.initial_counters();
    let defaults = NewSession {
        agent_id: &request.agent_id,
        policy_id: &published.policy_id,
        policy_version_locked: published.version,
        initial_state: published_spec.initial_state(),
        counters: &initial_counters,
        metadata: request.metadata.as_ref(),
    };
    let (session, _created) = state
        .store
        .get_or_create_session(&key.env_id, &request.session_id, &defaults)
        .await
        .map_err(store_failure)?;

    let mut tx = tokio::time::timeout(
        Duration::from_millis(state.config.db_timeout_ms),
        state.store.pool().begin(),
    )
    .await
    .map_err(|_| store_failure(StoreError::Timeout))?
    .map_err(|err| store_failure(StoreError::Sqlx(err)))?;

    // Row-level write lock held until the state write commits; evaluation,
    // audit, and mutation form one critical section per session.
    let session = state
        .store
        .lock_session(&mut tx, &session.id)
        .await
        .map_err(store_failure)?;

    let locked = state
        .store
        .get_by_id_and_version(&session.policy_id, session.policy_version_locked)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| {
            fail(
                StatusCode::NOT_FOUND,
                ReasonCode::PolicyNotFound,
                "locked policy version is no longer retrievable",
            )
        })?;
    let locked_spec: PolicySpec = serde_json::from_value(locked.spec.clone()).map_err(|_| {
        fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            ReasonCode::InternalError,
            "locked policy version failed to parse",
        )
    })?;

    let snapshot = session.snapshot();
    let eval = evaluate(
        &locked_spec,
        &snapshot,
        &EvalRequest {
            tool_name: &request.tool_name,
            action_type: request.action_type,
            payload: &payload,
        },
        now_ms,
    );

    tracing::info!(
        request_id = %request_id,
        env_id = %key.env_id,
        session_id = %request.session_id,
        tool_name = %request.tool_name,
        allowed = eval.allowed,
        error_code = eval.error_code.map(ReasonCode::as_str).unwrap_or(""),
        policy_version = session.policy_version_locked,
        "gateway.runtime_check"
    );

    let redacted = redact(&payload);
    let audit = AuditEntry {
        session_row_id: &session.id,
        ts_ms: now_ms,
        tool_name: &request.tool_name,
        action_type: request.action_type.map(ActionType::as_str),
        redacted_payload: &redacted,
        allowed: eval.allowed,
        reasons: &eval.reasons,
        error_code: eval.error_code.map(ReasonCode::as_str),
        policy_version_used: session.policy_version_locked,
        policy_hash: &locked.hash,
        state_before: &snapshot.current_state,
        state_after: &eval.new_state,
        counters_before: &snapshot.counters,
        counters_after: &eval.new_counters,
        execution_duration_ms: duration_ms_since(t0),
    };
    // The decision is already made; an audit failure is an operator problem,
    // not a caller problem.
    if let Err(err) = state.store.append_audit(&audit).await {
        tracing::error!(
            request_id = %request_id,
            session_id = %request.session_id,
            error = %err,
            "gateway.audit_append_failed"
        );
    }

    if eval.allowed {
        let history = appended_history(
            &snapshot.tool_calls_history,
            &request.tool_name,
            state.config.max_history_length,
        );
        let mut last_times = snapshot.last_tool_call_times.clone();
        last_times.insert(request.tool_name.clone(), now_ms);

        let mutation = SessionMutation {
            current_state: &eval.new_state,
            counters: &eval.new_counters,
            tool_calls_history: &history,
            tool_call_counts: &eval.new_tool_call_counts,
            last_tool_call_times: &last_times,
        };
        let write = async {
            state
                .store
                .update_session_state(&mut tx, &session.id, &mutation)
                .await?;
            tx.commit().await.map_err(StoreError::Sqlx)
        };
        // The caller has already been told `allowed`; the old state simply
        // remains in place for the next call if this write is lost.
        if let Err(err) = write.await {
            tracing::error!(
                request_id = %request_id,
                session_id = %request.session_id,
                error = %err,
                "gateway.session_state_write_failed"
            );
        }
    } else if let Err(err) = tx.commit().await {
        tracing::warn!(
            request_id = %request_id,
            session_id = %request.session_id,
            error = %err,
            "gateway.session_lock_release_failed"
        );
    }

    Ok(DecisionResponse {
        allowed: eval.allowed,
        error_code: eval.error_code,
        decision_reasons: eval.reasons,
        policy_version_used: session.policy_version_locked,
        policy_hash: locked.hash,
        state_before: snapshot.current_state,
        state_after: eval.new_state,
        counters: eval.new_counters,
        execution_duration_ms: duration_ms_since(t0),
    })
}

fn failure_response(failure: &Failure, duration_ms: i64) -> Response {
    let body = FailureBody {
        allowed: false,
        error_code: failure.code,
        decision_reasons: vec![Reason::new(failure.code, failure.message.clone())],
        execution_duration_ms: duration_ms,
    };

    let mut response = (failure.status, Json(body)).into_response();
    if let Some(secs) = failure.retry_after_secs {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    allow_any_origin(&mut response);
    response
}

fn allow_any_origin(response: &mut Response) {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
}

fn validate_request(request: &RuntimeCheckRequest) -> Result<(), Failure> {
    for (field, value) in [
        ("sessionId", &request.session_id),
        ("agentId", &request.agent_id),
        ("toolName", &request.tool_name),
    ] {
        if value.is_empty() || value.len() > 256 {
            return Err(fail(
                StatusCode::BAD_REQUEST,
                ReasonCode::InvalidInput,
                format!("{} must be between 1 and 256 characters", field),
            ));
        }
    }

    if let Some(payload) = request.payload.as_ref()
        && !payload.is_object()
    {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            ReasonCode::InvalidInput,
            "payload must be a JSON object",
        ));
    }

    if let Some(metadata) = request.metadata.as_ref()
        && !metadata.is_object()
    {
        return Err(fail(
            StatusCode::BAD_REQUEST,
            ReasonCode::InvalidInput,
            "metadata must be a JSON object",
        ));
    }

    Ok(())
}

/// History is tail-preserving: on overflow the oldest entries drop.
fn appended_history(history: &[String], tool_name: &str, max_len: usize) -> Vec<String> {
    let mut out = history.to_vec();
    out.push(tool_name.to_string());
    if out.len() > max_len {
        let overflow = out.len() - max_len;
        out.drain(..overflow);
    }
    out
}

fn rate_window_start(now_ms: i64) -> i64 {
    now_ms.div_euclid(60_000) * 60_000
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn unix_epoch_ms_now() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration.as_millis().min(i64::MAX as u128) as i64
}

fn duration_ms_since(t0: Instant) -> i64 {
    t0.elapsed().as_millis().min(i64::MAX as u128) as i64
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> RuntimeCheckRequest {
        RuntimeCheckRequest {
            session_id: "s1".to_string(),
            agent_id: "agent-7".to_string(),
            tool_name: "lookup".to_string(),
            action_type: None,
            payload: Some(serde_json::json!({})),
            metadata: None,
        }
    }

    #[test]
    fn rate_window_starts_on_minute_boundaries() {
        assert_eq!(rate_window_start(0), 0);
        assert_eq!(rate_window_start(59_999), 0);
        assert_eq!(rate_window_start(60_000), 60_000);
        assert_eq!(rate_window_start(1_700_000_123_456), 1_700_000_100_000);
    }

    #[test]
    fn history_append_is_tail_preserving() {
        let history = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let out = appended_history(&history, "d", 3);
        assert_eq!(out, vec!["b".to_string(), "c".to_string(), "d".to_string()]);

        let out = appended_history(&history, "d", 10);
        assert_eq!(out.len(), 4);
        assert_eq!(out.last().map(String::as_str), Some("d"));
    }

    #[test]
    fn request_field_bounds_are_enforced() {
        assert!(validate_request(&valid_request()).is_ok());

        let mut request = valid_request();
        request.session_id = String::new();
        let err = validate_request(&request).unwrap_err();
        assert_eq!(err.code, ReasonCode::InvalidInput);

        let mut request = valid_request();
        request.tool_name = "t".repeat(257);
        assert!(validate_request(&request).is_err());

        let mut request = valid_request();
        request.payload = Some(serde_json::json!([1, 2]));
        assert!(validate_request(&request).is_err());

        let mut request = valid_request();
        request.metadata = Some(serde_json::json!("notes"));
        assert!(validate_request(&request).is_err());
    }

    #[test]
    fn request_id_is_sanitized_with_ulid_fallback() {
        assert_eq!(
            sanitize_request_id("req-123_ok.v2"),
            Some("req-123_ok.v2".to_string())
        );
        assert_eq!(sanitize_request_id("!!!"), None);

        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("abc??def"));
        assert_eq!(extract_request_id(&headers), "abcdef");

        let generated = extract_request_id(&HeaderMap::new());
        assert_eq!(generated.len(), 26);
    }

    #[test]
    fn failure_response_carries_shared_shape_and_retry_hint() {
        let failure = Failure {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: ReasonCode::RateLimited,
            message: "quota exhausted".to_string(),
            retry_after_secs: Some(60),
        };

        let response = failure_response(&failure, 3);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("60")
        );
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }

    #[test]
    fn decision_response_serializes_with_wire_field_names() {
        let decision = DecisionResponse {
            allowed: false,
            error_code: Some(ReasonCode::MaxCallsExceeded),
            decision_reasons: vec![Reason::new(ReasonCode::MaxCallsExceeded, "limit hit")],
            policy_version_used: 3,
            policy_hash: "ab".repeat(32),
            state_before: "verified".to_string(),
            state_after: "verified".to_string(),
            counters: BTreeMap::new(),
            execution_duration_ms: 4,
        };

        let value = serde_json::to_value(&decision).expect("serialize decision");
        assert_eq!(value["errorCode"], "MAX_CALLS_EXCEEDED");
        assert_eq!(value["policyVersionUsed"], 3);
        assert_eq!(value["decisionReasons"][0]["code"], "MAX_CALLS_EXCEEDED");
        assert!(value.get("stateBefore").is_some());
        assert!(value.get("executionDurationMs").is_some());
    }
}
