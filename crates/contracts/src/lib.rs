use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod canonical;

/// Stable machine-readable code attached to every decision reason and to
/// every failure response. Blocking codes double as `errorCode`; the two
/// informational codes never block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    PolicyNotFound,
    PolicyInvalid,
    UnknownToolDenied,
    ToolExplicitlyDenied,
    SideEffectNotAllowed,
    RequiredStateNotMet,
    RequiredToolsNotCalled,
    MaxCallsExceeded,
    CooldownActive,
    CounterLimitExceeded,
    RequiredFieldMissing,
    ForbiddenFieldPresent,
    RegexMatchDenied,
    RegexMatchRequired,
    GuardConditionFailed,
    InvalidApiKey,
    ApiKeyRevoked,
    RateLimited,
    InvalidInput,
    PayloadTooLarge,
    InternalError,
    DatabaseUnavailable,
    SessionCorrupted,
    Allowed,
    StateTransition,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::PolicyNotFound => "POLICY_NOT_FOUND",
            ReasonCode::PolicyInvalid => "POLICY_INVALID",
            ReasonCode::UnknownToolDenied => "UNKNOWN_TOOL_DENIED",
            ReasonCode::ToolExplicitlyDenied => "TOOL_EXPLICITLY_DENIED",
            ReasonCode::SideEffectNotAllowed => "SIDE_EFFECT_NOT_ALLOWED",
            ReasonCode::RequiredStateNotMet => "REQUIRED_STATE_NOT_MET",
            ReasonCode::RequiredToolsNotCalled => "REQUIRED_TOOLS_NOT_CALLED",
            ReasonCode::MaxCallsExceeded => "MAX_CALLS_EXCEEDED",
            ReasonCode::CooldownActive => "COOLDOWN_ACTIVE",
            ReasonCode::CounterLimitExceeded => "COUNTER_LIMIT_EXCEEDED",
            ReasonCode::RequiredFieldMissing => "REQUIRED_FIELD_MISSING",
            ReasonCode::ForbiddenFieldPresent => "FORBIDDEN_FIELD_PRESENT",
            ReasonCode::RegexMatchDenied => "REGEX_MATCH_DENIED",
            ReasonCode::RegexMatchRequired => "REGEX_MATCH_REQUIRED",
            ReasonCode::GuardConditionFailed => "GUARD_CONDITION_FAILED",
            ReasonCode::InvalidApiKey => "INVALID_API_KEY",
            ReasonCode::ApiKeyRevoked => "API_KEY_REVOKED",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::InvalidInput => "INVALID_INPUT",
            ReasonCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ReasonCode::InternalError => "INTERNAL_ERROR",
            ReasonCode::DatabaseUnavailable => "DATABASE_UNAVAILABLE",
            ReasonCode::SessionCorrupted => "SESSION_CORRUPTED",
            ReasonCode::Allowed => "ALLOWED",
            ReasonCode::StateTransition => "STATE_TRANSITION",
        }
    }

    /// `ALLOWED` and `STATE_TRANSITION` appear in reason chains but never
    /// as an `errorCode`.
    pub fn is_informational(self) -> bool {
        matches!(self, ReasonCode::Allowed | ReasonCode::StateTransition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Read,
    Write,
    SideEffect,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Read => "read",
            ActionType::Write => "write",
            ActionType::SideEffect => "side_effect",
        }
    }
}

/// One `{jsonPath, pattern}` regex constraint on a payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegexConstraint {
    pub json_path: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRule {
    pub tool_name: String,
    pub effect: Effect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_calls_per_session: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_previous_tool_calls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_if_fields_present: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_if_regex_match: Option<Vec<RegexConstraint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_only_if_regex_match: Option<Vec<RegexConstraint>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from_state: String,
    pub to_state: String,
    pub triggered_by_tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_tools_called_before: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sets_counters: Option<BTreeMap<String, i64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachine {
    pub states: Vec<String>,
    pub initial_state: String,
    pub transitions: Vec<Transition>,
}

fn default_counter_scope() -> String {
    "session".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterDef {
    pub name: String,
    #[serde(default = "default_counter_scope")]
    pub scope: String,
    pub initial_value: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,
}

/// The declarative policy document. The canonical hash of a spec is computed
/// over its raw JSON form (keys sorted at every depth), never over a
/// re-serialization of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    pub version: String,
    pub default_decision: DefaultDecision,
    pub tool_rules: Vec<ToolRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_machine: Option<StateMachine>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counters: Vec<CounterDef>,
}

/// State a session starts in when the policy declares no state machine.
pub const IMPLICIT_INITIAL_STATE: &str = "initial";

impl PolicySpec {
    pub fn initial_state(&self) -> &str {
        self.state_machine
            .as_ref()
            .map(|sm| sm.initial_state.as_str())
            .unwrap_or(IMPLICIT_INITIAL_STATE)
    }

    pub fn rule_for(&self, tool_name: &str) -> Option<&ToolRule> {
        self.tool_rules.iter().find(|r| r.tool_name == tool_name)
    }

    /// Session counters at creation: every declared counter at its
    /// `initialValue`.
    pub fn initial_counters(&self) -> BTreeMap<String, i64> {
        self.counters
            .iter()
            .map(|c| (c.name.clone(), c.initial_value))
            .collect()
    }
}

/// One entry of a decision's reason chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reason {
    pub code: ReasonCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_ref: Option<String>,
}

impl Reason {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            rule_ref: None,
        }
    }

    pub fn for_rule(
        code: ReasonCode,
        message: impl Into<String>,
        rule_ref: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            rule_ref: Some(rule_ref.into()),
        }
    }
}

/// The mutable portion of a session as seen by the evaluator. Maps are
/// ordered so that serialized output is stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub current_state: String,
    pub counters: BTreeMap<String, i64>,
    pub tool_calls_history: Vec<String>,
    pub tool_call_counts: BTreeMap<String, u32>,
    pub last_tool_call_times: BTreeMap<String, i64>,
}

impl SessionSnapshot {
    pub fn fresh(initial_state: impl Into<String>, counters: BTreeMap<String, i64>) -> Self {
        Self {
            current_state: initial_state.into(),
            counters,
            tool_calls_history: Vec::new(),
            tool_call_counts: BTreeMap::new(),
            last_tool_call_times: BTreeMap::new(),
        }
    }
}

/// Output of one evaluator run. `new_state`, `new_counters` and
/// `new_tool_call_counts` are only meaningful when `allowed` is true;
/// blocked calls must not mutate session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ReasonCode>,
    pub reasons: Vec<Reason>,
    pub new_state: String,
    pub new_counters: BTreeMap<String, i64>,
    pub new_tool_call_counts: BTreeMap<String, u32>,
}
