use regex::Regex;
use serde_json::Value;

use warden_contracts::{
    ActionType, DefaultDecision, Effect, Evaluation, PolicySpec, Reason, ReasonCode,
    SessionSnapshot,
};

use crate::guard;
use crate::json_path;

/// The evaluator's view of one tool call.
pub struct EvalRequest<'a> {
    pub tool_name: &'a str,
    pub action_type: Option<ActionType>,
    pub payload: &'a Value,
}

struct Outcome {
    allowed: bool,
    error_code: Option<ReasonCode>,
    reasons: Vec<Reason>,
}

impl Outcome {
    fn new() -> Self {
        Self {
            allowed: true,
            error_code: None,
            reasons: Vec::new(),
        }
    }

    /// The first denying check fixes `error_code`; later failures only
    /// extend the reason chain.
    fn deny(&mut self, reason: Reason) {
        if self.allowed {
            self.allowed = false;
            self.error_code = Some(reason.code);
        }
        self.reasons.push(reason);
    }

    fn note(&mut self, reason: Reason) {
        self.reasons.push(reason);
    }
}

/// Decide one tool call. Pure: no I/O, no clock reads, no randomness; the
/// same inputs always produce byte-identical output, including reason order.
///
/// Checks run in the order fixed by the policy contract. Terminal checks
/// return immediately; non-terminal failing checks accumulate reasons and let
/// later checks add their own. Blocked calls never mutate: the returned
/// state, counters, and call counts equal the snapshot's.
pub fn evaluate(
    policy: &PolicySpec,
    snapshot: &SessionSnapshot,
    request: &EvalRequest<'_>,
    now_ms: i64,
) -> Evaluation {
    let tool = request.tool_name;
    let mut out = Outcome::new();

    // Unknown tool (terminal).
    let Some(rule) = policy.rule_for(tool) else {
        return match policy.default_decision {
            DefaultDecision::Deny => {
                out.deny(Reason::new(
                    ReasonCode::UnknownToolDenied,
                    format!("tool `{}` is not declared by the policy and defaultDecision is deny", tool),
                ));
                blocked(out, snapshot)
            }
            DefaultDecision::Allow => {
                out.note(Reason::new(
                    ReasonCode::Allowed,
                    format!("tool `{}` is not declared by the policy and defaultDecision is allow", tool),
                ));
                let mut counts = snapshot.tool_call_counts.clone();
                *counts.entry(tool.to_string()).or_insert(0) += 1;
                Evaluation {
                    allowed: true,
                    error_code: None,
                    reasons: out.reasons,
                    new_state: snapshot.current_state.clone(),
                    new_counters: snapshot.counters.clone(),
                    new_tool_call_counts: counts,
                }
            }
        };
    };

    // Explicit deny (terminal).
    if rule.effect == Effect::Deny {
        out.deny(Reason::for_rule(
            ReasonCode::ToolExplicitlyDenied,
            format!("tool `{}` is denied by policy rule", tool),
            tool,
        ));
        return blocked(out, snapshot);
    }

    // Side-effect gate (terminal).
    let effective_action = request.action_type.or(rule.action_type);
    if matches!(
        effective_action,
        Some(ActionType::Write) | Some(ActionType::SideEffect)
    ) && rule.effect != Effect::Allow
    {
        out.deny(Reason::for_rule(
            ReasonCode::SideEffectNotAllowed,
            format!(
                "action type `{}` on tool `{}` requires an allow rule",
                effective_action.map(ActionType::as_str).unwrap_or(""),
                tool
            ),
            tool,
        ));
        return blocked(out, snapshot);
    }

    // Required state.
    if let Some(required) = rule.require_state.as_deref()
        && required != snapshot.current_state
    {
        out.deny(Reason::for_rule(
            ReasonCode::RequiredStateNotMet,
            format!(
                "tool `{}` requires state `{}` but session is in `{}`",
                tool, required, snapshot.current_state
            ),
            tool,
        ));
    }

    // Required previous tools.
    if let Some(required_tools) = rule.require_previous_tool_calls.as_deref() {
        for prerequisite in required_tools {
            if !snapshot.tool_calls_history.iter().any(|t| t == prerequisite) {
                out.deny(Reason::for_rule(
                    ReasonCode::RequiredToolsNotCalled,
                    format!("tool `{}` must be called before `{}`", prerequisite, tool),
                    tool,
                ));
            }
        }
    }

    // Max calls per session.
    if let Some(max_calls) = rule.max_calls_per_session {
        let used = snapshot.tool_call_counts.get(tool).copied().unwrap_or(0);
        if used >= max_calls {
            out.deny(Reason::for_rule(
                ReasonCode::MaxCallsExceeded,
                format!(
                    "tool `{}` already called {} of {} allowed times",
                    tool, used, max_calls
                ),
                tool,
            ));
        }
    }

    // Cooldown.
    if let Some(cooldown_ms) = rule.cooldown_ms
        && let Some(last) = snapshot.last_tool_call_times.get(tool).copied()
    {
        let elapsed = now_ms.saturating_sub(last);
        if elapsed < cooldown_ms as i64 {
            let remaining = cooldown_ms as i64 - elapsed;
            out.deny(Reason::for_rule(
                ReasonCode::CooldownActive,
                format!("tool `{}` is cooling down: {} ms remaining", tool, remaining),
                tool,
            ));
        }
    }

    // Required fields.
    if let Some(required_fields) = rule.require_fields.as_deref() {
        for path in required_fields {
            if json_path::resolve(request.payload, path).is_none() {
                out.deny(Reason::for_rule(
                    ReasonCode::RequiredFieldMissing,
                    format!("required field `{}` is missing from payload", path),
                    tool,
                ));
            }
        }
    }

    // Forbidden fields.
    if let Some(forbidden_fields) = rule.deny_if_fields_present.as_deref() {
        for path in forbidden_fields {
            if json_path::resolve(request.payload, path).is_some() {
                out.deny(Reason::for_rule(
                    ReasonCode::ForbiddenFieldPresent,
                    format!("field `{}` must not be present in payload", path),
                    tool,
                ));
            }
        }
    }

    // Deny-if-regex. Patterns that fail to compile are skipped; validation
    // rejects them before publish and an engine error must not fail the call.
    if let Some(constraints) = rule.deny_if_regex_match.as_deref() {
        for constraint in constraints {
            let Ok(re) = Regex::new(&constraint.pattern) else {
                continue;
            };
            if let Some(Value::String(s)) = json_path::resolve(request.payload, &constraint.json_path)
                && re.is_match(s)
            {
                out.deny(Reason::for_rule(
                    ReasonCode::RegexMatchDenied,
                    format!("value at `{}` matches forbidden pattern", constraint.json_path),
                    tool,
                ));
            }
        }
    }

    // Allow-only-if-regex.
    if let Some(constraints) = rule.allow_only_if_regex_match.as_deref() {
        for constraint in constraints {
            let Ok(re) = Regex::new(&constraint.pattern) else {
                continue;
            };
            let matches = matches!(
                json_path::resolve(request.payload, &constraint.json_path),
                Some(Value::String(s)) if re.is_match(s)
            );
            if !matches {
                out.deny(Reason::for_rule(
                    ReasonCode::RegexMatchRequired,
                    format!(
                        "value at `{}` does not match required pattern",
                        constraint.json_path
                    ),
                    tool,
                ));
            }
        }
    }

    let mut new_state = snapshot.current_state.clone();
    let mut new_counters = snapshot.counters.clone();

    // State-machine transition. Absence of a matching transition is not an
    // error; the state simply stays put.
    if out.allowed
        && let Some(sm) = policy.state_machine.as_ref()
        && let Some(transition) = sm.transitions.iter().find(|t| {
            t.from_state == snapshot.current_state && t.triggered_by_tool == tool
        })
    {
        if let Some(required_tools) = transition.requires_tools_called_before.as_deref() {
            for prerequisite in required_tools {
                if !snapshot.tool_calls_history.iter().any(|t| t == prerequisite) {
                    out.deny(Reason::for_rule(
                        ReasonCode::RequiredToolsNotCalled,
                        format!("tool `{}` must be called before `{}`", prerequisite, tool),
                        tool,
                    ));
                }
            }
        }

        if out.allowed
            && let Some(expr) = transition.guard.as_deref()
            && !guard::holds(expr, &new_counters)
        {
            out.deny(Reason::for_rule(
                ReasonCode::GuardConditionFailed,
                format!("transition guard `{}` failed", expr),
                tool,
            ));
        }

        if out.allowed {
            new_state = transition.to_state.clone();
            if let Some(deltas) = transition.sets_counters.as_ref() {
                for (name, delta) in deltas {
                    *new_counters.entry(name.clone()).or_insert(0) += delta;
                }
            }
            out.note(Reason::new(
                ReasonCode::StateTransition,
                format!(
                    "state transition `{}` -> `{}`",
                    transition.from_state, transition.to_state
                ),
            ));
        }
    }

    // Counter ceiling, against the working values.
    for counter in &policy.counters {
        if let Some(max_value) = counter.max_value {
            let value = new_counters.get(&counter.name).copied().unwrap_or(0);
            if value > max_value {
                out.deny(Reason::new(
                    ReasonCode::CounterLimitExceeded,
                    format!(
                        "counter `{}` value {} exceeds maxValue {}",
                        counter.name, value, max_value
                    ),
                ));
            }
        }
    }

    if !out.allowed {
        return blocked(out, snapshot);
    }

    let mut new_tool_call_counts = snapshot.tool_call_counts.clone();
    *new_tool_call_counts.entry(tool.to_string()).or_insert(0) += 1;
    if out.reasons.is_empty() {
        out.reasons.push(Reason::new(ReasonCode::Allowed, "allowed"));
    }

    Evaluation {
        allowed: true,
        error_code: None,
        reasons: out.reasons,
        new_state,
        new_counters,
        new_tool_call_counts,
    }
}

fn blocked(out: Outcome, snapshot: &SessionSnapshot) -> Evaluation {
    // A blocked call performs no transition, so informational reasons noted
    // before a late deny (counter ceiling after a tentative transition) are
    // dropped; the first remaining reason always carries the error code.
    let reasons = out
        .reasons
        .into_iter()
        .filter(|r| !r.code.is_informational())
        .collect();

    Evaluation {
        allowed: false,
        error_code: out.error_code,
        reasons,
        new_state: snapshot.current_state.clone(),
        new_counters: snapshot.counters.clone(),
        new_tool_call_counts: snapshot.tool_call_counts.clone(),
    }
}
