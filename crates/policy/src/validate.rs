use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use warden_contracts::PolicySpec;

use crate::guard;

/// One validation failure, addressed by a JSON-pointer-ish dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
    pub code: &'static str,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, message: impl Into<String>, code: &'static str) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            code,
        }
    }
}

pub const CODE_MISSING_VERSION: &str = "MISSING_VERSION";
pub const CODE_MISSING_DEFAULT_DECISION: &str = "MISSING_DEFAULT_DECISION";
pub const CODE_INVALID_TOOL_RULES: &str = "INVALID_TOOL_RULES";
pub const CODE_DUPLICATE_TOOL_NAME: &str = "DUPLICATE_TOOL_NAME";
pub const CODE_INVALID_ACTION_TYPE: &str = "INVALID_ACTION_TYPE";
pub const CODE_INVALID_LIMIT: &str = "INVALID_LIMIT";
pub const CODE_UNDECLARED_STATE: &str = "UNDECLARED_STATE";
pub const CODE_INVALID_REGEX: &str = "INVALID_REGEX";
pub const CODE_INVALID_STATE_MACHINE: &str = "INVALID_STATE_MACHINE";
pub const CODE_UNGUARDED_SELF_LOOP: &str = "UNGUARDED_SELF_LOOP";
pub const CODE_UNDECLARED_COUNTER: &str = "UNDECLARED_COUNTER";
pub const CODE_INVALID_COUNTER: &str = "INVALID_COUNTER";
pub const CODE_INVALID_GUARD: &str = "INVALID_GUARD";
pub const CODE_MALFORMED_SPEC: &str = "MALFORMED_SPEC";

/// Validate a raw spec document. An empty result means the spec is fit to
/// publish; the hash is computed only after this passes.
pub fn validate_spec(spec: &Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let Some(root) = spec.as_object() else {
        issues.push(ValidationIssue::new(
            "",
            "policy spec must be a JSON object",
            CODE_MALFORMED_SPEC,
        ));
        return issues;
    };

    match root.get("version") {
        Some(Value::String(v)) if !v.trim().is_empty() => {}
        Some(_) => issues.push(ValidationIssue::new(
            "version",
            "version must be a non-empty string",
            CODE_MISSING_VERSION,
        )),
        None => issues.push(ValidationIssue::new(
            "version",
            "version is required",
            CODE_MISSING_VERSION,
        )),
    }

    match root.get("defaultDecision").and_then(|v| v.as_str()) {
        Some("allow") | Some("deny") => {}
        Some(other) => issues.push(ValidationIssue::new(
            "defaultDecision",
            format!("defaultDecision must be allow or deny, got `{}`", other),
            CODE_MISSING_DEFAULT_DECISION,
        )),
        None => issues.push(ValidationIssue::new(
            "defaultDecision",
            "defaultDecision is required",
            CODE_MISSING_DEFAULT_DECISION,
        )),
    }

    let declared_counters = collect_counter_names(root, &mut issues);
    let declared_states = validate_state_shape(root, &mut issues);

    let mut declared_tools = HashSet::new();
    match root.get("toolRules") {
        Some(Value::Array(rules)) => {
            for (idx, rule) in rules.iter().enumerate() {
                validate_tool_rule(
                    rule,
                    idx,
                    &mut declared_tools,
                    declared_states.as_ref(),
                    &mut issues,
                );
            }
        }
        Some(_) => issues.push(ValidationIssue::new(
            "toolRules",
            "toolRules must be a sequence",
            CODE_INVALID_TOOL_RULES,
        )),
        None => issues.push(ValidationIssue::new(
            "toolRules",
            "toolRules is required",
            CODE_INVALID_TOOL_RULES,
        )),
    }

    validate_state_machine(
        root,
        declared_states.as_ref(),
        &declared_tools,
        &declared_counters,
        &mut issues,
    );

    issues
}

/// Validate then deserialize; callers get a typed spec only for documents
/// that passed every check.
pub fn parse_validated(spec: &Value) -> Result<PolicySpec, Vec<ValidationIssue>> {
    let issues = validate_spec(spec);
    if !issues.is_empty() {
        return Err(issues);
    }

    serde_json::from_value(spec.clone()).map_err(|err| {
        vec![ValidationIssue::new(
            "",
            format!("spec failed to deserialize: {}", err),
            CODE_MALFORMED_SPEC,
        )]
    })
}

fn collect_counter_names(
    root: &serde_json::Map<String, Value>,
    issues: &mut Vec<ValidationIssue>,
) -> HashSet<String> {
    let mut names = HashSet::new();

    let Some(counters) = root.get("counters") else {
        return names;
    };
    let Some(counters) = counters.as_array() else {
        issues.push(ValidationIssue::new(
            "counters",
            "counters must be a sequence",
            CODE_INVALID_COUNTER,
        ));
        return names;
    };

    for (idx, counter) in counters.iter().enumerate() {
        let path = format!("counters[{}]", idx);
        let Some(obj) = counter.as_object() else {
            issues.push(ValidationIssue::new(
                path,
                "counter must be an object",
                CODE_INVALID_COUNTER,
            ));
            continue;
        };

        match obj.get("name").and_then(|v| v.as_str()) {
            Some(name) if !name.is_empty() => {
                names.insert(name.to_string());
            }
            _ => issues.push(ValidationIssue::new(
                format!("{}.name", path),
                "counter name must be a non-empty string",
                CODE_INVALID_COUNTER,
            )),
        }

        if let Some(scope) = obj.get("scope")
            && scope.as_str() != Some("session")
        {
            issues.push(ValidationIssue::new(
                format!("{}.scope", path),
                "counter scope must be \"session\"",
                CODE_INVALID_COUNTER,
            ));
        }

        match obj.get("initialValue") {
            Some(v) if v.as_i64().is_some() => {}
            _ => issues.push(ValidationIssue::new(
                format!("{}.initialValue", path),
                "initialValue must be an integer",
                CODE_INVALID_COUNTER,
            )),
        }

        if let Some(max) = obj.get("maxValue")
            && max.as_i64().is_none()
        {
            issues.push(ValidationIssue::new(
                format!("{}.maxValue", path),
                "maxValue must be an integer",
                CODE_INVALID_COUNTER,
            ));
        }
    }

    names
}

/// Surface-level checks on the state set; returns the declared states when a
/// state machine is present so rule-level `requireState` can be verified.
fn validate_state_shape(
    root: &serde_json::Map<String, Value>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<HashSet<String>> {
    let sm = root.get("stateMachine")?;
    let Some(sm) = sm.as_object() else {
        issues.push(ValidationIssue::new(
            "stateMachine",
            "stateMachine must be an object",
            CODE_INVALID_STATE_MACHINE,
        ));
        return None;
    };

    let mut states = HashSet::new();
    match sm.get("states") {
        Some(Value::Array(list)) if !list.is_empty() => {
            for (idx, state) in list.iter().enumerate() {
                match state.as_str() {
                    Some(s) if !s.is_empty() => {
                        if !states.insert(s.to_string()) {
                            issues.push(ValidationIssue::new(
                                format!("stateMachine.states[{}]", idx),
                                format!("duplicate state `{}`", s),
                                CODE_INVALID_STATE_MACHINE,
                            ));
                        }
                    }
                    _ => issues.push(ValidationIssue::new(
                        format!("stateMachine.states[{}]", idx),
                        "state names must be non-empty strings",
                        CODE_INVALID_STATE_MACHINE,
                    )),
                }
            }
        }
        _ => issues.push(ValidationIssue::new(
            "stateMachine.states",
            "states must be a non-empty sequence",
            CODE_INVALID_STATE_MACHINE,
        )),
    }

    match sm.get("initialState").and_then(|v| v.as_str()) {
        Some(initial) if states.contains(initial) => {}
        Some(initial) => issues.push(ValidationIssue::new(
            "stateMachine.initialState",
            format!("initialState `{}` is not a declared state", initial),
            CODE_INVALID_STATE_MACHINE,
        )),
        None => issues.push(ValidationIssue::new(
            "stateMachine.initialState",
            "initialState is required",
            CODE_INVALID_STATE_MACHINE,
        )),
    }

    Some(states)
}

fn validate_tool_rule(
    rule: &Value,
    idx: usize,
    declared_tools: &mut HashSet<String>,
    declared_states: Option<&HashSet<String>>,
    issues: &mut Vec<ValidationIssue>,
) {
    let path = format!("toolRules[{}]", idx);
    let Some(obj) = rule.as_object() else {
        issues.push(ValidationIssue::new(
            path,
            "tool rule must be an object",
            CODE_INVALID_TOOL_RULES,
        ));
        return;
    };

    match obj.get("toolName").and_then(|v| v.as_str()) {
        Some(name) if !name.is_empty() => {
            if !declared_tools.insert(name.to_string()) {
                issues.push(ValidationIssue::new(
                    format!("{}.toolName", path),
                    format!("duplicate toolName `{}`", name),
                    CODE_DUPLICATE_TOOL_NAME,
                ));
            }
        }
        _ => issues.push(ValidationIssue::new(
            format!("{}.toolName", path),
            "toolName must be a non-empty string",
            CODE_INVALID_TOOL_RULES,
        )),
    }

    match obj.get("effect").and_then(|v| v.as_str()) {
        Some("allow") | Some("deny") => {}
        _ => issues.push(ValidationIssue::new(
            format!("{}.effect", path),
            "effect must be allow or deny",
            CODE_INVALID_TOOL_RULES,
        )),
    }

    if let Some(action) = obj.get("actionType")
        && !matches!(action.as_str(), Some("read") | Some("write") | Some("side_effect"))
    {
        issues.push(ValidationIssue::new(
            format!("{}.actionType", path),
            "actionType must be read, write, or side_effect",
            CODE_INVALID_ACTION_TYPE,
        ));
    }

    for field in ["maxCallsPerSession", "cooldownMs"] {
        if let Some(v) = obj.get(field)
            && v.as_u64().is_none()
        {
            issues.push(ValidationIssue::new(
                format!("{}.{}", path, field),
                format!("{} must be a non-negative integer", field),
                CODE_INVALID_LIMIT,
            ));
        }
    }

    if let Some(required) = obj.get("requireState").and_then(|v| v.as_str())
        && let Some(states) = declared_states
        && !states.contains(required)
    {
        issues.push(ValidationIssue::new(
            format!("{}.requireState", path),
            format!("requireState `{}` is not a declared state", required),
            CODE_UNDECLARED_STATE,
        ));
    }

    for field in ["denyIfRegexMatch", "allowOnlyIfRegexMatch"] {
        let Some(constraints) = obj.get(field).and_then(|v| v.as_array()) else {
            continue;
        };
        for (cidx, constraint) in constraints.iter().enumerate() {
            let cpath = format!("{}.{}[{}]", path, field, cidx);
            let Some(pattern) = constraint.get("pattern").and_then(|v| v.as_str()) else {
                issues.push(ValidationIssue::new(
                    cpath,
                    "regex constraint requires a string pattern",
                    CODE_INVALID_REGEX,
                ));
                continue;
            };
            if let Err(err) = Regex::new(pattern) {
                issues.push(ValidationIssue::new(
                    format!("{}.pattern", cpath),
                    format!("pattern does not compile: {}", err),
                    CODE_INVALID_REGEX,
                ));
            }
        }
    }
}

fn validate_state_machine(
    root: &serde_json::Map<String, Value>,
    declared_states: Option<&HashSet<String>>,
    declared_tools: &HashSet<String>,
    declared_counters: &HashSet<String>,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(sm) = root.get("stateMachine").and_then(|v| v.as_object()) else {
        return;
    };
    let Some(states) = declared_states else {
        return;
    };

    let Some(transitions) = sm.get("transitions").and_then(|v| v.as_array()) else {
        return;
    };

    for (idx, transition) in transitions.iter().enumerate() {
        let path = format!("stateMachine.transitions[{}]", idx);
        let Some(obj) = transition.as_object() else {
            issues.push(ValidationIssue::new(
                path,
                "transition must be an object",
                CODE_INVALID_STATE_MACHINE,
            ));
            continue;
        };

        let from = obj.get("fromState").and_then(|v| v.as_str());
        let to = obj.get("toState").and_then(|v| v.as_str());

        for (field, value) in [("fromState", from), ("toState", to)] {
            match value {
                Some(state) if states.contains(state) => {}
                Some(state) => issues.push(ValidationIssue::new(
                    format!("{}.{}", path, field),
                    format!("{} `{}` is not a declared state", field, state),
                    CODE_INVALID_STATE_MACHINE,
                )),
                None => issues.push(ValidationIssue::new(
                    format!("{}.{}", path, field),
                    format!("{} is required", field),
                    CODE_INVALID_STATE_MACHINE,
                )),
            }
        }

        match obj.get("triggeredByTool").and_then(|v| v.as_str()) {
            Some(tool) if declared_tools.contains(tool) => {}
            Some(tool) => issues.push(ValidationIssue::new(
                format!("{}.triggeredByTool", path),
                format!("triggeredByTool `{}` is not a declared tool", tool),
                CODE_INVALID_STATE_MACHINE,
            )),
            None => issues.push(ValidationIssue::new(
                format!("{}.triggeredByTool", path),
                "triggeredByTool is required",
                CODE_INVALID_STATE_MACHINE,
            )),
        }

        let guard_expr = obj.get("guard").and_then(|v| v.as_str());

        if let (Some(f), Some(t)) = (from, to)
            && f == t
            && guard_expr.is_none()
        {
            issues.push(ValidationIssue::new(
                path.clone(),
                format!("self-loop on `{}` requires a guard", f),
                CODE_UNGUARDED_SELF_LOOP,
            ));
        }

        if let Some(expr) = guard_expr {
            match guard::parse(expr) {
                Some((counter, _, _)) => {
                    if !declared_counters.contains(counter) {
                        issues.push(ValidationIssue::new(
                            format!("{}.guard", path),
                            format!("guard references undeclared counter `{}`", counter),
                            CODE_UNDECLARED_COUNTER,
                        ));
                    }
                }
                None => issues.push(ValidationIssue::new(
                    format!("{}.guard", path),
                    "guard must be a single `counter OP integer` comparison",
                    CODE_INVALID_GUARD,
                )),
            }
        }

        if let Some(sets) = obj.get("setsCounters").and_then(|v| v.as_object()) {
            for (name, delta) in sets {
                if !declared_counters.contains(name) {
                    issues.push(ValidationIssue::new(
                        format!("{}.setsCounters.{}", path, name),
                        format!("setsCounters references undeclared counter `{}`", name),
                        CODE_UNDECLARED_COUNTER,
                    ));
                }
                if delta.as_i64().is_none() {
                    issues.push(ValidationIssue::new(
                        format!("{}.setsCounters.{}", path, name),
                        "counter delta must be an integer",
                        CODE_INVALID_COUNTER,
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_valid() -> Value {
        serde_json::json!({
            "version": "1.0",
            "defaultDecision": "deny",
            "toolRules": [
                {"toolName": "lookup", "effect": "allow", "actionType": "read"}
            ]
        })
    }

    fn codes(spec: &Value) -> Vec<&'static str> {
        validate_spec(spec).into_iter().map(|i| i.code).collect()
    }

    #[test]
    fn minimal_spec_passes() {
        assert!(validate_spec(&minimal_valid()).is_empty());
        parse_validated(&minimal_valid()).expect("minimal spec should parse");
    }

    #[test]
    fn missing_version_and_default_decision_are_reported() {
        let spec = serde_json::json!({"toolRules": []});
        let found = codes(&spec);
        assert!(found.contains(&CODE_MISSING_VERSION));
        assert!(found.contains(&CODE_MISSING_DEFAULT_DECISION));
    }

    #[test]
    fn tool_rules_must_be_a_sequence() {
        let mut spec = minimal_valid();
        spec["toolRules"] = serde_json::json!({"toolName": "x"});
        assert!(codes(&spec).contains(&CODE_INVALID_TOOL_RULES));
    }

    #[test]
    fn duplicate_tool_names_are_rejected() {
        let mut spec = minimal_valid();
        spec["toolRules"] = serde_json::json!([
            {"toolName": "lookup", "effect": "allow"},
            {"toolName": "lookup", "effect": "deny"}
        ]);
        assert!(codes(&spec).contains(&CODE_DUPLICATE_TOOL_NAME));
    }

    #[test]
    fn action_type_outside_enum_is_rejected() {
        let mut spec = minimal_valid();
        spec["toolRules"][0]["actionType"] = serde_json::json!("delete");
        assert!(codes(&spec).contains(&CODE_INVALID_ACTION_TYPE));
    }

    #[test]
    fn negative_or_fractional_limits_are_rejected() {
        let mut spec = minimal_valid();
        spec["toolRules"][0]["maxCallsPerSession"] = serde_json::json!(-1);
        assert!(codes(&spec).contains(&CODE_INVALID_LIMIT));

        let mut spec = minimal_valid();
        spec["toolRules"][0]["cooldownMs"] = serde_json::json!(1.5);
        assert!(codes(&spec).contains(&CODE_INVALID_LIMIT));
    }

    #[test]
    fn require_state_must_reference_declared_state() {
        let spec = serde_json::json!({
            "version": "1.0",
            "defaultDecision": "deny",
            "toolRules": [
                {"toolName": "t", "effect": "allow", "requireState": "missing"}
            ],
            "stateMachine": {
                "states": ["a", "b"],
                "initialState": "a",
                "transitions": []
            }
        });
        assert!(codes(&spec).contains(&CODE_UNDECLARED_STATE));
    }

    #[test]
    fn require_state_is_unchecked_without_state_machine() {
        let mut spec = minimal_valid();
        spec["toolRules"][0]["requireState"] = serde_json::json!("anything");
        assert!(validate_spec(&spec).is_empty());
    }

    #[test]
    fn uncompilable_regex_is_rejected() {
        let mut spec = minimal_valid();
        spec["toolRules"][0]["denyIfRegexMatch"] =
            serde_json::json!([{"jsonPath": "q", "pattern": "("}]);
        assert!(codes(&spec).contains(&CODE_INVALID_REGEX));
    }

    #[test]
    fn state_machine_shape_is_checked() {
        let spec = serde_json::json!({
            "version": "1.0",
            "defaultDecision": "deny",
            "toolRules": [{"toolName": "t", "effect": "allow"}],
            "stateMachine": {
                "states": ["a", "a"],
                "initialState": "c",
                "transitions": [
                    {"fromState": "a", "toState": "z", "triggeredByTool": "ghost"}
                ]
            }
        });
        let found = codes(&spec);
        // duplicate state, initialState not in set, toState undeclared,
        // triggeredByTool undeclared
        assert!(found.iter().filter(|c| **c == CODE_INVALID_STATE_MACHINE).count() >= 4);
    }

    #[test]
    fn self_loop_without_guard_is_rejected() {
        let spec = serde_json::json!({
            "version": "1.0",
            "defaultDecision": "deny",
            "toolRules": [{"toolName": "t", "effect": "allow"}],
            "stateMachine": {
                "states": ["a"],
                "initialState": "a",
                "transitions": [
                    {"fromState": "a", "toState": "a", "triggeredByTool": "t"}
                ]
            }
        });
        assert!(codes(&spec).contains(&CODE_UNGUARDED_SELF_LOOP));
    }

    #[test]
    fn self_loop_with_guard_passes() {
        let spec = serde_json::json!({
            "version": "1.0",
            "defaultDecision": "deny",
            "toolRules": [{"toolName": "t", "effect": "allow"}],
            "counters": [{"name": "n", "initialValue": 0}],
            "stateMachine": {
                "states": ["a"],
                "initialState": "a",
                "transitions": [
                    {"fromState": "a", "toState": "a", "triggeredByTool": "t", "guard": "n < 5"}
                ]
            }
        });
        assert!(validate_spec(&spec).is_empty());
    }

    #[test]
    fn guard_grammar_and_counter_references_are_checked() {
        let spec = serde_json::json!({
            "version": "1.0",
            "defaultDecision": "deny",
            "toolRules": [{"toolName": "t", "effect": "allow"}],
            "counters": [{"name": "n", "initialValue": 0}],
            "stateMachine": {
                "states": ["a", "b"],
                "initialState": "a",
                "transitions": [
                    {"fromState": "a", "toState": "b", "triggeredByTool": "t", "guard": "n <"},
                    {"fromState": "b", "toState": "a", "triggeredByTool": "t", "guard": "ghost > 1"},
                    {"fromState": "a", "toState": "b", "triggeredByTool": "t",
                     "setsCounters": {"ghost": 1}}
                ]
            }
        });
        let found = codes(&spec);
        assert!(found.contains(&CODE_INVALID_GUARD));
        assert_eq!(
            found.iter().filter(|c| **c == CODE_UNDECLARED_COUNTER).count(),
            2
        );
    }

    #[test]
    fn counter_scope_and_initial_value_are_checked() {
        let mut spec = minimal_valid();
        spec["counters"] = serde_json::json!([
            {"name": "n", "scope": "global", "initialValue": 0},
            {"name": "m", "initialValue": "zero"}
        ]);
        let found = codes(&spec);
        assert_eq!(
            found.iter().filter(|c| **c == CODE_INVALID_COUNTER).count(),
            2
        );
    }

    #[test]
    fn non_object_spec_is_malformed() {
        let found = codes(&serde_json::json!([1, 2, 3]));
        assert_eq!(found, vec![CODE_MALFORMED_SPEC]);
    }
}
