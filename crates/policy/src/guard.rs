use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

static GUARD_RE: OnceLock<Regex> = OnceLock::new();

fn guard_re() -> &'static Regex {
    GUARD_RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(<=|<|>=|>|==|!=)\s*(-?\d+)\s*$")
            .expect("guard grammar regex must compile")
    })
}

/// Parse a guard expression into `(counter, operator, literal)`.
///
/// The grammar is a single comparison of a counter against an integer
/// literal. Returns `None` on any syntactic failure.
pub fn parse(expr: &str) -> Option<(&str, &str, i64)> {
    let caps = guard_re().captures(expr)?;
    let name = caps.get(1)?.as_str();
    let op = caps.get(2)?.as_str();
    let literal = caps.get(3)?.as_str().parse::<i64>().ok()?;
    Some((name, op, literal))
}

/// Evaluate a guard against the working counters. An undeclared counter
/// reads as 0; a malformed expression is false (validation rejects such
/// policies before publish).
pub fn holds(expr: &str, counters: &BTreeMap<String, i64>) -> bool {
    let Some((name, op, literal)) = parse(expr) else {
        return false;
    };
    let value = counters.get(name).copied().unwrap_or(0);
    match op {
        "<" => value < literal,
        "<=" => value <= literal,
        ">" => value > literal,
        ">=" => value >= literal,
        "==" => value == literal,
        "!=" => value != literal,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn parses_all_operators() {
        for op in ["<", "<=", ">", ">=", "==", "!="] {
            let expr = format!("retries {} 3", op);
            let (name, parsed_op, lit) = parse(&expr).expect("guard should parse");
            assert_eq!(name, "retries");
            assert_eq!(parsed_op, op);
            assert_eq!(lit, 3);
        }
    }

    #[test]
    fn parses_negative_literals_and_whitespace() {
        let (name, op, lit) = parse("  balance>=-10  ").expect("guard should parse");
        assert_eq!(name, "balance");
        assert_eq!(op, ">=");
        assert_eq!(lit, -10);
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(parse("").is_none());
        assert!(parse("retries").is_none());
        assert!(parse("retries = 3").is_none());
        assert!(parse("3 < retries").is_none());
        assert!(parse("retries < 3 && x > 1").is_none());
        assert!(parse("retries < 3.5").is_none());
    }

    #[test]
    fn missing_counter_reads_as_zero() {
        let c = counters(&[]);
        assert!(holds("retries < 1", &c));
        assert!(!holds("retries > 0", &c));
        assert!(holds("retries == 0", &c));
    }

    #[test]
    fn evaluates_against_working_counters() {
        let c = counters(&[("retries", 2)]);
        assert!(holds("retries <= 2", &c));
        assert!(!holds("retries < 2", &c));
        assert!(holds("retries != 3", &c));
    }

    #[test]
    fn malformed_guard_is_false() {
        let c = counters(&[("retries", 2)]);
        assert!(!holds("retries <", &c));
    }
}
