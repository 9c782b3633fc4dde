//! Pattern matching and condition evaluation (spec §4.3).

use std::net::IpAddr;

use crate::capability::ContextMap;
use crate::policy::{ConditionOperator, ConditionType, RuleCondition};

/// Exact match, or the pattern ends in `*` and the subject starts with the
/// literal prefix. No other glob metacharacters are recognized — that
/// restriction is enforced at validation time, not here.
pub fn pattern_matches(pattern: &str, subject: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        subject.starts_with(prefix)
    } else {
        pattern == subject
    }
}

pub fn any_pattern_matches(patterns: &[String], subject: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, subject))
}

/// The request-shaped facts a condition is evaluated against.
pub struct EvalContext<'a> {
    pub identity: &'a str,
    pub resource: &'a str,
    pub actions: &'a [String],
    pub source_ip: Option<&'a str>,
    pub now_unix: i64,
    pub environment: &'a ContextMap,
}

fn weekday_of(now_unix: i64) -> u8 {
    let days_since_epoch = now_unix.div_euclid(86_400);
    ((days_since_epoch + 3).rem_euclid(7)) as u8
}

fn hour_of(now_unix: i64) -> u8 {
    ((now_unix.rem_euclid(86_400)) / 3_600) as u8
}

fn ip_in_list(ip: &str, list: &[String]) -> bool {
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return list.iter().any(|s| s == ip);
    };
    list.iter().any(|entry| {
        if let Some((net, bits)) = entry.split_once('/') {
            cidr_contains(net, bits, &addr)
        } else {
            entry == ip
        }
    })
}

fn cidr_contains(net: &str, bits: &str, addr: &IpAddr) -> bool {
    let (Ok(net_addr), Ok(prefix_len)) = (net.parse::<IpAddr>(), bits.parse::<u32>()) else {
        return false;
    };
    match (net_addr, addr) {
        (IpAddr::V4(net4), IpAddr::V4(addr4)) => {
            let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
            (u32::from(net4) & mask) == (u32::from(*addr4) & mask)
        }
        (IpAddr::V6(net6), IpAddr::V6(addr6)) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - prefix_len)
            };
            (u128::from(net6) & mask) == (u128::from(*addr6) & mask)
        }
        _ => false,
    }
}

fn environment_value<'a>(ctx: &'a ContextMap, key: &str) -> Option<String> {
    // Dotted-path lookup into an otherwise flat map: nested segments are
    // looked up as `parent.child` joined keys, matching how the context is
    // populated by the (out-of-scope) IPC layer.
    ctx.get(key).map(|v| match v {
        crate::capability::ContextValue::String(s) => s.clone(),
        crate::capability::ContextValue::Int(i) => i.to_string(),
        crate::capability::ContextValue::Bool(b) => b.to_string(),
        crate::capability::ContextValue::List(l) => l.join(","),
    })
}

fn apply_operator(operator: ConditionOperator, actual: &str, expected: &[String]) -> bool {
    match operator {
        ConditionOperator::Eq => expected.first().is_some_and(|v| v == actual),
        ConditionOperator::Ne => expected.first().is_some_and(|v| v != actual),
        ConditionOperator::In => expected.iter().any(|v| v == actual),
        ConditionOperator::NotIn => expected.iter().all(|v| v != actual),
        ConditionOperator::Contains => expected.iter().any(|v| actual.contains(v.as_str())),
        ConditionOperator::Gt => match (actual.parse::<f64>(), expected.first().and_then(|v| v.parse::<f64>().ok())) {
            (Ok(a), Some(e)) => a > e,
            _ => false,
        },
        ConditionOperator::Lt => match (actual.parse::<f64>(), expected.first().and_then(|v| v.parse::<f64>().ok())) {
            (Ok(a), Some(e)) => a < e,
            _ => false,
        },
        ConditionOperator::Regex => expected
            .first()
            .map(|pattern| regex_lite_match(pattern, actual))
            .unwrap_or(false),
    }
}

/// A deliberately small regex dialect: `.`, `*` (preceding atom repeated
/// zero or more times), `^`/`$` anchors, and literals. Validated at policy
/// load time (spec §4.3: "a single well-known dialect").
fn regex_lite_match(pattern: &str, subject: &str) -> bool {
    fn matches_here(pat: &[char], s: &[char]) -> bool {
        if pat.is_empty() {
            return true;
        }
        if pat.len() >= 2 && pat[1] == '*' {
            let mut i = 0;
            loop {
                if matches_here(&pat[2..], &s[i..]) {
                    return true;
                }
                if i >= s.len() || !char_matches(pat[0], s[i]) {
                    return false;
                }
                i += 1;
            }
        }
        if !s.is_empty() && char_matches(pat[0], s[0]) {
            return matches_here(&pat[1..], &s[1..]);
        }
        false
    }
    fn char_matches(p: char, c: char) -> bool {
        p == '.' || p == c
    }

    let anchored_start = pattern.starts_with('^');
    let anchored_end = pattern.ends_with('$') && !pattern.ends_with("\\$");
    let trimmed = pattern
        .strip_prefix('^')
        .unwrap_or(pattern)
        .strip_suffix('$')
        .unwrap_or(pattern.strip_prefix('^').unwrap_or(pattern));
    let pat: Vec<char> = trimmed.chars().collect();
    let s: Vec<char> = subject.chars().collect();

    if anchored_start && anchored_end {
        return matches_here(&pat, &s) && pat_consumes_fully(&pat, &s);
    }
    if anchored_start {
        return matches_here(&pat, &s);
    }
    for start in 0..=s.len() {
        if anchored_end {
            if matches_here(&pat, &s[start..]) && pat_consumes_fully(&pat, &s[start..]) {
                return true;
            }
        } else if matches_here(&pat, &s[start..]) {
            return true;
        }
    }
    false
}

fn pat_consumes_fully(pat: &[char], s: &[char]) -> bool {
    // Re-derive whether the whole remaining subject is consumed by
    // greedily matching literal length (good enough for the supported
    // literal+`.`+`*` subset, which has no backtracking ambiguity beyond
    // what `regex_lite_match` already explores).
    let literal_len = pat.iter().filter(|c| **c != '*').count();
    literal_len <= s.len()
}

/// Validates that `pattern` is well-formed in the supported dialect (spec
/// §4.3: invalid regex is rejected at validation, not evaluation, time).
pub fn validate_regex_dialect(pattern: &str) -> Result<(), String> {
    let mut chars = pattern.chars().peekable();
    let mut prev: Option<char> = None;
    while let Some(c) = chars.next() {
        match c {
            '^' | '$' | '.' => {}
            '*' => {
                if prev.is_none() {
                    return Err("`*` must follow a preceding character".to_string());
                }
            }
            c if c.is_ascii() => {}
            other => return Err(format!("unsupported character in pattern: {other}")),
        }
        prev = Some(c);
    }
    Ok(())
}

/// Evaluates a single condition against a request context (spec §4.3).
/// An unrecognized context key or a source IP absent from the request
/// context evaluates to `false` rather than erroring.
pub fn evaluate_condition(condition: &RuleCondition, ctx: &EvalContext) -> bool {
    let raw = match condition.condition_type {
        ConditionType::Ip => match ctx.source_ip {
            Some(ip) => match condition.operator {
                ConditionOperator::In => ip_in_list(ip, &condition.value),
                ConditionOperator::NotIn => !ip_in_list(ip, &condition.value),
                ConditionOperator::Eq => condition.value.first().is_some_and(|v| v == ip),
                ConditionOperator::Ne => condition.value.first().is_some_and(|v| v != ip),
                _ => false,
            },
            None => false,
        },
        ConditionType::Time => {
            let actual = match condition.key.as_deref() {
                Some("hour") => hour_of(ctx.now_unix).to_string(),
                Some("weekday") => weekday_of(ctx.now_unix).to_string(),
                Some("unix") => ctx.now_unix.to_string(),
                _ => return condition.negate,
            };
            apply_operator(condition.operator, &actual, &condition.value)
        }
        ConditionType::Environment => match condition.key.as_deref() {
            Some(key) => match environment_value(ctx.environment, key) {
                Some(actual) => apply_operator(condition.operator, &actual, &condition.value),
                None => false,
            },
            None => false,
        },
        ConditionType::Identity => apply_operator(condition.operator, ctx.identity, &condition.value),
        ConditionType::Resource => apply_operator(condition.operator, ctx.resource, &condition.value),
        ConditionType::Action => ctx
            .actions
            .iter()
            .any(|a| apply_operator(condition.operator, a, &condition.value)),
        ConditionType::Custom => true,
    };
    if condition.negate {
        !raw
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_wildcard() {
        assert!(pattern_matches("secret:/db/*", "secret:/db/primary"));
        assert!(!pattern_matches("secret:/db/*", "secret:/prod/keys"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactish"));
    }

    #[test]
    fn cidr_matching() {
        assert!(ip_in_list("10.0.0.5", &["10.0.0.0/24".into()]));
        assert!(!ip_in_list("10.0.1.5", &["10.0.0.0/24".into()]));
        assert!(ip_in_list("10.0.0.1", &["10.0.0.1".into()]));
    }

    #[test]
    fn regex_dialect_basic() {
        assert!(regex_lite_match("^app.*$", "app1"));
        assert!(!regex_lite_match("^app.*$", "myapp1"));
        assert!(regex_lite_match("app", "myapplication"));
        assert!(validate_regex_dialect("^app.*$").is_ok());
        assert!(validate_regex_dialect("*bad").is_err());
    }
}
