//! The policy engine (spec §4.3): loads declarative rule sets, evaluates a
//! request against the active set, and caches decisions.

pub mod cache;
pub mod matching;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::capability::ContextMap;
use crate::clock::Clock;
use crate::config::{DefaultDecision, PolicyEngineConfig};
use crate::error::{CoreError, CoreResult};
use crate::policy::cache::{CacheKey, DecisionCache};
use crate::policy::matching::{any_pattern_matches, evaluate_condition, validate_regex_dialect, EvalContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Ip,
    Time,
    Environment,
    Identity,
    Resource,
    Action,
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    In,
    NotIn,
    Regex,
    Gt,
    Lt,
    Contains,
}

/// A single condition clause (spec §3 `RuleCondition`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Vec<String>,
    #[serde(default)]
    pub negate: bool,
}

/// A single rule within a policy (spec §3 `PolicyRule`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub effect: RuleEffect,
    pub priority: u32,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub identities: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Active,
    Inactive,
    Deprecated,
}

/// A named, versioned set of rules (spec §3 `Policy`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: PolicyStatus,
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub author: Option<String>,
}

impl Policy {
    fn max_rule_priority(&self) -> u32 {
        self.rules.iter().map(|r| r.priority).max().unwrap_or(0)
    }

    /// Validation on load (spec §4.3): every field present, every condition
    /// of known type/operator, every regex condition well-formed.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("policy id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("policy name must not be empty".to_string());
        }
        if self.version.trim().is_empty() {
            return Err("policy version must not be empty".to_string());
        }
        if self.rules.is_empty() {
            return Err("policy must have at least one rule".to_string());
        }
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err("rule id must not be empty".to_string());
            }
            for condition in &rule.conditions {
                if condition.condition_type == ConditionType::Custom {
                    // Custom conditions are pure data too (spec §9): no
                    // callable is ever accepted, only a soft-skip marker.
                }
                if condition.operator == ConditionOperator::Regex {
                    for pattern in &condition.value {
                        validate_regex_dialect(pattern)
                            .map_err(|e| format!("rule {}: invalid regex {pattern:?}: {e}", rule.id))?;
                    }
                }
                for pattern in rule
                    .resources
                    .iter()
                    .chain(rule.actions.iter())
                    .chain(rule.identities.iter())
                {
                    if pattern.matches('*').count() > 1 || (pattern.contains('*') && !pattern.ends_with('*')) {
                        return Err(format!(
                            "rule {}: pattern {pattern:?} uses unsupported glob metacharacters (prefix `*` only)",
                            rule.id
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn matching_rules(&self, ctx: &EvalContext) -> Vec<&PolicyRule> {
        self.rules
            .iter()
            .filter(|rule| {
                any_pattern_matches(&rule.resources, ctx.resource)
                    && ctx.actions.iter().any(|a| any_pattern_matches(&rule.actions, a))
                    && any_pattern_matches(&rule.identities, ctx.identity)
                    && rule.conditions.iter().all(|c| evaluate_condition(c, ctx))
            })
            .collect()
    }
}

/// Everything the caller needs to understand why a decision was made (spec
/// §4.3 result shape).
#[derive(Clone, Debug)]
pub struct EvaluationResult {
    pub decision: Decision,
    pub applied_policies: Vec<String>,
    pub applied_rules: Vec<String>,
    pub conditions: Vec<String>,
    pub reasoning: String,
    pub evaluation_time: std::time::Duration,
    pub cache_hit: bool,
}

struct ActiveSet {
    policies: Vec<Policy>,
    load_errors: Vec<(String, String)>,
}

/// Loads, validates, caches and evaluates policies (spec §4.3).
pub struct PolicyEngine {
    config: PolicyEngineConfig,
    active: RwLock<ActiveSet>,
    cache: Mutex<DecisionCache>,
    clock: Arc<dyn Clock>,
}

impl PolicyEngine {
    pub fn new(config: PolicyEngineConfig, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let cache = Mutex::new(DecisionCache::new(config.cache_size, config.cache_ttl));
        let engine = Self {
            active: RwLock::new(ActiveSet {
                policies: Vec::new(),
                load_errors: Vec::new(),
            }),
            cache,
            config,
            clock,
        };
        engine.reload()?;
        Ok(engine)
    }

    /// Reads every policy file in the configured directory, validates each,
    /// and atomically replaces the active set. Individual file failures are
    /// recorded and skipped rather than aborting the whole reload (spec
    /// §4.3).
    #[instrument(skip(self))]
    pub fn reload(&self) -> CoreResult<()> {
        let dir = &self.config.directory;
        if !dir.exists() {
            *self.active.write() = ActiveSet {
                policies: Vec::new(),
                load_errors: Vec::new(),
            };
            self.cache.lock().clear();
            return Ok(());
        }
        let entries = fs::read_dir(dir)
            .map_err(|e| CoreError::PolicyLoad { file: dir.display().to_string(), reason: e.to_string() })?;

        let mut policies = Vec::new();
        let mut errors = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    errors.push((dir.display().to_string(), e.to_string()));
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_policy_file(&path) {
                Ok(policy) => {
                    if self.config.enable_validation {
                        if let Err(reason) = policy.validate() {
                            warn!(file = %path.display(), %reason, "skipping invalid policy");
                            errors.push((path.display().to_string(), reason));
                            continue;
                        }
                    }
                    policies.push(policy);
                }
                Err(reason) => {
                    warn!(file = %path.display(), %reason, "skipping unreadable policy");
                    errors.push((path.display().to_string(), reason));
                }
            }
        }
        // Order by maximum rule priority (spec §4.3 step 2) so ties between
        // equal-priority, equal-effect rules break toward the policy with
        // the higher overall priority rather than directory iteration order.
        policies.sort_by(|a, b| b.max_rule_priority().cmp(&a.max_rule_priority()).then_with(|| a.id.cmp(&b.id)));

        let loaded = policies.len();
        *self.active.write() = ActiveSet { policies, load_errors: errors };
        self.cache.lock().clear();
        info!(loaded, "policy set reloaded");
        Ok(())
    }

    /// Evaluates `identity`/`resource`/`actions` against the active set
    /// (spec §4.3 evaluation algorithm). All active policies are scanned so
    /// a higher-priority deny elsewhere is never hidden by an earlier
    /// allow, per the spec's safety requirement.
    #[instrument(skip(self, context))]
    pub fn evaluate(
        &self,
        identity: &str,
        resource: &str,
        actions: &[String],
        source_ip: Option<&str>,
        context: &ContextMap,
    ) -> EvaluationResult {
        let start = Instant::now();
        let cache_key = CacheKey::new(identity, resource, actions, source_ip);
        if self.config.enable_cache {
            if let Some(decision) = self.cache.lock().get(&cache_key) {
                return EvaluationResult {
                    decision,
                    applied_policies: Vec::new(),
                    applied_rules: Vec::new(),
                    conditions: Vec::new(),
                    reasoning: "cache hit".to_string(),
                    evaluation_time: start.elapsed(),
                    cache_hit: true,
                };
            }
        }

        let ctx = EvalContext {
            identity,
            resource,
            actions,
            source_ip,
            now_unix: self.clock.now_unix(),
            environment: context,
        };

        let active = self.active.read();
        let mut best: Option<(u32, RuleEffect, &Policy, &PolicyRule)> = None;
        let mut conditions_seen = Vec::new();

        for policy in active.policies.iter().filter(|p| p.status == PolicyStatus::Active) {
            for rule in policy.matching_rules(&ctx) {
                for condition in &rule.conditions {
                    conditions_seen.push(format!("{:?}({:?})", condition.condition_type, condition.operator));
                }
                let better = match &best {
                    None => true,
                    Some((p, effect, _, _)) => {
                        rule.priority > *p || (rule.priority == *p && rule.effect == RuleEffect::Deny && *effect != RuleEffect::Deny)
                    }
                };
                if better {
                    best = Some((rule.priority, rule.effect, policy, rule));
                }
            }
        }

        let result = match best {
            Some((priority, effect, policy, rule)) => {
                let decision = if effect == RuleEffect::Deny { Decision::Deny } else { Decision::Allow };
                EvaluationResult {
                    decision,
                    applied_policies: vec![policy.id.clone()],
                    applied_rules: vec![rule.id.clone()],
                    conditions: conditions_seen,
                    reasoning: format!(
                        "rule {} in policy {} matched with priority {} ({:?})",
                        rule.id, policy.id, priority, effect
                    ),
                    evaluation_time: start.elapsed(),
                    cache_hit: false,
                }
            }
            None => {
                let decision = match self.config.default_decision {
                    DefaultDecision::Allow => Decision::Allow,
                    DefaultDecision::Deny => Decision::Deny,
                };
                EvaluationResult {
                    decision,
                    applied_policies: Vec::new(),
                    applied_rules: Vec::new(),
                    conditions: conditions_seen,
                    reasoning: "no rule matched; applied default decision".to_string(),
                    evaluation_time: start.elapsed(),
                    cache_hit: false,
                }
            }
        };

        if self.config.enable_cache {
            self.cache.lock().put(cache_key, result.decision);
        }
        result
    }

    pub fn stats(&self) -> PolicyStats {
        let active = self.active.read();
        PolicyStats {
            loaded_policies: active.policies.len(),
            load_errors: active.load_errors.len(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PolicyStats {
    pub loaded_policies: usize,
    pub load_errors: usize,
}

fn load_policy_file(path: &Path) -> Result<Policy, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

pub fn write_policy_file(dir: &Path, policy: &Policy) -> CoreResult<PathBuf> {
    fs::create_dir_all(dir)
        .map_err(|e| CoreError::PolicyLoad { file: dir.display().to_string(), reason: e.to_string() })?;
    let path = dir.join(format!("{}.json", policy.id));
    let bytes = serde_json::to_vec_pretty(policy)
        .map_err(|e| CoreError::PolicyLoad { file: path.display().to_string(), reason: e.to_string() })?;
    fs::write(&path, bytes)
        .map_err(|e| CoreError::PolicyLoad { file: path.display().to_string(), reason: e.to_string() })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn allow_rule(id: &str, priority: u32, resources: &[&str]) -> PolicyRule {
        PolicyRule {
            id: id.to_string(),
            effect: RuleEffect::Allow,
            priority,
            resources: resources.iter().map(|s| s.to_string()).collect(),
            actions: vec!["*".into()],
            identities: vec!["*".into()],
            conditions: vec![],
        }
    }

    fn deny_rule(id: &str, priority: u32, resources: &[&str]) -> PolicyRule {
        PolicyRule {
            id: id.to_string(),
            effect: RuleEffect::Deny,
            priority,
            resources: resources.iter().map(|s| s.to_string()).collect(),
            actions: vec!["*".into()],
            identities: vec!["*".into()],
            conditions: vec![],
        }
    }

    fn policy(id: &str, rules: Vec<PolicyRule>) -> Policy {
        Policy {
            id: id.to_string(),
            name: id.to_string(),
            version: "1".to_string(),
            status: PolicyStatus::Active,
            rules,
            created_at: 0,
            updated_at: 0,
            author: None,
        }
    }

    fn engine_with(policies: Vec<Policy>, default_decision: DefaultDecision) -> (tempfile::TempDir, PolicyEngine) {
        let dir = tempfile::tempdir().unwrap();
        for p in &policies {
            write_policy_file(dir.path(), p).unwrap();
        }
        let config = PolicyEngineConfig {
            directory: dir.path().to_path_buf(),
            default_decision,
            ..Default::default()
        };
        let engine = PolicyEngine::new(config, Arc::new(FixedClock::new(1_000))).unwrap();
        (dir, engine)
    }

    #[test]
    fn deny_wins_on_equal_priority() {
        let (_dir, engine) = engine_with(
            vec![
                policy("p1", vec![allow_rule("allow", 10, &["secret:/db/*"])]),
                policy("p2", vec![deny_rule("deny", 10, &["secret:/db/*"])]),
            ],
            DefaultDecision::Deny,
        );
        let result = engine.evaluate("app1", "secret:/db/primary", &["read".into()], None, &Default::default());
        assert_eq!(result.decision, Decision::Deny);
    }

    #[test]
    fn higher_priority_deny_hides_lower_priority_allow() {
        let (_dir, engine) = engine_with(
            vec![
                policy("p1", vec![allow_rule("allow", 5, &["secret:/prod/*"])]),
                policy("p2", vec![deny_rule("deny", 100, &["secret:/prod/*"])]),
            ],
            DefaultDecision::Deny,
        );
        let result = engine.evaluate("app1", "secret:/prod/keys", &["read".into()], None, &Default::default());
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.applied_rules, vec!["deny"]);
    }

    #[test]
    fn no_match_uses_default_decision() {
        let (_dir, engine) = engine_with(vec![policy("p1", vec![allow_rule("allow", 1, &["other:*"])])], DefaultDecision::Deny);
        let result = engine.evaluate("app1", "secret:/x", &["read".into()], None, &Default::default());
        assert_eq!(result.decision, Decision::Deny);
        assert!(result.applied_rules.is_empty());
    }

    #[test]
    fn invalid_policy_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.json"), b"{\"id\":\"\"}").unwrap();
        let config = PolicyEngineConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let engine = PolicyEngine::new(config, Arc::new(FixedClock::new(0))).unwrap();
        assert_eq!(engine.stats().load_errors, 1);
        assert_eq!(engine.stats().loaded_policies, 0);
    }
}
