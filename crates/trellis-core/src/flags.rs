//! Feature flags — rule evaluation, overrides, dependencies and caching.
//!
//! Flags gate plugin activation and arbitrary host behavior. Evaluation
//! resolves, in order: the most specific non-expired override, declared
//! flag dependencies, the first matching active rule, then the default.
//! Boolean results are cached per (flag, context) with a 60 s TTL; every
//! mutation invalidates the flag's cache entries before returning.

use crate::bus::{EventBus, PublishOptions};
use crate::error::{self, TrellisError};
use crate::host::Clock;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, warn};

const CACHE_TTL_MS: u64 = 60_000;
const CACHE_SWEEP_INTERVAL_MS: u64 = 300_000;

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9-_.]+$").unwrap())
}

// ---------------------------------------------------------------------------
// Flag model
// ---------------------------------------------------------------------------

/// Attribute map supplied to an evaluation.
pub type FlagContext = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    In,
    NotIn,
    Matches,
    NotMatches,
}

/// One predicate over the evaluation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Dotted path into the context, e.g. `attributes.plan`.
    pub attribute: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

/// A rule matches when all conditions hold and, if set, the context falls
/// inside the percentage rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    pub active: bool,
    pub value: bool,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Another flag this one requires to hold a specific value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDependency {
    pub key: String,
    pub value: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub description: String,
    pub default_value: bool,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(default)]
    pub dependencies: Vec<FlagDependency>,
    /// Plugin ids whose activation this flag gates.
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default)]
    pub created_at_ms: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl FeatureFlag {
    pub fn new(key: impl Into<String>, default_value: bool) -> Self {
        Self {
            key: key.into(),
            description: String::new(),
            default_value,
            rules: Vec::new(),
            dependencies: Vec::new(),
            plugins: Vec::new(),
            permanent: false,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    pub fn with_rule(mut self, rule: FlagRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_dependency(mut self, key: impl Into<String>, value: bool) -> Self {
        self.dependencies.push(FlagDependency {
            key: key.into(),
            value,
        });
        self
    }

    pub fn gating_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugins.push(plugin_id.into());
        self
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }
}

/// A pinned value for a flag, scoped to a context subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagOverride {
    pub key: String,
    pub value: bool,
    /// Context attributes that must all be present in the evaluation
    /// context for this override to apply. Empty matches everything.
    #[serde(default)]
    pub context: FlagContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    pub created_by: String,
    #[serde(default)]
    pub created_at_ms: u64,
}

/// Why an evaluation produced its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvalReason {
    Override,
    Dependency,
    Rule { index: usize },
    Default,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub value: bool,
    #[serde(flatten)]
    pub reason: EvalReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Evaluation {
    fn error(message: impl Into<String>) -> Self {
        Self {
            value: false,
            reason: EvalReason::Error,
            error_message: Some(message.into()),
        }
    }
}

/// Append-only record of one flag mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagAuditEntry {
    pub id: String,
    pub key: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<Value>,
    pub performed_by: String,
    pub timestamp_ms: u64,
}

#[derive(Clone, Copy)]
struct CacheEntry {
    value: bool,
    expires_at_ms: u64,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub struct FeatureFlagEvaluator {
    flags: RwLock<HashMap<String, FeatureFlag>>,
    overrides: RwLock<Vec<FlagOverride>>,
    audit: RwLock<Vec<FlagAuditEntry>>,
    cache: DashMap<String, CacheEntry>,
    last_sweep_ms: AtomicU64,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FeatureFlagEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureFlagEvaluator")
            .field("flags", &self.flags.read().map(|f| f.len()).unwrap_or(0))
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}

impl FeatureFlagEvaluator {
    pub fn new(bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            flags: RwLock::new(HashMap::new()),
            overrides: RwLock::new(Vec::new()),
            audit: RwLock::new(Vec::new()),
            cache: DashMap::new(),
            last_sweep_ms: AtomicU64::new(0),
            bus,
            clock,
        }
    }

    // -- evaluation ---------------------------------------------------------

    /// Evaluate a flag against a context. Never fails; problems surface as
    /// `reason = ERROR` with the default-safe value `false`.
    pub fn evaluate(&self, key: &str, context: &FlagContext) -> Evaluation {
        let mut visited = HashSet::new();
        self.evaluate_inner(key, context, &mut visited)
    }

    /// `visited` tracks the recursion stack, not all keys ever seen: a
    /// diamond (A needs B and C, C needs B) is legal, a cycle is not.
    fn evaluate_inner(
        &self,
        key: &str,
        context: &FlagContext,
        visited: &mut HashSet<String>,
    ) -> Evaluation {
        if !visited.insert(key.to_string()) {
            return Evaluation::error(format!("circular dependency involving '{key}'"));
        }
        let result = self.evaluate_step(key, context, visited);
        visited.remove(key);
        result
    }

    fn evaluate_step(
        &self,
        key: &str,
        context: &FlagContext,
        visited: &mut HashSet<String>,
    ) -> Evaluation {
        let flag = {
            let flags = match self.flags.read() {
                Ok(flags) => flags,
                Err(_) => return Evaluation::error("flag store lock poisoned"),
            };
            match flags.get(key) {
                Some(flag) => flag.clone(),
                None => return Evaluation::error(format!("unknown flag '{key}'")),
            }
        };

        if let Some(value) = self.matching_override(key, context) {
            return Evaluation {
                value,
                reason: EvalReason::Override,
                error_message: None,
            };
        }

        for dependency in &flag.dependencies {
            let actual = self.evaluate_inner(&dependency.key, context, visited);
            if actual.reason == EvalReason::Error {
                return actual;
            }
            if actual.value != dependency.value {
                return Evaluation {
                    value: false,
                    reason: EvalReason::Dependency,
                    error_message: None,
                };
            }
        }

        for (index, rule) in flag.rules.iter().enumerate() {
            if !rule.active {
                continue;
            }
            if rule
                .conditions
                .iter()
                .all(|c| condition_holds(c, context))
                && percentage_admits(rule.percentage, context)
            {
                return Evaluation {
                    value: rule.value,
                    reason: EvalReason::Rule { index },
                    error_message: None,
                };
            }
        }

        Evaluation {
            value: flag.default_value,
            reason: EvalReason::Default,
            error_message: None,
        }
    }

    /// Most specific non-expired override whose context is a subset of the
    /// evaluation context. Specificity is the attribute count; insertion
    /// order breaks ties.
    fn matching_override(&self, key: &str, context: &FlagContext) -> Option<bool> {
        let now = self.clock.now_ms();
        let overrides = self.overrides.read().ok()?;
        let mut best: Option<(usize, bool)> = None;
        for o in overrides.iter() {
            if o.key != key {
                continue;
            }
            if o.expires_at_ms.is_some_and(|expiry| expiry <= now) {
                continue;
            }
            let subset = o
                .context
                .iter()
                .all(|(attr, required)| context.get(attr) == Some(required));
            if !subset {
                continue;
            }
            let specificity = o.context.len();
            if best.is_none_or(|(count, _)| specificity > count) {
                best = Some((specificity, o.value));
            }
        }
        best.map(|(_, value)| value)
    }

    /// Boolean gate with caching. Evaluation errors degrade to `false`.
    pub fn is_enabled(&self, key: &str, context: &FlagContext) -> bool {
        self.maybe_sweep();
        let now = self.clock.now_ms();
        let cache_key = format!("{key}:{:016x}", context_hash(context));

        if let Some(entry) = self.cache.get(&cache_key)
            && entry.expires_at_ms > now
        {
            return entry.value;
        }

        let evaluation = self.evaluate(key, context);
        if evaluation.reason == EvalReason::Error {
            warn!(
                flag = %key,
                error = evaluation.error_message.as_deref().unwrap_or("unknown"),
                "Flag evaluation failed, returning false"
            );
            return false;
        }

        self.cache.insert(
            cache_key,
            CacheEntry {
                value: evaluation.value,
                expires_at_ms: now + CACHE_TTL_MS,
            },
        );
        evaluation.value
    }

    /// Whether a plugin may activate: true unless a flag that gates this
    /// plugin evaluates false.
    pub fn should_activate_plugin(&self, plugin_id: &str, context: &FlagContext) -> bool {
        let gating: Vec<String> = match self.flags.read() {
            Ok(flags) => flags
                .values()
                .filter(|f| f.plugins.iter().any(|p| p == plugin_id))
                .map(|f| f.key.clone())
                .collect(),
            Err(_) => return false,
        };
        gating.iter().all(|key| {
            let evaluation = self.evaluate(key, context);
            evaluation.reason != EvalReason::Error && evaluation.value
        })
    }

    fn maybe_sweep(&self) {
        let now = self.clock.now_ms();
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < CACHE_SWEEP_INTERVAL_MS {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let before = self.cache.len();
            self.cache.retain(|_, entry| entry.expires_at_ms > now);
            debug!(
                evicted = before - self.cache.len(),
                "Swept expired flag cache entries"
            );
        }
    }

    fn invalidate(&self, key: &str) {
        let prefix = format!("{key}:");
        self.cache.retain(|cache_key, _| !cache_key.starts_with(&prefix));
    }

    // -- mutation -----------------------------------------------------------

    fn validate_flag(&self, flag: &FeatureFlag, replacing: bool) -> error::Result<()> {
        if !key_pattern().is_match(&flag.key) {
            return Err(TrellisError::FlagInvalid {
                key: flag.key.clone(),
                message: "key must match ^[a-z0-9-_.]+$".to_string(),
            });
        }
        for rule in &flag.rules {
            if let Some(p) = rule.percentage
                && !(0.0..=100.0).contains(&p)
            {
                return Err(TrellisError::FlagInvalid {
                    key: flag.key.clone(),
                    message: format!("rule percentage {p} is outside [0, 100]"),
                });
            }
        }

        let flags = self
            .flags
            .read()
            .map_err(|_| TrellisError::internal("flag store lock poisoned"))?;
        for dependency in &flag.dependencies {
            if dependency.key != flag.key && !flags.contains_key(&dependency.key) {
                return Err(TrellisError::FlagInvalid {
                    key: flag.key.clone(),
                    message: format!("dependency '{}' does not exist", dependency.key),
                });
            }
        }
        if !replacing && flags.contains_key(&flag.key) {
            return Err(TrellisError::FlagInvalid {
                key: flag.key.clone(),
                message: "flag already exists".to_string(),
            });
        }

        // Cycle check: DFS over the dependency graph as it would look with
        // this flag in place.
        let mut stack = vec![flag.key.clone()];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let dependencies: Vec<String> = if current == flag.key {
                flag.dependencies.iter().map(|d| d.key.clone()).collect()
            } else {
                flags
                    .get(&current)
                    .map(|f| f.dependencies.iter().map(|d| d.key.clone()).collect())
                    .unwrap_or_default()
            };
            for dep in dependencies {
                if dep == flag.key {
                    return Err(TrellisError::CircularDependency {
                        key: flag.key.clone(),
                    });
                }
                stack.push(dep);
            }
        }
        Ok(())
    }

    pub async fn create_flag(
        &self,
        mut flag: FeatureFlag,
        performed_by: &str,
    ) -> error::Result<()> {
        self.validate_flag(&flag, false)?;
        let now = self.clock.now_ms();
        flag.created_at_ms = now;
        flag.updated_at_ms = now;
        let key = flag.key.clone();
        let new_state = serde_json::to_value(&flag).ok();
        {
            let mut flags = self
                .flags
                .write()
                .map_err(|_| TrellisError::internal("flag store lock poisoned"))?;
            flags.insert(key.clone(), flag);
        }
        self.invalidate(&key);
        self.record_audit(&key, "created", None, new_state, performed_by);
        self.publish_mutation("featureFlags.created", &key, performed_by).await;
        Ok(())
    }

    pub async fn update_flag(
        &self,
        mut flag: FeatureFlag,
        performed_by: &str,
    ) -> error::Result<()> {
        let previous = {
            let flags = self
                .flags
                .read()
                .map_err(|_| TrellisError::internal("flag store lock poisoned"))?;
            flags
                .get(&flag.key)
                .cloned()
                .ok_or_else(|| TrellisError::FlagNotFound {
                    key: flag.key.clone(),
                })?
        };
        self.validate_flag(&flag, true)?;
        flag.created_at_ms = previous.created_at_ms;
        flag.updated_at_ms = self.clock.now_ms();
        let key = flag.key.clone();
        let new_state = serde_json::to_value(&flag).ok();
        {
            let mut flags = self
                .flags
                .write()
                .map_err(|_| TrellisError::internal("flag store lock poisoned"))?;
            flags.insert(key.clone(), flag);
        }
        self.invalidate(&key);
        self.record_audit(
            &key,
            "updated",
            serde_json::to_value(&previous).ok(),
            new_state,
            performed_by,
        );
        self.publish_mutation("featureFlags.updated", &key, performed_by).await;
        Ok(())
    }

    pub async fn delete_flag(&self, key: &str, performed_by: &str) -> error::Result<()> {
        let previous = {
            let mut flags = self
                .flags
                .write()
                .map_err(|_| TrellisError::internal("flag store lock poisoned"))?;
            let flag = flags.get(key).ok_or_else(|| TrellisError::FlagNotFound {
                key: key.to_string(),
            })?;
            if flag.permanent {
                return Err(TrellisError::FlagPermanentDelete {
                    key: key.to_string(),
                });
            }
            flags.remove(key)
        };
        self.invalidate(key);
        self.record_audit(
            key,
            "deleted",
            previous.and_then(|f| serde_json::to_value(&f).ok()),
            None,
            performed_by,
        );
        self.publish_mutation("featureFlags.deleted", key, performed_by).await;
        Ok(())
    }

    pub async fn set_override(&self, mut o: FlagOverride) -> error::Result<()> {
        {
            let flags = self
                .flags
                .read()
                .map_err(|_| TrellisError::internal("flag store lock poisoned"))?;
            if !flags.contains_key(&o.key) {
                return Err(TrellisError::FlagNotFound { key: o.key.clone() });
            }
        }
        o.created_at_ms = self.clock.now_ms();
        let key = o.key.clone();
        let actor = o.created_by.clone();
        let new_state = serde_json::to_value(&o).ok();
        {
            let mut overrides = self
                .overrides
                .write()
                .map_err(|_| TrellisError::internal("override lock poisoned"))?;
            overrides.push(o);
        }
        self.invalidate(&key);
        self.record_audit(&key, "overrideSet", None, new_state, &actor);
        self.publish_mutation("featureFlags.overrideSet", &key, &actor).await;
        Ok(())
    }

    /// Remove overrides for `key` whose context equals `context` exactly.
    pub async fn remove_override(
        &self,
        key: &str,
        context: &FlagContext,
        performed_by: &str,
    ) -> error::Result<bool> {
        let removed: Vec<FlagOverride> = {
            let mut overrides = self
                .overrides
                .write()
                .map_err(|_| TrellisError::internal("override lock poisoned"))?;
            let mut removed = Vec::new();
            overrides.retain(|o| {
                if o.key == key && &o.context == context {
                    removed.push(o.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };
        if removed.is_empty() {
            return Ok(false);
        }
        self.invalidate(key);
        self.record_audit(
            key,
            "overrideRemoved",
            serde_json::to_value(&removed).ok(),
            None,
            performed_by,
        );
        self.publish_mutation("featureFlags.overrideRemoved", key, performed_by)
            .await;
        Ok(true)
    }

    fn record_audit(
        &self,
        key: &str,
        action: &str,
        previous_state: Option<Value>,
        new_state: Option<Value>,
        performed_by: &str,
    ) {
        let entry = FlagAuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            action: action.to_string(),
            previous_state,
            new_state,
            performed_by: performed_by.to_string(),
            timestamp_ms: self.clock.now_ms(),
        };
        if let Ok(mut audit) = self.audit.write() {
            audit.push(entry);
        }
    }

    async fn publish_mutation(&self, topic: &str, key: &str, actor: &str) {
        let payload = serde_json::json!({
            "key": key,
            "actor": actor,
            "timestamp": self.clock.now_ms(),
        });
        if let Err(e) = self
            .bus
            .publish(topic, payload, PublishOptions::from_source("feature-flags"))
            .await
        {
            warn!(topic = %topic, error = %e, "Failed to publish flag mutation");
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn get_flag(&self, key: &str) -> Option<FeatureFlag> {
        self.flags.read().ok()?.get(key).cloned()
    }

    pub fn list_flags(&self) -> Vec<FeatureFlag> {
        let mut flags: Vec<FeatureFlag> = self
            .flags
            .read()
            .map(|f| f.values().cloned().collect())
            .unwrap_or_default();
        flags.sort_by(|a, b| a.key.cmp(&b.key));
        flags
    }

    pub fn audit_trail(&self, key: Option<&str>) -> Vec<FlagAuditEntry> {
        self.audit
            .read()
            .map(|audit| {
                audit
                    .iter()
                    .filter(|e| key.is_none_or(|k| e.key == k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Walk a dotted attribute path through the context.
fn context_attribute<'a>(context: &'a FlagContext, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = context.get(first)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn condition_holds(condition: &RuleCondition, context: &FlagContext) -> bool {
    let actual = context_attribute(context, &condition.attribute);
    let expected = &condition.value;
    match condition.operator {
        ConditionOperator::Eq => actual == Some(expected),
        ConditionOperator::Neq => actual != Some(expected),
        ConditionOperator::Gt => compare_numbers(actual, expected, |a, b| a > b),
        ConditionOperator::Gte => compare_numbers(actual, expected, |a, b| a >= b),
        ConditionOperator::Lt => compare_numbers(actual, expected, |a, b| a < b),
        ConditionOperator::Lte => compare_numbers(actual, expected, |a, b| a <= b),
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::NotContains => !contains(actual, expected),
        ConditionOperator::In => expected
            .as_array()
            .is_some_and(|set| actual.is_some_and(|a| set.contains(a))),
        ConditionOperator::NotIn => expected
            .as_array()
            .is_some_and(|set| actual.is_none_or(|a| !set.contains(a))),
        ConditionOperator::Matches => regex_match(actual, expected),
        ConditionOperator::NotMatches => !regex_match(actual, expected),
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(Value::as_f64), expected.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn contains(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        Some(Value::String(s)) => expected.as_str().is_some_and(|needle| s.contains(needle)),
        Some(Value::Array(items)) => items.contains(expected),
        _ => false,
    }
}

fn regex_match(actual: Option<&Value>, expected: &Value) -> bool {
    let (Some(text), Some(pattern)) = (actual.and_then(Value::as_str), expected.as_str()) else {
        return false;
    };
    Regex::new(pattern).is_ok_and(|re| re.is_match(text))
}

fn percentage_admits(percentage: Option<f64>, context: &FlagContext) -> bool {
    let Some(percentage) = percentage else {
        return true;
    };
    let basis = match context.get("userId").and_then(Value::as_str) {
        Some(user_id) => fnv1a64(user_id.as_bytes()),
        None => context_hash(context),
    };
    ((basis % 100) as f64) < percentage
}

/// Stable 64-bit FNV-1a. The standard hasher is not stable across releases
/// and percentage rollouts must not reshuffle on upgrade.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn context_hash(context: &FlagContext) -> u64 {
    let serialized = serde_json::to_string(context).unwrap_or_default();
    fnv1a64(serialized.as_bytes())
}
