//! Capability permissions — parsing, validation, risk scoring and rate
//! limiting for `<category>:<action>` grants.
//!
//! Categories form a closed set. The action may be a concrete verb or `*`
//! for a whole-category grant; the bare string `*` is a superuser grant and
//! always requires approval.

use crate::host::Clock;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// The closed category set.
pub const CATEGORIES: &[&str] = &[
    "file",
    "network",
    "database",
    "event",
    "llm",
    "ml",
    "code",
    "project",
    "template",
    "analytics",
    "crypto",
    "buffer",
    "system",
    "plugin",
    "security",
];

// ---------------------------------------------------------------------------
// Rule records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn score(&self) -> u32 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 5,
            RiskLevel::High => 10,
            RiskLevel::Critical => 20,
        }
    }
}

/// Sliding-window budget attached to a permission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub window_ms: u64,
}

/// Everything the validator knows about one permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub permission: String,
    pub description: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub required_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_resources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

impl PermissionRule {
    fn new(permission: &str, description: &str, risk_level: RiskLevel) -> Self {
        Self {
            permission: permission.to_string(),
            description: description.to_string(),
            risk_level,
            required_approval: false,
            allowed_resources: None,
            rate_limit: None,
        }
    }

    fn approval(mut self) -> Self {
        self.required_approval = true;
        self
    }

    fn resources(mut self, resources: &[&str]) -> Self {
        self.allowed_resources = Some(resources.iter().map(|r| r.to_string()).collect());
        self
    }

    fn rate(mut self, requests: u32, window_ms: u64) -> Self {
        self.rate_limit = Some(RateLimit {
            requests,
            window_ms,
        });
        self
    }
}

/// Result of validating a declared permission set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub required_approvals: Vec<String>,
}

/// Aggregate risk report for a permission set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionReport {
    pub summary: ReportSummary,
    pub details: Vec<PermissionDetail>,
    pub risk_score: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub by_risk: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDetail {
    pub permission: String,
    pub description: String,
    pub risk_level: Option<RiskLevel>,
    pub rate_limited: bool,
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Pairs of grants that together flag a data-exfiltration or escalation
/// risk.
const DANGEROUS_COMBINATIONS: &[(&str, &str, &str)] = &[
    (
        "file:write",
        "network:http",
        "file writes combined with outbound HTTP enable data exfiltration",
    ),
    (
        "database:write",
        "network:http",
        "database writes combined with outbound HTTP enable data exfiltration",
    ),
    (
        "plugin:communicate",
        "file:write",
        "cross-plugin messaging combined with file writes enables privilege escalation",
    ),
];

pub struct PermissionValidator {
    rules: HashMap<String, PermissionRule>,
    trackers: DashMap<(String, String), Vec<u64>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PermissionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionValidator")
            .field("rules", &self.rules.len())
            .field("trackers", &self.trackers.len())
            .finish()
    }
}

impl PermissionValidator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: Self::default_rules()
                .into_iter()
                .map(|r| (r.permission.clone(), r))
                .collect(),
            trackers: DashMap::new(),
            clock,
        }
    }

    fn default_rules() -> Vec<PermissionRule> {
        vec![
            PermissionRule::new("file:read", "Read files inside the plugin scope", RiskLevel::Medium)
                .resources(&["plugins/", "data/plugins/"]),
            PermissionRule::new("file:write", "Write files inside the plugin scope", RiskLevel::High)
                .resources(&["plugins/", "data/plugins/"])
                .rate(100, 60_000),
            PermissionRule::new("file:delete", "Delete files inside the plugin scope", RiskLevel::Critical)
                .approval()
                .resources(&["plugins/", "data/plugins/"]),
            PermissionRule::new("network:http", "Make outbound HTTP requests", RiskLevel::High)
                .rate(100, 60_000),
            PermissionRule::new("network:websocket", "Open outbound websocket connections", RiskLevel::High)
                .rate(10, 60_000),
            PermissionRule::new("database:read", "Query host collections", RiskLevel::Medium)
                .rate(500, 60_000),
            PermissionRule::new("database:write", "Mutate host collections", RiskLevel::High)
                .rate(200, 60_000),
            PermissionRule::new("database:admin", "Administer the data store", RiskLevel::Critical)
                .approval(),
            PermissionRule::new("event:publish", "Publish events on the bus", RiskLevel::Low)
                .rate(1000, 60_000),
            PermissionRule::new("event:subscribe", "Subscribe to bus topics", RiskLevel::Low),
            PermissionRule::new("llm:query", "Query the host language model", RiskLevel::Medium)
                .rate(60, 60_000),
            PermissionRule::new("llm:train", "Submit fine-tuning jobs", RiskLevel::Critical)
                .approval(),
            PermissionRule::new("ml:inference", "Run model inference", RiskLevel::Medium)
                .rate(120, 60_000),
            PermissionRule::new("code:execute", "Execute generated code", RiskLevel::Critical)
                .approval(),
            PermissionRule::new("code:analyze", "Run static analysis", RiskLevel::Medium),
            PermissionRule::new("project:read", "Read project metadata", RiskLevel::Low),
            PermissionRule::new("project:write", "Modify project metadata", RiskLevel::Medium),
            PermissionRule::new("template:read", "Read shared templates", RiskLevel::Low),
            PermissionRule::new("template:render", "Render templates", RiskLevel::Low)
                .rate(300, 60_000),
            PermissionRule::new("analytics:track", "Record analytics events", RiskLevel::Low)
                .rate(600, 60_000),
            PermissionRule::new("analytics:read", "Read aggregated analytics", RiskLevel::Medium),
            PermissionRule::new("crypto:encrypt", "Encrypt data via the host", RiskLevel::Medium),
            PermissionRule::new("crypto:decrypt", "Decrypt data via the host", RiskLevel::High),
            PermissionRule::new("crypto:sign", "Sign payloads via the host", RiskLevel::High),
            PermissionRule::new("buffer:allocate", "Allocate shared buffers", RiskLevel::Medium)
                .rate(100, 60_000),
            PermissionRule::new("system:info", "Read host system information", RiskLevel::Low),
            PermissionRule::new("system:env", "Read whitelisted environment variables", RiskLevel::High),
            PermissionRule::new("system:exec", "Spawn host processes", RiskLevel::Critical)
                .approval(),
            PermissionRule::new("plugin:communicate", "Message other plugins", RiskLevel::Medium)
                .rate(200, 60_000),
            PermissionRule::new("plugin:manage", "Manage other plugin lifecycles", RiskLevel::Critical)
                .approval(),
            PermissionRule::new("security:audit", "Read the audit trail", RiskLevel::High)
                .approval(),
        ]
    }

    /// Every permission the validator knows about.
    pub fn known_permissions(&self) -> Vec<&PermissionRule> {
        let mut rules: Vec<&PermissionRule> = self.rules.values().collect();
        rules.sort_by(|a, b| a.permission.cmp(&b.permission));
        rules
    }

    pub fn is_known(&self, permission: &str) -> bool {
        self.parse(permission).is_ok()
    }

    /// Split and sanity-check a permission string. Returns
    /// `(category, action)`; the superuser grant parses as `("*", "*")`.
    fn parse<'a>(&self, permission: &'a str) -> Result<(&'a str, &'a str), String> {
        if permission == "*" {
            return Ok(("*", "*"));
        }
        let Some((category, action)) = permission.split_once(':') else {
            return Err(format!(
                "'{permission}' is not of the form <category>:<action>"
            ));
        };
        if !CATEGORIES.contains(&category) {
            return Err(format!("unknown category '{category}'"));
        }
        if action.is_empty() {
            return Err(format!("'{permission}' names no action"));
        }
        if action != "*" && !self.rules.contains_key(permission) {
            return Err(format!("unknown permission '{permission}'"));
        }
        Ok((category, action))
    }

    /// Validate a declared permission set: unknown grants and dangerous
    /// combinations are errors, high and critical risks are warnings.
    pub fn validate(&self, permissions: &[String]) -> ValidationReport {
        let mut report = ValidationReport::default();
        let granted: HashSet<&str> = permissions.iter().map(String::as_str).collect();

        for permission in permissions {
            match self.parse(permission) {
                Err(message) => report.errors.push(message),
                Ok(("*", "*")) => {
                    report
                        .warnings
                        .push("'*' grants every capability".to_string());
                    report.required_approvals.push(permission.clone());
                }
                Ok((category, "*")) => {
                    report.warnings.push(format!(
                        "'{permission}' grants every '{category}' action"
                    ));
                    report.required_approvals.push(permission.clone());
                }
                Ok(_) => {
                    if let Some(rule) = self.rules.get(permission) {
                        if rule.risk_level >= RiskLevel::High {
                            report.warnings.push(format!(
                                "'{permission}' carries {} risk: {}",
                                match rule.risk_level {
                                    RiskLevel::Critical => "critical",
                                    _ => "high",
                                },
                                rule.description
                            ));
                        }
                        if rule.required_approval {
                            report.required_approvals.push(permission.clone());
                        }
                    }
                }
            }
        }

        for (a, b, reason) in DANGEROUS_COMBINATIONS {
            if Self::grants(&granted, a) && Self::grants(&granted, b) {
                report
                    .errors
                    .push(format!("dangerous combination '{a}' + '{b}': {reason}"));
            }
        }

        report.valid = report.errors.is_empty();
        report
    }

    /// Whether a granted set covers `target`, accounting for category and
    /// superuser wildcards.
    fn grants(granted: &HashSet<&str>, target: &str) -> bool {
        if granted.contains(target) || granted.contains("*") {
            return true;
        }
        target
            .split_once(':')
            .is_some_and(|(category, _)| granted.contains(format!("{category}:*").as_str()))
    }

    /// Admit or reject one use of `permission` by `plugin_id` under the
    /// rule's sliding window. Permissions without a rate limit always pass.
    pub fn check_rate_limit(&self, plugin_id: &str, permission: &str) -> bool {
        let Some(limit) = self.rules.get(permission).and_then(|r| r.rate_limit) else {
            return true;
        };
        let now = self.clock.now_ms();
        let mut entry = self
            .trackers
            .entry((plugin_id.to_string(), permission.to_string()))
            .or_default();
        let cutoff = now.saturating_sub(limit.window_ms);
        entry.retain(|&ts| ts > cutoff);
        if entry.len() < limit.requests as usize {
            entry.push(now);
            true
        } else {
            warn!(
                plugin_id = %plugin_id,
                permission = %permission,
                limit = limit.requests,
                window_ms = limit.window_ms,
                "Rate limit exceeded"
            );
            false
        }
    }

    /// Check a concrete resource against the permission's whitelist.
    /// Permissions without a whitelist accept any resource.
    pub fn validate_resource_access(&self, permission: &str, resource: &str) -> bool {
        let Some(allowed) = self
            .rules
            .get(permission)
            .and_then(|r| r.allowed_resources.as_ref())
        else {
            return true;
        };
        let normalized = normalize_path(resource);
        allowed
            .iter()
            .any(|prefix| normalized.starts_with(&normalize_path(prefix)))
    }

    /// Risk report over a permission set. Unknown permissions appear in the
    /// details with no risk level and contribute nothing to the score.
    pub fn generate_permission_report(&self, permissions: &[String]) -> PermissionReport {
        let mut by_risk: HashMap<String, usize> = HashMap::new();
        let mut details = Vec::new();
        let mut risk_score = 0;

        for permission in permissions {
            match self.rules.get(permission) {
                Some(rule) => {
                    let label = match rule.risk_level {
                        RiskLevel::Low => "low",
                        RiskLevel::Medium => "medium",
                        RiskLevel::High => "high",
                        RiskLevel::Critical => "critical",
                    };
                    *by_risk.entry(label.to_string()).or_default() += 1;
                    risk_score += rule.risk_level.score();
                    details.push(PermissionDetail {
                        permission: permission.clone(),
                        description: rule.description.clone(),
                        risk_level: Some(rule.risk_level),
                        rate_limited: rule.rate_limit.is_some(),
                    });
                }
                None => {
                    *by_risk.entry("unknown".to_string()).or_default() += 1;
                    details.push(PermissionDetail {
                        permission: permission.clone(),
                        description: "unknown permission".to_string(),
                        risk_level: None,
                        rate_limited: false,
                    });
                }
            }
        }

        PermissionReport {
            summary: ReportSummary {
                total: permissions.len(),
                by_risk,
            },
            details,
            risk_score,
        }
    }

    /// Drop rate-limit history, either for one plugin or for all.
    pub fn clear_rate_limit_trackers(&self, plugin_id: Option<&str>) {
        match plugin_id {
            Some(id) => self.trackers.retain(|(tracked, _), _| tracked.as_str() != id),
            None => self.trackers.clear(),
        }
    }
}

/// Lexically normalize a path: strip `.` segments, resolve `..` against
/// prior segments, and join with `/`. No filesystem access.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}
