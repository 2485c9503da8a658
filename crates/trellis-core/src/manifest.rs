//! Plugin manifests — the immutable `plugin.json` declaration.
//!
//! A manifest is read once from the plugin directory and validated before a
//! record is created. Unknown fields are preserved but ignored.

use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").unwrap())
}

/// Plugin author block. Only `name` is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginAuthor {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A declared event subscription: when the plugin is active, `handler` is
/// invoked inside its sandbox for every event published on `topic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscriptionDecl {
    pub topic: String,
    pub handler: String,
}

/// The parsed `plugin.json`. Version fields stay as strings so that the
/// original text round-trips; use the typed accessors after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub min_platform_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_platform_version: Option<String>,
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub author: PluginAuthor,
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub event_subscriptions: Vec<EventSubscriptionDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ui_contributions: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_schema: Option<serde_json::Value>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub module_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Fields the runtime does not interpret.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl PluginManifest {
    /// Parse a manifest from its JSON text without validating it.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Concrete plugin version. Only meaningful after `validate` passed.
    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }

    pub fn min_platform(&self) -> Option<Version> {
        Version::parse(&self.min_platform_version).ok()
    }

    pub fn max_platform(&self) -> Option<Version> {
        self.max_platform_version
            .as_deref()
            .and_then(|v| Version::parse(v).ok())
    }

    /// Dependency ranges, keyed by plugin id.
    pub fn dependency_ranges(&self) -> HashMap<String, Option<VersionReq>> {
        self.dependencies
            .iter()
            .map(|(id, range)| (id.clone(), VersionReq::parse(range).ok()))
            .collect()
    }

    /// Validate every declared field, collecting all problems rather than
    /// stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.id.is_empty() {
            errors.push("missing required field 'id'".to_string());
        } else if !id_pattern().is_match(&self.id) {
            errors.push(format!(
                "id '{}' must be lowercase alphanumeric with '-' or '_'",
                self.id
            ));
        }

        if self.version.is_empty() {
            errors.push("missing required field 'version'".to_string());
        } else if Version::parse(&self.version).is_err() {
            errors.push(format!("version '{}' is not valid semver", self.version));
        }

        if self.min_platform_version.is_empty() {
            errors.push("missing required field 'minPlatformVersion'".to_string());
        } else if Version::parse(&self.min_platform_version).is_err() {
            errors.push(format!(
                "minPlatformVersion '{}' is not valid semver",
                self.min_platform_version
            ));
        }

        if let Some(max) = &self.max_platform_version
            && Version::parse(max).is_err()
        {
            errors.push(format!("maxPlatformVersion '{max}' is not valid semver"));
        }

        if self.main.is_empty() {
            errors.push("missing required field 'main'".to_string());
        } else if std::path::Path::new(&self.main).is_absolute() {
            errors.push(format!("main '{}' must be a relative path", self.main));
        }

        if self.author.name.is_empty() {
            errors.push("author requires a 'name'".to_string());
        }

        for (dep_id, range) in &self.dependencies {
            if !id_pattern().is_match(dep_id) {
                errors.push(format!("dependency id '{dep_id}' is not a valid plugin id"));
            }
            if VersionReq::parse(range).is_err() {
                errors.push(format!(
                    "dependency '{dep_id}' range '{range}' is not a valid semver range"
                ));
            }
        }

        for sub in &self.event_subscriptions {
            if sub.topic.is_empty() {
                errors.push("event subscription with empty topic".to_string());
            }
            if sub.handler.is_empty() {
                errors.push(format!(
                    "event subscription on '{}' names no handler",
                    sub.topic
                ));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> PluginManifest {
        PluginManifest::from_json(
            r#"{
                "id": "hello",
                "version": "1.0.0",
                "minPlatformVersion": "1.0.0",
                "main": "index.js",
                "author": {"name": "Someone"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn minimal_manifest_validates() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn bad_id_rejected() {
        let mut m = minimal();
        m.id = "Hello World".into();
        let errors = m.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("id")));
    }

    #[test]
    fn absolute_main_rejected() {
        let mut m = minimal();
        m.main = "/etc/passwd".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn unknown_fields_preserved() {
        let m = PluginManifest::from_json(
            r#"{
                "id": "hello",
                "version": "1.0.0",
                "minPlatformVersion": "1.0.0",
                "main": "index.js",
                "author": {"name": "Someone"},
                "homepage": "https://example.com"
            }"#,
        )
        .unwrap();
        assert!(m.extra.contains_key("homepage"));
    }
}
