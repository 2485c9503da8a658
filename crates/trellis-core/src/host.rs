//! Host collaborator seams consumed by the runtime.
//!
//! The registry and its components never reach out to the surrounding
//! application directly; everything flows through these traits so that
//! embedders can supply their own store, security service, UI shell and
//! clock, and so that tests stay hermetic.

use crate::error::{self, TrellisError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Monotonic time source in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock backed by `SystemTime`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(std::time::Duration::ZERO)
            .as_millis() as u64
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// DataStore
// ---------------------------------------------------------------------------

/// Key-value persistence used for plugin storage and optionally the flag
/// store. Keys are opaque strings; values are JSON.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get(&self, key: &str) -> error::Result<Option<serde_json::Value>>;
    async fn set(&self, key: &str, value: serde_json::Value) -> error::Result<()>;
    async fn delete(&self, key: &str) -> error::Result<bool>;
    /// List keys under a prefix. Backs scoped `clear` operations.
    async fn keys(&self, prefix: &str) -> error::Result<Vec<String>>;
}

/// In-process store for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, key: &str) -> error::Result<Option<serde_json::Value>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| TrellisError::storage("store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> error::Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| TrellisError::storage("store lock poisoned"))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> error::Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| TrellisError::storage("store lock poisoned"))?;
        Ok(entries.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> error::Result<Vec<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| TrellisError::storage("store lock poisoned"))?;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// SecurityService
// ---------------------------------------------------------------------------

/// Outcome of an authorization check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// An entry for the host's audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub timestamp_ms: u64,
}

/// Authorization and audit surface supplied by the host.
#[async_trait]
pub trait SecurityService: Send + Sync {
    async fn has_permission(&self, subject: &str, permission: &str) -> AuthorizationDecision;

    async fn log_event(&self, event: AuditEvent) -> error::Result<()>;

    /// Called by the sandbox before dispatching a method call into plugin
    /// code. A denial aborts the call.
    async fn validate_plugin_action(
        &self,
        plugin_id: &str,
        action: &str,
        args: &[serde_json::Value],
    ) -> AuthorizationDecision;
}

/// Permits everything and keeps audit events in memory.
#[derive(Debug, Default)]
pub struct AllowAllSecurity {
    events: RwLock<Vec<AuditEvent>>,
}

impl AllowAllSecurity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> error::Result<Vec<AuditEvent>> {
        Ok(self
            .events
            .read()
            .map_err(|_| TrellisError::internal("audit log lock poisoned"))?
            .clone())
    }
}

#[async_trait]
impl SecurityService for AllowAllSecurity {
    async fn has_permission(&self, _subject: &str, _permission: &str) -> AuthorizationDecision {
        AuthorizationDecision {
            granted: true,
            reason: None,
        }
    }

    async fn log_event(&self, event: AuditEvent) -> error::Result<()> {
        self.events
            .write()
            .map_err(|_| TrellisError::internal("audit log lock poisoned"))?
            .push(event);
        Ok(())
    }

    async fn validate_plugin_action(
        &self,
        _plugin_id: &str,
        _action: &str,
        _args: &[serde_json::Value],
    ) -> AuthorizationDecision {
        AuthorizationDecision {
            granted: true,
            reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// UiShell
// ---------------------------------------------------------------------------

/// A UI component registered by a plugin. The definition is opaque to the
/// runtime; only the identity tagging matters here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiComponent {
    pub id: String,
    pub plugin_id: String,
    pub component_type: String,
    pub definition: serde_json::Value,
}

/// Component registry supplied by the host shell.
pub trait UiShell: Send + Sync {
    /// Register a component, returning its assigned id.
    fn register_component(
        &self,
        plugin_id: &str,
        component_type: &str,
        definition: serde_json::Value,
    ) -> error::Result<String>;

    /// Idempotent removal.
    fn unregister_component(&self, component_id: &str) -> error::Result<bool>;

    fn components_by_type(&self, component_type: &str) -> error::Result<Vec<UiComponent>>;
}

/// Simple shell for tests and headless hosts.
#[derive(Debug, Default)]
pub struct InMemoryUiShell {
    components: RwLock<HashMap<String, UiComponent>>,
    next_id: AtomicU64,
}

impl InMemoryUiShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn component_count(&self) -> error::Result<usize> {
        Ok(self
            .components
            .read()
            .map_err(|_| TrellisError::internal("ui shell lock poisoned"))?
            .len())
    }
}

impl UiShell for InMemoryUiShell {
    fn register_component(
        &self,
        plugin_id: &str,
        component_type: &str,
        definition: serde_json::Value,
    ) -> error::Result<String> {
        let id = format!("cmp_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let component = UiComponent {
            id: id.clone(),
            plugin_id: plugin_id.to_string(),
            component_type: component_type.to_string(),
            definition,
        };
        self.components
            .write()
            .map_err(|_| TrellisError::internal("ui shell lock poisoned"))?
            .insert(id.clone(), component);
        Ok(id)
    }

    fn unregister_component(&self, component_id: &str) -> error::Result<bool> {
        Ok(self
            .components
            .write()
            .map_err(|_| TrellisError::internal("ui shell lock poisoned"))?
            .remove(component_id)
            .is_some())
    }

    fn components_by_type(&self, component_type: &str) -> error::Result<Vec<UiComponent>> {
        Ok(self
            .components
            .read()
            .map_err(|_| TrellisError::internal("ui shell lock poisoned"))?
            .values()
            .filter(|cmp| cmp.component_type == component_type)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// RouteRegistry
// ---------------------------------------------------------------------------

/// A path + handler record registered by a plugin. The host's HTTP layer
/// decides what to do with these; the runtime only tracks ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRoute {
    pub id: String,
    pub plugin_id: String,
    pub method: String,
    pub path: String,
    /// Plugin method invoked for requests on this route.
    pub handler: String,
}

pub trait RouteRegistry: Send + Sync {
    fn register_route(
        &self,
        plugin_id: &str,
        method: &str,
        path: &str,
        handler: &str,
    ) -> error::Result<String>;

    /// Idempotent removal.
    fn unregister_route(&self, route_id: &str) -> error::Result<bool>;

    fn routes_for_plugin(&self, plugin_id: &str) -> error::Result<Vec<ApiRoute>>;
}

#[derive(Debug, Default)]
pub struct InMemoryRouteRegistry {
    routes: RwLock<HashMap<String, ApiRoute>>,
    next_id: AtomicU64,
}

impl InMemoryRouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_count(&self) -> error::Result<usize> {
        Ok(self
            .routes
            .read()
            .map_err(|_| TrellisError::internal("route registry lock poisoned"))?
            .len())
    }
}

impl RouteRegistry for InMemoryRouteRegistry {
    fn register_route(
        &self,
        plugin_id: &str,
        method: &str,
        path: &str,
        handler: &str,
    ) -> error::Result<String> {
        let id = format!("route_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let route = ApiRoute {
            id: id.clone(),
            plugin_id: plugin_id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            handler: handler.to_string(),
        };
        self.routes
            .write()
            .map_err(|_| TrellisError::internal("route registry lock poisoned"))?
            .insert(id.clone(), route);
        Ok(id)
    }

    fn unregister_route(&self, route_id: &str) -> error::Result<bool> {
        Ok(self
            .routes
            .write()
            .map_err(|_| TrellisError::internal("route registry lock poisoned"))?
            .remove(route_id)
            .is_some())
    }

    fn routes_for_plugin(&self, plugin_id: &str) -> error::Result<Vec<ApiRoute>> {
        Ok(self
            .routes
            .read()
            .map_err(|_| TrellisError::internal("route registry lock poisoned"))?
            .values()
            .filter(|route| route.plugin_id == plugin_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Platform snapshot
// ---------------------------------------------------------------------------

/// Read-only view of the host exposed to plugin contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub version: semver::Version,
    pub environment: String,
    pub features: Vec<String>,
}

impl PlatformInfo {
    pub fn new(version: semver::Version, environment: impl Into<String>) -> Self {
        Self {
            version,
            environment: environment.into(),
            features: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: Vec<String>) -> Self {
        self.features = features;
        self
    }
}
