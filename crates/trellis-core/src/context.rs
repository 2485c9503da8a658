//! Plugin context — the per-activation façade over host services.
//!
//! Everything a plugin touches goes through here with its identity
//! attached: log records carry the plugin id, published events carry a
//! forced `plugin:<id>` source, storage keys are prefixed, and UI
//! components are tagged. The context holds no reference back into the
//! registry; it is built from the shared services and torn down on
//! deactivation.

use crate::bus::{EventBus, EventHandler, PublishOptions, SubscribeOptions, META_PLUGIN_ID};
use crate::error::{self, TrellisError};
use crate::flags::FeatureFlagEvaluator;
use crate::host::{DataStore, PlatformInfo, RouteRegistry, SecurityService, UiShell};
use semver::Version;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Logger wrapper
// ---------------------------------------------------------------------------

/// Logger that stamps every record with the owning plugin id.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: String,
}

impl PluginLogger {
    pub fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
        }
    }

    pub fn debug(&self, message: &str, context: &HashMap<String, Value>) {
        debug!(plugin_id = %self.plugin_id, context = ?context, "{message}");
    }

    pub fn info(&self, message: &str, context: &HashMap<String, Value>) {
        info!(plugin_id = %self.plugin_id, context = ?context, "{message}");
    }

    pub fn warn(&self, message: &str, context: &HashMap<String, Value>) {
        warn!(plugin_id = %self.plugin_id, context = ?context, "{message}");
    }

    pub fn error(&self, message: &str, context: &HashMap<String, Value>) {
        error!(plugin_id = %self.plugin_id, context = ?context, "{message}");
    }
}

// ---------------------------------------------------------------------------
// Bus wrapper
// ---------------------------------------------------------------------------

/// Bus view handed to plugins. Publications carry a forced source and
/// subscriptions are tagged so the registry can revoke them in bulk.
pub struct PluginBus {
    bus: Arc<EventBus>,
    plugin_id: String,
    source: String,
}

impl PluginBus {
    pub fn new(bus: Arc<EventBus>, plugin_id: &str) -> Self {
        Self {
            bus,
            plugin_id: plugin_id.to_string(),
            source: format!("plugin:{plugin_id}"),
        }
    }

    /// Publish with `source` forced to `plugin:<id>` regardless of what the
    /// caller claims.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: Value,
    ) -> error::Result<usize> {
        self.bus
            .publish(topic, payload, PublishOptions::from_source(&self.source))
            .await
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> error::Result<String> {
        self.bus
            .subscribe(topic, handler, self.tagged(options))
    }

    pub fn subscribe_pattern(
        &self,
        pattern: impl Into<String>,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> error::Result<String> {
        self.bus
            .subscribe_pattern(pattern, handler, self.tagged(options))
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> error::Result<bool> {
        self.bus.unsubscribe(subscription_id)
    }

    pub fn subscriber_count(&self, topic: &str) -> error::Result<usize> {
        self.bus.subscriber_count(topic)
    }

    pub fn active_topics(&self) -> error::Result<Vec<String>> {
        self.bus.active_topics()
    }

    /// Refused: only the host may clear the broker.
    pub fn clear_all(&self) -> error::Result<()> {
        Err(TrellisError::not_permitted("eventBus.clearAllSubscriptions"))
    }

    /// Refused: only the host may destroy the broker.
    pub fn destroy(&self) -> error::Result<()> {
        Err(TrellisError::not_permitted("eventBus.destroy"))
    }

    fn tagged(&self, options: SubscribeOptions) -> SubscribeOptions {
        options.with_metadata(META_PLUGIN_ID, self.plugin_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Storage wrapper
// ---------------------------------------------------------------------------

/// Key-value storage scoped under `plugin:<id>:`.
pub struct PluginStorage {
    store: Arc<dyn DataStore>,
    prefix: String,
}

impl PluginStorage {
    pub fn new(store: Arc<dyn DataStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    pub async fn get(&self, key: &str) -> error::Result<Option<Value>> {
        self.store.get(&self.scoped(key)).await
    }

    pub async fn set(&self, key: &str, value: Value) -> error::Result<()> {
        self.store.set(&self.scoped(key), value).await
    }

    pub async fn delete(&self, key: &str) -> error::Result<bool> {
        self.store.delete(&self.scoped(key)).await
    }

    /// Remove every key under this plugin's prefix.
    pub async fn clear(&self) -> error::Result<()> {
        for key in self.store.keys(&self.prefix).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// UI wrapper
// ---------------------------------------------------------------------------

/// Component registration tagged with the plugin id; remembers what it
/// registered so cleanup can revoke everything.
pub struct PluginUi {
    shell: Arc<dyn UiShell>,
    plugin_id: String,
    registered: Mutex<Vec<String>>,
}

impl PluginUi {
    pub fn new(shell: Arc<dyn UiShell>, plugin_id: &str) -> Self {
        Self {
            shell,
            plugin_id: plugin_id.to_string(),
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, component_type: &str, definition: Value) -> error::Result<String> {
        let id = self
            .shell
            .register_component(&self.plugin_id, component_type, definition)?;
        self.registered
            .lock()
            .map_err(|_| TrellisError::internal("ui registration lock poisoned"))?
            .push(id.clone());
        Ok(id)
    }

    pub fn unregister(&self, component_id: &str) -> error::Result<bool> {
        self.registered
            .lock()
            .map_err(|_| TrellisError::internal("ui registration lock poisoned"))?
            .retain(|id| id != component_id);
        self.shell.unregister_component(component_id)
    }

    pub fn registered_ids(&self) -> error::Result<Vec<String>> {
        Ok(self
            .registered
            .lock()
            .map_err(|_| TrellisError::internal("ui registration lock poisoned"))?
            .clone())
    }

    fn revoke_all(&self) -> error::Result<()> {
        let ids = std::mem::take(
            &mut *self
                .registered
                .lock()
                .map_err(|_| TrellisError::internal("ui registration lock poisoned"))?,
        );
        for id in ids {
            self.shell.unregister_component(&id)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routes wrapper
// ---------------------------------------------------------------------------

/// Path + handler registration tagged with the plugin id. The records are
/// revoked wholesale on cleanup.
pub struct PluginRoutes {
    registry: Arc<dyn RouteRegistry>,
    plugin_id: String,
    registered: Mutex<Vec<String>>,
}

impl PluginRoutes {
    pub fn new(registry: Arc<dyn RouteRegistry>, plugin_id: &str) -> Self {
        Self {
            registry,
            plugin_id: plugin_id.to_string(),
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, method: &str, path: &str, handler: &str) -> error::Result<String> {
        let id = self
            .registry
            .register_route(&self.plugin_id, method, path, handler)?;
        self.registered
            .lock()
            .map_err(|_| TrellisError::internal("route registration lock poisoned"))?
            .push(id.clone());
        Ok(id)
    }

    pub fn unregister(&self, route_id: &str) -> error::Result<bool> {
        self.registered
            .lock()
            .map_err(|_| TrellisError::internal("route registration lock poisoned"))?
            .retain(|id| id != route_id);
        self.registry.unregister_route(route_id)
    }

    fn revoke_all(&self) -> error::Result<()> {
        let ids = std::mem::take(
            &mut *self
                .registered
                .lock()
                .map_err(|_| TrellisError::internal("route registration lock poisoned"))?,
        );
        for id in ids {
            self.registry.unregister_route(&id)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PluginContext
// ---------------------------------------------------------------------------

pub struct PluginContext {
    plugin_id: String,
    plugin_version: Version,
    storage_prefix: String,
    logger: PluginLogger,
    bus: PluginBus,
    storage: PluginStorage,
    ui: PluginUi,
    routes: PluginRoutes,
    flags: Arc<FeatureFlagEvaluator>,
    security: Arc<dyn SecurityService>,
    config: RwLock<HashMap<String, Value>>,
    platform: PlatformInfo,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("plugin_version", &self.plugin_version)
            .finish()
    }
}

impl PluginContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugin_id: &str,
        plugin_version: Version,
        bus: Arc<EventBus>,
        store: Arc<dyn DataStore>,
        shell: Arc<dyn UiShell>,
        routes: Arc<dyn RouteRegistry>,
        flags: Arc<FeatureFlagEvaluator>,
        security: Arc<dyn SecurityService>,
        platform: PlatformInfo,
    ) -> Self {
        let storage_prefix = format!("plugin:{plugin_id}:");
        Self {
            plugin_id: plugin_id.to_string(),
            plugin_version,
            logger: PluginLogger::new(plugin_id),
            bus: PluginBus::new(bus, plugin_id),
            storage: PluginStorage::new(store, &storage_prefix),
            ui: PluginUi::new(shell, plugin_id),
            routes: PluginRoutes::new(routes, plugin_id),
            storage_prefix,
            flags,
            security,
            config: RwLock::new(HashMap::new()),
            platform,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn plugin_version(&self) -> &Version {
        &self.plugin_version
    }

    pub fn storage_prefix(&self) -> &str {
        &self.storage_prefix
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn bus(&self) -> &PluginBus {
        &self.bus
    }

    pub fn storage(&self) -> &PluginStorage {
        &self.storage
    }

    pub fn ui(&self) -> &PluginUi {
        &self.ui
    }

    pub fn routes(&self) -> &PluginRoutes {
        &self.routes
    }

    pub fn flags(&self) -> &FeatureFlagEvaluator {
        &self.flags
    }

    pub fn security(&self) -> &Arc<dyn SecurityService> {
        &self.security
    }

    /// Read-only platform snapshot.
    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    // -- in-process config map ----------------------------------------------

    pub fn config_get(&self, key: &str) -> error::Result<Option<Value>> {
        Ok(self
            .config
            .read()
            .map_err(|_| TrellisError::internal("config lock poisoned"))?
            .get(key)
            .cloned())
    }

    pub fn config_set(&self, key: impl Into<String>, value: Value) -> error::Result<()> {
        self.config
            .write()
            .map_err(|_| TrellisError::internal("config lock poisoned"))?
            .insert(key.into(), value);
        Ok(())
    }

    pub fn config_all(&self) -> error::Result<HashMap<String, Value>> {
        Ok(self
            .config
            .read()
            .map_err(|_| TrellisError::internal("config lock poisoned"))?
            .clone())
    }

    /// Tear the context down: revoke route and UI registrations and clear
    /// the config map. With `purge_storage`, persisted keys under the
    /// plugin prefix are deleted too (used on uninstall, not on
    /// deactivate).
    pub async fn cleanup(&self, purge_storage: bool) -> error::Result<()> {
        self.routes.revoke_all()?;
        self.ui.revoke_all()?;
        self.config
            .write()
            .map_err(|_| TrellisError::internal("config lock poisoned"))?
            .clear();
        if purge_storage {
            self.storage.clear().await?;
        }
        Ok(())
    }
}
