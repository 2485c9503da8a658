//! Plugin registry — discovery, dependency resolution and the lifecycle
//! state machine.
//!
//! The registry is the sole mutator of plugin records. Lifecycle operations
//! on a single plugin are serialized by a per-plugin lock; operations on
//! distinct plugins proceed in parallel. Discovery fans out across plugin
//! directories concurrently and tolerates broken manifests per directory.
//!
//! ```text
//! DISCOVERED --install--> INSTALLED --activate--> ACTIVE
//!                            ^                      |
//!                            +------deactivate------+ (INACTIVE)
//! INSTALLED --uninstall--> (removed)
//! ACTIVE    --uninstall--> (auto-deactivate, removed)
//! any non-terminal --fault--> ERRORED --recover--> DISCOVERED
//! ```

use crate::bus::{
    BusEvent, EventBus, EventHandler, META_HANDLER, PublishOptions, SubscribeOptions,
};
use crate::context::PluginContext;
use crate::error::{self, TrellisError};
use crate::flags::{FeatureFlagEvaluator, FlagContext};
use crate::host::{
    AllowAllSecurity, AuditEvent, Clock, DataStore, InMemoryRouteRegistry, InMemoryUiShell,
    MemoryStore, PlatformInfo, RouteRegistry, SecurityService, SystemClock, UiShell,
};
use crate::loader::{PluginInstance, PluginLoader, StaticLoader, resolve_entry_path};
use crate::manifest::PluginManifest;
use crate::permissions::PermissionValidator;
use crate::sandbox::{MemorySampler, SandboxConfig, SandboxServices, TOPIC_RESOURCE_LIMIT};
use crate::sandbox_manager::SandboxManager;
use dashmap::DashMap;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const TOPIC_INSTALLED: &str = "plugins.installed";
pub const TOPIC_ACTIVATED: &str = "plugins.activated";
pub const TOPIC_DEACTIVATED: &str = "plugins.deactivated";
pub const TOPIC_UNINSTALLED: &str = "plugins.uninstalled";
pub const TOPIC_UPDATED: &str = "plugins.updated";

const MANIFEST_FILE: &str = "plugin.json";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    Discovered,
    Installed,
    Active,
    Inactive,
    NeedsUpdate,
    Errored,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PluginState::Discovered => "discovered",
            PluginState::Installed => "installed",
            PluginState::Active => "active",
            PluginState::Inactive => "inactive",
            PluginState::NeedsUpdate => "needs_update",
            PluginState::Errored => "errored",
        };
        write!(f, "{label}")
    }
}

struct PluginEntry {
    manifest: PluginManifest,
    state: PluginState,
    path: PathBuf,
    installed_at_ms: Option<u64>,
    activated_at_ms: Option<u64>,
    error: Option<String>,
    settings: HashMap<String, Value>,
    instance: Option<Arc<dyn PluginInstance>>,
    context: Option<Arc<PluginContext>>,
    subscriptions: Vec<String>,
    /// Superseding manifest observed during discovery, applied on update.
    pending_manifest: Option<PluginManifest>,
}

/// Snapshot of one record, safe to hand out.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub id: String,
    pub version: String,
    pub state: PluginState,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dependencies: HashMap<String, String>,
}

impl PluginEntry {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.manifest.id.clone(),
            version: self.manifest.version.clone(),
            state: self.state,
            path: self.path.clone(),
            installed_at_ms: self.installed_at_ms,
            activated_at_ms: self.activated_at_ms,
            error: self.error.clone(),
            dependencies: self.manifest.dependencies.clone(),
        }
    }
}

/// Outcome of resolving a manifest's dependency map.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyCheck {
    pub resolved: bool,
    pub missing: Vec<String>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct RegistryBuilder {
    clock: Arc<dyn Clock>,
    bus: Option<Arc<EventBus>>,
    store: Arc<dyn DataStore>,
    security: Arc<dyn SecurityService>,
    ui: Arc<dyn UiShell>,
    routes: Arc<dyn RouteRegistry>,
    loader: Arc<dyn PluginLoader>,
    platform: PlatformInfo,
    sampler: Option<Arc<dyn MemorySampler>>,
    sandbox_defaults: SandboxConfig,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            bus: None,
            store: Arc::new(MemoryStore::new()),
            security: Arc::new(AllowAllSecurity::new()),
            ui: Arc::new(InMemoryUiShell::new()),
            routes: Arc::new(InMemoryRouteRegistry::new()),
            loader: Arc::new(StaticLoader::new()),
            platform: PlatformInfo::new(Version::new(1, 0, 0), "production"),
            sampler: None,
            sandbox_defaults: SandboxConfig::default(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = store;
        self
    }

    pub fn security(mut self, security: Arc<dyn SecurityService>) -> Self {
        self.security = security;
        self
    }

    pub fn ui(mut self, ui: Arc<dyn UiShell>) -> Self {
        self.ui = ui;
        self
    }

    pub fn routes(mut self, routes: Arc<dyn RouteRegistry>) -> Self {
        self.routes = routes;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn platform(mut self, platform: PlatformInfo) -> Self {
        self.platform = platform;
        self
    }

    pub fn memory_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn sandbox_defaults(mut self, config: SandboxConfig) -> Self {
        self.sandbox_defaults = config;
        self
    }

    pub fn build(self) -> Arc<PluginRegistry> {
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(EventBus::with_clock(self.clock.clone())));
        let services = SandboxServices {
            bus: bus.clone(),
            clock: self.clock.clone(),
            security: self.security.clone(),
            sampler: self.sampler,
        };
        let sandboxes = Arc::new(SandboxManager::new(services));
        let flags = Arc::new(FeatureFlagEvaluator::new(bus.clone(), self.clock.clone()));
        let permissions = Arc::new(PermissionValidator::new(self.clock.clone()));
        Arc::new(PluginRegistry {
            plugins: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
            bus,
            sandboxes,
            flags,
            permissions,
            loader: self.loader,
            store: self.store,
            security: self.security,
            ui: self.ui,
            routes: self.routes,
            clock: self.clock,
            platform: self.platform,
            sandbox_defaults: self.sandbox_defaults,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, PluginEntry>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    bus: Arc<EventBus>,
    sandboxes: Arc<SandboxManager>,
    flags: Arc<FeatureFlagEvaluator>,
    permissions: Arc<PermissionValidator>,
    loader: Arc<dyn PluginLoader>,
    store: Arc<dyn DataStore>,
    security: Arc<dyn SecurityService>,
    ui: Arc<dyn UiShell>,
    routes: Arc<dyn RouteRegistry>,
    clock: Arc<dyn Clock>,
    platform: PlatformInfo,
    sandbox_defaults: SandboxConfig,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("platform", &self.platform.version)
            .finish()
    }
}

impl PluginRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn flags(&self) -> Arc<FeatureFlagEvaluator> {
        self.flags.clone()
    }

    pub fn permissions(&self) -> Arc<PermissionValidator> {
        self.permissions.clone()
    }

    pub fn sandbox_manager(&self) -> Arc<SandboxManager> {
        self.sandboxes.clone()
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    /// Wire the registry to sandbox violation events: a sandbox that blows
    /// its quotas is deactivated through the normal path.
    pub fn attach_resource_guard(self: &Arc<Self>) -> error::Result<String> {
        let registry: Weak<PluginRegistry> = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |event: BusEvent| {
            let registry = registry.clone();
            Box::pin(async move {
                let Some(registry) = registry.upgrade() else {
                    return Ok(());
                };
                let Some(plugin_id) = event
                    .payload
                    .get("pluginId")
                    .and_then(Value::as_str)
                    .map(String::from)
                else {
                    return Ok(());
                };
                // Deactivation stops the publishing sandbox; run it outside
                // the dispatch so the monitor task is not cancelling itself.
                tokio::spawn(async move {
                    if let Err(e) = registry.deactivate(&plugin_id).await {
                        warn!(plugin_id = %plugin_id, error = %e, "Violation deactivate failed");
                    }
                });
                Ok(())
            })
        });
        self.bus.subscribe(
            TOPIC_RESOURCE_LIMIT,
            handler,
            SubscribeOptions::default().with_metadata("owner", "registry"),
        )
    }

    /// Start the aggregate sandbox monitor.
    pub fn start_monitoring(self: &Arc<Self>) {
        self.sandboxes.start_monitor();
    }

    /// Stop everything: aggregate monitor and all sandboxes.
    pub async fn shutdown(&self) {
        self.sandboxes.destroy_all().await;
    }

    // -- accessors ----------------------------------------------------------

    pub async fn get_plugin(&self, plugin_id: &str) -> Option<PluginInfo> {
        self.plugins.read().await.get(plugin_id).map(|e| e.info())
    }

    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self
            .plugins
            .read()
            .await
            .values()
            .map(|e| e.info())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn plugins_in_state(&self, state: PluginState) -> Vec<PluginInfo> {
        self.plugins
            .read()
            .await
            .values()
            .filter(|e| e.state == state)
            .map(|e| e.info())
            .collect()
    }

    // -- discovery ----------------------------------------------------------

    /// Scan a plugin root: every immediate subdirectory containing a
    /// `plugin.json` is a candidate. Broken manifests are logged and
    /// skipped; discovery itself never fails over one bad plugin. Returns
    /// the ids of newly discovered plugins.
    pub async fn discover(&self, root: &Path) -> error::Result<Vec<String>> {
        let mut read_dir = tokio::fs::read_dir(root)
            .await
            .map_err(|e| TrellisError::Storage {
                message: format!("cannot read plugin root {}", root.display()),
                source: Some(Box::new(e)),
            })?;
        let mut directories = Vec::new();
        while let Ok(Some(dir_entry)) = read_dir.next_entry().await {
            if dir_entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false)
            {
                directories.push(dir_entry.path());
            }
        }

        let manifests = futures::future::join_all(directories.into_iter().map(|dir| async move {
            let manifest = read_manifest(&dir).await;
            (dir, manifest)
        }))
        .await;

        let mut discovered = Vec::new();
        let mut plugins = self.plugins.write().await;
        for (dir, result) in manifests {
            let manifest = match result {
                Ok(manifest) => manifest,
                Err(message) => {
                    warn!(directory = %dir.display(), error = %message, "Skipping plugin directory");
                    continue;
                }
            };
            let id = manifest.id.clone();
            match plugins.get_mut(&id) {
                None => {
                    info!(plugin_id = %id, version = %manifest.version, "Discovered plugin");
                    plugins.insert(
                        id.clone(),
                        PluginEntry {
                            manifest,
                            state: PluginState::Discovered,
                            path: dir,
                            installed_at_ms: None,
                            activated_at_ms: None,
                            error: None,
                            settings: HashMap::new(),
                            instance: None,
                            context: None,
                            subscriptions: Vec::new(),
                            pending_manifest: None,
                        },
                    );
                    discovered.push(id);
                }
                Some(existing) => {
                    let supersedes = match (
                        manifest.parsed_version(),
                        existing.manifest.parsed_version(),
                    ) {
                        (Some(new), Some(old)) => new > old,
                        _ => false,
                    };
                    if !supersedes {
                        debug!(plugin_id = %id, "Already known, not superseded");
                        continue;
                    }
                    info!(
                        plugin_id = %id,
                        from = %existing.manifest.version,
                        to = %manifest.version,
                        "Superseding manifest observed"
                    );
                    existing.pending_manifest = Some(manifest);
                    if matches!(
                        existing.state,
                        PluginState::Installed | PluginState::Inactive
                    ) {
                        existing.state = PluginState::NeedsUpdate;
                    }
                }
            }
        }
        Ok(discovered)
    }

    /// Resolve a manifest's declared dependencies against the registry.
    pub async fn check_dependencies(&self, manifest: &PluginManifest) -> DependencyCheck {
        let plugins = self.plugins.read().await;
        let mut missing = Vec::new();
        for (dep_id, range) in &manifest.dependencies {
            let satisfied = plugins.get(dep_id).is_some_and(|entry| {
                match (
                    entry.manifest.parsed_version(),
                    semver::VersionReq::parse(range),
                ) {
                    (Some(version), Ok(req)) => req.matches(&version),
                    _ => false,
                }
            });
            if !satisfied {
                missing.push(format!("{dep_id}@{range}"));
            }
        }
        DependencyCheck {
            resolved: missing.is_empty(),
            missing,
        }
    }

    // -- lifecycle ----------------------------------------------------------

    pub async fn install(&self, plugin_id: &str) -> error::Result<()> {
        let lock = self.plugin_lock(plugin_id);
        let _guard = lock.lock().await;
        self.install_locked(plugin_id).await
    }

    pub async fn activate(&self, plugin_id: &str) -> error::Result<()> {
        let lock = self.plugin_lock(plugin_id);
        let _guard = lock.lock().await;
        self.activate_locked(plugin_id).await
    }

    pub async fn deactivate(&self, plugin_id: &str) -> error::Result<()> {
        let lock = self.plugin_lock(plugin_id);
        let _guard = lock.lock().await;
        self.deactivate_locked(plugin_id).await
    }

    pub async fn uninstall(&self, plugin_id: &str) -> error::Result<()> {
        let lock = self.plugin_lock(plugin_id);
        let _guard = lock.lock().await;
        self.uninstall_locked(plugin_id).await
    }

    pub async fn update(
        &self,
        plugin_id: &str,
        new_manifest: PluginManifest,
    ) -> error::Result<()> {
        let lock = self.plugin_lock(plugin_id);
        let _guard = lock.lock().await;
        self.update_locked(plugin_id, new_manifest).await
    }

    /// Apply the superseding manifest recorded at discovery time.
    pub async fn apply_pending_update(&self, plugin_id: &str) -> error::Result<()> {
        let lock = self.plugin_lock(plugin_id);
        let _guard = lock.lock().await;
        let pending = {
            let plugins = self.plugins.read().await;
            let entry = plugins
                .get(plugin_id)
                .ok_or_else(|| TrellisError::not_found(plugin_id))?;
            entry.pending_manifest.clone().ok_or_else(|| {
                TrellisError::illegal_transition(entry.state.to_string(), "applyPendingUpdate")
            })?
        };
        self.update_locked(plugin_id, pending).await
    }

    /// Move an errored plugin back to DISCOVERED so it can retry.
    pub async fn recover(&self, plugin_id: &str) -> error::Result<()> {
        let lock = self.plugin_lock(plugin_id);
        let _guard = lock.lock().await;
        let mut plugins = self.plugins.write().await;
        let entry = plugins
            .get_mut(plugin_id)
            .ok_or_else(|| TrellisError::not_found(plugin_id))?;
        if entry.state != PluginState::Errored {
            return Err(TrellisError::illegal_transition(
                entry.state.to_string(),
                "recover",
            ));
        }
        entry.state = PluginState::Discovered;
        entry.error = None;
        entry.instance = None;
        entry.context = None;
        info!(plugin_id = %plugin_id, "Plugin recovered");
        Ok(())
    }

    // -- install ------------------------------------------------------------

    async fn install_locked(&self, plugin_id: &str) -> error::Result<()> {
        let (manifest, state, path) = {
            let plugins = self.plugins.read().await;
            let entry = plugins
                .get(plugin_id)
                .ok_or_else(|| TrellisError::not_found(plugin_id))?;
            (entry.manifest.clone(), entry.state, entry.path.clone())
        };

        if !matches!(state, PluginState::Discovered | PluginState::NeedsUpdate) {
            return Err(TrellisError::illegal_transition(state.to_string(), "install"));
        }
        self.check_platform(&manifest)?;
        let dependencies = self.check_dependencies(&manifest).await;
        if !dependencies.resolved {
            return Err(TrellisError::DependencyUnresolved {
                plugin_id: plugin_id.to_string(),
                missing: dependencies.missing,
            });
        }

        let result = self.load_and_install(plugin_id, &manifest, &path).await;
        if let Err(e) = &result {
            self.mark_errored(plugin_id, &e.to_string()).await;
        }
        result
    }

    async fn load_and_install(
        &self,
        plugin_id: &str,
        manifest: &PluginManifest,
        path: &Path,
    ) -> error::Result<()> {
        let entry_path = resolve_entry_path(path, &manifest.main).await?;
        let instance = self.loader.load(manifest, &entry_path).await?;
        instance
            .on_install()
            .await
            .map_err(|e| TrellisError::hook_failed(plugin_id, "onInstall", e.to_string()))?;

        let timestamp = {
            let mut plugins = self.plugins.write().await;
            let entry = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| TrellisError::not_found(plugin_id))?;
            let timestamp = self.monotonic_stamp(entry);
            entry.instance = Some(instance);
            entry.state = PluginState::Installed;
            entry.installed_at_ms = Some(timestamp);
            entry.error = None;
            timestamp
        };

        self.audit("plugin.install", plugin_id, None).await;
        self.publish_lifecycle(
            TOPIC_INSTALLED,
            json!({
                "pluginId": plugin_id,
                "version": manifest.version,
                "timestamp": timestamp,
            }),
        )
        .await;
        info!(plugin_id = %plugin_id, version = %manifest.version, "Plugin installed");
        Ok(())
    }

    // -- activate -----------------------------------------------------------

    async fn activate_locked(&self, plugin_id: &str) -> error::Result<()> {
        let (manifest, state, path, existing_instance) = {
            let plugins = self.plugins.read().await;
            let entry = plugins
                .get(plugin_id)
                .ok_or_else(|| TrellisError::not_found(plugin_id))?;
            (
                entry.manifest.clone(),
                entry.state,
                entry.path.clone(),
                entry.instance.clone(),
            )
        };

        // Activating an active plugin is a no-op, not an error.
        if state == PluginState::Active {
            return Ok(());
        }
        if !matches!(state, PluginState::Installed | PluginState::Inactive) {
            return Err(TrellisError::illegal_transition(
                state.to_string(),
                "activate",
            ));
        }
        self.check_platform(&manifest)?;

        // Every declared dependency must itself be active.
        {
            let plugins = self.plugins.read().await;
            for dep_id in manifest.dependencies.keys() {
                let active = plugins
                    .get(dep_id)
                    .is_some_and(|e| e.state == PluginState::Active);
                if !active {
                    return Err(TrellisError::DependencyNotActive {
                        plugin_id: plugin_id.to_string(),
                        dependency: dep_id.clone(),
                    });
                }
            }
        }

        if !self
            .flags
            .should_activate_plugin(plugin_id, &self.flag_context(plugin_id))
        {
            return Err(TrellisError::ActivationGated {
                plugin_id: plugin_id.to_string(),
            });
        }

        let report = self.permissions.validate(&manifest.permissions);
        if !report.valid {
            return Err(TrellisError::PermissionInvalid {
                errors: report.errors,
            });
        }
        for warning in &report.warnings {
            warn!(plugin_id = %plugin_id, "{warning}");
        }

        let result = self
            .wire_activation(plugin_id, &manifest, &path, existing_instance)
            .await;
        if let Err(e) = &result {
            self.mark_errored(plugin_id, &e.to_string()).await;
        }
        result
    }

    async fn wire_activation(
        &self,
        plugin_id: &str,
        manifest: &PluginManifest,
        path: &Path,
        existing_instance: Option<Arc<dyn PluginInstance>>,
    ) -> error::Result<()> {
        let instance = match existing_instance {
            Some(instance) => instance,
            None => {
                let entry_path = resolve_entry_path(path, &manifest.main).await?;
                self.loader.load(manifest, &entry_path).await?
            }
        };
        let version = manifest
            .parsed_version()
            .ok_or_else(|| TrellisError::invalid_manifest(plugin_id, vec!["bad version".into()]))?;

        let mut config = self.sandbox_defaults.clone();
        config.permissions = manifest.permissions.clone();
        let sandbox = self
            .sandboxes
            .create(plugin_id, path, instance.clone(), config)?;

        let context = Arc::new(PluginContext::new(
            plugin_id,
            version,
            self.bus.clone(),
            self.store.clone(),
            self.ui.clone(),
            self.routes.clone(),
            self.flags.clone(),
            self.security.clone(),
            self.platform.clone(),
        ));

        // Wire declared subscriptions, rolling everything back on failure.
        let mut wired: Vec<String> = Vec::new();
        let wiring: error::Result<()> = async {
            for declaration in &manifest.event_subscriptions {
                if !instance.exposes(&declaration.handler) {
                    return Err(TrellisError::MethodNotFound {
                        plugin_id: plugin_id.to_string(),
                        method: declaration.handler.clone(),
                    });
                }
                let sandbox = sandbox.clone();
                let handler_name = declaration.handler.clone();
                let handler: EventHandler = Arc::new(move |event: BusEvent| {
                    let sandbox = sandbox.clone();
                    let handler_name = handler_name.clone();
                    Box::pin(async move {
                        let payload = serde_json::to_value(&event)
                            .map_err(|e| TrellisError::internal(e.to_string()))?;
                        sandbox.call_method(&handler_name, vec![payload]).await?;
                        Ok(())
                    })
                });
                let options = SubscribeOptions::for_plugin(plugin_id)
                    .with_metadata(META_HANDLER, declaration.handler.clone());
                let id = if declaration.topic.contains('*') {
                    self.bus
                        .subscribe_pattern(&declaration.topic, handler, options)?
                } else {
                    self.bus.subscribe(&declaration.topic, handler, options)?
                };
                wired.push(id);
            }

            for contribution in &manifest.ui_contributions {
                let component_type = contribution
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("generic");
                context.ui().register(component_type, contribution.clone())?;
            }

            if instance.exposes("onActivate") {
                sandbox
                    .call_method("onActivate", Vec::new())
                    .await
                    .map_err(|e| {
                        TrellisError::hook_failed(plugin_id, "onActivate", e.to_string())
                    })?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = wiring {
            for id in &wired {
                if let Err(unsub) = self.bus.unsubscribe(id) {
                    warn!(plugin_id = %plugin_id, error = %unsub, "Rollback unsubscribe failed");
                }
            }
            if let Err(cleanup) = context.cleanup(false).await {
                warn!(plugin_id = %plugin_id, error = %cleanup, "Rollback cleanup failed");
            }
            self.sandboxes.destroy(plugin_id).await;
            return Err(e);
        }

        let timestamp = {
            let mut plugins = self.plugins.write().await;
            let entry = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| TrellisError::not_found(plugin_id))?;
            let timestamp = self.monotonic_stamp(entry);
            entry.state = PluginState::Active;
            entry.activated_at_ms = Some(timestamp);
            entry.instance = Some(instance);
            entry.context = Some(context);
            entry.subscriptions = wired;
            entry.error = None;
            timestamp
        };

        self.audit("plugin.activate", plugin_id, None).await;
        self.publish_lifecycle(
            TOPIC_ACTIVATED,
            json!({
                "pluginId": plugin_id,
                "version": manifest.version,
                "timestamp": timestamp,
            }),
        )
        .await;
        info!(plugin_id = %plugin_id, "Plugin activated");
        Ok(())
    }

    // -- deactivate ---------------------------------------------------------

    async fn deactivate_locked(&self, plugin_id: &str) -> error::Result<()> {
        let (state, instance, context) = {
            let plugins = self.plugins.read().await;
            let entry = plugins
                .get(plugin_id)
                .ok_or_else(|| TrellisError::not_found(plugin_id))?;
            (entry.state, entry.instance.clone(), entry.context.clone())
        };
        if state != PluginState::Active {
            return Err(TrellisError::illegal_transition(
                state.to_string(),
                "deactivate",
            ));
        }

        let dependents = self.active_dependents(plugin_id).await;
        if !dependents.is_empty() {
            return Err(TrellisError::DependentsActive {
                plugin_id: plugin_id.to_string(),
                dependents,
            });
        }

        // The hook runs in the sandbox when it is still alive; a sandbox
        // that died of a resource violation is skipped.
        let mut hook_error = None;
        if let Some(sandbox) = self.sandboxes.get(plugin_id)
            && sandbox.is_running()
            && instance.as_ref().is_some_and(|i| i.exposes("onDeactivate"))
            && let Err(e) = sandbox.call_method("onDeactivate", Vec::new()).await
        {
            hook_error = Some(TrellisError::hook_failed(
                plugin_id,
                "onDeactivate",
                e.to_string(),
            ));
        }

        if let Some(context) = &context
            && let Err(e) = context.cleanup(false).await
        {
            warn!(plugin_id = %plugin_id, error = %e, "Context cleanup failed");
        }
        let removed = self.bus.unsubscribe_plugin(plugin_id)?;
        self.sandboxes.destroy(plugin_id).await;

        {
            let mut plugins = self.plugins.write().await;
            let entry = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| TrellisError::not_found(plugin_id))?;
            entry.state = PluginState::Inactive;
            entry.context = None;
            entry.subscriptions.clear();
        }
        if let Some(e) = hook_error {
            self.mark_errored(plugin_id, &e.to_string()).await;
            return Err(e);
        }

        self.audit("plugin.deactivate", plugin_id, None).await;
        self.publish_lifecycle(
            TOPIC_DEACTIVATED,
            json!({
                "pluginId": plugin_id,
                "timestamp": self.clock.now_ms(),
            }),
        )
        .await;
        info!(plugin_id = %plugin_id, unsubscribed = removed, "Plugin deactivated");
        Ok(())
    }

    // -- uninstall ----------------------------------------------------------

    async fn uninstall_locked(&self, plugin_id: &str) -> error::Result<()> {
        let (state, instance) = {
            let plugins = self.plugins.read().await;
            let entry = plugins
                .get(plugin_id)
                .ok_or_else(|| TrellisError::not_found(plugin_id))?;
            (entry.state, entry.instance.clone())
        };

        let dependents = self.all_dependents(plugin_id).await;
        if !dependents.is_empty() {
            return Err(TrellisError::DependentsActive {
                plugin_id: plugin_id.to_string(),
                dependents,
            });
        }

        if state == PluginState::Active {
            self.deactivate_locked(plugin_id).await?;
        }

        if let Some(instance) = &instance
            && let Err(e) = instance.on_uninstall().await
        {
            let e = TrellisError::hook_failed(plugin_id, "onUninstall", e.to_string());
            self.mark_errored(plugin_id, &e.to_string()).await;
            return Err(e);
        }

        // Purge scoped storage and rate-limit history with the record.
        let prefix = format!("plugin:{plugin_id}:");
        if let Ok(keys) = self.store.keys(&prefix).await {
            for key in keys {
                let _ = self.store.delete(&key).await;
            }
        }
        self.permissions.clear_rate_limit_trackers(Some(plugin_id));

        self.plugins.write().await.remove(plugin_id);
        self.locks.remove(plugin_id);

        self.audit("plugin.uninstall", plugin_id, None).await;
        self.publish_lifecycle(
            TOPIC_UNINSTALLED,
            json!({
                "pluginId": plugin_id,
                "timestamp": self.clock.now_ms(),
            }),
        )
        .await;
        info!(plugin_id = %plugin_id, "Plugin uninstalled");
        Ok(())
    }

    // -- update -------------------------------------------------------------

    async fn update_locked(
        &self,
        plugin_id: &str,
        new_manifest: PluginManifest,
    ) -> error::Result<()> {
        if let Err(errors) = new_manifest.validate() {
            return Err(TrellisError::invalid_manifest(plugin_id, errors));
        }
        if new_manifest.id != plugin_id {
            return Err(TrellisError::invalid_manifest(
                plugin_id,
                vec![format!("manifest id '{}' does not match", new_manifest.id)],
            ));
        }

        let (old_version, state, path) = {
            let plugins = self.plugins.read().await;
            let entry = plugins
                .get(plugin_id)
                .ok_or_else(|| TrellisError::not_found(plugin_id))?;
            let old_version = entry.manifest.parsed_version().ok_or_else(|| {
                TrellisError::invalid_manifest(plugin_id, vec!["bad current version".into()])
            })?;
            (old_version, entry.state, entry.path.clone())
        };
        let new_version = new_manifest
            .parsed_version()
            .ok_or_else(|| TrellisError::invalid_manifest(plugin_id, vec!["bad version".into()]))?;
        if new_version <= old_version {
            return Err(TrellisError::invalid_manifest(
                plugin_id,
                vec![format!("version {new_version} does not supersede {old_version}")],
            ));
        }
        let dependencies = self.check_dependencies(&new_manifest).await;
        if !dependencies.resolved {
            return Err(TrellisError::DependencyUnresolved {
                plugin_id: plugin_id.to_string(),
                missing: dependencies.missing,
            });
        }

        let was_active = state == PluginState::Active;
        if was_active {
            self.deactivate_locked(plugin_id).await?;
        }

        let result: Result<(), TrellisError> = async {
            let entry_path = resolve_entry_path(&path, &new_manifest.main).await?;
            let instance = self.loader.load(&new_manifest, &entry_path).await?;
            instance
                .on_update(&old_version, &new_version)
                .await
                .map_err(|e| TrellisError::hook_failed(plugin_id, "onUpdate", e.to_string()))?;

            {
                let mut plugins = self.plugins.write().await;
                let entry = plugins
                    .get_mut(plugin_id)
                    .ok_or_else(|| TrellisError::not_found(plugin_id))?;
                entry.manifest = new_manifest.clone();
                entry.instance = Some(instance);
                entry.state = PluginState::Installed;
                entry.pending_manifest = None;
                entry.error = None;
                // installed_at is preserved across updates.
            }
            Ok(())
        }
        .await;
        if let Err(e) = &result {
            self.mark_errored(plugin_id, &e.to_string()).await;
            return result;
        }

        self.audit("plugin.update", plugin_id, None).await;
        self.publish_lifecycle(
            TOPIC_UPDATED,
            json!({
                "pluginId": plugin_id,
                "fromVersion": old_version.to_string(),
                "toVersion": new_version.to_string(),
                "timestamp": self.clock.now_ms(),
            }),
        )
        .await;
        info!(
            plugin_id = %plugin_id,
            from = %old_version,
            to = %new_version,
            "Plugin updated"
        );

        if was_active {
            self.activate_locked(plugin_id).await?;
        }
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn plugin_lock(&self, plugin_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(plugin_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn check_platform(&self, manifest: &PluginManifest) -> error::Result<()> {
        let platform = &self.platform.version;
        let min = manifest.min_platform();
        let max = manifest.max_platform();
        let compatible = match (&min, &max) {
            (Some(min), Some(max)) => platform >= min && platform <= max,
            (Some(min), None) => platform >= min,
            _ => false,
        };
        if compatible {
            Ok(())
        } else {
            let required = match &manifest.max_platform_version {
                Some(max) => format!(">={} <={max}", manifest.min_platform_version),
                None => format!(">={}", manifest.min_platform_version),
            };
            Err(TrellisError::IncompatiblePlatform {
                plugin_id: manifest.id.clone(),
                required,
                platform: platform.to_string(),
            })
        }
    }

    async fn active_dependents(&self, plugin_id: &str) -> Vec<String> {
        self.plugins
            .read()
            .await
            .values()
            .filter(|e| e.state == PluginState::Active)
            .filter(|e| e.manifest.dependencies.contains_key(plugin_id))
            .map(|e| e.manifest.id.clone())
            .collect()
    }

    async fn all_dependents(&self, plugin_id: &str) -> Vec<String> {
        self.plugins
            .read()
            .await
            .values()
            .filter(|e| e.manifest.dependencies.contains_key(plugin_id))
            .map(|e| e.manifest.id.clone())
            .collect()
    }

    /// Later transitions never carry earlier timestamps, even under a
    /// clock that stalls.
    fn monotonic_stamp(&self, entry: &PluginEntry) -> u64 {
        self.clock
            .now_ms()
            .max(entry.installed_at_ms.unwrap_or(0))
            .max(entry.activated_at_ms.unwrap_or(0))
    }

    fn flag_context(&self, plugin_id: &str) -> FlagContext {
        let mut context = FlagContext::new();
        context.insert("pluginId".to_string(), json!(plugin_id));
        context.insert(
            "environment".to_string(),
            json!(self.platform.environment.clone()),
        );
        context.insert(
            "platformVersion".to_string(),
            json!(self.platform.version.to_string()),
        );
        context
    }

    async fn mark_errored(&self, plugin_id: &str, message: &str) {
        {
            let mut plugins = self.plugins.write().await;
            if let Some(entry) = plugins.get_mut(plugin_id) {
                entry.state = PluginState::Errored;
                entry.error = Some(message.to_string());
            }
        }
        self.audit("plugin.error", plugin_id, Some(json!({ "error": message })))
            .await;
        warn!(plugin_id = %plugin_id, error = %message, "Plugin errored");
    }

    async fn publish_lifecycle(&self, topic: &str, payload: Value) {
        if let Err(e) = self
            .bus
            .publish(topic, payload, PublishOptions::from_source("registry"))
            .await
        {
            warn!(topic = %topic, error = %e, "Failed to publish lifecycle event");
        }
    }

    async fn audit(&self, action: &str, plugin_id: &str, detail: Option<Value>) {
        let event = AuditEvent {
            action: action.to_string(),
            subject: plugin_id.to_string(),
            detail,
            timestamp_ms: self.clock.now_ms(),
        };
        if let Err(e) = self.security.log_event(event).await {
            warn!(action = %action, error = %e, "Failed to record audit event");
        }
    }

    /// Read or update the mutable settings map on a record.
    pub async fn get_settings(&self, plugin_id: &str) -> error::Result<HashMap<String, Value>> {
        let plugins = self.plugins.read().await;
        let entry = plugins
            .get(plugin_id)
            .ok_or_else(|| TrellisError::not_found(plugin_id))?;
        Ok(entry.settings.clone())
    }

    pub async fn set_setting(
        &self,
        plugin_id: &str,
        key: impl Into<String>,
        value: Value,
    ) -> error::Result<()> {
        let mut plugins = self.plugins.write().await;
        let entry = plugins
            .get_mut(plugin_id)
            .ok_or_else(|| TrellisError::not_found(plugin_id))?;
        entry.settings.insert(key.into(), value);
        Ok(())
    }

    /// The live context for an active plugin, if any.
    pub async fn context(&self, plugin_id: &str) -> Option<Arc<PluginContext>> {
        self.plugins.read().await.get(plugin_id)?.context.clone()
    }
}

async fn read_manifest(dir: &Path) -> Result<PluginManifest, String> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let text = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|e| format!("missing or unreadable {MANIFEST_FILE}: {e}"))?;
    let manifest =
        PluginManifest::from_json(&text).map_err(|e| format!("invalid manifest JSON: {e}"))?;
    manifest
        .validate()
        .map_err(|errors| format!("manifest validation failed: {}", errors.join("; ")))?;
    Ok(manifest)
}
