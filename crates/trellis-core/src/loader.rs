//! Instance loading — the lifecycle interface behind every plugin and the
//! seam through which entry modules become live instances.
//!
//! The runtime needs nothing from plugin code beyond a handful of optional
//! hooks and a single dispatch entry. Hooks that run while the plugin is
//! active (`onActivate`, `onDeactivate`, event handlers) are driven through
//! the sandbox call protocol; the remaining hooks run host-side.

use crate::error::{self, TrellisError};
use crate::manifest::PluginManifest;
use crate::sandbox::SandboxEnv;
use async_trait::async_trait;
use semver::Version;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// A loaded plugin. Omitted hooks default to no-ops.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    /// Method names reachable through the sandbox call protocol. Event
    /// handlers named in the manifest must appear here.
    fn methods(&self) -> Vec<String> {
        Vec::new()
    }

    fn exposes(&self, method: &str) -> bool {
        self.methods().iter().any(|m| m == method)
    }

    /// Dispatch a call inside the sandbox. `env` is the restricted
    /// environment the plugin is allowed to touch.
    async fn call(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
        env: &SandboxEnv,
    ) -> error::Result<serde_json::Value>;

    async fn on_install(&self) -> error::Result<()> {
        Ok(())
    }

    async fn on_uninstall(&self) -> error::Result<()> {
        Ok(())
    }

    async fn on_update(&self, _from: &Version, _to: &Version) -> error::Result<()> {
        Ok(())
    }
}

/// Maps a validated manifest and its guarded entry path to an instance.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(
        &self,
        manifest: &PluginManifest,
        entry_path: &Path,
    ) -> error::Result<Arc<dyn PluginInstance>>;
}

pub type InstanceFactory =
    Arc<dyn Fn(&PluginManifest) -> error::Result<Arc<dyn PluginInstance>> + Send + Sync>;

/// Loader backed by a factory table keyed on plugin id. Embedders register
/// their compiled-in plugins here; tests register fakes.
#[derive(Default)]
pub struct StaticLoader {
    factories: RwLock<HashMap<String, InstanceFactory>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin_id: impl Into<String>, factory: InstanceFactory) {
        if let Ok(mut factories) = self.factories.write() {
            factories.insert(plugin_id.into(), factory);
        }
    }
}

impl std::fmt::Debug for StaticLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticLoader")
            .field(
                "factories",
                &self.factories.read().map(|f| f.len()).unwrap_or(0),
            )
            .finish()
    }
}

#[async_trait]
impl PluginLoader for StaticLoader {
    async fn load(
        &self,
        manifest: &PluginManifest,
        _entry_path: &Path,
    ) -> error::Result<Arc<dyn PluginInstance>> {
        let factory = {
            let factories = self
                .factories
                .read()
                .map_err(|_| TrellisError::internal("loader lock poisoned"))?;
            factories.get(&manifest.id).cloned()
        };
        match factory {
            Some(factory) => factory(manifest),
            None => Err(TrellisError::module_load(
                &manifest.id,
                "no factory registered for this plugin id",
            )),
        }
    }
}

/// Resolve the manifest's `main` entry against the plugin directory and
/// reject anything that escapes it after symlink resolution. This is the
/// sole mandatory traversal guard on load.
pub async fn resolve_entry_path(plugin_dir: &Path, main: &str) -> error::Result<PathBuf> {
    if Path::new(main).is_absolute() {
        return Err(TrellisError::PathTraversal {
            path: main.to_string(),
        });
    }
    let dir = tokio::fs::canonicalize(plugin_dir)
        .await
        .map_err(|e| TrellisError::ModuleLoadFailed {
            plugin_id: String::new(),
            message: format!("plugin directory {} is not readable", plugin_dir.display()),
            source: Some(Box::new(e)),
        })?;
    let entry = tokio::fs::canonicalize(dir.join(main)).await.map_err(|e| {
        TrellisError::ModuleLoadFailed {
            plugin_id: String::new(),
            message: format!("entry '{main}' does not resolve to a file"),
            source: Some(Box::new(e)),
        }
    })?;
    if entry.strip_prefix(&dir).is_err() {
        return Err(TrellisError::PathTraversal {
            path: main.to_string(),
        });
    }
    Ok(entry)
}
