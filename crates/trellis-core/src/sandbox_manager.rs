//! Sandbox manager — lifecycle and aggregate monitoring for all sandboxes.

use crate::error::{self, TrellisError};
use crate::loader::PluginInstance;
use crate::sandbox::{Sandbox, SandboxConfig, SandboxServices};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const GLOBAL_MONITOR_INTERVAL_MS: u64 = 30_000;
const WARN_SINGLE_SANDBOX_MB: f64 = 512.0;
const WARN_TOTAL_MB: f64 = 1_024.0;
const MAX_ACTIVE_SANDBOXES: usize = 20;

/// Owns the `plugin id -> sandbox` map and a global monitor that keeps an
/// eye on aggregate memory pressure.
pub struct SandboxManager {
    sandboxes: RwLock<HashMap<String, Arc<Sandbox>>>,
    services: SandboxServices,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("sandboxes", &self.count())
            .finish()
    }
}

impl SandboxManager {
    pub fn new(services: SandboxServices) -> Self {
        Self {
            sandboxes: RwLock::new(HashMap::new()),
            services,
            monitor: Mutex::new(None),
        }
    }

    /// Spawn a sandbox for a plugin. Fails if one already exists.
    pub fn create(
        &self,
        plugin_id: &str,
        plugin_dir: &Path,
        instance: Arc<dyn PluginInstance>,
        config: SandboxConfig,
    ) -> error::Result<Arc<Sandbox>> {
        let mut sandboxes = self
            .sandboxes
            .write()
            .map_err(|_| TrellisError::internal("sandbox map lock poisoned"))?;
        if sandboxes.contains_key(plugin_id) {
            return Err(TrellisError::SandboxAlreadyExists {
                plugin_id: plugin_id.to_string(),
            });
        }
        let sandbox = Sandbox::spawn(
            plugin_id,
            plugin_dir,
            instance,
            config,
            self.services.clone(),
        );
        sandboxes.insert(plugin_id.to_string(), sandbox.clone());
        debug!(plugin_id = %plugin_id, "Sandbox created");
        Ok(sandbox)
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.read().ok()?.get(plugin_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.sandboxes.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Sum of the latest memory readings across sandboxes, in MB.
    pub fn total_memory_mb(&self) -> f64 {
        self.sandboxes
            .read()
            .map(|s| s.values().map(|sb| sb.current_memory_mb()).sum())
            .unwrap_or(0.0)
    }

    /// Stop and remove a sandbox. Idempotent: destroying a plugin with no
    /// sandbox is a no-op.
    pub async fn destroy(&self, plugin_id: &str) {
        let sandbox = self
            .sandboxes
            .write()
            .ok()
            .and_then(|mut s| s.remove(plugin_id));
        if let Some(sandbox) = sandbox {
            sandbox.stop().await;
            debug!(plugin_id = %plugin_id, "Sandbox destroyed");
        }
    }

    /// Start the 30 s aggregate monitor. Subsequent calls are no-ops.
    pub fn start_monitor(self: &Arc<Self>) {
        let Ok(mut monitor) = self.monitor.lock() else {
            return;
        };
        if monitor.is_some() {
            return;
        }
        let manager = Arc::downgrade(self);
        *monitor = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(GLOBAL_MONITOR_INTERVAL_MS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let count = manager.count();
                let total_mb = manager.total_memory_mb();
                info!(sandboxes = count, total_mb, "Sandbox pressure");

                if count > MAX_ACTIVE_SANDBOXES {
                    error!(
                        sandboxes = count,
                        limit = MAX_ACTIVE_SANDBOXES,
                        "Too many active sandboxes"
                    );
                }
                if total_mb > WARN_TOTAL_MB {
                    warn!(total_mb, "Aggregate sandbox memory is high");
                }
                if let Ok(sandboxes) = manager.sandboxes.read() {
                    for sandbox in sandboxes.values() {
                        let mb = sandbox.current_memory_mb();
                        if mb > WARN_SINGLE_SANDBOX_MB {
                            warn!(
                                plugin_id = sandbox.plugin_id(),
                                heap_mb = mb,
                                "Sandbox memory is high"
                            );
                        }
                    }
                }
            }
        }));
    }

    /// Stop the monitor, then stop every sandbox in parallel.
    pub async fn destroy_all(&self) {
        if let Ok(mut monitor) = self.monitor.lock()
            && let Some(handle) = monitor.take()
        {
            handle.abort();
        }
        let drained: Vec<Arc<Sandbox>> = self
            .sandboxes
            .write()
            .map(|mut s| s.drain().map(|(_, sandbox)| sandbox).collect())
            .unwrap_or_default();
        futures::future::join_all(drained.iter().map(|sandbox| sandbox.stop())).await;
        info!(stopped = drained.len(), "All sandboxes destroyed");
    }
}
