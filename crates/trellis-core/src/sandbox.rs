//! Sandbox — isolated execution for one active plugin.
//!
//! Each sandbox owns a worker task that is the only place plugin code runs.
//! The host talks to the worker over a call/response protocol with per-call
//! deadlines; the worker gives plugin code a restricted environment in
//! place of ambient process capabilities. A monitor samples memory once a
//! second and tears the sandbox down when quotas are breached.

use crate::bus::{EventBus, PublishOptions};
use crate::error::{self, TrellisError};
use crate::host::{Clock, SecurityService};
use crate::loader::PluginInstance;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Topic the sandbox publishes when a quota is breached.
pub const TOPIC_RESOURCE_LIMIT: &str = "resource-limit-exceeded";

const SAMPLE_INTERVAL_MS: u64 = 1_000;
const MAX_SAMPLES: usize = 100;
const LEAK_WINDOW: usize = 10;
const LEAK_MB_PER_MIN: f64 = 5.0;
const MAX_OPS_PER_MIN: f64 = 2_000.0;
const MAX_ACTIVE_TIMERS: usize = 100;
const MAX_TIMER_DELAY_MS: u64 = 60_000;
const SHUTDOWN_GRACE_MS: u64 = 5_000;

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)password|secret|token|key|auth|credential").unwrap()
    })
}

// ---------------------------------------------------------------------------
// Quotas & configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Strict,
    Moderate,
    Minimal,
}

/// Effective limits for one sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxQuotas {
    pub memory_limit_mb: u64,
    pub timeout_ms: u64,
    pub max_execution_time_ms: u64,
    pub max_network_connections: u32,
    pub disk_quota_mb: u64,
    pub code_range_mb: u64,
    pub stack_mb: u64,
}

impl IsolationLevel {
    /// Memory ceiling, code range and stack size for a requested memory
    /// budget. Stricter levels cap what the caller asked for.
    pub fn ceilings(&self, requested_mb: u64) -> (u64, u64, u64) {
        match self {
            IsolationLevel::Strict => (requested_mb.min(64), 16, 4),
            IsolationLevel::Moderate => (requested_mb.min(128), 32, 8),
            IsolationLevel::Minimal => (requested_mb, 64, 16),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub isolation: IsolationLevel,
    pub memory_limit_mb: u64,
    pub timeout_ms: u64,
    pub max_execution_time_ms: u64,
    pub max_network_connections: u32,
    pub disk_quota_mb: u64,
    pub permissions: Vec<String>,
    pub allowed_hosts: Vec<String>,
    pub env_whitelist: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Strict,
            memory_limit_mb: 256,
            timeout_ms: 60_000,
            max_execution_time_ms: 30_000,
            max_network_connections: 5,
            disk_quota_mb: 50,
            permissions: Vec::new(),
            allowed_hosts: Vec::new(),
            env_whitelist: Vec::new(),
        }
    }
}

impl SandboxConfig {
    pub fn quotas(&self) -> SandboxQuotas {
        let (memory_limit_mb, code_range_mb, stack_mb) =
            self.isolation.ceilings(self.memory_limit_mb);
        SandboxQuotas {
            memory_limit_mb,
            timeout_ms: self.timeout_ms,
            max_execution_time_ms: self.max_execution_time_ms,
            max_network_connections: self.max_network_connections,
            disk_quota_mb: self.disk_quota_mb,
            code_range_mb,
            stack_mb,
        }
    }
}

// ---------------------------------------------------------------------------
// Memory sampling
// ---------------------------------------------------------------------------

/// One point on the sandbox memory curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    pub timestamp_ms: u64,
    pub heap_mb: f64,
}

/// Source of memory readings for the monitor. Substitutable so tests can
/// script growth curves.
pub trait MemorySampler: Send + Sync {
    fn sample_mb(&self) -> f64;
}

/// Default sampler: reads the byte gauge the restricted environment
/// maintains as plugin code moves data through its mediators.
pub struct GaugeSampler {
    gauge: Arc<AtomicU64>,
}

impl GaugeSampler {
    pub fn new(gauge: Arc<AtomicU64>) -> Self {
        Self { gauge }
    }
}

impl MemorySampler for GaugeSampler {
    fn sample_mb(&self) -> f64 {
        self.gauge.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0)
    }
}

// ---------------------------------------------------------------------------
// Restricted environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// The only capabilities plugin code can reach. Every facet is gated by a
/// declared permission and scoped to the plugin.
pub struct SandboxEnv {
    plugin_id: String,
    plugin_dir: PathBuf,
    permissions: HashSet<String>,
    allowed_hosts: Vec<String>,
    env_whitelist: Vec<String>,
    disk_quota_bytes: u64,
    disk_used: AtomicU64,
    memory_gauge: Arc<AtomicU64>,
    timers: Arc<Semaphore>,
    http: reqwest::Client,
}

impl std::fmt::Debug for SandboxEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEnv")
            .field("plugin_id", &self.plugin_id)
            .field("plugin_dir", &self.plugin_dir)
            .field("permissions", &self.permissions.len())
            .finish()
    }
}

const ALLOWED_MODULES: &[&str] = &["console", "timers", "fs", "http", "process"];

impl SandboxEnv {
    fn new(plugin_id: &str, plugin_dir: &Path, config: &SandboxConfig) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            plugin_dir: plugin_dir.to_path_buf(),
            permissions: config.permissions.iter().cloned().collect(),
            allowed_hosts: config.allowed_hosts.clone(),
            env_whitelist: config.env_whitelist.clone(),
            disk_quota_bytes: config.disk_quota_mb * 1024 * 1024,
            disk_used: AtomicU64::new(0),
            memory_gauge: Arc::new(AtomicU64::new(0)),
            timers: Arc::new(Semaphore::new(MAX_ACTIVE_TIMERS)),
            http: reqwest::Client::new(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn memory_gauge(&self) -> Arc<AtomicU64> {
        self.memory_gauge.clone()
    }

    fn has_permission(&self, permission: &str) -> bool {
        if self.permissions.contains(permission) || self.permissions.contains("*") {
            return true;
        }
        permission
            .split_once(':')
            .is_some_and(|(category, _)| self.permissions.contains(&format!("{category}:*")))
    }

    /// Gate for module requests coming out of plugin code. Anything not in
    /// the restricted surface is refused.
    pub fn require_module(&self, module: &str) -> error::Result<()> {
        if ALLOWED_MODULES.contains(&module) {
            Ok(())
        } else {
            Err(TrellisError::ModuleNotAllowed {
                module: module.to_string(),
            })
        }
    }

    /// Safe console: context values under secret-looking keys are redacted
    /// before anything reaches the host log.
    pub fn console_log(&self, level: ConsoleLevel, message: &str, context: &HashMap<String, Value>) {
        let sanitized = sanitize_context(context);
        match level {
            ConsoleLevel::Debug => {
                debug!(plugin_id = %self.plugin_id, context = ?sanitized, "{message}")
            }
            ConsoleLevel::Info => {
                info!(plugin_id = %self.plugin_id, context = ?sanitized, "{message}")
            }
            ConsoleLevel::Warn => {
                warn!(plugin_id = %self.plugin_id, context = ?sanitized, "{message}")
            }
            ConsoleLevel::Error => {
                error!(plugin_id = %self.plugin_id, context = ?sanitized, "{message}")
            }
        }
    }

    /// Bounded timer: at most 100 concurrently sleeping, delay clamped to
    /// 60 s.
    pub async fn sleep(&self, delay_ms: u64) -> error::Result<()> {
        let Ok(_permit) = self.timers.clone().try_acquire_owned() else {
            return Err(TrellisError::ResourceLimitExceeded {
                kinds: vec!["timers".to_string()],
            });
        };
        tokio::time::sleep(Duration::from_millis(delay_ms.min(MAX_TIMER_DELAY_MS))).await;
        Ok(())
    }

    /// Read a file under the plugin directory. Requires `file:read`.
    pub async fn read_file(&self, relative: &str) -> error::Result<Vec<u8>> {
        if !self.has_permission("file:read") {
            return Err(TrellisError::not_permitted("file:read"));
        }
        let path = self.resolve_scoped(relative).await?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| TrellisError::Storage {
                message: format!("read '{relative}' failed"),
                source: Some(Box::new(e)),
            })?;
        self.memory_gauge
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    /// Write a file under the plugin directory. Requires `file:write` and
    /// fits inside the disk quota.
    pub async fn write_file(&self, relative: &str, bytes: &[u8]) -> error::Result<()> {
        if !self.has_permission("file:write") {
            return Err(TrellisError::not_permitted("file:write"));
        }
        let used = self.disk_used.load(Ordering::Relaxed);
        if used + bytes.len() as u64 > self.disk_quota_bytes {
            return Err(TrellisError::ResourceLimitExceeded {
                kinds: vec!["disk_quota".to_string()],
            });
        }
        let target = self.plugin_dir.join(relative);
        let parent = target
            .parent()
            .ok_or_else(|| TrellisError::PathTraversal {
                path: relative.to_string(),
            })?;
        let canonical_parent =
            tokio::fs::canonicalize(parent)
                .await
                .map_err(|e| TrellisError::Storage {
                    message: format!("parent of '{relative}' is not accessible"),
                    source: Some(Box::new(e)),
                })?;
        let canonical_dir = tokio::fs::canonicalize(&self.plugin_dir)
            .await
            .map_err(|e| TrellisError::Storage {
                message: "plugin directory is not accessible".to_string(),
                source: Some(Box::new(e)),
            })?;
        if canonical_parent.strip_prefix(&canonical_dir).is_err() {
            return Err(TrellisError::PathTraversal {
                path: relative.to_string(),
            });
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| TrellisError::Storage {
                message: format!("write '{relative}' failed"),
                source: Some(Box::new(e)),
            })?;
        self.disk_used
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Outbound HTTP, gated by `network:http` and the host allow-list.
    pub async fn http_fetch(&self, method: &str, url: &str) -> error::Result<HttpResponse> {
        if !self.has_permission("network:http") {
            return Err(TrellisError::not_permitted("network:http"));
        }
        let parsed = url::Url::parse(url).map_err(|e| TrellisError::Internal {
            message: format!("invalid url '{url}': {e}"),
        })?;
        let host = parsed.host_str().unwrap_or_default();
        if !self.host_allowed(host) {
            return Err(TrellisError::not_permitted(format!(
                "network:http to '{host}'"
            )));
        }
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| TrellisError::internal(format!("invalid http method '{method}'")))?;
        let response = self
            .http
            .request(method, parsed)
            .send()
            .await
            .map_err(|e| TrellisError::Internal {
                message: format!("http request failed: {e}"),
            })?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        self.memory_gauge
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(HttpResponse { status, body })
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|allowed| {
            allowed == "*"
                || allowed == host
                || (allowed.starts_with("*.")
                    && host.ends_with(allowed.trim_start_matches('*')))
        })
    }

    /// Minimal process view: `PLUGIN_ID` plus a whitelist of host
    /// environment variables.
    pub fn env_var(&self, key: &str) -> Option<String> {
        if key == "PLUGIN_ID" {
            return Some(self.plugin_id.clone());
        }
        if self.env_whitelist.iter().any(|k| k == key) {
            return std::env::var(key).ok();
        }
        None
    }

    async fn resolve_scoped(&self, relative: &str) -> error::Result<PathBuf> {
        if Path::new(relative).is_absolute() {
            return Err(TrellisError::PathTraversal {
                path: relative.to_string(),
            });
        }
        let dir = tokio::fs::canonicalize(&self.plugin_dir)
            .await
            .map_err(|e| TrellisError::Storage {
                message: "plugin directory is not accessible".to_string(),
                source: Some(Box::new(e)),
            })?;
        let path = tokio::fs::canonicalize(dir.join(relative))
            .await
            .map_err(|e| TrellisError::Storage {
                message: format!("'{relative}' does not resolve"),
                source: Some(Box::new(e)),
            })?;
        if path.strip_prefix(&dir).is_err() {
            return Err(TrellisError::PathTraversal {
                path: relative.to_string(),
            });
        }
        Ok(path)
    }
}

fn sanitize_context(context: &HashMap<String, Value>) -> HashMap<String, Value> {
    context
        .iter()
        .map(|(key, value)| {
            if secret_pattern().is_match(key) {
                (key.clone(), Value::String("[REDACTED]".to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Call protocol
// ---------------------------------------------------------------------------

struct CallMessage {
    id: u64,
    method: String,
    args: Vec<Value>,
}

struct ResponseMessage {
    id: u64,
    result: error::Result<Value>,
}

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<error::Result<Value>>>>>;

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Shared services a sandbox needs from its host.
#[derive(Clone)]
pub struct SandboxServices {
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub security: Arc<dyn SecurityService>,
    /// Override the memory source; defaults to the environment gauge.
    pub sampler: Option<Arc<dyn MemorySampler>>,
}

pub struct Sandbox {
    plugin_id: String,
    isolation: IsolationLevel,
    quotas: SandboxQuotas,
    started_at_ms: u64,
    env: Arc<SandboxEnv>,
    call_tx: Mutex<Option<mpsc::Sender<CallMessage>>>,
    pending: PendingTable,
    next_call_id: AtomicU64,
    operations: Arc<AtomicU64>,
    active_connections: AtomicU32,
    samples: Arc<Mutex<VecDeque<MemorySample>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("plugin_id", &self.plugin_id)
            .field("isolation", &self.isolation)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Sandbox {
    /// Spawn the worker, response router and resource monitor for one
    /// plugin instance.
    pub fn spawn(
        plugin_id: &str,
        plugin_dir: &Path,
        instance: Arc<dyn PluginInstance>,
        config: SandboxConfig,
        services: SandboxServices,
    ) -> Arc<Self> {
        let quotas = config.quotas();
        let env = Arc::new(SandboxEnv::new(plugin_id, plugin_dir, &config));
        let (call_tx, call_rx) = mpsc::channel::<CallMessage>(64);
        let (resp_tx, resp_rx) = mpsc::channel::<ResponseMessage>(64);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let operations = Arc::new(AtomicU64::new(0));
        let samples = Arc::new(Mutex::new(VecDeque::with_capacity(MAX_SAMPLES)));

        let worker = tokio::spawn(worker_loop(
            plugin_id.to_string(),
            instance,
            env.clone(),
            call_rx,
            resp_tx,
            services.security.clone(),
        ));
        let router = tokio::spawn(route_responses(resp_rx, pending.clone()));

        let sampler = services
            .sampler
            .clone()
            .unwrap_or_else(|| Arc::new(GaugeSampler::new(env.memory_gauge())));
        let monitor = tokio::spawn(monitor_loop(MonitorState {
            plugin_id: plugin_id.to_string(),
            quotas,
            sampler,
            samples: samples.clone(),
            operations: operations.clone(),
            running: running.clone(),
            pending: pending.clone(),
            bus: services.bus.clone(),
            clock: services.clock.clone(),
            started_at_ms: services.clock.now_ms(),
        }));

        Arc::new(Self {
            plugin_id: plugin_id.to_string(),
            isolation: config.isolation,
            quotas,
            started_at_ms: services.clock.now_ms(),
            env,
            call_tx: Mutex::new(Some(call_tx)),
            pending,
            next_call_id: AtomicU64::new(0),
            operations,
            active_connections: AtomicU32::new(0),
            samples,
            running,
            worker: Mutex::new(Some(worker)),
            router: Mutex::new(Some(router)),
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn quotas(&self) -> SandboxQuotas {
        self.quotas
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn env(&self) -> Arc<SandboxEnv> {
        self.env.clone()
    }

    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn active_connection_count(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn memory_samples(&self) -> Vec<MemorySample> {
        self.samples
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Most recent memory reading, in MB.
    pub fn current_memory_mb(&self) -> f64 {
        self.samples
            .lock()
            .ok()
            .and_then(|s| s.back().map(|sample| sample.heap_mb))
            .unwrap_or(0.0)
    }

    /// Invoke a method on the plugin instance inside the worker, bounded by
    /// the execution deadline. Methods under the `net.` prefix are
    /// connection-scoped and count against the network quota.
    pub async fn call_method(&self, method: &str, args: Vec<Value>) -> error::Result<Value> {
        if !self.is_running() {
            return Err(TrellisError::SandboxNotRunning {
                plugin_id: self.plugin_id.clone(),
            });
        }
        if method == "net.open"
            && self.active_connections.load(Ordering::SeqCst)
                >= self.quotas.max_network_connections
        {
            return Err(TrellisError::ResourceLimitExceeded {
                kinds: vec!["network_connections".to_string()],
            });
        }

        let sender = {
            let guard = self
                .call_tx
                .lock()
                .map_err(|_| TrellisError::internal("sandbox lock poisoned"))?;
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(TrellisError::SandboxNotRunning {
                plugin_id: self.plugin_id.clone(),
            });
        };

        let id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        self.operations.fetch_add(1, Ordering::Relaxed);

        let message = CallMessage {
            id,
            method: method.to_string(),
            args,
        };
        if sender.send(message).await.is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(TrellisError::SandboxNotRunning {
                plugin_id: self.plugin_id.clone(),
            });
        }

        let deadline = Duration::from_millis(self.quotas.max_execution_time_ms);
        match tokio::time::timeout(deadline, rx).await {
            Err(_) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&id);
                }
                Err(TrellisError::ExecutionTimeout {
                    timeout_ms: self.quotas.max_execution_time_ms,
                })
            }
            Ok(Err(_)) => Err(TrellisError::Cancelled),
            Ok(Ok(result)) => {
                if result.is_ok() {
                    match method {
                        "net.open" => {
                            self.active_connections.fetch_add(1, Ordering::SeqCst);
                        }
                        "net.close" => {
                            let _ = self.active_connections.fetch_update(
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                                |n| Some(n.saturating_sub(1)),
                            );
                        }
                        _ => {}
                    }
                }
                result
            }
        }
    }

    /// Stop the sandbox: halt monitoring, cancel every pending call, then
    /// let the worker drain with a grace period before aborting it.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Ok(mut monitor) = self.monitor.lock()
            && let Some(handle) = monitor.take()
        {
            handle.abort();
        }

        cancel_pending(&self.pending);

        // Dropping the sender ends the worker's receive loop.
        let worker = {
            if let Ok(mut guard) = self.call_tx.lock() {
                guard.take();
            }
            self.worker.lock().ok().and_then(|mut w| w.take())
        };
        if let Some(mut handle) = worker
            && tokio::time::timeout(Duration::from_millis(SHUTDOWN_GRACE_MS), &mut handle)
                .await
                .is_err()
        {
            warn!(plugin_id = %self.plugin_id, "Worker did not stop in time, aborting");
            handle.abort();
        }
        if let Ok(mut router) = self.router.lock()
            && let Some(handle) = router.take()
        {
            handle.abort();
        }
        debug!(plugin_id = %self.plugin_id, "Sandbox stopped");
    }
}

fn cancel_pending(pending: &PendingTable) {
    if let Ok(mut pending) = pending.lock() {
        for (_, resolver) in pending.drain() {
            let _ = resolver.send(Err(TrellisError::Cancelled));
        }
    }
}

// ---------------------------------------------------------------------------
// Worker & router tasks
// ---------------------------------------------------------------------------

async fn worker_loop(
    plugin_id: String,
    instance: Arc<dyn PluginInstance>,
    env: Arc<SandboxEnv>,
    mut call_rx: mpsc::Receiver<CallMessage>,
    resp_tx: mpsc::Sender<ResponseMessage>,
    security: Arc<dyn SecurityService>,
) {
    while let Some(message) = call_rx.recv().await {
        let decision = security
            .validate_plugin_action(&plugin_id, &message.method, &message.args)
            .await;
        let result = if !decision.granted {
            Err(TrellisError::not_permitted(format!(
                "{} ({})",
                message.method,
                decision.reason.unwrap_or_else(|| "denied".to_string())
            )))
        } else {
            instance.call(&message.method, message.args, &env).await
        };
        if resp_tx
            .send(ResponseMessage {
                id: message.id,
                result,
            })
            .await
            .is_err()
        {
            break;
        }
    }
    debug!(plugin_id = %plugin_id, "Worker exited");
}

async fn route_responses(mut resp_rx: mpsc::Receiver<ResponseMessage>, pending: PendingTable) {
    while let Some(response) = resp_rx.recv().await {
        let resolver = pending
            .lock()
            .ok()
            .and_then(|mut p| p.remove(&response.id));
        if let Some(resolver) = resolver {
            let _ = resolver.send(response.result);
        }
        // A missing resolver means the call already timed out.
    }
}

// ---------------------------------------------------------------------------
// Resource monitor
// ---------------------------------------------------------------------------

struct MonitorState {
    plugin_id: String,
    quotas: SandboxQuotas,
    sampler: Arc<dyn MemorySampler>,
    samples: Arc<Mutex<VecDeque<MemorySample>>>,
    operations: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    pending: PendingTable,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    started_at_ms: u64,
}

async fn monitor_loop(state: MonitorState) {
    let mut ticker = tokio::time::interval(Duration::from_millis(SAMPLE_INTERVAL_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !state.running.load(Ordering::SeqCst) {
            return;
        }

        let heap_mb = state.sampler.sample_mb();
        let now = state.clock.now_ms();
        let (violations, leak_rate) = {
            let Ok(mut samples) = state.samples.lock() else {
                return;
            };
            samples.push_back(MemorySample {
                timestamp_ms: now,
                heap_mb,
            });
            while samples.len() > MAX_SAMPLES {
                samples.pop_front();
            }
            detect_violations(
                &samples,
                &state.quotas,
                state.operations.load(Ordering::Relaxed),
                now.saturating_sub(state.started_at_ms),
            )
        };

        if violations.is_empty() {
            continue;
        }

        warn!(
            plugin_id = %state.plugin_id,
            violations = ?violations,
            heap_mb,
            "Resource limits exceeded, shutting sandbox down"
        );
        let mut payload = serde_json::json!({
            "pluginId": state.plugin_id,
            "violations": violations,
            "memoryUsage": heap_mb,
        });
        if let Some(rate) = leak_rate
            && let Some(object) = payload.as_object_mut()
        {
            object.insert("memoryLeak".to_string(), serde_json::json!({
                "growthMbPerMin": rate,
            }));
        }

        state.running.store(false, Ordering::SeqCst);
        cancel_pending(&state.pending);
        if let Err(e) = state
            .bus
            .publish(
                TOPIC_RESOURCE_LIMIT,
                payload,
                PublishOptions::from_source(format!("sandbox:{}", state.plugin_id)),
            )
            .await
        {
            error!(plugin_id = %state.plugin_id, error = %e, "Failed to publish violation");
        }
        return;
    }
}

/// Evaluate the three monitor rules over the sample window. Returns the
/// violation kinds and, when leaking, the growth rate in MB/min.
fn detect_violations(
    samples: &VecDeque<MemorySample>,
    quotas: &SandboxQuotas,
    operations: u64,
    runtime_ms: u64,
) -> (Vec<String>, Option<f64>) {
    let mut violations = Vec::new();
    let mut leak_rate = None;

    if let Some(latest) = samples.back()
        && latest.heap_mb > quotas.memory_limit_mb as f64
    {
        violations.push("memory_limit".to_string());
    }

    if samples.len() >= LEAK_WINDOW {
        let window: Vec<&MemorySample> = samples.iter().rev().take(LEAK_WINDOW).collect();
        let (newest, oldest) = (window[0], window[LEAK_WINDOW - 1]);
        let dt_min = (newest.timestamp_ms.saturating_sub(oldest.timestamp_ms)) as f64 / 60_000.0;
        if dt_min > 0.0 {
            let rate = (newest.heap_mb - oldest.heap_mb) / dt_min;
            if rate > LEAK_MB_PER_MIN {
                violations.push("memory_leak".to_string());
                leak_rate = Some(rate);
            }
        }
    }

    let runtime_min = (runtime_ms.max(SAMPLE_INTERVAL_MS)) as f64 / 60_000.0;
    if operations as f64 / runtime_min > MAX_OPS_PER_MIN {
        violations.push("operation_rate".to_string());
    }

    (violations, leak_rate)
}
