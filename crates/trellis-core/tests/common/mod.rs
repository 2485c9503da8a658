#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use trellis_core::bus::{BusEvent, EventBus, EventHandler, SubscribeOptions};
use trellis_core::error::{self, TrellisError};
use trellis_core::host::{ManualClock, MemoryStore};
use trellis_core::loader::{PluginInstance, StaticLoader};
use trellis_core::registry::PluginRegistry;
use trellis_core::sandbox::SandboxEnv;

/// Plugin fake that records every sandbox call it receives.
pub struct TestPlugin {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub fail_method: Option<String>,
    /// Methods that sleep before responding, in milliseconds.
    pub slow: HashMap<String, u64>,
    pub extra_methods: Vec<String>,
}

impl TestPlugin {
    pub fn new(calls: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            calls,
            fail_method: None,
            slow: HashMap::new(),
            extra_methods: Vec::new(),
        }
    }

    pub fn failing_on(mut self, method: &str) -> Self {
        self.fail_method = Some(method.to_string());
        self
    }

    pub fn slow_on(mut self, method: &str, delay_ms: u64) -> Self {
        self.slow.insert(method.to_string(), delay_ms);
        self.extra_methods.push(method.to_string());
        self
    }

    pub fn exposing(mut self, method: &str) -> Self {
        self.extra_methods.push(method.to_string());
        self
    }
}

#[async_trait]
impl PluginInstance for TestPlugin {
    fn methods(&self) -> Vec<String> {
        let mut methods = vec![
            "onActivate".to_string(),
            "onDeactivate".to_string(),
            "onPing".to_string(),
            "echo".to_string(),
            "net.open".to_string(),
            "net.close".to_string(),
        ];
        methods.extend(self.extra_methods.clone());
        methods
    }

    async fn call(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
        _env: &SandboxEnv,
    ) -> error::Result<serde_json::Value> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(method.to_string());
        if self.fail_method.as_deref() == Some(method) {
            return Err(TrellisError::internal(format!("{method} failed")));
        }
        if let Some(delay) = self.slow.get(method) {
            tokio::time::sleep(std::time::Duration::from_millis(*delay)).await;
        }
        Ok(serde_json::json!({ "method": method, "args": args }))
    }
}

/// Everything a registry test needs, wired to a manual clock.
pub struct Harness {
    pub registry: Arc<PluginRegistry>,
    pub loader: Arc<StaticLoader>,
    pub clock: Arc<ManualClock>,
    pub bus: Arc<EventBus>,
    pub store: Arc<MemoryStore>,
    pub root: TempDir,
}

pub fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(1_000));
    let bus = Arc::new(EventBus::with_clock(clock.clone()));
    let loader = Arc::new(StaticLoader::new());
    let store = Arc::new(MemoryStore::new());
    let registry = PluginRegistry::builder()
        .clock(clock.clone())
        .bus(bus.clone())
        .loader(loader.clone())
        .store(store.clone())
        .build();
    let root = tempfile::tempdir().expect("tempdir");
    Harness {
        registry,
        loader,
        clock,
        bus,
        store,
        root,
    }
}

/// Write a plugin directory with a manifest and entry file, and register a
/// recording instance for it. Returns the call log.
pub fn seed_plugin(
    harness: &Harness,
    id: &str,
    version: &str,
    dependencies: &[(&str, &str)],
    permissions: &[&str],
    event_subscriptions: &[(&str, &str)],
) -> Arc<Mutex<Vec<String>>> {
    write_plugin_dir(
        harness.root.path(),
        id,
        version,
        dependencies,
        permissions,
        event_subscriptions,
    );
    let calls = Arc::new(Mutex::new(Vec::new()));
    let factory_calls = calls.clone();
    harness.loader.register(
        id,
        Arc::new(move |_manifest| {
            Ok(Arc::new(TestPlugin::new(factory_calls.clone())) as Arc<dyn PluginInstance>)
        }),
    );
    calls
}

pub fn write_plugin_dir(
    root: &Path,
    id: &str,
    version: &str,
    dependencies: &[(&str, &str)],
    permissions: &[&str],
    event_subscriptions: &[(&str, &str)],
) {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).expect("plugin dir");
    let dependencies: serde_json::Map<String, serde_json::Value> = dependencies
        .iter()
        .map(|(dep, range)| (dep.to_string(), serde_json::json!(range)))
        .collect();
    let subscriptions: Vec<serde_json::Value> = event_subscriptions
        .iter()
        .map(|(topic, handler)| serde_json::json!({ "topic": topic, "handler": handler }))
        .collect();
    let manifest = serde_json::json!({
        "id": id,
        "version": version,
        "minPlatformVersion": "1.0.0",
        "main": "index.js",
        "author": { "name": "Test Author" },
        "dependencies": dependencies,
        "permissions": permissions,
        "eventSubscriptions": subscriptions,
    });
    std::fs::write(
        dir.join("plugin.json"),
        serde_json::to_string_pretty(&manifest).expect("manifest json"),
    )
    .expect("write manifest");
    std::fs::write(dir.join("index.js"), "// entry\n").expect("write entry");
}

/// Subscribe a handler that appends each observed topic to a log.
pub fn record_topics(
    bus: &EventBus,
    pattern: &str,
    log: Arc<Mutex<Vec<String>>>,
) -> String {
    let handler: EventHandler = Arc::new(move |event: BusEvent| {
        let log = log.clone();
        Box::pin(async move {
            log.lock().expect("log lock").push(event.topic);
            Ok(())
        })
    });
    bus.subscribe_pattern(pattern, handler, SubscribeOptions::default())
        .expect("subscribe")
}

/// Subscribe a handler that stores whole events.
pub fn record_events(
    bus: &EventBus,
    topic: &str,
    log: Arc<Mutex<Vec<BusEvent>>>,
) -> String {
    let handler: EventHandler = Arc::new(move |event: BusEvent| {
        let log = log.clone();
        Box::pin(async move {
            log.lock().expect("log lock").push(event);
            Ok(())
        })
    });
    bus.subscribe(topic, handler, SubscribeOptions::default())
        .expect("subscribe")
}
