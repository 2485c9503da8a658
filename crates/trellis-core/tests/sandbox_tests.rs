mod common;

use async_trait::async_trait;
use common::TestPlugin;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use trellis_core::bus::EventBus;
use trellis_core::error::TrellisError;
use trellis_core::host::{
    AllowAllSecurity, AuthorizationDecision, AuditEvent, ManualClock, SecurityService,
};
use trellis_core::loader::PluginInstance;
use trellis_core::sandbox::{
    IsolationLevel, MemorySampler, Sandbox, SandboxConfig, SandboxServices, TOPIC_RESOURCE_LIMIT,
};
use trellis_core::sandbox_manager::SandboxManager;

fn services(clock: Arc<ManualClock>, bus: Arc<EventBus>) -> SandboxServices {
    SandboxServices {
        bus,
        clock,
        security: Arc::new(AllowAllSecurity::new()),
        sampler: None,
    }
}

fn spawn_plugin(
    dir: &std::path::Path,
    config: SandboxConfig,
    plugin: TestPlugin,
) -> (Arc<Sandbox>, Arc<ManualClock>, Arc<EventBus>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let bus = Arc::new(EventBus::with_clock(clock.clone()));
    let sandbox = Sandbox::spawn(
        "test-plugin",
        dir,
        Arc::new(plugin),
        config,
        services(clock.clone(), bus.clone()),
    );
    (sandbox, clock, bus)
}

#[tokio::test]
async fn call_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (sandbox, _, _) = spawn_plugin(
        dir.path(),
        SandboxConfig::default(),
        TestPlugin::new(calls.clone()),
    );

    let result = sandbox
        .call_method("echo", vec![serde_json::json!("hi")])
        .await
        .unwrap();
    assert_eq!(result["method"], "echo");
    assert_eq!(calls.lock().unwrap().clone(), vec!["echo"]);
    assert_eq!(sandbox.operation_count(), 1);

    sandbox.stop().await;
}

#[tokio::test(start_paused = true)]
async fn call_exceeding_deadline_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let config = SandboxConfig {
        max_execution_time_ms: 30,
        ..SandboxConfig::default()
    };
    // One millisecond over the deadline must fail.
    let (sandbox, _, _) = spawn_plugin(
        dir.path(),
        config,
        TestPlugin::new(calls.clone()).slow_on("slowpoke", 31),
    );

    let result = sandbox.call_method("slowpoke", Vec::new()).await;
    assert!(matches!(
        result,
        Err(TrellisError::ExecutionTimeout { timeout_ms: 30 })
    ));

    // The late response is dropped by the router; the sandbox keeps serving.
    let result = sandbox.call_method("echo", Vec::new()).await.unwrap();
    assert_eq!(result["method"], "echo");

    sandbox.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_calls() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (sandbox, _, _) = spawn_plugin(
        dir.path(),
        SandboxConfig::default(),
        TestPlugin::new(calls).slow_on("forever", 600_000),
    );

    let in_flight = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move { sandbox.call_method("forever", Vec::new()).await })
    };
    tokio::task::yield_now().await;

    sandbox.stop().await;
    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(TrellisError::Cancelled)));

    assert!(!sandbox.is_running());
    assert!(matches!(
        sandbox.call_method("echo", Vec::new()).await,
        Err(TrellisError::SandboxNotRunning { .. })
    ));
}

#[tokio::test]
async fn network_connection_quota() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let config = SandboxConfig {
        max_network_connections: 2,
        ..SandboxConfig::default()
    };
    let (sandbox, _, _) = spawn_plugin(dir.path(), config, TestPlugin::new(calls));

    sandbox.call_method("net.open", Vec::new()).await.unwrap();
    sandbox.call_method("net.open", Vec::new()).await.unwrap();
    assert_eq!(sandbox.active_connection_count(), 2);

    let result = sandbox.call_method("net.open", Vec::new()).await;
    assert!(matches!(
        result,
        Err(TrellisError::ResourceLimitExceeded { .. })
    ));

    sandbox.call_method("net.close", Vec::new()).await.unwrap();
    assert_eq!(sandbox.active_connection_count(), 1);
    sandbox.call_method("net.open", Vec::new()).await.unwrap();

    sandbox.stop().await;
}

#[tokio::test]
async fn isolation_levels_cap_quotas() {
    let config = SandboxConfig {
        isolation: IsolationLevel::Strict,
        memory_limit_mb: 256,
        ..SandboxConfig::default()
    };
    assert_eq!(config.quotas().memory_limit_mb, 64);

    let config = SandboxConfig {
        isolation: IsolationLevel::Moderate,
        memory_limit_mb: 256,
        ..SandboxConfig::default()
    };
    let quotas = config.quotas();
    assert_eq!(quotas.memory_limit_mb, 128);
    assert_eq!(quotas.code_range_mb, 32);
    assert_eq!(quotas.stack_mb, 8);
}

// -- restricted environment -------------------------------------------------

#[tokio::test]
async fn scoped_fs_honors_permissions_and_boundaries() {
    let root = tempfile::tempdir().unwrap();
    let plugin_dir = root.path().join("plugin");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(plugin_dir.join("data.txt"), b"inside").unwrap();
    std::fs::write(root.path().join("outside.txt"), b"outside").unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let config = SandboxConfig {
        permissions: vec!["file:read".to_string(), "file:write".to_string()],
        ..SandboxConfig::default()
    };
    let (sandbox, _, _) = spawn_plugin(&plugin_dir, config, TestPlugin::new(calls.clone()));
    let env = sandbox.env();

    assert_eq!(env.read_file("data.txt").await.unwrap(), b"inside");
    assert!(matches!(
        env.read_file("../outside.txt").await,
        Err(TrellisError::PathTraversal { .. })
    ));
    assert!(matches!(
        env.read_file("/etc/hostname").await,
        Err(TrellisError::PathTraversal { .. })
    ));

    env.write_file("out.txt", b"written").await.unwrap();
    assert_eq!(std::fs::read(plugin_dir.join("out.txt")).unwrap(), b"written");
    assert!(matches!(
        env.write_file("../escape.txt", b"x").await,
        Err(TrellisError::PathTraversal { .. })
    ));

    sandbox.stop().await;

    // Without the file permissions every access is refused.
    let (sandbox, _, _) = spawn_plugin(
        &plugin_dir,
        SandboxConfig::default(),
        TestPlugin::new(calls),
    );
    let env = sandbox.env();
    assert!(matches!(
        env.read_file("data.txt").await,
        Err(TrellisError::OperationNotPermitted { .. })
    ));
    assert!(matches!(
        env.write_file("out.txt", b"x").await,
        Err(TrellisError::OperationNotPermitted { .. })
    ));
    sandbox.stop().await;
}

#[tokio::test]
async fn disk_quota_is_enforced() {
    let root = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let config = SandboxConfig {
        permissions: vec!["file:write".to_string()],
        disk_quota_mb: 0,
        ..SandboxConfig::default()
    };
    let (sandbox, _, _) = spawn_plugin(root.path(), config, TestPlugin::new(calls));
    let result = sandbox.env().write_file("big.bin", b"data").await;
    assert!(matches!(
        result,
        Err(TrellisError::ResourceLimitExceeded { .. })
    ));
    sandbox.stop().await;
}

#[tokio::test]
async fn module_surface_is_closed() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (sandbox, _, _) = spawn_plugin(dir.path(), SandboxConfig::default(), TestPlugin::new(calls));
    let env = sandbox.env();

    for module in ["console", "timers", "fs", "http", "process"] {
        assert!(env.require_module(module).is_ok());
    }
    assert!(matches!(
        env.require_module("child_process"),
        Err(TrellisError::ModuleNotAllowed { .. })
    ));
    sandbox.stop().await;
}

#[tokio::test]
async fn process_view_exposes_plugin_id_and_whitelist_only() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let config = SandboxConfig {
        env_whitelist: vec!["PATH".to_string()],
        ..SandboxConfig::default()
    };
    let (sandbox, _, _) = spawn_plugin(dir.path(), config, TestPlugin::new(calls));
    let env = sandbox.env();

    assert_eq!(env.env_var("PLUGIN_ID").as_deref(), Some("test-plugin"));
    assert!(env.env_var("PATH").is_some());
    assert!(env.env_var("HOME").is_none());
    sandbox.stop().await;
}

#[tokio::test]
async fn http_mediator_is_gated_and_host_scoped() {
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/hello"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("world"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let config = SandboxConfig {
        permissions: vec!["network:http".to_string()],
        allowed_hosts: vec!["127.0.0.1".to_string()],
        ..SandboxConfig::default()
    };
    let (sandbox, _, _) = spawn_plugin(dir.path(), config, TestPlugin::new(calls.clone()));
    let env = sandbox.env();

    let response = env
        .http_fetch("GET", &format!("{}/hello", server.uri()))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "world");

    // Hosts outside the allow-list are refused before any request is made.
    assert!(matches!(
        env.http_fetch("GET", "http://example.com/").await,
        Err(TrellisError::OperationNotPermitted { .. })
    ));
    sandbox.stop().await;

    // Without network:http the mediator refuses outright.
    let (sandbox, _, _) = spawn_plugin(dir.path(), SandboxConfig::default(), TestPlugin::new(calls));
    assert!(matches!(
        sandbox.env().http_fetch("GET", "http://127.0.0.1/").await,
        Err(TrellisError::OperationNotPermitted { .. })
    ));
    sandbox.stop().await;
}

// -- security gating --------------------------------------------------------

struct DenyingSecurity;

#[async_trait]
impl SecurityService for DenyingSecurity {
    async fn has_permission(&self, _subject: &str, _permission: &str) -> AuthorizationDecision {
        AuthorizationDecision {
            granted: true,
            reason: None,
        }
    }

    async fn log_event(&self, _event: AuditEvent) -> trellis_core::error::Result<()> {
        Ok(())
    }

    async fn validate_plugin_action(
        &self,
        _plugin_id: &str,
        action: &str,
        _args: &[serde_json::Value],
    ) -> AuthorizationDecision {
        AuthorizationDecision {
            granted: action != "forbidden",
            reason: Some("policy".to_string()),
        }
    }
}

#[tokio::test]
async fn security_service_vets_every_call() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let clock = Arc::new(ManualClock::new(1_000));
    let bus = Arc::new(EventBus::with_clock(clock.clone()));
    let sandbox = Sandbox::spawn(
        "vetted",
        dir.path(),
        Arc::new(TestPlugin::new(calls.clone()).exposing("forbidden")),
        SandboxConfig::default(),
        SandboxServices {
            bus,
            clock,
            security: Arc::new(DenyingSecurity),
            sampler: None,
        },
    );

    assert!(sandbox.call_method("echo", Vec::new()).await.is_ok());
    assert!(matches!(
        sandbox.call_method("forbidden", Vec::new()).await,
        Err(TrellisError::OperationNotPermitted { .. })
    ));
    // The denied call never reached the instance.
    assert_eq!(calls.lock().unwrap().clone(), vec!["echo"]);

    sandbox.stop().await;
}

// -- resource monitor -------------------------------------------------------

/// Grows by a fixed amount per sample and advances the manual clock so the
/// sample timestamps are one second apart.
struct LeakSampler {
    mb: Mutex<f64>,
    step_mb: f64,
    clock: Arc<ManualClock>,
}

impl MemorySampler for LeakSampler {
    fn sample_mb(&self) -> f64 {
        let mut mb = self.mb.lock().unwrap();
        *mb += self.step_mb;
        self.clock.advance(1_000);
        *mb
    }
}

#[tokio::test(start_paused = true)]
async fn leaking_sandbox_emits_violation_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let clock = Arc::new(ManualClock::new(1_000));
    let bus = Arc::new(EventBus::with_clock(clock.clone()));
    let events = Arc::new(Mutex::new(Vec::new()));
    common::record_events(&bus, TOPIC_RESOURCE_LIMIT, events.clone());

    let sampler = Arc::new(LeakSampler {
        mb: Mutex::new(0.0),
        // 1 MB per second: 60 MB/min, far beyond the 5 MB/min allowance.
        step_mb: 1.0,
        clock: clock.clone(),
    });
    let sandbox = Sandbox::spawn(
        "leaky",
        dir.path(),
        Arc::new(TestPlugin::new(calls)),
        SandboxConfig::default(),
        SandboxServices {
            bus,
            clock,
            security: Arc::new(AllowAllSecurity::new()),
            sampler: Some(sampler),
        },
    );

    for _ in 0..60 {
        if !events.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1, "expected exactly one violation event");
    let payload = &events[0].payload;
    assert_eq!(payload["pluginId"], "leaky");
    let violations: Vec<String> = payload["violations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(violations.contains(&"memory_leak".to_string()));
    assert!(payload["memoryLeak"]["growthMbPerMin"].as_f64().unwrap() > 5.0);
    assert!(!sandbox.is_running());
}

// -- manager ----------------------------------------------------------------

#[tokio::test]
async fn manager_rejects_duplicates_and_destroys_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let bus = Arc::new(EventBus::with_clock(clock.clone()));
    let manager = Arc::new(SandboxManager::new(services(clock, bus)));

    let calls = Arc::new(Mutex::new(Vec::new()));
    let make_instance =
        || Arc::new(TestPlugin::new(calls.clone())) as Arc<dyn PluginInstance>;

    manager
        .create("p1", dir.path(), make_instance(), SandboxConfig::default())
        .unwrap();
    assert!(matches!(
        manager.create("p1", dir.path(), make_instance(), SandboxConfig::default()),
        Err(TrellisError::SandboxAlreadyExists { .. })
    ));
    assert_eq!(manager.count(), 1);
    assert!(manager.get("p1").is_some());

    manager.destroy("p1").await;
    manager.destroy("p1").await;
    assert_eq!(manager.count(), 0);
    assert!(manager.get("p1").is_none());
}

#[tokio::test]
async fn destroy_all_stops_everything() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let bus = Arc::new(EventBus::with_clock(clock.clone()));
    let manager = Arc::new(SandboxManager::new(services(clock, bus)));
    manager.start_monitor();

    let mut sandboxes = Vec::new();
    for i in 0..3 {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sandbox = manager
            .create(
                &format!("p{i}"),
                dir.path(),
                Arc::new(TestPlugin::new(calls)),
                SandboxConfig::default(),
            )
            .unwrap();
        sandboxes.push(sandbox);
    }
    assert_eq!(manager.count(), 3);

    manager.destroy_all().await;
    assert_eq!(manager.count(), 0);
    for sandbox in sandboxes {
        assert!(!sandbox.is_running());
    }
}
