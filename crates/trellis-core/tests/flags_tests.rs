mod common;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::{Arc, Mutex};
use trellis_core::bus::EventBus;
use trellis_core::error::TrellisError;
use trellis_core::flags::{
    ConditionOperator, EvalReason, FeatureFlag, FeatureFlagEvaluator, FlagContext, FlagOverride,
    FlagRule, RuleCondition,
};
use trellis_core::host::ManualClock;
use trellis_core::Clock;

fn evaluator() -> (FeatureFlagEvaluator, Arc<ManualClock>, Arc<EventBus>) {
    let clock = Arc::new(ManualClock::new(50_000));
    let bus = Arc::new(EventBus::with_clock(clock.clone()));
    (
        FeatureFlagEvaluator::new(bus.clone(), clock.clone()),
        clock,
        bus,
    )
}

fn ctx(value: serde_json::Value) -> FlagContext {
    value.as_object().cloned().unwrap_or_default()
}

fn dark_mode_flag() -> FeatureFlag {
    FeatureFlag::new("ui.dark_mode", false).with_rule(FlagRule {
        active: true,
        value: true,
        conditions: vec![RuleCondition {
            attribute: "attributes.prefers_dark_mode".to_string(),
            operator: ConditionOperator::Eq,
            value: json!(true),
        }],
        percentage: None,
        description: None,
    })
}

#[tokio::test]
async fn rule_matches_then_override_wins() {
    let (flags, _, _) = evaluator();
    flags.create_flag(dark_mode_flag(), "ops").await.unwrap();

    let context = ctx(json!({
        "userId": "u1",
        "attributes": { "prefers_dark_mode": true }
    }));
    let evaluation = flags.evaluate("ui.dark_mode", &context);
    assert!(evaluation.value);
    assert_eq!(evaluation.reason, EvalReason::Rule { index: 0 });

    flags
        .set_override(FlagOverride {
            key: "ui.dark_mode".to_string(),
            value: false,
            context: ctx(json!({ "userId": "u1" })),
            expires_at_ms: None,
            created_by: "ops".to_string(),
            created_at_ms: 0,
        })
        .await
        .unwrap();

    let evaluation = flags.evaluate("ui.dark_mode", &context);
    assert!(!evaluation.value);
    assert_eq!(evaluation.reason, EvalReason::Override);

    // A different user is unaffected by the scoped override.
    let other = ctx(json!({
        "userId": "u2",
        "attributes": { "prefers_dark_mode": true }
    }));
    assert!(flags.evaluate("ui.dark_mode", &other).value);
}

#[tokio::test]
async fn override_round_trip_restores_evaluation() {
    let (flags, _, _) = evaluator();
    flags.create_flag(dark_mode_flag(), "ops").await.unwrap();
    let context = ctx(json!({
        "userId": "u1",
        "attributes": { "prefers_dark_mode": true }
    }));
    let before = flags.evaluate("ui.dark_mode", &context);

    let override_context = ctx(json!({ "userId": "u1" }));
    flags
        .set_override(FlagOverride {
            key: "ui.dark_mode".to_string(),
            value: false,
            context: override_context.clone(),
            expires_at_ms: None,
            created_by: "ops".to_string(),
            created_at_ms: 0,
        })
        .await
        .unwrap();
    assert!(!flags.evaluate("ui.dark_mode", &context).value);

    let removed = flags
        .remove_override("ui.dark_mode", &override_context, "ops")
        .await
        .unwrap();
    assert!(removed);

    let after = flags.evaluate("ui.dark_mode", &context);
    assert_eq!(before.value, after.value);
    assert_eq!(after.reason, EvalReason::Rule { index: 0 });
}

#[tokio::test]
async fn most_specific_override_wins() {
    let (flags, _, _) = evaluator();
    flags
        .create_flag(FeatureFlag::new("beta", false), "ops")
        .await
        .unwrap();

    flags
        .set_override(FlagOverride {
            key: "beta".to_string(),
            value: true,
            context: FlagContext::new(),
            expires_at_ms: None,
            created_by: "ops".to_string(),
            created_at_ms: 0,
        })
        .await
        .unwrap();
    flags
        .set_override(FlagOverride {
            key: "beta".to_string(),
            value: false,
            context: ctx(json!({ "userId": "u1", "plan": "pro" })),
            expires_at_ms: None,
            created_by: "ops".to_string(),
            created_at_ms: 0,
        })
        .await
        .unwrap();

    // Both match; the two-attribute override is more specific.
    let context = ctx(json!({ "userId": "u1", "plan": "pro", "extra": 1 }));
    assert!(!flags.evaluate("beta", &context).value);
    // Only the empty-context override matches here.
    let context = ctx(json!({ "userId": "u2" }));
    assert!(flags.evaluate("beta", &context).value);
}

#[tokio::test]
async fn expired_overrides_are_ignored() {
    let (flags, clock, _) = evaluator();
    flags
        .create_flag(FeatureFlag::new("beta", false), "ops")
        .await
        .unwrap();
    flags
        .set_override(FlagOverride {
            key: "beta".to_string(),
            value: true,
            context: FlagContext::new(),
            expires_at_ms: Some(clock.now_ms() + 1_000),
            created_by: "ops".to_string(),
            created_at_ms: 0,
        })
        .await
        .unwrap();

    assert!(flags.evaluate("beta", &FlagContext::new()).value);
    clock.advance(2_000);
    let evaluation = flags.evaluate("beta", &FlagContext::new());
    assert!(!evaluation.value);
    assert_eq!(evaluation.reason, EvalReason::Default);
}

#[tokio::test]
async fn dependencies_gate_the_flag() {
    let (flags, _, _) = evaluator();
    flags
        .create_flag(FeatureFlag::new("parent", false), "ops")
        .await
        .unwrap();
    flags
        .create_flag(
            FeatureFlag::new("child", true).with_dependency("parent", true),
            "ops",
        )
        .await
        .unwrap();

    let evaluation = flags.evaluate("child", &FlagContext::new());
    assert!(!evaluation.value);
    assert_eq!(evaluation.reason, EvalReason::Dependency);

    // Flip the parent and the child follows its own default.
    let mut parent = flags.get_flag("parent").unwrap();
    parent.default_value = true;
    flags.update_flag(parent, "ops").await.unwrap();
    let evaluation = flags.evaluate("child", &FlagContext::new());
    assert!(evaluation.value);
    assert_eq!(evaluation.reason, EvalReason::Default);
}

#[tokio::test]
async fn diamond_dependencies_are_not_circular() {
    let (flags, _, _) = evaluator();
    flags
        .create_flag(FeatureFlag::new("base", true), "ops")
        .await
        .unwrap();
    flags
        .create_flag(FeatureFlag::new("mid", true).with_dependency("base", true), "ops")
        .await
        .unwrap();
    flags
        .create_flag(
            FeatureFlag::new("top", true)
                .with_dependency("base", true)
                .with_dependency("mid", true),
            "ops",
        )
        .await
        .unwrap();

    let evaluation = flags.evaluate("top", &FlagContext::new());
    assert_eq!(evaluation.reason, EvalReason::Default);
    assert!(evaluation.value);
}

#[tokio::test]
async fn circular_dependencies_are_rejected_at_mutation() {
    let (flags, _, _) = evaluator();
    flags
        .create_flag(FeatureFlag::new("a", true), "ops")
        .await
        .unwrap();
    flags
        .create_flag(FeatureFlag::new("b", true).with_dependency("a", true), "ops")
        .await
        .unwrap();

    let cyclic = flags.get_flag("a").unwrap().with_dependency("b", true);
    let result = flags.update_flag(cyclic, "ops").await;
    assert!(matches!(
        result,
        Err(TrellisError::CircularDependency { .. })
    ));

    let unknown = FeatureFlag::new("c", true).with_dependency("ghost", true);
    assert!(matches!(
        flags.create_flag(unknown, "ops").await,
        Err(TrellisError::FlagInvalid { .. })
    ));
}

#[tokio::test]
async fn validation_rejects_bad_keys_and_percentages() {
    let (flags, _, _) = evaluator();
    assert!(matches!(
        flags.create_flag(FeatureFlag::new("Bad Key", true), "ops").await,
        Err(TrellisError::FlagInvalid { .. })
    ));

    let flag = FeatureFlag::new("rollout", false).with_rule(FlagRule {
        active: true,
        value: true,
        conditions: Vec::new(),
        percentage: Some(150.0),
        description: None,
    });
    assert!(matches!(
        flags.create_flag(flag, "ops").await,
        Err(TrellisError::FlagInvalid { .. })
    ));
}

#[tokio::test]
async fn percentage_rollout_is_deterministic() {
    let (flags, _, _) = evaluator();
    let flag = FeatureFlag::new("rollout", false).with_rule(FlagRule {
        active: true,
        value: true,
        conditions: Vec::new(),
        percentage: Some(50.0),
        description: None,
    });
    flags.create_flag(flag, "ops").await.unwrap();

    let mut enabled = 0;
    for i in 0..200 {
        let context = ctx(json!({ "userId": format!("user-{i}") }));
        let first = flags.evaluate("rollout", &context).value;
        let second = flags.evaluate("rollout", &context).value;
        assert_eq!(first, second, "bucketing must be stable per user");
        if first {
            enabled += 1;
        }
    }
    // Roughly half the users land in the rollout.
    assert!((60..=140).contains(&enabled), "got {enabled}");
}

#[tokio::test]
async fn full_and_zero_percentages_are_absolute() {
    let (flags, _, _) = evaluator();
    for (key, percentage) in [("all", 100.0), ("none", 0.0)] {
        let flag = FeatureFlag::new(key, false).with_rule(FlagRule {
            active: true,
            value: true,
            conditions: Vec::new(),
            percentage: Some(percentage),
            description: None,
        });
        flags.create_flag(flag, "ops").await.unwrap();
    }
    for i in 0..50 {
        let context = ctx(json!({ "userId": format!("u{i}") }));
        assert!(flags.evaluate("all", &context).value);
        assert!(!flags.evaluate("none", &context).value);
    }
}

#[tokio::test]
async fn inactive_rules_are_skipped() {
    let (flags, _, _) = evaluator();
    let flag = FeatureFlag::new("gated", false)
        .with_rule(FlagRule {
            active: false,
            value: true,
            conditions: Vec::new(),
            percentage: None,
            description: None,
        })
        .with_rule(FlagRule {
            active: true,
            value: true,
            conditions: Vec::new(),
            percentage: None,
            description: None,
        });
    flags.create_flag(flag, "ops").await.unwrap();
    let evaluation = flags.evaluate("gated", &FlagContext::new());
    assert_eq!(evaluation.reason, EvalReason::Rule { index: 1 });
}

#[tokio::test]
async fn unknown_flag_reports_error_and_is_enabled_degrades() {
    let (flags, _, _) = evaluator();
    let evaluation = flags.evaluate("ghost", &FlagContext::new());
    assert_eq!(evaluation.reason, EvalReason::Error);
    assert!(!evaluation.value);
    assert!(!flags.is_enabled("ghost", &FlagContext::new()));
}

#[tokio::test]
async fn is_enabled_agrees_with_evaluate_across_mutations() {
    let (flags, _, _) = evaluator();
    flags
        .create_flag(FeatureFlag::new("sync", true), "ops")
        .await
        .unwrap();
    let context = ctx(json!({ "userId": "u1" }));

    // Prime the cache, then mutate: the cache must be invalidated before
    // the mutation returns.
    assert!(flags.is_enabled("sync", &context));
    let mut flag = flags.get_flag("sync").unwrap();
    flag.default_value = false;
    flags.update_flag(flag, "ops").await.unwrap();

    assert_eq!(
        flags.is_enabled("sync", &context),
        flags.evaluate("sync", &context).value
    );
    assert!(!flags.is_enabled("sync", &context));
}

#[tokio::test]
async fn flag_with_no_rules_or_dependencies_yields_default() {
    let (flags, _, _) = evaluator();
    flags
        .create_flag(FeatureFlag::new("plain", true), "ops")
        .await
        .unwrap();
    let evaluation = flags.evaluate("plain", &FlagContext::new());
    assert!(evaluation.value);
    assert_eq!(evaluation.reason, EvalReason::Default);
}

#[tokio::test]
async fn create_delete_round_trip_restores_store() {
    let (flags, _, _) = evaluator();
    let before: Vec<String> = flags.list_flags().iter().map(|f| f.key.clone()).collect();

    flags
        .create_flag(FeatureFlag::new("ephemeral", true), "ops")
        .await
        .unwrap();
    flags.delete_flag("ephemeral", "ops").await.unwrap();

    let after: Vec<String> = flags.list_flags().iter().map(|f| f.key.clone()).collect();
    assert_eq!(before, after);
    // The audit trail keeps the history.
    assert_eq!(flags.audit_trail(Some("ephemeral")).len(), 2);
}

#[tokio::test]
async fn permanent_flags_cannot_be_deleted() {
    let (flags, _, _) = evaluator();
    flags
        .create_flag(FeatureFlag::new("keeper", true).permanent(), "ops")
        .await
        .unwrap();
    assert!(matches!(
        flags.delete_flag("keeper", "ops").await,
        Err(TrellisError::FlagPermanentDelete { .. })
    ));
    assert!(flags.get_flag("keeper").is_some());
}

#[tokio::test]
async fn mutations_publish_bus_events() {
    let (flags, _, bus) = evaluator();
    let topics = Arc::new(Mutex::new(Vec::new()));
    common::record_topics(&bus, "featureFlags.*", topics.clone());

    flags
        .create_flag(FeatureFlag::new("observable", true), "ops")
        .await
        .unwrap();
    flags
        .set_override(FlagOverride {
            key: "observable".to_string(),
            value: false,
            context: FlagContext::new(),
            expires_at_ms: None,
            created_by: "ops".to_string(),
            created_at_ms: 0,
        })
        .await
        .unwrap();
    flags
        .remove_override("observable", &FlagContext::new(), "ops")
        .await
        .unwrap();
    flags.delete_flag("observable", "ops").await.unwrap();

    assert_eq!(
        topics.lock().unwrap().clone(),
        vec![
            "featureFlags.created",
            "featureFlags.overrideSet",
            "featureFlags.overrideRemoved",
            "featureFlags.deleted",
        ]
    );
}

#[tokio::test]
async fn plugin_activation_gate() {
    let (flags, _, _) = evaluator();
    let context = FlagContext::new();

    // No gating flags: anything may activate.
    assert!(flags.should_activate_plugin("notes", &context));

    flags
        .create_flag(
            FeatureFlag::new("plugins.notes.enabled", false).gating_plugin("notes"),
            "ops",
        )
        .await
        .unwrap();
    assert!(!flags.should_activate_plugin("notes", &context));
    assert!(flags.should_activate_plugin("other", &context));

    let mut flag = flags.get_flag("plugins.notes.enabled").unwrap();
    flag.default_value = true;
    flags.update_flag(flag, "ops").await.unwrap();
    assert!(flags.should_activate_plugin("notes", &context));
}
