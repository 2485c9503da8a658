//! # Trellis Core
//!
//! Brokered plugin runtime for host applications. Discovers extension
//! packages on disk, resolves their dependency graph, runs each one in an
//! isolated sandbox with enforced permissions and quotas, and mediates all
//! plugin/host communication through an event bus and a scoped context.

pub mod bus;
pub mod context;
pub mod error;
pub mod flags;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod permissions;
pub mod registry;
pub mod sandbox;
pub mod sandbox_manager;

pub use bus::{BusEvent, EventBus, PublishOptions, SubscribeOptions};
pub use context::PluginContext;
pub use error::TrellisError;
pub use flags::{Evaluation, FeatureFlag, FeatureFlagEvaluator, FlagOverride, FlagRule};
pub use host::{
    Clock, DataStore, PlatformInfo, RouteRegistry, SecurityService, SystemClock, UiShell,
};
pub use loader::{PluginInstance, PluginLoader, StaticLoader};
pub use manifest::PluginManifest;
pub use permissions::{PermissionValidator, ValidationReport};
pub use registry::{PluginInfo, PluginRegistry, PluginState, RegistryBuilder};
pub use sandbox::{IsolationLevel, Sandbox, SandboxConfig, SandboxEnv, SandboxQuotas};
pub use sandbox_manager::SandboxManager;
