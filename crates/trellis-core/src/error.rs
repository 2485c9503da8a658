use thiserror::Error;

/// Root error type for all Trellis operations.
#[derive(Error, Debug)]
pub enum TrellisError {
    #[error("Invalid manifest for '{plugin_id}': {errors:?}")]
    InvalidManifest {
        plugin_id: String,
        errors: Vec<String>,
    },

    #[error("Manifest is missing required field '{field}'")]
    ManifestMissingField { field: String },

    #[error("Plugin '{plugin_id}' requires platform {required}, host is {platform}")]
    IncompatiblePlatform {
        plugin_id: String,
        required: String,
        platform: String,
    },

    #[error("Unresolved dependencies for '{plugin_id}': {missing:?}")]
    DependencyUnresolved {
        plugin_id: String,
        missing: Vec<String>,
    },

    #[error("Dependency '{dependency}' of '{plugin_id}' is not active")]
    DependencyNotActive {
        plugin_id: String,
        dependency: String,
    },

    #[error("Cannot proceed on '{plugin_id}': active dependents {dependents:?}")]
    DependentsActive {
        plugin_id: String,
        dependents: Vec<String>,
    },

    #[error("Operation '{operation}' is not legal from state '{from}'")]
    IllegalTransition { from: String, operation: String },

    #[error("Unknown plugin '{plugin_id}'")]
    PluginNotFound { plugin_id: String },

    #[error("Invalid permissions: {errors:?}")]
    PermissionInvalid { errors: Vec<String> },

    #[error("Rate limit exceeded for '{plugin_id}' on '{permission}'")]
    PermissionRateLimited {
        plugin_id: String,
        permission: String,
    },

    #[error("Path escapes the plugin directory: {path}")]
    PathTraversal { path: String },

    #[error("Failed to load module for '{plugin_id}': {message}")]
    ModuleLoadFailed {
        plugin_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Hook '{stage}' failed for '{plugin_id}': {message}")]
    HookFailed {
        plugin_id: String,
        stage: String,
        message: String,
    },

    #[error("Execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("Resource limits exceeded: {kinds:?}")]
    ResourceLimitExceeded { kinds: Vec<String> },

    #[error("Sandbox for '{plugin_id}' already exists")]
    SandboxAlreadyExists { plugin_id: String },

    #[error("Sandbox for '{plugin_id}' is not running")]
    SandboxNotRunning { plugin_id: String },

    #[error("Operation '{operation}' is not permitted in this context")]
    OperationNotPermitted { operation: String },

    #[error("Circular dependency involving '{key}'")]
    CircularDependency { key: String },

    #[error("Unknown feature flag '{key}'")]
    FlagNotFound { key: String },

    #[error("Feature flag '{key}' is permanent and cannot be deleted")]
    FlagPermanentDelete { key: String },

    #[error("Invalid feature flag '{key}': {message}")]
    FlagInvalid { key: String, message: String },

    #[error("Activation of '{plugin_id}' is disabled by feature flags")]
    ActivationGated { plugin_id: String },

    #[error("Module '{module}' is not available inside the sandbox")]
    ModuleNotAllowed { module: String },

    #[error("Method '{method}' is not exposed by '{plugin_id}'")]
    MethodNotFound { plugin_id: String, method: String },

    #[error("Invalid topic: {message}")]
    InvalidTopic { message: String },

    #[error("Call cancelled")]
    Cancelled,

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TrellisError {
    pub fn invalid_manifest(plugin_id: impl Into<String>, errors: Vec<String>) -> Self {
        Self::InvalidManifest {
            plugin_id: plugin_id.into(),
            errors,
        }
    }

    pub fn illegal_transition(from: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::IllegalTransition {
            from: from.into(),
            operation: operation.into(),
        }
    }

    pub fn not_found(plugin_id: impl Into<String>) -> Self {
        Self::PluginNotFound {
            plugin_id: plugin_id.into(),
        }
    }

    pub fn module_load(plugin_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModuleLoadFailed {
            plugin_id: plugin_id.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn hook_failed(
        plugin_id: impl Into<String>,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::HookFailed {
            plugin_id: plugin_id.into(),
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn not_permitted(operation: impl Into<String>) -> Self {
        Self::OperationNotPermitted {
            operation: operation.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
