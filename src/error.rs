//! Error handling for QDaq
//!
//! This module defines the error taxonomy shared by the tree, the computation
//! modules, the script engine and the loop scheduler, plus a Result alias.
//!
//! Errors fall into three groups:
//!
//! - **Tree**: [`QDaqError::DuplicateName`], [`QDaqError::NotFound`]
//! - **Configuration time**: [`QDaqError::PluginLoad`], [`QDaqError::ResourceLoad`],
//!   [`QDaqError::ScriptCompile`]. These are returned synchronously and prevent arming.
//! - **Per tick**: [`QDaqError::Compute`], [`QDaqError::Script`]. The engine catches
//!   these at the step boundary; they never stop a loop.
//! - **Lifecycle misuse**: [`QDaqError::NotConfigured`], [`QDaqError::AlreadyBound`],
//!   [`QDaqError::StructuralChangeWhileRunning`], [`QDaqError::ConfigurationWhileRunning`].

use thiserror::Error;

/// Main error type for QDaq operations
#[derive(Error, Debug)]
pub enum QDaqError {
    /// A sibling with the same name already exists
    #[error("Duplicate name '{name}' under '{parent}'")]
    DuplicateName { parent: String, name: String },

    /// A path segment could not be resolved
    #[error("Not found: '{segment}' while resolving '{path}'")]
    NotFound { path: String, segment: String },

    /// Node names must be non-empty and must not contain '.'
    #[error("Invalid node name '{0}'")]
    InvalidName(String),

    /// The requested tree change would break the tree shape (e.g. a cycle)
    #[error("Invalid structure: {0}")]
    InvalidStructure(String),

    /// A computation module could not be resolved or initialized
    #[error("Plugin load error for '{module}': {message}")]
    PluginLoad { module: String, message: String },

    /// A module resource (e.g. an interpolation table) failed to load
    #[error("Resource load error for '{resource}': {message}")]
    ResourceLoad { resource: String, message: String },

    /// A filter computation failed during a tick
    #[error("Compute error in '{path}' at tick {tick}: {message}")]
    Compute {
        path: String,
        tick: u64,
        message: String,
    },

    /// A job script failed during a tick
    #[error("Script error in '{path}' at tick {tick}: {message}")]
    Script {
        path: String,
        tick: u64,
        message: String,
    },

    /// A job script failed to compile
    #[error("Script compile error in '{path}': {message}")]
    ScriptCompile { path: String, message: String },

    /// Arming was attempted without an engine or a period
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// The loop already has an engine
    #[error("Loop '{0}' already has an engine")]
    AlreadyBound(String),

    /// Children cannot be added or removed while the loop is running
    #[error("Structural change while '{0}' is running")]
    StructuralChangeWhileRunning(String),

    /// Module parameters, ports and timing are frozen while the loop is running
    #[error("Configuration change while '{0}' is running")]
    ConfigurationWhileRunning(String),

    /// Scheduler thread errors
    #[error("Engine error: {0}")]
    Engine(String),

    /// Errors related to project configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<QDaqError>,
    },
}

impl QDaqError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        QDaqError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a [`QDaqError::NotFound`] error
    pub fn not_found(path: impl Into<String>, segment: impl Into<String>) -> Self {
        QDaqError::NotFound {
            path: path.into(),
            segment: segment.into(),
        }
    }

    /// True for errors the scheduler isolates to a single step
    pub fn is_per_tick(&self) -> bool {
        matches!(self, QDaqError::Compute { .. } | QDaqError::Script { .. })
    }
}

/// Result type alias for QDaq operations
pub type Result<T> = std::result::Result<T, QDaqError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
