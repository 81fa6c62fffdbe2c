//! Project-wide engine settings
//!
//! Defaults applied to every node a project builds. Individual nodes may still
//! override them (e.g. a channel's `history`).

use crate::channel::DEFAULT_HISTORY_CAPACITY;
use crate::scripting::DEFAULT_MAX_OPERATIONS;
use serde::{Deserialize, Serialize};

/// Defaults for channels and jobs built from a project file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Samples kept per channel (0 disables history)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Rhai operation budget per job run (0 = unlimited)
    #[serde(default = "default_script_max_operations")]
    pub script_max_operations: u64,
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_script_max_operations() -> u64 {
    DEFAULT_MAX_OPERATIONS
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            script_max_operations: default_script_max_operations(),
        }
    }
}
