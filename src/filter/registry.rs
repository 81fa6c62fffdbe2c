//! Computation module registry.
//!
//! Modules are resolved by name at configuration time. Built-in modules are
//! always available; applications add their own with [`ComputationRegistry::register`].
//!
//! | name                      | module                         |
//! |---------------------------|--------------------------------|
//! | `pid`                     | [`PidController`]              |
//! | `process_model`, `sys`    | [`ProcessModel`]               |
//! | `interpolator`, `table`   | [`Interpolator`]               |

use crate::error::{QDaqError, Result};
use crate::filter::computation::{AnyComputation, BuiltinComputation, Computation};
use crate::filter::interpolator::{self, Interpolator};
use crate::filter::pid::{self, PidController};
use crate::filter::process_model::{self, ProcessModel};
use std::collections::HashMap;

/// Factory for a user-registered module.
pub type ComputationFactory = Box<dyn Fn() -> Box<dyn Computation> + Send + Sync>;

const BUILTIN_NAMES: &[&str] = &[
    pid::KIND,
    process_model::KIND,
    "sys",
    interpolator::KIND,
    "table",
];

/// Resolves module names to fresh computation instances.
#[derive(Default)]
pub struct ComputationRegistry {
    plugins: HashMap<String, ComputationFactory>,
}

impl ComputationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under `name`. Built-in names cannot be shadowed.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Computation> + Send + Sync + 'static,
    {
        let name = name.into();
        if BUILTIN_NAMES.contains(&name.as_str()) || self.plugins.contains_key(&name) {
            return Err(QDaqError::PluginLoad {
                module: name,
                message: "a module with this name is already registered".to_string(),
            });
        }
        tracing::debug!("Registered computation module '{}'", name);
        self.plugins.insert(name, Box::new(factory));
        Ok(())
    }

    /// Create a fresh instance of the named module.
    pub fn load(&self, name: &str) -> Result<AnyComputation> {
        let builtin = match name {
            "pid" => Some(BuiltinComputation::Pid(PidController::default())),
            "process_model" | "sys" => Some(BuiltinComputation::ProcessModel(ProcessModel::default())),
            "interpolator" | "table" => Some(BuiltinComputation::Interpolator(Interpolator::new())),
            _ => None,
        };
        if let Some(b) = builtin {
            return Ok(AnyComputation::Builtin(b));
        }
        self.plugins
            .get(name)
            .map(|factory| AnyComputation::Plugin(factory()))
            .ok_or_else(|| QDaqError::PluginLoad {
                module: name.to_string(),
                message: format!("unknown module (available: {})", self.available().join(", ")),
            })
    }

    /// All loadable module names, sorted.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTIN_NAMES
            .iter()
            .map(|s| s.to_string())
            .chain(self.plugins.keys().cloned())
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ComputationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationRegistry")
            .field("available", &self.available())
            .finish()
    }
}
