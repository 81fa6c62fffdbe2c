//! Computation capability behind a filter.
//!
//! Two-layer design, as for pipeline nodes:
//! - **`Computation` trait** - for user-registered modules.
//! - **`BuiltinComputation` enum** - for the modules shipped with the crate. The
//!   compiler can inline match arms on the tick path.
//!
//! `AnyComputation` wraps either variant so filters handle both uniformly.

use crate::config::ConfigValue;
use crate::error::Result;
use crate::filter::interpolator::Interpolator;
use crate::filter::pid::PidController;
use crate::filter::process_model::ProcessModel;
use crate::scheduler::TickContext;
use thiserror::Error;

/// A runtime fault raised by a computation step.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ComputeFault(pub String);

impl ComputeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// An ordered-inputs to ordered-outputs transform with held configuration.
///
/// Implementations must be deterministic in `(inputs, internal state)`: the time
/// step comes from `ctx.dt_secs()`, which is the loop period, not measured time.
pub trait Computation: Send {
    /// Module name used for registry lookup.
    fn kind(&self) -> &str;

    /// Apply a named parameter. Unknown keys are an error.
    fn configure(&mut self, key: &str, value: &ConfigValue) -> Result<()>;

    /// Check the module is ready to run with the given port counts.
    fn validate(&self, inputs: usize, outputs: usize) -> Result<()>;

    /// One computation step.
    fn compute(
        &mut self,
        inputs: &[f64],
        ctx: &TickContext,
    ) -> std::result::Result<Vec<f64>, ComputeFault>;

    /// Clear internal state (integrators, model state).
    fn reset(&mut self) {}
}

/// Enum dispatch for built-in modules.
#[derive(Debug)]
pub enum BuiltinComputation {
    Pid(PidController),
    ProcessModel(ProcessModel),
    Interpolator(Interpolator),
}

impl Computation for BuiltinComputation {
    fn kind(&self) -> &str {
        match self {
            BuiltinComputation::Pid(c) => c.kind(),
            BuiltinComputation::ProcessModel(c) => c.kind(),
            BuiltinComputation::Interpolator(c) => c.kind(),
        }
    }

    fn configure(&mut self, key: &str, value: &ConfigValue) -> Result<()> {
        match self {
            BuiltinComputation::Pid(c) => c.configure(key, value),
            BuiltinComputation::ProcessModel(c) => c.configure(key, value),
            BuiltinComputation::Interpolator(c) => c.configure(key, value),
        }
    }

    fn validate(&self, inputs: usize, outputs: usize) -> Result<()> {
        match self {
            BuiltinComputation::Pid(c) => c.validate(inputs, outputs),
            BuiltinComputation::ProcessModel(c) => c.validate(inputs, outputs),
            BuiltinComputation::Interpolator(c) => c.validate(inputs, outputs),
        }
    }

    fn compute(
        &mut self,
        inputs: &[f64],
        ctx: &TickContext,
    ) -> std::result::Result<Vec<f64>, ComputeFault> {
        match self {
            BuiltinComputation::Pid(c) => c.compute(inputs, ctx),
            BuiltinComputation::ProcessModel(c) => c.compute(inputs, ctx),
            BuiltinComputation::Interpolator(c) => c.compute(inputs, ctx),
        }
    }

    fn reset(&mut self) {
        match self {
            BuiltinComputation::Pid(c) => c.reset(),
            BuiltinComputation::ProcessModel(c) => c.reset(),
            BuiltinComputation::Interpolator(c) => c.reset(),
        }
    }
}

/// Wrapper that holds either a built-in module (enum dispatch) or a plugin (trait object).
pub enum AnyComputation {
    Builtin(BuiltinComputation),
    Plugin(Box<dyn Computation>),
}

impl AnyComputation {
    pub fn kind(&self) -> &str {
        match self {
            AnyComputation::Builtin(c) => c.kind(),
            AnyComputation::Plugin(c) => c.kind(),
        }
    }

    pub fn configure(&mut self, key: &str, value: &ConfigValue) -> Result<()> {
        match self {
            AnyComputation::Builtin(c) => c.configure(key, value),
            AnyComputation::Plugin(c) => c.configure(key, value),
        }
    }

    pub fn validate(&self, inputs: usize, outputs: usize) -> Result<()> {
        match self {
            AnyComputation::Builtin(c) => c.validate(inputs, outputs),
            AnyComputation::Plugin(c) => c.validate(inputs, outputs),
        }
    }

    pub fn compute(
        &mut self,
        inputs: &[f64],
        ctx: &TickContext,
    ) -> std::result::Result<Vec<f64>, ComputeFault> {
        match self {
            AnyComputation::Builtin(c) => c.compute(inputs, ctx),
            AnyComputation::Plugin(c) => c.compute(inputs, ctx),
        }
    }

    pub fn reset(&mut self) {
        match self {
            AnyComputation::Builtin(c) => c.reset(),
            AnyComputation::Plugin(c) => c.reset(),
        }
    }
}

impl std::fmt::Debug for AnyComputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyComputation::Builtin(c) => f.debug_tuple("Builtin").field(c).finish(),
            AnyComputation::Plugin(c) => f.debug_tuple("Plugin").field(&c.kind()).finish(),
        }
    }
}

/// Read a numeric parameter or fail with a configuration error naming the module.
pub(crate) fn expect_float(module: &str, key: &str, value: &ConfigValue) -> Result<f64> {
    value.as_float().ok_or_else(|| {
        crate::error::QDaqError::Config(format!(
            "{}: parameter '{}' expects a number, got {}",
            module, key, value
        ))
    })
}

/// Error for a parameter key the module does not know.
pub(crate) fn unknown_parameter(module: &str, key: &str) -> crate::error::QDaqError {
    crate::error::QDaqError::Config(format!("{}: unknown parameter '{}'", module, key))
}
