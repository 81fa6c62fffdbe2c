//! Filter node: a computation stage with declared input and output channels.
//!
//! Each tick the filter snapshots all of its inputs, runs its module once, then
//! writes the results to its outputs in declaration order. Ports, the module and
//! its parameters are frozen while the owning loop runs.

use crate::channel::{ChangeSet, Channel};
use crate::config::ConfigValue;
use crate::error::{QDaqError, Result};
use crate::filter::computation::AnyComputation;
use crate::filter::registry::ComputationRegistry;
use crate::scheduler::TickContext;
use crate::sync;
use crate::tree::NodeCore;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Default)]
struct FilterPorts {
    inputs: Vec<Arc<Channel>>,
    outputs: Vec<Arc<Channel>>,
}

struct LoadedModule {
    name: String,
    computation: AnyComputation,
    params: BTreeMap<String, ConfigValue>,
}

/// A pluggable, deterministic computation stage.
pub struct Filter {
    core: NodeCore,
    ports: RwLock<FilterPorts>,
    module: Mutex<Option<LoadedModule>>,
}

impl Filter {
    /// Create a filter with no module loaded.
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            core: NodeCore::new(name)?,
            ports: RwLock::new(FilterPorts::default()),
            module: Mutex::new(None),
        }))
    }

    /// Create a filter and load `module` from `registry`.
    pub fn with_module(
        name: impl Into<String>,
        module: &str,
        registry: &ComputationRegistry,
    ) -> Result<Arc<Self>> {
        let filter = Self::new(name)?;
        filter.load(module, registry)?;
        Ok(filter)
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn full_path(&self) -> String {
        self.core.full_path()
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.core.owner_running() {
            return Err(QDaqError::ConfigurationWhileRunning(self.full_path()));
        }
        Ok(())
    }

    /// Load a computation module by name, replacing any previous module and
    /// discarding its parameters.
    pub fn load(&self, module: &str, registry: &ComputationRegistry) -> Result<()> {
        self.ensure_idle()?;
        let computation = registry.load(module)?;
        tracing::debug!("Filter {} loaded module '{}'", self.full_path(), module);
        *sync::lock(&self.module) = Some(LoadedModule {
            name: module.to_string(),
            computation,
            params: BTreeMap::new(),
        });
        Ok(())
    }

    /// Name the module was loaded under.
    pub fn module_name(&self) -> Option<String> {
        sync::lock(&self.module).as_ref().map(|m| m.name.clone())
    }

    /// Set a module parameter. Rejected while the owning loop runs.
    pub fn configure(&self, key: &str, value: impl Into<ConfigValue>) -> Result<()> {
        self.ensure_idle()?;
        let value = value.into();
        let mut module = sync::lock(&self.module);
        let loaded = module.as_mut().ok_or_else(|| self.no_module_error())?;
        loaded.computation.configure(key, &value)?;
        loaded.params.insert(key.to_string(), value);
        Ok(())
    }

    /// Parameters applied since the module was loaded.
    pub fn parameters(&self) -> BTreeMap<String, ConfigValue> {
        sync::lock(&self.module)
            .as_ref()
            .map(|m| m.params.clone())
            .unwrap_or_default()
    }

    pub fn set_inputs(&self, inputs: Vec<Arc<Channel>>) -> Result<()> {
        self.ensure_idle()?;
        sync::write(&self.ports).inputs = inputs;
        Ok(())
    }

    pub fn set_outputs(&self, outputs: Vec<Arc<Channel>>) -> Result<()> {
        self.ensure_idle()?;
        sync::write(&self.ports).outputs = outputs;
        Ok(())
    }

    pub fn add_input(&self, channel: &Arc<Channel>) -> Result<()> {
        self.ensure_idle()?;
        sync::write(&self.ports).inputs.push(channel.clone());
        Ok(())
    }

    pub fn add_output(&self, channel: &Arc<Channel>) -> Result<()> {
        self.ensure_idle()?;
        sync::write(&self.ports).outputs.push(channel.clone());
        Ok(())
    }

    pub fn inputs(&self) -> Vec<Arc<Channel>> {
        sync::read(&self.ports).inputs.clone()
    }

    pub fn outputs(&self) -> Vec<Arc<Channel>> {
        sync::read(&self.ports).outputs.clone()
    }

    /// Check the filter can run: a module is loaded and accepts the port counts.
    pub fn validate(&self) -> Result<()> {
        let (inputs, outputs) = {
            let ports = sync::read(&self.ports);
            (ports.inputs.len(), ports.outputs.len())
        };
        let module = sync::lock(&self.module);
        let loaded = module.as_ref().ok_or_else(|| self.no_module_error())?;
        loaded.computation.validate(inputs, outputs)
    }

    pub fn is_ready(&self) -> bool {
        self.validate().is_ok()
    }

    /// Run one computation step.
    ///
    /// All inputs are read before any output is written. Written outputs whose
    /// value changed are recorded in `changes`.
    pub fn evaluate(&self, ctx: &TickContext, changes: &mut ChangeSet) -> Result<()> {
        let ports = sync::read(&self.ports);
        let snapshot: Vec<f64> = ports.inputs.iter().map(|c| c.value()).collect();

        let results = {
            let mut module = sync::lock(&self.module);
            let loaded = module.as_mut().ok_or_else(|| self.compute_error(ctx, "no module loaded"))?;
            loaded
                .computation
                .compute(&snapshot, ctx)
                .map_err(|fault| self.compute_error(ctx, fault.0))?
        };

        if results.len() != ports.outputs.len() {
            return Err(self.compute_error(
                ctx,
                format!(
                    "module produced {} values for {} outputs",
                    results.len(),
                    ports.outputs.len()
                ),
            ));
        }
        for (channel, value) in ports.outputs.iter().zip(results) {
            changes.write(channel, value);
        }
        Ok(())
    }

    /// Clear the module's internal state.
    pub fn reset(&self) {
        if let Some(loaded) = sync::lock(&self.module).as_mut() {
            loaded.computation.reset();
        }
    }

    fn no_module_error(&self) -> QDaqError {
        QDaqError::PluginLoad {
            module: "<none>".to_string(),
            message: format!("filter '{}' has no module loaded", self.full_path()),
        }
    }

    fn compute_error(&self, ctx: &TickContext, message: impl Into<String>) -> QDaqError {
        QDaqError::Compute {
            path: self.full_path(),
            tick: ctx.tick,
            message: message.into(),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports = sync::read(&self.ports);
        f.debug_struct("Filter")
            .field("path", &self.full_path())
            .field("module", &self.module_name())
            .field(
                "inputs",
                &ports.inputs.iter().map(|c| c.full_path()).collect::<Vec<_>>(),
            )
            .field(
                "outputs",
                &ports.outputs.iter().map(|c| c.full_path()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx(tick: u64) -> TickContext {
        TickContext::new(tick, Duration::from_millis(100), Duration::ZERO)
    }

    #[test]
    fn test_unknown_module_fails_at_load() {
        let registry = ComputationRegistry::new();
        let err = Filter::with_module("f", "nope", &registry).unwrap_err();
        assert!(matches!(err, QDaqError::PluginLoad { .. }));
    }

    #[test]
    fn test_validate_without_module() {
        let f = Filter::new("f").unwrap();
        assert!(matches!(f.validate(), Err(QDaqError::PluginLoad { .. })));
        assert!(!f.is_ready());
    }

    #[test]
    fn test_configure_requires_module() {
        let f = Filter::new("f").unwrap();
        assert!(f.configure("kp", 1.0).is_err());
    }

    #[test]
    fn test_evaluate_writes_outputs_in_order() {
        let registry = ComputationRegistry::new();
        let f = Filter::with_module("ip", "interpolator", &registry).unwrap();
        f.configure("points", "0:0, 10:100").unwrap();
        let a = Channel::new("a").unwrap();
        let b = Channel::new("b").unwrap();
        let oa = Channel::new("oa").unwrap();
        let ob = Channel::new("ob").unwrap();
        f.set_inputs(vec![a.clone(), b.clone()]).unwrap();
        f.set_outputs(vec![oa.clone(), ob.clone()]).unwrap();
        f.validate().unwrap();

        a.push(1.0);
        b.push(2.5);
        let mut changes = ChangeSet::new();
        f.evaluate(&ctx(0), &mut changes).unwrap();
        assert_eq!(oa.value(), 10.0);
        assert_eq!(ob.value(), 25.0);
        assert_eq!(changes.len(), 2);
        assert_eq!(f.parameters().len(), 1);
    }

    #[test]
    fn test_deterministic_for_same_snapshot_and_state() {
        let registry = ComputationRegistry::new();
        let f = Filter::with_module("pid", "pid", &registry).unwrap();
        f.configure("kp", 1.5).unwrap();
        f.configure("ki", 0.5).unwrap();
        f.configure("kd", 0.1).unwrap();
        f.configure("setpoint", 1.0).unwrap();
        let y = Channel::new("y").unwrap();
        let u = Channel::new("u").unwrap();
        f.set_inputs(vec![y.clone()]).unwrap();
        f.set_outputs(vec![u.clone()]).unwrap();

        y.push(0.3);
        let mut first = Vec::new();
        for tick in 0..5 {
            f.evaluate(&ctx(tick), &mut ChangeSet::new()).unwrap();
            first.push(u.value());
        }
        f.reset();
        let mut second = Vec::new();
        for tick in 0..5 {
            f.evaluate(&ctx(tick), &mut ChangeSet::new()).unwrap();
            second.push(u.value());
        }
        assert_eq!(first, second);
    }

    #[test]
    fn test_output_count_mismatch_is_compute_error() {
        let registry = ComputationRegistry::new();
        let f = Filter::with_module("sys", "sys", &registry).unwrap();
        f.set_inputs(vec![Channel::new("u").unwrap()]).unwrap();
        let err = f.evaluate(&ctx(7), &mut ChangeSet::new()).unwrap_err();
        match err {
            QDaqError::Compute { tick, path, .. } => {
                assert_eq!(tick, 7);
                assert_eq!(path, "sys");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
