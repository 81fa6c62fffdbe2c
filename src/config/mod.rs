//! Project configuration for QDaq
//!
//! A project file describes a whole object tree: the root name, engine
//! settings, and nested loop/channel/filter/job declarations. Files ending in
//! `.json` are read as JSON, anything else as TOML.
//!
//! # Example
//!
//! ```toml
//! name = "qdaq"
//!
//! [[children]]
//! kind = "loop"
//! name = "loop"
//! period_ms = 100
//! armed = true
//!
//! [[children.children]]
//! kind = "channel"
//! name = "u"
//! initial = 1.0
//!
//! [[children.children]]
//! kind = "channel"
//! name = "y_avg"
//! averaging = "running"
//! depth = 10
//!
//! [[children.children]]
//! kind = "filter"
//! name = "sys"
//! module = "sys"
//! inputs = ["u"]
//! outputs = ["y"]
//! params = { gain = 2.0, tau = 0.5 }
//! ```
//!
//! Filter port paths are resolved after every node exists: first relative to
//! the filter's own loop, then as absolute paths from the root. Resource paths
//! (`resources`, `script_file`) are relative to the project file's directory.

pub mod settings;
pub mod value;

pub use settings::EngineSettings;
pub use value::ConfigValue;

use crate::channel::{Averaging, Channel, Processing, SourceType, DEFAULT_FORGETTING_FACTOR};
use crate::error::{QDaqError, Result, ResultExt};
use crate::filter::{ComputationRegistry, Filter};
use crate::job::Job;
use crate::scheduler::Loop;
use crate::tree::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Project file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project file format version for future compatibility
    #[serde(default = "default_project_version")]
    pub version: u32,

    /// Name of the root loop; absolute paths start with it
    #[serde(default = "default_root_name")]
    pub name: String,

    #[serde(default)]
    pub settings: EngineSettings,

    /// Children of the root loop
    #[serde(default)]
    pub children: Vec<ChildConfig>,

    /// Directory relative resource paths are resolved against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

fn default_project_version() -> u32 {
    1
}

fn default_root_name() -> String {
    "qdaq".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            version: 1,
            name: default_root_name(),
            settings: EngineSettings::default(),
            children: Vec::new(),
            base_dir: None,
        }
    }
}

/// One declared child node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChildConfig {
    Channel(ChannelConfig),
    Filter(FilterConfig),
    Job(JobConfig),
    Loop(LoopConfig),
}

impl ChildConfig {
    pub fn name(&self) -> &str {
        match self {
            ChildConfig::Channel(c) => &c.name,
            ChildConfig::Filter(c) => &c.name,
            ChildConfig::Job(c) => &c.name,
            ChildConfig::Loop(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Generic,
    Clock,
    Random,
    #[serde(alias = "inc")]
    Increment,
    #[serde(alias = "dec")]
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AveragingKind {
    #[default]
    None,
    Running,
    Delta,
    ForgettingFactor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,

    #[serde(default)]
    pub source: SourceKind,

    /// `[min, max)` for random channels, default `[0, 1)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 2]>,

    /// Value pushed after construction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<f64>,

    /// History capacity override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub averaging: Option<AveragingKind>,

    /// Number of raw values averaged, default 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,

    /// Only used with `averaging = "forgetting_factor"`, default 0.99
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forgetting_factor: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,

    /// `[low, high]` clamp for the processed value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<[f64; 2]>,
}

impl ChannelConfig {
    fn processing(&self) -> Processing {
        let defaults = Processing::default();
        let averaging = match self.averaging.unwrap_or_default() {
            AveragingKind::None => Averaging::None,
            AveragingKind::Running => Averaging::Running,
            AveragingKind::Delta => Averaging::Delta,
            AveragingKind::ForgettingFactor => Averaging::ForgettingFactor(
                self.forgetting_factor.unwrap_or(DEFAULT_FORGETTING_FACTOR),
            ),
        };
        Processing {
            averaging,
            depth: self.depth.unwrap_or(defaults.depth),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            offset: self.offset.unwrap_or(defaults.offset),
            limits: self.limits.map(|[low, high]| (low, high)),
        }
    }

    fn source_type(&self) -> SourceType {
        match self.source {
            SourceKind::Generic => SourceType::Generic,
            SourceKind::Clock => SourceType::Clock,
            SourceKind::Random => {
                let [min, max] = self.range.unwrap_or([0.0, 1.0]);
                SourceType::Random { min, max }
            }
            SourceKind::Increment => SourceType::Increment,
            SourceKind::Decrement => SourceType::Decrement,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,

    /// Registry name of the computation module
    pub module: String,

    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,

    #[serde(default)]
    pub params: BTreeMap<String, ConfigValue>,

    /// File parameters, e.g. `table = "table.dat"`
    #[serde(default)]
    pub resources: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    /// Inline script body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Script file, used when `script` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub name: String,

    /// Tick period; inherited from the nearest ancestor when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,

    #[serde(default)]
    pub delay_ms: u64,

    /// Arm this loop when the project starts
    #[serde(default)]
    pub armed: bool,

    /// Stop by itself after this many ticks per armed run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    #[serde(default)]
    pub children: Vec<ChildConfig>,
}

/// Filter whose ports are wired once the whole tree exists.
struct PendingPorts<'a> {
    filter: Arc<Filter>,
    parent: Arc<Loop>,
    config: &'a FilterConfig,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a project file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            QDaqError::Config(format!("Failed to read project file {:?}: {}", path, e))
        })?;

        let mut project = if is_json(path) {
            serde_json::from_str::<Self>(&content).map_err(|e| {
                QDaqError::Config(format!("Failed to parse project file {:?}: {}", path, e))
            })?
        } else {
            Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse project file {:?}", path))?
        };
        project.base_dir = path.parent().map(Path::to_path_buf);
        tracing::info!("Loaded project '{}' from {:?}", project.name, path);
        Ok(project)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| QDaqError::Config(e.to_string()))
    }

    /// Save the project, as JSON for `.json` paths and TOML otherwise
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = if is_json(path) {
            serde_json::to_string_pretty(self)
                .map_err(|e| QDaqError::Serialization(format!("Failed to serialize project: {}", e)))?
        } else {
            toml::to_string_pretty(self)
                .map_err(|e| QDaqError::Serialization(format!("Failed to serialize project: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            QDaqError::Config(format!("Failed to write project file {:?}: {}", path, e))
        })
    }

    /// Build the object tree. Every declared loop gets an idle engine; none is
    /// armed.
    pub fn build(&self, registry: &ComputationRegistry) -> Result<Arc<Loop>> {
        let root = Loop::root(self.name.clone())?;
        let mut pending = Vec::new();
        self.build_children(&root, &self.children, registry, &mut pending)?;

        for p in pending {
            let path = p.filter.full_path();
            let inputs = self
                .resolve_ports(&root, &p.parent, &p.config.inputs)
                .with_context(|| format!("inputs of filter '{}'", path))?;
            let outputs = self
                .resolve_ports(&root, &p.parent, &p.config.outputs)
                .with_context(|| format!("outputs of filter '{}'", path))?;
            p.filter.set_inputs(inputs)?;
            p.filter.set_outputs(outputs)?;
        }

        tracing::debug!("Built project '{}'", self.name);
        Ok(root)
    }

    /// Absolute paths of loops flagged `armed`, outermost first.
    pub fn armed_paths(&self) -> Vec<String> {
        fn walk(prefix: &str, children: &[ChildConfig], out: &mut Vec<String>) {
            for child in children {
                if let ChildConfig::Loop(l) = child {
                    let path = crate::tree::join(prefix, &l.name);
                    if l.armed {
                        out.push(path.clone());
                    }
                    walk(&path, &l.children, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.name, &self.children, &mut out);
        out
    }

    fn build_children<'a>(
        &self,
        parent: &Arc<Loop>,
        children: &'a [ChildConfig],
        registry: &ComputationRegistry,
        pending: &mut Vec<PendingPorts<'a>>,
    ) -> Result<()> {
        for child in children {
            let node: Node = match child {
                ChildConfig::Channel(c) => self.build_channel(c)?.into(),
                ChildConfig::Filter(c) => {
                    let filter = self.build_filter(c, registry)?;
                    pending.push(PendingPorts {
                        filter: filter.clone(),
                        parent: parent.clone(),
                        config: c,
                    });
                    filter.into()
                }
                ChildConfig::Job(c) => self.build_job(c)?.into(),
                ChildConfig::Loop(c) => {
                    let l = Loop::new(c.name.clone())?;
                    if let Some(period) = c.period_ms {
                        l.set_period_ms(period)?;
                    }
                    l.set_delay_ms(c.delay_ms)?;
                    l.set_limit(c.limit.unwrap_or(0))?;
                    parent.append_child(&l)?;
                    l.create_loop_engine()?;
                    self.build_children(&l, &c.children, registry, pending)?;
                    continue;
                }
            };
            parent.append_child(node)?;
        }
        Ok(())
    }

    fn build_channel(&self, c: &ChannelConfig) -> Result<Arc<Channel>> {
        let channel = Channel::with_source(c.name.clone(), c.source_type())
            .with_context(|| format!("channel '{}'", c.name))?;
        channel.set_history_capacity(c.history.unwrap_or(self.settings.history_capacity));
        channel
            .set_processing(c.processing())
            .with_context(|| format!("channel '{}'", c.name))?;
        if let Some(v) = c.initial {
            channel.push(v);
        }
        Ok(channel)
    }

    fn build_filter(&self, c: &FilterConfig, registry: &ComputationRegistry) -> Result<Arc<Filter>> {
        let filter = Filter::with_module(c.name.clone(), &c.module, registry)?;
        for (key, value) in &c.params {
            filter
                .configure(key, value.clone())
                .with_context(|| format!("filter '{}' parameter '{}'", c.name, key))?;
        }
        for (key, path) in &c.resources {
            let path = self.resolve_file(path);
            filter.configure(key, path.display().to_string())?;
        }
        Ok(filter)
    }

    fn build_job(&self, c: &JobConfig) -> Result<Arc<Job>> {
        let job = Job::new(c.name.clone())?;
        job.set_max_operations(self.settings.script_max_operations)?;
        let source = match (&c.script, &c.script_file) {
            (Some(script), _) => Some(script.clone()),
            (None, Some(file)) => {
                let path = self.resolve_file(file);
                let text = std::fs::read_to_string(&path).map_err(|e| QDaqError::ResourceLoad {
                    resource: path.display().to_string(),
                    message: e.to_string(),
                })?;
                Some(text)
            }
            (None, None) => None,
        };
        if let Some(source) = source {
            job.set_script(&source)?;
        }
        Ok(job)
    }

    fn resolve_file(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn resolve_ports(
        &self,
        root: &Arc<Loop>,
        parent: &Arc<Loop>,
        paths: &[String],
    ) -> Result<Vec<Arc<Channel>>> {
        paths
            .iter()
            .map(|p| {
                let node = parent.find_child(p).or_else(|_| root.resolve(p))?;
                node.as_channel().cloned().ok_or_else(|| {
                    QDaqError::InvalidStructure(format!("'{}' is a {}, not a channel", p, node.kind()))
                })
            })
            .collect()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::LoopState;

    const PROJECT: &str = r#"
name = "qdaq"

[settings]
history_capacity = 50

[[children]]
kind = "loop"
name = "loop"
period_ms = 100
armed = true

[[children.children]]
kind = "channel"
name = "u"
initial = 1

[[children.children]]
kind = "channel"
name = "y"

[[children.children]]
kind = "filter"
name = "sys"
module = "sys"
inputs = ["u"]
outputs = ["qdaq.loop.y"]
params = { gain = 2.0, tau = 0 }

[[children.children]]
kind = "loop"
name = "inner"
delay_ms = 5

[[children.children.children]]
kind = "job"
name = "job"
script = 'set("qdaq.loop.y", 1.0);'
"#;

    #[test]
    fn test_parse_and_build() {
        let project = ProjectConfig::from_toml_str(PROJECT).unwrap();
        assert_eq!(project.settings.history_capacity, 50);
        assert_eq!(project.armed_paths(), vec!["qdaq.loop".to_string()]);

        let root = project.build(&ComputationRegistry::new()).unwrap();
        let u = root.resolve_channel("qdaq.loop.u").unwrap();
        assert_eq!(u.value(), 1.0);
        assert_eq!(u.history_capacity(), 50);

        let sys = root.resolve("qdaq.loop.sys").unwrap();
        let sys = sys.as_filter().unwrap();
        assert_eq!(sys.inputs()[0].full_path(), "qdaq.loop.u");
        assert_eq!(sys.outputs()[0].full_path(), "qdaq.loop.y");
        sys.validate().unwrap();

        let inner = root.resolve("qdaq.loop.inner").unwrap();
        let inner = inner.as_loop().unwrap();
        assert_eq!(inner.state(), LoopState::Idle);
        assert_eq!(inner.delay(), std::time::Duration::from_millis(5));
        assert_eq!(inner.effective_period(), Some(std::time::Duration::from_millis(100)));
    }

    #[test]
    fn test_unknown_port_fails() {
        let project = ProjectConfig::from_toml_str(
            r#"
[[children]]
kind = "filter"
name = "f"
module = "pid"
inputs = ["nope"]
outputs = []
"#,
        )
        .unwrap();
        let err = project.build(&ComputationRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("inputs of filter 'qdaq.f'"));
    }

    #[test]
    fn test_unknown_module_fails() {
        let mut project = ProjectConfig::new("qdaq");
        project.children.push(ChildConfig::Filter(FilterConfig {
            name: "f".into(),
            module: "fft".into(),
            inputs: vec![],
            outputs: vec![],
            params: BTreeMap::new(),
            resources: BTreeMap::new(),
        }));
        assert!(matches!(
            project.build(&ComputationRegistry::new()),
            Err(QDaqError::PluginLoad { .. })
        ));
    }

    #[test]
    fn test_save_and_load_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let project = ProjectConfig::from_toml_str(PROJECT).unwrap();

        for file in ["p.toml", "p.json"] {
            let path = dir.path().join(file);
            project.save(&path).unwrap();
            let loaded = ProjectConfig::load(&path).unwrap();
            assert_eq!(loaded.children, project.children);
            assert_eq!(loaded.base_dir.as_deref(), Some(dir.path()));
        }
    }

    #[test]
    fn test_channel_processing_and_loop_limit() {
        let project = ProjectConfig::from_toml_str(
            r#"
[[children]]
kind = "loop"
name = "loop"
period_ms = 10
limit = 20

[[children.children]]
kind = "channel"
name = "n"
source = "inc"

[[children.children]]
kind = "channel"
name = "v"
averaging = "forgetting_factor"
forgetting_factor = 0.9
depth = 16
multiplier = 1000.0
limits = [0.0, 5000.0]
"#,
        )
        .unwrap();
        let root = project.build(&ComputationRegistry::new()).unwrap();
        let l = root.resolve("qdaq.loop").unwrap();
        assert_eq!(l.as_loop().unwrap().limit(), Some(20));

        let n = root.resolve_channel("qdaq.loop.n").unwrap();
        assert_eq!(n.source_type(), SourceType::Increment);

        let v = root.resolve_channel("qdaq.loop.v").unwrap();
        let p = v.processing();
        assert_eq!(p.averaging, Averaging::ForgettingFactor(0.9));
        assert_eq!(p.depth, 16);
        assert_eq!(p.offset, 0.0);
        v.push(10.0);
        assert_eq!(v.value(), 5000.0);
    }

    #[test]
    fn test_invalid_processing_fails_build() {
        let project = ProjectConfig::from_toml_str(
            r#"
[[children]]
kind = "channel"
name = "v"
depth = 0
"#,
        )
        .unwrap();
        let err = project.build(&ComputationRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("channel 'v'"), "{}", err);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ProjectConfig::load("/nonexistent/qdaq.toml"),
            Err(QDaqError::Config(_))
        ));
    }
}
