//! Job node: a scripted computation stage.
//!
//! Unlike a filter, a job has no declared ports. Its script reads and writes
//! any channel of the tree by absolute path (see [`crate::scripting`]).

use crate::channel::ChangeSet;
use crate::error::{QDaqError, Result};
use crate::scheduler::TickContext;
use crate::scripting::ScriptEngine;
use crate::sync;
use crate::tree::NodeCore;
use rhai::AST;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

#[derive(Default)]
struct JobScript {
    source: String,
    ast: Option<AST>,
}

/// A named Rhai script run once per tick.
pub struct Job {
    core: NodeCore,
    script: Mutex<JobScript>,
    engine: Mutex<ScriptEngine>,
}

impl Job {
    /// Create a job with an empty body.
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            core: NodeCore::new(name)?,
            script: Mutex::new(JobScript::default()),
            engine: Mutex::new(ScriptEngine::new()),
        }))
    }

    pub fn with_script(name: impl Into<String>, source: &str) -> Result<Arc<Self>> {
        let job = Self::new(name)?;
        job.set_script(source)?;
        Ok(job)
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

    /// Replace the script body. On a compile error the previous body stays.
    pub fn set_script(&self, source: &str) -> Result<()> {
        if self.core.owner_running() {
            return Err(QDaqError::ConfigurationWhileRunning(self.full_path()));
        }
        let ast = sync::lock(&self.engine)
            .compile(source)
            .map_err(|e| QDaqError::ScriptCompile {
                path: self.full_path(),
                message: e.to_string(),
            })?;
        tracing::debug!("Compiled job {} ({} bytes)", self.full_path(), source.len());
        *sync::lock(&self.script) = JobScript {
            source: source.to_string(),
            ast: Some(ast),
        };
        Ok(())
    }

    pub fn script(&self) -> String {
        sync::lock(&self.script).source.clone()
    }

    /// Per-run operation budget for runaway scripts.
    pub fn set_max_operations(&self, max_operations: u64) -> Result<()> {
        if self.core.owner_running() {
            return Err(QDaqError::ConfigurationWhileRunning(self.full_path()));
        }
        sync::lock(&self.engine).set_max_operations(max_operations);
        Ok(())
    }

    pub fn max_operations(&self) -> u64 {
        sync::lock(&self.engine).max_operations()
    }

    /// Run the script once. Channel writes are recorded in `changes`.
    pub fn run(&self, ctx: &TickContext, changes: &mut ChangeSet) -> Result<()> {
        let script = sync::lock(&self.script);
        let Some(ast) = script.ast.as_ref() else {
            return Ok(());
        };
        let root = self
            .core
            .root()
            .map(|r| Arc::downgrade(&r))
            .unwrap_or_else(Weak::new);
        sync::lock(&self.engine)
            .execute(ast, root, ctx, changes)
            .map_err(|message| QDaqError::Script {
                path: self.full_path(),
                tick: ctx.tick,
                message,
            })
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("path", &self.full_path())
            .field("script", &self.script())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::scheduler::Loop;
    use std::time::Duration;

    fn ctx(tick: u64) -> TickContext {
        TickContext::new(tick, Duration::from_millis(100), Duration::ZERO)
    }

    #[test]
    fn test_compile_error_keeps_previous_script() {
        let job = Job::with_script("job", "let x = 1;").unwrap();
        let err = job.set_script("let = ;").unwrap_err();
        assert!(matches!(err, QDaqError::ScriptCompile { .. }));
        assert_eq!(job.script(), "let x = 1;");
    }

    #[test]
    fn test_empty_job_is_noop() {
        let job = Job::new("job").unwrap();
        job.run(&ctx(0), &mut ChangeSet::new()).unwrap();
    }

    #[test]
    fn test_runtime_error_names_path_and_tick() {
        let root = Loop::root("qdaq").unwrap();
        let job = Job::with_script("job", r#"get("qdaq.missing")"#).unwrap();
        root.append_child(&job).unwrap();
        match job.run(&ctx(12), &mut ChangeSet::new()).unwrap_err() {
            QDaqError::Script { path, tick, .. } => {
                assert_eq!(path, "qdaq.job");
                assert_eq!(tick, 12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_locals_do_not_persist_between_runs() {
        let root = Loop::root("qdaq").unwrap();
        let out = Channel::new("out").unwrap();
        root.append_child(&out).unwrap();
        let job = Job::with_script(
            "job",
            r#"
let n = if exists("qdaq.out") { 1.0 } else { 0.0 };
set("qdaq.out", get("qdaq.out") + n);
"#,
        )
        .unwrap();
        root.append_child(&job).unwrap();
        for tick in 0..3 {
            job.run(&ctx(tick), &mut ChangeSet::new()).unwrap();
        }
        assert_eq!(out.value(), 3.0);
    }
}
