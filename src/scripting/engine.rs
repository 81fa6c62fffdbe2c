use crate::channel::ChangeSet;
use crate::scheduler::{Loop, TickContext};
use crate::sync;
use rhai::{Dynamic, Engine, EvalAltResult, ParseError, Scope, AST};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Default per-run operation budget.
pub const DEFAULT_MAX_OPERATIONS: u64 = 100_000;

/// State visible to the registered tree functions during one run.
///
/// Updated before each execution and cleared afterwards; the registered
/// closures read it through [`SharedScriptContext`].
pub struct ScriptContext {
    root: Weak<Loop>,
    tick: TickContext,
    changes: ChangeSet,
}

impl Default for ScriptContext {
    fn default() -> Self {
        Self {
            root: Weak::new(),
            tick: TickContext::new(0, Duration::ZERO, Duration::ZERO),
            changes: ChangeSet::new(),
        }
    }
}

impl ScriptContext {
    fn root(&self) -> Result<Arc<Loop>, Box<EvalAltResult>> {
        self.root
            .upgrade()
            .ok_or_else(|| "job is not attached to a tree".into())
    }
}

/// Thread-safe shared script context
pub type SharedScriptContext = Arc<Mutex<ScriptContext>>;

/// Rhai engine configured for jobs.
pub struct ScriptEngine {
    engine: Engine,
    context: SharedScriptContext,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::with_max_operations(DEFAULT_MAX_OPERATIONS)
    }

    pub fn with_max_operations(max_operations: u64) -> Self {
        let context = Arc::new(Mutex::new(ScriptContext::default()));
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, context.clone());
        engine.set_max_operations(max_operations);
        Self { engine, context }
    }

    /// Change the per-run operation budget (0 = unlimited).
    pub fn set_max_operations(&mut self, max_operations: u64) {
        self.engine.set_max_operations(max_operations);
    }

    pub fn max_operations(&self) -> u64 {
        self.engine.max_operations()
    }

    /// Configure the Rhai engine with tree access, helpers and safety limits
    fn configure_engine(engine: &mut Engine, context: SharedScriptContext) {
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(1_000);

        engine.on_print(|text| tracing::info!("[job] {}", text));
        engine.on_debug(|text, source, pos| {
            tracing::debug!("[job {}] {} {}", source.unwrap_or("script"), pos, text)
        });

        // ===== Tree access =====

        {
            let ctx = context.clone();
            engine.register_fn(
                "get",
                move |path: &str| -> Result<f64, Box<EvalAltResult>> {
                    let root = sync::lock(&ctx).root()?;
                    root.resolve_channel(path)
                        .map(|ch| ch.value())
                        .map_err(|e| e.to_string().into())
                },
            );
        }
        {
            let ctx = context.clone();
            engine.register_fn(
                "set",
                move |path: &str, value: f64| -> Result<(), Box<EvalAltResult>> {
                    write_channel(&ctx, path, value)
                },
            );
        }
        {
            let ctx = context.clone();
            engine.register_fn(
                "set",
                move |path: &str, value: i64| -> Result<(), Box<EvalAltResult>> {
                    write_channel(&ctx, path, value as f64)
                },
            );
        }
        {
            let ctx = context.clone();
            engine.register_fn("exists", move |path: &str| -> bool {
                sync::lock(&ctx)
                    .root()
                    .is_ok_and(|root| root.resolve_channel(path).is_ok())
            });
        }

        // Tick information, also usable from inside script functions where the
        // scope variables are not visible.
        {
            let ctx = context.clone();
            engine.register_fn("time", move || -> f64 { sync::lock(&ctx).tick.time_secs() });
        }
        {
            let ctx = context.clone();
            engine.register_fn("dt", move || -> f64 { sync::lock(&ctx).tick.dt_secs() });
        }
        {
            let ctx = context;
            engine.register_fn("tick", move || -> i64 { sync::lock(&ctx).tick.tick as i64 });
        }

        // ===== Mathematical Functions =====

        engine.register_fn("abs", |x: f64| x.abs());
        engine.register_fn("sqrt", |x: f64| x.sqrt());
        engine.register_fn("sqrt", |x: i64| (x as f64).sqrt());
        engine.register_fn("pow", |x: f64, y: f64| x.powf(y));
        engine.register_fn("exp", |x: f64| x.exp());
        engine.register_fn("ln", |x: f64| x.ln());
        engine.register_fn("log10", |x: f64| x.log10());
        engine.register_fn("sin", |x: f64| x.sin());
        engine.register_fn("cos", |x: f64| x.cos());
        engine.register_fn("tan", |x: f64| x.tan());
        engine.register_fn("atan2", |y: f64, x: f64| y.atan2(x));

        engine.register_fn("floor", |x: f64| x.floor());
        engine.register_fn("ceil", |x: f64| x.ceil());
        engine.register_fn("round", |x: f64| x.round());

        engine.register_fn("clamp", |x: f64, min: f64, max: f64| x.clamp(min, max));
        engine.register_fn("min", |a: f64, b: f64| a.min(b));
        engine.register_fn("max", |a: f64, b: f64| a.max(b));

        engine.register_fn("pi", || std::f64::consts::PI);
        engine.register_fn("is_nan", |x: f64| x.is_nan());
        engine.register_fn("is_finite", |x: f64| x.is_finite());

        engine.register_fn("lerp", |a: f64, b: f64, t: f64| a + (b - a) * t);
        engine.register_fn(
            "map_range",
            |x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64| {
                (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
            },
        );
        engine.register_fn("deadband", |value: f64, center: f64, width: f64| -> f64 {
            if (value - center).abs() < width / 2.0 {
                center
            } else {
                value
            }
        });
    }

    /// Compile a job body.
    pub fn compile(&self, source: &str) -> Result<AST, ParseError> {
        self.engine.compile(source)
    }

    /// Run a compiled job body against the tree rooted at `root`.
    ///
    /// Every channel written by the script is recorded in `changes`, including
    /// writes made before a runtime error.
    pub fn execute(
        &self,
        ast: &AST,
        root: Weak<Loop>,
        tick: &TickContext,
        changes: &mut ChangeSet,
    ) -> Result<(), String> {
        {
            let mut context = sync::lock(&self.context);
            context.root = root;
            context.tick = *tick;
            context.changes = ChangeSet::new();
        }

        let mut scope = Scope::new();
        scope.push("tick", tick.tick as i64);
        scope.push("time", tick.time_secs());
        scope.push("dt", tick.dt_secs());

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, ast)
            .map(|_| ())
            .map_err(|e| e.to_string());

        let written = {
            let mut context = sync::lock(&self.context);
            context.root = Weak::new();
            std::mem::take(&mut context.changes)
        };
        written.merge_into(changes);
        result
    }

    /// Get a reference to the underlying Rhai engine
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get a reference to the shared context
    pub fn context(&self) -> &SharedScriptContext {
        &self.context
    }
}

fn write_channel(
    ctx: &SharedScriptContext,
    path: &str,
    value: f64,
) -> Result<(), Box<EvalAltResult>> {
    let mut context = sync::lock(ctx);
    let root = context.root()?;
    let channel = root
        .resolve_channel(path)
        .map_err(|e| -> Box<EvalAltResult> { e.to_string().into() })?;
    context.changes.write(&channel, value);
    Ok(())
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("max_operations", &self.max_operations())
            .finish()
    }
}
