//! Loop: the composite scheduling node.
//!
//! A loop owns an ordered list of children (channels, filters, jobs and nested
//! loops) and, once [`Loop::create_loop_engine`] has been called, an engine that
//! ticks those children periodically while the loop is armed.
//!
//! ```text
//!            create_loop_engine()        arm()
//!  Unbound ─────────────────────► Idle ─────────► Running
//!                                  ▲                 │
//!                                  └──── disarm() ───┘
//! ```
//!
//! `arm`, `disarm` and `step` are serialized per loop: a call waits for any
//! lifecycle transition already in progress, including the join of a worker
//! that is finishing its last tick. A loop with a tick limit returns to idle by
//! itself once the limit is reached.
//!
//! Nesting is an ownership and addressing relationship only. Arming a parent
//! never arms or paces a child loop, and disarming a parent leaves running
//! children running.

use crate::channel::Channel;
use crate::error::{QDaqError, Result};
use crate::scheduler::context::TickContext;
use crate::scheduler::executor::{self, LoopEngine, TickPlan};
use crate::scheduler::stats::EngineStatsSnapshot;
use crate::sync;
use crate::tree::{path, Node, NodeCore};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Lifecycle state of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No engine created yet
    Unbound,
    /// Engine exists, not ticking
    Idle,
    /// Engine ticking
    Running,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Unbound => "unbound",
            LoopState::Idle => "idle",
            LoopState::Running => "running",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LoopTiming {
    period: Option<Duration>,
    delay: Duration,
    limit: Option<u64>,
}

/// A composite node with an optional periodic engine.
pub struct Loop {
    core: NodeCore,
    self_ref: Weak<Loop>,
    children: RwLock<Vec<Node>>,
    timing: Mutex<LoopTiming>,
    engine: Mutex<Option<LoopEngine>>,
    lifecycle: Mutex<()>,
    running: Arc<AtomicBool>,
    step_thread: Mutex<Option<ThreadId>>,
}

impl Loop {
    /// Create a detached loop with no period.
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        let core = NodeCore::new(name)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            core,
            self_ref: self_ref.clone(),
            children: RwLock::new(Vec::new()),
            timing: Mutex::new(LoopTiming::default()),
            engine: Mutex::new(None),
            lifecycle: Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            step_thread: Mutex::new(None),
        }))
    }

    /// Create the root of a tree. Absolute paths start with its name.
    pub fn root(name: impl Into<String>) -> Result<Arc<Self>> {
        Self::new(name)
    }

    /// Create a detached loop with the given period in milliseconds.
    pub fn with_period_ms(name: impl Into<String>, period_ms: u64) -> Result<Arc<Self>> {
        let l = Self::new(name)?;
        l.set_period_ms(period_ms)?;
        Ok(l)
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

    pub fn parent(&self) -> Option<Arc<Loop>> {
        self.core.parent()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LoopState {
        if self.is_running() {
            return LoopState::Running;
        }
        match sync::lock(&self.engine).as_ref() {
            Some(_) => LoopState::Idle,
            None => LoopState::Unbound,
        }
    }

    // ── Timing ──

    pub fn period(&self) -> Option<Duration> {
        sync::lock(&self.timing).period
    }

    /// Period used when arming: this loop's own period, or else the period of
    /// the nearest ancestor that has one.
    pub fn effective_period(&self) -> Option<Duration> {
        if let Some(period) = self.period() {
            return Some(period);
        }
        let mut current = self.parent();
        while let Some(l) = current {
            if let Some(period) = l.period() {
                return Some(period);
            }
            current = l.parent();
        }
        None
    }

    pub fn set_period(&self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(QDaqError::Config(format!(
                "period of loop '{}' must be > 0",
                self.full_path()
            )));
        }
        self.ensure_idle()?;
        sync::lock(&self.timing).period = Some(period);
        Ok(())
    }

    pub fn set_period_ms(&self, period_ms: u64) -> Result<()> {
        self.set_period(Duration::from_millis(period_ms))
    }

    /// Unset the period so it is inherited again.
    pub fn clear_period(&self) -> Result<()> {
        self.ensure_idle()?;
        sync::lock(&self.timing).period = None;
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        sync::lock(&self.timing).delay
    }

    pub fn set_delay(&self, delay: Duration) -> Result<()> {
        self.ensure_idle()?;
        sync::lock(&self.timing).delay = delay;
        Ok(())
    }

    pub fn set_delay_ms(&self, delay_ms: u64) -> Result<()> {
        self.set_delay(Duration::from_millis(delay_ms))
    }

    /// Tick limit applied from the next `arm`; `None` ticks until disarmed.
    pub fn limit(&self) -> Option<u64> {
        sync::lock(&self.timing).limit
    }

    /// Stop by itself after `limit` ticks of each armed run. Zero removes the
    /// limit. Ticks run by [`Loop::step`] do not count against it.
    pub fn set_limit(&self, limit: u64) -> Result<()> {
        self.ensure_idle()?;
        sync::lock(&self.timing).limit = (limit > 0).then_some(limit);
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_running() {
            return Err(QDaqError::ConfigurationWhileRunning(self.full_path()));
        }
        Ok(())
    }

    // ── Tree ──

    /// Children in declaration order.
    pub fn children(&self) -> Vec<Node> {
        sync::read(&self.children).clone()
    }

    pub fn child_count(&self) -> usize {
        sync::read(&self.children).len()
    }

    /// Direct child by name.
    pub fn child(&self, name: &str) -> Option<Node> {
        sync::read(&self.children)
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Append `child` at the end of this loop's children.
    ///
    /// A child attached elsewhere is moved: both child lists are updated under
    /// their locks, so the node is never listed under two parents or none.
    pub fn append_child(&self, child: impl Into<Node>) -> Result<()> {
        let child = child.into();
        let this = self.self_arc()?;

        if let Node::Loop(l) = &child {
            if Arc::ptr_eq(l, &this) || self.has_ancestor(l) {
                return Err(QDaqError::InvalidStructure(format!(
                    "cannot append loop '{}' under itself",
                    l.full_path()
                )));
            }
        }

        match child.parent() {
            Some(old) if Arc::ptr_eq(&old, &this) => Ok(()),
            Some(old) => {
                let (mut mine, mut theirs) = lock_pair(&this, &old);
                self.check_structural(&this)?;
                old.check_structural(&old)?;
                self.check_unique(&mine, child.name())?;
                theirs.retain(|c| !c.same_as(&child));
                mine.push(child.clone());
                child.core().set_parent(self.self_ref.clone());
                tracing::debug!(
                    "Moved {} '{}' from '{}' to '{}'",
                    child.kind(),
                    child.name(),
                    old.full_path(),
                    self.full_path()
                );
                Ok(())
            }
            None => {
                let mut mine = sync::write(&self.children);
                self.check_structural(&this)?;
                self.check_unique(&mine, child.name())?;
                mine.push(child.clone());
                child.core().set_parent(self.self_ref.clone());
                Ok(())
            }
        }
    }

    /// Detach and return the child called `name`.
    pub fn remove_child(&self, name: &str) -> Result<Node> {
        let this = self.self_arc()?;
        let mut children = sync::write(&self.children);
        self.check_structural(&this)?;
        let index = children
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| QDaqError::not_found(path::join(&self.full_path(), name), name))?;
        let child = children.remove(index);
        child.core().set_parent(Weak::new());
        Ok(child)
    }

    /// Resolve a dotted path relative to this loop, e.g. `loop.u`.
    pub fn find_child(&self, path: &str) -> Result<Node> {
        let segments = path::segments(path)?;
        self.walk(path, &segments)
    }

    /// Resolve an absolute path such as `qdaq.loop.t`, starting from this
    /// loop's root. The first segment must be the root's name.
    pub fn resolve(&self, path: &str) -> Result<Node> {
        let root = self.root_loop()?;
        let segments = path::segments(path)?;
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| QDaqError::not_found(path, ""))?;
        if *first != root.name() {
            return Err(QDaqError::not_found(path, *first));
        }
        if rest.is_empty() {
            return Ok(Node::Loop(root));
        }
        root.walk(path, rest)
    }

    /// Resolve an absolute path that must name a channel.
    pub fn resolve_channel(&self, path: &str) -> Result<Arc<Channel>> {
        let node = self.resolve(path)?;
        node.as_channel().cloned().ok_or_else(|| {
            QDaqError::InvalidStructure(format!("'{}' is a {}, not a channel", path, node.kind()))
        })
    }

    /// The topmost loop of this tree (this loop itself when detached).
    pub fn root_loop(&self) -> Result<Arc<Loop>> {
        match self.core.root() {
            Some(root) => Ok(root),
            None => self.self_arc(),
        }
    }

    fn walk(&self, full: &str, segments: &[&str]) -> Result<Node> {
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| QDaqError::not_found(full, ""))?;
        let node = self
            .child(first)
            .ok_or_else(|| QDaqError::not_found(full, *first))?;
        if rest.is_empty() {
            return Ok(node);
        }
        match &node {
            Node::Loop(l) => l.walk(full, rest),
            _ => Err(QDaqError::not_found(full, rest[0])),
        }
    }

    fn self_arc(&self) -> Result<Arc<Loop>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| QDaqError::Engine(format!("loop '{}' is being dropped", self.name())))
    }

    fn has_ancestor(&self, candidate: &Arc<Loop>) -> bool {
        let mut current = self.parent();
        while let Some(l) = current {
            if Arc::ptr_eq(&l, candidate) {
                return true;
            }
            current = l.parent();
        }
        false
    }

    fn check_structural(&self, this: &Arc<Loop>) -> Result<()> {
        if this.is_running() {
            return Err(QDaqError::StructuralChangeWhileRunning(self.full_path()));
        }
        Ok(())
    }

    fn check_unique(&self, children: &[Node], name: &str) -> Result<()> {
        if children.iter().any(|c| c.name() == name) {
            return Err(QDaqError::DuplicateName {
                parent: self.full_path(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    // ── Engine lifecycle ──

    /// Bind an idle engine to this loop.
    pub fn create_loop_engine(&self) -> Result<()> {
        let mut engine = sync::lock(&self.engine);
        if engine.is_some() {
            return Err(QDaqError::AlreadyBound(self.full_path()));
        }
        *engine = Some(LoopEngine::new());
        tracing::debug!("Created engine for loop {}", self.full_path());
        Ok(())
    }

    pub fn has_engine(&self) -> bool {
        sync::lock(&self.engine).is_some()
    }

    /// Start periodic ticking. No-op when already running.
    ///
    /// Every direct child filter is validated first; the first failure is
    /// returned and the loop stays idle. Direct child channels start a fresh
    /// average. The first tick happens `delay` after this call returns, then
    /// every period.
    pub fn arm(&self) -> Result<()> {
        if self.in_own_tick() {
            if self.is_running() {
                return Ok(());
            }
            return Err(QDaqError::Engine(format!(
                "loop '{}' cannot be armed from inside its own step",
                self.full_path()
            )));
        }
        let _lifecycle = sync::lock(&self.lifecycle);
        let mut guard = sync::lock(&self.engine);
        let engine = guard.as_mut().ok_or_else(|| {
            QDaqError::NotConfigured(format!("loop '{}' has no engine", self.full_path()))
        })?;
        if self.is_running() {
            return Ok(());
        }
        let period = self.effective_period().ok_or_else(|| {
            QDaqError::NotConfigured(format!("loop '{}' has no period", self.full_path()))
        })?;
        let LoopTiming { delay, limit, .. } = *sync::lock(&self.timing);
        let path = self.full_path();

        let children = {
            let children = sync::read(&self.children);
            // Set before validating so configuration changes racing with arm
            // are rejected rather than missed.
            self.running.store(true, Ordering::Release);
            if let Err(e) = validate_children(&children) {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
            for channel in children.iter().filter_map(Node::as_channel) {
                channel.reset_averaging();
            }
            children
                .iter()
                .filter(|c| !matches!(c, Node::Loop(_)))
                .cloned()
                .collect()
        };

        let plan = TickPlan {
            path: path.clone(),
            children,
            period,
            delay,
            limit,
        };
        if let Err(e) = engine.start(plan, self.running.clone()) {
            self.running.store(false, Ordering::Release);
            return Err(e);
        }
        match limit {
            Some(limit) => tracing::info!(
                "Armed loop {} (period {:?}, delay {:?}, limit {} ticks)",
                path,
                period,
                delay,
                limit
            ),
            None => tracing::info!("Armed loop {} (period {:?}, delay {:?})", path, period, delay),
        }
        Ok(())
    }

    /// Stop ticking and wait for the in-flight tick to complete. No-op when
    /// not running.
    ///
    /// Fails when called from this loop's own engine thread, since the join
    /// would wait on the caller.
    pub fn disarm(&self) -> Result<()> {
        if self.in_own_tick() {
            if !self.is_running() {
                return Ok(());
            }
            return Err(QDaqError::Engine(format!(
                "loop '{}' cannot be disarmed from its own engine thread",
                self.full_path()
            )));
        }
        let _lifecycle = sync::lock(&self.lifecycle);
        let worker = match sync::lock(&self.engine).as_mut() {
            Some(engine) => engine.take_worker()?,
            None => None,
        };
        let Some(worker) = worker else {
            return Ok(());
        };
        let joined = worker.join();
        self.running.store(false, Ordering::Release);
        joined?;
        tracing::info!("Disarmed loop {}", self.full_path());
        Ok(())
    }

    /// Run exactly one tick on the calling thread. The loop must be idle.
    ///
    /// Returns the index of the tick that ran. Ticks from `step` count towards
    /// [`Loop::stats`] like engine ticks.
    pub fn step(&self) -> Result<u64> {
        if self.in_own_tick() {
            return Err(QDaqError::Engine(format!(
                "loop '{}' cannot be stepped from inside its own tick",
                self.full_path()
            )));
        }
        let _lifecycle = sync::lock(&self.lifecycle);
        let stats = {
            let guard = sync::lock(&self.engine);
            let engine = guard.as_ref().ok_or_else(|| {
                QDaqError::NotConfigured(format!("loop '{}' has no engine", self.full_path()))
            })?;
            if self.is_running() {
                return Err(QDaqError::Engine(format!(
                    "loop '{}' is armed; step requires an idle loop",
                    self.full_path()
                )));
            }
            engine.shared_stats()
        };
        let period = self.effective_period().ok_or_else(|| {
            QDaqError::NotConfigured(format!("loop '{}' has no period", self.full_path()))
        })?;
        let children: Vec<Node> = {
            let children = sync::read(&self.children);
            validate_children(&children)?;
            children
                .iter()
                .filter(|c| !matches!(c, Node::Loop(_)))
                .cloned()
                .collect()
        };

        let tick = stats.ticks();
        let plan = TickPlan {
            path: self.full_path(),
            children,
            period,
            delay: self.delay(),
            limit: None,
        };
        let ctx = TickContext::new(tick, period, period * tick as u32);
        let started = Instant::now();
        *sync::lock(&self.step_thread) = Some(thread::current().id());
        executor::run_tick(&plan, &ctx, &stats);
        *sync::lock(&self.step_thread) = None;
        stats.record_tick(started.elapsed());
        Ok(tick)
    }

    /// True on a thread currently running one of this loop's ticks, either its
    /// engine worker or a caller inside [`Loop::step`]. Lifecycle calls made
    /// from there must not wait on the lifecycle lock.
    fn in_own_tick(&self) -> bool {
        let current = thread::current().id();
        if *sync::lock(&self.step_thread) == Some(current) {
            return true;
        }
        sync::lock(&self.engine)
            .as_ref()
            .is_some_and(LoopEngine::on_worker_thread)
    }

    /// Engine counters, or `None` when no engine exists.
    pub fn stats(&self) -> Option<EngineStatsSnapshot> {
        sync::lock(&self.engine).as_ref().map(LoopEngine::stats)
    }

    /// Ticks completed since the loop was last armed.
    pub fn tick_count(&self) -> u64 {
        self.stats().map(|s| s.ticks).unwrap_or(0)
    }

    // ── Inspection ──

    /// Indented listing of this subtree.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, 0);
        out
    }

    fn describe_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let period = match (self.period(), self.effective_period()) {
            (Some(p), _) => format!("{} ms", p.as_millis()),
            (None, Some(p)) => format!("{} ms inherited", p.as_millis()),
            (None, None) => "none".to_string(),
        };
        let _ = writeln!(
            out,
            "{}{} [loop, {}, period {}, delay {} ms]",
            indent,
            self.name(),
            self.state(),
            period,
            self.delay().as_millis()
        );

        let child_indent = "  ".repeat(depth + 1);
        for child in self.children() {
            match &child {
                Node::Loop(l) => l.describe_into(out, depth + 1),
                Node::Channel(c) => {
                    let _ = writeln!(
                        out,
                        "{}{} [channel, {:?}] = {}",
                        child_indent,
                        c.name(),
                        c.source_type(),
                        c.value()
                    );
                }
                Node::Filter(f) => {
                    let names = |chs: Vec<Arc<Channel>>| {
                        chs.iter()
                            .map(|c| c.name().to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    };
                    let _ = writeln!(
                        out,
                        "{}{} [filter, {}] ({}) -> ({})",
                        child_indent,
                        f.name(),
                        f.module_name().unwrap_or_else(|| "no module".to_string()),
                        names(f.inputs()),
                        names(f.outputs())
                    );
                }
                Node::Job(j) => {
                    let _ = writeln!(
                        out,
                        "{}{} [job, {} lines]",
                        child_indent,
                        j.name(),
                        j.script().lines().count()
                    );
                }
            }
        }
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("path", &self.full_path())
            .field("state", &self.state())
            .field("period", &self.period())
            .field("delay", &self.delay())
            .field("children", &self.child_count())
            .finish()
    }
}

fn validate_children(children: &[Node]) -> Result<()> {
    for child in children {
        if let Node::Filter(f) = child {
            f.validate()?;
        }
    }
    Ok(())
}

/// Write-lock two distinct loops' child lists in address order.
fn lock_pair<'a>(
    mine: &'a Arc<Loop>,
    theirs: &'a Arc<Loop>,
) -> (RwLockWriteGuard<'a, Vec<Node>>, RwLockWriteGuard<'a, Vec<Node>>) {
    if Arc::as_ptr(mine) < Arc::as_ptr(theirs) {
        let a = sync::write(&mine.children);
        let b = sync::write(&theirs.children);
        (a, b)
    } else {
        let b = sync::write(&theirs.children);
        let a = sync::write(&mine.children);
        (a, b)
    }
}
