//! Loop engine: the periodic tick thread behind an armed loop.
//!
//! Each armed engine owns one worker thread. Per tick:
//! 1. Wait for the tick deadline (or a stop signal).
//! 2. Step every direct child of the loop in declaration order.
//! 3. After each step, notify observers of the channels that step changed.
//! 4. Advance the deadline by one period; on overrun start the next tick
//!    immediately without catching up.
//!
//! A worker with a tick limit stops by itself after that many ticks and clears
//! the loop's running flag on the way out.
//!
//! The worker never holds a strong reference to its loop, only to a snapshot of
//! the loop's children taken at arm time.

use crate::channel::ChangeSet;
use crate::error::{QDaqError, Result};
use crate::scheduler::context::TickContext;
use crate::scheduler::stats::{EngineStats, EngineStatsSnapshot};
use crate::tree::Node;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Everything a worker needs to run ticks, captured when the loop is armed.
pub(crate) struct TickPlan {
    pub path: String,
    pub children: Vec<Node>,
    pub period: Duration,
    pub delay: Duration,
    /// Stop after this many ticks
    pub limit: Option<u64>,
}

/// A running worker thread and its stop signal.
pub(crate) struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
    path: String,
}

impl Worker {
    fn is_current_thread(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }

    /// Signal the worker and wait for its in-flight tick to finish.
    pub(crate) fn join(self) -> Result<()> {
        if self.is_current_thread() {
            return Err(QDaqError::Engine(format!(
                "loop '{}' cannot be disarmed from its own engine thread",
                self.path
            )));
        }
        let _ = self.stop_tx.send(());
        self.handle
            .join()
            .map_err(|_| QDaqError::Engine(format!("engine thread of '{}' panicked", self.path)))
    }
}

/// Execution context bound to one loop.
pub struct LoopEngine {
    stats: Arc<EngineStats>,
    worker: Option<Worker>,
    // Kept after the worker is taken so a tick that is still finishing can be
    // recognised while its loop waits on the join.
    worker_thread: Option<ThreadId>,
}

impl LoopEngine {
    pub(crate) fn new() -> Self {
        Self {
            stats: Arc::new(EngineStats::default()),
            worker: None,
            worker_thread: None,
        }
    }

    /// True while a worker is ticking; false once it has stopped at its limit.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// True when called from the most recently started worker thread.
    pub(crate) fn on_worker_thread(&self) -> bool {
        self.worker_thread == Some(thread::current().id())
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn shared_stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    /// Spawn the worker. Returns once the worker has fixed its time origin, so
    /// the first tick is never earlier than `delay` after this call returns.
    ///
    /// `running` is cleared by the worker when it exits. A previous worker,
    /// normally one that stopped at its tick limit, is stopped and joined
    /// first.
    pub(crate) fn start(&mut self, plan: TickPlan, running: Arc<AtomicBool>) -> Result<()> {
        if let Some(previous) = self.worker.take() {
            previous.join()?;
        }
        self.stats.reset();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<()>(1);
        let stats = self.stats.clone();
        let path = plan.path.clone();

        let handle = thread::Builder::new()
            .name(format!("qdaq-{}", plan.path))
            .spawn(move || {
                run_worker(plan, stats, stop_rx, ready_tx);
                running.store(false, Ordering::Release);
            })?;

        if ready_rx.recv().is_err() {
            let _ = handle.join();
            return Err(QDaqError::Engine(format!(
                "engine thread of '{}' exited before starting",
                path
            )));
        }

        self.worker_thread = Some(handle.thread().id());
        self.worker = Some(Worker {
            stop_tx,
            handle,
            path,
        });
        Ok(())
    }

    /// Take the worker out so it can be joined without holding the engine.
    ///
    /// Fails when called from the worker thread itself; the worker stays in
    /// place in that case.
    pub(crate) fn take_worker(&mut self) -> Result<Option<Worker>> {
        match &self.worker {
            Some(worker) if worker.is_current_thread() => Err(QDaqError::Engine(format!(
                "loop '{}' cannot be disarmed from its own engine thread",
                worker.path
            ))),
            Some(_) => Ok(self.worker.take()),
            None => Ok(None),
        }
    }
}

impl Drop for LoopEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.is_current_thread() {
                // Dropped from inside a tick; the worker exits on its own once
                // the stop sender is gone.
                return;
            }
            if let Err(e) = worker.join() {
                tracing::warn!("{}", e);
            }
        }
    }
}

impl std::fmt::Debug for LoopEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopEngine")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_worker(
    plan: TickPlan,
    stats: Arc<EngineStats>,
    stop_rx: Receiver<()>,
    ready_tx: Sender<()>,
) {
    let origin = Instant::now();
    let _ = ready_tx.send(());
    tracing::info!(
        "Loop {} engine started (period {:?}, delay {:?}, {} steps)",
        plan.path,
        plan.period,
        plan.delay,
        plan.children.len()
    );

    let mut next = origin + plan.delay;
    let mut tick: u64 = 0;
    loop {
        match stop_rx.recv_deadline(next) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let started = Instant::now();
        let ctx = TickContext::new(tick, plan.period, started - origin);
        run_tick(&plan, &ctx, &stats);
        let finished = Instant::now();
        stats.record_tick(finished - started);
        tick += 1;

        if plan.limit.is_some_and(|limit| tick >= limit) {
            tracing::info!("Loop {} reached its limit of {} ticks", plan.path, tick);
            break;
        }

        next += plan.period;
        if next < finished {
            tracing::warn!(
                "TickOverrunWarning: loop {} tick {} took {:?} (period {:?})",
                plan.path,
                ctx.tick,
                finished - started,
                plan.period
            );
            stats.record_overrun();
            next = finished;
        }
    }

    tracing::info!("Loop {} engine stopped after {} ticks", plan.path, tick);
}

/// Run one tick: step every child in order, isolating failures per step.
pub(crate) fn run_tick(plan: &TickPlan, ctx: &TickContext, stats: &EngineStats) {
    for child in &plan.children {
        let mut changes = ChangeSet::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| step_child(child, ctx, &mut changes)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(path = %child.full_path(), tick = ctx.tick, "{}", e);
                stats.record_error(&e);
            }
            Err(payload) => {
                let path = child.full_path();
                let message = panic_message(payload.as_ref());
                tracing::error!(path = %path, tick = ctx.tick, "step panicked: {}", message);
                stats.record_panic(&path, ctx.tick, &message);
            }
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || changes.notify())) {
            tracing::error!(
                path = %child.full_path(),
                tick = ctx.tick,
                "observer panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}

fn step_child(child: &Node, ctx: &TickContext, changes: &mut ChangeSet) -> Result<()> {
    match child {
        Node::Channel(channel) => {
            channel.evaluate_source(changes);
            Ok(())
        }
        Node::Filter(filter) => filter.evaluate(ctx, changes),
        Node::Job(job) => job.run(ctx, changes),
        // Nested loops tick only under their own engine.
        Node::Loop(_) => Ok(()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, SourceType};
    use crate::filter::{ComputationRegistry, Filter};

    fn plan(children: Vec<Node>) -> TickPlan {
        TickPlan {
            path: "test".into(),
            children,
            period: Duration::from_millis(10),
            delay: Duration::ZERO,
            limit: None,
        }
    }

    #[test]
    fn test_run_tick_isolates_failing_filter() {
        let registry = ComputationRegistry::new();
        // No ports: output count mismatch every tick
        let broken = Filter::with_module("broken", "sys", &registry).unwrap();
        let clock = Channel::with_source("t", SourceType::Clock).unwrap();
        let stats = EngineStats::default();

        let plan = plan(vec![Node::from(&broken), Node::from(&clock)]);
        let ctx = TickContext::new(3, plan.period, Duration::ZERO);
        run_tick(&plan, &ctx, &stats);

        let snap = stats.snapshot();
        assert_eq!(snap.compute_errors, 1);
        assert!(clock.value() > 0.0, "sibling after the failure still ran");
    }

    #[test]
    fn test_start_and_join() {
        let clock = Channel::with_source("t", SourceType::Clock).unwrap();
        let mut engine = LoopEngine::new();
        let running = Arc::new(AtomicBool::new(true));
        engine
            .start(
                TickPlan {
                    path: "test".into(),
                    children: vec![Node::from(&clock)],
                    period: Duration::from_millis(2),
                    delay: Duration::ZERO,
                    limit: None,
                },
                running.clone(),
            )
            .unwrap();
        assert!(engine.is_running());
        assert!(!engine.on_worker_thread());

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.stats().ticks < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let worker = engine.take_worker().unwrap().unwrap();
        worker.join().unwrap();
        assert!(!engine.is_running());
        assert!(!running.load(Ordering::Acquire));

        let ticks = engine.stats().ticks;
        assert!(ticks >= 3);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(engine.stats().ticks, ticks, "no tick after join");
    }

    #[test]
    fn test_worker_stops_at_limit_and_is_reaped_on_restart() {
        let clock = Channel::with_source("t", SourceType::Clock).unwrap();
        let mut engine = LoopEngine::new();
        let running = Arc::new(AtomicBool::new(true));
        let limited = || TickPlan {
            path: "test".into(),
            children: vec![Node::from(&clock)],
            period: Duration::from_millis(1),
            delay: Duration::ZERO,
            limit: Some(3),
        };
        engine.start(limited(), running.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while running.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!running.load(Ordering::Acquire));
        assert_eq!(engine.stats().ticks, 3);
        // Finished but not yet joined
        while engine.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!engine.is_running());

        running.store(true, Ordering::Release);
        engine.start(limited(), running.clone()).unwrap();
        while running.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(engine.stats().ticks, 3, "counter restarts on each start");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
