//! # QDaq-RS: real-time data acquisition and control
//!
//! An object tree of typed data channels, pluggable computation stages and
//! scripted jobs, ticked on a fixed period by one engine per loop.
//!
//! ## Architecture
//!
//! - **Tree**: loops own channels, filters, jobs and nested loops; nodes are
//!   addressed by dotted paths from the root (`qdaq.loop.t`)
//! - **Channels**: timestamped values; the only state shared between engines
//! - **Filters**: deterministic computation modules (PID, process model, table
//!   interpolation) loaded by name from a registry
//! - **Jobs**: Rhai scripts with read/write access to any channel by path
//! - **Scheduler**: each armed loop ticks its children in order on its own thread
//! - **Binding**: observers and named callbacks for an external UI
//!
//! ## Example
//!
//! ```no_run
//! use qdaq::{Channel, ComputationRegistry, Filter, Loop, SourceType};
//!
//! fn main() -> qdaq::Result<()> {
//!     let registry = ComputationRegistry::new();
//!     let root = Loop::root("qdaq")?;
//!     let l = Loop::with_period_ms("loop", 100)?;
//!     root.append_child(&l)?;
//!
//!     let u = Channel::new("u")?;
//!     let y = Channel::new("y")?;
//!     let sys = Filter::with_module("sys", "sys", &registry)?;
//!     sys.set_inputs(vec![u.clone()])?;
//!     sys.set_outputs(vec![y.clone()])?;
//!     l.append_child(&u)?;
//!     l.append_child(&sys)?;
//!     l.append_child(&y)?;
//!
//!     let t = Channel::with_source("t", SourceType::Clock)?;
//!     l.append_child(&t)?;
//!
//!     u.push(1.0);
//!     l.create_loop_engine()?;
//!     l.arm()?;
//!     std::thread::sleep(std::time::Duration::from_millis(500));
//!     l.disarm()?;
//!     println!("y = {}", y.value());
//!     Ok(())
//! }
//! ```

pub mod binding;
pub mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod job;
pub mod scheduler;
pub mod scripting;
mod sync;
pub mod tree;

// Re-export commonly used types
pub use binding::{bind, toggle_handler, Binding, CallbackRegistry, UiBridge, UiMessage};
pub use channel::{Averaging, ChangeSet, Channel, ChannelObserver, Processing, Sample, SourceType};
pub use config::{ConfigValue, EngineSettings, ProjectConfig};
pub use error::{QDaqError, Result};
pub use filter::{Computation, ComputationRegistry, ComputeFault, Filter};
pub use job::Job;
pub use scheduler::{EngineStatsSnapshot, Loop, LoopState, TickContext};
pub use tree::{Node, NodeKind};
