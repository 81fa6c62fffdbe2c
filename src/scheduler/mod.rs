//! Loops and the engines that tick them.
//!
//! Every armed [`Loop`] runs on its own engine thread. Loops tick concurrently
//! with each other; inside one tick the loop's children run strictly in
//! declaration order.
//!
//! Channels are the only state shared between engines, so a job reading a
//! channel owned by another loop sees that loop's latest completed write, not
//! a value synchronized with its own tick.

mod context;
mod daq_loop;
mod executor;
mod stats;

pub use context::TickContext;
pub use daq_loop::{Loop, LoopState};
pub use executor::LoopEngine;
pub use stats::EngineStatsSnapshot;
