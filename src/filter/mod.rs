//! Filters and the computation modules behind them.
//!
//! A [`Filter`] is a tree node with ordered input and output channels. Its
//! arithmetic is delegated to a [`Computation`] loaded by name through a
//! [`ComputationRegistry`] when the tree is configured, not by dynamic symbol
//! lookup.
//!
//! # Architecture
//!
//! ```text
//! [u] ──► Filter "sys" (process_model) ──► [y]
//! [y] ──► Filter "pid" (pid)           ──► [u]
//! [y] ──► Filter "ip"  (interpolator)  ──► [y1]
//! ```

pub mod computation;
pub mod interpolator;
pub mod node;
pub mod pid;
pub mod process_model;
pub mod registry;

pub use computation::{AnyComputation, BuiltinComputation, Computation, ComputeFault};
pub use interpolator::{Interpolator, LookupTable};
pub use node::Filter;
pub use pid::PidController;
pub use process_model::ProcessModel;
pub use registry::{ComputationFactory, ComputationRegistry};
