//! Object tree: naming, ownership and dotted-path addressing.
//!
//! The tree is made of [`Node`] handles. Only [`Loop`](crate::scheduler::Loop)
//! nodes own children; the root is a loop as well (see
//! [`Loop::root`](crate::scheduler::Loop::root)). Child management
//! (`append_child`, `remove_child`, `find_child`, `resolve`) lives on `Loop`.

pub mod node;
pub mod path;

pub use node::{Node, NodeCore, NodeKind};
pub use path::{join, segments, validate_name, SEPARATOR};
