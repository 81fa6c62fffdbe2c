//! Generic tree node.
//!
//! Every element of the object tree (channels, filters, jobs and loops) embeds a
//! [`NodeCore`] holding its name and a weak back-reference to the owning
//! [`Loop`]. Ownership flows downward only: a loop holds strong references to
//! its children, children hold weak references to their parent.
//!
//! ```text
//! qdaq                (Loop, root)
//! +-- loop            (Loop, period = 100 ms)
//! |   +-- u           (Channel)
//! |   +-- sys         (Filter: u -> y)
//! |   +-- y           (Channel)
//! |   +-- child       (Loop, independent engine)
//! |       +-- job     (Job)
//! ```

use crate::channel::Channel;
use crate::filter::Filter;
use crate::job::Job;
use crate::scheduler::Loop;
use crate::sync;
use crate::tree::path;
use crate::error::Result;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

/// Name and parent link shared by all node kinds.
pub struct NodeCore {
    name: String,
    parent: RwLock<Weak<Loop>>,
}

impl NodeCore {
    pub(crate) fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        path::validate_name(&name)?;
        Ok(Self {
            name,
            parent: RwLock::new(Weak::new()),
        })
    }

    /// Name of this node, unique among its siblings.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning loop, if attached.
    pub fn parent(&self) -> Option<Arc<Loop>> {
        sync::read(&self.parent).upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Weak<Loop>) {
        *sync::write(&self.parent) = parent;
    }

    /// Absolute dotted path from the root, e.g. `qdaq.loop.t`.
    pub fn full_path(&self) -> String {
        match self.parent() {
            Some(parent) => path::join(&parent.full_path(), &self.name),
            None => self.name.clone(),
        }
    }

    /// Topmost ancestor of this node, or `None` for a detached node.
    pub fn root(&self) -> Option<Arc<Loop>> {
        let mut current = self.parent()?;
        while let Some(up) = current.core().parent() {
            current = up;
        }
        Some(current)
    }

    /// True when the owning loop is currently ticking.
    pub(crate) fn owner_running(&self) -> bool {
        self.parent().is_some_and(|p| p.is_running())
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("name", &self.name)
            .field("path", &self.full_path())
            .finish()
    }
}

/// The kind of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Channel,
    Filter,
    Job,
    Loop,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Channel => "channel",
            NodeKind::Filter => "filter",
            NodeKind::Job => "job",
            NodeKind::Loop => "loop",
        };
        f.write_str(s)
    }
}

/// A handle to any node in the tree.
///
/// Cloning a `Node` clones the handle, not the node.
#[derive(Clone)]
pub enum Node {
    Channel(Arc<Channel>),
    Filter(Arc<Filter>),
    Job(Arc<Job>),
    Loop(Arc<Loop>),
}

impl Node {
    pub fn core(&self) -> &NodeCore {
        match self {
            Node::Channel(n) => n.core(),
            Node::Filter(n) => n.core(),
            Node::Job(n) => n.core(),
            Node::Loop(n) => n.core(),
        }
    }

    pub fn name(&self) -> &str {
        self.core().name()
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Channel(_) => NodeKind::Channel,
            Node::Filter(_) => NodeKind::Filter,
            Node::Job(_) => NodeKind::Job,
            Node::Loop(_) => NodeKind::Loop,
        }
    }

    pub fn full_path(&self) -> String {
        self.core().full_path()
    }

    pub fn parent(&self) -> Option<Arc<Loop>> {
        self.core().parent()
    }

    /// Identity comparison: true if both handles point at the same node.
    pub fn same_as(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Channel(a), Node::Channel(b)) => Arc::ptr_eq(a, b),
            (Node::Filter(a), Node::Filter(b)) => Arc::ptr_eq(a, b),
            (Node::Job(a), Node::Job(b)) => Arc::ptr_eq(a, b),
            (Node::Loop(a), Node::Loop(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_channel(&self) -> Option<&Arc<Channel>> {
        match self {
            Node::Channel(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_filter(&self) -> Option<&Arc<Filter>> {
        match self {
            Node::Filter(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&Arc<Job>> {
        match self {
            Node::Job(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_loop(&self) -> Option<&Arc<Loop>> {
        match self {
            Node::Loop(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({} {})", self.kind(), self.full_path())
    }
}

impl From<Arc<Channel>> for Node {
    fn from(n: Arc<Channel>) -> Self {
        Node::Channel(n)
    }
}

impl From<Arc<Filter>> for Node {
    fn from(n: Arc<Filter>) -> Self {
        Node::Filter(n)
    }
}

impl From<Arc<Job>> for Node {
    fn from(n: Arc<Job>) -> Self {
        Node::Job(n)
    }
}

impl From<Arc<Loop>> for Node {
    fn from(n: Arc<Loop>) -> Self {
        Node::Loop(n)
    }
}

impl From<&Arc<Channel>> for Node {
    fn from(n: &Arc<Channel>) -> Self {
        Node::Channel(n.clone())
    }
}

impl From<&Arc<Filter>> for Node {
    fn from(n: &Arc<Filter>) -> Self {
        Node::Filter(n.clone())
    }
}

impl From<&Arc<Job>> for Node {
    fn from(n: &Arc<Job>) -> Self {
        Node::Job(n.clone())
    }
}

impl From<&Arc<Loop>> for Node {
    fn from(n: &Arc<Loop>) -> Self {
        Node::Loop(n.clone())
    }
}
