//! Test data builders for creating object trees

use qdaq::{Channel, ComputationRegistry, Filter, Loop, Node};
use std::sync::Arc;

/// Builder for creating test Loops
pub struct LoopBuilder {
    name: String,
    period_ms: Option<u64>,
    delay_ms: u64,
    children: Vec<Node>,
    engine: bool,
}

impl LoopBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            period_ms: None,
            delay_ms: 0,
            children: Vec::new(),
            engine: true,
        }
    }

    pub fn period_ms(mut self, period_ms: u64) -> Self {
        self.period_ms = Some(period_ms);
        self
    }

    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }

    /// Leave the loop Unbound
    pub fn without_engine(mut self) -> Self {
        self.engine = false;
        self
    }

    /// Build the loop and attach it under `parent`.
    pub fn build_under(self, parent: &Arc<Loop>) -> Arc<Loop> {
        let l = Loop::new(self.name).unwrap();
        if let Some(p) = self.period_ms {
            l.set_period_ms(p).unwrap();
        }
        l.set_delay_ms(self.delay_ms).unwrap();
        for child in self.children {
            l.append_child(child).unwrap();
        }
        parent.append_child(&l).unwrap();
        if self.engine {
            l.create_loop_engine().unwrap();
        }
        l
    }
}

/// The plant/controller/table example: `sys` (u -> y), `pid` (y -> u),
/// `ip` (y -> y1), all in one loop under root `qdaq`.
pub struct ControlLoop {
    pub root: Arc<Loop>,
    pub l: Arc<Loop>,
    pub u: Arc<Channel>,
    pub y: Arc<Channel>,
    pub y1: Arc<Channel>,
    pub sys: Arc<Filter>,
    pub pid: Arc<Filter>,
    pub ip: Arc<Filter>,
}

/// Table used by [`control_loop`]: y1 = 10 * y on [0, 1], flattening after.
pub const TABLE_POINTS: &str = "0:0, 1:10, 2:15";

pub fn control_loop(period_ms: u64) -> ControlLoop {
    let registry = ComputationRegistry::new();
    let root = Loop::root("qdaq").unwrap();

    let u = Channel::new("u").unwrap();
    let y = Channel::new("y").unwrap();
    let y1 = Channel::new("y1").unwrap();

    let sys = Filter::with_module("sys", "sys", &registry).unwrap();
    sys.configure("gain", 1.0).unwrap();
    sys.configure("tau", 0.5).unwrap();
    sys.set_inputs(vec![u.clone()]).unwrap();
    sys.set_outputs(vec![y.clone()]).unwrap();

    let pid = Filter::with_module("pid", "pid", &registry).unwrap();
    pid.configure("kp", 2.0).unwrap();
    pid.configure("ki", 1.0).unwrap();
    pid.configure("setpoint", 1.0).unwrap();
    pid.set_inputs(vec![y.clone()]).unwrap();
    pid.set_outputs(vec![u.clone()]).unwrap();

    let ip = Filter::with_module("ip", "table", &registry).unwrap();
    ip.configure("points", TABLE_POINTS).unwrap();
    ip.set_inputs(vec![y.clone()]).unwrap();
    ip.set_outputs(vec![y1.clone()]).unwrap();

    let l = LoopBuilder::new("loop")
        .period_ms(period_ms)
        .child(&u)
        .child(&y)
        .child(&y1)
        .child(&sys)
        .child(&pid)
        .child(&ip)
        .build_under(&root);

    ControlLoop {
        root,
        l,
        u,
        y,
        y1,
        sys,
        pid,
        ip,
    }
}

/// Reference lookup for [`TABLE_POINTS`].
pub fn table_value(y: f64) -> f64 {
    if y <= 0.0 {
        0.0
    } else if y <= 1.0 {
        10.0 * y
    } else if y <= 2.0 {
        10.0 + 5.0 * (y - 1.0)
    } else {
        15.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_builder() {
        let root = Loop::root("qdaq").unwrap();
        let l = LoopBuilder::new("loop")
            .period_ms(20)
            .delay_ms(5)
            .child(Channel::new("t").unwrap())
            .build_under(&root);
        assert_eq!(l.full_path(), "qdaq.loop");
        assert_eq!(l.child_count(), 1);
        assert!(l.has_engine());
    }
}
