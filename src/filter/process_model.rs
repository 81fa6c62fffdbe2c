//! First-order-plus-dead-time process simulator.
//!
//! Models `tau * dy/dt = gain * u(t - dead_time) - y`, discretized exactly for a
//! piecewise-constant input over one loop period:
//!
//! ```text
//! y[n+1] = y[n] + (1 - exp(-dt / tau)) * (gain * u[n - d] - y[n])
//! ```
//!
//! Parameters: `gain`, `tau` (seconds, 0 = static gain), `initial`,
//! `dead_time_ticks`.

use crate::config::ConfigValue;
use crate::error::{QDaqError, Result};
use crate::filter::computation::{expect_float, unknown_parameter, Computation, ComputeFault};
use crate::scheduler::TickContext;
use std::collections::VecDeque;

pub const KIND: &str = "process_model";

#[derive(Debug, Clone)]
pub struct ProcessModel {
    gain: f64,
    tau: f64,
    initial: f64,
    dead_time_ticks: usize,

    state: f64,
    delay_line: VecDeque<f64>,
}

impl Default for ProcessModel {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

impl ProcessModel {
    pub fn new(gain: f64, tau: f64) -> Self {
        Self {
            gain,
            tau,
            initial: 0.0,
            dead_time_ticks: 0,
            state: 0.0,
            delay_line: VecDeque::new(),
        }
    }

    /// Current model output.
    pub fn output(&self) -> f64 {
        self.state
    }

    fn delayed_input(&mut self, u: f64) -> f64 {
        if self.dead_time_ticks == 0 {
            return u;
        }
        self.delay_line.push_back(u);
        if self.delay_line.len() > self.dead_time_ticks {
            self.delay_line.pop_front().unwrap_or(u)
        } else {
            // Not enough history yet: the plant has seen nothing.
            0.0
        }
    }
}

impl Computation for ProcessModel {
    fn kind(&self) -> &str {
        KIND
    }

    fn configure(&mut self, key: &str, value: &ConfigValue) -> Result<()> {
        let v = expect_float(KIND, key, value)?;
        match key {
            "gain" => self.gain = v,
            "tau" => {
                if v < 0.0 {
                    return Err(QDaqError::Config(format!(
                        "{}: tau must be >= 0, got {}",
                        KIND, v
                    )));
                }
                self.tau = v;
            }
            "initial" => {
                self.initial = v;
                self.state = v;
            }
            "dead_time_ticks" => {
                if v < 0.0 || v.fract() != 0.0 {
                    return Err(QDaqError::Config(format!(
                        "{}: dead_time_ticks must be a non-negative integer",
                        KIND
                    )));
                }
                self.dead_time_ticks = v as usize;
                self.delay_line.clear();
            }
            _ => return Err(unknown_parameter(KIND, key)),
        }
        Ok(())
    }

    fn validate(&self, inputs: usize, outputs: usize) -> Result<()> {
        if inputs != 1 || outputs != 1 {
            return Err(QDaqError::Config(format!(
                "{}: expects 1 input and 1 output, got {} and {}",
                KIND, inputs, outputs
            )));
        }
        Ok(())
    }

    fn compute(
        &mut self,
        inputs: &[f64],
        ctx: &TickContext,
    ) -> std::result::Result<Vec<f64>, ComputeFault> {
        let [u] = *inputs else {
            return Err(ComputeFault::new(format!(
                "{}: expected 1 input, got {}",
                KIND,
                inputs.len()
            )));
        };
        if !u.is_finite() {
            return Err(ComputeFault::new(format!("{}: non-finite input", KIND)));
        }
        let u = self.delayed_input(u);
        let target = self.gain * u;
        if self.tau == 0.0 {
            self.state = target;
        } else {
            let alpha = 1.0 - (-ctx.dt_secs() / self.tau).exp();
            self.state += alpha * (target - self.state);
        }
        Ok(vec![self.state])
    }

    fn reset(&mut self) {
        self.state = self.initial;
        self.delay_line.clear();
    }
}
