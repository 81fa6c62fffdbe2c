//! PID (Proportional-Integral-Derivative) controller module.
//!
//! Ports:
//! - one input: measurement (setpoint from the `setpoint` parameter), or
//!   two inputs: setpoint, measurement
//! - one output: control value
//!
//! Parameters: `kp`, `ki`, `kd`, `setpoint`, `output_min`, `output_max`,
//! `integral_min`, `integral_max`, `deadband`.
//!
//! The derivative term is skipped on the first step after a reset so a fresh
//! controller does not kick.

use crate::config::ConfigValue;
use crate::error::{QDaqError, Result};
use crate::filter::computation::{expect_float, unknown_parameter, Computation, ComputeFault};
use crate::scheduler::TickContext;

pub const KIND: &str = "pid";

/// PID controller with anti-windup and output limiting.
#[derive(Debug, Clone)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,

    integral: f64,
    last_error: Option<f64>,

    output_min: f64,
    output_max: f64,
    integral_min: f64,
    integral_max: f64,
    deadband: f64,
}

impl Default for PidController {
    fn default() -> Self {
        Self::new(1.0, 0.0, 0.0)
    }
}

impl PidController {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            setpoint: 0.0,
            integral: 0.0,
            last_error: None,
            output_min: f64::NEG_INFINITY,
            output_max: f64::INFINITY,
            integral_min: f64::NEG_INFINITY,
            integral_max: f64::INFINITY,
            deadband: 0.0,
        }
    }

    pub fn gains(&self) -> (f64, f64, f64) {
        (self.kp, self.ki, self.kd)
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// One controller update.
    pub fn update(&mut self, setpoint: f64, feedback: f64, dt: f64) -> f64 {
        let mut error = setpoint - feedback;
        if error.abs() < self.deadband {
            error = 0.0;
        }

        let p_term = self.kp * error;

        self.integral = (self.integral + error * dt).clamp(self.integral_min, self.integral_max);
        let i_term = self.ki * self.integral;

        let d_term = match self.last_error {
            Some(last) => self.kd * (error - last) / dt,
            None => 0.0,
        };
        self.last_error = Some(error);

        (p_term + i_term + d_term).clamp(self.output_min, self.output_max)
    }
}

impl Computation for PidController {
    fn kind(&self) -> &str {
        KIND
    }

    fn configure(&mut self, key: &str, value: &ConfigValue) -> Result<()> {
        let v = expect_float(KIND, key, value)?;
        if v.is_nan() {
            return Err(QDaqError::Config(format!("pid: parameter '{}' is NaN", key)));
        }
        match key {
            "kp" => self.kp = v,
            "ki" => self.ki = v,
            "kd" => self.kd = v,
            "setpoint" => self.setpoint = v,
            "output_min" => self.output_min = v,
            "output_max" => self.output_max = v,
            "integral_min" => self.integral_min = v,
            "integral_max" => self.integral_max = v,
            "deadband" => self.deadband = v.abs(),
            _ => return Err(unknown_parameter(KIND, key)),
        }
        Ok(())
    }

    fn validate(&self, inputs: usize, outputs: usize) -> Result<()> {
        if !(1..=2).contains(&inputs) || outputs != 1 {
            return Err(QDaqError::Config(format!(
                "pid: expects 1 or 2 inputs and 1 output, got {} and {}",
                inputs, outputs
            )));
        }
        // A NaN bound fails here as well; `f64::clamp` would panic on it.
        if !(self.output_min <= self.output_max) || !(self.integral_min <= self.integral_max) {
            return Err(QDaqError::Config("pid: inverted limits".to_string()));
        }
        Ok(())
    }

    fn compute(
        &mut self,
        inputs: &[f64],
        ctx: &TickContext,
    ) -> std::result::Result<Vec<f64>, ComputeFault> {
        let dt = ctx.dt_secs();
        if dt <= 0.0 {
            return Err(ComputeFault::new("pid: time step must be positive"));
        }
        let (setpoint, feedback) = match *inputs {
            [feedback] => (self.setpoint, feedback),
            [setpoint, feedback] => (setpoint, feedback),
            _ => {
                return Err(ComputeFault::new(format!(
                    "pid: expected 1 or 2 inputs, got {}",
                    inputs.len()
                )))
            }
        };
        if !feedback.is_finite() || !setpoint.is_finite() {
            return Err(ComputeFault::new("pid: non-finite input"));
        }
        Ok(vec![self.update(setpoint, feedback, dt)])
    }

    fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }
}
