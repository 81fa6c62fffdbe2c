//! Table interpolator module and its table loader.
//!
//! Each input is mapped through a piecewise-linear lookup table to the output at
//! the same position. Inputs outside the table range are clamped to the end
//! values.
//!
//! Parameters:
//! - `table` - path to a table file (see [`LookupTable::parse`])
//! - `points` - inline table, e.g. `"0:0, 1:10, 2:15"`
//!
//! ## Table file format
//!
//! ```text
//! # x     y
//! 0.0     0.0
//! 0.5,    2.5
//! 1.0     4.0
//! ```

use crate::config::ConfigValue;
use crate::error::{QDaqError, Result};
use crate::filter::computation::{unknown_parameter, Computation, ComputeFault};
use crate::scheduler::TickContext;
use std::path::Path;

pub const KIND: &str = "interpolator";

/// Piecewise-linear lookup table with strictly increasing abscissae.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl LookupTable {
    /// Build a table from `(x, y)` points.
    pub fn new(points: Vec<(f64, f64)>, origin: &str) -> Result<Self> {
        let fail = |message: String| QDaqError::ResourceLoad {
            resource: origin.to_string(),
            message,
        };
        if points.len() < 2 {
            return Err(fail(format!(
                "need at least 2 rows, got {}",
                points.len()
            )));
        }
        if let Some((x, y)) = points.iter().find(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(fail(format!("non-finite row ({}, {})", x, y)));
        }
        if let Some(w) = points.windows(2).find(|w| w[1].0 <= w[0].0) {
            return Err(fail(format!(
                "x must be strictly increasing ({} then {})",
                w[0].0, w[1].0
            )));
        }
        let (x, y) = points.into_iter().unzip();
        Ok(Self { x, y })
    }

    /// Parse table text: two numeric columns separated by whitespace and/or a
    /// comma; `#` starts a comment; blank lines are ignored.
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        let mut points = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let cols: Vec<&str> = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .collect();
            let parsed = match cols.as_slice() {
                [x, y] => x.parse::<f64>().ok().zip(y.parse::<f64>().ok()),
                _ => None,
            };
            let point = parsed.ok_or_else(|| QDaqError::ResourceLoad {
                resource: origin.to_string(),
                message: format!("line {}: expected two numbers, got '{}'", lineno + 1, line),
            })?;
            points.push(point);
        }
        Self::new(points, origin)
    }

    /// Load and parse a table file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| QDaqError::ResourceLoad {
            resource: origin.clone(),
            message: e.to_string(),
        })?;
        let table = Self::parse(&text, &origin)?;
        tracing::debug!("Loaded table {} ({} rows)", origin, table.len());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Range of x covered by the table.
    pub fn domain(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    /// Interpolated y at `x`, clamped outside the domain.
    pub fn lookup(&self, x: f64) -> f64 {
        let n = self.x.len();
        if x <= self.x[0] {
            return self.y[0];
        }
        if x >= self.x[n - 1] {
            return self.y[n - 1];
        }
        // First index with x[i] > x; 1 <= i <= n - 1 here.
        let i = self.x.partition_point(|&xi| xi <= x);
        let (x0, x1) = (self.x[i - 1], self.x[i]);
        let (y0, y1) = (self.y[i - 1], self.y[i]);
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }
}

fn parse_inline(text: &str) -> Result<LookupTable> {
    let mut points = Vec::new();
    for pair in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let point = pair
            .split_once(':')
            .and_then(|(x, y)| x.trim().parse::<f64>().ok().zip(y.trim().parse::<f64>().ok()))
            .ok_or_else(|| QDaqError::ResourceLoad {
                resource: "points".to_string(),
                message: format!("expected 'x:y', got '{}'", pair),
            })?;
        points.push(point);
    }
    LookupTable::new(points, "points")
}

/// Table lookup computation.
#[derive(Debug, Clone, Default)]
pub struct Interpolator {
    table: Option<LookupTable>,
}

impl Interpolator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: LookupTable) -> Self {
        Self { table: Some(table) }
    }

    pub fn table(&self) -> Option<&LookupTable> {
        self.table.as_ref()
    }
}

impl Computation for Interpolator {
    fn kind(&self) -> &str {
        KIND
    }

    fn configure(&mut self, key: &str, value: &ConfigValue) -> Result<()> {
        let text = value.as_str().ok_or_else(|| {
            QDaqError::Config(format!(
                "{}: parameter '{}' expects a string, got {}",
                KIND, key, value
            ))
        })?;
        let table = match key {
            "table" => LookupTable::load(text)?,
            "points" => parse_inline(text)?,
            _ => return Err(unknown_parameter(KIND, key)),
        };
        self.table = Some(table);
        Ok(())
    }

    fn validate(&self, inputs: usize, outputs: usize) -> Result<()> {
        if self.table.is_none() {
            return Err(QDaqError::ResourceLoad {
                resource: "table".to_string(),
                message: format!("{}: no table loaded", KIND),
            });
        }
        if inputs == 0 || inputs != outputs {
            return Err(QDaqError::Config(format!(
                "{}: needs matching non-zero input/output counts, got {} and {}",
                KIND, inputs, outputs
            )));
        }
        Ok(())
    }

    fn compute(
        &mut self,
        inputs: &[f64],
        _ctx: &TickContext,
    ) -> std::result::Result<Vec<f64>, ComputeFault> {
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| ComputeFault::new(format!("{}: no table loaded", KIND)))?;
        if let Some(bad) = inputs.iter().find(|v| v.is_nan()) {
            return Err(ComputeFault::new(format!("{}: cannot look up {}", KIND, bad)));
        }
        Ok(inputs.iter().map(|&x| table.lookup(x)).collect())
    }
}
