//! Rhai scripting engine for jobs
//!
//! A job body is a Rhai script run once per tick of its loop. The script gets
//! narrow access to the tree through registered functions; it cannot reach
//! engine internals.
//!
//! ## Variables
//!
//! - `tick` - index of the current tick since the loop was armed
//! - `time` - seconds since the loop was armed
//! - `dt` - loop period in seconds
//!
//! Script-defined functions cannot see these variables; they can call `tick()`,
//! `time()` and `dt()` instead.
//!
//! ## Tree access
//!
//! - `get(path)` - current value of the channel at an absolute path
//! - `set(path, value)` - write a channel; observers are notified after the job step
//! - `exists(path)` - true if `path` names a channel
//!
//! Paths start at the root name, e.g. `"qdaq.loop.ch1"`. Unknown paths are
//! runtime errors. Variables declared with `let` live for one run only.
//!
//! ## Helpers
//!
//! `abs`, `sqrt`, `pow`, `exp`, `ln`, `log10`, `sin`, `cos`, `tan`, `atan2`,
//! `floor`, `ceil`, `round`, `clamp`, `min`, `max`, `pi`, `is_nan`,
//! `is_finite`, `lerp`, `map_range`, `deadband`. `print` and `debug` go to the
//! log.
//!
//! ## Example
//!
//! ```rhai
//! // Square root of a channel owned by another loop
//! let x = get("qdaq.loop.ch1");
//! set("qdaq.loop.loop2.ch2", sqrt(x));
//! ```

mod engine;

pub use engine::{ScriptContext, ScriptEngine, SharedScriptContext, DEFAULT_MAX_OPERATIONS};
