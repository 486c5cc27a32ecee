//! Worker-side runtime.
//!
//! Runs inside the worker process: connects back to the supervising master,
//! hands the script to a [`ScriptHost`] together with a [`WorkerScope`] of
//! bindings, then dispatches master messages and timers until the worker
//! closes.

mod args;
mod line;
mod runtime;
mod scope;

pub use args::ChildArgs;
pub use line::LineScriptHost;
pub use runtime::{ScriptHost, load_source, run_child};
pub use scope::{ChildPort, ScriptResult, TimerId, WorkerScope};
