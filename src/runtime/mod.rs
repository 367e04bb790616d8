//! Cells: isolated interpreters with their own task loop.
//!
//! Each cell owns a single V8 isolate running on a dedicated OS thread.
//! Timers, promise reactions, fetch and async RPC are tasks on the cell's
//! loop; their background work runs on a runtime shared by all cells.

pub mod config;
pub(crate) mod conversion;
pub mod event_loop;
pub mod handle;
pub mod interpreter;
pub mod js_value;
pub(crate) mod ops;
pub(crate) mod runner;
pub mod services;

#[cfg(test)]
mod script_tests;

pub use config::CellConfig;
pub use event_loop::TaskId;
pub use handle::{Cell, StopSignal};
pub use interpreter::{Interpreter, ResultMode, ScriptId};
pub use js_value::JSValue;
pub use services::HostServices;
