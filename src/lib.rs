//! Sandboxed JavaScript cells with a host-driven task loop.
//!
//! A [`Jail`] holds any number of [`Cell`]s, each an isolated V8 interpreter
//! on its own thread. Scripts get `setTimeout`/`setInterval`/`setImmediate`,
//! a `Promise` whose reactions run on the cell's loop, `fetch`, a `jeth`
//! bridge to an RPC client and `console`/`statusSignals` forwarded to the
//! host as [`Signal`]s.
//!
//! ```no_run
//! use jailcell::Jail;
//!
//! let jail = Jail::builder().base_js("var greeting = 'hi';").build()?;
//! let envelope = jail.create_and_init_cell("chat", "var _status_catalog = { greeting };");
//! assert_eq!(envelope, r#"{"result":{"greeting":"hi"}}"#);
//! # Ok::<(), jailcell::Error>(())
//! ```

pub mod error;
pub mod jail;
pub mod rpc;
pub mod runtime;
pub mod signal;

pub use error::{Error, Result};
pub use jail::{Jail, JailBuilder};
pub use rpc::{RpcBridge, RpcClient};
pub use runtime::event_loop::{FetchRequest, FetchResponse, LocalHandler};
pub use runtime::{Cell, CellConfig, HostServices, JSValue, StopSignal};
pub use signal::{Signal, SignalHandler};
