//! Host-facing handle for interacting with a cell thread.

use crate::error::{Error, Result};
use crate::runtime::config::CellConfig;
use crate::runtime::event_loop::lock;
use crate::runtime::interpreter::{ResultMode, ScriptId};
use crate::runtime::js_value::JSValue;
use crate::runtime::runner::{spawn_cell_thread, CellCommand, Responder};
use crate::runtime::services::HostServices;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;

/// Completion of a cell's loop. Every clone observes the same stop.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub(crate) fn notify(&self) {
        let (stopped, condvar) = &*self.inner;
        *lock(stopped) = true;
        condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Wait until the loop has drained. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (stopped, condvar) = &*self.inner;
        let guard = lock(stopped);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// An isolated interpreter with its own task loop.
///
/// Cloning is cheap; all clones drive the same cell. Calls block until the
/// cell thread has handled them, so they must not be made from that thread
/// (signal handlers run there).
#[derive(Clone)]
pub struct Cell {
    inner: Arc<CellInner>,
}

struct CellInner {
    id: String,
    commands: async_mpsc::UnboundedSender<CellCommand>,
    // `None` once stop was requested.
    stop: Mutex<Option<oneshot::Sender<()>>>,
    stopped: StopSignal,
    stop_timeout: Duration,
    thread_id: ThreadId,
}

impl Cell {
    pub fn spawn(id: impl Into<String>, config: CellConfig, host: &HostServices) -> Result<Self> {
        let id = id.into();
        let stop_timeout = config.stop_timeout;
        let stopped = StopSignal::default();
        let thread = spawn_cell_thread(&id, config, host, stopped.clone())?;

        Ok(Self {
            inner: Arc::new(CellInner {
                id,
                commands: thread.commands,
                stop: Mutex::new(Some(thread.stop)),
                stopped,
                stop_timeout,
                thread_id: thread.thread_id,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn run(&self, source: &str) -> Result<JSValue> {
        self.run_as(source, ResultMode::Handles)
    }

    /// Run `source` and return its completion value as plain data, without
    /// creating function handles.
    pub fn eval(&self, source: &str) -> Result<JSValue> {
        self.run_as(source, ResultMode::Values)
    }

    /// Run `source` for its side effects only.
    pub fn exec(&self, source: &str) -> Result<()> {
        self.run_as(source, ResultMode::Discard).map(|_| ())
    }

    fn run_as(&self, source: &str, mode: ResultMode) -> Result<JSValue> {
        let source = source.to_string();
        self.request(|responder| CellCommand::Run {
            source,
            mode,
            responder,
        })
    }

    pub fn compile(&self, name: &str, source: &str) -> Result<ScriptId> {
        let name = name.to_string();
        let source = source.to_string();
        self.request(|responder| CellCommand::Compile {
            name,
            source,
            responder,
        })
    }

    pub fn run_compiled(&self, id: ScriptId) -> Result<JSValue> {
        self.request(|responder| CellCommand::RunCompiled { id, responder })
    }

    pub fn get(&self, path: &str) -> Result<JSValue> {
        let path = path.to_string();
        self.request(|responder| CellCommand::Get { path, responder })
    }

    pub fn set(&self, path: &str, value: impl Into<JSValue>) -> Result<()> {
        let path = path.to_string();
        let value = value.into();
        self.request(|responder| CellCommand::Set {
            path,
            value,
            responder,
        })
    }

    pub fn call(&self, path: &str, this: Option<JSValue>, args: Vec<JSValue>) -> Result<JSValue> {
        self.call_as(path, this, args, ResultMode::Handles)
    }

    /// Like [`call`](Self::call), returning plain data only.
    pub fn invoke(&self, path: &str, args: Vec<JSValue>) -> Result<JSValue> {
        self.call_as(path, None, args, ResultMode::Values)
    }

    fn call_as(
        &self,
        path: &str,
        this: Option<JSValue>,
        args: Vec<JSValue>,
        mode: ResultMode,
    ) -> Result<JSValue> {
        let path = path.to_string();
        self.request(|responder| CellCommand::Call {
            path,
            this,
            args,
            mode,
            responder,
        })
    }

    /// The value as the interpreter holds it, e.g. `2.0` reads back as `2`.
    pub fn to_value(&self, value: impl Into<JSValue>) -> Result<JSValue> {
        let value = value.into();
        self.request(|responder| CellCommand::ToValue { value, responder })
    }

    pub fn call_function(&self, id: u32, args: Vec<JSValue>) -> Result<JSValue> {
        self.request(|responder| CellCommand::CallFunction {
            id,
            args,
            responder,
        })
    }

    pub fn release_function(&self, id: u32) -> Result<()> {
        self.request(|responder| CellCommand::ReleaseFunction { id, responder })
    }

    /// Number of tasks waiting in the loop.
    pub fn pending_tasks(&self) -> Result<usize> {
        self.request(|responder| CellCommand::PendingTasks { responder })
    }

    /// Number of live function handles.
    pub fn function_handles(&self) -> Result<usize> {
        self.request(|responder| CellCommand::FunctionCount { responder })
    }

    /// Request the loop to stop. Idempotent; every call returns the same signal.
    pub fn stop(&self) -> StopSignal {
        if let Some(stop) = lock(&self.inner.stop).take() {
            tracing::debug!(cell = %self.inner.id, "stopping cell");
            let _ = stop.send(());
        }
        self.inner.stopped.clone()
    }

    /// Stop and wait for the loop to drain, bounded by the configured timeout.
    pub fn stop_and_wait(&self) -> bool {
        let drained = self.stop().wait_timeout(self.inner.stop_timeout);
        if !drained {
            tracing::warn!(
                cell = %self.inner.id,
                timeout = ?self.inner.stop_timeout,
                "cell loop did not stop in time"
            );
        }
        drained
    }

    /// Observe the loop's completion without requesting a stop.
    pub fn stop_signal(&self) -> StopSignal {
        self.inner.stopped.clone()
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.inner.stop).is_none() || self.inner.stopped.is_stopped()
    }

    fn request<T>(&self, build: impl FnOnce(Responder<T>) -> CellCommand) -> Result<T> {
        if std::thread::current().id() == self.inner.thread_id {
            return Err(Error::ReentrantCall(self.inner.id.clone()));
        }
        if self.is_stopped() {
            return Err(Error::AlreadyStopped(self.inner.id.clone()));
        }

        let (responder, result) = mpsc::channel();
        self.inner
            .commands
            .send(build(responder))
            .map_err(|_| Error::AlreadyStopped(self.inner.id.clone()))?;
        result
            .recv()
            .map_err(|_| Error::AlreadyStopped(self.inner.id.clone()))?
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
