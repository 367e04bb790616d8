//! Per-cell task loop.
//!
//! Every asynchronous script facility (timers, promise reactions, fetch,
//! async RPC) is a [`Task`] registered with the cell's [`TaskLoop`]. Out of
//! band work runs on the shared background runtime and reports back by
//! sending the task id on the ready channel; the cell thread then calls
//! [`TaskLoop::process`], which is the only place a task touches the
//! interpreter.
//!
//! The loop is single-threaded: it lives on the cell thread behind an
//! `Rc<RefCell<_>>` shared between the runner and the op state. No borrow is
//! held while a task executes, so script callbacks may add or remove tasks.

pub mod fetch;
pub mod promise;
pub mod rpc;
pub mod timers;

use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub use fetch::{FetchClient, FetchOutcome, FetchRequest, FetchResponse, FetchTask, LocalHandler};
pub use promise::PromiseTask;
pub use rpc::RpcTask;
pub use timers::TimerTask;

/// Task identifier. Strictly increasing per loop, never reused.
pub type TaskId = i64;

/// What the loop should do with a task after it executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Finished,
    /// The task scheduled more work and stays pending under the same id.
    Rearmed,
}

/// Script-side handler a task result is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Timer,
    Promise,
    Fetch,
    Rpc,
    /// Release script state for a task that will never run.
    Cancel,
}

impl DispatchKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            DispatchKind::Timer => "timer",
            DispatchKind::Promise => "promise",
            DispatchKind::Fetch => "fetch",
            DispatchKind::Rpc => "rpc",
            DispatchKind::Cancel => "cancel",
        }
    }
}

/// The interpreter side of task execution.
pub trait ScriptHost {
    /// Deliver a task result to script. Returns whether a script callback
    /// was still registered for `id`.
    fn dispatch(
        &mut self,
        kind: DispatchKind,
        id: TaskId,
        payload: serde_json::Value,
    ) -> Result<bool>;
}

/// A unit of deferred work owned by a [`TaskLoop`].
pub trait Task {
    fn set_id(&mut self, id: TaskId);

    fn id(&self) -> TaskId;

    fn kind(&self) -> &'static str;

    /// Begin out-of-band work. Called once the task has an id.
    fn start(&mut self, _background: &Background) {}

    /// Run the task on the cell thread.
    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskState>;

    /// Stop the task. It must never reach script afterwards.
    fn cancel(&mut self);
}

/// Access granted to a task while it executes.
pub struct TaskContext<'a> {
    host: &'a mut dyn ScriptHost,
    task_loop: &'a TaskLoop,
    id: TaskId,
}

impl TaskContext<'_> {
    pub fn host(&mut self) -> &mut dyn ScriptHost {
        &mut *self.host
    }

    pub fn background(&self) -> &Background {
        &self.task_loop.background
    }

    /// True once the executing task was removed from inside its own callback.
    pub fn is_cancelled(&self) -> bool {
        let state = self.task_loop.state.borrow();
        state.executing == Some(self.id) && state.executing_cancelled
    }
}

/// Sending half of the ready channel. `None` only wakes the loop.
#[derive(Clone)]
pub struct ReadySender(mpsc::Sender<Option<TaskId>>);

impl ReadySender {
    pub async fn ready(&self, id: TaskId) {
        if self.0.send(Some(id)).await.is_err() {
            tracing::trace!(task_id = id, "loop closed before task became ready");
        }
    }

    pub fn wake(&self) {
        // A full channel already guarantees a wake-up.
        let _ = self.0.try_send(None);
    }
}

/// Create the ready channel for one loop.
pub fn ready_channel(capacity: usize) -> (ReadySender, mpsc::Receiver<Option<TaskId>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ReadySender(tx), rx)
}

/// Handle onto the shared background runtime, bound to one loop's ready channel.
#[derive(Clone)]
pub struct Background {
    handle: Handle,
    ready: ReadySender,
}

impl Background {
    pub fn new(handle: Handle, ready: ReadySender) -> Self {
        Self { handle, ready }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn ready_sender(&self) -> &ReadySender {
        &self.ready
    }

    /// Mark `id` ready once `delay` has elapsed.
    pub fn ready_after(&self, id: TaskId, delay: Duration) -> AbortHandle {
        self.ready_when(id, tokio::time::sleep(delay))
    }

    /// Run `work` in the background, then mark `id` ready.
    pub fn ready_when<F>(&self, id: TaskId, work: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ready = self.ready.clone();
        self.handle
            .spawn(async move {
                work.await;
                ready.ready(id).await;
            })
            .abort_handle()
    }
}

struct LoopState {
    pending: HashMap<TaskId, Box<dyn Task>>,
    next_id: TaskId,
    executing: Option<TaskId>,
    executing_cancelled: bool,
    closed: bool,
}

/// Scheduler owning every pending task of one cell.
#[derive(Clone)]
pub struct TaskLoop {
    state: Rc<RefCell<LoopState>>,
    background: Background,
}

impl TaskLoop {
    pub fn new(background: Background) -> Self {
        Self {
            state: Rc::new(RefCell::new(LoopState {
                pending: HashMap::new(),
                next_id: 1,
                executing: None,
                executing_cancelled: false,
                closed: false,
            })),
            background,
        }
    }

    pub fn background(&self) -> &Background {
        &self.background
    }

    /// Assign a fresh id to `task`, start it and keep it pending.
    ///
    /// On a closed loop the task is cancelled immediately; the id is still
    /// consumed.
    pub fn add<T: Task + 'static>(&self, mut task: T) -> TaskId {
        let (id, closed) = {
            let mut state = self.state.borrow_mut();
            let id = state.next_id;
            state.next_id += 1;
            (id, state.closed)
        };

        task.set_id(id);
        if closed {
            task.cancel();
            return id;
        }

        task.start(&self.background);
        tracing::trace!(task_id = id, kind = task.kind(), "task added");
        self.state.borrow_mut().pending.insert(id, Box::new(task));
        id
    }

    /// Cancel a task. Returns false when `id` is neither pending nor executing.
    pub fn remove(&self, id: TaskId) -> bool {
        let removed = {
            let mut state = self.state.borrow_mut();
            if state.executing == Some(id) {
                state.executing_cancelled = true;
                return true;
            }
            state.pending.remove(&id)
        };

        match removed {
            Some(mut task) => {
                task.cancel();
                tracing::trace!(task_id = id, kind = task.kind(), "task removed");
                self.background.ready.wake();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.state.borrow().pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Execute the task behind a ready signal.
    ///
    /// Stale ids (already removed or cancelled) are ignored. When the task
    /// fails every other pending task is cancelled, its script state is
    /// released, and the failure is returned to the caller.
    pub fn process(&self, id: TaskId, host: &mut dyn ScriptHost) -> Result<()> {
        let task = {
            let mut state = self.state.borrow_mut();
            let task = state.pending.remove(&id);
            if task.is_some() {
                state.executing = Some(id);
                state.executing_cancelled = false;
            }
            task
        };
        let Some(mut task) = task else {
            tracing::trace!(task_id = id, "ignoring ready signal for a task that is not pending");
            return Ok(());
        };

        let kind = task.kind();
        let result = {
            let mut cx = TaskContext {
                host: &mut *host,
                task_loop: self,
                id,
            };
            task.execute(&mut cx)
        };

        let cancelled = {
            let mut state = self.state.borrow_mut();
            state.executing = None;
            std::mem::take(&mut state.executing_cancelled)
        };

        match result {
            Ok(TaskState::Rearmed) if !cancelled => {
                self.state.borrow_mut().pending.insert(id, task);
                Ok(())
            }
            Ok(_) => {
                if cancelled {
                    task.cancel();
                }
                Ok(())
            }
            Err(err) => {
                task.cancel();
                let siblings = self.cancel_all();
                tracing::debug!(
                    task_id = id,
                    kind,
                    cancelled = siblings.len(),
                    "task failed, cancelled pending tasks"
                );
                for released in std::iter::once(id).chain(siblings) {
                    if let Err(release_err) =
                        host.dispatch(DispatchKind::Cancel, released, serde_json::Value::Null)
                    {
                        tracing::warn!(task_id = released, error = %release_err, "failed to release script state");
                    }
                }
                Err(Error::TaskExecution {
                    task_id: id,
                    kind,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Cancel every pending task and return their ids in ascending order.
    pub fn cancel_all(&self) -> Vec<TaskId> {
        let drained: Vec<_> = self.state.borrow_mut().pending.drain().collect();
        let mut ids = Vec::with_capacity(drained.len());
        for (id, mut task) in drained {
            task.cancel();
            ids.push(id);
        }
        ids.sort_unstable();
        ids
    }

    /// Cancel everything and refuse new tasks.
    pub fn close(&self) -> usize {
        self.state.borrow_mut().closed = true;
        self.cancel_all().len()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
