//! Cell thread.
//!
//! Each cell hosts its interpreter on a dedicated OS thread with a
//! single-threaded Tokio runtime. Host commands arrive through
//! [`CellCommand`], task readiness through the ready channel, and both are
//! handled one at a time on that thread until the stop signal fires.

use crate::error::{Error, Result};
use crate::runtime::config::CellConfig;
use crate::runtime::event_loop::{ready_channel, Background, TaskId, TaskLoop};
use crate::runtime::handle::StopSignal;
use crate::runtime::interpreter::{Interpreter, ResultMode, ScriptId};
use crate::runtime::js_value::JSValue;
use crate::runtime::services::{CellServices, HostServices};
use crate::signal::Signal;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::ThreadId;
use tokio::sync::{mpsc, oneshot};

pub(crate) type Responder<T> = std_mpsc::Sender<Result<T>>;

/// Commands sent to the cell thread.
pub(crate) enum CellCommand {
    Run {
        source: String,
        mode: ResultMode,
        responder: Responder<JSValue>,
    },
    Compile {
        name: String,
        source: String,
        responder: Responder<ScriptId>,
    },
    RunCompiled {
        id: ScriptId,
        responder: Responder<JSValue>,
    },
    Get {
        path: String,
        responder: Responder<JSValue>,
    },
    Set {
        path: String,
        value: JSValue,
        responder: Responder<()>,
    },
    Call {
        path: String,
        this: Option<JSValue>,
        args: Vec<JSValue>,
        mode: ResultMode,
        responder: Responder<JSValue>,
    },
    ToValue {
        value: JSValue,
        responder: Responder<JSValue>,
    },
    CallFunction {
        id: u32,
        args: Vec<JSValue>,
        responder: Responder<JSValue>,
    },
    ReleaseFunction {
        id: u32,
        responder: Responder<()>,
    },
    PendingTasks {
        responder: Responder<usize>,
    },
    FunctionCount {
        responder: Responder<usize>,
    },
}

/// Channels into a running cell thread.
pub(crate) struct CellThread {
    pub commands: mpsc::UnboundedSender<CellCommand>,
    pub stop: oneshot::Sender<()>,
    pub thread_id: ThreadId,
}

/// Marks the cell stopped when the thread exits, including by panic.
struct NotifyOnExit(StopSignal);

impl Drop for NotifyOnExit {
    fn drop(&mut self) {
        self.0.notify();
    }
}

pub(crate) fn spawn_cell_thread(
    cell_id: &str,
    config: CellConfig,
    host: &HostServices,
    stopped: StopSignal,
) -> Result<CellThread> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<CellCommand>();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (init_tx, init_rx) = std_mpsc::channel::<Result<()>>();
    let id = cell_id.to_string();
    let host = host.clone();

    let thread = std::thread::Builder::new()
        .name(format!("jailcell-{cell_id}"))
        .spawn(move || {
            let _exit = NotifyOnExit(stopped);

            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(Error::init(format!(
                        "failed to build cell runtime: {err}"
                    ))));
                    return;
                }
            };

            let _context = tokio_rt.enter();
            let (core, ready_rx) = match CellCore::new(&id, config, &host) {
                Ok(core) => {
                    let _ = init_tx.send(Ok(()));
                    core
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            let mut core = core;
            tokio_rt.block_on(core.run(cmd_rx, ready_rx, stop_rx));
        })?;

    let thread_id = thread.thread().id();
    match init_rx.recv() {
        Ok(Ok(())) => Ok(CellThread {
            commands: cmd_tx,
            stop: stop_tx,
            thread_id,
        }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::init(format!(
            "cell[{cell_id}] thread exited during initialization"
        ))),
    }
}

struct CellCore {
    id: String,
    interpreter: Interpreter,
    task_loop: TaskLoop,
    services: Arc<CellServices>,
}

impl CellCore {
    fn new(
        id: &str,
        config: CellConfig,
        host: &HostServices,
    ) -> Result<(Self, mpsc::Receiver<Option<TaskId>>)> {
        let (ready, ready_rx) = ready_channel(config.ready_channel_capacity());
        let task_loop = TaskLoop::new(Background::new(host.background.clone(), ready));
        let services = Arc::new(CellServices::new(id, &config, host)?);
        let interpreter = Interpreter::new(task_loop.clone(), services.clone())?;
        tracing::debug!(cell = %id, "cell started");

        Ok((
            Self {
                id: id.to_string(),
                interpreter,
                task_loop,
                services,
            },
            ready_rx,
        ))
    }

    async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<CellCommand>,
        mut ready: mpsc::Receiver<Option<TaskId>>,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(signal) = ready.recv() => self.handle_ready(signal),
            }
        }

        let cancelled = self.task_loop.close();
        tracing::debug!(cell = %self.id, cancelled, "cell loop stopped");
    }

    fn handle_command(&mut self, command: CellCommand) {
        match command {
            CellCommand::Run {
                source,
                mode,
                responder,
            } => {
                let _ = responder.send(self.interpreter.run_as(&source, mode));
            }
            CellCommand::Compile {
                name,
                source,
                responder,
            } => {
                let _ = responder.send(self.interpreter.compile(&name, &source));
            }
            CellCommand::RunCompiled { id, responder } => {
                let _ = responder.send(self.interpreter.run_compiled(id));
            }
            CellCommand::Get { path, responder } => {
                let _ = responder.send(self.interpreter.get(&path));
            }
            CellCommand::Set {
                path,
                value,
                responder,
            } => {
                let _ = responder.send(self.interpreter.set(&path, &value));
            }
            CellCommand::Call {
                path,
                this,
                args,
                mode,
                responder,
            } => {
                let result = self.interpreter.call_as(&path, this.as_ref(), &args, mode);
                let _ = responder.send(result);
            }
            CellCommand::ToValue { value, responder } => {
                let _ = responder.send(self.interpreter.to_value(&value));
            }
            CellCommand::CallFunction {
                id,
                args,
                responder,
            } => {
                let _ = responder.send(self.interpreter.call_function(id, &args));
            }
            CellCommand::ReleaseFunction { id, responder } => {
                let _ = responder.send(self.interpreter.release_function(id));
            }
            CellCommand::PendingTasks { responder } => {
                let _ = responder.send(Ok(self.task_loop.pending_count()));
            }
            CellCommand::FunctionCount { responder } => {
                let _ = responder.send(Ok(self.interpreter.function_count()));
            }
        }
    }

    fn handle_ready(&mut self, signal: Option<TaskId>) {
        // `None` only wakes the loop.
        let Some(id) = signal else {
            return;
        };

        let Err(err) = self.task_loop.process(id, &mut self.interpreter) else {
            return;
        };
        tracing::error!(cell = %self.id, error = %err, "task failed, pending tasks cancelled");
        if let Error::TaskExecution {
            task_id,
            kind,
            message,
        } = err
        {
            self.services.emit(Signal::TaskError {
                chat_id: self.id.clone(),
                task_id,
                kind: kind.to_string(),
                message,
            });
        }
    }
}
