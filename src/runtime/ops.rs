//! Host ops exposed to the script glue.
//!
//! All ops are synchronous and run on the cell thread while script is
//! executing, with the op state already borrowed. They never go through the
//! cell command channel. Anything slow is turned into a loop task instead.

use crate::runtime::event_loop::{FetchRequest, FetchTask, PromiseTask, RpcTask, TaskId, TaskLoop, TimerTask};
use crate::runtime::services::CellServices;
use crate::signal::Signal;
use deno_core::{op2, Extension, OpState};
use deno_error::JsErrorBox;
use std::borrow::Cow;
use std::sync::Arc;

fn task_loop(state: &OpState) -> TaskLoop {
    state.borrow::<TaskLoop>().clone()
}

fn services(state: &OpState) -> Arc<CellServices> {
    state.borrow::<Arc<CellServices>>().clone()
}

#[op2(fast)]
fn op_timer_start(state: &mut OpState, delay: f64, repeat: bool) -> f64 {
    let delay = services(state).config.timer_delay(delay, repeat);
    task_loop(state).add(TimerTask::new(delay, repeat)) as f64
}

#[op2(fast)]
fn op_task_clear(state: &mut OpState, id: f64) -> bool {
    task_loop(state).remove(id as TaskId)
}

#[op2(fast)]
fn op_promise_defer(state: &mut OpState) -> f64 {
    task_loop(state).add(PromiseTask::new()) as f64
}

#[op2]
fn op_fetch_start(state: &mut OpState, #[serde] request: FetchRequest) -> f64 {
    let client = services(state).fetch.clone();
    task_loop(state).add(FetchTask::new(client, request)) as f64
}

#[op2]
#[string]
fn op_jeth_send(state: &mut OpState, #[string] payload: String) -> String {
    services(state).rpc.send(&payload).to_string()
}

#[op2(fast)]
fn op_jeth_send_async(state: &mut OpState, #[string] payload: String) -> f64 {
    let bridge = services(state).rpc.clone();
    task_loop(state).add(RpcTask::new(bridge, payload)) as f64
}

#[op2(fast)]
fn op_jeth_is_connected(state: &mut OpState) -> bool {
    services(state).rpc.is_connected()
}

#[op2(fast)]
fn op_console(state: &mut OpState, #[string] level: String, #[string] message: String) {
    let services = services(state);
    tracing::debug!(target: "jailcell::console", cell = %services.cell_id, level = %level, "{message}");
    if services.config.enable_console {
        services.emit(Signal::Console {
            chat_id: services.cell_id.clone(),
            level,
            message,
        });
    }
}

#[op2]
fn op_signal(
    state: &mut OpState,
    #[string] kind: String,
    #[serde] event: serde_json::Value,
) -> Result<(), JsErrorBox> {
    let services = services(state);
    let signal = Signal::from_script(&kind, &services.cell_id, event)
        .ok_or_else(|| JsErrorBox::new("TypeError", format!("unknown signal type '{kind}'")))?;
    services.emit(signal);
    Ok(())
}

/// Extension carrying every cell op. Task loop and services are put into
/// the op state after the runtime is created.
pub(crate) fn cell_extension() -> Extension {
    const OP_TIMER_START: deno_core::OpDecl = op_timer_start();
    const OP_TASK_CLEAR: deno_core::OpDecl = op_task_clear();
    const OP_PROMISE_DEFER: deno_core::OpDecl = op_promise_defer();
    const OP_FETCH_START: deno_core::OpDecl = op_fetch_start();
    const OP_JETH_SEND: deno_core::OpDecl = op_jeth_send();
    const OP_JETH_SEND_ASYNC: deno_core::OpDecl = op_jeth_send_async();
    const OP_JETH_IS_CONNECTED: deno_core::OpDecl = op_jeth_is_connected();
    const OP_CONSOLE: deno_core::OpDecl = op_console();
    const OP_SIGNAL: deno_core::OpDecl = op_signal();

    Extension {
        name: "jailcell",
        ops: Cow::Borrowed(&[
            OP_TIMER_START,
            OP_TASK_CLEAR,
            OP_PROMISE_DEFER,
            OP_FETCH_START,
            OP_JETH_SEND,
            OP_JETH_SEND_ASYNC,
            OP_JETH_IS_CONNECTED,
            OP_CONSOLE,
            OP_SIGNAL,
        ]),
        ..Default::default()
    }
}
