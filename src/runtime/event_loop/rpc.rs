use super::{lock, Background, DispatchKind, Task, TaskContext, TaskId, TaskState};
use crate::error::Result;
use crate::rpc::{error_response, RpcBridge, INTERNAL_ERROR};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

/// `jeth.sendAsync`: forwards the payload on the blocking pool.
pub struct RpcTask {
    id: TaskId,
    bridge: RpcBridge,
    payload: Option<String>,
    response: Arc<Mutex<Option<Value>>>,
    in_flight: Option<AbortHandle>,
}

impl RpcTask {
    pub fn new(bridge: RpcBridge, payload: String) -> Self {
        Self {
            id: 0,
            bridge,
            payload: Some(payload),
            response: Arc::new(Mutex::new(None)),
            in_flight: None,
        }
    }
}

impl Task for RpcTask {
    fn set_id(&mut self, id: TaskId) {
        self.id = id;
    }

    fn id(&self) -> TaskId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "rpc"
    }

    fn start(&mut self, background: &Background) {
        let Some(payload) = self.payload.take() else {
            return;
        };
        let bridge = self.bridge.clone();
        let slot = self.response.clone();
        self.in_flight = Some(background.ready_when(self.id, async move {
            let response = tokio::task::spawn_blocking(move || bridge.send(&payload))
                .await
                .unwrap_or_else(|err| {
                    error_response(Value::Null, INTERNAL_ERROR, &format!("RPC worker failed: {err}"))
                });
            *lock(&slot) = Some(response);
        }));
    }

    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskState> {
        self.in_flight = None;
        let response = lock(&self.response).take().unwrap_or_else(|| {
            error_response(Value::Null, INTERNAL_ERROR, "RPC request finished without a response")
        });
        cx.host().dispatch(DispatchKind::Rpc, self.id, response)?;
        Ok(TaskState::Finished)
    }

    fn cancel(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort();
        }
    }
}
