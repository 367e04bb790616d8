//! Deferred flush of script promise reactions.

use super::{Background, DispatchKind, Task, TaskContext, TaskId, TaskState};
use crate::error::Result;
use tokio::task::AbortHandle;

/// Flushes the script promise job queue on a later loop tick.
#[derive(Default)]
pub struct PromiseTask {
    id: TaskId,
    pending: Option<AbortHandle>,
}

impl PromiseTask {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Task for PromiseTask {
    fn set_id(&mut self, id: TaskId) {
        self.id = id;
    }

    fn id(&self) -> TaskId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "promise"
    }

    fn start(&mut self, background: &Background) {
        self.pending = Some(background.ready_when(self.id, async {}));
    }

    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskState> {
        self.pending = None;
        cx.host()
            .dispatch(DispatchKind::Promise, self.id, serde_json::Value::Null)?;
        Ok(TaskState::Finished)
    }

    fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}
