//! `setTimeout`, `setInterval` and `setImmediate` as loop tasks.

use super::{Background, DispatchKind, Task, TaskContext, TaskId, TaskState};
use crate::error::Result;
use std::time::Duration;
use tokio::task::AbortHandle;

/// One-shot or repeating timer. The delay is already clamped to its floor.
pub struct TimerTask {
    id: TaskId,
    delay: Duration,
    repeat: bool,
    stopped: bool,
    sleeping: Option<AbortHandle>,
}

impl TimerTask {
    pub fn new(delay: Duration, repeat: bool) -> Self {
        Self {
            id: 0,
            delay,
            repeat,
            stopped: false,
            sleeping: None,
        }
    }
}

impl Task for TimerTask {
    fn set_id(&mut self, id: TaskId) {
        self.id = id;
    }

    fn id(&self) -> TaskId {
        self.id
    }

    fn kind(&self) -> &'static str {
        if self.repeat {
            "interval"
        } else {
            "timeout"
        }
    }

    fn start(&mut self, background: &Background) {
        if self.stopped {
            return;
        }
        self.sleeping = Some(background.ready_after(self.id, self.delay));
    }

    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskState> {
        self.sleeping = None;
        if self.stopped {
            return Ok(TaskState::Finished);
        }

        let delivered = cx.host().dispatch(
            DispatchKind::Timer,
            self.id,
            serde_json::Value::Bool(self.repeat),
        )?;

        // Intervals only re-arm after the callback has returned.
        if self.repeat && delivered && !cx.is_cancelled() {
            self.start(cx.background());
            return Ok(TaskState::Rearmed);
        }
        Ok(TaskState::Finished)
    }

    fn cancel(&mut self) {
        self.stopped = true;
        if let Some(sleeping) = self.sleeping.take() {
            sleeping.abort();
        }
    }
}
