//! Notifications from cells to the host.
//!
//! Each signal serializes to an envelope `{"type": ..., "event": {...}}`.

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "event")]
pub enum Signal {
    /// `console.*` output.
    #[serde(rename = "vm.console")]
    Console {
        chat_id: String,
        level: String,
        message: String,
    },
    /// `statusSignals.sendMessage`
    #[serde(rename = "jail.send_message")]
    SendMessage { chat_id: String, message: Value },
    /// `statusSignals.showSuggestions`
    #[serde(rename = "jail.show_suggestions")]
    ShowSuggestions { chat_id: String, markup: Value },
    /// A loop task failed and its siblings were cancelled.
    #[serde(rename = "jail.task_error")]
    TaskError {
        chat_id: String,
        task_id: i64,
        kind: String,
        message: String,
    },
}

impl Signal {
    pub const SEND_MESSAGE: &'static str = "jail.send_message";
    pub const SHOW_SUGGESTIONS: &'static str = "jail.show_suggestions";

    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Console { .. } => "vm.console",
            Signal::SendMessage { .. } => Self::SEND_MESSAGE,
            Signal::ShowSuggestions { .. } => Self::SHOW_SUGGESTIONS,
            Signal::TaskError { .. } => "jail.task_error",
        }
    }

    pub fn chat_id(&self) -> &str {
        match self {
            Signal::Console { chat_id, .. }
            | Signal::SendMessage { chat_id, .. }
            | Signal::ShowSuggestions { chat_id, .. }
            | Signal::TaskError { chat_id, .. } => chat_id,
        }
    }

    /// Build a signal raised by script through `statusSignals`.
    pub fn from_script(kind: &str, chat_id: &str, mut event: Value) -> Option<Self> {
        let chat_id = chat_id.to_string();
        match kind {
            Self::SEND_MESSAGE => Some(Signal::SendMessage {
                chat_id,
                message: event.get_mut("message").map(Value::take).unwrap_or_default(),
            }),
            Self::SHOW_SUGGESTIONS => Some(Signal::ShowSuggestions {
                chat_id,
                markup: event.get_mut("markup").map(Value::take).unwrap_or_default(),
            }),
            _ => None,
        }
    }

    pub fn to_envelope(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Host callback receiving every signal. Called on the cell thread; it must
/// not call back into the same cell synchronously.
pub type SignalHandler = Arc<dyn Fn(&Signal) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let signal = Signal::Console {
            chat_id: "chat".to_string(),
            level: "log".to_string(),
            message: "hello".to_string(),
        };
        let envelope: Value = serde_json::from_str(&signal.to_envelope().unwrap()).unwrap();
        assert_eq!(
            envelope,
            json!({"type": "vm.console", "event": {"chat_id": "chat", "level": "log", "message": "hello"}})
        );
        assert_eq!(signal.kind(), "vm.console");
    }

    #[test]
    fn test_from_script() {
        let signal =
            Signal::from_script("jail.send_message", "chat", json!({"message": "hi"})).unwrap();
        assert_eq!(
            signal,
            Signal::SendMessage {
                chat_id: "chat".to_string(),
                message: json!("hi"),
            }
        );
        assert_eq!(signal.chat_id(), "chat");
        assert!(Signal::from_script("jail.unknown", "chat", Value::Null).is_none());
    }
}
