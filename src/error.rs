//! Error types for jail cells.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the jail.
#[derive(Error, Debug)]
pub enum Error {
    /// Script failed to compile. The message is the interpreter's own.
    #[error("{0}")]
    Syntax(String),

    /// Script threw while running.
    #[error("{0}")]
    Runtime(String),

    /// A scheduled task failed inside the loop.
    #[error("task {task_id} ({kind}) failed: {message}")]
    TaskExecution {
        task_id: i64,
        kind: &'static str,
        message: String,
    },

    /// Network or RPC transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("cell[{0}] doesn't exist")]
    CellNotFound(String),

    #[error("cell[{0}] already exists")]
    CellExists(String),

    #[error("cell[{0}] has been stopped")]
    AlreadyStopped(String),

    /// A cell handle was used from the cell's own loop thread.
    #[error("cell[{0}] cannot be called from its own loop thread")]
    ReentrantCall(String),

    /// Value could not cross the host/script boundary.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Interpreter or loop failed to start.
    #[error("Initialization error: {0}")]
    Init(String),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify an interpreter error message as a syntax or runtime error.
    pub fn script(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains("SyntaxError") {
            Self::Syntax(message)
        } else {
            Self::Runtime(message)
        }
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn init(message: impl Into<String>) -> Self {
        Self::Init(message.into())
    }

    /// True for errors raised by script code rather than by the host.
    pub const fn is_script_error(&self) -> bool {
        matches!(self, Self::Syntax(_) | Self::Runtime(_))
    }
}
