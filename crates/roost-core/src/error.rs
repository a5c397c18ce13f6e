// ABOUTME: Error types for the roost-core crate.
// ABOUTME: One taxonomy for storage, sequencing, engine and arbitration failures.

use thiserror::Error;

/// Errors surfaced by the session and streaming coordination layer.
#[derive(Error, Debug)]
pub enum RoostError {
    /// Storage I/O or database failure. Fatal to the operation; session state is unchanged.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt record in session '{session_id}': {detail}")]
    CorruptRecord { session_id: String, detail: String },

    /// The session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// An in-flight response already exists for the session.
    #[error("session '{session_id}' already has an in-flight message (seq {seq})")]
    DuplicateInFlight { session_id: String, seq: i64 },

    /// A finalize targeted a message that is not the current in-flight one.
    #[error("sequence mismatch in session '{session_id}': expected {expected:?}, got {actual}")]
    SequenceMismatch {
        session_id: String,
        expected: Option<i64>,
        actual: i64,
    },

    /// The engine subprocess could not be started.
    #[error("failed to start engine: {0}")]
    EngineSpawn(String),

    /// The engine subprocess exited unexpectedly.
    #[error("engine for session '{session_id}' crashed: {detail}")]
    EngineCrashed { session_id: String, detail: String },

    /// The engine is still streaming the previous response.
    #[error("engine for session '{0}' is busy streaming a response")]
    EngineBusy(String),

    /// The engine process is no longer running.
    #[error("engine for session '{0}' is not running")]
    EngineStopped(String),

    /// Another process currently owns the session.
    #[error("session '{session_id}' is owned by another process ({owner})")]
    LockContention { session_id: String, owner: String },

    /// The extension name is not in the catalog.
    #[error("unknown extension: {0}")]
    UnknownExtension(String),
}

/// Result alias used throughout roost-core.
pub type Result<T> = std::result::Result<T, RoostError>;

impl RoostError {
    /// Short hint a front-end can show next to the error.
    pub fn user_hint(&self) -> &'static str {
        match self {
            RoostError::Storage(_) | RoostError::CorruptRecord { .. } => {
                "storage problem, see logs"
            }
            RoostError::SessionNotFound(_) => "session no longer exists",
            RoostError::DuplicateInFlight { .. }
            | RoostError::SequenceMismatch { .. }
            | RoostError::EngineBusy(_) => "try again",
            RoostError::EngineSpawn(_) => "check the engine installation",
            RoostError::EngineCrashed { .. } | RoostError::EngineStopped(_) => {
                "engine stopped, resend the message to retry"
            }
            RoostError::LockContention { .. } => "session busy elsewhere",
            RoostError::UnknownExtension(_) => "pick one of the available extensions",
        }
    }

    /// Whether the condition is expected to clear on its own if the user retries later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RoostError::LockContention { .. } | RoostError::EngineBusy(_)
        )
    }
}
