// ABOUTME: Core types for roost - Session, Message, TokenEvent, RelayEvent
// ABOUTME: These are the data structures that flow between store, engine, relay and front-ends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Provider and model recorded on a session when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub provider: String,
    pub model: String,
}

/// Values applied to every newly created session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDefaults {
    pub extensions: BTreeSet<String>,
    pub provider: ProviderSnapshot,
}

/// A persisted conversation and its configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub extensions: BTreeSet<String>,
    pub provider: ProviderSnapshot,
}

/// Listing entry for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: i64,
}

/// One entry in a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub seq: i64,
    pub role: Role,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub completed: bool,
    /// Set when the response was cut short by a stop or an engine crash.
    pub interrupted: bool,
}

impl Message {
    /// True for the single response currently being streamed.
    pub fn is_in_flight(&self) -> bool {
        !self.completed && !self.interrupted
    }
}

/// A session together with its replayed history.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session: Session,
    pub messages: Vec<Message>,
}

/// Sequence numbers assigned by a `send_message` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub user_seq: i64,
    pub response_seq: i64,
}

/// One incremental unit of streamed response text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEvent {
    pub session_id: String,
    pub seq: i64,
    pub delta: String,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Everything a subscriber can observe on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// The subscriber has not missed any partial response.
    CaughtUp { session_id: String },
    /// Snapshot of a response already streaming when the subscriber joined.
    InFlight {
        session_id: String,
        seq: i64,
        partial: String,
    },
    /// A user turn was accepted (possibly from another front-end).
    UserMessage {
        session_id: String,
        seq: i64,
        body: String,
    },
    /// The engine started producing the response with this sequence number.
    ResponseStarted { session_id: String, seq: i64 },
    /// Streamed text.
    Token(TokenEvent),
    /// The response was stopped before completion.
    Interrupted { session_id: String, seq: i64 },
    /// The engine exited while streaming.
    EngineCrashed {
        session_id: String,
        seq: Option<i64>,
        detail: String,
    },
    /// The engine reported an error frame.
    EngineError { session_id: String, message: String },
    /// The session was closed; no further events follow.
    SessionClosed { session_id: String },
}

impl RelayEvent {
    pub fn session_id(&self) -> &str {
        match self {
            RelayEvent::CaughtUp { session_id }
            | RelayEvent::InFlight { session_id, .. }
            | RelayEvent::UserMessage { session_id, .. }
            | RelayEvent::ResponseStarted { session_id, .. }
            | RelayEvent::Interrupted { session_id, .. }
            | RelayEvent::EngineCrashed { session_id, .. }
            | RelayEvent::EngineError { session_id, .. }
            | RelayEvent::SessionClosed { session_id } => session_id,
            RelayEvent::Token(token) => &token.session_id,
        }
    }
}

/// Lifecycle of an engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Starting,
    Streaming,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Starting => "starting",
            EngineState::Streaming => "streaming",
            EngineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Holder of a session's cross-process engine lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub session_id: String,
    pub owner: String,
    pub heartbeat_at: DateTime<Utc>,
}
