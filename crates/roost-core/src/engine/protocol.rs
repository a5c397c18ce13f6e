// ABOUTME: Line framing between roost and the assistant engine subprocess
// ABOUTME: JSON frames on stdin; JSON frames, an end marker, or raw text lines on stdout

use crate::registry::ExtensionInfo;
use crate::types::{Message, Role};
use serde::{Deserialize, Serialize};

/// One history entry as handed to the engine.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub seq: i64,
    pub role: Role,
    pub body: String,
    pub completed: bool,
}

impl From<Message> for HistoryEntry {
    fn from(msg: Message) -> Self {
        Self {
            seq: msg.seq,
            role: msg.role,
            body: msg.body,
            completed: msg.completed,
        }
    }
}

/// Frames written to the engine's stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineInput {
    /// Sent once after spawn
    Context {
        session_id: String,
        title: String,
        provider: String,
        model: String,
        extensions: Vec<ExtensionInfo>,
        history: Vec<HistoryEntry>,
    },
    /// One user turn
    Prompt { text: String },
}

impl EngineInput {
    /// Serialize as a single newline-terminated line
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// What a line of engine output means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    Ready,
    Delta(String),
    /// End of the turn, optionally with the authoritative full text
    End(Option<String>),
    Error(String),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputFrame {
    Ready,
    Delta {
        text: String,
    },
    End {
        #[serde(default)]
        text: Option<String>,
    },
    Error {
        message: String,
    },
}

impl From<OutputFrame> for EngineOutput {
    fn from(frame: OutputFrame) -> Self {
        match frame {
            OutputFrame::Ready => EngineOutput::Ready,
            OutputFrame::Delta { text } => EngineOutput::Delta(text),
            OutputFrame::End { text } => EngineOutput::End(text),
            OutputFrame::Error { message } => EngineOutput::Error(message),
        }
    }
}

/// Interpret one stdout line.
///
/// Anything that is neither a frame nor the end marker is response text,
/// blank lines included, so paragraph breaks survive.
pub fn parse_line(line: &str, end_marker: &str) -> EngineOutput {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim();
    if trimmed == end_marker {
        return EngineOutput::End(None);
    }

    if trimmed.starts_with('{') {
        match serde_json::from_str::<OutputFrame>(trimmed) {
            Ok(frame) => return frame.into(),
            Err(e) => {
                let preview: String = trimmed.chars().take(200).collect();
                tracing::debug!(error = %e, line = %preview, "Engine line is not a frame, treating as text");
            }
        }
    }

    EngineOutput::Delta(format!("{line}\n"))
}
