// WebSocket message types for the parley-chat.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::RunStage;

/// All message types in the parley-chat.v1 WebSocket protocol.
///
/// Lifecycle frames are server -> client only and carry a per-run sequence
/// number that is strictly increasing and gapless in the delivered stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: JSON-level liveness probe.
    Ping,

    /// Server -> Client: reply to `ping`.
    Pong,

    /// Client -> Server: re-present a credential mid-connection.
    Authenticate { token: String },

    /// Server -> Client: acknowledgement of a successful `authenticate`.
    AuthenticateAck { user_id: Uuid, expires_at: i64 },

    /// Server -> Client: run accepted, lifecycle begins.
    Started { run_id: Uuid, user_id: Uuid, seq: i64, ts: String, thread_id: Uuid },

    /// Server -> Client: agent reasoning progress. May repeat.
    Thinking { run_id: Uuid, user_id: Uuid, seq: i64, ts: String, text: String },

    /// Server -> Client: a tool invocation has started.
    ExecutingTool {
        run_id: Uuid,
        user_id: Uuid,
        seq: i64,
        ts: String,
        invocation_id: Uuid,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Server -> Client: result of a previously announced tool invocation.
    ToolResult {
        run_id: Uuid,
        user_id: Uuid,
        seq: i64,
        ts: String,
        invocation_id: Uuid,
        output: serde_json::Value,
    },

    /// Server -> Client: terminal stage; no further events for this run.
    Completed { run_id: Uuid, user_id: Uuid, seq: i64, ts: String },

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl WsMessage {
    /// The wire `type` tag for this message.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Authenticate { .. } => "authenticate",
            Self::AuthenticateAck { .. } => "authenticate_ack",
            Self::Started { .. } => "started",
            Self::Thinking { .. } => "thinking",
            Self::ExecutingTool { .. } => "executing_tool",
            Self::ToolResult { .. } => "tool_result",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    /// The lifecycle stage this frame represents, if it is a lifecycle frame.
    pub fn run_stage(&self) -> Option<RunStage> {
        match self {
            Self::Started { .. } => Some(RunStage::Started),
            Self::Thinking { .. } => Some(RunStage::Thinking),
            Self::ExecutingTool { .. } => Some(RunStage::ExecutingTool),
            Self::ToolResult { .. } => Some(RunStage::ToolResult),
            Self::Completed { .. } => Some(RunStage::Completed),
            _ => None,
        }
    }

    /// The run this frame belongs to, if it is a lifecycle frame.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::Started { run_id, .. }
            | Self::Thinking { run_id, .. }
            | Self::ExecutingTool { run_id, .. }
            | Self::ToolResult { run_id, .. }
            | Self::Completed { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }

    /// The per-run sequence number, if it is a lifecycle frame.
    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Started { seq, .. }
            | Self::Thinking { seq, .. }
            | Self::ExecutingTool { seq, .. }
            | Self::ToolResult { seq, .. }
            | Self::Completed { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}
