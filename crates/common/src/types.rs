// Core domain types shared across all Parley crates.

use serde::{Deserialize, Serialize};

/// Lifecycle stage of an agent run.
///
/// A run moves through `Started → Thinking → (ExecutingTool → ToolResult)* →
/// Completed`. `Thinking` may repeat; tool stages occur zero or more times as
/// matched pairs; `Completed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Started,
    Thinking,
    ExecutingTool,
    ToolResult,
    Completed,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Thinking => "thinking",
            Self::ExecutingTool => "executing_tool",
            Self::ToolResult => "tool_result",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "thinking" => Some(Self::Thinking),
            "executing_tool" => Some(Self::ExecutingTool),
            "tool_result" => Some(Self::ToolResult),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// True once no further events are valid for the run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}
