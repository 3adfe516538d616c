use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a tool invocation inside an assistant message.
///
/// A part is recorded with `InputAvailable` the moment the model requests
/// the call, so that an interruption before the result still persists the
/// attempt.  It moves to `OutputAvailable` when the result arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    InputAvailable,
    OutputAvailable,
}

/// One tagged unit of assistant (or user) content.
///
/// `Reasoning` is the model's chain-of-thought stream, persisted separately
/// from visible text; providers that manage reasoning state out-of-band
/// never see it echoed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    DynamicTool {
        tool_call_id: String,
        tool_name: String,
        state: ToolState,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    /// A tool part in its initial state, before the result has arrived.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::DynamicTool {
            tool_call_id: id.into(),
            tool_name: name.into(),
            state: ToolState::InputAvailable,
            input,
            output: None,
        }
    }

    /// A tool part carrying its result.
    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
        output: Value,
    ) -> Self {
        Self::DynamicTool {
            tool_call_id: id.into(),
            tool_name: name.into(),
            state: ToolState::OutputAvailable,
            input,
            output: Some(output),
        }
    }

    /// True for content that counts toward a "non-empty" assistant message:
    /// text and tool calls, but not reasoning.
    pub fn is_visible(&self) -> bool {
        matches!(self, Self::Text { .. } | Self::DynamicTool { .. })
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self, Self::Reasoning { .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_reasoning(&self) -> Option<&str> {
        match self {
            Self::Reasoning { text } => Some(text),
            _ => None,
        }
    }

    /// The `tool_call_id` when this is a tool part.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::DynamicTool { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
