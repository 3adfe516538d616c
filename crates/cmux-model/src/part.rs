use serde_json::Value;

/// One tagged unit of a provider part stream.
///
/// Framing variants (`Start`, `StartStep`, `TextStart`, `FinishStep`,
/// `Finish`) carry no payload the engine acts on; they exist because
/// provider SDKs emit them and the session must be able to skip them
/// explicitly rather than fail on an unknown part.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPart {
    Start,
    StartStep,
    TextStart,
    TextDelta(String),
    ReasoningDelta(String),
    ReasoningEnd,
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        output: Value,
    },
    /// Mid-stream error part.  The payload may be a bare message or a
    /// JSON envelope; see [`crate::unwrap_stream_error`].
    Error(String),
    FinishStep,
    Finish,
}

impl StreamPart {
    /// True for parts the session ignores entirely.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::Start | Self::StartStep | Self::TextStart | Self::FinishStep | Self::Finish
        )
    }
}
