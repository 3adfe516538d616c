// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use cmux_message::{MessageId, MessageMetadata, Part, StreamErrorKind, WorkspaceId};
use serde_json::Value;

/// Lifecycle events of one workspace stream.
///
/// Emitted in arrival order: deltas for earlier parts precede deltas for
/// later parts, and the terminal event (`StreamEnd`, `StreamAbort` or
/// `Error`) follows everything else.  When a stream is taken over, the old
/// stream's `StreamAbort` precedes the new stream's `StreamStart`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    StreamStart {
        workspace_id: WorkspaceId,
        message_id: MessageId,
        model: String,
        history_sequence: u64,
    },
    StreamDelta {
        workspace_id: WorkspaceId,
        message_id: MessageId,
        delta: String,
    },
    ReasoningDelta {
        workspace_id: WorkspaceId,
        message_id: MessageId,
        delta: String,
    },
    ReasoningEnd {
        workspace_id: WorkspaceId,
        message_id: MessageId,
    },
    ToolCallStart {
        workspace_id: WorkspaceId,
        message_id: MessageId,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolCallEnd {
        workspace_id: WorkspaceId,
        message_id: MessageId,
        tool_call_id: String,
        tool_name: String,
        output: Value,
    },
    StreamEnd {
        workspace_id: WorkspaceId,
        message_id: MessageId,
        parts: Vec<Part>,
        metadata: MessageMetadata,
    },
    StreamAbort {
        workspace_id: WorkspaceId,
        message_id: MessageId,
    },
    Error {
        workspace_id: WorkspaceId,
        message_id: MessageId,
        error: String,
        error_type: StreamErrorKind,
    },
}

impl StreamEvent {
    pub fn workspace_id(&self) -> &WorkspaceId {
        match self {
            Self::StreamStart { workspace_id, .. }
            | Self::StreamDelta { workspace_id, .. }
            | Self::ReasoningDelta { workspace_id, .. }
            | Self::ReasoningEnd { workspace_id, .. }
            | Self::ToolCallStart { workspace_id, .. }
            | Self::ToolCallEnd { workspace_id, .. }
            | Self::StreamEnd { workspace_id, .. }
            | Self::StreamAbort { workspace_id, .. }
            | Self::Error { workspace_id, .. } => workspace_id,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::StreamStart { message_id, .. }
            | Self::StreamDelta { message_id, .. }
            | Self::ReasoningDelta { message_id, .. }
            | Self::ReasoningEnd { message_id, .. }
            | Self::ToolCallStart { message_id, .. }
            | Self::ToolCallEnd { message_id, .. }
            | Self::StreamEnd { message_id, .. }
            | Self::StreamAbort { message_id, .. }
            | Self::Error { message_id, .. } => message_id,
        }
    }
}
