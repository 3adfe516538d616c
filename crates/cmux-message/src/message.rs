// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{MessageId, MessageMetadata, Part};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a workspace conversation: an ordered part sequence plus
/// metadata.  Serialized one-per-line into `chat.jsonl` and as the single
/// record of `partial.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            parts,
            metadata: MessageMetadata {
                timestamp: Some(Utc::now()),
                ..Default::default()
            },
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// The empty assistant message appended to history at stream start to
    /// reserve a `history_sequence` and message id.  Its content is filled
    /// in by `HistoryStore::update` when the stream completes.
    pub fn assistant_placeholder(model: impl Into<String>) -> Self {
        let mut m = Self::new(Role::Assistant, Vec::new());
        m.metadata.model = Some(model.into());
        m
    }

    /// True when the message has at least one `Text` or `DynamicTool` part.
    /// A completed assistant message must satisfy this; reasoning-only
    /// messages are filtered from outbound history.
    pub fn has_visible_content(&self) -> bool {
        self.parts.iter().any(Part::is_visible)
    }

    /// Concatenation of all `Text` parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn is_partial(&self) -> bool {
        self.metadata.is_partial()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
