// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Serialize;
use serde_json::Value;

/// Role in the provider message representation.  Unlike the engine-level
/// model, tool results live on their own role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    User,
    Assistant,
    Tool,
}

/// One content block of a provider message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Reasoning { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { id: String, output: Value },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

/// A message in the shape providers consume: role, content blocks, and an
/// optional prompt-cache breakpoint on the message boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderMessage {
    pub role: ProviderRole,
    pub blocks: Vec<ContentBlock>,
    /// Set on the boundary the provider should cache up to.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cache_hint: bool,
}

impl ProviderMessage {
    pub fn new(role: ProviderRole, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            blocks,
            cache_hint: false,
        }
    }

    pub fn user(blocks: Vec<ContentBlock>) -> Self {
        Self::new(ProviderRole::User, blocks)
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self::new(ProviderRole::Assistant, blocks)
    }

    pub fn tool(blocks: Vec<ContentBlock>) -> Self {
        Self::new(ProviderRole::Tool, blocks)
    }

    /// True when every block is plain text (mergeable with a same-role
    /// neighbor).
    pub fn is_text_only(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| matches!(b, ContentBlock::Text { .. }))
    }

    /// Concatenation of the text blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}
