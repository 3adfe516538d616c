// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StreamErrorKind;

/// Token usage for one completed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    /// Output tokens *excluding* reasoning.
    pub output_tokens: u64,
    /// Input tokens served from the provider's prompt cache.
    pub cached_input_tokens: u64,
    pub reasoning_tokens: u64,
}

/// Per-message metadata.  Every field is optional and unknown fields are
/// ignored on read, so records written by newer versions stay readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Monotone per-workspace ordering key, assigned by the history store
    /// at append time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Provider-qualified model string, e.g. `"anthropic:claude-opus-4-1"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// True when this message is an in-flight or interrupted stream snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<StreamErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Opaque provider-specific bag (cache fields, response correlation ids).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<Value>,
    /// True for messages the engine fabricated (the interruption sentinel).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl MessageMetadata {
    /// Overlay `other` onto `self`: fields set in `other` win, fields left
    /// `None` in `other` keep the current value.  Used at stream completion
    /// to merge session-start metadata with computed usage and duration.
    pub fn merge(&mut self, other: MessageMetadata) {
        macro_rules! take {
            ($($field:ident),+ $(,)?) => {
                $(if other.$field.is_some() { self.$field = other.$field; })+
            };
        }
        take!(
            history_sequence,
            timestamp,
            model,
            partial,
            error,
            error_type,
            system_message_tokens,
            usage,
            provider_metadata,
            synthetic,
            duration_ms,
        );
    }

    pub fn is_partial(&self) -> bool {
        self.partial.unwrap_or(false)
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic.unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
