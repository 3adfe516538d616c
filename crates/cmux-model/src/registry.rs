// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider registry: the behavioral facts the engine needs about each
//! supported provider, and parsing of provider-qualified model strings.
//!
//! This is the single source of truth for provider ids and their
//! normalization/usage quirks.  Transport construction lives in the host
//! application.

use thiserror::Error;

/// How a provider handles chain-of-thought state across turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningHandling {
    /// Reasoning parts are echoed back inline in the outbound history.
    InlineHistory,
    /// The provider tracks reasoning out-of-band (prior-response
    /// correlation); reasoning parts are stripped from outbound history.
    OutOfBand,
}

/// Static per-provider facts consulted by the normalizer and by usage
/// computation at stream end.
#[derive(Debug, Clone)]
pub struct ProviderBehavior {
    /// Provider id as it appears before the `:` in a model string.
    pub id: &'static str,
    pub reasoning: ReasoningHandling,
    /// Rejects tool-use blocks without an immediately following tool-result
    /// block; requires the content splitter and validator.
    pub strict_tool_blocks: bool,
    /// Supports prompt-cache breakpoints on message boundaries.
    pub cache_hints: bool,
    /// Reports `output_tokens` inclusive of reasoning tokens, which the
    /// session subtracts so `output_tokens` always excludes reasoning.
    pub reasoning_in_output_tokens: bool,
    /// Provider-metadata field holding cache-read tokens when the top-level
    /// usage does not populate them.
    pub cache_read_metadata_field: Option<&'static str>,
    /// Environment variable expected to hold the API key.
    pub default_api_key_env: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Anthropic,
    OpenAi,
}

static ANTHROPIC: ProviderBehavior = ProviderBehavior {
    id: "anthropic",
    reasoning: ReasoningHandling::InlineHistory,
    strict_tool_blocks: true,
    cache_hints: true,
    reasoning_in_output_tokens: false,
    cache_read_metadata_field: Some("cache_read_input_tokens"),
    default_api_key_env: "ANTHROPIC_API_KEY",
};

static OPENAI: ProviderBehavior = ProviderBehavior {
    id: "openai",
    reasoning: ReasoningHandling::OutOfBand,
    strict_tool_blocks: false,
    cache_hints: false,
    reasoning_in_output_tokens: true,
    cache_read_metadata_field: None,
    default_api_key_env: "OPENAI_API_KEY",
};

impl Provider {
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        self.behavior().id
    }

    pub fn behavior(&self) -> &'static ProviderBehavior {
        match self {
            Self::Anthropic => &ANTHROPIC,
            Self::OpenAi => &OPENAI,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelSpecError {
    #[error("invalid model string {0:?}: expected \"provider:model-id\"")]
    InvalidFormat(String),
    #[error("unsupported provider {0:?}")]
    UnknownProvider(String),
}

/// A parsed `"provider:model-id"` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: Provider,
    pub model_id: String,
}

impl ModelSpec {
    pub fn parse(s: &str) -> Result<Self, ModelSpecError> {
        let (provider_id, model_id) = s
            .split_once(':')
            .ok_or_else(|| ModelSpecError::InvalidFormat(s.to_string()))?;
        if provider_id.is_empty() || model_id.is_empty() {
            return Err(ModelSpecError::InvalidFormat(s.to_string()));
        }
        let provider = Provider::from_id(provider_id)
            .ok_or_else(|| ModelSpecError::UnknownProvider(provider_id.to_string()))?;
        Ok(Self {
            provider,
            model_id: model_id.to_string(),
        })
    }

    /// The provider-qualified form, e.g. `"anthropic:claude-opus-4-1"`.
    pub fn qualified(&self) -> String {
        format!("{}:{}", self.provider.id(), self.model_id)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
