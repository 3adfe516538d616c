// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Categorical stream error kinds.  These travel in `error` events and in
/// the `error_type` metadata of persisted partials; the UI keys its
/// presentation off them rather than off raw provider messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    /// `"provider:model"` string could not be parsed.
    InvalidModelString,
    ProviderNotSupported,
    ApiKeyNotFound,
    /// 401 from the transport.
    Authentication,
    /// 429 from the transport; the caller may retry.
    RateLimit,
    /// 5xx from the transport.
    ServerError,
    Network,
    ContextExceeded,
    Quota,
    /// Cooperative cancellation; surfaced as `stream-abort`, not `error`.
    Aborted,
    RetryFailed,
    Unknown,
}

impl StreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidModelString => "invalid_model_string",
            Self::ProviderNotSupported => "provider_not_supported",
            Self::ApiKeyNotFound => "api_key_not_found",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::ContextExceeded => "context_exceeded",
            Self::Quota => "quota",
            Self::Aborted => "aborted",
            Self::RetryFailed => "retry_failed",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
