// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use cmux_message::StreamErrorKind;
use thiserror::Error;

/// Errors surfaced by provider transports.
///
/// Structured variants map directly onto categories; everything else falls
/// through to the message scan in [`classify_message`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to load API key: {0}")]
    LoadApiKey(String),

    #[error("provider call failed with status {status}: {message}")]
    ApiCall { status: u16, message: String },

    #[error("provider retries exhausted: {0}")]
    RetryExhausted(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Map a provider error onto the categorical taxonomy.  Structured variants
/// take precedence over the substring scan.
pub fn classify_provider_error(err: &ProviderError) -> StreamErrorKind {
    match err {
        ProviderError::LoadApiKey(_) => StreamErrorKind::ApiKeyNotFound,
        ProviderError::ApiCall { status, message } => match status {
            401 | 403 => StreamErrorKind::Authentication,
            429 => StreamErrorKind::RateLimit,
            500..=599 => StreamErrorKind::ServerError,
            _ => classify_message(message),
        },
        ProviderError::RetryExhausted(_) => StreamErrorKind::RetryFailed,
        ProviderError::Other(e) => classify_message(&e.to_string()),
    }
}

/// Case-insensitive substring classification of an unstructured error
/// message.  Order matters: the more specific categories are checked first
/// so that e.g. "rate limit exceeded while authenticating" still reads as
/// a rate limit.
pub fn classify_message(message: &str) -> StreamErrorKind {
    let m = message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if contains_any(&["abort", "cancel"]) {
        StreamErrorKind::Aborted
    } else if contains_any(&["context length", "context_length", "context window", "prompt is too long", "too many tokens"]) {
        StreamErrorKind::ContextExceeded
    } else if contains_any(&["rate limit", "rate_limit", "too many requests"]) {
        StreamErrorKind::RateLimit
    } else if contains_any(&["quota", "billing", "credit balance", "insufficient funds"]) {
        StreamErrorKind::Quota
    } else if contains_any(&["unauthorized", "authentication", "invalid api key", "invalid x-api-key", "forbidden"]) {
        StreamErrorKind::Authentication
    } else if contains_any(&["overloaded", "internal server error", "bad gateway", "service unavailable"]) {
        StreamErrorKind::ServerError
    } else if contains_any(&["network", "connection", "timed out", "timeout", "dns", "socket", "broken pipe"]) {
        StreamErrorKind::Network
    } else {
        StreamErrorKind::Unknown
    }
}

/// Unwrap a mid-stream error part payload.
///
/// Providers wrap stream errors in a JSON envelope like
/// `{"error":{"message":"...","type":"..."}}`.  Returns the innermost
/// human-readable message plus the envelope (when one existed) so the
/// caller can preserve it as the error's cause.
pub fn unwrap_stream_error(raw: &str) -> (String, Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return (raw.to_string(), None);
    };
    let inner = value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str());
    match inner {
        Some(message) => (message.to_string(), Some(raw.to_string())),
        None => (raw.to_string(), None),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
