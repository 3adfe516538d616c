// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The workspace stream engine.
//!
//! Per workspace, at most one model stream is in flight at a time.  A
//! [`StreamSession`] consumes the provider part stream, accumulates the
//! assistant message, persists throttled snapshots for crash resilience,
//! and emits lifecycle events.  The [`StreamManager`] enforces the
//! one-session-per-workspace rule with atomic takeover, and [`AiService`]
//! assembles requests end to end: history normalization, model
//! resolution, tool selection, placeholder reservation, and the
//! commit-on-abort hook.

mod events;
mod manager;
mod service;
mod session;

pub use events::StreamEvent;
pub use manager::StreamManager;
pub use service::{
    AiService, ModelResolver, SendMessageError, SendMessageRequest, SystemMessageBuilder,
    ThinkingLevel, ToolPolicy, ToolResolver,
};
pub use session::{SessionConfig, StreamState};
