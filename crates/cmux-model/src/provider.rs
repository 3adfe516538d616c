// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AbortSignal, Provider, ProviderError, StreamPart};
use crate::wire::ProviderMessage;

pub type PartStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamPart>> + Send>>;

/// A tool schema offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub parameters: Value,
}

/// Token usage as reported by the provider after stream termination.
///
/// `reasoning_tokens` is `None` when the provider does not report them;
/// the session estimates locally in that case.  Whether `output_tokens`
/// includes reasoning is provider-specific — see
/// [`crate::ProviderBehavior::reasoning_in_output_tokens`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub reasoning_tokens: Option<u64>,
}

/// Everything a transport needs for one streaming call.
///
/// The engine applies no overall timeout: reasoning models may pause for
/// minutes, and the transport is expected to run without a body deadline.
/// Cancellation arrives solely through `abort`.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub messages: Vec<ProviderMessage>,
    pub system: String,
    pub tools: Vec<ToolSchema>,
    /// Provider-specific options (thinking budgets, response correlation).
    pub provider_options: Value,
    pub max_output_tokens: Option<u32>,
    pub abort: AbortSignal,
}

/// Post-termination data the transport fills in as the stream ends.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub usage: Option<ProviderUsage>,
    pub provider_metadata: Option<Value>,
}

/// A live part stream plus the stats cell the transport populates at
/// termination.  `usage()` / `provider_metadata()` return `None` until the
/// stream has ended.
pub struct ProviderStream {
    parts: PartStream,
    stats: Arc<Mutex<StreamStats>>,
}

impl ProviderStream {
    pub fn new(parts: PartStream, stats: Arc<Mutex<StreamStats>>) -> Self {
        Self { parts, stats }
    }

    pub async fn next_part(&mut self) -> Option<anyhow::Result<StreamPart>> {
        self.parts.next().await
    }

    pub fn usage(&self) -> Option<ProviderUsage> {
        self.stats.lock().expect("stream stats poisoned").usage.clone()
    }

    pub fn provider_metadata(&self) -> Option<Value> {
        self.stats
            .lock()
            .expect("stream stats poisoned")
            .provider_metadata
            .clone()
    }
}

/// Handle to one resolved provider model.  Implemented by the host
/// application's transports and by [`crate::ScriptedModel`] in tests.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    fn provider(&self) -> Provider;

    /// Bare model identifier, without the provider prefix.
    fn model_id(&self) -> &str;

    async fn stream(&self, req: StreamRequest) -> Result<ProviderStream, ProviderError>;
}
