// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::{
    AbortSignal, ModelHandle, ProviderError, ProviderStream, ProviderUsage, StreamPart,
    StreamRequest, StreamStats,
};
use crate::registry::Provider;

/// One step of a scripted stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Part(StreamPart),
    /// Yield `Err` with this message (terminal from the session's view).
    PartErr(String),
    /// Sleep before continuing; lets tests interleave with the throttle.
    Delay(Duration),
    /// Park until the request's abort signal fires, then end the stream —
    /// the shape a transport takes when cancellation lands mid-fetch.
    Hang,
}

/// A pre-scripted model.  Each `stream` call pops the next script from the
/// front of the queue, so tests specify exact part sequences — including
/// tool calls, pauses, and mid-stream errors — without network access.
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    usage: ProviderUsage,
    provider_metadata: Option<Value>,
    provider: Provider,
    model_id: String,
    /// The last `StreamRequest` seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<StreamRequest>>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            usage: ProviderUsage {
                input_tokens: 10,
                output_tokens: 10,
                ..Default::default()
            },
            provider_metadata: None,
            provider: Provider::Anthropic,
            model_id: "scripted-mock-model".into(),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: one stream of parts ending naturally.
    pub fn parts(parts: Vec<StreamPart>) -> Self {
        Self::new(vec![parts.into_iter().map(ScriptStep::Part).collect()])
    }

    /// Convenience: one stream of text deltas.
    pub fn text_deltas(deltas: &[&str]) -> Self {
        Self::parts(
            deltas
                .iter()
                .map(|d| StreamPart::TextDelta((*d).to_string()))
                .collect(),
        )
    }

    pub fn with_usage(mut self, usage: ProviderUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_provider_metadata(mut self, metadata: Value) -> Self {
        self.provider_metadata = Some(metadata);
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }
}

struct ScriptState {
    steps: VecDeque<ScriptStep>,
    abort: AbortSignal,
    stats: Arc<Mutex<StreamStats>>,
    usage: ProviderUsage,
    provider_metadata: Option<Value>,
}

#[async_trait]
impl ModelHandle for ScriptedModel {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream(&self, req: StreamRequest) -> Result<ProviderStream, ProviderError> {
        let steps: VecDeque<ScriptStep> = {
            let mut scripts = self.scripts.lock().expect("script queue poisoned");
            scripts
                .pop_front()
                // Fallback when all scripts are consumed.
                .unwrap_or_else(|| vec![ScriptStep::Part(StreamPart::TextDelta("[no more scripts]".into()))])
                .into()
        };

        let abort = req.abort.clone();
        *self.last_request.lock().expect("last_request poisoned") = Some(req);

        let stats = Arc::new(Mutex::new(StreamStats::default()));
        let state = ScriptState {
            steps,
            abort,
            stats: Arc::clone(&stats),
            usage: self.usage.clone(),
            provider_metadata: self.provider_metadata.clone(),
        };

        let parts = stream::unfold(state, |mut st| async move {
            loop {
                match st.steps.pop_front() {
                    Some(ScriptStep::Part(p)) => return Some((Ok(p), st)),
                    Some(ScriptStep::PartErr(msg)) => {
                        return Some((Err(anyhow::anyhow!(msg)), st))
                    }
                    Some(ScriptStep::Delay(d)) => tokio::time::sleep(d).await,
                    Some(ScriptStep::Hang) => {
                        let mut signal = st.abort.clone();
                        signal.aborted().await;
                        st.steps.clear();
                    }
                    None => {
                        let mut stats = st.stats.lock().expect("stream stats poisoned");
                        stats.usage = Some(st.usage.clone());
                        stats.provider_metadata = st.provider_metadata.clone();
                        return None;
                    }
                }
            }
        });

        Ok(ProviderStream::new(Box::pin(parts), stats))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
