// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cmux_message::{
    Message, MessageId, MessageMetadata, Part, Role, StreamErrorKind, StreamToken, ToolState,
    Usage, WorkspaceId,
};
use cmux_model::{
    abort_pair, classify_message, classify_provider_error, default_counter, unwrap_stream_error,
    AbortHandle, AbortSignal, ModelHandle, ProviderBehavior, ProviderStream, ProviderUsage,
    ProviderMessage, StreamPart, StreamRequest, ToolSchema,
};
use cmux_store::{HistoryStore, PartialStore};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::StreamEvent;

/// Coalesce rapid in-memory updates into at most one disk write per this
/// interval.  Cancellation and natural end always flush regardless.
const PARTIAL_WRITE_THROTTLE: Duration = Duration::from_millis(500);

/// Placeholder deadline used when no write is due; far enough out that the
/// timer arm of the select never wins spuriously.
const IDLE_DEADLINE: Duration = Duration::from_secs(3600);

/// Observable state of a workspace stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No session registered for the workspace.
    Idle,
    Starting,
    Streaming,
    /// Cancellation in progress; flushes before the abort event.
    Stopping,
    Error,
    Completed,
}

impl StreamState {
    /// True while the stream still consumes parts.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Streaming)
    }
}

/// Construction inputs for one stream, assembled by [`crate::AiService`].
pub struct SessionConfig {
    pub workspace_id: WorkspaceId,
    /// Id of the placeholder assistant message reserved in history.
    pub message_id: MessageId,
    /// Sequence number the placeholder reserved.
    pub history_sequence: u64,
    pub model: Arc<dyn ModelHandle>,
    /// Provider-qualified model string for events and metadata.
    pub model_string: String,
    /// Normalized outbound history.
    pub messages: Vec<ProviderMessage>,
    pub system_message: String,
    pub tools: Vec<ToolSchema>,
    pub provider_options: Value,
    pub max_output_tokens: Option<u32>,
    /// External cancellation, linked into the session's own source.
    pub cancel: Option<AbortSignal>,
    /// Metadata snapshot taken at stream start (model, timestamp, system
    /// message tokens); merged into every persisted snapshot.
    pub initial_metadata: MessageMetadata,
}

/// Registry entry the manager keeps per workspace.
pub(crate) struct SessionHandle {
    pub(crate) token: StreamToken,
    pub(crate) abort: AbortHandle,
    pub(crate) state_rx: watch::Receiver<StreamState>,
    /// Flips to `true` as the session's last act before it leaves the
    /// registry; `cancel_safely` awaits this so the final flush and the
    /// abort event have both happened when it returns.
    pub(crate) finished_rx: watch::Receiver<bool>,
}

pub(crate) type Registry = Arc<tokio::sync::Mutex<HashMap<WorkspaceId, SessionHandle>>>;

enum LoopEnd {
    Completed,
    Aborted,
    Failed { kind: StreamErrorKind, message: String },
}

/// One in-flight stream.  Owns the provider stream, the accumulating parts
/// vector, the cancellation source, and the write throttle; runs as a
/// dedicated task spawned by the manager.
pub(crate) struct StreamSession {
    token: StreamToken,
    config: SessionConfig,
    partial: Arc<PartialStore>,
    history: Arc<HistoryStore>,
    events: broadcast::Sender<StreamEvent>,
    registry: Registry,
    abort: AbortHandle,
    state_tx: watch::Sender<StreamState>,
    finished_tx: watch::Sender<bool>,
    parts: Vec<Part>,
    last_write: Option<Instant>,
    write_due: Option<Instant>,
    /// At most one disk write in flight; the next flush awaits it first.
    write_in_flight: Option<JoinHandle<()>>,
    started_at: Instant,
}

impl StreamSession {
    pub(crate) fn new(
        token: StreamToken,
        config: SessionConfig,
        partial: Arc<PartialStore>,
        history: Arc<HistoryStore>,
        events: broadcast::Sender<StreamEvent>,
        registry: Registry,
    ) -> Self {
        let (abort, _) = abort_pair();
        let (state_tx, _) = watch::channel(StreamState::Starting);
        let (finished_tx, _) = watch::channel(false);
        Self {
            token,
            config,
            partial,
            history,
            events,
            registry,
            abort,
            state_tx,
            finished_tx,
            parts: Vec::new(),
            last_write: None,
            write_due: None,
            write_in_flight: None,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn handle(&self) -> SessionHandle {
        SessionHandle {
            token: self.token,
            abort: self.abort.clone(),
            state_rx: self.state_tx.subscribe(),
            finished_rx: self.finished_tx.subscribe(),
        }
    }

    pub(crate) async fn run(mut self) {
        // Link the external cancellation signal into the internal source.
        // The linker also watches `finished` so it never outlives the session.
        if let Some(mut external) = self.config.cancel.take() {
            let handle = self.abort.clone();
            let mut finished = self.finished_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    () = external.aborted() => handle.abort(),
                    _ = finished.wait_for(|done| *done) => {}
                }
            });
        }

        self.emit(StreamEvent::StreamStart {
            workspace_id: self.config.workspace_id.clone(),
            message_id: self.config.message_id.clone(),
            model: self.config.model_string.clone(),
            history_sequence: self.config.history_sequence,
        });

        let request = StreamRequest {
            messages: self.config.messages.clone(),
            system: self.config.system_message.clone(),
            tools: self.config.tools.clone(),
            provider_options: self.config.provider_options.clone(),
            max_output_tokens: self.config.max_output_tokens,
            abort: self.abort.signal(),
        };
        let mut stream = match self.config.model.stream(request).await {
            Ok(s) => s,
            Err(e) => {
                let kind = classify_provider_error(&e);
                return self.fail(kind, e.to_string()).await;
            }
        };
        self.state_tx.send_replace(StreamState::Streaming);

        let mut signal = self.abort.signal();
        let end = loop {
            // The flag is checked before touching the stream so a stop
            // request is honored with minimal delay.
            if signal.is_aborted() {
                break LoopEnd::Aborted;
            }
            let has_deadline = self.write_due.is_some();
            let deadline = self
                .write_due
                .unwrap_or_else(|| Instant::now() + IDLE_DEADLINE);
            let next = tokio::select! {
                biased;
                () = signal.aborted() => break LoopEnd::Aborted,
                () = tokio::time::sleep_until(deadline), if has_deadline => {
                    self.flush_partial().await;
                    continue;
                }
                part = stream.next_part() => part,
            };
            match next {
                None => break LoopEnd::Completed,
                Some(Err(e)) => {
                    let message = format!("{e:#}");
                    break LoopEnd::Failed {
                        kind: classify_message(&message),
                        message,
                    };
                }
                Some(Ok(part)) => match self.apply_part(part) {
                    Ok(true) => self.schedule_partial_write().await,
                    Ok(false) => {}
                    Err((kind, message)) => break LoopEnd::Failed { kind, message },
                },
            }
        };

        match end {
            LoopEnd::Completed => self.complete(stream).await,
            LoopEnd::Aborted => self.handle_abort().await,
            LoopEnd::Failed { kind, message } => self.fail(kind, message).await,
        }
    }

    /// Dispatch one provider part.  Returns `Ok(true)` when the parts
    /// vector changed and a partial write should be scheduled.
    fn apply_part(
        &mut self,
        part: StreamPart,
    ) -> Result<bool, (StreamErrorKind, String)> {
        match part {
            StreamPart::TextDelta(delta) => {
                // Adjacent text parts are merged at render time, not here.
                self.parts.push(Part::text(delta.clone()));
                self.emit(StreamEvent::StreamDelta {
                    workspace_id: self.config.workspace_id.clone(),
                    message_id: self.config.message_id.clone(),
                    delta,
                });
                Ok(true)
            }
            StreamPart::ReasoningDelta(delta) => {
                self.parts.push(Part::reasoning(delta.clone()));
                self.emit(StreamEvent::ReasoningDelta {
                    workspace_id: self.config.workspace_id.clone(),
                    message_id: self.config.message_id.clone(),
                    delta,
                });
                Ok(true)
            }
            StreamPart::ReasoningEnd => {
                self.emit(StreamEvent::ReasoningEnd {
                    workspace_id: self.config.workspace_id.clone(),
                    message_id: self.config.message_id.clone(),
                });
                Ok(false)
            }
            StreamPart::ToolCall { id, name, input } => {
                // Recorded immediately so an interruption before the result
                // still persists the attempt.
                self.parts
                    .push(Part::tool_call(id.clone(), name.clone(), input.clone()));
                self.emit(StreamEvent::ToolCallStart {
                    workspace_id: self.config.workspace_id.clone(),
                    message_id: self.config.message_id.clone(),
                    tool_call_id: id,
                    tool_name: name,
                    input,
                });
                Ok(true)
            }
            StreamPart::ToolResult { id, output } => {
                let tool_name = match self
                    .parts
                    .iter_mut()
                    .find(|p| p.tool_call_id() == Some(id.as_str()))
                {
                    Some(Part::DynamicTool {
                        tool_name,
                        state,
                        output: slot,
                        ..
                    }) => {
                        *state = ToolState::OutputAvailable;
                        *slot = Some(output.clone());
                        tool_name.clone()
                    }
                    _ => {
                        // No recorded call for this result; keep it anyway.
                        warn!(
                            workspace_id = %self.config.workspace_id,
                            tool_call_id = %id,
                            "tool result without a matching tool call"
                        );
                        self.parts.push(Part::tool_result(
                            id.clone(),
                            "unknown",
                            Value::Null,
                            output.clone(),
                        ));
                        "unknown".to_string()
                    }
                };
                self.emit(StreamEvent::ToolCallEnd {
                    workspace_id: self.config.workspace_id.clone(),
                    message_id: self.config.message_id.clone(),
                    tool_call_id: id,
                    tool_name,
                    output,
                });
                Ok(true)
            }
            StreamPart::Error(raw) => {
                let (message, envelope) = unwrap_stream_error(&raw);
                if let Some(envelope) = envelope {
                    warn!(
                        workspace_id = %self.config.workspace_id,
                        envelope = %envelope,
                        "stream error part"
                    );
                }
                Err((classify_message(&message), message))
            }
            StreamPart::Start
            | StreamPart::StartStep
            | StreamPart::TextStart
            | StreamPart::FinishStep
            | StreamPart::Finish => Ok(false),
        }
    }

    async fn schedule_partial_write(&mut self) {
        let now = Instant::now();
        match self.last_write {
            // Inside the throttle window: arm (or re-arm) the one-shot
            // deadline.  Repeated calls replace it, they never queue.
            Some(last) if now.duration_since(last) < PARTIAL_WRITE_THROTTLE => {
                self.write_due = Some(last + PARTIAL_WRITE_THROTTLE);
            }
            _ => self.flush_partial().await,
        }
    }

    /// Snapshot the current state and write it out.  Awaits any in-flight
    /// write first so there is at most one write to disk at a time; the
    /// write itself is spawned so the stream keeps consuming.
    async fn flush_partial(&mut self) {
        self.write_due = None;
        if let Some(prev) = self.write_in_flight.take() {
            let _ = prev.await;
        }
        let snapshot = self.snapshot();
        let store = Arc::clone(&self.partial);
        let ws = self.config.workspace_id.clone();
        self.last_write = Some(Instant::now());
        self.write_in_flight = Some(tokio::spawn(async move {
            if let Err(e) = store.write(&ws, &snapshot).await {
                warn!(workspace_id = %ws, error = %e, "partial write failed; next flush will retry");
            }
        }));
    }

    async fn flush_partial_and_wait(&mut self) {
        self.flush_partial().await;
        if let Some(prev) = self.write_in_flight.take() {
            let _ = prev.await;
        }
    }

    /// The current accumulated state as a partial message.
    fn snapshot(&self) -> Message {
        let mut metadata = self.config.initial_metadata.clone();
        metadata.partial = Some(true);
        metadata.history_sequence = Some(self.config.history_sequence);
        Message {
            id: self.config.message_id.clone(),
            role: Role::Assistant,
            parts: self.parts.clone(),
            metadata,
        }
    }

    async fn complete(mut self, stream: ProviderStream) {
        let usage = compute_usage(
            &self.parts,
            self.config.model.provider().behavior(),
            stream.usage(),
            stream.provider_metadata().as_ref(),
        );

        // One more flush with the final accumulated state.  Usually
        // redundant with the delete just below, but it shrinks the crash
        // window between the last delta and the history update to nothing.
        self.flush_partial_and_wait().await;

        let mut message = self.snapshot();
        message.metadata.partial = Some(false);
        message.metadata.usage = Some(usage);
        message.metadata.duration_ms = Some(self.started_at.elapsed().as_millis() as u64);
        if let Some(pm) = stream.provider_metadata() {
            message.metadata.provider_metadata = Some(pm);
        }

        // Delete before update: a crash in between leaves the placeholder
        // only, which the next turn replaces; a crash before the delete
        // leaves a partial that commits over the placeholder on recovery.
        if let Err(e) = self.partial.delete(&self.config.workspace_id).await {
            warn!(workspace_id = %self.config.workspace_id, error = %e, "failed to delete partial after stream end");
        }
        if let Err(e) = self.history.update(&self.config.workspace_id, &message).await {
            warn!(workspace_id = %self.config.workspace_id, error = %e, "failed to update history with final message");
        }

        self.emit(StreamEvent::StreamEnd {
            workspace_id: self.config.workspace_id.clone(),
            message_id: self.config.message_id.clone(),
            parts: message.parts.clone(),
            metadata: message.metadata.clone(),
        });
        self.state_tx.send_replace(StreamState::Completed);
        self.finish().await;
    }

    async fn handle_abort(mut self) {
        self.state_tx.send_replace(StreamState::Stopping);
        // Flush before anything else so the freshest state is on disk when
        // the abort event reaches the service's commit hook.
        self.flush_partial_and_wait().await;
        // Make sure the provider fetch is cancelled even when the stop came
        // from the external signal path.
        self.abort.abort();
        self.emit(StreamEvent::StreamAbort {
            workspace_id: self.config.workspace_id.clone(),
            message_id: self.config.message_id.clone(),
        });
        self.finish().await;
    }

    async fn fail(mut self, kind: StreamErrorKind, message: String) {
        self.state_tx.send_replace(StreamState::Error);
        if let Some(prev) = self.write_in_flight.take() {
            let _ = prev.await;
        }
        let mut snapshot = self.snapshot();
        snapshot.metadata.error = Some(message.clone());
        snapshot.metadata.error_type = Some(kind);
        let store = Arc::clone(&self.partial);
        let ws = self.config.workspace_id.clone();
        // Fire and forget: the error event must not wait on disk.
        tokio::spawn(async move {
            if let Err(e) = store.write(&ws, &snapshot).await {
                warn!(workspace_id = %ws, error = %e, "failed to persist error partial");
            }
        });
        self.emit(StreamEvent::Error {
            workspace_id: self.config.workspace_id.clone(),
            message_id: self.config.message_id.clone(),
            error: message,
            error_type: kind,
        });
        self.finish().await;
    }

    /// Mark the session finished, then drop its registry entry.  `finished`
    /// flips first so a takeover waiting under the registry lock can
    /// proceed; the token guard keeps us from removing a successor's entry.
    async fn finish(self) {
        self.finished_tx.send_replace(true);
        let mut registry = self.registry.lock().await;
        if let Some(entry) = registry.get(&self.config.workspace_id) {
            if entry.token == self.token {
                registry.remove(&self.config.workspace_id);
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }
}

/// Final usage computation at natural stream end.
///
/// Reasoning tokens are estimated locally when the provider did not report
/// them but reasoning parts exist; `output_tokens` is adjusted downward only
/// for providers that inline reasoning there; a provider-metadata cache
/// field backfills `cached_input_tokens` when the top-level usage left it
/// empty.
fn compute_usage(
    parts: &[Part],
    behavior: &ProviderBehavior,
    reported: Option<ProviderUsage>,
    provider_metadata: Option<&Value>,
) -> Usage {
    let reported = reported.unwrap_or_default();

    let reasoning_tokens = match reported.reasoning_tokens {
        Some(n) => n,
        None => {
            let reasoning_text: String = parts
                .iter()
                .filter_map(Part::as_reasoning)
                .collect::<Vec<_>>()
                .concat();
            if reasoning_text.is_empty() {
                0
            } else {
                default_counter().count_tokens(&reasoning_text) as u64
            }
        }
    };

    let output_tokens = if behavior.reasoning_in_output_tokens {
        reported.output_tokens.saturating_sub(reasoning_tokens)
    } else {
        reported.output_tokens
    };

    let mut cached_input_tokens = reported.cached_input_tokens;
    if cached_input_tokens == 0 {
        if let (Some(field), Some(md)) = (behavior.cache_read_metadata_field, provider_metadata) {
            if let Some(v) = md.get(field).and_then(Value::as_u64) {
                cached_input_tokens = v;
            }
        }
    }

    Usage {
        input_tokens: reported.input_tokens,
        output_tokens,
        cached_input_tokens,
        reasoning_tokens,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
