// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cmux_message::{Message, StreamErrorKind, WorkspaceId};
use cmux_model::{
    classify_provider_error, default_counter, normalize::normalize_for_provider, ModelHandle,
    ModelSpec, ModelSpecError, Provider, ProviderError, AbortSignal, ToolSchema,
};
use cmux_store::{HistoryStore, PartialStore, SessionLayout, StoreError, WorkspaceMeta};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::session::SessionConfig;
use crate::{StreamEvent, StreamManager};

/// Requested depth of model reasoning for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

/// Filter applied to the resolved tool set before it is offered to the
/// model.
#[derive(Debug, Clone)]
pub enum ToolPolicy {
    All,
    Allow(Vec<String>),
    Deny(Vec<String>),
}

impl ToolPolicy {
    pub fn apply(&self, tools: Vec<ToolSchema>) -> Vec<ToolSchema> {
        match self {
            Self::All => tools,
            Self::Allow(names) => tools
                .into_iter()
                .filter(|t| names.iter().any(|n| n == &t.name))
                .collect(),
            Self::Deny(names) => tools
                .into_iter()
                .filter(|t| !names.iter().any(|n| n == &t.name))
                .collect(),
        }
    }
}

/// Composes the final system message for a workspace.  Project-file
/// scanning and prompt assembly live in the host application; the engine
/// only consumes the resulting string.
pub trait SystemMessageBuilder: Send + Sync {
    fn build(&self, workspace_path: &Path, additional_instructions: Option<&str>) -> String;
}

/// Resolves the tool set available in a workspace directory.
pub trait ToolResolver: Send + Sync {
    fn resolve(&self, workspace_path: &Path) -> Vec<ToolSchema>;
}

/// Turns a parsed model spec into a live transport handle.  Key loading
/// happens here; a missing key surfaces as [`ProviderError::LoadApiKey`].
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, spec: &ModelSpec) -> Result<Arc<dyn ModelHandle>, ProviderError>;
}

/// Errors returned synchronously from [`AiService::stream_message`] while
/// the request is being assembled.  Once the stream is spawned, failures
/// arrive only through [`StreamEvent::Error`].
#[derive(Debug, Error)]
pub enum SendMessageError {
    #[error("invalid model string {0:?}: expected \"provider:model-id\"")]
    InvalidModelString(String),

    #[error("provider {0:?} is not supported")]
    ProviderNotSupported(String),

    #[error("no API key configured: {0}")]
    ApiKeyNotFound(String),

    #[error("model resolution failed: {0}")]
    ModelResolution(ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SendMessageError {
    pub fn kind(&self) -> StreamErrorKind {
        match self {
            Self::InvalidModelString(_) => StreamErrorKind::InvalidModelString,
            Self::ProviderNotSupported(_) => StreamErrorKind::ProviderNotSupported,
            Self::ApiKeyNotFound(_) => StreamErrorKind::ApiKeyNotFound,
            Self::ModelResolution(e) => classify_provider_error(e),
            Self::Store(_) => StreamErrorKind::Unknown,
        }
    }

    fn from_provider(e: ProviderError) -> Self {
        match e {
            ProviderError::LoadApiKey(msg) => Self::ApiKeyNotFound(msg),
            other => Self::ModelResolution(other),
        }
    }
}

impl From<ModelSpecError> for SendMessageError {
    fn from(e: ModelSpecError) -> Self {
        match e {
            ModelSpecError::InvalidFormat(s) => Self::InvalidModelString(s),
            ModelSpecError::UnknownProvider(p) => Self::ProviderNotSupported(p),
        }
    }
}

/// One `stream_message` call.
pub struct SendMessageRequest {
    pub workspace_id: WorkspaceId,
    /// Raw workspace history including the newest user turn; normalization
    /// happens inside the service.
    pub messages: Vec<Message>,
    /// Provider-qualified model string, e.g. `"anthropic:claude-opus-4-1"`.
    pub model: String,
    pub thinking_level: ThinkingLevel,
    pub tool_policy: Option<ToolPolicy>,
    pub cancel: Option<AbortSignal>,
    pub additional_system_instructions: Option<String>,
    pub max_output_tokens: Option<u32>,
}

/// Orchestration boundary of the engine: request assembly, stream start,
/// and event re-emission with the commit-on-abort hook.
pub struct AiService {
    layout: SessionLayout,
    history: Arc<HistoryStore>,
    partial: Arc<PartialStore>,
    manager: Arc<StreamManager>,
    models: Arc<dyn ModelResolver>,
    system: Arc<dyn SystemMessageBuilder>,
    tools: Arc<dyn ToolResolver>,
    events: broadcast::Sender<StreamEvent>,
    forwarder: JoinHandle<()>,
}

impl AiService {
    pub fn new(
        layout: SessionLayout,
        history: Arc<HistoryStore>,
        partial: Arc<PartialStore>,
        manager: Arc<StreamManager>,
        models: Arc<dyn ModelResolver>,
        system: Arc<dyn SystemMessageBuilder>,
        tools: Arc<dyn ToolResolver>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let forwarder = spawn_forwarder(manager.subscribe(), Arc::clone(&partial), events.clone());
        Self {
            layout,
            history,
            partial,
            manager,
            models,
            system,
            tools,
            events,
            forwarder,
        }
    }

    /// Subscribe to re-emitted lifecycle events.  On `stream-abort` the
    /// interrupted partial has already been committed to history by the
    /// time the event is delivered here.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Land any leftover interrupted partial of `ws` in history.  Runs
    /// implicitly at the start of every `stream_message`; hosts call it at
    /// startup to recover workspaces that crashed mid-stream.
    pub async fn recover_workspace(&self, ws: &WorkspaceId) -> Result<(), StoreError> {
        self.partial.commit_to_history(ws).await
    }

    /// Assemble and spawn one streaming turn.  Returns as soon as the
    /// stream task is running; the outcome arrives via events.
    pub async fn stream_message(
        &self,
        req: SendMessageRequest,
    ) -> Result<(), SendMessageError> {
        let ws = &req.workspace_id;

        // Any partial still on disk is from an interrupted stream (possibly
        // a crashed process); it must land in history before a new
        // placeholder claims the next sequence number.
        self.partial.commit_to_history(ws).await?;

        let spec = ModelSpec::parse(&req.model)?;
        let model = self
            .models
            .resolve(&spec)
            .map_err(SendMessageError::from_provider)?;

        let normalized = normalize_for_provider(req.messages.clone(), spec.provider);
        if !normalized.validation.valid {
            // The transport may be more lenient than the validator.
            warn!(
                workspace_id = %ws,
                error = normalized.validation.error.as_deref().unwrap_or(""),
                "outbound history failed strict validation"
            );
        }

        let workspace_path = self.workspace_path(ws).await;
        let system_message = self
            .system
            .build(&workspace_path, req.additional_system_instructions.as_deref());
        let system_message_tokens = default_counter().count_tokens(&system_message);

        let tools = self.tools.resolve(&workspace_path);
        let tools = match &req.tool_policy {
            Some(policy) => policy.apply(tools),
            None => tools,
        };

        let mut placeholder = Message::assistant_placeholder(spec.qualified());
        placeholder.metadata.system_message_tokens = Some(system_message_tokens);
        let history_sequence = self.history.append(ws, &mut placeholder).await?;

        let provider_options =
            build_provider_options(spec.provider, req.thinking_level, &req.messages);
        let initial_metadata = placeholder.metadata.clone();

        self.manager
            .start_stream(SessionConfig {
                workspace_id: ws.clone(),
                message_id: placeholder.id.clone(),
                history_sequence,
                model,
                model_string: spec.qualified(),
                messages: normalized.messages,
                system_message,
                tools,
                provider_options,
                max_output_tokens: req.max_output_tokens,
                cancel: req.cancel,
                initial_metadata,
            })
            .await;

        Ok(())
    }

    /// The filesystem directory tools operate in: the project path from the
    /// workspace descriptor when one exists, the session directory
    /// otherwise.
    async fn workspace_path(&self, ws: &WorkspaceId) -> PathBuf {
        match WorkspaceMeta::load(&self.layout, ws).await {
            Ok(Some(meta)) => meta
                .project_path
                .unwrap_or_else(|| self.layout.workspace_dir(ws)),
            _ => self.layout.workspace_dir(ws),
        }
    }
}

impl Drop for AiService {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Forward manager events onto the service bus, running the abort-commit
/// hook first: when a stream aborts, its flushed partial is committed to
/// history (and the file removed) before subscribers hear about it.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<StreamEvent>,
    partial: Arc<PartialStore>,
    out: broadcast::Sender<StreamEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let StreamEvent::StreamAbort { workspace_id, .. } = &event {
                        if let Err(e) = partial.commit_to_history(workspace_id).await {
                            warn!(workspace_id = %workspace_id, error = %e, "failed to commit partial on abort");
                        }
                        if let Err(e) = partial.delete(workspace_id).await {
                            warn!(workspace_id = %workspace_id, error = %e, "failed to delete partial on abort");
                        }
                    }
                    let _ = out.send(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event forwarder lagged behind the manager bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Provider-specific request options derived from the thinking level and,
/// for providers with out-of-band reasoning, the prior-response correlation
/// id carried in history metadata.
fn build_provider_options(
    provider: Provider,
    thinking: ThinkingLevel,
    history: &[Message],
) -> Value {
    match provider {
        Provider::Anthropic => match thinking {
            ThinkingLevel::Off => json!({}),
            ThinkingLevel::Low => anthropic_thinking(4_096),
            ThinkingLevel::Medium => anthropic_thinking(16_384),
            ThinkingLevel::High => anthropic_thinking(32_768),
        },
        Provider::OpenAi => {
            let mut opts = serde_json::Map::new();
            let effort = match thinking {
                ThinkingLevel::Off => None,
                ThinkingLevel::Low => Some("low"),
                ThinkingLevel::Medium => Some("medium"),
                ThinkingLevel::High => Some("high"),
            };
            if let Some(effort) = effort {
                opts.insert("reasoning".into(), json!({ "effort": effort }));
            }
            if let Some(id) = last_openai_response_id(history) {
                opts.insert("previous_response_id".into(), json!(id));
            }
            Value::Object(opts)
        }
    }
}

fn anthropic_thinking(budget_tokens: u64) -> Value {
    json!({ "thinking": { "type": "enabled", "budget_tokens": budget_tokens } })
}

/// The response id of the most recent assistant turn, as recorded by the
/// OpenAI transport in provider metadata.
fn last_openai_response_id(history: &[Message]) -> Option<String> {
    history
        .iter()
        .rev()
        .filter(|m| m.role == cmux_message::Role::Assistant)
        .find_map(|m| {
            m.metadata
                .provider_metadata
                .as_ref()
                .and_then(|pm| pm.get("openai"))
                .and_then(|o| o.get("response_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use cmux_message::Role;
    use serde_json::json;

    use super::*;

    fn schema(name: &str) -> ToolSchema {
        ToolSchema {
            name: name.into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn tool_policy_all_keeps_everything() {
        let tools = vec![schema("bash"), schema("edit")];
        assert_eq!(ToolPolicy::All.apply(tools).len(), 2);
    }

    #[test]
    fn tool_policy_allow_filters_to_named() {
        let tools = vec![schema("bash"), schema("edit"), schema("read")];
        let kept = ToolPolicy::Allow(vec!["bash".into(), "read".into()]).apply(tools);
        let names: Vec<&str> = kept.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["bash", "read"]);
    }

    #[test]
    fn tool_policy_deny_removes_named() {
        let tools = vec![schema("bash"), schema("edit")];
        let kept = ToolPolicy::Deny(vec!["bash".into()]).apply(tools);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "edit");
    }

    #[test]
    fn anthropic_options_carry_thinking_budget() {
        let opts = build_provider_options(Provider::Anthropic, ThinkingLevel::Medium, &[]);
        assert_eq!(opts["thinking"]["type"], "enabled");
        assert_eq!(opts["thinking"]["budget_tokens"], 16_384);
    }

    #[test]
    fn anthropic_options_empty_when_thinking_off() {
        let opts = build_provider_options(Provider::Anthropic, ThinkingLevel::Off, &[]);
        assert_eq!(opts, json!({}));
    }

    #[test]
    fn openai_options_include_effort_and_prior_response() {
        let mut prior = Message::new(Role::Assistant, vec![]);
        prior.metadata.provider_metadata =
            Some(json!({"openai": {"response_id": "resp_123"}}));
        let history = vec![Message::user("hi"), prior];

        let opts = build_provider_options(Provider::OpenAi, ThinkingLevel::High, &history);
        assert_eq!(opts["reasoning"]["effort"], "high");
        assert_eq!(opts["previous_response_id"], "resp_123");
    }

    #[test]
    fn openai_options_omit_missing_correlation() {
        let opts = build_provider_options(Provider::OpenAi, ThinkingLevel::Off, &[]);
        assert_eq!(opts, json!({}));
    }

    #[test]
    fn model_spec_errors_map_to_categories() {
        let invalid: SendMessageError = ModelSpecError::InvalidFormat("x".into()).into();
        assert_eq!(invalid.kind(), StreamErrorKind::InvalidModelString);

        let unknown: SendMessageError = ModelSpecError::UnknownProvider("volcano".into()).into();
        assert_eq!(unknown.kind(), StreamErrorKind::ProviderNotSupported);
    }

    #[test]
    fn missing_key_maps_to_api_key_not_found() {
        let err =
            SendMessageError::from_provider(ProviderError::LoadApiKey("ANTHROPIC_API_KEY".into()));
        assert_eq!(err.kind(), StreamErrorKind::ApiKeyNotFound);
    }
}
