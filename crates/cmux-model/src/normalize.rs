// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Outbound history normalization.
//!
//! Before a request leaves the engine, the workspace history is reshaped
//! into something the target provider accepts: reasoning-only assistant
//! turns disappear, interrupted assistant turns gain an explicit sentinel,
//! tool parts become tool-use/tool-result block pairs, and strict providers
//! get contiguous tool blocks plus a validation pass.
//!
//! Every function here is pure; the pipeline allocates only for its
//! results.  [`normalize_history`] run on its own output is a fixpoint.

use cmux_message::{Message, Part, Role, ToolState, INTERRUPTED_SENTINEL};
use serde_json::Value;

use crate::registry::{Provider, ReasoningHandling};
use crate::wire::{ContentBlock, ProviderMessage, ProviderRole};

/// Outcome of the strict-provider validation pass.  A failed validation is
/// logged by the caller but does not abort the request; the transport may
/// be more lenient than the rules here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub error: Option<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// Fully normalized outbound request content.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedHistory {
    pub messages: Vec<ProviderMessage>,
    pub validation: Validation,
}

/// Run the complete pipeline for `provider`.
pub fn normalize_for_provider(messages: Vec<Message>, provider: Provider) -> NormalizedHistory {
    let behavior = provider.behavior();

    let history = normalize_history(messages, provider);
    let wire = to_provider_messages(&history);
    let wire = if behavior.strict_tool_blocks {
        split_mixed_content(wire)
    } else {
        wire
    };
    let wire = merge_consecutive_same_role(wire);
    let wire = if behavior.cache_hints {
        apply_cache_hints(wire)
    } else {
        wire
    };
    let validation = if behavior.strict_tool_blocks {
        validate_strict(&wire)
    } else {
        Validation::ok()
    };

    NormalizedHistory {
        messages: wire,
        validation,
    }
}

/// The engine-level half of the pipeline: sentinel injection, empty-assistant
/// filtering, and reasoning stripping.  Returns messages in the engine's own
/// representation, ready for conversion to provider blocks.
pub fn normalize_history(messages: Vec<Message>, provider: Provider) -> Vec<Message> {
    let behavior = provider.behavior();

    // The sentinel goes in before filtering: an interrupted assistant that
    // only got as far as reasoning is dropped by the filter, but the user
    // turn marking the interruption must survive it.
    let messages = inject_interruption_sentinel(messages);
    let messages = filter_empty_assistants(messages);
    if behavior.reasoning == ReasoningHandling::OutOfBand {
        strip_reasoning(messages)
    } else {
        messages
    }
}

/// Drop assistant messages with no `Text` and no `DynamicTool` part.
pub fn filter_empty_assistants(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter(|m| m.role != Role::Assistant || m.has_visible_content())
        .collect()
}

/// Remove `Reasoning` parts from every message, for providers that manage
/// reasoning state out-of-band.
pub fn strip_reasoning(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut m| {
            m.parts.retain(|p| !p.is_reasoning());
            m
        })
        .collect()
}

/// Insert a synthetic user `[INTERRUPTED]` message immediately after every
/// assistant message marked `partial`.  Skips positions where the sentinel
/// is already present, so re-running the pipeline changes nothing.
pub fn inject_interruption_sentinel(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();
    while let Some(m) = iter.next() {
        let needs_sentinel = m.role == Role::Assistant
            && m.is_partial()
            && !iter
                .peek()
                .is_some_and(|next| next.metadata.is_synthetic());
        out.push(m);
        if needs_sentinel {
            out.push(interruption_sentinel());
        }
    }
    out
}

fn interruption_sentinel() -> Message {
    let mut m = Message::user(INTERRUPTED_SENTINEL);
    m.metadata.synthetic = Some(true);
    m
}

/// Convert engine messages to the provider representation.
///
/// Completed tool parts become a `ToolUse` block on the assistant side plus
/// a `ToolResult` block on a following tool-role message.  Interrupted tool
/// parts (`InputAvailable`) never reach the provider; their textual
/// siblings survive.  Messages left with no blocks are dropped.
pub fn to_provider_messages(messages: &[Message]) -> Vec<ProviderMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::User => {
                let blocks: Vec<ContentBlock> = m
                    .parts
                    .iter()
                    .filter_map(|p| p.as_text().map(ContentBlock::text))
                    .collect();
                if !blocks.is_empty() {
                    out.push(ProviderMessage::user(blocks));
                }
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                let mut results = Vec::new();
                for p in &m.parts {
                    match p {
                        Part::Text { text } => blocks.push(ContentBlock::text(text.clone())),
                        Part::Reasoning { text } => {
                            blocks.push(ContentBlock::Reasoning { text: text.clone() })
                        }
                        Part::DynamicTool {
                            tool_call_id,
                            tool_name,
                            state,
                            input,
                            output,
                        } => {
                            if *state != ToolState::OutputAvailable {
                                continue;
                            }
                            blocks.push(ContentBlock::ToolUse {
                                id: tool_call_id.clone(),
                                name: tool_name.clone(),
                                input: input.clone(),
                            });
                            results.push(ContentBlock::ToolResult {
                                id: tool_call_id.clone(),
                                output: output.clone().unwrap_or(Value::Null),
                            });
                        }
                    }
                }
                if !blocks.is_empty() {
                    out.push(ProviderMessage::assistant(blocks));
                }
                if !results.is_empty() {
                    out.push(ProviderMessage::tool(results));
                }
            }
        }
    }
    out
}

/// Split assistant messages that mix text and tool-use blocks into a
/// text-only message followed by a tool-use-only message, so the tool
/// message with the results is contiguous with the calls.
pub fn split_mixed_content(messages: Vec<ProviderMessage>) -> Vec<ProviderMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        let is_mixed_assistant = m.role == ProviderRole::Assistant
            && m.blocks.iter().any(ContentBlock::is_tool_use)
            && m.blocks.iter().any(|b| !b.is_tool_use());
        if !is_mixed_assistant {
            out.push(m);
            continue;
        }
        let (tool_use, rest): (Vec<ContentBlock>, Vec<ContentBlock>) =
            m.blocks.into_iter().partition(ContentBlock::is_tool_use);
        out.push(ProviderMessage::assistant(rest));
        out.push(ProviderMessage::assistant(tool_use));
    }
    out
}

/// Concatenate consecutive text-only messages of the same role with a
/// single newline.  Tool messages and mixed blocks are never merged.
pub fn merge_consecutive_same_role(messages: Vec<ProviderMessage>) -> Vec<ProviderMessage> {
    let mut out: Vec<ProviderMessage> = Vec::with_capacity(messages.len());
    for m in messages {
        if let Some(last) = out.last_mut() {
            if last.role == m.role && last.is_text_only() && m.is_text_only() {
                let merged = format!("{}\n{}", last.text(), m.text());
                last.blocks = vec![ContentBlock::text(merged)];
                continue;
            }
        }
        out.push(m);
    }
    out
}

/// Mark the last message boundary as a prompt-cache breakpoint.  The
/// provider transport translates the flag into its own cache-control
/// representation.
pub fn apply_cache_hints(mut messages: Vec<ProviderMessage>) -> Vec<ProviderMessage> {
    if let Some(last) = messages.last_mut() {
        last.cache_hint = true;
    }
    messages
}

/// Strict-provider validation: every tool-use block has exactly one result
/// in the immediately following tool message, and every tool message is
/// paired with the assistant message before it.
pub fn validate_strict(messages: &[ProviderMessage]) -> Validation {
    for (i, m) in messages.iter().enumerate() {
        match m.role {
            ProviderRole::Assistant => {
                let uses = m.tool_use_ids();
                if uses.is_empty() {
                    continue;
                }
                let Some(next) = messages.get(i + 1) else {
                    return Validation::fail(format!(
                        "tool-use block(s) {uses:?} at message {i} have no following tool message"
                    ));
                };
                if next.role != ProviderRole::Tool {
                    return Validation::fail(format!(
                        "tool-use block(s) {uses:?} at message {i} are followed by a {:?} message",
                        next.role
                    ));
                }
                let results = next.tool_result_ids();
                for id in &uses {
                    let n = results.iter().filter(|r| r == &id).count();
                    if n != 1 {
                        return Validation::fail(format!(
                            "tool-use {id} at message {i} has {n} results in the following tool message"
                        ));
                    }
                }
                for id in &results {
                    if !uses.contains(id) {
                        return Validation::fail(format!(
                            "tool message {j} carries result {id} with no matching tool-use",
                            j = i + 1
                        ));
                    }
                }
            }
            ProviderRole::Tool => {
                let paired = i > 0
                    && messages[i - 1].role == ProviderRole::Assistant
                    && !messages[i - 1].tool_use_ids().is_empty();
                if !paired {
                    return Validation::fail(format!(
                        "dangling tool message at position {i}"
                    ));
                }
            }
            ProviderRole::User => {}
        }
    }
    Validation::ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
