// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use cmux_message::{StreamToken, WorkspaceId};
use cmux_store::{HistoryStore, PartialStore};
use tokio::sync::broadcast;

use crate::session::{Registry, SessionConfig, SessionHandle, StreamSession, StreamState};
use crate::StreamEvent;

/// Capacity of the lifecycle event bus.  Slow subscribers observe a lag
/// error rather than applying backpressure to the stream task.
const EVENT_BUS_CAPACITY: usize = 256;

/// Per-workspace registry of at most one live [`StreamSession`].
///
/// `start_stream` performs the cancel-old/insert-new sequence inside one
/// critical section: between the observation that a workspace has no active
/// stream and the insertion of the new entry, no other caller can slip in.
/// Provider stream construction happens in the spawned task, outside the
/// lock.
pub struct StreamManager {
    registry: Registry,
    partial: Arc<PartialStore>,
    history: Arc<HistoryStore>,
    events: broadcast::Sender<StreamEvent>,
}

impl StreamManager {
    pub fn new(partial: Arc<PartialStore>, history: Arc<HistoryStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            registry: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            partial,
            history,
            events,
        }
    }

    /// Subscribe to lifecycle events of every workspace.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Mint a stream token ahead of `start_stream`, for callers that
    /// pre-provision per-stream resources (e.g. a tool scratch directory).
    pub fn generate_stream_token() -> StreamToken {
        StreamToken::generate()
    }

    /// Start a stream for `config.workspace_id`, taking over from any
    /// active one.  The displaced session is cancelled and awaited — its
    /// final flush and `stream-abort` event happen before the new session
    /// is registered, so subscribers always observe abort-before-start.
    pub async fn start_stream(&self, config: SessionConfig) -> StreamToken {
        self.start_stream_with_token(Self::generate_stream_token(), config)
            .await
    }

    /// Like [`start_stream`](Self::start_stream) with a caller-supplied
    /// token from [`generate_stream_token`](Self::generate_stream_token).
    pub async fn start_stream_with_token(
        &self,
        token: StreamToken,
        config: SessionConfig,
    ) -> StreamToken {
        let ws = config.workspace_id.clone();
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(&ws) {
            cancel_entry(existing).await;
        }
        let session = StreamSession::new(
            token,
            config,
            Arc::clone(&self.partial),
            Arc::clone(&self.history),
            self.events.clone(),
            Arc::clone(&self.registry),
        );
        registry.insert(ws, session.handle());
        drop(registry);

        tokio::spawn(session.run());
        token
    }

    /// Cancel the workspace's stream, if any, and wait for its final flush
    /// and `stream-abort` event.  Idempotent; a no-op when idle.
    pub async fn stop_stream(&self, ws: &WorkspaceId) {
        let entry = {
            let registry = self.registry.lock().await;
            registry
                .get(ws)
                .map(|h| (h.abort.clone(), h.finished_rx.clone()))
        };
        if let Some((abort, mut finished)) = entry {
            abort.abort();
            let _ = finished.wait_for(|done| *done).await;
        }
    }

    /// `Idle` when no session is registered.  A finished session counts as
    /// idle even while its registry entry is still being torn down.
    pub async fn get_stream_state(&self, ws: &WorkspaceId) -> StreamState {
        self.registry.lock().await.get(ws).map_or(StreamState::Idle, |h| {
            if *h.finished_rx.borrow() {
                StreamState::Idle
            } else {
                *h.state_rx.borrow()
            }
        })
    }

    pub async fn is_streaming(&self, ws: &WorkspaceId) -> bool {
        self.get_stream_state(ws).await.is_active()
    }
}

/// Cancel a registry entry and wait until its session has finished its
/// cleanup (final flush included).  Safe to call on an already-finished
/// entry.
async fn cancel_entry(entry: &SessionHandle) {
    if *entry.finished_rx.borrow() {
        return;
    }
    entry.abort.abort();
    let mut finished = entry.finished_rx.clone();
    let _ = finished.wait_for(|done| *done).await;
}
