// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use cmux_message::{Message, WorkspaceId};
use tracing::warn;

use crate::layout::{write_atomic, SessionLayout};
use crate::{HistoryStore, StoreError, WorkspaceLocks};

/// Zero-or-one in-flight/interrupted message per workspace, stored as
/// `partial.json` beside the history log.
///
/// The file exists exactly while there is either an active stream or
/// interrupted content that has not yet been committed to history.  Writes
/// go through a temp file and rename so a reader never observes a torn
/// record; readers take no lock.
pub struct PartialStore {
    layout: SessionLayout,
    locks: Arc<WorkspaceLocks>,
    history: Arc<HistoryStore>,
}

impl PartialStore {
    pub fn new(
        layout: SessionLayout,
        locks: Arc<WorkspaceLocks>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            layout,
            locks,
            history,
        }
    }

    /// Replace the partial record for `ws`, creating the workspace
    /// directory if missing.
    pub async fn write(&self, ws: &WorkspaceId, message: &Message) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(ws).await;
        tokio::fs::create_dir_all(self.layout.workspace_dir(ws)).await?;
        let json = serde_json::to_vec(message)?;
        write_atomic(&self.layout.partial_path(ws), &json).await?;
        Ok(())
    }

    /// The current partial, or `None`.  A schema-invalid file reads as
    /// `None` with a warning rather than wedging the engine.
    pub async fn read(&self, ws: &WorkspaceId) -> Result<Option<Message>, StoreError> {
        let raw = match tokio::fs::read_to_string(self.layout.partial_path(ws)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(m) => Ok(Some(m)),
            Err(e) => {
                warn!(workspace_id = %ws, error = %e, "discarding unreadable partial record");
                Ok(None)
            }
        }
    }

    /// Idempotent delete.
    pub async fn delete(&self, ws: &WorkspaceId) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(ws).await;
        self.delete_unlocked(ws).await
    }

    /// Land any interrupted partial in history, marked `partial = true`.
    ///
    /// When the partial's id matches an existing history entry (the
    /// stream's placeholder), the entry is updated in place and keeps its
    /// `history_sequence`; otherwise the message is appended.  The partial
    /// file is deleted after the copy.  Calling this again once the partial
    /// is gone is a no-op, so repeated invocations produce the same history.
    pub async fn commit_to_history(&self, ws: &WorkspaceId) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(ws).await;

        let mut message = match self.read(ws).await? {
            Some(m) => m,
            None => return Ok(()),
        };
        message.metadata.partial = Some(true);

        let existing = self.history.read_all(ws).await?;
        if existing.iter().any(|m| m.id == message.id) {
            self.history.update_unlocked(ws, &message).await?;
        } else {
            self.history.append_unlocked(ws, &mut message).await?;
        }
        self.delete_unlocked(ws).await
    }

    async fn delete_unlocked(&self, ws: &WorkspaceId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.layout.partial_path(ws)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
