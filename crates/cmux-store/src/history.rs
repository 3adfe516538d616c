// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cmux_message::{Message, WorkspaceId};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::layout::{write_atomic, SessionLayout};
use crate::{StoreError, WorkspaceLocks};

/// Append-only, sequence-numbered log of completed messages, one JSON line
/// per message in `chat.jsonl`.
///
/// Sequence numbers are strictly monotonic per workspace and never gap
/// within a process lifetime; the next value is derived from the highest
/// sequence on disk the first time a workspace is touched and cached after
/// that.
pub struct HistoryStore {
    layout: SessionLayout,
    locks: Arc<WorkspaceLocks>,
    next_seq: Mutex<HashMap<WorkspaceId, u64>>,
}

impl HistoryStore {
    pub fn new(layout: SessionLayout, locks: Arc<WorkspaceLocks>) -> Self {
        Self {
            layout,
            locks,
            next_seq: Mutex::new(HashMap::new()),
        }
    }

    /// Append `message`, assigning the next `history_sequence` unless the
    /// message already carries one (crash-recovery commits keep the sequence
    /// reserved by their placeholder).  The assigned value is written into
    /// the message's metadata and returned.
    pub async fn append(
        &self,
        ws: &WorkspaceId,
        message: &mut Message,
    ) -> Result<u64, StoreError> {
        let _guard = self.locks.acquire(ws).await;
        self.append_unlocked(ws, message).await
    }

    /// Replace the record whose `id` matches, keeping its `history_sequence`.
    pub async fn update(&self, ws: &WorkspaceId, message: &Message) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(ws).await;
        self.update_unlocked(ws, message).await
    }

    /// All messages of `ws` in insertion order.  Lock-free: a concurrent
    /// append is either fully visible (its line was flushed) or not at all;
    /// a torn trailing line from a crash is dropped with a warning.
    pub async fn read_all(&self, ws: &WorkspaceId) -> Result<Vec<Message>, StoreError> {
        let raw = match tokio::fs::read_to_string(self.layout.chat_path(ws)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut messages = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    warn!(workspace_id = %ws, line = n + 1, error = %e, "skipping unreadable history line");
                }
            }
        }
        Ok(messages)
    }

    pub(crate) async fn append_unlocked(
        &self,
        ws: &WorkspaceId,
        message: &mut Message,
    ) -> Result<u64, StoreError> {
        tokio::fs::create_dir_all(self.layout.workspace_dir(ws)).await?;

        let seq = match message.metadata.history_sequence {
            Some(seq) => seq,
            None => {
                let seq = self.next_sequence(ws).await?;
                message.metadata.history_sequence = Some(seq);
                seq
            }
        };

        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.chat_path(ws))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        let mut cache = self.next_seq.lock().expect("sequence cache poisoned");
        let next = cache.entry(ws.clone()).or_insert(0);
        *next = (*next).max(seq + 1);
        Ok(seq)
    }

    pub(crate) async fn update_unlocked(
        &self,
        ws: &WorkspaceId,
        message: &Message,
    ) -> Result<(), StoreError> {
        let mut messages = self.read_all(ws).await?;
        let slot = messages
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| StoreError::MessageNotFound {
                workspace: ws.clone(),
                id: message.id.clone(),
            })?;

        let sequence = slot.metadata.history_sequence;
        *slot = message.clone();
        slot.metadata.history_sequence = sequence;

        let mut buf = String::new();
        for m in &messages {
            buf.push_str(&serde_json::to_string(m)?);
            buf.push('\n');
        }
        write_atomic(&self.layout.chat_path(ws), buf.as_bytes()).await?;
        Ok(())
    }

    async fn next_sequence(&self, ws: &WorkspaceId) -> Result<u64, StoreError> {
        if let Some(n) = self.next_seq.lock().expect("sequence cache poisoned").get(ws) {
            return Ok(*n);
        }
        let messages = self.read_all(ws).await?;
        Ok(messages
            .iter()
            .filter_map(|m| m.metadata.history_sequence)
            .max()
            .map_or(0, |max| max + 1))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use cmux_message::{Part, Role};

    use super::*;

    fn store(dir: &std::path::Path) -> HistoryStore {
        HistoryStore::new(
            SessionLayout::new(dir),
            Arc::new(WorkspaceLocks::new()),
        )
    }

    fn ws() -> WorkspaceId {
        WorkspaceId::new("ws-1")
    }

    #[tokio::test]
    async fn append_assigns_monotonic_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let ws = ws();

        let mut a = Message::user("one");
        let mut b = Message::user("two");
        assert_eq!(store.append(&ws, &mut a).await.unwrap(), 0);
        assert_eq!(store.append(&ws, &mut b).await.unwrap(), 1);
        assert_eq!(a.metadata.history_sequence, Some(0));
        assert_eq!(b.metadata.history_sequence, Some(1));
    }

    #[tokio::test]
    async fn read_all_preserves_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let ws = ws();

        for text in ["a", "b", "c"] {
            store.append(&ws, &mut Message::user(text)).await.unwrap();
        }
        let all = store.read_all(&ws).await.unwrap();
        let texts: Vec<String> = all.iter().map(Message::text).collect();
        assert_eq!(texts, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn sequence_resumes_from_disk_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ws = ws();
        {
            let store = store(dir.path());
            store.append(&ws, &mut Message::user("a")).await.unwrap();
            store.append(&ws, &mut Message::user("b")).await.unwrap();
        }
        // Fresh store, same directory: must continue at 2, not restart at 0.
        let store = store(dir.path());
        let seq = store.append(&ws, &mut Message::user("c")).await.unwrap();
        assert_eq!(seq, 2);
    }

    #[tokio::test]
    async fn update_replaces_in_place_keeping_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let ws = ws();

        let mut placeholder = Message::assistant_placeholder("anthropic:claude-opus-4-1");
        store.append(&ws, &mut placeholder).await.unwrap();
        store.append(&ws, &mut Message::user("later")).await.unwrap();

        let mut finished = placeholder.clone();
        finished.parts = vec![Part::text("done")];
        finished.metadata.partial = Some(false);
        // Even a caller that cleared the sequence gets the stored one back.
        finished.metadata.history_sequence = None;
        store.update(&ws, &finished).await.unwrap();

        let all = store.read_all(&ws).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].text(), "done");
        assert_eq!(all[0].metadata.history_sequence, Some(0));
        assert_eq!(all[1].text(), "later");
    }

    #[tokio::test]
    async fn update_unknown_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let ws = ws();
        store.append(&ws, &mut Message::user("a")).await.unwrap();

        let stranger = Message::user("nope");
        let err = store.update(&ws, &stranger).await.unwrap_err();
        assert!(matches!(err, StoreError::MessageNotFound { .. }));
    }

    #[tokio::test]
    async fn append_respects_preassigned_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let ws = ws();
        store.append(&ws, &mut Message::user("a")).await.unwrap();

        let mut recovered = Message::new(Role::Assistant, vec![Part::text("x")]);
        recovered.metadata.history_sequence = Some(7);
        assert_eq!(store.append(&ws, &mut recovered).await.unwrap(), 7);

        // The cache must have advanced past the preassigned value.
        let seq = store.append(&ws, &mut Message::user("b")).await.unwrap();
        assert_eq!(seq, 8);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let ws = ws();
        store.append(&ws, &mut Message::user("good")).await.unwrap();

        // Simulate a crash mid-append: garbage with no closing brace.
        let path = store.layout.chat_path(&ws);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"id\":\"m-torn\",\"role\":\"assis");
        std::fs::write(&path, raw).unwrap();

        let all = store.read_all(&ws).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text(), "good");
    }

    #[tokio::test]
    async fn read_all_of_missing_workspace_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.read_all(&ws()).await.unwrap().is_empty());
    }
}
