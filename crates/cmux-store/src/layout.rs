// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use cmux_message::WorkspaceId;

pub(crate) const CHAT_FILE: &str = "chat.jsonl";
pub(crate) const PARTIAL_FILE: &str = "partial.json";
pub(crate) const META_FILE: &str = "metadata.json";

/// Resolves the on-disk location of each workspace file under a sessions
/// root.  Shared by the history and partial stores so both agree on paths.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace_dir(&self, ws: &WorkspaceId) -> PathBuf {
        self.root.join(ws.as_str())
    }

    pub fn chat_path(&self, ws: &WorkspaceId) -> PathBuf {
        self.workspace_dir(ws).join(CHAT_FILE)
    }

    pub fn partial_path(&self, ws: &WorkspaceId) -> PathBuf {
        self.workspace_dir(ws).join(PARTIAL_FILE)
    }

    pub fn meta_path(&self, ws: &WorkspaceId) -> PathBuf {
        self.workspace_dir(ws).join(META_FILE)
    }
}

/// Write `contents` to `path` atomically: a sibling temp file is written
/// and flushed first, then renamed over the target.  Readers either see the
/// old file or the new one, never a torn write.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}
