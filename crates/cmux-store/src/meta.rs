// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cmux_message::WorkspaceId;
use serde::{Deserialize, Serialize};

use crate::layout::{write_atomic, SessionLayout};
use crate::StoreError;

/// Workspace descriptor stored as `metadata.json`.  Schema-validated on
/// read; unknown fields written by newer versions are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceMeta {
    pub workspace_id: WorkspaceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    /// Last model used in this workspace, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl WorkspaceMeta {
    pub fn new(workspace_id: WorkspaceId, name: impl Into<String>) -> Self {
        Self {
            workspace_id,
            name: name.into(),
            project_path: None,
            created_at: Utc::now(),
            model: None,
        }
    }

    pub async fn load(
        layout: &SessionLayout,
        ws: &WorkspaceId,
    ) -> Result<Option<Self>, StoreError> {
        let raw = match tokio::fs::read_to_string(layout.meta_path(ws)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn save(&self, layout: &SessionLayout) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(layout.workspace_dir(&self.workspace_id)).await?;
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&layout.meta_path(&self.workspace_id), &json).await?;
        Ok(())
    }

    /// Load the descriptor, creating and persisting a default one when the
    /// workspace has none yet.
    pub async fn ensure(
        layout: &SessionLayout,
        ws: &WorkspaceId,
        name: &str,
    ) -> Result<Self, StoreError> {
        if let Some(meta) = Self::load(layout, ws).await? {
            return Ok(meta);
        }
        let meta = Self::new(ws.clone(), name);
        meta.save(layout).await?;
        Ok(meta)
    }
}

/// Default sessions root when the host application supplies none.
pub fn default_sessions_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| Path::new(".").to_path_buf())
        .join("cmux")
        .join("sessions")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
