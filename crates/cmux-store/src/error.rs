// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use cmux_message::{MessageId, WorkspaceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {id} not found in history of workspace {workspace}")]
    MessageNotFound {
        workspace: WorkspaceId,
        id: MessageId,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
