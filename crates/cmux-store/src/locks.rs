// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cmux_message::WorkspaceId;
use tokio::sync::OwnedMutexGuard;

/// Per-workspace async lock map.
///
/// One shared instance serializes every history append/update and every
/// partial write/delete/commit for the same workspace, independent of the
/// stream-registry lock, so a commit-to-history triggered on abort cannot
/// race a straggler flush from the stream task.
#[derive(Debug, Default)]
pub struct WorkspaceLocks {
    inner: Mutex<HashMap<WorkspaceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `ws`, creating it on first use.
    pub async fn acquire(&self, ws: &WorkspaceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("workspace lock map poisoned");
            Arc::clone(
                map.entry(ws.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}
