// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-workspace on-disk state: the append-only history log (`chat.jsonl`),
//! the single in-flight/interrupted partial record (`partial.json`), and the
//! workspace descriptor (`metadata.json`).
//!
//! All mutation of one workspace's files is serialized through a shared
//! [`WorkspaceLocks`] map; readers are lock-free and observe consistent
//! snapshots because every rewrite goes through a sibling temp file and an
//! atomic rename.

mod error;
mod history;
mod layout;
mod locks;
mod meta;
mod partial;

pub use error::StoreError;
pub use history::HistoryStore;
pub use layout::SessionLayout;
pub use locks::WorkspaceLocks;
pub use meta::{default_sessions_root, WorkspaceMeta};
pub use partial::PartialStore;
