// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, OnceLock};

/// Token counting as the engine sees it.  The real tokenizer lives in the
/// host application (often on a worker thread); the engine only ever calls
/// `count_tokens`.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Characters-over-four approximation, floor 1 for non-empty text.  Close
/// enough for cost accounting and for reasoning-token estimation when the
/// provider does not report them.
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            0
        } else {
            (text.len() / 4).max(1)
        }
    }
}

static DEFAULT: OnceLock<Arc<dyn TokenCounter>> = OnceLock::new();

/// Process-wide counter, lazily initialized on first use.  Safe for
/// concurrent init.
pub fn default_counter() -> Arc<dyn TokenCounter> {
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(HeuristicCounter)))
}
