// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio::sync::watch;

/// Create a linked abort handle/signal pair.
///
/// The handle side triggers; any number of signal clones observe.  Both
/// halves are cheap to clone, so the engine can hand one signal to the
/// provider transport and keep another for its own loop checks.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

/// Trigger side of a cooperative cancellation pair.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Request cancellation.  Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// A fresh signal linked to this handle.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of a cooperative cancellation pair.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// Non-blocking check, used at the top of consumption loops.
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is requested.  If every handle is dropped
    /// without aborting, this pends forever — a vanished caller is not a
    /// cancellation.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// A signal that never fires, for calls with no external cancellation.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open; one allocation per
        // stream without an external signal.
        std::mem::forget(tx);
        Self { rx }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
