//! A cancellable one-shot timer, the scheduling primitive `bcm_op` builds
//! its `timer`/`thrtimer` fields on.
//!
//! Modeled as a generation counter plus a `tokio` task: scheduling bumps the
//! generation and spawns a sleep; cancellation bumps the generation again
//! and aborts the task. A stale firing checks its captured generation
//! against the current one before doing anything, so cancel is idempotent
//! and safe to call from any context, and a late-arriving abort race never
//! runs a callback that was meant to be cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Timer {
    generation: Arc<AtomicU64>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Timer {
    pub fn new() -> Self {
        Timer {
            generation: Arc::new(AtomicU64::new(0)),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a tick is currently scheduled. Mirrors the kernel's
    /// `timer.expires != 0` check for "is this timer active".
    pub fn is_active(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }

    /// Cancels any pending tick. Safe to call even if nothing is scheduled.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Cancels any pending tick and schedules a new one `delay` from now.
    /// `callback` runs on the `tokio` runtime that was active at call time,
    /// not inline, so it must not assume it holds any lock the caller held.
    pub fn schedule<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let handle_slot = self.handle.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::SeqCst) == gen {
                *handle_slot.lock().unwrap() = None;
                callback();
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
