//! # Worker set driving [`Subscribe`] implementations.
//!
//! One bus subscription and one worker task per subscriber. Workers stop when
//! the bus closes.
//!
//! Worker tasks use `catch_unwind` to isolate panics: the panic is logged and
//! the worker continues with the next notification.
//!
//! **Warning**: `AssertUnwindSafe` is used, which can leave shared state
//! inconsistent if a subscriber panics while holding a lock.

use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::events::Bus;

use super::Subscribe;

/// Running subscriber workers.
pub struct SubscriberSet {
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl SubscriberSet {
    /// Subscribes every entry of `subs` to `bus` and spawns its worker.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>, bus: &Bus) -> Self {
        let workers = subs
            .into_iter()
            .map(|s| {
                let name = s.name();
                (name, spawn_worker(s, bus))
            })
            .collect();
        Self { workers }
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True if there are no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Waits for every worker to finish (after the bus is closed).
    pub async fn join(self) {
        for (name, handle) in self.workers {
            if let Err(e) = handle.await {
                tracing::warn!(subscriber = name, error = %e, "subscriber worker failed");
            }
        }
    }
}

/// Spawns the worker of a single subscriber.
pub fn spawn_worker(sub: Arc<dyn Subscribe>, bus: &Bus) -> JoinHandle<()> {
    let mut subscription = bus.subscribe(&sub.kinds());
    tokio::spawn(async move {
        while let Some(kind) = subscription.recv().await {
            let fut = sub.on_event(kind);
            if let Err(panic_err) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                let info = if let Some(msg) = panic_err.downcast_ref::<&'static str>() {
                    (*msg).to_string()
                } else if let Some(msg) = panic_err.downcast_ref::<String>() {
                    msg.clone()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!(subscriber = sub.name(), kind = kind.as_label(), panic = %info, "subscriber panicked");
            }
        }
    })
}
