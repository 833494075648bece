//! # Level-triggered event bus.
//!
//! [`Bus`] signals coarse *"something changed"* notifications from many
//! raisers (counters, connectivity state, address watcher, ...) to many
//! subscribers (UI layer, connection manager, ...).
//!
//! ## Architecture
//! ```text
//! Raisers (many):                       Subscribers (many):
//!   Counter ───┐                             ┌──► [queue S1] ──► recv()
//!   ConnState ─┼── raise(kind) ──► pending ──┤
//!   Watcher ───┘   (atomic OR)   dispatcher  └──► [queue SN] ──► recv()
//! ```
//!
//! ## Rules
//! - **Non-blocking raise**: `raise()` ORs a bit into a global pending word and
//!   wakes the dispatcher only on the empty → non-empty transition.
//! - **Level-triggered**: repeated raises of one kind collapse into one
//!   outstanding notification per subscriber; a delivery means "poll the
//!   current state now", never "here is one historical event".
//! - **Single dispatcher**: one task owns per-subscriber pending bits and waits on
//!   `{wake} ∪ {send-ready(S) | S has pending kinds}`, dispatching by tag.
//! - **Deterministic order**: the lowest-numbered pending kind goes first.
//! - **Unsubscribe races are harmless**: a vanished subscriber is forgotten
//!   without delivery.
//!
//! Subscriber queues hold a single slot (the closest tokio has to a rendezvous
//! channel). Everything beyond that slot stays as pending bits.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{select_all, BoxFuture, FutureExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::event::{EventKind, EventMask};

/// Receiving end of a bus subscription.
///
/// Dropping it unsubscribes lazily: the dispatcher forgets the subscriber at
/// its next delivery attempt. [`Bus::unsubscribe`] removes it immediately.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<EventKind>,
}

impl Subscription {
    /// Waits for the next notification.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<EventKind> {
        self.rx.recv().await
    }

    /// Returns an already queued notification, if any.
    pub fn try_recv(&mut self) -> Option<EventKind> {
        self.rx.try_recv().ok()
    }

    /// Subscription identity (unique per bus).
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Dispatcher-side state of one subscriber.
struct Subscriber {
    tx: mpsc::Sender<EventKind>,
    mask: EventMask,
    /// Kinds raised but not yet handed over.
    pending: u32,
}

struct Inner {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    pending: AtomicU32,
    wake: Notify,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        // Critical sections never panic; recover the guard if one ever did.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves globally pending kinds into every interested subscriber.
    fn absorb_pending(&self) {
        let pending = self.pending.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return;
        }
        for s in self.lock().values_mut() {
            s.pending |= pending & s.mask.bits();
        }
    }
}

/// Event bus handle.
///
/// ### Properties
/// - **Cloneable**: cheap to clone (internally holds an `Arc`).
/// - **Lossless per kind**: a raised kind is eventually delivered at least once
///   to every subscriber interested in it that keeps receiving.
/// - **Collapsing**: never more deliveries of a kind than idle → pending
///   transitions observed by the dispatcher.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.inner.lock().len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

/// Outcome of one dispatcher wait.
enum Arm {
    Wake,
    Stop,
    Ready {
        id: u64,
        kind: EventKind,
        permit: Option<mpsc::OwnedPermit<EventKind>>,
    },
}

impl Bus {
    /// Creates a new bus and spawns its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            subscribers: Mutex::new(HashMap::new()),
            pending: AtomicU32::new(0),
            wake: Notify::new(),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });
        tokio::spawn(dispatch(Arc::clone(&inner)));
        Self { inner }
    }

    /// Subscribes to the given kinds; an empty slice means every kind.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().insert(
            id,
            Subscriber {
                tx,
                mask: EventMask::from_kinds(kinds),
                pending: 0,
            },
        );
        Subscription { id, rx }
    }

    /// Cancels a subscription.
    ///
    /// Safe to call while a delivery to it is in flight.
    pub fn unsubscribe(&self, sub: Subscription) {
        self.inner.lock().remove(&sub.id);
    }

    /// Raises an event kind.
    ///
    /// Never blocks. Concurrent raisers never lose a bit: the OR is a single
    /// atomic read-modify-write.
    pub fn raise(&self, kind: EventKind) {
        let old = self.inner.pending.fetch_or(kind.bit(), Ordering::AcqRel);
        if old == 0 {
            self.inner.wake.notify_one();
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Stops the dispatcher; subscribers observe `recv() == None` once their
    /// queue drains.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// True once [`Bus::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

/// The dispatcher loop.
async fn dispatch(inner: Arc<Inner>) {
    loop {
        // A stale wake permit is harmless; a missed one must not wedge the bus.
        inner.absorb_pending();

        let mut arms: Vec<BoxFuture<'static, Arm>> = Vec::with_capacity(4);
        let me = Arc::clone(&inner);
        arms.push(
            async move {
                me.wake.notified().await;
                Arm::Wake
            }
            .boxed(),
        );
        arms.push(
            inner
                .closed
                .clone()
                .cancelled_owned()
                .map(|()| Arm::Stop)
                .boxed(),
        );
        for (&id, s) in inner.lock().iter() {
            if let Some(kind) = EventKind::lowest(s.pending) {
                let tx = s.tx.clone();
                arms.push(
                    async move {
                        let permit = tx.reserve_owned().await.ok();
                        Arm::Ready { id, kind, permit }
                    }
                    .boxed(),
                );
            }
        }

        let (arm, _, rest) = select_all(arms).await;
        drop(rest);

        match arm {
            Arm::Stop => break,
            Arm::Wake => inner.absorb_pending(),
            Arm::Ready {
                id,
                kind,
                permit: Some(permit),
            } => {
                permit.send(kind);
                if let Some(s) = inner.lock().get_mut(&id) {
                    s.pending &= !kind.bit();
                }
            }
            Arm::Ready { id, permit: None, .. } => {
                // Receiver dropped without unsubscribing.
                inner.lock().remove(&id);
            }
        }
    }

    inner.lock().clear();
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn drain(sub: &mut Subscription) -> Vec<EventKind> {
        let mut got = Vec::new();
        while let Ok(Some(k)) = timeout(Duration::from_millis(50), sub.recv()).await {
            got.push(k);
        }
        got
    }

    #[tokio::test]
    async fn delivers_raised_kind() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[]);
        bus.raise(EventKind::CountersChanged);
        let got = timeout(Duration::from_secs(1), sub.recv()).await;
        assert_eq!(got.ok().flatten(), Some(EventKind::CountersChanged));
    }

    #[tokio::test]
    async fn repeated_raises_collapse() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[EventKind::CountersChanged]);
        for _ in 0..100 {
            bus.raise(EventKind::CountersChanged);
        }
        settle().await;
        let got = drain(&mut sub).await;
        assert!(!got.is_empty());
        // One slot in the queue plus at most one re-armed pending bit.
        assert!(got.len() <= 2, "got {got:?}");
        assert!(got.iter().all(|k| *k == EventKind::CountersChanged));
    }

    #[tokio::test]
    async fn no_redelivery_without_fresh_raise() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[]);
        bus.raise(EventKind::SitesChanged);
        assert_eq!(drain(&mut sub).await, vec![EventKind::SitesChanged]);
        assert!(drain(&mut sub).await.is_empty());
        bus.raise(EventKind::SitesChanged);
        assert_eq!(drain(&mut sub).await, vec![EventKind::SitesChanged]);
    }

    #[tokio::test]
    async fn interest_mask_filters_kinds() {
        let bus = Bus::new();
        let mut addr = bus.subscribe(&[EventKind::AddrChanged]);
        let mut all = bus.subscribe(&[]);
        bus.raise(EventKind::CountersChanged);
        bus.raise(EventKind::AddrChanged);
        settle().await;

        assert_eq!(drain(&mut addr).await, vec![EventKind::AddrChanged]);
        let mut got = drain(&mut all).await;
        got.sort_by_key(|k| *k as u8);
        assert_eq!(got, vec![EventKind::CountersChanged, EventKind::AddrChanged]);
    }

    #[tokio::test]
    async fn lowest_kind_delivered_first() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[]);
        // Park the first delivery in the queue slot so the rest stays pending.
        bus.raise(EventKind::ShutdownRequested);
        settle().await;
        bus.raise(EventKind::KeysChanged);
        bus.raise(EventKind::ConnStateChanged);
        settle().await;

        assert_eq!(
            drain(&mut sub).await,
            vec![
                EventKind::ShutdownRequested,
                EventKind::ConnStateChanged,
                EventKind::KeysChanged
            ]
        );
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_wedge_dispatcher() {
        let bus = Bus::new();
        let stale = bus.subscribe(&[]);
        let mut live = bus.subscribe(&[]);

        bus.raise(EventKind::Startup);
        settle().await;
        bus.raise(EventKind::CountersChanged);
        drop(stale);
        settle().await;

        let got = drain(&mut live).await;
        assert_eq!(got, vec![EventKind::Startup, EventKind::CountersChanged]);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscriber() {
        let bus = Bus::new();
        let sub = bus.subscribe(&[]);
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub);
        bus.raise(EventKind::Startup);
        settle().await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[]);
        bus.close();
        let got = timeout(Duration::from_secs(1), sub.recv()).await;
        assert_eq!(got.ok(), Some(None));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_raisers_lose_no_kind() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[]);
        let mut handles = Vec::new();
        for kind in [
            EventKind::CountersChanged,
            EventKind::SitesChanged,
            EventKind::KeysChanged,
            EventKind::AddrChanged,
        ] {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    bus.raise(kind);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.expect("raiser");
        }
        settle().await;

        let got = drain(&mut sub).await;
        for kind in [
            EventKind::CountersChanged,
            EventKind::SitesChanged,
            EventKind::KeysChanged,
            EventKind::AddrChanged,
        ] {
            assert!(got.contains(&kind), "{kind} lost in {got:?}");
        }
    }
}
