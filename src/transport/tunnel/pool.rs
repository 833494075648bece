//! # Session pool of one reconnect generation.
//!
//! A [`Generation`] lives from one `reconnect` to the next. It owns the
//! scope every session link is dialed under, the pool bookkeeping and the
//! tracker that `reconnect` waits on before declaring the old generation gone.
//!
//! ## Rules
//! - `planned` counts streams that are open or admitted but not yet dialed.
//! - `session_count` counts sessions that are live or being created.
//! - A new session may be created only while `session_count * cap < planned`.
//! - The pool lock is never held across `.await`; waiters enable their
//!   `Notified` future before releasing it, so no wake-up is lost.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::net::Scope;

use super::params::{Credentials, ServerParams};
use super::session::TunnelSession;

/// Termination signal shared by a session and the streams riding it.
#[derive(Default)]
pub(super) struct Lost {
    token: CancellationToken,
    text: OnceLock<String>,
}

impl Lost {
    pub(super) fn trip(&self, text: String) {
        let _ = self.text.set(text);
        self.token.cancel();
    }

    pub(super) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(super) fn text(&self) -> String {
        self.text.get().cloned().unwrap_or_default()
    }
}

struct Slot {
    id: u64,
    refs: usize,
    session: Arc<dyn TunnelSession>,
    lost: Arc<Lost>,
}

#[derive(Default)]
pub(super) struct PoolState {
    slots: Vec<Slot>,
    session_count: usize,
    planned: usize,
    next_id: u64,
}

/// Session handed to a dialer; one reference on the session is held for it.
pub(super) struct Lease {
    pub(super) slot: u64,
    pub(super) session: Arc<dyn TunnelSession>,
    pub(super) lost: Arc<Lost>,
}

/// Outcome of one admission attempt under the lock.
pub(super) enum Admit<'a> {
    /// A spare session was found and referenced.
    Ready(Lease),
    /// The caller must create a session; `session_count` was already bumped.
    Create,
    /// Nothing to do but wait for the pool to change.
    Wait(Pin<Box<Notified<'a>>>),
}

/// Point-in-time view of the pool, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Sessions live or being created.
    pub sessions: usize,
    /// Streams open or admitted but not yet dialed.
    pub planned: usize,
    /// Reference count of every live session.
    pub loads: Vec<usize>,
}

pub(super) struct Generation {
    pub(super) scope: Scope,
    pub(super) params: ServerParams,
    pub(super) server_addr: String,
    pub(super) credentials: Option<Credentials>,
    pub(super) tracker: TaskTracker,
    state: Mutex<PoolState>,
    changed: Notify,
}

impl Generation {
    pub(super) fn new(
        scope: Scope,
        params: ServerParams,
        server_addr: String,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            scope,
            params,
            server_addr,
            credentials,
            tracker: TaskTracker::new(),
            state: Mutex::new(PoolState::default()),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One admission step. `first` registers the caller in `planned`.
    pub(super) fn admit(&self, cap: usize, first: bool) -> Admit<'_> {
        let mut st = self.lock();
        if first {
            st.planned += 1;
        }

        let spare = st
            .slots
            .iter_mut()
            .filter(|s| s.refs < cap)
            .min_by_key(|s| s.refs);
        if let Some(slot) = spare {
            slot.refs += 1;
            return Admit::Ready(Lease {
                slot: slot.id,
                session: Arc::clone(&slot.session),
                lost: Arc::clone(&slot.lost),
            });
        }

        if st.session_count * cap < st.planned {
            st.session_count += 1;
            return Admit::Create;
        }

        let mut notified = Box::pin(self.changed.notified());
        notified.as_mut().enable();
        Admit::Wait(notified)
    }

    /// Registers a freshly created session holding one reference.
    pub(super) fn insert(&self, session: Arc<dyn TunnelSession>) -> Lease {
        let lost = Arc::new(Lost::default());
        let mut st = self.lock();
        st.next_id += 1;
        let id = st.next_id;
        st.slots.push(Slot {
            id,
            refs: 1,
            session: Arc::clone(&session),
            lost: Arc::clone(&lost),
        });
        drop(st);
        self.changed.notify_waiters();
        Lease {
            slot: id,
            session,
            lost,
        }
    }

    /// Undoes a failed session creation.
    pub(super) fn creation_failed(&self) {
        let mut st = self.lock();
        st.session_count -= 1;
        st.planned -= 1;
        drop(st);
        self.changed.notify_waiters();
    }

    /// Withdraws a caller that gave up while waiting for admission.
    pub(super) fn withdraw(&self) {
        self.lock().planned -= 1;
        self.changed.notify_waiters();
    }

    /// Drops the reference held for one stream.
    pub(super) fn release(&self, slot: u64) {
        let mut st = self.lock();
        st.planned -= 1;
        if let Some(s) = st.slots.iter_mut().find(|s| s.id == slot) {
            s.refs -= 1;
        }
        drop(st);
        self.changed.notify_waiters();
    }

    /// Removes a terminated session. Returns `true` if no session is left.
    pub(super) fn remove(&self, slot: u64) -> bool {
        let mut st = self.lock();
        st.slots.retain(|s| s.id != slot);
        st.session_count -= 1;
        let last = st.slots.is_empty();
        drop(st);
        self.changed.notify_waiters();
        last
    }

    pub(super) fn snapshot(&self) -> PoolSnapshot {
        let st = self.lock();
        PoolSnapshot {
            sessions: st.session_count,
            planned: st.planned,
            loads: st.slots.iter().map(|s| s.refs).collect(),
        }
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("scope", &self.scope)
            .field("server_addr", &self.server_addr)
            .field("configured", &self.credentials.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::TunnelError;
    use crate::transport::BoxStream;

    struct Idle;

    #[async_trait]
    impl TunnelSession for Idle {
        async fn open_stream(&self, _: &str, _: &str) -> Result<BoxStream, TunnelError> {
            Err(TunnelError::Closed)
        }
        async fn closed(&self) -> String {
            std::future::pending().await
        }
        fn close(&self) {}
    }

    fn generation() -> Generation {
        Generation::new(Scope::new(), ServerParams::default(), String::new(), None)
    }

    #[test]
    fn admission_spreads_load_and_caps_sessions() {
        let g = generation();
        let cap = 2;

        assert!(matches!(g.admit(cap, true), Admit::Create));
        let a = g.insert(Arc::new(Idle));
        // planned = 2, one session of capacity 2: reuse it.
        let Admit::Ready(b) = g.admit(cap, true) else { panic!("expected spare session") };
        assert_eq!(b.slot, a.slot);
        // planned = 3 exceeds 1 * 2: create.
        assert!(matches!(g.admit(cap, true), Admit::Create));
        // planned = 4 equals 2 * 2: wait.
        assert!(matches!(g.admit(cap, true), Admit::Wait(_)));

        let c = g.insert(Arc::new(Idle));
        let Admit::Ready(d) = g.admit(cap, false) else { panic!("expected spare session") };
        assert_eq!(d.slot, c.slot);
        assert_eq!(
            g.snapshot(),
            PoolSnapshot { sessions: 2, planned: 4, loads: vec![2, 2] }
        );

        g.release(a.slot);
        assert_eq!(g.snapshot().loads, vec![1, 2]);
    }

    #[test]
    fn least_loaded_session_wins() {
        let g = generation();
        assert!(matches!(g.admit(3, true), Admit::Create));
        let a = g.insert(Arc::new(Idle));
        let Admit::Ready(_) = g.admit(3, true) else { panic!("expected spare session") };
        g.lock().session_count += 1;
        g.lock().planned += 1;
        let b = g.insert(Arc::new(Idle));
        let Admit::Ready(pick) = g.admit(3, true) else { panic!("expected spare session") };
        assert_eq!(pick.slot, b.slot);
        assert_ne!(pick.slot, a.slot);
    }

    #[test]
    fn failed_creation_rolls_back() {
        let g = generation();
        assert!(matches!(g.admit(2, true), Admit::Create));
        g.creation_failed();
        assert_eq!(g.snapshot(), PoolSnapshot::default());
    }

    #[test]
    fn removing_last_session_reports_it() {
        let g = generation();
        assert!(matches!(g.admit(1, true), Admit::Create));
        let a = g.insert(Arc::new(Idle));
        assert!(matches!(g.admit(1, true), Admit::Create));
        let b = g.insert(Arc::new(Idle));
        assert!(!g.remove(a.slot));
        assert!(g.remove(b.slot));
        // Streams on a removed session still release cleanly.
        g.release(a.slot);
        g.release(b.slot);
        assert_eq!(g.snapshot(), PoolSnapshot::default());
    }

    #[tokio::test]
    async fn waiter_wakes_when_session_lands() {
        let g = Arc::new(generation());
        assert!(matches!(g.admit(2, true), Admit::Create));
        // The session being created already covers this caller.
        let Admit::Wait(notified) = g.admit(2, true) else { panic!("expected wait") };

        let g2 = Arc::clone(&g);
        tokio::spawn(async move {
            g2.insert(Arc::new(Idle));
        });
        notified.await;
        assert!(matches!(g.admit(2, false), Admit::Ready(_)));
        assert_eq!(g.snapshot().loads, vec![2]);
    }
}
