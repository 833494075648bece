//! # Statistics counters.
//!
//! A [`Counter`] is a shared atomic gauge: connections increment it on
//! successful dial and decrement it on close. Every change raises
//! [`EventKind::CountersChanged`] so the UI layer can re-read a
//! [`CountersSnapshot`].

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::events::{Bus, EventKind};

struct CounterInner {
    name: &'static str,
    value: AtomicI32,
    bus: Bus,
}

/// Shared handle to one statistics counter.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.inner.name)
            .field("value", &self.get())
            .finish()
    }
}

impl Counter {
    /// Creates a standalone counter raising on `bus`.
    pub fn new(name: &'static str, bus: Bus) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                name,
                value: AtomicI32::new(0),
                bus,
            }),
        }
    }

    /// Adds `val` and raises `CountersChanged`.
    pub fn add(&self, val: i32) {
        self.inner.value.fetch_add(val, Ordering::AcqRel);
        self.inner.bus.raise(EventKind::CountersChanged);
    }

    /// Increments by one.
    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    /// Decrements by one.
    #[inline]
    pub fn dec(&self) {
        self.add(-1);
    }

    /// Current value.
    pub fn get(&self) -> i32 {
        self.inner.value.load(Ordering::Acquire)
    }

    /// Counter name (matches the snapshot field).
    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

/// The collection of counters maintained by the core and the HTTP layer.
#[derive(Clone, Debug)]
pub struct Counters {
    /// Direct TCP connections.
    pub tcp_connections: Counter,
    /// Tunnel sessions (their underlying TCP links).
    pub tunnel_sessions: Counter,
    /// Logical connections carried by tunnel sessions.
    pub tunnel_connections: Counter,
    /// HTTP requests received.
    pub http_rq_received: Counter,
    /// HTTP requests in progress.
    pub http_rq_pending: Counter,
    /// HTTP requests routed directly.
    pub http_rq_direct: Counter,
    /// HTTP requests routed via the tunnel.
    pub http_rq_forwarded: Counter,
    /// HTTP requests blocked by a site rule.
    pub http_rq_blocked: Counter,
}

/// Point-in-time copy of [`Counters`], as served to the UI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    /// Direct TCP connections.
    pub tcp_connections: i32,
    /// Tunnel sessions.
    pub tunnel_sessions: i32,
    /// Logical tunnel connections.
    pub tunnel_connections: i32,
    /// HTTP requests received.
    pub http_rq_received: i32,
    /// HTTP requests in progress.
    pub http_rq_pending: i32,
    /// HTTP requests routed directly.
    pub http_rq_direct: i32,
    /// HTTP requests routed via the tunnel.
    pub http_rq_forwarded: i32,
    /// HTTP requests blocked by a site rule.
    pub http_rq_blocked: i32,
}

impl Counters {
    /// Creates zeroed counters raising on `bus`.
    pub fn new(bus: &Bus) -> Self {
        let c = |name| Counter::new(name, bus.clone());
        Self {
            tcp_connections: c("tcp_connections"),
            tunnel_sessions: c("tunnel_sessions"),
            tunnel_connections: c("tunnel_connections"),
            http_rq_received: c("http_rq_received"),
            http_rq_pending: c("http_rq_pending"),
            http_rq_direct: c("http_rq_direct"),
            http_rq_forwarded: c("http_rq_forwarded"),
            http_rq_blocked: c("http_rq_blocked"),
        }
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            tcp_connections: self.tcp_connections.get(),
            tunnel_sessions: self.tunnel_sessions.get(),
            tunnel_connections: self.tunnel_connections.get(),
            http_rq_received: self.http_rq_received.get(),
            http_rq_pending: self.http_rq_pending.get(),
            http_rq_direct: self.http_rq_direct.get(),
            http_rq_forwarded: self.http_rq_forwarded.get(),
            http_rq_blocked: self.http_rq_blocked.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn change_raises_counters_changed() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[EventKind::CountersChanged]);
        let counters = Counters::new(&bus);

        counters.tcp_connections.inc();
        counters.tcp_connections.inc();
        counters.tcp_connections.dec();

        assert_eq!(counters.tcp_connections.get(), 1);
        let got = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await;
        assert_eq!(got.ok().flatten(), Some(EventKind::CountersChanged));
    }

    #[tokio::test]
    async fn snapshot_serializes_all_fields() {
        let bus = Bus::new();
        let counters = Counters::new(&bus);
        counters.http_rq_blocked.add(3);

        let snap = counters.snapshot();
        assert_eq!(snap.http_rq_blocked, 3);
        let json = serde_json::to_value(snap).expect("serialize");
        assert_eq!(json["http_rq_blocked"], 3);
        assert_eq!(json["tunnel_sessions"], 0);
    }
}
