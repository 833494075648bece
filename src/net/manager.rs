//! # Connection manager.
//!
//! Dials outbound TCP connections and keeps them under control: every live
//! [`Conn`] is indexed by the [`Scope`] it was dialed under and by its local
//! IP address, so whole groups can be torn down at once.
//!
//! ```text
//!   dial_context(scope, ..) ──► connect ──► Conn ──► Command::Add ──┐
//!   Conn::close/abort/drop  ─────────────────────► Command::Remove ─┤
//!                                                                   ▼
//!                                       ┌──────────── manager task ─────────────┐
//!   Bus(AddrChanged) ──────────────────►│ by_scope: ScopeId -> {ids, unwatch}   │
//!   scope cancelled (FuturesUnordered) ►│ by_addr:  IpAddr  -> {ids}            │
//!                                       └─────────────┬─────────────────────────┘
//!                                                     ▼
//!                                      spawned fan-out: close / abort(NetDisconnected)
//! ```
//!
//! ## Rules
//! - The indices are owned by the manager task and touched nowhere else.
//! - Teardown fan-outs run in spawned tasks, never inside the manager loop.
//! - Every registration carries the address generation seen before dialing;
//!   if it is stale, the manager re-checks addresses right away so a
//!   connection bound to an address that vanished mid-dial still gets aborted.
//! - A scope watch resolves either on cancellation or when its entry empties,
//!   so scopes that are never cancelled do not leak watchers.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{AbortReason, DialError};
use crate::events::{Bus, EventKind, Subscription};
use crate::stats::Counter;

use super::addr::AddressSource;
use super::conn::{Conn, ConnId, ConnShared};
use super::scope::{Scope, ScopeId};

/// Messages processed by the manager task.
pub(crate) enum Command {
    Add {
        conn: Arc<ConnShared>,
        generation: u64,
    },
    Remove {
        id: ConnId,
    },
    Tracked {
        reply: oneshot::Sender<Tracked>,
    },
}

/// Diagnostic snapshot of the manager indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tracked {
    /// Registered connections.
    pub connections: usize,
    /// Scopes with at least one registered connection.
    pub scopes: usize,
    /// Local addresses with at least one registered connection.
    pub addresses: usize,
}

struct Shared {
    cmd: mpsc::UnboundedSender<Command>,
    addr_generation: AtomicU64,
    next_id: AtomicU64,
    keepalive: Option<Duration>,
    stop: CancellationToken,
}

/// Handle to the connection manager task.
///
/// Cheap to clone; all clones talk to the same task.
#[derive(Clone)]
pub struct ConnManager {
    shared: Arc<Shared>,
}

impl ConnManager {
    /// Spawns the manager task.
    ///
    /// Must be called within a Tokio runtime. The task subscribes to
    /// [`EventKind::AddrChanged`] on `bus` and stops on [`ConnManager::shutdown`]
    /// or when the bus closes and every handle is gone.
    pub fn new(bus: &Bus, addresses: Arc<dyn AddressSource>, cfg: &Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            cmd: tx,
            addr_generation: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            keepalive: cfg.keepalive(),
            stop: CancellationToken::new(),
        });

        let task = ManagerTask {
            shared: Arc::clone(&shared),
            addresses,
            conns: HashMap::new(),
            by_scope: HashMap::new(),
            by_addr: HashMap::new(),
            watches: FuturesUnordered::new(),
        };
        let events = bus.subscribe(&[EventKind::AddrChanged]);
        tokio::spawn(task.run(rx, events));

        Self { shared }
    }

    /// Dials `address` over `network` under `scope`.
    ///
    /// On success the connection is registered, `counter` is incremented and
    /// will be decremented exactly once when the connection goes away.
    /// Cancelling `scope` aborts the dial and later closes the connection.
    pub async fn dial_context(
        &self,
        scope: &Scope,
        network: &str,
        address: &str,
        counter: &Counter,
    ) -> Result<Conn, DialError> {
        if scope.is_cancelled() {
            return Err(DialError::Canceled);
        }
        let generation = self.shared.addr_generation.load(Ordering::Acquire);

        let stream = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(DialError::Canceled),
            res = self.connect(network, address) => res?,
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Conn::new(
            id,
            stream,
            scope.clone(),
            counter.clone(),
            self.shared.cmd.clone(),
        );
        counter.inc();

        let shared = Arc::clone(conn.shared());
        if self
            .shared
            .cmd
            .send(Command::Add { conn: shared, generation })
            .is_err()
        {
            tracing::warn!(id, "connection manager stopped; connection is untracked");
        }
        Ok(conn)
    }

    /// Snapshot of the indices, answered by the manager task.
    ///
    /// Returns the default (empty) snapshot if the task has stopped.
    pub async fn tracked(&self) -> Tracked {
        let (tx, rx) = oneshot::channel();
        if self.shared.cmd.send(Command::Tracked { reply: tx }).is_err() {
            return Tracked::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Current address generation; bumped on every `AddrChanged`.
    pub fn addr_generation(&self) -> u64 {
        self.shared.addr_generation.load(Ordering::Acquire)
    }

    /// Stops the manager task, closing every tracked connection.
    pub fn shutdown(&self) {
        self.shared.stop.cancel();
    }

    async fn connect(&self, network: &str, address: &str) -> Result<TcpStream, DialError> {
        let family: Option<bool> = match network {
            "tcp" => None,
            "tcp4" => Some(true),
            "tcp6" => Some(false),
            other => {
                return Err(DialError::UnsupportedNetwork {
                    network: other.to_string(),
                })
            }
        };

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(address)
            .await
            .map_err(|source| DialError::Resolve {
                addr: address.to_string(),
                source,
            })?
            .filter(|a| family.map_or(true, |v4| a.is_ipv4() == v4))
            .collect();
        if candidates.is_empty() {
            return Err(DialError::Resolve {
                addr: address.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no {network} address found"),
                ),
            });
        }

        let mut last = None;
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    self.configure(&stream);
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::trace!(addr = %candidate, error = %e, "connect attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(DialError::Connect {
            addr: address.to_string(),
            source: last.unwrap_or_else(|| std::io::ErrorKind::AddrNotAvailable.into()),
        })
    }

    fn configure(&self, stream: &TcpStream) {
        let Some(idle) = self.shared.keepalive else {
            return;
        };
        let keepalive = TcpKeepalive::new().with_time(idle);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!(error = %e, "failed to enable tcp keep-alive");
        }
    }
}

impl std::fmt::Debug for ConnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnManager")
            .field("addr_generation", &self.addr_generation())
            .field("stopped", &self.shared.stop.is_cancelled())
            .finish()
    }
}

struct ScopeEntry {
    ids: HashSet<ConnId>,
    unwatch: CancellationToken,
}

/// Resolves with the scope id and whether the scope itself was cancelled.
type Watch = BoxFuture<'static, (ScopeId, bool)>;

struct ManagerTask {
    shared: Arc<Shared>,
    addresses: Arc<dyn AddressSource>,
    conns: HashMap<ConnId, Arc<ConnShared>>,
    by_scope: HashMap<ScopeId, ScopeEntry>,
    by_addr: HashMap<IpAddr, HashSet<ConnId>>,
    watches: FuturesUnordered<Watch>,
}

impl ManagerTask {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut events: Subscription,
    ) {
        let stop = self.shared.stop.clone();
        let mut bus_open = true;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some((scope, cancelled)) = self.watches.next(), if !self.watches.is_empty() => {
                    if cancelled {
                        self.scope_done(scope);
                    }
                }
                ev = events.recv(), if bus_open => match ev {
                    Some(_) => {
                        self.shared.addr_generation.fetch_add(1, Ordering::AcqRel);
                        self.revalidate();
                    }
                    None => bus_open = false,
                },
            }
        }

        let remaining: Vec<_> = self.conns.drain().map(|(_, c)| c).collect();
        tracing::debug!(connections = remaining.len(), "connection manager stopped");
        for conn in remaining {
            conn.abort(None);
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Add { conn, generation } => {
                if conn.is_closed() {
                    return;
                }
                self.add(conn);
                if generation != self.shared.addr_generation.load(Ordering::Acquire) {
                    self.revalidate();
                }
            }
            Command::Remove { id } => self.remove(id),
            Command::Tracked { reply } => {
                let _ = reply.send(Tracked {
                    connections: self.conns.len(),
                    scopes: self.by_scope.len(),
                    addresses: self.by_addr.len(),
                });
            }
        }
    }

    fn add(&mut self, conn: Arc<ConnShared>) {
        let id = conn.id;
        let scope = conn.scope.clone();
        if let Some(ip) = conn.local_ip {
            self.by_addr.entry(ip).or_default().insert(id);
        }
        if self.conns.insert(id, conn).is_some() {
            panic!("internal error: connection {id} registered twice");
        }

        let entry = self.by_scope.entry(scope.id()).or_insert_with(|| {
            let unwatch = CancellationToken::new();
            let id = scope.id();
            let cancelled = scope.cancelled_owned();
            let dropped = unwatch.clone().cancelled_owned();
            self.watches.push(
                async move {
                    tokio::select! {
                        _ = cancelled => (id, true),
                        _ = dropped => (id, false),
                    }
                }
                .boxed(),
            );
            ScopeEntry {
                ids: HashSet::new(),
                unwatch,
            }
        });
        entry.ids.insert(id);
    }

    fn remove(&mut self, id: ConnId) {
        let Some(conn) = self.conns.remove(&id) else {
            tracing::trace!(id, "deregistration of an untracked connection ignored");
            return;
        };

        if let Some(ip) = conn.local_ip {
            if let Some(ids) = self.by_addr.get_mut(&ip) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_addr.remove(&ip);
                }
            }
        }

        let scope = conn.scope.id();
        if let Some(entry) = self.by_scope.get_mut(&scope) {
            entry.ids.remove(&id);
            if entry.ids.is_empty() {
                if let Some(entry) = self.by_scope.remove(&scope) {
                    entry.unwatch.cancel();
                }
            }
        }
    }

    fn scope_done(&mut self, scope: ScopeId) {
        let Some(entry) = self.by_scope.remove(&scope) else {
            return;
        };
        entry.unwatch.cancel();
        let victims: Vec<_> = entry
            .ids
            .iter()
            .filter_map(|id| self.conns.get(id).cloned())
            .collect();
        if victims.is_empty() {
            return;
        }
        tracing::debug!(%scope, connections = victims.len(), "scope done, closing connections");
        tokio::spawn(async move {
            for conn in victims {
                conn.abort(None);
            }
        });
    }

    fn revalidate(&mut self) {
        if self.by_addr.is_empty() {
            return;
        }
        let present = match self.addresses.local_addresses() {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate local addresses");
                return;
            }
        };

        let victims: Vec<_> = self
            .by_addr
            .iter()
            .filter(|(ip, _)| !present.contains(ip))
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| self.conns.get(id).cloned())
            .collect();
        if victims.is_empty() {
            return;
        }

        tracing::info!(connections = victims.len(), "local address gone, aborting connections");
        tokio::spawn(async move {
            for conn in victims {
                tracing::debug!(conn = %conn.describe(), "connection aborted: address gone");
                conn.abort(Some(AbortReason::NetDisconnected));
            }
        });
    }
}
