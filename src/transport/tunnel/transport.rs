//! # Tunnel transport.
//!
//! Multiplexes logical streams over a bounded set of tunnel sessions.
//!
//! ```text
//! dial_context ─► admit ─┬─ Ready(lease) ───────────────────────┐
//!                        ├─ Create ─► link dial ─► handshake ───┤─► open_stream ─► TunnelConn
//!                        └─ Wait ◄── pool changed (Notify) ─────┘
//!
//! reconnect(params) ─► swap generation ─► cancel old scope ─► wait old tracker
//! ```
//!
//! ## Rules
//! - Every dial holds a tracker token of its generation, taken while the
//!   current generation is read, so `reconnect` cannot miss it.
//! - Session waiters run on the same tracker; `reconnect` returns only after
//!   all of them have cleaned up.
//! - Connectivity state is only published for the current, live generation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;

use crate::config::Config;
use crate::error::DialError;
use crate::net::{with_default_port, ConnManager, Scope};
use crate::stats::{ConnState, ConnStateCell, Counters};
use crate::transport::{BoxStream, Transport};

use super::conn::TunnelConn;
use super::params::{Credentials, KeyStore, ServerParams};
use super::pool::{Admit, Generation, Lease, Lost, PoolSnapshot};
use super::session::{Handshake, TunnelSession};

struct Inner {
    manager: ConnManager,
    handshake: Arc<dyn Handshake>,
    keys: Arc<dyn KeyStore>,
    counters: Counters,
    state: Arc<ConnStateCell>,
    cap: usize,
    default_port: u16,
    root: Scope,
    current: Mutex<Arc<Generation>>,
    reconnecting: tokio::sync::Mutex<()>,
}

impl Inner {
    fn current(&self) -> MutexGuard<'_, Arc<Generation>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes `state` unless `generation` was replaced or cancelled.
    fn publish_for(&self, generation: &Arc<Generation>, state: ConnState, info: &str) {
        let current = self.current();
        if Arc::ptr_eq(&current, generation) && !generation.scope.is_cancelled() {
            self.state.set(state, info);
        }
    }
}

/// Session-pooled transport over the tunnel server.
///
/// Starts unconfigured; [`TunnelTransport::reconnect`] installs server
/// parameters. Cheap to clone.
#[derive(Clone)]
pub struct TunnelTransport {
    inner: Arc<Inner>,
}

impl TunnelTransport {
    /// Creates an unconfigured transport; [`Transport::dial`] uses `root`.
    pub fn new(
        cfg: &Config,
        root: Scope,
        manager: ConnManager,
        handshake: Arc<dyn Handshake>,
        keys: Arc<dyn KeyStore>,
        counters: Counters,
        state: Arc<ConnStateCell>,
    ) -> Self {
        let initial = Generation::new(root.child(), ServerParams::default(), String::new(), None);
        Self {
            inner: Arc::new(Inner {
                manager,
                handshake,
                keys,
                counters,
                state,
                cap: cfg.session_cap(),
                default_port: cfg.default_server_port,
                root,
                current: Mutex::new(Arc::new(initial)),
                reconnecting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Installs new server parameters.
    ///
    /// A no-op when `params` equal the current ones. Otherwise the previous
    /// generation is cancelled and this call waits until every dial and
    /// session of it has finished, then the state becomes
    /// [`ConnState::Trying`] or [`ConnState::NotConfigured`].
    pub async fn reconnect(&self, params: ServerParams) {
        let _serial = self.inner.reconnecting.lock().await;

        let old = {
            let mut current = self.inner.current();
            if current.params == params {
                return;
            }
            let credentials = params.credentials(self.inner.keys.as_ref());
            let server_addr = if params.addr.is_empty() {
                String::new()
            } else {
                with_default_port(&params.addr, self.inner.default_port)
            };
            let state = if credentials.is_some() {
                ConnState::Trying
            } else {
                ConnState::NotConfigured
            };
            tracing::info!(server = %server_addr, state = state.name(), "tunnel reconnect");

            let fresh = Generation::new(self.inner.root.child(), params, server_addr, credentials);
            let old = std::mem::replace(&mut *current, Arc::new(fresh));
            old.scope.cancel();
            self.inner.state.set(state, "");
            old
        };

        old.tracker.close();
        old.tracker.wait().await;
        tracing::debug!(server = %old.server_addr, "previous tunnel generation drained");
    }

    /// Drops the server parameters, closing every session and waiting for it.
    pub async fn disconnect(&self) {
        self.reconnect(ServerParams::default()).await;
    }

    /// Parameters of the current generation.
    pub fn server_params(&self) -> ServerParams {
        self.inner.current().params.clone()
    }

    /// Current connectivity state and its info text.
    pub fn conn_state(&self) -> (ConnState, String) {
        self.inner.state.get()
    }

    /// Pool bookkeeping of the current generation.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.inner.current().snapshot()
    }

    /// Like [`Transport::dial_context`] but returns the concrete [`TunnelConn`].
    pub async fn dial_tunnel(
        &self,
        scope: &Scope,
        network: &str,
        address: &str,
    ) -> Result<TunnelConn, DialError> {
        let (generation, _token) = {
            let current = self.inner.current();
            (Arc::clone(&current), current.tracker.token())
        };
        if generation.credentials.is_none() {
            return Err(DialError::ServerNotConfigured);
        }

        let lease = self.acquire(&generation, scope).await?;
        let opened = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(DialError::Canceled),
            _ = generation.scope.cancelled() => Err(DialError::Canceled),
            res = lease.session.open_stream(network, address) => {
                res.map_err(|reason| DialError::Stream { addr: address.to_string(), reason })
            }
        };
        match opened {
            Ok(stream) => {
                tracing::debug!(%address, "tunnel connection established");
                Ok(TunnelConn::new(
                    stream,
                    Arc::clone(&generation),
                    lease,
                    self.inner.counters.tunnel_connections.clone(),
                    scope,
                    address,
                ))
            }
            Err(e) => {
                generation.release(lease.slot);
                Err(e)
            }
        }
    }

    /// Obtains a session reference, creating a session when admission allows.
    async fn acquire(&self, generation: &Arc<Generation>, scope: &Scope) -> Result<Lease, DialError> {
        let mut first = true;
        loop {
            let step = generation.admit(self.inner.cap, first);
            first = false;
            match step {
                Admit::Ready(lease) => return Ok(lease),
                Admit::Create => {
                    return match self.create_session(generation, scope).await {
                        Ok(lease) => Ok(lease),
                        Err(e) => {
                            generation.creation_failed();
                            Err(e)
                        }
                    };
                }
                Admit::Wait(notified) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = scope.cancelled() => {
                            generation.withdraw();
                            return Err(DialError::Canceled);
                        }
                        _ = generation.scope.cancelled() => {
                            generation.withdraw();
                            return Err(DialError::Canceled);
                        }
                    }
                }
            }
        }
    }

    async fn create_session(
        &self,
        generation: &Arc<Generation>,
        scope: &Scope,
    ) -> Result<Lease, DialError> {
        let credentials = generation
            .credentials
            .as_ref()
            .ok_or(DialError::ServerNotConfigured)?;

        let session = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(DialError::Canceled),
            res = self.establish(generation, credentials) => res?,
        };

        let lease = generation.insert(Arc::clone(&session));
        tracing::info!(server = %generation.server_addr, "tunnel session established");
        generation.tracker.spawn(watch_session(
            Arc::downgrade(&self.inner),
            Arc::clone(generation),
            lease.slot,
            session,
            Arc::clone(&lease.lost),
        ));
        self.inner
            .publish_for(generation, ConnState::Established, "");
        Ok(lease)
    }

    /// Dials the session link under the generation scope and authenticates.
    async fn establish(
        &self,
        generation: &Generation,
        credentials: &Credentials,
    ) -> Result<Arc<dyn TunnelSession>, DialError> {
        let link = self
            .inner
            .manager
            .dial_context(
                &generation.scope,
                "tcp",
                &generation.server_addr,
                &self.inner.counters.tunnel_sessions,
            )
            .await?;

        tokio::select! {
            biased;
            _ = generation.scope.cancelled() => Err(DialError::Canceled),
            res = self.inner.handshake.handshake(
                link,
                &generation.server_addr,
                &generation.params.login,
                credentials,
            ) => res.map_err(|reason| DialError::Handshake {
                addr: generation.server_addr.clone(),
                reason,
            }),
        }
    }
}

/// Waits for a session to end, then takes it out of the pool.
async fn watch_session(
    inner: Weak<Inner>,
    generation: Arc<Generation>,
    slot: u64,
    session: Arc<dyn TunnelSession>,
    lost: Arc<Lost>,
) {
    let text = tokio::select! {
        text = session.closed() => text,
        _ = generation.scope.cancelled() => "tunnel disconnected".to_string(),
    };
    session.close();
    lost.trip(text.clone());

    let last = generation.remove(slot);
    tracing::info!(server = %generation.server_addr, reason = %text, "tunnel session terminated");
    if last {
        if let Some(inner) = inner.upgrade() {
            inner.publish_for(&generation, ConnState::Trying, &text);
        }
    }
}

#[async_trait]
impl Transport for TunnelTransport {
    async fn dial_context(
        &self,
        scope: &Scope,
        network: &str,
        address: &str,
    ) -> Result<BoxStream, DialError> {
        Ok(Box::new(self.dial_tunnel(scope, network, address).await?))
    }

    fn root_scope(&self) -> &Scope {
        &self.inner.root
    }
}

impl fmt::Debug for TunnelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelTransport")
            .field("generation", &*self.inner.current())
            .field("cap", &self.inner.cap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use crate::error::TunnelError;
    use crate::events::Bus;
    use crate::net::{abort_reason, Conn, StaticAddresses};
    use crate::transport::tunnel::Key;
    use crate::AbortReason;

    struct MockSession {
        link: Mutex<Option<Conn>>,
        peers: Mutex<Vec<DuplexStream>>,
        done: CancellationToken,
        text: Mutex<String>,
    }

    impl MockSession {
        fn kill(&self, text: &str) {
            *self.text.lock().expect("lock") = text.to_string();
            self.done.cancel();
        }
    }

    #[async_trait]
    impl TunnelSession for MockSession {
        async fn open_stream(&self, _: &str, address: &str) -> Result<BoxStream, TunnelError> {
            if self.done.is_cancelled() {
                return Err(TunnelError::Closed);
            }
            if address.starts_with("refused") {
                return Err(TunnelError::Protocol("connection refused".into()));
            }
            let (ours, theirs) = tokio::io::duplex(64);
            self.peers.lock().expect("lock").push(theirs);
            Ok(Box::new(ours))
        }

        async fn closed(&self) -> String {
            self.done.cancelled().await;
            self.text.lock().expect("lock").clone()
        }

        fn close(&self) {
            self.done.cancel();
            self.link.lock().expect("lock").take();
            self.peers.lock().expect("lock").clear();
        }
    }

    #[derive(Default)]
    struct MockHandshake {
        sessions: Mutex<Vec<Arc<MockSession>>>,
        entered: AtomicUsize,
        fail: AtomicBool,
        stall: AtomicBool,
    }

    impl MockHandshake {
        fn made(&self) -> Vec<Arc<MockSession>> {
            self.sessions.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Handshake for MockHandshake {
        async fn handshake(
            &self,
            link: Conn,
            _server_addr: &str,
            login: &str,
            _credentials: &Credentials,
        ) -> Result<Arc<dyn TunnelSession>, TunnelError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            if self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TunnelError::Auth(format!("{login}: bad password")));
            }
            let session = Arc::new(MockSession {
                link: Mutex::new(Some(link)),
                peers: Mutex::new(Vec::new()),
                done: CancellationToken::new(),
                text: Mutex::new(String::new()),
            });
            self.sessions.lock().expect("lock").push(Arc::clone(&session));
            Ok(session)
        }
    }

    struct Fixture {
        counters: Counters,
        handshake: Arc<MockHandshake>,
        tunnel: TunnelTransport,
        params: ServerParams,
        _listener: TcpListener,
    }

    async fn fixture(cap: usize) -> Fixture {
        let bus = Bus::new();
        let cfg = Config {
            max_conns_per_session: cap,
            ..Config::default()
        };
        let addrs = Arc::new(StaticAddresses::new([IpAddr::V4(Ipv4Addr::LOCALHOST)]));
        let manager = ConnManager::new(&bus, addrs, &cfg);
        let counters = Counters::new(&bus);
        let state = Arc::new(ConnStateCell::new(bus.clone()));
        let handshake = Arc::new(MockHandshake::default());
        let tunnel = TunnelTransport::new(
            &cfg,
            Scope::new(),
            manager,
            handshake.clone(),
            Arc::new(Vec::<Key>::new()),
            counters.clone(),
            state,
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let params = ServerParams {
            addr: listener.local_addr().expect("addr").to_string(),
            login: "alice".into(),
            password: "secret".into(),
            keyid: String::new(),
        };
        Fixture {
            counters,
            handshake,
            tunnel,
            params,
            _listener: listener,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        check()
    }

    #[tokio::test]
    async fn unconfigured_dial_fails_fast() {
        let f = fixture(2).await;
        let err = f.tunnel.dial("tcp", "example.com:80").await.err().expect("unconfigured");
        assert!(err.is_config());
        assert_eq!(f.tunnel.conn_state().0, ConnState::NotConfigured);
        assert_eq!(f.handshake.entered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn incomplete_params_stay_unconfigured() {
        let f = fixture(2).await;
        let mut params = f.params.clone();
        params.password.clear();
        f.tunnel.reconnect(params).await;
        assert_eq!(f.tunnel.conn_state().0, ConnState::NotConfigured);
        let err = f.tunnel.dial("tcp", "example.com:80").await.err().expect("unconfigured");
        assert!(matches!(err, DialError::ServerNotConfigured));
    }

    #[tokio::test]
    async fn four_dials_share_two_sessions() {
        let f = fixture(2).await;
        f.tunnel.reconnect(f.params.clone()).await;
        assert_eq!(f.tunnel.conn_state().0, ConnState::Trying);

        let scope = Scope::new();
        let dials = (0..4).map(|i| {
            let tunnel = f.tunnel.clone();
            let scope = scope.clone();
            async move { tunnel.dial_tunnel(&scope, "tcp", &format!("host{i}:80")).await }
        });
        let conns: Vec<TunnelConn> = futures::future::join_all(dials)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("dials");

        assert_eq!(f.handshake.made().len(), 2);
        let snap = f.tunnel.snapshot();
        assert_eq!(snap.sessions, 2);
        assert_eq!(snap.planned, 4);
        assert!(snap.loads.iter().all(|&refs| refs <= 2));
        assert_eq!(snap.loads.iter().sum::<usize>(), 4);
        assert_eq!(f.counters.tunnel_connections.get(), 4);
        assert_eq!(f.counters.tunnel_sessions.get(), 2);
        assert_eq!(f.tunnel.conn_state().0, ConnState::Established);

        drop(conns);
        let snap = f.tunnel.snapshot();
        assert_eq!(snap.planned, 0);
        assert_eq!(snap.loads, vec![0, 0]);
        assert_eq!(f.counters.tunnel_connections.get(), 0);
    }

    #[tokio::test]
    async fn streams_carry_bytes() {
        let f = fixture(2).await;
        f.tunnel.reconnect(f.params.clone()).await;
        let mut conn = f.tunnel.dial("tcp", "example.com:80").await.expect("dial");
        conn.write_all(b"hello").await.expect("write");

        let session = f.handshake.made().pop().expect("session");
        let mut peer = session.peers.lock().expect("lock").pop().expect("peer");
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn unchanged_reconnect_is_noop() {
        let f = fixture(2).await;
        f.tunnel.reconnect(f.params.clone()).await;
        let mut conn = f
            .tunnel
            .dial_tunnel(&Scope::new(), "tcp", "example.com:80")
            .await
            .expect("dial");
        let before = f.tunnel.conn_state();

        f.tunnel.reconnect(f.params.clone()).await;

        assert_eq!(f.tunnel.conn_state(), before);
        assert!(!conn.is_closed());
        conn.write_all(b"still here").await.expect("write");
        assert_eq!(f.handshake.made().len(), 1);
        assert_eq!(f.tunnel.snapshot().loads, vec![1]);
    }

    #[tokio::test]
    async fn cancelled_scope_releases_idle_stream() {
        let f = fixture(2).await;
        f.tunnel.reconnect(f.params.clone()).await;
        let scope = Scope::new();
        let mut conn = f
            .tunnel
            .dial_tunnel(&scope, "tcp", "example.com:80")
            .await
            .expect("dial");
        let session = f.handshake.made().pop().expect("session");
        let mut peer = session.peers.lock().expect("lock").pop().expect("peer");
        assert_eq!(f.counters.tunnel_connections.get(), 1);

        scope.cancel();

        // Nobody touches `conn` until the release has happened.
        let counters = &f.counters;
        assert!(eventually(|| counters.tunnel_connections.get() == 0).await);
        assert!(conn.is_closed());
        let snap = f.tunnel.snapshot();
        assert_eq!(snap.planned, 0);
        assert_eq!(snap.loads, vec![0]);

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.expect("eof"), 0);
        let err = conn.read(&mut buf).await.expect_err("closed");
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
        drop(conn);
        assert_eq!(f.counters.tunnel_connections.get(), 0);
    }

    #[tokio::test]
    async fn reconnect_waits_for_inflight_dials() {
        let f = fixture(4).await;
        f.handshake.stall.store(true, Ordering::SeqCst);
        f.tunnel.reconnect(f.params.clone()).await;

        let dials: Vec<_> = (0..3)
            .map(|i| {
                let tunnel = f.tunnel.clone();
                tokio::spawn(async move { tunnel.dial("tcp", &format!("host{i}:80")).await.err() })
            })
            .collect();
        // One dial is stuck in the handshake, the other two wait for admission.
        let tunnel = &f.tunnel;
        let waiting = PoolSnapshot {
            sessions: 1,
            planned: 3,
            loads: Vec::new(),
        };
        assert!(eventually(|| tunnel.snapshot() == waiting).await);
        assert_eq!(f.handshake.entered.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.tunnel_sessions.get(), 1);

        let mut moved = f.params.clone();
        moved.login = "bob".into();
        f.tunnel.reconnect(moved).await;

        assert!(dials.iter().all(|d| d.is_finished()));
        for dial in dials {
            let err = dial.await.expect("join").expect("dial must fail");
            assert!(matches!(err, DialError::Canceled));
        }
        assert_eq!(f.handshake.entered.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.tunnel_sessions.get(), 0);
        assert_eq!(f.tunnel.snapshot(), PoolSnapshot::default());
        assert_eq!(f.tunnel.conn_state().0, ConnState::Trying);
    }

    #[tokio::test]
    async fn session_loss_reports_trying_and_aborts_streams() {
        let f = fixture(2).await;
        f.tunnel.reconnect(f.params.clone()).await;
        let mut conn = f
            .tunnel
            .dial_tunnel(&Scope::new(), "tcp", "example.com:80")
            .await
            .expect("dial");
        assert_eq!(f.tunnel.conn_state().0, ConnState::Established);

        f.handshake.made()[0].kill("connection reset by peer");

        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.expect_err("session lost");
        assert_eq!(
            abort_reason(&err),
            Some(&AbortReason::SessionLost("connection reset by peer".into()))
        );
        assert_eq!(
            f.tunnel.conn_state(),
            (ConnState::Trying, "connection reset by peer".to_string())
        );
        assert_eq!(f.counters.tunnel_sessions.get(), 0);

        drop(conn);
        assert_eq!(f.counters.tunnel_connections.get(), 0);
        assert_eq!(f.tunnel.snapshot(), PoolSnapshot::default());
    }

    #[tokio::test]
    async fn failed_handshake_rolls_back() {
        let f = fixture(2).await;
        f.handshake.fail.store(true, Ordering::SeqCst);
        f.tunnel.reconnect(f.params.clone()).await;

        let err = f.tunnel.dial("tcp", "example.com:80").await.err().expect("auth");
        assert_eq!(err.as_label(), "dial_handshake_failed");
        assert_eq!(f.tunnel.snapshot(), PoolSnapshot::default());
        assert_eq!(f.counters.tunnel_sessions.get(), 0);

        f.handshake.fail.store(false, Ordering::SeqCst);
        let conn = f.tunnel.dial("tcp", "example.com:80").await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn failed_stream_releases_reference() {
        let f = fixture(2).await;
        f.tunnel.reconnect(f.params.clone()).await;

        let err = f.tunnel.dial("tcp", "refused:80").await.err().expect("refused");
        assert_eq!(err.as_label(), "dial_stream_failed");
        let snap = f.tunnel.snapshot();
        assert_eq!(snap.planned, 0);
        assert_eq!(snap.loads, vec![0]);
        assert_eq!(f.counters.tunnel_connections.get(), 0);
    }

    #[tokio::test]
    async fn disconnect_tears_everything_down() {
        let f = fixture(2).await;
        f.tunnel.reconnect(f.params.clone()).await;
        let mut conn = f
            .tunnel
            .dial_tunnel(&Scope::new(), "tcp", "example.com:80")
            .await
            .expect("dial");

        f.tunnel.disconnect().await;

        assert_eq!(f.tunnel.conn_state().0, ConnState::NotConfigured);
        assert_eq!(f.tunnel.server_params(), ServerParams::default());
        assert_eq!(f.counters.tunnel_sessions.get(), 0);
        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.expect_err("disconnected");
        assert!(matches!(abort_reason(&err), Some(AbortReason::SessionLost(_))));
    }
}
