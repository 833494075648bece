//! # Runtime: wiring of the proxy core.
//!
//! ```text
//! RuntimeBuilder ──build()──► Runtime
//!   ├─ Bus ◄──────────── raise(...) from counters, state, watcher, host
//!   ├─ ConnManager ◄──── AddrChanged
//!   ├─ AddrWatcher (optional, polls AddressSource)
//!   ├─ Router (SiteSource)
//!   ├─ DirectTransport ──► ConnManager
//!   ├─ TunnelTransport ──► ConnManager + Handshake + KeyStore
//!   └─ SubscriberSet (Subscribe workers)
//! ```
//!
//! ## Shutdown
//! [`Runtime::run_until_shutdown`] waits for an OS signal or a raised
//! `ShutdownRequested`, then cancels the root scope, disconnects the tunnel,
//! stops the manager and closes the bus.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::TunnelError;
use crate::events::{Bus, EventKind, Subscription};
use crate::net::{AddrWatcher, AddressSource, Conn, ConnManager, Scope, SystemAddresses};
use crate::routing::{Disposition, Router, SiteSource};
use crate::stats::{ConnState, ConnStateCell, Counters};
use crate::subscribers::{Subscribe, SubscriberSet};
use crate::transport::tunnel::{
    Credentials, Handshake, KeyStore, ServerParams, ServerParamsSource, TunnelSession,
    TunnelTransport,
};
use crate::transport::{DirectTransport, Transport};

use super::memory::MemoryState;
use super::shutdown::wait_for_shutdown_signal;

/// Handshake used when the host supplies none: every session attempt fails.
struct NoHandshake;

#[async_trait]
impl Handshake for NoHandshake {
    async fn handshake(
        &self,
        _link: Conn,
        _server_addr: &str,
        _login: &str,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        Err(TunnelError::Protocol("no tunnel handshake configured".into()))
    }
}

/// Builder for [`Runtime`].
///
/// Every collaborator is optional: host state defaults to one shared
/// [`MemoryState`], addresses come from the operating system.
pub struct RuntimeBuilder {
    cfg: Config,
    sites: Option<Arc<dyn SiteSource>>,
    keys: Option<Arc<dyn KeyStore>>,
    params: Option<Arc<dyn ServerParamsSource>>,
    handshake: Option<Arc<dyn Handshake>>,
    addresses: Option<Arc<dyn AddressSource>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    #[cfg(feature = "logging")]
    log_writer: bool,
}

impl RuntimeBuilder {
    /// Creates a builder with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            sites: None,
            keys: None,
            params: None,
            handshake: None,
            addresses: None,
            subscribers: Vec::new(),
            #[cfg(feature = "logging")]
            log_writer: false,
        }
    }

    /// Sets the site-rule provider.
    pub fn with_sites(mut self, sites: Arc<dyn SiteSource>) -> Self {
        self.sites = Some(sites);
        self
    }

    /// Sets the key store.
    pub fn with_keys(mut self, keys: Arc<dyn KeyStore>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Sets the server-parameters provider.
    pub fn with_server_params(mut self, params: Arc<dyn ServerParamsSource>) -> Self {
        self.params = Some(params);
        self
    }

    /// Sets the tunnel handshake.
    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Sets the local address source.
    pub fn with_addresses(mut self, addresses: Arc<dyn AddressSource>) -> Self {
        self.addresses = Some(addresses);
        self
    }

    /// Sets bus subscribers, each driven by its own worker.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Adds a [`LogWriter`](crate::LogWriter) bound to the runtime's counters
    /// and connectivity state.
    #[cfg(feature = "logging")]
    pub fn with_log_writer(mut self) -> Self {
        self.log_writer = true;
        self
    }

    /// Builds the runtime and connects the tunnel with the stored parameters.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn build(self) -> Runtime {
        let memory = Arc::new(MemoryState::new());
        let sites = self
            .sites
            .unwrap_or_else(|| memory.clone() as Arc<dyn SiteSource>);
        let keys = self
            .keys
            .unwrap_or_else(|| memory.clone() as Arc<dyn KeyStore>);
        let params = self
            .params
            .unwrap_or_else(|| memory.clone() as Arc<dyn ServerParamsSource>);
        let handshake = self
            .handshake
            .unwrap_or_else(|| Arc::new(NoHandshake) as Arc<dyn Handshake>);
        let addresses = self
            .addresses
            .unwrap_or_else(|| Arc::new(SystemAddresses) as Arc<dyn AddressSource>);

        let bus = Bus::new();
        let root = Scope::new();
        let counters = Counters::new(&bus);
        let state = Arc::new(ConnStateCell::new(bus.clone()));
        let shutdown = bus.subscribe(&[EventKind::ShutdownRequested]);

        let manager = ConnManager::new(&bus, addresses.clone(), &self.cfg);
        let watcher = self.cfg.poll_interval().map(|every| {
            AddrWatcher::new(bus.clone(), addresses, every).spawn(root.child())
        });

        let direct = DirectTransport::new(
            manager.clone(),
            counters.tcp_connections.clone(),
            root.clone(),
        );
        let tunnel = TunnelTransport::new(
            &self.cfg,
            root.clone(),
            manager.clone(),
            handshake,
            keys,
            counters.clone(),
            state.clone(),
        );
        tunnel.reconnect(params.server_params()).await;

        #[allow(unused_mut)]
        let mut subs = self.subscribers;
        #[cfg(feature = "logging")]
        {
            if self.log_writer {
                subs.push(Arc::new(crate::subscribers::LogWriter::new(
                    counters.clone(),
                    state.clone(),
                )));
            }
        }
        let subscribers = SubscriberSet::new(subs, &bus);
        tracing::debug!(subscribers = subscribers.len(), "runtime started");

        Runtime {
            cfg: self.cfg,
            bus,
            root,
            counters,
            state,
            router: Router::new(sites),
            params,
            manager,
            direct,
            tunnel,
            watcher: std::sync::Mutex::new(watcher),
            shutdown: AsyncMutex::new(Some(shutdown)),
            subscribers: std::sync::Mutex::new(Some(subscribers)),
        }
    }
}

/// The assembled proxy core.
pub struct Runtime {
    cfg: Config,
    bus: Bus,
    root: Scope,
    counters: Counters,
    state: Arc<ConnStateCell>,
    router: Router,
    params: Arc<dyn ServerParamsSource>,
    manager: ConnManager,
    direct: DirectTransport,
    tunnel: TunnelTransport,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: AsyncMutex<Option<Subscription>>,
    subscribers: std::sync::Mutex<Option<SubscriberSet>>,
}

impl Runtime {
    /// Returns a builder.
    pub fn builder(cfg: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(cfg)
    }

    /// Configuration in use.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The event bus.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Root scope; cancelled on shutdown.
    pub fn root_scope(&self) -> &Scope {
        &self.root
    }

    /// Routes `host` against the current site rules.
    pub fn route(&self, host: &str) -> Disposition {
        self.router.route(host)
    }

    /// Transport serving `disposition`; `None` for [`Disposition::Block`].
    pub fn transport_for(&self, disposition: Disposition) -> Option<&dyn Transport> {
        match disposition {
            Disposition::Bypass => Some(&self.direct as &dyn Transport),
            Disposition::Forward => Some(&self.tunnel as &dyn Transport),
            Disposition::Block => None,
        }
    }

    /// Direct transport.
    pub fn direct(&self) -> &DirectTransport {
        &self.direct
    }

    /// Tunnel transport.
    pub fn tunnel(&self) -> &TunnelTransport {
        &self.tunnel
    }

    /// Connection manager.
    pub fn manager(&self) -> &ConnManager {
        &self.manager
    }

    /// Subscribes to `kinds` (empty for all).
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe(kinds)
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, sub: Subscription) {
        self.bus.unsubscribe(sub);
    }

    /// Tunnel connectivity state and its info text.
    pub fn conn_state(&self) -> (ConnState, String) {
        self.state.get()
    }

    /// Statistics counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Stored server parameters.
    pub fn server_params(&self) -> ServerParams {
        self.params.server_params()
    }

    /// Stores `params`, reconnects the tunnel and raises `ServerParamsChanged`.
    pub async fn set_server_params(&self, params: ServerParams) {
        self.params.set_server_params(params.clone());
        self.tunnel.reconnect(params).await;
        self.bus.raise(EventKind::ServerParamsChanged);
    }

    /// Raises `Startup`.
    pub fn raise_startup(&self) {
        self.bus.raise(EventKind::Startup);
    }

    /// Raises `ShutdownRequested`, ending [`Runtime::run_until_shutdown`].
    pub fn request_shutdown(&self) {
        self.bus.raise(EventKind::ShutdownRequested);
    }

    /// Waits for an OS termination signal or a shutdown request, then stops.
    ///
    /// Returns `Err` if signal handlers cannot be installed. A second call
    /// returns immediately.
    pub async fn run_until_shutdown(&self) -> io::Result<()> {
        let Some(mut requests) = self.shutdown.lock().await.take() else {
            return Ok(());
        };

        let result = tokio::select! {
            signal = wait_for_shutdown_signal() => match signal {
                Ok(name) => {
                    tracing::info!(signal = name, "shutdown signal received");
                    self.bus.raise(EventKind::ShutdownRequested);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            _ = requests.recv() => {
                tracing::info!("shutdown requested");
                Ok(())
            }
        };

        self.stop().await;
        result
    }

    async fn stop(&self) {
        self.root.cancel();
        self.tunnel.disconnect().await;
        self.manager.shutdown();

        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = watcher {
            let _ = handle.await;
        }

        self.bus.close();
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(set) = subscribers {
            set.join().await;
        }
        tracing::info!("runtime stopped");
    }
}
