//! # tunproxy
//!
//! **tunproxy** is the core of a local HTTP proxy that sends each outbound
//! connection either directly or through a remote tunnel server.
//!
//! It provides the plumbing below the HTTP layer: a level-triggered change
//! bus, a host router, a connection manager that ties every outbound socket
//! to a cancellation scope and to its local address, and a tunnel transport
//! multiplexing many streams over a bounded pool of sessions.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                    HTTP layer (not part of this crate)
//!                           │ route(host)
//!                           ▼
//!                    ┌─────────────┐
//!                    │   Router    │── SiteSource (host rules)
//!                    └──┬───────┬──┘
//!              Bypass   │       │   Forward            Block ─► refuse
//!                       ▼       ▼
//!        ┌─────────────────┐  ┌──────────────────────────────────┐
//!        │ DirectTransport │  │ TunnelTransport                  │
//!        │                 │  │  Generation (per reconnect)      │
//!        │                 │  │   ├─ session pool (admission)    │
//!        │                 │  │   └─ tracker (in-flight dials)   │
//!        └────────┬────────┘  └───────┬──────────────────────────┘
//!                 │ dial_context      │ link dial        Handshake
//!                 ▼                   ▼
//!        ┌──────────────────────────────────────────────────────┐
//!        │ ConnManager (actor)                                  │
//!        │   by_scope: ScopeId -> conns   (scope cancel → close)│
//!        │   by_addr:  IpAddr  -> conns   (addr gone → abort)   │
//!        └──────────────────────────▲───────────────────────────┘
//!                                   │ AddrChanged
//! ┌─────────────────────────────────┴────────────────────────────────┐
//! │ Bus (level-triggered, one dispatcher, one-slot queues)           │
//! │   raised by: Counter, ConnStateCell, AddrWatcher, Runtime, host  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Connection lifecycle
//! ```text
//! dial_context(scope) ──► connect ──► Conn (counter += 1) ──► registered
//!
//!   close() / drop        ─┐
//!   scope cancelled        ├─► first wins: counter -= 1, reason recorded,
//!   local address vanished ┘   deregistered; later IO fails with the reason
//! ```
//!
//! ## Features
//! | Area              | Description                                              | Key types / traits                        |
//! |-------------------|----------------------------------------------------------|-------------------------------------------|
//! | **Bus**           | Coalescing "something changed" notifications.            | [`Bus`], [`EventKind`], [`Subscribe`]     |
//! | **Routing**       | Host → bypass / forward / block.                         | [`Router`], [`SiteRule`], [`Disposition`] |
//! | **Connections**   | Scoped, address-aware outbound TCP.                      | [`ConnManager`], [`Conn`], [`Scope`]      |
//! | **Transports**    | Direct and tunnel dialing behind one trait.              | [`Transport`], [`TunnelTransport`]        |
//! | **Tunnel seams**  | Plug in the session technology.                          | [`Handshake`], [`TunnelSession`]          |
//! | **Errors**        | Typed dial errors and abort reasons.                     | [`DialError`], [`AbortReason`]            |
//! | **Configuration** | Centralized core settings.                               | [`Config`]                                |
//!
//! ## Optional features
//! - `logging`: exports [`LogWriter`], a subscriber reporting bus
//!   notifications through `tracing`, and `RuntimeBuilder::with_log_writer`.
//!
//! ## Example
//! ```rust
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//! use tunproxy::{Config, Disposition, MemoryState, Runtime, SiteRule, StaticAddresses};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = Arc::new(MemoryState::new());
//!     state.set_sites(vec![SiteRule::forward("example.com").recursive()]);
//!
//!     let rt = Runtime::builder(Config::default())
//!         .with_sites(state.clone())
//!         .with_keys(state.clone())
//!         .with_server_params(state)
//!         .with_addresses(Arc::new(StaticAddresses::new([IpAddr::V4(Ipv4Addr::LOCALHOST)])))
//!         .build()
//!         .await;
//!     rt.raise_startup();
//!
//!     assert_eq!(rt.route("www.example.com"), Disposition::Forward);
//!     assert_eq!(rt.route("example.org"), Disposition::Bypass);
//!
//!     rt.request_shutdown();
//!     rt.run_until_shutdown().await?;
//!     Ok(())
//! }
//! ```
mod config;
mod core;
mod error;
mod events;
mod routing;
mod stats;
mod subscribers;
mod transport;

pub mod net;

// ---- Public re-exports ----

pub use config::Config;
pub use self::core::{wait_for_shutdown_signal, MemoryState, Runtime, RuntimeBuilder};
pub use error::{AbortReason, DialError, TunnelError};
pub use events::{Bus, EventKind, EventMask, Subscription};
pub use net::{
    abort_reason, AbortHandle, AddrWatcher, AddressSource, Conn, ConnManager, Scope, ScopeId,
    StaticAddresses, SystemAddresses, Tracked,
};
pub use routing::{route_with, Disposition, Router, SiteRule, SiteSource};
pub use stats::{ConnState, ConnStateCell, Counter, Counters, CountersSnapshot};
pub use subscribers::{spawn_worker, Subscribe, SubscriberSet};
pub use transport::tunnel::{
    Credentials, Handshake, Key, KeyStore, PoolSnapshot, ServerParams, ServerParamsSource,
    TunnelConn, TunnelSession, TunnelTransport,
};
pub use transport::{AsyncStream, BoxStream, DirectTransport, Transport};

// Optional: expose the built-in logging subscriber.
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
