//! Error types used by the proxy core.
//!
//! This module defines the error values the core hands to its callers:
//!
//! - [`DialError`]: failures of `Transport::dial*` and `ConnManager::dial_context`.
//! - [`AbortReason`]: why the core tore a live connection down on its own.
//! - [`TunnelError`]: errors reported by tunnel session implementations.
//!
//! All of them provide `as_label` for logs/metrics, in the same snake_case
//! style everywhere.

use std::io;

use thiserror::Error;

/// # Errors produced while dialing an outbound connection.
///
/// The variants follow the error taxonomy of the core:
/// - configuration errors ([`DialError::ServerNotConfigured`]) are never retried;
/// - dial/handshake errors roll back any provisional admission bookkeeping
///   and are surfaced to the immediate caller;
/// - cancellation of the dial scope surfaces as [`DialError::Canceled`].
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DialError {
    /// Tunnel server parameters are absent or incomplete.
    #[error("server not configured")]
    ServerNotConfigured,

    /// The requested network is not a TCP flavour.
    #[error("unsupported network {network:?}")]
    UnsupportedNetwork {
        /// Network name as passed by the caller.
        network: String,
    },

    /// Name resolution failed or produced no usable addresses.
    #[error("can't resolve {addr:?}: {source}")]
    Resolve {
        /// Address being resolved.
        addr: String,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },

    /// TCP connect failed.
    #[error("can't connect to {addr:?}: {source}")]
    Connect {
        /// Destination address.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// Tunnel-level handshake/authentication failed.
    #[error("can't connect to the server {addr:?}: {reason}")]
    Handshake {
        /// Tunnel server address.
        addr: String,
        /// Failure reported by the handshake.
        reason: TunnelError,
    },

    /// The tunnel server could not open a stream to the destination.
    #[error("server can't connect to {addr:?}: {reason}")]
    Stream {
        /// Destination address.
        addr: String,
        /// Failure reported by the session.
        reason: TunnelError,
    },

    /// The dial scope was cancelled before the dial completed.
    #[error("dial canceled")]
    Canceled,
}

impl DialError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use tunproxy::DialError;
    ///
    /// assert_eq!(DialError::ServerNotConfigured.as_label(), "dial_not_configured");
    /// assert_eq!(DialError::Canceled.as_label(), "dial_canceled");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            DialError::ServerNotConfigured => "dial_not_configured",
            DialError::UnsupportedNetwork { .. } => "dial_unsupported_network",
            DialError::Resolve { .. } => "dial_resolve_failed",
            DialError::Connect { .. } => "dial_connect_failed",
            DialError::Handshake { .. } => "dial_handshake_failed",
            DialError::Stream { .. } => "dial_stream_failed",
            DialError::Canceled => "dial_canceled",
        }
    }

    /// Indicates a configuration problem rather than a network one.
    pub fn is_config(&self) -> bool {
        matches!(self, DialError::ServerNotConfigured)
    }
}

/// # Reason recorded when the core aborts a live connection.
///
/// Surfaces from subsequent reads/writes (see [`crate::abort_reason`]) so upper
/// layers can tell local network flux apart from a remote-side failure.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The local address the connection was bound to is gone.
    #[error("disconnected from network")]
    NetDisconnected,

    /// The tunnel session carrying the connection terminated.
    #[error("tunnel session lost: {0}")]
    SessionLost(String),
}

impl AbortReason {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            AbortReason::NetDisconnected => "abort_net_disconnected",
            AbortReason::SessionLost(_) => "abort_session_lost",
        }
    }
}

/// # Errors reported by tunnel session implementations.
///
/// Kept as plain messages: the core never inspects them, it only forwards
/// them to the caller and to the connectivity-state info text.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Authentication was rejected by the server.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Protocol-level failure (handshake, channel open, ...).
    #[error("{0}")]
    Protocol(String),

    /// The session is already closed.
    #[error("session closed")]
    Closed,
}

impl TunnelError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TunnelError::Auth(_) => "tunnel_auth",
            TunnelError::Protocol(_) => "tunnel_protocol",
            TunnelError::Closed => "tunnel_closed",
        }
    }
}
