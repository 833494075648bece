//! Seams to the tunnel technology.
//!
//! The pool only needs three things from a session: open a logical stream,
//! learn when (and why) the session ended, and close it. The concrete
//! protocol lives behind [`Handshake`], which turns a dialed [`Conn`] into a
//! [`TunnelSession`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TunnelError;
use crate::net::Conn;
use crate::transport::BoxStream;

use super::params::Credentials;

/// One authenticated tunnel session carrying many logical streams.
#[async_trait]
pub trait TunnelSession: Send + Sync + 'static {
    /// Asks the server to open a stream to `address`.
    async fn open_stream(&self, network: &str, address: &str) -> Result<BoxStream, TunnelError>;

    /// Resolves when the session terminates, with a description of why.
    ///
    /// May be awaited by several callers; must resolve for all of them.
    async fn closed(&self) -> String;

    /// Terminates the session and releases its link. Idempotent.
    fn close(&self);
}

/// Establishes sessions over links dialed by the pool.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    /// Authenticates over `link`.
    ///
    /// The session takes ownership of `link` and must drop it on close.
    async fn handshake(
        &self,
        link: Conn,
        server_addr: &str,
        login: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn TunnelSession>, TunnelError>;
}
