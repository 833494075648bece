//! # Outbound transports.
//!
//! Both transports expose the same contract: dial `network`/`address` under a
//! cancellation [`Scope`] and get back a byte stream whose lifetime is
//! accounted for in the statistics counters.
//!
//! ```text
//!            ┌──────────────────┐      ┌───────────────┐
//!  Bypass ──►│ DirectTransport  │─────►│ ConnManager   │──► TCP
//!            └──────────────────┘      └───────────────┘
//!            ┌──────────────────┐  link   ▲
//!  Forward ─►│ TunnelTransport  │─────────┘ (one per session)
//!            └────────┬─────────┘
//!                     └──► session pool ──► logical streams
//! ```

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::DialError;
use crate::net::Scope;

mod direct;
pub mod tunnel;

pub use direct::DirectTransport;

/// Byte stream returned by a transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed [`AsyncStream`].
pub type BoxStream = Box<dyn AsyncStream>;

/// Dialing contract shared by the direct and tunnel transports.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Dials under `scope`; cancelling it aborts the dial and closes the stream.
    async fn dial_context(
        &self,
        scope: &Scope,
        network: &str,
        address: &str,
    ) -> Result<BoxStream, DialError>;

    /// Scope used by [`Transport::dial`].
    fn root_scope(&self) -> &Scope;

    /// Dials under the transport's root scope.
    async fn dial(&self, network: &str, address: &str) -> Result<BoxStream, DialError> {
        let scope = self.root_scope().clone();
        self.dial_context(&scope, network, address).await
    }
}
