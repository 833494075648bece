//! # Managed outbound connection.
//!
//! [`Conn`] wraps one dialed [`TcpStream`] and is shared (through an internal
//! `Arc`) between the caller, who reads and writes it, and the
//! [`ConnManager`](crate::ConnManager), which may abort it unilaterally.
//!
//! ## Rules
//! - **Exactly-once teardown**: the first `close`/`abort` (or drop) wins an
//!   atomic guard; only it decrements the counter, records the reason and
//!   deregisters from the manager.
//! - **Reason surfaces on IO**: once aborted with a reason, reads and writes
//!   fail with an `io::Error` carrying that [`AbortReason`]; use
//!   [`abort_reason`] to recover it.
//! - **Unilateral abort wakes the owner**: a pending read/write on an aborted
//!   connection returns immediately and the socket is dropped.
//! - **Abort reaches the wire**: the manager holds a duplicate of the socket
//!   and shuts it down, so the peer sees the close even if the owner is idle.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use socket2::{SockRef, Socket};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::AbortReason;
use crate::stats::Counter;

use super::addr::normalize_ip;
use super::manager::Command;
use super::scope::Scope;

pub(crate) type ConnId = u64;

/// State shared between a [`Conn`] and the connection manager.
pub(crate) struct ConnShared {
    pub(crate) id: ConnId,
    pub(crate) scope: Scope,
    pub(crate) local_ip: Option<IpAddr>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    counter: Counter,
    closed: AtomicBool,
    reason: OnceLock<AbortReason>,
    abort: CancellationToken,
    socket: Mutex<Option<Socket>>,
    manager: mpsc::UnboundedSender<Command>,
}

impl ConnShared {
    /// Tears the connection down once. Returns `false` if it already was.
    pub(crate) fn abort(&self, reason: Option<AbortReason>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(reason) = reason {
            let _ = self.reason.set(reason);
        }
        self.counter.dec();
        self.abort.cancel();
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(socket) = socket {
            // Fails harmlessly when the peer already reset the connection.
            let _ = socket.shutdown(Shutdown::Both);
        }
        // Manager gone means nothing is tracked any more.
        let _ = self.manager.send(Command::Remove { id: self.id });
        true
    }

    pub(crate) fn describe(&self) -> String {
        format!(
            "{}/{}",
            self.local.map_or_else(|| "?".into(), |a| a.to_string()),
            self.peer.map_or_else(|| "?".into(), |a| a.to_string())
        )
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One established outbound TCP connection tracked by the manager.
pub struct Conn {
    stream: Option<TcpStream>,
    shared: Arc<ConnShared>,
    aborted: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Conn {
    pub(crate) fn new(
        id: ConnId,
        stream: TcpStream,
        scope: Scope,
        counter: Counter,
        manager: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let local = stream.local_addr().ok();
        let socket = match SockRef::from(&stream).try_clone() {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::debug!(error = %e, "failed to duplicate socket, abort stays local");
                None
            }
        };
        let abort = CancellationToken::new();
        let shared = Arc::new(ConnShared {
            id,
            scope,
            local_ip: local.map(|a| normalize_ip(a.ip())),
            local,
            peer: stream.peer_addr().ok(),
            counter,
            closed: AtomicBool::new(false),
            reason: OnceLock::new(),
            abort: abort.clone(),
            socket: Mutex::new(socket),
            manager,
        });
        Self {
            stream: Some(stream),
            shared,
            aborted: Box::pin(abort.cancelled_owned()),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    /// Scope the connection was dialed under.
    pub fn scope(&self) -> &Scope {
        &self.shared.scope
    }

    /// True once closed or aborted by anyone.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Reason recorded by the first abort, if it had one.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.shared.reason.get().cloned()
    }

    /// Handle that can abort this connection from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Aborts with `reason`. Idempotent; later reads/writes surface `reason`.
    pub fn abort(&mut self, reason: AbortReason) {
        self.shared.abort(Some(reason));
        self.stream = None;
    }

    /// Closes the connection. Idempotent.
    pub fn close(&mut self) {
        self.shared.abort(None);
        self.stream = None;
    }

    /// Error for IO on a connection that is gone.
    fn gone(&self) -> io::Error {
        match self.shared.reason.get() {
            Some(reason) => io::Error::new(io::ErrorKind::ConnectionAborted, reason.clone()),
            None => io::Error::new(io::ErrorKind::NotConnected, "connection closed"),
        }
    }

    /// Replaces a stream error with the recorded reason, if any.
    fn surface(&self, err: io::Error) -> io::Error {
        match self.shared.reason.get() {
            Some(reason) => io::Error::new(io::ErrorKind::ConnectionAborted, reason.clone()),
            None => err,
        }
    }

    /// Drops the socket once an abort was observed; yields the live stream otherwise.
    fn poll_stream(&mut self, cx: &mut Context<'_>) -> Result<&mut TcpStream, io::Error> {
        if self.stream.is_some() && self.aborted.as_mut().poll(cx).is_ready() {
            self.stream = None;
        }
        if self.stream.is_none() {
            return Err(self.gone());
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.shared.abort(None);
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.shared.id)
            .field("local", &self.shared.local)
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = match this.poll_stream(cx) {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => return Poll::Ready(Err(e)),
        };
        res.map_err(|e| this.surface(e))
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = match this.poll_stream(cx) {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => return Poll::Ready(Err(e)),
        };
        res.map_err(|e| this.surface(e))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = match this.poll_stream(cx) {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => return Poll::Ready(Err(e)),
        };
        res.map_err(|e| this.surface(e))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = match this.poll_stream(cx) {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => return Poll::Ready(Err(e)),
        };
        res.map_err(|e| this.surface(e))
    }
}

/// Cloneable handle aborting a [`Conn`] from outside its owner.
#[derive(Clone)]
pub struct AbortHandle {
    shared: Arc<ConnShared>,
}

impl AbortHandle {
    /// Aborts with `reason`; returns `false` if the connection was already gone.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.shared.abort(Some(reason))
    }

    /// True once closed or aborted by anyone.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Extracts the [`AbortReason`] carried by an IO error from a managed connection.
///
/// ```rust
/// use std::io;
/// use tunproxy::{abort_reason, AbortReason};
///
/// let err = io::Error::new(io::ErrorKind::ConnectionAborted, AbortReason::NetDisconnected);
/// assert_eq!(abort_reason(&err), Some(&AbortReason::NetDisconnected));
/// assert_eq!(abort_reason(&io::Error::from(io::ErrorKind::BrokenPipe)), None);
/// ```
pub fn abort_reason(err: &io::Error) -> Option<&AbortReason> {
    err.get_ref()?.downcast_ref::<AbortReason>()
}
