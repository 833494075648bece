//! Logical stream riding a pooled tunnel session.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::AbortReason;
use crate::net::Scope;
use crate::stats::Counter;
use crate::transport::BoxStream;

use super::pool::{Generation, Lease, Lost};

struct Open {
    stream: Option<BoxStream>,
    held: Option<(Arc<Generation>, u64)>,
}

/// Parts of a stream that its scope watcher may tear down.
struct Shared {
    open: Mutex<Open>,
    counter: Counter,
    address: String,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Open> {
        self.open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drops the stream and releases its session reference once.
    fn release(&self, open: &mut Open) {
        open.stream = None;
        if let Some((generation, slot)) = open.held.take() {
            generation.release(slot);
            self.counter.dec();
            tracing::debug!(address = %self.address, "tunnel connection closed");
        }
    }
}

/// One stream opened through a tunnel session.
///
/// Holds a reference on its session; closing or dropping it, or cancelling
/// the scope it was dialed under, releases the reference, the admission slot
/// and the `tunnel_connections` counter once.
/// When the session terminates, IO fails with [`AbortReason::SessionLost`].
pub struct TunnelConn {
    shared: Arc<Shared>,
    lost: Arc<Lost>,
    lost_wait: Pin<Box<WaitForCancellationFutureOwned>>,
    scope_wait: Pin<Box<WaitForCancellationFutureOwned>>,
    done: CancellationToken,
}

impl TunnelConn {
    pub(super) fn new(
        inner: BoxStream,
        generation: Arc<Generation>,
        lease: Lease,
        counter: Counter,
        scope: &Scope,
        address: &str,
    ) -> Self {
        counter.inc();
        let lost_wait = Box::pin(lease.lost.token().clone().cancelled_owned());
        let shared = Arc::new(Shared {
            open: Mutex::new(Open {
                stream: Some(inner),
                held: Some((Arc::clone(&generation), lease.slot)),
            }),
            counter,
            address: address.to_string(),
        });
        let done = CancellationToken::new();
        generation.tracker.spawn(release_on_cancel(
            scope.clone(),
            generation.scope.clone(),
            done.clone(),
            Arc::downgrade(&shared),
        ));
        Self {
            shared,
            lost: lease.lost,
            lost_wait,
            scope_wait: Box::pin(scope.cancelled_owned()),
            done,
        }
    }

    /// Destination this stream was opened to.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// True once closed, or once its session is gone.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().held.is_none() || self.lost.token().is_cancelled()
    }

    /// Closes the stream. Idempotent.
    pub fn close(&mut self) {
        let mut open = self.shared.lock();
        self.shared.release(&mut open);
        drop(open);
        self.done.cancel();
    }

    fn gone(&self) -> io::Error {
        if self.lost.token().is_cancelled() {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                AbortReason::SessionLost(self.lost.text()),
            )
        } else {
            io::Error::new(io::ErrorKind::NotConnected, "connection closed")
        }
    }

    /// Runs `op` on the live stream; fails once the scope or the session is gone.
    fn poll_io<T>(
        &mut self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut BoxStream>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        let mut open = self.shared.lock();
        if open.stream.is_some() {
            if self.scope_wait.as_mut().poll(cx).is_ready() {
                self.shared.release(&mut open);
            } else if self.lost_wait.as_mut().poll(cx).is_ready() {
                open.stream = None;
            }
        }
        match open.stream.as_mut() {
            Some(stream) => op(Pin::new(stream), cx),
            None => Poll::Ready(Err(self.gone())),
        }
    }
}

/// Releases the stream when its dial scope is cancelled, even if nobody polls it.
async fn release_on_cancel(
    scope: Scope,
    generation: Scope,
    done: CancellationToken,
    shared: Weak<Shared>,
) {
    tokio::select! {
        biased;
        _ = done.cancelled() => {}
        _ = generation.cancelled() => {}
        _ = scope.cancelled() => {
            if let Some(shared) = shared.upgrade() {
                let mut open = shared.lock();
                shared.release(&mut open);
            }
        }
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConn")
            .field("address", &self.shared.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().poll_io(cx, |s, cx| s.poll_read(cx, buf))
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_io(cx, |s, cx| s.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_io(cx, |s, cx| s.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_io(cx, |s, cx| s.poll_shutdown(cx))
    }
}
