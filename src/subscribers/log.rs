//! # Logging subscriber.
//!
//! [`LogWriter`] reports every bus notification through `tracing`, together
//! with the state it refers to.
//!
//! ## Output
//! ```text
//! INFO  tunnel state changed state="established" info=""
//! DEBUG counters changed tcp=3 sessions=1 tunneled=4
//! INFO  bus notification kind="sites_changed"
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::events::EventKind;
use crate::stats::{ConnStateCell, Counters};

use super::Subscribe;

/// Logs bus notifications. Enabled via the `logging` feature; attach it with
/// [`RuntimeBuilder::with_log_writer`](crate::RuntimeBuilder::with_log_writer).
pub struct LogWriter {
    counters: Counters,
    state: Arc<ConnStateCell>,
}

impl LogWriter {
    /// Creates a writer reading details from `counters` and `state`.
    pub fn new(counters: Counters, state: Arc<ConnStateCell>) -> Self {
        Self { counters, state }
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, kind: EventKind) {
        match kind {
            EventKind::ConnStateChanged => {
                let (state, info) = self.state.get();
                tracing::info!(state = state.name(), info = %info, "tunnel state changed");
            }
            EventKind::CountersChanged => {
                let c = self.counters.snapshot();
                tracing::debug!(
                    tcp = c.tcp_connections,
                    sessions = c.tunnel_sessions,
                    tunneled = c.tunnel_connections,
                    "counters changed"
                );
            }
            other => {
                tracing::info!(kind = other.as_label(), "bus notification");
            }
        }
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Bus;
    use crate::stats::ConnState;

    #[tokio::test]
    async fn handles_every_kind() {
        let bus = Bus::new();
        let state = Arc::new(ConnStateCell::new(bus.clone()));
        state.set(ConnState::Trying, "");
        let writer = LogWriter::new(Counters::new(&bus), state);
        for kind in EventKind::ALL {
            writer.on_event(kind).await;
        }
        assert_eq!(writer.name(), "log-writer");
    }
}
