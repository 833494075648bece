//! Polling watcher raising [`EventKind::AddrChanged`] when local addresses change.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::events::{Bus, EventKind};

use super::addr::AddressSource;
use super::scope::Scope;

/// Periodically re-enumerates local addresses and reports differences.
///
/// Stops when its scope is cancelled. Enumeration errors are logged and the
/// previous set is kept, so a transient failure raises nothing.
pub struct AddrWatcher {
    bus: Bus,
    source: Arc<dyn AddressSource>,
    interval: Duration,
}

impl AddrWatcher {
    /// Creates a watcher polling `source` every `interval`.
    pub fn new(bus: Bus, source: Arc<dyn AddressSource>, interval: Duration) -> Self {
        Self {
            bus,
            source,
            interval,
        }
    }

    /// Spawns the polling loop under `scope`.
    pub fn spawn(self, scope: Scope) -> JoinHandle<()> {
        tokio::spawn(self.run(scope))
    }

    async fn run(self, scope: Scope) {
        let mut known = self.snapshot().unwrap_or_default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(current) = self.snapshot() else { continue };
                    if current != known {
                        tracing::debug!(
                            before = known.len(),
                            after = current.len(),
                            "local addresses changed"
                        );
                        known = current;
                        self.bus.raise(EventKind::AddrChanged);
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> Option<HashSet<IpAddr>> {
        match self.source.local_addresses() {
            Ok(addrs) => Some(addrs),
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate local addresses");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::StaticAddresses;
    use std::net::Ipv4Addr;

    #[tokio::test(start_paused = true)]
    async fn raises_only_on_difference() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[EventKind::AddrChanged]);
        let addrs = Arc::new(StaticAddresses::new([IpAddr::V4(Ipv4Addr::LOCALHOST)]));
        let scope = Scope::new();
        let handle =
            AddrWatcher::new(bus.clone(), addrs.clone(), Duration::from_secs(5)).spawn(scope.clone());

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(sub.try_recv().is_none());

        addrs.insert(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2)));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sub.recv().await, Some(EventKind::AddrChanged));

        scope.cancel();
        handle.await.expect("join");
    }
}
