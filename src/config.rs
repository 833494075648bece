//! # Global core configuration.
//!
//! Provides [`Config`] centralized settings for the proxy core.
//!
//! Config is consumed in three places:
//! 1. **Connection manager**: keep-alive for every outbound TCP dial
//! 2. **Tunnel transport**: per-session connection cap and default server port
//! 3. **Address watcher**: interface polling interval
//!
//! ## Sentinel values
//! - `tcp_keepalive = 0s` → keep-alive left at the OS default
//! - `addr_poll_interval = 0s` → no built-in watcher (the host raises `AddrChanged` itself)

use std::time::Duration;

/// Global configuration for the proxy core.
///
/// ## Field semantics
/// - `max_conns_per_session`: admission cap per tunnel session (min 1; clamped)
/// - `tcp_keepalive`: keep-alive idle time for outbound TCP (`0s` = OS default)
/// - `default_server_port`: port appended to a tunnel server address without one
/// - `addr_poll_interval`: how often local addresses are re-enumerated (`0s` = never)
///
/// ## Notes
/// All fields are public for flexibility. Prefer using helper accessors to avoid
/// sprinkling sentinel checks (`0`) across the codebase.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of logical connections riding one tunnel session.
    ///
    /// A new session is only dialed once every live session is at this cap
    /// and the demand exceeds `sessions × max_conns_per_session`.
    pub max_conns_per_session: usize,

    /// TCP keep-alive idle time applied to every dialed connection.
    pub tcp_keepalive: Duration,

    /// Port used when the tunnel server address carries none.
    pub default_server_port: u16,

    /// Interval between local interface address checks.
    pub addr_poll_interval: Duration,
}

impl Config {
    /// Returns the per-session cap clamped to a minimum of 1.
    #[inline]
    pub fn session_cap(&self) -> usize {
        self.max_conns_per_session.max(1)
    }

    /// Returns the keep-alive time as an `Option`.
    ///
    /// - `None` → leave the socket option alone
    /// - `Some(d)` → enable keep-alive with idle time `d`
    #[inline]
    pub fn keepalive(&self) -> Option<Duration> {
        if self.tcp_keepalive == Duration::ZERO {
            None
        } else {
            Some(self.tcp_keepalive)
        }
    }

    /// Returns the watcher poll interval as an `Option`.
    #[inline]
    pub fn poll_interval(&self) -> Option<Duration> {
        if self.addr_poll_interval == Duration::ZERO {
            None
        } else {
            Some(self.addr_poll_interval)
        }
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `max_conns_per_session = 10`
    /// - `tcp_keepalive = 30s`
    /// - `default_server_port = 22`
    /// - `addr_poll_interval = 5s`
    fn default() -> Self {
        Self {
            max_conns_per_session: 10,
            tcp_keepalive: Duration::from_secs(30),
            default_server_port: 22,
            addr_poll_interval: Duration::from_secs(5),
        }
    }
}
