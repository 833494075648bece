//! Tunnel transport: a pool of authenticated sessions to the tunnel server,
//! each carrying up to [`Config::max_conns_per_session`](crate::Config)
//! logical streams.

mod conn;
mod params;
mod pool;
mod session;
mod transport;

pub use conn::TunnelConn;
pub use params::{Credentials, Key, KeyStore, ServerParams, ServerParamsSource};
pub use pool::PoolSnapshot;
pub use session::{Handshake, TunnelSession};
pub use transport::TunnelTransport;
