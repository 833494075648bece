//! Outbound networking: cancellation scopes, managed connections and the
//! manager that ties their lifetime to scopes and local addresses.

mod addr;
mod conn;
mod manager;
mod scope;
mod watcher;

pub use addr::{
    normalize_ip, split_host_port, with_default_port, AddressSource, StaticAddresses,
    SystemAddresses,
};
pub use conn::{abort_reason, AbortHandle, Conn};
pub use manager::{ConnManager, Tracked};
pub use scope::{Scope, ScopeId};
pub use watcher::AddrWatcher;
