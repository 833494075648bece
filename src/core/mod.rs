//! Runtime core: wiring and lifecycle.
//!
//! - [`runtime`]: builds the component graph and runs it until shutdown;
//! - [`memory`]: in-memory host state;
//! - [`shutdown`]: cross-platform shutdown signal handling.

mod memory;
mod runtime;
mod shutdown;

pub use memory::MemoryState;
pub use runtime::{Runtime, RuntimeBuilder};
pub use shutdown::wait_for_shutdown_signal;
