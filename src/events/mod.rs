//! Change notifications: kinds and the level-triggered bus.
//!
//! This module groups the notification **data model** and the **bus** used to
//! publish/subscribe to "something changed" signals across the core.
//!
//! ## Contents
//! - [`EventKind`], [`EventMask`] notification classification and interest sets
//! - [`Bus`], [`Subscription`] level-triggered pub/sub with a single dispatcher
//!
//! ## Quick reference
//! - **Raisers**: `Counter` (counters changed), `ConnStateCell` (connectivity),
//!   `AddrWatcher` (addresses), `Runtime` (startup, params, shutdown).
//! - **Consumers**: `ConnManager` (address changes), `Runtime::run_until_shutdown`
//!   (shutdown requests), the UI layer (everything else).

mod bus;
mod event;

pub use bus::{Bus, Subscription};
pub use event::{EventKind, EventMask};
