//! Observable state: statistics counters and tunnel connectivity.
//!
//! Both raise bus notifications on change and carry no history: subscribers
//! re-read the current values after being woken.

mod counters;
mod state;

pub use counters::{Counter, Counters, CountersSnapshot};
pub use state::{ConnState, ConnStateCell};
