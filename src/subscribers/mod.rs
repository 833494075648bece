//! # Bus subscribers.
//!
//! [`Subscribe`] turns a bus subscription into callbacks run by a dedicated
//! worker; [`SubscriberSet`] owns those workers.

#[cfg(feature = "logging")]
mod log;
mod subscriber;
mod subscriber_set;

#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use subscriber::Subscribe;
pub use subscriber_set::{spawn_worker, SubscriberSet};
