//! # Bus subscriber trait.
//!
//! [`Subscribe`] is the extension point for reacting to bus notifications
//! without writing a receive loop by hand.
//!
//! ```text
//! Bus ──► [Subscription(kinds)] ──► worker task ──► subscriber.on_event(kind)
//!                                                └─► panic caught and logged
//! ```
//!
//! ## Rules
//! - Notifications are level-triggered: re-read whatever state the kind
//!   refers to instead of expecting one call per change.
//! - Each subscriber gets its own worker, so a slow one only delays itself.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use tunproxy::{EventKind, Subscribe};
//!
//! struct StateLogger;
//!
//! #[async_trait]
//! impl Subscribe for StateLogger {
//!     async fn on_event(&self, kind: EventKind) {
//!         println!("changed: {kind}");
//!     }
//!
//!     fn name(&self) -> &'static str { "state-logger" }
//!     fn kinds(&self) -> Vec<EventKind> { vec![EventKind::ConnStateChanged] }
//! }
//! ```

use async_trait::async_trait;

use crate::events::EventKind;

/// Reacts to bus notifications.
///
/// ### Implementation requirements
/// - Use async I/O; avoid blocking the executor.
/// - Handle errors internally; panics are caught but logged as failures.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handles one notification.
    async fn on_event(&self, kind: EventKind);

    /// Name used in logs. Defaults to the type name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Kinds to subscribe to; empty means all.
    fn kinds(&self) -> Vec<EventKind> {
        Vec::new()
    }
}
