//! # Notification kinds raised on the event bus.
//!
//! An [`EventKind`] carries no payload: it only says *"this piece of state
//! changed, go re-read it from its owner"*. Subscribers select the kinds they
//! care about with an [`EventMask`].
//!
//! ## Example
//! ```rust
//! use tunproxy::{EventKind, EventMask};
//!
//! let mask = EventMask::from_kinds(&[EventKind::AddrChanged, EventKind::ShutdownRequested]);
//! assert!(mask.contains(EventKind::AddrChanged));
//! assert!(!mask.contains(EventKind::CountersChanged));
//! assert!(EventMask::from_kinds(&[]).contains(EventKind::CountersChanged));
//! ```

use std::fmt;

/// Classification of bus notifications.
///
/// Discriminants are bit positions in [`EventMask`]; lower values are
/// delivered first when several kinds are pending for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// The core finished starting up.
    Startup = 0,
    /// Tunnel connectivity state or its info text changed.
    ConnStateChanged = 1,
    /// Any statistics counter changed.
    CountersChanged = 2,
    /// Tunnel server parameters were replaced.
    ServerParamsChanged = 3,
    /// The site rule list changed.
    SitesChanged = 4,
    /// The key set changed.
    KeysChanged = 5,
    /// Local interface addresses changed.
    AddrChanged = 6,
    /// Process termination was requested.
    ShutdownRequested = 7,
}

impl EventKind {
    /// All kinds, in delivery priority order.
    pub const ALL: [EventKind; 8] = [
        EventKind::Startup,
        EventKind::ConnStateChanged,
        EventKind::CountersChanged,
        EventKind::ServerParamsChanged,
        EventKind::SitesChanged,
        EventKind::KeysChanged,
        EventKind::AddrChanged,
        EventKind::ShutdownRequested,
    ];

    /// Bit of this kind inside an [`EventMask`].
    #[inline]
    pub const fn bit(self) -> u32 {
        1 << (self as u8)
    }

    /// Kind for the lowest set bit of `bits`, if any.
    pub(crate) fn lowest(bits: u32) -> Option<EventKind> {
        if bits == 0 {
            return None;
        }
        let pos = bits.trailing_zeros() as usize;
        EventKind::ALL.get(pos).copied()
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(self) -> &'static str {
        match self {
            EventKind::Startup => "startup",
            EventKind::ConnStateChanged => "conn_state_changed",
            EventKind::CountersChanged => "counters_changed",
            EventKind::ServerParamsChanged => "server_params_changed",
            EventKind::SitesChanged => "sites_changed",
            EventKind::KeysChanged => "keys_changed",
            EventKind::AddrChanged => "addr_changed",
            EventKind::ShutdownRequested => "shutdown_requested",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Set of [`EventKind`]s a subscriber is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u32);

impl EventMask {
    /// Every kind.
    pub const ALL: EventMask = EventMask((1 << EventKind::ALL.len()) - 1);

    /// Builds a mask from a list of kinds; an empty list means [`EventMask::ALL`].
    pub fn from_kinds(kinds: &[EventKind]) -> Self {
        if kinds.is_empty() {
            return Self::ALL;
        }
        Self(kinds.iter().fold(0, |acc, k| acc | k.bit()))
    }

    /// True if `kind` is part of the mask.
    #[inline]
    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Raw bits.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_pending_kind_wins() {
        let bits = EventKind::AddrChanged.bit() | EventKind::CountersChanged.bit();
        assert_eq!(EventKind::lowest(bits), Some(EventKind::CountersChanged));
        assert_eq!(EventKind::lowest(0), None);
    }

    #[test]
    fn all_mask_covers_every_kind() {
        for k in EventKind::ALL {
            assert!(EventMask::ALL.contains(k), "{k} missing");
        }
    }
}
