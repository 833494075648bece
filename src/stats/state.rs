//! # Tunnel connectivity state.
//!
//! ```text
//! NotConfigured ──► Trying ──► Established
//!       ▲             ▲  ◄──────────┘ (last session lost)
//!       └─────────────┴──── any ◄── reconnect(incomplete params)
//! ```
//!
//! Transitions are published as [`EventKind::ConnStateChanged`] only when the
//! state or its info text actually changes.

use std::sync::Mutex;

use serde::Serialize;

use crate::events::{Bus, EventKind};

/// Connectivity state of the tunnel transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    /// No usable server parameters.
    #[serde(rename = "noconfig")]
    NotConfigured,
    /// Parameters are set; no session is up yet (or the last one was lost).
    Trying,
    /// At least one session completed its handshake.
    Established,
}

impl ConnState {
    /// Stable name used by the UI.
    pub fn name(self) -> &'static str {
        match self {
            ConnState::NotConfigured => "noconfig",
            ConnState::Trying => "trying",
            ConnState::Established => "established",
        }
    }

    /// Info text shown when no explicit one is set.
    pub fn default_info(self) -> &'static str {
        match self {
            ConnState::NotConfigured => "server not configured",
            ConnState::Trying => "trying...",
            ConnState::Established => "connected to the server",
        }
    }
}

/// Current state plus its explanatory text, publishing changes on the bus.
#[derive(Debug)]
pub struct ConnStateCell {
    current: Mutex<(ConnState, String)>,
    bus: Bus,
}

impl ConnStateCell {
    /// Starts in [`ConnState::NotConfigured`].
    pub fn new(bus: Bus) -> Self {
        Self {
            current: Mutex::new((ConnState::NotConfigured, String::new())),
            bus,
        }
    }

    /// Returns `(state, info)`.
    pub fn get(&self) -> (ConnState, String) {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sets the state; raises `ConnStateChanged` only on an actual change.
    ///
    /// Returns `true` if something changed.
    pub fn set(&self, state: ConnState, info: impl Into<String>) -> bool {
        let info = info.into();
        let mut cur = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if cur.0 == state && cur.1 == info {
            return false;
        }
        tracing::debug!(state = state.name(), info = %info, "tunnel state changed");
        *cur = (state, info);
        self.bus.raise(EventKind::ConnStateChanged);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_only_real_changes() {
        let bus = Bus::new();
        let cell = ConnStateCell::new(bus);

        assert!(!cell.set(ConnState::NotConfigured, ""));
        assert!(cell.set(ConnState::Trying, ""));
        assert!(!cell.set(ConnState::Trying, ""));
        assert!(cell.set(ConnState::Trying, "connection reset"));
        assert_eq!(cell.get(), (ConnState::Trying, "connection reset".to_string()));
    }

    #[test]
    fn names_match_ui() {
        assert_eq!(ConnState::NotConfigured.name(), "noconfig");
        assert_eq!(ConnState::Established.default_info(), "connected to the server");
    }

    #[test]
    fn serialized_form_is_the_name() {
        for state in [ConnState::NotConfigured, ConnState::Trying, ConnState::Established] {
            let json = serde_json::to_string(&state).expect("serialize");
            assert_eq!(json, format!("\"{}\"", state.name()));
        }
    }
}
