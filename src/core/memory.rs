//! In-memory host state: site rules, keys and server parameters.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::routing::{SiteRule, SiteSource};
use crate::transport::tunnel::{Key, KeyStore, ServerParams, ServerParamsSource};

#[derive(Default)]
struct Data {
    sites: Vec<SiteRule>,
    keys: Vec<Key>,
    server: ServerParams,
}

/// Thread-safe in-memory implementation of every host-state seam.
///
/// Mutators do not raise bus notifications; the owner raises
/// `SitesChanged`/`KeysChanged` itself (the runtime does so for server
/// parameters).
#[derive(Default)]
pub struct MemoryState {
    data: RwLock<Data>,
}

impl MemoryState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// State with initial contents.
    pub fn from_parts(sites: Vec<SiteRule>, keys: Vec<Key>, server: ServerParams) -> Self {
        Self {
            data: RwLock::new(Data {
                sites,
                keys,
                server,
            }),
        }
    }

    /// Replaces the site rules.
    pub fn set_sites(&self, sites: Vec<SiteRule>) {
        self.write().sites = sites;
    }

    /// Adds or replaces a key by id.
    pub fn put_key(&self, key: Key) {
        let mut data = self.write();
        data.keys.retain(|k| k.id != key.id);
        data.keys.push(key);
    }

    /// Removes a key; returns `true` if it existed.
    pub fn remove_key(&self, id: &str) -> bool {
        let mut data = self.write();
        let before = data.keys.len();
        data.keys.retain(|k| k.id != id);
        data.keys.len() != before
    }

    /// All keys.
    pub fn keys(&self) -> Vec<Key> {
        self.read().keys.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Data> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Data> {
        self.data
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SiteSource for MemoryState {
    fn sites(&self) -> Vec<SiteRule> {
        self.read().sites.clone()
    }
}

impl KeyStore for MemoryState {
    fn key_by_id(&self, id: &str) -> Option<Key> {
        self.read().keys.iter().find(|k| k.id == id).cloned()
    }
}

impl ServerParamsSource for MemoryState {
    fn server_params(&self) -> ServerParams {
        self.read().server.clone()
    }

    fn set_server_params(&self, params: ServerParams) {
        self.write().server = params;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_replaced_by_id() {
        let state = MemoryState::new();
        let key = |comment: &str| Key {
            id: "k".into(),
            comment: comment.into(),
            private_key: "pk".into(),
        };
        state.put_key(key("old"));
        state.put_key(key("new"));
        assert_eq!(state.keys().len(), 1);
        assert_eq!(state.key_by_id("k").map(|k| k.comment), Some("new".into()));
        assert!(state.remove_key("k"));
        assert!(!state.remove_key("k"));
    }

    #[test]
    fn sites_and_params_round_trip_through_seams() {
        let state = MemoryState::new();
        state.set_sites(vec![SiteRule::forward("example.com").recursive()]);
        assert_eq!(state.sites().len(), 1);

        let params = ServerParams {
            addr: "tunnel.example.net".into(),
            login: "alice".into(),
            ..ServerParams::default()
        };
        state.set_server_params(params.clone());
        assert_eq!(state.server_params(), params);
    }
}
