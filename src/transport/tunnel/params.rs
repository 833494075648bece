//! Tunnel server parameters and the credentials derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection parameters of the tunnel server, as persisted by the host.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerParams {
    /// Server address, `host[:port]`.
    pub addr: String,
    /// Login name.
    pub login: String,
    /// Password; ignored when `keyid` is set.
    pub password: String,
    /// Id of the key to authenticate with, if any.
    pub keyid: String,
}

impl ServerParams {
    /// Builds credentials, or `None` when the parameters are incomplete.
    ///
    /// A key id takes priority and must resolve through `keys`; otherwise
    /// a non-empty password is required.
    pub fn credentials(&self, keys: &dyn KeyStore) -> Option<Credentials> {
        if self.addr.is_empty() || self.login.is_empty() {
            return None;
        }
        if !self.keyid.is_empty() {
            return keys.key_by_id(&self.keyid).map(Credentials::Key);
        }
        if self.password.is_empty() {
            return None;
        }
        Some(Credentials::Password(self.password.clone()))
    }
}

impl fmt::Debug for ServerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerParams")
            .field("addr", &self.addr)
            .field("login", &self.login)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("keyid", &self.keyid)
            .finish()
    }
}

/// Authentication key kept by the host's key store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Opaque id referenced by [`ServerParams::keyid`].
    pub id: String,
    /// Human-readable comment.
    #[serde(default)]
    pub comment: String,
    /// Private key material in the encoding the handshake expects.
    pub private_key: String,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("comment", &self.comment)
            .finish_non_exhaustive()
    }
}

/// What the handshake authenticates with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    Key(Key),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::Key(key) => f.debug_tuple("Key").field(&key.id).finish(),
        }
    }
}

/// Key lookup by opaque id.
pub trait KeyStore: Send + Sync + 'static {
    /// Returns the key with `id`, if present.
    fn key_by_id(&self, id: &str) -> Option<Key>;
}

impl KeyStore for Vec<Key> {
    fn key_by_id(&self, id: &str) -> Option<Key> {
        self.iter().find(|k| k.id == id).cloned()
    }
}

/// Getter/setter of the persisted server parameters.
pub trait ServerParamsSource: Send + Sync + 'static {
    /// Current parameters.
    fn server_params(&self) -> ServerParams;

    /// Replaces the parameters.
    fn set_server_params(&self, params: ServerParams);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key {
            id: "k1".into(),
            comment: "laptop".into(),
            private_key: "secret".into(),
        }
    }

    fn params(addr: &str, login: &str, password: &str, keyid: &str) -> ServerParams {
        ServerParams {
            addr: addr.into(),
            login: login.into(),
            password: password.into(),
            keyid: keyid.into(),
        }
    }

    #[test]
    fn completeness_rules() {
        let keys = vec![key()];
        assert_eq!(params("", "u", "p", "").credentials(&keys), None);
        assert_eq!(params("h", "", "p", "").credentials(&keys), None);
        assert_eq!(params("h", "u", "", "").credentials(&keys), None);
        assert_eq!(
            params("h", "u", "p", "").credentials(&keys),
            Some(Credentials::Password("p".into()))
        );
        assert_eq!(
            params("h", "u", "p", "k1").credentials(&keys),
            Some(Credentials::Key(key()))
        );
        // An unknown key id does not fall back to the password.
        assert_eq!(params("h", "u", "p", "nope").credentials(&keys), None);
    }

    #[test]
    fn debug_hides_secrets() {
        let shown = format!("{:?}", params("h", "u", "hunter2", ""));
        assert!(!shown.contains("hunter2"));
        let shown = format!("{:?}", Credentials::Key(key()));
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn params_deserialize_with_missing_fields() {
        let p: ServerParams =
            serde_json::from_str(r#"{"addr":"tunnel.example.net","login":"alice"}"#).expect("json");
        assert_eq!(p.addr, "tunnel.example.net");
        assert!(p.password.is_empty() && p.keyid.is_empty());
    }
}
