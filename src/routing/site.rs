//! Site rules and the sources that supply them.

use serde::{Deserialize, Serialize};

/// One routing rule for a host.
///
/// Serialized with the field names the configuration UI already uses
/// (`host`, `rec`, `block`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRule {
    /// Host name (or domain, for recursive rules).
    pub host: String,
    /// Also matches every subdomain of `host`.
    #[serde(rename = "rec", default, skip_serializing_if = "is_false")]
    pub recursive: bool,
    /// Block the site instead of forwarding it via the tunnel.
    #[serde(default, skip_serializing_if = "is_false")]
    pub block: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl SiteRule {
    /// Rule forwarding exactly `host` via the tunnel.
    pub fn forward(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            recursive: false,
            block: false,
        }
    }

    /// Rule blocking exactly `host`.
    pub fn block(host: impl Into<String>) -> Self {
        Self {
            block: true,
            ..Self::forward(host)
        }
    }

    /// Extends the rule to all subdomains.
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }
}

/// Provider of the current, ordered site rule list.
///
/// The router takes one snapshot per routing decision.
pub trait SiteSource: Send + Sync + 'static {
    /// Returns the current rules in priority order.
    fn sites(&self) -> Vec<SiteRule>;
}

impl SiteSource for Vec<SiteRule> {
    fn sites(&self) -> Vec<SiteRule> {
        self.clone()
    }
}
