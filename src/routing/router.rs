//! # Per-host routing decisions.
//!
//! [`Router::route`] maps a host name to a [`Disposition`] using a snapshot of
//! the externally supplied [`SiteRule`] list.
//!
//! ## Matching
//! - **Exact**: a rule whose host equals the request host wins immediately
//!   (first such rule in list order).
//! - **Recursive**: a rule with `recursive = true` also matches every proper
//!   subdomain of its host, anchored on a `.` boundary
//!   (`example.com` matches `a.example.com`, not `badexample.com`).
//!   Among several recursive matches the longest (most specific) domain wins.
//! - **No match** → [`Disposition::Bypass`].
//!
//! Hosts are compared case-insensitively, ignoring one trailing dot.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use tunproxy::{Disposition, Router, SiteRule};
//!
//! let router = Router::new(Arc::new(vec![
//!     SiteRule::forward("example.com").recursive(),
//!     SiteRule::block("sub.example.com").recursive(),
//! ]));
//!
//! assert_eq!(router.route("a.sub.example.com"), Disposition::Block);
//! assert_eq!(router.route("example.com"), Disposition::Forward);
//! assert_eq!(router.route("example.org"), Disposition::Bypass);
//! ```

use std::fmt;
use std::sync::Arc;

use super::site::{SiteRule, SiteSource};

/// Routing answer for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Connect directly.
    Bypass,
    /// Connect through the tunnel.
    Forward,
    /// Refuse the request.
    Block,
}

impl Disposition {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(self) -> &'static str {
        match self {
            Disposition::Bypass => "bypass",
            Disposition::Forward => "forward",
            Disposition::Block => "block",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Request router.
///
/// Stateless apart from the rule source; reentrant and lock-free on its own.
#[derive(Clone)]
pub struct Router {
    sites: Arc<dyn SiteSource>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    /// Creates a router reading rules from `sites`.
    pub fn new(sites: Arc<dyn SiteSource>) -> Self {
        Self { sites }
    }

    /// Routes `host` according to the current rule snapshot.
    pub fn route(&self, host: &str) -> Disposition {
        route_with(&self.sites.sites(), host)
    }
}

/// Applies `rules` to `host`. Pure function behind [`Router::route`].
pub fn route_with(rules: &[SiteRule], host: &str) -> Disposition {
    let host = normalize(host);
    let mut found: Option<(&SiteRule, usize)> = None;

    for rule in rules {
        let domain = normalize(&rule.host);
        if domain.is_empty() {
            continue;
        }

        if domain == host {
            found = Some((rule, domain.len()));
            break;
        }

        if rule.recursive && is_subdomain(&host, &domain) {
            let more_specific = found.map_or(true, |(_, len)| len < domain.len());
            if more_specific {
                found = Some((rule, domain.len()));
            }
        }
    }

    match found {
        Some((rule, _)) if rule.block => Disposition::Block,
        Some(_) => Disposition::Forward,
        None => Disposition::Bypass,
    }
}

fn normalize(host: &str) -> String {
    host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase()
}

/// True if `host` is a proper subdomain of `domain`.
fn is_subdomain(host: &str, domain: &str) -> bool {
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}
