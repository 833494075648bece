//! Routing: site rules and the host → disposition decision.
//!
//! ## Contents
//! - [`SiteRule`], [`SiteSource`] externally owned rule list and its provider
//! - [`Router`], [`Disposition`] pure decision function over a rule snapshot

mod router;
mod site;

pub use router::{route_with, Disposition, Router};
pub use site::{SiteRule, SiteSource};
