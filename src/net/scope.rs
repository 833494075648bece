//! # Cancellation scopes.
//!
//! A [`Scope`] is a [`CancellationToken`] with an identity, so the connection
//! manager can index connections by the scope they were dialed under.
//! Scopes form a tree: cancelling a parent cancels every child derived from it.
//!
//! ```rust
//! use tunproxy::Scope;
//!
//! let root = Scope::new();
//! let child = root.child();
//! assert_ne!(root.id(), child.id());
//! root.cancel();
//! assert!(child.is_cancelled());
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

static SCOPE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of a scope; shared by all clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Identifiable cancellation token.
#[derive(Clone)]
pub struct Scope {
    id: ScopeId,
    token: CancellationToken,
}

impl Scope {
    /// New root scope.
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    /// Wraps an existing token under a fresh identity.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            id: ScopeId(SCOPE_SEQ.fetch_add(1, Ordering::Relaxed)),
            token,
        }
    }

    /// Derives a child scope, cancelled together with this one.
    pub fn child(&self) -> Self {
        Self::from_token(self.token.child_token())
    }

    /// Scope identity.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Cancels the scope and all of its children. Permanent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once cancelled (directly or via a parent).
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Owned variant of [`Scope::cancelled`], for storing in other futures.
    pub fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }

    /// Underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Scope {}

impl Hash for Scope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id.0)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
