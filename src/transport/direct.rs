//! Direct transport: plain TCP through the connection manager.

use async_trait::async_trait;

use crate::error::DialError;
use crate::net::{Conn, ConnManager, Scope};
use crate::stats::Counter;

use super::{BoxStream, Transport};

/// Dials destinations directly, counting live connections in `tcp_connections`.
#[derive(Clone, Debug)]
pub struct DirectTransport {
    manager: ConnManager,
    counter: Counter,
    root: Scope,
}

impl DirectTransport {
    /// Creates a transport; [`Transport::dial`] uses `root`.
    pub fn new(manager: ConnManager, counter: Counter, root: Scope) -> Self {
        Self {
            manager,
            counter,
            root,
        }
    }

    /// Like [`Transport::dial_context`] but returns the concrete [`Conn`].
    pub async fn dial_conn(
        &self,
        scope: &Scope,
        network: &str,
        address: &str,
    ) -> Result<Conn, DialError> {
        let conn = self
            .manager
            .dial_context(scope, network, address, &self.counter)
            .await?;
        tracing::debug!(%address, "direct connection established");
        Ok(conn)
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn dial_context(
        &self,
        scope: &Scope,
        network: &str,
        address: &str,
    ) -> Result<BoxStream, DialError> {
        Ok(Box::new(self.dial_conn(scope, network, address).await?))
    }

    fn root_scope(&self) -> &Scope {
        &self.root
    }
}
