use std::any::Any;
use std::net::IpAddr;
use std::sync::Arc;
use async_trait::async_trait;
use transport::address::Target;
use crate::conn::connection::{Connection, ConnectionId};
use crate::conn::ConnectionManager;

/// Protocol specific behavior of connections, registered by protocol name with the
///  [ConnectionManager]. A handler serves all connections of its protocol, so per-connection
///  state goes into the connection's info (see [ConnectionManager::set_info]).
///
/// Callbacks get the connection manager itself, so they can read and write their connection's
///  channel, open further connections or close connections (including their own).
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Called once the handshake succeeded. Returning an error tears the connection down
    ///  without calling [ProtocolHandler::on_close].
    async fn on_open(&self, _mgr: &mut ConnectionManager, _id: ConnectionId) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called while the connection has bytes readable. Each call must consume at least one
    ///  byte, it will be called again as long as there is data left. Returning an error
    ///  closes the connection.
    async fn on_read(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()>;

    /// Called after the connection was removed from the connection manager, with the
    ///  connection itself as the last chance to look at buffered data or the connection's
    ///  info
    async fn on_close(&self, _mgr: &mut ConnectionManager, _connection: Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// Client side only: called before any socket is opened, so an attempt can be vetoed
    ///  cheaply. Returning `Ok(Some(info))` attaches the info to the new connection.
    fn on_validate(&self, _target: &Target) -> anyhow::Result<Option<Box<dyn Any + Send + Sync>>> {
        Ok(None)
    }
}

/// Registration of a protocol on one side (server or client)
pub(crate) struct Protocol {
    pub name: String,
    pub version: u32,
    /// 0 means unlimited
    pub max_connections: usize,
    pub num_connections: usize,
    pub handler: Arc<dyn ProtocolHandler>,
    pub password: Option<String>,
    /// server side: peers on these hosts need no password
    pub authorised_hosts: Vec<IpAddr>,
}

impl Protocol {
    pub fn new(name: &str, version: u32, max_connections: usize, handler: Arc<dyn ProtocolHandler>, password: Option<String>) -> Protocol {
        Protocol {
            name: name.to_string(),
            version,
            max_connections,
            num_connections: 0,
            handler,
            password,
            authorised_hosts: Vec::new(),
        }
    }

    pub fn is_limit_reached(&self) -> bool {
        self.max_connections > 0 && self.num_connections >= self.max_connections
    }
}
