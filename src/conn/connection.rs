use std::any::Any;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::sync::Arc;
use transport::channel::Channel;
use crate::conn::protocol::ProtocolHandler;

/// Stable handle of a connection. Ids are never reused during the lifetime of a
///  [crate::conn::ConnectionManager], so a handle to a closed connection can not accidentally
///  refer to a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// accepted by one of this module's docks
    Server,
    /// initiated by this module
    Client,
}

pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) role: Role,
    pub(crate) protocol: String,
    pub(crate) handler: Arc<dyn ProtocolHandler>,
    pub(crate) channel: Channel,
    pub(crate) peer_module_name: String,
    pub(crate) peer_addr: IpAddr,
    pub(crate) info: Option<Box<dyn Any + Send + Sync>>,
    /// set when the handshake succeeded and the open callback is called; only open
    ///  connections count against the protocol's limit and get a close callback
    pub(crate) open: bool,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn peer_module_name(&self) -> &str {
        &self.peer_module_name
    }

    pub fn peer_addr(&self) -> IpAddr {
        self.peer_addr
    }

    pub fn channel(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub fn info_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.info.as_mut()
            .and_then(|info| info.downcast_mut())
    }

    pub fn take_info(&mut self) -> Option<Box<dyn Any + Send + Sync>> {
        self.info.take()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("protocol", &self.protocol)
            .field("peer_module_name", &self.peer_module_name)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.open)
            .finish()
    }
}
