//! The connection manager: protocol registry, handshake, and the life cycle of connections.
//!
//! ## Life cycle of a connection
//!
//! ```ascii
//! server side                            client side
//!
//! dock reports a new stream              attempt_connection()
//!   read setup block + module name         validate callback (may veto)
//!   check magic, revision, protocol,       connect, send setup block + module name
//!     version, limit, password / host      read status: empty = accepted
//!   send status (+ own module name)        read server's module name
//!               \                       /
//!                open callback (failure: discarded without close callback)
//!                linked into the server / client list
//!                drain: read callback while bytes are readable
//!                  ...
//!                closed by the peer, a failing callback or close():
//!                  unlinked, count decremented, close callback
//! ```
//!
//! A rejected handshake is a normal outcome: the peer gets the reason as text, the stream is
//!  dropped and nothing else happens. Misuse of the API by the embedding application
//!  (registering a protocol twice, using a stale [ConnectionId], a read callback that does
//!  not consume anything) panics.

pub mod authority;
pub mod builtin;
pub mod cm_tool;
pub mod connection;
pub mod protocol;
pub mod setup_block;

use std::any::Any;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::Arc;
use anyhow::{anyhow, Context};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, instrument, trace, warn};
use transport::address::{connect, is_local_host, resolve};
use transport::channel::Channel;
use transport::dock::{alloc_port, ServerPort};
use transport::error::is_fatal;
use transport::stream::Stream;
use crate::config::ConnConfig;
use crate::conn::authority::Authority;
use crate::conn::cm_tool::{CmTool, ModuleMessage};
use crate::conn::protocol::Protocol;
use crate::conn::setup_block::{read_string, write_string, SetupBlock, PROTOCOL_NAME_LEN, SETUP_MAGIC, SETUP_REVISION};
use crate::error::{ConnectError, Rejection};
use crate::event_loop::ChannelManager;

pub use connection::{Connection, ConnectionId, Role};
pub use protocol::ProtocolHandler;

pub type ExitScheduler = Box<dyn FnMut() + Send + Sync>;

pub struct ConnectionManager {
    config: ConnConfig,
    authority: Authority,
    channel_manager: Option<Box<dyn ChannelManager>>,
    exit_scheduler: Option<ExitScheduler>,
    exit_requested: bool,

    server_port: Option<ServerPort>,
    builtins_registered: bool,
    server_protocols: FxHashMap<String, Protocol>,
    client_protocols: FxHashMap<String, Protocol>,

    connections: FxHashMap<ConnectionId, Connection>,
    /// open connections only, see [Connection::open]
    server_connections: BTreeSet<ConnectionId>,
    client_connections: BTreeSet<ConnectionId>,
    next_id: u64,

    cm_tool: Option<CmTool>,
}

impl ConnectionManager {
    pub fn new(config: ConnConfig) -> anyhow::Result<ConnectionManager> {
        config.validate()?;
        let authority = match &config.authority_file {
            Some(path) => Authority::load(path)?,
            None => Authority::default(),
        };

        Ok(ConnectionManager {
            config,
            authority,
            channel_manager: None,
            exit_scheduler: None,
            exit_requested: false,
            server_port: None,
            builtins_registered: false,
            server_protocols: FxHashMap::default(),
            client_protocols: FxHashMap::default(),
            connections: FxHashMap::default(),
            server_connections: BTreeSet::new(),
            client_connections: BTreeSet::new(),
            next_id: 1,
            cm_tool: None,
        })
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Registers the readiness notification for docks and connections. This can be done only
    ///  once.
    pub fn register_managers(&mut self, channel_manager: Box<dyn ChannelManager>) {
        if self.channel_manager.is_some() {
            panic!("this is a bug: channel manager registered twice");
        }
        self.channel_manager = Some(channel_manager);
    }

    /// Without a scheduler, a request to exit (see [ConnectionManager::request_exit]) makes
    ///  [crate::event_loop::EventLoop::run] return
    pub fn register_exit_scheduler(&mut self, scheduler: impl FnMut() + Send + Sync + 'static) {
        self.exit_scheduler = Some(Box::new(scheduler));
    }

    pub fn request_exit(&mut self) {
        match &mut self.exit_scheduler {
            Some(scheduler) => {
                debug!("scheduling exit");
                scheduler();
            }
            None => {
                info!("exit requested");
                self.exit_requested = true;
            }
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    /// Registers a protocol that peers can connect to. `max_connections` limits the number of
    ///  simultaneous connections, 0 means unlimited.
    pub fn register_server_protocol(&mut self, name: &str, version: u32, max_connections: usize, handler: Arc<dyn ProtocolHandler>) {
        check_protocol_name(name);
        if builtin::is_builtin(name) || cm_tool::is_cm_protocol(name) {
            panic!("this is a bug: protocol name {:?} is reserved", name);
        }
        self.insert_server_protocol(name, version, max_connections, handler);
    }

    /// Registers a protocol this module can use to connect to servers
    pub fn register_client_protocol(&mut self, name: &str, version: u32, max_connections: usize, handler: Arc<dyn ProtocolHandler>) {
        check_protocol_name(name);
        if cm_tool::is_cm_protocol(name) {
            panic!("this is a bug: protocol name {:?} is reserved", name);
        }
        self.insert_client_protocol(name, version, max_connections, handler);
    }

    fn insert_server_protocol(&mut self, name: &str, version: u32, max_connections: usize, handler: Arc<dyn ProtocolHandler>) {
        if self.server_protocols.contains_key(name) {
            panic!("this is a bug: server protocol {:?} registered twice", name);
        }
        let password = self.authority.password(name).map(|pw| pw.to_string());
        debug!("registered server protocol {:?} version {} (password required: {})", name, version, password.is_some());
        self.server_protocols.insert(name.to_string(), Protocol::new(name, version, max_connections, handler, password));
    }

    fn insert_client_protocol(&mut self, name: &str, version: u32, max_connections: usize, handler: Arc<dyn ProtocolHandler>) {
        if self.client_protocols.contains_key(name) {
            panic!("this is a bug: client protocol {:?} registered twice", name);
        }
        let password = self.authority.password(name).map(|pw| pw.to_string());
        debug!("registered client protocol {:?} version {}", name, version);
        self.client_protocols.insert(name.to_string(), Protocol::new(name, version, max_connections, handler, password));
    }

    /// Peers on this host may connect to a password protected server protocol without the
    ///  password
    pub fn authorise_host(&mut self, protocol: &str, host: IpAddr) {
        match self.server_protocols.get_mut(protocol) {
            Some(p) => {
                debug!("authorised {} for protocol {:?}", host, protocol);
                p.authorised_hosts.push(host);
            }
            None => panic!("this is a bug: authorising a host for unregistered server protocol {:?}", protocol),
        }
    }

    /// Opens the docks for a port number, trying up to `retries` subsequent port numbers if
    ///  it is in use. Returns the port number actually allocated.
    #[instrument(skip(self))]
    pub async fn become_server(&mut self, port: u16, retries: u16) -> anyhow::Result<u16> {
        if let Some(existing) = &self.server_port {
            panic!("this is a bug: already serving port {}", existing.port);
        }
        if self.channel_manager.is_none() {
            panic!("this is a bug: no channel manager registered");
        }

        if !self.builtins_registered {
            builtin::register(self);
            self.builtins_registered = true;
        }

        let server_port = alloc_port(&self.config.transport, port, retries).await?;
        if let Some(channel_manager) = &mut self.channel_manager {
            for dock in &server_port.docks {
                channel_manager.manage_dock(dock.clone());
            }
        }
        let port = server_port.port;
        info!("serving port {} with {} docks", port, server_port.docks.len());
        self.server_port = Some(server_port);

        self.notify_cm_tool(ModuleMessage::PortNumber { port }).await?;
        Ok(port)
    }

    pub fn served_port(&self) -> Option<u16> {
        self.server_port.as_ref()
            .map(|p| p.port)
    }

    /// Stops accepting connections. Connections that are already open stay open.
    pub fn close_port(&mut self) {
        let server_port = match self.server_port.take() {
            Some(p) => p,
            None => return,
        };
        if let Some(channel_manager) = &mut self.channel_manager {
            channel_manager.unmanage_docks();
        }

        // the readiness watchers may hold on to the docks for a little while
        if self.config.transport.bind_unix {
            let path = self.config.transport.unix_socket_path(server_port.port);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("could not remove socket file {:?}: {}", path, e);
                }
            }
        }
        info!("closed port {}", server_port.port);
    }

    fn alloc_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Handles a stream accepted by one of the docks: runs the server side of the handshake
    ///  and opens the connection if the handshake succeeds.
    #[instrument(name = "accepted_connection", skip_all, fields(peer = %peer))]
    pub async fn on_accept(&mut self, stream: Stream, peer: IpAddr) -> anyhow::Result<()> {
        debug!("received connection request");

        let stream = Arc::new(stream);
        let mut channel = Channel::from_stream(stream.clone(), self.config.transport.write_buffer_size);

        let (protocol, peer_module_name) = match self.serve_handshake(&mut channel, peer).await {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("connection from {} broke with an error: {:#}", peer, e);
                return Ok(());
            }
        };

        let handler = self.registration_mut(Role::Server, &protocol).handler.clone();
        let id = self.alloc_id();
        self.connections.insert(id, Connection {
            id,
            role: Role::Server,
            protocol,
            handler,
            channel,
            peer_module_name,
            peer_addr: peer,
            info: None,
            open: false,
        });

        match self.open_connection(id, stream).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!("open callback for connection {} from {} failed: {:#}", id, peer, e);
                return Ok(());
            }
        }
        self.server_connections.insert(id);
        self.notify_opened(id).await?;
        self.drain(id).await
    }

    /// Returns the protocol name and the peer's module name if the connection is accepted.
    ///  Rejections are sent to the peer and logged, they are not errors.
    async fn serve_handshake(&mut self, channel: &mut Channel, peer: IpAddr) -> anyhow::Result<Option<(String, String)>> {
        let block = SetupBlock::read_from(channel).await?;

        let checked = match check_header(&block) {
            Ok(()) => {
                let peer_module_name = read_string(channel).await?;
                self.check_protocol(&block, peer)
                    .map(|_| peer_module_name)
            }
            Err(rejection) => Err(rejection),
        };

        match checked {
            Ok(peer_module_name) => {
                write_string(channel, "").await?;
                write_string(channel, &self.config.module_name).await?;
                channel.flush().await?;
                Ok(Some((block.protocol, peer_module_name)))
            }
            Err(rejection) => {
                warn!("rejected connection from {} for protocol {:?}: {}", peer, block.protocol, rejection);
                write_string(channel, &rejection.to_string()).await?;
                channel.flush().await?;
                Ok(None)
            }
        }
    }

    fn check_protocol(&self, block: &SetupBlock, peer: IpAddr) -> Result<(), Rejection> {
        let protocol = self.server_protocols.get(&block.protocol)
            .ok_or(Rejection::ProtocolNotSupported)?;
        if block.version != protocol.version {
            return Err(Rejection::BadVersion);
        }
        if protocol.is_limit_reached() {
            return Err(Rejection::ConnectionLimit);
        }
        if let Some(password) = &protocol.password {
            if !block.password_matches(password) {
                if !protocol.authorised_hosts.contains(&peer) {
                    return Err(Rejection::AuthorisationFailed);
                }
                debug!("accepting {} without password as an authorised host", peer);
            }
        }
        Ok(())
    }

    /// Connects to a server, runs the client side of the handshake and opens the connection.
    ///
    /// A rejection by the server is returned as [ConnectError::Rejected]. Note that the
    ///  connection may already be closed again when this returns, if the peer closed it right
    ///  away (see [ConnectionManager::is_open]).
    #[instrument(skip(self))]
    pub async fn attempt_connection(&mut self, host: &str, port: u16, protocol: &str) -> anyhow::Result<ConnectionId> {
        let (version, password, handler) = match self.client_protocols.get(protocol) {
            None => return Err(ConnectError::UnknownProtocol { protocol: protocol.to_string() }.into()),
            Some(p) if p.is_limit_reached() => return Err(ConnectError::LimitReached { protocol: protocol.to_string() }.into()),
            Some(p) => (p.version, p.password.clone(), p.handler.clone()),
        };

        if self.served_port() == Some(port) && is_local_host(host, &self.config.local_hostname) {
            error!("attempt to connect to port {} on {:?}, which is served by this module", port, host);
            return Err(ConnectError::SelfConnection { port }.into());
        }

        let target = resolve(&self.config.transport, host, port, &self.config.local_hostname).await?;
        let info = handler.on_validate(&target)
            .context(ConnectError::Vetoed { protocol: protocol.to_string() })?;

        let stream = Arc::new(connect(&self.config.transport, &target).await?);
        let mut channel = Channel::from_stream(stream.clone(), self.config.transport.write_buffer_size);
        let peer_module_name = self.request_connection(&mut channel, protocol, version, password.as_deref()).await
            .with_context(|| format!("connecting to {:?} port {} for protocol {:?}", host, port, protocol))?;

        let id = self.alloc_id();
        let peer_addr = stream.peer_ip();
        self.connections.insert(id, Connection {
            id,
            role: Role::Client,
            protocol: protocol.to_string(),
            handler,
            channel,
            peer_module_name,
            peer_addr,
            info,
            open: false,
        });

        if !self.open_connection(id, stream).await? {
            return Err(anyhow!("connection {} was closed while it was being opened", id));
        }
        self.client_connections.insert(id);
        self.notify_opened(id).await?;
        self.drain(id).await?;
        Ok(id)
    }

    /// Returns the server's module name
    async fn request_connection(&mut self, channel: &mut Channel, protocol: &str, version: u32, password: Option<&str>) -> anyhow::Result<String> {
        SetupBlock::new(protocol, version, password)
            .write_to(channel).await?;
        write_string(channel, &self.config.module_name).await?;
        channel.flush().await?;

        let reason = read_string(channel).await?;
        if !reason.is_empty() {
            warn!("server rejected connection for protocol {:?}: {}", protocol, reason);
            return Err(ConnectError::Rejected { reason }.into());
        }
        read_string(channel).await
    }

    /// Registers the connection's readiness, counts it and calls the open callback. Returns
    ///  `false` if the open callback closed the connection itself.
    async fn open_connection(&mut self, id: ConnectionId, stream: Arc<Stream>) -> anyhow::Result<bool> {
        let (role, protocol, handler) = {
            let connection = self.connection_mut(id);
            connection.open = true;
            (connection.role, connection.protocol.clone(), connection.handler.clone())
        };
        if let Some(channel_manager) = &mut self.channel_manager {
            channel_manager.manage_channel(id, stream);
        }
        self.registration_mut(role, &protocol).num_connections += 1;

        if let Err(e) = handler.on_open(self, id).await {
            if self.connections.remove(&id).is_some() {
                self.registration_mut(role, &protocol).num_connections -= 1;
                if let Some(channel_manager) = &mut self.channel_manager {
                    channel_manager.unmanage_channel(id);
                }
            }
            return Err(e);
        }
        if !self.connections.contains_key(&id) {
            debug!("connection {} was closed by its open callback", id);
            return Ok(false);
        }

        let connection = self.connection(id);
        info!("opened {:?} connection {} for protocol {:?} with module {:?} at {}", role, id, protocol, connection.peer_module_name, connection.peer_addr);
        Ok(true)
    }

    /// Calls the read callback as long as there are bytes readable, closing the connection if
    ///  the peer closed it or the callback fails
    async fn drain(&mut self, id: ConnectionId) -> anyhow::Result<()> {
        loop {
            let connection = match self.connections.get_mut(&id) {
                Some(c) => c,
                None => return Ok(()),
            };

            let readable = match connection.channel.bytes_readable() {
                Ok(n) => n,
                Err(e) => {
                    debug!("connection {} broke: {}", id, e);
                    return self.dealloc(id).await;
                }
            };
            if readable == 0 {
                if connection.channel.is_eof() {
                    debug!("connection {} closed by peer", id);
                    return self.dealloc(id).await;
                }
                return Ok(());
            }

            trace!("{} bytes readable on connection {}", readable, id);
            let position_before = connection.channel.read_position();
            let handler = connection.handler.clone();

            if let Err(e) = handler.on_read(self, id).await {
                if is_fatal(&e) {
                    return Err(e);
                }
                debug!("read callback for connection {} failed - closing: {:#}", id, e);
                return self.dealloc(id).await;
            }

            if let Some(connection) = self.connections.get(&id) {
                if connection.channel.read_position() == position_before {
                    panic!("this is a bug: read callback for protocol {:?} did not consume any data", connection.protocol);
                }
            }
        }
    }

    /// Handles a readiness notification for a connection. Notifications for connections that
    ///  were closed in the meantime are ignored.
    pub async fn on_readable(&mut self, id: ConnectionId) -> anyhow::Result<()> {
        if !self.connections.contains_key(&id) {
            trace!("ignoring readiness of closed connection {}", id);
            return Ok(());
        }
        self.drain(id).await
    }

    /// Flushes pending writes and closes the connection, calling its close callback
    pub async fn close(&mut self, id: ConnectionId) -> anyhow::Result<()> {
        if let Err(e) = self.connection_mut(id).channel.flush().await {
            debug!("could not flush connection {} before closing it: {}", id, e);
        }
        self.dealloc(id).await
    }

    /// Closes all connections and the port
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.cm_tool = None;
        self.close_port();

        let ids = self.connections.keys().copied().collect::<Vec<_>>();
        for id in ids {
            if self.connections.contains_key(&id) {
                self.close(id).await?;
            }
        }
        Ok(())
    }

    async fn dealloc(&mut self, id: ConnectionId) -> anyhow::Result<()> {
        let connection = match self.connections.remove(&id) {
            Some(c) => c,
            None => return Ok(()),
        };
        match connection.role {
            Role::Server => self.server_connections.remove(&id),
            Role::Client => self.client_connections.remove(&id),
        };
        if let Some(channel_manager) = &mut self.channel_manager {
            channel_manager.unmanage_channel(id);
        }
        if !connection.open {
            return Ok(());
        }

        let protocol = connection.protocol.clone();
        self.registration_mut(connection.role, &protocol).num_connections -= 1;
        info!("closed connection {} for protocol {:?}", id, protocol);

        let handler = connection.handler.clone();
        if let Err(e) = handler.on_close(self, connection).await {
            if is_fatal(&e) {
                return Err(e);
            }
            warn!("close callback for connection {} failed: {:#}", id, e);
        }

        if !cm_tool::is_cm_protocol(&protocol) {
            self.notify_cm_tool(ModuleMessage::ConnectionClosed { id }).await?;
        }
        Ok(())
    }

    async fn notify_opened(&mut self, id: ConnectionId) -> anyhow::Result<()> {
        if self.cm_tool.is_none() {
            return Ok(());
        }
        let connection = self.connection(id);
        if cm_tool::is_cm_protocol(&connection.protocol) {
            return Ok(());
        }
        let msg = ModuleMessage::NewConnection {
            id,
            client: connection.is_client(),
            protocol: connection.protocol.clone(),
            peer_module_name: connection.peer_module_name.clone(),
        };
        self.notify_cm_tool(msg).await
    }

    fn registration_mut(&mut self, role: Role, protocol: &str) -> &mut Protocol {
        let protocols = match role {
            Role::Server => &mut self.server_protocols,
            Role::Client => &mut self.client_protocols,
        };
        match protocols.get_mut(protocol) {
            Some(p) => p,
            None => panic!("this is a bug: {:?} protocol {:?} is not registered", role, protocol),
        }
    }

    fn connection(&self, id: ConnectionId) -> &Connection {
        match self.connections.get(&id) {
            Some(c) => c,
            None => panic!("this is a bug: stale connection handle {}", id),
        }
    }

    fn connection_mut(&mut self, id: ConnectionId) -> &mut Connection {
        match self.connections.get_mut(&id) {
            Some(c) => c,
            None => panic!("this is a bug: stale connection handle {}", id),
        }
    }

    /// The connection's channel, for reading and writing protocol data
    pub fn channel(&mut self, id: ConnectionId) -> &mut Channel {
        &mut self.connection_mut(id).channel
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.connections.get(&id)
            .map(|c| c.open)
            .unwrap_or(false)
    }

    pub fn is_client(&self, id: ConnectionId) -> bool {
        self.connection(id).is_client()
    }

    pub fn protocol_name(&self, id: ConnectionId) -> &str {
        &self.connection(id).protocol
    }

    pub fn peer_module_name(&self, id: ConnectionId) -> &str {
        &self.connection(id).peer_module_name
    }

    pub fn peer_addr(&self, id: ConnectionId) -> IpAddr {
        self.connection(id).peer_addr
    }

    pub fn set_info(&mut self, id: ConnectionId, info: Box<dyn Any + Send + Sync>) {
        self.connection_mut(id).info = Some(info);
    }

    pub fn info_mut<T: Any>(&mut self, id: ConnectionId) -> Option<&mut T> {
        self.connection_mut(id).info_mut()
    }

    pub fn take_info(&mut self, id: ConnectionId) -> Option<Box<dyn Any + Send + Sync>> {
        self.connection_mut(id).take_info()
    }

    /// open server connections for a protocol, in the order they were opened
    pub fn server_connections(&self, protocol: &str) -> Vec<ConnectionId> {
        self.connections_of(&self.server_connections, protocol)
    }

    /// open client connections for a protocol, in the order they were opened
    pub fn client_connections(&self, protocol: &str) -> Vec<ConnectionId> {
        self.connections_of(&self.client_connections, protocol)
    }

    fn connections_of(&self, ids: &BTreeSet<ConnectionId>, protocol: &str) -> Vec<ConnectionId> {
        ids.iter()
            .filter(|id| self.connection(**id).protocol == protocol)
            .copied()
            .collect()
    }

    /// the number of open connections for a protocol, server and client side
    pub fn connection_count(&self, protocol: &str) -> usize {
        let server = self.server_protocols.get(protocol).map(|p| p.num_connections).unwrap_or(0);
        let client = self.client_protocols.get(protocol).map(|p| p.num_connections).unwrap_or(0);
        server + client
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }
}

fn check_protocol_name(name: &str) {
    if name.is_empty() || name.len() >= PROTOCOL_NAME_LEN || name.contains('\0') {
        panic!("this is a bug: invalid protocol name {:?}", name);
    }
}

fn check_header(block: &SetupBlock) -> Result<(), Rejection> {
    if block.magic != SETUP_MAGIC {
        return Err(Rejection::BadMagic);
    }
    if block.revision != SETUP_REVISION {
        return Err(Rejection::BadRevision);
    }
    Ok(())
}
