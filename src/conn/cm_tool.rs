//! Supervision by a Connection Management tool.
//!
//! If the control variable (see [crate::config::ConnConfig::cm_control_env]) holds
//!  `host:port:x:y`, the module connects to the tool twice: the control connection mirrors
//!  connection events to the tool and receives its commands, the stdio connection carries the
//!  module's standard input and output. Losing the control connection is fatal.
//!
//! Messages in both directions are framed as a u32 length followed by a u32 message code and
//!  the message's fields.

use std::sync::Arc;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use transport::channel::Channel;
use transport::error::{is_fatal, Fatal};
use transport::safe_converter::{PrecheckedCast, SafeCast};
use crate::conn::{Connection, ConnectionId, ConnectionManager, ProtocolHandler};

pub const CONTROL_PROTOCOL: &str = "conn_mngr_control";
pub const STDIO_PROTOCOL: &str = "conn_mngr_stdio";
pub const CM_PROTOCOL_VERSION: u32 = 0;

/// upper bound for a single framed message
pub const MAX_MESSAGE_LEN: u32 = 64 * 1024;

pub fn is_cm_protocol(protocol: &str) -> bool {
    protocol == CONTROL_PROTOCOL || protocol == STDIO_PROTOCOL
}

/// Where the tool is, and where it wants this module's window placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmControl {
    pub host: String,
    pub port: u16,
    pub x: i32,
    pub y: i32,
}

impl CmControl {
    /// `host:port:x:y`. The host may contain colons itself (IPv6).
    pub fn parse(raw: &str) -> anyhow::Result<CmControl> {
        let mut fields = raw.trim().rsplitn(4, ':');
        let y = fields.next();
        let x = fields.next();
        let port = fields.next();
        let host = fields.next();

        match (host, port, x, y) {
            (Some(host), Some(port), Some(x), Some(y)) if !host.is_empty() => Ok(CmControl {
                host: host.to_string(),
                port: port.parse().with_context(|| format!("invalid port in control string {:?}", raw))?,
                x: x.parse().with_context(|| format!("invalid x position in control string {:?}", raw))?,
                y: y.parse().with_context(|| format!("invalid y position in control string {:?}", raw))?,
            }),
            _ => bail!("control string must have the form host:port:x:y, was {:?}", raw),
        }
    }
}

pub(crate) struct CmTool {
    pub control: ConnectionId,
    pub stdio: Option<ConnectionId>,
    pub stdin: BytesMut,
}

/// Notifications from the module to the tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleMessage {
    Position { x: i32, y: i32 },
    PortNumber { port: u16 },
    NewConnection { id: ConnectionId, client: bool, protocol: String, peer_module_name: String },
    ConnectionClosed { id: ConnectionId },
    Quiescent,
}

impl ModuleMessage {
    const POSITION: u32 = 1;
    const PORT_NUMBER: u32 = 2;
    const NEW_CONNECTION: u32 = 3;
    const CONNECTION_CLOSED: u32 = 4;
    const QUIESCENT: u32 = 5;

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            ModuleMessage::Position { x, y } => {
                buf.put_u32(Self::POSITION);
                buf.put_i32(*x);
                buf.put_i32(*y);
            }
            ModuleMessage::PortNumber { port } => {
                buf.put_u32(Self::PORT_NUMBER);
                buf.put_u32((*port).into());
            }
            ModuleMessage::NewConnection { id, client, protocol, peer_module_name } => {
                buf.put_u32(Self::NEW_CONNECTION);
                buf.put_u64(id.0);
                buf.put_u8(u8::from(*client));
                put_string(buf, protocol);
                put_string(buf, peer_module_name);
            }
            ModuleMessage::ConnectionClosed { id } => {
                buf.put_u32(Self::CONNECTION_CLOSED);
                buf.put_u64(id.0);
            }
            ModuleMessage::Quiescent => buf.put_u32(Self::QUIESCENT),
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let result = match buf.try_get_u32()? {
            Self::POSITION => ModuleMessage::Position {
                x: buf.try_get_i32()?,
                y: buf.try_get_i32()?,
            },
            Self::PORT_NUMBER => ModuleMessage::PortNumber {
                port: buf.try_get_u32()?.try_into()?,
            },
            Self::NEW_CONNECTION => ModuleMessage::NewConnection {
                id: ConnectionId(buf.try_get_u64()?),
                client: buf.try_get_u8()? != 0,
                protocol: get_string(buf)?,
                peer_module_name: get_string(buf)?,
            },
            Self::CONNECTION_CLOSED => ModuleMessage::ConnectionClosed {
                id: ConnectionId(buf.try_get_u64()?),
            },
            Self::QUIESCENT => ModuleMessage::Quiescent,
            other => bail!("unknown module message code {}", other),
        };
        Ok(result)
    }
}

/// Commands from the tool to the module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCommand {
    AttemptConnection { host: String, port: u16, protocol: String },
    CloseConnection { id: ConnectionId },
    Exit,
}

impl ToolCommand {
    const ATTEMPT_CONNECTION: u32 = 101;
    const CLOSE_CONNECTION: u32 = 102;
    const EXIT: u32 = 103;

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            ToolCommand::AttemptConnection { host, port, protocol } => {
                buf.put_u32(Self::ATTEMPT_CONNECTION);
                put_string(buf, host);
                buf.put_u32((*port).into());
                put_string(buf, protocol);
            }
            ToolCommand::CloseConnection { id } => {
                buf.put_u32(Self::CLOSE_CONNECTION);
                buf.put_u64(id.0);
            }
            ToolCommand::Exit => buf.put_u32(Self::EXIT),
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let result = match buf.try_get_u32()? {
            Self::ATTEMPT_CONNECTION => ToolCommand::AttemptConnection {
                host: get_string(buf)?,
                port: buf.try_get_u32()?.try_into()?,
                protocol: get_string(buf)?,
            },
            Self::CLOSE_CONNECTION => ToolCommand::CloseConnection {
                id: ConnectionId(buf.try_get_u64()?),
            },
            Self::EXIT => ToolCommand::Exit,
            other => bail!("unknown tool command code {}", other),
        };
        Ok(result)
    }
}

fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u32(s.len().prechecked_cast());
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len: usize = buf.try_get_u32()?.safe_cast();
    if buf.remaining() < len {
        bail!("string of {} bytes exceeds the message", len);
    }
    Ok(String::from_utf8(buf.copy_to_bytes(len).to_vec())?)
}

/// length prefixed frame around a serialized message
pub fn framed(ser: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut payload = BytesMut::new();
    ser(&mut payload);

    let mut result = BytesMut::with_capacity(payload.len() + 4);
    result.put_u32(payload.len().prechecked_cast());
    result.put_slice(&payload);
    result.freeze()
}

/// Reads the payload of the next frame
pub async fn read_frame(channel: &mut Channel) -> anyhow::Result<Bytes> {
    let len = channel.read_u32().await?;
    if len > MAX_MESSAGE_LEN {
        bail!("message of {} bytes exceeds the maximum of {}", len, MAX_MESSAGE_LEN);
    }
    channel.read_bytes(len.safe_cast()).await
}

struct ControlHandler;

#[async_trait]
impl ProtocolHandler for ControlHandler {
    async fn on_read(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        let mut frame = read_frame(mgr.channel(id)).await?;
        let command = ToolCommand::deser(&mut frame)?;
        debug!("command from Connection Management tool: {:?}", command);

        match command {
            ToolCommand::AttemptConnection { host, port, protocol } => {
                match mgr.attempt_connection(&host, port, &protocol).await {
                    Ok(new_id) => debug!("connected to {:?} port {} for the tool as {}", host, port, new_id),
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => warn!("connection requested by Connection Management tool failed: {:#}", e),
                }
            }
            ToolCommand::CloseConnection { id: target } => {
                if mgr.is_open(target) && !is_cm_protocol(mgr.protocol_name(target)) {
                    mgr.close(target).await?;
                }
                else {
                    warn!("Connection Management tool asked to close unknown connection {}", target);
                }
            }
            ToolCommand::Exit => mgr.request_exit(),
        }
        Ok(())
    }

    async fn on_close(&self, mgr: &mut ConnectionManager, connection: Connection) -> anyhow::Result<()> {
        match &mgr.cm_tool {
            Some(tool) if tool.control == connection.id() => Err(Fatal::ControlConnectionLost.into()),
            _ => Ok(()),
        }
    }
}

struct StdioHandler;

#[async_trait]
impl ProtocolHandler for StdioHandler {
    async fn on_read(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        let data = mgr.channel(id).read_available()?;
        if let Some(tool) = &mut mgr.cm_tool {
            tool.stdin.extend_from_slice(&data);
        }
        Ok(())
    }

    async fn on_close(&self, mgr: &mut ConnectionManager, connection: Connection) -> anyhow::Result<()> {
        if let Some(tool) = &mut mgr.cm_tool {
            if tool.stdio == Some(connection.id()) {
                info!("lost the stdio connection to the Connection Management tool, using standard output");
                tool.stdio = None;
            }
        }
        Ok(())
    }
}

impl ConnectionManager {
    /// Connects to the Connection Management tool if the control variable is set. Returns
    ///  whether the module is now supervised.
    pub async fn init_cm_tool(&mut self) -> anyhow::Result<bool> {
        match std::env::var(&self.config.cm_control_env) {
            Ok(raw) => {
                let control = CmControl::parse(&raw)?;
                self.connect_cm_tool(&control).await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub async fn connect_cm_tool(&mut self, control: &CmControl) -> anyhow::Result<()> {
        if self.cm_tool.is_some() {
            panic!("this is a bug: already supervised by a Connection Management tool");
        }
        if !self.client_protocols.contains_key(CONTROL_PROTOCOL) {
            self.insert_client_protocol(CONTROL_PROTOCOL, CM_PROTOCOL_VERSION, 1, Arc::new(ControlHandler));
            self.insert_client_protocol(STDIO_PROTOCOL, CM_PROTOCOL_VERSION, 1, Arc::new(StdioHandler));
        }

        let control_id = self.attempt_connection(&control.host, control.port, CONTROL_PROTOCOL).await
            .map_err(|e| Fatal::CmToolNotify(format!("connecting to the tool at {}:{}: {:#}", control.host, control.port, e)))?;
        self.cm_tool = Some(CmTool {
            control: control_id,
            stdio: None,
            stdin: BytesMut::new(),
        });

        let stdio_id = self.attempt_connection(&control.host, control.port, STDIO_PROTOCOL).await
            .map_err(|e| Fatal::CmToolNotify(format!("opening the stdio connection to {}:{}: {:#}", control.host, control.port, e)))?;
        if let Some(tool) = &mut self.cm_tool {
            tool.stdio = Some(stdio_id);
        }
        info!("supervised by the Connection Management tool at {}:{}", control.host, control.port);

        self.notify_cm_tool(ModuleMessage::Position { x: control.x, y: control.y }).await?;
        if let Some(port) = self.served_port() {
            self.notify_cm_tool(ModuleMessage::PortNumber { port }).await?;
        }
        Ok(())
    }

    pub fn controlled_by_cm_tool(&self) -> bool {
        self.cm_tool.is_some()
    }

    /// Fire-and-forget notification. Failing to notify the tool is fatal.
    pub(crate) async fn notify_cm_tool(&mut self, msg: ModuleMessage) -> anyhow::Result<()> {
        let control = match &self.cm_tool {
            Some(tool) => tool.control,
            None => return Ok(()),
        };
        let channel = match self.connections.get_mut(&control) {
            Some(c) => &mut c.channel,
            None => return Err(Fatal::ControlConnectionLost.into()),
        };

        let frame = framed(|buf| msg.ser(buf));
        let result = async {
            channel.write_all(&frame).await?;
            channel.flush().await
        }.await;
        result.map_err(|e| Fatal::CmToolNotify(format!("{:#}", e)).into())
    }

    /// Tells the tool that this module has settled, e.g. after opening its initial
    ///  connections
    pub async fn signal_quiescent(&mut self) -> anyhow::Result<()> {
        self.notify_cm_tool(ModuleMessage::Quiescent).await
    }

    /// Standard output of the module: the tool's stdio connection if there is one, the
    ///  process's standard output otherwise
    pub async fn write_stdio(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let stdio = self.cm_tool.as_ref()
            .and_then(|tool| tool.stdio);
        match stdio.and_then(|id| self.connections.get_mut(&id)) {
            Some(connection) => {
                connection.channel.write_all(data).await?;
                connection.channel.flush().await
            }
            None => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(data).await
                    .map_err(|e| anyhow!("writing to standard output: {}", e))?;
                stdout.flush().await?;
                Ok(())
            }
        }
    }

    /// Input the tool sent on the stdio connection since the last call
    pub fn take_stdin(&mut self) -> Bytes {
        match &mut self.cm_tool {
            Some(tool) => tool.stdin.split().freeze(),
            None => Bytes::new(),
        }
    }
}
