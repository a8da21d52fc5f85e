use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use transport::channel::Channel;
use transport::dock::Dock;
use transport::stream::Stream;
use crate::config::ConnConfig;
use crate::conn::setup_block::{read_string, write_string, SetupBlock};
use crate::conn::{Connection, ConnectionId, ConnectionManager, ProtocolHandler};
use crate::event_loop::EventLoop;

/// Unix domain docks only, in a directory of the test's own, and no password file
pub fn test_config(module_name: &str, socket_dir: &Path) -> ConnConfig {
    let mut config = ConnConfig::new(module_name);
    config.authority_file = None;
    config.cm_log_dir = socket_dir.to_path_buf();
    config.transport.socket_dir = socket_dir.to_path_buf();
    config.transport.bind_tcp = false;
    config
}

/// Runs the event loop until `done` returns true
pub async fn pump(event_loop: &mut EventLoop, mgr: &mut ConnectionManager, mut done: impl FnMut(&mut ConnectionManager) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !done(mgr) {
            event_loop.run_once(mgr).await.unwrap();
        }
    }).await
        .expect("timed out waiting for the event loop");
}

#[derive(Default)]
struct Recorded {
    opened: usize,
    closed: usize,
    received: Vec<u8>,
}

/// Counts open and close callbacks and collects everything it reads
#[derive(Default)]
pub struct RecordingHandler {
    recorded: Mutex<Recorded>,
}

impl RecordingHandler {
    pub fn opened(&self) -> usize {
        self.recorded.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.recorded.lock().unwrap().closed
    }

    pub fn received(&self) -> Vec<u8> {
        self.recorded.lock().unwrap().received.clone()
    }
}

#[async_trait]
impl ProtocolHandler for RecordingHandler {
    async fn on_open(&self, _mgr: &mut ConnectionManager, _id: ConnectionId) -> anyhow::Result<()> {
        self.recorded.lock().unwrap().opened += 1;
        Ok(())
    }

    async fn on_read(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        let data = mgr.channel(id).read_available()?;
        self.recorded.lock().unwrap().received.extend_from_slice(&data);
        Ok(())
    }

    async fn on_close(&self, _mgr: &mut ConnectionManager, _connection: Connection) -> anyhow::Result<()> {
        self.recorded.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// Writes back whatever it reads
pub struct EchoHandler;

#[async_trait]
impl ProtocolHandler for EchoHandler {
    async fn on_read(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        let channel = mgr.channel(id);
        let data = channel.read_available()?;
        channel.write_all(&data).await?;
        channel.flush().await
    }
}

/// Accepts a connection on a dock and accepts its handshake, playing the server without a
///  connection manager
pub async fn accept_handshake(dock: &Dock, module_name: &str) -> (Channel, SetupBlock) {
    let (stream, _) = dock.accept().await.unwrap();
    let mut channel = Channel::from_stream(Arc::new(stream), 4096);
    let block = SetupBlock::read_from(&mut channel).await.unwrap();
    read_string(&mut channel).await.unwrap();
    write_string(&mut channel, "").await.unwrap();
    write_string(&mut channel, module_name).await.unwrap();
    channel.flush().await.unwrap();
    (channel, block)
}

/// Plays the client side of a handshake with an arbitrary setup block. Returns the server's
///  status line.
pub async fn send_setup_block(stream: Arc<Stream>, block: &SetupBlock, module_name: &str) -> (Channel, String) {
    let mut channel = Channel::from_stream(stream, 4096);
    block.write_to(&mut channel).await.unwrap();
    write_string(&mut channel, module_name).await.unwrap();
    channel.flush().await.unwrap();
    let status = read_string(&mut channel).await.unwrap();
    (channel, status)
}

/// Connects while running the server's event loop, until the attempt finishes
pub async fn connect_while_serving(client: &mut ConnectionManager, host: &str, port: u16, protocol: &str, server_loop: &mut EventLoop, server: &mut ConnectionManager) -> anyhow::Result<ConnectionId> {
    let attempt = client.attempt_connection(host, port, protocol);
    tokio::pin!(attempt);
    loop {
        tokio::select! {
            biased;
            served = server_loop.run_once(server) => {
                served.unwrap();
            }
            result = &mut attempt => return result,
        }
    }
}
