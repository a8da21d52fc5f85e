use std::sync::Arc;
use async_trait::async_trait;
use tracing::{info, trace};
use crate::conn::{ConnectionId, ConnectionManager, ProtocolHandler};

/// Echoes everything back
pub const PING_SERVER_PROTOCOL: &str = "ping_server";
/// Makes the server exit when a client connects
pub const SERVER_EXIT_PROTOCOL: &str = "server_exit";

pub const BUILTIN_PROTOCOL_VERSION: u32 = 0;

pub fn is_builtin(protocol: &str) -> bool {
    protocol == PING_SERVER_PROTOCOL || protocol == SERVER_EXIT_PROTOCOL
}

pub(super) fn register(mgr: &mut ConnectionManager) {
    mgr.insert_server_protocol(PING_SERVER_PROTOCOL, BUILTIN_PROTOCOL_VERSION, 0, Arc::new(PingServer));
    mgr.insert_server_protocol(SERVER_EXIT_PROTOCOL, BUILTIN_PROTOCOL_VERSION, 1, Arc::new(ServerExit));
}

struct PingServer;

#[async_trait]
impl ProtocolHandler for PingServer {
    async fn on_read(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        let channel = mgr.channel(id);
        let data = channel.read_available()?;
        trace!("echoing {} bytes", data.len());
        channel.write_all(&data).await?;
        channel.flush().await
    }
}

struct ServerExit;

#[async_trait]
impl ProtocolHandler for ServerExit {
    async fn on_open(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        info!("module {:?} asked this server to exit", mgr.peer_module_name(id));
        mgr.request_exit();
        Ok(())
    }

    async fn on_read(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        mgr.channel(id).read_available()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use super::*;
    use crate::event_loop::tokio_channel_manager;
    use crate::test_util::{test_config, RecordingHandler};

    #[tokio::test]
    async fn test_ping_server() {
        let dir = tempfile::tempdir().unwrap();
        let (server_cm, mut server_loop) = tokio_channel_manager();
        let mut server = ConnectionManager::new(test_config("server", dir.path())).unwrap();
        server.register_managers(Box::new(server_cm));
        let port = server.become_server(3, 0).await.unwrap();

        let mut client = ConnectionManager::new(test_config("client", dir.path())).unwrap();
        let recorder = Arc::new(RecordingHandler::default());
        client.register_client_protocol(PING_SERVER_PROTOCOL, BUILTIN_PROTOCOL_VERSION, 0, recorder.clone());

        let (id, _) = tokio::join!(
            client.attempt_connection("unix", port, PING_SERVER_PROTOCOL),
            server_loop.run_once(&mut server),
        );
        let id = id.unwrap();
        assert_eq!(client.peer_module_name(id), "server");

        tokio::spawn(async move { server_loop.run(&mut server).await });

        let channel = client.channel(id);
        channel.write_all(b"ping").await.unwrap();
        channel.flush().await.unwrap();

        let mut echoed = [0u8; 4];
        channel.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn test_server_exit_without_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let (server_cm, mut server_loop) = tokio_channel_manager();
        let mut server = ConnectionManager::new(test_config("server", dir.path())).unwrap();
        server.register_managers(Box::new(server_cm));
        let port = server.become_server(4, 0).await.unwrap();

        let mut client = ConnectionManager::new(test_config("client", dir.path())).unwrap();
        client.register_client_protocol(SERVER_EXIT_PROTOCOL, BUILTIN_PROTOCOL_VERSION, 0, Arc::new(RecordingHandler::default()));

        assert!(!server.exit_requested());
        let (id, run) = tokio::join!(
            client.attempt_connection("unix", port, SERVER_EXIT_PROTOCOL),
            server_loop.run(&mut server),
        );
        id.unwrap();
        run.unwrap();
        assert!(server.exit_requested());
    }

    #[tokio::test]
    async fn test_server_exit_with_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let (server_cm, mut server_loop) = tokio_channel_manager();
        let mut server = ConnectionManager::new(test_config("server", dir.path())).unwrap();
        server.register_managers(Box::new(server_cm));
        let scheduled = Arc::new(AtomicBool::new(false));
        let flag = scheduled.clone();
        server.register_exit_scheduler(move || flag.store(true, Ordering::SeqCst));
        let port = server.become_server(5, 0).await.unwrap();

        let mut client = ConnectionManager::new(test_config("client", dir.path())).unwrap();
        client.register_client_protocol(SERVER_EXIT_PROTOCOL, BUILTIN_PROTOCOL_VERSION, 0, Arc::new(RecordingHandler::default()));

        let (id, _) = tokio::join!(
            client.attempt_connection("unix", port, SERVER_EXIT_PROTOCOL),
            server_loop.run_once(&mut server),
        );
        id.unwrap();
        assert!(scheduled.load(Ordering::SeqCst));
        assert!(!server.exit_requested());
    }
}
