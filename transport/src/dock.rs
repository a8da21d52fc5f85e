//! Docks are the listening ends of a Karma port: one per address family, all for the same port
//!  number. A process owns at most one port at a time.

use std::io;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{bail, Context};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tracing::{debug, info, warn};
use crate::config::TransportConfig;
use crate::stream::{Family, Stream};

#[derive(Debug)]
pub enum Dock {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Dock {
    pub fn family(&self) -> Family {
        match self {
            Dock::Tcp(_) => Family::Internet,
            Dock::Unix { .. } => Family::Unix,
        }
    }

    /// Accepts the next inbound connection, returning it together with the peer's address
    ///  for access control (see [Stream::peer_ip])
    pub async fn accept(&self) -> io::Result<(Stream, IpAddr)> {
        match self {
            Dock::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Stream::Tcp(stream), addr.ip()))
            }
            Dock::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok((Stream::Unix(stream), IpAddr::V4(Ipv4Addr::LOCALHOST)))
            }
        }
    }
}

impl Drop for Dock {
    fn drop(&mut self) {
        if let Dock::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("could not remove Unix socket {:?}: {}", path, e);
                }
            }
        }
    }
}

/// The set of docks for one allocated port number
#[derive(Debug)]
pub struct ServerPort {
    pub port: u16,
    pub docks: Vec<Arc<Dock>>,
}

/// Allocates a port, trying `requested`, `requested + 1`, ... up to `retries` additional port
///  numbers if a port is already in use by another process.
pub async fn alloc_port(config: &TransportConfig, requested: u16, retries: u16) -> anyhow::Result<ServerPort> {
    config.validate()?;

    for offset in 0..=retries {
        let port = match requested.checked_add(offset) {
            Some(p) => p,
            None => break,
        };

        match bind_docks(config, port).await {
            Ok(docks) => {
                info!("allocated port {} with {} dock(s)", port, docks.len());
                return Ok(ServerPort { port, docks });
            }
            Err(e) if is_addr_in_use(&e) => {
                debug!("port {} is in use, trying the next one", port);
            }
            Err(e) => return Err(e),
        }
    }
    bail!("no free port in range {}..={}", requested, requested.saturating_add(retries))
}

fn is_addr_in_use(e: &anyhow::Error) -> bool {
    e.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|io_err| io_err.kind() == ErrorKind::AddrInUse)
}

async fn bind_docks(config: &TransportConfig, port: u16) -> anyhow::Result<Vec<Arc<Dock>>> {
    let mut docks = Vec::new();

    if config.bind_tcp {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.tcp_port(port)?);
        let listener = TcpListener::bind(addr).await
            .with_context(|| format!("binding TCP dock {:?}", addr))?;
        docks.push(Arc::new(Dock::Tcp(listener)));
    }

    if config.bind_unix {
        ensure_socket_dir(&config.socket_dir)?;
        let path = config.unix_socket_path(port);
        let listener = bind_unix(&path).await
            .with_context(|| format!("binding Unix dock {:?}", path))?;
        docks.push(Arc::new(Dock::Unix { listener, path }));
    }

    Ok(docks)
}

fn ensure_socket_dir(dir: &Path) -> anyhow::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating socket directory {:?}", dir))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o1777))
        .with_context(|| format!("setting permissions of socket directory {:?}", dir))?;
    Ok(())
}

/// A socket file can outlive the process that created it. It is only considered in use if
///  something actually accepts connections on it.
async fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(e);
            }
            debug!("removing stale Unix socket {:?}", path);
            std::fs::remove_file(path)?;
            UnixListener::bind(path)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix_only_config(dir: &Path) -> TransportConfig {
        TransportConfig {
            socket_dir: dir.join("sockets"),
            bind_tcp: false,
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_alloc_port_creates_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = unix_only_config(dir.path());

        let port = alloc_port(&config, 3, 0).await.unwrap();
        assert_eq!(port.port, 3);
        assert_eq!(port.docks.len(), 1);
        assert_eq!(port.docks[0].family(), Family::Unix);
        assert!(config.unix_socket_path(3).exists());

        drop(port);
        assert!(!config.unix_socket_path(3).exists());
    }

    #[tokio::test]
    async fn test_alloc_port_retries_when_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let config = unix_only_config(dir.path());

        let first = alloc_port(&config, 10, 0).await.unwrap();
        let second = alloc_port(&config, 10, 2).await.unwrap();
        assert_eq!(first.port, 10);
        assert_eq!(second.port, 11);

        assert!(alloc_port(&config, 10, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_alloc_port_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = unix_only_config(dir.path());
        std::fs::create_dir_all(&config.socket_dir).unwrap();

        let stale = std::os::unix::net::UnixListener::bind(config.unix_socket_path(4)).unwrap();
        drop(stale);
        assert!(config.unix_socket_path(4).exists());

        let port = alloc_port(&config, 4, 0).await.unwrap();
        assert_eq!(port.port, 4);
    }

    #[tokio::test]
    async fn test_accept_unix() {
        let dir = tempfile::tempdir().unwrap();
        let config = unix_only_config(dir.path());
        let port = alloc_port(&config, 1, 0).await.unwrap();

        let path = config.unix_socket_path(1);
        let client = tokio::spawn(async move { Stream::connect_unix(&path).await.unwrap() });

        let (stream, peer) = port.docks[0].accept().await.unwrap();
        assert_eq!(stream.family(), Family::Unix);
        assert_eq!(peer, IpAddr::V4(Ipv4Addr::LOCALHOST));
        client.await.unwrap();
    }
}
