use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use anyhow::{bail, Context};
use tracing::debug;
use crate::config::TransportConfig;
use crate::stream::Stream;

/// Where an outbound connection goes. Peers on this host are reached through their Unix domain
///  dock when it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Target {
    pub fn is_local(&self) -> bool {
        match self {
            Target::Unix(_) => true,
            Target::Tcp(addr) => addr.ip().is_loopback(),
        }
    }
}

/// `unix` always means the Unix domain socket; `localhost`, loopback addresses and this host's
///  own name are local as well
pub fn is_local_host(host: &str, local_hostname: &str) -> bool {
    host == "unix"
        || host.eq_ignore_ascii_case("localhost")
        || host.eq_ignore_ascii_case(local_hostname)
        || host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

pub async fn resolve(config: &TransportConfig, host: &str, port: u16, local_hostname: &str) -> anyhow::Result<Target> {
    if host == "unix" {
        return Ok(Target::Unix(config.unix_socket_path(port)));
    }

    let tcp_port = config.tcp_port(port)?;
    if is_local_host(host, local_hostname) {
        let path = config.unix_socket_path(port);
        if path.exists() {
            return Ok(Target::Unix(path));
        }
        return Ok(Target::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), tcp_port)));
    }

    let mut addrs = tokio::net::lookup_host((host, tcp_port)).await
        .with_context(|| format!("resolving host {:?}", host))?;
    match addrs.next() {
        Some(addr) => {
            debug!("resolved {:?} to {:?}", host, addr);
            Ok(Target::Tcp(addr))
        }
        None => bail!("host {:?} has no address", host),
    }
}

pub async fn connect(config: &TransportConfig, target: &Target) -> anyhow::Result<Stream> {
    let stream = match target {
        Target::Unix(path) => Stream::connect_unix(path).await
            .with_context(|| format!("connecting to {:?}", path))?,
        Target::Tcp(addr) => Stream::connect_tcp(*addr, config.tcp_nodelay).await
            .with_context(|| format!("connecting to {:?}", addr))?,
    };
    Ok(stream)
}
