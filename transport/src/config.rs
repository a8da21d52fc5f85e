use std::path::PathBuf;
use anyhow::bail;
use tracing::debug;

pub const ENV_BASE_PORT: &str = "KARMA_BASE_PORT";
pub const ENV_SOCKET_DIR: &str = "KARMA_SOCKET_DIR";

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Karma port numbers are small integers shared by all modules on a host. The TCP port a
    ///  dock listens on is `base_port + port number`, so that a site can move the whole range
    ///  without touching module configuration.
    pub base_port: u16,

    /// Unix domain sockets live in this well-known directory so that local modules can find
    ///  each other without any registry: the socket for port number `n` is
    ///  `<socket_dir>/<socket_prefix><n>`.
    ///
    /// NB: The directory is shared by all users of a host, so it is created world-writable
    ///      with the sticky bit set
    pub socket_dir: PathBuf,
    pub socket_prefix: String,

    pub bind_tcp: bool,
    pub bind_unix: bool,
    pub tcp_nodelay: bool,

    /// Writes to a channel are buffered up to this size before they hit the socket. Callers
    ///  flush explicitly at message boundaries.
    pub write_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            base_port: 6200,
            socket_dir: PathBuf::from("/tmp/.KARMA_connections"),
            socket_prefix: "connection.".to_string(),
            bind_tcp: true,
            bind_unix: true,
            tcp_nodelay: true,
            write_buffer_size: 64 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> anyhow::Result<TransportConfig> {
        let mut result = TransportConfig::default();

        if let Ok(raw) = std::env::var(ENV_BASE_PORT) {
            result.base_port = match raw.trim().parse() {
                Ok(port) => port,
                Err(_) => bail!("{} must be a port number, was {:?}", ENV_BASE_PORT, raw),
            };
            debug!("base port {} from environment", result.base_port);
        }
        if let Ok(raw) = std::env::var(ENV_SOCKET_DIR) {
            result.socket_dir = PathBuf::from(raw);
            debug!("Unix socket directory {:?} from environment", result.socket_dir);
        }

        result.validate()?;
        Ok(result)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.bind_tcp && !self.bind_unix {
            bail!("at least one of TCP and Unix domain docks must be enabled");
        }
        if self.write_buffer_size == 0 {
            bail!("write buffer size must not be 0");
        }
        if self.socket_prefix.contains('/') {
            bail!("socket prefix must not contain a path separator: {:?}", self.socket_prefix);
        }
        Ok(())
    }

    pub fn unix_socket_path(&self, port: u16) -> PathBuf {
        self.socket_dir.join(format!("{}{}", self.socket_prefix, port))
    }

    pub fn tcp_port(&self, port: u16) -> anyhow::Result<u16> {
        match self.base_port.checked_add(port) {
            Some(p) => Ok(p),
            None => bail!("port number {} is out of range for base port {}", port, self.base_port),
        }
    }
}
