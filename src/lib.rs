//! Connections between Karma modules.
//!
//! Modules talk to each other through named, versioned protocols. A module registers the
//!  protocols it serves and the protocols it uses with its [conn::ConnectionManager],
//!  opens a port to accept connections and connects to other modules' ports. Every connection
//!  starts with a handshake that agrees on the protocol (and optionally checks a password),
//!  after which the protocol's [conn::ProtocolHandler] owns the byte stream.
//!
//! Data exchanged over connections is typically encoded with the `dsrw` crate's data
//!  structure codec, and the byte level plumbing is in the `transport` crate.
//!
//! The connection manager runs on a single [event_loop::EventLoop]:
//!
//! ```ignore
//! let (channel_manager, mut event_loop) = tokio_channel_manager();
//! let mut mgr = ConnectionManager::new(ConnConfig::from_env("my_module")?)?;
//! mgr.register_managers(Box::new(channel_manager));
//! mgr.register_server_protocol("echo", 1, 0, Arc::new(EchoProtocol));
//! mgr.become_server(1, 10).await?;
//! event_loop.run(&mut mgr).await?;
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod event_loop;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
