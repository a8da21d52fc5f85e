//! The transport layer underneath Karma connections: listening docks, connected streams and a
//!  buffered byte-order-aware channel on top of them.
//!
//! ## Ports and docks
//!
//! Modules address each other by *Karma port numbers*, small integers that are independent of
//!  the address family. A server allocates one port, which results in one listening *dock* per
//!  enabled address family:
//!
//! ```ascii
//! Karma port n ---+--> TCP dock:          0.0.0.0:<base_port + n>
//!                 |
//!                 +--> Unix domain dock:  <socket_dir>/<socket_prefix><n>
//! ```
//!
//! A process can own at most one port at a time. If the requested port number is in use,
//!  allocation optionally moves on to the next numbers (see [dock::alloc_port]).
//!
//! Clients connecting to a module on the same host prefer the Unix domain socket if it exists,
//!  falling back to TCP on the loopback interface (see [address::resolve]).
//!
//! ## Channels
//!
//! A [channel::Channel] is a buffered stream over a socket, a file or a memory mapped file. All
//!  multi-byte values are written in network byte order (BE):
//!
//! ```ascii
//! u8:   1 byte
//! u32:  4 bytes BE
//! u64:  8 bytes BE
//! f64:  8 bytes BE, IEEE 754
//! ```
//!
//! Channels count the bytes read and written since they were created. The data structure codec
//!  uses the write position for alignment padding, and the connection manager uses the read
//!  position to check that protocol handlers make progress.
//!
//! ## Errors
//!
//! Most I/O failures are ordinary `anyhow` errors. Conditions that leave a shared stream in an
//!  undefined state are reported as [error::Fatal], which the application's top level turns
//!  into a process exit.

pub mod address;
pub mod channel;
pub mod config;
pub mod dock;
pub mod error;
pub mod safe_converter;
pub mod stream;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
