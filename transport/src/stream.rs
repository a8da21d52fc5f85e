use std::io;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use bytes::BufMut;
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unix,
    Internet,
}

/// A connected socket of either address family.
///
/// All I/O goes through `&self`: a [crate::channel::Channel] owns the stream for reading and
///  writing while a readiness watcher holds a second reference to wait for input.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub async fn connect_tcp(addr: SocketAddr, nodelay: bool) -> io::Result<Stream> {
        let stream = TcpStream::connect(addr).await?;
        if nodelay {
            stream.set_nodelay(true)?;
        }
        debug!("TCP connected to {:?}", addr);
        Ok(Stream::Tcp(stream))
    }

    pub async fn connect_unix(path: &Path) -> io::Result<Stream> {
        let stream = UnixStream::connect(path).await?;
        debug!("Unix domain connected to {:?}", path);
        Ok(Stream::Unix(stream))
    }

    pub fn family(&self) -> Family {
        match self {
            Stream::Tcp(_) => Family::Internet,
            Stream::Unix(_) => Family::Unix,
        }
    }

    /// Unix domain peers are by definition on this host, and they are reported as the
    ///  loopback address for the purpose of host based access checks.
    pub fn peer_ip(&self) -> IpAddr {
        match self {
            Stream::Tcp(s) => s.peer_addr()
                .map(|a| a.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            Stream::Unix(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub async fn readable(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.readable().await,
            Stream::Unix(s) => s.readable().await,
        }
    }

    /// Non-blocking read into the buffer's spare capacity. `Ok(0)` means the peer closed the
    ///  stream, `WouldBlock` that there is nothing to read right now.
    pub fn try_read_buf(&self, buf: &mut impl BufMut) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_read_buf(buf),
            Stream::Unix(s) => s.try_read_buf(buf),
        }
    }

    /// Waits until at least one byte is available (or the peer closed the stream) and reads
    ///  what is there
    pub async fn read_buf(&self, buf: &mut impl BufMut) -> io::Result<usize> {
        loop {
            self.readable().await?;
            match self.try_read_buf(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            self.writable().await?;
            let result = match self {
                Stream::Tcp(s) => s.try_write(buf),
                Stream::Unix(s) => s.try_write(buf),
            };
            match result {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "peer stopped accepting data")),
                Ok(n) => {
                    trace!("wrote {} bytes", n);
                    buf = &buf[n..];
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn writable(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.writable().await,
            Stream::Unix(s) => s.writable().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[tokio::test]
    async fn test_unix_pair_read_write() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = Stream::Unix(a);
        let b = Stream::Unix(b);
        assert_eq!(a.family(), Family::Unix);
        assert_eq!(b.peer_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        a.write_all(b"hello").await.unwrap();

        let mut buf = BytesMut::with_capacity(16);
        let mut total = 0;
        while total < 5 {
            total += b.read_buf(&mut buf).await.unwrap();
        }
        assert_eq!(buf.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_try_read_would_block_and_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = Stream::Unix(a);
        let b = Stream::Unix(b);

        let mut buf = BytesMut::with_capacity(16);
        let e = b.try_read_buf(&mut buf).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::WouldBlock);

        drop(a);
        let n = b.read_buf(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
