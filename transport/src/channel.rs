use std::cmp::{max, min};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use anyhow::{bail, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};
use crate::stream::Stream;

const READ_CHUNK: usize = 16 * 1024;

/// Upper bound for prefetching in [Channel::bytes_readable], so that a fast peer can not make
///  a single readiness notification buffer unbounded amounts of data
const MAX_PREFETCH: usize = 4 * 1024 * 1024;

#[derive(Debug)]
enum Backend {
    Stream(Arc<Stream>),
    File(File),
    /// unread remainder of a memory mapped file (or of an in-memory buffer)
    Mapped(Bytes),
    /// write-only sink, see [Channel::into_bytes]
    Memory,
}

/// A buffered byte stream with fixed-width big-endian ("network order") encoding of integers
///  and floats.
///
/// The same channel abstraction sits on top of a connected socket, a file or a memory map, so
///  that the data structure codec does not need to know where its bytes go. The channel keeps
///  track of the number of bytes read and written, which is the basis for both alignment
///  padding and for checking that a read callback made progress.
///
/// Writes are buffered and only hit the socket when the buffer fills up or on
///  [Channel::flush].
#[derive(Debug)]
pub struct Channel {
    backend: Backend,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buffer_size: usize,
    read_position: u64,
    write_position: u64,
    eof: bool,
}

impl Channel {
    fn new(backend: Backend, write_buffer_size: usize) -> Channel {
        Channel {
            backend,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::with_capacity(write_buffer_size),
            write_buffer_size,
            read_position: 0,
            write_position: 0,
            eof: false,
        }
    }

    pub fn from_stream(stream: Arc<Stream>, write_buffer_size: usize) -> Channel {
        Channel::new(Backend::Stream(stream), write_buffer_size)
    }

    pub async fn create_file(path: &Path, write_buffer_size: usize) -> anyhow::Result<Channel> {
        let file = File::create(path).await
            .with_context(|| format!("creating {:?}", path))?;
        Ok(Channel::new(Backend::File(file), write_buffer_size))
    }

    pub async fn open_file(path: &Path) -> anyhow::Result<Channel> {
        let file = File::open(path).await
            .with_context(|| format!("opening {:?}", path))?;
        Ok(Channel::new(Backend::File(file), READ_CHUNK))
    }

    /// Opens a file for reading through a memory map. Data read with [Channel::read_bytes] is
    ///  a slice of the mapping rather than a copy.
    pub fn open_mapped(path: &Path) -> anyhow::Result<Channel> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening {:?}", path))?;
        let len = file.metadata()?.len();

        let data = if len == 0 {
            Bytes::new()
        }
        else {
            // SAFETY: the mapping is read-only. Karma data files are written once and not
            //  modified while they are read.
            let mmap = unsafe { memmap2::Mmap::map(&file) }
                .with_context(|| format!("mapping {:?}", path))?;
            Bytes::from_owner(mmap)
        };
        debug!("mapped {:?} ({} bytes)", path, len);
        Ok(Channel::new(Backend::Mapped(data), READ_CHUNK))
    }

    /// A read-only channel over data that is already in memory
    pub fn from_bytes(data: Bytes) -> Channel {
        Channel::new(Backend::Mapped(data), READ_CHUNK)
    }

    /// A write-only channel that collects everything written to it, see [Channel::into_bytes]
    pub fn memory_sink() -> Channel {
        Channel::new(Backend::Memory, READ_CHUNK)
    }

    pub fn into_bytes(self) -> Bytes {
        self.write_buf.freeze()
    }

    pub fn stream(&self) -> Option<&Arc<Stream>> {
        match &self.backend {
            Backend::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backend, Backend::Mapped(_))
    }

    pub fn read_position(&self) -> u64 {
        self.read_position
    }

    pub fn write_position(&self) -> u64 {
        self.write_position
    }

    /// true once the peer closed the stream (or the end of a file was reached). Buffered data
    ///  can still be read after that.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// The number of bytes that can be read without waiting. For a socket, this pulls whatever
    ///  the OS has buffered into the channel's buffer without blocking; a closed peer shows up
    ///  as [Channel::is_eof].
    pub fn bytes_readable(&mut self) -> anyhow::Result<usize> {
        let Channel { backend, read_buf, eof, .. } = self;
        match backend {
            Backend::Mapped(data) => Ok(data.len()),
            Backend::Memory => Ok(0),
            Backend::File(_) => Ok(read_buf.len()),
            Backend::Stream(stream) => {
                while !*eof && read_buf.len() < MAX_PREFETCH {
                    read_buf.reserve(READ_CHUNK);
                    match stream.try_read_buf(read_buf) {
                        Ok(0) => {
                            debug!("peer closed the stream");
                            *eof = true;
                        }
                        Ok(n) => trace!("prefetched {} bytes", n),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(read_buf.len())
            }
        }
    }

    /// Makes sure there are at least `n` bytes in the read buffer, waiting for them if
    ///  necessary. `n` often comes from the peer, so the buffer grows only as data actually
    ///  arrives: a truncated stream announcing a huge length fails at its end instead of
    ///  allocating the announced size up front.
    async fn fill(&mut self, n: usize) -> anyhow::Result<()> {
        let Channel { backend, read_buf, eof, .. } = self;
        while read_buf.len() < n {
            if *eof {
                bail!("unexpected end of stream: need {} bytes, {} available", n, read_buf.len());
            }
            read_buf.reserve(min(max(n - read_buf.len(), READ_CHUNK), MAX_PREFETCH));
            let num_read = match backend {
                Backend::Stream(stream) => stream.read_buf(read_buf).await?,
                Backend::File(file) => file.read_buf(read_buf).await?,
                Backend::Mapped(_) | Backend::Memory => 0,
            };
            if num_read == 0 {
                *eof = true;
            }
        }
        Ok(())
    }

    async fn buffered(&mut self, n: usize) -> anyhow::Result<&mut (dyn Buf + Send)> {
        match &self.backend {
            Backend::Mapped(data) => {
                if data.len() < n {
                    bail!("unexpected end of data: need {} bytes, {} available", n, data.len());
                }
            }
            Backend::Memory => bail!("this channel is write-only"),
            _ => self.fill(n).await?,
        }
        self.read_position += n as u64;

        match &mut self.backend {
            Backend::Mapped(data) => Ok(data),
            _ => Ok(&mut self.read_buf),
        }
    }

    pub async fn read_exact(&mut self, dst: &mut [u8]) -> anyhow::Result<()> {
        self.buffered(dst.len()).await?.copy_to_slice(dst);
        Ok(())
    }

    /// Reads `len` bytes. For a memory mapped channel, the result shares the mapping.
    pub async fn read_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        self.buffered(len).await?;
        match &mut self.backend {
            Backend::Mapped(data) => Ok(data.split_to(len)),
            _ => Ok(self.read_buf.split_to(len).freeze()),
        }
    }

    pub async fn skip(&mut self, len: usize) -> anyhow::Result<()> {
        self.buffered(len).await?.advance(len);
        Ok(())
    }

    /// Everything that is currently buffered, without waiting
    pub fn read_available(&mut self) -> anyhow::Result<Bytes> {
        let len = self.bytes_readable()?;
        self.read_position += len as u64;
        match &mut self.backend {
            Backend::Mapped(data) => Ok(data.split_to(len)),
            _ => Ok(self.read_buf.split_to(len).freeze()),
        }
    }

    pub async fn read_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.buffered(1).await?.get_u8())
    }

    pub async fn read_u32(&mut self) -> anyhow::Result<u32> {
        Ok(self.buffered(4).await?.get_u32())
    }

    pub async fn read_i32(&mut self) -> anyhow::Result<i32> {
        Ok(self.buffered(4).await?.get_i32())
    }

    pub async fn read_u64(&mut self) -> anyhow::Result<u64> {
        Ok(self.buffered(8).await?.get_u64())
    }

    pub async fn read_f64(&mut self) -> anyhow::Result<f64> {
        Ok(self.buffered(8).await?.get_f64())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.write_buf.put_slice(data);
        self.wrote(data.len()).await
    }

    pub async fn write_u8(&mut self, value: u8) -> anyhow::Result<()> {
        self.write_buf.put_u8(value);
        self.wrote(1).await
    }

    pub async fn write_u32(&mut self, value: u32) -> anyhow::Result<()> {
        self.write_buf.put_u32(value);
        self.wrote(4).await
    }

    pub async fn write_u64(&mut self, value: u64) -> anyhow::Result<()> {
        self.write_buf.put_u64(value);
        self.wrote(8).await
    }

    pub async fn write_f64(&mut self, value: f64) -> anyhow::Result<()> {
        self.write_buf.put_f64(value);
        self.wrote(8).await
    }

    /// Writes `len` zero bytes. The bytes are always explicitly zeroed so that equal data
    ///  produces equal output.
    pub async fn write_zeros(&mut self, len: usize) -> anyhow::Result<()> {
        self.write_buf.put_bytes(0, len);
        self.wrote(len).await
    }

    async fn wrote(&mut self, len: usize) -> anyhow::Result<()> {
        self.write_position += len as u64;
        if self.write_buf.len() >= self.write_buffer_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        match &mut self.backend {
            Backend::Stream(stream) => {
                if !self.write_buf.is_empty() {
                    trace!("flushing {} bytes", self.write_buf.len());
                    stream.write_all(&self.write_buf).await?;
                    self.write_buf.clear();
                }
            }
            Backend::File(file) => {
                if !self.write_buf.is_empty() {
                    file.write_all(&self.write_buf).await?;
                    self.write_buf.clear();
                }
                file.flush().await?;
            }
            Backend::Mapped(_) => {
                if !self.write_buf.is_empty() {
                    bail!("this channel is read-only");
                }
            }
            Backend::Memory => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    fn stream_pair() -> (Arc<Stream>, Arc<Stream>) {
        let (a, b) = UnixStream::pair().unwrap();
        (Arc::new(Stream::Unix(a)), Arc::new(Stream::Unix(b)))
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let mut sink = Channel::memory_sink();
        sink.write_u8(7).await.unwrap();
        sink.write_u32(0x0102_0304).await.unwrap();
        sink.write_u64(u64::MAX - 1).await.unwrap();
        sink.write_f64(-2.5).await.unwrap();
        sink.write_zeros(3).await.unwrap();
        sink.write_all(b"abc").await.unwrap();
        assert_eq!(sink.write_position(), 1 + 4 + 8 + 8 + 3 + 3);
        sink.flush().await.unwrap();

        let bytes = sink.into_bytes();
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);

        let mut source = Channel::from_bytes(bytes);
        assert_eq!(source.read_u8().await.unwrap(), 7);
        assert_eq!(source.read_u32().await.unwrap(), 0x0102_0304);
        assert_eq!(source.read_u64().await.unwrap(), u64::MAX - 1);
        assert_eq!(source.read_f64().await.unwrap(), -2.5);
        source.skip(3).await.unwrap();
        assert_eq!(source.read_bytes(3).await.unwrap().as_ref(), b"abc");
        assert_eq!(source.read_position(), 27);
        assert_eq!(source.bytes_readable().unwrap(), 0);

        assert!(source.read_u8().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_sink_is_write_only() {
        let mut sink = Channel::memory_sink();
        assert!(sink.read_u8().await.is_err());
        assert_eq!(sink.bytes_readable().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_bytes_readable_and_eof() {
        let (a, b) = stream_pair();
        let mut writer = Channel::from_stream(a, 1024);
        let mut reader = Channel::from_stream(b, 1024);

        assert_eq!(reader.bytes_readable().unwrap(), 0);
        assert!(!reader.is_eof());

        writer.write_all(b"hello").await.unwrap();
        assert_eq!(reader.bytes_readable().unwrap(), 0, "not flushed yet");
        writer.flush().await.unwrap();

        reader.stream().unwrap().readable().await.unwrap();
        assert_eq!(reader.bytes_readable().unwrap(), 5);
        assert_eq!(reader.read_available().unwrap().as_ref(), b"hello");
        assert_eq!(reader.read_position(), 5);

        drop(writer);
        reader.stream().unwrap().readable().await.unwrap();
        assert_eq!(reader.bytes_readable().unwrap(), 0);
        assert!(reader.is_eof());
        assert!(reader.read_u32().await.is_err());
    }

    #[tokio::test]
    async fn test_stream_write_buffer_flushes_when_full() {
        let (a, b) = stream_pair();
        let mut writer = Channel::from_stream(a, 4);
        let mut reader = Channel::from_stream(b, 4);

        writer.write_u64(42).await.unwrap();
        assert_eq!(reader.read_u64().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_file_and_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");

        let mut file = Channel::create_file(&path, 2).await.unwrap();
        file.write_u32(99).await.unwrap();
        file.write_all(&[5; 100]).await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let mut file = Channel::open_file(&path).await.unwrap();
        assert!(!file.is_mapped());
        assert_eq!(file.read_u32().await.unwrap(), 99);
        assert_eq!(file.read_bytes(100).await.unwrap().as_ref(), &[5; 100]);
        assert!(file.read_u8().await.is_err());

        let mut mapped = Channel::open_mapped(&path).unwrap();
        assert!(mapped.is_mapped());
        assert_eq!(mapped.bytes_readable().unwrap(), 104);
        assert_eq!(mapped.read_u32().await.unwrap(), 99);
        assert_eq!(mapped.read_bytes(100).await.unwrap().as_ref(), &[5; 100]);
        assert_eq!(mapped.read_position(), 104);
    }

    #[tokio::test]
    async fn test_huge_length_on_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [1u8; 58]).unwrap();

        let mut file = Channel::open_file(&path).await.unwrap();
        assert!(file.read_bytes(1 << 40).await.is_err());
        assert!(file.is_eof());

        let mut mapped = Channel::open_mapped(&path).unwrap();
        assert!(mapped.read_bytes(1 << 40).await.is_err());
    }

    #[tokio::test]
    async fn test_huge_length_on_closed_stream() {
        let (a, b) = stream_pair();
        let mut writer = Channel::from_stream(a, 1024);
        let mut reader = Channel::from_stream(b, 1024);

        writer.write_all(&[7; 100]).await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        assert!(reader.read_bytes(usize::MAX / 2).await.is_err());
        assert!(reader.is_eof());
    }

    #[tokio::test]
    async fn test_mapped_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let mut mapped = Channel::open_mapped(&path).unwrap();
        assert_eq!(mapped.bytes_readable().unwrap(), 0);
        assert!(mapped.read_u8().await.is_err());
    }
}
