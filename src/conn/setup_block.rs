use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use transport::channel::Channel;
use transport::safe_converter::{PrecheckedCast, SafeCast};

pub const SETUP_MAGIC: u32 = 0x4B41_524D;
pub const SETUP_REVISION: u32 = 1;

pub const PROTOCOL_NAME_LEN: usize = 80;
pub const PASSWORD_LEN: usize = 128;

/// upper bound for the length prefixed strings exchanged during the handshake
pub const MAX_HANDSHAKE_STRING_LEN: u32 = 4096;

/// The fixed-width block a client sends right after connecting. The client's module name
///  follows it as a length prefixed string (see [write_string]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupBlock {
    pub magic: u32,
    pub revision: u32,
    pub protocol: String,
    pub version: u32,
    pub password: [u8; PASSWORD_LEN],
}

impl SetupBlock {
    pub const SERIALIZED_LEN: usize = 4 + 4 + PROTOCOL_NAME_LEN + 4 + PASSWORD_LEN;

    pub fn new(protocol: &str, version: u32, password: Option<&str>) -> SetupBlock {
        SetupBlock {
            magic: SETUP_MAGIC,
            revision: SETUP_REVISION,
            protocol: protocol.to_string(),
            version,
            password: padded_password(password.unwrap_or("")),
        }
    }

    /// byte-for-byte comparison of the padded password fields
    pub fn password_matches(&self, expected: &str) -> bool {
        self.password == padded_password(expected)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        assert!(self.protocol.len() < PROTOCOL_NAME_LEN, "this is a bug: protocol name {:?} is too long", self.protocol);

        buf.put_u32(self.magic);
        buf.put_u32(self.revision);
        buf.put_slice(self.protocol.as_bytes());
        buf.put_bytes(0, PROTOCOL_NAME_LEN - self.protocol.len());
        buf.put_u32(self.version);
        buf.put_slice(&self.password);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let magic = buf.try_get_u32()?;
        let revision = buf.try_get_u32()?;

        let mut raw_name = [0u8; PROTOCOL_NAME_LEN];
        try_copy(buf, &mut raw_name)?;
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(PROTOCOL_NAME_LEN);
        let protocol = String::from_utf8_lossy(&raw_name[..name_len]).into_owned();

        let version = buf.try_get_u32()?;

        let mut password = [0u8; PASSWORD_LEN];
        try_copy(buf, &mut password)?;

        Ok(SetupBlock {
            magic,
            revision,
            protocol,
            version,
            password,
        })
    }

    pub async fn read_from(channel: &mut Channel) -> anyhow::Result<SetupBlock> {
        let mut raw = [0u8; Self::SERIALIZED_LEN];
        channel.read_exact(&mut raw).await?;
        Self::deser(&mut &raw[..])
    }

    pub async fn write_to(&self, channel: &mut Channel) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        channel.write_all(&buf).await
    }
}

fn padded_password(password: &str) -> [u8; PASSWORD_LEN] {
    let mut result = [0u8; PASSWORD_LEN];
    let len = password.len().min(PASSWORD_LEN);
    result[..len].copy_from_slice(&password.as_bytes()[..len]);
    result
}

fn try_copy(buf: &mut impl Buf, dst: &mut [u8]) -> anyhow::Result<()> {
    if buf.remaining() < dst.len() {
        bail!("setup block truncated: need {} bytes, {} available", dst.len(), buf.remaining());
    }
    buf.copy_to_slice(dst);
    Ok(())
}

/// u32 length followed by the bytes
pub async fn write_string(channel: &mut Channel, s: &str) -> anyhow::Result<()> {
    channel.write_u32(s.len().prechecked_cast()).await?;
    channel.write_all(s.as_bytes()).await
}

pub async fn read_string(channel: &mut Channel) -> anyhow::Result<String> {
    let len = channel.read_u32().await?;
    if len > MAX_HANDSHAKE_STRING_LEN {
        bail!("handshake string of {} bytes exceeds the maximum of {}", len, MAX_HANDSHAKE_STRING_LEN);
    }
    let raw = channel.read_bytes(len.safe_cast()).await?;
    Ok(String::from_utf8(raw.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_layout() {
        let block = SetupBlock::new("echo", 3, Some("secret"));
        let mut buf = BytesMut::new();
        block.ser(&mut buf);

        assert_eq!(buf.len(), SetupBlock::SERIALIZED_LEN);
        assert_eq!(&buf[0..4], &[0x4B, 0x41, 0x52, 0x4D]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        assert_eq!(&buf[8..12], b"echo");
        assert!(buf[12..88].iter().all(|&b| b == 0));
        assert_eq!(&buf[88..92], &[0, 0, 0, 3]);
        assert_eq!(&buf[92..98], b"secret");
        assert!(buf[98..].iter().all(|&b| b == 0));

        let deser = SetupBlock::deser(&mut buf.freeze()).unwrap();
        assert_eq!(deser, block);
        assert!(deser.password_matches("secret"));
        assert!(!deser.password_matches("secre"));
        assert!(!deser.password_matches("secret2"));
    }

    #[test]
    fn test_no_password() {
        let block = SetupBlock::new("echo", 1, None);
        assert!(block.password_matches(""));
        assert!(!block.password_matches("x"));
    }

    #[test]
    fn test_truncated() {
        let block = SetupBlock::new("echo", 1, None);
        let mut buf = BytesMut::new();
        block.ser(&mut buf);
        let mut truncated = buf.freeze().slice(0..SetupBlock::SERIALIZED_LEN - 1);
        assert!(SetupBlock::deser(&mut truncated).is_err());
    }

    #[test]
    #[should_panic(expected = "this is a bug")]
    fn test_protocol_name_too_long() {
        let block = SetupBlock::new(&"p".repeat(PROTOCOL_NAME_LEN), 1, None);
        block.ser(&mut BytesMut::new());
    }

    #[tokio::test]
    async fn test_strings() {
        let mut out = Channel::memory_sink();
        write_string(&mut out, "module").await.unwrap();
        write_string(&mut out, "").await.unwrap();
        out.flush().await.unwrap();

        let mut input = Channel::from_bytes(out.into_bytes());
        assert_eq!(read_string(&mut input).await.unwrap(), "module");
        assert_eq!(read_string(&mut input).await.unwrap(), "");
        assert!(read_string(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn test_string_too_long() {
        let mut raw = BytesMut::new();
        raw.put_u32(MAX_HANDSHAKE_STRING_LEN + 1);
        raw.put_bytes(b'x', 8);
        let mut input = Channel::from_bytes(Bytes::from(raw));
        assert!(read_string(&mut input).await.is_err());
    }
}
