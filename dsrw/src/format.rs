use bytes::{BufMut, Bytes, BytesMut};

pub const MAGIC: &[u8; 16] = b"KarmaRHD Version";
pub const VERSION: u32 = 0;

/// Array data in padded streams starts at multiples of this, counted from the start of the stream
pub const ALIGNMENT: u64 = 16;

pub const FLAG_TRUE: u8 = b'T';
pub const FLAG_FALSE: u8 = b'F';

/// Whether array values are preceded by alignment padding. This is a property of the stream,
///  and both sides must agree on it: persisted files are padded, connections are not.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Padding {
    None,
    Aligned,
}

/// the number of filler bytes that moves `position` to the next alignment boundary
pub fn pad_length(position: u64) -> u32 {
    ((ALIGNMENT - position % ALIGNMENT) % ALIGNMENT) as u32
}

/// Reverses the byte order of each `value_size` byte value
pub fn swap_bytes(data: &[u8], value_size: usize) -> Bytes {
    if value_size <= 1 {
        return Bytes::copy_from_slice(data);
    }
    let mut result = BytesMut::with_capacity(data.len());
    for value in data.chunks_exact(value_size) {
        for &b in value.iter().rev() {
            result.put_u8(b);
        }
    }
    result.freeze()
}
