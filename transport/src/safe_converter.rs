/// Widening conversions that are lossless on every platform this crate builds for
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

/// Narrowing conversion of a value the local code produced itself, e.g. the length of a string
///  that goes into a u32 length field. Out of range is a bug and panics.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        match u32::try_from(self) {
            Ok(v) => v,
            Err(_) => panic!("this is a bug: {} does not fit into a u32 length field", self),
        }
    }
}

/// Converts a length or count received from a peer. Unlike [PrecheckedCast], the value is not
///  trusted, so an out-of-range value is an error rather than a bug.
pub fn checked_len(raw: u64) -> anyhow::Result<usize> {
    usize::try_from(raw)
        .map_err(|_| anyhow::anyhow!("length {} does not fit into this platform's address space", raw))
}
