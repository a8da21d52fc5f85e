//! Reading and writing of Karma's general data structure.
//!
//! The data structure is a self-describing tree: a *multi array* holds one or more trees, each
//!  consisting of a packet descriptor and a packet. A packet is an ordered list of elements,
//!  each of which is a number (possibly complex), a string, an N-dimensional array of packets
//!  or a linked list of packets. Arrays and lists nest arbitrarily.
//!
//! ## Wire format
//!
//! All numbers are in network byte order (BE). Strings are a u32 byte length followed by UTF-8
//!  bytes.
//!
//! Multi array:
//! ```ascii
//! 0:  magic "KarmaRHD Version" (16 bytes)
//! 16: version (u32), must be 0
//! 20: number of arrays n (u32), at least 1
//! *:  n times: packet descriptor, packet
//! *:  if n > 1: n array names (strings, not empty)
//! *:  history lines (strings), terminated by an empty string
//! ```
//!
//! Packet descriptor:
//! ```ascii
//! 0: number of elements (u32), at least 1
//! *: element descriptors:
//!    * type code (u32)
//!    * numbers and strings: name (string, not empty)
//!    * array: array descriptor
//!    * list: packet descriptor of the list entries
//! ```
//!
//! Array descriptor:
//! ```ascii
//! 0: number of dimensions d (u32), at least 1
//! 4: number of tiling levels l (u32), 0 for an untiled array
//! *: d dimension descriptors:
//!    * name (string, not empty)
//!    * length (u64), at least 1
//!    * regular flag ('T' or 'F')
//!    * regular: first and last coordinate (f64), otherwise `length` coordinates (f64)
//! *: d * l tile lengths (u64), grouped by dimension
//! *: packet descriptor of the array's elements
//! ```
//!
//! Packet data is the concatenation of its elements' values:
//! ```ascii
//! number:          the value; complex numbers real part first
//! variable string: string
//! fixed string:    maximum length (u32), then that many bytes, NUL padded
//! array:           [padding], then the packets in row-major order
//! list:            number of entries (u64), then the packets
//! ```
//!
//! Streams that are persisted ([format::Padding::Aligned]) precede each array's packets with
//!  a pad length (u32) and that many zero bytes, so that array data starts at a multiple of 16
//!  bytes from the start of the stream.
//!
//! ## Fast paths
//!
//! Arrays of packets that consist of numbers only are stored packed in host byte order (see
//!  [data::PacketSeq]). On a big-endian host, they are transferred with a single copy. On other
//!  hosts, packets with a single numeric element are transferred with a single byte swapping
//!  pass. Reading from a memory mapped file does not copy packed data at all.

use std::future::Future;
use std::pin::Pin;

pub mod data;
pub mod desc;
pub mod file;
pub mod format;
pub mod read;
pub mod types;
pub mod write;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
