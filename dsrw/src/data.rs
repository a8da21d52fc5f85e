use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use crate::desc::{ElementDesc, PacketDesc};
use crate::types::AtomicValue;

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Atomic(AtomicValue),
    VString(String),
    FString(FixedString),
    Array(ArrayData),
    List(ListData),
}

/// A string stored in a fixed number of bytes, NUL padded
#[derive(Debug, Clone, PartialEq)]
pub struct FixedString {
    pub max_len: u32,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayData {
    pub packets: PacketSeq,
}

/// The entries of a linked list. Entries are held in a contiguous segment followed by
///  individually added fragments; reading a list places all entries in the contiguous segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ListData {
    pub contiguous: PacketSeq,
    pub fragments: Vec<Packet>,
}

/// A sequence of packets sharing a descriptor.
///
/// Flat packets (see [PacketDesc::is_flat]) are stored packed in host byte order, which allows
///  bulk transfer and zero-copy reads from memory mapped files. All other packets are stored
///  individually.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketSeq {
    Raw(Bytes),
    Packets(Vec<Packet>),
}

/// Checks that an atomic value fits an element descriptor. A mismatch means the tree was
///  built inconsistently, which is a bug in the calling code.
pub(crate) fn check_atomic(desc: &ElementDesc, value: &AtomicValue) {
    match desc.atomic_type() {
        Some(ty) if ty == value.atomic_type() && value.is_consistent() => {}
        _ => panic!("this is a bug: value {:?} does not match element descriptor {:?}", value, desc),
    }
}

impl Packet {
    pub fn new(values: Vec<Value>) -> Packet {
        Packet { values }
    }

    pub fn atomic(value: AtomicValue) -> Packet {
        Packet::new(vec![Value::Atomic(value)])
    }

    /// Appends the packed representation of a flat packet
    pub fn pack_into(&self, desc: &PacketDesc, buf: &mut impl BufMut) {
        assert_eq!(self.values.len(), desc.elements.len(), "this is a bug: packet does not match its descriptor");
        for (value, elem) in self.values.iter().zip(&desc.elements) {
            match value {
                Value::Atomic(v) => {
                    check_atomic(elem, v);
                    v.put_ne(buf);
                }
                _ => panic!("this is a bug: packing a packet that is not flat"),
            }
        }
    }

    /// Unpacks a flat packet. The caller must pass exactly [PacketDesc::packet_size] bytes.
    pub fn unpack(desc: &PacketDesc, mut raw: &[u8]) -> Packet {
        let values = desc.elements.iter()
            .map(|elem| match elem.atomic_type() {
                Some(ty) => Value::Atomic(AtomicValue::get_ne(ty, &mut raw)),
                None => panic!("this is a bug: unpacking a packet that is not flat"),
            })
            .collect();
        Packet::new(values)
    }
}

impl PacketSeq {
    pub fn empty() -> PacketSeq {
        PacketSeq::Packets(Vec::new())
    }

    /// Packs the packets if the descriptor is flat
    pub fn from_packets(desc: &PacketDesc, packets: Vec<Packet>) -> PacketSeq {
        if !desc.is_flat() {
            return PacketSeq::Packets(packets);
        }
        let mut buf = BytesMut::with_capacity(desc.packet_size() * packets.len());
        for p in &packets {
            p.pack_into(desc, &mut buf);
        }
        PacketSeq::Raw(buf.freeze())
    }

    /// Wraps packed data, checking that it holds a whole number of packets
    pub fn from_raw(desc: &PacketDesc, raw: Bytes) -> anyhow::Result<PacketSeq> {
        if !desc.is_flat() {
            bail!("packed storage requires a flat packet descriptor");
        }
        if raw.len() % desc.packet_size() != 0 {
            bail!("{} bytes are not a multiple of the packet size {}", raw.len(), desc.packet_size());
        }
        Ok(PacketSeq::Raw(raw))
    }

    pub fn len(&self, desc: &PacketDesc) -> usize {
        match self {
            PacketSeq::Raw(raw) => match desc.packet_size() {
                0 => 0,
                size => raw.len() / size,
            },
            PacketSeq::Packets(packets) => packets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PacketSeq::Raw(raw) => raw.is_empty(),
            PacketSeq::Packets(packets) => packets.is_empty(),
        }
    }

    pub fn get(&self, desc: &PacketDesc, index: usize) -> Option<Packet> {
        match self {
            PacketSeq::Raw(raw) => {
                let size = desc.packet_size();
                let start = index.checked_mul(size)?;
                let chunk = raw.get(start..start.checked_add(size)?)?;
                Some(Packet::unpack(desc, chunk))
            }
            PacketSeq::Packets(packets) => packets.get(index).cloned(),
        }
    }

    pub fn to_packets(&self, desc: &PacketDesc) -> Vec<Packet> {
        match self {
            PacketSeq::Raw(_) if desc.packet_size() == 0 => Vec::new(),
            PacketSeq::Raw(raw) => raw
                .chunks_exact(desc.packet_size())
                .map(|chunk| Packet::unpack(desc, chunk))
                .collect(),
            PacketSeq::Packets(packets) => packets.clone(),
        }
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            PacketSeq::Raw(raw) => Some(raw),
            PacketSeq::Packets(_) => None,
        }
    }
}

impl ArrayData {
    pub fn from_packets(desc: &PacketDesc, packets: Vec<Packet>) -> ArrayData {
        ArrayData { packets: PacketSeq::from_packets(desc, packets) }
    }
}

impl ListData {
    pub fn new(desc: &PacketDesc, contiguous: Vec<Packet>) -> ListData {
        ListData {
            contiguous: PacketSeq::from_packets(desc, contiguous),
            fragments: Vec::new(),
        }
    }

    pub fn push(&mut self, packet: Packet) {
        self.fragments.push(packet);
    }

    pub fn len(&self, desc: &PacketDesc) -> usize {
        self.contiguous.len(desc) + self.fragments.len()
    }
}

/// One named tree in a [MultiArray]
#[derive(Debug, Clone, PartialEq)]
pub struct MultiArrayEntry {
    pub name: Option<String>,
    pub header: PacketDesc,
    pub data: Packet,
}

/// The top level container: one or more trees plus free-form history lines. Trees must be
///  named if there is more than one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiArray {
    pub entries: Vec<MultiArrayEntry>,
    pub history: Vec<String>,
}

impl MultiArray {
    pub fn single(header: PacketDesc, data: Packet) -> MultiArray {
        MultiArray {
            entries: vec![MultiArrayEntry { name: None, header, data }],
            history: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, name: impl Into<String>, header: PacketDesc, data: Packet) {
        self.entries.push(MultiArrayEntry { name: Some(name.into()), header, data });
    }

    pub fn find(&self, name: &str) -> Option<&MultiArrayEntry> {
        self.entries.iter().find(|e| e.name.as_deref() == Some(name))
    }

    /// An empty line terminates the history on the wire, so it can not be part of it
    pub fn add_history(&mut self, line: impl Into<String>) -> anyhow::Result<()> {
        let line = line.into();
        if line.is_empty() {
            bail!("history lines must not be empty");
        }
        self.history.push(line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AtomicType, Scalar, ScalarValue};

    fn pair_desc() -> PacketDesc {
        PacketDesc::new(vec![
            ElementDesc::atomic("a", AtomicType::real(Scalar::U16)),
            ElementDesc::atomic("b", AtomicType::real(Scalar::F64)),
        ])
    }

    fn pair(a: u16, b: f64) -> Packet {
        Packet::new(vec![
            Value::Atomic(AtomicValue::Real(ScalarValue::U16(a))),
            Value::Atomic(AtomicValue::Real(ScalarValue::F64(b))),
        ])
    }

    #[test]
    fn test_flat_packets_are_packed() {
        let desc = pair_desc();
        let seq = PacketSeq::from_packets(&desc, vec![pair(1, 1.5), pair(2, 2.5)]);
        assert_eq!(seq.as_raw().unwrap().len(), 20);
        assert_eq!(seq.len(&desc), 2);
        assert_eq!(seq.get(&desc, 1), Some(pair(2, 2.5)));
        assert_eq!(seq.get(&desc, 2), None);
        assert_eq!(seq.to_packets(&desc), vec![pair(1, 1.5), pair(2, 2.5)]);
    }

    #[test]
    fn test_non_flat_packets_are_kept() {
        let desc = PacketDesc::new(vec![ElementDesc::VString { name: "s".to_string() }]);
        let packets = vec![Packet::new(vec![Value::VString("x".to_string())])];
        let seq = PacketSeq::from_packets(&desc, packets.clone());
        assert_eq!(seq, PacketSeq::Packets(packets));
    }

    #[test]
    fn test_from_raw_checks_length() {
        let desc = pair_desc();
        assert!(PacketSeq::from_raw(&desc, Bytes::from(vec![0; 20])).is_ok());
        assert!(PacketSeq::from_raw(&desc, Bytes::from(vec![0; 21])).is_err());
    }

    #[test]
    #[should_panic(expected = "this is a bug")]
    fn test_pack_mismatched_value() {
        let desc = pair_desc();
        let wrong = Packet::new(vec![
            Value::Atomic(AtomicValue::Real(ScalarValue::I16(1))),
            Value::Atomic(AtomicValue::Real(ScalarValue::F64(1.0))),
        ]);
        PacketSeq::from_packets(&desc, vec![wrong]);
    }

    #[test]
    fn test_list_len() {
        let desc = pair_desc();
        let mut list = ListData::new(&desc, vec![pair(1, 1.0)]);
        list.push(pair(2, 2.0));
        assert_eq!(list.len(&desc), 2);
    }

    #[test]
    fn test_history() {
        let mut multi = MultiArray::single(pair_desc(), pair(1, 1.0));
        assert!(multi.add_history("created").is_ok());
        assert!(multi.add_history("").is_err());
        assert_eq!(multi.history, vec!["created".to_string()]);
    }
}
