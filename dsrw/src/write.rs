use tracing::{debug, trace};
use transport::channel::Channel;
use transport::error::Fatal;
use transport::safe_converter::{PrecheckedCast, SafeCast};
use crate::BoxFuture;
use crate::data::{check_atomic, ArrayData, FixedString, ListData, MultiArray, Packet, PacketSeq, Value};
use crate::desc::{ArrayDesc, DimDesc, ElementDesc, PacketDesc};
use crate::format::{pad_length, swap_bytes, Padding, FLAG_FALSE, FLAG_TRUE, MAGIC, VERSION};
use crate::types::AtomicValue;

/// Writes data structures to a channel.
///
/// A failed write leaves the stream in a state the reader can not recover from, so every
///  write error is reported as [Fatal]. Writing a tree whose data does not match its
///  descriptors is a bug in the calling code and panics.
pub struct DsWriter<'c> {
    channel: &'c mut Channel,
    padding: Padding,
}

impl<'c> DsWriter<'c> {
    pub fn new(channel: &'c mut Channel, padding: Padding) -> DsWriter<'c> {
        DsWriter { channel, padding }
    }

    pub fn channel(&mut self) -> &mut Channel {
        self.channel
    }

    #[tracing::instrument(skip_all)]
    pub async fn write_multi(&mut self, multi: &MultiArray) -> anyhow::Result<()> {
        assert!(!multi.entries.is_empty(), "this is a bug: a multi array needs at least one array");

        self.put_bytes(MAGIC, "magic number").await?;
        self.put_u32(VERSION, "version").await?;
        self.put_u32(multi.entries.len().prechecked_cast(), "array count").await?;

        for entry in &multi.entries {
            self.write_packet_desc(&entry.header).await?;
            self.write_packet(&entry.header, &entry.data).await?;
        }

        if multi.entries.len() > 1 {
            for entry in &multi.entries {
                match entry.name.as_deref() {
                    Some(name) if !name.is_empty() => self.write_string(name).await?,
                    _ => panic!("this is a bug: all arrays of a multi array with more than one array must be named"),
                }
            }
        }

        for line in &multi.history {
            assert!(!line.is_empty(), "this is a bug: empty history line");
            self.write_string(line).await?;
        }
        self.write_string("").await?;

        debug!("wrote multi array with {} array(s), {} history line(s)", multi.entries.len(), multi.history.len());
        Ok(())
    }

    pub fn write_packet_desc<'a>(&'a mut self, desc: &'a PacketDesc) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            assert!(!desc.elements.is_empty(), "this is a bug: packet descriptor without elements");

            self.put_u32(desc.elements.len().prechecked_cast(), "element count").await?;
            for elem in &desc.elements {
                self.write_element_desc(elem).await?;
            }
            Ok(())
        })
    }

    pub async fn write_element_desc(&mut self, elem: &ElementDesc) -> anyhow::Result<()> {
        self.put_u32(elem.type_code().into(), "type code").await?;
        match elem {
            ElementDesc::Atomic { name, .. }
            | ElementDesc::VString { name }
            | ElementDesc::FString { name } => {
                assert!(!name.is_empty(), "this is a bug: element names must not be empty");
                self.write_string(name).await
            }
            ElementDesc::Array(array) => self.write_array_desc(array).await,
            ElementDesc::List(packet) => self.write_packet_desc(packet).await,
        }
    }

    pub async fn write_array_desc(&mut self, desc: &ArrayDesc) -> anyhow::Result<()> {
        assert!(!desc.dimensions.is_empty(), "this is a bug: array without dimensions");
        check_tiling(desc);

        self.put_u32(desc.dimensions.len().prechecked_cast(), "dimension count").await?;
        self.put_u32(desc.num_levels().prechecked_cast(), "tiling level count").await?;
        for dim in &desc.dimensions {
            self.write_dim_desc(dim).await?;
        }
        for tiles in &desc.tile_lengths {
            for &tile in tiles {
                self.put_u64(tile, "tile length").await?;
            }
        }
        self.write_packet_desc(&desc.packet).await
    }

    pub async fn write_dim_desc(&mut self, dim: &DimDesc) -> anyhow::Result<()> {
        assert!(!dim.name.is_empty(), "this is a bug: dimension names must not be empty");
        assert!(dim.length > 0, "this is a bug: dimension {:?} has length 0", dim.name);

        self.write_string(&dim.name).await?;
        self.put_u64(dim.length, "dimension length").await?;
        match &dim.coordinates {
            None => {
                self.write_flag(true).await?;
                self.put_f64(dim.first_coord, "first coordinate").await?;
                self.put_f64(dim.last_coord, "last coordinate").await?;
            }
            Some(coordinates) => {
                let num_coordinates: u64 = coordinates.len().safe_cast();
                assert_eq!(num_coordinates, dim.length, "this is a bug: coordinates of dimension {:?} do not match its length", dim.name);

                self.write_flag(false).await?;
                for &c in coordinates {
                    self.put_f64(c, "coordinate").await?;
                }
            }
        }
        Ok(())
    }

    pub async fn write_flag(&mut self, flag: bool) -> anyhow::Result<()> {
        let value = if flag { FLAG_TRUE } else { FLAG_FALSE };
        self.channel.write_u8(value).await
            .map_err(|e| Fatal::short_write("flag", e))
    }

    pub async fn write_string(&mut self, s: &str) -> anyhow::Result<()> {
        self.put_u32(s.len().prechecked_cast(), "string length").await?;
        self.put_bytes(s.as_bytes(), "string").await
    }

    pub fn write_packet<'a>(&'a mut self, desc: &'a PacketDesc, packet: &'a Packet) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            assert_eq!(packet.values.len(), desc.elements.len(), "this is a bug: packet does not match its descriptor");

            for (elem, value) in desc.elements.iter().zip(&packet.values) {
                self.write_element(elem, value).await?;
            }
            Ok(())
        })
    }

    pub async fn write_element(&mut self, elem: &ElementDesc, value: &Value) -> anyhow::Result<()> {
        match (elem, value) {
            (ElementDesc::Atomic { .. }, Value::Atomic(v)) => {
                check_atomic(elem, v);
                self.write_atomic(v).await
            }
            (ElementDesc::VString { .. }, Value::VString(s)) => self.write_string(s).await,
            (ElementDesc::FString { .. }, Value::FString(s)) => self.write_fixed_string(s).await,
            (ElementDesc::Array(array), Value::Array(data)) => self.write_array(array, data).await,
            (ElementDesc::List(packet), Value::List(list)) => self.write_list(packet, list).await,
            _ => panic!("this is a bug: value does not match element descriptor of type {:?}", elem.type_code()),
        }
    }

    async fn write_atomic(&mut self, value: &AtomicValue) -> anyhow::Result<()> {
        let mut scratch = [0u8; 16];
        let len = {
            let mut buf = &mut scratch[..];
            value.put_be(&mut buf);
            16 - buf.len()
        };
        self.put_bytes(&scratch[..len], "atomic value").await
    }

    async fn write_fixed_string(&mut self, s: &FixedString) -> anyhow::Result<()> {
        let len: u64 = s.value.len().safe_cast();
        assert!(len <= s.max_len as u64, "this is a bug: fixed string is longer than its maximum length {}", s.max_len);

        self.put_u32(s.max_len, "fixed string length").await?;
        self.put_bytes(s.value.as_bytes(), "fixed string").await?;
        self.put_zeros(s.max_len as usize - s.value.len(), "fixed string").await
    }

    pub async fn write_array(&mut self, desc: &ArrayDesc, data: &ArrayData) -> anyhow::Result<()> {
        let count: u64 = data.packets.len(&desc.packet).safe_cast();
        assert_eq!(Some(count), desc.array_size().ok(), "this is a bug: array data does not match the array's size");

        if self.padding == Padding::Aligned {
            // array data starts after the pad length field and the padding itself
            let pad = pad_length(self.channel.write_position() + 4);
            self.put_u32(pad, "array padding").await?;
            self.put_zeros(pad as usize, "array padding").await?;
        }
        self.write_packets(&desc.packet, &data.packets).await
    }

    pub async fn write_list(&mut self, desc: &PacketDesc, list: &ListData) -> anyhow::Result<()> {
        self.put_u64(list.len(desc).safe_cast(), "list length").await?;
        self.write_packets(desc, &list.contiguous).await?;
        for packet in &list.fragments {
            self.write_packet(desc, packet).await?;
        }
        Ok(())
    }

    /// Writes a sequence of packets, taking the cheapest path the data allows: a single copy if
    ///  the packed representation is the wire representation, a single byte swapping pass for
    ///  packets with a single numeric element, and packet by packet otherwise.
    pub async fn write_packets(&mut self, desc: &PacketDesc, packets: &PacketSeq) -> anyhow::Result<()> {
        let raw = match packets {
            PacketSeq::Packets(packets) => {
                for packet in packets {
                    self.write_packet(desc, packet).await?;
                }
                return Ok(());
            }
            PacketSeq::Raw(raw) => raw,
        };

        assert!(desc.is_flat() && raw.len() % desc.packet_size() == 0,
            "this is a bug: packed data does not match its packet descriptor");

        if desc.can_transfer_as_block() {
            trace!("block transfer of {} bytes", raw.len());
            return self.put_bytes(raw, "packet block").await;
        }

        if let Some(ty) = desc.single_atomic_element() {
            // the parts of a complex value are swapped individually
            trace!("swapped block transfer of {} bytes", raw.len());
            let swapped = swap_bytes(raw, ty.scalar.size());
            return self.put_bytes(&swapped, "packet block").await;
        }

        for chunk in raw.chunks_exact(desc.packet_size()) {
            let packet = Packet::unpack(desc, chunk);
            self.write_packet(desc, &packet).await?;
        }
        Ok(())
    }

    async fn put_u32(&mut self, value: u32, what: &'static str) -> anyhow::Result<()> {
        self.channel.write_u32(value).await
            .map_err(|e| Fatal::short_write(what, e))
    }

    async fn put_u64(&mut self, value: u64, what: &'static str) -> anyhow::Result<()> {
        self.channel.write_u64(value).await
            .map_err(|e| Fatal::short_write(what, e))
    }

    async fn put_f64(&mut self, value: f64, what: &'static str) -> anyhow::Result<()> {
        self.channel.write_f64(value).await
            .map_err(|e| Fatal::short_write(what, e))
    }

    async fn put_bytes(&mut self, data: &[u8], what: &'static str) -> anyhow::Result<()> {
        self.channel.write_all(data).await
            .map_err(|e| Fatal::short_write(what, e))
    }

    async fn put_zeros(&mut self, len: usize, what: &'static str) -> anyhow::Result<()> {
        self.channel.write_zeros(len).await
            .map_err(|e| Fatal::short_write(what, e))
    }
}

fn check_tiling(desc: &ArrayDesc) {
    assert_eq!(desc.tile_lengths.len(), desc.dimensions.len(), "this is a bug: tile lengths do not match the array's dimensions");
    assert_eq!(desc.lengths.len(), desc.dimensions.len(), "this is a bug: bottom lengths do not match the array's dimensions");

    let num_levels = desc.num_levels();
    for ((dim, tiles), &bottom) in desc.dimensions.iter().zip(&desc.tile_lengths).zip(&desc.lengths) {
        assert_eq!(tiles.len(), num_levels, "this is a bug: dimension {:?} has a different number of tiling levels", dim.name);

        let total = tiles.iter()
            .try_fold(bottom, |acc, &t| acc.checked_mul(t));
        assert_eq!(total, Some(dim.length), "this is a bug: tiling of dimension {:?} does not match its length", dim.name);
    }
    if let Err(e) = desc.array_size() {
        panic!("this is a bug: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};
    use crate::types::{AtomicType, Scalar, ScalarValue};

    async fn write(multi: &MultiArray, padding: Padding) -> Bytes {
        let mut channel = Channel::memory_sink();
        DsWriter::new(&mut channel, padding).write_multi(multi).await.unwrap();
        channel.into_bytes()
    }

    fn header_bytes(count: u32) -> Vec<u8> {
        let mut expected = Vec::new();
        expected.put_slice(MAGIC);
        expected.put_u32(VERSION);
        expected.put_u32(count);
        expected
    }

    #[tokio::test]
    async fn test_write_single_int() {
        let multi = MultiArray::single(
            PacketDesc::single("v", AtomicType::real(Scalar::I32)),
            Packet::atomic(AtomicValue::Real(ScalarValue::I32(7))),
        );

        let mut expected = header_bytes(1);
        expected.put_u32(1); // element count
        expected.put_u32(4); // INT
        expected.put_u32(1);
        expected.put_slice(b"v");
        expected.put_i32(7);
        expected.put_u32(0); // end of history

        assert_eq!(write(&multi, Padding::None).await.as_ref(), expected.as_slice());
    }

    fn byte_array(values: &[u8]) -> MultiArray {
        let packet = PacketDesc::single("v", AtomicType::real(Scalar::U8));
        let array = ArrayDesc::new(vec![DimDesc::regular("x", values.len() as u64, 0.0, 1.0)], packet.clone());
        let packets = values.iter()
            .map(|&v| Packet::atomic(AtomicValue::Real(ScalarValue::U8(v))))
            .collect();
        let data = ArrayData::from_packets(&packet, packets);
        MultiArray::single(
            PacketDesc::new(vec![ElementDesc::Array(Box::new(array))]),
            Packet::new(vec![Value::Array(data)]),
        )
    }

    #[tokio::test]
    async fn test_array_padding_is_aligned_and_zero() {
        let bytes = write(&byte_array(&[1, 2, 3]), Padding::Aligned).await;

        // magic, version, count, desc: 24 + 4 + 4 + 4 + 4 + (4+1) + 8 + 1 + 8 + 8 + 4 + 4 + (4+1)
        assert_eq!(&bytes[83..87], &9u32.to_be_bytes());
        assert!(bytes[87..96].iter().all(|&b| b == 0));
        assert_eq!(&bytes[96..99], &[1, 2, 3]);
        assert_eq!(&bytes[99..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_array_without_padding() {
        let bytes = write(&byte_array(&[1, 2, 3]), Padding::None).await;
        assert_eq!(&bytes[83..86], &[1, 2, 3]);
        assert_eq!(bytes.len(), 90);
    }

    #[tokio::test]
    async fn test_swap_path_matches_per_packet_path() {
        let desc = PacketDesc::single("v", AtomicType::real(Scalar::I32));
        let packets: Vec<Packet> = (0..100)
            .map(|i| Packet::atomic(AtomicValue::Real(ScalarValue::I32(i * 1000 - 7))))
            .collect();

        let mut packed = Channel::memory_sink();
        DsWriter::new(&mut packed, Padding::None)
            .write_packets(&desc, &PacketSeq::from_packets(&desc, packets.clone())).await.unwrap();

        let mut individual = Channel::memory_sink();
        DsWriter::new(&mut individual, Padding::None)
            .write_packets(&desc, &PacketSeq::Packets(packets)).await.unwrap();

        assert_eq!(packed.into_bytes(), individual.into_bytes());
    }

    #[tokio::test]
    async fn test_complex_swap_path_matches_per_packet_path() {
        let desc = PacketDesc::single("v", AtomicType::complex(Scalar::F32));
        let packets: Vec<Packet> = (0..10)
            .map(|i| Packet::atomic(AtomicValue::Complex(ScalarValue::F32(i as f32), ScalarValue::F32(-0.5 * i as f32))))
            .collect();

        let mut packed = Channel::memory_sink();
        DsWriter::new(&mut packed, Padding::None)
            .write_packets(&desc, &PacketSeq::from_packets(&desc, packets.clone())).await.unwrap();

        let mut individual = Channel::memory_sink();
        DsWriter::new(&mut individual, Padding::None)
            .write_packets(&desc, &PacketSeq::Packets(packets)).await.unwrap();

        let bytes = packed.into_bytes();
        assert_eq!(bytes, individual.into_bytes());
        assert_eq!(&bytes[8..12], &1.0f32.to_be_bytes());
        assert_eq!(&bytes[12..16], &(-0.5f32).to_be_bytes());
    }

    #[tokio::test]
    async fn test_write_flag() {
        let mut channel = Channel::memory_sink();
        let mut writer = DsWriter::new(&mut channel, Padding::None);
        writer.write_flag(true).await.unwrap();
        writer.write_flag(false).await.unwrap();
        assert_eq!(channel.into_bytes().as_ref(), b"TF");
    }

    #[tokio::test]
    async fn test_write_fixed_string() {
        let desc = PacketDesc::new(vec![ElementDesc::FString { name: "f".to_string() }]);
        let packet = Packet::new(vec![Value::FString(FixedString { max_len: 6, value: "ab".to_string() })]);

        let mut channel = Channel::memory_sink();
        DsWriter::new(&mut channel, Padding::None).write_packet(&desc, &packet).await.unwrap();
        assert_eq!(channel.into_bytes().as_ref(), &[0, 0, 0, 6, b'a', b'b', 0, 0, 0, 0]);
    }

    #[tokio::test]
    #[should_panic(expected = "this is a bug")]
    async fn test_unnamed_arrays_panic() {
        let mut multi = byte_array(&[1]);
        multi.entries.push(multi.entries[0].clone());
        write(&multi, Padding::None).await;
    }

    #[tokio::test]
    #[should_panic(expected = "this is a bug")]
    async fn test_mismatched_value_panics() {
        let multi = MultiArray::single(
            PacketDesc::single("v", AtomicType::real(Scalar::I32)),
            Packet::new(vec![Value::VString("x".to_string())]),
        );
        write(&multi, Padding::None).await;
    }

    #[tokio::test]
    #[should_panic(expected = "this is a bug")]
    async fn test_bad_tiling_panics() {
        let packet = PacketDesc::single("v", AtomicType::real(Scalar::U8));
        let mut array = ArrayDesc::new(vec![DimDesc::regular("x", 4, 0.0, 3.0)], packet);
        array.tile_lengths = vec![vec![3]];

        let mut channel = Channel::memory_sink();
        DsWriter::new(&mut channel, Padding::None).write_array_desc(&array).await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "this is a bug")]
    async fn test_overflowing_array_size_panics() {
        let packet = PacketDesc::single("v", AtomicType::real(Scalar::U8));
        let array = ArrayDesc::new(vec![
            DimDesc::regular("y", 1 << 32, 0.0, 1.0),
            DimDesc::regular("x", 1 << 32, 0.0, 1.0),
        ], packet);

        let mut channel = Channel::memory_sink();
        DsWriter::new(&mut channel, Padding::None).write_array_desc(&array).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_is_fatal() {
        let mut channel = Channel::from_bytes(Bytes::from_static(b"read only"));
        let mut writer = DsWriter::new(&mut channel, Padding::None);
        writer.write_string("abc").await.unwrap();
        let e = writer.channel().flush().await.unwrap_err();
        assert!(!transport::error::is_fatal(&e));

        // the writer's own flush path: a full buffer is flushed from inside the codec
        let mut channel = Channel::from_bytes(Bytes::from_static(b"read only"));
        let mut writer = DsWriter::new(&mut channel, Padding::None);
        let e = writer.write_string(&"x".repeat(100_000)).await.unwrap_err();
        assert!(transport::error::is_fatal(&e));
    }
}
