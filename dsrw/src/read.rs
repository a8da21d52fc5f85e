use std::cmp::min;
use anyhow::{anyhow, bail};
use bytes::BytesMut;
use tracing::{debug, trace};
use transport::channel::Channel;
use transport::safe_converter::{checked_len, SafeCast};
use crate::BoxFuture;
use crate::data::{ArrayData, FixedString, ListData, MultiArray, MultiArrayEntry, Packet, PacketSeq, Value};
use crate::desc::{bottom_length, ArrayDesc, DimDesc, ElementDesc, PacketDesc};
use crate::format::{swap_bytes, Padding, ALIGNMENT, FLAG_FALSE, FLAG_TRUE, MAGIC, VERSION};
use crate::types::{AtomicType, AtomicValue, TypeCode};

/// Pre-allocation is capped since counts come from the peer
const MAX_PREALLOC: usize = 4096;

/// Reads data structures from a channel.
///
/// Malformed or truncated input is an error. A failed read never returns a partially built
///  tree, but the channel's position is undefined afterwards.
pub struct DsReader<'c> {
    channel: &'c mut Channel,
    padding: Padding,
}

impl<'c> DsReader<'c> {
    pub fn new(channel: &'c mut Channel, padding: Padding) -> DsReader<'c> {
        DsReader { channel, padding }
    }

    pub fn channel(&mut self) -> &mut Channel {
        self.channel
    }

    #[tracing::instrument(skip_all)]
    pub async fn read_multi(&mut self) -> anyhow::Result<MultiArray> {
        let mut magic = [0u8; 16];
        self.channel.read_exact(&mut magic).await?;
        if &magic != MAGIC {
            bail!("bad magic number {:?}", String::from_utf8_lossy(&magic));
        }
        let version = self.channel.read_u32().await?;
        if version != VERSION {
            bail!("unsupported data structure version {}, expected {}", version, VERSION);
        }

        let count = self.channel.read_u32().await?;
        if count == 0 {
            bail!("multi array without arrays");
        }

        let mut entries = Vec::with_capacity(min(count.safe_cast(), MAX_PREALLOC));
        for _ in 0..count {
            let header = self.read_packet_desc().await?;
            let data = self.read_packet(&header).await?;
            entries.push(MultiArrayEntry { name: None, header, data });
        }

        if count > 1 {
            for entry in &mut entries {
                let name = self.read_string().await?;
                if name.is_empty() {
                    bail!("empty array name in multi array");
                }
                entry.name = Some(name);
            }
        }

        let mut history = Vec::new();
        loop {
            let line = self.read_string().await?;
            if line.is_empty() {
                break;
            }
            history.push(line);
        }

        debug!("read multi array with {} array(s), {} history line(s)", entries.len(), history.len());
        Ok(MultiArray { entries, history })
    }

    pub fn read_packet_desc<'a>(&'a mut self) -> BoxFuture<'a, anyhow::Result<PacketDesc>> {
        Box::pin(async move {
            let count = self.channel.read_u32().await?;
            if count == 0 {
                bail!("packet descriptor without elements");
            }

            let mut elements = Vec::with_capacity(min(count.safe_cast(), MAX_PREALLOC));
            for _ in 0..count {
                elements.push(self.read_element_desc().await?);
            }
            Ok(PacketDesc::new(elements))
        })
    }

    pub async fn read_type(&mut self) -> anyhow::Result<TypeCode> {
        let raw = self.channel.read_u32().await?;
        TypeCode::try_from(raw)
            .map_err(|_| anyhow!("unknown type code {}", raw))
    }

    pub async fn read_element_desc(&mut self) -> anyhow::Result<ElementDesc> {
        let code = self.read_type().await?;
        if let Some(ty) = AtomicType::from_type_code(code) {
            let name = self.read_name().await?;
            return Ok(ElementDesc::Atomic { ty, name });
        }

        match code {
            TypeCode::VString => Ok(ElementDesc::VString { name: self.read_name().await? }),
            TypeCode::FString => Ok(ElementDesc::FString { name: self.read_name().await? }),
            TypeCode::Array => Ok(ElementDesc::Array(Box::new(self.read_array_desc().await?))),
            TypeCode::List => Ok(ElementDesc::List(Box::new(self.read_packet_desc().await?))),
            other => bail!("type code {:?} is not legal in an element descriptor", other),
        }
    }

    async fn read_name(&mut self) -> anyhow::Result<String> {
        let name = self.read_string().await?;
        if name.is_empty() {
            bail!("empty element name");
        }
        Ok(name)
    }

    pub async fn read_array_desc(&mut self) -> anyhow::Result<ArrayDesc> {
        let num_dims = self.channel.read_u32().await?;
        if num_dims == 0 {
            bail!("array without dimensions");
        }
        let num_levels = self.channel.read_u32().await?;

        let mut dimensions = Vec::with_capacity(min(num_dims.safe_cast(), MAX_PREALLOC));
        for _ in 0..num_dims {
            dimensions.push(self.read_dim_desc().await?);
        }

        let mut tile_lengths = Vec::with_capacity(dimensions.len());
        let mut lengths = Vec::with_capacity(dimensions.len());
        for dim in &dimensions {
            let mut tiles = Vec::with_capacity(min(num_levels.safe_cast(), MAX_PREALLOC));
            for _ in 0..num_levels {
                tiles.push(self.channel.read_u64().await?);
            }
            lengths.push(bottom_length(dim, &tiles)?);
            tile_lengths.push(tiles);
        }

        let packet = self.read_packet_desc().await?;
        let desc = ArrayDesc { dimensions, tile_lengths, lengths, packet };
        desc.array_size()?;
        Ok(desc)
    }

    pub async fn read_dim_desc(&mut self) -> anyhow::Result<DimDesc> {
        let name = self.read_string().await?;
        if name.is_empty() {
            bail!("empty dimension name");
        }
        let length = self.channel.read_u64().await?;
        if length == 0 {
            bail!("dimension {:?} has length 0", name);
        }

        if self.read_flag().await? {
            let first = self.channel.read_f64().await?;
            let last = self.channel.read_f64().await?;
            return Ok(DimDesc::regular(name, length, first, last));
        }

        let mut coordinates = Vec::with_capacity(min(checked_len(length)?, MAX_PREALLOC));
        for _ in 0..length {
            coordinates.push(self.channel.read_f64().await?);
        }
        DimDesc::explicit(name, coordinates)
    }

    pub async fn read_flag(&mut self) -> anyhow::Result<bool> {
        match self.channel.read_u8().await? {
            FLAG_TRUE => Ok(true),
            FLAG_FALSE => Ok(false),
            other => bail!("invalid flag value {:#04x}", other),
        }
    }

    pub async fn read_string(&mut self) -> anyhow::Result<String> {
        let len = self.channel.read_u32().await?;
        let raw = self.channel.read_bytes(len.safe_cast()).await?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    pub fn read_packet<'a>(&'a mut self, desc: &'a PacketDesc) -> BoxFuture<'a, anyhow::Result<Packet>> {
        Box::pin(async move {
            let mut values = Vec::with_capacity(desc.elements.len());
            for elem in &desc.elements {
                values.push(self.read_element(elem).await?);
            }
            Ok(Packet::new(values))
        })
    }

    pub async fn read_element(&mut self, elem: &ElementDesc) -> anyhow::Result<Value> {
        let value = match elem {
            ElementDesc::Atomic { ty, .. } => Value::Atomic(self.read_atomic(*ty).await?),
            ElementDesc::VString { .. } => Value::VString(self.read_string().await?),
            ElementDesc::FString { .. } => Value::FString(self.read_fixed_string().await?),
            ElementDesc::Array(array) => Value::Array(self.read_array(array).await?),
            ElementDesc::List(packet) => Value::List(self.read_list(packet).await?),
        };
        Ok(value)
    }

    async fn read_atomic(&mut self, ty: AtomicType) -> anyhow::Result<AtomicValue> {
        let mut scratch = [0u8; 16];
        let buf = &mut scratch[..ty.size()];
        self.channel.read_exact(buf).await?;
        let mut b: &[u8] = buf;
        Ok(AtomicValue::get_be(ty, &mut b))
    }

    async fn read_fixed_string(&mut self) -> anyhow::Result<FixedString> {
        let max_len = self.channel.read_u32().await?;
        let raw = self.channel.read_bytes(max_len.safe_cast()).await?;
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let value = String::from_utf8(raw[..len].to_vec())?;
        Ok(FixedString { max_len, value })
    }

    pub async fn read_array(&mut self, desc: &ArrayDesc) -> anyhow::Result<ArrayData> {
        if self.padding == Padding::Aligned {
            let pad = self.channel.read_u32().await?;
            if pad as u64 >= ALIGNMENT {
                bail!("invalid array padding {}", pad);
            }
            self.channel.skip(pad.safe_cast()).await?;
        }
        let packets = self.read_packets(&desc.packet, desc.array_size()?).await?;
        Ok(ArrayData { packets })
    }

    pub async fn read_list(&mut self, desc: &PacketDesc) -> anyhow::Result<ListData> {
        let count = self.channel.read_u64().await?;
        let contiguous = self.read_packets(desc, count).await?;
        Ok(ListData { contiguous, fragments: Vec::new() })
    }

    /// Reads `count` packets, mirroring the paths of [crate::write::DsWriter::write_packets].
    ///  For a memory mapped channel, block transferred data is not copied but refers to the
    ///  mapping.
    pub async fn read_packets(&mut self, desc: &PacketDesc, count: u64) -> anyhow::Result<PacketSeq> {
        if !desc.is_flat() {
            let mut packets = Vec::with_capacity(min(checked_len(count)?, MAX_PREALLOC));
            for _ in 0..count {
                packets.push(self.read_packet(desc).await?);
            }
            return Ok(PacketSeq::Packets(packets));
        }

        let len = checked_len(count)?
            .checked_mul(desc.packet_size())
            .ok_or_else(|| anyhow!("{} packets of {} bytes exceed the address space", count, desc.packet_size()))?;

        if desc.can_transfer_as_block() {
            trace!("block transfer of {} bytes", len);
            return Ok(PacketSeq::Raw(self.channel.read_bytes(len).await?));
        }

        if let Some(ty) = desc.single_atomic_element() {
            trace!("swapped block transfer of {} bytes", len);
            let wire = self.channel.read_bytes(len).await?;
            return Ok(PacketSeq::Raw(swap_bytes(&wire, ty.scalar.size())));
        }

        let mut raw = BytesMut::with_capacity(min(len, MAX_PREALLOC * desc.packet_size()));
        for _ in 0..count {
            let packet = self.read_packet(desc).await?;
            packet.pack_into(desc, &mut raw);
        }
        Ok(PacketSeq::Raw(raw.freeze()))
    }
}
