use anyhow::bail;
use crate::types::{AtomicType, TypeCode};

/// The ordered list of typed elements that make up a packet
#[derive(Debug, Clone, PartialEq)]
pub struct PacketDesc {
    pub elements: Vec<ElementDesc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementDesc {
    Atomic { ty: AtomicType, name: String },
    VString { name: String },
    FString { name: String },
    Array(Box<ArrayDesc>),
    List(Box<PacketDesc>),
}

impl ElementDesc {
    pub fn atomic(name: impl Into<String>, ty: AtomicType) -> ElementDesc {
        ElementDesc::Atomic { ty, name: name.into() }
    }

    pub fn type_code(&self) -> TypeCode {
        match self {
            ElementDesc::Atomic { ty, .. } => ty.type_code(),
            ElementDesc::VString { .. } => TypeCode::VString,
            ElementDesc::FString { .. } => TypeCode::FString,
            ElementDesc::Array(_) => TypeCode::Array,
            ElementDesc::List(_) => TypeCode::List,
        }
    }

    /// Arrays and lists are anonymous
    pub fn name(&self) -> Option<&str> {
        match self {
            ElementDesc::Atomic { name, .. }
            | ElementDesc::VString { name }
            | ElementDesc::FString { name } => Some(name),
            ElementDesc::Array(_) | ElementDesc::List(_) => None,
        }
    }

    pub fn atomic_type(&self) -> Option<AtomicType> {
        match self {
            ElementDesc::Atomic { ty, .. } => Some(*ty),
            _ => None,
        }
    }
}

impl PacketDesc {
    pub fn new(elements: Vec<ElementDesc>) -> PacketDesc {
        PacketDesc { elements }
    }

    /// A packet with a single numeric element
    pub fn single(name: impl Into<String>, ty: AtomicType) -> PacketDesc {
        PacketDesc::new(vec![ElementDesc::atomic(name, ty)])
    }

    /// A packet is flat if it consists of atomic elements only. Flat packets have a packed
    ///  representation of [PacketDesc::packet_size] bytes.
    pub fn is_flat(&self) -> bool {
        !self.elements.is_empty()
            && self.elements.iter().all(|e| e.atomic_type().is_some())
    }

    /// The combined size of the packet's atomic elements, i.e. the size of the packed
    ///  representation for a flat packet
    pub fn packet_size(&self) -> usize {
        self.elements.iter()
            .filter_map(|e| e.atomic_type())
            .map(|ty| ty.size())
            .sum()
    }

    /// true if the packed in-memory representation is identical to the wire representation,
    ///  so that a sequence of packets can be transferred with a single copy
    pub fn can_transfer_as_block(&self) -> bool {
        self.is_flat() && cfg!(target_endian = "big")
    }

    pub fn single_atomic_element(&self) -> Option<AtomicType> {
        match self.elements.as_slice() {
            [e] => e.atomic_type(),
            _ => None,
        }
    }

    /// Offset of an element in the packed representation, `None` if the packet is not flat
    pub fn element_offset(&self, index: usize) -> Option<usize> {
        if !self.is_flat() || index >= self.elements.len() {
            return None;
        }
        Some(self.elements[..index].iter()
            .filter_map(|e| e.atomic_type())
            .map(|ty| ty.size())
            .sum())
    }

    pub fn find_element(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.name() == Some(name))
    }
}

/// A dimension of an array, with either a regular coordinate range or explicit coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct DimDesc {
    pub name: String,
    pub length: u64,
    pub first_coord: f64,
    pub last_coord: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub coordinates: Option<Vec<f64>>,
}

impl DimDesc {
    pub fn regular(name: impl Into<String>, length: u64, first_coord: f64, last_coord: f64) -> DimDesc {
        DimDesc {
            name: name.into(),
            length,
            first_coord,
            last_coord,
            minimum: first_coord.min(last_coord),
            maximum: first_coord.max(last_coord),
            coordinates: None,
        }
    }

    /// NB: Coordinates must be increasing, so minimum and maximum are taken from the first and
    ///      last values
    pub fn explicit(name: impl Into<String>, coordinates: Vec<f64>) -> anyhow::Result<DimDesc> {
        let (first, last) = match (coordinates.first(), coordinates.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => bail!("a dimension needs at least one coordinate"),
        };
        Ok(DimDesc {
            name: name.into(),
            length: coordinates.len() as u64,
            first_coord: first,
            last_coord: last,
            minimum: first,
            maximum: last,
            coordinates: Some(coordinates),
        })
    }

    pub fn is_regular(&self) -> bool {
        self.coordinates.is_none()
    }

    pub fn coordinate(&self, index: u64) -> Option<f64> {
        if index >= self.length {
            return None;
        }
        match &self.coordinates {
            Some(coords) => coords.get(index as usize).copied(),
            None if self.length == 1 => Some(self.first_coord),
            None => {
                let step = (self.last_coord - self.first_coord) / (self.length - 1) as f64;
                Some(self.first_coord + step * index as f64)
            }
        }
    }
}

/// An N-dimensional array of packets.
///
/// A tiled array is split into blocks along each dimension, possibly in several levels.
///  `tile_lengths[dim][level]` is the tile length of a dimension at a level, and `lengths[dim]`
///  is the remaining length at the bottom level, so that for each dimension the product of
///  its tile lengths and its bottom length is the dimension's length.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDesc {
    pub dimensions: Vec<DimDesc>,
    pub tile_lengths: Vec<Vec<u64>>,
    pub lengths: Vec<u64>,
    pub packet: PacketDesc,
}

impl ArrayDesc {
    pub fn new(dimensions: Vec<DimDesc>, packet: PacketDesc) -> ArrayDesc {
        let lengths = dimensions.iter().map(|d| d.length).collect();
        let tile_lengths = vec![Vec::new(); dimensions.len()];
        ArrayDesc { dimensions, tile_lengths, lengths, packet }
    }

    pub fn tiled(dimensions: Vec<DimDesc>, tile_lengths: Vec<Vec<u64>>, packet: PacketDesc) -> anyhow::Result<ArrayDesc> {
        if tile_lengths.len() != dimensions.len() {
            bail!("expected tile lengths for {} dimensions, got {}", dimensions.len(), tile_lengths.len());
        }
        let num_levels = tile_lengths.first().map(|t| t.len()).unwrap_or(0);
        if tile_lengths.iter().any(|t| t.len() != num_levels) {
            bail!("all dimensions must have the same number of tiling levels");
        }
        let lengths = dimensions.iter()
            .zip(&tile_lengths)
            .map(|(dim, tiles)| bottom_length(dim, tiles))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(ArrayDesc { dimensions, tile_lengths, lengths, packet })
    }

    pub fn num_levels(&self) -> usize {
        self.tile_lengths.first().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_tiled(&self) -> bool {
        self.num_levels() > 0
    }

    /// The number of packets in the array. Fails if the product of the dimension lengths
    ///  does not fit into a u64.
    pub fn array_size(&self) -> anyhow::Result<u64> {
        match self.dimensions.iter().try_fold(1u64, |acc, d| acc.checked_mul(d.length)) {
            Some(size) => Ok(size),
            None => bail!("array size overflows: dimension lengths {:?}", self.dimensions.iter().map(|d| d.length).collect::<Vec<_>>()),
        }
    }

    pub fn find_dim(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d.name == name)
    }
}

/// `dimension length / product of tile lengths`, which must divide evenly
pub(crate) fn bottom_length(dim: &DimDesc, tiles: &[u64]) -> anyhow::Result<u64> {
    let product = match tiles.iter().try_fold(1u64, |acc, &t| acc.checked_mul(t)) {
        Some(p) if p > 0 => p,
        _ => bail!("invalid tile lengths {:?} for dimension {:?}", tiles, dim.name),
    };
    if dim.length % product != 0 {
        bail!("tile lengths {:?} do not divide length {} of dimension {:?}", tiles, dim.length, dim.name);
    }
    Ok(dim.length / product)
}
