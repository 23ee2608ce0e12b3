//! On-disk records of a streamOptimized sparse extent.
//!
//! Every record is little-endian and fixed-layout. This module only decodes;
//! it performs no I/O. Layout reference:
//!
//! ```text
//! offset  size  field
//!      0     4  magicNumber ("KDMV")
//!      4     4  version
//!      8     4  flags
//!     12     8  capacity (sectors)
//!     20     8  grainSize (sectors)
//!     28     8  descriptorOffset (sectors)
//!     36     8  descriptorSize (sectors)
//!     44     4  numGTEsPerGT
//!     48     8  rgdOffset (sectors)
//!     56     8  gdOffset (sectors)
//!     64     8  overHead (sectors)
//!     72     1  uncleanShutdown
//!     73     4  singleEndLineChar, nonEndLineChar, doubleEndLineChar1/2
//!     77     2  compressAlgorithm
//! ```

use crate::error::{Error, Result};

/// Extent magic as it appears on disk.
pub const VMDK_MAGIC: [u8; 4] = *b"KDMV";

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Grain size used by the historical zero-grain buffer (128 sectors = 64KB).
pub const LEGACY_GRAIN_SECTORS: u64 = 128;

/// `gdOffset` value written into headers whose directory lives at the end of the stream.
pub const GD_AT_END: u64 = u64::MAX;

/// Bytes of the header that carry fields; the rest of the sector is padding.
pub const HEADER_LAYOUT_LEN: usize = 79;

/// Bytes of a grain marker (`lba` + `size`); compressed data follows directly.
pub const GRAIN_MARKER_LEN: usize = 12;

/// Bytes of a metadata marker (`value` + `size` + `type`).
pub const MARKER_LEN: usize = 16;

/// Compression algorithm: DEFLATE.
pub const COMPRESS_ALGORITHM_DEFLATE: u16 = 1;

/// Header flag bits.
pub const FLAG_VALID_NEWLINE: u32 = 1 << 0;
pub const FLAG_REDUNDANT_GRAIN_TABLE: u32 = 1 << 1;
pub const FLAG_COMPRESSED: u32 = 1 << 16;
pub const FLAG_MARKERS: u32 = 1 << 17;

const MARKER_TYPE_EOS: u32 = 0;
const MARKER_TYPE_GRAIN_TABLE: u32 = 1;
const MARKER_TYPE_GRAIN_DIRECTORY: u32 = 2;
const MARKER_TYPE_FOOTER: u32 = 3;

/// Rounds a byte count up to the next sector boundary.
#[inline]
pub fn round_up_to_sector(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

#[inline]
fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

#[inline]
fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[inline]
fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Sparse extent header. The footer shares this layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseExtentHeader {
    /// Version (3 for streamOptimized).
    pub version: u32,
    /// Flags.
    pub flags: u32,
    /// Capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    /// Embedded descriptor offset in sectors.
    pub descriptor_offset: u64,
    /// Embedded descriptor size in sectors.
    pub descriptor_size: u64,
    /// Number of grain table entries per grain table.
    pub num_gtes_per_gt: u32,
    /// Redundant grain directory offset in sectors.
    pub rgd_offset: u64,
    /// Grain directory offset in sectors.
    pub gd_offset: u64,
    /// Overhead in sectors; the grain area starts here.
    pub overhead: u64,
    /// Unclean shutdown flag.
    pub unclean_shutdown: u8,
    /// Newline detection characters.
    pub newline_chars: [u8; 4],
    /// Compression algorithm (1 = DEFLATE).
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Decodes a header from `data`, which was read at `offset`.
    ///
    /// The magic is checked before anything else, so a buffer that does not
    /// start with `KDMV` is always `InvalidMagic`, whatever its length.
    pub fn decode(data: &[u8], offset: u64) -> Result<Self> {
        if data.len() < VMDK_MAGIC.len() || data[0..4] != VMDK_MAGIC {
            return Err(Error::InvalidMagic {
                found: data[..data.len().min(4)].to_vec(),
            });
        }
        if data.len() < HEADER_LAYOUT_LEN {
            return Err(Error::short_record(
                "sparse extent header",
                offset,
                HEADER_LAYOUT_LEN,
                data.len(),
            ));
        }

        Ok(Self {
            version: le_u32(data, 4),
            flags: le_u32(data, 8),
            capacity: le_u64(data, 12),
            grain_size: le_u64(data, 20),
            descriptor_offset: le_u64(data, 28),
            descriptor_size: le_u64(data, 36),
            num_gtes_per_gt: le_u32(data, 44),
            rgd_offset: le_u64(data, 48),
            gd_offset: le_u64(data, 56),
            overhead: le_u64(data, 64),
            unclean_shutdown: data[72],
            newline_chars: [data[73], data[74], data[75], data[76]],
            compress_algorithm: le_u16(data, 77),
        })
    }

    /// Check if grains are compressed.
    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    /// Check if the extent uses stream markers.
    pub fn has_markers(&self) -> bool {
        (self.flags & FLAG_MARKERS) != 0
    }
}

/// A marker, classified once from its `size` and `type` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Compressed grain; `size` bytes of payload follow the 12-byte marker.
    Grain { lba: u64, size: u32 },
    /// End of stream.
    EndOfStream,
    /// Grain table; `sectors` sectors of table follow the marker sector.
    GrainTable { sectors: u64 },
    /// Grain directory; `sectors` sectors of directory follow the marker sector.
    GrainDirectory { sectors: u64 },
    /// Footer; the footer header follows the marker sector.
    Footer { sectors: u64 },
    /// Metadata marker of a type this decoder does not know.
    Unknown { marker_type: u32, value: u64 },
}

impl Marker {
    /// Decodes a marker from `data`, which was read at `offset`.
    ///
    /// A grain marker needs only 12 bytes; any other marker needs 16.
    pub fn decode(data: &[u8], offset: u64) -> Result<Self> {
        if data.len() < GRAIN_MARKER_LEN {
            return Err(Error::short_record(
                "marker",
                offset,
                GRAIN_MARKER_LEN,
                data.len(),
            ));
        }

        let value = le_u64(data, 0);
        let size = le_u32(data, 8);
        if size > 0 {
            return Ok(Marker::Grain { lba: value, size });
        }

        if data.len() < MARKER_LEN {
            return Err(Error::short_record("marker", offset, MARKER_LEN, data.len()));
        }

        Ok(match le_u32(data, 12) {
            MARKER_TYPE_EOS => Marker::EndOfStream,
            MARKER_TYPE_GRAIN_TABLE => Marker::GrainTable { sectors: value },
            MARKER_TYPE_GRAIN_DIRECTORY => Marker::GrainDirectory { sectors: value },
            MARKER_TYPE_FOOTER => Marker::Footer { sectors: value },
            marker_type => Marker::Unknown { marker_type, value },
        })
    }

    /// Short human-readable name, used in error context and logs.
    pub fn describe(&self) -> String {
        match self {
            Marker::Grain { size, .. } => format!("grain marker ({} bytes)", size),
            Marker::EndOfStream => "end-of-stream marker".to_string(),
            Marker::GrainTable { .. } => "grain table marker".to_string(),
            Marker::GrainDirectory { .. } => "grain directory marker".to_string(),
            Marker::Footer { .. } => "footer marker".to_string(),
            Marker::Unknown { marker_type, .. } => format!("unknown marker (type {})", marker_type),
        }
    }
}

/// Decodes `count` little-endian u32 sector offsets.
///
/// Shared by grain tables and grain directories, which differ only in length.
pub fn decode_offsets(
    data: &[u8],
    count: usize,
    record: &'static str,
    offset: u64,
) -> Result<Vec<u32>> {
    let needed = count * 4;
    if data.len() < needed {
        return Err(Error::short_record(record, offset, needed, data.len()));
    }

    Ok(data[..needed]
        .chunks_exact(4)
        .map(|entry| le_u32(entry, 0))
        .collect())
}
