//! Header and footer resolution.
//!
//! A streamOptimized writer emits its header before any grain data, so the
//! header's `gdOffset` is usually the `GD_AT_END` placeholder. The footer is
//! written last and carries the final values; when a valid footer is found,
//! it wins. The result is an [`EffectiveLayout`], the only view of the
//! extent geometry the rest of the pipeline sees.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::format::{
    decode_offsets, round_up_to_sector, Marker, SparseExtentHeader, COMPRESS_ALGORITHM_DEFLATE,
    GD_AT_END, MARKER_LEN, SECTOR_SIZE,
};
use super::source::{read_exact_at, read_up_to, ExtentSource};
use crate::error::{Error, Result};

/// Distance of the footer marker from the end of the file, in sectors.
const FOOTER_MARKER_SECTORS_FROM_END: u64 = 3;

/// A footer record and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    /// The footer, decoded with the header layout.
    pub header: SparseExtentHeader,
    /// Byte offset of the footer record (the sector after the footer marker).
    pub offset: u64,
}

/// Which record the effective layout was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutOrigin {
    Header,
    Footer { offset: u64 },
}

/// Extent geometry after header/footer resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveLayout {
    /// Capacity in sectors.
    pub capacity_sectors: u64,
    /// Grain size in sectors.
    pub grain_size_sectors: u64,
    /// Grain table entries per grain table.
    pub num_gtes_per_gt: u32,
    /// Grain directory offset in sectors.
    pub gd_offset_sectors: u64,
    /// Start of the grain area in sectors.
    pub overhead_sectors: u64,
    /// Embedded descriptor offset in sectors.
    pub descriptor_offset_sectors: u64,
    /// Embedded descriptor size in sectors.
    pub descriptor_size_sectors: u64,
    /// Header flags.
    pub flags: u32,
    /// Compression algorithm.
    pub compress_algorithm: u16,
    /// Record the values came from.
    pub origin: LayoutOrigin,
}

impl EffectiveLayout {
    /// Returns the virtual disk capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * SECTOR_SIZE
    }

    /// Returns the grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size_sectors * SECTOR_SIZE
    }

    /// Number of grains needed to cover the capacity.
    pub fn total_grains(&self) -> u64 {
        self.capacity_sectors.div_ceil(self.grain_size_sectors)
    }

    /// Number of grain tables needed to cover the capacity.
    pub fn num_grain_tables(&self) -> u64 {
        self.total_grains().div_ceil(self.num_gtes_per_gt as u64)
    }

    /// On-disk size of one grain table, sector-aligned.
    pub fn grain_table_bytes(&self) -> u64 {
        round_up_to_sector(self.num_gtes_per_gt as u64 * 4)
    }

    /// Byte offset where the marker walk starts.
    ///
    /// An overhead of zero would place the walk on the header itself, so the
    /// walk starts right after it instead.
    pub fn grain_area_start(&self) -> u64 {
        self.overhead_sectors.max(1) * SECTOR_SIZE
    }
}

/// Reads and validates the header at sector 0.
pub fn read_header<S: ExtentSource + ?Sized>(source: &S) -> Result<SparseExtentHeader> {
    let buf = read_up_to(source, 0, SECTOR_SIZE as usize)?;
    SparseExtentHeader::decode(&buf, 0)
}

/// Looks for the footer three sectors before the end of the file.
///
/// Returns `None` when the marker there is not a footer marker or when the
/// footer record does not carry the magic. Older writers omit the footer, so
/// neither case is an error.
pub fn read_footer<S: ExtentSource + ?Sized>(source: &S, file_size: u64) -> Result<Option<Footer>> {
    let marker_offset = match file_size.checked_sub(FOOTER_MARKER_SECTORS_FROM_END * SECTOR_SIZE) {
        Some(offset) if offset >= SECTOR_SIZE => offset,
        _ => return Ok(None),
    };

    let buf = read_up_to(source, marker_offset, MARKER_LEN)?;
    match Marker::decode(&buf, marker_offset)? {
        Marker::Footer { .. } => {}
        other => {
            debug!(offset = marker_offset, found = %other.describe(), "no footer marker");
            return Ok(None);
        }
    }

    let footer_offset = marker_offset + SECTOR_SIZE;
    let buf = read_exact_at(source, footer_offset, SECTOR_SIZE as usize)?;
    match SparseExtentHeader::decode(&buf, footer_offset) {
        Ok(header) => Ok(Some(Footer {
            header,
            offset: footer_offset,
        })),
        Err(Error::InvalidMagic { .. }) => {
            warn!(offset = footer_offset, "footer marker present but footer has no magic; ignoring it");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Picks the authoritative record and validates its geometry.
pub fn resolve(header: &SparseExtentHeader, footer: Option<&Footer>) -> Result<EffectiveLayout> {
    let (record, origin, record_offset) = match footer {
        Some(footer) => (
            &footer.header,
            LayoutOrigin::Footer {
                offset: footer.offset,
            },
            footer.offset,
        ),
        None => (header, LayoutOrigin::Header, 0),
    };
    let record_name = match origin {
        LayoutOrigin::Header => "sparse extent header",
        LayoutOrigin::Footer { .. } => "footer",
    };

    if record.grain_size == 0 {
        return Err(Error::malformed(record_name, record_offset, "grain size is zero"));
    }
    if record.num_gtes_per_gt == 0 {
        return Err(Error::malformed(
            record_name,
            record_offset,
            "zero grain table entries per grain table",
        ));
    }
    if record.grain_size.checked_mul(SECTOR_SIZE).and_then(|b| usize::try_from(b).ok()).is_none()
        || record.capacity.checked_mul(SECTOR_SIZE).is_none()
    {
        return Err(Error::malformed(
            record_name,
            record_offset,
            format!(
                "geometry overflows: capacity {} sectors, grain size {} sectors",
                record.capacity, record.grain_size
            ),
        ));
    }

    if header.version > 3 {
        warn!(version = header.version, "unexpected sparse extent version");
    }
    if !record.has_markers() || !record.is_compressed() {
        warn!(
            flags = record.flags,
            "extent flags do not declare compressed grains with markers"
        );
    }
    if record.compress_algorithm != COMPRESS_ALGORITHM_DEFLATE {
        warn!(
            algorithm = record.compress_algorithm,
            "unexpected compression algorithm; decoding as DEFLATE"
        );
    }

    let layout = EffectiveLayout {
        capacity_sectors: record.capacity,
        grain_size_sectors: record.grain_size,
        num_gtes_per_gt: record.num_gtes_per_gt,
        gd_offset_sectors: record.gd_offset,
        overhead_sectors: record.overhead,
        descriptor_offset_sectors: record.descriptor_offset,
        descriptor_size_sectors: record.descriptor_size,
        flags: record.flags,
        compress_algorithm: record.compress_algorithm,
        origin,
    };
    debug!(
        origin = ?layout.origin,
        capacity_sectors = layout.capacity_sectors,
        grain_size_sectors = layout.grain_size_sectors,
        gd_offset_sectors = layout.gd_offset_sectors,
        overhead_sectors = layout.overhead_sectors,
        "resolved extent layout"
    );
    Ok(layout)
}

/// The grain directory: grain table sector offsets, indexed by table number.
#[derive(Debug, Clone, Default)]
pub struct GrainDirectory {
    entries: Vec<u32>,
    by_sector: HashMap<u32, u64>,
}

impl GrainDirectory {
    /// Builds a directory from its raw entries.
    pub fn new(entries: Vec<u32>) -> Self {
        let by_sector = entries
            .iter()
            .enumerate()
            .filter(|(_, sector)| **sector != 0)
            .map(|(index, &sector)| (sector, index as u64))
            .collect();
        Self { entries, by_sector }
    }

    /// Returns the raw entries.
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Returns the table number whose grain table starts at `sector`.
    pub fn table_index_of(&self, sector: u64) -> Option<u64> {
        let sector = u32::try_from(sector).ok()?;
        self.by_sector.get(&sector).copied()
    }
}

/// Reads the grain directory the layout points at.
///
/// Returns `None` when the layout carries no usable directory offset or the
/// directory would extend past the end of the source; grain tables are then
/// placed in the order the walk finds them.
pub fn read_grain_directory<S: ExtentSource + ?Sized>(
    source: &S,
    layout: &EffectiveLayout,
) -> Result<Option<GrainDirectory>> {
    let gd_sector = layout.gd_offset_sectors;
    if gd_sector == 0 || gd_sector == GD_AT_END {
        debug!(gd_offset_sectors = gd_sector, "no grain directory offset");
        return Ok(None);
    }

    let count = layout.num_grain_tables();
    let offset = gd_sector.checked_mul(SECTOR_SIZE);
    let bytes = count.checked_mul(4);
    let (offset, bytes) = match (offset, bytes) {
        (Some(offset), Some(bytes)) if offset.saturating_add(bytes) <= source.len() => (offset, bytes),
        _ => {
            warn!(
                gd_offset_sectors = gd_sector,
                tables = count,
                source_len = source.len(),
                "grain directory lies outside the extent; placing grain tables in stream order"
            );
            return Ok(None);
        }
    };

    let buf = read_exact_at(source, offset, bytes as usize)?;
    let entries = decode_offsets(&buf, count as usize, "grain directory", offset)?;
    debug!(offset, tables = entries.len(), "read grain directory");
    Ok(Some(GrainDirectory::new(entries)))
}
