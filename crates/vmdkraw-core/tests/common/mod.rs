//! Synthetic stream-optimized extents for integration tests.
//!
//! [`ExtentBuilder`] lays out an extent the way VMware tools write one:
//! header (and optional embedded descriptor), then for each grain table its
//! grains followed by the table, then the grain directory, footer and
//! end-of-stream marker. Options bend that layout to produce the unusual
//! and broken extents the decoder must handle.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

use flate2::write::{DeflateEncoder, ZlibEncoder};
use flate2::Compression;
use vmdkraw_core::vmdk::ExtentSource;

pub const SECTOR: usize = 512;
pub const GD_AT_END: u64 = u64::MAX;

const MARKER_EOS: u32 = 0;
const MARKER_GT: u32 = 1;
const MARKER_GD: u32 = 2;
const MARKER_FOOTER: u32 = 3;

/// How grain payloads are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Zlib,
    RawDeflate,
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn raw_deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Deterministic bytes that do not compress.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}

/// Header field values, written at sector 0 and again as the footer.
#[derive(Debug, Clone)]
pub struct HeaderFields {
    pub magic: [u8; 4],
    pub version: u32,
    pub flags: u32,
    pub capacity: u64,
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub gd_offset: u64,
    pub overhead: u64,
}

impl HeaderFields {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&self.grain_size.to_le_bytes());
        buf[28..36].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        buf[36..44].copy_from_slice(&self.descriptor_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        buf[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.overhead.to_le_bytes());
        buf[73..77].copy_from_slice(b"\n \r\n");
        buf[77..79].copy_from_slice(&1u16.to_le_bytes());
        buf
    }
}

/// A 512-byte metadata marker.
pub fn metadata_marker(value: u64, marker_type: u32) -> Vec<u8> {
    let mut buf = vec![0u8; SECTOR];
    buf[0..8].copy_from_slice(&value.to_le_bytes());
    buf[12..16].copy_from_slice(&marker_type.to_le_bytes());
    buf
}

fn pad_to_sector(buf: &mut Vec<u8>) {
    let padded = buf.len().div_ceil(SECTOR) * SECTOR;
    buf.resize(padded, 0);
}

/// A built extent and where its parts landed.
#[derive(Debug, Clone)]
pub struct BuiltExtent {
    pub image: Vec<u8>,
    /// Sector of each table's entries, by table number; 0 if omitted.
    pub table_sectors: Vec<u64>,
    /// Sector of the grain directory entries, 0 if none was written.
    pub gd_sector: u64,
    /// The raw disk image the extent should decode to.
    pub expected: Vec<u8>,
}

impl BuiltExtent {
    /// Points entry `index` of table `table` at `sector`.
    pub fn set_table_entry(&mut self, table: usize, index: usize, sector: u32) {
        let at = self.table_sectors[table] as usize * SECTOR + index * 4;
        self.image[at..at + 4].copy_from_slice(&sector.to_le_bytes());
    }
}

pub struct ExtentBuilder {
    capacity_sectors: u64,
    grain_sectors: u64,
    gtes_per_gt: u32,
    overhead: Option<u64>,
    descriptor: Option<String>,
    descriptor_offset: Option<u64>,
    framing: Framing,
    grains: BTreeMap<u64, Vec<u8>>,
    reverse_grains: bool,
    table_order: Option<Vec<u64>>,
    keep_empty_tables: bool,
    grain_directory: bool,
    footer: bool,
    header_gd_offset: u64,
    header_capacity: Option<u64>,
    magic: [u8; 4],
    unknown_marker: bool,
    end_of_stream: bool,
}

impl ExtentBuilder {
    pub fn new(capacity_sectors: u64, grain_sectors: u64, gtes_per_gt: u32) -> Self {
        Self {
            capacity_sectors,
            grain_sectors,
            gtes_per_gt,
            overhead: None,
            descriptor: None,
            descriptor_offset: None,
            framing: Framing::Zlib,
            grains: BTreeMap::new(),
            reverse_grains: false,
            table_order: None,
            keep_empty_tables: false,
            grain_directory: true,
            footer: true,
            header_gd_offset: GD_AT_END,
            header_capacity: None,
            magic: *b"KDMV",
            unknown_marker: false,
            end_of_stream: true,
        }
    }

    pub fn grain(mut self, index: u64, data: Vec<u8>) -> Self {
        self.grains.insert(index, data);
        self
    }

    pub fn overhead(mut self, sectors: u64) -> Self {
        self.overhead = Some(sectors);
        self
    }

    pub fn descriptor(mut self, text: &str) -> Self {
        self.descriptor = Some(text.to_string());
        self
    }

    /// The `descriptorOffset` written in the header and footer, wherever the text really is.
    pub fn descriptor_offset(mut self, sectors: u64) -> Self {
        self.descriptor_offset = Some(sectors);
        self
    }

    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Writes the grains of each table in reverse virtual order.
    pub fn reverse_grains(mut self) -> Self {
        self.reverse_grains = true;
        self
    }

    /// Writes tables (and their grains) in this order.
    pub fn table_order(mut self, order: Vec<u64>) -> Self {
        self.table_order = Some(order);
        self
    }

    /// Writes tables that have no allocated grain instead of omitting them.
    pub fn keep_empty_tables(mut self) -> Self {
        self.keep_empty_tables = true;
        self
    }

    pub fn without_grain_directory(mut self) -> Self {
        self.grain_directory = false;
        self
    }

    pub fn without_footer(mut self) -> Self {
        self.footer = false;
        self
    }

    pub fn without_end_of_stream(mut self) -> Self {
        self.end_of_stream = false;
        self
    }

    /// The `gdOffset` written in the header; the footer always gets the real one.
    pub fn header_gd_offset(mut self, sectors: u64) -> Self {
        self.header_gd_offset = sectors;
        self
    }

    /// A capacity written only in the header.
    pub fn header_capacity(mut self, sectors: u64) -> Self {
        self.header_capacity = Some(sectors);
        self
    }

    pub fn magic(mut self, magic: [u8; 4]) -> Self {
        self.magic = magic;
        self
    }

    /// Inserts a marker of unknown type before the grain directory.
    pub fn unknown_marker(mut self) -> Self {
        self.unknown_marker = true;
        self
    }

    fn grain_bytes(&self) -> usize {
        self.grain_sectors as usize * SECTOR
    }

    fn total_grains(&self) -> u64 {
        self.capacity_sectors.div_ceil(self.grain_sectors)
    }

    fn num_tables(&self) -> u64 {
        self.total_grains().div_ceil(self.gtes_per_gt as u64)
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        match self.framing {
            Framing::Zlib => zlib(data),
            Framing::RawDeflate => raw_deflate(data),
        }
    }

    /// The raw image this extent decodes to.
    fn expected_image(&self) -> Vec<u8> {
        let capacity = self.capacity_sectors as usize * SECTOR;
        let mut image = vec![0u8; capacity];
        for (&index, data) in &self.grains {
            let start = index as usize * self.grain_bytes();
            if start >= capacity {
                continue;
            }
            let end = (start + data.len()).min(capacity);
            image[start..end].copy_from_slice(&data[..end - start]);
        }
        image
    }

    fn header(&self, gd_offset: u64, capacity: u64, overhead: u64, descriptor_sectors: u64) -> HeaderFields {
        HeaderFields {
            magic: self.magic,
            version: 3,
            flags: 1 | (1 << 16) | (1 << 17),
            capacity,
            grain_size: self.grain_sectors,
            descriptor_offset: self
                .descriptor_offset
                .unwrap_or(if descriptor_sectors > 0 { 1 } else { 0 }),
            descriptor_size: descriptor_sectors,
            num_gtes_per_gt: self.gtes_per_gt,
            gd_offset,
            overhead,
        }
    }

    pub fn build(self) -> BuiltExtent {
        let descriptor = self.descriptor.as_ref().map(|text| {
            let mut bytes = text.as_bytes().to_vec();
            pad_to_sector(&mut bytes);
            bytes
        });
        let descriptor_sectors = descriptor.as_ref().map_or(0, |d| (d.len() / SECTOR) as u64);
        let overhead = self.overhead.unwrap_or(1 + descriptor_sectors);

        let header_capacity = self.header_capacity.unwrap_or(self.capacity_sectors);
        let header = self.header(self.header_gd_offset, header_capacity, overhead, descriptor_sectors);
        let mut image = header.to_bytes();
        if let Some(descriptor) = &descriptor {
            image.extend_from_slice(descriptor);
        }
        image.resize(overhead.max(1) as usize * SECTOR, 0);

        let per_table = self.gtes_per_gt as u64;
        let num_tables = self.num_tables();
        let order = self
            .table_order
            .clone()
            .unwrap_or_else(|| (0..num_tables).collect());
        let mut table_sectors = vec![0u64; num_tables as usize];

        for table in order {
            let first = table * per_table;
            let mut indices: Vec<u64> = self
                .grains
                .range(first..first + per_table)
                .map(|(&index, _)| index)
                .collect();
            if indices.is_empty() && !self.keep_empty_tables {
                continue;
            }
            if self.reverse_grains {
                indices.reverse();
            }

            let mut entries = vec![0u32; self.gtes_per_gt as usize];
            for index in indices {
                let payload = self.compress(&self.grains[&index]);
                entries[(index - first) as usize] = (image.len() / SECTOR) as u32;
                image.extend_from_slice(&(index * self.grain_sectors).to_le_bytes());
                image.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                image.extend_from_slice(&payload);
                pad_to_sector(&mut image);
            }

            let mut table_bytes: Vec<u8> = entries.iter().flat_map(|e| e.to_le_bytes()).collect();
            pad_to_sector(&mut table_bytes);
            image.extend(metadata_marker((table_bytes.len() / SECTOR) as u64, MARKER_GT));
            table_sectors[table as usize] = (image.len() / SECTOR) as u64;
            image.extend(table_bytes);
        }

        if self.unknown_marker {
            image.extend(metadata_marker(0, 9));
        }

        let mut gd_sector = 0;
        if self.grain_directory {
            let mut gd_bytes: Vec<u8> = table_sectors
                .iter()
                .flat_map(|&s| (s as u32).to_le_bytes())
                .collect();
            pad_to_sector(&mut gd_bytes);
            image.extend(metadata_marker((gd_bytes.len() / SECTOR) as u64, MARKER_GD));
            gd_sector = (image.len() / SECTOR) as u64;
            image.extend(gd_bytes);
        }

        if self.footer {
            image.extend(metadata_marker(1, MARKER_FOOTER));
            let footer = self.header(gd_sector, self.capacity_sectors, overhead, descriptor_sectors);
            image.extend(footer.to_bytes());
        }

        if self.end_of_stream {
            image.extend(metadata_marker(0, MARKER_EOS));
        }

        BuiltExtent {
            expected: self.expected_image(),
            image,
            table_sectors,
            gd_sector,
        }
    }
}

/// An in-memory source that records every read.
pub struct CountingSource {
    data: Vec<u8>,
    reads: Mutex<Vec<(u64, usize)>>,
}

impl CountingSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            reads: Mutex::new(Vec::new()),
        }
    }

    /// Reads performed so far, as `(offset, length)`.
    pub fn reads(&self) -> Vec<(u64, usize)> {
        self.reads.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.reads.lock().unwrap().clear();
    }
}

impl ExtentSource for CountingSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reads.lock().unwrap().push((offset, buf.len()));
        self.data.read_at(offset, buf)
    }
}
