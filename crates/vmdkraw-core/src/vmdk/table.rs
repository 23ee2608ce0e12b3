//! Grain table resolution.
//!
//! A grain table lists, in virtual order, where each grain of its range is
//! stored. Resolving a table turns every entry into output: unallocated
//! entries become zero grains without touching the source, allocated ones
//! are followed to their grain marker and inflated.

use std::io::Write;

use tracing::{debug, trace, warn};

use super::format::{Marker, GRAIN_MARKER_LEN, MARKER_LEN, SECTOR_SIZE};
use super::inflate::{inflate_payload, GrainInflater};
use super::layout::EffectiveLayout;
use super::source::{read_exact_at, read_up_to, ExtentSource};
use crate::emit::OutputEmitter;
use crate::error::{Error, Result};
use crate::options::{DecodeOptions, GrainLengthPolicy};
use crate::pipeline::Pipeline;

/// Where a grain's data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrainRef {
    /// Unallocated; reads as zeros.
    Zero,
    /// A compressed grain record.
    Compressed(GrainLocation),
}

/// A validated grain record in the extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainLocation {
    /// Byte offset of the grain marker.
    pub marker_offset: u64,
    /// Virtual sector recorded in the marker.
    pub lba: u64,
    /// Byte offset of the compressed payload.
    pub payload_offset: u64,
    /// Compressed payload length in bytes.
    pub size: u32,
}

/// Counters for one resolved table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableOutcome {
    /// Compressed grains inflated and emitted.
    pub grains: u64,
    /// Zero grains synthesized.
    pub zero_grains: u64,
    /// Entries past the disk capacity that were ignored.
    pub ignored: u64,
}

/// Follows a grain table entry to its grain marker.
///
/// `grain` is the global grain number, used for error context. The entry
/// must point at a grain marker whose payload lies inside the source.
pub fn locate_grain<S: ExtentSource + ?Sized>(source: &S, grain: u64, entry: u32) -> Result<GrainRef> {
    if entry == 0 {
        return Ok(GrainRef::Zero);
    }

    let offset = entry as u64 * SECTOR_SIZE;
    let source_len = source.len();
    let buf = read_up_to(source, offset, MARKER_LEN)?;
    if buf.len() < GRAIN_MARKER_LEN {
        return Err(Error::truncated(offset, GRAIN_MARKER_LEN as u64, source_len));
    }
    let marker = match Marker::decode(&buf, offset) {
        Ok(marker) => marker,
        Err(Error::MalformedRecord { .. }) => {
            return Err(Error::truncated(offset, MARKER_LEN as u64, source_len));
        }
        Err(e) => return Err(e),
    };

    match marker {
        Marker::Grain { lba, size } => {
            let payload_offset = offset + GRAIN_MARKER_LEN as u64;
            if payload_offset + size as u64 > source_len {
                return Err(Error::truncated(offset, GRAIN_MARKER_LEN as u64 + size as u64, source_len));
            }
            Ok(GrainRef::Compressed(GrainLocation {
                marker_offset: offset,
                lba,
                payload_offset,
                size,
            }))
        }
        other => Err(Error::CorruptGrainReference {
            grain,
            offset,
            found: other.describe(),
        }),
    }
}

/// Work item for parallel inflate: a zero grain or a payload read in order.
enum Pending {
    Zero,
    Payload { offset: u64, data: Vec<u8> },
}

/// Resolves grain tables into output, one table at a time.
///
/// One resolver serves a whole decode job. Reads are always issued in entry
/// order; with a parallel pipeline only the inflate step runs concurrently.
pub struct GrainTableResolver<'a, S: ExtentSource + ?Sized> {
    source: &'a S,
    layout: &'a EffectiveLayout,
    options: &'a DecodeOptions,
    pipeline: &'a Pipeline,
    inflater: GrainInflater,
}

impl<'a, S: ExtentSource + ?Sized> GrainTableResolver<'a, S> {
    /// Creates a resolver.
    pub fn new(
        source: &'a S,
        layout: &'a EffectiveLayout,
        options: &'a DecodeOptions,
        pipeline: &'a Pipeline,
    ) -> Self {
        Self {
            source,
            layout,
            options,
            pipeline,
            inflater: GrainInflater::new(options.read_chunk_size),
        }
    }

    /// Emits every grain of table `table` in entry order.
    ///
    /// Entries covering grains past the disk capacity are ignored.
    pub fn resolve<W: Write>(
        &mut self,
        table: u64,
        entries: &[u32],
        emitter: &mut OutputEmitter<W>,
    ) -> Result<TableOutcome> {
        let per_table = self.layout.num_gtes_per_gt as u64;
        let first_grain = table * per_table;
        let in_range = self.layout.total_grains().saturating_sub(first_grain).min(entries.len() as u64) as usize;
        let ignored = entries.len() - in_range;
        if ignored > 0 {
            trace!(table, ignored, "ignoring entries past capacity");
        }
        let entries = &entries[..in_range];

        let mut outcome = if self.pipeline.is_parallel() {
            self.resolve_parallel(first_grain, entries, emitter)?
        } else {
            self.resolve_sequential(first_grain, entries, emitter)?
        };
        outcome.ignored = ignored as u64;
        debug!(
            table,
            grains = outcome.grains,
            zero_grains = outcome.zero_grains,
            "resolved grain table"
        );
        Ok(outcome)
    }

    fn resolve_sequential<W: Write>(
        &mut self,
        first_grain: u64,
        entries: &[u32],
        emitter: &mut OutputEmitter<W>,
    ) -> Result<TableOutcome> {
        let mut outcome = TableOutcome::default();
        let grain_len = self.layout.grain_size_bytes();

        for (i, &entry) in entries.iter().enumerate() {
            self.options.cancel.check()?;
            let grain = first_grain + i as u64;
            match locate_grain(self.source, grain, entry)? {
                GrainRef::Zero => {
                    emitter.fill_zeros(self.zero_grain_len())?;
                    outcome.zero_grains += 1;
                }
                GrainRef::Compressed(location) => {
                    self.check_lba(grain, &location);
                    let data = self.inflater.inflate(
                        self.source,
                        location.payload_offset,
                        location.size as u64,
                        grain_len as usize,
                    )?;
                    self.check_length(grain, data.len())?;
                    emitter.emit(&data)?;
                    outcome.grains += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn resolve_parallel<W: Write>(
        &mut self,
        first_grain: u64,
        entries: &[u32],
        emitter: &mut OutputEmitter<W>,
    ) -> Result<TableOutcome> {
        let mut pending = Vec::with_capacity(entries.len());
        for (i, &entry) in entries.iter().enumerate() {
            self.options.cancel.check()?;
            let grain = first_grain + i as u64;
            match locate_grain(self.source, grain, entry)? {
                GrainRef::Zero => pending.push(Pending::Zero),
                GrainRef::Compressed(location) => {
                    self.check_lba(grain, &location);
                    let data = read_exact_at(self.source, location.payload_offset, location.size as usize)?;
                    pending.push(Pending::Payload {
                        offset: location.payload_offset,
                        data,
                    });
                }
            }
        }

        let chunk_size = self.inflater.chunk_size();
        let grain_len = self.layout.grain_size_bytes() as usize;
        let cancel = &self.options.cancel;
        let inflated = self.pipeline.process(pending, |_idx, item| match item {
            Pending::Zero => Ok(None),
            Pending::Payload { offset, data } => {
                cancel.check()?;
                inflate_payload(&data, offset, chunk_size, grain_len).map(Some)
            }
        })?;

        let mut outcome = TableOutcome::default();
        for (i, grain_data) in inflated.into_iter().enumerate() {
            let grain = first_grain + i as u64;
            match grain_data {
                None => {
                    emitter.fill_zeros(self.zero_grain_len())?;
                    outcome.zero_grains += 1;
                }
                Some(data) => {
                    self.check_length(grain, data.len())?;
                    emitter.emit(&data)?;
                    outcome.grains += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn zero_grain_len(&self) -> u64 {
        self.options.zero_grain.bytes(self.layout.grain_size_bytes())
    }

    fn check_lba(&self, grain: u64, location: &GrainLocation) {
        let expected = grain * self.layout.grain_size_sectors;
        if location.lba != expected {
            debug!(
                grain,
                offset = location.marker_offset,
                lba = location.lba,
                expected,
                "grain marker lba differs from table position"
            );
        }
    }

    fn check_length(&self, grain: u64, actual: usize) -> Result<()> {
        let expected = self.layout.grain_size_bytes();
        if actual as u64 == expected {
            return Ok(());
        }
        match self.options.grain_length {
            GrainLengthPolicy::Strict => Err(Error::GrainLength {
                grain,
                expected,
                actual: actual as u64,
            }),
            GrainLengthPolicy::Lenient => {
                warn!(grain, expected, actual, "grain inflated to unexpected length");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ZeroGrainSize;
    use crate::pipeline::PipelineConfig;
    use crate::vmdk::layout::LayoutOrigin;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    fn layout() -> EffectiveLayout {
        EffectiveLayout {
            capacity_sectors: 12,
            grain_size_sectors: 4,
            num_gtes_per_gt: 4,
            gd_offset_sectors: 0,
            overhead_sectors: 1,
            descriptor_offset_sectors: 0,
            descriptor_size_sectors: 0,
            flags: 0,
            compress_algorithm: 1,
            origin: LayoutOrigin::Header,
        }
    }

    /// Appends a zlib grain record at the next sector and returns its sector.
    fn push_grain(image: &mut Vec<u8>, lba: u64, data: &[u8]) -> u32 {
        let sector = (image.len() as u64 / SECTOR_SIZE) as u32;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        let payload = encoder.finish().unwrap();
        image.extend_from_slice(&lba.to_le_bytes());
        image.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        image.extend_from_slice(&payload);
        let padded = image.len().div_ceil(512) * 512;
        image.resize(padded, 0);
        sector
    }

    fn resolve_with(options: &DecodeOptions, image: &[u8], entries: &[u32]) -> Result<(Vec<u8>, TableOutcome)> {
        let layout = layout();
        let pipeline = Pipeline::new(PipelineConfig::new(options.threads));
        let mut resolver = GrainTableResolver::new(image, &layout, options, &pipeline);
        let mut out = Vec::new();
        let mut emitter = OutputEmitter::new(&mut out, u64::MAX);
        let outcome = resolver.resolve(0, entries, &mut emitter)?;
        drop(emitter);
        Ok((out, outcome))
    }

    #[test]
    fn test_zero_and_compressed_grains_in_order() {
        let mut image = vec![0u8; 512];
        let a = push_grain(&mut image, 4, &[0xAA; 2048]);
        let b = push_grain(&mut image, 8, &[0xBB; 2048]);

        let (out, outcome) = resolve_with(&DecodeOptions::default(), &image, &[0, a, b, 0]).unwrap();
        // Fourth entry lies past the 12-sector capacity.
        assert_eq!(outcome, TableOutcome { grains: 2, zero_grains: 1, ignored: 1 });
        assert_eq!(out.len(), 3 * 2048);
        assert!(out[..2048].iter().all(|&b| b == 0));
        assert!(out[2048..4096].iter().all(|&b| b == 0xAA));
        assert!(out[4096..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut image = vec![0u8; 512];
        let a = push_grain(&mut image, 0, &[1; 2048]);
        let b = push_grain(&mut image, 8, &[2; 2048]);
        let entries = [a, 0, b];

        let (sequential, _) = resolve_with(&DecodeOptions::sequential(), &image, &entries).unwrap();
        let (parallel, _) = resolve_with(&DecodeOptions::parallel(2), &image, &entries).unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_entry_not_pointing_at_grain() {
        let mut image = vec![0u8; 512];
        let mut table_marker = vec![0u8; 512];
        table_marker[0..8].copy_from_slice(&1u64.to_le_bytes());
        table_marker[12..16].copy_from_slice(&1u32.to_le_bytes());
        image.extend(table_marker);

        let err = resolve_with(&DecodeOptions::default(), &image, &[0, 1]).unwrap_err();
        match err {
            Error::CorruptGrainReference { grain, offset, found } => {
                assert_eq!(grain, 1);
                assert_eq!(offset, 512);
                assert!(found.contains("grain table"), "found: {}", found);
            }
            other => panic!("expected CorruptGrainReference, got {:?}", other),
        }
    }

    #[test]
    fn test_entry_past_end_of_source() {
        let image = vec![0u8; 512];
        let err = resolve_with(&DecodeOptions::default(), &image, &[40]).unwrap_err();
        assert!(matches!(err, Error::TruncatedStream { offset: 20480, .. }));
    }

    #[test]
    fn test_strict_length_policy() {
        let mut image = vec![0u8; 512];
        let a = push_grain(&mut image, 0, &[7; 100]);

        let lenient = resolve_with(&DecodeOptions::default(), &image, &[a]).unwrap();
        assert_eq!(lenient.0, vec![7u8; 100]);

        let strict = DecodeOptions {
            grain_length: GrainLengthPolicy::Strict,
            ..DecodeOptions::default()
        };
        let err = resolve_with(&strict, &image, &[a]).unwrap_err();
        assert!(matches!(
            err,
            Error::GrainLength {
                grain: 0,
                expected: 2048,
                actual: 100
            }
        ));
    }

    #[test]
    fn test_legacy_zero_grain() {
        let options = DecodeOptions {
            zero_grain: ZeroGrainSize::Legacy,
            ..DecodeOptions::default()
        };
        let (out, _) = resolve_with(&options, &[0u8; 512], &[0]).unwrap();
        assert_eq!(out.len(), 65536);
    }
}
