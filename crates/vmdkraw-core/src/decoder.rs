//! Stream-optimized extent decoder.
//!
//! [`VmdkDecoder`] opens an extent, resolves its layout and writes the raw
//! disk image to a sink:
//! 1. Read the header, look for a footer, resolve the effective layout
//! 2. Read the grain directory when the layout points at one
//! 3. Walk the markers; resolve each grain table as it is found
//! 4. Zero-fill omitted ranges and the tail up to the capacity
//!
//! # Example
//!
//! ```no_run
//! use vmdkraw_core::VmdkDecoder;
//! use std::fs::File;
//! use std::path::Path;
//!
//! let decoder = VmdkDecoder::open(Path::new("disk1.vmdk")).unwrap();
//! let mut out = File::create("disk1.raw").unwrap();
//! let summary = decoder.decode_to(&mut out).unwrap();
//! println!("{} bytes, sha256 {}", summary.bytes_emitted, summary.sha256);
//! ```

use std::io::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::emit::OutputEmitter;
use crate::error::{Error, Result};
use crate::options::DecodeOptions;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::vmdk::descriptor::{read_embedded_descriptor, EmbeddedDescriptor};
use crate::vmdk::format::SparseExtentHeader;
use crate::vmdk::layout::{
    read_footer, read_grain_directory, read_header, resolve, EffectiveLayout, Footer, GrainDirectory,
};
use crate::vmdk::source::{ExtentSource, MappedExtent};
use crate::vmdk::table::GrainTableResolver;
use crate::vmdk::walk::{DiscoveredTable, MarkerWalk, WalkEvent};

/// Progress information for a decode job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeProgress {
    /// Bytes written to the sink so far.
    pub bytes_emitted: u64,
    /// Bytes the finished image will have.
    pub bytes_total: u64,
    /// Grain tables resolved so far.
    pub tables_processed: u64,
}

impl DecodeProgress {
    /// Calculate percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_emitted as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Type alias for the progress callback function.
pub type ProgressCallback = Box<dyn Fn(DecodeProgress) + Send>;

/// Result of a finished decode job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeSummary {
    /// Bytes written to the sink; always the disk capacity.
    pub bytes_emitted: u64,
    /// Compressed grains inflated.
    pub grains_decoded: u64,
    /// Zero grains synthesized from unallocated entries.
    pub zero_grains: u64,
    /// Grain tables resolved.
    pub tables: u64,
    /// Unknown markers skipped by the walk.
    pub anomalies: u64,
    /// Lowercase hex SHA-256 of the emitted image.
    pub sha256: String,
}

/// Per-job state, owned by one `decode_to_with` call.
struct DecodeState<W: Write> {
    emitter: OutputEmitter<W>,
    next_table: u64,
    tables: u64,
    grains: u64,
    zero_grains: u64,
}

/// A stream-optimized extent ready to be decoded.
pub struct VmdkDecoder<S: ExtentSource = MappedExtent> {
    source: S,
    header: SparseExtentHeader,
    footer: Option<Footer>,
    layout: EffectiveLayout,
}

impl VmdkDecoder<MappedExtent> {
    /// Opens and memory-maps an extent file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be opened, `InvalidMagic` if it is not a
    /// sparse extent, `MalformedRecord` if the header or footer is unusable.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_source(MappedExtent::open(path)?)
    }
}

impl<S: ExtentSource> VmdkDecoder<S> {
    /// Reads the header and footer of `source` and resolves its layout.
    pub fn from_source(source: S) -> Result<Self> {
        let header = read_header(&source)?;
        let footer = read_footer(&source, source.len())?;
        let layout = resolve(&header, footer.as_ref())?;

        match read_embedded_descriptor(&source, &layout) {
            Ok(Some(descriptor)) if !descriptor.is_stream_optimized() => {
                warn!(
                    create_type = descriptor.create_type().unwrap_or(""),
                    "extent descriptor does not declare streamOptimized"
                );
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "embedded descriptor unreadable"),
        }

        Ok(Self {
            source,
            header,
            footer,
            layout,
        })
    }

    /// The header at sector 0.
    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    /// The footer, when the extent has a valid one.
    pub fn footer(&self) -> Option<&Footer> {
        self.footer.as_ref()
    }

    /// The resolved layout.
    pub fn layout(&self) -> &EffectiveLayout {
        &self.layout
    }

    /// The underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Virtual disk size in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.layout.capacity_bytes()
    }

    /// Reads the embedded text descriptor, if the extent has one.
    pub fn descriptor(&self) -> Result<Option<EmbeddedDescriptor>> {
        read_embedded_descriptor(&self.source, &self.layout)
    }

    /// Decodes the whole extent into `sink` with default options.
    pub fn decode_to<W: Write>(&self, sink: W) -> Result<DecodeSummary> {
        self.decode_to_with(sink, &DecodeOptions::default(), None)
    }

    /// Decodes the whole extent into `sink`.
    ///
    /// The sink receives exactly `capacity_bytes()` bytes in virtual order.
    /// On error the sink content is incomplete and must be discarded.
    pub fn decode_to_with<W: Write>(
        &self,
        sink: W,
        options: &DecodeOptions,
        progress: Option<ProgressCallback>,
    ) -> Result<DecodeSummary> {
        let layout = &self.layout;
        info!(
            capacity = layout.capacity_bytes(),
            grain_size = layout.grain_size_bytes(),
            tables = layout.num_grain_tables(),
            threads = options.threads,
            "decoding extent"
        );
        options.cancel.check()?;

        let directory = read_grain_directory(&self.source, layout)?;
        let pipeline = Pipeline::new(PipelineConfig::new(options.threads));
        let mut resolver = GrainTableResolver::new(&self.source, layout, options, &pipeline);
        let mut walk = MarkerWalk::new(&self.source, layout).with_cancel(options.cancel.clone());
        let mut state = DecodeState {
            emitter: OutputEmitter::new(sink, layout.capacity_bytes()),
            next_table: 0,
            tables: 0,
            grains: 0,
            zero_grains: 0,
        };

        let report = |state: &DecodeState<W>| {
            if let Some(ref callback) = progress {
                callback(DecodeProgress {
                    bytes_emitted: state.emitter.position(),
                    bytes_total: layout.capacity_bytes(),
                    tables_processed: state.tables,
                });
            }
        };

        let mut saw_end = false;
        while let Some(event) = walk.next_event()? {
            match event {
                WalkEvent::GrainTable(table) => {
                    let index = self.place_table(&table, directory.as_ref(), state.next_table)?;
                    state.next_table = index + 1;
                    if index >= layout.num_grain_tables() {
                        warn!(
                            offset = table.marker_offset,
                            table = index,
                            "grain table lies past the disk capacity; ignoring"
                        );
                        continue;
                    }

                    let table_start = index * layout.num_gtes_per_gt as u64 * layout.grain_size_bytes();
                    state.emitter.fill_zeros_to(table_start)?;
                    let outcome = resolver.resolve(index, &table.entries, &mut state.emitter)?;
                    state.tables += 1;
                    state.grains += outcome.grains;
                    state.zero_grains += outcome.zero_grains;
                    report(&state);
                }
                WalkEvent::EndOfStream { .. } => {
                    saw_end = true;
                }
            }
        }
        if !saw_end {
            return Err(Error::IncompleteStream {
                offset: walk.cursor(),
            });
        }

        options.cancel.check()?;
        let tables = state.tables;
        let grains = state.grains;
        let zero_grains = state.zero_grains;
        let (_, sha256, bytes_emitted) = state.emitter.finish()?;
        if let Some(ref callback) = progress {
            callback(DecodeProgress {
                bytes_emitted,
                bytes_total: layout.capacity_bytes(),
                tables_processed: tables,
            });
        }

        let summary = DecodeSummary {
            bytes_emitted,
            grains_decoded: grains,
            zero_grains,
            tables,
            anomalies: walk.stats().anomalies,
            sha256,
        };
        info!(
            bytes = summary.bytes_emitted,
            grains = summary.grains_decoded,
            zero_grains = summary.zero_grains,
            tables = summary.tables,
            "decode complete"
        );
        Ok(summary)
    }

    /// Decides which table number a discovered grain table holds.
    ///
    /// With a grain directory the table's sector is looked up there; without
    /// one, tables are numbered in the order the walk finds them.
    fn place_table(
        &self,
        table: &DiscoveredTable,
        directory: Option<&GrainDirectory>,
        expected: u64,
    ) -> Result<u64> {
        let index = match directory.and_then(|gd| gd.table_index_of(table.table_sector())) {
            Some(index) => index,
            None => {
                if directory.is_some() {
                    warn!(
                        offset = table.marker_offset,
                        table = expected,
                        "grain table not listed in the grain directory; placing it after the previous table"
                    );
                }
                expected
            }
        };
        if index < expected {
            return Err(Error::UnorderedGrainTable {
                offset: table.marker_offset,
                table: index,
                expected,
            });
        }
        debug!(offset = table.marker_offset, table = index, "placing grain table");
        Ok(index)
    }
}
