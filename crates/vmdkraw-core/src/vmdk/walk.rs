//! Forward scan over the grain area.
//!
//! The walk visits every sector-aligned record from the start of the grain
//! area to the end-of-stream marker. It exists to find grain tables: grain
//! markers are stepped over, since their data is reached again through the
//! owning table in virtual order. Each step moves the cursor forward by at
//! least one sector, so the walk always terminates.

use tracing::{debug, trace, warn};

use super::format::{
    decode_offsets, round_up_to_sector, Marker, GRAIN_MARKER_LEN, MARKER_LEN, SECTOR_SIZE,
};
use super::layout::EffectiveLayout;
use super::source::{read_exact_at, read_up_to, ExtentSource};
use crate::error::{Error, Result};
use crate::options::CancelToken;

/// State of a marker walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState {
    Scanning,
    Done,
    Failed,
}

/// A grain table found by the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTable {
    /// Byte offset of the grain table marker.
    pub marker_offset: u64,
    /// Byte offset of the first table entry.
    pub table_offset: u64,
    /// Grain offsets in sectors, in virtual order; 0 means unallocated.
    pub entries: Vec<u32>,
}

impl DiscoveredTable {
    /// Sector the table data starts at; this is what the grain directory records.
    pub fn table_sector(&self) -> u64 {
        self.table_offset / SECTOR_SIZE
    }
}

/// What the walk stopped on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEvent {
    /// A grain table; the caller resolves it before asking for the next event.
    GrainTable(DiscoveredTable),
    /// The end-of-stream marker at `offset`.
    EndOfStream { offset: u64 },
}

/// Counters kept by the walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Grain markers stepped over.
    pub grains_skipped: u64,
    /// Grain tables found.
    pub tables: u64,
    /// Directory and footer markers stepped over.
    pub metadata_skipped: u64,
    /// Unknown marker types stepped over.
    pub anomalies: u64,
}

/// Lazy marker walk over an extent.
pub struct MarkerWalk<'a, S: ExtentSource + ?Sized> {
    source: &'a S,
    layout: &'a EffectiveLayout,
    cursor: u64,
    state: WalkState,
    stats: WalkStats,
    cancel: Option<CancelToken>,
}

impl<'a, S: ExtentSource + ?Sized> MarkerWalk<'a, S> {
    /// Starts a walk at the beginning of the grain area.
    pub fn new(source: &'a S, layout: &'a EffectiveLayout) -> Self {
        Self {
            source,
            layout,
            cursor: layout.grain_area_start(),
            state: WalkState::Scanning,
            stats: WalkStats::default(),
            cancel: None,
        }
    }

    /// Checks `cancel` before every marker read.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Returns the current byte offset.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Returns the current state.
    pub fn state(&self) -> WalkState {
        self.state
    }

    /// Returns the walk counters.
    pub fn stats(&self) -> WalkStats {
        self.stats
    }

    /// Scans forward to the next grain table or the end of the stream.
    ///
    /// Returns `Ok(None)` once the walk is done. A failure moves the walk to
    /// [`WalkState::Failed`]; it is never retried.
    pub fn next_event(&mut self) -> Result<Option<WalkEvent>> {
        if self.state != WalkState::Scanning {
            return Ok(None);
        }
        loop {
            match self.step() {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => continue,
                Err(e) => {
                    self.state = WalkState::Failed;
                    return Err(e);
                }
            }
        }
    }

    /// Classifies the record at the cursor and moves past it.
    fn step(&mut self) -> Result<Option<WalkEvent>> {
        if let Some(cancel) = &self.cancel {
            cancel.check()?;
        }
        let at = self.cursor;
        let source_len = self.source.len();
        if at >= source_len {
            return Err(if at == source_len {
                Error::IncompleteStream { offset: at }
            } else {
                Error::truncated(at, MARKER_LEN as u64, source_len)
            });
        }

        let buf = read_up_to(self.source, at, MARKER_LEN)?;
        let marker = match Marker::decode(&buf, at) {
            Ok(marker) => marker,
            Err(Error::MalformedRecord { .. }) => {
                return Err(Error::truncated(at, MARKER_LEN as u64, source_len));
            }
            Err(e) => return Err(e),
        };

        match marker {
            Marker::Grain { lba, size } => {
                let record_len = GRAIN_MARKER_LEN as u64 + size as u64;
                if at + record_len > source_len {
                    return Err(Error::truncated(at, record_len, source_len));
                }
                trace!(offset = at, lba, size, "skipping grain");
                self.stats.grains_skipped += 1;
                self.cursor = round_up_to_sector(at + record_len);
                Ok(None)
            }
            Marker::GrainTable { sectors } => {
                let table_offset = at + SECTOR_SIZE;
                let count = self.layout.num_gtes_per_gt as usize;
                let buf = read_exact_at(self.source, table_offset, count * 4)?;
                let entries = decode_offsets(&buf, count, "grain table", table_offset)?;

                let table_bytes = self.layout.grain_table_bytes();
                if sectors * SECTOR_SIZE != table_bytes {
                    debug!(
                        offset = at,
                        marker_sectors = sectors,
                        layout_bytes = table_bytes,
                        "grain table marker size differs from layout"
                    );
                }
                self.stats.tables += 1;
                self.cursor = table_offset + table_bytes;
                debug!(offset = at, table_offset, "found grain table");
                Ok(Some(WalkEvent::GrainTable(DiscoveredTable {
                    marker_offset: at,
                    table_offset,
                    entries,
                })))
            }
            Marker::EndOfStream => {
                self.state = WalkState::Done;
                debug!(offset = at, "end of stream");
                Ok(Some(WalkEvent::EndOfStream { offset: at }))
            }
            Marker::GrainDirectory { sectors } | Marker::Footer { sectors } => {
                debug!(offset = at, marker = %marker.describe(), sectors, "skipping metadata");
                self.stats.metadata_skipped += 1;
                self.cursor = at
                    .saturating_add(SECTOR_SIZE)
                    .saturating_add(sectors.saturating_mul(SECTOR_SIZE));
                Ok(None)
            }
            Marker::Unknown { marker_type, value } => {
                warn!(offset = at, marker_type, value, "unknown marker type; skipping one sector");
                self.stats.anomalies += 1;
                self.cursor = at + SECTOR_SIZE;
                Ok(None)
            }
        }
    }
}

impl<'a, S: ExtentSource + ?Sized> Iterator for MarkerWalk<'a, S> {
    type Item = Result<WalkEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}
