//! Stream-optimized sparse extent handling.
//!
//! This module holds the on-disk format (header, markers, grain tables), the
//! layout resolution that picks header or footer values, the marker walk,
//! grain table resolution and grain decompression.

pub mod descriptor;
pub mod format;
pub mod inflate;
pub mod layout;
pub mod source;
pub mod table;
pub mod walk;

pub use descriptor::{read_embedded_descriptor, EmbeddedDescriptor, ExtentKind, ExtentLine};
pub use format::{Marker, SparseExtentHeader, GD_AT_END, SECTOR_SIZE, VMDK_MAGIC};
pub use inflate::{GrainInflater, DEFAULT_READ_CHUNK_SIZE};
pub use layout::{
    read_footer, read_grain_directory, read_header, resolve, EffectiveLayout, Footer, GrainDirectory,
    LayoutOrigin,
};
pub use source::{ExtentSource, MappedExtent};
pub use table::{locate_grain, GrainLocation, GrainRef, GrainTableResolver, TableOutcome};
pub use walk::{DiscoveredTable, MarkerWalk, WalkEvent, WalkState, WalkStats};
