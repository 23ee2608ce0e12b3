//! Disk conversion entry point.
//!
//! A conversion job is described by a [`DiskDescriptor`]: where the extent
//! is, what format it claims to be, and how large the caller expects the
//! disk to be. [`convert_disk`] checks the descriptor, opens the extent and
//! decodes it into the caller's sink.
//!
//! # Example
//!
//! ```no_run
//! use vmdkraw_core::{convert_disk, DecodeOptions, DiskDescriptor};
//! use std::fs::File;
//!
//! let disk = DiskDescriptor::vmdk("/path/to/disk1.vmdk");
//! let out = File::create("/path/to/disk1.raw").unwrap();
//! convert_disk(&disk, out, &DecodeOptions::default(), None).unwrap();
//! ```

use std::io::Write;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::decoder::{DecodeSummary, ProgressCallback, VmdkDecoder};
use crate::error::{Error, Result};
use crate::options::DecodeOptions;

/// The only disk format tag accepted.
pub const VMDK_FORMAT: &str = "vmdk";

/// A disk to convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    /// Path to the extent file.
    pub input: PathBuf,
    /// Capacity the caller expects, in bytes; `None` when unknown.
    pub capacity_bytes: Option<u64>,
    /// Format tag; must be `vmdk`.
    pub format: String,
}

impl DiskDescriptor {
    /// Creates a descriptor.
    pub fn new(input: impl Into<PathBuf>, capacity_bytes: Option<u64>, format: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            capacity_bytes,
            format: format.into(),
        }
    }

    /// Creates a `vmdk` descriptor with no declared capacity.
    pub fn vmdk(input: impl Into<PathBuf>) -> Self {
        Self::new(input, None, VMDK_FORMAT)
    }

    /// Sets the declared capacity.
    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = Some(capacity_bytes);
        self
    }

    /// Fails with `UnsupportedFormat` unless the format tag is `vmdk`.
    pub fn validate(&self) -> Result<()> {
        if self.format != VMDK_FORMAT {
            return Err(Error::UnsupportedFormat {
                format: self.format.clone(),
            });
        }
        Ok(())
    }
}

/// Converts one disk into `sink`.
///
/// The format tag is checked before the extent is opened. A declared
/// capacity that differs from the extent's own is logged; the extent's
/// capacity decides the output length.
pub fn convert_disk<W: Write>(
    disk: &DiskDescriptor,
    sink: W,
    options: &DecodeOptions,
    progress: Option<ProgressCallback>,
) -> Result<DecodeSummary> {
    disk.validate()?;
    info!(input = %disk.input.display(), "converting disk");

    let decoder = VmdkDecoder::open(&disk.input)?;
    if let Some(declared) = disk.capacity_bytes {
        let actual = decoder.capacity_bytes();
        if declared != actual {
            warn!(
                declared,
                actual,
                "declared capacity differs from the extent capacity; using the extent capacity"
            );
        }
    }

    decoder.decode_to_with(sink, options, progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmdk_descriptor() {
        let disk = DiskDescriptor::vmdk("disk.vmdk").with_capacity(1024);
        assert_eq!(disk.format, "vmdk");
        assert_eq!(disk.capacity_bytes, Some(1024));
        assert!(disk.validate().is_ok());
    }

    #[test]
    fn test_other_formats_rejected() {
        for format in ["qcow2", "VMDK", ""] {
            let disk = DiskDescriptor::new("disk.img", None, format);
            match disk.validate() {
                Err(Error::UnsupportedFormat { format: found }) => assert_eq!(found, format),
                other => panic!("expected UnsupportedFormat, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_format_checked_before_open() {
        let disk = DiskDescriptor::new("/nonexistent/disk.qcow2", None, "qcow2");
        let err = convert_disk(&disk, Vec::new(), &DecodeOptions::default(), None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }
}
