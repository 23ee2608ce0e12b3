//! vmdkraw Core Library
//!
//! This crate decodes VMware stream-optimized sparse extents (the disk format
//! found inside OVA packages) into raw disk images.
//!
//! # Overview
//!
//! A stream-optimized extent stores compressed grains, each followed in
//! stream order by the grain table that indexes them, and ends with a grain
//! directory, a footer and an end-of-stream marker. The decoder walks the
//! markers forward, resolves each grain table as it is found and writes the
//! disk in virtual order, zero-filling unallocated ranges. The output is
//! exactly the disk capacity long.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`vmdk`] - Extent format, layout resolution, marker walk, grain tables
//! - [`decoder`] - The decoder and its progress and summary types
//! - [`emit`] - Ordered output with zero-fill and SHA-256 digest
//! - [`options`] - Decode options and cancellation
//! - [`pipeline`] - Ordered parallel processing for grain decompression
//! - [`convert`] - Disk descriptor conversion entry point
//!
//! # Quick Start
//!
//! ```no_run
//! use vmdkraw_core::{convert_disk, DecodeOptions, DiskDescriptor};
//! use std::fs::File;
//!
//! let disk = DiskDescriptor::vmdk("/path/to/disk1.vmdk");
//! let out = File::create("/path/to/disk1.raw").unwrap();
//! let summary = convert_disk(&disk, out, &DecodeOptions::default(), None).unwrap();
//! println!("wrote {} bytes", summary.bytes_emitted);
//! ```

pub mod convert;
pub mod decoder;
pub mod emit;
pub mod error;
pub mod options;
pub mod pipeline;
pub mod vmdk;

pub use error::{Error, ErrorKind, Result};

pub use convert::{convert_disk, DiskDescriptor, VMDK_FORMAT};
pub use decoder::{DecodeProgress, DecodeSummary, ProgressCallback, VmdkDecoder};
pub use emit::{compute_sha256, OutputEmitter};
pub use options::{CancelToken, DecodeOptions, GrainLengthPolicy, ZeroGrainSize};
