//! Decode options and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::vmdk::format::{LEGACY_GRAIN_SECTORS, SECTOR_SIZE};
use crate::vmdk::inflate::DEFAULT_READ_CHUNK_SIZE;

/// How many bytes an unallocated grain table entry expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroGrainSize {
    /// The grain size recorded in the extent.
    #[default]
    FromHeader,
    /// A fixed 128 sectors, as older tools did regardless of the header.
    Legacy,
}

impl ZeroGrainSize {
    /// Returns the zero grain length in bytes for an extent with the given grain size.
    pub fn bytes(self, grain_size_bytes: u64) -> u64 {
        match self {
            ZeroGrainSize::FromHeader => grain_size_bytes,
            ZeroGrainSize::Legacy => LEGACY_GRAIN_SECTORS * SECTOR_SIZE,
        }
    }
}

/// What to do when a grain inflates to something other than the grain size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrainLengthPolicy {
    /// Log a warning and emit the bytes as produced.
    #[default]
    Lenient,
    /// Fail the job with [`Error::GrainLength`].
    Strict,
}

/// A cloneable flag that aborts a running decode.
///
/// Clones share the flag, so a token can be handed to a signal handler or
/// another thread while the decode holds its own copy.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Options for a decode job.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Worker threads for grain decompression (1 = sequential, 0 = auto).
    pub threads: usize,
    /// Size of each compressed read fed to the inflater.
    pub read_chunk_size: usize,
    /// Size of a synthesized zero grain.
    pub zero_grain: ZeroGrainSize,
    /// Handling of grains that inflate to an unexpected length.
    pub grain_length: GrainLengthPolicy,
    /// Cancellation flag checked before each marker and each grain.
    pub cancel: CancelToken,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            zero_grain: ZeroGrainSize::default(),
            grain_length: GrainLengthPolicy::default(),
            cancel: CancelToken::new(),
        }
    }
}

impl DecodeOptions {
    /// Options that decode on the calling thread only.
    pub fn sequential() -> Self {
        Self::default()
    }

    /// Options that decompress on `threads` workers (0 = one per core).
    pub fn parallel(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    /// Sets the cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}
