//! Random-access sources for extent data.
//!
//! The decoder reads the extent through [`ExtentSource`], a positioned-read
//! interface. Files are memory-mapped; in-memory buffers implement the trait
//! directly so tests and callers holding an image need no file.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Positioned, read-only access to an extent.
pub trait ExtentSource {
    /// Returns the size of the source in bytes.
    fn len(&self) -> u64;

    /// Copies bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied, which is less than `buf.len()`
    /// only when the source ends first.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Returns true if the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExtentSource for [u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(copy_from(self, offset, buf))
    }
}

impl ExtentSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(copy_from(self, offset, buf))
    }
}

impl<S: ExtentSource + ?Sized> ExtentSource for &S {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

fn copy_from(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    if offset >= data.len() as u64 {
        return 0;
    }
    let start = offset as usize;
    let count = buf.len().min(data.len() - start);
    buf[..count].copy_from_slice(&data[start..start + count]);
    count
}

/// Reads exactly `len` bytes at `offset`.
///
/// A source that ends first yields `TruncatedStream`. The range is checked
/// against the source length before anything is allocated.
pub fn read_exact_at<S: ExtentSource + ?Sized>(source: &S, offset: u64, len: usize) -> Result<Vec<u8>> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= source.len() => {}
        _ => return Err(Error::truncated(offset, len as u64, source.len())),
    }
    let mut buf = vec![0u8; len];
    let read = source.read_at(offset, &mut buf)?;
    if read < len {
        return Err(Error::truncated(offset, len as u64, source.len()));
    }
    Ok(buf)
}

/// Reads up to `len` bytes at `offset`, returning fewer at the end of the source.
pub fn read_up_to<S: ExtentSource + ?Sized>(source: &S, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let read = source.read_at(offset, &mut buf)?;
    buf.truncate(read);
    Ok(buf)
}

/// A memory-mapped extent file.
///
/// The operating system manages caching and paging, so random grain reads
/// driven by the grain tables cost no extra syscalls.
///
/// # Example
///
/// ```no_run
/// use vmdkraw_core::vmdk::{ExtentSource, MappedExtent};
/// use std::path::Path;
///
/// let extent = MappedExtent::open(Path::new("disk1.vmdk")).unwrap();
/// println!("Extent size: {} bytes", extent.len());
/// ```
pub struct MappedExtent {
    /// The memory-mapped file data; `None` for an empty file.
    mmap: Option<Arc<Mmap>>,
    /// Path the extent was opened from.
    path: PathBuf,
}

impl MappedExtent {
    /// Opens and memory-maps an extent file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error carrying the path if the file cannot be opened
    /// or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();

        // Mapping a zero-length file fails on some platforms.
        if size == 0 {
            return Ok(Self {
                mmap: None,
                path: path.to_path_buf(),
            });
        }

        // Safety: the file is opened read-only and the mapping is never written.
        // The extent must not be modified by another process during conversion.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        Ok(Self {
            mmap: Some(Arc::new(mmap)),
            path: path.to_path_buf(),
        })
    }

    /// Returns the path the extent was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the raw mapped bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        match &self.mmap {
            Some(mmap) => &mmap[..],
            None => &[],
        }
    }
}

impl ExtentSource for MappedExtent {
    fn len(&self) -> u64 {
        self.data().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(copy_from(self.data(), offset, buf))
    }
}
