//! Streaming grain decompression.
//!
//! A grain payload is fed to an incremental DEFLATE decoder in fixed-size
//! chunks, so the compressed span never has to be held in memory at once.
//! VMware tools frame grains as zlib streams; some exporters write raw
//! DEFLATE. The framing is detected from the first two payload bytes.

use flate2::{Decompress, FlushDecompress, Status};

use super::source::ExtentSource;
use crate::error::{Error, Result};

/// Default size of each compressed read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Smallest chunk size accepted; framing detection needs the first bytes in one chunk.
pub const MIN_READ_CHUNK_SIZE: usize = 512;

/// A grain may inflate to at most this multiple of its expected length.
const MAX_EXPANSION_FACTOR: usize = 16;

/// Returns true if `data` starts with a zlib (RFC 1950) header without a preset dictionary.
pub fn is_zlib_header(data: &[u8]) -> bool {
    if data.len() < 2 {
        return false;
    }
    let cmf = data[0];
    let flg = data[1];
    cmf & 0x0F == 8 && cmf >> 4 <= 7 && flg & 0x20 == 0 && (u16::from(cmf) << 8 | u16::from(flg)) % 31 == 0
}

/// Incremental inflate of one grain.
struct StreamingInflate {
    decoder: Option<Decompress>,
    output: Vec<u8>,
    limit: usize,
    offset: u64,
    finished: bool,
}

impl StreamingInflate {
    fn new(offset: u64, expected_len: usize) -> Self {
        Self {
            decoder: None,
            output: Vec::with_capacity(expected_len),
            limit: expected_len.max(MIN_READ_CHUNK_SIZE).saturating_mul(MAX_EXPANSION_FACTOR),
            offset,
            finished: false,
        }
    }

    /// Feeds one chunk of compressed input.
    ///
    /// Bytes after the end of the DEFLATE stream are sector padding and are ignored.
    fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if self.finished || chunk.is_empty() {
            return Ok(());
        }
        let decoder = self
            .decoder
            .get_or_insert_with(|| Decompress::new(is_zlib_header(chunk)));
        self.finished = feed(
            decoder,
            chunk,
            &mut self.output,
            FlushDecompress::None,
            self.offset,
            self.limit,
        )?;
        Ok(())
    }

    /// Flushes the decoder and returns the grain.
    fn finish(mut self) -> Result<Vec<u8>> {
        if !self.finished {
            let decoder = self
                .decoder
                .as_mut()
                .ok_or_else(|| Error::decompression(self.offset, "empty compressed payload"))?;
            let done = feed(
                decoder,
                &[],
                &mut self.output,
                FlushDecompress::Finish,
                self.offset,
                self.limit,
            )?;
            if !done {
                return Err(Error::decompression(
                    self.offset,
                    "unexpected end of compressed data",
                ));
            }
        }
        Ok(self.output)
    }
}

/// Runs the decoder over `input` until it is consumed or the stream ends.
///
/// Returns true once the DEFLATE stream has ended.
fn feed(
    decoder: &mut Decompress,
    mut input: &[u8],
    output: &mut Vec<u8>,
    flush: FlushDecompress,
    offset: u64,
    limit: usize,
) -> Result<bool> {
    loop {
        if output.len() == output.capacity() {
            if output.len() >= limit {
                return Err(Error::decompression(
                    offset,
                    format!("grain inflates beyond {} bytes", limit),
                ));
            }
            let additional = output
                .capacity()
                .max(MIN_READ_CHUNK_SIZE)
                .min(limit - output.len());
            output.reserve(additional);
        }

        let in_before = decoder.total_in();
        let out_before = decoder.total_out();
        let status = decoder
            .decompress_vec(input, output, flush)
            .map_err(|e| Error::decompression(offset, e.to_string()))?;
        let consumed = (decoder.total_in() - in_before) as usize;
        let produced = decoder.total_out() - out_before;
        input = &input[consumed..];

        match status {
            Status::StreamEnd => return Ok(true),
            Status::Ok | Status::BufError => {
                let has_room = output.len() < output.capacity();
                if has_room && (input.is_empty() || (consumed == 0 && produced == 0)) {
                    return Ok(false);
                }
            }
        }
    }
}

/// Reads and inflates grain payloads from an extent.
///
/// One inflater is created per conversion job; its read buffer is reused
/// for every grain.
pub struct GrainInflater {
    chunk: Vec<u8>,
}

impl GrainInflater {
    /// Creates an inflater reading `chunk_size` compressed bytes at a time.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk: vec![0u8; chunk_size.max(MIN_READ_CHUNK_SIZE)],
        }
    }

    /// Returns the compressed read size.
    pub fn chunk_size(&self) -> usize {
        self.chunk.len()
    }

    /// Inflates the `size` compressed bytes stored at `offset`.
    ///
    /// `expected_len` sizes the output buffer; the result is not required to
    /// match it.
    pub fn inflate<S: ExtentSource + ?Sized>(
        &mut self,
        source: &S,
        offset: u64,
        size: u64,
        expected_len: usize,
    ) -> Result<Vec<u8>> {
        let end = offset.checked_add(size).unwrap_or(u64::MAX);
        if end > source.len() {
            return Err(Error::truncated(offset, size, source.len()));
        }

        let mut inflate = StreamingInflate::new(offset, expected_len);
        let mut position = offset;
        while position < end && !inflate.finished {
            let want = (end - position).min(self.chunk.len() as u64) as usize;
            let read = source.read_at(position, &mut self.chunk[..want])?;
            if read == 0 {
                return Err(Error::truncated(position, end - position, source.len()));
            }
            inflate.push(&self.chunk[..read])?;
            position += read as u64;
        }
        inflate.finish()
    }
}

/// Inflates a payload already held in memory, in `chunk_size` steps.
///
/// `offset` is the payload's position in the extent, used for error context.
pub fn inflate_payload(payload: &[u8], offset: u64, chunk_size: usize, expected_len: usize) -> Result<Vec<u8>> {
    let mut inflate = StreamingInflate::new(offset, expected_len);
    for chunk in payload.chunks(chunk_size.max(MIN_READ_CHUNK_SIZE)) {
        if inflate.finished {
            break;
        }
        inflate.push(chunk)?;
    }
    inflate.finish()
}
