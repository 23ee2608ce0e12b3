//! Ordered output with zero-fill and digest.
//!
//! Everything the decoder produces goes through [`OutputEmitter`]: grain
//! data, zero-filled gaps for unallocated grains, and the tail up to the
//! disk capacity. The emitter is the only writer to the sink. It never
//! writes past the capacity and hashes exactly the bytes it writes.

use std::fmt::Write as _;
use std::io::Write;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Size of the reusable zero buffer.
const ZERO_BUFFER_LEN: usize = 64 * 1024;

/// Computes the SHA-256 hash of data and returns it as a lowercase hex string.
pub fn compute_sha256(data: &[u8]) -> String {
    hex_digest(Sha256::digest(data).as_slice())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(hex, "{:02x}", b);
    }
    hex
}

/// Writes the raw image to a sink in virtual order.
pub struct OutputEmitter<W: Write> {
    sink: W,
    position: u64,
    limit: u64,
    hasher: Sha256,
    zeros: Vec<u8>,
}

impl<W: Write> OutputEmitter<W> {
    /// Creates an emitter that writes at most `limit` bytes to `sink`.
    pub fn new(sink: W, limit: u64) -> Self {
        Self {
            sink,
            position: 0,
            limit,
            hasher: Sha256::new(),
            zeros: Vec::new(),
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left before the limit.
    pub fn remaining(&self) -> u64 {
        self.limit - self.position
    }

    /// Returns true once the limit has been reached.
    pub fn is_full(&self) -> bool {
        self.position >= self.limit
    }

    /// Writes `data`, cut short at the limit.
    ///
    /// Returns the number of bytes written.
    pub fn emit(&mut self, data: &[u8]) -> Result<u64> {
        let take = (data.len() as u64).min(self.remaining()) as usize;
        if take == 0 {
            return Ok(0);
        }
        let data = &data[..take];
        self.sink.write_all(data).map_err(|source| Error::SinkWrite {
            position: self.position,
            source,
        })?;
        self.hasher.update(data);
        self.position += take as u64;
        Ok(take as u64)
    }

    /// Writes `len` zero bytes, cut short at the limit.
    pub fn fill_zeros(&mut self, len: u64) -> Result<u64> {
        let mut left = len.min(self.remaining());
        if left == 0 {
            return Ok(0);
        }
        if self.zeros.is_empty() {
            self.zeros = vec![0u8; ZERO_BUFFER_LEN];
        }
        let zeros = std::mem::take(&mut self.zeros);
        let mut written = 0;
        let result = loop {
            if left == 0 {
                break Ok(written);
            }
            let step = left.min(zeros.len() as u64) as usize;
            match self.emit(&zeros[..step]) {
                Ok(n) => {
                    written += n;
                    left -= n;
                }
                Err(e) => break Err(e),
            }
        };
        self.zeros = zeros;
        result
    }

    /// Writes zeros until the output reaches `target` bytes.
    pub fn fill_zeros_to(&mut self, target: u64) -> Result<u64> {
        self.fill_zeros(target.saturating_sub(self.position))
    }

    /// Zero-fills up to the limit, flushes the sink, and returns it with the
    /// hex SHA-256 of the output and the number of bytes written.
    pub fn finish(mut self) -> Result<(W, String, u64)> {
        self.fill_zeros_to(self.limit)?;
        self.sink.flush().map_err(|source| Error::SinkWrite {
            position: self.position,
            source,
        })?;
        let digest = hex_digest(self.hasher.finalize().as_slice());
        Ok((self.sink, digest, self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct FailingSink {
        accept: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accept == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.accept);
            self.accept -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sha256_computation() {
        assert_eq!(
            compute_sha256(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hex_digest() {
        assert_eq!(hex_digest(&[0x00, 0x0f, 0xa0, 0xff]), "000fa0ff");
        assert_eq!(hex_digest(&[]), "");
        assert_eq!(compute_sha256(b"").len(), 64);
    }

    #[test]
    fn test_emit_and_finish() {
        let mut emitter = OutputEmitter::new(Vec::new(), 11);
        emitter.emit(b"hello").unwrap();
        emitter.emit(b" ").unwrap();
        emitter.emit(b"world").unwrap();
        assert!(emitter.is_full());

        let (inner, hash, bytes) = emitter.finish().unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(bytes, 11);
        assert_eq!(inner, b"hello world");
    }

    #[test]
    fn test_emit_stops_at_limit() {
        let mut emitter = OutputEmitter::new(Vec::new(), 6);
        assert_eq!(emitter.emit(b"abcd").unwrap(), 4);
        assert_eq!(emitter.emit(b"efgh").unwrap(), 2);
        assert_eq!(emitter.emit(b"ijkl").unwrap(), 0);
        let (inner, _, bytes) = emitter.finish().unwrap();
        assert_eq!(inner, b"abcdef");
        assert_eq!(bytes, 6);
    }

    #[test]
    fn test_finish_zero_fills_tail() {
        let mut emitter = OutputEmitter::new(Vec::new(), 200_000);
        emitter.emit(&[0xFF; 10]).unwrap();
        let (inner, hash, bytes) = emitter.finish().unwrap();

        let mut expected = vec![0xFFu8; 10];
        expected.resize(200_000, 0);
        assert_eq!(bytes, 200_000);
        assert_eq!(inner, expected);
        assert_eq!(hash, compute_sha256(&expected));
    }

    #[test]
    fn test_fill_zeros_to_is_noop_when_behind() {
        let mut emitter = OutputEmitter::new(Vec::new(), 100);
        emitter.emit(&[1u8; 50]).unwrap();
        assert_eq!(emitter.fill_zeros_to(20).unwrap(), 0);
        assert_eq!(emitter.fill_zeros_to(70).unwrap(), 20);
        assert_eq!(emitter.position(), 70);
    }

    #[test]
    fn test_sink_failure_reports_position() {
        let mut emitter = OutputEmitter::new(FailingSink { accept: 8 }, 100);
        emitter.emit(&[1u8; 8]).unwrap();
        let err = emitter.emit(&[2u8; 8]).unwrap_err();
        assert!(matches!(err, Error::SinkWrite { position: 8, .. }));
    }
}
