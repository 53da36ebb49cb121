//! Threshold-gated payload compression.
//!
//! Payloads larger than the configured threshold are gzip-compressed. The
//! engine never decompresses on behalf of a client: notifications carry an
//! explicit flag and the algorithm name so the transport side can undo it.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

/// Highest gzip level accepted by `flate2`.
const MAX_LEVEL: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
        }
    }
}

/// Result of [`maybe_compress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionOutcome {
    pub bytes: Vec<u8>,
    pub was_compressed: bool,
    pub original_size: usize,
}

impl CompressionOutcome {
    pub fn algorithm(&self) -> Option<CompressionAlgorithm> {
        self.was_compressed.then_some(CompressionAlgorithm::Gzip)
    }
}

/// Compress `payload` when it is larger than `threshold` bytes.
///
/// The payload is returned untouched when it is at or below the threshold, or
/// when gzip output would not be smaller than the input.
pub fn maybe_compress(payload: &[u8], threshold: usize, level: u32) -> io::Result<CompressionOutcome> {
    let original_size = payload.len();
    if original_size <= threshold {
        return Ok(CompressionOutcome {
            bytes: payload.to_vec(),
            was_compressed: false,
            original_size,
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(MAX_LEVEL)));
    encoder.write_all(payload)?;
    let compressed = encoder.finish()?;

    if compressed.len() >= original_size {
        tracing::trace!(
            original_size,
            compressed_size = compressed.len(),
            "Compression did not shrink payload, sending uncompressed"
        );
        return Ok(CompressionOutcome {
            bytes: payload.to_vec(),
            was_compressed: false,
            original_size,
        });
    }

    Ok(CompressionOutcome {
        bytes: compressed,
        was_compressed: true,
        original_size,
    })
}

/// Inverse of [`maybe_compress`] for compressed payloads.
pub fn decompress(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_left_alone() {
        let outcome = maybe_compress(b"{\"a\":1}", 1024, 6).unwrap();

        assert!(!outcome.was_compressed);
        assert_eq!(outcome.bytes, b"{\"a\":1}");
        assert_eq!(outcome.algorithm(), None);
    }

    #[test]
    fn large_payload_is_compressed_and_smaller() {
        let payload = "resource-data ".repeat(500);

        let outcome = maybe_compress(payload.as_bytes(), 1024, 6).unwrap();

        assert!(outcome.was_compressed);
        assert!(outcome.bytes.len() < outcome.original_size);
        assert_eq!(outcome.algorithm(), Some(CompressionAlgorithm::Gzip));
        assert_eq!(decompress(&outcome.bytes).unwrap(), payload.as_bytes());
    }

    #[test]
    fn payload_equal_to_threshold_is_not_compressed() {
        let payload = vec![b'a'; 64];
        assert!(!maybe_compress(&payload, 64, 6).unwrap().was_compressed);
    }

    #[test]
    fn out_of_range_level_is_clamped() {
        let payload = "x".repeat(4096);
        let outcome = maybe_compress(payload.as_bytes(), 16, 42).unwrap();
        assert!(outcome.was_compressed);
    }
}
