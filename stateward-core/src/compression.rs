/*!
Compression adapters for state and collection payloads.

Payloads are JSON text. Compressed output is gzip bytes encoded as a hex
string so it can sit in any tier that only stores text.
*/

use crate::{Result, StatewardError};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression abstraction for payload data
///
/// Implementations run inside the background delegate thread, so they
/// must be shareable across threads.
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use stateward_core::compression::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = b"{\"forms\":{}}";
/// let compressed = compressor.compress(data)?;
/// assert_eq!(compressor.decompress(&compressed)?, data);
/// # Ok::<(), stateward_core::StatewardError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a gzip compressor at maximum level (9)
    pub fn new() -> Self {
        Self::with_level(9)
    }

    /// Create a new gzip compressor with the specified compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Create a compressor for fast compression (level 1)
    pub fn fast() -> Self {
        Self::with_level(1)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            StatewardError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| StatewardError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| StatewardError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Pass-through adapter, useful in tests
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

/// Result of compressing a text payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedText {
    /// Hex-encoded compressed bytes
    pub encoded: String,
    pub original_size: usize,
    pub compressed_size: usize,
    /// Percentage saved, e.g. 82.5
    pub ratio: f64,
    /// Label of whoever asked for the compression ("appState", a collection name)
    pub context: String,
}

/// Compress text and encode the result for text-only storage
pub fn compress_text(
    adapter: &dyn CompressionAdapter,
    text: &str,
    context: &str,
) -> Result<CompressedText> {
    let compressed = adapter.compress(text.as_bytes())?;
    let original_size = text.len();
    let compressed_size = compressed.len();
    let ratio = if original_size == 0 {
        0.0
    } else {
        let saved = 1.0 - compressed_size as f64 / original_size as f64;
        (saved * 10_000.0).round() / 100.0
    };

    Ok(CompressedText {
        encoded: hex::encode(compressed),
        original_size,
        compressed_size,
        ratio,
        context: context.to_string(),
    })
}

/// Decode and decompress text produced by [`compress_text`]
pub fn decompress_text(adapter: &dyn CompressionAdapter, encoded: &str) -> Result<String> {
    let bytes = hex::decode(encoded.trim())
        .map_err(|e| StatewardError::compression(format!("Invalid compressed encoding: {e}")))?;
    let decompressed = adapter.decompress(&bytes)?;

    String::from_utf8(decompressed)
        .map_err(|e| StatewardError::compression(format!("Decompressed payload is not UTF-8: {e}")))
}
