//! Wire format of documents held by serializing stores
//!
//! ```text
//! +------+-----------------+------------------------------+
//! | flag | crc32 (LE, u32) | bincode document, compressed |
//! +------+-----------------+------------------------------+
//! ```
//!
//! The flag names the compression of the payload (0 raw, 1 zstd, 2 lz4) and
//! the checksum covers the uncompressed bincode bytes.

use crate::document::HttpDocument;
use crate::error::{CacheError, Result};
use crate::pool;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

const HEADER_LEN: usize = 5;

/// Compression algorithm for stored documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Zstd,
    Lz4,
}

impl CompressionAlgorithm {
    fn flag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Zstd => 1,
            CompressionAlgorithm::Lz4 => 2,
        }
    }

    fn from_flag(flag: u8) -> Result<Self> {
        match flag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Zstd),
            2 => Ok(CompressionAlgorithm::Lz4),
            other => Err(CacheError::SerializationError(format!(
                "unknown compression flag {}",
                other
            ))),
        }
    }
}

/// Compression settings for stored documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: CompressionAlgorithm,

    /// 1-22 for zstd, 1-12 for lz4
    #[serde(default = "default_level")]
    pub level: i32,

    /// Payloads smaller than this are stored raw
    #[serde(default = "default_min_size")]
    pub min_size: usize,
}

fn default_algorithm() -> CompressionAlgorithm {
    CompressionAlgorithm::Zstd
}

fn default_level() -> i32 {
    3
}

fn default_min_size() -> usize {
    1024
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            level: default_level(),
            min_size: default_min_size(),
        }
    }
}

fn compression_error(e: std::io::Error) -> CacheError {
    CacheError::CompressionError(e.to_string())
}

fn compress(algorithm: CompressionAlgorithm, level: i32, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => {
            let mut encoder = zstd::Encoder::new(Vec::new(), level).map_err(compression_error)?;
            encoder.write_all(data).map_err(compression_error)?;
            encoder.finish().map_err(compression_error)
        }
        CompressionAlgorithm::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new()
                .level(level.max(0) as u32)
                .build(Vec::new())
                .map_err(compression_error)?;
            encoder.write_all(data).map_err(compression_error)?;
            let (compressed, result) = encoder.finish();
            result.map_err(compression_error)?;
            Ok(compressed)
        }
    }
}

fn decompress(algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match algorithm {
        CompressionAlgorithm::None => out.extend_from_slice(data),
        CompressionAlgorithm::Zstd => {
            let mut decoder = zstd::Decoder::new(data).map_err(compression_error)?;
            decoder.read_to_end(&mut out).map_err(compression_error)?;
        }
        CompressionAlgorithm::Lz4 => {
            let mut decoder = lz4::Decoder::new(data).map_err(compression_error)?;
            decoder.read_to_end(&mut out).map_err(compression_error)?;
        }
    }
    Ok(out)
}

/// Serialize a document for storage
///
/// With `compress` unset, or when compression would not shrink the payload,
/// the document is stored raw.
pub fn encode_document(doc: &HttpDocument, compress_payload: bool, config: &CompressionConfig) -> Result<Bytes> {
    let mut buf = pool::get_buffer();
    let encoded = bincode::serialize_into(&mut buf, doc)
        .map_err(CacheError::from)
        .and_then(|_| {
            let checksum = crc32fast::hash(&buf);
            let algorithm = if compress_payload && buf.len() >= config.min_size {
                config.algorithm
            } else {
                CompressionAlgorithm::None
            };

            let compressed = match algorithm {
                CompressionAlgorithm::None => None,
                _ => Some(compress(algorithm, config.level, &buf)?).filter(|c| c.len() < buf.len()),
            };
            let (flag, payload): (u8, &[u8]) = match &compressed {
                Some(c) => {
                    debug!("Compressed document {} -> {} bytes", buf.len(), c.len());
                    (algorithm.flag(), c.as_slice())
                }
                None => (CompressionAlgorithm::None.flag(), buf.as_slice()),
            };

            let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
            out.put_u8(flag);
            out.put_u32_le(checksum);
            out.put_slice(payload);
            Ok(out.freeze())
        });
    pool::put_buffer(buf);
    encoded
}

/// Deserialize a stored document, verifying its checksum
pub fn decode_document(data: &[u8]) -> Result<HttpDocument> {
    if data.len() < HEADER_LEN {
        return Err(CacheError::SerializationError(format!(
            "stored document too short: {} bytes",
            data.len()
        )));
    }
    let algorithm = CompressionAlgorithm::from_flag(data[0])?;
    let expected = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    let payload = decompress(algorithm, &data[HEADER_LEN..])?;

    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(CacheError::ChecksumMismatch { expected, actual });
    }

    let mut doc: HttpDocument = bincode::deserialize(&payload)?;
    doc.load_range_parts();
    doc.is_loaded = true;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn large_doc() -> HttpDocument {
        let mut doc = HttpDocument::new(200, HeaderMap::new());
        doc.set_body(Bytes::from(
            b"This is a test string that should compress well. ".repeat(100),
        ));
        doc
    }

    #[test]
    fn test_raw_roundtrip() {
        let doc = large_doc();
        let encoded = encode_document(&doc, false, &CompressionConfig::default()).unwrap();
        assert_eq!(encoded[0], 0);
        let decoded = decode_document(&encoded).unwrap();
        assert_eq!(decoded.body, doc.body);
        assert!(decoded.is_loaded);
    }

    #[test]
    fn test_zstd_and_lz4() {
        let doc = large_doc();
        for (algorithm, flag) in [(CompressionAlgorithm::Zstd, 1u8), (CompressionAlgorithm::Lz4, 2u8)] {
            let config = CompressionConfig {
                algorithm,
                level: 3,
                min_size: 10,
            };
            let encoded = encode_document(&doc, true, &config).unwrap();
            assert_eq!(encoded[0], flag);
            assert!(encoded.len() < doc.body.len());
            assert_eq!(decode_document(&encoded).unwrap().body, doc.body);
        }
    }

    #[test]
    fn test_corruption_detected() {
        let encoded = encode_document(&large_doc(), false, &CompressionConfig::default()).unwrap();
        let mut corrupt = encoded.to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;
        let err = decode_document(&corrupt).unwrap_err();
        assert!(err.is_corrupt_entry());

        assert!(decode_document(&[0, 1]).is_err());
        assert!(decode_document(&[9, 0, 0, 0, 0]).is_err());
    }
}
