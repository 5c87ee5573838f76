//! Error types for the object proxy cache

use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error types that can occur while serving a request through the cache
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("key not found in cache")]
    KeyNotFound,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Upstream timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Range reconstruction error: {0}")]
    ReconstructionError(String),

    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("short write: {written} of {requested} bytes accepted")]
    ShortWrite { written: usize, requested: usize },

    #[error("{} operations failed: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<CacheError>),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

fn join_errors(errors: &[CacheError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CacheError::Timeout(err.to_string())
        } else {
            CacheError::UpstreamError(err.to_string())
        }
    }
}

impl CacheError {
    /// Whether this error only means the key is absent from the cache
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::KeyNotFound)
    }

    /// Convert error to HTTP status code
    ///
    /// Maps internal errors to the status returned to the client:
    /// - Upstream transport failures: 502 Bad Gateway
    /// - Upstream timeouts: 504 Gateway Timeout
    /// - Invalid client input: 400 / 416
    /// - Everything else: 500 Internal Server Error
    pub fn to_http_status(&self) -> u16 {
        match self {
            CacheError::UpstreamError(_) => 502,
            CacheError::Timeout(_) => 504,
            CacheError::InvalidRange(_) => 416,
            CacheError::ParseError(_) => 400,
            CacheError::Multiple(errors) => errors
                .first()
                .map(|e| e.to_http_status())
                .unwrap_or(500),
            CacheError::KeyNotFound
            | CacheError::ConfigError(_)
            | CacheError::SerializationError(_)
            | CacheError::CompressionError(_)
            | CacheError::ChecksumMismatch { .. }
            | CacheError::ReconstructionError(_)
            | CacheError::StorageError(_)
            | CacheError::ShortWrite { .. }
            | CacheError::IoError(_)
            | CacheError::InternalError(_) => 500,
        }
    }

    /// Determine if the request should skip the cache and go straight upstream
    ///
    /// Returns true for malformed client input, where the cache cannot be
    /// consulted but the origin may still know what to do with the request.
    pub fn bypass_cache(&self) -> bool {
        matches!(self, CacheError::InvalidRange(_) | CacheError::ParseError(_))
    }

    /// Whether a cached entry that produced this error should be discarded
    pub fn is_corrupt_entry(&self) -> bool {
        matches!(
            self,
            CacheError::SerializationError(_)
                | CacheError::CompressionError(_)
                | CacheError::ChecksumMismatch { .. }
        )
    }

    /// Fold a list of errors into a single one, or `Ok(())` if empty
    pub fn from_many(mut errors: Vec<CacheError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CacheError::Multiple(errors)),
        }
    }
}
