//! Error types for the tiered cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// A tier cannot make room for an entry even after evicting everything evictable
    #[error("Tier {tier} cannot fit {requested} bytes (capacity {capacity} bytes)")]
    CapacityExceeded {
        tier: String,
        requested: u64,
        capacity: u64,
    },

    // =========================================================================
    // Codec Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Checksum mismatch on read
    #[error("Entry {key} failed checksum verification")]
    CorruptEntry { key: String },

    // =========================================================================
    // Tier / Backend Errors
    // =========================================================================
    /// Requested tier is not configured on this manager
    #[error("Tier {0} is not configured")]
    TierUnavailable(String),

    /// Persistent or remote backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Remote tier did not answer in time
    #[error("Remote tier {tier} timed out after {timeout_ms}ms")]
    RemoteTimeout { tier: String, timeout_ms: u64 },

    // =========================================================================
    // Warmup Errors
    // =========================================================================
    /// Caller-supplied loader failed for a key
    #[error("Loader failed for key {key}: {reason}")]
    LoaderFailure { key: String, reason: String },

    /// Warmup queue is at capacity
    #[error("Warmup queue is full")]
    WarmupQueueFull,

    /// Manager has been shut down
    #[error("Cache manager is shut down")]
    ShutDown,

    // =========================================================================
    // Configuration / Plumbing Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for compression/encryption transform failures
    pub fn is_codec_failure(&self) -> bool {
        matches!(
            self,
            Error::CompressionFailed { .. }
                | Error::DecompressionFailed { .. }
                | Error::EncryptionFailed(_)
                | Error::DecryptionFailed(_)
        )
    }

    /// True when the error is a budget rejection from a tier
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }
}
