//! Entry Codec
//!
//! Reversible transforms applied to values on their way into a tier:
//! compression first, then encryption. Decoding runs in the opposite order.
//! The checksum is computed over the plaintext so corruption detection does
//! not depend on which transforms were applied.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tiercache::cache::{AesGcmCipher, CacheStrategy, EntryCodec};
//!
//! let codec = EntryCodec::new(Arc::new(AesGcmCipher::generate().unwrap()));
//! let strategy = CacheStrategy::memory().compressed().encrypted();
//!
//! let stored = codec.encode(b"listing payload", &strategy).unwrap();
//! let restored = codec.decode(&stored, &strategy).unwrap();
//! assert_eq!(restored.as_ref(), b"listing payload");
//! ```

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::entry::{CacheEntry, CacheStrategy};
use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Algorithm tag written as the first byte of a compressed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// Stored as-is inside the frame
    None,
    /// LZ4 block compression
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            other => Err(Error::DecompressionFailed {
                algorithm: "frame".into(),
                reason: format!("unknown algorithm tag {}", other),
            }),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for the compression stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Values smaller than this are framed but left uncompressed
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: 64,
            level: 4,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::with_level(CompressionConfig::default().level)
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Cipher Trait
// =============================================================================

/// Pluggable reversible encryption transform
pub trait Cipher: Send + Sync {
    /// Get human-readable name
    fn name(&self) -> &'static str;

    /// Encrypt plaintext
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt ciphertext produced by [`Cipher::encrypt`]
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Length of the AES-GCM nonce prefix
const NONCE_LEN: usize = 12;

/// AES-256-GCM with a random nonce prefixed to every ciphertext
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Create from a 256-bit key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Create from a 64-character hex key
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let raw = hex::decode(key_hex.trim())
            .map_err(|e| Error::Config(format!("invalid encryption key: {}", e)))?;
        let key: [u8; 32] = raw.try_into().map_err(|raw: Vec<u8>| {
            Error::Config(format!(
                "encryption key must be 32 bytes, got {}",
                raw.len()
            ))
        })?;
        Ok(Self::new(&key))
    }

    /// Create with a random process-local key
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut key)
            .map_err(|e| Error::EncryptionFailed(format!("key generation failed: {}", e)))?;
        Ok(Self::new(&key))
    }
}

impl Cipher for AesGcmCipher {
    fn name(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| Error::EncryptionFailed(format!("nonce generation failed: {}", e)))?;

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(Error::DecryptionFailed(format!(
                "ciphertext shorter than nonce ({} bytes)",
                ciphertext.len()
            )));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| Error::DecryptionFailed(e.to_string()))
    }
}

// =============================================================================
// Entry Codec
// =============================================================================

/// Applies and reverses the strategy's transforms
pub struct EntryCodec {
    config: CompressionConfig,
    lz4: Lz4Compressor,
    cipher: Arc<dyn Cipher>,
}

impl EntryCodec {
    /// Create a codec with default compression settings
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        Self::with_config(CompressionConfig::default(), cipher)
    }

    pub fn with_config(config: CompressionConfig, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            config,
            cipher,
        }
    }

    /// Checksum over plaintext bytes
    #[inline]
    pub fn checksum(value: &[u8]) -> u64 {
        xxhash_rust::xxh3::xxh3_64(value)
    }

    /// Compress (if enabled) then encrypt (if enabled)
    pub fn encode(&self, value: &[u8], strategy: &CacheStrategy) -> Result<Bytes> {
        let mut out = if strategy.compression {
            self.compress_frame(value)?
        } else {
            value.to_vec()
        };
        if strategy.encryption {
            out = self.cipher.encrypt(&out)?;
        }
        Ok(Bytes::from(out))
    }

    /// Decrypt (if enabled) then decompress (if enabled)
    pub fn decode(&self, stored: &[u8], strategy: &CacheStrategy) -> Result<Bytes> {
        let plain = if strategy.encryption {
            self.cipher.decrypt(stored)?
        } else {
            stored.to_vec()
        };
        if strategy.compression {
            Ok(Bytes::from(self.decompress_frame(&plain)?))
        } else {
            Ok(Bytes::from(plain))
        }
    }

    /// Decode an entry and verify its checksum
    pub fn open(&self, entry: &CacheEntry) -> Result<Bytes> {
        let value = self.decode(&entry.value, &entry.strategy)?;
        if Self::checksum(&value) != entry.checksum {
            return Err(Error::CorruptEntry {
                key: entry.key.clone(),
            });
        }
        Ok(value)
    }

    /// True if the entry decodes and matches its checksum
    pub fn verify(&self, entry: &CacheEntry) -> bool {
        self.open(entry).is_ok()
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    fn compress_frame(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        if (data.len() as u64) >= self.config.min_size_bytes {
            let compressed = self.lz4.compress(data)?;
            // Only keep the compressed form when it actually helps
            if compressed.len() < data.len() {
                frame.push(self.lz4.algorithm().tag());
                frame.extend_from_slice(&compressed);
                return Ok(frame);
            }
        }
        frame.push(CompressionAlgorithm::None.tag());
        frame.extend_from_slice(data);
        Ok(frame)
    }

    fn decompress_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let (tag, payload) = frame.split_first().ok_or_else(|| Error::DecompressionFailed {
            algorithm: "frame".into(),
            reason: "empty frame".into(),
        })?;
        match CompressionAlgorithm::from_tag(*tag)? {
            CompressionAlgorithm::None => Ok(payload.to_vec()),
            CompressionAlgorithm::Lz4 => self.lz4.decompress(payload),
        }
    }
}

impl std::fmt::Debug for EntryCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCodec")
            .field("config", &self.config)
            .field("cipher", &self.cipher.name())
            .finish()
    }
}
