//! Pluggable object compression.
//!
//! Every stored object starts with a one-byte codec tag so objects written
//! under one compressor stay readable after the store is reconfigured.

use std::fmt::Debug;
use std::io;

/// Default zstd level.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// A reversible byte transform applied to objects at rest.
pub trait Compressor: Send + Sync + Debug {
    /// Tag byte written in front of every object this codec produces.
    fn tag(&self) -> u8;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Compress `data`.
    ///
    /// # Errors
    ///
    /// Returns the codec's I/O error.
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Reverse [`Compressor::compress`].
    ///
    /// # Errors
    ///
    /// Returns an error when `data` is not a valid stream for this codec.
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// zstd at a fixed level.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Tag byte for zstd objects.
    pub const TAG: u8 = b'z';

    /// Create a compressor at `level`.
    #[must_use]
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(DEFAULT_ZSTD_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn tag(&self) -> u8 {
        Self::TAG
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        zstd::encode_all(data, self.level)
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        zstd::decode_all(data)
    }
}

/// Stores bytes verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uncompressed;

impl Uncompressed {
    /// Tag byte for raw objects.
    pub const TAG: u8 = b'r';
}

impl Compressor for Uncompressed {
    fn tag(&self) -> u8 {
        Self::TAG
    }

    fn name(&self) -> &'static str {
        "raw"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
