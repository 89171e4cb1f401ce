//! Zlib helpers for loose objects.

use crate::{Result, StorageError};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

/// Zlib effort for loose objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Stored blocks only.
    None,
    /// Level 1.
    Fast,
    /// Level 6, what git writes.
    #[default]
    Default,
    /// Level 9.
    Best,
}

impl CompressionLevel {
    /// The matching `flate2` setting.
    pub fn to_flate2(self) -> flate2::Compression {
        match self {
            CompressionLevel::None => flate2::Compression::none(),
            CompressionLevel::Fast => flate2::Compression::fast(),
            CompressionLevel::Default => flate2::Compression::default(),
            CompressionLevel::Best => flate2::Compression::best(),
        }
    }
}

/// Deflates a canonical object encoding into loose-object form.
pub fn compress_loose(encoded: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(encoded.len() / 2), level.to_flate2());
    encoder.write_all(encoded)?;
    encoder
        .finish()
        .map_err(|e| StorageError::Compression(e.to_string()))
}

/// Inflates a loose object back into its canonical encoding.
pub fn decompress_loose(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut out = Vec::with_capacity(compressed.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    Ok(out)
}
