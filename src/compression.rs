use std::{convert::TryInto, io::prelude::*, str::FromStr};

use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};

use crate::error::{Error, ErrorKind, Result};

/// The wire-level ids assigned to each compressor.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub(crate) enum CompressorId {
    Noop = 0,
    Snappy = 1,
    Zlib = 2,
    Zstd = 3,
}

impl CompressorId {
    pub(crate) fn from_u8(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressorId::Noop),
            1 => Ok(CompressorId::Snappy),
            2 => Ok(CompressorId::Zlib),
            3 => Ok(CompressorId::Zstd),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("Invalid wire protocol compressor id: {}", other),
            }
            .into()),
        }
    }
}

/// Enum representing supported compressor algorithms.
/// Used for compressing and decompressing messages sent to and read from the server.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// Zstd compressor. Requires server version 4.2+.
    Zstd {
        /// The level of compression; `None` indicates the default.
        level: Option<i32>,
    },
    /// Zlib compressor.
    Zlib {
        /// The level of compression, 0-9; `None` indicates the default.
        level: Option<u32>,
    },
    /// Snappy compressor. Requires server version 3.4+.
    Snappy,
}

impl FromStr for Compressor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zstd" => Ok(Compressor::Zstd { level: None }),
            "zlib" => Ok(Compressor::Zlib { level: None }),
            "snappy" => Ok(Compressor::Snappy),
            other => Err(ErrorKind::InvalidArgument {
                message: format!("unsupported compressor: {}", other),
            }
            .into()),
        }
    }
}

impl Compressor {
    pub(crate) fn name(&self) -> &'static str {
        match *self {
            Compressor::Zstd { .. } => "zstd",
            Compressor::Zlib { .. } => "zlib",
            Compressor::Snappy => "snappy",
        }
    }

    pub(crate) fn id(&self) -> CompressorId {
        match *self {
            Compressor::Zstd { .. } => CompressorId::Zstd,
            Compressor::Zlib { .. } => CompressorId::Zlib,
            Compressor::Snappy => CompressorId::Snappy,
        }
    }

    /// Record the zlibCompressionLevel URI option on any zlib compressor in the list.
    pub(crate) fn write_zlib_level(&mut self, uri_level: i32) -> Result<()> {
        if let Compressor::Zlib { ref mut level } = *self {
            if uri_level == -1 {
                *level = None;
            } else if (0..=9).contains(&uri_level) {
                *level = Some(uri_level as u32);
            } else {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "zlibCompressionLevel must be between -1 and 9, got {}",
                        uri_level
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    pub(crate) fn compress(&self, uncompressed: &[u8]) -> Result<Vec<u8>> {
        match *self {
            Compressor::Zstd { level } => {
                zstd::stream::encode_all(uncompressed, level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL))
                    .map_err(compression_error("zstd", "encoding"))
            }
            Compressor::Zlib { level } => {
                let compression = match level {
                    Some(level) => Compression::new(level),
                    None => Compression::default(),
                };
                let mut encoder = ZlibEncoder::new(Vec::new(), compression);
                encoder
                    .write_all(uncompressed)
                    .and_then(|_| encoder.finish())
                    .map_err(compression_error("zlib", "encoding"))
            }
            Compressor::Snappy => {
                // The server does not use the snappy frame format, so raw encoding is required
                // rather than snap::write::FrameEncoder. Likewise for decoding.
                snap::raw::Encoder::new()
                    .compress_vec(uncompressed)
                    .map_err(compression_error("snappy", "encoding"))
            }
        }
    }
}

fn compression_error<E: std::fmt::Display>(
    compressor: &'static str,
    phase: &'static str,
) -> impl FnOnce(E) -> Error {
    move |e| {
        ErrorKind::Compression {
            message: format!("an error occurred during {} {}: {}", compressor, phase, e),
        }
        .into()
    }
}

/// Decompresses a reply payload based on the compressor id in its OP_COMPRESSED header.
pub(crate) fn decompress(compressor_id: u8, compressed: &[u8]) -> Result<Vec<u8>> {
    match CompressorId::from_u8(compressor_id)? {
        CompressorId::Noop => Ok(compressed.to_vec()),
        CompressorId::Snappy => snap::raw::Decoder::new()
            .decompress_vec(compressed)
            .map_err(compression_error("snappy", "decoding")),
        CompressorId::Zlib => {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder
                .write_all(compressed)
                .and_then(|_| decoder.finish())
                .map_err(compression_error("zlib", "decoding"))
        }
        CompressorId::Zstd => {
            let mut decompressed = Vec::new();
            zstd::stream::copy_decode(compressed, &mut decompressed)
                .map_err(compression_error("zstd", "decoding"))?;
            Ok(decompressed)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(compressor: Compressor, payload: &[u8]) {
        let id = compressor.id() as u8;
        let compressed = compressor.compress(payload).unwrap();
        let decompressed = decompress(id, compressed.as_slice()).unwrap();
        assert_eq!(payload, decompressed.as_slice());
    }

    #[test]
    fn zlib_roundtrip() {
        for level in [None, Some(0), Some(9)] {
            roundtrip(Compressor::Zlib { level }, b"foobarZLIB");
        }
    }

    #[test]
    fn zstd_roundtrip() {
        roundtrip(Compressor::Zstd { level: None }, b"foobarZSTD");
    }

    #[test]
    fn snappy_roundtrip() {
        roundtrip(Compressor::Snappy, b"foobarSNAPPY");
    }

    #[test]
    fn zlib_level_parsing() {
        let mut compressor = Compressor::from_str("zlib").unwrap();
        assert!(compressor.write_zlib_level(9).is_ok());
        assert_eq!(compressor, Compressor::Zlib { level: Some(9) });
        assert!(compressor.write_zlib_level(-1).is_ok());
        assert_eq!(compressor, Compressor::Zlib { level: None });
        assert!(compressor.write_zlib_level(10).is_err());
    }

    #[test]
    fn unknown_compressor_rejected() {
        assert!(Compressor::from_str("lz4").is_err());
        assert!(decompress(42, b"").is_err());
    }
}
