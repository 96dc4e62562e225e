//! Content-Encoding codecs.
//!
//! Response bodies are decoded to plaintext before intercepts see them and
//! re-encoded on the way back to the client. The registry is keyed by the
//! `Content-Encoding` token, so additional schemes can be registered without
//! touching the message model or the pipeline.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::error::CodecError;

/// Buffer size used by the brotli reader/writer.
const BROTLI_BUFFER_SIZE: usize = 4096;
/// Brotli quality used when re-encoding.
const BROTLI_QUALITY: u32 = 5;
/// Brotli window size (log2).
const BROTLI_LGWIN: u32 = 22;

/// A single `Content-Encoding` scheme.
pub trait ContentCodec: Send + Sync {
    /// Decodes `data` into plaintext.
    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Encodes plaintext `data`.
    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// Brotli (`br`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Brotli;

impl ContentCodec for Brotli {
    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 4);
        brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE).read_to_end(&mut out)?;
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2);
        brotli::CompressorReader::new(data, BROTLI_BUFFER_SIZE, BROTLI_QUALITY, BROTLI_LGWIN)
            .read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Gzip (`gzip`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Gzip;

impl ContentCodec for Gzip {
    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }
}

/// Deflate (`deflate`), which HTTP defines as the zlib format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deflate;

impl ContentCodec for Deflate {
    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }
}

/// Registry of codecs keyed by `Content-Encoding` token.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn ContentCodec>>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("tokens", &self.tokens())
            .finish()
    }
}

impl CodecRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with `br`, `gzip` and `deflate` registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("br", Brotli);
        registry.register("gzip", Gzip);
        registry.register("deflate", Deflate);
        registry
    }

    /// Registers `codec` for `token`, replacing any existing registration.
    pub fn register(&mut self, token: &str, codec: impl ContentCodec + 'static) {
        self.codecs.insert(normalize(token), Arc::new(codec));
    }

    /// Returns true if a codec is registered for `token`.
    pub fn supported(&self, token: &str) -> bool {
        self.codecs.contains_key(&normalize(token))
    }

    /// Returns the registered tokens, sorted.
    pub fn tokens(&self) -> Vec<&str> {
        let mut tokens: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        tokens.sort_unstable();
        tokens
    }

    /// Decodes `data` with the codec registered for `token`.
    pub fn decode(&self, token: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.codec(token)?
            .decode(data)
            .map_err(|cause| CodecError::Decode {
                token: token.to_string(),
                cause,
            })
    }

    /// Encodes `data` with the codec registered for `token`.
    pub fn encode(&self, token: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.codec(token)?
            .encode(data)
            .map_err(|cause| CodecError::Encode {
                token: token.to_string(),
                cause,
            })
    }

    fn codec(&self, token: &str) -> Result<&Arc<dyn ContentCodec>, CodecError> {
        self.codecs
            .get(&normalize(token))
            .ok_or_else(|| CodecError::Unsupported(token.to_string()))
    }
}

fn normalize(token: &str) -> String {
    token.trim().to_ascii_lowercase()
}
