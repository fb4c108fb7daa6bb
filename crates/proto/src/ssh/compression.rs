//! Payload compression (RFC 4253 Section 6.2, `zlib@openssh.com`).
//!
//! Each direction keeps one zlib stream for the lifetime of the connection.
//! Outbound payloads are deflated with a sync flush so the peer can inflate
//! every packet as soon as it arrives. Inbound payloads are inflated through a
//! bounded scratch buffer until the stream stops producing output.
//!
//! Both sides start inert (pass-through). `zlib@openssh.com` is delayed
//! compression: it is switched on only after authentication succeeds.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use sluice_platform::{SluiceError, SluiceResult};

/// Compression method names in default preference order.
pub const SUPPORTED_COMPRESSION: &[&str] = &["zlib@openssh.com", "none"];

/// Negotiated compression method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// zlib, activated after user authentication
    ZlibOpenssh,
}

impl CompressionAlgorithm {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::ZlibOpenssh => "zlib@openssh.com",
        }
    }

    /// Parses a method name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenssh),
            _ => None,
        }
    }

    /// Returns true if this method compresses once authentication succeeds.
    pub fn is_delayed(&self) -> bool {
        matches!(self, CompressionAlgorithm::ZlibOpenssh)
    }
}

/// Outbound compressor.
pub struct Compressor {
    stream: Option<Compress>,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("active", &self.is_active())
            .finish()
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor {
    /// Creates an inert compressor.
    pub fn new() -> Self {
        Self { stream: None }
    }

    /// Starts the zlib stream. Calling it again keeps the existing stream.
    pub fn activate(&mut self) {
        if self.stream.is_none() {
            self.stream = Some(Compress::new(Compression::default(), true));
        }
    }

    /// Returns true once the compressor is active.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Compresses one payload, or returns it unchanged while inert.
    pub fn compress(&mut self, input: &[u8]) -> SluiceResult<Vec<u8>> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            None => return Ok(input.to_vec()),
        };

        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let mut consumed = 0;
        loop {
            let before = stream.total_in();
            stream
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| SluiceError::Protocol(format!("Deflate failed: {}", e)))?;
            consumed += (stream.total_in() - before) as usize;

            // The flush is complete once all input is taken and output space is left over
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
            out.reserve(out.capacity().max(256));
        }
        Ok(out)
    }
}

/// Inbound decompressor.
pub struct Decompressor {
    stream: Option<Decompress>,
    scratch_size: usize,
    max_output: usize,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor")
            .field("active", &self.is_active())
            .field("scratch_size", &self.scratch_size)
            .finish()
    }
}

impl Decompressor {
    /// Creates an inert decompressor.
    ///
    /// `scratch_size` bounds each inflate step; `max_output` bounds the size of
    /// one inflated payload.
    pub fn new(scratch_size: usize, max_output: usize) -> Self {
        Self {
            stream: None,
            scratch_size: scratch_size.max(64),
            max_output,
        }
    }

    /// Starts the zlib stream. Calling it again keeps the existing stream.
    pub fn activate(&mut self) {
        if self.stream.is_none() {
            self.stream = Some(Decompress::new(true));
        }
    }

    /// Returns true once the decompressor is active.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Inflates one payload, or returns it unchanged while inert.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Protocol`] for a corrupt stream or when the
    /// inflated payload would exceed the configured maximum.
    pub fn decompress(&mut self, input: &[u8]) -> SluiceResult<Vec<u8>> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            None => return Ok(input.to_vec()),
        };

        let mut out = Vec::new();
        let mut scratch = vec![0u8; self.scratch_size];
        let mut consumed = 0;
        loop {
            let before_in = stream.total_in();
            let before_out = stream.total_out();
            let status = stream
                .decompress(&input[consumed..], &mut scratch, FlushDecompress::Sync)
                .map_err(|e| SluiceError::Protocol(format!("Inflate failed: {}", e)))?;
            consumed += (stream.total_in() - before_in) as usize;
            let written = (stream.total_out() - before_out) as usize;

            if out.len() + written > self.max_output {
                return Err(SluiceError::Protocol(format!(
                    "Inflated payload exceeds {} bytes",
                    self.max_output
                )));
            }
            out.extend_from_slice(&scratch[..written]);

            if written == 0 || matches!(status, Status::StreamEnd) {
                break;
            }
        }

        if consumed < input.len() {
            return Err(SluiceError::Protocol(
                "Compressed payload has trailing data".to_string(),
            ));
        }
        Ok(out)
    }
}
