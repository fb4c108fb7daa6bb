//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Readers and writers for the primitive wire types used by every message:
//!
//! ```text
//! byte        single octet
//! boolean     single octet, 0 = false
//! uint32      4 bytes, big-endian
//! string      uint32 length + bytes
//! mpint       string holding a two's complement big-endian integer
//! name-list   string holding comma-separated names
//! ```

use bytes::{BufMut, BytesMut};
use sluice_platform::{SluiceError, SluiceResult};

/// Cursor over a message payload.
///
/// Every read checks bounds and reports what was being read when data runs out.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns the current offset.
    pub fn position(&self) -> usize {
        self.offset
    }

    fn take(&mut self, len: usize, what: &str) -> SluiceResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(SluiceError::Protocol(format!(
                "Truncated {}: need {} bytes, have {}",
                what,
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> SluiceResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a boolean.
    pub fn read_bool(&mut self) -> SluiceResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn read_u32(&mut self) -> SluiceResult<u32> {
        let bytes = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> SluiceResult<&'a [u8]> {
        self.take(len, "raw bytes")
    }

    /// Reads a length-prefixed byte string.
    pub fn read_string(&mut self) -> SluiceResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, "string")
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_utf8(&mut self) -> SluiceResult<String> {
        let bytes = self.read_string()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SluiceError::Protocol("Invalid UTF-8 in string".to_string()))
    }

    /// Reads an mpint and returns its magnitude bytes without leading zeros.
    pub fn read_mpint(&mut self) -> SluiceResult<&'a [u8]> {
        let bytes = self.read_string()?;
        if bytes.first().map_or(false, |b| b & 0x80 != 0) {
            return Err(SluiceError::Protocol(
                "Negative mpint not allowed".to_string(),
            ));
        }
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        Ok(&bytes[start..])
    }

    /// Reads a comma-separated name-list.
    pub fn read_name_list(&mut self) -> SluiceResult<Vec<String>> {
        let raw = self.read_string()?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| SluiceError::Protocol("Invalid UTF-8 in name-list".to_string()))?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.split(',').map(str::to_string).collect())
    }

    /// Returns all unread bytes and moves to the end.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }
}

/// Builder for message payloads.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Creates a writer whose first byte is the message code.
    pub fn message(code: u8) -> Self {
        let mut w = Self::new();
        w.put_u8(code);
        w
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Appends a boolean.
    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    /// Appends a big-endian uint32.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Appends raw bytes without a length prefix.
    pub fn put_raw(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    /// Appends a length-prefixed byte string.
    pub fn put_string(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        self
    }

    /// Appends an unsigned big-endian magnitude as an mpint.
    pub fn put_mpint(&mut self, magnitude: &[u8]) -> &mut Self {
        self.buf.put_slice(&encode_mpint(magnitude));
        self
    }

    /// Appends a comma-separated name-list.
    pub fn put_name_list(&mut self, names: &[String]) -> &mut Self {
        let joined = names.join(",");
        self.put_string(joined.as_bytes())
    }

    /// Returns the bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer and returns the payload.
    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Encodes an unsigned big-endian magnitude as SSH mpint.
///
/// Leading zeros are dropped and a zero byte is prepended when the high bit is set.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let needs_padding = trimmed[0] & 0x80 != 0;
    let length = trimmed.len() + usize::from(needs_padding);

    let mut result = Vec::with_capacity(4 + length);
    result.extend_from_slice(&(length as u32).to_be_bytes());
    if needs_padding {
        result.push(0);
    }
    result.extend_from_slice(trimmed);
    result
}
