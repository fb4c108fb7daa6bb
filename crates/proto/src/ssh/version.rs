//! Identification line exchange (RFC 4253 Section 4.2).
//!
//! Before binary packets start, each side sends one text line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server may send other lines first; they are skipped. The line is kept
//! without its CR LF because it feeds the exchange hash in that form.
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::version::{HeaderReader, Version};
//!
//! let version = Version::new("sluice_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-sluice_0.1.0");
//!
//! let mut reader = HeaderReader::new();
//! assert!(reader.feed(b"SSH-2.0-Open").unwrap().is_none());
//! let (line, rest) = reader.feed(b"SSH_8.9\r\n\x00\x00").unwrap().unwrap();
//! assert_eq!(line.software(), "OpenSSH_8.9");
//! assert_eq!(rest, vec![0, 0]);
//! ```

use sluice_platform::{SluiceError, SluiceResult};

/// Maximum length of an identification line (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of lines accepted before the identification line.
pub const MAX_PREAMBLE_LINES: usize = 32;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
    line: String,
}

impl Version {
    /// Creates a protocol 2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let line = match comments {
            Some(comments) => format!("SSH-2.0-{} {}", software, comments),
            None => format!("SSH-2.0-{}", software),
        };
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            line,
        }
    }

    /// Parses an identification line, with or without its line ending.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Protocol`] if the line is longer than 255 bytes,
    /// contains a NUL, does not start with `SSH-`, or names a protocol other
    /// than `2.0` or `1.99`.
    pub fn parse(line: &str) -> SluiceResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SluiceError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(SluiceError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }
        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            SluiceError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            ))
        })?;

        let (proto_version, software) = rest.split_once('-').ok_or_else(|| {
            SluiceError::Protocol(format!("Invalid version string format: '{}'", line))
        })?;
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SluiceError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match software.split_once(' ') {
            Some((sw, comments)) => (sw.to_string(), Some(comments.trim().to_string())),
            None => (software.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
            line: line.to_string(),
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Returns the identification line exactly as exchanged, without CR LF.
    ///
    /// This is the string that enters the exchange hash.
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Returns the line as sent on the wire, terminated by CR LF.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.line)
    }
}

/// Incremental reader for the peer's identification line.
///
/// Bytes may arrive split anywhere. Once the `SSH-` line is complete the reader
/// hands back the parsed version and whatever bytes followed it, which belong
/// to the binary packet stream.
#[derive(Debug, Default)]
pub struct HeaderReader {
    line: Vec<u8>,
    skipped: usize,
}

impl HeaderReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes; returns the version and the remaining bytes once the line is complete.
    pub fn feed(&mut self, data: &[u8]) -> SluiceResult<Option<(Version, Vec<u8>)>> {
        for (i, &byte) in data.iter().enumerate() {
            if byte != b'\n' {
                if self.line.len() > MAX_VERSION_LENGTH + 1 {
                    return Err(SluiceError::Protocol(format!(
                        "Version line exceeds {} bytes",
                        MAX_VERSION_LENGTH
                    )));
                }
                self.line.push(byte);
                continue;
            }

            let line = std::mem::take(&mut self.line);
            if !line.starts_with(b"SSH-") {
                self.skipped += 1;
                if self.skipped > MAX_PREAMBLE_LINES {
                    return Err(SluiceError::Protocol(
                        "Too many lines before version string".to_string(),
                    ));
                }
                tracing::trace!(len = line.len(), "Skipping pre-version line");
                continue;
            }

            let text = String::from_utf8(line).map_err(|_| {
                SluiceError::Protocol("Version string is not valid UTF-8".to_string())
            })?;
            let version = Version::parse(&text)?;
            return Ok(Some((version, data[i + 1..].to_vec())));
        }
        Ok(None)
    }
}
