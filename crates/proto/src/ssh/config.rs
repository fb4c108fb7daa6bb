//! Client configuration.
//!
//! Every tunable the engine uses is carried by [`ClientConfig`] and handed to
//! the constructor; nothing is read from process-wide state.
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::auth::Credential;
//! use sluice_proto::ssh::config::ClientConfig;
//!
//! let config = ClientConfig::new("alice", Credential::password("secret"))
//!     .with_command("uptime");
//! assert!(config.validate().is_ok());
//! ```

use crate::ssh::auth::Credential;
use crate::ssh::compression::SUPPORTED_COMPRESSION;
use crate::ssh::connection::PtyRequest;
use crate::ssh::crypto::{SUPPORTED_CIPHERS, SUPPORTED_MACS};
use crate::ssh::hostkey::{AcceptAnyHostKey, HostKeyVerifier, SUPPORTED_HOST_KEYS};
use crate::ssh::kex_dh::SUPPORTED_KEX;
use crate::ssh::packet::DEFAULT_MAX_PACKET_LENGTH;
use sluice_platform::{SluiceError, SluiceResult};
use std::sync::Arc;
use std::time::Duration;

pub use crate::ssh::kex_dh::GroupExchangeBounds;

/// Default window advertised for the session channel.
pub const DEFAULT_WINDOW_SIZE: u32 = u32::MAX - 1;

/// Default maximum channel data packet we accept.
pub const DEFAULT_MAX_CHANNEL_PACKET: u32 = 65536;

/// Default scratch buffer size for inflating inbound payloads.
pub const DEFAULT_INFLATE_BUFFER_SIZE: usize = 10 * 1024;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|name| name.to_string()).collect()
}

/// Ordered algorithm proposal lists, most preferred first.
///
/// The same lists are proposed for both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers
    pub ciphers: Vec<String>,
    /// MAC algorithms
    pub macs: Vec<String>,
    /// Compression methods
    pub compression: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: names(SUPPORTED_KEX),
            host_key: names(SUPPORTED_HOST_KEYS),
            ciphers: names(SUPPORTED_CIPHERS),
            macs: names(SUPPORTED_MACS),
            compression: names(SUPPORTED_COMPRESSION),
        }
    }
}

impl AlgorithmPreferences {
    fn validate(&self) -> SluiceResult<()> {
        let slots: [(&str, &[String], &[&str]); 5] = [
            ("kex", &self.kex, SUPPORTED_KEX),
            ("host key", &self.host_key, SUPPORTED_HOST_KEYS),
            ("cipher", &self.ciphers, SUPPORTED_CIPHERS),
            ("mac", &self.macs, SUPPORTED_MACS),
            ("compression", &self.compression, SUPPORTED_COMPRESSION),
        ];

        for (slot, list, supported) in slots {
            if list.is_empty() {
                return Err(SluiceError::Config(format!("Empty {} algorithm list", slot)));
            }
            if let Some(unknown) = list.iter().find(|name| !supported.contains(&name.as_str())) {
                return Err(SluiceError::Config(format!(
                    "Unsupported {} algorithm: {}",
                    slot, unknown
                )));
            }
        }
        Ok(())
    }
}

/// SSH client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Implementation id placed in the version line.
    pub client_software: String,
    /// User name to authenticate as.
    pub username: String,
    /// Credential to authenticate with.
    pub credential: Credential,
    /// Command to exec; a shell is started when unset.
    pub command: Option<String>,
    /// Pseudo-terminal to request before the shell or command.
    pub pty: Option<PtyRequest>,
    /// Algorithm proposal.
    pub algorithms: AlgorithmPreferences,
    /// Modulus size bounds for group exchange.
    pub group_exchange: GroupExchangeBounds,
    /// Session channel window advertised to the server.
    pub window_size: u32,
    /// Largest channel data packet we accept.
    pub max_packet_size: u32,
    /// Scratch buffer size for inflate.
    pub inflate_buffer_size: usize,
    /// Largest inbound binary packet accepted.
    pub max_packet_length: usize,
    /// Host key trust decision.
    pub host_key_verifier: Arc<dyn HostKeyVerifier>,
}

// Manual Debug implementation because the verifier is a trait object
impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("client_software", &self.client_software)
            .field("username", &self.username)
            .field("credential", &self.credential)
            .field("command", &self.command)
            .field("pty", &self.pty)
            .field("algorithms", &self.algorithms)
            .field("group_exchange", &self.group_exchange)
            .field("window_size", &self.window_size)
            .field("max_packet_size", &self.max_packet_size)
            .field("inflate_buffer_size", &self.inflate_buffer_size)
            .field("max_packet_length", &self.max_packet_length)
            .field("host_key_verifier", &"<verifier>")
            .finish()
    }
}

impl ClientConfig {
    /// Creates a configuration with default tunables.
    pub fn new(username: impl Into<String>, credential: Credential) -> Self {
        Self {
            client_software: format!("sluice_{}", env!("CARGO_PKG_VERSION")),
            username: username.into(),
            credential,
            command: None,
            pty: None,
            algorithms: AlgorithmPreferences::default(),
            group_exchange: GroupExchangeBounds::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_CHANNEL_PACKET,
            inflate_buffer_size: DEFAULT_INFLATE_BUFFER_SIZE,
            max_packet_length: DEFAULT_MAX_PACKET_LENGTH,
            host_key_verifier: Arc::new(AcceptAnyHostKey),
        }
    }

    /// Runs `command` instead of a shell.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Requests a pseudo-terminal.
    pub fn with_pty(mut self, pty: PtyRequest) -> Self {
        self.pty = Some(pty);
        self
    }

    /// Sets the algorithm proposal.
    pub fn with_algorithms(mut self, algorithms: AlgorithmPreferences) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Sets the host key verifier.
    pub fn with_host_key_verifier(mut self, verifier: impl HostKeyVerifier + 'static) -> Self {
        self.host_key_verifier = Arc::new(verifier);
        self
    }

    /// Sets the implementation id of the version line.
    pub fn with_client_software(mut self, software: impl Into<String>) -> Self {
        self.client_software = software.into();
        self
    }

    /// Checks the configuration before any byte is sent.
    pub fn validate(&self) -> SluiceResult<()> {
        if self.username.is_empty() {
            return Err(SluiceError::Config("Username must not be empty".to_string()));
        }
        if self.client_software.is_empty()
            || self
                .client_software
                .bytes()
                .any(|b| b == b'-' || b.is_ascii_whitespace() || !b.is_ascii_graphic())
        {
            return Err(SluiceError::Config(format!(
                "Invalid software version: {:?}",
                self.client_software
            )));
        }
        if self.max_packet_size == 0 {
            return Err(SluiceError::Config(
                "max_packet_size must be greater than zero".to_string(),
            ));
        }
        if self.inflate_buffer_size == 0 {
            return Err(SluiceError::Config(
                "inflate_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.max_packet_length < 1024 {
            return Err(SluiceError::Config(format!(
                "max_packet_length too small: {}",
                self.max_packet_length
            )));
        }
        let bounds = &self.group_exchange;
        if bounds.min > bounds.preferred || bounds.preferred > bounds.max {
            return Err(SluiceError::Config(format!(
                "Invalid group exchange bounds: {}/{}/{}",
                bounds.min, bounds.preferred, bounds.max
            )));
        }
        self.algorithms.validate()
    }
}

/// Options for the tokio adapter only.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Size of each socket read.
    pub read_buffer_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_buffer_size: 16 * 1024,
        }
    }
}

impl ConnectOptions {
    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the read buffer size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new("alice", Credential::password("secret"))
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert!(config.client_software.starts_with("sluice_"));
        assert_eq!(config.window_size, 0xffff_fffe);
        assert_eq!(config.max_packet_size, 65536);
        assert_eq!(config.inflate_buffer_size, 10240);
        assert_eq!(config.max_packet_length, 256 * 1024);
        assert_eq!(config.group_exchange.preferred, 2048);
        assert_eq!(
            config.algorithms.kex[0],
            "diffie-hellman-group-exchange-sha1"
        );
        assert_eq!(config.algorithms.compression, vec!["zlib@openssh.com", "none"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_username_rejected() {
        let config = ClientConfig::new("", Credential::password("x"));
        assert!(matches!(config.validate(), Err(SluiceError::Config(_))));
    }

    #[test]
    fn test_zero_max_packet_rejected() {
        let mut config = config();
        config.max_packet_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_algorithm_rejected() {
        let mut prefs = AlgorithmPreferences::default();
        prefs.ciphers = vec!["aes256-gcm@openssh.com".into()];
        let err = config().with_algorithms(prefs).validate().unwrap_err();
        assert!(err.to_string().contains("aes256-gcm@openssh.com"));
    }

    #[test]
    fn test_empty_algorithm_list_rejected() {
        let mut prefs = AlgorithmPreferences::default();
        prefs.macs.clear();
        assert!(config().with_algorithms(prefs).validate().is_err());
    }

    #[test]
    fn test_software_with_dash_rejected() {
        assert!(config().with_client_software("bad-name").validate().is_err());
        assert!(config().with_client_software("Good_1.0").validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_credential() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<verifier>"));
    }
}
