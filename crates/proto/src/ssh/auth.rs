//! SSH user authentication messages (RFC 4252).
//!
//! The client first asks for the `ssh-userauth` service, then sends a `none`
//! request to learn which methods the server accepts, then one real attempt:
//!
//! - `password` (RFC 4252 Section 8)
//! - `publickey` (RFC 4252 Section 7): a query without signature, then after
//!   SSH_MSG_USERAUTH_PK_OK the signed request
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new("alice", AuthMethod::None);
//! let bytes = request.to_bytes();
//! assert_eq!(bytes[0], 50);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::privatekey::KeyProvider;
use crate::ssh::wire::{Reader, Writer};
use sluice_platform::{SluiceError, SluiceResult};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Service requested before authentication.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service started after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Credential configured for the connection.
#[derive(Clone)]
pub enum Credential {
    /// Password authentication.
    Password(Zeroizing<String>),
    /// Public key authentication.
    PublicKey(Arc<dyn KeyProvider>),
}

impl Credential {
    /// Creates a password credential.
    pub fn password(password: impl Into<String>) -> Self {
        Credential::Password(Zeroizing::new(password.into()))
    }

    /// Creates a public key credential.
    pub fn public_key(key: impl KeyProvider + 'static) -> Self {
        Credential::PublicKey(Arc::new(key))
    }

    /// Method name this credential authenticates with.
    pub fn method_name(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PublicKey(_) => "publickey",
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::PublicKey(key) => write!(f, "PublicKey({})", key.algorithm()),
        }
    }
}

/// Method specific part of SSH_MSG_USERAUTH_REQUEST.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Lists the methods the server accepts.
    None,
    /// Password authentication.
    Password(Zeroizing<String>),
    /// Asks whether the key would be accepted, without a signature.
    PublicKeyQuery {
        /// Algorithm name
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
    },
    /// Signed public key request.
    PublicKeySigned {
        /// Algorithm name
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature blob
        signature: Vec<u8>,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKeyQuery { .. } | AuthMethod::PublicKeySigned { .. } => "publickey",
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::PublicKeyQuery { algorithm, .. } => {
                write!(f, "PublicKeyQuery({})", algorithm)
            }
            AuthMethod::PublicKeySigned { algorithm, .. } => {
                write!(f, "PublicKeySigned({})", algorithm)
            }
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a request for the `ssh-connection` service.
    pub fn new(user_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: CONNECTION_SERVICE.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::UserauthRequest as u8);
        w.put_string(self.user_name.as_bytes())
            .put_string(self.service_name.as_bytes())
            .put_string(self.method.name().as_bytes());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                w.put_bool(false).put_string(password.as_bytes());
            }
            AuthMethod::PublicKeyQuery {
                algorithm,
                public_key,
            } => {
                w.put_bool(false)
                    .put_string(algorithm.as_bytes())
                    .put_string(public_key);
            }
            AuthMethod::PublicKeySigned {
                algorithm,
                public_key,
                signature,
            } => {
                w.put_bool(true)
                    .put_string(algorithm.as_bytes())
                    .put_string(public_key)
                    .put_string(signature);
            }
        }

        w.finish()
    }

    /// Parses a request (used by test servers).
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::UserauthRequest)?;
        let user_name = r.read_utf8()?;
        let service_name = r.read_utf8()?;
        let method_name = r.read_utf8()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _change = r.read_bool()?;
                AuthMethod::Password(Zeroizing::new(r.read_utf8()?))
            }
            "publickey" => {
                let signed = r.read_bool()?;
                let algorithm = r.read_utf8()?;
                let public_key = r.read_string()?.to_vec();
                if signed {
                    AuthMethod::PublicKeySigned {
                        algorithm,
                        public_key,
                        signature: r.read_string()?.to_vec(),
                    }
                } else {
                    AuthMethod::PublicKeyQuery {
                        algorithm,
                        public_key,
                    }
                }
            }
            other => {
                return Err(SluiceError::Protocol(format!(
                    "Unsupported authentication method: {}",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// Data signed for public key authentication (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn signature_data(
    session_id: &[u8],
    user_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_string(session_id)
        .put_u8(MessageType::UserauthRequest as u8)
        .put_string(user_name.as_bytes())
        .put_string(CONNECTION_SERVICE.as_bytes())
        .put_string(b"publickey")
        .put_bool(true)
        .put_string(algorithm.as_bytes())
        .put_string(public_key_blob);
    w.finish()
}

fn expect_code(r: &mut Reader<'_>, expected: MessageType) -> SluiceResult<()> {
    let code = r.read_u8()?;
    if code != expected as u8 {
        return Err(SluiceError::Protocol(format!(
            "Expected {}, got {}",
            expected,
            crate::ssh::message::describe(code)
        )));
    }
    Ok(())
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that may continue
    pub methods: Vec<String>,
    /// Partial success flag
    pub partial_success: bool,
}

impl AuthFailure {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::UserauthFailure as u8);
        w.put_name_list(&self.methods).put_bool(self.partial_success);
        w.finish()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::UserauthFailure)?;
        Ok(Self {
            methods: r.read_name_list()?,
            partial_success: r.read_bool()?,
        })
    }

    /// Returns true if `method` may continue.
    pub fn allows(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Banner text
    pub message: String,
    /// Language tag
    pub language: String,
}

impl AuthBanner {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::UserauthBanner as u8);
        w.put_string(self.message.as_bytes())
            .put_string(self.language.as_bytes());
        w.finish()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::UserauthBanner)?;
        Ok(Self {
            message: r.read_utf8()?,
            language: r.read_utf8()?,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    /// Algorithm from the query
    pub algorithm: String,
    /// Public key blob from the query
    pub public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::UserauthPkOk as u8);
        w.put_string(self.algorithm.as_bytes())
            .put_string(&self.public_key);
        w.finish()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::UserauthPkOk)?;
        Ok(Self {
            algorithm: r.read_utf8()?,
            public_key: r.read_string()?.to_vec(),
        })
    }
}

/// SSH_MSG_SERVICE_REQUEST message (RFC 4253 Section 10).
pub fn service_request(service: &str) -> Vec<u8> {
    let mut w = Writer::message(MessageType::ServiceRequest as u8);
    w.put_string(service.as_bytes());
    w.finish()
}

/// Parses SSH_MSG_SERVICE_REQUEST or SSH_MSG_SERVICE_ACCEPT and returns the service name.
pub fn parse_service(data: &[u8], expected: MessageType) -> SluiceResult<String> {
    let mut r = Reader::new(data);
    expect_code(&mut r, expected)?;
    r.read_utf8()
}

/// SSH_MSG_SERVICE_ACCEPT message.
pub fn service_accept(service: &str) -> Vec<u8> {
    let mut w = Writer::message(MessageType::ServiceAccept as u8);
    w.put_string(service.as_bytes());
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_request_layout() {
        let bytes = AuthRequest::new("bob", AuthMethod::None).to_bytes();
        let mut expected = vec![50];
        for s in ["bob", "ssh-connection", "none"] {
            expected.extend((s.len() as u32).to_be_bytes());
            expected.extend(s.as_bytes());
        }
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_password_request_round_trip() {
        let request = AuthRequest::new("alice", AuthMethod::Password(Zeroizing::new("pw".into())));
        let bytes = request.to_bytes();
        // boolean FALSE precedes the password
        assert_eq!(&bytes[bytes.len() - 7..], &[0, 0, 0, 0, 2, b'p', b'w']);
        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(format!("{:?}", parsed.method()), "Password(<redacted>)");
    }

    #[test]
    fn test_publickey_query_and_signed() {
        let query = AuthRequest::new(
            "carol",
            AuthMethod::PublicKeyQuery {
                algorithm: "ssh-ed25519".into(),
                public_key: vec![1, 2, 3],
            },
        );
        let parsed = AuthRequest::from_bytes(&query.to_bytes()).unwrap();
        assert_eq!(parsed, query);

        let signed = AuthRequest::new(
            "carol",
            AuthMethod::PublicKeySigned {
                algorithm: "ssh-ed25519".into(),
                public_key: vec![1, 2, 3],
                signature: vec![9; 10],
            },
        );
        let parsed = AuthRequest::from_bytes(&signed.to_bytes()).unwrap();
        assert_eq!(parsed.method().name(), "publickey");
        assert_eq!(parsed, signed);
    }

    #[test]
    fn test_signature_data_matches_signed_request_prefix() {
        let session_id = [0xaa; 20];
        let data = signature_data(&session_id, "carol", "ssh-rsa", &[5, 6]);
        let request = AuthRequest::new(
            "carol",
            AuthMethod::PublicKeySigned {
                algorithm: "ssh-rsa".into(),
                public_key: vec![5, 6],
                signature: vec![],
            },
        )
        .to_bytes();

        assert_eq!(&data[..4], &[0, 0, 0, 20]);
        assert_eq!(&data[4..24], &session_id);
        // The signed data is the session id followed by the request up to the signature
        assert_eq!(&data[24..], &request[..request.len() - 4]);
    }

    #[test]
    fn test_failure_parse() {
        let failure = AuthFailure {
            methods: vec!["publickey".into(), "password".into()],
            partial_success: false,
        };
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert!(parsed.allows("password"));
        assert!(!parsed.allows("keyboard-interactive"));
        assert!(!parsed.partial_success);
    }

    #[test]
    fn test_wrong_code_rejected() {
        let err = AuthFailure::from_bytes(&[52]).unwrap_err();
        assert!(err.to_string().contains("SSH_MSG_USERAUTH_FAILURE"));
    }

    #[test]
    fn test_banner_and_pk_ok() {
        let banner = AuthBanner {
            message: "Authorized use only\n".into(),
            language: String::new(),
        };
        assert_eq!(AuthBanner::from_bytes(&banner.to_bytes()).unwrap(), banner);

        let ok = AuthPkOk {
            algorithm: "ssh-rsa".into(),
            public_key: vec![0, 1],
        };
        assert_eq!(AuthPkOk::from_bytes(&ok.to_bytes()).unwrap(), ok);
    }

    #[test]
    fn test_service_messages() {
        let request = service_request(USERAUTH_SERVICE);
        assert_eq!(
            parse_service(&request, MessageType::ServiceRequest).unwrap(),
            "ssh-userauth"
        );
        let accept = service_accept(USERAUTH_SERVICE);
        assert_eq!(accept[0], 6);
        assert!(parse_service(&accept, MessageType::ServiceRequest).is_err());
    }

    #[test]
    fn test_credential_debug_redacts() {
        assert_eq!(
            format!("{:?}", Credential::password("hunter2")),
            "Password(<redacted>)"
        );
        assert_eq!(Credential::password("x").method_name(), "password");
    }
}
