//! The connection the negotiator authenticates on.
//!
//! The transport is owned by whoever opened the connection. The negotiator only asks it to try one
//! method at a time, so anything that can speak the password and public key exchanges can sit
//! behind `AuthTransport`: a real SSH client in production, a mock in tests, or `DryRunTransport`
//! to preview what would be offered.

use std::fmt;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::keys::Identity;

/// How the peer answered an accepted attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// Nothing more is needed; the session is authenticated.
    Success,
    /// Accepted, but the peer still wants one of these methods (two-factor setups). An empty
    /// list means no further methods are allowed, which ends negotiation as a success.
    Partial(Vec<String>),
}

#[async_trait]
pub trait AuthTransport: Send {
    async fn auth_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<AuthResponse, TransportError>;

    async fn auth_publickey(
        &mut self,
        username: &str,
        identity: &Identity,
    ) -> Result<AuthResponse, TransportError>;
}

/// One method offered to a `DryRunTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferedMethod {
    Password { username: String },
    PublicKey { username: String, key: String },
}

impl fmt::Display for OfferedMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Password { username } => write!(f, "password for {}", username),
            Self::PublicKey { username, key } => write!(f, "public key {} for {}", key, username),
        }
    }
}

/// Rejects everything and remembers what it was offered.
#[derive(Debug, Default)]
pub struct DryRunTransport {
    offered: Vec<OfferedMethod>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offered(&self) -> &[OfferedMethod] {
        &self.offered
    }
}

#[async_trait]
impl AuthTransport for DryRunTransport {
    async fn auth_password(
        &mut self,
        username: &str,
        _password: &str,
    ) -> Result<AuthResponse, TransportError> {
        self.offered.push(OfferedMethod::Password {
            username: username.to_string(),
        });
        Err(TransportError::Rejected)
    }

    async fn auth_publickey(
        &mut self,
        username: &str,
        identity: &Identity,
    ) -> Result<AuthResponse, TransportError> {
        self.offered.push(OfferedMethod::PublicKey {
            username: username.to_string(),
            key: identity.to_string(),
        });
        Err(TransportError::Rejected)
    }
}
