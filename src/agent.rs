//! SSH agent access.
//!
//! Only the identity listing of the agent protocol is needed here: the agent's public keys are
//! offered one by one, and signing is left to the transport.

use std::path::PathBuf;

use async_trait::async_trait;
use ssh_key::PublicKey;
use tracing::debug;

use crate::error::AgentError;
use crate::keys::Identity;

const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
const SSH_AGENT_FAILURE: u8 = 5;

/// Agents answer with a handful of keys; anything bigger is not an identity list.
const MAX_REPLY_LEN: usize = 256 * 1024;

#[async_trait]
pub trait KeyAgent: Send + Sync {
    async fn identities(&self) -> Result<Vec<Identity>, AgentError>;
}

/// Talks to the agent listening on a unix socket, `SSH_AUTH_SOCK` by default.
#[derive(Debug, Clone)]
pub struct UnixAgent {
    socket: Option<PathBuf>,
}

impl UnixAgent {
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket: Some(socket),
        }
    }

    pub fn from_env() -> Self {
        Self {
            socket: std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from),
        }
    }

    #[cfg(unix)]
    async fn request_identities(&self) -> Result<Vec<u8>, AgentError> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::UnixStream;

        let socket = self.socket.as_ref().ok_or(AgentError::NoSocket)?;
        debug!(socket = %socket.display(), "Querying SSH agent");
        let mut stream = UnixStream::connect(socket).await?;

        let mut request = 1u32.to_be_bytes().to_vec();
        request.push(SSH_AGENTC_REQUEST_IDENTITIES);
        stream.write_all(&request).await?;

        let len = stream.read_u32().await? as usize;
        if len == 0 || len > MAX_REPLY_LEN {
            return Err(AgentError::Malformed(format!("reply length {}", len)));
        }
        let mut reply = vec![0; len];
        stream.read_exact(&mut reply).await?;
        Ok(reply)
    }

    #[cfg(not(unix))]
    async fn request_identities(&self) -> Result<Vec<u8>, AgentError> {
        Err(AgentError::NoSocket)
    }
}

impl Default for UnixAgent {
    fn default() -> Self {
        Self::from_env()
    }
}

#[async_trait]
impl KeyAgent for UnixAgent {
    async fn identities(&self) -> Result<Vec<Identity>, AgentError> {
        let reply = self.request_identities().await?;
        parse_identities_answer(&reply)
    }
}

/// Parses the body of an identities answer (message type byte included).
pub fn parse_identities_answer(reply: &[u8]) -> Result<Vec<Identity>, AgentError> {
    let mut reader = Reader(reply);
    match reader.byte()? {
        SSH_AGENT_IDENTITIES_ANSWER => {}
        SSH_AGENT_FAILURE => return Err(AgentError::Malformed("agent refused".to_string())),
        other => return Err(AgentError::Malformed(format!("unexpected message {}", other))),
    }
    let count = reader.u32()? as usize;
    let mut identities = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let blob = reader.string()?;
        let comment = reader.string()?;
        let mut public = PublicKey::from_bytes(blob)
            .map_err(|e| AgentError::Malformed(format!("bad key blob: {}", e)))?;
        public.set_comment(String::from_utf8_lossy(comment));
        identities.push(Identity::from_agent(public));
    }
    Ok(identities)
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], AgentError> {
        if self.0.len() < n {
            return Err(AgentError::Malformed("truncated reply".to_string()));
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn byte(&mut self) -> Result<u8, AgentError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, AgentError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<&'a [u8], AgentError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}
