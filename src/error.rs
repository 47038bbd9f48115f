use std::path::PathBuf;

use thiserror::Error;

use crate::auth::Stage;
use crate::keys::KeyType;

#[derive(Error, Debug)]
pub enum NegotiateError {
    #[error("Invalid job resources: {0}")]
    Resources(#[from] ResourceError),
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("Failed to read resource file {}: {source}", .path.display())]
    ResourceFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse resource file {}: {source}", .path.display())]
    ResourceYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Validation failures of the resource negotiator. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("these parameters were not recognized: {}", .0.join(", "))]
    UnknownParameter(Vec<String>),
    #[error("{0}")]
    InvalidResourceSpec(String),
    #[error(
        "`tot_num_mpiprocs` ({total_procs}) must be a multiple of `num_machines` ({machines}) \
         if `num_mpiprocs_per_machine` is not specified"
    )]
    NotAMultiple { total_procs: u64, machines: u64 },
    #[error(
        "`tot_num_mpiprocs` ({total_procs}) is too large for `num_mpiprocs_per_machine * num_machines` ({capacity})"
    )]
    OverAllocated { total_procs: u64, capacity: u64 },
    #[error(
        "`num_cores_per_machine` ({cores_per_machine}) must be equal to `num_cores_per_mpiproc * \
         num_mpiprocs_per_machine` and in particular a multiple of `num_mpiprocs_per_machine` ({procs_per_machine})"
    )]
    CoreMismatch {
        cores_per_machine: u64,
        procs_per_machine: u64,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("Cannot find password for {target} - please set the {variable} environment variable")]
    MissingPassword { target: String, variable: String },
}

/// Errors raised by a transport while attempting one method.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("authentication rejected by peer")]
    Rejected,
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The connection itself is unusable. Aborts the whole negotiation.
    #[error("connection lost: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is not a valid OpenSSH private key: {source}", .path.display())]
    Decode { path: PathBuf, source: ssh_key::Error },
    #[error("{} is encrypted and no passphrase was given", .path.display())]
    PassphraseRequired { path: PathBuf },
    #[error("failed to decrypt {}: {source}", .path.display())]
    Decrypt { path: PathBuf, source: ssh_key::Error },
    #[error("{} holds a {found} key, not {expected}", .path.display())]
    TypeMismatch {
        path: PathBuf,
        expected: KeyType,
        found: String,
    },
    #[error("failed to load certificate {}: {source}", .path.display())]
    Certificate { path: PathBuf, source: ssh_key::Error },
    #[error("{} is not an OpenSSH certificate: {reason}", .path.display())]
    MalformedCertificate { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("no agent socket configured (SSH_AUTH_SOCK is unset)")]
    NoSocket,
    #[error("agent connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed agent reply: {0}")]
    Malformed(String),
}

/// The error recorded for one failed stage attempt.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{stage} authentication rejected: {source}")]
    Rejected {
        stage: Stage,
        source: TransportError,
    },
    #[error("{stage} key unusable: {source}")]
    Key { stage: Stage, source: KeyError },
}

#[derive(Error, Debug)]
pub enum AuthError {
    /// Every stage was skipped or failed.
    #[error("{}", exhausted_message(.last_error))]
    AuthExhausted { last_error: Option<StageError> },
    #[error("transport failed during {stage} authentication: {source}")]
    Transport {
        stage: Stage,
        source: TransportError,
    },
    #[error("stage order must list each stage at most once and at least one stage")]
    InvalidStageOrder,
}

fn exhausted_message(last_error: &Option<StageError>) -> String {
    match last_error {
        Some(e) => format!("all authentication methods exhausted; last error: {}", e),
        None => "No authentication methods available".to_string(),
    }
}
