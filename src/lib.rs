//! hpc-negotiate: resource and credential negotiation for quirky HPC clusters.

// Serde helper module.
mod serde;
// Command line arguments.
pub mod config;
// Job resource resolution.
pub mod resources;
// Secret lookup.
pub mod secret;
// SSH keys and key-file discovery.
pub mod keys;
// SSH agent client.
pub mod agent;
// The transport authentication runs on.
pub mod transport;
// Credential negotiation.
pub mod auth;
// Per-cluster settings.
pub mod profile;
// Error handling.
pub mod error;

pub use auth::{Authenticated, CredentialBundle, Negotiator, Stage, StageOrder};
pub use error::{AuthError, NegotiateError, ResourceError, SecretError, StageError, TransportError};
pub use keys::{Identity, KeyCandidate, KeyDecoder, KeyType, OpensshDecoder};
pub use profile::Profile;
pub use resources::{
    load_resource_file, read_resource_params, ParamValue, PopulationRule, ResolvedResources,
    ResourceSpec,
};
pub use secret::{EnvSecrets, PasswordEnv, SecretSource};
pub use transport::{AuthResponse, AuthTransport, DryRunTransport};
