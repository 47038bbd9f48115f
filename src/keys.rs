//! SSH keys.
//!
//! Key files are tried against each supported key type in a fixed priority order. A certificate
//! next to a key (`<key>-cert.pub`) becomes its own candidate, tried right after the bare key.
//! Certificates are kept as the encoded blob the server is sent; a parsed view is attached when
//! `ssh-key` can represent it (it cannot for certificates valid "forever").

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ssh_key::{Algorithm, Certificate, HashAlg, PrivateKey, PublicKey};
use tracing::debug;

use crate::error::KeyError;

const CERTIFICATE_SUFFIX: &str = "-cert-v01@openssh.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Rsa,
    Dsa,
    Ecdsa,
    Ed25519,
}

impl KeyType {
    /// Order in which an explicitly given key file is decoded.
    pub const PRIORITY: [KeyType; 4] = [Self::Rsa, Self::Dsa, Self::Ecdsa, Self::Ed25519];

    /// Key types looked up in the default SSH directories, in order.
    pub const DEFAULT_LOCATIONS: [KeyType; 3] = [Self::Dsa, Self::Ecdsa, Self::Ed25519];

    /// Suffix of the conventional file name, as in `id_<suffix>`.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::Dsa => "dsa",
            Self::Ecdsa => "ecdsa",
            Self::Ed25519 => "ed25519",
        }
    }

    pub fn matches(&self, algorithm: &Algorithm) -> bool {
        matches!(
            (self, algorithm),
            (Self::Rsa, Algorithm::Rsa { .. })
                | (Self::Dsa, Algorithm::Dsa)
                | (Self::Ecdsa, Algorithm::Ecdsa { .. })
                | (Self::Ed25519, Algorithm::Ed25519)
        )
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Rsa => "RSA",
            Self::Dsa => "DSA",
            Self::Ecdsa => "ECDSA",
            Self::Ed25519 => "Ed25519",
        };
        write!(f, "{}", name)
    }
}

/// An OpenSSH certificate as read from a `-cert.pub` file.
#[derive(Debug, Clone)]
pub struct OpensshCertificate {
    algorithm: String,
    blob: Vec<u8>,
    comment: String,
    parsed: Option<Certificate>,
}

impl OpensshCertificate {
    /// Parses one `<algorithm> <base64 blob> [comment]` line.
    pub fn from_openssh(path: &Path, encoded: &str) -> Result<Self, KeyError> {
        let malformed = |reason: &str| KeyError::MalformedCertificate {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut fields = encoded.split_whitespace();
        let algorithm = fields.next().ok_or_else(|| malformed("empty file"))?;
        if !algorithm.ends_with(CERTIFICATE_SUFFIX) {
            return Err(malformed("not a certificate type"));
        }
        let blob = fields
            .next()
            .ok_or_else(|| malformed("missing certificate data"))
            .and_then(|data| STANDARD.decode(data).map_err(|_| malformed("invalid base64")))?;
        let comment = fields.collect::<Vec<_>>().join(" ");

        // The blob starts with its own type name, which must agree with the line.
        let embedded = blob
            .get(..4)
            .map(|len| u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize)
            .and_then(|len| blob.get(4..4 + len))
            .ok_or_else(|| malformed("truncated certificate"))?;
        if embedded != algorithm.as_bytes() {
            return Err(malformed("type does not match its data"));
        }

        let parsed = match Certificate::from_bytes(&blob) {
            Ok(certificate) => Some(certificate),
            // Validity beyond what `ssh-key` can represent, as in "forever".
            Err(ssh_key::Error::Time) => {
                debug!(path = %path.display(), "Certificate validity out of range, keeping raw blob");
                None
            }
            Err(source) => {
                return Err(KeyError::Certificate {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        Ok(Self {
            algorithm: algorithm.to_string(),
            blob,
            comment,
            parsed,
        })
    }

    /// Certificate type, e.g. `ssh-ed25519-cert-v01@openssh.com`.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Wire encoding, as offered to the server.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn parsed(&self) -> Option<&Certificate> {
        self.parsed.as_ref()
    }
}

/// Where an identity came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Handed over already loaded by the caller.
    Explicit,
    File(PathBuf),
    Agent,
}

/// Key material offered to the remote side.
#[derive(Debug, Clone)]
pub struct Identity {
    public: PublicKey,
    /// Absent for agent keys; the agent signs on our behalf.
    private: Option<PrivateKey>,
    certificate: Option<OpensshCertificate>,
    origin: IdentityOrigin,
}

impl Identity {
    pub fn from_private_key(key: PrivateKey, origin: IdentityOrigin) -> Self {
        Self {
            public: key.public_key().clone(),
            private: Some(key),
            certificate: None,
            origin,
        }
    }

    pub fn from_agent(public: PublicKey) -> Self {
        Self {
            public,
            private: None,
            certificate: None,
            origin: IdentityOrigin::Agent,
        }
    }

    pub fn with_certificate(mut self, certificate: OpensshCertificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private.as_ref()
    }

    pub fn certificate(&self) -> Option<&OpensshCertificate> {
        self.certificate.as_ref()
    }

    pub fn origin(&self) -> &IdentityOrigin {
        &self.origin
    }

    pub fn fingerprint(&self) -> String {
        self.public.fingerprint(HashAlg::Sha256).to_string()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.public.algorithm().as_str(), self.fingerprint())?;
        if self.certificate.is_some() {
            write!(f, " (certificate)")?;
        }
        match &self.origin {
            IdentityOrigin::Explicit => Ok(()),
            IdentityOrigin::File(path) => write!(f, " from {}", path.display()),
            IdentityOrigin::Agent => write!(f, " from agent"),
        }
    }
}

/// One file to try during key-file resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCandidate {
    Key(PathBuf),
    /// A certificate found next to `key`. Decoding loads `key` and attaches `cert`.
    Certificate { key: PathBuf, cert: PathBuf },
}

impl KeyCandidate {
    /// The file this candidate names.
    pub fn path(&self) -> &Path {
        match self {
            Self::Key(path) => path,
            Self::Certificate { cert, .. } => cert,
        }
    }
}

pub fn certificate_path(key: &Path) -> PathBuf {
    let mut name = key.as_os_str().to_os_string();
    name.push("-cert.pub");
    PathBuf::from(name)
}

/// Expands key paths into candidates, appending each existing certificate after its key.
pub fn expand_candidates(paths: &[PathBuf]) -> Vec<KeyCandidate> {
    let mut candidates = Vec::with_capacity(paths.len());
    for path in paths {
        push_with_certificate(&mut candidates, path);
    }
    candidates
}

fn push_with_certificate(candidates: &mut Vec<KeyCandidate>, key: &Path) {
    candidates.push(KeyCandidate::Key(key.to_path_buf()));
    let cert = certificate_path(key);
    if cert.is_file() {
        candidates.push(KeyCandidate::Certificate {
            key: key.to_path_buf(),
            cert,
        });
    }
}

/// `~/.ssh` and `~/ssh` (the latter is where Windows setups keep keys).
pub fn default_key_dirs() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    match home {
        Some(home) => {
            let home = PathBuf::from(home);
            vec![home.join(".ssh"), home.join("ssh")]
        }
        None => vec![],
    }
}

/// Finds the conventional key files that exist under `dirs`, each paired with the only key type
/// its name allows.
pub fn default_candidates(dirs: &[PathBuf]) -> Vec<(KeyType, KeyCandidate)> {
    let mut found = vec![];
    for key_type in KeyType::DEFAULT_LOCATIONS {
        for dir in dirs {
            let path = dir.join(format!("id_{}", key_type.file_suffix()));
            if path.is_file() {
                let mut candidates = vec![];
                push_with_certificate(&mut candidates, &path);
                found.extend(candidates.into_iter().map(|c| (key_type, c)));
            }
        }
    }
    found
}

/// Turns a candidate file into an identity of one particular key type.
pub trait KeyDecoder: Send + Sync {
    fn decode(
        &self,
        candidate: &KeyCandidate,
        key_type: KeyType,
        passphrase: Option<&str>,
    ) -> Result<Identity, KeyError>;
}

/// Decodes OpenSSH-format private keys and certificates from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensshDecoder;

impl OpensshDecoder {
    fn load_private(
        &self,
        path: &Path,
        key_type: KeyType,
        passphrase: Option<&str>,
    ) -> Result<PrivateKey, KeyError> {
        let pem = read(path)?;
        let key = PrivateKey::from_openssh(&pem).map_err(|source| KeyError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        let algorithm = key.algorithm();
        if !key_type.matches(&algorithm) {
            return Err(KeyError::TypeMismatch {
                path: path.to_path_buf(),
                expected: key_type,
                found: algorithm.as_str().to_string(),
            });
        }
        if !key.is_encrypted() {
            return Ok(key);
        }
        let passphrase = passphrase.ok_or_else(|| KeyError::PassphraseRequired {
            path: path.to_path_buf(),
        })?;
        key.decrypt(passphrase).map_err(|source| KeyError::Decrypt {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl KeyDecoder for OpensshDecoder {
    fn decode(
        &self,
        candidate: &KeyCandidate,
        key_type: KeyType,
        passphrase: Option<&str>,
    ) -> Result<Identity, KeyError> {
        match candidate {
            KeyCandidate::Key(path) => {
                let key = self.load_private(path, key_type, passphrase)?;
                Ok(Identity::from_private_key(
                    key,
                    IdentityOrigin::File(path.clone()),
                ))
            }
            KeyCandidate::Certificate { key, cert } => {
                let private = self.load_private(key, key_type, passphrase)?;
                let certificate = OpensshCertificate::from_openssh(cert, &read(cert)?)?;
                Ok(
                    Identity::from_private_key(private, IdentityOrigin::File(cert.clone()))
                        .with_certificate(certificate),
                )
            }
        }
    }
}

fn read(path: &Path) -> Result<String, KeyError> {
    fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.to_path_buf(),
        source,
    })
}
