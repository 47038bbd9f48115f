//! Credential negotiation.
//!
//! Authentication runs as an ordered list of stages. A stage either authenticates the session
//! (negotiation ends), is skipped because its material is absent, or fails. Failures are
//! remembered and the next stage runs; only when every stage is used up does the last failure
//! reach the caller. The order is configuration, so clusters that want the password before any
//! key share the same machinery as the usual key-first order.

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::agent::{KeyAgent, UnixAgent};
use crate::error::{AuthError, StageError, TransportError};
use crate::keys::{
    default_candidates, default_key_dirs, expand_candidates, Identity, KeyDecoder, KeyType,
    OpensshDecoder,
};
use crate::transport::{AuthResponse, AuthTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Password,
    /// A key handed over already loaded.
    ExplicitKey,
    /// The key files listed by the caller.
    KeyFiles,
    /// Conventional key files in the user's SSH directories.
    DefaultKeys,
    Agent,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Password => "password",
            Self::ExplicitKey => "explicit key",
            Self::KeyFiles => "key file",
            Self::DefaultKeys => "default key",
            Self::Agent => "agent key",
        };
        write!(f, "{}", name)
    }
}

/// The order stages run in. Each stage appears at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOrder(Vec<Stage>);

impl StageOrder {
    pub fn new(stages: Vec<Stage>) -> Result<Self, AuthError> {
        let mut seen = Vec::with_capacity(stages.len());
        for stage in &stages {
            if seen.contains(stage) {
                return Err(AuthError::InvalidStageOrder);
            }
            seen.push(*stage);
        }
        if stages.is_empty() {
            return Err(AuthError::InvalidStageOrder);
        }
        Ok(Self(stages))
    }

    /// Password, then keys, then the agent.
    pub fn password_first() -> Self {
        Self(vec![
            Stage::Password,
            Stage::ExplicitKey,
            Stage::KeyFiles,
            Stage::DefaultKeys,
            Stage::Agent,
        ])
    }

    /// Keys and the agent, with the password tried last.
    pub fn key_first() -> Self {
        Self(vec![
            Stage::ExplicitKey,
            Stage::KeyFiles,
            Stage::DefaultKeys,
            Stage::Agent,
            Stage::Password,
        ])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.0
    }
}

/// The credential material for one connection attempt.
#[derive(Clone)]
pub struct CredentialBundle {
    pub username: String,
    pub password: Option<String>,
    /// Unlocks encrypted key files. Falls back to `password` when unset.
    pub passphrase: Option<String>,
    pub pkey: Option<Identity>,
    pub key_filenames: Vec<PathBuf>,
    pub allow_agent: bool,
    pub look_for_keys: bool,
}

impl CredentialBundle {
    /// Defaults follow the usual connect options: look for keys, stay away from the agent.
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: None,
            passphrase: None,
            pkey: None,
            key_filenames: vec![],
            allow_agent: false,
            look_for_keys: true,
        }
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn passphrase(mut self, passphrase: &str) -> Self {
        self.passphrase = Some(passphrase.to_string());
        self
    }

    pub fn key(mut self, identity: Identity) -> Self {
        self.pkey = Some(identity);
        self
    }

    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_filenames.push(path.into());
        self
    }

    pub fn allow_agent(mut self, allow: bool) -> Self {
        self.allow_agent = allow;
        self
    }

    pub fn look_for_keys(mut self, look: bool) -> Self {
        self.look_for_keys = look;
        self
    }

    fn effective_passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref().or(self.password.as_deref())
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let redacted = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>");
        f.debug_struct("CredentialBundle")
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("passphrase", &redacted(&self.passphrase))
            .field("pkey", &self.pkey.as_ref().map(|key| key.fingerprint()))
            .field("key_filenames", &self.key_filenames)
            .field("allow_agent", &self.allow_agent)
            .field("look_for_keys", &self.look_for_keys)
            .finish()
    }
}

/// How a negotiation ended successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub stage: Stage,
    /// Fingerprint of the accepted key, if the stage used one.
    pub key: Option<String>,
}

impl Authenticated {
    fn new(stage: Stage, identity: Option<&Identity>) -> Self {
        Self {
            stage,
            key: identity.map(Identity::fingerprint),
        }
    }
}

/// Outcome of offering one credential.
enum Offer {
    Accepted,
    /// The peer accepted but wants another method; move on.
    Partial,
    Failed,
}

/// Per-call state: the transport and the most recent failure.
struct Attempt<'a, T: ?Sized> {
    bundle: &'a CredentialBundle,
    transport: &'a mut T,
    last_error: Option<StageError>,
}

impl<T: AuthTransport + ?Sized> Attempt<'_, T> {
    fn settle(
        &mut self,
        stage: Stage,
        result: Result<AuthResponse, TransportError>,
    ) -> Result<Offer, AuthError> {
        match result {
            Ok(AuthResponse::Success) => Ok(Offer::Accepted),
            // Nothing left that the peer would accept: the session is as authenticated as it gets.
            Ok(AuthResponse::Partial(methods)) if methods.is_empty() => {
                debug!(%stage, "Partial success with no further methods allowed");
                Ok(Offer::Accepted)
            }
            Ok(AuthResponse::Partial(methods)) => {
                debug!(%stage, ?methods, "Partial success, peer wants more");
                Ok(Offer::Partial)
            }
            Err(TransportError::Io(source)) => Err(AuthError::Transport {
                stage,
                source: TransportError::Io(source),
            }),
            Err(source) => {
                warn!(%stage, error = %source, "Authentication attempt failed");
                self.last_error = Some(StageError::Rejected { stage, source });
                Ok(Offer::Failed)
            }
        }
    }

    async fn offer_password(&mut self, password: &str) -> Result<Offer, AuthError> {
        debug!(username = %self.bundle.username, "Trying password");
        let result = self
            .transport
            .auth_password(&self.bundle.username, password)
            .await;
        self.settle(Stage::Password, result)
    }

    async fn offer_key(&mut self, stage: Stage, identity: &Identity) -> Result<Offer, AuthError> {
        debug!(%stage, key = %identity, "Trying SSH key");
        let result = self
            .transport
            .auth_publickey(&self.bundle.username, identity)
            .await;
        self.settle(stage, result)
    }
}

/// Runs the stages of a `StageOrder` against a transport.
pub struct Negotiator {
    order: StageOrder,
    decoder: Box<dyn KeyDecoder>,
    agent: Box<dyn KeyAgent>,
    key_dirs: Vec<PathBuf>,
}

impl Negotiator {
    pub fn new(order: StageOrder) -> Self {
        Self {
            order,
            decoder: Box::new(OpensshDecoder),
            agent: Box::new(UnixAgent::from_env()),
            key_dirs: default_key_dirs(),
        }
    }

    pub fn with_decoder(mut self, decoder: impl KeyDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn with_agent(mut self, agent: impl KeyAgent + 'static) -> Self {
        self.agent = Box::new(agent);
        self
    }

    /// Directories searched by the default key stage.
    pub fn with_key_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.key_dirs = dirs;
        self
    }

    pub fn order(&self) -> &StageOrder {
        &self.order
    }

    /// Tries every stage in order until one authenticates the session.
    ///
    /// Rejections and unusable keys are recorded and skipped over. If nothing succeeds the error
    /// carries the most recent failure, or none if every stage was skipped. A broken connection
    /// ends the negotiation at once.
    pub async fn authenticate<T>(
        &self,
        bundle: &CredentialBundle,
        transport: &mut T,
    ) -> Result<Authenticated, AuthError>
    where
        T: AuthTransport + ?Sized,
    {
        let mut attempt = Attempt {
            bundle,
            transport,
            last_error: None,
        };

        for &stage in self.order.stages() {
            let authenticated = match stage {
                Stage::Password => self.password_stage(&mut attempt).await?,
                Stage::ExplicitKey => self.explicit_key_stage(&mut attempt).await?,
                Stage::KeyFiles => self.key_files_stage(&mut attempt).await?,
                Stage::DefaultKeys => self.default_keys_stage(&mut attempt).await?,
                Stage::Agent => self.agent_stage(&mut attempt).await?,
            };
            if let Some(authenticated) = authenticated {
                info!(%stage, username = %bundle.username, "Authenticated");
                return Ok(authenticated);
            }
        }

        Err(AuthError::AuthExhausted {
            last_error: attempt.last_error,
        })
    }

    // Each stage returns `Some` once the session is authenticated.

    async fn password_stage<T: AuthTransport + ?Sized>(
        &self,
        attempt: &mut Attempt<'_, T>,
    ) -> Result<Option<Authenticated>, AuthError> {
        let bundle = attempt.bundle;
        let Some(password) = bundle.password.as_deref() else {
            debug!("No password, skipping");
            return Ok(None);
        };
        match attempt.offer_password(password).await? {
            Offer::Accepted => Ok(Some(Authenticated::new(Stage::Password, None))),
            Offer::Partial | Offer::Failed => Ok(None),
        }
    }

    async fn explicit_key_stage<T: AuthTransport + ?Sized>(
        &self,
        attempt: &mut Attempt<'_, T>,
    ) -> Result<Option<Authenticated>, AuthError> {
        let bundle = attempt.bundle;
        let Some(identity) = bundle.pkey.as_ref() else {
            debug!("No explicit key, skipping");
            return Ok(None);
        };
        match attempt.offer_key(Stage::ExplicitKey, identity).await? {
            Offer::Accepted => Ok(Some(Authenticated::new(
                Stage::ExplicitKey,
                Some(identity),
            ))),
            Offer::Partial | Offer::Failed => Ok(None),
        }
    }

    async fn key_files_stage<T: AuthTransport + ?Sized>(
        &self,
        attempt: &mut Attempt<'_, T>,
    ) -> Result<Option<Authenticated>, AuthError> {
        let bundle = attempt.bundle;
        let passphrase = bundle.effective_passphrase();
        for candidate in expand_candidates(&bundle.key_filenames) {
            for key_type in KeyType::PRIORITY {
                let identity = match self.decoder.decode(&candidate, key_type, passphrase) {
                    Ok(identity) => identity,
                    Err(source) => {
                        debug!(path = %candidate.path().display(), %key_type, error = %source, "Key did not decode");
                        attempt.last_error = Some(StageError::Key {
                            stage: Stage::KeyFiles,
                            source,
                        });
                        continue;
                    }
                };
                // The first type that decodes is the key's type.
                if let Offer::Accepted = attempt.offer_key(Stage::KeyFiles, &identity).await? {
                    return Ok(Some(Authenticated::new(Stage::KeyFiles, Some(&identity))));
                }
                break;
            }
        }
        Ok(None)
    }

    async fn default_keys_stage<T: AuthTransport + ?Sized>(
        &self,
        attempt: &mut Attempt<'_, T>,
    ) -> Result<Option<Authenticated>, AuthError> {
        let bundle = attempt.bundle;
        if !bundle.look_for_keys {
            debug!("Not looking for keys, skipping");
            return Ok(None);
        }
        let passphrase = bundle.effective_passphrase();
        for (key_type, candidate) in default_candidates(&self.key_dirs) {
            let identity = match self.decoder.decode(&candidate, key_type, passphrase) {
                Ok(identity) => identity,
                Err(source) => {
                    debug!(path = %candidate.path().display(), error = %source, "Default key unusable");
                    attempt.last_error = Some(StageError::Key {
                        stage: Stage::DefaultKeys,
                        source,
                    });
                    continue;
                }
            };
            match attempt.offer_key(Stage::DefaultKeys, &identity).await? {
                Offer::Accepted => {
                    return Ok(Some(Authenticated::new(Stage::DefaultKeys, Some(&identity))))
                }
                Offer::Partial => break,
                Offer::Failed => {}
            }
        }
        Ok(None)
    }

    async fn agent_stage<T: AuthTransport + ?Sized>(
        &self,
        attempt: &mut Attempt<'_, T>,
    ) -> Result<Option<Authenticated>, AuthError> {
        if !attempt.bundle.allow_agent {
            debug!("Agent not allowed, skipping");
            return Ok(None);
        }
        let identities = match self.agent.identities().await {
            Ok(identities) => identities,
            Err(e) => {
                debug!(error = %e, "No agent keys");
                return Ok(None);
            }
        };
        for identity in identities {
            match attempt.offer_key(Stage::Agent, &identity).await? {
                Offer::Accepted => return Ok(Some(Authenticated::new(Stage::Agent, Some(&identity)))),
                Offer::Partial => break,
                Offer::Failed => {}
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variants_cover_every_stage_once() {
        for order in [StageOrder::password_first(), StageOrder::key_first()] {
            assert_eq!(order.stages().len(), 5);
            assert!(StageOrder::new(order.stages().to_vec()).is_ok());
        }
        assert_eq!(StageOrder::password_first().stages()[0], Stage::Password);
        assert_eq!(StageOrder::key_first().stages()[4], Stage::Password);
    }

    #[test]
    fn test_stage_order_rejects_duplicates_and_empty() {
        assert!(matches!(
            StageOrder::new(vec![Stage::Password, Stage::Agent, Stage::Password]),
            Err(AuthError::InvalidStageOrder)
        ));
        assert!(matches!(
            StageOrder::new(vec![]),
            Err(AuthError::InvalidStageOrder)
        ));
        assert!(StageOrder::new(vec![Stage::Agent]).is_ok());
    }

    #[test]
    fn test_passphrase_falls_back_to_password() {
        let bundle = CredentialBundle::new("alice").password("secret");
        assert_eq!(bundle.effective_passphrase(), Some("secret"));
        let bundle = bundle.passphrase("other");
        assert_eq!(bundle.effective_passphrase(), Some("other"));
        assert_eq!(CredentialBundle::new("alice").effective_passphrase(), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let bundle = CredentialBundle::new("alice")
            .password("hunter2")
            .passphrase("swordfish");
        let printed = format!("{:?}", bundle);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("swordfish"));
        assert!(printed.contains("alice"));
    }
}
