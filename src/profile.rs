//! Deployment profiles.
//!
//! A profile bundles what differs between clusters: the stage order and whether a password must
//! come from the environment.

use tracing::debug;

use crate::auth::{Authenticated, CredentialBundle, Negotiator, StageOrder};
use crate::error::{NegotiateError, SecretError};
use crate::secret::{PasswordEnv, SecretSource};
use crate::transport::AuthTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub order: StageOrder,
    /// Set when the cluster insists on a password.
    pub password_env: Option<PasswordEnv>,
}

impl Profile {
    /// ARCHER2 asks for the password before it looks at keys.
    pub fn archer2() -> Self {
        Self {
            name: "archer2".to_string(),
            order: StageOrder::password_first(),
            password_env: Some(PasswordEnv::new("ARCHER2", "ARCHER2_PASS")),
        }
    }

    pub fn standard() -> Self {
        Self {
            name: "standard".to_string(),
            order: StageOrder::key_first(),
            password_env: None,
        }
    }

    pub fn with_order(mut self, order: StageOrder) -> Self {
        self.order = order;
        self
    }

    /// Fills in the required password. An explicitly given password wins.
    pub fn prepare(
        &self,
        mut bundle: CredentialBundle,
        secrets: &dyn SecretSource,
    ) -> Result<CredentialBundle, SecretError> {
        if let (Some(env), None) = (&self.password_env, &bundle.password) {
            bundle.password = Some(env.resolve(&bundle.username, secrets)?);
        }
        Ok(bundle)
    }

    pub fn negotiator(&self) -> Negotiator {
        Negotiator::new(self.order.clone())
    }

    /// Resolves the password, then negotiates. A missing password fails before the transport is
    /// touched.
    pub async fn authenticate<T>(
        &self,
        negotiator: &Negotiator,
        bundle: CredentialBundle,
        secrets: &dyn SecretSource,
        transport: &mut T,
    ) -> Result<Authenticated, NegotiateError>
    where
        T: AuthTransport + ?Sized,
    {
        let bundle = self.prepare(bundle, secrets)?;
        debug!(profile = %self.name, ?bundle, "Starting authentication");
        Ok(negotiator.authenticate(&bundle, transport).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_archer2_requires_password() {
        let secrets: HashMap<String, String> = HashMap::new();
        let err = Profile::archer2()
            .prepare(CredentialBundle::new("alice"), &secrets)
            .unwrap_err();
        assert!(err.to_string().contains("ARCHER2_PASS_ALICE"));
    }

    #[test]
    fn test_archer2_reads_password() {
        let mut secrets = HashMap::new();
        secrets.insert("ARCHER2_PASS_ALICE".to_string(), "hunter2".to_string());
        let bundle = Profile::archer2()
            .prepare(CredentialBundle::new("alice"), &secrets)
            .unwrap();
        assert_eq!(bundle.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_explicit_password_wins() {
        let mut secrets = HashMap::new();
        secrets.insert("ARCHER2_PASS".to_string(), "shared".to_string());
        let bundle = Profile::archer2()
            .prepare(CredentialBundle::new("alice").password("given"), &secrets)
            .unwrap();
        assert_eq!(bundle.password.as_deref(), Some("given"));
    }

    #[test]
    fn test_standard_reads_nothing() {
        let source = |_: &str| -> Option<String> { panic!("standard profile read a secret") };
        let bundle = Profile::standard()
            .prepare(CredentialBundle::new("alice"), &source)
            .unwrap();
        assert!(bundle.password.is_none());
        assert_eq!(Profile::standard().order, StageOrder::key_first());
    }
}
