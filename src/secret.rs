//! Secret resolution.
//!
//! Some clusters insist on a password even when keys are configured. The password is looked up by
//! logical name through a `SecretSource`, so tests can hand in a map instead of mutating the
//! process environment.

use std::collections::HashMap;

use tracing::debug;

use crate::error::SecretError;

/// Resolves a logical credential name to a secret.
pub trait SecretSource {
    fn secret(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretSource for EnvSecrets {
    fn secret(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl SecretSource for HashMap<String, String> {
    fn secret(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl<F> SecretSource for F
where
    F: Fn(&str) -> Option<String>,
{
    fn secret(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// Where a required password comes from: `<PREFIX>_<USERNAME>` with the user name upper-cased,
/// then the shared `<PREFIX>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordEnv {
    /// Human readable name of the deployment target, for diagnostics.
    pub target: String,
    pub prefix: String,
}

impl PasswordEnv {
    pub fn new(target: &str, prefix: &str) -> Self {
        Self {
            target: target.to_string(),
            prefix: prefix.to_string(),
        }
    }

    pub fn user_variable(&self, username: &str) -> String {
        format!("{}_{}", self.prefix, username.to_uppercase())
    }

    /// Looks up the password for `username`. Empty values count as unset.
    pub fn resolve(
        &self,
        username: &str,
        source: &dyn SecretSource,
    ) -> Result<String, SecretError> {
        let user_variable = self.user_variable(username);
        for name in [user_variable.as_str(), self.prefix.as_str()] {
            match source.secret(name) {
                Some(password) if !password.is_empty() => {
                    debug!(variable = name, "Found password");
                    return Ok(password);
                }
                _ => {}
            }
        }
        Err(SecretError::MissingPassword {
            target: self.target.clone(),
            variable: user_variable,
        })
    }
}
