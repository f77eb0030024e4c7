//! Credential domain types
//!
//! Secret material is wrapped in [`Secret`] so it can not end up in logs or
//! reports through `Debug` or `Display`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Redacted placeholder used wherever a secret would be printed
pub const REDACTED: &str = "****";

/// A secret string whose formatting is always redacted
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw secret value
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Secret material held by a credential store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    UsernamePassword { username: String, password: Secret },
    SecretText(Secret),
}

impl Credential {
    /// Kind label used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::UsernamePassword { .. } => "username/password",
            Credential::SecretText(_) => "secret text",
        }
    }

    /// Values that must be masked while this credential is in scope
    pub fn secrets(&self) -> Vec<&str> {
        match self {
            Credential::UsernamePassword { password, .. } => vec![password.expose()],
            Credential::SecretText(secret) => vec![secret.expose()],
        }
    }
}

/// How a step exposes a credential to the command it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialBinding {
    /// Username and password exported as two environment variables
    UsernamePassword {
        credential: String,
        username_variable: String,
        password_variable: String,
    },
    /// Secret text exported as one environment variable
    SecretText {
        credential: String,
        variable: String,
    },
}

impl CredentialBinding {
    /// Name of the referenced credential
    pub fn credential(&self) -> &str {
        match self {
            CredentialBinding::UsernamePassword { credential, .. } => credential,
            CredentialBinding::SecretText { credential, .. } => credential,
        }
    }
}
