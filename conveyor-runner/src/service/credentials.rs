//! Credential broker
//!
//! Credentials are looked up by name only when a step needs them and are
//! handed to a scope closure. When the scope returns, the materialized secret
//! and its masker are dropped; nothing is cached between scopes.

use conveyor_core::domain::credential::{Credential, CredentialBinding, REDACTED, Secret};
use conveyor_core::{PipelineError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Source of named credentials
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Credential>;
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads credentials from environment variables
///
/// For a credential named `registry` and the default prefix:
/// - `CONVEYOR_CREDENTIAL_REGISTRY_USERNAME` + `..._PASSWORD` -> username/password
/// - `CONVEYOR_CREDENTIAL_REGISTRY` -> secret text
///
/// Variables are read at lookup time, never at construction.
pub struct EnvCredentialStore {
    prefix: String,
    lookup: Lookup,
}

impl EnvCredentialStore {
    pub const DEFAULT_PREFIX: &'static str = "CONVEYOR_CREDENTIAL_";

    pub fn new() -> Self {
        Self::with_lookup(Self::DEFAULT_PREFIX, |key| std::env::var(key).ok())
    }

    pub fn with_lookup<F>(prefix: impl Into<String>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            prefix: prefix.into(),
            lookup: Box::new(lookup),
        }
    }

    /// `api-token` -> `CONVEYOR_CREDENTIAL_API_TOKEN`
    pub fn variable_name(&self, name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for EnvCredentialStore {
    fn lookup(&self, name: &str) -> Option<Credential> {
        let base = self.variable_name(name);

        let username = (self.lookup)(&format!("{}_USERNAME", base));
        let password = (self.lookup)(&format!("{}_PASSWORD", base));
        if let (Some(username), Some(password)) = (username, password) {
            return Some(Credential::UsernamePassword {
                username,
                password: Secret::new(password),
            });
        }

        (self.lookup)(&base).map(|value| Credential::SecretText(Secret::new(value)))
    }
}

/// Fixed set of credentials, for tests and embedding
#[derive(Debug, Default, Clone)]
pub struct InMemoryCredentialStore {
    credentials: HashMap<String, Credential>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, credential: Credential) {
        self.credentials.insert(name.into(), credential);
    }

    pub fn with_username_password(
        mut self,
        name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.insert(
            name,
            Credential::UsernamePassword {
                username: username.into(),
                password: Secret::new(password),
            },
        );
        self
    }

    pub fn with_secret_text(mut self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.insert(name, Credential::SecretText(Secret::new(secret)));
        self
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn lookup(&self, name: &str) -> Option<Credential> {
        self.credentials.get(name).cloned()
    }
}

/// Resolves named credentials for the duration of a scope
#[derive(Clone)]
pub struct CredentialBroker {
    store: Arc<dyn CredentialStore>,
}

impl CredentialBroker {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Materializes `name` and runs `scope` with it
    ///
    /// # Errors
    /// `CredentialNotFound` if the store does not know `name`; otherwise
    /// whatever the scope returns.
    pub async fn with_credential<F, Fut, T>(&self, name: &str, scope: F) -> Result<T>
    where
        F: FnOnce(ScopedCredential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let credential = self
            .store
            .lookup(name)
            .ok_or_else(|| PipelineError::CredentialNotFound(name.to_string()))?;

        debug!("Credential '{}' materialized ({})", name, credential.kind());

        let result = scope(ScopedCredential {
            name: name.to_string(),
            credential,
        })
        .await;

        debug!("Credential '{}' released", name);
        result
    }
}

/// A credential that is only valid inside a [`CredentialBroker::with_credential`] scope
#[derive(Debug)]
pub struct ScopedCredential {
    name: String,
    credential: Credential,
}

impl ScopedCredential {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn username_password(&self) -> Result<(&str, &Secret)> {
        match &self.credential {
            Credential::UsernamePassword { username, password } => {
                Ok((username.as_str(), password))
            }
            Credential::SecretText(_) => Err(self.mismatch("username/password")),
        }
    }

    pub fn secret_text(&self) -> Result<&Secret> {
        match &self.credential {
            Credential::SecretText(secret) => Ok(secret),
            Credential::UsernamePassword { .. } => Err(self.mismatch("secret text")),
        }
    }

    /// Environment variables exposing this credential as `binding` asks
    pub fn bind(&self, binding: &CredentialBinding) -> Result<BTreeMap<String, Secret>> {
        let mut env = BTreeMap::new();
        match binding {
            CredentialBinding::UsernamePassword {
                username_variable,
                password_variable,
                ..
            } => {
                let (username, password) = self.username_password()?;
                env.insert(username_variable.clone(), Secret::new(username));
                env.insert(password_variable.clone(), password.clone());
            }
            CredentialBinding::SecretText { variable, .. } => {
                env.insert(variable.clone(), self.secret_text()?.clone());
            }
        }
        Ok(env)
    }

    /// Masker for text produced while this credential is in scope
    pub fn masker(&self) -> Masker {
        Masker::new(self.credential.secrets())
    }

    fn mismatch(&self, expected: &'static str) -> PipelineError {
        PipelineError::CredentialKindMismatch {
            name: self.name.clone(),
            expected,
        }
    }
}

/// Replaces secret values in text with `****`
#[derive(Clone, Default)]
pub struct Masker {
    secrets: Vec<String>,
}

impl Masker {
    pub fn new<'a>(secrets: impl IntoIterator<Item = &'a str>) -> Self {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .filter(|secret| !secret.is_empty())
            .map(str::to_string)
            .collect();
        // Longest first, so a secret containing another is masked whole
        secrets.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
        Self { secrets }
    }

    pub fn mask(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |masked, secret| masked.replace(secret.as_str(), REDACTED))
    }
}

impl fmt::Debug for Masker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Masker({} secrets)", self.secrets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> CredentialBroker {
        let store = InMemoryCredentialStore::new()
            .with_username_password("registry", "ci-bot", "pa55w0rd")
            .with_secret_text("api-token", "tok-123");
        CredentialBroker::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_with_credential_binds_secret_text() {
        let binding = CredentialBinding::SecretText {
            credential: "api-token".to_string(),
            variable: "TOKEN".to_string(),
        };

        let env = broker()
            .with_credential("api-token", |credential| async move { credential.bind(&binding) })
            .await
            .unwrap();

        assert_eq!(env["TOKEN"].expose(), "tok-123");
    }

    #[tokio::test]
    async fn test_with_credential_unknown_name() {
        let result = broker()
            .with_credential("missing", |_| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(PipelineError::CredentialNotFound(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn test_kind_mismatch() {
        let result = broker()
            .with_credential("api-token", |credential| async move {
                credential.username_password().map(|_| ())
            })
            .await;
        assert!(matches!(result, Err(PipelineError::CredentialKindMismatch { .. })));
    }

    #[tokio::test]
    async fn test_masker_hides_password() {
        let masked = broker()
            .with_credential("registry", |credential| async move {
                Ok(credential
                    .masker()
                    .mask("login ci-bot:pa55w0rd succeeded, pa55w0rd"))
            })
            .await
            .unwrap();
        assert_eq!(masked, "login ci-bot:**** succeeded, ****");
    }

    #[test]
    fn test_masker_prefers_longest_secret() {
        let masker = Masker::new(["abc", "abcdef"]);
        assert_eq!(masker.mask("x abcdef y abc"), "x **** y ****");
        assert_eq!(Masker::default().mask("plain"), "plain");
        assert!(!format!("{:?}", masker).contains("abc"));
    }

    #[test]
    fn test_env_store_lookup() {
        let store = EnvCredentialStore::with_lookup(EnvCredentialStore::DEFAULT_PREFIX, |key| {
            match key {
                "CONVEYOR_CREDENTIAL_REGISTRY_USERNAME" => Some("ci".to_string()),
                "CONVEYOR_CREDENTIAL_REGISTRY_PASSWORD" => Some("pw".to_string()),
                "CONVEYOR_CREDENTIAL_API_TOKEN" => Some("tok".to_string()),
                _ => None,
            }
        });

        assert_eq!(
            store.lookup("registry"),
            Some(Credential::UsernamePassword {
                username: "ci".to_string(),
                password: Secret::new("pw"),
            })
        );
        assert_eq!(
            store.lookup("api-token"),
            Some(Credential::SecretText(Secret::new("tok")))
        );
        assert_eq!(store.lookup("nope"), None);
    }
}
