//! In-memory credential table.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use super::{Credential, Provider};
use crate::error::AuthError;
use crate::transport::{AuthMethod, ConnectionParameters};

/// A credential defined directly in configuration.
#[derive(Debug, Clone)]
pub struct StaticCredential {
    username: String,
    auth: Option<AuthMethod>,
    attributes: BTreeMap<String, SecretString>,
}

impl StaticCredential {
    /// Create a credential for `username` with no authentication method yet.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Use password authentication.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.auth = Some(AuthMethod::Password(SecretString::from(password.into())));
        self
    }

    /// Use private key authentication.
    pub fn with_private_key(
        mut self,
        path: impl Into<PathBuf>,
        passphrase: Option<String>,
    ) -> Self {
        self.auth = Some(AuthMethod::PrivateKey {
            path: path.into(),
            passphrase: passphrase.map(SecretString::from),
        });
        self
    }

    /// Add a named attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .insert(name.into(), SecretString::from(value.into()));
        self
    }

    /// Username of this credential.
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Credential for StaticCredential {
    fn connection_parameters(&self) -> Result<ConnectionParameters, AuthError> {
        let auth = self.auth.clone().ok_or_else(|| AuthError::Incomplete {
            path: self.username.clone(),
            message: "no password or private key".to_string(),
        })?;

        Ok(ConnectionParameters {
            username: self.username.clone(),
            auth,
        })
    }

    fn attribute(&self, name: &str) -> Result<String, AuthError> {
        self.attributes
            .get(name)
            .map(|value| value.expose_secret().to_string())
            .ok_or_else(|| AuthError::AttributeNotFound {
                name: name.to_string(),
                available: self.attributes.keys().cloned().collect(),
            })
    }
}

/// Provider backed by a fixed table of credentials.
#[derive(Debug, Default)]
pub struct StaticProvider {
    auths: HashMap<String, Arc<StaticCredential>>,
}

impl StaticProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a credential under `path`.
    pub fn add_auth(
        &mut self,
        path: impl Into<String>,
        credential: StaticCredential,
    ) -> Result<(), AuthError> {
        let path = path.into();
        if self.auths.contains_key(&path) {
            return Err(AuthError::DuplicateAuth { path });
        }
        self.auths.insert(path, Arc::new(credential));
        Ok(())
    }

    /// Number of stored credentials.
    pub fn len(&self) -> usize {
        self.auths.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }
}

impl Provider for StaticProvider {
    fn lookup(&self, path: &str) -> Result<Arc<dyn Credential>, AuthError> {
        self.auths
            .get(path)
            .map(|credential| credential.clone() as Arc<dyn Credential>)
            .ok_or_else(|| AuthError::NotFound {
                path: path.to_string(),
            })
    }
}
