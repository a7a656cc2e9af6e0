//! Named pool of lazily initialized credential providers.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use once_cell::sync::OnceCell;

use super::{Credential, Provider};
use crate::error::AuthError;

struct PoolEntry {
    provider: Arc<dyn Provider>,
    initialized: OnceCell<()>,
}

/// Registry of credential providers keyed by name.
///
/// Providers are initialized on first use and cached; a failed
/// initialization is retried on the next request.
#[derive(Default)]
pub struct ProviderPool {
    providers: HashMap<String, PoolEntry>,
}

impl ProviderPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Result<(), AuthError> {
        let name = name.into();
        if self.providers.contains_key(&name) {
            return Err(AuthError::DuplicateProvider { name });
        }
        self.providers.insert(
            name,
            PoolEntry {
                provider,
                initialized: OnceCell::new(),
            },
        );
        Ok(())
    }

    /// Get an initialized provider by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, AuthError> {
        let entry = self
            .providers
            .get(name)
            .ok_or_else(|| AuthError::UnknownProvider {
                name: name.to_string(),
            })?;

        entry.initialized.get_or_try_init(|| {
            debug!("initializing auth provider '{}'", name);
            entry
                .provider
                .init()
                .map_err(|e| AuthError::ProviderInit {
                    name: name.to_string(),
                    message: e.to_string(),
                })
        })?;

        Ok(entry.provider.clone())
    }

    /// Resolve `path` in the provider called `provider`.
    pub fn lookup(&self, provider: &str, path: &str) -> Result<Arc<dyn Credential>, AuthError> {
        self.get(provider)?.lookup(path)
    }

    /// Check if a provider is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// List all registered provider names.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.providers.keys()
    }
}
