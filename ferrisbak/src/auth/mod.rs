//! Credential providers.
//!
//! A [`Credential`] is the opaque handle a device holds: it yields the
//! parameters needed to log in and named attributes (enable secrets, TFTP
//! hosts, anything a script needs). Credentials come from named
//! [`Provider`]s collected in a [`ProviderPool`].

mod pool;
mod static_provider;

use std::sync::Arc;

pub use pool::ProviderPool;
pub use static_provider::{StaticCredential, StaticProvider};

use crate::error::AuthError;
use crate::transport::ConnectionParameters;

/// Connection credentials and attributes for one device.
pub trait Credential: Send + Sync {
    /// Username and authentication method for logging in.
    fn connection_parameters(&self) -> Result<ConnectionParameters, AuthError>;

    /// Look up a named attribute.
    ///
    /// Fails with [`AuthError::AttributeNotFound`] if absent.
    fn attribute(&self, name: &str) -> Result<String, AuthError>;
}

/// A source of credentials addressed by path.
pub trait Provider: Send + Sync {
    /// One-time initialization, run lazily by the pool before first use.
    fn init(&self) -> Result<(), AuthError> {
        Ok(())
    }

    /// Find the credential stored at `path`.
    fn lookup(&self, path: &str) -> Result<Arc<dyn Credential>, AuthError>;
}
