//! Script host backed by a live interactive session.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Mutex;

use super::AutomationHost;
use crate::auth::Credential;
use crate::channel::{InteractiveSession, Pattern};
use crate::error::PrimitiveError;

/// [`AutomationHost`] that forwards to an [`InteractiveSession`].
///
/// Must be used from a blocking thread (e.g. `spawn_blocking`); each
/// primitive drives the async session to completion on `runtime`.
pub struct SessionHost {
    session: Arc<Mutex<InteractiveSession>>,
    credential: Arc<dyn Credential>,
    runtime: Handle,
    default_timeout: Duration,
}

impl SessionHost {
    pub fn new(
        session: Arc<Mutex<InteractiveSession>>,
        credential: Arc<dyn Credential>,
        runtime: Handle,
        default_timeout: Duration,
    ) -> Self {
        Self {
            session,
            credential,
            runtime,
            default_timeout,
        }
    }
}

impl AutomationHost for SessionHost {
    fn expect(&mut self, pattern: &Pattern, timeout: Duration) -> Result<String, PrimitiveError> {
        self.runtime
            .block_on(async { self.session.lock().await.expect(pattern, timeout).await })
            .map_err(PrimitiveError::from)
    }

    fn send_line(&mut self, text: &str) -> Result<(), PrimitiveError> {
        self.runtime
            .block_on(async { self.session.lock().await.send_line(text).await })
            .map_err(PrimitiveError::from)
    }

    fn read_line(&mut self) -> Result<String, PrimitiveError> {
        self.runtime
            .block_on(async { self.session.lock().await.read_line().await })
            .map_err(PrimitiveError::from)
    }

    fn auth_attr(&self, name: &str) -> Result<String, PrimitiveError> {
        Ok(self.credential.attribute(name)?)
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}
