//! Registry of expected uploads.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::debug;
use tokio::sync::mpsc;

use super::ReceivedFile;
use crate::error::IntakeError;

/// An upload some job is waiting for.
#[derive(Debug)]
pub struct PendingReceipt {
    token: String,
    sender: mpsc::Sender<ReceivedFile>,
    created_at: Instant,
}

impl PendingReceipt {
    /// Token prefix the upload filename must start with.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the receipt was registered.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    accepting: bool,
    receipts: Vec<PendingReceipt>,
}

/// Pending receipts in registration order, guarded by one mutex.
#[derive(Debug, Default)]
pub struct ReceiptRegistry {
    state: Mutex<RegistryState>,
}

impl ReceiptRegistry {
    /// Create an empty registry that does not accept registrations yet.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a receipt for `token`.
    ///
    /// The receipt stays registered until the returned guard is dropped.
    pub fn register(
        self: &Arc<Self>,
        token: impl Into<String>,
        sender: mpsc::Sender<ReceivedFile>,
    ) -> Result<ReceiptGuard, IntakeError> {
        let token = token.into();
        let mut state = self.lock();

        if !state.accepting {
            return Err(IntakeError::NotRunning);
        }
        if state.receipts.iter().any(|r| r.token == token) {
            return Err(IntakeError::RegistrationConflict { token });
        }

        debug!("intake: expecting upload for token {}", token);
        state.receipts.push(PendingReceipt {
            token: token.clone(),
            sender,
            created_at: Instant::now(),
        });

        Ok(ReceiptGuard {
            registry: Arc::clone(self),
            token,
        })
    }

    /// Find the first receipt whose token is a prefix of `filename`.
    ///
    /// Returns the matched token and a sender for delivery. The receipt
    /// itself stays registered.
    pub fn route(&self, filename: &str) -> Option<(String, mpsc::Sender<ReceivedFile>)> {
        self.lock()
            .receipts
            .iter()
            .find(|r| filename.starts_with(&r.token))
            .map(|r| (r.token.clone(), r.sender.clone()))
    }

    /// Remove the receipt for `token`. Returns false if none was registered.
    pub fn unregister(&self, token: &str) -> bool {
        let mut state = self.lock();
        let before = state.receipts.len();
        state.receipts.retain(|r| r.token != token);
        state.receipts.len() != before
    }

    /// Drop every receipt and stop or start accepting registrations.
    ///
    /// Returns the number of receipts removed. Jobs waiting on a dropped
    /// receipt observe a closed channel.
    pub(crate) fn reset(&self, accepting: bool) -> usize {
        let mut state = self.lock();
        state.accepting = accepting;
        let dropped = state.receipts.len();
        state.receipts.clear();
        dropped
    }

    /// Number of pending receipts.
    pub fn len(&self) -> usize {
        self.lock().receipts.len()
    }

    /// Check if no receipt is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().receipts.is_empty()
    }

    /// Tokens of all pending receipts, in registration order.
    pub fn tokens(&self) -> Vec<String> {
        self.lock().receipts.iter().map(|r| r.token.clone()).collect()
    }
}

/// Keeps a receipt registered; unregisters it on drop.
#[derive(Debug)]
pub struct ReceiptGuard {
    registry: Arc<ReceiptRegistry>,
    token: String,
}

impl ReceiptGuard {
    /// The registered token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for ReceiptGuard {
    fn drop(&mut self) {
        if self.registry.unregister(&self.token) {
            debug!("intake: released token {}", self.token);
        }
    }
}
