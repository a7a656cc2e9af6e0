//! TFTP file intake.
//!
//! Devices push their configuration to an [`IntakeServer`] under a filename
//! that starts with a job's upload token. Jobs register the token with
//! [`IntakeHandle::expect_file`] and wait on a channel; the server matches
//! each incoming write request against the pending tokens and delivers the
//! received bytes to the job that asked for them.

pub mod packet;
mod registry;
mod server;
mod transfer;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub use packet::{ErrorCode, Packet, Request};
pub use registry::{PendingReceipt, ReceiptGuard, ReceiptRegistry};
pub use server::{IntakeHandle, IntakeServer};

/// Standard TFTP port.
pub const DEFAULT_TFTP_PORT: u16 = 69;

/// A completed upload.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    /// Filename as proposed by the client.
    pub name: String,

    /// Payload exactly as received.
    pub data: Bytes,
}

/// A transfer that could not be completed.
#[derive(Error, Debug, Clone)]
#[error("upload of '{filename}' failed: {reason}")]
pub struct TransferFailure {
    /// Client that attempted the upload, if one was involved.
    pub peer: Option<SocketAddr>,

    pub filename: String,

    /// Token the filename matched, if any.
    pub token: Option<String>,

    pub reason: String,
}

impl TransferFailure {
    /// Check if this failure concerns the job holding `token`.
    ///
    /// Failures not attributed to any token concern every job.
    pub fn concerns(&self, token: &str) -> bool {
        self.token.as_deref().is_none_or(|t| t == token)
    }
}

/// Intake server settings.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Address the server listens on.
    pub listen: SocketAddr,

    /// Address devices are told to upload to.
    pub public_host: String,

    /// Retransmission timeout when the client does not request one.
    pub transfer_timeout: Duration,

    /// Retransmissions before a transfer is abandoned.
    pub retries: u32,

    /// Largest accepted upload.
    pub max_upload_bytes: u64,
}

impl IntakeConfig {
    /// Listen on `listen`, telling devices to upload to `public_host`.
    pub fn new(listen: SocketAddr, public_host: impl Into<String>) -> Self {
        Self {
            listen,
            public_host: public_host.into(),
            ..Self::default()
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TFTP_PORT)),
            public_host: "127.0.0.1".to_string(),
            transfer_timeout: Duration::from_secs(5),
            retries: 5,
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }
}
