//! Remote-login transport layer.
//!
//! Backup jobs only need two things from a transport: connect to an address
//! with resolved credentials, and open an interactive shell as a byte
//! stream. [`Connector`] and [`Connection`] capture exactly that so jobs can
//! run against SSH in production and in-memory pipes in tests.

pub mod config;
mod ssh;

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

pub use config::{
    AuthMethod, ConnectionParameters, HostKeyVerification, PtyConfig, SshConfig, split_host_port,
};
pub use ssh::{SshConnector, SshTransport};

use crate::error::{ChannelError, TransportError};

/// An authenticated connection to a device.
pub trait Connection: Send {
    /// Bidirectional shell stream.
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Open an interactive shell with PTY semantics (no echo).
    fn open_shell(&mut self) -> impl Future<Output = Result<Self::Stream, ChannelError>> + Send;

    /// Tear the connection down.
    fn close(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Opens connections to devices.
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced by this connector.
    type Connection: Connection;

    /// Connect and authenticate.
    fn connect(
        &self,
        address: &str,
        params: &ConnectionParameters,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}
