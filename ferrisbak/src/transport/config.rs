//! SSH connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::TransportError;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyVerification {
    /// Reject unknown and changed keys. Connection fails if the host
    /// is not already in known_hosts.
    Strict,

    /// Accept and auto-learn unknown keys, but reject changed keys.
    #[default]
    AcceptNew,

    /// Accept all keys without checking. Lab networks full of devices with
    /// regenerated keys often need this.
    Disabled,
}

/// Terminal parameters requested for the interactive shell.
///
/// No real serial line is involved, so a fixed speed and window are enough.
/// Echo is disabled so the session output only contains what the device
/// prints.
#[derive(Debug, Clone)]
pub struct PtyConfig {
    /// Terminal type.
    pub term: String,

    /// Terminal width in characters.
    pub width: u32,

    /// Terminal height in rows.
    pub height: u32,

    /// Input and output speed in baud.
    pub baud: u32,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            width: 511,
            height: 24,
            baud: 38400,
        }
    }
}

/// SSH connection configuration.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Target host (hostname or IP address).
    pub host: String,

    /// SSH port (default: 22).
    pub port: u16,

    /// Username for authentication.
    pub username: String,

    /// Authentication method.
    pub auth: AuthMethod,

    /// Connection timeout.
    pub timeout: Duration,

    /// Terminal parameters for the shell.
    pub pty: PtyConfig,

    /// Host key verification mode.
    pub host_key_verification: HostKeyVerification,

    /// Path to known_hosts file.
    pub known_hosts_path: Option<PathBuf>,
}

impl SshConfig {
    /// Get the socket address for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Authentication method for SSH connections.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// No authentication (for testing only).
    None,

    /// Password authentication.
    Password(SecretString),

    /// Private key authentication.
    PrivateKey {
        /// Path to the private key file.
        path: PathBuf,
        /// Optional passphrase for encrypted keys.
        passphrase: Option<SecretString>,
    },
}

/// What a credential resolves to for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectionParameters {
    /// Login name.
    pub username: String,

    /// How to authenticate.
    pub auth: AuthMethod,
}

/// Split a device address into host and port.
///
/// Accepts `host`, `host:port`, `ipv4:port`, `[ipv6]:port` and bare IPv6
/// addresses; the default port applies when none is given.
pub fn split_host_port(
    address: &str,
    default_port: u16,
) -> std::result::Result<(String, u16), TransportError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }

    if let Ok(addr) = address.parse::<std::net::SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }

    if let Ok(ip) = address.parse::<std::net::IpAddr>() {
        return Ok((ip.to_string(), default_port));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(TransportError::InvalidAddress(address.to_string())),
        None => Ok((address.to_string(), default_port)),
    }
}
