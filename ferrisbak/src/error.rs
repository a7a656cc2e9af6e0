//! Error types for ferrisbak.
//!
//! Each layer owns an error enum; [`Error`] aggregates them for callers that
//! do not care which layer failed. Backup jobs report [`JobError`], which
//! keeps the underlying cause reachable through `source()`.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::intake::TransferFailure;

/// Main error type for ferrisbak operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Interactive session errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Credential lookup errors
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Automation script errors
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// File intake server errors
    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    /// A single backup job failed
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// Configuration loading/validation errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Transport layer errors (SSH connection, authentication).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to resolve or reach the host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Server presented a key that differs from known_hosts
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// Server is not in known_hosts and strict checking is enabled
    #[error("Host key for {host}:{port} is unknown")]
    HostKeyUnknown { host: String, port: u16 },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Address could not be parsed
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Interactive session errors (shell setup and the expect primitives).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Failed to open the session channel or allocate a PTY
    #[error("Failed to open PTY channel: {0}")]
    PtyOpenFailed(#[source] russh::Error),

    /// Failed to request a shell
    #[error("Failed to request shell: {0}")]
    ShellRequestFailed(#[source] russh::Error),

    /// `expect` did not see its pattern in time
    #[error("Pattern {pattern:?} not found within {timeout:?}; unmatched output: {unmatched:?}")]
    ExpectTimeout {
        pattern: String,
        timeout: Duration,
        unmatched: String,
    },

    /// `read_line` did not see a complete line in time
    #[error("No complete line within {0:?}")]
    ReadTimeout(Duration),

    /// Remote side closed the stream
    #[error("End of stream")]
    Eof,

    /// The session was closed locally
    #[error("Session closed")]
    Closed,

    /// Writing to the session failed
    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    /// Reading from the session failed
    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    /// Invalid regex pattern
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Credential provider errors.
#[derive(Error, Debug)]
pub enum AuthError {
    /// No credential stored under the path
    #[error("No auth found at path '{path}'")]
    NotFound { path: String },

    /// The credential has no such attribute
    #[error("Attribute '{name}' not found; available attributes are {available:?}")]
    AttributeNotFound {
        name: String,
        available: Vec<String>,
    },

    /// A credential with the same path was already added
    #[error("An auth with the path '{path}' was already added")]
    DuplicateAuth { path: String },

    /// No provider registered under the name
    #[error("No provider registered with the name '{name}'")]
    UnknownProvider { name: String },

    /// A provider with the same name was already registered
    #[error("Provider already registered with the name '{name}'")]
    DuplicateProvider { name: String },

    /// A provider failed to initialize
    #[error("Unable to initialize provider '{name}': {message}")]
    ProviderInit { name: String, message: String },

    /// The credential cannot be turned into connection parameters
    #[error("Incomplete credential '{path}': {message}")]
    Incomplete { path: String, message: String },
}

/// Failure of one of the host functions exposed to automation scripts.
#[derive(Error, Debug)]
pub enum PrimitiveError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Automation script errors.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// The script source does not compile
    #[error("Failed to compile script '{name}': {message}")]
    Compile { name: String, message: String },

    /// A host primitive failed and aborted the script
    #[error("Script aborted: {0}")]
    Primitive(#[from] PrimitiveError),

    /// The script itself raised an error or exceeded its limits
    #[error("Script runtime error: {message}")]
    Runtime { message: String },
}

/// TFTP packet decoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short ({0} bytes)")]
    Truncated(usize),

    #[error("Unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("Missing NUL terminator in {0}")]
    Unterminated(&'static str),

    #[error("Field {0} is not valid UTF-8")]
    InvalidText(&'static str),
}

/// File intake server errors.
#[derive(Error, Debug)]
pub enum IntakeError {
    /// The listener could not be bound
    #[error("Failed to bind intake server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed TFTP packet
    #[error("Malformed packet: {0}")]
    Packet(#[from] PacketError),

    /// `run()` called on a running server
    #[error("Intake server already running")]
    AlreadyRunning,

    /// Registration attempted while the server is stopped
    #[error("Intake server is not running")]
    NotRunning,

    /// A receipt for the same token is already pending
    #[error("A receipt for token '{token}' is already registered")]
    RegistrationConflict { token: String },
}

/// Failure of one (device, backup target) job.
#[derive(Error, Debug)]
pub enum JobError {
    /// Credentials could not be resolved
    #[error("Credential error: {0}")]
    Credential(#[source] AuthError),

    /// Connecting or authenticating to the device failed
    #[error("Unable to connect: {0}")]
    Connect(#[source] TransportError),

    /// The shell could not be started
    #[error("Failed to start shell: {0}")]
    Session(#[source] ChannelError),

    /// The automation script failed
    #[error("Script failed: {0}")]
    Script(#[source] ScriptError),

    /// The upload never arrived
    #[error("Timed out after {0:?} waiting to receive file over TFTP")]
    TransferTimeout(Duration),

    /// The intake server reported a transfer failure during the wait
    #[error("Transfer failed: {0}")]
    Transfer(#[source] TransferFailure),

    /// The received file could not be written
    #[error("Unable to write to file '{}': {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The upload token could not be registered
    #[error("Unable to register upload token: {0}")]
    Registration(#[source] IntakeError),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML for the schema
    #[error("Error parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias using ferrisbak's Error.
pub type Result<T> = std::result::Result<T, Error>;
