//! # Ferrisbak
//!
//! Scripted configuration backups for network devices that only offer an
//! interactive CLI over SSH and can push files to a TFTP server.
//!
//! For each (device, target) job, ferrisbak logs into the device, runs the
//! target's Rhai script against the shell, and waits for the device to
//! upload its configuration to the built-in TFTP intake server under a
//! filename that starts with the job's upload token.
//!
//! ## Features
//!
//! - Async SSH sessions via russh with expect-style pattern matching
//! - Per device class automation scripts (Rhai), compiled once
//! - TFTP intake server correlating uploads to jobs by token prefix
//! - Concurrent devices, sequential targets, per-job failure isolation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ferrisbak::backup::{self, BackupOptions};
//! use ferrisbak::{AutomationEngine, Config, Inventory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ferrisbak::Error> {
//!     let config = Config::load("config.toml")?;
//!     let engine = Arc::new(AutomationEngine::new());
//!     let inventory = Inventory::build(&config, &engine)?;
//!
//!     let options = BackupOptions::from_config(&config, None)?;
//!     let devices = inventory.select("*")?;
//!     let report = backup::run(config.ssh_connector(), engine, devices, &options).await?;
//!
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod backup;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod intake;
pub mod inventory;
pub mod processor;
pub mod script;
pub mod transport;

// Re-export main types for convenience
pub use auth::{Credential, Provider, ProviderPool};
pub use backup::{BackupOptions, RunReport};
pub use channel::{InteractiveSession, Pattern, SessionConfig};
pub use config::Config;
pub use device::{BackupTarget, Device, DeviceClass};
pub use error::{Error, JobError};
pub use intake::{IntakeConfig, IntakeHandle, IntakeServer, ReceivedFile, TransferFailure};
pub use inventory::Inventory;
pub use processor::{BackupStore, DeviceProcessor, ProcessorConfig, UploadToken};
pub use script::{AutomationEngine, AutomationHost, CompiledScript};
pub use transport::{Connection, Connector, SshConnector};
