//! TOML configuration.
//!
//! ```toml
//! [preferences]
//! backup_dir = "backups"
//! host_ip = "10.0.0.5"
//!
//! [auth_providers.lab]
//! type = "static"
//! [auth_providers.lab.auths.switches]
//! username = "admin"
//! password = "secret"
//! attributes = { enable = "enable-secret" }
//!
//! [device_classes.cisco_ios.targets.running-config]
//! script_file = "scripts/ios.rhai"
//!
//! [devices.sw1]
//! class = "cisco_ios"
//! address = "10.0.0.10"
//! auth = "lab:switches"
//! ```
//!
//! Relative paths (`backup_dir`, `script_file`, `private_key`) are
//! resolved against the directory containing the configuration file.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::auth::StaticCredential;
use crate::device::AuthRef;
use crate::error::ConfigError;
use crate::intake::DEFAULT_TFTP_PORT;
use crate::transport::{HostKeyVerification, SshConnector};

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_TFTP_PORT))
}

fn default_transfer_timeout() -> u64 {
    60
}

fn default_expect_timeout() -> u64 {
    15
}

fn default_concurrency() -> usize {
    4
}

fn default_ssh_timeout() -> u64 {
    30
}

/// Global settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Preferences {
    /// Root directory for backups.
    pub backup_dir: Option<PathBuf>,

    /// Address devices upload to.
    pub host_ip: Option<String>,

    /// Intake server bind address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Per-job deadline for the upload to arrive.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,

    /// Default timeout of script `expect` calls.
    #[serde(default = "default_expect_timeout")]
    pub expect_timeout_secs: u64,

    /// Devices processed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// SSH connect timeout.
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout_secs: u64,

    /// How SSH host keys are checked.
    #[serde(default)]
    pub host_key_verification: HostKeyVerification,

    /// known_hosts file; the user's default when unset.
    pub known_hosts: Option<PathBuf>,
}

impl Preferences {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn expect_timeout(&self) -> Duration {
        Duration::from_secs(self.expect_timeout_secs)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }
}

/// A credential provider definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Credentials listed inline.
    Static(StaticProviderConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticProviderConfig {
    #[serde(default)]
    pub auths: IndexMap<String, StaticAuthConfig>,
}

/// One inline credential.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticAuthConfig {
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl StaticAuthConfig {
    /// Build the credential, resolving a relative key path against
    /// `base_dir`.
    pub fn to_credential(&self, base_dir: &Path) -> StaticCredential {
        let mut credential = StaticCredential::new(&self.username);

        if let Some(password) = &self.password {
            credential = credential.with_password(password);
        } else if let Some(key) = &self.private_key {
            credential = credential.with_private_key(base_dir.join(key), self.passphrase.clone());
        }

        for (name, value) in &self.attributes {
            credential = credential.with_attribute(name, value);
        }
        credential
    }
}

impl fmt::Debug for StaticAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAuthConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// A device class and its targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceClassConfig {
    #[serde(default)]
    pub targets: IndexMap<String, TargetConfig>,
}

/// Script of one backup target, inline or from a file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub script: Option<String>,
    pub script_file: Option<PathBuf>,
}

impl TargetConfig {
    /// Script source, reading `script_file` relative to `base_dir`.
    pub fn source(&self, base_dir: &Path) -> Result<String, ConfigError> {
        match (&self.script, &self.script_file) {
            (Some(script), None) => Ok(script.clone()),
            (None, Some(file)) => {
                let path = base_dir.join(file);
                std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })
            }
            _ => Err(ConfigError::Invalid(
                "a target needs exactly one of 'script' or 'script_file'".to_string(),
            )),
        }
    }
}

/// A device entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub class: String,
    pub address: String,
    pub auth: String,
}

/// Devices sharing a name prefix.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceGroupConfig {
    #[serde(default)]
    pub devices: IndexMap<String, DeviceConfig>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub preferences: Preferences,

    #[serde(default)]
    pub auth_providers: IndexMap<String, ProviderConfig>,

    #[serde(default)]
    pub device_classes: IndexMap<String, DeviceClassConfig>,

    #[serde(default)]
    pub devices: IndexMap<String, DeviceConfig>,

    #[serde(default)]
    pub device_groups: IndexMap<String, DeviceGroupConfig>,

    #[serde(skip)]
    base_dir: PathBuf,
}

impl Config {
    /// Read and parse the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base_dir)
    }

    /// Parse configuration text. Relative paths resolve against `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.base_dir = base_dir.into();
        Ok(config)
    }

    /// SSH connector configured from the preferences.
    pub fn ssh_connector(&self) -> SshConnector {
        let prefs = &self.preferences;
        SshConnector {
            timeout: prefs.ssh_timeout(),
            host_key_verification: prefs.host_key_verification.clone(),
            known_hosts_path: prefs.known_hosts.as_ref().map(|p| self.base_dir.join(p)),
            ..SshConnector::default()
        }
    }

    /// Directory relative paths are resolved against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Backup root, resolved against the base directory.
    pub fn backup_dir(&self) -> Result<PathBuf, ConfigError> {
        self.preferences
            .backup_dir
            .as_ref()
            .map(|dir| self.base_dir.join(dir))
            .ok_or_else(|| ConfigError::Invalid("preferences.backup_dir is required".to_string()))
    }

    /// Every device with its full name, top-level devices first.
    pub fn all_devices(&self) -> impl Iterator<Item = (String, &DeviceConfig)> {
        let plain = self
            .devices
            .iter()
            .map(|(name, device)| (name.clone(), device));
        let grouped = self.device_groups.iter().flat_map(|(group, g)| {
            g.devices
                .iter()
                .map(move |(name, device)| (format!("{}/{}", group, name), device))
        });
        plain.chain(grouped)
    }

    /// Check cross references and required settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backup_dir()?;

        let prefs = &self.preferences;
        if prefs.concurrency == 0 {
            return Err(invalid("preferences.concurrency must be at least 1"));
        }
        if prefs.transfer_timeout_secs == 0
            || prefs.expect_timeout_secs == 0
            || prefs.ssh_timeout_secs == 0
        {
            return Err(invalid("preferences timeouts must be positive"));
        }

        for (name, provider) in &self.auth_providers {
            match provider {
                ProviderConfig::Static(table) => {
                    for (path, auth) in &table.auths {
                        if auth.password.is_some() == auth.private_key.is_some() {
                            return Err(ConfigError::Invalid(format!(
                                "auth '{}:{}' needs exactly one of 'password' or 'private_key'",
                                name, path
                            )));
                        }
                    }
                }
            }
        }

        for (name, class) in &self.device_classes {
            if class.targets.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "device class '{}' has no targets",
                    name
                )));
            }
            for (target, config) in &class.targets {
                if !is_path_segment(target) {
                    return Err(ConfigError::Invalid(format!(
                        "target name '{}' of class '{}' cannot be used as a file name",
                        target, name
                    )));
                }
                if config.script.is_some() == config.script_file.is_some() {
                    return Err(ConfigError::Invalid(format!(
                        "target '{}' of class '{}' needs exactly one of 'script' or 'script_file'",
                        target, name
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for (name, device) in self.all_devices() {
            if !name.split('/').all(is_path_segment) {
                return Err(ConfigError::Invalid(format!(
                    "device name '{}' cannot be used as a backup directory",
                    name
                )));
            }

            if !self.device_classes.contains_key(&device.class) {
                return Err(ConfigError::Invalid(format!(
                    "device '{}' uses unknown class '{}'",
                    name, device.class
                )));
            }

            let auth: AuthRef = device.auth.parse()?;
            if !self.auth_providers.contains_key(&auth.provider) {
                return Err(ConfigError::Invalid(format!(
                    "device '{}' uses unknown auth provider '{}'",
                    name, auth.provider
                )));
            }

            if !seen.insert(name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "device '{}' is defined more than once",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Backups land in `root/<device>/<target>.conf`; names must stay below root.
fn is_path_segment(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
