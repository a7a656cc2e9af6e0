//! Devices, device classes and backup targets.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::auth::Credential;
use crate::error::ConfigError;
use crate::script::{CompiledScript, DeviceBinding};

/// One file a device class knows how to back up.
#[derive(Debug)]
pub struct BackupTarget {
    pub name: String,
    pub script: CompiledScript,
}

/// A family of devices driven by the same scripts.
#[derive(Debug)]
pub struct DeviceClass {
    pub name: String,

    /// Targets in configuration order.
    pub targets: IndexMap<String, Arc<BackupTarget>>,
}

impl DeviceClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            targets: IndexMap::new(),
        }
    }

    /// Add a target, replacing one with the same name.
    pub fn with_target(mut self, name: impl Into<String>, script: CompiledScript) -> Self {
        let name = name.into();
        self.targets.insert(
            name.clone(),
            Arc::new(BackupTarget { name, script }),
        );
        self
    }
}

/// Reference to a credential: `provider:path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRef {
    pub provider: String,
    pub path: String,
}

impl FromStr for AuthRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((provider, path)) if !provider.is_empty() && !path.is_empty() => Ok(Self {
                provider: provider.to_string(),
                path: path.to_string(),
            }),
            _ => Err(ConfigError::Invalid(format!(
                "auth '{}' must have the form 'provider:path'",
                s
            ))),
        }
    }
}

impl fmt::Display for AuthRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.path)
    }
}

/// A device to back up.
#[derive(Clone)]
pub struct Device {
    /// Full name; grouped devices are named `group/device`.
    pub name: String,

    /// `host` or `host:port`.
    pub address: String,

    pub class: Arc<DeviceClass>,
    pub credential: Arc<dyn Credential>,
    pub auth: AuthRef,
}

impl Device {
    /// Fields scripts see as the `device` constant.
    pub fn binding(&self) -> DeviceBinding {
        DeviceBinding {
            name: self.name.clone(),
            address: self.address.clone(),
            class: self.class.name.clone(),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("class", &self.class.name)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}
