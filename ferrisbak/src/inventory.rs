//! Runtime objects built from configuration.

use std::sync::Arc;

use glob::Pattern as GlobPattern;
use indexmap::IndexMap;
use log::debug;

use crate::auth::{ProviderPool, StaticProvider};
use crate::config::{Config, ProviderConfig};
use crate::device::{AuthRef, Device, DeviceClass};
use crate::error::{ConfigError, Result};
use crate::script::AutomationEngine;

/// Providers, compiled device classes and resolved devices.
pub struct Inventory {
    pub providers: ProviderPool,
    pub classes: IndexMap<String, Arc<DeviceClass>>,
    pub devices: Vec<Device>,
}

impl Inventory {
    /// Validate `config`, compile every target script once and resolve each
    /// device's credential.
    pub fn build(config: &Config, engine: &AutomationEngine) -> Result<Self> {
        config.validate()?;

        let mut providers = ProviderPool::new();
        for (name, provider) in &config.auth_providers {
            match provider {
                ProviderConfig::Static(table) => {
                    let mut store = StaticProvider::new();
                    for (path, auth) in &table.auths {
                        store.add_auth(path, auth.to_credential(config.base_dir()))?;
                    }
                    debug!("auth provider '{}': {} credentials", name, store.len());
                    providers.register(name, Arc::new(store))?;
                }
            }
        }

        let mut classes = IndexMap::new();
        for (name, class_config) in &config.device_classes {
            let mut class = DeviceClass::new(name);
            for (target, target_config) in &class_config.targets {
                let source = target_config.source(config.base_dir())?;
                let script = engine.compile(&format!("{}/{}", name, target), &source)?;
                class = class.with_target(target, script);
            }
            classes.insert(name.clone(), Arc::new(class));
        }

        let mut devices = Vec::new();
        for (name, device) in config.all_devices() {
            let class = classes.get(&device.class).cloned().ok_or_else(|| {
                ConfigError::Invalid(format!("unknown class '{}'", device.class))
            })?;
            let auth: AuthRef = device.auth.parse()?;
            let credential = providers.lookup(&auth.provider, &auth.path)?;

            devices.push(Device {
                name,
                address: device.address.clone(),
                class,
                credential,
                auth,
            });
        }

        Ok(Self {
            providers,
            classes,
            devices,
        })
    }

    /// Devices whose full name matches the glob `filter`.
    ///
    /// A filter that matches nothing is an error.
    pub fn select(&self, filter: &str) -> std::result::Result<Vec<Device>, ConfigError> {
        let pattern = GlobPattern::new(filter)
            .map_err(|e| ConfigError::Invalid(format!("invalid device filter '{}': {}", filter, e)))?;

        let selected: Vec<Device> = self
            .devices
            .iter()
            .filter(|device| pattern.matches(&device.name))
            .cloned()
            .collect();

        if selected.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "no devices match '{}'",
                filter
            )));
        }
        Ok(selected)
    }
}
