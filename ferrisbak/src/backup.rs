//! Whole backup runs: intake server lifetime plus concurrent devices.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::channel::SessionConfig;
use crate::config::Config;
use crate::device::Device;
use crate::error::{ConfigError, IntakeError};
use crate::intake::{IntakeConfig, IntakeServer};
use crate::processor::{BackupStore, DeviceProcessor, DeviceReport, ProcessorConfig};
use crate::script::AutomationEngine;
use crate::transport::Connector;

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub backup_dir: PathBuf,

    /// Address devices upload to.
    pub host_ip: String,

    /// Intake server bind address.
    pub listen: SocketAddr,

    pub transfer_timeout: Duration,
    pub expect_timeout: Duration,

    /// Devices processed at the same time.
    pub concurrency: usize,
}

impl BackupOptions {
    /// Take settings from `config`; `host_ip` overrides the configured one.
    pub fn from_config(config: &Config, host_ip: Option<String>) -> Result<Self, ConfigError> {
        let prefs = &config.preferences;
        let host_ip = host_ip.or_else(|| prefs.host_ip.clone()).ok_or_else(|| {
            ConfigError::Invalid(
                "no upload address: set preferences.host_ip or pass --host-ip".to_string(),
            )
        })?;

        Ok(Self {
            backup_dir: config.backup_dir()?,
            host_ip,
            listen: prefs.listen,
            transfer_timeout: prefs.transfer_timeout(),
            expect_timeout: prefs.expect_timeout(),
            concurrency: prefs.concurrency,
        })
    }
}

/// Outcome of a whole run, devices in input order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub devices: Vec<DeviceReport>,

    /// Devices whose task ended abnormally.
    pub aborted: Vec<String>,
}

impl RunReport {
    /// Number of failed jobs plus aborted devices.
    pub fn failures(&self) -> usize {
        self.devices.iter().map(DeviceReport::failures).sum::<usize>() + self.aborted.len()
    }

    pub fn jobs(&self) -> usize {
        self.devices.iter().map(|d| d.targets.len()).sum()
    }

    /// Number of backups written.
    pub fn succeeded(&self) -> usize {
        self.jobs() - self.devices.iter().map(DeviceReport::failures).sum::<usize>()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for device in &self.devices {
            for target in &device.targets {
                match &target.outcome {
                    Ok(path) => writeln!(
                        f,
                        "OK     {}/{} -> {}",
                        device.device,
                        target.target,
                        path.display()
                    )?,
                    Err(e) => writeln!(f, "FAILED {}/{}: {}", device.device, target.target, e)?,
                }
            }
        }
        for device in &self.aborted {
            writeln!(f, "FAILED {}: device task aborted", device)?;
        }
        write!(
            f,
            "{} of {} backups succeeded",
            self.succeeded(),
            self.jobs()
        )
    }
}

/// Process `devices` concurrently, at most `concurrency` at a time.
pub async fn run_devices<C: Connector>(
    processor: Arc<DeviceProcessor<C>>,
    devices: Vec<Device>,
    concurrency: usize,
) -> RunReport {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
    let mut tasks = JoinSet::new();

    for (index, device) in devices.into_iter().enumerate() {
        let processor = processor.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            (index, processor.process(&device).await)
        });
    }

    let mut finished = Vec::with_capacity(names.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(done) => finished.push(done),
            Err(e) => error!("device task failed: {}", e),
        }
    }
    finished.sort_by_key(|(index, _)| *index);

    let mut report = RunReport::default();
    let mut next = 0;
    for (index, device) in finished {
        report.aborted.extend(names[next..index].iter().cloned());
        report.devices.push(device);
        next = index + 1;
    }
    report.aborted.extend(names[next..].iter().cloned());
    report
}

/// Start the intake server, back up `devices` and stop the server.
///
/// Only a failure to start the intake server is returned as an error; job
/// failures are part of the report.
pub async fn run<C: Connector>(
    connector: C,
    engine: Arc<AutomationEngine>,
    devices: Vec<Device>,
    options: &BackupOptions,
) -> Result<RunReport, IntakeError> {
    let server = IntakeServer::new(IntakeConfig::new(options.listen, &options.host_ip));
    server.run().await?;

    let processor = Arc::new(DeviceProcessor::new(
        Arc::new(connector),
        server.handle(),
        engine,
        BackupStore::new(&options.backup_dir),
        ProcessorConfig {
            transfer_deadline: options.transfer_timeout,
            session: SessionConfig {
                expect_timeout: options.expect_timeout,
                ..SessionConfig::default()
            },
        },
    ));

    info!(
        "backing up {} devices into {}",
        devices.len(),
        options.backup_dir.display()
    );
    let report = run_devices(processor, devices, options.concurrency).await;

    server.stop();
    Ok(report)
}
