//! Backup job orchestration.
//!
//! A job backs up one target of one device:
//!
//! 1. mint an [`UploadToken`] and register it with the intake server
//! 2. connect and open a shell
//! 3. run the target script, which makes the device upload a file whose
//!    name starts with the token
//! 4. wait for the upload, a transfer failure or the deadline
//! 5. persist the file
//!
//! The session and connection are closed on every path out of step 3, and
//! the registration is released when the job ends.

mod report;
mod store;
mod token;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{Instant, sleep_until};

pub use report::{DeviceReport, TargetReport};
pub use store::BackupStore;
pub use token::UploadToken;

use crate::channel::{InteractiveSession, SessionConfig};
use crate::device::{BackupTarget, Device};
use crate::error::{JobError, ScriptError};
use crate::intake::{IntakeHandle, ReceivedFile, TransferFailure};
use crate::script::{AutomationEngine, JobContext, ScriptBindings, SessionHost};
use crate::transport::{Connection, Connector};

/// Uploads buffered per job before the intake server starts dropping them.
const DELIVERY_CAPACITY: usize = 3;

/// Job settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Time from job start until the upload must have arrived.
    pub transfer_deadline: Duration,

    /// Interactive session settings.
    pub session: SessionConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            transfer_deadline: Duration::from_secs(60),
            session: SessionConfig::default(),
        }
    }
}

/// Runs backup jobs for devices.
pub struct DeviceProcessor<C: Connector> {
    connector: Arc<C>,
    intake: IntakeHandle,
    engine: Arc<AutomationEngine>,
    store: BackupStore,
    config: ProcessorConfig,
}

impl<C: Connector> DeviceProcessor<C> {
    pub fn new(
        connector: Arc<C>,
        intake: IntakeHandle,
        engine: Arc<AutomationEngine>,
        store: BackupStore,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            connector,
            intake,
            engine,
            store,
            config,
        }
    }

    /// Back up every target of `device`, in order.
    ///
    /// A failed target does not stop the remaining ones.
    pub async fn process(&self, device: &Device) -> DeviceReport {
        let mut targets = Vec::with_capacity(device.class.targets.len());

        for target in device.class.targets.values() {
            info!("[{}/{}] starting backup", device.name, target.name);

            let outcome = self.process_target(device, target).await;
            match &outcome {
                Ok(path) => info!(
                    "[{}/{}] backup written to {}",
                    device.name,
                    target.name,
                    path.display()
                ),
                Err(e) => error!("[{}/{}] backup failed: {}", device.name, target.name, e),
            }

            targets.push(TargetReport {
                target: target.name.clone(),
                outcome,
            });
        }

        DeviceReport {
            device: device.name.clone(),
            targets,
        }
    }

    /// Run a single job.
    pub async fn process_target(
        &self,
        device: &Device,
        target: &BackupTarget,
    ) -> Result<PathBuf, JobError> {
        let deadline = Instant::now() + self.config.transfer_deadline;

        let token = UploadToken::generate();
        let (tx, mut rx) = mpsc::channel(DELIVERY_CAPACITY);
        let _receipt = self
            .intake
            .expect_file(token.as_str(), tx)
            .map_err(JobError::Registration)?;
        let mut failures = self.intake.subscribe_failures();
        debug!(
            "[{}/{}] registered upload token {}",
            device.name, target.name, token
        );

        let params = device
            .credential
            .connection_parameters()
            .map_err(JobError::Credential)?;

        let mut connection = self
            .connector
            .connect(&device.address, &params)
            .await
            .map_err(JobError::Connect)?;

        let script_result = self
            .run_script(&mut connection, device, target, &token)
            .await;

        if let Err(e) = connection.close().await {
            debug!("[{}/{}] closing connection: {}", device.name, target.name, e);
        }
        script_result?;

        let file = self
            .wait_for_upload(&mut rx, &mut failures, &token, deadline)
            .await?;
        debug!(
            "[{}/{}] received '{}' ({} bytes)",
            device.name,
            target.name,
            file.name,
            file.data.len()
        );

        self.store
            .persist(&device.name, &target.name, &file.data)
            .await
    }

    async fn run_script(
        &self,
        connection: &mut C::Connection,
        device: &Device,
        target: &BackupTarget,
        token: &UploadToken,
    ) -> Result<(), JobError> {
        let stream = connection.open_shell().await.map_err(JobError::Session)?;
        let session = Arc::new(Mutex::new(InteractiveSession::new(
            stream,
            self.config.session.clone(),
        )));

        let host = SessionHost::new(
            session.clone(),
            device.credential.clone(),
            Handle::current(),
            self.config.session.expect_timeout,
        );
        let bindings = ScriptBindings {
            device: device.binding(),
            ctx: JobContext {
                intake_host: self.intake.public_host().to_string(),
                intake_port: self.intake.port(),
                upload_token: token.to_string(),
                target: target.name.clone(),
            },
        };
        let engine = self.engine.clone();
        let script = target.script.clone();

        let result =
            tokio::task::spawn_blocking(move || engine.run(&script, host, &bindings)).await;

        session.lock().await.close().await;

        match result {
            Ok(outcome) => outcome.map_err(JobError::Script),
            Err(e) => Err(JobError::Script(ScriptError::Runtime {
                message: format!("script worker failed: {}", e),
            })),
        }
    }

    async fn wait_for_upload(
        &self,
        rx: &mut mpsc::Receiver<ReceivedFile>,
        failures: &mut broadcast::Receiver<TransferFailure>,
        token: &UploadToken,
        deadline: Instant,
    ) -> Result<ReceivedFile, JobError> {
        let mut watching_failures = true;

        loop {
            tokio::select! {
                biased;

                file = rx.recv() => {
                    return file.ok_or_else(|| {
                        JobError::Transfer(TransferFailure {
                            peer: None,
                            filename: token.to_string(),
                            token: Some(token.to_string()),
                            reason: "intake server stopped".to_string(),
                        })
                    });
                }

                failure = failures.recv(), if watching_failures => match failure {
                    Ok(failure) if failure.concerns(token.as_str()) => {
                        return Err(JobError::Transfer(failure));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("missed {} transfer failure notices", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => watching_failures = false,
                },

                _ = sleep_until(deadline) => {
                    return Err(JobError::TransferTimeout(self.config.transfer_deadline));
                }
            }
        }
    }
}
