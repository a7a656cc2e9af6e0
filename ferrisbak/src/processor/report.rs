use std::path::PathBuf;

use crate::error::JobError;

/// Outcome of one (device, target) job.
#[derive(Debug)]
pub struct TargetReport {
    pub target: String,
    pub outcome: Result<PathBuf, JobError>,
}

impl TargetReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Outcomes of every target of one device, in configuration order.
#[derive(Debug)]
pub struct DeviceReport {
    pub device: String,
    pub targets: Vec<TargetReport>,
}

impl DeviceReport {
    /// Number of failed targets.
    pub fn failures(&self) -> usize {
        self.targets.iter().filter(|t| !t.is_success()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0
    }
}
