//! Device automation scripts.
//!
//! Each backup target carries a Rhai script that drives the device shell
//! until it uploads its configuration. Scripts are compiled once and run
//! once per job against an [`AutomationHost`], which supplies the
//! interactive primitives.
//!
//! Functions available to scripts:
//!
//! | Function                        | Effect                                  |
//! |---------------------------------|-----------------------------------------|
//! | `expect(text)`                  | wait for literal text, default timeout  |
//! | `expect(text, secs)`            | wait for literal text                   |
//! | `expectRe(regex[, secs])`       | wait for a regex match                  |
//! | `sendLine(text)`                | send a line                             |
//! | `readLine()`                    | next line of output                     |
//! | `getAuthAttr(name)`             | attribute of the device credential      |
//! | `dbgLog(msg)`                   | debug log line                          |
//!
//! Constants: `device` (`name`, `address`, `class`) and `ctx`
//! (`intake_host`, `intake_port`, `upload_token`, `target`).

mod engine;
mod host;

use std::time::Duration;

pub use engine::{AutomationEngine, CompiledScript};
pub use host::SessionHost;

use crate::channel::Pattern;
use crate::error::PrimitiveError;

/// Primitives a script can call.
///
/// Methods block the calling thread; scripts run on a blocking worker.
pub trait AutomationHost: Send + 'static {
    /// Wait for `pattern`, returning the output before it.
    fn expect(&mut self, pattern: &Pattern, timeout: Duration) -> Result<String, PrimitiveError>;

    /// Send `text` followed by the line terminator.
    fn send_line(&mut self, text: &str) -> Result<(), PrimitiveError>;

    /// Read the next line of output.
    fn read_line(&mut self) -> Result<String, PrimitiveError>;

    /// Look up a credential attribute.
    fn auth_attr(&self, name: &str) -> Result<String, PrimitiveError>;

    /// Timeout for `expect` calls that do not give one.
    fn default_timeout(&self) -> Duration;
}

/// Device fields exposed as the `device` constant.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    pub name: String,
    pub address: String,
    pub class: String,
}

/// Job fields exposed as the `ctx` constant.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub intake_host: String,
    pub intake_port: u16,
    pub upload_token: String,
    pub target: String,
}

/// Everything a script sees besides the host primitives.
#[derive(Debug, Clone)]
pub struct ScriptBindings {
    pub device: DeviceBinding,
    pub ctx: JobContext,
}
