//! Rhai-backed script compilation and execution.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};
use rhai::{AST, Dynamic, Engine, EvalAltResult, INT, Map, Scope};

use super::{AutomationHost, DeviceBinding, JobContext, ScriptBindings};
use crate::channel::Pattern;
use crate::error::{ChannelError, PrimitiveError, ScriptError};

const DEFAULT_MAX_OPERATIONS: u64 = 1_000_000;

/// A script compiled once and shared by every job that runs it.
#[derive(Clone)]
pub struct CompiledScript {
    name: Arc<str>,
    ast: Arc<AST>,
}

impl CompiledScript {
    /// Name given at compile time.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Compiles and runs automation scripts.
pub struct AutomationEngine {
    compiler: Engine,
    max_operations: u64,
}

impl Default for AutomationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AutomationEngine {
    pub fn new() -> Self {
        Self {
            compiler: Engine::new(),
            max_operations: DEFAULT_MAX_OPERATIONS,
        }
    }

    /// Limit the number of operations a single run may perform.
    pub fn with_max_operations(mut self, max_operations: u64) -> Self {
        self.max_operations = max_operations;
        self
    }

    /// Compile `source`. `name` identifies the script in errors and logs.
    pub fn compile(&self, name: &str, source: &str) -> Result<CompiledScript, ScriptError> {
        let ast = self
            .compiler
            .compile(source)
            .map_err(|e| ScriptError::Compile {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        Ok(CompiledScript {
            name: Arc::from(name),
            ast: Arc::new(ast),
        })
    }

    /// Run `script` to completion against `host`.
    ///
    /// Blocks the calling thread for as long as the script runs.
    pub fn run<H: AutomationHost>(
        &self,
        script: &CompiledScript,
        host: H,
        bindings: &ScriptBindings,
    ) -> Result<(), ScriptError> {
        let failure = Arc::new(Mutex::new(None));
        let engine = self.build_engine(
            Primitives {
                host: Arc::new(Mutex::new(host)),
                failure: failure.clone(),
            },
            bindings,
        );

        let mut scope = Scope::new();
        scope.push_constant("device", device_map(&bindings.device));
        scope.push_constant("ctx", ctx_map(&bindings.ctx));

        debug!(
            "[{}/{}] running script '{}'",
            bindings.device.name, bindings.ctx.target, script.name
        );

        let result = engine.run_ast_with_scope(&mut scope, &script.ast);
        let cause = failure.lock().unwrap_or_else(PoisonError::into_inner).take();

        match (result, cause) {
            (Ok(()), _) => Ok(()),
            // A cause caught by the script only counts if it is what ended the run.
            (Err(e), Some(cause)) if e.to_string().contains(&cause.to_string()) => {
                Err(ScriptError::Primitive(cause))
            }
            (Err(e), _) => Err(ScriptError::Runtime {
                message: e.to_string(),
            }),
        }
    }

    fn build_engine<H: AutomationHost>(
        &self,
        primitives: Primitives<H>,
        bindings: &ScriptBindings,
    ) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);

        let tag = format!("{}/{}", bindings.device.name, bindings.ctx.target);
        {
            let tag = tag.clone();
            engine.on_print(move |text| info!("[{}] {}", tag, text));
        }
        {
            let tag = tag.clone();
            engine.on_debug(move |text, _, pos| debug!("[{}] {} {}", tag, pos, text));
        }
        engine.register_fn("dbgLog", move |msg: &str| debug!("[{}] {}", tag, msg));

        let p = primitives.clone();
        engine.register_fn("expect", move |text: &str| -> Result<String, Box<EvalAltResult>> {
            p.call(|host| {
                let timeout = host.default_timeout();
                host.expect(&Pattern::literal(text), timeout)
            })
        });

        let p = primitives.clone();
        engine.register_fn(
            "expect",
            move |text: &str, secs: INT| -> Result<String, Box<EvalAltResult>> {
                p.call(|host| host.expect(&Pattern::literal(text), seconds(secs)))
            },
        );

        let p = primitives.clone();
        engine.register_fn("expectRe", move |re: &str| -> Result<String, Box<EvalAltResult>> {
            p.call(|host| {
                let pattern = regex_pattern(re)?;
                let timeout = host.default_timeout();
                host.expect(&pattern, timeout)
            })
        });

        let p = primitives.clone();
        engine.register_fn(
            "expectRe",
            move |re: &str, secs: INT| -> Result<String, Box<EvalAltResult>> {
                p.call(|host| host.expect(&regex_pattern(re)?, seconds(secs)))
            },
        );

        let p = primitives.clone();
        engine.register_fn("sendLine", move |text: &str| -> Result<(), Box<EvalAltResult>> {
            p.call(|host| host.send_line(text))
        });

        let p = primitives.clone();
        engine.register_fn("readLine", move || -> Result<String, Box<EvalAltResult>> {
            p.call(|host| host.read_line())
        });

        let p = primitives;
        engine.register_fn(
            "getAuthAttr",
            move |name: &str| -> Result<String, Box<EvalAltResult>> {
                p.call(|host| host.auth_attr(name))
            },
        );

        engine
    }
}

/// Host shared by the registered functions of one run, plus the slot that
/// keeps the typed cause of the first primitive failure.
struct Primitives<H> {
    host: Arc<Mutex<H>>,
    failure: Arc<Mutex<Option<PrimitiveError>>>,
}

impl<H> Clone for Primitives<H> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            failure: self.failure.clone(),
        }
    }
}

impl<H: AutomationHost> Primitives<H> {
    fn call<T>(
        &self,
        f: impl FnOnce(&mut H) -> Result<T, PrimitiveError>,
    ) -> Result<T, Box<EvalAltResult>> {
        let mut host = self.host.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut *host);
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(value) => {
                *failure = None;
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                *failure = Some(e);
                Err(message.into())
            }
        }
    }
}

fn regex_pattern(re: &str) -> Result<Pattern, PrimitiveError> {
    Pattern::regex(re).map_err(|e| PrimitiveError::Channel(ChannelError::InvalidPattern(e)))
}

fn seconds(secs: INT) -> Duration {
    Duration::from_secs(secs.max(0) as u64)
}

fn device_map(device: &DeviceBinding) -> Map {
    let mut map = Map::new();
    map.insert("name".into(), Dynamic::from(device.name.clone()));
    map.insert("address".into(), Dynamic::from(device.address.clone()));
    map.insert("class".into(), Dynamic::from(device.class.clone()));
    map
}

fn ctx_map(ctx: &JobContext) -> Map {
    let mut map = Map::new();
    map.insert("intake_host".into(), Dynamic::from(ctx.intake_host.clone()));
    map.insert("intake_port".into(), Dynamic::from(ctx.intake_port as INT));
    map.insert("upload_token".into(), Dynamic::from(ctx.upload_token.clone()));
    map.insert("target".into(), Dynamic::from(ctx.target.clone()));
    map
}
