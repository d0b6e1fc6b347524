//! Script engine extension for KernelHive.
//!
//! A small line-oriented language used as the reference execution engine.
//! Variables persist across executions on the same engine, output is
//! delivered incrementally through the [`OutputSink`], and the engine
//! cooperates with both interrupt strategies: it polls a shared
//! [`InterruptFlag`] and also exposes a direct-call [`InterruptHook`].

mod interpreter;
mod parser;

use std::path::Path;
use std::sync::Arc;

use kernelhive_protocols::{
    EngineError, EngineFactory, EngineFault, EngineInfo, EngineInit, ExecutionEngine,
    InterruptFlag, InterruptHook, MimeBundle, OutputSink,
};
use tracing::debug;

pub use interpreter::{Interpreter, PendingInterrupt, SLEEP_SLICE, Value};
pub use parser::{Expr, Stmt, StmtKind, Token, parse, tokenize};

/// Language name served by this engine.
pub const LANGUAGE: &str = "script";

/// Implementation name reported in kernel info.
pub const IMPLEMENTATION: &str = "kernelhive-script";

/// Prefix under which environment variables are visible to scripts.
pub const ENV_PREFIX: &str = "env.";

/// Script execution engine.
pub struct ScriptEngine {
    interpreter: Interpreter,
    mounts: Vec<String>,
}

impl ScriptEngine {
    /// Build an engine from an initialization payload.
    pub fn new(init: &EngineInit) -> Result<Self, EngineError> {
        if init.language != LANGUAGE {
            return Err(EngineError::UnsupportedLanguage(init.language.clone()));
        }

        for mount in &init.filesystem {
            if !Path::new(&mount.target).is_absolute() {
                return Err(EngineError::InvalidInit(format!(
                    "mount target must be absolute: {}",
                    mount.target
                )));
            }
        }

        let mut interpreter = Interpreter::new();
        for (key, value) in &init.env {
            interpreter.set_global(format!("{}{}", ENV_PREFIX, key), Value::Str(value.clone()));
        }

        let mounts: Vec<String> = init.filesystem.iter().map(|m| m.target.clone()).collect();
        debug!(
            env_vars = init.env.len(),
            mounts = mounts.len(),
            lock_file = init.lock_file_url.as_deref().unwrap_or("-"),
            "script engine initialized"
        );

        Ok(Self { interpreter, mounts })
    }

    /// Mount targets declared at initialization.
    pub fn mounts(&self) -> &[String] {
        &self.mounts
    }
}

impl ExecutionEngine for ScriptEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            language: LANGUAGE.to_string(),
            implementation: IMPLEMENTATION.to_string(),
            implementation_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn set_interrupt_buffer(&mut self, flag: InterruptFlag) {
        self.interpreter.set_interrupt_buffer(flag);
    }

    fn interrupt_hook(&self) -> Option<Arc<dyn InterruptHook>> {
        Some(self.interpreter.hook())
    }

    fn execute(
        &mut self,
        code: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<Option<MimeBundle>, EngineFault> {
        let program = parse(code)?;
        let value = self.interpreter.run(&program, sink)?;
        Ok(value.map(|v| MimeBundle::text(v.to_string())))
    }
}

/// Factory registering the script engine under [`LANGUAGE`].
#[derive(Debug, Default, Clone)]
pub struct ScriptEngineFactory;

impl ScriptEngineFactory {
    pub fn new() -> Self {
        Self
    }
}

impl EngineFactory for ScriptEngineFactory {
    fn language(&self) -> &str {
        LANGUAGE
    }

    fn create(&self, init: &EngineInit) -> Result<Box<dyn ExecutionEngine>, EngineError> {
        Ok(Box::new(ScriptEngine::new(init)?))
    }
}
