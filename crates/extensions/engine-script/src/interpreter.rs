//! Tree-walking interpreter with persistent variables.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use kernelhive_protocols::{
    ErrorInfo, InterruptFlag, InterruptHook, MimeBundle, OutputSink, RawOutput,
};

use crate::parser::{Expr, Stmt, StmtKind};

/// Granularity of interrupt checks while sleeping.
pub const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// A runtime value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
        }
    }
}

/// Direct-call interrupt entry point. Raises `KeyboardInterrupt` at the next
/// statement boundary.
#[derive(Debug, Default)]
pub struct PendingInterrupt {
    pending: AtomicBool,
}

impl PendingInterrupt {
    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

impl InterruptHook for PendingInterrupt {
    fn raise_interrupt(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }
}

/// Interpreter state that persists across executions.
pub struct Interpreter {
    globals: HashMap<String, Value>,
    interrupt_buffer: Option<InterruptFlag>,
    hook: Arc<PendingInterrupt>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            globals: HashMap::new(),
            interrupt_buffer: None,
            hook: Arc::new(PendingInterrupt::default()),
        }
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set_interrupt_buffer(&mut self, flag: InterruptFlag) {
        self.interrupt_buffer = Some(flag);
    }

    pub fn hook(&self) -> Arc<PendingInterrupt> {
        self.hook.clone()
    }

    /// Run a parsed program. The value of a trailing expression statement is
    /// returned.
    ///
    /// A direct-call interrupt raised before the run starts is honored at the
    /// first statement; callers reset the hook between executions.
    pub fn run(
        &mut self,
        program: &[Stmt],
        sink: &mut dyn OutputSink,
    ) -> Result<Option<Value>, ErrorInfo> {
        let mut last = None;
        for (idx, stmt) in program.iter().enumerate() {
            let value = self.exec(stmt, sink)?;
            if idx + 1 == program.len() {
                last = value;
            }
        }
        Ok(last)
    }

    fn check_interrupt(&self, line: usize) -> Result<(), ErrorInfo> {
        let shared = self
            .interrupt_buffer
            .as_ref()
            .map(InterruptFlag::take)
            .unwrap_or(false);
        if shared || self.hook.take() {
            return Err(ErrorInfo::new("KeyboardInterrupt", "execution interrupted")
                .with_traceback(vec![format!("line {}", line)]));
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt, sink: &mut dyn OutputSink) -> Result<Option<Value>, ErrorInfo> {
        self.check_interrupt(stmt.line)?;
        let line = stmt.line;

        match &stmt.kind {
            StmtKind::Let(name, expr) => {
                let value = self.eval(expr, line)?;
                self.globals.insert(name.clone(), value);
            }
            StmtKind::Print(expr) => {
                let value = self.eval(expr, line)?;
                sink.emit(RawOutput::Stdout(format!("{}\n", value)));
            }
            StmtKind::Eprint(expr) => {
                let value = self.eval(expr, line)?;
                sink.emit(RawOutput::Stderr(format!("{}\n", value)));
            }
            StmtKind::Sleep(expr) => {
                let ms = self.eval_int(expr, line)?;
                self.sleep(Duration::from_millis(ms.max(0) as u64), line)?;
            }
            StmtKind::Repeat { count, var, body } => {
                let n = self.eval_int(count, line)?;
                for i in 0..n.max(0) {
                    if let Some(var) = var {
                        self.globals.insert(var.clone(), Value::Int(i));
                    }
                    for inner in body {
                        self.exec(inner, sink)?;
                    }
                }
            }
            StmtKind::Raise { ename, message } => {
                let evalue = match message {
                    Some(expr) => self.eval(expr, line)?.to_string(),
                    None => String::new(),
                };
                return Err(ErrorInfo::new(ename.clone(), evalue)
                    .with_traceback(vec![format!("line {}", line)]));
            }
            StmtKind::Display {
                mime,
                value,
                display_id,
            } => {
                let value = self.eval(value, line)?;
                sink.emit(RawOutput::Display {
                    data: MimeBundle::new().with(mime.clone(), serde_json::json!(value.to_string())),
                    metadata: MimeBundle::new(),
                    display_id: display_id.clone(),
                });
            }
            StmtKind::Update {
                display_id,
                mime,
                value,
            } => {
                let value = self.eval(value, line)?;
                sink.emit(RawOutput::UpdateDisplay {
                    data: MimeBundle::new().with(mime.clone(), serde_json::json!(value.to_string())),
                    metadata: MimeBundle::new(),
                    display_id: display_id.clone(),
                });
            }
            StmtKind::Panic(expr) => {
                let message = self.eval(expr, line)?;
                panic!("{}", message);
            }
            StmtKind::Expr(expr) => return Ok(Some(self.eval(expr, line)?)),
        }

        Ok(None)
    }

    fn sleep(&self, duration: Duration, line: usize) -> Result<(), ErrorInfo> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_interrupt(line)?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn eval_int(&self, expr: &Expr, line: usize) -> Result<i64, ErrorInfo> {
        match self.eval(expr, line)? {
            Value::Int(n) => Ok(n),
            Value::Str(s) => Err(ErrorInfo::new("TypeError", format!("expected integer, got {:?}", s))
                .with_traceback(vec![format!("line {}", line)])),
        }
    }

    fn eval(&self, expr: &Expr, line: usize) -> Result<Value, ErrorInfo> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Var(name) => self.globals.get(name).cloned().ok_or_else(|| {
                ErrorInfo::new("NameError", format!("name '{}' is not defined", name))
                    .with_traceback(vec![format!("line {}", line)])
            }),
            Expr::Add(lhs, rhs) => match (self.eval(lhs, line)?, self.eval(rhs, line)?) {
                (Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or_else(|| {
                    ErrorInfo::new("OverflowError", "integer addition overflowed")
                        .with_traceback(vec![format!("line {}", line)])
                }),
                (a, b) => Ok(Value::Str(format!("{}{}", a, b))),
            },
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "interpreter_tests.rs"]
mod tests;
