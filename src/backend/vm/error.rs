// Error taxonomy (§6.6, §7): compilation, allocation, runtime and user
// errors all carry a source position; runtime errors additionally carry a
// traceback once they've propagated past at least one frame.
use crate::common::object::{SourcePos, TracebackFrame};
use std::rc::Rc;
use thiserror::Error;

/// The dispatch-time failure a single opcode can raise (§7 "Runtime").
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VMError {
    #[error("TypeMismatchException: {0}")]
    TypeError(String),
    #[error("UnresolvedSymbolException: reference to undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("IllegalInvocationException: {0}")]
    InvalidCall(String),
    #[error("ArithmeticException: {0}")]
    ArithmeticError(String),
    #[error("IndexOutOfBoundsException: {0}")]
    IndexError(String),
    #[error("StackOverflowError: call stack depth limit exceeded")]
    StackOverflow,
    #[error("OutOfMemoryError: heap exhaustion during allocation")]
    OutOfMemory,
    #[error("InternalExecutionException: {0}")]
    InternalError(String),
    /// Raised by a native function through the explicit error API (§7 "User").
    #[error("{0}")]
    User(String),
}

/// A runtime error with enough context to build an `ErrorObject` (§6.6) if
/// `recover` catches it, or to report to the embedder if nothing does.
#[derive(Debug, Clone, Error)]
#[error("{kind}\n  at {file}:{line}:{column}")]
pub struct RuntimeError {
    pub kind: VMError,
    pub file: Rc<str>,
    pub line: u32,
    pub column: u32,
    pub traceback: Vec<TracebackFrame>,
}

impl RuntimeError {
    pub fn new(kind: VMError, pos: &SourcePos) -> Self {
        RuntimeError { kind, file: pos.file.clone(), line: pos.line, column: pos.column, traceback: Vec::new() }
    }

    pub fn position(&self) -> SourcePos {
        SourcePos { file: self.file.clone(), line: self.line, column: self.column }
    }

    pub fn with_frame(mut self, frame: TracebackFrame) -> Self {
        self.traceback.push(frame);
        self
    }
}

/// A compile-time failure (§7 "Compilation"): parser, symbol-table, bytecode
/// emission or include-resolution errors are all reported this way.
#[derive(Debug, Clone, Error)]
#[error("{message} ({file}:{line}:{column})")]
pub struct CompileError {
    pub message: String,
    pub file: Rc<str>,
    pub line: u32,
    pub column: u32,
}

impl CompileError {
    pub fn new(message: impl Into<String>, pos: &SourcePos) -> Self {
        CompileError { message: message.into(), file: pos.file.clone(), line: pos.line, column: pos.column }
    }
}
