//! Error taxonomy: the halt plane ([`VmError`], returned to the embedder
//! from [`crate::Vm::eval`]) and the recoverable plane ([`RuntimeError`])
//! the dispatch loop uses internally before it's turned into a `Panic`.
//!
//! Mirrors the teacher's `InterpreterError`/`RuntimeError` split: a
//! `RuntimeError::Recoverable` carries a `PanicReason` and triggers the
//! unwind-with-diagnostic path; `RuntimeError::Halt` is an unrecoverable
//! host fault (I/O, allocator failure) that aborts evaluation outright.

use std::io;

use glyph_asm::PanicReason;
use thiserror::Error;

/// One call frame's worth of diagnostic context, captured while unwinding
/// after a panic.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub pc: usize,
    pub function_name: Option<String>,
    pub line: Option<u32>,
}

/// Outcome of a single [`crate::Vm::eval`] call.
#[derive(Debug, Error)]
pub enum VmError {
    /// Pass-through from the front-end lexer; the VM never produces this
    /// itself.
    #[error("token error: {0}")]
    TokenError(String),
    /// Pass-through from the front-end parser.
    #[error("parse error: {0}")]
    ParseError(String),
    /// Pass-through from the compiler (bytecode generator / semantic
    /// analyzer), or from [`crate::Chunk::validate`] rejecting a malformed
    /// chunk before execution begins.
    #[error("compile error: {0}")]
    CompileError(String),
    /// The current fiber unwound irrecoverably.
    #[error("panic: {reason} at pc={pc}")]
    Panic {
        reason: PanicReason,
        pc: usize,
        frame_trace: Vec<FrameInfo>,
    },
    /// A host function or finalizer surfaced an OS-level failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl VmError {
    pub fn panic_reason(&self) -> Option<PanicReason> {
        match self {
            Self::Panic { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn result_code(&self) -> glyph_asm::ResultCode {
        use glyph_asm::ResultCode;
        match self {
            Self::TokenError(_) => ResultCode::TokenError,
            Self::ParseError(_) => ResultCode::ParseError,
            Self::CompileError(_) => ResultCode::CompileError,
            Self::Panic { .. } => ResultCode::Panic,
            Self::Io(_) => ResultCode::Unknown,
        }
    }
}

/// Internal dispatch-loop error: either a well-formed panic (caught at the
/// fiber boundary and turned into [`VmError::Panic`] with a captured frame
/// trace) or a host fault that must halt execution outright.
#[derive(Debug)]
pub enum RuntimeError {
    Recoverable(PanicReason),
    Halt(io::Error),
}

impl RuntimeError {
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

impl From<PanicReason> for RuntimeError {
    fn from(r: PanicReason) -> Self {
        RuntimeError::Recoverable(r)
    }
}

impl From<io::Error> for RuntimeError {
    fn from(e: io::Error) -> Self {
        RuntimeError::Halt(e)
    }
}

impl core::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Recoverable(r) => write!(f, "{r}"),
            Self::Halt(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RuntimeError {}
