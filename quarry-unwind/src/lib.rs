//! Stack unwinding for frames without frame-pointer information.
//!
//! Two independent strategies recover the caller's register state from
//! the callee's:
//!
//! - [`xdata`]: a table-driven interpreter that replays a function's
//!   recorded prologue operations in reverse, following chained entries,
//!   with a leaf fallback and epilogue detection;
//! - [`fpo`]: a postfix stack-machine evaluator for the legacy
//!   frame-pointer-omission records stored in the debug container, whose
//!   programs compute caller registers from frame-size constants.
//!
//! Both depend only on a [`ProcessMemory`] capability for reading the
//! target's stack and code bytes; the process being unwound need not be
//! the one doing the analysis. Unwinding one frame can fail without
//! dooming the walk: callers stop at the failed frame and keep what they
//! have.

use std::error::Error;

use thiserror::Error;

mod base;
pub mod fpo;
mod registers;
pub mod xdata;

pub use base::{MemoryRegion, ProcessMemory};
pub use fpo::{Evaluator, FpoUnwinder};
pub use registers::{RegisterFile, FRAME_REGISTER, REGISTER_NAMES, RSP};
pub use xdata::{
    ExceptionTable, RuntimeFunction, TableUnwinder, UnwindCode, UnwindInfo, UnwindOp,
};

/// The kind of an [`UnwindError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum UnwindErrorKind {
    /// A divide or modulo by zero in a postfix program.
    #[error("division by zero")]
    DivisionByZero,
    /// The left operand of an assignment is not a variable.
    #[error("assignment target is not a variable")]
    NotAVariable,
    /// A program referenced a name with no value.
    #[error("undefined variable")]
    UndefinedVariable,
    /// An operand is neither a known name nor a literal.
    #[error("invalid operand")]
    InvalidOperand,
    /// The postfix program is malformed.
    #[error("malformed program")]
    MalformedProgram,
    /// The operand stack ran dry.
    #[error("operand stack empty")]
    StackUnderflow,
    /// A read through the memory capability failed.
    #[error("memory unreadable")]
    MemoryUnreadable,
    /// The unwind metadata is malformed.
    #[error("bad unwind data")]
    BadUnwindData,
    /// The register file lacks a register the unwind needs.
    #[error("missing register")]
    MissingRegister,
    /// No unwind information covers the address.
    #[error("not found")]
    NotFound,
}

/// An error encountered while unwinding one frame.
///
/// Carries a textual diagnosis; the failed frame ends the walk for its
/// caller without invalidating frames already produced.
#[derive(Debug, Error)]
#[error("{kind}: {diagnosis}")]
pub struct UnwindError {
    kind: UnwindErrorKind,
    diagnosis: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl UnwindError {
    pub(crate) fn new(kind: UnwindErrorKind, diagnosis: impl Into<String>) -> Self {
        Self {
            kind,
            diagnosis: diagnosis.into(),
            source: None,
        }
    }

    pub(crate) fn with_source<E>(kind: UnwindErrorKind, diagnosis: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            diagnosis: diagnosis.into(),
            source: Some(source.into()),
        }
    }

    /// Returns the corresponding [`UnwindErrorKind`] for this error.
    pub fn kind(&self) -> UnwindErrorKind {
        self.kind
    }

    /// The human-readable diagnosis of the failure.
    pub fn diagnosis(&self) -> &str {
        &self.diagnosis
    }
}

impl From<UnwindErrorKind> for UnwindError {
    fn from(kind: UnwindErrorKind) -> Self {
        Self {
            kind,
            diagnosis: String::new(),
            source: None,
        }
    }
}
