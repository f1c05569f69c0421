// diag.rs — Error model shared by every generation phase
//
// Two kinds of failure exist: usage errors, caused by annotations the
// programmer has to fix, and internal errors, which signal a bookkeeping bug
// in the generator itself. Both abort generation of the current unit only.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `U0001`, `I0003`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // ── Usage errors ──
    pub const EMPTY_PARALLEL_REGION: DiagCode = DiagCode("U0001");
    pub const MIXED_DECLARATION_LINE: DiagCode = DiagCode("U0002");
    pub const UNSUPPORTED_DIMENSIONALITY: DiagCode = DiagCode("U0003");
    pub const UNSUPPORTED_IMPORT: DiagCode = DiagCode("U0004");
    pub const MALFORMED_CALL_ARGUMENT: DiagCode = DiagCode("U0005");
    pub const MALFORMED_SPECIFICATION: DiagCode = DiagCode("U0006");
    pub const INVALID_ACCESS: DiagCode = DiagCode("U0007");
    pub const INVALID_ATTRIBUTE: DiagCode = DiagCode("U0008");
    pub const UNSUPPORTED_TARGET: DiagCode = DiagCode("U0009");
    pub const MALFORMED_UNIT: DiagCode = DiagCode("U0010");

    // ── Internal consistency errors ──
    pub const MISSING_CALLEE: DiagCode = DiagCode("I0001");
    pub const MISSING_CONTEXT: DiagCode = DiagCode("I0002");
    pub const SYMBOL_NOT_IN_SCOPE: DiagCode = DiagCode("I0003");
    pub const KERNEL_COUNTER_MISMATCH: DiagCode = DiagCode("I0004");
    pub const MISSING_TEMPLATE: DiagCode = DiagCode("I0005");
    pub const INCONSISTENT_RESIDENCY: DiagCode = DiagCode("I0006");
    pub const UNMATCHED_SPECIFICATION: DiagCode = DiagCode("I0007");
    pub const SESSION_IN_FLIGHT: DiagCode = DiagCode("I0008");
    pub const DANGLING_REGION: DiagCode = DiagCode("I0009");
}

// ── Error kind ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Annotations or source the programmer has to fix.
    Usage,
    /// Generator bug; not recoverable by changing the input.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Usage => write!(f, "usage"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

// ── GenError ─────────────────────────────────────────────────────────────

/// A generation failure. Aborts the current compilation unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error[{code}]: {message}")]
pub struct GenError {
    pub kind: ErrorKind,
    pub code: DiagCode,
    /// Message followed by any context notes, outermost last.
    pub message: String,
}

impl GenError {
    pub fn usage(code: DiagCode, message: impl Into<String>) -> Self {
        GenError {
            kind: ErrorKind::Usage,
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: DiagCode, message: impl Into<String>) -> Self {
        GenError {
            kind: ErrorKind::Internal,
            code,
            message: message.into(),
        }
    }

    /// Attach a context note (typically the line being processed).
    pub fn with_context(mut self, note: impl AsRef<str>) -> Self {
        self.message.push_str("; ");
        self.message.push_str(note.as_ref());
        self
    }

    pub fn is_usage(&self) -> bool {
        self.kind == ErrorKind::Usage
    }
}

pub type GenResult<T> = Result<T, GenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_usage_error() {
        let e = GenError::usage(
            codes::EMPTY_PARALLEL_REGION,
            "parallel region without any dependant arrays",
        );
        assert_eq!(
            format!("{e}"),
            "usage error[U0001]: parallel region without any dependant arrays"
        );
        assert!(e.is_usage());
    }

    #[test]
    fn display_with_context_chain() {
        let e = GenError::internal(codes::SYMBOL_NOT_IN_SCOPE, "a not found")
            .with_context("Print of Line: call foo(a)");
        assert_eq!(
            format!("{e}"),
            "internal error[I0003]: a not found; Print of Line: call foo(a)"
        );
        assert!(!e.is_usage());
    }
}
