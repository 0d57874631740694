//! Compilation errors
//!
//! Every user-visible failure is one of a small set of kinds, each carrying
//! the source line it was detected on where applicable. Passes short-circuit
//! on the first error and propagate it up with `?`; the CLI maps the
//! outermost kind to a stable process exit code.
//!
//! Internal invariant violations are not represented here: those panic
//! (`unreachable!`/`panic!`), because they indicate a compiler bug rather
//! than bad input.

use std::fmt;

/// Classification of semantic-analysis failures.
///
/// The human-readable message lives next to the kind; the kind itself is
/// what tests and the exit-code mapping key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticErrorKind {
    RedeclConflict,
    UndeclaredIdent,
    UndeclaredTag,
    IncompleteType,
    InvalidType,
    InvalidCast,
    InvalidOperand,
    InvalidLvalue,
    DuplicateCase,
    DuplicateDefault,
    OutOfSwitch,
    OutOfLoop,
    UndefGotoTarget,
    RedefLabel,
    IncompatibleInit,
    ReturnMismatch,
}

#[derive(Debug)]
pub enum CompileError {
    /// Cannot open, read, or write a file.
    Io { message: String },
    /// Invalid token, unterminated literal, header not found.
    Lex { message: String, line: usize },
    /// Unexpected token, constant out of range, malformed declarator.
    Parse { message: String, line: usize },
    /// Anything the semantic analyzer rejects.
    Semantic {
        kind: SemanticErrorKind,
        message: String,
        line: usize,
    },
}

impl CompileError {
    pub fn io(message: impl Into<String>) -> Self {
        CompileError::Io {
            message: message.into(),
        }
    }

    pub fn lex(line: usize, message: impl Into<String>) -> Self {
        CompileError::Lex {
            message: message.into(),
            line,
        }
    }

    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        CompileError::Parse {
            message: message.into(),
            line,
        }
    }

    pub fn semantic(kind: SemanticErrorKind, line: usize, message: impl Into<String>) -> Self {
        CompileError::Semantic {
            kind,
            message: message.into(),
            line,
        }
    }

    /// Stable process exit code for this error category.
    pub fn exit_code(&self) -> i32 {
        match self {
            CompileError::Io { .. } => 2,
            CompileError::Lex { .. } => 3,
            CompileError::Parse { .. } => 4,
            CompileError::Semantic { .. } => 5,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Io { message } => write!(f, "{}", message),
            CompileError::Lex { message, line } => {
                write!(f, "lex error at line {}: {}", line, message)
            }
            CompileError::Parse { message, line } => {
                write!(f, "parse error at line {}: {}", line, message)
            }
            CompileError::Semantic { message, line, .. } => {
                write!(f, "error at line {}: {}", line, message)
            }
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(CompileError::io("x").exit_code(), 2);
        assert_eq!(CompileError::lex(1, "x").exit_code(), 3);
        assert_eq!(CompileError::parse(1, "x").exit_code(), 4);
        assert_eq!(
            CompileError::semantic(SemanticErrorKind::InvalidCast, 1, "x").exit_code(),
            5
        );
    }

    #[test]
    fn display_includes_line() {
        let err = CompileError::parse(41, "expected ';', found '}'");
        assert_eq!(err.to_string(), "parse error at line 41: expected ';', found '}'");
    }
}
