//! Status codes and non-local control transfer
//!
//! The execution engine never unwinds the Rust stack with panics. Every
//! operation that can fail or suspend returns a [`Flow`], and intervening
//! frames propagate the [`Control`] with `?`. The nearest protected scope
//! (see `exec::protect`) converts the control value back into a [`Status`].

use std::fmt;

/// Thread / call status codes, shared with the embedding API.
///
/// The numeric values are part of the embedding contract and match the
/// order in which the engine reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Normal completion
    Ok = 0,
    /// Coroutine suspended
    Yield = 1,
    /// Runtime error (wrong types, stack overflow, user-raised)
    RuntimeErr = 2,
    /// A chunk was rejected by the loader
    SyntaxErr = 3,
    /// The allocation governor refused memory
    MemErr = 4,
    /// The error handler itself raised while handling an error
    ErrErr = 5,
}

impl Status {
    /// Numeric code as exposed through the embedding API.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// True for any of the error statuses (not `Ok`, not `Yield`).
    #[inline]
    pub fn is_error(self) -> bool {
        self.code() >= Status::RuntimeErr.code()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "ok",
            Status::Yield => "yield",
            Status::RuntimeErr => "runtime error",
            Status::SyntaxErr => "syntax error",
            Status::MemErr => "memory error",
            Status::ErrErr => "error in error handling",
        };
        f.write_str(name)
    }
}

/// Non-local transfer raised through the call engine.
///
/// `Yield` unwinds to the enclosing `resume`; `Error` unwinds to the
/// nearest protected scope, with the error object already placed on the
/// faulting thread's stack (except for `MemErr`/`ErrErr`, whose messages
/// are materialized at the boundary). `ResumeMisuse` reports an error in
/// the *use* of `resume` itself; it surfaces to the resumer as a runtime
/// error without entering the target coroutine's recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Coroutine suspension in flight
    Yield,
    /// Error with a status code
    Error(Status),
    /// Misuse of `resume` (non-suspended or dead target)
    ResumeMisuse,
}

/// Result type threaded through every operation that may throw or yield.
pub type Flow<T> = Result<T, Control>;

/// Typed error surface for the embedding boundary.
///
/// Internally the engine works with [`Status`] codes and stack-resident
/// error objects; `VmError` is the idiomatic mirror used by chunk I/O and
/// by hosts that prefer `Result` over status codes.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The allocation governor refused memory
    #[error("not enough memory")]
    Memory,

    /// A chunk was rejected by the loader
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Runtime error with the error object rendered as a message
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The error handler itself raised
    #[error("error in error handling")]
    ErrorInError,

    /// Misuse of `resume`
    #[error("cannot resume {0} coroutine")]
    Resume(&'static str),

    /// A chunk reader/writer failed mid-stream
    #[error("chunk truncated or unreadable")]
    BadChunk,
}

impl VmError {
    /// The status code this error maps to at the API surface.
    pub fn status(&self) -> Status {
        match self {
            VmError::Memory => Status::MemErr,
            VmError::Syntax(_) | VmError::BadChunk => Status::SyntaxErr,
            VmError::Runtime(_) | VmError::Resume(_) => Status::RuntimeErr,
            VmError::ErrorInError => Status::ErrErr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::Yield.code(), 1);
        assert_eq!(Status::RuntimeErr.code(), 2);
        assert_eq!(Status::SyntaxErr.code(), 3);
        assert_eq!(Status::MemErr.code(), 4);
        assert_eq!(Status::ErrErr.code(), 5);
    }

    #[test]
    fn test_status_is_error() {
        assert!(!Status::Ok.is_error());
        assert!(!Status::Yield.is_error());
        assert!(Status::RuntimeErr.is_error());
        assert!(Status::MemErr.is_error());
        assert!(Status::ErrErr.is_error());
    }

    #[test]
    fn test_vm_error_status() {
        assert_eq!(VmError::Memory.status(), Status::MemErr);
        assert_eq!(VmError::Syntax("x".into()).status(), Status::SyntaxErr);
        assert_eq!(VmError::Runtime("x".into()).status(), Status::RuntimeErr);
        assert_eq!(VmError::ErrorInError.status(), Status::ErrErr);
        assert_eq!(VmError::Resume("dead").status(), Status::RuntimeErr);
    }
}
