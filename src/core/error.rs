//! Error types for the compiler and assembler.
//!
//! Every failure here signals a bug in the IR client or in the backend
//! itself, never a recoverable condition: the IR layer is expected to
//! validate its input before appending operations. Using thiserror keeps
//! the variants self-describing.

use thiserror::Error;

/// Fatal errors surfaced while building or finalizing machine code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// No encoder is registered for the requested operation and operand
    /// kinds, or an operand reached a context that cannot represent it.
    #[error("unreachable: {0}")]
    Unreachable(&'static str),

    /// A promise was queried before emission made it resolvable.
    #[error("promise queried before it was resolved")]
    NotResolved,

    /// A PC-relative displacement does not fit in 32 bits; the long form
    /// of the call or jump should have been selected.
    #[error("displacement {displacement:#x} exceeds 32-bit range")]
    RangeExceeded { displacement: i64 },

    /// Every non-reserved register is pinned and none can be spilled.
    #[error("no register available for allocation")]
    NoRegisters,

    /// The operation needs a runtime thunk on this target (for example a
    /// 64-bit division on the 32-bit target), which the backend does not
    /// provide.
    #[error("{operation} is not supported for size {size} on this target")]
    UnsupportedOperation { operation: &'static str, size: u32 },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
