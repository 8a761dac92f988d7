//! onepass - a one-pass baseline JIT backend for x86/x86-64.
//!
//! The crate lowers a stack-oriented, three-address IR into machine code
//! in two tightly coupled stages:
//!
//! - the [`core`] compiler accepts IR operations against an abstract
//!   operand model, records them as an event graph, and performs
//!   lightweight register and stack allocation while driving emission;
//! - the [`x86`] assembler encodes instructions into a byte buffer and
//!   resolves forward references (branch displacements, immediate
//!   addresses, constant-pool slots) when the buffer is written out.
//!
//! # Usage
//!
//! ```
//! use bumpalo::Bump;
//! use onepass::{Compiler, Target};
//!
//! let arena = Bump::new();
//! let mut c = Compiler::new(&arena, Target::X86_64);
//! c.init(1, 0);
//! c.start_logical_ip(0);
//!
//! let answer = c.constant(42);
//! c.push(8, answer).unwrap();
//! let result = c.pop(8).unwrap();
//! c.return_(8, Some(result)).unwrap();
//!
//! let length = c.compile().unwrap();
//! let mut out = vec![0u8; (onepass::pad(length, 8) + c.pool_size()) as usize];
//! c.write_to(&mut out).unwrap();
//! ```
//!
//! The produced buffer is raw machine code; making it executable (and
//! deciding when to run it) is the caller's business.

pub mod core;
pub mod x86;

pub use self::core::{
    pad, CompileError, CompileResult, Compiler, Operand, PromiseId, Promises, TraceHook,
    CALL_ALIGNED,
};
pub use self::x86::{
    Architecture, Assembler, BinaryOperation, Operation, Target, UnaryOperation,
};
