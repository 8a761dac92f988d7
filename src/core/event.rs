//! Events: recorded IR operations awaiting allocation and emission.
//!
//! An event captures one appended operation at a logical IP, together with
//! its read and write intentions and a snapshot of the abstract stack at
//! append time. Events compile strictly in append order; that order is the
//! only thing that ties the index-based graph together.

use crate::x86::{BinaryOperation, UnaryOperation};

use super::promise::PromiseId;
use super::stack::StackId;
use super::value::{ReadId, ValueId, WriteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EventId(pub(crate) u32);

/// Range into the compiler's call-argument arena.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArgRange {
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum EventKind {
    /// A value pushed onto the abstract stack. Materializes its frame
    /// (and everything below) when marked by a branch or junction.
    Push { frame: StackId, mark: bool },
    /// Frames leaving the abstract stack. `ignore` discards the values
    /// (the `popped` operation); otherwise the single popped frame is
    /// restored into a register if it was materialized.
    Pop {
        frame: StackId,
        words: u32,
        ignore: bool,
    },
    Call {
        address: ValueId,
        indirection: Option<i64>,
        aligned: bool,
        trace: bool,
        result: Option<ValueId>,
        args: ArgRange,
    },
    Return {
        size: u32,
        value: Option<ValueId>,
    },
    Move {
        op: BinaryOperation,
        size: u32,
        src: ValueId,
        dst: ValueId,
    },
    Compare {
        size: u32,
        first: ValueId,
        second: ValueId,
    },
    Branch {
        op: UnaryOperation,
        address: ValueId,
    },
    Combine {
        op: BinaryOperation,
        size: u32,
        first: ValueId,
        second: ValueId,
        result: ValueId,
        clobbers: u16,
    },
    Translate {
        op: UnaryOperation,
        size: u32,
        value: ValueId,
        result: ValueId,
    },
    /// Address-computation synthesis: forces base and index into
    /// registers, then installs a memory site on the result.
    Memory {
        base: ValueId,
        index: Option<ValueId>,
        result: ValueId,
        displacement: i32,
        scale: u8,
    },
}

impl EventKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            EventKind::Push { .. } => "push",
            EventKind::Pop { .. } => "pop",
            EventKind::Call { .. } => "call",
            EventKind::Return { .. } => "return",
            EventKind::Move { .. } => "move",
            EventKind::Compare { .. } => "compare",
            EventKind::Branch { .. } => "branch",
            EventKind::Combine { .. } => "combine",
            EventKind::Translate { .. } => "translate",
            EventKind::Memory { .. } => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub kind: EventKind,
    pub logical_ip: u32,
    /// Abstract stack at append time.
    pub stack: Option<StackId>,
    pub reads: Option<ReadId>,
    pub last_read: Option<ReadId>,
    pub writes: Option<WriteId>,
    pub last_write: Option<WriteId>,
    /// Head of the code promises this event resolves after compiling.
    pub promises: Option<PromiseId>,
}

/// One logical-IP slot.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LogicalInstruction {
    pub visits: u32,
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    pub machine_offset: Option<u32>,
    /// The logical IP started immediately before this one.
    pub predecessor: Option<u32>,
}
