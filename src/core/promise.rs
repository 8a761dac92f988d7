//! Late-bound integers resolved at finalization time.
//!
//! A promise names an address or offset that is not known while code is
//! being built: the machine offset of an event that has not compiled yet,
//! the eventual address of a logical instruction, or a slot in the
//! constant pool appended after the code section. All promises live in a
//! single arena-backed store which also owns the finalization state
//! (buffer base address, code length, per-logical-IP machine offsets), so
//! `value` and `resolved` are plain functions over that state. Querying a
//! promise too early is an ordering bug and fails with `NotResolved`.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use super::error::{CompileError, CompileResult};

/// Handle to a promise record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromiseId(pub(crate) u32);

/// Round `length` up to the next word boundary; the constant pool starts
/// here.
pub fn pad(length: u32, word: u32) -> u32 {
    length.div_ceil(word) * word
}

#[derive(Debug, Clone, Copy)]
enum PromiseKind {
    /// A known constant.
    Resolved(i64),
    /// An offset into the emitted code, bound once the owning event has
    /// compiled. `next` chains promises attached to the same event.
    Code {
        offset: Option<u32>,
        next: Option<PromiseId>,
    },
    /// The machine offset of a logical instruction.
    Ip(u32),
    /// A word slot in the constant pool.
    Pool(u32),
}

/// Arena of promise records plus the finalized-layout state they resolve
/// against.
pub struct Promises<'a> {
    kinds: BumpVec<'a, PromiseKind>,
    ip_offsets: BumpVec<'a, Option<u32>>,
    word: u32,
    code_base: Option<i64>,
    code_length: u32,
}

impl<'a> Promises<'a> {
    pub fn new(arena: &'a Bump, word: u32) -> Self {
        Self {
            kinds: BumpVec::new_in(arena),
            ip_offsets: BumpVec::new_in(arena),
            word,
            code_base: None,
            code_length: 0,
        }
    }

    /// Size the logical-IP offset table; called from `Compiler::init`.
    pub(crate) fn init_logical(&mut self, logical_code_length: u32) {
        self.ip_offsets.clear();
        self.ip_offsets
            .extend(std::iter::repeat(None).take(logical_code_length as usize));
    }

    fn push(&mut self, kind: PromiseKind) -> PromiseId {
        let id = PromiseId(self.kinds.len() as u32);
        self.kinds.push(kind);
        id
    }

    pub fn resolved_promise(&mut self, value: i64) -> PromiseId {
        self.push(PromiseKind::Resolved(value))
    }

    pub(crate) fn code_promise(&mut self) -> PromiseId {
        self.push(PromiseKind::Code {
            offset: None,
            next: None,
        })
    }

    pub(crate) fn code_promise_at(&mut self, offset: u32) -> PromiseId {
        self.push(PromiseKind::Code {
            offset: Some(offset),
            next: None,
        })
    }

    pub(crate) fn ip_promise(&mut self, logical_ip: u32) -> PromiseId {
        self.push(PromiseKind::Ip(logical_ip))
    }

    pub(crate) fn pool_promise(&mut self, key: u32) -> PromiseId {
        self.push(PromiseKind::Pool(key))
    }

    /// Bind a code promise to a machine offset.
    pub(crate) fn bind_code(&mut self, id: PromiseId, offset: u32) {
        match &mut self.kinds[id.0 as usize] {
            PromiseKind::Code { offset: slot, .. } => *slot = Some(offset),
            _ => debug_assert!(false, "bind_code on a non-code promise"),
        }
    }

    /// Chain a code promise in front of `next`, returning whether `id`
    /// really is a code promise.
    pub(crate) fn chain_code(&mut self, id: PromiseId, next: Option<PromiseId>) -> bool {
        match &mut self.kinds[id.0 as usize] {
            PromiseKind::Code { next: slot, .. } => {
                *slot = next;
                true
            }
            _ => false,
        }
    }

    /// The promise chained after `id`, for walking an event's list.
    pub(crate) fn code_next(&self, id: PromiseId) -> Option<PromiseId> {
        match self.kinds[id.0 as usize] {
            PromiseKind::Code { next, .. } => next,
            _ => None,
        }
    }

    pub(crate) fn bind_ip(&mut self, logical_ip: u32, offset: u32) {
        self.ip_offsets[logical_ip as usize] = Some(offset);
    }

    /// Record the destination base address and code length; everything
    /// becomes resolvable afterwards. Safe to call again for a second
    /// `write_to` pass.
    pub(crate) fn finalize(&mut self, code_base: i64, code_length: u32) {
        self.code_base = Some(code_base);
        self.code_length = code_length;
    }

    pub fn is_resolved(&self, id: PromiseId) -> bool {
        match self.kinds[id.0 as usize] {
            PromiseKind::Resolved(_) => true,
            PromiseKind::Code { offset, .. } => self.code_base.is_some() && offset.is_some(),
            PromiseKind::Ip(ip) => {
                self.code_base.is_some() && self.ip_offsets[ip as usize].is_some()
            }
            PromiseKind::Pool(_) => self.code_base.is_some(),
        }
    }

    /// The promise's value, typically an absolute address within the
    /// finalized buffer.
    pub fn value(&self, id: PromiseId) -> CompileResult<i64> {
        let base = || self.code_base.ok_or(CompileError::NotResolved);
        match self.kinds[id.0 as usize] {
            PromiseKind::Resolved(v) => Ok(v),
            PromiseKind::Code { offset, .. } => {
                let offset = offset.ok_or(CompileError::NotResolved)?;
                Ok(base()? + offset as i64)
            }
            PromiseKind::Ip(ip) => {
                let offset = self.ip_offsets[ip as usize].ok_or(CompileError::NotResolved)?;
                Ok(base()? + offset as i64)
            }
            PromiseKind::Pool(key) => {
                Ok(base()?
                    + pad(self.code_length, self.word) as i64
                    + (key * self.word) as i64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_promise_is_immediately_readable() {
        let arena = Bump::new();
        let mut promises = Promises::new(&arena, 8);
        let p = promises.resolved_promise(42);
        assert!(promises.is_resolved(p));
        assert_eq!(promises.value(p), Ok(42));
    }

    #[test]
    fn code_promise_requires_offset_and_base() {
        let arena = Bump::new();
        let mut promises = Promises::new(&arena, 8);
        let p = promises.code_promise();
        assert!(!promises.is_resolved(p));
        assert_eq!(promises.value(p), Err(CompileError::NotResolved));

        promises.bind_code(p, 16);
        assert!(!promises.is_resolved(p));

        promises.finalize(0x1000, 32);
        assert!(promises.is_resolved(p));
        assert_eq!(promises.value(p), Ok(0x1010));
    }

    #[test]
    fn ip_promise_reads_logical_offsets() {
        let arena = Bump::new();
        let mut promises = Promises::new(&arena, 8);
        promises.init_logical(4);
        let p = promises.ip_promise(2);
        promises.bind_ip(2, 24);
        assert_eq!(promises.value(p), Err(CompileError::NotResolved));
        promises.finalize(0x2000, 40);
        assert_eq!(promises.value(p), Ok(0x2018));
    }

    #[test]
    fn pool_promise_lands_after_padded_code() {
        let arena = Bump::new();
        let mut promises = Promises::new(&arena, 8);
        let p0 = promises.pool_promise(0);
        let p1 = promises.pool_promise(1);
        promises.finalize(0x1000, 13);
        // code pads from 13 to 16
        assert_eq!(promises.value(p0), Ok(0x1010));
        assert_eq!(promises.value(p1), Ok(0x1018));
    }

    #[test]
    fn pad_rounds_to_word() {
        assert_eq!(pad(0, 8), 0);
        assert_eq!(pad(1, 8), 8);
        assert_eq!(pad(8, 8), 8);
        assert_eq!(pad(9, 4), 12);
    }
}
