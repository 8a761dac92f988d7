//! Raw instruction encoders and the deferred-patch machinery.
//!
//! Each encoder appends the bytes of one instruction form to the code
//! buffer. Anything the encoder cannot know yet (a forward branch
//! displacement, an absolute address that resolves at finalization) is
//! recorded as a [`Task`] and patched when the buffer is written out.
//!
//! Conventions shared by every encoder:
//! - the second operand is the destination (`sub a, b` computes `b - a`);
//! - on the 32-bit target a double-word value is handled as two 32-bit
//!   pieces, low then high, with carry/borrow where needed;
//! - REX prefixes appear only on the 64-bit target, for extended
//!   registers or explicitly 64-bit operations;
//! - zero displacements omit the ModRM displacement byte unless the base
//!   is rbp-like, 8-bit displacements use the short form, and a SIB byte
//!   is emitted whenever the base is rsp-like or an index is present.

use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::Promises;

use super::{AsmOperand, ConstOperand, Mem, Reg, RegPair, R10, RAX, RBP, RBX, RCX, RDX, RSP};

pub(crate) fn is_int8(v: i64) -> bool {
    v == v as i8 as i64
}

pub(crate) fn is_int32(v: i64) -> bool {
    v == v as i32 as i64
}

/// Growable byte buffer holding encoded machine code.
#[derive(Debug, Default)]
pub struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn append(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub(crate) fn append_slice(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub(crate) fn append_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn append_i32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn append_i64(&mut self, v: i64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }
}

/// A deferred byte patch, run while writing the finalized buffer.
#[derive(Debug, Clone, Copy)]
pub enum Task {
    /// Patch the trailing 32-bit PC-relative displacement of a branch or
    /// call instruction.
    Offset {
        value: ConstOperand,
        instruction_offset: u32,
        instruction_size: u32,
    },
    /// Patch a word-sized absolute immediate.
    Immediate { value: ConstOperand, offset: u32 },
}

impl Task {
    pub(crate) fn run(
        &self,
        code: &mut [u8],
        code_base: i64,
        word: u32,
        promises: &Promises,
    ) -> CompileResult<()> {
        match *self {
            Task::Offset {
                value,
                instruction_offset,
                instruction_size,
            } => {
                let target = value.value(promises)?;
                let displacement =
                    target - (code_base + instruction_offset as i64) - instruction_size as i64;
                if !is_int32(displacement) {
                    return Err(CompileError::RangeExceeded { displacement });
                }
                let at = (instruction_offset + instruction_size - 4) as usize;
                code[at..at + 4].copy_from_slice(&(displacement as i32).to_le_bytes());
                Ok(())
            }
            Task::Immediate { value, offset } => {
                let v = value.value(promises)?;
                let at = offset as usize;
                match word {
                    4 => code[at..at + 4].copy_from_slice(&(v as i32).to_le_bytes()),
                    _ => code[at..at + 8].copy_from_slice(&v.to_le_bytes()),
                }
                Ok(())
            }
        }
    }
}

/// Everything an encoder needs: target word size, the output buffer, the
/// task list, and read access to the promise store.
pub(crate) struct EmitCtx<'e, 'a> {
    pub word: u32,
    pub code: &'e mut CodeBuf,
    pub tasks: &'e mut Vec<Task>,
    pub promises: &'e Promises<'a>,
}

impl EmitCtx<'_, '_> {
    fn rex_raw(&mut self, wide: bool, reg: Reg, index: Option<Reg>, base: Reg, force: bool) {
        if self.word == 4 {
            return;
        }
        let mut v = 0x40u8;
        if wide {
            v |= 0x08;
        }
        if reg.extended() {
            v |= 0x04;
        }
        if index.is_some_and(Reg::extended) {
            v |= 0x02;
        }
        if base.extended() {
            v |= 0x01;
        }
        if v != 0x40 || force {
            self.code.append(v);
        }
    }

    fn rex(&mut self, wide: bool, reg: Reg, index: Option<Reg>, base: Reg) {
        self.rex_raw(wide, reg, index, base, false);
    }

    /// REX for byte-register operands: spl/bpl/sil/dil need the prefix
    /// even without extension bits.
    fn rex8(&mut self, wide: bool, reg: Reg, rm: Reg) {
        let force = (4..8).contains(&reg.0) || (4..8).contains(&rm.0);
        self.rex_raw(wide, reg, None, rm, force);
    }

    fn modrm_reg(&mut self, reg: Reg, rm: Reg) {
        self.code.append(0xc0 | (reg.low3() << 3) | rm.low3());
    }

    fn modrm_ext(&mut self, ext: u8, rm: Reg) {
        self.code.append(0xc0 | (ext << 3) | rm.low3());
    }

    /// Emit REX + opcode bytes + ModRM/SIB/displacement for a memory
    /// operand.
    fn encode_mem(
        &mut self,
        opcodes: &[u8],
        wide: bool,
        force_rex: bool,
        reg: Reg,
        mem: &Mem,
    ) -> CompileResult<()> {
        self.rex_raw(wide, reg, mem.index, mem.base, force_rex);
        self.code.append_slice(opcodes);

        let disp = mem.offset;
        let mode: u8 = if disp == 0 && mem.base.low3() != RBP.low3() {
            0x00
        } else if is_int8(disp as i64) {
            0x40
        } else {
            0x80
        };

        match mem.index {
            None => {
                self.code.append(mode | (reg.low3() << 3) | mem.base.low3());
                if mem.base.low3() == RSP.low3() {
                    self.code.append(0x24);
                }
            }
            Some(index) => {
                if index.low3() == RSP.low3() {
                    return Err(CompileError::Unreachable("rsp cannot be an index"));
                }
                let scale_log = match mem.scale {
                    1 => 0u8,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => return Err(CompileError::Unreachable("invalid index scale")),
                };
                self.code.append(mode | (reg.low3() << 3) | 0x04);
                self.code
                    .append((scale_log << 6) | (index.low3() << 3) | mem.base.low3());
            }
        }

        match mode {
            0x40 => self.code.append(disp as u8),
            0x80 => self.code.append_i32(disp),
            _ => {}
        }
        Ok(())
    }

    /// Emit an immediate, or a patch task when the value is still a
    /// promise. Unresolved immediates must be word-sized so the task can
    /// overwrite them in place.
    fn imm_or_task(&mut self, c: ConstOperand, width: u32) -> CompileResult<()> {
        if c.is_resolved(self.promises) {
            let v = c.value(self.promises)?;
            match width {
                4 => self.code.append_i32(v as i32),
                _ => self.code.append_i64(v),
            }
        } else {
            if width != self.word {
                return Err(CompileError::NotResolved);
            }
            self.tasks.push(Task::Immediate {
                value: c,
                offset: self.code.len(),
            });
            match width {
                4 => self.code.append_i32(0),
                _ => self.code.append_i64(0),
            }
        }
        Ok(())
    }
}

fn pair_high(p: RegPair) -> CompileResult<Reg> {
    p.high
        .ok_or(CompileError::Unreachable("register pair required"))
}

// ---------------------------------------------------------------------------
// branches and calls

fn unconditional(ctx: &mut EmitCtx, opcode: u8, a: ConstOperand) {
    ctx.tasks.push(Task::Offset {
        value: a,
        instruction_offset: ctx.code.len(),
        instruction_size: 5,
    });
    ctx.code.append(opcode);
    ctx.code.append_i32(0);
}

fn conditional(ctx: &mut EmitCtx, condition: u8, a: ConstOperand) {
    ctx.tasks.push(Task::Offset {
        value: a,
        instruction_offset: ctx.code.len(),
        instruction_size: 6,
    });
    ctx.code.append(0x0f);
    ctx.code.append(condition);
    ctx.code.append_i32(0);
}

pub(crate) fn return_(ctx: &mut EmitCtx) -> CompileResult<()> {
    ctx.code.append(0xc3);
    Ok(())
}

pub(crate) fn jump_r(ctx: &mut EmitCtx, _size: u32, a: &AsmOperand) -> CompileResult<()> {
    let a = a.registers()?;
    ctx.rex(false, Reg(0), None, a.low);
    ctx.code.append(0xff);
    ctx.code.append(0xe0 | a.low.low3());
    Ok(())
}

pub(crate) fn jump_c(ctx: &mut EmitCtx, _size: u32, a: &AsmOperand) -> CompileResult<()> {
    unconditional(ctx, 0xe9, a.constant()?);
    Ok(())
}

pub(crate) fn jump_m(ctx: &mut EmitCtx, _size: u32, a: &AsmOperand) -> CompileResult<()> {
    let m = a.memory()?;
    ctx.encode_mem(&[0xff], false, false, Reg(4), &m)
}

pub(crate) fn long_jump_c(ctx: &mut EmitCtx, size: u32, a: &AsmOperand) -> CompileResult<()> {
    if ctx.word == 8 {
        move_const_reg(ctx, a.constant()?, 8, RegPair::single(R10))?;
        ctx.rex(false, Reg(0), None, R10);
        ctx.code.append(0xff);
        ctx.code.append(0xe0 | R10.low3());
        Ok(())
    } else {
        jump_c(ctx, size, a)
    }
}

pub(crate) fn call_r(ctx: &mut EmitCtx, _size: u32, a: &AsmOperand) -> CompileResult<()> {
    let a = a.registers()?;
    ctx.rex(false, Reg(0), None, a.low);
    ctx.code.append(0xff);
    ctx.code.append(0xd0 | a.low.low3());
    Ok(())
}

pub(crate) fn call_c(ctx: &mut EmitCtx, _size: u32, a: &AsmOperand) -> CompileResult<()> {
    unconditional(ctx, 0xe8, a.constant()?);
    Ok(())
}

pub(crate) fn call_m(ctx: &mut EmitCtx, _size: u32, a: &AsmOperand) -> CompileResult<()> {
    let m = a.memory()?;
    ctx.encode_mem(&[0xff], false, false, Reg(2), &m)
}

pub(crate) fn long_call_c(ctx: &mut EmitCtx, size: u32, a: &AsmOperand) -> CompileResult<()> {
    if ctx.word == 8 {
        move_const_reg(ctx, a.constant()?, 8, RegPair::single(R10))?;
        ctx.rex(false, Reg(0), None, R10);
        ctx.code.append(0xff);
        ctx.code.append(0xd0 | R10.low3());
        Ok(())
    } else {
        call_c(ctx, size, a)
    }
}

macro_rules! conditional_jump {
    ($name:ident, $cc:expr) => {
        pub(crate) fn $name(ctx: &mut EmitCtx, _size: u32, a: &AsmOperand) -> CompileResult<()> {
            conditional(ctx, $cc, a.constant()?);
            Ok(())
        }
    };
}

conditional_jump!(jump_if_equal_c, 0x84);
conditional_jump!(jump_if_not_equal_c, 0x85);
conditional_jump!(jump_if_less_c, 0x8c);
conditional_jump!(jump_if_greater_or_equal_c, 0x8d);
conditional_jump!(jump_if_less_or_equal_c, 0x8e);
conditional_jump!(jump_if_greater_c, 0x8f);

// ---------------------------------------------------------------------------
// push / pop

fn push_reg(ctx: &mut EmitCtx, size: u32, a: RegPair) -> CompileResult<()> {
    if ctx.word == 4 && size == 8 {
        let high = pair_high(a)?;
        push_reg(ctx, 4, RegPair::single(high))?;
        push_reg(ctx, 4, RegPair::single(a.low))
    } else {
        ctx.rex(false, Reg(0), None, a.low);
        ctx.code.append(0x50 | a.low.low3());
        Ok(())
    }
}

pub(crate) fn push_r(ctx: &mut EmitCtx, size: u32, a: &AsmOperand) -> CompileResult<()> {
    push_reg(ctx, size, a.registers()?)
}

pub(crate) fn push_c(ctx: &mut EmitCtx, size: u32, a: &AsmOperand) -> CompileResult<()> {
    let c = a.constant()?;
    if ctx.word == 4 && size == 8 {
        let v = c.value(ctx.promises)?;
        ctx.code.append(0x68);
        ctx.code.append_i32((v >> 32) as i32);
        ctx.code.append(0x68);
        ctx.code.append_i32(v as i32);
        Ok(())
    } else if c.is_resolved(ctx.promises) && is_int32(c.value(ctx.promises)?) {
        ctx.code.append(0x68);
        ctx.code.append_i32(c.value(ctx.promises)? as i32);
        Ok(())
    } else if ctx.word == 4 {
        ctx.code.append(0x68);
        ctx.tasks.push(Task::Immediate {
            value: c,
            offset: ctx.code.len(),
        });
        ctx.code.append_i32(0);
        Ok(())
    } else {
        move_const_reg(ctx, c, 8, RegPair::single(R10))?;
        push_reg(ctx, 8, RegPair::single(R10))
    }
}

pub(crate) fn push_m(ctx: &mut EmitCtx, size: u32, a: &AsmOperand) -> CompileResult<()> {
    let m = a.memory()?;
    if ctx.word == 4 && size == 8 {
        ctx.encode_mem(&[0xff], false, false, Reg(6), &m.displaced(4))?;
        ctx.encode_mem(&[0xff], false, false, Reg(6), &m)
    } else {
        ctx.encode_mem(&[0xff], false, false, Reg(6), &m)
    }
}

pub(crate) fn pop_r(ctx: &mut EmitCtx, size: u32, a: &AsmOperand) -> CompileResult<()> {
    let a = a.registers()?;
    if ctx.word == 4 && size == 8 {
        let high = pair_high(a)?;
        ctx.code.append(0x58 | a.low.low3());
        ctx.code.append(0x58 | high.low3());
    } else {
        ctx.rex(false, Reg(0), None, a.low);
        ctx.code.append(0x58 | a.low.low3());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// moves

fn move_const_reg(ctx: &mut EmitCtx, a: ConstOperand, size: u32, b: RegPair) -> CompileResult<()> {
    if ctx.word == 4 && size == 8 {
        let v = a.value(ctx.promises)?;
        let high = pair_high(b)?;
        move_const_reg(ctx, ConstOperand::Imm(v & 0xffff_ffff), 4, RegPair::single(b.low))?;
        move_const_reg(ctx, ConstOperand::Imm(v >> 32), 4, RegPair::single(high))
    } else if size == 8 {
        ctx.rex(true, Reg(0), None, b.low);
        ctx.code.append(0xb8 | b.low.low3());
        ctx.imm_or_task(a, 8)
    } else {
        ctx.rex(false, Reg(0), None, b.low);
        ctx.code.append(0xb8 | b.low.low3());
        ctx.imm_or_task(a, 4)
    }
}

fn move_reg_reg(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: RegPair,
    b_size: u32,
    b: RegPair,
) -> CompileResult<()> {
    if ctx.word == 4 && a_size == 8 && b_size == 8 {
        let (ah, bh) = (pair_high(a)?, pair_high(b)?);
        move_reg_reg(ctx, 4, RegPair::single(a.low), 4, RegPair::single(b.low))?;
        return move_reg_reg(ctx, 4, RegPair::single(ah), 4, RegPair::single(bh));
    }
    match a_size {
        1 => {
            if ctx.word == 4 && a.low.0 > RBX.0 {
                // no byte encoding for esp..edi without REX
                if b.low.0 > RBX.0 {
                    return Err(CompileError::Unreachable("byte move needs a low register"));
                }
                move_reg_reg(ctx, 4, a, 4, b)?;
                move_reg_reg(ctx, 1, b, b_size, b)
            } else {
                ctx.rex8(b_size == 8 || ctx.word == 8, b.low, a.low);
                ctx.code.append_slice(&[0x0f, 0xbe]);
                ctx.modrm_reg(b.low, a.low);
                Ok(())
            }
        }
        2 => {
            ctx.rex(b_size == 8 || ctx.word == 8, b.low, None, a.low);
            ctx.code.append_slice(&[0x0f, 0xbf]);
            ctx.modrm_reg(b.low, a.low);
            Ok(())
        }
        4 | 8 => {
            if a_size == 4 && b_size == 8 {
                if ctx.word == 8 {
                    ctx.rex(true, b.low, None, a.low);
                    ctx.code.append(0x63);
                    ctx.modrm_reg(b.low, a.low);
                    Ok(())
                } else {
                    let bh = pair_high(b)?;
                    if b.low != RAX || bh != RDX {
                        return Err(CompileError::Unreachable("widening move targets eax:edx"));
                    }
                    if a.low != RAX {
                        move_reg_reg(ctx, 4, RegPair::single(a.low), 4, RegPair::single(RAX))?;
                    }
                    ctx.code.append(0x99); // cdq
                    Ok(())
                }
            } else {
                if a.low != b.low {
                    ctx.rex(a_size == 8, a.low, None, b.low);
                    ctx.code.append(0x89);
                    ctx.modrm_reg(a.low, b.low);
                }
                Ok(())
            }
        }
        _ => Err(CompileError::Unreachable("unsupported move width")),
    }
}

fn move_mem_reg(
    ctx: &mut EmitCtx,
    a_size: u32,
    mem: Mem,
    b_size: u32,
    b: RegPair,
) -> CompileResult<()> {
    match a_size {
        1 => ctx.encode_mem(&[0x0f, 0xbe], ctx.word == 8, false, b.low, &mem),
        2 => ctx.encode_mem(&[0x0f, 0xbf], ctx.word == 8, false, b.low, &mem),
        4 | 8 => {
            if ctx.word == 4 && a_size == 8 {
                let bh = pair_high(b)?;
                if mem.base == b.low || mem.index == Some(b.low) {
                    // keep the address intact until the last load
                    move_mem_reg(ctx, 4, mem.displaced(4), 4, RegPair::single(bh))?;
                    move_mem_reg(ctx, 4, mem, 4, RegPair::single(b.low))
                } else {
                    move_mem_reg(ctx, 4, mem, 4, RegPair::single(b.low))?;
                    move_mem_reg(ctx, 4, mem.displaced(4), 4, RegPair::single(bh))
                }
            } else if ctx.word == 8 && a_size == 4 {
                // sign-extending load
                ctx.encode_mem(&[0x63], true, false, b.low, &mem)
            } else {
                ctx.encode_mem(&[0x8b], a_size == 8, false, b.low, &mem)
            }
        }
        _ => Err(CompileError::Unreachable("unsupported load width")),
    }
}

fn move_reg_mem(ctx: &mut EmitCtx, a_size: u32, a: RegPair, mem: Mem) -> CompileResult<()> {
    if ctx.word == 4 && a_size == 8 {
        let ah = pair_high(a)?;
        move_reg_mem(ctx, 4, RegPair::single(a.low), mem)?;
        return move_reg_mem(ctx, 4, RegPair::single(ah), mem.displaced(4));
    }
    if ctx.word == 8 && a_size == 4 {
        return ctx.encode_mem(&[0x89], false, false, a.low, &mem);
    }
    match a_size {
        1 => {
            if ctx.word == 4 && a.low.0 > RBX.0 {
                Err(CompileError::Unreachable("byte store needs a low register"))
            } else {
                let force = (4..8).contains(&a.low.0);
                ctx.encode_mem(&[0x88], false, force, a.low, &mem)
            }
        }
        2 => {
            ctx.code.append(0x66);
            ctx.encode_mem(&[0x89], false, false, a.low, &mem)
        }
        4 | 8 => ctx.encode_mem(&[0x89], a_size == 8, false, a.low, &mem),
        _ => Err(CompileError::Unreachable("unsupported store width")),
    }
}

fn move_const_mem(ctx: &mut EmitCtx, a: ConstOperand, size: u32, mem: Mem) -> CompileResult<()> {
    if ctx.word == 4 && size == 8 {
        let v = a.value(ctx.promises)?;
        move_const_mem(ctx, ConstOperand::Imm(v & 0xffff_ffff), 4, mem)?;
        return move_const_mem(ctx, ConstOperand::Imm(v >> 32), 4, mem.displaced(4));
    }
    if !a.is_resolved(ctx.promises) {
        if ctx.word == 4 {
            ctx.encode_mem(&[0xc7], false, false, Reg(0), &mem)?;
            ctx.tasks.push(Task::Immediate {
                value: a,
                offset: ctx.code.len(),
            });
            ctx.code.append_i32(0);
            return Ok(());
        }
        move_const_reg(ctx, a, 8, RegPair::single(R10))?;
        return move_reg_mem(ctx, size, RegPair::single(R10), mem);
    }
    let v = a.value(ctx.promises)?;
    if !is_int32(v) {
        move_const_reg(ctx, a, 8, RegPair::single(R10))?;
        return move_reg_mem(ctx, size, RegPair::single(R10), mem);
    }
    match size {
        1 => {
            ctx.encode_mem(&[0xc6], false, false, Reg(0), &mem)?;
            ctx.code.append(v as u8);
        }
        2 => {
            ctx.code.append(0x66);
            ctx.encode_mem(&[0xc7], false, false, Reg(0), &mem)?;
            ctx.code.append_u16(v as u16);
        }
        4 => {
            ctx.encode_mem(&[0xc7], false, false, Reg(0), &mem)?;
            ctx.code.append_i32(v as i32);
        }
        8 => {
            ctx.encode_mem(&[0xc7], true, false, Reg(0), &mem)?;
            ctx.code.append_i32(v as i32);
        }
        _ => return Err(CompileError::Unreachable("unsupported store width")),
    }
    Ok(())
}

pub(crate) fn move_cr(
    ctx: &mut EmitCtx,
    _a_size: u32,
    a: &AsmOperand,
    b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    move_const_reg(ctx, a.constant()?, b_size, b.registers()?)
}

pub(crate) fn move_rr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    move_reg_reg(ctx, a_size, a.registers()?, b_size, b.registers()?)
}

pub(crate) fn move_mr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    move_mem_reg(ctx, a_size, a.memory()?, b_size, b.registers()?)
}

pub(crate) fn move_rm(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    move_reg_mem(ctx, a_size, a.registers()?, b.memory()?)
}

pub(crate) fn move_cm(
    ctx: &mut EmitCtx,
    _a_size: u32,
    a: &AsmOperand,
    b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    move_const_mem(ctx, a.constant()?, b_size, b.memory()?)
}

/// Load the word stored at an absolute address.
pub(crate) fn move_ar(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    let addr = a.constant()?;
    let b = b.registers()?;
    if ctx.word == 4 && b_size == 8 {
        let bh = pair_high(b)?;
        move_const_reg(ctx, addr, 4, RegPair::single(b.low))?;
        move_mem_reg(ctx, 4, Mem::base_offset(b.low, 4), 4, RegPair::single(bh))?;
        move_mem_reg(ctx, 4, Mem::base_offset(b.low, 0), 4, RegPair::single(b.low))
    } else {
        move_const_reg(ctx, addr, ctx.word, RegPair::single(b.low))?;
        move_mem_reg(ctx, a_size, Mem::base_offset(b.low, 0), b_size, b)
    }
}

pub(crate) fn move_z_mr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    let mem = a.memory()?;
    let b = b.registers()?;
    match a_size {
        1 => ctx.encode_mem(&[0x0f, 0xb6], false, false, b.low, &mem),
        2 => ctx.encode_mem(&[0x0f, 0xb7], false, false, b.low, &mem),
        // a plain 32-bit load clears the upper half
        4 => ctx.encode_mem(&[0x8b], false, false, b.low, &mem),
        8 => move_mem_reg(ctx, 8, mem, b_size, b),
        _ => Err(CompileError::Unreachable("unsupported load width")),
    }
}

pub(crate) fn move_z_rr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    let a = a.registers()?;
    let b = b.registers()?;
    match a_size {
        1 => {
            if ctx.word == 4 && a.low.0 > RBX.0 {
                return Err(CompileError::Unreachable("byte move needs a low register"));
            }
            ctx.rex8(false, b.low, a.low);
            ctx.code.append_slice(&[0x0f, 0xb6]);
            ctx.modrm_reg(b.low, a.low);
            Ok(())
        }
        2 => {
            ctx.rex(false, b.low, None, a.low);
            ctx.code.append_slice(&[0x0f, 0xb7]);
            ctx.modrm_reg(b.low, a.low);
            Ok(())
        }
        4 => {
            if a.low != b.low {
                ctx.rex(false, a.low, None, b.low);
                ctx.code.append(0x89);
                ctx.modrm_reg(a.low, b.low);
            }
            Ok(())
        }
        8 => move_reg_reg(ctx, 8, a, b_size, b),
        _ => Err(CompileError::Unreachable("unsupported move width")),
    }
}

pub(crate) fn move_z_cr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    let v = a.constant()?.value(ctx.promises)?;
    let masked = match a_size {
        1 => v & 0xff,
        2 => v & 0xffff,
        4 => v & 0xffff_ffff,
        _ => v,
    };
    move_const_reg(ctx, ConstOperand::Imm(masked), ctx.word, b.registers()?)
}

pub(crate) fn move_4to8_rr(
    ctx: &mut EmitCtx,
    _a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    move_reg_reg(ctx, 4, a.registers()?, 8, b.registers()?)
}

pub(crate) fn move_4to8_mr(
    ctx: &mut EmitCtx,
    _a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    let mem = a.memory()?;
    let b = b.registers()?;
    if ctx.word == 8 {
        move_mem_reg(ctx, 4, mem, 8, b)
    } else {
        let bh = pair_high(b)?;
        if b.low != RAX || bh != RDX {
            return Err(CompileError::Unreachable("widening move targets eax:edx"));
        }
        move_mem_reg(ctx, 4, mem, 4, RegPair::single(RAX))?;
        ctx.code.append(0x99); // cdq
        Ok(())
    }
}

pub(crate) fn move_4to8_cr(
    ctx: &mut EmitCtx,
    _a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    let v = a.constant()?.value(ctx.promises)? as i32 as i64;
    move_const_reg(ctx, ConstOperand::Imm(v), 8, b.registers()?)
}

// ---------------------------------------------------------------------------
// compare

fn compare_const_reg(ctx: &mut EmitCtx, a: ConstOperand, size: u32, b: Reg) -> CompileResult<()> {
    if ctx.word == 4 && size == 8 {
        return Err(CompileError::Unreachable("wide compare is not encodable"));
    }
    if !a.is_resolved(ctx.promises) {
        if ctx.word == 4 {
            ctx.code.append(0x81);
            ctx.modrm_ext(7, b);
            ctx.tasks.push(Task::Immediate {
                value: a,
                offset: ctx.code.len(),
            });
            ctx.code.append_i32(0);
            return Ok(());
        }
        move_const_reg(ctx, a, 8, RegPair::single(R10))?;
        return compare_reg_reg(ctx, size, R10, b);
    }
    let v = a.value(ctx.promises)?;
    if is_int8(v) {
        ctx.rex(size == 8, Reg(0), None, b);
        ctx.code.append(0x83);
        ctx.modrm_ext(7, b);
        ctx.code.append(v as u8);
        Ok(())
    } else if is_int32(v) {
        ctx.rex(size == 8, Reg(0), None, b);
        ctx.code.append(0x81);
        ctx.modrm_ext(7, b);
        ctx.code.append_i32(v as i32);
        Ok(())
    } else {
        move_const_reg(ctx, a, 8, RegPair::single(R10))?;
        compare_reg_reg(ctx, size, R10, b)
    }
}

fn compare_reg_reg(ctx: &mut EmitCtx, size: u32, a: Reg, b: Reg) -> CompileResult<()> {
    ctx.rex(size == 8, a, None, b);
    ctx.code.append(0x39);
    ctx.modrm_reg(a, b);
    Ok(())
}

pub(crate) fn compare_cr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    compare_const_reg(ctx, a.constant()?, a_size, b.registers()?.low)
}

pub(crate) fn compare_rr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    if ctx.word == 4 && a_size == 8 {
        return Err(CompileError::Unreachable("wide compare is not encodable"));
    }
    compare_reg_reg(ctx, a_size, a.registers()?.low, b.registers()?.low)
}

/// Flags for `second - first` with the second operand in memory.
pub(crate) fn compare_rm(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    let m = b.memory()?;
    ctx.encode_mem(&[0x39], a_size == 8, false, a.registers()?.low, &m)
}

/// Flags for `second - first` with the first operand in memory.
pub(crate) fn compare_mr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    let m = a.memory()?;
    ctx.encode_mem(&[0x3b], a_size == 8, false, b.registers()?.low, &m)
}

// ---------------------------------------------------------------------------
// two-address arithmetic

struct AluOp {
    /// r/m, reg opcode for the low word.
    rr: u8,
    /// ModRM extension for the immediate forms.
    ext: u8,
    /// High-word opcode on the 32-bit target (with carry/borrow).
    rr_carry: u8,
    ext_carry: u8,
    /// Whether a zero immediate can be skipped entirely.
    skip_zero: bool,
}

const ADD: AluOp = AluOp {
    rr: 0x01,
    ext: 0,
    rr_carry: 0x11,
    ext_carry: 2,
    skip_zero: true,
};
const SUB: AluOp = AluOp {
    rr: 0x29,
    ext: 5,
    rr_carry: 0x19,
    ext_carry: 3,
    skip_zero: true,
};
const AND: AluOp = AluOp {
    rr: 0x21,
    ext: 4,
    rr_carry: 0x21,
    ext_carry: 4,
    skip_zero: false,
};
const OR: AluOp = AluOp {
    rr: 0x09,
    ext: 1,
    rr_carry: 0x09,
    ext_carry: 1,
    skip_zero: false,
};
const XOR: AluOp = AluOp {
    rr: 0x31,
    ext: 6,
    rr_carry: 0x31,
    ext_carry: 6,
    skip_zero: false,
};

fn alu_imm32(ctx: &mut EmitCtx, ext: u8, wide: bool, v: i64, b: Reg) {
    ctx.rex(wide, Reg(0), None, b);
    if is_int8(v) {
        ctx.code.append(0x83);
        ctx.modrm_ext(ext, b);
        ctx.code.append(v as u8);
    } else {
        ctx.code.append(0x81);
        ctx.modrm_ext(ext, b);
        ctx.code.append_i32(v as i32);
    }
}

fn alu_reg_reg(ctx: &mut EmitCtx, op: &AluOp, size: u32, a: RegPair, b: RegPair) -> CompileResult<()> {
    if ctx.word == 4 && size == 8 {
        let (ah, bh) = (pair_high(a)?, pair_high(b)?);
        ctx.code.append(op.rr);
        ctx.modrm_reg(a.low, b.low);
        ctx.code.append(op.rr_carry);
        ctx.modrm_reg(ah, bh);
    } else {
        ctx.rex(size == 8, a.low, None, b.low);
        ctx.code.append(op.rr);
        ctx.modrm_reg(a.low, b.low);
    }
    Ok(())
}

fn alu_const_reg(
    ctx: &mut EmitCtx,
    op: &AluOp,
    a: ConstOperand,
    size: u32,
    b: RegPair,
) -> CompileResult<()> {
    if !a.is_resolved(ctx.promises) {
        if ctx.word == 4 {
            ctx.code.append(0x81);
            ctx.modrm_ext(op.ext, b.low);
            ctx.tasks.push(Task::Immediate {
                value: a,
                offset: ctx.code.len(),
            });
            ctx.code.append_i32(0);
            return Ok(());
        }
        move_const_reg(ctx, a, 8, RegPair::single(R10))?;
        return alu_reg_reg(ctx, op, size, RegPair::single(R10), b);
    }
    let v = a.value(ctx.promises)?;
    if v == 0 && op.skip_zero {
        return Ok(());
    }
    if ctx.word == 4 && size == 8 {
        let high = pair_high(b)?;
        alu_imm32(ctx, op.ext, false, v as i32 as i64, b.low);
        alu_imm32(ctx, op.ext_carry, false, v >> 32, high);
        Ok(())
    } else if is_int32(v) {
        alu_imm32(ctx, op.ext, size == 8, v, b.low);
        Ok(())
    } else {
        move_const_reg(ctx, a, 8, RegPair::single(R10))?;
        alu_reg_reg(ctx, op, size, RegPair::single(R10), b)
    }
}

macro_rules! alu_encoders {
    ($cr:ident, $rr:ident, $table:expr) => {
        pub(crate) fn $cr(
            ctx: &mut EmitCtx,
            _a_size: u32,
            a: &AsmOperand,
            b_size: u32,
            b: &AsmOperand,
        ) -> CompileResult<()> {
            alu_const_reg(ctx, &$table, a.constant()?, b_size, b.registers()?)
        }

        pub(crate) fn $rr(
            ctx: &mut EmitCtx,
            a_size: u32,
            a: &AsmOperand,
            _b_size: u32,
            b: &AsmOperand,
        ) -> CompileResult<()> {
            alu_reg_reg(ctx, &$table, a_size, a.registers()?, b.registers()?)
        }
    };
}

alu_encoders!(add_cr, add_rr, ADD);
alu_encoders!(subtract_cr, subtract_rr, SUB);
alu_encoders!(and_cr, and_rr, AND);
alu_encoders!(or_cr, or_rr, OR);
alu_encoders!(xor_cr, xor_rr, XOR);

// ---------------------------------------------------------------------------
// multiply / divide / shifts / negate

pub(crate) fn multiply_rr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    if ctx.word == 4 && a_size == 8 {
        return Err(CompileError::Unreachable("wide multiply needs a thunk"));
    }
    let a = a.registers()?;
    let b = b.registers()?;
    ctx.rex(a_size == 8, b.low, None, a.low);
    ctx.code.append_slice(&[0x0f, 0xaf]);
    ctx.modrm_reg(b.low, a.low);
    Ok(())
}

pub(crate) fn multiply_cr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    if ctx.word == 4 && b_size == 8 {
        return Err(CompileError::Unreachable("wide multiply needs a thunk"));
    }
    let c = a.constant()?;
    let b = b.registers()?;
    if c.is_resolved(ctx.promises) && is_int32(c.value(ctx.promises)?) {
        let v = c.value(ctx.promises)?;
        ctx.rex(b_size == 8, b.low, None, b.low);
        if is_int8(v) {
            ctx.code.append(0x6b);
            ctx.modrm_reg(b.low, b.low);
            ctx.code.append(v as u8);
        } else {
            ctx.code.append(0x69);
            ctx.modrm_reg(b.low, b.low);
            ctx.code.append_i32(v as i32);
        }
        Ok(())
    } else {
        move_const_reg(ctx, c, 8, RegPair::single(R10))?;
        ctx.rex(b_size == 8, b.low, None, R10);
        ctx.code.append_slice(&[0x0f, 0xaf]);
        ctx.modrm_reg(b.low, R10);
        Ok(())
    }
}

fn divide_reg(ctx: &mut EmitCtx, size: u32, divisor: Reg, dividend: RegPair) -> CompileResult<()> {
    if ctx.word == 4 && size == 8 {
        return Err(CompileError::Unreachable("wide division needs a thunk"));
    }
    if dividend.low != RAX {
        return Err(CompileError::Unreachable("division reads rax"));
    }
    // sign-extend into rdx, then divide
    ctx.rex(size == 8, Reg(0), None, Reg(0));
    ctx.code.append(0x99);
    ctx.rex(size == 8, Reg(0), None, divisor);
    ctx.code.append(0xf7);
    ctx.modrm_ext(7, divisor);
    Ok(())
}

pub(crate) fn divide_rr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    divide_reg(ctx, a_size, a.registers()?.low, b.registers()?)
}

pub(crate) fn divide_cr(
    ctx: &mut EmitCtx,
    a_size: u32,
    a: &AsmOperand,
    _b_size: u32,
    b: &AsmOperand,
) -> CompileResult<()> {
    move_const_reg(ctx, a.constant()?, a_size.max(4), RegPair::single(R10))?;
    divide_reg(ctx, a_size, R10, b.registers()?)
}

fn shift_reg(ctx: &mut EmitCtx, ext: u8, size: u32, count: Reg, b: RegPair) -> CompileResult<()> {
    if ctx.word == 4 && size == 8 {
        return Err(CompileError::Unreachable("wide shift needs a thunk"));
    }
    if count != RCX {
        return Err(CompileError::Unreachable("shift count lives in rcx"));
    }
    ctx.rex(size == 8, Reg(0), None, b.low);
    ctx.code.append(0xd3);
    ctx.modrm_ext(ext, b.low);
    Ok(())
}

fn shift_imm(ctx: &mut EmitCtx, ext: u8, size: u32, v: i64, b: RegPair) -> CompileResult<()> {
    if ctx.word == 4 && size == 8 {
        return Err(CompileError::Unreachable("wide shift needs a thunk"));
    }
    ctx.rex(size == 8, Reg(0), None, b.low);
    ctx.code.append(0xc1);
    ctx.modrm_ext(ext, b.low);
    ctx.code.append((v & 63) as u8);
    Ok(())
}

macro_rules! shift_encoders {
    ($cr:ident, $rr:ident, $ext:expr) => {
        pub(crate) fn $cr(
            ctx: &mut EmitCtx,
            _a_size: u32,
            a: &AsmOperand,
            b_size: u32,
            b: &AsmOperand,
        ) -> CompileResult<()> {
            let v = a.constant()?.value(ctx.promises)?;
            shift_imm(ctx, $ext, b_size, v, b.registers()?)
        }

        pub(crate) fn $rr(
            ctx: &mut EmitCtx,
            _a_size: u32,
            a: &AsmOperand,
            b_size: u32,
            b: &AsmOperand,
        ) -> CompileResult<()> {
            shift_reg(ctx, $ext, b_size, a.registers()?.low, b.registers()?)
        }
    };
}

shift_encoders!(shift_left_cr, shift_left_rr, 4);
shift_encoders!(shift_right_cr, shift_right_rr, 7);
shift_encoders!(unsigned_shift_right_cr, unsigned_shift_right_rr, 5);

pub(crate) fn negate_r(ctx: &mut EmitCtx, size: u32, a: &AsmOperand) -> CompileResult<()> {
    let a = a.registers()?;
    if ctx.word == 4 && size == 8 {
        let high = pair_high(a)?;
        // neg low; adc high, 0; neg high
        ctx.code.append(0xf7);
        ctx.modrm_ext(3, a.low);
        ctx.code.append(0x83);
        ctx.modrm_ext(2, high);
        ctx.code.append(0);
        ctx.code.append(0xf7);
        ctx.modrm_ext(3, high);
    } else {
        ctx.rex(size == 8, Reg(0), None, a.low);
        ctx.code.append(0xf7);
        ctx.modrm_ext(3, a.low);
    }
    Ok(())
}
