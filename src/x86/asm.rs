//! Operation dispatch and the assembler proper.
//!
//! The assembler owns the code buffer and the deferred-task list. `apply`
//! looks the operation and operand kinds up in a dense table populated at
//! construction; an empty cell means the front-end asked for a combination
//! no encoder supports, which is a bug, not an input error.

use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::Promises;

use super::arch::{Architecture, Target};
use super::encode::{self, CodeBuf, EmitCtx, Task};
use super::{AsmOperand, OperandKind, ENCODABLE_KINDS};

/// Zero-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Return = 0,
}

impl Operation {
    pub(crate) const COUNT: usize = 1;
}

/// One-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperation {
    Call = 0,
    AlignedCall,
    LongCall,
    Jump,
    LongJump,
    JumpIfLess,
    JumpIfGreater,
    JumpIfLessOrEqual,
    JumpIfGreaterOrEqual,
    JumpIfEqual,
    JumpIfNotEqual,
    Negate,
    Push,
    Pop,
}

impl UnaryOperation {
    pub(crate) const COUNT: usize = 14;
}

/// Two-operand operations; the second operand is the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperation {
    Move = 0,
    MoveZ,
    Move4To8,
    Compare,
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,
}

impl BinaryOperation {
    pub(crate) const COUNT: usize = 15;
}

type OperationFn = fn(&mut EmitCtx<'_, '_>) -> CompileResult<()>;
type UnaryFn = fn(&mut EmitCtx<'_, '_>, u32, &AsmOperand) -> CompileResult<()>;
type BinaryFn = fn(&mut EmitCtx<'_, '_>, u32, &AsmOperand, u32, &AsmOperand) -> CompileResult<()>;

/// Dense encoder tables indexed by operation and operand kinds.
struct Dispatch {
    operations: [Option<OperationFn>; Operation::COUNT],
    unary: [[Option<UnaryFn>; ENCODABLE_KINDS]; UnaryOperation::COUNT],
    binary: [[[Option<BinaryFn>; ENCODABLE_KINDS]; ENCODABLE_KINDS]; BinaryOperation::COUNT],
}

impl Dispatch {
    fn populate() -> Self {
        use BinaryOperation as B;
        use OperandKind::{Address, Constant, Memory, Register};
        use UnaryOperation as U;

        let mut d = Dispatch {
            operations: [None; Operation::COUNT],
            unary: [[None; ENCODABLE_KINDS]; UnaryOperation::COUNT],
            binary: [[[None; ENCODABLE_KINDS]; ENCODABLE_KINDS]; BinaryOperation::COUNT],
        };

        d.operations[Operation::Return as usize] = Some(encode::return_ as OperationFn);

        let mut uo = |op: U, kind: OperandKind, f: UnaryFn| {
            d.unary[op as usize][kind as usize] = Some(f);
        };

        uo(U::Call, Constant, encode::call_c);
        uo(U::Call, Register, encode::call_r);
        uo(U::Call, Memory, encode::call_m);
        uo(U::AlignedCall, Constant, encode::call_c);
        uo(U::LongCall, Constant, encode::long_call_c);
        uo(U::Jump, Constant, encode::jump_c);
        uo(U::Jump, Register, encode::jump_r);
        uo(U::Jump, Memory, encode::jump_m);
        uo(U::LongJump, Constant, encode::long_jump_c);
        uo(U::JumpIfLess, Constant, encode::jump_if_less_c);
        uo(U::JumpIfGreater, Constant, encode::jump_if_greater_c);
        uo(U::JumpIfLessOrEqual, Constant, encode::jump_if_less_or_equal_c);
        uo(
            U::JumpIfGreaterOrEqual,
            Constant,
            encode::jump_if_greater_or_equal_c,
        );
        uo(U::JumpIfEqual, Constant, encode::jump_if_equal_c);
        uo(U::JumpIfNotEqual, Constant, encode::jump_if_not_equal_c);
        uo(U::Negate, Register, encode::negate_r);
        uo(U::Push, Register, encode::push_r);
        uo(U::Push, Constant, encode::push_c);
        uo(U::Push, Memory, encode::push_m);
        uo(U::Pop, Register, encode::pop_r);

        let mut bo = |op: B, a: OperandKind, b: OperandKind, f: BinaryFn| {
            d.binary[op as usize][a as usize][b as usize] = Some(f);
        };

        bo(B::Move, Constant, Register, encode::move_cr);
        bo(B::Move, Register, Register, encode::move_rr);
        bo(B::Move, Memory, Register, encode::move_mr);
        bo(B::Move, Register, Memory, encode::move_rm);
        bo(B::Move, Constant, Memory, encode::move_cm);
        bo(B::Move, Address, Register, encode::move_ar);
        bo(B::MoveZ, Memory, Register, encode::move_z_mr);
        bo(B::MoveZ, Register, Register, encode::move_z_rr);
        bo(B::MoveZ, Constant, Register, encode::move_z_cr);
        bo(B::Move4To8, Register, Register, encode::move_4to8_rr);
        bo(B::Move4To8, Memory, Register, encode::move_4to8_mr);
        bo(B::Move4To8, Constant, Register, encode::move_4to8_cr);
        bo(B::Compare, Constant, Register, encode::compare_cr);
        bo(B::Compare, Register, Register, encode::compare_rr);
        bo(B::Compare, Register, Memory, encode::compare_rm);
        bo(B::Compare, Memory, Register, encode::compare_mr);
        bo(B::Add, Constant, Register, encode::add_cr);
        bo(B::Add, Register, Register, encode::add_rr);
        bo(B::Subtract, Constant, Register, encode::subtract_cr);
        bo(B::Subtract, Register, Register, encode::subtract_rr);
        bo(B::And, Constant, Register, encode::and_cr);
        bo(B::And, Register, Register, encode::and_rr);
        bo(B::Or, Constant, Register, encode::or_cr);
        bo(B::Or, Register, Register, encode::or_rr);
        bo(B::Xor, Constant, Register, encode::xor_cr);
        bo(B::Xor, Register, Register, encode::xor_rr);
        bo(B::Multiply, Register, Register, encode::multiply_rr);
        bo(B::Multiply, Constant, Register, encode::multiply_cr);
        bo(B::Divide, Register, Register, encode::divide_rr);
        bo(B::Divide, Constant, Register, encode::divide_cr);
        bo(B::Remainder, Register, Register, encode::divide_rr);
        bo(B::Remainder, Constant, Register, encode::divide_cr);
        bo(B::ShiftLeft, Constant, Register, encode::shift_left_cr);
        bo(B::ShiftLeft, Register, Register, encode::shift_left_rr);
        bo(B::ShiftRight, Constant, Register, encode::shift_right_cr);
        bo(B::ShiftRight, Register, Register, encode::shift_right_rr);
        bo(
            B::UnsignedShiftRight,
            Constant,
            Register,
            encode::unsigned_shift_right_cr,
        );
        bo(
            B::UnsignedShiftRight,
            Register,
            Register,
            encode::unsigned_shift_right_rr,
        );

        d
    }
}

/// Architecture-specific back-end: encodes instructions into a byte buffer
/// and resolves forward references at write-out time.
pub struct Assembler {
    arch: Architecture,
    code: CodeBuf,
    tasks: Vec<Task>,
    dispatch: Dispatch,
}

impl Assembler {
    pub fn new(target: Target) -> Self {
        Self {
            arch: Architecture::new(target),
            code: CodeBuf::new(),
            tasks: Vec::new(),
            dispatch: Dispatch::populate(),
        }
    }

    pub fn arch(&self) -> &Architecture {
        &self.arch
    }

    /// Bytes of code emitted so far.
    pub fn length(&self) -> u32 {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        self.code.bytes()
    }

    fn encodable(kind: OperandKind) -> CompileResult<usize> {
        let index = kind as usize;
        if index < ENCODABLE_KINDS {
            Ok(index)
        } else {
            Err(CompileError::Unreachable("stack operand reached the encoder"))
        }
    }

    pub fn apply(&mut self, promises: &Promises, op: Operation) -> CompileResult<()> {
        let f = self.dispatch.operations[op as usize]
            .ok_or(CompileError::Unreachable("no encoder for operation"))?;
        let mut ctx = EmitCtx {
            word: self.arch.word_size(),
            code: &mut self.code,
            tasks: &mut self.tasks,
            promises,
        };
        f(&mut ctx)
    }

    pub fn apply_unary(
        &mut self,
        promises: &Promises,
        op: UnaryOperation,
        size: u32,
        a: &AsmOperand,
    ) -> CompileResult<()> {
        let f = self.dispatch.unary[op as usize][Self::encodable(a.kind())?]
            .ok_or(CompileError::Unreachable("no encoder for unary operation"))?;
        let mut ctx = EmitCtx {
            word: self.arch.word_size(),
            code: &mut self.code,
            tasks: &mut self.tasks,
            promises,
        };
        f(&mut ctx, size, a)
    }

    pub fn apply_binary(
        &mut self,
        promises: &Promises,
        op: BinaryOperation,
        a_size: u32,
        a: &AsmOperand,
        b_size: u32,
        b: &AsmOperand,
    ) -> CompileResult<()> {
        let f = self.dispatch.binary[op as usize][Self::encodable(a.kind())?]
            [Self::encodable(b.kind())?]
        .ok_or(CompileError::Unreachable("no encoder for binary operation"))?;
        let mut ctx = EmitCtx {
            word: self.arch.word_size(),
            code: &mut self.code,
            tasks: &mut self.tasks,
            promises,
        };
        f(&mut ctx, a_size, a, b_size, b)
    }

    /// Copy the encoded bytes into `dst` and run every recorded patch
    /// task. The promise store must already be finalized against
    /// `code_base`.
    pub fn write_to(
        &self,
        dst: &mut [u8],
        code_base: i64,
        promises: &Promises,
    ) -> CompileResult<()> {
        let len = self.code.len() as usize;
        dst[..len].copy_from_slice(self.code.bytes());
        for task in &self.tasks {
            task.run(dst, code_base, self.arch.word_size(), promises)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::{ConstOperand, RegPair, RAX, RCX};
    use bumpalo::Bump;

    fn reg(r: crate::x86::Reg) -> AsmOperand {
        AsmOperand::Register(RegPair::single(r))
    }

    #[test]
    fn apply_routes_through_the_table() {
        let arena = Bump::new();
        let promises = Promises::new(&arena, 8);
        let mut asm = Assembler::new(Target::X86_64);

        asm.apply_binary(
            &promises,
            BinaryOperation::Move,
            8,
            &AsmOperand::Constant(ConstOperand::Imm(7)),
            8,
            &reg(RAX),
        )
        .unwrap();
        asm.apply_unary(&promises, UnaryOperation::Push, 8, &reg(RAX))
            .unwrap();
        asm.apply(&promises, Operation::Return).unwrap();

        let code = asm.code();
        assert_eq!(&code[..2], &[0x48, 0xb8]);
        assert_eq!(&code[10..], &[0x50, 0xc3]);
    }

    #[test]
    fn unsupported_combination_is_unreachable() {
        let arena = Bump::new();
        let promises = Promises::new(&arena, 8);
        let mut asm = Assembler::new(Target::X86_64);

        // and with a memory destination has no encoder
        let err = asm
            .apply_binary(
                &promises,
                BinaryOperation::And,
                8,
                &reg(RAX),
                8,
                &AsmOperand::Memory(crate::x86::Mem::base_offset(RCX, 0)),
            )
            .unwrap_err();
        assert!(matches!(err, CompileError::Unreachable(_)));
    }

    #[test]
    fn write_to_copies_code_and_patches() {
        let arena = Bump::new();
        let mut promises = Promises::new(&arena, 8);
        let mut asm = Assembler::new(Target::X86_64);

        let target = promises.code_promise();
        asm.apply_unary(
            &promises,
            UnaryOperation::Jump,
            8,
            &AsmOperand::Constant(ConstOperand::Promise(target)),
        )
        .unwrap();
        asm.apply(&promises, Operation::Return).unwrap();
        promises.bind_code(target, asm.length());

        let mut out = vec![0u8; asm.length() as usize];
        promises.finalize(0x4000, asm.length());
        asm.write_to(&mut out, 0x4000, &promises).unwrap();

        // jmp rel32 to the ret right after it: displacement 1
        assert_eq!(out[0], 0xe9);
        assert_eq!(&out[1..5], &1i32.to_le_bytes());
        assert_eq!(out[5], 0xc3);
    }
}
