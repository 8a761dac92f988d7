//! End-to-end codegen tests: build IR through the compiler, emit, write
//! out, and check the machine code by decoding it with iced-x86.

use bumpalo::Bump;
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use onepass::{pad, Compiler, Target};

fn decode(code: &[u8], base: u64) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, code, base, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        out.push(decoder.decode());
    }
    out
}

fn mnemonics(code: &[u8]) -> Vec<Mnemonic> {
    decode(code, 0x1000).iter().map(|i| i.mnemonic()).collect()
}

fn finish(c: &mut Compiler) -> Vec<u8> {
    let length = c.compile().unwrap();
    assert_eq!(length, c.length());
    let word = c.arch().word_size();
    let mut out = vec![0u8; (pad(length, word) + c.pool_size()) as usize];
    c.write_to(&mut out).unwrap();
    out
}

#[test]
fn constant_move_through_the_stack() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(1, 0);
    c.start_logical_ip(0);

    let answer = c.constant(42);
    c.push(8, answer).unwrap();
    let popped = c.pop(8).unwrap();
    assert_eq!(popped, answer);
    c.return_(8, Some(popped)).unwrap();

    let length = c.compile().unwrap();
    let code = c.code();
    assert_eq!(length as usize, code.len());

    // push rbp; mov rbp, rsp; mov rax, 42; mov rsp, rbp; pop rbp; ret
    let expected: Vec<u8> = [
        &[0x55u8][..],
        &[0x48, 0x89, 0xe5],
        &[0x48, 0xb8, 42, 0, 0, 0, 0, 0, 0, 0],
        &[0x48, 0x89, 0xec],
        &[0x5d],
        &[0xc3],
    ]
    .concat();
    assert_eq!(code, expected);
}

#[test]
fn add_two_constants() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(1, 0);
    c.start_logical_ip(0);

    let three = c.constant(3);
    let four = c.constant(4);
    let sum = c.add(8, three, four).unwrap();
    c.return_(8, Some(sum)).unwrap();

    let buf = finish(&mut c);
    let code = &buf[..c.length() as usize];

    let expected: Vec<u8> = [
        &[0x55u8][..],
        &[0x48, 0x89, 0xe5],
        // mov r15, 4
        &[0x49, 0xbf, 4, 0, 0, 0, 0, 0, 0, 0],
        // add r15, 3
        &[0x49, 0x83, 0xc7, 0x03],
        // mov rax, r15
        &[0x4c, 0x89, 0xf8],
        &[0x48, 0x89, 0xec],
        &[0x5d],
        &[0xc3],
    ]
    .concat();
    assert_eq!(code, expected);

    // rax carries 7 on entry to ret: decode and sanity-check the dataflow
    let instrs = decode(code, 0x1000);
    let add = instrs
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Add)
        .unwrap();
    assert_eq!(add.op0_register(), Register::R15);
    assert_eq!(add.immediate8() as i64, 3);
}

#[test]
fn conditional_branch_resolves_to_mark() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(3, 0);
    c.start_logical_ip(0);

    // return 1 when the stack argument at [rbp+16] is negative, else 0
    let less = c.label();
    let base = c.base();
    let slot = c.memory(base, 16, None, 1).unwrap();
    let argument = c.load(8, slot).unwrap();
    let zero = c.constant(0);
    c.cmp(8, zero, argument).unwrap();
    c.jl(less).unwrap();

    c.start_logical_ip(1);
    let result = c.constant(0);
    c.return_(8, Some(result)).unwrap();

    c.start_logical_ip(2);
    c.mark(less).unwrap();
    let result = c.constant(1);
    c.return_(8, Some(result)).unwrap();

    let buf = finish(&mut c);
    let code = &buf[..c.length() as usize];
    let base_ip = 0x7000u64;
    let instrs = decode(code, base_ip);

    let jl = instrs
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Jl)
        .unwrap();
    // the branch lands on the mov rax, 1 of the second return path
    let target_mov = instrs
        .iter()
        .find(|i| {
            i.mnemonic() == Mnemonic::Mov
                && i.op0_register() == Register::RAX
                && i.op1_kind() == OpKind::Immediate64
                && i.immediate64() == 1
        })
        .unwrap();
    assert_eq!(jl.near_branch64(), target_mov.ip());

    // both return paths restore the frame
    let rets = instrs
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Ret)
        .count();
    assert_eq!(rets, 2);
}

#[test]
fn call_through_the_constant_pool() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(1, 0);
    c.start_logical_ip(0);

    let target = 0x1122_3344i64;
    let slot = c.pool_append(target);
    let pointer = c.address(slot);
    let function = c.load(8, pointer).unwrap();
    let a = c.constant(7);
    let b = c.constant(9);
    let result = c
        .call(function, None, 0, false, 8, &[(8, a), (8, b)])
        .unwrap();
    c.return_(8, Some(result)).unwrap();

    let length = c.compile().unwrap();
    let word = c.arch().word_size();
    let mut buf = vec![0u8; (pad(length, word) + c.pool_size()) as usize];
    c.write_to(&mut buf).unwrap();

    // the pool holds the callee address, word-aligned after the code
    let pool_at = pad(length, 8) as usize;
    assert_eq!(c.pool_size(), 8);
    assert_eq!(
        i64::from_le_bytes(buf[pool_at..pool_at + 8].try_into().unwrap()),
        target
    );
    assert!(c.promises().is_resolved(slot));

    let base_ip = buf.as_ptr() as u64;
    let instrs = decode(&buf[..length as usize], base_ip);

    // the pool-slot address was patched into the loading move
    let pool_address = base_ip + pool_at as u64;
    let load_slot = instrs
        .iter()
        .find(|i| i.op1_kind() == OpKind::Immediate64 && i.immediate64() == pool_address);
    assert!(load_slot.is_some(), "no move of the pool slot address");

    // arguments flow through the convention registers
    let mov_imm = |reg, value: u64| {
        instrs.iter().any(|i| {
            i.mnemonic() == Mnemonic::Mov
                && i.op0_register() == reg
                && i.op1_kind() == OpKind::Immediate64
                && i.immediate64() == value
        })
    };
    assert!(mov_imm(Register::RDI, 7));
    assert!(mov_imm(Register::RSI, 9));
    assert!(instrs.iter().any(|i| i.mnemonic() == Mnemonic::Call));
}

#[test]
fn long_forward_branch() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(2, 0);
    c.start_logical_ip(0);

    let done = c.label();
    c.jmp(done).unwrap();

    // over a mebibyte of filler between the jump and its target
    let base = c.base();
    let slot = c.memory(base, -8, None, 1).unwrap();
    let filler = c.constant(0x0123_4567_89ab);
    for _ in 0..75_000 {
        c.store(8, filler, slot).unwrap();
    }

    c.start_logical_ip(1);
    c.mark(done).unwrap();
    let result = c.constant(5);
    c.return_(8, Some(result)).unwrap();

    let buf = finish(&mut c);
    let length = c.length() as usize;
    let code = &buf[..length];

    // 5-byte jmp rel32 right after the prologue
    assert_eq!(code[4], 0xe9);
    let displacement = i32::from_le_bytes(code[5..9].try_into().unwrap());
    assert!(displacement as i64 >= 1 << 20, "short filler: {displacement}");

    // the displacement lands on the marked return sequence:
    // mov rax, 5 (10 bytes); mov rsp, rbp; pop rbp; ret (5 bytes)
    let target = 9 + displacement as usize;
    assert_eq!(target, length - 15);
    assert_eq!(&code[target..target + 2], &[0x48, 0xb8]);
}

#[test]
fn junction_reconciles_both_paths() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(3, 0);

    // path A: two pushes, explicit jump to the join
    c.push_state();
    c.start_logical_ip(0);
    let a1 = c.constant(11);
    c.push(8, a1).unwrap();
    let a2 = c.constant(22);
    c.push(8, a2).unwrap();
    let join = c.machine_ip(2);
    let join_target = c.promise_constant(join);
    c.visit_logical_ip(2);
    c.jmp(join_target).unwrap();
    c.pop_state().unwrap();

    // path B: two pushes, falling through into the join
    c.push_state();
    c.start_logical_ip(1);
    let b1 = c.constant(33);
    c.push(8, b1).unwrap();
    let b2 = c.constant(44);
    c.push(8, b2).unwrap();

    c.start_logical_ip(2);
    let top = c.pop(8).unwrap();
    let bottom = c.pop(8).unwrap();
    assert_eq!(top, b2);
    assert_eq!(bottom, b1);
    c.return_(8, Some(bottom)).unwrap();
    c.pop_state().unwrap();

    let buf = finish(&mut c);
    let code = &buf[..c.length() as usize];
    let instrs = decode(code, 0x1000);

    // both edges materialize their two pending pushes before the join, so
    // the stack pointer agrees on arrival
    let jmp_at = instrs
        .iter()
        .position(|i| i.mnemonic() == Mnemonic::Jmp)
        .unwrap();
    let pushes_before = instrs[..jmp_at]
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Push && i.op0_kind() != OpKind::Register)
        .count();
    let pushes_after = instrs[jmp_at..]
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Push && i.op0_kind() != OpKind::Register)
        .count();
    assert_eq!(pushes_before, 2);
    assert_eq!(pushes_after, 2);

    // the join pops its operands back into registers
    let pops = instrs
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Pop && i.op0_register() != Register::RBP)
        .count();
    assert_eq!(pops, 2);

    // the jump resolves to the join's first instruction
    let jmp = &instrs[jmp_at];
    let join_ip = jmp.near_branch64();
    assert!(instrs.iter().any(|i| i.ip() == join_ip));
}

#[test]
fn division_pins_rax_and_rdx() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(1, 0);
    c.start_logical_ip(0);

    let divisor = c.constant(3);
    let dividend = c.constant(12);
    let quotient = c.div(8, divisor, dividend).unwrap();
    c.return_(8, Some(quotient)).unwrap();

    let buf = finish(&mut c);
    let instrs = decode(&buf[..c.length() as usize], 0x1000);

    assert!(instrs.iter().any(|i| i.mnemonic() == Mnemonic::Cqo));
    let idiv = instrs
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Idiv)
        .unwrap();
    assert_ne!(idiv.op0_register(), Register::RAX);
    assert_ne!(idiv.op0_register(), Register::RDX);

    // the dividend is loaded into rax before the division
    assert!(instrs.iter().any(|i| {
        i.mnemonic() == Mnemonic::Mov
            && i.op0_register() == Register::RAX
            && i.op1_kind() == OpKind::Immediate64
            && i.immediate64() == 12
    }));
}

#[test]
fn shift_count_lives_in_rcx() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(1, 0);
    c.start_logical_ip(0);

    let count = c.constant(2);
    let value = c.constant(5);
    let shifted = c.shl(8, count, value).unwrap();
    c.return_(8, Some(shifted)).unwrap();

    let buf = finish(&mut c);
    let instrs = decode(&buf[..c.length() as usize], 0x1000);

    let shl = instrs
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Shl)
        .unwrap();
    assert_eq!(shl.op1_register(), Register::CL);
    assert!(instrs.iter().any(|i| {
        i.mnemonic() == Mnemonic::Mov
            && i.op0_register() == Register::RCX
            && i.op1_kind() == OpKind::Immediate64
            && i.immediate64() == 2
    }));
}

#[test]
fn widening_and_zero_extending_loads() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(1, 0);
    c.start_logical_ip(0);

    let base = c.base();
    let slot = c.memory(base, -16, None, 1).unwrap();
    let narrow = c.loadz(2, slot).unwrap();
    let wide = c.load4_to_8(narrow).unwrap();
    c.return_(8, Some(wide)).unwrap();

    let buf = finish(&mut c);
    let kinds = mnemonics(&buf[..c.length() as usize]);
    assert!(kinds.contains(&Mnemonic::Movzx));
    assert!(kinds.contains(&Mnemonic::Movsxd));
}

#[test]
fn negate_works_in_place() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(1, 0);
    c.start_logical_ip(0);

    let seven = c.constant(7);
    let negated = c.neg(8, seven).unwrap();
    c.return_(8, Some(negated)).unwrap();

    let buf = finish(&mut c);
    let instrs = decode(&buf[..c.length() as usize], 0x1000);
    let neg = instrs
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Neg)
        .unwrap();
    // the negation register is forwarded straight to the return move
    let ret_mov = instrs
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Mov && i.op0_register() == Register::RAX)
        .unwrap();
    assert_eq!(ret_mov.op1_register(), neg.op0_register());
}

#[test]
fn entry_stack_values_pop_and_discard() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(1, 0);
    c.start_logical_ip(0);

    c.pushed(2);
    let top = c.pop(8).unwrap();
    c.popped(1).unwrap();
    c.return_(8, Some(top)).unwrap();

    let buf = finish(&mut c);
    let instrs = decode(&buf[..c.length() as usize], 0x1000);

    // the materialized top value pops into a register, the remaining word
    // is discarded by bumping rsp
    assert!(instrs
        .iter()
        .any(|i| i.mnemonic() == Mnemonic::Pop && i.op0_register() != Register::RBP));
    assert!(instrs
        .iter()
        .any(|i| i.mnemonic() == Mnemonic::Add && i.op0_register() == Register::RSP));
}

#[test]
fn trace_hook_sees_the_call_site() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    let sites: Rc<RefCell<Vec<onepass::PromiseId>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = sites.clone();
    c.set_trace_hook(Box::new(move |p| sink.borrow_mut().push(p)));

    c.init(2, 0);
    c.start_logical_ip(0);
    let helper = c.label();
    let r = c.call(helper, None, 0, true, 8, &[]).unwrap();
    c.return_(8, Some(r)).unwrap();

    c.start_logical_ip(1);
    c.mark(helper).unwrap();
    let v = c.constant(0);
    c.return_(8, Some(v)).unwrap();

    let buf = finish(&mut c);
    let recorded = sites.borrow();
    assert_eq!(recorded.len(), 1);

    // the promise resolves to the return address of the call
    let value = c.promises().value(recorded[0]).unwrap();
    let base = buf.as_ptr() as i64;
    let offset = (value - base) as usize;
    let instrs = decode(&buf[..c.length() as usize], buf.as_ptr() as u64);
    let call = instrs
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Call)
        .unwrap();
    assert_eq!(offset as u64, call.ip() + call.len() as u64 - buf.as_ptr() as u64);
}

#[test]
fn write_to_is_idempotent() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86_64);
    c.init(2, 0);
    c.start_logical_ip(0);

    let done = c.label();
    c.jmp(done).unwrap();
    c.start_logical_ip(1);
    c.mark(done).unwrap();
    let v = c.constant(3);
    c.return_(8, Some(v)).unwrap();

    let length = c.compile().unwrap();
    let size = (pad(length, 8) + c.pool_size()) as usize;
    let mut first = vec![0u8; size];
    c.write_to(&mut first).unwrap();
    let mut second = first.clone();
    c.write_to(&mut second).unwrap();
    assert_eq!(first, second);
}

#[test]
fn x86_target_uses_register_pairs() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86);
    c.init(1, 0);
    c.start_logical_ip(0);

    let wide = c.constant(0x1_0000_0002);
    c.push(8, wide).unwrap();
    let popped = c.pop(8).unwrap();
    c.return_(8, Some(popped)).unwrap();

    let length = c.compile().unwrap();
    let code = c.code().to_vec();
    assert_eq!(length as usize, code.len());

    let mut decoder = Decoder::with_ip(32, &code, 0x1000, DecoderOptions::NONE);
    let mut instrs = Vec::new();
    while decoder.can_decode() {
        instrs.push(decoder.decode());
    }

    // the 64-bit constant is split into eax:edx
    assert!(instrs.iter().any(|i| {
        i.mnemonic() == Mnemonic::Mov
            && i.op0_register() == Register::EAX
            && i.op1_kind() == OpKind::Immediate32
            && i.immediate32() == 2
    }));
    assert!(instrs.iter().any(|i| {
        i.mnemonic() == Mnemonic::Mov
            && i.op0_register() == Register::EDX
            && i.op1_kind() == OpKind::Immediate32
            && i.immediate32() == 1
    }));
    // no REX prefixes anywhere: every instruction decodes in 32-bit mode
    assert!(instrs.iter().all(|i| !i.is_invalid()));
}

#[test]
fn byte_operands_stay_in_low_registers_on_x86() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86);
    c.init(1, 0);
    c.start_logical_ip(0);

    let base = c.base();
    let slot = c.memory(base, -4, None, 1).unwrap();
    let byte = c.loadz(1, slot).unwrap();
    c.store(1, byte, slot).unwrap();
    c.return_(4, Some(byte)).unwrap();

    let length = c.compile().unwrap();
    let code = c.code().to_vec();
    assert_eq!(length as usize, code.len());

    let mut decoder = Decoder::with_ip(32, &code, 0x1000, DecoderOptions::NONE);
    let mut instrs = Vec::new();
    while decoder.can_decode() {
        instrs.push(decoder.decode());
    }
    assert!(instrs.iter().all(|i| !i.is_invalid()));

    // the byte store sources a byte-addressable register, regardless of
    // where the allocator put the loaded value first
    let store = instrs
        .iter()
        .find(|i| {
            i.mnemonic() == Mnemonic::Mov
                && i.op0_kind() == OpKind::Memory
                && i.op1_kind() == OpKind::Register
        })
        .unwrap();
    assert!(matches!(
        store.op1_register(),
        Register::AL | Register::CL | Register::DL | Register::BL
    ));
}

#[test]
fn wide_division_is_rejected_on_x86() {
    let arena = Bump::new();
    let mut c = Compiler::new(&arena, Target::X86);
    c.init(1, 0);
    c.start_logical_ip(0);

    let a = c.constant(3);
    let b = c.constant(12);
    assert!(matches!(
        c.div(8, a, b),
        Err(onepass::CompileError::UnsupportedOperation { .. })
    ));
}
