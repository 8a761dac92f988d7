//! The compiler front-end: operand constructors and the event-append API.
//!
//! Clients build operands (constants, addresses, memory references,
//! labels), append operations against them in logical-IP order, then run
//! `compile` and `write_to` (see `emit`). Nothing is encoded while
//! appending; every operation only records an event with its read and
//! write intentions, so the allocator can thread liveness through the
//! whole graph before a single byte is emitted.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::x86::{
    Architecture, Assembler, BinaryOperation, PlanOperand, PlanResult, RegPair, Target,
    UnaryOperation,
};

use super::error::{CompileError, CompileResult};
use super::event::{ArgRange, Event, EventId, EventKind, LogicalInstruction};
use super::promise::{PromiseId, Promises};
use super::registers::Registers;
use super::stack::{StackId, StackNode, State, StateId};
use super::value::{
    Operand, Read, ReadId, ReadTarget, Site, SiteId, SiteKind, Value, ValueId, Write, WriteId,
    WriteTarget,
};

/// Call flag: the call site must stay patchable in place.
pub const CALL_ALIGNED: u32 = 1 << 0;

/// Hook invoked with a code promise for each traced call site.
pub type TraceHook<'a> = Box<dyn FnMut(PromiseId) + 'a>;

/// The one-pass compiler: accumulates events against an abstract operand
/// model, then lowers them through the assembler.
pub struct Compiler<'a> {
    pub(crate) arena: &'a Bump,
    pub(crate) asm: Assembler,
    pub(crate) promises: Promises<'a>,
    pub(crate) values: BumpVec<'a, Value>,
    pub(crate) sites: BumpVec<'a, Site>,
    pub(crate) reads: BumpVec<'a, Read>,
    pub(crate) writes: BumpVec<'a, Write>,
    pub(crate) stacks: BumpVec<'a, StackNode>,
    pub(crate) states: BumpVec<'a, State>,
    pub(crate) events: BumpVec<'a, Event>,
    pub(crate) call_args: BumpVec<'a, (u32, ValueId)>,
    pub(crate) logical_code: BumpVec<'a, LogicalInstruction>,
    pub(crate) junctions: BumpVec<'a, u32>,
    pub(crate) pool: BumpVec<'a, PromiseId>,
    pub(crate) entry_promises: BumpVec<'a, PromiseId>,
    pub(crate) registers: Registers,
    pub(crate) state: StateId,
    pub(crate) logical_ip: Option<u32>,
    pub(crate) stack_offset: u32,
    pub(crate) trace_hook: Option<TraceHook<'a>>,
    pub(crate) compiled: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(arena: &'a Bump, target: Target) -> Self {
        let asm = Assembler::new(target);
        let arch = *asm.arch();
        let mut registers = Registers::new(arch.register_count());
        for i in 0..arch.register_count() {
            let reg = crate::x86::Reg(i as u8);
            if arch.reserved(reg) {
                registers.reserve(reg);
            }
        }
        let word = arch.word_size();
        let mut states = BumpVec::new_in(arena);
        states.push(State {
            stack: None,
            next: None,
        });
        Self {
            arena,
            asm,
            promises: Promises::new(arena, word),
            values: BumpVec::new_in(arena),
            sites: BumpVec::new_in(arena),
            reads: BumpVec::new_in(arena),
            writes: BumpVec::new_in(arena),
            stacks: BumpVec::new_in(arena),
            states,
            events: BumpVec::new_in(arena),
            call_args: BumpVec::new_in(arena),
            logical_code: BumpVec::new_in(arena),
            junctions: BumpVec::new_in(arena),
            pool: BumpVec::new_in(arena),
            entry_promises: BumpVec::new_in(arena),
            registers,
            state: StateId(0),
            logical_ip: None,
            stack_offset: 0,
            trace_hook: None,
            compiled: false,
        }
    }

    /// Size the logical code array and record the frame footprint in
    /// words. Must be called before any operation is appended.
    pub fn init(&mut self, logical_code_length: u32, stack_offset: u32) {
        self.logical_code.clear();
        self.logical_code.extend(
            std::iter::repeat(LogicalInstruction::default()).take(logical_code_length as usize),
        );
        self.promises.init_logical(logical_code_length);
        self.stack_offset = stack_offset;
    }

    pub fn arch(&self) -> &Architecture {
        self.asm.arch()
    }

    pub fn arena(&self) -> &'a Bump {
        self.arena
    }

    pub fn promises(&self) -> &Promises<'a> {
        &self.promises
    }

    /// Machine offset a logical IP resolved to, once emission reached it.
    pub fn machine_offset(&self, logical_ip: u32) -> Option<u32> {
        self.logical_code[logical_ip as usize].machine_offset
    }

    pub fn set_trace_hook(&mut self, hook: TraceHook<'a>) {
        self.trace_hook = Some(hook);
    }

    pub(crate) fn word(&self) -> u32 {
        self.asm.arch().word_size()
    }

    // -- arena accessors ---------------------------------------------------

    pub(crate) fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    pub(crate) fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0 as usize]
    }

    pub(crate) fn site(&self, id: SiteId) -> &Site {
        &self.sites[id.0 as usize]
    }

    pub(crate) fn site_mut(&mut self, id: SiteId) -> &mut Site {
        &mut self.sites[id.0 as usize]
    }

    pub(crate) fn read(&self, id: ReadId) -> &Read {
        &self.reads[id.0 as usize]
    }

    pub(crate) fn write(&self, id: WriteId) -> &Write {
        &self.writes[id.0 as usize]
    }

    pub(crate) fn stack_node(&self, id: StackId) -> &StackNode {
        &self.stacks[id.0 as usize]
    }

    pub(crate) fn stack_node_mut(&mut self, id: StackId) -> &mut StackNode {
        &mut self.stacks[id.0 as usize]
    }

    pub(crate) fn event(&self, id: EventId) -> &Event {
        &self.events[id.0 as usize]
    }

    pub(crate) fn new_value(&mut self) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value::default());
        id
    }

    pub(crate) fn new_site(&mut self, kind: SiteKind) -> SiteId {
        let id = SiteId(self.sites.len() as u32);
        self.sites.push(Site { kind, next: None });
        id
    }

    fn new_stack_node(&mut self, node: StackNode) -> StackId {
        let id = StackId(self.stacks.len() as u32);
        self.stacks.push(node);
        id
    }

    fn new_state(&mut self, state: State) -> StateId {
        let id = StateId(self.states.len() as u32);
        self.states.push(state);
        id
    }

    /// Link a site to a value without acquiring anything (fresh operands
    /// and pre-reserved registers).
    pub(crate) fn link_site(&mut self, value: ValueId, site: SiteId) {
        let head = self.value(value).sites;
        self.site_mut(site).next = head;
        self.value_mut(value).sites = Some(site);
    }

    fn value_with_site(&mut self, kind: SiteKind) -> ValueId {
        let site = self.new_site(kind);
        let value = self.new_value();
        self.link_site(value, site);
        value
    }

    pub(crate) fn current_stack(&self) -> Option<StackId> {
        self.states[self.state.0 as usize].stack
    }

    fn set_current_stack(&mut self, stack: Option<StackId>) {
        self.states[self.state.0 as usize].stack = stack;
    }

    fn last_event_id(&self) -> Option<EventId> {
        (!self.events.is_empty()).then(|| EventId(self.events.len() as u32 - 1))
    }

    // -- operand constructors ----------------------------------------------

    pub fn resolved_promise(&mut self, value: i64) -> PromiseId {
        self.promises.resolved_promise(value)
    }

    pub fn constant(&mut self, value: i64) -> Operand {
        let p = self.promises.resolved_promise(value);
        Operand(self.value_with_site(SiteKind::Constant(p)))
    }

    pub fn promise_constant(&mut self, promise: PromiseId) -> Operand {
        Operand(self.value_with_site(SiteKind::Constant(promise)))
    }

    pub fn address(&mut self, promise: PromiseId) -> Operand {
        Operand(self.value_with_site(SiteKind::Address(promise)))
    }

    /// A label whose position is bound later by `mark`.
    pub fn label(&mut self) -> Operand {
        let p = self.promises.code_promise();
        Operand(self.value_with_site(SiteKind::Constant(p)))
    }

    pub fn stack(&mut self) -> Operand {
        let reg = self.arch().stack();
        Operand(self.value_with_site(SiteKind::Register(RegPair::single(reg))))
    }

    pub fn base(&mut self) -> Operand {
        let reg = self.arch().base();
        Operand(self.value_with_site(SiteKind::Register(RegPair::single(reg))))
    }

    pub fn thread(&mut self) -> Operand {
        let reg = self.arch().thread();
        Operand(self.value_with_site(SiteKind::Register(RegPair::single(reg))))
    }

    /// A memory reference; base (and index) become live register reads at
    /// this point.
    pub fn memory(
        &mut self,
        base: Operand,
        displacement: i32,
        index: Option<Operand>,
        scale: u8,
    ) -> CompileResult<Operand> {
        let result = self.new_value();
        let event = self.append_event(EventKind::Memory {
            base: base.0,
            index: index.map(|o| o.0),
            result,
            displacement,
            scale,
        })?;
        let word = self.word();
        self.add_read(event, base.0, word, ReadTarget::AnyRegister(0));
        if let Some(index) = index {
            self.add_read(event, index.0, word, ReadTarget::AnyRegister(0));
        }
        Ok(Operand(result))
    }

    pub fn is_constant(&self, operand: Operand) -> bool {
        match self.value(operand.0).sites {
            Some(s) => {
                matches!(self.site(s).kind, SiteKind::Constant(_)) && self.site(s).next.is_none()
            }
            None => false,
        }
    }

    pub fn constant_value(&self, operand: Operand) -> CompileResult<i64> {
        let mut s = self.value(operand.0).sites;
        while let Some(id) = s {
            if let SiteKind::Constant(p) = self.site(id).kind {
                return self.promises.value(p);
            }
            s = self.site(id).next;
        }
        Err(CompileError::Unreachable("operand is not a constant"))
    }

    // -- logical instructions and junctions --------------------------------

    /// Declare `logical_ip` as a branch target; the first visit records a
    /// junction.
    pub fn visit_logical_ip(&mut self, logical_ip: u32) {
        let li = &mut self.logical_code[logical_ip as usize];
        li.visits += 1;
        if li.visits == 1 {
            self.junctions.push(logical_ip);
        }
    }

    /// Begin appending events for `logical_ip`.
    pub fn start_logical_ip(&mut self, logical_ip: u32) {
        if let Some(current) = self.logical_ip {
            let last = self.last_event_id();
            let li = &mut self.logical_code[current as usize];
            if li.first_event.is_some() {
                li.last_event = last;
            }
            self.logical_code[logical_ip as usize].predecessor = Some(current);
        }
        self.logical_ip = Some(logical_ip);
    }

    /// A promise for the machine offset `logical_ip` ends up at.
    pub fn machine_ip(&mut self, logical_ip: u32) -> PromiseId {
        self.promises.ip_promise(logical_ip)
    }

    // -- constant pool ------------------------------------------------------

    pub fn pool_append(&mut self, value: i64) -> PromiseId {
        let p = self.promises.resolved_promise(value);
        self.pool_append_promise(p)
    }

    /// Append a word to the constant pool; the returned promise addresses
    /// the slot.
    pub fn pool_append_promise(&mut self, value: PromiseId) -> PromiseId {
        let key = self.pool.len() as u32;
        self.pool.push(value);
        self.promises.pool_promise(key)
    }

    // -- event plumbing -----------------------------------------------------

    pub(crate) fn append_event(&mut self, kind: EventKind) -> CompileResult<EventId> {
        let logical_ip = self
            .logical_ip
            .ok_or(CompileError::Unreachable("event outside logical instruction"))?;
        let id = EventId(self.events.len() as u32);
        self.events.push(Event {
            kind,
            logical_ip,
            stack: self.current_stack(),
            reads: None,
            last_read: None,
            writes: None,
            last_write: None,
            promises: None,
        });
        let li = &mut self.logical_code[logical_ip as usize];
        if li.first_event.is_none() {
            li.first_event = Some(id);
        }
        Ok(id)
    }

    pub(crate) fn add_read(&mut self, event: EventId, value: ValueId, size: u32, target: ReadTarget) {
        let id = ReadId(self.reads.len() as u32);
        self.reads.push(Read {
            size,
            value,
            target,
            next_for_value: None,
            next_in_event: None,
        });

        match self.events[event.0 as usize].last_read {
            Some(last) => self.reads[last.0 as usize].next_in_event = Some(id),
            None => self.events[event.0 as usize].reads = Some(id),
        }
        self.events[event.0 as usize].last_read = Some(id);

        match self.values[value.0 as usize].last_read {
            Some(last) => self.reads[last.0 as usize].next_for_value = Some(id),
            None => self.values[value.0 as usize].reads = Some(id),
        }
        self.values[value.0 as usize].last_read = Some(id);
    }

    pub(crate) fn add_write(
        &mut self,
        event: EventId,
        value: ValueId,
        size: u32,
        target: WriteTarget,
    ) {
        let id = WriteId(self.writes.len() as u32);
        self.writes.push(Write {
            size,
            value,
            target,
            next_in_event: None,
        });
        match self.events[event.0 as usize].last_write {
            Some(last) => self.writes[last.0 as usize].next_in_event = Some(id),
            None => self.events[event.0 as usize].writes = Some(id),
        }
        self.events[event.0 as usize].last_write = Some(id);
    }

    fn plan_read_target(&mut self, plan: PlanOperand) -> ReadTarget {
        match plan {
            PlanOperand::Any => ReadTarget::Any,
            PlanOperand::AnyRegister { exclude } => ReadTarget::AnyRegister(exclude),
            PlanOperand::Register(reg) => {
                ReadTarget::Site(self.new_site(SiteKind::Register(RegPair::single(reg))))
            }
        }
    }

    fn plan_write_target(&mut self, result: PlanResult, second: ValueId) -> WriteTarget {
        match result {
            PlanResult::None => WriteTarget::Free,
            PlanResult::SameAsSecond => WriteTarget::SameAs(second),
            PlanResult::Register(reg) => {
                WriteTarget::Site(self.new_site(SiteKind::Register(RegPair::single(reg))))
            }
            PlanResult::RegisterPair(low, high) => {
                WriteTarget::Site(self.new_site(SiteKind::Register(RegPair::pair(low, high))))
            }
        }
    }

    fn return_site(&mut self, size: u32) -> SiteId {
        let low = self.arch().return_low();
        let high = if size > self.word() {
            self.arch().return_high()
        } else {
            None
        };
        self.new_site(SiteKind::Register(RegPair { low, high }))
    }

    // -- the abstract stack -------------------------------------------------

    pub fn push(&mut self, size: u32, value: Operand) -> CompileResult<()> {
        let word = self.word();
        let words = size.div_ceil(word).max(1);
        let next = self.current_stack();
        let index = next.map_or(0, |n| self.stack_node(n).index + words);
        let frame = self.new_stack_node(StackNode {
            value: Some(value.0),
            size: words,
            index,
            next,
            pushed: false,
            push_event: None,
        });
        self.set_current_stack(Some(frame));
        let event = self.append_event(EventKind::Push { frame, mark: false })?;
        self.stack_node_mut(frame).push_event = Some(event);
        Ok(())
    }

    pub fn pop(&mut self, size: u32) -> CompileResult<Operand> {
        let word = self.word();
        let words = size.div_ceil(word).max(1);
        let top = self
            .current_stack()
            .ok_or(CompileError::Unreachable("pop on an empty stack"))?;
        let node = *self.stack_node(top);
        if node.size != words {
            return Err(CompileError::Unreachable("pop size mismatch"));
        }
        let value = node
            .value
            .ok_or(CompileError::Unreachable("pop of a reservation"))?;
        self.append_event(EventKind::Pop {
            frame: top,
            words,
            ignore: false,
        })?;
        self.set_current_stack(node.next);
        Ok(Operand(value))
    }

    /// Declare `count` word-sized values already materialized on the
    /// machine stack (method entry). Must precede any abstract push.
    pub fn pushed(&mut self, count: u32) {
        for _ in 0..count {
            let value = self.new_value();
            let next = self.current_stack();
            let index = next.map_or(0, |n| self.stack_node(n).index + 1);
            let frame = self.new_stack_node(StackNode {
                value: Some(value),
                size: 1,
                index,
                next,
                pushed: true,
                push_event: None,
            });
            let site = self.new_site(SiteKind::Stack(frame));
            self.link_site(value, site);
            self.set_current_stack(Some(frame));
        }
    }

    /// Discard `count` words from the abstract stack.
    pub fn popped(&mut self, count: u32) -> CompileResult<()> {
        let top = self
            .current_stack()
            .ok_or(CompileError::Unreachable("popped on an empty stack"))?;
        self.append_event(EventKind::Pop {
            frame: top,
            words: count,
            ignore: true,
        })?;
        let mut remaining = count;
        while remaining > 0 {
            let s = self
                .current_stack()
                .ok_or(CompileError::Unreachable("popped past the stack bottom"))?;
            let node = *self.stack_node(s);
            if node.size > remaining {
                return Err(CompileError::Unreachable("popped splits a frame"));
            }
            remaining -= node.size;
            self.set_current_stack(node.next);
        }
        Ok(())
    }

    /// Address a value `index` words below the stack top without popping
    /// it.
    pub fn peek(&self, size: u32, index: u32) -> CompileResult<Operand> {
        let word = self.word();
        let mut s = self
            .current_stack()
            .ok_or(CompileError::Unreachable("peek on an empty stack"))?;
        let mut i = index;
        while i > 0 {
            s = self
                .stack_node(s)
                .next
                .ok_or(CompileError::Unreachable("peek past the stack bottom"))?;
            i = i.saturating_sub(self.stack_node(s).size);
        }
        let node = self.stack_node(s);
        if node.size != size.div_ceil(word).max(1) {
            return Err(CompileError::Unreachable("peek size mismatch"));
        }
        node.value
            .map(Operand)
            .ok_or(CompileError::Unreachable("peek of a reservation"))
    }

    // -- moves --------------------------------------------------------------

    fn append_move(
        &mut self,
        op: BinaryOperation,
        size: u32,
        src: ValueId,
        dst: ValueId,
        read_size: u32,
        write_size: u32,
    ) -> CompileResult<()> {
        let plan = self.arch().plan_binary(op, read_size);
        if plan.thunk {
            return Err(CompileError::UnsupportedOperation {
                operation: "move",
                size: read_size,
            });
        }
        let event = self.append_event(EventKind::Move { op, size, src, dst })?;
        let read_target = self.plan_read_target(plan.first);
        self.add_read(event, src, read_size, read_target);
        let write_target = self.plan_write_target(plan.result, src);
        self.add_write(event, dst, write_size, write_target);
        Ok(())
    }

    pub fn store(&mut self, size: u32, src: Operand, dst: Operand) -> CompileResult<()> {
        self.append_move(BinaryOperation::Move, size, src.0, dst.0, size, size)
    }

    /// Sign-extending load into a fresh operand.
    pub fn load(&mut self, size: u32, src: Operand) -> CompileResult<Operand> {
        let dst = self.new_value();
        self.append_move(BinaryOperation::Move, size, src.0, dst, size, size)?;
        Ok(Operand(dst))
    }

    /// Zero-extending load into a fresh operand.
    pub fn loadz(&mut self, size: u32, src: Operand) -> CompileResult<Operand> {
        let dst = self.new_value();
        let word = self.word();
        self.append_move(BinaryOperation::MoveZ, size, src.0, dst, size, word)?;
        Ok(Operand(dst))
    }

    /// Widen a 32-bit value to 64 bits with sign extension.
    pub fn load4_to_8(&mut self, src: Operand) -> CompileResult<Operand> {
        let dst = self.new_value();
        self.append_move(BinaryOperation::Move4To8, 8, src.0, dst, 4, 8)?;
        Ok(Operand(dst))
    }

    /// Copy of an operand into a fresh value.
    pub fn dup(&mut self, size: u32, src: Operand) -> CompileResult<Operand> {
        self.load(size, src)
    }

    // -- arithmetic ---------------------------------------------------------

    fn combine(
        &mut self,
        op: BinaryOperation,
        name: &'static str,
        size: u32,
        a: Operand,
        b: Operand,
    ) -> CompileResult<Operand> {
        let plan = self.arch().plan_binary(op, size);
        if plan.thunk {
            return Err(CompileError::UnsupportedOperation {
                operation: name,
                size,
            });
        }
        let result = self.new_value();
        let event = self.append_event(EventKind::Combine {
            op,
            size,
            first: a.0,
            second: b.0,
            result,
            clobbers: plan.clobbers,
        })?;
        let first_target = self.plan_read_target(plan.first);
        self.add_read(event, a.0, size, first_target);
        let second_target = self.plan_read_target(plan.second);
        self.add_read(event, b.0, size, second_target);
        let write_target = self.plan_write_target(plan.result, b.0);
        self.add_write(event, result, size, write_target);
        Ok(Operand(result))
    }

    /// `b + a`.
    pub fn add(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::Add, "add", size, a, b)
    }

    /// `b - a`.
    pub fn sub(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::Subtract, "subtract", size, a, b)
    }

    pub fn mul(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::Multiply, "multiply", size, a, b)
    }

    /// `b / a`.
    pub fn div(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::Divide, "divide", size, a, b)
    }

    /// `b % a`.
    pub fn rem(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::Remainder, "remainder", size, a, b)
    }

    pub fn and(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::And, "and", size, a, b)
    }

    pub fn or(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::Or, "or", size, a, b)
    }

    pub fn xor(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::Xor, "xor", size, a, b)
    }

    /// `b << a`.
    pub fn shl(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::ShiftLeft, "shift-left", size, a, b)
    }

    /// `b >> a`, arithmetic.
    pub fn shr(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(BinaryOperation::ShiftRight, "shift-right", size, a, b)
    }

    /// `b >>> a`, logical.
    pub fn ushr(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<Operand> {
        self.combine(
            BinaryOperation::UnsignedShiftRight,
            "unsigned-shift-right",
            size,
            a,
            b,
        )
    }

    pub fn neg(&mut self, size: u32, a: Operand) -> CompileResult<Operand> {
        let plan = self.arch().plan_unary(UnaryOperation::Negate, size);
        if plan.thunk {
            return Err(CompileError::UnsupportedOperation {
                operation: "negate",
                size,
            });
        }
        let result = self.new_value();
        let event = self.append_event(EventKind::Translate {
            op: UnaryOperation::Negate,
            size,
            value: a.0,
            result,
        })?;
        let target = self.plan_read_target(plan.operand);
        self.add_read(event, a.0, size, target);
        self.add_write(event, result, size, WriteTarget::SameAs(a.0));
        Ok(Operand(result))
    }

    // -- compare and branch --------------------------------------------------

    /// Set flags for `b - a`; the following conditional branch tests them.
    pub fn cmp(&mut self, size: u32, a: Operand, b: Operand) -> CompileResult<()> {
        let plan = self.arch().plan_binary(BinaryOperation::Compare, size);
        if plan.thunk {
            return Err(CompileError::UnsupportedOperation {
                operation: "compare",
                size,
            });
        }
        let event = self.append_event(EventKind::Compare {
            size,
            first: a.0,
            second: b.0,
        })?;
        let first_target = self.plan_read_target(plan.first);
        self.add_read(event, a.0, size, first_target);
        let second_target = self.plan_read_target(plan.second);
        self.add_read(event, b.0, size, second_target);
        Ok(())
    }

    fn branch(&mut self, op: UnaryOperation, address: Operand) -> CompileResult<()> {
        self.mark_stack(self.current_stack());
        let event = self.append_event(EventKind::Branch {
            op,
            address: address.0,
        })?;
        let word = self.word();
        self.add_read(event, address.0, word, ReadTarget::Any);
        Ok(())
    }

    pub fn jl(&mut self, address: Operand) -> CompileResult<()> {
        self.branch(UnaryOperation::JumpIfLess, address)
    }

    pub fn jg(&mut self, address: Operand) -> CompileResult<()> {
        self.branch(UnaryOperation::JumpIfGreater, address)
    }

    pub fn jle(&mut self, address: Operand) -> CompileResult<()> {
        self.branch(UnaryOperation::JumpIfLessOrEqual, address)
    }

    pub fn jge(&mut self, address: Operand) -> CompileResult<()> {
        self.branch(UnaryOperation::JumpIfGreaterOrEqual, address)
    }

    pub fn je(&mut self, address: Operand) -> CompileResult<()> {
        self.branch(UnaryOperation::JumpIfEqual, address)
    }

    pub fn jne(&mut self, address: Operand) -> CompileResult<()> {
        self.branch(UnaryOperation::JumpIfNotEqual, address)
    }

    pub fn jmp(&mut self, address: Operand) -> CompileResult<()> {
        self.branch(UnaryOperation::Jump, address)
    }

    // -- calls and returns ---------------------------------------------------

    /// Append a call. The first `argument_register_count` argument words
    /// are pre-targeted to argument registers; the rest go to the machine
    /// stack at the call site. Returns the operand holding the result
    /// register (meaningful when `result_size > 0`).
    pub fn call(
        &mut self,
        address: Operand,
        indirection: Option<i64>,
        flags: u32,
        trace: bool,
        result_size: u32,
        arguments: &[(u32, Operand)],
    ) -> CompileResult<Operand> {
        self.mark_stack(self.current_stack());
        let word = self.word();
        let arg_registers = self.arch().argument_register_count();
        let start = self.call_args.len() as u32;
        let result = self.new_value();

        let event = self.append_event(EventKind::Call {
            address: address.0,
            indirection,
            aligned: flags & CALL_ALIGNED != 0,
            trace,
            result: (result_size > 0).then_some(result),
            args: ArgRange {
                start,
                len: arguments.len() as u32,
            },
        })?;

        let address_target = if indirection.is_some() {
            let low = self.arch().return_low();
            ReadTarget::Site(self.new_site(SiteKind::Register(RegPair::single(low))))
        } else {
            ReadTarget::Any
        };
        self.add_read(event, address.0, word, address_target);

        let mut footprint = 0u32;
        for &(size, argument) in arguments {
            let words = size.div_ceil(word).max(1);
            let target = if footprint < arg_registers {
                let reg = self.arch().argument_register(footprint)?;
                ReadTarget::Site(self.new_site(SiteKind::Register(RegPair::single(reg))))
            } else {
                ReadTarget::AnyRegister(0)
            };
            self.add_read(event, argument.0, size, target);
            self.call_args.push((size, argument.0));
            footprint += words;
        }

        if result_size > 0 {
            let site = self.return_site(result_size);
            self.add_write(event, result, result_size, WriteTarget::Site(site));
        }
        Ok(Operand(result))
    }

    pub fn return_(&mut self, size: u32, value: Option<Operand>) -> CompileResult<()> {
        let event = self.append_event(EventKind::Return {
            size,
            value: value.map(|o| o.0),
        })?;
        if let Some(value) = value {
            let site = self.return_site(size);
            self.add_read(event, value.0, size, ReadTarget::Site(site));
        }
        Ok(())
    }

    // -- labels and states ---------------------------------------------------

    /// Bind a label to the current code position and force the abstract
    /// stack to materialize across it.
    pub fn mark(&mut self, label: Operand) -> CompileResult<()> {
        self.mark_stack(self.current_stack());

        let mut s = self.value(label.0).sites;
        let mut promise = None;
        while let Some(id) = s {
            if let SiteKind::Constant(p) = self.site(id).kind {
                promise = Some(p);
                break;
            }
            s = self.site(id).next;
        }
        let promise = promise.ok_or(CompileError::Unreachable("mark target is not a label"))?;

        if let Some(event) = self.last_event_id() {
            let head = self.event(event).promises;
            if !self.promises.chain_code(promise, head) {
                return Err(CompileError::Unreachable("mark target is not a label"));
            }
            self.events[event.0 as usize].promises = Some(promise);
        } else {
            if !self.promises.chain_code(promise, None) {
                return Err(CompileError::Unreachable("mark target is not a label"));
            }
            self.entry_promises.push(promise);
        }
        Ok(())
    }

    /// Scope the abstract stack; a later `pop_state` restores it.
    pub fn push_state(&mut self) {
        let current = self.states[self.state.0 as usize];
        let saved = self.state;
        self.state = self.new_state(State {
            stack: current.stack,
            next: Some(saved),
        });
    }

    pub fn pop_state(&mut self) -> CompileResult<()> {
        let current = self.states[self.state.0 as usize];
        let saved_id = current
            .next
            .ok_or(CompileError::Unreachable("pop_state without push_state"))?;
        let saved = self.states[saved_id.0 as usize];
        self.state = self.new_state(State {
            stack: saved.stack,
            next: saved.next,
        });
        Ok(())
    }

    /// Flag every pending push below `stack` for materialization.
    pub(crate) fn mark_stack(&mut self, stack: Option<StackId>) {
        let mut cursor = stack;
        while let Some(frame) = cursor {
            let node = *self.stack_node(frame);
            if let Some(event) = node.push_event {
                if let EventKind::Push { mark, .. } = &mut self.events[event.0 as usize].kind {
                    *mark = true;
                }
            }
            cursor = node.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn compiler(arena: &Bump) -> Compiler<'_> {
        let mut c = Compiler::new(arena, Target::X86_64);
        c.init(4, 0);
        c.start_logical_ip(0);
        c
    }

    #[test]
    fn push_pop_returns_the_same_operand() {
        let arena = Bump::new();
        let mut c = compiler(&arena);
        let v = c.constant(9);
        c.push(8, v).unwrap();
        assert_eq!(c.pop(8).unwrap(), v);
    }

    #[test]
    fn pop_checks_the_frame_size() {
        let arena = Bump::new();
        let mut c = compiler(&arena);
        let v = c.constant(9);
        c.push(8, v).unwrap();
        assert!(c.pop(1).is_ok()); // both round up to one word
        assert!(c.pop(8).is_err()); // now the stack is empty
    }

    #[test]
    fn constants_are_recognized() {
        let arena = Bump::new();
        let mut c = compiler(&arena);
        let v = c.constant(17);
        assert!(c.is_constant(v));
        assert_eq!(c.constant_value(v).unwrap(), 17);

        let l = c.label();
        assert!(c.is_constant(l));
        assert!(matches!(
            c.constant_value(l),
            Err(CompileError::NotResolved)
        ));

        let m = c.memory(l, 0, None, 1).unwrap();
        assert!(!c.is_constant(m));
    }

    #[test]
    fn peek_addresses_values_below_the_top() {
        let arena = Bump::new();
        let mut c = compiler(&arena);
        let bottom = c.constant(1);
        let top = c.constant(2);
        c.push(8, bottom).unwrap();
        c.push(8, top).unwrap();

        assert_eq!(c.peek(8, 0).unwrap(), top);
        assert_eq!(c.peek(8, 1).unwrap(), bottom);
        assert!(c.peek(8, 2).is_err());
    }

    #[test]
    fn stack_frames_accumulate_word_depth() {
        let arena = Bump::new();
        let mut c = compiler(&arena);
        let a = c.constant(1);
        let b = c.constant(2);
        c.push(8, a).unwrap();
        c.push(8, b).unwrap();

        let top = c.current_stack().unwrap();
        assert_eq!(c.stack_node(top).index, 1);
        let below = c.stack_node(top).next.unwrap();
        assert_eq!(c.stack_node(below).index, 0);
    }

    #[test]
    fn states_scope_the_stack() {
        let arena = Bump::new();
        let mut c = compiler(&arena);
        let a = c.constant(1);
        c.push(8, a).unwrap();

        c.push_state();
        let b = c.constant(2);
        c.push(8, b).unwrap();
        c.push(8, b).unwrap();
        c.pop_state().unwrap();

        // back to a single frame holding `a`
        assert_eq!(c.pop(8).unwrap(), a);
        assert!(c.current_stack().is_none());
        assert!(c.pop_state().is_err());
    }

    #[test]
    fn nested_states_restore_in_order() {
        let arena = Bump::new();
        let mut c = compiler(&arena);
        let a = c.constant(1);
        c.push_state();
        c.push(8, a).unwrap();
        c.push_state();
        c.push(8, a).unwrap();
        c.pop_state().unwrap();
        assert_eq!(c.peek(8, 0).unwrap(), a);
        c.pop_state().unwrap();
        assert!(c.current_stack().is_none());
    }

    #[test]
    fn events_require_a_logical_ip() {
        let arena = Bump::new();
        let mut c = Compiler::new(&arena, Target::X86_64);
        c.init(1, 0);
        let v = c.constant(3);
        assert!(matches!(
            c.push(8, v),
            Err(CompileError::Unreachable(_))
        ));
    }

    #[test]
    fn first_visit_records_a_junction() {
        let arena = Bump::new();
        let mut c = compiler(&arena);
        c.visit_logical_ip(2);
        c.visit_logical_ip(2);
        assert_eq!(c.junctions.len(), 1);
        assert_eq!(c.logical_code[2].visits, 2);
    }

    #[test]
    fn branches_mark_pending_pushes() {
        let arena = Bump::new();
        let mut c = compiler(&arena);
        let v = c.constant(5);
        c.push(8, v).unwrap();
        let target = c.label();
        c.jmp(target).unwrap();

        let marked = c.events.iter().any(|e| {
            matches!(e.kind, super::super::event::EventKind::Push { mark, .. } if mark)
        });
        assert!(marked);
    }
}
