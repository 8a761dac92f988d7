//! The allocation and emission driver.
//!
//! `compile` walks the recorded junctions to reconcile abstract stacks
//! across branches, emits the frame prologue, then lowers events in
//! append order. For each event every read is resolved to a concrete
//! site, issuing moves, spills, and stack synchronization as needed; then
//! write targets are assigned, and the event's operation is dispatched
//! through the assembler. `write_to` copies the finished bytes, appends
//! the constant pool, and runs the patch tasks.

use crate::x86::{
    AsmOperand, BinaryOperation, ConstOperand, Mem, Operation, Reg, RegPair, UnaryOperation,
};

use super::compiler::Compiler;
use super::error::{CompileError, CompileResult};
use super::event::{ArgRange, EventId, EventKind};
use super::promise::pad;
use super::stack::StackId;
use super::value::{ReadTarget, SiteId, SiteKind, ValueId, WriteTarget};

impl<'a> Compiler<'a> {
    /// Run junction fix-up and allocation/emission; returns the emitted
    /// code length in bytes.
    pub fn compile(&mut self) -> CompileResult<u32> {
        if self.compiled {
            return Err(CompileError::Unreachable("compile may only run once"));
        }
        self.compiled = true;

        if let Some(current) = self.logical_ip {
            if self.logical_code[current as usize].first_event.is_some() && !self.events.is_empty()
            {
                self.logical_code[current as usize].last_event =
                    Some(EventId(self.events.len() as u32 - 1));
            }
        }

        self.update_junctions();

        let word = self.word();
        let base = AsmOperand::Register(RegPair::single(self.arch().base()));
        let stack_reg = AsmOperand::Register(RegPair::single(self.arch().stack()));
        self.apply_unary(UnaryOperation::Push, word, &base)?;
        self.apply_binary(BinaryOperation::Move, word, &stack_reg, word, &base)?;
        let footprint =
            self.arch().align_frame_size(self.stack_offset) - self.arch().frame_header_size();
        if footprint > 0 {
            self.apply_binary(
                BinaryOperation::Subtract,
                word,
                &AsmOperand::Constant(ConstOperand::Imm((footprint * word) as i64)),
                word,
                &stack_reg,
            )?;
        }

        for i in 0..self.entry_promises.len() {
            let promise = self.entry_promises[i];
            self.promises.bind_code(promise, self.asm.length());
        }

        for index in 0..self.events.len() {
            self.compile_event(index)?;
        }

        log::debug!(
            "compiled {} events into {} bytes (pool {} bytes)",
            self.events.len(),
            self.asm.length(),
            self.pool_size()
        );
        Ok(self.asm.length())
    }

    /// Bytes of code emitted so far.
    pub fn length(&self) -> u32 {
        self.asm.length()
    }

    /// The encoded bytes, before relocation tasks run.
    pub fn code(&self) -> &[u8] {
        self.asm.code()
    }

    /// Size of the constant pool in bytes.
    pub fn pool_size(&self) -> u32 {
        self.pool.len() as u32 * self.word()
    }

    /// Copy the code into `dst`, append the constant pool at the padded
    /// code length, then run every patch task. Every promise is resolved
    /// afterwards.
    pub fn write_to(&mut self, dst: &mut [u8]) -> CompileResult<()> {
        let word = self.word();
        let length = self.asm.length();
        let padded = pad(length, word);
        let total = padded + self.pool_size();
        assert!(
            dst.len() >= total as usize,
            "destination buffer holds {} bytes, need {}",
            dst.len(),
            total
        );

        let code_base = dst.as_ptr() as i64;
        self.promises.finalize(code_base, length);

        // zero the alignment gap so repeated writes stay byte-identical
        for b in &mut dst[length as usize..padded as usize] {
            *b = 0;
        }
        for (key, &promise) in self.pool.iter().enumerate() {
            let v = self.promises.value(promise)?;
            let at = (padded + key as u32 * word) as usize;
            match word {
                4 => dst[at..at + 4].copy_from_slice(&(v as i32).to_le_bytes()),
                _ => dst[at..at + 8].copy_from_slice(&v.to_le_bytes()),
            }
        }

        self.asm.write_to(dst, code_base, &self.promises)
    }

    // -- assembler plumbing -------------------------------------------------

    fn apply_op(&mut self, op: Operation) -> CompileResult<()> {
        self.asm.apply(&self.promises, op)
    }

    fn apply_unary(&mut self, op: UnaryOperation, size: u32, a: &AsmOperand) -> CompileResult<()> {
        self.asm.apply_unary(&self.promises, op, size, a)
    }

    fn apply_binary(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: &AsmOperand,
        b_size: u32,
        b: &AsmOperand,
    ) -> CompileResult<()> {
        self.asm.apply_binary(&self.promises, op, a_size, a, b_size, b)
    }

    /// Project a site to the assembler's operand record.
    fn project(&self, site: SiteId) -> CompileResult<AsmOperand> {
        match self.site(site).kind {
            SiteKind::Constant(p) => Ok(AsmOperand::Constant(ConstOperand::Promise(p))),
            SiteKind::Address(p) => Ok(AsmOperand::Address(ConstOperand::Promise(p))),
            SiteKind::Register(pair) => Ok(AsmOperand::Register(pair)),
            SiteKind::Memory(mem) => Ok(AsmOperand::Memory(mem)),
            SiteKind::Stack(_) => Err(CompileError::Unreachable("stack site has no operand form")),
        }
    }

    fn site_regs(&self, site: SiteId) -> u16 {
        match self.site(site).kind {
            SiteKind::Register(pair) => pair.mask(),
            _ => 0,
        }
    }

    fn source_site(&self, value: ValueId) -> CompileResult<SiteId> {
        self.value(value)
            .source
            .ok_or(CompileError::Unreachable("value has no resolved source"))
    }

    fn source_register(&self, value: ValueId) -> CompileResult<Reg> {
        match self.site(self.source_site(value)?).kind {
            SiteKind::Register(pair) => Ok(pair.low),
            _ => Err(CompileError::Unreachable("register source required")),
        }
    }

    // -- site bookkeeping ---------------------------------------------------

    /// Cheapest of the value's sites with respect to `target`; ties keep
    /// the earliest site.
    fn pick(&self, value: ValueId, target: Option<SiteId>) -> CompileResult<(SiteId, u32)> {
        let target_kind = target.map(|t| self.site(t).kind);
        let mut best: Option<(SiteId, u32)> = None;
        let mut cursor = self.value(value).sites;
        while let Some(id) = cursor {
            let site = self.site(id);
            let cost = if target == Some(id) {
                0
            } else {
                site.kind.copy_cost(target_kind.as_ref())
            };
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((id, cost));
            }
            cursor = site.next;
        }
        best.ok_or(CompileError::Unreachable("value has no site"))
    }

    fn value_has_site(&self, value: ValueId, site: SiteId) -> bool {
        let mut cursor = self.value(value).sites;
        while let Some(id) = cursor {
            if id == site {
                return true;
            }
            cursor = self.site(id).next;
        }
        false
    }

    fn remove_site(&mut self, value: ValueId, site: SiteId) {
        if self.value(value).sites == Some(site) {
            self.value_mut(value).sites = self.site(site).next;
            return;
        }
        let mut cursor = self.value(value).sites;
        while let Some(id) = cursor {
            let next = self.site(id).next;
            if next == Some(site) {
                let skip = self.site(site).next;
                self.site_mut(id).next = skip;
                return;
            }
            cursor = next;
        }
    }

    fn remove_stack_site(&mut self, value: ValueId, frame: StackId) {
        let mut cursor = self.value(value).sites;
        while let Some(id) = cursor {
            if matches!(self.site(id).kind, SiteKind::Stack(f) if f == frame) {
                self.remove_site(value, id);
                return;
            }
            cursor = self.site(id).next;
        }
    }

    /// Install a site on a value, acquiring register slots first.
    fn add_site(
        &mut self,
        stack: Option<StackId>,
        size: u32,
        value: ValueId,
        site: SiteId,
        avoid: u16,
    ) -> CompileResult<()> {
        if self.value_has_site(value, site) {
            return Ok(());
        }
        if let SiteKind::Register(pair) = self.site(site).kind {
            self.acquire_register(pair, stack, size, value, site, avoid)?;
        }
        self.link_site(value, site);
        Ok(())
    }

    // -- register allocation ------------------------------------------------

    fn free_reg(&self, exclude: u16) -> CompileResult<Reg> {
        self.registers
            .find_free(exclude)
            .or_else(|| self.registers.find_stealable(exclude))
            .ok_or(CompileError::NoRegisters)
    }

    /// A fresh register site; a pair when a double-word value needs one.
    fn free_register_site(&mut self, size: u32, exclude: u16) -> CompileResult<SiteId> {
        let exclude = exclude | self.arch().size_exclusion(size);
        let low = self.free_reg(exclude)?;
        let pair = if self.word() == 4 && size == 8 {
            RegPair::pair(low, self.free_reg(exclude | low.mask())?)
        } else {
            RegPair::single(low)
        };
        Ok(self.new_site(SiteKind::Register(pair)))
    }

    /// Resolve an any-register target: reuse an existing register site
    /// outside `exclude`, or allocate a fresh one.
    fn register_target(&mut self, value: ValueId, exclude: u16, size: u32) -> CompileResult<SiteId> {
        let exclude = exclude | self.arch().size_exclusion(size);
        let needs_pair = self.word() == 4 && size == 8;
        let mut cursor = self.value(value).sites;
        while let Some(id) = cursor {
            if let SiteKind::Register(pair) = self.site(id).kind {
                if pair.mask() & exclude == 0 && pair.high.is_some() == needs_pair {
                    return Ok(id);
                }
            }
            cursor = self.site(id).next;
        }
        self.free_register_site(size, exclude)
    }

    /// Deepest unmaterialized frame holding `value`, if any.
    fn find_unpushed_frame(&self, stack: Option<StackId>, value: ValueId) -> Option<StackId> {
        let mut found = None;
        let mut cursor = stack;
        while let Some(f) = cursor {
            let node = self.stack_node(f);
            if node.pushed {
                break;
            }
            if node.value == Some(value) {
                found = Some(f);
            }
            cursor = node.next;
        }
        found
    }

    /// Free a register slot, preserving its occupant when it would
    /// otherwise lose its last site.
    fn displace(
        &mut self,
        reg: Reg,
        stack: Option<StackId>,
        avoid: u16,
        new_value: Option<ValueId>,
    ) -> CompileResult<()> {
        let slot = *self.registers.slot(reg);
        let (Some(old), Some(old_site)) = (slot.value, slot.site) else {
            return Ok(());
        };
        if Some(old) != new_value {
            let only_site =
                self.value(old).sites == Some(old_site) && self.site(old_site).next.is_none();
            if only_site {
                if let Some(frame) = self.find_unpushed_frame(stack, old) {
                    self.sync_stack_from(frame)?;
                } else if self.value(old).reads.is_some() {
                    let pair = match self.site(old_site).kind {
                        SiteKind::Register(p) => p,
                        _ => {
                            return Err(CompileError::Unreachable("register slot site mismatch"))
                        }
                    };
                    if pair.high.is_some() {
                        return Err(CompileError::NoRegisters);
                    }
                    let alt = self
                        .registers
                        .find_free(avoid | reg.mask() | self.arch().size_exclusion(slot.size))
                        .ok_or(CompileError::NoRegisters)?;
                    self.apply_binary(
                        BinaryOperation::Move,
                        slot.size,
                        &AsmOperand::Register(pair),
                        slot.size,
                        &AsmOperand::Register(RegPair::single(alt)),
                    )?;
                    let alt_site = self.new_site(SiteKind::Register(RegPair::single(alt)));
                    let alt_slot = self.registers.slot_mut(alt);
                    alt_slot.value = Some(old);
                    alt_slot.site = Some(alt_site);
                    alt_slot.size = slot.size;
                    self.link_site(old, alt_site);
                }
            }
        }
        self.remove_site(old, old_site);
        if let SiteKind::Register(pair) = self.site(old_site).kind {
            for r in [Some(pair.low), pair.high].into_iter().flatten() {
                let s = self.registers.slot_mut(r);
                if s.site == Some(old_site) {
                    s.value = None;
                    s.site = None;
                }
            }
        }
        Ok(())
    }

    fn acquire_register(
        &mut self,
        pair: RegPair,
        stack: Option<StackId>,
        size: u32,
        value: ValueId,
        site: SiteId,
        avoid: u16,
    ) -> CompileResult<()> {
        for reg in [Some(pair.low), pair.high].into_iter().flatten() {
            if !self.registers.contains(reg) {
                return Err(CompileError::Unreachable("register outside the slot table"));
            }
            if self.registers.slot(reg).reserved {
                return Err(CompileError::Unreachable("acquiring a reserved register"));
            }
            self.displace(reg, stack, avoid | pair.mask(), Some(value))?;
            let slot = self.registers.slot_mut(reg);
            slot.value = Some(value);
            slot.site = Some(site);
            slot.size = size;
        }
        Ok(())
    }

    // -- stack synchronization ----------------------------------------------

    /// Positive `bytes` releases stack space.
    fn adjust_stack_pointer(&mut self, bytes: i64) -> CompileResult<()> {
        let word = self.word();
        let stack_reg = AsmOperand::Register(RegPair::single(self.arch().stack()));
        self.apply_binary(
            BinaryOperation::Add,
            word,
            &AsmOperand::Constant(ConstOperand::Imm(bytes)),
            word,
            &stack_reg,
        )
    }

    /// Materialize `frame` and every unmaterialized frame below it,
    /// deepest first.
    pub(crate) fn sync_stack_from(&mut self, frame: StackId) -> CompileResult<()> {
        let word = self.word();
        let mut segment = Vec::new();
        let mut cursor = Some(frame);
        while let Some(f) = cursor {
            let node = *self.stack_node(f);
            if node.pushed {
                break;
            }
            segment.push(f);
            cursor = node.next;
        }
        for &f in segment.iter().rev() {
            let node = *self.stack_node(f);
            let bytes = node.size * word;
            if let Some(value) = node.value {
                let (site, _) = self.pick(value, None)?;
                let operand = self.project(site)?;
                self.apply_unary(UnaryOperation::Push, bytes, &operand)?;
                let stack_site = self.new_site(SiteKind::Stack(f));
                self.link_site(value, stack_site);
            } else {
                let word_reg = AsmOperand::Register(RegPair::single(self.arch().stack()));
                self.apply_binary(
                    BinaryOperation::Subtract,
                    word,
                    &AsmOperand::Constant(ConstOperand::Imm(bytes as i64)),
                    word,
                    &word_reg,
                )?;
            }
            self.stack_node_mut(f).pushed = true;
        }
        Ok(())
    }

    /// Pop every materialized frame back into registers, top of stack
    /// first, so values become individually addressable again.
    fn unspill_stack(&mut self, stack: Option<StackId>, in_use: u16) -> CompileResult<()> {
        let word = self.word();
        let mut cursor = stack;
        while let Some(f) = cursor {
            let node = *self.stack_node(f);
            if node.pushed {
                let bytes = node.size * word;
                if let Some(value) = node.value {
                    let target = self.free_register_site(bytes, in_use)?;
                    let operand = self.project(target)?;
                    self.apply_unary(UnaryOperation::Pop, bytes, &operand)?;
                    self.add_site(None, bytes, value, target, in_use)?;
                    self.remove_stack_site(value, f);
                } else {
                    self.adjust_stack_pointer(bytes as i64)?;
                }
                self.stack_node_mut(f).pushed = false;
            }
            cursor = node.next;
        }
        Ok(())
    }

    // -- junctions ----------------------------------------------------------

    /// Propagate stack-materialization marks from every junction's
    /// predecessor so all incoming edges agree on the stack pointer.
    fn update_junctions(&mut self) {
        for i in 0..self.junctions.len() {
            let ip = self.junctions[i] as usize;
            let Some(predecessor) = self.logical_code[ip].predecessor else {
                continue;
            };
            let Some(last) = self.logical_code[predecessor as usize].last_event else {
                continue;
            };
            let stack = self.event(last).stack;
            self.mark_stack(stack);
        }
    }

    // -- per-event lowering --------------------------------------------------

    fn compile_event(&mut self, index: usize) -> CompileResult<()> {
        let logical_ip = self.events[index].logical_ip;
        if self.logical_code[logical_ip as usize].first_event == Some(EventId(index as u32)) {
            let offset = self.asm.length();
            self.logical_code[logical_ip as usize].machine_offset = Some(offset);
            self.promises.bind_ip(logical_ip, offset);
        }
        log::trace!(
            "compiling {} event at logical ip {}",
            self.events[index].kind.name(),
            logical_ip
        );

        let in_use = self.resolve_reads(index)?;
        self.apply_clobbers(index, in_use)?;
        self.resolve_writes(index, in_use)?;
        self.emit_event(index, in_use)?;

        let mut promise = self.events[index].promises;
        while let Some(p) = promise {
            self.promises.bind_code(p, self.asm.length());
            promise = self.promises.code_next(p);
        }
        Ok(())
    }

    /// Resolve every read of the event to a concrete site, emitting moves
    /// and stack synchronization as needed. Returns the registers pinned
    /// by resolved sources.
    fn resolve_reads(&mut self, index: usize) -> CompileResult<u16> {
        let stack = self.events[index].stack;
        let mut in_use: u16 = 0;
        let mut cursor = self.events[index].reads;
        while let Some(rid) = cursor {
            let read = *self.read(rid);
            let value = read.value;

            let mut target = match read.target {
                ReadTarget::Any => None,
                ReadTarget::Site(site) => Some(site),
                ReadTarget::Value(other) => self.value(other).sites,
                ReadTarget::AnyRegister(mask) => {
                    Some(self.register_target(value, mask | in_use, read.size)?)
                }
            };

            let (mut site, mut cost) = self.pick(value, target)?;
            if matches!(self.site(site).kind, SiteKind::Stack(_)) {
                self.unspill_stack(stack, in_use)?;
                let repicked = self.pick(value, target)?;
                site = repicked.0;
                cost = repicked.1;
            }

            // a register source must be encodable at the read's width
            let exclusion = self.arch().size_exclusion(read.size);
            if target.is_none() && exclusion != 0 {
                if let SiteKind::Register(pair) = self.site(site).kind {
                    if pair.mask() & exclusion != 0 {
                        target = Some(self.register_target(value, exclusion | in_use, read.size)?);
                        let repicked = self.pick(value, target)?;
                        site = repicked.0;
                        cost = repicked.1;
                    }
                }
            }

            let source = if let Some(target) = target {
                if cost > 0 {
                    let avoid = in_use | self.site_regs(target);
                    self.add_site(stack, read.size, value, target, avoid)?;
                    self.accept(target, read.size, site)?;
                }
                target
            } else {
                site
            };
            self.value_mut(value).source = Some(source);
            in_use |= self.site_regs(source);

            debug_assert_eq!(self.value(value).reads, Some(rid));
            let v = self.value_mut(value);
            v.reads = read.next_for_value;
            if v.reads.is_none() {
                v.last_read = None;
            }
            cursor = read.next_in_event;
        }
        Ok(in_use)
    }

    /// Copy a value into its target site.
    fn accept(&mut self, target: SiteId, size: u32, source: SiteId) -> CompileResult<()> {
        let src = self.project(source)?;
        match self.site(target).kind {
            SiteKind::Stack(_) => self.apply_unary(UnaryOperation::Push, size, &src),
            _ => {
                let dst = self.project(target)?;
                self.apply_binary(BinaryOperation::Move, size, &src, size, &dst)
            }
        }
    }

    /// Evict registers the instruction destroys beyond its operands.
    fn apply_clobbers(&mut self, index: usize, in_use: u16) -> CompileResult<()> {
        let clobbers = match self.events[index].kind {
            EventKind::Combine { clobbers, .. } => clobbers,
            _ => 0,
        };
        if clobbers == 0 {
            return Ok(());
        }
        let stack = self.events[index].stack;
        for i in 0..16u8 {
            let reg = Reg(i);
            if clobbers & reg.mask() != 0
                && self.registers.contains(reg)
                && !self.registers.slot(reg).reserved
            {
                self.displace(reg, stack, in_use | clobbers, None)?;
            }
        }
        Ok(())
    }

    fn resolve_writes(&mut self, index: usize, in_use: u16) -> CompileResult<()> {
        let stack = self.events[index].stack;
        let mut cursor = self.events[index].writes;
        while let Some(wid) = cursor {
            let write = *self.write(wid);
            let value = write.value;

            let target = match write.target {
                WriteTarget::Site(site) => site,
                WriteTarget::SameAs(other) => {
                    let source = self.value(other).source.ok_or(CompileError::Unreachable(
                        "two-address operand has no source",
                    ))?;
                    match self.site(source).kind {
                        SiteKind::Register(pair) => self.new_site(SiteKind::Register(pair)),
                        _ => {
                            return Err(CompileError::Unreachable(
                                "two-address destination is not a register",
                            ))
                        }
                    }
                }
                WriteTarget::Free => {
                    let sticky = self.value(value).reads.and_then(|rid| {
                        match self.read(rid).target {
                            ReadTarget::Site(s)
                                if !matches!(self.site(s).kind, SiteKind::Stack(_)) =>
                            {
                                Some(s)
                            }
                            _ => None,
                        }
                    });
                    if let Some(site) = sticky {
                        site
                    } else if let Some(existing) = self.value(value).sites {
                        existing
                    } else {
                        self.free_register_site(write.size, in_use)?
                    }
                }
            };

            self.add_site(stack, write.size, value, target, in_use)?;
            self.value_mut(value).target = Some(target);
            cursor = write.next_in_event;
        }
        Ok(())
    }

    fn emit_event(&mut self, index: usize, in_use: u16) -> CompileResult<()> {
        let word = self.word();
        match self.events[index].kind {
            EventKind::Push { frame, mark } => {
                if mark {
                    self.sync_stack_from(frame)?;
                }
                Ok(())
            }
            EventKind::Pop {
                frame,
                words,
                ignore,
            } => self.emit_pop(frame, words, ignore, in_use),
            EventKind::Call {
                address,
                indirection,
                aligned,
                trace,
                result,
                args,
            } => self.emit_call(address, indirection, aligned, trace, result, args),
            EventKind::Return { .. } => {
                let base = AsmOperand::Register(RegPair::single(self.arch().base()));
                let stack_reg = AsmOperand::Register(RegPair::single(self.arch().stack()));
                self.apply_binary(BinaryOperation::Move, word, &base, word, &stack_reg)?;
                self.apply_unary(UnaryOperation::Pop, word, &base)?;
                self.apply_op(Operation::Return)
            }
            EventKind::Move { op, size, src, dst } => {
                let source = self.source_site(src)?;
                let target = self
                    .value(dst)
                    .target
                    .ok_or(CompileError::Unreachable("move has no target site"))?;
                let (a_size, b_size) = match op {
                    BinaryOperation::MoveZ => (size, word),
                    BinaryOperation::Move4To8 => (4, 8),
                    _ => (size, size),
                };
                let a = self.project(source)?;
                let b = self.project(target)?;
                self.apply_binary(op, a_size, &a, b_size, &b)
            }
            EventKind::Compare {
                size,
                first,
                second,
            } => {
                let a = self.project(self.source_site(first)?)?;
                let b = self.project(self.source_site(second)?)?;
                self.apply_binary(BinaryOperation::Compare, size, &a, size, &b)
            }
            EventKind::Branch { op, address } => {
                let a = self.project(self.source_site(address)?)?;
                self.apply_unary(op, word, &a)
            }
            EventKind::Combine {
                op,
                size,
                first,
                second,
                ..
            } => {
                let a = self.project(self.source_site(first)?)?;
                let b = self.project(self.source_site(second)?)?;
                self.apply_binary(op, size, &a, size, &b)
            }
            EventKind::Translate { op, size, value, .. } => {
                let a = self.project(self.source_site(value)?)?;
                self.apply_unary(op, size, &a)
            }
            EventKind::Memory {
                base,
                index: mem_index,
                result,
                displacement,
                scale,
            } => {
                let base_reg = self.source_register(base)?;
                let index_reg = match mem_index {
                    Some(v) => Some(self.source_register(v)?),
                    None => None,
                };
                let site = self.new_site(SiteKind::Memory(Mem {
                    base: base_reg,
                    offset: displacement,
                    index: index_reg,
                    scale,
                }));
                self.link_site(result, site);
                Ok(())
            }
        }
    }

    fn emit_pop(
        &mut self,
        frame: StackId,
        words: u32,
        ignore: bool,
        in_use: u16,
    ) -> CompileResult<()> {
        let word = self.word();
        if ignore {
            let mut remaining = words;
            let mut cursor = Some(frame);
            let mut bytes = 0i64;
            while remaining > 0 {
                let Some(f) = cursor else { break };
                let node = *self.stack_node(f);
                if node.pushed {
                    bytes += (node.size * word) as i64;
                    if let Some(value) = node.value {
                        self.remove_stack_site(value, f);
                    }
                    self.stack_node_mut(f).pushed = false;
                }
                remaining = remaining.saturating_sub(node.size);
                cursor = node.next;
            }
            if bytes > 0 {
                self.adjust_stack_pointer(bytes)?;
            }
            Ok(())
        } else {
            let node = *self.stack_node(frame);
            if !node.pushed {
                return Ok(());
            }
            let bytes = node.size * word;
            if let Some(value) = node.value {
                let target = self.free_register_site(bytes, in_use)?;
                let operand = self.project(target)?;
                self.apply_unary(UnaryOperation::Pop, bytes, &operand)?;
                self.add_site(None, bytes, value, target, in_use)?;
                self.remove_stack_site(value, frame);
            } else {
                self.adjust_stack_pointer(bytes as i64)?;
            }
            self.stack_node_mut(frame).pushed = false;
            Ok(())
        }
    }

    fn emit_call(
        &mut self,
        address: ValueId,
        indirection: Option<i64>,
        aligned: bool,
        trace: bool,
        result: Option<ValueId>,
        args: ArgRange,
    ) -> CompileResult<()> {
        let word = self.word();
        let arg_registers = self.arch().argument_register_count();
        log::trace!(
            "call: {} arguments, result {}",
            args.len,
            if result.is_some() { "expected" } else { "ignored" }
        );

        let mut footprints = Vec::with_capacity(args.len as usize);
        let mut footprint = 0u32;
        for i in 0..args.len {
            let (size, _) = self.call_args[(args.start + i) as usize];
            footprints.push(footprint);
            footprint += size.div_ceil(word).max(1);
        }

        // overflow arguments go to the machine stack, right to left
        let mut pushed_bytes = 0i64;
        for i in (0..args.len).rev() {
            let (size, value) = self.call_args[(args.start + i) as usize];
            if footprints[i as usize] >= arg_registers {
                let operand = self.project(self.source_site(value)?)?;
                let bytes = size.div_ceil(word).max(1) * word;
                self.apply_unary(UnaryOperation::Push, bytes, &operand)?;
                pushed_bytes += bytes as i64;
            }
        }

        let op = if aligned {
            UnaryOperation::AlignedCall
        } else {
            UnaryOperation::Call
        };
        if let Some(target) = indirection {
            self.apply_unary(op, word, &AsmOperand::Constant(ConstOperand::Imm(target)))?;
        } else {
            let operand = self.project(self.source_site(address)?)?;
            self.apply_unary(op, word, &operand)?;
        }

        if trace {
            let promise = self.promises.code_promise_at(self.asm.length());
            if let Some(hook) = self.trace_hook.as_mut() {
                hook(promise);
            }
        }

        if pushed_bytes > 0 {
            self.adjust_stack_pointer(pushed_bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::compiler::Compiler;
    use super::*;
    use crate::x86::{Target, RAX};
    use bumpalo::Bump;

    #[test]
    fn pick_prefers_the_cheapest_site() {
        let arena = Bump::new();
        let mut c = Compiler::new(&arena, Target::X86_64);
        c.init(1, 0);
        c.start_logical_ip(0);

        let v = c.constant(3);
        let reg = c.new_site(SiteKind::Register(RegPair::single(RAX)));
        c.link_site(v.0, reg);

        // with no target, the constant (cost 1) beats the register (cost 2)
        let (_, cost) = c.pick(v.0, None).unwrap();
        assert_eq!(cost, 1);

        // against a matching register target, the register site is free
        let target = c.new_site(SiteKind::Register(RegPair::single(RAX)));
        let (site, cost) = c.pick(v.0, Some(target)).unwrap();
        assert_eq!(cost, 0);
        assert_eq!(site, reg);
    }

    #[test]
    fn register_pairs_allocate_two_distinct_slots() {
        let arena = Bump::new();
        let mut c = Compiler::new(&arena, Target::X86);
        c.init(1, 0);

        let site = c.free_register_site(8, 0).unwrap();
        match c.site(site).kind {
            SiteKind::Register(pair) => {
                let high = pair.high.expect("double-word values need a pair");
                assert_ne!(pair.low, high);
            }
            _ => panic!("register site expected"),
        }
    }

    #[test]
    fn byte_allocations_avoid_esi_edi_on_x86() {
        let arena = Bump::new();
        let mut c = Compiler::new(&arena, Target::X86);
        c.init(1, 0);

        let site = c.free_register_site(1, 0).unwrap();
        match c.site(site).kind {
            SiteKind::Register(pair) => {
                assert!(pair.low.0 <= 3, "no byte encoding for {:?}", pair.low);
            }
            _ => panic!("register site expected"),
        }
    }

    #[test]
    fn reads_chain_in_append_order() {
        let arena = Bump::new();
        let mut c = Compiler::new(&arena, Target::X86_64);
        c.init(1, 0);
        c.start_logical_ip(0);

        let v = c.constant(1);
        c.load(8, v).unwrap();
        c.load(8, v).unwrap();

        let first = c.value(v.0).reads.unwrap();
        let second = c.read(first).next_for_value.unwrap();
        assert!(c.read(second).next_for_value.is_none());
        assert_eq!(c.value(v.0).last_read, Some(second));
    }
}
