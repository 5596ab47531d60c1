//! The dispatch loop. One `match` over the abstract instruction stream,
//! driven against a stack manager; control flow goes through the label
//! stack with jump targets resolved at instantiation time.

use std::sync::Arc;

use crate::ast::instr::{
    BlockType, CatchClause, CvtOp, FBinOp, FRelOp, FUnOp, FWidth, IBinOp, IRelOp, IUnOp, IWidth,
    Instruction, MemArg, PackedLoad, NumType, RelaxedOp, RmwOp, Sign, VVOp,
};
use crate::ast::types::FuncType;
use crate::error::Trap;
use crate::exec::Executor;
use crate::host::CallingFrame;
use crate::runtime::func::FuncKind;
use crate::runtime::{
    CodeUnit, Exception, FuncAddr, FunctionInstance, MemAddr, MemoryInstance, ModuleInstance, Ref,
    Store, Value,
};
use crate::vm::gc_ops;
use crate::vm::numeric::{self, clean_numeric};
use crate::vm::simd;
use crate::vm::stack::{Frame, Handler, Label, LabelKind, StackManager};

/// Param/result arities of a block type.
fn block_arities(module: &ModuleInstance, bt: &BlockType) -> Result<(usize, usize), Trap> {
    Ok(match bt {
        BlockType::Empty => (0, 0),
        BlockType::Val(_) => (0, 1),
        BlockType::Func(idx) => {
            let ft = module.func_type(*idx).ok_or(Trap::UnreachableExecuted)?;
            (ft.params.len(), ft.results.len())
        }
    })
}

// ===== scalar op helpers =====

fn ibinop32(op: IBinOp, a: i32, b: i32) -> Result<i32, Trap> {
    Ok(match op {
        IBinOp::Add => a.wrapping_add(b),
        IBinOp::Sub => a.wrapping_sub(b),
        IBinOp::Mul => a.wrapping_mul(b),
        IBinOp::DivS => numeric::div_s32(a, b)?,
        IBinOp::DivU => numeric::div_u32(a as u32, b as u32)? as i32,
        IBinOp::RemS => numeric::rem_s32(a, b)?,
        IBinOp::RemU => numeric::rem_u32(a as u32, b as u32)? as i32,
        IBinOp::And => a & b,
        IBinOp::Or => a | b,
        IBinOp::Xor => a ^ b,
        IBinOp::Shl => a.wrapping_shl(b as u32),
        IBinOp::ShrS => a.wrapping_shr(b as u32),
        IBinOp::ShrU => ((a as u32).wrapping_shr(b as u32)) as i32,
        IBinOp::Rotl => a.rotate_left((b as u32) & 31),
        IBinOp::Rotr => a.rotate_right((b as u32) & 31),
    })
}

fn ibinop64(op: IBinOp, a: i64, b: i64) -> Result<i64, Trap> {
    Ok(match op {
        IBinOp::Add => a.wrapping_add(b),
        IBinOp::Sub => a.wrapping_sub(b),
        IBinOp::Mul => a.wrapping_mul(b),
        IBinOp::DivS => numeric::div_s64(a, b)?,
        IBinOp::DivU => numeric::div_u64(a as u64, b as u64)? as i64,
        IBinOp::RemS => numeric::rem_s64(a, b)?,
        IBinOp::RemU => numeric::rem_u64(a as u64, b as u64)? as i64,
        IBinOp::And => a & b,
        IBinOp::Or => a | b,
        IBinOp::Xor => a ^ b,
        IBinOp::Shl => a.wrapping_shl(b as u32),
        IBinOp::ShrS => a.wrapping_shr(b as u32),
        IBinOp::ShrU => ((a as u64).wrapping_shr(b as u32)) as i64,
        IBinOp::Rotl => a.rotate_left((b as u32) & 63),
        IBinOp::Rotr => a.rotate_right((b as u32) & 63),
    })
}

fn iunop32(op: IUnOp, x: i32) -> i32 {
    match op {
        IUnOp::Clz => x.leading_zeros() as i32,
        IUnOp::Ctz => x.trailing_zeros() as i32,
        IUnOp::Popcnt => x.count_ones() as i32,
        IUnOp::Extend8S => numeric::extend8_s32(x),
        IUnOp::Extend16S => numeric::extend16_s32(x),
        IUnOp::Extend32S => x,
    }
}

fn iunop64(op: IUnOp, x: i64) -> i64 {
    match op {
        IUnOp::Clz => x.leading_zeros() as i64,
        IUnOp::Ctz => x.trailing_zeros() as i64,
        IUnOp::Popcnt => x.count_ones() as i64,
        IUnOp::Extend8S => numeric::extend8_s64(x),
        IUnOp::Extend16S => numeric::extend16_s64(x),
        IUnOp::Extend32S => numeric::extend32_s64(x),
    }
}

fn irelop32(op: IRelOp, a: i32, b: i32) -> bool {
    match op {
        IRelOp::Eq => a == b,
        IRelOp::Ne => a != b,
        IRelOp::LtS => a < b,
        IRelOp::LtU => (a as u32) < (b as u32),
        IRelOp::GtS => a > b,
        IRelOp::GtU => (a as u32) > (b as u32),
        IRelOp::LeS => a <= b,
        IRelOp::LeU => (a as u32) <= (b as u32),
        IRelOp::GeS => a >= b,
        IRelOp::GeU => (a as u32) >= (b as u32),
    }
}

fn irelop64(op: IRelOp, a: i64, b: i64) -> bool {
    match op {
        IRelOp::Eq => a == b,
        IRelOp::Ne => a != b,
        IRelOp::LtS => a < b,
        IRelOp::LtU => (a as u64) < (b as u64),
        IRelOp::GtS => a > b,
        IRelOp::GtU => (a as u64) > (b as u64),
        IRelOp::LeS => a <= b,
        IRelOp::LeU => (a as u64) <= (b as u64),
        IRelOp::GeS => a >= b,
        IRelOp::GeU => (a as u64) >= (b as u64),
    }
}

fn funop32(op: FUnOp, x: f32) -> f32 {
    match op {
        FUnOp::Abs => x.abs(),
        FUnOp::Neg => -x,
        FUnOp::Ceil => x.ceil(),
        FUnOp::Floor => x.floor(),
        FUnOp::Trunc => x.trunc(),
        FUnOp::Nearest => numeric::fnearest32(x),
        FUnOp::Sqrt => x.sqrt(),
    }
}

fn funop64(op: FUnOp, x: f64) -> f64 {
    match op {
        FUnOp::Abs => x.abs(),
        FUnOp::Neg => -x,
        FUnOp::Ceil => x.ceil(),
        FUnOp::Floor => x.floor(),
        FUnOp::Trunc => x.trunc(),
        FUnOp::Nearest => numeric::fnearest64(x),
        FUnOp::Sqrt => x.sqrt(),
    }
}

fn fbinop32(op: FBinOp, a: f32, b: f32) -> f32 {
    match op {
        FBinOp::Add => a + b,
        FBinOp::Sub => a - b,
        FBinOp::Mul => a * b,
        FBinOp::Div => a / b,
        FBinOp::Min => numeric::fmin32(a, b),
        FBinOp::Max => numeric::fmax32(a, b),
        FBinOp::Copysign => a.copysign(b),
    }
}

fn fbinop64(op: FBinOp, a: f64, b: f64) -> f64 {
    match op {
        FBinOp::Add => a + b,
        FBinOp::Sub => a - b,
        FBinOp::Mul => a * b,
        FBinOp::Div => a / b,
        FBinOp::Min => numeric::fmin64(a, b),
        FBinOp::Max => numeric::fmax64(a, b),
        FBinOp::Copysign => a.copysign(b),
    }
}

fn frelop(op: FRelOp, a: f64, b: f64) -> bool {
    match op {
        FRelOp::Eq => a == b,
        FRelOp::Ne => a != b,
        FRelOp::Lt => a < b,
        FRelOp::Gt => a > b,
        FRelOp::Le => a <= b,
        FRelOp::Ge => a >= b,
    }
}

#[inline]
fn width_mask(size: usize) -> u64 {
    if size == 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// Push the callee activation: locals region, frame record, and the implicit
/// function-body label.
fn push_activation(
    sm: &mut StackManager,
    module: Arc<ModuleInstance>,
    ty: &FuncType,
    code: Arc<CodeUnit>,
) -> Result<usize, Trap> {
    let params = ty.params.len();
    if sm.values.len() < params {
        return Err(Trap::UnreachableExecuted);
    }
    let locals_base = sm.values.len() - params;
    for local in &code.locals {
        sm.push(Value::default_for(*local));
    }
    let label_floor = sm.labels.len();
    sm.push_frame(Frame {
        module,
        code: code.clone(),
        pc: 0,
        locals_base,
        arity: ty.results.len(),
        label_floor,
    })?;
    sm.push_label(Label {
        kind: LabelKind::Func,
        arity: ty.results.len(),
        height: sm.values.len(),
        continuation: code.body.len() as u32,
        handlers: Vec::new(),
    });
    Ok(locals_base)
}

/// Interpreter state for one invocation. Mirrors the top frame; the mirror is
/// refreshed on every frame switch.
pub(crate) struct Vm<'a> {
    exec: &'a Executor,
    store: &'a Store,
    sm: &'a mut StackManager,
    module: Arc<ModuleInstance>,
    code: Arc<CodeUnit>,
    pc: u32,
    locals_base: usize,
    /// Frame count below the entry frame; the loop exits when the frame
    /// stack shrinks back to this depth.
    entry_frames: usize,
    entry_epoch: u64,
}

impl<'a> Vm<'a> {
    fn check_stop(&self) -> Result<(), Trap> {
        if self.exec.stop_token().stopped_since(self.entry_epoch) {
            Err(Trap::Interrupted)
        } else {
            Ok(())
        }
    }

    fn sync_to_top_frame(&mut self) -> Result<(), Trap> {
        let frame = self.sm.current_frame()?;
        self.module = frame.module.clone();
        self.code = frame.code.clone();
        self.pc = frame.pc;
        self.locals_base = frame.locals_base;
        Ok(())
    }

    fn memory(&self, idx: u32) -> Result<(MemAddr, Arc<MemoryInstance>), Trap> {
        let addr = self.module.mem_addr(idx).ok_or(Trap::UnreachableExecuted)?;
        let mem = self.store.memory(addr).ok_or(Trap::UnreachableExecuted)?;
        Ok((addr, mem))
    }

    /// Pop the dynamic index and form the effective address.
    fn mem_and_addr(&mut self, memarg: &MemArg) -> Result<(Arc<MemoryInstance>, u64), Trap> {
        let idx = self.sm.pop_i32()? as u32 as u64;
        let (_, mem) = self.memory(memarg.mem)?;
        Ok((mem, idx + memarg.offset))
    }

    fn table(&self, idx: u32) -> Result<Arc<crate::runtime::TableInstance>, Trap> {
        let addr = self.module.table_addr(idx).ok_or(Trap::UnreachableExecuted)?;
        self.store.table(addr).ok_or(Trap::UnreachableExecuted)
    }

    fn elem(&self, idx: u32) -> Result<Arc<crate::runtime::ElementInstance>, Trap> {
        let addr = self.module.elem_addr(idx).ok_or(Trap::UnreachableExecuted)?;
        self.store.elem(addr).ok_or(Trap::UnreachableExecuted)
    }

    fn data(&self, idx: u32) -> Result<Arc<crate::runtime::DataInstance>, Trap> {
        let addr = self.module.data_addr(idx).ok_or(Trap::UnreachableExecuted)?;
        self.store.data(addr).ok_or(Trap::UnreachableExecuted)
    }

    /// Pop the function's results off the exiting frame and restore the
    /// caller. Returns true when the entry frame itself exited.
    fn finish_frame(&mut self) -> Result<bool, Trap> {
        let frame = self.sm.pop_frame()?;
        self.sm.labels.truncate(frame.label_floor);
        let results = self.sm.pop_n(frame.arity)?;
        self.sm.values.truncate(frame.locals_base);
        self.sm.values.extend(results);
        if self.sm.frames.len() == self.entry_frames {
            return Ok(true);
        }
        self.sync_to_top_frame()?;
        Ok(false)
    }

    /// Branch to label `depth`. Returns true when the branch left the entry
    /// frame (a branch to the function-body label of the entry function).
    fn branch(&mut self, depth: u32) -> Result<bool, Trap> {
        let label = self.sm.label_at_depth(depth)?.clone();
        self.sm.unwind_to(label.height, label.arity)?;
        let keep = self.sm.labels.len() - (depth as usize + 1);
        self.sm.labels.truncate(keep);
        match label.kind {
            LabelKind::Func => self.finish_frame(),
            LabelKind::Loop => {
                // Loop back-edge: the one place a long-running function must
                // observe cancellation.
                self.check_stop()?;
                self.pc = label.continuation;
                Ok(false)
            }
            _ => {
                self.pc = label.continuation;
                Ok(false)
            }
        }
    }

    /// Transfer control to a matching `try_table` handler, unwinding frames
    /// as needed. Errors with `UncaughtException` when no handler matches
    /// within this invocation; returns true when the handler's branch left
    /// the entry frame.
    fn throw(&mut self, exn: Arc<Exception>) -> Result<bool, Trap> {
        loop {
            let label_floor = self.sm.current_frame()?.label_floor;
            while self.sm.labels.len() > label_floor {
                let label = self.sm.labels.last().ok_or(Trap::UnreachableExecuted)?.clone();
                if label.kind == LabelKind::Try {
                    if let Some(handler) = label
                        .handlers
                        .iter()
                        .find(|h| h.tag.is_none() || h.tag == Some(exn.tag))
                        .copied()
                    {
                        // Pop the try label; handler labels are relative to
                        // the enclosing context.
                        self.sm.pop_label()?;
                        self.sm.values.truncate(label.height);
                        if handler.tag.is_some() {
                            self.sm.values.extend(exn.payload.iter().cloned());
                        }
                        if handler.capture_exn {
                            self.sm.push(Value::Ref(Ref::Exn(exn)));
                        }
                        return self.branch(handler.label);
                    }
                }
                self.sm.pop_label()?;
            }
            // No handler in this frame: unwind it and rethrow in the caller.
            let frame = self.sm.pop_frame()?;
            self.sm.values.truncate(frame.locals_base);
            if self.sm.frames.len() == self.entry_frames {
                return Err(Trap::UncaughtException);
            }
            self.sync_to_top_frame()?;
        }
    }

    /// Call the function at `addr`. Tail calls replace the current frame.
    /// Returns true when the invocation finished (tail call unwound the
    /// entry frame into a host/compiled callee).
    fn call_func(&mut self, addr: FuncAddr, tail: bool) -> Result<bool, Trap> {
        let func = self.store.func(addr).ok_or(Trap::UnreachableExecuted)?;
        match func.kind() {
            FuncKind::Host { .. } => {
                self.exec
                    .call_host(self.store, &func, Some(self.module.clone()), self.sm)?;
                if tail {
                    return self.finish_frame();
                }
                self.pc += 1;
                Ok(false)
            }
            FuncKind::Compiled { .. } => {
                self.exec.call_compiled(self.store, addr, &func, self.sm, self.entry_epoch)?;
                if tail {
                    return self.finish_frame();
                }
                self.pc += 1;
                Ok(false)
            }
            FuncKind::Wasm { module, code } => {
                self.check_stop()?;
                let callee_module =
                    self.store.module(*module).ok_or(Trap::UnreachableExecuted)?;
                let code = code.clone();
                let ty = func.ty().clone();
                if tail {
                    let args = self.sm.pop_n(ty.params.len())?;
                    let frame = self.sm.pop_frame()?;
                    self.sm.labels.truncate(frame.label_floor);
                    self.sm.values.truncate(frame.locals_base);
                    self.sm.values.extend(args);
                } else {
                    self.sm.current_frame_mut()?.pc = self.pc + 1;
                }
                let locals_base = push_activation(self.sm, callee_module.clone(), &ty, code.clone())?;
                self.module = callee_module;
                self.code = code;
                self.pc = 0;
                self.locals_base = locals_base;
                Ok(false)
            }
        }
    }

    /// The dispatch loop.
    pub(crate) fn run(&mut self) -> Result<(), Trap> {
        'dispatch: loop {
            let instr = self
                .code
                .body
                .get(self.pc as usize)
                .ok_or(Trap::UnreachableExecuted)?
                .clone();
            if let Some(stats) = self.exec.stats() {
                stats.account(&instr)?;
            }
            match instr {
                // ===== control =====
                Instruction::Unreachable => return Err(Trap::UnreachableExecuted),
                Instruction::Nop => {}
                Instruction::Block(bt) => {
                    let (params, results) = block_arities(&self.module, &bt)?;
                    let targets =
                        *self.code.targets.get(&self.pc).ok_or(Trap::UnreachableExecuted)?;
                    self.sm.push_label(Label {
                        kind: LabelKind::Block,
                        arity: results,
                        height: self.sm.values.len() - params,
                        continuation: targets.end_ip + 1,
                        handlers: Vec::new(),
                    });
                }
                Instruction::Loop(bt) => {
                    let (params, _) = block_arities(&self.module, &bt)?;
                    self.sm.push_label(Label {
                        kind: LabelKind::Loop,
                        arity: params,
                        height: self.sm.values.len() - params,
                        continuation: self.pc,
                        handlers: Vec::new(),
                    });
                }
                Instruction::If(bt) => {
                    let cond = self.sm.pop_i32()?;
                    let (params, results) = block_arities(&self.module, &bt)?;
                    let targets =
                        *self.code.targets.get(&self.pc).ok_or(Trap::UnreachableExecuted)?;
                    self.sm.push_label(Label {
                        kind: LabelKind::If,
                        arity: results,
                        height: self.sm.values.len() - params,
                        continuation: targets.end_ip + 1,
                        handlers: Vec::new(),
                    });
                    if cond == 0 {
                        self.pc = match targets.else_ip {
                            Some(else_ip) => else_ip + 1,
                            // No else branch: fall to the End, which pops.
                            None => targets.end_ip,
                        };
                        continue 'dispatch;
                    }
                }
                Instruction::Else => {
                    // Reached by falling off the then-branch: skip to End.
                    let targets =
                        *self.code.targets.get(&self.pc).ok_or(Trap::UnreachableExecuted)?;
                    self.pc = targets.end_ip;
                    continue 'dispatch;
                }
                Instruction::End => {
                    let label = self.sm.pop_label()?;
                    if label.kind == LabelKind::Func {
                        // Put the label back for the shared return path.
                        self.sm.push_label(label);
                        if self.finish_frame()? {
                            return Ok(());
                        }
                        continue 'dispatch;
                    }
                }
                Instruction::Br(depth) => {
                    if self.branch(depth)? {
                        return Ok(());
                    }
                    continue 'dispatch;
                }
                Instruction::BrIf(depth) => {
                    if self.sm.pop_i32()? != 0 {
                        if self.branch(depth)? {
                            return Ok(());
                        }
                        continue 'dispatch;
                    }
                }
                Instruction::BrTable(ref targets) => {
                    let i = self.sm.pop_i32()? as u32 as usize;
                    let depth = targets.targets.get(i).copied().unwrap_or(targets.default);
                    if self.branch(depth)? {
                        return Ok(());
                    }
                    continue 'dispatch;
                }
                Instruction::Return => {
                    if self.finish_frame()? {
                        return Ok(());
                    }
                    continue 'dispatch;
                }
                Instruction::Call(idx) => {
                    let addr = self.module.func_addr(idx).ok_or(Trap::UnreachableExecuted)?;
                    if self.call_func(addr, false)? {
                        return Ok(());
                    }
                    continue 'dispatch;
                }
                Instruction::ReturnCall(idx) => {
                    let addr = self.module.func_addr(idx).ok_or(Trap::UnreachableExecuted)?;
                    if self.call_func(addr, true)? {
                        return Ok(());
                    }
                    continue 'dispatch;
                }
                Instruction::CallIndirect { type_idx, table }
                | Instruction::ReturnCallIndirect { type_idx, table } => {
                    let tail = matches!(instr, Instruction::ReturnCallIndirect { .. });
                    let i = self.sm.pop_i32()? as u32;
                    let entry = self.table(table)?.get(i)?;
                    let addr = match entry {
                        Ref::Null(_) => return Err(Trap::UninitializedElement),
                        Ref::Func(addr) => addr,
                        _ => return Err(Trap::IndirectCallTypeMismatch),
                    };
                    let func = self.store.func(addr).ok_or(Trap::UnreachableExecuted)?;
                    let expected =
                        self.module.func_type(type_idx).ok_or(Trap::UnreachableExecuted)?;
                    if func.ty() != expected {
                        return Err(Trap::IndirectCallTypeMismatch);
                    }
                    if self.call_func(addr, tail)? {
                        return Ok(());
                    }
                    continue 'dispatch;
                }
                Instruction::CallRef(_) | Instruction::ReturnCallRef(_) => {
                    let tail = matches!(instr, Instruction::ReturnCallRef(_));
                    let addr = match self.sm.pop_ref()? {
                        Ref::Null(_) => return Err(Trap::NullReference),
                        Ref::Func(addr) => addr,
                        _ => return Err(Trap::UnreachableExecuted),
                    };
                    if self.call_func(addr, tail)? {
                        return Ok(());
                    }
                    continue 'dispatch;
                }
                Instruction::TryTable { ref ty, ref catches } => {
                    let (params, results) = block_arities(&self.module, ty)?;
                    let targets =
                        *self.code.targets.get(&self.pc).ok_or(Trap::UnreachableExecuted)?;
                    let mut handlers = Vec::with_capacity(catches.len());
                    for clause in catches {
                        let (tag, label, capture_exn) = match *clause {
                            CatchClause::One { tag, label } => {
                                (Some(self.module.tag_addr(tag)), label, false)
                            }
                            CatchClause::OneRef { tag, label } => {
                                (Some(self.module.tag_addr(tag)), label, true)
                            }
                            CatchClause::All { label } => (None, label, false),
                            CatchClause::AllRef { label } => (None, label, true),
                        };
                        let tag = match tag {
                            Some(resolved) => Some(resolved.ok_or(Trap::UnreachableExecuted)?),
                            None => None,
                        };
                        handlers.push(Handler { tag, label, capture_exn });
                    }
                    self.sm.push_label(Label {
                        kind: LabelKind::Try,
                        arity: results,
                        height: self.sm.values.len() - params,
                        continuation: targets.end_ip + 1,
                        handlers,
                    });
                }
                Instruction::Throw(tag_idx) => {
                    let tag = self.module.tag_addr(tag_idx).ok_or(Trap::UnreachableExecuted)?;
                    let arity = self
                        .store
                        .tag(tag)
                        .ok_or(Trap::UnreachableExecuted)?
                        .param_count();
                    let payload = self.sm.pop_n(arity)?;
                    if self.throw(Arc::new(Exception { tag, payload }))? {
                        return Ok(());
                    }
                    continue 'dispatch;
                }
                Instruction::ThrowRef => match self.sm.pop_ref()? {
                    Ref::Null(_) => return Err(Trap::NullReference),
                    Ref::Exn(exn) => {
                        if self.throw(exn)? {
                            return Ok(());
                        }
                        continue 'dispatch;
                    }
                    _ => return Err(Trap::UnreachableExecuted),
                },

                // ===== parametric =====
                Instruction::Drop => {
                    self.sm.pop()?;
                }
                Instruction::Select | Instruction::SelectT(_) => {
                    let cond = self.sm.pop_i32()?;
                    let v2 = self.sm.pop()?;
                    let v1 = self.sm.pop()?;
                    self.sm.push(if cond != 0 { v1 } else { v2 });
                }

                // ===== variable =====
                Instruction::LocalGet(idx) => {
                    let v = self.sm.local_get(self.locals_base, idx)?;
                    self.sm.push(v);
                }
                Instruction::LocalSet(idx) => {
                    let v = self.sm.pop()?;
                    self.sm.local_set(self.locals_base, idx, v)?;
                }
                Instruction::LocalTee(idx) => {
                    let v = self.sm.peek().cloned().ok_or(Trap::UnreachableExecuted)?;
                    self.sm.local_set(self.locals_base, idx, v)?;
                }
                Instruction::GlobalGet(idx) => {
                    let addr = self.module.global_addr(idx).ok_or(Trap::UnreachableExecuted)?;
                    let g = self.store.global(addr).ok_or(Trap::UnreachableExecuted)?;
                    self.sm.push(g.get());
                }
                Instruction::GlobalSet(idx) => {
                    let addr = self.module.global_addr(idx).ok_or(Trap::UnreachableExecuted)?;
                    let g = self.store.global(addr).ok_or(Trap::UnreachableExecuted)?;
                    g.set(self.sm.pop()?);
                }

                // ===== reference =====
                Instruction::RefNull(heap) => {
                    // Defined types resolve to the bottom of their own
                    // hierarchy (nofunc for function types).
                    let bottom = match heap {
                        crate::ast::types::HeapType::Defined(idx) => {
                            match self.module.composite_type(idx) {
                                Some(crate::ast::types::CompositeType::Func(_)) => {
                                    crate::ast::types::HeapType::NoFunc
                                }
                                _ => crate::ast::types::HeapType::None,
                            }
                        }
                        other => other.bottom(),
                    };
                    self.sm.push(Value::Ref(Ref::Null(bottom)));
                }
                Instruction::RefIsNull => {
                    let r = self.sm.pop_ref()?;
                    self.sm.push_bool(r.is_null());
                }
                Instruction::RefFunc(idx) => {
                    let addr = self.module.func_addr(idx).ok_or(Trap::UnreachableExecuted)?;
                    self.sm.push(Value::Ref(Ref::Func(addr)));
                }
                Instruction::RefEq => {
                    let b = self.sm.pop_ref()?;
                    let a = self.sm.pop_ref()?;
                    self.sm.push_bool(a.ref_eq(&b));
                }
                Instruction::RefAsNonNull => {
                    let r = self.sm.pop_ref()?;
                    if r.is_null() {
                        return Err(Trap::NullReference);
                    }
                    self.sm.push(Value::Ref(r));
                }
                Instruction::BrOnNull(depth) => {
                    let r = self.sm.pop_ref()?;
                    if r.is_null() {
                        if self.branch(depth)? {
                            return Ok(());
                        }
                        continue 'dispatch;
                    }
                    self.sm.push(Value::Ref(r));
                }
                Instruction::BrOnNonNull(depth) => {
                    let r = self.sm.pop_ref()?;
                    if !r.is_null() {
                        self.sm.push(Value::Ref(r));
                        if self.branch(depth)? {
                            return Ok(());
                        }
                        continue 'dispatch;
                    }
                }
                Instruction::RefTest(rt) => {
                    let r = self.sm.pop_ref()?;
                    self.sm
                        .push_bool(gc_ops::ref_matches(self.store, &self.module, &r, &rt));
                }
                Instruction::RefCast(rt) => {
                    let r = self.sm.pop_ref()?;
                    if !gc_ops::ref_matches(self.store, &self.module, &r, &rt) {
                        return Err(Trap::CastFailure);
                    }
                    self.sm.push(Value::Ref(r));
                }
                Instruction::BrOnCast { label, to, .. }
                | Instruction::BrOnCastFail { label, to, .. } => {
                    let on_fail = matches!(instr, Instruction::BrOnCastFail { .. });
                    let r = self.sm.pop_ref()?;
                    let matched = gc_ops::ref_matches(self.store, &self.module, &r, &to);
                    self.sm.push(Value::Ref(r));
                    if matched != on_fail {
                        if self.branch(label)? {
                            return Ok(());
                        }
                        continue 'dispatch;
                    }
                }
                Instruction::AnyConvertExtern | Instruction::ExternConvertAny => {
                    // Conversions between the extern and any hierarchies keep
                    // the underlying referent.
                    let r = self.sm.pop_ref()?;
                    self.sm.push(Value::Ref(r));
                }
                Instruction::RefI31 => {
                    let x = self.sm.pop_i32()?;
                    self.sm.push(Value::Ref(Ref::I31((x as u32) & 0x7FFF_FFFF)));
                }
                Instruction::I31Get(sign) => match self.sm.pop_ref()? {
                    Ref::Null(_) => return Err(Trap::NullReference),
                    Ref::I31(x) => {
                        let v = match sign {
                            Sign::S => ((x << 1) as i32) >> 1,
                            Sign::U => x as i32,
                        };
                        self.sm.push(Value::I32(v));
                    }
                    _ => return Err(Trap::UnreachableExecuted),
                },

                // ===== gc =====
                Instruction::StructNew(type_idx) => {
                    let count = match self.module.composite_type(type_idx) {
                        Some(crate::ast::types::CompositeType::Struct(st)) => st.fields.len(),
                        _ => return Err(Trap::UnreachableExecuted),
                    };
                    let args = self.sm.pop_n(count)?;
                    let r = gc_ops::struct_new(self.store, &self.module, type_idx, args)?;
                    self.sm.push(Value::Ref(r));
                }
                Instruction::StructNewDefault(type_idx) => {
                    let r = gc_ops::struct_new_default(self.store, &self.module, type_idx)?;
                    self.sm.push(Value::Ref(r));
                }
                Instruction::StructGet { type_idx, field, sign } => {
                    let r = self.sm.pop_ref()?;
                    let v =
                        gc_ops::struct_get(self.store, &self.module, &r, type_idx, field, sign)?;
                    self.sm.push(v);
                }
                Instruction::StructSet { type_idx, field } => {
                    let val = self.sm.pop()?;
                    let r = self.sm.pop_ref()?;
                    gc_ops::struct_set(self.store, &self.module, &r, type_idx, field, val)?;
                }
                Instruction::ArrayNew(type_idx) => {
                    let len = self.sm.pop_i32()? as u32;
                    let fill = self.sm.pop()?;
                    let r = gc_ops::array_new(self.store, &self.module, type_idx, len, fill)?;
                    self.sm.push(Value::Ref(r));
                }
                Instruction::ArrayNewDefault(type_idx) => {
                    let len = self.sm.pop_i32()? as u32;
                    let fill = match self.module.composite_type(type_idx) {
                        Some(crate::ast::types::CompositeType::Array(at)) => {
                            Value::default_for_storage(&at.field.storage)
                        }
                        _ => return Err(Trap::UnreachableExecuted),
                    };
                    let r = gc_ops::array_new(self.store, &self.module, type_idx, len, fill)?;
                    self.sm.push(Value::Ref(r));
                }
                Instruction::ArrayNewFixed { type_idx, len } => {
                    let vals = self.sm.pop_n(len as usize)?;
                    let r = gc_ops::array_new_fixed(self.store, &self.module, type_idx, vals)?;
                    self.sm.push(Value::Ref(r));
                }
                Instruction::ArrayNewData { type_idx, data } => {
                    let len = self.sm.pop_i32()? as u32;
                    let start = self.sm.pop_i32()? as u32;
                    let bytes = self.data(data)?.bytes();
                    let r = gc_ops::array_new_data(
                        self.store,
                        &self.module,
                        type_idx,
                        &bytes,
                        start,
                        len,
                    )?;
                    self.sm.push(Value::Ref(r));
                }
                Instruction::ArrayNewElem { type_idx, elem } => {
                    let len = self.sm.pop_i32()? as u32;
                    let start = self.sm.pop_i32()? as u32;
                    let items = self.elem(elem)?.items();
                    let r = gc_ops::array_new_elem(
                        self.store,
                        &self.module,
                        type_idx,
                        &items,
                        start,
                        len,
                    )?;
                    self.sm.push(Value::Ref(r));
                }
                Instruction::ArrayGet { type_idx, sign } => {
                    let idx = self.sm.pop_i32()? as u32;
                    let r = self.sm.pop_ref()?;
                    let v = gc_ops::array_get(self.store, &self.module, &r, type_idx, idx, sign)?;
                    self.sm.push(v);
                }
                Instruction::ArraySet(type_idx) => {
                    let val = self.sm.pop()?;
                    let idx = self.sm.pop_i32()? as u32;
                    let r = self.sm.pop_ref()?;
                    gc_ops::array_set(self.store, &self.module, &r, type_idx, idx, val)?;
                }
                Instruction::ArrayLen => {
                    let r = self.sm.pop_ref()?;
                    let len = gc_ops::array_len(self.store, &r)?;
                    self.sm.push(Value::I32(len as i32));
                }
                Instruction::ArrayFill(type_idx) => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32;
                    let val = self.sm.pop()?;
                    let dst = self.sm.pop_i32()? as u32;
                    let r = self.sm.pop_ref()?;
                    gc_ops::array_fill(self.store, &self.module, &r, type_idx, dst, val, len)?;
                }
                Instruction::ArrayCopy { dst, src } => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32;
                    let src_idx = self.sm.pop_i32()? as u32;
                    let src_ref = self.sm.pop_ref()?;
                    let dst_idx = self.sm.pop_i32()? as u32;
                    let dst_ref = self.sm.pop_ref()?;
                    gc_ops::array_copy(
                        self.store,
                        &self.module,
                        &dst_ref,
                        dst,
                        dst_idx,
                        &src_ref,
                        src,
                        src_idx,
                        len,
                    )?;
                }
                Instruction::ArrayInitData { type_idx, data } => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32;
                    let src = self.sm.pop_i32()? as u32;
                    let dst = self.sm.pop_i32()? as u32;
                    let r = self.sm.pop_ref()?;
                    let bytes = self.data(data)?.bytes();
                    gc_ops::array_init_data(
                        self.store,
                        &self.module,
                        &r,
                        type_idx,
                        &bytes,
                        dst,
                        src,
                        len,
                    )?;
                }
                Instruction::ArrayInitElem { elem, .. } => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32;
                    let src = self.sm.pop_i32()? as u32;
                    let dst = self.sm.pop_i32()? as u32;
                    let r = self.sm.pop_ref()?;
                    let items = self.elem(elem)?.items();
                    gc_ops::array_init_elem(self.store, &r, &items, dst, src, len)?;
                }

                // ===== table =====
                Instruction::TableGet(idx) => {
                    let i = self.sm.pop_i32()? as u32;
                    let r = self.table(idx)?.get(i)?;
                    self.sm.push(Value::Ref(r));
                }
                Instruction::TableSet(idx) => {
                    let r = self.sm.pop_ref()?;
                    let i = self.sm.pop_i32()? as u32;
                    self.table(idx)?.set(i, r)?;
                }
                Instruction::TableInit { table, elem } => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32;
                    let src = self.sm.pop_i32()? as u32;
                    let dst = self.sm.pop_i32()? as u32;
                    let items = self.elem(elem)?.items();
                    self.table(table)?.init_from(dst, &items, src, len)?;
                }
                Instruction::ElemDrop(idx) => {
                    self.elem(idx)?.drop_payload();
                }
                Instruction::TableCopy { dst, src } => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32;
                    let s = self.sm.pop_i32()? as u32;
                    let d = self.sm.pop_i32()? as u32;
                    let dst_table = self.table(dst)?;
                    let src_table = self.table(src)?;
                    dst_table.copy_from(d, &src_table, s, len)?;
                }
                Instruction::TableGrow(idx) => {
                    let n = self.sm.pop_i32()? as u32;
                    let init = self.sm.pop_ref()?;
                    let result = match self.table(idx)?.grow(n, init) {
                        Some(prev) => prev as i32,
                        None => -1,
                    };
                    self.sm.push(Value::I32(result));
                }
                Instruction::TableSize(idx) => {
                    let size = self.table(idx)?.size();
                    self.sm.push(Value::I32(size as i32));
                }
                Instruction::TableFill(idx) => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32;
                    let r = self.sm.pop_ref()?;
                    let dst = self.sm.pop_i32()? as u32;
                    self.table(idx)?.fill(dst, r, len)?;
                }

                // ===== memory =====
                Instruction::Load { ty, packed, memarg } => {
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    let v = match (ty, packed) {
                        (NumType::I32, None) => Value::I32(mem.load_u32(addr)? as i32),
                        (NumType::I64, None) => Value::I64(mem.load_u64(addr)? as i64),
                        (NumType::F32, None) => Value::F32(mem.load_u32(addr)?),
                        (NumType::F64, None) => Value::F64(mem.load_u64(addr)?),
                        (NumType::I32, Some(PackedLoad { bits: 8, sign: Sign::S })) => {
                            Value::I32(mem.load_u8(addr)? as i8 as i32)
                        }
                        (NumType::I32, Some(PackedLoad { bits: 8, sign: Sign::U })) => {
                            Value::I32(mem.load_u8(addr)? as i32)
                        }
                        (NumType::I32, Some(PackedLoad { bits: 16, sign: Sign::S })) => {
                            Value::I32(mem.load_u16(addr)? as i16 as i32)
                        }
                        (NumType::I32, Some(PackedLoad { bits: 16, sign: Sign::U })) => {
                            Value::I32(mem.load_u16(addr)? as i32)
                        }
                        (NumType::I64, Some(PackedLoad { bits: 8, sign: Sign::S })) => {
                            Value::I64(mem.load_u8(addr)? as i8 as i64)
                        }
                        (NumType::I64, Some(PackedLoad { bits: 8, sign: Sign::U })) => {
                            Value::I64(mem.load_u8(addr)? as i64)
                        }
                        (NumType::I64, Some(PackedLoad { bits: 16, sign: Sign::S })) => {
                            Value::I64(mem.load_u16(addr)? as i16 as i64)
                        }
                        (NumType::I64, Some(PackedLoad { bits: 16, sign: Sign::U })) => {
                            Value::I64(mem.load_u16(addr)? as i64)
                        }
                        (NumType::I64, Some(PackedLoad { bits: 32, sign: Sign::S })) => {
                            Value::I64(mem.load_u32(addr)? as i32 as i64)
                        }
                        (NumType::I64, Some(PackedLoad { bits: 32, sign: Sign::U })) => {
                            Value::I64(mem.load_u32(addr)? as i64)
                        }
                        _ => return Err(Trap::UnreachableExecuted),
                    };
                    self.sm.push(v);
                }
                Instruction::Store { ty, bits, memarg } => {
                    let v = self.sm.pop()?;
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    match (ty, bits, v) {
                        (NumType::I32, None, Value::I32(x)) => mem.store_u32(addr, x as u32)?,
                        (NumType::I64, None, Value::I64(x)) => mem.store_u64(addr, x as u64)?,
                        (NumType::F32, None, Value::F32(b)) => mem.store_u32(addr, b)?,
                        (NumType::F64, None, Value::F64(b)) => mem.store_u64(addr, b)?,
                        (NumType::I32, Some(8), Value::I32(x)) => mem.store_u8(addr, x as u8)?,
                        (NumType::I32, Some(16), Value::I32(x)) => mem.store_u16(addr, x as u16)?,
                        (NumType::I64, Some(8), Value::I64(x)) => mem.store_u8(addr, x as u8)?,
                        (NumType::I64, Some(16), Value::I64(x)) => mem.store_u16(addr, x as u16)?,
                        (NumType::I64, Some(32), Value::I64(x)) => mem.store_u32(addr, x as u32)?,
                        _ => return Err(Trap::UnreachableExecuted),
                    }
                }
                Instruction::MemorySize(idx) => {
                    let (_, mem) = self.memory(idx)?;
                    self.sm.push(Value::I32(mem.size_pages() as i32));
                }
                Instruction::MemoryGrow(idx) => {
                    let delta = self.sm.pop_i32()? as u32;
                    let (_, mem) = self.memory(idx)?;
                    let result = match mem.grow(delta) {
                        Some(prev) => prev as i32,
                        None => -1,
                    };
                    self.sm.push(Value::I32(result));
                }
                Instruction::MemoryInit { data, mem } => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32 as u64;
                    let src = self.sm.pop_i32()? as u32 as u64;
                    let dst = self.sm.pop_i32()? as u32 as u64;
                    let bytes = self.data(data)?.bytes();
                    let (_, mem) = self.memory(mem)?;
                    mem.init_from(dst, &bytes, src, len)?;
                }
                Instruction::DataDrop(idx) => {
                    self.data(idx)?.drop_payload();
                }
                Instruction::MemoryCopy { dst, src } => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32 as u64;
                    let s = self.sm.pop_i32()? as u32 as u64;
                    let d = self.sm.pop_i32()? as u32 as u64;
                    let (_, dst_mem) = self.memory(dst)?;
                    let (_, src_mem) = self.memory(src)?;
                    dst_mem.copy_from(d, &src_mem, s, len)?;
                }
                Instruction::MemoryFill(idx) => {
                    self.check_stop()?;
                    let len = self.sm.pop_i32()? as u32 as u64;
                    let val = self.sm.pop_i32()? as u8;
                    let dst = self.sm.pop_i32()? as u32 as u64;
                    let (_, mem) = self.memory(idx)?;
                    mem.fill(dst, val, len)?;
                }

                // ===== numeric =====
                Instruction::I32Const(v) => self.sm.push(Value::I32(v)),
                Instruction::I64Const(v) => self.sm.push(Value::I64(v)),
                Instruction::F32Const(bits) => self.sm.push(Value::F32(bits)),
                Instruction::F64Const(bits) => self.sm.push(Value::F64(bits)),
                Instruction::IUnop { w: IWidth::W32, op } => {
                    let x = self.sm.pop_i32()?;
                    self.sm.push(Value::I32(iunop32(op, x)));
                }
                Instruction::IUnop { w: IWidth::W64, op } => {
                    let x = self.sm.pop_i64()?;
                    self.sm.push(Value::I64(iunop64(op, x)));
                }
                Instruction::IBinop { w: IWidth::W32, op } => {
                    let b = self.sm.pop_i32()?;
                    let a = self.sm.pop_i32()?;
                    self.sm.push(Value::I32(ibinop32(op, a, b)?));
                }
                Instruction::IBinop { w: IWidth::W64, op } => {
                    let b = self.sm.pop_i64()?;
                    let a = self.sm.pop_i64()?;
                    self.sm.push(Value::I64(ibinop64(op, a, b)?));
                }
                Instruction::ITestop(IWidth::W32) => {
                    let x = self.sm.pop_i32()?;
                    self.sm.push_bool(x == 0);
                }
                Instruction::ITestop(IWidth::W64) => {
                    let x = self.sm.pop_i64()?;
                    self.sm.push_bool(x == 0);
                }
                Instruction::IRelop { w: IWidth::W32, op } => {
                    let b = self.sm.pop_i32()?;
                    let a = self.sm.pop_i32()?;
                    self.sm.push_bool(irelop32(op, a, b));
                }
                Instruction::IRelop { w: IWidth::W64, op } => {
                    let b = self.sm.pop_i64()?;
                    let a = self.sm.pop_i64()?;
                    self.sm.push_bool(irelop64(op, a, b));
                }
                Instruction::FUnop { w: FWidth::W32, op } => {
                    let x = f32::from_bits(self.sm.pop_f32_bits()?);
                    self.sm.push(Value::F32(funop32(op, x).to_bits()));
                }
                Instruction::FUnop { w: FWidth::W64, op } => {
                    let x = f64::from_bits(self.sm.pop_f64_bits()?);
                    self.sm.push(Value::F64(funop64(op, x).to_bits()));
                }
                Instruction::FBinop { w: FWidth::W32, op } => {
                    let b = f32::from_bits(self.sm.pop_f32_bits()?);
                    let a = f32::from_bits(self.sm.pop_f32_bits()?);
                    self.sm.push(Value::F32(fbinop32(op, a, b).to_bits()));
                }
                Instruction::FBinop { w: FWidth::W64, op } => {
                    let b = f64::from_bits(self.sm.pop_f64_bits()?);
                    let a = f64::from_bits(self.sm.pop_f64_bits()?);
                    self.sm.push(Value::F64(fbinop64(op, a, b).to_bits()));
                }
                Instruction::FRelop { w: FWidth::W32, op } => {
                    let b = f32::from_bits(self.sm.pop_f32_bits()?) as f64;
                    let a = f32::from_bits(self.sm.pop_f32_bits()?) as f64;
                    self.sm.push_bool(frelop(op, a, b));
                }
                Instruction::FRelop { w: FWidth::W64, op } => {
                    let b = f64::from_bits(self.sm.pop_f64_bits()?);
                    let a = f64::from_bits(self.sm.pop_f64_bits()?);
                    self.sm.push_bool(frelop(op, a, b));
                }
                Instruction::Cvtop(op) => self.cvt(op)?,

                // ===== vector =====
                Instruction::V128Const(v) => self.sm.push(Value::V128(v)),
                Instruction::V128Load(memarg) => {
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    self.sm.push(Value::V128(mem.load_u128(addr)?));
                }
                Instruction::V128Store(memarg) => {
                    let v = self.sm.pop_v128()?;
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    mem.store_u128(addr, v)?;
                }
                Instruction::V128LoadExtend { from_bits, sign, memarg } => {
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    let mut bytes = [0u8; 8];
                    mem.read(addr, &mut bytes)?;
                    self.sm.push(Value::V128(simd::load_extend(from_bits, sign, bytes)));
                }
                Instruction::V128LoadSplat { bits, memarg } => {
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    let size = bits as usize / 8;
                    let mut scalar = [0u8; 8];
                    mem.read(addr, &mut scalar[..size])?;
                    let mut out = [0u8; 16];
                    for chunk in out.chunks_exact_mut(size) {
                        chunk.copy_from_slice(&scalar[..size]);
                    }
                    self.sm.push(Value::V128(u128::from_le_bytes(out)));
                }
                Instruction::V128LoadZero { bits, memarg } => {
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    let size = bits as usize / 8;
                    let mut out = [0u8; 16];
                    mem.read(addr, &mut out[..size])?;
                    self.sm.push(Value::V128(u128::from_le_bytes(out)));
                }
                Instruction::V128LoadLane { bits, lane, memarg } => {
                    let v = self.sm.pop_v128()?;
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    let size = bits as usize / 8;
                    let mut bytes = [0u8; 8];
                    mem.read(addr, &mut bytes[..size])?;
                    self.sm.push(Value::V128(simd::replace_lane_bytes(
                        v,
                        lane as usize,
                        &bytes[..size],
                    )));
                }
                Instruction::V128StoreLane { bits, lane, memarg } => {
                    let v = self.sm.pop_v128()?;
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    let size = bits as usize / 8;
                    let bytes = simd::extract_lane_bytes(v, lane as usize, size);
                    mem.write(addr, &bytes[..size])?;
                }
                Instruction::I8x16Shuffle(idx) => {
                    let b = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::shuffle(a, b, &idx)));
                }
                Instruction::I8x16Swizzle => {
                    let s = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::swizzle(a, s)));
                }
                Instruction::Splat(shape) => {
                    let v = self.sm.pop()?;
                    self.sm.push(Value::V128(simd::splat(shape, &v)?));
                }
                Instruction::ExtractLane { shape, lane, sign } => {
                    let v = self.sm.pop_v128()?;
                    self.sm.push(simd::extract_lane(shape, lane, sign, v)?);
                }
                Instruction::ReplaceLane { shape, lane } => {
                    let x = self.sm.pop()?;
                    let v = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::replace_lane(shape, lane, v, &x)?));
                }
                Instruction::VIUnop { shape, op } => {
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::viunop(shape, op, a)));
                }
                Instruction::VIBinop { shape, op } => {
                    let b = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::vibinop(shape, op, a, b)));
                }
                Instruction::VIRelop { shape, op } => {
                    let b = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::virelop(shape, op, a, b)));
                }
                Instruction::VFUnop { shape, op } => {
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::vfunop(shape, op, a)));
                }
                Instruction::VFBinop { shape, op } => {
                    let b = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::vfbinop(shape, op, a, b)));
                }
                Instruction::VFRelop { shape, op } => {
                    let b = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::vfrelop(shape, op, a, b)));
                }
                Instruction::VShift { shape, op } => {
                    let count = self.sm.pop_i32()? as u32;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::vshift(shape, op, a, count)));
                }
                Instruction::VVOp(op) => match op {
                    VVOp::Not => {
                        let a = self.sm.pop_v128()?;
                        self.sm.push(Value::V128(simd::vv_not(a)));
                    }
                    VVOp::Bitselect => {
                        let mask = self.sm.pop_v128()?;
                        let b = self.sm.pop_v128()?;
                        let a = self.sm.pop_v128()?;
                        self.sm.push(Value::V128(simd::vv_bitselect(a, b, mask)));
                    }
                    _ => {
                        let b = self.sm.pop_v128()?;
                        let a = self.sm.pop_v128()?;
                        let r = match op {
                            VVOp::And => simd::vv_and(a, b),
                            VVOp::AndNot => simd::vv_andnot(a, b),
                            VVOp::Or => simd::vv_or(a, b),
                            VVOp::Xor => simd::vv_xor(a, b),
                            _ => return Err(Trap::UnreachableExecuted),
                        };
                        self.sm.push(Value::V128(r));
                    }
                },
                Instruction::AnyTrue => {
                    let a = self.sm.pop_v128()?;
                    self.sm.push_bool(simd::any_true(a));
                }
                Instruction::AllTrue(shape) => {
                    let a = self.sm.pop_v128()?;
                    self.sm.push_bool(simd::all_true(shape, a));
                }
                Instruction::Bitmask(shape) => {
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::I32(simd::bitmask(shape, a)));
                }
                Instruction::Narrow { from, sign } => {
                    let b = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::narrow(from, sign, a, b)));
                }
                Instruction::Extend { to, half, sign } => {
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::extend(to, half, sign, a)));
                }
                Instruction::ExtAddPairwise { to, sign } => {
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::extadd_pairwise(to, sign, a)));
                }
                Instruction::ExtMul { to, half, sign } => {
                    let b = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::extmul(to, half, sign, a, b)));
                }
                Instruction::Q15MulrSat => {
                    let b = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::q15mulr_sat(a, b)));
                }
                Instruction::DotI16x8 => {
                    let b = self.sm.pop_v128()?;
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::dot_i16x8(a, b)));
                }
                Instruction::VCvt(op) => {
                    let a = self.sm.pop_v128()?;
                    self.sm.push(Value::V128(simd::vcvt(op, a)));
                }
                Instruction::Relaxed(op) => match op {
                    RelaxedOp::TruncF32x4 { .. } | RelaxedOp::TruncF64x2Zero { .. } => {
                        let a = self.sm.pop_v128()?;
                        self.sm.push(Value::V128(simd::relaxed_unop(op, a)));
                    }
                    RelaxedOp::MaddF32x4
                    | RelaxedOp::NmaddF32x4
                    | RelaxedOp::MaddF64x2
                    | RelaxedOp::NmaddF64x2
                    | RelaxedOp::Laneselect(_)
                    | RelaxedOp::DotI8x16I7x16AddS => {
                        let c = self.sm.pop_v128()?;
                        let b = self.sm.pop_v128()?;
                        let a = self.sm.pop_v128()?;
                        self.sm.push(Value::V128(simd::relaxed_ternop(op, a, b, c)));
                    }
                    _ => {
                        let b = self.sm.pop_v128()?;
                        let a = self.sm.pop_v128()?;
                        self.sm.push(Value::V128(simd::relaxed_binop(op, a, b)));
                    }
                },

                // ===== atomics =====
                Instruction::MemoryAtomicNotify(memarg) => {
                    let count = self.sm.pop_i32()? as u32;
                    let idx = self.sm.pop_i32()? as u32 as u64;
                    let (mem_addr, mem) = self.memory(memarg.mem)?;
                    let addr = idx + memarg.offset;
                    // Validate the access like an atomic load of the cell.
                    mem.atomic_load(addr, 4)?;
                    let woken = self.exec.waiters().notify(mem_addr, addr, count);
                    self.sm.push(Value::I32(woken as i32));
                }
                Instruction::MemoryAtomicWait32(memarg) => {
                    let timeout = self.sm.pop_i64()?;
                    let expected = self.sm.pop_i32()? as u32 as u64;
                    let idx = self.sm.pop_i32()? as u32 as u64;
                    let (mem_addr, mem) = self.memory(memarg.mem)?;
                    let addr = idx + memarg.offset;
                    let r = self.exec.waiters().wait(
                        mem_addr,
                        &mem,
                        addr,
                        expected,
                        4,
                        timeout,
                        self.exec.stop_token(),
                        self.entry_epoch,
                    )?;
                    self.sm.push(Value::I32(r as i32));
                }
                Instruction::MemoryAtomicWait64(memarg) => {
                    let timeout = self.sm.pop_i64()?;
                    let expected = self.sm.pop_i64()? as u64;
                    let idx = self.sm.pop_i32()? as u32 as u64;
                    let (mem_addr, mem) = self.memory(memarg.mem)?;
                    let addr = idx + memarg.offset;
                    let r = self.exec.waiters().wait(
                        mem_addr,
                        &mem,
                        addr,
                        expected,
                        8,
                        timeout,
                        self.exec.stop_token(),
                        self.entry_epoch,
                    )?;
                    self.sm.push(Value::I32(r as i32));
                }
                Instruction::AtomicFence => {
                    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
                }
                Instruction::AtomicLoad { w, bits, memarg } => {
                    let size = bits.map(|b| b as usize / 8).unwrap_or(match w {
                        IWidth::W32 => 4,
                        IWidth::W64 => 8,
                    });
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    let v = mem.atomic_load(addr, size)?;
                    self.sm.push(match w {
                        IWidth::W32 => Value::I32(v as u32 as i32),
                        IWidth::W64 => Value::I64(v as i64),
                    });
                }
                Instruction::AtomicStore { w, bits, memarg } => {
                    let size = bits.map(|b| b as usize / 8).unwrap_or(match w {
                        IWidth::W32 => 4,
                        IWidth::W64 => 8,
                    });
                    let v = match w {
                        IWidth::W32 => self.sm.pop_i32()? as u32 as u64,
                        IWidth::W64 => self.sm.pop_i64()? as u64,
                    };
                    let (mem, addr) = self.mem_and_addr(&memarg)?;
                    mem.atomic_store(addr, size, v)?;
                }
                Instruction::AtomicRmw { w, bits, op, memarg } => {
                    let size = bits.map(|b| b as usize / 8).unwrap_or(match w {
                        IWidth::W32 => 4,
                        IWidth::W64 => 8,
                    });
                    let mask = width_mask(size);
                    let pop_operand = |sm: &mut StackManager| -> Result<u64, Trap> {
                        Ok(match w {
                            IWidth::W32 => sm.pop_i32()? as u32 as u64,
                            IWidth::W64 => sm.pop_i64()? as u64,
                        })
                    };
                    let old = match op {
                        RmwOp::Cmpxchg => {
                            let replacement = pop_operand(&mut *self.sm)? & mask;
                            let expected = pop_operand(&mut *self.sm)? & mask;
                            let (mem, addr) = self.mem_and_addr(&memarg)?;
                            mem.atomic_rmw(addr, size, |old| {
                                if old == expected {
                                    replacement
                                } else {
                                    old
                                }
                            })?
                        }
                        _ => {
                            let operand = pop_operand(&mut *self.sm)? & mask;
                            let (mem, addr) = self.mem_and_addr(&memarg)?;
                            mem.atomic_rmw(addr, size, |old| match op {
                                RmwOp::Add => (old.wrapping_add(operand)) & mask,
                                RmwOp::Sub => (old.wrapping_sub(operand)) & mask,
                                RmwOp::And => old & operand,
                                RmwOp::Or => old | operand,
                                RmwOp::Xor => old ^ operand,
                                RmwOp::Xchg => operand,
                                RmwOp::Cmpxchg => old,
                            })?
                        }
                    };
                    self.sm.push(match w {
                        IWidth::W32 => Value::I32(old as u32 as i32),
                        IWidth::W64 => Value::I64(old as i64),
                    });
                }
            }
            self.pc += 1;
        }
    }

    fn cvt(&mut self, op: CvtOp) -> Result<(), Trap> {
        use crate::vm::numeric as n;
        let v = match op {
            CvtOp::I32WrapI64 => Value::I32(self.sm.pop_i64()? as i32),
            CvtOp::I64ExtendI32 { sign: Sign::S } => Value::I64(self.sm.pop_i32()? as i64),
            CvtOp::I64ExtendI32 { sign: Sign::U } => {
                Value::I64(self.sm.pop_i32()? as u32 as i64)
            }
            CvtOp::ITruncF { int, float, sign } => {
                let x64 = match float {
                    FWidth::W32 => f32::from_bits(self.sm.pop_f32_bits()?) as f64,
                    FWidth::W64 => f64::from_bits(self.sm.pop_f64_bits()?),
                };
                match (int, sign) {
                    (IWidth::W32, Sign::S) => Value::I32(n::trunc_f64_to_i32(x64)?),
                    (IWidth::W32, Sign::U) => Value::I32(n::trunc_f64_to_u32(x64)? as i32),
                    (IWidth::W64, Sign::S) => Value::I64(n::trunc_f64_to_i64(x64)?),
                    (IWidth::W64, Sign::U) => Value::I64(n::trunc_f64_to_u64(x64)? as i64),
                }
            }
            CvtOp::ITruncSatF { int, float, sign } => {
                let x64 = match float {
                    FWidth::W32 => f32::from_bits(self.sm.pop_f32_bits()?) as f64,
                    FWidth::W64 => f64::from_bits(self.sm.pop_f64_bits()?),
                };
                match (int, sign) {
                    (IWidth::W32, Sign::S) => Value::I32(x64 as i32),
                    (IWidth::W32, Sign::U) => Value::I32((x64 as u32) as i32),
                    (IWidth::W64, Sign::S) => Value::I64(x64 as i64),
                    (IWidth::W64, Sign::U) => Value::I64((x64 as u64) as i64),
                }
            }
            // Converted straight from the integer: a f64 intermediate would
            // double-round large 64-bit inputs.
            CvtOp::FConvertI { float, int, sign } => match (float, int, sign) {
                (FWidth::W32, IWidth::W32, Sign::S) => {
                    Value::F32((self.sm.pop_i32()? as f32).to_bits())
                }
                (FWidth::W32, IWidth::W32, Sign::U) => {
                    Value::F32((self.sm.pop_i32()? as u32 as f32).to_bits())
                }
                (FWidth::W32, IWidth::W64, Sign::S) => {
                    Value::F32((self.sm.pop_i64()? as f32).to_bits())
                }
                (FWidth::W32, IWidth::W64, Sign::U) => {
                    Value::F32((self.sm.pop_i64()? as u64 as f32).to_bits())
                }
                (FWidth::W64, IWidth::W32, Sign::S) => {
                    Value::F64((self.sm.pop_i32()? as f64).to_bits())
                }
                (FWidth::W64, IWidth::W32, Sign::U) => {
                    Value::F64((self.sm.pop_i32()? as u32 as f64).to_bits())
                }
                (FWidth::W64, IWidth::W64, Sign::S) => {
                    Value::F64((self.sm.pop_i64()? as f64).to_bits())
                }
                (FWidth::W64, IWidth::W64, Sign::U) => {
                    Value::F64((self.sm.pop_i64()? as u64 as f64).to_bits())
                }
            },
            CvtOp::F32DemoteF64 => {
                Value::F32((f64::from_bits(self.sm.pop_f64_bits()?) as f32).to_bits())
            }
            CvtOp::F64PromoteF32 => {
                Value::F64((f32::from_bits(self.sm.pop_f32_bits()?) as f64).to_bits())
            }
            CvtOp::I32ReinterpretF32 => Value::I32(self.sm.pop_f32_bits()? as i32),
            CvtOp::I64ReinterpretF64 => Value::I64(self.sm.pop_f64_bits()? as i64),
            CvtOp::F32ReinterpretI32 => Value::F32(self.sm.pop_i32()? as u32),
            CvtOp::F64ReinterpretI64 => Value::F64(self.sm.pop_i64()? as u64),
        };
        self.sm.push(v);
        Ok(())
    }
}

// ===== entry points =====

impl Executor {
    /// Run a function instance to completion on a fresh activation of `sm`.
    /// Parameters are consumed from and results left on the value stack.
    pub(crate) fn run_function(
        &self,
        store: &Store,
        sm: &mut StackManager,
        addr: FuncAddr,
        entry_epoch: u64,
    ) -> Result<(), Trap> {
        let func = store.func(addr).ok_or(Trap::UnreachableExecuted)?;
        match func.kind() {
            FuncKind::Host { .. } => self.call_host(store, &func, None, sm),
            FuncKind::Compiled { .. } => self.call_compiled(store, addr, &func, sm, entry_epoch),
            FuncKind::Wasm { module, code } => {
                let module = store.module(*module).ok_or(Trap::UnreachableExecuted)?;
                let entry_frames = sm.frames.len();
                let locals_base =
                    push_activation(sm, module.clone(), func.ty(), code.clone())?;
                let code = code.clone();
                let mut vm = Vm {
                    exec: self,
                    store,
                    sm,
                    module,
                    code,
                    pc: 0,
                    locals_base,
                    entry_frames,
                    entry_epoch,
                };
                vm.run()
            }
        }
    }

    /// Invoke a host function: pops its parameters, invokes the pre/post
    /// hooks around the call, pushes the results.
    pub(crate) fn call_host(
        &self,
        store: &Store,
        func: &FunctionInstance,
        module: Option<Arc<ModuleInstance>>,
        sm: &mut StackManager,
    ) -> Result<(), Trap> {
        let FuncKind::Host { callable } = func.kind() else {
            return Err(Trap::UnreachableExecuted);
        };
        let params = sm.pop_n(func.ty().params.len())?;
        self.hooks().invoke_pre();
        let frame = CallingFrame::new(self, store, module);
        let result = callable.call(&frame, &params);
        self.hooks().invoke_post();
        let results = result.map_err(Trap::Host)?;
        if results.len() != func.ty().results.len() {
            return Err(Trap::IndirectCallTypeMismatch);
        }
        for (v, ty) in results.into_iter().zip(&func.ty().results) {
            sm.push(clean_numeric(v, ty));
        }
        Ok(())
    }

    /// Evaluate a constant initializer expression on a throwaway stack, in
    /// the context of (a possibly still partial) `module`.
    pub(crate) fn eval_const(
        &self,
        store: &Store,
        module: &Arc<ModuleInstance>,
        instrs: &[Instruction],
    ) -> Result<Value, Trap> {
        let mut stack: Vec<Value> = Vec::with_capacity(4);
        for instr in instrs {
            match instr {
                Instruction::I32Const(v) => stack.push(Value::I32(*v)),
                Instruction::I64Const(v) => stack.push(Value::I64(*v)),
                Instruction::F32Const(b) => stack.push(Value::F32(*b)),
                Instruction::F64Const(b) => stack.push(Value::F64(*b)),
                Instruction::V128Const(v) => stack.push(Value::V128(*v)),
                Instruction::RefNull(heap) => stack.push(Value::Ref(Ref::null(*heap))),
                Instruction::RefFunc(idx) => {
                    let addr = module.func_addr(*idx).ok_or(Trap::UnreachableExecuted)?;
                    stack.push(Value::Ref(Ref::Func(addr)));
                }
                Instruction::RefI31 => {
                    let x = match stack.pop() {
                        Some(Value::I32(x)) => x,
                        _ => return Err(Trap::UnreachableExecuted),
                    };
                    stack.push(Value::Ref(Ref::I31((x as u32) & 0x7FFF_FFFF)));
                }
                Instruction::GlobalGet(idx) => {
                    let addr = module.global_addr(*idx).ok_or(Trap::UnreachableExecuted)?;
                    let g = store.global(addr).ok_or(Trap::UnreachableExecuted)?;
                    stack.push(g.get());
                }
                Instruction::IBinop { w: IWidth::W32, op }
                    if matches!(op, IBinOp::Add | IBinOp::Sub | IBinOp::Mul) =>
                {
                    let (Some(Value::I32(b)), Some(Value::I32(a))) = (stack.pop(), stack.pop())
                    else {
                        return Err(Trap::UnreachableExecuted);
                    };
                    stack.push(Value::I32(ibinop32(*op, a, b)?));
                }
                Instruction::IBinop { w: IWidth::W64, op }
                    if matches!(op, IBinOp::Add | IBinOp::Sub | IBinOp::Mul) =>
                {
                    let (Some(Value::I64(b)), Some(Value::I64(a))) = (stack.pop(), stack.pop())
                    else {
                        return Err(Trap::UnreachableExecuted);
                    };
                    stack.push(Value::I64(ibinop64(*op, a, b)?));
                }
                Instruction::StructNew(type_idx) => {
                    let count = match module.composite_type(*type_idx) {
                        Some(crate::ast::types::CompositeType::Struct(st)) => st.fields.len(),
                        _ => return Err(Trap::UnreachableExecuted),
                    };
                    if stack.len() < count {
                        return Err(Trap::UnreachableExecuted);
                    }
                    let args = stack.split_off(stack.len() - count);
                    let r = gc_ops::struct_new(store, module, *type_idx, args)?;
                    stack.push(Value::Ref(r));
                }
                Instruction::StructNewDefault(type_idx) => {
                    let r = gc_ops::struct_new_default(store, module, *type_idx)?;
                    stack.push(Value::Ref(r));
                }
                Instruction::ArrayNewFixed { type_idx, len } => {
                    if stack.len() < *len as usize {
                        return Err(Trap::UnreachableExecuted);
                    }
                    let vals = stack.split_off(stack.len() - *len as usize);
                    let r = gc_ops::array_new_fixed(store, module, *type_idx, vals)?;
                    stack.push(Value::Ref(r));
                }
                Instruction::ArrayNewDefault(type_idx) => {
                    let len = match stack.pop() {
                        Some(Value::I32(x)) => x as u32,
                        _ => return Err(Trap::UnreachableExecuted),
                    };
                    let fill = match module.composite_type(*type_idx) {
                        Some(crate::ast::types::CompositeType::Array(at)) => {
                            Value::default_for_storage(&at.field.storage)
                        }
                        _ => return Err(Trap::UnreachableExecuted),
                    };
                    let r = gc_ops::array_new(store, module, *type_idx, len, fill)?;
                    stack.push(Value::Ref(r));
                }
                Instruction::AnyConvertExtern | Instruction::ExternConvertAny => {}
                Instruction::End => break,
                _ => return Err(Trap::UnreachableExecuted),
            }
        }
        stack.pop().ok_or(Trap::UnreachableExecuted)
    }
}
