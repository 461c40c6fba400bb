//! The instruction dispatch loop and the exception scheduler.
//!
//! Dispatch is the portable switch form: fetch the opcode byte, decode the
//! operands, advance the PC by the instruction's static size, execute. An
//! instruction that throws enters the scheduler, which walks the call-frame
//! chain for a catcher, unwinding as it goes.

use std::rc::Rc;

use crate::class::{ClassId, Metamethod};
use crate::error::{Exception, VmResult};
use crate::object::CellAddr;
use crate::opcode::{decode, Opcode, Operands};
use crate::operate::Operator;
use crate::value::{ObjId, Value, WEAKREF_UNWIRED};
use crate::vm::{FrameFlags, Vm};

/// Cached execution context, reloaded after anything that can change the
/// current frame (calls, returns, the scheduler).
pub(crate) struct ExecState {
    code: Rc<Vec<u8>>,
    function: ObjId,
    module: Option<ObjId>,
}

/// What an executed instruction wants next.
enum Step {
    /// Dispatch the next instruction.
    Next,
    /// Leave the dispatch loop; VM work is done for this entry.
    End,
    /// An exception value is set; run the scheduler.
    Reschedule,
}

/// Scheduler verdict.
enum Sched {
    /// Continue dispatching (context reloaded).
    Continue,
    /// Leave the loop with this outcome.
    Exit(VmResult<()>),
}

impl Vm {
    /// Rebuilds the cached context from the current frame. `None` when the
    /// current frame belongs to a native function (or there is none), which
    /// means control is back with the host.
    fn reload_context(&self) -> Option<ExecState> {
        let fr = self.current_frame()?;
        let f = self.function(fr.function).ok()?;
        let body = f.body()?;
        Some(ExecState {
            code: Rc::clone(&body.code),
            function: fr.function,
            module: f.module,
        })
    }

    /// Constant `i` of function `fo`.
    pub(crate) fn fconst(&self, fo: ObjId, i: usize) -> VmResult<Value> {
        let f = self.function(fo)?;
        let b = f.body().ok_or(Exception::Internal)?;
        b.constants.get(i).copied().ok_or(Exception::VmCheck)
    }

    fn static_get(&self, module: Option<ObjId>, i: usize) -> VmResult<Value> {
        let m = module.ok_or(Exception::VmCheck)?;
        self.module(m)?
            .variables
            .get(i)
            .copied()
            .ok_or(Exception::VmCheck)
    }

    fn static_set(&mut self, module: Option<ObjId>, i: usize, v: Value) -> VmResult<()> {
        let m = module.ok_or(Exception::VmCheck)?;
        let old = *self
            .module(m)?
            .variables
            .get(i)
            .ok_or(Exception::VmCheck)?;
        self.disown_value(old);
        let nv = self.copy_value(v, CellAddr::Static { module: m, slot: i });
        self.module_mut(m)?.variables[i] = nv;
        Ok(())
    }

    fn get_function_ref(&self, v: Value) -> VmResult<ObjId> {
        if !v.is_objref() {
            return Err(Exception::NeedObject);
        }
        let o = v.object().expect("objref");
        if self.object(o).classid != ClassId::FUNCTION {
            return Err(Exception::NeedCallable);
        }
        Ok(o)
    }

    /// Numeric view used by the loop instructions; objects go through the
    /// cast matrix.
    fn value_to_real(&mut self, v: &Value) -> VmResult<f64> {
        if let Some(r) = v.as_real() {
            return Ok(r);
        }
        match self.cast_value(v, ClassId::REAL)? {
            Value::Real(r) => Ok(r),
            _ => Err(Exception::WrongType),
        }
    }

    /// Runs the VM until the entry frame returns. `Ok(())` is normal
    /// completion; an uncaught exception surfaces as `Err`.
    pub fn run(&mut self) -> VmResult<()> {
        // Not interested in anything thrown outside the VM.
        let old = std::mem::replace(&mut self.exception, Value::Nil);
        self.disown_value(old);

        let mut st = match self.reload_context() {
            Some(st) => st,
            None => return Ok(()),
        };

        loop {
            let pc = self.pc;
            let step = match self.fetch_exec(pc, &mut st) {
                Ok(step) => step,
                Err(x) => {
                    self.throw_kind(x);
                    Step::Reschedule
                }
            };
            match step {
                Step::Next => {}
                Step::End => return Ok(()),
                Step::Reschedule => match self.scheduler(&mut st) {
                    Sched::Continue => {}
                    Sched::Exit(r) => return r,
                },
            }
        }
    }

    /// Fetches, decodes and executes one instruction.
    fn fetch_exec(&mut self, pc: usize, st: &mut ExecState) -> VmResult<Step> {
        let opb = *st.code.get(pc).ok_or(Exception::VmCheck)?;
        let op = Opcode::from_u8(opb).ok_or(Exception::Illegal)?;
        let o = decode(&st.code, pc, op.operands()).ok_or(Exception::VmCheck)?;
        self.pc = pc + op.size();
        self.exec_op(op, o, st)
    }

    // ------------------------------------------------------------------
    // The scheduler
    // ------------------------------------------------------------------

    /// Handles the pending exception: yield and end steer the loop, forced
    /// returns unwind to the nearest real function frame, everything else
    /// searches the frame chain for a catcher.
    fn scheduler(&mut self, st: &mut ExecState) -> Sched {
        let kind = match self.exception {
            Value::Nil => None,
            Value::Integer(i) => Exception::from_code(i),
            _ => Some(Exception::Other),
        };
        match kind {
            None | Some(Exception::Yield) => {}
            Some(Exception::End) => return Sched::Exit(Ok(())),
            Some(Exception::Return) => {
                if let Some(exit) = self.sched_return() {
                    return exit;
                }
            }
            Some(x) => {
                if let Some(exit) = self.sched_catch(x) {
                    return exit;
                }
            }
        }
        match self.reload_context() {
            Some(ns) => {
                *st = ns;
                Sched::Continue
            }
            None => Sched::Exit(Ok(())),
        }
    }

    /// A forced return thrown inside try/catch blocks: unwind to the
    /// nearest frame that is neither, return from it, deliver the result.
    fn sched_return(&mut self) -> Option<Sched> {
        let mut idx = self.frames.len();
        while idx > 0 {
            idx -= 1;
            let flags = self.frames[idx].flags;
            if flags.intersects(FrameFlags::TRY_BLOCK | FrameFlags::CATCHER) {
                continue;
            }
            // Unwind the blocks above the real function frame...
            self.unwind(idx + 1);
            let old = std::mem::replace(&mut self.exception, Value::Nil);
            self.disown_value(old);
            // ...then return from the function itself.
            self.clean_frame(idx, 0);
            self.limbo_clean(idx);
            let result = self.frames[idx].result;
            self.pop_frame_raw(idx);
            self.stack_clear();
            if let Some(ri) = result {
                let v = self.heap[ri];
                self.receive_value(v);
            }
            if self.frames.is_empty() {
                return Some(Sched::Exit(Ok(())));
            }
            return None;
        }
        // Nothing but exception blocks on the stack; bytecode is broken.
        Some(Sched::Exit(Err(Exception::VmCheck)))
    }

    /// Restores registers from frame `idx` and removes it, without the
    /// clean-table/limbo work (already done by the caller).
    fn pop_frame_raw(&mut self, idx: usize) {
        let fr = &self.frames[idx];
        self.base = fr.r_base;
        self.pc = fr.r_pc;
        let (r_sp, r_sbase) = (fr.r_sp, fr.r_sbase);
        self.stack_clear();
        self.sbase = r_sbase;
        self.sp = r_sp;
        self.frames.truncate(idx);
    }

    /// Searches outward for a catcher. Native frames and `untry` frames
    /// terminate the search; the internal-error kind is never caught.
    fn sched_catch(&mut self, x: Exception) -> Option<Sched> {
        let mut idx = self.frames.len();
        let mut stop = 0;
        while idx > 0 {
            idx -= 1;
            let fr = &self.frames[idx];
            let is_native = self
                .function(fr.function)
                .map_or(true, |f| f.is_native());
            if is_native || fr.flags.contains(FrameFlags::UNTRY) {
                stop = idx + 1;
                break;
            }
            if let Some(catcher) = fr.catcher {
                if x != Exception::Internal {
                    // Unwind through the try-block frame, then invoke the
                    // catcher as an ordinary call in the TRY executor.
                    self.unwind(idx);
                    if let Err(xx) = self.call_catcher(catcher) {
                        self.throw_kind(xx);
                        return Some(Sched::Exit(Err(xx)));
                    }
                    // The exception value now lives in the catcher's R[0];
                    // register it for cleanup on scope exit.
                    self.current_frame_mut().cleantab.push(0);
                    return None;
                }
            }
        }

        // No handler.
        self.messages.vm_error(format!(
            "unhandled VM exception {} ({})",
            x.name(),
            x.description()
        ));
        self.unwind(stop);
        Some(Sched::Exit(Err(x)))
    }

    /// Invokes the catcher like an ordinary call that inherits the TRY
    /// executor's result index, with the exception value in its R[0].
    fn call_catcher(&mut self, catcher: ObjId) -> VmResult<()> {
        let result = self.current_frame().and_then(|f| f.result);
        self.call_bytecode(catcher, result, 0)?;
        let exc = std::mem::replace(&mut self.exception, Value::Nil);
        let v = self.move_value(exc, CellAddr::Heap(self.base));
        self.heap[self.base] = v;
        self.current_frame_mut().flags |= FrameFlags::CATCHER;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instruction execution
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn exec_op(&mut self, op: Opcode, o: Operands, st: &mut ExecState) -> VmResult<Step> {
        let Operands { a, b, c, d } = o;
        let (a, b_u, c_u, d_u) = (a as usize, b as usize, c as usize, d as usize);
        match op {
            Opcode::Illegal => return Err(Exception::Illegal),
            Opcode::Nop => {}

            // --- Local flow control ---
            Opcode::Jump => {
                self.pc = (self.pc as i64 + o.a as i64) as usize;
            }
            Opcode::JumpZ => {
                if !self.reg(a).test() {
                    self.pc = (self.pc as i64 + b as i64) as usize;
                }
            }
            Opcode::JumpNZ => {
                if self.reg(a).test() {
                    self.pc = (self.pc as i64 + b as i64) as usize;
                }
            }
            Opcode::Switch => {
                let ctab = self.fconst(st.function, b_u)?;
                let co = ctab.object().ok_or(Exception::VmCheck)?;
                let key = self.reg(a);
                match self.metamethod_value(co, Metamethod::GetIndex, Some(&key)) {
                    Ok(offs) => {
                        // The compiler only puts integer targets here.
                        self.pc = offs.as_int().ok_or(Exception::VmCheck)? as usize;
                    }
                    Err(_) => {
                        self.pc = (self.pc as i64 + c as i64) as usize;
                    }
                }
            }
            Opcode::PreLoop => {
                // Cast index, step and limit to real once, so the loop body
                // compares on stable types.
                let av = self.reg(a);
                if !matches!(av, Value::Real(_)) {
                    let r = self.value_to_real(&av)?;
                    self.disown_value(av);
                    self.set_reg(a, Value::Real(r));
                }
                for reg in [b_u, c_u] {
                    let v = self.reg(reg);
                    if !matches!(v, Value::Real(_)) {
                        let r = self.value_to_real(&v)?;
                        self.set_reg(reg, Value::Real(r));
                    }
                }
                let (iv, step, limit) = (
                    self.reg(a).as_real().unwrap_or(0.0),
                    self.reg(b_u).as_real().unwrap_or(0.0),
                    self.reg(c_u).as_real().unwrap_or(0.0),
                );
                let skip = if step < 0.0 { iv < limit } else { iv > limit };
                if skip {
                    self.pc = (self.pc as i64 + d as i64) as usize;
                }
            }
            Opcode::Loop => {
                // The index is a variable, so the body may have replaced it
                // with a non-real.
                let av = self.reg(a);
                if !matches!(av, Value::Real(_)) {
                    let r = self.value_to_real(&av)?;
                    self.disown_value(av);
                    self.set_reg(a, Value::Real(r));
                }
                let step = self.reg(b_u).as_real().unwrap_or(0.0);
                let limit = self.reg(c_u).as_real().unwrap_or(0.0);
                let iv = self.reg(a).as_real().unwrap_or(0.0) + step;
                self.set_reg(a, Value::Real(iv));
                let stop = if step < 0.0 { iv < limit } else { iv > limit };
                if !stop {
                    self.pc = (self.pc as i64 + d as i64) as usize;
                }
            }

            // --- Argument stack ---
            Opcode::Push => self.push_regs(&[a])?,
            Opcode::Push2 => self.push_regs(&[a, b_u])?,
            Opcode::Push3 => self.push_regs(&[a, b_u, c_u])?,
            Opcode::Push4 => self.push_regs(&[a, b_u, c_u, d_u])?,
            Opcode::PushI => self.push_value(Value::Integer(o.a))?,
            Opcode::PhTrue => self.push_value(Value::Boolean(true))?,
            Opcode::PhFalse => self.push_value(Value::Boolean(false))?,
            Opcode::PushNil => self.push_value(Value::Nil)?,
            Opcode::PushC => {
                let v = self.fconst(st.function, a)?;
                self.push_copied(v)?;
            }
            Opcode::PushC2 => {
                let v1 = self.fconst(st.function, a)?;
                let v2 = self.fconst(st.function, b_u)?;
                self.push_copied(v1)?;
                self.push_copied(v2)?;
            }
            Opcode::PushIC => {
                let v = self.fconst(st.function, a)?;
                self.push_value(Value::Integer(b))?;
                self.push_copied(v)?;
            }
            Opcode::PushCI => {
                let v = self.fconst(st.function, a)?;
                self.push_copied(v)?;
                self.push_value(Value::Integer(b))?;
            }
            Opcode::PhVar => {
                let v = self.static_get(st.module, a)?;
                self.push_copied(v)?;
            }
            Opcode::PhUVal => {
                let rf = self.uv_base(b_u)?;
                let v = self.heap[rf + a];
                self.push_copied(v)?;
            }
            Opcode::PhArgs => {
                let fr = self.current_frame().ok_or(Exception::Internal)?;
                let (argv, argc) = (fr.argv, fr.argc);
                self.grow_heap(self.sp + argc)?;
                for i in 0..argc {
                    let v = self.heap[argv + i];
                    self.push_copied(v)?;
                }
            }
            Opcode::PushTup => {
                let f = self.function(st.function)?;
                let req = f.reqargs as usize;
                if f.tupargs == 0 {
                    return Err(Exception::VmCheck);
                }
                let fr = self.current_frame().ok_or(Exception::Internal)?;
                let (argv, argc) = (fr.argv, fr.argc);
                let tail = argc.saturating_sub(req);
                self.grow_heap(self.sp + tail)?;
                for i in 0..tail {
                    let v = self.heap[argv + req + i];
                    self.push_copied(v)?;
                }
            }

            // --- Function calls ---
            Opcode::Call => {
                let fo = self.get_function_ref(self.reg(a))?;
                self.check_args(fo)?;
                self.call_function(fo, None, 0)?;
                self.reload_into(st)?;
            }
            Opcode::CallR => {
                let fo = self.get_function_ref(self.reg(a))?;
                self.check_args(fo)?;
                let result = self.base + b_u;
                self.call_function(fo, Some(result), 0)?;
                self.reload_into(st)?;
            }
            Opcode::CCall => {
                let fv = self.fconst(st.function, b_u)?;
                let fo = self.get_function_ref(fv).map_err(|_| Exception::Arguments)?;
                self.call_function(fo, None, a)?;
                self.reload_into(st)?;
            }
            Opcode::CCallR => {
                let fv = self.fconst(st.function, c_u)?;
                let fo = self.get_function_ref(fv).map_err(|_| Exception::Arguments)?;
                let result = self.base + b_u;
                self.call_function(fo, Some(result), a)?;
                self.reload_into(st)?;
            }
            Opcode::Return => {
                self.pop_frame();
                self.stack_clear();
                if self.current_bytecode_frame().is_none() {
                    return Ok(Step::End);
                }
                self.reload_into(st)?;
            }
            Opcode::ReturnR => {
                let ri = self.current_frame().and_then(|f| f.result);
                if let Some(ri) = ri {
                    let v = self.reg(a);
                    let v = self.copy_value(v, CellAddr::Heap(ri));
                    self.heap[ri] = v;
                }
                self.pop_frame();
                self.stack_clear();
                if self.current_bytecode_frame().is_none() {
                    return Ok(Step::End);
                }
                self.reload_into(st)?;
                if let Some(ri) = ri {
                    let v = self.heap[ri];
                    self.receive_value(v);
                }
            }

            // --- Memory management ---
            Opcode::Clean => {
                let top = self.frames.len() - 1;
                self.clean_frame(top, a);
            }

            // --- Optional/tuple argument checking ---
            Opcode::ArgC => {
                let argc = self.current_frame().map_or(0, |f| f.argc);
                self.set_reg(a, Value::Integer(argc as i32));
            }
            Opcode::TupC => {
                let f = self.function(st.function)?;
                if f.tupargs == 0 {
                    return Err(Exception::VmCheck);
                }
                let (req, tup) = (f.reqargs as i32, f.tupargs as i32);
                let argc = self.current_frame().map_or(0, |f| f.argc) as i32;
                self.set_reg(a, Value::Integer((argc - req) / tup));
            }
            Opcode::Spec => {
                let req = self.function(st.function)?.reqargs as usize;
                let argc = self.current_frame().map_or(0, |f| f.argc);
                self.set_reg(b_u, Value::Boolean(a + req < argc));
            }
            Opcode::TSpec => {
                let f = self.function(st.function)?;
                if f.tupargs == 0 {
                    return Err(Exception::VmCheck);
                }
                let (req, tup) = (f.reqargs as i32, f.tupargs as i32);
                let ind = crate::strings::index_value(&self.reg(a))?;
                if ind < 0 {
                    return Err(Exception::LowIndex);
                }
                let argc = self.current_frame().map_or(0, |f| f.argc) as i32;
                let tupc = (argc - req) / tup;
                self.set_reg(b_u, Value::Boolean(ind < tupc));
            }

            // --- Immediate values, constants ---
            Opcode::LdI => self.set_reg(a, Value::Integer(b)),
            Opcode::LdTrue => self.set_reg(a, Value::Boolean(true)),
            Opcode::LdFalse => self.set_reg(a, Value::Boolean(false)),
            Opcode::LdNil => self.set_reg(a, Value::Nil),
            Opcode::LdC => {
                let v = self.fconst(st.function, b_u)?;
                let v = self.qcopy_value(v);
                self.set_reg(a, v);
            }

            // --- Register access ---
            Opcode::Move => {
                let v = self.qcopy_value(self.reg(b_u));
                self.set_reg(a, v);
            }

            // --- Register variables ---
            Opcode::Init => {
                let v = self.reg(b_u);
                let v = self.copy_value(v, CellAddr::Heap(self.base + a));
                self.set_reg(a, v);
                self.add_clean(a);
            }
            Opcode::InitI => {
                self.set_reg(a, Value::Integer(b));
                self.add_clean(a);
            }
            Opcode::InitNil => {
                self.set_reg(a, Value::Nil);
                self.add_clean(a);
            }
            Opcode::InitC => {
                let v = self.fconst(st.function, b_u)?;
                let v = self.copy_value(v, CellAddr::Heap(self.base + a));
                self.set_reg(a, v);
                self.add_clean(a);
            }
            Opcode::Assign => {
                let old = self.reg(a);
                self.disown_value(old);
                let v = self.reg(b_u);
                let v = self.copy_value(v, CellAddr::Heap(self.base + a));
                self.set_reg(a, v);
            }
            Opcode::AssignI => {
                let old = self.reg(a);
                self.disown_value(old);
                self.set_reg(a, Value::Integer(b));
            }
            Opcode::AsnNil => {
                let old = self.reg(a);
                self.disown_value(old);
                self.set_reg(a, Value::Nil);
            }
            Opcode::AssignC => {
                let old = self.reg(a);
                self.disown_value(old);
                let v = self.fconst(st.function, b_u)?;
                let v = self.copy_value(v, CellAddr::Heap(self.base + a));
                self.set_reg(a, v);
            }

            // --- Upvalues ---
            Opcode::GetUVal => {
                let rf = self.uv_base(c_u)?;
                let v = self.qcopy_value(self.heap[rf + b_u]);
                self.set_reg(a, v);
                self.grab_value(v);
            }
            Opcode::SetUVal => {
                let rf = self.uv_base(c_u)?;
                let old = self.heap[rf + b_u];
                self.disown_value(old);
                let v = self.reg(a);
                let v = self.copy_value(v, CellAddr::Heap(rf + b_u));
                self.heap[rf + b_u] = v;
            }

            // --- Static variables ---
            Opcode::GetVar => {
                let v = self.static_get(st.module, b_u)?;
                let v = self.qcopy_value(v);
                self.set_reg(a, v);
                self.grab_value(v);
            }
            Opcode::SetVar => {
                let v = self.reg(a);
                self.static_set(st.module, b_u, v)?;
            }

            // --- Indexed access ---
            Opcode::IndGetI => {
                let obj = self.indexable(self.reg(c_u))?;
                let key = Value::Integer(b);
                let v = self.metamethod_value(obj, Metamethod::GetIndex, Some(&key))?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::IndSetI => {
                let obj = self.indexable(self.reg(c_u))?;
                let key = Value::Integer(b);
                let mut v = self.reg(a);
                self.metamethod(obj, Metamethod::SetIndex, Some(&key), Some(&mut v))?;
            }
            Opcode::IndGet => {
                let obj = self.indexable(self.reg(c_u))?;
                let key = self.reg(b_u);
                let v = self.metamethod_value(obj, Metamethod::GetIndex, Some(&key))?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::IndSet => {
                let obj = self.indexable(self.reg(c_u))?;
                let key = self.reg(b_u);
                let mut v = self.reg(a);
                self.metamethod(obj, Metamethod::SetIndex, Some(&key), Some(&mut v))?;
            }
            Opcode::IndGetC => {
                let obj = self.indexable(self.reg(b_u))?;
                let key = self.fconst(st.function, c_u)?;
                let v = self.metamethod_value(obj, Metamethod::GetIndex, Some(&key))?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::IndSetC => {
                let obj = self.indexable(self.reg(b_u))?;
                let key = self.fconst(st.function, c_u)?;
                let mut v = self.reg(a);
                self.metamethod(obj, Metamethod::SetIndex, Some(&key), Some(&mut v))?;
            }

            // --- Argument access ---
            Opcode::GetArgI => {
                let v = self.frame_arg(b_u)?;
                let v = self.qcopy_value(v);
                self.set_reg(a, v);
                self.grab_value(v);
            }
            Opcode::PhArgI => {
                let v = self.frame_arg(a)?;
                self.push_copied(v)?;
            }
            Opcode::PhArgI2 => {
                let v1 = self.frame_arg(a)?;
                let v2 = self.frame_arg(b_u)?;
                self.push_copied(v1)?;
                self.push_copied(v2)?;
            }
            Opcode::SetArgI => {
                let fr = self.current_frame().ok_or(Exception::Internal)?;
                if b_u >= fr.argc {
                    return Err(Exception::HighIndex);
                }
                let slot = fr.argv + b_u;
                let old = self.heap[slot];
                self.disown_value(old);
                let v = self.reg(a);
                let v = self.copy_value(v, CellAddr::Heap(slot));
                self.heap[slot] = v;
            }

            // --- Tuple argument access ---
            Opcode::GetTArgI => {
                let f = self.function(st.function)?;
                let (req, tup) = (f.reqargs as usize, f.tupargs as usize);
                if tup == 0 {
                    return Err(Exception::VmCheck);
                }
                let tix = crate::strings::index_value(&self.reg(c_u))?;
                if tix < 0 {
                    return Err(Exception::WrongType);
                }
                let idx = b_u + req + tix as usize * tup;
                let v = self.frame_arg(idx)?;
                let v = self.qcopy_value(v);
                self.set_reg(a, v);
                self.grab_value(v);
            }

            // --- Upvalue argument access ---
            Opcode::GetUVArgI => {
                let (argv, argc) = self.uv_args(c_u)?;
                if b_u >= argc {
                    return Err(Exception::HighIndex);
                }
                let v = self.qcopy_value(self.heap[argv + b_u]);
                self.set_reg(a, v);
                self.grab_value(v);
            }
            Opcode::SetUVArgI => {
                let (argv, argc) = self.uv_args(c_u)?;
                if b_u >= argc {
                    return Err(Exception::HighIndex);
                }
                let slot = argv + b_u;
                let old = self.heap[slot];
                self.disown_value(old);
                let v = self.reg(a);
                let v = self.copy_value(v, CellAddr::Heap(slot));
                self.heap[slot] = v;
            }
            Opcode::GetUVTArgI => {
                let f = self.function(st.function)?;
                let (req, tup) = (f.reqargs as usize, f.tupargs as usize);
                if tup == 0 {
                    return Err(Exception::VmCheck);
                }
                let (argv, argc) = self.uv_args(d_u)?;
                let tix = crate::strings::index_value(&self.reg(c_u))?;
                if tix < 0 {
                    return Err(Exception::WrongType);
                }
                let idx = b_u + req + tix as usize * tup;
                if idx >= argc {
                    return Err(Exception::HighIndex);
                }
                let v = self.qcopy_value(self.heap[argv + idx]);
                self.set_reg(a, v);
                self.grab_value(v);
            }

            // --- Operators ---
            Opcode::Bop => {
                let opr = Operator::from_u8(c as u8).ok_or(Exception::VmCheck)?;
                let (l, r) = (self.reg(b_u), self.reg(d_u));
                let v = self.operate(&l, opr, &r)?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::PhBop => {
                let opr = Operator::from_u8(b as u8).ok_or(Exception::VmCheck)?;
                let (l, r) = (self.reg(a), self.reg(c_u));
                self.grow_heap(self.sp + 1)?;
                let v = self.operate(&l, opr, &r)?;
                self.push_owned(v)?;
            }
            Opcode::IpBop => {
                let opr = Operator::from_u8(c as u8).ok_or(Exception::VmCheck)?;
                let (l, r) = (self.reg(b_u), self.reg(d_u));
                let v = self.operate_inplace(&l, opr, &r)?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::BopS => {
                let opr = Operator::from_u8(c as u8).ok_or(Exception::VmCheck)?;
                let l = self.reg(b_u);
                let r = self.static_get(st.module, d_u)?;
                let v = self.operate(&l, opr, &r)?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::IpBopS => {
                let opr = Operator::from_u8(c as u8).ok_or(Exception::VmCheck)?;
                let l = self.reg(b_u);
                let r = self.static_get(st.module, d_u)?;
                let v = self.operate_inplace(&l, opr, &r)?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::BopI => {
                let opr = Operator::from_u8(c as u8).ok_or(Exception::VmCheck)?;
                let l = self.reg(b_u);
                let r = Value::Integer(d);
                let v = self.operate(&l, opr, &r)?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::PhBopI => {
                let opr = Operator::from_u8(b as u8).ok_or(Exception::VmCheck)?;
                let l = self.reg(a);
                let r = Value::Integer(c);
                self.grow_heap(self.sp + 1)?;
                let v = self.operate(&l, opr, &r)?;
                self.push_owned(v)?;
            }
            Opcode::IpBopI => {
                let opr = Operator::from_u8(c as u8).ok_or(Exception::VmCheck)?;
                let l = self.reg(b_u);
                let r = Value::Integer(d);
                let v = self.operate_inplace(&l, opr, &r)?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::BopC => {
                let opr = Operator::from_u8(c as u8).ok_or(Exception::VmCheck)?;
                let l = self.reg(b_u);
                let r = self.fconst(st.function, d_u)?;
                let v = self.operate(&l, opr, &r)?;
                self.set_reg(a, v);
                self.receive_value(v);
            }

            Opcode::Neg => {
                let v = match self.reg(b_u) {
                    Value::Real(r) => Value::Real(-r),
                    Value::Integer(i) => Value::Integer(i.wrapping_neg()),
                    Value::Boolean(x) => Value::Integer(-(x as i32)),
                    Value::ObjRef(_) | Value::WeakRef { .. } => {
                        return Err(Exception::NotImplemented)
                    }
                    _ => return Err(Exception::WrongType),
                };
                self.set_reg(a, v);
            }
            Opcode::BNot => {
                let v = match self.reg(b_u) {
                    Value::Integer(i) => Value::Integer(!i),
                    _ => return Err(Exception::WrongType),
                };
                self.set_reg(a, v);
            }
            Opcode::Not => {
                let v = match self.reg(b_u) {
                    Value::Nil => Value::Boolean(true),
                    Value::Real(r) => Value::Real((r == 0.0) as i32 as f64),
                    Value::Integer(i) => Value::Integer((i == 0) as i32),
                    Value::Boolean(x) => Value::Boolean(!x),
                    Value::ClassId(_) | Value::ObjRef(_) | Value::WeakRef { .. } => {
                        Value::Boolean(false)
                    }
                };
                self.set_reg(a, v);
            }

            // --- Casts ---
            Opcode::CastR => {
                let v = self.reg(b_u);
                if v.is_objref() {
                    let r = self.cast_value(&v, ClassId::REAL)?;
                    self.set_reg(a, r);
                    self.receive_value(r);
                } else {
                    self.set_reg(a, Value::Real(v.as_real().unwrap_or(0.0)));
                }
            }
            Opcode::CastI => {
                let v = self.reg(b_u);
                if v.is_objref() {
                    let r = self.cast_value(&v, ClassId::INTEGER)?;
                    self.set_reg(a, r);
                    self.receive_value(r);
                } else {
                    let i = match v {
                        Value::Nil => 0,
                        Value::Real(r) => r.floor() as i32,
                        _ => v.as_int().ok_or(Exception::WrongType)?,
                    };
                    self.set_reg(a, Value::Integer(i));
                }
            }
            Opcode::CastB => {
                let v = self.reg(b_u);
                if v.is_objref() {
                    let r = self.cast_value(&v, ClassId::BOOLEAN)?;
                    self.set_reg(a, r);
                    self.receive_value(r);
                } else {
                    self.set_reg(a, Value::Boolean(v.test()));
                }
            }
            Opcode::Cast => {
                let target = match self.reg(c_u) {
                    Value::ClassId(cid) => cid,
                    _ => return Err(Exception::WrongType),
                };
                let v = self.reg(b_u);
                let r = self.cast_value(&v, target)?;
                self.set_reg(a, r);
                self.receive_value(r);
            }
            Opcode::TypeOf => {
                let v = match self.reg(b_u) {
                    Value::Nil => Value::Nil,
                    other => Value::ClassId(self.value_class(&other)),
                };
                self.set_reg(a, v);
            }
            Opcode::SizeOf => {
                let v = self.reg(b_u);
                match v.object() {
                    Some(obj) => {
                        let len = self.metamethod_value(obj, Metamethod::Length, None)?;
                        self.set_reg(a, len);
                    }
                    None => self.set_reg(a, Value::Integer(1)),
                }
            }
            Opcode::WeakRef => {
                let v = match self.reg(b_u) {
                    Value::Nil => Value::Nil,
                    Value::ObjRef(target) => Value::WeakRef {
                        target,
                        index: WEAKREF_UNWIRED,
                    },
                    _ => return Err(Exception::NeedObject),
                };
                self.set_reg(a, v);
            }

            // --- Arithmetic shortcuts ---
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
            | Opcode::Power => {
                let opr = match op {
                    Opcode::Add => Operator::Add,
                    Opcode::Sub => Operator::Sub,
                    Opcode::Mul => Operator::Mul,
                    Opcode::Div => Operator::Div,
                    Opcode::Mod => Operator::Mod,
                    _ => Operator::Power,
                };
                let (l, r) = (self.reg(b_u), self.reg(c_u));
                let v = self.operate(&l, opr, &r)?;
                self.set_reg(a, v);
                self.receive_value(v);
            }
            Opcode::PhAdd | Opcode::PhSub | Opcode::PhMul | Opcode::PhDiv | Opcode::PhMod
            | Opcode::PhPower => {
                let opr = match op {
                    Opcode::PhAdd => Operator::Add,
                    Opcode::PhSub => Operator::Sub,
                    Opcode::PhMul => Operator::Mul,
                    Opcode::PhDiv => Operator::Div,
                    Opcode::PhMod => Operator::Mod,
                    _ => Operator::Power,
                };
                let (l, r) = (self.reg(a), self.reg(b_u));
                self.grow_heap(self.sp + 1)?;
                let v = self.operate(&l, opr, &r)?;
                self.push_owned(v)?;
            }

            // --- Constructors ---
            Opcode::New => {
                let (argv, argc) = (self.sbase, self.sp - self.sbase);
                let v = self.construct_from_heap(ClassId(b as u32), argv, argc)?;
                self.set_reg(a, v);
                self.receive_value(v);
                self.stack_clear();
            }
            Opcode::Clone => {
                let v = self.reg(b_u);
                match v.object() {
                    None => {
                        let q = self.qcopy_value(v);
                        self.set_reg(a, q);
                    }
                    Some(obj) => {
                        let cid = self.object(obj).classid;
                        let r = self.cast_value(&v, cid)?;
                        self.set_reg(a, r);
                        self.receive_value(r);
                    }
                }
            }

            // --- Exception handling ---
            Opcode::Try => {
                let catcher_v = self.fconst(st.function, a)?;
                let block_v = self.fconst(st.function, b_u)?;
                let catcher = self.get_function_ref(catcher_v).map_err(|_| Exception::Internal)?;
                let block = self.get_function_ref(block_v).map_err(|_| Exception::Internal)?;
                let result = self.current_frame().and_then(|f| f.result);
                self.call_bytecode(block, result, 0)?;
                self.reload_into(st)?;
                let fr = self.current_frame_mut();
                fr.catcher = Some(catcher);
                fr.flags |= FrameFlags::TRY_BLOCK;
            }
            Opcode::Untry => {
                let block_v = self.fconst(st.function, a)?;
                let block = self.get_function_ref(block_v).map_err(|_| Exception::Internal)?;
                let result = self.current_frame().and_then(|f| f.result);
                self.call_bytecode(block, result, 0)?;
                self.reload_into(st)?;
                let fr = self.current_frame_mut();
                fr.flags |= FrameFlags::TRY_BLOCK | FrameFlags::UNTRY;
            }
            Opcode::Throw => {
                let v = self.reg(a);
                self.throw_value(v);
                return Ok(Step::Reschedule);
            }
            Opcode::Retry => {
                // Return from the catcher, rewinding the PC to re-run the
                // TRY that armed it.
                let idx = self.frames.len() - 1;
                self.clean_frame(idx, 0);
                self.limbo_clean(idx);
                let fr = &self.frames[idx];
                self.base = fr.r_base;
                self.sbase = fr.r_sbase;
                self.sp = fr.r_sp;
                self.pc = fr.r_pc - Opcode::Try.size();
                self.frames.truncate(idx);
                if self.frames.is_empty() {
                    return Err(Exception::End);
                }
                self.reload_into(st)?;
            }
            Opcode::RetX => {
                self.throw_kind(Exception::Return);
                return Ok(Step::Reschedule);
            }
            Opcode::RetXR => {
                let ri = self.current_frame().and_then(|f| f.result);
                if let Some(ri) = ri {
                    let v = self.reg(a);
                    let v = self.copy_value(v, CellAddr::Heap(ri));
                    self.heap[ri] = v;
                }
                self.throw_kind(Exception::Return);
                return Ok(Step::Reschedule);
            }
        }
        Ok(Step::Next)
    }

    // ------------------------------------------------------------------
    // Small dispatch helpers
    // ------------------------------------------------------------------

    fn reload_into(&mut self, st: &mut ExecState) -> VmResult<()> {
        match self.reload_context() {
            Some(ns) => {
                *st = ns;
                Ok(())
            }
            None => Err(Exception::Internal),
        }
    }

    /// The current frame if it runs bytecode.
    fn current_bytecode_frame(&self) -> Option<&crate::vm::CallFrame> {
        let fr = self.current_frame()?;
        let f = self.function(fr.function).ok()?;
        if f.is_native() {
            None
        } else {
            Some(fr)
        }
    }

    fn indexable(&self, v: Value) -> VmResult<ObjId> {
        v.object().ok_or(Exception::CantIndex)
    }

    fn frame_arg(&self, i: usize) -> VmResult<Value> {
        let fr = self.current_frame().ok_or(Exception::Internal)?;
        if i >= fr.argc {
            return Err(Exception::HighIndex);
        }
        Ok(self.heap[fr.argv + i])
    }

    /// Argument vector of the frame `levels` upvalue steps out.
    fn uv_args(&self, levels: usize) -> VmResult<(usize, usize)> {
        let b = self.uv_base(levels)?;
        let fi = self.frame_at_base(b).ok_or(Exception::Upvalue)?;
        let fr = &self.frames[fi];
        Ok((fr.argv, fr.argc))
    }

    fn add_clean(&mut self, reg: usize) {
        self.current_frame_mut().cleantab.push(reg as u8);
    }

    /// Pushes registers onto the argument stack with copy semantics.
    fn push_regs(&mut self, regs: &[usize]) -> VmResult<()> {
        self.grow_heap(self.sp + regs.len())?;
        for &r in regs {
            let v = self.reg(r);
            let v = self.copy_value(v, CellAddr::Heap(self.sp));
            self.heap[self.sp] = v;
            self.sp += 1;
        }
        Ok(())
    }

    /// Pushes a primitive.
    fn push_value(&mut self, v: Value) -> VmResult<()> {
        self.grow_heap(self.sp + 1)?;
        self.heap[self.sp] = v;
        self.sp += 1;
        Ok(())
    }

    /// Pushes with copy semantics (ownership taken for the stack cell).
    fn push_copied(&mut self, v: Value) -> VmResult<()> {
        self.grow_heap(self.sp + 1)?;
        let v = self.copy_value(v, CellAddr::Heap(self.sp));
        self.heap[self.sp] = v;
        self.sp += 1;
        Ok(())
    }

    /// Pushes a value whose reference the producer already raised (operator
    /// results): the stack cell adopts it as-is.
    fn push_owned(&mut self, v: Value) -> VmResult<()> {
        self.grow_heap(self.sp + 1)?;
        self.heap[self.sp] = v;
        self.sp += 1;
        Ok(())
    }
}
