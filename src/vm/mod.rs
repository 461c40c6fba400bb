//! The virtual machine: register heap, call frames, call and exception
//! machinery, and the embedding API.
//!
//! The VM is register based. Registers live in one contiguous value heap;
//! each call pushes a frame whose register window sits directly above the
//! caller's argument stack. The heap grows by doubling. There is no global
//! operand stack: the argument stack is part of each frame's window.
//!
//! Execution is single-threaded and non-reentrant except through
//! [`Vm::call`], which builds a new call frame and runs until that frame
//! returns.

mod dispatch;

use bitflags::bitflags;

use crate::cast::CastCallback;
use crate::class::ClassId;
use crate::config::{LoadFlags, VmConfig};
use crate::error::{Exception, VmResult};
use crate::function::FunctionFlags;
use crate::memory::Slot;
use crate::messages::MessageLog;
use crate::object::CellAddr;
use crate::strings::{index_value, StringPool};
use crate::value::{ObjId, Value};

bitflags! {
    /// Call frame state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// Frame runs a try block.
        const TRY_BLOCK = 0x0001;
        /// Frame runs an exception catcher.
        const CATCHER = 0x0002;
        /// Try block without outer propagation.
        const UNTRY = 0x0004;
    }
}

/// One call frame. Frames form a chain through their saved return bases.
#[derive(Debug)]
pub struct CallFrame {
    /// First register of this frame's window.
    pub base: usize,

    // Return info.
    pub r_base: usize,
    pub r_pc: usize,
    pub r_sp: usize,
    pub r_sbase: usize,

    /// The function executing in this frame.
    pub function: ObjId,
    /// Objects owned by pending computation; disowned on frame exit.
    pub limbo: Vec<ObjId>,
    /// First argument (heap index) and argument count.
    pub argv: usize,
    pub argc: usize,
    /// Heap index the caller wants the result in, if any.
    pub result: Option<usize>,
    /// Register indices whose values need disowning on scope exit.
    pub cleantab: Vec<u8>,
    /// Base of the register frame holding the nearest-level upvalues.
    pub upvalues: usize,
    pub flags: FrameFlags,
    /// Exception catcher armed by `TRY`, if any.
    pub catcher: Option<ObjId>,
}

/// Loader hook: turns source text into a compiled module. Installed by the
/// embedder; the core itself has no compiler.
pub type LoaderCallback =
    fn(vm: &mut Vm, source: &[u8], flags: LoadFlags) -> VmResult<ObjId>;

/// Argument descriptors for the convenience call entry points.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Nil,
    Int(i32),
    Real(f64),
    Bool(bool),
    /// Interned on push.
    Str(&'a str),
    /// The pushed reference is owned by the argument stack.
    Object(ObjId),
    /// Pushed with full copy semantics.
    Value(Value),
}

/// A virtual machine instance. Owns every object it creates; nothing is
/// shared between instances.
pub struct Vm {
    // Object slab.
    pub(crate) objects: Vec<Slot>,
    pub(crate) free_head: Option<u32>,

    // Value heap and special registers.
    pub(crate) heap: Vec<Value>,
    /// Base of the current register frame (0 at the root).
    pub base: usize,
    /// Program counter within the current function.
    pub pc: usize,
    /// Argument stack pointer.
    pub sp: usize,
    /// Argument stack base for the current call setup.
    pub sbase: usize,

    // Native call convention registers.
    /// Heap index of the first argument to the running native function.
    pub argv: usize,
    /// Number of arguments to the running native function.
    pub argc: usize,
    /// Heap index of the running native function's result slot.
    pub resv: usize,

    pub(crate) frames: Vec<CallFrame>,

    /// Thrown value; `nil` means no exception.
    pub(crate) exception: Value,

    // Class registry and cast matrix.
    pub(crate) classes: Vec<Option<ObjId>>,
    pub(crate) casters: Vec<CastCallback>,
    pub(crate) casters_dim: usize,

    /// String pool; `None` once closed.
    pub(crate) strings: Option<StringPool>,

    // Module bookkeeping.
    pub(crate) dead_modules: Vec<ObjId>,
    pub(crate) loaded_modules: hashbrown::HashMap<String, ObjId>,
    pub(crate) module_id_counter: u32,
    pub(crate) module_lock: u32,

    pub(crate) messages: MessageLog,
    pub(crate) config: VmConfig,
    loader: Option<LoaderCallback>,
    closing: bool,
}

impl Vm {
    /// Creates a VM and registers the built-in classes.
    pub fn open(config: VmConfig) -> VmResult<Box<Vm>> {
        let mut vm = Box::new(Vm {
            objects: Vec::new(),
            free_head: None,
            heap: vec![Value::Nil; config.heap_initial.max(2)],
            base: 0,
            pc: 0,
            sp: 1,
            sbase: 1,
            argv: 0,
            argc: 0,
            resv: 0,
            frames: Vec::new(),
            exception: Value::Nil,
            classes: Vec::new(),
            casters: Vec::new(),
            casters_dim: 0,
            strings: None,
            dead_modules: Vec::new(),
            loaded_modules: hashbrown::HashMap::new(),
            module_id_counter: 0,
            module_lock: 0,
            messages: MessageLog::new(),
            config,
            loader: None,
            closing: false,
        });
        vm.bootstrap()?;
        Ok(vm)
    }

    /// Registers the built-in classes. The class class and the string class
    /// cross-reference (class names are strings, and the string class is a
    /// class), so both start nameless and the names are back-filled once
    /// both exist.
    fn bootstrap(&mut self) -> VmResult<()> {
        self.open_string_pool();

        self.register_class(Some(ClassId::OBJECT), "object", ClassId::OBJECT, None, None)?;
        self.register_class(
            Some(ClassId::CLASS),
            "class",
            ClassId::OBJECT,
            None,
            Some(crate::class::class_destruct),
        )?;
        crate::strings::register(self)?;

        // The object classdef was created before the class class existed;
        // its instance reference is patched in here.
        if let Some(Some(cc)) = self.classes.get(ClassId::CLASS.raw() as usize).copied() {
            self.own_object(cc);
        }

        // Back-fill the names that could not be interned earlier.
        self.register_class(Some(ClassId::OBJECT), "object", ClassId::OBJECT, None, None)?;
        self.register_class(Some(ClassId::CLASS), "class", ClassId::OBJECT, None, None)?;

        // The value pseudo-classes, so `typeof` results resolve to names.
        self.register_class(Some(ClassId::VALUE), "value", ClassId::OBJECT, None, None)?;
        for (cid, name) in [
            (ClassId::NIL, "nil"),
            (ClassId::REAL, "real"),
            (ClassId::INTEGER, "integer"),
            (ClassId::BOOLEAN, "boolean"),
            (ClassId::CLASSID, "classid"),
            (ClassId::OBJREF, "objref"),
            (ClassId::WEAKREF, "weakref"),
        ] {
            self.register_class(Some(cid), name, ClassId::VALUE, None, None)?;
        }

        crate::function::register(self)?;
        crate::module::register(self)?;
        crate::array::register(self)?;
        crate::table::register(self)?;
        crate::vector::register(self)?;
        crate::dstring::register(self)?;

        self.init_casts()?;
        Ok(())
    }

    /// Orderly teardown: module GC to a fixed point, string pool flush,
    /// class un-strap, cast matrix release. Runs from `Drop` as well.
    pub fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.clean_modules_fixpoint();
        let exc = std::mem::replace(&mut self.exception, Value::Nil);
        self.disown_value(exc);
        // Drop anything still sitting on the root result slot.
        let root = std::mem::replace(&mut self.heap[0], Value::Nil);
        self.disown_value(root);
        self.close_string_pool();
        self.close_classes();
        self.close_casts();
    }

    /// True while the VM is being torn down.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// The diagnostic log.
    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    /// The VM's configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Installs the module loader hook.
    pub fn set_loader(&mut self, loader: LoaderCallback) {
        self.loader = Some(loader);
    }

    /// Loads a module from an in-memory buffer through the installed
    /// loader hook.
    pub fn load_buffer(&mut self, source: &[u8], flags: LoadFlags) -> VmResult<ObjId> {
        let loader = self.loader.ok_or(Exception::NotFound)?;
        loader(self, source, flags)
    }

    /// Loads a named module: an already-loaded module is adopted, anything
    /// else goes through the loader hook.
    pub fn load(&mut self, modname: &str, flags: LoadFlags) -> VmResult<ObjId> {
        if let Some(m) = self.get_module(modname) {
            return Ok(m);
        }
        let loader = self.loader.ok_or(Exception::NotFound)?;
        loader(self, modname.as_bytes(), flags)
    }

    // ------------------------------------------------------------------
    // Heap and frames
    // ------------------------------------------------------------------

    /// Ensures the heap holds at least `minsize` values, doubling until it
    /// fits. Frame-side state needs no relocation: limbo lists and clean
    /// tables live in the frames, not in the heap.
    pub(crate) fn grow_heap(&mut self, minsize: usize) -> VmResult<()> {
        if minsize <= self.heap.len() {
            return Ok(());
        }
        let mut size = self.heap.len().max(2);
        while size < minsize {
            size <<= 1;
        }
        log::trace!("heap grows to {size} values");
        self.heap.resize(size, Value::Nil);
        Ok(())
    }

    /// Current heap size in values.
    pub fn heap_size(&self) -> usize {
        self.heap.len()
    }

    /// Register `i` of the current frame.
    pub fn reg(&self, i: usize) -> Value {
        self.heap[self.base + i]
    }

    pub(crate) fn set_reg(&mut self, i: usize, v: Value) {
        self.heap[self.base + i] = v;
    }

    /// The innermost call frame.
    pub(crate) fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub(crate) fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no call frame")
    }

    /// Frame index with register window base `base`.
    pub(crate) fn frame_at_base(&self, base: usize) -> Option<usize> {
        self.frames
            .binary_search_by(|f| f.base.cmp(&base))
            .ok()
    }

    /// Walks the upvalue chain `levels` frames out and returns that frame's
    /// register base.
    pub(crate) fn uv_base(&self, mut levels: usize) -> VmResult<usize> {
        let mut b = self.base;
        while levels > 0 {
            let fi = self.frame_at_base(b).ok_or(Exception::Upvalue)?;
            b = self.frames[fi].upvalues;
            levels -= 1;
        }
        Ok(b)
    }

    /// Pushes a call register frame directly above the argument stack and
    /// points the VM at it.
    pub(crate) fn push_frame(&mut self, cleansize: usize, framesize: usize) -> VmResult<()> {
        let base = self.sp;
        self.grow_heap(base + framesize + self.config.stack_min)?;
        // Fresh windows start nil so variable instructions never disown a
        // stale reference left by an earlier frame.
        for slot in &mut self.heap[base..base + framesize] {
            *slot = Value::Nil;
        }
        let frame = CallFrame {
            base,
            r_base: self.base,
            r_pc: self.pc,
            r_sp: self.sp,
            r_sbase: self.sbase,
            function: ObjId(u32::MAX),
            limbo: Vec::new(),
            argv: self.sbase,
            argc: self.sp - self.sbase,
            result: None,
            cleantab: Vec::with_capacity(cleansize),
            upvalues: self.base,
            flags: FrameFlags::empty(),
            catcher: None,
        };
        debug_assert!(frame.argv + frame.argc <= frame.base);
        self.frames.push(frame);
        self.base = base;
        self.sp = base + framesize;
        self.sbase = self.sp;
        Ok(())
    }

    /// Clears the argument stack region between `sbase` and `sp`, disowning
    /// any references.
    pub(crate) fn stack_clear(&mut self) {
        while self.sp > self.sbase {
            self.sp -= 1;
            let v = std::mem::replace(&mut self.heap[self.sp], Value::Nil);
            self.disown_value(v);
        }
    }

    /// Releases clean-table entries above `downto` and truncates.
    pub(crate) fn clean_frame(&mut self, frame: usize, downto: usize) {
        while self.frames[frame].cleantab.len() > downto {
            let r = self.frames[frame].cleantab.pop().expect("cleantab entry") as usize;
            let base = self.frames[frame].base;
            let v = std::mem::replace(&mut self.heap[base + r], Value::Nil);
            self.disown_value(v);
        }
    }

    /// Pops the innermost frame: clean-table, limbo, argument stacks,
    /// return registers.
    pub(crate) fn pop_frame(&mut self) {
        let idx = self.frames.len() - 1;
        let is_native = self
            .function(self.frames[idx].function)
            .map_or(true, |f| f.is_native());
        if !is_native {
            self.clean_frame(idx, 0);
            self.limbo_clean(idx);
        }
        let fr = &self.frames[idx];
        self.base = fr.r_base;
        self.pc = fr.r_pc;
        let (r_sp, r_sbase) = (fr.r_sp, fr.r_sbase);
        self.stack_clear();
        self.sbase = r_sbase;
        self.sp = r_sp;
        self.frames.pop();
    }

    /// Unwinds the call stack until `target_len` frames remain.
    pub(crate) fn unwind(&mut self, target_len: usize) {
        while self.frames.len() > target_len {
            self.pop_frame();
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Argument count check against the function's declared arity.
    pub(crate) fn check_args(&self, fo: ObjId) -> VmResult<()> {
        let f = self.function(fo)?;
        let argc = self.sp - self.sbase;
        if argc < f.reqargs as usize {
            return Err(Exception::FewArgs);
        }
        if f.tupargs > 0 {
            if (argc - f.reqargs as usize) % f.tupargs as usize != 0 {
                return Err(Exception::TupleArgs);
            }
        } else if (f.optargs != 255 && argc > (f.reqargs as usize + f.optargs as usize))
            || (f.optargs == 0 && argc > f.reqargs as usize)
        {
            return Err(Exception::ManyArgs);
        }
        Ok(())
    }

    /// Calls a bytecode function. `result` is the caller-side heap index
    /// for the result; `levels` the scope nesting skip depth for upvalues.
    pub(crate) fn call_bytecode(
        &mut self,
        fo: ObjId,
        result: Option<usize>,
        levels: usize,
    ) -> VmResult<()> {
        let (cleansize, framesize, has_results) = {
            let f = self.function(fo)?;
            let b = f.body().ok_or(Exception::NeedCallable)?;
            (
                b.cleansize as usize,
                b.framesize as usize,
                f.flags.contains(FunctionFlags::RESULTS),
            )
        };
        self.push_frame(cleansize, framesize)?;
        {
            let fr = self.current_frame_mut();
            fr.function = fo;
            fr.result = if has_results { result } else { None };
        }
        if levels > 0 {
            match self.uv_base(levels + 1) {
                Ok(b) => self.current_frame_mut().upvalues = b,
                Err(x) => {
                    // Roll the frame back before reporting.
                    let fr = self.frames.pop().expect("frame just pushed");
                    self.base = fr.r_base;
                    self.sp = fr.r_sp;
                    self.sbase = fr.r_sbase;
                    self.pc = fr.r_pc;
                    return Err(x);
                }
            }
        }
        self.pc = 0;
        Ok(())
    }

    /// Calls a native function: minimal frame, one result register, direct
    /// callback invocation, then a "fake return".
    pub(crate) fn call_native(
        &mut self,
        fo: ObjId,
        result: Option<usize>,
        _levels: usize,
    ) -> VmResult<()> {
        let (cb, has_results) = {
            let f = self.function(fo)?;
            match &f.kind {
                crate::function::FunctionKind::Native(cb) => {
                    (*cb, f.flags.contains(FunctionFlags::RESULTS))
                }
                _ => return Err(Exception::NeedCallable),
            }
        };
        self.push_frame(0, 1)?;
        self.heap[self.base] = Value::Nil;
        let result_slot = result.unwrap_or(self.base);
        {
            let fr = self.current_frame_mut();
            fr.function = fo;
            fr.result = Some(result_slot);
        }

        let (save_argv, save_argc, save_resv) = (self.argv, self.argc, self.resv);
        let (f_argv, f_argc) = {
            let fr = self.current_frame().expect("native frame");
            (fr.argv, fr.argc)
        };
        self.resv = result_slot;
        self.argv = f_argv;
        self.argc = f_argc;

        let x = cb(self);
        if x.is_err() {
            // Anything the callback left on its own argument stack.
            self.stack_clear();
        }

        // Fake return: restore registers, drop the arguments. A callback
        // may have parked objects in limbo through runtime helpers; they
        // are owned by the frame and go with it.
        let fr = self.frames.pop().expect("native frame");
        for id in fr.limbo {
            self.object_mut(id).link = crate::object::ObjectLink::None;
            self.disown_object(id);
        }
        self.base = fr.r_base;
        self.sbase = fr.r_sbase;
        self.sp = fr.r_sp;
        self.pc = fr.r_pc;
        self.stack_clear();
        self.argv = save_argv;
        self.argc = save_argc;
        self.resv = save_resv;
        x?;

        if has_results {
            let rv = self.heap[result_slot];
            if result.is_some() {
                self.receive_value(rv);
            } else {
                // Result produced but not wanted.
                self.heap[result_slot] = Value::Nil;
                self.disown_value(rv);
            }
        }
        Ok(())
    }

    /// Calls either kind of function.
    pub(crate) fn call_function(
        &mut self,
        fo: ObjId,
        result: Option<usize>,
        levels: usize,
    ) -> VmResult<()> {
        let f = self.function(fo)?;
        if result.is_some() && !f.flags.contains(FunctionFlags::RESULTS) {
            return Err(Exception::NoResult);
        }
        if f.is_native() {
            self.call_native(fo, result, levels)
        } else {
            self.call_bytecode(fo, result, levels)
        }
    }

    /// Writes a native function's result into its result slot, with
    /// ownership.
    pub fn set_result(&mut self, v: Value) {
        let slot = self.resv;
        let old = std::mem::replace(&mut self.heap[slot], Value::Nil);
        self.disown_value(old);
        let v = self.copy_value(v, CellAddr::Heap(slot));
        self.heap[slot] = v;
    }

    /// Argument `i` of the running native function.
    pub fn arg(&self, i: usize) -> VmResult<Value> {
        if i >= self.argc {
            return Err(Exception::HighIndex);
        }
        Ok(self.heap[self.argv + i])
    }

    // ------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------

    /// Stores a thrown value in the exception slot, releasing any previous
    /// one. Returns the exception kind the throw maps to.
    pub fn throw_value(&mut self, v: Value) -> Exception {
        let old = std::mem::replace(&mut self.exception, Value::Nil);
        self.disown_value(old);
        let nv = self.copy_value(v, CellAddr::Heap(usize::MAX));
        self.exception = nv;
        match nv {
            Value::Integer(i) => Exception::from_code(i).unwrap_or(Exception::Yield),
            _ => Exception::Other,
        }
    }

    /// Stores an exception kind as a thrown integer.
    pub(crate) fn throw_kind(&mut self, x: Exception) {
        let old = std::mem::replace(&mut self.exception, Value::Nil);
        self.disown_value(old);
        self.exception = Value::Integer(x.code() as i32);
    }

    /// The currently thrown value, `nil` if none.
    pub fn exception_value(&self) -> Value {
        self.exception
    }

    // ------------------------------------------------------------------
    // Argument marshalling and call entry points
    // ------------------------------------------------------------------

    /// Drops pushed arguments and the pending result slot.
    pub fn reset_args(&mut self) {
        self.stack_clear();
        let v = std::mem::replace(&mut self.heap[self.base], Value::Nil);
        self.disown_value(v);
    }

    /// Pushes arguments for a subsequent [`Vm::call`].
    pub fn push_args(&mut self, args: &[Arg]) -> VmResult<()> {
        self.grow_heap(self.sp + args.len())?;
        for a in args {
            let v = match *a {
                Arg::Nil => Value::Nil,
                Arg::Int(i) => Value::Integer(i),
                Arg::Real(r) => Value::Real(r),
                Arg::Bool(b) => Value::Boolean(b),
                Arg::Str(s) => Value::ObjRef(self.intern(s)?),
                Arg::Object(o) => {
                    self.own_object(o);
                    Value::ObjRef(o)
                }
                Arg::Value(v) => self.copy_value(v, CellAddr::Heap(self.sp)),
            };
            self.heap[self.sp] = v;
            self.sp += 1;
        }
        Ok(())
    }

    /// Runs a pre-armed call: arguments already pushed with
    /// [`Vm::push_args`]. Returns the result value if one was requested;
    /// the caller owns it and must eventually [`Vm::disown_value`] it.
    pub fn call(&mut self, fo: ObjId, want_result: bool) -> VmResult<Option<Value>> {
        if self.object(fo).classid != ClassId::FUNCTION {
            self.messages
                .vm_error("call target is not callable".to_string());
            self.reset_args();
            return Err(Exception::NeedCallable);
        }
        if let Err(x) = self.check_args(fo) {
            self.messages.vm_error(format!(
                "call rejected: {} ({})",
                x.description(),
                self.function_name(fo)
            ));
            self.reset_args();
            return Err(x);
        }
        let result = want_result.then_some(self.base);
        let is_native = self.function(fo)?.is_native();
        self.call_function(fo, result, 0)?;
        if !is_native {
            if let Err(x) = self.run() {
                self.messages.vm_error(format!(
                    "function '{}' aborted with exception {}",
                    self.function_name(fo),
                    x.name()
                ));
                return Err(x);
            }
        }
        if want_result {
            let v = std::mem::replace(&mut self.heap[self.base], Value::Nil);
            Ok(Some(v))
        } else {
            Ok(None)
        }
    }

    /// Marshal-and-call convenience.
    pub fn call_args(
        &mut self,
        fo: ObjId,
        args: &[Arg],
        want_result: bool,
    ) -> VmResult<Option<Value>> {
        self.reset_args();
        self.push_args(args)?;
        self.call(fo, want_result)
    }

    /// Finds an exported function, pushes arguments, calls. The fully
    /// convenient entry point.
    pub fn call_named(
        &mut self,
        module: ObjId,
        name: &str,
        args: &[Arg],
        want_result: bool,
    ) -> VmResult<Option<Value>> {
        let fo = self.find_function(module, name)?;
        let r = self.call_args(fo, args, want_result);
        self.disown_object(fo);
        r
    }

    /// Looks up an exported function by name. The returned reference is
    /// owned by the caller.
    pub fn find_function(&mut self, module: ObjId, name: &str) -> VmResult<ObjId> {
        if self.object(module).classid != ClassId::MODULE {
            return Err(Exception::WrongType);
        }
        let exports = self.module(module)?.exports.ok_or(Exception::NotFound)?;
        let v = self
            .table_get_str(exports, name)
            .map_err(|_| Exception::NotFound)?;
        let fo = v.object().ok_or(Exception::NotFound)?;
        if self.object(fo).classid != ClassId::FUNCTION {
            return Err(Exception::NotFound);
        }
        self.own_object(fo);
        Ok(fo)
    }

    /// Exports a native function from a module.
    #[allow(clippy::too_many_arguments)]
    pub fn export_cfunction(
        &mut self,
        module: ObjId,
        results: u8,
        name: &str,
        reqargs: u8,
        optargs: i32,
        tupargs: u8,
        cb: crate::function::NativeCallback,
    ) -> VmResult<ObjId> {
        let fo = self.register_cfunction(module, results, name, reqargs, optargs, tupargs, cb)?;
        let exports = self.module(module)?.exports.ok_or(Exception::Internal)?;
        self.table_set_str(exports, name, Value::ObjRef(fo))?;
        Ok(fo)
    }

    /// Exports a constant value from a module.
    pub fn export_constant(&mut self, module: ObjId, name: &str, v: Value) -> VmResult<()> {
        let exports = self.module(module)?.exports.ok_or(Exception::Internal)?;
        self.table_set_str(exports, name, v)
    }

    fn function_name(&self, fo: ObjId) -> String {
        self.function(fo)
            .ok()
            .and_then(|f| f.name)
            .map(|n| String::from_utf8_lossy(self.string_bytes(n)).into_owned())
            .unwrap_or_else(|| "<anonymous>".to_string())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.close();
    }
}

/// Extracts and checks range operands for the `delete` metamethod.
///
/// `op1` absent means "all"; `op2` absent means "one item". On an empty
/// "all", the returned range is `(0, -1)`, which callers treat as a no-op.
pub(crate) fn delete_range(
    op1: Option<&Value>,
    op2: Option<&Value>,
    length: i32,
) -> VmResult<(i32, i32)> {
    let Some(op1) = op1 else {
        return Ok((0, length - 1));
    };
    let i0 = index_value(op1)?;
    let i1 = match op2 {
        Some(count) => i0 + index_value(count)? - 1,
        None => i0,
    };
    if i0 < 0 {
        return Err(Exception::LowIndex);
    }
    if i1 < i0 {
        return Err(Exception::WrongIndex);
    }
    if i1 >= length {
        return Err(Exception::HighIndex);
    }
    Ok((i0, i1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_round_trip() {
        let vm = Vm::open(VmConfig::default()).expect("open");
        drop(vm);
    }

    #[test]
    fn intern_adopts_existing() {
        let mut vm = Vm::open(VmConfig::default()).expect("open");
        let a = vm.intern("hello").unwrap();
        let b = vm.intern("hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(vm.object(a).refcount, 2);
        vm.disown_object(a);
        vm.disown_object(b);
    }

    #[test]
    fn delete_range_semantics() {
        assert_eq!(delete_range(None, None, 5), Ok((0, 4)));
        assert_eq!(delete_range(None, None, 0), Ok((0, -1)));
        let i = Value::Integer(2);
        let c = Value::Integer(2);
        assert_eq!(delete_range(Some(&i), Some(&c), 5), Ok((2, 3)));
        assert_eq!(delete_range(Some(&i), None, 5), Ok((2, 2)));
        assert_eq!(
            delete_range(Some(&Value::Integer(-1)), None, 5),
            Err(Exception::LowIndex)
        );
        assert_eq!(
            delete_range(Some(&Value::Integer(5)), None, 5),
            Err(Exception::HighIndex)
        );
    }

    #[test]
    fn grow_heap_doubles() {
        let mut vm = Vm::open(VmConfig::default()).expect("open");
        let before = vm.heap_size();
        vm.grow_heap(before + 1).unwrap();
        assert_eq!(vm.heap_size(), before * 2);
    }
}
