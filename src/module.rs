//! The module class and module garbage collection.
//!
//! A module owns its functions (and any other permanently held objects),
//! its exports table, its static variables and its raw source buffer.
//! Functions hold their module in constants and closures, so a module and
//! its functions form a reference cycle. The cycle is broken by the refsum
//! idiom: the sum of the owned objects' refcounts is snapshotted once the
//! module is complete; when the module's destructor fires and the live sum
//! has returned to the snapshot, only internal self-references remain and
//! destruction proceeds.

use std::any::Any;

use crate::class::{ClassId, Metamethod};
use crate::error::{Exception, VmResult};
use crate::object::{ObjectLink, Payload};
use crate::value::{ObjId, Value};
use crate::vm::Vm;

/// Hook invoked before a module is unloaded. `closing` is true during VM
/// teardown, where refusal is ignored.
pub type UnloadCallback = fn(vm: &mut Vm, module: ObjId, closing: bool) -> VmResult<()>;

/// Module object payload.
pub struct Module {
    /// Long-time unique id.
    pub id: u32,
    /// Exports table.
    pub exports: Option<ObjId>,
    /// Raw source text, if retained.
    pub source: Option<Vec<u8>>,
    /// Functions and other permanently owned objects.
    pub objects: Vec<ObjId>,
    /// Refcount-sum snapshot; `None` disables the self-reference check.
    pub refsum: Option<u32>,
    /// Static variable slots.
    pub variables: Vec<Value>,
    pub unload: Option<UnloadCallback>,
    /// Per-instance embedder data.
    pub moduledata: Option<Box<dyn Any>>,
}

fn m_construct(vm: &mut Vm, cid: ClassId, _argv: usize, _argc: usize) -> VmResult<Value> {
    vm.clean_modules();
    let exports = vm.construct(ClassId::TABLE, &[])?;
    let m = Module {
        id: vm.next_module_id(),
        exports: exports.object(),
        source: None,
        objects: Vec::new(),
        refsum: None,
        variables: Vec::new(),
        unload: None,
        moduledata: None,
    };
    let mo = vm.alloc_object(cid, Payload::Module(m))?;
    Ok(Value::ObjRef(mo))
}

/// The destructor proper. Not installed as the class destructor: the
/// installed one only queues the module for GC.
fn m_real_destruct(vm: &mut Vm, obj: ObjId) -> VmResult<()> {
    let (unload, refsum) = {
        let m = vm.module(obj)?;
        (m.unload, m.refsum)
    };
    if let Some(cb) = unload {
        let closing = vm.is_closing();
        let r = cb(vm, obj, closing);
        if r.is_err() && !closing {
            return r;
        }
    }

    if let Some(snapshot) = refsum {
        let live = vm.module_countref(obj);
        if live != snapshot {
            log::debug!(
                "module {obj} refused to unload: refsum {live}, recorded {snapshot}"
            );
            return Err(Exception::Refuse);
        }
    }

    // Static variables.
    let variables = std::mem::take(&mut vm.module_mut(obj)?.variables);
    for v in variables {
        vm.disown_value(v);
    }

    // Exports.
    if let Some(exports) = vm.module_mut(obj)?.exports.take() {
        vm.disown_object(exports);
    }

    // Owned objects. Same-module function constants are nil'ed first so the
    // teardown never chases a half-destroyed sibling. The refsum match
    // established that only internal references remain, so each object is
    // released outright regardless of leftover internal counts.
    let objects = std::mem::take(&mut vm.module_mut(obj)?.objects);
    for &o in &objects {
        if vm.object(o).classid == ClassId::FUNCTION {
            vm.function_detach(o);
        }
    }
    for o in objects.into_iter().rev() {
        if vm.object(o).refcount == 0 {
            continue;
        }
        vm.object_mut(o).refcount = 1;
        vm.disown_object(o);
    }

    vm.module_mut(obj)?.source = None;
    Ok(())
}

/// Installed destructor: queue on the dead-module list and trigger GC.
/// Returns `Refuse`; whether the module actually survived is up to the GC.
fn m_destruct(vm: &mut Vm, obj: ObjId) -> VmResult<()> {
    vm.object_mut(obj).link = ObjectLink::DeadModule;
    vm.dead_modules.push(obj);
    log::debug!("module {obj} possibly dead");
    vm.clean_modules();
    Err(Exception::Refuse)
}

fn m_getindex(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let exports = vm.module(obj)?.exports.ok_or(Exception::Internal)?;
    vm.metamethod(exports, Metamethod::GetIndex, op1, op2)
}

/// Modules are read-only from script code.
fn m_setindex(
    _vm: &mut Vm,
    _obj: ObjId,
    _op1: Option<&Value>,
    _op2: Option<&mut Value>,
) -> VmResult<()> {
    Err(Exception::CantWrite)
}

pub(crate) fn register(vm: &mut Vm) -> VmResult<()> {
    vm.register_class(
        Some(ClassId::MODULE),
        "module",
        ClassId::OBJECT,
        Some(m_construct),
        Some(m_destruct),
    )?;
    vm.set_metamethod(ClassId::MODULE, Metamethod::GetIndex, Some(m_getindex))?;
    vm.set_metamethod(ClassId::MODULE, Metamethod::SetIndex, Some(m_setindex))?;
    Ok(())
}

impl Vm {
    /// The module payload of `id`.
    pub fn module(&self, id: ObjId) -> VmResult<&Module> {
        match &self.object(id).payload {
            Payload::Module(m) => Ok(m),
            _ => Err(Exception::WrongType),
        }
    }

    pub(crate) fn module_mut(&mut self, id: ObjId) -> VmResult<&mut Module> {
        match &mut self.object_mut(id).payload {
            Payload::Module(m) => Ok(m),
            _ => Err(Exception::WrongType),
        }
    }

    pub(crate) fn next_module_id(&mut self) -> u32 {
        let id = self.module_id_counter;
        self.module_id_counter += 1;
        id
    }

    /// Creates an empty module and registers it under `name`.
    pub fn create_module(&mut self, name: &str) -> VmResult<ObjId> {
        let v = self.construct(ClassId::MODULE, &[])?;
        let mo = v.object().ok_or(Exception::Constructor)?;
        let exports = self.module(mo)?.exports.ok_or(Exception::Internal)?;
        let key = self.intern("__modname")?;
        let val = self.intern(name)?;
        let r = self.table_set(exports, Value::ObjRef(key), Value::ObjRef(val));
        self.disown_object(key);
        self.disown_object(val);
        r?;
        self.loaded_modules.insert(name.to_string(), mo);
        Ok(mo)
    }

    /// Finds a loaded module, resurrecting it from the dead-module list if
    /// its refcount had reached zero.
    pub fn get_module(&mut self, name: &str) -> Option<ObjId> {
        let mo = *self.loaded_modules.get(name)?;
        if !self.is_live(mo) {
            return None;
        }
        if self.object(mo).refcount == 0 {
            if let Some(pos) = self.dead_modules.iter().rposition(|&m| m == mo) {
                self.dead_modules.remove(pos);
                self.object_mut(mo).link = ObjectLink::None;
            }
        }
        self.own_object(mo);
        Some(mo)
    }

    /// Transfers ownership of `obj` to `module` (the module keeps it alive
    /// for its whole lifetime; the caller's reference is consumed).
    pub fn module_adopt(&mut self, module: ObjId, obj: ObjId) {
        if let Ok(m) = self.module_mut(module) {
            m.objects.push(obj);
        }
    }

    /// Appends a static variable slot, taking ownership of `value`.
    /// Returns the slot index.
    pub fn module_add_static(&mut self, module: ObjId, value: Value) -> VmResult<usize> {
        let slot = self.module(module)?.variables.len();
        let v = self.copy_value(
            value,
            crate::object::CellAddr::Static { module, slot },
        );
        self.module_mut(module)?.variables.push(v);
        Ok(slot)
    }

    /// Records the refsum snapshot. Call once the module's functions and
    /// exports are complete; destruction is refused until the live sum
    /// returns to this value.
    pub fn module_seal(&mut self, module: ObjId) -> VmResult<()> {
        let sum = self.module_countref(module);
        self.module_mut(module)?.refsum = Some(sum);
        Ok(())
    }

    /// Sum of the refcounts of the module's owned objects.
    pub fn module_countref(&self, module: ObjId) -> u32 {
        match self.module(module) {
            Ok(m) => m.objects.iter().map(|&o| self.object(o).refcount).sum(),
            Err(_) => 0,
        }
    }

    /// Garbage collects the dead-module list. Returns the number of modules
    /// actually unloaded.
    pub fn clean_modules(&mut self) -> usize {
        if self.module_lock > 0 {
            return 0;
        }
        self.module_lock += 1;
        let mut unloaded = 0;
        let mut i = 0;
        while i < self.dead_modules.len() {
            let mo = self.dead_modules[i];
            match m_real_destruct(self, mo) {
                Err(_) => {
                    // Refused, or the unload hook failed; retry later.
                    i += 1;
                }
                Ok(()) => {
                    self.dead_modules.remove(i);
                    self.object_mut(mo).link = ObjectLink::None;
                    let name = self
                        .loaded_modules
                        .iter()
                        .find(|&(_, &m)| m == mo)
                        .map(|(k, _)| k.clone());
                    if let Some(name) = name {
                        self.loaded_modules.remove(&name);
                    }
                    self.kill_weakrefs(mo);
                    self.free_object(mo);
                    unloaded += 1;
                }
            }
        }
        self.module_lock -= 1;
        unloaded
    }

    /// Runs module GC to a fixed point (used during shutdown, where each
    /// unload can release references that let further modules go).
    pub(crate) fn clean_modules_fixpoint(&mut self) {
        while self.clean_modules() > 0 {}
    }

    /// Installs the unload hook.
    pub fn set_unload(&mut self, module: ObjId, cb: UnloadCallback) -> VmResult<()> {
        self.module_mut(module)?.unload = Some(cb);
        Ok(())
    }
}
