//! The function class.
//!
//! A function is either compiled bytecode (code, constants, frame and
//! clean-table sizes, optional line table) or a native callback. Any
//! top-level script code also compiles into a function, so "function" is
//! the only executable unit the VM knows.

use std::any::Any;
use std::rc::Rc;

use bitflags::bitflags;

use crate::class::{ClassId, Metamethod};
use crate::error::{Exception, VmResult};
use crate::object::Payload;
use crate::value::{ObjId, Value};
use crate::vm::Vm;

bitflags! {
    /// Function property flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionFlags: u16 {
        /// Native (host) function.
        const CFUNC = 0x0001;
        /// Takes arguments.
        const ARGS = 0x0002;
        /// Produces a result.
        const RESULTS = 0x0004;
        /// Forward declaration, not yet defined.
        const DECLARATION = 0x0008;
        /// Module top-level function.
        const ROOT = 0x0010;
        /// Exported from its module.
        const EXPORT = 0x0020;
        /// Uses upvalues.
        const UPVALUES = 0x0040;
        /// Exception block (try body or catcher).
        const XBLOCK = 0x0080;
    }
}

/// Signature of a native function. Arguments are at
/// `vm.heap[vm.argv..vm.argv + vm.argc]`; a result, if declared, is written
/// with [`Vm::set_result`].
pub type NativeCallback = fn(&mut Vm) -> VmResult<()>;

/// Body of a bytecode function.
pub struct BytecodeBody {
    /// Number of work registers.
    pub framesize: u16,
    /// Maximum clean-table occupancy.
    pub cleansize: u16,
    /// Constant pool. Object constants own their referents.
    pub constants: Vec<Value>,
    /// Encoded instructions.
    pub code: Rc<Vec<u8>>,
    /// Source line per code byte offset, if debug info was kept.
    pub lines: Option<Vec<u32>>,
}

/// Executable body.
pub enum FunctionKind {
    Bytecode(BytecodeBody),
    Native(NativeCallback),
}

/// Function object payload.
pub struct Function {
    /// Owning module.
    pub module: Option<ObjId>,
    /// Interned name.
    pub name: Option<ObjId>,
    pub flags: FunctionFlags,
    /// Result count (0 or 1).
    pub results: u8,
    /// Required argument count.
    pub reqargs: u8,
    /// Optional argument count; 255 means unbounded.
    pub optargs: u8,
    /// Arguments per tuple; 0 means no tuple arguments.
    pub tupargs: u8,
    pub kind: FunctionKind,
}

impl Function {
    /// True for native functions.
    pub fn is_native(&self) -> bool {
        self.flags.contains(FunctionFlags::CFUNC)
    }

    /// The bytecode body, if any.
    pub fn body(&self) -> Option<&BytecodeBody> {
        match &self.kind {
            FunctionKind::Bytecode(b) => Some(b),
            FunctionKind::Native(_) => None,
        }
    }

    /// Checks call prototype compatibility (used when resolving forward
    /// declarations).
    pub fn compatible_with(&self, other: &Function) -> bool {
        const MASK: FunctionFlags = FunctionFlags::ARGS.union(FunctionFlags::RESULTS);
        self.flags & MASK == other.flags & MASK
            && self.results == other.results
            && self.reqargs == other.reqargs
            && self.optargs == other.optargs
            && self.tupargs == other.tupargs
    }
}

/// Interned member names shared by all function instances.
struct FunctionClassData {
    i_name: ObjId,
    i_module: ObjId,
    i_results: ObjId,
    i_reqargs: ObjId,
    i_optargs: ObjId,
    i_tupargs: ObjId,
}

fn f_destruct(vm: &mut Vm, obj: ObjId) -> VmResult<()> {
    let (name, constants) = {
        let f = match &mut vm.object_mut(obj).payload {
            Payload::Function(f) => f,
            _ => return Err(Exception::Internal),
        };
        let constants = match &mut f.kind {
            FunctionKind::Bytecode(b) => std::mem::take(&mut b.constants),
            FunctionKind::Native(_) => Vec::new(),
        };
        (f.name.take(), constants)
    };
    for c in constants {
        vm.disown_value(c);
    }
    if let Some(n) = name {
        vm.disown_object(n);
    }
    Ok(())
}

/// `f.name`, `f.module` etc. read function properties by interned-name
/// identity.
fn f_getindex(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let key = op1.ok_or(Exception::WrongIndex)?;
    let Some(ko) = key.object() else {
        return Err(Exception::WrongIndex);
    };
    let out = op2.ok_or(Exception::Internal)?;
    let cd = vm
        .classdef(ClassId::FUNCTION)?
        .classdata
        .as_ref()
        .and_then(|d| d.downcast_ref::<FunctionClassData>())
        .ok_or(Exception::Internal)?;
    let (i_name, i_module, i_results, i_reqargs, i_optargs, i_tupargs) = (
        cd.i_name,
        cd.i_module,
        cd.i_results,
        cd.i_reqargs,
        cd.i_optargs,
        cd.i_tupargs,
    );
    let f = vm.function(obj)?;
    let v = if ko == i_name {
        f.name.map(Value::ObjRef).unwrap_or(Value::Nil)
    } else if ko == i_module {
        f.module.map(Value::ObjRef).unwrap_or(Value::Nil)
    } else if ko == i_results {
        Value::Integer(f.results as i32)
    } else if ko == i_reqargs {
        Value::Integer(f.reqargs as i32)
    } else if ko == i_optargs {
        Value::Integer(f.optargs as i32)
    } else if ko == i_tupargs {
        Value::Integer(f.tupargs as i32)
    } else {
        return Err(Exception::WrongIndex);
    };
    if let Value::ObjRef(o) = v {
        vm.own_object(o);
    }
    *out = v;
    Ok(())
}

fn f_unregister(vm: &mut Vm, _cid: ClassId, classdata: Option<Box<dyn Any>>) {
    if let Some(cd) = classdata.and_then(|d| d.downcast::<FunctionClassData>().ok()) {
        vm.disown_object(cd.i_name);
        vm.disown_object(cd.i_module);
        vm.disown_object(cd.i_results);
        vm.disown_object(cd.i_reqargs);
        vm.disown_object(cd.i_optargs);
        vm.disown_object(cd.i_tupargs);
    }
}

pub(crate) fn register(vm: &mut Vm) -> VmResult<()> {
    vm.register_class(
        Some(ClassId::FUNCTION),
        "function",
        ClassId::OBJECT,
        None,
        Some(f_destruct),
    )?;
    vm.set_metamethod(ClassId::FUNCTION, Metamethod::GetIndex, Some(f_getindex))?;
    let cd = FunctionClassData {
        i_name: vm.intern("name")?,
        i_module: vm.intern("module")?,
        i_results: vm.intern("results")?,
        i_reqargs: vm.intern("reqargs")?,
        i_optargs: vm.intern("optargs")?,
        i_tupargs: vm.intern("tupargs")?,
    };
    vm.set_unregister(ClassId::FUNCTION, f_unregister)?;
    vm.set_classdata(ClassId::FUNCTION, Box::new(cd))?;
    Ok(())
}

impl Vm {
    /// The function payload of `id`.
    pub fn function(&self, id: ObjId) -> VmResult<&Function> {
        match &self.object(id).payload {
            Payload::Function(f) => Ok(f),
            _ => Err(Exception::NeedCallable),
        }
    }

    pub(crate) fn function_mut(&mut self, id: ObjId) -> VmResult<&mut Function> {
        match &mut self.object_mut(id).payload {
            Payload::Function(f) => Ok(f),
            _ => Err(Exception::NeedCallable),
        }
    }

    /// Nils constants that refer to functions of the same module, so module
    /// teardown never walks into half-destroyed siblings. The nil'ed slots
    /// are deliberately not disowned; the module is dropping its ownership
    /// of every member function as a whole.
    pub(crate) fn function_detach(&mut self, id: ObjId) {
        let Ok(f) = self.function(id) else { return };
        let module = f.module;
        let n = match f.body() {
            Some(b) => b.constants.len(),
            None => return,
        };
        for i in 0..n {
            let c = match self.function(id).unwrap().body().unwrap().constants.get(i) {
                Some(v) => *v,
                None => continue,
            };
            let Some(co) = c.object() else { continue };
            let same_module = matches!(
                &self.object(co).payload,
                Payload::Function(cf) if cf.module == module
            );
            if same_module {
                if let Ok(f) = self.function_mut(id) {
                    if let FunctionKind::Bytecode(b) = &mut f.kind {
                        b.constants[i] = Value::Nil;
                    }
                }
            }
        }
    }

    /// Creates a native function object attached to `module`.
    #[allow(clippy::too_many_arguments)]
    pub fn register_cfunction(
        &mut self,
        module: ObjId,
        results: u8,
        name: &str,
        reqargs: u8,
        optargs: i32,
        tupargs: u8,
        cb: NativeCallback,
    ) -> VmResult<ObjId> {
        if results > 1 {
            return Err(Exception::Arguments);
        }
        if optargs != 0 && tupargs != 0 {
            // Optional and tuple arguments cannot be combined.
            return Err(Exception::Arguments);
        }
        let optargs = if optargs < 0 {
            255
        } else if optargs > 255 {
            return Err(Exception::Arguments);
        } else {
            optargs as u8
        };
        let mut flags = FunctionFlags::CFUNC;
        if results > 0 {
            flags |= FunctionFlags::RESULTS;
        }
        if reqargs > 0 || optargs > 0 || tupargs > 0 {
            flags |= FunctionFlags::ARGS;
        }
        let name = self.intern(name)?;
        let f = Function {
            module: Some(module),
            name: Some(name),
            flags,
            results,
            reqargs,
            optargs,
            tupargs,
            kind: FunctionKind::Native(cb),
        };
        let fo = self.alloc_object(ClassId::FUNCTION, Payload::Function(f))?;
        self.module_adopt(module, fo);
        Ok(fo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prototype_compatibility_checks_arity() {
        let f = |req: u8, res: u8| Function {
            module: None,
            name: None,
            flags: if res > 0 {
                FunctionFlags::RESULTS
            } else {
                FunctionFlags::empty()
            },
            results: res,
            reqargs: req,
            optargs: 0,
            tupargs: 0,
            kind: FunctionKind::Native(|_| Ok(())),
        };
        assert!(f(2, 1).compatible_with(&f(2, 1)));
        assert!(!f(2, 1).compatible_with(&f(3, 1)));
        assert!(!f(2, 1).compatible_with(&f(2, 0)));
    }
}
