//! The array class: a growable vector of values.
//!
//! Writing past the end zero-fills the gap with `nil` and extends. Insert
//! and delete shift elements; any weak references crossing the shifted
//! range get their recorded cell addresses relocated.

use crate::class::{ClassId, Metamethod};
use crate::error::{Exception, VmResult};
use crate::object::{CellAddr, Payload};
use crate::strings::index_value;
use crate::value::{ObjId, Value};
use crate::vm::{delete_range, Vm};

impl Vm {
    /// The element vector of an array object.
    pub fn array(&self, id: ObjId) -> VmResult<&Vec<Value>> {
        match &self.object(id).payload {
            Payload::Array(v) => Ok(v),
            _ => Err(Exception::WrongType),
        }
    }

    pub(crate) fn array_mut(&mut self, id: ObjId) -> VmResult<&mut Vec<Value>> {
        match &mut self.object_mut(id).payload {
            Payload::Array(v) => Ok(v),
            _ => Err(Exception::WrongType),
        }
    }

    /// Re-records the cell addresses of weakref elements in `range` after
    /// the elements moved to their current indices.
    fn array_relocate(&mut self, id: ObjId, range: std::ops::Range<usize>) {
        for i in range {
            let v = match self.array(id) {
                Ok(values) => match values.get(i) {
                    Some(v) => *v,
                    None => continue,
                },
                Err(_) => return,
            };
            if matches!(v, Value::WeakRef { .. }) {
                self.weakref_relocate(v, CellAddr::ArrayItem { array: id, index: i });
            }
        }
    }

    /// Writes `value` at `index` with ownership transfer, zero-filling any
    /// gap with `nil`.
    pub fn array_set(&mut self, id: ObjId, index: usize, value: Value) -> VmResult<()> {
        let len = self.array(id)?.len();
        if index >= len {
            self.array_mut(id)?.resize(index + 1, Value::Nil);
        } else {
            let old = self.array(id)?[index];
            self.disown_value(old);
        }
        let v = self.copy_value(value, CellAddr::ArrayItem { array: id, index });
        self.array_mut(id)?[index] = v;
        Ok(())
    }
}

fn a_construct(vm: &mut Vm, cid: ClassId, argv: usize, argc: usize) -> VmResult<Value> {
    let id = vm.alloc_object(cid, Payload::Array(Vec::with_capacity(argc.max(8))))?;
    for i in 0..argc {
        let v = vm.heap[argv + i];
        let v = vm.copy_value(v, CellAddr::ArrayItem { array: id, index: i });
        vm.array_mut(id)?.push(v);
    }
    Ok(Value::ObjRef(id))
}

fn a_destruct(vm: &mut Vm, obj: ObjId) -> VmResult<()> {
    let values = std::mem::take(vm.array_mut(obj)?);
    for v in values {
        vm.disown_value(v);
    }
    Ok(())
}

fn a_getindex(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let i = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    if i < 0 {
        return Err(Exception::LowIndex);
    }
    let values = vm.array(obj)?;
    if i as usize >= values.len() {
        return Err(Exception::HighIndex);
    }
    let v = values[i as usize];
    // Reads promote weakrefs to owned objrefs.
    let v = match v {
        Value::WeakRef { target, .. } => Value::ObjRef(target),
        other => other,
    };
    vm.own_value(&v);
    *op2.ok_or(Exception::Internal)? = v;
    Ok(())
}

fn a_setindex(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let i = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    if i < 0 {
        return Err(Exception::LowIndex);
    }
    let v = *op2.ok_or(Exception::WrongType)?;
    vm.array_set(obj, i as usize, v)
}

fn a_insert(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let i = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    if i < 0 {
        return Err(Exception::LowIndex);
    }
    let i = i as usize;
    let v = *op2.ok_or(Exception::WrongType)?;
    let len = vm.array(obj)?.len();
    if i > len {
        return Err(Exception::HighIndex);
    }
    vm.array_mut(obj)?.insert(i, Value::Nil);
    // Everything above the insertion point moved up one slot.
    vm.array_relocate(obj, i + 1..len + 1);
    let v = vm.copy_value(v, CellAddr::ArrayItem { array: obj, index: i });
    vm.array_mut(obj)?[i] = v;
    Ok(())
}

fn a_delete(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let len = vm.array(obj)?.len() as i32;

    // Deleting by object reference searches for the element.
    let (i0, i1) = if let Some(key) = op1.filter(|k| k.is_objref()) {
        let target = key.object();
        let pos = vm
            .array(obj)?
            .iter()
            .position(|v| v.object() == target)
            .ok_or(Exception::WrongIndex)?;
        (pos as i32, pos as i32)
    } else {
        delete_range(op1, op2.as_deref(), len)?
    };
    if i1 < i0 {
        return Ok(());
    }
    for i in i0..=i1 {
        let v = vm.array(obj)?[i as usize];
        vm.disown_value(v);
    }
    vm.array_mut(obj)?.drain(i0 as usize..(i1 + 1) as usize);
    let new_len = vm.array(obj)?.len();
    vm.array_relocate(obj, i0 as usize..new_len);
    Ok(())
}

pub(crate) fn array_clone(vm: &mut Vm, src: ObjId) -> VmResult<ObjId> {
    let len = vm.array(src)?.len();
    let cid = vm.object(src).classid;
    let clone = vm.alloc_object(cid, Payload::Array(Vec::with_capacity(len)))?;
    for i in 0..len {
        let v = vm.array(src)?[i];
        let v = vm.clone_value(v, CellAddr::ArrayItem { array: clone, index: i });
        vm.array_mut(clone)?.push(v);
    }
    Ok(clone)
}

fn a_clone_cast(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let so = src.object().ok_or(Exception::WrongType)?;
    let clone = array_clone(vm, so)?;
    Ok(Value::ObjRef(clone))
}

/// `a + x` clones, then appends `x`.
fn a_add(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let v = *op1.ok_or(Exception::WrongType)?;
    let out = op2.ok_or(Exception::Internal)?;
    let clone = array_clone(vm, obj)?;
    let len = vm.array(clone)?.len();
    if let Err(x) = vm.array_set(clone, len, v) {
        vm.disown_object(clone);
        return Err(x);
    }
    *out = Value::ObjRef(clone);
    Ok(())
}

/// `a .+ x` appends in place and returns the array itself.
fn a_ipadd(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let v = *op1.ok_or(Exception::WrongType)?;
    let out = op2.ok_or(Exception::Internal)?;
    let len = vm.array(obj)?.len();
    vm.array_set(obj, len, v)?;
    vm.own_object(obj);
    *out = Value::ObjRef(obj);
    Ok(())
}

/// Slice copy: `copy(start, length)` yields a fresh array of clones.
fn a_copy(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let out = op2.ok_or(Exception::WrongIndex)?;
    let start = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    let length = index_value(out)?;
    let len = vm.array(obj)?.len() as i32;
    if start < 0 {
        return Err(Exception::LowIndex);
    }
    if start >= len {
        return Err(Exception::HighIndex);
    }
    if length <= 0 {
        return Err(Exception::WrongIndex);
    }
    if start + length > len {
        return Err(Exception::HighIndex);
    }
    let slice = vm.alloc_object(
        ClassId::ARRAY,
        Payload::Array(Vec::with_capacity(length as usize)),
    )?;
    for i in 0..length as usize {
        let v = vm.array(obj)?[start as usize + i];
        let v = vm.clone_value(v, CellAddr::ArrayItem { array: slice, index: i });
        vm.array_mut(slice)?.push(v);
    }
    *out = Value::ObjRef(slice);
    Ok(())
}

fn a_length(
    vm: &mut Vm,
    obj: ObjId,
    _op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let len = vm.array(obj)?.len() as i32;
    *op2.ok_or(Exception::Internal)? = Value::Integer(len);
    Ok(())
}

fn a_compare(
    _vm: &mut Vm,
    _obj: ObjId,
    _op1: Option<&Value>,
    _op2: Option<&mut Value>,
) -> VmResult<()> {
    Err(Exception::NotImplemented)
}

pub(crate) fn register(vm: &mut Vm) -> VmResult<()> {
    use crate::class::CastSelector::Class;

    vm.register_class(
        Some(ClassId::ARRAY),
        "array",
        ClassId::OBJECT,
        Some(a_construct),
        Some(a_destruct),
    )?;
    vm.set_metamethod(ClassId::ARRAY, Metamethod::GetIndex, Some(a_getindex))?;
    vm.set_metamethod(ClassId::ARRAY, Metamethod::SetIndex, Some(a_setindex))?;
    vm.set_metamethod(ClassId::ARRAY, Metamethod::Insert, Some(a_insert))?;
    vm.set_metamethod(ClassId::ARRAY, Metamethod::Delete, Some(a_delete))?;
    vm.set_metamethod(ClassId::ARRAY, Metamethod::Copy, Some(a_copy))?;
    vm.set_metamethod(ClassId::ARRAY, Metamethod::Length, Some(a_length))?;
    vm.set_metamethod(ClassId::ARRAY, Metamethod::Compare, Some(a_compare))?;
    vm.set_metamethod(ClassId::ARRAY, Metamethod::Add, Some(a_add))?;
    vm.set_metamethod(ClassId::ARRAY, Metamethod::IpAdd, Some(a_ipadd))?;
    vm.set_casts(Class(ClassId::ARRAY), Class(ClassId::ARRAY), a_clone_cast)?;
    Ok(())
}
