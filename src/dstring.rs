//! The dstring class: a mutable, growable byte-buffer string.
//!
//! Distinct from the immutable interned string. Write, insert and delete
//! shift bytes in place; capacity follows the shared grow-by-3/2,
//! shrink-with-hysteresis heuristic so element churn near a size boundary
//! does not thrash the allocator.

use crate::class::{ClassId, Metamethod};
use crate::error::{Exception, VmResult};
use crate::memory::calcresize;
use crate::object::Payload;
use crate::strings::{bytes_compare, bytes_in, index_value, parse_real_prefix};
use crate::value::{ObjId, Value};
use crate::vm::Vm;

/// Capacity floor for dstring buffers.
const DSTRING_SIZEBASE: usize = 32;

/// Payload of a dstring.
pub struct DString {
    buf: Vec<u8>,
}

impl DString {
    pub(crate) fn from_bytes(b: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(calcresize(DSTRING_SIZEBASE, 0, b.len().max(1)));
        buf.extend_from_slice(b);
        DString { buf }
    }

    /// Current contents.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Adjusts capacity for a new length, then sets the length. Growth and
    /// shrink both go through `calcresize`.
    fn set_size(&mut self, newlen: usize) {
        let cap = self.buf.capacity();
        let want = calcresize(DSTRING_SIZEBASE, cap, newlen);
        if want > cap {
            self.buf.reserve_exact(want - self.buf.len());
        } else if want < cap {
            self.buf.shrink_to(want);
        }
    }

    /// Overwrites bytes starting at `pos`, extending (zero-filling any gap)
    /// as needed.
    pub fn write(&mut self, pos: usize, data: &[u8]) {
        let end = pos + data.len();
        if end > self.buf.len() {
            self.set_size(end);
            if pos > self.buf.len() {
                self.buf.resize(pos, 0);
            }
            self.buf.resize(end, 0);
        }
        self.buf[pos..end].copy_from_slice(data);
    }

    /// Inserts bytes at `pos`, shifting the tail up.
    pub fn insert(&mut self, pos: usize, data: &[u8]) {
        self.set_size(self.buf.len() + data.len());
        for (i, &b) in data.iter().enumerate() {
            self.buf.insert(pos + i, b);
        }
    }

    /// Deletes `count` bytes starting at `pos`, shifting the tail down.
    pub fn delete(&mut self, pos: usize, count: usize) {
        self.buf.drain(pos..pos + count);
        let len = self.buf.len();
        self.set_size(len);
    }
}

impl Vm {
    /// Creates a dstring with the given contents. The returned object owns
    /// one reference.
    pub fn new_dstring(&mut self, bytes: &[u8]) -> VmResult<ObjId> {
        self.alloc_object(ClassId::DSTRING, Payload::DString(DString::from_bytes(bytes)))
    }

    /// The dstring payload of `id`.
    pub fn dstring(&self, id: ObjId) -> VmResult<&DString> {
        match &self.object(id).payload {
            Payload::DString(ds) => Ok(ds),
            _ => Err(Exception::WrongType),
        }
    }

    pub(crate) fn dstring_mut(&mut self, id: ObjId) -> VmResult<&mut DString> {
        match &mut self.object_mut(id).payload {
            Payload::DString(ds) => Ok(ds),
            _ => Err(Exception::WrongType),
        }
    }
}

fn ds_construct(vm: &mut Vm, _cid: ClassId, argv: usize, argc: usize) -> VmResult<Value> {
    let mut buf = Vec::with_capacity(argc);
    for i in 0..argc {
        let v = vm.heap[argv + i];
        // A single string initializer copies its contents.
        if argc == 1 {
            if let Some(bytes) = vm.value_bytes(&v) {
                let bytes = bytes.to_vec();
                let id = vm.new_dstring(&bytes)?;
                return Ok(Value::ObjRef(id));
            }
        }
        let b = v.as_int().ok_or(Exception::Arguments)?;
        if !(0..=255).contains(&b) {
            return Err(Exception::Arguments);
        }
        buf.push(b as u8);
    }
    let id = vm.new_dstring(&buf)?;
    Ok(Value::ObjRef(id))
}

fn ds_destruct(_vm: &mut Vm, _obj: ObjId) -> VmResult<()> {
    // The buffer is owned by the payload and goes with the slab slot.
    Ok(())
}

fn ds_getindex(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let i = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    let ds = vm.dstring(obj)?;
    if i < 0 {
        return Err(Exception::LowIndex);
    }
    if i as usize >= ds.len() {
        return Err(Exception::HighIndex);
    }
    let b = ds.bytes()[i as usize];
    *op2.ok_or(Exception::Internal)? = Value::Integer(b as i32);
    Ok(())
}

fn ds_setindex(
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
    let b = v.as_int().ok_or(Exception::WrongType)?;
    let ds = vm.dstring_mut(obj)?;
    ds.write(i as usize, &[b as u8]);
    Ok(())
}

fn ds_in(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let key = op1.ok_or(Exception::WrongType)?;
    let out = op2.ok_or(Exception::Internal)?;
    let found = match key {
        Value::Integer(_) | Value::Boolean(_) | Value::ClassId(_) | Value::Real(_) => {
            let c = index_value(key)?;
            if !(0..=255).contains(&c) {
                Value::Boolean(false)
            } else {
                bytes_in(vm.dstring(obj)?.bytes(), &[c as u8])
            }
        }
        Value::ObjRef(_) | Value::WeakRef { .. } => {
            let needle = vm
                .value_bytes(key)
                .ok_or(Exception::WrongType)?
                .to_vec();
            bytes_in(vm.dstring(obj)?.bytes(), &needle)
        }
        _ => return Err(Exception::WrongType),
    };
    *out = found;
    Ok(())
}

fn ds_insert(
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
    let data: Vec<u8> = match vm.value_bytes(&v) {
        Some(b) => b.to_vec(),
        None => {
            let b = v.as_int().ok_or(Exception::WrongType)?;
            vec![b as u8]
        }
    };
    let ds = vm.dstring_mut(obj)?;
    if i as usize > ds.len() {
        return Err(Exception::HighIndex);
    }
    ds.insert(i as usize, &data);
    Ok(())
}

fn ds_delete(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let len = vm.dstring(obj)?.len() as i32;
    let (i0, i1) = crate::vm::delete_range(op1, op2.as_deref(), len)?;
    if i1 < i0 {
        return Ok(());
    }
    let ds = vm.dstring_mut(obj)?;
    ds.delete(i0 as usize, (i1 - i0 + 1) as usize);
    Ok(())
}

fn ds_copy(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let out = op2.ok_or(Exception::WrongIndex)?;
    let start = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    let length = index_value(out)?;
    let ds = vm.dstring(obj)?;
    if start < 0 {
        return Err(Exception::LowIndex);
    }
    if length < 0 {
        return Err(Exception::WrongIndex);
    }
    if (start + length) as usize > ds.len() {
        return Err(Exception::HighIndex);
    }
    let sub = ds.bytes()[start as usize..(start + length) as usize].to_vec();
    let id = vm.new_dstring(&sub)?;
    *out = Value::ObjRef(id);
    Ok(())
}

fn ds_length(
    vm: &mut Vm,
    obj: ObjId,
    _op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let len = vm.dstring(obj)?.len() as i32;
    *op2.ok_or(Exception::Internal)? = Value::Integer(len);
    Ok(())
}

fn ds_compare(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let key = op1.ok_or(Exception::WrongType)?;
    if !key.is_objref() {
        return Err(Exception::WrongType);
    }
    let out = op2.ok_or(Exception::Internal)?;
    if key.object() == Some(obj) {
        *out = Value::Integer(0);
        return Ok(());
    }
    let other = vm
        .value_bytes(key)
        .ok_or(Exception::NotImplemented)?
        .to_vec();
    let r = bytes_compare(vm.dstring(obj)?.bytes(), &other);
    *out = Value::Integer(r);
    Ok(())
}

fn ds_eq(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let key = op1.ok_or(Exception::BadType)?;
    let out = op2.ok_or(Exception::Internal)?;
    let eq = match key.object() {
        Some(o) if o == obj => true,
        Some(_) => match vm.value_bytes(key) {
            Some(other) => other == vm.dstring(obj)?.bytes(),
            None => false,
        },
        None => false,
    };
    *out = Value::Boolean(eq);
    Ok(())
}

fn ds_add(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let rhs = op1.ok_or(Exception::NotImplemented)?;
    let out = op2.ok_or(Exception::Internal)?;
    let rhs_bytes = vm
        .value_bytes(rhs)
        .ok_or(Exception::NotImplemented)?
        .to_vec();
    let mut buf = vm.dstring(obj)?.bytes().to_vec();
    buf.extend_from_slice(&rhs_bytes);
    let id = vm.new_dstring(&buf)?;
    *out = Value::ObjRef(id);
    Ok(())
}

fn ds_ipadd(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let rhs = op1.ok_or(Exception::NotImplemented)?;
    let out = op2.ok_or(Exception::Internal)?;
    let rhs_bytes = vm
        .value_bytes(rhs)
        .ok_or(Exception::NotImplemented)?
        .to_vec();
    let ds = vm.dstring_mut(obj)?;
    let pos = ds.len();
    ds.write(pos, &rhs_bytes);
    vm.own_object(obj);
    *out = Value::ObjRef(obj);
    Ok(())
}

// Casts.

fn cast_clone(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let o = src.object().ok_or(Exception::WrongType)?;
    let bytes = vm.dstring(o)?.bytes().to_vec();
    let id = vm.new_dstring(&bytes)?;
    Ok(Value::ObjRef(id))
}

fn cast_to_string(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let o = src.object().ok_or(Exception::WrongType)?;
    let bytes = vm.dstring(o)?.bytes().to_vec();
    let id = vm.intern_bytes(&bytes)?;
    Ok(Value::ObjRef(id))
}

fn cast_to_real(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let o = src.object().ok_or(Exception::WrongType)?;
    Ok(Value::Real(parse_real_prefix(vm.dstring(o)?.bytes())))
}

fn cast_to_integer(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let o = src.object().ok_or(Exception::WrongType)?;
    Ok(Value::Integer(
        parse_real_prefix(vm.dstring(o)?.bytes()).floor() as i32,
    ))
}

fn cast_from_any(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let s = vm.value_repr(src);
    let id = vm.new_dstring(s.as_bytes())?;
    Ok(Value::ObjRef(id))
}

pub(crate) fn register(vm: &mut Vm) -> VmResult<()> {
    use crate::class::CastSelector::Class;

    vm.register_class(
        Some(ClassId::DSTRING),
        "dstring",
        ClassId::OBJECT,
        Some(ds_construct),
        Some(ds_destruct),
    )?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::GetIndex, Some(ds_getindex))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::SetIndex, Some(ds_setindex))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::In, Some(ds_in))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::Insert, Some(ds_insert))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::Delete, Some(ds_delete))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::Copy, Some(ds_copy))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::Length, Some(ds_length))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::Compare, Some(ds_compare))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::Eq, Some(ds_eq))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::Add, Some(ds_add))?;
    vm.set_metamethod(ClassId::DSTRING, Metamethod::IpAdd, Some(ds_ipadd))?;

    vm.set_casts(Class(ClassId::DSTRING), Class(ClassId::DSTRING), cast_clone)?;
    vm.set_casts(
        Class(ClassId::DSTRING),
        Class(ClassId::STRING),
        cast_to_string,
    )?;
    vm.set_casts(Class(ClassId::DSTRING), Class(ClassId::REAL), cast_to_real)?;
    vm.set_casts(
        Class(ClassId::DSTRING),
        Class(ClassId::INTEGER),
        cast_to_integer,
    )?;
    for from in [
        ClassId::NIL,
        ClassId::REAL,
        ClassId::INTEGER,
        ClassId::BOOLEAN,
        ClassId::CLASSID,
    ] {
        vm.set_casts(Class(from), Class(ClassId::DSTRING), cast_from_any)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_extends_and_overwrites() {
        let mut ds = DString::from_bytes(b"hello");
        ds.write(1, b"a");
        assert_eq!(ds.bytes(), b"hallo");
        ds.write(5, b"!!");
        assert_eq!(ds.bytes(), b"hallo!!");
        ds.write(9, b"x");
        assert_eq!(ds.bytes(), b"hallo!!\0\0x");
    }

    #[test]
    fn insert_then_delete_restores() {
        let mut ds = DString::from_bytes(b"abcd");
        ds.insert(2, b"XY");
        assert_eq!(ds.bytes(), b"abXYcd");
        ds.delete(2, 2);
        assert_eq!(ds.bytes(), b"abcd");
    }
}
