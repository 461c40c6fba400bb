//! Typed numeric vector classes.
//!
//! Eight packed subclasses (`vector_u8` through `vector_d`) share one
//! implementation; the virtual base class `vector` constructs the default
//! subclass (`vector_d`). Reads convert up to `integer` or `real`; writes
//! convert down, flooring reals destined for the integer subclasses.
//! The element-wise arithmetic metamethods broadcast scalar operands and
//! combine two vectors index by index.

use crate::class::{ClassId, Metamethod};
use crate::error::{Exception, VmResult};
use crate::memory::calcresize;
use crate::object::Payload;
use crate::strings::index_value;
use crate::value::{ObjId, Value};
use crate::vm::{delete_range, Vm};

/// Capacity floor for vector buffers.
const VECTOR_SIZEBASE: usize = 8;

/// Default subclass constructed by the `vector` base class.
const DEFAULT_SUBCLASS: ClassId = ClassId::VECTOR_D;

/// Packed storage, one variant per subclass.
pub enum VectorData {
    U8(Vec<u8>),
    S8(Vec<i8>),
    U16(Vec<u16>),
    S16(Vec<i16>),
    U32(Vec<u32>),
    S32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! for_each_buffer {
    ($self:expr, $v:ident => $e:expr) => {
        match $self {
            VectorData::U8($v) => $e,
            VectorData::S8($v) => $e,
            VectorData::U16($v) => $e,
            VectorData::S16($v) => $e,
            VectorData::U32($v) => $e,
            VectorData::S32($v) => $e,
            VectorData::F32($v) => $e,
            VectorData::F64($v) => $e,
        }
    };
}

impl VectorData {
    /// Fresh storage for subclass `cid`.
    pub(crate) fn for_class(cid: ClassId) -> VmResult<VectorData> {
        Ok(match cid {
            ClassId::VECTOR_U8 => VectorData::U8(Vec::new()),
            ClassId::VECTOR_S8 => VectorData::S8(Vec::new()),
            ClassId::VECTOR_U16 => VectorData::U16(Vec::new()),
            ClassId::VECTOR_S16 => VectorData::S16(Vec::new()),
            ClassId::VECTOR_U32 => VectorData::U32(Vec::new()),
            ClassId::VECTOR_S32 => VectorData::S32(Vec::new()),
            ClassId::VECTOR_F => VectorData::F32(Vec::new()),
            ClassId::VECTOR_D => VectorData::F64(Vec::new()),
            _ => return Err(Exception::WrongType),
        })
    }

    pub fn len(&self) -> usize {
        for_each_buffer!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Integer view of element `i`; zero outside the vector (the broadcast
    /// rule for mismatched lengths).
    pub fn get_int(&self, i: usize) -> i32 {
        match self {
            VectorData::U8(v) => v.get(i).copied().unwrap_or(0) as i32,
            VectorData::S8(v) => v.get(i).copied().unwrap_or(0) as i32,
            VectorData::U16(v) => v.get(i).copied().unwrap_or(0) as i32,
            VectorData::S16(v) => v.get(i).copied().unwrap_or(0) as i32,
            VectorData::U32(v) => v.get(i).copied().unwrap_or(0) as i32,
            VectorData::S32(v) => v.get(i).copied().unwrap_or(0),
            VectorData::F32(v) => v.get(i).copied().unwrap_or(0.0).floor() as i32,
            VectorData::F64(v) => v.get(i).copied().unwrap_or(0.0).floor() as i32,
        }
    }

    /// Real view of element `i`; zero outside the vector.
    pub fn get_real(&self, i: usize) -> f64 {
        match self {
            VectorData::U8(v) => v.get(i).copied().unwrap_or(0) as f64,
            VectorData::S8(v) => v.get(i).copied().unwrap_or(0) as f64,
            VectorData::U16(v) => v.get(i).copied().unwrap_or(0) as f64,
            VectorData::S16(v) => v.get(i).copied().unwrap_or(0) as f64,
            VectorData::U32(v) => v.get(i).copied().unwrap_or(0) as f64,
            VectorData::S32(v) => v.get(i).copied().unwrap_or(0) as f64,
            VectorData::F32(v) => v.get(i).copied().unwrap_or(0.0) as f64,
            VectorData::F64(v) => v.get(i).copied().unwrap_or(0.0),
        }
    }

    /// Element read, up-converted to the matching value tag.
    pub fn get_value(&self, i: usize) -> Value {
        match self {
            VectorData::F32(_) | VectorData::F64(_) => Value::Real(self.get_real(i)),
            _ => Value::Integer(self.get_int(i)),
        }
    }

    /// Truncating write. `nil` writes zero; reals destined for the integer
    /// subclasses are floored.
    pub fn set_value(&mut self, i: usize, v: &Value) -> VmResult<()> {
        let (iv, rv) = match *v {
            Value::Nil => (0i64, 0.0f64),
            Value::Integer(n) => (n as i64, n as f64),
            Value::Boolean(b) => (b as i64, b as i64 as f64),
            Value::ClassId(c) => (c.raw() as i64, c.raw() as f64),
            Value::Real(r) => (r.floor() as i64, r),
            _ => return Err(Exception::WrongType),
        };
        match self {
            VectorData::U8(b) => b[i] = iv as u8,
            VectorData::S8(b) => b[i] = iv as i8,
            VectorData::U16(b) => b[i] = iv as u16,
            VectorData::S16(b) => b[i] = iv as i16,
            VectorData::U32(b) => b[i] = iv as u32,
            VectorData::S32(b) => b[i] = iv as i32,
            VectorData::F32(b) => b[i] = rv as f32,
            VectorData::F64(b) => b[i] = rv,
        }
        Ok(())
    }

    /// Extends with zeroes up to `len`.
    fn zero_extend(&mut self, len: usize) {
        match self {
            VectorData::U8(v) => v.resize(len, 0),
            VectorData::S8(v) => v.resize(len, 0),
            VectorData::U16(v) => v.resize(len, 0),
            VectorData::S16(v) => v.resize(len, 0),
            VectorData::U32(v) => v.resize(len, 0),
            VectorData::S32(v) => v.resize(len, 0),
            VectorData::F32(v) => v.resize(len, 0.0),
            VectorData::F64(v) => v.resize(len, 0.0),
        }
    }

    /// Capacity policy shared with the other dynamic containers.
    fn set_size(&mut self, newlen: usize) {
        for_each_buffer!(self, v => {
            let cap = v.capacity();
            let want = calcresize(VECTOR_SIZEBASE, cap, newlen);
            if want > cap {
                v.reserve_exact(want - v.len());
            } else if want < cap {
                v.shrink_to(want);
            }
        });
    }

    fn insert_zero(&mut self, i: usize) {
        self.set_size(self.len() + 1);
        match self {
            VectorData::U8(v) => v.insert(i, 0),
            VectorData::S8(v) => v.insert(i, 0),
            VectorData::U16(v) => v.insert(i, 0),
            VectorData::S16(v) => v.insert(i, 0),
            VectorData::U32(v) => v.insert(i, 0),
            VectorData::S32(v) => v.insert(i, 0),
            VectorData::F32(v) => v.insert(i, 0.0),
            VectorData::F64(v) => v.insert(i, 0.0),
        }
    }

    fn delete(&mut self, i0: usize, count: usize) {
        for_each_buffer!(self, v => {
            v.drain(i0..i0 + count);
        });
        let len = self.len();
        self.set_size(len);
    }

    fn slice(&self, start: usize, length: usize) -> VectorData {
        match self {
            VectorData::U8(v) => VectorData::U8(v[start..start + length].to_vec()),
            VectorData::S8(v) => VectorData::S8(v[start..start + length].to_vec()),
            VectorData::U16(v) => VectorData::U16(v[start..start + length].to_vec()),
            VectorData::S16(v) => VectorData::S16(v[start..start + length].to_vec()),
            VectorData::U32(v) => VectorData::U32(v[start..start + length].to_vec()),
            VectorData::S32(v) => VectorData::S32(v[start..start + length].to_vec()),
            VectorData::F32(v) => VectorData::F32(v[start..start + length].to_vec()),
            VectorData::F64(v) => VectorData::F64(v[start..start + length].to_vec()),
        }
    }

    fn clone_data(&self) -> VectorData {
        self.slice(0, self.len())
    }
}

/// Element-wise operations the vector classes implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VecOp {
    Add,
    Sub,
    Mul,
}

/// The scalar-or-vector right-hand operand of an element-wise operation.
enum Rhs<'a> {
    Nil,
    Int(i64),
    Real(f64),
    Vector(&'a VectorData),
}

impl Rhs<'_> {
    fn int_at(&self, i: usize) -> i64 {
        match self {
            Rhs::Nil => 0,
            Rhs::Int(n) => *n,
            Rhs::Real(r) => r.floor() as i64,
            Rhs::Vector(v) => v.get_int(i) as i64,
        }
    }

    fn real_at(&self, i: usize) -> f64 {
        match self {
            Rhs::Nil => 0.0,
            Rhs::Int(n) => *n as f64,
            Rhs::Real(r) => *r,
            Rhs::Vector(v) => v.get_real(i),
        }
    }
}

macro_rules! vec_combine_int {
    ($src:expr, $rhs:expr, $op:expr, $t:ty) => {{
        $src.iter()
            .enumerate()
            .map(|(i, &a)| {
                let b = $rhs.int_at(i) as $t;
                match $op {
                    VecOp::Add => a.wrapping_add(b),
                    VecOp::Sub => a.wrapping_sub(b),
                    VecOp::Mul => a.wrapping_mul(b),
                }
            })
            .collect()
    }};
}

macro_rules! vec_combine_float {
    ($src:expr, $rhs:expr, $op:expr, $t:ty) => {{
        $src.iter()
            .enumerate()
            .map(|(i, &a)| {
                let b = $rhs.real_at(i) as $t;
                match $op {
                    VecOp::Add => a + b,
                    VecOp::Sub => a - b,
                    VecOp::Mul => a * b,
                }
            })
            .collect()
    }};
}

/// Combines `src` element-wise with `rhs` into fresh storage. A `nil`
/// operand leaves addition and subtraction as a copy and zeroes a product.
fn vec_combine(src: &VectorData, rhs: &Rhs, op: VecOp) -> VectorData {
    if matches!(rhs, Rhs::Nil) && op == VecOp::Mul {
        let mut out = src.slice(0, 0);
        out.zero_extend(src.len());
        return out;
    }
    match src {
        VectorData::U8(v) => VectorData::U8(vec_combine_int!(v, rhs, op, u8)),
        VectorData::S8(v) => VectorData::S8(vec_combine_int!(v, rhs, op, i8)),
        VectorData::U16(v) => VectorData::U16(vec_combine_int!(v, rhs, op, u16)),
        VectorData::S16(v) => VectorData::S16(vec_combine_int!(v, rhs, op, i16)),
        VectorData::U32(v) => VectorData::U32(vec_combine_int!(v, rhs, op, u32)),
        VectorData::S32(v) => VectorData::S32(vec_combine_int!(v, rhs, op, i32)),
        VectorData::F32(v) => VectorData::F32(vec_combine_float!(v, rhs, op, f32)),
        VectorData::F64(v) => VectorData::F64(vec_combine_float!(v, rhs, op, f64)),
    }
}

impl Vm {
    /// The packed storage of a vector object.
    pub fn vector(&self, id: ObjId) -> VmResult<&VectorData> {
        match &self.object(id).payload {
            Payload::Vector(v) => Ok(v),
            _ => Err(Exception::WrongType),
        }
    }

    pub(crate) fn vector_mut(&mut self, id: ObjId) -> VmResult<&mut VectorData> {
        match &mut self.object_mut(id).payload {
            Payload::Vector(v) => Ok(v),
            _ => Err(Exception::WrongType),
        }
    }

    /// Creates an uninitialized-length vector of subclass `cid` filled with
    /// zeroes.
    pub fn new_vector(&mut self, cid: ClassId, len: usize) -> VmResult<ObjId> {
        let mut data = VectorData::for_class(cid)?;
        data.zero_extend(len);
        self.alloc_object(cid, Payload::Vector(data))
    }

    fn vec_arith(
        &mut self,
        obj: ObjId,
        op1: &Value,
        op: VecOp,
        in_place: bool,
    ) -> VmResult<Value> {
        let result = {
            let src = self.vector(obj)?;
            match *op1 {
                Value::Nil => vec_combine(src, &Rhs::Nil, op),
                Value::Integer(n) => vec_combine(src, &Rhs::Int(n as i64), op),
                Value::Boolean(b) => vec_combine(src, &Rhs::Int(b as i64), op),
                Value::ClassId(c) => vec_combine(src, &Rhs::Int(c.raw() as i64), op),
                Value::Real(r) => vec_combine(src, &Rhs::Real(r), op),
                Value::ObjRef(o) | Value::WeakRef { target: o, .. } => {
                    let rhs = self.vector(o)?;
                    vec_combine(src, &Rhs::Vector(rhs), op)
                }
            }
        };
        if in_place {
            *self.vector_mut(obj)? = result;
            self.own_object(obj);
            Ok(Value::ObjRef(obj))
        } else {
            let cid = self.object(obj).classid;
            let id = self.alloc_object(cid, Payload::Vector(result))?;
            Ok(Value::ObjRef(id))
        }
    }
}

fn v_construct(vm: &mut Vm, cid: ClassId, argv: usize, argc: usize) -> VmResult<Value> {
    let mut data = VectorData::for_class(cid)?;
    data.zero_extend(argc);
    for i in 0..argc {
        let v = vm.heap[argv + i];
        data.set_value(i, &v)?;
    }
    let id = vm.alloc_object(cid, Payload::Vector(data))?;
    Ok(Value::ObjRef(id))
}

/// The virtual base class constructs the default subclass.
fn v_default_construct(vm: &mut Vm, _cid: ClassId, argv: usize, argc: usize) -> VmResult<Value> {
    v_construct(vm, DEFAULT_SUBCLASS, argv, argc)
}

fn v_destruct(_vm: &mut Vm, _obj: ObjId) -> VmResult<()> {
    Ok(())
}

fn v_getindex(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let i = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    if i < 0 {
        return Err(Exception::LowIndex);
    }
    let vec = vm.vector(obj)?;
    if i as usize >= vec.len() {
        return Err(Exception::HighIndex);
    }
    *op2.ok_or(Exception::Internal)? = vec.get_value(i as usize);
    Ok(())
}

fn v_setindex(
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
    let vec = vm.vector_mut(obj)?;
    if i as usize >= vec.len() {
        vec.set_size(i as usize + 1);
        vec.zero_extend(i as usize + 1);
    }
    vec.set_value(i as usize, &v)
}

fn v_insert(
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
    let vec = vm.vector_mut(obj)?;
    if i as usize > vec.len() {
        return Err(Exception::HighIndex);
    }
    vec.insert_zero(i as usize);
    vec.set_value(i as usize, &v)
}

fn v_delete(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let len = vm.vector(obj)?.len() as i32;
    let (i0, i1) = delete_range(op1, op2.as_deref(), len)?;
    if i1 < i0 {
        return Ok(());
    }
    vm.vector_mut(obj)?.delete(i0 as usize, (i1 - i0 + 1) as usize);
    Ok(())
}

fn v_copy(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let out = op2.ok_or(Exception::WrongIndex)?;
    let start = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    let length = index_value(out)?;
    let vec = vm.vector(obj)?;
    if start < 0 {
        return Err(Exception::LowIndex);
    }
    if start as usize > vec.len() {
        return Err(Exception::HighIndex);
    }
    if length < 0 {
        return Err(Exception::WrongIndex);
    }
    if (start + length) as usize > vec.len() {
        return Err(Exception::HighIndex);
    }
    let data = vec.slice(start as usize, length as usize);
    let cid = vm.object(obj).classid;
    let id = vm.alloc_object(cid, Payload::Vector(data))?;
    *out = Value::ObjRef(id);
    Ok(())
}

fn v_length(
    vm: &mut Vm,
    obj: ObjId,
    _op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let len = vm.vector(obj)?.len() as i32;
    *op2.ok_or(Exception::Internal)? = Value::Integer(len);
    Ok(())
}

/// Byte vectors compare length-major; the other subclasses do not order.
fn v_compare(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let key = op1.ok_or(Exception::WrongType)?;
    let ko = key.object().ok_or(Exception::WrongType)?;
    if vm.object(ko).classid != vm.object(obj).classid {
        return Err(Exception::NotImplemented);
    }
    let out = op2.ok_or(Exception::Internal)?;
    let (a, b) = (vm.vector(obj)?, vm.vector(ko)?);
    if a.len() != b.len() {
        *out = Value::Integer(if a.len() > b.len() { 1 } else { -1 });
        return Ok(());
    }
    match (a, b) {
        (VectorData::U8(x), VectorData::U8(y)) => {
            let r = match x.cmp(y) {
                std::cmp::Ordering::Greater => 1,
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
            };
            *out = Value::Integer(r);
            Ok(())
        }
        _ => Err(Exception::NotImplemented),
    }
}

fn v_serialize(
    _vm: &mut Vm,
    _obj: ObjId,
    _op1: Option<&Value>,
    _op2: Option<&mut Value>,
) -> VmResult<()> {
    Err(Exception::NotImplemented)
}

/// `v + x` clones and appends one element.
fn v_add(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let v = *op1.ok_or(Exception::WrongType)?;
    let out = op2.ok_or(Exception::Internal)?;
    let data = vm.vector(obj)?.clone_data();
    let cid = vm.object(obj).classid;
    let id = vm.alloc_object(cid, Payload::Vector(data))?;
    let vec = vm.vector_mut(id)?;
    let end = vec.len();
    vec.zero_extend(end + 1);
    if let Err(x) = vec.set_value(end, &v) {
        vm.disown_object(id);
        return Err(x);
    }
    *out = Value::ObjRef(id);
    Ok(())
}

fn v_ipadd(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let v = *op1.ok_or(Exception::WrongType)?;
    let out = op2.ok_or(Exception::Internal)?;
    let vec = vm.vector_mut(obj)?;
    let end = vec.len();
    vec.set_size(end + 1);
    vec.zero_extend(end + 1);
    vec.set_value(end, &v)?;
    vm.own_object(obj);
    *out = Value::ObjRef(obj);
    Ok(())
}

macro_rules! vec_arith_mm {
    ($name:ident, $op:expr, $in_place:expr) => {
        fn $name(
            vm: &mut Vm,
            obj: ObjId,
            op1: Option<&Value>,
            op2: Option<&mut Value>,
        ) -> VmResult<()> {
            let rhs = *op1.ok_or(Exception::WrongType)?;
            let out = op2.ok_or(Exception::Internal)?;
            *out = vm.vec_arith(obj, &rhs, $op, $in_place)?;
            Ok(())
        }
    };
}

vec_arith_mm!(v_vadd, VecOp::Add, false);
vec_arith_mm!(v_ipvadd, VecOp::Add, true);
vec_arith_mm!(v_vsub, VecOp::Sub, false);
vec_arith_mm!(v_ipvsub, VecOp::Sub, true);
vec_arith_mm!(v_vmul, VecOp::Mul, false);
vec_arith_mm!(v_ipvmul, VecOp::Mul, true);

fn v_clone_cast(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let so = src.object().ok_or(Exception::WrongType)?;
    let data = vm.vector(so)?.clone_data();
    let cid = vm.object(so).classid;
    let id = vm.alloc_object(cid, Payload::Vector(data))?;
    Ok(Value::ObjRef(id))
}

/// Casting to string treats the elements as character codes.
fn v_cast_to_string(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let so = src.object().ok_or(Exception::WrongType)?;
    let vec = vm.vector(so)?;
    let bytes: Vec<u8> = (0..vec.len()).map(|i| vec.get_int(i) as u8).collect();
    let id = vm.intern_bytes(&bytes)?;
    Ok(Value::ObjRef(id))
}

pub(crate) fn register(vm: &mut Vm) -> VmResult<()> {
    use crate::class::CastSelector::Class;

    vm.register_class(
        Some(ClassId::VECTOR),
        "vector",
        ClassId::OBJECT,
        Some(v_default_construct),
        None,
    )?;

    const NAMES: [&str; 8] = [
        "vector_u8",
        "vector_s8",
        "vector_u16",
        "vector_s16",
        "vector_u32",
        "vector_s32",
        "vector_f",
        "vector_d",
    ];
    for (i, name) in NAMES.iter().enumerate() {
        let cid = ClassId(ClassId::VECTOR_U8.raw() + i as u32);
        vm.register_class(
            Some(cid),
            name,
            ClassId::VECTOR,
            Some(v_construct),
            Some(v_destruct),
        )?;
        vm.set_metamethod(cid, Metamethod::GetIndex, Some(v_getindex))?;
        vm.set_metamethod(cid, Metamethod::SetIndex, Some(v_setindex))?;
        vm.set_metamethod(cid, Metamethod::Copy, Some(v_copy))?;
        vm.set_metamethod(cid, Metamethod::Length, Some(v_length))?;
        vm.set_metamethod(cid, Metamethod::Compare, Some(v_compare))?;
        vm.set_metamethod(cid, Metamethod::Serialize, Some(v_serialize))?;
        vm.set_metamethod(cid, Metamethod::Add, Some(v_add))?;
        vm.set_metamethod(cid, Metamethod::IpAdd, Some(v_ipadd))?;
        vm.set_metamethod(cid, Metamethod::VAdd, Some(v_vadd))?;
        vm.set_metamethod(cid, Metamethod::IpVAdd, Some(v_ipvadd))?;
        vm.set_metamethod(cid, Metamethod::VSub, Some(v_vsub))?;
        vm.set_metamethod(cid, Metamethod::IpVSub, Some(v_ipvsub))?;
        vm.set_metamethod(cid, Metamethod::VMul, Some(v_vmul))?;
        vm.set_metamethod(cid, Metamethod::IpVMul, Some(v_ipvmul))?;
        vm.set_metamethod(cid, Metamethod::Insert, Some(v_insert))?;
        vm.set_metamethod(cid, Metamethod::Delete, Some(v_delete))?;
        vm.set_casts(Class(cid), Class(cid), v_clone_cast)?;
        vm.set_casts(Class(cid), Class(ClassId::STRING), v_cast_to_string)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncating_writes() {
        let mut d = VectorData::U8(vec![0; 3]);
        d.set_value(0, &Value::Integer(300)).unwrap();
        d.set_value(1, &Value::Real(2.9)).unwrap();
        d.set_value(2, &Value::Nil).unwrap();
        assert_eq!(d.get_int(0), 44); // 300 mod 256
        assert_eq!(d.get_int(1), 2);
        assert_eq!(d.get_int(2), 0);
    }

    #[test]
    fn combine_broadcasts_scalars() {
        let d = VectorData::F64(vec![1.0, 2.0, 3.0]);
        let r = vec_combine(&d, &Rhs::Real(0.5), VecOp::Add);
        match r {
            VectorData::F64(v) => assert_eq!(v, vec![1.5, 2.5, 3.5]),
            _ => panic!("subclass changed"),
        }
    }

    #[test]
    fn combine_with_nil_zeroes_products() {
        let d = VectorData::S32(vec![4, 5]);
        let r = vec_combine(&d, &Rhs::Nil, VecOp::Mul);
        match r {
            VectorData::S32(v) => assert_eq!(v, vec![0, 0]),
            _ => panic!("subclass changed"),
        }
    }

    #[test]
    fn combine_pairs_vectors_elementwise() {
        let a = VectorData::S32(vec![10, 20, 30]);
        let b = VectorData::S32(vec![1, 2]);
        // Out-of-range operand elements read as zero.
        let r = vec_combine(&a, &Rhs::Vector(&b), VecOp::Sub);
        match r {
            VectorData::S32(v) => assert_eq!(v, vec![9, 18, 30]),
            _ => panic!("subclass changed"),
        }
    }
}
