//! The interned string class and the string pool.
//!
//! Strings are immutable and interned: creating a string with contents that
//! already exist in the pool adopts the existing instance. The pool is a
//! fixed array of 256 buckets keyed by hash.
//!
//! A LIFO cache of recently destroyed strings keeps common short strings
//! alive across churn: when a string's refcount reaches zero its destructor
//! refuses, parking it in the cache instead; a later lookup resurrects it,
//! and only when the cache overflows is the oldest resident truly freed.

use crate::class::{ClassId, Metamethod};
use crate::error::{Exception, VmResult};
use crate::object::{ObjectLink, Payload};
use crate::value::{hash_bytes, Hash, ObjId, Value};
use crate::vm::Vm;

/// Number of pool buckets.
const POOL_BUCKETS: usize = 256;

/// Payload of an interned string.
pub struct InternedString {
    pub bytes: Box<[u8]>,
    pub hash: Hash,
}

/// The per-VM string pool.
pub struct StringPool {
    buckets: Vec<Vec<ObjId>>,
    /// Dead strings, oldest first.
    cache: Vec<ObjId>,
    cache_max: usize,
}

impl StringPool {
    pub(crate) fn new(cache_max: usize) -> Self {
        StringPool {
            buckets: vec![Vec::new(); POOL_BUCKETS],
            cache: Vec::new(),
            cache_max,
        }
    }

    fn bucket(&self, hash: Hash) -> usize {
        hash as usize % POOL_BUCKETS
    }

    /// Number of cache residents, for tests and introspection.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl Vm {
    /// Interns `s`, returning an owned reference (found strings gain a
    /// reference; new strings are created with one).
    pub fn intern(&mut self, s: &str) -> VmResult<ObjId> {
        self.intern_bytes(s.as_bytes())
    }

    /// Byte-slice flavor of [`Vm::intern`].
    pub fn intern_bytes(&mut self, s: &[u8]) -> VmResult<ObjId> {
        let hash = hash_bytes(s);
        if let Some(found) = self.pool_find(s, hash) {
            self.string_resurrect(found);
            return Ok(found);
        }
        let payload = Payload::String(InternedString {
            bytes: s.to_vec().into_boxed_slice(),
            hash,
        });
        let id = self.alloc_object(ClassId::STRING, payload)?;
        let pool = self.strings.as_mut().ok_or(Exception::Internal)?;
        let b = pool.bucket(hash);
        pool.buckets[b].push(id);
        Ok(id)
    }

    /// Looks a string up without creating or resurrecting it.
    pub fn find_interned(&self, s: &str) -> Option<ObjId> {
        self.pool_find(s.as_bytes(), hash_bytes(s.as_bytes()))
    }

    fn pool_find(&self, s: &[u8], hash: Hash) -> Option<ObjId> {
        let pool = self.strings.as_ref()?;
        let b = pool.bucket(hash);
        for &id in &pool.buckets[b] {
            let ps = match &self.object(id).payload {
                Payload::String(ps) => ps,
                _ => continue,
            };
            if ps.hash == hash && ps.bytes.len() == s.len() && &*ps.bytes == s {
                return Some(id);
            }
        }
        None
    }

    /// Brings a pool hit back: cache residents leave the cache, and the
    /// caller's reference is added either way.
    fn string_resurrect(&mut self, id: ObjId) {
        if self.object(id).refcount == 0 {
            let pool = self.strings.as_mut().expect("pool open");
            if let Some(pos) = pool.cache.iter().rposition(|&s| s == id) {
                pool.cache.remove(pos);
            }
            self.object_mut(id).link = ObjectLink::None;
        }
        self.own_object(id);
    }

    /// Content bytes of an interned string. Panics on non-strings; use
    /// [`Vm::value_bytes`] for "string-like" access.
    pub fn string_bytes(&self, id: ObjId) -> &[u8] {
        match &self.object(id).payload {
            Payload::String(ps) => &ps.bytes,
            _ => panic!("object {id} is not a string"),
        }
    }

    /// Precomputed content hash of an interned string.
    pub(crate) fn string_hash(&self, id: ObjId) -> Option<Hash> {
        match &self.object(id).payload {
            Payload::String(ps) => Some(ps.hash),
            _ => None,
        }
    }

    /// Content bytes of a string or dstring value, if it is one.
    pub fn value_bytes(&self, v: &Value) -> Option<&[u8]> {
        let o = v.object()?;
        match &self.object(o).payload {
            Payload::String(ps) => Some(&ps.bytes),
            Payload::DString(ds) => Some(ds.bytes()),
            _ => None,
        }
    }

    /// Unlinks a string from its pool bucket. Part of real destruction;
    /// cache parking does not unlink.
    fn pool_unlink(&mut self, id: ObjId) {
        let hash = match &self.object(id).payload {
            Payload::String(ps) => ps.hash,
            _ => return,
        };
        if let Some(pool) = self.strings.as_mut() {
            let b = pool.bucket(hash);
            if let Some(pos) = pool.buckets[b].iter().position(|&s| s == id) {
                pool.buckets[b].swap_remove(pos);
            }
        }
    }

    /// Destroys a dead string outright: bucket unlink, weakref kill, slab
    /// free.
    fn string_free(&mut self, id: ObjId) {
        self.pool_unlink(id);
        self.kill_weakrefs(id);
        self.free_object(id);
    }

    /// Opens the pool. Called once from [`Vm::open`].
    pub(crate) fn open_string_pool(&mut self) {
        self.strings = Some(StringPool::new(self.config.string_cache_max));
    }

    /// Flushes the cache and reports leaked pool residents, then closes the
    /// pool so late string deaths destruct directly.
    pub(crate) fn close_string_pool(&mut self) {
        // Cache residents all have zero refcounts; free them outright.
        while let Some(id) = self.strings.as_mut().and_then(|p| p.cache.pop()) {
            self.object_mut(id).link = ObjectLink::None;
            self.string_free(id);
        }
        let Some(pool) = self.strings.take() else { return };
        // Strings still in the buckets are held by owners that have not
        // been torn down yet (class names and the like); they destruct
        // directly once those owners let go. Report them for leak hunting.
        let mut residents = 0usize;
        for bucket in &pool.buckets {
            for &id in bucket {
                residents += 1;
                log::debug!(
                    "string pool resident at close: {:?} (refcount {})",
                    String::from_utf8_lossy(self.string_bytes(id)),
                    self.object(id).refcount
                );
            }
        }
        if residents > 0 {
            log::debug!("string pool closed with {residents} residents");
        }
    }

    /// String cache occupancy, for tests and introspection.
    pub fn string_cache_len(&self) -> usize {
        self.strings.as_ref().map_or(0, |p| p.cache_len())
    }

    /// A human-readable rendering of any value, used by diagnostics and by
    /// the fallback path of casts to the string classes.
    pub fn value_repr(&self, v: &Value) -> String {
        match *v {
            Value::Nil => "nil".to_string(),
            Value::Real(r) => format_real(r),
            Value::Integer(i) => i.to_string(),
            Value::Boolean(b) => if b { "true" } else { "false" }.to_string(),
            Value::ClassId(c) => self.class_name(c),
            Value::ObjRef(o) | Value::WeakRef { target: o, .. } => {
                match &self.object(o).payload {
                    Payload::String(ps) => String::from_utf8_lossy(&ps.bytes).into_owned(),
                    Payload::DString(ds) => {
                        String::from_utf8_lossy(ds.bytes()).into_owned()
                    }
                    _ => {
                        let cid = self.object(o).classid;
                        format!("<{} {}>", self.class_name(cid), o)
                    }
                }
            }
        }
    }
}

/// Renders a real the way the default real-to-string conversion does:
/// up to 12 significant digits, no trailing zeros, integers without a
/// decimal point.
pub(crate) fn format_real(r: f64) -> String {
    if !r.is_finite() {
        return format!("{r}");
    }
    let s = format!("{:.*e}", 11, r);
    // Round-trip through the exponent form to honor the significant-digit
    // cap, then strip it back to plain notation.
    let v: f64 = s.parse().unwrap_or(r);
    let mut out = format!("{v}");
    if out.ends_with(".0") {
        out.truncate(out.len() - 2);
    }
    out
}

// ---------------------------------------------------------------------
// String class
// ---------------------------------------------------------------------

fn s_construct(vm: &mut Vm, _cid: ClassId, argv: usize, argc: usize) -> VmResult<Value> {
    if argc == 0 {
        let id = vm.intern("")?;
        return Ok(Value::ObjRef(id));
    }
    let mut buf = Vec::with_capacity(argc);
    for i in 0..argc {
        let v = vm.heap[argv + i];
        let b = v.as_int().ok_or(Exception::Arguments)?;
        if !(0..=255).contains(&b) {
            return Err(Exception::Arguments);
        }
        buf.push(b as u8);
    }
    let id = vm.intern_bytes(&buf)?;
    Ok(Value::ObjRef(id))
}

fn s_destruct(vm: &mut Vm, obj: ObjId) -> VmResult<()> {
    if vm.strings.is_none() {
        // Pool is closed; destruct outright.
        vm.pool_unlink(obj);
        return Ok(());
    }
    // Park in the cache instead of dying; spill the oldest resident when
    // the cache overflows.
    vm.object_mut(obj).link = ObjectLink::StringCache;
    let pool = vm.strings.as_mut().expect("pool open");
    pool.cache.push(obj);
    if pool.cache.len() > pool.cache_max {
        let oldest = pool.cache.remove(0);
        vm.object_mut(oldest).link = ObjectLink::None;
        vm.string_free(oldest);
    }
    Err(Exception::Refuse)
}

/// Index cast shared by the string-ish getindex paths.
pub(crate) fn index_value(v: &Value) -> VmResult<i32> {
    match *v {
        Value::Integer(i) => Ok(i),
        Value::Boolean(b) => Ok(b as i32),
        Value::ClassId(c) => Ok(c.raw() as i32),
        Value::Real(r) => Ok(r.floor() as i32),
        _ => Err(Exception::WrongType),
    }
}

fn s_getindex(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let i = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    let bytes = vm.string_bytes(obj);
    if i < 0 {
        return Err(Exception::LowIndex);
    }
    if i as usize >= bytes.len() {
        return Err(Exception::HighIndex);
    }
    let out = op2.ok_or(Exception::Internal)?;
    *out = Value::Integer(bytes[i as usize] as i32);
    Ok(())
}

/// Searches `haystack` for `needle`; yields the index or boolean false.
pub(crate) fn bytes_in(haystack: &[u8], needle: &[u8]) -> Value {
    if needle.is_empty() {
        return Value::Integer(0);
    }
    if needle.len() > haystack.len() {
        return Value::Boolean(false);
    }
    for i in 0..=(haystack.len() - needle.len()) {
        if &haystack[i..i + needle.len()] == needle {
            return Value::Integer(i as i32);
        }
    }
    Value::Boolean(false)
}

fn s_in(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let key = op1.ok_or(Exception::WrongType)?;
    let out = op2.ok_or(Exception::Internal)?;
    let found = match key {
        Value::Integer(_) | Value::Boolean(_) | Value::ClassId(_) | Value::Real(_) => {
            let c = index_value(key)?;
            if !(0..=255).contains(&c) {
                Value::Boolean(false)
            } else {
                bytes_in(vm.string_bytes(obj), &[c as u8])
            }
        }
        Value::ObjRef(o) | Value::WeakRef { target: o, .. } => {
            if *o == obj {
                Value::Integer(0)
            } else {
                let needle = vm
                    .value_bytes(key)
                    .ok_or(Exception::WrongType)?
                    .to_vec();
                bytes_in(vm.string_bytes(obj), &needle)
            }
        }
        _ => return Err(Exception::WrongType),
    };
    *out = found;
    Ok(())
}

fn s_copy(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let out = op2.ok_or(Exception::WrongIndex)?;
    let start = index_value(op1.ok_or(Exception::WrongIndex)?)?;
    let length = index_value(out)?;
    let bytes = vm.string_bytes(obj);
    if start < 0 {
        return Err(Exception::LowIndex);
    }
    if start as usize > bytes.len() {
        return Err(Exception::HighIndex);
    }
    if length < 0 {
        return Err(Exception::WrongIndex);
    }
    if start as usize + length as usize > bytes.len() {
        return Err(Exception::HighIndex);
    }
    let sub = bytes[start as usize..start as usize + length as usize].to_vec();
    let id = vm.intern_bytes(&sub)?;
    *out = Value::ObjRef(id);
    Ok(())
}

fn s_length(
    vm: &mut Vm,
    obj: ObjId,
    _op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let out = op2.ok_or(Exception::Internal)?;
    *out = Value::Integer(vm.string_bytes(obj).len() as i32);
    Ok(())
}

/// Length-major byte comparison, shared with the dstring class.
pub(crate) fn bytes_compare(a: &[u8], b: &[u8]) -> i32 {
    use std::cmp::Ordering;
    match a.len().cmp(&b.len()) {
        Ordering::Greater => 1,
        Ordering::Less => -1,
        Ordering::Equal => match a.cmp(b) {
            Ordering::Greater => 1,
            Ordering::Less => -1,
            Ordering::Equal => 0,
        },
    }
}

fn s_compare(
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
    let other = vm.value_bytes(key).ok_or(Exception::NotImplemented)?;
    let r = bytes_compare(vm.string_bytes(obj), other);
    *out = Value::Integer(r);
    Ok(())
}

fn s_eq(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let key = op1.ok_or(Exception::BadType)?;
    let out = op2.ok_or(Exception::Internal)?;
    let eq = match key {
        Value::ObjRef(o) | Value::WeakRef { target: o, .. } => {
            match &vm.object(*o).payload {
                // Interned: identity is content equality.
                Payload::String(_) => *o == obj,
                Payload::DString(ds) => ds.bytes() == vm.string_bytes(obj),
                _ => false,
            }
        }
        _ => false,
    };
    *out = Value::Boolean(eq);
    Ok(())
}

fn s_add(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let rhs = op1.ok_or(Exception::NotImplemented)?;
    let out = op2.ok_or(Exception::Internal)?;
    let self_len = vm.string_bytes(obj).len();
    let rhs_is_interned = rhs
        .object()
        .map_or(false, |ro| matches!(vm.object(ro).payload, Payload::String(_)));
    let rhs_bytes = vm
        .value_bytes(rhs)
        .ok_or(Exception::NotImplemented)?
        .to_vec();

    // Either side empty: adopt the other instance.
    if self_len == 0 && rhs_is_interned {
        let ro = rhs.object().expect("interned operand");
        vm.own_object(ro);
        *out = Value::ObjRef(ro);
        return Ok(());
    }
    if rhs_bytes.is_empty() {
        vm.own_object(obj);
        *out = Value::ObjRef(obj);
        return Ok(());
    }

    let mut buf = Vec::with_capacity(self_len + rhs_bytes.len());
    buf.extend_from_slice(vm.string_bytes(obj));
    buf.extend_from_slice(&rhs_bytes);
    let id = vm.intern_bytes(&buf)?;
    *out = Value::ObjRef(id);
    Ok(())
}

// Casts.

/// Leading-number parse in the spirit of `atof`: as many bytes as form a
/// number, zero when none do.
pub(crate) fn parse_real_prefix(bytes: &[u8]) -> f64 {
    let s = String::from_utf8_lossy(bytes);
    let t = s.trim_start();
    let mut end = 0;
    let b = t.as_bytes();
    if end < b.len() && (b[end] == b'+' || b[end] == b'-') {
        end += 1;
    }
    let mut seen_dot = false;
    let mut seen_digit = false;
    while end < b.len() {
        match b[end] {
            b'0'..=b'9' => {
                seen_digit = true;
                end += 1;
            }
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            b'e' | b'E' if seen_digit => {
                let mut x = end + 1;
                if x < b.len() && (b[x] == b'+' || b[x] == b'-') {
                    x += 1;
                }
                if x < b.len() && b[x].is_ascii_digit() {
                    end = x + 1;
                    while end < b.len() && b[end].is_ascii_digit() {
                        end += 1;
                    }
                }
                break;
            }
            _ => break,
        }
    }
    t[..end].parse().unwrap_or(0.0)
}

fn cast_to_real(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let bytes = vm.value_bytes(src).ok_or(Exception::WrongType)?;
    Ok(Value::Real(parse_real_prefix(bytes)))
}

fn cast_to_integer(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let bytes = vm.value_bytes(src).ok_or(Exception::WrongType)?;
    Ok(Value::Integer(parse_real_prefix(bytes).floor() as i32))
}

fn cast_to_boolean(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let bytes = vm.value_bytes(src).ok_or(Exception::WrongType)?;
    let truthy = [&b"true"[..], b"yes", b"1", b"on"]
        .iter()
        .any(|p| bytes.starts_with(p));
    Ok(Value::Boolean(truthy))
}

fn cast_to_dstring(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let bytes = vm
        .value_bytes(src)
        .ok_or(Exception::WrongType)?
        .to_vec();
    let id = vm.new_dstring(&bytes)?;
    Ok(Value::ObjRef(id))
}

/// Strings are immutable, so the clone cast is adoption.
fn cast_clone(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let o = src.object().ok_or(Exception::WrongType)?;
    vm.own_object(o);
    Ok(Value::ObjRef(o))
}

fn cast_from_any(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let s = vm.value_repr(src);
    let id = vm.intern(&s)?;
    Ok(Value::ObjRef(id))
}

pub(crate) fn register(vm: &mut Vm) -> VmResult<()> {
    use crate::class::CastSelector::Class;

    vm.register_class(
        Some(ClassId::STRING),
        "string",
        ClassId::OBJECT,
        Some(s_construct),
        Some(s_destruct),
    )?;
    vm.set_metamethod(ClassId::STRING, Metamethod::GetIndex, Some(s_getindex))?;
    vm.set_metamethod(ClassId::STRING, Metamethod::In, Some(s_in))?;
    vm.set_metamethod(ClassId::STRING, Metamethod::Copy, Some(s_copy))?;
    vm.set_metamethod(ClassId::STRING, Metamethod::Length, Some(s_length))?;
    vm.set_metamethod(ClassId::STRING, Metamethod::Compare, Some(s_compare))?;
    vm.set_metamethod(ClassId::STRING, Metamethod::Eq, Some(s_eq))?;
    vm.set_metamethod(ClassId::STRING, Metamethod::Add, Some(s_add))?;

    vm.set_casts(Class(ClassId::STRING), Class(ClassId::STRING), cast_clone)?;
    vm.set_casts(Class(ClassId::STRING), Class(ClassId::REAL), cast_to_real)?;
    vm.set_casts(
        Class(ClassId::STRING),
        Class(ClassId::INTEGER),
        cast_to_integer,
    )?;
    vm.set_casts(
        Class(ClassId::STRING),
        Class(ClassId::BOOLEAN),
        cast_to_boolean,
    )?;
    vm.set_casts(
        Class(ClassId::STRING),
        Class(ClassId::DSTRING),
        cast_to_dstring,
    )?;
    for from in [
        ClassId::NIL,
        ClassId::REAL,
        ClassId::INTEGER,
        ClassId::BOOLEAN,
        ClassId::CLASSID,
    ] {
        vm.set_casts(Class(from), Class(ClassId::STRING), cast_from_any)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_in_finds_substrings() {
        assert_eq!(bytes_in(b"hello", b"ll"), Value::Integer(2));
        assert_eq!(bytes_in(b"hello", b"z"), Value::Boolean(false));
        assert_eq!(bytes_in(b"hello", b""), Value::Integer(0));
    }

    #[test]
    fn compare_is_length_major() {
        assert_eq!(bytes_compare(b"ab", b"b"), 1);
        assert_eq!(bytes_compare(b"a", b"bb"), -1);
        assert_eq!(bytes_compare(b"abc", b"abd"), -1);
        assert_eq!(bytes_compare(b"abc", b"abc"), 0);
    }

    #[test]
    fn real_prefix_parsing_is_lenient() {
        assert_eq!(parse_real_prefix(b"42"), 42.0);
        assert_eq!(parse_real_prefix(b"3.5abc"), 3.5);
        assert_eq!(parse_real_prefix(b"-2e2!"), -200.0);
        assert_eq!(parse_real_prefix(b"junk"), 0.0);
    }

    #[test]
    fn format_real_trims() {
        assert_eq!(format_real(1.0), "1");
        assert_eq!(format_real(0.5), "0.5");
        assert_eq!(format_real(-3.0), "-3");
    }
}
