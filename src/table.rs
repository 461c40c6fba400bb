//! The table class: an ordered sequence of `(hash, key, value)` entries,
//! kept sorted by hash so lookups can binary-search.
//!
//! Lookup binary-searches for the hash band (linear below ten entries),
//! backs up to the band's first entry, then scans for key equality. String
//! keys compare by pointer identity, which is sound because strings are
//! interned. General object keys fall back to the `compare` metamethod.

use crate::class::{ClassId, Metamethod};
use crate::error::{Exception, VmResult};
use crate::object::{CellAddr, Payload};
use crate::value::{Hash, ObjId, Value};
use crate::vm::Vm;

/// One table entry.
#[derive(Debug, Clone, Copy)]
pub struct TableItem {
    pub hash: Hash,
    pub key: Value,
    pub value: Value,
}

/// Outcome of a key search.
enum Find {
    Found(usize),
    /// Index where a new item with this hash belongs.
    Missing(usize),
}

impl Vm {
    /// The entry vector of a table object.
    pub fn table(&self, id: ObjId) -> VmResult<&Vec<TableItem>> {
        match &self.object(id).payload {
            Payload::Table(t) => Ok(t),
            _ => Err(Exception::WrongType),
        }
    }

    pub(crate) fn table_mut(&mut self, id: ObjId) -> VmResult<&mut Vec<TableItem>> {
        match &mut self.object_mut(id).payload {
            Payload::Table(t) => Ok(t),
            _ => Err(Exception::WrongType),
        }
    }

    /// Stable hash of a value for table ordering: strings by content hash,
    /// other objects by identity.
    pub fn value_hash(&self, v: &Value) -> Hash {
        crate::value::hash_value(v, |o| self.string_hash(o))
    }

    /// Entry at position `i`, if any. Tables iterate in hash order.
    pub fn table_item(&self, id: ObjId, i: usize) -> Option<(Value, Value)> {
        let items = self.table(id).ok()?;
        items.get(i).map(|it| (it.key, it.value))
    }

    fn table_find(&mut self, id: ObjId, key: &Value, h: Hash) -> VmResult<Find> {
        let items = self.table(id)?;
        let len = items.len();

        // Find the first entry of the hash band.
        let mut first;
        if len < 10 {
            first = 0;
            loop {
                if first == len {
                    return Ok(Find::Missing(first));
                }
                let ih = items[first].hash;
                if ih < h {
                    first += 1;
                    continue;
                }
                if ih > h {
                    return Ok(Find::Missing(first));
                }
                break;
            }
        } else {
            let mut low = 0i32;
            let mut high = len as i32 - 1;
            let mut hit = None;
            while high >= low {
                let mid = (low + high + 1) / 2;
                let ih = items[mid as usize].hash;
                if h < ih {
                    high = mid - 1;
                } else if h > ih {
                    low = mid + 1;
                } else {
                    hit = Some(mid as usize);
                    break;
                }
            }
            match hit {
                None => return Ok(Find::Missing(((low + high + 1) / 2) as usize)),
                Some(mut i) => {
                    while i > 0 && items[i - 1].hash == h {
                        i -= 1;
                    }
                    first = i;
                }
            }
        }

        // Interned keys: identity is equality.
        let key_is_string = key
            .object()
            .map_or(false, |o| matches!(self.object(o).payload, Payload::String(_)));
        if key_is_string {
            let ko = key.object();
            let items = self.table(id)?;
            for i in first..items.len() {
                if items[i].hash != h {
                    break;
                }
                if items[i].key.is_objref() && items[i].key.object() == ko {
                    return Ok(Find::Found(i));
                }
            }
            return Ok(Find::Missing(first));
        }

        // Typed scan of the hash band.
        let mut i = first;
        loop {
            let it = {
                let items = self.table(id)?;
                if i >= items.len() || items[i].hash != h {
                    break;
                }
                items[i]
            };
            let matched = match *key {
                Value::Nil => matches!(it.key, Value::Nil),
                Value::Real(r) => matches!(it.key, Value::Real(k) if k == r),
                Value::Integer(n) => matches!(it.key, Value::Integer(k) if k == n),
                Value::Boolean(b) => matches!(it.key, Value::Boolean(k) if k == b),
                Value::ClassId(c) => matches!(it.key, Value::ClassId(k) if k == c),
                Value::ObjRef(o) | Value::WeakRef { target: o, .. } => {
                    if it.key.object() == Some(o) {
                        true
                    } else if let Some(ko) = it.key.object() {
                        // Fall back to the key's compare metamethod; a key
                        // that cannot even compare simply does not match.
                        match self.metamethod_value(ko, Metamethod::Compare, Some(key)) {
                            Ok(v) => v.as_int() == Some(0),
                            Err(_) => false,
                        }
                    } else {
                        false
                    }
                }
            };
            if matched {
                return Ok(Find::Found(i));
            }
            i += 1;
        }
        Ok(Find::Missing(first))
    }

    /// Re-records weakref cell addresses for entries in `range` after an
    /// insert or delete shifted them.
    fn table_relocate(&mut self, id: ObjId, range: std::ops::Range<usize>) {
        for i in range {
            let (k, v) = match self.table(id) {
                Ok(items) => match items.get(i) {
                    Some(it) => (it.key, it.value),
                    None => continue,
                },
                Err(_) => return,
            };
            if matches!(k, Value::WeakRef { .. }) {
                self.weakref_relocate(k, CellAddr::TableKey { table: id, index: i });
            }
            if matches!(v, Value::WeakRef { .. }) {
                self.weakref_relocate(v, CellAddr::TableValue { table: id, index: i });
            }
        }
    }

    fn table_insert_at(
        &mut self,
        id: ObjId,
        pos: usize,
        key: Value,
        value: Value,
        h: Hash,
    ) -> VmResult<()> {
        let len = self.table(id)?.len();
        self.table_mut(id)?.insert(
            pos,
            TableItem {
                hash: h,
                key: Value::Nil,
                value: Value::Nil,
            },
        );
        self.table_relocate(id, pos + 1..len + 1);
        let k = self.copy_value(key, CellAddr::TableKey { table: id, index: pos });
        let v = self.copy_value(value, CellAddr::TableValue { table: id, index: pos });
        let it = &mut self.table_mut(id)?[pos];
        it.key = k;
        it.value = v;
        Ok(())
    }

    /// Sets `table[key] = value`, replacing or inserting in hash order.
    pub fn table_set(&mut self, id: ObjId, key: Value, value: Value) -> VmResult<()> {
        let h = self.value_hash(&key);
        match self.table_find(id, &key, h)? {
            Find::Found(pos) => {
                let old = self.table(id)?[pos].value;
                self.disown_value(old);
                let v = self.copy_value(value, CellAddr::TableValue { table: id, index: pos });
                self.table_mut(id)?[pos].value = v;
                Ok(())
            }
            Find::Missing(pos) => self.table_insert_at(id, pos, key, value, h),
        }
    }

    /// Looks `key` up, without taking ownership of the result.
    pub fn table_get(&mut self, id: ObjId, key: &Value) -> VmResult<Value> {
        let h = self.value_hash(key);
        match self.table_find(id, key, h)? {
            Find::Found(pos) => Ok(self.qcopy_value(self.table(id)?[pos].value)),
            Find::Missing(_) => Err(Exception::WrongIndex),
        }
    }

    /// String-keyed lookup convenience.
    pub fn table_get_str(&mut self, id: ObjId, key: &str) -> VmResult<Value> {
        let ks = self.intern(key)?;
        let r = self.table_get(id, &Value::ObjRef(ks));
        self.disown_object(ks);
        r
    }

    /// String-keyed store convenience.
    pub fn table_set_str(&mut self, id: ObjId, key: &str, value: Value) -> VmResult<()> {
        let ks = self.intern(key)?;
        let r = self.table_set(id, Value::ObjRef(ks), value);
        self.disown_object(ks);
        r
    }

    /// Removes `key`. Subsequent entries shift down.
    pub fn table_delete(&mut self, id: ObjId, key: &Value) -> VmResult<()> {
        let h = self.value_hash(key);
        let pos = match self.table_find(id, key, h)? {
            Find::Found(pos) => pos,
            Find::Missing(_) => return Err(Exception::WrongIndex),
        };
        let it = self.table(id)?[pos];
        self.disown_value(it.key);
        self.disown_value(it.value);
        self.table_mut(id)?.remove(pos);
        let len = self.table(id)?.len();
        self.table_relocate(id, pos..len);
        Ok(())
    }

    /// Copies every entry of `from` into `id`.
    fn table_merge(&mut self, id: ObjId, from: ObjId) -> VmResult<()> {
        let n = self.table(from)?.len();
        for i in 0..n {
            let (k, v) = {
                let it = self.table(from)?[i];
                (it.key, it.value)
            };
            self.table_set(id, k, v)?;
        }
        Ok(())
    }
}

fn t_construct(vm: &mut Vm, cid: ClassId, argv: usize, argc: usize) -> VmResult<Value> {
    if argc % 2 != 0 {
        return Err(Exception::NeedEven);
    }
    let id = vm.alloc_object(cid, Payload::Table(Vec::new()))?;
    for i in (0..argc).step_by(2) {
        let k = vm.heap[argv + i];
        let v = vm.heap[argv + i + 1];
        if let Err(x) = vm.table_set(id, k, v) {
            vm.disown_object(id);
            return Err(x);
        }
    }
    Ok(Value::ObjRef(id))
}

fn t_destruct(vm: &mut Vm, obj: ObjId) -> VmResult<()> {
    let items = std::mem::take(vm.table_mut(obj)?);
    for it in items {
        vm.disown_value(it.key);
        vm.disown_value(it.value);
    }
    Ok(())
}

fn t_getindex(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let key = op1.ok_or(Exception::WrongIndex)?;
    let h = vm.value_hash(key);
    match vm.table_find(obj, key, h)? {
        Find::Found(pos) => {
            let v = vm.table(obj)?[pos].value;
            let v = match v {
                Value::WeakRef { target, .. } => Value::ObjRef(target),
                other => other,
            };
            vm.own_value(&v);
            *op2.ok_or(Exception::Internal)? = v;
            Ok(())
        }
        Find::Missing(_) => Err(Exception::WrongIndex),
    }
}

fn t_setindex(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let key = *op1.ok_or(Exception::WrongIndex)?;
    let value = *op2.ok_or(Exception::WrongType)?;
    vm.table_set(obj, key, value)
}

/// Insert refuses to overwrite an existing key.
fn t_insert(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let key = *op1.ok_or(Exception::WrongIndex)?;
    let value = *op2.ok_or(Exception::WrongType)?;
    let h = vm.value_hash(&key);
    match vm.table_find(obj, &key, h)? {
        Find::Found(_) => Err(Exception::WrongIndex),
        Find::Missing(pos) => vm.table_insert_at(obj, pos, key, value, h),
    }
}

fn t_delete(
    vm: &mut Vm,
    obj: ObjId,
    op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    if op2.is_some() {
        // Ranges make no sense for keyed containers.
        return Err(Exception::WrongIndex);
    }
    match op1 {
        None => {
            t_destruct(vm, obj)?;
            Ok(())
        }
        Some(key) => vm.table_delete(obj, key),
    }
}

fn t_length(
    vm: &mut Vm,
    obj: ObjId,
    _op1: Option<&Value>,
    op2: Option<&mut Value>,
) -> VmResult<()> {
    let len = vm.table(obj)?.len() as i32;
    *op2.ok_or(Exception::Internal)? = Value::Integer(len);
    Ok(())
}

pub(crate) fn table_clone(vm: &mut Vm, src: ObjId) -> VmResult<ObjId> {
    let len = vm.table(src)?.len();
    let clone = vm.alloc_object(ClassId::TABLE, Payload::Table(Vec::with_capacity(len)))?;
    for i in 0..len {
        let it = vm.table(src)?[i];
        let k = vm.clone_value(it.key, CellAddr::TableKey { table: clone, index: i });
        let v = vm.clone_value(it.value, CellAddr::TableValue { table: clone, index: i });
        vm.table_mut(clone)?.push(TableItem {
            hash: it.hash,
            key: k,
            value: v,
        });
    }
    Ok(clone)
}

fn t_clone_cast(vm: &mut Vm, src: &Value, _to: ClassId) -> VmResult<Value> {
    let so = src.object().ok_or(Exception::WrongType)?;
    let clone = table_clone(vm, so)?;
    Ok(Value::ObjRef(clone))
}

/// `t + u` clones `t`, then merges `u` into the clone.
fn t_add(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let rhs = op1.ok_or(Exception::WrongType)?;
    let ro = rhs.object().ok_or(Exception::WrongType)?;
    if vm.object(ro).classid != ClassId::TABLE {
        return Err(Exception::WrongType);
    }
    let out = op2.ok_or(Exception::Internal)?;
    let clone = table_clone(vm, obj)?;
    if let Err(x) = vm.table_merge(clone, ro) {
        vm.disown_object(clone);
        return Err(x);
    }
    *out = Value::ObjRef(clone);
    Ok(())
}

fn t_ipadd(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()> {
    let rhs = op1.ok_or(Exception::WrongType)?;
    let ro = rhs.object().ok_or(Exception::WrongType)?;
    if vm.object(ro).classid != ClassId::TABLE {
        return Err(Exception::WrongType);
    }
    let out = op2.ok_or(Exception::Internal)?;
    vm.table_merge(obj, ro)?;
    vm.own_object(obj);
    *out = Value::ObjRef(obj);
    Ok(())
}

pub(crate) fn register(vm: &mut Vm) -> VmResult<()> {
    use crate::class::CastSelector::Class;

    vm.register_class(
        Some(ClassId::TABLE),
        "table",
        ClassId::OBJECT,
        Some(t_construct),
        Some(t_destruct),
    )?;
    vm.set_metamethod(ClassId::TABLE, Metamethod::GetIndex, Some(t_getindex))?;
    vm.set_metamethod(ClassId::TABLE, Metamethod::SetIndex, Some(t_setindex))?;
    vm.set_metamethod(ClassId::TABLE, Metamethod::Insert, Some(t_insert))?;
    vm.set_metamethod(ClassId::TABLE, Metamethod::Delete, Some(t_delete))?;
    vm.set_metamethod(ClassId::TABLE, Metamethod::Length, Some(t_length))?;
    vm.set_metamethod(ClassId::TABLE, Metamethod::Add, Some(t_add))?;
    vm.set_metamethod(ClassId::TABLE, Metamethod::IpAdd, Some(t_ipadd))?;
    vm.set_casts(Class(ClassId::TABLE), Class(ClassId::TABLE), t_clone_cast)?;
    Ok(())
}
