//! The memory manager: object slab, reference counting, weak references,
//! limbo lists, and the value copy/move/disown operations.
//!
//! Reference counting is aggressive: an object whose count reaches zero is
//! destroyed inline. Destructors may refuse; a refused string becomes a
//! cache resident and a refused module joins the dead-module list.
//!
//! Limbo lists keep intermediate expression results from leaking: anything
//! returned by an operator, cast or constructor is parked on the current
//! frame's limbo list until it is consumed (`receive`) or the frame exits.

use crate::class::ClassId;
use crate::error::{Exception, VmResult};
use crate::object::{CellAddr, Object, ObjectLink, Payload};
use crate::value::{ObjId, Value, WEAKREF_UNWIRED};
use crate::vm::Vm;

/// Minimum weakref vector capacity once any weakref is attached.
const WEAKREF_MIN_SIZE: usize = 4;

/// Grow-by-3/2, shrink-by-half resize calculator shared by all dynamically
/// sized storage. Shrinking backs off unless the block would halve, which
/// keeps repeated insert/delete near a size boundary from thrashing.
pub(crate) fn calcresize(base: usize, current: usize, requested: usize) -> usize {
    if requested > current {
        let mut n = if current != 0 { current } else { base };
        while n < requested {
            n = (n * 3 >> 1) + base;
        }
        n
    } else {
        let n = current / 2;
        if requested > n {
            current
        } else if n < base {
            base
        } else {
            n
        }
    }
}

/// A slot in the object slab.
#[derive(Debug)]
pub(crate) enum Slot {
    Free { next: Option<u32> },
    Used(Object),
}

impl Vm {
    /// Allocates an object of class `cid` with refcount 1. The instance
    /// takes a reference to its class definition (except while the class
    /// class itself is being bootstrapped).
    pub fn alloc_object(&mut self, cid: ClassId, payload: Payload) -> VmResult<ObjId> {
        let obj = Object::new(cid, payload);
        let id = match self.free_head {
            Some(i) => {
                let next = match self.objects[i as usize] {
                    Slot::Free { next } => next,
                    Slot::Used(_) => return Err(Exception::Internal),
                };
                self.free_head = next;
                self.objects[i as usize] = Slot::Used(obj);
                ObjId(i)
            }
            None => {
                self.objects.push(Slot::Used(obj));
                ObjId((self.objects.len() - 1) as u32)
            }
        };
        if cid != ClassId::CLASS {
            if let Some(Some(co)) = self.classes.get(cid.raw() as usize).copied() {
                self.own_object(co);
            }
        }
        Ok(id)
    }

    /// Releases the slab slot and the instance's class reference. The
    /// payload must already have been torn down by the destructor.
    pub(crate) fn free_object(&mut self, id: ObjId) {
        let cid = self.object(id).classid;
        self.objects[id.0 as usize] = Slot::Free {
            next: self.free_head,
        };
        self.free_head = Some(id.0);
        if let Some(Some(co)) = self.classes.get(cid.raw() as usize).copied() {
            self.disown_object(co);
        }
    }

    /// Header + payload of a live object.
    ///
    /// Panics on a stale id; strong references keep objects alive and weak
    /// references are nil'ed on death, so a stale id is a core bug.
    pub fn object(&self, id: ObjId) -> &Object {
        match &self.objects[id.0 as usize] {
            Slot::Used(o) => o,
            Slot::Free { .. } => panic!("stale object id {id}"),
        }
    }

    pub(crate) fn object_mut(&mut self, id: ObjId) -> &mut Object {
        match &mut self.objects[id.0 as usize] {
            Slot::Used(o) => o,
            Slot::Free { .. } => panic!("stale object id {id}"),
        }
    }

    /// True if `id` addresses a live object (diagnostics only).
    pub fn is_live(&self, id: ObjId) -> bool {
        matches!(
            self.objects.get(id.0 as usize),
            Some(Slot::Used(_))
        )
    }

    /// Number of live objects in the slab (diagnostics only).
    pub fn live_objects(&self) -> usize {
        self.objects
            .iter()
            .filter(|s| matches!(s, Slot::Used(_)))
            .count()
    }

    /// Adds a strong reference.
    pub fn own_object(&mut self, id: ObjId) {
        self.object_mut(id).refcount += 1;
    }

    /// Drops a strong reference; destroys the object when the count
    /// reaches zero.
    pub fn disown_object(&mut self, id: ObjId) {
        let o = self.object_mut(id);
        debug_assert!(o.refcount > 0, "disown of zombified object {id}");
        o.refcount -= 1;
        if o.refcount == 0 {
            self.dispose_object(id);
        }
    }

    /// Destroys an object whose refcount has reached zero.
    pub(crate) fn dispose_object(&mut self, id: ObjId) {
        if self.object(id).in_limbo() {
            self.limbo_unlink(id);
        }
        self.destruct_object(id);
    }

    /// Runs the destructor; a refusal leaves the object as a zombie (cache
    /// resident or dead-module entry), anything else frees it.
    pub(crate) fn destruct_object(&mut self, id: ObjId) {
        let cid = self.object(id).classid;
        let dtor = self.classdef(cid).ok().and_then(|d| d.destruct);
        let outcome = match dtor {
            Some(cb) => cb(self, id),
            None => Ok(()),
        };
        match outcome {
            Err(Exception::Refuse) => {
                log::trace!("object {id} refused destruction");
            }
            _ => {
                self.kill_weakrefs(id);
                self.free_object(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Weak reference management
    // ------------------------------------------------------------------

    /// Records `cell` as holding a weak reference to `target`; returns the
    /// back-index to store in the weakref value.
    pub(crate) fn weakref_attach(&mut self, target: ObjId, cell: CellAddr) -> u32 {
        let wr = &mut self.object_mut(target).weakrefs;
        if wr.capacity() < wr.len() + 1 {
            let want = calcresize(WEAKREF_MIN_SIZE, wr.capacity(), wr.len() + 1);
            wr.reserve_exact(want - wr.len());
        }
        wr.push(cell);
        (wr.len() - 1) as u32
    }

    /// Removes the back-pointer at `index`, fixing the entry that
    /// swap-remove moved into its place, and shrinking the vector when
    /// occupancy drops below half.
    pub(crate) fn weakref_detach(&mut self, target: ObjId, index: u32) {
        if index == WEAKREF_UNWIRED {
            // An unwired placeholder was never recorded anywhere.
            return;
        }
        let index = index as usize;
        let moved = {
            let wr = &mut self.object_mut(target).weakrefs;
            if index >= wr.len() {
                return;
            }
            wr.swap_remove(index);
            wr.get(index).copied()
        };
        if let Some(addr) = moved {
            if let Some(cell) = self.cell_mut(addr) {
                if let Value::WeakRef { index: i, .. } = cell {
                    *i = index as u32;
                }
            }
        }
        let wr = &mut self.object_mut(target).weakrefs;
        if wr.len() < wr.capacity() / 2 && wr.capacity() > WEAKREF_MIN_SIZE {
            wr.shrink_to(wr.capacity() / 2);
        }
    }

    /// Updates the recorded cell address of a wired weakref after its cell
    /// moved (container elements shifting on insert/delete).
    pub(crate) fn weakref_relocate(&mut self, v: Value, new_addr: CellAddr) {
        if let Value::WeakRef { target, index } = v {
            if index != WEAKREF_UNWIRED {
                let wr = &mut self.object_mut(target).weakrefs;
                if (index as usize) < wr.len() {
                    wr[index as usize] = new_addr;
                }
            }
        }
    }

    /// Overwrites every cell holding a weak reference to `id` with `nil`.
    /// Called when the object is destroyed.
    pub(crate) fn kill_weakrefs(&mut self, id: ObjId) {
        let cells = std::mem::take(&mut self.object_mut(id).weakrefs);
        for addr in cells {
            if let Some(cell) = self.cell_mut(addr) {
                *cell = Value::Nil;
            }
        }
    }

    /// Resolves a cell address to the value slot it names.
    pub(crate) fn cell_mut(&mut self, addr: CellAddr) -> Option<&mut Value> {
        match addr {
            CellAddr::Heap(i) => self.heap.get_mut(i),
            CellAddr::Static { module, slot } => match &mut self.object_mut(module).payload {
                Payload::Module(m) => m.variables.get_mut(slot),
                _ => None,
            },
            CellAddr::ArrayItem { array, index } => match &mut self.object_mut(array).payload {
                Payload::Array(values) => values.get_mut(index),
                _ => None,
            },
            CellAddr::TableKey { table, index } => match &mut self.object_mut(table).payload {
                Payload::Table(items) => items.get_mut(index).map(|it| &mut it.key),
                _ => None,
            },
            CellAddr::TableValue { table, index } => match &mut self.object_mut(table).payload {
                Payload::Table(items) => items.get_mut(index).map(|it| &mut it.value),
                _ => None,
            },
        }
    }

    // ------------------------------------------------------------------
    // Limbo lists
    // ------------------------------------------------------------------

    /// Adds `id` to the current frame's limbo list. At the root (no call
    /// frame) ownership simply stays with the caller.
    pub(crate) fn limbo_push(&mut self, id: ObjId) {
        debug_assert!(
            !self.object(id).in_limbo(),
            "object {id} re-added to limbo"
        );
        let Some(frame) = self.frames.len().checked_sub(1) else {
            return;
        };
        let slot = self.frames[frame].limbo.len() as u32;
        self.frames[frame].limbo.push(id);
        self.object_mut(id).link = ObjectLink::Limbo {
            frame: frame as u32,
            slot,
        };
    }

    /// Removes `id` from whatever limbo list holds it.
    pub(crate) fn limbo_unlink(&mut self, id: ObjId) {
        let ObjectLink::Limbo { frame, slot } = self.object(id).link else {
            return;
        };
        self.object_mut(id).link = ObjectLink::None;
        let list = &mut self.frames[frame as usize].limbo;
        list.swap_remove(slot as usize);
        if let Some(&moved) = list.get(slot as usize) {
            self.object_mut(moved).link = ObjectLink::Limbo { frame, slot };
        }
    }

    /// Disowns everything on frame `frame`'s limbo list.
    pub(crate) fn limbo_clean(&mut self, frame: usize) {
        while let Some(id) = self.frames[frame].limbo.pop() {
            self.object_mut(id).link = ObjectLink::None;
            self.disown_object(id);
        }
    }

    // ------------------------------------------------------------------
    // Value operations
    // ------------------------------------------------------------------

    /// Takes a strong reference on behalf of `v`, if it is an objref.
    pub fn own_value(&mut self, v: &Value) {
        if let Value::ObjRef(o) = *v {
            self.own_object(o);
        }
    }

    /// Releases whatever reference `v` holds: objrefs drop the refcount,
    /// wired weakrefs detach, primitives are untouched.
    pub fn disown_value(&mut self, v: Value) {
        match v {
            Value::ObjRef(o) => self.disown_object(o),
            Value::WeakRef { target, index } => self.weakref_detach(target, index),
            _ => {}
        }
    }

    /// Copy with ownership: objrefs gain a reference; an *unwired* weakref
    /// becomes attached at `dst`; a wired weakref is promoted to an owning
    /// objref.
    pub fn copy_value(&mut self, from: Value, dst: CellAddr) -> Value {
        match from {
            Value::ObjRef(o) => {
                self.own_object(o);
                from
            }
            Value::WeakRef { target, index } => {
                if index == WEAKREF_UNWIRED {
                    let i = self.weakref_attach(target, dst);
                    Value::WeakRef { target, index: i }
                } else {
                    self.own_object(target);
                    Value::ObjRef(target)
                }
            }
            other => other,
        }
    }

    /// As [`Vm::copy_value`], but a weakref source always yields a fresh
    /// weakref attachment at `dst` (used when cloning containers).
    pub fn clone_value(&mut self, from: Value, dst: CellAddr) -> Value {
        match from {
            Value::ObjRef(o) => {
                self.own_object(o);
                from
            }
            Value::WeakRef { target, .. } => {
                let i = self.weakref_attach(target, dst);
                Value::WeakRef { target, index: i }
            }
            other => other,
        }
    }

    /// Transfers a value to a new cell. Ownership moves with it; wired
    /// weakrefs have their recorded cell address fixed up. The source cell
    /// must be treated as invalid afterwards.
    pub fn move_value(&mut self, from: Value, dst: CellAddr) -> Value {
        if let Value::WeakRef { .. } = from {
            self.weakref_relocate(from, dst);
        }
        from
    }

    /// Quick copy without ownership; weakrefs become non-owning objrefs.
    /// For short-lived intermediates only.
    pub fn qcopy_value(&self, from: Value) -> Value {
        match from {
            Value::WeakRef { target, .. } => Value::ObjRef(target),
            other => other,
        }
    }

    /// Receives a reference returned from an operator, cast, constructor or
    /// function. The callee raised the refcount; if the object is already
    /// in limbo the count is simply restored, otherwise the object enters
    /// the current frame's limbo with that count as the list's ownership.
    pub fn receive_value(&mut self, v: Value) {
        let Some(o) = v.object() else { return };
        if self.object(o).in_limbo() {
            debug_assert!(self.object(o).refcount > 0);
            self.object_mut(o).refcount -= 1;
        } else {
            self.limbo_push(o);
        }
    }

    /// Like receive, but for grabbing values directly out of variables:
    /// takes a reference and parks the object in limbo unless it is
    /// already there.
    pub fn grab_value(&mut self, v: Value) {
        let Some(o) = v.object() else { return };
        if !self.object(o).in_limbo() {
            self.own_object(o);
            self.limbo_push(o);
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Invokes the class constructor with initializers already on the heap.
    pub(crate) fn construct_from_heap(
        &mut self,
        cid: ClassId,
        argv: usize,
        argc: usize,
    ) -> VmResult<Value> {
        let ctor = self
            .classdef(cid)?
            .construct
            .ok_or(Exception::NoConstructor)?;
        ctor(self, cid, argv, argc)
    }

    /// Constructs an instance of `cid` from a slice of initializers. The
    /// initializers are lent to the constructor; ownership of the result
    /// goes to the caller.
    pub fn construct(&mut self, cid: ClassId, args: &[Value]) -> VmResult<Value> {
        let argv = self.sp;
        self.grow_heap(self.sp + args.len())?;
        for (i, a) in args.iter().enumerate() {
            self.heap[argv + i] = self.qcopy_value(*a);
        }
        self.sp += args.len();
        let r = self.construct_from_heap(cid, argv, args.len());
        self.sp = argv;
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calcresize_grows_by_three_halves() {
        assert_eq!(calcresize(8, 0, 1), 8);
        assert_eq!(calcresize(8, 8, 9), 20);
        assert_eq!(calcresize(4, 4, 5), 10);
    }

    #[test]
    fn calcresize_shrinks_defensively() {
        // Requested still above half: keep the block.
        assert_eq!(calcresize(8, 32, 20), 32);
        // Requested at or below half: halve.
        assert_eq!(calcresize(8, 32, 10), 16);
        // Never below the base.
        assert_eq!(calcresize(8, 16, 1), 8);
    }
}
