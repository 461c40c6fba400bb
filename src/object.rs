//! Object headers and payloads.
//!
//! Every object is a header plus a per-class payload, stored in the VM's
//! object slab and addressed by [`ObjId`]. The header carries the class-id,
//! the reference count, the weak reference back-pointer vector, and one
//! link slot that records membership in a limbo list, the dead-module list,
//! or the string cache (an object is on at most one of these at a time, so
//! they share the slot).

use std::any::Any;

use crate::class::{ClassDef, ClassId};
use crate::dstring::DString;
use crate::function::Function;
use crate::module::Module;
use crate::strings::InternedString;
use crate::table::TableItem;
use crate::value::{ObjId, Value};
use crate::vector::VectorData;

/// Address of a value cell that can hold an attached weak reference.
///
/// The weakref protocol records, per target object, the cells holding weak
/// references to it. Heap and static slots are stable; container element
/// addresses change when elements shift, which is when `relocate` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellAddr {
    /// A register or argument-stack slot in the value heap.
    Heap(usize),
    /// A module static variable slot.
    Static { module: ObjId, slot: usize },
    /// An array element.
    ArrayItem { array: ObjId, index: usize },
    /// A table entry key.
    TableKey { table: ObjId, index: usize },
    /// A table entry value.
    TableValue { table: ObjId, index: usize },
}

/// Which auxiliary list an object currently sits on, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectLink {
    /// Not enqueued anywhere.
    None,
    /// On the limbo list of call frame `frame`, at `slot`.
    Limbo { frame: u32, slot: u32 },
    /// On the per-VM dead-module list, awaiting GC retry.
    DeadModule,
    /// A refcount-zero string kept alive by the string cache.
    StringCache,
}

/// Per-class payload.
pub enum Payload {
    /// A class definition (`class` instances).
    Class(ClassDef),
    /// Immutable interned string.
    String(InternedString),
    /// Mutable byte-buffer string.
    DString(DString),
    /// Bytecode or native function.
    Function(Function),
    /// Code module.
    Module(Module),
    /// Value array.
    Array(Vec<Value>),
    /// Hash-ordered key/value table.
    Table(Vec<TableItem>),
    /// Packed numeric vector.
    Vector(VectorData),
    /// Instance data of an embedder-registered class.
    Opaque(Box<dyn Any>),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Payload::Class(_) => "Class",
            Payload::String(_) => "String",
            Payload::DString(_) => "DString",
            Payload::Function(_) => "Function",
            Payload::Module(_) => "Module",
            Payload::Array(_) => "Array",
            Payload::Table(_) => "Table",
            Payload::Vector(_) => "Vector",
            Payload::Opaque(_) => "Opaque",
        };
        f.write_str(tag)
    }
}

/// Object header plus payload.
#[derive(Debug)]
pub struct Object {
    /// Class of this instance.
    pub classid: ClassId,
    /// Number of strong references. Zero means the object is being (or has
    /// refused being) destroyed.
    pub refcount: u32,
    /// Cells holding attached weak references to this object. Entry `i`
    /// belongs to the weakref value whose back-index is `i`.
    pub weakrefs: Vec<CellAddr>,
    /// Auxiliary list membership.
    pub link: ObjectLink,
    /// Per-class data.
    pub payload: Payload,
}

impl Object {
    pub(crate) fn new(classid: ClassId, payload: Payload) -> Self {
        Object {
            classid,
            refcount: 1,
            weakrefs: Vec::new(),
            link: ObjectLink::None,
            payload,
        }
    }

    /// True while the object sits on some frame's limbo list.
    pub fn in_limbo(&self) -> bool {
        matches!(self.link, ObjectLink::Limbo { .. })
    }
}
