//! Class registry and metamethod dispatch.
//!
//! Classes are identified by dense numeric ids. A flat vector indexed by
//! class-id is the primary lookup; each entry references a class definition
//! object, itself an instance of the `class` class. Every instance owns a
//! reference to its class definition.
//!
//! Metamethods live in a fixed-size per-class table indexed by
//! [`Metamethod`]. Unregistered slots hold a trap that raises
//! `NoMetamethod`, so dispatch never checks for missing entries.

use std::any::Any;

use crate::error::{Exception, VmResult};
use crate::object::Payload;
use crate::value::{ObjId, Value};
use crate::vm::Vm;

/// Dense numeric identifier of a registered class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct ClassId(pub u32);

impl ClassId {
    // The seven value tags double as pseudo-classes in the cast matrix.
    pub const NIL: ClassId = ClassId(0);
    pub const REAL: ClassId = ClassId(1);
    pub const INTEGER: ClassId = ClassId(2);
    pub const BOOLEAN: ClassId = ClassId(3);
    pub const CLASSID: ClassId = ClassId(4);
    pub const OBJREF: ClassId = ClassId(5);
    pub const WEAKREF: ClassId = ClassId(6);

    // Virtual base classes.
    pub const OBJECT: ClassId = ClassId(7);
    pub const VALUE: ClassId = ClassId(8);

    // Built-in object classes.
    pub const CLASS: ClassId = ClassId(9);
    pub const STRING: ClassId = ClassId(10);
    pub const DSTRING: ClassId = ClassId(11);
    pub const FUNCTION: ClassId = ClassId(12);
    pub const MODULE: ClassId = ClassId(13);
    pub const ARRAY: ClassId = ClassId(14);
    pub const TABLE: ClassId = ClassId(15);
    pub const VECTOR: ClassId = ClassId(16);
    pub const VECTOR_U8: ClassId = ClassId(17);
    pub const VECTOR_S8: ClassId = ClassId(18);
    pub const VECTOR_U16: ClassId = ClassId(19);
    pub const VECTOR_S16: ClassId = ClassId(20);
    pub const VECTOR_U32: ClassId = ClassId(21);
    pub const VECTOR_S32: ClassId = ClassId(22);
    pub const VECTOR_F: ClassId = ClassId(23);
    pub const VECTOR_D: ClassId = ClassId(24);

    /// First id available to embedder-registered classes.
    pub const USER: ClassId = ClassId(25);

    /// Raw numeric id.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// True for the seven value-tag pseudo-classes.
    pub fn is_value_class(self) -> bool {
        self.0 <= Self::WEAKREF.0
    }

    /// True for the typed vector subclasses.
    pub fn is_vector(self) -> bool {
        self.0 >= Self::VECTOR_U8.0 && self.0 <= Self::VECTOR_D.0
    }
}

/// Wildcard selectors for bulk cast registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastSelector {
    /// One specific class.
    Class(ClassId),
    /// Every class.
    Any,
    /// Every class whose `getindex` (source side) or `setindex`
    /// (destination side) metamethod is registered.
    AnyIndexable,
}

/// The closed set of metamethods.
///
/// The arithmetic block is six operations in eight flavors: plain, in-place
/// (`Ip`), reversed-operand (`R`, the receiver is the *right* operand),
/// element-wise vector (`V`), and their combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Metamethod {
    GetIndex,
    SetIndex,
    Copy,
    In,
    Insert,
    Delete,
    Length,
    Compare,
    Eq,
    Cast,
    Serialize,

    Power,
    IpPower,
    Mod,
    IpMod,
    Div,
    IpDiv,
    Mul,
    IpMul,
    Sub,
    IpSub,
    Add,
    IpAdd,

    RPower,
    IpRPower,
    RMod,
    IpRMod,
    RDiv,
    IpRDiv,
    RSub,
    IpRSub,
    RMul,
    IpRMul,
    RAdd,
    IpRAdd,

    VPower,
    IpVPower,
    VMod,
    IpVMod,
    VDiv,
    IpVDiv,
    VMul,
    IpVMul,
    VSub,
    IpVSub,
    VAdd,
    IpVAdd,

    VRPower,
    IpVRPower,
    VRMod,
    IpVRMod,
    VRDiv,
    IpVRDiv,
    VRSub,
    IpVRSub,
    VRMul,
    IpVRMul,
    VRAdd,
    IpVRAdd,
}

/// Number of metamethod slots per class.
pub const MM_COUNT: usize = Metamethod::IpVRAdd as usize + 1;

/// The six arithmetic operations, in metamethod table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Power,
    Mod,
    Div,
    Mul,
    Sub,
    Add,
}

impl Metamethod {
    /// Selects an arithmetic metamethod by operation and flavor.
    pub fn arith(op: ArithOp, in_place: bool, reversed: bool, vector: bool) -> Metamethod {
        let block = match (vector, reversed) {
            (false, false) => Metamethod::Power as usize,
            (false, true) => Metamethod::RPower as usize,
            (true, false) => Metamethod::VPower as usize,
            (true, true) => Metamethod::VRPower as usize,
        };
        let slot = block + 2 * op as usize + in_place as usize;
        ARITH_TABLE[slot - Metamethod::Power as usize]
    }

    /// Symbolic name, for diagnostics and disassembly.
    pub fn name(self) -> &'static str {
        MM_NAMES[self as usize]
    }
}

const ARITH_TABLE: [Metamethod; 48] = [
    Metamethod::Power,
    Metamethod::IpPower,
    Metamethod::Mod,
    Metamethod::IpMod,
    Metamethod::Div,
    Metamethod::IpDiv,
    Metamethod::Mul,
    Metamethod::IpMul,
    Metamethod::Sub,
    Metamethod::IpSub,
    Metamethod::Add,
    Metamethod::IpAdd,
    Metamethod::RPower,
    Metamethod::IpRPower,
    Metamethod::RMod,
    Metamethod::IpRMod,
    Metamethod::RDiv,
    Metamethod::IpRDiv,
    Metamethod::RSub,
    Metamethod::IpRSub,
    Metamethod::RMul,
    Metamethod::IpRMul,
    Metamethod::RAdd,
    Metamethod::IpRAdd,
    Metamethod::VPower,
    Metamethod::IpVPower,
    Metamethod::VMod,
    Metamethod::IpVMod,
    Metamethod::VDiv,
    Metamethod::IpVDiv,
    Metamethod::VMul,
    Metamethod::IpVMul,
    Metamethod::VSub,
    Metamethod::IpVSub,
    Metamethod::VAdd,
    Metamethod::IpVAdd,
    Metamethod::VRPower,
    Metamethod::IpVRPower,
    Metamethod::VRMod,
    Metamethod::IpVRMod,
    Metamethod::VRDiv,
    Metamethod::IpVRDiv,
    Metamethod::VRSub,
    Metamethod::IpVRSub,
    Metamethod::VRMul,
    Metamethod::IpVRMul,
    Metamethod::VRAdd,
    Metamethod::IpVRAdd,
];

const MM_NAMES: [&str; MM_COUNT] = [
    "GETINDEX",
    "SETINDEX",
    "COPY",
    "IN",
    "INSERT",
    "DELETE",
    "LENGTH",
    "COMPARE",
    "EQ",
    "CAST",
    "SERIALIZE",
    "POWER",
    "IPPOWER",
    "MOD",
    "IPMOD",
    "DIV",
    "IPDIV",
    "MUL",
    "IPMUL",
    "SUB",
    "IPSUB",
    "ADD",
    "IPADD",
    "RPOWER",
    "IPRPOWER",
    "RMOD",
    "IPRMOD",
    "RDIV",
    "IPRDIV",
    "RSUB",
    "IPRSUB",
    "RMUL",
    "IPRMUL",
    "RADD",
    "IPRADD",
    "VPOWER",
    "IPVPOWER",
    "VMOD",
    "IPVMOD",
    "VDIV",
    "IPVDIV",
    "VMUL",
    "IPVMUL",
    "VSUB",
    "IPVSUB",
    "VADD",
    "IPVADD",
    "VRPOWER",
    "IPVRPOWER",
    "VRMOD",
    "IPVRMOD",
    "VRDIV",
    "IPVRDIV",
    "VRSUB",
    "IPVRSUB",
    "VRMUL",
    "IPVRMUL",
    "VRADD",
    "IPVRADD",
];

/// Metamethod callback.
///
/// `op1` and `op2` play per-metamethod roles: key and out-slot for
/// `GetIndex`, key and value for `SetIndex`, range operands for `Delete`
/// (both absent means "delete all"), and so on. Returned references must
/// have their refcount raised; the caller resolves limbo placement with
/// `receive`.
pub type MmCallback =
    fn(vm: &mut Vm, obj: ObjId, op1: Option<&Value>, op2: Option<&mut Value>) -> VmResult<()>;

/// Constructor callback. `argv`/`argc` address the initializer values on the
/// VM heap. The returned value owns its reference.
pub type CtorCallback = fn(vm: &mut Vm, cid: ClassId, argv: usize, argc: usize) -> VmResult<Value>;

/// Destructor callback. `Err(Exception::Refuse)` keeps the object alive
/// (string cache, dead-module list).
pub type DtorCallback = fn(vm: &mut Vm, obj: ObjId) -> VmResult<()>;

/// Hook run when the class itself is torn down.
pub type UnregisterCallback = fn(vm: &mut Vm, cid: ClassId, classdata: Option<Box<dyn Any>>);

/// Trap installed in every unregistered metamethod slot.
fn no_method(
    _vm: &mut Vm,
    _obj: ObjId,
    _op1: Option<&Value>,
    _op2: Option<&mut Value>,
) -> VmResult<()> {
    Err(Exception::NoMetamethod)
}

/// A class definition. Lives as the payload of a `class` instance.
pub struct ClassDef {
    /// Interned class name; absent only during bootstrap.
    pub name: Option<ObjId>,
    /// This class's own id.
    pub classid: ClassId,
    /// Ancestor class id.
    pub ancestor: ClassId,
    pub construct: Option<CtorCallback>,
    pub destruct: Option<DtorCallback>,
    pub mmethods: [MmCallback; MM_COUNT],
    pub unregister: Option<UnregisterCallback>,
    /// Shared per-class data (interned member-name strings and the like).
    pub classdata: Option<Box<dyn Any>>,
    /// Cleared by `unregister_class`; the definition object then dies with
    /// its last instance.
    pub registered: bool,
}

impl ClassDef {
    fn new(classid: ClassId, ancestor: ClassId) -> Self {
        ClassDef {
            name: None,
            classid,
            ancestor,
            construct: None,
            destruct: None,
            mmethods: [no_method; MM_COUNT],
            unregister: None,
            classdata: None,
            registered: true,
        }
    }
}

impl std::fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDef")
            .field("classid", &self.classid)
            .field("ancestor", &self.ancestor)
            .field("registered", &self.registered)
            .finish()
    }
}

/// Destructor for class definition objects. Runs the unregister hook,
/// releases the name, and clears the class table entry.
pub(crate) fn class_destruct(vm: &mut Vm, obj: ObjId) -> VmResult<()> {
    let (cid, name, unregister, classdata) = {
        let def = match &mut vm.object_mut(obj).payload {
            Payload::Class(d) => d,
            _ => return Err(Exception::Internal),
        };
        (
            def.classid,
            def.name.take(),
            def.unregister.take(),
            def.classdata.take(),
        )
    };
    if let Some(ur) = unregister {
        ur(vm, cid, classdata);
    }
    if let Some(n) = name {
        vm.disown_object(n);
    }
    if let Some(slot) = vm.classes.get_mut(cid.raw() as usize) {
        *slot = None;
    }
    Ok(())
}

impl Vm {
    /// Registers a class under `cid`, or under the next free id when `cid`
    /// is `None`. Returns the class definition object.
    ///
    /// Re-registering an existing class is allowed only to back-fill a name
    /// during bootstrap; anything else is an internal error.
    pub fn register_class(
        &mut self,
        cid: Option<ClassId>,
        name: &str,
        ancestor: ClassId,
        construct: Option<CtorCallback>,
        destruct: Option<DtorCallback>,
    ) -> VmResult<ObjId> {
        let cid = cid.unwrap_or(ClassId(self.classes.len() as u32));
        let idx = cid.raw() as usize;
        if idx >= self.classes.len() {
            self.classes.resize(idx + 1, None);
            self.grow_cast_matrix(idx + 1)?;
        }

        if let Some(co) = self.classes[idx] {
            // Bootstrap mode: only a missing name may be filled in.
            if self.classdef(cid)?.name.is_some() {
                return Err(Exception::Internal);
            }
            self.add_class_name(cid, name)?;
            return Ok(co);
        }

        let mut def = ClassDef::new(cid, ancestor);
        def.construct = construct;
        def.destruct = destruct;
        let co = self.alloc_object(ClassId::CLASS, Payload::Class(def))?;
        self.classes[idx] = Some(co);
        // A class definition is itself an instance of the class class, and
        // holds a reference to it. During bootstrap the class class may not
        // exist yet; the missing reference is patched in afterwards.
        if let Some(Some(cc)) = self.classes.get(ClassId::CLASS.raw() as usize).copied() {
            self.own_object(cc);
        }
        self.add_class_name(cid, name)?;
        Ok(co)
    }

    /// Attaches the interned name, once the string class is operational.
    fn add_class_name(&mut self, cid: ClassId, name: &str) -> VmResult<()> {
        let have_strings = self
            .classes
            .get(ClassId::STRING.raw() as usize)
            .map_or(false, |c| c.is_some());
        if !have_strings {
            return Ok(());
        }
        let ns = self.intern(name)?;
        self.classdef_mut(cid)?.name = Some(ns);
        Ok(())
    }

    /// Marks a class unregistered and drops the class table's reference.
    /// The definition object goes away with the last instance, clearing the
    /// table entry in the process.
    pub fn unregister_class(&mut self, cid: ClassId) {
        let Some(Some(co)) = self.classes.get(cid.raw() as usize).copied() else {
            return;
        };
        let registered = match self.classdef_mut(cid) {
            Ok(def) if def.registered => {
                def.registered = false;
                true
            }
            _ => false,
        };
        if registered {
            self.disown_object(co);
        }
    }

    /// Installs a metamethod. `None` restores the `NoMetamethod` trap.
    pub fn set_metamethod(
        &mut self,
        cid: ClassId,
        mm: Metamethod,
        cb: Option<MmCallback>,
    ) -> VmResult<()> {
        self.classdef_mut(cid)?.mmethods[mm as usize] = cb.unwrap_or(no_method);
        Ok(())
    }

    /// Installs the class teardown hook.
    pub fn set_unregister(&mut self, cid: ClassId, cb: UnregisterCallback) -> VmResult<()> {
        self.classdef_mut(cid)?.unregister = Some(cb);
        Ok(())
    }

    /// Attaches shared per-class data.
    pub fn set_classdata(&mut self, cid: ClassId, data: Box<dyn Any>) -> VmResult<()> {
        self.classdef_mut(cid)?.classdata = Some(data);
        Ok(())
    }

    /// The class definition for `cid`.
    pub fn classdef(&self, cid: ClassId) -> VmResult<&ClassDef> {
        let co = self
            .classes
            .get(cid.raw() as usize)
            .copied()
            .flatten()
            .ok_or(Exception::Internal)?;
        match &self.object(co).payload {
            Payload::Class(def) => Ok(def),
            _ => Err(Exception::Internal),
        }
    }

    pub(crate) fn classdef_mut(&mut self, cid: ClassId) -> VmResult<&mut ClassDef> {
        let co = self
            .classes
            .get(cid.raw() as usize)
            .copied()
            .flatten()
            .ok_or(Exception::Internal)?;
        match &mut self.object_mut(co).payload {
            Payload::Class(def) => Ok(def),
            _ => Err(Exception::Internal),
        }
    }

    /// Whether `cid` names a live class with `mm` registered.
    pub(crate) fn has_metamethod(&self, cid: ClassId, mm: Metamethod) -> bool {
        match self.classdef(cid) {
            Ok(def) => def.mmethods[mm as usize] != (no_method as MmCallback),
            Err(_) => false,
        }
    }

    /// Class name as UTF-8, for diagnostics.
    pub fn class_name(&self, cid: ClassId) -> String {
        match self.classdef(cid) {
            Ok(def) => match def.name {
                Some(ns) => String::from_utf8_lossy(self.string_bytes(ns)).into_owned(),
                None => format!("<class {}>", cid.raw()),
            },
            Err(_) => format!("<class {}>", cid.raw()),
        }
    }

    /// Dispatches metamethod `mm` on `obj`.
    pub fn metamethod(
        &mut self,
        obj: ObjId,
        mm: Metamethod,
        op1: Option<&Value>,
        op2: Option<&mut Value>,
    ) -> VmResult<()> {
        let cid = self.object(obj).classid;
        let cb = self.classdef(cid)?.mmethods[mm as usize];
        cb(self, obj, op1, op2)
    }

    /// Dispatches a metamethod that produces a value.
    pub fn metamethod_value(
        &mut self,
        obj: ObjId,
        mm: Metamethod,
        op1: Option<&Value>,
    ) -> VmResult<Value> {
        let mut out = Value::Nil;
        self.metamethod(obj, mm, op1, Some(&mut out))?;
        Ok(out)
    }

    /// Length of an indexable object, via the `Length` metamethod.
    pub fn length_of(&mut self, obj: ObjId) -> VmResult<i32> {
        let v = self.metamethod_value(obj, Metamethod::Length, None)?;
        v.as_int().ok_or(Exception::WrongType)
    }

    /// The class-id an instance of `cid` descends from, following ancestor
    /// links up to `object`.
    pub fn class_ancestor(&self, cid: ClassId) -> VmResult<ClassId> {
        Ok(self.classdef(cid)?.ancestor)
    }

    /// Shuts down the class subsystem: unregisters every class (the class
    /// and string classes survive on their mutual references), then breaks
    /// the bootstrap cycle.
    pub(crate) fn close_classes(&mut self) {
        for idx in (0..self.classes.len()).rev() {
            if self.classes[idx].is_some() {
                self.unregister_class(ClassId(idx as u32));
            }
        }
        self.unstrap();
        self.classes.clear();
    }

    /// Reverse of the bootstrap: `class` and `string` hold each other alive
    /// through their names, so the names are disowned in a fixed order.
    fn unstrap(&mut self) {
        let (Some(Some(class_obj)), Some(Some(string_obj))) = (
            self.classes.get(ClassId::CLASS.raw() as usize).copied(),
            self.classes.get(ClassId::STRING.raw() as usize).copied(),
        ) else {
            return;
        };
        // The unregister pass above dropped the table references; at this
        // point both survivors must be held exactly by (a) their own
        // instances and (b) each other's names.
        let crc = self.object(class_obj).refcount;
        let src = self.object(string_obj).refcount;
        if crc != 2 || src != 2 {
            self.messages.vm_warning(format!(
                "class/string refcounts are {crc} and {src} at shutdown \
                 (expected 2 and 2); leaking the bootstrap objects"
            ));
            log::warn!(
                "unstrap: class rc={crc}, string rc={src}; something leaked"
            );
            return;
        }

        // Release the names in order. Dropping the string class's name
        // kills the last string, which takes the string class with it;
        // finally the class class lets go of itself.
        if let Some(name) = self.classdef_mut(ClassId::CLASS).ok().and_then(|d| d.name.take()) {
            self.disown_object(name);
        }
        if let Some(name) = self.classdef_mut(ClassId::STRING).ok().and_then(|d| d.name.take()) {
            self.disown_object(name);
        }
        self.disown_object(class_obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arith_selection_covers_all_flavors() {
        assert_eq!(
            Metamethod::arith(ArithOp::Add, false, false, false),
            Metamethod::Add
        );
        assert_eq!(
            Metamethod::arith(ArithOp::Add, true, false, false),
            Metamethod::IpAdd
        );
        assert_eq!(
            Metamethod::arith(ArithOp::Sub, false, true, false),
            Metamethod::RSub
        );
        assert_eq!(
            Metamethod::arith(ArithOp::Mul, false, false, true),
            Metamethod::VMul
        );
        assert_eq!(
            Metamethod::arith(ArithOp::Power, true, true, true),
            Metamethod::IpVRPower
        );
    }

    #[test]
    fn mm_names_are_dense() {
        assert_eq!(MM_NAMES.len(), MM_COUNT);
        assert_eq!(Metamethod::GetIndex.name(), "GETINDEX");
        assert_eq!(Metamethod::IpVRAdd.name(), "IPVRADD");
    }
}
