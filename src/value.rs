//! The EEL value representation.
//!
//! A value is a tagged union of exactly seven cases: `nil`, `real`,
//! `integer`, `boolean`, `classid`, `objref` and `weakref`. The set is
//! closed; the VM relies on dense dispatch over these tags.
//!
//! `Value` is deliberately plain data (`Copy`). Reference ownership is
//! managed explicitly through the memory manager's copy/clone/move/qcopy/
//! disown operations, never through `Clone`/`Drop`. This is what allows the
//! dispatcher to lift operands out of the register heap before calling a
//! metamethod that needs the VM mutably.

use crate::class::ClassId;

/// EEL's real number type.
pub type Real = f64;

/// EEL's integer type.
pub type Int = i32;

/// Handle to an object in the VM's object slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(pub(crate) u32);

impl ObjId {
    /// Raw slab index, for diagnostics.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ObjId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Back-index marker for a weakref that has been produced but not yet
/// attached to its target. Copying an unwired weakref into its destination
/// cell is what performs the attachment.
pub const WEAKREF_UNWIRED: u32 = u32::MAX;

/// A dynamically typed EEL value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// No value.
    Nil,
    /// IEEE-754 double.
    Real(Real),
    /// 32-bit signed integer.
    Integer(Int),
    /// Boolean.
    Boolean(bool),
    /// Identifier of a registered class.
    ClassId(ClassId),
    /// Owning reference to an object.
    ObjRef(ObjId),
    /// Non-owning reference. `index` is the slot this reference occupies in
    /// the target's weakref vector, or [`WEAKREF_UNWIRED`].
    WeakRef { target: ObjId, index: u32 },
}

impl Value {
    /// True for both reference variants.
    pub fn is_objref(&self) -> bool {
        matches!(self, Value::ObjRef(_) | Value::WeakRef { .. })
    }

    /// The referenced object, for either reference variant.
    pub fn object(&self) -> Option<ObjId> {
        match *self {
            Value::ObjRef(o) => Some(o),
            Value::WeakRef { target, .. } => Some(target),
            _ => None,
        }
    }

    /// The value class of the *tag* (not the class of a referenced object).
    pub fn tag_class(&self) -> ClassId {
        match self {
            Value::Nil => ClassId::NIL,
            Value::Real(_) => ClassId::REAL,
            Value::Integer(_) => ClassId::INTEGER,
            Value::Boolean(_) => ClassId::BOOLEAN,
            Value::ClassId(_) => ClassId::CLASSID,
            Value::ObjRef(_) => ClassId::OBJREF,
            Value::WeakRef { .. } => ClassId::WEAKREF,
        }
    }

    /// Truth test, as used by conditional jumps.
    pub fn test(&self) -> bool {
        match *self {
            Value::Nil => false,
            Value::Real(r) => r != 0.0,
            Value::Integer(i) => i != 0,
            Value::Boolean(b) => b,
            Value::ClassId(_) => true,
            Value::ObjRef(_) | Value::WeakRef { .. } => true,
        }
    }

    /// Numeric view, if there is one.
    pub fn as_real(&self) -> Option<Real> {
        match *self {
            Value::Real(r) => Some(r),
            Value::Integer(i) => Some(i as Real),
            Value::Boolean(b) => Some(if b { 1.0 } else { 0.0 }),
            Value::ClassId(c) => Some(c.raw() as Real),
            _ => None,
        }
    }

    /// Integer view of the "integer-like" tags. Reals are floored.
    pub fn as_int(&self) -> Option<Int> {
        match *self {
            Value::Integer(i) => Some(i),
            Value::Boolean(b) => Some(b as Int),
            Value::ClassId(c) => Some(c.raw() as Int),
            Value::Real(r) => Some(r.floor() as Int),
            _ => None,
        }
    }
}

/// Hash type used by the string pool and the table class.
pub type Hash = u32;

const HASH_SEED: Hash = 1_315_423_911;

/// Hashes a byte slice. Only the first 32 bytes participate, which keeps
/// long-key hashing O(1); equality checks do the rest.
pub fn hash_bytes(data: &[u8]) -> Hash {
    let mut hash = HASH_SEED;
    for &b in data.iter().take(32) {
        hash ^= hash
            .wrapping_shl(5)
            .wrapping_add(b as Hash)
            .wrapping_add(hash >> 2);
    }
    hash
}

/// Hashes a pointer-sized identity, for objects without content hashes.
fn hash_identity(id: ObjId) -> Hash {
    let mut hash = HASH_SEED;
    let i = id.0;
    hash ^= hash
        .wrapping_shl(5)
        .wrapping_add(i)
        .wrapping_add(hash >> 2);
    hash
}

/// Stable hash of a value, given a way to resolve string content hashes.
///
/// Strings hash by their precomputed content hash so that interned and
/// freshly built keys agree; all other objects hash by identity.
pub fn hash_value(v: &Value, string_hash: impl Fn(ObjId) -> Option<Hash>) -> Hash {
    match *v {
        Value::Nil => HASH_SEED,
        Value::Real(r) => {
            let bits = r.to_bits();
            let lo = bits as u32;
            let hi = (bits >> 32) as u32;
            HASH_SEED ^ (42_422_421_131u64 as u32).wrapping_add(lo ^ hi)
        }
        Value::Integer(i) => HASH_SEED.wrapping_shl(ClassId::INTEGER.raw()) ^ i as u32,
        Value::Boolean(b) => HASH_SEED.wrapping_shl(ClassId::BOOLEAN.raw()) ^ b as u32,
        Value::ClassId(c) => HASH_SEED.wrapping_shl(ClassId::CLASSID.raw()) ^ c.raw(),
        Value::ObjRef(o) | Value::WeakRef { target: o, .. } => {
            string_hash(o).unwrap_or_else(|| hash_identity(o))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truth_table() {
        assert!(!Value::Nil.test());
        assert!(!Value::Integer(0).test());
        assert!(Value::Integer(-1).test());
        assert!(!Value::Real(0.0).test());
        assert!(Value::Real(0.5).test());
        assert!(!Value::Boolean(false).test());
        assert!(Value::ObjRef(ObjId(3)).test());
    }

    #[test]
    fn hash_is_stable_and_type_sensitive() {
        let h = |v: &Value| hash_value(v, |_| None);
        assert_eq!(h(&Value::Integer(42)), h(&Value::Integer(42)));
        assert_ne!(h(&Value::Integer(1)), h(&Value::Boolean(true)));
        assert_ne!(h(&Value::Nil), h(&Value::Integer(0)));
    }

    #[test]
    fn hash_bytes_caps_at_32() {
        let long_a = vec![7u8; 100];
        let mut long_b = long_a.clone();
        long_b[99] = 9;
        assert_eq!(hash_bytes(&long_a), hash_bytes(&long_b));
        let mut long_c = long_a.clone();
        long_c[0] = 9;
        assert_ne!(hash_bytes(&long_a), hash_bytes(&long_c));
    }

    #[test]
    fn weakref_identity_hash_matches_objref() {
        let h = |v: &Value| hash_value(v, |_| None);
        let o = ObjId(11);
        assert_eq!(
            h(&Value::ObjRef(o)),
            h(&Value::WeakRef { target: o, index: 2 })
        );
    }
}
