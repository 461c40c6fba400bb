//! The typecast matrix.
//!
//! Casting is driven by a flat 2-D table of callbacks indexed by
//! `(from-class, to-class)`, where the rows and columns include the seven
//! primitive pseudo-classes. Lookup is O(1). Two wildcard selectors allow
//! bulk registration that fills empty cells whose concrete class exposes
//! `getindex` (source side) and/or `setindex` (destination side).
//!
//! When a cast to one of the string classes fails, the runtime falls back
//! to the generic string-representation path instead.

use crate::class::{CastSelector, ClassId, Metamethod};
use crate::error::{Exception, VmResult};
use crate::value::Value;
use crate::vm::Vm;

/// Cast callback: produces a new value of class `to` from `src`. Returned
/// references own their refcount.
pub type CastCallback = fn(vm: &mut Vm, src: &Value, to: ClassId) -> VmResult<Value>;

fn cast_not_implemented(_vm: &mut Vm, _src: &Value, _to: ClassId) -> VmResult<Value> {
    Err(Exception::NotImplemented)
}

/// Element-by-element cast between any two indexable classes.
fn generic_indexable_cast(vm: &mut Vm, src: &Value, to: ClassId) -> VmResult<Value> {
    let so = src.object().ok_or(Exception::NeedObject)?;
    let len = vm.length_of(so)?;
    let dst = vm.construct(to, &[])?;
    let dsto = dst.object().ok_or(Exception::Constructor)?;
    for i in 0..len {
        let key = Value::Integer(i);
        let r = vm
            .metamethod_value(so, Metamethod::GetIndex, Some(&key))
            .and_then(|tmp| {
                let r = vm.metamethod(dsto, Metamethod::SetIndex, Some(&key), Some(&mut tmp.clone()));
                vm.disown_value(tmp);
                r
            });
        if let Err(x) = r {
            vm.disown_object(dsto);
            return Err(x);
        }
    }
    Ok(dst)
}

/// Conversions between the primitive pseudo-classes, with the same rules
/// the specialized cast instructions apply.
fn cast_primitive(_vm: &mut Vm, src: &Value, to: ClassId) -> VmResult<Value> {
    match to {
        ClassId::REAL => Ok(Value::Real(src.as_real().unwrap_or(0.0))),
        ClassId::INTEGER => match *src {
            Value::Nil => Ok(Value::Integer(0)),
            _ => src.as_int().map(Value::Integer).ok_or(Exception::WrongType),
        },
        ClassId::BOOLEAN => Ok(Value::Boolean(src.test())),
        ClassId::CLASSID => match *src {
            Value::ClassId(_) => Ok(*src),
            Value::Integer(i) if i >= 0 => Ok(Value::ClassId(ClassId(i as u32))),
            _ => Err(Exception::WrongType),
        },
        ClassId::NIL => match *src {
            Value::Nil => Ok(Value::Nil),
            _ => Err(Exception::WrongType),
        },
        _ => Err(Exception::NotImplemented),
    }
}

impl Vm {
    /// Widens the cast matrix to at least `newdim` classes per side,
    /// preserving the existing cells. The dimension is rounded up so that
    /// repeated single-class registrations do not reallocate every time.
    pub(crate) fn grow_cast_matrix(&mut self, newdim: usize) -> VmResult<()> {
        let newdim = (newdim + 3) & !3usize;
        if newdim <= self.casters_dim {
            return Ok(());
        }
        let mut nc: Vec<CastCallback> = vec![cast_not_implemented; newdim * newdim];
        for y in 0..self.casters_dim {
            for x in 0..self.casters_dim {
                nc[y * newdim + x] = self.casters[y * self.casters_dim + x];
            }
        }
        self.casters = nc;
        self.casters_dim = newdim;
        Ok(())
    }

    /// Registers a cast. Wildcard selectors fill every *empty* matching
    /// cell, so concrete registrations always win.
    pub fn set_casts(
        &mut self,
        from: CastSelector,
        to: CastSelector,
        cb: CastCallback,
    ) -> VmResult<()> {
        if let (CastSelector::Class(f), CastSelector::Class(t)) = (from, to) {
            let dim = self.casters_dim;
            let (fi, ti) = (f.raw() as usize, t.raw() as usize);
            if fi >= dim || ti >= dim {
                self.grow_cast_matrix(fi.max(ti) + 1)?;
            }
            let dim = self.casters_dim;
            self.casters[fi * dim + ti] = cb;
            return Ok(());
        }
        let dim = self.casters_dim;
        for y in 0..dim {
            let from_ok = match from {
                CastSelector::Any => true,
                CastSelector::AnyIndexable => {
                    self.has_metamethod(ClassId(y as u32), Metamethod::GetIndex)
                }
                CastSelector::Class(c) => ClassId(y as u32) == c,
            };
            if !from_ok {
                continue;
            }
            for x in 0..dim {
                let to_ok = match to {
                    CastSelector::Any => true,
                    CastSelector::AnyIndexable => {
                        self.has_metamethod(ClassId(x as u32), Metamethod::SetIndex)
                    }
                    CastSelector::Class(c) => ClassId(x as u32) == c,
                };
                if !to_ok {
                    continue;
                }
                if self.casters[y * dim + x] != (cast_not_implemented as CastCallback) {
                    continue;
                }
                self.casters[y * dim + x] = cb;
            }
        }
        Ok(())
    }

    /// The class a value belongs to for dispatch purposes: the tag class
    /// for primitives, the instance class for references.
    pub fn value_class(&self, v: &Value) -> ClassId {
        match v.object() {
            Some(o) => self.object(o).classid,
            None => v.tag_class(),
        }
    }

    /// Casts `src` to class `to`.
    ///
    /// On failure with a string-class target, the generic string
    /// representation of the value is produced instead, so "anything can be
    /// turned into text" holds without every class registering a cast.
    pub fn cast_value(&mut self, src: &Value, to: ClassId) -> VmResult<Value> {
        let from = self.value_class(src);
        let dim = self.casters_dim;
        let (fi, ti) = (from.raw() as usize, to.raw() as usize);
        let r = if fi < dim && ti < dim {
            let cb = self.casters[fi * dim + ti];
            cb(self, src, to)
        } else {
            Err(Exception::NotImplemented)
        };
        match r {
            Ok(v) => Ok(v),
            Err(x) => {
                if to == ClassId::STRING {
                    let s = self.value_repr(src);
                    let id = self.intern(&s)?;
                    Ok(Value::ObjRef(id))
                } else if to == ClassId::DSTRING {
                    let s = self.value_repr(src);
                    let id = self.new_dstring(s.as_bytes())?;
                    Ok(Value::ObjRef(id))
                } else {
                    Err(x)
                }
            }
        }
    }

    /// Installs the cross-class wildcard cast and the primitive conversion
    /// cells. Runs after the built-in classes have registered, so the
    /// indexable tests see their metamethods.
    pub(crate) fn init_casts(&mut self) -> VmResult<()> {
        for from in 0..=ClassId::CLASSID.raw() {
            for to in 0..=ClassId::CLASSID.raw() {
                self.set_casts(
                    CastSelector::Class(ClassId(from)),
                    CastSelector::Class(ClassId(to)),
                    cast_primitive,
                )?;
            }
        }
        self.set_casts(
            CastSelector::AnyIndexable,
            CastSelector::AnyIndexable,
            generic_indexable_cast,
        )?;
        Ok(())
    }

    /// Releases the cast matrix.
    pub(crate) fn close_casts(&mut self) {
        self.casters.clear();
        self.casters_dim = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_rules() {
        // Exercised without a VM: the callback ignores it for primitives.
        // A null VM cannot be built here, so go through a real one.
        let mut vm = Vm::open(Default::default()).expect("vm");
        assert_eq!(
            cast_primitive(&mut vm, &Value::Nil, ClassId::REAL).unwrap(),
            Value::Real(0.0)
        );
        assert_eq!(
            cast_primitive(&mut vm, &Value::Real(2.7), ClassId::INTEGER).unwrap(),
            Value::Integer(2)
        );
        assert_eq!(
            cast_primitive(&mut vm, &Value::Real(-0.5), ClassId::INTEGER).unwrap(),
            Value::Integer(-1)
        );
        assert_eq!(
            cast_primitive(&mut vm, &Value::Integer(0), ClassId::BOOLEAN).unwrap(),
            Value::Boolean(false)
        );
    }
}
