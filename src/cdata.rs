//! Typed C data handles.
//!
//! A `CData` pairs a type-graph node with raw C storage. Handles are cheap
//! to clone; projections (field access, indexing, `addr`, pointer
//! arithmetic) return new handles that alias the parent's storage and keep
//! the parent alive through an origin reference, so an owning allocation can
//! never be freed while a borrowed view still exists.
//!
//! For *pointer-typed* data the handle's data pointer refers to an internal
//! one-word slot (`holder`) that in turn holds the pointee address; taking
//! the address of a pointer value therefore always yields a stable location.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::ffi::{CString, c_void};
use std::fmt;

use bitflags::bitflags;
use triomphe::Arc;
use ustr::Ustr;

use crate::error::{Error, Result};
use crate::marshal::{self, Value};
use crate::types::{self, CTypeKind, Type, TypeAttr, TypeRef};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CDataFlags: u8 {
        const CONST      = 1 << 0;
        /// The engine frees the storage when the last handle drops.
        const OWNED      = 1 << 1;
        /// Storage came from the long-lived allocator.
        const PERSISTENT = 1 << 2;
    }
}

pub(crate) struct CDataInner {
    ty: TypeRef,
    ptr: Cell<*mut u8>,
    holder: Cell<*mut c_void>,
    flags: Cell<CDataFlags>,
    /// Layout of the allocation backing `ptr`, when the engine made it.
    layout: Cell<Option<Layout>>,
    /// Keeps the aliased parent allocation alive.
    origin: Option<CData>,
    /// NUL-terminated buffers written into pointer slots reachable from
    /// this allocation.
    keepalive: RefCell<Vec<CString>>,
}

// The engine is single-threaded cooperative per host VM instance; handles
// that cross VM clones only ever reach frozen, read-only data.
unsafe impl Send for CDataInner {}
unsafe impl Sync for CDataInner {}

impl Drop for CDataInner {
    fn drop(&mut self) {
        if self.flags.get().contains(CDataFlags::OWNED) {
            let ptr = self.ptr.get();
            if !ptr.is_null() && ptr != self.holder.as_ptr() as *mut u8 {
                if let Some(layout) = self.layout.get() {
                    unsafe { alloc::dealloc(ptr, layout) };
                }
            }
        }
    }
}

/// Host-visible handle to a typed region of C memory.
#[derive(Clone)]
pub struct CData(pub(crate) Arc<CDataInner>);

impl fmt::Debug for CData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CData")
            .field("type", &types::display_name(&self.0.ty))
            .field("ptr", &self.0.ptr.get())
            .field("flags", &self.0.flags.get())
            .finish()
    }
}

impl CData {
    /// Allocates zeroed storage for `ty`. Fails with [`Error::ZeroSize`] for
    /// incomplete or empty types.
    pub fn alloc(ty: TypeRef, owned: bool, persistent: bool) -> Result<CData> {
        let size = ty.size();
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let layout = Layout::from_size_align(size, ty.align().max(1))
            .map_err(|_| Error::ZeroSize)?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "allocation failure");

        let mut flags = CDataFlags::empty();
        if owned {
            flags |= CDataFlags::OWNED;
        }
        if persistent {
            flags |= CDataFlags::PERSISTENT;
        }
        Ok(CData(Arc::new(CDataInner {
            ty,
            ptr: Cell::new(ptr),
            holder: Cell::new(std::ptr::null_mut()),
            flags: Cell::new(flags),
            layout: Cell::new(Some(layout)),
            origin: None,
            keepalive: RefCell::new(Vec::new()),
        })))
    }

    /// A borrowed view over storage owned by `origin` (or by foreign code
    /// when `origin` is `None`).
    pub(crate) fn from_raw_parts(
        ty: TypeRef,
        ptr: *mut u8,
        flags: CDataFlags,
        origin: Option<CData>,
    ) -> CData {
        CData(Arc::new(CDataInner {
            ty,
            ptr: Cell::new(ptr),
            holder: Cell::new(std::ptr::null_mut()),
            flags: Cell::new(flags),
            layout: Cell::new(None),
            origin,
            keepalive: RefCell::new(Vec::new()),
        }))
    }

    /// A pointer-typed value holding `addr` in its own slot.
    pub(crate) fn pointer_value(
        ty: TypeRef,
        addr: *mut c_void,
        flags: CDataFlags,
        origin: Option<CData>,
    ) -> CData {
        debug_assert!(ty.is_pointer());
        let cd = CData(Arc::new(CDataInner {
            ty,
            ptr: Cell::new(std::ptr::null_mut()),
            holder: Cell::new(addr),
            flags: Cell::new(flags),
            layout: Cell::new(None),
            origin,
            keepalive: RefCell::new(Vec::new()),
        }));
        cd.0.ptr.set(cd.0.holder.as_ptr() as *mut u8);
        cd
    }

    pub fn ty(&self) -> TypeRef {
        self.0.ty.clone()
    }

    pub fn flags(&self) -> CDataFlags {
        self.0.flags.get()
    }

    pub(crate) fn set_flags(&self, flags: CDataFlags) {
        self.0.flags.set(flags);
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.0.ptr.get()
    }

    pub(crate) fn is_slot_backed(&self) -> bool {
        self.0.ptr.get() == self.0.holder.as_ptr() as *mut u8
    }

    pub(crate) fn ensure_live(&self) -> Result<*mut u8> {
        let ptr = self.0.ptr.get();
        if ptr.is_null() {
            Err(Error::UseAfterFree)
        } else {
            Ok(ptr)
        }
    }

    /// Address stored in a pointer-typed value.
    pub(crate) fn pointee_addr(&self) -> Result<*mut u8> {
        let ptr = self.ensure_live()?;
        Ok(unsafe { *(ptr as *mut *mut u8) })
    }

    /// Attaches a C string buffer to the allocation root so that addresses
    /// written into pointer slots stay valid.
    pub(crate) fn keep_cstring(&self, s: CString) {
        let mut cur = self;
        while let Some(origin) = &cur.0.origin {
            cur = origin;
        }
        cur.0.keepalive.borrow_mut().push(s);
    }

    pub fn is_null(&self) -> Result<bool> {
        if !self.0.ty.is_pointer() {
            return Err(Error::NotAPointer);
        }
        Ok(self.pointee_addr()?.is_null())
    }

    // ─── Field access ───────────────────────────────────────────────────────

    fn record_base(&self) -> Result<(TypeRef, *mut u8)> {
        let mut ty = self.ty();
        let mut ptr = self.ensure_live()?;
        if !ty.is_record() {
            if ty.is_pointer() {
                ptr = unsafe { *(ptr as *mut *mut u8) };
                if ptr.is_null() {
                    return Err(Error::NullDeref);
                }
                ty = ty.pointer_target().unwrap();
            }
            if !ty.is_record() {
                return Err(Error::NotAStruct(types::display_name(&self.ty())));
            }
        }
        Ok((ty, ptr))
    }

    /// Reads a struct/union field. A pointer to a struct is dereferenced
    /// once, transparently.
    pub fn read_field(&self, name: &str) -> Result<Value> {
        let (ty, ptr) = self.record_base()?;
        let field = ty
            .field(Ustr::from(name))
            .ok_or_else(|| Error::UndefinedField(name.to_string()))?;
        if field.bits != 0 {
            // `first_bit` counts from the field's byte offset.
            let fptr = unsafe { ptr.add(field.offset) };
            return Ok(marshal::read_bit_field(fptr, &field));
        }
        let mut flags = self.flags() & CDataFlags::CONST;
        if field.is_const {
            flags |= CDataFlags::CONST;
        }
        let fptr = unsafe { ptr.add(field.offset) };
        marshal::read_value(fptr, &field.ty, flags, Some(self))
    }

    pub fn write_field(&self, name: &str, value: &Value) -> Result<()> {
        let (ty, ptr) = self.record_base()?;
        let field = ty
            .field(Ustr::from(name))
            .ok_or_else(|| Error::UndefinedField(name.to_string()))?;
        if self.flags().contains(CDataFlags::CONST) || field.is_const {
            return Err(Error::AssignToConst);
        }
        let fptr = unsafe { ptr.add(field.offset) };
        if field.bits != 0 {
            return marshal::write_bit_field(fptr, &field, value);
        }
        marshal::write_value(fptr, &field.ty, value, Some(self))
    }

    // ─── Indexing ───────────────────────────────────────────────────────────

    fn element_base(&self, index: i64) -> Result<(TypeRef, *mut u8, CDataFlags)> {
        let ty = self.ty();
        let flags = (self.flags() & CDataFlags::CONST)
            | if ty.attr().contains(TypeAttr::CONST) {
                CDataFlags::CONST
            } else {
                CDataFlags::empty()
            };
        match ty.kind_id() {
            CTypeKind::Array => {
                let length = ty.array_length().unwrap();
                if (index as u64) >= length as u64 && (index < 0 || length != 0) {
                    return Err(Error::OutOfBounds);
                }
                let elem = ty.array_elem().unwrap();
                let ptr = unsafe {
                    self.ensure_live()?
                        .offset(index as isize * elem.size() as isize)
                };
                Ok((elem, ptr, flags))
            }
            CTypeKind::Pointer => {
                let base = self.pointee_addr()?;
                if base.is_null() {
                    return Err(Error::NullDeref);
                }
                let elem = ty.pointer_target().unwrap();
                let ptr = unsafe { base.offset(index as isize * elem.size() as isize) };
                Ok((elem, ptr, flags))
            }
            _ => Err(Error::NotAnArray),
        }
    }

    pub fn read_index(&self, index: i64) -> Result<Value> {
        let (elem, ptr, flags) = self.element_base(index)?;
        marshal::read_value(ptr, &elem, flags, Some(self))
    }

    pub fn write_index(&self, index: i64, value: &Value) -> Result<()> {
        let (elem, ptr, flags) = self.element_base(index)?;
        if flags.contains(CDataFlags::CONST) {
            return Err(Error::AssignToConst);
        }
        marshal::write_value(ptr, &elem, value, Some(self))
    }

    // ─── Pointer arithmetic ─────────────────────────────────────────────────

    /// `self + offset` elements. Valid on pointer and array data; an array
    /// base decays into a fresh pointer value.
    pub fn add(&self, offset: i64) -> Result<CData> {
        let ty = self.ty();
        match ty.kind_id() {
            CTypeKind::Pointer => {
                let elem = ty.pointer_target().unwrap();
                let base = self.pointee_addr()?;
                let addr = unsafe { base.offset(offset as isize * elem.size() as isize) };
                Ok(CData::pointer_value(
                    ty,
                    addr as *mut c_void,
                    self.flags() & CDataFlags::CONST,
                    Some(self.clone()),
                ))
            }
            CTypeKind::Array => {
                let elem = ty.array_elem().unwrap();
                let addr = unsafe {
                    self.ensure_live()?
                        .offset(offset as isize * elem.size() as isize)
                };
                Ok(CData::pointer_value(
                    Type::pointer(elem),
                    addr as *mut c_void,
                    self.flags() & CDataFlags::CONST,
                    Some(self.clone()),
                ))
            }
            _ => Err(Error::NotAPointer),
        }
    }

    pub fn sub(&self, offset: i64) -> Result<CData> {
        self.add(offset.wrapping_neg())
    }

    /// Pointer difference in elements. Both sides must be pointer or array
    /// data over the same element type.
    pub fn diff(&self, other: &CData) -> Result<i64> {
        fn base_of(cd: &CData) -> Result<Option<(TypeRef, *mut u8)>> {
            let ty = cd.ty();
            Ok(match ty.kind_id() {
                CTypeKind::Pointer => {
                    Some((ty.pointer_target().unwrap(), cd.pointee_addr()?))
                }
                CTypeKind::Array => Some((ty.array_elem().unwrap(), cd.ensure_live()?)),
                _ => None,
            })
        }
        match (base_of(self)?, base_of(other)?) {
            (Some((t1, p1)), Some((t2, p2))) if types::is_same(&t1, &t2) => {
                let diff = (p1 as isize) - (p2 as isize);
                Ok((diff / t1.size() as isize) as i64)
            }
            _ => Err(Error::CompareIncompatible),
        }
    }

    /// Compares two pointer values by address.
    pub fn compare(&self, other: &CData) -> Result<Ordering> {
        if self.0.ty.is_pointer() && other.0.ty.is_pointer() {
            let p1 = self.pointee_addr()?;
            let p2 = other.pointee_addr()?;
            if p1.is_null() || p2.is_null() {
                return Err(Error::NullDeref);
            }
            Ok(p1.cmp(&p2))
        } else {
            Err(Error::CompareIncompatible)
        }
    }

    // ─── Casting ────────────────────────────────────────────────────────────

    /// `cast(type, value)`. Storage is aliased where the rules allow it;
    /// constness carries across and ownership transfers when the source
    /// handle is the last one.
    pub fn cast(ty: TypeRef, is_const: bool, value: &Value) -> Result<CData> {
        let const_flag = if is_const {
            CDataFlags::CONST
        } else {
            CDataFlags::empty()
        };
        match value {
            Value::CData(old) => Self::cast_cdata(ty, const_flag, old),
            Value::Null if ty.is_pointer() => Ok(CData::pointer_value(
                ty,
                std::ptr::null_mut(),
                const_flag,
                None,
            )),
            Value::Int(v) if ty.is_pointer() => Ok(CData::pointer_value(
                ty,
                *v as usize as *mut c_void,
                const_flag,
                None,
            )),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::Str(_)
                if ty.is_scalar() =>
            {
                let cd = CData::alloc(ty.clone(), true, false)?;
                marshal::write_value(cd.data_ptr(), &ty, value, Some(&cd))?;
                cd.set_flags(cd.flags() | const_flag);
                Ok(cd)
            }
            _ => Err(Error::IncompatibleAssignment {
                dst: types::display_name(&ty),
                src: value.kind_name().to_string(),
            }),
        }
    }

    fn cast_cdata(ty: TypeRef, const_flag: CDataFlags, old: &CData) -> Result<CData> {
        let old_ty = old.ty();
        let ptr = old.ensure_live()?;

        let cd = if old_ty.is_pointer()
            && !ty.is_pointer()
            && old_ty.pointer_target().unwrap().kind_id() == CTypeKind::Void
        {
            // void* source: adopt the pointee.
            let target = unsafe { *(ptr as *mut *mut u8) };
            CData::from_raw_parts(ty, target, const_flag, Some(old.clone()))
        } else if old_ty.is_array()
            && ty.is_pointer()
            && types::is_compatible(
                &old_ty.array_elem().unwrap(),
                &ty.pointer_target().unwrap(),
            )
        {
            CData::pointer_value(ty, ptr as *mut c_void, const_flag, Some(old.clone()))
        } else if old_ty.is_pointer()
            && ty.is_array()
            && types::is_compatible(
                &old_ty.pointer_target().unwrap(),
                &ty.array_elem().unwrap(),
            )
        {
            let target = unsafe { *(ptr as *mut *mut u8) };
            CData::from_raw_parts(ty, target, const_flag, Some(old.clone()))
        } else if ty.size() > old_ty.size() {
            return Err(Error::IncompatibleAssignment {
                dst: types::display_name(&ty),
                src: types::display_name(&old_ty),
            });
        } else if !old.is_slot_backed() {
            CData::from_raw_parts(ty, ptr, const_flag, Some(old.clone()))
        } else {
            CData::pointer_value(ty, old.0.holder.get(), const_flag, Some(old.clone()))
        };

        if old.flags().contains(CDataFlags::CONST) {
            cd.set_flags(cd.flags() | CDataFlags::CONST);
        }
        if old.flags().contains(CDataFlags::OWNED) && Arc::is_unique(&old.0) {
            // Sole remaining handle: hand the allocation over.
            old.set_flags(old.flags() & !CDataFlags::OWNED);
            cd.set_flags(cd.flags() | CDataFlags::OWNED);
            cd.0.layout.set(old.0.layout.get());
        }
        Ok(cd)
    }

    /// `&self`: a pointer value whose slot holds this data's address.
    pub fn addr(&self) -> Result<CData> {
        let ptr = self.ensure_live()?;
        let cd = CData::pointer_value(
            Type::pointer(self.ty()),
            ptr as *mut c_void,
            CDataFlags::empty(),
            Some(self.clone()),
        );
        if self.flags().contains(CDataFlags::OWNED) && Arc::is_unique(&self.0) {
            self.set_flags(self.flags() & !CDataFlags::OWNED);
            cd.set_flags(cd.flags() | CDataFlags::OWNED);
            cd.0.layout.set(self.0.layout.get());
        }
        Ok(cd)
    }

    /// Releases storage early. Pointer data frees the pointee and nulls the
    /// slot; non-owned data frees its storage and becomes unusable; owned
    /// data refuses (it frees itself when the last handle drops).
    pub fn free(&self) -> Result<()> {
        let ty = self.ty();
        if ty.is_pointer() {
            let pointee = self.pointee_addr()?;
            if pointee.is_null() {
                return Err(Error::NullDeref);
            }
            let target = ty.pointer_target().unwrap();
            // Caller's contract: the pointee must have been allocated with
            // the target type's layout.
            if let Ok(layout) = Layout::from_size_align(target.size().max(1), target.align().max(1))
            {
                unsafe { alloc::dealloc(pointee, layout) };
            }
            unsafe { *(self.data_ptr() as *mut *mut u8) = std::ptr::null_mut() };
            Ok(())
        } else if !self.flags().contains(CDataFlags::OWNED) {
            let ptr = self.ensure_live()?;
            let layout = self.0.layout.get().unwrap_or(
                Layout::from_size_align(ty.size().max(1), ty.align().max(1)).unwrap(),
            );
            unsafe { alloc::dealloc(ptr, layout) };
            self.0.ptr.set(std::ptr::null_mut());
            self.0
                .flags
                .set(self.flags() & !(CDataFlags::OWNED | CDataFlags::PERSISTENT));
            Ok(())
        } else {
            Err(Error::FreeOwned)
        }
    }

    // ─── Iteration ──────────────────────────────────────────────────────────

    /// Number of elements of an array value.
    pub fn len(&self) -> Result<usize> {
        self.ty().array_length().ok_or(Error::NotAnArray)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Iterates over an array's elements in order, yielding borrowed values
    /// that observe this handle's CONST flag.
    pub fn iter(&self) -> Result<CDataIter> {
        let len = self.len()?;
        Ok(CDataIter {
            parent: self.clone(),
            index: 0,
            len,
        })
    }
}

pub struct CDataIter {
    parent: CData,
    index: usize,
    len: usize,
}

impl Iterator for CDataIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.len {
            return None;
        }
        let item = self.parent.read_index(self.index as i64);
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.len - self.index;
        (rest, Some(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntKind;

    #[test]
    fn zero_size_allocation_fails() {
        let incomplete = Type::new(
            crate::types::TypeKind::Record {
                tag: None,
                fields: Vec::new(),
            },
            0,
            1,
            TypeAttr::INCOMPLETE_TAG,
        );
        assert!(matches!(
            CData::alloc(incomplete, true, false),
            Err(Error::ZeroSize)
        ));
    }

    #[test]
    fn array_bounds_are_checked() {
        let arr = Type::array(Type::int(IntKind::S32), 4);
        let cd = CData::alloc(arr, true, false).unwrap();
        assert!(cd.read_index(3).is_ok());
        assert!(matches!(cd.read_index(4), Err(Error::OutOfBounds)));
        assert!(matches!(cd.read_index(-1), Err(Error::OutOfBounds)));
    }

    #[test]
    fn pointer_arithmetic_round_trips() {
        let arr = Type::array(Type::int(IntKind::S32), 4);
        let cd = CData::alloc(arr, true, false).unwrap();
        let p = cd.add(0).unwrap();
        let p2 = p.add(2).unwrap();
        assert_eq!(p2.diff(&p).unwrap(), 2);
        assert_eq!(
            p2.pointee_addr().unwrap() as usize,
            p.pointee_addr().unwrap() as usize + 2 * size_of::<i32>()
        );
    }

    #[test]
    fn iteration_yields_all_elements() {
        let arr = Type::array(Type::int(IntKind::S32), 3);
        let cd = CData::alloc(arr, true, false).unwrap();
        for i in 0..3 {
            cd.write_index(i, &Value::Int(i * 10)).unwrap();
        }
        let got: Vec<i64> = cd
            .iter()
            .unwrap()
            .map(|v| match v.unwrap() {
                Value::Int(n) => n,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(got, vec![0, 10, 20]);
    }

    #[test]
    fn freeing_owned_data_is_refused() {
        let cd = CData::alloc(Type::int(IntKind::S32), true, false).unwrap();
        assert!(matches!(cd.free(), Err(Error::FreeOwned)));
    }
}
