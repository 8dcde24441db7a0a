//! Conversion between host values and raw C storage.
//!
//! Reads dispatch on the type kind: scalars become host scalars, enums read
//! as their underlying integer kind, a null pointer reads as `Null`, a
//! `const char*` reads as a host string, any other pointer becomes a fresh
//! pointer `CData`, and aggregates read as borrowed `CData` views. Writes
//! perform the inverse with compatibility checks.

use std::ffi::{CStr, CString, c_void};

use crate::cdata::{CData, CDataFlags};
use crate::error::{Error, Result};
use crate::types::{self, CTypeKind, Field, IntKind, TypeAttr, TypeRef};

/// The engine's host-value bridge. The embedding VM converts its own values
/// to and from this enum at the boundary.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    CData(CData),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::CData(_) => "cdata",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(d) => Some(*d as i64),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(d) => Some(*d),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(d) => *d != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::CData(_) => true,
        }
    }
}

fn incompatible(ty: &TypeRef, value: &Value) -> Error {
    Error::IncompatibleAssignment {
        dst: types::display_name(ty),
        src: value.kind_name().to_string(),
    }
}

pub(crate) fn int_kind_as_ctype(kind: IntKind) -> CTypeKind {
    match kind {
        IntKind::U8 => CTypeKind::Uint8,
        IntKind::S8 => CTypeKind::Sint8,
        IntKind::U16 => CTypeKind::Uint16,
        IntKind::S16 => CTypeKind::Sint16,
        IntKind::U32 => CTypeKind::Uint32,
        IntKind::S32 => CTypeKind::Sint32,
        IntKind::U64 => CTypeKind::Uint64,
        IntKind::S64 => CTypeKind::Sint64,
    }
}

/// Reads typed storage into a host value. `origin` keeps the aliased
/// allocation alive for borrowed results.
pub fn read_value(
    ptr: *const u8,
    ty: &TypeRef,
    flags: CDataFlags,
    origin: Option<&CData>,
) -> Result<Value> {
    let mut kind = ty.kind_id();
    if kind == CTypeKind::Enum {
        kind = int_kind_as_ctype(ty.enum_kind().unwrap());
    }
    unsafe {
        Ok(match kind {
            CTypeKind::Float => Value::Float((ptr as *const f32).read_unaligned() as f64),
            CTypeKind::Double | CTypeKind::LongDouble => {
                Value::Float((ptr as *const f64).read_unaligned())
            }
            CTypeKind::Uint8 => Value::Int(*ptr as i64),
            CTypeKind::Sint8 => Value::Int(*(ptr as *const i8) as i64),
            CTypeKind::Uint16 => Value::Int((ptr as *const u16).read_unaligned() as i64),
            CTypeKind::Sint16 => Value::Int((ptr as *const i16).read_unaligned() as i64),
            CTypeKind::Uint32 => Value::Int((ptr as *const u32).read_unaligned() as i64),
            CTypeKind::Sint32 => Value::Int((ptr as *const i32).read_unaligned() as i64),
            CTypeKind::Uint64 => Value::Int((ptr as *const u64).read_unaligned() as i64),
            CTypeKind::Sint64 => Value::Int((ptr as *const i64).read_unaligned()),
            CTypeKind::Bool => Value::Bool(*ptr != 0),
            CTypeKind::Char => {
                Value::Str(String::from_utf8_lossy(&[*ptr]).into_owned())
            }
            CTypeKind::Pointer => {
                let addr = (ptr as *const *mut u8).read_unaligned();
                if addr.is_null() {
                    return Ok(Value::Null);
                }
                let target = ty.pointer_target().unwrap();
                if ty.attr().contains(TypeAttr::CONST) && target.kind_id() == CTypeKind::Char {
                    // A const char* binds a host string.
                    let s = CStr::from_ptr(addr as *const _).to_string_lossy().into_owned();
                    return Ok(Value::Str(s));
                }
                Value::CData(CData::pointer_value(
                    ty.clone(),
                    addr as *mut c_void,
                    flags,
                    origin.cloned(),
                ))
            }
            _ => Value::CData(CData::from_raw_parts(
                ty.clone(),
                ptr as *mut u8,
                flags,
                origin.cloned(),
            )),
        })
    }
}

/// Unmarshals a native call's return slot: a returned struct is copied into
/// a fresh owned allocation, a returned pointer adopts the address into its
/// own slot.
pub(crate) fn read_return(ptr: *const u8, ty: &TypeRef) -> Result<Value> {
    match ty.kind_id() {
        CTypeKind::Void => Ok(Value::Null),
        CTypeKind::Struct => {
            let cd = CData::alloc(ty.clone(), true, false)?;
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, cd.data_ptr(), ty.size());
            }
            Ok(Value::CData(cd))
        }
        _ => read_value(ptr, ty, CDataFlags::empty(), None),
    }
}

/// Writes a host value into typed storage. `root` is the data handle whose
/// allocation must keep engine-created C string buffers alive.
pub fn write_value(
    ptr: *mut u8,
    ty: &TypeRef,
    value: &Value,
    root: Option<&CData>,
) -> Result<()> {
    let mut kind = ty.kind_id();
    if kind == CTypeKind::Enum {
        kind = int_kind_as_ctype(ty.enum_kind().unwrap());
    }
    unsafe {
        match kind {
            CTypeKind::Float => {
                let d = value.as_float().ok_or_else(|| incompatible(ty, value))?;
                (ptr as *mut f32).write_unaligned(d as f32);
            }
            CTypeKind::Double | CTypeKind::LongDouble => {
                let d = value.as_float().ok_or_else(|| incompatible(ty, value))?;
                (ptr as *mut f64).write_unaligned(d);
            }
            CTypeKind::Uint8 | CTypeKind::Sint8 => {
                let v = value.as_int().ok_or_else(|| incompatible(ty, value))?;
                *ptr = v as u8;
            }
            CTypeKind::Uint16 | CTypeKind::Sint16 => {
                let v = value.as_int().ok_or_else(|| incompatible(ty, value))?;
                (ptr as *mut u16).write_unaligned(v as u16);
            }
            CTypeKind::Uint32 | CTypeKind::Sint32 => {
                let v = value.as_int().ok_or_else(|| incompatible(ty, value))?;
                (ptr as *mut u32).write_unaligned(v as u32);
            }
            CTypeKind::Uint64 | CTypeKind::Sint64 => {
                let v = value.as_int().ok_or_else(|| incompatible(ty, value))?;
                (ptr as *mut u64).write_unaligned(v as u64);
            }
            CTypeKind::Bool => {
                *ptr = value.is_truthy() as u8;
            }
            CTypeKind::Char => match value {
                Value::Str(s) if s.len() == 1 => {
                    *ptr = s.as_bytes()[0];
                }
                _ => return Err(incompatible(ty, value)),
            },
            CTypeKind::Pointer => return write_pointer(ptr, ty, value, root),
            _ => match value {
                Value::CData(cd) => {
                    let src = cd.ty();
                    if types::is_compatible(ty, &src) && ty.size() == src.size() {
                        std::ptr::copy_nonoverlapping(
                            cd.ensure_live()?,
                            ptr,
                            ty.size(),
                        );
                    } else {
                        return Err(incompatible(ty, value));
                    }
                }
                _ => return Err(incompatible(ty, value)),
            },
        }
    }
    Ok(())
}

fn write_pointer(ptr: *mut u8, ty: &TypeRef, value: &Value, root: Option<&CData>) -> Result<()> {
    let slot = ptr as *mut *mut c_void;
    match value {
        Value::Null => unsafe {
            slot.write_unaligned(std::ptr::null_mut());
            Ok(())
        },
        Value::Str(s) => {
            let target = ty.pointer_target().unwrap();
            if !matches!(target.kind_id(), CTypeKind::Char | CTypeKind::Void) {
                return Err(incompatible(ty, value));
            }
            // No allocation to pin the buffer to; refuse rather than leave
            // a dangling address behind.
            let Some(root) = root else {
                return Err(incompatible(ty, value));
            };
            let c = CString::new(s.as_str()).map_err(|_| incompatible(ty, value))?;
            unsafe { slot.write_unaligned(c.as_ptr() as *mut c_void) };
            root.keep_cstring(c);
            Ok(())
        }
        Value::CData(cd) => {
            let src = cd.ty();
            if types::is_compatible(ty, &src) {
                if src.is_pointer() {
                    unsafe { slot.write_unaligned(cd.pointee_addr()? as *mut c_void) };
                } else {
                    if cd.flags().contains(CDataFlags::OWNED) {
                        return Err(Error::AssignOwnedPointer);
                    }
                    unsafe { slot.write_unaligned(cd.ensure_live()? as *mut c_void) };
                }
                Ok(())
            } else if !src.is_pointer()
                && types::is_compatible(&ty.pointer_target().unwrap(), &src)
            {
                // Transparent address-of for non-owned data.
                if cd.flags().contains(CDataFlags::OWNED) {
                    return Err(Error::AssignOwnedPointer);
                }
                unsafe { slot.write_unaligned(cd.ensure_live()? as *mut c_void) };
                Ok(())
            } else {
                Err(incompatible(ty, value))
            }
        }
        _ => Err(incompatible(ty, value)),
    }
}

// ─── Bit fields ─────────────────────────────────────────────────────────────

/// Assembles a bit-field little-endian within each byte, sign-extending when
/// the base type is signed.
pub(crate) fn read_bit_field(ptr: *const u8, field: &Field) -> Value {
    let bit = field.first_bit as usize;
    let bits = field.bits as usize;
    let last_bit = bit + bits - 1;
    let pos = bit % 8;
    let mut val: u64;

    unsafe {
        let mut p = ptr.add(bit / 8);
        let last_p = ptr.add(last_bit / 8);
        if p == last_p {
            let mask = (1u64 << bits) - 1;
            val = ((*p >> pos) as u64) & mask;
        } else {
            let mut insert_pos = 0usize;
            val = 0;
            if pos != 0 {
                let num_bits = 8 - pos;
                val = ((*p >> pos) as u64) & ((1u64 << num_bits) - 1);
                p = p.add(1);
                insert_pos += num_bits;
            }
            while p < last_p {
                val |= (*p as u64) << insert_pos;
                insert_pos += 8;
                p = p.add(1);
            }
            let num_bits = last_bit % 8 + 1;
            let mask = (1u64 << num_bits) - 1;
            val |= ((*p as u64) & mask) << insert_pos;
        }
    }

    if field.ty.is_signed_integer() && bits < 64 {
        let shift = 64 - bits;
        val = (((val << shift) as i64) >> shift) as u64;
    }
    Value::Int(val as i64)
}

/// Writes a bit-field, preserving the bits outside the span.
pub(crate) fn write_bit_field(ptr: *mut u8, field: &Field, value: &Value) -> Result<()> {
    let mut val = value
        .as_int()
        .ok_or_else(|| incompatible(&field.ty, value))? as u64;
    let bit = field.first_bit as usize;
    let bits = field.bits as usize;
    let last_bit = bit + bits - 1;
    let pos = bit % 8;

    unsafe {
        let mut p = ptr.add(bit / 8);
        let last_p = ptr.add(last_bit / 8);
        if p == last_p {
            let mask = (((1u64 << bits) - 1) << pos) as u8;
            *p = (*p & !mask) | (((val << pos) as u8) & mask);
            return Ok(());
        }
        if pos != 0 {
            let num_bits = 8 - pos;
            let mask = (((1u64 << num_bits) - 1) << pos) as u8;
            *p = (*p & !mask) | (((val << pos) as u8) & mask);
            p = p.add(1);
            val >>= num_bits;
        }
        while p < last_p {
            *p = val as u8;
            val >>= 8;
            p = p.add(1);
        }
        let num_bits = last_bit % 8 + 1;
        let mask = ((1u64 << num_bits) - 1) as u8;
        *p = (*p & !mask) | ((val as u8) & mask);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntKind, Type};

    fn scalar_roundtrip(ty: TypeRef, value: Value) -> Value {
        let cd = CData::alloc(ty.clone(), true, false).unwrap();
        write_value(cd.data_ptr(), &ty, &value, Some(&cd)).unwrap();
        read_value(cd.data_ptr(), &ty, CDataFlags::empty(), Some(&cd)).unwrap()
    }

    #[test]
    fn scalar_roundtrips() {
        assert!(matches!(
            scalar_roundtrip(Type::int(IntKind::S32), Value::Int(-7)),
            Value::Int(-7)
        ));
        assert!(matches!(
            scalar_roundtrip(Type::int(IntKind::U8), Value::Int(255)),
            Value::Int(255)
        ));
        assert!(matches!(
            scalar_roundtrip(Type::double(), Value::Float(1.5)),
            Value::Float(d) if d == 1.5
        ));
        assert!(matches!(
            scalar_roundtrip(Type::bool_type(), Value::Bool(true)),
            Value::Bool(true)
        ));
        assert!(matches!(
            scalar_roundtrip(Type::char_type(), Value::Str("x".into())),
            Value::Str(s) if s == "x"
        ));
    }

    #[test]
    fn char_rejects_multibyte_strings() {
        let ty = Type::char_type();
        let cd = CData::alloc(ty.clone(), true, false).unwrap();
        assert!(write_value(cd.data_ptr(), &ty, &Value::Str("ab".into()), Some(&cd)).is_err());
    }

    #[test]
    fn null_pointer_reads_as_null() {
        let ty = Type::pointer(Type::int(IntKind::S32));
        let cd = CData::alloc(ty.clone(), true, false).unwrap();
        assert!(matches!(
            read_value(cd.data_ptr(), &ty, CDataFlags::empty(), Some(&cd)).unwrap(),
            Value::Null
        ));
    }

    #[test]
    fn owned_data_cannot_seed_a_pointer() {
        let int_ty = Type::int(IntKind::S32);
        let owned = CData::alloc(int_ty.clone(), true, false).unwrap();
        let ptr_ty = Type::pointer(int_ty);
        let slot = CData::alloc(ptr_ty.clone(), true, false).unwrap();
        assert!(matches!(
            write_value(
                slot.data_ptr(),
                &ptr_ty,
                &Value::CData(owned),
                Some(&slot)
            ),
            Err(Error::AssignOwnedPointer)
        ));
    }

    #[test]
    fn bit_field_span_preserves_neighbors() {
        // Two bytes of storage, a 5-bit field starting at bit 6.
        let buf = [0xffu8, 0x00u8];
        let cd = CData::alloc(Type::array(Type::int(IntKind::U8), 2), true, false).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), cd.data_ptr(), 2) };
        let field = Field {
            name: None,
            ty: Type::int(IntKind::U16),
            offset: 0,
            is_const: false,
            is_nested: false,
            first_bit: 6,
            bits: 5,
        };
        write_bit_field(cd.data_ptr(), &field, &Value::Int(0b10101)).unwrap();
        let got = read_bit_field(cd.data_ptr(), &field);
        assert!(matches!(got, Value::Int(0b10101)));
        // Bits below the span stayed set.
        assert_eq!(unsafe { *cd.data_ptr() } & 0b0011_1111, 0b0011_1111);
    }
}
