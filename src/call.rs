//! The call trampoline.
//!
//! Given a function type, a resolved native address and the actual host
//! arguments, this module marshals every argument into an ABI-wide slot,
//! prepares a libffi call interface, invokes the function and unmarshals
//! the return slot. Struct-by-value parameters travel behind synthesized
//! `ffi_type` descriptors whose element lists flatten the record's fields
//! into primitive entries (a union contributes only its first field).

use std::ffi::{CString, c_void};
use std::ptr;

use libffi::low::{
    ffi_abi_FFI_DEFAULT_ABI, ffi_arg, ffi_cif, ffi_type, prep_cif, prep_cif_var, type_tag, types,
};
use libffi::raw;

use crate::error::{Error, Result};
use crate::marshal::{self, Value};
use crate::types::{CTypeKind, TypeAttr, TypeRef};
use crate::val::long_is_32bit;

/// Every argument slot is at least as wide as a pointer and a double.
pub(crate) const SLOT_SIZE: usize = if size_of::<*const c_void>() > size_of::<f64>() {
    size_of::<*const c_void>()
} else {
    size_of::<f64>()
};

/// A synthesized struct descriptor; owns the element list the `ffi_type`
/// points into, so dropping it after the call releases everything.
struct FakeStruct {
    ty: Box<ffi_type>,
    _elements: Box<[*mut ffi_type]>,
}

enum ArgType {
    Static(*mut ffi_type),
    Record(FakeStruct),
}

impl ArgType {
    fn as_ptr(&mut self) -> *mut ffi_type {
        match self {
            ArgType::Static(p) => *p,
            ArgType::Record(fs) => &mut *fs.ty as *mut ffi_type,
        }
    }
}

fn static_type(kind: CTypeKind) -> Option<*mut ffi_type> {
    // SAFETY: addresses of libffi's static type descriptors; never written.
    unsafe {
        Some(match kind {
            CTypeKind::Void => ptr::addr_of_mut!(types::void),
            CTypeKind::Float => ptr::addr_of_mut!(types::float),
            CTypeKind::Double | CTypeKind::LongDouble => ptr::addr_of_mut!(types::double),
            CTypeKind::Uint8 | CTypeKind::Bool => ptr::addr_of_mut!(types::uint8),
            CTypeKind::Sint8 | CTypeKind::Char => ptr::addr_of_mut!(types::sint8),
            CTypeKind::Uint16 => ptr::addr_of_mut!(types::uint16),
            CTypeKind::Sint16 => ptr::addr_of_mut!(types::sint16),
            CTypeKind::Uint32 => ptr::addr_of_mut!(types::uint32),
            CTypeKind::Sint32 => ptr::addr_of_mut!(types::sint32),
            CTypeKind::Uint64 => ptr::addr_of_mut!(types::uint64),
            CTypeKind::Sint64 => ptr::addr_of_mut!(types::sint64),
            CTypeKind::Pointer => ptr::addr_of_mut!(types::pointer),
            _ => return None,
        })
    }
}

fn push_record_elements(ty: &TypeRef, out: &mut Vec<*mut ffi_type>) {
    let is_union = ty.attr().contains(TypeAttr::UNION);
    for field in ty.fields() {
        let kind = match field.ty.kind_id() {
            CTypeKind::Enum => marshal::int_kind_as_ctype(field.ty.enum_kind().unwrap()),
            k => k,
        };
        match kind {
            CTypeKind::Struct => push_record_elements(&field.ty, out),
            k => match static_type(k) {
                Some(p) => out.push(p),
                // No primitive mapping (e.g. an array field); libffi sees a
                // placeholder, the preset size keeps the layout right.
                None => out.push(static_type(CTypeKind::Void).unwrap()),
            },
        }
        if is_union {
            // Only the first field describes a union.
            break;
        }
    }
}

fn synthesize_record(ty: &TypeRef) -> FakeStruct {
    let mut elems = Vec::new();
    push_record_elements(ty, &mut elems);
    elems.push(ptr::null_mut());
    let mut elements = elems.into_boxed_slice();
    let ffi = Box::new(ffi_type {
        size: ty.size(),
        alignment: ty.align() as u16,
        type_: type_tag::STRUCT,
        elements: elements.as_mut_ptr(),
    });
    FakeStruct {
        ty: ffi,
        _elements: elements,
    }
}

fn ffi_type_for(ty: &TypeRef) -> Option<ArgType> {
    let kind = match ty.kind_id() {
        CTypeKind::Enum => marshal::int_kind_as_ctype(ty.enum_kind().unwrap()),
        k => k,
    };
    match kind {
        CTypeKind::Struct => Some(ArgType::Record(synthesize_record(ty))),
        k => static_type(k).map(ArgType::Static),
    }
}

fn pass_incompatible(n: usize, ty: &TypeRef, value: &Value) -> Error {
    Error::IncompatiblePass {
        index: n + 1,
        expected: crate::types::display_name(ty),
        actual: value.kind_name().to_string(),
    }
}

/// Marshals one declared argument into its slot. Returns the libffi type
/// and the value pointer handed to `ffi_call` (for struct-by-value the
/// value pointer is the data's own storage, not the slot).
fn pass_arg(
    value: &Value,
    ty: &TypeRef,
    slot: *mut u8,
    n: usize,
    strings: &mut Vec<CString>,
) -> Result<(ArgType, *mut c_void)> {
    let kind = match ty.kind_id() {
        CTypeKind::Enum => marshal::int_kind_as_ctype(ty.enum_kind().unwrap()),
        k => k,
    };
    let slot_value = slot as *mut c_void;
    unsafe {
        match kind {
            CTypeKind::Float => {
                let d = value.as_float().ok_or_else(|| pass_incompatible(n, ty, value))?;
                (slot as *mut f32).write(d as f32);
            }
            CTypeKind::Double | CTypeKind::LongDouble => {
                let d = value.as_float().ok_or_else(|| pass_incompatible(n, ty, value))?;
                (slot as *mut f64).write(d);
            }
            CTypeKind::Uint8 | CTypeKind::Sint8 => {
                let v = value.as_int().ok_or_else(|| pass_incompatible(n, ty, value))?;
                *slot = v as u8;
            }
            CTypeKind::Uint16 | CTypeKind::Sint16 => {
                let v = value.as_int().ok_or_else(|| pass_incompatible(n, ty, value))?;
                (slot as *mut u16).write(v as u16);
            }
            CTypeKind::Uint32 | CTypeKind::Sint32 => {
                let v = value.as_int().ok_or_else(|| pass_incompatible(n, ty, value))?;
                (slot as *mut u32).write(v as u32);
            }
            CTypeKind::Uint64 | CTypeKind::Sint64 => {
                let v = value.as_int().ok_or_else(|| pass_incompatible(n, ty, value))?;
                (slot as *mut u64).write(v as u64);
            }
            CTypeKind::Bool => {
                *slot = value.is_truthy() as u8;
            }
            CTypeKind::Char => match value {
                Value::Str(s) if s.len() == 1 => *slot = s.as_bytes()[0],
                _ => return Err(pass_incompatible(n, ty, value)),
            },
            CTypeKind::Pointer => {
                let target = ty.pointer_target().unwrap();
                match value {
                    Value::Null => (slot as *mut *mut c_void).write(ptr::null_mut()),
                    Value::Str(s)
                        if matches!(target.kind_id(), CTypeKind::Char | CTypeKind::Void) =>
                    {
                        let c = CString::new(s.as_str())
                            .map_err(|_| pass_incompatible(n, ty, value))?;
                        (slot as *mut *const c_void).write(c.as_ptr() as *const c_void);
                        strings.push(c);
                    }
                    Value::CData(cd) if crate::types::is_compatible(ty, &cd.ty()) => {
                        if cd.ty().is_pointer() {
                            (slot as *mut *mut c_void)
                                .write(cd.pointee_addr()? as *mut c_void);
                        } else {
                            (slot as *mut *mut c_void)
                                .write(cd.ensure_live()? as *mut c_void);
                        }
                    }
                    _ => return Err(pass_incompatible(n, ty, value)),
                }
            }
            CTypeKind::Struct => match value {
                Value::CData(cd) if crate::types::is_compatible(ty, &cd.ty()) => {
                    return Ok((
                        ArgType::Record(synthesize_record(ty)),
                        cd.ensure_live()? as *mut c_void,
                    ));
                }
                _ => return Err(pass_incompatible(n, ty, value)),
            },
            _ => return Err(Error::UnsupportedPass(crate::types::display_name(ty))),
        }
    }
    let at = ffi_type_for(ty).ok_or_else(|| Error::UnsupportedPass(crate::types::display_name(ty)))?;
    Ok((at, slot_value))
}

/// Marshals a variadic extra by its host kind: integers widen to the
/// platform `long` width, floats travel as double, strings and null as
/// pointers, bools as uint8.
fn pass_var_arg(
    value: &Value,
    slot: *mut u8,
    n: usize,
    strings: &mut Vec<CString>,
) -> Result<(ArgType, *mut c_void)> {
    let slot_value = slot as *mut c_void;
    unsafe {
        let at = match value {
            Value::Null => {
                (slot as *mut *mut c_void).write(ptr::null_mut());
                ArgType::Static(static_type(CTypeKind::Pointer).unwrap())
            }
            Value::Bool(b) => {
                *slot = *b as u8;
                ArgType::Static(static_type(CTypeKind::Uint8).unwrap())
            }
            Value::Int(v) => {
                if long_is_32bit() {
                    (slot as *mut i32).write(*v as i32);
                    ArgType::Static(static_type(CTypeKind::Sint32).unwrap())
                } else {
                    (slot as *mut i64).write(*v);
                    ArgType::Static(static_type(CTypeKind::Sint64).unwrap())
                }
            }
            Value::Float(d) => {
                (slot as *mut f64).write(*d);
                ArgType::Static(static_type(CTypeKind::Double).unwrap())
            }
            Value::Str(s) => {
                let c = CString::new(s.as_str()).map_err(|_| Error::UnsupportedPass(
                    "string with embedded NUL".to_string(),
                ))?;
                (slot as *mut *const c_void).write(c.as_ptr() as *const c_void);
                strings.push(c);
                ArgType::Static(static_type(CTypeKind::Pointer).unwrap())
            }
            Value::CData(cd) => return pass_arg(value, &cd.ty(), slot, n, strings),
        };
        Ok((at, slot_value))
    }
}

/// Invokes a function-typed symbol (or pointer-to-function data) at `addr`.
pub(crate) fn call_function(fty: &TypeRef, addr: *mut c_void, args: &[Value]) -> Result<Value> {
    if !fty.is_func() {
        return Err(Error::NotCallable);
    }
    if addr.is_null() {
        return Err(Error::NullDeref);
    }
    let params = fty.func_params().unwrap();
    let ret_ty = fty.func_return().unwrap();
    let variadic = fty.attr().contains(TypeAttr::VARIADIC);
    let arg_count = params.len();

    if (variadic && args.len() < arg_count) || (!variadic && args.len() != arg_count) {
        return Err(Error::WrongArgCount {
            expected: arg_count,
            got: args.len(),
        });
    }

    let total = args.len();
    let mut slots = vec![0u8; SLOT_SIZE * total.max(1)];
    let mut strings: Vec<CString> = Vec::new();
    let mut arg_types: Vec<ArgType> = Vec::with_capacity(total);
    let mut arg_values: Vec<*mut c_void> = Vec::with_capacity(total);

    for n in 0..total {
        let slot = unsafe { slots.as_mut_ptr().add(SLOT_SIZE * n) };
        let (at, vp) = if n < arg_count {
            pass_arg(&args[n], &params[n], slot, n, &mut strings)?
        } else {
            pass_var_arg(&args[n], slot, n, &mut strings)?
        };
        arg_types.push(at);
        arg_values.push(vp);
    }

    let mut ret_type = ffi_type_for(&ret_ty)
        .ok_or_else(|| Error::UnsupportedReturn(crate::types::display_name(&ret_ty)))?;
    let mut type_ptrs: Vec<*mut ffi_type> = arg_types.iter_mut().map(|t| t.as_ptr()).collect();

    let mut cif: ffi_cif = Default::default();
    // Every surviving function type carries the default convention; the
    // parser rejects the rest on this target.
    let abi = ffi_abi_FFI_DEFAULT_ABI;
    unsafe {
        if variadic {
            prep_cif_var(
                &mut cif,
                abi,
                arg_count,
                total,
                ret_type.as_ptr(),
                type_ptrs.as_mut_ptr(),
            )
        } else {
            prep_cif(&mut cif, abi, total, ret_type.as_ptr(), type_ptrs.as_mut_ptr())
        }
    }
    .map_err(|_| Error::CifPrep)?;

    let ret_size = unsafe { (*ret_type.as_ptr()).size }.max(size_of::<ffi_arg>());
    let mut ret_buf = vec![0u8; ret_size];

    unsafe {
        raw::ffi_call(
            &mut cif,
            Some(std::mem::transmute::<*mut c_void, unsafe extern "C" fn()>(addr)),
            ret_buf.as_mut_ptr() as *mut c_void,
            arg_values.as_mut_ptr(),
        );
    }
    // arg_types (including synthesized struct descriptors) and the string
    // buffers stay alive until here.
    drop(strings);

    marshal::read_return(ret_buf.as_ptr(), &ret_ty)
}

/// Applies the platform's symbol-name decoration for the calling
/// convention. Everything except 32-bit Windows uses the name unchanged.
pub(crate) fn mangled_name(name: &str, fty: &TypeRef) -> String {
    #[cfg(all(windows, target_arch = "x86"))]
    {
        use crate::types::Abi;
        let arg_size = || -> usize {
            fty.func_params()
                .unwrap_or_default()
                .iter()
                .map(|t| t.size().max(size_of::<usize>()))
                .sum()
        };
        match fty.func_abi() {
            Some(Abi::Fastcall) => return format!("@{name}@{}", arg_size()),
            Some(Abi::Stdcall) => return format!("_{name}@{}", arg_size()),
            Some(Abi::Vectorcall) => return format!("{name}@@{}", arg_size()),
            _ => {}
        }
    }
    let _ = fty;
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdata::CData;
    use crate::types::{IntKind, Type, TypeKind};

    fn libc_fn(name: &str) -> *mut c_void {
        crate::library::NativeLibrary::open_self()
            .unwrap()
            .symbol(name)
            .unwrap()
    }

    fn func(ret: TypeRef, params: Vec<TypeRef>, variadic: bool) -> TypeRef {
        let attr = if variadic {
            TypeAttr::VARIADIC
        } else {
            TypeAttr::empty()
        };
        Type::new(
            TypeKind::Func {
                ret,
                params,
                abi: crate::types::Abi::Default,
            },
            size_of::<*const c_void>(),
            1,
            attr,
        )
    }

    #[test]
    fn strlen_of_a_host_string() {
        let fty = func(
            Type::int(IntKind::U64),
            vec![Type::pointer(Type::char_type())],
            false,
        );
        let got = call_function(&fty, libc_fn("strlen"), &[Value::Str("abc".into())]).unwrap();
        assert!(matches!(got, Value::Int(3)));
    }

    #[test]
    fn wrong_arg_count_is_rejected() {
        let fty = func(
            Type::int(IntKind::U64),
            vec![Type::pointer(Type::char_type())],
            false,
        );
        assert!(matches!(
            call_function(&fty, libc_fn("strlen"), &[]),
            Err(Error::WrongArgCount {
                expected: 1,
                got: 0
            })
        ));
    }

    #[test]
    fn variadic_snprintf_formats_into_cdata() {
        // int snprintf(char *str, size_t size, const char *format, ...)
        let buf_ty = Type::array(Type::char_type(), 32);
        let buf = CData::alloc(buf_ty, true, false).unwrap();
        let fty = func(
            Type::int(IntKind::S32),
            vec![
                Type::pointer(Type::char_type()),
                Type::int(IntKind::U64),
                Type::pointer(Type::char_type()),
            ],
            true,
        );
        let n = call_function(
            &fty,
            libc_fn("snprintf"),
            &[
                Value::CData(buf.clone()),
                Value::Int(32),
                Value::Str("x=%d".into()),
                Value::Int(42),
            ],
        )
        .unwrap();
        assert!(matches!(n, Value::Int(4)));
        let bytes = unsafe { std::slice::from_raw_parts(buf.data_ptr(), 4) };
        assert_eq!(bytes, b"x=42");
    }
}
