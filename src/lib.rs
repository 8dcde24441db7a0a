#![cfg_attr(feature = "nightly", feature(doc_cfg))]
//! # cdef – an embeddable C FFI engine
//!
//! `cdef` gives a host virtual machine access to native code: declare C
//! types and symbols in a C-like declaration language, load a shared
//! library, allocate and manipulate typed C data ([`CData`]) and call
//! native functions with full calling-convention handling through libffi.
//!
//! ## Example
//!
//! ```
//! use cdef::{Ffi, Value};
//!
//! // Declare what we need from libc and bind against the process image.
//! let ffi = Ffi::cdef(
//!     "typedef unsigned long size_t;
//!      size_t strlen(const char *s);",
//!     None,
//! )
//! .unwrap();
//!
//! match ffi.call("strlen", &[Value::Str("hello".into())]).unwrap() {
//!     Value::Int(n) => assert_eq!(n, 5),
//!     other => panic!("unexpected {other:?}"),
//! }
//!
//! // Typed data with struct field access.
//! let ffi = cdef::Ffi::cdef("struct point { int x; int y; };", None).unwrap();
//! let p = ffi.new("struct point").unwrap();
//! p.write_field("x", &Value::Int(3)).unwrap();
//! assert!(matches!(p.read_field("x").unwrap(), Value::Int(3)));
//! ```
//!
//! Loaded `.h`-style files may carry `#define FFI_SCOPE "name"` and
//! `#define FFI_LIB "path"` directives; see [`preload`] and [`scope`](Ffi::scope)
//! for the startup-time variant.

pub mod error;

mod call;
mod cdata;
mod library;
mod marshal;
mod parser;
mod scope;
mod types;
mod val;

// Public surface ------------------------------------------------------

pub use cdata::{CData, CDataFlags, CDataIter};
pub use error::{Error, Result};
pub use marshal::Value;
pub use scope::{Enable, FfiConfig, configure, initialize, preload};
pub use types::{Abi, CTypeKind, TypeAttr};
pub use val::Val;

use std::ffi::c_void;

use triomphe::Arc;
use ustr::Ustr;

use cdata::CDataFlags as Flags;
use library::NativeLibrary;
use types::{ScopeData, Symbol, Type, TypeRef};

/// Resolves the addresses of every declared variable and function against
/// a loaded library. Functions are looked up under their mangled name.
pub(crate) fn resolve_symbols(data: &mut ScopeData, lib: Option<&NativeLibrary>) -> Result<()> {
    for (name, sym) in data.symbols.iter_mut() {
        match sym {
            Symbol::Variable { addr, .. } => {
                let lib = lib.ok_or_else(|| Error::SymbolResolve(name.to_string()))?;
                addr.0 = lib.symbol(name.as_str())?;
            }
            Symbol::Function { ty, addr } => {
                let lib = lib.ok_or_else(|| Error::SymbolResolve(name.to_string()))?;
                let mangled = call::mangled_name(name.as_str(), ty);
                addr.0 = lib
                    .symbol(&mangled)
                    .map_err(|_| Error::SymbolResolve(name.to_string()))?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// An engine handle: a frozen set of declarations plus the library its
/// symbols were resolved against. Cheap to clone.
#[derive(Clone)]
pub struct Ffi {
    pub(crate) scope: Arc<ScopeData>,
    pub(crate) lib: Option<Arc<NativeLibrary>>,
}

impl std::fmt::Debug for Ffi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ffi")
            .field("symbols", &self.scope.symbols.len())
            .field("tags", &self.scope.tags.len())
            .field("lib", &self.lib.as_ref().map(|l| l.name().to_string()))
            .finish()
    }
}

impl Ffi {
    /// Parses C declarations and resolves the declared symbols against
    /// `lib` (or the running process when `lib` is `None`).
    pub fn cdef(code: &str, lib: Option<&str>) -> Result<Ffi> {
        scope::ensure_define_allowed()?;
        let lib = match lib {
            Some(path) => Some(Arc::new(NativeLibrary::open(path)?)),
            None => NativeLibrary::open_self().ok().map(Arc::new),
        };
        let mut data = parser::parse_decls(code, None, false)?;
        resolve_symbols(&mut data, lib.as_deref())?;
        Ok(Ffi {
            scope: Arc::new(data),
            lib,
        })
    }

    /// Loads a `.h`-style file honoring its `FFI_SCOPE`/`FFI_LIB`
    /// directives.
    pub fn load(path: &str) -> Result<Ffi> {
        scope::ensure_define_allowed()?;
        scope::load_file(path, false)
    }

    /// Opens a handle onto a previously preloaded scope.
    pub fn scope(name: &str) -> Result<Ffi> {
        scope::ensure_runtime_allowed()?;
        let data = scope::find_scope(name).ok_or_else(|| Error::UnknownScope(name.to_string()))?;
        Ok(Ffi {
            scope: data,
            lib: None,
        })
    }

    /// An empty handle with no declarations, as used for plain type work.
    pub fn empty() -> Ffi {
        Ffi {
            scope: Arc::new(ScopeData::default()),
            lib: None,
        }
    }

    fn parse_one_type(&self, decl: &str) -> Result<(TypeRef, bool)> {
        parser::parse_type_str(decl, Some(self.scope.clone()))
    }

    // ─── Data construction ──────────────────────────────────────────────────

    /// Allocates zeroed storage for a declared type.
    pub fn new(&self, type_def: &str) -> Result<CData> {
        self.new_with(type_def, true, false)
    }

    /// Like [`new`](Self::new) with explicit ownership and allocator
    /// selection.
    pub fn new_with(&self, type_def: &str, owned: bool, persistent: bool) -> Result<CData> {
        scope::ensure_runtime_allowed()?;
        let (ty, is_const) = self.parse_one_type(type_def)?;
        let cd = CData::alloc(ty, owned, persistent)?;
        if is_const {
            cd.set_flags(cd.flags() | Flags::CONST);
        }
        Ok(cd)
    }

    /// Allocates storage for an already constructed [`CType`].
    pub fn new_typed(ty: &CType, owned: bool, persistent: bool) -> Result<CData> {
        scope::ensure_runtime_allowed()?;
        CData::alloc(ty.0.clone(), owned, persistent)
    }

    /// Reinterprets `value` as the named type; see the cast rules on
    /// [`CData`].
    pub fn cast(&self, type_def: &str, value: &Value) -> Result<CData> {
        scope::ensure_runtime_allowed()?;
        let (ty, is_const) = self.parse_one_type(type_def)?;
        CData::cast(ty, is_const, value)
    }

    pub fn cast_typed(ty: &CType, value: &Value) -> Result<CData> {
        scope::ensure_runtime_allowed()?;
        CData::cast(ty.0.clone(), false, value)
    }

    /// Parses a declaration into a [`CType`] without allocating storage.
    pub fn ctype(&self, decl: &str) -> Result<CType> {
        scope::ensure_runtime_allowed()?;
        let (ty, _) = self.parse_one_type(decl)?;
        Ok(CType(ty))
    }

    /// The type of an existing data value.
    pub fn type_of(value: &CData) -> CType {
        CType(value.ty())
    }

    /// Builds a (possibly multidimensional) array type; `dims[0]` is the
    /// outermost dimension and only it may be zero.
    pub fn array_type(elem: &CType, dims: &[usize]) -> Result<CType> {
        let ty = &elem.0;
        if ty.is_func() {
            return Err(Error::Parse {
                line: 0,
                msg: "array of functions is not allowed".into(),
            });
        }
        if ty.kind_id() == CTypeKind::Void {
            return Err(Error::Parse {
                line: 0,
                msg: "array of void type is not allowed".into(),
            });
        }
        if ty.attr().contains(TypeAttr::INCOMPLETE_TAG) {
            return Err(Error::Parse {
                line: 0,
                msg: "array of incomplete type is not allowed".into(),
            });
        }
        let mut ty = ty.clone();
        for &n in dims.iter().rev() {
            if ty.is_array() && ty.attr().contains(TypeAttr::INCOMPLETE_ARRAY) {
                return Err(Error::Parse {
                    line: 0,
                    msg: "only the leftmost array can be undimensioned".into(),
                });
            }
            ty = Type::array(ty, n);
        }
        Ok(CType(ty))
    }

    /// `&value`: a pointer data value addressing `value`'s storage.
    pub fn addr(value: &CData) -> Result<CData> {
        value.addr()
    }

    /// Size in bytes of a data value's type.
    pub fn size_of(value: &Value) -> Result<usize> {
        match value {
            Value::CData(cd) => Ok(cd.ty().size()),
            _ => Err(Error::IncompatibleAssignment {
                dst: "cdata/ctype".into(),
                src: value.kind_name().into(),
            }),
        }
    }

    pub fn align_of(value: &Value) -> Result<usize> {
        match value {
            Value::CData(cd) => Ok(cd.ty().align()),
            _ => Err(Error::IncompatibleAssignment {
                dst: "cdata/ctype".into(),
                src: value.kind_name().into(),
            }),
        }
    }

    // ─── Memory operations ──────────────────────────────────────────────────

    /// Resolves the raw region a data value designates. Bounds are only
    /// enforced for non-pointer data; a pointer's target region is the
    /// caller's contract.
    fn data_region(cd: &CData, size: usize) -> Result<*mut u8> {
        let ty = cd.ty();
        if ty.is_pointer() {
            let p = cd.pointee_addr()?;
            if p.is_null() {
                return Err(Error::NullDeref);
            }
            Ok(p)
        } else {
            if size > ty.size() {
                return Err(Error::OutOfBounds);
            }
            cd.ensure_live()
        }
    }

    fn source_region<'v>(value: &'v Value, size: usize) -> Result<(*const u8, Option<&'v str>)> {
        match value {
            Value::Str(s) => {
                if size > s.len() {
                    return Err(Error::OutOfBounds);
                }
                Ok((s.as_ptr(), Some(s.as_str())))
            }
            Value::CData(cd) => Ok((Self::data_region(cd, size)? as *const u8, None)),
            _ => Err(Error::IncompatibleAssignment {
                dst: "cdata or string".into(),
                src: value.kind_name().into(),
            }),
        }
    }

    pub fn memcpy(dst: &CData, src: &Value, size: usize) -> Result<()> {
        let d = Self::data_region(dst, size)?;
        let (s, _keep) = Self::source_region(src, size)?;
        unsafe { std::ptr::copy(s, d, size) };
        Ok(())
    }

    pub fn memcmp(a: &Value, b: &Value, size: usize) -> Result<i32> {
        let (pa, _ka) = Self::source_region(a, size)?;
        let (pb, _kb) = Self::source_region(b, size)?;
        let sa = unsafe { std::slice::from_raw_parts(pa, size) };
        let sb = unsafe { std::slice::from_raw_parts(pb, size) };
        Ok(match sa.cmp(sb) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        })
    }

    pub fn memset(dst: &CData, byte: u8, size: usize) -> Result<()> {
        let d = Self::data_region(dst, size)?;
        unsafe { std::ptr::write_bytes(d, byte, size) };
        Ok(())
    }

    /// Reads a host string out of C memory. With a size, any data value
    /// works; without one the type must be `char*` or `char[]` and the
    /// C NUL terminator decides the length.
    pub fn string(cd: &CData, size: Option<usize>) -> Result<String> {
        let ty = cd.ty();
        match size {
            Some(n) => {
                let p = Self::data_region(cd, n)?;
                let bytes = unsafe { std::slice::from_raw_parts(p, n) };
                Ok(String::from_utf8_lossy(bytes).into_owned())
            }
            None => {
                let p = if ty.is_pointer()
                    && ty.pointer_target().unwrap().kind_id() == CTypeKind::Char
                {
                    cd.pointee_addr()?
                } else if ty.is_array()
                    && ty.array_elem().unwrap().kind_id() == CTypeKind::Char
                {
                    cd.ensure_live()?
                } else {
                    return Err(Error::NonCString);
                };
                if p.is_null() {
                    return Err(Error::NullDeref);
                }
                let cstr = unsafe { std::ffi::CStr::from_ptr(p as *const _) };
                Ok(cstr.to_string_lossy().into_owned())
            }
        }
    }

    pub fn is_null(cd: &CData) -> Result<bool> {
        cd.is_null()
    }

    /// Releases a data value's storage early; see [`CData::free`].
    pub fn free(cd: &CData) -> Result<()> {
        cd.free()
    }

    // ─── Declared symbols ───────────────────────────────────────────────────

    fn symbol(&self, name: &str) -> Result<&Symbol> {
        self.scope
            .symbols
            .get(&Ustr::from(name))
            .ok_or_else(|| Error::UndefinedSymbol(name.to_string()))
    }

    /// Reads a declared C variable, enumerator constant or function.
    pub fn get(&self, name: &str) -> Result<Value> {
        scope::ensure_runtime_allowed()?;
        match self.symbol(name)? {
            Symbol::Variable { ty, is_const, addr } => {
                let flags = if *is_const {
                    Flags::CONST
                } else {
                    Flags::empty()
                };
                marshal::read_value(addr.0 as *const u8, ty, flags, None)
            }
            Symbol::Const { value, .. } => Ok(Value::Int(*value)),
            Symbol::Function { ty, addr } => {
                // A function reads as a callable pointer value.
                Ok(Value::CData(CData::pointer_value(
                    Type::pointer(ty.clone()),
                    addr.0,
                    Flags::CONST,
                    None,
                )))
            }
            Symbol::TypeAlias { .. } => Err(Error::UndefinedSymbol(name.to_string())),
        }
    }

    /// Writes a declared C variable.
    pub fn set(&self, name: &str, value: &Value) -> Result<()> {
        scope::ensure_runtime_allowed()?;
        match self.symbol(name)? {
            Symbol::Variable { ty, is_const, addr } => {
                if *is_const {
                    return Err(Error::AssignToConst);
                }
                marshal::write_value(addr.0 as *mut u8, ty, value, None)
            }
            _ => Err(Error::AssignToConst),
        }
    }

    /// Calls a declared C function through the trampoline.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        scope::ensure_runtime_allowed()?;
        match self.symbol(name)? {
            Symbol::Function { ty, addr } => call::call_function(ty, addr.0, args),
            _ => Err(Error::NotCallable),
        }
    }

    /// Calls through a pointer-to-function data value.
    pub fn call_data(callable: &CData, args: &[Value]) -> Result<Value> {
        scope::ensure_runtime_allowed()?;
        let ty = callable.ty();
        if let Some(target) = ty.pointer_target()
            && target.is_func()
        {
            let addr = callable.pointee_addr()? as *mut c_void;
            return call::call_function(&target, addr, args);
        }
        if ty.is_func() {
            let addr = callable.ensure_live()? as *mut c_void;
            return call::call_function(&ty, addr, args);
        }
        Err(Error::NotCallable)
    }
}

// ─── Type introspection ─────────────────────────────────────────────────────

/// Host-visible handle to a type-graph node, without storage.
#[derive(Clone)]
pub struct CType(TypeRef);

impl std::fmt::Debug for CType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CType").field(&self.name()).finish()
    }
}

impl CType {
    /// The reconstructed C declaration string for this type.
    pub fn name(&self) -> String {
        types::display_name(&self.0)
    }

    pub fn kind(&self) -> CTypeKind {
        self.0.kind_id()
    }

    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub fn align(&self) -> usize {
        self.0.align()
    }

    pub fn attributes(&self) -> TypeAttr {
        self.0.attr()
    }

    /// Underlying integer kind of an enum type.
    pub fn enum_kind(&self) -> Option<CTypeKind> {
        self.0.enum_kind().map(marshal::int_kind_as_ctype)
    }

    pub fn array_element(&self) -> Option<CType> {
        self.0.array_elem().map(CType)
    }

    pub fn array_length(&self) -> Option<usize> {
        self.0.array_length()
    }

    pub fn pointer_target(&self) -> Option<CType> {
        self.0.pointer_target().map(CType)
    }

    pub fn struct_field_names(&self) -> Vec<String> {
        self.0
            .fields()
            .iter()
            .filter_map(|f| f.name.map(|n| n.to_string()))
            .collect()
    }

    pub fn struct_field_offset(&self, name: &str) -> Option<usize> {
        self.0.field(Ustr::from(name)).map(|f| f.offset)
    }

    pub fn struct_field_type(&self, name: &str) -> Option<CType> {
        self.0.field(Ustr::from(name)).map(|f| CType(f.ty))
    }

    pub fn func_abi(&self) -> Option<Abi> {
        self.0.func_abi()
    }

    pub fn func_return(&self) -> Option<CType> {
        self.0.func_return().map(CType)
    }

    pub fn func_parameter_count(&self) -> Option<usize> {
        self.0.func_params().map(|p| p.len())
    }

    pub fn func_parameter_type(&self, i: usize) -> Option<CType> {
        self.0.func_params().and_then(|p| p.get(i).cloned()).map(CType)
    }

}
