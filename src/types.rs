//! The C type graph.
//!
//! Types are immutable once the parse that produced them returns; during
//! parsing the producing [`Parser`](crate::parser::Parser) mutates nodes
//! through the interior lock (incomplete tags are completed in place).
//! Nodes are shared with [`triomphe::Arc`], which subsumes the borrowed/owned
//! split of a refcount-free implementation: a node lives exactly as long as
//! some symbol, tag, CData or caller still references it.

use std::collections::HashMap;
use std::ffi::c_void;

use bitflags::bitflags;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use triomphe::Arc;
use ustr::Ustr;

bitflags! {
    /// Attributes carried by every type node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeAttr: u32 {
        const CONST            = 1 << 0;
        const INCOMPLETE_TAG   = 1 << 1;
        const VARIADIC         = 1 << 2;
        const INCOMPLETE_ARRAY = 1 << 3;
        const VLA              = 1 << 4;
        const UNION            = 1 << 5;
        const PACKED           = 1 << 6;
        const MS_STRUCT        = 1 << 7;
        const GCC_STRUCT       = 1 << 8;
        const PERSISTENT       = 1 << 9;
        const STORED           = 1 << 10;
    }
}

impl TypeAttr {
    /// Attributes a struct/union node absorbs from its declarator.
    pub const STRUCT_ATTRS: TypeAttr = TypeAttr::UNION
        .union(TypeAttr::PACKED)
        .union(TypeAttr::MS_STRUCT)
        .union(TypeAttr::GCC_STRUCT);
    pub const ENUM_ATTRS: TypeAttr = TypeAttr::PACKED;
    pub const ARRAY_ATTRS: TypeAttr = TypeAttr::CONST
        .union(TypeAttr::VLA)
        .union(TypeAttr::INCOMPLETE_ARRAY);
    pub const FUNC_ATTRS: TypeAttr = TypeAttr::VARIADIC;
    pub const POINTER_ATTRS: TypeAttr = TypeAttr::CONST;
}

/// Calling conventions accepted by the declaration syntax. Only `Default`
/// and `Cdecl` are portable; the rest are rejected at type-construction
/// time on targets where the libffi collaborator lacks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Abi {
    #[default]
    Default,
    Cdecl,
    Fastcall,
    Thiscall,
    Stdcall,
    Pascal,
    Register,
    Ms,
    Sysv,
    Vectorcall,
}

/// Integer kinds usable as an enum's underlying type and as bit-field bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntKind {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
}

impl IntKind {
    pub fn size(self) -> usize {
        match self {
            IntKind::U8 | IntKind::S8 => 1,
            IntKind::U16 | IntKind::S16 => 2,
            IntKind::U32 | IntKind::S32 => 4,
            IntKind::U64 | IntKind::S64 => 8,
        }
    }

    pub fn align(self) -> usize {
        match self {
            IntKind::U8 | IntKind::S8 => 1,
            IntKind::U16 | IntKind::S16 => align_of::<u16>(),
            IntKind::U32 | IntKind::S32 => align_of::<u32>(),
            IntKind::U64 | IntKind::S64 => align_of::<u64>(),
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, IntKind::S8 | IntKind::S16 | IntKind::S32 | IntKind::S64)
    }
}

/// One struct/union member. `bits == 0` means a plain field.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: Option<Ustr>,
    pub ty: TypeRef,
    pub offset: usize,
    pub is_const: bool,
    /// Inlined from a nested anonymous struct/union.
    pub is_nested: bool,
    pub first_bit: u16,
    pub bits: u8,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Float,
    Double,
    LongDouble,
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Uint64,
    Sint64,
    Enum {
        tag: Option<Ustr>,
        kind: IntKind,
    },
    Bool,
    Char,
    Pointer {
        target: TypeRef,
    },
    Func {
        ret: TypeRef,
        params: Vec<TypeRef>,
        abi: Abi,
    },
    Array {
        elem: TypeRef,
        length: usize,
    },
    Record {
        tag: Option<Ustr>,
        fields: Vec<Field>,
    },
}

/// Payload-free kind discriminant, exposed through `CType` introspection
/// and used for dispatch where the payload is not needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CTypeKind {
    Void,
    Float,
    Double,
    LongDouble,
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Uint64,
    Sint64,
    Enum,
    Bool,
    Char,
    Pointer,
    Func,
    Array,
    Struct,
}

#[derive(Debug)]
pub struct TypeNode {
    pub kind: TypeKind,
    pub size: usize,
    pub align: usize,
    pub attr: TypeAttr,
}

/// A shared type node. The lock is only written by the parser that created
/// the node (tag completion, enum widening, attribute fixups); every reader
/// after a successful parse sees a frozen value.
#[derive(Debug)]
pub struct Type(RwLock<TypeNode>);

pub type TypeRef = Arc<Type>;

impl Type {
    pub fn new(kind: TypeKind, size: usize, align: usize, attr: TypeAttr) -> TypeRef {
        Arc::new(Type(RwLock::new(TypeNode {
            kind,
            size,
            align,
            attr,
        })))
    }

    pub fn void() -> TypeRef {
        Type::new(TypeKind::Void, 1, 1, TypeAttr::empty())
    }

    pub fn bool_type() -> TypeRef {
        Type::new(TypeKind::Bool, 1, 1, TypeAttr::empty())
    }

    pub fn char_type() -> TypeRef {
        Type::new(TypeKind::Char, 1, 1, TypeAttr::empty())
    }

    pub fn float() -> TypeRef {
        Type::new(TypeKind::Float, size_of::<f32>(), align_of::<f32>(), TypeAttr::empty())
    }

    pub fn double() -> TypeRef {
        Type::new(TypeKind::Double, size_of::<f64>(), align_of::<f64>(), TypeAttr::empty())
    }

    /// `long double` storage narrows to `double` on targets without a
    /// distinct extended type; the kind itself is always available.
    pub fn long_double() -> TypeRef {
        Type::new(TypeKind::LongDouble, size_of::<f64>(), align_of::<f64>(), TypeAttr::empty())
    }

    pub fn int(kind: IntKind) -> TypeRef {
        let tk = match kind {
            IntKind::U8 => TypeKind::Uint8,
            IntKind::S8 => TypeKind::Sint8,
            IntKind::U16 => TypeKind::Uint16,
            IntKind::S16 => TypeKind::Sint16,
            IntKind::U32 => TypeKind::Uint32,
            IntKind::S32 => TypeKind::Sint32,
            IntKind::U64 => TypeKind::Uint64,
            IntKind::S64 => TypeKind::Sint64,
        };
        Type::new(tk, kind.size(), kind.align(), TypeAttr::empty())
    }

    pub fn pointer(target: TypeRef) -> TypeRef {
        Type::new(
            TypeKind::Pointer { target },
            size_of::<*const c_void>(),
            align_of::<*const c_void>(),
            TypeAttr::empty(),
        )
    }

    pub fn array(elem: TypeRef, length: usize) -> TypeRef {
        let (size, align) = (elem.size() * length, elem.align());
        let attr = if length == 0 {
            TypeAttr::INCOMPLETE_ARRAY
        } else {
            TypeAttr::empty()
        };
        Type::new(TypeKind::Array { elem, length }, size, align, attr)
    }

    pub fn node(&self) -> RwLockReadGuard<'_, TypeNode> {
        self.0.read()
    }

    pub(crate) fn node_mut(&self) -> RwLockWriteGuard<'_, TypeNode> {
        self.0.write()
    }

    pub fn size(&self) -> usize {
        self.0.read().size
    }

    pub fn align(&self) -> usize {
        self.0.read().align
    }

    pub fn attr(&self) -> TypeAttr {
        self.0.read().attr
    }

    pub fn kind_id(&self) -> CTypeKind {
        match self.0.read().kind {
            TypeKind::Void => CTypeKind::Void,
            TypeKind::Float => CTypeKind::Float,
            TypeKind::Double => CTypeKind::Double,
            TypeKind::LongDouble => CTypeKind::LongDouble,
            TypeKind::Uint8 => CTypeKind::Uint8,
            TypeKind::Sint8 => CTypeKind::Sint8,
            TypeKind::Uint16 => CTypeKind::Uint16,
            TypeKind::Sint16 => CTypeKind::Sint16,
            TypeKind::Uint32 => CTypeKind::Uint32,
            TypeKind::Sint32 => CTypeKind::Sint32,
            TypeKind::Uint64 => CTypeKind::Uint64,
            TypeKind::Sint64 => CTypeKind::Sint64,
            TypeKind::Enum { .. } => CTypeKind::Enum,
            TypeKind::Bool => CTypeKind::Bool,
            TypeKind::Char => CTypeKind::Char,
            TypeKind::Pointer { .. } => CTypeKind::Pointer,
            TypeKind::Func { .. } => CTypeKind::Func,
            TypeKind::Array { .. } => CTypeKind::Array,
            TypeKind::Record { .. } => CTypeKind::Struct,
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.kind_id() == CTypeKind::Pointer
    }

    pub fn is_array(&self) -> bool {
        self.kind_id() == CTypeKind::Array
    }

    pub fn is_record(&self) -> bool {
        self.kind_id() == CTypeKind::Struct
    }

    pub fn is_func(&self) -> bool {
        self.kind_id() == CTypeKind::Func
    }

    pub fn is_union(&self) -> bool {
        self.is_record() && self.attr().contains(TypeAttr::UNION)
    }

    /// Scalar kinds: everything below pointer in the kind order, i.e. all
    /// numeric kinds plus bool, char and enum.
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self.kind_id(),
            CTypeKind::Void | CTypeKind::Pointer | CTypeKind::Func | CTypeKind::Array | CTypeKind::Struct
        )
    }

    /// Integer kinds legal as bit-field bases.
    pub fn is_bit_field_base(&self) -> bool {
        matches!(
            self.kind_id(),
            CTypeKind::Uint8
                | CTypeKind::Sint8
                | CTypeKind::Uint16
                | CTypeKind::Sint16
                | CTypeKind::Uint32
                | CTypeKind::Sint32
                | CTypeKind::Uint64
                | CTypeKind::Sint64
                | CTypeKind::Bool
                | CTypeKind::Char
        )
    }

    pub fn is_signed_integer(&self) -> bool {
        matches!(
            self.kind_id(),
            CTypeKind::Sint8 | CTypeKind::Sint16 | CTypeKind::Sint32 | CTypeKind::Sint64 | CTypeKind::Char
        )
    }

    pub fn pointer_target(&self) -> Option<TypeRef> {
        match &self.0.read().kind {
            TypeKind::Pointer { target } => Some(target.clone()),
            _ => None,
        }
    }

    pub fn array_elem(&self) -> Option<TypeRef> {
        match &self.0.read().kind {
            TypeKind::Array { elem, .. } => Some(elem.clone()),
            _ => None,
        }
    }

    pub fn array_length(&self) -> Option<usize> {
        match &self.0.read().kind {
            TypeKind::Array { length, .. } => Some(*length),
            _ => None,
        }
    }

    pub fn enum_kind(&self) -> Option<IntKind> {
        match &self.0.read().kind {
            TypeKind::Enum { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn func_return(&self) -> Option<TypeRef> {
        match &self.0.read().kind {
            TypeKind::Func { ret, .. } => Some(ret.clone()),
            _ => None,
        }
    }

    pub fn func_params(&self) -> Option<Vec<TypeRef>> {
        match &self.0.read().kind {
            TypeKind::Func { params, .. } => Some(params.clone()),
            _ => None,
        }
    }

    pub fn func_abi(&self) -> Option<Abi> {
        match &self.0.read().kind {
            TypeKind::Func { abi, .. } => Some(*abi),
            _ => None,
        }
    }

    pub fn tag_name(&self) -> Option<Ustr> {
        match &self.0.read().kind {
            TypeKind::Record { tag, .. } => *tag,
            TypeKind::Enum { tag, .. } => *tag,
            _ => None,
        }
    }

    pub fn field(&self, name: Ustr) -> Option<Field> {
        match &self.0.read().kind {
            TypeKind::Record { fields, .. } => {
                fields.iter().find(|f| f.name == Some(name)).cloned()
            }
            _ => None,
        }
    }

    pub fn fields(&self) -> Vec<Field> {
        match &self.0.read().kind {
            TypeKind::Record { fields, .. } => fields.clone(),
            _ => Vec::new(),
        }
    }
}

// ─── Compatibility ──────────────────────────────────────────────────────────

/// Assignment/pass compatibility: walks pointer and array chains, any
/// `void*` side short-circuits to compatible, a zero-length array matches
/// any length, and a pointer accepts an array of compatible elements.
pub fn is_compatible(dst: &TypeRef, src: &TypeRef) -> bool {
    let mut dst = dst.clone();
    let mut src = src.clone();
    loop {
        if Arc::ptr_eq(&dst, &src) {
            return true;
        }
        let dk = dst.kind_id();
        let sk = src.kind_id();
        if dk == sk {
            if dst.is_scalar() || dk == CTypeKind::Void {
                return true;
            } else if dk == CTypeKind::Pointer {
                let d = dst.pointer_target().unwrap();
                let s = src.pointer_target().unwrap();
                if d.kind_id() == CTypeKind::Void || s.kind_id() == CTypeKind::Void {
                    return true;
                }
                dst = d;
                src = s;
            } else if dk == CTypeKind::Array
                && (dst.array_length() == src.array_length() || dst.array_length() == Some(0))
            {
                let d = dst.array_elem().unwrap();
                let s = src.array_elem().unwrap();
                dst = d;
                src = s;
            } else {
                return false;
            }
        } else if dk == CTypeKind::Pointer && sk == CTypeKind::Array {
            let d = dst.pointer_target().unwrap();
            if d.kind_id() == CTypeKind::Void {
                return true;
            }
            let s = src.array_elem().unwrap();
            dst = d;
            src = s;
        } else {
            return false;
        }
    }
}

/// Strict structural sameness: no `void*` relaxation, array lengths must
/// match, aggregates compare field by field. Self-referential structs are
/// handled by treating a pair already under comparison as equal.
pub fn is_same(a: &TypeRef, b: &TypeRef) -> bool {
    fn eq(a: &TypeRef, b: &TypeRef, seen: &mut Vec<(*const Type, *const Type)>) -> bool {
        if Arc::ptr_eq(a, b) {
            return true;
        }
        let ak = a.kind_id();
        if ak != b.kind_id() {
            return false;
        }
        match ak {
            CTypeKind::Pointer => eq(
                &a.pointer_target().unwrap(),
                &b.pointer_target().unwrap(),
                seen,
            ),
            CTypeKind::Array => {
                a.array_length() == b.array_length()
                    && eq(&a.array_elem().unwrap(), &b.array_elem().unwrap(), seen)
            }
            CTypeKind::Enum => a.enum_kind() == b.enum_kind() && a.tag_name() == b.tag_name(),
            CTypeKind::Struct => {
                if a.tag_name() != b.tag_name()
                    || a.size() != b.size()
                    || a.attr().contains(TypeAttr::UNION) != b.attr().contains(TypeAttr::UNION)
                {
                    return false;
                }
                let pair = (&**a as *const Type, &**b as *const Type);
                if seen.contains(&pair) {
                    return true;
                }
                seen.push(pair);
                let fa = a.fields();
                let fb = b.fields();
                fa.len() == fb.len()
                    && fa.iter().zip(&fb).all(|(x, y)| {
                        x.name == y.name
                            && x.offset == y.offset
                            && x.bits == y.bits
                            && x.first_bit == y.first_bit
                            && eq(&x.ty, &y.ty, seen)
                    })
            }
            CTypeKind::Func => {
                let (ra, rb) = (a.func_return().unwrap(), b.func_return().unwrap());
                if !eq(&ra, &rb, seen) || a.func_abi() != b.func_abi() {
                    return false;
                }
                let (pa, pb) = (a.func_params().unwrap(), b.func_params().unwrap());
                pa.len() == pb.len()
                    && a.attr().contains(TypeAttr::VARIADIC)
                        == b.attr().contains(TypeAttr::VARIADIC)
                    && pa.iter().zip(&pb).all(|(x, y)| eq(x, y, seen))
            }
            _ => true,
        }
    }
    eq(a, b, &mut Vec::new())
}

// ─── Declaration-name printing ──────────────────────────────────────────────

fn base_name(ty: &TypeRef) -> String {
    let constness = if ty.attr().contains(TypeAttr::CONST) {
        "const "
    } else {
        ""
    };
    let name = match &ty.node().kind {
        TypeKind::Void => "void".to_string(),
        TypeKind::Float => "float".to_string(),
        TypeKind::Double => "double".to_string(),
        TypeKind::LongDouble => "long double".to_string(),
        TypeKind::Uint8 => "uint8_t".to_string(),
        TypeKind::Sint8 => "int8_t".to_string(),
        TypeKind::Uint16 => "uint16_t".to_string(),
        TypeKind::Sint16 => "int16_t".to_string(),
        TypeKind::Uint32 => "uint32_t".to_string(),
        TypeKind::Sint32 => "int32_t".to_string(),
        TypeKind::Uint64 => "uint64_t".to_string(),
        TypeKind::Sint64 => "int64_t".to_string(),
        TypeKind::Bool => "bool".to_string(),
        TypeKind::Char => "char".to_string(),
        TypeKind::Enum { tag, .. } => match tag {
            Some(t) => format!("enum {t}"),
            None => "enum <anonymous>".to_string(),
        },
        TypeKind::Record { tag, .. } => {
            let kw = if ty.attr().contains(TypeAttr::UNION) {
                "union"
            } else {
                "struct"
            };
            match tag {
                Some(t) => format!("{kw} {t}"),
                None => format!("{kw} <anonymous>"),
            }
        }
        _ => unreachable!("non-base kind"),
    };
    format!("{constness}{name}")
}

fn build_name(ty: &TypeRef, decl: String) -> String {
    match ty.kind_id() {
        CTypeKind::Pointer => {
            let constness = if ty.attr().contains(TypeAttr::CONST) {
                // Pointee constness: `const char*`.
                "const "
            } else {
                ""
            };
            let target = ty.pointer_target().unwrap();
            format!("{constness}{}", build_name(&target, format!("*{decl}")))
        }
        CTypeKind::Array => {
            let decl = if decl.starts_with('*') {
                format!("({decl})")
            } else {
                decl
            };
            let len = ty.array_length().unwrap();
            let dim = if len == 0 && ty.attr().contains(TypeAttr::INCOMPLETE_ARRAY) {
                String::new()
            } else {
                len.to_string()
            };
            build_name(&ty.array_elem().unwrap(), format!("{decl}[{dim}]"))
        }
        CTypeKind::Func => {
            let decl = if decl.starts_with('*') {
                format!("({decl})")
            } else {
                decl
            };
            let params = ty.func_params().unwrap();
            let mut list = params
                .iter()
                .map(display_name)
                .collect::<Vec<_>>()
                .join(", ");
            if ty.attr().contains(TypeAttr::VARIADIC) {
                if list.is_empty() {
                    list.push_str("...");
                } else {
                    list.push_str(", ...");
                }
            } else if list.is_empty() {
                list.push_str("void");
            }
            build_name(&ty.func_return().unwrap(), format!("{decl}({list})"))
        }
        _ => {
            let base = base_name(ty);
            if decl.is_empty() {
                base
            } else {
                format!("{base}{decl}")
            }
        }
    }
}

/// Reconstructs a C declaration string for a type node, such that parsing
/// the result (in the same scope) yields a structurally identical type.
pub fn display_name(ty: &TypeRef) -> String {
    build_name(ty, String::new())
}

// ─── Symbols & tags ─────────────────────────────────────────────────────────

/// Raw native address of a resolved symbol. Sharing is sound because the
/// engine treats the address as an opaque value owned by the loaded library.
#[derive(Debug, Clone, Copy)]
pub struct SymAddr(pub *mut c_void);

unsafe impl Send for SymAddr {}
unsafe impl Sync for SymAddr {}

impl SymAddr {
    pub fn null() -> Self {
        SymAddr(std::ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

#[derive(Debug, Clone)]
pub enum Symbol {
    TypeAlias {
        ty: TypeRef,
        is_const: bool,
    },
    Const {
        ty: TypeRef,
        value: i64,
    },
    Variable {
        ty: TypeRef,
        is_const: bool,
        addr: SymAddr,
    },
    Function {
        ty: TypeRef,
        addr: SymAddr,
    },
}

impl Symbol {
    pub fn ty(&self) -> &TypeRef {
        match self {
            Symbol::TypeAlias { ty, .. }
            | Symbol::Const { ty, .. }
            | Symbol::Variable { ty, .. }
            | Symbol::Function { ty, .. } => ty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Enum,
    Struct,
    Union,
}

impl TagKind {
    pub fn name(self) -> &'static str {
        match self {
            TagKind::Enum => "enum",
            TagKind::Struct => "struct",
            TagKind::Union => "union",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub kind: TagKind,
    pub ty: TypeRef,
}

pub type SymbolMap = HashMap<Ustr, Symbol>;
pub type TagMap = HashMap<Ustr, Tag>;

/// A frozen translation unit: the symbols and tags one `cdef`/`load`/`scope`
/// produced. Shared read-only between the engine handle and its clones.
#[derive(Debug, Default)]
pub struct ScopeData {
    pub symbols: SymbolMap,
    pub tags: TagMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_sizes_are_platform_true() {
        assert_eq!(Type::int(IntKind::S32).size(), 4);
        assert_eq!(Type::int(IntKind::U64).align(), align_of::<u64>());
        assert_eq!(Type::pointer(Type::void()).size(), size_of::<*const ()>());
    }

    #[test]
    fn void_pointer_is_compatible_with_any_object_pointer() {
        let void_ptr = Type::pointer(Type::void());
        let int_ptr = Type::pointer(Type::int(IntKind::S32));
        let double_ptr = Type::pointer(Type::double());
        assert!(is_compatible(&void_ptr, &int_ptr));
        assert!(is_compatible(&int_ptr, &void_ptr));
        assert!(!is_compatible(&int_ptr, &double_ptr));
    }

    #[test]
    fn array_decays_to_pointer_once() {
        let arr = Type::array(Type::int(IntKind::S32), 4);
        let int_ptr = Type::pointer(Type::int(IntKind::S32));
        assert!(is_compatible(&int_ptr, &arr));
        assert!(!is_compatible(&arr, &int_ptr));
    }

    #[test]
    fn zero_length_array_matches_any_length() {
        let any = Type::array(Type::char_type(), 0);
        let four = Type::array(Type::char_type(), 4);
        assert!(is_compatible(&any, &four));
        assert!(!is_same(&any, &four));
    }

    #[test]
    fn is_same_has_no_void_relaxation() {
        let void_ptr = Type::pointer(Type::void());
        let int_ptr = Type::pointer(Type::int(IntKind::S32));
        assert!(!is_same(&void_ptr, &int_ptr));
        assert!(is_same(&int_ptr, &Type::pointer(Type::int(IntKind::S32))));
    }

    #[test]
    fn names_print_like_declarations() {
        let t = Type::pointer(Type::int(IntKind::S32));
        assert_eq!(display_name(&t), "int32_t*");
        let t = Type::array(Type::int(IntKind::S32), 5);
        assert_eq!(display_name(&t), "int32_t[5]");
        let t = Type::pointer(Type::array(Type::int(IntKind::S32), 5));
        assert_eq!(display_name(&t), "int32_t(*)[5]");
    }
}
