//! Recursive-descent parser for the C declaration language.
//!
//! The parser drives a byte-level lexer and populates a symbol table and a
//! tag table while building type-graph nodes. Errors propagate as
//! `Result` through every production; a failed parse simply drops the
//! parser together with everything it built, so a `cdef`/`load` call is
//! transactional — the enclosing engine merges tables only on success.
//!
//! Incomplete tags complete in place: a forward-declared `struct node` is
//! the same node its later definition fills in, which is how
//! self-referential types come out right.

mod expr;
mod lexer;

use std::collections::HashMap;

use bitflags::bitflags;
use triomphe::Arc;
use ustr::Ustr;

use crate::error::{Error, Result};
use crate::types::{
    Abi, CTypeKind, Field, IntKind, ScopeData, SymAddr, Symbol, SymbolMap, Tag, TagKind, TagMap,
    Type, TypeAttr, TypeKind, TypeRef,
};
use crate::val::{Val, long_is_32bit};
use lexer::{Lexer, Tok};

bitflags! {
    /// Declaration-specifier state accumulated left to right.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct DclFlags: u32 {
        const VOID         = 1 << 0;
        const CHAR         = 1 << 1;
        const SHORT        = 1 << 2;
        const INT          = 1 << 3;
        const LONG         = 1 << 4;
        const LONG_LONG    = 1 << 5;
        const FLOAT        = 1 << 6;
        const DOUBLE       = 1 << 7;
        const SIGNED       = 1 << 8;
        const UNSIGNED     = 1 << 9;
        const BOOL         = 1 << 10;
        const COMPLEX      = 1 << 11;
        const STRUCT       = 1 << 12;
        const UNION        = 1 << 13;
        const ENUM         = 1 << 14;
        const TYPEDEF_NAME = 1 << 15;
        const TYPEDEF      = 1 << 16;
        const EXTERN       = 1 << 17;
        const STATIC       = 1 << 18;
        const AUTO         = 1 << 19;
        const REGISTER     = 1 << 20;
        const CONST        = 1 << 21;
        const RESTRICT     = 1 << 22;
        const VOLATILE     = 1 << 23;
        const ATOMIC       = 1 << 24;
        const INLINE       = 1 << 25;
        const NO_RETURN    = 1 << 26;
    }
}

impl DclFlags {
    const TYPE_SPECIFIERS: DclFlags = DclFlags::VOID
        .union(DclFlags::CHAR)
        .union(DclFlags::SHORT)
        .union(DclFlags::INT)
        .union(DclFlags::LONG)
        .union(DclFlags::LONG_LONG)
        .union(DclFlags::FLOAT)
        .union(DclFlags::DOUBLE)
        .union(DclFlags::SIGNED)
        .union(DclFlags::UNSIGNED)
        .union(DclFlags::BOOL)
        .union(DclFlags::COMPLEX)
        .union(DclFlags::STRUCT)
        .union(DclFlags::UNION)
        .union(DclFlags::ENUM)
        .union(DclFlags::TYPEDEF_NAME);
    const STORAGE_CLASS: DclFlags = DclFlags::TYPEDEF
        .union(DclFlags::EXTERN)
        .union(DclFlags::STATIC)
        .union(DclFlags::AUTO)
        .union(DclFlags::REGISTER);
    const TYPE_QUALIFIERS: DclFlags = DclFlags::CONST
        .union(DclFlags::RESTRICT)
        .union(DclFlags::VOLATILE)
        .union(DclFlags::ATOMIC);
    const INT_SPECIFIERS: DclFlags = DclFlags::CHAR
        .union(DclFlags::SHORT)
        .union(DclFlags::INT)
        .union(DclFlags::LONG)
        .union(DclFlags::LONG_LONG)
        .union(DclFlags::SIGNED)
        .union(DclFlags::UNSIGNED);
}

/// A declarator under construction.
#[derive(Debug, Clone, Default)]
pub(crate) struct Dcl {
    pub(crate) flags: DclFlags,
    pub(crate) align: usize,
    pub(crate) attr: TypeAttr,
    pub(crate) abi: Abi,
    pub(crate) ty: Option<TypeRef>,
    /// A zero-width anonymous bit-field was just seen on this struct; the
    /// next bit-field must start on a fresh packing unit.
    pub(crate) bit_field_break: bool,
}

enum Suffix {
    Array { len: Val, attr: TypeAttr },
    Func { params: Vec<TypeRef>, variadic: bool },
}

pub(crate) struct Parser<'a> {
    lex: Lexer<'a>,
    tok: Tok,
    pub(crate) symbols: SymbolMap,
    pub(crate) tags: TagMap,
    base: Option<Arc<ScopeData>>,
    default_attr: TypeAttr,
    allow_vla: bool,
    pub(crate) attribute_parsing: bool,
    /// Placeholder node marking the hole of a nested declarator.
    sentinel: TypeRef,
}

/// Parses a sequence of declarations, returning the produced tables.
pub(crate) fn parse_decls(
    code: &str,
    base: Option<Arc<ScopeData>>,
    persistent: bool,
) -> Result<ScopeData> {
    let default_attr = if persistent {
        TypeAttr::STORED | TypeAttr::PERSISTENT
    } else {
        TypeAttr::STORED
    };
    let mut p = Parser::new(code, base, default_attr);
    p.advance()?;
    while p.tok != Tok::Eof {
        if p.tok == Tok::Semicolon {
            p.advance()?;
            continue;
        }
        p.parse_declaration()?;
    }
    Ok(ScopeData {
        symbols: p.symbols,
        tags: p.tags,
    })
}

/// Parses a single abstract type, as used by `new`/`cast`/`type`.
pub(crate) fn parse_type_str(code: &str, base: Option<Arc<ScopeData>>) -> Result<(TypeRef, bool)> {
    let mut p = Parser::new(code, base, TypeAttr::empty());
    p.advance()?;
    let mut dcl = Dcl::default();
    p.parse_specifiers(&mut dcl)?;
    p.check_has_type(&dcl)?;
    let _ = p.parse_declarator(&mut dcl)?;
    p.parse_attributes(&mut dcl)?;
    if p.tok != Tok::Eof {
        return Err(p.err("unexpected token after type"));
    }
    p.finalize(&mut dcl)?;
    let ty = dcl.ty.clone().unwrap();
    if ty.attr().contains(TypeAttr::VLA) {
        return Err(p.err("'[*]' not allowed in other than function prototype scope"));
    }
    Ok((ty, dcl.attr.contains(TypeAttr::CONST)))
}

/// The predefined fixed-width and pointer-sized typedefs every translation
/// unit sees without declaring them.
fn builtin_type(name: &str) -> Option<TypeRef> {
    Some(match name {
        "int8_t" => Type::int(IntKind::S8),
        "uint8_t" => Type::int(IntKind::U8),
        "int16_t" => Type::int(IntKind::S16),
        "uint16_t" => Type::int(IntKind::U16),
        "int32_t" => Type::int(IntKind::S32),
        "uint32_t" => Type::int(IntKind::U32),
        "int64_t" => Type::int(IntKind::S64),
        "uint64_t" => Type::int(IntKind::U64),
        "intptr_t" | "ptrdiff_t" | "ssize_t" => {
            if size_of::<usize>() == 8 {
                Type::int(IntKind::S64)
            } else {
                Type::int(IntKind::S32)
            }
        }
        "uintptr_t" | "size_t" => {
            if size_of::<usize>() == 8 {
                Type::int(IntKind::U64)
            } else {
                Type::int(IntKind::U32)
            }
        }
        _ => return None,
    })
}

impl<'a> Parser<'a> {
    fn new(code: &'a str, base: Option<Arc<ScopeData>>, default_attr: TypeAttr) -> Self {
        Parser {
            lex: Lexer::new(code),
            tok: Tok::Eof,
            symbols: HashMap::new(),
            tags: HashMap::new(),
            base,
            default_attr,
            allow_vla: false,
            attribute_parsing: false,
            sentinel: Type::char_type(),
        }
    }

    pub(crate) fn err(&self, msg: impl Into<String>) -> Error {
        Error::parse(self.lex.line, msg)
    }

    pub(crate) fn advance(&mut self) -> Result<()> {
        self.tok = self.lex.next_token()?;
        Ok(())
    }

    fn peek_token(&self) -> Result<Tok> {
        self.lex.clone().next_token()
    }

    fn eat(&mut self, tok: &Tok) -> Result<bool> {
        if &self.tok == tok {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<()> {
        if self.tok == tok {
            self.advance()
        } else {
            Err(self.err(format!("expected {what}")))
        }
    }

    // ─── Lookup helpers ─────────────────────────────────────────────────────

    fn lookup_symbol(&self, name: Ustr) -> Option<&Symbol> {
        self.symbols
            .get(&name)
            .or_else(|| self.base.as_ref().and_then(|b| b.symbols.get(&name)))
    }

    fn lookup_tag(&self, name: Ustr) -> Option<Tag> {
        self.tags
            .get(&name)
            .or_else(|| self.base.as_ref().and_then(|b| b.tags.get(&name)))
            .cloned()
    }

    fn lookup_typedef(&self, name: Ustr) -> Option<(TypeRef, bool)> {
        match self.lookup_symbol(name) {
            Some(Symbol::TypeAlias { ty, is_const }) => Some((ty.clone(), *is_const)),
            _ => builtin_type(name.as_str()).map(|ty| (ty, false)),
        }
    }

    pub(crate) fn resolve_const(&self, name: Ustr) -> Val {
        if self.attribute_parsing {
            return Val::Name(name.to_string());
        }
        match self.lookup_symbol(name) {
            Some(Symbol::Const { ty, value }) => match ty.kind_id() {
                CTypeKind::Sint8 | CTypeKind::Sint16 | CTypeKind::Sint32 => Val::I32(*value),
                CTypeKind::Sint64 => Val::I64(*value),
                CTypeKind::Uint8 | CTypeKind::Uint16 | CTypeKind::Uint32 => {
                    Val::U32(*value as u64)
                }
                CTypeKind::Uint64 => Val::U64(*value as u64),
                _ => Val::Error,
            },
            _ => Val::Error,
        }
    }

    fn is_type_start(&self, tok: &Tok) -> bool {
        match tok {
            Tok::Ident(n) => {
                matches!(
                    n.as_str(),
                    "void"
                        | "char"
                        | "short"
                        | "int"
                        | "long"
                        | "float"
                        | "double"
                        | "signed"
                        | "__signed__"
                        | "unsigned"
                        | "_Bool"
                        | "bool"
                        | "_Complex"
                        | "const"
                        | "__const"
                        | "__const__"
                        | "volatile"
                        | "__volatile__"
                        | "restrict"
                        | "__restrict"
                        | "__restrict__"
                        | "_Atomic"
                        | "struct"
                        | "union"
                        | "enum"
                ) || self.lookup_typedef(*n).is_some()
            }
            _ => false,
        }
    }

    fn check_has_type(&self, dcl: &Dcl) -> Result<()> {
        if dcl.ty.is_none() && (dcl.flags & DclFlags::TYPE_SPECIFIERS).is_empty() {
            if let Tok::Ident(n) = &self.tok {
                return Err(Error::UnknownType(n.to_string()));
            }
            return Err(self.err("type specifier expected"));
        }
        Ok(())
    }

    // ─── Specifiers ─────────────────────────────────────────────────────────

    fn set_spec(&mut self, dcl: &mut Dcl, flag: DclFlags) -> Result<()> {
        if flag == DclFlags::LONG && dcl.flags.contains(DclFlags::LONG) {
            if dcl.flags.contains(DclFlags::LONG_LONG) {
                return Err(self.err("unsupported type specifier combination"));
            }
            dcl.flags |= DclFlags::LONG_LONG;
        } else if dcl.flags.contains(flag) && flag != DclFlags::CONST {
            return Err(self.err("unsupported type specifier combination"));
        } else {
            dcl.flags |= flag;
        }
        Ok(())
    }

    fn parse_specifiers(&mut self, dcl: &mut Dcl) -> Result<()> {
        loop {
            let Tok::Ident(name) = self.tok.clone() else {
                return Ok(());
            };
            match name.as_str() {
                "void" => {
                    self.set_spec(dcl, DclFlags::VOID)?;
                    self.advance()?;
                }
                "char" => {
                    self.set_spec(dcl, DclFlags::CHAR)?;
                    self.advance()?;
                }
                "short" => {
                    self.set_spec(dcl, DclFlags::SHORT)?;
                    self.advance()?;
                }
                "int" => {
                    self.set_spec(dcl, DclFlags::INT)?;
                    self.advance()?;
                }
                "long" => {
                    self.set_spec(dcl, DclFlags::LONG)?;
                    self.advance()?;
                }
                "float" => {
                    self.set_spec(dcl, DclFlags::FLOAT)?;
                    self.advance()?;
                }
                "double" => {
                    self.set_spec(dcl, DclFlags::DOUBLE)?;
                    self.advance()?;
                }
                "signed" | "__signed__" => {
                    self.set_spec(dcl, DclFlags::SIGNED)?;
                    self.advance()?;
                }
                "unsigned" => {
                    self.set_spec(dcl, DclFlags::UNSIGNED)?;
                    self.advance()?;
                }
                "_Bool" | "bool" => {
                    self.set_spec(dcl, DclFlags::BOOL)?;
                    self.advance()?;
                }
                "_Complex" => {
                    self.set_spec(dcl, DclFlags::COMPLEX)?;
                    self.advance()?;
                }
                "typedef" => {
                    self.set_spec(dcl, DclFlags::TYPEDEF)?;
                    self.advance()?;
                }
                "extern" => {
                    self.set_spec(dcl, DclFlags::EXTERN)?;
                    self.advance()?;
                }
                "static" => {
                    self.set_spec(dcl, DclFlags::STATIC)?;
                    self.advance()?;
                }
                "auto" => {
                    self.set_spec(dcl, DclFlags::AUTO)?;
                    self.advance()?;
                }
                "register" => {
                    self.set_spec(dcl, DclFlags::REGISTER)?;
                    self.advance()?;
                }
                "const" | "__const" | "__const__" => {
                    dcl.flags |= DclFlags::CONST;
                    dcl.attr |= TypeAttr::CONST;
                    self.advance()?;
                }
                "volatile" | "__volatile__" => {
                    dcl.flags |= DclFlags::VOLATILE;
                    self.advance()?;
                }
                "restrict" | "__restrict" | "__restrict__" => {
                    dcl.flags |= DclFlags::RESTRICT;
                    self.advance()?;
                }
                "_Atomic" => {
                    dcl.flags |= DclFlags::ATOMIC;
                    self.advance()?;
                }
                "inline" | "__inline" | "__inline__" => {
                    dcl.flags |= DclFlags::INLINE;
                    self.advance()?;
                }
                "_Noreturn" => {
                    dcl.flags |= DclFlags::NO_RETURN;
                    self.advance()?;
                }
                "struct" => {
                    self.set_spec(dcl, DclFlags::STRUCT)?;
                    self.parse_struct_or_union(dcl, false)?;
                }
                "union" => {
                    self.set_spec(dcl, DclFlags::UNION)?;
                    self.parse_struct_or_union(dcl, true)?;
                }
                "enum" => {
                    self.set_spec(dcl, DclFlags::ENUM)?;
                    self.parse_enum(dcl)?;
                }
                "__attribute__" | "__attribute" => {
                    self.parse_gcc_attributes(dcl)?;
                }
                "__declspec" => {
                    self.parse_declspec(dcl)?;
                }
                "__cdecl" => {
                    self.set_abi(dcl, Abi::Cdecl)?;
                    self.advance()?;
                }
                "__stdcall" => {
                    self.set_abi(dcl, Abi::Stdcall)?;
                    self.advance()?;
                }
                "__fastcall" => {
                    self.set_abi(dcl, Abi::Fastcall)?;
                    self.advance()?;
                }
                "__thiscall" => {
                    self.set_abi(dcl, Abi::Thiscall)?;
                    self.advance()?;
                }
                "__vectorcall" => {
                    self.set_abi(dcl, Abi::Vectorcall)?;
                    self.advance()?;
                }
                _ => {
                    // A lone identifier may name a typedef; anything else
                    // belongs to the declarator.
                    if dcl.ty.is_none()
                        && (dcl.flags & DclFlags::TYPE_SPECIFIERS).is_empty()
                        && let Some((ty, is_const)) = self.lookup_typedef(name)
                    {
                        dcl.flags |= DclFlags::TYPEDEF_NAME;
                        dcl.ty = Some(ty);
                        if is_const {
                            dcl.attr |= TypeAttr::CONST;
                        }
                        self.advance()?;
                    } else {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Maps the accumulated specifier flags onto a concrete scalar type.
    pub(crate) fn finalize(&self, dcl: &mut Dcl) -> Result<()> {
        if dcl.ty.is_some() {
            return Ok(());
        }
        let spec = dcl.flags & DclFlags::TYPE_SPECIFIERS;
        let ty = if spec == DclFlags::VOID {
            Type::void()
        } else if spec == DclFlags::BOOL {
            Type::bool_type()
        } else if spec == DclFlags::CHAR {
            Type::char_type()
        } else if spec == DclFlags::CHAR | DclFlags::SIGNED {
            Type::int(IntKind::S8)
        } else if spec == DclFlags::CHAR | DclFlags::UNSIGNED {
            Type::int(IntKind::U8)
        } else if spec == DclFlags::FLOAT {
            Type::float()
        } else if spec == DclFlags::DOUBLE {
            Type::double()
        } else if spec == DclFlags::DOUBLE | DclFlags::LONG {
            Type::long_double()
        } else if !spec.is_empty() && spec.intersection(DclFlags::INT_SPECIFIERS) == spec {
            let unsigned = spec.contains(DclFlags::UNSIGNED);
            let kind = if spec.contains(DclFlags::LONG_LONG) {
                if unsigned { IntKind::U64 } else { IntKind::S64 }
            } else if spec.contains(DclFlags::LONG) {
                if long_is_32bit() {
                    if unsigned { IntKind::U32 } else { IntKind::S32 }
                } else if unsigned {
                    IntKind::U64
                } else {
                    IntKind::S64
                }
            } else if spec.contains(DclFlags::SHORT) {
                if unsigned { IntKind::U16 } else { IntKind::S16 }
            } else if spec.contains(DclFlags::CHAR) {
                // signed/unsigned char are handled above; a stray
                // combination like "short char" never reaches here.
                if unsigned { IntKind::U8 } else { IntKind::S8 }
            } else {
                if unsigned { IntKind::U32 } else { IntKind::S32 }
            };
            // "short long", "char int" and friends are not C.
            if spec.contains(DclFlags::SHORT)
                && spec.intersects(DclFlags::LONG | DclFlags::LONG_LONG | DclFlags::CHAR)
                || spec.contains(DclFlags::CHAR)
                    && spec.intersects(DclFlags::SHORT | DclFlags::LONG | DclFlags::INT)
                || spec.contains(DclFlags::SIGNED) && spec.contains(DclFlags::UNSIGNED)
            {
                return Err(self.err("unsupported type specifier combination"));
            }
            Type::int(kind)
        } else {
            return Err(self.err("unsupported type specifier combination"));
        };
        dcl.ty = Some(ty);
        Ok(())
    }

    // ─── Struct / union / enum ──────────────────────────────────────────────

    fn make_struct(&mut self, dcl: &mut Dcl) {
        let mut attr = self.default_attr | (dcl.attr & TypeAttr::STRUCT_ATTRS);
        if dcl.flags.contains(DclFlags::UNION) {
            attr |= TypeAttr::UNION;
        }
        let ty = Type::new(
            TypeKind::Record {
                tag: None,
                fields: Vec::new(),
            },
            0,
            dcl.align.max(1),
            attr,
        );
        dcl.ty = Some(ty);
        dcl.attr.remove(TypeAttr::STRUCT_ATTRS);
        dcl.align = 0;
    }

    fn make_enum(&mut self, dcl: &mut Dcl) {
        let attr = self.default_attr | (dcl.attr & TypeAttr::ENUM_ATTRS);
        let kind = if attr.contains(TypeAttr::PACKED) {
            IntKind::U8
        } else {
            IntKind::U32
        };
        let ty = Type::new(
            TypeKind::Enum { tag: None, kind },
            kind.size(),
            kind.align(),
            attr,
        );
        dcl.ty = Some(ty);
        dcl.attr.remove(TypeAttr::ENUM_ATTRS);
    }

    fn declare_tag(&mut self, name: Ustr, dcl: &mut Dcl, incomplete: bool) -> Result<()> {
        let kind = if dcl.flags.contains(DclFlags::ENUM) {
            TagKind::Enum
        } else if dcl.flags.contains(DclFlags::UNION) {
            TagKind::Union
        } else {
            TagKind::Struct
        };
        if let Some(tag) = self.lookup_tag(name) {
            if tag.kind != kind {
                return Err(self.err(format!("\"{name}\" defined as wrong kind of tag")));
            }
            if !incomplete && !tag.ty.attr().contains(TypeAttr::INCOMPLETE_TAG) {
                return Err(self.err(format!("redefinition of \"{} {name}\"", kind.name())));
            }
            if !incomplete {
                tag.ty.node_mut().attr.remove(TypeAttr::INCOMPLETE_TAG);
            }
            dcl.ty = Some(tag.ty);
            Ok(())
        } else {
            match kind {
                TagKind::Enum => self.make_enum(dcl),
                _ => self.make_struct(dcl),
            }
            let ty = dcl.ty.clone().unwrap();
            {
                let mut node = ty.node_mut();
                match &mut node.kind {
                    TypeKind::Record { tag, .. } | TypeKind::Enum { tag, .. } => {
                        *tag = Some(name)
                    }
                    _ => unreachable!(),
                }
                if incomplete {
                    node.attr |= TypeAttr::INCOMPLETE_TAG;
                }
            }
            self.tags.insert(name, Tag { kind, ty });
            Ok(())
        }
    }

    fn parse_struct_or_union(&mut self, dcl: &mut Dcl, is_union: bool) -> Result<()> {
        debug_assert!(dcl.flags.contains(if is_union {
            DclFlags::UNION
        } else {
            DclFlags::STRUCT
        }));
        self.advance()?;
        self.parse_attributes(dcl)?;
        let tag = if let Tok::Ident(n) = self.tok.clone() {
            self.advance()?;
            Some(n)
        } else {
            None
        };
        if self.tok == Tok::LBrace {
            match tag {
                Some(n) => self.declare_tag(n, dcl, false)?,
                None => self.make_struct(dcl),
            }
            self.advance()?;
            while self.tok != Tok::RBrace {
                self.parse_struct_field(dcl)?;
            }
            self.advance()?;
            self.parse_attributes(dcl)?;
            self.adjust_struct_size(dcl);
            Ok(())
        } else {
            match tag {
                Some(n) => self.declare_tag(n, dcl, true),
                None => Err(self.err("expected '{'")),
            }
        }
    }

    fn parse_struct_field(&mut self, struct_dcl: &mut Dcl) -> Result<()> {
        let mut base = Dcl::default();
        self.parse_specifiers(&mut base)?;
        if self.tok == Tok::Semicolon {
            // A bare struct/union specifier is an anonymous member.
            self.advance()?;
            return self.add_anonymous_field(struct_dcl, base);
        }
        self.check_has_type(&base)?;
        loop {
            let mut fd = base.clone();
            if self.eat(&Tok::Colon)? {
                let width = self.parse_constant_expression()?;
                self.add_bit_field(struct_dcl, None, fd, width)?;
            } else {
                let name = self.parse_declarator(&mut fd)?;
                self.parse_attributes(&mut fd)?;
                if self.eat(&Tok::Colon)? {
                    let width = self.parse_constant_expression()?;
                    self.add_bit_field(struct_dcl, name, fd, width)?;
                } else {
                    match name {
                        Some(n) => self.add_field(struct_dcl, n, fd)?,
                        None => {
                            return Err(self.err("declaration does not declare anything"));
                        }
                    }
                }
            }
            if !self.eat(&Tok::Comma)? {
                break;
            }
        }
        self.expect(Tok::Semicolon, "';'")
    }

    fn parse_enum(&mut self, dcl: &mut Dcl) -> Result<()> {
        self.advance()?;
        self.parse_attributes(dcl)?;
        let tag = if let Tok::Ident(n) = self.tok.clone() {
            self.advance()?;
            Some(n)
        } else {
            None
        };
        if self.tok == Tok::LBrace {
            match tag {
                Some(n) => self.declare_tag(n, dcl, false)?,
                None => self.make_enum(dcl),
            }
            self.advance()?;
            let (mut min, mut max, mut last) = (0i64, 0i64, -1i64);
            loop {
                let Tok::Ident(name) = self.tok.clone() else {
                    return Err(self.err("enumerator name expected"));
                };
                self.advance()?;
                let val = if self.eat(&Tok::Assign)? {
                    self.parse_constant_expression()?
                } else {
                    Val::Empty
                };
                self.add_enum_val(dcl, name, val, &mut min, &mut max, &mut last)?;
                if !self.eat(&Tok::Comma)? {
                    break;
                }
                if self.tok == Tok::RBrace {
                    break;
                }
            }
            self.expect(Tok::RBrace, "'}'")?;
            self.parse_attributes(dcl)?;
            Ok(())
        } else {
            match tag {
                Some(n) => self.declare_tag(n, dcl, true),
                None => Err(self.err("expected '{'")),
            }
        }
    }

    fn add_enum_val(
        &mut self,
        enum_dcl: &mut Dcl,
        name: Ustr,
        val: Val,
        min: &mut i64,
        max: &mut i64,
        last: &mut i64,
    ) -> Result<()> {
        let enum_ty = enum_dcl.ty.clone().unwrap();
        let packed = enum_ty.attr().contains(TypeAttr::PACKED);
        let mut is_signed = enum_ty.enum_kind().unwrap().is_signed();
        let mut overflow = false;

        let value: i64 = match &val {
            Val::Empty => {
                if is_signed {
                    if *last == i64::MAX {
                        overflow = true;
                    }
                } else if (*min != 0 || *max != 0) && *last as u64 == u64::MAX {
                    overflow = true;
                }
                last.wrapping_add(1)
            }
            Val::Char(c) => {
                if !is_signed && *c < 0 {
                    if (*max as u64) > i64::MAX as u64 {
                        overflow = true;
                    } else {
                        is_signed = true;
                    }
                }
                *c as i64
            }
            Val::I32(v) | Val::I64(v) => {
                if !is_signed && *v < 0 {
                    if (*max as u64) > i64::MAX as u64 {
                        overflow = true;
                    } else {
                        is_signed = true;
                    }
                }
                *v
            }
            Val::U32(u) | Val::U64(u) => {
                if is_signed && *u > i64::MAX as u64 {
                    overflow = true;
                }
                *u as i64
            }
            _ => {
                return Err(
                    self.err(format!("enumerator value \"{name}\" must be an integer"))
                );
            }
        };
        if overflow {
            return Err(self.err(format!("overflow in enumeration values \"{name}\"")));
        }

        let sym_kind = if is_signed {
            *min = (*min).min(value);
            *max = (*max).max(value);
            if packed && *min >= i8::MIN as i64 && *max <= i8::MAX as i64 {
                IntKind::S8
            } else if packed && *min >= i16::MIN as i64 && *max <= i16::MAX as i64 {
                IntKind::S16
            } else if *min >= i32::MIN as i64 && *max <= i32::MAX as i64 {
                IntKind::S32
            } else {
                IntKind::S64
            }
        } else {
            *min = ((*min as u64).min(value as u64)) as i64;
            *max = ((*max as u64).max(value as u64)) as i64;
            if packed && (*max as u64) <= u8::MAX as u64 {
                IntKind::U8
            } else if packed && (*max as u64) <= u16::MAX as u64 {
                IntKind::U16
            } else if (*max as u64) <= u32::MAX as u64 {
                IntKind::U32
            } else {
                IntKind::U64
            }
        };
        {
            let mut node = enum_ty.node_mut();
            if let TypeKind::Enum { kind, .. } = &mut node.kind {
                *kind = sym_kind;
            }
            node.size = sym_kind.size();
            node.align = sym_kind.align();
        }
        *last = value;

        if self.symbols.contains_key(&name) {
            return Err(Error::Redeclaration(name.to_string()));
        }
        self.symbols.insert(
            name,
            Symbol::Const {
                ty: Type::int(sym_kind),
                value,
            },
        );
        Ok(())
    }

    // ─── Field layout ───────────────────────────────────────────────────────

    fn validate_prev_field(&self, struct_ty: &TypeRef) -> Result<()> {
        if let Some(last) = struct_ty.fields().last()
            && last.ty.attr().contains(TypeAttr::INCOMPLETE_ARRAY)
        {
            return Err(self.err("flexible array member not at end of struct"));
        }
        Ok(())
    }

    fn validate_field_type(&self, fty: &TypeRef, struct_ty: &TypeRef) -> Result<()> {
        if Arc::ptr_eq(fty, struct_ty) {
            return Err(self.err("struct/union can't contain an instance of itself"));
        }
        self.validate_var_type(fty, true)?;
        if struct_ty.attr().contains(TypeAttr::UNION)
            && fty.attr().contains(TypeAttr::INCOMPLETE_ARRAY)
        {
            return Err(self.err("flexible array member in union"));
        }
        self.validate_prev_field(struct_ty)
    }

    fn add_field(&mut self, struct_dcl: &mut Dcl, name: Ustr, mut fdcl: Dcl) -> Result<()> {
        let struct_ty = struct_dcl.ty.clone().unwrap();
        self.finalize(&mut fdcl)?;
        let fty = fdcl.ty.clone().unwrap();
        self.validate_field_type(&fty, &struct_ty)?;

        if struct_ty.field(name).is_some() {
            return Err(self.err(format!("duplicate field name \"{name}\"")));
        }

        let packed = struct_ty.attr().contains(TypeAttr::PACKED)
            || fdcl.attr.contains(TypeAttr::PACKED);
        let is_union = struct_ty.attr().contains(TypeAttr::UNION);
        let fsize = fty.size();
        let falign = fty.align().max(fdcl.align);

        let mut node = struct_ty.node_mut();
        if !packed {
            node.align = node.align.max(falign);
        }
        let offset = if is_union {
            node.size = node.size.max(fsize);
            0
        } else {
            if !packed {
                node.size = node.size.div_ceil(falign) * falign;
            }
            let o = node.size;
            node.size += fsize;
            o
        };
        if let TypeKind::Record { fields, .. } = &mut node.kind {
            fields.push(Field {
                name: Some(name),
                ty: fty,
                offset,
                is_const: fdcl.attr.contains(TypeAttr::CONST),
                is_nested: false,
                first_bit: 0,
                bits: 0,
            });
        }
        struct_dcl.bit_field_break = false;
        Ok(())
    }

    fn add_anonymous_field(&mut self, struct_dcl: &mut Dcl, mut fdcl: Dcl) -> Result<()> {
        let struct_ty = struct_dcl.ty.clone().unwrap();
        self.finalize(&mut fdcl)?;
        let fty = fdcl.ty.clone().unwrap();
        if !fty.is_record() {
            return Err(self.err("declaration does not declare anything"));
        }

        let packed = struct_ty.attr().contains(TypeAttr::PACKED)
            || fdcl.attr.contains(TypeAttr::PACKED);
        let is_union = struct_ty.attr().contains(TypeAttr::UNION);
        let falign = fty.align().max(fdcl.align);
        let fsize = fty.size();
        let inner_fields = fty.fields();

        if !is_union {
            self.validate_prev_field(&struct_ty)?;
        }
        for f in &inner_fields {
            if let Some(n) = f.name
                && struct_ty.field(n).is_some()
            {
                return Err(self.err(format!("duplicate field name \"{n}\"")));
            }
        }

        let mut node = struct_ty.node_mut();
        if !packed {
            node.align = node.align.max(falign);
        }
        let base = if is_union {
            0
        } else {
            if !packed {
                node.size = node.size.div_ceil(falign) * falign;
            }
            node.size
        };
        if let TypeKind::Record { fields, .. } = &mut node.kind {
            for f in inner_fields {
                fields.push(Field {
                    offset: base + f.offset,
                    is_nested: true,
                    ..f
                });
            }
        }
        if is_union {
            node.size = node.size.max(fsize);
        } else {
            node.size += fsize;
        }
        struct_dcl.bit_field_break = false;
        Ok(())
    }

    fn add_bit_field(
        &mut self,
        struct_dcl: &mut Dcl,
        name: Option<Ustr>,
        mut fdcl: Dcl,
        width: Val,
    ) -> Result<()> {
        let struct_ty = struct_dcl.ty.clone().unwrap();
        self.finalize(&mut fdcl)?;
        let fty = fdcl.ty.clone().unwrap();
        self.validate_field_type(&fty, &struct_ty)?;

        let display = name.map(|n| n.to_string()).unwrap_or_else(|| "<anonymous>".into());
        if !fty.is_bit_field_base() {
            return Err(self.err(format!("wrong type of bit field \"{display}\"")));
        }

        let packed = struct_ty.attr().contains(TypeAttr::PACKED);
        let is_union = struct_ty.attr().contains(TypeAttr::UNION);
        // The packing unit is fixed: a byte for packed structs, otherwise a
        // 32-bit word. The fields' own base-type widths play no part.
        let unit_bytes: usize = if packed { 1 } else { 4 };
        let unit_bits = (unit_bytes * 8) as u64;

        let bits = match width.as_i64() {
            Some(b) if b < 0 => {
                return Err(self.err(format!("negative width in bit-field \"{display}\"")));
            }
            Some(0) => {
                if name.is_some() {
                    return Err(self.err(format!("zero width in bit-field \"{display}\"")));
                }
                // An anonymous zero-width field forces alignment: the next
                // bit-field starts on a fresh packing unit. The field itself
                // is discarded.
                if !is_union {
                    let mut node = struct_ty.node_mut();
                    node.size = node.size.div_ceil(unit_bytes) * unit_bytes;
                    struct_dcl.bit_field_break = true;
                }
                return Ok(());
            }
            Some(b) if (b as u64) > (fty.size() * 8) as u64 => {
                return Err(self.err(format!("width of \"{display}\" exceeds its type")));
            }
            Some(b) => b as u64,
            None => {
                return Err(
                    self.err(format!("bit field \"{display}\" width not an integer constant"))
                );
            }
        };

        if let Some(n) = name
            && struct_ty.field(n).is_some()
        {
            return Err(self.err(format!("duplicate field name \"{n}\"")));
        }

        let mut node = struct_ty.node_mut();
        if !packed {
            node.align = node.align.max(size_of::<u32>());
        }
        let (offset, first_bit) = if is_union {
            node.size = node
                .size
                .max(bits.div_ceil(unit_bits) as usize * unit_bytes);
            (0usize, 0u16)
        } else {
            let prev = match &node.kind {
                TypeKind::Record { fields, .. } => fields.last().cloned(),
                _ => None,
            };
            let (offset, first_bit) = match prev {
                Some(p) if p.bits != 0 && !struct_dcl.bit_field_break => {
                    let fb = p.first_bit as u64 + p.bits as u64;
                    if fb + bits <= unit_bits {
                        (p.offset, fb as u16)
                    } else {
                        (node.size, 0)
                    }
                }
                _ => (node.size, 0),
            };
            let end_bits = first_bit as u64 + bits;
            node.size = offset + end_bits.div_ceil(unit_bits) as usize * unit_bytes;
            (offset, first_bit)
        };
        if let TypeKind::Record { fields, .. } = &mut node.kind {
            fields.push(Field {
                name,
                ty: fty,
                offset,
                is_const: fdcl.attr.contains(TypeAttr::CONST),
                is_nested: false,
                first_bit,
                bits: bits as u8,
            });
        }
        struct_dcl.bit_field_break = false;
        Ok(())
    }

    fn adjust_struct_size(&mut self, dcl: &mut Dcl) {
        let ty = dcl.ty.clone().unwrap();
        let mut node = ty.node_mut();
        if dcl.align > node.align {
            node.align = dcl.align;
        }
        if !node.attr.contains(TypeAttr::PACKED) {
            node.size = node.size.div_ceil(node.align) * node.align;
        }
        dcl.align = 0;
    }

    // ─── Pointer / array / function construction ────────────────────────────

    fn validate_vla(&self, ty: &TypeRef) -> Result<()> {
        if ty.attr().contains(TypeAttr::VLA) {
            return Err(self.err("'[*]' not allowed in other than function prototype scope"));
        }
        Ok(())
    }

    fn validate_incomplete_type(
        &self,
        ty: &TypeRef,
        allow_incomplete_tag: bool,
        allow_incomplete_array: bool,
    ) -> Result<()> {
        let attr = ty.attr();
        if attr.contains(TypeAttr::INCOMPLETE_TAG) && !allow_incomplete_tag {
            let what = ty
                .tag_name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "<anonymous>".into());
            return Err(self.err(format!("incomplete type \"{what}\" is not allowed")));
        }
        if attr.contains(TypeAttr::VLA) {
            return Err(self.err("'[*]' not allowed in other than function prototype scope"));
        }
        if attr.contains(TypeAttr::INCOMPLETE_ARRAY) && !allow_incomplete_array {
            return Err(self.err("only the leftmost array can be undimensioned"));
        }
        Ok(())
    }

    fn validate_var_type(&self, ty: &TypeRef, allow_incomplete_array: bool) -> Result<()> {
        if ty.kind_id() == CTypeKind::Void {
            return Err(self.err("void type is not allowed"));
        }
        self.validate_incomplete_type(ty, false, allow_incomplete_array)
    }

    fn make_pointer(&mut self, dcl: &mut Dcl) -> Result<()> {
        self.finalize(dcl)?;
        let target = dcl.ty.clone().unwrap();
        self.validate_vla(&target)?;
        let ty = Type::new(
            TypeKind::Pointer { target },
            size_of::<*const std::ffi::c_void>(),
            align_of::<*const std::ffi::c_void>(),
            self.default_attr | (dcl.attr & TypeAttr::POINTER_ATTRS),
        );
        dcl.ty = Some(ty);
        dcl.flags.remove(DclFlags::TYPE_QUALIFIERS);
        dcl.attr.remove(TypeAttr::POINTER_ATTRS);
        dcl.align = 0;
        Ok(())
    }

    fn validate_array_element_type(&self, ty: &TypeRef) -> Result<()> {
        if ty.is_func() {
            return Err(self.err("array of functions is not allowed"));
        }
        if ty.is_array() && ty.attr().contains(TypeAttr::INCOMPLETE_ARRAY) {
            return Err(self.err("only the leftmost array can be undimensioned"));
        }
        if ty.kind_id() == CTypeKind::Void {
            return Err(self.err("array of void type is not allowed"));
        }
        self.validate_incomplete_type(ty, false, true)
    }

    fn make_array(&mut self, dcl: &mut Dcl, len: Val) -> Result<()> {
        self.finalize(dcl)?;
        let elem = dcl.ty.clone().unwrap();
        let length: usize = match &len {
            Val::Empty => 0,
            Val::U32(u) | Val::U64(u) => *u as usize,
            Val::I32(v) | Val::I64(v) => {
                if *v < 0 {
                    return Err(self.err("negative array index"));
                }
                *v as usize
            }
            Val::Char(c) => {
                if *c < 0 {
                    return Err(self.err("negative array index"));
                }
                *c as usize
            }
            _ => return Err(self.err("unsupported array index type")),
        };
        self.validate_array_element_type(&elem)?;
        let ty = Type::new(
            TypeKind::Array {
                elem: elem.clone(),
                length,
            },
            length * elem.size(),
            elem.align(),
            self.default_attr | (dcl.attr & TypeAttr::ARRAY_ATTRS),
        );
        dcl.ty = Some(ty);
        dcl.flags.remove(DclFlags::TYPE_QUALIFIERS);
        dcl.attr.remove(TypeAttr::ARRAY_ATTRS);
        dcl.align = 0;
        Ok(())
    }

    fn validate_func_ret_type(&self, ty: &TypeRef) -> Result<()> {
        if ty.is_func() {
            return Err(self.err("function returning function is not allowed"));
        }
        if ty.is_array() {
            return Err(self.err("function returning array is not allowed"));
        }
        self.validate_incomplete_type(ty, true, false)
    }

    fn make_func(&mut self, dcl: &mut Dcl, mut params: Vec<TypeRef>, variadic: bool) -> Result<()> {
        self.finalize(dcl)?;
        let ret = dcl.ty.clone().unwrap();
        self.validate_func_ret_type(&ret)?;

        // The C `(void)` idiom empties the parameter list.
        let voids = params
            .iter()
            .filter(|p| p.kind_id() == CTypeKind::Void)
            .count();
        if voids > 0 {
            if params.len() == 1 {
                params.clear();
            } else {
                return Err(self.err("void type is not allowed"));
            }
        }

        let abi = match dcl.abi {
            Abi::Default | Abi::Cdecl => Abi::Default,
            // The libffi collaborator only carries the default convention
            // on this target.
            _ => return Err(Error::UnsupportedAbi),
        };
        let mut attr = self.default_attr | (dcl.attr & TypeAttr::FUNC_ATTRS);
        if variadic {
            attr |= TypeAttr::VARIADIC;
        }
        let ty = Type::new(
            TypeKind::Func { ret, params, abi },
            size_of::<*const std::ffi::c_void>(),
            1,
            attr,
        );
        dcl.ty = Some(ty);
        dcl.attr.remove(TypeAttr::FUNC_ATTRS);
        dcl.abi = Abi::Default;
        dcl.align = 0;
        Ok(())
    }

    fn add_arg(&mut self, params: &mut Vec<TypeRef>, mut arg_dcl: Dcl) -> Result<()> {
        self.finalize(&mut arg_dcl)?;
        let mut ty = arg_dcl.ty.clone().unwrap();
        // Arrays decay to pointers, functions to pointers-to-function.
        if ty.is_array() {
            let elem = ty.array_elem().unwrap();
            let attr = self.default_attr | (ty.attr() & TypeAttr::POINTER_ATTRS);
            ty = Type::new(
                TypeKind::Pointer { target: elem },
                size_of::<*const std::ffi::c_void>(),
                align_of::<*const std::ffi::c_void>(),
                attr,
            );
        } else if ty.is_func() {
            ty = Type::pointer(ty);
        }
        self.validate_incomplete_type(&ty, true, true)?;
        params.push(ty);
        Ok(())
    }

    // ─── Declarators ────────────────────────────────────────────────────────

    fn parse_params(&mut self) -> Result<(Vec<TypeRef>, bool)> {
        // '(' already consumed.
        let mut params = Vec::new();
        let mut variadic = false;
        if self.eat(&Tok::RParen)? {
            return Ok((params, false));
        }
        let saved_vla = self.allow_vla;
        self.allow_vla = true;
        loop {
            if self.tok == Tok::Ellipsis {
                self.advance()?;
                variadic = true;
                break;
            }
            let mut d = Dcl::default();
            self.parse_specifiers(&mut d)?;
            self.check_has_type(&d)?;
            let _name = self.parse_declarator(&mut d)?;
            self.parse_attributes(&mut d)?;
            self.add_arg(&mut params, d)?;
            if !self.eat(&Tok::Comma)? {
                break;
            }
        }
        self.allow_vla = saved_vla;
        self.expect(Tok::RParen, "')'")?;
        Ok((params, variadic))
    }

    fn parse_pointer_qualifiers(&mut self, dcl: &mut Dcl) -> Result<()> {
        loop {
            match self.tok.clone() {
                Tok::Ident(n) => match n.as_str() {
                    "const" | "__const" | "__const__" => {
                        dcl.flags |= DclFlags::CONST;
                        dcl.attr |= TypeAttr::CONST;
                        self.advance()?;
                    }
                    "volatile" | "__volatile__" | "restrict" | "__restrict"
                    | "__restrict__" | "_Atomic" => {
                        self.advance()?;
                    }
                    "__attribute__" | "__attribute" => self.parse_gcc_attributes(dcl)?,
                    _ => return Ok(()),
                },
                _ => return Ok(()),
            }
        }
    }

    fn parse_declarator(&mut self, dcl: &mut Dcl) -> Result<Option<Ustr>> {
        while self.tok == Tok::Star {
            self.advance()?;
            self.parse_pointer_qualifiers(dcl)?;
            self.make_pointer(dcl)?;
        }

        let mut nested: Option<Dcl> = None;
        let mut name = None;
        if self.tok == Tok::LParen {
            let next = self.peek_token()?;
            let nested_follows = match &next {
                Tok::Star | Tok::LParen => true,
                Tok::Ident(_) => !self.is_type_start(&next),
                _ => false,
            };
            if nested_follows {
                self.advance()?;
                let mut nd = Dcl {
                    ty: Some(self.sentinel.clone()),
                    ..Dcl::default()
                };
                name = self.parse_declarator(&mut nd)?;
                self.expect(Tok::RParen, "')'")?;
                nested = Some(nd);
            }
        }
        if nested.is_none()
            && let Tok::Ident(n) = self.tok.clone()
        {
            name = Some(n);
            self.advance()?;
        }

        let mut suffixes = Vec::new();
        loop {
            if self.eat(&Tok::LBracket)? {
                if self.eat(&Tok::RBracket)? {
                    suffixes.push(Suffix::Array {
                        len: Val::Empty,
                        attr: TypeAttr::INCOMPLETE_ARRAY,
                    });
                } else if self.tok == Tok::Star && self.peek_token()? == Tok::RBracket {
                    if !self.allow_vla {
                        return Err(self.err(
                            "'[*]' not allowed in other than function prototype scope",
                        ));
                    }
                    self.advance()?;
                    self.advance()?;
                    suffixes.push(Suffix::Array {
                        len: Val::Empty,
                        attr: TypeAttr::VLA,
                    });
                } else {
                    let len = self.parse_constant_expression()?;
                    self.expect(Tok::RBracket, "']'")?;
                    suffixes.push(Suffix::Array {
                        len,
                        attr: TypeAttr::empty(),
                    });
                }
            } else if self.eat(&Tok::LParen)? {
                let (params, variadic) = self.parse_params()?;
                suffixes.push(Suffix::Func { params, variadic });
            } else {
                break;
            }
        }
        for s in suffixes.into_iter().rev() {
            match s {
                Suffix::Array { len, attr } => {
                    dcl.attr |= attr;
                    self.make_array(dcl, len)?;
                }
                Suffix::Func { params, variadic } => {
                    self.make_func(dcl, params, variadic)?;
                }
            }
        }

        if let Some(nd) = nested {
            self.nested_declaration(dcl, nd)?;
        }
        Ok(name)
    }

    /// Splices the outer type into the hole (sentinel) of a nested
    /// declarator chain.
    fn splice_nested(&self, ty: &TypeRef, nested: &TypeRef) -> Result<()> {
        enum Step {
            DonePointer,
            DoneArray,
            DoneFunc,
            Recurse(TypeRef),
        }
        let step = {
            let mut node = nested.node_mut();
            match &mut node.kind {
                TypeKind::Pointer { target } => {
                    if Arc::ptr_eq(target, &self.sentinel) {
                        *target = ty.clone();
                        Step::DonePointer
                    } else {
                        Step::Recurse(target.clone())
                    }
                }
                TypeKind::Array { elem, .. } => {
                    if Arc::ptr_eq(elem, &self.sentinel) {
                        *elem = ty.clone();
                        Step::DoneArray
                    } else {
                        Step::Recurse(elem.clone())
                    }
                }
                TypeKind::Func { ret, .. } => {
                    if Arc::ptr_eq(ret, &self.sentinel) {
                        *ret = ty.clone();
                        Step::DoneFunc
                    } else {
                        Step::Recurse(ret.clone())
                    }
                }
                _ => return Err(self.err("unexpected declarator")),
            }
        };
        match step {
            Step::DonePointer => self.validate_vla(ty)?,
            Step::DoneArray => self.validate_array_element_type(ty)?,
            Step::DoneFunc => self.validate_func_ret_type(ty)?,
            Step::Recurse(child) => self.splice_nested(ty, &child)?,
        }
        // Array sizes along the chain pick up the now-known element size.
        let array_info = {
            let node = nested.node();
            match &node.kind {
                TypeKind::Array { elem, length } => Some((elem.clone(), *length)),
                _ => None,
            }
        };
        if let Some((elem, length)) = array_info {
            let (esize, ealign) = (elem.size(), elem.align());
            let mut node = nested.node_mut();
            node.size = length * esize;
            node.align = ealign;
        }
        Ok(())
    }

    fn nested_declaration(&mut self, dcl: &mut Dcl, nd: Dcl) -> Result<()> {
        self.finalize(dcl)?;
        let outer = dcl.ty.clone().unwrap();
        let nested_ty = nd.ty.unwrap();
        if Arc::ptr_eq(&nested_ty, &self.sentinel) {
            // `(name)` with no declarator operators.
            return Ok(());
        }
        self.splice_nested(&outer, &nested_ty)?;
        dcl.ty = Some(nested_ty);
        Ok(())
    }

    // ─── Declarations ───────────────────────────────────────────────────────

    fn parse_declaration(&mut self) -> Result<()> {
        let mut dcl = Dcl::default();
        self.parse_specifiers(&mut dcl)?;
        if self.tok == Tok::Semicolon {
            // Tag declaration without declarators.
            self.advance()?;
            return Ok(());
        }
        self.check_has_type(&dcl)?;
        loop {
            let mut d = dcl.clone();
            let name = self.parse_declarator(&mut d)?;
            self.parse_attributes(&mut d)?;
            if let Some(n) = name {
                self.declare(n, &mut d)?;
            }
            if !self.eat(&Tok::Comma)? {
                break;
            }
        }
        self.expect(Tok::Semicolon, "';'")
    }

    fn declare(&mut self, name: Ustr, dcl: &mut Dcl) -> Result<()> {
        self.finalize(dcl)?;
        let ty = dcl.ty.clone().unwrap();
        let storage = dcl.flags & DclFlags::STORAGE_CLASS;
        let is_const = dcl.attr.contains(TypeAttr::CONST);

        if let Some(old) = self.symbols.get(&name) {
            let allowed = match old {
                Symbol::TypeAlias {
                    ty: old_ty,
                    is_const: old_const,
                } => {
                    storage == DclFlags::TYPEDEF
                        && crate::types::is_same(old_ty, &ty)
                        && *old_const == is_const
                }
                Symbol::Function { ty: old_ty, .. } => {
                    (storage.is_empty() || storage == DclFlags::EXTERN)
                        && crate::types::is_same(old_ty, &ty)
                }
                Symbol::Variable {
                    ty: old_ty,
                    is_const: old_const,
                    ..
                } => {
                    (storage.is_empty() || storage == DclFlags::EXTERN)
                        && crate::types::is_same(old_ty, &ty)
                        && *old_const == is_const
                }
                Symbol::Const { .. } => false,
            };
            if allowed {
                return Ok(());
            }
            return Err(Error::Redeclaration(name.to_string()));
        }

        if storage == DclFlags::TYPEDEF {
            self.validate_vla(&ty)?;
            let ty = if dcl.align > ty.align() {
                // Raise the alignment on a private copy; the original node
                // may be shared by other declarations.
                let node = ty.node();
                Type::new(
                    node.kind.clone(),
                    node.size,
                    dcl.align,
                    node.attr | self.default_attr,
                )
            } else {
                ty
            };
            self.symbols.insert(name, Symbol::TypeAlias { ty, is_const });
        } else if storage.is_empty() || storage == DclFlags::EXTERN {
            if ty.kind_id() == CTypeKind::Void {
                return Err(self.err("void type is not allowed"));
            }
            self.validate_incomplete_type(&ty, storage == DclFlags::EXTERN, true)?;
            let sym = if ty.is_func() {
                Symbol::Function {
                    ty,
                    addr: SymAddr::null(),
                }
            } else {
                Symbol::Variable {
                    ty,
                    is_const,
                    addr: SymAddr::null(),
                }
            };
            self.symbols.insert(name, sym);
        }
        // Other storage classes are accepted and ignored.
        Ok(())
    }

    // ─── Attributes ─────────────────────────────────────────────────────────

    fn parse_attributes(&mut self, dcl: &mut Dcl) -> Result<()> {
        loop {
            match self.tok.clone() {
                Tok::Ident(n) => match n.as_str() {
                    "__attribute__" | "__attribute" => self.parse_gcc_attributes(dcl)?,
                    "__declspec" => self.parse_declspec(dcl)?,
                    "__cdecl" => {
                        self.set_abi(dcl, Abi::Cdecl)?;
                        self.advance()?;
                    }
                    "__stdcall" => {
                        self.set_abi(dcl, Abi::Stdcall)?;
                        self.advance()?;
                    }
                    "__fastcall" => {
                        self.set_abi(dcl, Abi::Fastcall)?;
                        self.advance()?;
                    }
                    "__thiscall" => {
                        self.set_abi(dcl, Abi::Thiscall)?;
                        self.advance()?;
                    }
                    "__vectorcall" => {
                        self.set_abi(dcl, Abi::Vectorcall)?;
                        self.advance()?;
                    }
                    _ => return Ok(()),
                },
                _ => return Ok(()),
            }
        }
    }

    fn set_abi(&mut self, dcl: &mut Dcl, abi: Abi) -> Result<()> {
        if dcl.abi != Abi::Default {
            return Err(self.err("multiple calling convention specifiers"));
        }
        dcl.abi = abi;
        Ok(())
    }

    fn strip_underscores(name: &str) -> &str {
        if name.len() > 4 && name.starts_with("__") && name.ends_with("__") {
            &name[2..name.len() - 2]
        } else {
            name
        }
    }

    fn parse_gcc_attributes(&mut self, dcl: &mut Dcl) -> Result<()> {
        self.advance()?;
        self.expect(Tok::LParen, "'('")?;
        self.expect(Tok::LParen, "'('")?;
        loop {
            let Tok::Ident(name) = self.tok.clone() else {
                return Err(self.err("attribute name expected"));
            };
            self.advance()?;
            if self.eat(&Tok::LParen)? {
                let saved = self.attribute_parsing;
                self.attribute_parsing = true;
                let mut n = 0usize;
                loop {
                    let val = self.parse_constant_expression()?;
                    self.attribute_parsing = saved;
                    self.add_attribute_value(dcl, name.as_str(), n, val)?;
                    self.attribute_parsing = true;
                    n += 1;
                    if !self.eat(&Tok::Comma)? {
                        break;
                    }
                }
                self.attribute_parsing = saved;
                self.expect(Tok::RParen, "')'")?;
            } else {
                self.add_attribute(dcl, name.as_str())?;
            }
            if !self.eat(&Tok::Comma)? {
                break;
            }
        }
        self.expect(Tok::RParen, "')'")?;
        self.expect(Tok::RParen, "')'")?;
        Ok(())
    }

    fn parse_declspec(&mut self, dcl: &mut Dcl) -> Result<()> {
        self.advance()?;
        self.expect(Tok::LParen, "'('")?;
        loop {
            let Tok::Ident(name) = self.tok.clone() else {
                return Err(self.err("attribute name expected"));
            };
            self.advance()?;
            if self.eat(&Tok::LParen)? {
                let saved = self.attribute_parsing;
                self.attribute_parsing = true;
                let val = self.parse_constant_expression()?;
                self.attribute_parsing = saved;
                self.expect(Tok::RParen, "')'")?;
                self.add_msvc_attribute_value(dcl, name.as_str(), val)?;
            }
            if self.tok == Tok::RParen {
                break;
            }
        }
        self.expect(Tok::RParen, "')'")?;
        Ok(())
    }

    fn add_attribute(&mut self, dcl: &mut Dcl, name: &str) -> Result<()> {
        match Self::strip_underscores(name) {
            "cdecl" => self.set_abi(dcl, Abi::Cdecl),
            "fastcall" => self.set_abi(dcl, Abi::Fastcall),
            "thiscall" => self.set_abi(dcl, Abi::Thiscall),
            "stdcall" => self.set_abi(dcl, Abi::Stdcall),
            "ms_abi" => self.set_abi(dcl, Abi::Ms),
            "sysv_abi" => self.set_abi(dcl, Abi::Sysv),
            "vectorcall" => self.set_abi(dcl, Abi::Vectorcall),
            "aligned" => {
                dcl.align = 16;
                Ok(())
            }
            "packed" => {
                dcl.attr |= TypeAttr::PACKED;
                Ok(())
            }
            "ms_struct" => {
                dcl.attr |= TypeAttr::MS_STRUCT;
                Ok(())
            }
            "gcc_struct" => {
                dcl.attr |= TypeAttr::GCC_STRUCT;
                Ok(())
            }
            "const" | "malloc" | "deprecated" | "nothrow" | "leaf" | "pure" | "noreturn"
            | "warn_unused_result" => Ok(()),
            other => Err(self.err(format!("unsupported attribute \"{other}\""))),
        }
    }

    fn add_attribute_value(&mut self, dcl: &mut Dcl, name: &str, n: usize, val: Val) -> Result<()> {
        match Self::strip_underscores(name) {
            "regparam" => {
                if n == 0 && val.as_i64() == Some(3) {
                    self.set_abi(dcl, Abi::Register)
                } else {
                    Err(self.err("incorrect \"regparam\" value"))
                }
            }
            "aligned" => match val.as_i64() {
                Some(v) if n == 0 && v > 0 && v <= 0x8000_0000 && (v & (v - 1)) == 0 => {
                    dcl.align = v as usize;
                    Ok(())
                }
                _ => Err(self.err("incorrect \"alignment\" value")),
            },
            "mode" => {
                if n == 0
                    && let Val::Name(s) = &val
                {
                    let mode = Self::strip_underscores(s.as_str());
                    let int_flags = DclFlags::CHAR
                        | DclFlags::SHORT
                        | DclFlags::INT
                        | DclFlags::LONG
                        | DclFlags::LONG_LONG;
                    let fp_flags = DclFlags::LONG | DclFlags::FLOAT | DclFlags::DOUBLE;
                    match mode {
                        "QI" | "HI" | "SI" | "DI" => {
                            let other = DclFlags::TYPE_SPECIFIERS
                                - (int_flags | DclFlags::SIGNED | DclFlags::UNSIGNED);
                            if !dcl.flags.intersects(other) {
                                dcl.flags.remove(int_flags);
                                dcl.flags |= match mode {
                                    "QI" => DclFlags::CHAR,
                                    "HI" => DclFlags::SHORT,
                                    "SI" => DclFlags::INT,
                                    _ => {
                                        if long_is_32bit() {
                                            DclFlags::LONG | DclFlags::LONG_LONG
                                        } else {
                                            DclFlags::LONG
                                        }
                                    }
                                };
                                return Ok(());
                            }
                        }
                        "SF" | "DF" => {
                            let other = DclFlags::TYPE_SPECIFIERS - fp_flags;
                            if !dcl.flags.intersects(other) {
                                dcl.flags.remove(fp_flags);
                                dcl.flags |= if mode == "SF" {
                                    DclFlags::FLOAT
                                } else {
                                    DclFlags::DOUBLE
                                };
                                return Ok(());
                            }
                        }
                        _ => {}
                    }
                }
                Err(self.err("unsupported \"mode\" value"))
            }
            "nonnull" | "alloc_size" | "format" | "deprecated" => Ok(()),
            other => Err(self.err(format!("unsupported attribute \"{other}\""))),
        }
    }

    fn add_msvc_attribute_value(&mut self, dcl: &mut Dcl, name: &str, val: Val) -> Result<()> {
        if name == "align" {
            match val.as_i64() {
                Some(v) if v > 0 && v <= 0x8000_0000 && (v & (v - 1)) == 0 => {
                    dcl.align = v as usize;
                    Ok(())
                }
                _ => Err(self.err("incorrect \"alignment\" value")),
            }
        } else {
            // Unknown __declspec values are ignored.
            Ok(())
        }
    }

    // Used by the expression evaluator for casts and sizeof.
    pub(crate) fn parse_type_name(&mut self) -> Result<Dcl> {
        let mut dcl = Dcl::default();
        self.parse_specifiers(&mut dcl)?;
        self.check_has_type(&dcl)?;
        let _ = self.parse_declarator(&mut dcl)?;
        Ok(dcl)
    }

    pub(crate) fn peek_is_type_start(&self) -> Result<bool> {
        let next = self.peek_token()?;
        Ok(self.is_type_start(&next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::display_name;

    fn decls(code: &str) -> ScopeData {
        parse_decls(code, None, false).unwrap()
    }

    fn ty(code: &str) -> TypeRef {
        parse_type_str(code, None).unwrap().0
    }

    fn alias(data: &ScopeData, name: &str) -> TypeRef {
        match data.symbols.get(&Ustr::from(name)).unwrap() {
            Symbol::TypeAlias { ty, .. } => ty.clone(),
            other => panic!("not a typedef: {other:?}"),
        }
    }

    #[test]
    fn struct_layout_follows_c_rules() {
        let data = decls("typedef struct P { int x; char y; } P;");
        let p = alias(&data, "P");
        assert_eq!(p.size(), 8);
        assert_eq!(p.align(), 4);
        assert_eq!(p.field(Ustr::from("y")).unwrap().offset, 4);
        assert_eq!(p.field(Ustr::from("x")).unwrap().offset, 0);
    }

    #[test]
    fn packed_struct_drops_padding() {
        let data = decls("typedef struct __attribute__((packed)) Q { int x; char y; } Q;");
        let q = alias(&data, "Q");
        assert_eq!(q.size(), 5);
        assert_eq!(q.field(Ustr::from("y")).unwrap().offset, 4);
    }

    #[test]
    fn union_fields_all_start_at_zero() {
        let data = decls("typedef union U { uint32_t i; uint8_t b[4]; } U;");
        let u = alias(&data, "U");
        assert_eq!(u.size(), 4);
        for f in u.fields() {
            assert_eq!(f.offset, 0);
        }
    }

    #[test]
    fn bit_fields_pack_into_a_word() {
        let data =
            decls("typedef struct B { unsigned a:3; unsigned b:5; unsigned c:8; } B;");
        let b = alias(&data, "B");
        assert_eq!(b.size(), 4);
        let a = b.field(Ustr::from("a")).unwrap();
        let c = b.field(Ustr::from("c")).unwrap();
        assert_eq!((a.offset, a.first_bit, a.bits), (0, 0, 3));
        assert_eq!((c.offset, c.first_bit, c.bits), (0, 8, 8));
    }

    #[test]
    fn zero_width_bit_field_must_be_anonymous() {
        assert!(parse_decls("struct Z { unsigned a:3; unsigned :0; };", None, false).is_ok());
        assert!(parse_decls("struct Z { unsigned a:0; };", None, false).is_err());
    }

    #[test]
    fn zero_width_bit_field_forces_a_fresh_unit() {
        let data =
            decls("typedef struct Z { unsigned a:3; unsigned :0; unsigned b:3; } Z;");
        let z = alias(&data, "Z");
        let b = z.field(Ustr::from("b")).unwrap();
        assert_eq!((b.offset, b.first_bit), (4, 0));
        assert_eq!(z.size(), 8);
    }

    #[test]
    fn bit_field_packing_unit_is_a_word_not_the_base_type() {
        // All three nibbles share one 32-bit unit even though the base type
        // is a single byte wide.
        let data = decls(
            "typedef struct M { unsigned char a:4; unsigned char b:4; unsigned char c:4; } M;",
        );
        let m = alias(&data, "M");
        assert_eq!(m.size(), 4);
        let b = m.field(Ustr::from("b")).unwrap();
        let c = m.field(Ustr::from("c")).unwrap();
        assert_eq!((b.offset, b.first_bit, b.bits), (0, 4, 4));
        assert_eq!((c.offset, c.first_bit, c.bits), (0, 8, 4));
    }

    #[test]
    fn bit_field_width_is_bounded_by_its_type() {
        assert!(parse_decls("struct W { unsigned char c:9; };", None, false).is_err());
    }

    #[test]
    fn enum_values_widen_the_underlying_type() {
        let data = decls("enum E { A, B = 250, C };");
        match data.symbols.get(&Ustr::from("C")).unwrap() {
            Symbol::Const { value, .. } => assert_eq!(*value, 251),
            other => panic!("unexpected {other:?}"),
        }
        let data = decls("enum Big { HUGE_VALUE = 0x100000000 };");
        let tag = data.tags.get(&Ustr::from("Big")).unwrap();
        assert_eq!(tag.ty.size(), 8);
    }

    #[test]
    fn enum_constants_fold_into_expressions() {
        let data = decls("enum { N = 4 }; typedef int row[N * 2];");
        assert_eq!(alias(&data, "row").array_length(), Some(8));
    }

    #[test]
    fn duplicate_field_is_rejected() {
        assert!(matches!(
            parse_decls("struct D { int a; int a; };", None, false),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn redeclaration_is_rejected_unless_identical() {
        assert!(parse_decls("typedef int T; typedef int T;", None, false).is_ok());
        assert!(matches!(
            parse_decls("typedef int T; typedef char T;", None, false),
            Err(Error::Redeclaration(_))
        ));
    }

    #[test]
    fn flexible_array_member_only_at_end() {
        assert!(parse_decls("struct F { int n; char data[]; };", None, false).is_ok());
        assert!(parse_decls("struct F { char data[]; int n; };", None, false).is_err());
        assert!(parse_decls("union F { char data[]; };", None, false).is_err());
    }

    #[test]
    fn self_referential_struct_through_pointer() {
        let data = decls("struct node { struct node *next; int v; };");
        let node = data.tags.get(&Ustr::from("node")).unwrap().ty.clone();
        let next = node.field(Ustr::from("next")).unwrap();
        assert!(crate::types::is_same(
            &next.ty.pointer_target().unwrap(),
            &node
        ));
        assert_eq!(next.offset, 0);
        assert_eq!(node.field(Ustr::from("v")).unwrap().offset, size_of::<usize>());
        assert_eq!(node.size() % node.align(), 0);
    }

    #[test]
    fn nested_declarators_bind_inside_out() {
        let t = ty("int(*)[5]");
        assert!(t.is_pointer());
        let inner = t.pointer_target().unwrap();
        assert_eq!(inner.array_length(), Some(5));
        assert_eq!(display_name(&t), "int32_t(*)[5]");

        let t = ty("int(*)(int, char)");
        let f = t.pointer_target().unwrap();
        assert!(f.is_func());
        assert_eq!(f.func_params().unwrap().len(), 2);
    }

    #[test]
    fn multidimensional_arrays_nest_left_to_right() {
        let t = ty("int[2][3]");
        assert_eq!(t.array_length(), Some(2));
        assert_eq!(t.array_elem().unwrap().array_length(), Some(3));
        assert_eq!(t.size(), 24);
    }

    #[test]
    fn function_parameters_decay() {
        let data = decls("void sort(int base[], unsigned long n);");
        let f = match data.symbols.get(&Ustr::from("sort")).unwrap() {
            Symbol::Function { ty, .. } => ty.clone(),
            other => panic!("unexpected {other:?}"),
        };
        let params = f.func_params().unwrap();
        assert!(params[0].is_pointer());
    }

    #[test]
    fn sole_void_parameter_means_empty_list() {
        let data = decls("int rand(void);");
        let f = match data.symbols.get(&Ustr::from("rand")).unwrap() {
            Symbol::Function { ty, .. } => ty.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert!(f.func_params().unwrap().is_empty());
        assert!(parse_decls("int bad(void, int);", None, false).is_err());
    }

    #[test]
    fn variadic_prototype_sets_the_flag() {
        let data = decls("int printf(const char *fmt, ...);");
        let f = match data.symbols.get(&Ustr::from("printf")).unwrap() {
            Symbol::Function { ty, .. } => ty.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert!(f.attr().contains(TypeAttr::VARIADIC));
        assert_eq!(f.func_params().unwrap().len(), 1);
    }

    #[test]
    fn const_char_pointer_carries_const_on_the_pointer() {
        let t = ty("const char*");
        assert!(t.is_pointer());
        assert!(t.attr().contains(TypeAttr::CONST));
        assert_eq!(
            t.pointer_target().unwrap().kind_id(),
            CTypeKind::Char
        );
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        assert!(matches!(
            parse_decls(
                "struct A { int x; } __attribute__((totally_unknown));",
                None,
                false
            ),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn aligned_attribute_raises_struct_alignment() {
        let data = decls("typedef struct A { char c; } __attribute__((aligned(8))) A;");
        let a = alias(&data, "A");
        assert_eq!(a.align(), 8);
        assert_eq!(a.size(), 8);
    }

    #[test]
    fn mode_attribute_rewrites_the_int_kind() {
        let data = decls("typedef int __attribute__((mode(DI))) big;");
        assert_eq!(alias(&data, "big").size(), 8);
    }

    #[test]
    fn non_default_calling_convention_is_rejected() {
        assert!(matches!(
            parse_decls("int __attribute__((stdcall)) f(int);", None, false),
            Err(Error::UnsupportedAbi)
        ));
    }

    #[test]
    fn vla_only_inside_prototypes() {
        assert!(parse_decls("void f(int n, int arr[*]);", None, false).is_ok());
        assert!(parse_type_str("int[*]", None).is_err());
    }

    #[test]
    fn constant_expressions_fold_in_array_dimensions() {
        assert_eq!(ty("int[1 + 2 * 3]").array_length(), Some(7));
        assert_eq!(ty("int[sizeof(int)]").array_length(), Some(4));
        assert_eq!(ty("int[1 ? 2 : 3]").array_length(), Some(2));
        assert_eq!(ty("char[sizeof(\"abc\")]").array_length(), Some(4));
    }

    #[test]
    fn printed_names_reparse_to_the_same_type() {
        for decl in [
            "int32_t",
            "uint8_t*",
            "double[4]",
            "char(*)[8]",
            "const char*",
            "void(*)(int32_t, double)",
        ] {
            let t = ty(decl);
            let reparsed = ty(&display_name(&t));
            assert!(
                crate::types::is_same(&t, &reparsed),
                "{decl} printed as {}",
                display_name(&t)
            );
        }
    }

    #[test]
    fn incomplete_tag_cannot_be_declared_as_variable() {
        assert!(parse_decls("struct fwd; struct fwd x;", None, false).is_err());
        assert!(parse_decls("struct fwd; struct fwd *p;", None, false).is_ok());
    }

    #[test]
    fn undefined_type_reports_its_name() {
        match parse_decls("fancy_t x;", None, false) {
            Err(Error::UnknownType(n)) => assert_eq!(n, "fancy_t"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
