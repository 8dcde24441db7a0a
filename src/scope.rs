//! Scope directives, preloading and process-wide configuration.
//!
//! A loaded header may open with `#define FFI_SCOPE "name"` and
//! `#define FFI_LIB "path"`; both are scanned textually before the C parser
//! runs. During preload, parsed declarations merge into a named scope in
//! the process-wide registry with duplicate-definition reconciliation; a
//! file that fails to preload is skipped with a warning instead of
//! aborting startup. The registry is read-only once preloading finishes.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use parking_lot::RwLock;
use triomphe::Arc;

use crate::error::{Error, Result};
use crate::library::NativeLibrary;
use crate::types::{self, ScopeData, Symbol, Tag};
use crate::{Ffi, parser};

/// Process-wide switch for the whole engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Enable {
    /// Every entry point fails with [`Error::Disabled`].
    Off,
    #[default]
    On,
    /// `cdef`/`load` only work while preloading runs; preloaded scopes and
    /// data operations stay available.
    Preload,
}

#[derive(Debug, Clone, Default)]
pub struct FfiConfig {
    pub enable: Enable,
    /// Separator-delimited (`;` or `:`) list of files to parse at startup.
    pub preload: Option<String>,
}

lazy_static! {
    static ref CONFIG: RwLock<FfiConfig> = RwLock::new(FfiConfig::default());
    static ref SCOPES: RwLock<HashMap<String, Arc<ScopeData>>> = RwLock::new(HashMap::new());
    static ref PRELOADED_LIBS: RwLock<Vec<Arc<NativeLibrary>>> = RwLock::new(Vec::new());
}

static PRELOADING: AtomicBool = AtomicBool::new(false);

/// Sets the process-wide configuration. Call before [`initialize`].
pub fn configure(config: FfiConfig) {
    *CONFIG.write() = config;
}

pub(crate) fn config() -> FfiConfig {
    CONFIG.read().clone()
}

pub(crate) fn ensure_define_allowed() -> Result<()> {
    match config().enable {
        Enable::Off => Err(Error::Disabled),
        Enable::On => Ok(()),
        Enable::Preload => {
            if PRELOADING.load(Ordering::Relaxed) {
                Ok(())
            } else {
                Err(Error::Disabled)
            }
        }
    }
}

pub(crate) fn ensure_runtime_allowed() -> Result<()> {
    if config().enable == Enable::Off {
        Err(Error::Disabled)
    } else {
        Ok(())
    }
}

pub(crate) fn find_scope(name: &str) -> Option<Arc<ScopeData>> {
    SCOPES.read().get(name).cloned()
}

// ─── Directives ─────────────────────────────────────────────────────────────

/// Scans the `#define FFI_SCOPE` / `#define FFI_LIB` prologue of a loaded
/// file. Returns the remaining source and the two optional values.
pub(crate) fn parse_directives<'a>(
    filename: &str,
    mut code: &'a str,
) -> Result<(&'a str, Option<String>, Option<String>)> {
    let mut scope_name: Option<String> = None;
    let mut lib: Option<String> = None;
    let bad = |reason: String| Error::FileLoad {
        path: filename.to_string(),
        reason,
    };

    while code.starts_with('#') {
        let key = if code.strip_prefix("#define FFI_SCOPE")
            .is_some_and(|r| r.starts_with([' ', '\t']))
        {
            "FFI_SCOPE"
        } else if code
            .strip_prefix("#define FFI_LIB")
            .is_some_and(|r| r.starts_with([' ', '\t']))
        {
            "FFI_LIB"
        } else {
            break;
        };
        let rest = code["#define ".len() + key.len()..].trim_start_matches([' ', '\t']);
        let Some(rest) = rest.strip_prefix('"') else {
            return Err(bad(format!("bad {key} define")));
        };
        let slot = if key == "FFI_SCOPE" {
            &mut scope_name
        } else {
            &mut lib
        };
        if slot.is_some() {
            return Err(bad(format!("{key} defined twice")));
        }
        let Some(end) = rest.find('"') else {
            return Err(bad(format!("bad {key} define")));
        };
        let value = &rest[..end];
        if value.bytes().any(|b| b <= b' ') {
            return Err(bad(format!("bad {key} define")));
        }
        *slot = Some(value.to_string());
        let after = rest[end + 1..]
            .trim_start_matches([' ', '\t'])
            .trim_start_matches(['\r', '\n']);
        code = after;
    }
    Ok((code, scope_name, lib))
}

// ─── Loading and preloading ─────────────────────────────────────────────────

fn same_symbol(a: &Symbol, b: &Symbol) -> bool {
    match (a, b) {
        (
            Symbol::TypeAlias { ty: ta, is_const: ca },
            Symbol::TypeAlias { ty: tb, is_const: cb },
        ) => ca == cb && types::is_same(ta, tb),
        (Symbol::Const { value: va, .. }, Symbol::Const { value: vb, .. }) => va == vb,
        (
            Symbol::Variable { ty: ta, is_const: ca, .. },
            Symbol::Variable { ty: tb, is_const: cb, .. },
        ) => ca == cb && types::is_same(ta, tb),
        (Symbol::Function { ty: ta, .. }, Symbol::Function { ty: tb, .. }) => {
            types::is_same(ta, tb)
        }
        _ => false,
    }
}

fn same_tag(a: &Tag, b: &Tag) -> bool {
    a.kind == b.kind && types::is_same(&a.ty, &b.ty)
}

/// Merges freshly loaded declarations into the named scope. Identical
/// redefinitions reconcile silently; conflicting ones fail the file.
fn register_scope(name: &str, path: &str, data: ScopeData) -> Result<Arc<ScopeData>> {
    let mut scopes = SCOPES.write();
    let Some(old) = scopes.get(name) else {
        let arc = Arc::new(data);
        scopes.insert(name.to_string(), arc.clone());
        return Ok(arc);
    };

    for (k, sym) in &data.symbols {
        if let Some(o) = old.symbols.get(k)
            && !same_symbol(o, sym)
        {
            return Err(Error::FileLoad {
                path: path.to_string(),
                reason: format!("redefinition of '{k}'"),
            });
        }
    }
    for (k, tag) in &data.tags {
        if let Some(o) = old.tags.get(k)
            && !same_tag(o, tag)
        {
            return Err(Error::FileLoad {
                path: path.to_string(),
                reason: format!("redefinition of '{} {k}'", tag.kind.name()),
            });
        }
    }

    let mut merged = ScopeData {
        symbols: old.symbols.clone(),
        tags: old.tags.clone(),
    };
    for (k, v) in data.symbols {
        merged.symbols.entry(k).or_insert(v);
    }
    for (k, v) in data.tags {
        merged.tags.entry(k).or_insert(v);
    }
    let arc = Arc::new(merged);
    scopes.insert(name.to_string(), arc.clone());
    Ok(arc)
}

pub(crate) fn load_file(path: &str, preloading: bool) -> Result<Ffi> {
    let code = fs::read_to_string(path).map_err(|e| Error::FileLoad {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    let (rest, scope_name, lib_name) = parse_directives(path, &code)?;
    let mut data = parser::parse_decls(rest, None, preloading)?;

    let lib = match &lib_name {
        Some(l) => Some(Arc::new(NativeLibrary::open(l)?)),
        None => NativeLibrary::open_self().ok().map(Arc::new),
    };
    crate::resolve_symbols(&mut data, lib.as_deref())?;

    if preloading {
        let scope_name = scope_name.as_deref().unwrap_or("C");
        let scope = register_scope(scope_name, path, data)?;
        if let Some(lib) = &lib {
            // Preloaded symbols must outlive every request.
            PRELOADED_LIBS.write().push(lib.clone());
        }
        Ok(Ffi { scope, lib })
    } else {
        Ok(Ffi {
            scope: Arc::new(data),
            lib,
        })
    }
}

/// Preloads a separator-delimited list of header files into the shared
/// scope registry. A failing file is skipped with a warning; returns how
/// many files loaded.
pub fn preload(list: &str) -> usize {
    PRELOADING.store(true, Ordering::Relaxed);
    let mut loaded = 0;
    for path in list.split([';', ':']).filter(|p| !p.is_empty()) {
        match load_file(path, true) {
            Ok(_) => loaded += 1,
            Err(e) => log::warn!("FFI: failed pre-loading '{path}': {e}"),
        }
    }
    PRELOADING.store(false, Ordering::Relaxed);
    loaded
}

/// Runs the configured preload list. Call once at host startup.
pub fn initialize() {
    if let Some(list) = config().preload {
        preload(&list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_are_scanned_in_order() {
        let src = "#define FFI_SCOPE \"demo\"\n#define FFI_LIB \"libm.so.6\"\nint x;\n";
        let (rest, scope, lib) = parse_directives("t.h", src).unwrap();
        assert_eq!(scope.as_deref(), Some("demo"));
        assert_eq!(lib.as_deref(), Some("libm.so.6"));
        assert!(rest.starts_with("int x;"));
    }

    #[test]
    fn duplicate_directive_is_rejected() {
        let src = "#define FFI_SCOPE \"a\"\n#define FFI_SCOPE \"b\"\n";
        match parse_directives("t.h", src) {
            Err(Error::FileLoad { reason, .. }) => {
                assert!(reason.contains("defined twice"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unquoted_directive_is_rejected() {
        let src = "#define FFI_LIB libm.so\n";
        assert!(parse_directives("t.h", src).is_err());
    }

    #[test]
    fn unknown_hash_lines_stop_the_scan() {
        let src = "#include <stdio.h>\nint x;";
        let (rest, scope, lib) = parse_directives("t.h", src).unwrap();
        assert_eq!(rest, src);
        assert!(scope.is_none() && lib.is_none());
    }
}
