//! Shared-library handle.
//!
//! Thin wrapper over the raw dlopen API: symbol names are data here, so the
//! typed wrapper-struct API is not applicable. `open_self` resolves against
//! the running process (the `RTLD_DEFAULT` analogue) and is used when a
//! `cdef` names no library.

use std::ffi::c_void;

use dlopen2::raw::Library;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct NativeLibrary {
    inner: Library,
    name: String,
}

impl NativeLibrary {
    pub fn open(path: &str) -> Result<Self> {
        log::debug!("opening native library '{path}'");
        Library::open(path)
            .map(|inner| NativeLibrary {
                inner,
                name: path.to_string(),
            })
            .map_err(|_| Error::LibraryLoad(path.to_string()))
    }

    /// Opens the running process itself for symbol lookup.
    pub fn open_self() -> Result<Self> {
        Library::open_self()
            .map(|inner| NativeLibrary {
                inner,
                name: "<self>".to_string(),
            })
            .map_err(|_| Error::LibraryLoad("<self>".to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self, name: &str) -> Result<*mut c_void> {
        // SAFETY: the address is treated as an opaque value; all typed use
        // goes through the type graph the caller declared.
        unsafe { self.inner.symbol::<*mut c_void>(name) }
            .map_err(|_| Error::SymbolResolve(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_self_resolves_libc_symbols() {
        let lib = NativeLibrary::open_self().unwrap();
        assert!(!lib.symbol("strlen").unwrap().is_null());
    }

    #[test]
    fn missing_library_reports_its_name() {
        match NativeLibrary::open("libdoes-not-exist-cdef.so") {
            Err(Error::LibraryLoad(name)) => {
                assert!(name.contains("does-not-exist"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
