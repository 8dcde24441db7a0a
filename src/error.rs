//! Error taxonomy surfaced to the embedding host.
//!
//! Parser errors carry the source line; resource errors carry the offending
//! name. The host maps these onto its own exception classes; the engine only
//! identifies the kind.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("FFI API is restricted by configuration")]
    Disabled,

    #[error("{msg} at line {line}")]
    Parse { line: u32, msg: String },

    #[error("undefined C type \"{0}\"")]
    UnknownType(String),

    #[error("redeclaration of \"{0}\"")]
    Redeclaration(String),

    #[error("incompatible assignment to {dst} from {src}")]
    IncompatibleAssignment { dst: String, src: String },

    #[error("passing incompatible argument {index} of C function: expected {expected}, got {actual}")]
    IncompatiblePass {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("cannot instantiate C data of zero size")]
    ZeroSize,

    #[error("NULL pointer dereference")]
    NullDeref,

    #[error("C array index out of bounds")]
    OutOfBounds,

    #[error("C data is not a C string")]
    NonCString,

    #[error("unsupported calling convention")]
    UnsupportedAbi,

    #[error("cannot return type {0}")]
    UnsupportedReturn(String),

    #[error("cannot pass argument of type {0}")]
    UnsupportedPass(String),

    #[error("attempt to assign an owned C pointer")]
    AssignOwnedPointer,

    #[error("incorrect number of arguments for C function, expected {expected}, got {got}")]
    WrongArgCount { expected: usize, got: usize },

    #[error("attempt to call non C function")]
    NotCallable,

    #[error("comparison of incompatible C types")]
    CompareIncompatible,

    #[error("use after free")]
    UseAfterFree,

    #[error("attempt to assign read-only location")]
    AssignToConst,

    #[error("attempt to free owned C data")]
    FreeOwned,

    #[error("attempt to access field \"{0}\" of non C struct/union")]
    NotAStruct(String),

    #[error("attempt to access element of non C array")]
    NotAnArray,

    #[error("C data is not a pointer")]
    NotAPointer,

    #[error("attempt to access undefined field \"{0}\" of C struct/union")]
    UndefinedField(String),

    #[error("undefined C symbol \"{0}\"")]
    UndefinedSymbol(String),

    #[error("failed loading library '{0}'")]
    LibraryLoad(String),

    #[error("failed resolving C symbol '{0}'")]
    SymbolResolve(String),

    #[error("failed loading '{path}': {reason}")]
    FileLoad { path: String, reason: String },

    #[error("failed loading scope '{0}'")]
    UnknownScope(String),

    #[error("cannot prepare call interface")]
    CifPrep,
}

impl Error {
    pub(crate) fn parse(line: u32, msg: impl Into<String>) -> Self {
        Error::Parse {
            line,
            msg: msg.into(),
        }
    }
}
