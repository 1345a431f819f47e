//! Error taxonomy for the loader.
//!
//! Every failure aborts the load in progress. `ErrorKind` groups the variants
//! into the categories the CLI reports on.

use std::io;

use thiserror::Error;

/// Broad category of a [`LoadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unsupported binary layout.
    Format,
    /// The file could not be opened or read in full.
    Io,
    /// The operating system refused a memory request.
    Resource,
    /// The requested symbol is not defined by the image.
    SymbolNotFound,
    /// The call signature cannot be expressed by the invoker.
    Signature,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("malformed ELF image: {0}")]
    Format(String),

    #[error("unexpected {table} entry size: expected {expected} bytes, found {found}")]
    EntrySize {
        table: &'static str,
        expected: usize,
        found: u64,
    },

    #[error("{table} size {size:#x} is not a multiple of the entry size {entry_size}")]
    TableSize {
        table: &'static str,
        size: u64,
        entry_size: usize,
    },

    #[error("image has no loadable segments")]
    NoLoadableSegments,

    #[error("unsupported relocation type {r_type} at 0x{offset:x}")]
    UnsupportedRelocation { r_type: u32, offset: u64 },

    #[error("access of {len} bytes at 0x{vaddr:x} falls outside the image")]
    OutOfBounds { vaddr: u64, len: u64 },

    #[error("symbol `{name}` does not point into executable memory")]
    NotExecutable { name: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}")]
    Resource {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),

    #[error("cannot call a function with {0} arguments")]
    Arity(usize),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Format(_)
            | LoadError::EntrySize { .. }
            | LoadError::TableSize { .. }
            | LoadError::NoLoadableSegments
            | LoadError::UnsupportedRelocation { .. }
            | LoadError::OutOfBounds { .. }
            | LoadError::NotExecutable { .. } => ErrorKind::Format,
            LoadError::Io { .. } => ErrorKind::Io,
            LoadError::Resource { .. } => ErrorKind::Resource,
            LoadError::SymbolNotFound(_) => ErrorKind::SymbolNotFound,
            LoadError::Arity(_) => ErrorKind::Signature,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        LoadError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = LoadError> = std::result::Result<T, E>;
