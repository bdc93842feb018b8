//! Error types for linking, heap binding, exit dispatch and the cache.

use thiserror::Error;

use crate::jit::backend::Arch;

/// Failures while building, linking or binding a module.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The OS refused to map the code region.
    #[error("failed to map {bytes} bytes of executable memory")]
    Allocation { bytes: usize },

    /// `mprotect` failed while toggling code protection.
    #[error("memory protection change failed")]
    Protection,

    /// The linear-memory buffer does not satisfy the module's length policy.
    #[error("invalid heap length {length} (module accepts {min}..={max})")]
    InvalidHeapLength { length: usize, min: usize, max: usize },

    /// The module elides bounds checks and the buffer has no guard pages
    /// to catch out-of-bounds accesses.
    #[error("heap of {length} bytes has no guard pages")]
    MissingGuardPages { length: usize },

    /// The module was driven through its lifecycle out of order.
    #[error("link state violation: {0}")]
    LinkState(&'static str),

    /// The code was generated for an architecture this operation cannot handle.
    #[error("unsupported architecture {0:?}")]
    UnsupportedArch(Arch),

    /// Relocation metadata from the code generator is inconsistent.
    #[error("code generator error: {0}")]
    Codegen(String),
}

/// Structural problems found while decoding a cache entry.
///
/// These never reach the embedder: lookups turn them into a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("corrupt cache entry: {0}")]
    Corrupt(&'static str),

    #[error("cache i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("source fingerprint compression failed")]
    Compression,

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Failures when calling into or out of generated code.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("module is not fully linked")]
    NotLinked,

    #[error("module code targets {0:?}, which is not the host architecture")]
    HostMismatch(Arch),

    #[error("no export at index {0}")]
    BadExport(u32),

    #[error("no exit at index {0}")]
    BadExit(u32),

    #[error("export expects {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },

    #[error("exit {0} has no bound callee")]
    Unbound(u32),

    #[error("generated code reported failure")]
    Trapped,

    #[error("callee failed: {0}")]
    Callee(String),
}
