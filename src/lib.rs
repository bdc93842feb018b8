//! asmlink - link, run and cache ahead-of-time compiled asm.js modules
//!
//! This library takes the machine code and relocation tables produced for
//! an asm.js module, places them in executable memory, resolves the
//! module's references to host services, binds its linear-memory heap and
//! calls into it. Linked modules can be written to a persistent cache and
//! reloaded on a later run.

pub mod cache;
pub mod config;
pub mod deps;
pub mod error;
pub mod jit;
pub mod module;
pub mod resolver;
pub mod sample;

// Re-export commonly used types
pub use config::{BoundsChecks, HeapConfig, LinkConfig};
pub use error::{CacheError, CallError, LinkError};
pub use jit::Arch;
pub use module::{HeapBuffer, Module, ModuleBuilder, Value};
pub use resolver::{HostResolver, SymbolResolver};
