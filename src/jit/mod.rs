//! Machine-code infrastructure shared by the linker:
//! - executable memory and the single patch path
//! - the code buffer handed over by the code generator
//! - per-architecture encoders and patch encodings

pub mod aarch64;
pub mod backend;
pub mod codebuf;
pub mod memory;
pub mod x86_64;

pub use backend::{Arch, CodeEmissionBackend, InstructionSet};
pub use codebuf::{CodeBuffer, FinishedCode, ReferenceSize};
pub use memory::{ExecutableMemory, Patch, Protection};
