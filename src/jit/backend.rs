//! Architecture seams.
//!
//! The linker core never matches on the target architecture. Everything
//! encoding-specific sits behind two traits:
//!
//! - [`CodeEmissionBackend`] maps the offsets the code generator recorded
//!   while emitting to their final position in the copied code (they only
//!   differ when the generator splices literal pools in after the fact);
//! - [`InstructionSet`] reads and rewrites the handful of instruction forms
//!   the linker patches (calls, profiling jumps, bounds checks).

use serde::Serialize;

use crate::error::LinkError;

use super::aarch64::AArch64Patcher;
use super::memory::{ExecutableMemory, Patch};
use super::x86_64::X86Patcher;

/// Target architecture of a module's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum Arch {
    /// 32-bit x86: heap accesses embed the absolute heap address.
    X86 = 1,
    /// x86-64: heap accesses are register-based, globals RIP-relative.
    X64 = 2,
    AArch64 = 3,
}

impl Arch {
    /// Number of low bits of the machine CPU id holding the arch tag.
    pub const TAG_BITS: u32 = 3;

    /// The architecture this process runs on, if code can be generated for it.
    pub fn host() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X64)
        } else if cfg!(target_arch = "x86") {
            Some(Arch::X86)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::AArch64)
        } else {
            None
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Arch> {
        match tag {
            1 => Some(Arch::X86),
            2 => Some(Arch::X64),
            3 => Some(Arch::AArch64),
            _ => None,
        }
    }

    /// Width of an embedded absolute address.
    pub fn pointer_width(self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::X64 | Arch::AArch64 => 8,
        }
    }

    /// Value the code generator leaves in absolute-link slots.
    pub fn link_sentinel(self) -> u64 {
        match self.pointer_width() {
            4 => u32::MAX as u64,
            _ => u64::MAX,
        }
    }

    /// Whether global-data accesses are PC-relative and can be fixed at
    /// finish time instead of becoming relative links.
    pub fn pc_relative_globals(self) -> bool {
        matches!(self, Arch::X64)
    }

    /// Whether heap accesses embed the heap base address, so attaching a
    /// heap rewrites them and detaching must undo that.
    pub fn heap_base_in_code(self) -> bool {
        matches!(self, Arch::X86)
    }

    /// Whether out-of-bounds heap accesses can be caught by guard pages.
    pub fn supports_guard_pages(self) -> bool {
        matches!(self, Arch::X64 | Arch::AArch64)
    }

    pub fn instruction_set(self) -> &'static dyn InstructionSet {
        static X86: X86Patcher = X86Patcher { arch: Arch::X86 };
        static X64: X86Patcher = X86Patcher { arch: Arch::X64 };
        static AARCH64: AArch64Patcher = AArch64Patcher;
        match self {
            Arch::X86 => &X86,
            Arch::X64 => &X64,
            Arch::AArch64 => &AARCH64,
        }
    }
}

/// Maps offsets recorded during emission to final code offsets.
pub trait CodeEmissionBackend {
    fn finalize_offset(&self, raw: u32) -> u32;
}

/// Offsets are final as emitted (x86, x86-64).
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatOffsets;

impl CodeEmissionBackend for FlatOffsets {
    fn finalize_offset(&self, raw: u32) -> u32 {
        raw
    }
}

/// Offsets shift by the literal pools spliced in before them (AArch64).
#[derive(Debug, Default, Clone)]
pub struct PooledOffsets {
    /// (raw insertion offset, pool size), sorted by insertion offset.
    pools: Vec<(u32, u32)>,
}

impl PooledOffsets {
    pub fn new(mut pools: Vec<(u32, u32)>) -> Self {
        pools.sort_by_key(|&(at, _)| at);
        Self { pools }
    }
}

impl CodeEmissionBackend for PooledOffsets {
    fn finalize_offset(&self, raw: u32) -> u32 {
        let shift: u32 = self
            .pools
            .iter()
            .take_while(|&&(at, _)| at <= raw)
            .map(|&(_, size)| size)
            .sum();
        raw + shift
    }
}

/// Encoding-specific reads and rewrites of linked code.
///
/// Methods take the image read-only and return the [`Patch`] to apply, so
/// all writes funnel through [`ExecutableMemory::apply_patch`]. Reads that
/// find an instruction in an unexpected state fail instead of patching.
pub trait InstructionSet: Sync {
    fn arch(&self) -> Arch;

    /// Offset targeted by the direct call whose return address is `return_at`.
    fn call_target(&self, mem: &ExecutableMemory, return_at: u32) -> Result<u32, LinkError>;

    /// Retarget the direct call whose return address is `return_at`.
    fn retarget_call(&self, mem: &ExecutableMemory, return_at: u32, target: u32) -> Patch;

    /// Toggle the reserved epilogue slot at `jump_at` between a no-op and a
    /// jump to `epilogue_at`. Fails unless the slot holds the opposite state.
    fn profiling_jump(
        &self,
        mem: &ExecutableMemory,
        jump_at: u32,
        epilogue_at: u32,
        enabled: bool,
    ) -> Result<Patch, LinkError>;

    /// Rewrite the bounds-check immediate at `check_at` to `heap_length`.
    fn length_check(&self, mem: &ExecutableMemory, check_at: u32, heap_length: u32) -> Patch;

    /// Point the PC-relative global-data access at `patch_at` to `target`.
    /// Only targets with [`Arch::pc_relative_globals`] encode these.
    fn pc_relative_global(
        &self,
        _mem: &ExecutableMemory,
        _patch_at: u32,
        _target: u32,
    ) -> Result<Patch, LinkError> {
        Err(LinkError::UnsupportedArch(self.arch()))
    }

    /// Shift the absolute heap address embedded at `disp_at` by `delta`.
    /// Only targets with [`Arch::heap_base_in_code`] embed one.
    fn rebase_heap_access(
        &self,
        _mem: &ExecutableMemory,
        _disp_at: u32,
        _delta: i64,
    ) -> Result<Patch, LinkError> {
        Err(LinkError::UnsupportedArch(self.arch()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_offsets() {
        assert_eq!(FlatOffsets.finalize_offset(0), 0);
        assert_eq!(FlatOffsets.finalize_offset(1234), 1234);
    }

    #[test]
    fn test_pooled_offsets_are_monotonic() {
        let pools = PooledOffsets::new(vec![(64, 16), (16, 8)]);
        assert_eq!(pools.finalize_offset(0), 0);
        assert_eq!(pools.finalize_offset(15), 15);
        assert_eq!(pools.finalize_offset(16), 24);
        assert_eq!(pools.finalize_offset(63), 71);
        assert_eq!(pools.finalize_offset(64), 88);
        let mut last = 0;
        for raw in 0..128 {
            let fin = pools.finalize_offset(raw);
            assert!(fin >= last);
            last = fin;
        }
    }

    #[test]
    fn test_arch_tags() {
        for arch in [Arch::X86, Arch::X64, Arch::AArch64] {
            assert_eq!(Arch::from_tag(arch.tag()), Some(arch));
            assert_eq!(arch.instruction_set().arch(), arch);
            assert!(arch.tag() < (1 << Arch::TAG_BITS));
        }
        assert_eq!(Arch::from_tag(0), None);
        assert_eq!(Arch::X86.link_sentinel(), 0xFFFF_FFFF);
    }
}
