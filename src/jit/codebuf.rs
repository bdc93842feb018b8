//! Code buffer filled by the code generator.
//!
//! Besides the instruction bytes, the buffer collects everything the
//! linker needs to turn them into a module: labels, call sites, heap
//! accesses, absolute and module-relative patch requests, and literal
//! pools. All recorded offsets are raw emission offsets; pools are spliced
//! in by [`CodeBuffer::finish`], and the returned [`CodeEmissionBackend`]
//! maps raw offsets to their final position.

use std::collections::HashMap;

use super::backend::{Arch, CodeEmissionBackend, FlatOffsets, PooledOffsets};
use super::memory::align_up;
use crate::error::LinkError;
use crate::module::tables::{CallSite, HeapAccess, RelativeLinkKind};
use crate::resolver::SymbolicAddress;

/// Size of a reference to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSize {
    /// 32-bit displacement relative to the end of the field (x86 call/jmp/jcc).
    Rel32,
    /// 8-bit displacement relative to the end of the field (x86 short jumps).
    Rel8,
    /// 26-bit word offset in a B/BL instruction.
    AArch64Branch,
    /// 19-bit word offset in an LDR-literal or B.cond instruction.
    AArch64Literal,
}

/// A word that must hold the absolute address of a label once linked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLabel {
    pub patch_at: u32,
    pub target: String,
    pub kind: RelativeLinkKind,
}

/// A global-data access whose address operand must be fixed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalAccess {
    pub patch_at: u32,
    pub global_data_offset: u32,
}

/// A buffer for building machine code and its relocation metadata.
pub struct CodeBuffer {
    arch: Arch,
    code: Vec<u8>,
    labels: HashMap<String, u32>,
    forward_refs: Vec<(u32, String, ReferenceSize)>,
    /// (raw insertion offset, pool bytes), in emission order
    pools: Vec<(u32, Vec<u8>)>,
    /// Pool start labels, by index into `pools`.
    pool_labels: HashMap<String, usize>,
    call_sites: Vec<CallSite>,
    heap_accesses: Vec<HeapAccess>,
    absolute_links: Vec<(u32, SymbolicAddress)>,
    code_labels: Vec<CodeLabel>,
    global_accesses: Vec<GlobalAccess>,
}

/// Output of [`CodeBuffer::finish`]: final bytes plus raw-offset metadata.
pub struct FinishedCode {
    pub arch: Arch,
    pub bytes: Vec<u8>,
    pub emission: Box<dyn CodeEmissionBackend>,
    pub labels: HashMap<String, u32>,
    pub call_sites: Vec<CallSite>,
    pub heap_accesses: Vec<HeapAccess>,
    pub absolute_links: Vec<(u32, SymbolicAddress)>,
    /// (patch_at, raw target offset, kind)
    pub code_labels: Vec<(u32, u32, RelativeLinkKind)>,
    pub global_accesses: Vec<GlobalAccess>,
}

impl FinishedCode {
    /// Final offset of a label defined while emitting.
    pub fn label(&self, name: &str) -> Option<u32> {
        self.labels
            .get(name)
            .map(|&raw| self.emission.finalize_offset(raw))
    }
}

impl CodeBuffer {
    pub fn new(arch: Arch) -> Self {
        Self::with_capacity(arch, 0)
    }

    pub fn with_capacity(arch: Arch, capacity: usize) -> Self {
        Self {
            arch,
            code: Vec::with_capacity(capacity),
            labels: HashMap::new(),
            forward_refs: Vec::new(),
            pools: Vec::new(),
            pool_labels: HashMap::new(),
            call_sites: Vec::new(),
            heap_accesses: Vec::new(),
            absolute_links: Vec::new(),
            code_labels: Vec::new(),
            global_accesses: Vec::new(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current raw offset.
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emit the all-ones placeholder left in absolute-link slots.
    pub fn emit_link_sentinel(&mut self) -> u32 {
        let at = self.offset();
        match self.arch.pointer_width() {
            4 => self.emit_u32(u32::MAX),
            _ => self.emit_u64(u64::MAX),
        }
        at
    }

    /// Define a label at the current position.
    pub fn define_label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.offset());
    }

    /// Raw offset of a label (if defined).
    pub fn get_label(&self, name: &str) -> Option<u32> {
        self.labels.get(name).copied()
    }

    /// Record a reference at `at` to be resolved against `label` by `finish`.
    /// For x86 sizes `at` is the displacement field; for AArch64 it is the
    /// instruction word, already emitted with a zero offset field.
    pub fn add_forward_ref(&mut self, at: u32, label: &str, size: ReferenceSize) {
        self.forward_refs.push((at, label.to_string(), size));
    }

    /// Emit a zeroed displacement field referencing `label`.
    pub fn emit_forward_ref(&mut self, label: &str, size: ReferenceSize) {
        let at = self.offset();
        self.add_forward_ref(at, label, size);
        match size {
            ReferenceSize::Rel8 => self.emit_u8(0),
            ReferenceSize::Rel32 => self.emit_u32(0),
            ReferenceSize::AArch64Branch | ReferenceSize::AArch64Literal => {
                panic!("AArch64 references are attached to an emitted instruction")
            }
        }
    }

    /// Splice a literal pool in at the current position. The pool does not
    /// occupy raw offsets; it shifts everything emitted after it. `label`
    /// names the first pool byte for literal loads.
    pub fn flush_pool(&mut self, label: &str, data: &[u8]) {
        assert!(
            !data.is_empty() && data.len() % 4 == 0,
            "pools hold whole words"
        );
        self.pool_labels.insert(label.to_string(), self.pools.len());
        self.pools.push((self.offset(), data.to_vec()));
    }

    /// Final offset of a label or pool label, given the emission mapping.
    fn resolve(&self, emission: &dyn CodeEmissionBackend, label: &str) -> Option<u32> {
        if let Some(&raw) = self.labels.get(label) {
            return Some(emission.finalize_offset(raw));
        }
        let &index = self.pool_labels.get(label)?;
        let before: usize = self.pools[..index].iter().map(|(_, p)| p.len()).sum();
        Some(self.pools[index].0 + before as u32)
    }

    fn pool_bytes(&self) -> usize {
        self.pools.iter().map(|(_, p)| p.len()).sum()
    }

    /// Pad so the next byte lands on a multiple of `alignment` in the final
    /// code (pools included).
    pub fn align(&mut self, alignment: usize) {
        let current = self.code.len() + self.pool_bytes();
        let padding = align_up(current, alignment) - current;
        let filler = match self.arch {
            Arch::X86 | Arch::X64 => 0xCC, // int3
            Arch::AArch64 => 0x00,         // udf
        };
        self.code.extend(std::iter::repeat_n(filler, padding));
    }

    pub fn record_call_site(&mut self, site: CallSite) {
        self.call_sites.push(site);
    }

    pub fn record_heap_access(&mut self, access: HeapAccess) {
        self.heap_accesses.push(access);
    }

    /// `patch_at` holds a pointer-width sentinel to replace with the
    /// resolved address of `target`.
    pub fn record_absolute_link(&mut self, patch_at: u32, target: SymbolicAddress) {
        self.absolute_links.push((patch_at, target));
    }

    /// `patch_at` must end up holding the absolute address of `target`.
    pub fn record_code_label(&mut self, patch_at: u32, target: &str, kind: RelativeLinkKind) {
        self.code_labels.push(CodeLabel {
            patch_at,
            target: target.to_string(),
            kind,
        });
    }

    pub fn record_global_access(&mut self, patch_at: u32, global_data_offset: u32) {
        self.global_accesses.push(GlobalAccess {
            patch_at,
            global_data_offset,
        });
    }

    /// Get the raw code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Splice pools, resolve forward references in final coordinates and
    /// hand the result to the linker.
    pub fn finish(self) -> Result<FinishedCode, LinkError> {
        let emission: Box<dyn CodeEmissionBackend> = match self.arch {
            Arch::AArch64 => Box::new(PooledOffsets::new(
                self.pools
                    .iter()
                    .map(|(at, p)| (*at, p.len() as u32))
                    .collect(),
            )),
            Arch::X86 | Arch::X64 => {
                if !self.pools.is_empty() {
                    return Err(LinkError::Codegen("literal pools on x86".into()));
                }
                Box::new(FlatOffsets)
            }
        };

        let mut bytes = Vec::with_capacity(self.code.len() + self.pool_bytes());
        let mut cursor = 0usize;
        for (at, pool) in &self.pools {
            bytes.extend_from_slice(&self.code[cursor..*at as usize]);
            bytes.extend_from_slice(pool);
            cursor = *at as usize;
        }
        bytes.extend_from_slice(&self.code[cursor..]);

        for (at, label, size) in &self.forward_refs {
            let target_final = self
                .resolve(emission.as_ref(), label)
                .ok_or_else(|| LinkError::Codegen(format!("undefined label: {}", label)))?
                as i64;
            let at_final = emission.finalize_offset(*at) as i64;
            patch_reference(&mut bytes, at_final as usize, target_final - at_final, *size)
                .map_err(|e| LinkError::Codegen(format!("{} (label {})", e, label)))?;
        }

        let mut code_labels = Vec::with_capacity(self.code_labels.len());
        for label in self.code_labels {
            let target = *self
                .labels
                .get(&label.target)
                .ok_or_else(|| LinkError::Codegen(format!("undefined label: {}", label.target)))?;
            code_labels.push((label.patch_at, target, label.kind));
        }

        Ok(FinishedCode {
            arch: self.arch,
            bytes,
            emission,
            labels: self.labels,
            call_sites: self.call_sites,
            heap_accesses: self.heap_accesses,
            absolute_links: self.absolute_links,
            code_labels,
            global_accesses: self.global_accesses,
        })
    }
}

/// Write a resolved displacement. `delta` is `target - at` in final offsets.
fn patch_reference(
    code: &mut [u8],
    at: usize,
    delta: i64,
    size: ReferenceSize,
) -> Result<(), &'static str> {
    match size {
        ReferenceSize::Rel32 => {
            let rel = delta - 4;
            if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
                return Err("relative offset out of range");
            }
            code[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        ReferenceSize::Rel8 => {
            let rel = delta - 1;
            if !(-128..=127).contains(&rel) {
                return Err("short jump out of range");
            }
            code[at] = rel as i8 as u8;
        }
        ReferenceSize::AArch64Branch => {
            let words = delta / 4;
            if !(-(1 << 25)..(1 << 25)).contains(&words) {
                return Err("branch offset out of range");
            }
            let inst = read_u32(code, at);
            let new_inst = (inst & 0xFC00_0000) | ((words as u32) & 0x03FF_FFFF);
            code[at..at + 4].copy_from_slice(&new_inst.to_le_bytes());
        }
        ReferenceSize::AArch64Literal => {
            let words = delta / 4;
            if !(-(1 << 18)..(1 << 18)).contains(&words) {
                return Err("literal offset out of range");
            }
            let inst = read_u32(code, at);
            let new_inst = (inst & !(0x7FFFF << 5)) | (((words as u32) & 0x7FFFF) << 5);
            code[at..at + 4].copy_from_slice(&new_inst.to_le_bytes());
        }
    }
    Ok(())
}

fn read_u32(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new(Arch::X64);
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 7);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_labels() {
        let mut buf = CodeBuffer::new(Arch::X64);
        buf.emit_u8(0x90);
        buf.define_label("test");
        buf.emit_u8(0x90);

        assert_eq!(buf.get_label("test"), Some(1));
    }

    #[test]
    fn test_alignment() {
        let mut buf = CodeBuffer::new(Arch::X64);
        buf.emit_u8(0x90);
        buf.align(4);

        assert_eq!(buf.code(), &[0x90, 0xCC, 0xCC, 0xCC]);
    }

    #[test]
    fn test_rel32_forward_ref() {
        let mut buf = CodeBuffer::new(Arch::X64);
        buf.emit_u8(0xE8);
        buf.emit_forward_ref("target", ReferenceSize::Rel32);
        buf.emit_u8(0x90);
        buf.define_label("target");
        buf.emit_u8(0xC3);

        let done = buf.finish().unwrap();
        // call lands 1 byte past the end of the displacement
        assert_eq!(&done.bytes[1..5], &1i32.to_le_bytes());
        assert_eq!(done.label("target"), Some(6));
    }

    #[test]
    fn test_undefined_label() {
        let mut buf = CodeBuffer::new(Arch::X64);
        buf.emit_u8(0xEB);
        buf.emit_forward_ref("nowhere", ReferenceSize::Rel8);
        assert!(matches!(buf.finish(), Err(LinkError::Codegen(_))));
    }

    #[test]
    fn test_pools_shift_later_offsets() {
        let mut buf = CodeBuffer::new(Arch::AArch64);
        // b over the pool to "after"
        let at = buf.offset();
        buf.emit_u32(0x1400_0000);
        buf.add_forward_ref(at, "after", ReferenceSize::AArch64Branch);
        let ldr_at = buf.offset();
        buf.emit_u32(0x5800_0000);
        buf.add_forward_ref(ldr_at, "pool", ReferenceSize::AArch64Literal);
        buf.flush_pool("pool", &[0xAA; 8]);
        buf.define_label("after");
        buf.emit_u32(0xD65F_03C0);

        let done = buf.finish().unwrap();
        assert_eq!(done.bytes.len(), 20);
        assert_eq!(&done.bytes[8..16], &[0xAA; 8]);
        assert_eq!(done.label("after"), Some(16));
        // 16 bytes forward = 4 words
        assert_eq!(read_u32(&done.bytes, 0), 0x1400_0004);
        // ldr at 4 reads the pool at 8: one word forward
        assert_eq!(read_u32(&done.bytes, 4), 0x5800_0000 | (1 << 5));
        assert_eq!(done.emission.finalize_offset(8), 16);
    }

    #[test]
    fn test_align_counts_pools() {
        let mut buf = CodeBuffer::new(Arch::AArch64);
        buf.emit_u32(0xD503_201F);
        buf.flush_pool("p", &[0; 8]);
        buf.align(16);
        assert_eq!(buf.len() + 8, 16);
    }

    #[test]
    fn test_pools_rejected_on_x86() {
        let mut buf = CodeBuffer::new(Arch::X64);
        buf.flush_pool("p", &[0; 4]);
        assert!(buf.finish().is_err());
    }
}
