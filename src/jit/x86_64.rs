//! x86 / x86-64 instruction encoding.
//!
//! The assembler covers the forms the sample modules and trampolines use.
//! [`X86Patcher`] implements the linker's patch encodings, which are the
//! same for 32- and 64-bit code: rel32 calls, the two-byte profiling slot,
//! imm32 bounds checks and disp32 memory operands.

use super::backend::{Arch, InstructionSet};
use super::codebuf::{CodeBuffer, ReferenceSize};
use super::memory::{ExecutableMemory, Patch};
use crate::error::LinkError;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0, // Return value
    Rcx = 1, // 4th argument
    Rdx = 2, // 3rd argument
    Rbx = 3, // Callee-saved
    Rsp = 4, // Stack pointer
    Rbp = 5, // Frame pointer
    Rsi = 6, // 2nd argument
    Rdi = 7, // 1st argument
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11, // Scratch for indirect jumps
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Get the REX.B bit for this register (when used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// Get the REX.X bit for this register (when used as SIB index).
    pub fn rex_x(self) -> u8 {
        if self.needs_rex_ext() { 0x02 } else { 0x00 }
    }

    /// Get the REX.R bit for this register (when used as reg).
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }
}

/// Condition codes used by bounds checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
}

/// x86-64 assembler.
///
/// Methods whose operand is later patched by the linker return the raw
/// offset of that operand (or, for calls, of the return address).
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn offset(&self) -> u32 {
        self.buf.offset()
    }

    /// The underlying buffer, for labels and relocation records.
    pub fn buf(&mut self) -> &mut CodeBuffer {
        &mut *self.buf
    }

    // ==================== REX prefix helpers ====================

    /// Emit REX.W prefix for 64-bit operations.
    fn emit_rex_w(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x48 | reg.rex_r() | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Emit REX.W prefix for single register operations.
    fn emit_rex_w_single(&mut self, rm: Reg) {
        let rex = 0x48 | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Emit REX prefix if needed (without W bit).
    fn emit_rex_if_needed(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x40 | reg.rex_r() | rm.rex_b();
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    // ==================== ModR/M helpers ====================

    /// Encode ModR/M byte.
    /// mod: 2 bits, reg: 3 bits, rm: 3 bits
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// ModR/M (+SIB, +disp) for `[base + disp]`.
    fn emit_base_disp(&mut self, reg: Reg, base: Reg, disp: i32) {
        let needs_sib = base == Reg::Rsp || base == Reg::R12;
        let rm = if needs_sib { 0b100 } else { base.code() };
        if disp == 0 && base != Reg::Rbp && base != Reg::R13 {
            self.buf.emit_u8(Self::modrm(0b00, reg.code(), rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.buf.emit_u8(Self::modrm(0b01, reg.code(), rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u8(disp as u8);
        } else {
            self.buf.emit_u8(Self::modrm(0b10, reg.code(), rm));
            if needs_sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u32(disp as u32);
        }
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64 (register to register)
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r32, r32 (zero-extends to 64-bit)
    pub fn mov_r32_r32(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_if_needed(src, dst);
        self.buf.emit_u8(0x89); // MOV r/m32, r32
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64. Returns the offset of the immediate, which the
    /// linker may overwrite with an absolute address.
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) -> u32 {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code()); // MOV r64, imm64
        let at = self.buf.offset();
        self.buf.emit_u64(imm as u64);
        at
    }

    /// MOV r64, imm32 (sign-extended 32-bit immediate to register)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xC7); // MOV r/m64, imm32
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r32, imm32 (zero-extended)
    pub fn mov_r32_imm32(&mut self, dst: Reg, imm: u32) {
        if dst.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u32(imm);
    }

    /// MOV r64, [r64 + disp] (load from memory)
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x8B); // MOV r64, r/m64
        self.emit_base_disp(dst, base, disp);
    }

    /// MOV [r64 + disp], r64 (store to memory)
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_rex_w(src, base);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.emit_base_disp(src, base, disp);
    }

    /// MOV r32, [base + index] (linear-memory load). Returns the offset of
    /// the instruction.
    pub fn mov_r32_base_index(&mut self, dst: Reg, base: Reg, index: Reg) -> u32 {
        assert!(base != Reg::Rbp && base != Reg::R13, "base needs a displacement");
        let at = self.buf.offset();
        let rex = 0x40 | dst.rex_r() | index.rex_x() | base.rex_b();
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
        self.buf.emit_u8(0x8B);
        self.buf.emit_u8(Self::modrm(0b00, dst.code(), 0b100));
        self.buf.emit_u8((index.code() << 3) | base.code()); // SIB, scale 1
        at
    }

    /// MOV r64, [base + index*8] (table load)
    pub fn mov_rm_index8(&mut self, dst: Reg, base: Reg, index: Reg) {
        assert!(base != Reg::Rbp && base != Reg::R13, "base needs a displacement");
        self.buf
            .emit_u8(0x48 | dst.rex_r() | index.rex_x() | base.rex_b());
        self.buf.emit_u8(0x8B);
        self.buf.emit_u8(Self::modrm(0b00, dst.code(), 0b100));
        self.buf
            .emit_u8(0xC0 | (index.code() << 3) | base.code()); // SIB, scale 8
    }

    /// LEA r64, [rip + disp32]. Returns the offset of the displacement.
    pub fn lea_r_rip(&mut self, dst: Reg) -> u32 {
        self.buf.emit_u8(0x48 | dst.rex_r());
        self.buf.emit_u8(0x8D);
        self.buf.emit_u8(Self::modrm(0b00, dst.code(), 0b101));
        let at = self.buf.offset();
        self.buf.emit_u32(0);
        at
    }

    /// MOV r64, [rip + disp32]. Returns the offset of the displacement.
    pub fn mov_r_rip(&mut self, dst: Reg) -> u32 {
        self.buf.emit_u8(0x48 | dst.rex_r());
        self.buf.emit_u8(0x8B);
        self.buf.emit_u8(Self::modrm(0b00, dst.code(), 0b101));
        let at = self.buf.offset();
        self.buf.emit_u32(0);
        at
    }

    /// MOVQ xmm, r64
    pub fn movq_xmm_r64(&mut self, xmm: u8, src: Reg) {
        self.buf.emit_u8(0x66);
        let rex = 0x48 | if xmm >= 8 { 0x04 } else { 0 } | src.rex_b();
        self.buf.emit_u8(rex);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.buf.emit_u8(Self::modrm(0b11, xmm, src.code()));
    }

    /// MOVQ r64, xmm
    pub fn movq_r64_xmm(&mut self, dst: Reg, xmm: u8) {
        self.buf.emit_u8(0x66);
        let rex = 0x48 | if xmm >= 8 { 0x04 } else { 0 } | dst.rex_b();
        self.buf.emit_u8(rex);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.buf.emit_u8(Self::modrm(0b11, xmm, dst.code()));
    }

    // ==================== Arithmetic Operations ====================

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83); // SUB r/m64, imm8
            self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81); // SUB r/m64, imm32
            self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// AND r64, imm32 (sign-extended)
    pub fn and_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83); // AND r/m64, imm8
            self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81); // AND r/m64, imm32
            self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// ADD r32, r32
    pub fn add_r32_r32(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_if_needed(src, dst);
        self.buf.emit_u8(0x01);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// XOR r32, r32
    pub fn xor_r32_r32(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_if_needed(src, dst);
        self.buf.emit_u8(0x31);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// CMP r32, imm32, always in the imm32 form so the immediate can be
    /// patched. Returns the offset of the immediate.
    pub fn cmp_r32_imm32(&mut self, dst: Reg, imm: u32) -> u32 {
        if dst.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x81); // CMP r/m32, imm32
        self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
        let at = self.buf.offset();
        self.buf.emit_u32(imm);
        at
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Control Flow ====================

    /// JMP rel8 to a label.
    pub fn jmp_short_label(&mut self, label: &str) {
        self.buf.emit_u8(0xEB);
        self.buf.emit_forward_ref(label, ReferenceSize::Rel8);
    }

    /// Jcc rel8 to a label.
    pub fn jcc_short_label(&mut self, cond: Cond, label: &str) {
        self.buf.emit_u8(0x70 + cond as u8);
        self.buf.emit_forward_ref(label, ReferenceSize::Rel8);
    }

    /// CALL rel32 to a label. Returns the return-address offset.
    pub fn call_label(&mut self, label: &str) -> u32 {
        self.buf.emit_u8(CALL_REL32);
        self.buf.emit_forward_ref(label, ReferenceSize::Rel32);
        self.buf.offset()
    }

    /// CALL r64 (indirect call through register). Returns the return-address
    /// offset.
    pub fn call_r(&mut self, reg: Reg) -> u32 {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // CALL r/m64
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
        self.buf.offset()
    }

    /// RET (return)
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// Two-byte NOP (66 90) reserving room for a short jump. Returns its
    /// offset.
    pub fn nop2(&mut self) -> u32 {
        let at = self.buf.offset();
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(0x90);
        at
    }
}

/// Patch encodings shared by x86 and x86-64.
#[derive(Debug)]
pub struct X86Patcher {
    pub(crate) arch: Arch,
}

const NOP2: [u8; 2] = [0x66, 0x90];
const JMP_REL8: u8 = 0xEB;
const CALL_REL32: u8 = 0xE8;

impl InstructionSet for X86Patcher {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn call_target(&self, mem: &ExecutableMemory, return_at: u32) -> Result<u32, LinkError> {
        let call_at = return_at
            .checked_sub(5)
            .ok_or(LinkError::LinkState("call site does not hold a direct call"))?;
        if mem.read_u8(call_at) != CALL_REL32 {
            return Err(LinkError::LinkState("call site does not hold a direct call"));
        }
        let rel = mem.read_u32(return_at - 4) as i32;
        Ok((return_at as i64 + rel as i64) as u32)
    }

    fn retarget_call(&self, _mem: &ExecutableMemory, return_at: u32, target: u32) -> Patch {
        let rel = target as i64 - return_at as i64;
        Patch::u32(return_at - 4, rel as i32 as u32)
    }

    fn profiling_jump(
        &self,
        mem: &ExecutableMemory,
        jump_at: u32,
        epilogue_at: u32,
        enabled: bool,
    ) -> Result<Patch, LinkError> {
        // rel8 is relative to the end of the two-byte jump.
        let imm = epilogue_at as i64 - jump_at as i64 - 2;
        if !(1..=127).contains(&imm) || jump_at as usize + 2 > mem.size() {
            return Err(LinkError::LinkState("profiling epilogue out of rel8 range"));
        }
        let jump = [JMP_REL8, imm as u8];
        let (from, to) = if enabled { (NOP2, jump) } else { (jump, NOP2) };
        if mem.bytes(jump_at as usize, 2) != from {
            return Err(LinkError::LinkState("profiling jump slot in wrong state"));
        }
        Ok(Patch::bytes(jump_at, &to))
    }

    fn length_check(&self, _mem: &ExecutableMemory, check_at: u32, heap_length: u32) -> Patch {
        Patch::u32(check_at, heap_length)
    }

    fn pc_relative_global(
        &self,
        _mem: &ExecutableMemory,
        patch_at: u32,
        target: u32,
    ) -> Result<Patch, LinkError> {
        let disp = target as i64 - (patch_at as i64 + 4);
        Ok(Patch::u32(patch_at, disp as i32 as u32))
    }

    fn rebase_heap_access(
        &self,
        mem: &ExecutableMemory,
        disp_at: u32,
        delta: i64,
    ) -> Result<Patch, LinkError> {
        let disp = mem.read_u32(disp_at);
        Ok(Patch::u32(disp_at, (disp as i64).wrapping_add(delta) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::memory::page_size;

    fn assemble(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new(Arch::X64);
        let mut asm = X86_64Assembler::new(&mut buf);
        f(&mut asm);
        buf.finish().unwrap().bytes
    }

    fn image(bytes: &[u8]) -> ExecutableMemory {
        let mut mem = ExecutableMemory::new(page_size()).unwrap();
        mem.write(0, bytes).unwrap();
        mem
    }

    #[test]
    fn test_mov_rr() {
        // MOV RAX, RBX = 48 89 D8
        assert_eq!(assemble(|a| a.mov_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
    }

    #[test]
    fn test_mov_ri64_returns_immediate_offset() {
        let mut buf = CodeBuffer::new(Arch::X64);
        let at = X86_64Assembler::new(&mut buf).mov_ri64(Reg::R11, -1);
        assert_eq!(at, 2);
        assert_eq!(&buf.code()[..2], &[0x49, 0xBB]);
        assert_eq!(&buf.code()[2..], &[0xFF; 8]);
    }

    #[test]
    fn test_push_pop() {
        let code = assemble(|a| {
            a.push(Reg::Rbx);
            a.push(Reg::R12);
            a.pop(Reg::R12);
            a.pop(Reg::Rbx);
        });
        assert_eq!(code, [0x53, 0x41, 0x54, 0x41, 0x5C, 0x5B]);
    }

    #[test]
    fn test_mov_rm_and_mr() {
        // MOV RDI, [RBX] = 48 8B 3B ; MOV [RBX], RAX = 48 89 03
        let code = assemble(|a| {
            a.mov_rm(Reg::Rdi, Reg::Rbx, 0);
            a.mov_mr(Reg::Rbx, 0, Reg::Rax);
        });
        assert_eq!(code, [0x48, 0x8B, 0x3B, 0x48, 0x89, 0x03]);
    }

    #[test]
    fn test_mov_rm_rsp_disp8() {
        // MOV RAX, [RSP+8] = 48 8B 44 24 08
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rax, Reg::Rsp, 8)),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
    }

    #[test]
    fn test_rip_relative() {
        // MOV RAX, [RIP+0] = 48 8B 05 00 00 00 00
        let mut buf = CodeBuffer::new(Arch::X64);
        let at = X86_64Assembler::new(&mut buf).mov_r_rip(Reg::Rax);
        assert_eq!(at, 3);
        assert_eq!(buf.code(), &[0x48, 0x8B, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn test_heap_load() {
        // MOV EAX, [RAX+RCX] = 8B 04 08
        assert_eq!(
            assemble(|a| {
                a.mov_r32_base_index(Reg::Rax, Reg::Rax, Reg::Rcx);
            }),
            [0x8B, 0x04, 0x08]
        );
    }

    #[test]
    fn test_frame_alignment_and_tables() {
        // AND RSP, -16 ; ADD EAX, EAX ; MOV RAX, [RAX+RDI*8] ; LEA RAX, [RIP+0]
        let code = assemble(|a| {
            a.and_ri32(Reg::Rsp, -16);
            a.add_r32_r32(Reg::Rax, Reg::Rax);
            a.mov_rm_index8(Reg::Rax, Reg::Rax, Reg::Rdi);
            a.lea_r_rip(Reg::Rax);
        });
        assert_eq!(
            code,
            [0x48, 0x83, 0xE4, 0xF0, 0x01, 0xC0, 0x48, 0x8B, 0x04, 0xF8, 0x48, 0x8D, 0x05, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_cmp_imm32_form() {
        // CMP EDI, 0 = 81 FF 00 00 00 00 (never the imm8 form)
        let mut buf = CodeBuffer::new(Arch::X64);
        let at = X86_64Assembler::new(&mut buf).cmp_r32_imm32(Reg::Rdi, 0);
        assert_eq!(at, 2);
        assert_eq!(buf.code(), &[0x81, 0xFF, 0, 0, 0, 0]);
    }

    #[test]
    fn test_movq() {
        // MOVQ XMM0, RAX = 66 48 0F 6E C0 ; MOVQ RAX, XMM0 = 66 48 0F 7E C0
        let code = assemble(|a| {
            a.movq_xmm_r64(0, Reg::Rax);
            a.movq_r64_xmm(Reg::Rax, 0);
        });
        assert_eq!(code, [0x66, 0x48, 0x0F, 0x6E, 0xC0, 0x66, 0x48, 0x0F, 0x7E, 0xC0]);
    }

    #[test]
    fn test_call_label_backwards() {
        let mut buf = CodeBuffer::new(Arch::X64);
        let ret_at = {
            let mut asm = X86_64Assembler::new(&mut buf);
            asm.ret();
            asm.buf.define_label("f");
            asm.ret();
            asm.call_label("f")
        };
        let code = buf.finish().unwrap().bytes;
        assert_eq!(ret_at, 7);
        // target 1 - return 7 = -6
        assert_eq!(&code[2..7], &[0xE8, 0xFA, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_retarget_call() {
        let patcher = Arch::X64.instruction_set();
        let mut code = vec![0xC3; 32];
        code[16] = 0xE8;
        code[17..21].copy_from_slice(&(-12i32).to_le_bytes());
        let mem = image(&code);
        assert_eq!(patcher.call_target(&mem, 21).unwrap(), 9);

        let patch = patcher.retarget_call(&mem, 21, 2);
        mem.apply_patch(&patch);
        assert_eq!(patcher.call_target(&mem, 21).unwrap(), 2);

        // No call opcode before the return address.
        assert!(matches!(patcher.call_target(&mem, 20), Err(LinkError::LinkState(_))));
        assert!(patcher.call_target(&mem, 3).is_err());
    }

    #[test]
    fn test_profiling_jump_roundtrip() {
        let patcher = Arch::X86.instruction_set();
        let mem = image(&[0x66, 0x90, 0x5D, 0xC3, 0x5D, 0xC3]);
        mem.apply_patch(&patcher.profiling_jump(&mem, 0, 4, true).unwrap());
        assert_eq!(mem.bytes(0, 2), &[0xEB, 0x02]);
        mem.apply_patch(&patcher.profiling_jump(&mem, 0, 4, false).unwrap());
        assert_eq!(mem.bytes(0, 2), &[0x66, 0x90]);
    }

    #[test]
    fn test_profiling_jump_wrong_state() {
        let patcher = Arch::X64.instruction_set();
        let mem = image(&[0x66, 0x90, 0x5D, 0xC3, 0x5D, 0xC3]);
        // Disabling a slot that holds the no-op.
        assert!(patcher.profiling_jump(&mem, 0, 4, false).is_err());
        // Slot bytes are neither state.
        assert!(patcher.profiling_jump(&mem, 2, 5, true).is_err());
        // Epilogue behind the slot, or beyond rel8.
        assert!(patcher.profiling_jump(&mem, 0, 1, true).is_err());
        assert!(patcher.profiling_jump(&mem, 0, 200, true).is_err());
        assert_eq!(mem.bytes(0, 2), &[0x66, 0x90]);
    }

    #[test]
    fn test_pc_relative_global() {
        let mem = image(&[0x48, 0x8B, 0x05, 0, 0, 0, 0]);
        let patch = Arch::X64
            .instruction_set()
            .pc_relative_global(&mem, 3, 0x1000)
            .unwrap();
        assert_eq!(patch.offset(), 3);
        assert_eq!(patch.data(), &(0x1000i32 - 7).to_le_bytes());
    }

    #[test]
    fn test_rebase_heap_access() {
        let patcher = Arch::X86.instruction_set();
        // MOV EAX, [ECX + 0x10]
        let mem = image(&[0x8B, 0x81, 0x10, 0, 0, 0]);
        mem.apply_patch(&patcher.rebase_heap_access(&mem, 2, 0x4000_0000).unwrap());
        assert_eq!(mem.read_u32(2), 0x4000_0010);
        mem.apply_patch(&patcher.rebase_heap_access(&mem, 2, -0x4000_0000).unwrap());
        assert_eq!(mem.read_u32(2), 0x10);
    }
}
