//! AArch64 instruction encoding.
//!
//! The assembler covers the forms the AArch64 sample module uses.
//! [`AArch64Patcher`] implements the linker's patch encodings: BL
//! retargeting, the NOP / B profiling slot and MOVZ/MOVK bounds-check
//! immediates. Globals are reached through absolute literals, so there is
//! no PC-relative global patch.

use super::backend::{Arch, InstructionSet};
use super::codebuf::{CodeBuffer, ReferenceSize};
use super::memory::{ExecutableMemory, Patch};
use crate::error::LinkError;

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X16 = 16, X17 = 17,
    X19 = 19, X20 = 20,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / Zero register (XZR in some contexts)
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;

    pub fn code(self) -> u8 {
        self as u8
    }
}

const NOP: u32 = 0xD503201F;
const B: u32 = 0x14000000;
const BL: u32 = 0x94000000;
const MOVZ_W: u32 = 0x52800000;
const MOVK_W_LSL16: u32 = 0x72A00000;
const LDR_LITERAL_X: u32 = 0x58000000;

/// AArch64 assembler.
///
/// Methods whose instruction is later patched by the linker return its raw
/// offset (or, for calls, the return-address offset).
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
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

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    // ==================== Data Processing ====================

    /// ADD Xd, Xn, #imm12 (64-bit add immediate)
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        // 1001 0001 00ii iiii iiii iinn nnnd dddd
        let inst = 0x91000000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// ORR Xd, Xn, Xm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        // 1010 1010 000m mmmm 0000 00nn nnnd dddd
        let inst = 0xAA000000
            | ((rm.code() as u32) << 16)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MOV Xd, Xm (register to register)
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        // ORR Xd, XZR, Xm
        self.orr(rd, Reg::XZR, rm);
    }

    /// MOV Wd, #imm16
    pub fn movz_w(&mut self, rd: Reg, imm16: u16) {
        self.emit_raw(MOVZ_W | ((imm16 as u32) << 5) | (rd.code() as u32));
    }

    /// SXTW Xd, Wn
    pub fn sxtw(&mut self, rd: Reg, rn: Reg) {
        // SBFM Xd, Xn, #0, #31
        self.emit_raw(0x93407C00 | ((rn.code() as u32) << 5) | (rd.code() as u32));
    }

    /// Load a 32-bit heap length into `rd` as a MOVZ/MOVK pair the linker
    /// can rewrite. Returns the offset of the MOVZ.
    pub fn heap_length(&mut self, rd: Reg, length: u32) -> u32 {
        let at = self.buf.offset();
        self.emit_raw(MOVZ_W | ((length & 0xFFFF) << 5) | (rd.code() as u32));
        self.emit_raw(MOVK_W_LSL16 | ((length >> 16) << 5) | (rd.code() as u32));
        at
    }

    // ==================== Loads and Stores ====================

    /// LDR Xt, [Xn, #imm12] (load 64-bit, unsigned offset)
    pub fn ldr(&mut self, rt: Reg, rn: Reg, imm12: u16) {
        // 1111 1001 01ii iiii iiii iinn nnnt tttt
        // imm12 is scaled by 8 (bytes)
        let scaled = (imm12 / 8) as u32;
        let inst = 0xF9400000
            | ((scaled & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// STR Xt, [Xn, #imm12] (store 64-bit, unsigned offset)
    pub fn str(&mut self, rt: Reg, rn: Reg, imm12: u16) {
        // 1111 1001 00ii iiii iiii iinn nnnt tttt
        let scaled = (imm12 / 8) as u32;
        let inst = 0xF9000000
            | ((scaled & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// LDR Xt, label (PC-relative literal load). Returns the instruction
    /// offset.
    pub fn ldr_literal(&mut self, rt: Reg, label: &str) -> u32 {
        let at = self.buf.offset();
        self.emit_raw(LDR_LITERAL_X | rt.code() as u32);
        self.buf.add_forward_ref(at, label, ReferenceSize::AArch64Literal);
        at
    }

    // ==================== Branches ====================

    /// B label (unconditional branch)
    pub fn b_label(&mut self, label: &str) {
        let at = self.buf.offset();
        self.emit_raw(B);
        self.buf.add_forward_ref(at, label, ReferenceSize::AArch64Branch);
    }

    /// BL label (branch and link). Returns the return-address offset.
    pub fn bl_label(&mut self, label: &str) -> u32 {
        let at = self.buf.offset();
        self.emit_raw(BL);
        self.buf.add_forward_ref(at, label, ReferenceSize::AArch64Branch);
        self.buf.offset()
    }

    /// RET (return to link register)
    pub fn ret(&mut self) {
        self.emit_raw(0xD65F03C0);
    }

    // ==================== Stack operations ====================

    /// STP X1, X2, [SP, #imm]! (store pair with pre-index)
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA9800000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// LDP X1, X2, [SP], #imm (load pair with post-index)
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA8C00000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// NOP reserving room for a branch. Returns its offset.
    pub fn nop(&mut self) -> u32 {
        let at = self.buf.offset();
        self.emit_raw(NOP);
        at
    }
}

/// Patch encodings for AArch64.
#[derive(Debug)]
pub struct AArch64Patcher;

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as i64
}

fn imm26(from: u32, to: u32) -> u32 {
    let words = (to as i64 - from as i64) / 4;
    debug_assert!((-(1 << 25)..(1 << 25)).contains(&words), "branch out of range");
    (words as u32) & 0x03FF_FFFF
}

impl InstructionSet for AArch64Patcher {
    fn arch(&self) -> Arch {
        Arch::AArch64
    }

    fn call_target(&self, mem: &ExecutableMemory, return_at: u32) -> Result<u32, LinkError> {
        let bl_at = return_at
            .checked_sub(4)
            .ok_or(LinkError::LinkState("call site does not hold a direct call"))?;
        let inst = mem.read_u32(bl_at);
        if inst & 0xFC00_0000 != BL {
            return Err(LinkError::LinkState("call site does not hold a direct call"));
        }
        Ok((bl_at as i64 + sign_extend(inst & 0x03FF_FFFF, 26) * 4) as u32)
    }

    fn retarget_call(&self, _mem: &ExecutableMemory, return_at: u32, target: u32) -> Patch {
        let bl_at = return_at - 4;
        Patch::u32(bl_at, BL | imm26(bl_at, target))
    }

    fn profiling_jump(
        &self,
        mem: &ExecutableMemory,
        jump_at: u32,
        epilogue_at: u32,
        enabled: bool,
    ) -> Result<Patch, LinkError> {
        if epilogue_at <= jump_at || jump_at % 4 != 0 || jump_at as usize + 4 > mem.size() {
            return Err(LinkError::LinkState("profiling epilogue out of branch range"));
        }
        let branch = B | imm26(jump_at, epilogue_at);
        let (from, to) = if enabled { (NOP, branch) } else { (branch, NOP) };
        if mem.read_u32(jump_at) != from {
            return Err(LinkError::LinkState("profiling jump slot in wrong state"));
        }
        Ok(Patch::u32(jump_at, to))
    }

    fn length_check(&self, mem: &ExecutableMemory, check_at: u32, heap_length: u32) -> Patch {
        let keep = |inst: u32| inst & !(0xFFFF << 5);
        let movz = keep(mem.read_u32(check_at)) | ((heap_length & 0xFFFF) << 5);
        let movk = keep(mem.read_u32(check_at + 4)) | ((heap_length >> 16) << 5);
        Patch::u64(check_at, movz as u64 | ((movk as u64) << 32))
    }
}
