//! Hand-assembled sample modules.
//!
//! These stand in for the code generator: they emit machine code together
//! with the relocation records a compiler would produce and drive a
//! [`ModuleBuilder`] through a complete compilation. The CLI demo, the
//! integration tests and the benchmarks link and run them.
//!
//! Code conventions shared by both architectures:
//! - entry stubs are `extern "C" fn(argv: *mut u64) -> i32`; they pass
//!   `argv[0]` to the function, store its result back into `argv[0]` and
//!   return 1;
//! - functions take their argument in the first argument register and
//!   return in the first return register;
//! - every function starts with a profiling prologue that pushes a frame
//!   and falls into the fast entry, and ends with a reserved slot, the
//!   fast return, then the profiling epilogue.

use crate::config::HeapConfig;
use crate::error::LinkError;
use crate::jit::aarch64::{self, AArch64Assembler};
use crate::jit::backend::Arch;
use crate::jit::codebuf::CodeBuffer;
use crate::jit::memory::page_size;
use crate::jit::x86_64::{Cond, Reg, X86_64Assembler};
use crate::module::tables::{
    CallSite, CallSiteKind, CodeRange, CodeRangeKind, Coercion, FunctionOffsets, HeapAccess, Name,
    ReturnType, ViewType,
};
use crate::module::{Module, ModuleBuilder, RawValue, SourceExtent};
use crate::resolver::{Builtin, SymbolicAddress};

pub const IDENTITY_FILENAME: &str = "identity.js";

/// Exports `identity`, `peek` (reads the global `seed`) and `answer`.
pub const IDENTITY_SOURCE: &str = r#"function Identity(stdlib, foreign, heap) {
    "use asm";
    var seed = 7;
    function identity(x) { x = x | 0; return x | 0; }
    function peek(x) { x = x | 0; return seed | 0; }
    function answer(x) { x = x | 0; return 42; }
    return { identity: identity, peek: peek, answer: answer };
}"#;

pub const FULL_FILENAME: &str = "full.js";

/// Adds an import, a heap view, a math builtin and a function table to
/// the identity module. x86-64 only.
pub const FULL_SOURCE: &str = r#"function Full(stdlib, foreign, heap) {
    "use asm";
    var sin = stdlib.Math.sin, pi = stdlib.Math.PI;
    var report = foreign.report;
    var HEAP32 = new stdlib.Int32Array(heap);
    var seed = 7;
    function identity(x) { x = x | 0; return x | 0; }
    function twice(x) { x = x | 0; return (x + x) | 0; }
    function peek(x) { x = x | 0; return seed | 0; }
    function load(i) { i = i | 0; return HEAP32[i >> 2] | 0; }
    function callImport(x) { x = x | 0; return report(x | 0) | 0; }
    function sine(x) { x = +x; return +sin(x); }
    function dispatch(i) { i = i | 0; return table[i & 1](i) | 0; }
    var table = [identity, twice];
    return { identity: identity, peek: peek, load: load, callImport: callImport, sine: sine, dispatch: dispatch };
}"#;

const SEED: u64 = 7;
const ANSWER: u64 = 42;

fn entry_label(function: &str) -> String {
    format!("{}.entry", function)
}

/// Extent of `function`'s declaration relative to the module start.
fn function_extent(source: &str, function: &str) -> (u32, u32) {
    let needle = format!("function {}(", function);
    let start = source.find(&needle).unwrap_or(0);
    let end = source[start..]
        .find('\n')
        .map(|n| start + n)
        .unwrap_or(source.len());
    (start as u32, end as u32)
}

fn function_line(source: &str, function: &str) -> u32 {
    let (start, _) = function_extent(source, function);
    source[..start as usize].matches('\n').count() as u32 + 1
}

/// Line and column of the first `callee` call inside `function`.
fn call_position(source: &str, function: &str, callee: &str) -> (u32, u32) {
    let (start, end) = function_extent(source, function);
    let line_start = source[..start as usize].rfind('\n').map_or(0, |n| n + 1);
    let column = source[start as usize..end as usize]
        .find(callee)
        .map_or(0, |c| start as usize + c - line_start + 1);
    (function_line(source, function), column as u32)
}

fn call_site_at(return_at: u32, kind: CallSiteKind, (line, column): (u32, u32)) -> CallSite {
    CallSite::new(return_at, kind).with_position(line, column)
}

struct Emitter {
    buf: CodeBuffer,
    builder: ModuleBuilder,
    source: &'static str,
}

impl Emitter {
    fn new(arch: Arch, heap: &HeapConfig, filename: &str, source: &'static str) -> Self {
        let mut builder = ModuleBuilder::new(arch, heap);
        let body_start = source.find('{').map(|b| b + 1).unwrap_or(0);
        let close = source.rfind('}').unwrap_or(source.len());
        builder.set_source(SourceExtent {
            filename: filename.to_string(),
            src_start: 0,
            src_body_start: body_start as u32,
            strict: false,
        });
        builder.set_source_length(close as u32, source.len() as u32);
        builder.set_argument_names(
            Some(Name::new("stdlib")),
            Some(Name::new("foreign")),
            Some(Name::new("heap")),
        );
        Self {
            buf: CodeBuffer::with_capacity(arch, 2 * page_size()),
            builder,
            source,
        }
    }

    fn add_function(&mut self, name: &str, offsets: FunctionOffsets) -> Result<(), LinkError> {
        let line = function_line(self.source, name);
        self.builder.add_function(Name::new(name), line, offsets)
    }

    fn add_export(&mut self, name: &str, arg: Coercion, ret: ReturnType, stub: u32) {
        let index = self
            .builder
            .add_export(Name::new(name), Some(Name::new(name)), vec![arg], ret, stub);
        let (start, end) = function_extent(self.source, name);
        self.builder.set_export_source(index, start, end);
    }

    /// Pad the function bodies to a page boundary.
    fn end_function_bodies(&mut self) {
        self.buf.align(page_size());
        self.builder.finish_function_bodies(self.buf.offset());
    }

    fn finish(self) -> Result<Module, LinkError> {
        self.builder.finish(self.buf.finish()?)
    }

    // ==================== x86-64 ====================

    fn x64_function(
        &mut self,
        name: &str,
        body: impl FnOnce(&mut X86_64Assembler<'_>),
    ) -> Result<(), LinkError> {
        let mut a = X86_64Assembler::new(&mut self.buf);
        let begin = a.offset();
        a.push(Reg::Rbp);
        a.mov_rr(Reg::Rbp, Reg::Rsp);
        a.buf().define_label(&entry_label(name));
        let entry = a.offset();
        body(&mut a);
        let profiling_jump = a.nop2();
        a.ret();
        let profiling_epilogue = a.offset();
        a.pop(Reg::Rbp);
        let profiling_return = a.offset();
        a.ret();
        let end = a.offset();
        self.add_function(
            name,
            FunctionOffsets {
                begin,
                entry,
                profiling_jump,
                profiling_epilogue,
                profiling_return,
                end,
            },
        )
    }

    fn x64_entry_stub(&mut self, export: &str, arg: Coercion, ret: ReturnType) -> Result<(), LinkError> {
        let mut a = X86_64Assembler::new(&mut self.buf);
        let begin = a.offset();
        a.push(Reg::Rbx);
        a.mov_rr(Reg::Rbx, Reg::Rdi);
        a.mov_rm(Reg::Rdi, Reg::Rbx, 0);
        let return_at = a.call_label(&entry_label(export));
        a.buf()
            .record_call_site(CallSite::new(return_at, CallSiteKind::Relative));
        a.mov_mr(Reg::Rbx, 0, Reg::Rax);
        a.mov_r32_imm32(Reg::Rax, 1);
        a.pop(Reg::Rbx);
        a.ret();
        let end = a.offset();
        self.builder
            .add_code_range(CodeRange::new(CodeRangeKind::Entry, begin, end)?);
        self.add_export(export, arg, ret, begin);
        Ok(())
    }

    /// Frame, align the stack, call the address loaded by `target`, unwind.
    /// Returns the range's (begin, profiling return, end).
    fn x64_aligned_call(&mut self, target: impl FnOnce(&mut X86_64Assembler<'_>)) -> (u32, u32, u32) {
        let mut a = X86_64Assembler::new(&mut self.buf);
        let begin = a.offset();
        a.push(Reg::Rbp);
        a.mov_rr(Reg::Rbp, Reg::Rsp);
        a.and_ri32(Reg::Rsp, -16);
        target(&mut a);
        let return_at = a.call_r(Reg::Rax);
        a.buf()
            .record_call_site(CallSite::new(return_at, CallSiteKind::External));
        a.mov_rr(Reg::Rsp, Reg::Rbp);
        a.pop(Reg::Rbp);
        let profiling_return = a.offset();
        a.ret();
        (begin, profiling_return, a.offset())
    }

    /// Box the int32 argument and call the host's generic exit path.
    fn x64_interp_exit(&mut self, exit: u32) -> Result<u32, LinkError> {
        let mut a = X86_64Assembler::new(&mut self.buf);
        let begin = a.offset();
        a.push(Reg::Rbp);
        a.mov_rr(Reg::Rbp, Reg::Rsp);
        a.and_ri32(Reg::Rsp, -16);
        a.sub_ri32(Reg::Rsp, RawValue::SIZE as i32);
        a.mov_r32_r32(Reg::Rdi, Reg::Rdi);
        a.mov_mr(Reg::Rsp, 8, Reg::Rdi);
        a.mov_ri32(Reg::Rax, RawValue::TAG_INT32 as i32);
        a.mov_mr(Reg::Rsp, 0, Reg::Rax);
        a.mov_r32_imm32(Reg::Rdi, exit);
        a.mov_r32_imm32(Reg::Rsi, 1);
        a.mov_rr(Reg::Rdx, Reg::Rsp);
        let at = a.mov_ri64(Reg::Rax, -1);
        a.buf()
            .record_absolute_link(at, SymbolicAddress::InvokeExitToInt32);
        let return_at = a.call_r(Reg::Rax);
        a.buf()
            .record_call_site(CallSite::new(return_at, CallSiteKind::External));
        a.mov_rm(Reg::Rax, Reg::Rsp, 8);
        a.mov_rr(Reg::Rsp, Reg::Rbp);
        a.pop(Reg::Rbp);
        let profiling_return = a.offset();
        a.ret();
        let end = a.offset();
        self.builder.add_code_range(CodeRange::with_profiling_return(
            CodeRangeKind::InterpExit,
            begin,
            profiling_return,
            end,
        )?);
        Ok(begin)
    }

    /// Call the optimized code stored in the exit's callee word directly.
    fn x64_optimized_exit(&mut self, callee_word: u32) -> Result<u32, LinkError> {
        let (begin, profiling_return, end) = self.x64_aligned_call(|a| {
            let at = a.mov_r_rip(Reg::Rax);
            a.buf().record_global_access(at, callee_word);
        });
        self.builder.add_code_range(CodeRange::with_profiling_return(
            CodeRangeKind::OptimizedExit,
            begin,
            profiling_return,
            end,
        )?);
        Ok(begin)
    }

    fn x64_builtin_thunk(&mut self, builtin: Builtin) -> Result<(), LinkError> {
        let (begin, profiling_return, end) = self.x64_aligned_call(|a| {
            let at = a.mov_ri64(Reg::Rax, -1);
            a.buf().record_absolute_link(at, builtin.symbol());
        });
        self.builder
            .add_builtin_thunk(builtin, begin, profiling_return, end)
    }

    fn x64_interrupt_stub(&mut self) -> Result<(), LinkError> {
        let (begin, profiling_return, end) = self.x64_aligned_call(|a| {
            let at = a.mov_ri64(Reg::Rax, -1);
            a.buf()
                .record_absolute_link(at, SymbolicAddress::HandleExecutionInterrupt);
        });
        self.builder.add_code_range(CodeRange::with_profiling_return(
            CodeRangeKind::Interrupt,
            begin,
            profiling_return,
            end,
        )?);
        self.builder.set_interrupt_exit(begin);
        Ok(())
    }

    fn x64_identity_functions(&mut self, seed: u32) -> Result<(), LinkError> {
        self.x64_function("identity", |a| a.mov_r32_r32(Reg::Rax, Reg::Rdi))?;
        self.x64_function("peek", |a| {
            let at = a.mov_r_rip(Reg::Rax);
            a.buf().record_global_access(at, seed);
        })
    }

    // ==================== AArch64 ====================

    fn a64_function(
        &mut self,
        name: &str,
        body: impl FnOnce(&mut AArch64Assembler<'_>),
        pool: Option<(&str, u64)>,
    ) -> Result<(), LinkError> {
        use aarch64::Reg;
        let mut a = AArch64Assembler::new(&mut self.buf);
        let begin = a.offset();
        a.stp_pre(Reg::Fp, Reg::Lr, -16);
        a.buf().define_label(&entry_label(name));
        let entry = a.offset();
        body(&mut a);
        let profiling_jump = a.nop();
        a.ret();
        let profiling_epilogue = a.offset();
        a.ldp_post(Reg::Fp, Reg::Lr, 16);
        let profiling_return = a.offset();
        a.ret();
        // The pool lands after the return, inside the function's range.
        if let Some((label, value)) = pool {
            a.buf().flush_pool(label, &value.to_le_bytes());
        }
        let end = a.offset();
        self.add_function(
            name,
            FunctionOffsets {
                begin,
                entry,
                profiling_jump,
                profiling_epilogue,
                profiling_return,
                end,
            },
        )
    }

    fn a64_entry_stub(&mut self, export: &str) -> Result<(), LinkError> {
        use aarch64::Reg;
        let mut a = AArch64Assembler::new(&mut self.buf);
        let begin = a.offset();
        a.stp_pre(Reg::Fp, Reg::Lr, -16);
        a.stp_pre(Reg::X19, Reg::X20, -16);
        a.mov(Reg::X19, Reg::X0);
        a.ldr(Reg::X0, Reg::X19, 0);
        let return_at = a.bl_label(&entry_label(export));
        a.buf()
            .record_call_site(CallSite::new(return_at, CallSiteKind::Relative));
        a.str(Reg::X0, Reg::X19, 0);
        a.ldp_post(Reg::X19, Reg::X20, 16);
        a.ldp_post(Reg::Fp, Reg::Lr, 16);
        a.movz_w(Reg::X0, 1);
        a.ret();
        let end = a.offset();
        self.builder
            .add_code_range(CodeRange::new(CodeRangeKind::Entry, begin, end)?);
        self.add_export(export, Coercion::Int32, ReturnType::Int32, begin);
        Ok(())
    }
}

/// The identity module for `arch`: no imports, no heap view.
pub fn identity_module(arch: Arch, heap: &HeapConfig) -> Result<Module, LinkError> {
    let mut e = Emitter::new(arch, heap, IDENTITY_FILENAME, IDENTITY_SOURCE);
    let seed = e
        .builder
        .add_global_var(Name::new("seed"), Coercion::Int32, Some(SEED))?;
    e.builder.start_function_bodies();

    match arch {
        Arch::X64 => {
            e.x64_identity_functions(seed)?;
            e.x64_function("answer", |a| a.mov_r32_imm32(Reg::Rax, ANSWER as u32))?;
            e.end_function_bodies();
            for export in ["identity", "peek", "answer"] {
                e.x64_entry_stub(export, Coercion::Int32, ReturnType::Int32)?;
            }
        }
        Arch::AArch64 => {
            use aarch64::Reg;
            e.a64_function("identity", |a| a.sxtw(Reg::X0, Reg::X0), None)?;
            e.a64_function(
                "peek",
                |a| {
                    // Absolute address of `seed` in an inline literal.
                    a.ldr_literal(Reg::X16, "peek.seed");
                    a.ldr(Reg::X0, Reg::X16, 0);
                    a.b_label("peek.loaded");
                    a.buf().align(8);
                    a.buf().define_label("peek.seed");
                    let at = a.offset();
                    a.buf().emit_u64(0);
                    a.buf().record_global_access(at, seed);
                    a.buf().define_label("peek.loaded");
                },
                None,
            )?;
            e.a64_function(
                "answer",
                |a| {
                    a.ldr_literal(Reg::X0, "answer.pool");
                },
                Some(("answer.pool", ANSWER)),
            )?;
            e.end_function_bodies();
            for export in ["identity", "peek", "answer"] {
                e.a64_entry_stub(export)?;
            }
        }
        Arch::X86 => return Err(LinkError::UnsupportedArch(arch)),
    }
    e.finish()
}

/// The full sample: an import called through an exit, a bounds-checked
/// heap load, `Math.sin` through a builtin thunk and a function-pointer
/// table. x86-64 only.
pub fn full_module(arch: Arch, heap: &HeapConfig) -> Result<Module, LinkError> {
    if arch != Arch::X64 {
        return Err(LinkError::UnsupportedArch(arch));
    }
    let mut e = Emitter::new(arch, heap, FULL_FILENAME, FULL_SOURCE);
    e.builder.add_math_builtin(Name::new("sin"), Builtin::SinD);
    e.builder.add_constant(Name::new("pi"), std::f64::consts::PI);
    let report = e.builder.add_ffi(Name::new("report"));
    e.builder.add_array_view(Name::new("HEAP32"), ViewType::Int32);
    let seed = e
        .builder
        .add_global_var(Name::new("seed"), Coercion::Int32, Some(SEED))?;
    let exit = e.builder.add_exit(report);
    let exit_slot = e
        .builder
        .exit_global_data_offset(exit)
        .ok_or_else(|| LinkError::Codegen("exit without global data".into()))?;
    let table = e
        .builder
        .add_func_ptr_table(vec![entry_label("identity"), entry_label("twice")]);
    let explicit_checks = !e.builder.uses_signal_handlers();

    e.x64_identity_functions(seed)?;
    e.x64_function("twice", |a| {
        a.mov_r32_r32(Reg::Rax, Reg::Rdi);
        a.add_r32_r32(Reg::Rax, Reg::Rax);
    })?;
    e.x64_function("load", |a| {
        a.mov_r32_r32(Reg::Rdi, Reg::Rdi);
        a.and_ri32(Reg::Rdi, -4);
        let check = explicit_checks.then(|| {
            let at = a.cmp_r32_imm32(Reg::Rdi, 0);
            a.jcc_short_label(Cond::Ae, "load.oob");
            at
        });
        let at = a.mov_r_rip(Reg::Rax);
        a.buf().record_global_access(at, 0);
        let access = a.mov_r32_base_index(Reg::Rax, Reg::Rax, Reg::Rdi);
        let record = HeapAccess::new(access);
        match check {
            Some(check) => {
                a.buf().record_heap_access(record.with_length_check(check));
                a.jmp_short_label("load.done");
                a.buf().define_label("load.oob");
                a.xor_r32_r32(Reg::Rax, Reg::Rax);
                a.buf().define_label("load.done");
            }
            None => a.buf().record_heap_access(record),
        }
    })?;
    let report_call = call_position(FULL_SOURCE, "callImport", "report(");
    let sin_call = call_position(FULL_SOURCE, "sine", "sin(");
    let table_call = call_position(FULL_SOURCE, "dispatch", "table[");
    e.x64_function("callImport", |a| {
        let at = a.mov_r_rip(Reg::Rax);
        a.buf().record_global_access(at, exit_slot);
        let return_at = a.call_r(Reg::Rax);
        a.buf()
            .record_call_site(call_site_at(return_at, CallSiteKind::External, report_call));
    })?;
    e.x64_function("sine", |a| {
        a.push(Reg::Rbp);
        a.mov_rr(Reg::Rbp, Reg::Rsp);
        a.and_ri32(Reg::Rsp, -16);
        a.movq_xmm_r64(0, Reg::Rdi);
        let at = a.mov_ri64(Reg::Rax, -1);
        a.buf().record_absolute_link(at, SymbolicAddress::SinD);
        let return_at = a.call_r(Reg::Rax);
        a.buf()
            .record_call_site(call_site_at(return_at, CallSiteKind::External, sin_call));
        a.movq_r64_xmm(Reg::Rax, 0);
        a.mov_rr(Reg::Rsp, Reg::Rbp);
        a.pop(Reg::Rbp);
    })?;
    e.x64_function("dispatch", |a| {
        a.mov_r32_r32(Reg::Rdi, Reg::Rdi);
        a.mov_r32_r32(Reg::Rcx, Reg::Rdi);
        a.and_ri32(Reg::Rcx, 1);
        let at = a.lea_r_rip(Reg::Rax);
        a.buf().record_global_access(at, table);
        a.mov_rm_index8(Reg::Rax, Reg::Rax, Reg::Rcx);
        let return_at = a.call_r(Reg::Rax);
        a.buf()
            .record_call_site(call_site_at(return_at, CallSiteKind::Register, table_call));
    })?;
    e.end_function_bodies();

    for export in ["identity", "peek", "load", "callImport", "dispatch"] {
        e.x64_entry_stub(export, Coercion::Int32, ReturnType::Int32)?;
    }
    e.x64_entry_stub("sine", Coercion::Double, ReturnType::Double)?;
    let interp = e.x64_interp_exit(exit)?;
    let optimized = e.x64_optimized_exit(exit_slot + 8)?;
    e.builder.set_exit_offsets(exit, interp, optimized)?;
    e.x64_builtin_thunk(Builtin::SinD)?;
    e.x64_interrupt_stub()?;
    e.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::tables::NO_OFFSET;

    #[test]
    fn test_function_extent_and_line() {
        let (start, end) = function_extent(IDENTITY_SOURCE, "peek");
        assert!(IDENTITY_SOURCE[start as usize..end as usize].starts_with("function peek("));
        assert!(IDENTITY_SOURCE[start as usize..end as usize].ends_with('}'));
        assert_eq!(function_line(IDENTITY_SOURCE, "identity"), 4);
        assert_eq!(function_line(FULL_SOURCE, "dispatch"), 13);
    }

    #[test]
    fn test_identity_module_tables() {
        for arch in [Arch::X64, Arch::AArch64] {
            let module = identity_module(arch, &HeapConfig::default()).unwrap();
            assert_eq!(module.exports().len(), 3);
            assert_eq!(module.header().function_bytes as usize, page_size());
            assert_eq!(module.code_ranges().iter().filter(|r| r.is_function()).count(), 3);
            assert_eq!(module.names().len(), 3);
            assert_eq!(module.header().src_length_with_right_brace as usize, IDENTITY_SOURCE.len());
            assert_eq!(module.static_link_data().relative_links.len(), arch_relative_links(arch));
        }
    }

    fn arch_relative_links(arch: Arch) -> usize {
        // The seed literal on AArch64; x86-64 reaches it PC-relative.
        if arch == Arch::AArch64 { 1 } else { 0 }
    }

    #[test]
    fn test_aarch64_pool_is_inside_answer() {
        let module = identity_module(Arch::AArch64, &HeapConfig::default()).unwrap();
        let answer = module.names().iter().position(|n| n.as_str() == "answer").unwrap() as u32;
        let range = module
            .code_ranges()
            .iter()
            .find(|r| r.name_index() == Some(answer))
            .unwrap();
        // ldp, ret, then the 8-byte pool
        assert_eq!(range.end, range.profiling_return + 4 + 8);
        let pool = range.profiling_return as usize + 4;
        assert_eq!(&module.code()[pool..pool + 8], &ANSWER.to_le_bytes());
    }

    #[test]
    fn test_full_module_tables() {
        let module = full_module(Arch::X64, &HeapConfig::default()).unwrap();
        assert_eq!(module.exports().len(), 6);
        assert_eq!(module.exits().len(), 1);
        assert_eq!(module.func_ptr_tables().len(), 1);
        assert_eq!(module.heap_accesses().len(), 1);
        assert!(module.builtin_thunk(Builtin::SinD).is_some());
        assert!(module.header().has_array_view);
        assert_ne!(module.static_link_data().interrupt_exit_offset, NO_OFFSET);
        // Two table elements, all global accesses are PC-relative.
        assert_eq!(module.static_link_data().relative_links.len(), 2);
        assert!(full_module(Arch::AArch64, &HeapConfig::default()).is_err());
        assert!(identity_module(Arch::X86, &HeapConfig::default()).is_err());
    }

    #[test]
    fn test_call_sites_carry_source_positions() {
        assert_eq!(call_position(FULL_SOURCE, "callImport", "report("), (11, 48));
        let module = full_module(Arch::X64, &HeapConfig::default()).unwrap();
        let lines: Vec<u32> = module
            .call_sites()
            .iter()
            .filter(|s| s.line != 0)
            .map(|s| s.line)
            .collect();
        assert_eq!(lines, vec![11, 12, 13]);
    }
}
