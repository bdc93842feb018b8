//! Incremental construction of a module's tables.
//!
//! The code generator declares globals first, then emits function bodies
//! while allocating exits and function-pointer tables, records code ranges
//! and exports with the raw offsets it emitted at, and finally hands its
//! [`FinishedCode`] to [`ModuleBuilder::finish`].

use std::collections::HashMap;

use super::Module;
use super::ModuleHeader;
use super::ModuleParts;
use super::symbols::{sort_call_sites, sort_code_ranges, sort_heap_accesses};
use super::tables::{
    AbsoluteLinks, CodeRange, Coercion, Exit, ExportedFunction, FuncPtrTable, FunctionOffsets,
    Global, GlobalKind, NO_OFFSET, Name, RelativeLink, RelativeLinkKind, ReturnType,
    StaticLinkData, ViewType,
};
use crate::config::HeapConfig;
use crate::error::LinkError;
use crate::jit::backend::Arch;
use crate::jit::codebuf::FinishedCode;
use crate::jit::memory::{align_up, page_size};
use crate::resolver::Builtin;

/// Global data starts with the heap base pointer.
const HEAP_DATUM_BYTES: u32 = 8;
const GLOBAL_VAR_BYTES: u32 = 8;
const FUNC_PTR_BYTES: u32 = 8;
const EXIT_DATUM_BYTES: u32 = 16;

/// Where the module came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceExtent {
    pub filename: String,
    /// Offset of the module function in the script source.
    pub src_start: u32,
    /// Offset of the first token after the module's opening brace.
    pub src_body_start: u32,
    pub strict: bool,
}

pub struct ModuleBuilder {
    arch: Arch,
    source: SourceExtent,
    src_length: u32,
    src_length_with_right_brace: u32,
    uses_signal_handlers: bool,
    min_heap_length: u64,
    max_heap_length: u64,
    argument_names: [Option<Name>; 3],
    globals: Vec<Global>,
    num_global_vars: u32,
    num_ffis: u32,
    has_array_view: bool,
    function_bodies_started: bool,
    table_and_exit_bytes: u32,
    exits: Vec<Exit>,
    exports: Vec<ExportedFunction>,
    func_ptr_tables: Vec<(FuncPtrTable, Vec<String>)>,
    names: Vec<Name>,
    code_ranges: Vec<CodeRange>,
    builtin_thunks: Vec<u32>,
    function_bytes: Option<u32>,
    interrupt_exit: u32,
    function_counts: u32,
}

impl ModuleBuilder {
    pub fn new(arch: Arch, heap: &HeapConfig) -> Self {
        Self {
            arch,
            source: SourceExtent::default(),
            src_length: 0,
            src_length_with_right_brace: 0,
            uses_signal_handlers: heap.bounds_checks.uses_signal_handlers(arch),
            min_heap_length: heap.min_length as u64,
            max_heap_length: heap.max_length as u64,
            argument_names: [None, None, None],
            globals: Vec::new(),
            num_global_vars: 0,
            num_ffis: 0,
            has_array_view: false,
            function_bodies_started: false,
            table_and_exit_bytes: 0,
            exits: Vec::new(),
            exports: Vec::new(),
            func_ptr_tables: Vec::new(),
            names: Vec::new(),
            code_ranges: Vec::new(),
            builtin_thunks: vec![NO_OFFSET; Builtin::COUNT],
            function_bytes: None,
            interrupt_exit: NO_OFFSET,
            function_counts: 0,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Whether heap accesses rely on guard pages instead of patched checks.
    pub fn uses_signal_handlers(&self) -> bool {
        self.uses_signal_handlers
    }

    pub fn set_source(&mut self, source: SourceExtent) {
        self.source = source;
    }

    /// Record where the module text ends, relative to `src_start`.
    pub fn set_source_length(&mut self, length: u32, length_with_right_brace: u32) {
        self.src_length = length;
        self.src_length_with_right_brace = length_with_right_brace;
    }

    /// Names of the module function's global, import and buffer formals.
    pub fn set_argument_names(&mut self, global: Option<Name>, import: Option<Name>, buffer: Option<Name>) {
        self.argument_names = [global, import, buffer];
    }

    // ==================== Globals ====================

    /// Declare a module variable. Returns its global-data offset.
    pub fn add_global_var(
        &mut self,
        name: Name,
        coercion: Coercion,
        init: Option<u64>,
    ) -> Result<u32, LinkError> {
        if self.function_bodies_started {
            return Err(LinkError::LinkState("global variable declared after function bodies"));
        }
        let index = self.num_global_vars;
        self.num_global_vars += 1;
        self.globals.push(Global {
            name: Some(name),
            kind: GlobalKind::Variable {
                index,
                coercion,
                init,
            },
        });
        Ok(HEAP_DATUM_BYTES + GLOBAL_VAR_BYTES * index)
    }

    /// Declare an imported function. Returns its import index.
    pub fn add_ffi(&mut self, name: Name) -> u32 {
        let ffi_index = self.num_ffis;
        self.num_ffis += 1;
        self.globals.push(Global {
            name: Some(name),
            kind: GlobalKind::Ffi { ffi_index },
        });
        ffi_index
    }

    pub fn add_array_view(&mut self, name: Name, view: ViewType) {
        self.has_array_view = true;
        self.globals.push(Global {
            name: Some(name),
            kind: GlobalKind::ArrayView { view },
        });
    }

    pub fn add_math_builtin(&mut self, name: Name, builtin: Builtin) {
        self.globals.push(Global {
            name: Some(name),
            kind: GlobalKind::MathBuiltin { builtin },
        });
    }

    pub fn add_constant(&mut self, name: Name, value: f64) {
        self.globals.push(Global {
            name: Some(name),
            kind: GlobalKind::Constant { value },
        });
    }

    /// Freeze the global variables. Exits and tables are laid out after
    /// them.
    pub fn start_function_bodies(&mut self) {
        self.function_bodies_started = true;
    }

    fn allocate_global_data(&mut self, bytes: u32) -> u32 {
        self.start_function_bodies();
        let offset =
            HEAP_DATUM_BYTES + GLOBAL_VAR_BYTES * self.num_global_vars + self.table_and_exit_bytes;
        self.table_and_exit_bytes += bytes;
        offset
    }

    pub fn global_data_bytes(&self) -> u32 {
        HEAP_DATUM_BYTES + GLOBAL_VAR_BYTES * self.num_global_vars + self.table_and_exit_bytes
    }

    // ==================== Exits and tables ====================

    /// Allocate an exit calling import `ffi_index`. Returns the exit index.
    pub fn add_exit(&mut self, ffi_index: u32) -> u32 {
        let global_data_offset = self.allocate_global_data(EXIT_DATUM_BYTES);
        self.exits.push(Exit {
            ffi_index,
            global_data_offset,
            interp_code_offset: NO_OFFSET,
            optimized_code_offset: NO_OFFSET,
        });
        (self.exits.len() - 1) as u32
    }

    /// Global-data offset of an exit's trampoline word; the callee word
    /// follows it.
    pub fn exit_global_data_offset(&self, exit_index: u32) -> Option<u32> {
        self.exits
            .get(exit_index as usize)
            .map(|e| e.global_data_offset)
    }

    pub fn set_exit_offsets(&mut self, exit_index: u32, interp: u32, optimized: u32) -> Result<(), LinkError> {
        let exit = self
            .exits
            .get_mut(exit_index as usize)
            .ok_or_else(|| LinkError::Codegen(format!("no exit {}", exit_index)))?;
        exit.interp_code_offset = interp;
        exit.optimized_code_offset = optimized;
        Ok(())
    }

    /// Allocate a table whose elements hold the addresses of `elems`
    /// (labels of function entries). Returns its global-data offset.
    pub fn add_func_ptr_table(&mut self, elems: Vec<String>) -> u32 {
        let num_elems = elems.len() as u32;
        let global_data_offset = self.allocate_global_data(FUNC_PTR_BYTES * num_elems);
        self.func_ptr_tables.push((
            FuncPtrTable {
                global_data_offset,
                num_elems,
            },
            elems,
        ));
        global_data_offset
    }

    // ==================== Code ====================

    /// Intern a function name. Returns its name index.
    pub fn add_name(&mut self, name: Name) -> u32 {
        if let Some(index) = self.names.iter().position(|n| *n == name) {
            return index as u32;
        }
        self.names.push(name);
        (self.names.len() - 1) as u32
    }

    pub fn add_function(&mut self, name: Name, line: u32, offsets: FunctionOffsets) -> Result<(), LinkError> {
        let name_index = self.add_name(name);
        self.code_ranges
            .push(CodeRange::function(name_index, line, offsets)?);
        Ok(())
    }

    /// Record an entry, inline, exit or interrupt range.
    pub fn add_code_range(&mut self, range: CodeRange) {
        self.code_ranges.push(range);
    }

    pub fn add_builtin_thunk(
        &mut self,
        builtin: Builtin,
        begin: u32,
        profiling_return: u32,
        end: u32,
    ) -> Result<(), LinkError> {
        self.code_ranges
            .push(CodeRange::thunk(builtin, begin, profiling_return, end)?);
        self.builtin_thunks[builtin.index()] = begin;
        Ok(())
    }

    /// Declare an export whose entry stub starts at raw offset
    /// `code_offset`. Returns the export index.
    pub fn add_export(
        &mut self,
        name: Name,
        field_name: Option<Name>,
        arg_coercions: Vec<Coercion>,
        return_type: ReturnType,
        code_offset: u32,
    ) -> u32 {
        self.exports.push(ExportedFunction {
            name,
            field_name,
            arg_coercions,
            return_type,
            code_offset,
            start_offset_in_module: 0,
            end_offset_in_module: 0,
        });
        (self.exports.len() - 1) as u32
    }

    /// Source extent of an export's function, relative to `src_start`.
    pub fn set_export_source(&mut self, export_index: u32, start: u32, end: u32) {
        if let Some(export) = self.exports.get_mut(export_index as usize) {
            export.start_offset_in_module = start;
            export.end_offset_in_module = end;
        }
    }

    /// Raw offset where function bodies end. It must land on a page
    /// boundary in the final code.
    pub fn finish_function_bodies(&mut self, raw_offset: u32) {
        self.function_bytes = Some(raw_offset);
    }

    pub fn set_interrupt_exit(&mut self, raw_offset: u32) {
        self.interrupt_exit = raw_offset;
    }

    pub fn add_function_counts(&mut self, count: u32) {
        self.function_counts += count;
    }

    /// Allocate the image, copy the code in and freeze every table in
    /// final offsets.
    pub fn finish(self, code: FinishedCode) -> Result<Module, LinkError> {
        if code.arch != self.arch {
            return Err(LinkError::Codegen(format!(
                "code for {:?} handed to a {:?} module",
                code.arch, self.arch
            )));
        }
        let FinishedCode {
            bytes,
            emission,
            labels,
            call_sites,
            heap_accesses,
            absolute_links,
            code_labels,
            global_accesses,
            ..
        } = code;
        let fin = |raw: u32| emission.finalize_offset(raw);
        let fin_opt = |raw: u32| if raw == NO_OFFSET { NO_OFFSET } else { fin(raw) };
        let label = |labels: &HashMap<String, u32>, name: &str| {
            labels
                .get(name)
                .map(|&raw| fin(raw))
                .ok_or_else(|| LinkError::Codegen(format!("undefined label: {}", name)))
        };

        let page = page_size();
        let code_bytes = align_up(bytes.len(), 8);
        let global_data_bytes = self.global_data_bytes();
        let total_bytes = align_up(code_bytes + global_data_bytes as usize, page);
        let function_bytes = fin(
            self.function_bytes
                .ok_or_else(|| LinkError::Codegen("end of function bodies not recorded".into()))?,
        );
        if function_bytes as usize % page != 0 || function_bytes as usize > bytes.len() {
            return Err(LinkError::Codegen(format!(
                "function bytes {} not page aligned within {} code bytes",
                function_bytes,
                bytes.len()
            )));
        }
        let to_u32 = |n: usize| {
            u32::try_from(n).map_err(|_| LinkError::Codegen(format!("module too large: {} bytes", n)))
        };
        let code_bytes = to_u32(code_bytes)?;
        let total_bytes = to_u32(total_bytes)?;

        let mut call_sites: Vec<_> = call_sites
            .into_iter()
            .map(|mut s| {
                s.return_address_offset = fin(s.return_address_offset);
                s
            })
            .collect();
        sort_call_sites(&mut call_sites)?;

        let mut heap_accesses: Vec<_> = heap_accesses
            .into_iter()
            .map(|mut a| {
                a.offset = fin(a.offset);
                a.length_check_at = fin_opt(a.length_check_at);
                a.base_disp_at = fin_opt(a.base_disp_at);
                a
            })
            .collect();
        sort_heap_accesses(&mut heap_accesses)?;

        let mut code_ranges = self.code_ranges;
        for range in &mut code_ranges {
            range.finalize(fin)?;
        }
        sort_code_ranges(&mut code_ranges)?;

        let mut exits = self.exits;
        for (i, exit) in exits.iter_mut().enumerate() {
            if exit.interp_code_offset == NO_OFFSET || exit.optimized_code_offset == NO_OFFSET {
                return Err(LinkError::Codegen(format!("exit {} has no trampolines", i)));
            }
            exit.interp_code_offset = fin(exit.interp_code_offset);
            exit.optimized_code_offset = fin(exit.optimized_code_offset);
        }

        let mut exports = self.exports;
        for export in &mut exports {
            export.code_offset = fin(export.code_offset);
        }

        let builtin_thunk_offsets: Vec<u32> = self.builtin_thunks.iter().map(|&o| fin_opt(o)).collect();

        let mut relative_links: Vec<RelativeLink> = code_labels
            .into_iter()
            .map(|(patch_at, target, kind)| RelativeLink {
                kind,
                patch_at: fin(patch_at),
                target: fin(target),
            })
            .collect();

        let mut func_ptr_tables = Vec::with_capacity(self.func_ptr_tables.len());
        for (table, elems) in self.func_ptr_tables {
            for (j, elem) in elems.iter().enumerate() {
                relative_links.push(RelativeLink {
                    kind: RelativeLinkKind::RawPointer,
                    patch_at: code_bytes + table.global_data_offset + FUNC_PTR_BYTES * j as u32,
                    target: label(&labels, elem)?,
                });
            }
            func_ptr_tables.push(table);
        }

        let mut pc_relative = Vec::new();
        for access in global_accesses {
            let patch_at = fin(access.patch_at);
            let target = code_bytes + access.global_data_offset;
            if self.arch.pc_relative_globals() {
                pc_relative.push((patch_at, target));
            } else {
                relative_links.push(RelativeLink {
                    kind: RelativeLinkKind::InstructionImmediate,
                    patch_at,
                    target,
                });
            }
        }

        let mut links = AbsoluteLinks::default();
        for (patch_at, symbol) in absolute_links {
            links.push(symbol, fin(patch_at));
        }

        // Builtin calls from function bodies are rerouted through thunks
        // while profiling, so every such builtin needs one.
        for builtin in Builtin::ALL {
            let has_function_caller = links.get(builtin.symbol()).iter().any(|&at| {
                super::symbols::find_code_range(&code_ranges, at).is_some_and(|r| r.is_function())
            });
            if has_function_caller && builtin_thunk_offsets[builtin.index()] == NO_OFFSET {
                return Err(LinkError::Codegen(format!("builtin {:?} has no thunk", builtin)));
            }
        }

        let header = ModuleHeader {
            arch: self.arch,
            function_bytes,
            code_bytes,
            total_bytes,
            global_data_bytes,
            num_global_vars: self.num_global_vars,
            num_ffis: self.num_ffis,
            min_heap_length: self.min_heap_length,
            max_heap_length: self.max_heap_length,
            src_start: self.source.src_start,
            src_body_start: self.source.src_body_start,
            src_length: self.src_length,
            src_length_with_right_brace: self.src_length_with_right_brace,
            strict: self.source.strict,
            has_array_view: self.has_array_view,
            uses_signal_handlers: self.uses_signal_handlers,
        };
        let [global_argument_name, import_argument_name, buffer_argument_name] = self.argument_names;
        let parts = ModuleParts {
            header,
            global_argument_name,
            import_argument_name,
            buffer_argument_name,
            globals: self.globals,
            exits,
            exports,
            call_sites,
            code_ranges,
            func_ptr_tables,
            builtin_thunk_offsets,
            names: self.names,
            heap_accesses,
            static_link_data: StaticLinkData {
                interrupt_exit_offset: fin_opt(self.interrupt_exit),
                relative_links,
                absolute_links: links,
            },
        };

        let mut code = bytes;
        code.resize(code_bytes as usize, 0);
        let mut module = Module::from_parts(parts, &code, self.source.filename)?;
        module.function_counts = self.function_counts;

        let isa = self.arch.instruction_set();
        for (patch_at, target) in pc_relative {
            let patch = isa.pc_relative_global(&module.image, patch_at, target)?;
            module.image.apply_patch(&patch);
        }

        log::debug!(
            "module {} finished: {} code bytes ({} in functions), {} global data bytes, {} mapped",
            module.id,
            code_bytes,
            function_bytes,
            global_data_bytes,
            total_bytes
        );
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::codebuf::CodeBuffer;
    use crate::module::tables::CodeRangeKind;
    use crate::resolver::SymbolicAddress;

    fn builder() -> ModuleBuilder {
        ModuleBuilder::new(Arch::X64, &HeapConfig::default())
    }

    #[test]
    fn test_global_data_layout() {
        let mut b = builder();
        assert_eq!(b.add_global_var("a".into(), Coercion::Int32, Some(1)).unwrap(), 8);
        assert_eq!(b.add_global_var("b".into(), Coercion::Double, None).unwrap(), 16);
        // Constants are folded into code and take no slot.
        b.add_constant("pi".into(), std::f64::consts::PI);
        let table = b.add_func_ptr_table(vec!["f".into(), "g".into()]);
        assert_eq!(table, 24);
        let exit = b.add_exit(0);
        assert_eq!(b.exit_global_data_offset(exit), Some(40));
        assert_eq!(b.global_data_bytes(), 56);
        assert!(b.add_global_var("c".into(), Coercion::Int32, None).is_err());
    }

    #[test]
    fn test_names_are_interned() {
        let mut b = builder();
        assert_eq!(b.add_name("f".into()), 0);
        assert_eq!(b.add_name("g".into()), 1);
        assert_eq!(b.add_name("f".into()), 0);
    }

    #[test]
    fn test_finish_requires_page_aligned_functions() {
        let mut buf = CodeBuffer::new(Arch::X64);
        buf.emit_bytes(&[0xC3; 16]);
        let mut b = builder();
        b.finish_function_bodies(16);
        assert!(b.finish(buf.finish().unwrap()).is_err());
    }

    #[test]
    fn test_finish_requires_exit_trampolines() {
        let mut buf = CodeBuffer::new(Arch::X64);
        buf.align(page_size());
        let mut b = builder();
        b.finish_function_bodies(buf.offset());
        b.add_exit(0);
        buf.emit_u8(0xC3);
        assert!(b.finish(buf.finish().unwrap()).is_err());
    }

    #[test]
    fn test_finish_builds_links() {
        let mut buf = CodeBuffer::new(Arch::X64);
        let mut b = builder();
        let table = b.add_func_ptr_table(vec!["stub".into()]);
        buf.align(page_size());
        b.finish_function_bodies(buf.offset());
        buf.define_label("stub");
        let begin = buf.offset();
        let abs = buf.emit_link_sentinel();
        buf.record_absolute_link(abs, SymbolicAddress::StackLimit);
        buf.emit_u8(0xC3);
        b.add_code_range(CodeRange::new(CodeRangeKind::Inline, begin, buf.offset()).unwrap());
        // A jump-table word pointing back at the stub.
        let word = buf.offset();
        buf.emit_u64(0);
        buf.record_code_label(word, "stub", RelativeLinkKind::RawPointer);

        let module = b.finish(buf.finish().unwrap()).unwrap();
        let header = module.header();
        assert_eq!(header.function_bytes as usize, page_size());
        assert_eq!(header.code_bytes % 8, 0);
        assert_eq!(header.total_bytes as usize % page_size(), 0);
        let links = &module.static_link_data().relative_links;
        assert_eq!(links.len(), 2);
        assert_eq!((links[0].patch_at, links[0].target), (word, begin));
        assert!(links[1].is_raw_pointer());
        assert_eq!(links[1].patch_at, header.code_bytes + table);
        assert_eq!(links[1].target, begin);
        assert_eq!(
            module.static_link_data().absolute_links.get(SymbolicAddress::StackLimit),
            &[abs]
        );
        assert!(module.interrupt_exit().is_none());
    }
}
