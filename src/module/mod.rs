//! A finished block of generated code and everything needed to run it.
//!
//! Lifecycle:
//! 1. [`ModuleBuilder::finish`] allocates the image, copies the code in and
//!    freezes the tables.
//! 2. [`Module::static_link`] patches module-relative and symbolic
//!    addresses and initializes the exit slots.
//! 3. [`Module::init_heap`] attaches linear memory.
//!
//! [`Module::restore_to_initial_state`] undoes 2 and 3 so the module can be
//! linked again; [`Module::try_clone`] produces an unlinked copy.

pub mod builder;
pub mod exits;
pub mod heap;
pub mod profiling;
pub mod protect;
pub mod symbols;
pub mod tables;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde::Serialize;

use crate::deps::{DependencyRegistry, ModuleId};
use crate::error::{CallError, LinkError};
use crate::jit::backend::Arch;
use crate::jit::memory::{ExecutableMemory, Patch};
use crate::resolver::{Builtin, SymbolResolver, SymbolicAddress};

pub use builder::{ModuleBuilder, SourceExtent};
pub use exits::{ExitCoercion, ExternalCallee, OptimizedCode, RawValue, Value, ValueType};
pub use heap::{HeapBuffer, HeapPolicy, is_valid_heap_length};
pub use protect::{InterruptGuard, InterruptLock, UnprotectScope};
use exits::{ActivationGuard, ExitSlots};
use tables::{
    CallSite, CodeRange, Coercion, ExportedFunction, Exit, FuncPtrTable, Global, GlobalKind,
    HeapAccess, NO_OFFSET, Name, ReturnType, StaticLinkData,
};

/// Size fields of a module. Written first in the cache format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleHeader {
    pub arch: Arch,
    /// Length of the function region, a multiple of the page size. This
    /// is the region protected while interrupting.
    pub function_bytes: u32,
    /// Length of all code, aligned to 8. Global data starts here.
    pub code_bytes: u32,
    /// Image length, a multiple of the page size.
    pub total_bytes: u32,
    pub global_data_bytes: u32,
    pub num_global_vars: u32,
    pub num_ffis: u32,
    pub min_heap_length: u64,
    pub max_heap_length: u64,
    pub src_start: u32,
    pub src_body_start: u32,
    pub src_length: u32,
    pub src_length_with_right_brace: u32,
    pub strict: bool,
    pub has_array_view: bool,
    pub uses_signal_handlers: bool,
}

/// The serializable contents of a module besides its code.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleParts {
    pub header: ModuleHeader,
    pub global_argument_name: Option<Name>,
    pub import_argument_name: Option<Name>,
    pub buffer_argument_name: Option<Name>,
    pub globals: Vec<Global>,
    pub exits: Vec<Exit>,
    pub exports: Vec<ExportedFunction>,
    pub call_sites: Vec<CallSite>,
    pub code_ranges: Vec<CodeRange>,
    pub func_ptr_tables: Vec<FuncPtrTable>,
    /// Thunk offset per [`Builtin`], or [`NO_OFFSET`].
    pub builtin_thunk_offsets: Vec<u32>,
    pub names: Vec<Name>,
    pub heap_accesses: Vec<HeapAccess>,
    pub static_link_data: StaticLinkData,
}

/// Table sizes, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSummary {
    pub id: ModuleId,
    pub header: ModuleHeader,
    pub exports: Vec<String>,
    pub exits: usize,
    pub globals: usize,
    pub call_sites: usize,
    pub code_ranges: usize,
    pub func_ptr_tables: usize,
    pub heap_accesses: usize,
    pub relative_links: usize,
    pub absolute_links: usize,
    pub statically_linked: bool,
    pub profiling_enabled: bool,
    pub size_bytes: usize,
}

pub struct Module {
    id: ModuleId,
    header: ModuleHeader,
    image: Arc<ExecutableMemory>,
    filename: String,
    global_argument_name: Option<Name>,
    import_argument_name: Option<Name>,
    buffer_argument_name: Option<Name>,
    globals: Vec<Global>,
    exits: Vec<Exit>,
    exports: Vec<ExportedFunction>,
    call_sites: Vec<CallSite>,
    code_ranges: Vec<CodeRange>,
    func_ptr_tables: Vec<FuncPtrTable>,
    builtin_thunk_offsets: Vec<u32>,
    names: Vec<Name>,
    heap_accesses: Vec<HeapAccess>,
    static_link_data: StaticLinkData,

    statically_linked: bool,
    /// Addresses from the last static link, by symbol index.
    resolved: [usize; SymbolicAddress::COUNT],
    heap: Option<Arc<HeapBuffer>>,
    exit_slots: Arc<ExitSlots>,
    callees: Vec<Option<Arc<dyn ExternalCallee>>>,
    profiling_enabled: bool,
    profiling_labels: Vec<String>,
    code_protected: AtomicBool,
    function_counts: u32,
}

impl Module {
    /// Allocate an image for `parts`, copy `code` in and build the module.
    /// The result is finished but not linked.
    pub(crate) fn from_parts(parts: ModuleParts, code: &[u8], filename: String) -> Result<Self, LinkError> {
        let header = parts.header;
        if code.len() != header.code_bytes as usize
            || header.code_bytes as u64 + header.global_data_bytes as u64 > header.total_bytes as u64
            || header.function_bytes > header.code_bytes
        {
            return Err(LinkError::Codegen(format!(
                "inconsistent module sizes: code {} of {}, global data {}, total {}",
                code.len(),
                header.code_bytes,
                header.global_data_bytes,
                header.total_bytes
            )));
        }
        if parts.builtin_thunk_offsets.len() != Builtin::COUNT {
            return Err(LinkError::Codegen("builtin thunk table has the wrong length".into()));
        }

        let mut image = ExecutableMemory::new(header.total_bytes as usize)?;
        image.write(0, code)?;
        let image = Arc::new(image);
        let exit_slots = Arc::new(ExitSlots::new(image.clone(), header.code_bytes, &parts.exits));
        let callees = vec![None; parts.exits.len()];

        Ok(Self {
            id: ModuleId::next(),
            header,
            image,
            filename,
            global_argument_name: parts.global_argument_name,
            import_argument_name: parts.import_argument_name,
            buffer_argument_name: parts.buffer_argument_name,
            globals: parts.globals,
            exits: parts.exits,
            exports: parts.exports,
            call_sites: parts.call_sites,
            code_ranges: parts.code_ranges,
            func_ptr_tables: parts.func_ptr_tables,
            builtin_thunk_offsets: parts.builtin_thunk_offsets,
            names: parts.names,
            heap_accesses: parts.heap_accesses,
            static_link_data: parts.static_link_data,
            statically_linked: false,
            resolved: [0; SymbolicAddress::COUNT],
            heap: None,
            exit_slots,
            callees,
            profiling_enabled: false,
            profiling_labels: Vec::new(),
            code_protected: AtomicBool::new(false),
            function_counts: 0,
        })
    }

    /// A copy of the tables.
    pub fn parts(&self) -> ModuleParts {
        ModuleParts {
            header: self.header,
            global_argument_name: self.global_argument_name.clone(),
            import_argument_name: self.import_argument_name.clone(),
            buffer_argument_name: self.buffer_argument_name.clone(),
            globals: self.globals.clone(),
            exits: self.exits.clone(),
            exports: self.exports.clone(),
            call_sites: self.call_sites.clone(),
            code_ranges: self.code_ranges.clone(),
            func_ptr_tables: self.func_ptr_tables.clone(),
            builtin_thunk_offsets: self.builtin_thunk_offsets.clone(),
            names: self.names.clone(),
            heap_accesses: self.heap_accesses.clone(),
            static_link_data: self.static_link_data.clone(),
        }
    }

    // ==================== Accessors ====================

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn arch(&self) -> Arch {
        self.header.arch
    }

    pub fn header(&self) -> &ModuleHeader {
        &self.header
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn base(&self) -> usize {
        self.image.address(0)
    }

    /// The code as it currently sits in the image, links applied.
    pub fn code(&self) -> &[u8] {
        self.image.bytes(0, self.header.code_bytes as usize)
    }

    pub fn exports(&self) -> &[ExportedFunction] {
        &self.exports
    }

    /// Index of the export named `name`.
    pub fn export_index(&self, name: &str) -> Option<u32> {
        self.exports
            .iter()
            .position(|e| e.name.as_str() == name)
            .map(|i| i as u32)
    }

    pub fn exits(&self) -> &[Exit] {
        &self.exits
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn names(&self) -> &[Name] {
        &self.names
    }

    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    pub fn code_ranges(&self) -> &[CodeRange] {
        &self.code_ranges
    }

    pub fn heap_accesses(&self) -> &[HeapAccess] {
        &self.heap_accesses
    }

    pub fn func_ptr_tables(&self) -> &[FuncPtrTable] {
        &self.func_ptr_tables
    }

    pub fn static_link_data(&self) -> &StaticLinkData {
        &self.static_link_data
    }

    pub fn argument_names(&self) -> [Option<&Name>; 3] {
        [
            self.global_argument_name.as_ref(),
            self.import_argument_name.as_ref(),
            self.buffer_argument_name.as_ref(),
        ]
    }

    pub fn builtin_thunk(&self, builtin: Builtin) -> Option<u32> {
        self.builtin_thunk_offsets
            .get(builtin.index())
            .copied()
            .filter(|&off| off != NO_OFFSET)
    }

    pub fn is_statically_linked(&self) -> bool {
        self.statically_linked
    }

    /// Image offset of a global-data offset.
    pub fn global_data_offset(&self, offset: u32) -> u32 {
        self.header.code_bytes + offset
    }

    /// Address the interrupt handler redirects interrupted code to.
    pub fn interrupt_exit(&self) -> Option<usize> {
        let offset = self.static_link_data.interrupt_exit_offset;
        (self.statically_linked && offset != NO_OFFSET).then(|| self.image.address(offset))
    }

    /// Instrumentation counters embed absolute addresses; such modules are
    /// never cached.
    pub fn add_function_counts(&mut self, count: u32) {
        self.function_counts += count;
    }

    pub fn num_function_counts(&self) -> u32 {
        self.function_counts
    }

    /// Bytes owned by the module: the image plus its tables.
    pub fn size_of(&self) -> usize {
        use std::mem::size_of;
        let names: usize = self.names.iter().map(|n| n.as_str().len()).sum();
        self.image.size()
            + self.globals.capacity() * size_of::<Global>()
            + self.exits.capacity() * size_of::<Exit>()
            + self.exports.capacity() * size_of::<ExportedFunction>()
            + self.call_sites.capacity() * size_of::<CallSite>()
            + self.code_ranges.capacity() * size_of::<CodeRange>()
            + self.func_ptr_tables.capacity() * size_of::<FuncPtrTable>()
            + self.builtin_thunk_offsets.capacity() * size_of::<u32>()
            + self.heap_accesses.capacity() * size_of::<HeapAccess>()
            + self.static_link_data.relative_links.capacity() * size_of::<tables::RelativeLink>()
            + self.static_link_data.absolute_links.len() * size_of::<u32>()
            + self.profiling_labels.iter().map(String::capacity).sum::<usize>()
            + names
    }

    pub fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            id: self.id,
            header: self.header,
            exports: self.exports.iter().map(|e| e.name.to_string()).collect(),
            exits: self.exits.len(),
            globals: self.globals.len(),
            call_sites: self.call_sites.len(),
            code_ranges: self.code_ranges.len(),
            func_ptr_tables: self.func_ptr_tables.len(),
            heap_accesses: self.heap_accesses.len(),
            relative_links: self.static_link_data.relative_links.len(),
            absolute_links: self.static_link_data.absolute_links.len(),
            statically_linked: self.statically_linked,
            profiling_enabled: self.profiling_enabled,
            size_bytes: self.size_of(),
        }
    }

    // ==================== Linking ====================

    /// Patch every relative and absolute link and point every exit at the
    /// interpreter trampoline. Fails without patching anything if an
    /// absolute-link slot does not hold the sentinel.
    pub fn static_link(&mut self, resolver: &dyn SymbolResolver) -> Result<(), LinkError> {
        if self.statically_linked {
            return Err(LinkError::LinkState("module is already statically linked"));
        }
        let arch = self.header.arch;
        let width = arch.pointer_width();
        let sentinel = arch.link_sentinel();

        for (_, offsets) in self.static_link_data.absolute_links.iter() {
            if offsets.iter().any(|&at| self.image.read_word(at, width) != sentinel) {
                return Err(LinkError::LinkState("absolute link slot already patched"));
            }
        }
        self.resolved = std::array::from_fn(|i| resolver.resolve(SymbolicAddress::ALL[i]));

        {
            let _scope = UnprotectScope::new(self)?;
            for link in &self.static_link_data.relative_links {
                let target = self.image.address(link.target) as u64 & sentinel;
                self.image.apply_patch(&Patch::word(link.patch_at, target, width));
            }
            for (symbol, offsets) in self.static_link_data.absolute_links.iter() {
                let target = self.resolved[symbol.index()] as u64 & sentinel;
                for &at in offsets {
                    self.image.apply_patch(&Patch::word(at, target, width));
                }
            }
            for index in 0..self.exits.len() {
                self.exit_slots.reset(index);
            }
            for global in &self.globals {
                if let GlobalKind::Variable {
                    index,
                    init: Some(bits),
                    ..
                } = global.kind
                {
                    self.image
                        .store_word(self.global_data_offset(8 + 8 * index), bits);
                }
            }
            if self.profiling_enabled {
                self.toggle_func_ptr_tables(true);
                for patch in self.builtin_call_patches(true)? {
                    self.image.apply_patch(&patch);
                }
            }
            self.image.flush_icache(0, self.header.code_bytes as usize);
        }

        self.callees = vec![None; self.exits.len()];
        self.statically_linked = true;
        log::debug!(
            "module {} statically linked at {:#x}: {} relative, {} absolute links",
            self.id,
            self.base(),
            self.static_link_data.relative_links.len(),
            self.static_link_data.absolute_links.len()
        );
        Ok(())
    }

    /// Put absolute links back to the sentinel and apply `rebase`, which
    /// takes out a heap base previously folded into heap accesses.
    fn undo_links(&self, rebase: &[Patch]) {
        let arch = self.header.arch;
        let width = arch.pointer_width();
        for (_, offsets) in self.static_link_data.absolute_links.iter() {
            for &at in offsets {
                self.image
                    .apply_patch(&Patch::word(at, arch.link_sentinel(), width));
            }
        }
        for patch in rebase {
            self.image.apply_patch(patch);
        }
    }

    /// Detach the heap and undo static linking. Returns the detached heap.
    /// The module must be statically linked again before use.
    pub fn restore_to_initial_state(&mut self) -> Result<Option<Arc<HeapBuffer>>, LinkError> {
        if !self.statically_linked {
            return Err(LinkError::LinkState("restoring a module that is not linked"));
        }
        let rebase = match &self.heap {
            Some(heap) => self.heap_base_patches(-(heap.address() as i64))?,
            None => Vec::new(),
        };
        {
            let _scope = UnprotectScope::new(self)?;
            self.undo_links(&rebase);
            self.image.store_word(self.global_data_offset(0), 0);
            self.image.flush_icache(0, self.header.code_bytes as usize);
        }
        DependencyRegistry::global().unregister_module(self.id);
        self.callees = vec![None; self.exits.len()];
        self.resolved = [0; SymbolicAddress::COUNT];
        self.statically_linked = false;
        log::debug!("module {} restored to initial state", self.id);
        Ok(self.heap.take())
    }

    /// An independent, unlinked copy with fresh global data. The copy
    /// keeps the profiling state and must be statically linked before use.
    pub fn try_clone(&self) -> Result<Module, LinkError> {
        let mut clone = {
            let _scope = UnprotectScope::new(self)?;
            Module::from_parts(self.parts(), self.code(), self.filename.clone())?
        };
        clone.profiling_enabled = self.profiling_enabled;
        clone.profiling_labels = self.profiling_labels.clone();
        clone.function_counts = self.function_counts;
        let rebase = match &self.heap {
            Some(heap) => clone.heap_base_patches(-(heap.address() as i64))?,
            None => Vec::new(),
        };
        clone.undo_links(&rebase);
        log::debug!("module {} cloned as {}", self.id, clone.id);
        Ok(clone)
    }

    /// The code as it was before static linking, with profiling state
    /// kept. Relative-link slots may hold stale addresses; static linking
    /// overwrites them.
    pub fn unlinked_code(&self) -> Result<Vec<u8>, LinkError> {
        let mut code = {
            let _scope = UnprotectScope::new(self)?;
            self.code().to_vec()
        };
        if self.statically_linked {
            let arch = self.header.arch;
            let sentinel = Patch::word(0, arch.link_sentinel(), arch.pointer_width());
            for (_, offsets) in self.static_link_data.absolute_links.iter() {
                for &at in offsets {
                    let at = at as usize;
                    code[at..at + sentinel.data().len()].copy_from_slice(sentinel.data());
                }
            }
        }
        Ok(code)
    }

    // ==================== Calling ====================

    /// Call export `index` through its entry stub.
    pub fn call_export(&self, index: u32, args: &[Value]) -> Result<Value, CallError> {
        if !self.statically_linked || (self.header.has_array_view && self.heap.is_none()) {
            return Err(CallError::NotLinked);
        }
        if !cfg!(feature = "exec") || Arch::host() != Some(self.header.arch) {
            return Err(CallError::HostMismatch(self.header.arch));
        }
        let export = self
            .exports
            .get(index as usize)
            .ok_or(CallError::BadExport(index))?;
        if args.len() != export.arg_coercions.len() {
            return Err(CallError::ArgumentCount {
                expected: export.arg_coercions.len(),
                got: args.len(),
            });
        }

        let mut argv = vec![0u64; args.len().max(1)];
        for (slot, (arg, coercion)) in argv.iter_mut().zip(args.iter().zip(&export.arg_coercions)) {
            *slot = match coercion {
                Coercion::Int32 => arg.to_int32() as u32 as u64,
                Coercion::Double => arg.to_number().to_bits(),
                Coercion::Float32 => (arg.to_number() as f32).to_bits() as u64,
            };
        }

        let entry = self.image.address(export.code_offset);
        let activation = ActivationGuard::enter(self);
        // SAFETY: the module is statically linked for the host architecture
        // and every entry stub follows this signature.
        let status = unsafe {
            let stub = std::mem::transmute::<usize, extern "C" fn(*mut u64) -> i32>(entry);
            stub(argv.as_mut_ptr())
        };
        if let Some(message) = activation.take_error() {
            return Err(CallError::Callee(message));
        }
        drop(activation);
        if status == 0 {
            return Err(CallError::Trapped);
        }

        Ok(match export.return_type {
            ReturnType::Void => Value::Undefined,
            ReturnType::Int32 => Value::Int32(argv[0] as u32 as i32),
            ReturnType::Double => Value::Double(f64::from_bits(argv[0])),
            ReturnType::Float32 => Value::Double(f32::from_bits(argv[0] as u32) as f64),
        })
    }

    /// [`Module::call_export`] by export name.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, CallError> {
        let index = self
            .export_index(name)
            .ok_or(CallError::BadExport(u32::MAX))?;
        self.call_export(index, args)
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        DependencyRegistry::global().unregister_module(self.id);
        log::trace!("module {} dropped", self.id);
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("arch", &self.header.arch)
            .field("base", &format_args!("{:#x}", self.base()))
            .field("code_bytes", &self.header.code_bytes)
            .field("statically_linked", &self.statically_linked)
            .field("profiling_enabled", &self.profiling_enabled)
            .finish()
    }
}
