//! Metadata tables of a module.
//!
//! All offsets are byte offsets from the module image base. Tables that are
//! searched by offset (call sites, code ranges, heap accesses) are kept
//! sorted by the code generator's emission order and validated at finish.

use serde::Serialize;

use crate::error::LinkError;
use crate::resolver::{Builtin, SymbolicAddress};

/// Marks an absent optional offset in fixed-size records.
pub const NO_OFFSET: u32 = u32::MAX;

// ==================== Call sites ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum CallSiteKind {
    /// Direct call to an offset inside the module. Retargeted by the
    /// profiling toggle.
    Relative = 0,
    /// Indirect call through a register (function-pointer tables).
    Register = 1,
    /// Call out of the module (exits, builtins, runtime).
    External = 2,
}

impl CallSiteKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(CallSiteKind::Relative),
            1 => Some(CallSiteKind::Register),
            2 => Some(CallSiteKind::External),
            _ => None,
        }
    }
}

/// A return address inside generated code, for stack walking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallSite {
    pub return_address_offset: u32,
    pub kind: CallSiteKind,
    pub line: u32,
    pub column: u32,
    /// Bytes pushed by the caller below its frame at the call.
    pub stack_depth: u32,
}

impl CallSite {
    pub fn new(return_address_offset: u32, kind: CallSiteKind) -> Self {
        Self {
            return_address_offset,
            kind,
            line: 0,
            column: 0,
            stack_depth: 0,
        }
    }

    pub fn with_position(mut self, line: u32, column: u32) -> Self {
        self.line = line;
        self.column = column;
        self
    }
}

// ==================== Heap accesses ====================

/// An instruction touching linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapAccess {
    /// Offset of the load or store instruction.
    pub offset: u32,
    /// Offset of the bounds-check immediate, or [`NO_OFFSET`].
    pub length_check_at: u32,
    /// Offset of an embedded heap-base displacement (x86 only), or
    /// [`NO_OFFSET`].
    pub base_disp_at: u32,
}

impl HeapAccess {
    pub fn new(offset: u32) -> Self {
        Self {
            offset,
            length_check_at: NO_OFFSET,
            base_disp_at: NO_OFFSET,
        }
    }

    pub fn with_length_check(mut self, at: u32) -> Self {
        self.length_check_at = at;
        self
    }

    pub fn with_base_disp(mut self, at: u32) -> Self {
        self.base_disp_at = at;
        self
    }

    pub fn has_length_check(&self) -> bool {
        self.length_check_at != NO_OFFSET
    }

    pub fn has_base_disp(&self) -> bool {
        self.base_disp_at != NO_OFFSET
    }
}

// ==================== Code ranges ====================

/// Raw offsets of the labels a function body is emitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionOffsets {
    /// Profiling prologue.
    pub begin: u32,
    /// Fast entry point.
    pub entry: u32,
    /// Reserved slot toggled between a no-op and a jump to the profiling
    /// epilogue.
    pub profiling_jump: u32,
    pub profiling_epilogue: u32,
    pub profiling_return: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CodeRangeKind {
    Function {
        name_index: u32,
        line_number: u32,
        begin_to_entry: u8,
        jump_to_return: u8,
        epilogue_to_return: u8,
    },
    Entry,
    InterpExit,
    OptimizedExit,
    Interrupt,
    Inline,
    Thunk {
        target: Builtin,
    },
}

impl CodeRangeKind {
    pub fn tag(&self) -> u8 {
        match self {
            CodeRangeKind::Function { .. } => 0,
            CodeRangeKind::Entry => 1,
            CodeRangeKind::InterpExit => 2,
            CodeRangeKind::OptimizedExit => 3,
            CodeRangeKind::Interrupt => 4,
            CodeRangeKind::Inline => 5,
            CodeRangeKind::Thunk { .. } => 6,
        }
    }
}

/// A labeled interval `[begin, end)` of the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodeRange {
    pub begin: u32,
    /// Offset of the return instruction reached by the profiling
    /// epilogue. Zero for entry and inline ranges.
    pub profiling_return: u32,
    pub end: u32,
    pub kind: CodeRangeKind,
}

fn delta(from: u32, to: u32, what: &str) -> Result<u8, LinkError> {
    to.checked_sub(from)
        .and_then(|d| u8::try_from(d).ok())
        .ok_or_else(|| LinkError::Codegen(format!("{} delta {}..{} does not fit", what, from, to)))
}

impl CodeRange {
    pub fn function(
        name_index: u32,
        line_number: u32,
        offsets: FunctionOffsets,
    ) -> Result<Self, LinkError> {
        let o = offsets;
        if !(o.begin < o.entry
            && o.entry < o.profiling_jump
            && o.profiling_jump < o.profiling_epilogue
            && o.profiling_epilogue < o.profiling_return
            && o.profiling_return < o.end)
        {
            return Err(LinkError::Codegen(format!(
                "function labels out of order: {:?}",
                offsets
            )));
        }
        Ok(Self {
            begin: o.begin,
            profiling_return: o.profiling_return,
            end: o.end,
            kind: CodeRangeKind::Function {
                name_index,
                line_number,
                begin_to_entry: delta(o.begin, o.entry, "entry")?,
                jump_to_return: delta(o.profiling_jump, o.profiling_return, "profiling jump")?,
                epilogue_to_return: delta(
                    o.profiling_epilogue,
                    o.profiling_return,
                    "profiling epilogue",
                )?,
            },
        })
    }

    /// An entry stub or inline range.
    pub fn new(kind: CodeRangeKind, begin: u32, end: u32) -> Result<Self, LinkError> {
        if !matches!(kind, CodeRangeKind::Entry | CodeRangeKind::Inline) || begin > end {
            return Err(LinkError::Codegen(format!(
                "bad {:?} range {}..{}",
                kind, begin, end
            )));
        }
        Ok(Self {
            begin,
            profiling_return: 0,
            end,
            kind,
        })
    }

    /// An exit trampoline, interrupt stub or builtin thunk.
    pub fn with_profiling_return(
        kind: CodeRangeKind,
        begin: u32,
        profiling_return: u32,
        end: u32,
    ) -> Result<Self, LinkError> {
        let kind_ok = matches!(
            kind,
            CodeRangeKind::InterpExit
                | CodeRangeKind::OptimizedExit
                | CodeRangeKind::Interrupt
                | CodeRangeKind::Thunk { .. }
        );
        if !kind_ok || !(begin < profiling_return && profiling_return < end) {
            return Err(LinkError::Codegen(format!(
                "bad {:?} range {}..{}..{}",
                kind, begin, profiling_return, end
            )));
        }
        Ok(Self {
            begin,
            profiling_return,
            end,
            kind,
        })
    }

    pub fn thunk(builtin: Builtin, begin: u32, profiling_return: u32, end: u32) -> Result<Self, LinkError> {
        Self::with_profiling_return(CodeRangeKind::Thunk { target: builtin }, begin, profiling_return, end)
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, CodeRangeKind::Function { .. })
    }

    pub fn is_thunk(&self) -> bool {
        matches!(self.kind, CodeRangeKind::Thunk { .. })
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.begin <= offset && offset < self.end
    }

    /// Fast entry point of a function range.
    pub fn entry(&self) -> Option<u32> {
        match self.kind {
            CodeRangeKind::Function { begin_to_entry, .. } => Some(self.begin + begin_to_entry as u32),
            _ => None,
        }
    }

    pub fn profiling_jump(&self) -> Option<u32> {
        match self.kind {
            CodeRangeKind::Function { jump_to_return, .. } => {
                Some(self.profiling_return - jump_to_return as u32)
            }
            _ => None,
        }
    }

    pub fn profiling_epilogue(&self) -> Option<u32> {
        match self.kind {
            CodeRangeKind::Function { epilogue_to_return, .. } => {
                Some(self.profiling_return - epilogue_to_return as u32)
            }
            _ => None,
        }
    }

    pub fn name_index(&self) -> Option<u32> {
        match self.kind {
            CodeRangeKind::Function { name_index, .. } => Some(name_index),
            _ => None,
        }
    }

    pub fn line_number(&self) -> Option<u32> {
        match self.kind {
            CodeRangeKind::Function { line_number, .. } => Some(line_number),
            _ => None,
        }
    }

    pub fn thunk_target(&self) -> Option<Builtin> {
        match self.kind {
            CodeRangeKind::Thunk { target } => Some(target),
            _ => None,
        }
    }

    /// Recompute the range in final offsets.
    pub fn finalize(&mut self, finalize: impl Fn(u32) -> u32) -> Result<(), LinkError> {
        let updated = match self.kind {
            CodeRangeKind::Function {
                name_index,
                line_number,
                ..
            } => {
                let offsets = FunctionOffsets {
                    begin: finalize(self.begin),
                    entry: finalize(self.entry().unwrap_or(self.begin)),
                    profiling_jump: finalize(self.profiling_jump().unwrap_or(self.begin)),
                    profiling_epilogue: finalize(self.profiling_epilogue().unwrap_or(self.begin)),
                    profiling_return: finalize(self.profiling_return),
                    end: finalize(self.end),
                };
                CodeRange::function(name_index, line_number, offsets)?
            }
            CodeRangeKind::Entry | CodeRangeKind::Inline => {
                CodeRange::new(self.kind, finalize(self.begin), finalize(self.end))?
            }
            _ => CodeRange::with_profiling_return(
                self.kind,
                finalize(self.begin),
                finalize(self.profiling_return),
                finalize(self.end),
            )?,
        };
        *self = updated;
        Ok(())
    }
}

// ==================== Links ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum RelativeLinkKind {
    /// A pointer-width data word (function-pointer tables, jump tables).
    RawPointer = 0,
    /// An address immediate inside an instruction or literal pool.
    InstructionImmediate = 1,
}

/// `base + target` is written at `base + patch_at` during static linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelativeLink {
    pub kind: RelativeLinkKind,
    pub patch_at: u32,
    pub target: u32,
}

impl RelativeLink {
    pub fn is_raw_pointer(&self) -> bool {
        self.kind == RelativeLinkKind::RawPointer
    }
}

/// Offsets holding the link sentinel, bucketed by the address they need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbsoluteLinks {
    buckets: [Vec<u32>; SymbolicAddress::COUNT],
}

impl AbsoluteLinks {
    pub fn push(&mut self, symbol: SymbolicAddress, patch_at: u32) {
        self.buckets[symbol.index()].push(patch_at);
    }

    pub fn get(&self, symbol: SymbolicAddress) -> &[u32] {
        &self.buckets[symbol.index()]
    }

    pub fn set(&mut self, symbol: SymbolicAddress, offsets: Vec<u32>) {
        self.buckets[symbol.index()] = offsets;
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolicAddress, &[u32])> {
        SymbolicAddress::ALL
            .iter()
            .map(move |&s| (s, self.buckets[s.index()].as_slice()))
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything static linking needs besides the code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticLinkData {
    pub interrupt_exit_offset: u32,
    pub relative_links: Vec<RelativeLink>,
    pub absolute_links: AbsoluteLinks,
}

// ==================== Exits, tables, exports ====================

/// A call-out to an imported function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Exit {
    pub ffi_index: u32,
    /// Offset of the exit's slot pair within global data.
    pub global_data_offset: u32,
    pub interp_code_offset: u32,
    pub optimized_code_offset: u32,
}

/// A table of function entry pointers in global data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FuncPtrTable {
    pub global_data_offset: u32,
    pub num_elems: u32,
}

/// Argument coercion applied when calling an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum Coercion {
    Int32 = 0,
    Double = 1,
    Float32 = 2,
}

impl Coercion {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Coercion::Int32),
            1 => Some(Coercion::Double),
            2 => Some(Coercion::Float32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum ReturnType {
    Void = 0,
    Int32 = 1,
    Double = 2,
    Float32 = 3,
}

impl ReturnType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ReturnType::Void),
            1 => Some(ReturnType::Int32),
            2 => Some(ReturnType::Double),
            3 => Some(ReturnType::Float32),
            _ => None,
        }
    }
}

/// A function callable from outside the module through its entry stub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedFunction {
    pub name: Name,
    pub field_name: Option<Name>,
    pub arg_coercions: Vec<Coercion>,
    pub return_type: ReturnType,
    /// Entry stub offset.
    pub code_offset: u32,
    pub start_offset_in_module: u32,
    pub end_offset_in_module: u32,
}

// ==================== Globals ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum ViewType {
    Int8 = 0,
    Uint8 = 1,
    Int16 = 2,
    Uint16 = 3,
    Int32 = 4,
    Uint32 = 5,
    Float32 = 6,
    Float64 = 7,
}

impl ViewType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ViewType::Int8),
            1 => Some(ViewType::Uint8),
            2 => Some(ViewType::Int16),
            3 => Some(ViewType::Uint16),
            4 => Some(ViewType::Int32),
            5 => Some(ViewType::Uint32),
            6 => Some(ViewType::Float32),
            7 => Some(ViewType::Float64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum GlobalKind {
    /// A mutable module variable stored in global data. `init` holds the
    /// literal initializer bits, or `None` when imported.
    Variable {
        index: u32,
        coercion: Coercion,
        init: Option<u64>,
    },
    /// An imported function, called through exits.
    Ffi { ffi_index: u32 },
    ArrayView { view: ViewType },
    MathBuiltin { builtin: Builtin },
    Constant { value: f64 },
}

/// A module-level binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Global {
    pub name: Option<Name>,
    pub kind: GlobalKind,
}

// ==================== Names ====================

/// An identifier as written in the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Name(String);

impl Name {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether every character fits in one byte.
    pub fn is_latin1(&self) -> bool {
        self.0.chars().all(|c| (c as u32) <= 0xFF)
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets() -> FunctionOffsets {
        FunctionOffsets {
            begin: 0,
            entry: 20,
            profiling_jump: 30,
            profiling_epilogue: 34,
            profiling_return: 35,
            end: 36,
        }
    }

    #[test]
    fn test_function_range_deltas() {
        let range = CodeRange::function(3, 7, offsets()).unwrap();
        assert_eq!(range.entry(), Some(20));
        assert_eq!(range.profiling_jump(), Some(30));
        assert_eq!(range.profiling_epilogue(), Some(34));
        assert_eq!(range.name_index(), Some(3));
        assert_eq!(range.line_number(), Some(7));
        assert!(range.contains(0) && range.contains(35) && !range.contains(36));
    }

    #[test]
    fn test_function_range_rejects_disorder() {
        let mut bad = offsets();
        bad.entry = 31;
        assert!(CodeRange::function(0, 0, bad).is_err());
    }

    #[test]
    fn test_function_range_rejects_wide_delta() {
        let mut wide = offsets();
        wide.entry = 300;
        wide.profiling_jump = 310;
        wide.profiling_epilogue = 314;
        wide.profiling_return = 315;
        wide.end = 316;
        assert!(CodeRange::function(0, 0, wide).is_err());
    }

    #[test]
    fn test_range_constructors() {
        assert!(CodeRange::new(CodeRangeKind::Entry, 4, 4).is_ok());
        assert!(CodeRange::new(CodeRangeKind::Entry, 5, 4).is_err());
        assert!(CodeRange::new(CodeRangeKind::InterpExit, 0, 4).is_err());
        assert!(CodeRange::with_profiling_return(CodeRangeKind::Interrupt, 0, 2, 3).is_ok());
        assert!(CodeRange::with_profiling_return(CodeRangeKind::Interrupt, 0, 3, 3).is_err());
        let thunk = CodeRange::thunk(Builtin::SinD, 0, 8, 9).unwrap();
        assert!(thunk.is_thunk());
        assert_eq!(thunk.thunk_target(), Some(Builtin::SinD));
    }

    #[test]
    fn test_finalize_shifts_all_labels() {
        let mut range = CodeRange::function(0, 1, offsets()).unwrap();
        range.finalize(|raw| if raw >= 30 { raw + 8 } else { raw }).unwrap();
        assert_eq!(range.entry(), Some(20));
        assert_eq!(range.profiling_jump(), Some(38));
        assert_eq!(range.profiling_return, 43);
        assert_eq!(range.end, 44);
    }

    #[test]
    fn test_absolute_link_buckets() {
        let mut links = AbsoluteLinks::default();
        links.push(SymbolicAddress::SinD, 8);
        links.push(SymbolicAddress::SinD, 24);
        links.push(SymbolicAddress::Runtime, 4);
        assert_eq!(links.get(SymbolicAddress::SinD), &[8, 24]);
        assert_eq!(links.len(), 3);
        let order: Vec<_> = links.iter().filter(|(_, o)| !o.is_empty()).map(|(s, _)| s).collect();
        assert_eq!(order, vec![SymbolicAddress::Runtime, SymbolicAddress::SinD]);
    }

    #[test]
    fn test_name_encoding_class() {
        assert!(Name::new("caf\u{e9}").is_latin1());
        assert!(!Name::new("\u{3b1}").is_latin1());
    }
}
