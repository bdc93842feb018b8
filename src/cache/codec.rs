//! Binary encoding of a module.
//!
//! Layout (all integers little-endian):
//! - Magic: "ASML" (4 bytes), version: u32
//! - Header: size fields, flags, then the length of every table
//! - Code: `code_bytes` bytes, absolute links reset to the sentinel
//! - Argument names (3 names)
//! - Tables, each length-prefixed, in the order of [`ModuleParts`]
//!
//! Names are a u32 `length << 1 | one_byte` (0 = absent) followed by the
//! characters, one byte each or UTF-16LE. Table lengths in the header are
//! cross-checked against each table's own prefix.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::CacheError;
use crate::jit::backend::Arch;
use crate::module::symbols::{sort_call_sites, sort_code_ranges, sort_heap_accesses};
use crate::module::tables::{
    AbsoluteLinks, CallSite, CallSiteKind, CodeRange, CodeRangeKind, Coercion, Exit,
    ExportedFunction, FuncPtrTable, FunctionOffsets, Global, GlobalKind, HeapAccess, NO_OFFSET,
    Name, RelativeLink, RelativeLinkKind, ReturnType, StaticLinkData, ViewType,
};
use crate::module::{Module, ModuleHeader, ModuleParts};
use crate::resolver::{Builtin, SymbolicAddress};

/// Magic bytes of a serialized module.
pub const MAGIC: &[u8; 4] = b"ASML";

/// Current format version. Part of the default build id, so entries from
/// other versions miss on the machine check before reaching the decoder.
pub const VERSION: u32 = 1;

const CALL_SITE_BYTES: usize = 20;
const CODE_RANGE_BYTES: usize = 24;
const HEAP_ACCESS_BYTES: usize = 12;
const RELATIVE_LINK_BYTES: usize = 12;
const EXIT_BYTES: usize = 16;
const FUNC_PTR_TABLE_BYTES: usize = 8;

const FLAG_STRICT: u32 = 1 << 0;
const FLAG_HAS_ARRAY_VIEW: u32 = 1 << 1;
const FLAG_USES_SIGNAL_HANDLERS: u32 = 1 << 2;

/// Number of entries in each table, as recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct TableCounts {
    pub globals: u32,
    pub exits: u32,
    pub exports: u32,
    pub call_sites: u32,
    pub code_ranges: u32,
    pub func_ptr_tables: u32,
    pub names: u32,
    pub heap_accesses: u32,
    pub relative_links: u32,
    pub absolute_links: u32,
}

impl TableCounts {
    pub fn of(parts: &ModuleParts) -> Self {
        Self {
            globals: parts.globals.len() as u32,
            exits: parts.exits.len() as u32,
            exports: parts.exports.len() as u32,
            call_sites: parts.call_sites.len() as u32,
            code_ranges: parts.code_ranges.len() as u32,
            func_ptr_tables: parts.func_ptr_tables.len() as u32,
            names: parts.names.len() as u32,
            heap_accesses: parts.heap_accesses.len() as u32,
            relative_links: parts.static_link_data.relative_links.len() as u32,
            absolute_links: parts.static_link_data.absolute_links.len() as u32,
        }
    }
}

fn corrupt(what: &'static str) -> CacheError {
    CacheError::Corrupt(what)
}

/// Reads from a byte slice; every short read is a corrupt entry.
pub struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        len.saturating_sub(self.cursor.position()) as usize
    }

    pub fn is_at_end(&self) -> bool {
        self.remaining() == 0
    }

    pub fn u8(&mut self) -> Result<u8, CacheError> {
        self.cursor.read_u8().map_err(|_| corrupt("truncated entry"))
    }

    pub fn u32(&mut self) -> Result<u32, CacheError> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| corrupt("truncated entry"))
    }

    pub fn u64(&mut self) -> Result<u64, CacheError> {
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| corrupt("truncated entry"))
    }

    pub fn bytes(&mut self, len: usize) -> Result<Vec<u8>, CacheError> {
        if len > self.remaining() {
            return Err(corrupt("truncated entry"));
        }
        let mut buf = vec![0u8; len];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| corrupt("truncated entry"))?;
        Ok(buf)
    }

    /// Read a record count and check that many records of at least
    /// `min_record_bytes` can follow.
    pub fn count(&mut self, min_record_bytes: usize) -> Result<usize, CacheError> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_record_bytes) > self.remaining() {
            return Err(corrupt("record count exceeds entry"));
        }
        Ok(count)
    }
}

// ==================== Names ====================

/// Length word of a name: the length shifted left by one, low bit set for
/// one-byte characters.
fn name_word(len: usize, latin1: bool) -> io::Result<u32> {
    match u32::try_from(len) {
        Ok(len) if len <= u32::MAX >> 1 => Ok((len << 1) | latin1 as u32),
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "name too long to encode")),
    }
}

pub fn write_name<W: Write>(w: &mut W, name: Option<&Name>) -> io::Result<()> {
    let Some(name) = name else {
        return w.write_u32::<LittleEndian>(0);
    };
    if name.is_latin1() {
        let chars: Vec<u8> = name.as_str().chars().map(|c| c as u8).collect();
        w.write_u32::<LittleEndian>(name_word(chars.len(), true)?)?;
        w.write_all(&chars)
    } else {
        let units: Vec<u16> = name.as_str().encode_utf16().collect();
        w.write_u32::<LittleEndian>(name_word(units.len(), false)?)?;
        for unit in units {
            w.write_u16::<LittleEndian>(unit)?;
        }
        Ok(())
    }
}

pub fn read_name(r: &mut Reader<'_>) -> Result<Option<Name>, CacheError> {
    let word = r.u32()?;
    if word == 0 {
        return Ok(None);
    }
    let len = (word >> 1) as usize;
    if word & 1 != 0 {
        let bytes = r.bytes(len)?;
        return Ok(Some(Name::new(bytes.iter().map(|&b| b as char).collect::<String>())));
    }
    let bytes = r.bytes(len.checked_mul(2).ok_or_else(|| corrupt("name too long"))?)?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units)
        .map(|s| Some(Name::new(s)))
        .map_err(|_| corrupt("invalid two-byte name"))
}

fn read_present_name(r: &mut Reader<'_>) -> Result<Name, CacheError> {
    read_name(r)?.ok_or_else(|| corrupt("missing name"))
}

// ==================== Header ====================

fn write_header<W: Write>(w: &mut W, h: &ModuleHeader, counts: &TableCounts) -> io::Result<()> {
    w.write_u32::<LittleEndian>(h.arch.tag())?;
    for v in [
        h.function_bytes,
        h.code_bytes,
        h.total_bytes,
        h.global_data_bytes,
        h.num_global_vars,
        h.num_ffis,
    ] {
        w.write_u32::<LittleEndian>(v)?;
    }
    w.write_u64::<LittleEndian>(h.min_heap_length)?;
    w.write_u64::<LittleEndian>(h.max_heap_length)?;
    for v in [
        h.src_start,
        h.src_body_start,
        h.src_length,
        h.src_length_with_right_brace,
    ] {
        w.write_u32::<LittleEndian>(v)?;
    }
    let mut flags = 0;
    if h.strict {
        flags |= FLAG_STRICT;
    }
    if h.has_array_view {
        flags |= FLAG_HAS_ARRAY_VIEW;
    }
    if h.uses_signal_handlers {
        flags |= FLAG_USES_SIGNAL_HANDLERS;
    }
    w.write_u32::<LittleEndian>(flags)?;

    for v in [
        counts.globals,
        counts.exits,
        counts.exports,
        counts.call_sites,
        counts.code_ranges,
        counts.func_ptr_tables,
        counts.names,
        counts.heap_accesses,
        counts.relative_links,
        counts.absolute_links,
    ] {
        w.write_u32::<LittleEndian>(v)?;
    }
    Ok(())
}

fn read_header(r: &mut Reader<'_>) -> Result<(ModuleHeader, TableCounts), CacheError> {
    let arch = Arch::from_tag(r.u32()?).ok_or_else(|| corrupt("unknown architecture"))?;
    let function_bytes = r.u32()?;
    let code_bytes = r.u32()?;
    let total_bytes = r.u32()?;
    let global_data_bytes = r.u32()?;
    let num_global_vars = r.u32()?;
    let num_ffis = r.u32()?;
    let min_heap_length = r.u64()?;
    let max_heap_length = r.u64()?;
    let src_start = r.u32()?;
    let src_body_start = r.u32()?;
    let src_length = r.u32()?;
    let src_length_with_right_brace = r.u32()?;
    let flags = r.u32()?;
    if flags & !(FLAG_STRICT | FLAG_HAS_ARRAY_VIEW | FLAG_USES_SIGNAL_HANDLERS) != 0 {
        return Err(corrupt("unknown header flags"));
    }
    let header = ModuleHeader {
        arch,
        function_bytes,
        code_bytes,
        total_bytes,
        global_data_bytes,
        num_global_vars,
        num_ffis,
        min_heap_length,
        max_heap_length,
        src_start,
        src_body_start,
        src_length,
        src_length_with_right_brace,
        strict: flags & FLAG_STRICT != 0,
        has_array_view: flags & FLAG_HAS_ARRAY_VIEW != 0,
        uses_signal_handlers: flags & FLAG_USES_SIGNAL_HANDLERS != 0,
    };
    if function_bytes > code_bytes
        || min_heap_length > max_heap_length
        || code_bytes % 8 != 0
        || code_bytes as u64 + global_data_bytes as u64 > total_bytes as u64
        || total_bytes as usize % crate::jit::memory::page_size() != 0
        || (8 + 8 * num_global_vars as u64) > global_data_bytes as u64
    {
        return Err(corrupt("inconsistent module sizes"));
    }
    let counts = TableCounts {
        globals: r.u32()?,
        exits: r.u32()?,
        exports: r.u32()?,
        call_sites: r.u32()?,
        code_ranges: r.u32()?,
        func_ptr_tables: r.u32()?,
        names: r.u32()?,
        heap_accesses: r.u32()?,
        relative_links: r.u32()?,
        absolute_links: r.u32()?,
    };
    Ok((header, counts))
}

fn expect_count(actual: usize, recorded: u32) -> Result<usize, CacheError> {
    if actual != recorded as usize {
        return Err(corrupt("table length disagrees with header"));
    }
    Ok(actual)
}

// ==================== Tables ====================

fn write_global<W: Write>(w: &mut W, global: &Global) -> io::Result<()> {
    write_name(w, global.name.as_ref())?;
    match global.kind {
        GlobalKind::Variable {
            index,
            coercion,
            init,
        } => {
            w.write_u32::<LittleEndian>(0)?;
            w.write_u32::<LittleEndian>(index)?;
            w.write_u32::<LittleEndian>(coercion as u32)?;
            w.write_u32::<LittleEndian>(init.is_some() as u32)?;
            w.write_u64::<LittleEndian>(init.unwrap_or(0))
        }
        GlobalKind::Ffi { ffi_index } => {
            w.write_u32::<LittleEndian>(1)?;
            w.write_u32::<LittleEndian>(ffi_index)
        }
        GlobalKind::ArrayView { view } => {
            w.write_u32::<LittleEndian>(2)?;
            w.write_u32::<LittleEndian>(view as u32)
        }
        GlobalKind::MathBuiltin { builtin } => {
            w.write_u32::<LittleEndian>(3)?;
            w.write_u32::<LittleEndian>(builtin.index() as u32)
        }
        GlobalKind::Constant { value } => {
            w.write_u32::<LittleEndian>(4)?;
            w.write_u64::<LittleEndian>(value.to_bits())
        }
    }
}

fn read_global(r: &mut Reader<'_>) -> Result<Global, CacheError> {
    let name = read_name(r)?;
    let kind = match r.u32()? {
        0 => {
            let index = r.u32()?;
            let coercion = Coercion::from_u32(r.u32()?).ok_or_else(|| corrupt("bad coercion"))?;
            let has_init = r.u32()? != 0;
            let bits = r.u64()?;
            GlobalKind::Variable {
                index,
                coercion,
                init: has_init.then_some(bits),
            }
        }
        1 => GlobalKind::Ffi { ffi_index: r.u32()? },
        2 => GlobalKind::ArrayView {
            view: ViewType::from_u32(r.u32()?).ok_or_else(|| corrupt("bad view type"))?,
        },
        3 => GlobalKind::MathBuiltin {
            builtin: Builtin::from_index(r.u32()? as usize).ok_or_else(|| corrupt("bad builtin"))?,
        },
        4 => GlobalKind::Constant {
            value: f64::from_bits(r.u64()?),
        },
        _ => return Err(corrupt("bad global kind")),
    };
    Ok(Global { name, kind })
}

fn write_export<W: Write>(w: &mut W, export: &ExportedFunction) -> io::Result<()> {
    write_name(w, Some(&export.name))?;
    write_name(w, export.field_name.as_ref())?;
    w.write_u32::<LittleEndian>(export.arg_coercions.len() as u32)?;
    for &c in &export.arg_coercions {
        w.write_u32::<LittleEndian>(c as u32)?;
    }
    w.write_u32::<LittleEndian>(export.return_type as u32)?;
    w.write_u32::<LittleEndian>(export.code_offset)?;
    w.write_u32::<LittleEndian>(export.start_offset_in_module)?;
    w.write_u32::<LittleEndian>(export.end_offset_in_module)
}

fn read_export(r: &mut Reader<'_>) -> Result<ExportedFunction, CacheError> {
    let name = read_present_name(r)?;
    let field_name = read_name(r)?;
    let argc = r.count(4)?;
    let mut arg_coercions = Vec::with_capacity(argc);
    for _ in 0..argc {
        arg_coercions.push(Coercion::from_u32(r.u32()?).ok_or_else(|| corrupt("bad coercion"))?);
    }
    let return_type = ReturnType::from_u32(r.u32()?).ok_or_else(|| corrupt("bad return type"))?;
    Ok(ExportedFunction {
        name,
        field_name,
        arg_coercions,
        return_type,
        code_offset: r.u32()?,
        start_offset_in_module: r.u32()?,
        end_offset_in_module: r.u32()?,
    })
}

fn write_code_range<W: Write>(w: &mut W, range: &CodeRange) -> io::Result<()> {
    let (tag_word, a, b) = match range.kind {
        CodeRangeKind::Function {
            name_index,
            line_number,
            begin_to_entry,
            jump_to_return,
            epilogue_to_return,
        } => (
            range.kind.tag() as u32
                | (begin_to_entry as u32) << 8
                | (jump_to_return as u32) << 16
                | (epilogue_to_return as u32) << 24,
            name_index,
            line_number,
        ),
        CodeRangeKind::Thunk { target } => (range.kind.tag() as u32, target.index() as u32, 0),
        _ => (range.kind.tag() as u32, 0, 0),
    };
    for v in [range.begin, range.profiling_return, range.end, tag_word, a, b] {
        w.write_u32::<LittleEndian>(v)?;
    }
    Ok(())
}

fn read_code_range(r: &mut Reader<'_>) -> Result<CodeRange, CacheError> {
    let begin = r.u32()?;
    let profiling_return = r.u32()?;
    let end = r.u32()?;
    let tag_word = r.u32()?;
    let a = r.u32()?;
    let b = r.u32()?;
    let bad = |_| corrupt("bad code range");
    let byte = |shift: u32| (tag_word >> shift) & 0xFF;
    match tag_word & 0xFF {
        0 => {
            let offsets = FunctionOffsets {
                begin,
                entry: begin.wrapping_add(byte(8)),
                profiling_jump: profiling_return.wrapping_sub(byte(16)),
                profiling_epilogue: profiling_return.wrapping_sub(byte(24)),
                profiling_return,
                end,
            };
            CodeRange::function(a, b, offsets).map_err(bad)
        }
        1 => CodeRange::new(CodeRangeKind::Entry, begin, end).map_err(bad),
        5 => CodeRange::new(CodeRangeKind::Inline, begin, end).map_err(bad),
        tag @ (2 | 3 | 4) => {
            let kind = match tag {
                2 => CodeRangeKind::InterpExit,
                3 => CodeRangeKind::OptimizedExit,
                _ => CodeRangeKind::Interrupt,
            };
            CodeRange::with_profiling_return(kind, begin, profiling_return, end).map_err(bad)
        }
        6 => {
            let builtin = Builtin::from_index(a as usize).ok_or_else(|| corrupt("bad builtin"))?;
            CodeRange::thunk(builtin, begin, profiling_return, end).map_err(bad)
        }
        _ => Err(corrupt("bad code range kind")),
    }
}

fn write_static_link_data<W: Write>(w: &mut W, data: &StaticLinkData) -> io::Result<()> {
    w.write_u32::<LittleEndian>(data.interrupt_exit_offset)?;
    w.write_u32::<LittleEndian>(data.relative_links.len() as u32)?;
    for link in &data.relative_links {
        w.write_u32::<LittleEndian>(link.kind as u32)?;
        w.write_u32::<LittleEndian>(link.patch_at)?;
        w.write_u32::<LittleEndian>(link.target)?;
    }
    for (_, offsets) in data.absolute_links.iter() {
        w.write_u32::<LittleEndian>(offsets.len() as u32)?;
        for &at in offsets {
            w.write_u32::<LittleEndian>(at)?;
        }
    }
    Ok(())
}

fn read_static_link_data(r: &mut Reader<'_>, counts: &TableCounts) -> Result<StaticLinkData, CacheError> {
    let interrupt_exit_offset = r.u32()?;
    let n = expect_count(r.count(RELATIVE_LINK_BYTES)?, counts.relative_links)?;
    let mut relative_links = Vec::with_capacity(n);
    for _ in 0..n {
        let kind = match r.u32()? {
            0 => RelativeLinkKind::RawPointer,
            1 => RelativeLinkKind::InstructionImmediate,
            _ => return Err(corrupt("bad relative link kind")),
        };
        relative_links.push(RelativeLink {
            kind,
            patch_at: r.u32()?,
            target: r.u32()?,
        });
    }
    let mut absolute_links = AbsoluteLinks::default();
    for symbol in SymbolicAddress::ALL {
        let n = r.count(4)?;
        let mut offsets = Vec::with_capacity(n);
        for _ in 0..n {
            offsets.push(r.u32()?);
        }
        absolute_links.set(symbol, offsets);
    }
    expect_count(absolute_links.len(), counts.absolute_links)?;
    Ok(StaticLinkData {
        interrupt_exit_offset,
        relative_links,
        absolute_links,
    })
}

// ==================== Module ====================

/// Append the encoding of `module` to `w`. The code is written as it was
/// before static linking.
pub fn write_module(w: &mut Vec<u8>, module: &Module) -> Result<(), CacheError> {
    let code = module.unlinked_code()?;
    let parts = module.parts();
    write_parts(w, &parts, &code)?;
    Ok(())
}

/// Encode `parts` and `code` as [`read_parts`] expects them. Nothing is
/// checked; [`write_module`] is the entry point for real modules.
pub fn write_parts<W: Write>(w: &mut W, parts: &ModuleParts, code: &[u8]) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_u32::<LittleEndian>(VERSION)?;
    write_header(w, &parts.header, &TableCounts::of(parts))?;
    w.write_all(code)?;

    write_name(w, parts.global_argument_name.as_ref())?;
    write_name(w, parts.import_argument_name.as_ref())?;
    write_name(w, parts.buffer_argument_name.as_ref())?;

    w.write_u32::<LittleEndian>(parts.globals.len() as u32)?;
    for global in &parts.globals {
        write_global(w, global)?;
    }

    w.write_u32::<LittleEndian>(parts.exits.len() as u32)?;
    for exit in &parts.exits {
        for v in [
            exit.ffi_index,
            exit.global_data_offset,
            exit.interp_code_offset,
            exit.optimized_code_offset,
        ] {
            w.write_u32::<LittleEndian>(v)?;
        }
    }

    w.write_u32::<LittleEndian>(parts.exports.len() as u32)?;
    for export in &parts.exports {
        write_export(w, export)?;
    }

    w.write_u32::<LittleEndian>(parts.call_sites.len() as u32)?;
    for site in &parts.call_sites {
        for v in [
            site.return_address_offset,
            site.kind as u32,
            site.line,
            site.column,
            site.stack_depth,
        ] {
            w.write_u32::<LittleEndian>(v)?;
        }
    }

    w.write_u32::<LittleEndian>(parts.code_ranges.len() as u32)?;
    for range in &parts.code_ranges {
        write_code_range(w, range)?;
    }

    w.write_u32::<LittleEndian>(parts.func_ptr_tables.len() as u32)?;
    for table in &parts.func_ptr_tables {
        w.write_u32::<LittleEndian>(table.global_data_offset)?;
        w.write_u32::<LittleEndian>(table.num_elems)?;
    }

    w.write_u32::<LittleEndian>(parts.builtin_thunk_offsets.len() as u32)?;
    for &offset in &parts.builtin_thunk_offsets {
        w.write_u32::<LittleEndian>(offset)?;
    }

    w.write_u32::<LittleEndian>(parts.names.len() as u32)?;
    for name in &parts.names {
        write_name(w, Some(name))?;
    }

    w.write_u32::<LittleEndian>(parts.heap_accesses.len() as u32)?;
    for access in &parts.heap_accesses {
        w.write_u32::<LittleEndian>(access.offset)?;
        w.write_u32::<LittleEndian>(access.length_check_at)?;
        w.write_u32::<LittleEndian>(access.base_disp_at)?;
    }

    write_static_link_data(w, &parts.static_link_data)
}

/// Decode the tables and code of a module without allocating an image.
pub fn read_parts(r: &mut Reader<'_>) -> Result<(ModuleParts, Vec<u8>), CacheError> {
    let magic = r.bytes(MAGIC.len())?;
    if magic != MAGIC {
        return Err(corrupt("bad magic"));
    }
    if r.u32()? != VERSION {
        return Err(corrupt("unsupported version"));
    }
    let (header, counts) = read_header(r)?;
    let code = r.bytes(header.code_bytes as usize)?;

    let global_argument_name = read_name(r)?;
    let import_argument_name = read_name(r)?;
    let buffer_argument_name = read_name(r)?;

    let n = expect_count(r.count(8)?, counts.globals)?;
    let mut globals = Vec::with_capacity(n);
    for _ in 0..n {
        globals.push(read_global(r)?);
    }

    let n = expect_count(r.count(EXIT_BYTES)?, counts.exits)?;
    let mut exits = Vec::with_capacity(n);
    for _ in 0..n {
        exits.push(Exit {
            ffi_index: r.u32()?,
            global_data_offset: r.u32()?,
            interp_code_offset: r.u32()?,
            optimized_code_offset: r.u32()?,
        });
    }

    let n = expect_count(r.count(28)?, counts.exports)?;
    let mut exports = Vec::with_capacity(n);
    for _ in 0..n {
        exports.push(read_export(r)?);
    }

    let n = expect_count(r.count(CALL_SITE_BYTES)?, counts.call_sites)?;
    let mut call_sites = Vec::with_capacity(n);
    for _ in 0..n {
        let return_address_offset = r.u32()?;
        let kind = CallSiteKind::from_u32(r.u32()?).ok_or_else(|| corrupt("bad call site kind"))?;
        call_sites.push(CallSite {
            return_address_offset,
            kind,
            line: r.u32()?,
            column: r.u32()?,
            stack_depth: r.u32()?,
        });
    }

    let n = expect_count(r.count(CODE_RANGE_BYTES)?, counts.code_ranges)?;
    let mut code_ranges = Vec::with_capacity(n);
    for _ in 0..n {
        code_ranges.push(read_code_range(r)?);
    }

    let n = expect_count(r.count(FUNC_PTR_TABLE_BYTES)?, counts.func_ptr_tables)?;
    let mut func_ptr_tables = Vec::with_capacity(n);
    for _ in 0..n {
        func_ptr_tables.push(FuncPtrTable {
            global_data_offset: r.u32()?,
            num_elems: r.u32()?,
        });
    }

    let n = r.count(4)?;
    if n != Builtin::COUNT {
        return Err(corrupt("builtin thunk table has the wrong length"));
    }
    let mut builtin_thunk_offsets = Vec::with_capacity(n);
    for _ in 0..n {
        builtin_thunk_offsets.push(r.u32()?);
    }

    let n = expect_count(r.count(4)?, counts.names)?;
    let mut names = Vec::with_capacity(n);
    for _ in 0..n {
        names.push(read_present_name(r)?);
    }

    let n = expect_count(r.count(HEAP_ACCESS_BYTES)?, counts.heap_accesses)?;
    let mut heap_accesses = Vec::with_capacity(n);
    for _ in 0..n {
        heap_accesses.push(HeapAccess {
            offset: r.u32()?,
            length_check_at: r.u32()?,
            base_disp_at: r.u32()?,
        });
    }

    let static_link_data = read_static_link_data(r, &counts)?;

    let parts = ModuleParts {
        header,
        global_argument_name,
        import_argument_name,
        buffer_argument_name,
        globals,
        exits,
        exports,
        call_sites,
        code_ranges,
        func_ptr_tables,
        builtin_thunk_offsets,
        names,
        heap_accesses,
        static_link_data,
    };
    validate(&parts)?;
    Ok((parts, code))
}

/// Decode a module and allocate its image. The result is unlinked.
pub fn read_module(r: &mut Reader<'_>, filename: String) -> Result<Module, CacheError> {
    let (parts, code) = read_parts(r)?;
    Ok(Module::from_parts(parts, &code, filename)?)
}

/// Every offset a later patch touches must lie inside the image, and the
/// searchable tables must be sorted.
fn validate(parts: &ModuleParts) -> Result<(), CacheError> {
    let h = &parts.header;
    let width = h.arch.pointer_width() as u64;
    let code = h.code_bytes as u64;
    let global_data = h.global_data_bytes as u64;
    let in_code = |at: u32, len: u64| at as u64 + len <= code;
    let in_global_data = |at: u32, len: u64| at as u64 + len <= global_data;
    let optional_in_code = |at: u32, len: u64| at == NO_OFFSET || in_code(at, len);
    let out_of_range = || corrupt("offset out of range");

    let mut call_sites = parts.call_sites.clone();
    let mut code_ranges = parts.code_ranges.clone();
    let mut heap_accesses = parts.heap_accesses.clone();
    if sort_call_sites(&mut call_sites).is_err()
        || sort_code_ranges(&mut code_ranges).is_err()
        || sort_heap_accesses(&mut heap_accesses).is_err()
        || call_sites != parts.call_sites
        || code_ranges != parts.code_ranges
        || heap_accesses != parts.heap_accesses
    {
        return Err(corrupt("unsorted table"));
    }

    let globals_in_range = parts.globals.iter().all(|g| match g.kind {
        GlobalKind::Variable { index, .. } => index < h.num_global_vars,
        GlobalKind::Ffi { ffi_index } => ffi_index < h.num_ffis,
        _ => true,
    });
    if !globals_in_range || !parts.exits.iter().all(|e| e.ffi_index < h.num_ffis) {
        return Err(corrupt("global or import index out of range"));
    }

    // The reserved profiling slot must fit in front of the epilogue.
    let jump_slot = match h.arch {
        Arch::AArch64 => 4,
        Arch::X86 | Arch::X64 => 2,
    };
    if !parts.code_ranges.iter().filter(|r| r.is_function()).all(|r| {
        r.name_index().is_some_and(|i| (i as usize) < parts.names.len())
            && match (r.profiling_jump(), r.profiling_epilogue()) {
                (Some(jump), Some(epilogue)) => jump as u64 + jump_slot <= epilogue as u64,
                _ => false,
            }
    }) {
        return Err(corrupt("bad function range"));
    }

    if !parts.exits.iter().all(|e| {
        in_global_data(e.global_data_offset, 16)
            && e.global_data_offset % 8 == 0
            && in_code(e.interp_code_offset, 1)
            && in_code(e.optimized_code_offset, 1)
    }) || !parts.exports.iter().all(|e| in_code(e.code_offset, 1))
        || !parts
            .call_sites
            .iter()
            .all(|s| s.return_address_offset >= 4 && in_code(s.return_address_offset, 0))
        || !parts.code_ranges.iter().all(|r| in_code(r.end, 0))
        || !parts.func_ptr_tables.iter().all(|t| {
            t.global_data_offset % 8 == 0 && in_global_data(t.global_data_offset, 8 * t.num_elems as u64)
        })
        || !parts.builtin_thunk_offsets.iter().all(|&o| optional_in_code(o, 1))
        || !parts.heap_accesses.iter().all(|a| {
            in_code(a.offset, 1) && optional_in_code(a.length_check_at, 8) && optional_in_code(a.base_disp_at, 8)
        })
        || !optional_in_code(parts.static_link_data.interrupt_exit_offset, 1)
    {
        return Err(out_of_range());
    }

    let image = code + global_data;
    if !parts
        .static_link_data
        .relative_links
        .iter()
        .all(|l| l.patch_at as u64 + width <= image && (l.target as u64) < image)
        || !parts
            .static_link_data
            .absolute_links
            .iter()
            .all(|(_, offsets)| offsets.iter().all(|&at| in_code(at, width)))
    {
        return Err(out_of_range());
    }
    Ok(())
}
