//! Persistent module cache.
//!
//! An entry is the machine id, the source fingerprint and the module
//! encoding, in that order. Storing and looking up never fail from the
//! caller's point of view: every problem is logged and becomes "not
//! stored" or a miss, and the caller compiles as usual.

pub mod codec;
pub mod fingerprint;
pub mod machine;
pub mod store;

use std::time::Instant;

use serde::Serialize;

use crate::error::CacheError;
use crate::module::{Module, ModuleHeader};
use crate::resolver::SymbolResolver;
use codec::{Reader, TableCounts};

pub use fingerprint::{ModuleChars, ScriptSource};
pub use machine::MachineId;
pub use store::{CacheKey, CacheStore, FileCacheStore, MemoryCacheStore};

/// Why `module` cannot be written to the cache, if it cannot.
pub fn uncacheable_reason(module: &Module) -> Option<&'static str> {
    if module.num_function_counts() > 0 {
        // Counters are compiled in as absolute addresses.
        return Some("module has instrumentation counters");
    }
    if module.profiling_enabled() {
        return Some("profiling is enabled");
    }
    if module.arch().heap_base_in_code() && module.heap().is_some() {
        return Some("heap base is folded into the code");
    }
    None
}

/// Encode a complete entry.
pub fn serialize_entry(
    machine: &MachineId,
    chars: &ModuleChars,
    module: &Module,
) -> Result<Vec<u8>, CacheError> {
    let mut entry = Vec::with_capacity(module.header().code_bytes as usize + 4096);
    machine.write(&mut entry)?;
    chars.write(&mut entry)?;
    codec::write_module(&mut entry, module)?;
    Ok(entry)
}

/// Write `module`, compiled from `source[begin..end]`, to `store`.
/// Returns whether an entry was written.
pub fn store_module_in_cache(
    store: &dyn CacheStore,
    source: &ScriptSource<'_>,
    begin: u32,
    end: u32,
    module: &Module,
    machine: &MachineId,
) -> bool {
    if let Some(reason) = uncacheable_reason(module) {
        log::debug!("{}: module {} not cached: {}", source.filename, module.id(), reason);
        return false;
    }
    if machine.arch() != Some(module.arch()) {
        log::debug!(
            "{}: module {} targets {:?}, machine id does not",
            source.filename,
            module.id(),
            module.arch()
        );
        return false;
    }
    let (Some(key), Some(chars)) = (
        CacheKey::for_source(source.text, begin as usize),
        ModuleChars::for_store(source, begin, end),
    ) else {
        log::debug!("{}: empty module source range {}..{}", source.filename, begin, end);
        return false;
    };

    let result = serialize_entry(machine, &chars, module)
        .and_then(|entry| store.store(&key, &entry).map(|()| entry.len()));
    match result {
        Ok(bytes) => {
            log::debug!(
                "{}: module {} stored as {:?} ({} bytes)",
                source.filename,
                module.id(),
                key,
                bytes
            );
            true
        }
        Err(e) => {
            log::warn!("{}: cache store failed: {}", source.filename, e);
            false
        }
    }
}

/// Find a module for the source starting at `begin` and statically link
/// it with `resolver`.
pub fn lookup_module_in_cache(
    store: &dyn CacheStore,
    source: &ScriptSource<'_>,
    begin: u32,
    machine: &MachineId,
    resolver: &dyn SymbolResolver,
) -> Option<Module> {
    let started = Instant::now();
    let key = CacheKey::for_source(source.text, begin as usize)?;
    let entry = match store.load(&key) {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            log::trace!("{}: no cache entry {:?}", source.filename, key);
            return None;
        }
        Err(e) => {
            log::warn!("{}: cache read failed: {}", source.filename, e);
            return None;
        }
    };

    let mut module = match decode_entry(&entry, source, begin, machine) {
        Ok(Some(module)) => module,
        Ok(None) => return None,
        Err(e) => {
            log::warn!("{}: discarding cache entry {:?}: {}", source.filename, key, e);
            return None;
        }
    };
    if let Err(e) = module.static_link(resolver) {
        log::warn!("{}: cached module failed to link: {}", source.filename, e);
        return None;
    }
    log::info!(
        "{}: loaded from cache in {}ms",
        source.filename,
        started.elapsed().as_millis()
    );
    Some(module)
}

/// Decode an entry. `Ok(None)` is a regular miss.
fn decode_entry(
    entry: &[u8],
    source: &ScriptSource<'_>,
    begin: u32,
    machine: &MachineId,
) -> Result<Option<Module>, CacheError> {
    let mut r = Reader::new(entry);
    let cached = MachineId::read(&mut r)?;
    if cached != *machine {
        log::debug!("{}: cache entry from another machine or build", source.filename);
        return Ok(None);
    }
    let chars = ModuleChars::read(&mut r)?;
    if !chars.matches(source, begin) {
        log::debug!("{}: cache entry for different source", source.filename);
        return Ok(None);
    }
    let module = codec::read_module(&mut r, source.filename.to_string())?;
    if !r.is_at_end() {
        return Err(CacheError::Corrupt("trailing bytes after module"));
    }
    Ok(Some(module))
}

/// Contents of an entry, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntrySummary {
    pub machine: MachineId,
    pub source_bytes: usize,
    pub header: ModuleHeader,
    pub tables: TableCounts,
    pub exports: Vec<String>,
    pub entry_bytes: usize,
}

/// Decode an entry without allocating a module image.
pub fn inspect_entry(entry: &[u8]) -> Result<CacheEntrySummary, CacheError> {
    let mut r = Reader::new(entry);
    let machine = MachineId::read(&mut r)?;
    let chars = ModuleChars::read(&mut r)?;
    let (parts, _code) = codec::read_parts(&mut r)?;
    if !r.is_at_end() {
        return Err(CacheError::Corrupt("trailing bytes after module"));
    }
    Ok(CacheEntrySummary {
        machine,
        source_bytes: chars.len(),
        header: parts.header,
        tables: TableCounts::of(&parts),
        exports: parts.exports.iter().map(|e| e.name.to_string()).collect(),
        entry_bytes: entry.len(),
    })
}
