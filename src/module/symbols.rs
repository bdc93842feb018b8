//! Offset lookups used by stack walkers, fault handlers and the profiler.
//!
//! All three tables are sorted at finish and never mutated afterwards, so
//! lookups take `&self`, allocate nothing and hold no lock. They are safe
//! to run from a signal handler that interrupted any other operation.

use super::Module;
use super::tables::{CallSite, CodeRange, HeapAccess};
use crate::error::LinkError;

/// The range with `begin <= offset < end`, if any.
pub fn find_code_range(ranges: &[CodeRange], offset: u32) -> Option<&CodeRange> {
    // First range whose end lies past `offset`; ranges do not overlap, so
    // it is the only candidate.
    let index = ranges.partition_point(|r| r.end <= offset);
    ranges.get(index).filter(|r| r.contains(offset))
}

/// The call site whose return address is exactly `offset`.
pub fn find_call_site(sites: &[CallSite], offset: u32) -> Option<&CallSite> {
    sites
        .binary_search_by_key(&offset, |s| s.return_address_offset)
        .ok()
        .map(|i| &sites[i])
}

/// The heap access whose instruction starts exactly at `offset`.
pub fn find_heap_access(accesses: &[HeapAccess], offset: u32) -> Option<&HeapAccess> {
    accesses
        .binary_search_by_key(&offset, |a| a.offset)
        .ok()
        .map(|i| &accesses[i])
}

/// Sort ranges by `begin` and reject overlaps.
pub(crate) fn sort_code_ranges(ranges: &mut [CodeRange]) -> Result<(), LinkError> {
    ranges.sort_by_key(|r| (r.begin, r.end));
    for pair in ranges.windows(2) {
        if pair[0].end > pair[1].begin {
            return Err(LinkError::Codegen(format!(
                "code ranges overlap: {}..{} and {}..{}",
                pair[0].begin, pair[0].end, pair[1].begin, pair[1].end
            )));
        }
    }
    Ok(())
}

/// Sort call sites by return address and reject duplicates.
pub(crate) fn sort_call_sites(sites: &mut [CallSite]) -> Result<(), LinkError> {
    sites.sort_by_key(|s| s.return_address_offset);
    for pair in sites.windows(2) {
        if pair[0].return_address_offset == pair[1].return_address_offset {
            return Err(LinkError::Codegen(format!(
                "duplicate call site at {}",
                pair[0].return_address_offset
            )));
        }
    }
    Ok(())
}

pub(crate) fn sort_heap_accesses(accesses: &mut [HeapAccess]) -> Result<(), LinkError> {
    accesses.sort_by_key(|a| a.offset);
    for pair in accesses.windows(2) {
        if pair[0].offset == pair[1].offset {
            return Err(LinkError::Codegen(format!(
                "duplicate heap access at {}",
                pair[0].offset
            )));
        }
    }
    Ok(())
}

impl Module {
    /// Image offset of `pc` if it points into this module's code.
    fn code_offset_of(&self, pc: usize) -> Option<u32> {
        self.image
            .offset_of(pc)
            .filter(|&off| off < self.header.code_bytes)
    }

    /// The code range containing `pc`.
    pub fn lookup_code_range(&self, pc: usize) -> Option<&CodeRange> {
        find_code_range(&self.code_ranges, self.code_offset_of(pc)?)
    }

    /// The call site whose return address is `return_address`.
    pub fn lookup_call_site(&self, return_address: usize) -> Option<&CallSite> {
        find_call_site(&self.call_sites, self.code_offset_of(return_address)?)
    }

    /// The heap access instruction at `pc`.
    pub fn lookup_heap_access(&self, pc: usize) -> Option<&HeapAccess> {
        find_heap_access(&self.heap_accesses, self.code_offset_of(pc)?)
    }

    /// Same as [`Module::lookup_code_range`] for an image offset.
    pub fn code_range_at(&self, offset: u32) -> Option<&CodeRange> {
        find_code_range(&self.code_ranges, offset)
    }
}
