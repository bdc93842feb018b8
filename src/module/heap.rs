//! Linear-memory buffers and binding them to a module.

use std::ptr::NonNull;
use std::sync::Arc;

use super::Module;
use super::protect::UnprotectScope;
use crate::error::LinkError;
use crate::jit::memory::{Patch, align_up, page_size};

/// Bytes reserved past the end of a guard-page heap. Any 32-bit index
/// from the heap base lands inside the reservation.
#[cfg(target_pointer_width = "64")]
pub const GUARD_REGION: usize = 1 << 32;

const MIN_POW2_LENGTH: usize = 4096;
const LARGE_LENGTH_UNIT: usize = 16 * 1024 * 1024;

/// Length granularity: a power of two in [4 KiB, 16 MiB], or a multiple of
/// 16 MiB.
pub fn is_valid_heap_length(length: usize) -> bool {
    if length < MIN_POW2_LENGTH {
        return false;
    }
    if length <= LARGE_LENGTH_UNIT {
        return length.is_power_of_two();
    }
    length % LARGE_LENGTH_UNIT == 0
}

/// Smallest valid heap length that is at least `length`.
pub fn round_up_heap_length(length: usize) -> usize {
    if length <= MIN_POW2_LENGTH {
        return MIN_POW2_LENGTH;
    }
    if length <= LARGE_LENGTH_UNIT {
        return length.next_power_of_two();
    }
    align_up(length, LARGE_LENGTH_UNIT)
}

/// The module's accepted heap lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapPolicy {
    pub min_length: usize,
    pub max_length: usize,
}

impl HeapPolicy {
    pub fn check(&self, length: usize) -> Result<(), LinkError> {
        if length < self.min_length || length > self.max_length || !is_valid_heap_length(length) {
            return Err(LinkError::InvalidHeapLength {
                length,
                min: self.min_length,
                max: self.max_length,
            });
        }
        Ok(())
    }
}

/// A zero-initialized linear-memory buffer.
pub struct HeapBuffer {
    ptr: NonNull<u8>,
    len: usize,
    mapped: usize,
    guard_pages: bool,
}

impl HeapBuffer {
    /// Map `len` readable and writable bytes.
    pub fn new(len: usize) -> Result<Self, LinkError> {
        let mapped = align_up(len.max(1), page_size());
        let ptr = map(mapped, true)?;
        Ok(Self {
            ptr,
            len,
            mapped,
            guard_pages: false,
        })
    }

    /// Map `len` usable bytes followed by an inaccessible reservation, so
    /// out-of-bounds 32-bit indices fault instead of needing explicit
    /// checks.
    #[cfg(target_pointer_width = "64")]
    pub fn with_guard_pages(len: usize) -> Result<Self, LinkError> {
        let usable = align_up(len.max(1), page_size());
        let mapped = usable + GUARD_REGION;
        let ptr = map(mapped, false)?;
        let heap = Self {
            ptr,
            len,
            mapped,
            guard_pages: true,
        };
        heap.make_accessible(usable)?;
        Ok(heap)
    }

    #[cfg(not(target_pointer_width = "64"))]
    pub fn with_guard_pages(len: usize) -> Result<Self, LinkError> {
        let _ = len;
        Err(LinkError::LinkState("guard-page heaps need a 64-bit host"))
    }

    #[cfg(unix)]
    fn make_accessible(&self, len: usize) -> Result<(), LinkError> {
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if result != 0 {
            return Err(LinkError::Protection);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn make_accessible(&self, _len: usize) -> Result<(), LinkError> {
        Err(LinkError::Protection)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has_guard_pages(&self) -> bool {
        self.guard_pages
    }

    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len, "heap read out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// Generated code may write the buffer concurrently; callers coordinate.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "heap write out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        let mut word = [0u8; 4];
        self.read(offset, &mut word);
        i32::from_le_bytes(word)
    }

    pub fn write_i32(&self, offset: usize, value: i32) {
        self.write(offset, &value.to_le_bytes());
    }
}

#[cfg(unix)]
fn map(len: usize, accessible: bool) -> Result<NonNull<u8>, LinkError> {
    let (prot, extra) = if accessible {
        (libc::PROT_READ | libc::PROT_WRITE, 0)
    } else {
        (libc::PROT_NONE, libc::MAP_NORESERVE)
    };
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(LinkError::Allocation { bytes: len });
    }
    NonNull::new(ptr as *mut u8).ok_or(LinkError::Allocation { bytes: len })
}

#[cfg(not(unix))]
fn map(len: usize, _accessible: bool) -> Result<NonNull<u8>, LinkError> {
    Err(LinkError::Allocation { bytes: len })
}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.mapped);
        }
    }
}

impl std::fmt::Debug for HeapBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("base", &self.ptr)
            .field("len", &self.len)
            .field("guard_pages", &self.guard_pages)
            .finish()
    }
}

unsafe impl Send for HeapBuffer {}
unsafe impl Sync for HeapBuffer {}

impl Module {
    pub fn heap_policy(&self) -> HeapPolicy {
        HeapPolicy {
            min_length: self.header.min_heap_length as usize,
            max_length: self.header.max_heap_length as usize,
        }
    }

    pub fn heap(&self) -> Option<&Arc<HeapBuffer>> {
        self.heap.as_ref()
    }

    /// Attach `heap`: store its base in global data and patch the code's
    /// heap operands. Nothing is patched if the buffer is rejected.
    pub fn init_heap(&mut self, heap: Arc<HeapBuffer>) -> Result<(), LinkError> {
        if !self.statically_linked {
            return Err(LinkError::LinkState("heap attached before static link"));
        }
        if self.heap.is_some() {
            return Err(LinkError::LinkState("heap already attached; restore first"));
        }
        self.heap_policy().check(heap.len())?;
        let heap_length = u32::try_from(heap.len()).map_err(|_| LinkError::InvalidHeapLength {
            length: heap.len(),
            min: self.header.min_heap_length as usize,
            max: self.header.max_heap_length as usize,
        })?;
        let uses_signal_handlers = self.header.uses_signal_handlers;
        if uses_signal_handlers && !heap.has_guard_pages() {
            return Err(LinkError::MissingGuardPages { length: heap.len() });
        }

        let isa = self.header.arch.instruction_set();
        let mut patches = self.heap_base_patches(heap.address() as i64)?;
        if !uses_signal_handlers {
            for access in self.heap_accesses.iter().filter(|a| a.has_length_check()) {
                patches.push(isa.length_check(&self.image, access.length_check_at, heap_length));
            }
        }
        {
            let _scope = UnprotectScope::new(self)?;
            self.image.store_word(self.global_data_offset(0), heap.address() as u64);
            for patch in &patches {
                self.image.apply_patch(patch);
            }
            self.image.flush_icache(0, self.header.code_bytes as usize);
        }

        log::debug!(
            "module {} heap attached: {} bytes at {:#x}{}",
            self.id,
            heap.len(),
            heap.address(),
            if uses_signal_handlers { " (guard pages)" } else { "" }
        );
        self.heap = Some(heap);
        Ok(())
    }

    /// Patches shifting the heap base embedded in heap accesses by `delta`.
    /// Empty unless the target folds the base into the code.
    pub(super) fn heap_base_patches(&self, delta: i64) -> Result<Vec<Patch>, LinkError> {
        if !self.header.arch.heap_base_in_code() {
            return Ok(Vec::new());
        }
        let isa = self.header.arch.instruction_set();
        self.heap_accesses
            .iter()
            .filter(|a| a.has_base_disp())
            .map(|a| isa.rebase_heap_access(&self.image, a.base_disp_at, delta))
            .collect()
    }
}
