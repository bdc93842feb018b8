//! Executable memory for module images.
//!
//! A module image is one anonymous mapping holding the generated code
//! followed by the module's global data. The mapping is readable, writable
//! and executable for its whole life: code is patched in place at link time
//! and when profiling is toggled, and the global data is written by running
//! code. Every write into the mapping goes through [`ExecutableMemory::write`],
//! [`ExecutableMemory::apply_patch`] or [`ExecutableMemory::store_word`].

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::LinkError;

/// Host page size. Image sizes and the protected function region are
/// multiples of this.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// Round `n` up to a multiple of `align` (a power of two).
pub fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Access rights for the function region of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults; used while an interrupt is pending.
    NoAccess,
    /// Normal state: code may run and be patched.
    ReadWriteExecute,
}

/// A write of up to eight bytes at an image-relative offset.
///
/// Patches are built by the instruction-set encoders from the current
/// contents of the image and then applied in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    at: u32,
    len: u8,
    bytes: [u8; 8],
}

impl Patch {
    pub fn bytes(at: u32, data: &[u8]) -> Self {
        assert!(data.len() <= 8, "patch wider than 8 bytes");
        let mut bytes = [0u8; 8];
        bytes[..data.len()].copy_from_slice(data);
        Self {
            at,
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn u32(at: u32, value: u32) -> Self {
        Self::bytes(at, &value.to_le_bytes())
    }

    pub fn u64(at: u32, value: u64) -> Self {
        Self::bytes(at, &value.to_le_bytes())
    }

    /// A pointer-sized little-endian word (4 or 8 bytes).
    pub fn word(at: u32, value: u64, width: usize) -> Self {
        match width {
            4 => Self::u32(at, value as u32),
            _ => Self::u64(at, value),
        }
    }

    pub fn offset(&self) -> u32 {
        self.at
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// A page-aligned, read-write-execute anonymous mapping.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
}

impl ExecutableMemory {
    /// Map `size` bytes (a non-zero multiple of the page size).
    /// The mapping starts zero-filled.
    pub fn new(size: usize) -> Result<Self, LinkError> {
        if size == 0 || size % page_size() != 0 {
            return Err(LinkError::Allocation { bytes: size });
        }
        let ptr = Self::mmap_alloc(size)?;
        Ok(Self { ptr, size })
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, LinkError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(LinkError::Allocation { bytes: size });
        }

        NonNull::new(ptr as *mut u8).ok_or(LinkError::Allocation { bytes: size })
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, LinkError> {
        Err(LinkError::Allocation { bytes: size })
    }

    /// Base address of the image.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Absolute address of an image offset.
    pub fn address(&self, offset: u32) -> usize {
        self.ptr.as_ptr() as usize + offset as usize
    }

    /// Image offset of an absolute address, if it falls inside the mapping.
    pub fn offset_of(&self, addr: usize) -> Option<u32> {
        let base = self.ptr.as_ptr() as usize;
        if addr >= base && addr < base + self.size {
            Some((addr - base) as u32)
        } else {
            None
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `data` into the image. Used to install code before linking.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), LinkError> {
        if offset + data.len() > self.size {
            return Err(LinkError::Codegen(format!(
                "write of {} bytes at {} overflows image of {} bytes",
                data.len(),
                offset,
                self.size
            )));
        }
        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }
        Ok(())
    }

    /// View a range of the image.
    ///
    /// Callers hold `&self` of the owning module, which excludes code
    /// patching for the lifetime of the slice.
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.size, "image read out of range");
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    pub fn read_u8(&self, at: u32) -> u8 {
        self.bytes(at as usize, 1)[0]
    }

    pub fn read_u32(&self, at: u32) -> u32 {
        let b = self.bytes(at as usize, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn read_u64(&self, at: u32) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.bytes(at as usize, 8));
        u64::from_le_bytes(word)
    }

    /// Read a pointer-sized word of `width` bytes.
    pub fn read_word(&self, at: u32, width: usize) -> u64 {
        match width {
            4 => self.read_u32(at) as u64,
            _ => self.read_u64(at),
        }
    }

    /// Apply one patch. This is the only path by which linked code changes.
    pub fn apply_patch(&self, patch: &Patch) {
        let data = patch.data();
        let at = patch.offset() as usize;
        assert!(at + data.len() <= self.size, "patch out of range");
        log::trace!("patch {:#x}: {:02x?}", at, data);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(at), data.len());
        }
    }

    /// Atomically store an 8-byte word in global data.
    pub fn store_word(&self, at: u32, value: u64) {
        let at = at as usize;
        assert!(at % 8 == 0 && at + 8 <= self.size, "misaligned global word");
        let cell = unsafe { &*(self.ptr.as_ptr().add(at) as *const AtomicU64) };
        cell.store(value, Ordering::Release);
    }

    /// Atomically load an 8-byte word from global data.
    pub fn load_word(&self, at: u32) -> u64 {
        let at = at as usize;
        assert!(at % 8 == 0 && at + 8 <= self.size, "misaligned global word");
        let cell = unsafe { &*(self.ptr.as_ptr().add(at) as *const AtomicU64) };
        cell.load(Ordering::Acquire)
    }

    /// Change the protection of the first `len` bytes of the image.
    #[cfg(unix)]
    pub fn protect(&self, len: usize, protection: Protection) -> Result<(), LinkError> {
        if len == 0 {
            return Ok(());
        }
        let prot = match protection {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        };
        let result = unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, len, prot) };
        if result != 0 {
            return Err(LinkError::Protection);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn protect(&self, _len: usize, _protection: Protection) -> Result<(), LinkError> {
        Err(LinkError::Protection)
    }

    /// Make instruction fetch observe writes to `[offset, offset + len)`.
    pub fn flush_icache(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.size);
        #[cfg(all(target_arch = "aarch64", unix))]
        unsafe {
            unsafe extern "C" {
                fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
            }
            let start = self.ptr.as_ptr().add(offset) as *mut libc::c_char;
            __clear_cache(start, start.add(len));
        }
        // x86 keeps instruction and data caches coherent.
        #[cfg(not(all(target_arch = "aarch64", unix)))]
        let _ = (offset, len);
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("base", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

// The mapping is owned exclusively; cross-thread writes are limited to
// atomic global-data words.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_memory() {
        let mem = ExecutableMemory::new(page_size()).unwrap();
        assert_eq!(mem.size(), page_size());
        assert_eq!(mem.as_ptr() as usize % page_size(), 0);
        assert!(mem.bytes(0, 16).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rejects_unaligned_size() {
        assert!(matches!(
            ExecutableMemory::new(100),
            Err(LinkError::Allocation { bytes: 100 })
        ));
        assert!(ExecutableMemory::new(0).is_err());
    }

    #[test]
    fn test_write_and_patch() {
        let mut mem = ExecutableMemory::new(page_size()).unwrap();
        mem.write(0, &[0x90, 0x90, 0x90, 0x90]).unwrap();
        mem.apply_patch(&Patch::u32(0, 0xDEADBEEF));
        assert_eq!(mem.read_u32(0), 0xDEADBEEF);
        mem.apply_patch(&Patch::bytes(1, &[0x66, 0x90]));
        assert_eq!(mem.bytes(0, 4), &[0xEF, 0x66, 0x90, 0xDE]);
    }

    #[test]
    fn test_write_overflow() {
        let mut mem = ExecutableMemory::new(page_size()).unwrap();
        assert!(mem.write(page_size() - 2, &[0; 4]).is_err());
    }

    #[test]
    fn test_words() {
        let mem = ExecutableMemory::new(page_size()).unwrap();
        mem.store_word(64, 0x1122_3344_5566_7788);
        assert_eq!(mem.load_word(64), 0x1122_3344_5566_7788);
        assert_eq!(mem.read_word(64, 4), 0x5566_7788);
        assert_eq!(mem.offset_of(mem.address(64)), Some(64));
        assert_eq!(mem.offset_of(mem.address(0) + page_size()), None);
    }

    #[test]
    fn test_protect_roundtrip() {
        let mem = ExecutableMemory::new(page_size() * 2).unwrap();
        mem.protect(page_size(), Protection::NoAccess).unwrap();
        mem.protect(page_size(), Protection::ReadWriteExecute).unwrap();
        mem.apply_patch(&Patch::u64(0, 7));
        assert_eq!(mem.read_u64(0), 7);
    }
}
