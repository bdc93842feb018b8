//! Code protection and the process-wide interrupt lock.
//!
//! An embedder interrupts running code by protecting its function pages;
//! the next instruction fetch faults and the fault handler redirects to the
//! module's interrupt exit. Protection state and every in-place code patch
//! are serialized behind one lock so the handler never observes a
//! half-written instruction.

use std::sync::atomic::Ordering;

use parking_lot::{Mutex, MutexGuard, const_mutex};

use super::Module;
use crate::error::LinkError;
use crate::jit::memory::Protection;

static INTERRUPT_LOCK: Mutex<()> = const_mutex(());

/// Proof that the caller holds the interrupt lock. Dropping it releases
/// the lock.
pub struct InterruptGuard {
    _guard: MutexGuard<'static, ()>,
}

impl std::fmt::Debug for InterruptGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InterruptGuard")
    }
}

pub struct InterruptLock;

impl InterruptLock {
    pub fn acquire() -> InterruptGuard {
        InterruptGuard {
            _guard: INTERRUPT_LOCK.lock(),
        }
    }

    /// Non-blocking acquisition for contexts that must not wait, such as a
    /// fault handler.
    pub fn try_acquire() -> Option<InterruptGuard> {
        INTERRUPT_LOCK.try_lock().map(|g| InterruptGuard { _guard: g })
    }

    pub fn is_held() -> bool {
        INTERRUPT_LOCK.is_locked()
    }
}

impl Module {
    /// Make the function pages inaccessible.
    pub fn protect_code(&self, _lock: &InterruptGuard) -> Result<(), LinkError> {
        debug_assert!(InterruptLock::is_held());
        if !self.statically_linked {
            return Err(LinkError::LinkState("protecting code that is not linked"));
        }
        if self.code_protected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.image
            .protect(self.header.function_bytes as usize, Protection::NoAccess)?;
        self.code_protected.store(true, Ordering::Release);
        log::trace!("module {} code protected", self.id);
        Ok(())
    }

    /// Restore access to the function pages.
    pub fn unprotect_code(&self, _lock: &InterruptGuard) -> Result<(), LinkError> {
        debug_assert!(InterruptLock::is_held());
        if !self.code_protected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.image
            .protect(self.header.function_bytes as usize, Protection::ReadWriteExecute)?;
        self.code_protected.store(false, Ordering::Release);
        log::trace!("module {} code unprotected", self.id);
        Ok(())
    }

    pub fn code_is_protected(&self, _lock: &InterruptGuard) -> bool {
        self.code_protected.load(Ordering::Acquire)
    }
}

/// Holds the interrupt lock with the module's code accessible; restores
/// the previous protection on drop, including on early returns.
pub struct UnprotectScope<'m> {
    module: &'m Module,
    guard: InterruptGuard,
    was_protected: bool,
}

impl<'m> UnprotectScope<'m> {
    pub fn new(module: &'m Module) -> Result<Self, LinkError> {
        let guard = InterruptLock::acquire();
        let was_protected = module.code_is_protected(&guard);
        if was_protected {
            module.unprotect_code(&guard)?;
        }
        Ok(Self {
            module,
            guard,
            was_protected,
        })
    }

    pub fn guard(&self) -> &InterruptGuard {
        &self.guard
    }
}

impl Drop for UnprotectScope<'_> {
    fn drop(&mut self) {
        if self.was_protected {
            if let Err(e) = self.module.protect_code(&self.guard) {
                log::error!("failed to re-protect module {}: {}", self.module.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let guard = InterruptLock::acquire();
        assert!(InterruptLock::is_held());
        assert!(InterruptLock::try_acquire().is_none());
        drop(guard);
        let _again = InterruptLock::acquire();
        assert!(InterruptLock::is_held());
    }
}
