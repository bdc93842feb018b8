//! Dependencies of upgraded exits on external optimized code.
//!
//! When an exit is switched to call an external function's optimized code
//! directly, that code must not go away unnoticed. The registry maps each
//! piece of external code to the exits calling it, by module id and exit
//! index. Invalidating the code reverts those exits to the generic path;
//! entries whose module has been dropped are skipped.

use std::collections::HashMap;
use std::collections::TryReserveError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::module::exits::ExitSlots;

/// Process-unique module identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModuleId(u64);

impl ModuleId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ModuleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a piece of external optimized code, chosen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CodeId(pub u64);

struct Dependent {
    module: ModuleId,
    exit_index: u32,
    /// Entry the exit was upgraded to; reverting is skipped if the exit
    /// has since moved elsewhere.
    entry: usize,
    slots: Weak<ExitSlots>,
}

#[derive(Default)]
pub struct DependencyRegistry {
    dependents: Mutex<HashMap<CodeId, Vec<Dependent>>>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every module in the process.
    pub fn global() -> &'static DependencyRegistry {
        static GLOBAL: OnceLock<DependencyRegistry> = OnceLock::new();
        GLOBAL.get_or_init(DependencyRegistry::new)
    }

    /// Record that exit `exit_index` of `module` calls `code` at `entry`.
    /// Fails only on allocation failure, leaving the registry unchanged.
    pub fn register(
        &self,
        code: CodeId,
        module: ModuleId,
        exit_index: u32,
        entry: usize,
        slots: &Arc<ExitSlots>,
    ) -> Result<(), TryReserveError> {
        let mut dependents = self.dependents.lock();
        dependents.try_reserve(1)?;
        let list = dependents.entry(code).or_default();
        if let Some(existing) = list
            .iter_mut()
            .find(|d| d.module == module && d.exit_index == exit_index)
        {
            existing.entry = entry;
            existing.slots = Arc::downgrade(slots);
            return Ok(());
        }
        list.try_reserve(1)?;
        list.push(Dependent {
            module,
            exit_index,
            entry,
            slots: Arc::downgrade(slots),
        });
        Ok(())
    }

    /// `code` was deoptimized or discarded: revert every exit still calling
    /// it. Returns the number of exits reverted.
    pub fn invalidate(&self, code: CodeId) -> usize {
        let Some(list) = self.dependents.lock().remove(&code) else {
            return 0;
        };
        let mut reverted = 0;
        for dependent in list {
            let Some(slots) = dependent.slots.upgrade() else {
                continue;
            };
            if slots.revert_if_calling(dependent.exit_index, dependent.entry) {
                log::debug!(
                    "module {} exit {} reverted to generic path",
                    dependent.module,
                    dependent.exit_index
                );
                reverted += 1;
            }
        }
        reverted
    }

    /// Drop every entry belonging to `module`.
    pub fn unregister_module(&self, module: ModuleId) {
        let mut dependents = self.dependents.lock();
        dependents.retain(|_, list| {
            list.retain(|d| d.module != module);
            !list.is_empty()
        });
    }

    pub fn dependent_count(&self, code: CodeId) -> usize {
        self.dependents.lock().get(&code).map_or(0, Vec::len)
    }
}

impl fmt::Debug for DependencyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyRegistry")
            .field("codes", &self.dependents.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_ids_are_unique() {
        let a = ModuleId::next();
        let b = ModuleId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_invalidate_skips_dropped_modules() {
        let registry = DependencyRegistry::new();
        let slots = Arc::new(ExitSlots::detached(1));
        let module = ModuleId::next();
        registry.register(CodeId(7), module, 0, 0x1000, &slots).unwrap();
        assert_eq!(registry.dependent_count(CodeId(7)), 1);
        drop(slots);
        assert_eq!(registry.invalidate(CodeId(7)), 0);
        assert_eq!(registry.dependent_count(CodeId(7)), 0);
        assert_eq!(registry.invalidate(CodeId(7)), 0);
    }

    #[test]
    fn test_register_is_deduplicated() {
        let registry = DependencyRegistry::new();
        let slots = Arc::new(ExitSlots::detached(2));
        let module = ModuleId::next();
        registry.register(CodeId(1), module, 1, 0x10, &slots).unwrap();
        registry.register(CodeId(1), module, 1, 0x20, &slots).unwrap();
        registry.register(CodeId(1), module, 0, 0x20, &slots).unwrap();
        assert_eq!(registry.dependent_count(CodeId(1)), 2);
        registry.unregister_module(module);
        assert_eq!(registry.dependent_count(CodeId(1)), 0);
    }
}
