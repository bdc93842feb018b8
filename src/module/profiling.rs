//! Switching linked code between the fast and the profiling call paths.
//!
//! Each function is emitted with two prologues: `begin` pushes a profiling
//! frame and falls into `entry`, the fast prologue. Enabling profiling
//! retargets internal calls and function-pointer tables to `begin`, turns
//! the reserved epilogue slot into a jump to the profiling epilogue, and
//! routes builtin calls through their frame-pushing thunks. Disabling
//! performs the exact inverse.

use super::Module;
use super::protect::UnprotectScope;
use super::tables::CallSiteKind;
use crate::error::LinkError;
use crate::jit::memory::Patch;
use crate::resolver::Builtin;

impl Module {
    pub fn profiling_enabled(&self) -> bool {
        self.profiling_enabled
    }

    /// Profiler label of the function with name index `name_index`.
    pub fn profiling_label(&self, name_index: u32) -> Option<&str> {
        self.profiling_labels
            .get(name_index as usize)
            .map(String::as_str)
            .filter(|l| !l.is_empty())
    }

    pub fn set_profiling_enabled(&mut self, enabled: bool) -> Result<(), LinkError> {
        if !self.statically_linked {
            return Err(LinkError::LinkState("profiling toggled before static link"));
        }
        if self.profiling_enabled == enabled {
            return Ok(());
        }

        // Every code patch is computed before any is applied, so a slot in
        // the wrong state leaves the module untouched.
        let mut patches = self.call_site_patches(enabled)?;
        patches.extend(self.profiling_jump_patches(enabled)?);
        patches.extend(self.builtin_call_patches(enabled)?);

        if enabled {
            let mut labels = vec![String::new(); self.names.len()];
            for range in self.code_ranges.iter().filter(|r| r.is_function()) {
                if let (Some(index), Some(line)) = (range.name_index(), range.line_number()) {
                    if let Some(name) = self.names.get(index as usize) {
                        labels[index as usize] = format!("{} ({}:{})", name, self.filename, line);
                    }
                }
            }
            self.profiling_labels = labels;
        } else {
            self.profiling_labels = Vec::new();
        }

        {
            let _scope = UnprotectScope::new(self)?;
            for patch in &patches {
                self.image.apply_patch(patch);
            }
            self.toggle_func_ptr_tables(enabled);
            self.image.flush_icache(0, self.header.code_bytes as usize);
        }

        self.profiling_enabled = enabled;
        log::debug!(
            "module {} profiling {}: {} code patches",
            self.id,
            if enabled { "enabled" } else { "disabled" },
            patches.len()
        );
        Ok(())
    }

    /// Point direct calls to function ranges at the profiling prologue or
    /// back at the fast entry.
    fn call_site_patches(&self, enabled: bool) -> Result<Vec<Patch>, LinkError> {
        let isa = self.header.arch.instruction_set();
        let mut patches = Vec::new();
        for site in self
            .call_sites
            .iter()
            .filter(|s| s.kind == CallSiteKind::Relative)
        {
            let callee = isa.call_target(&self.image, site.return_address_offset)?;
            let Some(range) = self.code_range_at(callee) else {
                continue;
            };
            let Some(entry) = range.entry() else {
                continue;
            };
            let (from, to) = if enabled {
                (entry, range.begin)
            } else {
                (range.begin, entry)
            };
            if callee != from {
                log::warn!(
                    "module {}: call at {} targets {}, expected {}",
                    self.id,
                    site.return_address_offset,
                    callee,
                    from
                );
                return Err(LinkError::LinkState("call site in wrong profiling state"));
            }
            patches.push(isa.retarget_call(&self.image, site.return_address_offset, to));
        }
        Ok(patches)
    }

    /// Same switch for the entries of function-pointer tables.
    pub(super) fn toggle_func_ptr_tables(&self, enabled: bool) {
        let global_data = self.header.code_bytes;
        for table in &self.func_ptr_tables {
            for elem in 0..table.num_elems {
                let slot = global_data + table.global_data_offset + 8 * elem;
                let callee = self.image.load_word(slot) as usize;
                let Some(offset) = self.image.offset_of(callee) else {
                    continue;
                };
                let Some(range) = self.code_range_at(offset) else {
                    continue;
                };
                let Some(entry) = range.entry() else {
                    continue;
                };
                let to = if enabled { range.begin } else { entry };
                self.image.store_word(slot, self.image.address(to) as u64);
            }
        }
    }

    /// Toggle the reserved slot before each function's fast return.
    fn profiling_jump_patches(&self, enabled: bool) -> Result<Vec<Patch>, LinkError> {
        let isa = self.header.arch.instruction_set();
        self.code_ranges
            .iter()
            .filter(|r| r.is_function())
            .filter_map(|r| Some((r.profiling_jump()?, r.profiling_epilogue()?)))
            .map(|(jump, epilogue)| isa.profiling_jump(&self.image, jump, epilogue, enabled))
            .collect()
    }

    /// Route builtin calls made from function bodies through the builtin's
    /// thunk. Calls from inside the thunks themselves keep the real target.
    pub(super) fn builtin_call_patches(&self, enabled: bool) -> Result<Vec<Patch>, LinkError> {
        let width = self.header.arch.pointer_width();
        let mask = self.header.arch.link_sentinel();
        let mut patches = Vec::new();
        for builtin in Builtin::ALL {
            let Some(thunk) = self.builtin_thunk(builtin) else {
                continue;
            };
            let direct = self.resolved[builtin.symbol().index()] as u64 & mask;
            let via_thunk = self.image.address(thunk) as u64 & mask;
            let (from, to) = if enabled {
                (direct, via_thunk)
            } else {
                (via_thunk, direct)
            };
            for &patch_at in self.static_link_data.absolute_links.get(builtin.symbol()) {
                if self.code_range_at(patch_at).is_some_and(|r| r.is_thunk()) {
                    continue;
                }
                if self.image.read_word(patch_at, width) != from {
                    return Err(LinkError::LinkState("builtin call in wrong profiling state"));
                }
                patches.push(Patch::word(patch_at, to, width));
            }
        }
        Ok(patches)
    }
}
