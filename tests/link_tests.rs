//! Linking, heap binding, profiling and cloning of the sample modules.
//!
//! Tests that run generated code skip themselves when the host cannot
//! execute it; the table checks run everywhere.

use std::sync::Arc;

use asmlink::config::{BoundsChecks, HeapConfig};
use asmlink::error::{CallError, LinkError};
use asmlink::jit::Arch;
use asmlink::jit::memory::page_size;
use asmlink::module::tables::CodeRangeKind;
use asmlink::module::{HeapBuffer, InterruptLock, Module, Value};
use asmlink::resolver::{HostResolver, SymbolicAddress};
use asmlink::sample;

fn host() -> Option<Arch> {
    Arch::host().filter(|a| matches!(a, Arch::X64 | Arch::AArch64))
}

fn linked_identity(arch: Arch) -> Module {
    let mut module = sample::identity_module(arch, &HeapConfig::default()).unwrap();
    module.static_link(&HostResolver).unwrap();
    module
}

fn explicit_checks() -> HeapConfig {
    HeapConfig {
        bounds_checks: BoundsChecks::Explicit,
        ..HeapConfig::default()
    }
}

fn linked_full(heap: &HeapConfig) -> Module {
    let mut module = sample::full_module(Arch::X64, heap).unwrap();
    module.static_link(&HostResolver).unwrap();
    module
}

fn heap_for(module: &Module, length: usize) -> Arc<HeapBuffer> {
    let heap = if module.header().uses_signal_handlers {
        HeapBuffer::with_guard_pages(length).unwrap()
    } else {
        HeapBuffer::new(length).unwrap()
    };
    Arc::new(heap)
}

// ==================== Identity scenario ====================

#[test]
fn test_identity_export_returns_argument() {
    let Some(arch) = host() else { return };
    let module = linked_identity(arch);
    assert_eq!(module.call("identity", &[Value::Int32(5)]).unwrap(), Value::Int32(5));
    assert_eq!(module.call("identity", &[Value::Int32(-3)]).unwrap(), Value::Int32(-3));
    // Arguments are coerced to int32 on the way in.
    assert_eq!(module.call("identity", &[Value::Double(7.9)]).unwrap(), Value::Int32(7));
}

#[test]
fn test_identity_reads_globals_and_pools() {
    let Some(arch) = host() else { return };
    let module = linked_identity(arch);
    assert_eq!(module.call("peek", &[Value::Int32(0)]).unwrap(), Value::Int32(7));
    assert_eq!(module.call("answer", &[Value::Int32(0)]).unwrap(), Value::Int32(42));
}

#[test]
fn test_entry_address_maps_to_identity_range() {
    let module = linked_identity(Arch::X64);
    let identity = module.names().iter().position(|n| n.as_str() == "identity").unwrap() as u32;
    let range = *module
        .code_ranges()
        .iter()
        .find(|r| r.name_index() == Some(identity))
        .unwrap();
    let entry = range.entry().unwrap();
    let found = module.lookup_code_range(module.base() + entry as usize).unwrap();
    assert!(found.is_function());
    assert_eq!(found.name_index(), Some(identity));
    assert_eq!(found.line_number(), Some(4));

    // Entry stubs are labeled too; the padding after the functions is not.
    let stub = module.exports()[0].code_offset;
    assert_eq!(module.code_range_at(stub).unwrap().kind, CodeRangeKind::Entry);
    assert!(module.code_range_at(module.header().function_bytes - 1).is_none());
    assert!(module.lookup_code_range(module.base() + module.header().total_bytes as usize).is_none());
}

#[test]
fn test_return_addresses_and_heap_accesses_resolve() {
    let module = linked_full(&explicit_checks());
    for site in module.call_sites() {
        let pc = module.base() + site.return_address_offset as usize;
        assert_eq!(module.lookup_call_site(pc), Some(site));
        assert!(module.lookup_call_site(pc - 1).is_none());
    }
    let access = module.heap_accesses()[0];
    let pc = module.base() + access.offset as usize;
    assert_eq!(module.lookup_heap_access(pc), Some(&access));
    assert!(module.lookup_heap_access(pc + 1).is_none());
    // The faulting instruction belongs to `load`.
    let load = module.names().iter().position(|n| n.as_str() == "load").unwrap() as u32;
    assert_eq!(module.lookup_code_range(pc).unwrap().name_index(), Some(load));
    // Global data is not code.
    let data = module.base() + module.header().code_bytes as usize;
    assert!(module.lookup_heap_access(data).is_none());
}

#[test]
fn test_call_requires_link() {
    let module = sample::identity_module(Arch::X64, &HeapConfig::default()).unwrap();
    assert!(matches!(
        module.call("identity", &[Value::Int32(1)]),
        Err(CallError::NotLinked)
    ));
    let module = linked_identity(Arch::X64);
    assert!(matches!(module.call("missing", &[]), Err(CallError::BadExport(_))));
    if Arch::host() == Some(Arch::X64) {
        assert!(matches!(module.call("identity", &[]), Err(CallError::ArgumentCount { .. })));
    }
}

#[test]
fn test_foreign_arch_links_but_does_not_run() {
    let foreign = match Arch::host() {
        Some(Arch::AArch64) => Arch::X64,
        _ => Arch::AArch64,
    };
    let module = linked_identity(foreign);
    assert!(module.is_statically_linked());
    assert!(matches!(
        module.call("identity", &[Value::Int32(1)]),
        Err(CallError::HostMismatch(_))
    ));
}

#[test]
fn test_static_link_twice_is_rejected() {
    let mut module = linked_identity(Arch::X64);
    assert!(matches!(
        module.static_link(&HostResolver),
        Err(LinkError::LinkState(_))
    ));
}

#[test]
fn test_unlinked_code_round_trips_through_restore() {
    let mut module = sample::full_module(Arch::X64, &explicit_checks()).unwrap();
    let pristine = module.code().to_vec();
    module.static_link(&HostResolver).unwrap();
    assert_ne!(module.code(), &pristine[..]);
    let unlinked = module.unlinked_code().unwrap();
    // Absolute-link slots are back to the sentinel.
    for (_, offsets) in module.static_link_data().absolute_links.iter() {
        for &at in offsets {
            let at = at as usize;
            assert_eq!(&unlinked[at..at + 8], &pristine[at..at + 8]);
        }
    }
    module.restore_to_initial_state().unwrap();
    assert!(!module.is_statically_linked());
    module.static_link(&HostResolver).unwrap();
}

// ==================== Heap ====================

#[test]
fn test_heap_length_policy() {
    let mut module = linked_full(&explicit_checks());
    for bad in [4096, 65536 + 4096, 3 * 65536] {
        let heap = Arc::new(HeapBuffer::new(bad).unwrap());
        assert!(matches!(
            module.init_heap(heap),
            Err(LinkError::InvalidHeapLength { .. })
        ));
    }
    assert!(module.heap().is_none());
    module.init_heap(Arc::new(HeapBuffer::new(65536).unwrap())).unwrap();
    assert_eq!(module.heap().unwrap().len(), 65536);
    assert!(matches!(
        module.init_heap(Arc::new(HeapBuffer::new(65536).unwrap())),
        Err(LinkError::LinkState(_))
    ));
}

#[test]
fn test_rejected_heap_patches_nothing() {
    let mut module = linked_full(&explicit_checks());
    let before = module.code().to_vec();
    let heap = Arc::new(HeapBuffer::new(65536 + 4096).unwrap());
    assert!(module.init_heap(heap).is_err());
    assert_eq!(module.code(), &before[..]);
    assert!(module.heap().is_none());
}

#[test]
fn test_heap_requires_link() {
    let mut module = sample::full_module(Arch::X64, &explicit_checks()).unwrap();
    let heap = Arc::new(HeapBuffer::new(65536).unwrap());
    assert!(matches!(module.init_heap(heap), Err(LinkError::LinkState(_))));
}

#[test]
fn test_explicit_length_check_is_patched() {
    let mut module = linked_full(&explicit_checks());
    let access = module.heap_accesses()[0];
    assert!(access.has_length_check());
    let at = access.length_check_at as usize;
    assert_eq!(&module.code()[at..at + 4], &[0, 0, 0, 0]);
    module.init_heap(Arc::new(HeapBuffer::new(65536).unwrap())).unwrap();
    assert_eq!(&module.code()[at..at + 4], &65536u32.to_le_bytes());
}

#[test]
fn test_heap_load_with_explicit_checks() {
    if Arch::host() != Some(Arch::X64) {
        return;
    }
    let mut module = linked_full(&explicit_checks());
    // Exports with a heap view refuse to run until the heap is bound.
    assert!(matches!(
        module.call("load", &[Value::Int32(0)]),
        Err(CallError::NotLinked)
    ));
    let heap = heap_for(&module, 65536);
    heap.write_i32(8, 1234);
    heap.write_i32(65532, -9);
    module.init_heap(heap).unwrap();
    assert_eq!(module.call("load", &[Value::Int32(8)]).unwrap(), Value::Int32(1234));
    assert_eq!(module.call("load", &[Value::Int32(10)]).unwrap(), Value::Int32(1234));
    assert_eq!(module.call("load", &[Value::Int32(65532)]).unwrap(), Value::Int32(-9));
    assert_eq!(module.call("load", &[Value::Int32(65536)]).unwrap(), Value::Int32(0));
    assert_eq!(module.call("load", &[Value::Int32(-4)]).unwrap(), Value::Int32(0));
}

#[test]
fn test_guard_page_module_rejects_plain_heap() {
    let heap_config = HeapConfig {
        bounds_checks: BoundsChecks::GuardPages,
        ..HeapConfig::default()
    };
    let mut module = linked_full(&heap_config);
    assert!(module.header().uses_signal_handlers);
    let code = module.code().to_vec();
    assert!(matches!(
        module.init_heap(Arc::new(HeapBuffer::new(65536).unwrap())),
        Err(LinkError::MissingGuardPages { length: 65536 })
    ));
    assert!(module.heap().is_none());
    assert_eq!(module.code(), &code[..]);
}

#[test]
fn test_heap_load_with_guard_pages() {
    if Arch::host() != Some(Arch::X64) {
        return;
    }
    let mut module = linked_full(&HeapConfig::default());
    assert!(module.header().uses_signal_handlers);
    assert!(!module.heap_accesses()[0].has_length_check());
    assert!(matches!(
        module.init_heap(Arc::new(HeapBuffer::new(65536).unwrap())),
        Err(LinkError::MissingGuardPages { .. })
    ));
    let heap = heap_for(&module, 65536);
    heap.write_i32(16, 77);
    module.init_heap(heap).unwrap();
    assert_eq!(module.call("load", &[Value::Int32(16)]).unwrap(), Value::Int32(77));
}

#[test]
fn test_restore_detaches_heap() {
    let mut module = linked_full(&explicit_checks());
    let heap = Arc::new(HeapBuffer::new(65536).unwrap());
    module.init_heap(heap.clone()).unwrap();
    let detached = module.restore_to_initial_state().unwrap().unwrap();
    assert!(Arc::ptr_eq(&detached, &heap));
    assert!(module.heap().is_none());
    module.static_link(&HostResolver).unwrap();
    let bigger = Arc::new(HeapBuffer::new(131072).unwrap());
    module.init_heap(bigger).unwrap();
    let at = module.heap_accesses()[0].length_check_at as usize;
    assert_eq!(&module.code()[at..at + 4], &131072u32.to_le_bytes());
}

// ==================== Profiling ====================

#[test]
fn test_profiling_toggle_is_an_involution() {
    for module in [
        linked_identity(Arch::X64),
        linked_identity(Arch::AArch64),
        linked_full(&explicit_checks()),
    ] {
        let mut module = module;
        let before = module.code().to_vec();
        module.set_profiling_enabled(true).unwrap();
        assert!(module.profiling_enabled());
        assert_ne!(module.code(), &before[..]);
        module.set_profiling_enabled(true).unwrap();
        module.set_profiling_enabled(false).unwrap();
        assert_eq!(module.code(), &before[..]);
    }
}

#[test]
fn test_profiling_labels() {
    let mut module = linked_identity(Arch::X64);
    assert!(module.profiling_label(0).is_none());
    module.set_profiling_enabled(true).unwrap();
    let index = module.names().iter().position(|n| n.as_str() == "peek").unwrap() as u32;
    assert_eq!(module.profiling_label(index), Some("peek (identity.js:5)"));
    module.set_profiling_enabled(false).unwrap();
    assert!(module.profiling_label(index).is_none());
}

#[test]
fn test_profiling_requires_link() {
    let mut module = sample::identity_module(Arch::X64, &HeapConfig::default()).unwrap();
    assert!(matches!(
        module.set_profiling_enabled(true),
        Err(LinkError::LinkState(_))
    ));
}

#[test]
fn test_profiled_code_computes_the_same_results() {
    let Some(arch) = host() else { return };
    let mut module = linked_identity(arch);
    module.set_profiling_enabled(true).unwrap();
    assert_eq!(module.call("identity", &[Value::Int32(11)]).unwrap(), Value::Int32(11));
    assert_eq!(module.call("peek", &[Value::Int32(0)]).unwrap(), Value::Int32(7));
    assert_eq!(module.call("answer", &[Value::Int32(0)]).unwrap(), Value::Int32(42));
}

#[test]
fn test_profiled_builtin_goes_through_thunk() {
    let mut module = linked_full(&explicit_checks());
    let thunk = module.builtin_thunk(asmlink::resolver::Builtin::SinD).unwrap();
    let sin_links: Vec<u32> = module.static_link_data().absolute_links.get(SymbolicAddress::SinD).to_vec();
    let from_function = sin_links
        .iter()
        .copied()
        .find(|&at| module.code_range_at(at).is_some_and(|r| r.is_function()))
        .unwrap();
    let read = |m: &Module| {
        let at = from_function as usize;
        u64::from_le_bytes(m.code()[at..at + 8].try_into().unwrap())
    };
    let direct = read(&module);
    module.set_profiling_enabled(true).unwrap();
    assert_eq!(read(&module), (module.base() + thunk as usize) as u64);
    module.set_profiling_enabled(false).unwrap();
    assert_eq!(read(&module), direct);

    if Arch::host() == Some(Arch::X64) {
        module.init_heap(Arc::new(HeapBuffer::new(65536).unwrap())).unwrap();
        module.set_profiling_enabled(true).unwrap();
        let Value::Double(v) = module.call("sine", &[Value::Double(0.5)]).unwrap() else {
            panic!("sine returns a double");
        };
        assert!((v - 0.5f64.sin()).abs() < 1e-12);
        assert_eq!(module.call("dispatch", &[Value::Int32(3)]).unwrap(), Value::Int32(6));
    }
}

// ==================== Protection ====================

#[test]
fn test_patching_protected_code_restores_protection() {
    let module = linked_identity(Arch::X64);
    let unlinked = sample::identity_module(Arch::X64, &HeapConfig::default()).unwrap();
    {
        let guard = InterruptLock::acquire();
        assert!(matches!(unlinked.protect_code(&guard), Err(LinkError::LinkState(_))));
        module.protect_code(&guard).unwrap();
        module.protect_code(&guard).unwrap();
        assert!(module.code_is_protected(&guard));
    }
    // Metadata stays readable while the code pages are inaccessible.
    let entry = module.code_ranges().iter().find_map(|r| r.entry()).unwrap();
    assert!(module.lookup_code_range(module.base() + entry as usize).is_some());

    let mut module = module;
    module.set_profiling_enabled(true).unwrap();
    {
        let guard = InterruptLock::acquire();
        assert!(module.code_is_protected(&guard));
        module.unprotect_code(&guard).unwrap();
        assert!(!module.code_is_protected(&guard));
    }
    module.set_profiling_enabled(false).unwrap();
    if Arch::host() == Some(Arch::X64) {
        assert_eq!(module.call("identity", &[Value::Int32(9)]).unwrap(), Value::Int32(9));
    }
}

// ==================== Cloning ====================

#[test]
fn test_clone_is_independent() {
    let mut original = linked_full(&explicit_checks());
    original.init_heap(Arc::new(HeapBuffer::new(65536).unwrap())).unwrap();
    original.set_profiling_enabled(true).unwrap();

    let mut clone = original.try_clone().unwrap();
    assert!(!clone.is_statically_linked());
    assert!(clone.heap().is_none());
    assert!(clone.profiling_enabled());
    assert_ne!(clone.id(), original.id());
    assert_ne!(clone.base(), original.base());

    clone.static_link(&HostResolver).unwrap();
    clone.init_heap(Arc::new(HeapBuffer::new(131072).unwrap())).unwrap();
    let at = original.heap_accesses()[0].length_check_at as usize;
    assert_eq!(&original.code()[at..at + 4], &65536u32.to_le_bytes());
    assert_eq!(&clone.code()[at..at + 4], &131072u32.to_le_bytes());

    // Profiling state is carried over and toggles back cleanly.
    clone.set_profiling_enabled(false).unwrap();
    original.set_profiling_enabled(false).unwrap();
    assert!(original.profiling_enabled() == clone.profiling_enabled());
    drop(original);

    if Arch::host() == Some(Arch::X64) {
        assert_eq!(clone.call("identity", &[Value::Int32(9)]).unwrap(), Value::Int32(9));
        assert_eq!(clone.call("peek", &[Value::Int32(0)]).unwrap(), Value::Int32(7));
    }
}

#[test]
fn test_clone_of_unlinked_module() {
    let module = sample::identity_module(Arch::X64, &HeapConfig::default()).unwrap();
    let mut clone = module.try_clone().unwrap();
    assert_eq!(clone.code(), module.code());
    clone.static_link(&HostResolver).unwrap();
    assert_eq!(clone.exports().len(), 3);
    assert_eq!(clone.header().function_bytes as usize, page_size());
}
