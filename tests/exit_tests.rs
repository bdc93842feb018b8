//! Calls out of a module through its exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use asmlink::config::{BoundsChecks, HeapConfig};
use asmlink::deps::{CodeId, DependencyRegistry};
use asmlink::error::CallError;
use asmlink::jit::Arch;
use asmlink::module::exits::{CALLEE_GENERIC, CALLEE_UNBOUND};
use asmlink::module::{ExitCoercion, ExternalCallee, HeapBuffer, Module, OptimizedCode, Value, ValueType};
use asmlink::resolver::HostResolver;
use asmlink::sample;

fn linked_full() -> Module {
    let config = HeapConfig {
        bounds_checks: BoundsChecks::Explicit,
        ..HeapConfig::default()
    };
    let mut module = sample::full_module(Arch::X64, &config).unwrap();
    module.static_link(&HostResolver).unwrap();
    module.init_heap(Arc::new(HeapBuffer::new(65536).unwrap())).unwrap();
    module
}

fn runs_here() -> bool {
    Arch::host() == Some(Arch::X64)
}

extern "C" fn add_two_thousand(x: i32) -> i32 {
    x.wrapping_add(2000)
}

/// A callee with optimized code; counts calls on the generic path.
struct Compiled {
    id: CodeId,
    generic_calls: AtomicUsize,
}

impl Compiled {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id: CodeId(id),
            generic_calls: AtomicUsize::new(0),
        })
    }

    fn generic_calls(&self) -> usize {
        self.generic_calls.load(Ordering::SeqCst)
    }
}

impl ExternalCallee for Compiled {
    fn call(&self, args: &[Value]) -> Result<Value, String> {
        self.generic_calls.fetch_add(1, Ordering::SeqCst);
        let x = args.first().map(Value::to_int32).unwrap_or(0);
        Ok(Value::Int32(add_two_thousand(x)))
    }

    fn optimized(&self) -> Option<OptimizedCode> {
        Some(OptimizedCode {
            id: self.id,
            entry: add_two_thousand as extern "C" fn(i32) -> i32 as usize,
            arg_types: vec![ValueType::Int32],
        })
    }
}

#[test]
fn test_bind_requires_link_and_valid_index() {
    let mut module = sample::full_module(Arch::X64, &HeapConfig::default()).unwrap();
    let callee: Arc<dyn ExternalCallee> = Arc::new(|_: &[Value]| Ok(Value::Undefined));
    assert!(matches!(module.bind_exit(0, callee.clone()), Err(CallError::NotLinked)));
    let mut module = linked_full();
    assert!(matches!(module.bind_exit(1, callee.clone()), Err(CallError::BadExit(1))));
    assert_eq!(module.exit_slots().callee_word(0), CALLEE_UNBOUND);
    module.bind_exit(0, callee).unwrap();
    assert_eq!(module.exit_slots().callee_word(0), CALLEE_GENERIC);
    assert!(!module.exit_slots().is_optimized(0));
}

#[test]
fn test_generic_exit_coerces_result() {
    let mut module = linked_full();
    module
        .bind_exit(0, Arc::new(|args: &[Value]| Ok(Value::Double(args[0].to_number() + 0.75))))
        .unwrap();
    let value = module.invoke_exit(0, &[Value::Int32(4)], ExitCoercion::ToInt32).unwrap();
    assert_eq!(value, Value::Int32(4));
    if runs_here() {
        assert_eq!(module.call("callImport", &[Value::Int32(41)]).unwrap(), Value::Int32(41));
    }
}

#[test]
fn test_unbound_and_failing_callees() {
    let mut module = linked_full();
    assert!(matches!(
        module.invoke_exit(0, &[], ExitCoercion::Ignore),
        Err(CallError::Unbound(0))
    ));
    if runs_here() {
        assert!(matches!(
            module.call("callImport", &[Value::Int32(1)]),
            Err(CallError::Callee(_))
        ));
    }
    module
        .bind_exit(0, Arc::new(|_: &[Value]| Err("boom".to_string())))
        .unwrap();
    if runs_here() {
        match module.call("callImport", &[Value::Int32(1)]) {
            Err(CallError::Callee(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected {:?}", other),
        }
        // The failure does not stick to later calls.
        module
            .bind_exit(0, Arc::new(|_: &[Value]| Ok(Value::Int32(3))))
            .unwrap();
        assert_eq!(module.call("callImport", &[Value::Int32(1)]).unwrap(), Value::Int32(3));
    }
}

#[test]
fn test_exit_upgrades_and_reverts() {
    let mut module = linked_full();
    let compiled = Compiled::new(0xE0_01);
    module.bind_exit(0, compiled.clone()).unwrap();

    // Wrong argument types keep the generic path.
    module.invoke_exit(0, &[Value::Double(1.5)], ExitCoercion::ToInt32).unwrap();
    assert!(!module.exit_slots().is_optimized(0));

    module.invoke_exit(0, &[Value::Int32(1)], ExitCoercion::ToInt32).unwrap();
    assert!(module.exit_slots().is_optimized(0));
    assert_eq!(
        module.exit_slots().callee_word(0),
        add_two_thousand as extern "C" fn(i32) -> i32 as usize as u64
    );
    assert_eq!(DependencyRegistry::global().dependent_count(compiled.id), 1);

    if runs_here() {
        let before = compiled.generic_calls();
        assert_eq!(module.call("callImport", &[Value::Int32(5)]).unwrap(), Value::Int32(2005));
        assert_eq!(compiled.generic_calls(), before);
    }

    assert_eq!(DependencyRegistry::global().invalidate(compiled.id), 1);
    assert!(!module.exit_slots().is_optimized(0));
    assert_eq!(module.exit_slots().callee_word(0), CALLEE_GENERIC);

    if runs_here() {
        let before = compiled.generic_calls();
        assert_eq!(module.call("callImport", &[Value::Int32(5)]).unwrap(), Value::Int32(2005));
        // The generic call upgraded the exit again.
        assert_eq!(compiled.generic_calls(), before + 1);
        assert!(module.exit_slots().is_optimized(0));
    }
}

#[test]
fn test_rebinding_same_callee_keeps_fast_path() {
    let mut module = linked_full();
    let compiled = Compiled::new(0xE0_02);
    module.bind_exit(0, compiled.clone()).unwrap();
    module.invoke_exit(0, &[Value::Int32(1)], ExitCoercion::ToInt32).unwrap();
    assert!(module.exit_slots().is_optimized(0));

    module.bind_exit(0, compiled.clone()).unwrap();
    assert!(module.exit_slots().is_optimized(0));

    module.bind_exit(0, Compiled::new(0xE0_02)).unwrap();
    assert!(!module.exit_slots().is_optimized(0));
    // The stale registration no longer matches the exit and is skipped.
    assert_eq!(DependencyRegistry::global().invalidate(compiled.id), 0);
}

#[test]
fn test_dropped_module_is_not_reverted() {
    let compiled = Compiled::new(0xE0_03);
    {
        let mut module = linked_full();
        module.bind_exit(0, compiled.clone()).unwrap();
        module.invoke_exit(0, &[Value::Int32(1)], ExitCoercion::ToInt32).unwrap();
    }
    assert_eq!(DependencyRegistry::global().invalidate(compiled.id), 0);
}

#[test]
fn test_restore_forgets_callees() {
    let mut module = linked_full();
    let compiled = Compiled::new(0xE0_04);
    module.bind_exit(0, compiled.clone()).unwrap();
    module.invoke_exit(0, &[Value::Int32(1)], ExitCoercion::ToInt32).unwrap();
    module.restore_to_initial_state().unwrap();
    assert_eq!(DependencyRegistry::global().dependent_count(compiled.id), 0);
    module.static_link(&HostResolver).unwrap();
    assert_eq!(module.exit_slots().callee_word(0), CALLEE_UNBOUND);
    assert!(matches!(
        module.invoke_exit(0, &[], ExitCoercion::Ignore),
        Err(CallError::Unbound(0))
    ));
}
