//! Calls out of generated code.
//!
//! Every exit owns a 16-byte slot pair in global data: the trampoline the
//! generated code jumps through, and a callee word. A freshly linked exit
//! points at the interpreter trampoline, which boxes its arguments as
//! [`RawValue`]s and calls back into the host (`invoke_exit_*`), where the
//! bound [`ExternalCallee`] runs. After a successful generic call the exit
//! may be upgraded to the optimized trampoline, which jumps straight to
//! the callee's optimized code stored in the callee word.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;

use super::Module;
use super::tables::Exit;
use crate::deps::{CodeId, DependencyRegistry};
use crate::error::CallError;
use crate::jit::memory::ExecutableMemory;
use crate::resolver::to_int32;

/// Callee word of an exit with nothing bound.
pub const CALLEE_UNBOUND: u64 = 0;
/// Callee word of an exit bound to a callee reached through the generic
/// path.
pub const CALLEE_GENERIC: u64 = 1;

// ==================== Values ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueType {
    Undefined,
    Int32,
    Double,
}

/// A value crossing the module boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Value {
    Undefined,
    Int32(i32),
    Double(f64),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Undefined => ValueType::Undefined,
            Value::Int32(_) => ValueType::Int32,
            Value::Double(_) => ValueType::Double,
        }
    }

    pub fn to_number(&self) -> f64 {
        match *self {
            Value::Undefined => f64::NAN,
            Value::Int32(v) => v as f64,
            Value::Double(v) => v,
        }
    }

    pub fn to_int32(&self) -> i32 {
        match *self {
            Value::Int32(v) => v,
            other => to_int32(other.to_number()),
        }
    }

    pub fn to_raw(self) -> RawValue {
        match self {
            Value::Undefined => RawValue {
                tag: RawValue::TAG_UNDEFINED,
                payload: 0,
            },
            Value::Int32(v) => RawValue {
                tag: RawValue::TAG_INT32,
                payload: v as u32 as u64,
            },
            Value::Double(v) => RawValue {
                tag: RawValue::TAG_DOUBLE,
                payload: v.to_bits(),
            },
        }
    }

    pub fn from_raw(raw: RawValue) -> Value {
        match raw.tag {
            RawValue::TAG_INT32 => Value::Int32(raw.payload as u32 as i32),
            RawValue::TAG_DOUBLE => Value::Double(f64::from_bits(raw.payload)),
            _ => Value::Undefined,
        }
    }
}

/// A boxed value as laid out by the exit trampolines: 8-byte tag, then an
/// 8-byte payload (low 32 bits for int32, IEEE bits for doubles).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawValue {
    pub tag: u64,
    pub payload: u64,
}

impl RawValue {
    pub const TAG_UNDEFINED: u64 = 0;
    pub const TAG_INT32: u64 = 1;
    pub const TAG_DOUBLE: u64 = 2;

    pub const SIZE: usize = 16;
}

/// Result conversion applied to an exit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCoercion {
    Ignore,
    ToInt32,
    ToNumber,
}

impl ExitCoercion {
    fn apply(self, value: Value) -> Value {
        match self {
            ExitCoercion::Ignore => Value::Undefined,
            ExitCoercion::ToInt32 => Value::Int32(value.to_int32()),
            ExitCoercion::ToNumber => Value::Double(value.to_number()),
        }
    }
}

// ==================== Callees ====================

/// Native code an external function has been compiled to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedCode {
    pub id: CodeId,
    /// Address called with the module's native argument registers.
    pub entry: usize,
    /// Argument types the code was specialized for.
    pub arg_types: Vec<ValueType>,
}

/// A function imported by a module.
pub trait ExternalCallee: Send + Sync {
    fn call(&self, args: &[Value]) -> Result<Value, String>;

    /// The callee's optimized code, if it currently has any.
    fn optimized(&self) -> Option<OptimizedCode> {
        None
    }
}

impl<F> ExternalCallee for F
where
    F: Fn(&[Value]) -> Result<Value, String> + Send + Sync,
{
    fn call(&self, args: &[Value]) -> Result<Value, String> {
        self(args)
    }
}

// ==================== Slots ====================

struct ExitTrampolines {
    /// Image offset of the slot pair.
    slot: u32,
    interp: usize,
    optimized: usize,
}

/// The exit slots of one module image. Shared with the dependency
/// registry through weak references.
pub struct ExitSlots {
    image: Arc<ExecutableMemory>,
    exits: Vec<ExitTrampolines>,
}

impl ExitSlots {
    pub(crate) fn new(image: Arc<ExecutableMemory>, global_data: u32, exits: &[Exit]) -> Self {
        let exits = exits
            .iter()
            .map(|exit| ExitTrampolines {
                slot: global_data + exit.global_data_offset,
                interp: image.address(exit.interp_code_offset),
                optimized: image.address(exit.optimized_code_offset),
            })
            .collect();
        Self { image, exits }
    }

    /// Slots in a scratch page, for exercising the registry alone.
    #[cfg(test)]
    pub(crate) fn detached(count: usize) -> Self {
        let image = Arc::new(
            ExecutableMemory::new(crate::jit::memory::page_size()).expect("scratch page"),
        );
        let exits = (0..count as u32)
            .map(|i| Exit {
                ffi_index: i,
                global_data_offset: 16 * i,
                interp_code_offset: 0x100,
                optimized_code_offset: 0x200,
            })
            .collect::<Vec<_>>();
        Self::new(image, 0, &exits)
    }

    pub fn len(&self) -> usize {
        self.exits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }

    fn write(&self, index: usize, trampoline: usize, callee: u64) {
        let exit = &self.exits[index];
        // The callee word goes first: the optimized trampoline reads it as
        // soon as it becomes reachable.
        self.image.store_word(exit.slot + 8, callee);
        self.image.store_word(exit.slot, trampoline as u64);
    }

    pub(crate) fn reset(&self, index: usize) {
        self.write(index, self.exits[index].interp, CALLEE_UNBOUND);
    }

    pub(crate) fn set_generic(&self, index: usize) {
        self.write(index, self.exits[index].interp, CALLEE_GENERIC);
    }

    pub(crate) fn set_optimized(&self, index: usize, entry: usize) {
        self.write(index, self.exits[index].optimized, entry as u64);
    }

    pub fn trampoline(&self, index: usize) -> usize {
        self.image.load_word(self.exits[index].slot) as usize
    }

    pub fn callee_word(&self, index: usize) -> u64 {
        self.image.load_word(self.exits[index].slot + 8)
    }

    pub fn is_optimized(&self, index: usize) -> bool {
        self.trampoline(index) == self.exits[index].optimized
    }

    /// Revert exit `index` to the generic path if it still calls `entry`.
    pub(crate) fn revert_if_calling(&self, index: u32, entry: usize) -> bool {
        let index = index as usize;
        if index >= self.exits.len() || !self.is_optimized(index) || self.callee_word(index) != entry as u64 {
            return false;
        }
        self.set_generic(index);
        true
    }
}

// ==================== Activations ====================

struct Activation {
    module: *const Module,
    pending_error: Option<String>,
}

thread_local! {
    static ACTIVATIONS: RefCell<Vec<Activation>> = const { RefCell::new(Vec::new()) };
}

/// Marks `module` as running on this thread until dropped.
pub(crate) struct ActivationGuard {
    depth: usize,
}

impl ActivationGuard {
    pub(crate) fn enter(module: &Module) -> Self {
        let depth = ACTIVATIONS.with(|a| {
            let mut a = a.borrow_mut();
            a.push(Activation {
                module: module as *const Module,
                pending_error: None,
            });
            a.len()
        });
        Self { depth }
    }

    /// Take the error reported while this activation was innermost.
    pub(crate) fn take_error(&self) -> Option<String> {
        ACTIVATIONS.with(|a| {
            a.borrow_mut()
                .get_mut(self.depth - 1)
                .and_then(|act| act.pending_error.take())
        })
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        ACTIVATIONS.with(|a| {
            let mut a = a.borrow_mut();
            debug_assert_eq!(a.len(), self.depth);
            a.truncate(self.depth - 1);
        });
    }
}

fn innermost_module() -> Option<*const Module> {
    ACTIVATIONS.with(|a| a.borrow().last().map(|act| act.module))
}

/// Record a failure for the innermost activation; the first one wins.
pub(crate) fn report_pending_error(message: String) {
    ACTIVATIONS.with(|a| {
        if let Some(act) = a.borrow_mut().last_mut() {
            if act.pending_error.is_none() {
                act.pending_error = Some(message);
            }
        } else {
            log::warn!("error outside any activation: {}", message);
        }
    });
}

// ==================== Host entry points ====================

pub type InvokeExitFn = extern "C" fn(i32, i32, *mut RawValue) -> i32;
pub type CoerceFn = extern "C" fn(*mut RawValue) -> i32;

fn invoke_from_code(exit_index: i32, argc: i32, argv: *mut RawValue, coercion: ExitCoercion) -> i32 {
    let Some(module) = innermost_module() else {
        log::error!("exit {} called with no active module", exit_index);
        return 0;
    };
    let args: Vec<Value> = if argc > 0 {
        unsafe { std::slice::from_raw_parts(argv, argc as usize) }
            .iter()
            .map(|raw| Value::from_raw(*raw))
            .collect()
    } else {
        Vec::new()
    };

    // The activation keeps the module alive for the whole call.
    let module = unsafe { &*module };
    let result = catch_unwind(AssertUnwindSafe(|| {
        module.invoke_exit(exit_index as u32, &args, coercion)
    }))
    .unwrap_or_else(|_| Err(CallError::Callee("callee panicked".to_string())));

    match result {
        Ok(value) => {
            unsafe { *argv = value.to_raw() };
            1
        }
        Err(e) => {
            report_pending_error(e.to_string());
            unsafe { *argv = Value::Undefined.to_raw() };
            0
        }
    }
}

pub(crate) extern "C" fn invoke_exit_ignore(exit_index: i32, argc: i32, argv: *mut RawValue) -> i32 {
    invoke_from_code(exit_index, argc, argv, ExitCoercion::Ignore)
}

pub(crate) extern "C" fn invoke_exit_to_int32(exit_index: i32, argc: i32, argv: *mut RawValue) -> i32 {
    invoke_from_code(exit_index, argc, argv, ExitCoercion::ToInt32)
}

pub(crate) extern "C" fn invoke_exit_to_number(exit_index: i32, argc: i32, argv: *mut RawValue) -> i32 {
    invoke_from_code(exit_index, argc, argv, ExitCoercion::ToNumber)
}

pub(crate) extern "C" fn coerce_to_int32(value: *mut RawValue) -> i32 {
    unsafe { *value = ExitCoercion::ToInt32.apply(Value::from_raw(*value)).to_raw() };
    1
}

pub(crate) extern "C" fn coerce_to_number(value: *mut RawValue) -> i32 {
    unsafe { *value = ExitCoercion::ToNumber.apply(Value::from_raw(*value)).to_raw() };
    1
}

// ==================== Module operations ====================

impl Module {
    pub fn exit_slots(&self) -> &Arc<ExitSlots> {
        &self.exit_slots
    }

    /// Bind `callee` to exit `index`. Rebinding the callee an exit is
    /// already upgraded for keeps the optimized path; anything else starts
    /// on the generic path.
    pub fn bind_exit(&mut self, index: u32, callee: Arc<dyn ExternalCallee>) -> Result<(), CallError> {
        if !self.statically_linked {
            return Err(CallError::NotLinked);
        }
        let i = index as usize;
        if i >= self.exits.len() {
            return Err(CallError::BadExit(index));
        }
        let same_callee = self.callees[i]
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &callee));
        if !(same_callee && self.exit_slots.is_optimized(i)) {
            self.exit_slots.set_generic(i);
        }
        self.callees[i] = Some(callee);
        log::debug!("module {} exit {} bound", self.id, index);
        Ok(())
    }

    /// Generic exit path: call the bound callee, coerce its result, then
    /// try to let later calls bypass this path.
    pub fn invoke_exit(
        &self,
        index: u32,
        args: &[Value],
        coercion: ExitCoercion,
    ) -> Result<Value, CallError> {
        let callee = self
            .callees
            .get(index as usize)
            .ok_or(CallError::BadExit(index))?
            .as_ref()
            .ok_or(CallError::Unbound(index))?;
        let value = callee.call(args).map_err(CallError::Callee)?;
        self.try_enabling_optimized(index, callee.as_ref(), args);
        Ok(coercion.apply(value))
    }

    fn try_enabling_optimized(&self, index: u32, callee: &dyn ExternalCallee, args: &[Value]) {
        let i = index as usize;
        if self.exit_slots.is_optimized(i) {
            return;
        }
        let Some(code) = callee.optimized() else {
            return;
        };
        // Missing arguments would need rectifying, which the direct path
        // cannot do.
        if args.len() < code.arg_types.len() {
            return;
        }
        let types_match = code
            .arg_types
            .iter()
            .zip(args)
            .all(|(&expected, arg)| arg.value_type() == expected);
        if !types_match {
            return;
        }
        let registry = DependencyRegistry::global();
        if let Err(e) = registry.register(code.id, self.id, index, code.entry, &self.exit_slots) {
            log::debug!("exit {} stays generic: {}", index, e);
            return;
        }
        self.exit_slots.set_optimized(i, code.entry);
        log::debug!(
            "module {} exit {} upgraded to optimized code {:?} at {:#x}",
            self.id,
            index,
            code.id,
            code.entry
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_coercions() {
        assert_eq!(Value::Double(3.9).to_int32(), 3);
        assert_eq!(Value::Undefined.to_int32(), 0);
        assert!(Value::Undefined.to_number().is_nan());
        assert_eq!(ExitCoercion::ToNumber.apply(Value::Int32(2)), Value::Double(2.0));
        assert_eq!(ExitCoercion::Ignore.apply(Value::Int32(2)), Value::Undefined);
    }

    #[test]
    fn test_raw_value_layout() {
        assert_eq!(std::mem::size_of::<RawValue>(), RawValue::SIZE);
        let raw = Value::Int32(-1).to_raw();
        assert_eq!(raw.tag, RawValue::TAG_INT32);
        assert_eq!(raw.payload, 0xFFFF_FFFF);
        assert_eq!(Value::from_raw(raw), Value::Int32(-1));
        let raw = Value::Double(1.5).to_raw();
        assert_eq!(Value::from_raw(raw), Value::Double(1.5));
    }

    #[test]
    fn test_host_coerce_entry_points() {
        let mut raw = Value::Double(7.8).to_raw();
        assert_eq!(coerce_to_int32(&mut raw), 1);
        assert_eq!(Value::from_raw(raw), Value::Int32(7));
        let mut raw = Value::Undefined.to_raw();
        coerce_to_number(&mut raw);
        assert!(matches!(Value::from_raw(raw), Value::Double(d) if d.is_nan()));
    }

    #[test]
    fn test_exit_slot_transitions() {
        let slots = ExitSlots::detached(2);
        slots.reset(1);
        assert_eq!(slots.callee_word(1), CALLEE_UNBOUND);
        slots.set_generic(1);
        assert_eq!(slots.callee_word(1), CALLEE_GENERIC);
        assert!(!slots.is_optimized(1));
        slots.set_optimized(1, 0xABC0);
        assert!(slots.is_optimized(1));
        assert!(!slots.revert_if_calling(1, 0xDEF0));
        assert!(slots.revert_if_calling(1, 0xABC0));
        assert!(!slots.is_optimized(1));
        assert_eq!(slots.callee_word(1), CALLEE_GENERIC);
    }

    #[test]
    fn test_invoke_without_activation_fails() {
        let mut raw = [Value::Int32(1).to_raw()];
        assert_eq!(invoke_exit_to_int32(0, 1, raw.as_mut_ptr()), 0);
    }
}
