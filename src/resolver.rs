//! Symbolic external addresses and their resolution.
//!
//! Generated code refers to runtime state and host routines through
//! absolute links tagged with a [`SymbolicAddress`]. Static linking asks a
//! [`SymbolResolver`] for each kind once and patches every link with the
//! answer.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::module::exits;

/// Closed set of external addresses generated code may embed.
///
/// The order is part of the cache format: absolute links are serialized
/// one bucket per kind in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum SymbolicAddress {
    Runtime,
    RuntimeInterrupt,
    StackLimit,
    ReportOverRecursed,
    HandleExecutionInterrupt,
    InvokeExitIgnore,
    InvokeExitToInt32,
    InvokeExitToNumber,
    CoerceToInt32,
    CoerceToNumber,
    ToInt32,
    ModD,
    SinD,
    CosD,
    TanD,
    ASinD,
    ACosD,
    ATanD,
    CeilD,
    CeilF,
    FloorD,
    FloorF,
    ExpD,
    LogD,
    PowD,
    ATan2D,
}

impl SymbolicAddress {
    pub const COUNT: usize = 26;

    pub const ALL: [SymbolicAddress; Self::COUNT] = [
        SymbolicAddress::Runtime,
        SymbolicAddress::RuntimeInterrupt,
        SymbolicAddress::StackLimit,
        SymbolicAddress::ReportOverRecursed,
        SymbolicAddress::HandleExecutionInterrupt,
        SymbolicAddress::InvokeExitIgnore,
        SymbolicAddress::InvokeExitToInt32,
        SymbolicAddress::InvokeExitToNumber,
        SymbolicAddress::CoerceToInt32,
        SymbolicAddress::CoerceToNumber,
        SymbolicAddress::ToInt32,
        SymbolicAddress::ModD,
        SymbolicAddress::SinD,
        SymbolicAddress::CosD,
        SymbolicAddress::TanD,
        SymbolicAddress::ASinD,
        SymbolicAddress::ACosD,
        SymbolicAddress::ATanD,
        SymbolicAddress::CeilD,
        SymbolicAddress::CeilF,
        SymbolicAddress::FloorD,
        SymbolicAddress::FloorF,
        SymbolicAddress::ExpD,
        SymbolicAddress::LogD,
        SymbolicAddress::PowD,
        SymbolicAddress::ATan2D,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The builtin routine behind this address, if it is one.
    pub fn builtin(self) -> Option<Builtin> {
        Builtin::ALL.iter().copied().find(|b| b.symbol() == self)
    }
}

/// Host math and conversion routines reachable through a frame-pushing
/// thunk while profiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Builtin {
    ToInt32,
    ModD,
    SinD,
    CosD,
    TanD,
    ASinD,
    ACosD,
    ATanD,
    CeilD,
    CeilF,
    FloorD,
    FloorF,
    ExpD,
    LogD,
    PowD,
    ATan2D,
}

impl Builtin {
    pub const COUNT: usize = 16;

    pub const ALL: [Builtin; Self::COUNT] = [
        Builtin::ToInt32,
        Builtin::ModD,
        Builtin::SinD,
        Builtin::CosD,
        Builtin::TanD,
        Builtin::ASinD,
        Builtin::ACosD,
        Builtin::ATanD,
        Builtin::CeilD,
        Builtin::CeilF,
        Builtin::FloorD,
        Builtin::FloorF,
        Builtin::ExpD,
        Builtin::LogD,
        Builtin::PowD,
        Builtin::ATan2D,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Builtin> {
        Self::ALL.get(index).copied()
    }

    pub fn symbol(self) -> SymbolicAddress {
        match self {
            Builtin::ToInt32 => SymbolicAddress::ToInt32,
            Builtin::ModD => SymbolicAddress::ModD,
            Builtin::SinD => SymbolicAddress::SinD,
            Builtin::CosD => SymbolicAddress::CosD,
            Builtin::TanD => SymbolicAddress::TanD,
            Builtin::ASinD => SymbolicAddress::ASinD,
            Builtin::ACosD => SymbolicAddress::ACosD,
            Builtin::ATanD => SymbolicAddress::ATanD,
            Builtin::CeilD => SymbolicAddress::CeilD,
            Builtin::CeilF => SymbolicAddress::CeilF,
            Builtin::FloorD => SymbolicAddress::FloorD,
            Builtin::FloorF => SymbolicAddress::FloorF,
            Builtin::ExpD => SymbolicAddress::ExpD,
            Builtin::LogD => SymbolicAddress::LogD,
            Builtin::PowD => SymbolicAddress::PowD,
            Builtin::ATan2D => SymbolicAddress::ATan2D,
        }
    }
}

/// Maps each symbolic kind to a concrete address. Must be pure: the same
/// kind always resolves to the same address for the life of a module.
pub trait SymbolResolver {
    fn resolve(&self, symbol: SymbolicAddress) -> usize;
}

impl<F> SymbolResolver for F
where
    F: Fn(SymbolicAddress) -> usize,
{
    fn resolve(&self, symbol: SymbolicAddress) -> usize {
        self(symbol)
    }
}

// ==================== Host runtime state ====================

/// Opaque runtime handle handed to generated code.
static RUNTIME: AtomicU64 = AtomicU64::new(0);

/// Non-zero while an interrupt is pending. Generated code polls it at
/// loop heads.
static INTERRUPT_FLAG: AtomicU32 = AtomicU32::new(0);

/// Lowest usable stack address; generated code reports over-recursion
/// below it. Zero disables the check.
static STACK_LIMIT: AtomicUsize = AtomicUsize::new(0);

/// Ask running code to stop at its next interrupt check.
pub fn request_interrupt() {
    INTERRUPT_FLAG.store(1, Ordering::SeqCst);
}

pub fn interrupt_requested() -> bool {
    INTERRUPT_FLAG.load(Ordering::SeqCst) != 0
}

pub fn set_stack_limit(limit: usize) {
    STACK_LIMIT.store(limit, Ordering::SeqCst);
}

extern "C" fn report_over_recursed() {
    exits::report_pending_error("too much recursion".to_string());
}

extern "C" fn handle_execution_interrupt() -> i32 {
    INTERRUPT_FLAG.store(0, Ordering::SeqCst);
    log::debug!("execution interrupt handled");
    1
}

/// ECMAScript ToInt32: truncate, then wrap modulo 2^32.
pub fn to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    let wrapped = value.trunc() % 4294967296.0;
    wrapped as i64 as u32 as i32
}

extern "C" fn builtin_to_int32(value: f64) -> i32 {
    to_int32(value)
}

extern "C" fn mod_d(x: f64, y: f64) -> f64 {
    x % y
}

extern "C" fn sin_d(x: f64) -> f64 {
    x.sin()
}

extern "C" fn cos_d(x: f64) -> f64 {
    x.cos()
}

extern "C" fn tan_d(x: f64) -> f64 {
    x.tan()
}

extern "C" fn asin_d(x: f64) -> f64 {
    x.asin()
}

extern "C" fn acos_d(x: f64) -> f64 {
    x.acos()
}

extern "C" fn atan_d(x: f64) -> f64 {
    x.atan()
}

extern "C" fn ceil_d(x: f64) -> f64 {
    x.ceil()
}

extern "C" fn ceil_f(x: f32) -> f32 {
    x.ceil()
}

extern "C" fn floor_d(x: f64) -> f64 {
    x.floor()
}

extern "C" fn floor_f(x: f32) -> f32 {
    x.floor()
}

extern "C" fn exp_d(x: f64) -> f64 {
    x.exp()
}

extern "C" fn log_d(x: f64) -> f64 {
    x.ln()
}

extern "C" fn pow_d(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn atan2_d(y: f64, x: f64) -> f64 {
    y.atan2(x)
}

/// Resolves every kind to this process's runtime state and routines.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostResolver;

impl SymbolResolver for HostResolver {
    fn resolve(&self, symbol: SymbolicAddress) -> usize {
        match symbol {
            SymbolicAddress::Runtime => &RUNTIME as *const AtomicU64 as usize,
            SymbolicAddress::RuntimeInterrupt => &INTERRUPT_FLAG as *const AtomicU32 as usize,
            SymbolicAddress::StackLimit => &STACK_LIMIT as *const AtomicUsize as usize,
            SymbolicAddress::ReportOverRecursed => report_over_recursed as extern "C" fn() as usize,
            SymbolicAddress::HandleExecutionInterrupt => {
                handle_execution_interrupt as extern "C" fn() -> i32 as usize
            }
            SymbolicAddress::InvokeExitIgnore => exits::invoke_exit_ignore as exits::InvokeExitFn as usize,
            SymbolicAddress::InvokeExitToInt32 => {
                exits::invoke_exit_to_int32 as exits::InvokeExitFn as usize
            }
            SymbolicAddress::InvokeExitToNumber => {
                exits::invoke_exit_to_number as exits::InvokeExitFn as usize
            }
            SymbolicAddress::CoerceToInt32 => exits::coerce_to_int32 as exits::CoerceFn as usize,
            SymbolicAddress::CoerceToNumber => exits::coerce_to_number as exits::CoerceFn as usize,
            SymbolicAddress::ToInt32 => builtin_to_int32 as extern "C" fn(f64) -> i32 as usize,
            SymbolicAddress::ModD => mod_d as extern "C" fn(f64, f64) -> f64 as usize,
            SymbolicAddress::SinD => sin_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::CosD => cos_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::TanD => tan_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::ASinD => asin_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::ACosD => acos_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::ATanD => atan_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::CeilD => ceil_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::CeilF => ceil_f as extern "C" fn(f32) -> f32 as usize,
            SymbolicAddress::FloorD => floor_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::FloorF => floor_f as extern "C" fn(f32) -> f32 as usize,
            SymbolicAddress::ExpD => exp_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::LogD => log_d as extern "C" fn(f64) -> f64 as usize,
            SymbolicAddress::PowD => pow_d as extern "C" fn(f64, f64) -> f64 as usize,
            SymbolicAddress::ATan2D => atan2_d as extern "C" fn(f64, f64) -> f64 as usize,
        }
    }
}
