// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The C++ ABI entry points.
//!
//! The compiler emits calls to `__cxa_throw` and friends. Linking with `-Wl,--wrap=<symbol>` for
//! every name in [`WRAPPED_SYMBOLS`] redirects those calls to the `__wrap_` definitions below,
//! the toolchain's own runtime stays reachable as `__real_<symbol>`.

#![allow(non_snake_case, reason = "exported names are fixed by the C++ ABI")]

use core::ffi::{c_int, c_uint};

use unwind::{FrameIter, UNWIND_DATA_REG, UnwindFrame};

use crate::config::{MAX_EXCEPTION_SIZE, MAX_EXCEPTIONS};
use crate::header::{Destructor, ExceptionHeader, UnwindException};
use crate::rtti::TypeInfo;
use crate::runtime::Runtime;
use crate::termination::{AbortHook, Handler, TerminationCause};

static RUNTIME: Runtime<MAX_EXCEPTIONS, MAX_EXCEPTION_SIZE> = Runtime::new();

/// The symbols that have to be passed to the linker as `--wrap=<symbol>`.
pub const WRAPPED_SYMBOLS: &[&str] = &[
    "__cxa_allocate_exception",
    "__cxa_free_exception",
    "__cxa_throw",
    "__cxa_rethrow",
    "__cxa_begin_catch",
    "__cxa_end_catch",
    "__cxa_get_exception_ptr",
    "__cxa_uncaught_exceptions",
    "__cxa_call_terminate",
    "__cxa_call_unexpected",
    "__cxa_end_cleanup",
    "_Unwind_Resume",
    "_ZSt9terminatev",
    "_ZSt10unexpectedv",
    "_ZSt13set_terminatePFvvE",
    "_ZSt14set_unexpectedPFvvE",
    "_ZSt13get_terminatev",
    "_ZSt14get_unexpectedv",
    "_ZSt19uncaught_exceptionsv",
    "_ZSt18uncaught_exceptionv",
];

/// Installs the hook called with the cause when an exception cannot be handled, returning the
/// previous one.
///
/// The hook is called at most once. When it returns the platform abort runs.
pub fn set_abort_hook(hook: Option<AbortHook>) -> Option<AbortHook> {
    RUNTIME.policy().set_abort_hook(hook)
}

/// `std::set_terminate`
pub fn set_terminate_handler(handler: Option<Handler>) -> Option<Handler> {
    RUNTIME.policy().set_terminate_handler(handler)
}

/// `std::set_unexpected`
pub fn set_unexpected_handler(handler: Option<Handler>) -> Option<Handler> {
    RUNTIME.policy().set_unexpected_handler(handler)
}

/// The number of exceptions thrown and not yet destroyed.
pub fn exceptions_in_flight() -> usize {
    RUNTIME.in_flight()
}

#[unsafe(no_mangle)]
pub extern "C" fn libexcept_set_abort_hook(hook: Option<AbortHook>) -> Option<AbortHook> {
    set_abort_hook(hook)
}

/// Raises `header` from the current frame outward.
fn raise(header: *mut ExceptionHeader) -> ! {
    let cause = unwind::with_context(|regs, ip| {
        let frames = FrameIter::from_registers(regs.clone(), ip);
        if let Err(cause) = RUNTIME.find_handler(header, frames) {
            return cause;
        }
        install(header, FrameIter::from_registers(regs.clone(), ip))
    });
    RUNTIME.terminate(cause)
}

/// Transfers control to the next landing pad for `header`, only returns on failure.
#[allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    reason = "the selector register holds the sign extended selector"
)]
fn install(header: *mut ExceptionHeader, frames: FrameIter) -> TerminationCause {
    let (mut frame, landing) = match RUNTIME.next_landing(header, frames) {
        Ok(found) => found,
        Err(cause) => return cause,
    };

    let unwind = ExceptionHeader::unwind_exception(header);
    log::trace!(
        "resuming at {:#x} in frame ip={:#x} sp={:#x}",
        landing.lpad,
        frame.ip(),
        frame.sp()
    );

    frame.set_reg(UNWIND_DATA_REG.0, unwind as usize);
    frame.set_reg(UNWIND_DATA_REG.1, landing.selector as usize);
    frame.set_ip(landing.lpad);
    frame.adjust_stack_for_args();

    // Safety: the frame was unwound from the live stack and the landing pad expects exactly this
    // register state
    unsafe { frame.restore() }
}

fn resume(unwind: *mut UnwindException) -> ! {
    let header = RUNTIME.or_terminate(RUNTIME.resume_prepare(unwind));
    let cause = unwind::with_context(|regs, ip| {
        install(header, FrameIter::from_registers(regs.clone(), ip))
    });
    RUNTIME.terminate(cause)
}

#[unsafe(no_mangle)]
pub extern "C" fn __wrap___cxa_allocate_exception(size: usize) -> *mut u8 {
    RUNTIME.or_terminate(RUNTIME.allocate(size))
}

#[unsafe(no_mangle)]
pub extern "C" fn __wrap___cxa_free_exception(object: *mut u8) {
    RUNTIME.or_terminate(RUNTIME.free(object));
}

#[cfg(all(feature = "exception-allocator", not(test)))]
#[unsafe(no_mangle)]
pub extern "C" fn __cxa_allocate_exception(size: usize) -> *mut u8 {
    __wrap___cxa_allocate_exception(size)
}

#[cfg(all(feature = "exception-allocator", not(test)))]
#[unsafe(no_mangle)]
pub extern "C" fn __cxa_free_exception(object: *mut u8) {
    __wrap___cxa_free_exception(object);
}

/// # Safety
///
/// `object` must have been returned by `__cxa_allocate_exception` and hold a constructed object
/// of type `type_info`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap___cxa_throw(
    object: *mut u8,
    type_info: *const TypeInfo,
    destructor: Option<Destructor>,
) -> ! {
    let header = RUNTIME.or_terminate(RUNTIME.prepare_throw(object, type_info, destructor));
    raise(header)
}

#[unsafe(no_mangle)]
pub extern "C" fn __wrap___cxa_rethrow() -> ! {
    let header = RUNTIME.or_terminate(RUNTIME.prepare_rethrow());
    raise(header)
}

/// # Safety
///
/// Must only be called by landing pads with the exception pointer they received.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap___cxa_begin_catch(unwind: *mut UnwindException) -> *mut u8 {
    RUNTIME.or_terminate(RUNTIME.begin_catch(unwind))
}

#[unsafe(no_mangle)]
pub extern "C" fn __wrap___cxa_end_catch() {
    RUNTIME.or_terminate(RUNTIME.end_catch());
}

/// # Safety
///
/// Must only be called by landing pads with the exception pointer they received.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap___cxa_get_exception_ptr(unwind: *mut UnwindException) -> *mut u8 {
    RUNTIME.or_terminate(RUNTIME.get_exception_ptr(unwind))
}

#[unsafe(no_mangle)]
pub extern "C" fn __wrap___cxa_uncaught_exceptions() -> c_uint {
    c_uint::try_from(RUNTIME.uncaught_exceptions()).unwrap_or(c_uint::MAX)
}

/// # Safety
///
/// Must only be called by cleanup landing pads with the exception pointer they received.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap__Unwind_Resume(unwind: *mut UnwindException) -> ! {
    resume(unwind)
}

/// Resumes the exception whose cleanup landing pad just finished.
#[unsafe(no_mangle)]
pub extern "C" fn __wrap___cxa_end_cleanup() -> ! {
    let unwind = RUNTIME.or_terminate(RUNTIME.end_cleanup_target());
    resume(unwind)
}

/// Called by landing pads of frames that must not throw.
#[unsafe(no_mangle)]
pub extern "C" fn __wrap___cxa_call_terminate(unwind: *mut UnwindException) -> ! {
    RUNTIME.terminate(RUNTIME.must_not_throw_cause(unwind))
}

#[unsafe(no_mangle)]
pub extern "C" fn __wrap___cxa_call_unexpected(_unwind: *mut UnwindException) -> ! {
    RUNTIME.terminate(TerminationCause::UnexpectedViolation)
}

#[unsafe(no_mangle)]
pub extern "C" fn __wrap__ZSt9terminatev() -> ! {
    RUNTIME.terminate(TerminationCause::ExplicitTerminate)
}

#[unsafe(no_mangle)]
pub extern "C" fn __wrap__ZSt10unexpectedv() -> ! {
    RUNTIME.terminate(TerminationCause::UnexpectedViolation)
}

/// `std::set_terminate`
#[unsafe(no_mangle)]
pub extern "C" fn __wrap__ZSt13set_terminatePFvvE(handler: Option<Handler>) -> Option<Handler> {
    set_terminate_handler(handler)
}

/// `std::set_unexpected`
#[unsafe(no_mangle)]
pub extern "C" fn __wrap__ZSt14set_unexpectedPFvvE(handler: Option<Handler>) -> Option<Handler> {
    set_unexpected_handler(handler)
}

/// `std::get_terminate`
#[unsafe(no_mangle)]
pub extern "C" fn __wrap__ZSt13get_terminatev() -> Option<Handler> {
    RUNTIME.policy().terminate_handler()
}

/// `std::get_unexpected`
#[unsafe(no_mangle)]
pub extern "C" fn __wrap__ZSt14get_unexpectedv() -> Option<Handler> {
    RUNTIME.policy().unexpected_handler()
}

/// `std::uncaught_exceptions`
#[unsafe(no_mangle)]
pub extern "C" fn __wrap__ZSt19uncaught_exceptionsv() -> c_int {
    c_int::try_from(RUNTIME.uncaught_exceptions()).unwrap_or(c_int::MAX)
}

/// `std::uncaught_exception`
#[unsafe(no_mangle)]
pub extern "C" fn __wrap__ZSt18uncaught_exceptionv() -> bool {
    RUNTIME.uncaught_exceptions() > 0
}
