// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr;

use crate::loom::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Why the exception runtime gave up.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// Unwinding reached the outermost frame without finding a handler.
    NoHandlerFound = 0,
    /// A new exception escaped while cleanups for another one were running.
    ExceptionDuringUnwinding = 1,
    /// `__cxa_end_catch` without a matching `__cxa_begin_catch`, or a catch of an object that is
    /// not an exception.
    BeginEndCatchMismatch = 2,
    /// Every exception slot is in use, or the object does not fit into one.
    RegistryExhausted = 3,
    /// `std::terminate` was called.
    ExplicitTerminate = 4,
    /// An exception specification or `noexcept` was violated.
    UnexpectedViolation = 5,
    /// A rethrow with no exception being handled, or a throw of an object the registry does not own.
    NoActiveException = 6,
}

impl TerminationCause {
    pub const fn description(self) -> &'static str {
        match self {
            Self::NoHandlerFound => "no handler found for exception",
            Self::ExceptionDuringUnwinding => "exception thrown during unwinding",
            Self::BeginEndCatchMismatch => "unbalanced begin/end catch",
            Self::RegistryExhausted => "exception registry exhausted",
            Self::ExplicitTerminate => "terminate called",
            Self::UnexpectedViolation => "exception specification violated",
            Self::NoActiveException => "no active exception",
        }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Called exactly once with the cause when the runtime terminates.
pub type AbortHook = extern "C" fn(TerminationCause);
/// A `std::terminate_handler` or `std::unexpected_handler`.
pub type Handler = extern "C" fn();

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Normal = 0,
    Unwinding = 1,
    Terminating = 2,
    Aborted = 3,
}

impl PolicyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Unwinding,
            2 => Self::Terminating,
            _ => Self::Aborted,
        }
    }
}

fn abort_fallback(_cause: TerminationCause) -> ! {
    abort::abort()
}

pub struct TerminationPolicy {
    state: AtomicU8,
    hook: AtomicPtr<()>,
    terminate_handler: AtomicPtr<()>,
    unexpected_handler: AtomicPtr<()>,
    fallback: fn(TerminationCause) -> !,
}

impl fmt::Debug for TerminationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminationPolicy")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationPolicy {
    crate::loom::loom_const_fn! {
        pub const fn new() -> Self {
            Self::with_fallback(abort_fallback)
        }
    }

    crate::loom::loom_const_fn! {
        /// A policy that calls `fallback` instead of the platform abort.
        pub const fn with_fallback(fallback: fn(TerminationCause) -> !) -> Self {
            Self {
                state: AtomicU8::new(PolicyState::Normal as u8),
                hook: AtomicPtr::new(ptr::null_mut()),
                terminate_handler: AtomicPtr::new(ptr::null_mut()),
                unexpected_handler: AtomicPtr::new(ptr::null_mut()),
                fallback,
            }
        }
    }

    pub fn state(&self) -> PolicyState {
        PolicyState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn begin_unwinding(&self) {
        let _ = self.state.compare_exchange(
            PolicyState::Normal as u8,
            PolicyState::Unwinding as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn end_unwinding(&self) {
        let _ = self.state.compare_exchange(
            PolicyState::Unwinding as u8,
            PolicyState::Normal as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Installs the abort hook, returning the previous one.
    pub fn set_abort_hook(&self, hook: Option<AbortHook>) -> Option<AbortHook> {
        let prev = self.hook.swap(
            hook.map_or(ptr::null_mut(), |f| f as *mut ()),
            Ordering::AcqRel,
        );
        // Safety: only ever stores null or an `AbortHook`
        unsafe { as_fn::<AbortHook>(prev) }
    }

    pub fn set_terminate_handler(&self, handler: Option<Handler>) -> Option<Handler> {
        swap_handler(&self.terminate_handler, handler)
    }

    pub fn set_unexpected_handler(&self, handler: Option<Handler>) -> Option<Handler> {
        swap_handler(&self.unexpected_handler, handler)
    }

    pub fn terminate_handler(&self) -> Option<Handler> {
        // Safety: only ever stores null or a `Handler`
        unsafe { as_fn::<Handler>(self.terminate_handler.load(Ordering::Acquire)) }
    }

    pub fn unexpected_handler(&self) -> Option<Handler> {
        // Safety: only ever stores null or a `Handler`
        unsafe { as_fn::<Handler>(self.unexpected_handler.load(Ordering::Acquire)) }
    }

    /// Terminates the program with `cause`.
    ///
    /// The handlers and the abort hook run only for the first termination, re-entering goes
    /// straight to the fallback.
    pub fn terminate(&self, cause: TerminationCause) -> ! {
        let prev = self
            .state
            .swap(PolicyState::Terminating as u8, Ordering::AcqRel);

        if matches!(
            PolicyState::from_u8(prev),
            PolicyState::Terminating | PolicyState::Aborted
        ) {
            self.state.store(PolicyState::Aborted as u8, Ordering::Release);
            log::error!("terminated again while terminating: {cause}");
            (self.fallback)(cause);
        }

        log::error!("terminating: {cause} ({cause:?})");

        if cause == TerminationCause::UnexpectedViolation {
            if let Some(handler) = self.unexpected_handler() {
                handler();
            }
        }

        if let Some(handler) = self.terminate_handler() {
            handler();
        }

        // Safety: only ever stores null or an `AbortHook`
        if let Some(hook) = unsafe { as_fn::<AbortHook>(self.hook.load(Ordering::Acquire)) } {
            hook(cause);
            log::error!("abort hook returned");
        }

        self.state.store(PolicyState::Aborted as u8, Ordering::Release);
        (self.fallback)(cause)
    }
}

fn swap_handler(slot: &AtomicPtr<()>, handler: Option<Handler>) -> Option<Handler> {
    let prev = slot.swap(
        handler.map_or(ptr::null_mut(), |f| f as *mut ()),
        Ordering::AcqRel,
    );
    // Safety: only ever stores null or a `Handler`
    unsafe { as_fn::<Handler>(prev) }
}

/// # Safety
///
/// `ptr` must be null or a function pointer of type `F`.
unsafe fn as_fn<F: Copy>(ptr: *mut ()) -> Option<F> {
    const { assert!(size_of::<F>() == size_of::<*mut ()>()) };
    if ptr.is_null() {
        None
    } else {
        // Safety: ensured by the caller
        Some(unsafe { core::mem::transmute_copy::<*mut (), F>(&ptr) })
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::cell::RefCell;
    use std::panic::{self, AssertUnwindSafe};
    use std::vec::Vec;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Unexpected,
        Terminate,
        Hook(TerminationCause),
    }

    std::thread_local! {
        static EVENTS: RefCell<Vec<Event>> = const { RefCell::new(Vec::new()) };
    }

    fn record(event: Event) {
        EVENTS.with_borrow_mut(|events| events.push(event));
    }

    fn take_events() -> Vec<Event> {
        EVENTS.with_borrow_mut(core::mem::take)
    }

    extern "C" fn hook(cause: TerminationCause) {
        record(Event::Hook(cause));
    }

    extern "C" fn terminate_handler() {
        record(Event::Terminate);
    }

    extern "C" fn unexpected_handler() {
        record(Event::Unexpected);
    }

    fn fallback(cause: TerminationCause) -> ! {
        panic::panic_any(cause)
    }

    fn run_terminate(policy: &TerminationPolicy, cause: TerminationCause) -> TerminationCause {
        let payload = panic::catch_unwind(AssertUnwindSafe(|| policy.terminate(cause)))
            .unwrap_err();
        *payload.downcast::<TerminationCause>().unwrap()
    }

    #[test]
    fn hook_runs_once_then_fallback() {
        let policy = TerminationPolicy::with_fallback(fallback);
        policy.set_abort_hook(Some(hook));

        let cause = run_terminate(&policy, TerminationCause::NoHandlerFound);
        assert_eq!(cause, TerminationCause::NoHandlerFound);
        assert_eq!(policy.state(), PolicyState::Aborted);
        assert_eq!(take_events(), [Event::Hook(TerminationCause::NoHandlerFound)]);

        // a second termination does not reach the hook again
        run_terminate(&policy, TerminationCause::ExplicitTerminate);
        assert!(take_events().is_empty());
    }

    #[test]
    fn handlers_run_before_hook() {
        let policy = TerminationPolicy::with_fallback(fallback);
        policy.set_abort_hook(Some(hook));
        policy.set_terminate_handler(Some(terminate_handler));
        policy.set_unexpected_handler(Some(unexpected_handler));

        run_terminate(&policy, TerminationCause::UnexpectedViolation);
        assert_eq!(
            take_events(),
            [
                Event::Unexpected,
                Event::Terminate,
                Event::Hook(TerminationCause::UnexpectedViolation)
            ]
        );
    }

    #[test]
    fn unexpected_handler_only_for_violations() {
        let policy = TerminationPolicy::with_fallback(fallback);
        policy.set_terminate_handler(Some(terminate_handler));
        policy.set_unexpected_handler(Some(unexpected_handler));

        run_terminate(&policy, TerminationCause::RegistryExhausted);
        assert_eq!(take_events(), [Event::Terminate]);
    }

    #[test]
    fn unwinding_transitions() {
        let policy = TerminationPolicy::with_fallback(fallback);
        assert_eq!(policy.state(), PolicyState::Normal);
        policy.begin_unwinding();
        assert_eq!(policy.state(), PolicyState::Unwinding);
        policy.end_unwinding();
        assert_eq!(policy.state(), PolicyState::Normal);
    }

    #[test]
    fn setters_return_previous() {
        let policy = TerminationPolicy::with_fallback(fallback);
        assert!(policy.set_abort_hook(Some(hook)).is_none());
        assert!(policy.set_abort_hook(None).is_some());
        assert!(policy.set_abort_hook(None).is_none());
        assert!(policy.set_terminate_handler(Some(terminate_handler)).is_none());
        assert!(policy.terminate_handler().is_some());
        assert!(policy.set_terminate_handler(None).is_some());
        assert!(policy.terminate_handler().is_none());

        assert!(policy.set_unexpected_handler(Some(unexpected_handler)).is_none());
        assert!(policy.unexpected_handler().is_some());
        assert!(policy.terminate_handler().is_none());
    }

    #[test]
    fn cause_discriminants_are_stable() {
        assert_eq!(TerminationCause::NoHandlerFound as u8, 0);
        assert_eq!(TerminationCause::NoActiveException as u8, 6);
        assert_eq!(
            TerminationCause::RegistryExhausted.to_string(),
            "exception registry exhausted"
        );
    }
}
