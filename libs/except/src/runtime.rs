// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The state behind the exported C++ ABI entry points.
//!
//! Everything here is independent of how the stack is walked: operations that need frames take
//! them as a [`FallibleIterator`], so the same code runs against the real unwinder and against
//! synthetic stacks.

use core::ptr;

use fallible_iterator::FallibleIterator;
use unwind::UnwindFrame;

use crate::header::{Destructor, ExceptionHeader, UnwindException};
use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::registry::{Registry, RegistryError};
use crate::rtti::{ItaniumRtti, TypeInfo};
use crate::search::{self, Landing, Thrown};
use crate::termination::{TerminationCause, TerminationPolicy};

pub struct Runtime<const N: usize, const SIZE: usize> {
    registry: Registry<N, SIZE>,
    /// Top of the stack of exceptions currently being handled.
    caught: AtomicPtr<ExceptionHeader>,
    /// Top of the stack of exceptions whose cleanup landing pads are running.
    cleanups: AtomicPtr<ExceptionHeader>,
    uncaught: AtomicUsize,
    in_flight: AtomicUsize,
    policy: TerminationPolicy,
    matcher: ItaniumRtti,
}

impl<const N: usize, const SIZE: usize> Runtime<N, SIZE> {
    crate::loom::loom_const_fn! {
        pub const fn new() -> Self {
            Self::with_parts(TerminationPolicy::new(), ItaniumRtti::new())
        }
    }

    crate::loom::loom_const_fn! {
        pub const fn with_parts(policy: TerminationPolicy, matcher: ItaniumRtti) -> Self {
            Self {
                registry: Registry::new(),
                caught: AtomicPtr::new(ptr::null_mut()),
                cleanups: AtomicPtr::new(ptr::null_mut()),
                uncaught: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                policy,
                matcher,
            }
        }
    }

    pub fn policy(&self) -> &TerminationPolicy {
        &self.policy
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Registry<N, SIZE> {
        &self.registry
    }

    pub fn terminate(&self, cause: TerminationCause) -> ! {
        self.policy.terminate(cause)
    }

    /// Unwraps `res`, terminating with the cause on error.
    pub fn or_terminate<T>(&self, res: Result<T, TerminationCause>) -> T {
        match res {
            Ok(value) => value,
            Err(cause) => self.terminate(cause),
        }
    }

    /// The cause reported when `unwind` hits a frame that must not throw.
    ///
    /// Inside the cleanup of another exception this is a destructor throwing during unwinding.
    pub fn must_not_throw_cause(&self, unwind: *mut UnwindException) -> TerminationCause {
        let header = self
            .live_slot(unwind)
            .map_or(ptr::null_mut(), |idx| self.registry.header(idx));
        if self.cleanup_running_besides(header) {
            TerminationCause::ExceptionDuringUnwinding
        } else {
            TerminationCause::ExplicitTerminate
        }
    }

    /// Resolves `unwind` to the slot of a live exception.
    fn live_slot(&self, unwind: *mut UnwindException) -> Result<usize, RegistryError> {
        let idx = self.registry.index_of_unwind(unwind)?;
        if self.registry.is_in_use(idx) {
            Ok(idx)
        } else {
            Err(RegistryError::Vacant(idx))
        }
    }

    fn cleanup_running_besides(&self, header: *mut ExceptionHeader) -> bool {
        let mut running = self.cleanups.load(Ordering::Acquire);
        while !running.is_null() {
            if running != header {
                return true;
            }
            // Safety: exceptions on the cleanup stack are live
            running = unsafe { (*running).next_cleanup };
        }
        false
    }

    /// Claims storage for an exception object of `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<*mut u8, TerminationCause> {
        let idx = self.registry.acquire_for(size).map_err(|err| {
            log::error!("failed to allocate exception of {size} bytes: {err}");
            TerminationCause::RegistryExhausted
        })?;
        Ok(self.registry.object(idx))
    }

    /// Returns the storage of an exception object that was never thrown.
    pub fn free(&self, object: *mut u8) -> Result<(), TerminationCause> {
        self.registry
            .index_of_object(object)
            .and_then(|idx| self.registry.release(idx))
            .map_err(|err| {
                log::error!("failed to free exception {object:p}: {err}");
                TerminationCause::NoActiveException
            })
    }

    /// Fills in the header of a freshly allocated exception that is about to be raised.
    pub fn prepare_throw(
        &self,
        object: *mut u8,
        type_info: *const TypeInfo,
        destructor: Option<Destructor>,
    ) -> Result<*mut ExceptionHeader, TerminationCause> {
        let idx = self
            .registry
            .index_of_object(object)
            .ok()
            .filter(|idx| self.registry.is_in_use(*idx))
            .ok_or_else(|| {
                log::error!("thrown object {object:p} was not allocated as an exception");
                TerminationCause::NoActiveException
            })?;

        let header = self.registry.header(idx);
        // Safety: the slot is claimed and owned by the throwing context
        unsafe {
            (*header).exception_type = type_info;
            (*header).destructor = destructor;
        }

        self.uncaught.fetch_add(1, Ordering::AcqRel);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.policy.begin_unwinding();

        log::debug!("throwing exception {object:p} from slot {idx}");
        Ok(header)
    }

    /// Marks the exception currently being handled for rethrowing.
    pub fn prepare_rethrow(&self) -> Result<*mut ExceptionHeader, TerminationCause> {
        let header = self.caught.load(Ordering::Acquire);
        if header.is_null() {
            log::error!("rethrow without an active exception");
            return Err(TerminationCause::NoActiveException);
        }

        // Safety: exceptions on the caught stack are live
        unsafe { (*header).rethrown = true };
        self.uncaught.fetch_add(1, Ordering::AcqRel);
        self.policy.begin_unwinding();

        log::debug!("rethrowing exception {:p}", ExceptionHeader::object(header));
        Ok(header)
    }

    /// Runs the search phase for `header` and caches the handler in it.
    pub fn find_handler<I, F>(
        &self,
        header: *mut ExceptionHeader,
        frames: I,
    ) -> Result<(), TerminationCause>
    where
        I: FallibleIterator<Item = F, Error = unwind::Error>,
        F: UnwindFrame,
    {
        let thrown = Thrown {
            // Safety: the header belongs to the exception being raised
            type_info: unsafe { (*header).exception_type },
            object: ExceptionHeader::object(header),
        };
        let handler = search::search_phase(frames, &thrown, &self.matcher).map_err(|cause| {
            // destructors are implicitly `noexcept`
            if cause == TerminationCause::UnexpectedViolation
                && self.cleanup_running_besides(header)
            {
                log::error!("exception thrown from a destructor during unwinding");
                TerminationCause::ExceptionDuringUnwinding
            } else {
                cause
            }
        })?;

        // a handler at or beyond a frame whose cleanup is running means the new exception
        // leaves that cleanup
        let mut running = self.cleanups.load(Ordering::Acquire);
        while !running.is_null() {
            // Safety: exceptions on the cleanup stack are live
            let other = unsafe { &*running };
            if running != header && handler.sp >= other.cleanup_sp {
                log::error!(
                    "exception escapes cleanup of exception in frame sp={:#x}",
                    other.cleanup_sp
                );
                return Err(TerminationCause::ExceptionDuringUnwinding);
            }
            running = other.next_cleanup;
        }

        // Safety: the header belongs to the exception being raised
        unsafe {
            (*header).handler_sp = handler.sp;
            (*header).handler_lpad = handler.lpad;
            (*header).handler_selector = handler.selector;
            (*header).adjusted_ptr = handler.adjusted;
        }
        Ok(())
    }

    /// Runs the cleanup phase for `header`, returning the frame and landing pad to install.
    pub fn next_landing<I, F>(
        &self,
        header: *mut ExceptionHeader,
        frames: I,
    ) -> Result<(F, Landing), TerminationCause>
    where
        I: FallibleIterator<Item = F, Error = unwind::Error>,
        F: UnwindFrame,
    {
        // Safety: the header belongs to the exception being raised
        let handler = unsafe {
            search::Handler {
                sp: (*header).handler_sp,
                lpad: (*header).handler_lpad,
                selector: (*header).handler_selector,
                adjusted: (*header).adjusted_ptr,
            }
        };

        let (frame, landing) = search::cleanup_phase(frames, &handler)?;

        if landing.is_cleanup() {
            // Safety: the header belongs to the exception being raised
            unsafe {
                (*header).cleanup_sp = frame.sp();
                (*header).next_cleanup = self.cleanups.load(Ordering::Acquire);
            }
            self.cleanups.store(header, Ordering::Release);
        }

        log::trace!(
            "installing landing pad {:#x} (selector {}) in frame sp={:#x}",
            landing.lpad,
            landing.selector,
            frame.sp()
        );
        Ok((frame, landing))
    }

    /// Called when the cleanup landing pad of `unwind` finished, returns the exception to
    /// continue raising.
    pub fn resume_prepare(
        &self,
        unwind: *mut UnwindException,
    ) -> Result<*mut ExceptionHeader, TerminationCause> {
        let idx = self.live_slot(unwind).map_err(|err| {
            log::error!("resume of {unwind:p}: {err}");
            TerminationCause::NoActiveException
        })?;
        let header = self.registry.header(idx);
        self.unlink_cleanup(header);
        Ok(header)
    }

    /// The exception whose cleanup landing pad is running.
    pub fn end_cleanup_target(&self) -> Result<*mut UnwindException, TerminationCause> {
        let header = self.cleanups.load(Ordering::Acquire);
        if header.is_null() {
            log::error!("end of cleanup without a running cleanup");
            return Err(TerminationCause::NoActiveException);
        }
        Ok(ExceptionHeader::unwind_exception(header))
    }

    fn unlink_cleanup(&self, header: *mut ExceptionHeader) {
        let mut prev: *mut ExceptionHeader = ptr::null_mut();
        let mut cur = self.cleanups.load(Ordering::Acquire);
        while !cur.is_null() {
            // Safety: exceptions on the cleanup stack are live
            let next = unsafe { (*cur).next_cleanup };
            if cur == header {
                if prev.is_null() {
                    self.cleanups.store(next, Ordering::Release);
                } else {
                    // Safety: exceptions on the cleanup stack are live
                    unsafe { (*prev).next_cleanup = next };
                }
                // Safety: see above
                unsafe {
                    (*cur).next_cleanup = ptr::null_mut();
                    (*cur).cleanup_sp = 0;
                }
                return;
            }
            prev = cur;
            cur = next;
        }
    }

    /// Enters the handler for `unwind`, returning the pointer the `catch` parameter binds to.
    pub fn begin_catch(&self, unwind: *mut UnwindException) -> Result<*mut u8, TerminationCause> {
        let idx = self.live_slot(unwind).map_err(|err| {
            log::error!("begin catch of {unwind:p}: {err}");
            TerminationCause::BeginEndCatchMismatch
        })?;
        let header = self.registry.header(idx);

        // Safety: the exception is live until its last handler ends
        let adjusted = unsafe {
            let h = &mut *header;
            h.rethrown = false;
            h.handler_count += 1;
            let top = self.caught.load(Ordering::Acquire);
            if top != header {
                h.next_caught = top;
                self.caught.store(header, Ordering::Release);
            }
            h.adjusted_ptr
        };

        let uncaught = self.uncaught.load(Ordering::Acquire).saturating_sub(1);
        self.uncaught.store(uncaught, Ordering::Release);
        if uncaught == 0 {
            self.policy.end_unwinding();
        }

        log::debug!("caught exception from slot {idx}");
        Ok(adjusted)
    }

    /// Leaves the innermost handler, destroying the exception when no handler is left.
    pub fn end_catch(&self) -> Result<(), TerminationCause> {
        let header = self.caught.load(Ordering::Acquire);
        if header.is_null() {
            log::error!("end catch without an active handler");
            return Err(TerminationCause::BeginEndCatchMismatch);
        }

        // Safety: exceptions on the caught stack are live
        let h = unsafe { &mut *header };
        if h.handler_count == 0 {
            log::error!("end catch of exception in slot {} without handler", h.slot);
            return Err(TerminationCause::BeginEndCatchMismatch);
        }

        h.handler_count -= 1;
        if h.handler_count > 0 {
            return Ok(());
        }

        self.caught.store(h.next_caught, Ordering::Release);
        h.next_caught = ptr::null_mut();

        if h.rethrown {
            log::trace!("exception in slot {} propagates further", h.slot);
            return Ok(());
        }

        let slot = h.slot;
        if let Some(destructor) = h.destructor {
            // Safety: the object was constructed by the thrower and is destroyed exactly once
            unsafe { destructor(ExceptionHeader::object(header)) };
        }
        self.registry.release(slot).map_err(|err| {
            log::error!("failed to release exception slot: {err}");
            TerminationCause::BeginEndCatchMismatch
        })?;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        log::debug!("destroyed exception in slot {slot}");
        Ok(())
    }

    /// The pointer the `catch` parameter binds to, without entering the handler.
    pub fn get_exception_ptr(
        &self,
        unwind: *mut UnwindException,
    ) -> Result<*mut u8, TerminationCause> {
        let idx = self.live_slot(unwind).map_err(|err| {
            log::error!("exception pointer of {unwind:p}: {err}");
            TerminationCause::BeginEndCatchMismatch
        })?;
        // Safety: the exception is live while its landing pad runs
        Ok(unsafe { (*self.registry.header(idx)).adjusted_ptr })
    }

    /// The number of exceptions thrown but not yet caught.
    pub fn uncaught_exceptions(&self) -> usize {
        self.uncaught.load(Ordering::Acquire)
    }

    /// The number of exceptions thrown but not yet destroyed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}
