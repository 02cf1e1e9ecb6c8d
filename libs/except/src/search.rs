// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The two passes over the stack that make up raising an exception.
//!
//! The search phase walks outward until it finds a frame with a handler for the exception,
//! without changing any state. The cleanup phase walks the same frames again and stops at the
//! first landing pad that has to run, either a cleanup below the handler or the handler itself.

use fallible_iterator::FallibleIterator;
use unwind::UnwindFrame;
use unwind::lsda::{Action, EhAction, Lsda};

use crate::rtti::{CatchMatcher, TypeInfo};
use crate::termination::TerminationCause;

/// The exception being raised.
#[derive(Debug, Clone, Copy)]
pub struct Thrown {
    pub type_info: *const TypeInfo,
    pub object: *mut u8,
}

/// The handler found by the search phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    /// Stack pointer of the frame the handler lives in.
    pub sp: usize,
    pub lpad: usize,
    pub selector: i64,
    /// The pointer `__cxa_begin_catch` returns to the handler.
    pub adjusted: *mut u8,
}

/// A landing pad to transfer control to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landing {
    pub lpad: usize,
    /// Zero for cleanups.
    pub selector: i64,
}

impl Landing {
    pub fn is_cleanup(&self) -> bool {
        self.selector == 0
    }
}

/// Finds the handler for `thrown` in `frames`.
pub fn search_phase<I, F, M>(
    mut frames: I,
    thrown: &Thrown,
    matcher: &M,
) -> Result<Handler, TerminationCause>
where
    I: FallibleIterator<Item = F, Error = unwind::Error>,
    F: UnwindFrame,
    M: CatchMatcher,
{
    loop {
        let frame = match frames.next() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("reached end of stack without finding a handler");
                return Err(TerminationCause::NoHandlerFound);
            }
            Err(err) => {
                log::error!("failed to unwind stack during search phase: {err}");
                return Err(TerminationCause::NoHandlerFound);
            }
        };

        log::trace!("search phase: ip={:#x} sp={:#x}", frame.ip(), frame.sp());

        match handler_in_frame(&frame, thrown, matcher) {
            Ok(Some(handler)) => {
                log::debug!(
                    "found handler at {:#x} (selector {}) in frame sp={:#x}",
                    handler.lpad,
                    handler.selector,
                    handler.sp
                );
                return Ok(handler);
            }
            Ok(None) => {}
            Err(Verdict::Violation) => return Err(TerminationCause::UnexpectedViolation),
            Err(Verdict::Malformed(err)) => {
                log::error!("malformed exception table for frame ip={:#x}: {err}", frame.ip());
                return Err(TerminationCause::NoHandlerFound);
            }
        }
    }
}

/// Finds the landing pad to install next.
///
/// `handler` is the result of a previous [`search_phase`] over the same stack.
pub fn cleanup_phase<I, F>(
    mut frames: I,
    handler: &Handler,
) -> Result<(F, Landing), TerminationCause>
where
    I: FallibleIterator<Item = F, Error = unwind::Error>,
    F: UnwindFrame,
{
    loop {
        let frame = match frames.next() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::error!("handler frame sp={:#x} vanished during cleanup phase", handler.sp);
                return Err(TerminationCause::ExceptionDuringUnwinding);
            }
            Err(err) => {
                log::error!("failed to unwind stack during cleanup phase: {err}");
                return Err(TerminationCause::ExceptionDuringUnwinding);
            }
        };

        if frame.sp() == handler.sp {
            let landing = Landing {
                lpad: handler.lpad,
                selector: handler.selector,
            };
            return Ok((frame, landing));
        }

        match cleanup_in_frame(&frame) {
            Ok(Some(lpad)) => {
                log::trace!("running cleanup at {lpad:#x} in frame sp={:#x}", frame.sp());
                return Ok((frame, Landing { lpad, selector: 0 }));
            }
            Ok(None) => {}
            Err(err) => {
                log::error!("malformed exception table for frame ip={:#x}: {err}", frame.ip());
                return Err(TerminationCause::ExceptionDuringUnwinding);
            }
        }
    }
}

enum Verdict {
    Violation,
    Malformed(unwind::Error),
}

impl From<unwind::Error> for Verdict {
    fn from(err: unwind::Error) -> Self {
        Self::Malformed(err)
    }
}

fn handler_in_frame<F: UnwindFrame, M: CatchMatcher>(
    frame: &F,
    thrown: &Thrown,
    matcher: &M,
) -> Result<Option<Handler>, Verdict> {
    let Some(lsda) = frame.language_specific_data() else {
        return Ok(None);
    };
    let lsda = Lsda::parse(frame, lsda)?;

    let (lpad, mut chain) = match lsda.find_action(frame.lookup_ip() as u64)? {
        EhAction::None | EhAction::Cleanup(_) => return Ok(None),
        EhAction::Terminate => {
            log::error!("ip {:#x} may not throw", frame.lookup_ip());
            return Err(Verdict::Violation);
        }
        EhAction::Actions { lpad, chain } => (lpad, chain),
    };

    let handler = |selector, adjusted| Handler {
        sp: frame.sp(),
        lpad,
        selector,
        adjusted,
    };

    while let Some(action) = chain.next()? {
        match action {
            Action::Cleanup => {}
            Action::Catch {
                selector,
                type_info: 0,
            } => return Ok(Some(handler(selector, thrown.object))),
            Action::Catch {
                selector,
                type_info,
            } => {
                // Safety: the type table holds `type_info` addresses
                if let Some(adjusted) = unsafe { catches(matcher, thrown, type_info) } {
                    return Ok(Some(handler(selector, adjusted)));
                }
            }
            Action::Filter { selector, mut spec } => {
                let mut permitted = false;
                while let Some(type_info) = spec.next()? {
                    // Safety: specification lists hold `type_info` addresses
                    if unsafe { catches(matcher, thrown, type_info) }.is_some() {
                        permitted = true;
                        break;
                    }
                }
                if !permitted {
                    log::error!("exception violates specification (selector {selector})");
                    return Err(Verdict::Violation);
                }
            }
        }
    }

    Ok(None)
}

fn cleanup_in_frame<F: UnwindFrame>(frame: &F) -> unwind::Result<Option<usize>> {
    let Some(lsda) = frame.language_specific_data() else {
        return Ok(None);
    };
    let lsda = Lsda::parse(frame, lsda)?;

    match lsda.find_action(frame.lookup_ip() as u64)? {
        EhAction::None | EhAction::Terminate => Ok(None),
        EhAction::Cleanup(lpad) => Ok(Some(lpad)),
        EhAction::Actions { lpad, mut chain } => {
            while let Some(action) = chain.next()? {
                if matches!(action, Action::Cleanup) {
                    return Ok(Some(lpad));
                }
            }
            Ok(None)
        }
    }
}

/// # Safety
///
/// `type_info` must be the address of a `std::type_info`.
unsafe fn catches<M: CatchMatcher>(
    matcher: &M,
    thrown: &Thrown,
    type_info: usize,
) -> Option<*mut u8> {
    if thrown.type_info.is_null() {
        return None;
    }
    // Safety: ensured by the caller and by `__cxa_throw`
    unsafe {
        matcher.matches(
            &*thrown.type_info,
            &*(type_info as *const TypeInfo),
            thrown.object,
        )
    }
}
