// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The bookkeeping record placed in front of every thrown object.

use core::ptr;

use static_assertions::{const_assert, const_assert_eq};

use crate::rtti::TypeInfo;

/// The exception class of C++ exceptions thrown by the GNU runtime: vendor `GNUC`, language `C++\0`.
pub const GNU_CXX_EXCEPTION_CLASS: u64 = u64::from_be_bytes(*b"GNUCC++\0");

/// Destructor of the thrown object, as handed to `__cxa_throw`.
pub type Destructor = unsafe extern "C" fn(*mut u8);

/// The language independent part of an exception.
///
/// Landing pads receive a pointer to this struct and hand it back to `__cxa_begin_catch` and
/// `_Unwind_Resume`.
#[repr(C)]
#[derive(Debug)]
pub struct UnwindException {
    pub exception_class: u64,
    pub exception_cleanup: Option<unsafe extern "C" fn(u32, *mut UnwindException)>,
    pub private: [usize; 2],
}

/// Maximum fundamental alignment of the supported targets.
#[cfg(target_pointer_width = "64")]
pub const MAX_ALIGN: usize = 16;
/// Maximum fundamental alignment of the supported targets.
#[cfg(target_pointer_width = "32")]
pub const MAX_ALIGN: usize = 8;

#[repr(C)]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
#[derive(Debug)]
pub struct ExceptionHeader {
    pub exception_type: *const TypeInfo,
    pub destructor: Option<Destructor>,
    /// Next exception on the caught stack.
    pub next_caught: *mut ExceptionHeader,
    /// Next exception on the stack of exceptions whose cleanup code is running.
    pub next_cleanup: *mut ExceptionHeader,
    /// Number of active catch handlers for this exception.
    pub handler_count: usize,
    /// Set by `__cxa_rethrow`, keeps the object alive when the current handler ends.
    pub rethrown: bool,

    // Cached by the search phase
    pub handler_sp: usize,
    pub handler_lpad: usize,
    pub handler_selector: i64,
    pub adjusted_ptr: *mut u8,

    /// Stack pointer of the frame whose cleanup landing pad is running, zero if none is.
    pub cleanup_sp: usize,
    /// Index of the registry slot holding this record.
    pub slot: usize,

    pub unwind: UnwindException,
}

// The thrown object follows the header directly and must be suitably aligned for any type.
const_assert!(align_of::<ExceptionHeader>() >= MAX_ALIGN);
const_assert_eq!(size_of::<ExceptionHeader>() % MAX_ALIGN, 0);
const_assert_eq!(core::mem::offset_of!(UnwindException, exception_class), 0);

impl ExceptionHeader {
    pub const fn new(slot: usize) -> Self {
        Self {
            exception_type: ptr::null(),
            destructor: None,
            next_caught: ptr::null_mut(),
            next_cleanup: ptr::null_mut(),
            handler_count: 0,
            rethrown: false,
            handler_sp: 0,
            handler_lpad: 0,
            handler_selector: 0,
            adjusted_ptr: ptr::null_mut(),
            cleanup_sp: 0,
            slot,
            unwind: UnwindException {
                exception_class: GNU_CXX_EXCEPTION_CLASS,
                exception_cleanup: None,
                private: [0; 2],
            },
        }
    }

    /// Returns the thrown object that directly follows the header.
    pub fn object(this: *mut Self) -> *mut u8 {
        this.wrapping_add(1).cast()
    }

    pub fn unwind_exception(this: *mut Self) -> *mut UnwindException {
        this.cast::<u8>()
            .wrapping_add(core::mem::offset_of!(ExceptionHeader, unwind))
            .cast()
    }

    /// Recovers the header from the address landing pads are handed.
    pub fn from_unwind_exception(unwind: *mut UnwindException) -> *mut Self {
        unwind
            .cast::<u8>()
            .wrapping_sub(core::mem::offset_of!(ExceptionHeader, unwind))
            .cast()
    }
}
