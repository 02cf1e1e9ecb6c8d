// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocation free stack unwinding.
//!
//! Frames are walked with the DWARF call frame information in `.eh_frame` on x86_64 and RISC-V,
//! and with the `.ARM.exidx`/`.ARM.extab` tables of the ARM exception handling ABI on 32-bit ARM.
//! Both yield [`Frame`]s through the same [`FrameIter`] interface, the language specific data of a
//! frame can then be decoded with [`lsda::Lsda`].

#![cfg_attr(not(test), no_std)]

mod arch;
#[cfg(not(target_arch = "arm"))]
mod eh_info;
mod error;
pub mod exidx;
#[cfg(not(target_arch = "arm"))]
mod frame;
pub mod lsda;
mod utils;

pub use arch::{RA, Registers, SP, UNWIND_DATA_REG};
pub use error::Error;
use gimli::{EndianSlice, NativeEndian};
pub use utils::with_context;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        pub use exidx::{Frame, FrameIter, register_exidx};
    } else {
        pub use eh_info::register_eh_frame;
        pub use frame::{Frame, FrameIter};
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// The information about a call frame needed to decide how an exception propagates through it.
pub trait UnwindFrame {
    /// Returns the current instruction pointer of this frame.
    fn ip(&self) -> usize;

    /// Returns the current stack pointer of this frame.
    ///
    /// Stacks grow downwards on all supported targets, so the handler frame of an exception
    /// always has a stack pointer at or above every frame it was thrown through.
    fn sp(&self) -> usize;

    /// Returns the starting symbol address of the frame of this function.
    fn symbol_address(&self) -> u64;

    /// Returns `true` if this Frame belongs to a signal trampoline handler.
    ///
    /// The return address of such frames points at the interrupted instruction and must not be
    /// adjusted before looking it up.
    fn is_signal_trampoline(&self) -> bool {
        false
    }

    /// Return a reader over the language specific data area of this frame, if it has one.
    fn language_specific_data(&self) -> Option<EndianSlice<'static, NativeEndian>>;

    fn text_rel_base(&self) -> Option<u64> {
        None
    }

    fn data_rel_base(&self) -> Option<u64> {
        None
    }

    /// The address that has to be looked up in the call site table.
    ///
    /// The return address points to the instruction after the call, which might already belong
    /// to a different call site.
    fn lookup_ip(&self) -> usize {
        if self.is_signal_trampoline() {
            self.ip()
        } else {
            self.ip().wrapping_sub(1)
        }
    }
}
