// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed capacity storage for exception objects.
//!
//! Every slot holds an [`ExceptionHeader`] immediately followed by the buffer the thrown object is
//! constructed in. Slots are claimed with a compare-exchange on their state byte and released with
//! a swap, neither operation ever blocks.

use core::mem::MaybeUninit;

use crate::header::{ExceptionHeader, UnwindException};
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicU8, Ordering};

const FREE: u8 = 0;
const IN_USE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum RegistryError {
    /// All exception slots are in use
    Exhausted,
    /// Exception object of {requested} bytes does not fit into a slot of {capacity} bytes
    PayloadTooLarge { requested: usize, capacity: usize },
    /// Pointer does not refer to an exception owned by the registry
    ForeignPointer,
    /// Exception slot {0} was released twice
    DoubleRelease(usize),
    /// Exception slot {0} is not in use
    Vacant(usize),
}

#[repr(C)]
#[allow(dead_code, reason = "only accessed through pointer casts")]
struct Slot<const SIZE: usize> {
    header: ExceptionHeader,
    object: [MaybeUninit<u8>; SIZE],
}

pub struct Registry<const N: usize, const SIZE: usize> {
    states: [AtomicU8; N],
    slots: [UnsafeCell<MaybeUninit<Slot<SIZE>>>; N],
}

// Safety: slot storage is only handed out to the context that claimed the slot
unsafe impl<const N: usize, const SIZE: usize> Sync for Registry<N, SIZE> {}
// Safety: slots are only handed to the context that claimed them
unsafe impl<const N: usize, const SIZE: usize> Send for Registry<N, SIZE> {}

impl<const N: usize, const SIZE: usize> Default for Registry<N, SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const SIZE: usize> Registry<N, SIZE> {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            states: [const { AtomicU8::new(FREE) }; N],
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            states: core::array::from_fn(|_| AtomicU8::new(FREE)),
            slots: core::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
        }
    }

    /// Claims a free slot and initializes its header.
    pub fn acquire(&self) -> Result<usize, RegistryError> {
        for (idx, state) in self.states.iter().enumerate() {
            if state
                .compare_exchange(FREE, IN_USE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: the slot is exclusively ours until released
                unsafe { self.header(idx).write(ExceptionHeader::new(idx)) };
                log::trace!("acquired exception slot {idx}");
                return Ok(idx);
            }
        }

        Err(RegistryError::Exhausted)
    }

    /// Claims a slot for an object of `size` bytes.
    pub fn acquire_for(&self, size: usize) -> Result<usize, RegistryError> {
        if size > self.payload_capacity() {
            return Err(RegistryError::PayloadTooLarge {
                requested: size,
                capacity: self.payload_capacity(),
            });
        }
        self.acquire()
    }

    pub fn release(&self, idx: usize) -> Result<(), RegistryError> {
        let state = self.states.get(idx).ok_or(RegistryError::ForeignPointer)?;
        match state.swap(FREE, Ordering::Release) {
            IN_USE => {
                log::trace!("released exception slot {idx}");
                Ok(())
            }
            _ => Err(RegistryError::DoubleRelease(idx)),
        }
    }

    pub fn is_in_use(&self, idx: usize) -> bool {
        self.states
            .get(idx)
            .is_some_and(|state| state.load(Ordering::Acquire) == IN_USE)
    }

    /// Returns the number of claimed slots.
    pub fn in_use(&self) -> usize {
        self.states
            .iter()
            .filter(|state| state.load(Ordering::Acquire) == IN_USE)
            .count()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Returns the number of bytes available to the thrown object of each slot.
    pub const fn payload_capacity(&self) -> usize {
        SIZE
    }

    /// Returns the header of slot `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn header(&self, idx: usize) -> *mut ExceptionHeader {
        self.slots[idx].with_mut(|slot| slot.cast::<ExceptionHeader>())
    }

    /// Returns the object buffer of slot `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn object(&self, idx: usize) -> *mut u8 {
        ExceptionHeader::object(self.header(idx))
    }

    /// Resolves a thrown object pointer to its slot.
    pub fn index_of_object(&self, object: *const u8) -> Result<usize, RegistryError> {
        (0..N)
            .find(|&idx| self.object(idx).cast_const() == object)
            .ok_or(RegistryError::ForeignPointer)
    }

    /// Resolves the address handed to landing pads to its slot.
    pub fn index_of_unwind(&self, unwind: *mut UnwindException) -> Result<usize, RegistryError> {
        self.index_of_header(ExceptionHeader::from_unwind_exception(unwind))
    }

    fn index_of_header(&self, header: *const ExceptionHeader) -> Result<usize, RegistryError> {
        (0..N)
            .find(|&idx| self.header(idx).cast_const() == header)
            .ok_or(RegistryError::ForeignPointer)
    }
}
