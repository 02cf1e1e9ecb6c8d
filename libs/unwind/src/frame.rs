// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use fallible_iterator::FallibleIterator;
use gimli::{
    BaseAddresses, CfaRule, EhFrame, EndianSlice, FrameDescriptionEntry, NativeEndian, Register,
    RegisterRule, UnwindSection, UnwindTableRow,
};

use crate::eh_info::obtain_eh_info;
use crate::utils::{StoreOnStack, deref_pointer, get_unlimited_slice};
use crate::{Error, Result, UnwindFrame, arch};

/// A frame in a stack.
///
/// This holds all the information about a call frame.
#[derive(Debug)]
pub struct Frame {
    regs: arch::Registers,
    bases: BaseAddresses,
    fde: FrameDescriptionEntry<EndianSlice<'static, NativeEndian>, usize>,
    row: UnwindTableRow<usize, StoreOnStack>,
    return_address_register: Register,
}

impl Frame {
    /// Sets the value of this frames instruction pointer.
    ///
    /// When paired with [`Frame::restore`] this will transfer control to the instruction pointer.
    pub fn set_ip(&mut self, value: usize) {
        self.regs[self.return_address_register] = value;
    }

    /// Sets the value of the specified register.
    ///
    /// Note that this will only update the representation in this frame not the actual machine register.
    /// To restore a frames register context see [`Frame::restore`].
    pub fn set_reg(&mut self, reg: Register, value: usize) {
        self.regs[reg] = value;
    }

    /// Restore control to this frame.
    ///
    /// # Safety
    ///
    /// This method is *highly* unsafe because it installs this frames register context, **without
    /// any checking**. If used improperly, much terrible things will happen, big sadness.
    //
    // The restore routine loads *all* registers saved in this frames register context into the
    // machine registers, including the return address. It must never be inlined, clobbering
    // registers in between would leave the landing pad with a corrupted context.
    #[inline(never)]
    pub unsafe fn restore(self) -> ! {
        // Safety: caller has to ensure this is safe
        unsafe { arch::restore_context(&self.regs) }
    }

    pub fn adjust_stack_for_args(&mut self) {
        let size = usize::try_from(self.row.saved_args_size()).unwrap_or(0);
        self.regs[arch::SP] = self.regs[arch::SP].wrapping_add(size);
    }

    fn from_context(regs: &arch::Registers, pc: usize) -> Result<Self> {
        let eh_info = obtain_eh_info()?;

        let fde = eh_info
            .eh_frame
            .fde_for_address(&eh_info.bases, pc as u64, EhFrame::cie_from_offset)
            .map_err(|err| match err {
                gimli::Error::NoUnwindInfoForAddress => Error::NoUnwindInfo(pc),
                err => Error::Gimli(err),
            })?;

        let mut unwinder = gimli::UnwindContext::<usize, StoreOnStack>::new_in();

        let row = fde
            .unwind_info_for_address(&eh_info.eh_frame, &eh_info.bases, &mut unwinder, pc as u64)?
            .clone();

        Ok(Self {
            return_address_register: fde.cie().return_address_register(),
            bases: eh_info.bases,
            fde,
            row,
            regs: regs.clone(),
        })
    }

    #[allow(
        clippy::cast_sign_loss,
        reason = "numeric casts are all checked and behave as expected"
    )]
    fn unwind(&self) -> Result<arch::Registers> {
        let row = &self.row;
        let mut new_regs = self.regs.clone();

        let cfa = match *row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                self.regs[register].wrapping_add(offset as usize)
            }
            CfaRule::Expression(_) => return Err(gimli::Error::UnsupportedEvaluation.into()),
        };

        new_regs[arch::SP] = cfa;
        new_regs[self.return_address_register] = 0;

        for reg in 0..=arch::MAX_REG {
            let reg = Register(reg);

            match row.register(reg) {
                // Leaf functions keep their return address in a register without a rule on how
                // to restore it.
                RegisterRule::Undefined if reg == self.return_address_register => {
                    new_regs[reg] = self.regs[self.return_address_register];
                }
                RegisterRule::Undefined => {}
                RegisterRule::SameValue => new_regs[reg] = self.regs[reg],
                // Safety: we have to trust the DWARF info here
                RegisterRule::Offset(offset) => unsafe {
                    new_regs[reg] = *(cfa.wrapping_add(offset as usize) as *const usize);
                },
                RegisterRule::ValOffset(offset) => {
                    new_regs[reg] = cfa.wrapping_add(offset as usize);
                }
                RegisterRule::Register(other) => new_regs[reg] = self.regs[other],
                RegisterRule::Constant(value) => {
                    new_regs[reg] =
                        usize::try_from(value).map_err(|_| gimli::Error::UnsupportedEvaluation)?;
                }
                // evaluating DWARF expressions needs an allocator
                _ => return Err(gimli::Error::UnsupportedEvaluation.into()),
            }
        }

        Ok(new_regs)
    }
}

impl UnwindFrame for Frame {
    fn ip(&self) -> usize {
        self.regs[self.return_address_register]
    }

    fn sp(&self) -> usize {
        self.regs[arch::SP]
    }

    fn symbol_address(&self) -> u64 {
        self.fde.initial_address()
    }

    fn is_signal_trampoline(&self) -> bool {
        self.fde.is_signal_trampoline()
    }

    fn language_specific_data(&self) -> Option<EndianSlice<'static, NativeEndian>> {
        // Safety: we have to trust the DWARF info here
        let addr = self.fde.lsda().map(|x| unsafe { deref_pointer(x) })?;

        Some(EndianSlice::new(
            // Safety: we have to trust the DWARF info here
            unsafe { get_unlimited_slice(addr as usize as *const u8) },
            NativeEndian,
        ))
    }

    fn text_rel_base(&self) -> Option<u64> {
        self.bases.eh_frame.text
    }

    fn data_rel_base(&self) -> Option<u64> {
        self.bases.eh_frame.data
    }
}

/// An iterator over frames on the stack.
///
/// ```rust,no_run
/// use fallible_iterator::FallibleIterator;
/// use unwind::UnwindFrame;
///
/// unwind::with_context(|regs, ip| {
///     let mut frames = unwind::FrameIter::from_registers(regs.clone(), ip);
///     while let Some(frame) = frames.next().unwrap() {
///         println!("ip: {:#x} sp: {:#x}", frame.ip(), frame.sp());
///     }
/// });
/// ```
#[derive(Clone)]
pub struct FrameIter {
    regs: arch::Registers,
    signal: bool,
    ip: usize,
}

impl FrameIter {
    /// Construct a new `FrameIter` that will walk the stack beginning at the provided context.
    ///
    /// The two most important values are the stack pointer and the instruction pointer.
    pub fn from_registers(regs: arch::Registers, ip: usize) -> Self {
        Self {
            regs,
            signal: false,
            ip,
        }
    }
}

impl FallibleIterator for FrameIter {
    type Item = Frame;
    type Error = Error;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        let mut ip = self.ip;

        // The previous call to `Frame::unwind` set the return address to zero (meaning there was no
        // information on how to restore the return address) this means we're done walking the stack.
        if ip == 0 {
            return Ok(None);
        }

        // RA points to the *next* instruction, so move it back 1 byte for the call instruction.
        if !self.signal {
            ip -= 1;
        }

        let frame = Frame::from_context(&self.regs, ip)?;
        self.regs = frame.unwind()?;
        // Use the return address as the next value of `pc` this essentially simulates a
        // function return.
        self.ip = self.regs[arch::RA];
        self.signal = frame.is_signal_trampoline();

        Ok(Some(frame))
    }
}
