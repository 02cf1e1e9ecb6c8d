// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! 32-bit ARM specific unwinding code, mostly saving and restoring registers.

use gimli::{Arm, Register};

/// The largest core register number on this architecture.
pub const MAX_REG: u16 = 15;

pub const SP: Register = Arm::R13;
pub const LR: Register = Arm::R14;
pub const PC: Register = Arm::R15;

/// Unwinding yields the caller's program counter, not a link register value.
pub const RA: Register = PC;

/// The registers a landing pad expects the exception pointer and the handler selector in.
pub const UNWIND_DATA_REG: (Register, Register) = (Arm::R0, Arm::R1);

/// The ABI's virtual register set doubles as the register context.
pub use crate::exidx::VirtualRegisters as Registers;

#[cfg(target_abi = "eabihf")]
macro_rules! save_vfp {
    () => {
        "add r12, sp, #64\nvstmia r12, {{d8-d15}}"
    };
}

#[cfg(not(target_abi = "eabihf"))]
macro_rules! save_vfp {
    () => {
        ""
    };
}

#[cfg(target_abi = "eabihf")]
macro_rules! restore_vfp {
    () => {
        "add r1, r0, #64\nvldmia r1, {{d8-d15}}"
    };
}

#[cfg(not(target_abi = "eabihf"))]
macro_rules! restore_vfp {
    () => {
        ""
    };
}

// The context occupies the lowest 128 bytes of a 136 byte frame below the pushed {r4, lr} pair.
// r13 is stored at offset 52, r14 at 56 and r15 at 60.
core::arch::global_asm!(
    ".text",
    ".p2align 2",
    ".globl __libexcept_save_context",
    ".hidden __libexcept_save_context",
    ".type __libexcept_save_context,%function",
    "__libexcept_save_context:",
    ".fnstart",
    ".cfi_startproc",
    "push {{r4, lr}}",
    ".save {{r4, lr}}",
    ".cfi_def_cfa_offset 8",
    ".cfi_offset lr, -4",
    ".cfi_offset r4, -8",
    "sub sp, sp, #136",
    ".pad #136",
    ".cfi_def_cfa_offset 144",
    "add r12, sp, #16",
    "stmia r12, {{r4-r11}}",
    "add r12, sp, #144",
    "str r12, [sp, #52]",
    "str lr, [sp, #56]",
    "str lr, [sp, #60]",
    save_vfp!(),
    "mov r2, r0",
    "mov r0, sp",
    "blx r2",
    "add sp, sp, #136",
    "pop {{r4, pc}}",
    ".cfi_endproc",
    ".fnend",
    ".size __libexcept_save_context, . - __libexcept_save_context",
    "",
    ".p2align 2",
    ".globl __libexcept_restore_context",
    ".hidden __libexcept_restore_context",
    ".type __libexcept_restore_context,%function",
    "__libexcept_restore_context:",
    restore_vfp!(),
    "ldr r1, [r0, #52]",
    "mov sp, r1",
    "ldr lr, [r0, #56]",
    "ldr r12, [r0, #60]",
    "ldmia r0, {{r0-r11}}",
    "bx r12",
    ".size __libexcept_restore_context, . - __libexcept_restore_context",
);

unsafe extern "C" {
    #[link_name = "__libexcept_save_context"]
    fn save_context_raw(f: extern "C" fn(&mut Registers, *mut ()), ptr: *mut ());
    #[link_name = "__libexcept_restore_context"]
    fn restore_context_raw(regs: &Registers) -> !;
}

/// Captures the callee-saved register state of the caller and hands it to `f`.
pub fn save_context(f: extern "C" fn(&mut Registers, *mut ()), ptr: *mut ()) {
    // Safety: the assembly routine follows the C calling convention and only writes to its own
    // stack frame
    unsafe { save_context_raw(f, ptr) }
}

/// Installs the given register context, transferring control to its program counter.
///
/// # Safety
///
/// The register context must describe a valid, live stack frame. On Thumb targets the program
/// counter must carry the Thumb bit.
pub unsafe fn restore_context(regs: &Registers) -> ! {
    // Safety: ensured by the caller
    unsafe { restore_context_raw(regs) }
}
