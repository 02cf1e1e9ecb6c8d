// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! x86_64 specific unwinding code, mostly saving and restoring registers.

use core::{fmt, ops};

use gimli::{Register, X86_64};

// Match DWARF_FRAME_REGISTERS in libgcc
pub const MAX_REG_RULES: usize = 17;

/// The largest register number on this architecture.
pub const MAX_REG: u16 = 16;

pub const SP: Register = X86_64::RSP;
pub const RA: Register = X86_64::RA;

/// The registers a landing pad expects the exception pointer and the handler selector in
/// (`__builtin_eh_return_data_regno(0)` and `(1)`).
pub const UNWIND_DATA_REG: (Register, Register) = (X86_64::RAX, X86_64::RDX);

/// Register context when unwinding.
///
/// Indexed by DWARF register number, slot 16 holds the return address.
#[repr(C)]
#[derive(Clone, Default)]
pub struct Registers {
    /// General purpose registers
    pub gp: [usize; 17],
}

impl fmt::Debug for Registers {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fmt = fmt.debug_struct("Registers");
        for i in 0..=MAX_REG {
            fmt.field(
                X86_64::register_name(Register(i)).unwrap_or("unknown"),
                &format_args!("{:#x}", self.gp[usize::from(i)]),
            );
        }
        fmt.finish()
    }
}

impl ops::Index<Register> for Registers {
    type Output = usize;

    fn index(&self, reg: Register) -> &usize {
        match reg {
            Register(0..=16) => &self.gp[usize::from(reg.0)],
            _ => unimplemented!("register {reg:?}"),
        }
    }
}

impl ops::IndexMut<Register> for Registers {
    fn index_mut(&mut self, reg: Register) -> &mut usize {
        match reg {
            Register(0..=16) => &mut self.gp[usize::from(reg.0)],
            _ => unimplemented!("register {reg:?}"),
        }
    }
}

// Register slot `n` lives at offset `8 * n`, RSP at 0x38 and RA at 0x80.
//
// `save_context` only needs to capture callee-saved registers since everything else is dead at
// the call site anyway. `restore_context` loads everything, the landing pad receives its
// arguments in RAX and RDX.
core::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl __libexcept_save_context",
    ".hidden __libexcept_save_context",
    ".type __libexcept_save_context,@function",
    "__libexcept_save_context:",
    ".cfi_startproc",
    "sub rsp, 0x98",
    ".cfi_def_cfa_offset 0xa0",
    "mov [rsp + 0x18], rbx",
    "mov [rsp + 0x30], rbp",
    "mov [rsp + 0x60], r12",
    "mov [rsp + 0x68], r13",
    "mov [rsp + 0x70], r14",
    "mov [rsp + 0x78], r15",
    // the stack pointer of the caller once we return
    "lea rax, [rsp + 0xa0]",
    "mov [rsp + 0x38], rax",
    // and the address we return to
    "mov rax, [rsp + 0x98]",
    "mov [rsp + 0x80], rax",
    "mov rax, rdi",
    "mov rdi, rsp",
    "call rax",
    "add rsp, 0x98",
    ".cfi_def_cfa_offset 8",
    "ret",
    ".cfi_endproc",
    ".size __libexcept_save_context, . - __libexcept_save_context",
    "",
    ".p2align 4",
    ".globl __libexcept_restore_context",
    ".hidden __libexcept_restore_context",
    ".type __libexcept_restore_context,@function",
    "__libexcept_restore_context:",
    ".cfi_startproc",
    "mov rsp, [rdi + 0x38]",
    "push qword ptr [rdi + 0x80]",
    "mov rax, [rdi + 0x00]",
    "mov rdx, [rdi + 0x08]",
    "mov rcx, [rdi + 0x10]",
    "mov rbx, [rdi + 0x18]",
    "mov rsi, [rdi + 0x20]",
    "mov rbp, [rdi + 0x30]",
    "mov r8, [rdi + 0x40]",
    "mov r9, [rdi + 0x48]",
    "mov r10, [rdi + 0x50]",
    "mov r11, [rdi + 0x58]",
    "mov r12, [rdi + 0x60]",
    "mov r13, [rdi + 0x68]",
    "mov r14, [rdi + 0x70]",
    "mov r15, [rdi + 0x78]",
    "mov rdi, [rdi + 0x28]",
    "ret",
    ".cfi_endproc",
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

/// Installs the given register context, transferring control to its return address.
///
/// # Safety
///
/// The register context must describe a valid, live stack frame.
pub unsafe fn restore_context(regs: &Registers) -> ! {
    // Safety: ensured by the caller
    unsafe { restore_context_raw(regs) }
}
