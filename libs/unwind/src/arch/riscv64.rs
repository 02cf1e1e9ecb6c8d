// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! RISC-V 64 specific unwinding code, mostly saving and restoring registers.

use core::{fmt, ops};

use gimli::{Register, RiscV};

// Match DWARF_FRAME_REGISTERS in libgcc
pub const MAX_REG_RULES: usize = 65;

/// The largest register number on this architecture.
pub const MAX_REG: u16 = 63;

pub const SP: Register = RiscV::SP;
pub const RA: Register = RiscV::RA;

/// The registers a landing pad expects the exception pointer and the handler selector in.
pub const UNWIND_DATA_REG: (Register, Register) = (RiscV::A0, RiscV::A1);

/// Register context when unwinding.
///
/// `gp` holds x0-x31 and `fp` holds f0-f31, matching the DWARF register numbering (0-31 and
/// 32-63). The floating point half is only saved and restored when the target has the D extension.
#[repr(C)]
#[derive(Clone)]
pub struct Registers {
    pub gp: [usize; 32],
    pub fp: [usize; 32],
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            gp: [0; 32],
            fp: [0; 32],
        }
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fmt = fmt.debug_struct("Registers");
        for i in 0..32u16 {
            fmt.field(
                RiscV::register_name(Register(i)).unwrap_or("unknown"),
                &format_args!("{:#x}", self.gp[usize::from(i)]),
            );
        }
        fmt.finish_non_exhaustive()
    }
}

impl ops::Index<Register> for Registers {
    type Output = usize;

    fn index(&self, reg: Register) -> &usize {
        match reg {
            Register(0..=31) => &self.gp[usize::from(reg.0)],
            Register(32..=63) => &self.fp[usize::from(reg.0 - 32)],
            _ => unimplemented!("register {reg:?}"),
        }
    }
}

impl ops::IndexMut<Register> for Registers {
    fn index_mut(&mut self, reg: Register) -> &mut usize {
        match reg {
            Register(0..=31) => &mut self.gp[usize::from(reg.0)],
            Register(32..=63) => &mut self.fp[usize::from(reg.0 - 32)],
            _ => unimplemented!("register {reg:?}"),
        }
    }
}

macro_rules! save_gp {
    ($reg:ident => $ptr:ident[$pos:expr]) => {
        concat!("sd ", stringify!($reg), ", 8*", $pos, "(", stringify!($ptr), ")")
    };
}

macro_rules! restore_gp {
    ($reg:ident <= $ptr:ident[$pos:expr]) => {
        concat!("ld ", stringify!($reg), ", 8*", $pos, "(", stringify!($ptr), ")")
    };
}

#[cfg(target_feature = "d")]
macro_rules! save_fp {
    ($reg:ident => $ptr:ident[$pos:expr]) => {
        concat!("fsd ", stringify!($reg), ", 8*", $pos, "(", stringify!($ptr), ")")
    };
}

#[cfg(target_feature = "d")]
macro_rules! restore_fp {
    ($reg:ident <= $ptr:ident[$pos:expr]) => {
        concat!("fld ", stringify!($reg), ", 8*", $pos, "(", stringify!($ptr), ")")
    };
}

#[cfg(target_feature = "d")]
macro_rules! save_callee_saved_fp {
    () => {
        concat!(
            save_fp!(fs0 => sp[40]), "\n",
            save_fp!(fs1 => sp[41]), "\n",
            save_fp!(fs2 => sp[50]), "\n",
            save_fp!(fs3 => sp[51]), "\n",
            save_fp!(fs4 => sp[52]), "\n",
            save_fp!(fs5 => sp[53]), "\n",
            save_fp!(fs6 => sp[54]), "\n",
            save_fp!(fs7 => sp[55]), "\n",
            save_fp!(fs8 => sp[56]), "\n",
            save_fp!(fs9 => sp[57]), "\n",
            save_fp!(fs10 => sp[58]), "\n",
            save_fp!(fs11 => sp[59]),
        )
    };
}

#[cfg(not(target_feature = "d"))]
macro_rules! save_callee_saved_fp {
    () => {
        ""
    };
}

#[cfg(target_feature = "d")]
macro_rules! restore_all_fp {
    () => {
        concat!(
            restore_fp!(fs0 <= a0[40]), "\n",
            restore_fp!(fs1 <= a0[41]), "\n",
            restore_fp!(fs2 <= a0[50]), "\n",
            restore_fp!(fs3 <= a0[51]), "\n",
            restore_fp!(fs4 <= a0[52]), "\n",
            restore_fp!(fs5 <= a0[53]), "\n",
            restore_fp!(fs6 <= a0[54]), "\n",
            restore_fp!(fs7 <= a0[55]), "\n",
            restore_fp!(fs8 <= a0[56]), "\n",
            restore_fp!(fs9 <= a0[57]), "\n",
            restore_fp!(fs10 <= a0[58]), "\n",
            restore_fp!(fs11 <= a0[59]),
        )
    };
}

#[cfg(not(target_feature = "d"))]
macro_rules! restore_all_fp {
    () => {
        ""
    };
}

// The context is 0x200 bytes, the 16 bytes above it hold the return address of `save_context`.
core::arch::global_asm!(
    ".text",
    ".p2align 2",
    ".globl __libexcept_save_context",
    ".hidden __libexcept_save_context",
    ".type __libexcept_save_context,@function",
    "__libexcept_save_context:",
    ".cfi_startproc",
    "addi sp, sp, -0x210",
    ".cfi_def_cfa_offset 0x210",
    "sd ra, 0x200(sp)",
    ".cfi_offset ra, -0x10",
    save_gp!(ra => sp[1]),
    "addi t0, sp, 0x210",
    save_gp!(t0 => sp[2]),
    save_gp!(gp => sp[3]),
    save_gp!(tp => sp[4]),
    save_gp!(s0 => sp[8]),
    save_gp!(s1 => sp[9]),
    save_gp!(s2 => sp[18]),
    save_gp!(s3 => sp[19]),
    save_gp!(s4 => sp[20]),
    save_gp!(s5 => sp[21]),
    save_gp!(s6 => sp[22]),
    save_gp!(s7 => sp[23]),
    save_gp!(s8 => sp[24]),
    save_gp!(s9 => sp[25]),
    save_gp!(s10 => sp[26]),
    save_gp!(s11 => sp[27]),
    save_callee_saved_fp!(),
    "mv t0, a0",
    "mv a0, sp",
    "jalr t0",
    "ld ra, 0x200(sp)",
    "addi sp, sp, 0x210",
    ".cfi_def_cfa_offset 0",
    "ret",
    ".cfi_endproc",
    ".size __libexcept_save_context, . - __libexcept_save_context",
    "",
    ".p2align 2",
    ".globl __libexcept_restore_context",
    ".hidden __libexcept_restore_context",
    ".type __libexcept_restore_context,@function",
    "__libexcept_restore_context:",
    restore_all_fp!(),
    restore_gp!(ra <= a0[1]),
    restore_gp!(sp <= a0[2]),
    restore_gp!(gp <= a0[3]),
    restore_gp!(tp <= a0[4]),
    restore_gp!(t0 <= a0[5]),
    restore_gp!(t1 <= a0[6]),
    restore_gp!(t2 <= a0[7]),
    restore_gp!(s0 <= a0[8]),
    restore_gp!(s1 <= a0[9]),
    restore_gp!(a1 <= a0[11]),
    restore_gp!(a2 <= a0[12]),
    restore_gp!(a3 <= a0[13]),
    restore_gp!(a4 <= a0[14]),
    restore_gp!(a5 <= a0[15]),
    restore_gp!(a6 <= a0[16]),
    restore_gp!(a7 <= a0[17]),
    restore_gp!(s2 <= a0[18]),
    restore_gp!(s3 <= a0[19]),
    restore_gp!(s4 <= a0[20]),
    restore_gp!(s5 <= a0[21]),
    restore_gp!(s6 <= a0[22]),
    restore_gp!(s7 <= a0[23]),
    restore_gp!(s8 <= a0[24]),
    restore_gp!(s9 <= a0[25]),
    restore_gp!(s10 <= a0[26]),
    restore_gp!(s11 <= a0[27]),
    restore_gp!(t3 <= a0[28]),
    restore_gp!(t4 <= a0[29]),
    restore_gp!(t5 <= a0[30]),
    restore_gp!(t6 <= a0[31]),
    restore_gp!(a0 <= a0[10]),
    "ret",
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
