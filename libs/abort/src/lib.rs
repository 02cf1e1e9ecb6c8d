// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(test), no_std)]

/// Terminates the current execution in an abnormal fashion. This function will never return.
///
/// This is the fallback of the fallback: it runs when the configured abort hook returned (or when
/// termination was re-entered) and there is nothing sensible left to do. When `std` is available
/// this takes the form of `std::process::abort`. On bare-metal targets it executes a permanently
/// undefined instruction, which traps into the HardFault / illegal-instruction handler, and if
/// that handler returns the core is parked in a wait loop forever.
///
/// # Breakpoint support
///
/// The symbol `libexcept_abort` will never be mangled so you can safely put a breakpoint on it
/// as a means to catch the target just before it stops for good.
#[unsafe(export_name = "libexcept_abort")]
#[inline(never)]
#[cold]
pub fn abort() -> ! {
    cfg_if::cfg_if! {
        if #[cfg(not(target_os = "none"))] {
            extern crate std;
            std::process::abort();
        } else if #[cfg(target_arch = "arm")] {
            // Safety: `udf` only raises a fault, the loop afterwards never touches memory
            unsafe {
                core::arch::asm!(
                    "udf #254",
                    "2:",
                    "wfi",
                    "b 2b",
                    options(noreturn, nomem, nostack)
                );
            }
        } else if #[cfg(any(target_arch = "riscv64", target_arch = "riscv32"))] {
            // Safety: `unimp` only raises an illegal instruction exception
            unsafe {
                core::arch::asm!(
                    "unimp",
                    "2:",
                    "wfi",
                    "j 2b",
                    options(noreturn, nomem, nostack)
                );
            }
        } else if #[cfg(target_arch = "x86_64")] {
            // Safety: `ud2` raises #UD, afterwards we disable interrupts and halt forever
            unsafe {
                core::arch::asm!(
                    "ud2",
                    "cli",
                    "2:",
                    "hlt",
                    "jmp 2b",
                    options(noreturn, nomem, nostack)
                );
            }
        } else {
            compile_error!("unsupported target architecture")
        }
    }
}
