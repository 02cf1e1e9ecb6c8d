// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicUsize, Ordering};

use gimli::{BaseAddresses, EhFrame, EndianSlice, NativeEndian};

use crate::{Error, Result};

static EH_FRAME_START: AtomicUsize = AtomicUsize::new(0);
static EH_FRAME_LEN: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone)]
pub struct EhInfo {
    /// A set of base addresses used for relative addressing.
    pub bases: BaseAddresses,
    /// The parsed `.eh_frame` containing the call frame information.
    pub eh_frame: EhFrame<EndianSlice<'static, NativeEndian>>,
}

/// Registers the `.eh_frame` section of the running program.
///
/// Bare metal targets locate the section through the `__eh_frame_start` and `__eh_frame_end`
/// linker symbols instead, hosted programs have to call this before the first throw.
pub fn register_eh_frame(section: &'static [u8]) {
    EH_FRAME_START.store(0, Ordering::Release);
    EH_FRAME_LEN.store(section.len(), Ordering::Release);
    EH_FRAME_START.store(section.as_ptr() as usize, Ordering::Release);
    log::trace!(
        "registered .eh_frame at {:#x} ({} bytes)",
        section.as_ptr() as usize,
        section.len()
    );
}

fn eh_frame_section() -> Option<&'static [u8]> {
    #[cfg(target_os = "none")]
    {
        unsafe extern "C" {
            static __eh_frame_start: u8;
            static __eh_frame_end: u8;
        }

        // Safety: only the addresses of the linker provided symbols are taken
        let (start, end) = unsafe {
            (
                &raw const __eh_frame_start as usize,
                &raw const __eh_frame_end as usize,
            )
        };
        if end > start {
            // Safety: the linker script places the symbols around the section
            return Some(unsafe { core::slice::from_raw_parts(start as *const u8, end - start) });
        }
    }

    let start = EH_FRAME_START.load(Ordering::Acquire);
    if start == 0 {
        return None;
    }
    let len = EH_FRAME_LEN.load(Ordering::Acquire);
    // Safety: `register_eh_frame` only accepts `'static` slices
    Some(unsafe { core::slice::from_raw_parts(start as *const u8, len) })
}

pub fn obtain_eh_info() -> Result<EhInfo> {
    let section = eh_frame_section().ok_or(Error::MissingTables)?;

    let bases = BaseAddresses::default().set_eh_frame(section.as_ptr() as u64);
    let mut eh_frame = EhFrame::new(section, NativeEndian);
    eh_frame.set_address_size(size_of::<usize>() as u8);

    Ok(EhInfo { bases, eh_frame })
}
