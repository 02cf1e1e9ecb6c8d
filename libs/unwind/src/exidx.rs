// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Unwinding with the tables of the ARM exception handling ABI (`.ARM.exidx` and `.ARM.extab`).
//!
//! For details see:
//!  * <https://github.com/ARM-software/abi-aa/blob/main/ehabi32/ehabi32.rst>
//!
//! The table lookup and the opcode interpreter only ever touch memory through a `read_word`
//! callback, so they work the same on the host as on the target.

use core::{fmt, ops};

use gimli::Register;

use crate::{Error, Result};

/// The index entry value marking a function that must not be unwound through.
pub const EXIDX_CANTUNWIND: u32 = 1;

const SP: usize = 13;
const LR: usize = 14;
const PC: usize = 15;

/// The virtual register set the unwind opcodes operate on.
///
/// `gp` holds r0-r15 and `d` the callee-saved VFP registers d8-d15.
#[repr(C)]
#[derive(Clone, Default, PartialEq, Eq)]
pub struct VirtualRegisters {
    pub gp: [usize; 16],
    pub d: [u64; 8],
}

impl fmt::Debug for VirtualRegisters {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fmt = fmt.debug_struct("VirtualRegisters");
        for (i, value) in self.gp.iter().enumerate() {
            fmt.field(
                gimli::Arm::register_name(Register(i as u16)).unwrap_or("unknown"),
                &format_args!("{value:#x}"),
            );
        }
        fmt.field("d", &self.d);
        fmt.finish()
    }
}

impl ops::Index<Register> for VirtualRegisters {
    type Output = usize;

    fn index(&self, reg: Register) -> &usize {
        match reg {
            Register(0..=15) => &self.gp[usize::from(reg.0)],
            _ => unimplemented!("register {reg:?}"),
        }
    }
}

impl ops::IndexMut<Register> for VirtualRegisters {
    fn index_mut(&mut self, reg: Register) -> &mut usize {
        match reg {
            Register(0..=15) => &mut self.gp[usize::from(reg.0)],
            _ => unimplemented!("register {reg:?}"),
        }
    }
}

/// Decodes a 31-bit place-relative offset stored at `place`.
#[allow(
    clippy::cast_possible_wrap,
    reason = "the shift pair sign-extends bit 30 on purpose"
)]
pub fn prel31(place: usize, word: u32) -> usize {
    let offset = ((word << 1) as i32) >> 1;
    place.wrapping_add_signed(offset as isize)
}

/// A `.ARM.exidx` section.
#[derive(Debug, Clone, Copy)]
pub struct IndexTable {
    start: usize,
    end: usize,
}

/// The unwind description of a single function.
#[derive(Debug, Clone, Copy)]
pub struct UnwindEntry {
    /// Start address of the function.
    pub function: usize,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Copy)]
pub enum EntryKind {
    /// The function must not be unwound through.
    CantUnwind,
    /// One of the ABI defined personality routines `__aeabi_unwind_cpp_pr0` to `pr2`.
    Compact { index: u8, opcodes: Opcodes },
    /// A language specific personality routine, e.g. `__gxx_personality_v0`, followed by its
    /// language specific data.
    Generic {
        personality: usize,
        opcodes: Opcodes,
        lsda: usize,
    },
}

impl IndexTable {
    /// Creates a table from the address range of the section, each entry is two words.
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    fn len(&self) -> usize {
        self.end.saturating_sub(self.start) / 8
    }

    /// Finds the entry of the function containing `pc`.
    ///
    /// Entries are sorted by function address and every entry covers everything up to the next
    /// one, so this is the last entry whose function starts at or below `pc`.
    pub fn find_entry(
        &self,
        pc: usize,
        read_word: &mut impl FnMut(usize) -> Result<u32>,
    ) -> Result<Option<UnwindEntry>> {
        let mut low = 0;
        let mut high = self.len();
        while low < high {
            let mid = low + (high - low) / 2;
            if self.function_at(mid, read_word)? <= pc {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        let Some(idx) = low.checked_sub(1) else {
            return Ok(None);
        };

        let place = self.start + idx * 8;
        let function = self.function_at(idx, read_word)?;
        let word = read_word(place + 4)?;

        let kind = if word == EXIDX_CANTUNWIND {
            EntryKind::CantUnwind
        } else if word & 0x8000_0000 != 0 {
            // inline compact model, only personality routine 0 fits into a single word
            if (word >> 24) & 0x0f != 0 {
                return Err(Error::MalformedUnwindTable);
            }
            EntryKind::Compact {
                index: 0,
                opcodes: Opcodes::new(word, 3, 0, 0),
            }
        } else {
            decode_table_entry(prel31(place + 4, word), read_word)?
        };

        Ok(Some(UnwindEntry { function, kind }))
    }

    fn function_at(
        &self,
        idx: usize,
        read_word: &mut impl FnMut(usize) -> Result<u32>,
    ) -> Result<usize> {
        let place = self.start + idx * 8;
        Ok(prel31(place, read_word(place)?) & !1)
    }
}

fn decode_table_entry(
    addr: usize,
    read_word: &mut impl FnMut(usize) -> Result<u32>,
) -> Result<EntryKind> {
    let word = read_word(addr)?;

    if word & 0x8000_0000 != 0 {
        let index = ((word >> 24) & 0x0f) as u8;
        let opcodes = match index {
            0 => Opcodes::new(word, 3, addr + 4, 0),
            1 | 2 => Opcodes::new(word, 2, addr + 4, ((word >> 16) & 0xff) as u8),
            _ => return Err(Error::MalformedUnwindTable),
        };
        Ok(EntryKind::Compact { index, opcodes })
    } else {
        let personality = prel31(addr, word);
        let first = read_word(addr + 4)?;
        let words = (first >> 24) as u8;
        Ok(EntryKind::Generic {
            personality,
            opcodes: Opcodes::new(first, 3, addr + 8, words),
            lsda: addr + 8 + usize::from(words) * 4,
        })
    }
}

/// A stream of unwind opcode bytes, most significant byte of each word first.
#[derive(Debug, Clone, Copy)]
pub struct Opcodes {
    word: u32,
    bytes_left: u8,
    next: usize,
    words_left: u8,
}

impl Opcodes {
    /// `bytes` is the number of opcode bytes in the low end of `word`, `words` the number of full
    /// words following at `next`.
    pub const fn new(word: u32, bytes: u8, next: usize, words: u8) -> Self {
        Self {
            word,
            bytes_left: bytes,
            next,
            words_left: words,
        }
    }

    fn next_byte(
        &mut self,
        read_word: &mut impl FnMut(usize) -> Result<u32>,
    ) -> Result<Option<u8>> {
        if self.bytes_left == 0 {
            if self.words_left == 0 {
                return Ok(None);
            }
            self.word = read_word(self.next)?;
            self.next += 4;
            self.words_left -= 1;
            self.bytes_left = 4;
        }

        self.bytes_left -= 1;
        Ok(Some((self.word >> (8 * self.bytes_left)) as u8))
    }

    fn operand(&mut self, read_word: &mut impl FnMut(usize) -> Result<u32>, op: u8) -> Result<u8> {
        self.next_byte(read_word)?
            .ok_or(Error::UnsupportedOpcode(op))
    }
}

/// Executes the unwind opcodes, transforming `vrs` from the state inside the function into the
/// state of its caller.
pub fn execute(
    mut opcodes: Opcodes,
    vrs: &mut VirtualRegisters,
    read_word: &mut impl FnMut(usize) -> Result<u32>,
) -> Result<()> {
    let mut pc_set = false;

    while let Some(op) = opcodes.next_byte(read_word)? {
        match op {
            // vsp = vsp + (xxxxxx << 2) + 4
            0x00..=0x3f => {
                vrs.gp[SP] = vrs.gp[SP].wrapping_add((usize::from(op & 0x3f) << 2) + 4);
            }
            // vsp = vsp - (xxxxxx << 2) - 4
            0x40..=0x7f => {
                vrs.gp[SP] = vrs.gp[SP].wrapping_sub((usize::from(op & 0x3f) << 2) + 4);
            }
            0x80..=0x8f => {
                let op2 = opcodes.operand(read_word, op)?;
                let mask = (u16::from(op & 0x0f) << 8) | u16::from(op2);
                if mask == 0 {
                    return Err(Error::RefuseToUnwind);
                }
                pop_core(vrs, mask << 4, read_word)?;
                pc_set |= mask & (1 << 11) != 0;
            }
            0x90..=0x9f => {
                let reg = usize::from(op & 0x0f);
                if reg == SP || reg == PC {
                    return Err(Error::UnsupportedOpcode(op));
                }
                vrs.gp[SP] = vrs.gp[reg];
            }
            // pop r4-r[4+nnn]
            0xa0..=0xa7 => pop_core(vrs, range_mask(4, op & 0x07), read_word)?,
            // pop r4-r[4+nnn], r14
            0xa8..=0xaf => pop_core(vrs, range_mask(4, op & 0x07) | (1 << LR), read_word)?,
            // finish
            0xb0 => break,
            0xb1 => {
                let mask = opcodes.operand(read_word, op)?;
                if mask == 0 || mask & 0xf0 != 0 {
                    return Err(Error::UnsupportedOpcode(op));
                }
                pop_core(vrs, u16::from(mask), read_word)?;
            }
            // vsp = vsp + 0x204 + (uleb128 << 2)
            0xb2 => {
                let mut value = 0usize;
                let mut shift = 0;
                loop {
                    let byte = opcodes.operand(read_word, op)?;
                    if shift >= usize::BITS {
                        return Err(Error::UnsupportedOpcode(op));
                    }
                    value |= usize::from(byte & 0x7f) << shift;
                    shift += 7;
                    if byte & 0x80 == 0 {
                        break;
                    }
                }
                vrs.gp[SP] = vrs.gp[SP].wrapping_add(0x204 + (value << 2));
            }
            // pop VFP double registers saved by FSTMFDX
            0xb3 => {
                let op2 = opcodes.operand(read_word, op)?;
                pop_vfp(vrs, op2 >> 4, op2 & 0x0f, read_word)?;
                vrs.gp[SP] = vrs.gp[SP].wrapping_add(4);
            }
            // pop VFP double registers d8-d[8+nnn] saved by FSTMFDX
            0xb8..=0xbf => {
                pop_vfp(vrs, 8, op & 0x07, read_word)?;
                vrs.gp[SP] = vrs.gp[SP].wrapping_add(4);
            }
            // pop VFP double registers d[16+ssss]-d[16+ssss+cccc] saved by VPUSH
            0xc8 => {
                let op2 = opcodes.operand(read_word, op)?;
                pop_vfp(vrs, 16 + (op2 >> 4), op2 & 0x0f, read_word)?;
            }
            // pop VFP double registers d[ssss]-d[ssss+cccc] saved by VPUSH
            0xc9 => {
                let op2 = opcodes.operand(read_word, op)?;
                pop_vfp(vrs, op2 >> 4, op2 & 0x0f, read_word)?;
            }
            // pop VFP double registers d8-d[8+nnn] saved by VPUSH
            0xd0..=0xd7 => pop_vfp(vrs, 8, op & 0x07, read_word)?,
            // spare and Intel Wireless MMX encodings
            _ => return Err(Error::UnsupportedOpcode(op)),
        }
    }

    if !pc_set {
        vrs.gp[PC] = vrs.gp[LR];
    }

    Ok(())
}

fn range_mask(first: u8, count: u8) -> u16 {
    let bits = (1u16 << (count + 1)) - 1;
    bits << first
}

/// Pops the core registers in `mask` (bit n is rn), lowest register from the lowest address.
fn pop_core(
    vrs: &mut VirtualRegisters,
    mask: u16,
    read_word: &mut impl FnMut(usize) -> Result<u32>,
) -> Result<()> {
    let mut vsp = vrs.gp[SP];
    let mut new_sp = None;

    for reg in 0..16 {
        if mask & (1 << reg) == 0 {
            continue;
        }
        let value = read_word(vsp)? as usize;
        vsp = vsp.wrapping_add(4);
        if reg == SP {
            new_sp = Some(value);
        } else {
            vrs.gp[reg] = value;
        }
    }

    // a popped stack pointer overrides the one adjusted by popping
    vrs.gp[SP] = new_sp.unwrap_or(vsp);
    Ok(())
}

/// Pops `count + 1` double registers starting at `first`, keeping the callee-saved d8-d15.
fn pop_vfp(
    vrs: &mut VirtualRegisters,
    first: u8,
    count: u8,
    read_word: &mut impl FnMut(usize) -> Result<u32>,
) -> Result<()> {
    let last = usize::from(first) + usize::from(count);
    if last > 31 {
        return Err(Error::MalformedUnwindTable);
    }

    let mut vsp = vrs.gp[SP];
    for reg in usize::from(first)..=last {
        if (8..16).contains(&reg) {
            let low = u64::from(read_word(vsp)?);
            let high = u64::from(read_word(vsp.wrapping_add(4))?);
            vrs.d[reg - 8] = (high << 32) | low;
        }
        vsp = vsp.wrapping_add(8);
    }
    vrs.gp[SP] = vsp;
    Ok(())
}

#[cfg(target_arch = "arm")]
pub use frame::{Frame, FrameIter, register_exidx};

#[cfg(target_arch = "arm")]
mod frame {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use fallible_iterator::FallibleIterator;
    use gimli::{EndianSlice, NativeEndian, Register};

    use super::{EntryKind, IndexTable, VirtualRegisters, execute};
    use crate::utils::reader_at;
    use crate::{Error, Result, UnwindFrame, arch};

    static EXIDX_START: AtomicUsize = AtomicUsize::new(0);
    static EXIDX_END: AtomicUsize = AtomicUsize::new(0);

    /// Registers the `.ARM.exidx` section of the running program.
    ///
    /// Bare metal targets locate the section through the `__exidx_start` and `__exidx_end` linker
    /// symbols instead.
    pub fn register_exidx(section: &'static [u8]) {
        let start = section.as_ptr() as usize;
        EXIDX_START.store(0, Ordering::Release);
        EXIDX_END.store(start + section.len(), Ordering::Release);
        EXIDX_START.store(start, Ordering::Release);
    }

    fn index_table() -> Result<IndexTable> {
        #[cfg(target_os = "none")]
        {
            unsafe extern "C" {
                static __exidx_start: u8;
                static __exidx_end: u8;
            }

            // Safety: only the addresses of the linker provided symbols are taken
            let (start, end) = unsafe {
                (
                    &raw const __exidx_start as usize,
                    &raw const __exidx_end as usize,
                )
            };
            if start != end {
                return Ok(IndexTable::new(start, end));
            }
        }

        let start = EXIDX_START.load(Ordering::Acquire);
        if start == 0 {
            return Err(Error::MissingTables);
        }
        Ok(IndexTable::new(start, EXIDX_END.load(Ordering::Acquire)))
    }

    fn read_word(addr: usize) -> Result<u32> {
        // Safety: we have to trust the unwind tables here
        Ok(unsafe { (addr as *const u32).read() })
    }

    /// A frame in a stack, described by its `.ARM.exidx` entry.
    #[derive(Debug)]
    pub struct Frame {
        regs: VirtualRegisters,
        function: usize,
        lsda: Option<usize>,
    }

    impl Frame {
        pub fn set_reg(&mut self, reg: Register, value: usize) {
            self.regs[reg] = value;
        }

        /// Sets the value of this frames instruction pointer, keeping the instruction set state.
        pub fn set_ip(&mut self, value: usize) {
            let thumb = self.regs[arch::PC] & 1;
            self.regs[arch::PC] = value | thumb;
        }

        pub fn adjust_stack_for_args(&mut self) {}

        /// Restore control to this frame.
        ///
        /// # Safety
        ///
        /// This installs the register context of the frame without any checking.
        #[inline(never)]
        pub unsafe fn restore(self) -> ! {
            // Safety: caller has to ensure this is safe
            unsafe { arch::restore_context(&self.regs) }
        }
    }

    impl UnwindFrame for Frame {
        fn ip(&self) -> usize {
            self.regs[arch::PC]
        }

        fn sp(&self) -> usize {
            self.regs[arch::SP]
        }

        fn symbol_address(&self) -> u64 {
            self.function as u64
        }

        fn language_specific_data(&self) -> Option<EndianSlice<'static, NativeEndian>> {
            // Safety: we have to trust the unwind tables here
            self.lsda.map(|lsda| unsafe { reader_at(lsda as u64) })
        }

        fn lookup_ip(&self) -> usize {
            (self.ip() & !1).wrapping_sub(1)
        }
    }

    /// An iterator over frames on the stack.
    #[derive(Clone)]
    pub struct FrameIter {
        regs: VirtualRegisters,
    }

    impl FrameIter {
        /// Construct a new `FrameIter` that will walk the stack beginning at the provided context.
        pub fn from_registers(mut regs: VirtualRegisters, ip: usize) -> Self {
            regs[arch::PC] = ip;
            Self { regs }
        }
    }

    impl FallibleIterator for FrameIter {
        type Item = Frame;
        type Error = Error;

        fn next(&mut self) -> Result<Option<Self::Item>> {
            let pc = self.regs[arch::PC];
            if pc == 0 {
                return Ok(None);
            }

            let lookup = (pc & !1).wrapping_sub(1);
            let Some(entry) = index_table()?.find_entry(lookup, &mut read_word)? else {
                return Ok(None);
            };

            let (opcodes, lsda) = match entry.kind {
                EntryKind::CantUnwind => return Ok(None),
                EntryKind::Compact { opcodes, .. } => (opcodes, None),
                EntryKind::Generic { opcodes, lsda, .. } => (opcodes, Some(lsda)),
            };

            let frame = Frame {
                regs: self.regs.clone(),
                function: entry.function,
                lsda,
            };

            execute(opcodes, &mut self.regs, &mut read_word)?;
            // a return address of the frame itself means the tables describe no caller
            if self.regs[arch::PC] == pc {
                self.regs[arch::PC] = 0;
            }

            Ok(Some(frame))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::vec::Vec;

    use proptest::prelude::*;

    use super::*;

    /// Simulated target memory.
    #[derive(Default)]
    struct Memory(BTreeMap<usize, u32>);

    impl Memory {
        fn push(&mut self, addr: usize, words: &[u32]) {
            for (i, word) in words.iter().enumerate() {
                self.0.insert(addr + i * 4, *word);
            }
        }

        fn reader(&self) -> impl FnMut(usize) -> Result<u32> + '_ {
            move |addr| self.0.get(&addr).copied().ok_or(Error::NoUnwindInfo(addr))
        }
    }

    fn compact(bytes: [u8; 3]) -> Opcodes {
        Opcodes::new(u32::from_be_bytes([0x80, bytes[0], bytes[1], bytes[2]]), 3, 0, 0)
    }

    fn run(opcodes: Opcodes, vrs: &mut VirtualRegisters, memory: &Memory) -> Result<()> {
        execute(opcodes, vrs, &mut memory.reader())
    }

    #[test]
    fn prel31_sign_extends() {
        assert_eq!(prel31(0x1000, 0x10), 0x1010);
        assert_eq!(prel31(0x1000, 0x7fff_fff0), 0x0ff0);
        // bit 31 is not part of the offset
        assert_eq!(prel31(0x1000, 0x8000_0010), 0x1010);
    }

    #[test]
    fn pop_r4_r5_and_lr() {
        let mut memory = Memory::default();
        memory.push(0x8000, &[0x44, 0x55, 0xabcd]);

        let mut vrs = VirtualRegisters::default();
        vrs.gp[SP] = 0x8000;
        // pop {r4, r5, r14}, finish
        run(compact([0xa9, 0xb0, 0xb0]), &mut vrs, &memory).unwrap();

        assert_eq!(vrs.gp[4], 0x44);
        assert_eq!(vrs.gp[5], 0x55);
        assert_eq!(vrs.gp[LR], 0xabcd);
        assert_eq!(vrs.gp[PC], 0xabcd);
        assert_eq!(vrs.gp[SP], 0x800c);
    }

    #[test]
    fn vsp_adjustments() {
        let memory = Memory::default();
        let mut vrs = VirtualRegisters::default();
        vrs.gp[SP] = 0x1000;
        vrs.gp[LR] = 0x42;

        // vsp += 16, vsp -= 4
        run(compact([0x03, 0x40, 0xb0]), &mut vrs, &memory).unwrap();
        assert_eq!(vrs.gp[SP], 0x100c);

        // vsp += 0x204 + (2 << 2)
        run(compact([0xb2, 0x02, 0xb0]), &mut vrs, &memory).unwrap();
        assert_eq!(vrs.gp[SP], 0x100c + 0x20c);
        assert_eq!(vrs.gp[PC], 0x42);
    }

    #[test]
    fn vsp_from_register() {
        let memory = Memory::default();
        let mut vrs = VirtualRegisters::default();
        vrs.gp[7] = 0x2000;
        run(compact([0x97, 0xb0, 0xb0]), &mut vrs, &memory).unwrap();
        assert_eq!(vrs.gp[SP], 0x2000);

        assert!(matches!(
            run(compact([0x9d, 0xb0, 0xb0]), &mut vrs, &memory),
            Err(Error::UnsupportedOpcode(0x9d))
        ));
    }

    #[test]
    fn pop_by_mask_including_pc_and_sp() {
        let mut memory = Memory::default();
        // r4, r13, r15
        memory.push(0x100, &[0x4, 0x3000, 0x5000]);

        let mut vrs = VirtualRegisters::default();
        vrs.gp[SP] = 0x100;
        vrs.gp[LR] = 0x1;
        // 1000iiii iiiiiiii with bits for r4, r13 and r15
        let mask: u16 = (1 << 0) | (1 << 9) | (1 << 11);
        let op = 0x80 | (mask >> 8) as u8;
        run(compact([op, mask as u8, 0xb0]), &mut vrs, &memory).unwrap();

        assert_eq!(vrs.gp[4], 0x4);
        assert_eq!(vrs.gp[SP], 0x3000);
        assert_eq!(vrs.gp[PC], 0x5000);
    }

    #[test]
    fn refuse_to_unwind() {
        let memory = Memory::default();
        let mut vrs = VirtualRegisters::default();
        assert!(matches!(
            run(compact([0x80, 0x00, 0xb0]), &mut vrs, &memory),
            Err(Error::RefuseToUnwind)
        ));
    }

    #[test]
    fn pop_low_registers() {
        let mut memory = Memory::default();
        memory.push(0x40, &[0xa, 0xc]);
        let mut vrs = VirtualRegisters::default();
        vrs.gp[SP] = 0x40;
        // pop {r1, r3}
        run(compact([0xb1, 0x0a, 0xb0]), &mut vrs, &memory).unwrap();
        assert_eq!(vrs.gp[1], 0xa);
        assert_eq!(vrs.gp[3], 0xc);
        assert_eq!(vrs.gp[SP], 0x48);

        assert!(matches!(
            run(compact([0xb1, 0x00, 0xb0]), &mut vrs, &memory),
            Err(Error::UnsupportedOpcode(0xb1))
        ));
    }

    #[test]
    fn vfp_pops() {
        let mut memory = Memory::default();
        // d8, d9 as low/high word pairs
        memory.push(0x200, &[0x1, 0x2, 0x3, 0x4]);

        let mut vrs = VirtualRegisters::default();
        vrs.gp[SP] = 0x200;
        // vpop {d8-d9}
        run(compact([0xd1, 0xb0, 0xb0]), &mut vrs, &memory).unwrap();
        assert_eq!(vrs.d[0], 0x2_0000_0001);
        assert_eq!(vrs.d[1], 0x4_0000_0003);
        assert_eq!(vrs.gp[SP], 0x210);

        // FSTMFDX form of the same, one extra pad word
        vrs.gp[SP] = 0x200;
        run(compact([0xb9, 0xb0, 0xb0]), &mut vrs, &memory).unwrap();
        assert_eq!(vrs.gp[SP], 0x214);

        // d16-d17 are popped but not kept
        let mut vrs = VirtualRegisters::default();
        vrs.gp[SP] = 0x200;
        run(compact([0xc8, 0x01, 0xb0]), &mut vrs, &memory).unwrap();
        assert_eq!(vrs.gp[SP], 0x210);
        assert_eq!(vrs.d, [0; 8]);
    }

    #[test]
    fn spare_encodings_are_rejected() {
        let memory = Memory::default();
        for op in [0xb4, 0xc0, 0xc6, 0xca, 0xd8, 0xff] {
            let mut vrs = VirtualRegisters::default();
            assert!(matches!(
                run(compact([op, 0xb0, 0xb0]), &mut vrs, &memory),
                Err(Error::UnsupportedOpcode(x)) if x == op
            ));
        }
    }

    #[test]
    fn index_lookup() {
        let mut memory = Memory::default();
        let table = 0x1_0000;
        let extab = 0x2_0000;

        // three functions at 0x100, 0x200 and 0x300
        let entry = |place: usize, target: usize| (target.wrapping_sub(place) as u32) & 0x7fff_ffff;
        memory.push(
            table,
            &[
                entry(table, 0x100),
                0x80a9_b0b0,
                entry(table + 8, 0x200),
                EXIDX_CANTUNWIND,
                entry(table + 16, 0x300),
                entry(table + 20, extab),
            ],
        );
        // generic model: personality, one extra word of opcodes, then the LSDA
        memory.push(
            extab,
            &[
                entry(extab, 0x9000),
                0x01a8_b0b0,
                0xb0b0_b0b0,
                0xdead_beef,
            ],
        );

        let index = IndexTable::new(table, table + 24);
        let mut read = memory.reader();

        assert!(index.find_entry(0xff, &mut read).unwrap().is_none());

        let first = index.find_entry(0x1ff, &mut read).unwrap().unwrap();
        assert_eq!(first.function, 0x100);
        assert!(matches!(first.kind, EntryKind::Compact { index: 0, .. }));

        let second = index.find_entry(0x200, &mut read).unwrap().unwrap();
        assert_eq!(second.function, 0x200);
        assert!(matches!(second.kind, EntryKind::CantUnwind));

        let third = index.find_entry(0x5000, &mut read).unwrap().unwrap();
        assert_eq!(third.function, 0x300);
        let EntryKind::Generic {
            personality,
            opcodes,
            lsda,
        } = third.kind
        else {
            panic!("expected a generic entry");
        };
        assert_eq!(personality, 0x9000);
        assert_eq!(lsda, extab + 12);

        drop(read);
        memory.push(0x7000, &[0x77, 0x1234]);
        let mut vrs = VirtualRegisters::default();
        vrs.gp[SP] = 0x7000;
        run(opcodes, &mut vrs, &memory).unwrap();
        assert_eq!(vrs.gp[4], 0x77);
        assert_eq!(vrs.gp[PC], 0x1234);
    }

    #[test]
    fn personality_routine_one_counts_words() {
        let mut memory = Memory::default();
        // pr1 with one additional word: pop {r4, r14}
        memory.push(0x400, &[0x8101_a8b0, 0xb0b0_b0b0]);
        let Ok(EntryKind::Compact { index: 1, opcodes }) =
            decode_table_entry(0x400, &mut memory.reader())
        else {
            panic!("expected a compact entry");
        };

        memory.push(0x600, &[0x4, 0xe]);
        let mut vrs = VirtualRegisters::default();
        vrs.gp[SP] = 0x600;
        run(opcodes, &mut vrs, &memory).unwrap();
        assert_eq!(vrs.gp[LR], 0xe);
        assert_eq!(vrs.gp[SP], 0x608);
    }

    proptest! {
        #[test]
        fn vsp_increment_is_exact(x in 0u8..0x40) {
            let memory = Memory::default();
            let mut vrs = VirtualRegisters::default();
            vrs.gp[SP] = 0x1000;
            run(compact([x, 0xb0, 0xb0]), &mut vrs, &memory).unwrap();
            prop_assert_eq!(vrs.gp[SP], 0x1000 + (usize::from(x) << 2) + 4);
        }

        #[test]
        fn lookup_picks_covering_function(pc in 0x100usize..0x1000) {
            let mut memory = Memory::default();
            let table = 0x1_0000;
            let starts: Vec<usize> = (0..8).map(|i| 0x100 + i * 0x200).collect();
            for (i, start) in starts.iter().enumerate() {
                let place = table + i * 8;
                memory.push(
                    place,
                    &[(start.wrapping_sub(place) as u32) & 0x7fff_ffff, EXIDX_CANTUNWIND],
                );
            }
            let index = IndexTable::new(table, table + starts.len() * 8);
            let entry = index.find_entry(pc, &mut memory.reader()).unwrap().unwrap();
            let expected = starts.iter().rev().find(|start| **start <= pc).unwrap();
            prop_assert_eq!(entry.function, *expected);
        }
    }
}
