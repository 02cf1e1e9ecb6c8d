// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! This module implements parsing of GCC-style Language-Specific Data Area (LSDA)
//! and determining the appropriate `EhAction` for a given IP.
//!
//! For details see:
//!  * <https://refspecs.linuxfoundation.org/LSB_3.0.0/LSB-PDA/LSB-PDA/ehframechpt.html>
//!  * <https://refspecs.linuxfoundation.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/dwarfext.html>
//!  * <https://itanium-cxx-abi.github.io/cxx-abi/exceptions.pdf>
//!  * <https://www.airs.com/blog/archives/460>
//!  * <https://www.airs.com/blog/archives/464>
//!
//! A reference implementation may be found in the GCC source tree
//! (`<root>/libstdc++-v3/libsupc++/eh_personality.cc` as of this writing).
//!
//! Unlike the Rust personality the C++ one needs the full action chain of a call site: every
//! action record carries a type filter that has to be matched against the thrown type.

use fallible_iterator::FallibleIterator;
use gimli::{EndianSlice, NativeEndian, Pointer, Reader, constants};

use crate::utils::{deref_pointer, reader_at};
use crate::{Error, Result, UnwindFrame};

/// How type table entries and exception specification lists are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTableFlavor {
    /// Entries use the encoding from the LSDA header, specification lists hold ULEB128 type
    /// table indices.
    Dwarf,
    /// The ARM exception handling ABI ignores the header encoding.
    ///
    /// Entries are `R_ARM_TARGET2` relocated words and specification lists hold such words
    /// directly instead of indices.
    ArmEhabi { ttype_encoding: constants::DwEhPe },
}

impl TypeTableFlavor {
    /// The flavor used by the compilers for the current target.
    #[cfg(not(target_arch = "arm"))]
    pub const NATIVE: Self = Self::Dwarf;

    /// The flavor used by the compilers for the current target.
    ///
    /// `R_ARM_TARGET2` is resolved as `R_ARM_REL32` on bare metal and as `R_ARM_GOT_PREL` on
    /// Linux.
    #[cfg(target_arch = "arm")]
    pub const NATIVE: Self = Self::ArmEhabi {
        ttype_encoding: if cfg!(target_os = "linux") {
            constants::DwEhPe(
                constants::DW_EH_PE_pcrel.0
                    | constants::DW_EH_PE_sdata4.0
                    | constants::DW_EH_PE_indirect.0,
            )
        } else {
            constants::DwEhPe(constants::DW_EH_PE_pcrel.0 | constants::DW_EH_PE_sdata4.0)
        },
    };
}

/// Base addresses used to resolve relative pointer encodings.
#[derive(Debug, Clone, Copy, Default)]
struct Bases {
    func: u64,
    text: Option<u64>,
    data: Option<u64>,
}

/// A parsed LSDA header.
#[derive(Debug, Clone, Copy)]
pub struct Lsda {
    bases: Bases,
    flavor: TypeTableFlavor,
    lpad_base: u64,
    ttype_encoding: constants::DwEhPe,
    /// Address one past the end of the type table, zero if there is none.
    ttype_end: u64,
    call_site_encoding: constants::DwEhPe,
    call_sites: EndianSlice<'static, NativeEndian>,
    /// Address of the first byte of the action table.
    action_table: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum EhAction {
    /// The call site has no landing pad, unwinding continues.
    None,
    /// The instruction pointer is not covered by the call site table.
    Terminate,
    /// The landing pad only runs cleanups.
    Cleanup(usize),
    /// The landing pad has a chain of actions that have to be matched against the exception.
    Actions { lpad: usize, chain: ActionChain },
}

#[derive(Debug, Clone, Copy)]
pub enum Action {
    /// Run the cleanup code of the landing pad.
    Cleanup,
    /// A `catch` clause. A `type_info` of zero means catch-all.
    Catch { selector: i64, type_info: usize },
    /// A dynamic exception specification.
    Filter { selector: i64, spec: SpecList },
}

impl Lsda {
    /// Parses the LSDA header for `frame` using the native type table flavor.
    pub fn parse<F: UnwindFrame>(
        frame: &F,
        lsda: EndianSlice<'static, NativeEndian>,
    ) -> Result<Self> {
        Self::parse_with_flavor(frame, lsda, TypeTableFlavor::NATIVE)
    }

    pub fn parse_with_flavor<F: UnwindFrame>(
        frame: &F,
        mut reader: EndianSlice<'static, NativeEndian>,
        flavor: TypeTableFlavor,
    ) -> Result<Self> {
        let bases = Bases {
            func: frame.symbol_address(),
            text: frame.text_rel_base(),
            data: frame.data_rel_base(),
        };

        let start_encoding = parse_pointer_encoding(&mut reader)?;
        let lpad_base = if start_encoding.is_absent() {
            bases.func
        } else {
            read_encoded_pointer(&mut reader, start_encoding, &bases)?
        };

        let mut ttype_encoding = parse_pointer_encoding(&mut reader)?;
        let ttype_end = if ttype_encoding.is_absent() {
            0
        } else {
            let offset = reader.read_uleb128()?;
            // the offset is relative to the end of the offset field itself
            address_of(&reader).wrapping_add(offset)
        };

        if let TypeTableFlavor::ArmEhabi {
            ttype_encoding: arm_encoding,
        } = flavor
        {
            if !ttype_encoding.is_absent() {
                ttype_encoding = arm_encoding;
            }
        }

        let call_site_encoding = parse_pointer_encoding(&mut reader)?;
        let call_site_table_length =
            usize::try_from(reader.read_uleb128()?).map_err(|_| Error::MalformedLsda)?;
        let call_sites = reader.split(call_site_table_length)?;

        Ok(Self {
            bases,
            flavor,
            lpad_base,
            ttype_encoding,
            ttype_end,
            call_site_encoding,
            call_sites,
            action_table: address_of(&reader),
        })
    }

    /// Finds the call site covering `ip` and returns what has to be done for it.
    pub fn find_action(&self, ip: u64) -> Result<EhAction> {
        let func_start = self.bases.func;
        let mut call_sites = self.call_sites;

        while !call_sites.is_empty() {
            // these are offsets rather than pointers;
            let cs_start = read_encoded_offset(&mut call_sites, self.call_site_encoding)?;
            let cs_len = read_encoded_offset(&mut call_sites, self.call_site_encoding)?;
            let cs_lpad = read_encoded_offset(&mut call_sites, self.call_site_encoding)?;
            let cs_action_entry = call_sites.read_uleb128()?;

            // Callsite table is sorted by cs_start, so if we've passed the ip, we
            // may stop searching.
            if ip < func_start.wrapping_add(cs_start) {
                break;
            }

            if ip < func_start.wrapping_add(cs_start).wrapping_add(cs_len) {
                if cs_lpad == 0 {
                    return Ok(EhAction::None);
                }

                let lpad = usize::try_from(self.lpad_base.wrapping_add(cs_lpad))
                    .map_err(|_| Error::MalformedLsda)?;

                if cs_action_entry == 0 {
                    return Ok(EhAction::Cleanup(lpad));
                }

                return Ok(EhAction::Actions {
                    lpad,
                    chain: ActionChain {
                        lsda: *self,
                        next: Some(self.action_table.wrapping_add(cs_action_entry - 1)),
                    },
                });
            }
        }

        // Ip is not present in the table. This indicates a nounwind call.
        Ok(EhAction::Terminate)
    }

    /// Returns the `type_info` address stored at the positive filter `index`, zero for the
    /// catch-all entry.
    pub fn type_info(&self, index: u64) -> Result<usize> {
        if self.ttype_encoding.is_absent() || index == 0 {
            return Err(Error::MalformedLsda);
        }

        let size = encoded_size(self.ttype_encoding)?;
        let offset = index.checked_mul(size).ok_or(Error::MalformedLsda)?;
        let addr = self
            .ttype_end
            .checked_sub(offset)
            .ok_or(Error::MalformedLsda)?;

        // Safety: we have to trust the LSDA here
        let mut reader = unsafe { reader_at(addr) };
        let type_info = read_encoded_pointer(&mut reader, self.ttype_encoding, &self.bases)?;
        usize::try_from(type_info).map_err(|_| Error::MalformedLsda)
    }

    /// Returns the exception specification list referenced by the negative `filter`.
    pub fn spec_list(&self, filter: i64) -> Result<SpecList> {
        if self.ttype_encoding.is_absent() || filter >= 0 {
            return Err(Error::MalformedLsda);
        }

        let index = filter.unsigned_abs() - 1;
        let offset = match self.flavor {
            TypeTableFlavor::Dwarf => index,
            TypeTableFlavor::ArmEhabi { .. } => index.checked_mul(4).ok_or(Error::MalformedLsda)?,
        };

        Ok(SpecList {
            lsda: *self,
            next: self.ttype_end.wrapping_add(offset),
            done: false,
        })
    }
}

/// Iterator over the actions of a call site, in the order they have to be tested.
#[derive(Debug, Clone, Copy)]
pub struct ActionChain {
    lsda: Lsda,
    next: Option<u64>,
}

impl FallibleIterator for ActionChain {
    type Item = Action;
    type Error = Error;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        let Some(record) = self.next.take() else {
            return Ok(None);
        };

        // Safety: we have to trust the LSDA here
        let mut reader = unsafe { reader_at(record) };
        let filter = reader.read_sleb128()?;
        // the displacement is relative to the start of the displacement field
        let displacement_field = address_of(&reader);
        let displacement = reader.read_sleb128()?;

        if displacement != 0 {
            self.next = Some(displacement_field.wrapping_add_signed(displacement));
        }

        let action = match filter {
            0 => Action::Cleanup,
            1.. => Action::Catch {
                selector: filter,
                type_info: self.lsda.type_info(filter.unsigned_abs())?,
            },
            _ => Action::Filter {
                selector: filter,
                spec: self.lsda.spec_list(filter)?,
            },
        };

        Ok(Some(action))
    }
}

/// Iterator over the `type_info` addresses of an exception specification.
///
/// An empty list is the `throw()` specification that permits nothing.
#[derive(Debug, Clone, Copy)]
pub struct SpecList {
    lsda: Lsda,
    next: u64,
    done: bool,
}

impl FallibleIterator for SpecList {
    type Item = usize;
    type Error = Error;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        if self.done {
            return Ok(None);
        }

        // Safety: we have to trust the LSDA here
        let mut reader = unsafe { reader_at(self.next) };

        let type_info = match self.lsda.flavor {
            TypeTableFlavor::Dwarf => {
                let index = reader.read_uleb128()?;
                self.next = address_of(&reader);
                if index == 0 {
                    None
                } else {
                    Some(self.lsda.type_info(index)?)
                }
            }
            TypeTableFlavor::ArmEhabi { .. } => {
                let word = reader.read_u32()?;
                if word == 0 {
                    None
                } else {
                    // Safety: we have to trust the LSDA here
                    let mut reader = unsafe { reader_at(self.next) };
                    self.next = self.next.wrapping_add(4);
                    let type_info = read_encoded_pointer(
                        &mut reader,
                        self.lsda.ttype_encoding,
                        &self.lsda.bases,
                    )?;
                    Some(usize::try_from(type_info).map_err(|_| Error::MalformedLsda)?)
                }
            }
        };

        if type_info.is_none() {
            self.done = true;
        }

        Ok(type_info)
    }
}

fn address_of(reader: &EndianSlice<'static, NativeEndian>) -> u64 {
    reader.slice().as_ptr() as u64
}

fn parse_pointer_encoding(
    input: &mut EndianSlice<'static, NativeEndian>,
) -> gimli::Result<constants::DwEhPe> {
    let eh_pe = input.read_u8()?;
    let eh_pe = constants::DwEhPe(eh_pe);

    if eh_pe.is_valid_encoding() {
        Ok(eh_pe)
    } else {
        Err(gimli::Error::UnknownPointerEncoding(eh_pe))
    }
}

fn encoded_size(encoding: constants::DwEhPe) -> Result<u64> {
    match encoding.format() {
        constants::DW_EH_PE_absptr => Ok(size_of::<usize>() as u64),
        constants::DW_EH_PE_udata2 | constants::DW_EH_PE_sdata2 => Ok(2),
        constants::DW_EH_PE_udata4 | constants::DW_EH_PE_sdata4 => Ok(4),
        constants::DW_EH_PE_udata8 | constants::DW_EH_PE_sdata8 => Ok(8),
        _ => Err(Error::MalformedLsda),
    }
}

fn read_encoded_pointer(
    input: &mut EndianSlice<'static, NativeEndian>,
    encoding: constants::DwEhPe,
    bases: &Bases,
) -> gimli::Result<u64> {
    if encoding == constants::DW_EH_PE_omit {
        return Err(gimli::Error::CannotParseOmitPointerEncoding);
    }

    // relative to address of the encoded value, despite the name
    let pcrel = address_of(input);

    let offset = read_encoded_offset(input, encoding)?;
    // a zero value is a null pointer regardless of the application
    if offset == 0 {
        return Ok(0);
    }

    let base = match encoding.application() {
        constants::DW_EH_PE_absptr => 0,
        constants::DW_EH_PE_pcrel => pcrel,
        constants::DW_EH_PE_funcrel => {
            if bases.func == 0 {
                return Err(gimli::Error::UnsupportedPointerEncoding);
            }
            bases.func
        }
        constants::DW_EH_PE_textrel => bases
            .text
            .ok_or(gimli::Error::UnsupportedPointerEncoding)?,
        constants::DW_EH_PE_datarel => bases
            .data
            .ok_or(gimli::Error::UnsupportedPointerEncoding)?,
        _ => return Err(gimli::Error::UnsupportedPointerEncoding),
    };

    let address = base.wrapping_add(offset);

    let pointer = if encoding.is_indirect() {
        Pointer::Indirect(address)
    } else {
        Pointer::Direct(address)
    };

    // Safety: we have to trust the DWARF info here
    Ok(unsafe { deref_pointer(pointer) })
}

#[allow(
    clippy::cast_sign_loss,
    reason = "numeric casts are checked and behave as expected"
)]
fn read_encoded_offset(
    input: &mut EndianSlice<'static, NativeEndian>,
    encoding: constants::DwEhPe,
) -> gimli::Result<u64> {
    if encoding == constants::DW_EH_PE_omit {
        return Err(gimli::Error::CannotParseOmitPointerEncoding);
    }

    match encoding.format() {
        constants::DW_EH_PE_absptr => input.read_address(size_of::<usize>() as u8),
        constants::DW_EH_PE_uleb128 => input.read_uleb128(),
        constants::DW_EH_PE_udata2 => input.read_u16().map(u64::from),
        constants::DW_EH_PE_udata4 => input.read_u32().map(u64::from),
        constants::DW_EH_PE_udata8 => input.read_u64(),
        constants::DW_EH_PE_sleb128 => input.read_sleb128().map(|a| a as u64),
        constants::DW_EH_PE_sdata2 => input.read_i16().map(|a| a as u64),
        constants::DW_EH_PE_sdata4 => input.read_i32().map(|a| a as u64),
        constants::DW_EH_PE_sdata8 => input.read_i64().map(|a| a as u64),
        _ => Err(gimli::Error::UnknownPointerEncoding(encoding)),
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;
    use std::vec::Vec;

    use super::*;

    struct TestFrame {
        func: u64,
    }

    impl UnwindFrame for TestFrame {
        fn ip(&self) -> usize {
            0
        }
        fn sp(&self) -> usize {
            0
        }
        fn symbol_address(&self) -> u64 {
            self.func
        }
        fn language_specific_data(&self) -> Option<EndianSlice<'static, NativeEndian>> {
            None
        }
    }

    const FUNC: u64 = 0x1000;

    fn leak(bytes: Vec<u8>) -> EndianSlice<'static, NativeEndian> {
        EndianSlice::new(Box::leak(bytes.into_boxed_slice()), NativeEndian)
    }

    fn uleb(out: &mut Vec<u8>, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    fn sleb(out: &mut Vec<u8>, mut value: i64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    struct CallSite {
        start: u32,
        len: u32,
        lpad: u32,
        action: u64,
    }

    /// Assembles an LSDA with udata4 call sites and an absptr type table.
    fn build(
        call_sites: &[CallSite],
        actions: &[u8],
        type_table: &[u64],
        spec_lists: &[u8],
    ) -> EndianSlice<'static, NativeEndian> {
        let mut table = Vec::new();
        for cs in call_sites {
            table.extend_from_slice(&cs.start.to_ne_bytes());
            table.extend_from_slice(&cs.len.to_ne_bytes());
            table.extend_from_slice(&cs.lpad.to_ne_bytes());
            uleb(&mut table, cs.action);
        }

        let mut tail = Vec::new();
        tail.push(constants::DW_EH_PE_udata4.0);
        uleb(&mut tail, table.len() as u64);
        tail.extend_from_slice(&table);
        tail.extend_from_slice(actions);
        for entry in type_table.iter().rev() {
            tail.extend_from_slice(&entry.to_ne_bytes());
        }
        tail.extend_from_slice(spec_lists);

        let mut out = Vec::new();
        out.push(constants::DW_EH_PE_omit.0);
        if type_table.is_empty() {
            out.push(constants::DW_EH_PE_omit.0);
        } else {
            out.push(constants::DW_EH_PE_absptr.0);
            // offset from after the offset field to the end of the type table
            let to_end = (tail.len() - spec_lists.len()) as u64;
            // single byte uleb for the sizes used in these tests
            assert!(to_end < 0x80);
            out.push(to_end as u8);
        }
        out.extend_from_slice(&tail);
        leak(out)
    }

    fn actions(records: &[(i64, i64)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(filter, displacement) in records {
            sleb(&mut out, filter);
            sleb(&mut out, displacement);
        }
        out
    }

    fn chain(action: EhAction) -> Vec<Action> {
        let EhAction::Actions { chain, .. } = action else {
            panic!("expected actions, got {action:?}");
        };
        chain.collect().unwrap()
    }

    #[test]
    fn call_site_lookup() {
        let lsda = build(
            &[
                CallSite { start: 0x10, len: 0x10, lpad: 0, action: 0 },
                CallSite { start: 0x20, len: 0x08, lpad: 0x80, action: 0 },
                CallSite { start: 0x30, len: 0x10, lpad: 0x90, action: 1 },
            ],
            &actions(&[(0, 0)]),
            &[],
            &[],
        );
        let lsda = Lsda::parse_with_flavor(&TestFrame { func: FUNC }, lsda, TypeTableFlavor::Dwarf)
            .unwrap();

        assert!(matches!(lsda.find_action(FUNC + 0x4).unwrap(), EhAction::Terminate));
        assert!(matches!(lsda.find_action(FUNC + 0x18).unwrap(), EhAction::None));
        assert!(matches!(
            lsda.find_action(FUNC + 0x20).unwrap(),
            EhAction::Cleanup(lpad) if lpad as u64 == FUNC + 0x80
        ));
        assert!(matches!(lsda.find_action(FUNC + 0x28).unwrap(), EhAction::Terminate));
        assert!(matches!(
            chain(lsda.find_action(FUNC + 0x3f).unwrap()).as_slice(),
            [Action::Cleanup]
        ));
        assert!(matches!(lsda.find_action(FUNC + 0x40).unwrap(), EhAction::Terminate));
    }

    #[test]
    fn catch_chain_in_order() {
        // catch (A) { } catch (...) { }
        let lsda = build(
            &[CallSite { start: 0, len: 0x10, lpad: 0x40, action: 1 }],
            // record 1 at offset 0, record 2 at offset 2; the displacement field of record 1
            // sits at offset 1
            &actions(&[(1, 1), (2, 0)]),
            &[0xaaaa, 0],
            &[],
        );
        let lsda = Lsda::parse_with_flavor(&TestFrame { func: FUNC }, lsda, TypeTableFlavor::Dwarf)
            .unwrap();

        let action = lsda.find_action(FUNC + 4).unwrap();
        let EhAction::Actions { lpad, .. } = action else {
            panic!("expected actions");
        };
        assert_eq!(lpad as u64, FUNC + 0x40);

        match chain(action).as_slice() {
            [
                Action::Catch { selector: 1, type_info: 0xaaaa },
                Action::Catch { selector: 2, type_info: 0 },
            ] => {}
            other => panic!("unexpected chain {other:?}"),
        }
    }

    #[test]
    fn exception_specification_lists() {
        // spec list 1 at offset 0 holds {1, 2}, spec list 2 at offset 3 is empty
        let mut specs = Vec::new();
        uleb(&mut specs, 1);
        uleb(&mut specs, 2);
        uleb(&mut specs, 0);
        uleb(&mut specs, 0);

        let lsda = build(
            &[
                CallSite { start: 0, len: 0x10, lpad: 0x40, action: 1 },
                CallSite { start: 0x10, len: 0x10, lpad: 0x50, action: 3 },
            ],
            &actions(&[(-1, 0), (-4, 0)]),
            &[0x1111, 0x2222],
            &specs,
        );
        let lsda = Lsda::parse_with_flavor(&TestFrame { func: FUNC }, lsda, TypeTableFlavor::Dwarf)
            .unwrap();

        let spec = match chain(lsda.find_action(FUNC).unwrap()).as_slice() {
            [Action::Filter { selector: -1, spec }] => *spec,
            other => panic!("expected a filter, got {other:?}"),
        };
        assert_eq!(spec.collect::<Vec<_>>().unwrap(), [0x1111, 0x2222]);

        let spec = match chain(lsda.find_action(FUNC + 0x10).unwrap()).as_slice() {
            [Action::Filter { selector: -4, spec }] => *spec,
            other => panic!("expected a filter, got {other:?}"),
        };
        assert_eq!(spec.count().unwrap(), 0);
    }

    #[test]
    fn arm_word_indexed_lists() {
        // type table entry 1 and a spec list with one entry, both pcrel words
        let mut bytes = Vec::new();
        bytes.push(constants::DW_EH_PE_omit.0);
        // header says absptr, the flavor overrides it
        bytes.push(constants::DW_EH_PE_absptr.0);
        // call site table: udata4, one entry; actions: one filter record; ttype: one word
        let mut table = Vec::new();
        table.extend_from_slice(&0u32.to_ne_bytes());
        table.extend_from_slice(&0x10u32.to_ne_bytes());
        table.extend_from_slice(&0x40u32.to_ne_bytes());
        uleb(&mut table, 1);
        let acts = actions(&[(-1, 0)]);
        let to_end = 1 + 1 + table.len() + acts.len() + 4;
        bytes.push(to_end as u8);
        bytes.push(constants::DW_EH_PE_udata4.0);
        bytes.push(table.len() as u8);
        bytes.extend_from_slice(&table);
        bytes.extend_from_slice(&acts);
        bytes.extend_from_slice(&0x100i32.to_ne_bytes());
        // spec list directly after the type table end: one word, then the terminator
        bytes.extend_from_slice(&0x200i32.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());

        let slice = leak(bytes);
        let base = slice.slice().as_ptr() as u64;
        let ttype_entry = base + 3 + to_end as u64 - 4;
        let spec_entry = ttype_entry + 4;

        let lsda = Lsda::parse_with_flavor(
            &TestFrame { func: FUNC },
            slice,
            TypeTableFlavor::ArmEhabi {
                ttype_encoding: constants::DwEhPe(
                    constants::DW_EH_PE_pcrel.0 | constants::DW_EH_PE_sdata4.0,
                ),
            },
        )
        .unwrap();

        assert_eq!(lsda.type_info(1).unwrap() as u64, ttype_entry + 0x100);

        let spec = match chain(lsda.find_action(FUNC).unwrap()).as_slice() {
            [Action::Filter { spec, .. }] => *spec,
            other => panic!("expected a filter, got {other:?}"),
        };
        assert_eq!(
            spec.map(|t| Ok(t as u64)).collect::<Vec<_>>().unwrap(),
            [spec_entry + 0x200]
        );
    }

    #[test]
    fn unknown_pointer_encoding() {
        let lsda = leak(std::vec![0x0f, 0xff, 0x01, 0x00]);
        assert!(matches!(
            Lsda::parse_with_flavor(&TestFrame { func: FUNC }, lsda, TypeTableFlavor::Dwarf),
            Err(Error::Gimli(gimli::Error::UnknownPointerEncoding(_)))
        ));
    }
}
