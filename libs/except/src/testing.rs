// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synthetic frames, exception tables and type infos for tests.

use core::ffi::c_char;
use core::ptr;
use std::boxed::Box;
use std::vec::Vec;

use fallible_iterator::FallibleIterator;
use gimli::{EndianSlice, NativeEndian, constants};
use unwind::UnwindFrame;

use crate::rtti::{
    BaseClassTypeInfo, ItaniumRtti, PointerTypeInfo, RttiVtables, SiClassTypeInfo, TypeInfo,
    VmiClassTypeInfo,
};

static VTABLES: [usize; 3] = [0; 3];

pub fn vtables() -> RttiVtables {
    let base = VTABLES.as_ptr() as usize;
    RttiVtables::new(base, base + size_of::<usize>(), base + 2 * size_of::<usize>())
}

pub fn matcher() -> ItaniumRtti {
    ItaniumRtti::with_vtables(vtables())
}

fn name(s: &str) -> *const c_char {
    let mut bytes = Vec::from(s.as_bytes());
    bytes.push(0);
    Box::leak(bytes.into_boxed_slice()).as_ptr().cast()
}

pub fn class(n: &str) -> &'static TypeInfo {
    Box::leak(Box::new(TypeInfo::from_raw_parts(
        vtables().class as *const usize,
        name(n),
    )))
}

pub fn si_class(n: &str, base: &'static TypeInfo) -> &'static TypeInfo {
    let ti = Box::leak(Box::new(SiClassTypeInfo {
        base: TypeInfo::from_raw_parts(vtables().si_class as *const usize, name(n)),
        base_type: base,
    }));
    &ti.base
}

/// A class with up to four bases, given as type info and raw `offset_flags`.
pub fn vmi_class(n: &str, bases: &[(&'static TypeInfo, isize)]) -> &'static TypeInfo {
    #[repr(C)]
    struct Vmi {
        head: VmiClassTypeInfo,
        bases: [BaseClassTypeInfo; 4],
    }

    assert!(bases.len() <= 4);
    let mut array = [BaseClassTypeInfo {
        base_type: ptr::null(),
        offset_flags: 0,
    }; 4];
    for (slot, (ti, offset_flags)) in array.iter_mut().zip(bases) {
        *slot = BaseClassTypeInfo {
            base_type: *ti,
            offset_flags: *offset_flags,
        };
    }

    let ti = Box::leak(Box::new(Vmi {
        head: VmiClassTypeInfo {
            base: TypeInfo::from_raw_parts(vtables().vmi_class as *const usize, name(n)),
            flags: 0,
            base_count: bases.len() as u32,
            base_info: [],
        },
        bases: array,
    }));
    &ti.head.base
}

pub fn pointer(n: &str, flags: u32, pointee: &'static TypeInfo) -> &'static TypeInfo {
    let ti = Box::leak(Box::new(PointerTypeInfo {
        base: TypeInfo::from_raw_parts(ptr::null(), name(n)),
        flags,
        pointee,
    }));
    &ti.base
}

/// An entry of the action chain of a call site.
#[derive(Debug, Clone)]
pub enum Clause {
    /// `catch (T&)`, or `catch (...)` for `None`.
    Catch(Option<&'static TypeInfo>),
    /// A dynamic exception specification listing the permitted types.
    Filter(Vec<&'static TypeInfo>),
    Cleanup,
}

const CALL_SITE_START: u32 = 0x10;
const CALL_SITE_LEN: u32 = 0x20;
const LPAD_OFFSET: u32 = 0x80;

struct Writer(Vec<u8>);

impl Writer {
    fn uleb(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.0.push(byte);
                break;
            }
            self.0.push(byte | 0x80);
        }
    }

    fn sleb(&mut self, mut value: i64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0) {
                self.0.push(byte);
                break;
            }
            self.0.push(byte | 0x80);
        }
    }
}

/// Assembles an LSDA with one call site covering the frames ip, `None` for a call site table
/// without entries.
fn build_lsda(clauses: Option<&[Clause]>) -> EndianSlice<'static, NativeEndian> {
    let mut types: Vec<usize> = Vec::new();
    let mut index_of = |ti: Option<&'static TypeInfo>| -> u64 {
        let addr = ti.map_or(0, |ti| ptr::from_ref(ti) as usize);
        let pos = types.iter().position(|t| *t == addr).unwrap_or_else(|| {
            types.push(addr);
            types.len() - 1
        });
        pos as u64 + 1
    };

    let mut specs = Writer(Vec::new());
    let mut filters = Vec::new();
    for clause in clauses.unwrap_or_default() {
        let filter = match clause {
            Clause::Cleanup => 0,
            Clause::Catch(ti) => i64::try_from(index_of(*ti)).unwrap(),
            Clause::Filter(list) => {
                let offset = specs.0.len() as i64;
                for ti in list {
                    let idx = index_of(Some(*ti));
                    specs.uleb(idx);
                }
                specs.uleb(0);
                -(offset + 1)
            }
        };
        filters.push(filter);
    }

    let mut actions = Writer(Vec::new());
    for (i, filter) in filters.iter().enumerate() {
        actions.sleb(*filter);
        actions.sleb(if i + 1 == filters.len() { 0 } else { 1 });
    }

    let mut call_sites = Writer(Vec::new());
    if let Some(clauses) = clauses {
        let only_cleanups = clauses.iter().all(|c| matches!(c, Clause::Cleanup));
        call_sites.0.extend_from_slice(&CALL_SITE_START.to_ne_bytes());
        call_sites.0.extend_from_slice(&CALL_SITE_LEN.to_ne_bytes());
        call_sites.0.extend_from_slice(&LPAD_OFFSET.to_ne_bytes());
        call_sites.uleb(if only_cleanups { 0 } else { 1 });
    }

    let mut tail = Writer(Vec::new());
    tail.0.push(constants::DW_EH_PE_udata4.0);
    tail.uleb(call_sites.0.len() as u64);
    tail.0.extend_from_slice(&call_sites.0);
    tail.0.extend_from_slice(&actions.0);
    for entry in types.iter().rev() {
        tail.0.extend_from_slice(&entry.to_ne_bytes());
    }
    let to_table_end = tail.0.len() as u64;
    tail.0.extend_from_slice(&specs.0);

    let mut out = Writer(Vec::new());
    out.0.push(constants::DW_EH_PE_omit.0);
    out.0.push(constants::DW_EH_PE_absptr.0);
    out.uleb(to_table_end);
    out.0.extend_from_slice(&tail.0);

    EndianSlice::new(Box::leak(out.0.into_boxed_slice()), NativeEndian)
}

/// A stack frame whose position on the stack is given by its stack pointer.
#[derive(Debug, Clone)]
pub struct MockFrame {
    sp: usize,
    func: usize,
    lsda: Option<EndianSlice<'static, NativeEndian>>,
}

impl MockFrame {
    fn new(sp: usize, lsda: Option<EndianSlice<'static, NativeEndian>>) -> Self {
        Self {
            sp,
            func: sp << 8,
            lsda,
        }
    }

    /// A frame without exception table.
    pub fn plain(sp: usize) -> Self {
        Self::new(sp, None)
    }

    /// A frame that must not be unwound through.
    pub fn nothrow(sp: usize) -> Self {
        Self::new(sp, Some(build_lsda(None)))
    }

    pub fn with_clauses(sp: usize, clauses: &[Clause]) -> Self {
        Self::new(sp, Some(build_lsda(Some(clauses))))
    }

    pub fn landing_pad(&self) -> usize {
        self.func + LPAD_OFFSET as usize
    }
}

impl UnwindFrame for MockFrame {
    fn ip(&self) -> usize {
        self.func + CALL_SITE_START as usize + 4
    }

    fn sp(&self) -> usize {
        self.sp
    }

    fn symbol_address(&self) -> u64 {
        self.func as u64
    }

    fn language_specific_data(&self) -> Option<EndianSlice<'static, NativeEndian>> {
        self.lsda
    }
}

/// Walks `stack` from the innermost frame outward.
pub fn frames(
    stack: &[MockFrame],
) -> impl FallibleIterator<Item = MockFrame, Error = unwind::Error> + '_ {
    fallible_iterator::convert(stack.iter().cloned().map(Ok))
}
