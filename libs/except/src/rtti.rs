// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Matching thrown objects against `catch` clauses using the Itanium C++ RTTI layout.
//!
//! The compiler emits a `std::type_info` object for every thrown and caught type. Its first word
//! points into the vtable of one of the `__cxxabiv1` type info classes, which tells us the layout
//! of the rest of the object:
//!
//! - `__class_type_info` for classes without bases
//! - `__si_class_type_info` for classes with a single, public, non-virtual base at offset zero
//! - `__vmi_class_type_info` for everything else
//! - `__pointer_type_info` for pointers
//!
//! Pointer types are recognised by their mangled name (`P<pointee>`), class types need the
//! addresses of the vtables to tell their kind apart. Without them only exact matches are found.

use core::ffi::{CStr, c_char};
use core::ptr;

/// The `std::type_info` object.
#[repr(C)]
#[derive(Debug)]
pub struct TypeInfo {
    vtable: *const usize,
    name: *const c_char,
}

#[repr(C)]
#[derive(Debug)]
pub struct SiClassTypeInfo {
    pub base: TypeInfo,
    pub base_type: *const TypeInfo,
}

#[repr(C)]
#[derive(Debug)]
pub struct VmiClassTypeInfo {
    pub base: TypeInfo,
    pub flags: u32,
    pub base_count: u32,
    pub base_info: [BaseClassTypeInfo; 0],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BaseClassTypeInfo {
    pub base_type: *const TypeInfo,
    pub offset_flags: isize,
}

impl BaseClassTypeInfo {
    pub const VIRTUAL: isize = 0x1;
    pub const PUBLIC: isize = 0x2;
    pub const OFFSET_SHIFT: u32 = 8;

    fn is_virtual(&self) -> bool {
        self.offset_flags & Self::VIRTUAL != 0
    }

    fn is_public(&self) -> bool {
        self.offset_flags & Self::PUBLIC != 0
    }

    fn offset(&self) -> isize {
        self.offset_flags >> Self::OFFSET_SHIFT
    }
}

/// `__pbase_type_info`, the common layout of pointer type infos.
#[repr(C)]
#[derive(Debug)]
pub struct PointerTypeInfo {
    pub base: TypeInfo,
    pub flags: u32,
    pub pointee: *const TypeInfo,
}

impl PointerTypeInfo {
    /// `const`, `volatile` and `restrict` qualifiers of the pointee.
    pub const QUALIFIER_MASK: u32 = 0x7;
}

impl TypeInfo {
    pub const fn from_raw_parts(vtable: *const usize, name: *const c_char) -> Self {
        Self { vtable, name }
    }

    /// The mangled name of the type.
    pub fn name(&self) -> &CStr {
        // Safety: type info names are NUL terminated strings emitted by the compiler
        unsafe { CStr::from_ptr(self.name) }
    }

    /// Whether `self` and `other` describe the same type.
    ///
    /// The same type can have several type info objects when it is used in more than one shared
    /// object, so names are compared too. Names starting with `*` belong to types with internal
    /// linkage and are only equal to themselves.
    pub fn same_type(&self, other: &TypeInfo) -> bool {
        if ptr::eq(self, other) || self.name == other.name {
            return true;
        }
        let name = self.name().to_bytes();
        name.first() != Some(&b'*') && name == other.name().to_bytes()
    }

    fn mangled(&self) -> &[u8] {
        let name = self.name().to_bytes();
        name.strip_prefix(b"*").unwrap_or(name)
    }

    fn is_pointer(&self) -> bool {
        self.mangled().first() == Some(&b'P')
    }

    fn is_nullptr(&self) -> bool {
        self.mangled() == b"Dn"
    }

    fn is_void(&self) -> bool {
        self.mangled() == b"v"
    }

    fn is_function(&self) -> bool {
        self.mangled().first() == Some(&b'F')
    }
}

/// Addresses type info vtable pointers are compared against, the vtable symbol plus two words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttiVtables {
    pub class: usize,
    pub si_class: usize,
    pub vmi_class: usize,
}

#[cfg(any(target_os = "none", feature = "cxxabi-rtti"))]
unsafe extern "C" {
    #[link_name = "_ZTVN10__cxxabiv117__class_type_infoE"]
    static CLASS_TYPE_INFO_VTABLE: u8;
    #[link_name = "_ZTVN10__cxxabiv120__si_class_type_infoE"]
    static SI_CLASS_TYPE_INFO_VTABLE: u8;
    #[link_name = "_ZTVN10__cxxabiv121__vmi_class_type_infoE"]
    static VMI_CLASS_TYPE_INFO_VTABLE: u8;
}

impl RttiVtables {
    pub const fn new(class: usize, si_class: usize, vmi_class: usize) -> Self {
        Self {
            class,
            si_class,
            vmi_class,
        }
    }

    /// The vtables of the C++ runtime linked into the program.
    #[cfg(any(target_os = "none", feature = "cxxabi-rtti"))]
    pub fn native() -> Option<Self> {
        // the vtable pointer stored in a type info skips the offset-to-top and RTTI words
        let skip = 2 * size_of::<usize>();
        // Safety: only the addresses of the symbols are taken
        unsafe {
            Some(Self::new(
                (&raw const CLASS_TYPE_INFO_VTABLE as usize) + skip,
                (&raw const SI_CLASS_TYPE_INFO_VTABLE as usize) + skip,
                (&raw const VMI_CLASS_TYPE_INFO_VTABLE as usize) + skip,
            ))
        }
    }

    #[cfg(not(any(target_os = "none", feature = "cxxabi-rtti")))]
    pub fn native() -> Option<Self> {
        None
    }
}

/// Decides whether a `catch` clause accepts a thrown object.
pub trait CatchMatcher {
    /// Returns the pointer the handler receives from `__cxa_begin_catch` if a handler for
    /// `catch` accepts an object of type `thrown`.
    ///
    /// # Safety
    ///
    /// `object` must point to a live object of type `thrown`, and all type infos must be valid.
    unsafe fn matches(&self, thrown: &TypeInfo, catch: &TypeInfo, object: *mut u8)
    -> Option<*mut u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Found {
    None,
    One(*mut u8),
    Ambiguous,
}

impl Found {
    fn merge(self, other: Found) -> Found {
        match (self, other) {
            (Found::None, found) | (found, Found::None) => found,
            (Found::One(a), Found::One(b)) if a == b => Found::One(a),
            _ => Found::Ambiguous,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassKind {
    Plain,
    Single,
    Multiple,
    Unknown,
}

#[derive(Debug, Default)]
pub struct ItaniumRtti {
    vtables: Option<RttiVtables>,
}

impl ItaniumRtti {
    /// A matcher using the vtables of the linked C++ runtime.
    pub const fn new() -> Self {
        Self { vtables: None }
    }

    pub const fn with_vtables(vtables: RttiVtables) -> Self {
        Self {
            vtables: Some(vtables),
        }
    }

    fn vtables(&self) -> Option<RttiVtables> {
        self.vtables.or_else(RttiVtables::native)
    }

    fn class_kind(&self, ti: &TypeInfo) -> ClassKind {
        let Some(vtables) = self.vtables() else {
            return ClassKind::Unknown;
        };
        let vtable = ti.vtable as usize;
        if vtable == vtables.si_class {
            ClassKind::Single
        } else if vtable == vtables.vmi_class {
            ClassKind::Multiple
        } else if vtable == vtables.class {
            ClassKind::Plain
        } else {
            ClassKind::Unknown
        }
    }

    /// Searches the public bases of `derived` for `target`, adjusting `object` along the way.
    ///
    /// # Safety
    ///
    /// `object` must be null or point to an object of type `derived`.
    unsafe fn find_base(&self, derived: &TypeInfo, target: &TypeInfo, object: *mut u8) -> Found {
        if derived.same_type(target) {
            return Found::One(object);
        }

        match self.class_kind(derived) {
            ClassKind::Single => {
                // Safety: the vtable identifies the layout
                let si = unsafe { &*ptr::from_ref(derived).cast::<SiClassTypeInfo>() };
                // Safety: emitted by the compiler
                unsafe { self.find_base(&*si.base_type, target, object) }
            }
            ClassKind::Multiple => {
                // Safety: the vtable identifies the layout
                let vmi = unsafe { &*ptr::from_ref(derived).cast::<VmiClassTypeInfo>() };
                // Safety: the base array trails the struct
                let bases = unsafe {
                    core::slice::from_raw_parts(vmi.base_info.as_ptr(), vmi.base_count as usize)
                };

                let mut found = Found::None;
                for base in bases.iter().filter(|base| base.is_public()) {
                    // Safety: `object` is an object of type `derived`
                    let sub = unsafe { base_subobject(object, base) };
                    // Safety: emitted by the compiler
                    let res = unsafe { self.find_base(&*base.base_type, target, sub) };
                    found = found.merge(res);
                    if found == Found::Ambiguous {
                        break;
                    }
                }
                found
            }
            ClassKind::Plain | ClassKind::Unknown => Found::None,
        }
    }

    /// # Safety
    ///
    /// `object` must be null or point to an object of the pointee type of `thrown`.
    unsafe fn match_pointer(
        &self,
        thrown: &PointerTypeInfo,
        catch: &PointerTypeInfo,
        object: *mut u8,
    ) -> Option<*mut u8> {
        let thrown_quals = thrown.flags & PointerTypeInfo::QUALIFIER_MASK;
        let catch_quals = catch.flags & PointerTypeInfo::QUALIFIER_MASK;
        // a conversion may add qualifiers but never drop them
        if thrown_quals & !catch_quals != 0 {
            return None;
        }

        // Safety: emitted by the compiler
        let (thrown_pointee, catch_pointee) = unsafe { (&*thrown.pointee, &*catch.pointee) };

        if thrown_pointee.same_type(catch_pointee) {
            return Some(object);
        }
        if catch_pointee.is_void() {
            return (!thrown_pointee.is_function()).then_some(object);
        }

        // Safety: ensured by the caller
        match unsafe { self.find_base(thrown_pointee, catch_pointee, object) } {
            Found::One(adjusted) => Some(adjusted),
            Found::None | Found::Ambiguous => None,
        }
    }
}

impl CatchMatcher for ItaniumRtti {
    unsafe fn matches(
        &self,
        thrown: &TypeInfo,
        catch: &TypeInfo,
        object: *mut u8,
    ) -> Option<*mut u8> {
        if thrown.is_pointer() || thrown.is_nullptr() {
            // handlers for pointers receive the pointer value itself
            // Safety: the thrown object is a pointer
            let value = unsafe { object.cast::<*mut u8>().read() };

            if thrown.same_type(catch) {
                return Some(value);
            }
            if thrown.is_nullptr() {
                return catch.is_pointer().then_some(ptr::null_mut());
            }
            if !catch.is_pointer() {
                return None;
            }

            // Safety: both names identify the layout as a pointer type info
            let (thrown, catch) = unsafe {
                (
                    &*ptr::from_ref(thrown).cast::<PointerTypeInfo>(),
                    &*ptr::from_ref(catch).cast::<PointerTypeInfo>(),
                )
            };
            // Safety: `value` points to the pointee type of `thrown` or is null
            return unsafe { self.match_pointer(thrown, catch, value) };
        }

        // Safety: ensured by the caller
        match unsafe { self.find_base(thrown, catch, object) } {
            Found::One(adjusted) => Some(adjusted),
            Found::None => None,
            Found::Ambiguous => {
                log::debug!(
                    "{:?} is an ambiguous base of {:?}",
                    catch.name(),
                    thrown.name()
                );
                None
            }
        }
    }
}

/// Returns the address of the `base` subobject of `object`.
///
/// # Safety
///
/// `object` must be null or point to an object whose type info lists `base`.
unsafe fn base_subobject(object: *mut u8, base: &BaseClassTypeInfo) -> *mut u8 {
    if object.is_null() {
        return object;
    }

    let offset = if base.is_virtual() {
        // the offset names the vtable slot holding the actual offset of the virtual base
        // Safety: ensured by the caller, classes with virtual bases have a vtable pointer
        unsafe {
            let vtable = object.cast::<*const u8>().read();
            vtable.offset(base.offset()).cast::<isize>().read()
        }
    } else {
        base.offset()
    };

    object.wrapping_offset(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{class, matcher, pointer, si_class, vmi_class};

    fn public_at(offset: isize) -> isize {
        (offset << BaseClassTypeInfo::OFFSET_SHIFT) | BaseClassTypeInfo::PUBLIC
    }

    #[test]
    fn same_type_by_name() {
        let a = class("3Foo");
        let b = class("3Foo");
        let local_a = class("*3Foo");
        let local_b = class("*3Foo");

        assert!(a.same_type(b));
        assert!(local_a.same_type(local_a));
        assert!(!local_a.same_type(local_b));
        assert!(!a.same_type(class("3Bar")));
    }

    #[test]
    fn exact_and_single_base_matches() {
        let base = class("4Base");
        let derived = si_class("7Derived", base);
        let other = class("5Other");
        let mut object = 0u64;
        let obj = (&raw mut object).cast::<u8>();

        let m = matcher();
        // Safety: test type infos are valid
        unsafe {
            assert_eq!(m.matches(derived, derived, obj), Some(obj));
            assert_eq!(m.matches(derived, base, obj), Some(obj));
            assert_eq!(m.matches(base, derived, obj), None);
            assert_eq!(m.matches(derived, other, obj), None);
        }
    }

    #[test]
    fn multiple_inheritance_adjusts_pointer() {
        let left = class("4Left");
        let right = class("5Right");
        let private = class("7Private");
        let both = vmi_class(
            "4Both",
            &[
                (left, public_at(0)),
                (right, public_at(16)),
                (private, 24 << BaseClassTypeInfo::OFFSET_SHIFT),
            ],
        );
        let mut object = [0u64; 4];
        let obj = object.as_mut_ptr().cast::<u8>();

        let m = matcher();
        // Safety: test type infos are valid
        unsafe {
            assert_eq!(m.matches(both, left, obj), Some(obj));
            assert_eq!(m.matches(both, right, obj), Some(obj.wrapping_add(16)));
            assert_eq!(m.matches(both, private, obj), None);
        }
    }

    #[test]
    fn ambiguous_bases_do_not_match() {
        let root = class("4Root");
        let a = si_class("1A", root);
        let b = si_class("1B", root);
        let diamond = vmi_class("7Diamond", &[(a, public_at(0)), (b, public_at(8))]);
        let mut object = [0u64; 2];
        let obj = object.as_mut_ptr().cast::<u8>();

        let m = matcher();
        // Safety: test type infos are valid
        unsafe {
            assert_eq!(m.matches(diamond, root, obj), None);
            assert_eq!(m.matches(diamond, b, obj), Some(obj.wrapping_add(8)));
        }
    }

    #[test]
    fn virtual_base_offset_is_read_from_vtable() {
        let root = class("4Root");
        // the virtual base offset lives 3 words before the address point
        let vbase_slot = -3 * size_of::<usize>() as isize;
        let derived = vmi_class(
            "7Derived",
            &[(
                root,
                (vbase_slot << BaseClassTypeInfo::OFFSET_SHIFT)
                    | BaseClassTypeInfo::PUBLIC
                    | BaseClassTypeInfo::VIRTUAL,
            )],
        );

        let vtable: [isize; 4] = [40, 0, 0, 0];
        let address_point = vtable.as_ptr().wrapping_add(3).cast::<u8>();
        let mut object: [*const u8; 8] = [address_point; 8];
        let obj = object.as_mut_ptr().cast::<u8>();

        // Safety: test type infos are valid
        unsafe {
            assert_eq!(matcher().matches(derived, root, obj), Some(obj.wrapping_add(40)));
        }
    }

    #[test]
    fn pointer_matches() {
        let base = class("4Base");
        let derived = si_class("7Derived", base);
        let void = class("v");
        let ptr_derived = pointer("P7Derived", 0, derived);
        let ptr_const_derived = pointer("PK7Derived", 1, derived);
        let ptr_base = pointer("P4Base", 0, base);
        let ptr_void = pointer("Pv", 0, void);
        let nullptr = class("Dn");

        let mut target = 0u64;
        let mut thrown: *mut u8 = (&raw mut target).cast();
        let obj = (&raw mut thrown).cast::<u8>();
        let value = thrown;

        let m = matcher();
        // Safety: test type infos are valid
        unsafe {
            assert_eq!(m.matches(ptr_derived, ptr_derived, obj), Some(value));
            assert_eq!(m.matches(ptr_derived, ptr_const_derived, obj), Some(value));
            assert_eq!(m.matches(ptr_const_derived, ptr_derived, obj), None);
            assert_eq!(m.matches(ptr_derived, ptr_base, obj), Some(value));
            assert_eq!(m.matches(ptr_derived, ptr_void, obj), Some(value));
            assert_eq!(m.matches(ptr_base, ptr_derived, obj), None);
            // a pointer is not caught by a handler for the pointee
            assert_eq!(m.matches(ptr_derived, derived, obj), None);

            let mut null: *mut u8 = ptr::null_mut();
            let null_obj = (&raw mut null).cast::<u8>();
            assert_eq!(m.matches(nullptr, ptr_base, null_obj), Some(ptr::null_mut()));
            assert_eq!(m.matches(nullptr, base, null_obj), None);
        }
    }

    #[test]
    fn without_vtables_only_exact_matches() {
        let base = class("4Base");
        let derived = si_class("7Derived", base);
        let mut object = 0u64;
        let obj = (&raw mut object).cast::<u8>();

        let m = ItaniumRtti::default();
        if RttiVtables::native().is_none() {
            // Safety: test type infos are valid
            unsafe {
                assert_eq!(m.matches(derived, derived, obj), Some(obj));
                assert_eq!(m.matches(derived, base, obj), None);
            }
        }
    }
}
