//! ObjC runtime structures as they appear inside the shared cache.
//!
//! Every pointer field must be slid before use; the cache encodes
//! chained-fixup state in the high bits.

use bitflags::bitflags;
use scroll::{Pread, Pwrite, SizeWith};

bitflags! {
    /// Flags word of the `__objc_imageinfo` section.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageInfoFlags: u32 {
        const IS_REPLACEMENT = 1 << 0;
        const SUPPORTS_GC = 1 << 1;
        const REQUIRES_GC = 1 << 2;
        const OPTIMIZED_BY_DYLD = 1 << 3;
        const CORRECTED_SYNTHESIZE = 1 << 4;
        const IS_SIMULATED = 1 << 5;
        const HAS_CATEGORY_CLASS_PROPERTIES = 1 << 6;
        const OPTIMIZED_BY_DYLD_CLOSURE = 1 << 7;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcClass {
    pub isa: u64,
    pub superclass: u64,
    pub method_cache: u64,
    pub vtable: u64,
    pub data: u64, // class_rw_t, low bits carry Swift flags
}

impl ObjcClass {
    pub const SIZE: usize = 40;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcClassData {
    pub flags: u32,
    pub instance_start: u32,
    pub instance_size: u32,
    pub pad: u32,
    pub ivar_layout: u64,
    pub name: u64,
    pub base_methods: u64,
    pub base_protocols: u64,
    pub ivars: u64,
    pub weak_ivar_layout: u64,
    pub base_properties: u64,
}

impl ObjcClassData {
    pub const SIZE: usize = 72;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcMethodList {
    pub entsize_and_flags: u32,
    pub count: u32,
}

impl ObjcMethodList {
    pub const SIZE: usize = 8;

    pub const RELATIVE_METHOD_FLAG: u32 = 0x80000000;
    pub const RELATIVE_SELECTORS_ARE_DIRECT_FLAG: u32 = 0x40000000;
    pub const FLAGS_MASK: u32 = 0xFFFF0000;

    /// Small (self-relative) methods are marked in the high flag bits.
    pub fn uses_relative_methods(&self) -> bool {
        self.entsize_and_flags & Self::FLAGS_MASK != 0
    }

    pub fn entsize(&self) -> u32 {
        self.entsize_and_flags & !3 & !Self::FLAGS_MASK
    }
}

/// Small method entry: self-relative int32 offsets to name slot, types
/// string, and implementation.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcMethodSmall {
    pub name: i32,
    pub types: i32,
    pub imp: i32,
}

impl ObjcMethodSmall {
    pub const SIZE: usize = 12;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcMethodLarge {
    pub name: u64,
    pub types: u64,
    pub imp: u64,
}

impl ObjcMethodLarge {
    pub const SIZE: usize = 24;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcProtocolList {
    pub count: u64,
    // u64 protocol pointers follow
}

impl ObjcProtocolList {
    pub const SIZE: usize = 8;
}

/// protocol_t. Everything from `extended_method_types` on is only on
/// disk when the recorded `size` covers it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcProtocol {
    pub isa: u64,
    pub name: u64,
    pub protocols: u64,
    pub instance_methods: u64,
    pub class_methods: u64,
    pub optional_instance_methods: u64,
    pub optional_class_methods: u64,
    pub instance_properties: u64,
    pub size: u32,
    pub flags: u32,
    pub extended_method_types: u64, // const char **
    pub demangled_name: u64,
    pub class_properties: u64,
}

impl ObjcProtocol {
    pub const SIZE: usize = 96;

    pub fn has_extended_method_types(&self) -> bool {
        self.size >= 80
    }

    pub fn has_demangled_name(&self) -> bool {
        self.size >= 88
    }

    pub fn has_class_properties(&self) -> bool {
        self.size >= 96
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcPropertyList {
    pub entsize: u32,
    pub count: u32,
}

impl ObjcPropertyList {
    pub const SIZE: usize = 8;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcProperty {
    pub name: u64,
    pub attributes: u64,
}

impl ObjcProperty {
    pub const SIZE: usize = 16;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcIvarList {
    pub entsize: u32,
    pub count: u32,
}

impl ObjcIvarList {
    pub const SIZE: usize = 8;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcIvar {
    pub offset: u64, // pointer to the ivar offset slot
    pub name: u64,
    pub types: u64,
    pub alignment: u32,
    pub size: u32,
}

impl ObjcIvar {
    pub const SIZE: usize = 32;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ObjcCategory {
    pub name: u64,
    pub cls: u64,
    pub instance_methods: u64,
    pub class_methods: u64,
    pub protocols: u64,
    pub instance_properties: u64,
}

impl ObjcCategory {
    pub const SIZE: usize = 48;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_list_flavors() {
        let small = ObjcMethodList {
            entsize_and_flags: ObjcMethodList::RELATIVE_METHOD_FLAG | 12,
            count: 3,
        };
        assert!(small.uses_relative_methods());
        assert_eq!(small.entsize(), 12);

        let large = ObjcMethodList {
            entsize_and_flags: 24 | 3,
            count: 1,
        };
        assert!(!large.uses_relative_methods());
        assert_eq!(large.entsize(), 24);
    }

    #[test]
    fn protocol_trailing_fields_follow_size() {
        let mut proto = ObjcProtocol {
            size: 72,
            ..Default::default()
        };
        assert!(!proto.has_extended_method_types());

        proto.size = 80;
        assert!(proto.has_extended_method_types());
        assert!(!proto.has_demangled_name());

        proto.size = 96;
        assert!(proto.has_class_properties());
    }
}
