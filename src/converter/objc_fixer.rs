//! Undoes the runtime-linker ObjC optimizations.
//!
//! The cache builder uniques selectors, method lists, protocols, and
//! whole class graphs across images, leaving this image's metadata
//! pointing all over the cache. This pass walks the class/category/
//! protocol graphs from their list sections, copies every out-of-image
//! referent into a synthesized `__EXTRA_OBJC` segment, repoints
//! `__objc_selrefs` at in-image strings, and rewrites direct-selector
//! `ADRP+ADD` pairs back into loads through a selector reference.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{error, info, warn};
use scroll::Pwrite;

use crate::cache::DyldCache;
use crate::converter::arm64::{adrp_page_target, sign_extend};
use crate::converter::slide_info::PointerSlider;
use crate::error::{ExtractError, Result};
use crate::extraction::{EXTRA_SEGMENT_NAME, ExtractionContext};
use crate::macho::constants::{LC_SEGMENT_64, LC_UUID};
use crate::macho::structs::{MachHeader64, SegmentCommand64, make_name16};
use crate::macho::{LoadCommand, MachO};
use crate::objc::*;

/// Rewrites the ADRP of a pair to target a new page, keeping its
/// destination register.
fn retarget_adrp(adrp: u32, adrp_addr: u64, new_target_page: u64) -> u32 {
    let delta = new_target_page as i64 - (adrp_addr & !0xfff) as i64;
    let immhi = ((delta >> 9) as u32) & 0x00ff_ffe0;
    let immlo = ((delta << 17) as u32) & 0x6000_0000;
    0x9000_0000 | immlo | immhi | (adrp & 0x1f)
}

/// Turns an `ADD Xd, Xn, #imm` into `LDR Xd, [Xn, #page_off]`, keeping
/// both registers.
fn add_to_ldr(add: u32, page_off: u64) -> u32 {
    let imm12 = ((page_off << 7) as u32) & 0x003f_fc00;
    0xf940_0000 | imm12 | (add & 0x3ff)
}

/// Re-immediates an `ADD Xd, Xn, #imm`, keeping both registers.
fn retarget_add(add: u32, page_off: u64) -> u32 {
    let imm12 = ((page_off << 10) as u32) & 0x003f_fc00;
    0x9100_0000 | imm12 | (add & 0x3ff)
}

pub fn fix_objc(cache: &mut DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<()> {
    ctx.status.update(Some("ObjC Fixer"), None);

    // only images the cache builder optimized need (or survive) fixing
    let Some(image_info) = ctx
        .macho
        .segments()
        .flat_map(|seg| seg.sections.iter())
        .find(|sect| sect.sect.name() == b"__objc_imageinfo")
        .map(|sect| sect.sect.addr)
    else {
        return Ok(());
    };

    let (info_file, info_off) = cache
        .resolve_addr(image_info)
        .ok_or(ExtractError::MappingMiss(image_info))?;
    let flags = ImageInfoFlags::from_bits_retain(cache.read(info_file, info_off + 4)?);
    if !flags.contains(ImageInfoFlags::OPTIMIZED_BY_DYLD) {
        info!("ObjC was not optimized by Dyld, not fixing ObjC.");
        return Ok(());
    }

    let mut fixer = ObjcFixer::new(cache, ctx)?;
    fixer.process_sections(cache, ctx)?;
    fixer.finalize_future_classes(cache, ctx)?;
    fixer.fix_selectors(cache, ctx)?;
    fixer.check_space_constraints(cache, ctx)?;
    fixer.add_extra_data_segment(cache, ctx)?;

    // hand the buffer to the offset layouter
    ctx.extra_data = fixer.extra_data;

    // the image is no longer dyld-optimized
    let cleared = flags.difference(ImageInfoFlags::OPTIMIZED_BY_DYLD);
    cache.write(info_file, info_off + 4, cleared.bits())?;

    Ok(())
}

struct ObjcFixer {
    slider: PointerSlider,

    extra_segment: SegmentCommand64,
    extra_data_max_size: u64,
    extra_data_head: u64,
    extra_data: Vec<u8>,

    // map original definition addresses to their processed addresses
    category_cache: HashMap<u64, u64>,
    class_cache: HashMap<u64, u64>,
    class_data_cache: HashMap<u64, u64>,
    ivar_list_cache: HashMap<u64, u64>,
    protocol_list_cache: HashMap<u64, u64>,
    protocol_cache: HashMap<u64, u64>,
    property_list_cache: HashMap<u64, u64>,
    method_list_cache: HashMap<u64, u64>,
    string_cache: HashMap<u64, u64>,
    int_cache: HashMap<u64, u64>,

    // a selref's old load target to its pointer slot
    selref_cache: HashMap<u64, u64>,

    // classes currently on the recursion stack
    classes_processing: Vec<u64>,

    // (pointer to patch, target class) pairs deferred past the
    // traversal because the target was still being built
    future_classes: Vec<(u64, u64)>,
}

impl ObjcFixer {
    fn new(cache: &DyldCache, ctx: &ExtractionContext<'_>) -> Result<Self> {
        let (extra_segment, extra_data_max_size) = Self::create_extra_segment(cache, &ctx.macho)?;

        Ok(ObjcFixer {
            slider: PointerSlider::new(cache)?,
            extra_data_head: extra_segment.vmaddr,
            extra_segment,
            extra_data_max_size,
            extra_data: Vec::new(),
            category_cache: HashMap::new(),
            class_cache: HashMap::new(),
            class_data_cache: HashMap::new(),
            ivar_list_cache: HashMap::new(),
            protocol_list_cache: HashMap::new(),
            protocol_cache: HashMap::new(),
            property_list_cache: HashMap::new(),
            method_list_cache: HashMap::new(),
            string_cache: HashMap::new(),
            int_cache: HashMap::new(),
            selref_cache: HashMap::new(),
            classes_processing: Vec::new(),
            future_classes: Vec::new(),
        })
    }

    /// Reserves a page-aligned address range for `__EXTRA_OBJC` in the
    /// largest gap between consecutive segments.
    fn create_extra_segment(cache: &DyldCache, macho: &MachO) -> Result<(SegmentCommand64, u64)> {
        let mut segments: Vec<&SegmentCommand64> = macho.segments().map(|s| &s.seg).collect();
        segments.sort_by_key(|seg| seg.vmaddr);

        let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
            return Err(ExtractError::ContainerParse("image has no segments".into()));
        };
        if first.name() != b"__TEXT" {
            return Err(ExtractError::ContainerParse(
                "Mach-O file does not start with __TEXT segment".into(),
            ));
        }
        if last.name() != b"__LINKEDIT" {
            return Err(ExtractError::ContainerParse(
                "Mach-O file does not end with __LINKEDIT segment".into(),
            ));
        }

        let mut max_gap = 0u64;
        let mut left_seg: Option<&SegmentCommand64> = None;
        for pair in segments.windows(2) {
            let gap_start = pair[0].vmaddr + pair[0].vmsize;
            let gap = pair[1].vmaddr.saturating_sub(gap_start);
            if gap > max_gap {
                max_gap = gap;
                left_seg = Some(pair[0]);
            }
        }

        let Some(left_seg) = left_seg else {
            return Err(ExtractError::ContainerParse(
                "unable to find space for the extra ObjC segment".into(),
            ));
        };

        let left_end = left_seg.vmaddr + left_seg.vmsize;
        let new_addr = (left_end + 0x1000) & !0xfff;

        let (_, left_off) = cache
            .resolve_addr(left_seg.vmaddr)
            .ok_or(ExtractError::MappingMiss(left_seg.vmaddr))?;
        let new_off = (left_off + left_seg.vmsize + 0x1000) & !0xfff;

        // the alignment eats into the gap
        let max_size = max_gap - (new_addr - left_end);

        let segment = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32, // no sections
            segname: make_name16(EXTRA_SEGMENT_NAME),
            vmaddr: new_addr,
            vmsize: 0,
            fileoff: new_off,
            filesize: 0,
            maxprot: 3, // read and write
            initprot: 3,
            nsects: 0,
            flags: 0,
        };

        Ok((segment, max_size))
    }

    /// Reads and unslides the pointer at `field_addr`; fields without
    /// covering slide info read as zero, like any other unset field.
    fn slide_field(&self, cache: &DyldCache, field_addr: u64) -> u64 {
        self.slider.slide_address(cache, field_addr).unwrap_or(0)
    }

    fn append_extra(&mut self, data: &[u8]) -> u64 {
        let addr = self.extra_data_head;

        let mut padded = data.len();
        if padded % 8 != 0 {
            padded += 8 - padded % 8;
        }
        self.extra_data.extend_from_slice(data);
        self.extra_data
            .resize(self.extra_data.len() + (padded - data.len()), 0);
        self.extra_data_head += padded as u64;

        addr
    }

    fn write_at_addr(&self, cache: &mut DyldCache, addr: u64, bytes: &[u8]) -> Result<()> {
        let (file, offset) = cache
            .resolve_addr(addr)
            .ok_or(ExtractError::MappingMiss(addr))?;
        cache.write_bytes(file, offset, bytes)
    }

    /// Writes updated bytes in place when the definition is in-image,
    /// or appends them to `__EXTRA_OBJC` and returns the new address.
    fn place(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        addr: u64,
        bytes: &[u8],
    ) -> Result<u64> {
        if macho.contains_addr(addr) {
            self.write_at_addr(cache, addr, bytes)?;
            Ok(addr)
        } else {
            Ok(self.append_extra(bytes))
        }
    }

    fn process_sections(&mut self, cache: &mut DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<()> {
        let sections: Vec<(Vec<u8>, u64, u64)> = ctx
            .macho
            .segments()
            .flat_map(|seg| seg.sections.iter())
            .map(|sect| (sect.sect.name().to_vec(), sect.sect.addr, sect.sect.size))
            .collect();

        for (name, addr, size) in sections {
            match name.as_slice() {
                b"__objc_classlist" => {
                    for ptr_addr in (addr..addr + size).step_by(8) {
                        ctx.status.update(None, Some("Processing Classes"));
                        let class_addr = self.slide_field(cache, ptr_addr);

                        if !ctx.macho.contains_addr(class_addr) {
                            warn!(
                                "Class pointer at {ptr_addr:#x} points to class outside the image."
                            );
                            continue;
                        }

                        let (_, needs_future) = self.process_class(cache, &ctx.macho, class_addr)?;
                        if needs_future {
                            self.future_classes.push((ptr_addr, class_addr));
                        }
                    }
                }
                b"__objc_catlist" => {
                    for ptr_addr in (addr..addr + size).step_by(8) {
                        ctx.status.update(None, Some("Processing Categories"));
                        let category_addr = self.slide_field(cache, ptr_addr);

                        if !ctx.macho.contains_addr(category_addr) {
                            warn!(
                                "Category pointer at {ptr_addr:#x} points to category outside the image."
                            );
                            continue;
                        }

                        self.process_category(cache, &ctx.macho, category_addr)?;
                    }
                }
                b"__objc_protolist" => {
                    for ptr_addr in (addr..addr + size).step_by(8) {
                        ctx.status.update(None, Some("Processing Protocols"));
                        let proto_addr = self.slide_field(cache, ptr_addr);

                        if !ctx.macho.contains_addr(proto_addr) {
                            warn!(
                                "Protocol pointer at {ptr_addr:#x} points to protocol outside the image."
                            );
                            continue;
                        }

                        self.process_protocol(cache, &ctx.macho, proto_addr)?;
                    }
                }
                b"__objc_selrefs" => {
                    for ptr_addr in (addr..addr + size).step_by(8) {
                        ctx.status
                            .update(None, Some("Processing Selector References"));
                        let target = self.slide_field(cache, ptr_addr);

                        self.selref_cache.insert(target, ptr_addr);

                        let new_ptr = self.process_string(cache, &ctx.macho, target)?;
                        self.write_at_addr(cache, ptr_addr, &new_ptr.to_le_bytes())?;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn process_category(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        category_addr: u64,
    ) -> Result<u64> {
        if let Some(&new) = self.category_cache.get(&category_addr) {
            return Ok(new);
        }

        let mut category = ObjcCategory {
            name: self.slide_field(cache, category_addr),
            cls: self.slide_field(cache, category_addr + 8),
            instance_methods: self.slide_field(cache, category_addr + 16),
            class_methods: self.slide_field(cache, category_addr + 24),
            protocols: self.slide_field(cache, category_addr + 32),
            instance_properties: self.slide_field(cache, category_addr + 40),
        };

        if category.name != 0 {
            category.name = self.process_string(cache, macho, category.name)?;
        }

        let mut needs_future_class = false;
        if category.cls != 0 {
            let (cls, needs_future) = self.process_class(cache, macho, category.cls)?;
            category.cls = cls;
            needs_future_class = needs_future;
        }

        if category.instance_methods != 0 {
            category.instance_methods =
                self.process_method_list(cache, macho, category.instance_methods, false)?;
        }
        if category.class_methods != 0 {
            category.class_methods =
                self.process_method_list(cache, macho, category.class_methods, false)?;
        }
        if category.protocols != 0 {
            category.protocols = self.process_protocol_list(cache, macho, category.protocols)?;
        }
        if category.instance_properties != 0 {
            category.instance_properties =
                self.process_property_list(cache, macho, category.instance_properties)?;
        }

        let mut bytes = [0u8; ObjcCategory::SIZE];
        bytes.pwrite_with(category, 0, scroll::LE).unwrap();
        let new_addr = self.place(cache, macho, category_addr, &bytes)?;

        if needs_future_class {
            // cls sits 8 bytes into the category
            self.future_classes.push((new_addr + 8, category.cls));
        }

        self.category_cache.insert(category_addr, new_addr);
        Ok(new_addr)
    }

    /// Processes a class definition. When the class is already on the
    /// recursion stack (cyclic isa/superclass edges), returns the
    /// original address with `true`: the reference must be patched
    /// later through the future-class list.
    fn process_class(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        class_addr: u64,
    ) -> Result<(u64, bool)> {
        if self.classes_processing.contains(&class_addr) {
            return Ok((class_addr, true));
        }
        if let Some(&new) = self.class_cache.get(&class_addr) {
            return Ok((new, false));
        }

        self.classes_processing.push(class_addr);

        let mut class = ObjcClass {
            isa: self.slide_field(cache, class_addr),
            superclass: self.slide_field(cache, class_addr + 8),
            method_cache: self.slide_field(cache, class_addr + 16),
            vtable: self.slide_field(cache, class_addr + 24),
            data: self.slide_field(cache, class_addr + 32),
        };

        let mut needs_future_isa = false;
        if class.isa != 0 {
            let (isa, needs_future) = self.process_class(cache, macho, class.isa)?;
            class.isa = isa;
            needs_future_isa = needs_future;
        }

        let mut needs_future_super = false;
        if class.superclass != 0 {
            let (superclass, needs_future) = self.process_class(cache, macho, class.superclass)?;
            class.superclass = superclass;
            needs_future_super = needs_future;
        }

        // the runtime rebuilds these
        class.method_cache = 0;
        class.vtable = 0;

        if class.data != 0 {
            // the low bits mark Swift classes
            let is_stub_class = !macho.contains_addr(class_addr);
            class.data = self.process_class_data(cache, macho, class.data & !0x3, is_stub_class)?;
        }

        let mut bytes = [0u8; ObjcClass::SIZE];
        bytes.pwrite_with(class, 0, scroll::LE).unwrap();
        let new_addr = self.place(cache, macho, class_addr, &bytes)?;

        if needs_future_isa {
            self.future_classes.push((new_addr, class.isa));
        }
        if needs_future_super {
            self.future_classes.push((new_addr + 8, class.superclass));
        }

        self.classes_processing.retain(|&addr| addr != class_addr);
        self.class_cache.insert(class_addr, new_addr);
        Ok((new_addr, false))
    }

    fn process_class_data(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        data_addr: u64,
        is_stub_class: bool,
    ) -> Result<u64> {
        if let Some(&new) = self.class_data_cache.get(&data_addr) {
            return Ok(new);
        }

        let mut data: ObjcClassData = cache
            .resolve_addr(data_addr)
            .ok_or(ExtractError::MappingMiss(data_addr))
            .and_then(|(file, off)| cache.read(file, off))?;
        data.ivar_layout = self.slide_field(cache, data_addr + 16);
        data.name = self.slide_field(cache, data_addr + 24);
        data.base_methods = self.slide_field(cache, data_addr + 32);
        data.base_protocols = self.slide_field(cache, data_addr + 40);
        data.ivars = self.slide_field(cache, data_addr + 48);
        data.weak_ivar_layout = self.slide_field(cache, data_addr + 56);
        data.base_properties = self.slide_field(cache, data_addr + 64);

        if data.ivar_layout != 0 {
            data.ivar_layout = self.process_int(cache, macho, data.ivar_layout, 1)?;
        }
        if data.name != 0 {
            data.name = self.process_string(cache, macho, data.name)?;
        }
        if data.base_methods != 0 {
            data.base_methods =
                self.process_method_list(cache, macho, data.base_methods, is_stub_class)?;
        }
        if data.base_protocols != 0 {
            data.base_protocols = self.process_protocol_list(cache, macho, data.base_protocols)?;
        }
        if data.ivars != 0 {
            data.ivars = self.process_ivar_list(cache, macho, data.ivars)?;
        }
        if data.weak_ivar_layout != 0 {
            data.weak_ivar_layout = self.process_int(cache, macho, data.weak_ivar_layout, 1)?;
        }
        if data.base_properties != 0 {
            data.base_properties =
                self.process_property_list(cache, macho, data.base_properties)?;
        }

        let mut bytes = [0u8; ObjcClassData::SIZE];
        bytes.pwrite_with(data, 0, scroll::LE).unwrap();
        let new_addr = self.place(cache, macho, data_addr, &bytes)?;

        self.class_data_cache.insert(data_addr, new_addr);
        Ok(new_addr)
    }

    fn process_ivar_list(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        list_addr: u64,
    ) -> Result<u64> {
        if let Some(&new) = self.ivar_list_cache.get(&list_addr) {
            return Ok(new);
        }

        let header: ObjcIvarList = cache
            .resolve_addr(list_addr)
            .ok_or(ExtractError::MappingMiss(list_addr))
            .and_then(|(file, off)| cache.read(file, off))?;

        if header.entsize as usize != ObjcIvar::SIZE {
            error!("Ivar list at {list_addr:#x} has an entsize that doesn't match objc_ivar_t");
            return Ok(0);
        }

        let mut buffer = Vec::with_capacity(
            ObjcIvarList::SIZE + header.count as usize * ObjcIvar::SIZE,
        );
        buffer.resize(ObjcIvarList::SIZE, 0);
        buffer.pwrite_with(header, 0, scroll::LE).unwrap();

        for i in 0..header.count as u64 {
            let ivar_addr = list_addr + ObjcIvarList::SIZE as u64 + i * header.entsize as u64;

            let raw: ObjcIvar = cache
                .resolve_addr(ivar_addr)
                .ok_or(ExtractError::MappingMiss(ivar_addr))
                .and_then(|(file, off)| cache.read(file, off))?;
            let mut ivar = ObjcIvar {
                offset: self.slide_field(cache, ivar_addr),
                name: self.slide_field(cache, ivar_addr + 8),
                types: self.slide_field(cache, ivar_addr + 16),
                ..raw
            };

            if ivar.offset != 0 {
                ivar.offset = self.process_int(cache, macho, ivar.offset, 4)?;
            }
            if ivar.name != 0 {
                ivar.name = self.process_string(cache, macho, ivar.name)?;
            }
            if ivar.types != 0 {
                ivar.types = self.process_string(cache, macho, ivar.types)?;
            }

            let mut bytes = [0u8; ObjcIvar::SIZE];
            bytes.pwrite_with(ivar, 0, scroll::LE).unwrap();
            buffer.extend_from_slice(&bytes);
        }

        let new_addr = self.place(cache, macho, list_addr, &buffer)?;
        self.ivar_list_cache.insert(list_addr, new_addr);
        Ok(new_addr)
    }

    fn process_protocol_list(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        list_addr: u64,
    ) -> Result<u64> {
        if let Some(&new) = self.protocol_list_cache.get(&list_addr) {
            return Ok(new);
        }

        let header: ObjcProtocolList = cache
            .resolve_addr(list_addr)
            .ok_or(ExtractError::MappingMiss(list_addr))
            .and_then(|(file, off)| cache.read(file, off))?;

        let mut buffer = Vec::with_capacity(ObjcProtocolList::SIZE + header.count as usize * 8);
        buffer.resize(ObjcProtocolList::SIZE, 0);
        buffer.pwrite_with(header, 0, scroll::LE).unwrap();

        for i in 0..header.count {
            let proto_addr =
                self.slide_field(cache, list_addr + ObjcProtocolList::SIZE as u64 + i * 8);
            let new_proto = self.process_protocol(cache, macho, proto_addr)?;
            buffer.extend_from_slice(&new_proto.to_le_bytes());
        }

        let new_addr = self.place(cache, macho, list_addr, &buffer)?;
        self.protocol_list_cache.insert(list_addr, new_addr);
        Ok(new_addr)
    }

    fn process_protocol(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        proto_addr: u64,
    ) -> Result<u64> {
        if let Some(&new) = self.protocol_cache.get(&proto_addr) {
            return Ok(new);
        }

        let raw: ObjcProtocol = cache
            .resolve_addr(proto_addr)
            .ok_or(ExtractError::MappingMiss(proto_addr))
            .and_then(|(file, off)| cache.read(file, off))?;
        let mut proto = ObjcProtocol {
            isa: 0, // protocol isa is always reset
            name: self.slide_field(cache, proto_addr + 8),
            protocols: self.slide_field(cache, proto_addr + 16),
            instance_methods: self.slide_field(cache, proto_addr + 24),
            class_methods: self.slide_field(cache, proto_addr + 32),
            optional_instance_methods: self.slide_field(cache, proto_addr + 40),
            optional_class_methods: self.slide_field(cache, proto_addr + 48),
            instance_properties: self.slide_field(cache, proto_addr + 56),
            extended_method_types: self.slide_field(cache, proto_addr + 72),
            demangled_name: self.slide_field(cache, proto_addr + 80),
            class_properties: self.slide_field(cache, proto_addr + 88),
            ..raw
        };

        if proto.name != 0 {
            proto.name = self.process_string(cache, macho, proto.name)?;
        }
        if proto.protocols != 0 {
            proto.protocols = self.process_protocol_list(cache, macho, proto.protocols)?;
        }
        if proto.instance_methods != 0 {
            proto.instance_methods =
                self.process_method_list(cache, macho, proto.instance_methods, true)?;
        }
        if proto.class_methods != 0 {
            proto.class_methods =
                self.process_method_list(cache, macho, proto.class_methods, true)?;
        }
        if proto.optional_instance_methods != 0 {
            proto.optional_instance_methods =
                self.process_method_list(cache, macho, proto.optional_instance_methods, true)?;
        }
        if proto.optional_class_methods != 0 {
            proto.optional_class_methods =
                self.process_method_list(cache, macho, proto.optional_class_methods, true)?;
        }
        if proto.instance_properties != 0 {
            proto.instance_properties =
                self.process_property_list(cache, macho, proto.instance_properties)?;
        }

        if proto.extended_method_types != 0 && proto.has_extended_method_types() {
            // const char **: one more hop before the string
            let string_addr = self.slide_field(cache, proto.extended_method_types);
            let new_string = self.process_string(cache, macho, string_addr)?;

            if macho.contains_addr(proto.extended_method_types) {
                self.write_at_addr(
                    cache,
                    proto.extended_method_types,
                    &new_string.to_le_bytes(),
                )?;
            } else {
                proto.extended_method_types = self.append_extra(&new_string.to_le_bytes());
            }
        }

        if proto.demangled_name != 0 && proto.has_demangled_name() {
            proto.demangled_name = self.process_string(cache, macho, proto.demangled_name)?;
        }

        if proto.class_properties != 0 && proto.has_class_properties() {
            proto.class_properties =
                self.process_property_list(cache, macho, proto.class_properties)?;
        }

        // only the on-disk size of the protocol is written back
        let mut bytes = [0u8; ObjcProtocol::SIZE];
        bytes.pwrite_with(proto, 0, scroll::LE).unwrap();
        let size = (proto.size as usize).min(ObjcProtocol::SIZE);
        let new_addr = self.place(cache, macho, proto_addr, &bytes[..size])?;

        self.protocol_cache.insert(proto_addr, new_addr);
        Ok(new_addr)
    }

    fn process_property_list(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        list_addr: u64,
    ) -> Result<u64> {
        if let Some(&new) = self.property_list_cache.get(&list_addr) {
            return Ok(new);
        }

        let header: ObjcPropertyList = cache
            .resolve_addr(list_addr)
            .ok_or(ExtractError::MappingMiss(list_addr))
            .and_then(|(file, off)| cache.read(file, off))?;

        if header.entsize as usize != ObjcProperty::SIZE {
            error!(
                "Property list at {list_addr:#x} has an entsize that doesn't match objc_property_t"
            );
            return Ok(0);
        }

        let mut buffer =
            Vec::with_capacity(ObjcPropertyList::SIZE + header.count as usize * ObjcProperty::SIZE);
        buffer.resize(ObjcPropertyList::SIZE, 0);
        buffer.pwrite_with(header, 0, scroll::LE).unwrap();

        for i in 0..header.count as u64 {
            let property_addr =
                list_addr + ObjcPropertyList::SIZE as u64 + i * header.entsize as u64;

            let mut property = ObjcProperty {
                name: self.slide_field(cache, property_addr),
                attributes: self.slide_field(cache, property_addr + 8),
            };

            if property.name != 0 {
                property.name = self.process_string(cache, macho, property.name)?;
            }
            if property.attributes != 0 {
                property.attributes = self.process_string(cache, macho, property.attributes)?;
            }

            let mut bytes = [0u8; ObjcProperty::SIZE];
            bytes.pwrite_with(property, 0, scroll::LE).unwrap();
            buffer.extend_from_slice(&bytes);
        }

        let new_addr = self.place(cache, macho, list_addr, &buffer)?;
        self.property_list_cache.insert(list_addr, new_addr);
        Ok(new_addr)
    }

    fn process_method_list(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        list_addr: u64,
        no_imp: bool,
    ) -> Result<u64> {
        if let Some(&new) = self.method_list_cache.get(&list_addr) {
            return Ok(new);
        }

        let header: ObjcMethodList = cache
            .resolve_addr(list_addr)
            .ok_or(ExtractError::MappingMiss(list_addr))
            .and_then(|(file, off)| cache.read(file, off))?;

        let relative = header.uses_relative_methods();
        let entsize = header.entsize() as usize;

        if relative && entsize != ObjcMethodSmall::SIZE {
            error!(
                "Small method list at {list_addr:#x} has an entsize that doesn't match objc_method_small_t"
            );
            return Ok(0);
        }
        if !relative && entsize != ObjcMethodLarge::SIZE {
            error!(
                "Large method list at {list_addr:#x} has an entsize that doesn't match objc_method_large_t"
            );
            return Ok(0);
        }

        let mut buffer =
            Vec::with_capacity(ObjcMethodList::SIZE + header.count as usize * entsize);
        buffer.resize(ObjcMethodList::SIZE, 0);
        buffer.pwrite_with(header, 0, scroll::LE).unwrap();

        // self-relative fields can only be re-encoded once the list's
        // final address is known; remember (field offset, target)
        let mut relative_fixups: Vec<(usize, u64)> = Vec::new();

        for i in 0..header.count as u64 {
            let method_addr = list_addr + ObjcMethodList::SIZE as u64 + i * entsize as u64;

            if relative {
                let mut method: ObjcMethodSmall = cache
                    .resolve_addr(method_addr)
                    .ok_or(ExtractError::MappingMiss(method_addr))
                    .and_then(|(file, off)| cache.read(file, off))?;
                let method_off = ObjcMethodList::SIZE + i as usize * entsize;

                if method.name != 0 {
                    let name_addr = (method_addr as i64 + method.name as i64) as u64;
                    let new_name = self.process_string(cache, macho, name_addr)?;
                    method.name = new_name.wrapping_sub(method_addr) as i32;
                    relative_fixups.push((method_off, new_name));
                }

                if method.types != 0 {
                    let types_addr = (method_addr as i64 + 4 + method.types as i64) as u64;
                    let new_types = self.process_string(cache, macho, types_addr)?;
                    method.types = new_types.wrapping_sub(method_addr + 4) as i32;
                    relative_fixups.push((method_off + 4, new_types));
                }

                if no_imp {
                    method.imp = 0;
                }

                let mut bytes = [0u8; ObjcMethodSmall::SIZE];
                bytes.pwrite_with(method, 0, scroll::LE).unwrap();
                buffer.extend_from_slice(&bytes);
            } else {
                let mut method = ObjcMethodLarge {
                    name: self.slide_field(cache, method_addr),
                    types: self.slide_field(cache, method_addr + 8),
                    imp: self.slide_field(cache, method_addr + 16),
                };

                if method.name != 0 {
                    method.name = self.process_string(cache, macho, method.name)?;
                }
                if method.types != 0 {
                    method.types = self.process_string(cache, macho, method.types)?;
                }
                if no_imp {
                    method.imp = 0;
                }

                let mut bytes = [0u8; ObjcMethodLarge::SIZE];
                bytes.pwrite_with(method, 0, scroll::LE).unwrap();
                buffer.extend_from_slice(&bytes);
            }
        }

        let new_addr = if macho.contains_addr(list_addr) {
            self.write_at_addr(cache, list_addr, &buffer)?;
            list_addr
        } else {
            let new_addr = self.extra_data_head;
            // moving the list changes the base of every self-relative
            // offset
            for (field_off, target) in relative_fixups {
                let value = target.wrapping_sub(new_addr + field_off as u64) as i32;
                buffer[field_off..field_off + 4].copy_from_slice(&value.to_le_bytes());
            }
            self.append_extra(&buffer)
        };

        self.method_list_cache.insert(list_addr, new_addr);
        Ok(new_addr)
    }

    fn process_string(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        string_addr: u64,
    ) -> Result<u64> {
        if let Some(&new) = self.string_cache.get(&string_addr) {
            return Ok(new);
        }

        let new_addr = if macho.contains_addr(string_addr) {
            string_addr
        } else {
            let Some((file, offset)) = cache.resolve_addr(string_addr) else {
                warn!("String at {string_addr:#x} lies outside the cache.");
                return Ok(string_addr);
            };
            let string = cache.read_cstring(file, offset)?;
            self.append_extra(&string)
        };

        self.string_cache.insert(string_addr, new_addr);
        Ok(new_addr)
    }

    fn process_int(
        &mut self,
        cache: &mut DyldCache,
        macho: &MachO,
        int_addr: u64,
        size: usize,
    ) -> Result<u64> {
        if let Some(&new) = self.int_cache.get(&int_addr) {
            return Ok(new);
        }

        let new_addr = if macho.contains_addr(int_addr) {
            int_addr
        } else {
            let Some((file, offset)) = cache.resolve_addr(int_addr) else {
                warn!("Value at {int_addr:#x} lies outside the cache.");
                return Ok(int_addr);
            };
            let bytes = cache.read_bytes(file, offset, size)?.to_vec();
            self.append_extra(&bytes)
        };

        self.int_cache.insert(int_addr, new_addr);
        Ok(new_addr)
    }

    /// Patches the references that were deferred because their target
    /// class was mid-construction when first seen.
    fn finalize_future_classes(
        &mut self,
        cache: &mut DyldCache,
        ctx: &mut ExtractionContext<'_>,
    ) -> Result<()> {
        let extra_start = self.extra_segment.vmaddr;

        while let Some((dest_ptr, class_addr)) = self.future_classes.pop() {
            let (new_addr, needs_future) = self.process_class(cache, &ctx.macho, class_addr)?;
            if needs_future {
                error!("Unable to resolve class pointer at {dest_ptr:#x}");
                continue;
            }

            if dest_ptr >= extra_start && dest_ptr < self.extra_data_head {
                let offset = (dest_ptr - extra_start) as usize;
                self.extra_data[offset..offset + 8].copy_from_slice(&new_addr.to_le_bytes());
            } else {
                self.write_at_addr(cache, dest_ptr, &new_addr.to_le_bytes())?;
            }
        }

        Ok(())
    }

    /// Rewrites direct-selector `ADRP+ADD` pairs into loads through the
    /// selector-reference section.
    fn fix_selectors(&mut self, cache: &mut DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<()> {
        let Some(text_sect) = ctx.macho.section(b"__TEXT", b"__text") else {
            error!("Unable to get __text section");
            return Ok(());
        };
        let text_addr = text_sect.sect.addr;
        let text_size = text_sect.sect.size;
        let (text_file, text_off) = cache
            .resolve_addr(text_addr)
            .ok_or(ExtractError::MappingMiss(text_addr))?;

        ctx.status.update(None, Some("Fixing Selectors"));

        let words: Vec<u32> = cache
            .read_bytes(text_file, text_off, text_size as usize)?
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();

        for (i, &word) in words.iter().enumerate() {
            if word & 0x9f00_0000 != 0x9000_0000 {
                continue;
            }
            let adrp_reg = word & 0x1f;

            let add_idxs = find_add_instructions(&words, i + 1, adrp_reg);
            if add_idxs.is_empty() {
                continue;
            }

            let adrp_addr = text_addr + i as u64 * 4;
            let adrp_off = text_off + i as u64 * 4;
            let adrp_result = adrp_page_target(word, adrp_addr);

            // the first rewritten ADD decides the new ADRP page
            let mut new_adrp_target: Option<u64> = None;

            for add_idx in add_idxs {
                let add_off = text_off + add_idx as u64 * 4;
                // earlier rewrites may have replaced the word; reread
                let add_instr: u32 = cache.read(text_file, add_off)?;

                // plain 64-bit immediate ADD only
                if add_instr & 0xffc0_0000 != 0x9100_0000 {
                    continue;
                }

                let imm = u64::from(add_instr & 0x003f_fc00) >> 10;
                let load_target = adrp_result.wrapping_add(imm);

                if ctx.macho.contains_addr(load_target) {
                    continue;
                }

                if let Some(&selref_ptr) = self.selref_cache.get(&load_target) {
                    let page = match new_adrp_target {
                        None => {
                            let page = selref_ptr & !0xfff;
                            let new_adrp = retarget_adrp(word, adrp_addr, page);
                            cache.write(text_file, adrp_off, new_adrp)?;
                            new_adrp_target = Some(page);
                            page
                        }
                        Some(page) => {
                            let delta = selref_ptr as i64 - page as i64;
                            if !(0..=4095).contains(&delta) {
                                warn!(
                                    "Unable to reach selector reference at {:#x}, with new ADRP target {page:#x}, load target {selref_ptr:#x}",
                                    text_addr + add_idx as u64 * 4,
                                );
                                continue;
                            }
                            page
                        }
                    };

                    let new_ldr = add_to_ldr(add_instr, selref_ptr - page);
                    cache.write(text_file, add_off, new_ldr)?;

                    ctx.status.update(None, Some("Fixing Selectors"));
                    continue;
                }

                // some code addresses strings that have no selector
                // reference; pull the string in and re-point the pair
                if cache.resolve_addr(load_target).is_none() {
                    continue;
                }

                let string_addr = self.process_string(cache, &ctx.macho, load_target)?;
                match new_adrp_target {
                    None => {
                        let page = string_addr & !0xfff;
                        let new_adrp = retarget_adrp(word, adrp_addr, page);
                        cache.write(text_file, adrp_off, new_adrp)?;
                        new_adrp_target = Some(page);

                        let new_add = retarget_add(add_instr, string_addr - page);
                        cache.write(text_file, add_off, new_add)?;
                    }
                    Some(page) => {
                        let delta = string_addr as i64 - page as i64;
                        if !(0..=4095).contains(&delta) {
                            warn!(
                                "Unable to reach imported string at {:#x}, with new ADRP target {page:#x}, load target {string_addr:#x}",
                                text_addr + add_idx as u64 * 4,
                            );
                            continue;
                        }
                        let new_add = retarget_add(add_instr, string_addr - page);
                        cache.write(text_file, add_off, new_add)?;
                    }
                }

                ctx.status.update(None, Some("Fixing Selectors"));
            }
        }

        Ok(())
    }

    /// Verifies the new segment command fits before `__TEXT,__text` and
    /// the extra data fits inside the chosen gap.
    fn check_space_constraints(
        &mut self,
        cache: &mut DyldCache,
        ctx: &mut ExtractionContext<'_>,
    ) -> Result<()> {
        let first_seg_addr = ctx
            .macho
            .segments()
            .next()
            .map(|seg| seg.seg.vmaddr)
            .unwrap_or_default();
        let header_end = first_seg_addr
            + MachHeader64::SIZE as u64
            + ctx.macho.header.sizeofcmds as u64;

        let text_start = ctx
            .macho
            .section(b"__TEXT", b"__text")
            .map(|sect| sect.sect.addr)
            .ok_or_else(|| ExtractError::ContainerParse("unable to get __text section".into()))?;

        if header_end + SegmentCommand64::SIZE as u64 > text_start {
            let needed = header_end + SegmentCommand64::SIZE as u64 - text_start;
            self.make_header_space(cache, ctx, needed)?;
        }

        if self.extra_data.len() as u64 > self.extra_data_max_size {
            return Err(ExtractError::ExtraSegmentOverflow {
                size: self.extra_data.len() as u64,
                max: self.extra_data_max_size,
            });
        }

        Ok(())
    }

    /// Reclaims load-command space by dropping LC_UUID, then empty
    /// linkedit-data commands.
    fn make_header_space(
        &mut self,
        cache: &mut DyldCache,
        ctx: &mut ExtractionContext<'_>,
        needed: u64,
    ) -> Result<()> {
        let mut bytes_saved = 0u64;
        let mut commands_to_remove: Vec<u64> = Vec::new();

        info!("Not enough header space, removing UUID command.");
        for entry in &ctx.macho.commands {
            if entry.cmd_id == LC_UUID {
                commands_to_remove.push(entry.offset);
                bytes_saved += entry.cmdsize as u64;
            }
        }

        if bytes_saved < needed {
            warn!("Not enough header space, removing empty linkedit data commands.");
            for entry in &ctx.macho.commands {
                if let LoadCommand::LinkeditData(cmd) = &entry.cmd {
                    if cmd.datasize == 0 {
                        commands_to_remove.push(entry.offset);
                        bytes_saved += entry.cmdsize as u64;
                        if bytes_saved >= needed {
                            break;
                        }
                    }
                }
            }
        }

        if bytes_saved < needed {
            return Err(ExtractError::InsufficientHeaderSpace {
                needed: needed - bytes_saved,
            });
        }

        // repack the surviving commands and rewrite the header
        let mut packed: Vec<u8> = Vec::new();
        for entry in &ctx.macho.commands {
            if commands_to_remove.contains(&entry.offset) {
                continue;
            }
            let bytes =
                cache.read_bytes(ctx.macho.file_index, entry.offset, entry.cmdsize as usize)?;
            packed.extend_from_slice(bytes);
        }

        let mut header = ctx.macho.header;
        header.ncmds -= commands_to_remove.len() as u32;
        header.sizeofcmds = packed.len() as u32;

        let commands_start = ctx.macho.file_offset + MachHeader64::SIZE as u64;
        cache.write_bytes(ctx.macho.file_index, commands_start, &packed)?;
        cache.write(ctx.macho.file_index, ctx.macho.file_offset, header)?;

        ctx.macho.reload(cache)?;
        Ok(())
    }

    /// Inserts the `__EXTRA_OBJC` segment command directly before the
    /// `__LINKEDIT` one.
    fn add_extra_data_segment(
        &mut self,
        cache: &mut DyldCache,
        ctx: &mut ExtractionContext<'_>,
    ) -> Result<()> {
        self.extra_segment.vmsize = self.extra_data.len() as u64;
        self.extra_segment.filesize = self.extra_data.len() as u64;

        let linkedit_cmd_off = ctx
            .macho
            .segment(b"__LINKEDIT")
            .ok_or_else(|| ExtractError::ContainerParse("image has no __LINKEDIT".into()))?
            .cmd_offset;

        // shift everything from the linkedit command to the end of the
        // load commands to make room
        let header_end = ctx.macho.header_end();
        let moved = cache
            .read_bytes(
                ctx.macho.file_index,
                linkedit_cmd_off,
                (header_end - linkedit_cmd_off) as usize,
            )?
            .to_vec();
        cache.write_bytes(
            ctx.macho.file_index,
            linkedit_cmd_off + SegmentCommand64::SIZE as u64,
            &moved,
        )?;
        cache.write(ctx.macho.file_index, linkedit_cmd_off, self.extra_segment)?;

        let mut header = ctx.macho.header;
        header.ncmds += 1;
        header.sizeofcmds += SegmentCommand64::SIZE as u32;
        cache.write(ctx.macho.file_index, ctx.macho.file_offset, header)?;

        ctx.macho.reload(cache)?;
        Ok(())
    }
}

/// Collects the indices of `ADD` instructions that consume the page
/// register set by an ADRP, starting at `start_idx`.
///
/// The walk follows unconditional branches, forks at conditional ones,
/// and ends at returns or when something writes the register. Register
/// operands are judged structurally: the low five bits name the first
/// operand of every shape this cares about, which makes stores look
/// like writes — deliberately conservative.
fn find_add_instructions(words: &[u32], start_idx: usize, adrp_reg: u32) -> BTreeSet<usize> {
    let mut adds = BTreeSet::new();
    let mut processed: HashSet<usize> = HashSet::new();
    let mut work = vec![start_idx];
    processed.insert(start_idx);

    while let Some(start) = work.pop() {
        let mut i = start;

        while i < words.len() {
            let w = words[i];

            // ADD (immediate, 64-bit) whose base is the ADRP register
            if w & 0xff80_0000 == 0x9100_0000 && (w >> 5) & 0x1f == adrp_reg {
                adds.insert(i);
            }

            // unconditional B: follow it
            if w & 0xfc00_0000 == 0x1400_0000 {
                let delta = sign_extend(u64::from(w & 0x03ff_ffff) << 2, 28) / 4;
                let target = i as i64 + delta;
                if target < 0 || target as usize >= words.len() {
                    break;
                }
                let target = target as usize;
                if !processed.insert(target) {
                    break;
                }
                i = target;
                continue;
            }

            // BL: a branch with a link; the scan does not model calls
            if w & 0xfc00_0000 == 0x9400_0000 {
                i += 1;
                continue;
            }

            // B.cond forks; its low bits encode the condition, not a
            // register
            if w & 0xff00_0010 == 0x5400_0000 {
                let delta = sign_extend(u64::from((w >> 5) & 0x7ffff), 19);
                fork(&mut work, &mut processed, words.len(), i as i64 + delta);
                i += 1;
                continue;
            }

            // CBZ/CBNZ forks, and testing the page register ends the
            // range
            if w & 0x7e00_0000 == 0x3400_0000 {
                let delta = sign_extend(u64::from((w >> 5) & 0x7ffff), 19);
                fork(&mut work, &mut processed, words.len(), i as i64 + delta);
                if w & 0x1f == adrp_reg {
                    break;
                }
                i += 1;
                continue;
            }

            // TBZ/TBNZ, same treatment
            if w & 0x7e00_0000 == 0x3600_0000 {
                let delta = sign_extend(u64::from((w >> 5) & 0x3fff), 14);
                fork(&mut work, &mut processed, words.len(), i as i64 + delta);
                if w & 0x1f == adrp_reg {
                    break;
                }
                i += 1;
                continue;
            }

            // RET / RETAA / RETAB end the range
            if w & 0xffff_fc1f == 0xd65f_0000 || w == 0xd65f_0bff || w == 0xd65f_0fff {
                break;
            }

            // register-pair loads and stores touch a second register
            if w & 0x3a00_0000 == 0x2800_0000 && (w >> 10) & 0x1f == adrp_reg {
                break;
            }

            // anything else that names the register in its first
            // operand slot counts as a write
            if w & 0x1f == adrp_reg {
                break;
            }

            i += 1;
        }
    }

    adds
}

fn fork(work: &mut Vec<usize>, processed: &mut HashSet<usize>, len: usize, target: i64) {
    if target >= 0 && (target as usize) < len && processed.insert(target as usize) {
        work.push(target as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S3: ADRP x16, #0 / ADD x16, x16, #0x10 with a selref slot at
    // 0x1_0000_1000 becomes ADRP x16, #0x1000 / LDR x16, [x16, #0].
    #[test]
    fn selector_pair_rewrites_to_a_load() {
        let adrp = 0x9000_0010u32; // ADRP x16, #0
        let add = 0x9100_4210u32; // ADD x16, x16, #0x10

        let selref = 0x1_0000_1000u64;
        let adrp_addr = 0x1_0000_0000u64;

        let new_adrp = retarget_adrp(adrp, adrp_addr, selref & !0xfff);
        let new_ldr = add_to_ldr(add, selref & 0xfff);

        assert_eq!(new_adrp, 0xb000_0010); // ADRP x16, #0x1000
        assert_eq!(new_ldr, 0xf940_0210); // LDR x16, [x16, #0]

        // and the rewritten pair resolves back to the selref slot
        assert_eq!(adrp_page_target(new_adrp, adrp_addr), selref & !0xfff);
    }

    #[test]
    fn retargeted_add_keeps_registers() {
        let add = 0x9100_4210u32; // ADD x16, x16, #0x10
        let new_add = retarget_add(add, 0x234);
        assert_eq!(new_add & 0x3ff, 0x210); // same Rd/Rn
        assert_eq!((new_add >> 10) & 0xfff, 0x234);
        assert_eq!(new_add & 0xffc0_0000, 0x9100_0000);
    }

    #[test]
    fn add_scan_matches_base_register() {
        let words = [
            0x9100_4210u32, // ADD x16, x16, #0x10  (base = x16)
            0x9100_4030u32, // ADD x16, x1, #0x10   (base = x1)
            0xd65f_03c0u32, // RET
        ];
        let adds = find_add_instructions(&words, 0, 16);
        assert_eq!(adds.into_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn add_scan_stops_at_register_writes() {
        let words = [
            0xaa01_03f0u32, // MOV x16, x1 (writes x16, orr alias)
            0x9100_4210u32, // ADD x16, x16, #0x10 — unreachable
        ];
        let adds = find_add_instructions(&words, 0, 16);
        assert!(adds.is_empty());
    }

    #[test]
    fn add_scan_follows_unconditional_branches() {
        let words = [
            0x1400_0002u32, // B +2 words
            0x9100_4210u32, // ADD (skipped over)
            0x9100_4210u32, // ADD x16, x16, #0x10 (branch target)
            0xd65f_03c0u32, // RET
        ];
        let adds = find_add_instructions(&words, 0, 16);
        assert_eq!(adds.into_iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn add_scan_forks_at_conditional_branches() {
        let words = [
            0x5400_0060u32, // B.EQ +3 words
            0x9100_4210u32, // ADD x16, x16, #0x10 (fallthrough)
            0xd65f_03c0u32, // RET
            0x9100_8210u32, // ADD x16, x16, #0x20 (branch target)
            0xd65f_03c0u32, // RET
        ];
        let adds = find_add_instructions(&words, 0, 16);
        assert_eq!(adds.into_iter().collect::<Vec<_>>(), vec![1, 3]);
    }
}
