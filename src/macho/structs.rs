//! On-disk Mach-O structures, from usr/include/mach-o/loader.h and
//! usr/include/mach-o/nlist.h.
//!
//! Only the commands whose fields the extractor reads or rewrites get a
//! full definition; everything else is carried as an opaque
//! [`LoadCommandBase`] plus its raw bytes.

use scroll::{Pread, Pwrite, SizeWith};

/// Returns the name without the NUL padding of a fixed 16-byte
/// segment/section name field.
pub fn name16(raw: &[u8; 16]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..end]
}

/// Builds a fixed 16-byte name field from a short name.
pub fn make_name16(name: &[u8]) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[..name.len()].copy_from_slice(name);
    raw
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct MachHeader64 {
    pub magic: u32,      // mach magic number identifier
    pub cputype: i32,    // cpu_type_t cpu specifier
    pub cpusubtype: i32, // cpu_subtype_t machine specifier
    pub filetype: u32,   // type of file
    pub ncmds: u32,      // number of load commands
    pub sizeofcmds: u32, // size of all the load commands
    pub flags: u32,
    pub reserved: u32,
}

impl MachHeader64 {
    pub const SIZE: usize = 32;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct LoadCommandBase {
    pub cmd: u32,     // type of load command
    pub cmdsize: u32, // total size of the command in bytes
}

impl LoadCommandBase {
    pub const SIZE: usize = 8;
}

/*
 * The 64-bit segment load command indicates that a part of this file is to be
 * mapped into a 64-bit task's address space.  If the 64-bit segment has
 * sections then section_64 structures directly follow the 64-bit segment
 * command and their size is reflected in cmdsize.
 */
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16], // segment name
    pub vmaddr: u64,       // memory address of this segment
    pub vmsize: u64,       // memory size of this segment
    pub fileoff: u64,      // file offset of this segment
    pub filesize: u64,     // amount to map from the file
    pub maxprot: i32,      // maximum VM protection
    pub initprot: i32,     // initial VM protection
    pub nsects: u32,       // number of sections in segment
    pub flags: u32,
}

impl SegmentCommand64 {
    pub const SIZE: usize = 72;

    pub fn name(&self) -> &[u8] {
        name16(&self.segname)
    }

    pub fn contains_addr(&self, vmaddr: u64) -> bool {
        vmaddr >= self.vmaddr && vmaddr < self.vmaddr + self.vmsize
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct Section64 {
    pub sectname: [u8; 16], // name of this section
    pub segname: [u8; 16],  // segment this section goes in
    pub addr: u64,          // memory address of this section
    pub size: u64,          // size in bytes of this section
    pub offset: u32,        // file offset of this section
    pub align: u32,         // section alignment (power of 2)
    pub reloff: u32,        // file offset of relocation entries
    pub nreloc: u32,        // number of relocation entries
    pub flags: u32,         // flags (section type and attributes)
    pub reserved1: u32,     // reserved (for offset or index)
    pub reserved2: u32,     // reserved (for count or sizeof)
    pub reserved3: u32,     // reserved
}

impl Section64 {
    pub const SIZE: usize = 80;

    pub fn name(&self) -> &[u8] {
        name16(&self.sectname)
    }

    pub fn section_type(&self) -> u32 {
        self.flags & super::constants::SECTION_TYPE
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,  // symbol table offset
    pub nsyms: u32,   // number of symbol table entries
    pub stroff: u32,  // string table offset
    pub strsize: u32, // string table size in bytes
}

impl SymtabCommand {
    pub const SIZE: usize = 24;
}

/*
 * This is the second set of the symbolic information which is used to support
 * the data structures for the dynamically link editor.  The symbol table is
 * grouped into three ranges: local symbols, defined external symbols, and
 * undefined external symbols.
 */
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct DysymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub ilocalsym: u32,      // index to local symbols
    pub nlocalsym: u32,      // number of local symbols
    pub iextdefsym: u32,     // index to externally defined symbols
    pub nextdefsym: u32,     // number of externally defined symbols
    pub iundefsym: u32,      // index to undefined symbols
    pub nundefsym: u32,      // number of undefined symbols
    pub tocoff: u32,         // file offset to table of contents
    pub ntoc: u32,           // number of entries in table of contents
    pub modtaboff: u32,      // file offset to module table
    pub nmodtab: u32,        // number of module table entries
    pub extrefsymoff: u32,   // offset to referenced symbol table
    pub nextrefsyms: u32,    // number of referenced symbol table entries
    pub indirectsymoff: u32, // file offset to the indirect symbol table
    pub nindirectsyms: u32,  // number of indirect symbol table entries
    pub extreloff: u32,      // offset to external relocation entries
    pub nextrel: u32,        // number of external relocation entries
    pub locreloff: u32,      // offset to local relocation entries
    pub nlocrel: u32,        // number of local relocation entries
}

impl DysymtabCommand {
    pub const SIZE: usize = 80;
}

/*
 * The dyld_info_command contains the file offsets and sizes of the new
 * compressed form of the information dyld needs to load the image.
 */
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct DyldInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,     // file offset to rebase info
    pub rebase_size: u32,    // size of rebase info
    pub bind_off: u32,       // file offset to binding info
    pub bind_size: u32,      // size of binding info
    pub weak_bind_off: u32,  // file offset to weak binding info
    pub weak_bind_size: u32, // size of weak binding info
    pub lazy_bind_off: u32,  // file offset to lazy binding info
    pub lazy_bind_size: u32, // size of lazy binding info
    pub export_off: u32,     // file offset to export info
    pub export_size: u32,    // size of export info
}

impl DyldInfoCommand {
    pub const SIZE: usize = 48;
}

/*
 * The linkedit_data_command contains the offsets and sizes of a blob
 * of data in the __LINKEDIT segment.
 */
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,  // file offset of data in __LINKEDIT segment
    pub datasize: u32, // file size of data in __LINKEDIT segment
}

impl LinkeditDataCommand {
    pub const SIZE: usize = 16;
}

/*
 * Dynamically linked shared libraries are identified by the pathname and
 * the compatibility version number.  The path name is stored after the
 * fixed-size part of the command; `name_offset` is relative to the start
 * of the load command.
 */
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct DylibCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub name_offset: u32, // offset from the load command start to the pathname
    pub timestamp: u32,   // library's build time stamp
    pub current_version: u32,
    pub compatibility_version: u32,
}

impl DylibCommand {
    pub const SIZE: usize = 24;
}

/// The uuid load command contains a single 128-bit unique random number
/// that identifies an object produced by the static link editor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct UuidCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub uuid: [u8; 16],
}

impl UuidCommand {
    pub const SIZE: usize = 24;
}

/// An entry in the symbol table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct Nlist64 {
    pub n_strx: u32, // index into the string table
    pub n_type: u8,  // type flag
    pub n_sect: u8,  // section number or NO_SECT
    pub n_desc: u16, // see <mach-o/stab.h>
    pub n_value: u64, // value of this symbol (or stab offset)
}

impl Nlist64 {
    pub const SIZE: usize = 16;
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::{Pread as _, Pwrite as _};

    #[test]
    fn segment_round_trip() {
        let seg = SegmentCommand64 {
            cmd: super::super::constants::LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: make_name16(b"__TEXT"),
            vmaddr: 0x1_8000_0000,
            vmsize: 0x4000,
            fileoff: 0,
            filesize: 0x4000,
            maxprot: 5,
            initprot: 5,
            nsects: 0,
            flags: 0,
        };

        let mut buf = [0u8; SegmentCommand64::SIZE];
        buf.pwrite_with(seg, 0, scroll::LE).unwrap();

        let parsed: SegmentCommand64 = buf.pread_with(0, scroll::LE).unwrap();
        assert_eq!(parsed.name(), b"__TEXT");
        assert_eq!(parsed.vmaddr, 0x1_8000_0000);
        assert!(parsed.contains_addr(0x1_8000_3fff));
        assert!(!parsed.contains_addr(0x1_8000_4000));
    }

    #[test]
    fn nlist_layout() {
        let entry = Nlist64 {
            n_strx: 0x11223344,
            n_type: 0xe,
            n_sect: 1,
            n_desc: 0,
            n_value: 0x1_8000_1000,
        };

        let mut buf = [0u8; Nlist64::SIZE];
        buf.pwrite_with(entry, 0, scroll::LE).unwrap();
        assert_eq!(&buf[0..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(buf[4], 0xe);
    }
}
