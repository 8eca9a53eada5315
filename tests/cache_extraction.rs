//! Drives the whole pipeline against a synthetic single-image cache:
//! open, list, extract, and write, then checks the output file's
//! pointers and layout.

use std::io::{Cursor, Write};

use scroll::{Pread, Pwrite};

use dyldex::cache::structs::{MappingAndSlideInfo, MappingInfo, SlideInfo3};
use dyldex::macho::constants::*;
use dyldex::macho::structs::*;
use dyldex::{DyldCache, ExtractorOptions, NullStatusReporter};

const BASE: u64 = 0x1_8000_0000;
const IMAGE_OFF: u64 = 0x1000;

// cache-file layout of the fixture
const MAPPINGS_OFF: usize = 0x1c8; // directly after the header
const MAPPINGS_SLIDE_OFF: usize = 0x300;
const IMAGES_OFF: usize = 0x400;
const PATH_OFF: usize = 0x440;
const TEXT_SECT_OFF: u64 = 0x2000;
const DATA_OFF: u64 = 0x4000;
const LINKEDIT_OFF: u64 = 0x8000;
const SLIDE_INFO_OFF: usize = 0xa000;

fn build_cache_file() -> Vec<u8> {
    let mut file = vec![0u8; 0x10000];

    // --- cache header ---
    // field presence is gated on mapping_offset; placing the mapping
    // table directly after the header marks every field present
    file[..15].copy_from_slice(b"dyld_v1  arm64e");
    let w32 = |file: &mut Vec<u8>, off: usize, v: u32| {
        file.pwrite_with(v, off, scroll::LE).unwrap();
    };
    let w64 = |file: &mut Vec<u8>, off: usize, v: u64| {
        file.pwrite_with(v, off, scroll::LE).unwrap();
    };
    w32(&mut file, 0x10, MAPPINGS_OFF as u32); // mapping_offset
    w32(&mut file, 0x14, 3); // mapping_count
    w64(&mut file, 0x68, 1); // cache_type
    w64(&mut file, 0xe0, BASE); // shared_region_start
    w64(&mut file, 0xe8, 0x10000); // shared_region_size
    w32(&mut file, 0x138, MAPPINGS_SLIDE_OFF as u32); // mapping_with_slide_offset
    w32(&mut file, 0x13c, 3); // mapping_with_slide_count
    w32(&mut file, 0x1c0, IMAGES_OFF as u32); // images_offset
    w32(&mut file, 0x1c4, 1); // images_count

    // --- mappings: text, data (slid), linkedit ---
    let mappings = [
        (BASE, 0x4000u64, 0u64, 5u32, 0u64),
        (BASE + DATA_OFF, 0x4000, DATA_OFF, 3, SLIDE_INFO_OFF as u64),
        (BASE + LINKEDIT_OFF, 0x8000, LINKEDIT_OFF, 1, 0),
    ];
    for (i, &(address, size, file_offset, prot, slide_off)) in mappings.iter().enumerate() {
        file.pwrite_with(
            MappingInfo {
                address,
                size,
                file_offset,
                max_prot: prot,
                init_prot: prot,
            },
            MAPPINGS_OFF + i * MappingInfo::SIZE,
            scroll::LE,
        )
        .unwrap();
        file.pwrite_with(
            MappingAndSlideInfo {
                address,
                size,
                file_offset,
                slide_info_file_offset: slide_off,
                slide_info_file_size: if slide_off != 0 { 0x100 } else { 0 },
                flags: 0,
                max_prot: prot,
                init_prot: prot,
            },
            MAPPINGS_SLIDE_OFF + i * MappingAndSlideInfo::SIZE,
            scroll::LE,
        )
        .unwrap();
    }

    // --- image table ---
    file.pwrite_with(
        dyldex::cache::structs::ImageInfo {
            address: BASE + IMAGE_OFF,
            mod_time: 0,
            inode: 0,
            path_file_offset: PATH_OFF as u32,
            pad: 0,
        },
        IMAGES_OFF,
        scroll::LE,
    )
    .unwrap();
    file[PATH_OFF..PATH_OFF + 23].copy_from_slice(b"/usr/lib/libdemo.dylib\0");

    // --- the image itself ---
    let sizeofcmds = (SegmentCommand64::SIZE + Section64::SIZE) * 2
        + SegmentCommand64::SIZE
        + SymtabCommand::SIZE
        + DysymtabCommand::SIZE
        + DyldInfoCommand::SIZE;
    file.pwrite_with(
        MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: 0x0100_000c, // arm64
            cpusubtype: 0,
            filetype: 6, // MH_DYLIB
            ncmds: 6,
            sizeofcmds: sizeofcmds as u32,
            flags: 0,
            reserved: 0,
        },
        IMAGE_OFF as usize,
        scroll::LE,
    )
    .unwrap();

    let mut cmd_off = IMAGE_OFF as usize + MachHeader64::SIZE;
    let mut write_segment = |file: &mut Vec<u8>, seg: SegmentCommand64, sects: &[Section64]| {
        file.pwrite_with(seg, cmd_off, scroll::LE).unwrap();
        for (i, &sect) in sects.iter().enumerate() {
            file.pwrite_with(
                sect,
                cmd_off + SegmentCommand64::SIZE + i * Section64::SIZE,
                scroll::LE,
            )
            .unwrap();
        }
        cmd_off += seg.cmdsize as usize;
    };

    write_segment(
        &mut file,
        SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: make_name16(b"__TEXT"),
            vmaddr: BASE + IMAGE_OFF,
            vmsize: 0x3000,
            fileoff: IMAGE_OFF,
            filesize: 0x3000,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            flags: 0,
        },
        &[Section64 {
            sectname: make_name16(b"__text"),
            segname: make_name16(b"__TEXT"),
            addr: BASE + TEXT_SECT_OFF,
            size: 0x20,
            offset: TEXT_SECT_OFF as u32,
            align: 2,
            reloff: 0,
            nreloc: 0,
            flags: 0x8000_0400, // S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }],
    );
    write_segment(
        &mut file,
        SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: make_name16(b"__DATA"),
            vmaddr: BASE + DATA_OFF,
            vmsize: 0x4000,
            fileoff: DATA_OFF,
            filesize: 0x4000,
            maxprot: 3,
            initprot: 3,
            nsects: 1,
            flags: 0,
        },
        &[Section64 {
            sectname: make_name16(b"__data"),
            segname: make_name16(b"__DATA"),
            addr: BASE + DATA_OFF,
            size: 0x10,
            offset: DATA_OFF as u32,
            align: 3,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }],
    );
    write_segment(
        &mut file,
        SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: make_name16(b"__LINKEDIT"),
            vmaddr: BASE + LINKEDIT_OFF,
            vmsize: 0x1000,
            fileoff: LINKEDIT_OFF,
            filesize: 0x1000,
            maxprot: 1,
            initprot: 1,
            nsects: 0,
            flags: 0,
        },
        &[],
    );

    file.pwrite_with(
        SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: 0,
            nsyms: 0,
            stroff: 0,
            strsize: 0,
        },
        cmd_off,
        scroll::LE,
    )
    .unwrap();
    cmd_off += SymtabCommand::SIZE;

    let dysymtab = DysymtabCommand {
        cmd: LC_DYSYMTAB,
        cmdsize: DysymtabCommand::SIZE as u32,
        ilocalsym: 0,
        nlocalsym: 0,
        iextdefsym: 0,
        nextdefsym: 0,
        iundefsym: 0,
        nundefsym: 0,
        tocoff: 0,
        ntoc: 0,
        modtaboff: 0,
        nmodtab: 0,
        extrefsymoff: 0,
        nextrefsyms: 0,
        indirectsymoff: 0,
        nindirectsyms: 0,
        extreloff: 0,
        nextrel: 0,
        locreloff: 0,
        nlocrel: 0,
    };
    file.pwrite_with(dysymtab, cmd_off, scroll::LE).unwrap();
    cmd_off += DysymtabCommand::SIZE;

    file.pwrite_with(
        DyldInfoCommand {
            cmd: LC_DYLD_INFO_ONLY,
            cmdsize: DyldInfoCommand::SIZE as u32,
            rebase_off: 0,
            rebase_size: 0,
            bind_off: 0,
            bind_size: 0,
            weak_bind_off: 0,
            weak_bind_size: 0,
            lazy_bind_off: 0,
            lazy_bind_size: 0,
            export_off: 0,
            export_size: 0,
        },
        cmd_off,
        scroll::LE,
    )
    .unwrap();

    // --- __text: NOPs ---
    for i in 0..8 {
        file.pwrite_with(0xd503_201fu32, TEXT_SECT_OFF as usize + i * 4, scroll::LE)
            .unwrap();
    }

    // --- __data: a v3 pointer chain (plain slot, then auth slot) ---
    let plain = 0x1234u64 | (1u64 << 51); // value 0x1234, next in 8 bytes
    let auth = 0x8000_0000_0000_5678u64; // authenticated, offset 0x5678
    file.pwrite_with(plain, DATA_OFF as usize, scroll::LE).unwrap();
    file.pwrite_with(auth, DATA_OFF as usize + 8, scroll::LE).unwrap();

    // --- slide info v3 covering the data mapping ---
    file.pwrite_with(
        SlideInfo3 {
            version: 3,
            page_size: 0x4000,
            page_starts_count: 1,
            pad: 0,
            auth_value_add: BASE,
        },
        SLIDE_INFO_OFF,
        scroll::LE,
    )
    .unwrap();
    // first pointer at page offset 0
    file.pwrite_with(0u16, SLIDE_INFO_OFF + SlideInfo3::SIZE, scroll::LE)
        .unwrap();

    file
}

fn write_fixture() -> tempfile::NamedTempFile {
    let mut fixture = tempfile::NamedTempFile::new().unwrap();
    fixture.write_all(&build_cache_file()).unwrap();
    fixture.flush().unwrap();
    fixture
}

/// Replays the generated rebase opcodes against the segments parsed
/// out of the output file.
fn replay_rebase(stream: &[u8], segments: &[SegmentCommand64]) -> Vec<u64> {
    let mut visited = Vec::new();
    let mut segment = 0usize;
    let mut offset = 0u64;

    let mut pos = 0;
    loop {
        let byte = stream[pos];
        pos += 1;
        match byte & REBASE_OPCODE_MASK {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => {}
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment = (byte & REBASE_IMMEDIATE_MASK) as usize;
                let (value, next) = dyldex::leb128::decode_uleb128(stream, pos).unwrap();
                offset = value;
                pos = next;
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..byte & REBASE_IMMEDIATE_MASK {
                    visited.push(segments[segment].vmaddr + offset);
                    offset += 8;
                }
            }
            other => panic!("unexpected rebase opcode {other:#x}"),
        }
    }
    visited
}

fn parse_output(output: &[u8]) -> (Vec<SegmentCommand64>, DyldInfoCommand) {
    let header: MachHeader64 = output.pread_with(0, scroll::LE).unwrap();
    assert_eq!(header.magic, MH_MAGIC_64);

    let mut segments = Vec::new();
    let mut dyld_info = None;

    let mut cmd_off = MachHeader64::SIZE;
    for _ in 0..header.ncmds {
        let base: LoadCommandBase = output.pread_with(cmd_off, scroll::LE).unwrap();
        match base.cmd {
            LC_SEGMENT_64 => {
                segments.push(output.pread_with(cmd_off, scroll::LE).unwrap());
            }
            LC_DYLD_INFO_ONLY => {
                dyld_info = Some(output.pread_with(cmd_off, scroll::LE).unwrap());
            }
            _ => {}
        }
        cmd_off += base.cmdsize as usize;
    }

    (segments, dyld_info.expect("output kept its dyld info command"))
}

#[test]
fn open_lists_the_image_table() {
    let fixture = write_fixture();
    let cache = DyldCache::open(fixture.path()).unwrap();

    assert_eq!(cache.mappings.len(), 3);
    assert_eq!(
        cache.list_images(),
        vec![(0, "libdemo.dylib".to_owned(), "/usr/lib/libdemo.dylib".to_owned())]
    );
    assert_eq!(cache.image_index_by_name("libdemo.dylib"), Some(0));

    // the data mapping resolves into the main file
    assert_eq!(cache.resolve_addr(BASE + DATA_OFF), Some((0, DATA_OFF)));
    assert_eq!(cache.resolve_addr(0x2_0000_0000), None);
}

#[test]
fn open_rejects_non_cache_files() {
    let mut fixture = tempfile::NamedTempFile::new().unwrap();
    fixture.write_all(&[0u8; 0x1000]).unwrap();
    assert!(DyldCache::open(fixture.path()).is_err());
}

#[test]
fn extraction_round_trips_the_fixture() {
    let fixture = write_fixture();
    let mut cache = DyldCache::open(fixture.path()).unwrap();

    let mut status = NullStatusReporter;
    let program =
        dyldex::extract_image(&mut cache, 0, ExtractorOptions::default(), &mut status).unwrap();

    let mut out = Cursor::new(Vec::new());
    program.write_to(&cache, &mut out).unwrap();
    let output = out.into_inner();

    let (segments, dyld_info) = parse_output(&output);
    assert_eq!(segments.len(), 3);

    // P6: __TEXT at offset zero, packed without overlap, __LINKEDIT last
    assert_eq!(segments[0].name(), b"__TEXT");
    assert_eq!(segments[0].fileoff, 0);
    for pair in segments.windows(2) {
        assert!(pair[0].fileoff + pair[0].filesize <= pair[1].fileoff);
    }
    assert_eq!(segments.last().unwrap().name(), b"__LINKEDIT");

    // the slid pointers landed in the output
    let data_seg = &segments[1];
    assert_eq!(data_seg.name(), b"__DATA");
    let slot0: u64 = output
        .pread_with(data_seg.fileoff as usize, scroll::LE)
        .unwrap();
    let slot1: u64 = output
        .pread_with(data_seg.fileoff as usize + 8, scroll::LE)
        .unwrap();
    assert_eq!(slot0, 0x1234);
    assert_eq!(slot1, BASE + 0x5678);

    // P1: replaying the rebase opcodes visits exactly the two slots
    assert_ne!(dyld_info.rebase_size, 0);
    let rebase = &output
        [dyld_info.rebase_off as usize..(dyld_info.rebase_off + dyld_info.rebase_size) as usize];
    let visited = replay_rebase(rebase, &segments);
    assert_eq!(visited, vec![BASE + DATA_OFF, BASE + DATA_OFF + 8]);

    // the input file on disk is untouched
    let on_disk = std::fs::read(fixture.path()).unwrap();
    assert_eq!(on_disk, build_cache_file());
}

#[test]
fn phases_can_be_disabled() {
    let fixture = write_fixture();
    let mut cache = DyldCache::open(fixture.path()).unwrap();

    let options = ExtractorOptions {
        fix_slide: true,
        optimize_linkedit: false,
        fix_stubs: false,
        fix_objc: false,
        generate_rebase: false,
        layout_offsets: false,
    };

    let mut status = NullStatusReporter;
    let program = dyldex::extract_image(&mut cache, 0, options, &mut status).unwrap();

    // no layout pass means no copy procedures, but the header is
    // still snapshotted
    assert!(program.procedures.is_empty());
    assert!(!program.header.is_empty());

    // the slide pass still ran against the in-memory view
    let slot0: u64 = cache
        .read(0, DATA_OFF)
        .unwrap();
    assert_eq!(slot0, 0x1234);
}
