//! Re-lays-out the `__LINKEDIT` segment as one contiguous run of
//! sub-blobs.
//!
//! The builder snapshots every LINKEDIT blob the load commands point
//! at; converters mutate the snapshots and then rebuild, either in
//! place inside the cache view or — during offset layout — only
//! re-pointing the load commands at their final output offsets.
//!
//! Blob order: rebase, weak-bind, exports, bind, lazy-bind, symbol
//! table, function-starts, data-in-code (and any other linkedit-data
//! payloads), indirect-symbol table, string pool. Every blob start is
//! padded to 8 bytes. The string pool deliberately sits last so late
//! passes can append to it without moving anything else.

use crate::cache::DyldCache;
use crate::error::{ExtractError, Result};
use crate::macho::constants::{LC_DATA_IN_CODE, LC_FUNCTION_STARTS};
use crate::macho::structs::{
    DyldInfoCommand, DysymtabCommand, LinkeditDataCommand, Nlist64, SegmentCommand64,
    SymtabCommand,
};
use crate::macho::{LoadCommand, MachO};

pub struct DyldInfoSlot {
    pub cmd_offset: u64,
    pub cmd: DyldInfoCommand,
    pub rebase: Vec<u8>,
    pub bind: Vec<u8>,
    pub weak_bind: Vec<u8>,
    pub lazy_bind: Vec<u8>,
    pub export: Vec<u8>,
}

pub struct SymtabSlot {
    pub cmd_offset: u64,
    pub cmd: SymtabCommand,
    pub symbols: Vec<u8>,
    pub strings: Vec<u8>,
}

impl SymtabSlot {
    pub fn nsyms(&self) -> u32 {
        (self.symbols.len() / Nlist64::SIZE) as u32
    }
}

pub struct DysymtabSlot {
    pub cmd_offset: u64,
    pub cmd: DysymtabCommand,
    pub indirect: Vec<u8>,
}

pub struct LinkeditDataSlot {
    pub cmd_offset: u64,
    pub cmd_id: u32,
    pub cmd: LinkeditDataCommand,
    pub data: Vec<u8>,
}

pub struct LinkeditBuilder {
    /// Index of the cache file backing `__LINKEDIT`.
    pub linkedit_file: usize,
    /// File offset of the segment command inside the header's file.
    linkedit_cmd_offset: u64,
    linkedit_seg: SegmentCommand64,

    pub dyld_info: Option<DyldInfoSlot>,
    pub symtab: Option<SymtabSlot>,
    pub dysymtab: Option<DysymtabSlot>,
    pub linkedit_data: Vec<LinkeditDataSlot>,
}

impl LinkeditBuilder {
    pub fn new(cache: &DyldCache, macho: &MachO) -> Result<Self> {
        let linkedit = macho
            .segment(b"__LINKEDIT")
            .ok_or_else(|| ExtractError::ContainerParse("image has no __LINKEDIT".into()))?;
        let (linkedit_file, _) = cache
            .resolve_addr(linkedit.seg.vmaddr)
            .ok_or(ExtractError::MappingMiss(linkedit.seg.vmaddr))?;

        let mut builder = LinkeditBuilder {
            linkedit_file,
            linkedit_cmd_offset: linkedit.cmd_offset,
            linkedit_seg: linkedit.seg,
            dyld_info: None,
            symtab: None,
            dysymtab: None,
            linkedit_data: Vec::new(),
        };

        let blob = |offset: u32, size: u32| -> Result<Vec<u8>> {
            if size == 0 {
                return Ok(Vec::new());
            }
            Ok(cache
                .read_bytes(linkedit_file, offset as u64, size as usize)?
                .to_vec())
        };

        for entry in &macho.commands {
            match &entry.cmd {
                LoadCommand::DyldInfo(cmd) => {
                    builder.dyld_info = Some(DyldInfoSlot {
                        cmd_offset: entry.offset,
                        cmd: *cmd,
                        rebase: blob(cmd.rebase_off, cmd.rebase_size)?,
                        bind: blob(cmd.bind_off, cmd.bind_size)?,
                        weak_bind: blob(cmd.weak_bind_off, cmd.weak_bind_size)?,
                        lazy_bind: blob(cmd.lazy_bind_off, cmd.lazy_bind_size)?,
                        export: blob(cmd.export_off, cmd.export_size)?,
                    });
                }
                LoadCommand::Symtab(cmd) => {
                    builder.symtab = Some(SymtabSlot {
                        cmd_offset: entry.offset,
                        cmd: *cmd,
                        symbols: blob(cmd.symoff, cmd.nsyms * Nlist64::SIZE as u32)?,
                        strings: blob(cmd.stroff, cmd.strsize)?,
                    });
                }
                LoadCommand::Dysymtab(cmd) => {
                    builder.dysymtab = Some(DysymtabSlot {
                        cmd_offset: entry.offset,
                        cmd: *cmd,
                        indirect: blob(cmd.indirectsymoff, cmd.nindirectsyms * 4)?,
                    });
                }
                LoadCommand::LinkeditData(cmd) => {
                    builder.linkedit_data.push(LinkeditDataSlot {
                        cmd_offset: entry.offset,
                        cmd_id: entry.cmd_id,
                        cmd: *cmd,
                        data: blob(cmd.dataoff, cmd.datasize)?,
                    });
                }
                _ => {}
            }
        }

        Ok(builder)
    }

    /// Rebuilds the segment with its blobs at `new_offset` inside the
    /// linkedit-backing file and re-parses the image.
    pub fn rebuild_in_place(
        &mut self,
        cache: &mut DyldCache,
        macho: &mut MachO,
        new_offset: u64,
    ) -> Result<u64> {
        self.build(cache, macho, new_offset, true)
    }

    /// Re-points every LINKEDIT-related load command at the offsets the
    /// blobs will occupy in the output file, without copying any bytes.
    /// Used by the offset layouter, whose write procedure copies the
    /// blobs from their current cache location.
    pub fn relayout_for_output(
        &mut self,
        cache: &mut DyldCache,
        macho: &mut MachO,
        new_offset: u64,
    ) -> Result<u64> {
        self.build(cache, macho, new_offset, false)
    }

    fn build(
        &mut self,
        cache: &mut DyldCache,
        macho: &mut MachO,
        new_offset: u64,
        write_bytes: bool,
    ) -> Result<u64> {
        let mut buffer: Vec<u8> = Vec::new();

        // pads the buffer to the next 8-byte boundary and returns the
        // blob's absolute offset
        fn push_blob(buffer: &mut Vec<u8>, base: u64, data: &[u8]) -> u64 {
            const ALIGN: usize = 8;
            let pad = (ALIGN - buffer.len() % ALIGN) % ALIGN;
            buffer.resize(buffer.len() + pad, 0);

            let offset = base + buffer.len() as u64;
            buffer.extend_from_slice(data);
            offset
        }

        if let Some(info) = &mut self.dyld_info {
            let offset = push_blob(&mut buffer, new_offset, &info.rebase);
            info.cmd.rebase_size = info.rebase.len() as u32;
            info.cmd.rebase_off = if info.rebase.is_empty() { 0 } else { offset as u32 };

            let offset = push_blob(&mut buffer, new_offset, &info.weak_bind);
            info.cmd.weak_bind_size = info.weak_bind.len() as u32;
            info.cmd.weak_bind_off = if info.weak_bind.is_empty() { 0 } else { offset as u32 };

            let offset = push_blob(&mut buffer, new_offset, &info.export);
            info.cmd.export_size = info.export.len() as u32;
            info.cmd.export_off = if info.export.is_empty() { 0 } else { offset as u32 };

            let offset = push_blob(&mut buffer, new_offset, &info.bind);
            info.cmd.bind_size = info.bind.len() as u32;
            info.cmd.bind_off = if info.bind.is_empty() { 0 } else { offset as u32 };

            let offset = push_blob(&mut buffer, new_offset, &info.lazy_bind);
            info.cmd.lazy_bind_size = info.lazy_bind.len() as u32;
            info.cmd.lazy_bind_off = if info.lazy_bind.is_empty() { 0 } else { offset as u32 };
        }

        if let Some(symtab) = &mut self.symtab {
            let offset = push_blob(&mut buffer, new_offset, &symtab.symbols);
            symtab.cmd.nsyms = symtab.nsyms();
            symtab.cmd.symoff = if symtab.symbols.is_empty() { 0 } else { offset as u32 };
        }

        // function-starts and data-in-code first, then the rest of the
        // linkedit-data payloads in command order
        let mut data_order: Vec<usize> = Vec::new();
        for wanted in [LC_FUNCTION_STARTS, LC_DATA_IN_CODE] {
            if let Some(pos) = self.linkedit_data.iter().position(|s| s.cmd_id == wanted) {
                data_order.push(pos);
            }
        }
        for (pos, _) in self.linkedit_data.iter().enumerate() {
            if !data_order.contains(&pos) {
                data_order.push(pos);
            }
        }
        for pos in data_order {
            let slot = &mut self.linkedit_data[pos];
            let offset = push_blob(&mut buffer, new_offset, &slot.data);
            slot.cmd.datasize = slot.data.len() as u32;
            // the offset is recorded even for empty payloads
            slot.cmd.dataoff = offset as u32;
        }

        if let Some(dysymtab) = &mut self.dysymtab {
            let offset = push_blob(&mut buffer, new_offset, &dysymtab.indirect);
            dysymtab.cmd.nindirectsyms = (dysymtab.indirect.len() / 4) as u32;
            dysymtab.cmd.indirectsymoff = if dysymtab.indirect.is_empty() {
                0
            } else {
                offset as u32
            };
        }

        if let Some(symtab) = &mut self.symtab {
            let offset = push_blob(&mut buffer, new_offset, &symtab.strings);
            symtab.cmd.strsize = symtab.strings.len() as u32;
            symtab.cmd.stroff = if symtab.strings.is_empty() { 0 } else { offset as u32 };
        }

        let total = buffer.len() as u64;

        if write_bytes {
            cache.write_bytes(self.linkedit_file, new_offset, &buffer)?;
        }

        // write the updated commands back and re-parse
        let header_file = macho.file_index;
        if let Some(info) = &self.dyld_info {
            cache.write(header_file, info.cmd_offset, info.cmd)?;
        }
        if let Some(symtab) = &self.symtab {
            cache.write(header_file, symtab.cmd_offset, symtab.cmd)?;
        }
        if let Some(dysymtab) = &self.dysymtab {
            cache.write(header_file, dysymtab.cmd_offset, dysymtab.cmd)?;
        }
        for slot in &self.linkedit_data {
            cache.write(header_file, slot.cmd_offset, slot.cmd)?;
        }

        self.linkedit_seg.fileoff = new_offset;
        self.linkedit_seg.filesize = total;
        self.linkedit_seg.vmsize = total;
        cache.write(header_file, self.linkedit_cmd_offset, self.linkedit_seg)?;

        macho.reload(cache)?;
        Ok(total)
    }
}
