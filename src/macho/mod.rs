//! A mutable view of one 64-bit Mach-O image inside the cache.
//!
//! The image's bytes stay inside the (copy-on-write) cache files; this
//! container parses the header and load commands at a given offset and
//! remembers where every command lives so converters can rewrite a
//! command in place and re-parse.

pub mod constants;
pub mod structs;
pub mod trie;

use crate::cache::DyldCache;
use crate::error::{ExtractError, Result};
use constants::*;
use structs::*;

#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// File offset of the section_64 record inside the load commands.
    pub cmd_offset: u64,
    pub sect: Section64,
}

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// File offset of the segment_command_64 record.
    pub cmd_offset: u64,
    pub seg: SegmentCommand64,
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    pub fn name(&self) -> &[u8] {
        self.seg.name()
    }

    pub fn section(&self, name: &[u8]) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.sect.name() == name)
    }
}

#[derive(Debug, Clone)]
pub enum LoadCommand {
    Segment64(SegmentInfo),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    DyldInfo(DyldInfoCommand),
    LinkeditData(LinkeditDataCommand),
    Dylib(DylibCommand),
    Uuid(UuidCommand),
    /// A command the extractor carries but never looks into.
    Other(LoadCommandBase),
}

#[derive(Debug, Clone)]
pub struct CommandEntry {
    /// File offset of the command.
    pub offset: u64,
    pub cmd_id: u32,
    pub cmdsize: u32,
    pub cmd: LoadCommand,
}

pub struct MachO {
    pub file_index: usize,
    pub file_offset: u64,
    pub header: MachHeader64,
    pub commands: Vec<CommandEntry>,
}

impl MachO {
    pub fn parse(cache: &DyldCache, file_index: usize, file_offset: u64) -> Result<Self> {
        let header: MachHeader64 = cache.read(file_index, file_offset)?;

        match header.magic {
            MH_MAGIC_64 => {}
            MH_MAGIC | MH_CIGAM | MH_CIGAM_64 => {
                return Err(ExtractError::ContainerParse(format!(
                    "unsupported Mach-O magic {:#x} (only little-endian 64-bit is handled)",
                    header.magic
                )));
            }
            other => {
                return Err(ExtractError::ContainerParse(format!(
                    "bad Mach-O magic {other:#x}"
                )));
            }
        }

        let mut macho = MachO {
            file_index,
            file_offset,
            header,
            commands: Vec::new(),
        };
        macho.parse_load_commands(cache)?;
        Ok(macho)
    }

    /// Re-parses the header and load commands after a structural
    /// mutation. `ncmds`/`sizeofcmds` always describe the bytes on
    /// file, so this is the only way state stays coherent.
    pub fn reload(&mut self, cache: &DyldCache) -> Result<()> {
        self.header = cache.read(self.file_index, self.file_offset)?;
        self.parse_load_commands(cache)
    }

    fn parse_load_commands(&mut self, cache: &DyldCache) -> Result<()> {
        self.commands.clear();

        let mut cmd_off = self.file_offset + MachHeader64::SIZE as u64;
        let commands_end = cmd_off + self.header.sizeofcmds as u64;

        for _ in 0..self.header.ncmds {
            if cmd_off + LoadCommandBase::SIZE as u64 > commands_end {
                return Err(ExtractError::ContainerParse(
                    "load commands extend beyond sizeofcmds".into(),
                ));
            }

            let base: LoadCommandBase = cache.read(self.file_index, cmd_off)?;
            if base.cmdsize < LoadCommandBase::SIZE as u32 {
                return Err(ExtractError::ContainerParse(format!(
                    "load command {:#x} has impossible size {}",
                    base.cmd, base.cmdsize
                )));
            }

            let cmd = self.parse_one_command(cache, cmd_off, base)?;
            self.commands.push(CommandEntry {
                offset: cmd_off,
                cmd_id: base.cmd,
                cmdsize: base.cmdsize,
                cmd,
            });

            cmd_off += base.cmdsize as u64;
        }

        Ok(())
    }

    fn parse_one_command(
        &self,
        cache: &DyldCache,
        cmd_off: u64,
        base: LoadCommandBase,
    ) -> Result<LoadCommand> {
        let cmd = match base.cmd {
            LC_SEGMENT_64 => {
                let seg: SegmentCommand64 = cache.read(self.file_index, cmd_off)?;
                let mut sections = Vec::with_capacity(seg.nsects as usize);
                for i in 0..seg.nsects as u64 {
                    let sect_off = cmd_off + SegmentCommand64::SIZE as u64 + i * Section64::SIZE as u64;
                    sections.push(SectionInfo {
                        cmd_offset: sect_off,
                        sect: cache.read(self.file_index, sect_off)?,
                    });
                }
                LoadCommand::Segment64(SegmentInfo {
                    cmd_offset: cmd_off,
                    seg,
                    sections,
                })
            }
            LC_SYMTAB => LoadCommand::Symtab(cache.read(self.file_index, cmd_off)?),
            LC_DYSYMTAB => LoadCommand::Dysymtab(cache.read(self.file_index, cmd_off)?),
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                LoadCommand::DyldInfo(cache.read(self.file_index, cmd_off)?)
            }
            LC_CODE_SIGNATURE | LC_SEGMENT_SPLIT_INFO | LC_FUNCTION_STARTS | LC_DATA_IN_CODE
            | LC_DYLIB_CODE_SIGN_DRS | LC_LINKER_OPTIMIZATION_HINT | LC_DYLD_EXPORTS_TRIE
            | LC_DYLD_CHAINED_FIXUPS => {
                LoadCommand::LinkeditData(cache.read(self.file_index, cmd_off)?)
            }
            LC_LOAD_DYLIB | LC_ID_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB
            | LC_LAZY_LOAD_DYLIB | LC_LOAD_UPWARD_DYLIB => {
                LoadCommand::Dylib(cache.read(self.file_index, cmd_off)?)
            }
            LC_UUID => LoadCommand::Uuid(cache.read(self.file_index, cmd_off)?),
            LC_LOAD_DYLINKER | LC_ID_DYLINKER | LC_PREBOUND_DYLIB | LC_ROUTINES
            | LC_ROUTINES_64 | LC_SUB_FRAMEWORK | LC_SUB_UMBRELLA | LC_SUB_CLIENT
            | LC_SUB_LIBRARY | LC_TWOLEVEL_HINTS | LC_RPATH | LC_ENCRYPTION_INFO
            | LC_ENCRYPTION_INFO_64 | LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS
            | LC_VERSION_MIN_TVOS | LC_VERSION_MIN_WATCHOS | LC_DYLD_ENVIRONMENT | LC_MAIN
            | LC_SOURCE_VERSION | LC_LINKER_OPTION | LC_NOTE | LC_BUILD_VERSION => {
                LoadCommand::Other(base)
            }
            unknown => {
                return Err(ExtractError::ContainerParse(format!(
                    "unknown load command {unknown:#x}"
                )));
            }
        };
        Ok(cmd)
    }

    /// Segments in load-command order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.commands.iter().filter_map(|entry| match &entry.cmd {
            LoadCommand::Segment64(seg) => Some(seg),
            _ => None,
        })
    }

    pub fn segment(&self, name: &[u8]) -> Option<&SegmentInfo> {
        self.segments().find(|seg| seg.name() == name)
    }

    pub fn segment_index(&self, vmaddr: u64) -> Option<usize> {
        self.segments().position(|seg| seg.seg.contains_addr(vmaddr))
    }

    pub fn section(&self, segname: &[u8], sectname: &[u8]) -> Option<&SectionInfo> {
        self.segment(segname)?.section(sectname)
    }

    pub fn contains_addr(&self, vmaddr: u64) -> bool {
        self.segments().any(|seg| seg.seg.contains_addr(vmaddr))
    }

    pub fn symtab(&self) -> Option<(u64, SymtabCommand)> {
        self.commands.iter().find_map(|entry| match entry.cmd {
            LoadCommand::Symtab(cmd) => Some((entry.offset, cmd)),
            _ => None,
        })
    }

    pub fn dysymtab(&self) -> Option<(u64, DysymtabCommand)> {
        self.commands.iter().find_map(|entry| match entry.cmd {
            LoadCommand::Dysymtab(cmd) => Some((entry.offset, cmd)),
            _ => None,
        })
    }

    pub fn dyld_info(&self) -> Option<(u64, DyldInfoCommand)> {
        self.commands.iter().find_map(|entry| match entry.cmd {
            LoadCommand::DyldInfo(cmd) => Some((entry.offset, cmd)),
            _ => None,
        })
    }

    pub fn linkedit_data_command(&self, cmd_id: u32) -> Option<(u64, LinkeditDataCommand)> {
        self.commands.iter().find_map(|entry| match entry.cmd {
            LoadCommand::LinkeditData(cmd) if entry.cmd_id == cmd_id => {
                Some((entry.offset, cmd))
            }
            _ => None,
        })
    }

    /// The dependency commands, in load-command order: every
    /// `LC_*_DYLIB` except `LC_ID_DYLIB`.
    pub fn dependency_commands(&self) -> Vec<(u64, DylibCommand)> {
        self.commands
            .iter()
            .filter_map(|entry| match entry.cmd {
                LoadCommand::Dylib(cmd) if entry.cmd_id != LC_ID_DYLIB => {
                    Some((entry.offset, cmd))
                }
                _ => None,
            })
            .collect()
    }

    /// Reads the install path of a dylib command.
    pub fn dylib_name(&self, cache: &DyldCache, cmd_offset: u64, cmd: &DylibCommand) -> Result<Vec<u8>> {
        cache.read_cstring(self.file_index, cmd_offset + cmd.name_offset as u64)
    }

    /// File offset one past the load commands.
    pub fn header_end(&self) -> u64 {
        self.file_offset + MachHeader64::SIZE as u64 + self.header.sizeofcmds as u64
    }

    /// Routes a write to the cache file backing the given vmaddr, which
    /// may differ from the file holding the header.
    pub fn write_bytes_at_addr(
        &self,
        cache: &mut DyldCache,
        vmaddr: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let (file_index, offset) = cache
            .resolve_addr(vmaddr)
            .ok_or(ExtractError::MappingMiss(vmaddr))?;
        cache.write_bytes(file_index, offset, bytes)
    }
}
