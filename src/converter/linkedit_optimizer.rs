//! Rebuilds a private `__LINKEDIT` for the image.
//!
//! Inside the cache the linkedit data of every image is merged into one
//! shared pool. This pulls out only the pieces that belong to the image
//! being extracted: its local symbols (from the `.symbols` sibling),
//! its exported and imported symbol ranges, its indirect-symbol table
//! re-pointed at the new symbol indices, and a deduplicated string
//! pool.

use std::collections::HashMap;

use log::{error, warn};
use scroll::Pread;

use crate::builder::LinkeditBuilder;
use crate::cache::DyldCache;
use crate::cache::structs::{LocalSymbolsEntryV1, LocalSymbolsEntryV2, LocalSymbolsInfo};
use crate::error::{ExtractError, Result};
use crate::extraction::ExtractionContext;
use crate::macho::constants::{INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL};
use crate::macho::structs::Nlist64;

/// Deduplicating string pool; index 0 is a single NUL, historically the
/// "null symbol" slot.
pub struct StringPool {
    map: HashMap<Vec<u8>, u32>,
    length: u32,
}

impl StringPool {
    pub fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(vec![0u8], 0);
        StringPool { map, length: 1 }
    }

    /// Adds a NUL-terminated string, returning its pool index.
    pub fn add(&mut self, string: &[u8]) -> u32 {
        if let Some(&index) = self.map.get(string) {
            return index;
        }

        let index = self.length;
        self.length += string.len() as u32;
        self.map.insert(string.to_vec(), index);
        index
    }

    pub fn compile(&self) -> Vec<u8> {
        let mut strings: Vec<(&Vec<u8>, u32)> =
            self.map.iter().map(|(s, &i)| (s, i)).collect();
        strings.sort_by_key(|&(_, index)| index);
        strings
            .into_iter()
            .flat_map(|(s, _)| s.iter().copied())
            .collect()
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

struct Optimizer {
    pool: StringPool,
    symbol_count: u32,
    new_symbols: Vec<u8>,
    new_indirect: Vec<u8>,

    local_start: u32,
    local_count: u32,
    exported_start: u32,
    exported_count: u32,
    imported_start: u32,
    imported_count: u32,

    // Maps old indexes in the shared symbol table to positions in the
    // optimized table, for re-pointing the indirect-symbol table.
    index_remap: HashMap<u32, u32>,
}

pub fn optimize_linkedit(cache: &mut DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<()> {
    ctx.status.update(Some("Optimize Linkedit"), None);

    let mut builder = LinkeditBuilder::new(cache, &ctx.macho)?;
    if builder.symtab.is_none() {
        return Err(ExtractError::ContainerParse(
            "image has no symtab command".into(),
        ));
    }

    let mut opt = Optimizer {
        pool: StringPool::new(),
        symbol_count: 0,
        new_symbols: Vec::new(),
        new_indirect: Vec::new(),
        local_start: 0,
        local_count: 0,
        exported_start: 0,
        exported_count: 0,
        imported_start: 0,
        imported_count: 0,
        index_remap: HashMap::new(),
    };

    opt.add_redacted_symbol(ctx, &builder);
    if let Err(e) = opt.copy_local_symbols(cache, ctx) {
        warn!("Unable to copy local symbols: {e}");
    }
    opt.copy_exported_symbols(ctx, &builder);
    // imported symbols must come last so the stub fixer can append
    // redacted entries at the table tail
    opt.copy_imported_symbols(ctx, &builder);
    opt.copy_indirect_symbol_table(ctx, &builder);

    ctx.status.update(None, Some("Compiling string pool"));
    let strings = opt.pool.compile();

    {
        let symtab = builder.symtab.as_mut().unwrap();
        symtab.symbols = opt.new_symbols;
        symtab.strings = strings;
    }

    if let Some(dysymtab) = builder.dysymtab.as_mut() {
        dysymtab.indirect = opt.new_indirect;

        dysymtab.cmd.ilocalsym = opt.local_start;
        dysymtab.cmd.nlocalsym = opt.local_count;
        dysymtab.cmd.iextdefsym = opt.exported_start;
        dysymtab.cmd.nextdefsym = opt.exported_count;
        dysymtab.cmd.iundefsym = opt.imported_start;
        dysymtab.cmd.nundefsym = opt.imported_count;
        dysymtab.cmd.tocoff = 0;
        dysymtab.cmd.ntoc = 0;
        dysymtab.cmd.modtaboff = 0;
        dysymtab.cmd.nmodtab = 0;
        dysymtab.cmd.extrefsymoff = 0;
        dysymtab.cmd.nextrefsyms = 0;
        dysymtab.cmd.extreloff = 0;
        dysymtab.cmd.nextrel = 0;
        dysymtab.cmd.locreloff = 0;
        dysymtab.cmd.nlocrel = 0;
    }

    ctx.status.update(None, Some("Rebuilding linkedit"));

    let linkedit_addr = ctx
        .macho
        .segment(b"__LINKEDIT")
        .ok_or_else(|| ExtractError::ContainerParse("image has no __LINKEDIT".into()))?
        .seg
        .vmaddr;
    let (_, linkedit_off) = cache
        .resolve_addr(linkedit_addr)
        .ok_or(ExtractError::MappingMiss(linkedit_addr))?;
    builder.rebuild_in_place(cache, &mut ctx.macho, linkedit_off)?;

    Ok(())
}

impl Optimizer {
    /// Some images have indirect symbols pointing at the zeroth symbol
    /// entry, a stripped symbol that may be unrecoverable. Minting a
    /// `<redacted>` entry keeps disassemblers from naming functions
    /// after whatever happens to sit at index zero.
    fn add_redacted_symbol(&mut self, ctx: &mut ExtractionContext<'_>, builder: &LinkeditBuilder) {
        ctx.status.update(None, Some("Search Redacted Symbols"));

        let Some(dysymtab) = &builder.dysymtab else {
            return;
        };

        let has_zero_entry = dysymtab
            .indirect
            .chunks_exact(4)
            .any(|chunk| chunk == [0, 0, 0, 0]);
        if !has_zero_entry {
            return;
        }

        ctx.has_redacted_indirect = true;

        let entry = Nlist64 {
            n_strx: self.pool.add(b"<redacted>\0"),
            n_type: 1,
            ..Default::default()
        };
        self.push_symbol(entry);
    }

    fn push_symbol(&mut self, entry: Nlist64) {
        let mut bytes = [0u8; Nlist64::SIZE];
        use scroll::Pwrite as _;
        bytes.pwrite_with(entry, 0, scroll::LE).unwrap();
        self.new_symbols.extend_from_slice(&bytes);
        self.symbol_count += 1;
    }

    fn copy_local_symbols(
        &mut self,
        cache: &DyldCache,
        ctx: &mut ExtractionContext<'_>,
    ) -> Result<()> {
        ctx.status.update(None, Some("Copy Local Symbols"));

        let sym_file = cache
            .symbols_file()
            .ok_or_else(|| ExtractError::ContainerParse("no .symbols sub-cache found".into()))?;
        let chunk_off = cache.files[sym_file].header.local_symbols_offset;
        if chunk_off == 0 {
            warn!("Cache carries no local symbols chunk.");
            return Ok(());
        }

        let info: LocalSymbolsInfo = cache.read(sym_file, chunk_off)?;
        let entries_off = chunk_off + info.entries_offset as u64;

        let entry_size = self.probe_entry_size(cache, sym_file, entries_off)?;

        let text_addr = ctx
            .macho
            .segment(b"__TEXT")
            .map(|seg| seg.seg.vmaddr)
            .ok_or_else(|| ExtractError::ContainerParse("image has no __TEXT".into()))?;
        let dylib_offset = text_addr - cache.header().shared_region_start;

        let mut found = None;
        for i in 0..info.entries_count as u64 {
            let offset = entries_off + i * entry_size as u64;
            let (entry_dylib_offset, start, count) = match entry_size {
                LocalSymbolsEntryV1::SIZE => {
                    let entry: LocalSymbolsEntryV1 = cache.read(sym_file, offset)?;
                    (entry.dylib_offset as u64, entry.nlist_start_index, entry.nlist_count)
                }
                _ => {
                    let entry: LocalSymbolsEntryV2 = cache.read(sym_file, offset)?;
                    (entry.dylib_offset, entry.nlist_start_index, entry.nlist_count)
                }
            };

            if entry_dylib_offset == dylib_offset {
                found = Some((start, count));
                break;
            }
        }

        let Some((nlist_start, nlist_count)) = found else {
            warn!("Unable to find local symbol entries for this image.");
            return Ok(());
        };

        self.local_start = self.symbol_count;

        let nlist_base = chunk_off + info.nlist_offset as u64 + nlist_start as u64 * Nlist64::SIZE as u64;
        let strings_base = chunk_off + info.strings_offset as u64;

        for i in 0..nlist_count as u64 {
            let mut entry: Nlist64 = cache.read(sym_file, nlist_base + i * Nlist64::SIZE as u64)?;
            let name = cache.read_cstring(sym_file, strings_base + entry.n_strx as u64)?;

            entry.n_strx = self.pool.add(&name);
            self.push_symbol(entry);
            self.local_count += 1;

            ctx.status.update(None, None);
        }

        Ok(())
    }

    /// The local-symbols entry struct grew a wider `dylib_offset` at
    /// some point. Measure the stride between the first two images'
    /// entries instead of trusting any version number.
    fn probe_entry_size(
        &self,
        cache: &DyldCache,
        sym_file: usize,
        entries_off: u64,
    ) -> Result<usize> {
        let image0 = cache.images.first().and_then(|i| cache.resolve_addr(i.address));
        let image1 = cache.images.get(1).and_then(|i| cache.resolve_addr(i.address));
        let (Some((_, off0)), Some((_, off1))) = (image0, image1) else {
            return Err(ExtractError::ContainerParse(
                "cache has fewer than two images".into(),
            ));
        };

        let data = cache.data(sym_file);
        let haystack = data.get(entries_off as usize..).ok_or_else(|| {
            ExtractError::ContainerParse("local symbols entries lie beyond the file".into())
        })?;

        let pos0 = find_u32(haystack, off0 as u32);
        let pos1 = find_u32(haystack, off1 as u32);
        let (Some(pos0), Some(pos1)) = (pos0, pos1) else {
            return Err(ExtractError::ContainerParse(
                "unable to locate image entries in the local symbols chunk".into(),
            ));
        };

        match pos1.checked_sub(pos0) {
            Some(LocalSymbolsEntryV1::SIZE) => Ok(LocalSymbolsEntryV1::SIZE),
            Some(LocalSymbolsEntryV2::SIZE) => Ok(LocalSymbolsEntryV2::SIZE),
            _ => Err(ExtractError::ContainerParse(
                "unable to determine the local symbols entry layout".into(),
            )),
        }
    }

    fn copy_exported_symbols(&mut self, ctx: &mut ExtractionContext<'_>, builder: &LinkeditBuilder) {
        ctx.status.update(None, Some("Copy Exported Symbols"));

        self.exported_start = self.symbol_count;

        let Some(dysymtab) = &builder.dysymtab else {
            warn!("Unable to copy exported symbols.");
            return;
        };
        let range = dysymtab.cmd.iextdefsym..dysymtab.cmd.iextdefsym + dysymtab.cmd.nextdefsym;
        self.copy_symbol_range(ctx, builder, range);
        self.exported_count = self.symbol_count - self.exported_start;
    }

    fn copy_imported_symbols(&mut self, ctx: &mut ExtractionContext<'_>, builder: &LinkeditBuilder) {
        ctx.status.update(None, Some("Copy Imported Symbols"));

        self.imported_start = self.symbol_count;

        let Some(dysymtab) = &builder.dysymtab else {
            warn!("Unable to copy imported symbols.");
            return;
        };
        let range = dysymtab.cmd.iundefsym..dysymtab.cmd.iundefsym + dysymtab.cmd.nundefsym;
        self.copy_symbol_range(ctx, builder, range);
        self.imported_count = self.symbol_count - self.imported_start;
    }

    fn copy_symbol_range(
        &mut self,
        ctx: &mut ExtractionContext<'_>,
        builder: &LinkeditBuilder,
        range: std::ops::Range<u32>,
    ) {
        let symtab = builder.symtab.as_ref().unwrap();

        for index in range {
            let offset = index as usize * Nlist64::SIZE;
            let Ok(mut entry) = symtab.symbols.pread_with::<Nlist64>(offset, scroll::LE) else {
                error!("Symbol index {index} lies outside the shared symbol table.");
                return;
            };

            let name = read_pool_string(&symtab.strings, entry.n_strx);

            self.index_remap.insert(index, self.symbol_count);

            entry.n_strx = self.pool.add(&name);
            self.push_symbol(entry);

            ctx.status.update(None, None);
        }
    }

    fn copy_indirect_symbol_table(
        &mut self,
        ctx: &mut ExtractionContext<'_>,
        builder: &LinkeditBuilder,
    ) {
        ctx.status.update(None, Some("Copy Indirect Symbol Table"));

        let Some(dysymtab) = &builder.dysymtab else {
            warn!("Unable to copy indirect symbol table.");
            return;
        };

        for chunk in dysymtab.indirect.chunks_exact(4) {
            let index = u32::from_le_bytes(chunk.try_into().unwrap());

            if index == INDIRECT_SYMBOL_ABS
                || index == INDIRECT_SYMBOL_LOCAL
                || index == INDIRECT_SYMBOL_ABS | INDIRECT_SYMBOL_LOCAL
                || index == 0
            {
                self.new_indirect.extend_from_slice(chunk);
                continue;
            }

            match self.index_remap.get(&index) {
                Some(&new_index) => self.new_indirect.extend_from_slice(&new_index.to_le_bytes()),
                None => {
                    error!("Indirect entry references uncopied symbol {index}.");
                    self.new_indirect.extend_from_slice(chunk);
                }
            }

            ctx.status.update(None, None);
        }
    }
}

/// Reads a NUL-terminated string out of a string pool, including the
/// NUL; a truncated pool yields the null string.
pub fn read_pool_string(strings: &[u8], offset: u32) -> Vec<u8> {
    let start = offset as usize;
    if start >= strings.len() {
        return vec![0];
    }
    match strings[start..].iter().position(|&b| b == 0) {
        Some(end) => strings[start..start + end + 1].to_vec(),
        None => vec![0],
    }
}

fn find_u32(haystack: &[u8], needle: u32) -> Option<usize> {
    let needle = needle.to_le_bytes();
    haystack
        .windows(4)
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    // P2: no two byte-identical strings at distinct offsets, index 0 is
    // a NUL.
    #[test]
    fn string_pool_dedups() {
        let mut pool = StringPool::new();

        let a = pool.add(b"_malloc\0");
        let b = pool.add(b"_free\0");
        let c = pool.add(b"_malloc\0");

        assert_eq!(a, c);
        assert_ne!(a, b);

        let compiled = pool.compile();
        assert_eq!(compiled[0], 0);
        assert_eq!(&compiled[a as usize..a as usize + 8], b"_malloc\0");
        assert_eq!(&compiled[b as usize..b as usize + 6], b"_free\0");
        assert_eq!(compiled.len(), 1 + 8 + 6);
    }

    #[test]
    fn pool_string_reads_are_bounded() {
        let strings = b"\0_sym\0";
        assert_eq!(read_pool_string(strings, 1), b"_sym\0");
        assert_eq!(read_pool_string(strings, 100), vec![0]);
    }

    #[test]
    fn u32_probe_finds_offsets() {
        let mut buf = vec![0xffu8; 8];
        buf.extend_from_slice(&0x1234u32.to_le_bytes());
        assert_eq!(find_u32(&buf, 0x1234), Some(8));
        assert_eq!(find_u32(&buf, 0x4321), None);
    }
}
