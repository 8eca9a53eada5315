//! Recovers the lazy-binding indirections the cache builder optimized
//! away.
//!
//! The builder shortcuts stubs to their resolved targets, repoints
//! lazy symbol pointers directly at functions, and strips indirect
//! symbols. This pass symbolizes every pointer and stub, regenerates
//! stub instruction triplets, re-establishes the first-call stub-helper
//! indirection, redirects out-of-image call sites back to local stubs,
//! and mints symbol entries for redacted indirect slots.

use std::collections::HashMap;

use log::{error, warn};

use crate::builder::LinkeditBuilder;
use crate::cache::DyldCache;
use crate::converter::arm64::{self, sign_extend};
use crate::converter::slide_info::PointerSlider;
use crate::error::{ExtractError, Result};
use crate::extraction::ExtractionContext;
use crate::leb128::{decode_sleb128, decode_uleb128};
use crate::macho::constants::*;
use crate::macho::structs::{DyldInfoCommand, DysymtabCommand, Nlist64, SymtabCommand};
use crate::macho::trie::{self, ExportInfo};
use crate::macho::{MachO, SectionInfo};

/// The closed set of stub shapes (see the arm64 module for the
/// instruction signatures).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFormat {
    /// Non-optimized stub loading through a symbol pointer.
    StubNormal,
    /// Optimized stub branching straight to the target.
    StubOptimized,
    /// Non-optimized auth stub loading through a symbol pointer.
    AuthStubNormal,
    /// Optimized auth stub branching straight to the target.
    AuthStubOptimized,
    /// Auth stub loading a resolver pointer; structural, not rewritten.
    AuthStubResolver,
    /// A resolver trampoline; structural, not rewritten.
    Resolver,
}

/// Cache-aware ARM64 helper: follows stub chains and parses stub
/// helpers, with pointer reads routed through the slide info.
pub struct Arm64Utilities {
    slider: PointerSlider,
    resolve_cache: HashMap<u64, u64>,
}

impl Arm64Utilities {
    pub fn new(cache: &DyldCache) -> Result<Self> {
        Ok(Arm64Utilities {
            slider: PointerSlider::new(cache)?,
            resolve_cache: HashMap::new(),
        })
    }

    fn read_words<const N: usize>(&self, cache: &DyldCache, addr: u64) -> Option<[u32; N]> {
        let (file, offset) = cache.resolve_addr(addr)?;
        let bytes = cache.read_bytes(file, offset, N * 4).ok()?;
        let mut words = [0u32; N];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Some(words)
    }

    /// Follows a stub chain to the final function address.
    pub fn resolve_stub_chain(&mut self, cache: &DyldCache, address: u64) -> u64 {
        if let Some(&target) = self.resolve_cache.get(&address) {
            return target;
        }

        let mut target = address;
        while let Some((next, _)) = self.resolve_stub(cache, target) {
            if next == target {
                break;
            }
            target = next;
        }

        self.resolve_cache.insert(address, target);
        target
    }

    /// Classifies the code at `address` as one of the stub shapes and
    /// returns its branch target.
    pub fn resolve_stub(&self, cache: &DyldCache, address: u64) -> Option<(u64, StubFormat)> {
        if let Some(words) = self.read_words::<3>(cache, address) {
            if let Some(ldr) = arm64::stub_normal_ldr_addr(words, address) {
                return self
                    .slider
                    .slide_address(cache, ldr)
                    .map(|t| (t, StubFormat::StubNormal));
            }
            if let Some(target) = arm64::stub_optimized_target(words, address) {
                return Some((target, StubFormat::StubOptimized));
            }
        }
        if let Some(words) = self.read_words::<4>(cache, address) {
            if let Some(ldr) = arm64::auth_stub_normal_ldr_addr(words, address) {
                return self
                    .slider
                    .slide_address(cache, ldr)
                    .map(|t| (t, StubFormat::AuthStubNormal));
            }
            if let Some(target) = arm64::auth_stub_optimized_target(words, address) {
                return Some((target, StubFormat::AuthStubOptimized));
            }
        }
        if let Some(words) = self.read_words::<3>(cache, address) {
            if let Some(ldr) = arm64::auth_stub_resolver_ldr_addr(words, address) {
                return self
                    .slider
                    .slide_address(cache, ldr)
                    .map(|t| (t, StubFormat::AuthStubResolver));
            }
        }
        if let Some((target, _)) = self.resolver_data(cache, address) {
            return Some((target, StubFormat::Resolver));
        }
        None
    }

    /// For a regular 12-byte stub helper (`LDR w16, lit; B binder;
    /// .long data`), returns the encoded lazy-bind stream offset.
    pub fn stub_helper_data(&self, cache: &DyldCache, address: u64) -> Option<u32> {
        let [ldr, b, data] = self.read_words::<3>(cache, address)?;

        if ldr & 0xbf00_0000 != 0x1800_0000 || b & 0xfc00_0000 != 0x1400_0000 {
            return None;
        }
        Some(data)
    }

    /// The LDR slot address of a non-optimized (auth) stub.
    pub fn stub_ldr_addr(&self, cache: &DyldCache, address: u64) -> Option<u64> {
        if let Some(words) = self.read_words::<3>(cache, address) {
            if let Some(addr) = arm64::stub_normal_ldr_addr(words, address) {
                return Some(addr);
            }
        }
        if let Some(words) = self.read_words::<4>(cache, address) {
            if let Some(addr) = arm64::auth_stub_normal_ldr_addr(words, address) {
                return Some(addr);
            }
        }
        None
    }

    /// Detects a resolver trampoline and returns its branch target and
    /// byte size.
    ///
    /// The exact instruction sequence varies between OS builds, so only
    /// the skeleton is verified: it starts with STP and MOV, a BL sits
    /// before an eventual indirect branch, an ADRP directly follows the
    /// BL, and an LDP directly precedes the branch.
    pub fn resolver_data(&self, cache: &DyldCache, address: u64) -> Option<(u64, u64)> {
        const SEARCH_LIMIT: usize = 0xc8;

        let (file, offset) = cache.resolve_addr(address)?;
        let bytes = cache.read_bytes(file, offset, SEARCH_LIMIT + 4).ok()?;
        let word = |i: usize| -> u32 {
            u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap())
        };

        let stp = word(0);
        let mov = word(4);
        if stp & 0x7fc0_0000 != 0x2980_0000 || mov & 0x7f3f_fc00 != 0x1100_0000 {
            return None;
        }

        // the closing indirect branch
        let mut branch_off = None;
        for i in (0..SEARCH_LIMIT).step_by(4) {
            if word(i) & 0xfe9f_f000 == 0xd61f_0000 {
                branch_off = Some(i);
                break;
            }
        }
        let branch_off = branch_off?;

        // the BL to the real implementation
        let mut bl_off = None;
        for i in (0..branch_off).step_by(4) {
            if bytes[i + 3] & 0xfc == 0x94 {
                bl_off = Some(i);
                break;
            }
        }
        let bl_off = bl_off?;

        let adrp = word(bl_off + 4);
        let ldp = word(branch_off - 4);
        if adrp & 0x9f00_001f != 0x9000_0010 || ldp & 0x7fc0_0000 != 0x28c0_0000 {
            return None;
        }

        let imm = u64::from(word(bl_off) & 0x03ff_ffff) << 2;
        let bl_target = (address + bl_off as u64) as i64 + sign_extend(imm, 28);

        let resolver_size = (branch_off + 4) as u64;
        Some((bl_target as u64, resolver_size))
    }

    pub fn slider(&self) -> &PointerSlider {
        &self.slider
    }
}

/// One record out of a bind/lazy-bind/weak-bind opcode stream. Fields
/// stay `None` until the stream sets them.
#[derive(Debug, Clone, Default)]
pub struct BindRecord {
    pub ordinal: Option<i64>,
    pub flags: Option<u8>,
    pub symbol: Option<Vec<u8>>,
    pub sym_type: Option<u8>,
    pub addend: Option<i64>,
    pub segment: Option<u8>,
    pub offset: Option<u64>,
}

/// Pull-based reader over a bind opcode stream.
pub struct BindReader<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    record: BindRecord,
    // remaining (count, skip) state of a DO_BIND_ULEB_TIMES opcode
    repeats: Option<(u64, u64)>,
}

impl<'a> BindReader<'a> {
    pub fn new(data: &'a [u8], offset: usize, size: usize) -> Self {
        BindReader {
            data,
            pos: offset,
            end: (offset + size).min(data.len()),
            record: BindRecord::default(),
            repeats: None,
        }
    }

    fn bump_offset(&mut self, amount: i64) {
        if let Some(offset) = &mut self.record.offset {
            *offset = offset.wrapping_add(amount as u64);
        }
    }

    /// Returns the next bound record, or `None` at end of stream.
    pub fn next_record(&mut self) -> Result<Option<BindRecord>> {
        if let Some((count, skip)) = self.repeats {
            let record = self.record.clone();
            self.bump_offset(skip as i64 + 8);
            self.repeats = (count > 1).then(|| (count - 1, skip));
            return Ok(Some(record));
        }

        while self.pos < self.end {
            let byte = self.data[self.pos];
            let opcode = byte & BIND_OPCODE_MASK;
            let imm = byte & BIND_IMMEDIATE_MASK;
            self.pos += 1;

            match opcode {
                // in the lazy stream DONE only separates records
                BIND_OPCODE_DONE => self.record = BindRecord::default(),
                BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => self.record.ordinal = Some(imm as i64),
                BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                    let (value, pos) = decode_uleb128(self.data, self.pos)?;
                    self.pos = pos;
                    self.record.ordinal = Some(value as i64);
                }
                BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                    self.record.ordinal = Some(match imm {
                        0 => BIND_SPECIAL_DYLIB_SELF,
                        1 => BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE,
                        2 => BIND_SPECIAL_DYLIB_FLAT_LOOKUP,
                        3 => BIND_SPECIAL_DYLIB_WEAK_LOOKUP,
                        other => {
                            return Err(ExtractError::ChainCorrupt(format!(
                                "unknown special bind ordinal {other}"
                            )));
                        }
                    });
                }
                BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                    self.record.flags = Some(imm);
                    let end = self.data[self.pos..]
                        .iter()
                        .position(|&b| b == 0)
                        .ok_or_else(|| {
                            ExtractError::ChainCorrupt("unterminated bind symbol".into())
                        })?;
                    self.record.symbol = Some(self.data[self.pos..self.pos + end + 1].to_vec());
                    self.pos += end + 1;
                }
                BIND_OPCODE_SET_TYPE_IMM => self.record.sym_type = Some(imm),
                BIND_OPCODE_SET_ADDEND_SLEB => {
                    let (value, pos) = decode_sleb128(self.data, self.pos)?;
                    self.pos = pos;
                    self.record.addend = Some(value);
                }
                BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    self.record.segment = Some(imm);
                    let (value, pos) = decode_uleb128(self.data, self.pos)?;
                    self.pos = pos;
                    self.record.offset = Some(value);
                }
                BIND_OPCODE_ADD_ADDR_ULEB => {
                    let (value, pos) = decode_uleb128(self.data, self.pos)?;
                    self.pos = pos;
                    self.bump_offset(sign_extend(value, 64));
                }
                BIND_OPCODE_DO_BIND => {
                    let record = self.record.clone();
                    self.bump_offset(8);
                    return Ok(Some(record));
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                    let record = self.record.clone();
                    let (value, pos) = decode_uleb128(self.data, self.pos)?;
                    self.pos = pos;
                    self.bump_offset(sign_extend(value, 64) + 8);
                    return Ok(Some(record));
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                    let record = self.record.clone();
                    self.bump_offset(imm as i64 * 8 + 8);
                    return Ok(Some(record));
                }
                BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                    let (count, pos) = decode_uleb128(self.data, self.pos)?;
                    let (skip, pos) = decode_uleb128(self.data, pos)?;
                    self.pos = pos;
                    if count > 0 {
                        self.repeats = Some((count, skip));
                        return self.next_record();
                    }
                }
                other => {
                    return Err(ExtractError::ChainCorrupt(format!(
                        "unknown bind opcode {other:#x}"
                    )));
                }
            }
        }

        Ok(None)
    }

    pub fn collect(mut self) -> Result<Vec<BindRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

/// Builds a map from function addresses to the symbol names that cover
/// them: the image's own symbol table plus the exports of its whole
/// dependency tree.
pub struct Symbolizer {
    symbols: HashMap<u64, Vec<Vec<u8>>>,
}

impl Symbolizer {
    pub fn new(cache: &DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<Self> {
        let mut symbolizer = Symbolizer {
            symbols: HashMap::new(),
        };

        // map of install paths to image addresses
        let mut images: HashMap<Vec<u8>, u64> = HashMap::new();
        for image in &cache.images {
            let path = cache.read_cstring(0, image.path_file_offset as u64)?;
            images.insert(path, image.address);
        }

        symbolizer.enumerate_exports(cache, ctx, &images)?;
        symbolizer.enumerate_symbols(cache, ctx)?;
        Ok(symbolizer)
    }

    pub fn symbolize(&self, addr: u64) -> Option<&Vec<Vec<u8>>> {
        self.symbols.get(&addr)
    }

    fn add(&mut self, addr: u64, name: Vec<u8>) {
        self.symbols.entry(addr).or_default().push(name);
    }

    fn enumerate_exports(
        &mut self,
        cache: &DyldCache,
        ctx: &mut ExtractionContext<'_>,
        images: &HashMap<Vec<u8>, u64>,
    ) -> Result<()> {
        let mut queue: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut processed: Vec<Vec<u8>> = Vec::new();
        // reexports can rename an existing export; process them last
        let mut reexports: Vec<ExportInfo> = Vec::new();

        for (cmd_off, dylib) in ctx.macho.dependency_commands() {
            let path = ctx.macho.dylib_name(cache, cmd_off, &dylib)?;
            match images.get(&path) {
                Some(&addr) => queue.push((path, addr)),
                None => warn!(
                    "Unable to find dependency: {}",
                    String::from_utf8_lossy(&path)
                ),
            }
        }

        while let Some((path, image_addr)) = queue.pop() {
            ctx.status.update(None, None);

            if processed.contains(&path) {
                continue;
            }

            let Some((file, offset)) = cache.resolve_addr(image_addr) else {
                warn!("Dependency address {image_addr:#x} is outside the cache.");
                continue;
            };
            let dep = match MachO::parse(cache, file, offset) {
                Ok(dep) => dep,
                Err(e) => {
                    warn!("Unable to parse dependency {}: {e}", String::from_utf8_lossy(&path));
                    continue;
                }
            };

            let exports = match self.read_dep_exports(cache, &dep) {
                Ok(exports) => exports,
                Err(e) => {
                    warn!(
                        "Unable to read exports of {}, reason: {e}",
                        String::from_utf8_lossy(&path)
                    );
                    Vec::new()
                }
            };

            for export in &exports {
                if export.address != 0 {
                    let addr = image_addr + export.address;
                    self.add(addr, export.name.clone());

                    if export.flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
                        // address points at the stub; other at the
                        // resolved function, name both
                        self.add(image_addr + export.other, export.name.clone());
                    }
                }
            }

            processed.push(path);

            let dep_dylibs = dep.dependency_commands();

            // walk into any reexported dylibs
            for (cmd_off, dylib_cmd) in &dep_dylibs {
                let entry = dep
                    .commands
                    .iter()
                    .find(|c| c.offset == *cmd_off)
                    .expect("command offset is from this image");
                if entry.cmd_id != LC_REEXPORT_DYLIB {
                    continue;
                }
                let dep_path = dep.dylib_name(cache, *cmd_off, dylib_cmd)?;
                if let Some(&addr) = images.get(&dep_path) {
                    queue.push((dep_path, addr));
                }
            }

            // and into the ordinals reexport entries point at
            let mut reexport_ordinals = Vec::new();
            for export in exports {
                if export.flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
                    if !reexport_ordinals.contains(&export.other) {
                        reexport_ordinals.push(export.other);
                    }
                    reexports.push(export);
                }
            }
            for ordinal in reexport_ordinals {
                // reexport ordinals are 1-based
                let Some(index) = (ordinal as usize).checked_sub(1) else {
                    continue;
                };
                let Some((cmd_off, dylib_cmd)) = dep_dylibs.get(index) else {
                    continue;
                };
                let dep_path = dep.dylib_name(cache, *cmd_off, dylib_cmd)?;
                if let Some(&addr) = images.get(&dep_path) {
                    queue.push((dep_path, addr));
                }
            }
        }

        for reexport in reexports {
            let Some(import_name) = &reexport.import_name else {
                continue;
            };
            if import_name.as_slice() == b"\0" {
                continue;
            }

            let target = self
                .symbols
                .values_mut()
                .find(|names| names.iter().any(|n| n == import_name));
            match target {
                // reexport names get priority
                Some(names) => names.insert(0, reexport.name),
                None => warn!(
                    "No root export for reexport of symbol {}",
                    String::from_utf8_lossy(import_name)
                ),
            }
        }

        Ok(())
    }

    fn read_dep_exports(&self, cache: &DyldCache, dep: &MachO) -> Result<Vec<ExportInfo>> {
        let mut export_off = None;
        let mut export_size = 0;

        if let Some((_, info)) = dep.dyld_info() {
            if info.export_size != 0 {
                export_off = Some(info.export_off);
                export_size = info.export_size;
            }
        }
        if export_off.is_none() {
            if let Some((_, cmd)) = dep.linkedit_data_command(LC_DYLD_EXPORTS_TRIE) {
                if cmd.datasize != 0 {
                    export_off = Some(cmd.dataoff);
                    export_size = cmd.datasize;
                }
            }
        }

        // some images have no exports at all
        let Some(export_off) = export_off else {
            return Ok(Vec::new());
        };

        let linkedit_addr = dep
            .segment(b"__LINKEDIT")
            .ok_or_else(|| ExtractError::ContainerParse("dependency has no __LINKEDIT".into()))?
            .seg
            .vmaddr;
        let (linkedit_file, _) = cache
            .resolve_addr(linkedit_addr)
            .ok_or(ExtractError::MappingMiss(linkedit_addr))?;

        trie::read_exports(
            cache.data(linkedit_file),
            export_off as usize,
            export_size as usize,
        )
    }

    fn enumerate_symbols(&mut self, cache: &DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<()> {
        let Some((_, symtab)) = ctx.macho.symtab() else {
            warn!("Unable to find LC_SYMTAB.");
            return Ok(());
        };

        let linkedit_addr = ctx
            .macho
            .segment(b"__LINKEDIT")
            .ok_or_else(|| ExtractError::ContainerParse("image has no __LINKEDIT".into()))?
            .seg
            .vmaddr;
        let (linkedit_file, _) = cache
            .resolve_addr(linkedit_addr)
            .ok_or(ExtractError::MappingMiss(linkedit_addr))?;

        for i in 0..symtab.nsyms as u64 {
            ctx.status.update(None, None);

            let entry: Nlist64 =
                cache.read(linkedit_file, symtab.symoff as u64 + i * Nlist64::SIZE as u64)?;
            if entry.n_value == 0 {
                continue;
            }

            let name =
                cache.read_cstring(linkedit_file, symtab.stroff as u64 + entry.n_strx as u64)?;

            if !ctx.macho.contains_addr(entry.n_value) {
                warn!(
                    "Invalid address {:#x} for symbol entry {}.",
                    entry.n_value,
                    String::from_utf8_lossy(&name)
                );
                continue;
            }

            self.add(entry.n_value, name);
        }

        Ok(())
    }
}

struct StubFixer {
    symbolizer: Symbolizer,
    utils: Arm64Utilities,
    symtab: SymtabCommand,
    dysymtab: DysymtabCommand,
    linkedit_file: usize,
    segments: Vec<(u64, u64)>, // (vmaddr, vmsize) in load-command order
}

pub fn fix_stubs(cache: &mut DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<()> {
    ctx.status.update(Some("Stub Fixer"), None);
    ctx.status.update(None, Some("Caching Symbols"));

    let symbolizer = Symbolizer::new(cache, ctx)?;
    let utils = Arm64Utilities::new(cache)?;

    let (_, symtab) = ctx
        .macho
        .symtab()
        .ok_or_else(|| ExtractError::ContainerParse("unable to get symtab command".into()))?;
    let (_, dysymtab) = ctx
        .macho
        .dysymtab()
        .ok_or_else(|| ExtractError::ContainerParse("unable to get dysymtab command".into()))?;

    let linkedit_addr = ctx
        .macho
        .segment(b"__LINKEDIT")
        .ok_or_else(|| ExtractError::ContainerParse("image has no __LINKEDIT".into()))?
        .seg
        .vmaddr;
    let (linkedit_file, _) = cache
        .resolve_addr(linkedit_addr)
        .ok_or(ExtractError::MappingMiss(linkedit_addr))?;

    let segments = ctx
        .macho
        .segments()
        .map(|seg| (seg.seg.vmaddr, seg.seg.vmsize))
        .collect();

    let mut fixer = StubFixer {
        symbolizer,
        utils,
        symtab,
        dysymtab,
        linkedit_file,
        segments,
    };

    let symbol_ptrs = fixer.enumerate_symbol_pointers(cache, ctx)?;
    fixer.fix_stub_helpers(cache, ctx)?;
    let stub_map = fixer.fix_stubs(cache, ctx, &symbol_ptrs)?;
    fixer.fix_callsites(cache, ctx, &stub_map)?;
    fixer.fix_indirect_symbols(cache, ctx, &symbol_ptrs, &stub_map)?;
    Ok(())
}

type SymbolMap = HashMap<Vec<u8>, Vec<u64>>;

impl StubFixer {
    fn indirect_symbol_name(
        &self,
        cache: &DyldCache,
        indirect_index: u64,
    ) -> Result<Option<Vec<u8>>> {
        let entry_off = self.dysymtab.indirectsymoff as u64 + indirect_index * 4;
        let symbol_index: u32 = cache.read(self.linkedit_file, entry_off)?;

        if symbol_index == 0
            || symbol_index == INDIRECT_SYMBOL_ABS
            || symbol_index == INDIRECT_SYMBOL_LOCAL
            || symbol_index == INDIRECT_SYMBOL_ABS | INDIRECT_SYMBOL_LOCAL
        {
            return Ok(None);
        }

        let entry: Nlist64 = cache.read(
            self.linkedit_file,
            self.symtab.symoff as u64 + symbol_index as u64 * Nlist64::SIZE as u64,
        )?;
        Ok(Some(cache.read_cstring(
            self.linkedit_file,
            self.symtab.stroff as u64 + entry.n_strx as u64,
        )?))
    }

    /// Maps every symbol pointer's name to its slot addresses, with
    /// `__auth_got` slots ranked first.
    fn enumerate_symbol_pointers(
        &mut self,
        cache: &DyldCache,
        ctx: &mut ExtractionContext<'_>,
    ) -> Result<SymbolMap> {
        // bind records are a source of symbolic info; lazy records win
        // over weak ones on address conflicts
        let mut bind_records: HashMap<u64, BindRecord> = HashMap::new();
        if let Some((_, dyld_info)) = ctx.macho.dyld_info() {
            let data = cache.data(self.linkedit_file);
            let mut records = Vec::new();

            let mut read_stream = |off: u32, size: u32| -> Result<()> {
                if size == 0 || off == 0 {
                    return Ok(());
                }
                records.extend(BindReader::new(data, off as usize, size as usize).collect()?);
                Ok(())
            };

            // weak binds usually carry C++ symbols like "operator new"
            let weak = read_stream(dyld_info.weak_bind_off, dyld_info.weak_bind_size);
            let lazy = read_stream(dyld_info.lazy_bind_off, dyld_info.lazy_bind_size);
            if let Err(e) = weak.and(lazy) {
                error!("Unable to read bind records, reason: {e}");
            }

            for record in records {
                let (Some(_), Some(segment), Some(offset)) =
                    (&record.symbol, record.segment, record.offset)
                else {
                    warn!("Incomplete lazy bind record: {record:?}");
                    continue;
                };
                let Some(&(seg_addr, _)) = self.segments.get(segment as usize) else {
                    warn!("Bind record segment {segment} is out of range.");
                    continue;
                };
                bind_records.insert(seg_addr + offset, record);
            }
        }

        let mut symbol_ptrs: SymbolMap = HashMap::new();
        let mut add_to_map = |symbol: &[u8], ptr_addr: u64, sect: &SectionInfo| {
            let slots = symbol_ptrs.entry(symbol.to_vec()).or_default();
            // pointers in __auth_got get priority
            if sect.sect.name() == b"__auth_got" {
                slots.insert(0, ptr_addr);
            } else {
                slots.push(ptr_addr);
            }
        };

        let sections: Vec<SectionInfo> = ctx
            .macho
            .segments()
            .flat_map(|seg| seg.sections.iter().cloned())
            .filter(|sect| {
                matches!(
                    sect.sect.section_type(),
                    S_NON_LAZY_SYMBOL_POINTERS | S_LAZY_SYMBOL_POINTERS
                )
            })
            .collect();

        for sect in &sections {
            for i in 0..sect.sect.size / 8 {
                ctx.status.update(None, Some("Caching Symbol Pointers"));

                let ptr_addr = sect.sect.addr + i * 8;

                // 1. a weak/lazy bind record at this address
                if let Some(record) = bind_records.get(&ptr_addr) {
                    add_to_map(record.symbol.as_ref().unwrap(), ptr_addr, sect);
                    continue;
                }

                // 2. the indirect symbol entry
                if let Some(name) =
                    self.indirect_symbol_name(cache, sect.sect.reserved1 as u64 + i)?
                {
                    add_to_map(&name, ptr_addr, sect);
                    continue;
                }

                // 3. resolve the pointer's stub chain and symbolize it
                let Some(ptr_target) = self.utils.slider().slide_address(cache, ptr_addr) else {
                    continue;
                };
                let ptr_func = self.utils.resolve_stub_chain(cache, ptr_target);
                if let Some(names) = self.symbolizer.symbolize(ptr_func) {
                    for name in names.clone() {
                        add_to_map(&name, ptr_addr, sect);
                    }
                    continue;
                }

                // special cases like __csbitmaps in CoreFoundation point
                // into the image itself
                if ctx.macho.contains_addr(ptr_target) {
                    continue;
                }

                warn!(
                    "Unable to symbolize pointer at {ptr_addr:#x}, with indirect entry index {:#x}, with target function {ptr_func:#x}",
                    sect.sect.reserved1 as u64 + i
                );
            }
        }

        Ok(symbol_ptrs)
    }

    /// Repoints lazily-bound symbol pointers back at their stub
    /// helpers, restoring the first-call binding indirection.
    fn fix_stub_helpers(&mut self, cache: &mut DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<()> {
        // the binder sits at the head of the section
        const STUB_BINDER_SIZE: u64 = 0x18;
        const REG_HELPER_SIZE: u64 = 0xc;

        let Some(helper_sect) = ctx.macho.section(b"__TEXT", b"__stub_helper") else {
            return Ok(());
        };
        let Some((_, dyld_info)) = ctx.macho.dyld_info() else {
            return Ok(());
        };

        let mut helper_addr = helper_sect.sect.addr + STUB_BINDER_SIZE;
        let helper_end = helper_sect.sect.addr + helper_sect.sect.size;

        while helper_addr < helper_end {
            ctx.status.update(None, Some("Fixing Lazy Symbol Pointers"));

            if let Some(bind_off) = self.utils.stub_helper_data(cache, helper_addr) {
                let record = self.first_lazy_record(cache, &dyld_info, bind_off);

                let Some(record) = record else {
                    warn!("Bind record for stub helper at {helper_addr:#x} is incomplete.");
                    helper_addr += REG_HELPER_SIZE;
                    continue;
                };
                let (Some(segment), Some(offset)) = (record.segment, record.offset) else {
                    warn!("Bind record for stub helper is incomplete: {record:?}");
                    helper_addr += REG_HELPER_SIZE;
                    continue;
                };

                let Some(&(seg_addr, _)) = self.segments.get(segment as usize) else {
                    helper_addr += REG_HELPER_SIZE;
                    continue;
                };

                // repoint the bind pointer at the stub helper
                let bind_ptr_addr = seg_addr + offset;
                if let Some((file, off)) = cache.resolve_addr(bind_ptr_addr) {
                    cache.write(file, off, helper_addr)?;
                }

                helper_addr += REG_HELPER_SIZE;
                continue;
            }

            // it may be a resolver
            if let Some((target, size)) = self.utils.resolver_data(cache, helper_addr) {
                // resolvers should already point into the image
                if !ctx.macho.contains_addr(target) {
                    warn!("Unable to fix resolver at {helper_addr:#x}");
                }
                helper_addr += size;
                continue;
            }

            warn!("Unknown stub helper format at {helper_addr:#x}");
            helper_addr += REG_HELPER_SIZE;
        }

        Ok(())
    }

    fn first_lazy_record(
        &self,
        cache: &DyldCache,
        dyld_info: &DyldInfoCommand,
        bind_off: u32,
    ) -> Option<BindRecord> {
        let data = cache.data(self.linkedit_file);
        let start = dyld_info.lazy_bind_off as usize + bind_off as usize;
        let end = dyld_info.lazy_bind_off as usize + dyld_info.lazy_bind_size as usize;
        if start >= end {
            return None;
        }

        let mut reader = BindReader::new(data, start, end - start);
        match reader.next_record() {
            Ok(Some(record)) if record.symbol.is_some() => Some(record),
            _ => None,
        }
    }

    /// Symbolizes every stub, relinks optimized stubs to their symbol
    /// pointers, and returns the name → stub-address map.
    fn fix_stubs(
        &mut self,
        cache: &mut DyldCache,
        ctx: &mut ExtractionContext<'_>,
        symbol_ptrs: &SymbolMap,
    ) -> Result<SymbolMap> {
        let mut stub_map: SymbolMap = HashMap::new();

        let sections: Vec<SectionInfo> = ctx
            .macho
            .segments()
            .flat_map(|seg| seg.sections.iter().cloned())
            .filter(|sect| sect.sect.section_type() == S_SYMBOL_STUBS && sect.sect.reserved2 != 0)
            .collect();

        for sect in &sections {
            let stub_size = sect.sect.reserved2 as u64;
            for i in 0..sect.sect.size / stub_size {
                ctx.status.update(None, Some("Fixing Stubs"));

                let stub_addr = sect.sect.addr + i * stub_size;

                // symbolize the stub: indirect entry first
                let mut stub_names: Vec<Vec<u8>> = Vec::new();
                if let Some(name) =
                    self.indirect_symbol_name(cache, sect.sect.reserved1 as u64 + i)?
                {
                    stub_names.push(name);
                }

                // an unoptimized stub names itself through its pointer
                if stub_names.is_empty() {
                    if let Some(ptr_addr) = self.utils.stub_ldr_addr(cache, stub_addr) {
                        stub_names = symbol_ptrs
                            .iter()
                            .filter(|(_, ptrs)| ptrs.contains(&ptr_addr))
                            .map(|(name, _)| name.clone())
                            .collect();
                    }
                }

                // an optimized stub names itself through its target
                if stub_names.is_empty() {
                    let target = self.utils.resolve_stub_chain(cache, stub_addr);
                    if let Some(names) = self.symbolizer.symbolize(target) {
                        stub_names = names.clone();
                    }
                }

                if stub_names.is_empty() {
                    warn!("Unable to symbolize stub at {stub_addr:#x}");
                    continue;
                }

                for name in &stub_names {
                    stub_map.entry(name.clone()).or_default().push(stub_addr);
                }

                // find a symbol pointer for the stub
                let sym_ptr_addr = self.utils.stub_ldr_addr(cache, stub_addr).or_else(|| {
                    stub_names
                        .iter()
                        .find_map(|name| symbol_ptrs.get(name).and_then(|p| p.first().copied()))
                });
                let Some(sym_ptr_addr) = sym_ptr_addr else {
                    warn!(
                        "Unable to find a symbol pointer for stub at {stub_addr:#x}, with names {:?}",
                        stub_names
                            .iter()
                            .map(|n| String::from_utf8_lossy(n).into_owned())
                            .collect::<Vec<_>>()
                    );
                    continue;
                };

                let Some((target, format)) = self.utils.resolve_stub(cache, stub_addr) else {
                    warn!("Unknown stub format at {stub_addr:#x}");
                    continue;
                };

                match format {
                    StubFormat::StubNormal => {}
                    StubFormat::StubOptimized => {
                        // only the stub needs relinking
                        let stub = arm64::generate_stub_normal(stub_addr, sym_ptr_addr);
                        ctx.macho.write_bytes_at_addr(cache, stub_addr, &stub)?;
                    }
                    StubFormat::AuthStubNormal => {
                        // only the symbol pointer needs relinking
                        ctx.macho.write_bytes_at_addr(
                            cache,
                            sym_ptr_addr,
                            &stub_addr.to_le_bytes(),
                        )?;
                    }
                    StubFormat::AuthStubOptimized => {
                        // both the stub and the symbol pointer
                        ctx.macho.write_bytes_at_addr(
                            cache,
                            sym_ptr_addr,
                            &stub_addr.to_le_bytes(),
                        )?;
                        let stub = arm64::generate_auth_stub_normal(stub_addr, sym_ptr_addr);
                        ctx.macho.write_bytes_at_addr(cache, stub_addr, &stub)?;
                    }
                    StubFormat::AuthStubResolver => {
                        // structural; should already point into the image
                        if !ctx.macho.contains_addr(target) {
                            error!("Unable to fix auth stub resolver at {stub_addr:#x}");
                        }
                    }
                    StubFormat::Resolver => {
                        warn!("Encountered a resolver at {stub_addr:#x} while fixing stubs");
                    }
                }
            }
        }

        Ok(stub_map)
    }

    /// Repoints `BL`/`B` instructions that branch outside the image
    /// back at the matching local stub.
    fn fix_callsites(
        &mut self,
        cache: &mut DyldCache,
        ctx: &mut ExtractionContext<'_>,
        stub_map: &SymbolMap,
    ) -> Result<()> {
        let Some(text_sect) = ctx.macho.section(b"__TEXT", b"__text") else {
            return Err(ExtractError::ContainerParse(
                "unable to get __text section".into(),
            ));
        };

        let text_addr = text_sect.sect.addr;
        let text_size = text_sect.sect.size;
        // section offsets are sometimes inaccurate, go through the
        // address instead
        let (text_file, text_off) = cache
            .resolve_addr(text_addr)
            .ok_or(ExtractError::MappingMiss(text_addr))?;

        for sect_off in (0..text_size).step_by(4) {
            // bl and b are identifiable by their top byte alone, which
            // keeps the scan cheap
            let instr_off = (text_off + sect_off) as usize;
            let top = cache.data(text_file)[instr_off + 3] & 0xfc;
            if top != 0x94 && top != 0x14 {
                continue;
            }

            let br_instr: u32 = cache.read(text_file, text_off + sect_off)?;
            let imm26 = u64::from(br_instr & 0x03ff_ffff);
            let br_off = sign_extend(imm26 << 2, 28);

            let br_addr = text_addr + sect_off;
            let br_target = (br_addr as i64).wrapping_add(br_off) as u64;

            if ctx.macho.contains_addr(br_target) {
                continue;
            }

            // branch-looking words directly after a branch are usually
            // data in text; those are skipped silently
            let follows_branch = sect_off >= 4 && {
                let prev_top = cache.data(text_file)[instr_off - 1] & 0xfc;
                prev_top == 0x94 || prev_top == 0x14 || prev_top == 0xd6
            };

            let target_func = self.utils.resolve_stub_chain(cache, br_target);
            let Some(func_symbols) = self.symbolizer.symbolize(target_func) else {
                if !follows_branch {
                    warn!("Unable to symbolize branch at {br_addr:#x}, targeting {target_func:#x}");
                }
                continue;
            };

            let stub_symbol = func_symbols.iter().find(|sym| stub_map.contains_key(*sym));
            let Some(stub_symbol) = stub_symbol else {
                if !follows_branch {
                    warn!("Unable to find a stub for branch at {br_addr:#x}");
                }
                continue;
            };

            // repoint the branch at the stub
            let stub_addr = stub_map[stub_symbol][0];
            let imm26 = ((stub_addr.wrapping_sub(br_addr) as i64) >> 2) as u32 & 0x03ff_ffff;
            let patched = (br_instr & 0xfc00_0000) | imm26;
            cache.write(text_file, text_off + sect_off, patched)?;

            ctx.status.update(None, Some("Fixing Callsites"));
        }

        Ok(())
    }

    /// Replaces zeroed (redacted) indirect-symbol entries with
    /// newly-minted symbols named after the stub or pointer that the
    /// slot belongs to.
    fn fix_indirect_symbols(
        &mut self,
        cache: &mut DyldCache,
        ctx: &mut ExtractionContext<'_>,
        symbol_ptrs: &SymbolMap,
        stub_map: &SymbolMap,
    ) -> Result<()> {
        if !ctx.has_redacted_indirect {
            return Ok(());
        }

        ctx.status.update(None, Some("Fixing Indirect Symbols"));

        let mut builder = LinkeditBuilder::new(cache, &ctx.macho)?;
        let LinkeditBuilder {
            symtab, dysymtab, ..
        } = &mut builder;
        let (Some(symtab_slot), Some(dysymtab_slot)) = (symtab.as_mut(), dysymtab.as_mut()) else {
            return Ok(());
        };

        let mut next_symbol_index = self.dysymtab.iundefsym + self.dysymtab.nundefsym;
        let mut minted = 0u32;

        let sections: Vec<SectionInfo> = ctx
            .macho
            .segments()
            .flat_map(|seg| seg.sections.iter().cloned())
            .collect();

        for sect in &sections {
            let stride = match sect.sect.section_type() {
                S_SYMBOL_STUBS if sect.sect.reserved2 != 0 => sect.sect.reserved2 as u64,
                S_NON_LAZY_SYMBOL_POINTERS | S_LAZY_SYMBOL_POINTERS => 8,
                _ => continue,
            };
            let lookup: &SymbolMap = if sect.sect.section_type() == S_SYMBOL_STUBS {
                stub_map
            } else {
                symbol_ptrs
            };

            let first = sect.sect.reserved1 as u64;
            let count = sect.sect.size / stride;

            for i in first..first + count {
                ctx.status.update(None, None);

                let entry_off = i as usize * 4;
                let Some(entry_bytes) = dysymtab_slot.indirect.get(entry_off..entry_off + 4)
                else {
                    break;
                };
                if entry_bytes != [0, 0, 0, 0] {
                    continue;
                }

                let slot_addr = sect.sect.addr + (i - first) * stride;
                let symbol = lookup
                    .iter()
                    .find(|(_, addrs)| addrs.contains(&slot_addr))
                    .map(|(name, _)| name.clone());
                let Some(symbol) = symbol else {
                    warn!(
                        "Unable to symbolize indirect entry {i} at {slot_addr:#x}",
                    );
                    continue;
                };

                // mint the symbol, its string, and repoint the entry
                let entry = Nlist64 {
                    n_strx: symtab_slot.strings.len() as u32,
                    n_type: 1,
                    ..Default::default()
                };
                symtab_slot.strings.extend_from_slice(&symbol);

                let mut bytes = [0u8; Nlist64::SIZE];
                use scroll::Pwrite as _;
                bytes.pwrite_with(entry, 0, scroll::LE).unwrap();
                symtab_slot.symbols.extend_from_slice(&bytes);

                dysymtab_slot.indirect[entry_off..entry_off + 4]
                    .copy_from_slice(&next_symbol_index.to_le_bytes());

                next_symbol_index += 1;
                minted += 1;
            }
        }

        dysymtab_slot.cmd.nundefsym += minted;

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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_uleb(value: u64) -> Vec<u8> {
        crate::leb128::encode_uleb128(value)
    }

    #[test]
    fn bind_reader_walks_a_lazy_stream() {
        // SET_SEGMENT_AND_OFFSET(1, 0x10), SET_DYLIB_ORDINAL_IMM(2),
        // SET_SYMBOL("_malloc"), DO_BIND, DONE
        let mut stream = vec![BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1];
        stream.extend(encode_uleb(0x10));
        stream.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 2);
        stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        stream.extend_from_slice(b"_malloc\0");
        stream.push(BIND_OPCODE_DO_BIND);
        stream.push(BIND_OPCODE_DONE);

        let records = BindReader::new(&stream, 0, stream.len()).collect().unwrap();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.segment, Some(1));
        assert_eq!(record.offset, Some(0x10));
        assert_eq!(record.ordinal, Some(2));
        assert_eq!(record.symbol.as_deref(), Some(&b"_malloc\0"[..]));
    }

    #[test]
    fn bind_reader_expands_repeat_opcodes() {
        let mut stream = vec![BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB];
        stream.extend(encode_uleb(0));
        stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        stream.extend_from_slice(b"_sym\0");
        stream.push(BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB);
        stream.extend(encode_uleb(3)); // count
        stream.extend(encode_uleb(8)); // skip
        stream.push(BIND_OPCODE_DONE);

        let records = BindReader::new(&stream, 0, stream.len()).collect().unwrap();
        assert_eq!(records.len(), 3);
        // each bind advances by skip + 8
        assert_eq!(records[0].offset, Some(0));
        assert_eq!(records[1].offset, Some(16));
        assert_eq!(records[2].offset, Some(32));
    }

    #[test]
    fn bind_reader_rejects_unknown_opcodes() {
        let stream = [0xe0u8];
        assert!(BindReader::new(&stream, 0, 1).collect().is_err());
    }

    #[test]
    fn bind_reader_applies_signed_addr_deltas() {
        let mut stream = vec![BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB];
        stream.extend(encode_uleb(0x20));
        stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        stream.extend_from_slice(b"_s\0");
        stream.push(BIND_OPCODE_DO_BIND);
        // ADD_ADDR_ULEB with a 64-bit encoding of -16
        stream.push(BIND_OPCODE_ADD_ADDR_ULEB);
        stream.extend(encode_uleb((-16i64) as u64));
        stream.push(BIND_OPCODE_DO_BIND);

        let records = BindReader::new(&stream, 0, stream.len()).collect().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, Some(0x20));
        // 0x20 + 8 - 16 = 0x18
        assert_eq!(records[1].offset, Some(0x18));
    }
}
