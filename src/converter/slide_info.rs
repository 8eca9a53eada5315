//! Decompresses the cache's chained slide-info pointers back into
//! plain 64-bit addresses.
//!
//! Pointers in the shared cache do not carry the usual rebase info of a
//! standalone Mach-O; the rebase state is packed into the pointers
//! themselves as per-page chains. The rebaser walks every chain that
//! covers a segment of the image, writes back the unslid value, and
//! records the location for the rebase generator.

use log::{error, warn};

use crate::cache::structs::{
    DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA, DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE,
    DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE, SlideInfo2, SlideInfo3, SlidePointer3, header_field,
};
use crate::cache::{CacheMapping, DyldCache};
use crate::error::{ExtractError, Result};
use crate::extraction::ExtractionContext;

/// A cache mapping paired with the slide info that covers it.
#[derive(Debug, Clone, Copy)]
pub struct MappingSlidePair {
    pub mapping: CacheMapping,
    pub slide: SlideVersion,
}

#[derive(Debug, Clone, Copy)]
pub enum SlideVersion {
    V2 {
        file_index: usize,
        offset: u64,
        info: SlideInfo2,
    },
    V3 {
        file_index: usize,
        offset: u64,
        info: SlideInfo3,
    },
}

/// Collects every (mapping, slide info) pair in the cache.
///
/// Legacy caches store one blob for mapping[1] in the header; newer
/// caches carry per-mapping blobs in `mapping_with_slide` entries. The
/// legacy field wins only when it is non-zero.
pub fn mapping_slide_pairs(cache: &DyldCache) -> Result<Vec<MappingSlidePair>> {
    let header = cache.header();
    let mut pairs = Vec::new();

    if header.slide_info_offset_unused != 0 {
        let offset = header.slide_info_offset_unused;
        // Only the second mapping has slide info in this layout.
        let mapping = *cache.mappings.get(1).ok_or_else(|| {
            ExtractError::ContainerParse("legacy slide info with fewer than two mappings".into())
        })?;
        if let Some(slide) = read_slide_version(cache, 0, offset)? {
            pairs.push(MappingSlidePair { mapping, slide });
        }
    } else if header.contains_field(header_field::MAPPING_WITH_SLIDE_OFFSET) {
        for mapping in &cache.mappings {
            if mapping.slide_info_file_offset == 0 {
                continue;
            }
            if let Some(slide) =
                read_slide_version(cache, mapping.file_index, mapping.slide_info_file_offset)?
            {
                pairs.push(MappingSlidePair {
                    mapping: *mapping,
                    slide,
                });
            }
        }
    } else {
        return Err(ExtractError::ContainerParse(
            "cache has no slide info".into(),
        ));
    }

    Ok(pairs)
}

fn read_slide_version(
    cache: &DyldCache,
    file_index: usize,
    offset: u64,
) -> Result<Option<SlideVersion>> {
    // the version is encoded as the first uint32 field
    let version: u32 = cache.read(file_index, offset)?;
    match version {
        2 => Ok(Some(SlideVersion::V2 {
            file_index,
            offset,
            info: cache.read(file_index, offset)?,
        })),
        3 => Ok(Some(SlideVersion::V3 {
            file_index,
            offset,
            info: cache.read(file_index, offset)?,
        })),
        unknown => {
            error!("Unknown slide info version: {unknown}");
            Ok(None)
        }
    }
}

/// Walks one v2 page chain in place. Returns the page offsets of every
/// rebased slot.
///
/// `delta = (raw & delta_mask) >> (ctz(delta_mask) - 2)` in bytes;
/// `value = raw & !delta_mask`, plus `value_add` when non-zero. A zero
/// delta terminates the chain.
pub fn rebase_v2_page(
    page: &mut [u8],
    first_offset: usize,
    delta_mask: u64,
    value_add: u64,
) -> Result<Vec<usize>> {
    let delta_shift = delta_mask.trailing_zeros() - 2;
    let value_mask = !delta_mask;

    let mut rebased = Vec::new();
    let mut offset = first_offset;

    loop {
        let slot = page
            .get(offset..offset + 8)
            .ok_or_else(|| ExtractError::ChainCorrupt(format!(
                "v2 chain leaves its page at offset {offset:#x}"
            )))?;
        let raw = u64::from_le_bytes(slot.try_into().unwrap());

        let delta = ((raw & delta_mask) >> delta_shift) as usize;

        let mut value = raw & value_mask;
        if value != 0 {
            value += value_add;
        }

        page[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        rebased.push(offset);

        if delta == 0 {
            break;
        }
        offset += delta;
    }

    Ok(rebased)
}

/// Walks one v3 (arm64e) page chain in place. Returns the page offsets
/// of every rebased slot.
pub fn rebase_v3_page(
    page: &mut [u8],
    first_offset: usize,
    auth_value_add: u64,
) -> Result<Vec<usize>> {
    let mut rebased = Vec::new();
    let mut offset = first_offset;

    loop {
        let slot = page
            .get(offset..offset + 8)
            .ok_or_else(|| ExtractError::ChainCorrupt(format!(
                "v3 chain leaves its page at offset {offset:#x}"
            )))?;
        let pointer = SlidePointer3(u64::from_le_bytes(slot.try_into().unwrap()));

        // The deltas encoded in the pointers are 8-byte strides.
        let delta = (pointer.offset_to_next_pointer() * 8) as usize;

        let value = if pointer.authenticated() {
            pointer.offset_from_shared_cache_base() + auth_value_add
        } else {
            pointer.pointer_value()
        };

        page[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        rebased.push(offset);

        if delta == 0 {
            break;
        }
        offset += delta;
    }

    Ok(rebased)
}

fn read_page_starts(
    cache: &DyldCache,
    file_index: usize,
    offset: u64,
    count: usize,
) -> Result<Vec<u16>> {
    let bytes = cache.read_bytes(file_index, offset, count * 2)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Page indices of the mapping that cover the segment.
fn segment_page_range(
    seg_vmaddr: u64,
    seg_vmsize: u64,
    mapping: &CacheMapping,
    page_size: u64,
    page_count: usize,
) -> Option<(usize, usize)> {
    if !mapping.contains_addr(seg_vmaddr) {
        return None;
    }

    let start_index = ((seg_vmaddr - mapping.address) / page_size) as usize;
    let end_index = (((seg_vmaddr + seg_vmsize - mapping.address) + page_size) / page_size)
        as usize;

    Some((start_index, end_index.min(page_count)))
}

fn rebase_with_pair(
    cache: &mut DyldCache,
    ctx: &mut ExtractionContext<'_>,
    pair: &MappingSlidePair,
) -> Result<()> {
    ctx.status.update(Some("Slide Info Rebaser"), None);

    let segments: Vec<(u64, u64)> = ctx
        .macho
        .segments()
        .map(|seg| (seg.seg.vmaddr, seg.seg.vmsize))
        .collect();

    match pair.slide {
        SlideVersion::V2 {
            file_index,
            offset,
            info,
        } => {
            let page_starts = read_page_starts(
                cache,
                file_index,
                offset + info.page_starts_offset as u64,
                info.page_starts_count as usize,
            )?;
            let page_size = info.page_size as u64;

            for (vmaddr, vmsize) in segments {
                let Some((start, end)) = segment_page_range(
                    vmaddr,
                    vmsize,
                    &pair.mapping,
                    page_size,
                    page_starts.len(),
                ) else {
                    continue;
                };

                for i in start..end {
                    let page = page_starts[i];
                    if page == DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE {
                        continue;
                    }
                    if page & DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA != 0 {
                        let page_addr = pair.mapping.address + i as u64 * page_size;
                        warn!("Unable to handle page extras at {page_addr:#x}");
                        continue;
                    }

                    let page_off = pair.mapping.file_offset + i as u64 * page_size;
                    let page_addr = pair.mapping.address + i as u64 * page_size;
                    let page_bytes = page_slice(cache, pair.mapping.file_index, page_off, page_size)?;

                    // page starts are 4-byte strides
                    let rebased =
                        rebase_v2_page(page_bytes, page as usize * 4, info.delta_mask, info.value_add)?;
                    for slot in rebased {
                        ctx.ptr_tracker.add(page_addr + slot as u64);
                    }

                    ctx.status.update(None, Some("Rebasing Pages"));
                }
            }
        }
        SlideVersion::V3 {
            file_index,
            offset,
            info,
        } => {
            let page_starts = read_page_starts(
                cache,
                file_index,
                offset + SlideInfo3::SIZE as u64,
                info.page_starts_count as usize,
            )?;
            let page_size = info.page_size as u64;

            for (vmaddr, vmsize) in segments {
                let Some((start, end)) = segment_page_range(
                    vmaddr,
                    vmsize,
                    &pair.mapping,
                    page_size,
                    page_starts.len(),
                ) else {
                    continue;
                };

                for i in start..end {
                    let page = page_starts[i];
                    if page == DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
                        continue;
                    }

                    let page_off = pair.mapping.file_offset + i as u64 * page_size;
                    let page_addr = pair.mapping.address + i as u64 * page_size;
                    let page_bytes = page_slice(cache, pair.mapping.file_index, page_off, page_size)?;

                    let rebased = rebase_v3_page(page_bytes, page as usize, info.auth_value_add)?;
                    for slot in rebased {
                        ctx.ptr_tracker.add(page_addr + slot as u64);
                    }

                    ctx.status.update(None, Some("Rebasing Pages"));
                }
            }
        }
    }

    Ok(())
}

fn page_slice(
    cache: &mut DyldCache,
    file_index: usize,
    page_off: u64,
    page_size: u64,
) -> Result<&mut [u8]> {
    let data = cache.data_mut(file_index);
    let start = page_off as usize;
    let end = (page_off + page_size).min(data.len() as u64) as usize;
    data.get_mut(start..end)
        .ok_or_else(|| ExtractError::ChainCorrupt("slide page outside its file".into()))
}

/// Processes and removes all chained rebase info covering the image.
pub fn process_slide_info(cache: &mut DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<()> {
    let pairs = mapping_slide_pairs(cache)?;
    for pair in &pairs {
        rebase_with_pair(cache, ctx, pair)?;
    }
    Ok(())
}

/// Slides individual pointers on demand, without rewriting them.
pub struct PointerSlider {
    pairs: Vec<MappingSlidePair>,
}

impl PointerSlider {
    pub fn new(cache: &DyldCache) -> Result<Self> {
        Ok(PointerSlider {
            pairs: mapping_slide_pairs(cache)?,
        })
    }

    /// Reads and unslides the pointer stored at `vmaddr`. Returns
    /// `None` when the address has no slide info covering it.
    pub fn slide_address(&self, cache: &DyldCache, vmaddr: u64) -> Option<u64> {
        let (file_index, offset) = cache.resolve_addr(vmaddr)?;

        let pair = self
            .pairs
            .iter()
            .find(|pair| pair.mapping.contains_addr(vmaddr))?;

        match pair.slide {
            SlideVersion::V2 { .. } => {
                // regular arm64 pointer: the value lives in the low bits
                let raw: u64 = cache.read(file_index, offset).ok()?;
                Some(raw & 0xf_ffff_ffff)
            }
            SlideVersion::V3 { info, .. } => {
                let raw: u64 = cache.read(file_index, offset).ok()?;
                let pointer = SlidePointer3(raw);
                if pointer.authenticated() {
                    Some(pointer.offset_from_shared_cache_base() + info.auth_value_add)
                } else {
                    Some(pointer.pointer_value())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1: the first slot yields value + value_add and a 4-byte delta.
    #[test]
    fn v2_chain_decodes_value_and_delta() {
        let delta_mask = 0x00ff_ff00_0000_0000u64;
        let value_add = 0x1_8000_0000u64;

        let mut page = vec![0u8; 0x4000];
        // slot 0: value 0x1234, delta 1 stride (4 bytes)
        page[0..8].copy_from_slice(&0x0000_0100_0000_1234u64.to_le_bytes());
        // slot at 4: value 0, delta 0 terminates
        page[4..12].copy_from_slice(&0u64.to_le_bytes());

        let rebased = rebase_v2_page(&mut page, 0, delta_mask, value_add).unwrap();
        assert_eq!(rebased, vec![0, 4]);

        let first = u64::from_le_bytes(page[0..8].try_into().unwrap());
        assert_eq!(first, 0x1_8000_1234);

        // value 0 stays 0, no value_add
        let second = u64::from_le_bytes(page[4..12].try_into().unwrap());
        assert_eq!(second, 0);
    }

    #[test]
    fn v2_chain_that_escapes_its_page_is_corrupt() {
        let delta_mask = 0x00ff_ff00_0000_0000u64;
        let mut page = vec![0u8; 16];
        // delta pointing far outside the page
        page[0..8].copy_from_slice(&0x00ff_ff00_0000_0000u64.to_le_bytes());
        assert!(rebase_v2_page(&mut page, 0, delta_mask, 0).is_err());
    }

    // S2: plain and auth v3 slots.
    #[test]
    fn v3_chain_handles_plain_and_auth_slots() {
        let auth_value_add = 0x1_8000_0000u64;

        let mut page = vec![0u8; 64];
        // plain slot with delta 1 (8 bytes): value 0x1234
        let plain = 0x1234u64 | (1u64 << 51);
        page[0..8].copy_from_slice(&plain.to_le_bytes());
        // auth slot, terminal: offset 0x12345678
        let auth = 0x8000_0000_1234_5678u64;
        page[8..16].copy_from_slice(&auth.to_le_bytes());

        let rebased = rebase_v3_page(&mut page, 0, auth_value_add).unwrap();
        assert_eq!(rebased, vec![0, 8]);

        assert_eq!(
            u64::from_le_bytes(page[0..8].try_into().unwrap()),
            0x1234
        );
        assert_eq!(
            u64::from_le_bytes(page[8..16].try_into().unwrap()),
            0x1_9234_5678
        );
    }

    #[test]
    fn page_range_clamps_to_the_mapping() {
        let mapping = CacheMapping {
            address: 0x1_8000_0000,
            size: 0x10000,
            file_offset: 0,
            file_index: 0,
            slide_info_file_offset: 0,
            slide_info_file_size: 0,
        };

        // segment outside the mapping
        assert!(segment_page_range(0x2_0000_0000, 0x4000, &mapping, 0x4000, 4).is_none());

        // segment covering the first page
        let (start, end) = segment_page_range(0x1_8000_0000, 0x4000, &mapping, 0x4000, 4).unwrap();
        assert_eq!(start, 0);
        assert!(end <= 4 && end > start);
    }
}
