//! Re-computes file offsets for the detached image.
//!
//! Mach-O files inside the cache keep the huge offsets of the merged
//! file. This walks the segments in load-command order, packs them from
//! offset zero at 16 KiB alignment, and emits one copy procedure per
//! segment for the downstream writer.

use crate::builder::LinkeditBuilder;
use crate::cache::DyldCache;
use crate::error::{ExtractError, Result};
use crate::extraction::{EXTRA_SEGMENT_NAME, ExtractionContext};
use crate::macho::SegmentInfo;

const PAGE_SIZE: u64 = 0x4000;

/// Where a copy procedure reads its bytes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySource {
    /// One of the mapped cache files.
    CacheFile(usize),
    /// The in-memory `__EXTRA_OBJC` buffer.
    ExtraData,
}

/// One copy the writer must perform to produce the output file.
#[derive(Debug, Clone, Copy)]
pub struct WriteProcedure {
    /// Offset in the output file.
    pub write_offset: u64,
    /// Offset inside the source.
    pub read_offset: u64,
    pub size: u64,
    pub source: CopySource,
}

/// Assigns every segment its offset in the output file and returns the
/// copy procedures that materialize it.
pub fn optimize_offsets(
    cache: &mut DyldCache,
    ctx: &mut ExtractionContext<'_>,
) -> Result<Vec<WriteProcedure>> {
    ctx.status.update(Some("Optimize Offsets"), None);

    let segments: Vec<SegmentInfo> = ctx.macho.segments().cloned().collect();

    let mut procedures = Vec::with_capacity(segments.len());
    let mut data_head = 0u64;

    for seg_info in &segments {
        let seg = seg_info.seg;
        let shift_delta = data_head as i64 - seg.fileoff as i64;

        if seg.name() == EXTRA_SEGMENT_NAME {
            procedures.push(WriteProcedure {
                write_offset: data_head,
                read_offset: 0,
                size: seg.filesize,
                source: CopySource::ExtraData,
            });
        } else {
            // the recorded fileoff is not trustworthy for cache-split
            // images; resolve through the address instead
            let (file, read_offset) = cache
                .resolve_addr(seg.vmaddr)
                .ok_or(ExtractError::MappingMiss(seg.vmaddr))?;
            procedures.push(WriteProcedure {
                write_offset: data_head,
                read_offset,
                size: seg.filesize,
                source: CopySource::CacheFile(file),
            });
        }

        if seg.name() == b"__LINKEDIT" {
            // the linkedit builder re-points every linkedit-referencing
            // load command itself
            LinkeditBuilder::new(cache, &ctx.macho)?.relayout_for_output(
                cache,
                &mut ctx.macho,
                data_head,
            )?;
        } else {
            let mut seg = seg;
            seg.fileoff = (seg.fileoff as i64 + shift_delta) as u64;
            cache.write(ctx.macho.file_index, seg_info.cmd_offset, seg)?;

            for section in &seg_info.sections {
                let mut sect = section.sect;
                sect.offset = (i64::from(sect.offset) + shift_delta).max(0) as u32;
                cache.write(ctx.macho.file_index, section.cmd_offset, sect)?;
            }
        }

        // advance to the next page-aligned offset
        data_head += seg.filesize;
        data_head += PAGE_SIZE - (data_head % PAGE_SIZE);
    }

    ctx.macho.reload(cache)?;
    Ok(procedures)
}

#[cfg(test)]
mod tests {
    use super::*;

    // P6 helper: procedures must not overlap in the output file and
    // must start at zero.
    #[test]
    fn packed_offsets_do_not_overlap() {
        let sizes = [0x8000u64, 0x4000, 0x2fff, 0x6001];

        let mut data_head = 0u64;
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for size in sizes {
            ranges.push((data_head, data_head + size));
            data_head += size;
            data_head += PAGE_SIZE - (data_head % PAGE_SIZE);
        }

        assert_eq!(ranges[0].0, 0);
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
            assert_eq!(pair[1].0 % PAGE_SIZE, 0);
        }
    }
}
