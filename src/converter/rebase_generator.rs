//! Emits legacy rebase opcodes for every pointer the slide-info
//! rebaser recorded.
//!
//! The stream is deliberately simple: one SET_TYPE_IMM up front, then a
//! SET_SEGMENT_AND_OFFSET_ULEB + DO_REBASE_IMM_TIMES(1) pair per
//! pointer, bucketed by segment in ascending address order, closed by
//! DONE.

use log::error;

use crate::builder::LinkeditBuilder;
use crate::cache::DyldCache;
use crate::error::{ExtractError, Result};
use crate::extraction::{ExtractionContext, PointerTracker};
use crate::leb128::encode_uleb128;
use crate::macho::constants::{
    REBASE_OPCODE_DO_REBASE_IMM_TIMES, REBASE_OPCODE_DONE,
    REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB, REBASE_OPCODE_SET_TYPE_IMM, REBASE_TYPE_POINTER,
};

/// Builds the opcode stream for pointers bucketed into the given
/// `(vmaddr, vmsize)` segments. Returns the stream and the number of
/// pointers it covers.
pub fn build_rebase_stream(segments: &[(u64, u64)], tracker: &PointerTracker) -> (Vec<u8>, usize) {
    // each pointer belongs to exactly one bucket: the first segment
    // that covers it
    let mut buckets: Vec<Vec<u64>> = vec![Vec::new(); segments.len()];
    let mut emitted = 0;
    for ptr in tracker.iter() {
        let owner = segments
            .iter()
            .position(|&(vmaddr, vmsize)| ptr >= vmaddr && ptr < vmaddr + vmsize);
        if let Some(seg_index) = owner {
            buckets[seg_index].push(ptr);
            emitted += 1;
        }
    }

    let mut stream = vec![REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER];
    for (seg_index, bucket) in buckets.iter().enumerate() {
        for &ptr in bucket {
            stream.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg_index as u8);
            stream.extend(encode_uleb128(ptr - segments[seg_index].0));
            stream.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
        }
    }

    stream.push(REBASE_OPCODE_DONE);
    (stream, emitted)
}

pub fn generate_rebase_info(cache: &mut DyldCache, ctx: &mut ExtractionContext<'_>) -> Result<()> {
    ctx.status.update(Some("Rebase Generator"), None);

    // without a dyld-info command there is nowhere to put the stream
    if ctx.macho.dyld_info().is_none() {
        return Ok(());
    }

    let segments: Vec<(u64, u64)> = ctx
        .macho
        .segments()
        .map(|seg| (seg.seg.vmaddr, seg.seg.vmsize))
        .collect();

    ctx.status.update(None, Some("Generating"));
    let (stream, emitted) = build_rebase_stream(&segments, &ctx.ptr_tracker);
    if emitted != ctx.ptr_tracker.len() {
        error!("Missed some pointers while bucketing them into segments!");
    }

    let mut builder = LinkeditBuilder::new(cache, &ctx.macho)?;
    match builder.dyld_info.as_mut() {
        Some(info) => info.rebase = stream,
        None => return Ok(()),
    }

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leb128::decode_uleb128;
    use crate::macho::constants::{REBASE_IMMEDIATE_MASK, REBASE_OPCODE_MASK};

    /// Minimal interpreter for the opcode subset the generator emits.
    fn replay(stream: &[u8], segments: &[(u64, u64)]) -> Vec<u64> {
        let mut visited = Vec::new();
        let mut segment = 0usize;
        let mut offset = 0u64;

        let mut pos = 0;
        loop {
            let byte = stream[pos];
            let opcode = byte & REBASE_OPCODE_MASK;
            let imm = byte & REBASE_IMMEDIATE_MASK;
            pos += 1;

            match opcode {
                REBASE_OPCODE_DONE => break,
                REBASE_OPCODE_SET_TYPE_IMM => assert_eq!(imm, REBASE_TYPE_POINTER),
                REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    segment = imm as usize;
                    let (value, next) = decode_uleb128(stream, pos).unwrap();
                    offset = value;
                    pos = next;
                }
                REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                    for _ in 0..imm {
                        visited.push(segments[segment].0 + offset);
                        offset += 8;
                    }
                }
                other => panic!("unexpected opcode {other:#x}"),
            }
        }

        visited
    }

    // S6: the replayed stream visits exactly the tracked addresses in
    // order, even though the two segments overlap at 0x1_0000_2000.
    #[test]
    fn stream_replays_to_the_tracked_pointers() {
        let segments = [(0x1_0000_0000u64, 0x4000u64), (0x1_0000_2000, 0x4000)];

        let mut tracker = PointerTracker::default();
        tracker.add(0x1_0000_1000);
        tracker.add(0x1_0000_1008);
        tracker.add(0x1_0000_2000);

        let (stream, emitted) = build_rebase_stream(&segments, &tracker);
        assert_eq!(emitted, 3);

        let visited = replay(&stream, &segments);
        assert_eq!(
            visited,
            vec![0x1_0000_1000, 0x1_0000_1008, 0x1_0000_2000]
        );
    }

    #[test]
    fn disjoint_segments_emit_each_pointer_once() {
        let segments = [(0x1_0000_0000u64, 0x2000u64), (0x1_0000_2000, 0x2000)];

        let mut tracker = PointerTracker::default();
        tracker.add(0x1_0000_1000);
        tracker.add(0x1_0000_1008);
        tracker.add(0x1_0000_2000);

        let (stream, emitted) = build_rebase_stream(&segments, &tracker);
        assert_eq!(emitted, tracker.len());

        let visited = replay(&stream, &segments);
        assert_eq!(
            visited,
            vec![0x1_0000_1000, 0x1_0000_1008, 0x1_0000_2000]
        );
    }

    #[test]
    fn empty_tracker_still_produces_a_valid_stream() {
        let (stream, emitted) = build_rebase_stream(&[(0x1000, 0x1000)], &PointerTracker::default());
        assert_eq!(emitted, 0);
        assert_eq!(
            stream,
            vec![
                REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
                REBASE_OPCODE_DONE
            ]
        );
    }
}
