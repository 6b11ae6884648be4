use crate::chunk::{Chunk, ChunkStatus};
use crate::error::{TransferError, TransferResult};
use crate::scratch::ScratchDir;
use crate::transfer::TransferId;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Planned partition of `[0, total)` plus the byte total already persisted
/// by a previous run, used to seed the progress counters.
#[derive(Debug)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    pub downloaded: u64,
}

/// Computes an ordered, gapless, non-overlapping partition of `[0, total)`
/// and restores each chunk's resume marker. Positions are 1-based.
pub fn plan_chunks(
    transfer_id: TransferId,
    total: u64,
    range_supported: bool,
    hint: Option<u64>,
    scratch: &ScratchDir,
) -> TransferResult<ChunkPlan> {
    if total == 0 {
        return Err(TransferError::InvalidState(
            "cannot plan a transfer of unknown size".to_string(),
        ));
    }

    let (chunk_count, bytes_per_chunk) = if range_supported {
        chunk_layout(total, hint)
    } else {
        (1, total)
    };

    let mut chunks = Vec::with_capacity(chunk_count as usize);
    let mut downloaded_total = 0u64;
    let mut offset = 0u64;
    for position in 1..=chunk_count {
        let start = offset;
        // The last chunk always ends at exactly `total` regardless of
        // rounding, keeping the partition exact.
        let end = if position == chunk_count {
            total
        } else {
            (start + bytes_per_chunk).min(total)
        };
        offset = end;

        let position = position as u32;
        let mut chunk = Chunk::new(transfer_id, position, start, end, scratch.chunk_store(position));
        chunk.downloaded = scratch.read_marker(position).min(chunk.size());
        downloaded_total += chunk.downloaded;
        if chunk.start_bytes + chunk.downloaded == chunk.end_bytes {
            chunk.status = ChunkStatus::Downloaded;
        }
        chunks.push(chunk);
    }

    Ok(ChunkPlan {
        chunks,
        downloaded: downloaded_total,
    })
}

/// Chunk count and size. A hint is a desired bytes-per-chunk; without one
/// the count comes from the total size: 4 chunks from a gibibyte up, 2 from
/// a mebibyte, otherwise a single chunk.
fn chunk_layout(total: u64, hint: Option<u64>) -> (u64, u64) {
    match hint {
        Some(hint) if hint > 0 => {
            let chunk_count = (total + hint - 1) / hint;
            (chunk_count, hint)
        }
        _ => {
            let chunk_count = if total >= GIB {
                4
            } else if total >= MIB {
                2
            } else {
                1
            };
            (chunk_count, (total + chunk_count - 1) / chunk_count)
        }
    }
}
