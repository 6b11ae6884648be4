use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::TransferError;
use crate::transfer::TransferId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkStatus {
    Queued,
    Downloading,
    Downloaded,
    Merging,
    Merged,
    Error,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Queued => "queued",
            ChunkStatus::Downloading => "downloading",
            ChunkStatus::Downloaded => "downloaded",
            ChunkStatus::Merging => "merging",
            ChunkStatus::Merged => "merged",
            ChunkStatus::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(ChunkStatus::Queued),
            "downloading" => Some(ChunkStatus::Downloading),
            "downloaded" => Some(ChunkStatus::Downloaded),
            "merging" => Some(ChunkStatus::Merging),
            "merged" => Some(ChunkStatus::Merged),
            "error" => Some(ChunkStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One contiguous byte range of a transfer, downloaded and tracked on its
/// own. `end_bytes` is exclusive; `start_bytes + downloaded` never exceeds
/// it. While a worker owns the chunk, no other thread writes its fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub transfer_id: TransferId,
    pub position: u32,
    pub start_bytes: u64,
    pub end_bytes: u64,
    pub downloaded: u64,
    pub status: ChunkStatus,
    pub error: Option<TransferError>,
    pub store: PathBuf,
}

impl Chunk {
    pub fn new(
        transfer_id: TransferId,
        position: u32,
        start_bytes: u64,
        end_bytes: u64,
        store: PathBuf,
    ) -> Self {
        Self {
            transfer_id,
            position,
            start_bytes,
            end_bytes,
            downloaded: 0,
            status: ChunkStatus::Queued,
            error: None,
            store,
        }
    }

    pub fn size(&self) -> u64 {
        self.end_bytes.saturating_sub(self.start_bytes)
    }

    pub fn remaining(&self) -> u64 {
        self.end_bytes
            .saturating_sub(self.start_bytes + self.downloaded)
    }

    /// Absolute offset the next ranged read for this chunk starts at.
    pub fn resume_offset(&self) -> u64 {
        self.start_bytes + self.downloaded
    }

    pub fn is_downloaded(&self) -> bool {
        self.status == ChunkStatus::Downloaded
    }
}
