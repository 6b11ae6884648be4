use std::fs;
use std::path::PathBuf;

use tracing::warn;

use crate::error::{TransferError, TransferResult};
use crate::transfer::TransferId;

/// Per-transfer scratch directory. Holds one backing store and one resume
/// marker per chunk, keyed by `(transfer_id, position)`. Everything under it
/// is removed on successful completion and kept on any other outcome.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
    transfer_id: TransferId,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>, transfer_id: TransferId) -> Self {
        Self {
            root: root.into(),
            transfer_id,
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(self.transfer_id.to_string())
    }

    pub fn ensure_dir(&self) -> TransferResult<()> {
        fs::create_dir_all(self.dir()).map_err(|err| TransferError::Io(err.to_string()))
    }

    pub fn chunk_store(&self, position: u32) -> PathBuf {
        self.dir()
            .join(format!("{}.{}.tmp", self.transfer_id, position))
    }

    pub fn marker_path(&self, position: u32) -> PathBuf {
        self.dir()
            .join(format!("{}.{}.tmp.txt", self.transfer_id, position))
    }

    /// Bytes recorded for a chunk by a previous run. A missing or unreadable
    /// marker counts as zero.
    pub fn read_marker(&self, position: u32) -> u64 {
        match fs::read_to_string(self.marker_path(position)) {
            Ok(text) => text.trim().parse::<u64>().unwrap_or(0),
            Err(_) => 0,
        }
    }

    pub fn write_marker(&self, position: u32, downloaded: u64) -> TransferResult<()> {
        fs::write(self.marker_path(position), downloaded.to_string())
            .map_err(|err| TransferError::Io(err.to_string()))
    }

    pub fn remove_chunk_files(&self, position: u32) {
        if let Err(err) = fs::remove_file(self.chunk_store(position)) {
            warn!("could not remove chunk store {}: {}", position, err);
        }
        if let Err(err) = fs::remove_file(self.marker_path(position)) {
            warn!("could not remove resume marker {}: {}", position, err);
        }
    }

    pub fn remove_dir(&self) {
        if let Err(err) = fs::remove_dir_all(self.dir()) {
            warn!("could not remove scratch dir: {}", err);
        }
    }
}
