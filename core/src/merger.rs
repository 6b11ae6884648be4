use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::chunk::{Chunk, ChunkStatus};
use crate::config::EngineConfig;
use crate::error::{TransferError, TransferResult};
use crate::state::{CancelToken, RunState};
use crate::transfer::Phase;

/// Runs the merge pass as a single worker so it never races a download
/// task. Chunks are merged strictly in position order, independent of the
/// order they finished downloading, which is what makes the output
/// byte-identical to a sequential download.
pub fn spawn_merge_worker(
    chunks: Arc<Mutex<Vec<Chunk>>>,
    mut output: Box<dyn Write + Send>,
    state: Arc<RunState>,
    token: CancelToken,
    config: EngineConfig,
) -> JoinHandle<()> {
    state.begin_actions(1);
    state.set_phase(Phase::Merging);
    thread::spawn(move || {
        let interrupted = run_merge(&chunks, &mut output, &state, &token, &config);
        if interrupted {
            // Interruption discards merge bookkeeping wholesale; a later run
            // redoes the merge from the intact backing stores.
            if let Ok(mut chunks) = chunks.lock() {
                for chunk in chunks.iter_mut() {
                    chunk.status = ChunkStatus::Queued;
                    chunk.error = None;
                }
            }
        }
        state.complete_action();
    })
}

/// Returns true when the pass observed an interruption.
fn run_merge(
    chunks: &Arc<Mutex<Vec<Chunk>>>,
    output: &mut Box<dyn Write + Send>,
    state: &RunState,
    token: &CancelToken,
    config: &EngineConfig,
) -> bool {
    let count = chunks.lock().map(|chunks| chunks.len()).unwrap_or(0);
    for index in 0..count {
        if token.is_stopped() {
            return true;
        }
        if let Err(err) = merge_chunk(index, chunks, output, state, token, config) {
            warn!("merge failed for chunk {}: {}", index + 1, err);
            if let Ok(mut chunks) = chunks.lock() {
                if let Some(chunk) = chunks.get_mut(index) {
                    chunk.status = ChunkStatus::Error;
                    chunk.error = Some(err);
                }
            }
            // An I/O fault aborts the remaining merge sequence.
            return false;
        }
    }
    if token.is_stopped() {
        return true;
    }
    if let Err(err) = output.flush() {
        warn!("could not flush merge output: {}", err);
    }
    false
}

fn merge_chunk(
    index: usize,
    chunks: &Arc<Mutex<Vec<Chunk>>>,
    output: &mut Box<dyn Write + Send>,
    state: &RunState,
    token: &CancelToken,
    config: &EngineConfig,
) -> TransferResult<()> {
    let store = {
        let mut chunks = chunks
            .lock()
            .map_err(|_| TransferError::InvalidState("chunk lock poisoned".to_string()))?;
        let chunk = chunks
            .get_mut(index)
            .ok_or_else(|| TransferError::InvalidState(format!("no chunk at index {}", index)))?;
        chunk.status = ChunkStatus::Merging;
        chunk.store.clone()
    };

    let mut file = File::open(&store).map_err(|err| TransferError::Io(err.to_string()))?;
    let mut buffer = vec![0u8; config.buffer_size_bytes];
    loop {
        if token.is_stopped() {
            // Leave the chunk MERGING; the caller reverts the whole pass.
            return Ok(());
        }
        let read = file
            .read(&mut buffer)
            .map_err(|err| TransferError::Io(err.to_string()))?;
        if read == 0 {
            break;
        }
        output
            .write_all(&buffer[..read])
            .map_err(|err| TransferError::Io(err.to_string()))?;
        state.add_merged(read as u64);
    }

    if let Ok(mut chunks) = chunks.lock() {
        if let Some(chunk) = chunks.get_mut(index) {
            chunk.status = ChunkStatus::Merged;
        }
    }
    state.complete_merge();
    Ok(())
}
