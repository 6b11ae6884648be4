use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::chunk::{Chunk, ChunkStatus};
use crate::config::EngineConfig;
use crate::error::{TransferError, TransferResult};
use crate::net::{TransferRequest, Transport};
use crate::scratch::ScratchDir;
use crate::state::{CancelToken, RunState};
use crate::transfer::Phase;

/// Spawns one worker per pending chunk. A worker owns its chunk exclusively
/// for the duration of the pass: nothing else writes that chunk's fields
/// while the worker runs, and a worker never touches a sibling chunk.
#[allow(clippy::too_many_arguments)]
pub fn spawn_chunk_workers(
    chunks: &Arc<Mutex<Vec<Chunk>>>,
    pending: Vec<usize>,
    request: &TransferRequest,
    transport: &Arc<dyn Transport>,
    scratch: &ScratchDir,
    state: &Arc<RunState>,
    token: &CancelToken,
    config: &EngineConfig,
) -> Vec<JoinHandle<()>> {
    state.begin_actions(pending.len() as u64);
    if pending.is_empty() {
        return Vec::new();
    }
    state.set_phase(Phase::Downloading);

    let mut handles = Vec::with_capacity(pending.len());
    for index in pending {
        if token.is_stopped() {
            break;
        }
        if let Ok(mut chunks) = chunks.lock() {
            if let Some(chunk) = chunks.get_mut(index) {
                chunk.status = ChunkStatus::Downloading;
            }
        }

        let chunks = Arc::clone(chunks);
        let request = request.clone();
        let transport = Arc::clone(transport);
        let scratch = scratch.clone();
        let state = Arc::clone(state);
        let token = token.clone();
        let config = config.clone();
        let handle = thread::spawn(move || {
            let outcome = download_chunk(
                index,
                &chunks,
                &request,
                transport.as_ref(),
                &scratch,
                &state,
                &token,
                &config,
            );
            if let Err(err) = outcome {
                if let Ok(mut chunks) = chunks.lock() {
                    if let Some(chunk) = chunks.get_mut(index) {
                        chunk.status = ChunkStatus::Error;
                        chunk.error = Some(err);
                    }
                }
            }
            state.complete_action();
        });
        handles.push(handle);
    }
    handles
}

/// Drives a single chunk: a ranged read from `start + downloaded`, streamed
/// into the chunk's backing store. A fault here stays with this chunk and
/// never aborts sibling workers.
#[allow(clippy::too_many_arguments)]
fn download_chunk(
    index: usize,
    chunks: &Arc<Mutex<Vec<Chunk>>>,
    request: &TransferRequest,
    transport: &dyn Transport,
    scratch: &ScratchDir,
    state: &RunState,
    token: &CancelToken,
    config: &EngineConfig,
) -> TransferResult<()> {
    let (position, start, end, mut downloaded, store) = {
        let chunks = chunks
            .lock()
            .map_err(|_| TransferError::InvalidState("chunk lock poisoned".to_string()))?;
        let chunk = chunks
            .get(index)
            .ok_or_else(|| TransferError::InvalidState(format!("no chunk at index {}", index)))?;
        (
            chunk.position,
            chunk.start_bytes,
            chunk.end_bytes,
            chunk.downloaded,
            chunk.store.clone(),
        )
    };

    if token.is_stopped() {
        return Ok(());
    }

    let chunk_request = request.clone().with_range_start(start + downloaded);
    let response = transport.execute(&chunk_request)?;
    let Some(mut response) = response else {
        return Err(TransferError::EmptyResponse);
    };
    if !response.is_successful {
        let status = response.status_code;
        transport.disconnect(response);
        return Err(TransferError::ResponseNotSuccessful(status));
    }

    // A non-partial response replays the chunk from its first byte, so the
    // store restarts at offset zero and the counters shed the stale bytes.
    if !response.is_partial() && downloaded > 0 {
        state.sub_downloaded(downloaded);
        set_chunk_downloaded(chunks, index, 0);
        downloaded = 0;
    }

    let result = stream_chunk(
        &mut response.body,
        index,
        position,
        start,
        end,
        downloaded,
        &store,
        chunks,
        scratch,
        state,
        token,
        config,
    );
    transport.disconnect(response);
    result
}

#[allow(clippy::too_many_arguments)]
fn stream_chunk(
    body: &mut Box<dyn Read + Send>,
    index: usize,
    position: u32,
    start: u64,
    end: u64,
    mut downloaded: u64,
    store: &std::path::Path,
    chunks: &Arc<Mutex<Vec<Chunk>>>,
    scratch: &ScratchDir,
    state: &RunState,
    token: &CancelToken,
    config: &EngineConfig,
) -> TransferResult<()> {
    scratch.ensure_dir()?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(store)
        .map_err(|err| TransferError::Io(err.to_string()))?;
    file.seek(SeekFrom::Start(downloaded))
        .map_err(|err| TransferError::Io(err.to_string()))?;

    let flush_interval = Duration::from_millis(config.marker_flush_interval_ms);
    let mut last_flush = Instant::now();
    let mut buffer = vec![0u8; config.buffer_size_bytes];
    let mut remaining = end - (start + downloaded);

    while remaining > 0 && !token.is_stopped() {
        let read = body
            .read(&mut buffer)
            .map_err(|err| TransferError::Network(err.to_string()))?;
        if read == 0 {
            break;
        }
        // Clip the final buffer so the store never grows past the chunk
        // boundary even if the transport returns extra bytes.
        let take = (read as u64).min(remaining) as usize;
        file.write_all(&buffer[..take])
            .map_err(|err| TransferError::Io(err.to_string()))?;
        downloaded += take as u64;
        remaining -= take as u64;
        add_chunk_downloaded(chunks, index, take as u64);
        state.add_downloaded(take as u64);

        if last_flush.elapsed() >= flush_interval {
            if let Err(err) = scratch.write_marker(position, downloaded) {
                warn!("could not persist resume marker {}: {}", position, err);
            }
            last_flush = Instant::now();
        }
    }

    // All counted bytes are in the store by now, so the marker can never
    // claim more than was flushed.
    if let Err(err) = scratch.write_marker(position, downloaded) {
        warn!("could not persist resume marker {}: {}", position, err);
    }

    let status = if remaining == 0 {
        ChunkStatus::Downloaded
    } else {
        // Early stream end or cooperative cancellation: a later pass retries
        // from the updated offset.
        ChunkStatus::Queued
    };
    if let Ok(mut chunks) = chunks.lock() {
        if let Some(chunk) = chunks.get_mut(index) {
            chunk.status = status;
        }
    }
    debug!("chunk {} finished as {} at {} bytes", position, status, downloaded);
    Ok(())
}

fn add_chunk_downloaded(chunks: &Arc<Mutex<Vec<Chunk>>>, index: usize, bytes: u64) {
    if let Ok(mut chunks) = chunks.lock() {
        if let Some(chunk) = chunks.get_mut(index) {
            chunk.downloaded += bytes;
        }
    }
}

fn set_chunk_downloaded(chunks: &Arc<Mutex<Vec<Chunk>>>, index: usize, bytes: u64) {
    if let Ok(mut chunks) = chunks.lock() {
        if let Some(chunk) = chunks.get_mut(index) {
            chunk.downloaded = bytes;
        }
    }
}
