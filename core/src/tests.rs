use std::fs;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use md5::Md5;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use uuid::Uuid;

use crate::checksum::{ChecksumRequest, ChecksumType};
use crate::chunk::ChunkStatus;
use crate::config::EngineConfig;
use crate::engine::TransferEngine;
use crate::error::{TransferError, TransferResult};
use crate::estimator::{MovingAverage, SpeedEstimator};
use crate::net::{NetworkMonitor, Transport, TransferRequest, TransportResponse, HTTP_PARTIAL};
use crate::observer::TransferObserver;
use crate::planner::plan_chunks;
use crate::scratch::ScratchDir;
use crate::state::{CancelToken, RunState};
use crate::transfer::{file_name_from_url, Phase, Transfer};

/// Serves a transfer out of an in-memory byte vector. Scriptable failure
/// points: a failing offset, an early end of stream, a read delay, and a
/// server-side md5.
struct FakeTransport {
    content: Arc<Vec<u8>>,
    range_supported: bool,
    hint: Option<u64>,
    fail_offset: Option<u64>,
    truncate: Option<(u64, u64)>,
    read_delay: Option<Duration>,
    server_md5: Option<String>,
    requests: Arc<Mutex<Vec<u64>>>,
}

impl FakeTransport {
    fn new(content: Vec<u8>) -> Self {
        Self {
            content: Arc::new(content),
            range_supported: true,
            hint: None,
            fail_offset: None,
            truncate: None,
            read_delay: None,
            server_md5: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Transport for FakeTransport {
    fn execute(&self, req: &TransferRequest) -> TransferResult<Option<TransportResponse>> {
        let start = req.range_start.unwrap_or(0);
        self.requests.lock().unwrap().push(start);
        if self.fail_offset == Some(start) {
            return Ok(Some(TransportResponse {
                status_code: 500,
                is_successful: false,
                content_length: -1,
                content_md5: None,
                body: Box::new(io::empty()),
            }));
        }
        let (status_code, slice_from) = if self.range_supported {
            (HTTP_PARTIAL, (start as usize).min(self.content.len()))
        } else {
            (200, 0)
        };
        let mut bytes = self.content[slice_from..].to_vec();
        if let Some((offset, keep)) = self.truncate {
            if offset == start {
                bytes.truncate(keep as usize);
            }
        }
        Ok(Some(TransportResponse {
            status_code,
            is_successful: true,
            content_length: bytes.len() as i64,
            content_md5: self.server_md5.clone(),
            body: Box::new(SlowReader {
                data: Cursor::new(bytes),
                delay: self.read_delay,
            }),
        }))
    }

    fn chunk_size_hint(&self, _req: &TransferRequest, _total: u64) -> Option<u64> {
        self.hint
    }
}

/// Reader that hands out at most 8 KiB per call, optionally sleeping first,
/// so cancellation tests get plenty of flag checks mid-stream.
struct SlowReader {
    data: Cursor<Vec<u8>>,
    delay: Option<Duration>,
}

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let cap = buf.len().min(8 * 1024);
        self.data.read(&mut buf[..cap])
    }
}

struct Offline;

impl NetworkMonitor for Offline {
    fn is_network_available(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct Recorded {
    started: Mutex<u32>,
    progress: Mutex<Vec<i64>>,
    completed: Mutex<u32>,
    errors: Mutex<Vec<TransferError>>,
}

#[derive(Clone, Default)]
struct RecordingObserver {
    inner: Arc<Recorded>,
}

impl TransferObserver for RecordingObserver {
    fn on_started(&self, _transfer: &Transfer, _eta_millis: i64, _bytes_per_second: u64) {
        *self.inner.started.lock().unwrap() += 1;
    }

    fn on_progress(&self, transfer: &Transfer, _eta_millis: i64, _bytes_per_second: u64) {
        self.inner.progress.lock().unwrap().push(transfer.downloaded);
    }

    fn on_complete(&self, _transfer: &Transfer) {
        *self.inner.completed.lock().unwrap() += 1;
    }

    fn on_error(&self, transfer: &Transfer) {
        if let Some(error) = &transfer.error {
            self.inner.errors.lock().unwrap().push(error.clone());
        }
    }
}

fn test_config(scratch: &Path) -> EngineConfig {
    EngineConfig {
        scratch_dir: scratch.to_path_buf(),
        buffer_size_bytes: 16 * 1024,
        progress_report_interval_ms: 20,
        speed_sample_interval_ms: 20,
        marker_flush_interval_ms: 10,
        poll_interval_ms: 5,
        ..EngineConfig::default()
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn assert_partition(total: u64, expected_chunks: usize, range_supported: bool) {
    let tmp = TempDir::new().unwrap();
    let scratch = ScratchDir::new(tmp.path(), Uuid::new_v4());
    let plan = plan_chunks(Uuid::new_v4(), total, range_supported, None, &scratch).unwrap();
    assert_eq!(plan.chunks.len(), expected_chunks);
    let mut offset = 0u64;
    for (index, chunk) in plan.chunks.iter().enumerate() {
        assert_eq!(chunk.position as usize, index + 1);
        assert_eq!(chunk.start_bytes, offset);
        assert!(chunk.end_bytes > chunk.start_bytes);
        offset = chunk.end_bytes;
    }
    assert_eq!(offset, total);
    let sum: u64 = plan.chunks.iter().map(|chunk| chunk.size()).sum();
    assert_eq!(sum, total);
}

#[test]
fn planner_partitions_exactly() {
    assert_partition(5_000_000, 2, true);
    assert_partition(3 * 1024 * 1024 * 1024, 4, true);
    assert_partition(512_000, 1, true);
    assert_partition(1024 * 1024, 2, true);
}

#[test]
fn planner_splits_five_megabytes_in_half() {
    let tmp = TempDir::new().unwrap();
    let scratch = ScratchDir::new(tmp.path(), Uuid::new_v4());
    let plan = plan_chunks(Uuid::new_v4(), 5_000_000, true, None, &scratch).unwrap();
    assert_eq!(plan.chunks.len(), 2);
    assert_eq!(plan.chunks[0].size(), 2_500_000);
    assert_eq!(plan.chunks[1].size(), 2_500_000);
}

#[test]
fn planner_single_chunk_without_range_support() {
    let tmp = TempDir::new().unwrap();
    let scratch = ScratchDir::new(tmp.path(), Uuid::new_v4());
    let plan = plan_chunks(Uuid::new_v4(), 50_000_000, false, None, &scratch).unwrap();
    assert_eq!(plan.chunks.len(), 1);
    assert_eq!(plan.chunks[0].start_bytes, 0);
    assert_eq!(plan.chunks[0].end_bytes, 50_000_000);
}

#[test]
fn planner_respects_chunk_size_hint() {
    let tmp = TempDir::new().unwrap();
    let scratch = ScratchDir::new(tmp.path(), Uuid::new_v4());
    let plan = plan_chunks(Uuid::new_v4(), 10_000_000, true, Some(3_000_000), &scratch).unwrap();
    assert_eq!(plan.chunks.len(), 4);
    assert_eq!(plan.chunks[0].size(), 3_000_000);
    assert_eq!(plan.chunks[3].size(), 1_000_000);
    assert_eq!(plan.chunks[3].end_bytes, 10_000_000);
}

#[test]
fn planner_restores_resume_markers() {
    let tmp = TempDir::new().unwrap();
    let id = Uuid::new_v4();
    let scratch = ScratchDir::new(tmp.path(), id);
    scratch.ensure_dir().unwrap();
    scratch.write_marker(1, 2_500_000).unwrap();
    scratch.write_marker(2, 1_000_000).unwrap();

    let plan = plan_chunks(id, 5_000_000, true, None, &scratch).unwrap();
    assert_eq!(plan.downloaded, 3_500_000);
    assert_eq!(plan.chunks[0].status, ChunkStatus::Downloaded);
    assert_eq!(plan.chunks[0].downloaded, 2_500_000);
    assert!(plan.chunks[0].is_downloaded());
    assert_eq!(plan.chunks[1].status, ChunkStatus::Queued);
    assert_eq!(plan.chunks[1].downloaded, 1_000_000);
    assert_eq!(plan.chunks[1].resume_offset(), 3_500_000);
    assert_eq!(plan.chunks[1].remaining(), 1_500_000);
}

#[test]
fn planner_rejects_zero_total() {
    let tmp = TempDir::new().unwrap();
    let scratch = ScratchDir::new(tmp.path(), Uuid::new_v4());
    assert!(plan_chunks(Uuid::new_v4(), 0, true, None, &scratch).is_err());
}

#[test]
fn moving_average_favors_recent_samples() {
    let mut average = MovingAverage::new(5);
    for _ in 0..4 {
        average.add(100.0);
    }
    average.add(0.0);
    // Plain mean would be 80; recency weighting pulls toward the newest
    // sample: (100*1 + 100*2 + 100*3 + 100*4 + 0*5) / 15.
    assert!((average.average() - 1000.0 / 15.0).abs() < 0.01);

    for value in 0..7 {
        average.add(value as f64);
    }
    assert_eq!(average.len(), 5);
}

#[test]
fn estimator_eta_unknown_without_throughput() {
    let estimator = SpeedEstimator::new();
    assert_eq!(estimator.bytes_per_second(), 0);
    assert_eq!(estimator.eta_millis(0, 1_000_000), -1);

    let mut estimator = SpeedEstimator::new();
    estimator.sample(1_000);
    assert_eq!(estimator.bytes_per_second(), 1_000);
    assert_eq!(estimator.eta_millis(1_000, 11_000), 10_000);
}

#[test]
fn progress_weighting_per_phase() {
    let state = RunState::new();
    assert_eq!(state.observable_progress(1_000), -1);

    state.set_phase(Phase::Downloading);
    state.add_downloaded(500);
    assert_eq!(state.observable_progress(1_000), 450);
    state.add_downloaded(500);
    assert_eq!(state.observable_progress(1_000), 900);

    assert_eq!(state.downloaded(), 1_000);

    state.set_phase(Phase::Merging);
    state.add_merged(500);
    assert_eq!(state.observable_progress(1_000), 950);
    state.add_merged(500);
    assert_eq!(state.observable_progress(1_000), 1_000);
    assert_eq!(state.merged(), 1_000);

    state.set_phase(Phase::Completed);
    assert_eq!(state.observable_progress(1_000), 1_000);
}

#[test]
fn download_finish_reads_ninety_percent() {
    let state = RunState::new();
    state.set_phase(Phase::Downloading);
    state.add_downloaded(5_000_000);
    assert_eq!(state.observable_progress(5_000_000), 4_500_000);
}

#[test]
fn downloads_and_merges_identical_output() {
    let tmp = TempDir::new().unwrap();
    let content = patterned(3_000_000);
    let dest = tmp.path().join("out.bin");
    let observer = RecordingObserver::default();
    let engine = TransferEngine::new(test_config(&tmp.path().join("scratch")))
        .with_transport(Box::new(FakeTransport::new(content.clone())))
        .with_observer(Box::new(observer.clone()));

    let transfer = Transfer::new("https://example.com/data/out.bin", dest.clone());
    let id = transfer.id;
    let done = engine.run(transfer, CancelToken::new());

    assert!(done.error.is_none());
    assert_eq!(done.phase, Phase::Completed);
    assert_eq!(done.downloaded, 3_000_000);
    assert_eq!(fs::read(&dest).unwrap(), content);
    assert!(!tmp.path().join("scratch").join(id.to_string()).exists());

    assert_eq!(*observer.inner.started.lock().unwrap(), 1);
    assert_eq!(*observer.inner.completed.lock().unwrap(), 1);
    let progress = observer.inner.progress.lock().unwrap();
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(*progress.last().unwrap(), 3_000_000);
}

#[test]
fn single_chunk_when_probe_not_partial() {
    let tmp = TempDir::new().unwrap();
    let content = patterned(2_000_000);
    let dest = tmp.path().join("plain.bin");
    let mut transport = FakeTransport::new(content.clone());
    transport.range_supported = false;
    let requests = Arc::clone(&transport.requests);
    let engine = TransferEngine::new(test_config(&tmp.path().join("scratch")))
        .with_transport(Box::new(transport));

    let done = engine.run(
        Transfer::new("https://example.com/plain.bin", dest.clone()),
        CancelToken::new(),
    );

    assert!(done.error.is_none());
    assert_eq!(done.phase, Phase::Completed);
    assert_eq!(fs::read(&dest).unwrap(), content);
    // One probe plus one chunk request, both from offset zero.
    assert_eq!(*requests.lock().unwrap(), vec![0, 0]);
}

#[test]
fn failed_chunk_fails_transfer_and_keeps_scratch() {
    let tmp = TempDir::new().unwrap();
    let content = patterned(4_000_000);
    let dest = tmp.path().join("broken.bin");
    let mut transport = FakeTransport::new(content);
    transport.fail_offset = Some(2_000_000);
    let observer = RecordingObserver::default();
    let scratch_root = tmp.path().join("scratch");
    let engine = TransferEngine::new(test_config(&scratch_root))
        .with_transport(Box::new(transport))
        .with_observer(Box::new(observer.clone()));

    let transfer = Transfer::new("https://example.com/broken.bin", dest.clone());
    let id = transfer.id;
    let done = engine.run(transfer, CancelToken::new());

    assert_eq!(done.error, Some(TransferError::ResponseNotSuccessful(500)));
    assert_eq!(done.phase, Phase::Idle);
    // Merge never started and the healthy chunk's state is kept for resume.
    assert!(!dest.exists());
    let scratch = ScratchDir::new(scratch_root, id);
    assert_eq!(fs::metadata(scratch.chunk_store(1)).unwrap().len(), 2_000_000);
    assert_eq!(scratch.read_marker(1), 2_000_000);
    assert_eq!(observer.inner.errors.lock().unwrap().len(), 1);
}

#[test]
fn early_stream_end_resumes_from_marker() {
    let tmp = TempDir::new().unwrap();
    let content = patterned(2_000_000);
    let dest = tmp.path().join("resumed.bin");
    let scratch_root = tmp.path().join("scratch");

    let transfer = Transfer::new("https://example.com/resumed.bin", dest.clone());
    let retry = transfer.clone();
    let id = transfer.id;

    // First run: the second chunk's stream ends 700k bytes short.
    let mut transport = FakeTransport::new(content.clone());
    transport.truncate = Some((1_000_000, 300_000));
    let engine = TransferEngine::new(test_config(&scratch_root))
        .with_transport(Box::new(transport));
    let done = engine.run(transfer, CancelToken::new());

    assert!(done.error.is_none());
    assert_eq!(done.phase, Phase::Idle);
    assert!(!dest.exists());
    let scratch = ScratchDir::new(scratch_root.clone(), id);
    assert_eq!(scratch.read_marker(1), 1_000_000);
    assert_eq!(scratch.read_marker(2), 300_000);

    // Second run: chunk one is already complete, so the only chunk request
    // starts at the persisted offset.
    let transport = FakeTransport::new(content.clone());
    let requests = Arc::clone(&transport.requests);
    let engine = TransferEngine::new(test_config(&scratch_root))
        .with_transport(Box::new(transport));
    let done = engine.run(retry, CancelToken::new());

    assert!(done.error.is_none());
    assert_eq!(done.phase, Phase::Completed);
    assert_eq!(fs::read(&dest).unwrap(), content);
    assert_eq!(*requests.lock().unwrap(), vec![0, 1_300_000]);
    assert!(!scratch.dir().exists());
}

#[test]
fn interruption_leaves_chunk_resumable() {
    let tmp = TempDir::new().unwrap();
    let content = patterned(512_000);
    let dest = tmp.path().join("paused.bin");
    let scratch_root = tmp.path().join("scratch");
    let mut transport = FakeTransport::new(content);
    transport.read_delay = Some(Duration::from_millis(5));
    let engine = TransferEngine::new(test_config(&scratch_root))
        .with_transport(Box::new(transport));

    let transfer = Transfer::new("https://example.com/paused.bin", dest.clone());
    let id = transfer.id;
    let token = CancelToken::new();
    let run_token = token.clone();
    let handle = thread::spawn(move || engine.run(transfer, run_token));
    thread::sleep(Duration::from_millis(60));
    token.interrupt();
    let done = handle.join().unwrap();

    assert!(done.error.is_none());
    assert_eq!(done.phase, Phase::Idle);
    assert!(token.is_terminated());
    assert!(done.downloaded >= 0);
    assert!(!dest.exists());

    // The marker never claims more than what reached the backing store.
    let scratch = ScratchDir::new(scratch_root, id);
    let marker = scratch.read_marker(1);
    assert!(marker > 0 && marker < 512_000);
    assert_eq!(marker, fs::metadata(scratch.chunk_store(1)).unwrap().len());
}

#[test]
fn network_loss_reclassifies_failure() {
    let tmp = TempDir::new().unwrap();
    let mut transport = FakeTransport::new(patterned(100_000));
    transport.fail_offset = Some(0);
    let mut config = test_config(&tmp.path().join("scratch"));
    config.retry_on_network_gain = true;
    let engine = TransferEngine::new(config)
        .with_transport(Box::new(transport))
        .with_network_monitor(Box::new(Offline));

    let done = engine.run(
        Transfer::new("https://example.com/gone.bin", tmp.path().join("gone.bin")),
        CancelToken::new(),
    );

    assert_eq!(done.error, Some(TransferError::NetworkUnavailable));
}

#[test]
fn checksum_mismatch_keeps_scratch_for_retry() {
    let tmp = TempDir::new().unwrap();
    let content = patterned(1_500_000);
    let dest = tmp.path().join("sum.bin");
    let scratch_root = tmp.path().join("scratch");
    let mut transport = FakeTransport::new(content);
    transport.server_md5 = Some("0".repeat(32));
    let engine = TransferEngine::new(test_config(&scratch_root))
        .with_transport(Box::new(transport));

    let transfer = Transfer::new("https://example.com/sum.bin", dest.clone());
    let id = transfer.id;
    let done = engine.run(transfer, CancelToken::new());

    assert!(matches!(done.error, Some(TransferError::ChecksumMismatch(_))));
    assert_eq!(done.phase, Phase::Idle);
    let scratch = ScratchDir::new(scratch_root, id);
    assert!(scratch.dir().exists());
}

#[test]
fn checksums_verified_on_completion() {
    let tmp = TempDir::new().unwrap();
    let content = patterned(1_500_000);
    let dest = tmp.path().join("good.bin");
    let mut transport = FakeTransport::new(content.clone());
    transport.server_md5 = Some(hex::encode(Md5::digest(&content)));
    let engine = TransferEngine::new(test_config(&tmp.path().join("scratch")))
        .with_transport(Box::new(transport));

    let transfer = Transfer::new("https://example.com/good.bin", dest.clone())
        .with_checksum(ChecksumRequest {
            checksum_type: ChecksumType::Sha256,
            expected_hex: hex::encode(Sha256::digest(&content)),
        });
    let done = engine.run(transfer, CancelToken::new());

    assert!(done.error.is_none());
    assert_eq!(done.phase, Phase::Completed);
    assert_eq!(fs::read(&dest).unwrap(), content);
}

#[test]
fn file_name_from_url_picks_last_segment() {
    assert_eq!(
        file_name_from_url("https://example.com/a/b/file.bin?x=1"),
        Some("file.bin".to_string())
    );
    assert_eq!(file_name_from_url("https://example.com/"), None);
    assert_eq!(file_name_from_url("not a url"), None);
}
