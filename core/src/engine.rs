use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::checksum::{file_md5_hex, verify_checksum};
use crate::chunk::{Chunk, ChunkStatus};
use crate::config::EngineConfig;
use crate::error::{TransferError, TransferResult};
use crate::estimator::SpeedEstimator;
use crate::executor::spawn_chunk_workers;
use crate::merger::spawn_merge_worker;
use crate::net::{AlwaysOnline, HttpTransport, NetworkMonitor, Transport, TransferRequest, TransportResponse};
use crate::observer::{NoopObserver, TransferObserver};
use crate::planner::plan_chunks;
use crate::scratch::ScratchDir;
use crate::state::{CancelToken, RunState};
use crate::transfer::{Phase, Transfer};

/// Drives one transfer at a time through probe, plan, download, merge and
/// completion. Scheduling multiple transfers against each other is the
/// caller's job.
pub struct TransferEngine {
    pub config: EngineConfig,
    transport: Arc<dyn Transport>,
    network: Arc<dyn NetworkMonitor>,
    observer: Arc<dyn TransferObserver>,
}

impl TransferEngine {
    pub fn new(config: EngineConfig) -> Self {
        let transport = HttpTransport::new(&config.user_agent)
            .unwrap_or_else(|_| HttpTransport::new("parafetch/0.1").expect("http transport"));
        Self {
            config,
            transport: Arc::new(transport),
            network: Arc::new(AlwaysOnline),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Arc::from(transport);
        self
    }

    pub fn with_network_monitor(mut self, network: Box<dyn NetworkMonitor>) -> Self {
        self.network = Arc::from(network);
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn TransferObserver>) -> Self {
        self.observer = Arc::from(observer);
        self
    }

    /// Runs the transfer to a terminal state and returns the final snapshot.
    /// Blocks the calling thread; a clone of `token` interrupts the run from
    /// elsewhere. The token is terminated exactly once, on the way out.
    pub fn run(&self, transfer: Transfer, token: CancelToken) -> Transfer {
        let scratch = ScratchDir::new(self.config.scratch_dir.clone(), transfer.id);
        let mut run = TransferRun {
            engine: self,
            transfer,
            token,
            state: Arc::new(RunState::new()),
            estimator: SpeedEstimator::new(),
            eta_millis: -1,
            total: 0,
            chunks: Arc::new(Mutex::new(Vec::new())),
            scratch,
            completed: false,
        };
        run.transfer.error = None;
        run.transfer.phase = Phase::Idle;
        run.execute();
        run.transfer
    }
}

struct TransferRun<'a> {
    engine: &'a TransferEngine,
    transfer: Transfer,
    token: CancelToken,
    state: Arc<RunState>,
    estimator: SpeedEstimator,
    eta_millis: i64,
    total: u64,
    chunks: Arc<Mutex<Vec<Chunk>>>,
    scratch: ScratchDir,
    completed: bool,
}

impl TransferRun<'_> {
    fn execute(&mut self) {
        let request = self.request();
        let mut opening: Option<TransportResponse> = None;

        let outcome = self.run_inner(&request, &mut opening);
        if let Err(err) = outcome {
            self.report_error(err);
        }

        // Cleanup always runs: the download and merge workers were joined on
        // every path above, so release the opening connection and only then
        // mark the run terminated.
        if let Some(response) = opening.take() {
            self.engine.transport.disconnect(response);
        }
        self.token.terminate();
    }

    fn run_inner(
        &mut self,
        request: &TransferRequest,
        opening_slot: &mut Option<TransportResponse>,
    ) -> TransferResult<()> {
        let probe_request = request.clone().with_range_start(0);
        let opening = self.engine.transport.execute(&probe_request)?;
        if self.token.is_stopped() {
            *opening_slot = opening;
            return Ok(());
        }
        let Some(opening) = opening else {
            return Err(TransferError::EmptyResponse);
        };
        if !opening.is_successful {
            let status = opening.status_code;
            *opening_slot = Some(opening);
            return Err(TransferError::ResponseNotSuccessful(status));
        }
        if opening.content_length <= 0 {
            *opening_slot = Some(opening);
            return Err(TransferError::EmptyResponse);
        }

        let total = opening.content_length as u64;
        let range_supported = opening.is_partial();
        let server_md5 = opening.content_md5.clone();
        let hint = self.engine.transport.chunk_size_hint(request, total);
        *opening_slot = Some(opening);

        self.total = total;
        self.transfer.total = total as i64;

        let plan = plan_chunks(self.transfer.id, total, range_supported, hint, &self.scratch)?;
        debug!(
            "planned {} chunks for {} ({} bytes, {} already present)",
            plan.chunks.len(),
            self.transfer.id,
            total,
            plan.downloaded
        );
        self.state.add_downloaded(plan.downloaded);
        let pending: Vec<usize> = plan
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| !chunk.is_downloaded())
            .map(|(index, _)| index)
            .collect();
        self.chunks = Arc::new(Mutex::new(plan.chunks));

        if self.token.is_stopped() {
            return Ok(());
        }

        self.sync_observable();
        self.engine
            .observer
            .on_started(&self.transfer, self.eta_millis, self.estimator.bytes_per_second());

        let handles = spawn_chunk_workers(
            &self.chunks,
            pending,
            request,
            &self.engine.transport,
            &self.scratch,
            &self.state,
            &self.token,
            &self.engine.config,
        );
        self.wait_and_report();
        for handle in handles {
            let _ = handle.join();
        }

        if !self.token.is_stopped() {
            let downloaded_sum = {
                let chunks = self
                    .chunks
                    .lock()
                    .map_err(|_| TransferError::InvalidState("chunk lock poisoned".to_string()))?;
                for chunk in chunks.iter() {
                    if chunk.status == ChunkStatus::Error {
                        return Err(chunk.error.clone().unwrap_or_else(|| {
                            TransferError::UnknownTransferFailure(
                                "chunk failed without a captured cause".to_string(),
                            )
                        }));
                    }
                }
                chunks.iter().map(|chunk| chunk.downloaded).sum::<u64>()
            };
            // A shortfall without an errored chunk means some chunk ended
            // early and went back to QUEUED; the run exits quietly and a
            // later invocation resumes from the markers.
            if downloaded_sum == total {
                self.merge(request, server_md5)?;
            }
        }

        self.sync_observable();
        self.engine.observer.save_progress(&self.transfer);
        if !self.completed && !self.token.is_terminated() {
            self.engine
                .observer
                .on_progress(&self.transfer, self.eta_millis, self.estimator.bytes_per_second());
        }

        if !self.token.is_terminated() {
            let chunks = self
                .chunks
                .lock()
                .map_err(|_| TransferError::InvalidState("chunk lock poisoned".to_string()))?;
            if let Some(chunk) = chunks.iter().find(|chunk| chunk.status == ChunkStatus::Error) {
                return Err(chunk.error.clone().unwrap_or_else(|| {
                    TransferError::UnknownTransferFailure(
                        "chunk failed without a captured cause".to_string(),
                    )
                }));
            }
        }
        Ok(())
    }

    /// Sequential merge of every backing store into the destination, then
    /// verification, scratch cleanup, and completion callbacks.
    fn merge(&mut self, request: &TransferRequest, server_md5: Option<String>) -> TransferResult<()> {
        self.sync_observable();
        let output: Box<dyn Write + Send> =
            match self.engine.transport.open_output(request, 0)? {
                Some(stream) => stream,
                None => {
                    if let Some(parent) = self.transfer.file.parent() {
                        if !parent.as_os_str().is_empty() {
                            fs::create_dir_all(parent)
                                .map_err(|err| TransferError::Io(err.to_string()))?;
                        }
                    }
                    let mut file = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .open(&self.transfer.file)
                        .map_err(|err| TransferError::Io(err.to_string()))?;
                    file.seek(SeekFrom::Start(0))
                        .map_err(|err| TransferError::Io(err.to_string()))?;
                    Box::new(file)
                }
            };

        if self.token.is_stopped() {
            return Ok(());
        }

        let handle = spawn_merge_worker(
            Arc::clone(&self.chunks),
            output,
            Arc::clone(&self.state),
            self.token.clone(),
            self.engine.config.clone(),
        );
        self.wait_and_report();
        let _ = handle.join();

        if self.token.is_stopped() {
            return Ok(());
        }

        let chunk_count = self
            .chunks
            .lock()
            .map_err(|_| TransferError::InvalidState("chunk lock poisoned".to_string()))?
            .len() as u64;
        if self.state.merges_completed() == chunk_count {
            // Verify content before dropping the scratch state, so a
            // mismatch leaves everything in place for a retry.
            self.verify_output(server_md5)?;
            if let Ok(chunks) = self.chunks.lock() {
                for chunk in chunks.iter() {
                    self.scratch.remove_chunk_files(chunk.position);
                }
            }
            self.scratch.remove_dir();
            self.state.set_phase(Phase::Completed);
            self.completed = true;
            self.sync_observable();
            self.engine
                .observer
                .on_progress(&self.transfer, self.eta_millis, self.estimator.bytes_per_second());
            self.engine.observer.on_complete(&self.transfer);
        }
        Ok(())
    }

    fn verify_output(&self, server_md5: Option<String>) -> TransferResult<()> {
        if let Some(expected) = server_md5 {
            let actual = file_md5_hex(&self.transfer.file).unwrap_or_default();
            if !actual.eq_ignore_ascii_case(&expected) {
                return Err(TransferError::ChecksumMismatch(format!(
                    "server md5 {} but merged output is {}",
                    expected, actual
                )));
            }
        }
        if let Some(request) = &self.transfer.checksum {
            if !verify_checksum(&self.transfer.file, request) {
                return Err(TransferError::ChecksumMismatch(format!(
                    "{} digest does not match {}",
                    request.checksum_type.as_str(),
                    request.expected_hex
                )));
            }
        }
        Ok(())
    }

    /// Polls at a short fixed interval while a pass is in flight, sampling
    /// throughput once a second and reporting progress to the observer. The
    /// cancellation token is checked every iteration, so an interrupt is
    /// observed within one polling interval.
    fn wait_and_report(&mut self) {
        let sample_interval = Duration::from_millis(self.engine.config.speed_sample_interval_ms);
        let report_interval = Duration::from_millis(self.engine.config.progress_report_interval_ms);
        let poll = Duration::from_millis(self.engine.config.poll_interval_ms);
        let mut last_sample = Instant::now();
        let mut last_report = Instant::now();

        while self.state.is_busy() && !self.token.is_stopped() {
            self.sync_observable();
            if last_sample.elapsed() >= sample_interval {
                self.estimator.sample(self.transfer.downloaded);
                self.eta_millis = self
                    .estimator
                    .eta_millis(self.transfer.downloaded, self.total);
                last_sample = Instant::now();
            }
            if last_report.elapsed() >= report_interval {
                self.engine.observer.save_progress(&self.transfer);
                if !self.token.is_terminated() {
                    self.engine.observer.on_progress(
                        &self.transfer,
                        self.eta_millis,
                        self.estimator.bytes_per_second(),
                    );
                }
                last_report = Instant::now();
            }
            thread::sleep(poll);
        }
        self.sync_observable();
    }

    /// Copies the weighted progress and phase into the transfer snapshot.
    /// Once progress has been observed, the idle sentinel never overwrites
    /// it, so terminal snapshots keep the last known value.
    fn sync_observable(&mut self) {
        self.transfer.phase = self.state.phase();
        let progress = self.state.observable_progress(self.total);
        if progress >= 0 || self.transfer.downloaded < 0 {
            self.transfer.downloaded = progress;
        }
    }

    /// Terminal failure path: classify, snapshot, notify. Interruption is
    /// not an error and never reaches here as one.
    fn report_error(&mut self, err: TransferError) {
        if self.token.is_stopped() {
            return;
        }
        warn!("transfer {} failed: {}", self.transfer.id, err);
        let mut error = err;
        if self.engine.config.retry_on_network_gain {
            // One-shot classification: if connectivity is (or goes) missing
            // within the window, report the loss instead of the raw cause so
            // the caller knows to retry once the network returns.
            let mut disconnect_detected = !self.engine.network.is_network_available();
            if !disconnect_detected {
                for _ in 0..10 {
                    thread::sleep(Duration::from_millis(500));
                    if !self.engine.network.is_network_available() {
                        disconnect_detected = true;
                        break;
                    }
                }
            }
            if disconnect_detected {
                error = TransferError::NetworkUnavailable;
            }
        }
        self.sync_observable();
        self.transfer.error = Some(error);
        if !self.token.is_terminated() {
            self.engine.observer.on_error(&self.transfer);
        }
    }

    fn request(&self) -> TransferRequest {
        let mut request = TransferRequest::new(
            self.transfer.url.clone(),
            self.engine.config.user_agent.clone(),
        );
        request.headers = self.transfer.headers.clone();
        request
    }
}
