use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_agent: String,
    pub scratch_dir: PathBuf,
    pub buffer_size_bytes: usize,
    pub progress_report_interval_ms: u64,
    pub speed_sample_interval_ms: u64,
    pub marker_flush_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub retry_on_network_gain: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: "parafetch/0.1".to_string(),
            scratch_dir: default_scratch_dir(),
            buffer_size_bytes: 1024 * 64,
            progress_report_interval_ms: 1000,
            speed_sample_interval_ms: 1000,
            marker_flush_interval_ms: 1000,
            poll_interval_ms: 50,
            retry_on_network_gain: false,
        }
    }
}

fn default_scratch_dir() -> PathBuf {
    if let Ok(dir) = env::var("PARAFETCH_SCRATCH_DIR") {
        return PathBuf::from(dir);
    }
    env::temp_dir().join("parafetch")
}
