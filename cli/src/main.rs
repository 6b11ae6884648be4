use std::env;
use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

use parafetch_core::checksum::{ChecksumRequest, ChecksumType};
use parafetch_core::config::EngineConfig;
use parafetch_core::observer::TransferObserver;
use parafetch_core::transfer::file_name_from_url;
use parafetch_core::{CancelToken, Phase, Transfer, TransferEngine};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let url = match args.get(1) {
        Some(value) => value.to_string(),
        None => {
            print_usage();
            return;
        }
    };
    let dest = resolve_dest(&url, args.get(2).map(|value| value.as_str()));
    let checksum = match args.get(3) {
        Some(value) => match parse_checksum(value) {
            Some(checksum) => Some(checksum),
            None => {
                eprintln!("invalid checksum, expected md5:<hex>, sha1:<hex> or sha256:<hex>");
                return;
            }
        },
        None => None,
    };

    let engine = TransferEngine::new(EngineConfig::default())
        .with_observer(Box::new(ConsoleObserver));

    let mut transfer = Transfer::new(url, dest.clone());
    if let Some(checksum) = checksum {
        transfer = transfer.with_checksum(checksum);
    }

    let done = engine.run(transfer, CancelToken::new());
    match done.error {
        Some(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
        None if done.phase == Phase::Completed => {
            println!("saved to {}", dest.display());
        }
        None => {
            println!("transfer ended early; partial state kept for resume");
        }
    }
}

fn resolve_dest(url: &str, dest: Option<&str>) -> PathBuf {
    let fallback = || file_name_from_url(url).unwrap_or_else(|| "download.bin".to_string());
    match dest {
        Some(value) if !value.trim().is_empty() => {
            let path = PathBuf::from(value);
            if value.ends_with('/') || path.is_dir() {
                path.join(fallback())
            } else {
                path
            }
        }
        _ => PathBuf::from(fallback()),
    }
}

fn parse_checksum(value: &str) -> Option<ChecksumRequest> {
    let (kind, hex) = value.split_once(':')?;
    let checksum_type = ChecksumType::from_str(kind)?;
    if hex.is_empty() {
        return None;
    }
    Some(ChecksumRequest {
        checksum_type,
        expected_hex: hex.to_string(),
    })
}

fn print_usage() {
    eprintln!(
        "Usage: parafetch <url> [dest] [checksum]\n\
Arguments:\n\
  url                  Source to download\n\
  dest                 Destination file or directory (default: file name from url)\n\
  checksum             Expected digest as md5:<hex>, sha1:<hex> or sha256:<hex>\n\
Environment:\n\
  PARAFETCH_SCRATCH_DIR  Directory for chunk stores and resume markers\n\
  RUST_LOG               Log filter (e.g. parafetch_core=debug)"
    );
}

struct ConsoleObserver;

impl TransferObserver for ConsoleObserver {
    fn on_started(&self, transfer: &Transfer, _eta_millis: i64, _bytes_per_second: u64) {
        let name = file_name(&transfer.file);
        if transfer.total > 0 {
            println!("downloading {} ({})", name, format_bytes(transfer.total as u64));
        } else {
            println!("downloading {}", name);
        }
    }

    fn on_progress(&self, transfer: &Transfer, eta_millis: i64, bytes_per_second: u64) {
        if transfer.total <= 0 || transfer.downloaded < 0 {
            return;
        }
        let percent = (transfer.downloaded as f64 / transfer.total as f64) * 100.0;
        let eta = if eta_millis >= 0 {
            format_duration(eta_millis as u64 / 1000)
        } else {
            "--:--".to_string()
        };
        println!(
            "[{}] {:.1}% {}/{} ({}/s) eta {}",
            transfer.phase,
            percent,
            format_bytes(transfer.downloaded as u64),
            format_bytes(transfer.total as u64),
            format_bytes(bytes_per_second),
            eta,
        );
    }

    fn on_complete(&self, transfer: &Transfer) {
        println!("completed {}", file_name(&transfer.file));
    }

    fn on_error(&self, transfer: &Transfer) {
        if let Some(err) = &transfer.error {
            eprintln!("failed {}: {}", file_name(&transfer.file), err);
        }
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("download")
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
