use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use url::Url;
use uuid::Uuid;

use crate::checksum::ChecksumRequest;
use crate::error::TransferError;

pub type TransferId = Uuid;

/// Transfer-level stage, used to pick the progress-weighting formula.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Downloading,
    Merging,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Downloading => "downloading",
            Phase::Merging => "merging",
            Phase::Completed => "completed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Phase::Idle),
            "downloading" => Some(Phase::Downloading),
            "merging" => Some(Phase::Merging),
            "completed" => Some(Phase::Completed),
            _ => None,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Downloading => 1,
            Phase::Merging => 2,
            Phase::Completed => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Downloading,
            2 => Phase::Merging,
            3 => Phase::Completed,
            _ => Phase::Idle,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file transfer from a source locator to a destination path.
///
/// `total` and `downloaded` are `-1` until the opening probe has run;
/// `downloaded` holds the observable (phase-weighted) progress value, not
/// the raw byte count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub url: String,
    pub file: PathBuf,
    pub total: i64,
    pub downloaded: i64,
    pub phase: Phase,
    pub headers: HashMap<String, String>,
    pub checksum: Option<ChecksumRequest>,
    pub error: Option<TransferError>,
}

impl Transfer {
    pub fn new(url: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            file: file.into(),
            total: -1,
            downloaded: -1,
            phase: Phase::Idle,
            headers: HashMap::new(),
            checksum: None,
            error: None,
        }
    }

    pub fn with_checksum(mut self, checksum: ChecksumRequest) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

/// Derive a destination file name from the source locator, for callers that
/// only supply a directory.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?;
    Some(name.to_string())
}
