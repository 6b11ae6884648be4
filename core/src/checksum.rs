use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "md5" => Some(ChecksumType::Md5),
            "sha1" => Some(ChecksumType::Sha1),
            "sha256" => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

/// Caller-specified expected digest for a merged output file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecksumRequest {
    pub checksum_type: ChecksumType,
    pub expected_hex: String,
}

pub fn verify_checksum(path: &Path, req: &ChecksumRequest) -> bool {
    let actual = match req.checksum_type {
        ChecksumType::Md5 => file_digest_hex::<Md5>(path),
        ChecksumType::Sha1 => file_digest_hex::<Sha1>(path),
        ChecksumType::Sha256 => file_digest_hex::<Sha256>(path),
    };
    match actual {
        Some(actual) => actual.eq_ignore_ascii_case(&req.expected_hex),
        None => false,
    }
}

/// MD5 of a file as lowercase hex, for comparing against a server-provided
/// content digest.
pub fn file_md5_hex(path: &Path) -> Option<String> {
    file_digest_hex::<Md5>(path)
}

fn file_digest_hex<D: Digest>(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buf = [0u8; 1024 * 64];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => return None,
        };
        hasher.update(&buf[..read]);
    }
    Some(hex::encode(hasher.finalize()))
}
