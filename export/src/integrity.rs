//! Content hashes of exported artifacts.
//!
//! Checksum mismatches are advisory: serialization output drifts across
//! framework and tracer versions, so a mismatch is reported and logged as a
//! warning but never fails the run.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Read size used when streaming a file through the hasher.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// SHA-256 of a file as lowercase hex, read `chunk_size` bytes at a time.
pub fn sha256_file(path: impl AsRef<Path>, chunk_size: usize) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Outcome for one expected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChecksumStatus {
    Ok,
    Mismatch { actual: String },
    Missing,
}

impl fmt::Display for ChecksumStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Mismatch { .. } => f.write_str("MISMATCH"),
            Self::Missing => f.write_str("MISSING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumEntry {
    pub file: String,
    pub expected: String,
    #[serde(flatten)]
    pub status: ChecksumStatus,
}

/// One entry per expected file, in file-name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub entries: Vec<ChecksumEntry>,
}

impl IntegrityReport {
    /// True iff every entry is OK. An empty table counts as matched.
    pub fn all_matched(&self) -> bool {
        self.entries.iter().all(|e| e.status == ChecksumStatus::Ok)
    }

    pub fn get(&self, file: &str) -> Option<&ChecksumEntry> {
        self.entries.iter().find(|e| e.file == file)
    }

    /// Writes the per-file lines and the summary to the log.
    pub fn log(&self) {
        info!("Verifying checksums...");
        for entry in &self.entries {
            match &entry.status {
                ChecksumStatus::Ok => info!("  {}: OK", entry.file),
                ChecksumStatus::Missing => warn!("  {}: MISSING", entry.file),
                ChecksumStatus::Mismatch { actual } => {
                    warn!("  {}: MISMATCH", entry.file);
                    warn!("    Expected: {}", entry.expected);
                    warn!("    Got:      {actual}");
                }
            }
        }
        if self.all_matched() {
            info!("All checksums verified!");
        } else {
            warn!(
                "Some checksums did not match. This can happen with different \
                 library versions; update the pinned values if the new export is intended."
            );
        }
    }
}

/// Compares every file in `expected` (name to hex digest) against the file
/// of that name in `dir`. Never fails: problems become entries.
pub fn verify_checksums(
    dir: impl AsRef<Path>,
    expected: &BTreeMap<String, String>,
    chunk_size: usize,
) -> IntegrityReport {
    let dir = dir.as_ref();
    let entries = expected
        .iter()
        .map(|(file, want)| {
            let path = dir.join(file);
            let status = if !path.is_file() {
                ChecksumStatus::Missing
            } else {
                match sha256_file(&path, chunk_size) {
                    Ok(actual) if actual == *want => ChecksumStatus::Ok,
                    Ok(actual) => ChecksumStatus::Mismatch { actual },
                    Err(e) => {
                        warn!("cannot read {}: {e}", path.display());
                        ChecksumStatus::Missing
                    }
                }
            };
            ChecksumEntry {
                file: file.clone(),
                expected: want.clone(),
                status,
            }
        })
        .collect();
    IntegrityReport { entries }
}

/// Hashes each path into a fresh table keyed by file name, for re-pinning.
pub fn compute_checksums<'a>(
    paths: impl IntoIterator<Item = &'a Path>,
    chunk_size: usize,
) -> io::Result<BTreeMap<String, String>> {
    let mut table = BTreeMap::new();
    for path in paths {
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy()
            .into_owned();
        table.insert(name, sha256_file(path, chunk_size)?);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn sha256_known_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let abc = dir.path().join("abc");
        std::fs::write(&abc, b"abc").unwrap();
        assert_eq!(sha256_file(&abc, DEFAULT_CHUNK_SIZE).unwrap(), ABC_SHA256);

        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(sha256_file(&empty, DEFAULT_CHUNK_SIZE).unwrap(), EMPTY_SHA256);
    }

    #[test]
    fn chunk_size_does_not_change_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let reference = hex::encode(Sha256::digest(&data));
        for chunk in [0, 1, 7, 8192, 1 << 20] {
            assert_eq!(sha256_file(&path, chunk).unwrap(), reference, "chunk {chunk}");
        }
    }

    #[test]
    fn every_entry_gets_exactly_one_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.onnx"), b"abc").unwrap();
        std::fs::write(dir.path().join("bad.onnx.data"), b"abd").unwrap();

        let expected = BTreeMap::from([
            ("good.onnx".to_string(), ABC_SHA256.to_string()),
            ("bad.onnx.data".to_string(), ABC_SHA256.to_string()),
            ("gone.onnx".to_string(), ABC_SHA256.to_string()),
        ]);
        let report = verify_checksums(dir.path(), &expected, DEFAULT_CHUNK_SIZE);

        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.get("good.onnx").unwrap().status, ChecksumStatus::Ok);
        assert!(matches!(
            report.get("bad.onnx.data").unwrap().status,
            ChecksumStatus::Mismatch { .. }
        ));
        assert_eq!(report.get("gone.onnx").unwrap().status, ChecksumStatus::Missing);
        assert!(!report.all_matched());
        report.log();
    }

    #[test]
    fn comparison_is_case_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"abc").unwrap();
        let expected = BTreeMap::from([("f".to_string(), ABC_SHA256.to_uppercase())]);
        let report = verify_checksums(dir.path(), &expected, DEFAULT_CHUNK_SIZE);
        assert_eq!(
            report.entries[0].status,
            ChecksumStatus::Mismatch {
                actual: ABC_SHA256.to_string()
            }
        );
    }

    #[test]
    fn all_matched_only_when_every_entry_ok() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"abc").unwrap();
        let expected = BTreeMap::from([("f".to_string(), ABC_SHA256.to_string())]);
        assert!(verify_checksums(dir.path(), &expected, 8192).all_matched());
        assert!(verify_checksums(dir.path(), &BTreeMap::new(), 8192).all_matched());
    }

    #[test]
    fn directory_in_place_of_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("enc.onnx")).unwrap();
        let expected = BTreeMap::from([("enc.onnx".to_string(), ABC_SHA256.to_string())]);
        let report = verify_checksums(dir.path(), &expected, 8192);
        assert_eq!(report.entries[0].status, ChecksumStatus::Missing);
    }

    #[test]
    fn status_display_and_serialization() {
        assert_eq!(ChecksumStatus::Ok.to_string(), "OK");
        assert_eq!(ChecksumStatus::Missing.to_string(), "MISSING");
        let entry = ChecksumEntry {
            file: "enc.onnx".into(),
            expected: "aa".into(),
            status: ChecksumStatus::Mismatch {
                actual: "bb".into(),
            },
        };
        assert_eq!(entry.status.to_string(), "MISMATCH");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "mismatch");
        assert_eq!(json["actual"], "bb");
        assert_eq!(json["file"], "enc.onnx");
    }

    #[test]
    fn compute_checksums_keys_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("wav2vec2_encoder.onnx");
        std::fs::write(&a, b"abc").unwrap();
        let table = compute_checksums([a.as_path()], DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(table["wav2vec2_encoder.onnx"], ABC_SHA256);

        assert!(compute_checksums([dir.path().join("absent").as_path()], 8192).is_err());
    }
}
