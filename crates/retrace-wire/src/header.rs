//! Trace header and environment fingerprint.
//!
//! Layout on disk:
//!
//! ```text
//! "RTRC" | format version (u16 LE) | preamble length (u32 LE) | preamble JSON
//! ```
//!
//! The JSON preamble carries the session settings that must be identical
//! between recording and replay (monitor level, stacktraces, call
//! checkpoints) plus the environment [`Fingerprint`]. Replay compares the
//! recorded fingerprint to the live one and refuses to start on mismatch.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use retrace_types::{ProcessId, Result, RetraceError, TraceContext};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const MAGIC: &[u8; 4] = b"RTRC";
pub const FORMAT_VERSION: u16 = 1;

/// Engine version recorded in every fingerprint.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Directory entries skipped by [`checksum_dir`].
const SKIPPED_DIRS: &[&str] = &["__pycache__", ".git", "target"];

/// Preamble upper bound; anything larger is not a header.
const MAX_PREAMBLE: u32 = 16 * 1024 * 1024;

/// Engine version plus named integrity checksums.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub engine_version: String,
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::current()
    }
}

impl Fingerprint {
    /// Fingerprint of this engine build with no checksums.
    pub fn current() -> Self {
        Self {
            engine_version: ENGINE_VERSION.to_string(),
            checksums: BTreeMap::new(),
        }
    }

    pub fn with_checksum(mut self, name: impl Into<String>, digest: impl Into<String>) -> Self {
        self.checksums.insert(name.into(), digest.into());
        self
    }

    /// Add the checksum of a file or directory tree under `name`.
    pub fn with_path(self, name: impl Into<String>, path: &Path) -> std::io::Result<Self> {
        let digest = if path.is_dir() {
            checksum_dir(path)?
        } else {
            checksum_file(path)?
        };
        Ok(self.with_checksum(name, digest))
    }

    /// Line-per-difference comparison of `self` (recorded) with `current`.
    ///
    /// Empty when the fingerprints match.
    pub fn diff(&self, current: &Fingerprint) -> Vec<String> {
        let mut lines = Vec::new();
        if self.engine_version != current.engine_version {
            lines.push(format!(
                "  ! engine_version: recorded {}, current {}",
                self.engine_version, current.engine_version
            ));
        }
        for (key, recorded) in &self.checksums {
            match current.checksums.get(key) {
                None => lines.push(format!("  - {}: (missing in current)", key)),
                Some(now) if now != recorded => lines.push(format!(
                    "  ! {}: recorded {}, current {}",
                    key, recorded, now
                )),
                Some(_) => {}
            }
        }
        for key in current.checksums.keys() {
            if !self.checksums.contains_key(key) {
                lines.push(format!("  + {}: (new in current)", key));
            }
        }
        lines
    }

    /// Fail with `EnvironmentMismatch` unless `current` matches.
    pub fn verify(&self, current: &Fingerprint) -> Result<()> {
        let differences = self.diff(current);
        if differences.is_empty() {
            Ok(())
        } else {
            Err(RetraceError::EnvironmentMismatch { differences })
        }
    }
}

/// Hex SHA-256 of a file's contents.
pub fn checksum_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 over a directory tree: relative paths and file digests in
/// sorted order, skipping cache and VCS folders.
pub fn checksum_dir(root: &Path) -> std::io::Result<String> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();
    let mut hasher = Sha256::new();
    for relative in files {
        let digest = checksum_file(&root.join(&relative))?;
        hasher.update(relative.as_bytes());
        hasher.update([0]);
        hasher.update(digest.as_bytes());
        hasher.update([b'\n']);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if entry.file_type()?.is_dir() {
            if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                continue;
            }
            collect_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Trace header preamble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(skip)]
    pub format_version: u16,
    /// 0 = off, 1 = calls/returns, 2 = + native calls, 3 = + lines.
    pub monitor_level: u8,
    pub stacktraces: bool,
    /// Whether each crossing checkpoints its call descriptor.
    pub checkpoint_calls: bool,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub session_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub root_pid: ProcessId,
}

impl Header {
    pub fn new(root_pid: ProcessId) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            monitor_level: 0,
            stacktraces: false,
            checkpoint_calls: false,
            fingerprint: Fingerprint::current(),
            argv: Vec::new(),
            metadata: BTreeMap::new(),
            session_id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            root_pid,
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let preamble = serde_json::to_vec(self).map_err(|e| {
            RetraceError::io("encoding trace header", std::io::Error::other(e))
        })?;
        let mut bytes = Vec::with_capacity(10 + preamble.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&self.format_version.to_le_bytes());
        bytes.extend_from_slice(&(preamble.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&preamble);
        out.write_all(&bytes)
            .map_err(|e| RetraceError::io("writing trace header", e))
    }

    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let mut fixed = [0u8; 10];
        read_exact(input, &mut fixed, "trace header")?;
        if &fixed[..4] != MAGIC {
            return Err(RetraceError::truncated(
                "not a retrace trace (bad magic)",
                TraceContext::default(),
            ));
        }
        let version = u16::from_le_bytes([fixed[4], fixed[5]]);
        if version != FORMAT_VERSION {
            return Err(RetraceError::EnvironmentMismatch {
                differences: vec![format!(
                    "  ! format_version: recorded {}, current {}",
                    version, FORMAT_VERSION
                )],
            });
        }
        let len = u32::from_le_bytes([fixed[6], fixed[7], fixed[8], fixed[9]]);
        if len > MAX_PREAMBLE {
            return Err(RetraceError::truncated(
                format!("header preamble of {} bytes", len),
                TraceContext::at(0, 6),
            ));
        }
        let mut preamble = vec![0u8; len as usize];
        read_exact(input, &mut preamble, "header preamble")?;
        let mut header: Header = serde_json::from_slice(&preamble).map_err(|e| {
            RetraceError::truncated(format!("malformed header preamble: {}", e), TraceContext::at(0, 10))
        })?;
        header.format_version = version;
        Ok(header)
    }
}

fn read_exact<R: Read>(input: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RetraceError::truncated(format!("input ended inside {}", what), TraceContext::default())
        } else {
            RetraceError::io(format!("reading {}", what), e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_header_round_trip() -> Result<()> {
        let mut header = Header::new(41);
        header.monitor_level = 2;
        header.argv = vec!["app.py".into(), "--fast".into()];
        header.metadata.insert("python".into(), "3.12".into());

        let mut bytes = Vec::new();
        header.write_to(&mut bytes)?;
        assert_eq!(&bytes[..4], MAGIC);

        let decoded = Header::read_from(&mut Cursor::new(bytes))?;
        assert_eq!(decoded, header);
        Ok(())
    }

    #[test]
    fn test_bad_magic_and_short_header() {
        let err = Header::read_from(&mut Cursor::new(b"NOPE\x01\x00\x00\x00\x00\x00".to_vec()))
            .unwrap_err();
        assert_eq!(err.code(), "R100");

        let err = Header::read_from(&mut Cursor::new(b"RTRC".to_vec())).unwrap_err();
        assert!(matches!(err, RetraceError::TruncatedTrace { .. }));
    }

    #[test]
    fn test_fingerprint_diff_lines() {
        let recorded = Fingerprint::current()
            .with_checksum("app", "aa")
            .with_checksum("lib", "bb");
        let current = Fingerprint::current()
            .with_checksum("app", "ac")
            .with_checksum("extra", "cc");

        let diff = recorded.diff(&current);
        assert_eq!(
            diff,
            vec![
                "  ! app: recorded aa, current ac".to_string(),
                "  - lib: (missing in current)".to_string(),
                "  + extra: (new in current)".to_string(),
            ]
        );
        assert!(matches!(
            recorded.verify(&current),
            Err(RetraceError::EnvironmentMismatch { .. })
        ));
        assert!(recorded.verify(&recorded.clone()).is_ok());
    }

    #[test]
    fn test_dir_checksum_skips_cache_folders() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("main.py"), b"print(1)")?;
        let before = checksum_dir(dir.path())?;

        std::fs::create_dir(dir.path().join("__pycache__"))?;
        std::fs::write(dir.path().join("__pycache__/main.pyc"), b"junk")?;
        assert_eq!(checksum_dir(dir.path())?, before);

        std::fs::write(dir.path().join("main.py"), b"print(2)")?;
        assert_ne!(checksum_dir(dir.path())?, before);
        Ok(())
    }
}
