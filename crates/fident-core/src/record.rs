use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Log source name used for entries written by the pipeline itself.
pub const FILEHANDLER: &str = "filehandler";

/// Identifier id reported when no signature matched.
const UNKNOWN_ID: &str = "UNKNOWN";

pub const MSG_FALLBACK: &str = "fmt not detected, falling back on ext";
pub const EMPTY_SOURCE: &str = "empty source";
pub const EXT_MISMATCH: &str = "extension mismatch";

static FORMAT_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(fmt|x-fmt)/(\d+)").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub name: String,
    pub msg: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(name: &str, msg: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            msg: msg.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle of a record. `Removed` is absorbing and nothing returns to `Discovered`.
///
/// `Added` is final except for one edge: an original whose converted
/// replacement has been relocated may be quarantined (`Added -> Removed`)
/// when its policy or the run asks to remove originals. No other record
/// leaves `Added`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Discovered,
    Removed,
    Pending,
    Added,
}

impl Status {
    /// Edges of the lifecycle graph. `Added -> Removed` is only taken when an
    /// original is quarantined after its converted replacement was relocated.
    pub fn can_become(self, to: Status) -> bool {
        matches!(
            (self, to),
            (Status::Discovered, Status::Removed)
                | (Status::Discovered, Status::Pending)
                | (Status::Discovered, Status::Added)
                | (Status::Pending, Status::Added)
                | (Status::Added, Status::Removed)
        )
    }
}

/// One candidate classification reported by the identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatMatch {
    #[serde(default)]
    pub ns: String,
    pub id: String,
    #[serde(rename = "format", default)]
    pub format_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub mime: String,
    #[serde(rename = "class", default)]
    pub format_class: String,
    #[serde(default)]
    pub basis: String,
    #[serde(default)]
    pub warning: String,
}

/// Raw per-file output of the identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierOutput {
    pub filename: PathBuf,
    pub filesize: u64,
    pub modified: String,
    #[serde(default)]
    pub errors: String,
    #[serde(default)]
    pub matches: Vec<FormatMatch>,
}

/// Structured probe output attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub source: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub relative_path: PathBuf,
    pub size: u64,
    pub modified: String,
    /// Identifier-level error text, empty when none.
    #[serde(default)]
    pub errors: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub matches: Vec<FormatMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_format: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_info: Option<MediaInfo>,
    #[serde(default)]
    pub processing_log: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<Box<FileRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_relocation_target: Option<PathBuf>,

    #[serde(skip)]
    pub absolute_path: PathBuf,
    #[serde(skip)]
    pub scan_root: PathBuf,
    #[serde(skip)]
    pub work_dir: PathBuf,
    /// Index of the originating record in the working set, if it is loaded.
    #[serde(skip)]
    pub origin: Option<usize>,
}

impl FileRecord {
    /// Build a record from raw identifier output.
    pub fn from_identifier(output: IdentifierOutput) -> Result<Self> {
        if output.filename.as_os_str().is_empty() {
            return Err(Error::MalformedRecord {
                path: String::new(),
                reason: "missing filename".to_string(),
            });
        }

        let mut record = Self {
            absolute_path: output.filename.clone(),
            relative_path: output.filename,
            size: output.filesize,
            modified: output.modified,
            errors: output.errors,
            content_hash: None,
            matches: output.matches,
            resolved_format: None,
            status: Status::Discovered,
            media_info: None,
            processing_log: Vec::new(),
            derived_from: None,
            pending_relocation_target: None,
            scan_root: PathBuf::new(),
            work_dir: PathBuf::new(),
            origin: None,
        };

        let (format, used_fallback) = resolve_format(&record.matches);
        record.resolved_format = format;
        if used_fallback {
            record.log(FILEHANDLER, MSG_FALLBACK);
        }
        Ok(record)
    }

    /// Parse one identifier JSON object (as found in the `files` array).
    pub fn from_identifier_json(value: serde_json::Value) -> Result<Self> {
        let hint = value
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let output: IdentifierOutput =
            serde_json::from_value(value).map_err(|e| Error::MalformedRecord {
                path: hint,
                reason: e.to_string(),
            })?;
        Self::from_identifier(output)
    }

    pub fn primary_match(&self) -> Option<&FormatMatch> {
        self.matches.first()
    }

    pub fn mime(&self) -> &str {
        self.primary_match().map_or("", |m| m.mime.as_str())
    }

    pub fn has_warning(&self, needle: &str) -> bool {
        self.primary_match().is_some_and(|m| m.warning.contains(needle))
    }

    pub fn is_empty_source(&self) -> bool {
        self.errors.trim() == EMPTY_SOURCE
    }

    pub fn log(&mut self, name: &str, msg: impl Into<String>) {
        self.processing_log.push(LogEntry::new(name, msg));
    }

    /// Like [`log`](Self::log), but skips messages the record already carries.
    pub fn log_once(&mut self, name: &str, msg: impl Into<String>) {
        let msg = msg.into();
        if !self.processing_log.iter().any(|e| e.name == name && e.msg == msg) {
            self.log(name, msg);
        }
    }

    /// Attach probe output; only the first attachment sticks.
    pub fn attach_media_info(&mut self, info: MediaInfo) {
        if self.media_info.is_none() {
            self.media_info = Some(info);
        }
    }

    pub fn transition(&mut self, to: Status) -> Result<()> {
        if !self.status.can_become(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Records still subject to inspection and policy stages.
    pub fn is_active(&self) -> bool {
        self.status != Status::Removed && self.pending_relocation_target.is_none()
    }

    /// Set the run-local paths. On the first load `relative_path` is made
    /// relative to the scan root, or to the working directory for records
    /// that wait for relocation.
    pub fn set_processing_paths(&mut self, scan_root: &Path, work_dir: &Path, initial: bool) {
        let scan_root = if scan_root.is_file() {
            scan_root.parent().unwrap_or(scan_root)
        } else {
            scan_root
        };
        self.scan_root = scan_root.to_path_buf();
        self.work_dir = work_dir.to_path_buf();

        let base = if self.pending_relocation_target.is_some() {
            work_dir
        } else {
            scan_root
        };
        if initial && self.relative_path.is_absolute() {
            if let Some(rel) = pathdiff::diff_paths(&self.relative_path, base) {
                self.relative_path = rel;
            }
        }
        self.absolute_path = base.join(&self.relative_path);
    }

    /// Content digest of the file, computed on first use.
    pub fn ensure_content_hash(&mut self) -> io::Result<&str> {
        if self.content_hash.is_none() {
            self.content_hash = Some(sha256_file(&self.absolute_path)?);
        }
        Ok(self.content_hash.as_deref().unwrap_or_default())
    }

    /// First six hex characters of the content hash, used to keep names unique.
    pub fn hash_prefix(&self) -> &str {
        let hash = self.content_hash.as_deref().unwrap_or("");
        &hash[..hash.len().min(6)]
    }

    pub fn file_name(&self) -> String {
        self.relative_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn stem(&self) -> String {
        self.relative_path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string()
    }

    pub fn extension(&self) -> Option<String> {
        self.relative_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
    }
}

/// Resolve the authoritative format id from the candidate matches.
///
/// An `UNKNOWN` first match falls back to the first format token embedded in
/// its warning text. When the warning names several candidates only the
/// first is used, which can misclassify files whose extension is ambiguous.
pub fn resolve_format(matches: &[FormatMatch]) -> (Option<String>, bool) {
    let Some(first) = matches.first() else {
        return (None, false);
    };
    if first.id != UNKNOWN_ID {
        if first.id.is_empty() {
            return (None, false);
        }
        return (Some(first.id.clone()), false);
    }
    match FORMAT_TOKEN_RE.captures(&first.warning) {
        Some(caps) => (Some(format!("{}/{}", &caps[1], &caps[2])), true),
        None => (None, false),
    }
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
