use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::FileRecord;

/// Persisted state of a run, re-loadable to resume without re-scanning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogDocument {
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub errors: Vec<FileRecord>,
}

impl LogDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Write to a sibling temp file, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);

        let writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(writer, self)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FormatMatch, IdentifierOutput, Status};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn record(path: &str) -> FileRecord {
        FileRecord::from_identifier(IdentifierOutput {
            filename: PathBuf::from(path),
            filesize: 4,
            modified: "2024-01-01T00:00:00Z".to_string(),
            errors: String::new(),
            matches: vec![FormatMatch { id: "fmt/353".to_string(), ..Default::default() }],
        })
        .unwrap()
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("in_log.json");

        let original = record("a/raw.cr2");
        let mut derived = record("raw.cr2_abcdef/raw.tif");
        derived.derived_from = Some(Box::new(original.clone()));
        derived.pending_relocation_target = Some(PathBuf::from("a"));
        let mut removed = record("b/broken.tif");
        removed.transition(Status::Removed).unwrap();

        let doc = LogDocument {
            files: vec![original, derived, removed.clone()],
            errors: vec![removed],
        };
        doc.save(&path).unwrap();
        assert!(!dir.path().join("in_log.json.tmp").exists());

        let loaded = LogDocument::load(&path).unwrap();
        assert_eq!(loaded.files.len(), 3);
        assert_eq!(loaded.errors.len(), 1);
        assert_eq!(loaded.files[2].status, Status::Removed);
        let derived = &loaded.files[1];
        assert_eq!(derived.derived_from.as_ref().unwrap().relative_path, PathBuf::from("a/raw.cr2"));
        assert_eq!(derived.pending_relocation_target, Some(PathBuf::from("a")));
        // working-only fields are not persisted
        assert_eq!(derived.absolute_path, PathBuf::new());
    }

    #[test]
    fn test_status_serialized_lowercase() {
        let json = serde_json::to_value(record("x.tif")).unwrap();
        assert_eq!(json["status"], "discovered");
        assert!(json.get("absolute_path").is_none());
    }
}
