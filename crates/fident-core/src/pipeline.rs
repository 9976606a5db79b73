use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::analytics::{hash_records, Analytics};
use crate::control::CancellationToken;
use crate::error::{Error, Result};
use crate::ledger::{Diagnostic, DiagnosticLedger};
use crate::logdoc::LogDocument;
use crate::policy::{generate_blank, generate_default, GenerateOptions, PolicyFile};
use crate::record::{FileRecord, IdentifierOutput, LogEntry, Status, FILEHANDLER, MSG_FALLBACK};
use crate::registry::FormatRegistry;
use crate::relocate;
use crate::tools::Toolbox;
use crate::ThrottledProgress;

pub const WORKDIR_SUFFIX: &str = "_WORKINGDIR";
pub const REMOVED_DIR: &str = "_REMOVED";
pub const TEST_DIR: &str = "_TEST";
pub const POLICIES_SUFFIX: &str = "_policies.json";
pub const LOG_SUFFIX: &str = "_log.json";

/// Locations derived from the scan root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// Directory the relative paths of records refer to.
    pub root: PathBuf,
    /// What is scanned: the root directory or a single file.
    pub scan_target: PathBuf,
    pub work_dir: PathBuf,
    pub removed_dir: PathBuf,
    pub test_dir: PathBuf,
    pub policies: PathBuf,
    pub log: PathBuf,
}

impl RunPaths {
    /// `<root>_WORKINGDIR`, `<root>_policies.json` and `<root>_log.json` next
    /// to the root. A single file root uses `<parent>_<stem>` as base.
    pub fn new(target: &Path, work_dir: Option<&Path>) -> Self {
        let (root, base) = if target.is_file() {
            let parent = target.parent().unwrap_or(Path::new("")).to_path_buf();
            let stem = target.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
            let base = format!("{}_{}", parent.display(), stem);
            (parent, base)
        } else {
            let trimmed = target.to_string_lossy().trim_end_matches('/').to_string();
            (target.to_path_buf(), trimmed)
        };

        let work_dir = match work_dir {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => PathBuf::from(format!("{base}{}", dir.display())),
            None => PathBuf::from(format!("{base}{WORKDIR_SUFFIX}")),
        };

        Self {
            removed_dir: work_dir.join(REMOVED_DIR),
            test_dir: work_dir.join(TEST_DIR),
            policies: PathBuf::from(format!("{base}{POLICIES_SUFFIX}")),
            log: PathBuf::from(format!("{base}{LOG_SUFFIX}")),
            scan_target: target.to_path_buf(),
            root,
            work_dir,
        }
    }
}

/// Behaviour switches shared by all stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    pub strict: bool,
    pub verbose: bool,
    pub remove_original: bool,
}

/// Orchestrator state: the record stack and everything derived from it.
pub struct Pipeline<'a> {
    pub paths: RunPaths,
    pub settings: Settings,
    pub registry: FormatRegistry,
    pub policies: PolicyFile,
    /// Formats that received a synthesized blank policy this run.
    pub non_default: Vec<String>,
    pub records: Vec<FileRecord>,
    pub analytics: Analytics,
    pub ledger: DiagnosticLedger,
    pub(crate) tools: &'a Toolbox,
    pub(crate) progress: &'a ThrottledProgress<'a>,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        paths: RunPaths,
        settings: Settings,
        registry: FormatRegistry,
        tools: &'a Toolbox,
        progress: &'a ThrottledProgress<'a>,
        cancel: Option<&'a CancellationToken>,
    ) -> Self {
        Self {
            paths,
            settings,
            registry,
            policies: PolicyFile::default(),
            non_default: Vec::new(),
            records: Vec::new(),
            analytics: Analytics::new(),
            ledger: DiagnosticLedger::new(),
            tools,
            progress,
            cancel,
        }
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        match self.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }

    /// Load the record stack from a previous log document, or scan the root.
    pub fn load(&mut self) -> Result<()> {
        if self.paths.log.is_file() {
            info!(log = %self.paths.log.display(), "loading records from log");
            let doc = LogDocument::load(&self.paths.log)?;
            self.records = doc.files;
            for record in &mut self.records {
                if record.status != Status::Removed {
                    record.set_processing_paths(&self.paths.root, &self.paths.work_dir, false);
                }
            }
            self.link_origins();
        }
        if self.records.is_empty() {
            self.scan()?;
        }

        hash_records(&mut self.records, self.progress);
        self.analytics = Analytics::build(&self.records);
        for idx in 0..self.records.len() {
            if self.records[idx].processing_log.iter().any(|e| e.msg == MSG_FALLBACK) {
                self.ledger.note(Diagnostic::Fallback, idx);
            }
        }
        Ok(())
    }

    /// Identify every file below the scan target.
    pub fn scan(&mut self) -> Result<()> {
        let files: Vec<PathBuf> = WalkDir::new(&self.paths.scan_target)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| !p.starts_with(&self.paths.work_dir))
            .collect();
        info!(files = files.len(), root = %self.paths.scan_target.display(), "identifying files");

        let total = files.len() as u64;
        let counter = AtomicU64::new(0);
        let identifier = &self.tools.identifier;
        let progress = self.progress;
        let cancel = self.cancel;
        let outputs: Vec<Option<IdentifierOutput>> = files
            .par_iter()
            .map(|path| {
                if cancel.is_some_and(|t| t.is_cancelled()) {
                    return None;
                }
                let current = counter.fetch_add(1, Ordering::Relaxed);
                progress.report("identify", current, total, "Identifying files");
                Some(identifier.identify(path).unwrap_or_else(|e| {
                    warn!(path = %path.display(), "identification failed: {e}");
                    unidentified(path, e)
                }))
            })
            .collect();
        self.check_cancelled()?;

        for (path, output) in files.iter().zip(outputs) {
            let Some(output) = output else { continue };
            let mut record = match FileRecord::from_identifier(output) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), "unusable identifier output: {e}");
                    FileRecord::from_identifier(unidentified(path, e))?
                }
            };
            record.set_processing_paths(&self.paths.root, &self.paths.work_dir, true);
            self.records.push(record);
        }
        Ok(())
    }

    /// Restore in-memory links from derived records to their originals.
    fn link_origins(&mut self) {
        for idx in 0..self.records.len() {
            let Some(original) = self.records[idx].derived_from.as_deref() else {
                continue;
            };
            let origin = self
                .records
                .iter()
                .position(|r| r.derived_from.is_none() && r.relative_path == original.relative_path);
            self.records[idx].origin = origin;
        }
    }

    /// Establish the policy-of-record for this run and persist it.
    pub fn manage_policies(
        &mut self,
        policies_path: Option<&Path>,
        blank: bool,
        extend: bool,
    ) -> Result<()> {
        let name = self.paths.policies.display().to_string();
        let source = policies_path
            .map(Path::to_path_buf)
            .or_else(|| self.paths.policies.is_file().then(|| self.paths.policies.clone()));
        let formats: Vec<String> = self.analytics.formats().map(str::to_string).collect();
        let options = GenerateOptions {
            strict: self.settings.strict,
            remove_original: self.settings.remove_original,
        };

        if blank {
            info!("generating blank policies");
            self.policies = generate_blank(
                &name,
                formats.iter().map(String::as_str),
                &self.registry,
                options.remove_original,
            );
            self.policies.save(&self.paths.policies)?;
            return Ok(());
        }

        match source {
            None => {
                info!("generating policies");
                let generated = generate_default(
                    &name,
                    formats.iter().map(String::as_str),
                    &self.registry,
                    &PolicyFile::builtin_defaults()?,
                    None,
                    options,
                );
                self.non_default = generated.non_default;
                self.policies = generated.file;
                self.policies.save(&self.paths.policies)?;
            }
            Some(path) => {
                info!(path = %path.display(), "loading policies");
                self.policies = PolicyFile::load(&path)?;
                if extend {
                    info!(path = %self.paths.policies.display(), "extending policies with new formats");
                    let generated = generate_default(
                        &name,
                        formats.iter().map(String::as_str),
                        &self.registry,
                        &PolicyFile::builtin_defaults()?,
                        Some(&self.policies),
                        options,
                    );
                    self.non_default = generated.non_default;
                    self.policies = generated.file;
                    self.policies.save(&self.paths.policies)?;
                }
            }
        }
        Ok(())
    }

    /// Append an entry to a record log and raise it as a hard error.
    pub(crate) fn fail(&mut self, idx: usize, msg: impl Into<String>) {
        let entry = LogEntry::new(FILEHANDLER, msg);
        error!(path = %self.records[idx].relative_path.display(), "{}", entry.msg);
        self.records[idx].processing_log.push(entry.clone());
        self.ledger.error(entry, idx);
    }

    /// Move a record into the quarantine area. I/O failures are recorded and
    /// leave the status untouched.
    pub(crate) fn quarantine(&mut self, idx: usize) -> Result<bool> {
        let record = &mut self.records[idx];
        if let Err(e) = record.ensure_content_hash() {
            warn!(path = %record.absolute_path.display(), "cannot hash file: {e}");
        }
        match relocate::quarantine(record, &self.paths.removed_dir) {
            Ok(()) => {
                record.transition(Status::Removed)?;
                self.analytics.forget(idx);
                Ok(true)
            }
            Err(e) => {
                self.fail(idx, e.to_string());
                Ok(false)
            }
        }
    }

    /// Persist the record stack and the annotated error records.
    pub fn write_log(&self) -> Result<()> {
        let doc = LogDocument {
            files: self.records.clone(),
            errors: self.ledger.dump_errors(&self.records),
        };
        doc.save(&self.paths.log)?;
        info!(path = %self.paths.log.display(), "wrote log");
        Ok(())
    }

    pub fn count(&self, status: Status) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

/// Placeholder output for a file the identifier could not handle, or whose
/// output could not be turned into a record. It carries the failure as
/// identifier error and has no format, so inspection quarantines it.
fn unidentified(path: &Path, err: Error) -> IdentifierOutput {
    IdentifierOutput {
        filename: path.to_path_buf(),
        filesize: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        modified: String::new(),
        errors: err.to_string(),
        matches: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_run_paths_for_directory() {
        let paths = RunPaths::new(Path::new("/data/in"), None);
        assert_eq!(paths.root, PathBuf::from("/data/in"));
        assert_eq!(paths.work_dir, PathBuf::from("/data/in_WORKINGDIR"));
        assert_eq!(paths.removed_dir, PathBuf::from("/data/in_WORKINGDIR/_REMOVED"));
        assert_eq!(paths.test_dir, PathBuf::from("/data/in_WORKINGDIR/_TEST"));
        assert_eq!(paths.policies, PathBuf::from("/data/in_policies.json"));
        assert_eq!(paths.log, PathBuf::from("/data/in_log.json"));
    }

    #[test]
    fn test_run_paths_for_single_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("clip.avi");
        std::fs::write(&file, b"x").unwrap();

        let paths = RunPaths::new(&file, None);
        let base = format!("{}_clip", dir.path().display());
        assert_eq!(paths.root, dir.path());
        assert_eq!(paths.scan_target, file);
        assert_eq!(paths.work_dir, PathBuf::from(format!("{base}_WORKINGDIR")));
        assert_eq!(paths.log, PathBuf::from(format!("{base}_log.json")));
    }

    #[test]
    fn test_run_paths_work_dir_override() {
        let paths = RunPaths::new(Path::new("/data/in"), Some(Path::new("/scratch/w")));
        assert_eq!(paths.work_dir, PathBuf::from("/scratch/w"));
        assert_eq!(paths.removed_dir, PathBuf::from("/scratch/w/_REMOVED"));
    }
}
