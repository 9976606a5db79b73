use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::policy::{PolicyEntry, Tool};
use crate::record::{sha256_file, FileRecord, LogEntry, Status, FILEHANDLER};
use crate::tools::{ConversionRequest, InspectorKind};

pub const CONVFAILED: &str = "conversion failed";
pub const NOTEXPECTEDFMT: &str = "converted file does not match the expected fmt.";

/// What a single conversion attempt produced.
#[derive(Debug)]
pub enum Outcome {
    /// Output re-identified as one of the expected formats.
    Verified(Box<FileRecord>),
    /// No output file was written.
    Failed,
    /// Output exists but has another format.
    Unexpected { expected: Vec<String>, actual: String },
}

#[derive(Debug)]
pub struct Attempt {
    pub command: String,
    pub target: PathBuf,
    pub outcome: Outcome,
}

/// Result of converting the sample file of one format.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyTest {
    pub format: String,
    pub sample: PathBuf,
    pub command: String,
    pub target: PathBuf,
    pub verified: bool,
    pub message: String,
}

impl Pipeline<'_> {
    /// Convert every pending original. Failures leave the record pending.
    pub fn convert(&mut self) -> Result<usize> {
        let pending: Vec<usize> = (0..self.records.len())
            .filter(|&i| {
                self.records[i].status == Status::Pending
                    && self.records[i].pending_relocation_target.is_none()
            })
            .collect();
        if pending.is_empty() {
            info!("there was nothing to convert");
            return Ok(0);
        }
        info!(files = pending.len(), "converting");

        let total = pending.len() as u64;
        let work_dir = self.paths.work_dir.clone();
        // derived records join the stack after the loop
        let mut derived: Vec<FileRecord> = Vec::new();
        for (n, idx) in pending.into_iter().enumerate() {
            self.check_cancelled()?;
            self.progress.report("convert", n as u64, total, "Converting files");
            if let Some(record) = self.convert_one(idx, &work_dir)? {
                derived.push(record);
            }
        }

        let converted = derived.len();
        self.records.extend(derived);
        Ok(converted)
    }

    fn convert_one(&mut self, idx: usize, work_dir: &Path) -> Result<Option<FileRecord>> {
        let format = self.records[idx].resolved_format.clone().unwrap_or_default();
        let Some(policy) = self.policies.get(&format).cloned() else {
            self.fail(idx, format!("{CONVFAILED}. no policy for {format}"));
            return Ok(None);
        };

        let attempt = match self.attempt(&self.records[idx], &policy, work_dir) {
            Ok(attempt) => attempt,
            Err(e @ (Error::Cancelled | Error::InvalidTransition { .. })) => return Err(e),
            Err(e) => {
                self.fail(idx, format!("{CONVFAILED}. {e}"));
                return Ok(None);
            }
        };

        match attempt.outcome {
            Outcome::Failed => {
                self.fail(idx, format!("{CONVFAILED}. cmd={}", attempt.command));
                Ok(None)
            }
            Outcome::Unexpected { expected, actual } => {
                let msg = format!("{NOTEXPECTEDFMT} did expect {expected:?}, got {actual} instead");
                error!(path = %self.records[idx].relative_path.display(), "{msg}");
                let entry = LogEntry::new(FILEHANDLER, format!("{msg}. cmd={}", attempt.command));
                self.records[idx].processing_log.push(entry.clone());
                self.ledger.error(entry, idx);
                Ok(None)
            }
            Outcome::Verified(mut derived) => {
                let original = &mut self.records[idx];
                derived.pending_relocation_target =
                    Some(original.relative_path.parent().map(Path::to_path_buf).unwrap_or_default());
                derived.set_processing_paths(&self.paths.root, &self.paths.work_dir, true);
                if let Err(e) = derived.ensure_content_hash() {
                    warn!(path = %derived.absolute_path.display(), "cannot hash file: {e}");
                }

                let work_name = self
                    .paths
                    .work_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                original.log(
                    FILEHANDLER,
                    format!("converted -> {work_name}/{}", derived.relative_path.display()),
                );
                original.transition(Status::Added)?;
                derived.derived_from = Some(Box::new(original.clone()));
                derived.origin = Some(idx);
                Ok(Some(*derived))
            }
        }
    }

    /// Run the converter for a record and verify its output. The record
    /// itself is not modified.
    pub fn attempt(&self, record: &FileRecord, policy: &PolicyEntry, work_root: &Path) -> Result<Attempt> {
        if policy.bin == Tool::None || policy.target_container.is_empty() {
            return Err(Error::tool("converter", "policy has no conversion parameters"));
        }
        let hash = match &record.content_hash {
            Some(hash) => hash.clone(),
            None => sha256_file(&record.absolute_path)?,
        };
        let file_name = record.file_name();
        // mirror the source folder so equal names in different folders stay apart
        let folder = record
            .relative_path
            .parent()
            .filter(|p| p.is_relative())
            .unwrap_or(Path::new(""));
        let wdir = work_root
            .join(folder)
            .join(format!("{file_name}_{}", &hash[..hash.len().min(6)]));
        fs::create_dir_all(&wdir)?;

        let stem = record.stem();
        let request = ConversionRequest {
            source: &record.absolute_path,
            tool: policy.bin,
            target_container: &policy.target_container,
            args: &policy.processing_args,
            work_dir: &wdir,
            stem: &stem,
        };
        let output = self.tools.converter.convert(&request)?;
        let log_text = self.readable_log(&output.log_path);

        if !output.target.is_file() {
            return Ok(Attempt {
                command: output.command,
                target: output.target,
                outcome: Outcome::Failed,
            });
        }

        let mut converted = FileRecord::from_identifier(self.tools.identifier.identify(&output.target)?)?;
        let actual = converted.resolved_format.clone().unwrap_or_default();
        if !policy.expected.contains(&actual) {
            return Ok(Attempt {
                command: output.command,
                target: output.target,
                outcome: Outcome::Unexpected {
                    expected: policy.expected.clone(),
                    actual,
                },
            });
        }

        let (kind, _) = InspectorKind::resolve(policy.bin, converted.mime());
        match self.tools.probe.media_info(kind, &output.target) {
            Ok(Some(info)) => converted.attach_media_info(info),
            Ok(None) => {}
            Err(e) => warn!(path = %output.target.display(), "cannot collect media info: {e}"),
        }
        if !log_text.is_empty() {
            converted.log(policy.bin.as_str(), log_text);
        }
        Ok(Attempt {
            command: output.command,
            target: output.target,
            outcome: Outcome::Verified(Box::new(converted)),
        })
    }

    /// Converter log with the run's root and working directory prefixes removed.
    fn readable_log(&self, log_path: &Path) -> String {
        let text = fs::read_to_string(log_path).unwrap_or_default();
        let root = format!("{}/", self.paths.root.display());
        let work = format!("{}/", self.paths.work_dir.display());
        text.replace(&root, "").replace(&work, "").trim().to_string()
    }

    /// Convert the smallest file of each non-accepted format, or of the
    /// given format, into the test area. The record stack is left unchanged.
    pub fn test_policies(&mut self, format: Option<&str>) -> Result<Vec<PolicyTest>> {
        let formats: Vec<String> = match format {
            Some(f) => vec![f.to_string()],
            None => self
                .analytics
                .formats()
                .filter(|f| self.policies.get(f).is_some_and(|p| !p.accepted))
                .map(str::to_string)
                .collect(),
        };
        if formats.is_empty() {
            info!("no files found that should be converted with given policies");
            return Ok(Vec::new());
        }

        let test_dir = self.paths.test_dir.clone();
        let mut results = Vec::new();
        for format in formats {
            self.check_cancelled()?;
            let Some(policy) = self.policies.get(&format).cloned() else {
                warn!(format, "format is not in policies");
                continue;
            };
            let Some(sample) = self.analytics.smallest(&format, &self.records) else {
                warn!(format, "no sample file for format");
                continue;
            };
            let record = &self.records[sample];
            let result = match self.attempt(record, &policy, &test_dir) {
                Ok(attempt) => {
                    let (verified, message) = match attempt.outcome {
                        Outcome::Verified(_) => (true, "verified".to_string()),
                        Outcome::Failed => (false, CONVFAILED.to_string()),
                        Outcome::Unexpected { expected, actual } => (
                            false,
                            format!("{NOTEXPECTEDFMT} did expect {expected:?}, got {actual} instead"),
                        ),
                    };
                    PolicyTest {
                        format: format.clone(),
                        sample: record.relative_path.clone(),
                        command: attempt.command,
                        target: attempt.target,
                        verified,
                        message,
                    }
                }
                Err(e) => PolicyTest {
                    format: format.clone(),
                    sample: record.relative_path.clone(),
                    command: String::new(),
                    target: PathBuf::new(),
                    verified: false,
                    message: format!("{CONVFAILED}. {e}"),
                },
            };
            info!(format, verified = result.verified, command = %result.command, "tested policy");
            results.push(result);
        }
        Ok(results)
    }
}
