use std::path::PathBuf;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::Result;
use crate::ledger::Diagnostic;
use crate::pipeline::Pipeline;
use crate::policy::Tool;
use crate::record::{Status, EXT_MISMATCH, FILEHANDLER};
use crate::relocate::rename_extension;
use crate::tools::{ffmpeg, InspectorKind, ProbeReport};

pub const PUIDFAIL: &str = "failed to get fmt type";
pub const CORRUPT: &str = "file is corrupt: removed";
pub const REENCODE: &str = "re-encoding the file";

impl Pipeline<'_> {
    /// Structural checks over every discovered record: quarantine what has
    /// no format, is empty or is corrupt; fix extensions; collect probe info.
    pub fn inspect(&mut self) -> Result<()> {
        let candidates: Vec<usize> = (0..self.records.len())
            .filter(|&i| self.records[i].status == Status::Discovered && self.records[i].is_active())
            .collect();
        info!(files = candidates.len(), "inspecting files");

        let mut jobs: Vec<(usize, InspectorKind, PathBuf)> = Vec::new();
        for idx in candidates {
            self.check_cancelled()?;
            if let Some(kind) = self.prepare(idx)? {
                jobs.push((idx, kind, self.records[idx].absolute_path.clone()));
            }
        }

        let total = jobs.len() as u64;
        let probe = &self.tools.probe;
        let progress = self.progress;
        let verbose = self.settings.verbose;
        let reports: Vec<(usize, InspectorKind, Result<ProbeReport>)> = jobs
            .into_par_iter()
            .enumerate()
            .map(|(n, (idx, kind, path))| {
                progress.report("inspect", n as u64, total, "Probing files");
                (idx, kind, probe.inspect(kind, &path, verbose))
            })
            .collect();

        for (idx, kind, report) in reports {
            self.apply_report(idx, kind, report)?;
        }
        self.check_cancelled()
    }

    /// Checks that need no external probe. Returns the probe to run, if any.
    fn prepare(&mut self, idx: usize) -> Result<Option<InspectorKind>> {
        let Some(format) = self.records[idx].resolved_format.clone() else {
            let path = self.records[idx].relative_path.display().to_string();
            if self.quarantine(idx)? {
                self.records[idx].log(FILEHANDLER, "file removed");
            }
            self.fail(idx, format!("{PUIDFAIL} for {path}"));
            return Ok(None);
        };

        if self.records[idx].is_empty_source() {
            if self.quarantine(idx)? {
                self.records[idx].log(FILEHANDLER, CORRUPT);
            }
            self.ledger.note(Diagnostic::EmptySource, idx);
            return Ok(None);
        }

        let policy = self.policies.get(&format);
        if self.settings.strict && policy.is_none() {
            // removed later when policies are applied
            return Ok(None);
        }
        let tool = policy.map_or(Tool::None, |p| p.bin);

        if self.records[idx].has_warning(EXT_MISMATCH) {
            self.fix_extension(idx, &format);
        }

        let record = &self.records[idx];
        let mime = match record.mime() {
            "" => mime_guess::from_path(&record.relative_path).first_raw().unwrap_or(""),
            mime => mime,
        };
        let (kind, inferred) = InspectorKind::resolve(tool, mime);
        if kind == InspectorKind::NotInspectable {
            return Ok(None);
        }
        if inferred {
            self.records[idx].log_once(
                FILEHANDLER,
                format!(
                    "bin not specified in policies, using {} according to the file mimetype for probing",
                    kind.tool().as_str()
                ),
            );
        }
        Ok(Some(kind))
    }

    /// Rename to the single canonical extension, or warn when it is ambiguous.
    /// A file already carrying an expected extension is left alone.
    fn fix_extension(&mut self, idx: usize, format: &str) {
        let expected = self.registry.extensions(format).to_vec();
        let record = &mut self.records[idx];
        if record.extension().is_some_and(|ext| expected.contains(&ext)) {
            return;
        }
        self.ledger.note(Diagnostic::ExtMismatch, idx);

        if let [ext] = expected.as_slice() {
            if let Err(e) = record.ensure_content_hash() {
                warn!(path = %record.absolute_path.display(), "cannot hash file: {e}");
            }
            match rename_extension(record, ext) {
                Ok(dest) => {
                    let old = record.file_name();
                    if let Some(rel) = pathdiff::diff_paths(&dest, &record.scan_root) {
                        record.relative_path = rel;
                    }
                    record.absolute_path = dest;
                    let new = record.file_name();
                    record.log(FILEHANDLER, format!("did rename {old} -> {new}"));
                }
                Err(e) => self.fail(idx, e.to_string()),
            }
        } else {
            let msg = format!("expecting one of the following ext: {expected:?}");
            warn!(path = %record.relative_path.display(), "you should manually rename the file. {msg}");
            record.log_once(FILEHANDLER, msg);
        }
    }

    fn apply_report(&mut self, idx: usize, kind: InspectorKind, report: Result<ProbeReport>) -> Result<()> {
        let tool = kind.tool().as_str();
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                self.fail(idx, format!("probe failed: {e}"));
                return Ok(());
            }
        };

        let record = &mut self.records[idx];
        if let Some(info) = report.info {
            record.attach_media_info(info);
        }
        if !report.warning.is_empty() {
            record.log(tool, report.warning.as_str());
        }

        if report.corrupt {
            self.ledger.note(Diagnostic::Corrupt, idx);
            if self.quarantine(idx)? {
                self.records[idx].log(FILEHANDLER, CORRUPT);
            }
            return Ok(());
        }
        if !report.warning.is_empty() {
            self.ledger.note(Diagnostic::Warning, idx);
            if kind == InspectorKind::Media && ffmpeg::needs_reencode(&report.warning) {
                let record = &mut self.records[idx];
                record.log(FILEHANDLER, REENCODE);
                record.transition(Status::Pending)?;
            }
        }
        Ok(())
    }
}
