use std::collections::BTreeMap;

use serde::Serialize;

use crate::record::{FileRecord, LogEntry};

/// Reporting categories for non-fatal findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnostic {
    EmptySource,
    Corrupt,
    Warning,
    ExtMismatch,
    Fallback,
}

impl Diagnostic {
    pub fn label(&self) -> &'static str {
        match self {
            Diagnostic::EmptySource => "empty source",
            Diagnostic::Corrupt => "corrupt",
            Diagnostic::Warning => "warning",
            Diagnostic::ExtMismatch => "extension mismatch",
            Diagnostic::Fallback => "fallback on extension",
        }
    }
}

/// Shared per-run collection of diagnostics and hard errors.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticLedger {
    diagnostics: BTreeMap<Diagnostic, Vec<usize>>,
    errors: Vec<(LogEntry, usize)>,
}

impl DiagnosticLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic for a record. Repeats are ignored.
    pub fn note(&mut self, kind: Diagnostic, idx: usize) {
        let bucket = self.diagnostics.entry(kind).or_default();
        if !bucket.contains(&idx) {
            bucket.push(idx);
        }
    }

    pub fn error(&mut self, entry: LogEntry, idx: usize) {
        self.errors.push((entry, idx));
    }

    pub fn diagnostics(&self, kind: Diagnostic) -> &[usize] {
        self.diagnostics.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn categories(&self) -> impl Iterator<Item = (Diagnostic, usize)> + '_ {
        self.diagnostics.iter().map(|(k, v)| (*k, v.len()))
    }

    pub fn errors(&self) -> &[(LogEntry, usize)] {
        &self.errors
    }

    /// Copies of the erroneous records, each carrying its ledger entries.
    pub fn dump_errors(&self, records: &[FileRecord]) -> Vec<FileRecord> {
        let mut annotated: BTreeMap<usize, FileRecord> = BTreeMap::new();
        for (entry, idx) in &self.errors {
            let Some(record) = records.get(*idx) else { continue };
            let copy = annotated.entry(*idx).or_insert_with(|| record.clone());
            if !copy.processing_log.contains(entry) {
                copy.processing_log.push(entry.clone());
            }
        }
        annotated.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{IdentifierOutput, FILEHANDLER};
    use std::path::PathBuf;

    fn record(name: &str) -> FileRecord {
        FileRecord::from_identifier(IdentifierOutput {
            filename: PathBuf::from(name),
            filesize: 1,
            modified: String::new(),
            errors: String::new(),
            matches: Vec::new(),
        })
        .unwrap()
    }

    #[test]
    fn test_note_deduplicates() {
        let mut ledger = DiagnosticLedger::new();
        ledger.note(Diagnostic::ExtMismatch, 3);
        ledger.note(Diagnostic::ExtMismatch, 3);
        ledger.note(Diagnostic::Warning, 3);
        assert_eq!(ledger.diagnostics(Diagnostic::ExtMismatch), &[3]);
        assert_eq!(ledger.categories().count(), 2);
        assert!(ledger.errors().is_empty());
    }

    #[test]
    fn test_dump_errors_annotates_once_per_record() {
        let records = vec![record("a.bin"), record("b.bin")];
        let mut ledger = DiagnosticLedger::new();
        ledger.error(LogEntry::new(FILEHANDLER, "failed to get fmt type"), 1);
        ledger.error(LogEntry::new(FILEHANDLER, "conversion failed"), 1);

        let dumped = ledger.dump_errors(&records);
        assert_eq!(dumped.len(), 1);
        assert_eq!(dumped[0].relative_path, PathBuf::from("b.bin"));
        assert_eq!(dumped[0].processing_log.len(), 2);
        assert_eq!(ledger.errors().len(), 2);
    }
}
