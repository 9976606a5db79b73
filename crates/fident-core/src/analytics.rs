use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::warn;

use crate::record::{sha256_file, FileRecord, Status};
use crate::ThrottledProgress;

/// Running aggregates over the working set. Records are referenced by their
/// index in the record stack.
#[derive(Debug, Clone, Default)]
pub struct Analytics {
    by_hash: HashMap<String, Vec<usize>>,
    by_format: BTreeMap<String, Vec<usize>>,
    identifier_errors: Vec<usize>,
}

/// Aggregate line for one format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatTotals {
    pub format: String,
    pub count: usize,
    pub total_size: u64,
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every record of the stack.
    pub fn build(records: &[FileRecord]) -> Self {
        let mut analytics = Self::new();
        for (idx, record) in records.iter().enumerate() {
            analytics.append(idx, record);
        }
        analytics
    }

    /// Index a record. Removed records and converted files awaiting
    /// relocation are not counted.
    pub fn append(&mut self, idx: usize, record: &FileRecord) {
        if !record.is_active() {
            return;
        }
        if let Some(format) = &record.resolved_format {
            self.by_format.entry(format.clone()).or_default().push(idx);
            if let Some(hash) = &record.content_hash {
                self.by_hash.entry(hash.clone()).or_default().push(idx);
            }
        }
        if !record.errors.is_empty() {
            self.identifier_errors.push(idx);
        }
    }

    /// Drop a removed record from every index.
    pub fn forget(&mut self, idx: usize) {
        for bucket in self.by_format.values_mut() {
            bucket.retain(|&i| i != idx);
        }
        for bucket in self.by_hash.values_mut() {
            bucket.retain(|&i| i != idx);
        }
        self.by_format.retain(|_, bucket| !bucket.is_empty());
        self.by_hash.retain(|_, bucket| !bucket.is_empty());
    }

    pub fn formats(&self) -> impl Iterator<Item = &str> {
        self.by_format.keys().map(String::as_str)
    }

    pub fn records_of(&self, format: &str) -> &[usize] {
        self.by_format.get(format).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn identifier_errors(&self) -> &[usize] {
        &self.identifier_errors
    }

    /// Stable ascending sort of one format bucket by file size.
    pub fn sort_by_file_size(&mut self, format: &str, records: &[FileRecord]) {
        if let Some(bucket) = self.by_format.get_mut(format) {
            bucket.sort_by_key(|&i| records[i].size);
        }
    }

    /// Smallest file of a format, used as a cheap conversion sample.
    pub fn smallest(&mut self, format: &str, records: &[FileRecord]) -> Option<usize> {
        self.sort_by_file_size(format, records);
        self.records_of(format).first().copied()
    }

    /// Groups of records sharing a content hash. Singletons are left out.
    pub fn duplicates(&self, records: &[FileRecord]) -> Vec<Vec<PathBuf>> {
        let mut groups: Vec<Vec<PathBuf>> = self
            .by_hash
            .values()
            .filter(|bucket| bucket.len() > 1)
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|&i| records[i].relative_path.clone())
                    .collect()
            })
            .collect();
        groups.sort();
        groups
    }

    pub fn totals(&self, records: &[FileRecord]) -> Vec<FormatTotals> {
        self.by_format
            .iter()
            .map(|(format, bucket)| FormatTotals {
                format: format.clone(),
                count: bucket.len(),
                total_size: bucket.iter().map(|&i| records[i].size).sum(),
            })
            .collect()
    }
}

/// Fill in missing content hashes in parallel.
pub fn hash_records(records: &mut [FileRecord], progress: &ThrottledProgress) {
    let todo: Vec<(usize, PathBuf)> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.content_hash.is_none() && r.status != Status::Removed)
        .map(|(i, r)| (i, r.absolute_path.clone()))
        .collect();
    if todo.is_empty() {
        return;
    }

    let total = todo.len() as u64;
    let counter = AtomicU64::new(0);
    let hashes: Vec<(usize, std::io::Result<String>)> = todo
        .par_iter()
        .map(|(idx, path)| {
            let hash = sha256_file(path);
            let current = counter.fetch_add(1, Ordering::Relaxed);
            progress.report("hash", current, total, "Hashing files");
            (*idx, hash)
        })
        .collect();

    for (idx, hash) in hashes {
        match hash {
            Ok(hash) => records[idx].content_hash = Some(hash),
            Err(e) => warn!(path = %records[idx].absolute_path.display(), "cannot hash file: {e}"),
        }
    }
}
