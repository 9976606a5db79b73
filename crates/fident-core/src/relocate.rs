use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::record::{FileRecord, Status};

/// `dest` if free, else `<stem>_<hash6>.<ext>` in the same directory.
pub fn collision_free(dest: &Path, hash_prefix: &str) -> PathBuf {
    if !dest.exists() || hash_prefix.is_empty() {
        return dest.to_path_buf();
    }
    let stem = dest.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let name = match dest.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{stem}_{hash_prefix}.{ext}"),
        None => format!("{stem}_{hash_prefix}"),
    };
    dest.with_file_name(name)
}

/// Rename, falling back to copy and delete across file systems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !from.is_file() {
                return Err(rename_err);
            }
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Move a record's file to `<removed_dir>/<relative_path>`.
pub fn quarantine(record: &FileRecord, removed_dir: &Path) -> io::Result<()> {
    let dest = collision_free(&removed_dir.join(&record.relative_path), record.hash_prefix());
    move_file(&record.absolute_path, &dest)
}

/// Give a file a new extension in place. Returns the new path.
pub fn rename_extension(record: &FileRecord, ext: &str) -> io::Result<PathBuf> {
    let dest = collision_free(&record.absolute_path.with_extension(ext), record.hash_prefix());
    fs::rename(&record.absolute_path, &dest)?;
    Ok(dest)
}

/// Remove empty directories below `root`, keeping `root` itself.
pub fn prune_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        // fails on non-empty directories, which is what we want
        let _ = fs::remove_dir(entry.path());
    }
}

impl Pipeline<'_> {
    /// Move verified conversions next to their originals and quarantine
    /// originals whose policy asks for it.
    pub fn relocate(&mut self) -> Result<usize> {
        let movers: Vec<usize> = (0..self.records.len())
            .filter(|&i| {
                let r = &self.records[i];
                r.pending_relocation_target.is_some() && r.status != Status::Removed
            })
            .collect();
        if movers.is_empty() {
            info!("nothing to relocate");
            return Ok(0);
        }

        let total = movers.len() as u64;
        let mut moved = 0;
        for (n, idx) in movers.into_iter().enumerate() {
            self.check_cancelled()?;
            self.progress.report("relocate", n as u64, total, "Moving converted files");
            if self.relocate_one(idx)? {
                moved += 1;
            }
        }

        if self.paths.work_dir.is_dir() {
            prune_empty_dirs(&self.paths.work_dir);
        }
        info!(moved, "relocated converted files");
        Ok(moved)
    }

    fn relocate_one(&mut self, idx: usize) -> Result<bool> {
        let root = self.paths.root.clone();
        let work_dir = self.paths.work_dir.clone();

        let record = &mut self.records[idx];
        let Some(target_rel) = record.pending_relocation_target.clone() else {
            return Ok(false);
        };
        let source = record.absolute_path.clone();
        let conversion_dir = source.parent().map(Path::to_path_buf);
        if let Err(e) = record.ensure_content_hash() {
            warn!(path = %source.display(), "cannot hash file: {e}");
        }
        let dest = collision_free(
            &root.join(&target_rel).join(record.file_name()),
            record.hash_prefix(),
        );

        if let Err(e) = move_file(&source, &dest) {
            self.fail(idx, format!("failed to move {}: {e}", source.display()));
            return Ok(false);
        }

        let dest_name = dest.file_name().map(PathBuf::from).unwrap_or_default();
        record.relative_path = target_rel.join(dest_name);
        record.pending_relocation_target = None;
        record.set_processing_paths(&root, &work_dir, false);
        record.transition(Status::Added)?;
        let origin = record.origin;

        if let Some(dir) = conversion_dir.filter(|d| d.starts_with(&work_dir) && *d != work_dir) {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), "cannot remove conversion directory: {e}");
            }
        }
        self.analytics.append(idx, &self.records[idx]);

        if let Some(origin) = origin {
            self.remove_superseded(origin)?;
        }
        Ok(true)
    }

    /// Quarantine an original after its converted replacement is in place.
    fn remove_superseded(&mut self, origin: usize) -> Result<()> {
        let original = &self.records[origin];
        let by_policy = original
            .resolved_format
            .as_deref()
            .and_then(|f| self.policies.get(f))
            .is_some_and(|p| p.remove_original);
        if !(by_policy || self.settings.remove_original) {
            return Ok(());
        }
        if original.status == Status::Removed || !original.absolute_path.is_file() {
            return Ok(());
        }
        self.quarantine(origin)?;
        Ok(())
    }
}
