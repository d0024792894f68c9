//! On-disk job records.
//!
//! Each job lives in `<queue_dir>/<job-id>.json`. Every state change rewrites
//! the whole record with the write-to-temp-then-rename pattern:
//!
//! 1. Write to `<job-id>.json.tmp`
//! 2. fsync the temp file
//! 3. Rename over `<job-id>.json`
//! 4. fsync the directory
//!
//! A crash at any point leaves either the old or the new record, never a torn
//! one. Leftover `.tmp` files are removed on open.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::job::JobRecord;
use super::{QueueError, Result};
use crate::types::JobId;

/// Validates that a job ID is safe to use as a file name.
///
/// Rejects empty IDs, path separators, NUL bytes and a leading dot (hidden
/// files, `.` and `..`).
pub(crate) fn validate_job_id(job_id: &JobId) -> Result<()> {
    let id = job_id.as_str();

    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0')
        || id.starts_with('.')
    {
        return Err(QueueError::InvalidJobId(job_id.clone()));
    }

    Ok(())
}

/// Path of a job's record file.
pub(crate) fn record_path(dir: &Path, job_id: &JobId) -> PathBuf {
    dir.join(format!("{}.json", job_id.as_str()))
}

fn temp_path(record: &Path) -> PathBuf {
    record.with_extension("json.tmp")
}

fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so that created, renamed and deleted entries survive a
/// power loss.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

/// Writes a job record atomically.
pub(crate) fn write_record(dir: &Path, record: &JobRecord) -> Result<()> {
    let path = record_path(dir, &record.id);
    let tmp = temp_path(&path);
    let bytes = serde_json::to_vec_pretty(record)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        fsync_file(&file)?;
    }

    std::fs::rename(&tmp, &path)?;
    fsync_dir(dir)?;

    Ok(())
}

/// Deletes a job record. Missing files are not an error.
pub(crate) fn remove_record(dir: &Path, job_id: &JobId) -> Result<()> {
    let path = record_path(dir, job_id);
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let _ = std::fs::remove_file(temp_path(&path));
    Ok(())
}

/// Reads every job record in the directory.
///
/// Stale temp files are deleted. Records that fail to parse are logged and
/// skipped rather than blocking startup.
pub(crate) fn load_records(dir: &Path) -> Result<Vec<JobRecord>> {
    let mut records = Vec::new();
    let mut removed_any = false;

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.ends_with(".json.tmp") {
            if std::fs::remove_file(&path).is_ok() {
                removed_any = true;
            }
            continue;
        }

        if !name.ends_with(".json") {
            continue;
        }

        let bytes = std::fs::read(&path)?;
        match serde_json::from_slice::<JobRecord>(&bytes) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job record"),
        }
    }

    if removed_any {
        fsync_dir(dir)?;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::JobState;
    use crate::test_utils::noop_task;
    use tempfile::tempdir;

    fn record(id: &str) -> JobRecord {
        JobRecord::new(JobId::new(id), noop_task(), 0, 3)
    }

    #[test]
    fn write_then_load() {
        let dir = tempdir().unwrap();
        write_record(dir.path(), &record("wf:noop:1")).unwrap();
        write_record(dir.path(), &record("wf:noop:2")).unwrap();

        let mut loaded = load_records(dir.path()).unwrap();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id.as_str(), "wf:noop:1");
        assert_eq!(loaded[0].state, JobState::Waiting);
    }

    #[test]
    fn rewrite_replaces_record() {
        let dir = tempdir().unwrap();
        let mut rec = record("wf:noop:1");
        write_record(dir.path(), &rec).unwrap();

        rec.state = JobState::Active;
        write_record(dir.path(), &rec).unwrap();

        let loaded = load_records(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, JobState::Active);
        assert!(!temp_path(&record_path(dir.path(), &rec.id)).exists());
    }

    #[test]
    fn load_removes_temp_and_skips_garbage() {
        let dir = tempdir().unwrap();
        write_record(dir.path(), &record("wf:noop:1")).unwrap();
        std::fs::write(dir.path().join("wf:noop:2.json.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let loaded = load_records(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!dir.path().join("wf:noop:2.json.tmp").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let rec = record("wf:noop:1");
        write_record(dir.path(), &rec).unwrap();

        remove_record(dir.path(), &rec.id).unwrap();
        remove_record(dir.path(), &rec.id).unwrap();
        assert!(load_records(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn unsafe_ids_rejected() {
        for id in ["", "a/b", "a\\b", ".hidden", "..", "a\0b"] {
            assert!(
                matches!(
                    validate_job_id(&JobId::new(id)),
                    Err(QueueError::InvalidJobId(_))
                ),
                "{id:?} should be rejected"
            );
        }
        assert!(validate_job_id(&JobId::new("wf:shell:0123456789abcdef")).is_ok());
    }

    #[test]
    fn fsync_dir_fails_on_nonexistent() {
        assert!(fsync_dir(Path::new("/nonexistent/queue/dir")).is_err());
    }
}
