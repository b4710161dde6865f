//! ABOUTME: File-backed persistence for job definitions
//! ABOUTME: Loads/saves the `{ "jobs": [...] }` document described in the scheduler's config

use crate::error::{Result, SchedulerError};
use crate::job::Job;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedDocument {
    #[serde(default)]
    jobs: Vec<Job>,
}

/// Read the persisted job document at `path`. A missing or empty file
/// returns an empty list rather than an error, per spec: persistence
/// failures at load time are non-fatal to scheduler startup.
pub fn load(path: &Path) -> Result<Vec<Job>> {
    if !path.exists() {
        debug!(path = %path.display(), "no persistence file found, starting empty");
        return Ok(Vec::new());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| SchedulerError::PersistenceFailed(format!("reading {}: {e}", path.display())))?;

    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    let doc: PersistedDocument = serde_json::from_str(&contents).map_err(|e| {
        SchedulerError::PersistenceFailed(format!("parsing {}: {e}", path.display()))
    })?;

    Ok(doc.jobs)
}

/// Write the given jobs to `path` as the persisted document, creating
/// parent directories as needed. Writes to a temp file in the same
/// directory and renames into place so a crash mid-write never leaves a
/// truncated document behind.
pub fn save(path: &Path, jobs: &[Job]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::PersistenceFailed(format!(
                    "creating directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }

    let doc = PersistedDocument {
        jobs: jobs.to_vec(),
    };
    let serialized = serde_json::to_string_pretty(&doc)
        .map_err(|e| SchedulerError::PersistenceFailed(format!("serializing jobs: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, serialized).map_err(|e| {
        SchedulerError::PersistenceFailed(format!("writing {}: {e}", tmp_path.display()))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        SchedulerError::PersistenceFailed(format!("renaming into {}: {e}", path.display()))
    })?;

    debug!(path = %path.display(), count = jobs.len(), "saved jobs");
    Ok(())
}

/// Best-effort save used from `Stop`: errors are logged, never returned.
pub fn save_best_effort(path: &Path, jobs: &[Job]) {
    if let Err(e) = save(path, jobs) {
        warn!(error = %e, "failed to persist jobs on shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.json");
        let jobs = load(&path).unwrap();
        assert!(jobs.is_empty());
    }

    #[test]
    fn round_trip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let job = Job::one_shot("test-job", Utc::now() + chrono::Duration::seconds(60))
            .with_max_concurrency(3)
            .with_tags(vec!["a".to_string(), "b".to_string()]);

        save(&path, &[job.clone()]).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, job.id);
        assert_eq!(loaded[0].max_concurrency, 3);
        assert_eq!(loaded[0].tags, vec!["a", "b"]);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("jobs.json");
        save(&path, &[]).unwrap();
        assert!(path.exists());
    }
}
