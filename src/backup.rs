//! The snapshot scheduler behind the BACKUP job command.
//!
//! The snapshot itself is taken in-process at command time (all bucket
//! read locks, ascending) and only the file write is deferred: it runs on
//! a pool of `max_backups` writer threads, so the number of snapshot
//! writes in flight is bounded by construction. Scheduling never blocks
//! the job worker; a burst of BACKUP commands queues up and drains at pool
//! speed.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::store::render_entries;
use crate::thread_pool::{SharedQueueThreadPool, ThreadPool};
use crate::Result;

/// Dispatches point-in-time snapshots to a bounded pool of writer threads
pub struct BackupScheduler {
    pool: SharedQueueThreadPool,
    limit: u32,
}

impl BackupScheduler {
    /// a scheduler allowing at most `max_backups` snapshot writes in flight
    ///
    /// # Errors
    /// returns an error when the writer threads could not be spawned
    pub fn new(max_backups: u32) -> Result<BackupScheduler> {
        Ok(BackupScheduler {
            pool: SharedQueueThreadPool::new(max_backups)?,
            limit: max_backups,
        })
    }

    /// the configured ceiling on concurrent snapshot writes
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Queues one snapshot for writing to `path`. The entries were copied
    /// out under the store's read locks by the caller, so the file will
    /// reflect the store exactly as it stood when the BACKUP command ran,
    /// however long the write itself takes.
    pub fn schedule(&self, entries: Vec<(String, String)>, path: PathBuf) {
        self.pool.spawn(move || match write_backup(&path, &entries) {
            Ok(()) => debug!(path = %path.display(), pairs = entries.len(), "backup written"),
            Err(e) => error!(path = %path.display(), error = %e, "failed to do backup"),
        });
    }

    /// waits until every queued snapshot has been written, then releases
    /// the writer threads
    pub fn shutdown(self) {
        self.pool.shutdown();
    }
}

/// writes one snapshot in the SHOW format, one `(key, value)` line per pair
fn write_backup(path: &Path, entries: &[(String, String)]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(render_entries(entries).as_bytes())?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn entries(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn backup_file_uses_the_show_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch-1.bck");
        let scheduler = BackupScheduler::new(1).unwrap();
        scheduler.schedule(entries(&[("apple", "red"), ("kiwi", "green")]), path.clone());
        scheduler.shutdown();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "(apple, red)\n(kiwi, green)\n");
    }

    #[test]
    fn every_scheduled_backup_is_written_before_shutdown_returns() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = BackupScheduler::new(2).unwrap();
        for n in 1..=4 {
            let path = dir.path().join(format!("job-{}.bck", n));
            scheduler.schedule(entries(&[("key", "v")]), path);
        }
        scheduler.shutdown();

        for n in 1..=4 {
            assert!(dir.path().join(format!("job-{}.bck", n)).exists());
        }
    }

    #[test]
    fn snapshot_content_is_fixed_at_schedule_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frozen-1.bck");
        let scheduler = BackupScheduler::new(1).unwrap();

        let mut snap = entries(&[("apple", "red")]);
        scheduler.schedule(snap.clone(), path.clone());
        // mutating our copy afterwards must not affect the scheduled write
        snap.push(("banana".to_string(), "yellow".to_string()));
        scheduler.shutdown();

        assert_eq!(fs::read_to_string(&path).unwrap(), "(apple, red)\n");
    }
}
