//! The batch side of the server: a pool of workers draining a directory of
//! `.job` files.
//!
//! All workers share one directory iterator behind a mutex; each claims the
//! next `.job` entry, interprets its command stream against the store, and
//! writes the results to the sibling `<name>.out` file. Job-driven WRITE
//! and DELETE mutations go through the same store paths as everything else,
//! so sessions subscribed to the touched keys are notified from inside the
//! bucket write locks.

use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::acceptor::block_worker_signals;
use crate::backup::BackupScheduler;
use crate::parser::{Command, Commands};
use crate::store::KvStore;
use crate::{KvsubError, Result};

/// usage text printed by the HELP command
const HELP_TEXT: &str = "Available commands:\n\
    \x20 WRITE [(key,value)(key2,value2),...]\n\
    \x20 READ [key,key2,...]\n\
    \x20 DELETE [key,key2,...]\n\
    \x20 SHOW\n\
    \x20 WAIT <delay_ms>\n\
    \x20 BACKUP\n\
    \x20 HELP\n";

/// A running pool of job workers
pub struct JobPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl JobPool {
    /// Starts `workers` threads draining the `.job` files of `jobs_dir`.
    ///
    /// # Errors
    /// returns an error when the directory cannot be read or a thread
    /// cannot be spawned
    pub fn start(
        store: Arc<KvStore>,
        scheduler: Arc<BackupScheduler>,
        jobs_dir: &Path,
        workers: u32,
    ) -> Result<JobPool> {
        let iter = Arc::new(Mutex::new(fs::read_dir(jobs_dir)?));
        let mut handles = Vec::with_capacity(workers as usize);
        for n in 0..workers {
            let store = Arc::clone(&store);
            let scheduler = Arc::clone(&scheduler);
            let iter = Arc::clone(&iter);
            let handle = thread::Builder::new()
                .name(format!("job-worker-{}", n))
                .spawn(move || {
                    block_worker_signals();
                    drain(&store, &scheduler, &iter);
                })?;
            handles.push(handle);
        }
        Ok(JobPool { handles })
    }

    /// waits for every worker to run out of job files
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("job worker panicked");
            }
        }
    }
}

/// claims and runs job files until the shared iterator is exhausted
#[instrument(skip_all)]
fn drain(store: &KvStore, scheduler: &BackupScheduler, iter: &Mutex<fs::ReadDir>) {
    loop {
        let in_path = match next_job(iter) {
            Some(path) => path,
            None => break,
        };
        let out_path = output_path(&in_path);
        debug!(job = %in_path.display(), "claimed");
        if let Err(e) = run_job(store, scheduler, &in_path, &out_path) {
            warn!(job = %in_path.display(), error = %e, "job failed");
        }
    }
}

/// takes the next `.job` entry off the shared directory iterator
fn next_job(iter: &Mutex<fs::ReadDir>) -> Option<PathBuf> {
    let mut dir = match iter.lock() {
        Ok(guard) => guard,
        Err(_) => {
            warn!("directory iterator lock poisoned");
            return None;
        }
    };
    for entry in dir.by_ref() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "job") {
            return Some(path);
        }
    }
    None
}

/// `<dir>/<name>.job` → `<dir>/<name>.out`
pub(crate) fn output_path(in_path: &Path) -> PathBuf {
    in_path.with_extension("out")
}

/// `<dir>/<name>.job` + n → `<dir>/<name>-<n>.bck`
pub(crate) fn backup_path(in_path: &Path, n: u32) -> PathBuf {
    let stem = in_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    in_path.with_file_name(format!("{}-{}.bck", stem, n))
}

/// interprets one job file's command stream
fn run_job(
    store: &KvStore,
    scheduler: &BackupScheduler,
    in_path: &Path,
    out_path: &Path,
) -> Result<()> {
    let reader = BufReader::new(File::open(in_path)?);
    let mut out = File::create(out_path)?;
    // backup numbering restarts for every job file
    let mut backups_taken = 0_u32;

    for command in Commands::new(reader) {
        match command? {
            Command::Write(pairs) => {
                if let Err(e) = store.write_batch(&pairs) {
                    warn!(error = %e, "failed to write pair");
                }
            }
            Command::Read(keys) => {
                let line = store.read_batch(&keys)?;
                out.write_all(line.as_bytes())?;
            }
            Command::Delete(keys) => {
                let misses = store.delete_batch(&keys)?;
                if !misses.is_empty() {
                    out.write_all(misses.as_bytes())?;
                }
            }
            Command::Show => {
                store.show(&mut out)?;
            }
            Command::Wait(ms) => {
                if ms > 0 {
                    info!(delay_ms = ms, "waiting");
                    thread::sleep(Duration::from_millis(ms));
                }
            }
            Command::Backup => {
                backups_taken += 1;
                let snapshot = store.snapshot()?;
                scheduler.schedule(snapshot, backup_path(in_path, backups_taken));
            }
            Command::Help => {
                print!("{}", HELP_TEXT);
            }
            Command::Empty => {}
            Command::Invalid => {
                warn!(job = %in_path.display(), "Invalid command. See HELP for usage");
            }
        }
    }
    out.flush()?;
    Ok(())
}

/// Runs every `.job` file in `jobs_dir` to completion on `workers`
/// threads, for callers that want the batch side only (the server wires
/// the pool up itself so it can keep accepting sessions meanwhile).
pub fn run_jobs_to_completion(
    store: Arc<KvStore>,
    scheduler: Arc<BackupScheduler>,
    jobs_dir: &Path,
    workers: u32,
) -> Result<()> {
    if workers == 0 {
        return Err(KvsubError::Parsing("worker count must be positive".into()));
    }
    JobPool::start(store, scheduler, jobs_dir, workers)?.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_and_backup_paths_sit_next_to_the_job_file() {
        let job = Path::new("/var/jobs/batch1.job");
        assert_eq!(output_path(job), Path::new("/var/jobs/batch1.out"));
        assert_eq!(backup_path(job, 1), Path::new("/var/jobs/batch1-1.bck"));
        assert_eq!(backup_path(job, 12), Path::new("/var/jobs/batch1-12.bck"));
    }

    #[test]
    fn next_job_skips_non_job_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.job"), "SHOW\n").unwrap();
        fs::write(dir.path().join("b.out"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let iter = Mutex::new(fs::read_dir(dir.path()).unwrap());
        let first = next_job(&iter).unwrap();
        assert_eq!(first.extension().unwrap(), "job");
        assert!(next_job(&iter).is_none());
    }
}
