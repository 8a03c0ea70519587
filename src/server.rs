use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::acceptor::{install_reset_handler, Acceptor};
use crate::admission::AdmissionQueue;
use crate::backup::BackupScheduler;
use crate::jobs::JobPool;
use crate::session::{SessionTable, MAX_SESSIONS};
use crate::store::KvStore;
use crate::worker::WorkerPool;
use crate::{KvsubError, Result};

/// Validated server settings, straight from the command line
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// directory holding the `.job` files to drain
    pub jobs_dir: PathBuf,
    /// number of job-runner threads
    pub max_threads: u32,
    /// ceiling on concurrent snapshot writes
    pub max_backups: u32,
    /// path of the registration FIFO to create and own
    pub registration_path: PathBuf,
}

impl ServerConfig {
    /// Validates the raw settings.
    ///
    /// # Errors
    /// [`KvsubError::Parsing`] when a count is zero or the jobs directory
    /// does not exist
    pub fn build(
        jobs_dir: PathBuf,
        max_threads: u32,
        max_backups: u32,
        registration_path: PathBuf,
    ) -> Result<ServerConfig> {
        if !jobs_dir.is_dir() {
            return Err(KvsubError::Parsing(format!(
                "jobs directory does not exist: {}",
                jobs_dir.display()
            )));
        }
        if max_threads == 0 {
            return Err(KvsubError::Parsing("Invalid number of threads".to_string()));
        }
        if max_backups == 0 {
            return Err(KvsubError::Parsing("Invalid number of backups".to_string()));
        }
        Ok(ServerConfig {
            jobs_dir,
            max_threads,
            max_backups,
            registration_path,
        })
    }
}

/// The KVS server: one store shared by the job-runner pool (batch
/// mutations), the session workers (subscriptions), and the acceptor
/// (admission).
///
/// # Example
/// Configure and start a server draining `./jobs` with 4 job threads, at
/// most 2 concurrent backups, registering clients on `/tmp/kvsub-reg`:
/// ```no_run
/// use std::path::PathBuf;
/// use kvsub::{Server, ServerConfig};
/// # fn main() -> kvsub::Result<()> {
/// let config = ServerConfig::build(
///     PathBuf::from("./jobs"),
///     4,
///     2,
///     PathBuf::from("/tmp/kvsub-reg"),
/// )?;
/// Server::new(config).run()?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    store: Arc<KvStore>,
}

impl Server {
    /// a server over a fresh, empty store
    pub fn new(config: ServerConfig) -> Server {
        Server {
            config,
            store: Arc::new(KvStore::new()),
        }
    }

    /// handle to the shared store
    pub fn store(&self) -> Arc<KvStore> {
        Arc::clone(&self.store)
    }

    /// Starts every component and serves until the registration FIFO
    /// becomes unusable.
    ///
    /// The acceptor runs on the calling thread. Session workers and job
    /// runners are background threads; job runners finish when the
    /// directory is drained, session workers live as long as the process.
    /// On the way out the job pool is joined and the backup scheduler is
    /// drained, so every scheduled snapshot reaches disk.
    pub fn run(self) -> Result<()> {
        install_reset_handler()?;

        let table = Arc::new(SessionTable::new());
        let queue = Arc::new(AdmissionQueue::new(MAX_SESSIONS));
        let scheduler = Arc::new(BackupScheduler::new(self.config.max_backups)?);

        let _workers = WorkerPool::start(
            Arc::clone(&self.store),
            Arc::clone(&table),
            Arc::clone(&queue),
            MAX_SESSIONS,
        )?;
        info!(workers = MAX_SESSIONS, "session workers ready");

        let jobs = JobPool::start(
            Arc::clone(&self.store),
            Arc::clone(&scheduler),
            &self.config.jobs_dir,
            self.config.max_threads,
        )?;
        info!(
            jobs_dir = %self.config.jobs_dir.display(),
            threads = self.config.max_threads,
            "job runners ready"
        );

        let acceptor = Acceptor::new(
            Arc::clone(&self.store),
            table,
            queue,
            self.config.registration_path.clone(),
        );
        let outcome = acceptor.run();
        if let Err(e) = &outcome {
            error!(error = %e, "acceptor stopped");
        }

        // fatal teardown: let running jobs finish and flush the backups
        jobs.join();
        match Arc::try_unwrap(scheduler) {
            Ok(scheduler) => scheduler.shutdown(),
            Err(_) => error!("backup scheduler still shared at shutdown"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_zero_counts() {
        let dir = tempfile::tempdir().unwrap();
        let reg = dir.path().join("reg");
        assert!(ServerConfig::build(dir.path().to_path_buf(), 0, 1, reg.clone()).is_err());
        assert!(ServerConfig::build(dir.path().to_path_buf(), 1, 0, reg.clone()).is_err());
        assert!(ServerConfig::build(dir.path().to_path_buf(), 2, 1, reg).is_ok());
    }

    #[test]
    fn config_rejects_a_missing_jobs_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let reg = dir.path().join("reg");
        assert!(ServerConfig::build(missing, 1, 1, reg).is_err());
    }
}
