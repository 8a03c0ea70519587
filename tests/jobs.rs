//! End-to-end tests of the job runner pool: `.job` files in, `.out` and
//! `.bck` files out, against a shared in-memory store.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use kvsub::backup::BackupScheduler;
use kvsub::jobs::run_jobs_to_completion;
use kvsub::KvStore;

fn run_dir(dir: &Path, workers: u32, max_backups: u32) -> Arc<KvStore> {
    let store = Arc::new(KvStore::new());
    let scheduler = Arc::new(BackupScheduler::new(max_backups).unwrap());
    run_jobs_to_completion(Arc::clone(&store), Arc::clone(&scheduler), dir, workers).unwrap();
    // all job workers are done; drain outstanding snapshot writes
    match Arc::try_unwrap(scheduler) {
        Ok(scheduler) => scheduler.shutdown(),
        Err(_) => panic!("scheduler still shared after join"),
    }
    store
}

#[test]
fn write_read_delete_produce_the_documented_encodings() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("batch.job"),
        "WRITE [(apple,red)(banana,yellow)]\n\
         READ [banana,apple,missing]\n\
         DELETE [apple,ghost]\n\
         READ [apple]\n",
    )
    .unwrap();

    let store = run_dir(dir.path(), 1, 1);

    let out = fs::read_to_string(dir.path().join("batch.out")).unwrap();
    assert_eq!(
        out,
        "[(apple,red)(banana,yellow)(missing,KVSERROR)]\n\
         [(ghost,KVSMISSING)]\n\
         [(apple,KVSERROR)]\n"
    );
    assert_eq!(store.get("banana").unwrap(), Some("yellow".to_string()));
    assert_eq!(store.get("apple").unwrap(), None);
}

#[test]
fn show_dumps_the_store_sorted() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("show.job"),
        "WRITE [(pear,green)(apple,red)]\nSHOW\n",
    )
    .unwrap();

    run_dir(dir.path(), 1, 1);

    let out = fs::read_to_string(dir.path().join("show.out")).unwrap();
    assert_eq!(out, "(apple, red)\n(pear, green)\n");
}

#[test]
fn blank_and_invalid_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("messy.job"),
        "\nFROBNICATE [x]\nWRITE [(kiwi,good)]\n\nREAD [kiwi]\nHELP\n",
    )
    .unwrap();

    run_dir(dir.path(), 1, 1);

    let out = fs::read_to_string(dir.path().join("messy.out")).unwrap();
    assert_eq!(out, "[(kiwi,good)]\n");
}

#[test]
fn wait_pauses_the_job() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("slow.job"), "WAIT 150\nWRITE [(done,1)]\n").unwrap();

    let started = Instant::now();
    let store = run_dir(dir.path(), 1, 1);
    assert!(started.elapsed().as_millis() >= 150);
    assert_eq!(store.get("done").unwrap(), Some("1".to_string()));
}

#[test]
fn every_job_file_is_claimed_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    for n in 0..6 {
        fs::write(
            dir.path().join(format!("job{}.job", n)),
            format!("WRITE [(key{},{})]\nREAD [key{}]\n", n, n, n),
        )
        .unwrap();
    }
    // a non-job file must be ignored
    fs::write(dir.path().join("README.txt"), "not a job").unwrap();

    let store = run_dir(dir.path(), 3, 1);

    for n in 0..6 {
        let out = fs::read_to_string(dir.path().join(format!("job{}.out", n))).unwrap();
        assert_eq!(out, format!("[(key{},{})]\n", n, n));
    }
    assert_eq!(store.len().unwrap(), 6);
    assert!(!dir.path().join("README.out").exists());
}

#[test]
fn backups_are_numbered_per_job_and_frozen_at_command_time() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("snap.job"),
        "WRITE [(apple,red)]\n\
         BACKUP\n\
         WRITE [(banana,yellow)]\n\
         BACKUP\n",
    )
    .unwrap();

    run_dir(dir.path(), 1, 2);

    let first = fs::read_to_string(dir.path().join("snap-1.bck")).unwrap();
    assert_eq!(first, "(apple, red)\n");
    let second = fs::read_to_string(dir.path().join("snap-2.bck")).unwrap();
    assert_eq!(second, "(apple, red)\n(banana, yellow)\n");
}

#[test]
fn a_backup_burst_larger_than_the_ceiling_still_writes_every_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("burst.job"),
        "WRITE [(k,v)]\nBACKUP\nBACKUP\nBACKUP\nBACKUP\n",
    )
    .unwrap();

    // ceiling of 2 writers for 4 queued snapshots
    run_dir(dir.path(), 1, 2);

    for n in 1..=4 {
        let path = dir.path().join(format!("burst-{}.bck", n));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "(k, v)\n",
            "missing or wrong backup {}",
            n
        );
    }
}
