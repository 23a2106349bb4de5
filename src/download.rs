//! Client-side download pipeline.
//!
//! One enumeration loop feeds a `Dispatcher`, which hands each entry to one of
//! a fixed pool of workers through a single-slot channel. A push suspends while
//! the slot is taken, so listing consumption follows download throughput.
//! Every job is claimed by exactly one worker and never retried; failures are
//! logged with the entry name and only abandon that job.

use anyhow::{anyhow, Context, Result};
use filetime::FileTime;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::client::{Client, RemoteStream};
use crate::progress::ProgressObserver;
use crate::protocol::{DirEntry, DownloadChunk, Timestamp, DEFAULT_WORKERS};
use crate::protocol_core::relative_path;

/// What to do with the mtime step when setting permission bits failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionFailure {
    /// Log it and still set the modification time
    Continue,
    /// Log it and leave the modification time alone
    SkipTimes,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub workers: usize,
    /// Apply server-reported permission bits to created files and directories
    pub apply_permissions: bool,
    pub on_permission_failure: PermissionFailure,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            apply_permissions: cfg!(unix),
            on_permission_failure: PermissionFailure::Continue,
        }
    }
}

/// Unit of dispatch: one listing entry
#[derive(Debug, Clone)]
pub struct Job {
    pub entry: DirEntry,
}

#[derive(Debug)]
enum JobOutcome {
    Directory { path: PathBuf, mod_time: Timestamp },
    File { bytes: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
    /// Names of jobs that were abandoned
    pub failed: Vec<String>,
    /// Set when the listing stream ended with an error instead of END
    pub listing_error: Option<String>,
    /// Directories created by this run and the mtime they must end with
    dir_times: Vec<(PathBuf, Timestamp)>,
}

impl DownloadSummary {
    /// Jobs that reached a terminal state
    pub fn jobs(&self) -> u64 {
        self.dirs + self.files + self.failed.len() as u64
    }

    fn merge(&mut self, other: DownloadSummary) {
        self.dirs += other.dirs;
        self.files += other.files;
        self.bytes += other.bytes;
        self.failed.extend(other.failed);
        self.dir_times.extend(other.dir_times);
    }
}

struct WorkerContext {
    client: Client,
    dest: PathBuf,
    options: DownloadOptions,
    progress: Arc<dyn ProgressObserver>,
}

/// Worker pool plus the queue feeding it
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
    workers: JoinSet<DownloadSummary>,
}

impl Dispatcher {
    /// Spawn `options.workers` workers (at least one) writing under `dest`
    pub fn start(
        client: Client,
        dest: &Path,
        options: DownloadOptions,
        progress: Arc<dyn ProgressObserver>,
    ) -> Self {
        // tokio has no zero-capacity channel; one job may wait in the slot
        // while every worker is busy, and the push after it suspends.
        let (tx, rx) = mpsc::channel::<Job>(1);
        let queue = Arc::new(Mutex::new(rx));
        let count = options.workers.max(1);
        let ctx = Arc::new(WorkerContext {
            client,
            dest: dest.to_path_buf(),
            options,
            progress,
        });
        let mut workers = JoinSet::new();
        for id in 0..count {
            workers.spawn(worker_loop(id, Arc::clone(&queue), Arc::clone(&ctx)));
        }
        Self { tx, workers }
    }

    /// Queue one entry, suspending while every worker is busy
    pub async fn dispatch(&self, entry: DirEntry) -> Result<()> {
        self.tx
            .send(Job { entry })
            .await
            .map_err(|e| anyhow!("{}: no worker left to take the job", e.0.entry.name))
    }

    /// Close the queue, let the workers drain it, and wait for all of them
    pub async fn finish(self) -> DownloadSummary {
        let Dispatcher { tx, mut workers } = self;
        drop(tx);
        let mut summary = DownloadSummary::default();
        while let Some(res) = workers.join_next().await {
            match res {
                Ok(s) => summary.merge(s),
                Err(e) => warn!("worker task failed: {}", e),
            }
        }
        // Files written into a directory after its job bumped its mtime
        restore_directory_times(std::mem::take(&mut summary.dir_times));
        summary
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    ctx: Arc<WorkerContext>,
) -> DownloadSummary {
    let mut stats = DownloadSummary::default();
    loop {
        let job = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };
        match ctx.run(&job.entry).await {
            Ok(JobOutcome::Directory { path, mod_time }) => {
                stats.dirs += 1;
                stats.dir_times.push((path, mod_time));
            }
            Ok(JobOutcome::File { bytes }) => {
                stats.files += 1;
                stats.bytes += bytes;
            }
            Err(e) => {
                warn!(path = %job.entry.name, "{:#}", e);
                stats.failed.push(job.entry.name);
            }
        }
    }
    debug!(worker = id, jobs = stats.jobs(), "worker done");
    stats
}

impl WorkerContext {
    async fn run(&self, entry: &DirEntry) -> Result<JobOutcome> {
        let dest = self.dest.join(relative_path(&entry.name)?);
        if entry.is_dir() {
            create_directory(&dest, entry, self.options.apply_permissions).await?;
            return Ok(JobOutcome::Directory {
                path: dest,
                mod_time: entry.mod_time,
            });
        }
        let bytes = self.download_file(entry, &dest).await?;
        for failure in apply_file_metadata(&dest, entry, &self.options) {
            warn!(path = %entry.name, "{}: {}", failure.step, failure.error);
        }
        Ok(JobOutcome::File { bytes })
    }

    async fn download_file(&self, entry: &DirEntry, dest: &Path) -> Result<u64> {
        let mut stream = self
            .client
            .download(&entry.name)
            .await
            .context("download")?;
        // The directory job for the parent may still be running on another worker
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("mkdir {}", parent.display()))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create {}", dest.display()))?;

        self.progress.on_job_start(&entry.name, entry.size.max(0) as u64);
        let copied = self.copy_stream(&entry.name, &mut stream, &mut file).await;
        self.progress.on_job_end(&entry.name, copied.is_ok());

        // Partial files stay on disk; only wait for queued writes to land
        let flushed = file.flush().await;
        drop(file);
        let bytes = copied?;
        flushed.context("write")?;
        Ok(bytes)
    }

    async fn copy_stream(
        &self,
        name: &str,
        stream: &mut RemoteStream<DownloadChunk>,
        file: &mut tokio::fs::File,
    ) -> Result<u64> {
        let mut written = 0u64;
        while let Some(chunk) = stream.message().await? {
            file.write_all(&chunk.data).await.context("write")?;
            let n = chunk.data.len() as u64;
            written += n;
            self.progress.on_bytes(name, n);
        }
        Ok(written)
    }
}

/// Create `path` and any missing parents, then set its mode and modification time.
/// An existing directory is not an error; its mode is still brought in line.
pub async fn create_directory(path: &Path, entry: &DirEntry, apply_permissions: bool) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    if apply_permissions {
        builder.mode(entry.permissions());
    }
    builder.create(path).await.context("mkdir")?;
    if apply_permissions {
        set_mode(path, entry.permissions()).context("chmod")?;
    }
    set_times(path, entry.mod_time).context("chtimes")?;
    Ok(())
}

/// Set each directory's mtime again, deepest paths first
fn restore_directory_times(mut dirs: Vec<(PathBuf, Timestamp)>) {
    dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, t) in dirs {
        if let Err(e) = set_times(&path, t) {
            warn!(path = %path.display(), "chtimes: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataStep {
    Permissions,
    Times,
}

impl std::fmt::Display for MetadataStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataStep::Permissions => f.write_str("chmod"),
            MetadataStep::Times => f.write_str("chtimes"),
        }
    }
}

#[derive(Debug)]
pub struct MetadataFailure {
    pub step: MetadataStep,
    pub error: io::Error,
}

/// Apply permission bits (if enabled) and modification time to a downloaded file.
/// Failures are returned for logging; they never fail the job.
pub fn apply_file_metadata(path: &Path, entry: &DirEntry, options: &DownloadOptions) -> Vec<MetadataFailure> {
    let mut failures = Vec::new();
    if options.apply_permissions {
        if let Err(error) = set_mode(path, entry.permissions()) {
            failures.push(MetadataFailure {
                step: MetadataStep::Permissions,
                error,
            });
            if options.on_permission_failure == PermissionFailure::SkipTimes {
                return failures;
            }
        }
    }
    if let Err(error) = set_times(path, entry.mod_time) {
        failures.push(MetadataFailure {
            step: MetadataStep::Times,
            error,
        });
    }
    failures
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    std::fs::set_permissions(path, perms)
}

fn set_times(path: &Path, t: Timestamp) -> io::Result<()> {
    let ft = FileTime::from_unix_time(t.seconds, t.nanos.clamp(0, 999_999_999) as u32);
    filetime::set_file_times(path, ft, ft)
}

/// Enumerate the server tree and download all of it under `dest`.
///
/// Failing to start the listing is an error. A listing stream that breaks
/// part-way is logged and recorded in the summary; jobs already queued still
/// run to completion.
pub async fn download_tree(
    client: &Client,
    dest: &Path,
    options: DownloadOptions,
    progress: Arc<dyn ProgressObserver>,
) -> Result<DownloadSummary> {
    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;
    let mut listing = client.list_files().await.context("ListFiles")?;

    let dispatcher = Dispatcher::start(client.clone(), dest, options, progress);
    let mut listing_error = None;
    loop {
        match listing.message().await {
            Ok(Some(entry)) => {
                if let Err(e) = dispatcher.dispatch(entry).await {
                    listing_error = Some(format!("{:#}", e));
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("listing aborted: {:#}", e);
                listing_error = Some(format!("{:#}", e));
                break;
            }
        }
    }
    let mut summary = dispatcher.finish().await;
    summary.listing_error = listing_error;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MODE_DIR;
    use std::fs;
    use tempfile::TempDir;

    fn entry(name: &str, mode: u32, seconds: i64) -> DirEntry {
        DirEntry {
            name: name.into(),
            size: 0,
            mode,
            mod_time: Timestamp { seconds, nanos: 0 },
        }
    }

    fn mtime_secs(p: &Path) -> i64 {
        FileTime::from_last_modification_time(&fs::metadata(p).unwrap()).unix_seconds()
    }

    #[tokio::test]
    async fn test_create_directory_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let e = entry("a/b", MODE_DIR | 0o755, 1_600_000_000);
        let path = tmp.path().join("a/b");
        create_directory(&path, &e, true).await.unwrap();
        create_directory(&path, &e, true).await.unwrap();
        assert!(path.is_dir());
        assert_eq!(mtime_secs(&path), 1_600_000_000);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o755);
        }
    }

    #[test]
    fn test_apply_file_metadata_success() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("f");
        fs::write(&p, b"x").unwrap();
        let e = entry("f", 0o640, 1_500_000_000);
        let failures = apply_file_metadata(&p, &e, &DownloadOptions::default());
        assert!(failures.is_empty());
        assert_eq!(mtime_secs(&p), 1_500_000_000);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&p).unwrap().permissions().mode() & 0o777, 0o640);
        }
    }

    #[test]
    fn test_permission_failure_continue_still_sets_times() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("gone");
        let e = entry("gone", 0o644, 1);
        let options = DownloadOptions {
            apply_permissions: true,
            on_permission_failure: PermissionFailure::Continue,
            ..DownloadOptions::default()
        };
        let steps: Vec<MetadataStep> = apply_file_metadata(&missing, &e, &options)
            .into_iter()
            .map(|f| f.step)
            .collect();
        assert_eq!(steps, vec![MetadataStep::Permissions, MetadataStep::Times]);
    }

    #[test]
    fn test_permission_failure_skip_times() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("gone");
        let e = entry("gone", 0o644, 1);
        let options = DownloadOptions {
            apply_permissions: true,
            on_permission_failure: PermissionFailure::SkipTimes,
            ..DownloadOptions::default()
        };
        let steps: Vec<MetadataStep> = apply_file_metadata(&missing, &e, &options)
            .into_iter()
            .map(|f| f.step)
            .collect();
        assert_eq!(steps, vec![MetadataStep::Permissions]);
    }

    #[test]
    fn test_permissions_disabled_skips_chmod() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("f");
        fs::write(&p, b"x").unwrap();
        let before = fs::metadata(&p).unwrap().permissions();
        let options = DownloadOptions {
            apply_permissions: false,
            ..DownloadOptions::default()
        };
        let failures = apply_file_metadata(&p, &entry("f", 0o600, 42), &options);
        assert!(failures.is_empty());
        assert_eq!(fs::metadata(&p).unwrap().permissions(), before);
        assert_eq!(mtime_secs(&p), 42);
    }

    #[test]
    fn test_restore_directory_times_after_children_written() {
        let tmp = TempDir::new().unwrap();
        let outer = tmp.path().join("a");
        let inner = outer.join("b");
        fs::create_dir_all(&inner).unwrap();
        let t_outer = Timestamp { seconds: 1_400_000_000, nanos: 0 };
        let t_inner = Timestamp { seconds: 1_450_000_000, nanos: 0 };
        set_times(&outer, t_outer).unwrap();
        set_times(&inner, t_inner).unwrap();

        // New children move both mtimes forward
        fs::write(inner.join("late.txt"), b"x").unwrap();
        fs::create_dir(outer.join("c")).unwrap();
        assert_ne!(mtime_secs(&inner), t_inner.seconds);

        restore_directory_times(vec![
            (outer.clone(), t_outer),
            (inner.clone(), t_inner),
            (tmp.path().join("missing"), t_outer),
        ]);
        assert_eq!(mtime_secs(&outer), t_outer.seconds);
        assert_eq!(mtime_secs(&inner), t_inner.seconds);
    }

    #[test]
    fn test_summary_merge() {
        let mut a = DownloadSummary {
            dirs: 1,
            files: 2,
            bytes: 10,
            failed: vec!["x".into()],
            ..DownloadSummary::default()
        };
        a.merge(DownloadSummary {
            dirs: 0,
            files: 1,
            bytes: 5,
            failed: vec!["y".into()],
            ..DownloadSummary::default()
        });
        assert_eq!(a.jobs(), 6);
        assert_eq!(a.bytes, 15);
        assert_eq!(a.failed, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_jobs_not_dispatcher() {
        // Nothing listens on port 1; every file job fails, directories still work
        let tmp = TempDir::new().unwrap();
        let client = Client::new("127.0.0.1:1");
        let d = Dispatcher::start(
            client,
            tmp.path(),
            DownloadOptions { workers: 2, ..DownloadOptions::default() },
            Arc::new(crate::progress::NoProgress),
        );
        d.dispatch(entry("dir", MODE_DIR | 0o755, 1)).await.unwrap();
        for i in 0..4 {
            d.dispatch(entry(&format!("dir/f{}", i), 0o644, 1)).await.unwrap();
        }
        let summary = d.finish().await;
        assert_eq!(summary.dirs, 1);
        assert_eq!(summary.files, 0);
        assert_eq!(summary.failed.len(), 4);
        assert!(tmp.path().join("dir").is_dir());
    }

    #[tokio::test]
    async fn test_push_suspends_while_worker_busy_and_slot_full() {
        // Accepts connections and never answers, so a download stalls
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let tmp = TempDir::new().unwrap();
        let token = tokio_util::sync::CancellationToken::new();
        let client = Client::new(addr).with_cancellation(token.clone());
        let d = Dispatcher::start(
            client,
            tmp.path(),
            DownloadOptions { workers: 1, ..DownloadOptions::default() },
            Arc::new(crate::progress::NoProgress),
        );

        d.dispatch(entry("one", 0o644, 1)).await.unwrap();
        // Completes once the worker has claimed "one"; "two" then sits in the slot
        d.dispatch(entry("two", 0o644, 1)).await.unwrap();
        let third = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            d.dispatch(entry("three", 0o644, 1)),
        )
        .await;
        assert!(third.is_err(), "push should suspend with the worker busy and the slot taken");

        token.cancel();
        let mut summary = d.finish().await;
        summary.failed.sort();
        assert_eq!(summary.failed, vec!["one", "two"]);
        server.abort();
    }

    #[tokio::test]
    async fn test_traversal_name_never_written() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();
        let d = Dispatcher::start(
            Client::new("127.0.0.1:1"),
            &dest,
            DownloadOptions::default(),
            Arc::new(crate::progress::NoProgress),
        );
        d.dispatch(entry("../escape", MODE_DIR | 0o755, 1)).await.unwrap();
        let summary = d.finish().await;
        assert_eq!(summary.failed, vec!["../escape"]);
        assert!(!tmp.path().join("escape").exists());
    }
}
