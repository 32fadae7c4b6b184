//! Content digests and the bounded hashing worker pool.
//!
//! Settled paths arrive on a task channel and are digested by a pool whose
//! concurrency is capped by a semaphore — saturation queues tasks rather
//! than dropping them. File identity (size + mtime) is checked immediately
//! before and after every read: a file that changed mid-read or vanished is
//! a transient failure and goes back through the settler with a shrinking
//! retry budget, never into the store. Per-path commit serialization is
//! guaranteed by an in-flight set; a task for a path already being hashed
//! is parked until the running worker finishes.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256, Sha512};
use tokio::io::AsyncReadExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use filetrail_model::{
    ContentHash, FileRecord, FileState, HashAlgorithm, SymlinkEdge,
};

use crate::error::{Result, TrailError};
use crate::settler::SettlerHandle;
use crate::store::HistoryStore;

/// Read granularity for streaming digests.
const READ_CHUNK: usize = 128 * 1024;

/// What to do with a path that cleared the settle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Hash,
    Delete,
}

/// One unit of work for the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTask {
    pub path: PathBuf,
    /// Transient failures so far; compared against the retry budget.
    pub attempts: u32,
    pub action: TaskAction,
}

impl HashTask {
    pub fn hash(path: PathBuf, attempts: u32) -> Self {
        Self {
            path,
            attempts,
            action: TaskAction::Hash,
        }
    }

    pub fn delete(path: PathBuf) -> Self {
        Self {
            path,
            attempts: 0,
            action: TaskAction::Delete,
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.action == TaskAction::Delete
    }
}

enum Digester {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl Digester {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Digester::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Digester::Sha512(Sha512::new()),
            HashAlgorithm::Blake3 => {
                Digester::Blake3(Box::new(blake3::Hasher::new()))
            }
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Digester::Sha256(hasher) => hasher.update(chunk),
            Digester::Sha512(hasher) => hasher.update(chunk),
            Digester::Blake3(hasher) => {
                hasher.update(chunk);
            }
        }
    }

    fn finalize(self, algorithm: HashAlgorithm) -> ContentHash {
        match self {
            Digester::Sha256(hasher) => {
                ContentHash::from_digest(algorithm, &hasher.finalize())
            }
            Digester::Sha512(hasher) => {
                ContentHash::from_digest(algorithm, &hasher.finalize())
            }
            Digester::Blake3(hasher) => {
                ContentHash::from_digest(algorithm, hasher.finalize().as_bytes())
            }
        }
    }
}

/// Stream `path` through `algorithm` in fixed-size chunks.
pub async fn compute_hash(
    path: &Path,
    algorithm: HashAlgorithm,
) -> Result<ContentHash> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut digester = Digester::new(algorithm);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        digester.update(&buf[..read]);
    }
    Ok(digester.finalize(algorithm))
}

/// Size + mtime (whole seconds), the cheap identity used by the pre-filter
/// and the before/after read check.
pub(crate) fn file_identity(meta: &std::fs::Metadata) -> (u64, i64) {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|modified| {
            modified
                .duration_since(std::time::UNIX_EPOCH)
                .ok()
                .map(|dur| dur.as_secs() as i64)
        })
        .unwrap_or(0);
    (meta.len(), mtime)
}

#[derive(Debug, Clone)]
pub struct HasherPoolConfig {
    pub workers: usize,
    pub retry_budget: u32,
    pub algorithm: HashAlgorithm,
}

/// Bounded pool consuming settled paths and writing commits.
pub struct HasherPool {
    dispatcher: JoinHandle<()>,
}

impl std::fmt::Debug for HasherPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HasherPool")
            .field("dispatcher_finished", &self.dispatcher.is_finished())
            .finish()
    }
}

impl HasherPool {
    pub fn spawn(
        config: HasherPoolConfig,
        store: HistoryStore,
        tasks: mpsc::Receiver<HashTask>,
        settler: SettlerHandle,
        shutdown: CancellationToken,
    ) -> Self {
        let dispatcher =
            tokio::spawn(dispatch(config, store, tasks, settler, shutdown));
        Self { dispatcher }
    }

    /// Wait for the dispatcher to drain in-flight work and exit. Queued
    /// tasks that never started are abandoned; the next startup crawl
    /// reconciles them.
    pub async fn join(self) {
        let _ = self.dispatcher.await;
    }
}

async fn dispatch(
    config: HasherPoolConfig,
    store: HistoryStore,
    mut tasks: mpsc::Receiver<HashTask>,
    settler: SettlerHandle,
    shutdown: CancellationToken,
) {
    let workers = config.workers.max(1);
    let permits = Arc::new(Semaphore::new(workers));
    let (done_tx, mut done_rx) = mpsc::channel::<PathBuf>(workers * 2);
    let mut in_flight: HashSet<PathBuf> = HashSet::new();
    let mut deferred: HashMap<PathBuf, HashTask> = HashMap::new();

    loop {
        let task = tokio::select! {
            biased;
            Some(path) = done_rx.recv() => {
                in_flight.remove(&path);
                match deferred.remove(&path) {
                    Some(task) => task,
                    None => continue,
                }
            }
            _ = shutdown.cancelled() => break,
            task = tasks.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        if in_flight.contains(&task.path) {
            // Another worker still owns this path; park the task until it
            // finishes so the same path is never committed concurrently.
            // Latest wins: a deletion arriving behind a pending hash
            // supersedes it.
            trace!(path = %task.path.display(), "path in flight, deferring");
            deferred.insert(task.path.clone(), task);
            continue;
        }

        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        in_flight.insert(task.path.clone());
        let worker_store = store.clone();
        let worker_settler = settler.clone();
        let worker_config = config.clone();
        let worker_done = done_tx.clone();
        tokio::spawn(async move {
            let path = task.path.clone();
            run_task(task, worker_store, worker_settler, worker_config).await;
            let _ = worker_done.send(path).await;
            drop(permit);
        });
    }

    // Drain in-flight hashing: take every permit back before returning.
    let _ = permits.acquire_many(workers as u32).await;
    debug!("hasher pool drained");
}

async fn run_task(
    task: HashTask,
    store: HistoryStore,
    settler: SettlerHandle,
    config: HasherPoolConfig,
) {
    let outcome = match task.action {
        TaskAction::Hash => hash_one(&task, &store, &config).await,
        TaskAction::Delete => delete_one(&task.path, &store).await,
    };

    match outcome {
        Ok(()) => {}
        Err(TaskFailure::Transient(reason)) => {
            let attempts = task.attempts + 1;
            if attempts > config.retry_budget {
                let vanished = matches!(
                    tokio::fs::symlink_metadata(&task.path).await,
                    Err(ref err) if err.kind() == ErrorKind::NotFound
                );
                if vanished {
                    // The deletion event retires the mapping; an errored
                    // record for a gone path would only confuse operators.
                    debug!(path = %task.path.display(), "path vanished, dropping retries");
                    return;
                }
                warn!(
                    path = %task.path.display(),
                    attempts,
                    reason = %reason,
                    "retry budget exhausted, marking path errored"
                );
                mark_errored(&store, &task.path, attempts).await;
            } else {
                debug!(
                    path = %task.path.display(),
                    attempts,
                    reason = %reason,
                    "transient hash failure, re-settling"
                );
                if let Err(err) = settler.resubmit(task.path, attempts) {
                    warn!(error = %err, "retry not queued");
                }
            }
        }
        Err(TaskFailure::Denied) => {
            warn!(path = %task.path.display(), "permission denied, marking path errored");
            mark_errored(&store, &task.path, task.attempts).await;
        }
        Err(TaskFailure::Fatal(err)) => {
            error!(path = %task.path.display(), error = %err, "hash task failed");
        }
    }
}

enum TaskFailure {
    /// Worth retrying after another settle window.
    Transient(String),
    /// Unreadable until an operator or a re-crawl intervenes.
    Denied,
    Fatal(TrailError),
}

impl From<TrailError> for TaskFailure {
    fn from(err: TrailError) -> Self {
        TaskFailure::Fatal(err)
    }
}

async fn hash_one(
    task: &HashTask,
    store: &HistoryStore,
    config: &HasherPoolConfig,
) -> std::result::Result<(), TaskFailure> {
    let path = &task.path;

    let pre = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) => return Err(classify_io(err)),
    };

    if pre.file_type().is_symlink() {
        // The path settled as a link: record the edge, retire any file
        // mapping the path used to carry.
        let target = match tokio::fs::read_link(path).await {
            Ok(target) => target,
            Err(err) => return Err(classify_io(err)),
        };
        store
            .upsert_symlink_edge(&SymlinkEdge {
                source: path.clone(),
                target,
            })
            .await?;
        store.commit_deletion(path, Utc::now()).await?;
        store.remove_file_record(path).await?;
        return Ok(());
    }

    if pre.is_dir() {
        return Ok(());
    }

    let identity = file_identity(&pre);

    let hash = match compute_hash(path, config.algorithm).await {
        Ok(hash) => hash,
        Err(TrailError::Io(err)) => return Err(classify_io(err)),
        Err(err) => return Err(err.into()),
    };

    let post = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) => return Err(classify_io(err)),
    };
    if file_identity(&post) != identity {
        return Err(TaskFailure::Transient("file changed during read".into()));
    }

    let observed_at = Utc::now();
    let outcome = store.commit(path, &hash, observed_at).await?;
    store
        .upsert_file_record(&FileRecord {
            path: path.clone(),
            size: identity.0,
            mtime: identity.1,
            state: FileState::Hashed,
            content_hash: Some(hash.clone()),
            attempts: 0,
            last_stable_at: Some(observed_at),
        })
        .await?;

    trace!(
        path = %path.display(),
        hash = %hash,
        ?outcome,
        "hash committed"
    );
    Ok(())
}

async fn delete_one(
    path: &Path,
    store: &HistoryStore,
) -> std::result::Result<(), TaskFailure> {
    store.commit_deletion(path, Utc::now()).await?;
    store.remove_file_record(path).await?;
    store.remove_symlink_edge(path).await?;
    Ok(())
}

async fn mark_errored(store: &HistoryStore, path: &Path, attempts: u32) {
    let record = match store.file_record(path).await {
        Ok(Some(existing)) => FileRecord {
            state: FileState::Errored,
            attempts,
            ..existing
        },
        Ok(None) => FileRecord {
            path: path.to_path_buf(),
            size: 0,
            mtime: 0,
            state: FileState::Errored,
            content_hash: None,
            attempts,
            last_stable_at: None,
        },
        Err(err) => {
            error!(path = %path.display(), error = %err, "failed to load record for error marking");
            return;
        }
    };
    if let Err(err) = store.upsert_file_record(&record).await {
        error!(path = %path.display(), error = %err, "failed to mark path errored");
    }
}

fn classify_io(err: std::io::Error) -> TaskFailure {
    match err.kind() {
        ErrorKind::PermissionDenied => TaskFailure::Denied,
        // NotFound included: a vanished file is transient here — if it is
        // really gone, the deletion event retires the mapping.
        _ => TaskFailure::Transient(err.to_string()),
    }
}
