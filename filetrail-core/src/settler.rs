//! Per-path debounce timers.
//!
//! Every changed path gets its own cancellable timer of the configured
//! settle duration. A new event for the path resets the timer, coalescing
//! bursts into a single downstream hash; a deletion cancels it and is
//! forwarded immediately. Paths settle fully independently — the pending
//! map is owned by a single actor task, and the timers themselves run
//! concurrently, so there is no cross-path blocking and no lock around the
//! map at all.
//!
//! Files whose entire lifetime is shorter than the settle duration are
//! created and deleted without their timer ever firing, which is what keeps
//! transient files out of the history.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use filetrail_model::{ChangeEvent, ChangeKind};

use crate::error::{Result, TrailError};
use crate::hasher::HashTask;

#[derive(Debug, Clone)]
pub struct SettlerConfig {
    /// Quiet period a path must survive untouched before it is hashed.
    pub settle: Duration,
}

enum Msg {
    Observe(ChangeEvent),
    Resubmit { path: PathBuf, attempts: u32 },
    Fired { path: PathBuf, generation: u64 },
}

/// Cloneable submission side of the settler.
#[derive(Debug, Clone)]
pub struct SettlerHandle {
    tx: mpsc::Sender<Msg>,
}

impl SettlerHandle {
    /// Feed one change event into the debounce stage.
    pub async fn observe(&self, event: ChangeEvent) -> Result<()> {
        self.tx
            .send(Msg::Observe(event))
            .await
            .map_err(|_| TrailError::Cancelled("settler stopped".into()))
    }

    /// Re-queue a path after a transient hashing failure, preserving the
    /// attempt count so the retry budget keeps shrinking.
    ///
    /// Non-blocking: hashing workers must never wait on their own
    /// downstream. Under extreme backlog the retry is dropped and the next
    /// crawl picks the path up again.
    pub fn resubmit(&self, path: PathBuf, attempts: u32) -> Result<()> {
        self.tx
            .try_send(Msg::Resubmit { path, attempts })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    TrailError::Internal("settler backlog full, retry dropped".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    TrailError::Cancelled("settler stopped".into())
                }
            })
    }
}

struct Pending {
    generation: u64,
    attempts: u32,
    timer: JoinHandle<()>,
}

/// The debounce stage between change detection and hashing.
pub struct Settler {
    handle: SettlerHandle,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Settler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settler")
            .field("task_finished", &self.task.is_finished())
            .finish()
    }
}

impl Settler {
    pub fn spawn(
        config: SettlerConfig,
        output: mpsc::Sender<HashTask>,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let timer_tx = tx.clone();
        let task =
            tokio::spawn(run(config, rx, timer_tx, output, shutdown));
        Self {
            handle: SettlerHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> SettlerHandle {
        self.handle.clone()
    }

    /// Wait for the actor to wind down after cancellation.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn run(
    config: SettlerConfig,
    mut rx: mpsc::Receiver<Msg>,
    timer_tx: mpsc::Sender<Msg>,
    output: mpsc::Sender<HashTask>,
    shutdown: CancellationToken,
) {
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();
    let mut next_generation: u64 = 0;

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match msg {
            Msg::Observe(event) => match event.kind {
                ChangeKind::Deleted => {
                    // No need to wait out a deletion.
                    if let Some(entry) = pending.remove(&event.path) {
                        entry.timer.abort();
                        trace!(
                            path = %event.path.display(),
                            "pending timer cancelled by deletion"
                        );
                    }
                    if output
                        .send(HashTask::delete(event.path))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                ChangeKind::Created | ChangeKind::Modified => {
                    schedule(
                        &mut pending,
                        &mut next_generation,
                        &config,
                        &timer_tx,
                        event.path,
                        0,
                    );
                }
                // The updater splits moves and handles overflow before the
                // settler; seeing either here means a plumbing bug upstream,
                // but treating the new path as created keeps us correct.
                ChangeKind::Moved => {
                    schedule(
                        &mut pending,
                        &mut next_generation,
                        &config,
                        &timer_tx,
                        event.path,
                        0,
                    );
                }
                ChangeKind::Overflow => {
                    debug!(root = %event.root.display(), "overflow event ignored by settler");
                }
            },
            Msg::Resubmit { path, attempts } => {
                schedule(
                    &mut pending,
                    &mut next_generation,
                    &config,
                    &timer_tx,
                    path,
                    attempts,
                );
            }
            Msg::Fired { path, generation } => {
                // A reset timer leaves a stale generation behind; only the
                // latest one may forward the path.
                let current = pending.get(&path).map(|entry| entry.generation);
                if current == Some(generation) {
                    let entry = pending.remove(&path).expect("checked above");
                    if output
                        .send(HashTask::hash(path, entry.attempts))
                        .await
                        .is_err()
                    {
                        break;
                    }
                } else {
                    trace!(path = %path.display(), "stale settle timer ignored");
                }
            }
        }
    }

    for (_, entry) in pending {
        entry.timer.abort();
    }
}

fn schedule(
    pending: &mut HashMap<PathBuf, Pending>,
    next_generation: &mut u64,
    config: &SettlerConfig,
    timer_tx: &mpsc::Sender<Msg>,
    path: PathBuf,
    attempts: u32,
) {
    *next_generation += 1;
    let generation = *next_generation;

    let settle = config.settle;
    let tx = timer_tx.clone();
    let timer_path = path.clone();
    let timer = tokio::spawn(async move {
        sleep(settle).await;
        let _ = tx
            .send(Msg::Fired {
                path: timer_path,
                generation,
            })
            .await;
    });

    if let Some(previous) = pending.insert(
        path,
        Pending {
            generation,
            attempts,
            timer,
        },
    ) {
        previous.timer.abort();
    }
}
