//! Write-side composition and lifecycle.
//!
//! The updater wires watcher, crawler, settler, hasher pool, and store
//! into the ingestion pipeline and owns its lifecycle. Startup runs a full
//! crawl of every root (through the same overflow path used at runtime);
//! the live loop then routes change events into the settler, splits moves,
//! expands newly created directories into scoped crawls, and answers
//! overflow with a re-crawl of the affected root. Shutdown drains in-flight
//! hashing but abandons pending settle timers — those paths are simply
//! uncommitted and the next startup crawl reconciles them.

use std::collections::HashSet;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use filetrail_config::Settings;
use filetrail_model::{ChangeEvent, ChangeKind, WatchRoot};

use crate::crawler::Crawler;
use crate::error::Result;
use crate::hasher::{HasherPool, HasherPoolConfig};
use crate::settler::{Settler, SettlerConfig, SettlerHandle};
use crate::store::HistoryStore;
use crate::watcher::Watcher;

/// Shared queue between producers (watcher, crawler) and the event loop.
const EVENT_CHANNEL_CAPACITY: usize = 2048;
/// Queue of settled paths awaiting a hashing worker.
const TASK_CHANNEL_CAPACITY: usize = 1024;

/// The long-running write side: composes change detection, debouncing,
/// hashing, and the history store.
pub struct Updater {
    store: HistoryStore,
    watcher: Watcher,
    settler: Settler,
    pool: HasherPool,
    event_loop: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("watcher", &self.watcher)
            .field("event_loop_finished", &self.event_loop.is_finished())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Updater {
    /// Open the store, start every stage, and schedule the startup crawl
    /// of each configured root.
    pub async fn start(settings: Settings) -> Result<Self> {
        let store = HistoryStore::open(&settings.store_dir).await?;
        let shutdown = CancellationToken::new();

        let (event_tx, event_rx) =
            mpsc::channel::<ChangeEvent>(EVENT_CHANNEL_CAPACITY);
        let (task_tx, task_rx) = mpsc::channel(TASK_CHANNEL_CAPACITY);

        let settler = Settler::spawn(
            SettlerConfig {
                settle: settings.settle,
            },
            task_tx,
            shutdown.child_token(),
        );

        let pool = HasherPool::spawn(
            HasherPoolConfig {
                workers: settings.hasher_workers,
                retry_budget: settings.retry_budget,
                algorithm: settings.algorithm,
            },
            store.clone(),
            task_rx,
            settler.handle(),
            shutdown.child_token(),
        );

        // Watch before crawling so nothing slips between the two.
        let watcher = match Watcher::spawn(settings.roots.clone(), event_tx.clone()).await
        {
            Ok(watcher) => watcher,
            Err(err) => {
                shutdown.cancel();
                settler.join().await;
                pool.join().await;
                store.close().await;
                return Err(err);
            }
        };
        let crawler = Crawler::new(store.clone(), event_tx.clone());

        let event_loop = tokio::spawn(run_event_loop(
            settings.roots.clone(),
            crawler,
            settler.handle(),
            event_rx,
            shutdown.child_token(),
        ));

        // The startup crawl rides the same path as overflow recovery.
        for root in &settings.roots {
            if event_tx
                .send(ChangeEvent::overflow(root.path.clone()))
                .await
                .is_err()
            {
                break;
            }
        }

        info!(
            roots = settings.roots.len(),
            workers = settings.hasher_workers,
            algorithm = %settings.algorithm,
            settle_ms = settings.settle.as_millis() as u64,
            "updater started"
        );

        Ok(Self {
            store,
            watcher,
            settler,
            pool,
            event_loop,
            shutdown,
        })
    }

    /// The write-side store handle; read-only consumers should open their
    /// own connection instead.
    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Graceful shutdown: stop producing events, cancel pending settle
    /// timers, drain in-flight hashing, close the pool.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.watcher.shutdown();
        let _ = self.event_loop.await;
        self.settler.join().await;
        self.pool.join().await;
        self.store.close().await;
        info!("updater stopped");
        Ok(())
    }
}

async fn run_event_loop(
    roots: Vec<WatchRoot>,
    crawler: Crawler,
    settler: SettlerHandle,
    mut events: mpsc::Receiver<ChangeEvent>,
    shutdown: CancellationToken,
) {
    // One crawl at a time per scope; a storm of overflow events collapses
    // into a single re-sync.
    let mut crawling: HashSet<PathBuf> = HashSet::new();
    let (crawl_done_tx, mut crawl_done_rx) = mpsc::channel::<PathBuf>(16);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(scope) = crawl_done_rx.recv() => {
                crawling.remove(&scope);
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(
                    &roots,
                    &crawler,
                    &settler,
                    &mut crawling,
                    &crawl_done_tx,
                    event,
                )
                .await;
            }
        }
    }
    debug!("event loop stopped");
}

async fn handle_event(
    roots: &[WatchRoot],
    crawler: &Crawler,
    settler: &SettlerHandle,
    crawling: &mut HashSet<PathBuf>,
    crawl_done: &mpsc::Sender<PathBuf>,
    event: ChangeEvent,
) {
    match event.kind {
        ChangeKind::Overflow => {
            let Some(root) = find_root(roots, &event.root) else {
                warn!(root = %event.root.display(), "overflow for unknown root");
                return;
            };
            schedule_crawl(crawler, crawling, crawl_done, root.clone(), None);
        }
        ChangeKind::Moved => {
            // A move is a deletion at the old path and an appearance at the
            // new one; both sides settle on their own.
            if let Some(old) = event.old_path.clone() {
                let deleted =
                    ChangeEvent::new(event.root.clone(), old, ChangeKind::Deleted);
                if settler.observe(deleted).await.is_err() {
                    return;
                }
            }
            let created = ChangeEvent::new(
                event.root.clone(),
                event.path.clone(),
                ChangeKind::Created,
            );
            route_created(roots, crawler, settler, crawling, crawl_done, created)
                .await;
        }
        ChangeKind::Created | ChangeKind::Modified => {
            route_created(roots, crawler, settler, crawling, crawl_done, event)
                .await;
        }
        ChangeKind::Deleted => {
            let _ = settler.observe(event).await;
        }
    }
}

/// Created/Modified events for directories become scoped crawls — children
/// may have appeared before watch coverage did. Everything else settles.
async fn route_created(
    roots: &[WatchRoot],
    crawler: &Crawler,
    settler: &SettlerHandle,
    crawling: &mut HashSet<PathBuf>,
    crawl_done: &mpsc::Sender<PathBuf>,
    event: ChangeEvent,
) {
    let is_dir = tokio::fs::metadata(&event.path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    if is_dir {
        if let Some(root) = find_root(roots, &event.root) {
            schedule_crawl(
                crawler,
                crawling,
                crawl_done,
                root.clone(),
                Some(event.path),
            );
        }
        return;
    }
    let _ = settler.observe(event).await;
}

fn find_root<'a>(roots: &'a [WatchRoot], root_path: &PathBuf) -> Option<&'a WatchRoot> {
    roots
        .iter()
        .find(|root| &root.path == root_path)
        .or_else(|| roots.iter().find(|root| root_path.starts_with(&root.path)))
}

fn schedule_crawl(
    crawler: &Crawler,
    crawling: &mut HashSet<PathBuf>,
    crawl_done: &mpsc::Sender<PathBuf>,
    root: WatchRoot,
    scope: Option<PathBuf>,
) {
    let scope_key = scope.clone().unwrap_or_else(|| root.path.clone());
    if !crawling.insert(scope_key.clone()) {
        debug!(scope = %scope_key.display(), "crawl already running, skipping");
        return;
    }

    let crawler = crawler.clone();
    let done = crawl_done.clone();
    tokio::spawn(async move {
        let result = match &scope {
            Some(dir) => crawler.crawl_dir(&root, dir).await,
            None => crawler.crawl_root(&root).await,
        };
        if let Err(err) = result {
            error!(
                scope = %scope_key.display(),
                error = %err,
                "crawl failed"
            );
        }
        let _ = done.send(scope_key).await;
    });
}
