//! Live filesystem watching.
//!
//! A thin wrapper around `notify` that normalizes raw notifications into
//! [`ChangeEvent`]s for the ingestion pipeline. Ignore filtering happens
//! before emission. Overflow conditions — the backend dropping events, a
//! watcher error, or our own queue filling during a change storm — are
//! surfaced explicitly as [`ChangeKind::Overflow`] events so the updater
//! can fall back to a full re-crawl of the affected root; no partial repair
//! is attempted, since missed events silently desynchronize state.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};

use notify::event::{EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{
    Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode,
    Watcher as NotifyWatcher,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, spawn_blocking};
use tracing::{debug, warn};

use filetrail_model::{ChangeEvent, ChangeKind, WatchRoot};

use crate::error::{Result, TrailError};

/// Capacity of the raw notification channel between the `notify` callback
/// and the normalization loop.
const RAW_CHANNEL_CAPACITY: usize = 4096;

enum WatchMessage {
    Event(Event),
    Error(String),
}

/// Watches the configured roots and feeds normalized events into the
/// shared pipeline channel.
pub struct Watcher {
    backends: Vec<RecommendedWatcher>,
    forward_task: JoinHandle<()>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("backend_count", &self.backends.len())
            .field("forward_task_finished", &self.forward_task.is_finished())
            .finish()
    }
}

impl Watcher {
    /// Register recursive watches over every root and start forwarding.
    /// Newly created subdirectories are covered by the recursive backend;
    /// their creation events additionally prompt the updater to run a
    /// scoped crawl, catching children that appeared before coverage.
    pub async fn spawn(
        roots: Vec<WatchRoot>,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<WatchMessage>(RAW_CHANNEL_CAPACITY);

        let root_paths: Vec<PathBuf> =
            roots.iter().map(|root| root.path.clone()).collect();
        let backends = spawn_blocking(move || init_watchers(&root_paths, raw_tx))
            .await
            .map_err(|err| {
                TrailError::Internal(format!("watcher initialization panicked: {err}"))
            })??;

        let forward_task = tokio::spawn(forward_loop(roots, raw_rx, events));

        Ok(Self {
            backends,
            forward_task,
        })
    }

    /// Stop watching. Dropping the backends stops the notify streams; the
    /// forwarding loop then drains and exits on its own.
    pub fn shutdown(self) {
        drop(self.backends);
        self.forward_task.abort();
    }
}

fn init_watchers(
    roots: &[PathBuf],
    raw_tx: mpsc::Sender<WatchMessage>,
) -> Result<Vec<RecommendedWatcher>> {
    let mut backends = Vec::with_capacity(roots.len());
    for root in roots {
        let path_clone = root.clone();
        let tx_event = raw_tx.clone();
        let mut backend = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let Err(err) = tx_event.blocking_send(WatchMessage::Event(event))
                    {
                        warn!(
                            root = %path_clone.display(),
                            error = %err,
                            "watch channel send failed"
                        );
                    }
                }
                Err(err) => {
                    let _ = tx_event.blocking_send(WatchMessage::Error(err.to_string()));
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|err| {
            TrailError::Internal(format!(
                "failed to create watcher for {}: {err}",
                root.display()
            ))
        })?;

        backend
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| {
                TrailError::Internal(format!(
                    "failed to watch {}: {err}",
                    root.display()
                ))
            })?;

        backends.push(backend);
    }
    Ok(backends)
}

async fn forward_loop(
    roots: Vec<WatchRoot>,
    mut raw_rx: mpsc::Receiver<WatchMessage>,
    events: mpsc::Sender<ChangeEvent>,
) {
    while let Some(msg) = raw_rx.recv().await {
        match msg {
            WatchMessage::Event(event) => {
                for change in convert_event(&roots, event) {
                    let root = change.root.clone();
                    match events.try_send(change) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            // Change storm: stop queueing individual events
                            // and escalate to a re-crawl of this root.
                            debug!(
                                root = %root.display(),
                                "event queue full, escalating to overflow"
                            );
                            if events.send(ChangeEvent::overflow(root)).await.is_err() {
                                return;
                            }
                        }
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
            }
            WatchMessage::Error(error) => {
                warn!(error = %error, "watch backend error, scheduling re-sync");
                for root in &roots {
                    if events
                        .send(ChangeEvent::overflow(root.path.clone()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
}

/// Normalize one raw notification into pipeline events, applying ignore
/// filtering. Returns an empty list for events outside every root or
/// matched by ignore rules.
fn convert_event(roots: &[WatchRoot], event: Event) -> Vec<ChangeEvent> {
    let Some(root) = locate_root(&event, roots) else {
        return Vec::new();
    };

    if event.need_rescan() {
        return vec![ChangeEvent::overflow(root.path.clone())];
    }

    let mut out = VecDeque::new();
    match classify_event(&event.kind) {
        Classified::Overflow => {
            out.push_back(ChangeEvent::overflow(root.path.clone()));
        }
        Classified::Rename(mode) => {
            let mut paths = event.paths.iter();
            match mode {
                RenameMode::Both => {
                    let old = paths.next().and_then(|p| sanitize_path(&root.path, p));
                    let new = paths.next().and_then(|p| sanitize_path(&root.path, p));
                    match (old, new) {
                        (Some(old), Some(new)) => out.push_back(ChangeEvent::moved(
                            root.path.clone(),
                            old,
                            new,
                        )),
                        (Some(old), None) => out.push_back(ChangeEvent::new(
                            root.path.clone(),
                            old,
                            ChangeKind::Deleted,
                        )),
                        (None, Some(new)) => out.push_back(ChangeEvent::new(
                            root.path.clone(),
                            new,
                            ChangeKind::Created,
                        )),
                        (None, None) => {}
                    }
                }
                // Unpaired halves of a rename: the vanished side is a
                // deletion, the appeared side a creation.
                RenameMode::From => {
                    if let Some(old) =
                        paths.next().and_then(|p| sanitize_path(&root.path, p))
                    {
                        out.push_back(ChangeEvent::new(
                            root.path.clone(),
                            old,
                            ChangeKind::Deleted,
                        ));
                    }
                }
                _ => {
                    if let Some(new) =
                        paths.next().and_then(|p| sanitize_path(&root.path, p))
                    {
                        out.push_back(ChangeEvent::new(
                            root.path.clone(),
                            new,
                            ChangeKind::Created,
                        ));
                    }
                }
            }
        }
        Classified::Kind(kind) => {
            for path in &event.paths {
                if let Some(clean) = sanitize_path(&root.path, path) {
                    out.push_back(ChangeEvent::new(root.path.clone(), clean, kind));
                }
            }
        }
    }

    out.into_iter()
        .filter(|change| {
            change.kind == ChangeKind::Overflow
                || !ignored(root, &change.path)
                    && change
                        .old_path
                        .as_ref()
                        .is_none_or(|old| !ignored(root, old))
        })
        .collect()
}

enum Classified {
    Kind(ChangeKind),
    Rename(RenameMode),
    Overflow,
}

fn classify_event(kind: &EventKind) -> Classified {
    match kind {
        EventKind::Create(_) => Classified::Kind(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(mode)) => Classified::Rename(*mode),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Metadata(_)) => {
            Classified::Kind(ChangeKind::Modified)
        }
        EventKind::Remove(RemoveKind::File | RemoveKind::Folder | RemoveKind::Any) => {
            Classified::Kind(ChangeKind::Deleted)
        }
        EventKind::Other => Classified::Overflow,
        _ => Classified::Kind(ChangeKind::Modified),
    }
}

fn ignored(root: &WatchRoot, path: &Path) -> bool {
    root.ignore.skips_file(path) || root.ignore.skips_dir(path)
}

fn locate_root<'a>(event: &Event, roots: &'a [WatchRoot]) -> Option<&'a WatchRoot> {
    let primary = event.paths.first()?;
    roots.iter().find(|root| root.contains(primary))
}

/// Re-anchor `path` under `root`, rejecting escapes and normalizing `.` and
/// `..` components.
fn sanitize_path(root: &Path, path: &Path) -> Option<PathBuf> {
    if !path.starts_with(root) {
        return None;
    }

    let rel = path.strip_prefix(root).ok()?;
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(seg) => clean.push(seg),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return None;
                }
            }
            _ => return None,
        }
    }

    let mut normalized = root.to_path_buf();
    normalized.push(clean);
    Some(normalized)
}
