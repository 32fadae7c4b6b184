//! End-to-end ingestion properties over real temporary trees: startup
//! crawls, debounce coalescing, temp-file suppression, deletion lifecycle,
//! restart idempotence, and symlink-aware queries.
#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use filetrail_config::Settings;
use filetrail_core::compute_hash;
use filetrail_core::query::{PathLookup, QueryService};
use filetrail_core::store::{CurrentEntry, HistoryStore};
use filetrail_core::updater::Updater;
use filetrail_model::{ContentHash, HashAlgorithm, IgnoreRules, WatchRoot};

const SETTLE: Duration = Duration::from_millis(300);

fn settings(data: &Path, store: &Path) -> Settings {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Settings {
        roots: vec![WatchRoot::new(data.to_path_buf())],
        store_dir: store.to_path_buf(),
        settle: SETTLE,
        algorithm: HashAlgorithm::Sha256,
        hasher_workers: 2,
        retry_budget: 3,
    }
}

async fn eventually(mut check: impl AsyncFnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn current_hash(store: &HistoryStore, path: &Path) -> Option<ContentHash> {
    let result = store
        .current_lookup(std::slice::from_ref(&path.to_path_buf()))
        .await
        .unwrap();
    match result.into_values().next() {
        Some(CurrentEntry::Hash(hash)) => Some(hash),
        _ => None,
    }
}

async fn is_deleted(store: &HistoryStore, path: &Path) -> bool {
    let result = store
        .current_lookup(std::slice::from_ref(&path.to_path_buf()))
        .await
        .unwrap();
    matches!(result.into_values().next(), Some(CurrentEntry::Deleted))
}

#[tokio::test]
async fn startup_crawl_ingests_existing_tree() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let a = data.path().join("a.txt");
    let b = data.path().join("nested/b.txt");
    std::fs::create_dir_all(b.parent().unwrap()).unwrap();
    std::fs::write(&a, b"alpha").unwrap();
    std::fs::write(&b, b"beta").unwrap();

    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();

    assert!(
        eventually(async || {
            current_hash(&store, &a).await.is_some()
                && current_hash(&store, &b).await.is_some()
        })
        .await,
        "both pre-existing files should be hashed"
    );

    let expected = compute_hash(&a, HashAlgorithm::Sha256).await.unwrap();
    assert_eq!(current_hash(&store, &a).await, Some(expected));

    updater.shutdown().await.unwrap();
}

#[tokio::test]
async fn rapid_overwrites_coalesce_into_one_commit() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();

    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();

    // Three rewrites inside half a settle window each, then quiet.
    let target = data.path().join("burst.txt");
    for content in [b"v1".as_slice(), b"v2", b"v3"] {
        std::fs::write(&target, content).unwrap();
        tokio::time::sleep(SETTLE / 2).await;
    }

    assert!(
        eventually(async || current_hash(&store, &target).await.is_some()).await,
        "the burst should settle into a commit"
    );
    // Give any stray extra commit time to land before counting.
    tokio::time::sleep(SETTLE * 3).await;

    let history = store.history(&target).await.unwrap();
    assert_eq!(history.len(), 1, "bursts must coalesce into a single commit");
    let expected = compute_hash(&target, HashAlgorithm::Sha256).await.unwrap();
    assert_eq!(history[0].content_hash, Some(expected));

    updater.shutdown().await.unwrap();
}

#[tokio::test]
async fn short_lived_files_never_reach_history() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();

    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();

    let transient = data.path().join("scratch.tmp");
    std::fs::write(&transient, b"gone in a blink").unwrap();
    tokio::time::sleep(SETTLE / 3).await;
    std::fs::remove_file(&transient).unwrap();

    tokio::time::sleep(SETTLE * 4).await;
    assert!(
        store.history(&transient).await.unwrap().is_empty(),
        "a file living shorter than the settle window must never be hashed"
    );

    updater.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_over_unchanged_tree_commits_nothing() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let a = data.path().join("a.txt");
    let b = data.path().join("b.txt");
    std::fs::write(&a, b"stable alpha").unwrap();
    std::fs::write(&b, b"stable beta").unwrap();

    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();
    assert!(
        eventually(async || {
            current_hash(&store, &a).await.is_some()
                && current_hash(&store, &b).await.is_some()
        })
        .await
    );
    updater.shutdown().await.unwrap();

    // Second run over the identical tree: the metadata pre-filter and the
    // idempotent commit must keep history untouched.
    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();
    tokio::time::sleep(SETTLE * 4).await;

    assert_eq!(store.history(&a).await.unwrap().len(), 1);
    assert_eq!(store.history(&b).await.unwrap().len(), 1);

    updater.shutdown().await.unwrap();
}

#[tokio::test]
async fn deletion_closes_the_mapping_and_reverse_lookup_follows() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let a = data.path().join("a.bin");
    let b = data.path().join("b.bin");
    std::fs::write(&a, b"duplicate payload").unwrap();
    std::fs::write(&b, b"duplicate payload").unwrap();

    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();

    assert!(
        eventually(async || {
            current_hash(&store, &a).await.is_some()
                && current_hash(&store, &b).await.is_some()
        })
        .await
    );
    let shared = current_hash(&store, &a).await.unwrap();
    assert_eq!(current_hash(&store, &b).await, Some(shared.clone()));

    let reverse = store.reverse_lookup(&[shared.clone()]).await.unwrap();
    assert_eq!(reverse[&shared].len(), 2);

    std::fs::remove_file(&a).unwrap();
    assert!(
        eventually(async || is_deleted(&store, &a).await).await,
        "deletion should close the mapping"
    );

    let reverse = store.reverse_lookup(&[shared.clone()]).await.unwrap();
    assert_eq!(
        reverse[&shared].iter().collect::<Vec<_>>(),
        vec![&b],
        "reverse lookup must drop the deleted path"
    );

    // History for the deleted path stays contiguous: hash row then
    // sentinel.
    let history = store.history(&a).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].valid_to, Some(history[1].valid_from));
    assert!(history[1].is_deletion());

    updater.shutdown().await.unwrap();
}

#[tokio::test]
async fn moves_retire_the_old_path_and_hash_the_new_one() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let old = data.path().join("before.txt");
    std::fs::write(&old, b"movable feast").unwrap();

    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();
    assert!(eventually(async || current_hash(&store, &old).await.is_some()).await);
    let original = current_hash(&store, &old).await.unwrap();

    let new = data.path().join("after.txt");
    std::fs::rename(&old, &new).unwrap();

    assert!(
        eventually(async || {
            is_deleted(&store, &old).await
                && current_hash(&store, &new).await.is_some()
        })
        .await,
        "a move should retire the old path and map the new one"
    );
    assert_eq!(current_hash(&store, &new).await, Some(original));

    updater.shutdown().await.unwrap();
}

#[tokio::test]
async fn ignored_patterns_suppress_ingestion() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();

    let mut config = settings(data.path(), store_dir.path());
    let ignore =
        IgnoreRules::new(vec![], vec![], &[r"\.tmp$".to_string()]).unwrap();
    config.roots = vec![WatchRoot::new(data.path().to_path_buf()).with_ignore(ignore)];

    let kept = data.path().join("kept.txt");
    let skipped = data.path().join("skipped.tmp");
    std::fs::write(&kept, b"keep me").unwrap();
    std::fs::write(&skipped, b"skip me").unwrap();

    let updater = Updater::start(config).await.unwrap();
    let store = updater.store().clone();

    assert!(eventually(async || current_hash(&store, &kept).await.is_some()).await);
    tokio::time::sleep(SETTLE * 3).await;
    assert!(
        store.history(&skipped).await.unwrap().is_empty(),
        "ignored files must never be hashed"
    );

    updater.shutdown().await.unwrap();
}

#[tokio::test]
async fn symlink_chains_resolve_at_query_time() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let real = data.path().join("real.txt");
    std::fs::write(&real, b"the actual bytes").unwrap();
    let hop = data.path().join("hop");
    let entry = data.path().join("entry");
    std::os::unix::fs::symlink(&real, &hop).unwrap();
    std::os::unix::fs::symlink(&hop, &entry).unwrap();

    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();

    assert!(eventually(async || current_hash(&store, &real).await.is_some()).await);
    let expected = current_hash(&store, &real).await.unwrap();

    let query = QueryService::with_store(
        store.clone(),
        vec![data.path().to_path_buf()],
    );
    let looked_up = query.current(&[entry.clone()]).await.unwrap();
    assert_eq!(
        looked_up[&entry],
        PathLookup::Hash(expected),
        "a link chain should resolve to the terminal file's hash"
    );

    updater.shutdown().await.unwrap();
}

#[tokio::test]
async fn symlink_cycles_fail_per_entry() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let x = data.path().join("x");
    let y = data.path().join("y");
    std::os::unix::fs::symlink(&y, &x).unwrap();
    std::os::unix::fs::symlink(&x, &y).unwrap();
    let plain = data.path().join("plain.txt");
    std::fs::write(&plain, b"healthy").unwrap();

    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();
    assert!(eventually(async || current_hash(&store, &plain).await.is_some()).await);
    assert!(
        eventually(async || {
            store.symlink_target(&x).await.unwrap().is_some()
        })
        .await,
        "the crawl should record the cycle's edges"
    );

    let query = QueryService::with_store(
        store.clone(),
        vec![data.path().to_path_buf()],
    );
    let looked_up = query
        .current(&[x.clone(), plain.clone()])
        .await
        .unwrap();
    assert!(
        matches!(looked_up[&x], PathLookup::Unresolvable(_)),
        "cycles fail fast for the affected entry"
    );
    assert!(
        matches!(looked_up[&plain], PathLookup::Hash(_)),
        "the rest of the batch is unaffected"
    );

    updater.shutdown().await.unwrap();
}

#[tokio::test]
async fn point_in_time_queries_see_superseded_content() {
    let data = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let target = data.path().join("versioned.txt");
    std::fs::write(&target, b"first version").unwrap();

    let updater = Updater::start(settings(data.path(), store_dir.path()))
        .await
        .unwrap();
    let store = updater.store().clone();

    assert!(eventually(async || current_hash(&store, &target).await.is_some()).await);
    let first = current_hash(&store, &target).await.unwrap();

    std::fs::write(&target, b"second version").unwrap();
    assert!(
        eventually(async || {
            current_hash(&store, &target).await.is_some_and(|h| h != first)
        })
        .await,
        "the rewrite should supersede the first mapping"
    );
    let second = current_hash(&store, &target).await.unwrap();

    let history = store.history(&target).await.unwrap();
    assert_eq!(history.len(), 2);
    let boundary = history[1].valid_from;

    let query = QueryService::with_store(
        store.clone(),
        vec![data.path().to_path_buf()],
    );
    let before = query
        .at_time(
            std::slice::from_ref(&target),
            boundary - chrono::TimeDelta::milliseconds(1),
        )
        .await
        .unwrap();
    assert_eq!(before[&target], PathLookup::Hash(first));
    let after = query
        .at_time(std::slice::from_ref(&target), boundary)
        .await
        .unwrap();
    assert_eq!(after[&target], PathLookup::Hash(second));

    updater.shutdown().await.unwrap();
}
