//! History store properties: one open mapping per path, contiguity,
//! idempotent re-commits, deletion sentinels, point-in-time and reverse
//! lookups.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use filetrail_core::store::{CommitOutcome, CurrentEntry, HistoricalEntry, HistoryStore};
use filetrail_model::{ContentHash, FileRecord, FileState, HashAlgorithm, HashMapping, SymlinkEdge};

async fn open_store() -> (tempfile::TempDir, HistoryStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::open(dir.path()).await.unwrap();
    (dir, store)
}

fn hash(byte: u8) -> ContentHash {
    ContentHash::from_digest(HashAlgorithm::Sha256, &[byte; 32])
}

fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

fn assert_contiguous(history: &[HashMapping]) {
    assert!(!history.is_empty());
    for pair in history.windows(2) {
        assert_eq!(
            pair[0].valid_to,
            Some(pair[1].valid_from),
            "gap or overlap between consecutive mappings"
        );
    }
    assert!(history.last().unwrap().is_open());
}

#[tokio::test]
async fn commit_supersedes_contiguously() {
    let (_dir, store) = open_store().await;
    let path = Path::new("/data/a");

    assert_eq!(
        store.commit(path, &hash(1), ts(1_000)).await.unwrap(),
        CommitOutcome::Recorded
    );
    assert_eq!(
        store.commit(path, &hash(2), ts(5_000)).await.unwrap(),
        CommitOutcome::Recorded
    );

    let history = store.history(path).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_contiguous(&history);
    assert_eq!(history[0].content_hash, Some(hash(1)));
    assert_eq!(history[1].content_hash, Some(hash(2)));
    assert_eq!(history[1].valid_from, ts(5_000));
}

#[tokio::test]
async fn recommitting_the_open_hash_is_a_noop() {
    let (_dir, store) = open_store().await;
    let path = Path::new("/data/a");

    store.commit(path, &hash(1), ts(1_000)).await.unwrap();
    assert_eq!(
        store.commit(path, &hash(1), ts(9_000)).await.unwrap(),
        CommitOutcome::Unchanged
    );
    assert_eq!(store.history(path).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deletion_sentinel_and_resurrection() {
    let (_dir, store) = open_store().await;
    let path = PathBuf::from("/data/a");

    store.commit(&path, &hash(1), ts(1_000)).await.unwrap();
    assert_eq!(
        store.commit_deletion(&path, ts(2_000)).await.unwrap(),
        CommitOutcome::Recorded
    );

    let current = store.current_lookup(&[path.clone()]).await.unwrap();
    assert_eq!(current[&path], CurrentEntry::Deleted);

    // Deleting again changes nothing.
    assert_eq!(
        store.commit_deletion(&path, ts(3_000)).await.unwrap(),
        CommitOutcome::Unchanged
    );

    // The path coming back opens a fresh mapping, still contiguous.
    store.commit(&path, &hash(2), ts(4_000)).await.unwrap();
    let history = store.history(&path).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_contiguous(&history);
    let current = store.current_lookup(&[path.clone()]).await.unwrap();
    assert_eq!(current[&path], CurrentEntry::Hash(hash(2)));
}

#[tokio::test]
async fn deleting_an_unknown_path_is_skipped() {
    let (_dir, store) = open_store().await;
    assert_eq!(
        store
            .commit_deletion(Path::new("/data/ghost"), ts(1_000))
            .await
            .unwrap(),
        CommitOutcome::Skipped
    );
    assert!(store.history(Path::new("/data/ghost")).await.unwrap().is_empty());
}

#[tokio::test]
async fn historical_lookup_uses_half_open_intervals() {
    let (_dir, store) = open_store().await;
    let path = PathBuf::from("/data/a");

    store.commit(&path, &hash(1), ts(1_000)).await.unwrap();
    store.commit(&path, &hash(2), ts(5_000)).await.unwrap();

    let paths = vec![path.clone()];

    let before = store.historical_lookup(&paths, ts(500)).await.unwrap();
    assert_eq!(before[&path], HistoricalEntry::NoRecord);

    let during = store.historical_lookup(&paths, ts(3_000)).await.unwrap();
    assert_eq!(during[&path], HistoricalEntry::Hash(hash(1)));

    // The boundary instant belongs to the newer mapping.
    let at_boundary = store.historical_lookup(&paths, ts(5_000)).await.unwrap();
    assert_eq!(at_boundary[&path], HistoricalEntry::Hash(hash(2)));

    let after = store.historical_lookup(&paths, ts(50_000)).await.unwrap();
    assert_eq!(after[&path], HistoricalEntry::Hash(hash(2)));
}

#[tokio::test]
async fn historical_lookup_sees_deletions() {
    let (_dir, store) = open_store().await;
    let path = PathBuf::from("/data/a");

    store.commit(&path, &hash(1), ts(1_000)).await.unwrap();
    store.commit_deletion(&path, ts(2_000)).await.unwrap();

    let paths = vec![path.clone()];
    let alive = store.historical_lookup(&paths, ts(1_500)).await.unwrap();
    assert_eq!(alive[&path], HistoricalEntry::Hash(hash(1)));
    let gone = store.historical_lookup(&paths, ts(2_500)).await.unwrap();
    assert_eq!(gone[&path], HistoricalEntry::Deleted);
}

#[tokio::test]
async fn reverse_lookup_follows_open_mappings() {
    let (_dir, store) = open_store().await;
    let shared = hash(7);
    let a = PathBuf::from("/data/a");
    let b = PathBuf::from("/data/b");
    let c = PathBuf::from("/data/c");

    store.commit(&a, &shared, ts(1_000)).await.unwrap();
    store.commit(&b, &shared, ts(1_100)).await.unwrap();
    store.commit(&c, &shared, ts(1_200)).await.unwrap();

    let result = store.reverse_lookup(&[shared.clone()]).await.unwrap();
    let paths = &result[&shared];
    assert_eq!(
        paths.iter().collect::<Vec<_>>(),
        vec![&a, &b, &c],
        "all three paths map to the shared hash"
    );

    store.commit_deletion(&a, ts(2_000)).await.unwrap();
    let result = store.reverse_lookup(&[shared.clone()]).await.unwrap();
    assert_eq!(result[&shared].iter().collect::<Vec<_>>(), vec![&b, &c]);

    // A hash nobody maps to answers with an empty set, not an error.
    let result = store.reverse_lookup(&[hash(9)]).await.unwrap();
    assert!(result[&hash(9)].is_empty());
}

#[tokio::test]
async fn backwards_clock_is_clamped_forward() {
    let (_dir, store) = open_store().await;
    let path = Path::new("/data/a");

    store.commit(path, &hash(1), ts(10_000)).await.unwrap();
    // Wall clock stepped back between the two settles.
    store.commit(path, &hash(2), ts(4_000)).await.unwrap();

    let history = store.history(path).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_contiguous(&history);
    assert!(history[1].valid_from > history[0].valid_from);
}

#[tokio::test]
async fn distinct_paths_commit_concurrently() {
    let (_dir, store) = open_store().await;
    let (hash_x, hash_y) = (hash(1), hash(2));
    let (left, right) = tokio::join!(
        store.commit(Path::new("/data/x"), &hash_x, ts(1_000)),
        store.commit(Path::new("/data/y"), &hash_y, ts(1_000)),
    );
    assert_eq!(left.unwrap(), CommitOutcome::Recorded);
    assert_eq!(right.unwrap(), CommitOutcome::Recorded);
}

#[tokio::test]
async fn unknown_paths_answer_per_entry() {
    let (_dir, store) = open_store().await;
    let known = PathBuf::from("/data/known");
    let unknown = PathBuf::from("/data/unknown");
    store.commit(&known, &hash(1), ts(1_000)).await.unwrap();

    let result = store
        .current_lookup(&[known.clone(), unknown.clone()])
        .await
        .unwrap();
    assert_eq!(result[&known], CurrentEntry::Hash(hash(1)));
    assert_eq!(result[&unknown], CurrentEntry::Unknown);
}

#[tokio::test]
async fn file_records_roundtrip_and_scope() {
    let (_dir, store) = open_store().await;
    let record = FileRecord {
        path: PathBuf::from("/data/sub/a"),
        size: 42,
        mtime: 1_700_000_000,
        state: FileState::Hashed,
        content_hash: Some(hash(1)),
        attempts: 0,
        last_stable_at: Some(ts(1_000)),
    };
    store.upsert_file_record(&record).await.unwrap();

    let loaded = store
        .file_record(Path::new("/data/sub/a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, record);

    let under = store.file_records_under(Path::new("/data")).await.unwrap();
    assert_eq!(under.len(), 1);
    let elsewhere = store.file_records_under(Path::new("/other")).await.unwrap();
    assert!(elsewhere.is_empty());

    store.remove_file_record(Path::new("/data/sub/a")).await.unwrap();
    assert!(store.file_record(Path::new("/data/sub/a")).await.unwrap().is_none());
}

#[tokio::test]
async fn symlink_edges_roundtrip() {
    let (_dir, store) = open_store().await;
    let edge = SymlinkEdge {
        source: PathBuf::from("/data/link"),
        target: PathBuf::from("/data/real"),
    };
    store.upsert_symlink_edge(&edge).await.unwrap();
    assert_eq!(
        store.symlink_target(Path::new("/data/link")).await.unwrap(),
        Some(PathBuf::from("/data/real"))
    );

    // Upsert replaces the target in place.
    store
        .upsert_symlink_edge(&SymlinkEdge {
            source: PathBuf::from("/data/link"),
            target: PathBuf::from("/data/other"),
        })
        .await
        .unwrap();
    assert_eq!(
        store.symlink_target(Path::new("/data/link")).await.unwrap(),
        Some(PathBuf::from("/data/other"))
    );

    let edges = store.symlink_edges_under(Path::new("/data")).await.unwrap();
    assert_eq!(edges.len(), 1);

    store.remove_symlink_edge(Path::new("/data/link")).await.unwrap();
    assert_eq!(
        store.symlink_target(Path::new("/data/link")).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn read_only_handle_sees_writer_commits() {
    let (dir, store) = open_store().await;
    let path = PathBuf::from("/data/a");
    store.commit(&path, &hash(1), ts(1_000)).await.unwrap();

    let reader = HistoryStore::open_read_only(dir.path()).await.unwrap();
    let current = reader.current_lookup(&[path.clone()]).await.unwrap();
    assert_eq!(current[&path], CurrentEntry::Hash(hash(1)));

    store.commit(&path, &hash(2), ts(2_000)).await.unwrap();
    let current = reader.current_lookup(&[path.clone()]).await.unwrap();
    assert_eq!(current[&path], CurrentEntry::Hash(hash(2)));
}
