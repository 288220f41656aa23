//! Tests for the structural diff engines and parallel iteration.

use arbor_amt::{diff, diff_parallel, par_for_each, Amt, AmtError, Change, DEFAULT_BIT_WIDTH};
use arbor_core::{BlockRead, BlockWrite, ContentId, MemoryBlockstore, DAG_CBOR};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

async fn build(store: &MemoryBlockstore, entries: &[(u64, &str)]) -> ContentId {
    let mut amt = Amt::new(store.clone());
    for &(k, v) in entries {
        amt.set(k, v).await.unwrap();
    }
    amt.flush().await.unwrap()
}

/// Sort changes into a comparable canonical form.
fn sorted(mut changes: Vec<Change>) -> Vec<Change> {
    changes.sort_by_key(|c| (c.key(), discriminant_rank(c)));
    changes
}

fn discriminant_rank(c: &Change) -> u8 {
    match c {
        Change::Add { .. } => 0,
        Change::Remove { .. } => 1,
        Change::Modify { .. } => 2,
    }
}

/// Apply a change set to a loaded tree, as mutations.
async fn apply(amt: &mut Amt<MemoryBlockstore>, changes: &[Change]) {
    for change in changes {
        match change {
            Change::Add { key, after } => amt.set(*key, after).await.unwrap(),
            Change::Modify { key, after, .. } => amt.set(*key, after).await.unwrap(),
            Change::Remove { key, .. } => {
                assert!(amt.delete(*key).await.unwrap());
            }
        }
    }
}

#[tokio::test]
async fn test_equal_trees_diff_empty() {
    let store = MemoryBlockstore::new();
    let entries: Vec<(u64, String)> = (0..100u64).map(|i| (i, format!("v{i}"))).collect();
    let entries_ref: Vec<(u64, &str)> = entries.iter().map(|(k, v)| (*k, v.as_str())).collect();

    let a = build(&store, &entries_ref).await;
    let b = build(&store, &entries_ref).await;
    assert_eq!(a, b);

    let changes = diff(&store, &store, &a, &b, DEFAULT_BIT_WIDTH).await.unwrap();
    assert!(changes.is_empty());
}

#[tokio::test]
async fn test_simple_add() {
    let store = MemoryBlockstore::new();
    let prev = build(&store, &[(2, "foo")]).await;
    let cur = build(&store, &[(2, "foo"), (5, "bar")]).await;

    let changes = diff(&store, &store, &prev, &cur, DEFAULT_BIT_WIDTH)
        .await
        .unwrap();
    assert_eq!(
        changes,
        vec![Change::Add {
            key: 5,
            after: b"bar".to_vec()
        }]
    );
}

#[tokio::test]
async fn test_simple_remove() {
    let store = MemoryBlockstore::new();
    let prev = build(&store, &[(2, "foo"), (5, "bar")]).await;
    let cur = build(&store, &[(2, "foo")]).await;

    let changes = diff(&store, &store, &prev, &cur, DEFAULT_BIT_WIDTH)
        .await
        .unwrap();
    assert_eq!(
        changes,
        vec![Change::Remove {
            key: 5,
            before: b"bar".to_vec()
        }]
    );
}

#[tokio::test]
async fn test_simple_modify() {
    let store = MemoryBlockstore::new();
    let prev = build(&store, &[(2, "foo")]).await;
    let cur = build(&store, &[(2, "bar")]).await;

    let changes = diff(&store, &store, &prev, &cur, DEFAULT_BIT_WIDTH)
        .await
        .unwrap();
    assert_eq!(
        changes,
        vec![Change::Modify {
            key: 2,
            before: b"foo".to_vec(),
            after: b"bar".to_vec()
        }]
    );
}

#[tokio::test]
async fn test_diff_against_empty_tree() {
    let prev_store = MemoryBlockstore::new();
    let cur_store = MemoryBlockstore::new();

    let empty = build(&prev_store, &[]).await;
    build(&cur_store, &[]).await;
    let full = build(&cur_store, &[(0, "a"), (9, "b"), (500, "c")]).await;

    let changes = sorted(
        diff(&prev_store, &cur_store, &empty, &full, DEFAULT_BIT_WIDTH)
            .await
            .unwrap(),
    );
    assert_eq!(
        changes,
        vec![
            Change::Add {
                key: 0,
                after: b"a".to_vec()
            },
            Change::Add {
                key: 9,
                after: b"b".to_vec()
            },
            Change::Add {
                key: 500,
                after: b"c".to_vec()
            },
        ]
    );

    // and the reverse direction removes everything
    let changes = sorted(
        diff(&cur_store, &prev_store, &full, &empty, DEFAULT_BIT_WIDTH)
            .await
            .unwrap(),
    );
    assert_eq!(changes.len(), 3);
    assert!(changes
        .iter()
        .all(|c| matches!(c, Change::Remove { .. })));
}

#[tokio::test]
async fn test_diff_across_heights() {
    let store = MemoryBlockstore::new();
    // height 0 versus height 2
    let prev = build(&store, &[(1, "thing")]).await;
    let cur = build(&store, &[(1, "thing"), (300, "other")]).await;

    let changes = diff(&store, &store, &prev, &cur, DEFAULT_BIT_WIDTH)
        .await
        .unwrap();
    assert_eq!(
        changes,
        vec![Change::Add {
            key: 300,
            after: b"other".to_vec()
        }]
    );

    // the shorter side's entries are removed when absent from the taller
    let cur2 = build(&store, &[(300, "other")]).await;
    let changes = sorted(
        diff(&store, &store, &prev, &cur2, DEFAULT_BIT_WIDTH)
            .await
            .unwrap(),
    );
    assert_eq!(
        changes,
        vec![
            Change::Remove {
                key: 1,
                before: b"thing".to_vec()
            },
            Change::Add {
                key: 300,
                after: b"other".to_vec()
            },
        ]
    );
}

#[tokio::test]
async fn test_modify_and_remove_split() {
    let store = MemoryBlockstore::new();

    // a: {i -> "foo{i}"} for i in 0..100
    // b: even values replaced, odd values deleted
    let a_entries: Vec<(u64, String)> = (0..100u64).map(|i| (i, format!("foo{i}"))).collect();
    let b_entries: Vec<(u64, String)> = (0..100u64)
        .filter(|i| i % 2 == 0)
        .map(|i| (i, format!("bar{i}")))
        .collect();

    let a_refs: Vec<(u64, &str)> = a_entries.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let b_refs: Vec<(u64, &str)> = b_entries.iter().map(|(k, v)| (*k, v.as_str())).collect();

    let a = build(&store, &a_refs).await;
    let b = build(&store, &b_refs).await;

    let changes = diff(&store, &store, &a, &b, DEFAULT_BIT_WIDTH).await.unwrap();
    let modifies = changes
        .iter()
        .filter(|c| matches!(c, Change::Modify { .. }))
        .count();
    let removes = changes
        .iter()
        .filter(|c| matches!(c, Change::Remove { .. }))
        .count();
    assert_eq!(modifies, 50);
    assert_eq!(removes, 50);
    assert_eq!(changes.len(), 100);

    for change in &changes {
        match change {
            Change::Modify { key, before, after } => {
                assert_eq!(key % 2, 0);
                assert_eq!(before, format!("foo{key}").as_bytes());
                assert_eq!(after, format!("bar{key}").as_bytes());
            }
            Change::Remove { key, before } => {
                assert_eq!(key % 2, 1);
                assert_eq!(before, format!("foo{key}").as_bytes());
            }
            Change::Add { .. } => panic!("unexpected add"),
        }
    }
}

#[tokio::test]
async fn test_diff_applied_reproduces_target() {
    let store = MemoryBlockstore::new();

    let a_refs: Vec<(u64, String)> = (0..200u64)
        .filter(|i| i % 3 != 0)
        .map(|i| (i, format!("a{i}")))
        .collect();
    let b_refs: Vec<(u64, String)> = (0..300u64)
        .filter(|i| i % 2 != 0)
        .map(|i| (i, format!("b{i}")))
        .collect();
    let a_entries: Vec<(u64, &str)> = a_refs.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let b_entries: Vec<(u64, &str)> = b_refs.iter().map(|(k, v)| (*k, v.as_str())).collect();

    let a = build(&store, &a_entries).await;
    let b = build(&store, &b_entries).await;

    let changes = diff(&store, &store, &a, &b, DEFAULT_BIT_WIDTH).await.unwrap();

    let mut patched = Amt::load(store.clone(), &a).await.unwrap();
    apply(&mut patched, &changes).await;
    let patched_id = patched.flush().await.unwrap();
    assert_eq!(patched_id, b);
}

#[tokio::test]
async fn test_big_diff_prunes_shared_subtrees() {
    let store = MemoryBlockstore::new();

    let mut base: BTreeMap<u64, String> = (0..3000u64).map(|i| (i, format!("v{i}"))).collect();
    let base_refs: Vec<(u64, &str)> = base.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let a = build(&store, &base_refs).await;

    // touch a handful of keys far apart, leaving most subtrees shared
    base.insert(17, "changed".to_string());
    base.insert(2999, "changed".to_string());
    base.remove(&1500);
    base.insert(60_000, "appended".to_string());
    let cur_refs: Vec<(u64, &str)> = base.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let b = build(&store, &cur_refs).await;

    let gets_before = store.get_count();
    let changes = sorted(diff(&store, &store, &a, &b, DEFAULT_BIT_WIDTH).await.unwrap());
    let gets_during = store.get_count() - gets_before;

    assert_eq!(
        changes
            .iter()
            .map(|c| c.key())
            .collect::<Vec<_>>(),
        vec![17, 1500, 2999, 60_000]
    );
    // pruning keeps the walk far below the ~860 nodes of the two trees
    assert!(
        gets_during < 100,
        "expected shared subtrees to be pruned, saw {gets_during} gets"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_diff_matches_sequential() {
    let store = Arc::new(MemoryBlockstore::new());

    let a_pairs: Vec<(u64, String)> = (0..2000u64)
        .filter(|i| i % 7 != 0)
        .map(|i| (i, format!("a{i}")))
        .collect();
    let b_pairs: Vec<(u64, String)> = (0..2500u64)
        .filter(|i| i % 5 != 0)
        .map(|i| (i, format!("b{}", i * 31 % 17)))
        .collect();
    let a_entries: Vec<(u64, &str)> = a_pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let b_entries: Vec<(u64, &str)> = b_pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();

    let a = build(&store, &a_entries).await;
    let b = build(&store, &b_entries).await;

    let sequential = sorted(diff(&*store, &*store, &a, &b, DEFAULT_BIT_WIDTH).await.unwrap());
    let parallel = sorted(
        diff_parallel(store.clone(), store.clone(), &a, &b, DEFAULT_BIT_WIDTH)
            .await
            .unwrap(),
    );
    assert_eq!(sequential, parallel);
    assert!(!sequential.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_diff_across_heights_and_empty() {
    let store = Arc::new(MemoryBlockstore::new());

    let empty = build(&store, &[]).await;
    let small = build(&store, &[(1, "thing")]).await;
    let tall = build(&store, &[(1, "thing"), (70_000, "far")]).await;

    let changes = diff_parallel(store.clone(), store.clone(), &empty, &small, DEFAULT_BIT_WIDTH)
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);

    let changes = sorted(
        diff_parallel(store.clone(), store.clone(), &small, &tall, DEFAULT_BIT_WIDTH)
            .await
            .unwrap(),
    );
    assert_eq!(
        changes,
        vec![Change::Add {
            key: 70_000,
            after: b"far".to_vec()
        }]
    );

    let changes = diff_parallel(store.clone(), store.clone(), &tall, &empty, DEFAULT_BIT_WIDTH)
        .await
        .unwrap();
    assert_eq!(changes.len(), 2);
}

#[tokio::test]
async fn test_diff_missing_block_surfaces() {
    let full_store = MemoryBlockstore::new();
    let a = build(&full_store, &[(0, "a"), (100, "b")]).await;
    let b = build(&full_store, &[(0, "a"), (100, "c"), (101, "d")]).await;

    // a store that only holds the root records cannot supply the children
    let sparse = MemoryBlockstore::new();
    for id in [&a, &b] {
        let bytes = full_store.get_block(id).await.unwrap();
        sparse.put_block(DAG_CBOR, &bytes).await.unwrap();
    }

    let err = diff(&sparse, &sparse, &a, &b, DEFAULT_BIT_WIDTH)
        .await
        .unwrap_err();
    assert!(matches!(err, AmtError::Store(e) if e.is_not_found()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_par_for_each_visits_everything() {
    let store = Arc::new(MemoryBlockstore::new());
    let entries: Vec<(u64, String)> = (0..5000u64)
        .filter(|i| i % 3 == 0)
        .map(|i| (i, format!("v{i}")))
        .collect();
    let entry_refs: Vec<(u64, &str)> = entries.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let root = build(&store, &entry_refs).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_visitor = seen.clone();
    par_for_each(store, &root, DEFAULT_BIT_WIDTH, move |k, v| {
        seen_in_visitor
            .lock()
            .expect("visitor mutex poisoned")
            .push((k, v.to_vec()));
        Ok(())
    })
    .await
    .unwrap();

    let mut visited = Arc::try_unwrap(seen).unwrap().into_inner().unwrap();
    visited.sort_by_key(|(k, _)| *k);
    let expected: Vec<(u64, Vec<u8>)> = entries
        .into_iter()
        .map(|(k, v)| (k, v.into_bytes()))
        .collect();
    assert_eq!(visited, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_par_for_each_first_error_wins() {
    let store = Arc::new(MemoryBlockstore::new());
    let entries: Vec<(u64, String)> = (0..2000u64).map(|i| (i, "v".to_string())).collect();
    let entry_refs: Vec<(u64, &str)> = entries.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let root = build(&store, &entry_refs).await;

    let visits = Arc::new(AtomicU64::new(0));
    let counter = visits.clone();
    let err = par_for_each(store, &root, DEFAULT_BIT_WIDTH, move |k, _| {
        if k == 777 {
            return Err(AmtError::NotFound { index: k });
        }
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })
    .await
    .unwrap_err();

    assert!(matches!(err, AmtError::NotFound { index: 777 }));
    // the walk stopped early rather than visiting every entry
    assert!(visits.load(Ordering::Relaxed) < 2000);
}
