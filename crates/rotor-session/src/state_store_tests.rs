use super::*;
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    hits: u64,
}

async fn exercise_cas(store: &dyn StateStore) {
    assert!(store.load("coordinator/worker-1").await.unwrap().is_none());

    let rev = store
        .compare_and_swap("coordinator/worker-1", None, json!({"n": 1}))
        .await
        .unwrap();
    assert_eq!(rev, 1);

    let record = store.load("coordinator/worker-1").await.unwrap().unwrap();
    assert_eq!(record.revision, 1);
    assert_eq!(record.value, json!({"n": 1}));

    // Creating again must conflict.
    let err = store
        .compare_and_swap("coordinator/worker-1", None, json!({"n": 9}))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RotorError>(),
        Some(RotorError::StateConflict {
            expected: None,
            found: Some(1),
            ..
        })
    ));

    let rev = store
        .compare_and_swap("coordinator/worker-1", Some(1), json!({"n": 2}))
        .await
        .unwrap();
    assert_eq!(rev, 2);

    // Stale revision loses.
    assert!(
        store
            .compare_and_swap("coordinator/worker-1", Some(1), json!({"n": 3}))
            .await
            .is_err()
    );
    assert_eq!(
        store.load("coordinator/worker-1").await.unwrap().unwrap().value,
        json!({"n": 2})
    );

    assert!(store.delete("coordinator/worker-1").await.unwrap());
    assert!(!store.delete("coordinator/worker-1").await.unwrap());
    assert!(store.load("coordinator/worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_memory_store_cas() {
    exercise_cas(&MemoryStateStore::new()).await;
}

#[tokio::test]
async fn test_file_store_cas() {
    let dir = tempdir().unwrap();
    exercise_cas(&FileStateStore::new(dir.path())).await;
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = FileStateStore::new(dir.path());
        store
            .compare_and_swap("ip-rotation/default", None, json!({"request_count": 7}))
            .await
            .unwrap();
    }
    let reopened = FileStateStore::new(dir.path());
    let record = reopened.load("ip-rotation/default").await.unwrap().unwrap();
    assert_eq!(record.revision, 1);
    assert_eq!(record.value["request_count"], 7);
    assert!(dir.path().join("ip-rotation/default.json").exists());
}

#[tokio::test]
async fn test_file_store_rejects_unsafe_keys() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::new(dir.path());
    for key in ["../escape", "a//b", "", "with space"] {
        assert!(store.load(key).await.is_err(), "key {key:?} should be rejected");
    }
}

#[tokio::test]
async fn test_file_store_lists_keys_without_locks() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::new(dir.path());
    store
        .compare_and_swap("coordinator/a", None, json!(1))
        .await
        .unwrap();
    store.compare_and_swap("key-pool", None, json!(2)).await.unwrap();
    assert!(store.lock_path().exists());

    assert_eq!(
        store.keys().await.unwrap(),
        vec!["coordinator/a".to_string(), "key-pool".to_string()]
    );
}

#[tokio::test]
async fn test_corrupt_record_is_an_error() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("broken.json"), "not json").unwrap();
    let store = FileStateStore::new(dir.path());
    let err = store.load("broken").await.unwrap_err();
    assert!(err.to_string().contains("Corrupt state record"));
}

#[tokio::test]
async fn test_update_typed_starts_from_default() {
    let store = MemoryStateStore::new();
    let hits = update_typed(&store, "counter", |c: &mut Counter| {
        c.hits += 1;
        Ok(c.hits)
    })
    .await
    .unwrap();
    assert_eq!(hits, 1);

    let (revision, counter) = load_typed::<Counter>(&store, "counter").await.unwrap().unwrap();
    assert_eq!(revision, 1);
    assert_eq!(counter.hits, 1);
}

#[tokio::test]
async fn test_update_typed_propagates_mutate_error_without_writing() {
    let store = MemoryStateStore::new();
    let err = update_typed(&store, "counter", |_: &mut Counter| -> Result<()> {
        bail!("refused")
    })
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "refused");
    assert!(store.load("counter").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_do_not_lose_writes() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                update_typed(store.as_ref(), "counter", |c: &mut Counter| {
                    c.hits += 1;
                    Ok(())
                })
                .await
                .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let (_, counter) = load_typed::<Counter>(store.as_ref(), "counter")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(counter.hits, 20);
}
