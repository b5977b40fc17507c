//! Queue behavior against a real SQLite database.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use bulk_import::config::ImporterConfig;
use bulk_import::models::{IngestStage, NewIngest, QueueKind, TaskStatus};
use bulk_import::repository::{DbContext, RepositoryError, TaskUpdate};
use tempfile::tempdir;

async fn setup(dir: &std::path::Path) -> (DbContext, i64) {
    let db = DbContext::new(&dir.join("queue.db"));
    db.initialize().await.unwrap();
    let ingest = db
        .ingests()
        .insert(&NewIngest {
            name: "queue test".to_string(),
            fs_path: "/data".to_string(),
            config: ImporterConfig::for_folder(PathBuf::from("/data")),
        })
        .await
        .unwrap();
    (db, ingest.ingest_id)
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let dir = tempdir().unwrap();
    let (db, ingest_id) = setup(dir.path()).await;
    db.initialize().await.unwrap();
    db.initialize().await.unwrap();

    let ingest = db.ingests().get(ingest_id).await.unwrap();
    assert_eq!(ingest.stage, IngestStage::Discovering);
}

#[tokio::test]
async fn test_claims_are_fifo() {
    let dir = tempdir().unwrap();
    let (db, ingest_id) = setup(dir.path()).await;
    let queue = db.discover_queue();

    let mut inserted = Vec::new();
    for _ in 0..5 {
        inserted.push(queue.insert(ingest_id).await.unwrap());
    }

    let mut claimed = Vec::new();
    while let Some(task) = queue.get("fifo-worker").await.unwrap() {
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.actor_id.as_deref(), Some("fifo-worker"));
        assert!(task.claimed_at.is_some());
        claimed.push(task.task_id);
    }
    assert_eq!(claimed, inserted);
    assert!(!queue.is_complete_for_ingest(ingest_id).await.unwrap());

    let processing = queue
        .list_for_ingest(ingest_id, Some(TaskStatus::Processing))
        .await
        .unwrap();
    assert_eq!(processing.len(), 5);
    assert!(queue
        .list_for_ingest(ingest_id, Some(TaskStatus::Waiting))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let dir = tempdir().unwrap();
    let (db, ingest_id) = setup(dir.path()).await;
    for _ in 0..40 {
        db.discover_queue().insert(ingest_id).await.unwrap();
    }

    let mut handles = Vec::new();
    for n in 0..4 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let actor = format!("worker-{n}");
            let mut mine = Vec::new();
            while let Some(task) = db.discover_queue().get(&actor).await.unwrap() {
                assert_eq!(task.actor_id.as_deref(), Some(actor.as_str()));
                mine.push(task.task_id);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[tokio::test]
async fn test_empty_actor_is_rejected() {
    let dir = tempdir().unwrap();
    let (db, ingest_id) = setup(dir.path()).await;
    db.discover_queue().insert(ingest_id).await.unwrap();

    let err = db.discover_queue().get("").await.unwrap_err();
    assert!(matches!(err, RepositoryError::Validation(_)));
}

#[tokio::test]
async fn test_lease_sweep_releases_stale_claims() {
    let dir = tempdir().unwrap();
    let (db, ingest_id) = setup(dir.path()).await;
    let queue = db.discover_queue();
    let task_id = queue.insert(ingest_id).await.unwrap();
    queue.get("crashed-worker").await.unwrap().unwrap();

    let table = db.queue(QueueKind::Discover);
    assert_eq!(table.requeue_stale(Duration::from_secs(3600)).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(table.requeue_stale(Duration::ZERO).await.unwrap(), 1);

    let task = queue.find(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
    assert_eq!(task.actor_id, None);
    assert_eq!(task.claimed_at, None);

    let reclaimed = queue.get("next-worker").await.unwrap().unwrap();
    assert_eq!(reclaimed.task_id, task_id);
}

#[tokio::test]
async fn test_update_rejects_invalid_field() {
    let dir = tempdir().unwrap();
    let (db, ingest_id) = setup(dir.path()).await;
    let task_id = db.discover_queue().insert(ingest_id).await.unwrap();

    let err = TaskUpdate::from_fields([("bogus", "1")]).unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidField(ref f) if f == "bogus"));

    // Discover tasks have no context column.
    let update = TaskUpdate::from_fields([("context", "{}")]).unwrap();
    let err = db.discover_queue().update(task_id, update).await.unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidField(_)));

    let task = db.discover_queue().find(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Waiting);
}

#[tokio::test]
async fn test_retry_failed_and_counts() {
    let dir = tempdir().unwrap();
    let (db, ingest_id) = setup(dir.path()).await;
    let queue = db.discover_queue();
    let first = queue.insert(ingest_id).await.unwrap();
    let second = queue.insert(ingest_id).await.unwrap();
    queue.get("w").await.unwrap();
    queue.get("w").await.unwrap();
    queue.update(first, TaskUpdate::status(TaskStatus::Complete)).await.unwrap();
    queue.update(second, TaskUpdate::status(TaskStatus::Failed)).await.unwrap();

    let table = db.queue(QueueKind::Discover);
    let counts = table.status_counts(Some(ingest_id)).await.unwrap();
    assert_eq!((counts.complete, counts.failed), (1, 1));
    assert!(counts.is_complete());

    assert_eq!(table.retry_failed(ingest_id).await.unwrap(), 1);
    let counts = table.status_counts(Some(ingest_id)).await.unwrap();
    assert_eq!(counts.waiting, 1);
    assert!(!queue.is_complete_for_ingest(ingest_id).await.unwrap());
}
