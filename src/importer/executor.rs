//! Queue executor: a pool of workers draining the task queues.
//!
//! Every worker polls the queues in priority order and runs the first task
//! it manages to claim. Tasks are claimed through the database, so workers in
//! other processes can share the same queues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{DiscoverStage, ImportContext, ProcessStage, ScanStage};
use crate::models::{QueueKind, TaskStatus};
use crate::repository::{DbContext, RepositoryError};

/// A task that has been claimed and must be run to a terminal status.
#[async_trait]
pub trait ClaimedTask: Send {
    fn describe(&self) -> String;

    /// Run the task and record its outcome. Failures are recorded on the
    /// task, never returned.
    async fn execute(self: Box<Self>) -> TaskStatus;
}

/// A queue the executor can draw work from.
#[async_trait]
pub trait ExecutorQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    async fn get(&self, actor_id: &str) -> Result<Option<Box<dyn ClaimedTask>>, RepositoryError>;

    async fn is_complete_for_ingest(&self, ingest_id: i64) -> Result<bool, RepositoryError>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub lease_timeout: Duration,
}

impl ExecutorConfig {
    fn sweep_interval(&self) -> Duration {
        (self.lease_timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
    }
}

pub struct QueueExecutor {
    db: DbContext,
    queues: Vec<Arc<dyn ExecutorQueue>>,
    config: ExecutorConfig,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl QueueExecutor {
    pub fn new(db: DbContext, queues: Vec<Arc<dyn ExecutorQueue>>, config: ExecutorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            db,
            queues,
            config,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Executor over the discover, scan and work queues, in that order.
    pub fn for_context(ctx: Arc<ImportContext>, workers: usize) -> Self {
        let queues: Vec<Arc<dyn ExecutorQueue>> = vec![
            Arc::new(DiscoverStage::new(ctx.clone())),
            Arc::new(ScanStage::new(ctx.clone())),
            Arc::new(ProcessStage::new(ctx.clone())),
        ];
        let config = ExecutorConfig {
            workers,
            poll_interval: ctx.settings.poll_interval(),
            lease_timeout: ctx.settings.lease_timeout(),
        };
        Self::new(ctx.db.clone(), queues, config)
    }

    pub fn queues(&self) -> &[Arc<dyn ExecutorQueue>] {
        &self.queues
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Spawn the workers and the lease sweeper.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let prefix = actor_prefix();
        info!(
            "Starting {} workers as {}-*",
            self.config.workers, prefix
        );

        for n in 0..self.config.workers {
            let actor = format!("{prefix}-{n}");
            let queues = self.queues.clone();
            let poll_interval = self.config.poll_interval;
            let shutdown = self.shutdown.subscribe();
            self.handles.push(tokio::spawn(worker_loop(
                queues,
                actor,
                poll_interval,
                shutdown,
            )));
        }

        let db = self.db.clone();
        let lease_timeout = self.config.lease_timeout;
        let interval = self.config.sweep_interval();
        let shutdown = self.shutdown.subscribe();
        self.handles.push(tokio::spawn(sweep_loop(
            db,
            lease_timeout,
            interval,
            shutdown,
        )));
    }

    /// Claim and run at most one task. Returns its final status, or `None`
    /// when every queue was empty.
    pub async fn poll_once(
        queues: &[Arc<dyn ExecutorQueue>],
        actor_id: &str,
    ) -> Result<Option<TaskStatus>, RepositoryError> {
        for queue in queues {
            if let Some(task) = queue.get(actor_id).await? {
                debug!("{} claimed {}", actor_id, task.describe());
                return Ok(Some(task.execute().await));
            }
        }
        Ok(None)
    }

    /// Run tasks on the calling task until every queue is empty.
    pub async fn drain(&self, actor_id: &str) -> Result<usize, RepositoryError> {
        let mut executed = 0;
        while Self::poll_once(&self.queues, actor_id).await?.is_some() {
            executed += 1;
        }
        Ok(executed)
    }

    /// Whether every queue has finished its tasks for `ingest_id`.
    pub async fn is_complete_for_ingest(&self, ingest_id: i64) -> Result<bool, RepositoryError> {
        for queue in &self.queues {
            if !queue.is_complete_for_ingest(ingest_id).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Stop the workers after their current task and wait for them.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.handles.drain(..)).await {
            if let Err(e) = result {
                warn!("Worker exited abnormally: {}", e);
            }
        }
    }

    /// Sender that stops the workers when `true` is sent.
    pub fn shutdown_signal(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }
}

/// `<hostname>-<pid>`; workers append their index.
pub fn actor_prefix() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

async fn worker_loop(
    queues: Vec<Arc<dyn ExecutorQueue>>,
    actor: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Worker {} started", actor);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match QueueExecutor::poll_once(&queues, &actor).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!("Worker {} failed to poll: {}", actor, e),
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!("Worker {} stopped", actor);
}

async fn sweep_loop(
    db: DbContext,
    lease_timeout: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                for kind in QueueKind::ALL {
                    match db.queue(kind).requeue_stale(lease_timeout).await {
                        Ok(0) => {}
                        Ok(n) => warn!("Requeued {} stale {} tasks", n, kind.as_str()),
                        Err(e) => error!("Lease sweep of {} queue failed: {}", kind.as_str(), e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recorded {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ClaimedTask for Recorded {
        fn describe(&self) -> String {
            self.name.clone()
        }

        async fn execute(self: Box<Self>) -> TaskStatus {
            self.log.lock().unwrap().push(self.name.clone());
            TaskStatus::Complete
        }
    }

    struct CountingQueue {
        kind: QueueKind,
        remaining: AtomicUsize,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ExecutorQueue for CountingQueue {
        fn kind(&self) -> QueueKind {
            self.kind
        }

        async fn get(&self, _actor: &str) -> Result<Option<Box<dyn ClaimedTask>>, RepositoryError> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(None);
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            Ok(Some(Box::new(Recorded {
                name: format!("{}-{}", self.kind.as_str(), left),
                log: self.log.clone(),
            })))
        }

        async fn is_complete_for_ingest(&self, _ingest_id: i64) -> Result<bool, RepositoryError> {
            Ok(self.remaining.load(Ordering::SeqCst) == 0)
        }
    }

    #[tokio::test]
    async fn test_queue_priority() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = |kind, n| -> Arc<dyn ExecutorQueue> {
            Arc::new(CountingQueue {
                kind,
                remaining: AtomicUsize::new(n),
                log: log.clone(),
            })
        };
        let executor = QueueExecutor::new(
            DbContext::new(&dir.path().join("x.db")),
            vec![queue(QueueKind::Discover, 1), queue(QueueKind::Work, 2)],
            ExecutorConfig {
                workers: 1,
                poll_interval: Duration::from_millis(10),
                lease_timeout: Duration::from_secs(60),
            },
        );

        assert!(!executor.is_complete_for_ingest(1).await.unwrap());
        assert_eq!(executor.drain("test-0").await.unwrap(), 3);
        assert!(executor.is_complete_for_ingest(1).await.unwrap());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["discover-1", "work-2", "work-1"]
        );
    }

    #[test]
    fn test_actor_prefix_has_pid() {
        let prefix = actor_prefix();
        assert!(prefix.ends_with(&format!("-{}", std::process::id())));
    }
}
