//! Database context for managing connections and repository access.
//!
//! The DbContext is the primary entry point for all database operations.
//! It holds the connection pool and hands out one mapper per table.

use std::path::Path;

use tracing::debug;

use super::audit_logs::AuditLogRepository;
use super::deid_logs::DeidLogRepository;
use super::discover_queue::DiscoverQueue;
use super::error::Result;
use super::ingests::IngestRepository;
use super::items::ItemRepository;
use super::pool::DbPool;
use super::private_tags::PrivateTagRepository;
use super::queue::QueueTable;
use super::scan_queue::ScanQueue;
use super::subjects::SubjectMapRepository;
use super::util::redact_url_password;
use super::work_queue::WorkQueue;
use crate::models::QueueKind;

/// Database context that manages the connection pool and provides mapper access.
///
/// # Example
/// ```ignore
/// let db = DbContext::from_url("sqlite:/var/lib/import/import.db")?;
/// db.initialize().await?;
/// let ingest = db.ingests().get(1).await?;
/// ```
#[derive(Clone)]
pub struct DbContext {
    pool: DbPool,
}

impl DbContext {
    /// Create a context from a database file path (SQLite only).
    pub fn new(db_path: &Path) -> Self {
        Self {
            pool: DbPool::sqlite_from_path(db_path),
        }
    }

    /// Create a context from a connection string (`sqlite:…` or `postgres:…`).
    pub fn from_url(url: &str) -> Result<Self> {
        debug!("Opening database {}", redact_url_password(url));
        Ok(Self {
            pool: DbPool::from_url(url)?,
        })
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Create every table and index. Safe to call on an existing database.
    pub async fn initialize(&self) -> Result<()> {
        self.pool.enable_wal().await?;
        self.ingests().initialize().await?;
        self.items().initialize().await?;
        self.discover_queue().initialize().await?;
        self.scan_queue().initialize().await?;
        self.work_queue().initialize().await?;
        self.audit_logs().initialize().await?;
        self.deid_logs().initialize().await?;
        self.subjects().initialize().await?;
        self.private_tags().initialize().await?;
        debug!("Schema ready on {}", self.pool.backend());
        Ok(())
    }

    pub fn ingests(&self) -> IngestRepository {
        IngestRepository::new(self.pool.clone())
    }

    pub fn items(&self) -> ItemRepository {
        ItemRepository::new(self.pool.clone())
    }

    pub fn discover_queue(&self) -> DiscoverQueue {
        DiscoverQueue::new(self.pool.clone())
    }

    pub fn scan_queue(&self) -> ScanQueue {
        ScanQueue::new(self.pool.clone())
    }

    pub fn work_queue(&self) -> WorkQueue {
        WorkQueue::new(self.pool.clone())
    }

    /// Shared status operations for one of the three queues.
    pub fn queue(&self, kind: QueueKind) -> QueueTable {
        QueueTable::new(self.pool.clone(), kind)
    }

    pub fn audit_logs(&self) -> AuditLogRepository {
        AuditLogRepository::new(self.pool.clone())
    }

    pub fn deid_logs(&self) -> DeidLogRepository {
        DeidLogRepository::new(self.pool.clone())
    }

    pub fn subjects(&self) -> SubjectMapRepository {
        SubjectMapRepository::new(self.pool.clone())
    }

    pub fn private_tags(&self) -> PrivateTagRepository {
        PrivateTagRepository::new(self.pool.clone())
    }
}
