//! Repository layer for database persistence.
//!
//! All database access uses Diesel with diesel-async. SQLite and PostgreSQL
//! are both supported; the backend is picked from the connection string.

pub mod claim;
pub mod context;
pub mod error;
pub mod pool;
pub mod queue;
pub mod store;
pub mod util;

mod audit_logs;
mod deid_logs;
mod discover_queue;
mod exclusive;
mod ingests;
mod items;
mod models;
mod private_tags;
mod scan_queue;
mod subjects;
mod work_queue;

pub use audit_logs::AuditLogRepository;
pub use claim::{ClaimStrategy, ExclusiveLockClaim};
pub use context::DbContext;
pub use deid_logs::DeidLogRepository;
pub use discover_queue::DiscoverQueue;
pub use error::RepositoryError;
pub use ingests::{IngestRepository, IngestUpdate};
pub use items::ItemRepository;
pub use pool::{Backend, DbPool};
pub use private_tags::PrivateTagRepository;
pub use queue::{QueueTable, TaskUpdate};
pub use scan_queue::ScanQueue;
pub use store::{Column, ColumnType};
pub use subjects::SubjectMapRepository;
pub use work_queue::WorkQueue;

#[cfg(feature = "postgres")]
pub use claim::SkipLockedClaim;
