//! Data models for the import pipeline.

mod audit;
mod context;
mod ingest;
mod item;
mod private_tag;
mod subject;
mod task;

pub use audit::{AuditLog, DeidLog, NewAuditLog, NewDeidLog};
pub use context::{
    ContainerLabels, ContainerRef, ContainerType, ItemContext, NodeContext, PackfileSpec,
};
pub use ingest::{IngestOperation, IngestStage, NewIngest};
pub use item::{IngestItem, ItemSource, ItemType, NewIngestItem};
pub use private_tag::{NewPrivateTag, PrivateTag};
pub use subject::{NewSubjectMapping, SubjectCodeFormat, SubjectMapping};
pub use task::{
    DiscoverTask, NewScanTask, NewWorkTask, QueueKind, ScanTask, StatusCounts, TaskStatus,
    WorkTask,
};
