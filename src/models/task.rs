//! Queue task models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::ItemContext;

/// Lifecycle of a queued task.
///
/// Workers only move a task forward: waiting → processing → complete|failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Processing,
    Complete,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Waiting,
        TaskStatus::Processing,
        TaskStatus::Complete,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "processing" => Some(Self::Processing),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// The three task queues, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Discover,
    Scan,
    Work,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Discover, QueueKind::Scan, QueueKind::Work];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Scan => "scan",
            Self::Work => "work",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "discover" => Some(Self::Discover),
            "scan" => Some(Self::Scan),
            "work" => Some(Self::Work),
            _ => None,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Discover => "discover_queue",
            Self::Scan => "scan_queue",
            Self::Work => "work_queue",
        }
    }
}

/// One unit of directory discovery for an ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverTask {
    pub task_id: i64,
    pub ingest_id: i64,
    pub actor_id: Option<String>,
    pub status: TaskStatus,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// A directory handed to a format-specific scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanTask {
    pub task_id: i64,
    pub ingest_id: i64,
    pub path: String,
    pub context: ItemContext,
    pub scanner_type: String,
    pub actor_id: Option<String>,
    pub status: TaskStatus,
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewScanTask {
    pub ingest_id: i64,
    pub path: String,
    pub context: ItemContext,
    pub scanner_type: String,
    pub discover_task_id: Option<i64>,
}

/// Upload work for exactly one ingest item.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkTask {
    pub task_id: i64,
    pub item_id: i64,
    pub ingest_id: i64,
    pub context: ItemContext,
    pub actor_id: Option<String>,
    pub status: TaskStatus,
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewWorkTask {
    pub item_id: i64,
    pub ingest_id: i64,
    pub context: ItemContext,
}

/// Per-status task counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub waiting: u64,
    pub processing: u64,
    pub complete: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Waiting => self.waiting += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Complete => self.complete += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.processing + self.complete + self.failed
    }

    pub fn pending(&self) -> u64 {
        self.waiting + self.processing
    }

    /// Nothing left waiting or in flight. Says nothing about failures.
    pub fn is_complete(&self) -> bool {
        self.pending() == 0
    }
}
