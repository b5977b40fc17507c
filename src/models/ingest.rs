//! Ingest operation model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ImporterConfig;

/// Stage of an ingest operation.
///
/// Moves forward only: discovering → importing → complete. `aborted` can be
/// entered from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Discovering,
    Importing,
    Complete,
    Aborted,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovering => "discovering",
            Self::Importing => "importing",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "discovering" => Some(Self::Discovering),
            "importing" => Some(Self::Importing),
            "complete" => Some(Self::Complete),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    /// Stages from which `self` may be entered.
    pub fn predecessors(&self) -> &'static [IngestStage] {
        match self {
            Self::Discovering => &[],
            Self::Importing => &[Self::Discovering],
            Self::Complete => &[Self::Importing],
            Self::Aborted => &[Self::Discovering, Self::Importing],
        }
    }

    pub fn can_transition_to(&self, next: IngestStage) -> bool {
        *self == next || next.predecessors().contains(self)
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end import run.
#[derive(Debug, Clone)]
pub struct IngestOperation {
    pub ingest_id: i64,
    pub name: String,
    pub created: DateTime<Utc>,
    pub fs_path: String,
    pub config: ImporterConfig,
    pub stage: IngestStage,
    pub version: String,
    pub processing_start: Option<DateTime<Utc>>,
    pub processing_end: Option<DateTime<Utc>>,
}

impl IngestOperation {
    pub fn is_aborted(&self) -> bool {
        self.stage == IngestStage::Aborted
    }
}

#[derive(Debug, Clone)]
pub struct NewIngest {
    pub name: String,
    pub fs_path: String,
    pub config: ImporterConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_graph() {
        use IngestStage::*;
        assert!(Discovering.can_transition_to(Importing));
        assert!(Importing.can_transition_to(Complete));
        assert!(Discovering.can_transition_to(Aborted));
        assert!(Importing.can_transition_to(Aborted));

        assert!(!Importing.can_transition_to(Discovering));
        assert!(!Discovering.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Importing));
    }
}
