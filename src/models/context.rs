//! Item context: where an item goes and how it was classified.
//!
//! Discovery threads an [`ItemContext`] down the source tree. The container
//! labels form a common envelope; the node kind says whether the directory is
//! an ordinary directory, a packfile root or a scanner hand-off. The whole
//! thing is stored as JSON, and unknown keys survive a round trip through
//! `extra`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Level in the destination container hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Group,
    Project,
    Subject,
    Session,
    Acquisition,
}

impl ContainerType {
    /// All levels, outermost first.
    pub const ALL: [ContainerType; 5] = [
        ContainerType::Group,
        ContainerType::Project,
        ContainerType::Subject,
        ContainerType::Session,
        ContainerType::Acquisition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Project => "project",
            Self::Subject => "subject",
            Self::Session => "session",
            Self::Acquisition => "acquisition",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "group" => Some(Self::Group),
            "project" => Some(Self::Project),
            "subject" => Some(Self::Subject),
            "session" => Some(Self::Session),
            "acquisition" => Some(Self::Acquisition),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container labels extracted from the source tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLabels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquisition: Option<String>,
}

impl ContainerLabels {
    pub fn get(&self, level: ContainerType) -> Option<&str> {
        match level {
            ContainerType::Group => self.group.as_deref(),
            ContainerType::Project => self.project.as_deref(),
            ContainerType::Subject => self.subject.as_deref(),
            ContainerType::Session => self.session.as_deref(),
            ContainerType::Acquisition => self.acquisition.as_deref(),
        }
    }

    pub fn set(&mut self, level: ContainerType, label: impl Into<String>) {
        let slot = match level {
            ContainerType::Group => &mut self.group,
            ContainerType::Project => &mut self.project,
            ContainerType::Subject => &mut self.subject,
            ContainerType::Session => &mut self.session,
            ContainerType::Acquisition => &mut self.acquisition,
        };
        *slot = Some(label.into());
    }

    /// The innermost level that has a label.
    pub fn deepest(&self) -> Option<(ContainerType, &str)> {
        ContainerType::ALL
            .iter()
            .rev()
            .find_map(|level| self.get(*level).map(|label| (*level, label)))
    }

    /// Labels of every set level, outermost first, joined with `/`.
    pub fn path(&self) -> String {
        ContainerType::ALL
            .iter()
            .filter_map(|level| self.get(*level))
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn is_empty(&self) -> bool {
        self.deepest().is_none()
    }
}

/// A resolved destination container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container_type: ContainerType,
    pub id: String,
    pub label: String,
}

/// Packfile directive attached to a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackfileSpec {
    pub packfile_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Store members by basename instead of their path under the packfile root.
    #[serde(default)]
    pub flatten: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
}

impl PackfileSpec {
    pub fn new(packfile_type: impl Into<String>) -> Self {
        Self {
            packfile_type: packfile_type.into(),
            name: None,
            flatten: false,
            file_count: None,
        }
    }
}

/// How discovery treats a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeContext {
    #[default]
    Directory,
    Packfile(PackfileSpec),
    Scanner { scanner_type: String },
}

/// Context carried by discover targets, scan tasks, items and work tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemContext {
    #[serde(default)]
    pub metadata: ContainerLabels,
    #[serde(default)]
    pub node: NodeContext,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ContainerRef>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ItemContext {
    pub fn with_labels(metadata: ContainerLabels) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    /// Record an extracted field: container levels go into the label
    /// envelope, anything else into `extra`.
    pub fn set_field(&mut self, name: &str, value: &str) {
        match ContainerType::from_str(name) {
            Some(level) => self.metadata.set(level, value),
            None => {
                self.extra
                    .insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }

    pub fn packfile(&self) -> Option<&PackfileSpec> {
        match &self.node {
            NodeContext::Packfile(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn scanner_type(&self) -> Option<&str> {
        match &self.node {
            NodeContext::Scanner { scanner_type } => Some(scanner_type),
            _ => None,
        }
    }

    /// Copy of this context for a child directory.
    ///
    /// Labels and extra fields are inherited; the node kind resets to a
    /// plain directory unless an ancestor already made it a packfile.
    pub fn child(&self) -> Self {
        let node = match &self.node {
            NodeContext::Packfile(spec) => NodeContext::Packfile(spec.clone()),
            _ => NodeContext::Directory,
        };
        Self {
            metadata: self.metadata.clone(),
            node,
            ignore: false,
            target: None,
            extra: self.extra.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_path_and_deepest() {
        let mut labels = ContainerLabels::default();
        assert!(labels.is_empty());
        labels.set(ContainerType::Subject, "subject1");
        labels.set(ContainerType::Session, "session1");

        assert_eq!(labels.path(), "subject1/session1");
        assert_eq!(labels.deepest(), Some((ContainerType::Session, "session1")));
    }

    #[test]
    fn test_context_keeps_unknown_fields() {
        let raw = r#"{"metadata":{"subject":"s1"},"node":{"kind":"packfile","packfile_type":"dicom"},"scanner_hint":"x"}"#;
        let ctx = ItemContext::from_json(raw).unwrap();

        assert_eq!(ctx.metadata.subject.as_deref(), Some("s1"));
        assert_eq!(ctx.packfile().unwrap().packfile_type, "dicom");
        assert_eq!(ctx.extra["scanner_hint"], "x");

        let again = ItemContext::from_json(&ctx.to_json().unwrap()).unwrap();
        assert_eq!(again, ctx);
    }

    #[test]
    fn test_child_inherits_packfile_but_not_scanner() {
        let mut ctx = ItemContext::default();
        ctx.set_field("project", "p");
        ctx.node = NodeContext::Scanner {
            scanner_type: "header".to_string(),
        };
        assert_eq!(ctx.child().node, NodeContext::Directory);
        assert_eq!(ctx.child().metadata.project.as_deref(), Some("p"));

        ctx.node = NodeContext::Packfile(PackfileSpec::new("zip"));
        assert!(ctx.child().packfile().is_some());
    }
}
