//! Discover stage.
//!
//! One discover task covers a whole ingest. The tree is walked with an
//! explicit stack of targets; each target is a directory plus the context
//! the template assigned it. Targets are walked on a blocking thread and the
//! results streamed back over a channel, so inserts overlap with the walk.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ClaimedTask, ExecutorQueue, ImportContext, PipelineError};
use crate::models::{
    DiscoverTask, ItemContext, ItemSource, ItemType, NewIngestItem, NewScanTask, NodeContext,
    QueueKind, TaskStatus,
};
use crate::repository::{RepositoryError, TaskUpdate};
use crate::template::{Template, TemplateCursor, TemplateMatcher};
use crate::walker::{combine, relpath, Walker, WalkerError};

const CHANNEL_CAPACITY: usize = 256;

/// Counts of what one discover task produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverSummary {
    pub items: usize,
    pub files: usize,
    pub bytes: u64,
    pub scan_tasks: usize,
}

#[derive(Debug)]
enum Discovered {
    Item {
        subdir: String,
        files: Vec<String>,
        size: u64,
        item_type: ItemType,
        context: ItemContext,
    },
    Scan {
        path: String,
        context: ItemContext,
        scanner_type: String,
    },
}

struct Target {
    path: String,
    context: ItemContext,
    cursor: TemplateCursor,
}

/// Walk the tree from the root, sending one message per item or scan
/// hand-off. Returns early without error if the receiver hangs up.
fn walk_tree(
    walker: &dyn Walker,
    template: &dyn TemplateMatcher,
    root: ItemContext,
    tx: &mpsc::Sender<Discovered>,
) -> Result<(), WalkerError> {
    let mut stack = vec![Target {
        path: String::new(),
        context: root,
        cursor: TemplateCursor::Root,
    }];

    while let Some(target) = stack.pop() {
        let Target {
            path,
            mut context,
            cursor,
        } = target;

        let message = match context.node.clone() {
            NodeContext::Scanner { scanner_type } => vec![Discovered::Scan {
                path,
                context,
                scanner_type,
            }],
            NodeContext::Packfile(mut spec) => {
                let mut files = Vec::new();
                let mut size = 0;
                for listing in walker.walk(&path, None)? {
                    for file in listing.files {
                        files.push(relpath(&combine(&listing.root, &file.name), &path).to_string());
                        size += file.size;
                    }
                }
                if files.is_empty() {
                    debug!("Packfile directory {} is empty", path);
                    continue;
                }
                spec.file_count = Some(files.len());
                context.node = NodeContext::Packfile(spec);
                vec![Discovered::Item {
                    subdir: path,
                    files,
                    size,
                    item_type: ItemType::Packfile,
                    context,
                }]
            }
            NodeContext::Directory => {
                let listing = walker
                    .walk(&path, Some(1))?
                    .into_iter()
                    .next()
                    .unwrap_or_default();

                // Push in reverse so siblings pop in name order.
                for dir in listing.dirs.iter().rev() {
                    let mut child = context.child();
                    let next = template.extract_metadata(cursor, dir, &mut child);
                    if child.ignore {
                        debug!("Ignoring {}", combine(&path, dir));
                        continue;
                    }
                    stack.push(Target {
                        path: combine(&path, dir),
                        context: child,
                        cursor: next,
                    });
                }

                listing
                    .files
                    .into_iter()
                    .map(|file| Discovered::Item {
                        subdir: path.clone(),
                        files: vec![file.name],
                        size: file.size,
                        item_type: ItemType::File,
                        context: context.clone(),
                    })
                    .collect()
            }
        };

        for found in message {
            if tx.blocking_send(found).is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct DiscoverStage {
    ctx: Arc<ImportContext>,
}

impl DiscoverStage {
    pub fn new(ctx: Arc<ImportContext>) -> Self {
        Self { ctx }
    }

    /// Discover the whole source tree of the task's ingest.
    pub async fn run(&self, task: &DiscoverTask) -> Result<DiscoverSummary, PipelineError> {
        let db = &self.ctx.db;
        let ingest = db.ingests().get(task.ingest_id).await?;
        if ingest.is_aborted() {
            return Err(PipelineError::Aborted(ingest.ingest_id));
        }

        let walker = self.ctx.walker(&ingest)?;
        let template = Template::from_config(&ingest.config.template)?;
        let root = ingest.config.root_context();

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let walk = tokio::task::spawn_blocking(move || {
            walk_tree(walker.as_ref(), &template, root, &tx)
        });

        // Output an earlier run of this task already recorded is skipped.
        let items = db.items();
        let scan_queue = db.scan_queue();
        let source = ItemSource::Discover(task.task_id);
        let mut recorded_items = items.recorded_by(source).await?;
        let mut recorded_scans = scan_queue.paths_from_discover_task(task.task_id).await?;
        let mut skipped = 0;

        let mut summary = DiscoverSummary::default();
        while let Some(found) = rx.recv().await {
            match found {
                Discovered::Item {
                    subdir,
                    files,
                    size,
                    item_type,
                    context,
                } => {
                    summary.items += 1;
                    summary.files += files.len();
                    summary.bytes += size;
                    let key = (subdir, files);
                    if recorded_items.remove(&key) {
                        skipped += 1;
                        continue;
                    }
                    let (subdir, files) = key;
                    items
                        .insert(&NewIngestItem {
                            ingest_id: ingest.ingest_id,
                            subdir,
                            files,
                            size,
                            item_type,
                            context,
                            source: Some(source),
                        })
                        .await?;
                }
                Discovered::Scan {
                    path,
                    context,
                    scanner_type,
                } => {
                    summary.scan_tasks += 1;
                    if recorded_scans.remove(&path) {
                        skipped += 1;
                        continue;
                    }
                    scan_queue
                        .insert(&NewScanTask {
                            ingest_id: ingest.ingest_id,
                            path,
                            context,
                            scanner_type,
                            discover_task_id: Some(task.task_id),
                        })
                        .await?;
                }
            }
        }
        walk.await??;

        if skipped > 0 {
            info!(
                "Discover task {} had already recorded {} of its results",
                task.task_id, skipped
            );
        }
        info!(
            "Discovered {} items ({} files, {} bytes) and {} scan tasks in {}",
            summary.items,
            summary.files,
            summary.bytes,
            summary.scan_tasks,
            ingest.fs_path
        );
        Ok(summary)
    }
}

struct ClaimedDiscover {
    stage: DiscoverStage,
    task: DiscoverTask,
}

#[async_trait]
impl ClaimedTask for ClaimedDiscover {
    fn describe(&self) -> String {
        format!("discover task {} (ingest {})", self.task.task_id, self.task.ingest_id)
    }

    async fn execute(self: Box<Self>) -> TaskStatus {
        let status = match self.stage.run(&self.task).await {
            Ok(_) => TaskStatus::Complete,
            Err(e) => {
                warn!("Discover task {} failed: {}", self.task.task_id, e);
                TaskStatus::Failed
            }
        };
        if let Err(e) = self
            .stage
            .ctx
            .db
            .discover_queue()
            .update(self.task.task_id, TaskUpdate::status(status))
            .await
        {
            warn!("Could not record status of discover task {}: {}", self.task.task_id, e);
        }
        status
    }
}

#[async_trait]
impl ExecutorQueue for DiscoverStage {
    fn kind(&self) -> QueueKind {
        QueueKind::Discover
    }

    async fn get(&self, actor_id: &str) -> Result<Option<Box<dyn ClaimedTask>>, RepositoryError> {
        let task = self.ctx.db.discover_queue().get(actor_id).await?;
        Ok(task.map(|task| {
            Box::new(ClaimedDiscover {
                stage: self.clone(),
                task,
            }) as Box<dyn ClaimedTask>
        }))
    }

    async fn is_complete_for_ingest(&self, ingest_id: i64) -> Result<bool, RepositoryError> {
        self.ctx.db.discover_queue().is_complete_for_ingest(ingest_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PackfileSpec;
    use crate::template::{parse_template_string, TemplateNodeConfig};
    use crate::walker::{LocalWalker, WalkFilters};
    use std::fs;
    use tempfile::tempdir;

    fn discover(root: &std::path::Path, levels: &[TemplateNodeConfig]) -> Vec<Discovered> {
        let walker = LocalWalker::new(root, WalkFilters::default());
        let template = Template::from_config(levels).unwrap();
        let (tx, mut rx) = mpsc::channel(1024);
        walk_tree(&walker, &template, ItemContext::default(), &tx).unwrap();
        drop(tx);
        let mut out = Vec::new();
        while let Ok(found) = rx.try_recv() {
            out.push(found);
        }
        out
    }

    fn covered_files(found: &[Discovered]) -> Vec<String> {
        let mut files: Vec<String> = found
            .iter()
            .flat_map(|f| match f {
                Discovered::Item { subdir, files, .. } => {
                    files.iter().map(|name| combine(subdir, name)).collect()
                }
                Discovered::Scan { path, .. } => vec![format!("{path}/*")],
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_every_file_covered_once() {
        let dir = tempdir().unwrap();
        for path in ["s1/ses1/a.dat", "s1/ses1/b.dat", "s1/notes.txt", "s2/ses1/c.dat", "top.txt"] {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, path).unwrap();
        }

        let found = discover(dir.path(), &parse_template_string("{subject}:{session}"));
        assert_eq!(
            covered_files(&found),
            vec!["s1/notes.txt", "s1/ses1/a.dat", "s1/ses1/b.dat", "s2/ses1/c.dat", "top.txt"]
        );

        let a = found
            .iter()
            .find_map(|f| match f {
                Discovered::Item { subdir, context, .. } if subdir == "s1/ses1" => Some(context),
                _ => None,
            })
            .unwrap();
        assert_eq!(a.metadata.subject.as_deref(), Some("s1"));
        assert_eq!(a.metadata.session.as_deref(), Some("ses1"));
    }

    #[test]
    fn test_packfile_groups_subtree_and_ignore_prunes() {
        let dir = tempdir().unwrap();
        for path in [
            "s1/dicom/1.dcm",
            "s1/dicom/series2/2.dcm",
            "s1/dicom/series2/3.dcm",
            "s1/tmp/scratch.bin",
            "s1/empty-pack/.keep-dir/x",
        ] {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, b"x").unwrap();
        }
        fs::remove_file(dir.path().join("s1/empty-pack/.keep-dir/x")).unwrap();

        let mut pack = TemplateNodeConfig::pattern("dicom");
        pack.packfile_type = Some("dicom".into());
        let mut empty = TemplateNodeConfig::pattern("empty-pack");
        empty.packfile_type = Some("zip".into());
        let mut tmp = TemplateNodeConfig::pattern("tmp");
        tmp.ignore = true;
        let levels = vec![TemplateNodeConfig::pattern("{subject}")
            .with_child(pack)
            .with_child(empty)
            .with_child(tmp)];

        let found = discover(dir.path(), &levels);
        assert_eq!(found.len(), 1);
        match &found[0] {
            Discovered::Item {
                subdir,
                files,
                item_type,
                context,
                ..
            } => {
                assert_eq!(subdir, "s1/dicom");
                assert_eq!(files, &vec!["1.dcm", "series2/2.dcm", "series2/3.dcm"]);
                assert_eq!(*item_type, ItemType::Packfile);
                assert_eq!(
                    context.packfile(),
                    Some(&PackfileSpec {
                        packfile_type: "dicom".into(),
                        name: None,
                        flatten: false,
                        file_count: Some(3),
                    })
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scanner_directory_is_not_descended() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("s1/raw/deep")).unwrap();
        fs::write(dir.path().join("s1/raw/deep/x.hdr"), b"x").unwrap();

        let mut raw = TemplateNodeConfig::pattern("raw");
        raw.scan = Some("header".into());
        let levels = vec![TemplateNodeConfig::pattern("{subject}").with_child(raw)];

        let found = discover(dir.path(), &levels);
        assert_eq!(found.len(), 1);
        assert!(matches!(
            &found[0],
            Discovered::Scan { path, scanner_type, .. } if path == "s1/raw" && scanner_type == "header"
        ));
    }
}
