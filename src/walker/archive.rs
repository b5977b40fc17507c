//! Walker over the contents of a zip archive.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use zip::ZipArchive;

use super::{basename, combine, relpath, DirListing, FileInfo, WalkFilters, Walker, WalkerError};

#[derive(Default)]
struct DirEntry {
    dirs: BTreeSet<String>,
    files: Vec<FileInfo>,
}

/// Treats a zip file as a read-only directory tree.
///
/// The member index is built once on open; reads take the archive lock and
/// buffer the member in memory.
pub struct ZipWalker {
    path: PathBuf,
    archive: Mutex<ZipArchive<File>>,
    tree: BTreeMap<String, DirEntry>,
}

impl ZipWalker {
    pub fn open(path: &Path, filters: WalkFilters) -> Result<Self, WalkerError> {
        let file = File::open(path).map_err(|e| WalkerError::io(path.display().to_string(), e))?;
        let mut archive = ZipArchive::new(file)?;

        let mut tree: BTreeMap<String, DirEntry> = BTreeMap::new();
        tree.insert(String::new(), DirEntry::default());

        for index in 0..archive.len() {
            let member = archive.by_index(index)?;
            let name = member.name().trim_end_matches('/').to_string();
            if name.is_empty() {
                continue;
            }
            if member.is_dir() {
                register_dir(&mut tree, &name);
                continue;
            }
            let (parent, file_name) = match name.rsplit_once('/') {
                Some((parent, file_name)) => (parent.to_string(), file_name.to_string()),
                None => (String::new(), name.clone()),
            };
            if !filters.accepts_file(&file_name) {
                continue;
            }
            register_dir(&mut tree, &parent);
            if let Some(entry) = tree.get_mut(&parent) {
                entry.files.push(FileInfo {
                    name: file_name,
                    size: member.size(),
                });
            }
        }

        // Prune excluded directories along with everything below them.
        let excluded: Vec<String> = tree
            .keys()
            .filter(|dir| !dir.is_empty() && !filters.accepts_dir(basename(dir)))
            .cloned()
            .collect();
        for dir in &excluded {
            tree.retain(|key, _| key != dir && !key.starts_with(&format!("{dir}/")));
            let parent = dir.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            if let Some(entry) = tree.get_mut(parent) {
                entry.dirs.remove(basename(dir));
            }
        }

        for entry in tree.values_mut() {
            entry.files.sort_by(|a, b| a.name.cmp(&b.name));
        }

        Ok(Self {
            path: path.to_path_buf(),
            archive: Mutex::new(archive),
            tree,
        })
    }
}

/// Make sure `dir` and all of its ancestors exist in the tree.
fn register_dir(tree: &mut BTreeMap<String, DirEntry>, dir: &str) {
    let mut current = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        let child = combine(&current, part);
        tree.entry(current.clone())
            .or_default()
            .dirs
            .insert(part.to_string());
        tree.entry(child.clone()).or_default();
        current = child;
    }
}

impl Walker for ZipWalker {
    fn walk(&self, subdir: &str, max_depth: Option<usize>) -> Result<Vec<DirListing>, WalkerError> {
        let subdir = subdir.trim_matches('/');
        if !self.tree.contains_key(subdir) {
            return Err(WalkerError::NotFound(format!(
                "{}:{}",
                self.path.display(),
                subdir
            )));
        }

        let listings = self
            .tree
            .iter()
            .filter(|(dir, _)| {
                let below = dir.as_str() == subdir
                    || subdir.is_empty()
                    || dir.starts_with(&format!("{subdir}/"));
                if !below {
                    return false;
                }
                let rel = relpath(dir, subdir);
                let depth = if rel.is_empty() {
                    0
                } else {
                    rel.split('/').count()
                };
                max_depth.map_or(true, |max| depth < max)
            })
            .map(|(dir, entry)| DirListing {
                root: dir.clone(),
                dirs: entry.dirs.iter().cloned().collect(),
                files: entry.files.clone(),
            })
            .collect();
        Ok(listings)
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, WalkerError> {
        let path = path.trim_start_matches('/');
        let mut archive = self
            .archive
            .lock()
            .map_err(|_| WalkerError::NotFound(format!("{} (archive lock poisoned)", path)))?;
        let mut member = archive.by_name(path)?;
        let mut buf = Vec::with_capacity(member.size() as usize);
        member
            .read_to_end(&mut buf)
            .map_err(|e| WalkerError::io(path, e))?;
        Ok(Box::new(Cursor::new(buf)))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, members: &[(&str, &str)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, body) in members {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_zip_walk_and_open() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("source.zip");
        write_zip(
            &zip_path,
            &[
                ("s1/ses1/a.dat", "aaa"),
                ("s1/ses1/b.dat", "b"),
                ("s1/notes.txt", "n"),
                ("__MACOSX/s1/._a.dat", "junk"),
            ],
        );

        let filters = WalkFilters::new(&[], &[], &["__MACOSX".to_string()]).unwrap();
        let walker = ZipWalker::open(&zip_path, filters).unwrap();

        let top = walker.walk("", Some(1)).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].dirs, vec!["s1"]);

        let all = walker.walk("s1", None).unwrap();
        let roots: Vec<&str> = all.iter().map(|l| l.root.as_str()).collect();
        assert_eq!(roots, vec!["s1", "s1/ses1"]);
        assert_eq!(all[0].files[0].name, "notes.txt");
        assert_eq!(all[1].files.len(), 2);
        assert_eq!(all[1].files[0].size, 3);

        let mut body = String::new();
        walker
            .open("s1/ses1/a.dat")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "aaa");
        assert!(walker.walk("missing", None).is_err());
    }
}
