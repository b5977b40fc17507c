//! Walker over a local directory tree.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{basename, combine, native_path, DirListing, FileInfo, WalkFilters, Walker, WalkerError};

pub struct LocalWalker {
    root: PathBuf,
    filters: WalkFilters,
}

impl LocalWalker {
    pub fn new(root: &Path, filters: WalkFilters) -> Self {
        Self {
            root: root.to_path_buf(),
            filters,
        }
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl Walker for LocalWalker {
    fn walk(&self, subdir: &str, max_depth: Option<usize>) -> Result<Vec<DirListing>, WalkerError> {
        let start = native_path(&self.root, subdir);
        if !start.is_dir() {
            return Err(WalkerError::NotFound(start.display().to_string()));
        }

        let mut walk = WalkDir::new(&start)
            .min_depth(1)
            .follow_links(self.filters.follows_symlinks())
            .sort_by_file_name();
        if let Some(depth) = max_depth {
            walk = walk.max_depth(depth);
        }

        let mut listings: BTreeMap<String, DirListing> = BTreeMap::new();
        let subdir = self.relative(&start);
        listings.insert(
            subdir.clone(),
            DirListing {
                root: subdir,
                ..DirListing::default()
            },
        );

        let filters = &self.filters;
        let entries = walk.into_iter().filter_entry(|entry| {
            !entry.file_type().is_dir() || filters.accepts_dir(&entry.file_name().to_string_lossy())
        });

        for entry in entries {
            let entry = entry?;
            let rel = self.relative(entry.path());
            let name = basename(&rel).to_string();
            let parent = rel
                .rsplit_once('/')
                .map(|(p, _)| p.to_string())
                .unwrap_or_default();

            if entry.file_type().is_dir() {
                if let Some(listing) = listings.get_mut(&parent) {
                    listing.dirs.push(name);
                }
                // Directories at the depth limit are listed by their parent only.
                if max_depth.map_or(true, |max| entry.depth() < max) {
                    listings.insert(
                        rel.clone(),
                        DirListing {
                            root: rel,
                            ..DirListing::default()
                        },
                    );
                }
            } else if self.filters.accepts_file(&name) {
                let size = entry
                    .metadata()
                    .map_err(WalkerError::from)?
                    .len();
                if let Some(listing) = listings.get_mut(&parent) {
                    listing.files.push(FileInfo { name, size });
                }
            }
        }

        Ok(listings.into_values().collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, WalkerError> {
        let full = native_path(&self.root, path);
        let file = File::open(&full).map_err(|e| WalkerError::io(combine("", path), e))?;
        Ok(Box::new(file))
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_walk_one_level_and_unlimited() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("s1/ses1")).unwrap();
        fs::write(dir.path().join("top.txt"), b"t").unwrap();
        fs::write(dir.path().join("s1/a.dat"), b"aa").unwrap();
        fs::write(dir.path().join("s1/ses1/b.dat"), b"bbb").unwrap();

        let walker = LocalWalker::new(dir.path(), WalkFilters::default());

        let top = walker.walk("", Some(1)).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].root, "");
        assert_eq!(top[0].dirs, vec!["s1"]);
        assert_eq!(top[0].files[0].name, "top.txt");

        let all = walker.walk("s1", None).unwrap();
        let roots: Vec<&str> = all.iter().map(|l| l.root.as_str()).collect();
        assert_eq!(roots, vec!["s1", "s1/ses1"]);
        assert_eq!(all[1].files, vec![FileInfo { name: "b.dat".into(), size: 3 }]);

        let mut contents = String::new();
        walker.open("s1/ses1/b.dat").unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "bbb");
    }

    #[test]
    fn test_walk_applies_filters() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".cache")).unwrap();
        fs::write(dir.path().join("keep.dat"), b"k").unwrap();
        fs::write(dir.path().join("drop.tmp"), b"d").unwrap();

        let filters =
            WalkFilters::new(&[], &["*.tmp".to_string()], &[".cache".to_string()]).unwrap();
        let walker = LocalWalker::new(dir.path(), filters);
        let listing = walker.walk("", None).unwrap();

        assert_eq!(listing.len(), 1);
        assert!(listing[0].dirs.is_empty());
        assert_eq!(listing[0].files.len(), 1);
        assert_eq!(listing[0].files[0].name, "keep.dat");
    }

    #[test]
    fn test_missing_subdir() {
        let dir = tempdir().unwrap();
        let walker = LocalWalker::new(dir.path(), WalkFilters::default());
        assert!(matches!(
            walker.walk("nope", Some(1)),
            Err(WalkerError::NotFound(_))
        ));
    }
}
