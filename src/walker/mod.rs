//! Source filesystem abstraction.
//!
//! Paths handed to and returned from a [`Walker`] are relative to the walker
//! root, use `/` separators and never start with one; the root itself is the
//! empty string.

mod archive;
mod local;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

pub use archive::ZipWalker;
pub use local::LocalWalker;

#[derive(Error, Debug)]
pub enum WalkerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

impl WalkerError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A file found during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Contents of one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirListing {
    /// Directory path relative to the walker root.
    pub root: String,
    /// Names of child directories.
    pub dirs: Vec<String>,
    /// Files directly in this directory, sorted by name.
    pub files: Vec<FileInfo>,
}

pub trait Walker: Send + Sync {
    /// List `subdir` and its descendants.
    ///
    /// `max_depth` of `Some(1)` lists `subdir` only; `None` descends without
    /// limit. Listings come back parents first.
    fn walk(&self, subdir: &str, max_depth: Option<usize>) -> Result<Vec<DirListing>, WalkerError>;

    /// Open a file for reading.
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, WalkerError>;

    /// Human readable location of the walker root.
    fn describe(&self) -> String;
}

/// Join two relative paths.
pub fn combine(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    match (base.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{name}"),
    }
}

/// `path` relative to `base`, or `path` unchanged when it is not below it.
pub fn relpath<'a>(path: &'a str, base: &str) -> &'a str {
    let base = base.trim_matches('/');
    if base.is_empty() {
        return path.trim_start_matches('/');
    }
    let path = path.trim_start_matches('/');
    match path.strip_prefix(base) {
        Some("") => "",
        Some(rest) if rest.starts_with('/') => &rest[1..],
        _ => path,
    }
}

/// Last component of a relative path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Name filters applied while walking.
#[derive(Debug, Clone, Default)]
pub struct WalkFilters {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    exclude_dirs: Option<GlobSet>,
    follow_symlinks: bool,
}

impl WalkFilters {
    pub fn new(
        include: &[String],
        exclude: &[String],
        exclude_dirs: &[String],
    ) -> Result<Self, globset::Error> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
            exclude_dirs: build_globset(exclude_dirs)?,
            follow_symlinks: false,
        })
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn follows_symlinks(&self) -> bool {
        self.follow_symlinks
    }

    pub fn accepts_file(&self, name: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(name) {
                return false;
            }
        }
        !self.exclude.as_ref().is_some_and(|set| set.is_match(name))
    }

    pub fn accepts_dir(&self, name: &str) -> bool {
        !self
            .exclude_dirs
            .as_ref()
            .is_some_and(|set| set.is_match(name))
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, globset::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build().map(Some)
}

/// Open a walker for a source folder or a zip archive.
pub fn create_walker(fs_path: &Path, filters: WalkFilters) -> Result<Arc<dyn Walker>, WalkerError> {
    if fs_path.is_dir() {
        return Ok(Arc::new(LocalWalker::new(fs_path, filters)));
    }
    let is_zip = fs_path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
    if fs_path.is_file() && is_zip {
        return Ok(Arc::new(ZipWalker::open(fs_path, filters)?));
    }
    Err(WalkerError::NotFound(fs_path.display().to_string()))
}

/// Convert a relative walker path to a native path under `root`.
pub(crate) fn native_path(root: &Path, path: &str) -> PathBuf {
    path.split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_and_relpath() {
        assert_eq!(combine("", "a.dat"), "a.dat");
        assert_eq!(combine("s1/", "a.dat"), "s1/a.dat");
        assert_eq!(combine("s1", ""), "s1");
        assert_eq!(relpath("s1/ses/a.dat", "s1"), "ses/a.dat");
        assert_eq!(relpath("s1", "s1"), "");
        assert_eq!(relpath("s10/a", "s1"), "s10/a");
        assert_eq!(basename("s1/ses/a.dat"), "a.dat");
    }

    #[test]
    fn test_filters() {
        let filters = WalkFilters::new(
            &["*.dat".to_string()],
            &["skip*".to_string()],
            &[".git".to_string()],
        )
        .unwrap();
        assert!(filters.accepts_file("a.dat"));
        assert!(!filters.accepts_file("a.txt"));
        assert!(!filters.accepts_file("skip.dat"));
        assert!(!filters.accepts_dir(".git"));
        assert!(filters.accepts_dir("subject1"));
        assert!(WalkFilters::default().accepts_file("anything"));
    }
}
