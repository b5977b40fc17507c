//! Uploader writing into a local directory tree.
//!
//! Each container maps to a directory under the destination root named by
//! its label path, e.g. `<root>/group/project/subject/session`.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{check_filename, UploadError, UploadPayload, Uploader};
use crate::models::{ContainerLabels, ContainerRef};

pub struct LocalUploader {
    root: PathBuf,
}

impl LocalUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &ContainerRef) -> Result<PathBuf, UploadError> {
        let mut dir = self.root.clone();
        for part in container.id.split('/') {
            check_filename(part)?;
            dir.push(part);
        }
        Ok(dir)
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> UploadError + '_ {
    move |source| UploadError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl Uploader for LocalUploader {
    async fn resolve(&self, labels: &ContainerLabels) -> Result<Option<ContainerRef>, UploadError> {
        Ok(labels.deepest().map(|(container_type, label)| ContainerRef {
            container_type,
            id: labels.path(),
            label: label.to_string(),
        }))
    }

    async fn upload(
        &self,
        container: &ContainerRef,
        filename: &str,
        payload: UploadPayload,
        metadata: &serde_json::Value,
    ) -> Result<(), UploadError> {
        check_filename(filename)?;
        let dir = self.container_dir(container)?;
        let target = dir.join(filename);
        let meta = if metadata.is_null() {
            None
        } else {
            Some(serde_json::to_vec_pretty(metadata).map_err(|e| {
                UploadError::Rejected(format!("metadata is not serializable: {e}"))
            })?)
        };

        debug!("Writing {} ({:?})", target.display(), payload);
        tokio::task::spawn_blocking(move || -> Result<(), UploadError> {
            fs::create_dir_all(&dir).map_err(io_error(&dir))?;
            match payload {
                UploadPayload::Bytes(bytes) => {
                    fs::write(&target, bytes).map_err(io_error(&target))?;
                }
                UploadPayload::Stream { mut reader, .. } => {
                    let file = File::create(&target).map_err(io_error(&target))?;
                    let mut writer = BufWriter::new(file);
                    io::copy(&mut reader, &mut writer).map_err(io_error(&target))?;
                }
            }
            if let Some(meta) = meta {
                let mut meta_path = target.clone().into_os_string();
                meta_path.push(".meta.json");
                let meta_path = PathBuf::from(meta_path);
                fs::write(&meta_path, meta).map_err(io_error(&meta_path))?;
            }
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContainerType;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_resolve_and_upload() {
        let dir = tempdir().unwrap();
        let uploader = LocalUploader::new(dir.path());

        let mut labels = ContainerLabels::default();
        assert!(uploader.resolve(&labels).await.unwrap().is_none());
        labels.set(ContainerType::Project, "p");
        labels.set(ContainerType::Subject, "s1");
        let container = uploader.resolve(&labels).await.unwrap().unwrap();
        assert_eq!(container.container_type, ContainerType::Subject);
        assert_eq!(container.id, "p/s1");

        uploader
            .upload(&container, "a.dat", UploadPayload::Bytes(b"aa".to_vec()), &serde_json::Value::Null)
            .await
            .unwrap();
        let stream = UploadPayload::Stream {
            reader: Box::new(Cursor::new(b"bbb".to_vec())),
            size: 3,
        };
        uploader
            .upload(&container, "b.dat", stream, &serde_json::json!({"k": "v"}))
            .await
            .unwrap();

        assert_eq!(fs::read(dir.path().join("p/s1/a.dat")).unwrap(), b"aa");
        assert_eq!(fs::read(dir.path().join("p/s1/b.dat")).unwrap(), b"bbb");
        assert!(dir.path().join("p/s1/b.dat.meta.json").exists());

        let err = uploader
            .upload(&container, "../x", UploadPayload::Bytes(vec![]), &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidName(_)));
    }
}
