//! Local filesystem object store
//!
//! Keys map to paths below a root directory. Writes go to a uniquely named
//! temporary file in the destination directory and are renamed into place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::ObjectStore;
use crate::error::{BspError, Result};

const TEMP_SUFFIX: &str = ".tmp";

/// Object store rooted at a directory
pub struct LocalObjectStore {
    root: PathBuf,
}

fn io_error(op: &str, key: &str, e: std::io::Error) -> BspError {
    BspError::StorageError {
        message: format!("{} failed for {}: {}", op, key, e),
    }
}

impl LocalObjectStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error("Create root", &root.display().to_string(), e))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = key.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|part| part == "..") {
            return Err(BspError::StorageError {
                message: format!("Invalid object key '{}'", key),
            });
        }
        Ok(self.root.join(relative))
    }

    async fn collect_keys(&self, dir: PathBuf, keys: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("List", &dir.display().to_string(), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("List", &dir.display().to_string(), e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error("Stat", &path.display().to_string(), e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if !key.ends_with(TEMP_SUFFIX) {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get_object(&self, key: &str) -> Result<Bytes> {
        match tokio::fs::read(self.path_for(key)?).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BspError::ObjectNotFound { key: key.into() })
            }
            Err(e) => Err(io_error("Read", key, e)),
        }
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("Create directory", key, e))?;
        }
        let temp = target.with_file_name(format!(
            "{}.{}{}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            uuid::Uuid::new_v4(),
            TEMP_SUFFIX
        ));
        tokio::fs::write(&temp, &data)
            .await
            .map_err(|e| io_error("Write", key, e))?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error("Rename", key, e));
        }
        debug!("Wrote {} ({} bytes)", target.display(), data.len());
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("Delete", key, e)),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(self.root.clone(), &mut keys).await?;
        let prefix = prefix.trim_start_matches('/');
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        tokio::fs::try_exists(self.path_for(key)?)
            .await
            .map_err(|e| io_error("Stat", key, e))
    }
}
