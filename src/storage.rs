//! Flat named-blob store over one local directory, standing in for the
//! on-device flash filesystem. A failed mount degrades to an unmounted
//! store whose operations all report `Unavailable`; the node keeps running
//! without persistence.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy)]
pub struct StorageInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

pub struct Storage {
    root: Option<PathBuf>,
    capacity_bytes: u64,
}

impl Storage {
    /// Mounts the store at `root`, formatting once if the first attempt
    /// fails. A second failure leaves the store unmounted.
    pub fn mount(root: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        let root = root.into();
        if fs::create_dir_all(&root).is_ok() {
            info!(root = %root.display(), capacity_bytes, "storage mounted");
            return Storage {
                root: Some(root),
                capacity_bytes,
            };
        }

        warn!(root = %root.display(), "storage mount failed, formatting");
        let _ = fs::remove_dir_all(&root);
        let _ = fs::remove_file(&root);
        if fs::create_dir_all(&root).is_ok() {
            info!(root = %root.display(), capacity_bytes, "storage mounted after format");
            return Storage {
                root: Some(root),
                capacity_bytes,
            };
        }

        error!(root = %root.display(), "storage format failed, running without persistence");
        Storage {
            root: None,
            capacity_bytes,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.root.is_some()
    }

    fn root(&self) -> Result<&Path, StorageError> {
        self.root.as_deref().ok_or(StorageError::Unavailable)
    }

    /// Writes a blob, enforcing the byte quota. Overwriting reclaims the
    /// existing blob's size before the check, so a same-name rewrite never
    /// needs extra room.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let root = self.root()?;
        let path = root.join(name);

        let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let used = dir_size(root)?;
        let free = self
            .capacity_bytes
            .saturating_sub(used.saturating_sub(existing));
        let needed = data.len() as u64;
        if needed > free {
            return Err(StorageError::Full { needed, free });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(())
    }

    pub fn read(&self, name: &str) -> Result<String, StorageError> {
        let root = self.root()?;
        Ok(fs::read_to_string(root.join(name))?)
    }

    pub fn delete(&self, name: &str) -> Result<(), StorageError> {
        let root = self.root()?;
        fs::remove_file(root.join(name))?;
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        match &self.root {
            Some(root) => root.join(name).exists(),
            None => false,
        }
    }

    /// Names of blobs directly under `subdir`, sorted ascending. A missing
    /// subdir is just empty.
    pub fn list(&self, subdir: &str) -> Result<Vec<String>, StorageError> {
        let root = self.root()?;
        let dir = root.join(subdir);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn info(&self) -> Result<StorageInfo, StorageError> {
        let root = self.root()?;
        Ok(StorageInfo {
            total_bytes: self.capacity_bytes,
            used_bytes: dir_size(root)?,
        })
    }

    /// Removes every blob while keeping the store mounted.
    pub fn format(&self) -> Result<(), StorageError> {
        let root = self.root()?;
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        info!("storage formatted");
        Ok(())
    }
}

fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
