use std::fs::{FileTimes, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid vault key: {0:?}")]
    InvalidKey(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// File timestamps and size, in Unix milliseconds and bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub c_time: i64,
    pub m_time: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatTimes {
    pub c_time: i64,
    pub m_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultFile {
    pub key: String,
    pub path: PathBuf,
    pub stat: FileStat,
}

/// Directory-backed local file store. Keys are `/`-separated paths relative to the root.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, VaultError> {
        if key.trim().is_empty() {
            return Err(VaultError::InvalidKey(key.to_string()));
        }

        let mut out = self.root.clone();
        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => continue,
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(VaultError::InvalidKey(key.to_string()));
                }
            }
        }
        if out == self.root {
            return Err(VaultError::InvalidKey(key.to_string()));
        }
        Ok(out)
    }

    /// Maps a path under the root back to its key. Hidden entries are not tracked.
    pub fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            let Component::Normal(part) = component else {
                return None;
            };
            let part = part.to_str()?;
            if part.starts_with('.') {
                return None;
            }
            parts.push(part);
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    pub async fn get_file_by_path(&self, key: &str) -> Result<Option<VaultFile>, VaultError> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(VaultFile {
                key: key.to_string(),
                path,
                stat: stat_from_metadata(&meta),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn read_binary(&self, file: &VaultFile) -> Result<Vec<u8>, VaultError> {
        Ok(tokio::fs::read(&file.path).await?)
    }

    pub async fn create_binary(
        &self,
        key: &str,
        data: &[u8],
        times: StatTimes,
    ) -> Result<VaultFile, VaultError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(VaultError::AlreadyExists(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let stat = write_with_times(file, data, times).await?;
        Ok(VaultFile {
            key: key.to_string(),
            path,
            stat,
        })
    }

    pub async fn modify_binary(
        &self,
        file: &VaultFile,
        data: &[u8],
        times: StatTimes,
    ) -> Result<VaultFile, VaultError> {
        let handle = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&file.path)
            .await?;
        let stat = write_with_times(handle, data, times).await?;
        Ok(VaultFile {
            key: file.key.clone(),
            path: file.path.clone(),
            stat,
        })
    }

    pub async fn delete(&self, file: &VaultFile) -> Result<(), VaultError> {
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_files(&self) -> Result<Vec<VaultFile>, VaultError> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(path);
                } else if meta.is_file() {
                    out.push(VaultFile {
                        key,
                        path,
                        stat: stat_from_metadata(&meta),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

async fn write_with_times(
    mut file: tokio::fs::File,
    data: &[u8],
    times: StatTimes,
) -> Result<FileStat, VaultError> {
    file.write_all(data).await?;
    file.flush().await?;
    let file = file.into_std().await;
    file.set_times(FileTimes::new().set_modified(system_time_from_millis(times.m_time)))?;
    let meta = file.metadata()?;
    let mut stat = stat_from_metadata(&meta);
    // Birth time cannot be set on most platforms; report the requested one.
    stat.c_time = times.c_time;
    Ok(stat)
}

pub fn stat_from_metadata(meta: &Metadata) -> FileStat {
    let m_time = meta.modified().map(millis_since_epoch).unwrap_or_default();
    let c_time = meta.created().map(millis_since_epoch).unwrap_or(m_time);
    FileStat {
        c_time,
        m_time,
        size: meta.len(),
    }
}

fn millis_since_epoch(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

fn system_time_from_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}
