use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use memosync_core::{Item, ItemStatus};
use thiserror::Error;
use tracing::{debug, trace};

use super::change_log::{ChangeLog, ChangeLogError};
use super::lock::LockSet;
use super::now_millis;
use crate::vault::{FileStat, Vault, VaultError};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("change log error: {0}")]
    ChangeLog(#[from] ChangeLogError),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
}

/// Filesystem notification for a path inside (or moving across) the vault root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    Create(PathBuf),
    Modify(PathBuf),
    Delete(PathBuf),
    Rename { from: PathBuf, to: PathBuf },
}

/// Turns vault notifications into change-log records.
///
/// Deleted files can no longer be stat'ed, so the last known stat of every file is
/// cached to fill in the delete record. Known folders are tracked too: moving or
/// removing a folder is reported once for the folder, not per file inside it.
pub struct EventCapture {
    vault: Vault,
    change_log: ChangeLog,
    locks: LockSet,
    stats: HashMap<String, FileStat>,
    folders: HashSet<String>,
}

impl EventCapture {
    pub fn new(vault: Vault, change_log: ChangeLog, locks: LockSet) -> Self {
        Self {
            vault,
            change_log,
            locks,
            stats: HashMap::new(),
            folders: HashSet::new(),
        }
    }

    /// Loads the stat cache from the current vault contents.
    pub async fn seed(&mut self) -> Result<usize, CaptureError> {
        self.stats.clear();
        self.folders.clear();
        for file in self.vault.list_files().await? {
            self.remember(file.key, file.stat);
        }
        Ok(self.stats.len())
    }

    /// Records the event, returning how many change records were written.
    pub async fn handle(&mut self, event: VaultEvent) -> Result<usize, CaptureError> {
        match event {
            VaultEvent::Create(path) => self.on_write(path, ItemStatus::Created).await,
            VaultEvent::Modify(path) => self.on_write(path, ItemStatus::Updated).await,
            VaultEvent::Delete(path) => match self.vault.key_for(&path) {
                Some(key) => self.on_delete(key).await,
                None => Ok(0),
            },
            VaultEvent::Rename { from, to } => self.on_rename(from, to).await,
        }
    }

    async fn on_write(&mut self, path: PathBuf, status: ItemStatus) -> Result<usize, CaptureError> {
        let Some(key) = self.vault.key_for(&path) else {
            return Ok(0);
        };
        if self.locks.is_locked(&key) {
            trace!(key, "ignoring event for locked key");
            return Ok(0);
        }
        let Some(file) = self.vault.get_file_by_path(&key).await? else {
            if tokio::fs::metadata(&path).await.is_ok_and(|meta| meta.is_dir()) {
                if status == ItemStatus::Created {
                    return self.on_folder_added(&key).await;
                }
                return Ok(0);
            }
            // Gone before we looked: a known file means it was moved away.
            if self.stats.contains_key(&key) {
                return self.on_delete(key).await;
            }
            return Ok(0);
        };

        self.remember(key.clone(), file.stat);
        self.record(item_from_stat(&key, status, file.stat)).await?;
        Ok(1)
    }

    /// A folder that shows up in one event (moved in, or copied) brings its files with it.
    async fn on_folder_added(&mut self, folder: &str) -> Result<usize, CaptureError> {
        let prefix = format!("{folder}/");
        let mut written = 0;
        for file in self.vault.list_files().await? {
            if !file.key.starts_with(&prefix)
                || self.stats.contains_key(&file.key)
                || self.locks.is_locked(&file.key)
            {
                continue;
            }
            self.remember(file.key.clone(), file.stat);
            self.record(item_from_stat(&file.key, ItemStatus::Created, file.stat))
                .await?;
            written += 1;
        }
        self.remember_folder(folder);
        Ok(written)
    }

    async fn on_delete(&mut self, key: String) -> Result<usize, CaptureError> {
        if self.locks.is_locked(&key) {
            trace!(key, "ignoring delete for locked key");
            return Ok(0);
        }
        if let Some(stat) = self.stats.remove(&key) {
            return self.record_delete(&key, stat).await;
        }
        if self.folders.contains(&key) {
            return self.on_folder_removed(&key).await;
        }
        self.record_delete(&key, FileStat::default()).await
    }

    /// The folder left the vault. Each cached file under it that is really gone gets a
    /// delete record; files removed one by one beforehand were recorded already.
    async fn on_folder_removed(&mut self, folder: &str) -> Result<usize, CaptureError> {
        let mut written = 0;
        for key in self.files_under(folder) {
            if self.locks.is_locked(&key) || self.vault.get_file_by_path(&key).await?.is_some() {
                continue;
            }
            if let Some(stat) = self.stats.remove(&key) {
                written += self.record_delete(&key, stat).await?;
            }
        }
        if self.files_under(folder).is_empty() {
            self.forget_folder(folder);
        }
        Ok(written)
    }

    async fn record_delete(&self, key: &str, stat: FileStat) -> Result<usize, CaptureError> {
        let mut item = item_from_stat(key, ItemStatus::Deleted, stat);
        item.m_time = now_millis();
        self.record(item).await?;
        Ok(1)
    }

    async fn on_rename(&mut self, from: PathBuf, to: PathBuf) -> Result<usize, CaptureError> {
        let (from_key, to_key) = (self.vault.key_for(&from), self.vault.key_for(&to));
        let (from_key, to_key) = match (from_key, to_key) {
            (Some(from_key), Some(to_key)) => (from_key, to_key),
            (None, Some(_)) => return self.on_write(to, ItemStatus::Created).await,
            (Some(from_key), None) => return self.on_delete(from_key).await,
            (None, None) => return Ok(0),
        };
        if self.folders.contains(&from_key) {
            return self.on_folder_renamed(&from_key, &to_key).await;
        }
        self.rename_file(from_key, to_key).await
    }

    async fn rename_file(&mut self, from_key: String, to_key: String) -> Result<usize, CaptureError> {
        if self.locks.is_locked(&from_key) || self.locks.is_locked(&to_key) {
            trace!(from = %from_key, to = %to_key, "ignoring rename of locked key");
            return Ok(0);
        }
        let Some(file) = self.vault.get_file_by_path(&to_key).await? else {
            return Ok(0);
        };

        self.stats.remove(&from_key);
        self.remember(to_key.clone(), file.stat);
        let mut removed = item_from_stat(&from_key, ItemStatus::Deleted, file.stat);
        removed.m_time = now_millis();
        self.record(removed).await?;
        self.record(item_from_stat(&to_key, ItemStatus::Created, file.stat))
            .await?;
        Ok(2)
    }

    /// Every cached file under `from` moves to the same relative key under `to`.
    async fn on_folder_renamed(&mut self, from: &str, to: &str) -> Result<usize, CaptureError> {
        let mut written = 0;
        for old_key in self.files_under(from) {
            let new_key = format!("{to}{}", &old_key[from.len()..]);
            written += self.rename_file(old_key, new_key).await?;
        }
        if self.files_under(from).is_empty() {
            self.forget_folder(from);
        }
        self.remember_folder(to);
        Ok(written)
    }

    fn files_under(&self, folder: &str) -> Vec<String> {
        let prefix = format!("{folder}/");
        let mut keys: Vec<String> = self
            .stats
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn forget_folder(&mut self, folder: &str) {
        let prefix = format!("{folder}/");
        self.folders
            .retain(|known| known != folder && !known.starts_with(&prefix));
    }

    fn remember(&mut self, key: String, stat: FileStat) {
        if let Some((parent, _)) = key.rsplit_once('/') {
            self.remember_folder(parent);
        }
        self.stats.insert(key, stat);
    }

    /// Marks `folder` and all of its parents as known.
    fn remember_folder(&mut self, folder: &str) {
        let mut current = folder;
        loop {
            self.folders.insert(current.to_string());
            match current.rsplit_once('/') {
                Some((parent, _)) => current = parent,
                None => break,
            }
        }
    }

    async fn record(&self, item: Item) -> Result<(), CaptureError> {
        debug!(key = %item.key, status = item.status.as_code(), "recorded local change");
        self.change_log.record_change(&item).await?;
        Ok(())
    }
}

fn item_from_stat(key: &str, status: ItemStatus, stat: FileStat) -> Item {
    Item::new(key, status, stat.c_time, stat.m_time).with_size(stat.size)
}
