use std::collections::{BTreeMap, HashMap};

use memosync_core::Item;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::change_log::{ChangeLog, ChangeLogError};
use super::lock::{LockGuard, LockSet};
use super::now_millis;
use crate::provider::{ProviderError, RemoteProvider};
use crate::vault::{StatTimes, Vault, VaultError, VaultFile};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("change log error: {0}")]
    ChangeLog(#[from] ChangeLogError),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("remote listing failed: {0}")]
    Listing(#[source] ProviderError),
    #[error("remote error for {key}: {source}")]
    Remote {
        key: String,
        #[source]
        source: ProviderError,
    },
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("remote session expired, sign in again")]
    SessionExpired,
    #[error("remote folder not found: {0}")]
    FolderNotFound(String),
    #[error("a sync pass is already running")]
    Busy,
}

/// Progress of the current or most recent pass.
///
/// `Idle` only holds until the first pass starts. `Done` and `Failed` report the outcome
/// of the last pass and stay published until the next one begins with `ListingRemote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    Idle,
    ListingRemote,
    ReconcilingDownloads,
    UploadingLocal,
    Done,
    Failed,
}

/// Counters for one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub downloaded: usize,
    pub overwritten: usize,
    pub deleted_local: usize,
    pub uploaded: usize,
    pub deleted_remote: usize,
    /// Remote items left alone because a pending local change is at least as new.
    pub skipped: usize,
    /// Uploads or deletes the remote answered with a refusal.
    pub rejected: usize,
}

impl PassReport {
    pub fn mutations(&self) -> usize {
        self.downloaded + self.overwritten + self.deleted_local + self.uploaded + self.deleted_remote
    }
}

/// Two-pass reconciler between the vault, the change log and a remote snapshot.
pub struct SyncEngine {
    change_log: ChangeLog,
    vault: Vault,
    locks: LockSet,
    phase: watch::Sender<PassPhase>,
}

impl SyncEngine {
    pub fn new(change_log: ChangeLog, vault: Vault, locks: LockSet) -> Self {
        let (phase, _) = watch::channel(PassPhase::Idle);
        Self {
            change_log,
            vault,
            locks,
            phase,
        }
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn locks(&self) -> &LockSet {
        &self.locks
    }

    pub fn phase(&self) -> PassPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<PassPhase> {
        self.phase.subscribe()
    }

    /// Runs one full pass. On failure every change-log record that was not acted on is
    /// put back, and nothing already applied is rolled back.
    pub async fn run_pass(&self, remote: &mut dyn RemoteProvider) -> Result<PassReport, SyncError> {
        let result = self.run_pass_inner(remote).await;
        match &result {
            Ok(report) => {
                info!(
                    downloaded = report.downloaded,
                    overwritten = report.overwritten,
                    deleted_local = report.deleted_local,
                    uploaded = report.uploaded,
                    deleted_remote = report.deleted_remote,
                    skipped = report.skipped,
                    rejected = report.rejected,
                    "sync pass finished"
                );
                self.phase.send_replace(PassPhase::Done);
            }
            Err(err) => {
                warn!(error = %err, "sync pass failed");
                self.phase.send_replace(PassPhase::Failed);
            }
        }
        result
    }

    async fn run_pass_inner(
        &self,
        remote: &mut dyn RemoteProvider,
    ) -> Result<PassReport, SyncError> {
        self.change_log.set_last_sync_time(now_millis()).await?;

        // Listing goes first so a failed listing leaves the change log untouched.
        self.phase.send_replace(PassPhase::ListingRemote);
        let snapshot = remote.fetch_item_list().await.map_err(SyncError::Listing)?;
        let snapshot = latest_by_key(snapshot);
        debug!(remote_items = snapshot.len(), "fetched remote snapshot");

        let mut working = self.change_log.drain_all().await?;
        let mut held = Vec::new();
        let mut report = PassReport::default();

        let result = self
            .reconcile(remote, &snapshot, &mut working, &mut held, &mut report)
            .await;

        if result.is_err() && !working.is_empty() {
            match self.change_log.restore_unprocessed(working.values()).await {
                Ok(restored) => warn!(restored, "kept unprocessed local changes for next pass"),
                Err(err) => error!(error = %err, "failed to restore unprocessed local changes"),
            }
        }
        drop(held);
        result?;

        self.change_log.set_last_sync_time(now_millis()).await?;
        Ok(report)
    }

    async fn reconcile(
        &self,
        remote: &mut dyn RemoteProvider,
        snapshot: &[Item],
        working: &mut BTreeMap<String, Item>,
        held: &mut Vec<LockGuard>,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        self.phase.send_replace(PassPhase::ReconcilingDownloads);
        for remote_item in snapshot {
            if let Some(local) = working.get(&remote_item.key) {
                if local.m_time >= remote_item.m_time {
                    report.skipped += 1;
                    continue;
                }
                debug!(key = %remote_item.key, "remote change is newer, dropping local record");
                working.remove(&remote_item.key);
            }
            self.apply_remote(remote, remote_item, held, report).await?;
        }

        self.phase.send_replace(PassPhase::UploadingLocal);
        while let Some((key, local)) = working.pop_first() {
            if let Err(err) = self.push_local(remote, &local, report).await {
                working.insert(key, local);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn apply_remote(
        &self,
        remote: &mut dyn RemoteProvider,
        remote_item: &Item,
        held: &mut Vec<LockGuard>,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        let key = remote_item.key.as_str();
        if let Err(err) = self.vault.path_for(key) {
            warn!(key, error = %err, "ignoring remote item with unusable key");
            return Ok(());
        }

        match self.vault.get_file_by_path(key).await? {
            Some(file) => {
                // Local copy is as new as the remote one (also covers remote deletes).
                if file.stat.m_time >= remote_item.m_time {
                    return Ok(());
                }
                if remote_item.is_deleted() {
                    held.push(self.locks.hold(key));
                    self.vault.delete(&file).await?;
                    debug!(key, "deleted local file removed remotely");
                    report.deleted_local += 1;
                    return Ok(());
                }
                let Some(data) = download(remote, key).await? else {
                    return Ok(());
                };
                held.push(self.locks.hold(key));
                self.overwrite(&file, &data, remote_item).await?;
                report.overwritten += 1;
            }
            None => {
                if remote_item.is_deleted() {
                    return Ok(());
                }
                let Some(data) = download(remote, key).await? else {
                    return Ok(());
                };
                held.push(self.locks.hold(key));
                self.vault
                    .create_binary(key, &data, times_of(remote_item))
                    .await?;
                debug!(key, "created local file from remote");
                report.downloaded += 1;
            }
        }
        Ok(())
    }

    async fn overwrite(
        &self,
        file: &VaultFile,
        data: &[u8],
        remote_item: &Item,
    ) -> Result<(), SyncError> {
        self.vault
            .modify_binary(file, data, times_of(remote_item))
            .await?;
        debug!(key = %file.key, "overwrote local file with remote content");
        Ok(())
    }

    async fn push_local(
        &self,
        remote: &mut dyn RemoteProvider,
        local: &Item,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        let key = local.key.as_str();
        if local.is_deleted() {
            let accepted = remote
                .delete_file(local)
                .await
                .map_err(|source| remote_error(key, source))?;
            if accepted {
                debug!(key, "propagated local delete");
                report.deleted_remote += 1;
            } else {
                warn!(key, "remote refused delete");
                report.rejected += 1;
            }
            return Ok(());
        }

        let Some(file) = self.vault.get_file_by_path(key).await? else {
            debug!(key, "local file is gone, skipping upload");
            return Ok(());
        };
        let data = self.vault.read_binary(&file).await?;
        let accepted = remote
            .upload_file(local, &data)
            .await
            .map_err(|source| remote_error(key, source))?;
        if accepted {
            debug!(key, bytes = data.len(), "uploaded local change");
            report.uploaded += 1;
        } else {
            warn!(key, "remote refused upload");
            report.rejected += 1;
        }
        Ok(())
    }
}

async fn download(
    remote: &mut dyn RemoteProvider,
    key: &str,
) -> Result<Option<Vec<u8>>, SyncError> {
    let data = remote
        .download_file(key)
        .await
        .map_err(|source| remote_error(key, source))?;
    if data.is_none() {
        debug!(key, "remote returned no content");
    }
    Ok(data)
}

fn remote_error(key: &str, source: ProviderError) -> SyncError {
    SyncError::Remote {
        key: key.to_string(),
        source,
    }
}

fn times_of(item: &Item) -> StatTimes {
    StatTimes {
        c_time: item.c_time,
        m_time: item.m_time,
    }
}

/// Collapses duplicate keys, keeping the last entry in the first entry's position.
fn latest_by_key(items: Vec<Item>) -> Vec<Item> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Item> = Vec::with_capacity(items.len());
    for item in items {
        match positions.get(&item.key) {
            Some(&index) => out[index] = item,
            None => {
                positions.insert(item.key.clone(), out.len());
                out.push(item);
            }
        }
    }
    out
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;
