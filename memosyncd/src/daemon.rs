use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use memosync_core::Item;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::provider::{Provider, RemoteProvider, SessionRefreshed};
use crate::sync::change_log::ChangeLog;
use crate::sync::event_capture::EventCapture;
use crate::sync::local_watcher::start_notify_watcher;
use crate::sync::lock::LockSet;
use crate::sync::now_millis;
use crate::sync::reconciler::{PassReport, SyncEngine, SyncError};
use crate::sync::scheduler::{PassGate, SchedulePolicy};
use crate::vault::Vault;

/// Pending work and the last pass start, for `--status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub pending: Vec<Item>,
    pub last_sync_time: Option<i64>,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    gate: PassGate,
    trigger_tx: mpsc::UnboundedSender<()>,
    trigger_rx: mpsc::UnboundedReceiver<()>,
    edit_tx: mpsc::UnboundedSender<i64>,
    edit_rx: mpsc::UnboundedReceiver<i64>,
}

/// Pause before retrying a due pass that found another pass holding the gate.
const BUSY_RETRY: Duration = Duration::from_secs(1);

impl DaemonRuntime {
    pub async fn bootstrap(mut config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.vault_dir)
            .await
            .with_context(|| format!("failed to create vault at {:?}", config.vault_dir))?;
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data dir at {:?}", config.data_dir))?;
        apply_saved_session(&mut config);

        let change_log = ChangeLog::open(&config.db_path)
            .await
            .context("failed to open change log")?;
        let engine = Arc::new(SyncEngine::new(
            change_log,
            Vault::new(&config.vault_dir),
            LockSet::new(config.lock_settle),
        ));
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (edit_tx, edit_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            engine,
            gate: PassGate::new(),
            trigger_tx,
            trigger_rx,
            edit_tx,
            edit_rx,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Sender that asks the running daemon for an immediate pass.
    pub fn trigger_handle(&self) -> mpsc::UnboundedSender<()> {
        self.trigger_tx.clone()
    }

    pub async fn status(&self) -> anyhow::Result<DaemonStatus> {
        let change_log = self.engine.change_log();
        Ok(DaemonStatus {
            pending: change_log.pending().await?,
            last_sync_time: change_log.last_sync_time().await?,
        })
    }

    /// Runs one pass now, unless another one is in flight.
    pub async fn sync_once(&self) -> Result<PassReport, SyncError> {
        let Some(_ticket) = self.gate.try_begin() else {
            return Err(SyncError::Busy);
        };
        run_sync(&self.config, &self.engine).await
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    /// Scheduling loop: a pass is due `sync_interval` after the last one started, or
    /// `debounce` after a local edit. The last start survives restarts in the change log.
    pub async fn run_until<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        info!(
            vault = %self.config.vault_dir.display(),
            provider = ?self.config.provider,
            folder = %self.config.folder_name,
            watcher = self.config.enable_watcher,
            "memosyncd started"
        );

        let capture_handle = if self.config.enable_watcher {
            self.spawn_capture(self.edit_tx.clone())
        } else {
            None
        };

        let policy = SchedulePolicy::new(self.config.sync_interval, self.config.debounce);
        let mut last_sync = self
            .engine
            .change_log()
            .last_sync_time()
            .await
            .context("failed to read last sync time")?;
        let mut last_edit: Option<i64> = None;
        let mut busy_until: Option<i64> = None;
        let mut pass_handle: Option<JoinHandle<()>> = None;
        tokio::pin!(shutdown);

        loop {
            let now = now_millis();
            let mut delay = policy.delay_until_next(now, last_sync, last_edit);
            if let Some(until) = busy_until {
                delay = delay.max(Duration::from_millis(until.saturating_sub(now).max(0) as u64));
            }
            tokio::select! {
                _ = tokio::time::sleep(delay), if pass_handle.is_none() => {
                    match start_pass(&self.gate, &self.config, &self.engine) {
                        Some(handle) => {
                            last_sync = Some(now_millis());
                            last_edit = None;
                            busy_until = None;
                            pass_handle = Some(handle);
                        }
                        None => busy_until = Some(now_millis().saturating_add(millis(BUSY_RETRY))),
                    }
                }
                _ = wait_for_pass(&mut pass_handle), if pass_handle.is_some() => {
                    pass_handle = None;
                }
                Some(edited_at) = self.edit_rx.recv() => {
                    last_edit = Some(edited_at);
                }
                Some(()) = self.trigger_rx.recv() => {
                    debug!("manual sync requested");
                    if pass_handle.is_none()
                        && let Some(handle) = start_pass(&self.gate, &self.config, &self.engine)
                    {
                        last_sync = Some(now_millis());
                        last_edit = None;
                        busy_until = None;
                        pass_handle = Some(handle);
                    }
                }
                result = &mut shutdown => {
                    result.context("failed to listen for shutdown signal")?;
                    break;
                }
            }
        }

        info!("shutting down");
        if let Some(handle) = capture_handle {
            handle.abort();
        }
        if let Some(handle) = pass_handle
            && !handle.is_finished()
        {
            info!("waiting for the running sync pass");
            let _ = handle.await;
        }
        Ok(())
    }

    fn spawn_capture(&self, edit_tx: mpsc::UnboundedSender<i64>) -> Option<JoinHandle<()>> {
        let (watcher, mut events) = match start_notify_watcher(&self.config.vault_dir) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(error = %err, "failed to start vault watcher, local edits are not recorded");
                return None;
            }
        };
        let mut capture = EventCapture::new(
            self.engine.vault().clone(),
            self.engine.change_log().clone(),
            self.engine.locks().clone(),
        );
        Some(tokio::spawn(async move {
            let _watcher = watcher;
            match capture.seed().await {
                Ok(known) => debug!(known, "seeded vault stat cache"),
                Err(err) => warn!(error = %err, "failed to scan vault"),
            }
            while let Some(event) = events.recv().await {
                match capture.handle(event).await {
                    Ok(0) => {}
                    Ok(_) => {
                        let _ = edit_tx.send(now_millis());
                    }
                    Err(err) => warn!(error = %err, "failed to record local change"),
                }
            }
        }))
    }
}

async fn wait_for_pass(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if let Err(err) = handle.await {
            warn!(error = %err, "sync pass task ended abnormally");
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn start_pass(
    gate: &PassGate,
    config: &DaemonConfig,
    engine: &Arc<SyncEngine>,
) -> Option<JoinHandle<()>> {
    let Some(ticket) = gate.try_begin() else {
        debug!("sync pass already running, trigger dropped");
        return None;
    };
    let config = config.clone();
    let engine = Arc::clone(engine);
    Some(tokio::spawn(async move {
        let _ticket = ticket;
        let _ = run_sync(&config, &engine).await;
    }))
}

/// One complete sync: provider session, group selection, reconciliation, close.
pub async fn run_sync(config: &DaemonConfig, engine: &SyncEngine) -> Result<PassReport, SyncError> {
    let started = Instant::now();
    let saver = session_saver(config.session_path(), config.session.clone());
    let mut provider = Provider::from_config(config, Some(saver))?;
    let result = sync_with_provider(&mut provider, &config.folder_name, engine).await;
    if let Err(err) = provider.close().await {
        warn!(error = %err, "failed to close provider");
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(report) => info!(elapsed_ms, changes = report.mutations(), "sync complete"),
        Err(SyncError::SessionExpired) => {
            warn!("memo service session expired, update MEMOSYNC_NID_AUT and MEMOSYNC_NID_SES")
        }
        Err(SyncError::FolderNotFound(name)) => {
            warn!(folder = %name, "remote folder not found, create it or set MEMOSYNC_FOLDER_NAME")
        }
        Err(err) => error!(elapsed_ms, error = %err, "sync failed"),
    }
    result
}

/// Opens the remote, selects the group named `folder_name` and runs one pass.
/// The caller owns closing the provider.
pub async fn sync_with_provider(
    remote: &mut dyn RemoteProvider,
    folder_name: &str,
    engine: &SyncEngine,
) -> Result<PassReport, SyncError> {
    remote.open().await?;
    if !remote.is_ready().await? {
        return Err(SyncError::SessionExpired);
    }
    let group = remote
        .fetch_group_list()
        .await?
        .into_iter()
        .find(|group| group.name == folder_name)
        .ok_or_else(|| SyncError::FolderNotFound(folder_name.to_string()))?;
    remote.set_group_id(&group.id)?;
    engine.run_pass(remote).await
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SavedSession {
    nid_aut: String,
    nid_ses: String,
}

fn load_saved_session(path: &Path) -> Option<SavedSession> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(saved) => Some(saved),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable saved session");
            None
        }
    }
}

fn store_session(path: &Path, session: &SavedSession) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(session)?;
    std::fs::write(path, bytes).with_context(|| format!("failed to write {path:?}"))?;
    Ok(())
}

/// A rotated `NID_SES` saved for the same `NID_AUT` replaces the configured one.
fn apply_saved_session(config: &mut DaemonConfig) {
    let path = config.session_path();
    let Some(session) = config.session.as_mut() else {
        return;
    };
    if let Some(saved) = load_saved_session(&path)
        && saved.nid_aut == session.nid_aut
    {
        session.nid_ses = saved.nid_ses;
    }
}

fn session_saver(
    path: PathBuf,
    session: Option<memosync_core::SessionCookies>,
) -> SessionRefreshed {
    let nid_aut = session.map(|cookies| cookies.nid_aut).unwrap_or_default();
    Box::new(move |nid_ses: &str| {
        let saved = SavedSession {
            nid_aut: nid_aut.clone(),
            nid_ses: nid_ses.to_string(),
        };
        match store_session(&path, &saved) {
            Ok(()) => debug!("saved refreshed memo session"),
            Err(err) => warn!(error = %err, "failed to save refreshed memo session"),
        }
    })
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
