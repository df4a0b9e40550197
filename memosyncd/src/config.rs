use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use memosync_core::SessionCookies;

const DEFAULT_VAULT_DIR_NAME: &str = "Memos";
const DEFAULT_FOLDER_NAME: &str = "내 메모";
const DEFAULT_BASE_URL: &str = "https://memo.naver.com";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_DEBOUNCE_SECS: u64 = 10;
const DEFAULT_LOCK_SETTLE_MS: u64 = 1500;
const DB_FILE_NAME: &str = "changes.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Memo,
    Folder,
}

impl ProviderKind {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memo" => Ok(ProviderKind::Memo),
            "folder" => Ok(ProviderKind::Folder),
            other => anyhow::bail!("unknown provider: {other} (expected memo or folder)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub vault_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub provider: ProviderKind,
    /// Name of the remote group mirrored into the vault.
    pub folder_name: String,
    pub base_url: String,
    pub session: Option<SessionCookies>,
    pub remote_dir: Option<PathBuf>,
    pub sync_interval: Duration,
    pub debounce: Duration,
    pub lock_settle: Duration,
    pub enable_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let vault_dir = std::env::var("MEMOSYNC_VAULT_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_VAULT_DIR_NAME));
        let data_dir = std::env::var("MEMOSYNC_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_data_dir);
        let provider = match std::env::var("MEMOSYNC_PROVIDER") {
            Ok(value) => ProviderKind::parse(&value)?,
            Err(_) => ProviderKind::Memo,
        };
        let folder_name = std::env::var("MEMOSYNC_FOLDER_NAME")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FOLDER_NAME.to_string());
        let base_url =
            std::env::var("MEMOSYNC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let session = session_from_values(
            std::env::var("MEMOSYNC_NID_AUT").ok(),
            std::env::var("MEMOSYNC_NID_SES").ok(),
        );
        let remote_dir = std::env::var("MEMOSYNC_REMOTE_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home));

        Ok(Self {
            db_path: data_dir.join(DB_FILE_NAME),
            vault_dir,
            data_dir,
            provider,
            folder_name,
            base_url,
            session,
            remote_dir,
            sync_interval: Duration::from_secs(read_u64_env(
                "MEMOSYNC_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            debounce: Duration::from_secs(read_u64_env(
                "MEMOSYNC_DEBOUNCE_SECS",
                DEFAULT_DEBOUNCE_SECS,
            )),
            lock_settle: Duration::from_millis(read_u64_env(
                "MEMOSYNC_LOCK_SETTLE_MS",
                DEFAULT_LOCK_SETTLE_MS,
            )),
            enable_watcher: read_bool_env("MEMOSYNC_ENABLE_WATCHER", true),
        })
    }

    /// Where a rotated `NID_SES` cookie is kept between runs.
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }
}

fn session_from_values(nid_aut: Option<String>, nid_ses: Option<String>) -> Option<SessionCookies> {
    let nid_aut = nid_aut.filter(|value| !value.trim().is_empty())?;
    let nid_ses = nid_ses.filter(|value| !value.trim().is_empty())?;
    Some(SessionCookies { nid_aut, nid_ses })
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("memosync")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
