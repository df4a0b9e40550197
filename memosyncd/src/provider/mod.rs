//! Remote item providers behind one capability trait.

mod folder;
mod memo;

pub use folder::FolderProvider;
pub use memo::{MemoCache, MemoProvider, SessionRefreshed};

use async_trait::async_trait;
use memosync_core::{Group, Item, ItemError, MemoError};
use thiserror::Error;

use crate::config::{DaemonConfig, ProviderKind};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("memo service error: {0}")]
    Api(#[from] MemoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("invalid item payload: {0}")]
    Payload(#[from] ItemError),
    #[error("no group selected")]
    NoGroup,
    #[error("invalid group id: {0}")]
    InvalidGroup(String),
    #[error("invalid item key: {0:?}")]
    InvalidKey(String),
    #[error("missing provider setting: {0}")]
    MissingSetting(&'static str),
}

/// Item metadata plus the provider's own identifiers and cached content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderItem {
    pub item: Item,
    pub id: String,
    pub group_id: String,
    /// Encoded content; `None` when it has not been fetched yet.
    pub content: Option<String>,
}

#[async_trait]
pub trait RemoteProvider: Send {
    async fn open(&mut self) -> Result<(), ProviderError>;
    async fn close(&mut self) -> Result<(), ProviderError>;
    async fn is_ready(&mut self) -> Result<bool, ProviderError>;
    async fn fetch_group_list(&mut self) -> Result<Vec<Group>, ProviderError>;
    fn set_group_id(&mut self, group_id: &str) -> Result<(), ProviderError>;
    /// Full snapshot of the selected group.
    async fn fetch_item_list(&mut self) -> Result<Vec<Item>, ProviderError>;
    async fn fetch_item_info(&mut self, key: &str) -> Result<Option<ProviderItem>, ProviderError>;
    async fn download_file(&mut self, key: &str) -> Result<Option<Vec<u8>>, ProviderError>;
    async fn upload_file(&mut self, item: &Item, data: &[u8]) -> Result<bool, ProviderError>;
    async fn delete_file(&mut self, item: &Item) -> Result<bool, ProviderError>;
}

/// Provider variants selected by configuration.
pub enum Provider {
    Memo(MemoProvider),
    Folder(FolderProvider),
}

impl Provider {
    pub fn from_config(
        config: &DaemonConfig,
        on_session_refresh: Option<SessionRefreshed>,
    ) -> Result<Self, ProviderError> {
        match config.provider {
            ProviderKind::Memo => {
                let cookies = config
                    .session
                    .clone()
                    .ok_or(ProviderError::MissingSetting("MEMOSYNC_NID_AUT/MEMOSYNC_NID_SES"))?;
                let mut provider = MemoProvider::new(&config.base_url, cookies)?;
                if let Some(callback) = on_session_refresh {
                    provider = provider.on_session_refresh(callback);
                }
                Ok(Provider::Memo(provider))
            }
            ProviderKind::Folder => {
                let root = config
                    .remote_dir
                    .clone()
                    .ok_or(ProviderError::MissingSetting("MEMOSYNC_REMOTE_DIR"))?;
                Ok(Provider::Folder(FolderProvider::new(root)))
            }
        }
    }

    fn inner(&mut self) -> &mut dyn RemoteProvider {
        match self {
            Provider::Memo(provider) => provider,
            Provider::Folder(provider) => provider,
        }
    }
}

#[async_trait]
impl RemoteProvider for Provider {
    async fn open(&mut self) -> Result<(), ProviderError> {
        self.inner().open().await
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        self.inner().close().await
    }

    async fn is_ready(&mut self) -> Result<bool, ProviderError> {
        self.inner().is_ready().await
    }

    async fn fetch_group_list(&mut self) -> Result<Vec<Group>, ProviderError> {
        self.inner().fetch_group_list().await
    }

    fn set_group_id(&mut self, group_id: &str) -> Result<(), ProviderError> {
        self.inner().set_group_id(group_id)
    }

    async fn fetch_item_list(&mut self) -> Result<Vec<Item>, ProviderError> {
        self.inner().fetch_item_list().await
    }

    async fn fetch_item_info(&mut self, key: &str) -> Result<Option<ProviderItem>, ProviderError> {
        self.inner().fetch_item_info(key).await
    }

    async fn download_file(&mut self, key: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        self.inner().download_file(key).await
    }

    async fn upload_file(&mut self, item: &Item, data: &[u8]) -> Result<bool, ProviderError> {
        self.inner().upload_file(item, data).await
    }

    async fn delete_file(&mut self, item: &Item) -> Result<bool, ProviderError> {
        self.inner().delete_file(item).await
    }
}
