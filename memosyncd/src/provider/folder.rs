use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use memosync_core::{Group, Item, ItemStatus, MemoPayload};
use serde::{Deserialize, Serialize};

use super::{ProviderError, ProviderItem, RemoteProvider};
use crate::vault::Vault;

const MANIFEST_FILE: &str = ".memosync-manifest.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    items: BTreeMap<String, Item>,
}

/// Remote kept in a plain directory: one subdirectory per group, item content stored
/// under its key, metadata (including delete tombstones) in a per-group manifest.
pub struct FolderProvider {
    root: PathBuf,
    group: Option<String>,
}

impl FolderProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            group: None,
        }
    }

    fn group_dir(&self) -> Result<PathBuf, ProviderError> {
        let group = self.group.as_deref().ok_or(ProviderError::NoGroup)?;
        Ok(self.root.join(group))
    }

    fn content_path(&self, key: &str) -> Result<PathBuf, ProviderError> {
        Vault::new(self.group_dir()?)
            .path_for(key)
            .map_err(|_| ProviderError::InvalidKey(key.to_string()))
    }

    async fn load_manifest(&self) -> Result<Manifest, ProviderError> {
        let path = self.group_dir()?.join(MANIFEST_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn store_manifest(&self, manifest: &Manifest) -> Result<(), ProviderError> {
        let dir = self.group_dir()?;
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, ProviderError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl RemoteProvider for FolderProvider {
    async fn open(&mut self) -> Result<(), ProviderError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn is_ready(&mut self) -> Result<bool, ProviderError> {
        Ok(tokio::fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false))
    }

    async fn fetch_group_list(&mut self) -> Result<Vec<Group>, ProviderError> {
        let mut groups = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            groups.push(Group {
                id: name.clone(),
                name,
            });
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    fn set_group_id(&mut self, group_id: &str) -> Result<(), ProviderError> {
        if group_id.is_empty() || group_id.starts_with('.') || group_id.contains(['/', '\\']) {
            return Err(ProviderError::InvalidGroup(group_id.to_string()));
        }
        self.group = Some(group_id.to_string());
        Ok(())
    }

    async fn fetch_item_list(&mut self) -> Result<Vec<Item>, ProviderError> {
        Ok(self.load_manifest().await?.items.into_values().collect())
    }

    async fn fetch_item_info(&mut self, key: &str) -> Result<Option<ProviderItem>, ProviderError> {
        let manifest = self.load_manifest().await?;
        let Some(item) = manifest.items.get(key).cloned() else {
            return Ok(None);
        };
        let content = if item.is_deleted() {
            None
        } else {
            read_optional(&self.content_path(key)?)
                .await?
                .map(|bytes| MemoPayload::encode_content(&bytes))
        };
        Ok(Some(ProviderItem {
            item,
            id: key.to_string(),
            group_id: self.group.clone().unwrap_or_default(),
            content,
        }))
    }

    async fn download_file(&mut self, key: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        let manifest = self.load_manifest().await?;
        match manifest.items.get(key) {
            Some(item) if !item.is_deleted() => read_optional(&self.content_path(key)?).await,
            _ => Ok(None),
        }
    }

    async fn upload_file(&mut self, item: &Item, data: &[u8]) -> Result<bool, ProviderError> {
        let path = self.content_path(&item.key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;

        let mut manifest = self.load_manifest().await?;
        let stored = Item {
            status: ItemStatus::Unchanged,
            ..item.clone()
        }
        .with_size(data.len() as u64);
        manifest.items.insert(item.key.clone(), stored);
        self.store_manifest(&manifest).await?;
        Ok(true)
    }

    async fn delete_file(&mut self, item: &Item) -> Result<bool, ProviderError> {
        let path = self.content_path(&item.key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut manifest = self.load_manifest().await?;
        manifest.items.insert(
            item.key.clone(),
            Item {
                status: ItemStatus::Deleted,
                ..item.clone()
            },
        );
        self.store_manifest(&manifest).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn provider_for(root: &Path) -> FolderProvider {
        std::fs::create_dir_all(root.join("Vault")).unwrap();
        let mut provider = FolderProvider::new(root);
        provider.open().await.unwrap();
        provider.set_group_id("Vault").unwrap();
        provider
    }

    #[tokio::test]
    async fn lists_group_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Work")).unwrap();
        std::fs::create_dir_all(dir.path().join("Vault")).unwrap();
        std::fs::create_dir_all(dir.path().join(".trash")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let mut provider = FolderProvider::new(dir.path());
        assert!(provider.is_ready().await.unwrap());
        let names: Vec<_> = provider
            .fetch_group_list()
            .await
            .unwrap()
            .into_iter()
            .map(|group| group.name)
            .collect();

        assert_eq!(names, vec!["Vault".to_string(), "Work".to_string()]);
    }

    #[tokio::test]
    async fn upload_then_download_and_list() {
        let dir = tempdir().unwrap();
        let mut provider = provider_for(dir.path()).await;
        let item = Item::new("notes/a.md", ItemStatus::Created, 10, 20);

        assert!(provider.upload_file(&item, b"hello").await.unwrap());

        let items = provider.fetch_item_list().await.unwrap();
        assert_eq!(
            items,
            vec![Item::new("notes/a.md", ItemStatus::Unchanged, 10, 20).with_size(5)]
        );
        assert_eq!(
            provider.download_file("notes/a.md").await.unwrap(),
            Some(b"hello".to_vec())
        );
        let info = provider.fetch_item_info("notes/a.md").await.unwrap().unwrap();
        assert_eq!(info.group_id, "Vault");
        assert_eq!(info.content.as_deref(), Some("aGVsbG8="));
    }

    #[tokio::test]
    async fn delete_leaves_tombstone() {
        let dir = tempdir().unwrap();
        let mut provider = provider_for(dir.path()).await;
        let item = Item::new("a.md", ItemStatus::Created, 10, 20);
        provider.upload_file(&item, b"x").await.unwrap();

        let tombstone = Item::new("a.md", ItemStatus::Deleted, 10, 99);
        assert!(provider.delete_file(&tombstone).await.unwrap());

        let items = provider.fetch_item_list().await.unwrap();
        assert_eq!(items, vec![tombstone]);
        assert_eq!(provider.download_file("a.md").await.unwrap(), None);
        assert!(!dir.path().join("Vault/a.md").exists());
    }

    #[tokio::test]
    async fn uploaded_items_are_stored_as_unchanged() {
        let dir = tempdir().unwrap();
        let mut provider = provider_for(dir.path()).await;
        let updated = Item::new("a.md", ItemStatus::Updated, 10, 30);

        provider.upload_file(&updated, b"body").await.unwrap();

        let stored = provider.fetch_item_list().await.unwrap();
        assert_eq!(stored[0].status, ItemStatus::Unchanged);
        assert_eq!(stored[0].m_time, 30);
    }

    #[tokio::test]
    async fn delete_of_unknown_key_is_recorded() {
        let dir = tempdir().unwrap();
        let mut provider = provider_for(dir.path()).await;
        let tombstone = Item::new("never.md", ItemStatus::Deleted, 1, 2);

        assert!(provider.delete_file(&tombstone).await.unwrap());
        assert_eq!(provider.fetch_item_list().await.unwrap(), vec![tombstone]);
    }

    #[tokio::test]
    async fn requires_group_and_valid_keys() {
        let dir = tempdir().unwrap();
        let mut provider = FolderProvider::new(dir.path());
        assert!(matches!(
            provider.fetch_item_list().await,
            Err(ProviderError::NoGroup)
        ));
        assert!(matches!(
            provider.set_group_id("../up"),
            Err(ProviderError::InvalidGroup(_))
        ));

        provider.set_group_id("Vault").unwrap();
        let item = Item::new("../escape.md", ItemStatus::Created, 1, 1);
        assert!(matches!(
            provider.upload_file(&item, b"x").await,
            Err(ProviderError::InvalidKey(_))
        ));
    }
}
