use std::collections::HashMap;

use async_trait::async_trait;
use memosync_core::{
    Group, Item, ItemStatus, Memo, MemoClient, MemoPayload, MemoUpdate, SessionCookies,
};

use super::{ProviderError, ProviderItem, RemoteProvider};

/// Called with the new `NID_SES` value when the service rotates the session cookie.
pub type SessionRefreshed = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedMemo {
    memo_seq: i64,
    folder_id: i64,
    item: Item,
    content: Option<String>,
}

impl CachedMemo {
    fn provider_item(&self) -> ProviderItem {
        ProviderItem {
            item: self.item.clone(),
            id: self.memo_seq.to_string(),
            group_id: self.folder_id.to_string(),
            content: self.content.clone(),
        }
    }
}

/// Memo metadata by item key, filled by listings and completed on demand.
#[derive(Debug, Default)]
pub struct MemoCache {
    entries: HashMap<String, CachedMemo>,
}

impl MemoCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn get(&self, key: &str) -> Option<&CachedMemo> {
        self.entries.get(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut CachedMemo> {
        self.entries.get_mut(key)
    }

    fn insert(&mut self, memo: CachedMemo) {
        self.entries.insert(memo.item.key.clone(), memo);
    }
}

pub struct MemoProvider {
    client: MemoClient,
    folder_id: Option<i64>,
    cache: MemoCache,
    on_session_refresh: Option<SessionRefreshed>,
}

impl MemoProvider {
    pub fn new(base_url: &str, cookies: SessionCookies) -> Result<Self, ProviderError> {
        Ok(Self::with_client(MemoClient::with_base_url(base_url, cookies)?))
    }

    pub fn with_client(client: MemoClient) -> Self {
        Self {
            client,
            folder_id: None,
            cache: MemoCache::default(),
            on_session_refresh: None,
        }
    }

    pub fn on_session_refresh(mut self, callback: SessionRefreshed) -> Self {
        self.on_session_refresh = Some(callback);
        self
    }

    pub fn cache(&self) -> &MemoCache {
        &self.cache
    }

    fn folder_id(&self) -> Result<i64, ProviderError> {
        self.folder_id.ok_or(ProviderError::NoGroup)
    }

    /// Returns the cached memo for `item.key`, creating an empty memo for unknown keys.
    async fn ensure_memo(&mut self, item: &Item) -> Result<CachedMemo, ProviderError> {
        if let Some(memo) = self.cache.get(&item.key) {
            return Ok(memo.clone());
        }
        let folder_id = self.folder_id()?;
        let body = MemoPayload::encode(item, ItemStatus::Unchanged, None);
        let created = self.client.write_memo(folder_id, &item.key, &body).await?;
        let memo = CachedMemo {
            memo_seq: created.memo_seq,
            folder_id: created.folder_id,
            item: Item {
                status: ItemStatus::Unchanged,
                ..item.clone()
            },
            content: None,
        };
        self.cache.insert(memo.clone());
        Ok(memo)
    }

    async fn write_payload(
        &mut self,
        item: &Item,
        status: ItemStatus,
        data: Option<&[u8]>,
    ) -> Result<bool, ProviderError> {
        let memo = self.ensure_memo(item).await?;
        let accepted = self
            .client
            .update_memo(&MemoUpdate {
                memo_seq: memo.memo_seq,
                folder_id: memo.folder_id,
                title: item.key.clone(),
                content: MemoPayload::encode(item, status, data),
            })
            .await?;
        if accepted && let Some(cached) = self.cache.get_mut(&item.key) {
            cached.item = Item {
                status,
                ..item.clone()
            };
            cached.content = Some(data.map(MemoPayload::encode_content).unwrap_or_default());
        }
        Ok(accepted)
    }
}

/// Memos without a dotted title are not vault files.
fn memo_to_cached(memo: Memo) -> Option<CachedMemo> {
    if !memo.title.contains('.') {
        return None;
    }
    let plain = memo.memo_plain_content.as_deref().unwrap_or_default();
    match MemoPayload::decode(plain) {
        Some(payload) => Some(CachedMemo {
            memo_seq: memo.memo_seq,
            folder_id: memo.folder_id,
            item: payload.item(memo.title),
            content: payload.content,
        }),
        None => Some(CachedMemo {
            memo_seq: memo.memo_seq,
            folder_id: memo.folder_id,
            item: Item::new(
                memo.title,
                ItemStatus::Unchanged,
                memo.created_time,
                memo.last_modified_time,
            ),
            content: Some(String::new()),
        }),
    }
}

#[async_trait]
impl RemoteProvider for MemoProvider {
    async fn open(&mut self) -> Result<(), ProviderError> {
        self.cache.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        self.cache.clear();
        Ok(())
    }

    async fn is_ready(&mut self) -> Result<bool, ProviderError> {
        let status = self.client.check_session().await?;
        if let (Some(nid_ses), Some(callback)) = (&status.refreshed_ses, &self.on_session_refresh) {
            callback(nid_ses.as_str());
        }
        Ok(status.ready)
    }

    async fn fetch_group_list(&mut self) -> Result<Vec<Group>, ProviderError> {
        let folders = self.client.list_folders().await?;
        Ok(folders
            .into_iter()
            .map(|folder| Group {
                id: folder.folder_id.to_string(),
                name: folder.folder_name,
            })
            .collect())
    }

    fn set_group_id(&mut self, group_id: &str) -> Result<(), ProviderError> {
        let folder_id = group_id
            .trim()
            .parse::<i64>()
            .map_err(|_| ProviderError::InvalidGroup(group_id.to_string()))?;
        self.folder_id = Some(folder_id);
        Ok(())
    }

    async fn fetch_item_list(&mut self) -> Result<Vec<Item>, ProviderError> {
        let folder_id = self.folder_id()?;
        let memos = self.client.list_memos_all(folder_id).await?;
        self.cache.clear();
        let mut items = Vec::with_capacity(memos.len());
        for cached in memos.into_iter().filter_map(memo_to_cached) {
            items.push(cached.item.clone());
            self.cache.insert(cached);
        }
        Ok(items)
    }

    async fn fetch_item_info(&mut self, key: &str) -> Result<Option<ProviderItem>, ProviderError> {
        let Some(cached) = self.cache.get(key) else {
            return Ok(None);
        };
        if cached.content.is_none() {
            let memo = self.client.get_memo(cached.memo_seq).await?;
            let content = memo
                .memo_plain_content
                .as_deref()
                .and_then(MemoPayload::decode)
                .and_then(|payload| payload.content)
                .unwrap_or_default();
            if let Some(entry) = self.cache.get_mut(key) {
                entry.content = Some(content);
            }
        }
        Ok(self.cache.get(key).map(CachedMemo::provider_item))
    }

    async fn download_file(&mut self, key: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        let Some(info) = self.fetch_item_info(key).await? else {
            return Ok(None);
        };
        match info.content.as_deref() {
            Some(text) => Ok(MemoPayload::decode_content(text)?),
            None => Ok(None),
        }
    }

    async fn upload_file(&mut self, item: &Item, data: &[u8]) -> Result<bool, ProviderError> {
        self.write_payload(item, ItemStatus::Unchanged, Some(data))
            .await
    }

    async fn delete_file(&mut self, item: &Item) -> Result<bool, ProviderError> {
        self.write_payload(item, ItemStatus::Deleted, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cookies() -> SessionCookies {
        SessionCookies {
            nid_aut: "aut".into(),
            nid_ses: "ses".into(),
        }
    }

    fn success(data: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "code": "SUCCESS",
            "message": "",
            "data": data
        }))
    }

    async fn mount_listing(server: &MockServer, memos: serde_json::Value, total: u64) {
        Mock::given(method("POST"))
            .and(path("/api/memo/select/list"))
            .respond_with(success(serde_json::json!({
                "memoList": memos,
                "nextCursor": "",
                "totalCount": total
            })))
            .mount(server)
            .await;
    }

    fn provider(server: &MockServer) -> MemoProvider {
        let mut provider = MemoProvider::new(&server.uri(), cookies()).unwrap();
        provider.set_group_id("7").unwrap();
        provider
    }

    #[tokio::test]
    async fn listing_maps_payload_and_plain_memos() {
        let server = MockServer::start().await;
        mount_listing(
            &server,
            serde_json::json!([
                {"memoSeq": 1, "folderId": 7, "title": "a.md", "memoPlainContent": "200;100;U;5;aGVsbG8=;", "createdTime": 1, "lastModifiedTime": 2},
                {"memoSeq": 2, "folderId": 7, "title": "b.md", "memoPlainContent": "shopping list", "createdTime": 10, "lastModifiedTime": 20},
                {"memoSeq": 3, "folderId": 7, "title": "no extension", "memoPlainContent": "x", "createdTime": 1, "lastModifiedTime": 1}
            ]),
            3,
        )
        .await;

        let mut provider = provider(&server);
        let items = provider.fetch_item_list().await.unwrap();

        assert_eq!(
            items,
            vec![
                Item::new("a.md", ItemStatus::Updated, 100, 200).with_size(5),
                Item::new("b.md", ItemStatus::Unchanged, 10, 20),
            ]
        );
        assert_eq!(provider.cache().len(), 2);
        assert_eq!(
            provider.download_file("a.md").await.unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(provider.download_file("b.md").await.unwrap(), None);
        assert_eq!(provider.download_file("missing.md").await.unwrap(), None);
    }

    #[tokio::test]
    async fn listing_requires_selected_group() {
        let server = MockServer::start().await;
        let mut provider = MemoProvider::new(&server.uri(), cookies()).unwrap();
        assert!(matches!(
            provider.fetch_item_list().await,
            Err(ProviderError::NoGroup)
        ));
        assert!(matches!(
            provider.set_group_id("abc"),
            Err(ProviderError::InvalidGroup(_))
        ));
    }

    #[tokio::test]
    async fn truncated_listing_fetches_full_memo_once() {
        let server = MockServer::start().await;
        mount_listing(
            &server,
            serde_json::json!([
                {"memoSeq": 9, "folderId": 7, "title": "long.md", "memoPlainContent": "200;100;N;5;aGVs", "createdTime": 1, "lastModifiedTime": 2}
            ]),
            1,
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/api/memo/select"))
            .and(body_string_contains("memoSeq=9"))
            .respond_with(success(serde_json::json!({
                "memoSeq": 9, "folderId": 7, "title": "long.md",
                "memoPlainContent": "200;100;N;5;aGVsbG8=;"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut provider = provider(&server);
        provider.fetch_item_list().await.unwrap();

        let info = provider.fetch_item_info("long.md").await.unwrap().unwrap();
        assert_eq!(info.id, "9");
        assert_eq!(info.content.as_deref(), Some("aGVsbG8="));
        assert_eq!(
            provider.download_file("long.md").await.unwrap(),
            Some(b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn upload_creates_memo_for_unknown_key() {
        let server = MockServer::start().await;
        mount_listing(&server, serde_json::json!([]), 0).await;
        Mock::given(method("POST"))
            .and(path("/memo/writeMemo"))
            .and(body_string_contains("title=new.md"))
            .respond_with(success(serde_json::json!({
                "memoSeq": 50, "folderId": 7, "title": "new.md"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/memo/updateMemo"))
            .and(body_string_contains("memoSeq=50"))
            .and(body_string_contains("memoContent=300%3B100%3BN%3B2%3BaGk%3D%3B"))
            .respond_with(success(serde_json::json!({ "memoSeq": 50 })))
            .expect(1)
            .mount(&server)
            .await;

        let mut provider = provider(&server);
        provider.fetch_item_list().await.unwrap();
        let item = Item::new("new.md", ItemStatus::Created, 100, 300).with_size(2);

        assert!(provider.upload_file(&item, b"hi").await.unwrap());
        let info = provider.fetch_item_info("new.md").await.unwrap().unwrap();
        assert_eq!(info.item.status, ItemStatus::Unchanged);
        assert_eq!(info.item.m_time, 300);
    }

    #[tokio::test]
    async fn delete_marks_existing_memo_deleted() {
        let server = MockServer::start().await;
        mount_listing(
            &server,
            serde_json::json!([
                {"memoSeq": 4, "folderId": 7, "title": "gone.md", "memoPlainContent": "1;1;N;0;;"}
            ]),
            1,
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/memo/updateMemo"))
            .and(body_string_contains("memoSeq=4"))
            .and(body_string_contains("memoContent=500%3B1%3BD%3B0%3B%3B"))
            .respond_with(success(serde_json::json!({ "memoSeq": 4 })))
            .expect(1)
            .mount(&server)
            .await;

        let mut provider = provider(&server);
        provider.fetch_item_list().await.unwrap();
        let item = Item::new("gone.md", ItemStatus::Deleted, 1, 500);

        assert!(provider.delete_file(&item).await.unwrap());
    }

    #[tokio::test]
    async fn is_ready_reports_rotated_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "NID_SES=rotated; Path=/")
                    .set_body_string("window.USER_ID = 'me';"),
            )
            .mount(&server)
            .await;

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let mut provider = MemoProvider::new(&server.uri(), cookies())
            .unwrap()
            .on_session_refresh(Box::new(move |value| {
                *sink.lock().unwrap() = Some(value.to_string());
            }));

        assert!(provider.is_ready().await.unwrap());
        assert_eq!(seen.lock().unwrap().as_deref(), Some("rotated"));
    }
}
