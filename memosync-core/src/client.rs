use reqwest::header::{COOKIE, REFERER, SET_COOKIE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://memo.naver.com";
const PAGE_SIZE: u32 = 40;
const LIST_CONTENT_LENGTH: u32 = 1000;
const USER_ID_MARKER: &str = "window.USER_ID = '";

#[derive(Debug, Error)]
pub enum MemoError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("service rejected request: {message}")]
    Fail { message: String },
    #[error("service response is missing data")]
    MissingData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookies {
    pub nid_aut: String,
    pub nid_ses: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub ready: bool,
    /// Set when the service rotated the session cookie.
    pub refreshed_ses: Option<String>,
}

#[derive(Clone)]
pub struct MemoClient {
    http: Client,
    base_url: Url,
    cookies: SessionCookies,
    user_id: Option<String>,
}

impl MemoClient {
    pub fn new(cookies: SessionCookies) -> Result<Self, MemoError> {
        Self::with_base_url(DEFAULT_BASE_URL, cookies)
    }

    pub fn with_base_url(base_url: &str, cookies: SessionCookies) -> Result<Self, MemoError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            cookies,
            user_id: None,
        })
    }

    pub fn cookies(&self) -> &SessionCookies {
        &self.cookies
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Loads the landing page to validate the session, picking up the user id and a
    /// rotated `NID_SES` cookie if the service issued one.
    pub async fn check_session(&mut self) -> Result<SessionStatus, MemoError> {
        if self.cookies.nid_aut.is_empty() || self.cookies.nid_ses.is_empty() {
            return Ok(SessionStatus {
                ready: false,
                refreshed_ses: None,
            });
        }

        let url = self.endpoint("/")?;
        let response = self
            .http
            .get(url)
            .header(COOKIE, self.cookie_header_value())
            .send()
            .await?;
        let status = response.status();
        let refreshed_ses = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(parse_nid_ses);
        let body = response.text().await?;
        if !status.is_success() {
            return Err(MemoError::Api { status, body });
        }

        if let Some(nid_ses) = &refreshed_ses {
            self.cookies.nid_ses = nid_ses.clone();
        }
        self.user_id = extract_user_id(&body);
        Ok(SessionStatus {
            ready: self.user_id.is_some(),
            refreshed_ses,
        })
    }

    pub async fn list_folders(&self) -> Result<Vec<Folder>, MemoError> {
        let data: FolderListData = self.post_data("/folder/folderList", &[]).await?;
        Ok(data.folder_list)
    }

    pub async fn list_memos_page(&self, folder_id: i64, cursor: &str) -> Result<MemoPage, MemoError> {
        let folder_id = folder_id.to_string();
        let page_size = PAGE_SIZE.to_string();
        let content_length = LIST_CONTENT_LENGTH.to_string();
        self.post_data(
            "/api/memo/select/list",
            &[
                ("folderId", folder_id.as_str()),
                ("cursor", cursor),
                ("sizePerPage", page_size.as_str()),
                ("contentLength", content_length.as_str()),
                ("sortCode", "PIN_DESC_MODIFIED_TIME_DESC"),
                ("startTime", "0"),
                ("endTime", "0"),
                ("includeDeletedMemo", "false"),
                ("excludeHtml", "true"),
            ],
        )
        .await
    }

    /// Follows the listing cursor until every memo in the folder has been collected.
    pub async fn list_memos_all(&self, folder_id: i64) -> Result<Vec<Memo>, MemoError> {
        let mut cursor = String::new();
        let mut memos = Vec::new();
        loop {
            let page = self.list_memos_page(folder_id, &cursor).await?;
            let total = page.total_count;
            cursor = page.next_cursor.unwrap_or_default();
            memos.extend(page.memo_list);
            if memos.len() as u64 >= total || cursor.is_empty() {
                break;
            }
        }
        Ok(memos)
    }

    pub async fn get_memo(&self, memo_seq: i64) -> Result<Memo, MemoError> {
        let memo_seq = memo_seq.to_string();
        self.post_data("/api/memo/select", &[("memoSeq", memo_seq.as_str())])
            .await
    }

    pub async fn write_memo(
        &self,
        folder_id: i64,
        title: &str,
        content: &str,
    ) -> Result<Memo, MemoError> {
        let folder_id = folder_id.to_string();
        self.post_data(
            "/memo/writeMemo",
            &[
                ("title", title),
                ("memoContent", content),
                ("important", "false"),
                ("colorId", "0"),
                ("folderId", folder_id.as_str()),
                ("editorVersion", "1"),
            ],
        )
        .await
    }

    /// Returns whether the service accepted the update.
    pub async fn update_memo(&self, update: &MemoUpdate) -> Result<bool, MemoError> {
        let memo_seq = update.memo_seq.to_string();
        let folder_id = update.folder_id.to_string();
        let envelope: Envelope<serde::de::IgnoredAny> = self
            .post(
                "/memo/updateMemo",
                &[
                    ("memoSeq", memo_seq.as_str()),
                    ("title", update.title.as_str()),
                    ("memoContent", update.content.as_str()),
                    ("important", "false"),
                    ("colorId", "0"),
                    ("folderId", folder_id.as_str()),
                    ("editorVersion", "1"),
                    ("pinTime", "0"),
                ],
            )
            .await?;
        Ok(envelope.is_success())
    }

    fn cookie_header_value(&self) -> String {
        format!(
            "NID_AUT={}; NID_SES={}",
            self.cookies.nid_aut, self.cookies.nid_ses
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, MemoError> {
        Ok(self.base_url.join(path)?)
    }

    async fn post_data<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, MemoError> {
        let envelope: Envelope<T> = self.post(path, form).await?;
        if !envelope.is_success() {
            return Err(MemoError::Fail {
                message: envelope.message.unwrap_or_default(),
            });
        }
        envelope.data.ok_or(MemoError::MissingData)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<Envelope<T>, MemoError> {
        let url = self.endpoint(path)?;
        let referer = self.endpoint("/")?;
        let response = self
            .http
            .post(url)
            .header(REFERER, referer.as_str())
            .header(COOKIE, self.cookie_header_value())
            .header("userid", self.user_id.as_deref().unwrap_or_default())
            .form(form)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, MemoError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(MemoError::Api { status, body })
        }
    }
}

fn parse_nid_ses(set_cookie: &str) -> Option<String> {
    set_cookie
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("NID_SES="))
        .map(str::to_string)
}

fn extract_user_id(page: &str) -> Option<String> {
    let start = page.find(USER_ID_MARKER)? + USER_ID_MARKER.len();
    let rest = &page[start..];
    let end = rest.find('\'')?;
    let user_id = &rest[..end];
    (!user_id.is_empty()).then(|| user_id.to_string())
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn is_success(&self) -> bool {
        self.code == "SUCCESS"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderListData {
    folder_list: Vec<Folder>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub folder_id: i64,
    pub folder_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Memo {
    pub memo_seq: i64,
    pub folder_id: i64,
    pub title: String,
    #[serde(default)]
    pub memo_plain_content: Option<String>,
    #[serde(default)]
    pub created_time: i64,
    #[serde(default)]
    pub last_modified_time: i64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoPage {
    pub memo_list: Vec<Memo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoUpdate {
    pub memo_seq: i64,
    pub folder_id: i64,
    pub title: String,
    pub content: String,
}
