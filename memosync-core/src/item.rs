use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("invalid item status: {0}")]
    InvalidStatus(String),
    #[error("invalid payload content: {0}")]
    Content(#[from] base64::DecodeError),
}

/// Change status carried by an item. `Unchanged` only shows up in remote snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    #[serde(rename = "C")]
    Created,
    #[serde(rename = "U")]
    Updated,
    #[serde(rename = "D")]
    Deleted,
    #[serde(rename = "N")]
    Unchanged,
}

impl ItemStatus {
    pub fn as_code(&self) -> &'static str {
        match self {
            ItemStatus::Created => "C",
            ItemStatus::Updated => "U",
            ItemStatus::Deleted => "D",
            ItemStatus::Unchanged => "N",
        }
    }

    pub fn parse(code: &str) -> Result<Self, ItemError> {
        match code {
            "C" => Ok(ItemStatus::Created),
            "U" => Ok(ItemStatus::Updated),
            "D" => Ok(ItemStatus::Deleted),
            "N" => Ok(ItemStatus::Unchanged),
            other => Err(ItemError::InvalidStatus(other.to_string())),
        }
    }
}

/// A synchronizable file record. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub key: String,
    pub status: ItemStatus,
    pub c_time: i64,
    pub m_time: i64,
    pub size: u64,
}

impl Item {
    pub fn new(key: impl Into<String>, status: ItemStatus, c_time: i64, m_time: i64) -> Self {
        Self {
            key: key.into(),
            status,
            c_time,
            m_time,
            size: 0,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.status == ItemStatus::Deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
}

/// Item metadata (and optionally content) packed into a memo body:
/// `mTime;cTime;status;size;base64-content;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoPayload {
    pub m_time: i64,
    pub c_time: i64,
    pub status: ItemStatus,
    pub size: u64,
    /// Base64 text. `None` when the body did not carry the complete content.
    pub content: Option<String>,
}

impl MemoPayload {
    pub fn encode(item: &Item, status: ItemStatus, content: Option<&[u8]>) -> String {
        let content = content.map(Self::encode_content).unwrap_or_default();
        format!(
            "{};{};{};{};{};",
            item.m_time,
            item.c_time,
            status.as_code(),
            item.size,
            content
        )
    }

    pub fn decode(plain: &str) -> Option<Self> {
        let parts: Vec<&str> = plain.split(';').collect();
        if parts.len() < 4 {
            return None;
        }
        let m_time = parts[0].trim().parse::<i64>().ok()?;
        let c_time = parts[1].trim().parse::<i64>().ok()?;
        let status = ItemStatus::parse(parts[2].trim()).ok()?;
        let size = parts[3].trim().parse::<u64>().ok()?;
        // Listings truncate long bodies, which drops the trailing separator.
        let content = if parts.len() > 5 {
            Some(parts[4].to_string())
        } else {
            None
        };
        Some(Self {
            m_time,
            c_time,
            status,
            size,
            content,
        })
    }

    pub fn item(&self, key: impl Into<String>) -> Item {
        Item {
            key: key.into(),
            status: self.status,
            c_time: self.c_time,
            m_time: self.m_time,
            size: self.size,
        }
    }

    /// Decoded content bytes; `None` when the content is unknown or empty.
    pub fn content_bytes(&self) -> Result<Option<Vec<u8>>, ItemError> {
        match self.content.as_deref() {
            Some(text) => Self::decode_content(text),
            None => Ok(None),
        }
    }

    pub fn encode_content(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode_content(text: &str) -> Result<Option<Vec<u8>>, ItemError> {
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(STANDARD.decode(text)?))
    }
}
