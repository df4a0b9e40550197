mod client;
mod item;

pub use client::{
    Folder, Memo, MemoClient, MemoError, MemoPage, MemoUpdate, SessionCookies, SessionStatus,
};
pub use item::{Group, Item, ItemError, ItemStatus, MemoPayload};
