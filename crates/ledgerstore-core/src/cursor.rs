use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{storage::StorageError, value::DecodeError};

pub const DEFAULT_PAGE_SIZE: u64 = 15;
pub const MAX_PAGE_SIZE: u64 = 1000;
/// Largest offset every engine accepts.
pub const MAX_OFFSET: u64 = i64::MAX as u64;

/// One page of results plus opaque tokens for the neighbouring pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor<T> {
    pub page_size: usize,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub data: Vec<T>,
}

impl<T> Cursor<T> {
    pub fn empty() -> Self {
        Self {
            page_size: 0,
            has_more: false,
            previous: None,
            next: None,
            data: Vec::new(),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Cursor<U> {
        Cursor {
            page_size: self.page_size,
            has_more: self.has_more,
            previous: self.previous,
            next: self.next,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}

pub fn clamp_page_size(page_size: u64) -> u64 {
    match page_size {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    }
}

/// Rejects offsets no engine can bind, e.g. from a forged token.
pub fn check_offset(offset: u64) -> Result<u64, StorageError> {
    if offset > MAX_OFFSET {
        return Err(StorageError::OutOfRange(format!("offset {}", offset)));
    }
    Ok(offset)
}

/// Offset of the page following the one at `offset`.
pub fn next_offset(offset: u64, page_size: u64) -> Result<u64, StorageError> {
    offset
        .checked_add(page_size)
        .ok_or_else(|| StorageError::OutOfRange(format!("offset {} + {}", offset, page_size)))
        .and_then(check_offset)
}

/// Encodes a page position (usually the query for that page) as an opaque token.
pub fn encode_token<T: Serialize>(position: &T) -> Result<String, DecodeError> {
    Ok(hex::encode(serde_json::to_vec(position)?))
}

pub fn decode_token<T: DeserializeOwned>(token: &str) -> Result<T, DecodeError> {
    let bytes = hex::decode(token).map_err(|_| DecodeError::UnsupportedRepresentation("cursor token"))?;
    Ok(serde_json::from_slice(&bytes)?)
}
