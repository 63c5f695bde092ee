//! Cursor-paginated reads over the aggregate message store.
//!
//! Pages are ordered by the `(created_at, id)` tuple ascending, a total
//! order, since ids are unique. The cursor is the id of the last row
//! returned; an empty `next_cursor` means the end of the stream at this
//! instant. A traversal that follows cursors never repeats a row and
//! observes every row present when its pages were read.

use crate::config::PaginationConfig;
use crate::message::Message;
use crate::store::{Store, StoreError};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Errors from the read service.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("invalid cursor: {0:?}")]
    InvalidCursor(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One page of messages plus the cursor for the next page.
#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub data: Vec<Message>,
    /// Id of the last row returned; empty at end of stream.
    pub next_cursor: String,
}

/// Stable cursor pagination over the message store.
#[derive(Clone)]
pub struct ReadService {
    store: Arc<Store>,
    default_limit: i64,
    max_limit: i64,
}

impl ReadService {
    pub fn new(store: Arc<Store>, config: &PaginationConfig) -> Self {
        Self {
            store,
            default_limit: config.default_limit,
            max_limit: config.max_limit,
        }
    }

    /// Fetch the page after `cursor`, or the first page when no cursor is
    /// given. Out-of-range limits clamp to the default.
    pub async fn page(
        &self,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<MessagePage, ReadError> {
        let anchor = match cursor {
            None => None,
            Some("") => None,
            Some(raw) => Some(
                Uuid::parse_str(raw).map_err(|_| ReadError::InvalidCursor(raw.to_string()))?,
            ),
        };

        let limit = clamp_limit(limit, self.default_limit, self.max_limit);
        let data = self.store.fetch_page(anchor, limit).await?;
        let next_cursor = next_cursor(&data, limit);

        Ok(MessagePage { data, next_cursor })
    }
}

/// Requested page size, or the default when absent or out of `[1, max]`.
fn clamp_limit(requested: Option<i64>, default: i64, max: i64) -> i64 {
    match requested {
        Some(limit) if (1..=max).contains(&limit) => limit,
        _ => default,
    }
}

/// A full page points at its last row; a short page is the end of stream.
fn next_cursor(data: &[Message], limit: i64) -> String {
    if data.len() as i64 == limit {
        data.last()
            .map(|m| m.id.to_string())
            .unwrap_or_default()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn message(id: Uuid) -> Message {
        Message {
            id,
            tenant_id: Uuid::nil(),
            payload: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(Some(10), 20, 100), 10);
        assert_eq!(clamp_limit(Some(1), 20, 100), 1);
        assert_eq!(clamp_limit(Some(100), 20, 100), 100);

        // absent or out of range falls back to the default
        assert_eq!(clamp_limit(None, 20, 100), 20);
        assert_eq!(clamp_limit(Some(0), 20, 100), 20);
        assert_eq!(clamp_limit(Some(-5), 20, 100), 20);
        assert_eq!(clamp_limit(Some(101), 20, 100), 20);
    }

    #[test]
    fn test_next_cursor_full_page() {
        let last = Uuid::new_v4();
        let data = vec![message(Uuid::new_v4()), message(last)];
        assert_eq!(next_cursor(&data, 2), last.to_string());
    }

    #[test]
    fn test_next_cursor_short_page_ends_stream() {
        let data = vec![message(Uuid::new_v4())];
        assert_eq!(next_cursor(&data, 2), "");
        assert_eq!(next_cursor(&[], 2), "");
    }
}
