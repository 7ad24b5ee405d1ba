//! Opaque cursor pagination for list endpoints.
//!
//! Every list endpoint takes a boundary cursor (the id of the last row returned)
//! and a bounded limit, per spec §6: "All list endpoints take an opaque cursor (a
//! receipt_id or created_at of the boundary row) and a bounded limit." This module
//! is forward-only — AsyncGate's lists are append-only ledgers and task listings,
//! not bidirectional Relay connections.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use uuid::Uuid;

/// Opaque cursor for pagination (base64-encoded UUID of the boundary row's id).
///
/// V7 ids are time-ordered, so the id alone is a stable forward cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(Uuid);

impl Cursor {
    pub fn new(id: Uuid) -> Self {
        Cursor(id)
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }

    pub fn encode_uuid(id: Uuid) -> String {
        Cursor::new(id).encode()
    }

    pub fn decode(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .context("invalid cursor: not valid base64")?;
        let uuid = Uuid::from_slice(&bytes).context("invalid cursor: not a valid uuid")?;
        Ok(Cursor(uuid))
    }

    pub fn into_uuid(self) -> Uuid {
        self.0
    }
}

/// Default and maximum page sizes, per spec §6 configuration knobs.
pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;

/// Validated list-endpoint pagination arguments: a decoded cursor and a bounded
/// limit.
#[derive(Debug, Clone, Default)]
pub struct PageArgs {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ValidatedPageArgs {
    pub cursor: Option<Uuid>,
    pub limit: i64,
}

impl PageArgs {
    /// Decode the cursor and clamp the limit to `[1, MAX_PAGE_LIMIT]`, defaulting
    /// to `DEFAULT_PAGE_LIMIT` when unset.
    pub fn validate(&self) -> Result<ValidatedPageArgs> {
        let cursor = self
            .cursor
            .as_deref()
            .map(Cursor::decode)
            .transpose()?
            .map(Cursor::into_uuid);
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        Ok(ValidatedPageArgs { cursor, limit })
    }
}

impl ValidatedPageArgs {
    /// SQL LIMIT value (limit + 1, to detect whether another page follows).
    pub fn fetch_limit(&self) -> i64 {
        self.limit + 1
    }
}

/// A page of results plus the cursor to continue from, if any.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Trim `limit + 1` fetched rows down to `limit`, returning the page and the
/// boundary cursor to resume from (the id of the last returned row) when another
/// page follows.
pub fn paginate<T>(mut rows: Vec<T>, limit: i64, id_of: impl Fn(&T) -> Uuid) -> Page<T> {
    let has_more = rows.len() as i64 > limit;
    if has_more {
        rows.truncate(limit as usize);
    }
    let next_cursor = if has_more {
        rows.last().map(|row| Cursor::encode_uuid(id_of(row)))
    } else {
        None
    };
    Page {
        items: rows,
        next_cursor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_encode_decode_roundtrip() {
        let id = Uuid::new_v4();
        let cursor = Cursor::new(id);
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(id, decoded.into_uuid());
    }

    #[test]
    fn cursor_encode_uuid_roundtrip() {
        let id = Uuid::new_v4();
        let encoded = Cursor::encode_uuid(id);
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(id, decoded.into_uuid());
    }

    #[test]
    fn page_args_default_limit() {
        let validated = PageArgs::default().validate().unwrap();
        assert_eq!(validated.limit, DEFAULT_PAGE_LIMIT);
        assert!(validated.cursor.is_none());
    }

    #[test]
    fn page_args_clamps_to_max() {
        let args = PageArgs {
            cursor: None,
            limit: Some(10_000),
        };
        let validated = args.validate().unwrap();
        assert_eq!(validated.limit, MAX_PAGE_LIMIT);
    }

    #[test]
    fn page_args_clamps_to_min() {
        let args = PageArgs {
            cursor: None,
            limit: Some(0),
        };
        let validated = args.validate().unwrap();
        assert_eq!(validated.limit, 1);
    }

    #[test]
    fn page_args_rejects_malformed_cursor() {
        let args = PageArgs {
            cursor: Some("not-base64!!".to_string()),
            limit: None,
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn paginate_detects_more_and_sets_cursor() {
        let ids: Vec<Uuid> = (0..11).map(|_| Uuid::new_v4()).collect();
        let page = paginate(ids.clone(), 10, |id| *id);
        assert_eq!(page.items.len(), 10);
        assert_eq!(page.items, ids[..10]);
        assert!(page.next_cursor.is_some());
    }

    #[test]
    fn paginate_exhausted_has_no_cursor() {
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let page = paginate(ids.clone(), 10, |id| *id);
        assert_eq!(page.items.len(), 5);
        assert!(page.next_cursor.is_none());
    }
}
