//! Represents an object (file) served from the backing store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, io, pin::Pin};
use uuid::Uuid;

/// A single object row as persisted in the `objects` table.
///
/// The row carries metadata only; the payload bytes live on disk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Content encoding applied to the stored bytes (e.g. `gzip`).
    pub content_encoding: Option<String>,

    /// Natural language of the content.
    pub content_language: Option<String>,

    /// Presentational hint, usually `attachment; filename=...`.
    pub content_disposition: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum of the payload, unquoted.
    pub etag: Option<String>,

    /// Timestamp when the object was uploaded.
    pub last_modified: DateTime<Utc>,

    /// Whether the object is marked as deleted.
    pub is_deleted: bool,
}

/// Optional HTTP metadata recorded alongside an object at upload time.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpMetadata {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
}

/// Store-neutral view of an object's metadata, as returned by a `head` lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,

    /// Strong validator, already quoted for use in an `ETag` header.
    pub http_etag: String,

    pub uploaded: DateTime<Utc>,

    /// Exact byte size reported by the store.
    pub size: u64,

    pub http_metadata: HttpMetadata,
}

/// Streamed object payload.
pub type ObjectBody = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// An object returned by the store. `body` is `None` for metadata-only lookups.
pub struct StoredObject {
    pub meta: ObjectMeta,
    pub body: Option<ObjectBody>,
}

impl fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredObject")
            .field("meta", &self.meta)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl From<Object> for ObjectMeta {
    fn from(row: Object) -> Self {
        Self {
            http_etag: row
                .etag
                .as_deref()
                .map(|etag| format!("\"{}\"", etag))
                .unwrap_or_default(),
            uploaded: row.last_modified,
            size: row.size_bytes.max(0) as u64,
            http_metadata: HttpMetadata {
                content_type: row.content_type,
                content_encoding: row.content_encoding,
                content_language: row.content_language,
                content_disposition: row.content_disposition,
            },
            key: row.key,
        }
    }
}
