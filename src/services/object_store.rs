//! Read-only object store contract the edge serves from.

use crate::models::object::{ObjectMeta, StoredObject};
use async_trait::async_trait;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Key-value object lookup. Absent objects are `Ok(None)`; `Err` is reserved
/// for store faults.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata-only lookup.
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>>;

    /// Full lookup; the returned object carries a body stream.
    async fn get(&self, key: &str) -> StorageResult<Option<StoredObject>>;
}
