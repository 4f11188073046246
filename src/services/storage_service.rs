//! src/services/storage_service.rs
//!
//! StorageService — the read side of the object store, backed by SQLite for
//! metadata and local disk for object payloads sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`. The edge never writes objects;
//! payloads are placed there by the publishing pipeline.

use crate::{
    models::{
        bucket::Bucket,
        object::{Object, ObjectMeta, StoredObject},
    },
    services::object_store::{ObjectStore, StorageError, StorageResult},
};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::{io, path::PathBuf, sync::Arc};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Schema applied by `--migrate`.
const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// StorageService resolves object keys within a single bucket:
/// - `head` reads the metadata row from SQLite
/// - `get` reads the metadata row and opens the payload on disk for streaming
///
/// Keys that could escape the bucket directory never reach the filesystem and
/// resolve to "not found".
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Name of the bucket all keys are resolved in.
    pub bucket: String,
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool, using
    /// `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            bucket: bucket.into(),
        }
    }

    /// Apply the embedded schema, one statement at a time.
    ///
    /// Returns the number of statements executed.
    pub async fn migrate(&self) -> StorageResult<usize> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects empty or oversized keys, keys that begin with `/` or contain
    /// `..`, and keys with control characters or backslashes.
    fn is_key_safe(key: &str) -> bool {
        !key.is_empty()
            && key.len() <= MAX_OBJECT_KEY_LEN
            && !key.starts_with('/')
            && !key.contains("..")
            && !key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    }

    /// Compute the physical base folder path for the bucket.
    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path.
    ///
    /// Combines base_path/bucket/{shard}/{shard}/{key}.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&self.bucket, key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Fetch the configured bucket's row.
    ///
    /// A missing bucket is a deployment fault, not a missing object.
    async fn fetch_bucket(&self) -> StorageResult<Bucket> {
        sqlx::query_as::<sqlx::sqlite::Sqlite, Bucket>(
            "SELECT id, name, created_at FROM buckets WHERE name = ?",
        )
        .bind(&self.bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(self.bucket.clone()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch a non-deleted object metadata record, if any.
    async fn fetch_object(&self, key: &str) -> StorageResult<Option<Object>> {
        if !Self::is_key_safe(key) {
            debug!(key, "rejecting unsafe object key");
            return Ok(None);
        }

        let bucket = self.fetch_bucket().await?;
        debug!(bucket = %bucket.name, created_at = %bucket.created_at, key, "looking up object");
        let object = sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, content_type, content_encoding, content_language,
                    content_disposition, size_bytes, etag, last_modified, is_deleted
             FROM objects
             WHERE key = ? AND bucket_id = ? AND is_deleted = 0",
        )
        .bind(key)
        .bind(bucket.id)
        .fetch_optional(&*self.db)
        .await?;

        Ok(object)
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn head(&self, key: &str) -> StorageResult<Option<ObjectMeta>> {
        Ok(self.fetch_object(key).await?.map(ObjectMeta::from))
    }

    /// Returns `None` if metadata exists but the physical file is missing.
    async fn get(&self, key: &str) -> StorageResult<Option<StoredObject>> {
        let Some(object) = self.fetch_object(key).await? else {
            return Ok(None);
        };

        let file_path = self.object_path(key);
        let file = match File::open(&file_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "metadata for `{}` exists but {} is missing",
                    key,
                    file_path.display()
                );
                return Ok(None);
            }
            Err(err) => return Err(StorageError::Io(err)),
        };

        Ok(Some(StoredObject {
            meta: ObjectMeta::from(object),
            body: Some(Box::pin(ReaderStream::new(file))),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use futures::TryStreamExt;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn service(dir: &TempDir) -> StorageService {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("meta.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        let service = StorageService::new(Arc::new(pool), dir.path().join("objects"), "cdn");
        assert_eq!(service.migrate().await.unwrap(), 3);
        service
    }

    async fn seed_bucket(service: &StorageService) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(&service.bucket)
            .bind(Utc::now())
            .execute(&*service.db)
            .await
            .unwrap();
        id
    }

    async fn seed_object(service: &StorageService, bucket_id: Uuid, key: &str, payload: &[u8]) {
        sqlx::query(
            "INSERT INTO objects (id, bucket_id, key, content_type, content_encoding,
                content_language, content_disposition, size_bytes, etag, last_modified, is_deleted)
             VALUES (?, ?, ?, ?, NULL, NULL, ?, ?, ?, ?, 0)",
        )
        .bind(Uuid::new_v4())
        .bind(bucket_id)
        .bind(key)
        .bind("application/java-archive")
        .bind("attachment; filename=\"mod.jar\"")
        .bind(payload.len() as i64)
        .bind(format!("{:x}", md5::compute(payload)))
        .bind(Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap())
        .execute(&*service.db)
        .await
        .unwrap();

        let path = service.object_path(key);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, payload).await.unwrap();
    }

    #[tokio::test]
    async fn head_returns_metadata() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let bucket_id = seed_bucket(&service).await;
        seed_object(&service, bucket_id, "data/abc/versions/v1/mod.jar", b"jar bytes").await;

        let meta = service
            .head("data/abc/versions/v1/mod.jar")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.size, 9);
        assert_eq!(meta.http_etag, format!("\"{:x}\"", md5::compute(b"jar bytes")));
        assert_eq!(
            meta.http_metadata.content_type.as_deref(),
            Some("application/java-archive")
        );
        assert_eq!(meta.http_metadata.content_encoding, None);
        assert_eq!(
            meta.uploaded,
            Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap()
        );
    }

    #[tokio::test]
    async fn get_streams_the_payload() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let bucket_id = seed_bucket(&service).await;
        seed_object(&service, bucket_id, "nested/dir/file.zip", b"zip payload").await;

        let object = service.get("nested/dir/file.zip").await.unwrap().unwrap();
        let chunks: Vec<_> = object.body.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"zip payload");
    }

    #[tokio::test]
    async fn missing_objects_resolve_to_none() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        seed_bucket(&service).await;

        assert!(service.head("nope.jar").await.unwrap().is_none());
        assert!(service.get("nope.jar").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_payload_file_resolves_to_none() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let bucket_id = seed_bucket(&service).await;
        seed_object(&service, bucket_id, "gone.jar", b"x").await;
        tokio::fs::remove_file(service.object_path("gone.jar"))
            .await
            .unwrap();

        assert!(service.head("gone.jar").await.unwrap().is_some());
        assert!(service.get("gone.jar").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsafe_keys_never_hit_the_database() {
        let dir = TempDir::new().unwrap();
        // No bucket seeded: a query would fail with BucketNotFound.
        let service = service(&dir).await;

        for key in ["", "/etc/passwd", "../secret", "a\\b", "ctl\u{7}"] {
            assert!(service.head(key).await.unwrap().is_none(), "{key:?}");
        }
        let long_key = "k".repeat(MAX_OBJECT_KEY_LEN + 1);
        assert!(service.get(&long_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_bucket_is_a_fault() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        let err = service.head("file.jar").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound(name) if name == "cdn"));
    }

    #[tokio::test]
    async fn object_paths_are_sharded_under_the_bucket() {
        let pool = SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        let service = StorageService::new(Arc::new(pool), "/srv/objects", "cdn");
        let path = service.object_path("data/a/versions/b/c.jar");
        let (a, b) = StorageService::object_shards("cdn", "data/a/versions/b/c.jar");
        assert_eq!(
            path,
            PathBuf::from("/srv/objects/cdn")
                .join(a)
                .join(b)
                .join("data/a/versions/b/c.jar")
        );
    }
}
