//! Front-line response cache keyed by the inbound request.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Method, StatusCode},
    response::Response,
};
use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::RwLock;

/// Identifies a cached response: request method plus absolute request URL.
///
/// HEAD responses are never stored, so HEAD lookups always miss.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
        }
    }
}

/// A fully buffered response as held by the cache.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    /// Only successful and `304 Not Modified` entries may be served.
    pub fn is_usable(&self) -> bool {
        self.status.is_success() || self.status == StatusCode::NOT_MODIFIED
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn lookup(&self, key: &CacheKey) -> Option<CachedResponse>;

    /// Store `response`, replacing any existing entry for `key`.
    async fn put(&self, key: CacheKey, response: CachedResponse);
}

/// Process-local cache bounded by entry count. When full, the least recently
/// used entry is evicted. A capacity of 0 disables caching.
pub struct MemoryResponseCache {
    entries: Option<RwLock<LruCache<CacheKey, CachedResponse>>>,
}

impl MemoryResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| RwLock::new(LruCache::new(cap))),
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        match &self.entries {
            Some(entries) => entries.read().await.len(),
            None => 0,
        }
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn lookup(&self, key: &CacheKey) -> Option<CachedResponse> {
        // A hit refreshes recency, so it needs the write lock.
        self.entries.as_ref()?.write().await.get(key).cloned()
    }

    async fn put(&self, key: CacheKey, response: CachedResponse) {
        if let Some(entries) = &self.entries {
            entries.write().await.put(key, response);
        }
    }
}
