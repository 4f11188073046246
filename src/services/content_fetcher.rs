//! Cache-aside content delivery: serve from the response cache when possible,
//! otherwise resolve the object in the store, synthesize the response headers
//! and write the fresh response back to the cache.

use crate::{
    cors::apply_cors_headers,
    errors::AppError,
    models::object::{ObjectBody, ObjectMeta, StoredObject},
    services::{
        background::BackgroundTasks,
        object_store::ObjectStore,
        response_cache::{CacheKey, CachedResponse, ResponseCache},
    },
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header, request::Parts},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::debug;

/// Shared edge cache lifetime: 31 days.
pub const CACHE_CONTROL: &str = "s-maxage=2678400";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Everything the fetcher needs to know about one inbound request.
#[derive(Clone, Debug)]
pub struct ContentRequest {
    pub method: Method,
    /// Request path without its leading slash.
    pub resource_key: String,
    /// Absolute URL the client asked for.
    pub url: String,
    pub cache_key: CacheKey,
}

impl ContentRequest {
    pub fn from_parts(parts: &Parts) -> Self {
        let url = absolute_url(&parts.headers, &parts.uri);
        Self {
            method: parts.method.clone(),
            resource_key: resource_key(&parts.uri),
            cache_key: CacheKey::new(parts.method.clone(), url.clone()),
            url,
        }
    }
}

/// The request path with its leading slash stripped.
pub fn resource_key(uri: &Uri) -> String {
    uri.path().strip_prefix('/').unwrap_or(uri.path()).to_string()
}

/// Rebuild the absolute URL from the `Host` header; falls back to the bare URI.
pub fn absolute_url(headers: &HeaderMap, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    match headers.get(header::HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => format!("https://{}{}", host, path_and_query),
        None => uri.to_string(),
    }
}

#[derive(Clone)]
pub struct ContentFetcher {
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn ResponseCache>,
    tasks: BackgroundTasks,
    /// Objects larger than this are streamed through without being cached.
    max_cacheable_bytes: u64,
}

impl ContentFetcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<dyn ResponseCache>,
        tasks: BackgroundTasks,
        max_cacheable_bytes: u64,
    ) -> Self {
        Self {
            store,
            cache,
            tasks,
            max_cacheable_bytes,
        }
    }

    /// Look the request up in the response cache. Unusable entries count as a miss.
    pub async fn consult_cache(&self, key: &CacheKey) -> Option<CachedResponse> {
        self.cache
            .lookup(key)
            .await
            .filter(CachedResponse::is_usable)
    }

    /// Produce the response for `request`, given the result of an earlier
    /// [`consult_cache`](Self::consult_cache) call.
    pub async fn fetch(
        &self,
        request: &ContentRequest,
        cached: Option<CachedResponse>,
    ) -> Result<Response, AppError> {
        if let Some(hit) = cached.filter(CachedResponse::is_usable) {
            debug!(key = %request.resource_key, "cache hit");
            return Ok(hit.into_response());
        }

        debug!(key = %request.resource_key, "cache miss, fetching from store");

        if request.resource_key.ends_with('/') {
            return Err(AppError::not_found());
        }

        let object = if request.method == Method::HEAD {
            self.store
                .head(&request.resource_key)
                .await?
                .map(|meta| StoredObject { meta, body: None })
        } else {
            self.store.get(&request.resource_key).await?
        };

        let Some(object) = object else {
            debug!(key = %request.resource_key, "object not found in store");
            return Err(AppError::not_found());
        };

        let headers = object_headers(&object.meta);
        let body = if request.method == Method::GET {
            let payload = object.body.unwrap_or_else(|| Box::pin(stream::empty()));
            if object.meta.size <= self.max_cacheable_bytes {
                self.cache_on_completion(request.cache_key.clone(), headers.clone(), payload)
            } else {
                debug!(
                    key = %request.resource_key,
                    size = object.meta.size,
                    "object too large to cache"
                );
                Body::from_stream(payload)
            }
        } else {
            Body::empty()
        };

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::OK;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Stream `payload` to the client while buffering a copy. Once the stream
    /// ends cleanly the buffered response is written to the cache in the
    /// background. Errors or an abandoned stream skip the write.
    fn cache_on_completion(&self, key: CacheKey, headers: HeaderMap, payload: ObjectBody) -> Body {
        let cache = self.cache.clone();
        let tasks = self.tasks.clone();
        let on_complete = move |body: Bytes| {
            tasks.spawn("cache-put", async move {
                debug!(url = %key.url, bytes = body.len(), "caching response");
                cache
                    .put(
                        key,
                        CachedResponse {
                            status: StatusCode::OK,
                            headers,
                            body,
                        },
                    )
                    .await;
            });
        };

        let teed = stream::unfold(
            (payload, BytesMut::new(), Some(on_complete)),
            |(mut payload, mut buffer, mut on_complete)| async move {
                match payload.next().await {
                    Some(Ok(chunk)) => {
                        if on_complete.is_some() {
                            buffer.extend_from_slice(&chunk);
                        }
                        Some((Ok(chunk), (payload, buffer, on_complete)))
                    }
                    Some(Err(err)) => Some((Err(err), (payload, BytesMut::new(), None))),
                    None => {
                        if let Some(fill) = on_complete.take() {
                            fill(buffer.freeze());
                        }
                        None
                    }
                }
            },
        );

        Body::from_stream(teed)
    }
}

/// Response headers for a freshly fetched object.
fn object_headers(meta: &ObjectMeta) -> HeaderMap {
    let metadata = &meta.http_metadata;
    let mut headers = HeaderMap::new();
    apply_cors_headers(&mut headers);

    headers.insert(header::ETAG, header_value(&meta.http_etag, ""));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
    headers.insert(
        header::LAST_MODIFIED,
        header_value(&meta.uploaded.format(HTTP_DATE_FORMAT).to_string(), ""),
    );
    headers.insert(
        header::CONTENT_ENCODING,
        header_value(metadata.content_encoding.as_deref().unwrap_or(""), ""),
    );
    headers.insert(
        header::CONTENT_TYPE,
        header_value(
            metadata.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE),
            DEFAULT_CONTENT_TYPE,
        ),
    );
    headers.insert(
        header::CONTENT_LANGUAGE,
        header_value(metadata.content_language.as_deref().unwrap_or(""), ""),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(metadata.content_disposition.as_deref().unwrap_or(""), ""),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));
    headers
}

fn header_value(value: &str, fallback: &'static str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(fallback))
}
