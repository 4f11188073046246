//! The single edge handler every request is routed to.
//!
//! Order of operations: method gate → preflight → cache lookup → download
//! accounting (background) → cached or freshly fetched content.

use crate::{
    cors,
    errors::AppError,
    models::download::ResourceIdentity,
    services::{
        accounting::AccountingReporter,
        content_fetcher::{ContentFetcher, ContentRequest},
    },
};
use axum::{
    extract::{Request, State},
    http::Method,
    response::Response,
};
use tracing::info;

/// Shared state handed to the handler by the router.
#[derive(Clone)]
pub struct AppState {
    pub fetcher: ContentFetcher,
    pub accounting: AccountingReporter,
}

/// Serve `GET`/`HEAD` for any path, answer `OPTIONS`, reject everything else.
pub async fn serve_content(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    let (parts, _body) = request.into_parts();
    info!(method = %parts.method, path = %parts.uri.path(), "incoming request");

    if !cors::is_allowed(&parts.method) {
        return Err(AppError::method_not_allowed());
    }

    if parts.method == Method::OPTIONS {
        return Ok(cors::preflight_response());
    }

    let content = ContentRequest::from_parts(&parts);
    let cached = state.fetcher.consult_cache(&content.cache_key).await;

    if parts.method == Method::GET {
        if let Some(identity) = ResourceIdentity::parse(&content.resource_key) {
            let event = state
                .accounting
                .build_event(&content.url, &parts.headers, identity);
            state.accounting.dispatch(event);
        }
    }

    state.fetcher.fetch(&content, cached).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::HttpMetadata,
        routes::routes::routes,
        services::{
            accounting::AccountingSettings,
            background::BackgroundTasks,
            object_store::memory::MemoryObjectStore,
            response_cache::{
                CacheKey, CachedResponse, ResponseCache, counting::CountingResponseCache,
            },
        },
    };
    use axum::{
        Router,
        body::Body,
        http::{Request as HttpRequest, StatusCode, header},
    };
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method, path},
    };

    struct Edge {
        app: Router,
        store: Arc<MemoryObjectStore>,
        cache: Arc<CountingResponseCache>,
        tasks: BackgroundTasks,
        backend: MockServer,
    }

    impl Edge {
        async fn start() -> Self {
            let backend = MockServer::start().await;
            Mock::given(method("PATCH"))
                .and(path("/admin/_count-download"))
                .respond_with(ResponseTemplate::new(204))
                .mount(&backend)
                .await;

            let store = Arc::new(MemoryObjectStore::new());
            let cache = Arc::new(CountingResponseCache::new(64));
            let tasks = BackgroundTasks::new();
            let settings = AccountingSettings {
                base_url: backend.uri(),
                admin_key: "admin".into(),
                rate_limit_key: "ratelimit".into(),
                client_ip_header: "CF-Connecting-IP".into(),
                timeout: Duration::from_secs(5),
            };
            let state = AppState {
                fetcher: ContentFetcher::new(
                    store.clone(),
                    cache.clone(),
                    tasks.clone(),
                    u64::MAX,
                ),
                accounting: AccountingReporter::new(&settings, tasks.clone()).unwrap(),
            };

            Self {
                app: routes().with_state(state),
                store,
                cache,
                tasks,
                backend,
            }
        }

        async fn send(&self, method: Method, uri: &str) -> Response {
            let request = HttpRequest::builder()
                .method(method)
                .uri(uri)
                .header(header::HOST, "cdn.test")
                .header("CF-Connecting-IP", "198.51.100.7")
                .body(Body::empty())
                .unwrap();
            self.app.clone().oneshot(request).await.unwrap()
        }

        async fn accounting_calls(&self) -> Vec<serde_json::Value> {
            self.tasks.drain().await;
            self.backend
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .map(|r| serde_json::from_slice(&r.body).unwrap())
                .collect()
        }
    }

    async fn body_bytes(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn version_download_is_served_and_counted() {
        let edge = Edge::start().await;
        let meta = edge.store.insert(
            "data/abc123/versions/v2/file.jar",
            b"PK\x03\x04 jar",
            HttpMetadata {
                content_type: Some("application/java-archive".into()),
                ..Default::default()
            },
        );

        let response = edge
            .send(Method::GET, "/data/abc123/versions/v2/file.jar")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            meta.size.to_string().as_str()
        );
        assert_eq!(response.headers()[header::ETAG], meta.http_etag.as_str());
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/java-archive"
        );
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"PK\x03\x04 jar"));

        let calls = edge.accounting_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["project_id"], "abc123");
        assert_eq!(calls[0]["version_name"], "v2");
        assert_eq!(calls[0]["ip"], "198.51.100.7");
        assert_eq!(
            calls[0]["url"],
            "https://cdn.test/data/abc123/versions/v2/file.jar"
        );
        assert_eq!(calls[0]["headers"]["host"], "cdn.test");
    }

    #[tokio::test]
    async fn unrelated_paths_are_served_without_accounting() {
        let edge = Edge::start().await;
        edge.store
            .insert("unrelated/path", b"plain", HttpMetadata::default());

        let response = edge.send(Method::GET, "/unrelated/path").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"plain"));
        assert!(edge.accounting_calls().await.is_empty());
    }

    #[tokio::test]
    async fn disallowed_methods_never_touch_cache_or_store() {
        let edge = Edge::start().await;
        edge.store
            .insert("data/a/versions/b/c.jar", b"x", HttpMetadata::default());

        for verb in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            let response = edge.send(verb, "/data/a/versions/b/c.jar").await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
            let body: serde_json::Value =
                serde_json::from_slice(&body_bytes(response).await).unwrap();
            assert_eq!(body["error"], "method_not_allowed");
        }

        assert_eq!(edge.store.query_count(), 0);
        assert_eq!(edge.cache.lookup_count(), 0);
        assert_eq!(edge.cache.put_count(), 0);
        assert!(edge.accounting_calls().await.is_empty());
    }

    #[tokio::test]
    async fn lowercase_method_is_rejected() {
        let edge = Edge::start().await;
        let response = edge
            .send(Method::from_bytes(b"get").unwrap(), "/anything")
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn options_is_a_bare_preflight() {
        let edge = Edge::start().await;
        let response = edge
            .send(Method::OPTIONS, "/data/a/versions/b/c.jar")
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ALLOW], "GET, HEAD, OPTIONS");
        for name in [
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            header::ACCESS_CONTROL_ALLOW_METHODS,
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            header::ACCESS_CONTROL_MAX_AGE,
        ] {
            assert!(!response.headers().contains_key(&name), "{name}");
        }
        assert!(body_bytes(response).await.is_empty());
        assert_eq!(edge.store.query_count(), 0);
        assert_eq!(edge.cache.lookup_count(), 0);
        assert!(edge.accounting_calls().await.is_empty());
    }

    #[tokio::test]
    async fn trailing_slash_is_not_found_without_store_query() {
        let edge = Edge::start().await;
        let response = edge.send(Method::GET, "/data/abc/").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let body: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(
            body,
            json!({"error": "not_found", "description": "the requested resource does not exist"})
        );
        assert_eq!(edge.store.query_count(), 0);
    }

    #[tokio::test]
    async fn second_get_is_served_from_cache() {
        let edge = Edge::start().await;
        edge.store.insert(
            "data/p/versions/1.0/mod.jar",
            b"cached payload",
            HttpMetadata::default(),
        );

        let first = edge.send(Method::GET, "/data/p/versions/1.0/mod.jar").await;
        let first_headers = first.headers().clone();
        let first_body = body_bytes(first).await;
        edge.tasks.drain().await;
        assert_eq!(edge.store.query_count(), 1);

        let second = edge.send(Method::GET, "/data/p/versions/1.0/mod.jar").await;
        assert_eq!(second.status(), StatusCode::OK);
        for name in [
            header::ETAG,
            header::CONTENT_LENGTH,
            header::CONTENT_TYPE,
            header::LAST_MODIFIED,
            header::CACHE_CONTROL,
        ] {
            assert_eq!(second.headers()[&name], first_headers[&name]);
        }
        assert_eq!(body_bytes(second).await, first_body);
        assert_eq!(edge.store.query_count(), 1);

        // Counted on the miss and on the hit.
        assert_eq!(edge.accounting_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn head_never_reads_body_or_fills_cache() {
        let edge = Edge::start().await;
        edge.store.insert(
            "data/p/versions/1.0/mod.jar",
            b"payload",
            HttpMetadata::default(),
        );

        let response = edge.send(Method::HEAD, "/data/p/versions/1.0/mod.jar").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "7");
        assert!(body_bytes(response).await.is_empty());

        assert_eq!(edge.store.get_count(), 0);
        assert_eq!(edge.store.head_count(), 1);
        assert!(edge.accounting_calls().await.is_empty());
        assert_eq!(edge.cache.len().await, 0);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let edge = Edge::start().await;
        let response = edge.send(Method::GET, "/data/p/versions/1.0/gone.jar").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Counting does not depend on the object existing.
        assert_eq!(edge.accounting_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn every_file_under_a_version_is_counted() {
        let edge = Edge::start().await;
        edge.store.insert(
            "data/p/versions/1.0/README.md",
            b"# readme",
            HttpMetadata::default(),
        );

        let response = edge.send(Method::GET, "/data/p/versions/1.0/README.md").await;
        assert_eq!(response.status(), StatusCode::OK);
        let calls = edge.accounting_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["project_id"], "p");
        assert_eq!(calls[0]["version_name"], "1.0");
    }

    #[tokio::test]
    async fn accounting_failure_does_not_affect_response() {
        let edge = Edge::start().await;
        edge.backend.reset().await;
        Mock::given(method("PATCH"))
            .and(body_partial_json(json!({"project_id": "p"})))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&edge.backend)
            .await;
        edge.store
            .insert("data/p/versions/1.0/mod.jar", b"ok", HttpMetadata::default());

        let response = edge.send(Method::GET, "/data/p/versions/1.0/mod.jar").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"ok"));
        edge.tasks.drain().await;
        edge.backend.verify().await;
    }

    #[tokio::test]
    async fn cached_not_found_entries_are_ignored() {
        let edge = Edge::start().await;
        edge.store
            .insert("files/a.bin", b"fresh", HttpMetadata::default());
        edge.cache
            .put(
                CacheKey::new(Method::GET, "https://cdn.test/files/a.bin"),
                CachedResponse {
                    status: StatusCode::NOT_FOUND,
                    headers: Default::default(),
                    body: Bytes::new(),
                },
            )
            .await;

        let response = edge.send(Method::GET, "/files/a.bin").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"fresh"));
        assert_eq!(edge.store.get_count(), 1);
    }
}
