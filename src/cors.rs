//! Cross-origin policy shared by every response the edge produces.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::Response,
};

/// Methods the edge answers. Anything else is rejected with 405.
pub const ALLOWED_METHODS: [Method; 3] = [Method::GET, Method::HEAD, Method::OPTIONS];

/// `ALLOWED_METHODS` joined for the `Allow` and `Access-Control-Allow-Methods` headers.
pub const ALLOWED_METHODS_HEADER: &str = "GET, HEAD, OPTIONS";

/// Exact, case-sensitive membership test against `ALLOWED_METHODS`.
pub fn is_allowed(method: &Method) -> bool {
    ALLOWED_METHODS.contains(method)
}

/// Insert the default CORS header set, overwriting existing values.
pub fn apply_cors_headers(headers: &mut HeaderMap) {
    let methods = HeaderValue::from_static(ALLOWED_METHODS_HEADER);
    headers.insert(header::ALLOW, methods.clone());
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
}

/// Answer an `OPTIONS` request: empty body, `Allow` header only.
pub fn preflight_response() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::ALLOW,
        HeaderValue::from_static(ALLOWED_METHODS_HEADER),
    );
    response
}
