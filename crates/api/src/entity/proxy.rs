//! Reverse proxy to a direct backend URL.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use tracing::{debug, warn};

/// Request headers passed through to the upstream.
const FORWARDED: [header::HeaderName; 6] = [
    header::RANGE,
    header::IF_MATCH,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_UNMODIFIED_SINCE,
    header::IF_RANGE,
];

/// Upstream response headers that never reach the client.
const STRIPPED: [header::HeaderName; 7] = [
    header::ETAG,
    header::CONTENT_DISPOSITION,
    header::CACHE_CONTROL,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TE,
    header::UPGRADE,
];

/// Fetch `url` and stream the upstream response back.
///
/// The body is streamed as it arrives; dropping the response stops the upstream read.
pub async fn forward(
    client: &reqwest::Client,
    method: &Method,
    url: &str,
    inbound: &HeaderMap,
    disposition: Option<&str>,
) -> Response {
    let mut request = client.request(method.clone(), url);
    for name in &FORWARDED {
        if let Some(value) = inbound.get(name) {
            request = request.header(name, value);
        }
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(error = %err, "Upstream request failed");
            return (StatusCode::BAD_GATEWAY, "failed to reach storage backend").into_response();
        }
    };
    let status = upstream.status();
    debug!(status = %status, "Proxying upstream response");

    let mut headers = upstream.headers().clone();
    for name in &STRIPPED {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    if let Some(value) = disposition.and_then(|d| HeaderValue::from_str(d).ok()) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(upstream.bytes_stream().map_err(std::io::Error::other))
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::get;
    use http_body_util::BodyExt;

    use super::*;

    async fn upstream() -> String {
        async fn object(headers: HeaderMap) -> Response {
            let range = headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            (
                [
                    (header::ETAG, "\"vendor\""),
                    (header::CACHE_CONTROL, "private"),
                    (header::CONTENT_DISPOSITION, "inline"),
                    (header::CONTENT_TYPE, "text/plain"),
                ],
                format!("range={range}"),
            )
                .into_response()
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/object", get(object)))
                .await
                .unwrap();
        });
        format!("http://{addr}/object")
    }

    #[tokio::test]
    async fn test_forward_strips_vendor_headers() {
        let url = upstream().await;
        let mut inbound = HeaderMap::new();
        inbound.insert(header::RANGE, HeaderValue::from_static("bytes=0-1"));
        inbound.insert(header::COOKIE, HeaderValue::from_static("session=secret"));

        let response = forward(
            &reqwest::Client::new(),
            &Method::GET,
            &url,
            &inbound,
            Some("attachment; filename=\"a.txt\""),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::ETAG).is_none());
        assert!(response.headers().get(header::CACHE_CONTROL).is_none());
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"a.txt\""
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"range=bytes=0-1");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let response = forward(
            &reqwest::Client::new(),
            &Method::GET,
            &format!("http://{addr}/gone"),
            &HeaderMap::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
