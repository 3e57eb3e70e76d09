//! Serving a seekable body with conditional and range semantics.

use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::PathBuf;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::error;
use uuid::Uuid;

use super::conditional::{Precondition, check_preconditions, format_http_date};
use super::content_type::{SNIFF_LEN, content_type_for_name, sniff};
use super::limiter::throttle;
use super::range::{HttpRange, RangeError, parse_range, total_length};

/// Random-access byte content.
pub trait ContentReader: Send {
    /// Stream `length` bytes starting at `offset`.
    fn range(
        &mut self,
        offset: u64,
        length: u64,
    ) -> impl Future<Output = io::Result<BoxStream<'static, io::Result<Bytes>>>> + Send;

    /// Up to `max` leading bytes.
    fn head(&mut self, max: usize) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

impl ContentReader for Bytes {
    async fn range(
        &mut self,
        offset: u64,
        length: u64,
    ) -> io::Result<BoxStream<'static, io::Result<Bytes>>> {
        let start = (offset as usize).min(self.len());
        let end = start.saturating_add(length as usize).min(self.len());
        let slice = self.slice(start..end);
        Ok(stream::once(async move { Ok(slice) }).boxed())
    }

    async fn head(&mut self, max: usize) -> io::Result<Vec<u8>> {
        Ok(self[..max.min(self.len())].to_vec())
    }
}

/// A file on local disk.
///
/// The handle opened when probing serves the first range; later ranges reopen
/// the path so every part streams from its own cursor.
#[derive(Debug)]
pub struct FileContent {
    path: PathBuf,
    file: Option<File>,
}

impl FileContent {
    /// Wrap an already opened file.
    #[must_use]
    pub fn new(file: File, path: PathBuf) -> Self {
        Self {
            path,
            file: Some(file),
        }
    }

    /// Size on disk.
    pub async fn size(&mut self) -> io::Result<u64> {
        let file = self.take_file().await?;
        let len = file.metadata().await?.len();
        self.file = Some(file);
        Ok(len)
    }

    async fn take_file(&mut self) -> io::Result<File> {
        match self.file.take() {
            Some(file) => Ok(file),
            None => File::open(&self.path).await,
        }
    }
}

impl ContentReader for FileContent {
    async fn range(
        &mut self,
        offset: u64,
        length: u64,
    ) -> io::Result<BoxStream<'static, io::Result<Bytes>>> {
        let mut file = self.take_file().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(ReaderStream::new(file.take(length)).boxed())
    }

    async fn head(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut file = self.take_file().await?;
        file.seek(SeekFrom::Start(0)).await?;
        let mut buf = Vec::with_capacity(max);
        (&mut file).take(max as u64).read_to_end(&mut buf).await?;
        file.seek(SeekFrom::Start(0)).await?;
        self.file = Some(file);
        Ok(buf)
    }
}

/// Response metadata for one piece of content.
#[derive(Debug, Clone, Default)]
pub struct ServeParams {
    /// Name used for extension-based content typing.
    pub name: String,
    /// Content length in bytes.
    pub size: u64,
    /// Last modification; `None` disables date validators.
    pub modified: Option<DateTime<Utc>>,
    /// Quoted entity tag.
    pub etag: Option<String>,
    /// Explicit content type.
    pub content_type: Option<String>,
    /// `Content-Disposition` value.
    pub disposition: Option<String>,
    /// Bytes per second; zero is unlimited.
    pub speed: u64,
}

/// Answer `method` with `content`, honoring preconditions and `Range`.
pub async fn serve_content<C: ContentReader>(
    method: &Method,
    headers: &HeaderMap,
    params: ServeParams,
    content: &mut C,
) -> Response {
    let mut out = HeaderMap::new();
    if let Some(modified) = params.modified {
        set(&mut out, header::LAST_MODIFIED, &format_http_date(modified));
    }
    if let Some(etag) = &params.etag {
        set(&mut out, header::ETAG, etag);
    }
    if let Some(disposition) = &params.disposition {
        set(&mut out, header::CONTENT_DISPOSITION, disposition);
    }

    let range_header =
        match check_preconditions(method, headers, params.etag.as_deref(), params.modified) {
            Precondition::Failed => return with_headers(StatusCode::PRECONDITION_FAILED, out),
            Precondition::NotModified => return not_modified(out),
            Precondition::Proceed(range) => range,
        };

    let content_type = match params
        .content_type
        .clone()
        .or_else(|| content_type_for_name(&params.name).map(str::to_string))
    {
        Some(ct) => ct,
        None => match content.head(SNIFF_LEN).await {
            Ok(head) => sniff(&head).to_string(),
            Err(err) => return read_error(&err),
        },
    };
    set(&mut out, header::CONTENT_TYPE, &content_type);

    let size = params.size;
    let mut ranges = if size == 0 {
        Vec::new()
    } else {
        match parse_range(range_header.as_deref().unwrap_or_default(), size) {
            Ok(ranges) => ranges,
            Err(err) => return range_not_satisfiable(err, size),
        }
    };
    if total_length(&ranges) > size {
        ranges.clear();
    }

    set(&mut out, header::ACCEPT_RANGES, "bytes");
    let is_head = method == Method::HEAD;
    let (status, length, body) = match ranges.as_slice() {
        [] => {
            let body = if is_head {
                None
            } else {
                match content.range(0, size).await {
                    Ok(body) => Some(body),
                    Err(err) => return read_error(&err),
                }
            };
            (StatusCode::OK, size, body)
        }
        [range] => {
            set(&mut out, header::CONTENT_RANGE, &range.content_range(size));
            let body = if is_head {
                None
            } else {
                match content.range(range.start, range.length).await {
                    Ok(body) => Some(body),
                    Err(err) => return read_error(&err),
                }
            };
            (StatusCode::PARTIAL_CONTENT, range.length, body)
        }
        many => {
            let boundary = Uuid::new_v4().simple().to_string();
            let parts = multipart_headers(many, size, &content_type, &boundary);
            let closing = format!("\r\n--{boundary}--\r\n");
            let length = parts.iter().map(|p| p.len() as u64).sum::<u64>()
                + total_length(many)
                + closing.len() as u64;
            set(
                &mut out,
                header::CONTENT_TYPE,
                &format!("multipart/byteranges; boundary={boundary}"),
            );
            let body = if is_head {
                None
            } else {
                let mut segments = Vec::with_capacity(many.len() * 2 + 1);
                for (range, part) in many.iter().zip(parts) {
                    segments.push(stream::once(async move { Ok(Bytes::from(part)) }).boxed());
                    match content.range(range.start, range.length).await {
                        Ok(body) => segments.push(body),
                        Err(err) => return read_error(&err),
                    }
                }
                segments.push(stream::once(async move { Ok(Bytes::from(closing)) }).boxed());
                Some(stream::iter(segments).flatten().boxed())
            };
            (StatusCode::PARTIAL_CONTENT, length, body)
        }
    };
    set(&mut out, header::CONTENT_LENGTH, &length.to_string());

    let body = body.map_or_else(Body::empty, |body| {
        Body::from_stream(throttle(body, params.speed))
    });
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = out;
    response
}

fn multipart_headers(
    ranges: &[HttpRange],
    size: u64,
    content_type: &str,
    boundary: &str,
) -> Vec<String> {
    ranges
        .iter()
        .enumerate()
        .map(|(i, range)| {
            let lead = if i == 0 { "" } else { "\r\n" };
            format!(
                "{lead}--{boundary}\r\nContent-Range: {}\r\nContent-Type: {content_type}\r\n\r\n",
                range.content_range(size)
            )
        })
        .collect()
}

fn set(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn with_headers(status: StatusCode, headers: HeaderMap) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn not_modified(mut headers: HeaderMap) -> Response {
    headers.remove(header::CONTENT_TYPE);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);
    if headers.contains_key(header::ETAG) {
        headers.remove(header::LAST_MODIFIED);
    }
    with_headers(StatusCode::NOT_MODIFIED, headers)
}

fn range_not_satisfiable(err: RangeError, size: u64) -> Response {
    let mut response = (StatusCode::RANGE_NOT_SATISFIABLE, err.to_string()).into_response();
    if err == RangeError::NoOverlap {
        set(
            response.headers_mut(),
            header::CONTENT_RANGE,
            &format!("bytes */{size}"),
        );
    }
    response
}

fn read_error(err: &io::Error) -> Response {
    error!(error = %err, "Failed to read entity content");
    (StatusCode::INTERNAL_SERVER_ERROR, "failed to read content").into_response()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use http_body_util::BodyExt;

    use super::*;

    fn params(size: u64) -> ServeParams {
        ServeParams {
            name: "data.txt".into(),
            size,
            modified: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            etag: Some("\"tag\"".into()),
            ..ServeParams::default()
        }
    }

    fn request(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    async fn body_of(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    async fn get(pairs: &[(header::HeaderName, &str)], data: &'static [u8]) -> Response {
        let mut content = Bytes::from_static(data);
        serve_content(
            &Method::GET,
            &request(pairs),
            params(data.len() as u64),
            &mut content,
        )
        .await
    }

    #[tokio::test]
    async fn test_full_body() {
        let response = get(&[], b"0123456789").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.headers()[header::ETAG], "\"tag\"");
        assert_eq!(
            response.headers()[header::LAST_MODIFIED],
            "Wed, 01 May 2024 12:00:00 GMT"
        );
        assert_eq!(body_of(response).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_first_byte() {
        let response = get(&[(header::RANGE, "bytes=0-0")], b"0123456789").await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-0/10");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1");
        assert_eq!(body_of(response).await, b"0");
    }

    #[tokio::test]
    async fn test_suffix_range() {
        let response = get(&[(header::RANGE, "bytes=-5")], b"0123456789").await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 5-9/10");
        assert_eq!(body_of(response).await, b"56789");
    }

    #[tokio::test]
    async fn test_range_past_end_is_unsatisfiable() {
        let response = get(&[(header::RANGE, "bytes=20-")], b"0123456789").await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn test_malformed_range_is_unsatisfiable() {
        let response = get(&[(header::RANGE, "bytes=9-1")], b"0123456789").await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
    }

    #[tokio::test]
    async fn test_empty_content_ignores_range() {
        let response = get(&[(header::RANGE, "bytes=20-")], b"").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "0");
    }

    #[tokio::test]
    async fn test_oversized_range_set_is_ignored() {
        let response = get(&[(header::RANGE, "bytes=0-7,2-9")], b"0123456789").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_not_modified_strips_entity_headers() {
        let response = get(&[(header::IF_NONE_MATCH, "\"tag\"")], b"0123456789").await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
        assert!(response.headers().get(header::LAST_MODIFIED).is_none());
        assert_eq!(response.headers()[header::ETAG], "\"tag\"");
    }

    #[tokio::test]
    async fn test_if_match_mismatch_fails() {
        let response = get(&[(header::IF_MATCH, "\"other\"")], b"0123456789").await;
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_multipart_byteranges() {
        let response = get(&[(header::RANGE, "bytes=0-1,8-9")], b"0123456789").await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let content_type = response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .to_string();
        let boundary = content_type
            .strip_prefix("multipart/byteranges; boundary=")
            .unwrap()
            .to_string();
        let length: usize = response.headers()[header::CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();

        let body = String::from_utf8(body_of(response).await).unwrap();
        assert_eq!(body.len(), length);
        let expected = format!(
            "--{boundary}\r\nContent-Range: bytes 0-1/10\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n01\
             \r\n--{boundary}\r\nContent-Range: bytes 8-9/10\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n89\
             \r\n--{boundary}--\r\n"
        );
        assert_eq!(body, expected);
    }

    #[tokio::test]
    async fn test_head_has_length_but_no_body() {
        let mut content = Bytes::from_static(b"0123456789");
        let response =
            serve_content(&Method::HEAD, &HeaderMap::new(), params(10), &mut content).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_sniffs_unknown_extension() {
        let mut content = Bytes::from_static(b"%PDF-1.7 body");
        let mut p = params(13);
        p.name = "report".into();
        let response = serve_content(&Method::GET, &HeaderMap::new(), p, &mut content).await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
    }

    #[tokio::test]
    async fn test_file_content_serves_ranges_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"abcdefghij").await.unwrap();

        let file = File::open(&path).await.unwrap();
        let mut content = FileContent::new(file, path);
        assert_eq!(content.size().await.unwrap(), 10);

        let response = serve_content(
            &Method::GET,
            &request(&[(header::RANGE, "bytes=1-2,5-6")]),
            params(10),
            &mut content,
        )
        .await;
        let body = String::from_utf8(body_of(response).await).unwrap();
        assert!(body.contains("\r\n\r\nbc\r\n"));
        assert!(body.contains("\r\n\r\nfg\r\n"));
    }
}
