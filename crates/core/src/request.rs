//! Upload requests: a byte stream plus the properties of the object it becomes.

use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, ReadBuf};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// A byte source for an upload.
///
/// Every source implements `AsyncSeek`, but only sources reporting
/// `is_seekable() == true` may actually be rewound; the rest are read once.
pub trait UploadReader: AsyncRead + AsyncSeek + Send + Unpin {
    /// Whether the source can be rewound independently of any local buffer.
    fn is_seekable(&self) -> bool;
}

impl UploadReader for tokio::fs::File {
    fn is_seekable(&self) -> bool {
        true
    }
}

impl<T> UploadReader for io::Cursor<T>
where
    T: AsRef<[u8]> + Send + Unpin,
{
    fn is_seekable(&self) -> bool {
        true
    }
}

/// Wraps a read-once source. Seeking always fails.
#[derive(Debug)]
pub struct Unseekable<R>(pub R);

impl<R: AsyncRead + Unpin> AsyncRead for Unseekable<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl<R: Unpin> AsyncSeek for Unseekable<R> {
    fn start_seek(self: Pin<&mut Self>, _position: SeekFrom) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "upload source is not seekable",
        ))
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "upload source is not seekable",
        )))
    }
}

impl<R: AsyncRead + Send + Unpin> UploadReader for Unseekable<R> {
    fn is_seekable(&self) -> bool {
        false
    }
}

/// Properties of the object being uploaded.
#[derive(Debug, Clone, Default)]
pub struct UploadProps {
    /// Target path or key inside the storage policy.
    pub path: String,
    /// Number of bytes the source will yield.
    pub size: u64,
    /// MIME type, if known.
    pub mime_type: Option<String>,
    /// Replace an existing object at `path`.
    pub overwrite: bool,
    /// Offset inside the target where these bytes land (chunk relays).
    pub offset: u64,
    /// When the upload (or the credential issued for it) expires.
    pub expire: Option<DateTime<Utc>>,
}

impl UploadProps {
    /// Properties for a whole-object upload of `size` bytes to `path`.
    #[must_use]
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            ..Self::default()
        }
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Allow replacing an existing object.
    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Place the bytes at `offset` inside the target.
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Set the expiry.
    #[must_use]
    pub fn with_expire(mut self, expire: DateTime<Utc>) -> Self {
        self.expire = Some(expire);
        self
    }
}

/// A byte stream bound for a storage driver.
///
/// Consumed once per `put`; dropping it releases the source on every exit path.
pub struct UploadRequest {
    /// Object properties.
    pub props: UploadProps,
    reader: Box<dyn UploadReader>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("props", &self.props)
            .field("seekable", &self.reader.is_seekable())
            .finish_non_exhaustive()
    }
}

impl UploadRequest {
    /// Create a request over any upload reader.
    #[must_use]
    pub fn new(props: UploadProps, reader: Box<dyn UploadReader>) -> Self {
        Self {
            props,
            reader,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a seekable request over an in-memory buffer.
    #[must_use]
    pub fn from_bytes(props: UploadProps, data: impl Into<Bytes>) -> Self {
        Self::new(props, Box::new(io::Cursor::new(data.into())))
    }

    /// Create a read-once request over a byte stream.
    #[must_use]
    pub fn from_stream<S>(props: UploadProps, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
    {
        Self::new(props, Box::new(Unseekable(StreamReader::new(stream))))
    }

    /// Bind the request to a caller's cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancellation token observed by every operation on this request.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the source can be rewound.
    #[must_use]
    pub fn is_seekable(&self) -> bool {
        self.reader.is_seekable()
    }

    /// Mutable access to the underlying reader.
    pub fn reader_mut(&mut self) -> &mut Box<dyn UploadReader> {
        &mut self.reader
    }

    /// Rewind a seekable source to `position`.
    ///
    /// # Errors
    ///
    /// Returns an `Unsupported` I/O error for read-once sources.
    pub async fn seek_to(&mut self, position: u64) -> io::Result<u64> {
        if !self.reader.is_seekable() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "upload source is not seekable",
            ));
        }
        self.reader.seek(SeekFrom::Start(position)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bytes_request_is_seekable() {
        let mut req = UploadRequest::from_bytes(UploadProps::new("a.txt", 5), "hello");
        assert!(req.is_seekable());

        let mut first = String::new();
        req.reader_mut().read_to_string(&mut first).await.unwrap();
        req.seek_to(1).await.unwrap();
        let mut second = String::new();
        req.reader_mut().read_to_string(&mut second).await.unwrap();

        assert_eq!(first, "hello");
        assert_eq!(second, "ello");
    }

    #[tokio::test]
    async fn test_stream_request_refuses_seek() {
        let stream = futures::stream::iter(vec![Ok(Bytes::from_static(b"abc"))]);
        let mut req = UploadRequest::from_stream(UploadProps::new("a.txt", 3), stream);
        assert!(!req.is_seekable());

        let err = req.seek_to(0).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_props_builder() {
        let props = UploadProps::new("x/y.bin", 10)
            .with_overwrite(true)
            .with_offset(4)
            .with_mime_type("application/octet-stream");
        assert!(props.overwrite);
        assert_eq!(props.offset, 4);
        assert_eq!(props.mime_type.as_deref(), Some("application/octet-stream"));
    }
}
