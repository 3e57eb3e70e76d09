//! Splits an upload into bounded chunks and drives per-chunk retries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::backoff::Backoff;
use crate::error::StorageError;
use crate::request::UploadRequest;

const BUFFER_TEMP_PREFIX: &str = "nimbus-chunk-";

/// Position and size of the chunk being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Zero-based chunk index.
    pub index: usize,
    /// Number of chunks in the upload.
    pub num: usize,
    /// Offset of the first byte of this chunk.
    pub start: u64,
    /// Number of bytes in this chunk.
    pub length: u64,
    /// Total upload size.
    pub total: u64,
}

impl ChunkInfo {
    /// Whether this is the final chunk.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.index + 1 == self.num
    }

    /// `Content-Range` value for this chunk: `bytes <start>-<end>/<total>`.
    #[must_use]
    pub fn range_header(&self) -> String {
        if self.length == 0 {
            return format!("bytes */{}", self.total);
        }
        format!(
            "bytes {}-{}/{}",
            self.start,
            self.start + self.length - 1,
            self.total
        )
    }
}

/// Work done for one chunk, e.g. sending it to a backend.
///
/// The reader yields at most `chunk.length` bytes.
#[async_trait]
pub trait ChunkProcessor: Send {
    /// Transfer one chunk.
    async fn process(
        &mut self,
        chunk: &ChunkInfo,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StorageError>;
}

/// A staged copy of one chunk. The temp file is removed when this is dropped.
struct ReplayBuffer {
    file: tokio::fs::File,
    _temp: tempfile::NamedTempFile,
}

/// Sequentially walks the chunks of one upload.
///
/// Holds the upload request mutably, so only one group can drive a request at a time.
pub struct ChunkGroup<'a> {
    file: &'a mut UploadRequest,
    chunk_size: u64,
    backoff: Box<dyn Backoff>,
    buffered: bool,
    temp_dir: PathBuf,
    index: i64,
    num: usize,
}

impl std::fmt::Debug for ChunkGroup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkGroup")
            .field("path", &self.file.props.path)
            .field("chunk_size", &self.chunk_size)
            .field("index", &self.index)
            .field("num", &self.num)
            .field("buffered", &self.buffered)
            .finish_non_exhaustive()
    }
}

impl<'a> ChunkGroup<'a> {
    /// Create a chunk group. A `chunk_size` of zero uploads the file as one chunk.
    ///
    /// When `buffered` is set and the source cannot seek, each chunk is staged in
    /// a temp file under `temp_dir` so it can be replayed on retry.
    #[must_use]
    pub fn new(
        file: &'a mut UploadRequest,
        chunk_size: u64,
        backoff: Box<dyn Backoff>,
        buffered: bool,
        temp_dir: impl AsRef<Path>,
    ) -> Self {
        let total = file.props.size;
        let chunk_size = if chunk_size == 0 { total } else { chunk_size };
        let num = if total == 0 {
            1
        } else {
            usize::try_from(total.div_ceil(chunk_size)).unwrap_or(usize::MAX)
        };

        Self {
            file,
            chunk_size,
            backoff,
            buffered,
            temp_dir: temp_dir.as_ref().to_path_buf(),
            index: -1,
            num,
        }
    }

    /// Advance to the next chunk. Returns false once every chunk was visited.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        self.index += 1;
        self.backoff.reset();
        usize::try_from(self.index).is_ok_and(|i| i < self.num)
    }

    /// Current chunk index; -1 before the first `next()`.
    #[must_use]
    pub const fn index(&self) -> i64 {
        self.index
    }

    /// Number of chunks.
    #[must_use]
    pub const fn num(&self) -> usize {
        self.num
    }

    /// Total upload size.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.file.props.size
    }

    /// Configured chunk size.
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Offset of the current chunk.
    #[must_use]
    pub fn start(&self) -> u64 {
        u64::try_from(self.index.max(0)).unwrap_or(0) * self.chunk_size
    }

    /// Length of the current chunk; the last chunk carries the remainder.
    #[must_use]
    pub fn length(&self) -> u64 {
        if self.is_last() {
            self.total() - self.chunk_size * u64::try_from(self.num - 1).unwrap_or(0)
        } else {
            self.chunk_size
        }
    }

    /// Whether the current chunk is the last one.
    #[must_use]
    pub fn is_last(&self) -> bool {
        usize::try_from(self.index).is_ok_and(|i| i + 1 == self.num)
    }

    /// `Content-Range` value for the current chunk.
    #[must_use]
    pub fn range_header(&self) -> String {
        self.info_unchecked().range_header()
    }

    /// Snapshot of the current chunk.
    ///
    /// # Errors
    ///
    /// Returns `ChunkOutOfRange` before the first `next()` or after the last chunk.
    pub fn info(&self) -> Result<ChunkInfo, StorageError> {
        match usize::try_from(self.index) {
            Ok(i) if i < self.num => Ok(self.info_unchecked()),
            _ => Err(StorageError::ChunkOutOfRange {
                index: self.index,
                num: self.num,
            }),
        }
    }

    fn info_unchecked(&self) -> ChunkInfo {
        ChunkInfo {
            index: usize::try_from(self.index.max(0)).unwrap_or(0),
            num: self.num,
            start: self.start(),
            length: self.length(),
            total: self.total(),
        }
    }

    /// Run `processor` over the current chunk, retrying under the backoff policy.
    ///
    /// Seekable sources are positioned at the chunk start before every attempt.
    /// A failed attempt is retried only if it was not a cancellation and the
    /// chunk can be replayed: either the source seeks back to the chunk start or
    /// a complete temp copy exists. Permanent failures carry the chunk index.
    pub async fn process<P>(&mut self, processor: &mut P) -> Result<(), StorageError>
    where
        P: ChunkProcessor + ?Sized,
    {
        let info = self.info()?;
        let chunk = self.index;

        let mut buffer = if self.buffered && !self.file.is_seekable() {
            Some(
                self.stage(info.length)
                    .await
                    .map_err(|e| StorageError::chunk(chunk, e))?,
            )
        } else {
            None
        };

        loop {
            if self.file.cancellation().is_cancelled() {
                return Err(StorageError::chunk(chunk, StorageError::Cancelled));
            }

            let result = match buffer.as_mut() {
                Some(replay) => {
                    replay
                        .file
                        .rewind()
                        .await
                        .map_err(|e| StorageError::chunk(chunk, e.into()))?;
                    debug!(chunk, "Chunk will be read from temp buffer");
                    let mut reader = (&mut replay.file).take(info.length);
                    processor.process(&info, &mut reader).await
                }
                None => {
                    if self.file.is_seekable() {
                        self.file.seek_to(info.start).await.map_err(|e| {
                            StorageError::chunk(
                                chunk,
                                StorageError::operation(format!(
                                    "failed to seek to chunk start: {e}"
                                )),
                            )
                        })?;
                    }
                    let mut reader = self.file.reader_mut().take(info.length);
                    processor.process(&info, &mut reader).await
                }
            };

            let err = match result {
                Ok(()) => {
                    debug!(chunk, "Chunk processed");
                    return Ok(());
                }
                Err(err) => err,
            };

            let replayable = self.file.is_seekable() || buffer.is_some();
            if err.is_cancelled() || !replayable || !self.backoff.next(&err).await {
                return Err(StorageError::chunk(chunk, err));
            }

            debug!(chunk, error = %err, "Retrying chunk");
        }
    }

    /// Copy the current chunk from the source into a fresh temp file.
    async fn stage(&mut self, length: u64) -> Result<ReplayBuffer, StorageError> {
        let temp = tempfile::Builder::new()
            .prefix(BUFFER_TEMP_PREFIX)
            .tempfile_in(&self.temp_dir)?;
        let mut file = tokio::fs::File::from_std(temp.reopen()?);

        let copied = tokio::io::copy(&mut self.file.reader_mut().take(length), &mut file).await?;
        file.flush().await?;
        if copied != length {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("upload source ended after {copied} of {length} bytes"),
            )));
        }

        debug!(
            chunk = self.index,
            path = %temp.path().display(),
            "Chunk staged in temp buffer"
        );
        Ok(ReplayBuffer { file, _temp: temp })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::chunk::backoff::{ConstantBackoff, NoBackoff};
    use crate::request::UploadProps;

    /// Records every attempt and fails the first `fail_first` of them.
    #[derive(Default)]
    struct Recorder {
        fail_first: usize,
        attempts: Vec<(usize, Vec<u8>)>,
    }

    #[async_trait]
    impl ChunkProcessor for Recorder {
        async fn process(
            &mut self,
            chunk: &ChunkInfo,
            reader: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<(), StorageError> {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            self.attempts.push((chunk.index, buf));
            if self.attempts.len() <= self.fail_first {
                return Err(StorageError::operation("transient"));
            }
            Ok(())
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir()
    }

    #[test]
    fn test_chunk_layout_for_uneven_size() {
        let mut req = UploadRequest::from_bytes(UploadProps::new("a.bin", 2_560_000), Vec::new());
        let mut group = ChunkGroup::new(&mut req, 1_000_000, Box::new(NoBackoff), false, temp_dir());

        assert_eq!(group.num(), 3);
        assert_eq!(group.index(), -1);

        let mut lengths = Vec::new();
        let mut last_range = String::new();
        while group.next() {
            lengths.push(group.length());
            last_range = group.range_header();
        }

        assert_eq!(lengths, vec![1_000_000, 1_000_000, 560_000]);
        assert_eq!(last_range, "bytes 2000000-2559999/2560000");
        assert!(group.info().is_err());
    }

    #[test]
    fn test_zero_chunk_size_means_single_chunk() {
        let mut req = UploadRequest::from_bytes(UploadProps::new("a.bin", 42), vec![0u8; 42]);
        let mut group = ChunkGroup::new(&mut req, 0, Box::new(NoBackoff), false, temp_dir());

        assert_eq!(group.num(), 1);
        assert!(group.next());
        assert!(group.is_last());
        assert_eq!(group.length(), 42);
        assert_eq!(group.range_header(), "bytes 0-41/42");
        assert!(!group.next());
    }

    #[test]
    fn test_empty_upload_has_one_empty_chunk() {
        let mut req = UploadRequest::from_bytes(UploadProps::new("empty", 0), Vec::new());
        let mut group = ChunkGroup::new(&mut req, 1024, Box::new(NoBackoff), false, temp_dir());

        assert_eq!(group.num(), 1);
        assert!(group.next());
        assert_eq!(group.length(), 0);
        assert_eq!(group.range_header(), "bytes */0");
    }

    #[test]
    fn test_info_before_first_chunk_is_out_of_range() {
        let mut req = UploadRequest::from_bytes(UploadProps::new("a", 3), "abc");
        let group = ChunkGroup::new(&mut req, 1, Box::new(NoBackoff), false, temp_dir());

        assert!(matches!(
            group.info(),
            Err(StorageError::ChunkOutOfRange { index: -1, num: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seekable_source_retries_same_bytes() {
        let data = payload(10);
        let mut req = UploadRequest::from_bytes(UploadProps::new("a", 10), data.clone());
        let backoff = ConstantBackoff::new(Duration::from_millis(10), 3);
        let mut group = ChunkGroup::new(&mut req, 4, Box::new(backoff), false, temp_dir());
        let mut recorder = Recorder {
            fail_first: 2,
            ..Recorder::default()
        };

        assert!(group.next());
        assert!(group.next());
        group.process(&mut recorder).await.unwrap();

        assert_eq!(recorder.attempts.len(), 3);
        for (index, bytes) in &recorder.attempts {
            assert_eq!(*index, 1);
            assert_eq!(bytes.as_slice(), &data[4..8]);
        }
    }

    #[tokio::test]
    async fn test_first_attempt_reads_from_chunk_start() {
        let data = payload(10);
        let mut req = UploadRequest::from_bytes(UploadProps::new("a", 10), data.clone());
        let mut sniffed = [0u8; 6];
        req.reader_mut().read_exact(&mut sniffed).await.unwrap();

        let mut group = ChunkGroup::new(&mut req, 4, Box::new(NoBackoff), false, temp_dir());
        let mut recorder = Recorder::default();
        while group.next() {
            group.process(&mut recorder).await.unwrap();
        }

        let bytes: Vec<_> = recorder.attempts.into_iter().map(|(_, b)| b).collect();
        assert_eq!(bytes, vec![data[..4].to_vec(), data[4..8].to_vec(), data[8..].to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_stream_replays_identical_bytes() {
        let data = payload(9);
        let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(data.clone()))]);
        let mut req = UploadRequest::from_stream(UploadProps::new("a", 9), stream);
        let backoff = ConstantBackoff::new(Duration::from_millis(10), 5);
        let mut group = ChunkGroup::new(&mut req, 5, Box::new(backoff), true, temp_dir());
        let mut recorder = Recorder {
            fail_first: 1,
            ..Recorder::default()
        };

        while group.next() {
            group.process(&mut recorder).await.unwrap();
        }

        let seen: Vec<_> = recorder.attempts.iter().map(|(i, b)| (*i, b.len())).collect();
        assert_eq!(seen, vec![(0, 5), (0, 5), (1, 4)]);
        assert_eq!(recorder.attempts[0].1, recorder.attempts[1].1);
        assert_eq!(recorder.attempts[0].1.as_slice(), &data[..5]);
        assert_eq!(recorder.attempts[2].1.as_slice(), &data[5..]);
    }

    #[tokio::test]
    async fn test_unbuffered_stream_is_not_retried() {
        let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"abc"))]);
        let mut req = UploadRequest::from_stream(UploadProps::new("a", 3), stream);
        let backoff = ConstantBackoff::new(Duration::from_millis(10), 5);
        let mut group = ChunkGroup::new(&mut req, 0, Box::new(backoff), false, temp_dir());
        let mut recorder = Recorder {
            fail_first: 1,
            ..Recorder::default()
        };

        assert!(group.next());
        let err = group.process(&mut recorder).await.unwrap_err();

        assert_eq!(recorder.attempts.len(), 1);
        assert!(matches!(err, StorageError::Chunk { index: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_chunk_index() {
        let mut req = UploadRequest::from_bytes(UploadProps::new("a", 6), payload(6));
        let backoff = ConstantBackoff::new(Duration::from_millis(10), 2);
        let mut group = ChunkGroup::new(&mut req, 3, Box::new(backoff), false, temp_dir());
        let mut recorder = Recorder {
            fail_first: usize::MAX,
            ..Recorder::default()
        };

        assert!(group.next());
        assert!(group.next());
        let err = group.process(&mut recorder).await.unwrap_err();

        assert_eq!(recorder.attempts.len(), 3);
        assert!(err.to_string().starts_with("failed to upload chunk #1:"));
    }

    #[tokio::test]
    async fn test_cancelled_request_is_not_retried() {
        let token = tokio_util::sync::CancellationToken::new();
        let mut req = UploadRequest::from_bytes(UploadProps::new("a", 4), payload(4))
            .with_cancellation(token.clone());
        token.cancel();
        let backoff = ConstantBackoff::new(Duration::from_millis(10), 5);
        let mut group = ChunkGroup::new(&mut req, 0, Box::new(backoff), false, temp_dir());
        let mut recorder = Recorder::default();

        assert!(group.next());
        let err = group.process(&mut recorder).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(recorder.attempts.is_empty());
    }
}
