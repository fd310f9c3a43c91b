//! Streaming downloads: single blobs and zip archives built on the fly.
//!
//! Neither path buffers a whole object. Archive members are pulled one at a
//! time through a blocking deflate task that hands fixed-size chunks to the
//! response body over a bounded channel.

use crate::services::storage::{BlobLocation, BlobStat, BlobStore, StorageError};
use bytes::Bytes;
use futures::Stream;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Response body stream handed to the HTTP layer
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Chunks buffered between the deflate task and the response body
const ARCHIVE_CHANNEL_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Object not found: {0}")]
    NotFound(BlobLocation),

    #[error("Archive member not found: {location}")]
    PartialNotFound { location: BlobLocation },

    #[error(transparent)]
    Storage(StorageError),
}

/// One entry of a streamed archive
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    pub location: BlobLocation,
    pub entry_name: String,
}

impl ArchiveMember {
    /// Member named after the last two key segments
    pub fn from_location(location: BlobLocation) -> Self {
        let entry_name = location.archive_entry_name();
        Self {
            location,
            entry_name,
        }
    }
}

/// Logs the end of a transfer on every exit path, including client disconnects
struct ReleaseGuard {
    description: String,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        tracing::debug!("🔌 Released {}", self.description);
    }
}

/// Forwards an inner stream and owns the release guard for its lifetime
struct GuardedStream<S> {
    inner: S,
    _release: ReleaseGuard,
}

impl<S> Stream for GuardedStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// `Write` sink that cuts the archive into chunks and pushes them to the body.
///
/// `blocking_send` parks the deflate task while the channel is full.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    pending: Vec<u8>,
    chunk_size: usize,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>, chunk_size: usize) -> Self {
        Self {
            tx,
            pending: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn send_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_size));
        self.tx
            .blocking_send(Ok(Bytes::from(chunk)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "download receiver dropped"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.chunk_size - self.pending.len();
        let n = buf.len().min(room);
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() >= self.chunk_size {
            self.send_pending()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_pending()
    }
}

fn storage_to_io(e: StorageError) -> io::Error {
    match e {
        StorageError::NotFound(location) => io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} disappeared during download", location),
        ),
        StorageError::Backend(msg) => io::Error::other(msg),
    }
}

fn write_archive(
    handle: &Handle,
    store: &dyn BlobStore,
    members: &[(ArchiveMember, BlobStat)],
    sink: ChannelWriter,
) -> io::Result<()> {
    let mut zip = ZipWriter::new_stream(sink);

    for (member, stat) in members {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(stat.size >= u32::MAX as u64);
        zip.start_file(member.entry_name.as_str(), options)
            .map_err(io::Error::other)?;

        let reader = handle
            .block_on(store.get(&member.location))
            .map_err(storage_to_io)?;
        let mut reader = SyncIoBridge::new_with_handle(reader, handle.clone());
        io::copy(&mut reader, &mut zip)?;
    }

    let mut sink = zip.finish().map_err(io::Error::other)?;
    sink.flush()
}

pub struct TransferStreamer {
    store: Arc<dyn BlobStore>,
    chunk_size: usize,
}

impl TransferStreamer {
    pub fn new(store: Arc<dyn BlobStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Streams one blob in `chunk_size` pieces.
    pub async fn stream_one(&self, location: &BlobLocation) -> Result<ByteStream, TransferError> {
        let reader = self.store.get(location).await.map_err(|e| match e {
            StorageError::NotFound(location) => TransferError::NotFound(location),
            other => TransferError::Storage(other),
        })?;

        tracing::debug!("📤 Streaming {}", location);
        Ok(Box::pin(GuardedStream {
            inner: ReaderStream::with_capacity(reader, self.chunk_size),
            _release: ReleaseGuard {
                description: format!("reader for {}", location),
            },
        }))
    }

    /// Streams a deflated zip of `members`, in order.
    ///
    /// Every member is checked before the first byte, so a missing object
    /// fails the request instead of truncating the archive. A member that
    /// vanishes after that check ends the body with an error.
    pub async fn stream_zip(&self, members: Vec<ArchiveMember>) -> Result<ByteStream, TransferError> {
        let mut checked = Vec::with_capacity(members.len());
        for member in members {
            let stat = self.store.stat(&member.location).await.map_err(|e| match e {
                StorageError::NotFound(location) => TransferError::PartialNotFound { location },
                other => TransferError::Storage(other),
            })?;
            checked.push((member, stat));
        }

        let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(ARCHIVE_CHANNEL_DEPTH);
        let store = self.store.clone();
        let handle = Handle::current();
        let chunk_size = self.chunk_size;
        let count = checked.len();

        tokio::task::spawn_blocking(move || {
            let sink = ChannelWriter::new(tx.clone(), chunk_size);
            match write_archive(&handle, store.as_ref(), &checked, sink) {
                Ok(()) => tracing::debug!("📦 Archive of {} members complete", count),
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::info!("Archive download abandoned by client");
                }
                Err(e) => {
                    tracing::error!("❌ Archive stream failed: {}", e);
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        let body = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(Box::pin(GuardedStream {
            inner: body,
            _release: ReleaseGuard {
                description: format!("archive stream of {} members", count),
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::MemoryBlobStore;
    use futures::StreamExt;

    async fn collect(mut stream: ByteStream) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_stream_one_chunks_content() {
        let store = MemoryBlobStore::new();
        let location = BlobLocation::new("models", "e/o/data.csv");
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        store.insert(&location, data.clone(), "text/csv");

        let streamer = TransferStreamer::new(Arc::new(store.clone()), 8192);
        let mut stream = streamer.stream_one(&location).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 8192);
        let mut body = first.to_vec();
        body.extend(collect(stream).await.unwrap());
        assert_eq!(body, data);
        assert_eq!(store.open_readers(), 0);
    }

    #[tokio::test]
    async fn test_stream_one_not_found() {
        let streamer = TransferStreamer::new(Arc::new(MemoryBlobStore::new()), 8192);
        let err = streamer
            .stream_one(&BlobLocation::new("models", "missing"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_reader() {
        let store = MemoryBlobStore::new();
        let location = BlobLocation::new("models", "e/o/big.bin");
        store.insert(&location, vec![7u8; 100_000], "application/octet-stream");

        let streamer = TransferStreamer::new(Arc::new(store.clone()), 8192);
        let mut stream = streamer.stream_one(&location).await.unwrap();
        stream.next().await.unwrap().unwrap();
        assert_eq!(store.open_readers(), 1);

        drop(stream);
        assert_eq!(store.open_readers(), 0);
    }

    #[tokio::test]
    async fn test_zip_missing_member_fails_before_streaming() {
        let store = MemoryBlobStore::new();
        let present = BlobLocation::new("models", "e/a/one.csv");
        store.insert(&present, "a,b\n1,2\n", "text/csv");
        let missing = BlobLocation::new("models", "e/b/two.csv");

        let streamer = TransferStreamer::new(Arc::new(store.clone()), 8192);
        let err = streamer
            .stream_zip(vec![
                ArchiveMember::from_location(present),
                ArchiveMember::from_location(missing.clone()),
            ])
            .await
            .err()
            .unwrap();

        match err {
            TransferError::PartialNotFound { location } => assert_eq!(location, missing),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(store.open_readers(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zip_contains_members_in_order() {
        let store = MemoryBlobStore::new();
        let a = BlobLocation::new("models", "e/a/one.csv");
        let b = BlobLocation::new("models", "e/b/two.txt");
        let big: Vec<u8> = (0..50_000u32).map(|i| (i % 13) as u8).collect();
        store.insert(&a, "a,b\n1,2\n", "text/csv");
        store.insert(&b, big.clone(), "text/plain");

        let streamer = TransferStreamer::new(Arc::new(store.clone()), 1024);
        let stream = streamer
            .stream_zip(vec![
                ArchiveMember::from_location(a),
                ArchiveMember::from_location(b),
            ])
            .await
            .unwrap();
        let archive = collect(stream).await.unwrap();

        let mut zip = zip::ZipArchive::new(io::Cursor::new(archive)).unwrap();
        assert_eq!(zip.len(), 2);
        assert_eq!(zip.by_index(0).unwrap().name().unwrap(), "a/one.csv");
        assert_eq!(zip.by_index(1).unwrap().name().unwrap(), "b/two.txt");

        let mut second = Vec::new();
        io::Read::read_to_end(&mut zip.by_name("b/two.txt").unwrap(), &mut second).unwrap();
        assert_eq!(second, big);
        assert_eq!(store.open_readers(), 0);
    }

    /// Bytes deflate cannot shrink, so the archive is about as large as its input
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x9e37_79b9;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect()
    }

    async fn wait_for_readers(store: &MemoryBlobStore, expected: usize) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while store.open_readers() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} readers still open",
                store.open_readers()
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zip_member_removed_mid_stream_ends_with_error() {
        let store = MemoryBlobStore::new();
        let a = BlobLocation::new("models", "e/a/first.bin");
        let b = BlobLocation::new("models", "e/b/second.csv");
        store.insert(&a, noise(64 * 1024), "application/octet-stream");
        store.insert(&b, "a,b\n1,2\n", "text/csv");

        let streamer = TransferStreamer::new(Arc::new(store.clone()), 1024);
        let stream = streamer
            .stream_zip(vec![
                ArchiveMember::from_location(a),
                ArchiveMember::from_location(b.clone()),
            ])
            .await
            .unwrap();

        // The writer stalls on the bounded channel long before it reaches the second member
        store.remove(&b);
        assert!(!store.contains(&b));

        let err = collect(stream).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("e/b/second.csv"));
        wait_for_readers(&store, 0).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropping_zip_stream_mid_archive_releases_reader() {
        let store = MemoryBlobStore::new();
        let location = BlobLocation::new("models", "e/a/large.bin");
        store.insert(&location, noise(512 * 1024), "application/octet-stream");

        let streamer = TransferStreamer::new(Arc::new(store.clone()), 1024);
        let mut stream = streamer
            .stream_zip(vec![ArchiveMember::from_location(location)])
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1024);
        assert_eq!(store.open_readers(), 1);

        drop(stream);
        wait_for_readers(&store, 0).await;
    }
}
