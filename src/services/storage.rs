use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Tag, Tagging};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Boxed byte source handed out by `BlobStore::get` and accepted by `put`
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Objects at or below this size go up in a single `PutObject`
const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;
const PART_SIZE: usize = 10 * 1024 * 1024;

/// Bucket and key of one blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobLocation {
    pub bucket: String,
    pub key: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parses `bucket/key`, where the key may itself contain slashes.
    pub fn parse(descriptor: &str) -> Option<Self> {
        let (bucket, key) = descriptor.trim().split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(bucket, key))
    }

    /// Last path segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Last two key segments (`object_id/filename` for uploaded objects)
    pub fn archive_entry_name(&self) -> String {
        let segments: Vec<&str> = self.key.rsplitn(3, '/').collect();
        match segments.as_slice() {
            [file, parent, ..] => format!("{}/{}", parent, file),
            _ => self.key.clone(),
        }
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone)]
pub struct BlobStat {
    pub size: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {0} not found")]
    NotFound(BlobLocation),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Opens a read stream. The connection is released when the reader is dropped.
    async fn get(&self, location: &BlobLocation) -> Result<BlobReader, StorageError>;

    async fn put(
        &self,
        location: &BlobLocation,
        reader: BlobReader,
        length: u64,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn stat(&self, location: &BlobLocation) -> Result<BlobStat, StorageError>;

    /// Sets one tag, keeping any tags already on the object
    async fn tag(&self, location: &BlobLocation, key: &str, value: &str)
    -> Result<(), StorageError>;

    async fn health_check(&self) -> bool;
}

fn backend<E: fmt::Debug>(context: &str, location: &BlobLocation, err: E) -> StorageError {
    tracing::error!("S3 {} failed for {}: {:?}", context, location, err);
    StorageError::Backend(format!("{} failed for {}", context, location))
}

pub struct S3BlobStore {
    client: Client,
}

impl S3BlobStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn put_multipart(
        &self,
        location: &BlobLocation,
        mut reader: BlobReader,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let multipart_upload_res = self
            .client
            .create_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| backend("create_multipart_upload", location, e))?;

        let upload_id = multipart_upload_res
            .upload_id()
            .ok_or_else(|| StorageError::Backend("No upload ID".to_string()))?
            .to_string();

        let result = self
            .upload_parts(location, &upload_id, &mut reader)
            .await;

        match result {
            Ok(completed_parts) => {
                let completed_multipart_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_multipart_upload)
                    .send()
                    .await
                    .map_err(|e| backend("complete_multipart_upload", location, e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        "Failed to abort multipart upload for {}: {:?}",
                        location,
                        abort_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        location: &BlobLocation,
        upload_id: &str,
        reader: &mut BlobReader,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut chunk_index = 1;
        let mut completed_parts = Vec::new();
        let mut buffer = vec![0u8; PART_SIZE];

        loop {
            let mut n = 0;
            while n < PART_SIZE {
                let read = reader
                    .read(&mut buffer[n..])
                    .await
                    .map_err(|e| StorageError::Backend(format!("read failed: {}", e)))?;
                if read == 0 {
                    break;
                }
                n += read;
            }

            if n == 0 {
                break;
            }

            let upload_part_res = self
                .client
                .upload_part()
                .bucket(&location.bucket)
                .key(&location.key)
                .upload_id(upload_id)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .part_number(chunk_index)
                .send()
                .await
                .map_err(|e| backend("upload_part", location, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag().unwrap_or_default())
                    .part_number(chunk_index)
                    .build(),
            );

            chunk_index += 1;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, location: &BlobLocation) -> Result<BlobReader, StorageError> {
        let res = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await;

        match res {
            Ok(output) => Ok(Box::pin(output.body.into_async_read())),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Err(StorageError::NotFound(location.clone()))
                } else {
                    Err(backend("get_object", location, service_error))
                }
            }
        }
    }

    async fn put(
        &self,
        location: &BlobLocation,
        mut reader: BlobReader,
        length: u64,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if length > MULTIPART_THRESHOLD {
            return self.put_multipart(location, reader, content_type).await;
        }

        let mut data = Vec::with_capacity(length as usize);
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| StorageError::Backend(format!("read failed: {}", e)))?;

        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_type(content_type)
            .content_length(data.len() as i64)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| backend("put_object", location, e))?;
        Ok(())
    }

    async fn stat(&self, location: &BlobLocation) -> Result<BlobStat, StorageError> {
        let res = self
            .client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await;

        match res {
            Ok(output) => Ok(BlobStat {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                content_type: output.content_type().map(str::to_string),
            }),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Err(StorageError::NotFound(location.clone()))
                } else {
                    Err(backend("head_object", location, service_error))
                }
            }
        }
    }

    async fn tag(
        &self,
        location: &BlobLocation,
        key: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        let existing = self
            .client
            .get_object_tagging()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| backend("get_object_tagging", location, e))?;

        let mut tag_set: Vec<Tag> = existing
            .tag_set()
            .iter()
            .filter(|t| t.key() != key)
            .cloned()
            .collect();
        tag_set.push(
            Tag::builder()
                .key(key)
                .value(value)
                .build()
                .map_err(|e| backend("build tag", location, e))?,
        );

        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| backend("build tagging", location, e))?;

        self.client
            .put_object_tagging()
            .bucket(&location.bucket)
            .key(&location.key)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| backend("put_object_tagging", location, e))?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.client.list_buckets().send().await.is_ok()
    }
}

struct MemoryBlob {
    data: Bytes,
    content_type: String,
    tags: HashMap<String, String>,
}

/// In-process blob store used by tests and `STORAGE_BACKEND=memory`.
///
/// Counts readers that are still alive so callers can assert that streams
/// release their source on every exit path.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<Mutex<HashMap<BlobLocation, MemoryBlob>>>,
    open_readers: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
    lose_writes: Arc<AtomicBool>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, location: &BlobLocation, data: impl Into<Bytes>, content_type: &str) {
        self.lock().insert(
            location.clone(),
            MemoryBlob {
                data: data.into(),
                content_type: content_type.to_string(),
                tags: HashMap::new(),
            },
        );
    }

    pub fn remove(&self, location: &BlobLocation) {
        self.lock().remove(location);
    }

    pub fn contains(&self, location: &BlobLocation) -> bool {
        self.lock().contains_key(location)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn tags(&self, location: &BlobLocation) -> HashMap<String, String> {
        self.lock()
            .get(location)
            .map(|b| b.tags.clone())
            .unwrap_or_default()
    }

    /// Readers handed out by `get` and not yet dropped
    pub fn open_readers(&self) -> usize {
        self.open_readers.load(Ordering::SeqCst)
    }

    /// Makes every `put` fail with a backend error
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Makes every `put` report success without storing anything
    pub fn lose_writes(&self, enabled: bool) {
        self.lose_writes.store(enabled, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BlobLocation, MemoryBlob>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct TrackedReader {
    inner: Cursor<Bytes>,
    open_readers: Arc<AtomicUsize>,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.open_readers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, location: &BlobLocation) -> Result<BlobReader, StorageError> {
        let data = self
            .lock()
            .get(location)
            .map(|b| b.data.clone())
            .ok_or_else(|| StorageError::NotFound(location.clone()))?;

        self.open_readers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(TrackedReader {
            inner: Cursor::new(data),
            open_readers: self.open_readers.clone(),
        }))
    }

    async fn put(
        &self,
        location: &BlobLocation,
        mut reader: BlobReader,
        length: u64,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!(
                "write to {} refused",
                location
            )));
        }

        let mut data = Vec::with_capacity(length as usize);
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| StorageError::Backend(format!("read failed: {}", e)))?;

        if !self.lose_writes.load(Ordering::SeqCst) {
            self.insert(location, data, content_type);
        }
        Ok(())
    }

    async fn stat(&self, location: &BlobLocation) -> Result<BlobStat, StorageError> {
        self.lock()
            .get(location)
            .map(|b| BlobStat {
                size: b.data.len() as u64,
                content_type: Some(b.content_type.clone()),
            })
            .ok_or_else(|| StorageError::NotFound(location.clone()))
    }

    async fn tag(
        &self,
        location: &BlobLocation,
        key: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        let mut objects = self.lock();
        let blob = objects
            .get_mut(location)
            .ok_or_else(|| StorageError::NotFound(location.clone()))?;
        blob.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let loc = BlobLocation::parse("models/entry/obj/roads.csv").unwrap();
        assert_eq!(loc.bucket, "models");
        assert_eq!(loc.key, "entry/obj/roads.csv");
        assert_eq!(loc.to_string(), "models/entry/obj/roads.csv");
        assert_eq!(loc.file_name(), "roads.csv");
        assert_eq!(loc.archive_entry_name(), "obj/roads.csv");

        assert!(BlobLocation::parse("models").is_none());
        assert!(BlobLocation::parse("/key").is_none());
        assert!(BlobLocation::parse("models/").is_none());
    }

    #[test]
    fn test_archive_entry_name_short_key() {
        assert_eq!(
            BlobLocation::new("b", "flat.csv").archive_entry_name(),
            "flat.csv"
        );
    }

    #[tokio::test]
    async fn test_memory_store_reader_tracking() {
        let store = MemoryBlobStore::new();
        let loc = BlobLocation::new("b", "k");
        store.insert(&loc, Bytes::from_static(b"hello"), "text/plain");

        let mut reader = store.get(&loc).await.unwrap();
        assert_eq!(store.open_readers(), 1);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        drop(reader);
        assert_eq!(store.open_readers(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_tag_and_missing() {
        let store = MemoryBlobStore::new();
        let loc = BlobLocation::new("b", "k");
        assert!(matches!(
            store.stat(&loc).await,
            Err(StorageError::NotFound(_))
        ));
        store.insert(&loc, Bytes::from_static(b"x"), "text/plain");
        store.tag(&loc, "delete_scheduled", "true").await.unwrap();
        assert_eq!(
            store.tags(&loc).get("delete_scheduled").map(String::as_str),
            Some("true")
        );
    }
}
