//! Narrow contracts of the metadata and data stores.
//!
//! The core never talks to a storage engine directly: every service receives
//! an `Arc<dyn MetadataStore>` and an `Arc<dyn DataStore>`, so tests swap in
//! the in-memory implementations (or failure-injecting wrappers) per case.

pub mod disk;
pub mod memory;
pub mod sqlite;

use crate::{
    kms::cipher::CipherBundle,
    models::{bucket::BucketRecord, object::DataLocation, object::MetadataEntry},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;
use thiserror::Error;

/// Version selector naming the null (unversioned) version explicitly.
pub const NULL_VERSION_ID: &str = "null";

/// A stream of blob bytes.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("bucket `{0}` not found")]
    NoSuchBucket(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("key `{key}` not found in bucket `{bucket}`")]
    NoSuchKey { bucket: String, key: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt metadata record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("metadata backend error: {0}")]
    Backend(String),
}

impl MetadataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NoSuchKey { .. })
    }
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("data location `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("data backend error: {0}")]
    Backend(String),
}

pub type DataResult<T> = Result<T, DataError>;

/// Range scan over the latest version of each key in a bucket.
#[derive(Clone, Debug, Default)]
pub struct ListParams {
    /// Only keys starting with this prefix.
    pub prefix: Option<String>,
    /// Only keys strictly greater than this marker.
    pub marker: Option<String>,
    /// Stop after this many keys; `None` means no limit.
    pub max_keys: Option<usize>,
}

impl ListParams {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        let after_marker = self.marker.as_deref().is_none_or(|marker| key > marker);
        let has_prefix = self
            .prefix
            .as_deref()
            .is_none_or(|prefix| key.starts_with(prefix));
        after_marker && has_prefix
    }
}

/// Per-bucket ordered key/value store for bucket and object metadata.
///
/// Object versions: `version_id = None` addresses the latest version,
/// `Some("null")` the null version. `put_object_md` stores the entry under
/// its own version (null when it has none) and makes it the latest.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_bucket(&self, name: &str) -> MetadataResult<BucketRecord>;

    /// Fails with `BucketAlreadyExists` when the name is taken.
    async fn create_bucket(&self, name: &str, record: &BucketRecord) -> MetadataResult<()>;

    async fn update_bucket(&self, name: &str, record: &BucketRecord) -> MetadataResult<()>;

    /// Removes the bucket and every entry in it.
    async fn delete_bucket(&self, name: &str) -> MetadataResult<()>;

    async fn get_object_md(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<MetadataEntry>;

    async fn put_object_md(&self, bucket: &str, key: &str, entry: &MetadataEntry)
    -> MetadataResult<()>;

    /// Removing an absent version is not an error.
    async fn delete_object_md(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<()>;

    /// Latest entry of each matching key, in key order.
    async fn list_objects(
        &self,
        bucket: &str,
        params: &ListParams,
    ) -> MetadataResult<Vec<(String, MetadataEntry)>>;

    /// Liveness check used by readiness.
    async fn ping(&self) -> MetadataResult<()>;
}

/// Context describing where a blob is going; used for logging and placement.
#[derive(Clone, Debug, Default)]
pub struct PutContext {
    pub bucket: String,
    pub object_key: String,
    pub owner: String,
    pub upload_id: Option<String>,
    pub part_number: Option<u32>,
}

/// Content-addressable blob store returning opaque locators.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Name recorded on every location this store returns.
    fn name(&self) -> &str;

    /// Stream the bytes of `location`, honouring `location.range` when set.
    async fn get(&self, location: &DataLocation) -> DataResult<ByteStream>;

    /// Store `stream`, enciphering it with `cipher` when present.
    ///
    /// `size` is the expected plaintext length. The returned location carries
    /// the key, store name and number of bytes written.
    async fn put(
        &self,
        cipher: Option<CipherBundle>,
        stream: ByteStream,
        size: u64,
        context: &PutContext,
    ) -> DataResult<DataLocation>;

    /// Best-effort delete of every location; missing blobs are skipped.
    async fn batch_delete(&self, locations: &[DataLocation]) -> DataResult<()>;

    async fn ping(&self) -> DataResult<()>;
}

/// Wrap `stream` with the bundle's cipher, or pass it through untouched.
pub(crate) fn encipher(cipher: Option<CipherBundle>, stream: ByteStream) -> ByteStream {
    match cipher {
        Some(bundle) => bundle.encrypt_stream(stream),
        None => stream,
    }
}

/// Clip a buffered blob to the inclusive `range`, clamped to its length.
pub(crate) fn slice_range(data: &Bytes, range: Option<(u64, u64)>) -> Bytes {
    match range {
        None => data.clone(),
        Some((start, end)) => {
            let len = data.len() as u64;
            let start = start.min(len) as usize;
            let end = end.saturating_add(1).min(len) as usize;
            data.slice(start..end.max(start))
        }
    }
}
