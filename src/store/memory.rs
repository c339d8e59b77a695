//! In-memory metadata and data stores.
//!
//! Each instance owns its maps; nothing is process-global. Used by tests and
//! by `--metadata-backend mem` / `--data-backend mem`.

use super::{
    ByteStream, DataError, DataResult, DataStore, ListParams, MetadataError, MetadataResult,
    MetadataStore, NULL_VERSION_ID, PutContext, encipher, slice_range,
};
use crate::{
    kms::cipher::CipherBundle,
    models::{
        bucket::BucketRecord,
        object::{DataLocation, MetadataEntry},
    },
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

/// Versions of one key, oldest first. The last element is the latest.
type Versions = Vec<MetadataEntry>;

struct BucketState {
    record: BucketRecord,
    objects: BTreeMap<String, Versions>,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    buckets: RwLock<HashMap<String, BucketState>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn no_such_key(bucket: &str, key: &str) -> MetadataError {
    MetadataError::NoSuchKey {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

/// Position of the version addressed by `version_id` within `versions`.
fn find_version(versions: &Versions, version_id: Option<&str>) -> Option<usize> {
    match version_id {
        None => versions.len().checked_sub(1),
        Some(NULL_VERSION_ID) => versions.iter().rposition(|v| v.version_id().is_none()),
        Some(id) => versions.iter().rposition(|v| v.version_id() == Some(id)),
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_bucket(&self, name: &str) -> MetadataResult<BucketRecord> {
        self.buckets
            .read()
            .await
            .get(name)
            .map(|state| state.record.clone())
            .ok_or_else(|| MetadataError::NoSuchBucket(name.to_string()))
    }

    async fn create_bucket(&self, name: &str, record: &BucketRecord) -> MetadataResult<()> {
        let mut buckets = self.buckets.write().await;
        if buckets.contains_key(name) {
            return Err(MetadataError::BucketAlreadyExists(name.to_string()));
        }
        buckets.insert(
            name.to_string(),
            BucketState {
                record: record.clone(),
                objects: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn update_bucket(&self, name: &str, record: &BucketRecord) -> MetadataResult<()> {
        let mut buckets = self.buckets.write().await;
        let state = buckets
            .get_mut(name)
            .ok_or_else(|| MetadataError::NoSuchBucket(name.to_string()))?;
        state.record = record.clone();
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> MetadataResult<()> {
        self.buckets
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MetadataError::NoSuchBucket(name.to_string()))
    }

    async fn get_object_md(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<MetadataEntry> {
        let buckets = self.buckets.read().await;
        let state = buckets
            .get(bucket)
            .ok_or_else(|| MetadataError::NoSuchBucket(bucket.to_string()))?;
        let versions = state
            .objects
            .get(key)
            .ok_or_else(|| no_such_key(bucket, key))?;
        find_version(versions, version_id)
            .map(|idx| versions[idx].clone())
            .ok_or_else(|| no_such_key(bucket, key))
    }

    async fn put_object_md(
        &self,
        bucket: &str,
        key: &str,
        entry: &MetadataEntry,
    ) -> MetadataResult<()> {
        let mut buckets = self.buckets.write().await;
        let state = buckets
            .get_mut(bucket)
            .ok_or_else(|| MetadataError::NoSuchBucket(bucket.to_string()))?;
        let versions = state.objects.entry(key.to_string()).or_default();
        let own_version = entry.version_id().unwrap_or(NULL_VERSION_ID);
        if let Some(idx) = find_version(versions, Some(own_version)) {
            versions.remove(idx);
        }
        versions.push(entry.clone());
        trace!(bucket, key, version = own_version, "metadata entry stored");
        Ok(())
    }

    async fn delete_object_md(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<()> {
        let mut buckets = self.buckets.write().await;
        let state = buckets
            .get_mut(bucket)
            .ok_or_else(|| MetadataError::NoSuchBucket(bucket.to_string()))?;
        let Some(versions) = state.objects.get_mut(key) else {
            return Ok(());
        };
        if let Some(idx) = find_version(versions, version_id) {
            versions.remove(idx);
        }
        if versions.is_empty() {
            state.objects.remove(key);
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        params: &ListParams,
    ) -> MetadataResult<Vec<(String, MetadataEntry)>> {
        let buckets = self.buckets.read().await;
        let state = buckets
            .get(bucket)
            .ok_or_else(|| MetadataError::NoSuchBucket(bucket.to_string()))?;
        let limit = params.max_keys.unwrap_or(usize::MAX);
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| params.matches(key))
            .filter_map(|(key, versions)| versions.last().map(|v| (key.clone(), v.clone())))
            .take(limit)
            .collect())
    }

    async fn ping(&self) -> MetadataResult<()> {
        Ok(())
    }
}

pub const MEMORY_DATA_STORE_NAME: &str = "mem";

#[derive(Default)]
pub struct MemoryDataStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.blobs.read().await.contains_key(key)
    }

    /// Raw stored bytes (ciphertext when the blob was written encrypted).
    pub async fn raw(&self, key: &str) -> Option<Bytes> {
        self.blobs.read().await.get(key).cloned()
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    fn name(&self) -> &str {
        MEMORY_DATA_STORE_NAME
    }

    async fn get(&self, location: &DataLocation) -> DataResult<ByteStream> {
        let data = self
            .blobs
            .read()
            .await
            .get(&location.key)
            .cloned()
            .ok_or_else(|| DataError::NotFound(location.key.clone()))?;
        let sliced = slice_range(&data, location.range);
        Ok(stream::once(async move { Ok(sliced) }).boxed())
    }

    async fn put(
        &self,
        cipher: Option<CipherBundle>,
        stream: ByteStream,
        _size: u64,
        context: &PutContext,
    ) -> DataResult<DataLocation> {
        let mut stream = encipher(cipher, stream);
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let key = Uuid::new_v4().simple().to_string();
        let written = buf.len() as u64;
        self.blobs.write().await.insert(key.clone(), buf.freeze());
        trace!(bucket = %context.bucket, key = %context.object_key, data_key = %key, written, "blob stored");
        Ok(DataLocation::new(key, MEMORY_DATA_STORE_NAME, written))
    }

    async fn batch_delete(&self, locations: &[DataLocation]) -> DataResult<()> {
        let mut blobs = self.blobs.write().await;
        for location in locations {
            blobs.remove(&location.key);
        }
        Ok(())
    }

    async fn ping(&self) -> DataResult<()> {
        Ok(())
    }
}
