//! Test fixtures: an in-memory service stack and failure-injecting stores.

use super::{
    ServiceOptions, StorageService,
    bucket_service::CreateBucketRequest,
    object_service::{PutObjectOutput, PutObjectRequest},
};
use crate::{
    kms::{EnvelopeEncryption, KmsBackend, memory::MemoryKms},
    models::{
        bucket::{Acl, BucketRecord, SseConfig, VersioningConfiguration, VersioningStatus},
        multipart::{Initiator, MpuOverviewRecord},
        object::{DataLocation, MetadataEntry, ObjectMetadataRecord},
    },
    store::{
        ByteStream, DataError, DataResult, DataStore, ListParams, MetadataError, MetadataResult,
        MetadataStore, PutContext,
        memory::{MemoryDataStore, MemoryMetadataStore},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

pub(crate) struct Harness {
    pub service: StorageService,
    pub metadata: Arc<dyn MetadataStore>,
    pub mem_data: Arc<MemoryDataStore>,
    pub kms: Arc<MemoryKms>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_metadata(Arc::new(MemoryMetadataStore::new()))
    }

    pub fn with_metadata(metadata: Arc<dyn MetadataStore>) -> Self {
        let mem_data = Arc::new(MemoryDataStore::new());
        Self::build(metadata, mem_data.clone(), mem_data, ServiceOptions::default())
    }

    pub fn with_data(data: Arc<FailingDataStore>) -> Self {
        let mem_data = data.inner.clone();
        Self::build(
            data.metadata.clone(),
            data,
            mem_data,
            ServiceOptions::default(),
        )
    }

    pub fn with_options(options: ServiceOptions) -> Self {
        let mem_data = Arc::new(MemoryDataStore::new());
        Self::build(
            Arc::new(MemoryMetadataStore::new()),
            mem_data.clone(),
            mem_data,
            options,
        )
    }

    fn build(
        metadata: Arc<dyn MetadataStore>,
        data: Arc<dyn DataStore>,
        mem_data: Arc<MemoryDataStore>,
        options: ServiceOptions,
    ) -> Self {
        let kms = Arc::new(MemoryKms::new());
        let backend: Arc<dyn KmsBackend> = kms.clone();
        let service = StorageService::new(
            metadata.clone(),
            data,
            EnvelopeEncryption::new(backend),
            options,
        );
        Self {
            service,
            metadata,
            mem_data,
            kms,
        }
    }

    pub fn initiator(&self, id: &str) -> Initiator {
        Initiator {
            id: id.to_string(),
            display_name: id.to_string(),
        }
    }

    pub fn body(bytes: &[u8]) -> ByteStream {
        let chunks: Vec<std::io::Result<Bytes>> = bytes
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        stream::iter(chunks).boxed()
    }

    pub async fn create_bucket(&self, name: &str, owner: &str) -> BucketRecord {
        self.create_bucket_with(name, owner, SseConfig::default()).await
    }

    pub async fn create_encrypted_bucket(
        &self,
        name: &str,
        owner: &str,
        algorithm: &str,
    ) -> BucketRecord {
        let sse = SseConfig {
            algorithm: Some(algorithm.to_string()),
            ..SseConfig::default()
        };
        self.create_bucket_with(name, owner, sse).await
    }

    async fn create_bucket_with(&self, name: &str, owner: &str, sse: SseConfig) -> BucketRecord {
        self.service
            .buckets
            .create_bucket(CreateBucketRequest {
                canonical_id: owner.to_string(),
                display_name: owner.to_string(),
                name: name.to_string(),
                acl: Acl::default(),
                sse,
            })
            .await
            .unwrap()
    }

    pub async fn set_versioning(&self, bucket: &str, status: VersioningStatus) {
        let mut record = self.metadata.get_bucket(bucket).await.unwrap();
        record.versioning = Some(VersioningConfiguration {
            status,
            mfa_delete: false,
        });
        self.metadata.update_bucket(bucket, &record).await.unwrap();
    }

    /// Store `bytes` as `key`, written by the bucket owner.
    pub async fn put_object(&self, bucket: &str, key: &str, bytes: &[u8]) -> PutObjectOutput {
        let owner = self.metadata.get_bucket(bucket).await.unwrap().owner;
        self.service
            .objects
            .put_object(PutObjectRequest {
                bucket: bucket.to_string(),
                key: key.to_string(),
                requester: self.initiator(&owner),
                content_type: None,
                content_length: Some(bytes.len() as u64),
                content_md5: None,
                body: Self::body(bytes),
            })
            .await
            .unwrap()
    }

    pub async fn object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> ObjectMetadataRecord {
        self.metadata
            .get_object_md(bucket, key, version_id)
            .await
            .unwrap()
            .into_object()
            .unwrap()
    }

    /// Write a raw blob straight into the data store.
    pub async fn put_blob(&self, bytes: &[u8]) -> DataLocation {
        self.mem_data
            .put(None, Self::body(bytes), bytes.len() as u64, &PutContext::default())
            .await
            .unwrap()
    }

    pub async fn initiate(&self, bucket: &str, key: &str, initiator: &str) -> MpuOverviewRecord {
        self.service
            .objects
            .initiate_multipart_upload(bucket, key, self.initiator(initiator))
            .await
            .unwrap()
    }
}

/// Metadata store that fails selected writes and reads on demand.
#[derive(Default)]
pub(crate) struct FailingMetadataStore {
    inner: MemoryMetadataStore,
    failing_puts: Mutex<HashSet<String>>,
    failing_gets: Mutex<HashSet<(String, String)>>,
}

impl FailingMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `put_object_md` into `bucket` fails from now on.
    pub fn fail_puts_into(&self, bucket: &str) {
        self.failing_puts.lock().unwrap().insert(bucket.to_string());
    }

    /// Every `get_object_md` of `key` in `bucket` fails from now on.
    pub fn fail_gets_of(&self, bucket: &str, key: &str) {
        self.failing_gets
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failing_puts.lock().unwrap().clear();
        self.failing_gets.lock().unwrap().clear();
    }

    fn injected(what: &str) -> MetadataError {
        MetadataError::Backend(format!("injected {what} failure"))
    }
}

#[async_trait]
impl MetadataStore for FailingMetadataStore {
    async fn get_bucket(&self, name: &str) -> MetadataResult<BucketRecord> {
        self.inner.get_bucket(name).await
    }

    async fn create_bucket(&self, name: &str, record: &BucketRecord) -> MetadataResult<()> {
        self.inner.create_bucket(name, record).await
    }

    async fn update_bucket(&self, name: &str, record: &BucketRecord) -> MetadataResult<()> {
        self.inner.update_bucket(name, record).await
    }

    async fn delete_bucket(&self, name: &str) -> MetadataResult<()> {
        self.inner.delete_bucket(name).await
    }

    async fn get_object_md(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<MetadataEntry> {
        let fail = self
            .failing_gets
            .lock()
            .unwrap()
            .contains(&(bucket.to_string(), key.to_string()));
        if fail {
            return Err(Self::injected("get"));
        }
        self.inner.get_object_md(bucket, key, version_id).await
    }

    async fn put_object_md(
        &self,
        bucket: &str,
        key: &str,
        entry: &MetadataEntry,
    ) -> MetadataResult<()> {
        if self.failing_puts.lock().unwrap().contains(bucket) {
            return Err(Self::injected("put"));
        }
        self.inner.put_object_md(bucket, key, entry).await
    }

    async fn delete_object_md(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<()> {
        self.inner.delete_object_md(bucket, key, version_id).await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        params: &ListParams,
    ) -> MetadataResult<Vec<(String, MetadataEntry)>> {
        self.inner.list_objects(bucket, params).await
    }

    async fn ping(&self) -> MetadataResult<()> {
        self.inner.ping().await
    }
}

/// Data store recording deletions, optionally failing them.
///
/// On every `batch_delete` it counts how many of the doomed locations are
/// still referenced by an object record in the watched bucket.
pub(crate) struct FailingDataStore {
    pub inner: Arc<MemoryDataStore>,
    pub metadata: Arc<dyn MetadataStore>,
    watched_bucket: String,
    fail_deletes: AtomicBool,
    pub delete_calls: AtomicUsize,
    pub referenced_at_delete: AtomicUsize,
}

impl FailingDataStore {
    pub fn watching(metadata: Arc<dyn MetadataStore>, bucket: &str) -> Self {
        Self {
            inner: Arc::new(MemoryDataStore::new()),
            metadata,
            watched_bucket: bucket.to_string(),
            fail_deletes: AtomicBool::new(false),
            delete_calls: AtomicUsize::new(0),
            referenced_at_delete: AtomicUsize::new(0),
        }
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    async fn referenced_keys(&self) -> HashSet<String> {
        let listed = self
            .metadata
            .list_objects(&self.watched_bucket, &ListParams::default())
            .await
            .unwrap_or_default();
        listed
            .into_iter()
            .filter_map(|(_, entry)| entry.into_object())
            .flat_map(|record| record.location.into_iter().map(|location| location.key))
            .collect()
    }
}

#[async_trait]
impl DataStore for FailingDataStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, location: &DataLocation) -> DataResult<ByteStream> {
        self.inner.get(location).await
    }

    async fn put(
        &self,
        cipher: Option<crate::kms::cipher::CipherBundle>,
        stream: ByteStream,
        size: u64,
        context: &PutContext,
    ) -> DataResult<DataLocation> {
        self.inner.put(cipher, stream, size, context).await
    }

    async fn batch_delete(&self, locations: &[DataLocation]) -> DataResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let referenced = self.referenced_keys().await;
        let still_referenced = locations
            .iter()
            .filter(|location| referenced.contains(&location.key))
            .count();
        self.referenced_at_delete
            .fetch_add(still_referenced, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(DataError::Backend("injected delete failure".into()));
        }
        self.inner.batch_delete(locations).await
    }

    async fn ping(&self) -> DataResult<()> {
        self.inner.ping().await
    }
}
