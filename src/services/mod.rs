//! Core services. `StorageService` bundles them with the stores they share
//! and is the state handed to every HTTP handler.

pub mod bucket_service;
pub mod copy_part;
pub mod multi_delete;
pub mod object_service;
pub mod relay;
pub mod versioning;

#[cfg(test)]
pub(crate) mod testing;

use crate::{
    kms::EnvelopeEncryption,
    store::{DataStore, MetadataStore},
};
use bucket_service::BucketService;
use copy_part::CopyPartService;
use multi_delete::MultiDeleteService;
use object_service::ObjectService;
use std::sync::Arc;
use versioning::{StandardVersioning, VersioningPreprocessor};

/// Largest part a copy may produce: 5 GiB.
pub const DEFAULT_MAX_PART_SIZE: u64 = 5_368_709_120;
/// Entries of a multi-object delete processed at once.
pub const DEFAULT_DELETE_CONCURRENCY: usize = 5;

#[derive(Clone, Debug)]
pub struct ServiceOptions {
    pub max_part_size: u64,
    pub delete_concurrency: usize,
    /// Encryption applied to new buckets that do not ask for any.
    pub default_bucket_sse: Option<String>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_part_size: DEFAULT_MAX_PART_SIZE,
            delete_concurrency: DEFAULT_DELETE_CONCURRENCY,
            default_bucket_sse: None,
        }
    }
}

#[derive(Clone)]
pub struct StorageService {
    pub metadata: Arc<dyn MetadataStore>,
    pub data: Arc<dyn DataStore>,
    pub buckets: BucketService,
    pub objects: ObjectService,
    pub multi_delete: MultiDeleteService,
    pub copy_part: CopyPartService,
    pub options: ServiceOptions,
}

impl StorageService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        data: Arc<dyn DataStore>,
        encryption: EnvelopeEncryption,
        options: ServiceOptions,
    ) -> Self {
        Self::with_versioning(
            metadata,
            data,
            encryption,
            options,
            Arc::new(StandardVersioning),
        )
    }

    pub fn with_versioning(
        metadata: Arc<dyn MetadataStore>,
        data: Arc<dyn DataStore>,
        encryption: EnvelopeEncryption,
        options: ServiceOptions,
        versioning: Arc<dyn VersioningPreprocessor>,
    ) -> Self {
        let buckets = BucketService::new(metadata.clone(), data.clone(), encryption.clone());
        let objects = ObjectService::new(metadata.clone(), data.clone(), encryption.clone());
        let multi_delete = MultiDeleteService::new(
            metadata.clone(),
            data.clone(),
            versioning,
            options.delete_concurrency,
        );
        let copy_part = CopyPartService::new(
            metadata.clone(),
            data.clone(),
            encryption,
            options.max_part_size,
        );
        Self {
            metadata,
            data,
            buckets,
            objects,
            multi_delete,
            copy_part,
            options,
        }
    }
}
