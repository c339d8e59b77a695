//! Multi-object delete.
//!
//! Entries are processed with bounded concurrency; each one reads its
//! metadata, asks the versioning preprocessor what to do, then removes the
//! version or writes a delete marker. Entry failures are reported per entry.
//! Data of removed versions is collected and deleted in one batch once every
//! metadata write has been acknowledged.

use super::{
    bucket_service::bucket_shield,
    relay::EMPTY_FILE_MD5,
    versioning::{VersioningPreprocessor, next_version_id},
};
use crate::{
    errors::{S3Error, S3Result},
    models::{
        bucket::BucketRecord,
        multipart::Initiator,
        object::{DataLocation, MetadataEntry, ObjectMetadataRecord},
    },
    store::{DataStore, MetadataStore, NULL_VERSION_ID},
};
use axum::http::StatusCode;
use chrono::Utc;
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Most entries a single request may name.
pub const MAX_DELETE_ENTRIES: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteEntry {
    pub key: String,
    pub version_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteRequest {
    /// Only report errors.
    pub quiet: bool,
    pub entries: Vec<DeleteEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletedEntry {
    pub key: String,
    pub version_id: Option<String>,
    /// A delete marker was created, or the removed version was one.
    pub delete_marker: bool,
    pub delete_marker_version_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub version_id: Option<String>,
    pub code: &'static str,
    /// HTTP status the error would carry on its own.
    pub status: StatusCode,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub struct MultiDeleteOutcome {
    pub quiet: bool,
    pub deleted: Vec<DeletedEntry>,
    pub errors: Vec<DeleteFailure>,
    /// Data-holding versions physically removed.
    pub objects_removed: u64,
    pub total_content_length: u64,
}

/// Result of one entry, plus the data it leaves to reclaim.
struct EntryOutcome {
    result: Result<DeletedEntry, DeleteFailure>,
    reclaim: Vec<DataLocation>,
    removed_bytes: Option<u64>,
}

impl EntryOutcome {
    fn deleted(entry: DeletedEntry) -> Self {
        Self {
            result: Ok(entry),
            reclaim: Vec::new(),
            removed_bytes: None,
        }
    }

    fn failed(entry: &DeleteEntry, err: S3Error) -> Self {
        error!(key = %entry.key, version = ?entry.version_id, error = %err, "error deleting object");
        Self {
            result: Err(failure(entry, &err)),
            reclaim: Vec::new(),
            removed_bytes: None,
        }
    }
}

fn failure(entry: &DeleteEntry, err: &S3Error) -> DeleteFailure {
    DeleteFailure {
        key: entry.key.clone(),
        version_id: entry.version_id.clone(),
        code: err.code(),
        status: err.status(),
        message: err.to_string(),
    }
}

fn plain_delete(entry: &DeleteEntry) -> DeletedEntry {
    DeletedEntry {
        key: entry.key.clone(),
        version_id: entry.version_id.clone(),
        delete_marker: false,
        delete_marker_version_id: None,
    }
}

#[derive(Clone)]
pub struct MultiDeleteService {
    metadata: Arc<dyn MetadataStore>,
    data: Arc<dyn DataStore>,
    versioning: Arc<dyn VersioningPreprocessor>,
    concurrency: usize,
}

impl MultiDeleteService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        data: Arc<dyn DataStore>,
        versioning: Arc<dyn VersioningPreprocessor>,
        concurrency: usize,
    ) -> Self {
        Self {
            metadata,
            data,
            versioning,
            concurrency: concurrency.max(1),
        }
    }

    /// Delete every entry of `request` from `bucket_name`.
    ///
    /// Fails as a whole only when the entry count is out of bounds or the
    /// bucket cannot be read. Outcomes keep the request's entry order.
    pub async fn delete_objects(
        &self,
        requester: &Initiator,
        bucket_name: &str,
        request: DeleteRequest,
    ) -> S3Result<MultiDeleteOutcome> {
        if request.entries.is_empty() || request.entries.len() > MAX_DELETE_ENTRIES {
            return Err(S3Error::MalformedXml);
        }
        let bucket = self.metadata.get_bucket(bucket_name).await?;
        let mut outcome = MultiDeleteOutcome {
            quiet: request.quiet,
            ..Default::default()
        };

        if bucket_shield(&bucket) || bucket.owner != requester.id {
            debug!(bucket = bucket_name, requester = %requester.id, "access denied to every entry");
            outcome.errors = request
                .entries
                .iter()
                .map(|entry| failure(entry, &S3Error::AccessDenied))
                .collect();
            return Ok(outcome);
        }

        let bucket = &bucket;
        let results: Vec<EntryOutcome> = stream::iter(request.entries)
            .map(|entry| async move { self.delete_one(bucket, requester, &entry).await })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut reclaim = Vec::new();
        for result in results {
            reclaim.extend(result.reclaim);
            if let Some(bytes) = result.removed_bytes {
                outcome.objects_removed += 1;
                outcome.total_content_length += bytes;
            }
            match result.result {
                Ok(deleted) => outcome.deleted.push(deleted),
                Err(failed) => outcome.errors.push(failed),
            }
        }

        if reclaim.is_empty() {
            trace!(bucket = bucket_name, "no objects to delete from data backend");
        } else if let Err(err) = self.data.batch_delete(&reclaim).await {
            error!(
                bucket = bucket_name,
                locations = reclaim.len(),
                error = %err,
                "error deleting objects from data backend"
            );
        }
        debug!(
            bucket = bucket_name,
            deleted = outcome.deleted.len(),
            errors = outcome.errors.len(),
            bytes = outcome.total_content_length,
            "multi-object delete done"
        );
        Ok(outcome)
    }

    async fn delete_one(
        &self,
        bucket: &BucketRecord,
        requester: &Initiator,
        entry: &DeleteEntry,
    ) -> EntryOutcome {
        let version = entry.version_id.as_deref();
        let object = match self.metadata.get_object_md(&bucket.name, &entry.key, version).await {
            Ok(found) => found.into_object(),
            Err(err) if err.is_not_found() => None,
            Err(err) => return EntryOutcome::failed(entry, err.into()),
        };
        if object.is_none() && (bucket.versioning.is_none() || version.is_some()) {
            trace!(key = %entry.key, "already gone");
            return EntryOutcome::deleted(plain_delete(entry));
        }

        let decision = self.versioning.decide(bucket, object.as_ref(), version);
        if !decision.delete_data {
            return self.write_delete_marker(bucket, requester, entry).await;
        }
        let Some(object) = object else {
            return EntryOutcome::deleted(plain_delete(entry));
        };

        if let Err(err) = self
            .metadata
            .delete_object_md(&bucket.name, &entry.key, decision.target_version.as_deref())
            .await
        {
            return EntryOutcome::failed(entry, err.into());
        }
        trace!(key = %entry.key, version = ?decision.target_version, "version removed");

        let deleted = DeletedEntry {
            key: entry.key.clone(),
            version_id: entry.version_id.clone(),
            delete_marker: object.is_delete_marker,
            delete_marker_version_id: object
                .is_delete_marker
                .then(|| entry.version_id.clone())
                .flatten(),
        };
        EntryOutcome {
            result: Ok(deleted),
            removed_bytes: (!object.is_delete_marker).then_some(object.content_length),
            reclaim: object.location,
        }
    }

    /// Tombstone `entry.key`. Under suspended versioning the marker takes the
    /// null version's place and that version's data is reclaimed.
    async fn write_delete_marker(
        &self,
        bucket: &BucketRecord,
        requester: &Initiator,
        entry: &DeleteEntry,
    ) -> EntryOutcome {
        let version_id = next_version_id(bucket);
        let mut reclaim = Vec::new();
        let mut removed_bytes = None;
        if version_id.is_none() {
            match self
                .metadata
                .get_object_md(&bucket.name, &entry.key, Some(NULL_VERSION_ID))
                .await
            {
                Ok(found) => {
                    if let Some(previous) = found.into_object() {
                        removed_bytes =
                            (!previous.is_delete_marker).then_some(previous.content_length);
                        reclaim = previous.location;
                    }
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return EntryOutcome::failed(entry, err.into()),
            }
        }

        let marker = ObjectMetadataRecord {
            key: entry.key.clone(),
            version_id: version_id.clone(),
            owner: requester.id.clone(),
            owner_display_name: requester.display_name.clone(),
            acl: Default::default(),
            content_length: 0,
            content_md5: EMPTY_FILE_MD5.to_string(),
            content_type: None,
            last_modified: Utc::now(),
            location: Vec::new(),
            is_delete_marker: true,
            sse: None,
        };
        if let Err(err) = self
            .metadata
            .put_object_md(&bucket.name, &entry.key, &MetadataEntry::Object(marker))
            .await
        {
            return EntryOutcome::failed(entry, err.into());
        }
        trace!(key = %entry.key, version = ?version_id, "delete marker created");

        EntryOutcome {
            result: Ok(DeletedEntry {
                key: entry.key.clone(),
                version_id: entry.version_id.clone(),
                delete_marker: true,
                delete_marker_version_id: Some(
                    version_id.unwrap_or_else(|| NULL_VERSION_ID.to_string()),
                ),
            }),
            reclaim,
            removed_bytes,
        }
    }
}
