//! Object writes and reads, and the multipart upload bookkeeping that lives
//! in each bucket's shadow bucket.

use super::{
    bucket_service::{bucket_shield, can_read},
    relay::{RelayMd5, relay_blob},
    versioning::next_version_id,
};
use crate::{
    errors::{S3Error, S3Result},
    keys::{encode_overview_key, part_key_prefix, shadow_bucket_name},
    kms::EnvelopeEncryption,
    models::{
        bucket::BucketRecord,
        multipart::{Initiator, MpuOverviewRecord},
        object::{DataLocation, MetadataEntry, ObjectEncryption, ObjectMetadataRecord},
    },
    store::{
        ByteStream, DataStore, ListParams, MetadataError, MetadataStore, NULL_VERSION_ID,
        PutContext,
    },
};
use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub requester: Initiator,
    pub content_type: Option<String>,
    /// Announced body length, when known.
    pub content_length: Option<u64>,
    /// Base64 `Content-MD5` header, checked against the received bytes.
    pub content_md5: Option<String>,
    pub body: ByteStream,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutObjectOutput {
    pub etag: String,
    pub version_id: Option<String>,
}

#[derive(Clone)]
pub struct ObjectService {
    metadata: Arc<dyn MetadataStore>,
    data: Arc<dyn DataStore>,
    encryption: EnvelopeEncryption,
}

impl ObjectService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        data: Arc<dyn DataStore>,
        encryption: EnvelopeEncryption,
    ) -> Self {
        Self {
            metadata,
            data,
            encryption,
        }
    }

    /// Bucket for an object operation; shielded buckets do not exist here.
    async fn load_bucket(&self, name: &str) -> S3Result<BucketRecord> {
        let bucket = self.metadata.get_bucket(name).await?;
        if bucket_shield(&bucket) {
            debug!(bucket = name, "bucket is shielded");
            return Err(S3Error::NoSuchBucket(name.to_string()));
        }
        Ok(bucket)
    }

    /// Store a new object version. The data of an overwritten null version
    /// is deleted once the new metadata is written.
    pub async fn put_object(&self, request: PutObjectRequest) -> S3Result<PutObjectOutput> {
        let bucket = self.load_bucket(&request.bucket).await?;
        if bucket.owner != request.requester.id {
            return Err(S3Error::AccessDenied);
        }

        let context = PutContext {
            bucket: request.bucket.clone(),
            object_key: request.key.clone(),
            owner: bucket.owner.clone(),
            upload_id: None,
            part_number: None,
        };

        let (locations, hash) = if request.content_length == Some(0) {
            (Vec::new(), RelayMd5::new())
        } else {
            let cipher = match &bucket.server_side_encryption {
                Some(sse) => Some(self.encryption.create_cipher_bundle(sse).await?),
                None => None,
            };
            let location_sse = cipher.as_ref().map(|bundle| bundle.location_encryption());
            let size = request.content_length.unwrap_or(0);
            let (mut location, hash) =
                relay_blob(&*self.data, request.body, RelayMd5::new(), cipher, size, &context)
                    .await?;
            location.start = Some(0);
            location.size = Some(hash.bytes());
            location.sse = location_sse;
            (vec![location], hash)
        };
        let content_length = hash.bytes();

        let digest = hash.finish_raw();
        if let Some(expected) = request.content_md5.as_deref() {
            let matches = general_purpose::STANDARD
                .decode(expected)
                .is_ok_and(|decoded| decoded == digest);
            if !matches {
                self.reclaim(&locations, &request.bucket, &request.key).await;
                return Err(S3Error::BadDigest);
            }
        }
        if let Some(announced) = request.content_length.filter(|len| *len != content_length) {
            debug!(announced, received = content_length, "body length mismatch");
            self.reclaim(&locations, &request.bucket, &request.key).await;
            return Err(S3Error::InvalidRequest(
                "body length does not match Content-Length".into(),
            ));
        }
        let etag = format!("{:x}", md5::Digest(digest));

        let version_id = next_version_id(&bucket);
        let overwritten = if version_id.is_none() {
            match self
                .metadata
                .get_object_md(&request.bucket, &request.key, Some(NULL_VERSION_ID))
                .await
            {
                Ok(entry) => entry.into_object(),
                Err(err) if err.is_not_found() => None,
                Err(err) => {
                    self.reclaim(&locations, &request.bucket, &request.key).await;
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let record = ObjectMetadataRecord {
            key: request.key.clone(),
            version_id: version_id.clone(),
            owner: request.requester.id.clone(),
            owner_display_name: request.requester.display_name.clone(),
            acl: Default::default(),
            content_length,
            content_md5: etag.clone(),
            content_type: request.content_type,
            last_modified: Utc::now(),
            location: locations,
            is_delete_marker: false,
            sse: bucket.server_side_encryption.as_ref().map(|sse| ObjectEncryption {
                algorithm: sse.algorithm.clone(),
                master_key_id: sse.master_key_id.clone(),
            }),
        };
        if let Err(err) = self
            .metadata
            .put_object_md(&request.bucket, &request.key, &MetadataEntry::Object(record.clone()))
            .await
        {
            self.reclaim(&record.location, &request.bucket, &request.key).await;
            return Err(err.into());
        }
        debug!(bucket = %request.bucket, key = %request.key, version = ?version_id, "object stored");

        if let Some(previous) = overwritten {
            self.reclaim(&previous.location, &request.bucket, &request.key).await;
        }
        Ok(PutObjectOutput { etag, version_id })
    }

    /// Metadata and plaintext body of an object version. The requester
    /// needs read access to the bucket.
    pub async fn get_object(
        &self,
        requester: &str,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> S3Result<(ObjectMetadataRecord, ByteStream)> {
        let bucket_record = self.load_bucket(bucket).await?;
        if !can_read(&bucket_record, requester) {
            debug!(bucket, requester, "read denied");
            return Err(S3Error::AccessDenied);
        }
        let record = match self.metadata.get_object_md(bucket, key, version_id).await {
            Ok(entry) => entry.into_object(),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };
        let record = match (record, version_id) {
            (Some(record), _) if !record.is_delete_marker => record,
            (_, Some(version)) => return Err(S3Error::NoSuchVersion(version.to_string())),
            (_, None) => {
                return Err(S3Error::NoSuchKey {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
        };

        let mut parts = Vec::with_capacity(record.location.len());
        for location in &record.location {
            let body = self.data.get(location).await?;
            let body = match &location.sse {
                Some(sse) => self
                    .encryption
                    .create_decipher_bundle(sse, 0)
                    .await?
                    .decrypt_stream(body),
                None => body,
            };
            parts.push(body);
        }
        Ok((record, stream::iter(parts).flatten().boxed()))
    }

    /// Start a multipart upload of `key`, creating the shadow bucket on
    /// first use.
    pub async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        initiator: Initiator,
    ) -> S3Result<MpuOverviewRecord> {
        let destination = self.load_bucket(bucket).await?;
        if destination.owner != initiator.id {
            return Err(S3Error::AccessDenied);
        }

        let shadow = shadow_bucket_name(bucket);
        let shadow_record = BucketRecord::new(
            &shadow,
            &destination.owner,
            &destination.owner_display_name,
            Utc::now(),
        );
        match self.metadata.create_bucket(&shadow, &shadow_record).await {
            Ok(()) => debug!(bucket, shadow, "shadow bucket created"),
            Err(MetadataError::BucketAlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let overview = MpuOverviewRecord {
            upload_id: Uuid::new_v4().simple().to_string(),
            bucket: bucket.to_string(),
            object_key: key.to_string(),
            initiator,
            owner: destination.owner.clone(),
            initiated: Utc::now(),
            sse: destination.server_side_encryption.clone(),
        };
        self.metadata
            .put_object_md(
                &shadow,
                &encode_overview_key(key, &overview.upload_id),
                &MetadataEntry::Overview(overview.clone()),
            )
            .await?;
        debug!(bucket, key, upload_id = %overview.upload_id, "multipart upload initiated");
        Ok(overview)
    }

    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        requester: &str,
    ) -> S3Result<()> {
        let destination = self.load_bucket(bucket).await?;
        let shadow = shadow_bucket_name(bucket);
        let overview = match self
            .metadata
            .get_object_md(&shadow, &encode_overview_key(key, upload_id), None)
            .await
        {
            Ok(entry) => entry.into_overview(),
            Err(err @ (MetadataError::NoSuchBucket(_) | MetadataError::NoSuchKey { .. })) => {
                debug!(bucket, key, upload_id, error = %err, "upload not found");
                None
            }
            Err(err) => return Err(err.into()),
        }
        .ok_or_else(|| S3Error::NoSuchUpload(upload_id.to_string()))?;

        if overview.initiator.id != requester && destination.owner != requester {
            return Err(S3Error::AccessDenied);
        }
        purge_upload(&*self.metadata, &*self.data, &shadow, key, upload_id).await
    }

    async fn reclaim(&self, locations: &[DataLocation], bucket: &str, key: &str) {
        if locations.is_empty() {
            return;
        }
        if let Err(err) = self.data.batch_delete(locations).await {
            error!(bucket, key, error = %err, "failed to delete orphaned data");
        }
    }
}

/// Remove every part of an upload, then their data, then its overview.
pub(crate) async fn purge_upload(
    metadata: &dyn MetadataStore,
    data: &dyn DataStore,
    shadow: &str,
    object_key: &str,
    upload_id: &str,
) -> S3Result<()> {
    let parts = metadata
        .list_objects(shadow, &ListParams::prefix(part_key_prefix(upload_id)))
        .await?;

    let mut locations = Vec::new();
    for (part_key, entry) in parts {
        metadata.delete_object_md(shadow, &part_key, None).await?;
        if let Some(part) = entry.into_part() {
            locations.extend(part.locations);
        }
    }
    if !locations.is_empty() {
        if let Err(err) = data.batch_delete(&locations).await {
            error!(shadow, upload_id, error = %err, "failed to delete part data");
        }
    }
    metadata
        .delete_object_md(shadow, &encode_overview_key(object_key, upload_id), None)
        .await?;
    debug!(shadow, key = object_key, upload_id, "multipart upload purged");
    Ok(())
}
