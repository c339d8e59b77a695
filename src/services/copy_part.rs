//! Upload part copy: one part of a multipart upload filled from an existing
//! object, optionally from a byte range of it.
//!
//! Source locations are transferred strictly in order. A single running MD5
//! is handed from one transfer to the next so the part ETag covers the
//! copied bytes in their logical order.

use super::{
    bucket_service::{bucket_shield, can_read},
    relay::{EMPTY_FILE_MD5, RelayMd5, relay_blob},
};
use crate::{
    errors::{S3Error, S3Result},
    keys::{PartNumber, encode_overview_key, encode_part_key, shadow_bucket_name},
    kms::EnvelopeEncryption,
    models::{
        bucket::{BucketRecord, SseDescriptor},
        multipart::{Initiator, PartRecord},
        object::{DataLocation, LocationEncryption, MetadataEntry, ObjectMetadataRecord},
    },
    store::{DataStore, MetadataError, MetadataStore, NULL_VERSION_ID, PutContext},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// `x-amz-copy-source-if-*` conditions, as received.
#[derive(Clone, Debug, Default)]
pub struct CopyConditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
    pub if_unmodified_since: Option<String>,
}

impl CopyConditions {
    /// Check the conditions against the source ETag and modification time.
    ///
    /// Times compare at second granularity. A failed `if-unmodified-since`
    /// is ignored when `if-match` is present, and an unparsable date fails
    /// the request.
    pub fn check(&self, etag: &str, last_modified: DateTime<Utc>) -> S3Result<()> {
        let modified = last_modified.timestamp();

        let unmodified_failed = match self.if_unmodified_since.as_deref() {
            Some(raw) => modified > parse_http_date(raw)?,
            None => false,
        };
        match self.if_match.as_deref() {
            None if unmodified_failed => return Err(S3Error::PreconditionFailed),
            Some(candidates) if !etag_matches(candidates, etag) => {
                return Err(S3Error::PreconditionFailed);
            }
            _ => {}
        }
        if let Some(candidates) = self.if_none_match.as_deref() {
            if etag_matches(candidates, etag) {
                return Err(S3Error::PreconditionFailed);
            }
        }
        if let Some(raw) = self.if_modified_since.as_deref() {
            if modified <= parse_http_date(raw)? {
                return Err(S3Error::PreconditionFailed);
            }
        }
        Ok(())
    }
}

fn etag_matches(candidates: &str, etag: &str) -> bool {
    candidates
        .split(',')
        .map(|item| item.trim().trim_matches('"'))
        .any(|item| item == "*" || item == etag)
}

/// Seconds since the epoch of an HTTP (RFC 2822) or RFC 3339 date.
fn parse_http_date(raw: &str) -> S3Result<i64> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|date| date.timestamp())
        .map_err(|_| S3Error::PreconditionFailed)
}

/// Parse an `x-amz-copy-source-range` value of the form `bytes=first-last`.
pub fn parse_copy_source_range(raw: &str) -> S3Result<(u64, u64)> {
    let invalid = || S3Error::InvalidArgument(format!("invalid copy source range `{raw}`"));
    let (first, last) = raw
        .trim()
        .strip_prefix("bytes=")
        .and_then(|bounds| bounds.split_once('-'))
        .ok_or_else(invalid)?;
    let first = first.parse::<u64>().map_err(|_| invalid())?;
    let last = last.parse::<u64>().map_err(|_| invalid())?;
    if first > last {
        return Err(invalid());
    }
    Ok((first, last))
}

#[derive(Clone, Debug)]
pub struct CopyPartRequest {
    pub requester: Initiator,
    pub source_bucket: String,
    pub source_key: String,
    pub source_version_id: Option<String>,
    /// Inclusive byte range of the source to copy.
    pub range: Option<(u64, u64)>,
    pub conditions: CopyConditions,
    pub dest_bucket: String,
    pub dest_key: String,
    pub upload_id: String,
    pub part_number: PartNumber,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CopyPartOutput {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    /// Reported when a version was requested or the source bucket is versioned.
    pub source_version_id: Option<String>,
    pub sse: Option<SseDescriptor>,
}

#[derive(Clone)]
pub struct CopyPartService {
    metadata: Arc<dyn MetadataStore>,
    data: Arc<dyn DataStore>,
    encryption: EnvelopeEncryption,
    max_part_size: u64,
}

impl CopyPartService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        data: Arc<dyn DataStore>,
        encryption: EnvelopeEncryption,
        max_part_size: u64,
    ) -> Self {
        Self {
            metadata,
            data,
            encryption,
            max_part_size,
        }
    }

    pub async fn copy_part(&self, request: CopyPartRequest) -> S3Result<CopyPartOutput> {
        let dest = self.live_bucket(&request.dest_bucket).await?;
        let source_bucket = self.live_bucket(&request.source_bucket).await?;
        if !can_read(&source_bucket, &request.requester.id) {
            return Err(S3Error::AccessDenied);
        }

        let source = self.load_source(&request).await?;
        request
            .conditions
            .check(&source.content_md5, source.last_modified)?;
        let source_version_id = (source_bucket.versioning.is_some()
            || request.source_version_id.is_some())
        .then(|| {
            source
                .version_id
                .clone()
                .unwrap_or_else(|| NULL_VERSION_ID.to_string())
        });

        let locator = copy_locator(&source, request.range)?;
        let size: u64 = locator.iter().map(|l| l.size.unwrap_or(0)).sum();
        if size > self.max_part_size {
            debug!(size, max = self.max_part_size, "copied part too large");
            return Err(S3Error::EntityTooLarge);
        }

        let shadow = shadow_bucket_name(&request.dest_bucket);
        self.check_upload(&shadow, &request).await?;

        let context = PutContext {
            bucket: request.dest_bucket.clone(),
            object_key: request.dest_key.clone(),
            owner: request.requester.id.clone(),
            upload_id: Some(request.upload_id.clone()),
            part_number: Some(request.part_number.get()),
        };
        let (etag, locations) = if locator.is_empty() {
            trace!("zero-byte source, nothing to transfer");
            (EMPTY_FILE_MD5.to_string(), Vec::new())
        } else {
            self.transfer(&locator, dest.server_side_encryption.as_ref(), &context)
                .await?
        };
        let written: u64 = locations.iter().map(|l| l.size.unwrap_or(0)).sum();

        let part_key = encode_part_key(&request.upload_id, request.part_number);
        let old_locations = match self.metadata.get_object_md(&shadow, &part_key, None).await {
            Ok(entry) => entry.into_part().map(|part| part.locations).unwrap_or_default(),
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => {
                self.discard(&locations, &context).await;
                return Err(err.into());
            }
        };

        let last_modified = Utc::now();
        let part = PartRecord {
            upload_id: request.upload_id.clone(),
            part_number: request.part_number.get(),
            etag: etag.clone(),
            size: written,
            locations,
            last_modified,
        };
        if let Err(err) = self
            .metadata
            .put_object_md(&shadow, &part_key, &MetadataEntry::Part(part.clone()))
            .await
        {
            self.discard(&part.locations, &context).await;
            return Err(err.into());
        }
        debug!(
            bucket = %request.dest_bucket,
            upload_id = %request.upload_id,
            part_number = request.part_number.get(),
            size = written,
            "part copied"
        );

        if !old_locations.is_empty() {
            if let Err(err) = self.data.batch_delete(&old_locations).await {
                error!(
                    upload_id = %request.upload_id,
                    part_number = request.part_number.get(),
                    error = %err,
                    "failed to delete replaced part data"
                );
            }
        }

        Ok(CopyPartOutput {
            etag,
            last_modified,
            size: written,
            source_version_id,
            sse: dest.server_side_encryption,
        })
    }

    async fn live_bucket(&self, name: &str) -> S3Result<BucketRecord> {
        let bucket = self.metadata.get_bucket(name).await?;
        if bucket_shield(&bucket) {
            trace!(bucket = name, "deleted or transient flag set");
            return Err(S3Error::NoSuchBucket(name.to_string()));
        }
        Ok(bucket)
    }

    async fn load_source(&self, request: &CopyPartRequest) -> S3Result<ObjectMetadataRecord> {
        let version = request.source_version_id.as_deref();
        let found = match self
            .metadata
            .get_object_md(&request.source_bucket, &request.source_key, version)
            .await
        {
            Ok(entry) => entry.into_object(),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };
        let no_source = || match version {
            Some(version) => S3Error::NoSuchVersion(version.to_string()),
            None => S3Error::NoSuchKey {
                bucket: request.source_bucket.clone(),
                key: request.source_key.clone(),
            },
        };
        let source = found.ok_or_else(no_source)?;
        if source.is_delete_marker {
            debug!(key = %request.source_key, "delete marker on source object");
            return Err(match version {
                Some(_) => S3Error::InvalidRequest(
                    "the source of a copy request may not specifically refer to a delete marker by version id"
                        .into(),
                ),
                None => no_source(),
            });
        }
        Ok(source)
    }

    /// The upload must exist and belong to the requester.
    async fn check_upload(&self, shadow: &str, request: &CopyPartRequest) -> S3Result<()> {
        let overview_key = encode_overview_key(&request.dest_key, &request.upload_id);
        let overview = match self.metadata.get_object_md(shadow, &overview_key, None).await {
            Ok(entry) => entry.into_overview(),
            Err(MetadataError::NoSuchBucket(_)) => None,
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                error!(shadow, error = %err, "error getting the upload overview");
                return Err(err.into());
            }
        }
        .ok_or_else(|| S3Error::NoSuchUpload(request.upload_id.clone()))?;

        if overview.initiator.id != request.requester.id {
            return Err(S3Error::AccessDenied);
        }
        Ok(())
    }

    /// Copy every location in order, threading one hash through them all.
    async fn transfer(
        &self,
        locator: &[DataLocation],
        dest_sse: Option<&SseDescriptor>,
        context: &PutContext,
    ) -> S3Result<(String, Vec<DataLocation>)> {
        let mut hash = RelayMd5::new();
        let mut written = Vec::with_capacity(locator.len());
        let mut offset = 0;
        for location in locator {
            match self.transfer_one(location, hash, dest_sse, context).await {
                Ok((mut stored, next, sse)) => {
                    stored.start = Some(offset);
                    stored.sse = sse;
                    offset += stored.size.unwrap_or(0);
                    written.push(stored);
                    hash = next;
                }
                Err(err) => {
                    error!(key = %location.key, error = %err, "error transferring data from source");
                    self.discard(&written, context).await;
                    return Err(err);
                }
            }
        }
        Ok((hash.finish(), written))
    }

    async fn transfer_one(
        &self,
        location: &DataLocation,
        hash: RelayMd5,
        dest_sse: Option<&SseDescriptor>,
        context: &PutContext,
    ) -> S3Result<(DataLocation, RelayMd5, Option<LocationEncryption>)> {
        let source = self.data.get(location).await?;
        let source = match &location.sse {
            Some(sse) => {
                let offset = location.range.map_or(0, |(start, _)| start);
                self.encryption
                    .create_decipher_bundle(sse, offset)
                    .await?
                    .decrypt_stream(source)
            }
            None => source,
        };
        let cipher = match dest_sse {
            Some(sse) => Some(self.encryption.create_cipher_bundle(sse).await?),
            None => None,
        };
        let sse = cipher.as_ref().map(|bundle| bundle.location_encryption());
        let size = location.size.unwrap_or(0);
        let (stored, hash) = relay_blob(&*self.data, source, hash, cipher, size, context).await?;
        Ok((stored, hash, sse))
    }

    async fn discard(&self, locations: &[DataLocation], context: &PutContext) {
        if locations.is_empty() {
            return;
        }
        if let Err(err) = self.data.batch_delete(locations).await {
            error!(
                bucket = %context.bucket,
                upload_id = ?context.upload_id,
                error = %err,
                "failed to delete copied data"
            );
        }
    }
}

/// Source locations to copy, limited to `range` when one is given.
///
/// Object-level encryption is pushed down to locations that lack their own
/// descriptor. A ranged copy needs a start and size on every location.
fn copy_locator(
    source: &ObjectMetadataRecord,
    range: Option<(u64, u64)>,
) -> S3Result<Vec<DataLocation>> {
    let mut locator = source.location.clone();
    if let [sole] = locator.as_mut_slice() {
        sole.size.get_or_insert(source.content_length);
    }
    if let Some(object_sse) = &source.sse {
        for location in locator.iter_mut().filter(|l| l.sse.is_none()) {
            location.sse = Some(LocationEncryption {
                algorithm: object_sse.algorithm.clone(),
                master_key_id: object_sse.master_key_id.clone(),
                crypto_scheme: None,
                ciphered_data_key: None,
            });
        }
    }

    let Some((first, last)) = range else {
        return Ok(locator);
    };
    if first > last || last >= source.content_length {
        return Err(S3Error::InvalidRange);
    }
    if !locator.iter().all(DataLocation::is_range_addressable) {
        return Err(S3Error::NotImplemented(
            "ranged copy of an object without location offsets".into(),
        ));
    }

    let mut sliced = Vec::new();
    for mut location in locator {
        let (Some(start), Some(size)) = (location.start, location.size) else {
            continue;
        };
        if size == 0 {
            continue;
        }
        let end = start + size - 1;
        if end < first || start > last {
            continue;
        }
        let from = first.max(start) - start;
        let to = last.min(end) - start;
        if from != 0 || to != size - 1 {
            location.range = Some((from, to));
        }
        location.size = Some(to - from + 1);
        sliced.push(location);
    }
    Ok(sliced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kms::SSE_AES256, services::{ServiceOptions, testing::Harness}};
    use chrono::Duration;
    use futures::TryStreamExt;

    fn request(h: &Harness, upload_id: &str, part: u32) -> CopyPartRequest {
        CopyPartRequest {
            requester: h.initiator("alice"),
            source_bucket: "src".into(),
            source_key: "obj".into(),
            source_version_id: None,
            range: None,
            conditions: CopyConditions::default(),
            dest_bucket: "dst".into(),
            dest_key: "big.bin".into(),
            upload_id: upload_id.into(),
            part_number: PartNumber::new(part).unwrap(),
        }
    }

    /// Source object whose bytes are split across `blobs`, in order.
    async fn multi_location_source(h: &Harness, key: &str, blobs: &[&[u8]]) {
        let mut location = Vec::new();
        let mut start = 0;
        let mut hash = md5::Context::new();
        for blob in blobs {
            let mut stored = h.put_blob(blob).await;
            stored.start = Some(start);
            start += blob.len() as u64;
            hash.consume(blob);
            location.push(stored);
        }
        let record = ObjectMetadataRecord {
            key: key.into(),
            version_id: None,
            owner: "alice".into(),
            owner_display_name: "alice".into(),
            acl: Default::default(),
            content_length: start,
            content_md5: format!("{:x}", hash.compute()),
            content_type: None,
            last_modified: Utc::now(),
            location,
            is_delete_marker: false,
            sse: None,
        };
        h.metadata
            .put_object_md("src", key, &MetadataEntry::Object(record))
            .await
            .unwrap();
    }

    async fn setup(h: &Harness) -> String {
        h.create_bucket("src", "alice").await;
        h.create_bucket("dst", "alice").await;
        h.initiate("dst", "big.bin", "alice").await.upload_id
    }

    async fn part_bytes(h: &Harness, upload_id: &str, part: u32) -> (PartRecord, Vec<u8>) {
        let key = encode_part_key(upload_id, PartNumber::new(part).unwrap());
        let part = h
            .metadata
            .get_object_md(&shadow_bucket_name("dst"), &key, None)
            .await
            .unwrap()
            .into_part()
            .unwrap();
        let mut bytes = Vec::new();
        for location in &part.locations {
            let body = h.service.data.get(location).await.unwrap();
            let body = match &location.sse {
                Some(sse) => h
                    .service
                    .copy_part
                    .encryption
                    .create_decipher_bundle(sse, 0)
                    .await
                    .unwrap()
                    .decrypt_stream(body),
                None => body,
            };
            let chunks: Vec<bytes::Bytes> = body.try_collect().await.unwrap();
            bytes.extend(chunks.concat());
        }
        (part, bytes)
    }

    #[tokio::test]
    async fn etag_follows_location_order() {
        let h = Harness::new();
        let upload = setup(&h).await;
        multi_location_source(&h, "ab", &[b"first-", b"second"]).await;
        multi_location_source(&h, "ba", &[b"second", b"first-"]).await;

        let mut req = request(&h, &upload, 1);
        req.source_key = "ab".into();
        let ab = h.service.copy_part.copy_part(req).await.unwrap();
        let mut req = request(&h, &upload, 2);
        req.source_key = "ba".into();
        let ba = h.service.copy_part.copy_part(req).await.unwrap();

        assert_ne!(ab.etag, ba.etag);
        assert_eq!(ab.etag, format!("{:x}", md5::compute(b"first-second")));
        let (part, bytes) = part_bytes(&h, &upload, 1).await;
        assert_eq!(bytes, b"first-second");
        assert_eq!(part.size, 12);
        let starts: Vec<_> = part.locations.iter().map(|l| l.start).collect();
        assert_eq!(starts, vec![Some(0), Some(6)]);
    }

    #[tokio::test]
    async fn zero_byte_source_writes_nothing() {
        let h = Harness::new();
        let upload = setup(&h).await;
        h.put_object("src", "obj", b"").await;
        let blobs_before = h.mem_data.len().await;

        let out = h.service.copy_part.copy_part(request(&h, &upload, 1)).await.unwrap();
        assert_eq!(out.etag, EMPTY_FILE_MD5);
        assert_eq!(out.size, 0);
        assert_eq!(h.mem_data.len().await, blobs_before);
    }

    #[tokio::test]
    async fn ranged_copy_spans_locations() {
        let h = Harness::new();
        let upload = setup(&h).await;
        multi_location_source(&h, "obj", &[b"0123", b"4567", b"89ab"]).await;

        let mut req = request(&h, &upload, 3);
        req.range = Some((2, 9));
        let out = h.service.copy_part.copy_part(req).await.unwrap();
        assert_eq!(out.size, 8);
        assert_eq!(out.etag, format!("{:x}", md5::compute(b"23456789")));
        let (_, bytes) = part_bytes(&h, &upload, 3).await;
        assert_eq!(bytes, b"23456789");
    }

    #[tokio::test]
    async fn range_errors() {
        let h = Harness::new();
        let upload = setup(&h).await;
        h.put_object("src", "obj", b"0123456789").await;

        let mut req = request(&h, &upload, 1);
        req.range = Some((5, 10));
        let err = h.service.copy_part.copy_part(req).await.unwrap_err();
        assert!(matches!(err, S3Error::InvalidRange));

        let mut legacy = h.object("src", "obj", None).await;
        legacy.location[0].start = None;
        legacy.location[0].size = None;
        h.metadata
            .put_object_md("src", "obj", &MetadataEntry::Object(legacy))
            .await
            .unwrap();
        let mut req = request(&h, &upload, 1);
        req.range = Some((0, 3));
        let err = h.service.copy_part.copy_part(req).await.unwrap_err();
        assert!(matches!(err, S3Error::NotImplemented(_)));

        // Without a range the legacy location copies whole.
        let out = h.service.copy_part.copy_part(request(&h, &upload, 1)).await.unwrap();
        assert_eq!(out.size, 10);
    }

    #[tokio::test]
    async fn encrypted_source_to_encrypted_destination() {
        let h = Harness::new();
        h.create_encrypted_bucket("src", "alice", SSE_AES256).await;
        h.create_encrypted_bucket("dst", "alice", SSE_AES256).await;
        let upload = h.initiate("dst", "big.bin", "alice").await.upload_id;
        h.put_object("src", "obj", b"secret payload").await;

        let mut req = request(&h, &upload, 1);
        req.range = Some((7, 13));
        let out = h.service.copy_part.copy_part(req).await.unwrap();
        assert_eq!(out.etag, format!("{:x}", md5::compute(b"payload")));
        assert!(out.sse.is_some());

        let (part, bytes) = part_bytes(&h, &upload, 1).await;
        assert_eq!(bytes, b"payload");
        let raw = h.mem_data.raw(&part.locations[0].key).await.unwrap();
        assert_ne!(raw.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn recopying_a_part_reclaims_old_data() {
        let h = Harness::new();
        let upload = setup(&h).await;
        h.put_object("src", "obj", b"version one").await;
        h.service.copy_part.copy_part(request(&h, &upload, 1)).await.unwrap();
        let (first, _) = part_bytes(&h, &upload, 1).await;

        h.service.copy_part.copy_part(request(&h, &upload, 1)).await.unwrap();
        let (second, bytes) = part_bytes(&h, &upload, 1).await;
        assert_eq!(bytes, b"version one");
        assert_ne!(first.locations[0].key, second.locations[0].key);
        assert!(!h.mem_data.contains(&first.locations[0].key).await);
    }

    #[tokio::test]
    async fn conditional_headers() {
        let h = Harness::new();
        let upload = setup(&h).await;
        let put = h.put_object("src", "obj", b"abc").await;
        let now = Utc::now();
        let http = |t: DateTime<Utc>| t.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let cases = [
            (CopyConditions { if_match: Some(format!("\"{}\"", put.etag)), ..Default::default() }, true),
            (CopyConditions { if_match: Some("nope".into()), ..Default::default() }, false),
            (CopyConditions { if_none_match: Some("*".into()), ..Default::default() }, false),
            (CopyConditions { if_none_match: Some("other, another".into()), ..Default::default() }, true),
            (CopyConditions { if_modified_since: Some(http(now + Duration::hours(1))), ..Default::default() }, false),
            (CopyConditions { if_modified_since: Some(http(now - Duration::hours(1))), ..Default::default() }, true),
            (CopyConditions { if_unmodified_since: Some(http(now - Duration::hours(1))), ..Default::default() }, false),
            (
                CopyConditions {
                    if_match: Some(put.etag.clone()),
                    if_unmodified_since: Some(http(now - Duration::hours(1))),
                    ..Default::default()
                },
                true,
            ),
            (CopyConditions { if_modified_since: Some("yesterday".into()), ..Default::default() }, false),
        ];
        for (conditions, allowed) in cases {
            let mut req = request(&h, &upload, 1);
            req.conditions = conditions.clone();
            let result = h.service.copy_part.copy_part(req).await;
            if allowed {
                assert!(result.is_ok(), "{conditions:?}");
            } else {
                assert!(matches!(result, Err(S3Error::PreconditionFailed)), "{conditions:?}");
            }
        }
    }

    #[tokio::test]
    async fn upload_and_source_checks() {
        let h = Harness::new();
        let upload = setup(&h).await;
        h.put_object("src", "obj", b"abc").await;

        let mut req = request(&h, &upload, 1);
        req.source_key = "missing".into();
        assert!(matches!(
            h.service.copy_part.copy_part(req).await,
            Err(S3Error::NoSuchKey { .. })
        ));

        let mut req = request(&h, &upload, 1);
        req.source_version_id = Some("v-missing".into());
        assert!(matches!(
            h.service.copy_part.copy_part(req).await,
            Err(S3Error::NoSuchVersion(_))
        ));

        let mut req = request(&h, &upload, 1);
        req.upload_id = "not-an-upload".into();
        assert!(matches!(
            h.service.copy_part.copy_part(req).await,
            Err(S3Error::NoSuchUpload(_))
        ));

        let mut req = request(&h, &upload, 1);
        req.requester = h.initiator("mallory");
        assert!(matches!(h.service.copy_part.copy_part(req).await, Err(S3Error::AccessDenied)));

        let mut req = request(&h, &upload, 1);
        req.dest_bucket = "nowhere".into();
        assert!(matches!(
            h.service.copy_part.copy_part(req).await,
            Err(S3Error::NoSuchBucket(_))
        ));
    }

    #[tokio::test]
    async fn delete_marker_sources_are_rejected() {
        let h = Harness::new();
        let upload = setup(&h).await;
        let marker = ObjectMetadataRecord {
            key: "obj".into(),
            version_id: Some("m1".into()),
            owner: "alice".into(),
            owner_display_name: "alice".into(),
            acl: Default::default(),
            content_length: 0,
            content_md5: EMPTY_FILE_MD5.into(),
            content_type: None,
            last_modified: Utc::now(),
            location: Vec::new(),
            is_delete_marker: true,
            sse: None,
        };
        h.metadata
            .put_object_md("src", "obj", &MetadataEntry::Object(marker))
            .await
            .unwrap();

        let err = h.service.copy_part.copy_part(request(&h, &upload, 1)).await.unwrap_err();
        assert!(matches!(err, S3Error::NoSuchKey { .. }));

        let mut req = request(&h, &upload, 1);
        req.source_version_id = Some("m1".into());
        let err = h.service.copy_part.copy_part(req).await.unwrap_err();
        assert!(matches!(err, S3Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn oversized_parts_are_rejected() {
        let h = Harness::with_options(ServiceOptions {
            max_part_size: 4,
            ..ServiceOptions::default()
        });
        let upload = setup(&h).await;
        h.put_object("src", "obj", b"too long").await;

        let err = h.service.copy_part.copy_part(request(&h, &upload, 1)).await.unwrap_err();
        assert!(matches!(err, S3Error::EntityTooLarge));

        let mut req = request(&h, &upload, 1);
        req.range = Some((0, 3));
        assert_eq!(h.service.copy_part.copy_part(req).await.unwrap().size, 4);
    }

    #[test]
    fn copy_source_range_parsing() {
        assert_eq!(parse_copy_source_range("bytes=0-9").unwrap(), (0, 9));
        for bad in ["0-9", "bytes=9-0", "bytes=-5", "bytes=a-b", "bytes=5"] {
            assert!(parse_copy_source_range(bad).is_err(), "{bad}");
        }
    }
}
