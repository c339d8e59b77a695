//! Bucket lifecycle: creation, repair of interrupted creations/deletions,
//! deletion, and the users bucket that indexes buckets by owner.
//!
//! The metadata store has no multi-key transactions. A bucket is written
//! with its `transient` flag set before its ownership entry exists, and is
//! flagged `deleted` before its ownership entry is removed. Whatever step a
//! crash interrupts, the next `create_bucket` from the same owner finds the
//! flag and finishes the job.

use super::object_service::purge_upload;
use crate::{
    errors::{S3Error, S3Result},
    keys::{
        OLD_SPLITTER, OLD_USERS_BUCKET, SPLITTER, USERS_BUCKET, decode_ownership_key,
        decode_overview_key, encode_ownership_key_with, is_internal_bucket, overview_listing_prefix,
        ownership_prefix, shadow_bucket_name,
    },
    kms::{EnvelopeEncryption, SSE_AES256, SSE_AWS_KMS},
    models::{
        bucket::{Acl, BucketRecord, OwnershipEntry, SseConfig, SseDescriptor},
        object::MetadataEntry,
    },
    store::{DataStore, ListParams, MetadataError, MetadataStore},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
/// Owner recorded on the users buckets.
const USERS_BUCKET_OWNER: &str = "admin";

#[derive(Clone, Debug)]
pub struct CreateBucketRequest {
    pub canonical_id: String,
    pub display_name: String,
    pub name: String,
    pub acl: Acl,
    pub sse: SseConfig,
}

/// One bucket of an account, as listed from the users bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedBucket {
    pub name: String,
    pub creation_date: DateTime<Utc>,
}

/// True when a creation or deletion of `bucket` is unfinished. Object
/// operations must treat such a bucket as unavailable.
pub fn bucket_shield(bucket: &BucketRecord) -> bool {
    bucket.is_shielded()
}

/// Object reads are open to the owner, to anyone on a public canned ACL, and
/// to READ or FULL_CONTROL grantees.
pub fn can_read(bucket: &BucketRecord, requester: &str) -> bool {
    bucket.owner == requester
        || matches!(bucket.acl.canned.as_str(), "public-read" | "public-read-write")
        || bucket
            .acl
            .read
            .iter()
            .chain(&bucket.acl.full_control)
            .any(|grantee| grantee == requester)
}

#[derive(Clone)]
pub struct BucketService {
    metadata: Arc<dyn MetadataStore>,
    data: Arc<dyn DataStore>,
    encryption: EnvelopeEncryption,
}

impl BucketService {
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

    /// Create `request.name` for `request.canonical_id`, or finish an
    /// interrupted creation/deletion of a bucket the caller already owns.
    pub async fn create_bucket(&self, request: CreateBucketRequest) -> S3Result<BucketRecord> {
        validate_bucket_name(&request.name)?;
        let name = request.name.as_str();

        let mut candidate = BucketRecord::new(
            name,
            &request.canonical_id,
            &request.display_name,
            Utc::now(),
        );
        candidate.acl = request.acl.clone();

        let resolve_sse = async {
            self.encryption
                .bucket_level_encryption(&candidate, &request.sse)
                .await
                .map_err(S3Error::from)
        };
        let lookup = async {
            match self.metadata.get_bucket(name).await {
                Ok(record) => Ok(Some(record)),
                Err(MetadataError::NoSuchBucket(_)) => Ok(None),
                Err(err) => Err(S3Error::from(err)),
            }
        };
        let (sse, existing) = tokio::join!(resolve_sse, lookup);
        let sse = sse?;
        let existing = match existing {
            Ok(existing) => existing,
            Err(err) => {
                self.discard_minted_key(sse.as_ref(), &request.sse).await;
                return Err(err);
            }
        };

        match existing {
            None => {
                candidate.server_side_encryption = sse.clone();
                let created = self.create_new(candidate).await;
                if matches!(created, Err(S3Error::BucketAlreadyExists(_))) {
                    self.discard_minted_key(sse.as_ref(), &request.sse).await;
                }
                created
            }
            Some(existing) => {
                self.discard_minted_key(sse.as_ref(), &request.sse).await;
                if existing.owner != request.canonical_id {
                    debug!(bucket = name, "bucket already owned by another account");
                    return Err(S3Error::BucketAlreadyExists(name.to_string()));
                }
                if bucket_shield(&existing) {
                    info!(
                        bucket = name,
                        transient = existing.transient,
                        deleted = existing.deleted,
                        "repairing interrupted bucket operation"
                    );
                    return self.finish_creation(existing).await;
                }
                Err(S3Error::BucketAlreadyOwnedByYou(name.to_string()))
            }
        }
    }

    async fn create_new(&self, mut record: BucketRecord) -> S3Result<BucketRecord> {
        record.add_transient_flag();
        match self.metadata.create_bucket(&record.name, &record).await {
            Ok(()) => debug!(bucket = %record.name, "bucket written with transient flag"),
            // Lost a creation race; the winner owns the name.
            Err(MetadataError::BucketAlreadyExists(name)) => {
                return Err(S3Error::BucketAlreadyExists(name));
            }
            Err(err) => return Err(err.into()),
        }
        self.finish_creation(record).await
    }

    /// Write the ownership entry, then clear both flags.
    async fn finish_creation(&self, mut record: BucketRecord) -> S3Result<BucketRecord> {
        self.add_to_users_bucket(&record.owner, &record.name, record.creation_date)
            .await?;
        record.clear_flags();
        self.metadata.update_bucket(&record.name, &record).await?;
        debug!(bucket = %record.name, "bucket flags cleared");
        Ok(record)
    }

    /// Record `bucket` as owned by `canonical_id`.
    ///
    /// Writes go to the current users bucket when it exists, else to the
    /// legacy one with the legacy separator. When neither exists the current
    /// bucket is created; losing that creation race to another request is
    /// fine, the entry goes into the winner's bucket.
    pub async fn add_to_users_bucket(
        &self,
        canonical_id: &str,
        bucket: &str,
        creation_date: DateTime<Utc>,
    ) -> S3Result<()> {
        let entry = MetadataEntry::Ownership(OwnershipEntry { creation_date });

        match self.metadata.get_bucket(USERS_BUCKET).await {
            Ok(_) => {
                return self
                    .put_ownership(USERS_BUCKET, SPLITTER, canonical_id, bucket, &entry)
                    .await;
            }
            Err(MetadataError::NoSuchBucket(_)) => {}
            Err(err) => return Err(err.into()),
        }
        match self.metadata.get_bucket(OLD_USERS_BUCKET).await {
            Ok(_) => {
                return self
                    .put_ownership(OLD_USERS_BUCKET, OLD_SPLITTER, canonical_id, bucket, &entry)
                    .await;
            }
            Err(MetadataError::NoSuchBucket(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let users = BucketRecord::new(USERS_BUCKET, USERS_BUCKET_OWNER, USERS_BUCKET_OWNER, Utc::now());
        match self.metadata.create_bucket(USERS_BUCKET, &users).await {
            Ok(()) => debug!("users bucket created"),
            Err(MetadataError::BucketAlreadyExists(_)) => {
                debug!("users bucket created concurrently");
            }
            Err(err) => return Err(err.into()),
        }
        self.put_ownership(USERS_BUCKET, SPLITTER, canonical_id, bucket, &entry)
            .await
    }

    async fn put_ownership(
        &self,
        users_bucket: &str,
        splitter: &str,
        canonical_id: &str,
        bucket: &str,
        entry: &MetadataEntry,
    ) -> S3Result<()> {
        let key = encode_ownership_key_with(splitter, canonical_id, bucket);
        self.metadata
            .put_object_md(users_bucket, &key, entry)
            .await
            .inspect_err(|err| {
                error!(bucket, users_bucket, error = %err, "error writing ownership entry");
            })?;
        Ok(())
    }

    /// Drop `bucket` from both users buckets. Missing buckets are skipped.
    async fn remove_from_users_bucket(&self, canonical_id: &str, bucket: &str) -> S3Result<()> {
        for (users_bucket, splitter) in [(USERS_BUCKET, SPLITTER), (OLD_USERS_BUCKET, OLD_SPLITTER)] {
            let key = encode_ownership_key_with(splitter, canonical_id, bucket);
            match self.metadata.delete_object_md(users_bucket, &key, None).await {
                Ok(()) | Err(MetadataError::NoSuchBucket(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Every bucket `canonical_id` owns, sorted by name.
    pub async fn list_owned_buckets(&self, canonical_id: &str) -> S3Result<Vec<OwnedBucket>> {
        let mut owned = Vec::new();
        for (users_bucket, splitter) in [(USERS_BUCKET, SPLITTER), (OLD_USERS_BUCKET, OLD_SPLITTER)] {
            let params = ListParams::prefix(ownership_prefix(splitter, canonical_id));
            let entries = match self.metadata.list_objects(users_bucket, &params).await {
                Ok(entries) => entries,
                Err(MetadataError::NoSuchBucket(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            for (key, entry) in entries {
                let (Some((_, name)), MetadataEntry::Ownership(ownership)) =
                    (decode_ownership_key(&key), entry)
                else {
                    warn!(users_bucket, key, "skipping malformed ownership entry");
                    continue;
                };
                owned.push(OwnedBucket {
                    name: name.to_string(),
                    creation_date: ownership.creation_date,
                });
            }
        }
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        owned.dedup_by(|a, b| a.name == b.name);
        Ok(owned)
    }

    /// Delete an empty bucket owned by `canonical_id`, aborting whatever
    /// multipart uploads still target it.
    pub async fn delete_bucket(&self, canonical_id: &str, name: &str) -> S3Result<()> {
        let mut record = self.metadata.get_bucket(name).await?;
        if record.owner != canonical_id {
            return Err(S3Error::AccessDenied);
        }

        let first_page = ListParams {
            max_keys: Some(1),
            ..ListParams::default()
        };
        if !self.metadata.list_objects(name, &first_page).await?.is_empty() {
            return Err(S3Error::BucketNotEmpty(name.to_string()));
        }

        self.delete_shadow_bucket(name).await?;

        record.add_deleted_flag();
        self.metadata.update_bucket(name, &record).await?;
        debug!(bucket = name, "bucket flagged deleted");

        self.remove_from_users_bucket(canonical_id, name).await?;
        self.metadata.delete_bucket(name).await?;
        info!(bucket = name, "bucket deleted");

        if let Some(sse) = record
            .server_side_encryption
            .as_ref()
            .filter(|sse| sse.algorithm == SSE_AES256 && !sse.is_account_encryption_enabled)
        {
            if let Err(err) = self.encryption.destroy_bucket_key(&sse.master_key_id).await {
                error!(bucket = name, error = %err, "failed to destroy bucket key");
            }
        }
        Ok(())
    }

    async fn delete_shadow_bucket(&self, name: &str) -> S3Result<()> {
        let shadow = shadow_bucket_name(name);
        let overviews = match self
            .metadata
            .list_objects(&shadow, &ListParams::prefix(overview_listing_prefix()))
            .await
        {
            Ok(overviews) => overviews,
            Err(MetadataError::NoSuchBucket(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for (key, _) in overviews {
            let Some((object_key, upload_id)) = decode_overview_key(&key) else {
                continue;
            };
            debug!(bucket = name, key = object_key, upload_id, "aborting ongoing upload");
            purge_upload(&*self.metadata, &*self.data, &shadow, object_key, upload_id).await?;
        }
        match self.metadata.delete_bucket(&shadow).await {
            Ok(()) | Err(MetadataError::NoSuchBucket(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Destroy a key minted for a descriptor that ended up unused.
    async fn discard_minted_key(&self, sse: Option<&SseDescriptor>, requested: &SseConfig) {
        let Some(sse) = sse else { return };
        let minted = !sse.is_account_encryption_enabled
            && (sse.algorithm == SSE_AES256
                || (sse.algorithm == SSE_AWS_KMS && requested.master_key_id.is_none()));
        if !minted {
            return;
        }
        if let Err(err) = self.encryption.destroy_bucket_key(&sse.master_key_id).await {
            warn!(master_key_id = %sse.master_key_id, error = %err, "failed to discard unused bucket key");
        }
    }
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3 to 63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
/// - cannot collide with the internal users or shadow buckets
pub fn validate_bucket_name(name: &str) -> S3Result<()> {
    let invalid = |reason: &str| S3Error::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    if is_internal_bucket(name) {
        return Err(invalid("name is reserved"));
    }
    Ok(())
}

fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
