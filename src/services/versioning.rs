//! Versioning-aware delete decisions.

use crate::{
    models::{
        bucket::{BucketRecord, VersioningStatus},
        object::ObjectMetadataRecord,
    },
    store::NULL_VERSION_ID,
};

/// What a delete request turns into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteDecision {
    /// Remove the addressed version and its data. When false, a delete
    /// marker is written instead.
    pub delete_data: bool,
    /// Version to remove when `delete_data` is set; `None` means the latest.
    pub target_version: Option<String>,
}

pub trait VersioningPreprocessor: Send + Sync {
    fn decide(
        &self,
        bucket: &BucketRecord,
        object: Option<&ObjectMetadataRecord>,
        requested_version_id: Option<&str>,
    ) -> DeleteDecision;
}

/// S3 semantics: data goes away in unversioned buckets or when a version is
/// named; otherwise the delete becomes a marker.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardVersioning;

impl VersioningPreprocessor for StandardVersioning {
    fn decide(
        &self,
        bucket: &BucketRecord,
        object: Option<&ObjectMetadataRecord>,
        requested_version_id: Option<&str>,
    ) -> DeleteDecision {
        if bucket.versioning.is_none() {
            return DeleteDecision {
                delete_data: object.is_some(),
                target_version: None,
            };
        }
        match requested_version_id {
            None => DeleteDecision {
                delete_data: false,
                target_version: None,
            },
            Some(NULL_VERSION_ID) => DeleteDecision {
                delete_data: object.is_some(),
                target_version: Some(
                    object
                        .and_then(|o| o.version_id.clone())
                        .unwrap_or_else(|| NULL_VERSION_ID.to_string()),
                ),
            },
            Some(version) => DeleteDecision {
                delete_data: object.is_some(),
                target_version: Some(version.to_string()),
            },
        }
    }
}

/// Version id for a new write: fresh when versioning is enabled, the null
/// version otherwise.
pub fn next_version_id(bucket: &BucketRecord) -> Option<String> {
    match bucket.versioning_status() {
        Some(VersioningStatus::Enabled) => Some(uuid::Uuid::new_v4().simple().to_string()),
        Some(VersioningStatus::Suspended) | None => None,
    }
}
