//! Represents multipart upload sessions and parts as stored in a shadow bucket.

use super::{
    bucket::SseDescriptor,
    object::{DataLocation, deserialize_locations},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who started an upload. Only the initiator may add parts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Initiator {
    pub id: String,
    pub display_name: String,
}

/// Overview of a multipart upload session, written at initiation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MpuOverviewRecord {
    /// Unique upload ID (returned to client).
    pub upload_id: String,

    /// Destination bucket of the completed object.
    pub bucket: String,

    /// Destination object key.
    pub object_key: String,

    pub initiator: Initiator,

    /// Canonical ID of the destination bucket owner.
    pub owner: String,

    /// Timestamp when upload was initiated.
    pub initiated: DateTime<Utc>,

    /// Encryption in force on the destination bucket at initiation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse: Option<SseDescriptor>,
}

/// One uploaded (or copied) part of a multipart upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    pub upload_id: String,

    /// Part number (1-based).
    pub part_number: u32,

    /// Hex MD5 over the part bytes, in order; the part ETag.
    pub etag: String,

    /// Size in bytes.
    pub size: u64,

    /// Older writers stored a single location instead of a list.
    #[serde(default, deserialize_with = "deserialize_locations")]
    pub locations: Vec<DataLocation>,

    /// Timestamp when this part was uploaded.
    pub last_modified: DateTime<Utc>,
}
