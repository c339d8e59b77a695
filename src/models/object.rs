//! Represents an object (file) stored in a bucket, and where its bytes live.

use super::{
    bucket::{Acl, OwnershipEntry},
    multipart::{MpuOverviewRecord, PartRecord},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Data store name given to locations written before the name was recorded.
pub const LEGACY_DATA_STORE_NAME: &str = "legacy";

/// Where one contiguous slice of an object's bytes lives in the data store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataLocation {
    /// Opaque key returned by the data store.
    pub key: String,

    pub data_store_name: String,

    /// Byte size of this slice. Missing on legacy single-string locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Offset of this slice within the whole object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store_etag: Option<String>,

    /// Present when the slice was written through a cipher bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse: Option<LocationEncryption>,

    /// Inclusive byte range to read from this slice. Never persisted.
    #[serde(skip)]
    pub range: Option<(u64, u64)>,
}

impl DataLocation {
    pub fn new(key: impl Into<String>, data_store_name: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            data_store_name: data_store_name.into(),
            size: Some(size),
            start: None,
            data_store_etag: None,
            sse: None,
            range: None,
        }
    }

    /// A location recorded as a bare key string by older writers.
    pub fn from_legacy_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data_store_name: LEGACY_DATA_STORE_NAME.to_string(),
            size: None,
            start: None,
            data_store_etag: None,
            sse: None,
            range: None,
        }
    }

    /// True when the slice can be addressed by byte range.
    pub fn is_range_addressable(&self) -> bool {
        self.start.is_some() && self.size.is_some()
    }
}

/// Per-location envelope encryption material.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocationEncryption {
    pub algorithm: String,
    pub master_key_id: String,
    /// Absent when only the object-level fields were known; the location
    /// cannot be deciphered until they are filled in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_scheme: Option<u8>,
    /// Base64 of the wrapped data key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphered_data_key: Option<String>,
}

/// Object-level server-side encryption fields.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEncryption {
    pub algorithm: String,
    pub master_key_id: String,
}

/// Metadata for one version of an object (or one delete marker).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadataRecord {
    pub key: String,

    /// `None` is the null (unversioned) version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,

    pub owner: String,

    #[serde(default)]
    pub owner_display_name: String,

    #[serde(default)]
    pub acl: Acl,

    pub content_length: u64,

    /// Hex MD5 of the content; doubles as the ETag.
    pub content_md5: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    pub last_modified: DateTime<Utc>,

    /// Always a list after reading; see [`deserialize_locations`].
    #[serde(default, deserialize_with = "deserialize_locations")]
    pub location: Vec<DataLocation>,

    #[serde(default)]
    pub is_delete_marker: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse: Option<ObjectEncryption>,
}

impl ObjectMetadataRecord {
    pub fn is_null_version(&self) -> bool {
        self.version_id.is_none()
    }
}

/// A value stored under an object key in the metadata store.
///
/// Regular buckets hold objects; shadow buckets hold MPU overviews and
/// parts; the users bucket holds ownership entries.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataEntry {
    Object(ObjectMetadataRecord),
    Overview(MpuOverviewRecord),
    Part(PartRecord),
    Ownership(OwnershipEntry),
}

impl MetadataEntry {
    /// Version the entry is stored under; only objects carry versions.
    pub fn version_id(&self) -> Option<&str> {
        match self {
            MetadataEntry::Object(record) => record.version_id.as_deref(),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<ObjectMetadataRecord> {
        match self {
            MetadataEntry::Object(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_overview(self) -> Option<MpuOverviewRecord> {
        match self {
            MetadataEntry::Overview(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_part(self) -> Option<PartRecord> {
        match self {
            MetadataEntry::Part(record) => Some(record),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocationRepr {
    Many(Vec<DataLocation>),
    One(DataLocation),
    LegacyKey(String),
}

/// Normalize every stored shape of `location` to a list: absent or null
/// becomes empty, a single entry or a bare key string becomes one element.
pub fn deserialize_locations<'de, D>(deserializer: D) -> Result<Vec<DataLocation>, D::Error>
where
    D: Deserializer<'de>,
{
    let repr = Option::<LocationRepr>::deserialize(deserializer)?;
    Ok(match repr {
        None => Vec::new(),
        Some(LocationRepr::Many(locations)) => locations,
        Some(LocationRepr::One(location)) => vec![location],
        Some(LocationRepr::LegacyKey(key)) => vec![DataLocation::from_legacy_key(key)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_json(location: serde_json::Value) -> serde_json::Value {
        json!({
            "key": "a.txt",
            "owner": "canon",
            "contentLength": 3,
            "contentMd5": "900150983cd24fb0d6963f7d28e17f72",
            "lastModified": "2024-01-01T00:00:00Z",
            "location": location,
        })
    }

    #[test]
    fn legacy_string_location_becomes_one_element_list() {
        let record: ObjectMetadataRecord =
            serde_json::from_value(record_json(json!("abcdef0123"))).unwrap();
        assert_eq!(record.location.len(), 1);
        assert_eq!(record.location[0].key, "abcdef0123");
        assert_eq!(record.location[0].data_store_name, LEGACY_DATA_STORE_NAME);
        assert!(!record.location[0].is_range_addressable());
    }

    #[test]
    fn single_object_and_null_locations_normalize() {
        let one: ObjectMetadataRecord = serde_json::from_value(record_json(json!({
            "key": "k1", "dataStoreName": "file", "size": 3, "start": 0
        })))
        .unwrap();
        assert_eq!(one.location.len(), 1);
        assert!(one.location[0].is_range_addressable());

        let none: ObjectMetadataRecord =
            serde_json::from_value(record_json(serde_json::Value::Null)).unwrap();
        assert!(none.location.is_empty());
    }

    #[test]
    fn entries_round_trip_through_their_tag() {
        let record: ObjectMetadataRecord = serde_json::from_value(record_json(json!([
            { "key": "k1", "dataStoreName": "file", "size": 1, "start": 0 },
            { "key": "k2", "dataStoreName": "file", "size": 2, "start": 1 }
        ])))
        .unwrap();
        let entry = MetadataEntry::Object(record.clone());
        let text = serde_json::to_string(&entry).unwrap();
        assert!(text.contains("\"kind\":\"object\""));
        let back: MetadataEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(back.into_object(), Some(record));
    }
}
