//! Composite key encodings for the internal buckets.
//!
//! Multipart upload state lives in a *shadow bucket* next to each
//! destination bucket. Every in-flight upload owns one overview entry and
//! one entry per part:
//!
//! - overview: `overview{SPLITTER}{objectKey}{SPLITTER}{uploadId}`
//! - part:     `{uploadId}{SPLITTER}{00042}`
//!
//! The users bucket maps an account to the buckets it owns with keys of the
//! form `{canonicalId}{SPLITTER}{bucketName}`.
//!
//! These layouts are shared with any pre-existing shadow-bucket data, so the
//! literal separators below must never change.

use std::fmt;
use thiserror::Error;

/// Reserved separator; never occurs in canonical IDs, bucket names or upload IDs.
pub const SPLITTER: &str = "..|..";
/// Separator used by the legacy users bucket. Read-only compatibility.
pub const OLD_SPLITTER: &str = "splitterfornow";
/// Users bucket written with [`SPLITTER`].
pub const USERS_BUCKET: &str = "users..bucket";
/// Legacy users bucket written with [`OLD_SPLITTER`].
pub const OLD_USERS_BUCKET: &str = "namespaceusersbucket";
/// Prefix prepended to a destination bucket name to get its shadow bucket.
pub const MPU_BUCKET_PREFIX: &str = "mpuShadowBucket";

const OVERVIEW_TAG: &str = "overview";

/// Inclusive bounds accepted for a part number.
pub const MIN_PART_NUMBER: u32 = 1;
pub const MAX_PART_NUMBER: u32 = 10_000;
const PART_NUMBER_WIDTH: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("part number `{0}` must be an integer between 1 and 10000")]
    InvalidPartNumber(String),
    #[error("`{0}` is not a part key")]
    MalformedPartKey(String),
}

/// A validated multipart part number in `[1, 10000]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartNumber(u32);

impl PartNumber {
    pub fn new(value: u32) -> Result<Self, KeyError> {
        if (MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&value) {
            Ok(Self(value))
        } else {
            Err(KeyError::InvalidPartNumber(value.to_string()))
        }
    }

    /// Parse a decimal part number as it arrives on the query string.
    ///
    /// Signs, decimals and surrounding whitespace are rejected rather than
    /// coerced.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KeyError::InvalidPartNumber(raw.to_string()));
        }
        let value = raw
            .parse::<u32>()
            .map_err(|_| KeyError::InvalidPartNumber(raw.to_string()))?;
        Self::new(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Zero-padded form so lexicographic order equals numeric order.
    pub fn padded(self) -> String {
        format!("{:0width$}", self.0, width = PART_NUMBER_WIDTH)
    }
}

impl fmt::Display for PartNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ownership index key written with the current separator.
pub fn encode_ownership_key(canonical_id: &str, bucket_name: &str) -> String {
    encode_ownership_key_with(SPLITTER, canonical_id, bucket_name)
}

/// Ownership index key with an explicit separator (current or legacy).
pub fn encode_ownership_key_with(splitter: &str, canonical_id: &str, bucket_name: &str) -> String {
    format!("{canonical_id}{splitter}{bucket_name}")
}

/// Prefix covering every bucket owned by `canonical_id`.
pub fn ownership_prefix(splitter: &str, canonical_id: &str) -> String {
    format!("{canonical_id}{splitter}")
}

/// Split an ownership key into `(canonicalId, bucketName)`, accepting both
/// the current and the legacy separator.
pub fn decode_ownership_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(SPLITTER)
        .or_else(|| key.split_once(OLD_SPLITTER))
}

pub fn encode_overview_key(object_key: &str, upload_id: &str) -> String {
    format!("{OVERVIEW_TAG}{SPLITTER}{object_key}{SPLITTER}{upload_id}")
}

/// Prefix of every overview entry for `object_key`; used as the marker for
/// range scans when listing uploads.
pub fn encode_overview_prefix(object_key: &str) -> String {
    format!("{OVERVIEW_TAG}{SPLITTER}{object_key}{SPLITTER}")
}

/// Prefix of every overview entry in a shadow bucket.
pub fn overview_listing_prefix() -> String {
    format!("{OVERVIEW_TAG}{SPLITTER}")
}

/// Split an overview key into `(objectKey, uploadId)`.
pub fn decode_overview_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(OVERVIEW_TAG)?.strip_prefix(SPLITTER)?;
    rest.rsplit_once(SPLITTER)
}

pub fn encode_part_key(upload_id: &str, part_number: PartNumber) -> String {
    format!("{upload_id}{SPLITTER}{}", part_number.padded())
}

/// Prefix of every part entry belonging to `upload_id`.
pub fn part_key_prefix(upload_id: &str) -> String {
    format!("{upload_id}{SPLITTER}")
}

/// Split a part key into `(uploadId, partNumber)`.
pub fn decode_part_key(key: &str) -> Result<(&str, PartNumber), KeyError> {
    let (upload_id, padded) = key
        .rsplit_once(SPLITTER)
        .ok_or_else(|| KeyError::MalformedPartKey(key.to_string()))?;
    if padded.len() != PART_NUMBER_WIDTH {
        return Err(KeyError::MalformedPartKey(key.to_string()));
    }
    let part_number = PartNumber::parse(padded)?;
    Ok((upload_id, part_number))
}

/// Name of the shadow bucket that holds every upload targeting `destination`.
pub fn shadow_bucket_name(destination: &str) -> String {
    format!("{MPU_BUCKET_PREFIX}{destination}")
}

pub fn is_internal_bucket(name: &str) -> bool {
    name == USERS_BUCKET || name == OLD_USERS_BUCKET || name.starts_with(MPU_BUCKET_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_key_round_trips_every_valid_number() {
        for n in MIN_PART_NUMBER..=MAX_PART_NUMBER {
            let part = PartNumber::new(n).unwrap();
            let key = encode_part_key("upload-1", part);
            let (upload_id, decoded) = decode_part_key(&key).unwrap();
            assert_eq!(upload_id, "upload-1");
            assert_eq!(decoded.get(), n);
        }
    }

    #[test]
    fn part_keys_sort_numerically() {
        let mut previous = encode_part_key("u", PartNumber::new(1).unwrap());
        for n in 2..=MAX_PART_NUMBER {
            let key = encode_part_key("u", PartNumber::new(n).unwrap());
            assert!(previous < key, "{previous} should sort before {key}");
            previous = key;
        }
        assert_eq!(
            encode_part_key("u", PartNumber::new(42).unwrap()),
            "u..|..00042"
        );
    }

    #[test]
    fn rejects_out_of_range_and_malformed_part_numbers() {
        for raw in ["0", "10001", "-1", "+3", "1.5", "abc", "", " 7", "99999999999"] {
            assert!(
                matches!(PartNumber::parse(raw), Err(KeyError::InvalidPartNumber(_))),
                "{raw:?} should be rejected"
            );
        }
        assert_eq!(PartNumber::parse("10000").unwrap().get(), 10_000);
        assert!(decode_part_key("no-separator").is_err());
        assert!(decode_part_key("u..|..042").is_err());
    }

    #[test]
    fn ownership_keys_decode_with_either_separator() {
        let current = encode_ownership_key("canon", "photos");
        assert_eq!(current, "canon..|..photos");
        assert_eq!(decode_ownership_key(&current), Some(("canon", "photos")));

        let legacy = encode_ownership_key_with(OLD_SPLITTER, "canon", "photos");
        assert_eq!(decode_ownership_key(&legacy), Some(("canon", "photos")));
        assert!(current.starts_with(&ownership_prefix(SPLITTER, "canon")));
    }

    #[test]
    fn overview_keys_share_the_object_prefix() {
        let key = encode_overview_key("dir/file.bin", "abc123");
        assert!(key.starts_with(&encode_overview_prefix("dir/file.bin")));
        assert!(key.starts_with(&overview_listing_prefix()));
        assert_eq!(decode_overview_key(&key), Some(("dir/file.bin", "abc123")));
        assert_eq!(shadow_bucket_name("photos"), "mpuShadowBucketphotos");
        assert!(is_internal_bucket(&shadow_bucket_name("photos")));
    }
}
