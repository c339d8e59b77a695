//! Represents a logical bucket, the top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canned ACL applied when the request does not name one.
pub const DEFAULT_CANNED_ACL: &str = "private";

/// A bucket as persisted in the metadata store.
///
/// Creation and deletion span several metadata writes. The `transient` and
/// `deleted` flags mark a bucket whose creation or deletion has not finished
/// yet; a later request from the same owner repairs it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketRecord {
    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// Canonical ID of the owning account.
    pub owner: String,

    pub owner_display_name: String,

    /// When this bucket was created.
    pub creation_date: DateTime<Utc>,

    #[serde(default)]
    pub acl: Acl,

    /// Absent until versioning has been configured once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versioning: Option<VersioningConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_side_encryption: Option<SseDescriptor>,

    /// Creation in progress.
    #[serde(default)]
    pub transient: bool,

    /// Deletion in progress.
    #[serde(default)]
    pub deleted: bool,
}

impl BucketRecord {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        owner_display_name: impl Into<String>,
        creation_date: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            owner_display_name: owner_display_name.into(),
            creation_date,
            acl: Acl::default(),
            versioning: None,
            server_side_encryption: None,
            transient: false,
            deleted: false,
        }
    }

    /// True while a creation or deletion is unfinished.
    pub fn is_shielded(&self) -> bool {
        self.transient || self.deleted
    }

    pub fn add_transient_flag(&mut self) {
        self.transient = true;
    }

    /// Mark deletion in progress. A bucket never carries both flags.
    pub fn add_deleted_flag(&mut self) {
        self.transient = false;
        self.deleted = true;
    }

    pub fn clear_flags(&mut self) {
        self.transient = false;
        self.deleted = false;
    }

    pub fn versioning_status(&self) -> Option<VersioningStatus> {
        self.versioning.as_ref().map(|cfg| cfg.status)
    }
}

/// ACL grant sets. Grant-header parsing happens upstream; only the parsed
/// result is stored here.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Acl {
    pub canned: String,
    #[serde(default)]
    pub full_control: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    #[serde(default)]
    pub write_acp: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub read_acp: Vec<String>,
}

impl Acl {
    pub fn canned(name: impl Into<String>) -> Self {
        Self {
            canned: name.into(),
            ..Self::default()
        }
    }
}

impl Default for Acl {
    fn default() -> Self {
        Self {
            canned: DEFAULT_CANNED_ACL.to_string(),
            full_control: Vec::new(),
            write: Vec::new(),
            write_acp: Vec::new(),
            read: Vec::new(),
            read_acp: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersioningStatus {
    Enabled,
    Suspended,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersioningConfiguration {
    pub status: VersioningStatus,
    #[serde(default)]
    pub mfa_delete: bool,
}

/// Bucket-level server-side encryption settings.
///
/// `is_account_encryption_enabled` records whether `master_key_id` is an
/// account-scoped key, so later cipher and decipher calls use the right
/// scope without deciding again.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SseDescriptor {
    pub algorithm: String,
    pub master_key_id: String,
    pub crypto_scheme: u8,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub is_account_encryption_enabled: bool,
}

/// Encryption requested at bucket creation, before any key exists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseConfig {
    /// `AES256`, `aws:kms`, or `None` for no encryption.
    pub algorithm: Option<String>,
    /// Explicit KMS key for `aws:kms`.
    pub master_key_id: Option<String>,
    pub mandatory: bool,
}

/// Value stored in the users bucket for each owned bucket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipEntry {
    pub creation_date: DateTime<Utc>,
}
