//! Envelope encryption.
//!
//! Every encrypted blob gets its own data key. The data key is wrapped by a
//! master key held in a KMS backend and the wrapped form is persisted next to
//! the blob's location; the plaintext key only lives long enough to build a
//! stream cipher.

pub mod cipher;
pub mod file;
pub mod memory;

use crate::models::{
    bucket::{BucketRecord, SseConfig, SseDescriptor},
    object::LocationEncryption,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use cipher::{CRYPTO_SCHEME_V1, CipherBundle, DATA_KEY_LEN, DecipherBundle, StreamCipher};
use rand::{RngCore, rngs::OsRng};
use std::{fmt, io, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, trace};
use zeroize::{Zeroize, Zeroizing};

pub const SSE_AES256: &str = "AES256";
pub const SSE_AWS_KMS: &str = "aws:kms";

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("master key `{0}` not found")]
    UnknownKey(String),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("crypto scheme {0} is not supported")]
    UnsupportedScheme(u8),
    #[error("invalid key length {0}")]
    InvalidKeyLength(usize),
    #[error("kms backend does not support {0}")]
    Unsupported(&'static str),
    #[error("invalid cryptographic information: missing {0}")]
    CorruptDescriptor(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type KmsResult<T> = Result<T, KmsError>;

/// A data key produced natively by the backend.
pub struct GeneratedDataKey {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub ciphered: Vec<u8>,
}

/// Key-management backend: holds master keys and wraps data keys with them.
#[async_trait]
pub trait KmsBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether one master key per account may replace per-bucket keys.
    fn supports_default_key_per_account(&self) -> bool {
        false
    }

    fn supports_data_key_generation(&self) -> bool {
        false
    }

    /// Mint a master key labelled `name`, returning its id.
    async fn create_bucket_key(&self, name: &str) -> KmsResult<String>;

    async fn destroy_bucket_key(&self, master_key_id: &str) -> KmsResult<()>;

    async fn generate_data_key(
        &self,
        _crypto_scheme: u8,
        _master_key_id: &str,
    ) -> KmsResult<GeneratedDataKey> {
        Err(KmsError::Unsupported("data key generation"))
    }

    async fn cipher_data_key(
        &self,
        crypto_scheme: u8,
        master_key_id: &str,
        plaintext_key: &[u8],
    ) -> KmsResult<Vec<u8>>;

    async fn decipher_data_key(
        &self,
        crypto_scheme: u8,
        master_key_id: &str,
        ciphered_key: &[u8],
    ) -> KmsResult<Zeroizing<Vec<u8>>>;
}

/// Issues the default master key of an account.
#[async_trait]
pub trait AccountKeyIssuer: Send + Sync {
    /// The account's key id, created on first use.
    async fn get_or_create_account_key(&self, canonical_id: &str) -> KmsResult<String>;
}

/// Master key chosen for a bucket and the scope it was minted in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketKey {
    pub master_key_id: String,
    pub is_account_key: bool,
}

/// Adapter between the services and whatever KMS backend is deployed.
#[derive(Clone)]
pub struct EnvelopeEncryption {
    backend: Arc<dyn KmsBackend>,
    account_keys: Option<Arc<dyn AccountKeyIssuer>>,
}

impl fmt::Debug for EnvelopeEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeEncryption")
            .field("backend", &self.backend.name())
            .field("account_keys", &self.account_keys.is_some())
            .finish()
    }
}

impl EnvelopeEncryption {
    pub fn new(backend: Arc<dyn KmsBackend>) -> Self {
        Self {
            backend,
            account_keys: None,
        }
    }

    /// Enable account-scoped keys. Only honoured when the backend supports
    /// one key per account.
    pub fn with_account_keys(mut self, issuer: Arc<dyn AccountKeyIssuer>) -> Self {
        self.account_keys = Some(issuer);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Pick the master key for a new bucket.
    pub async fn create_bucket_key(&self, bucket: &BucketRecord) -> KmsResult<BucketKey> {
        if let Some(issuer) = self
            .account_keys
            .as_ref()
            .filter(|_| self.backend.supports_default_key_per_account())
        {
            debug!(bucket = %bucket.name, owner = %bucket.owner, "using account-level key");
            let master_key_id = issuer.get_or_create_account_key(&bucket.owner).await?;
            return Ok(BucketKey {
                master_key_id,
                is_account_key: true,
            });
        }
        debug!(bucket = %bucket.name, "creating a new bucket key");
        let master_key_id = self
            .backend
            .create_bucket_key(&bucket.name)
            .await
            .inspect_err(|err| {
                debug!(backend = self.backend.name(), error = %err, "error from kms");
            })?;
        trace!(bucket = %bucket.name, "bucket key created in kms");
        Ok(BucketKey {
            master_key_id,
            is_account_key: false,
        })
    }

    pub async fn destroy_bucket_key(&self, master_key_id: &str) -> KmsResult<()> {
        debug!(master_key_id, "deleting bucket key");
        self.backend.destroy_bucket_key(master_key_id).await
    }

    /// Resolve the encryption requested at bucket creation into a stored
    /// descriptor, minting a key when the request does not name one.
    pub async fn bucket_level_encryption(
        &self,
        bucket: &BucketRecord,
        config: &SseConfig,
    ) -> KmsResult<Option<SseDescriptor>> {
        let Some(algorithm) = config.algorithm.as_deref() else {
            return Ok(None);
        };
        let explicit_key = config.master_key_id.as_deref().filter(|id| !id.is_empty());
        let (master_key_id, is_account_encryption_enabled) = match (algorithm, explicit_key) {
            (SSE_AWS_KMS, Some(key_id)) => (key_id.to_string(), false),
            (SSE_AES256, _) | (SSE_AWS_KMS, None) => {
                let key = self.create_bucket_key(bucket).await?;
                (key.master_key_id, key.is_account_key)
            }
            _ => return Ok(None),
        };
        Ok(Some(SseDescriptor {
            algorithm: algorithm.to_string(),
            master_key_id,
            crypto_scheme: CRYPTO_SCHEME_V1,
            mandatory: true,
            is_account_encryption_enabled,
        }))
    }

    /// Build a cipher for writing one blob under `sse`.
    pub async fn create_cipher_bundle(&self, sse: &SseDescriptor) -> KmsResult<CipherBundle> {
        self.build_cipher_bundle(sse).await.inspect_err(|err| {
            error!(
                backend = self.backend.name(),
                error = %err,
                "error processing cipher bundle"
            );
        })
    }

    async fn build_cipher_bundle(&self, sse: &SseDescriptor) -> KmsResult<CipherBundle> {
        let crypto_scheme = CRYPTO_SCHEME_V1;
        let (mut plaintext, ciphered) = if self.backend.supports_data_key_generation() {
            debug!("generating a data key in the kms");
            let generated = self
                .backend
                .generate_data_key(crypto_scheme, &sse.master_key_id)
                .await?;
            (generated.plaintext, generated.ciphered)
        } else {
            let plaintext = random_data_key();
            debug!("ciphering a data key");
            let ciphered = self
                .backend
                .cipher_data_key(crypto_scheme, &sse.master_key_id, &plaintext)
                .await?;
            (plaintext, ciphered)
        };
        trace!("data key ciphered by the kms");

        let cipher = StreamCipher::new(crypto_scheme, &plaintext, 0);
        plaintext.zeroize();
        let cipher = cipher?;

        Ok(CipherBundle {
            algorithm: sse.algorithm.clone(),
            master_key_id: sse.master_key_id.clone(),
            crypto_scheme,
            ciphered_data_key: general_purpose::STANDARD.encode(ciphered),
            cipher,
        })
    }

    /// Build a decipher for a blob written with a cipher bundle, positioned
    /// at `offset` bytes into the plaintext.
    pub async fn create_decipher_bundle(
        &self,
        sse: &LocationEncryption,
        offset: u64,
    ) -> KmsResult<DecipherBundle> {
        let checked = check_decipher_fields(sse).inspect_err(|err| {
            error!(backend = self.backend.name(), error = %err, "invalid cryptographic information");
        })?;
        let (crypto_scheme, ciphered_b64) = checked;
        let ciphered = general_purpose::STANDARD
            .decode(ciphered_b64)
            .map_err(|_| KmsError::CorruptDescriptor("base64 ciphered data key"))?;

        debug!("deciphering a data key");
        let mut plaintext = self
            .backend
            .decipher_data_key(crypto_scheme, &sse.master_key_id, &ciphered)
            .await
            .inspect_err(|err| {
                error!(backend = self.backend.name(), error = %err, "error processing decipher bundle");
            })?;
        trace!("data key deciphered by the kms");

        let decipher = StreamCipher::new(crypto_scheme, &plaintext, offset);
        plaintext.zeroize();
        Ok(DecipherBundle {
            crypto_scheme,
            decipher: decipher?,
        })
    }
}

fn check_decipher_fields(sse: &LocationEncryption) -> KmsResult<(u8, &str)> {
    if sse.master_key_id.is_empty() {
        return Err(KmsError::CorruptDescriptor("master key id"));
    }
    let ciphered = sse
        .ciphered_data_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .ok_or(KmsError::CorruptDescriptor("ciphered data key"))?;
    let crypto_scheme = sse
        .crypto_scheme
        .filter(|scheme| *scheme != 0)
        .ok_or(KmsError::CorruptDescriptor("crypto scheme"))?;
    Ok((crypto_scheme, ciphered))
}

/// Fresh random data key; zeroed when dropped.
pub(crate) fn random_data_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; DATA_KEY_LEN]);
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kms::memory::{MemoryAccountKeys, MemoryKms},
        store::ByteStream,
    };
    use bytes::Bytes;
    use chrono::Utc;
    use futures::{StreamExt, TryStreamExt, stream};

    fn bucket(name: &str, owner: &str) -> BucketRecord {
        BucketRecord::new(name, owner, owner, Utc::now())
    }

    fn byte_stream(chunks: &[&[u8]]) -> ByteStream {
        let chunks: Vec<_> = chunks.iter().map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        stream::iter(chunks).boxed()
    }

    async fn collect(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    async fn round_trip(encryption: &EnvelopeEncryption, sse: &SseDescriptor) {
        let bundle = encryption.create_cipher_bundle(sse).await.unwrap();
        let location_sse = bundle.location_encryption();
        let ciphertext =
            collect(bundle.encrypt_stream(byte_stream(&[b"hello ", b"envelope ", b"world"]))).await;
        assert_ne!(ciphertext, b"hello envelope world");

        let decipher = encryption
            .create_decipher_bundle(&location_sse, 0)
            .await
            .unwrap();
        let plain = collect(decipher.decrypt_stream(byte_stream(&[&ciphertext]))).await;
        assert_eq!(plain, b"hello envelope world");

        let offset = 6;
        let decipher = encryption
            .create_decipher_bundle(&location_sse, offset)
            .await
            .unwrap();
        let tail =
            collect(decipher.decrypt_stream(byte_stream(&[&ciphertext[offset as usize..]]))).await;
        assert_eq!(tail, b"envelope world");
    }

    #[tokio::test]
    async fn bucket_scoped_round_trip() {
        let encryption = EnvelopeEncryption::new(Arc::new(MemoryKms::new()));
        let sse = encryption
            .bucket_level_encryption(
                &bucket("photos", "canon"),
                &SseConfig {
                    algorithm: Some(SSE_AES256.into()),
                    ..SseConfig::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(!sse.is_account_encryption_enabled);
        round_trip(&encryption, &sse).await;
    }

    #[tokio::test]
    async fn account_scoped_round_trip_reuses_the_account_key() {
        let kms = Arc::new(MemoryKms::new().with_default_key_per_account(true));
        let issuer = Arc::new(MemoryAccountKeys::new(kms.clone()));
        let encryption = EnvelopeEncryption::new(kms).with_account_keys(issuer);

        let first = encryption
            .create_bucket_key(&bucket("one", "canon"))
            .await
            .unwrap();
        let second = encryption
            .create_bucket_key(&bucket("two", "canon"))
            .await
            .unwrap();
        assert!(first.is_account_key);
        assert_eq!(first, second);

        let sse = SseDescriptor {
            algorithm: SSE_AES256.into(),
            master_key_id: first.master_key_id,
            crypto_scheme: CRYPTO_SCHEME_V1,
            mandatory: true,
            is_account_encryption_enabled: true,
        };
        round_trip(&encryption, &sse).await;
    }

    #[tokio::test]
    async fn native_data_key_generation_round_trips() {
        let kms = Arc::new(MemoryKms::new().with_data_key_generation(true));
        let encryption = EnvelopeEncryption::new(kms);
        let key = encryption
            .create_bucket_key(&bucket("gen", "canon"))
            .await
            .unwrap();
        let sse = SseDescriptor {
            algorithm: SSE_AES256.into(),
            master_key_id: key.master_key_id,
            crypto_scheme: CRYPTO_SCHEME_V1,
            mandatory: true,
            is_account_encryption_enabled: false,
        };
        round_trip(&encryption, &sse).await;
    }

    #[tokio::test]
    async fn account_keys_ignored_without_backend_support() {
        let kms = Arc::new(MemoryKms::new());
        let issuer = Arc::new(MemoryAccountKeys::new(kms.clone()));
        let encryption = EnvelopeEncryption::new(kms).with_account_keys(issuer);
        let key = encryption
            .create_bucket_key(&bucket("b", "canon"))
            .await
            .unwrap();
        assert!(!key.is_account_key);
    }

    #[tokio::test]
    async fn decipher_requires_every_field() {
        let encryption = EnvelopeEncryption::new(Arc::new(MemoryKms::new()));
        let complete = LocationEncryption {
            algorithm: SSE_AES256.into(),
            master_key_id: "1".into(),
            crypto_scheme: Some(CRYPTO_SCHEME_V1),
            ciphered_data_key: Some("AAAA".into()),
        };
        for broken in [
            LocationEncryption {
                master_key_id: String::new(),
                ..complete.clone()
            },
            LocationEncryption {
                ciphered_data_key: None,
                ..complete.clone()
            },
            LocationEncryption {
                crypto_scheme: None,
                ..complete.clone()
            },
        ] {
            let err = encryption
                .create_decipher_bundle(&broken, 0)
                .await
                .unwrap_err();
            assert!(matches!(err, KmsError::CorruptDescriptor(_)));
        }
    }

    #[tokio::test]
    async fn cipher_bundle_fails_on_unknown_master_key() {
        let encryption = EnvelopeEncryption::new(Arc::new(MemoryKms::new()));
        let sse = SseDescriptor {
            algorithm: SSE_AES256.into(),
            master_key_id: "missing".into(),
            crypto_scheme: CRYPTO_SCHEME_V1,
            mandatory: true,
            is_account_encryption_enabled: false,
        };
        let err = encryption.create_cipher_bundle(&sse).await.unwrap_err();
        assert!(matches!(err, KmsError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn no_algorithm_means_no_descriptor() {
        let encryption = EnvelopeEncryption::new(Arc::new(MemoryKms::new()));
        let explicit = encryption
            .bucket_level_encryption(
                &bucket("b", "canon"),
                &SseConfig {
                    algorithm: Some(SSE_AWS_KMS.into()),
                    master_key_id: Some("external-key".into()),
                    mandatory: true,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(explicit.master_key_id, "external-key");
        assert!(
            encryption
                .bucket_level_encryption(&bucket("b", "canon"), &SseConfig::default())
                .await
                .unwrap()
                .is_none()
        );
    }
}
