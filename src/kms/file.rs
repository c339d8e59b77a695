//! File-backed KMS: the in-memory backend plus a JSON key file rewritten
//! (tmp + rename) after every key change, so encrypted data stays readable
//! across restarts.

use super::{GeneratedDataKey, KmsBackend, KmsError, KmsResult, memory::MemoryKms};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info};
use zeroize::Zeroizing;

pub struct FileKms {
    inner: MemoryKms,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKms {
    /// Open the key file at `path`, creating an empty store when absent.
    pub async fn open(path: impl AsRef<Path>, default_key_per_account: bool) -> KmsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = MemoryKms::new().with_default_key_per_account(default_key_per_account);
        match fs::read(&path).await {
            Ok(raw) => {
                let stored: BTreeMap<String, String> = serde_json::from_slice(&raw)?;
                let count = stored.len();
                for (id, encoded) in stored {
                    let key = general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|_| KmsError::CorruptDescriptor("base64 master key"))?;
                    inner.insert_key(id, Zeroizing::new(key)).await;
                }
                info!(path = %path.display(), count, "loaded master keys");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no key file yet");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            inner,
            path,
            write_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> KmsResult<()> {
        let _guard = self.write_lock.lock().await;
        let stored: BTreeMap<String, String> = self
            .inner
            .export_keys()
            .await
            .into_iter()
            .map(|(id, key)| (id, general_purpose::STANDARD.encode(key.as_slice())))
            .collect();
        let content = Zeroizing::new(serde_json::to_vec_pretty(&stored)?);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&content).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KmsBackend for FileKms {
    fn name(&self) -> &str {
        "file"
    }

    fn supports_default_key_per_account(&self) -> bool {
        self.inner.supports_default_key_per_account()
    }

    async fn create_bucket_key(&self, name: &str) -> KmsResult<String> {
        let id = self.inner.create_bucket_key(name).await?;
        self.persist().await?;
        Ok(id)
    }

    async fn destroy_bucket_key(&self, master_key_id: &str) -> KmsResult<()> {
        self.inner.destroy_bucket_key(master_key_id).await?;
        self.persist().await
    }

    async fn generate_data_key(
        &self,
        crypto_scheme: u8,
        master_key_id: &str,
    ) -> KmsResult<GeneratedDataKey> {
        self.inner.generate_data_key(crypto_scheme, master_key_id).await
    }

    async fn cipher_data_key(
        &self,
        crypto_scheme: u8,
        master_key_id: &str,
        plaintext_key: &[u8],
    ) -> KmsResult<Vec<u8>> {
        self.inner
            .cipher_data_key(crypto_scheme, master_key_id, plaintext_key)
            .await
    }

    async fn decipher_data_key(
        &self,
        crypto_scheme: u8,
        master_key_id: &str,
        ciphered_key: &[u8],
    ) -> KmsResult<Zeroizing<Vec<u8>>> {
        self.inner
            .decipher_data_key(crypto_scheme, master_key_id, ciphered_key)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::cipher::CRYPTO_SCHEME_V1;

    #[tokio::test]
    async fn keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let kms = FileKms::open(&path, false).await.unwrap();
        let id = kms.create_bucket_key("photos").await.unwrap();
        let wrapped = kms
            .cipher_data_key(CRYPTO_SCHEME_V1, &id, &[9u8; 32])
            .await
            .unwrap();
        drop(kms);

        let reopened = FileKms::open(&path, false).await.unwrap();
        let plain = reopened
            .decipher_data_key(CRYPTO_SCHEME_V1, &id, &wrapped)
            .await
            .unwrap();
        assert_eq!(plain.as_slice(), &[9u8; 32]);

        reopened.destroy_bucket_key(&id).await.unwrap();
        let after_destroy = FileKms::open(&path, false).await.unwrap();
        assert!(matches!(
            after_destroy
                .decipher_data_key(CRYPTO_SCHEME_V1, &id, &wrapped)
                .await,
            Err(KmsError::UnknownKey(_))
        ));
    }
}
