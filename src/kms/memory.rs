//! In-process KMS. Master keys live in a map and wrap data keys with
//! AES-256-GCM; a random 12-byte nonce is prepended to every wrapped key.

use super::{
    AccountKeyIssuer, GeneratedDataKey, KmsBackend, KmsError, KmsResult, cipher::CRYPTO_SCHEME_V1,
    random_data_key,
};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use async_trait::async_trait;
use rand::{RngCore, rngs::OsRng};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

#[derive(Default)]
pub struct MemoryKms {
    keys: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
    default_key_per_account: bool,
    data_key_generation: bool,
}

impl MemoryKms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_key_per_account(mut self, enabled: bool) -> Self {
        self.default_key_per_account = enabled;
        self
    }

    pub fn with_data_key_generation(mut self, enabled: bool) -> Self {
        self.data_key_generation = enabled;
        self
    }

    /// Load an existing master key, e.g. one read back from disk.
    pub async fn insert_key(&self, id: impl Into<String>, key: Zeroizing<Vec<u8>>) {
        self.keys.write().await.insert(id.into(), key);
    }

    /// Snapshot of every master key, for persistence.
    pub(crate) async fn export_keys(&self) -> Vec<(String, Zeroizing<Vec<u8>>)> {
        self.keys
            .read()
            .await
            .iter()
            .map(|(id, key)| (id.clone(), key.clone()))
            .collect()
    }

    pub async fn contains_key(&self, id: &str) -> bool {
        self.keys.read().await.contains_key(id)
    }

    async fn master_cipher(&self, crypto_scheme: u8, master_key_id: &str) -> KmsResult<Aes256Gcm> {
        if crypto_scheme != CRYPTO_SCHEME_V1 {
            return Err(KmsError::UnsupportedScheme(crypto_scheme));
        }
        let keys = self.keys.read().await;
        let key = keys
            .get(master_key_id)
            .ok_or_else(|| KmsError::UnknownKey(master_key_id.to_string()))?;
        Aes256Gcm::new_from_slice(key).map_err(|_| KmsError::InvalidKeyLength(key.len()))
    }
}

#[async_trait]
impl KmsBackend for MemoryKms {
    fn name(&self) -> &str {
        "memory"
    }

    fn supports_default_key_per_account(&self) -> bool {
        self.default_key_per_account
    }

    fn supports_data_key_generation(&self) -> bool {
        self.data_key_generation
    }

    async fn create_bucket_key(&self, name: &str) -> KmsResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        self.insert_key(id.clone(), random_data_key()).await;
        debug!(key_name = name, master_key_id = %id, "master key created");
        Ok(id)
    }

    async fn destroy_bucket_key(&self, master_key_id: &str) -> KmsResult<()> {
        match self.keys.write().await.remove(master_key_id) {
            Some(_) => Ok(()),
            None => Err(KmsError::UnknownKey(master_key_id.to_string())),
        }
    }

    async fn generate_data_key(
        &self,
        crypto_scheme: u8,
        master_key_id: &str,
    ) -> KmsResult<GeneratedDataKey> {
        if !self.data_key_generation {
            return Err(KmsError::Unsupported("data key generation"));
        }
        let plaintext = random_data_key();
        let ciphered = self
            .cipher_data_key(crypto_scheme, master_key_id, &plaintext)
            .await?;
        Ok(GeneratedDataKey {
            plaintext,
            ciphered,
        })
    }

    async fn cipher_data_key(
        &self,
        crypto_scheme: u8,
        master_key_id: &str,
        plaintext_key: &[u8],
    ) -> KmsResult<Vec<u8>> {
        let cipher = self.master_cipher(crypto_scheme, master_key_id).await?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let wrapped = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext_key)
            .map_err(|e| KmsError::Cipher(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + wrapped.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&wrapped);
        Ok(out)
    }

    async fn decipher_data_key(
        &self,
        crypto_scheme: u8,
        master_key_id: &str,
        ciphered_key: &[u8],
    ) -> KmsResult<Zeroizing<Vec<u8>>> {
        if ciphered_key.len() <= NONCE_LEN {
            return Err(KmsError::Cipher("wrapped key too short".into()));
        }
        let cipher = self.master_cipher(crypto_scheme, master_key_id).await?;
        let (nonce, wrapped) = ciphered_key.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), wrapped)
            .map(Zeroizing::new)
            .map_err(|e| KmsError::Cipher(e.to_string()))
    }
}

/// Account key issuer that mints one key per canonical ID in a backend.
pub struct MemoryAccountKeys {
    backend: Arc<dyn KmsBackend>,
    issued: RwLock<HashMap<String, String>>,
}

impl MemoryAccountKeys {
    pub fn new(backend: Arc<dyn KmsBackend>) -> Self {
        Self {
            backend,
            issued: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AccountKeyIssuer for MemoryAccountKeys {
    async fn get_or_create_account_key(&self, canonical_id: &str) -> KmsResult<String> {
        if let Some(id) = self.issued.read().await.get(canonical_id) {
            return Ok(id.clone());
        }
        let mut issued = self.issued.write().await;
        // Another caller may have won while the lock was released.
        if let Some(id) = issued.get(canonical_id) {
            return Ok(id.clone());
        }
        let id = self
            .backend
            .create_bucket_key(&format!("account-{canonical_id}"))
            .await?;
        issued.insert(canonical_id.to_string(), id.clone());
        Ok(id)
    }
}
