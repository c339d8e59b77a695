//! Stream ciphers handed out by the envelope encryption adapter.
//!
//! Crypto scheme 1 is AES-256-CTR keyed by a fresh per-bundle data key with
//! a zero IV. CTR lets a decipher start at any byte offset, which ranged
//! reads and ranged copies rely on.

use super::KmsError;
use crate::{models::object::LocationEncryption, store::ByteStream};
use aes::Aes256;
use bytes::Bytes;
use ctr::cipher::{KeyIvInit, StreamCipher as _, StreamCipherSeek};
use futures::StreamExt;
use std::fmt;

pub const CRYPTO_SCHEME_V1: u8 = 1;
pub const DATA_KEY_LEN: usize = 32;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// A live keystream positioned at some byte offset.
pub struct StreamCipher {
    inner: Aes256Ctr,
}

impl StreamCipher {
    pub(crate) fn new(crypto_scheme: u8, key: &[u8], offset: u64) -> Result<Self, KmsError> {
        if crypto_scheme != CRYPTO_SCHEME_V1 {
            return Err(KmsError::UnsupportedScheme(crypto_scheme));
        }
        let iv = [0u8; 16];
        let mut inner = Aes256Ctr::new_from_slices(key, &iv)
            .map_err(|_| KmsError::InvalidKeyLength(key.len()))?;
        inner
            .try_seek(offset)
            .map_err(|_| KmsError::Cipher(format!("cannot seek keystream to {offset}")))?;
        Ok(Self { inner })
    }

    /// XOR the keystream into `buf`, advancing the position.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }

    /// Transform every chunk of `stream` in order.
    pub fn transform(mut self, stream: ByteStream) -> ByteStream {
        stream
            .map(move |chunk| {
                chunk.map(|bytes| {
                    let mut buf = bytes.to_vec();
                    self.apply(&mut buf);
                    Bytes::from(buf)
                })
            })
            .boxed()
    }
}

/// Everything needed to encrypt one blob and later find its key again.
pub struct CipherBundle {
    pub algorithm: String,
    pub master_key_id: String,
    pub crypto_scheme: u8,
    /// Base64 of the data key wrapped by `master_key_id`.
    pub ciphered_data_key: String,
    pub cipher: StreamCipher,
}

impl CipherBundle {
    /// Encryption fields to persist on the location written with this bundle.
    pub fn location_encryption(&self) -> LocationEncryption {
        LocationEncryption {
            algorithm: self.algorithm.clone(),
            master_key_id: self.master_key_id.clone(),
            crypto_scheme: Some(self.crypto_scheme),
            ciphered_data_key: Some(self.ciphered_data_key.clone()),
        }
    }

    pub fn encrypt_stream(self, stream: ByteStream) -> ByteStream {
        self.cipher.transform(stream)
    }
}

impl fmt::Debug for CipherBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherBundle")
            .field("algorithm", &self.algorithm)
            .field("master_key_id", &self.master_key_id)
            .field("crypto_scheme", &self.crypto_scheme)
            .finish_non_exhaustive()
    }
}

pub struct DecipherBundle {
    pub crypto_scheme: u8,
    pub decipher: StreamCipher,
}

impl DecipherBundle {
    pub fn decrypt_stream(self, stream: ByteStream) -> ByteStream {
        self.decipher.transform(stream)
    }
}

impl fmt::Debug for DecipherBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecipherBundle")
            .field("crypto_scheme", &self.crypto_scheme)
            .finish_non_exhaustive()
    }
}
