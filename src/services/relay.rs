//! Streaming a blob into the data store while hashing it.
//!
//! The running MD5 is an owned value: each transfer takes it, feeds the
//! bytes it moves through it and hands it back, so a caller copying several
//! blobs in order ends up with the digest of their concatenation.

use crate::{
    errors::{S3Error, S3Result},
    kms::cipher::CipherBundle,
    models::object::DataLocation,
    store::{ByteStream, DataError, DataStore, PutContext},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt, channel::mpsc};
use std::io;
use tracing::trace;

/// MD5 of the empty string; the ETag of every zero-byte object or part.
pub const EMPTY_FILE_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// Chunks buffered between the source reader and the data store writer.
const RELAY_BUFFER: usize = 4;

/// Incremental MD5 plus the number of bytes it has seen.
pub struct RelayMd5 {
    context: md5::Context,
    bytes: u64,
}

impl RelayMd5 {
    pub fn new() -> Self {
        Self {
            context: md5::Context::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.context.consume(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex digest.
    pub fn finish(self) -> String {
        format!("{:x}", self.context.compute())
    }

    /// Raw digest bytes, for comparing against a `Content-MD5` header.
    pub fn finish_raw(self) -> [u8; 16] {
        self.context.compute().0
    }
}

impl Default for RelayMd5 {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipe `source` into `data`, updating `hash` with every plaintext chunk.
///
/// Reading and writing overlap through a bounded channel. Returns the new
/// location and the hash, advanced past this blob.
pub(crate) async fn relay_blob(
    data: &dyn DataStore,
    source: ByteStream,
    mut hash: RelayMd5,
    cipher: Option<CipherBundle>,
    size: u64,
    context: &PutContext,
) -> S3Result<(DataLocation, RelayMd5)> {
    let (mut tx, rx) = mpsc::channel::<io::Result<Bytes>>(RELAY_BUFFER);

    let pump = async move {
        let mut source = source;
        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(bytes) => {
                    hash.update(&bytes);
                    if tx.send(Ok(bytes)).await.is_err() {
                        // The writer gave up; its own error is reported.
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(io::Error::new(err.kind(), err.to_string()))).await;
                    return Err(S3Error::from(DataError::Io(err)));
                }
            }
        }
        Ok(hash)
    };
    let write = async {
        data.put(cipher, rx.boxed(), size, context)
            .await
            .map_err(S3Error::from)
    };

    let (hash, location) = tokio::try_join!(pump, write)?;
    trace!(
        bucket = %context.bucket,
        key = %context.object_key,
        relayed = hash.bytes(),
        "blob relayed"
    );
    Ok((location, hash))
}
