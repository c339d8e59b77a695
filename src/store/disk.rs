//! Local-disk data store.
//!
//! Blobs get opaque UUID keys and live at `root/{aa}/{bb}/{key}`, where
//! `aa`/`bb` are the first two bytes of MD5(key). Writes go to a temp file
//! in the shard directory, are fsynced, then renamed into place.

use super::{ByteStream, DataError, DataResult, DataStore, PutContext, encipher};
use crate::{kms::cipher::CipherBundle, models::object::DataLocation};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub const DISK_DATA_STORE_NAME: &str = "file";

const SHARD_RETRIES: u32 = 3;

#[derive(Clone, Debug)]
pub struct DiskDataStore {
    base_path: PathBuf,
}

impl DiskDataStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Two-level shard directories for a blob key.
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, key: &str) -> DataResult<PathBuf> {
        // Keys are generated here; anything else is not ours.
        if key.is_empty() || key.contains(['/', '\\', '.']) {
            return Err(DataError::NotFound(key.to_string()));
        }
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        Ok(path)
    }

    async fn write_blob(&self, mut file: File, mut stream: ByteStream) -> DataResult<u64> {
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Create the temp file, recreating its shard directory when a concurrent
    /// delete pruned it in between.
    async fn create_tmp(&self, parent: &Path, tmp_path: &Path) -> DataResult<File> {
        let mut attempts = 0;
        loop {
            fs::create_dir_all(parent).await?;
            match File::create(tmp_path).await {
                Ok(file) => return Ok(file),
                Err(err) if err.kind() == ErrorKind::NotFound && attempts < SHARD_RETRIES => {
                    attempts += 1;
                    trace!(dir = %parent.display(), attempts, "shard directory vanished, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Remove now-empty shard directories below the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl DataStore for DiskDataStore {
    fn name(&self) -> &str {
        DISK_DATA_STORE_NAME
    }

    async fn get(&self, location: &DataLocation) -> DataResult<ByteStream> {
        let path = self.blob_path(&location.key)?;
        let mut file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                DataError::NotFound(location.key.clone())
            } else {
                DataError::Io(err)
            }
        })?;
        match location.range {
            None => Ok(ReaderStream::new(file).boxed()),
            Some((start, end)) => {
                file.seek(SeekFrom::Start(start)).await?;
                let len = end.saturating_sub(start).saturating_add(1);
                Ok(ReaderStream::new(file.take(len)).boxed())
            }
        }
    }

    async fn put(
        &self,
        cipher: Option<CipherBundle>,
        stream: ByteStream,
        size: u64,
        context: &PutContext,
    ) -> DataResult<DataLocation> {
        let key = Uuid::new_v4().simple().to_string();
        let file_path = self.blob_path(&key)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| DataError::Backend("blob path missing parent directory".into()))?;
        let tmp_path = parent.join(format!(".tmp-{key}"));
        let file = self.create_tmp(&parent, &tmp_path).await?;

        let written = match self.write_blob(file, encipher(cipher, stream)).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if written != size {
            warn!(
                bucket = %context.bucket,
                key = %context.object_key,
                expected = size,
                written,
                "blob size differs from announced size"
            );
        }
        trace!(bucket = %context.bucket, key = %context.object_key, data_key = %key, written, "blob stored");
        Ok(DataLocation::new(key, DISK_DATA_STORE_NAME, written))
    }

    async fn batch_delete(&self, locations: &[DataLocation]) -> DataResult<()> {
        let mut failed = 0usize;
        for location in locations {
            let path = match self.blob_path(&location.key) {
                Ok(path) => path,
                Err(err) => {
                    warn!(data_key = %location.key, error = %err, "skipping blob outside the store");
                    failed += 1;
                    continue;
                }
            };
            match fs::remove_file(&path).await {
                Ok(()) => {
                    if let Some(parent) = path.parent() {
                        self.prune_empty_dirs(parent).await;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(data_key = %location.key, error = %err, "failed to delete blob");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(DataError::Backend(format!(
                "{failed} of {} blobs could not be deleted",
                locations.len()
            )));
        }
        Ok(())
    }

    async fn ping(&self) -> DataResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let marker = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&marker, b"ok").await?;
        fs::remove_file(&marker).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{TryStreamExt, stream};

    fn body(parts: &[&'static [u8]]) -> ByteStream {
        let parts: Vec<_> = parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        stream::iter(parts).boxed()
    }

    async fn read_all(store: &DiskDataStore, location: &DataLocation) -> Vec<u8> {
        let chunks: Vec<Bytes> = store.get(location).await.unwrap().try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn write_read_range_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskDataStore::new(dir.path());

        let mut location = store
            .put(None, body(&[b"0123", b"456789"]), 10, &PutContext::default())
            .await
            .unwrap();
        assert_eq!(location.size, Some(10));
        assert_eq!(location.data_store_name, DISK_DATA_STORE_NAME);
        assert_eq!(read_all(&store, &location).await, b"0123456789");

        location.range = Some((3, 6));
        assert_eq!(read_all(&store, &location).await, b"3456");

        store.batch_delete(std::slice::from_ref(&location)).await.unwrap();
        assert!(matches!(store.get(&location).await, Err(DataError::NotFound(_))));
        // Deleting twice is fine.
        store.batch_delete(std::slice::from_ref(&location)).await.unwrap();
        // Shard directories are pruned with the last blob.
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn foreign_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskDataStore::new(dir.path());
        let location = DataLocation::new("../etc/passwd", DISK_DATA_STORE_NAME, 1);
        assert!(matches!(store.get(&location).await, Err(DataError::NotFound(_))));
    }

    #[tokio::test]
    async fn batch_delete_keeps_going_past_bad_locations() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskDataStore::new(dir.path());
        let real = store
            .put(None, body(&[b"payload"]), 7, &PutContext::default())
            .await
            .unwrap();
        let legacy = DataLocation::new("legacy.key", DISK_DATA_STORE_NAME, 3);

        let result = store.batch_delete(&[legacy, real.clone()]).await;
        assert!(matches!(result, Err(DataError::Backend(_))));
        assert!(matches!(store.get(&real).await, Err(DataError::NotFound(_))));
    }

    #[tokio::test]
    async fn put_recreates_a_pruned_shard() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskDataStore::new(dir.path());
        let parent = dir.path().join("ab").join("cd");
        let tmp_path = parent.join(".tmp-x");

        store.create_tmp(&parent, &tmp_path).await.unwrap();
        std::fs::remove_file(&tmp_path).unwrap();
        store.prune_empty_dirs(&parent).await;
        assert!(!parent.exists());

        store.create_tmp(&parent, &tmp_path).await.unwrap();
        assert!(tmp_path.exists());
    }

    #[tokio::test]
    async fn ping_writes_under_the_root() {
        let dir = tempfile::tempdir().unwrap();
        DiskDataStore::new(dir.path().join("nested")).ping().await.unwrap();
    }
}
