//! SQLite metadata store.
//!
//! Bucket records and object entries are stored as JSON text. Each object
//! row carries a per-key sequence number; the latest version of a key is the
//! row with the highest `seq`. The null version is stored with an empty
//! `version_id`.

use super::{ListParams, MetadataError, MetadataResult, MetadataStore, NULL_VERSION_ID};
use crate::models::{bucket::BucketRecord, object::MetadataEntry};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info};

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn ensure_bucket(&self, bucket: &str) -> MetadataResult<()> {
        let found = sqlx::query("SELECT 1 FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_optional(&*self.db)
            .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(MetadataError::NoSuchBucket(bucket.to_string())),
        }
    }
}

/// Column value for a version selector. `None` means "latest".
fn version_column(version_id: Option<&str>) -> Option<&str> {
    version_id.map(|id| if id == NULL_VERSION_ID { "" } else { id })
}

fn no_such_key(bucket: &str, key: &str) -> MetadataError {
    MetadataError::NoSuchKey {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_bucket(&self, name: &str) -> MetadataResult<BucketRecord> {
        let row = sqlx::query("SELECT record FROM buckets WHERE name = ?")
            .bind(name)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| MetadataError::NoSuchBucket(name.to_string()))?;
        let record: String = row.try_get("record")?;
        Ok(serde_json::from_str(&record)?)
    }

    async fn create_bucket(&self, name: &str, record: &BucketRecord) -> MetadataResult<()> {
        let json = serde_json::to_string(record)?;
        match sqlx::query("INSERT INTO buckets (name, record) VALUES (?, ?)")
            .bind(name)
            .bind(json)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(MetadataError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_bucket(&self, name: &str, record: &BucketRecord) -> MetadataResult<()> {
        let json = serde_json::to_string(record)?;
        let result = sqlx::query("UPDATE buckets SET record = ? WHERE name = ?")
            .bind(json)
            .bind(name)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NoSuchBucket(name.to_string()));
        }
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> MetadataResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM object_entries WHERE bucket = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NoSuchBucket(name.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_object_md(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<MetadataEntry> {
        self.ensure_bucket(bucket).await?;
        let row = match version_column(version_id) {
            None => {
                sqlx::query(
                    "SELECT record FROM object_entries
                     WHERE bucket = ? AND key = ?
                     ORDER BY seq DESC LIMIT 1",
                )
                .bind(bucket)
                .bind(key)
                .fetch_optional(&*self.db)
                .await?
            }
            Some(version) => {
                sqlx::query(
                    "SELECT record FROM object_entries
                     WHERE bucket = ? AND key = ? AND version_id = ?",
                )
                .bind(bucket)
                .bind(key)
                .bind(version)
                .fetch_optional(&*self.db)
                .await?
            }
        };
        let row = row.ok_or_else(|| no_such_key(bucket, key))?;
        let record: String = row.try_get("record")?;
        Ok(serde_json::from_str(&record)?)
    }

    async fn put_object_md(
        &self,
        bucket: &str,
        key: &str,
        entry: &MetadataEntry,
    ) -> MetadataResult<()> {
        self.ensure_bucket(bucket).await?;
        let json = serde_json::to_string(entry)?;
        let version = entry.version_id().unwrap_or("");
        sqlx::query(
            r#"
            INSERT INTO object_entries (bucket, key, version_id, seq, record)
            VALUES (
                ?1, ?2, ?3,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM object_entries WHERE bucket = ?1 AND key = ?2),
                ?4
            )
            ON CONFLICT(bucket, key, version_id) DO UPDATE SET
                seq = excluded.seq,
                record = excluded.record
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(version)
        .bind(json)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn delete_object_md(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> MetadataResult<()> {
        self.ensure_bucket(bucket).await?;
        match version_column(version_id) {
            None => {
                sqlx::query(
                    "DELETE FROM object_entries WHERE rowid = (
                         SELECT rowid FROM object_entries
                         WHERE bucket = ? AND key = ?
                         ORDER BY seq DESC LIMIT 1
                     )",
                )
                .bind(bucket)
                .bind(key)
                .execute(&*self.db)
                .await?;
            }
            Some(version) => {
                sqlx::query(
                    "DELETE FROM object_entries WHERE bucket = ? AND key = ? AND version_id = ?",
                )
                .bind(bucket)
                .bind(key)
                .bind(version)
                .execute(&*self.db)
                .await?;
            }
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        params: &ListParams,
    ) -> MetadataResult<Vec<(String, MetadataEntry)>> {
        self.ensure_bucket(bucket).await?;
        let limit = params
            .max_keys
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT o.key AS key, o.record AS record
            FROM object_entries o
            WHERE o.bucket = ?1
              AND o.seq = (SELECT MAX(seq) FROM object_entries i
                           WHERE i.bucket = o.bucket AND i.key = o.key)
              AND (?2 IS NULL OR o.key > ?2)
              AND (?3 IS NULL OR substr(o.key, 1, length(?3)) = ?3)
            ORDER BY o.key
            LIMIT ?4
            "#,
        )
        .bind(bucket)
        .bind(params.marker.as_deref())
        .bind(params.prefix.as_deref())
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter()
            .map(|row| -> MetadataResult<(String, MetadataEntry)> {
                let key: String = row.try_get("key")?;
                let record: String = row.try_get("record")?;
                Ok((key, serde_json::from_str(&record)?))
            })
            .collect()
    }

    async fn ping(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&*self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::object::ObjectMetadataRecord;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteMetadataStore {
        // One connection: every `sqlite::memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteMetadataStore::new(Arc::new(pool));
        store.migrate().await.unwrap();
        store
            .create_bucket("b", &BucketRecord::new("b", "canon", "canon", Utc::now()))
            .await
            .unwrap();
        store
    }

    fn object(key: &str, version_id: Option<&str>, len: u64) -> MetadataEntry {
        MetadataEntry::Object(ObjectMetadataRecord {
            key: key.to_string(),
            version_id: version_id.map(str::to_string),
            owner: "canon".into(),
            owner_display_name: "canon".into(),
            acl: Default::default(),
            content_length: len,
            content_md5: String::new(),
            content_type: None,
            last_modified: Utc::now(),
            location: Vec::new(),
            is_delete_marker: false,
            sse: None,
        })
    }

    fn length(entry: MetadataEntry) -> u64 {
        entry.into_object().unwrap().content_length
    }

    #[tokio::test]
    async fn bucket_records_round_trip() {
        let store = store().await;
        let mut record = store.get_bucket("b").await.unwrap();
        assert!(!record.transient);

        record.add_transient_flag();
        store.update_bucket("b", &record).await.unwrap();
        assert!(store.get_bucket("b").await.unwrap().transient);

        let err = store.create_bucket("b", &record).await.unwrap_err();
        assert!(matches!(err, MetadataError::BucketAlreadyExists(_)));

        store.delete_bucket("b").await.unwrap();
        assert!(matches!(
            store.get_bucket("b").await,
            Err(MetadataError::NoSuchBucket(_))
        ));
    }

    #[tokio::test]
    async fn latest_version_is_highest_sequence() {
        let store = store().await;
        store.put_object_md("b", "k", &object("k", None, 1)).await.unwrap();
        store.put_object_md("b", "k", &object("k", Some("v2"), 2)).await.unwrap();
        assert_eq!(length(store.get_object_md("b", "k", None).await.unwrap()), 2);
        assert_eq!(length(store.get_object_md("b", "k", Some("null")).await.unwrap()), 1);

        store.put_object_md("b", "k", &object("k", None, 3)).await.unwrap();
        assert_eq!(length(store.get_object_md("b", "k", None).await.unwrap()), 3);

        store.delete_object_md("b", "k", None).await.unwrap();
        assert_eq!(length(store.get_object_md("b", "k", None).await.unwrap()), 2);
        store.delete_object_md("b", "k", Some("v2")).await.unwrap();
        assert!(store.get_object_md("b", "k", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_returns_latest_entry_per_key() {
        let store = store().await;
        for (key, len) in [("p/a", 1), ("p/b", 2), ("q/a", 3)] {
            store.put_object_md("b", key, &object(key, None, len)).await.unwrap();
        }
        store.put_object_md("b", "p/a", &object("p/a", Some("v"), 10)).await.unwrap();

        let listed = store.list_objects("b", &ListParams::prefix("p/")).await.unwrap();
        let got: Vec<_> = listed.into_iter().map(|(k, e)| (k, length(e))).collect();
        assert_eq!(got, vec![("p/a".to_string(), 10), ("p/b".to_string(), 2)]);

        let after = store
            .list_objects(
                "b",
                &ListParams {
                    marker: Some("p/a".into()),
                    max_keys: Some(1),
                    ..ListParams::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].0, "p/b");
    }

    #[tokio::test]
    async fn object_calls_on_missing_bucket_fail() {
        let store = store().await;
        assert!(matches!(
            store.get_object_md("nope", "k", None).await,
            Err(MetadataError::NoSuchBucket(_))
        ));
    }
}
