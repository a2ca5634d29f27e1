//! SQLite-backed storage view.
//!
//! Entries live in a single table keyed by their full path. The table is
//! created on first use so the store can share a database with other data.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use sqlx::SqlitePool;

use crate::error::Error;

use super::{immediate_children, Storage, StorageEntry};

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new(pool: SqlitePool) -> Result<Self, Error> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS credvault_storage (
                key TEXT NOT NULL,
                value BLOB NOT NULL,

                PRIMARY KEY (key)
            )
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl Storage for SqliteStorage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StorageEntry>, Error>> {
        Box::pin(async move {
            let value: Option<Vec<u8>> =
                sqlx::query_scalar("SELECT value FROM credvault_storage WHERE key = $1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;

            Ok(value.map(|v| StorageEntry::new(key, Bytes::from(v))))
        })
    }

    fn put(&self, entry: StorageEntry) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            sqlx::query(
                "
                INSERT INTO credvault_storage (key, value) VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET value = excluded.value
                ",
            )
            .bind(&entry.key)
            .bind(entry.value.as_ref())
            .execute(&self.pool)
            .await?;

            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM credvault_storage WHERE key = $1")
                .bind(key)
                .execute(&self.pool)
                .await?;

            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, Error>> {
        Box::pin(async move {
            let keys: Vec<String> = sqlx::query_scalar(
                "SELECT key FROM credvault_storage WHERE substr(key, 1, length($1)) = $2",
            )
            .bind(prefix)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;

            Ok(immediate_children(prefix, keys.iter().map(String::as_str)))
        })
    }
}
