//! Write-ahead log of side effects whose external resources may be incomplete.
//!
//! An entry is written before the first external call of a multi-step
//! operation and deleted once the last call succeeds. Anything left behind
//! is picked up by the rollback driver in [`super::backend`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Error, storage::Storage};

pub const WAL_PREFIX: &str = "wal/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub kind: String,
    pub data: Value,
    /// Unix seconds.
    pub created_at: i64,
}

impl WalEntry {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::TimeDelta {
        chrono::TimeDelta::seconds(now.timestamp() - self.created_at)
    }
}

/// Appends an entry and returns its id.
pub async fn put<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    kind: &str,
    data: &T,
    now: DateTime<Utc>,
) -> Result<String, Error> {
    let id = uuid::Uuid::new_v4().to_string();

    let entry = WalEntry {
        kind: kind.to_owned(),
        data: serde_json::to_value(data)?,
        created_at: now.timestamp(),
    };

    storage
        .put_json(&format!("{WAL_PREFIX}{id}"), &entry)
        .await?;

    tracing::debug!(wal_id = %id, kind, "wrote WAL entry");

    Ok(id)
}

pub async fn get(storage: &dyn Storage, id: &str) -> Result<Option<WalEntry>, Error> {
    storage.get_json(&format!("{WAL_PREFIX}{id}")).await
}

/// Deleting an id that does not exist succeeds.
pub async fn delete(storage: &dyn Storage, id: &str) -> Result<(), Error> {
    storage.delete(&format!("{WAL_PREFIX}{id}")).await?;

    tracing::debug!(wal_id = %id, "deleted WAL entry");

    Ok(())
}

/// Ids of all entries, without the prefix.
pub async fn list(storage: &dyn Storage) -> Result<Vec<String>, Error> {
    storage.list(WAL_PREFIX).await
}
