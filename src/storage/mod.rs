//! Key-value storage view handed to the backend.
//!
//! Keys are `/`-separated. The backend treats storage as an opaque ordered
//! byte store; nothing here is transactional across keys.

use std::collections::BTreeSet;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

pub mod memory;
pub mod sqlite;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: String,
    pub value: Bytes,
}

impl StorageEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Serializes `value` as JSON under `key`.
    pub fn json<T: Serialize + ?Sized>(key: impl Into<String>, value: &T) -> Result<Self, Error> {
        Ok(Self {
            key: key.into(),
            value: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

pub trait Storage: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StorageEntry>, Error>>;

    fn put(&self, entry: StorageEntry) -> BoxFuture<'_, Result<(), Error>>;

    /// Deleting a missing key succeeds.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Returns the immediate children of `prefix`, sorted. Children that have
    /// descendants of their own are returned once, with a trailing `/`.
    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, Error>>;
}

impl<'s> dyn Storage + 's {
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.get(key).await? {
            Some(entry) => Ok(Some(entry.decode()?)),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), Error> {
        self.put(StorageEntry::json(key, value)?).await
    }
}

/// Reduces full keys under `prefix` to the immediate children of `prefix`.
pub(crate) fn immediate_children<'a>(
    prefix: &str,
    keys: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    keys.into_iter()
        .filter_map(|key| key.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty())
        .map(|rest| match rest.find('/') {
            Some(i) => rest[..=i].to_owned(),
            None => rest.to_owned(),
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
