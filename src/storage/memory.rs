//! In-memory storage view, used by tests and ephemeral deployments.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::error::Error;

use super::{immediate_children, Storage, StorageEntry};

#[derive(Clone, Default)]
pub struct InMemoryStorage {
    entries: Arc<papaya::HashMap<String, Bytes>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for InMemoryStorage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<StorageEntry>, Error>> {
        Box::pin(async move {
            let guard = self.entries.guard();
            Ok(self
                .entries
                .get(key, &guard)
                .map(|value| StorageEntry::new(key, value.clone())))
        })
    }

    fn put(&self, entry: StorageEntry) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let guard = self.entries.guard();
            self.entries.insert(entry.key, entry.value, &guard);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let guard = self.entries.guard();
            self.entries.remove(key, &guard);
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, Error>> {
        Box::pin(async move {
            let guard = self.entries.guard();
            let keys = self
                .entries
                .iter(&guard)
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>();

            Ok(immediate_children(prefix, keys.iter().map(String::as_str)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crud() {
        let storage = InMemoryStorage::new();

        storage
            .put(StorageEntry::new("role/deploy", "doc"))
            .await
            .unwrap();
        storage
            .put(StorageEntry::new("role/nested/x", "doc"))
            .await
            .unwrap();

        let entry = storage.get("role/deploy").await.unwrap().unwrap();
        assert_eq!(entry.value, Bytes::from("doc"));

        assert_eq!(
            storage.list("role/").await.unwrap(),
            vec!["deploy", "nested/"]
        );

        storage.delete("role/deploy").await.unwrap();
        storage.delete("role/deploy").await.unwrap();
        assert!(storage.get("role/deploy").await.unwrap().is_none());
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

        storage
            .put_json("config/lease", &serde_json::json!({ "ttl": 10, "max_ttl": 20 }))
            .await
            .unwrap();

        let value: serde_json::Value = storage.get_json("config/lease").await.unwrap().unwrap();
        assert_eq!(value["max_ttl"], 20);

        let missing: Option<serde_json::Value> = storage.get_json("config/root").await.unwrap();
        assert!(missing.is_none());
    }
}
