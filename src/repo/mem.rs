use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;

use super::DataStore;
use crate::error::Result;

/// Ordered in-memory backend. The whole map sits behind one lock, which is
/// fine for the sizes this store is meant for (tests, scratch repos).
#[derive(Debug, Default)]
pub struct MemDataStore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl DataStore for MemDataStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    async fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.inner.read().contains_key(key))
    }

    async fn scan(&self, prefix: &[u8]) -> BoxStream<'static, Result<(Vec<u8>, Vec<u8>)>> {
        // the snapshot keeps the stream 'static and decoupled from the lock
        let entries: Vec<_> = self
            .inner
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| Ok((k.clone(), v.clone())))
            .collect();
        stream::iter(entries).boxed()
    }

    async fn batch_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut inner = self.inner.write();
        for (key, value) in entries {
            inner.insert(key, value);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn scan_is_ordered_and_prefix_bounded() {
        let store = MemDataStore::new();
        for key in ["a/2", "a/1", "b/1", "a/3"] {
            store.put(key.as_bytes(), b"v").await.unwrap();
        }

        let keys: Vec<_> = store
            .scan(b"a/")
            .await
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect();

        assert_eq!(keys, vec!["a/1", "a/2", "a/3"]);
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = MemDataStore::new();
        store.put(b"k", b"v1").await.unwrap();
        assert!(store.has(b"k").await.unwrap());
        store.put(b"k", b"v2").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), Some(b"v2".to_vec()));
        store.delete(b"k").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), None);
    }
}
