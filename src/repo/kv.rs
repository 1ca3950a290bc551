use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sled::{Config as DbConfig, Db, Mode as DbMode};

use super::DataStore;
use crate::error::{Error, Result};

/// [`sled`] based datastore. Uses the default tree; callers namespace their
/// rows with the reserved key prefixes.
///
/// sled's own operations are blocking, so every call hops onto the blocking
/// pool and re-parents the current tracing span there.
///
/// [`sled`]: https://github.com/spacejam/sled
#[derive(Debug)]
pub struct KvDataStore {
    path: PathBuf,
    db: Db,
}

impl KvDataStore {
    pub fn open(root: PathBuf) -> Result<KvDataStore> {
        let db = DbConfig::new()
            .mode(DbMode::HighThroughput)
            .path(root.as_path())
            .open()
            .map_err(Error::backend)?;

        Ok(KvDataStore { path: root, db })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl DataStore for KvDataStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_vec();
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || {
            let span = tracing::trace_span!(parent: &span, "blocking");
            let _g = span.enter();
            db.get(key)
                .map(|res| res.map(|ivec| ivec.to_vec()))
                .map_err(Error::backend)
        })
        .await
        .map_err(Error::backend)?
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_vec();
        let value = value.to_vec();
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || {
            let span = tracing::trace_span!(parent: &span, "blocking");
            let _g = span.enter();
            db.insert(key, value).map(|_| ()).map_err(Error::backend)
        })
        .await
        .map_err(Error::backend)?
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let db = self.db.clone();
        let key = key.to_vec();
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || {
            let span = tracing::trace_span!(parent: &span, "blocking");
            let _g = span.enter();
            db.remove(key).map(|_| ()).map_err(Error::backend)
        })
        .await
        .map_err(Error::backend)?
    }

    async fn has(&self, key: &[u8]) -> Result<bool> {
        let db = self.db.clone();
        let key = key.to_vec();
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || {
            let span = tracing::trace_span!(parent: &span, "blocking");
            let _g = span.enter();
            db.contains_key(key).map_err(Error::backend)
        })
        .await
        .map_err(Error::backend)?
    }

    async fn scan(&self, prefix: &[u8]) -> BoxStream<'static, Result<(Vec<u8>, Vec<u8>)>> {
        use tokio_stream::wrappers::UnboundedReceiverStream;

        let db = self.db.clone();
        let prefix = prefix.to_vec();

        // a bounded channel would require bouncing between the blocking
        // iterator and an async continuation; unbounded matches how far a
        // single prefix scan can realistically grow here
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let span = tracing::Span::current();

        let _jh = tokio::task::spawn_blocking(move || {
            let span = tracing::trace_span!(parent: &span, "blocking");
            let _g = span.enter();

            for res in db.scan_prefix(prefix) {
                let res = res
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(Error::backend);

                if tx.send(res).is_err() {
                    break;
                }
            }
        });

        UnboundedReceiverStream::new(rx).boxed()
    }

    async fn batch_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let db = self.db.clone();
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || {
            let span = tracing::trace_span!(parent: &span, "blocking");
            let _g = span.enter();
            let mut batch = sled::Batch::default();
            for (key, value) in entries {
                batch.insert(key, value);
            }
            db.apply_batch(batch).map_err(Error::backend)
        })
        .await
        .map_err(Error::backend)?
    }

    async fn flush(&self) -> Result<()> {
        let db = self.db.clone();
        let span = tracing::Span::current();
        tokio::task::spawn_blocking(move || {
            let span = tracing::trace_span!(parent: &span, "blocking");
            let _g = span.enter();
            db.flush().map(|_| ()).map_err(Error::backend)
        })
        .await
        .map_err(Error::backend)?
    }

    async fn close(&self) -> Result<()> {
        self.flush().await
    }

    fn kind(&self) -> &'static str {
        "sled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn sled_round_trip_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvDataStore::open(dir.path().to_path_buf()).unwrap();

        store.put(b"blocks/a", b"1").await.unwrap();
        store.put(b"pins/a", b"2").await.unwrap();
        store.put(b"blocks/b", b"3").await.unwrap();

        assert!(store.has(b"blocks/a").await.unwrap());
        assert_eq!(store.get(b"pins/a").await.unwrap(), Some(b"2".to_vec()));

        let blocks: Vec<_> = store
            .scan(b"blocks/")
            .await
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(blocks.len(), 2);

        store.delete(b"blocks/a").await.unwrap();
        assert!(!store.has(b"blocks/a").await.unwrap());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn sled_batch_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvDataStore::open(dir.path().to_path_buf()).unwrap();

        let entries = (0..10)
            .map(|i| (format!("k/{i}").into_bytes(), vec![i as u8]))
            .collect();
        store.batch_put(entries).await.unwrap();

        let found: Vec<_> = store
            .scan(b"k/")
            .await
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(found.len(), 10);
    }
}
