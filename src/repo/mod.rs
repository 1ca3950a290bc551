//! Persistent key-value layer and the stores built on top of it.
//!
//! The [`DataStore`] trait is the backend contract: an ordered byte-key to
//! byte-value store with prefix scans and batched writes. Everything above it
//! (blocks, pins, provider rows) lives under a reserved key prefix and treats
//! the backend as a pluggable dependency.

pub mod blockstore;
pub mod kv;
pub mod mem;
pub mod pin;

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use libipld::multihash::Code;
use tokio::sync::RwLock;

use crate::error::Result;

pub use blockstore::{BlockStore, BlockStoreStats, IpldLinkExtractor, LinkExtractor};
pub use kv::KvDataStore;
pub use mem::MemDataStore;
pub use pin::{GcResult, Pin, PinKind, PinStats, PinStore};

/// Key prefix for block payloads.
pub const BLOCKS_PREFIX: &str = "blocks/";
/// Key prefix for pin rows.
pub const PINS_PREFIX: &str = "pins/";
/// Key prefix for provider index rows.
pub const PROVIDERS_PREFIX: &str = "providers/";

/// Backend contract for the persistent key-value layer.
///
/// Implementations must be safe under concurrent readers with at most one
/// writer per key at a time; scans observe a snapshot-ish view suitable for
/// iteration but are not required to be transactional.
#[async_trait]
pub trait DataStore: Debug + Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &[u8]) -> Result<()>;

    async fn has(&self, key: &[u8]) -> Result<bool>;

    /// Lazy ordered iteration over every `(key, value)` whose key starts with
    /// `prefix`. An empty prefix scans the whole store.
    async fn scan(&self, prefix: &[u8]) -> BoxStream<'static, Result<(Vec<u8>, Vec<u8>)>>;

    async fn batch_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;

    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Short label for diagnostics and backup metadata.
    fn kind(&self) -> &'static str;
}

/// Tuning knobs shared by the repo stores.
#[derive(Clone, Debug)]
pub struct RepoConfig {
    /// Upper bound on a single block payload.
    pub max_payload: usize,
    /// Multihash function used to fingerprint payloads.
    pub hasher: Code,
    /// When set, a recursive pin walks the subgraph up front and fails with
    /// `ContentNotFound` on a missing child. The garbage collector protects
    /// reachable blocks either way.
    pub verify_recursive_pins: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        RepoConfig {
            max_payload: 1024 * 1024,
            hasher: Code::Sha2_256,
            verify_recursive_pins: false,
        }
    }
}

/// Bundle of the key-value backend and the stores layered over it.
///
/// Cloning is cheap; clones share the backend handle, the block write gate
/// and all statistics.
#[derive(Clone, Debug)]
pub struct Repo {
    data: Arc<dyn DataStore>,
    blocks: BlockStore,
    pins: PinStore,
}

impl Repo {
    /// Repo over an in-memory backend.
    pub fn memory(config: RepoConfig) -> Self {
        Self::custom(Arc::new(MemDataStore::default()), config)
    }

    /// Repo over a sled backend rooted at `path`.
    pub fn sled(path: PathBuf, config: RepoConfig) -> Result<Self> {
        Ok(Self::custom(Arc::new(KvDataStore::open(path)?), config))
    }

    /// Repo over a caller-provided backend.
    pub fn custom(data: Arc<dyn DataStore>, config: RepoConfig) -> Self {
        let gate = Arc::new(RwLock::new(()));
        let blocks = BlockStore::new(data.clone(), Arc::new(IpldLinkExtractor), gate, &config);
        let pins = PinStore::new(data.clone(), blocks.clone(), &config);
        Repo { data, blocks, pins }
    }

    pub fn data_store(&self) -> &Arc<dyn DataStore> {
        &self.data
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn pin_store(&self) -> &PinStore {
        &self.pins
    }

    pub async fn flush(&self) -> Result<()> {
        self.data.flush().await
    }

    pub async fn close(&self) -> Result<()> {
        self.data.close().await
    }
}
