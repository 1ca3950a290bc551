use std::io::Cursor;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use libipld::codec::References;
use libipld::{Cid, Ipld, IpldCodec};
use tokio::sync::RwLock;

use super::{DataStore, RepoConfig, BLOCKS_PREFIX};
use crate::block::{fingerprint, Block};
use crate::error::{Error, Result};

/// Extracts the fingerprints referenced by an encoded payload. Supplied by
/// the codec layer; the block store only dispatches on the codec tag.
pub trait LinkExtractor: Send + Sync + std::fmt::Debug {
    fn links(&self, codec: u64, payload: &[u8], set: &mut Vec<Cid>) -> Result<()>;
}

/// Link extraction through the libipld codec table (raw, dag-cbor, dag-json,
/// dag-pb). A codec outside that table is a typed error, never a silent
/// empty set.
#[derive(Debug, Default)]
pub struct IpldLinkExtractor;

impl LinkExtractor for IpldLinkExtractor {
    fn links(&self, codec: u64, payload: &[u8], set: &mut Vec<Cid>) -> Result<()> {
        let codec = IpldCodec::try_from(codec).map_err(|_| Error::UnsupportedCodec(codec))?;
        let mut cursor = Cursor::new(payload);
        <Ipld as References<IpldCodec>>::references(codec, &mut cursor, set)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BlockStoreStats {
    pub puts: AtomicU64,
    pub bytes_put: AtomicU64,
    pub duplicate_puts: AtomicU64,
    pub deletes: AtomicU64,
    pub bytes_deleted: AtomicU64,
}

impl BlockStoreStats {
    fn update_put(&self, bytes: u64) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_put.fetch_add(bytes, Ordering::Relaxed);
    }

    fn update_duplicate(&self) {
        self.duplicate_puts.fetch_add(1, Ordering::Relaxed);
    }

    fn update_delete(&self, bytes: u64) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.bytes_deleted.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Content-fingerprint-addressed blob store over the key-value backend.
///
/// Blocks live under `blocks/<fingerprint>`; writes are idempotent and
/// immutable. Writers hold the shared side of the write gate so the garbage
/// collector can exclude them during its sweep; readers never touch the gate.
#[derive(Clone, Debug)]
pub struct BlockStore {
    data: Arc<dyn DataStore>,
    extractor: Arc<dyn LinkExtractor>,
    gate: Arc<RwLock<()>>,
    max_payload: usize,
    hasher: libipld::multihash::Code,
    stats: Arc<BlockStoreStats>,
}

pub(crate) fn block_key(cid: &Cid) -> Vec<u8> {
    format!("{BLOCKS_PREFIX}{cid}").into_bytes()
}

pub(crate) fn cid_from_block_key(key: &[u8]) -> Result<Cid> {
    let rest = key
        .strip_prefix(BLOCKS_PREFIX.as_bytes())
        .ok_or_else(|| Error::Corrupted(format!("not a block key: {:?}", String::from_utf8_lossy(key))))?;
    let s = std::str::from_utf8(rest)
        .map_err(|_| Error::Corrupted("block key is not utf-8".into()))?;
    Cid::from_str(s).map_err(|e| Error::Corrupted(format!("invalid block key: {e}")))
}

impl BlockStore {
    pub(crate) fn new(
        data: Arc<dyn DataStore>,
        extractor: Arc<dyn LinkExtractor>,
        gate: Arc<RwLock<()>>,
        config: &RepoConfig,
    ) -> Self {
        BlockStore {
            data,
            extractor,
            gate,
            max_payload: config.max_payload,
            hasher: config.hasher,
            stats: Arc::new(BlockStoreStats::default()),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn stats(&self) -> &BlockStoreStats {
        &self.stats
    }

    /// Fingerprints `payload` under `codec_hint` (raw when absent) and writes
    /// it if not already present. A repeated put of the same payload is a
    /// no-op that returns the same fingerprint.
    pub async fn put(&self, payload: impl Into<Bytes>, codec_hint: Option<u64>) -> Result<Cid> {
        let payload: Bytes = payload.into();
        if payload.len() > self.max_payload {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload,
            });
        }

        let codec = codec_hint.unwrap_or(crate::block::RAW_CODEC);
        let cid = fingerprint(codec, self.hasher, &payload);
        self.put_block(Block::from_trusted(cid, payload)).await?;
        Ok(cid)
    }

    /// Stores a payload under a caller-claimed fingerprint, verifying the
    /// claim first. This is the only write path for received blocks.
    pub async fn put_with_fingerprint(&self, cid: Cid, payload: impl Into<Bytes>) -> Result<()> {
        let payload: Bytes = payload.into();
        if payload.len() > self.max_payload {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload,
            });
        }
        let block = Block::verified(cid, payload)?;
        self.put_block(block).await
    }

    async fn put_block(&self, block: Block) -> Result<()> {
        let key = block_key(block.cid());
        if self.data.has(&key).await? {
            self.stats.update_duplicate();
            return Ok(());
        }

        let _shared = self.gate.read().await;
        let len = block.len() as u64;
        self.data.put(&key, block.data()).await?;
        self.stats.update_put(len);
        trace!("stored block {}", block.cid());
        Ok(())
    }

    pub async fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        let key = block_key(cid);
        Ok(self
            .data
            .get(&key)
            .await?
            .map(|payload| Block::from_trusted(*cid, payload)))
    }

    pub async fn has(&self, cid: &Cid) -> Result<bool> {
        self.data.has(&block_key(cid)).await
    }

    /// Unconditional removal. Reserved for the garbage collector's sweep,
    /// which already holds the exclusive side of the write gate.
    pub(crate) async fn delete(&self, cid: &Cid, size: u64) -> Result<()> {
        self.data.delete(&block_key(cid)).await?;
        self.stats.update_delete(size);
        Ok(())
    }

    /// Fingerprints referenced by the stored payload, per the codec tag of
    /// `cid`. A missing block yields an empty set.
    pub async fn links_of(&self, cid: &Cid) -> Result<Vec<Cid>> {
        let block = match self.get(cid).await? {
            Some(block) => block,
            None => return Ok(Vec::new()),
        };
        let mut set = Vec::new();
        self.extractor.links(cid.codec(), block.data(), &mut set)?;
        Ok(set)
    }

    pub(crate) fn write_gate(&self) -> &Arc<RwLock<()>> {
        &self.gate
    }
}
