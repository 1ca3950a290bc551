use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use hash_hasher::HashedSet;
use libipld::Cid;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::blockstore::{cid_from_block_key, BlockStore};
use super::{DataStore, RepoConfig, PINS_PREFIX};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinKind {
    Direct,
    Recursive,
    /// Derived at query time from recursive-root reachability; never stored
    /// as a row.
    Indirect,
}

impl std::fmt::Display for PinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PinKind::Direct => "direct",
            PinKind::Recursive => "recursive",
            PinKind::Indirect => "indirect",
        };
        f.write_str(s)
    }
}

/// A persisted pin row joined with its fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pin {
    pub cid: Cid,
    pub kind: PinKind,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PinRow {
    kind: PinKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    created_at: DateTime<Utc>,
}

/// Outcome of a mark-and-sweep run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcResult {
    pub blocks_before: u64,
    pub blocks_after: u64,
    pub deleted: u64,
    pub failed_deletes: u64,
    pub reclaimed_bytes: u64,
    pub pinned_blocks: u64,
    pub duration: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct PinStats {
    pub direct_count: u64,
    pub recursive_count: u64,
    pub indirect_estimate: u64,
    pub last_gc_at: Option<DateTime<Utc>>,
    pub last_gc_duration: Option<Duration>,
    pub last_reclaimed_bytes: Option<u64>,
}

#[derive(Clone, Debug)]
struct GcSummary {
    at: DateTime<Utc>,
    duration: Duration,
    reclaimed_bytes: u64,
}

/// Pin registry plus the reachability garbage collector.
///
/// Rows live under `pins/<fingerprint>`; a fingerprint carries at most one
/// row, and pinning under the other mode replaces it. Mutations and the GC
/// mark phase serialize on one registry lock; readers share it.
#[derive(Clone, Debug)]
pub struct PinStore {
    data: Arc<dyn DataStore>,
    blocks: BlockStore,
    registry: Arc<RwLock<()>>,
    /// Cached reachable-from-recursive-roots set; dropped on any pin
    /// mutation, rebuilt lazily.
    indirect: Arc<parking_lot::Mutex<Option<HashedSet<Cid>>>>,
    last_gc: Arc<parking_lot::Mutex<Option<GcSummary>>>,
    verify_recursive: bool,
}

fn pin_key(cid: &Cid) -> Vec<u8> {
    format!("{PINS_PREFIX}{cid}").into_bytes()
}

fn cid_from_pin_key(key: &[u8]) -> Result<Cid> {
    let rest = key.strip_prefix(PINS_PREFIX.as_bytes()).ok_or_else(|| {
        Error::Corrupted(format!(
            "invalid pin key: {:?}",
            String::from_utf8_lossy(key)
        ))
    })?;
    let s = std::str::from_utf8(rest).map_err(|_| Error::Corrupted("pin key is not utf-8".into()))?;
    Cid::from_str(s).map_err(|e| Error::Corrupted(format!("invalid pin key: {e}")))
}

impl PinStore {
    pub(crate) fn new(data: Arc<dyn DataStore>, blocks: BlockStore, config: &RepoConfig) -> Self {
        PinStore {
            data,
            blocks,
            registry: Arc::new(RwLock::new(())),
            indirect: Arc::new(parking_lot::Mutex::new(None)),
            last_gc: Arc::new(parking_lot::Mutex::new(None)),
            verify_recursive: config.verify_recursive_pins,
        }
    }

    /// Pins `cid` directly or recursively. Fails with `ContentNotFound` when
    /// the block is absent and with `AlreadyPinned` when a row of the same
    /// kind exists; a row of the other kind is replaced.
    pub async fn pin(&self, cid: &Cid, recursive: bool, name: Option<String>) -> Result<()> {
        let kind = if recursive {
            PinKind::Recursive
        } else {
            PinKind::Direct
        };

        let _guard = self.registry.write().await;

        if !self.blocks.has(cid).await? {
            return Err(Error::ContentNotFound(*cid));
        }

        if let Some(row) = self.read_row(cid).await? {
            if row.kind == kind {
                return Err(Error::AlreadyPinned(*cid));
            }
        }

        if recursive && self.verify_recursive {
            self.walk_verify(*cid).await?;
        }

        let row = PinRow {
            kind,
            name,
            created_at: Utc::now(),
        };
        self.data
            .put(&pin_key(cid), &serde_json::to_vec(&row)?)
            .await?;

        *self.indirect.lock() = None;
        debug!("pinned {cid} as {kind}");
        Ok(())
    }

    /// Removes the row of the given kind; `NotPinned` when no such row
    /// exists.
    pub async fn unpin(&self, cid: &Cid, recursive: bool) -> Result<()> {
        let kind = if recursive {
            PinKind::Recursive
        } else {
            PinKind::Direct
        };

        let _guard = self.registry.write().await;

        match self.read_row(cid).await? {
            Some(row) if row.kind == kind => {
                self.data.delete(&pin_key(cid)).await?;
                *self.indirect.lock() = None;
                Ok(())
            }
            _ => Err(Error::NotPinned(*cid)),
        }
    }

    /// Resolves the pin state of `cid`: its persisted row if one exists,
    /// `Indirect` if any recursive root reaches it, `None` otherwise.
    pub async fn is_pinned(&self, cid: &Cid) -> Result<Option<PinKind>> {
        let _guard = self.registry.read().await;

        if let Some(row) = self.read_row(cid).await? {
            return Ok(Some(row.kind));
        }

        let reachable = self.reachable_set().await?;
        if reachable.contains(cid) {
            return Ok(Some(PinKind::Indirect));
        }
        Ok(None)
    }

    /// Stream of all persisted pin rows (direct and recursive only).
    pub async fn list(&self) -> BoxStream<'static, Result<Pin>> {
        let _guard = self.registry.read().await;
        self.data
            .scan(PINS_PREFIX.as_bytes())
            .await
            .map(|res| {
                let (key, value) = res?;
                let cid = cid_from_pin_key(&key)?;
                let row: PinRow = serde_json::from_slice(&value)?;
                Ok(Pin {
                    cid,
                    kind: row.kind,
                    name: row.name,
                    created_at: row.created_at,
                })
            })
            .boxed()
    }

    pub async fn stats(&self) -> Result<PinStats> {
        let mut stats = PinStats::default();
        {
            let _guard = self.registry.read().await;
            let mut rows = self.data.scan(PINS_PREFIX.as_bytes()).await;
            while let Some(res) = rows.next().await {
                let (_, value) = res?;
                let row: PinRow = serde_json::from_slice(&value)?;
                match row.kind {
                    PinKind::Direct => stats.direct_count += 1,
                    PinKind::Recursive => stats.recursive_count += 1,
                    PinKind::Indirect => {}
                }
            }
        }

        stats.indirect_estimate = self
            .indirect
            .lock()
            .as_ref()
            .map(|set| set.len() as u64)
            .unwrap_or(0);

        if let Some(summary) = self.last_gc.lock().clone() {
            stats.last_gc_at = Some(summary.at);
            stats.last_gc_duration = Some(summary.duration);
            stats.last_reclaimed_bytes = Some(summary.reclaimed_bytes);
        }
        Ok(stats)
    }

    /// Mark-and-sweep collection. Marks every pinned fingerprint and the
    /// subgraphs of recursive roots, then deletes everything else under
    /// `blocks/` while excluding writers. Per-key delete failures are
    /// counted and skipped; the sweep never aborts half way.
    pub async fn run_gc(&self) -> Result<GcResult> {
        let started = Instant::now();

        let (blocks_before, _total_bytes) = self.census().await?;

        // mark under a shared registry guard for a consistent row snapshot
        let live = {
            let _guard = self.registry.read().await;
            let mut live = HashedSet::default();
            let mut roots = Vec::new();

            let mut rows = self.data.scan(PINS_PREFIX.as_bytes()).await;
            while let Some(res) = rows.next().await {
                let (key, value) = res?;
                let cid = cid_from_pin_key(&key)?;
                let row: PinRow = serde_json::from_slice(&value)?;
                live.insert(cid);
                if row.kind == PinKind::Recursive {
                    roots.push(cid);
                }
            }

            for root in roots {
                self.walk(root, &mut live).await?;
            }
            live
        };

        *self.indirect.lock() = Some(live.clone());

        // sweep with writers excluded; readers proceed untouched
        let _exclusive = self.blocks.write_gate().write().await;

        let mut deleted = 0u64;
        let mut failed = 0u64;
        let mut reclaimed = 0u64;

        let mut entries = self.data.scan(super::BLOCKS_PREFIX.as_bytes()).await;
        while let Some(res) = entries.next().await {
            let (key, value) = res?;
            let cid = cid_from_block_key(&key)?;
            if live.contains(&cid) {
                continue;
            }
            match self.blocks.delete(&cid, value.len() as u64).await {
                Ok(()) => {
                    deleted += 1;
                    reclaimed += value.len() as u64;
                }
                Err(e) => {
                    warn!("gc failed to delete {cid}: {e}");
                    failed += 1;
                }
            }
        }
        drop(_exclusive);

        let duration = started.elapsed();
        let result = GcResult {
            blocks_before,
            blocks_after: blocks_before.saturating_sub(deleted),
            deleted,
            failed_deletes: failed,
            reclaimed_bytes: reclaimed,
            pinned_blocks: live.len() as u64,
            duration,
        };

        *self.last_gc.lock() = Some(GcSummary {
            at: Utc::now(),
            duration,
            reclaimed_bytes: reclaimed,
        });

        debug!(
            "gc: {} of {} blocks swept, {} bytes reclaimed",
            deleted, blocks_before, reclaimed
        );
        Ok(result)
    }

    async fn read_row(&self, cid: &Cid) -> Result<Option<PinRow>> {
        match self.data.get(&pin_key(cid)).await? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn census(&self) -> Result<(u64, u64)> {
        let mut count = 0u64;
        let mut bytes = 0u64;
        let mut entries = self.data.scan(super::BLOCKS_PREFIX.as_bytes()).await;
        while let Some(res) = entries.next().await {
            let (_, value) = res?;
            count += 1;
            bytes += value.len() as u64;
        }
        Ok((count, bytes))
    }

    /// Depth-first traversal from `root`, ignoring missing children. The
    /// visited set doubles as cycle protection.
    async fn walk(&self, root: Cid, visited: &mut HashedSet<Cid>) -> Result<()> {
        let mut stack = vec![root];
        while let Some(cid) = stack.pop() {
            for link in self.blocks.links_of(&cid).await? {
                if visited.insert(link) {
                    stack.push(link);
                }
            }
        }
        Ok(())
    }

    /// Like [`walk`] but a missing child is an error; used when recursive
    /// pins are configured to verify their subgraph up front.
    ///
    /// [`walk`]: PinStore::walk
    async fn walk_verify(&self, root: Cid) -> Result<()> {
        let mut visited = HashedSet::default();
        visited.insert(root);
        let mut stack = vec![root];
        while let Some(cid) = stack.pop() {
            for link in self.blocks.links_of(&cid).await? {
                if !self.blocks.has(&link).await? {
                    return Err(Error::ContentNotFound(link));
                }
                if visited.insert(link) {
                    stack.push(link);
                }
            }
        }
        Ok(())
    }

    /// Set of fingerprints reachable from any recursive root, cached until
    /// the next pin mutation. Callers must hold the registry guard.
    async fn reachable_set(&self) -> Result<HashedSet<Cid>> {
        if let Some(set) = self.indirect.lock().as_ref() {
            return Ok(set.clone());
        }

        let mut set = HashedSet::default();
        let mut rows = self.data.scan(PINS_PREFIX.as_bytes()).await;
        let mut roots = Vec::new();
        while let Some(res) = rows.next().await {
            let (key, value) = res?;
            let row: PinRow = serde_json::from_slice(&value)?;
            if row.kind == PinKind::Recursive {
                roots.push(cid_from_pin_key(&key)?);
            }
        }
        for root in roots {
            set.insert(root);
            self.walk(root, &mut set).await?;
        }

        *self.indirect.lock() = Some(set.clone());
        Ok(set)
    }
}
