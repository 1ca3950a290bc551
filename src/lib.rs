//! stowage is a content-addressed storage and discovery toolkit: peers
//! publish, locate and retrieve immutable payloads identified by
//! cryptographic fingerprints, and operators snapshot, restore and migrate
//! the underlying key-value state.
//!
//! The pieces compose but stand alone:
//!
//! - [`repo`] — the persistent key-value backends, the block store and the
//!   pin registry with its reachability garbage collector;
//! - [`p2p`] — authenticated per-peer payload transfer with
//!   fingerprint-indexed receives;
//! - [`provider`] — the local provider index, its advertisement ingestor and
//!   the route planner;
//! - [`backup`] — streaming compressed snapshots of a backend;
//! - [`migrate`] — multi-step migrations between two backends with dry-run
//!   and rollback.

#[macro_use]
extern crate tracing;

pub mod backup;
pub mod block;
pub mod error;
pub mod migrate;
pub mod p2p;
pub mod provider;
pub mod repo;

pub use crate::block::{fingerprint, Block, RAW_CODEC};
pub use crate::error::{Error, Result};

pub use crate::repo::{
    BlockStore, DataStore, GcResult, KvDataStore, MemDataStore, Pin, PinKind, PinStore, Repo,
    RepoConfig,
};

pub use crate::p2p::{TransferHost, TransferOptions};

pub use crate::backup::{BackupConfig, BackupEngine, BackupMetadata};
pub use crate::migrate::{MigrationEngine, MigrationPlan, MigrationResult};
pub use crate::provider::{
    Ingestor, Intent, ProviderEntry, ProviderIndex, RetrievalPlan, RoutePlanner, TransportKind,
};

pub use libipld;
pub use libipld::Cid;
pub use libp2p;
pub use libp2p::{identity::Keypair, Multiaddr, PeerId};
pub use tokio_util::sync::CancellationToken;

/// Convenience harness for tests and examples: a fresh in-memory repo wired
/// to a transfer host listening on a loopback port.
pub struct Node {
    pub id: PeerId,
    /// Listening addresses with the `/p2p` suffix, ready to dial.
    pub addrs: Vec<Multiaddr>,
    pub repo: Repo,
    host: TransferHost,
    name: String,
}

impl Node {
    pub async fn new(name: &str) -> Result<Node> {
        let keypair = Keypair::generate_ed25519();
        let host = TransferHost::start(keypair, TransferOptions::default()).await?;
        let addrs = host.full_addresses().await?;

        Ok(Node {
            id: host.local_peer_id(),
            addrs,
            repo: Repo::memory(RepoConfig::default()),
            host,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn connect(&self, addr: Multiaddr) -> Result<()> {
        self.host.connect(&CancellationToken::new(), addr).await
    }
}

impl std::ops::Deref for Node {
    type Target = TransferHost;

    fn deref(&self) -> &Self::Target {
        &self.host
    }
}
