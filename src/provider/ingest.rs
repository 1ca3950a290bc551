//! Best-effort ingestion of an external advertisement chain into the
//! provider index. A notification names an advertisement fingerprint and the
//! peer that published it; everything else is loaded through the node-store
//! capability and decoded with typed accessors over [`Ipld`].

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use hash_hasher::HashedSet;
use libipld::codec::Codec;
use libipld::multihash::Multihash;
use libipld::{Cid, Ipld, IpldCodec};
use libp2p::identity::PeerId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ProviderIndex;
use crate::error::{Error, Result};
use crate::repo::BlockStore;

/// Capability for loading decoded nodes by fingerprint. Supplied by the
/// codec layer; the local block store satisfies it for locally replicated
/// advertisement chains.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn load(&self, cid: &Cid) -> Result<Ipld>;
}

#[async_trait]
impl NodeStore for BlockStore {
    async fn load(&self, cid: &Cid) -> Result<Ipld> {
        let block = self
            .get(cid)
            .await?
            .ok_or(Error::ContentNotFound(*cid))?;
        let codec =
            IpldCodec::try_from(cid.codec()).map_err(|_| Error::UnsupportedCodec(cid.codec()))?;
        Ok(codec.decode(block.data())?)
    }
}

fn field<'a>(node: &'a Ipld, name: &str) -> Option<&'a Ipld> {
    match node {
        Ipld::Map(map) => map.get(name),
        _ => None,
    }
}

fn str_field<'a>(node: &'a Ipld, name: &str) -> Option<&'a str> {
    match field(node, name) {
        Some(Ipld::String(s)) => Some(s),
        _ => None,
    }
}

fn bytes_field<'a>(node: &'a Ipld, name: &str) -> Option<&'a [u8]> {
    match field(node, name) {
        Some(Ipld::Bytes(b)) => Some(b),
        _ => None,
    }
}

fn bool_field(node: &Ipld, name: &str) -> Option<bool> {
    match field(node, name) {
        Some(Ipld::Bool(b)) => Some(*b),
        _ => None,
    }
}

fn link_field(node: &Ipld, name: &str) -> Option<Cid> {
    match field(node, name) {
        Some(Ipld::Link(cid)) => Some(*cid),
        _ => None,
    }
}

fn list_field<'a>(node: &'a Ipld, name: &str) -> Option<&'a [Ipld]> {
    match field(node, name) {
        Some(Ipld::List(items)) => Some(items),
        _ => None,
    }
}

/// A decoded advertisement: a provider's claim (or retraction) over the
/// fingerprints listed in its entry chain.
#[derive(Clone, Debug)]
pub struct Advertisement {
    pub provider: PeerId,
    pub context_id: Vec<u8>,
    pub metadata: Vec<u8>,
    pub entries: Option<Cid>,
    pub is_removal: bool,
    pub previous: Option<Cid>,
}

impl Advertisement {
    pub fn from_ipld(node: &Ipld) -> Result<Self> {
        let provider = str_field(node, "Provider")
            .ok_or_else(|| Error::ProtocolViolation("advertisement missing Provider".into()))?;
        let provider = PeerId::from_str(provider).map_err(|e| {
            Error::ProtocolViolation(format!("advertisement Provider is not a peer id: {e}"))
        })?;
        let context_id = bytes_field(node, "ContextID")
            .ok_or_else(|| Error::ProtocolViolation("advertisement missing ContextID".into()))?
            .to_vec();
        let metadata = bytes_field(node, "Metadata").unwrap_or_default().to_vec();
        let is_removal = bool_field(node, "IsRm").unwrap_or(false);

        Ok(Advertisement {
            provider,
            context_id,
            metadata,
            entries: link_field(node, "Entries"),
            is_removal,
            previous: link_field(node, "PreviousID"),
        })
    }
}

/// Consumes `(advertisement fingerprint, publisher)` notifications and
/// applies each advertisement to the index. Failures are logged and skipped;
/// the subscription itself never dies on bad input.
pub struct Ingestor<S = BlockStore> {
    index: ProviderIndex,
    nodes: Arc<S>,
}

impl<S: NodeStore + 'static> Ingestor<S> {
    pub fn new(index: ProviderIndex, nodes: Arc<S>) -> Self {
        Ingestor { index, nodes }
    }

    pub fn spawn(
        self,
        mut notifications: BoxStream<'static, (Cid, PeerId)>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = notifications.next() => {
                        let (ad_cid, publisher) = match next {
                            Some(n) => n,
                            None => break,
                        };
                        if let Err(e) = self.process(ad_cid, publisher).await {
                            warn!("skipping advertisement {ad_cid} from {publisher}: {e}");
                        }
                    }
                }
            }
            debug!("advertisement ingestion stopped");
        })
    }

    pub async fn process(&self, ad_cid: Cid, publisher: PeerId) -> Result<()> {
        let node = self.nodes.load(&ad_cid).await?;
        let ad = Advertisement::from_ipld(&node)?;

        if ad.is_removal {
            trace!("removal advertisement {ad_cid} via {publisher}");
            return self.index.remove(&ad.provider, &ad.context_id).await;
        }

        let head = match ad.entries {
            Some(head) => head,
            None => return Ok(()),
        };
        let fingerprints = self.collect_entries(head).await?;
        trace!(
            "advertisement {ad_cid} via {publisher}: {} entries",
            fingerprints.len()
        );
        self.index
            .put(ad.provider, &ad.context_id, &ad.metadata, &fingerprints)
            .await
    }

    /// Walks the entry chunk chain, accumulating every listed multihash as a
    /// fingerprint. The visited set guards against malformed cycles.
    async fn collect_entries(&self, head: Cid) -> Result<Vec<Cid>> {
        let mut fingerprints = Vec::new();
        let mut visited = HashedSet::default();
        let mut next = Some(head);

        while let Some(chunk_cid) = next {
            if !visited.insert(chunk_cid) {
                return Err(Error::ProtocolViolation(
                    "advertisement entry chain loops".into(),
                ));
            }

            let chunk = self.nodes.load(&chunk_cid).await?;
            let entries = list_field(&chunk, "Entries").ok_or_else(|| {
                Error::ProtocolViolation("entry chunk missing Entries list".into())
            })?;

            for item in entries {
                let bytes = match item {
                    Ipld::Bytes(bytes) => bytes,
                    other => {
                        return Err(Error::ProtocolViolation(format!(
                            "entry chunk holds non-bytes entry: {other:?}"
                        )))
                    }
                };
                let mh = Multihash::from_bytes(bytes).map_err(|e| {
                    Error::ProtocolViolation(format!("entry is not a multihash: {e}"))
                })?;
                fingerprints.push(Cid::new_v1(crate::block::RAW_CODEC, mh));
            }

            next = link_field(&chunk, "Next");
        }

        Ok(fingerprints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TransportKind;
    use crate::repo::{MemDataStore, Repo, RepoConfig};
    use futures::stream;
    use libipld::cbor::DagCborCodec;
    use libipld::ipld;
    use libp2p::identity::Keypair;

    const DAG_CBOR: u64 = 0x71;

    struct Fixture {
        repo: Repo,
        index: ProviderIndex,
        provider: PeerId,
    }

    fn fixture() -> Fixture {
        Fixture {
            repo: Repo::memory(RepoConfig::default()),
            index: ProviderIndex::new(Arc::new(MemDataStore::new())),
            provider: Keypair::generate_ed25519().public().to_peer_id(),
        }
    }

    async fn put_node(repo: &Repo, node: &Ipld) -> Cid {
        let bytes = DagCborCodec.encode(node).unwrap();
        repo.block_store().put(bytes, Some(DAG_CBOR)).await.unwrap()
    }

    async fn publish(fx: &Fixture, content: &[Cid], is_removal: bool) -> Cid {
        let entries: Vec<Ipld> = content
            .iter()
            .map(|c| Ipld::Bytes(c.hash().to_bytes()))
            .collect();
        let chunk = put_node(&fx.repo, &ipld!({ "Entries": entries })).await;

        put_node(
            &fx.repo,
            &ipld!({
                "Provider": fx.provider.to_string(),
                "ContextID": Ipld::Bytes(b"ctx-1".to_vec()),
                "Metadata": Ipld::Bytes(Vec::new()),
                "Entries": chunk,
                "IsRm": is_removal,
            }),
        )
        .await
    }

    fn content_fp(data: &[u8]) -> Cid {
        crate::block::fingerprint(
            crate::block::RAW_CODEC,
            libipld::multihash::Code::Sha2_256,
            data,
        )
    }

    #[tokio::test]
    async fn advertisement_populates_index() {
        let fx = fixture();
        let c = content_fp(b"advertised content");
        let ad_cid = publish(&fx, &[c], false).await;

        let ingestor = Ingestor::new(fx.index.clone(), Arc::new(fx.repo.block_store().clone()));
        let handle = ingestor.spawn(
            stream::iter(vec![(ad_cid, fx.provider)]).boxed(),
            CancellationToken::new(),
        );
        handle.await.unwrap();

        let (entries, hit) = fx.index.get(&c).await.unwrap();
        assert!(hit);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].provider, fx.provider);
        assert_eq!(entries[0].context, b"ctx-1");
        assert_eq!(entries[0].transport_kind(), TransportKind::Bitswap);
    }

    #[tokio::test]
    async fn removal_advertisement_clears_context() {
        let fx = fixture();
        let c = content_fp(b"advertised content");

        let ingestor = Ingestor::new(fx.index.clone(), Arc::new(fx.repo.block_store().clone()));
        let add = publish(&fx, &[c], false).await;
        let rm = publish(&fx, &[], true).await;

        ingestor.process(add, fx.provider).await.unwrap();
        assert!(fx.index.get(&c).await.unwrap().1);

        ingestor.process(rm, fx.provider).await.unwrap();
        assert!(!fx.index.get(&c).await.unwrap().1);
    }

    #[tokio::test]
    async fn chained_entry_chunks_accumulate() {
        let fx = fixture();
        let c1 = content_fp(b"one");
        let c2 = content_fp(b"two");

        let tail = put_node(
            &fx.repo,
            &ipld!({ "Entries": vec![Ipld::Bytes(c2.hash().to_bytes())] }),
        )
        .await;
        let head = put_node(
            &fx.repo,
            &ipld!({
                "Entries": vec![Ipld::Bytes(c1.hash().to_bytes())],
                "Next": tail,
            }),
        )
        .await;
        let ad = put_node(
            &fx.repo,
            &ipld!({
                "Provider": fx.provider.to_string(),
                "ContextID": Ipld::Bytes(b"ctx".to_vec()),
                "Metadata": Ipld::Bytes(Vec::new()),
                "Entries": head,
                "IsRm": false,
            }),
        )
        .await;

        let ingestor = Ingestor::new(fx.index.clone(), Arc::new(fx.repo.block_store().clone()));
        ingestor.process(ad, fx.provider).await.unwrap();

        assert!(fx.index.get(&c1).await.unwrap().1);
        assert!(fx.index.get(&c2).await.unwrap().1);
    }

    #[tokio::test]
    async fn bad_advertisements_do_not_kill_the_loop() {
        let fx = fixture();
        let c = content_fp(b"good content");
        let good = publish(&fx, &[c], false).await;
        // never stored, load will fail
        let missing = content_fp(b"missing advertisement");

        let ingestor = Ingestor::new(fx.index.clone(), Arc::new(fx.repo.block_store().clone()));
        let handle = ingestor.spawn(
            stream::iter(vec![(missing, fx.provider), (good, fx.provider)]).boxed(),
            CancellationToken::new(),
        );
        handle.await.unwrap();

        assert!(fx.index.get(&c).await.unwrap().1);
    }
}
