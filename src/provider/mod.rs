//! Local provider index: which peers claim to hold which fingerprints, and
//! over which transport. Fed by the advertisement ingestor, queried by the
//! route planner.

pub mod ingest;
pub mod route;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use libipld::Cid;
use libp2p::identity::PeerId;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::repo::{DataStore, PROVIDERS_PREFIX};

pub use ingest::{Advertisement, Ingestor, NodeStore};
pub use route::{Attempt, FetchFormat, FetchScope, Intent, RetrievalPlan, RoutePlanner, TransportWeights};

/// Multicodec for bitswap transport metadata.
pub const TRANSPORT_BITSWAP: u64 = 0x0900;
/// Multicodec for graphsync (filecoin v1) transport metadata.
pub const TRANSPORT_GRAPHSYNC: u64 = 0x0910;
/// Multicodec for trustless HTTP gateway transport metadata.
pub const TRANSPORT_HTTP: u64 = 0x0920;
/// Private-use multicodec marking content available from the local store.
pub const TRANSPORT_LOCAL: u64 = 0x30_00_00;

/// Entries older than this are treated as expired unless the advertisement
/// carried its own ttl.
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Bitswap,
    Http,
    Graphsync,
    Local,
    Unknown,
}

impl TransportKind {
    /// Derives the kind from the leading varint multicodec of a metadata
    /// blob. An empty blob means bitswap; an unrecognized code is `Unknown`.
    pub fn from_metadata(blob: &[u8]) -> TransportKind {
        if blob.is_empty() {
            return TransportKind::Bitswap;
        }
        match unsigned_varint::decode::u64(blob) {
            Ok((TRANSPORT_BITSWAP, _)) => TransportKind::Bitswap,
            Ok((TRANSPORT_HTTP, _)) => TransportKind::Http,
            Ok((TRANSPORT_GRAPHSYNC, _)) => TransportKind::Graphsync,
            Ok((TRANSPORT_LOCAL, _)) => TransportKind::Local,
            _ => TransportKind::Unknown,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Bitswap => "bitswap",
            TransportKind::Http => "http",
            TransportKind::Graphsync => "graphsync",
            TransportKind::Local => "local",
            TransportKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Prefixes `extra` with the varint multicodec for `code`.
pub fn encode_transport_metadata(code: u64, extra: &[u8]) -> Vec<u8> {
    let mut buf = unsigned_varint::encode::u64_buffer();
    let head = unsigned_varint::encode::u64(code, &mut buf);
    let mut out = Vec::with_capacity(head.len() + extra.len());
    out.extend_from_slice(head);
    out.extend_from_slice(extra);
    out
}

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// One `(provider, context, transport)` claim for a fingerprint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub provider: PeerId,
    #[serde(with = "b64")]
    pub context: Vec<u8>,
    #[serde(with = "b64")]
    pub metadata: Vec<u8>,
    pub observed_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl ProviderEntry {
    pub fn transport_kind(&self) -> TransportKind {
        TransportKind::from_metadata(&self.metadata)
    }

    /// Transport-specific bytes following the multicodec prefix.
    pub fn metadata_suffix(&self) -> &[u8] {
        if self.metadata.is_empty() {
            return &[];
        }
        match unsigned_varint::decode::u64(&self.metadata) {
            Ok((_, rest)) => rest,
            Err(_) => &[],
        }
    }

    fn suffix_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(self.metadata_suffix()).ok()
    }

    /// Whether an http entry advertises partial-CAR responses; the suffix
    /// convention is a JSON document with `"partial_car": true`.
    pub fn supports_partial_car(&self) -> bool {
        self.suffix_json()
            .and_then(|v| v.get("partial_car").and_then(|b| b.as_bool()))
            .unwrap_or(false)
    }

    /// Region marker from the metadata suffix, when one is advertised.
    pub fn region(&self) -> Option<String> {
        self.suffix_json()
            .and_then(|v| v.get("region").and_then(|r| r.as_str().map(String::from)))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.observed_at);
        age.num_seconds() >= 0 && age.num_seconds() as u64 > self.ttl_secs
    }
}

fn context_segment(context: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(context)
}

fn entry_key(cid: &Cid, provider: &PeerId, context: &[u8]) -> Vec<u8> {
    format!(
        "{PROVIDERS_PREFIX}{cid}/{provider}/{}",
        context_segment(context)
    )
    .into_bytes()
}

/// Splits a row key into its `(fingerprint, provider, context)` segments.
fn parse_entry_key(key: &[u8]) -> Result<(String, String, String)> {
    let s = std::str::from_utf8(key)
        .map_err(|_| Error::Corrupted("provider key is not utf-8".into()))?;
    let rest = s
        .strip_prefix(PROVIDERS_PREFIX)
        .ok_or_else(|| Error::Corrupted(format!("not a provider key: {s}")))?;
    let mut parts = rest.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(fp), Some(provider), Some(ctx)) => {
            Ok((fp.to_string(), provider.to_string(), ctx.to_string()))
        }
        _ => Err(Error::Corrupted(format!("malformed provider key: {s}"))),
    }
}

/// Fingerprint to provider-claim index, rows stored in the key-value backend
/// under `providers/<fingerprint>/<provider>/<context>`.
#[derive(Clone, Debug)]
pub struct ProviderIndex {
    data: Arc<dyn DataStore>,
    ttl: Duration,
}

impl ProviderIndex {
    pub fn new(data: Arc<dyn DataStore>) -> Self {
        Self::with_ttl(data, DEFAULT_PROVIDER_TTL)
    }

    pub fn with_ttl(data: Arc<dyn DataStore>, ttl: Duration) -> Self {
        ProviderIndex { data, ttl }
    }

    /// Upserts one row per fingerprint for `(provider, context)`.
    pub async fn put(
        &self,
        provider: PeerId,
        context: &[u8],
        metadata: &[u8],
        fingerprints: &[Cid],
    ) -> Result<()> {
        let observed_at = Utc::now();
        let entry = ProviderEntry {
            provider,
            context: context.to_vec(),
            metadata: metadata.to_vec(),
            observed_at,
            ttl_secs: self.ttl.as_secs(),
        };
        let value = serde_json::to_vec(&entry)?;

        let entries = fingerprints
            .iter()
            .map(|cid| (entry_key(cid, &provider, context), value.clone()))
            .collect();
        self.data.batch_put(entries).await?;
        debug!(
            "indexed {} fingerprints for provider {provider}",
            fingerprints.len()
        );
        Ok(())
    }

    /// Bitswap claim; metadata is the bare transport multicodec.
    pub async fn put_bitswap(
        &self,
        provider: PeerId,
        context: &[u8],
        fingerprints: &[Cid],
    ) -> Result<()> {
        let metadata = encode_transport_metadata(TRANSPORT_BITSWAP, &[]);
        self.put(provider, context, &metadata, fingerprints).await
    }

    /// HTTP gateway claim; `extra` carries codec-specific bytes opaque to
    /// the index.
    pub async fn put_http(
        &self,
        provider: PeerId,
        context: &[u8],
        extra: &[u8],
        fingerprints: &[Cid],
    ) -> Result<()> {
        let metadata = encode_transport_metadata(TRANSPORT_HTTP, extra);
        self.put(provider, context, &metadata, fingerprints).await
    }

    /// Graphsync claim; `extra` carries codec-specific bytes opaque to the
    /// index.
    pub async fn put_graphsync(
        &self,
        provider: PeerId,
        context: &[u8],
        extra: &[u8],
        fingerprints: &[Cid],
    ) -> Result<()> {
        let metadata = encode_transport_metadata(TRANSPORT_GRAPHSYNC, extra);
        self.put(provider, context, &metadata, fingerprints).await
    }

    /// Non-expired claims for `cid`; `hit` is true iff at least one exists.
    pub async fn get(&self, cid: &Cid) -> Result<(Vec<ProviderEntry>, bool)> {
        use futures::StreamExt;

        let prefix = format!("{PROVIDERS_PREFIX}{cid}/").into_bytes();
        let now = Utc::now();

        let mut entries = Vec::new();
        let mut rows = self.data.scan(&prefix).await;
        while let Some(res) = rows.next().await {
            let (_, value) = res?;
            let entry: ProviderEntry = serde_json::from_slice(&value)?;
            if !entry.is_expired(now) {
                entries.push(entry);
            }
        }

        let hit = !entries.is_empty();
        Ok((entries, hit))
    }

    /// Drops every row belonging to `(provider, context)`.
    pub async fn remove(&self, provider: &PeerId, context: &[u8]) -> Result<()> {
        let provider = provider.to_string();
        let context = context_segment(context);
        self.remove_matching(|_, p, c| p == provider && c == context)
            .await
    }

    /// Drops every row belonging to `provider` across all contexts.
    pub async fn remove_provider(&self, provider: &PeerId) -> Result<()> {
        let provider = provider.to_string();
        self.remove_matching(|_, p, _| p == provider).await
    }

    async fn remove_matching<F>(&self, matches: F) -> Result<()>
    where
        F: Fn(&str, &str, &str) -> bool,
    {
        use futures::StreamExt;

        let mut doomed = Vec::new();
        {
            let mut rows = self.data.scan(PROVIDERS_PREFIX.as_bytes()).await;
            while let Some(res) = rows.next().await {
                let (key, _) = res?;
                let (fp, provider, context) = parse_entry_key(&key)?;
                if matches(&fp, &provider, &context) {
                    doomed.push(key);
                }
            }
        }

        for key in doomed {
            self.data.delete(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{fingerprint, RAW_CODEC};
    use crate::repo::MemDataStore;
    use libipld::multihash::Code;
    use libp2p::identity::Keypair;

    fn fp(data: &[u8]) -> Cid {
        fingerprint(RAW_CODEC, Code::Sha2_256, data)
    }

    fn peer() -> PeerId {
        Keypair::generate_ed25519().public().to_peer_id()
    }

    fn index() -> ProviderIndex {
        ProviderIndex::new(Arc::new(MemDataStore::new()))
    }

    #[test]
    fn transport_kind_decoding() {
        assert_eq!(TransportKind::from_metadata(&[]), TransportKind::Bitswap);
        assert_eq!(
            TransportKind::from_metadata(&encode_transport_metadata(TRANSPORT_BITSWAP, &[])),
            TransportKind::Bitswap
        );
        assert_eq!(
            TransportKind::from_metadata(&encode_transport_metadata(TRANSPORT_HTTP, b"extra")),
            TransportKind::Http
        );
        assert_eq!(
            TransportKind::from_metadata(&encode_transport_metadata(TRANSPORT_GRAPHSYNC, &[])),
            TransportKind::Graphsync
        );
        assert_eq!(
            TransportKind::from_metadata(&encode_transport_metadata(0x1234, &[])),
            TransportKind::Unknown
        );
    }

    #[tokio::test]
    async fn put_get_and_upsert() {
        let index = index();
        let provider = peer();
        let c = fp(b"content");

        index.put_bitswap(provider, b"ctx-1", &[c]).await.unwrap();
        // second put for the same (provider, context) upserts
        index.put_bitswap(provider, b"ctx-1", &[c]).await.unwrap();

        let (entries, hit) = index.get(&c).await.unwrap();
        assert!(hit);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].provider, provider);
        assert_eq!(entries[0].context, b"ctx-1");
        assert_eq!(entries[0].transport_kind(), TransportKind::Bitswap);

        let (none, hit) = index.get(&fp(b"other")).await.unwrap();
        assert!(!hit);
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_filtered() {
        let index = ProviderIndex::with_ttl(
            Arc::new(MemDataStore::new()),
            Duration::from_secs(0),
        );
        let c = fp(b"content");
        index.put_bitswap(peer(), b"ctx", &[c]).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let (entries, hit) = index.get(&c).await.unwrap();
        assert!(!hit, "zero-ttl entries should expire: {entries:?}");
    }

    #[tokio::test]
    async fn remove_by_context_and_provider() {
        let index = index();
        let p1 = peer();
        let p2 = peer();
        let c = fp(b"content");

        index.put_bitswap(p1, b"a", &[c]).await.unwrap();
        index.put_bitswap(p1, b"b", &[c]).await.unwrap();
        index.put_bitswap(p2, b"a", &[c]).await.unwrap();

        index.remove(&p1, b"a").await.unwrap();
        let (entries, _) = index.get(&c).await.unwrap();
        assert_eq!(entries.len(), 2);

        index.remove_provider(&p1).await.unwrap();
        let (entries, _) = index.get(&c).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].provider, p2);
    }

    #[test]
    fn metadata_suffix_conventions() {
        let entry = ProviderEntry {
            provider: peer(),
            context: vec![],
            metadata: encode_transport_metadata(
                TRANSPORT_HTTP,
                br#"{"partial_car": true, "region": "eu-west"}"#,
            ),
            observed_at: Utc::now(),
            ttl_secs: 60,
        };
        assert_eq!(entry.transport_kind(), TransportKind::Http);
        assert!(entry.supports_partial_car());
        assert_eq!(entry.region().as_deref(), Some("eu-west"));
    }
}
