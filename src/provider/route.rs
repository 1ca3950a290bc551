//! Pure route planning over provider index entries: rank claims by
//! transport, stagger the attempts, let the caller race them.

use std::time::Duration;

use libipld::Cid;
use libp2p::identity::PeerId;

use super::{ProviderEntry, ProviderIndex, TransportKind};
use crate::error::Result;

/// Delay between consecutive attempts unless the intent overrides it.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(150);

const PREFERRED_TOP_BONUS: f64 = 0.15;
const PREFERRED_STEP: f64 = 0.05;
const PARTIAL_CAR_BONUS: f64 = 0.1;
const REGION_BONUS: f64 = 0.05;

/// Base score per transport kind, overridable per request.
#[derive(Clone, Copy, Debug)]
pub struct TransportWeights {
    pub local: f64,
    pub http: f64,
    pub graphsync: f64,
    pub bitswap: f64,
    pub unknown: f64,
}

impl Default for TransportWeights {
    fn default() -> Self {
        TransportWeights {
            local: 0.9,
            http: 0.7,
            graphsync: 0.6,
            bitswap: 0.4,
            unknown: 0.1,
        }
    }
}

impl TransportWeights {
    fn weight_of(&self, kind: TransportKind) -> f64 {
        match kind {
            TransportKind::Local => self.local,
            TransportKind::Http => self.http,
            TransportKind::Graphsync => self.graphsync,
            TransportKind::Bitswap => self.bitswap,
            TransportKind::Unknown => self.unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchFormat {
    Car,
    Raw,
    Unixfs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchScope {
    Block,
    Entity,
    All,
}

/// What the caller wants out of the retrieval; every field is optional and
/// unrecognized combinations simply score nothing extra.
#[derive(Clone, Debug, Default)]
pub struct Intent {
    /// When non-empty, entries from other providers are dropped.
    pub providers_allow_list: Vec<PeerId>,
    pub local_only: bool,
    pub bitswap_only: bool,
    pub graphsync_only: bool,
    pub format: Option<FetchFormat>,
    pub scope: Option<FetchScope>,
    /// Decaying bonus: first listed kind +0.15, each later one 0.05 less,
    /// floored at zero.
    pub preferred_transports: Vec<TransportKind>,
    /// Reserved hook; scores only when an entry advertises a region marker.
    pub prefer_region: Option<String>,
    pub weights: Option<TransportWeights>,
    pub stagger: Option<Duration>,
}

/// One ranked retrieval candidate.
#[derive(Clone, Debug)]
pub struct Attempt {
    pub provider: PeerId,
    pub transport: TransportKind,
    pub weight: f64,
    /// Delay from plan start after which this attempt may be launched.
    pub stagger: Duration,
    pub metadata: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct RetrievalPlan {
    pub attempts: Vec<Attempt>,
    pub hit: bool,
}

impl RetrievalPlan {
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

fn transport_filter(intent: &Intent) -> Option<TransportKind> {
    if intent.local_only {
        Some(TransportKind::Local)
    } else if intent.bitswap_only {
        Some(TransportKind::Bitswap)
    } else if intent.graphsync_only {
        Some(TransportKind::Graphsync)
    } else {
        None
    }
}

fn preferred_bonus(intent: &Intent, kind: TransportKind) -> f64 {
    intent
        .preferred_transports
        .iter()
        .position(|k| *k == kind)
        .map(|i| (PREFERRED_TOP_BONUS - PREFERRED_STEP * i as f64).max(0.0))
        .unwrap_or(0.0)
}

fn wants_partial_car(intent: &Intent) -> bool {
    intent.format == Some(FetchFormat::Car) && intent.scope != Some(FetchScope::Block)
}

/// Scores and orders `entries` for `intent`. Deterministic: identical inputs
/// yield an identical plan, and equal weights preserve insertion order.
pub fn plan_attempts(entries: &[ProviderEntry], hit: bool, intent: &Intent) -> RetrievalPlan {
    let weights = intent.weights.unwrap_or_default();
    let only = transport_filter(intent);

    let mut attempts: Vec<Attempt> = entries
        .iter()
        .filter(|entry| {
            intent.providers_allow_list.is_empty()
                || intent.providers_allow_list.contains(&entry.provider)
        })
        .filter_map(|entry| {
            let kind = entry.transport_kind();
            if let Some(required) = only {
                if kind != required {
                    return None;
                }
            }

            let mut weight = weights.weight_of(kind) + preferred_bonus(intent, kind);

            if wants_partial_car(intent) && kind == TransportKind::Http && entry.supports_partial_car()
            {
                weight += PARTIAL_CAR_BONUS;
            }

            if let (Some(wanted), Some(region)) = (&intent.prefer_region, entry.region()) {
                if *wanted == region {
                    weight += REGION_BONUS;
                }
            }

            Some(Attempt {
                provider: entry.provider,
                transport: kind,
                weight,
                stagger: Duration::ZERO,
                metadata: entry.metadata.clone(),
            })
        })
        .collect();

    // stable sort keeps ties in insertion order
    attempts.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let step = intent.stagger.unwrap_or(DEFAULT_STAGGER);
    for (i, attempt) in attempts.iter_mut().enumerate() {
        attempt.stagger = step * i as u32;
    }

    RetrievalPlan { attempts, hit }
}

/// Planner bound to a provider index. Lookup is the only I/O; scoring never
/// contacts peers.
#[derive(Clone, Debug)]
pub struct RoutePlanner {
    index: ProviderIndex,
}

impl RoutePlanner {
    pub fn new(index: ProviderIndex) -> Self {
        RoutePlanner { index }
    }

    pub async fn plan(&self, cid: &Cid, intent: &Intent) -> Result<RetrievalPlan> {
        let (entries, hit) = self.index.get(cid).await?;
        Ok(plan_attempts(&entries, hit, intent))
    }
}
