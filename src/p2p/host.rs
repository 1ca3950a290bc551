//! Public surface of the transfer layer. A swarm task owns the libp2p swarm
//! and is driven through a command channel; a dispatcher task drains inbound
//! payloads off a bounded channel into the fingerprint-keyed waiter table.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use libipld::multihash::Code;
use libipld::Cid;
use libp2p::core::transport::ListenerId;
use libp2p::identity::{Keypair, PeerId};
use libp2p::swarm::{SwarmBuilder, SwarmEvent};
use libp2p::Multiaddr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::protocol::TransferProtocol;
use super::transfer::{TransferEvent, TransferStats, TransferStatsSnapshot};
use super::{Behaviour, BehaviourEvent, MultiaddrExt, TransferOptions};
use crate::block::{fingerprint, RAW_CODEC};
use crate::error::{Error, Result};

/// Capacity of the inbound payload channel between the swarm task and the
/// dispatcher.
const INBOUND_CHANNEL_CAPACITY: usize = 64;

enum Command {
    Send {
        peer: PeerId,
        payload: Bytes,
        resp: oneshot::Sender<Result<()>>,
    },
    Connect {
        addr: Multiaddr,
        resp: oneshot::Sender<Result<()>>,
    },
    Listeners {
        resp: oneshot::Sender<Vec<Multiaddr>>,
    },
    Peers {
        resp: oneshot::Sender<Vec<PeerId>>,
    },
}

type Waiter = (u64, oneshot::Sender<(PeerId, Bytes)>);

#[derive(Default)]
struct WaiterTable {
    /// Arrivals nobody asked for yet, keyed by fingerprint string.
    buffered: HashMap<String, VecDeque<(PeerId, Bytes)>>,
    /// Callers waiting for a fingerprint to arrive.
    waiters: HashMap<String, VecDeque<Waiter>>,
    next_waiter: u64,
}

struct Shared {
    table: parking_lot::Mutex<WaiterTable>,
    closed: AtomicBool,
}

/// Per-peer payload transfer over authenticated streams.
///
/// `send` frames one payload onto a fresh stream; `receive` resolves when a
/// payload with the requested fingerprint arrives from any peer. Cloning
/// shares the underlying host.
#[derive(Clone)]
pub struct TransferHost {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    stats: Arc<TransferStats>,
    token: CancellationToken,
    timeout: Duration,
    max_payload: usize,
    hasher: Code,
}

impl TransferHost {
    /// Builds the swarm, brings every listener up and spawns the background
    /// tasks. Returns once the host is reachable.
    pub async fn start(keypair: Keypair, options: TransferOptions) -> Result<TransferHost> {
        let peer_id = keypair.public().to_peer_id();

        let protocol = TransferProtocol {
            protocol: libp2p::StreamProtocol::try_from_owned(options.protocol.clone())
                .map_err(|e| Error::ProtocolViolation(format!("invalid protocol id: {e}")))?,
            max_payload: options.max_payload,
            timeout: options.timeout,
        };

        let stats = Arc::new(TransferStats::default());
        let transport = super::build_transport(&keypair)?;
        let behaviour = Behaviour::new(&keypair, &options, protocol, stats.clone());

        let mut swarm = SwarmBuilder::with_tokio_executor(transport, behaviour, peer_id).build();

        info!("transfer host starting with peer id {peer_id}");

        let mut pending: HashSet<ListenerId> = HashSet::new();
        for addr in &options.listen_addrs {
            let id = swarm.listen_on(addr.clone()).map_err(Error::backend)?;
            pending.insert(id);
        }

        // all listeners must be up before callers see the host
        let deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(deadline);
        while !pending.is_empty() {
            tokio::select! {
                _ = &mut deadline => return Err(Error::Timeout),
                event = swarm.select_next_some() => match event {
                    SwarmEvent::NewListenAddr { listener_id, address } => {
                        debug!("listening on {address}");
                        pending.remove(&listener_id);
                    }
                    SwarmEvent::ListenerClosed { reason, .. } => {
                        return Err(Error::Backend(anyhow::anyhow!(
                            "listener closed during startup: {reason:?}"
                        )));
                    }
                    other => trace!("startup swarm event: {other:?}"),
                },
            }
        }

        let shared = Arc::new(Shared {
            table: parking_lot::Mutex::new(WaiterTable::default()),
            closed: AtomicBool::new(false),
        });
        let token = CancellationToken::new();

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        tokio::spawn(swarm_task(swarm, cmd_rx, inbound_tx, token.clone()));
        tokio::spawn(dispatcher_task(
            inbound_rx,
            shared.clone(),
            options.hasher,
            token.clone(),
        ));

        Ok(TransferHost {
            peer_id,
            commands: cmd_tx,
            shared,
            stats,
            token,
            timeout: options.timeout,
            max_payload: options.max_payload,
            hasher: options.hasher,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn stats(&self) -> TransferStatsSnapshot {
        self.stats.snapshot()
    }

    /// Frames `payload` onto a new stream to `peer` and returns its
    /// fingerprint so the caller can correlate a matching `receive` on the
    /// other side.
    pub async fn send(
        &self,
        ctx: &CancellationToken,
        peer: PeerId,
        payload: impl Into<Bytes>,
    ) -> Result<Cid> {
        let payload: Bytes = payload.into();
        if payload.is_empty() {
            return Err(Error::PayloadEmpty);
        }
        if payload.len() > self.max_payload {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload,
            });
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let fp = fingerprint(RAW_CODEC, self.hasher, &payload);

        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                peer,
                payload,
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;

        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(self.timeout, rx) => match res {
                Err(_) => Err(Error::Timeout),
                Ok(Err(_)) => Err(Error::Closed),
                Ok(Ok(outcome)) => outcome.map(|()| fp),
            },
        }
    }

    /// Resolves when a payload fingerprinting to `fp` arrives from any peer.
    /// Returns the already-buffered message if one is waiting; otherwise
    /// registers a waiter until arrival, cancellation or host shutdown.
    pub async fn receive(&self, ctx: &CancellationToken, fp: &Cid) -> Result<(PeerId, Bytes)> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let key = fp.to_string();

        // buffered-path check and waiter registration are atomic under the
        // table lock, so no arrival can slip between them
        let (waiter_id, mut rx) = {
            let mut table = self.shared.table.lock();

            if let Some(queue) = table.buffered.get_mut(&key) {
                if let Some(msg) = queue.pop_front() {
                    if queue.is_empty() {
                        table.buffered.remove(&key);
                    }
                    return Ok(msg);
                }
            }

            let id = table.next_waiter;
            table.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            table.waiters.entry(key.clone()).or_default().push_back((id, tx));
            (id, rx)
        };

        tokio::select! {
            _ = ctx.cancelled() => {
                self.unregister_waiter(&key, waiter_id, &mut rx);
                Err(Error::Cancelled)
            }
            _ = self.token.cancelled() => Err(Error::Closed),
            res = &mut rx => res.map_err(|_| Error::Closed),
        }
    }

    /// Removes a cancelled waiter; an arrival that won the race is put back
    /// into the buffer rather than dropped.
    fn unregister_waiter(
        &self,
        key: &str,
        waiter_id: u64,
        rx: &mut oneshot::Receiver<(PeerId, Bytes)>,
    ) {
        let mut table = self.shared.table.lock();

        if let Some(queue) = table.waiters.get_mut(key) {
            queue.retain(|(id, _)| *id != waiter_id);
            if queue.is_empty() {
                table.waiters.remove(key);
            }
        }

        if let Ok(msg) = rx.try_recv() {
            table
                .buffered
                .entry(key.to_string())
                .or_default()
                .push_back(msg);
        }
    }

    /// Dials `addr`, which must carry a `/p2p/<peer>` suffix.
    pub async fn connect(&self, ctx: &CancellationToken, addr: Multiaddr) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { addr, resp })
            .await
            .map_err(|_| Error::Closed)?;

        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(self.timeout, rx) => match res {
                Err(_) => Err(Error::Timeout),
                Ok(Err(_)) => Err(Error::Closed),
                Ok(Ok(outcome)) => outcome,
            },
        }
    }

    /// Live listening addresses, without the peer suffix.
    pub async fn addresses(&self) -> Result<Vec<Multiaddr>> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Listeners { resp })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Listening addresses with the `/p2p/<peer>` suffix appended.
    pub async fn full_addresses(&self) -> Result<Vec<Multiaddr>> {
        Ok(self
            .addresses()
            .await?
            .into_iter()
            .map(|addr| addr.with_peer_id(self.peer_id))
            .collect())
    }

    /// Currently connected peers.
    pub async fn peers(&self) -> Result<Vec<PeerId>> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::Peers { resp })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Stops accepting streams, fails outstanding waiters with `Closed` and
    /// releases the connections. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let mut table = self.shared.table.lock();
        table.waiters.clear();
        table.buffered.clear();
    }
}

async fn swarm_task(
    mut swarm: libp2p::swarm::Swarm<Behaviour>,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<(PeerId, Bytes)>,
    token: CancellationToken,
) {
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>> = HashMap::new();
    let mut pending_sends: HashMap<PeerId, VecDeque<oneshot::Sender<Result<()>>>> = HashMap::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Send { peer, payload, resp } => {
                        match swarm.behaviour_mut().transfer.send_payload(peer, payload) {
                            Ok(()) => pending_sends.entry(peer).or_default().push_back(resp),
                            Err(e) => {
                                let _ = resp.send(Err(e));
                            }
                        }
                    }
                    Command::Connect { addr, resp } => {
                        let Some(peer) = addr.extract_peer_id() else {
                            let _ = resp.send(Err(Error::ProtocolViolation(
                                "dial address carries no /p2p peer id".into(),
                            )));
                            continue;
                        };
                        if swarm.is_connected(&peer) {
                            let _ = resp.send(Ok(()));
                            continue;
                        }
                        match swarm.dial(addr) {
                            Ok(()) => pending_dials.entry(peer).or_default().push(resp),
                            Err(e) => {
                                let _ = resp.send(Err(Error::StreamOpenFailed(e.to_string())));
                            }
                        }
                    }
                    Command::Listeners { resp } => {
                        let _ = resp.send(swarm.listeners().cloned().collect());
                    }
                    Command::Peers { resp } => {
                        let _ = resp.send(swarm.connected_peers().cloned().collect());
                    }
                }
            }
            event = swarm.select_next_some() => match event {
                SwarmEvent::Behaviour(BehaviourEvent::Transfer(event)) => match event {
                    TransferEvent::Received { peer, payload } => {
                        if inbound.send((peer, payload)).await.is_err() {
                            warn!("inbound dispatcher is gone, dropping payload");
                        }
                    }
                    TransferEvent::Sent { peer } => {
                        if let Some(queue) = pending_sends.get_mut(&peer) {
                            if let Some(resp) = queue.pop_front() {
                                let _ = resp.send(Ok(()));
                            }
                        }
                    }
                },
                SwarmEvent::Behaviour(BehaviourEvent::Keepalive(event)) => void::unreachable(event),
                SwarmEvent::Behaviour(BehaviourEvent::Ping(_)) => {}
                SwarmEvent::Behaviour(BehaviourEvent::Identify(event)) => {
                    trace!("identify: {event:?}");
                }
                SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                    debug!("connected to {peer_id}");
                    for resp in pending_dials.remove(&peer_id).unwrap_or_default() {
                        let _ = resp.send(Ok(()));
                    }
                }
                SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                    if let Some(peer) = peer_id {
                        for resp in pending_dials.remove(&peer).unwrap_or_default() {
                            let _ = resp.send(Err(Error::StreamOpenFailed(error.to_string())));
                        }
                    }
                }
                SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                    if num_established == 0 {
                        // nothing will acknowledge these sends anymore
                        for resp in pending_sends.remove(&peer_id).unwrap_or_default() {
                            let _ = resp.send(Err(Error::WriteFailed(format!(
                                "connection to {peer_id} closed"
                            ))));
                        }
                    }
                }
                other => trace!("swarm event: {other:?}"),
            },
        }
    }

    for resp in pending_dials.into_values().flatten() {
        let _ = resp.send(Err(Error::Closed));
    }
    for resp in pending_sends.into_values().flatten() {
        let _ = resp.send(Err(Error::Closed));
    }
    debug!("swarm task stopped");
}

/// Drains inbound payloads, computes their fingerprint and either hands them
/// to a waiting caller or buffers them for a future `receive`. The table
/// lock is never held across I/O.
async fn dispatcher_task(
    mut inbound: mpsc::Receiver<(PeerId, Bytes)>,
    shared: Arc<Shared>,
    hasher: Code,
    token: CancellationToken,
) {
    loop {
        let (peer, payload) = tokio::select! {
            _ = token.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let key = fingerprint(RAW_CODEC, hasher, &payload).to_string();
        trace!("dispatching {} bytes from {peer} under {key}", payload.len());

        let mut table = shared.table.lock();

        let mut delivered = false;
        if let Some(queue) = table.waiters.get_mut(&key) {
            // a waiter may have been cancelled between registration and
            // delivery; skip dead ones
            while let Some((_, waiter)) = queue.pop_front() {
                match waiter.send((peer, payload.clone())) {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(_) => continue,
                }
            }
            if queue.is_empty() {
                table.waiters.remove(&key);
            }
        }

        if !delivered {
            table.buffered.entry(key).or_default().push_back((peer, payload));
        }
    }

    // fail whoever is still waiting by dropping their senders
    let mut table = shared.table.lock();
    table.waiters.clear();
    debug!("dispatcher task stopped");
}
