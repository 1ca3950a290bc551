//! `NetworkBehaviour` for the transfer protocol. Each payload rides its own
//! one-shot stream; the behaviour tracks connected peers, queues outbound
//! payloads toward their handlers and surfaces inbound payloads to the host
//! task.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use libp2p::core::{Endpoint, Multiaddr};
use libp2p::identity::PeerId;
use libp2p::swarm::behaviour::ConnectionEstablished;
use libp2p::swarm::handler::{OneShotHandler, OneShotHandlerConfig};
use libp2p::swarm::{
    ConnectionClosed, ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, NotifyHandler,
    PollParameters, SubstreamProtocol, THandler, THandlerInEvent, THandlerOutEvent, ToSwarm,
};

use super::protocol::{HandlerEvent, OutboundPayload, TransferProtocol};
use crate::error::{Error, Result};

/// Transfer statistics, updated with relaxed atomics and read as snapshots.
#[derive(Debug, Default)]
pub struct TransferStats {
    pub payloads_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub payloads_received: AtomicU64,
    pub bytes_received: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    pub payloads_sent: u64,
    pub bytes_sent: u64,
    pub payloads_received: u64,
    pub bytes_received: u64,
}

impl TransferStats {
    pub fn update_outgoing(&self, bytes: u64) {
        self.payloads_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn update_incoming(&self, bytes: u64) {
        self.payloads_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            payloads_sent: self.payloads_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Event used to communicate with the host task.
#[derive(Clone, Debug)]
pub enum TransferEvent {
    Received { peer: PeerId, payload: Bytes },
    Sent { peer: PeerId },
}

pub struct Behaviour {
    events: VecDeque<ToSwarm<TransferEvent, OutboundPayload>>,
    connected: HashSet<PeerId>,
    protocol: TransferProtocol,
    stats: Arc<TransferStats>,
}

impl Behaviour {
    pub fn new(protocol: TransferProtocol, stats: Arc<TransferStats>) -> Self {
        Behaviour {
            events: VecDeque::new(),
            connected: HashSet::new(),
            protocol,
            stats,
        }
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.contains(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.connected.iter()
    }

    /// Queues `payload` onto a fresh outbound stream to `peer`. The peer
    /// must already be connected; dialing is the host's business.
    pub fn send_payload(&mut self, peer: PeerId, payload: Bytes) -> Result<()> {
        if !self.connected.contains(&peer) {
            return Err(Error::PeerUnknown(peer));
        }

        self.stats.update_outgoing(payload.len() as u64);
        self.events.push_back(ToSwarm::NotifyHandler {
            peer_id: peer,
            handler: NotifyHandler::Any,
            event: OutboundPayload {
                protocol: self.protocol.protocol.clone(),
                payload,
                timeout: self.protocol.timeout,
            },
        });
        Ok(())
    }

    fn handler(&self) -> OneShotHandler<TransferProtocol, OutboundPayload, HandlerEvent> {
        OneShotHandler::new(
            SubstreamProtocol::new(self.protocol.clone(), ()),
            OneShotHandlerConfig {
                keep_alive_timeout: Duration::from_secs(10),
                outbound_substream_timeout: self.protocol.timeout,
                max_dial_negotiated: 8,
            },
        )
    }
}

impl NetworkBehaviour for Behaviour {
    type ConnectionHandler = OneShotHandler<TransferProtocol, OutboundPayload, HandlerEvent>;
    type ToSwarm = TransferEvent;

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _peer: PeerId,
        _local_addr: &Multiaddr,
        _remote_addr: &Multiaddr,
    ) -> std::result::Result<THandler<Self>, ConnectionDenied> {
        Ok(self.handler())
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _peer: PeerId,
        _addr: &Multiaddr,
        _role_override: Endpoint,
    ) -> std::result::Result<THandler<Self>, ConnectionDenied> {
        Ok(self.handler())
    }

    fn on_swarm_event(&mut self, event: FromSwarm<Self::ConnectionHandler>) {
        match event {
            FromSwarm::ConnectionEstablished(ConnectionEstablished { peer_id, .. }) => {
                trace!("transfer: connected to {peer_id}");
                self.connected.insert(peer_id);
            }
            FromSwarm::ConnectionClosed(ConnectionClosed {
                peer_id,
                remaining_established,
                ..
            }) => {
                if remaining_established == 0 {
                    trace!("transfer: disconnected from {peer_id}");
                    self.connected.remove(&peer_id);
                }
            }
            _ => {}
        }
    }

    fn on_connection_handler_event(
        &mut self,
        peer: PeerId,
        _connection: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {
            HandlerEvent::Received(inbound) => {
                self.stats.update_incoming(inbound.payload.len() as u64);
                self.events.push_back(ToSwarm::GenerateEvent(TransferEvent::Received {
                    peer,
                    payload: inbound.payload,
                }));
            }
            HandlerEvent::Sent => {
                self.events
                    .push_back(ToSwarm::GenerateEvent(TransferEvent::Sent { peer }));
            }
        }
    }

    fn poll(
        &mut self,
        _ctx: &mut Context<'_>,
        _params: &mut impl PollParameters,
    ) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        if let Some(event) = self.events.pop_front() {
            return Poll::Ready(event);
        }
        Poll::Pending
    }
}
