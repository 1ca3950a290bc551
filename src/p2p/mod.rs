//! Peer-to-peer plumbing: the libp2p transport recipe, the composed swarm
//! behaviour and the transfer host built on top of them.

pub mod host;
pub mod protocol;
pub mod transfer;

use std::time::Duration;

use libipld::multihash::Code;
use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::Boxed;
use libp2p::core::upgrade::Version;
use libp2p::identity::{Keypair, PeerId};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::keep_alive;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, ping, Multiaddr, Transport};

use crate::error::{Error as CrateError, Result as CrateResult};

pub use host::TransferHost;
pub use protocol::{DEFAULT_MAX_PAYLOAD, DEFAULT_PROTOCOL, DEFAULT_TIMEOUT};
pub use transfer::{TransferEvent, TransferStats, TransferStatsSnapshot};

/// Construction inputs for a [`TransferHost`].
#[derive(Clone, Debug)]
pub struct TransferOptions {
    pub listen_addrs: Vec<Multiaddr>,
    /// Negotiated protocol identifier for the transfer streams.
    pub protocol: String,
    pub max_payload: usize,
    /// Per-operation stream read/write deadline.
    pub timeout: Duration,
    pub keep_alive: bool,
    /// Multihash function used to fingerprint payloads.
    pub hasher: Code,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0"
                .parse()
                .expect("static multiaddr parses")],
            protocol: DEFAULT_PROTOCOL.to_string(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            timeout: DEFAULT_TIMEOUT,
            keep_alive: true,
            hasher: Code::Sha2_256,
        }
    }
}

pub trait MultiaddrExt {
    fn extract_peer_id(&self) -> Option<PeerId>;
    fn with_peer_id(self, peer: PeerId) -> Multiaddr;
}

impl MultiaddrExt for Multiaddr {
    fn extract_peer_id(&self) -> Option<PeerId> {
        self.iter().last().and_then(|proto| match proto {
            Protocol::P2p(peer) => Some(peer),
            _ => None,
        })
    }

    fn with_peer_id(mut self, peer: PeerId) -> Multiaddr {
        if self.extract_peer_id().is_none() {
            self.push(Protocol::P2p(peer));
        }
        self
    }
}

/// TCP with noise authentication and yamux multiplexing, the whole thing
/// driven by the tokio executor.
pub(crate) fn build_transport(keypair: &Keypair) -> CrateResult<Boxed<(PeerId, StreamMuxerBox)>> {
    let noise = libp2p::noise::Config::new(keypair).map_err(CrateError::backend)?;

    let transport = libp2p::tcp::tokio::Transport::new(libp2p::tcp::Config::default().nodelay(true))
        .upgrade(Version::V1)
        .authenticate(noise)
        .multiplex(libp2p::yamux::Config::default())
        .timeout(Duration::from_secs(30))
        .boxed();

    Ok(transport)
}

/// Behaviour type.
#[derive(NetworkBehaviour)]
pub(crate) struct Behaviour {
    pub keepalive: Toggle<keep_alive::Behaviour>,
    pub ping: ping::Behaviour,
    pub identify: identify::Behaviour,
    pub transfer: transfer::Behaviour,
}

impl Behaviour {
    pub fn new(
        keypair: &Keypair,
        options: &TransferOptions,
        protocol: protocol::TransferProtocol,
        stats: std::sync::Arc<TransferStats>,
    ) -> Self {
        let keepalive = Toggle::from(options.keep_alive.then(keep_alive::Behaviour::default));

        let identify = identify::Behaviour::new(
            identify::Config::new("/stowage/id/1.0.0".into(), keypair.public())
                .with_agent_version(format!("stowage/{}", env!("CARGO_PKG_VERSION"))),
        );

        Behaviour {
            keepalive,
            ping: ping::Behaviour::default(),
            identify,
            transfer: transfer::Behaviour::new(protocol, stats),
        }
    }
}
