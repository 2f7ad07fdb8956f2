//! Peer records.
//!
//! The peer table owns every record and `bridge` stores an id rather than a
//! reference, so the (cyclic) peer graph tolerates removal without dangling
//! links. Records for direct neighbors additionally carry the link state:
//! the writer-task queue, a cancellation token that force-closes the socket,
//! and the liveness timestamp.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::PeerId;

/// Hop count meaning "unknown / infinite".
pub const DISTANCE_UNKNOWN: u8 = 0xFF;

/// Link state for a direct neighbor.
#[derive(Clone)]
pub(crate) struct Link {
    /// Monotonic link number; close events carry it so a stale close for a
    /// replaced socket can be discarded.
    pub seq: u64,
    /// Whether the local node dialed this socket (duplicate tie-break).
    pub outbound: bool,
    /// Queue drained by the writer task, one frame per `write_all`.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Cancelling this token tears down the reader and writer tasks.
    pub cancel: CancellationToken,
    /// Last time any frame arrived on this socket.
    pub last_seen: Instant,
}

/// One remote peer, direct or reached through a forwarder.
#[derive(Clone)]
pub struct Peer {
    id: PeerId,
    host: IpAddr,
    port: u16,
    distance: u8,
    bridge: Option<PeerId>,
    pub(crate) link: Option<Link>,
}

impl Peer {
    pub(crate) fn direct(id: PeerId, host: IpAddr, port: u16, link: Link) -> Self {
        Self {
            id,
            host,
            port,
            distance: 0,
            bridge: None,
            link: Some(link),
        }
    }

    pub(crate) fn indirect(
        id: PeerId,
        host: IpAddr,
        port: u16,
        bridge: PeerId,
        distance: u8,
    ) -> Self {
        Self {
            id,
            host,
            port,
            distance,
            bridge: Some(bridge),
            link: None,
        }
    }

    /// An indirect peer whose endpoint has not been learned yet.
    pub(crate) fn unlocated(id: PeerId, bridge: PeerId, distance: u8) -> Self {
        Self::indirect(id, IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0, bridge, distance)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Remote address. For direct peers this is the socket's remote IP; for
    /// peers learned through gossip it is the advertised address (possibly
    /// unspecified until a peer-list entry fills it in).
    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// The listening port the peer advertised, which may differ from the
    /// ephemeral source port of its outbound socket.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn is_direct(&self) -> bool {
        self.link.is_some()
    }

    /// Hop count: 0 for direct neighbors, [`DISTANCE_UNKNOWN`] when no
    /// finite route is known.
    pub fn distance(&self) -> u8 {
        self.distance
    }

    /// The direct neighbor relaying our traffic when this peer is not
    /// directly connected.
    pub fn bridge(&self) -> Option<PeerId> {
        self.bridge
    }

    pub fn has_endpoint(&self) -> bool {
        !self.host.is_unspecified() && self.port != 0
    }

    pub(crate) fn set_route(&mut self, bridge: PeerId, distance: u8) {
        self.bridge = Some(bridge);
        self.distance = distance;
    }

    pub(crate) fn set_endpoint(&mut self, host: IpAddr, port: u16) {
        self.host = host;
        self.port = port;
    }

    pub(crate) fn set_distance(&mut self, distance: u8) {
        self.distance = distance;
    }

    /// Attach a link, turning an indirect record into a direct neighbor.
    pub(crate) fn attach_link(&mut self, host: IpAddr, port: u16, link: Link) {
        self.host = host;
        self.port = port;
        self.distance = 0;
        self.bridge = None;
        self.link = Some(link);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint())
            .field("direct", &self.is_direct())
            .field("distance", &self.distance)
            .field("bridge", &self.bridge)
            .finish()
    }
}
