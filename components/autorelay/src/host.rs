use futures_util::future::BoxFuture;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Circuit relay v2 hop protocol. Peers advertising it can forward traffic for us.
pub const HOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/hop";

/// Connection manager tag under which relay connections are pinned.
pub const AUTORELAY_TAG: &str = "autorelay";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay finder already running")]
    AlreadyRunning,
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("no open connection to peer")]
    NoConnection,
    #[error("connected through a relay, not a public node")]
    NotPublicNode,
    #[error("probe timed out")]
    ProbeTimedOut,
    #[error("doesn't speak the circuit v2 hop protocol")]
    HopUnsupported,
    #[error("protocol query failed: {0}")]
    ProtocolQuery(String),
    #[error("identify failed: {0}")]
    IdentifyFailed(String),
    #[error("reservation failed: {0}")]
    ReservationFailed(String),
    #[error("event subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("shutting down")]
    ShuttingDown,
}

/// A peer id together with the addresses it may be dialed on.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(peer: PeerId) -> Self {
        Self { peer, addrs: Vec::new() }
    }

    pub fn with_addrs(peer: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer, addrs }
    }
}

/// An open connection to a peer, as reported by the host.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote_addr: Multiaddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

/// Connectivity change published by the host's event bus.
#[derive(Clone, Debug)]
pub struct ConnectednessEvent {
    pub peer: PeerId,
    pub connectedness: Connectedness,
}

/// A forwarding slot granted by a relay. `addrs` and `voucher` are relayed
/// verbatim from the protocol response and not interpreted here.
#[derive(Clone, Debug)]
pub struct Reservation {
    pub expiration: Instant,
    pub addrs: Vec<Multiaddr>,
    pub voucher: Option<Vec<u8>>,
}

/// The host-side capabilities the relay finder drives: dialing, connection and
/// protocol introspection, connection pinning, the connectivity event stream,
/// and the circuit v2 `reserve` call itself.
pub trait RelayHost: Send + Sync {
    fn connect<'a>(&'a self, info: &'a PeerInfo) -> BoxFuture<'a, Result<(), RelayError>>;
    fn connections(&self, peer: &PeerId) -> Vec<ConnectionInfo>;
    fn connectedness(&self, peer: &PeerId) -> Connectedness;
    /// Resolves once the identify exchange has completed on `conn`.
    fn identify_wait<'a>(&'a self, conn: &'a ConnectionInfo) -> BoxFuture<'a, Result<(), RelayError>>;
    /// Intersect the peer's advertised protocols with `query`.
    fn supported_protocols(&self, peer: &PeerId, query: &[&str]) -> Result<Vec<String>, RelayError>;
    fn protect(&self, peer: &PeerId, tag: &str);
    fn unprotect(&self, peer: &PeerId, tag: &str);
    fn subscribe_connectedness(&self) -> Result<mpsc::Receiver<ConnectednessEvent>, RelayError>;
    fn signal_address_change(&self);
    fn peer_addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;
    fn reserve<'a>(&'a self, info: &'a PeerInfo) -> BoxFuture<'a, Result<Reservation, RelayError>>;
}
