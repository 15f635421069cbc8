//! Relay discovery and slot-reservation management for hosts behind NAT.
//!
//! A host that cannot be reached from the public Internet publishes relayed
//! addresses instead: it probes discovered peers for the circuit v2 hop
//! protocol, reserves forwarding slots with a few of them, keeps those
//! reservations refreshed, and synthesizes `/p2p/<relay>/p2p-circuit`
//! addresses for other peers to dial. The host side (transport, identify,
//! connection manager, event bus) stays behind the [`host::RelayHost`] trait.

mod candidates;
pub mod config;
pub mod finder;
pub mod host;
pub mod metrics;
pub mod multiaddr;
mod relays;

pub use config::{Config, ConfigBuilder};
pub use finder::RelayFinder;
pub use host::{
    AUTORELAY_TAG, Connectedness, ConnectednessEvent, ConnectionInfo, HOP_PROTOCOL, PeerInfo, RelayError, RelayHost, Reservation,
};
pub use metrics::{FinderMetrics, FinderMetricsSnapshot};
