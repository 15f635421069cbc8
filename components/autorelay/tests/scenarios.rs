//! End-to-end scenarios against the public crate surface: a NATed host
//! discovers relays, converges on reservations, and republishes its
//! address set as relays come and go.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use autorelay::{
    Config, ConfigBuilder, Connectedness, ConnectednessEvent, ConnectionInfo, PeerInfo, RelayError, RelayFinder, RelayHost,
    Reservation,
};

#[derive(Default)]
struct ScriptedHost {
    hop_peers: Mutex<HashSet<PeerId>>,
    connected: Mutex<HashSet<PeerId>>,
    pins: Mutex<HashMap<PeerId, i64>>,
    signals: AtomicUsize,
    peer_addrs: Mutex<HashMap<PeerId, Vec<Multiaddr>>>,
    events_tx: Mutex<Option<mpsc::Sender<ConnectednessEvent>>>,
}

impl ScriptedHost {
    fn add_hop_peer(&self) -> PeerId {
        let peer = PeerId::random();
        self.hop_peers.lock().expect("hop peers").insert(peer);
        self.peer_addrs.lock().expect("peer addrs").insert(peer, vec!["/ip4/203.0.113.30/tcp/4001".parse().expect("addr")]);
        peer
    }

    fn event_sender(&self) -> mpsc::Sender<ConnectednessEvent> {
        self.events_tx.lock().expect("events tx").clone().expect("subscribed")
    }

    fn pin_count(&self, peer: &PeerId) -> i64 {
        self.pins.lock().expect("pins").get(peer).copied().unwrap_or(0)
    }
}

impl RelayHost for ScriptedHost {
    fn connect<'a>(&'a self, info: &'a PeerInfo) -> BoxFuture<'a, Result<(), RelayError>> {
        Box::pin(async move {
            self.connected.lock().expect("connected").insert(info.peer);
            Ok(())
        })
    }

    fn connections(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        if self.connected.lock().expect("connected").contains(peer) {
            vec![ConnectionInfo { id: 1, remote_addr: "/ip4/203.0.113.7/tcp/4001".parse().expect("addr") }]
        } else {
            Vec::new()
        }
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if self.connected.lock().expect("connected").contains(peer) {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }

    fn identify_wait<'a>(&'a self, _conn: &'a ConnectionInfo) -> BoxFuture<'a, Result<(), RelayError>> {
        Box::pin(async { Ok(()) })
    }

    fn supported_protocols(&self, peer: &PeerId, query: &[&str]) -> Result<Vec<String>, RelayError> {
        if self.hop_peers.lock().expect("hop peers").contains(peer) {
            Ok(query.iter().map(|proto| proto.to_string()).collect())
        } else {
            Ok(Vec::new())
        }
    }

    fn protect(&self, peer: &PeerId, _tag: &str) {
        *self.pins.lock().expect("pins").entry(*peer).or_insert(0) += 1;
    }

    fn unprotect(&self, peer: &PeerId, _tag: &str) {
        *self.pins.lock().expect("pins").entry(*peer).or_insert(0) -= 1;
    }

    fn subscribe_connectedness(&self) -> Result<mpsc::Receiver<ConnectednessEvent>, RelayError> {
        let (tx, rx) = mpsc::channel(16);
        *self.events_tx.lock().expect("events tx") = Some(tx);
        Ok(rx)
    }

    fn signal_address_change(&self) {
        self.signals.fetch_add(1, Ordering::SeqCst);
    }

    fn peer_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.peer_addrs.lock().expect("peer addrs").get(peer).cloned().unwrap_or_default()
    }

    fn reserve<'a>(&'a self, _info: &'a PeerInfo) -> BoxFuture<'a, Result<Reservation, RelayError>> {
        Box::pin(async move {
            Ok(Reservation { expiration: Instant::now() + Duration::from_secs(60 * 60), addrs: Vec::new(), voucher: None })
        })
    }
}

fn nat_config() -> Config {
    ConfigBuilder::new()
        .desired_relays(2)
        .min_candidates(2)
        .max_candidates(20)
        .max_attempts(3)
        .boot_delay(Duration::from_secs(10))
        .backoff(Duration::from_secs(60))
        .rng_seed(Some(31))
        .build()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn relayed_addresses_follow_the_relay_set() {
    let host = Arc::new(ScriptedHost::default());
    let (discovery_tx, discovery_rx) = mpsc::channel(32);
    let finder = RelayFinder::new(host.clone(), discovery_rx, nat_config());
    finder.start().await.expect("start relay finder");

    let peers: Vec<PeerId> = (0..4).map(|_| host.add_hop_peer()).collect();
    for peer in &peers {
        discovery_tx.send(PeerInfo::new(*peer)).await.expect("send hint");
    }
    wait_until(|| finder.num_relays() == 2).await;
    assert!(host.signals.load(Ordering::SeqCst) >= 1);

    let private: Multiaddr = "/ip4/10.1.2.3/tcp/4001".parse().expect("addr");
    let public: Multiaddr = "/ip4/198.51.100.4/tcp/4001".parse().expect("addr");
    let published = finder.relay_addrs(&[private.clone(), public.clone()]);
    assert!(published.contains(&private));
    assert!(!published.contains(&public));
    let circuits: Vec<&Multiaddr> = published.iter().filter(|addr| autorelay::multiaddr::is_relay_addr(addr)).collect();
    assert_eq!(circuits.len(), 2);
    for relay in finder.relays() {
        assert!(circuits.iter().any(|addr| addr.to_string().contains(&relay.to_string())));
        assert_eq!(host.pin_count(&relay), 1);
    }

    // Losing a relay republishes without it.
    let victim = finder.relays()[0];
    host.event_sender()
        .send(ConnectednessEvent { peer: victim, connectedness: Connectedness::NotConnected })
        .await
        .expect("send event");
    wait_until(|| finder.num_relays() == 1).await;
    let republished = finder.relay_addrs(&[private.clone()]);
    assert!(republished.iter().all(|addr| !addr.to_string().contains(&victim.to_string())));

    // The next discovery hint drives the set back to the target.
    let replacement = host.add_hop_peer();
    discovery_tx.send(PeerInfo::new(replacement)).await.expect("send hint");
    wait_until(|| finder.num_relays() == 2).await;
    assert!(!finder.relays().contains(&victim));

    finder.stop().await;
}

#[tokio::test]
async fn start_is_exclusive_while_running() {
    let host = Arc::new(ScriptedHost::default());
    let (_discovery_tx, discovery_rx) = mpsc::channel(8);
    let finder = RelayFinder::new(host, discovery_rx, nat_config());

    finder.start().await.expect("start relay finder");
    assert!(matches!(finder.start().await, Err(RelayError::AlreadyRunning)));
    finder.stop().await;
}
