use std::collections::HashMap;

use libp2p::{Multiaddr, PeerId};
use tokio::time::{Duration, Instant};

use crate::host::Reservation;
use crate::multiaddr::{cleanup_address_set, encapsulate_circuit, is_private_addr};

const ADDR_CACHE_TTL: Duration = Duration::from_secs(30);

/// Active slot reservations, keyed by relay, plus the memoized synthetic
/// address list derived from them. Any mutation drops the cache.
pub(crate) struct RelaySet {
    reservations: HashMap<PeerId, Reservation>,
    cached_addrs: Option<(Vec<Multiaddr>, Instant)>,
}

impl RelaySet {
    pub(crate) fn new() -> Self {
        Self { reservations: HashMap::new(), cached_addrs: None }
    }

    pub(crate) fn len(&self) -> usize {
        self.reservations.len()
    }

    pub(crate) fn contains(&self, relay: &PeerId) -> bool {
        self.reservations.contains_key(relay)
    }

    pub(crate) fn peers(&self) -> Vec<PeerId> {
        self.reservations.keys().copied().collect()
    }

    pub(crate) fn insert(&mut self, relay: PeerId, reservation: Reservation) {
        self.reservations.insert(relay, reservation);
        self.cached_addrs = None;
    }

    pub(crate) fn remove(&mut self, relay: &PeerId) -> Option<Reservation> {
        let removed = self.reservations.remove(relay);
        if removed.is_some() {
            self.cached_addrs = None;
        }
        removed
    }

    /// Relays whose reservation expires at or before `deadline`.
    pub(crate) fn expiring(&self, deadline: Instant) -> Vec<PeerId> {
        self.reservations.iter().filter(|(_, reservation)| reservation.expiration <= deadline).map(|(relay, _)| *relay).collect()
    }

    pub(crate) fn invalidate_cache(&mut self) {
        self.cached_addrs = None;
    }

    /// The externally publishable address list: private host addresses are kept
    /// verbatim (same-LAN peers can still dial directly), public ones dropped,
    /// and each relay contributes its dialable addresses encapsulated with
    /// `/p2p/<relay>/p2p-circuit`. Memoized for a short TTL.
    pub(crate) fn relay_addrs(
        &mut self,
        host_addrs: &[Multiaddr],
        peer_addrs: impl Fn(&PeerId) -> Vec<Multiaddr>,
        now: Instant,
    ) -> Vec<Multiaddr> {
        if let Some((addrs, expiry)) = &self.cached_addrs
            && now < *expiry
        {
            return addrs.clone();
        }

        let mut addrs = Vec::with_capacity(host_addrs.len() + 4 * self.reservations.len());
        for addr in host_addrs {
            if is_private_addr(addr) {
                addrs.push(addr.clone());
            }
        }
        for relay in self.reservations.keys() {
            for addr in cleanup_address_set(&peer_addrs(relay)) {
                addrs.push(encapsulate_circuit(&addr, *relay));
            }
        }

        self.cached_addrs = Some((addrs.clone(), now + ADDR_CACHE_TTL));
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn addr(raw: &str) -> Multiaddr {
        Multiaddr::from_str(raw).expect("valid multiaddr")
    }

    fn reservation(expiration: Instant) -> Reservation {
        Reservation { expiration, addrs: Vec::new(), voucher: None }
    }

    #[test]
    fn expiring_selects_reservations_within_deadline() {
        let now = Instant::now();
        let mut set = RelaySet::new();
        let soon = PeerId::random();
        let later = PeerId::random();
        set.insert(soon, reservation(now + Duration::from_secs(90)));
        set.insert(later, reservation(now + Duration::from_secs(600)));

        let expiring = set.expiring(now + Duration::from_secs(120));
        assert_eq!(expiring, vec![soon]);
        assert!(set.expiring(now + Duration::from_secs(700)).len() == 2);
    }

    #[test]
    fn relay_addrs_keeps_private_and_appends_circuits() {
        let now = Instant::now();
        let mut set = RelaySet::new();
        let relay = PeerId::random();
        set.insert(relay, reservation(now + Duration::from_secs(600)));

        let host_addrs = [addr("/ip4/192.168.1.5/tcp/4001"), addr("/ip4/203.0.113.5/tcp/4001")];
        let relay_addr = addr("/ip4/203.0.113.10/tcp/4001");
        let published = set.relay_addrs(&host_addrs, |_| vec![relay_addr.clone()], now);

        assert_eq!(
            published,
            vec![addr("/ip4/192.168.1.5/tcp/4001"), addr(&format!("/ip4/203.0.113.10/tcp/4001/p2p/{relay}/p2p-circuit"))]
        );
    }

    #[test]
    fn relay_addrs_memoizes_until_ttl() {
        let now = Instant::now();
        let mut set = RelaySet::new();
        let relay = PeerId::random();
        set.insert(relay, reservation(now + Duration::from_secs(600)));

        let first = set.relay_addrs(&[], |_| vec![addr("/ip4/203.0.113.10/tcp/4001")], now);
        let cached = set.relay_addrs(&[], |_| vec![addr("/ip4/203.0.113.11/tcp/4001")], now + Duration::from_secs(10));
        assert_eq!(first, cached);

        let recomputed = set.relay_addrs(&[], |_| vec![addr("/ip4/203.0.113.11/tcp/4001")], now + Duration::from_secs(31));
        assert_ne!(first, recomputed);
    }

    #[test]
    fn mutations_drop_the_cached_addrs() {
        let now = Instant::now();
        let mut set = RelaySet::new();
        let first = PeerId::random();
        set.insert(first, reservation(now + Duration::from_secs(600)));

        let before = set.relay_addrs(&[], |_| vec![addr("/ip4/203.0.113.10/tcp/4001")], now);
        assert_eq!(before.len(), 1);

        let second = PeerId::random();
        set.insert(second, reservation(now + Duration::from_secs(600)));
        let after = set.relay_addrs(&[], |_| vec![addr("/ip4/203.0.113.10/tcp/4001")], now);
        assert_eq!(after.len(), 2);

        set.remove(&first);
        set.remove(&second);
        let emptied = set.relay_addrs(&[], |_| vec![addr("/ip4/203.0.113.10/tcp/4001")], now);
        assert!(emptied.is_empty());
    }
}
