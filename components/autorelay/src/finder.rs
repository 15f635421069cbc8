use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::{join_all, select_all};
use libp2p::{Multiaddr, PeerId};
use log::{debug, error};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at, sleep_until, timeout};
use tokio_util::task::TaskTracker;
use triggered::{Listener, Trigger};

use crate::candidates::{CandidateSet, FailedAttempt};
use crate::config::Config;
use crate::host::{AUTORELAY_TAG, Connectedness, ConnectednessEvent, HOP_PROTOCOL, PeerInfo, RelayError, RelayHost};
use crate::metrics::FinderMetrics;
use crate::multiaddr::is_relay_addr;
use crate::relays::RelaySet;


const RESERVATION_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const RESERVATION_EXPIRATION_SLACK: Duration = Duration::from_secs(2 * 60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);
const MIN_BACKOFF_SWEEP_TICK: Duration = Duration::from_millis(50);

// Terminology:
// Candidate: a connected node that turned out to support the hop protocol; we
// consider using it as a relay.
// Relay: a candidate we hold a slot reservation with. Selection is currently
// random; latency or reputation could be factored in here later.

/// Finds relays and keeps slot reservations with `desired_relays` of them while
/// the host is not publicly reachable. Peer hints arrive on the discovery
/// channel, get probed for hop support, and graduate to reservations through a
/// randomized attempt pass; reservations are refreshed before they expire and
/// evicted on disconnect. The synthetic address set is served by
/// [`RelayFinder::relay_addrs`].
pub struct RelayFinder {
    inner: Arc<Inner>,
    run: Mutex<Option<RunHandle>>,
}

struct RunHandle {
    trigger: Trigger,
    tracker: TaskTracker,
}

struct Inner {
    host: Arc<dyn RelayHost>,
    conf: Config,
    boot_time: Mutex<Instant>,
    discovery: tokio::sync::Mutex<mpsc::Receiver<PeerInfo>>,
    // Lock order where both tables are needed: `relays` first, then `candidates`.
    candidates: Mutex<CandidateSet>,
    relays: Mutex<RelaySet>,
    candidate_found: Notify,
    relay_updated: Notify,
    probes_in_flight: AtomicUsize,
    attempt_gate: AttemptGate,
    rng: Mutex<StdRng>,
    metrics: Arc<FinderMetrics>,
}

impl RelayFinder {
    pub fn new(host: Arc<dyn RelayHost>, discovery: mpsc::Receiver<PeerInfo>, conf: Config) -> Self {
        let rng = match conf.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            inner: Arc::new(Inner {
                host,
                candidates: Mutex::new(CandidateSet::new(conf.max_candidates)),
                relays: Mutex::new(RelaySet::new()),
                boot_time: Mutex::new(Instant::now()),
                discovery: tokio::sync::Mutex::new(discovery),
                candidate_found: Notify::new(),
                relay_updated: Notify::new(),
                probes_in_flight: AtomicUsize::new(0),
                attempt_gate: AttemptGate::default(),
                rng: Mutex::new(rng),
                metrics: FinderMetrics::new(),
                conf,
            }),
            run: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), RelayError> {
        let (trigger, shutdown) = triggered::trigger();
        let tracker = TaskTracker::new();
        {
            let mut run = self.run.lock();
            if run.is_some() {
                return Err(RelayError::AlreadyRunning);
            }
            *run = Some(RunHandle { trigger, tracker: tracker.clone() });
        }
        *self.inner.boot_time.lock() = Instant::now();
        debug!("autorelay: starting relay finder");

        tracker.spawn(find_nodes(self.inner.clone(), tracker.clone(), shutdown.clone()));
        tracker.spawn(supervise(self.inner.clone(), tracker.clone(), shutdown));
        Ok(())
    }

    /// Trip the shutdown trigger and wait for every worker to finish.
    pub async fn stop(&self) {
        let handle = self.run.lock().take();
        let Some(run) = handle else { return };
        debug!("autorelay: stopping relay finder");
        run.trigger.trigger();
        run.tracker.close();
        run.tracker.wait().await;
    }

    /// The externally publishable address list for `host_addrs`, with public
    /// entries replaced by circuit addresses through the current relays.
    pub fn relay_addrs(&self, host_addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        let host = self.inner.host.clone();
        self.inner.relays.lock().relay_addrs(host_addrs, |relay| host.peer_addrs(relay), Instant::now())
    }

    pub fn relays(&self) -> Vec<PeerId> {
        self.inner.relays.lock().peers()
    }

    pub fn num_relays(&self) -> usize {
        self.inner.relays.lock().len()
    }

    pub fn metrics(&self) -> Arc<FinderMetrics> {
        self.inner.metrics.clone()
    }
}

/// Admits at most one reservation-attempt worker; triggers arriving while one
/// is in flight coalesce into a rerun of the full pass.
#[derive(Default)]
struct AttemptGate {
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    running: bool,
    rerun: bool,
}

impl AttemptGate {
    fn try_begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            state.rerun = true;
            false
        } else {
            state.running = true;
            true
        }
    }

    fn finish_or_rerun(&self) -> bool {
        let mut state = self.state.lock();
        if state.rerun {
            state.rerun = false;
            true
        } else {
            state.running = false;
            false
        }
    }
}

/// Single owner of the timers and event subscriptions. Everything that mutates
/// the relay set funnels through here so cache invalidation and the
/// address-change signal happen exactly once per change.
async fn supervise(inner: Arc<Inner>, tracker: TaskTracker, shutdown: Listener) {
    let mut conn_events = match inner.host.subscribe_connectedness() {
        Ok(events) => events,
        Err(err) => {
            error!("autorelay: failed to subscribe to connectedness events: {err}");
            return;
        }
    };

    let boot_deadline = *inner.boot_time.lock() + inner.conf.boot_delay;
    let boot_timer = sleep_until(boot_deadline);
    tokio::pin!(boot_timer);
    let mut boot_fired = false;

    let mut refresh_ticker = interval_at(Instant::now() + RESERVATION_REFRESH_INTERVAL, RESERVATION_REFRESH_INTERVAL);
    refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let sweep_period = (inner.conf.backoff / 5).max(MIN_BACKOFF_SWEEP_TICK);
    let mut backoff_ticker = interval_at(Instant::now() + sweep_period, sweep_period);
    backoff_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let mut changed = false;
        tokio::select! {
            event = conn_events.recv() => {
                let Some(event) = event else { return };
                changed = handle_connectedness(&inner, event);
            }
            _ = inner.candidate_found.notified() => spawn_attempt_pass(&inner, &tracker, &shutdown),
            _ = &mut boot_timer, if !boot_fired => {
                boot_fired = true;
                spawn_attempt_pass(&inner, &tracker, &shutdown);
            }
            _ = inner.relay_updated.notified() => changed = true,
            _ = refresh_ticker.tick() => changed = refresh_reservations(&inner, &shutdown, Instant::now()).await,
            _ = backoff_ticker.tick() => check_backoffs(&inner, Instant::now()),
            _ = shutdown.clone() => return,
        }
        if changed {
            inner.relays.lock().invalidate_cache();
            inner.host.signal_address_change();
        }
    }
}

fn handle_connectedness(inner: &Arc<Inner>, event: ConnectednessEvent) -> bool {
    if event.connectedness != Connectedness::NotConnected {
        return false;
    }
    let removed = {
        let mut relays = inner.relays.lock();
        let removed = relays.remove(&event.peer).is_some();
        if removed {
            inner.metrics.set_active_reservations(relays.len());
        }
        removed
    };
    if removed {
        debug!("autorelay: disconnected from relay {}", event.peer);
        inner.host.unprotect(&event.peer, AUTORELAY_TAG);
        inner.metrics.record_relay_disconnect();
    }
    removed
}

/// Consumes discovery hints and fans them out to probe workers. Static seed
/// relays go through the same pipeline, ahead of the channel.
async fn find_nodes(inner: Arc<Inner>, tracker: TaskTracker, shutdown: Listener) {
    for info in inner.conf.static_relays.clone() {
        maybe_probe(&inner, &tracker, &shutdown, info);
    }
    let mut discovery = inner.discovery.lock().await;
    loop {
        tokio::select! {
            _ = shutdown.clone() => return,
            hint = discovery.recv() => {
                let Some(info) = hint else { return };
                maybe_probe(&inner, &tracker, &shutdown, info);
            }
        }
    }
}

fn maybe_probe(inner: &Arc<Inner>, tracker: &TaskTracker, shutdown: &Listener, info: PeerInfo) {
    debug!("autorelay: discovered node {}", info.peer);
    let num_candidates = inner.candidates.lock().len();
    if num_candidates >= inner.conf.max_candidates {
        debug!("autorelay: skipping node {}: already have {num_candidates} candidates", info.peer);
        return;
    }
    inner.probes_in_flight.fetch_add(1, Ordering::SeqCst);
    inner.metrics.record_probe_attempt();
    tracker.spawn(probe_node(inner.clone(), info, shutdown.clone()));
}

/// Tests whether a discovered peer qualifies as a relay candidate and, if so,
/// installs it in the candidate table and wakes the supervisor.
async fn probe_node(inner: Arc<Inner>, info: PeerInfo, shutdown: Listener) {
    let id = info.peer;
    let already_relay = inner.relays.lock().contains(&id);
    let outcome = if already_relay {
        // Already one of our relays; nothing to probe.
        None
    } else {
        Some(tokio::select! {
            _ = shutdown => Err(RelayError::ShuttingDown),
            probed = timeout(PROBE_TIMEOUT, try_node(inner.host.as_ref(), &info)) => {
                probed.unwrap_or(Err(RelayError::ProbeTimedOut))
            }
        })
    };

    match outcome {
        Some(Ok(())) => {
            let inserted = {
                let relays = inner.relays.lock();
                if relays.contains(&id) {
                    false
                } else {
                    let mut candidates = inner.candidates.lock();
                    let inserted = candidates.insert(info, Instant::now());
                    inner.metrics.set_candidate_counts(candidates.len(), candidates.backoff_len());
                    inserted
                }
            };
            if inserted {
                debug!("autorelay: node {id} supports the hop protocol");
                inner.metrics.record_probe_success();
            } else {
                debug!("autorelay: discarding qualified node {id}: no room in the candidate table");
                inner.metrics.record_probe_failure();
            }
            inner.probes_in_flight.fetch_sub(1, Ordering::SeqCst);
            if inserted {
                inner.candidate_found.notify_one();
            }
        }
        Some(Err(err)) => {
            debug!("autorelay: node {id} not accepted as a candidate: {err}");
            inner.metrics.record_probe_failure();
            inner.probes_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        None => {
            inner.probes_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Checks that a peer is directly reachable and speaks the hop protocol.
/// Does not modify any state.
async fn try_node(host: &dyn RelayHost, info: &PeerInfo) -> Result<(), RelayError> {
    host.connect(info).await?;

    let conns = host.connections(&info.peer);
    if conns.is_empty() {
        return Err(RelayError::NoConnection);
    }
    // A relay must be reachable without relaying.
    if conns.iter().any(|conn| is_relay_addr(&conn.remote_addr)) {
        return Err(RelayError::NotPublicNode);
    }

    // Wait for identify to complete on at least one connection so that the
    // protocol query below sees the peer's advertised protocols.
    let mut waits: Vec<_> = conns.iter().map(|conn| host.identify_wait(conn)).collect();
    loop {
        let (completed, _, remaining) = select_all(waits).await;
        match completed {
            Ok(()) => break,
            Err(err) if remaining.is_empty() => return Err(err),
            Err(_) => waits = remaining,
        }
    }

    let protos = host.supported_protocols(&info.peer, &[HOP_PROTOCOL])?;
    if !protos.iter().any(|proto| proto == HOP_PROTOCOL) {
        return Err(RelayError::HopUnsupported);
    }
    Ok(())
}

fn spawn_attempt_pass(inner: &Arc<Inner>, tracker: &TaskTracker, shutdown: &Listener) {
    if !inner.attempt_gate.try_begin() {
        return;
    }
    tracker.spawn(attempt_reservations(inner.clone(), shutdown.clone()));
}

async fn attempt_reservations(inner: Arc<Inner>, shutdown: Listener) {
    loop {
        attempt_pass(&inner, &shutdown).await;
        if !inner.attempt_gate.finish_or_rerun() {
            return;
        }
    }
}

/// Whether to hold off on reserving. During the startup phase we don't want to
/// latch onto the first candidate we find; we wait for `min_candidates` and
/// pick among them, unless `boot_delay` has elapsed. With static relays
/// configured we only wait for outstanding probes instead.
fn should_defer(inner: &Arc<Inner>, now: Instant) -> bool {
    let num_relays = inner.relays.lock().len();
    if num_relays >= inner.conf.desired_relays {
        return true;
    }
    let num_candidates = inner.candidates.lock().len();
    if num_candidates == 0 {
        return true;
    }
    let booting = now.duration_since(*inner.boot_time.lock()) < inner.conf.boot_delay;
    let below_quorum = num_candidates < inner.conf.min_candidates;
    if inner.conf.static_relays.is_empty() {
        num_relays == 0 && below_quorum && booting
    } else {
        inner.probes_in_flight.load(Ordering::SeqCst) > 0 && below_quorum && booting
    }
}

/// One sequential walk over a shuffled candidate snapshot, reserving until the
/// relay target is met.
async fn attempt_pass(inner: &Arc<Inner>, shutdown: &Listener) {
    if should_defer(inner, Instant::now()) {
        return;
    }
    let selection = {
        let mut rng = inner.rng.lock();
        inner.candidates.lock().shuffled(&mut rng)
    };

    for candidate in selection {
        let id = candidate.info.peer;
        {
            let relays = inner.relays.lock();
            if relays.len() >= inner.conf.desired_relays {
                return;
            }
            if relays.contains(&id) {
                continue;
            }
        }

        if inner.host.connectedness(&id) != Connectedness::Connected {
            let dialed = tokio::select! {
                _ = shutdown.clone() => return,
                dialed = inner.host.connect(&candidate.info) => dialed,
            };
            if let Err(err) = dialed {
                debug!("autorelay: failed to reconnect to candidate {id}: {err}");
                let mut candidates = inner.candidates.lock();
                candidates.remove(&id);
                inner.metrics.set_candidate_counts(candidates.len(), candidates.backoff_len());
                continue;
            }
        }

        inner.metrics.record_reservation_attempt();
        let reserved = tokio::select! {
            _ = shutdown.clone() => return,
            reserved = inner.host.reserve(&candidate.info) => reserved,
        };
        match reserved {
            Err(err) => {
                debug!("autorelay: failed to reserve slot with {id}: {err}");
                inner.metrics.record_reservation_failure();
                let disposition = {
                    let mut rng = inner.rng.lock();
                    let mut candidates = inner.candidates.lock();
                    let disposition =
                        candidates.fail(&id, Instant::now(), inner.conf.backoff, inner.conf.max_attempts, &mut rng);
                    inner.metrics.set_candidate_counts(candidates.len(), candidates.backoff_len());
                    disposition
                };
                match disposition {
                    Some(FailedAttempt::RetryScheduled) => debug!("autorelay: moving candidate {id} to backoff"),
                    Some(FailedAttempt::QueueFull) => debug!("autorelay: backoff queue full, dropping candidate {id}"),
                    Some(FailedAttempt::GaveUp) => debug!("autorelay: giving up on candidate {id} after repeated failures"),
                    None => {}
                }
            }
            Ok(reservation) => {
                debug!("autorelay: added relay {id} (candidate for {:?})", candidate.added.elapsed());
                inner.metrics.record_reservation_success();
                let num_relays = {
                    let mut relays = inner.relays.lock();
                    relays.insert(id, reservation);
                    let mut candidates = inner.candidates.lock();
                    candidates.remove(&id);
                    inner.metrics.set_candidate_counts(candidates.len(), candidates.backoff_len());
                    relays.len()
                };
                inner.metrics.set_active_reservations(num_relays);
                inner.host.protect(&id, AUTORELAY_TAG);
                inner.relay_updated.notify_one();
                if num_relays >= inner.conf.desired_relays {
                    return;
                }
            }
        }
    }
}

/// Re-reserve every reservation expiring within the slack window, in parallel.
/// Reports whether anything fell inside the window (so the cached address set
/// is recomputed after a refresh pass).
async fn refresh_reservations(inner: &Arc<Inner>, shutdown: &Listener, now: Instant) -> bool {
    let expiring = inner.relays.lock().expiring(now + RESERVATION_EXPIRATION_SLACK);
    if expiring.is_empty() {
        return false;
    }
    join_all(expiring.into_iter().map(|relay| refresh_reservation(inner, shutdown.clone(), relay))).await;
    inner.metrics.set_active_reservations(inner.relays.lock().len());
    true
}

async fn refresh_reservation(inner: &Arc<Inner>, shutdown: Listener, relay: PeerId) {
    let info = PeerInfo::new(relay);
    let outcome = tokio::select! {
        _ = shutdown => Err(RelayError::ShuttingDown),
        reserved = inner.host.reserve(&info) => reserved,
    };
    match outcome {
        Ok(reservation) => {
            debug!("autorelay: refreshed reservation with relay {relay}");
            inner.relays.lock().insert(relay, reservation);
        }
        Err(err) => {
            debug!("autorelay: failed to refresh reservation with relay {relay}: {err}");
            inner.relays.lock().remove(&relay);
            inner.host.unprotect(&relay, AUTORELAY_TAG);
            inner.metrics.record_refresh_failure();
        }
    }
}

/// Move ripe backoff entries back into the candidate table and wake the
/// supervisor when any returned.
fn check_backoffs(inner: &Arc<Inner>, now: Instant) {
    let promoted = {
        let mut candidates = inner.candidates.lock();
        let promoted = candidates.promote_ripe(now);
        inner.metrics.set_candidate_counts(candidates.len(), candidates.backoff_len());
        promoted
    };
    if promoted > 0 {
        inner.candidate_found.notify_one();
    }
}
