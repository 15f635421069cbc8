use std::collections::{HashMap, VecDeque};

use libp2p::PeerId;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, seq::SliceRandom};
use tokio::time::{Duration, Instant};

use crate::host::PeerInfo;

const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;
const MAX_BACKOFF_EXPONENT: usize = 16;

/// A peer known to speak the hop protocol, not yet holding a reservation.
#[derive(Clone, Debug)]
pub(crate) struct Candidate {
    pub(crate) info: PeerInfo,
    pub(crate) added: Instant,
    pub(crate) attempts: usize,
}

#[derive(Clone, Debug)]
struct BackoffEntry {
    candidate: Candidate,
    next_attempt: Instant,
}

/// Disposition of a failed reservation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailedAttempt {
    RetryScheduled,
    QueueFull,
    GaveUp,
}

/// Bounded candidate table plus the backoff queue of candidates temporarily
/// ineligible after a failed reservation. The queue is kept in non-decreasing
/// `next_attempt` order, FIFO among equal instants.
pub(crate) struct CandidateSet {
    max: usize,
    active: HashMap<PeerId, Candidate>,
    backoff: VecDeque<BackoffEntry>,
}

impl CandidateSet {
    pub(crate) fn new(max: usize) -> Self {
        Self { max, active: HashMap::new(), backoff: VecDeque::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn backoff_len(&self) -> usize {
        self.backoff.len()
    }

    pub(crate) fn contains(&self, peer: &PeerId) -> bool {
        self.active.contains_key(peer)
    }

    pub(crate) fn on_backoff(&self, peer: &PeerId) -> bool {
        self.backoff.iter().any(|entry| entry.candidate.info.peer == *peer)
    }

    /// Insert a fresh candidate record. Refused when the table is at capacity
    /// or the peer is sitting out a backoff delay.
    pub(crate) fn insert(&mut self, info: PeerInfo, now: Instant) -> bool {
        if self.active.len() >= self.max || self.on_backoff(&info.peer) {
            return false;
        }
        self.active.insert(info.peer, Candidate { info, added: now, attempts: 0 });
        true
    }

    pub(crate) fn remove(&mut self, peer: &PeerId) -> Option<Candidate> {
        self.active.remove(peer)
    }

    /// Snapshot of the table in uniformly random order.
    pub(crate) fn shuffled(&self, rng: &mut StdRng) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self.active.values().cloned().collect();
        candidates.shuffle(rng);
        candidates
    }

    /// Record a failed reservation attempt: the candidate leaves the table and,
    /// unless it exhausted its attempts or the queue is full, re-enters through
    /// the backoff queue after `backoff · 2^(attempts-1)` scaled by jitter.
    pub(crate) fn fail(
        &mut self,
        peer: &PeerId,
        now: Instant,
        backoff: Duration,
        max_attempts: usize,
        rng: &mut StdRng,
    ) -> Option<FailedAttempt> {
        let mut candidate = self.active.remove(peer)?;
        candidate.attempts += 1;
        if candidate.attempts >= max_attempts {
            return Some(FailedAttempt::GaveUp);
        }
        if self.backoff.len() >= self.max {
            return Some(FailedAttempt::QueueFull);
        }
        let exponent = (candidate.attempts - 1).min(MAX_BACKOFF_EXPONENT) as u32;
        let delay = backoff.saturating_mul(1 << exponent).mul_f64(rng.gen_range(JITTER_LOW..=JITTER_HIGH));
        let next_attempt = now + delay;
        let at = self.backoff.partition_point(|entry| entry.next_attempt <= next_attempt);
        self.backoff.insert(at, BackoffEntry { candidate, next_attempt });
        Some(FailedAttempt::RetryScheduled)
    }

    /// Move every ripe backoff entry back into the table, preserving its
    /// attempt count. Entries that find the table full are dropped.
    pub(crate) fn promote_ripe(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        loop {
            match self.backoff.front() {
                Some(entry) if entry.next_attempt <= now => {}
                _ => break,
            }
            let Some(entry) = self.backoff.pop_front() else { break };
            if self.active.len() >= self.max {
                debug!("autorelay: dropping backoff candidate {}: candidate table is full", entry.candidate.info.peer);
                continue;
            }
            self.active.insert(entry.candidate.info.peer, entry.candidate);
            promoted += 1;
        }
        promoted
    }

    #[cfg(test)]
    fn backoff_schedule(&self) -> Vec<(PeerId, Instant)> {
        self.backoff.iter().map(|entry| (entry.candidate.info.peer, entry.next_attempt)).collect()
    }
}
