//! Kademlia-style routing table with peer health and protocol cache
//!
//! The table owns three things: bucketed peer membership, per-peer health
//! scoring with quarantine, and the cached set of protocols each peer is
//! known to speak. Election and submission routing read all three; only
//! the table mutates them.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::message::WES_PROTOCOL_PREFIX;
use crate::peer::PeerId;
use crate::transport::ProtocolProbe;

/// Lower bound of the health score range.
pub const SCORE_MIN: i32 = -10;
/// Upper bound of the health score range.
pub const SCORE_MAX: i32 = 10;
/// Scores at or below this trigger quarantine.
const QUARANTINE_SCORE: i32 = -4;
/// First quarantine duration; doubles on every repeat.
const QUARANTINE_BASE: Duration = Duration::from_secs(60);
/// Quarantine duration ceiling.
const QUARANTINE_MAX: Duration = Duration::from_secs(30 * 60);
/// Health scores decay toward zero by one point per this interval.
const DECAY_INTERVAL: Duration = Duration::from_secs(60);
/// Maximum peers kept per bucket.
const K_BUCKET_SIZE: usize = 20;
const BUCKET_COUNT: usize = 256;

/// Coarse health classification of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Score >= 0
    Healthy,
    /// Score in [-3, -1]
    Suspect,
    /// Excluded from routing until the quarantine expires
    Quarantined,
}

/// Health bookkeeping for one peer.
#[derive(Debug, Clone)]
pub struct PeerHealth {
    /// Signed score in [SCORE_MIN, SCORE_MAX]
    pub score: i32,
    /// Last successful interaction
    pub last_success: Option<Instant>,
    /// Last failed interaction
    pub last_failure: Option<Instant>,
    /// End of the active quarantine, if any
    pub quarantine_until: Option<Instant>,
    /// How many times this peer has been quarantined; drives doubling
    quarantine_streak: u32,
    /// Last time decay was applied
    last_decay: Instant,
}

impl PeerHealth {
    fn new(now: Instant) -> Self {
        Self {
            score: 0,
            last_success: None,
            last_failure: None,
            quarantine_until: None,
            quarantine_streak: 0,
            last_decay: now,
        }
    }

    /// Applies score decay and quarantine expiry.
    fn refresh(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_decay);
        let steps = (elapsed.as_secs() / DECAY_INTERVAL.as_secs()) as i32;
        if steps > 0 {
            if self.score > 0 {
                self.score = (self.score - steps).max(0);
            } else if self.score < 0 {
                self.score = (self.score + steps).min(0);
            }
            self.last_decay += DECAY_INTERVAL * steps as u32;
        }

        if let Some(until) = self.quarantine_until {
            if until <= now {
                self.quarantine_until = None;
                // Re-enter routing as Suspect so one success heals.
                if self.score <= QUARANTINE_SCORE {
                    self.score = QUARANTINE_SCORE + 1;
                }
            }
        }
    }

    fn state(&self, now: Instant) -> HealthState {
        if let Some(until) = self.quarantine_until {
            if until > now {
                return HealthState::Quarantined;
            }
        }
        if self.score >= 0 {
            HealthState::Healthy
        } else {
            HealthState::Suspect
        }
    }

    fn record_success(&mut self, now: Instant) {
        self.refresh(now);
        self.last_success = Some(now);
        if self.score < 0 && self.score > QUARANTINE_SCORE {
            // One success lifts a Suspect peer back to Healthy.
            self.score = 0;
        } else {
            self.score = (self.score + 1).min(SCORE_MAX);
        }
    }

    /// Returns the quarantine duration when this failure tips the peer over.
    fn record_failure(&mut self, now: Instant) -> Option<Duration> {
        self.refresh(now);
        self.last_failure = Some(now);
        self.score = (self.score - 1).max(SCORE_MIN);
        if self.score <= QUARANTINE_SCORE && self.quarantine_until.is_none() {
            Some(self.start_quarantine(now))
        } else {
            None
        }
    }

    fn start_quarantine(&mut self, now: Instant) -> Duration {
        let exponent = self.quarantine_streak.min(5);
        let duration = QUARANTINE_BASE
            .saturating_mul(1u32 << exponent)
            .min(QUARANTINE_MAX);
        self.quarantine_streak += 1;
        self.quarantine_until = Some(now + duration);
        duration
    }
}

/// What a peer turned out to be when it failed a protocol check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    /// Speaks at least one WES protocol
    Wes,
    /// Speaks only foreign libp2p protocols
    External,
    /// Protocol set never learned
    Unknown,
}

/// Result of [`RoutingTable::quarantine_with_analysis`].
#[derive(Debug, Clone)]
pub struct PeerAnalysis {
    /// Classification of the peer
    pub peer_type: PeerType,
    /// Human-readable incompatibility description
    pub incompatible_reason: String,
}

/// Cached answer for a protocol-support lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolSupport {
    /// Cache says the peer speaks the protocol
    Supported,
    /// Cache says the peer does not speak the protocol
    Unsupported,
    /// The peer's protocol set has never been learned
    Unknown,
}

/// XOR-closest peer lookup with health scoring.
pub struct RoutingTable {
    local: PeerId,
    buckets: RwLock<Vec<Vec<PeerId>>>,
    health: RwLock<HashMap<PeerId, PeerHealth>>,
    protocols: RwLock<HashMap<PeerId, HashSet<String>>>,
}

impl RoutingTable {
    /// Creates a table around the local peer id.
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            buckets: RwLock::new(vec![Vec::new(); BUCKET_COUNT]),
            health: RwLock::new(HashMap::new()),
            protocols: RwLock::new(HashMap::new()),
        }
    }

    /// The local peer id this table is centered on.
    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }

    /// Adds a peer to its bucket. No-op for the local peer, duplicates,
    /// and full buckets.
    pub fn insert_peer(&self, peer: PeerId) {
        let Some(index) = bucket_index(&self.local, &peer) else {
            return;
        };
        let mut buckets = self.buckets.write();
        let bucket = &mut buckets[index];
        if bucket.contains(&peer) {
            return;
        }
        if bucket.len() >= K_BUCKET_SIZE {
            debug!(peer = %peer.short_hex(), bucket = index, "bucket full, peer not inserted");
            return;
        }
        bucket.push(peer);
    }

    /// Adds a peer together with its advertised protocol set.
    pub fn insert_peer_with_protocols(&self, peer: PeerId, protocols: Vec<String>) {
        self.insert_peer(peer);
        self.set_protocols(peer, protocols);
    }

    /// Hard eviction: membership, health and protocol cache.
    pub fn remove_peer(&self, peer: &PeerId) {
        if let Some(index) = bucket_index(&self.local, peer) {
            self.buckets.write()[index].retain(|p| p != peer);
        }
        self.health.write().remove(peer);
        self.protocols.write().remove(peer);
    }

    /// Whether a peer is present (bucket membership or the local peer).
    pub fn contains(&self, peer: &PeerId) -> bool {
        if *peer == self.local {
            return true;
        }
        match bucket_index(&self.local, peer) {
            Some(index) => self.buckets.read()[index].contains(peer),
            None => false,
        }
    }

    /// All known remote peers.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.buckets.read().iter().flatten().copied().collect()
    }

    /// Number of known remote peers.
    pub fn len(&self) -> usize {
        self.buckets.read().iter().map(|b| b.len()).sum()
    }

    /// Whether the table has no remote peers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k` closest non-quarantined peers to `key`, ascending by XOR
    /// distance, ties broken by lexicographic peer id. The local peer is a
    /// candidate like any other.
    pub fn find_closest_peers(&self, key: &[u8; 32], k: usize) -> Vec<PeerId> {
        let now = Instant::now();
        let health = self.health.read();
        let mut candidates: Vec<PeerId> = self
            .buckets
            .read()
            .iter()
            .flatten()
            .copied()
            .filter(|peer| {
                health
                    .get(peer)
                    .map(|h| h.state(now) != HealthState::Quarantined)
                    .unwrap_or(true)
            })
            .collect();
        candidates.push(self.local);
        drop(health);

        candidates.sort_by(|a, b| {
            a.distance(key)
                .cmp(&b.distance(key))
                .then_with(|| a.cmp(b))
        });
        candidates.truncate(k);
        candidates
    }

    /// Credits a successful interaction.
    pub fn record_peer_success(&self, peer: PeerId) {
        let now = Instant::now();
        let mut health = self.health.write();
        health
            .entry(peer)
            .or_insert_with(|| PeerHealth::new(now))
            .record_success(now);
    }

    /// Debits a failed interaction; quarantines after repeated failures.
    pub fn record_peer_failure(&self, peer: PeerId) {
        let now = Instant::now();
        let mut health = self.health.write();
        let entry = health.entry(peer).or_insert_with(|| PeerHealth::new(now));
        if let Some(duration) = entry.record_failure(now) {
            warn!(
                peer = %peer.short_hex(),
                secs = duration.as_secs(),
                "peer quarantined after repeated failures"
            );
        }
    }

    /// Current health classification; unknown peers count as Healthy.
    pub fn health_state(&self, peer: &PeerId) -> HealthState {
        let now = Instant::now();
        self.health
            .read()
            .get(peer)
            .map(|h| h.state(now))
            .unwrap_or(HealthState::Healthy)
    }

    /// Replaces the cached protocol set for a peer.
    pub fn set_protocols(&self, peer: PeerId, protocols: Vec<String>) {
        self.protocols
            .write()
            .insert(peer, protocols.into_iter().collect());
    }

    /// Fast path: answers from the cache only.
    pub fn supports_protocol(&self, peer: &PeerId, protocol_id: &str) -> ProtocolSupport {
        if *peer == self.local {
            return ProtocolSupport::Supported;
        }
        match self.protocols.read().get(peer) {
            Some(set) if set.contains(protocol_id) => ProtocolSupport::Supported,
            Some(_) => ProtocolSupport::Unsupported,
            None => ProtocolSupport::Unknown,
        }
    }

    /// Slow path: interrogates the peer once, updates the cache, answers.
    ///
    /// Probe failures only affect health scoring; the answer is then
    /// "not supported".
    pub async fn supports_protocol_with_refresh(
        &self,
        peer: PeerId,
        protocol_id: &str,
        probe: &dyn ProtocolProbe,
    ) -> bool {
        if peer == self.local {
            return true;
        }
        match probe.probe(peer).await {
            Ok(protocols) => {
                let supported = protocols.iter().any(|p| p == protocol_id);
                self.set_protocols(peer, protocols);
                supported
            }
            Err(e) => {
                debug!(peer = %peer.short_hex(), error = %e, "protocol probe failed");
                self.record_peer_failure(peer);
                false
            }
        }
    }

    /// Classifies a peer that failed a protocol check and quarantines it.
    pub fn quarantine_with_analysis(&self, peer: PeerId, protocol_id: &str) -> PeerAnalysis {
        let analysis = {
            let protocols = self.protocols.read();
            match protocols.get(&peer) {
                None => PeerAnalysis {
                    peer_type: PeerType::Unknown,
                    incompatible_reason: format!(
                        "protocol set never learned, {} unavailable",
                        protocol_id
                    ),
                },
                Some(set) if set.iter().any(|p| p.starts_with(WES_PROTOCOL_PREFIX)) => {
                    PeerAnalysis {
                        peer_type: PeerType::Wes,
                        incompatible_reason: format!(
                            "WES peer without {} (version mismatch)",
                            protocol_id
                        ),
                    }
                }
                Some(_) => PeerAnalysis {
                    peer_type: PeerType::External,
                    incompatible_reason: format!(
                        "external libp2p peer, no {} support",
                        WES_PROTOCOL_PREFIX
                    ),
                },
            }
        };

        let now = Instant::now();
        let mut health = self.health.write();
        let entry = health.entry(peer).or_insert_with(|| PeerHealth::new(now));
        entry.refresh(now);
        entry.score = entry.score.min(QUARANTINE_SCORE);
        let duration = entry.start_quarantine(now);
        warn!(
            peer = %peer.short_hex(),
            peer_type = ?analysis.peer_type,
            secs = duration.as_secs(),
            reason = %analysis.incompatible_reason,
            "incompatible peer quarantined"
        );
        analysis
    }

    /// Applies score decay and quarantine expiry to every health entry.
    /// Driven by a periodic task in the node.
    pub fn decay_health(&self) {
        let now = Instant::now();
        for entry in self.health.write().values_mut() {
            entry.refresh(now);
        }
    }
}

/// Kademlia bucket index for `peer` relative to `local`; `None` for the
/// local peer itself.
fn bucket_index(local: &PeerId, peer: &PeerId) -> Option<usize> {
    let distance = local.distance(peer.as_bytes());
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = i * 8 + byte.leading_zeros() as usize;
            return Some(BUCKET_COUNT - 1 - leading);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn peer(tag: u8) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[31] = tag;
        PeerId::from_bytes(bytes)
    }

    #[test]
    fn test_insert_and_contains() {
        let table = RoutingTable::new(peer(0));
        table.insert_peer(peer(1));
        assert!(table.contains(&peer(1)));
        assert!(table.contains(&peer(0))); // local
        assert!(!table.contains(&peer(2)));

        table.remove_peer(&peer(1));
        assert!(!table.contains(&peer(1)));
    }

    #[test]
    fn test_local_peer_not_bucketed() {
        let table = RoutingTable::new(peer(0));
        table.insert_peer(peer(0));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_find_closest_orders_by_distance() {
        let table = RoutingTable::new(peer(0));
        for tag in [1u8, 2, 4, 8] {
            table.insert_peer(peer(tag));
        }
        // Key equal to peer(2): distances are 3, 0, 6, 10, local 2.
        let closest = table.find_closest_peers(peer(2).as_bytes(), 3);
        assert_eq!(closest, vec![peer(2), peer(0), peer(1)]);
    }

    #[test]
    fn test_quarantined_peer_excluded_from_lookup() {
        let table = RoutingTable::new(peer(0));
        table.insert_peer(peer(1));
        table.insert_peer(peer(2));

        // Five consecutive failures push peer(1) into quarantine.
        for _ in 0..5 {
            table.record_peer_failure(peer(1));
        }
        assert_eq!(table.health_state(&peer(1)), HealthState::Quarantined);

        let closest = table.find_closest_peers(peer(1).as_bytes(), 10);
        assert!(!closest.contains(&peer(1)));
        assert!(closest.contains(&peer(2)));
    }

    #[test]
    fn test_one_success_heals_suspect() {
        let table = RoutingTable::new(peer(0));
        table.insert_peer(peer(1));
        table.record_peer_failure(peer(1));
        assert_eq!(table.health_state(&peer(1)), HealthState::Suspect);
        table.record_peer_success(peer(1));
        assert_eq!(table.health_state(&peer(1)), HealthState::Healthy);
    }

    #[test]
    fn test_protocol_cache_states() {
        let table = RoutingTable::new(peer(0));
        let target = peer(1);
        assert_eq!(
            table.supports_protocol(&target, "/weisyn/consensus/block_submission/1.0.0"),
            ProtocolSupport::Unknown
        );
        table.set_protocols(target, vec!["/other/1.0.0".to_string()]);
        assert_eq!(
            table.supports_protocol(&target, "/weisyn/consensus/block_submission/1.0.0"),
            ProtocolSupport::Unsupported
        );
        table.set_protocols(
            target,
            vec!["/weisyn/consensus/block_submission/1.0.0".to_string()],
        );
        assert_eq!(
            table.supports_protocol(&target, "/weisyn/consensus/block_submission/1.0.0"),
            ProtocolSupport::Supported
        );
        // Local always supports.
        assert_eq!(
            table.supports_protocol(&peer(0), "/weisyn/consensus/block_submission/1.0.0"),
            ProtocolSupport::Supported
        );
    }

    #[test]
    fn test_quarantine_with_analysis_classification() {
        let table = RoutingTable::new(peer(0));
        let wes = peer(1);
        let external = peer(2);
        let unknown = peer(3);
        table.set_protocols(wes, vec!["/weisyn/consensus/heartbeat/1.0.0".to_string()]);
        table.set_protocols(external, vec!["/ipfs/id/1.0.0".to_string()]);

        let proto = "/weisyn/consensus/block_submission/1.0.0";
        assert_eq!(
            table.quarantine_with_analysis(wes, proto).peer_type,
            PeerType::Wes
        );
        assert_eq!(
            table.quarantine_with_analysis(external, proto).peer_type,
            PeerType::External
        );
        assert_eq!(
            table.quarantine_with_analysis(unknown, proto).peer_type,
            PeerType::Unknown
        );
        for p in [wes, external, unknown] {
            assert_eq!(table.health_state(&p), HealthState::Quarantined);
        }
    }

    #[test]
    fn test_probe_refresh_updates_cache() {
        struct FixedProbe(Vec<String>);
        impl ProtocolProbe for FixedProbe {
            fn probe(
                &self,
                _peer: PeerId,
            ) -> futures::future::BoxFuture<'_, crate::error::NetworkResult<Vec<String>>>
            {
                let protocols = self.0.clone();
                async move { Ok(protocols) }.boxed()
            }
        }

        let table = RoutingTable::new(peer(0));
        let target = peer(1);
        let proto = "/weisyn/consensus/block_submission/1.0.0";
        let probe = FixedProbe(vec![proto.to_string()]);

        let supported = futures::executor::block_on(
            table.supports_protocol_with_refresh(target, proto, &probe),
        );
        assert!(supported);
        assert_eq!(
            table.supports_protocol(&target, proto),
            ProtocolSupport::Supported
        );
    }
}
