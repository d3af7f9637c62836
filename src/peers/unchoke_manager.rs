use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::prelude::*;
use crate::swarm::PeerId;

/// Simplified tit-for-tat. Each evaluation randomly draws up to four
/// interested peers as the fixed unchoke set plus one optimistic extra, so
/// every interested peer keeps a positive long-run chance of being served.
pub struct UnchokeManager {
    fixed_unchoked: HashSet<PeerId>,
    optimistic_unchoked: Option<PeerId>,
    rng: StdRng,
}

impl UnchokeManager {
    pub const MAX_FIXED_UNCHOKED: usize = 4;

    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic rotation for tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            fixed_unchoked: HashSet::new(),
            optimistic_unchoked: None,
            rng,
        }
    }

    /// Redraw the unchoke sets from the currently interested peers and
    /// return `(to_choke, to_unchoke)`: who lost the permission since the
    /// last evaluation and who newly gained it.
    pub fn evaluate_peers(&mut self, mut interested: Vec<PeerId>) -> (Vec<PeerId>, Vec<PeerId>) {
        interested.shuffle(&mut self.rng);

        let mut drawn = interested.into_iter();
        let new_fixed: HashSet<PeerId> = drawn.by_ref().take(Self::MAX_FIXED_UNCHOKED).collect();
        let new_optimistic = drawn.next();

        let old_unchoked = self.currently_unchoked();
        let new_unchoked: HashSet<PeerId> = new_fixed
            .iter()
            .chain(new_optimistic.iter())
            .cloned()
            .collect();

        let to_unchoke: Vec<PeerId> = new_unchoked.difference(&old_unchoked).cloned().collect();
        let to_choke: Vec<PeerId> = old_unchoked.difference(&new_unchoked).cloned().collect();

        self.fixed_unchoked = new_fixed;
        self.optimistic_unchoked = new_optimistic;

        if !to_choke.is_empty() || !to_unchoke.is_empty() {
            debug!(
                "unchoke rotation: fixed {:?}, optimistic {:?}",
                self.fixed_unchoked, self.optimistic_unchoked
            );
        }

        (to_choke, to_unchoke)
    }

    pub fn is_unchoked(&self, peer_id: &PeerId) -> bool {
        self.fixed_unchoked.contains(peer_id) || self.optimistic_unchoked.as_ref() == Some(peer_id)
    }

    /// Drop a departed peer from both sets without waiting for the next
    /// evaluation.
    pub fn forget_peer(&mut self, peer_id: &PeerId) {
        self.fixed_unchoked.remove(peer_id);
        if self.optimistic_unchoked.as_ref() == Some(peer_id) {
            self.optimistic_unchoked = None;
        }
    }

    fn currently_unchoked(&self) -> HashSet<PeerId> {
        self.fixed_unchoked
            .iter()
            .chain(self.optimistic_unchoked.iter())
            .cloned()
            .collect()
    }
}

impl Default for UnchokeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn swarm_of(n: usize) -> Vec<PeerId> {
        (0..n)
            .map(|i| PeerId::new(format!("MB-peer{i:06}")))
            .collect()
    }

    #[test]
    fn test_cardinality_and_disjointness_invariants() {
        let mut manager = UnchokeManager::seeded(7);

        for round in 0..20 {
            manager.evaluate_peers(swarm_of(round % 9));

            assert!(manager.fixed_unchoked.len() <= UnchokeManager::MAX_FIXED_UNCHOKED);
            if let Some(optimistic) = &manager.optimistic_unchoked {
                assert!(!manager.fixed_unchoked.contains(optimistic));
            }
        }
    }

    #[test]
    fn test_returned_diffs_obey_the_set_algebra() {
        let mut manager = UnchokeManager::seeded(11);
        let peers = swarm_of(8);

        let (_, first_unchoked) = manager.evaluate_peers(peers.clone());
        let old_unchoked: HashSet<PeerId> = first_unchoked.into_iter().collect();

        let (to_choke, to_unchoke) = manager.evaluate_peers(peers);

        let choked: HashSet<PeerId> = to_choke.iter().cloned().collect();
        let unchoked: HashSet<PeerId> = to_unchoke.iter().cloned().collect();
        assert!(choked.is_disjoint(&unchoked));

        // new = (old ∪ to_unchoke) \ to_choke
        let expected: HashSet<PeerId> = old_unchoked
            .union(&unchoked)
            .filter(|peer| !choked.contains(*peer))
            .cloned()
            .collect();
        assert_eq!(manager.currently_unchoked(), expected);
    }

    #[test]
    fn test_no_interested_peers_clears_the_sets() {
        let mut manager = UnchokeManager::seeded(3);

        // a fresh manager stays empty and reports no transitions
        let (to_choke, to_unchoke) = manager.evaluate_peers(Vec::new());
        assert!(to_choke.is_empty());
        assert!(to_unchoke.is_empty());
        assert!(manager.currently_unchoked().is_empty());

        // a populated manager chokes everyone it had unchoked
        let (_, granted) = manager.evaluate_peers(swarm_of(3));
        assert_eq!(granted.len(), 3);

        let (to_choke, to_unchoke) = manager.evaluate_peers(Vec::new());
        assert_eq!(to_choke.len(), 3);
        assert!(to_unchoke.is_empty());
        assert!(manager.currently_unchoked().is_empty());
    }

    #[test]
    fn test_fewer_than_five_interested_peers_are_all_unchoked() {
        let mut manager = UnchokeManager::seeded(5);
        let peers = swarm_of(4);

        let (to_choke, to_unchoke) = manager.evaluate_peers(peers.clone());
        assert!(to_choke.is_empty());
        assert_eq!(to_unchoke.len(), peers.len());
        assert!(peers.iter().all(|peer| manager.is_unchoked(peer)));
        assert!(manager.optimistic_unchoked.is_none());
    }

    #[test]
    fn test_forget_peer_revokes_the_grant() {
        let mut manager = UnchokeManager::seeded(13);
        let peers = swarm_of(6);
        manager.evaluate_peers(peers.clone());

        let granted: Vec<PeerId> = peers
            .iter()
            .filter(|peer| manager.is_unchoked(peer))
            .cloned()
            .collect();
        assert_eq!(granted.len(), 5);

        for peer in &granted {
            manager.forget_peer(peer);
            assert!(!manager.is_unchoked(peer));
        }
        assert!(manager.currently_unchoked().is_empty());
    }

    #[test]
    fn test_rotation_eventually_reaches_every_peer() {
        let mut manager = UnchokeManager::seeded(42);
        let peers = swarm_of(10);

        let mut ever_unchoked: HashSet<PeerId> = HashSet::new();
        for _ in 0..100 {
            manager.evaluate_peers(peers.clone());
            ever_unchoked.extend(peers.iter().filter(|p| manager.is_unchoked(p)).cloned());
        }

        // 5 of 10 slots drawn uniformly per cycle: a peer left out of all 100
        // cycles would be a (1/2)^100 event
        assert_eq!(ever_unchoked.len(), peers.len());
    }
}
