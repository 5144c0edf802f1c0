/// Failover consensus engine
///
/// Only the coordinator runs this. Each distinct failover request
/// (kind + sorted node list) accumulates votes from reporting peers
/// until the minimum is reached, the 15 second deadline passes, or
/// the coordinator loses its seat.
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::failover::ArbiterVerdict;
use crate::registry::{NodeOpFlags, NodeOpKind};

/// How long a failover object may wait for consensus
pub const FAILOVER_COMMAND_FINISH_TIMEOUT: Duration = Duration::from_secs(15);

/// Voter identity: a remote peer or this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voter {
    Local,
    Peer(usize),
}

/// Policy knobs for the consensus rounds
#[derive(Debug, Clone)]
pub struct ConsensusSettings {
    /// Failover only executes while quorum holds
    pub failover_when_quorum_exists: bool,
    /// Failover needs a majority of votes, not just one report
    pub failover_require_consensus: bool,
    /// The same node may vote repeatedly for the same failover
    pub allow_multiple_failover_requests_from_node: bool,
    /// Even-sized clusters may decide on exactly half the votes
    pub enable_consensus_with_half_votes: bool,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            failover_when_quorum_exists: true,
            failover_require_consensus: true,
            allow_multiple_failover_requests_from_node: false,
            enable_consensus_with_half_votes: false,
        }
    }
}

/// Per-request vote accumulator
#[derive(Debug, Clone)]
pub struct FailoverObject {
    pub kind: NodeOpKind,
    pub nodes: Vec<usize>,
    pub voters: Vec<Voter>,
    pub vote_count: usize,
    pub started: Instant,
    pub flags: NodeOpFlags,
}

/// The engine owning all in-flight failover objects
pub struct ConsensusEngine {
    settings: ConsensusSettings,
    /// Total watchdog nodes in the cluster, this node included
    cluster_size: usize,
    objects: Vec<FailoverObject>,
}

impl ConsensusEngine {
    pub fn new(settings: ConsensusSettings, cluster_size: usize) -> Self {
        Self {
            settings,
            cluster_size,
            objects: Vec::new(),
        }
    }

    /// Minimum votes needed to carry a failover. For an even-sized
    /// cluster the half-votes policy decides between N/2 and N/2+1;
    /// odd clusters always need (N+1)/2.
    pub fn minimum_votes(&self) -> usize {
        let remote = self.cluster_size.saturating_sub(1);
        let mut required = remote_nodes_required_for_quorum(self.cluster_size) + 1;
        if remote % 2 != 0 && !self.settings.enable_consensus_with_half_votes {
            required += 1;
        }
        required
    }

    /// Record a vote and decide what happens to the request
    pub fn submit(
        &mut self,
        kind: NodeOpKind,
        nodes: &[usize],
        flags: NodeOpFlags,
        voter: Voter,
        quorum_holds: bool,
        now: Instant,
    ) -> ArbiterVerdict {
        if !self.settings.failover_when_quorum_exists {
            return ArbiterVerdict::Proceed;
        }
        if flags.confirmed {
            // Pre-confirmed requests bypass the voting round
            return ArbiterVerdict::Proceed;
        }
        if !quorum_holds {
            return ArbiterVerdict::NoQuorum;
        }
        if !self.settings.failover_require_consensus {
            return ArbiterVerdict::Proceed;
        }

        let mut sorted = nodes.to_vec();
        sorted.sort_unstable();

        let minimum = self.minimum_votes();
        let cluster_size = self.cluster_size;
        let allow_multiple = self.settings.allow_multiple_failover_requests_from_node;

        let index = match self
            .objects
            .iter()
            .position(|o| o.kind == kind && o.nodes == sorted)
        {
            Some(index) => index,
            None => {
                self.objects.push(FailoverObject {
                    kind,
                    nodes: sorted,
                    voters: Vec::new(),
                    vote_count: 0,
                    started: now,
                    flags,
                });
                self.objects.len() - 1
            }
        };
        let object = &mut self.objects[index];

        let duplicate = object.voters.contains(&voter);
        if duplicate {
            if allow_multiple {
                // The vote count can never exceed the node count
                object.vote_count = (object.vote_count + 1).min(cluster_size);
            } else if object.vote_count < minimum {
                debug!(?kind, nodes = ?object.nodes, "duplicate failover vote ignored");
                return ArbiterVerdict::ConsensusMayFail;
            }
        } else {
            object.voters.push(voter);
            object.vote_count += 1;
        }

        if object.vote_count >= minimum {
            info!(
                ?kind,
                nodes = ?object.nodes,
                votes = object.vote_count,
                "consensus reached for failover"
            );
            self.objects.remove(index);
            ArbiterVerdict::Proceed
        } else {
            debug!(
                ?kind,
                votes = object.vote_count,
                needed = minimum,
                "failover vote recorded, waiting for consensus"
            );
            ArbiterVerdict::BuildingConsensus
        }
    }

    /// Retire objects older than the failover deadline
    pub fn sweep(&mut self, now: Instant) -> Vec<FailoverObject> {
        let mut expired = Vec::new();
        self.objects.retain(|o| {
            if now.duration_since(o.started) >= FAILOVER_COMMAND_FINISH_TIMEOUT {
                expired.push(o.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Forget everything; called when coordinatorship is lost
    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.objects.len()
    }

    pub fn set_cluster_size(&mut self, cluster_size: usize) {
        self.cluster_size = cluster_size;
    }
}

/// Remote nodes needed for quorum: remote/2 when the total cluster is
/// odd, (remote-1)/2 when it is even
pub fn remote_nodes_required_for_quorum(cluster_size: usize) -> usize {
    let remote = cluster_size.saturating_sub(1);
    if remote % 2 == 0 {
        remote / 2
    } else {
        remote.saturating_sub(1) / 2
    }
}

/// Quorum status from the coordinator's connected standby count:
/// 1 = held, 0 = held on the edge (even cluster at exactly half with
/// the half-votes policy), -1 = lost
pub fn quorum_status(
    cluster_size: usize,
    standby_count: usize,
    enable_consensus_with_half_votes: bool,
) -> i32 {
    let required = remote_nodes_required_for_quorum(cluster_size);
    let remote = cluster_size.saturating_sub(1);
    if standby_count > required {
        1
    } else if standby_count == required {
        if remote % 2 != 0 {
            if enable_consensus_with_half_votes {
                0
            } else {
                -1
            }
        } else {
            1
        }
    } else {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(cluster_size: usize) -> ConsensusEngine {
        ConsensusEngine::new(ConsensusSettings::default(), cluster_size)
    }

    #[test]
    fn test_minimum_votes_table() {
        // Odd clusters: (N+1)/2
        assert_eq!(engine(3).minimum_votes(), 2);
        assert_eq!(engine(5).minimum_votes(), 3);

        // Even clusters: N/2+1 by default, N/2 with half votes
        assert_eq!(engine(4).minimum_votes(), 3);
        let half = ConsensusEngine::new(
            ConsensusSettings {
                enable_consensus_with_half_votes: true,
                ..Default::default()
            },
            4,
        );
        assert_eq!(half.minimum_votes(), 2);
    }

    #[test]
    fn test_five_node_consensus_builds_then_proceeds() {
        let mut e = engine(5);
        let now = Instant::now();
        let flags = NodeOpFlags::default();

        assert_eq!(
            e.submit(NodeOpKind::Down, &[2], flags, Voter::Local, true, now),
            ArbiterVerdict::BuildingConsensus
        );
        assert_eq!(
            e.submit(NodeOpKind::Down, &[2], flags, Voter::Peer(1), true, now),
            ArbiterVerdict::BuildingConsensus
        );
        assert_eq!(
            e.submit(NodeOpKind::Down, &[2], flags, Voter::Peer(2), true, now),
            ArbiterVerdict::Proceed
        );
        // The object is retired after the decision
        assert_eq!(e.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_vote_without_multi_vote_policy() {
        let mut e = engine(5);
        let now = Instant::now();
        let flags = NodeOpFlags::default();

        e.submit(NodeOpKind::Down, &[2], flags, Voter::Peer(1), true, now);
        assert_eq!(
            e.submit(NodeOpKind::Down, &[2], flags, Voter::Peer(1), true, now),
            ArbiterVerdict::ConsensusMayFail
        );
    }

    #[test]
    fn test_duplicate_votes_count_with_multi_vote_policy() {
        let mut e = ConsensusEngine::new(
            ConsensusSettings {
                allow_multiple_failover_requests_from_node: true,
                ..Default::default()
            },
            3,
        );
        let now = Instant::now();
        let flags = NodeOpFlags::default();

        assert_eq!(
            e.submit(NodeOpKind::Down, &[1], flags, Voter::Peer(0), true, now),
            ArbiterVerdict::BuildingConsensus
        );
        assert_eq!(
            e.submit(NodeOpKind::Down, &[1], flags, Voter::Peer(0), true, now),
            ArbiterVerdict::Proceed
        );
    }

    #[test]
    fn test_vote_count_never_exceeds_cluster_size() {
        let mut e = ConsensusEngine::new(
            ConsensusSettings {
                allow_multiple_failover_requests_from_node: true,
                failover_require_consensus: true,
                failover_when_quorum_exists: true,
                enable_consensus_with_half_votes: false,
            },
            3,
        );
        // Make the minimum unreachable so votes keep accumulating
        e.set_cluster_size(9);
        let now = Instant::now();
        let flags = NodeOpFlags::default();
        for _ in 0..20 {
            e.submit(NodeOpKind::Down, &[1], flags, Voter::Peer(0), true, now);
        }
        assert!(e.objects[0].vote_count <= 9);
    }

    #[test]
    fn test_no_quorum_blocks_request() {
        let mut e = engine(3);
        assert_eq!(
            e.submit(
                NodeOpKind::Down,
                &[1],
                NodeOpFlags::default(),
                Voter::Local,
                false,
                Instant::now()
            ),
            ArbiterVerdict::NoQuorum
        );
    }

    #[test]
    fn test_confirmed_flag_bypasses_voting() {
        let mut e = engine(5);
        let flags = NodeOpFlags {
            confirmed: true,
            ..Default::default()
        };
        assert_eq!(
            e.submit(NodeOpKind::Down, &[1], flags, Voter::Local, true, Instant::now()),
            ArbiterVerdict::Proceed
        );
    }

    #[test]
    fn test_quorum_not_required_policy() {
        let mut e = ConsensusEngine::new(
            ConsensusSettings {
                failover_when_quorum_exists: false,
                ..Default::default()
            },
            5,
        );
        assert_eq!(
            e.submit(
                NodeOpKind::Down,
                &[1],
                NodeOpFlags::default(),
                Voter::Local,
                false,
                Instant::now()
            ),
            ArbiterVerdict::Proceed
        );
    }

    #[test]
    fn test_node_list_order_does_not_split_votes() {
        let mut e = engine(5);
        let now = Instant::now();
        let flags = NodeOpFlags::default();

        e.submit(NodeOpKind::Down, &[2, 1], flags, Voter::Peer(1), true, now);
        e.submit(NodeOpKind::Down, &[1, 2], flags, Voter::Peer(2), true, now);
        assert_eq!(e.pending_count(), 1);
        assert_eq!(e.objects[0].vote_count, 2);
    }

    #[test]
    fn test_sweep_expires_stale_objects() {
        let mut e = engine(5);
        let now = Instant::now();
        e.submit(
            NodeOpKind::Down,
            &[1],
            NodeOpFlags::default(),
            Voter::Local,
            true,
            now,
        );

        assert!(e.sweep(now + Duration::from_secs(14)).is_empty());
        let expired = e.sweep(now + FAILOVER_COMMAND_FINISH_TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert_eq!(e.pending_count(), 0);
    }

    #[test]
    fn test_quorum_status_table() {
        // Three nodes: one standby holds quorum
        assert_eq!(quorum_status(3, 0, false), -1);
        assert_eq!(quorum_status(3, 1, false), 1);
        assert_eq!(quorum_status(3, 2, false), 1);

        // Two nodes: the lone peer is exactly half the cluster
        assert_eq!(quorum_status(2, 0, false), -1);
        assert_eq!(quorum_status(2, 1, false), 1);

        // Four nodes at the edge: policy decides
        assert_eq!(quorum_status(4, 1, false), -1);
        assert_eq!(quorum_status(4, 1, true), 0);
        assert_eq!(quorum_status(4, 2, false), 1);
    }
}
