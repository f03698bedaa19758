// src/watchdog/membership.rs

//! Membership revocation/restoration and the quorum formula (spec §4.3).
//!
//! Grounded on `spineldb::core::cluster::state::ClusterState::count_online_masters`
//! / `promote_pfail_to_fail` for the shape of "count active peers, compare
//! against a computed threshold."

use std::time::{Duration, Instant};

use crate::watchdog::node::{MembershipStatus, NodeLostReason, QuorumStatus, WatchdogNode};

/// `min_remote_for_quorum` as defined in spec §4.3: `R/2` if `R` is even,
/// else `(R-1)/2`, where `R = member_remote_count`.
pub fn min_remote_for_quorum(member_remote_count: u32) -> u32 {
    if member_remote_count % 2 == 0 {
        member_remote_count / 2
    } else {
        (member_remote_count - 1) / 2
    }
}

/// Consensus threshold: `min_remote_for_quorum + 1`, plus one more if the
/// total cluster size (local + all configured remotes, not just active ones)
/// is even and half-vote consensus is disabled.
///
/// Open Question (spec §9) resolved as documented in `DESIGN.md`: the local
/// node implicitly contributes one vote towards this threshold, so a
/// `FailoverObject.request_count` of `consensus_threshold - 1` external
/// requesters plus our own implicit vote reaches consensus.
pub fn consensus_threshold(
    member_remote_count: u32,
    total_cluster_size: u32,
    enable_consensus_with_half_votes: bool,
) -> u32 {
    let base = min_remote_for_quorum(member_remote_count) + 1;
    if total_cluster_size % 2 == 0 && !enable_consensus_with_half_votes {
        base + 1
    } else {
        base
    }
}

/// Computes the new quorum status given how many remotes count as standbys
/// (i.e. are ACTIVE and known reachable) against the total remote count.
pub fn compute_quorum_status(
    standby_count: u32,
    member_remote_count: u32,
    enable_consensus_with_half_votes: bool,
    total_nodes_odd: bool,
) -> QuorumStatus {
    let min_for_quorum = min_remote_for_quorum(member_remote_count);
    if standby_count > min_for_quorum {
        QuorumStatus::Present
    } else if standby_count == min_for_quorum {
        if enable_consensus_with_half_votes && total_nodes_odd {
            QuorumStatus::Edge
        } else {
            QuorumStatus::Lost
        }
    } else {
        QuorumStatus::Lost
    }
}

/// Counts remotes with `membership_status == Active` (spec §3/P3).
pub fn member_remote_count(remotes: &[WatchdogNode]) -> u32 {
    remotes
        .iter()
        .filter(|n| n.membership_status == MembershipStatus::Active)
        .count() as u32
}

/// Applies revocation rules (spec §4.3) to one remote node, given the
/// membership-timeout configuration. Returns `true` if the node's membership
/// status changed.
pub fn apply_revocation_rules(
    node: &mut WatchdogNode,
    now: Instant,
    no_show_timeout: Duration,
    lost_timeout: Duration,
) -> bool {
    if node.membership_status != MembershipStatus::Active {
        return false;
    }

    if let Some(dead_since) = node.dead_since_startup {
        if now.duration_since(dead_since) >= no_show_timeout {
            node.membership_status = MembershipStatus::RevokedNoShow;
            return true;
        }
    }

    if let Some(lost_time) = node.lost_time {
        if matches!(node.node_lost_reason, Some(NodeLostReason::NoBeacon))
            || node.node_lost_reason == Some(NodeLostReason::SocketClosed)
        {
            if now.duration_since(lost_time) >= lost_timeout {
                node.membership_status = MembershipStatus::RevokedLost;
                return true;
            }
        }
    }

    false
}

/// `INFORM_I_AM_GOING_DOWN` revokes membership immediately, iff configured.
pub fn revoke_on_shutdown_notice(node: &mut WatchdogNode, wd_remove_shutdown_nodes: bool) {
    if wd_remove_shutdown_nodes && node.membership_status == MembershipStatus::Active {
        node.membership_status = MembershipStatus::RevokedShutdown;
    }
}

/// A valid `ADD_NODE` from a previously-revoked peer restores it to ACTIVE.
pub fn restore_on_add_node(node: &mut WatchdogNode) {
    node.membership_status = MembershipStatus::Active;
    node.dead_since_startup = None;
    node.lost_time = None;
    node.node_lost_reason = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_remote_for_quorum_matches_spec_examples() {
        assert_eq!(min_remote_for_quorum(4), 2);
        assert_eq!(min_remote_for_quorum(3), 1);
        assert_eq!(min_remote_for_quorum(0), 0);
        assert_eq!(min_remote_for_quorum(1), 0);
    }

    #[test]
    fn quorum_lost_when_at_exactly_half_without_half_vote_consensus() {
        // 4-node cluster (1 local + 3 remote is odd total; use the scenario-3
        // shape instead: 4 total nodes, R=3 remotes, 1 remaining after two
        // killed).
        let status = compute_quorum_status(1, 3, false, false);
        assert_eq!(status, QuorumStatus::Lost);
    }

    #[test]
    fn quorum_edge_requires_both_half_vote_consensus_and_odd_total() {
        let status = compute_quorum_status(1, 2, true, true);
        assert_eq!(status, QuorumStatus::Edge);
        let status_even_total = compute_quorum_status(1, 2, true, false);
        assert_eq!(status_even_total, QuorumStatus::Lost);
    }

    #[test]
    fn consensus_threshold_adds_extra_vote_for_even_cluster_without_half_votes() {
        // 3-node cluster (spec scenario 4): 1 local + 2 remote, total=3 (odd).
        assert_eq!(consensus_threshold(2, 3, false), 2);
        // 4-node cluster, even total, half-votes disabled -> +1.
        assert_eq!(consensus_threshold(3, 4, false), 3);
        // Same, but half-votes enabled -> no extra vote.
        assert_eq!(consensus_threshold(3, 4, true), 2);
    }

    proptest::proptest! {
        #[test]
        fn min_remote_for_quorum_never_exceeds_half_of_members(r in 0u32..10_000) {
            let min_for_quorum = min_remote_for_quorum(r);
            proptest::prop_assert!(min_for_quorum * 2 <= r);
        }

        #[test]
        fn consensus_threshold_always_exceeds_min_remote_for_quorum(
            r in 0u32..1_000,
            total in 0u32..1_000,
            half_votes in proptest::bool::ANY,
        ) {
            let threshold = consensus_threshold(r, total, half_votes);
            proptest::prop_assert!(threshold > min_remote_for_quorum(r));
        }
    }
}
