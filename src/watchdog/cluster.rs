// src/watchdog/cluster.rs

//! `ClusterState`: the single owner of every node record, the leader
//! pointer, and the derived membership/quorum summary (spec §3).
//!
//! Grounded on `spineldb::core::cluster::state::ClusterState`, replacing its
//! `DashMap`-of-shared-nodes shape with a plain `Vec<WatchdogNode>` arena:
//! spec §5 mandates a single-threaded owner, so the concurrent map the
//! teacher needs for its multi-task gossip model is unnecessary here (see
//! the Open Question resolution in `DESIGN.md`).

use std::time::Instant;

use crate::config::WatchdogConfig;
use crate::watchdog::node::{NodeState, QuorumStatus, WatchdogNode};
use crate::watchdog::packet::{PacketType, ServiceMessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leader {
    Local,
    Remote(usize),
}

pub struct ClusterState {
    pub local: WatchdogNode,
    pub remote: Vec<WatchdogNode>,
    pub leader: Option<Leader>,
    pub standbys: std::collections::HashSet<usize>,
    pub quorum_status: QuorumStatus,
    pub holding_vip: bool,
    pub last_broadcast_service_msg: Option<(ServiceMessageKind, Instant)>,
    pub ipc_auth_required: bool,
    /// Random per-process shared key internal-only IPC requests must echo
    /// back (spec §4.7). Not the same as the peer `auth_key`.
    pub ipc_shared_key: u32,
}

impl ClusterState {
    pub fn new(config: &WatchdogConfig) -> Self {
        let local = WatchdogNode::from_config(config.local_node_id, config.local());
        let remote = config
            .remotes()
            .map(|(id, node_config)| WatchdogNode::from_config(id, node_config))
            .collect();

        Self {
            local,
            remote,
            leader: None,
            standbys: std::collections::HashSet::new(),
            quorum_status: QuorumStatus::Edge,
            holding_vip: false,
            last_broadcast_service_msg: None,
            ipc_auth_required: config.ipc_auth_required,
            ipc_shared_key: rand::random(),
        }
    }

    pub fn remote_mut(&mut self, node_id: usize) -> Option<&mut WatchdogNode> {
        self.remote.iter_mut().find(|n| n.node_id == node_id)
    }

    pub fn remote_ref(&self, node_id: usize) -> Option<&WatchdogNode> {
        self.remote.iter().find(|n| n.node_id == node_id)
    }

    pub fn total_cluster_size(&self) -> u32 {
        1 + self.remote.len() as u32
    }

    pub fn is_leader_local(&self) -> bool {
        self.leader == Some(Leader::Local)
    }

    /// Every node we currently have some kind of socket open with.
    pub fn reachable_remote_ids(&self) -> Vec<usize> {
        self.remote
            .iter()
            .filter(|n| n.is_reachable())
            .map(|n| n.node_id)
            .collect()
    }

    /// Suppresses a repeated broadcast of the same cluster-service sub-type
    /// within 5s (spec §4.6).
    pub fn should_suppress_broadcast(&self, kind: ServiceMessageKind, now: Instant) -> bool {
        match self.last_broadcast_service_msg {
            Some((last_kind, last_time)) if last_kind == kind => {
                now.duration_since(last_time) < std::time::Duration::from_secs(5)
            }
            _ => false,
        }
    }

    pub fn record_broadcast(&mut self, kind: ServiceMessageKind, now: Instant) {
        self.last_broadcast_service_msg = Some((kind, now));
    }

    /// P1: `local.state == COORDINATOR` implies `leader == local` or a
    /// `DECLARE_COORDINATOR` broadcast is still outstanding. Exposed for
    /// tests and debug assertions, not enforced at runtime (the state
    /// machine's transition rules are what keep it true).
    pub fn invariant_p1_holds(&self, declare_coordinator_in_flight: bool) -> bool {
        if self.local.state != NodeState::Coordinator {
            return true;
        }
        self.leader == Some(Leader::Local) || declare_coordinator_in_flight
    }
}

pub fn is_reply_packet_type(packet_type: PacketType) -> bool {
    matches!(
        packet_type,
        PacketType::Accept
            | PacketType::Reject
            | PacketType::Error
            | PacketType::Info
            | PacketType::CmdReplyInData
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn config_with(n: usize) -> WatchdogConfig {
        let nodes = (0..n)
            .map(|i| NodeConfig {
                name: format!("node{i}"),
                hostname: "127.0.0.1".to_string(),
                wd_port: 9000 + i as u16,
                pool_port: 5432,
                priority: 1,
                delegate_ip: None,
            })
            .collect();
        WatchdogConfig {
            local_node_id: 0,
            nodes,
            auth_key: None,
            ipc_socket_dir: "/tmp".to_string(),
            ipc_auth_required: false,
            reply_timeout: std::time::Duration::from_secs(5),
            beacon_interval: std::time::Duration::from_secs(10),
            beacon_miss_threshold: 3,
            quorum: Default::default(),
            failover: Default::default(),
            membership: Default::default(),
            escalation: Default::default(),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn total_cluster_size_counts_local_plus_remotes() {
        let config = config_with(3);
        let cluster = ClusterState::new(&config);
        assert_eq!(cluster.remote.len(), 2);
        assert_eq!(cluster.total_cluster_size(), 3);
    }

    #[test]
    fn p1_holds_when_not_coordinator() {
        let config = config_with(1);
        let cluster = ClusterState::new(&config);
        assert!(cluster.invariant_p1_holds(false));
    }

    #[test]
    fn broadcast_suppression_only_within_five_seconds() {
        let config = config_with(1);
        let mut cluster = ClusterState::new(&config);
        let t0 = Instant::now();
        cluster.record_broadcast(ServiceMessageKind::QuorumLost, t0);
        assert!(cluster.should_suppress_broadcast(ServiceMessageKind::QuorumLost, t0));
        assert!(!cluster.should_suppress_broadcast(
            ServiceMessageKind::QuorumLost,
            t0 + std::time::Duration::from_secs(6)
        ));
        assert!(!cluster.should_suppress_broadcast(ServiceMessageKind::QuorumFound, t0));
    }
}
