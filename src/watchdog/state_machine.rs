// src/watchdog/state_machine.rs

//! Per-state event handlers (spec §4.2): the heart of the cluster state
//! machine. Each handler is a pure function of `(&mut Coordinator, Event)`
//! returning the `Action`s the event loop must carry out, so the election,
//! split-brain, and beacon logic can be driven with synthetic events in
//! tests instead of real sockets — the same separation
//! `spineldb::core::warden::worker`'s `check_*` functions get by returning
//! plain values instead of performing I/O inline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::WatchdogConfig;
use crate::watchdog::cluster::{ClusterState, Leader};
use crate::watchdog::command::{CommandId, CommandSource, CommandTracker};
use crate::watchdog::events::{Action, Event};
use crate::watchdog::failover::{FailoverEngine, FailoverFlags, FailoverRequestKind, FailoverVerdict};
use crate::watchdog::membership;
use crate::watchdog::node::{NodeState, QuorumStatus};
use crate::watchdog::packet::{
    BeaconPayload, FailoverRequestPayload, PacketType, RejectPayload, ServiceMessageKind, WdPacketData,
};

/// Bundles everything a single node's copy of the state machine owns
/// exclusively (spec §5: "the state machine is the single owner of all
/// mutable cluster state").
pub struct Coordinator {
    pub config: Arc<WatchdogConfig>,
    pub cluster: ClusterState,
    pub commands: CommandTracker,
    pub failovers: FailoverEngine,
    /// `command_id` of the currently outstanding state-transition broadcast
    /// (ADD_NODE/REQ_INFO/STAND_FOR_COORDINATOR/DECLARE_COORDINATOR), if any.
    pending_command: Option<CommandId>,
}

impl Coordinator {
    pub fn new(config: Arc<WatchdogConfig>) -> Self {
        let cluster = ClusterState::new(&config);
        Self {
            config,
            cluster,
            commands: CommandTracker::new(),
            failovers: FailoverEngine::new(),
            pending_command: None,
        }
    }

    fn transition(&mut self, new_state: NodeState) -> Vec<Action> {
        info!(from = ?self.cluster.local.state, to = ?new_state, "state transition");
        self.cluster.local.set_state(new_state);
        vec![Action::FireEvent(Event::StateChanged)]
    }

    /// Builds the `BeaconPayload` describing our own current state, as sent
    /// in every `IAM_COORDINATOR` beacon and `INFO` reply (spec §4.2).
    pub fn own_beacon_payload(&self, now: Instant) -> BeaconPayload {
        BeaconPayload {
            state: self.cluster.local.state.as_wire_str().to_string(),
            seconds_since_startup: now
                .saturating_duration_since(self.cluster.local.startup_time)
                .as_secs(),
            seconds_since_current_state: now
                .saturating_duration_since(self.cluster.local.current_state_time)
                .as_secs(),
            quorum_status: self.cluster.quorum_status.as_i8(),
            alive_node_count: self.cluster.standbys.len() as u32 + 1,
            escalated: self.cluster.local.escalated,
        }
    }

    /// Applies a received `IAM_COORDINATOR`/`INFO` beacon payload to the
    /// sender's record (spec §4.2: "on receipt, the receiver updates the
    /// sender's record fields accordingly") and, unless we are ourselves the
    /// coordinator, learns who the leader is. Malformed or empty payloads
    /// (older `IAM_COORDINATOR` traffic carried none) are silently ignored.
    fn observe_beacon(&mut self, from: usize, packet: &WdPacketData) {
        let Ok(beacon) = packet.parse_json::<BeaconPayload>() else {
            return;
        };
        if let Some(node) = self.cluster.remote_mut(from) {
            if let Some(state) = NodeState::from_wire_str(&beacon.state) {
                if node.state != state {
                    node.set_state(state);
                }
            }
            node.escalated = beacon.escalated;
            node.quorum_status = QuorumStatus::from_i8(beacon.quorum_status);
            node.standby_nodes_count = beacon.alive_node_count.saturating_sub(1);
        }
        if self.cluster.local.state != NodeState::Coordinator {
            self.cluster.leader = Some(Leader::Remote(from));
        }
    }

    fn broadcast_and_track(
        &mut self,
        packet_type: PacketType,
        now: Instant,
    ) -> (Vec<Action>, CommandId) {
        let id = self.commands.next_command_id();
        let targets = self.cluster.reachable_remote_ids();
        let packet = WdPacketData::empty(packet_type, id.0);
        self.commands.register(
            id,
            CommandSource::Local,
            packet.clone(),
            &targets,
            self.config.reply_timeout,
            now,
        );
        self.pending_command = Some(id);
        (vec![Action::Broadcast { packet }], id)
    }

    pub fn handle_event(&mut self, event: Event, now: Instant) -> Vec<Action> {
        let mut extra = Vec::new();
        if let Event::PacketRcv { from, packet } = &event {
            if matches!(packet.packet_type, PacketType::IamCoordinator | PacketType::Info) {
                self.observe_beacon(*from, packet);
            }
            // Any state answers a REQ_INFO with our current beacon data (spec
            // §4.5): this is what lets a node in JOINING learn the real
            // leader from a peer that already knows it, even though the
            // REQ_INFO broadcast itself always finishes via its own timeout.
            if packet.packet_type == PacketType::ReqInfo {
                let payload = self.own_beacon_payload(now);
                let reply = WdPacketData::json(PacketType::Info, packet.command_id, &payload)
                    .unwrap_or_else(|_| WdPacketData::empty(PacketType::Info, packet.command_id));
                extra.push(Action::SendTo { node_id: *from, packet: reply });
            }
        }
        let mut actions = match self.cluster.local.state {
            NodeState::Loading => self.handle_loading(event, now),
            NodeState::Joining => self.handle_joining(event, now),
            NodeState::Initializing => self.handle_initializing(event, now),
            NodeState::StandForCoordinator => self.handle_stand_for_coordinator(event, now),
            NodeState::ParticipateInElection => self.handle_participate_in_election(event, now),
            NodeState::Coordinator => self.handle_coordinator(event, now),
            NodeState::Standby => self.handle_standby(event, now),
            NodeState::Lost | NodeState::InNetworkTrouble => {
                self.handle_lost_or_network_trouble(event)
            }
            NodeState::NetworkIsolation => self.handle_network_isolation(event, now),
            NodeState::Shutdown => self.handle_shutdown(event),
        };
        actions.extend(extra);
        actions
    }

    fn handle_loading(&mut self, event: Event, now: Instant) -> Vec<Action> {
        match event {
            Event::StateChanged => {
                let (mut actions, _id) = self.broadcast_and_track(PacketType::AddNode, now);
                actions.push(Action::ArmTimer(self.config.reply_timeout));
                actions
            }
            Event::PacketRcv { from, packet } if packet.packet_type == PacketType::Reject => {
                warn!(node_id = from, "peer rejected ADD_NODE: fatal configuration mismatch");
                vec![Action::ExitProcess(1)]
            }
            Event::PacketRcv { from, packet } if packet.packet_type == PacketType::Info => {
                if let Some(id) = self.pending_command {
                    self.commands.record_reply(id, from, packet);
                    if self.commands.get(id).map(|c| c.is_finished()).unwrap_or(false) {
                        self.commands.remove(id);
                        self.pending_command = None;
                        return self.transition(NodeState::Joining);
                    }
                }
                vec![]
            }
            Event::Timeout => {
                if let Some(id) = self.pending_command.take() {
                    self.commands.remove(id);
                }
                self.transition(NodeState::Joining)
            }
            _ => vec![],
        }
    }

    fn handle_joining(&mut self, event: Event, now: Instant) -> Vec<Action> {
        match event {
            Event::StateChanged => {
                self.cluster.leader = None;
                let mut actions = Vec::new();
                for remote in &self.cluster.remote {
                    if !remote.is_reachable() {
                        actions.push(Action::ReconnectPeer(remote.node_id));
                    }
                }
                let (broadcast_actions, _id) =
                    self.broadcast_and_track(PacketType::ReqInfo, now);
                actions.extend(broadcast_actions);
                actions
            }
            Event::CommandFinished(id) if Some(id) == self.pending_command => {
                self.commands.remove(id);
                self.pending_command = None;
                self.transition(NodeState::Initializing)
            }
            Event::PacketRcv { from, packet }
                if packet.packet_type == PacketType::Info && Some(packet.command_id) == self.pending_command.map(|c| c.0) =>
            {
                self.commands.record_reply(CommandId(packet.command_id), from, packet);
                if self
                    .pending_command
                    .and_then(|id| self.commands.get(id))
                    .map(|c| c.is_finished())
                    .unwrap_or(false)
                {
                    let id = self.pending_command.take().unwrap();
                    self.commands.remove(id);
                    return self.transition(NodeState::Initializing);
                }
                vec![]
            }
            _ => vec![],
        }
    }

    fn handle_initializing(&mut self, event: Event, _now: Instant) -> Vec<Action> {
        match event {
            Event::StateChanged => vec![Action::ArmTimer(Duration::from_secs(1))],
            Event::Timeout => {
                if self.cluster.leader.is_some() {
                    return self.transition(NodeState::Standby);
                }
                let active_remotes = membership::member_remote_count(&self.cluster.remote);
                if active_remotes == 0 {
                    return self.transition(NodeState::Coordinator);
                }
                let any_standing = self
                    .cluster
                    .remote
                    .iter()
                    .any(|n| n.state == NodeState::StandForCoordinator);
                if any_standing {
                    self.transition(NodeState::ParticipateInElection)
                } else {
                    self.transition(NodeState::StandForCoordinator)
                }
            }
            _ => vec![],
        }
    }

    fn handle_stand_for_coordinator(&mut self, event: Event, now: Instant) -> Vec<Action> {
        match event {
            Event::StateChanged => {
                let (mut actions, _id) =
                    self.broadcast_and_track(PacketType::StandForCoordinator, now);
                actions.push(Action::ArmTimer(self.config.reply_timeout));
                actions
            }
            // REJECT/ERROR/ACCEPT replies to our STAND_FOR_COORDINATOR
            // broadcast must be recorded against the command, the same way
            // `handle_loading`/`handle_joining` record INFO replies, or
            // `any_reject`/`any_error` below never see anything but `Sent`
            // slots and the command can only ever finish via timeout.
            Event::PacketRcv { from, packet }
                if Some(packet.command_id) == self.pending_command.map(|c| c.0)
                    && matches!(
                        packet.packet_type,
                        PacketType::Reject | PacketType::Error | PacketType::Accept
                    ) =>
            {
                let id = CommandId(packet.command_id);
                self.commands.record_reply(id, from, packet);
                if self.commands.get(id).map(|c| c.is_finished()).unwrap_or(false) {
                    return self.finish_stand_for_coordinator(id);
                }
                vec![]
            }
            Event::CommandFinished(id) if Some(id) == self.pending_command => {
                self.finish_stand_for_coordinator(id)
            }
            Event::PacketRcv { from, packet }
                if packet.packet_type == PacketType::DeclareCoordinator =>
            {
                let higher_priority = self
                    .cluster
                    .remote_ref(from)
                    .map(|n| n.priority > self.cluster.local.priority)
                    .unwrap_or(false);
                if higher_priority {
                    self.transition(NodeState::Joining)
                } else {
                    vec![Action::SendTo {
                        node_id: from,
                        packet: WdPacketData::empty(PacketType::Reject, packet.command_id),
                    }]
                }
            }
            _ => vec![],
        }
    }

    /// Shared by the timeout and reply-driven paths out of
    /// STAND_FOR_COORDINATOR (spec §4.2): any REJECT drops us back into the
    /// election, any ERROR means we can't even talk to our peers, otherwise
    /// we won the bid uncontested.
    fn finish_stand_for_coordinator(&mut self, id: CommandId) -> Vec<Action> {
        let finished = self.commands.remove(id);
        self.pending_command = None;
        let Some(cmd) = finished else { return vec![] };
        let any_reject = cmd
            .slots
            .values()
            .any(|s| s.reply_type == Some(PacketType::Reject));
        let any_error = cmd
            .slots
            .values()
            .any(|s| s.reply_type == Some(PacketType::Error));
        if any_reject {
            self.transition(NodeState::ParticipateInElection)
        } else if any_error {
            self.transition(NodeState::NetworkIsolation)
        } else {
            self.transition(NodeState::Coordinator)
        }
    }

    fn handle_participate_in_election(&mut self, event: Event, _now: Instant) -> Vec<Action> {
        match event {
            Event::StateChanged => vec![Action::ArmTimer(self.config.reply_timeout)],
            Event::PacketRcv { packet, .. } if packet.packet_type == PacketType::DeclareCoordinator => {
                self.transition(NodeState::Initializing)
            }
            Event::PacketRcv { packet, .. } if packet.packet_type == PacketType::IamCoordinator => {
                self.transition(NodeState::Joining)
            }
            Event::Timeout => self.transition(NodeState::Joining),
            _ => vec![],
        }
    }

    fn handle_coordinator(&mut self, event: Event, now: Instant) -> Vec<Action> {
        match event {
            Event::StateChanged => {
                let (mut actions, _id) =
                    self.broadcast_and_track(PacketType::DeclareCoordinator, now);
                actions.push(Action::ArmTimer(self.config.reply_timeout));
                actions
            }
            Event::CommandFinished(id) if Some(id) == self.pending_command => {
                self.commands.remove(id);
                self.pending_command = None;
                self.cluster.leader = Some(Leader::Local);
                let mut actions = vec![Action::ArmTimer(self.config.beacon_interval)];
                if self.cluster.quorum_status == QuorumStatus::Present {
                    actions.push(Action::StartEscalation);
                }
                actions
            }
            Event::Timeout => {
                let id = self.commands.next_command_id();
                let payload = self.own_beacon_payload(now);
                let beacon = WdPacketData::json(PacketType::IamCoordinator, id.0, &payload)
                    .unwrap_or_else(|_| WdPacketData::empty(PacketType::IamCoordinator, id.0));
                vec![
                    Action::Broadcast { packet: beacon },
                    Action::ArmTimer(self.config.beacon_interval),
                ]
            }
            Event::PacketRcv { from, packet } if packet.packet_type == PacketType::IamCoordinator => {
                self.resolve_split_brain(from, now)
            }
            Event::PacketRcv { from, packet } if packet.packet_type == PacketType::JoinCoordinator => {
                self.cluster.standbys.insert(from);
                if let Some(node) = self.cluster.remote_mut(from) {
                    if node.state != NodeState::Standby {
                        node.set_state(NodeState::Standby);
                    }
                }
                vec![Action::SendTo {
                    node_id: from,
                    packet: WdPacketData::empty(PacketType::Accept, packet.command_id),
                }]
            }
            Event::PacketRcv { from, packet }
                if packet.packet_type == PacketType::RemoteFailoverRequest =>
            {
                self.handle_remote_failover_request(from, packet, now)
            }
            Event::ClusterQuorumChanged => {
                if self.cluster.quorum_status == QuorumStatus::Lost {
                    vec![Action::StartDeescalation]
                } else if self.cluster.quorum_status == QuorumStatus::Present
                    && !self.cluster.local.escalated
                {
                    vec![Action::StartEscalation]
                } else {
                    vec![]
                }
            }
            Event::PacketRcv { from, packet }
                if packet.packet_type == PacketType::StandForCoordinator =>
            {
                vec![Action::SendTo {
                    node_id: from,
                    packet: WdPacketData::empty(PacketType::Reject, packet.command_id),
                }]
            }
            _ => vec![],
        }
    }

    /// Split-brain tie-break (spec §4.2 COORDINATOR handler): compare, in
    /// order, `escalated`, `quorum_status`, `standby_nodes_count`, then
    /// earlier `current_state_time`.
    fn resolve_split_brain(&mut self, other: usize, now: Instant) -> Vec<Action> {
        let Some(other_node) = self.cluster.remote_ref(other) else {
            return vec![];
        };

        let we_win = compare_coordinator_claims(
            self.cluster.local.escalated,
            self.cluster.quorum_status,
            self.cluster.local.standby_nodes_count,
            self.cluster.local.current_state_time,
            other_node.escalated,
            other_node.quorum_status,
            other_node.standby_nodes_count,
            other_node.current_state_time,
        );

        if we_win {
            if self.cluster.should_suppress_broadcast(ServiceMessageKind::IamTrueLeader, now) {
                vec![]
            } else {
                self.cluster
                    .record_broadcast(ServiceMessageKind::IamTrueLeader, now);
                let id = self.commands.next_command_id();
                vec![Action::Broadcast {
                    packet: WdPacketData::service_message(id.0, ServiceMessageKind::IamTrueLeader),
                }]
            }
        } else {
            let id = self.commands.next_command_id();
            let mut actions = vec![Action::Broadcast {
                packet: WdPacketData::service_message(
                    id.0,
                    ServiceMessageKind::IamResigningFromLeader,
                ),
            }];
            actions.extend(self.transition(NodeState::Joining));
            actions
        }
    }

    /// Registers a failover request with `FailoverEngine` under the current
    /// quorum/consensus configuration and returns the verdict (spec §4.4).
    /// Shared by the `REMOTE_FAILOVER_REQUEST` peer handler and the event
    /// loop's locally-originated `IPC_FAILOVER_COMMAND` path, so both obey
    /// the same `NO_QUORUM`/consensus gating instead of the IPC path
    /// short-circuiting straight to acceptance.
    pub fn evaluate_failover_request(
        &mut self,
        kind: FailoverRequestKind,
        node_ids: Vec<usize>,
        requester: usize,
        flags: FailoverFlags,
        now: Instant,
    ) -> FailoverVerdict {
        let member_remote_count = membership::member_remote_count(&self.cluster.remote);
        let threshold = membership::consensus_threshold(
            member_remote_count,
            self.cluster.total_cluster_size(),
            self.config.quorum.enable_consensus_with_half_votes,
        );

        self.failovers.request_failover(
            kind,
            node_ids,
            requester,
            flags,
            self.config.failover.failover_when_quorum_exists,
            self.cluster.quorum_status,
            threshold,
            self.config.failover.allow_multiple_failover_requests_from_node,
            now,
        )
    }

    /// Handles a `REMOTE_FAILOVER_REQUEST` addressed to us as coordinator
    /// (spec §4.4/scenario 4): registers the vote with `FailoverEngine` and
    /// replies with the resulting verdict.
    fn handle_remote_failover_request(
        &mut self,
        from: usize,
        packet: WdPacketData,
        now: Instant,
    ) -> Vec<Action> {
        let payload: FailoverRequestPayload = match packet.parse_json() {
            Ok(p) => p,
            Err(_) => {
                return vec![Action::SendTo {
                    node_id: from,
                    packet: WdPacketData::empty(PacketType::Reject, packet.command_id),
                }];
            }
        };
        let Some(kind) = FailoverRequestKind::from_wire_str(&payload.request_kind) else {
            return vec![Action::SendTo {
                node_id: from,
                packet: WdPacketData::empty(PacketType::Reject, packet.command_id),
            }];
        };

        let verdict = self.evaluate_failover_request(
            kind,
            payload.node_ids,
            from,
            FailoverFlags {
                confirmed: payload.confirmed,
            },
            now,
        );

        let reply_type = match verdict {
            FailoverVerdict::Proceed => PacketType::FailoverStart,
            FailoverVerdict::BuildingConsensus => PacketType::FailoverWaitingForConsensus,
            FailoverVerdict::NoQuorum => PacketType::Reject,
        };
        vec![Action::SendTo {
            node_id: from,
            packet: WdPacketData::empty(reply_type, packet.command_id),
        }]
    }

    fn handle_standby(&mut self, event: Event, _now: Instant) -> Vec<Action> {
        match event {
            Event::StateChanged => {
                self.cluster.local.missed_beacons = 0;
                let Some(Leader::Remote(leader_id)) = self.cluster.leader else {
                    return vec![Action::ArmTimer(self.config.beacon_interval)];
                };
                let id = self.commands.next_command_id();
                vec![
                    Action::SendTo {
                        node_id: leader_id,
                        packet: WdPacketData::empty(PacketType::JoinCoordinator, id.0),
                    },
                    Action::ArmTimer(self.config.beacon_interval),
                ]
            }
            Event::PacketRcv { packet, .. } if packet.packet_type == PacketType::Accept => {
                self.cluster.local.missed_beacons = 0;
                vec![]
            }
            Event::PacketRcv { from, packet } if packet.packet_type == PacketType::Reject => {
                let has_lost_us = packet
                    .parse_json::<RejectPayload>()
                    .map(|p| p.has_lost_us)
                    .unwrap_or(false);
                if has_lost_us {
                    self.transition(NodeState::NetworkIsolation)
                } else {
                    let id = self.commands.next_command_id();
                    vec![Action::SendTo {
                        node_id: from,
                        packet: WdPacketData::empty(PacketType::JoinCoordinator, id.0),
                    }]
                }
            }
            Event::PacketRcv { packet, .. } if packet.packet_type == PacketType::IamCoordinator => {
                self.cluster.local.missed_beacons = 0;
                vec![]
            }
            Event::Timeout => {
                self.cluster.local.missed_beacons += 1;
                if self.cluster.local.missed_beacons >= self.config.beacon_miss_threshold {
                    return self.transition(NodeState::Joining);
                }
                let mut actions = vec![Action::ArmTimer(self.config.beacon_interval)];
                if self.cluster.local.missed_beacons >= 2 {
                    if let Some(Leader::Remote(leader_id)) = self.cluster.leader {
                        let id = self.commands.next_command_id();
                        actions.push(Action::SendTo {
                            node_id: leader_id,
                            packet: WdPacketData::empty(PacketType::ReqInfo, id.0),
                        });
                    }
                }
                actions
            }
            _ => vec![],
        }
    }

    fn handle_lost_or_network_trouble(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::StateChanged => vec![Action::ExitProcess(1)],
            _ => vec![],
        }
    }

    fn handle_network_isolation(&mut self, event: Event, _now: Instant) -> Vec<Action> {
        match event {
            Event::StateChanged => vec![Action::ArmTimer(Duration::from_secs(10))],
            Event::RemoteNodeFound(_)
            | Event::IAmAppearingFound
            | Event::WdStateRequireReload
            | Event::NwIpAssigned
            | Event::Timeout => self.transition(NodeState::Joining),
            _ => vec![],
        }
    }

    fn handle_shutdown(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::StateChanged | Event::Shutdown => {
                let id = self.commands.next_command_id();
                vec![
                    Action::Broadcast {
                        packet: WdPacketData::empty(PacketType::InformIAmGoingDown, id.0),
                    },
                    Action::StartDeescalation,
                    Action::ExitProcess(0),
                ]
            }
            _ => vec![],
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn compare_coordinator_claims(
    our_escalated: bool,
    our_quorum: QuorumStatus,
    our_standbys: u32,
    our_state_time: Instant,
    their_escalated: bool,
    their_quorum: QuorumStatus,
    their_standbys: u32,
    their_state_time: Instant,
) -> bool {
    if our_escalated != their_escalated {
        return our_escalated;
    }
    if our_quorum != their_quorum {
        return quorum_rank(our_quorum) > quorum_rank(their_quorum);
    }
    if our_standbys != their_standbys {
        return our_standbys > their_standbys;
    }
    our_state_time < their_state_time
}

fn quorum_rank(status: QuorumStatus) -> i8 {
    match status {
        QuorumStatus::Lost => -1,
        QuorumStatus::Edge => 0,
        QuorumStatus::Present => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EscalationConfig, FailoverConfig, MembershipConfig, NodeConfig, QuorumConfig};

    fn three_node_config(local_node_id: usize) -> WatchdogConfig {
        let priorities = [10, 5, 5];
        let nodes = priorities
            .iter()
            .enumerate()
            .map(|(i, &priority)| NodeConfig {
                name: format!("node{i}"),
                hostname: "127.0.0.1".to_string(),
                wd_port: 9000 + i as u16,
                pool_port: 5432,
                priority,
                delegate_ip: None,
            })
            .collect();
        WatchdogConfig {
            local_node_id,
            nodes,
            auth_key: None,
            ipc_socket_dir: "/tmp".to_string(),
            ipc_auth_required: false,
            reply_timeout: Duration::from_millis(50),
            beacon_interval: Duration::from_millis(100),
            beacon_miss_threshold: 3,
            quorum: QuorumConfig::default(),
            failover: FailoverConfig::default(),
            membership: MembershipConfig::default(),
            escalation: EscalationConfig::default(),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn initializing_becomes_coordinator_when_no_remote_is_active() {
        let config = Arc::new(three_node_config(0));
        let mut coordinator = Coordinator::new(config);
        for remote in &mut coordinator.cluster.remote {
            remote.membership_status = crate::watchdog::node::MembershipStatus::RevokedNoShow;
        }
        coordinator.cluster.local.set_state(NodeState::Initializing);
        let actions = coordinator.handle_event(Event::Timeout, Instant::now());
        assert!(matches!(coordinator.cluster.local.state, NodeState::Coordinator));
        assert!(actions.iter().any(|a| matches!(a, Action::FireEvent(_))));
    }

    #[test]
    fn initializing_goes_standby_when_leader_already_known() {
        let config = Arc::new(three_node_config(1));
        let mut coordinator = Coordinator::new(config);
        coordinator.cluster.leader = Some(Leader::Remote(0));
        coordinator.cluster.local.set_state(NodeState::Initializing);
        coordinator.handle_event(Event::Timeout, Instant::now());
        assert!(matches!(coordinator.cluster.local.state, NodeState::Standby));
    }

    #[test]
    fn split_brain_loser_resigns_and_rejoins() {
        let config = Arc::new(three_node_config(1));
        let mut coordinator = Coordinator::new(config);
        coordinator.cluster.local.set_state(NodeState::Coordinator);
        coordinator.cluster.local.escalated = false;
        if let Some(other) = coordinator.cluster.remote_mut(0) {
            other.escalated = true;
        }
        let actions = coordinator.handle_event(
            Event::PacketRcv {
                from: 0,
                packet: WdPacketData::empty(PacketType::IamCoordinator, 1),
            },
            Instant::now(),
        );
        assert!(matches!(coordinator.cluster.local.state, NodeState::Joining));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Broadcast { packet } if packet.packet_type == PacketType::ClusterServiceMessage
        )));
    }

    #[test]
    fn split_brain_winner_stays_coordinator() {
        let config = Arc::new(three_node_config(0));
        let mut coordinator = Coordinator::new(config);
        coordinator.cluster.local.set_state(NodeState::Coordinator);
        coordinator.cluster.local.escalated = true;
        if let Some(other) = coordinator.cluster.remote_mut(1) {
            other.escalated = false;
        }
        coordinator.handle_event(
            Event::PacketRcv {
                from: 1,
                packet: WdPacketData::empty(PacketType::IamCoordinator, 1),
            },
            Instant::now(),
        );
        assert!(matches!(coordinator.cluster.local.state, NodeState::Coordinator));
    }

    #[test]
    fn remote_failover_request_builds_then_reaches_consensus() {
        let config = Arc::new(three_node_config(0));
        let mut coordinator = Coordinator::new(config);
        coordinator.cluster.local.set_state(NodeState::Coordinator);
        coordinator.cluster.leader = Some(Leader::Local);
        let now = Instant::now();

        let payload = crate::watchdog::packet::FailoverRequestPayload {
            request_kind: "NODE_DOWN".to_string(),
            node_ids: vec![1],
            confirmed: false,
        };
        let first = coordinator.handle_event(
            Event::PacketRcv {
                from: 1,
                packet: WdPacketData::json(PacketType::RemoteFailoverRequest, 1, &payload).unwrap(),
            },
            now,
        );
        assert!(first.iter().any(|a| matches!(
            a,
            Action::SendTo { packet, .. } if packet.packet_type == PacketType::FailoverWaitingForConsensus
        )));

        let second = coordinator.handle_event(
            Event::PacketRcv {
                from: 2,
                packet: WdPacketData::json(PacketType::RemoteFailoverRequest, 2, &payload).unwrap(),
            },
            now,
        );
        assert!(second.iter().any(|a| matches!(
            a,
            Action::SendTo { packet, .. } if packet.packet_type == PacketType::FailoverStart
        )));
    }

    #[test]
    fn remote_failover_request_rejected_without_quorum() {
        let config = Arc::new(three_node_config(0));
        let mut coordinator = Coordinator::new(config);
        coordinator.cluster.local.set_state(NodeState::Coordinator);
        coordinator.cluster.leader = Some(Leader::Local);
        coordinator.cluster.quorum_status = QuorumStatus::Lost;

        let payload = crate::watchdog::packet::FailoverRequestPayload {
            request_kind: "NODE_DOWN".to_string(),
            node_ids: vec![1],
            confirmed: false,
        };
        let actions = coordinator.handle_event(
            Event::PacketRcv {
                from: 1,
                packet: WdPacketData::json(PacketType::RemoteFailoverRequest, 1, &payload).unwrap(),
            },
            Instant::now(),
        );
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SendTo { packet, .. } if packet.packet_type == PacketType::Reject
        )));
    }

    #[test]
    fn standby_three_missed_beacons_triggers_rejoin() {
        let config = Arc::new(three_node_config(1));
        let mut coordinator = Coordinator::new(config);
        coordinator.cluster.leader = Some(Leader::Remote(0));
        coordinator.cluster.local.set_state(NodeState::Standby);
        let now = Instant::now();
        coordinator.handle_event(Event::Timeout, now);
        coordinator.handle_event(Event::Timeout, now);
        coordinator.handle_event(Event::Timeout, now);
        assert!(matches!(coordinator.cluster.local.state, NodeState::Joining));
    }
}
