// src/watchdog/node.rs

//! `WatchdogNode`: the per-peer (and per-local) record described in spec §3.
//!
//! Grounded on `spineldb::core::cluster::state::ClusterNode` and
//! `spineldb::core::warden::state::InstanceState` for shape, generalized into
//! an arena entry keyed by `node_id` per the pointer-graph design note
//! (`SPEC_FULL.md` §9 / `spec.md` §9): nodes never hold references to each
//! other, only `node_id`s.

use std::time::Instant;

use crate::config::NodeConfig;

pub const DATA_VERSION_MAJOR: u8 = 1;
pub const DATA_VERSION_MINOR: u8 = 0;

/// One of the ten states a node's copy of the cluster state machine can be in
/// (spec §4.2), plus the two terminal sinks (`InNetworkTrouble`, `Shutdown`)
/// the transition diagram groups under "LOST, IN_NETWORK_TROUBLE,
/// NETWORK_ISOLATION, SHUTDOWN".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Loading,
    Joining,
    Initializing,
    StandForCoordinator,
    Coordinator,
    Standby,
    ParticipateInElection,
    Lost,
    InNetworkTrouble,
    NetworkIsolation,
    Shutdown,
}

impl NodeState {
    /// The string spelling used on the wire (beacon JSON `State` field and the
    /// authentication hash preimage), matching spec §4.2/§6 naming.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            NodeState::Loading => "LOADING",
            NodeState::Joining => "JOINING",
            NodeState::Initializing => "INITIALIZING",
            NodeState::StandForCoordinator => "STAND_FOR_COORDINATOR",
            NodeState::Coordinator => "COORDINATOR",
            NodeState::Standby => "STANDBY",
            NodeState::ParticipateInElection => "PARTICIPATE_IN_ELECTION",
            NodeState::Lost => "LOST",
            NodeState::InNetworkTrouble => "IN_NETWORK_TROUBLE",
            NodeState::NetworkIsolation => "NETWORK_ISOLATION",
            NodeState::Shutdown => "SHUTDOWN",
        }
    }

    /// Inverse of [`NodeState::as_wire_str`], used when a beacon or `ADD_NODE`
    /// payload's `State` field needs to update a remote node's record.
    pub fn from_wire_str(s: &str) -> Option<Self> {
        Some(match s {
            "LOADING" => NodeState::Loading,
            "JOINING" => NodeState::Joining,
            "INITIALIZING" => NodeState::Initializing,
            "STAND_FOR_COORDINATOR" => NodeState::StandForCoordinator,
            "COORDINATOR" => NodeState::Coordinator,
            "STANDBY" => NodeState::Standby,
            "PARTICIPATE_IN_ELECTION" => NodeState::ParticipateInElection,
            "LOST" => NodeState::Lost,
            "IN_NETWORK_TROUBLE" => NodeState::InNetworkTrouble,
            "NETWORK_ISOLATION" => NodeState::NetworkIsolation,
            "SHUTDOWN" => NodeState::Shutdown,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Active,
    RevokedShutdown,
    RevokedNoShow,
    RevokedLost,
}

/// Quorum contribution reported by a node (-1/0/1 in the original wire
/// format; spec §3/§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumStatus {
    Lost,
    Edge,
    Present,
}

impl QuorumStatus {
    pub fn as_i8(self) -> i8 {
        match self {
            QuorumStatus::Lost => -1,
            QuorumStatus::Edge => 0,
            QuorumStatus::Present => 1,
        }
    }

    pub fn from_i8(value: i8) -> Self {
        match value {
            v if v < 0 => QuorumStatus::Lost,
            0 => QuorumStatus::Edge,
            _ => QuorumStatus::Present,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Uninit,
    WaitingConnect,
    Connected,
    Error,
    Closed,
}

/// One of the two sockets a peer connection occupies (spec §3: "exactly one
/// of the two sockets is used to send to the peer at a time").
#[derive(Debug, Clone, Copy)]
pub struct SocketSlot {
    pub state: SocketState,
    pub last_change_time: Instant,
}

impl SocketSlot {
    pub fn new() -> Self {
        Self {
            state: SocketState::Uninit,
            last_change_time: Instant::now(),
        }
    }

    pub fn set(&mut self, state: SocketState) {
        self.state = state;
        self.last_change_time = Instant::now();
    }
}

impl Default for SocketSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLostReason {
    SocketClosed,
    NoBeacon,
    SendFailureLimitExceeded,
    NetworkIsolated,
}

/// One configured peer (or the local node). Lives for the process lifetime;
/// only its sockets and runtime fields change.
#[derive(Debug, Clone)]
pub struct WatchdogNode {
    pub node_id: usize,
    pub hostname: String,
    pub wd_port: u16,
    pub pool_port: u16,
    pub priority: i32,
    pub delegate_ip: Option<String>,
    pub name: String,

    pub version_major: u8,
    pub version_minor: u8,

    pub state: NodeState,
    pub membership_status: MembershipStatus,
    pub escalated: bool,

    pub server_socket: SocketSlot,
    pub client_socket: SocketSlot,

    pub last_rcv_time: Instant,
    pub last_sent_time: Instant,
    pub sending_failures: u32,
    pub missed_beacons: u32,
    pub node_lost_reason: Option<NodeLostReason>,
    pub has_lost_us: bool,
    pub quorum_status: QuorumStatus,
    pub standby_nodes_count: u32,
    pub current_state_time: Instant,
    pub startup_time: Instant,
    pub lost_time: Option<Instant>,
    pub dead_since_startup: Option<Instant>,
}

impl WatchdogNode {
    pub fn from_config(node_id: usize, config: &NodeConfig) -> Self {
        let now = Instant::now();
        Self {
            node_id,
            hostname: config.hostname.clone(),
            wd_port: config.wd_port,
            pool_port: config.pool_port,
            priority: config.priority,
            delegate_ip: config.delegate_ip.clone(),
            name: config.name.clone(),
            version_major: DATA_VERSION_MAJOR,
            version_minor: DATA_VERSION_MINOR,
            state: NodeState::Loading,
            membership_status: MembershipStatus::Active,
            escalated: false,
            server_socket: SocketSlot::new(),
            client_socket: SocketSlot::new(),
            last_rcv_time: now,
            last_sent_time: now,
            sending_failures: 0,
            missed_beacons: 0,
            node_lost_reason: None,
            has_lost_us: false,
            quorum_status: QuorumStatus::Edge,
            standby_nodes_count: 0,
            current_state_time: now,
            startup_time: now,
            lost_time: None,
            dead_since_startup: None,
        }
    }

    /// Transitions this node's recorded state, resetting `current_state_time`
    /// the way the original tags every `set_state` call (needed for the
    /// split-brain tie-break's "earlier current_state_time wins" rule).
    pub fn set_state(&mut self, state: NodeState) {
        self.state = state;
        self.current_state_time = Instant::now();
    }

    /// `true` once a peer has answered something and we are not currently
    /// treating them as dead.
    pub fn is_reachable(&self) -> bool {
        self.server_socket.state == SocketState::Connected
            || self.client_socket.state == SocketState::Connected
    }

    pub fn mark_lost(&mut self, reason: NodeLostReason) {
        self.server_socket.set(SocketState::Closed);
        self.client_socket.set(SocketState::Closed);
        self.node_lost_reason = Some(reason);
        self.lost_time = Some(Instant::now());
    }
}
