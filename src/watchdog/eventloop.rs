// src/watchdog/eventloop.rs

//! Wires the state machine to real I/O: one `tokio::select!`-driven loop that
//! owns every socket table and the `Coordinator` exclusively (spec §5).
//!
//! Peer connections and the IPC listener each run as thin reader tasks that
//! forward decoded packets through an `mpsc` channel; this loop is the only
//! place that ever writes to a socket or mutates cluster state, which is the
//! closest async-Rust analogue of "one select-style call per iteration"
//! available without a hand-rolled reactor (documented as an Open Question
//! resolution in `DESIGN.md`).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::WatchdogConfig;
use crate::watchdog::command::CommandId;
use crate::watchdog::connection::{self, ConnId, PeerConnEvent, PeerConnections, SocketKind};
use crate::watchdog::escalation::Escalation;
use crate::watchdog::events::{Action, Event};
use crate::watchdog::ipc::{self, IpcClients, IpcConnEvent, IpcReply};
use crate::watchdog::membership;
use crate::watchdog::node::{MembershipStatus, NodeState, SocketState};
use crate::watchdog::packet::PacketType;
use crate::watchdog::state_machine::Coordinator;

const DEFAULT_TIMER: Duration = Duration::from_secs(1);

pub struct EventLoop {
    coordinator: Coordinator,
    peer_conns: PeerConnections,
    ipc_clients: IpcClients,
    escalation: Escalation,
    pending: VecDeque<Event>,
    timer_deadline: Instant,
    peer_rx: mpsc::Receiver<PeerConnEvent>,
    peer_tx: mpsc::Sender<PeerConnEvent>,
    ipc_rx: Option<mpsc::Receiver<IpcConnEvent>>,
    /// `command_id` -> (IPC caller, deadline) for `IPC_FAILOVER_COMMAND`s
    /// forwarded to the leader as `REMOTE_FAILOVER_REQUEST` (spec §4.7,
    /// scenario 6). Kept separate from `coordinator.commands`, which tracks
    /// broadcasts awaiting replies from every peer rather than a single
    /// targeted request/reply.
    pending_failover_forwards: std::collections::HashMap<u32, (crate::watchdog::ipc::IpcClientId, Instant)>,
}

impl EventLoop {
    pub fn new(config: Arc<WatchdogConfig>) -> Self {
        let (peer_tx, peer_rx) = mpsc::channel(256);
        let escalation = Escalation::new(config.escalation.clone());
        Self {
            coordinator: Coordinator::new(config),
            peer_conns: PeerConnections::default(),
            ipc_clients: IpcClients::default(),
            escalation,
            pending: VecDeque::new(),
            timer_deadline: Instant::now() + DEFAULT_TIMER,
            peer_rx,
            peer_tx,
            ipc_rx: None,
            pending_failover_forwards: std::collections::HashMap::new(),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let config = Arc::clone(&self.coordinator.config);
        let local = config.local();
        let bind_addr: std::net::SocketAddr =
            format!("0.0.0.0:{}", local.wd_port).parse().unwrap();

        {
            let tx = self.peer_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = connection::run_peer_listener(bind_addr, tx).await {
                    error!(error = %e, "peer listener exited");
                }
            });
        }

        let (ipc_tx, ipc_rx) = mpsc::channel(256);
        self.ipc_rx = Some(ipc_rx);
        {
            let socket_path =
                PathBuf::from(&config.ipc_socket_dir).join(format!(".s.WDIPC.{}", local.wd_port));
            tokio::spawn(async move {
                if let Err(e) = ipc::run_ipc_listener(socket_path, ipc_tx).await {
                    error!(error = %e, "ipc listener exited");
                }
            });
        }

        for (node_id, node_config) in config.remotes() {
            let tx = self.peer_tx.clone();
            let hostname = node_config.hostname.clone();
            let wd_port = node_config.wd_port;
            let timeout = config.reply_timeout;
            tokio::spawn(async move {
                connection::connect_outbound(node_id, hostname, wd_port, timeout, tx).await;
            });
        }

        self.pending.push_back(Event::StateChanged);

        loop {
            let now = Instant::now();
            if let Some(event) = self.pending.pop_front() {
                self.dispatch(event, now).await;
                continue;
            }

            let sleep = tokio::time::sleep_until(self.timer_deadline.into());
            tokio::select! {
                _ = sleep => {
                    self.dispatch(Event::Timeout, Instant::now()).await;
                }
                Some(event) = self.peer_rx.recv() => {
                    self.handle_peer_conn_event(event).await;
                }
                Some(event) = self.ipc_rx.as_mut().unwrap().recv() => {
                    self.handle_ipc_conn_event(event).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    self.dispatch(Event::Shutdown, Instant::now()).await;
                }
            }

            self.sweep_timeouts(Instant::now()).await;

            if self.coordinator.cluster.local.state == NodeState::Shutdown {
                return Ok(());
            }
        }
    }

    async fn sweep_timeouts(&mut self, now: Instant) {
        for id in self.coordinator.commands.expire_overdue(now) {
            self.pending.push_back(Event::CommandFinished(id));
        }
        let timeout = self.coordinator.config.failover_command_timeout();
        for expired in self.coordinator.failovers.expire(timeout, now) {
            warn!(failover_id = expired.id, "failover request expired without consensus");
        }

        let overdue: Vec<u32> = self
            .pending_failover_forwards
            .iter()
            .filter(|(_, (_, deadline))| now >= *deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            if let Some((client, _)) = self.pending_failover_forwards.remove(&id) {
                self.ipc_clients.reply(client, &IpcReply::timeout()).await;
            }
        }

        self.recompute_membership_and_quorum(now);
    }

    /// Applies membership revocation rules to every remote (spec §4.3) and
    /// recomputes `quorum_status` from the result, firing
    /// `Event::ClusterQuorumChanged` whenever it changes. Run on every
    /// `sweep_timeouts` pass so it tracks peer loss/restoration without
    /// needing its own timer.
    fn recompute_membership_and_quorum(&mut self, now: Instant) {
        let membership_cfg = &self.coordinator.config.membership;
        let no_show_timeout = membership_cfg.wd_no_show_node_removal_timeout;
        let lost_timeout = membership_cfg.wd_lost_node_removal_timeout;
        for node in &mut self.coordinator.cluster.remote {
            membership::apply_revocation_rules(node, now, no_show_timeout, lost_timeout);
        }

        let member_remote_count = membership::member_remote_count(&self.coordinator.cluster.remote);
        let standby_count = self
            .coordinator
            .cluster
            .remote
            .iter()
            .filter(|n| n.membership_status == MembershipStatus::Active && n.is_reachable())
            .count() as u32;
        let total_odd = self.coordinator.cluster.total_cluster_size() % 2 != 0;
        let new_status = membership::compute_quorum_status(
            standby_count,
            member_remote_count,
            self.coordinator.config.quorum.enable_consensus_with_half_votes,
            total_odd,
        );
        if new_status != self.coordinator.cluster.quorum_status {
            self.coordinator.cluster.quorum_status = new_status;
            self.pending.push_back(Event::ClusterQuorumChanged);
        }
    }

    async fn dispatch(&mut self, event: Event, now: Instant) {
        let retry_node = match &event {
            Event::NewOutboundConnection(id) | Event::RemoteNodeFound(id) => Some(*id),
            _ => None,
        };
        let actions = self.coordinator.handle_event(event, now);
        for action in actions {
            self.apply_action(action).await;
        }
        if let Some(node_id) = retry_node {
            self.retry_send_errors(node_id).await;
        }
    }

    /// On network restoration, retries any outstanding command slot still
    /// marked `SEND_ERROR` for `node_id` (spec §4.5).
    async fn retry_send_errors(&mut self, node_id: usize) {
        for (id, packet) in self.coordinator.commands.retry_send_errors(node_id) {
            if let Err(e) = self.peer_conns.send(node_id, packet).await {
                warn!(node_id, error = %e, "retry send failed");
                self.coordinator.commands.mark_send_error(id, node_id);
            }
        }
    }

    async fn apply_action(&mut self, action: Action) {
        match action {
            Action::SendTo { node_id, packet } => {
                let command_id = CommandId(packet.command_id);
                if let Err(e) = self.peer_conns.send(node_id, packet).await {
                    warn!(node_id, error = %e, "send failed");
                    self.coordinator.commands.mark_send_error(command_id, node_id);
                }
            }
            Action::Broadcast { packet } => {
                let targets = self.coordinator.cluster.reachable_remote_ids();
                let command_id = CommandId(packet.command_id);
                for node_id in targets {
                    if let Err(e) = self.peer_conns.send(node_id, packet.clone()).await {
                        warn!(node_id, error = %e, "broadcast send failed");
                        self.coordinator.commands.mark_send_error(command_id, node_id);
                    }
                }
            }
            Action::ArmTimer(duration) => {
                self.timer_deadline = Instant::now() + duration;
            }
            Action::FireEvent(event) => {
                self.pending.push_back(event);
            }
            Action::StartEscalation => {
                if self.escalation.escalate().await {
                    self.coordinator.cluster.local.escalated = true;
                    self.coordinator.cluster.holding_vip = true;
                }
            }
            Action::StartDeescalation => {
                if self.escalation.de_escalate().await {
                    self.coordinator.cluster.local.escalated = false;
                    self.coordinator.cluster.holding_vip = false;
                }
            }
            Action::ReconnectPeer(node_id) => {
                if let Some(node) = self.coordinator.cluster.remote_ref(node_id) {
                    let tx = self.peer_tx.clone();
                    let hostname = node.hostname.clone();
                    let wd_port = node.wd_port;
                    let timeout = self.coordinator.config.reply_timeout;
                    tokio::spawn(async move {
                        connection::connect_outbound(node_id, hostname, wd_port, timeout, tx)
                            .await;
                    });
                }
            }
            Action::ExitProcess(code) => {
                info!(code, "exiting");
                std::process::exit(code);
            }
            Action::IpcReply { client, reply } => {
                self.ipc_clients.reply(client, &reply).await;
            }
            Action::NotifyClients(notification) => {
                self.ipc_clients.broadcast_notification(&notification).await;
            }
        }
    }

    async fn handle_peer_conn_event(&mut self, event: PeerConnEvent) {
        match event {
            PeerConnEvent::Accepted { conn_id, writer } => {
                self.peer_conns.stash_pending(conn_id, writer);
            }
            PeerConnEvent::UnidentifiedPacket { conn_id, packet } => {
                self.identify_and_route(conn_id, packet).await;
            }
            PeerConnEvent::UnidentifiedClosed { conn_id } => {
                self.peer_conns.drop_pending(conn_id);
            }
            PeerConnEvent::Packet {
                node_id, packet, ..
            } => {
                if let Some(node) = self.coordinator.cluster.remote_mut(node_id) {
                    node.last_rcv_time = Instant::now();
                }
                if let Some((client, _)) = self.pending_failover_forwards.remove(&packet.command_id) {
                    let reply = match packet.packet_type {
                        PacketType::FailoverStart | PacketType::Accept => {
                            IpcReply::ok(serde_json::json!({ "status": "proceed" }))
                        }
                        PacketType::FailoverWaitingForConsensus => IpcReply::cluster_in_transition(),
                        PacketType::Reject => IpcReply::leader_rejected(),
                        _ => IpcReply::bad("unexpected reply from leader"),
                    };
                    self.ipc_clients.reply(client, &reply).await;
                    return;
                }
                self.pending
                    .push_back(Event::PacketRcv { from: node_id, packet });
            }
            PeerConnEvent::Closed { node_id, kind } => {
                self.peer_conns.remove(node_id, kind);
                if let Some(node) = self.coordinator.cluster.remote_mut(node_id) {
                    if !node.is_reachable() {
                        node.mark_lost(crate::watchdog::node::NodeLostReason::SocketClosed);
                        self.coordinator.commands.mark_peer_lost(node_id);
                        self.pending.push_back(Event::RemoteNodeLost(node_id));
                    }
                }
            }
            PeerConnEvent::OutboundConnected { node_id, writer } => {
                self.peer_conns.insert(node_id, SocketKind::Client, writer);
                if let Some(node) = self.coordinator.cluster.remote_mut(node_id) {
                    node.client_socket.set(SocketState::Connected);
                }
                self.pending
                    .push_back(Event::NewOutboundConnection(node_id));
                self.pending.push_back(Event::RemoteNodeFound(node_id));
            }
            PeerConnEvent::OutboundFailed { node_id, reason } => {
                debug!(node_id, reason, "outbound connect failed");
            }
        }
    }

    /// A freshly accepted, unidentified connection's first packet must be
    /// `ADD_NODE` (spec §4.1); once decoded we learn which configured peer
    /// this socket belongs to and promote it out of the pending table.
    async fn identify_and_route(&mut self, conn_id: ConnId, packet: crate::watchdog::packet::WdPacketData) {
        if packet.packet_type != PacketType::AddNode {
            debug!(?conn_id, "first packet on unidentified socket was not ADD_NODE; dropping");
            self.peer_conns.drop_pending(conn_id);
            return;
        }
        let payload: crate::watchdog::packet::AddNodePayload = match packet.parse_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(?conn_id, error = %e, "malformed ADD_NODE payload");
                self.peer_conns.drop_pending(conn_id);
                return;
            }
        };

        if payload.data_version_major > crate::watchdog::node::DATA_VERSION_MAJOR {
            warn!(?conn_id, "peer's protocol major version is newer than ours");
            self.peer_conns.drop_pending(conn_id);
            return;
        }

        if let Some(auth_key) = &self.coordinator.config.auth_key {
            let valid = payload
                .authkey
                .as_deref()
                .map(|candidate| {
                    crate::watchdog::auth::verify_authkey(
                        candidate,
                        &payload.state,
                        payload.wd_port,
                        auth_key,
                    )
                })
                .unwrap_or(false);
            if !valid {
                self.peer_conns.drop_pending(conn_id);
                return;
            }
        }

        let node_id = payload.pgpool_node_id;
        let Some(writer) = self.peer_conns.take_pending(conn_id) else {
            return;
        };
        if self.coordinator.cluster.remote_ref(node_id).is_none() {
            warn!(node_id, "ADD_NODE claimed a node_id with no matching configured slot");
            return;
        }
        self.peer_conns.insert(node_id, SocketKind::Server, writer);
        if let Some(node) = self.coordinator.cluster.remote_mut(node_id) {
            node.server_socket.set(SocketState::Connected);
            crate::watchdog::membership::restore_on_add_node(node);
        }
        self.pending.push_back(Event::RemoteNodeFound(node_id));
        let beacon = self.coordinator.own_beacon_payload(Instant::now());
        let reply = crate::watchdog::packet::WdPacketData::json(PacketType::Info, packet.command_id, &beacon)
            .unwrap_or_else(|_| crate::watchdog::packet::WdPacketData::empty(PacketType::Info, packet.command_id));
        let _ = self.peer_conns.send(node_id, reply).await;
    }

    async fn handle_ipc_conn_event(&mut self, event: IpcConnEvent) {
        match event {
            IpcConnEvent::Connected(client, writer) => {
                self.ipc_clients.insert(client, writer);
            }
            IpcConnEvent::Disconnected(client) => {
                self.ipc_clients.remove(client);
            }
            IpcConnEvent::Request(client, request) => {
                use crate::watchdog::ipc::IpcRequestKind;

                if request.kind.is_internal_only()
                    && request.shared_key != Some(self.coordinator.cluster.ipc_shared_key)
                {
                    self.ipc_clients
                        .reply(client, &IpcReply::bad("invalid shared key"))
                        .await;
                    return;
                }

                match request.kind {
                    IpcRequestKind::RegisterForNotification => {
                        self.ipc_clients.subscribe(client);
                        self.ipc_clients.reply(client, &IpcReply::ok(serde_json::json!({}))).await;
                    }
                    IpcRequestKind::GetNodesList => {
                        let nodes: Vec<_> = std::iter::once(&self.coordinator.cluster.local)
                            .chain(self.coordinator.cluster.remote.iter())
                            .map(|n| {
                                serde_json::json!({
                                    "node_id": n.node_id,
                                    "name": n.name,
                                    "state": n.state.as_wire_str(),
                                })
                            })
                            .collect();
                        self.ipc_clients
                            .reply(client, &IpcReply::ok(serde_json::json!({ "nodes": nodes })))
                            .await;
                    }
                    IpcRequestKind::IpcFailoverCommand => {
                        self.handle_ipc_failover_command(client, request).await;
                    }
                    _ => {
                        self.ipc_clients
                            .reply(client, &IpcReply::bad("not implemented"))
                            .await;
                    }
                }
            }
        }
    }

    async fn handle_ipc_failover_command(
        &mut self,
        client: crate::watchdog::ipc::IpcClientId,
        request: crate::watchdog::ipc::IpcRequest,
    ) {
        use crate::watchdog::cluster::Leader;
        use crate::watchdog::failover::{FailoverFlags, FailoverRequestKind, FailoverVerdict};
        use crate::watchdog::packet::FailoverRequestPayload;

        if self.coordinator.cluster.is_leader_local() {
            let payload: FailoverRequestPayload = match serde_json::from_value(request.payload) {
                Ok(p) => p,
                Err(_) => {
                    self.ipc_clients
                        .reply(client, &IpcReply::bad("malformed failover request"))
                        .await;
                    return;
                }
            };
            let Some(kind) = FailoverRequestKind::from_wire_str(&payload.request_kind) else {
                self.ipc_clients
                    .reply(client, &IpcReply::bad("unknown failover request kind"))
                    .await;
                return;
            };
            let local_node_id = self.coordinator.config.local_node_id;
            let verdict = self.coordinator.evaluate_failover_request(
                kind,
                payload.node_ids,
                local_node_id,
                FailoverFlags {
                    confirmed: payload.confirmed,
                },
                Instant::now(),
            );
            let reply = match verdict {
                FailoverVerdict::Proceed => {
                    IpcReply::ok(serde_json::json!({ "status": "proceed" }))
                }
                FailoverVerdict::BuildingConsensus => IpcReply::cluster_in_transition(),
                FailoverVerdict::NoQuorum => IpcReply::bad("NO_QUORUM"),
            };
            self.ipc_clients.reply(client, &reply).await;
            return;
        }

        match self.coordinator.cluster.leader {
            Some(Leader::Remote(leader_id)) => {
                let command_id = self.coordinator.commands.next_command_id();
                let packet = crate::watchdog::packet::WdPacketData::json(
                    PacketType::RemoteFailoverRequest,
                    command_id.0,
                    &request.payload,
                );
                match packet {
                    Ok(packet) => {
                        if let Err(e) = self.peer_conns.send(leader_id, packet).await {
                            warn!(error = %e, "failed to forward failover request to leader");
                            self.ipc_clients
                                .reply(client, &IpcReply::bad("leader unreachable"))
                                .await;
                        } else {
                            // Wait for the leader's ACCEPT/REJECT/FAILOVER_START reply
                            // (spec scenario 6); `handle_peer_conn_event` intercepts it
                            // by `command_id` and translates it into the IPC reply.
                            let deadline = Instant::now() + self.coordinator.config.reply_timeout;
                            self.pending_failover_forwards
                                .insert(command_id.0, (client, deadline));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to encode failover request");
                        self.ipc_clients.reply(client, &IpcReply::bad("encoding error")).await;
                    }
                }
            }
            _ => {
                self.ipc_clients.reply(client, &IpcReply::timeout()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EscalationConfig, FailoverConfig, MembershipConfig, NodeConfig, QuorumConfig};
    use crate::watchdog::cluster::Leader;
    use crate::watchdog::ipc::{IpcClientId, IpcRequest, IpcRequestKind};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream, UnixStream};

    fn two_node_config(local_node_id: usize) -> WatchdogConfig {
        let nodes = vec![
            NodeConfig {
                name: "leader".to_string(),
                hostname: "127.0.0.1".to_string(),
                wd_port: 9100,
                pool_port: 5432,
                priority: 10,
                delegate_ip: None,
            },
            NodeConfig {
                name: "standby".to_string(),
                hostname: "127.0.0.1".to_string(),
                wd_port: 9101,
                pool_port: 5432,
                priority: 5,
                delegate_ip: None,
            },
        ];
        WatchdogConfig {
            local_node_id,
            nodes,
            auth_key: None,
            ipc_socket_dir: "/tmp".to_string(),
            ipc_auth_required: false,
            reply_timeout: Duration::from_secs(5),
            beacon_interval: Duration::from_secs(10),
            beacon_miss_threshold: 3,
            quorum: QuorumConfig::default(),
            failover: FailoverConfig::default(),
            membership: MembershipConfig::default(),
            escalation: EscalationConfig::default(),
            log_level: "info".to_string(),
        }
    }

    async fn connected_peer_writer() -> tokio::net::tcp::OwnedWriteHalf {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        // Drain whatever the leader "receives" so the write side never blocks.
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let mut stream = server_stream;
            loop {
                match stream.try_read(&mut buf) {
                    Ok(0) => break,
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        });
        let (_, write_half) = client.into_split();
        write_half
    }

    #[tokio::test]
    async fn ipc_failover_forward_translates_leader_accept_to_result_ok() {
        let mut event_loop = EventLoop::new(Arc::new(two_node_config(1)));
        event_loop.coordinator.cluster.leader = Some(Leader::Remote(0));
        event_loop
            .peer_conns
            .insert(0, SocketKind::Client, connected_peer_writer().await);

        let (mut test_end, ipc_end) = UnixStream::pair().unwrap();
        let (_, ipc_write) = ipc_end.into_split();
        let client = IpcClientId(1);
        event_loop.ipc_clients.insert(client, ipc_write);

        let request = IpcRequest {
            kind: IpcRequestKind::IpcFailoverCommand,
            shared_key: Some(event_loop.coordinator.cluster.ipc_shared_key),
            payload: serde_json::json!({ "RequestKind": "NODE_DOWN", "NodeIds": [1] }),
        };
        event_loop.handle_ipc_failover_command(client, request).await;
        assert_eq!(event_loop.pending_failover_forwards.len(), 1);
        let command_id = *event_loop.pending_failover_forwards.keys().next().unwrap();

        event_loop
            .handle_peer_conn_event(PeerConnEvent::Packet {
                node_id: 0,
                kind: SocketKind::Client,
                packet: crate::watchdog::packet::WdPacketData::empty(
                    PacketType::FailoverStart,
                    command_id,
                ),
            })
            .await;

        assert!(event_loop.pending_failover_forwards.is_empty());
        let mut buf = [0u8; 256];
        let n = test_end.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], crate::watchdog::ipc::IpcReplyTag::ResultOk as u8);
        assert!(n >= 5);
    }
}
