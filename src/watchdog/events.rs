// src/watchdog/events.rs

//! The event vocabulary the cluster state machine reacts to (spec §4.2),
//! plus the `Action`s handlers emit. Keeping state transitions as pure
//! `Event -> Vec<Action>` functions (see `state_machine.rs`) is what makes
//! the consensus logic testable without a real socket in play, the same
//! separation `spineldb::core::warden::worker` gets for free by returning
//! plain values from `check_failover_status` et al.

use crate::watchdog::command::CommandId;
use crate::watchdog::ipc::{IpcClientId, IpcRequest};
use crate::watchdog::packet::WdPacketData;

#[derive(Debug, Clone)]
pub enum Event {
    /// Self-fired immediately on entering a new state.
    StateChanged,
    /// The current state's self-timer elapsed.
    Timeout,
    /// A fully decoded packet arrived from a peer connection.
    PacketRcv { from: usize, packet: WdPacketData },
    /// A tracked command reached a terminal status.
    CommandFinished(CommandId),
    /// A previously-unreachable peer's outbound socket became writable.
    NewOutboundConnection(usize),
    NwIpRemoved,
    NwIpAssigned,
    NwLinkInactive,
    NwLinkActive,
    LocalNodeLost,
    LocalNodeFound,
    RemoteNodeLost(usize),
    RemoteNodeFound(usize),
    ClusterQuorumChanged,
    WdStateRequireReload,
    IAmAppearingLost,
    IAmAppearingFound,
    /// A request arrived on the local IPC socket.
    IpcRequest {
        client: IpcClientId,
        request: IpcRequest,
    },
    Shutdown,
}

/// A side effect the event loop must carry out on behalf of a handler. State
/// machine code returns these instead of performing I/O directly, so handlers
/// stay unit-testable (spec §9: "coroutine-style wait for reply" is modeled
/// by the command tracker, not by blocking inside a handler).
#[derive(Debug, Clone)]
pub enum Action {
    SendTo {
        node_id: usize,
        packet: WdPacketData,
    },
    Broadcast {
        packet: WdPacketData,
    },
    /// Arm the per-state self-timer; firing delivers `Event::Timeout`.
    ArmTimer(std::time::Duration),
    /// Queue another event for immediate processing in the same iteration,
    /// used for `STATE_CHANGED` on entry to a new state.
    FireEvent(Event),
    StartEscalation,
    StartDeescalation,
    ReconnectPeer(usize),
    ExitProcess(i32),
    IpcReply {
        client: IpcClientId,
        reply: crate::watchdog::ipc::IpcReply,
    },
    NotifyClients(crate::watchdog::ipc::Notification),
}
