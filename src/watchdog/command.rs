// src/watchdog/command.rs

//! Outstanding cluster commands: one-shot broadcasts that need replies from
//! zero or more peers before anything downstream can proceed (spec §4.5).
//!
//! Grounded on the request/reply correlation `spineldb::core::warden::client`
//! performs per-connection, generalized here to track a single logical
//! request across every targeted peer at once via a monotonic `command_id`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::watchdog::packet::{PacketType, WdPacketData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Local,
    Ipc(crate::watchdog::ipc::IpcClientId),
    Remote(usize),
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Init,
    Sent,
    Replied,
    SendError,
    DoNotSend,
}

#[derive(Debug, Clone)]
pub struct ResultSlot {
    pub peer: usize,
    pub state: SlotState,
    pub reply_type: Option<PacketType>,
    pub reply_data: Option<WdPacketData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    InProgress,
    AllReplied,
    Timeout,
    NodeRejected,
    SendFailed,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub id: CommandId,
    pub source: CommandSource,
    pub request: WdPacketData,
    pub slots: HashMap<usize, ResultSlot>,
    pub send_to: u32,
    pub replied_from: u32,
    pub send_error: u32,
    pub deadline: Instant,
    pub status: CommandStatus,
}

impl Command {
    fn recompute_status(&mut self, total_remotes: u32) {
        if self.status != CommandStatus::InProgress {
            return;
        }
        let do_not_send = self
            .slots
            .values()
            .filter(|s| s.state == SlotState::DoNotSend)
            .count() as u32;
        debug_assert_eq!(self.send_to + self.send_error + do_not_send, total_remotes);

        if self.replied_from >= self.send_to && self.send_to > 0 {
            self.status = CommandStatus::AllReplied;
        } else if self.send_to == 0 && self.replied_from == 0 {
            // Nothing left to wait for (every target was pruned or never had
            // anything sent to it in the first place).
            self.status = CommandStatus::AllReplied;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != CommandStatus::InProgress
    }
}

/// Tracks every in-flight command, keyed by `command_id`. Owned exclusively
/// by the event loop, same as every other piece of cluster state (spec §5).
#[derive(Debug, Default)]
pub struct CommandTracker {
    next_id: u32,
    commands: HashMap<CommandId, Command>,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            commands: HashMap::new(),
        }
    }

    pub fn next_command_id(&mut self) -> CommandId {
        let id = CommandId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Registers a new command targeting `targets`, due to time out at `now +
    /// timeout`.
    pub fn register(
        &mut self,
        id: CommandId,
        source: CommandSource,
        request: WdPacketData,
        targets: &[usize],
        timeout: Duration,
        now: Instant,
    ) {
        let slots = targets
            .iter()
            .map(|&peer| {
                (
                    peer,
                    ResultSlot {
                        peer,
                        state: SlotState::Sent,
                        reply_type: None,
                        reply_data: None,
                    },
                )
            })
            .collect();

        self.commands.insert(
            id,
            Command {
                id,
                source,
                request,
                slots,
                send_to: targets.len() as u32,
                replied_from: 0,
                send_error: 0,
                deadline: now + timeout,
                status: CommandStatus::InProgress,
            },
        );
    }

    pub fn get(&self, id: CommandId) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub fn remove(&mut self, id: CommandId) -> Option<Command> {
        self.commands.remove(&id)
    }

    /// Records a reply from `peer` for `id`. A `REJECT`/`ERROR` reply
    /// short-circuits the command to `NodeRejected`.
    pub fn record_reply(&mut self, id: CommandId, peer: usize, reply: WdPacketData) {
        let Some(cmd) = self.commands.get_mut(&id) else {
            return;
        };
        if cmd.status != CommandStatus::InProgress {
            return;
        }
        if let Some(slot) = cmd.slots.get_mut(&peer) {
            if slot.state != SlotState::Sent {
                return;
            }
            slot.state = SlotState::Replied;
            slot.reply_type = Some(reply.packet_type);
            slot.reply_data = Some(reply);
            cmd.replied_from += 1;

            if matches!(
                slot.reply_type,
                Some(PacketType::Reject) | Some(PacketType::Error)
            ) {
                cmd.status = CommandStatus::NodeRejected;
                return;
            }
        }
        cmd.recompute_status(cmd.send_to + cmd.send_error);
    }

    /// A peer is now known lost: remove it from every in-flight command's
    /// wait set.
    pub fn mark_peer_lost(&mut self, peer: usize) {
        for cmd in self.commands.values_mut() {
            if cmd.status != CommandStatus::InProgress {
                continue;
            }
            if let Some(slot) = cmd.slots.get_mut(&peer) {
                if slot.state == SlotState::Sent {
                    slot.state = SlotState::DoNotSend;
                    cmd.send_to = cmd.send_to.saturating_sub(1);
                }
            }
            let total = cmd.send_to + cmd.send_error;
            cmd.recompute_status(total);
        }
    }

    /// A peer whose slot was `SendError` is reachable again: retry it.
    pub fn retry_send_errors(&mut self, peer: usize) -> Vec<(CommandId, WdPacketData)> {
        let mut retries = Vec::new();
        for cmd in self.commands.values_mut() {
            if cmd.status != CommandStatus::InProgress {
                continue;
            }
            if let Some(slot) = cmd.slots.get_mut(&peer) {
                if slot.state == SlotState::SendError {
                    slot.state = SlotState::Sent;
                    cmd.send_error = cmd.send_error.saturating_sub(1);
                    cmd.send_to += 1;
                    retries.push((cmd.id, cmd.request.clone()));
                }
            }
        }
        retries
    }

    pub fn mark_send_error(&mut self, id: CommandId, peer: usize) {
        let Some(cmd) = self.commands.get_mut(&id) else {
            return;
        };
        if let Some(slot) = cmd.slots.get_mut(&peer) {
            if slot.state == SlotState::Sent {
                slot.state = SlotState::SendError;
                cmd.send_to = cmd.send_to.saturating_sub(1);
                cmd.send_error += 1;
            }
        }
        let total = cmd.send_to + cmd.send_error;
        cmd.recompute_status(total);
    }

    /// Expires every command whose deadline has passed, returning their ids.
    pub fn expire_overdue(&mut self, now: Instant) -> Vec<CommandId> {
        let mut expired = Vec::new();
        for cmd in self.commands.values_mut() {
            if cmd.status == CommandStatus::InProgress && now >= cmd.deadline {
                cmd.status = CommandStatus::Timeout;
                expired.push(cmd.id);
            }
        }
        expired
    }

    pub fn finished_ids(&self) -> Vec<CommandId> {
        self.commands
            .iter()
            .filter(|(_, c)| c.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::packet::WdPacketData;
    use std::time::Duration;

    fn sample_request() -> WdPacketData {
        WdPacketData::empty(PacketType::ReqInfo, 0)
    }

    #[test]
    fn all_replied_when_every_target_answers() {
        let mut tracker = CommandTracker::new();
        let id = tracker.next_command_id();
        let now = Instant::now();
        tracker.register(
            id,
            CommandSource::Local,
            sample_request(),
            &[1, 2],
            Duration::from_secs(5),
            now,
        );
        tracker.record_reply(id, 1, WdPacketData::empty(PacketType::Info, 0));
        assert_eq!(tracker.get(id).unwrap().status, CommandStatus::InProgress);
        tracker.record_reply(id, 2, WdPacketData::empty(PacketType::Info, 0));
        assert_eq!(tracker.get(id).unwrap().status, CommandStatus::AllReplied);
    }

    #[test]
    fn reject_reply_short_circuits_to_node_rejected() {
        let mut tracker = CommandTracker::new();
        let id = tracker.next_command_id();
        let now = Instant::now();
        tracker.register(
            id,
            CommandSource::Local,
            sample_request(),
            &[1, 2],
            Duration::from_secs(5),
            now,
        );
        tracker.record_reply(id, 1, WdPacketData::empty(PacketType::Reject, 0));
        assert_eq!(
            tracker.get(id).unwrap().status,
            CommandStatus::NodeRejected
        );
    }

    #[test]
    fn peer_lost_reduces_send_to_and_can_complete_command() {
        let mut tracker = CommandTracker::new();
        let id = tracker.next_command_id();
        let now = Instant::now();
        tracker.register(
            id,
            CommandSource::Local,
            sample_request(),
            &[1, 2],
            Duration::from_secs(5),
            now,
        );
        tracker.record_reply(id, 1, WdPacketData::empty(PacketType::Info, 0));
        tracker.mark_peer_lost(2);
        assert_eq!(tracker.get(id).unwrap().status, CommandStatus::AllReplied);
    }

    #[test]
    fn overdue_commands_expire() {
        let mut tracker = CommandTracker::new();
        let id = tracker.next_command_id();
        let now = Instant::now();
        tracker.register(
            id,
            CommandSource::Local,
            sample_request(),
            &[1],
            Duration::from_secs(1),
            now,
        );
        let expired = tracker.expire_overdue(now + Duration::from_secs(2));
        assert_eq!(expired, vec![id]);
        assert_eq!(tracker.get(id).unwrap().status, CommandStatus::Timeout);
    }

    #[test]
    fn invariant_p4_send_to_plus_errors_plus_do_not_send_equals_remote_count() {
        let mut tracker = CommandTracker::new();
        let id = tracker.next_command_id();
        let now = Instant::now();
        tracker.register(
            id,
            CommandSource::Local,
            sample_request(),
            &[1, 2, 3],
            Duration::from_secs(5),
            now,
        );
        tracker.mark_peer_lost(2);
        tracker.mark_send_error(id, 3);
        let cmd = tracker.get(id).unwrap();
        let do_not_send = cmd
            .slots
            .values()
            .filter(|s| s.state == SlotState::DoNotSend)
            .count() as u32;
        assert_eq!(cmd.send_to + cmd.send_error + do_not_send, 3);
    }
}
