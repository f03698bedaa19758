// src/watchdog/failover.rs

//! Failover-consensus engine (spec §4.4): coalesces identical failover
//! requests from multiple nodes, gates them on quorum and policy, and emits
//! a verdict.
//!
//! Grounded on `spineldb::core::warden::worker::check_election_status`'s
//! vote-counting shape and `spineldb::core::warden::failover::start_failover`'s
//! pipeline, generalized from "one epoch's worth of votes for a single
//! master" to arbitrary `(kind, node_ids)` failover requests.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::watchdog::node::QuorumStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailoverRequestKind {
    NodeDown,
    NodeUp,
    Promote,
}

impl FailoverRequestKind {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            FailoverRequestKind::NodeDown => "NODE_DOWN",
            FailoverRequestKind::NodeUp => "NODE_UP",
            FailoverRequestKind::Promote => "PROMOTE",
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "NODE_DOWN" => Some(FailoverRequestKind::NodeDown),
            "NODE_UP" => Some(FailoverRequestKind::NodeUp),
            "PROMOTE" => Some(FailoverRequestKind::Promote),
            _ => None,
        }
    }
}

/// Request flags that can accompany a failover request; `Confirmed` lets a
/// single trusted caller (e.g. the life-check subsystem reporting a
/// corroborated outage) bypass consensus entirely (spec §4.4, short-circuit
/// #2: `REQ_DETAIL_CONFIRMED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailoverFlags {
    pub confirmed: bool,
}

impl FailoverFlags {
    pub fn merge(self, other: FailoverFlags) -> FailoverFlags {
        FailoverFlags {
            confirmed: self.confirmed || other.confirmed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverObject {
    pub id: u32,
    pub request_kind: FailoverRequestKind,
    pub node_ids: Vec<usize>,
    pub requesting_nodes: Vec<usize>,
    pub flags: FailoverFlags,
    pub start_time: Instant,
}

impl FailoverObject {
    /// Two requests match iff kind and node-id set are equal (spec §3).
    fn matches(&self, kind: FailoverRequestKind, node_ids: &[usize]) -> bool {
        if self.request_kind != kind {
            return false;
        }
        let ours: HashSet<usize> = self.node_ids.iter().copied().collect();
        let theirs: HashSet<usize> = node_ids.iter().copied().collect();
        ours == theirs
    }

    pub fn request_count(&self) -> u32 {
        self.requesting_nodes.len() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverVerdict {
    Proceed,
    BuildingConsensus,
    NoQuorum,
}

#[derive(Debug, Default)]
pub struct FailoverEngine {
    next_id: u32,
    objects: Vec<FailoverObject>,
}

impl FailoverEngine {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            objects: Vec::new(),
        }
    }

    pub fn objects(&self) -> &[FailoverObject] {
        &self.objects
    }

    /// Registers a failover request from `requester` and returns the
    /// consensus verdict, per spec §4.4's three short-circuits followed by
    /// vote counting against `consensus_threshold`.
    ///
    /// When `Proceed` is returned, the matching object (if one existed) has
    /// already been consumed and removed.
    #[allow(clippy::too_many_arguments)]
    pub fn request_failover(
        &mut self,
        kind: FailoverRequestKind,
        mut node_ids: Vec<usize>,
        requester: usize,
        flags: FailoverFlags,
        failover_when_quorum_exists: bool,
        quorum_status: QuorumStatus,
        consensus_threshold: u32,
        allow_multiple_requests_from_node: bool,
        now: Instant,
    ) -> FailoverVerdict {
        node_ids.sort_unstable();

        if !failover_when_quorum_exists {
            return FailoverVerdict::Proceed;
        }
        if flags.confirmed {
            return FailoverVerdict::Proceed;
        }
        if quorum_status == QuorumStatus::Lost {
            return FailoverVerdict::NoQuorum;
        }

        let existing_index = self
            .objects
            .iter()
            .position(|obj| obj.matches(kind, &node_ids));

        let index = match existing_index {
            Some(i) => i,
            None => {
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1).max(1);
                self.objects.push(FailoverObject {
                    id,
                    request_kind: kind,
                    node_ids: node_ids.clone(),
                    requesting_nodes: Vec::new(),
                    flags: FailoverFlags::default(),
                    start_time: now,
                });
                self.objects.len() - 1
            }
        };

        {
            let obj = &mut self.objects[index];
            let already_requested = obj.requesting_nodes.contains(&requester);
            if !already_requested || allow_multiple_requests_from_node {
                obj.requesting_nodes.push(requester);
            }
            obj.flags = obj.flags.merge(flags);
        }

        if self.objects[index].request_count() >= consensus_threshold {
            let obj = self.objects.remove(index);
            tracing::info!(
                failover_id = obj.id,
                kind = ?obj.request_kind,
                votes = obj.request_count(),
                "failover consensus reached"
            );
            FailoverVerdict::Proceed
        } else {
            FailoverVerdict::BuildingConsensus
        }
    }

    /// Removes and returns every object older than `timeout`.
    pub fn expire(&mut self, timeout: Duration, now: Instant) -> Vec<FailoverObject> {
        let (expired, remaining): (Vec<_>, Vec<_>) = self
            .objects
            .drain(..)
            .partition(|obj| now.duration_since(obj.start_time) >= timeout);
        self.objects = remaining;
        expired
    }
}
