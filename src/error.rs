// src/error.rs

//! Typed, recoverable errors produced by the watchdog core.
//!
//! Grounded on `spineldb::core::errors::SpinelDBError`: a `thiserror` enum for
//! everything the event loop needs to branch on, kept separate from the
//! `anyhow::Result` used at the process/IO boundary in `main.rs`/`config.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchdogError {
    /// Malformed packet header, truncated/invalid JSON payload, or a peer
    /// announcing a protocol major version higher than ours.
    #[error("invalid packet from peer {node_id:?}: {reason}")]
    InvalidPacket {
        node_id: Option<usize>,
        reason: String,
    },

    /// Shared-key mismatch on `ADD_NODE` or an internal-only IPC request.
    #[error("authentication failed for peer {node_id:?}")]
    AuthFailed { node_id: Option<usize> },

    /// Socket error, missed beacons beyond the threshold, or exhausted
    /// send-failure count.
    #[error("peer {node_id} is unreachable: {reason}")]
    PeerUnreachable { node_id: usize, reason: String },

    /// Every monitored network interface is down, or there is no usable
    /// local address.
    #[error("no usable network interface")]
    NetworkDown,

    /// A peer rejected our `ADD_NODE`, or we rejected theirs: the cluster
    /// cannot agree on configuration.
    #[error("configuration mismatch with peer {node_id:?}: {reason}")]
    ConfigMismatch {
        node_id: Option<usize>,
        reason: String,
    },

    /// A command's deadline passed before every targeted peer replied.
    #[error("command {command_id} timed out waiting for replies")]
    CommandTimeout { command_id: u32 },

    /// Two nodes are simultaneously COORDINATOR; the tie-break in
    /// `state_machine` resolves it, but the condition is worth a typed error
    /// for logging and test assertions.
    #[error("split-brain detected against peer {node_id}")]
    SplitBrain { node_id: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type WatchdogResult<T> = Result<T, WatchdogError>;
