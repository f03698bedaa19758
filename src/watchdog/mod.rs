// src/watchdog/mod.rs

//! The watchdog cluster coordinator: peer protocol, cluster state machine,
//! membership/quorum, failover consensus, and the local IPC server.
//!
//! Entry point mirrors `spineldb::core::warden::run`: build shared state from
//! config, then drive the event loop until shutdown.

pub mod auth;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod escalation;
pub mod events;
pub mod eventloop;
pub mod failover;
pub mod ipc;
pub mod membership;
pub mod node;
pub mod packet;
pub mod state_machine;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::WatchdogConfig;
use eventloop::EventLoop;

/// Runs the watchdog coordinator until it exits (either via a fatal
/// configuration mismatch, per spec §7, or a clean shutdown signal).
pub async fn run(config: WatchdogConfig) -> Result<()> {
    info!(
        local_node = config.local().name,
        peers = config.nodes.len() - 1,
        "starting quorumd watchdog"
    );
    let event_loop = EventLoop::new(Arc::new(config));
    event_loop.run().await
}
