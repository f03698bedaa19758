//! Shared scaffolding for the cluster-scenario integration tests: builds a
//! small multi-node `WatchdogConfig`, spawns an `EventLoop` per node on real
//! loopback sockets, and speaks the raw IPC wire protocol (spec §4.7) to
//! observe cluster state the way the surrounding pooler would.

use std::path::Path;
use std::time::Duration;

use quorumd::config::{
    EscalationConfig, FailoverConfig, MembershipConfig, NodeConfig, QuorumConfig, WatchdogConfig,
};
use quorumd::watchdog::eventloop::EventLoop;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub struct ClusterNodeSpec {
    pub name: &'static str,
    pub wd_port: u16,
    pub priority: i32,
}

/// Builds one node's `WatchdogConfig`; every node shares `nodes`/`ipc_dir`
/// and differs only in `local_node_id`.
pub fn config_for(
    local_node_id: usize,
    specs: &[ClusterNodeSpec],
    ipc_dir: &Path,
    enable_consensus_with_half_votes: bool,
) -> WatchdogConfig {
    let nodes = specs
        .iter()
        .map(|s| NodeConfig {
            name: s.name.to_string(),
            hostname: "127.0.0.1".to_string(),
            wd_port: s.wd_port,
            pool_port: 5432,
            priority: s.priority,
            delegate_ip: None,
        })
        .collect();

    WatchdogConfig {
        local_node_id,
        nodes,
        auth_key: None,
        ipc_socket_dir: ipc_dir.to_string_lossy().into_owned(),
        ipc_auth_required: false,
        reply_timeout: Duration::from_millis(300),
        beacon_interval: Duration::from_millis(200),
        beacon_miss_threshold: 3,
        quorum: QuorumConfig {
            enable_consensus_with_half_votes,
        },
        failover: FailoverConfig::default(),
        membership: MembershipConfig {
            wd_remove_shutdown_nodes: false,
            wd_no_show_node_removal_timeout: Duration::from_secs(1800),
            wd_lost_node_removal_timeout: Duration::from_millis(300),
        },
        escalation: EscalationConfig::default(),
        log_level: "info".to_string(),
    }
}

/// Spawns one node's event loop on a fresh task. The returned handle is
/// aborted when the test's `#[tokio::test]` runtime is dropped, so tests
/// never need to shut these down explicitly.
pub fn spawn_node(config: WatchdogConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let event_loop = EventLoop::new(std::sync::Arc::new(config));
        let _ = event_loop.run().await;
    })
}

pub struct NodeSummary {
    pub node_id: usize,
    pub name: String,
    pub state: String,
}

/// Connects to a node's IPC socket, issues one request, and returns the
/// reply tag byte plus its decoded JSON payload. Frames are
/// `type/tag:u8 | length:u32_be | json`, matching `watchdog::ipc::IpcCodec`.
async fn ipc_roundtrip(ipc_dir: &Path, wd_port: u16, kind: u8, payload: Value) -> Option<(u8, Value)> {
    let socket_path = ipc_dir.join(format!(".s.WDIPC.{wd_port}"));
    let mut stream = UnixStream::connect(&socket_path).await.ok()?;

    let body = serde_json::to_vec(&payload).ok()?;
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(kind);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await.ok()?;

    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.ok()?;
    let tag = header[0];
    let len = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut data = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut data).await.ok()?;
    }
    let value = if data.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&data).ok()?
    };
    Some((tag, value))
}

/// `GetNodesList` (IPC request kind 3): the full node table as the running
/// node currently sees it.
pub async fn query_nodes(ipc_dir: &Path, wd_port: u16) -> Option<Vec<NodeSummary>> {
    let (tag, value) = ipc_roundtrip(ipc_dir, wd_port, 3, serde_json::json!({})).await?;
    if tag != 1 {
        return None;
    }
    let nodes = value.get("nodes")?.as_array()?;
    Some(
        nodes
            .iter()
            .map(|n| NodeSummary {
                node_id: n["node_id"].as_u64().unwrap() as usize,
                name: n["name"].as_str().unwrap().to_string(),
                state: n["state"].as_str().unwrap().to_string(),
            })
            .collect(),
    )
}

/// `IPC_FAILOVER_COMMAND` (IPC request kind 5): returns the reply tag byte
/// (see `watchdog::ipc::IpcReplyTag`) plus its payload.
pub async fn request_failover(
    ipc_dir: &Path,
    wd_port: u16,
    request_kind: &str,
    node_ids: &[usize],
) -> Option<(u8, Value)> {
    ipc_roundtrip(
        ipc_dir,
        wd_port,
        5,
        serde_json::json!({ "RequestKind": request_kind, "NodeIds": node_ids }),
    )
    .await
}

/// Polls `query_nodes` every 20ms until `pred` holds or `timeout` elapses.
pub async fn wait_until_nodes<F>(ipc_dir: &Path, wd_port: u16, timeout: Duration, pred: F) -> bool
where
    F: Fn(&[NodeSummary]) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(nodes) = query_nodes(ipc_dir, wd_port).await {
            if pred(&nodes) {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn node_state<'a>(nodes: &'a [NodeSummary], node_id: usize) -> Option<&'a str> {
    nodes
        .iter()
        .find(|n| n.node_id == node_id)
        .map(|n| n.state.as_str())
}
