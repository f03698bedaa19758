// src/watchdog/ipc.rs

//! Local Unix-domain IPC server (spec §4.7): the surrounding pooler process
//! talks to the watchdog core over this socket to ask for failover/recovery,
//! query cluster status, and subscribe to notifications.
//!
//! Framing mirrors the peer protocol minus `command_id`:
//! `type:u8 | length:u32_be | JSON`. Grounded on
//! `spineldb::core::warden::listener::run_listener`'s accept-loop/`Framed`
//! shape, adapted from TCP to a `UnixListener`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tracing::{debug, warn};

use crate::error::WatchdogError;

const IPC_HEADER_LEN: usize = 1 + 4;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcClientId(pub u64);

impl IpcClientId {
    fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpcRequestKind {
    NodeStatusChange = 1,
    RegisterForNotification = 2,
    GetNodesList = 3,
    GetRuntimeVariableValue = 4,
    IpcFailoverCommand = 5,
    IpcOnlineRecoveryCommand = 6,
    ExecuteClusterCommand = 7,
    GetLeaderDataRequest = 8,
    FailoverIndication = 9,
}

impl IpcRequestKind {
    /// Requests that must carry the process-internal shared key (spec §4.7).
    pub fn is_internal_only(self) -> bool {
        matches!(
            self,
            IpcRequestKind::IpcFailoverCommand
                | IpcRequestKind::IpcOnlineRecoveryCommand
                | IpcRequestKind::ExecuteClusterCommand
                | IpcRequestKind::GetLeaderDataRequest
                | IpcRequestKind::FailoverIndication
        )
    }
}

impl TryFrom<u8> for IpcRequestKind {
    type Error = WatchdogError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use IpcRequestKind::*;
        Ok(match byte {
            1 => NodeStatusChange,
            2 => RegisterForNotification,
            3 => GetNodesList,
            4 => GetRuntimeVariableValue,
            5 => IpcFailoverCommand,
            6 => IpcOnlineRecoveryCommand,
            7 => ExecuteClusterCommand,
            8 => GetLeaderDataRequest,
            9 => FailoverIndication,
            other => {
                return Err(WatchdogError::InvalidPacket {
                    node_id: None,
                    reason: format!("unknown ipc request type {other}"),
                });
            }
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpcEnvelope {
    #[serde(default)]
    pub shared_key: Option<u32>,
    #[serde(flatten)]
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct IpcRequest {
    pub kind: IpcRequestKind,
    pub shared_key: Option<u32>,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcReplyTag {
    ResultOk = 1,
    ResultBad = 2,
    ClusterInTransition = 3,
    Timeout = 4,
    LeaderRejected = 5,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpcReply {
    #[serde(skip)]
    pub tag: IpcReplyTag,
    pub payload: Option<Value>,
}

impl IpcReply {
    pub fn ok(payload: Value) -> Self {
        Self {
            tag: IpcReplyTag::ResultOk,
            payload: Some(payload),
        }
    }

    pub fn bad(reason: &str) -> Self {
        Self {
            tag: IpcReplyTag::ResultBad,
            payload: Some(serde_json::json!({ "reason": reason })),
        }
    }

    pub fn cluster_in_transition() -> Self {
        Self {
            tag: IpcReplyTag::ClusterInTransition,
            payload: None,
        }
    }

    pub fn timeout() -> Self {
        Self {
            tag: IpcReplyTag::Timeout,
            payload: None,
        }
    }

    pub fn leader_rejected() -> Self {
        Self {
            tag: IpcReplyTag::LeaderRejected,
            payload: None,
        }
    }
}

/// Pushed to every client that issued `RegisterForNotification` (spec §4.7).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum Notification {
    StateChanged { node_id: usize, state: String },
    QuorumChanged { quorum_status: i8 },
    BackendStatus { node_id: usize, up: bool },
}

/// Raw framed IPC message, before `type` has been interpreted as a request
/// kind (used identically for encoding replies, whose tag byte comes from
/// `IpcReplyTag`).
struct IpcFrame {
    type_byte: u8,
    data: Bytes,
}

#[derive(Default)]
struct IpcCodec;

impl Decoder for IpcCodec {
    type Item = IpcFrame;
    type Error = WatchdogError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < IPC_HEADER_LEN {
            return Ok(None);
        }
        let type_byte = src[0];
        let length = u32::from_be_bytes(src[1..5].try_into().unwrap()) as usize;
        let total_len = IPC_HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }
        src.advance(IPC_HEADER_LEN);
        let data = src.split_to(length).freeze();
        Ok(Some(IpcFrame { type_byte, data }))
    }
}

impl Encoder<IpcFrame> for IpcCodec {
    type Error = WatchdogError;

    fn encode(&mut self, item: IpcFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(IPC_HEADER_LEN + item.data.len());
        dst.put_u8(item.type_byte);
        dst.put_u32(item.data.len() as u32);
        dst.extend_from_slice(&item.data);
        Ok(())
    }
}

pub fn encode_reply(reply: &IpcReply) -> Result<Bytes, WatchdogError> {
    let data = match &reply.payload {
        Some(value) => serde_json::to_vec(value)?,
        None => Vec::new(),
    };
    let mut buf = BytesMut::new();
    buf.put_u8(reply.tag as u8);
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(&data);
    Ok(buf.freeze())
}

pub fn encode_notification(notification: &Notification) -> Result<Bytes, WatchdogError> {
    let data = serde_json::to_vec(notification)?;
    let mut buf = BytesMut::new();
    buf.put_u8(IpcReplyTag::ResultOk as u8);
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(&data);
    Ok(buf.freeze())
}

/// Events delivered from the IPC listener's connection-handling tasks up to
/// the single owning event loop, mirroring `connection::PeerConnEvent`.
#[derive(Debug)]
pub enum IpcConnEvent {
    Connected(IpcClientId, OwnedWriteHalf),
    Request(IpcClientId, IpcRequest),
    Disconnected(IpcClientId),
}

/// Binds the IPC socket at `socket_path` (replacing a stale file left by a
/// previous run) and forwards every accepted connection's traffic to `tx`.
pub async fn run_ipc_listener(
    socket_path: PathBuf,
    tx: mpsc::Sender<IpcConnEvent>,
) -> std::io::Result<()> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path)?;
    debug!(path = %socket_path.display(), "ipc listener bound");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let client_id = IpcClientId::next();
        let (read_half, write_half) = stream.into_split();
        let tx = tx.clone();

        if tx
            .send(IpcConnEvent::Connected(client_id, write_half))
            .await
            .is_err()
        {
            return Ok(());
        }

        tokio::spawn(async move {
            let mut framed = FramedRead::new(read_half, IpcCodec);
            use futures::StreamExt;
            loop {
                match framed.next().await {
                    Some(Ok(frame)) => match parse_request(frame) {
                        Ok(request) => {
                            if tx
                                .send(IpcConnEvent::Request(client_id, request))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(?client_id, error = %e, "dropping malformed ipc request");
                        }
                    },
                    Some(Err(e)) => {
                        warn!(?client_id, error = %e, "ipc connection error");
                        break;
                    }
                    None => break,
                }
            }
            let _ = tx.send(IpcConnEvent::Disconnected(client_id)).await;
        });
    }
}

fn parse_request(frame: IpcFrame) -> Result<IpcRequest, WatchdogError> {
    let kind = IpcRequestKind::try_from(frame.type_byte)?;
    let envelope: IpcEnvelope = serde_json::from_slice(&frame.data)?;
    Ok(IpcRequest {
        kind,
        shared_key: envelope.shared_key,
        payload: envelope.payload,
    })
}

/// Writes one already-encoded reply/notification frame to a client's socket.
pub async fn write_frame(writer: &mut OwnedWriteHalf, frame: Bytes) -> std::io::Result<()> {
    writer.write_all(&frame).await
}

/// Table of live client write-halves plus which clients asked to be
/// notified, owned exclusively by the event loop.
#[derive(Default)]
pub struct IpcClients {
    writers: HashMap<IpcClientId, OwnedWriteHalf>,
    subscribers: std::collections::HashSet<IpcClientId>,
}

impl IpcClients {
    pub fn insert(&mut self, id: IpcClientId, writer: OwnedWriteHalf) {
        self.writers.insert(id, writer);
    }

    pub fn remove(&mut self, id: IpcClientId) {
        self.writers.remove(&id);
        self.subscribers.remove(&id);
    }

    pub fn subscribe(&mut self, id: IpcClientId) {
        self.subscribers.insert(id);
    }

    pub async fn reply(&mut self, id: IpcClientId, reply: &IpcReply) {
        if let Some(writer) = self.writers.get_mut(&id) {
            if let Ok(frame) = encode_reply(reply) {
                if write_frame(writer, frame).await.is_err() {
                    self.writers.remove(&id);
                }
            }
        }
    }

    pub async fn broadcast_notification(&mut self, notification: &Notification) {
        let Ok(frame) = encode_notification(notification) else {
            return;
        };
        let mut dead = Vec::new();
        for id in self.subscribers.iter().copied() {
            if let Some(writer) = self.writers.get_mut(&id) {
                if write_frame(writer, frame.clone()).await.is_err() {
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.remove(id);
        }
    }
}

#[allow(dead_code)]
fn socket_path_for(dir: &Path, wd_port: u16) -> PathBuf {
    dir.join(format!(".s.WDIPC.{wd_port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_only_kinds_are_flagged() {
        assert!(IpcRequestKind::IpcFailoverCommand.is_internal_only());
        assert!(!IpcRequestKind::GetNodesList.is_internal_only());
    }

    #[test]
    fn reply_encoding_carries_the_tag_byte() {
        let reply = IpcReply::ok(serde_json::json!({"a": 1}));
        let bytes = encode_reply(&reply).unwrap();
        assert_eq!(bytes[0], IpcReplyTag::ResultOk as u8);
    }

    #[test]
    fn socket_path_is_derived_from_port() {
        let path = socket_path_for(Path::new("/tmp"), 9000);
        assert_eq!(path, PathBuf::from("/tmp/.s.WDIPC.9000"));
    }
}
