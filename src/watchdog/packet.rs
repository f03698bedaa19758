// src/watchdog/packet.rs

//! Peer-to-peer wire framing.
//!
//! Layout: `type:u8 | command_id:u32_be | length:u32_be | data[length]`.
//! `data` is either empty, a single byte (a cluster-service sub-type), or
//! UTF-8 JSON. Decoding follows the incremental `Decoder`/`Encoder` pattern
//! `spineldb::core::protocol::resp_frame::RespFrameCodec` uses: return
//! `Ok(None)` on a partial header or body rather than blocking.

use crate::error::WatchdogError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 1 + 4 + 4;
/// Defensive upper bound on a single packet's payload; nothing in this
/// protocol legitimately needs more (the largest payload is an `ADD_NODE`
/// JSON document).
const MAX_PAYLOAD_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    AddNode = b'A',
    ReqInfo = b'B',
    DeclareCoordinator = b'C',
    Data = b'D',
    Error = b'E',
    Accept = b'G',
    Info = b'I',
    JoinCoordinator = b'J',
    IamCoordinator = b'M',
    Reject = b'R',
    StandForCoordinator = b'S',
    RemoteFailoverRequest = b'V',
    InformIAmGoingDown = b'X',
    AskForPoolConfig = b'Y',
    PoolConfigData = b'Z',
    CmdReplyInData = b'-',
    ClusterServiceMessage = b'#',
    ExecuteCommandRequest = b'!',
    FailoverStart = b'F',
    FailoverEnd = b'H',
    FailoverWaitingForConsensus = b'K',
}

impl PacketType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = WatchdogError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use PacketType::*;
        Ok(match byte {
            b'A' => AddNode,
            b'B' => ReqInfo,
            b'C' => DeclareCoordinator,
            b'D' => Data,
            b'E' => Error,
            b'G' => Accept,
            b'I' => Info,
            b'J' => JoinCoordinator,
            b'M' => IamCoordinator,
            b'R' => Reject,
            b'S' => StandForCoordinator,
            b'V' => RemoteFailoverRequest,
            b'X' => InformIAmGoingDown,
            b'Y' => AskForPoolConfig,
            b'Z' => PoolConfigData,
            b'-' => CmdReplyInData,
            b'#' => ClusterServiceMessage,
            b'!' => ExecuteCommandRequest,
            b'F' => FailoverStart,
            b'H' => FailoverEnd,
            b'K' => FailoverWaitingForConsensus,
            0 => {
                return Err(WatchdogError::InvalidPacket {
                    node_id: None,
                    reason: "type byte is 0".to_string(),
                });
            }
            other => {
                return Err(WatchdogError::InvalidPacket {
                    node_id: None,
                    reason: format!("unknown packet type byte {other:#x}"),
                });
            }
        })
    }
}

/// The one-byte sub-tag carried in the data field of a `ClusterServiceMessage`
/// (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceMessageKind {
    QuorumLost = 1,
    QuorumFound = 2,
    InSplitBrain = 3,
    NeedsElection = 4,
    IamTrueLeader = 5,
    IamNotTrueLeader = 6,
    IamResigningFromLeader = 7,
    NodeInvalidVersion = 8,
    NodeRequireToReload = 9,
    NodeAppearingLost = 10,
    NodeAppearingFound = 11,
}

impl TryFrom<u8> for ServiceMessageKind {
    type Error = WatchdogError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use ServiceMessageKind::*;
        Ok(match byte {
            1 => QuorumLost,
            2 => QuorumFound,
            3 => InSplitBrain,
            4 => NeedsElection,
            5 => IamTrueLeader,
            6 => IamNotTrueLeader,
            7 => IamResigningFromLeader,
            8 => NodeInvalidVersion,
            9 => NodeRequireToReload,
            10 => NodeAppearingLost,
            11 => NodeAppearingFound,
            other => {
                return Err(WatchdogError::InvalidPacket {
                    node_id: None,
                    reason: format!("unknown cluster-service sub-type {other}"),
                });
            }
        })
    }
}

/// One decoded peer-protocol packet (spec §3, `WDPacketData`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WdPacketData {
    pub packet_type: PacketType,
    pub command_id: u32,
    pub data: Bytes,
}

impl WdPacketData {
    pub fn new(packet_type: PacketType, command_id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            command_id,
            data: data.into(),
        }
    }

    pub fn empty(packet_type: PacketType, command_id: u32) -> Self {
        Self::new(packet_type, command_id, Bytes::new())
    }

    pub fn service_message(command_id: u32, kind: ServiceMessageKind) -> Self {
        Self::new(
            PacketType::ClusterServiceMessage,
            command_id,
            vec![kind as u8],
        )
    }

    pub fn json(
        packet_type: PacketType,
        command_id: u32,
        value: &impl serde::Serialize,
    ) -> Result<Self, WatchdogError> {
        let data = serde_json::to_vec(value)?;
        Ok(Self::new(packet_type, command_id, data))
    }

    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, WatchdogError> {
        serde_json::from_slice(&self.data)
    }

    pub fn service_kind(&self) -> Result<ServiceMessageKind, WatchdogError> {
        let byte = *self.data.first().ok_or(WatchdogError::InvalidPacket {
            node_id: None,
            reason: "cluster-service message carried no sub-type byte".to_string(),
        })?;
        ServiceMessageKind::try_from(byte)
    }
}

/// Peer-connection codec: 9-byte header + payload.
#[derive(Debug, Default)]
pub struct WdPacketCodec;

impl Decoder for WdPacketCodec {
    type Item = WdPacketData;
    type Error = WatchdogError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let type_byte = src[0];
        let command_id = u32::from_be_bytes(src[1..5].try_into().unwrap());
        let length = u32::from_be_bytes(src[5..9].try_into().unwrap());

        if length > MAX_PAYLOAD_LEN {
            return Err(WatchdogError::InvalidPacket {
                node_id: None,
                reason: format!("declared payload length {length} exceeds maximum"),
            });
        }

        let total_len = HEADER_LEN + length as usize;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let packet_type = PacketType::try_from(type_byte)?;
        src.advance(HEADER_LEN);
        let data = src.split_to(length as usize).freeze();

        Ok(Some(WdPacketData {
            packet_type,
            command_id,
            data,
        }))
    }
}

impl Encoder<WdPacketData> for WdPacketCodec {
    type Error = WatchdogError;

    fn encode(&mut self, item: WdPacketData, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HEADER_LEN + item.data.len());
        dst.put_u8(item.packet_type.as_byte());
        dst.put_u32(item.command_id);
        dst.put_u32(item.data.len() as u32);
        dst.extend_from_slice(&item.data);
        Ok(())
    }
}

/// `ADD_NODE` JSON payload (spec §6). Every field listed there is carried
/// here so P6 (round-trip identity) can be checked directly.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AddNodePayload {
    #[serde(rename = "PGPOOL_VERSION")]
    pub pgpool_version: String,
    #[serde(rename = "DATA_VERSION_MAJOR")]
    pub data_version_major: u8,
    #[serde(rename = "DATA_VERSION_MINOR")]
    pub data_version_minor: u8,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "WdPort")]
    pub wd_port: u16,
    #[serde(rename = "PgpoolPort")]
    pub pgpool_port: u16,
    #[serde(rename = "WdPriority")]
    pub wd_priority: i32,
    #[serde(rename = "PgpoolNodeId")]
    pub pgpool_node_id: usize,
    #[serde(rename = "NodeName")]
    pub node_name: String,
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "VIP")]
    pub vip: Option<String>,
    #[serde(rename = "SecondsSinceStartup")]
    pub seconds_since_startup: u64,
    #[serde(rename = "SecondsSinceCurrentState")]
    pub seconds_since_current_state: u64,
    #[serde(rename = "QuorumStatus")]
    pub quorum_status: i8,
    #[serde(rename = "AliveNodeCount")]
    pub alive_node_count: u32,
    #[serde(rename = "Escalated")]
    pub escalated: bool,
    #[serde(rename = "authkey", skip_serializing_if = "Option::is_none")]
    pub authkey: Option<String>,
}

/// The beacon payload carried by `IAM_COORDINATOR` (and `INFO` replies)
/// (spec §4.2).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BeaconPayload {
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "SecondsSinceStartup")]
    pub seconds_since_startup: u64,
    #[serde(rename = "SecondsSinceCurrentState")]
    pub seconds_since_current_state: u64,
    #[serde(rename = "QuorumStatus")]
    pub quorum_status: i8,
    #[serde(rename = "AliveNodeCount")]
    pub alive_node_count: u32,
    #[serde(rename = "Escalated")]
    pub escalated: bool,
}

/// Carried by a leader's `REJECT` of `JOIN_COORDINATOR` to distinguish a
/// plain retry-able rejection from "you've been declared lost" (spec §4.2
/// STANDBY handler).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RejectPayload {
    #[serde(default)]
    pub has_lost_us: bool,
}

/// `REMOTE_FAILOVER_REQUEST` payload (spec §4.4): identifies which backend(s)
/// the request concerns and whether it bypasses consensus.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FailoverRequestPayload {
    #[serde(rename = "RequestKind")]
    pub request_kind: String,
    #[serde(rename = "NodeIds")]
    pub node_ids: Vec<usize>,
    #[serde(rename = "Confirmed", default)]
    pub confirmed: bool,
}
