// src/watchdog/connection.rs

//! Peer connection table (spec §3/§4.1): for each remote node, up to two
//! TCP sockets (one we accepted, one we dialed out), reconnection, and
//! reachability tracking.
//!
//! Grounded on `spineldb::core::warden::listener::run_listener`'s
//! accept-loop-plus-spawned-`Framed`-reader shape and
//! `spineldb::core::warden::client::WardenClient::connect`'s
//! timeout-guarded dial. A freshly accepted socket doesn't know which
//! configured peer it belongs to until its first packet (must be `ADD_NODE`,
//! spec §4.1) arrives — until then it is tracked by a bare connection id and
//! only promoted into the node-keyed table once identified (the
//! reconciliation rule from `SPEC_FULL.md` §4.9).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::watchdog::node::SocketState;
use crate::watchdog::packet::{WdPacketCodec, WdPacketData};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl ConnId {
    fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// The peer connected to us.
    Server,
    /// We connected to the peer.
    Client,
}

#[derive(Debug)]
pub enum PeerConnEvent {
    /// A new inbound socket accepted, not yet matched to a `node_id`.
    Accepted {
        conn_id: ConnId,
        writer: OwnedWriteHalf,
    },
    /// A packet arrived on an unidentified inbound connection.
    UnidentifiedPacket { conn_id: ConnId, packet: WdPacketData },
    /// A packet arrived on a connection already bound to `node_id`.
    Packet {
        node_id: usize,
        kind: SocketKind,
        packet: WdPacketData,
    },
    /// An unidentified inbound connection closed before sending `ADD_NODE`.
    UnidentifiedClosed { conn_id: ConnId },
    /// A node-bound connection closed.
    Closed { node_id: usize, kind: SocketKind },
    /// An outbound dial to `node_id` finished successfully.
    OutboundConnected {
        node_id: usize,
        writer: OwnedWriteHalf,
    },
    /// An outbound dial to `node_id` failed.
    OutboundFailed { node_id: usize, reason: String },
}

/// Accepts inbound peer connections on `bind_addr` and forwards their
/// traffic through `tx`. Runs until the listener errors.
pub async fn run_peer_listener(
    bind_addr: std::net::SocketAddr,
    tx: mpsc::Sender<PeerConnEvent>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    debug!(%bind_addr, "peer listener bound");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let conn_id = ConnId::next();
        let (read_half, write_half) = stream.into_split();
        debug!(?conn_id, %peer_addr, "accepted inbound peer connection");

        if tx
            .send(PeerConnEvent::Accepted {
                conn_id,
                writer: write_half,
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        let tx = tx.clone();
        tokio::spawn(async move {
            let mut framed = FramedRead::new(read_half, WdPacketCodec);
            loop {
                match framed.next().await {
                    Some(Ok(packet)) => {
                        if tx
                            .send(PeerConnEvent::UnidentifiedPacket { conn_id, packet })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(?conn_id, error = %e, "peer connection error");
                        break;
                    }
                    None => break,
                }
            }
            let _ = tx.send(PeerConnEvent::UnidentifiedClosed { conn_id }).await;
        });
    }
}

/// Dials out to a configured peer. Per spec §5, connect attempts are meant to
/// be non-blocking with a bounded wait for writability; `TcpStream::connect`
/// wrapped in `tokio::time::timeout` is the async equivalent.
pub async fn connect_outbound(
    node_id: usize,
    hostname: String,
    wd_port: u16,
    timeout: Duration,
    tx: mpsc::Sender<PeerConnEvent>,
) {
    let result = tokio::time::timeout(
        timeout,
        TcpStream::connect((hostname.as_str(), wd_port)),
    )
    .await;

    match result {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            let (read_half, write_half) = stream.into_split();
            if tx
                .send(PeerConnEvent::OutboundConnected {
                    node_id,
                    writer: write_half,
                })
                .await
                .is_err()
            {
                return;
            }
            tokio::spawn(async move {
                let mut framed = FramedRead::new(read_half, WdPacketCodec);
                loop {
                    match framed.next().await {
                        Some(Ok(packet)) => {
                            if tx
                                .send(PeerConnEvent::Packet {
                                    node_id,
                                    kind: SocketKind::Client,
                                    packet,
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(node_id, error = %e, "outbound peer connection error");
                            break;
                        }
                        None => break,
                    }
                }
                let _ = tx
                    .send(PeerConnEvent::Closed {
                        node_id,
                        kind: SocketKind::Client,
                    })
                    .await;
            });
        }
        Ok(Err(e)) => {
            let _ = tx
                .send(PeerConnEvent::OutboundFailed {
                    node_id,
                    reason: e.to_string(),
                })
                .await;
        }
        Err(_) => {
            let _ = tx
                .send(PeerConnEvent::OutboundFailed {
                    node_id,
                    reason: "connect timed out".to_string(),
                })
                .await;
        }
    }
}

/// Live write-halves for every peer, keyed by `node_id` and which of the two
/// slots is in use. Spec §3/P2: at most one of the two is actually used to
/// send at any given moment, but both may independently be `CONNECTED`.
#[derive(Default)]
pub struct PeerConnections {
    server_writers: HashMap<usize, OwnedWriteHalf>,
    client_writers: HashMap<usize, OwnedWriteHalf>,
    pending: HashMap<ConnId, OwnedWriteHalf>,
}

impl PeerConnections {
    pub fn stash_pending(&mut self, conn_id: ConnId, writer: OwnedWriteHalf) {
        self.pending.insert(conn_id, writer);
    }

    pub fn take_pending(&mut self, conn_id: ConnId) -> Option<OwnedWriteHalf> {
        self.pending.remove(&conn_id)
    }

    pub fn drop_pending(&mut self, conn_id: ConnId) {
        self.pending.remove(&conn_id);
    }

    pub fn insert(&mut self, node_id: usize, kind: SocketKind, writer: OwnedWriteHalf) {
        match kind {
            SocketKind::Server => self.server_writers.insert(node_id, writer),
            SocketKind::Client => self.client_writers.insert(node_id, writer),
        };
    }

    pub fn remove(&mut self, node_id: usize, kind: SocketKind) {
        match kind {
            SocketKind::Server => self.server_writers.remove(&node_id),
            SocketKind::Client => self.client_writers.remove(&node_id),
        };
    }

    /// Prefers the client (outbound) socket, falling back to the server
    /// (inbound) one, matching the original's preference for the connection
    /// it actively dialed.
    fn writer_for(&mut self, node_id: usize) -> Option<&mut OwnedWriteHalf> {
        if self.client_writers.contains_key(&node_id) {
            self.client_writers.get_mut(&node_id)
        } else {
            self.server_writers.get_mut(&node_id)
        }
    }

    pub fn socket_state(&self, node_id: usize, kind: SocketKind) -> SocketState {
        let present = match kind {
            SocketKind::Server => self.server_writers.contains_key(&node_id),
            SocketKind::Client => self.client_writers.contains_key(&node_id),
        };
        if present {
            SocketState::Connected
        } else {
            SocketState::Closed
        }
    }

    pub async fn send(
        &mut self,
        node_id: usize,
        packet: WdPacketData,
    ) -> Result<(), crate::error::WatchdogError> {
        use bytes::BytesMut;
        use tokio_util::codec::Encoder;

        let Some(writer) = self.writer_for(node_id) else {
            return Err(crate::error::WatchdogError::PeerUnreachable {
                node_id,
                reason: "no connected socket".to_string(),
            });
        };
        let mut codec = WdPacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(packet, &mut buf)?;
        writer.write_all(&buf).await?;
        Ok(())
    }
}
