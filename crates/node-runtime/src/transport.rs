//! TCP session layer.
//!
//! Frames are `[type: u8][length: u32 BE][payload]`. A connection opens
//! with both sides writing their 32-byte node id; everything after that
//! is capability traffic handed to [`Network::receive_packet`]. Each
//! session has a single writer task, which preserves per-peer send order.

use hx_network::{DisconnectReason, Network, PacketSender, PacketType, MAX_PACKET_SIZE};
use parking_lot::RwLock;
use shared_types::NodeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct TcpTransport {
    node_id: NodeId,
    network: Arc<Network>,
    sessions: RwLock<HashMap<NodeId, mpsc::UnboundedSender<(u8, Vec<u8>)>>>,
    stopped: AtomicBool,
}

impl TcpTransport {
    pub fn new(node_id: NodeId, network: Arc<Network>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            network,
            sessions: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.sessions.write().clear();
    }

    /// Accept loop; runs until the transport stops.
    pub async fn listen(self: Arc<Self>, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "p2p listening");
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            let (stream, addr) = listener.accept().await?;
            debug!(%addr, "inbound connection");
            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(err) = transport.run_session(stream).await {
                    debug!(%addr, %err, "session ended");
                }
            });
        }
    }

    /// Dial a bootstrap peer.
    pub async fn connect(self: Arc<Self>, addr: String) {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                debug!(%addr, "outbound connection");
                let transport = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = transport.run_session(stream).await {
                        debug!(%addr, %err, "session ended");
                    }
                });
            }
            Err(err) => warn!(%addr, %err, "dial failed"),
        }
    }

    async fn run_session(self: &Arc<Self>, mut stream: TcpStream) -> std::io::Result<()> {
        // Identity exchange.
        stream.write_all(self.node_id.as_slice()).await?;
        let mut id_buf = [0u8; 32];
        stream.read_exact(&mut id_buf).await?;
        let peer_id = NodeId::from(id_buf);
        if peer_id == self.node_id {
            return Ok(());
        }

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<(u8, Vec<u8>)>();
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&peer_id) {
                // Keep the existing session; drop the duplicate dial.
                return Ok(());
            }
            sessions.insert(peer_id, tx);
        }
        self.network.on_peer_connected(peer_id);

        let writer_task = tokio::spawn(async move {
            while let Some((type_byte, payload)) = rx.recv().await {
                let mut frame = Vec::with_capacity(5 + payload.len());
                frame.push(type_byte);
                frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                frame.extend_from_slice(&payload);
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let read_result = async {
            loop {
                let mut header = [0u8; 5];
                reader.read_exact(&mut header).await?;
                let type_byte = header[0];
                let length = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
                if length > MAX_PACKET_SIZE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "frame over packet size limit",
                    ));
                }
                let mut payload = vec![0u8; length];
                reader.read_exact(&mut payload).await?;
                self.network.receive_packet(peer_id, type_byte, payload);
            }
            #[allow(unreachable_code)]
            Ok::<(), std::io::Error>(())
        }
        .await;

        self.sessions.write().remove(&peer_id);
        self.network.on_peer_disconnected(&peer_id);
        writer_task.abort();
        read_result
    }
}

impl PacketSender for TcpTransport {
    fn send_packet(&self, to: &NodeId, packet_type: PacketType, payload: Vec<u8>) -> bool {
        let sessions = self.sessions.read();
        match sessions.get(to) {
            Some(sender) => sender.send((packet_type as u8, payload)).is_ok(),
            None => false,
        }
    }

    fn disconnect(&self, peer: &NodeId, reason: DisconnectReason) {
        debug!(%peer, ?reason, "disconnecting peer");
        // Dropping the channel ends the writer task and closes the socket.
        self.sessions.write().remove(peer);
        self.network.on_peer_disconnected(peer);
    }
}
