//! Packet Relay
//!
//! Moves packets between the tunnel interface and the proxy engine's local
//! inbound. One iteration of the loop:
//!
//! ```text
//!  tunnel ──read batch──► relay ──forward──► engine inbound
//!  tunnel ◄──write batch── relay ◄──receive── engine inbound
//! ```
//!
//! Packet order and the pairing of each packet with its protocol family are
//! preserved across the whole path.

use crate::stats::StatisticsAggregator;
use crate::translator::Inbound;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum number of packets per batch
pub const MAX_BATCH: usize = 64;

/// Largest datagram the codec accepts
pub const MAX_DATAGRAM: usize = 65_536;

/// How long the engine side is given to answer a forwarded batch
pub(crate) const RECEIVE_WINDOW: Duration = Duration::from_millis(20);

/// Pause after a failed interface read
const READ_BACKOFF: Duration = Duration::from_millis(10);

/// IP version of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    V4,
    V6,
}

impl ProtocolFamily {
    /// Family from the version nibble of a raw IP packet.
    pub fn of_packet(data: &[u8]) -> Option<Self> {
        match data.first().map(|b| b >> 4) {
            Some(4) => Some(ProtocolFamily::V4),
            Some(6) => Some(ProtocolFamily::V6),
            _ => None,
        }
    }

    /// Codec tag byte
    pub fn tag(&self) -> u8 {
        match self {
            ProtocolFamily::V4 => 4,
            ProtocolFamily::V6 => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            4 => Some(ProtocolFamily::V4),
            6 => Some(ProtocolFamily::V6),
            _ => None,
        }
    }
}

/// One packet and its protocol family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub family: ProtocolFamily,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(family: ProtocolFamily, data: impl Into<Vec<u8>>) -> Self {
        Self {
            family,
            data: data.into(),
        }
    }

    /// Build from a raw IP packet, reading the family from its header.
    pub fn from_ip(data: Vec<u8>) -> Option<Self> {
        ProtocolFamily::of_packet(&data).map(|family| Self { family, data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn batch_bytes(packets: &[Packet]) -> u64 {
    packets.iter().map(|p| p.len() as u64).sum()
}

/// Encode a packet as `[family][payload]`.
pub fn encode_datagram(packet: &Packet) -> Vec<u8> {
    let mut buf = Vec::with_capacity(packet.len() + 1);
    buf.push(packet.family.tag());
    buf.extend_from_slice(&packet.data);
    buf
}

/// Decode a `[family][payload]` datagram.
pub fn decode_datagram(buf: &[u8]) -> io::Result<Packet> {
    let (&tag, payload) = buf
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty datagram"))?;
    let family = ProtocolFamily::from_tag(tag).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("unknown family tag {}", tag))
    })?;
    Ok(Packet::new(family, payload))
}

/// Tunnel-interface side of the relay.
///
/// `read_packets` must be cancel-safe: the relay drops the future when asked
/// to stop.
#[async_trait]
pub trait PacketFlow: Send + Sync {
    /// Wait for the next batch.
    async fn read_packets(&self) -> io::Result<Vec<Packet>>;

    /// Write a batch back, in order.
    async fn write_packets(&self, packets: Vec<Packet>) -> io::Result<()>;
}

/// Engine side of the relay.
#[async_trait]
pub trait EngineLink: Send + Sync {
    /// Hand a batch to the engine inbound.
    async fn forward(&self, packets: &[Packet]) -> io::Result<()>;

    /// Collect what the engine produced; may be empty.
    async fn receive(&self) -> io::Result<Vec<Packet>>;
}

/// Opens an [`EngineLink`] to a freshly started engine.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, inbound: &Inbound) -> io::Result<Arc<dyn EngineLink>>;
}

/// Read the first datagram, then drain whatever else is already queued.
fn recv_batch(socket: &UdpSocket, first: Vec<u8>) -> Vec<Packet> {
    let mut packets = Vec::new();
    match decode_datagram(&first) {
        Ok(packet) => packets.push(packet),
        Err(e) => debug!("Dropping datagram: {}", e),
    }

    let mut buf = vec![0u8; MAX_DATAGRAM];
    while packets.len() < MAX_BATCH {
        match socket.try_recv(&mut buf) {
            Ok(n) => match decode_datagram(&buf[..n]) {
                Ok(packet) => packets.push(packet),
                Err(e) => debug!("Dropping datagram: {}", e),
            },
            Err(_) => break,
        }
    }
    packets
}

async fn send_batch(socket: &UdpSocket, packets: &[Packet]) -> io::Result<()> {
    for packet in packets {
        socket.send(&encode_datagram(packet)).await?;
    }
    Ok(())
}

/// Tunnel packets exchanged with the interface helper over loopback UDP.
pub struct DatagramPacketFlow {
    socket: UdpSocket,
}

impl DatagramPacketFlow {
    /// Bind `local` and exchange datagrams with `peer`.
    pub async fn connect(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl PacketFlow for DatagramPacketFlow {
    async fn read_packets(&self) -> io::Result<Vec<Packet>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(recv_batch(&self.socket, buf))
    }

    async fn write_packets(&self, packets: Vec<Packet>) -> io::Result<()> {
        send_batch(&self.socket, &packets).await
    }
}

/// Totals of one relay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub batches: u64,
    pub packets_forwarded: u64,
    pub packets_returned: u64,
    pub errors: u64,
}

/// Running relay
pub struct RelayHandle {
    stop: watch::Sender<bool>,
    closed: watch::Receiver<bool>,
    task: JoinHandle<RelayReport>,
}

impl RelayHandle {
    /// Stop issuing reads, let the in-flight batch finish and wait for the
    /// loop to return. Aborts the task if it overruns `timeout`.
    pub async fn stop(self, timeout: Duration) -> Option<RelayReport> {
        let _ = self.stop.send(true);
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!("Relay task failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Relay did not stop within {:?}, aborting", timeout);
                task.abort();
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Flips to `true` when the loop ends because the tunnel interface closed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }
}

/// Bidirectional forwarding loop.
pub struct PacketRelay {
    flow: Arc<dyn PacketFlow>,
    link: Arc<dyn EngineLink>,
    stats: Arc<StatisticsAggregator>,
}

fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

impl PacketRelay {
    pub fn new(
        flow: Arc<dyn PacketFlow>,
        link: Arc<dyn EngineLink>,
        stats: Arc<StatisticsAggregator>,
    ) -> Self {
        Self { flow, link, stats }
    }

    /// Start the loop on the runtime.
    pub fn spawn(self) -> RelayHandle {
        let (stop, stop_rx) = watch::channel(false);
        let (closed_tx, closed) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx, closed_tx));
        RelayHandle { stop, closed, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>, closed: watch::Sender<bool>) -> RelayReport {
        let mut report = RelayReport::default();
        info!("Packet relay started");

        loop {
            let read = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break,
                read = self.flow.read_packets() => read,
            };

            let packets = match read {
                Ok(packets) => packets,
                Err(e) if is_closed(&e) => {
                    warn!("Tunnel interface closed, relay ending: {}", e);
                    closed.send_replace(true);
                    break;
                }
                Err(e) => {
                    report.errors += 1;
                    warn!("Tunnel read failed: {}", e);
                    tokio::time::sleep(READ_BACKOFF).await;
                    continue;
                }
            };

            // Once a batch is read it is carried through to the write
            self.relay_batch(packets, &mut report).await;
        }

        info!(
            "Packet relay stopped after {} batches ({} errors)",
            report.batches, report.errors
        );
        report
    }

    async fn relay_batch(&self, packets: Vec<Packet>, report: &mut RelayReport) {
        report.batches += 1;

        if !packets.is_empty() {
            match self.link.forward(&packets).await {
                Ok(()) => {
                    report.packets_forwarded += packets.len() as u64;
                    self.stats
                        .record_sent(packets.len() as u64, batch_bytes(&packets));
                }
                Err(e) => {
                    report.errors += 1;
                    warn!("Forwarding {} packets failed: {}", packets.len(), e);
                    return;
                }
            }
        }

        let returned = match self.link.receive().await {
            Ok(returned) => returned,
            Err(e) => {
                report.errors += 1;
                warn!("Engine receive failed: {}", e);
                return;
            }
        };
        if returned.is_empty() {
            return;
        }

        let count = returned.len() as u64;
        let bytes = batch_bytes(&returned);
        match self.flow.write_packets(returned).await {
            Ok(()) => {
                report.packets_returned += count;
                self.stats.record_received(count, bytes);
            }
            Err(e) => {
                report.errors += 1;
                warn!("Tunnel write failed: {}", e);
            }
        }
    }
}
