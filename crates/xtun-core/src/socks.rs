//! SOCKS5 UDP link to the engine inbound (RFC 1928)
//!
//! The relay inbound is a SOCKS5 listener with UDP enabled. The link opens a
//! UDP ASSOCIATE on its TCP port and then exchanges SOCKS-framed datagrams
//! with the relay address the engine hands back:
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```
//!
//! Outgoing tunnel packets are unwrapped down to their UDP payload and sent
//! to their destination through the association. Replies are wrapped back
//! into IP/UDP packets addressed to the local socket that started the flow.
//! Other IP protocols need a userspace TCP stack and are skipped.

use crate::relay::{EngineConnector, EngineLink, Packet, ProtocolFamily, MAX_BATCH, MAX_DATAGRAM, RECEIVE_WINDOW};
use crate::translator::Inbound;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

/// Inbound protocol the link speaks
pub const INBOUND_PROTOCOL: &str = "socks";

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_METHOD_NONE: u8 = 0x00;
const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

const IP_PROTO_UDP: u8 = 17;
const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;

/// Bound on the TCP handshake with the inbound
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Remote endpoints remembered for the return path
const MAX_FLOWS: usize = 4096;

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Settings of a relay inbound the link can reach.
pub fn inbound_settings(listen: &str) -> Value {
    json!({ "auth": "noauth", "udp": true, "ip": listen })
}

/// Reject inbounds the link cannot talk to.
pub fn check_inbound(inbound: &Inbound) -> io::Result<()> {
    if inbound.protocol != INBOUND_PROTOCOL {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "relay inbound speaks {:?}, the link needs {:?}",
                inbound.protocol, INBOUND_PROTOCOL
            ),
        ));
    }
    if inbound.settings.get("udp").and_then(Value::as_bool) != Some(true) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "relay inbound has UDP disabled",
        ));
    }
    match inbound.settings.get("auth").and_then(Value::as_str) {
        None | Some("noauth") => Ok(()),
        Some(other) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("relay inbound requires {:?} authentication", other),
        )),
    }
}

/// Wrap `data` for `dest`.
pub fn encapsulate(dest: SocketAddr, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(22 + data.len());
    packet.extend_from_slice(&[0, 0, 0]);
    match dest.ip() {
        IpAddr::V4(ip) => {
            packet.push(ATYP_IPV4);
            packet.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            packet.push(ATYP_IPV6);
            packet.extend_from_slice(&ip.octets());
        }
    }
    packet.extend_from_slice(&dest.port().to_be_bytes());
    packet.extend_from_slice(data);
    packet
}

/// Split a SOCKS UDP datagram into its peer address and payload.
pub fn decapsulate(packet: &[u8]) -> io::Result<(SocketAddr, &[u8])> {
    if packet.len() < 4 {
        return Err(invalid_data(format!("datagram too short: {} bytes", packet.len())));
    }
    if packet[0] != 0 || packet[1] != 0 {
        return Err(invalid_data("RSV field must be zero"));
    }
    if packet[2] != 0 {
        return Err(invalid_data(format!("fragment {} not supported", packet[2])));
    }

    let (ip, offset) = match packet[3] {
        ATYP_IPV4 if packet.len() >= 10 => {
            let octets: [u8; 4] = packet[4..8].try_into().map_err(|_| invalid_data("IPv4 address"))?;
            (IpAddr::V4(Ipv4Addr::from(octets)), 8)
        }
        ATYP_IPV6 if packet.len() >= 22 => {
            let octets: [u8; 16] = packet[4..20].try_into().map_err(|_| invalid_data("IPv6 address"))?;
            (IpAddr::V6(Ipv6Addr::from(octets)), 20)
        }
        ATYP_DOMAIN => return Err(invalid_data("domain peer cannot be mapped to a packet")),
        ATYP_IPV4 | ATYP_IPV6 => return Err(invalid_data("datagram too short for its address")),
        other => return Err(invalid_data(format!("unknown address type {:#04x}", other))),
    };
    let port = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
    Ok((SocketAddr::new(ip, port), &packet[offset + 2..]))
}

fn checksum_add(mut sum: u64, bytes: &[u8]) -> u64 {
    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

fn checksum_fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum over `parts`; all but the last must have even length.
fn checksum(parts: &[&[u8]]) -> u16 {
    checksum_fold(parts.iter().fold(0, |sum, part| checksum_add(sum, part)))
}

/// A UDP datagram carried in an IP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    /// Read a UDP datagram out of a raw IP packet.
    ///
    /// `None` for other protocols, fragments, IPv6 extension headers and
    /// truncated packets.
    pub fn parse(packet: &Packet) -> Option<Self> {
        let data = &packet.data;
        let (source, destination, segment) = match packet.family {
            ProtocolFamily::V4 => {
                if data.len() < IPV4_HEADER_LEN || data[0] >> 4 != 4 || data[9] != IP_PROTO_UDP {
                    return None;
                }
                let header_len = usize::from(data[0] & 0x0f) * 4;
                let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
                let fragment = u16::from_be_bytes([data[6], data[7]]);
                // More-fragments flag or a non-zero offset
                if fragment & 0x3fff != 0 || header_len < IPV4_HEADER_LEN || total_len > data.len() || total_len < header_len {
                    return None;
                }
                let src: [u8; 4] = data[12..16].try_into().ok()?;
                let dst: [u8; 4] = data[16..20].try_into().ok()?;
                (
                    IpAddr::V4(Ipv4Addr::from(src)),
                    IpAddr::V4(Ipv4Addr::from(dst)),
                    &data[header_len..total_len],
                )
            }
            ProtocolFamily::V6 => {
                if data.len() < IPV6_HEADER_LEN || data[0] >> 4 != 6 || data[6] != IP_PROTO_UDP {
                    return None;
                }
                let end = IPV6_HEADER_LEN + usize::from(u16::from_be_bytes([data[4], data[5]]));
                if end > data.len() {
                    return None;
                }
                let src: [u8; 16] = data[8..24].try_into().ok()?;
                let dst: [u8; 16] = data[24..40].try_into().ok()?;
                (
                    IpAddr::V6(Ipv6Addr::from(src)),
                    IpAddr::V6(Ipv6Addr::from(dst)),
                    &data[IPV6_HEADER_LEN..end],
                )
            }
        };

        if segment.len() < UDP_HEADER_LEN {
            return None;
        }
        let source_port = u16::from_be_bytes([segment[0], segment[1]]);
        let destination_port = u16::from_be_bytes([segment[2], segment[3]]);
        let udp_len = usize::from(u16::from_be_bytes([segment[4], segment[5]]));
        if udp_len < UDP_HEADER_LEN || udp_len > segment.len() {
            return None;
        }

        Some(Self {
            source: SocketAddr::new(source, source_port),
            destination: SocketAddr::new(destination, destination_port),
            payload: segment[UDP_HEADER_LEN..udp_len].to_vec(),
        })
    }

    /// Build the IP packet carrying this datagram.
    pub fn to_packet(&self) -> io::Result<Packet> {
        let udp_len = u16::try_from(UDP_HEADER_LEN + self.payload.len())
            .map_err(|_| invalid_data(format!("payload of {} bytes", self.payload.len())))?;

        let mut segment = Vec::with_capacity(usize::from(udp_len));
        segment.extend_from_slice(&self.source.port().to_be_bytes());
        segment.extend_from_slice(&self.destination.port().to_be_bytes());
        segment.extend_from_slice(&udp_len.to_be_bytes());
        segment.extend_from_slice(&[0, 0]);
        segment.extend_from_slice(&self.payload);

        let (family, mut data) = match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let total_len = u16::try_from(IPV4_HEADER_LEN + segment.len())
                    .map_err(|_| invalid_data("datagram exceeds an IPv4 packet"))?;
                let mut header = Vec::with_capacity(IPV4_HEADER_LEN + segment.len());
                header.extend_from_slice(&[0x45, 0]);
                header.extend_from_slice(&total_len.to_be_bytes());
                // Identification 0, don't fragment
                header.extend_from_slice(&[0, 0, 0x40, 0, DEFAULT_TTL, IP_PROTO_UDP, 0, 0]);
                header.extend_from_slice(&src.octets());
                header.extend_from_slice(&dst.octets());
                let sum = checksum(&[&header[..]]);
                header[10..12].copy_from_slice(&sum.to_be_bytes());

                let pseudo = [0, IP_PROTO_UDP];
                let mut udp_sum = checksum(&[
                    &src.octets()[..],
                    &dst.octets()[..],
                    &pseudo[..],
                    &udp_len.to_be_bytes()[..],
                    &segment[..],
                ]);
                if udp_sum == 0 {
                    udp_sum = 0xffff;
                }
                segment[6..8].copy_from_slice(&udp_sum.to_be_bytes());
                (ProtocolFamily::V4, header)
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let mut header = Vec::with_capacity(IPV6_HEADER_LEN + segment.len());
                header.extend_from_slice(&[0x60, 0, 0, 0]);
                header.extend_from_slice(&udp_len.to_be_bytes());
                header.extend_from_slice(&[IP_PROTO_UDP, DEFAULT_TTL]);
                header.extend_from_slice(&src.octets());
                header.extend_from_slice(&dst.octets());

                let length = u32::from(udp_len).to_be_bytes();
                let next = [0, 0, 0, IP_PROTO_UDP];
                let mut udp_sum = checksum(&[
                    &src.octets()[..],
                    &dst.octets()[..],
                    &length[..],
                    &next[..],
                    &segment[..],
                ]);
                if udp_sum == 0 {
                    udp_sum = 0xffff;
                }
                segment[6..8].copy_from_slice(&udp_sum.to_be_bytes());
                (ProtocolFamily::V6, header)
            }
            _ => {
                return Err(invalid_data(format!(
                    "mixed address families {} -> {}",
                    self.source, self.destination
                )));
            }
        };

        data.extend_from_slice(&segment);
        Ok(Packet::new(family, data))
    }
}

/// Method selection and UDP ASSOCIATE; returns the control stream and relay address.
async fn associate(target: SocketAddr) -> io::Result<(TcpStream, SocketAddr)> {
    let mut stream = TcpStream::connect(target).await?;

    stream.write_all(&[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]).await?;
    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != SOCKS5_VERSION {
        return Err(invalid_data(format!("SOCKS version {:#04x}", response[0])));
    }
    match response[1] {
        AUTH_METHOD_NONE => {}
        AUTH_METHOD_NO_ACCEPTABLE => return Err(invalid_data("no acceptable authentication method")),
        other => return Err(invalid_data(format!("unsupported auth method {:#04x}", other))),
    }

    // Client address 0.0.0.0:0, the engine learns it from the first datagram
    stream
        .write_all(&[SOCKS5_VERSION, CMD_UDP_ASSOCIATE, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(invalid_data(format!("SOCKS version {:#04x}", header[0])));
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("UDP ASSOCIATE refused with code {:#04x}", header[1]),
        ));
    }

    let ip = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(invalid_data(format!("relay address type {:#04x}", other))),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    let relay = SocketAddr::new(ip, u16::from_be_bytes(port));
    trace!("UDP ASSOCIATE via {} granted relay {}", target, relay);
    Ok((stream, relay))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Engine link over a SOCKS5 UDP association.
pub struct SocksEngineLink {
    // The association ends when this stream closes
    _control: TcpStream,
    socket: UdpSocket,
    /// Remote endpoint -> local endpoint that last sent to it
    flows: Mutex<HashMap<SocketAddr, SocketAddr>>,
}

impl SocksEngineLink {
    fn remember(&self, datagram: &UdpDatagram) {
        let mut flows = lock(&self.flows);
        if flows.len() >= MAX_FLOWS && !flows.contains_key(&datagram.destination) {
            flows.clear();
        }
        flows.insert(datagram.destination, datagram.source);
    }

    fn unwrap_reply(&self, buf: &[u8]) -> Option<Packet> {
        let (remote, payload) = match decapsulate(buf) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("Dropping engine datagram: {}", e);
                return None;
            }
        };
        let Some(local) = lock(&self.flows).get(&remote).copied() else {
            debug!("Dropping reply from {} with no local flow", remote);
            return None;
        };

        let datagram = UdpDatagram {
            source: remote,
            destination: local,
            payload: payload.to_vec(),
        };
        match datagram.to_packet() {
            Ok(packet) => Some(packet),
            Err(e) => {
                debug!("Dropping reply from {}: {}", remote, e);
                None
            }
        }
    }
}

#[async_trait]
impl EngineLink for SocksEngineLink {
    async fn forward(&self, packets: &[Packet]) -> io::Result<()> {
        let mut skipped = 0usize;
        for packet in packets {
            let Some(datagram) = UdpDatagram::parse(packet) else {
                skipped += 1;
                continue;
            };
            self.remember(&datagram);
            self.socket
                .send(&encapsulate(datagram.destination, &datagram.payload))
                .await?;
        }
        if skipped > 0 {
            trace!("Skipped {} non-UDP packets", skipped);
        }
        Ok(())
    }

    async fn receive(&self) -> io::Result<Vec<Packet>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = match tokio::time::timeout(RECEIVE_WINDOW, self.socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Ok(Vec::new()),
        };

        let mut packets: Vec<Packet> = self.unwrap_reply(&buf[..n]).into_iter().collect();
        while packets.len() < MAX_BATCH {
            match self.socket.try_recv(&mut buf) {
                Ok(n) => packets.extend(self.unwrap_reply(&buf[..n])),
                Err(_) => break,
            }
        }
        Ok(packets)
    }
}

/// Opens a [`SocksEngineLink`] to the relay inbound.
#[derive(Debug, Clone, Default)]
pub struct SocksConnector;

#[async_trait]
impl EngineConnector for SocksConnector {
    async fn connect(&self, inbound: &Inbound) -> io::Result<Arc<dyn EngineLink>> {
        check_inbound(inbound)?;
        let target: SocketAddr = inbound
            .address()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}", e)))?;

        let (control, relay) = tokio::time::timeout(HANDSHAKE_TIMEOUT, associate(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "SOCKS handshake timed out"))??;
        let relay = if relay.ip().is_unspecified() {
            SocketAddr::new(target.ip(), relay.port())
        } else {
            relay
        };

        let local = match relay {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(relay).await?;
        debug!("Engine link {} -> {} (associated via {})", socket.local_addr()?, relay, target);

        Ok(Arc::new(SocksEngineLink {
            _control: control,
            socket,
            flows: Mutex::new(HashMap::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ProtocolSettings, ServerDescriptor};
    use crate::translator::Translator;
    use tokio::net::TcpListener;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn dns_query() -> UdpDatagram {
        UdpDatagram {
            source: addr("198.18.0.1:5353"),
            destination: addr("1.1.1.1:53"),
            payload: b"query".to_vec(),
        }
    }

    #[test]
    fn test_ipv4_header_checksum() {
        // Well-known sample header, checksum 0xb861
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(checksum(&[&header[..]]), 0xb861);
    }

    #[test]
    fn test_built_packets_parse_back() {
        let v4 = dns_query();
        let packet = v4.to_packet().unwrap();
        assert_eq!(packet.family, ProtocolFamily::V4);
        assert_eq!(checksum(&[&packet.data[..IPV4_HEADER_LEN]]), 0);
        let udp_len = ((UDP_HEADER_LEN + 5) as u16).to_be_bytes();
        let pseudo = [198, 18, 0, 1, 1, 1, 1, 1, 0, IP_PROTO_UDP, udp_len[0], udp_len[1]];
        assert_eq!(checksum(&[&pseudo[..], &packet.data[IPV4_HEADER_LEN..]]), 0);
        assert_eq!(UdpDatagram::parse(&packet), Some(v4));

        let v6 = UdpDatagram {
            source: addr("[fd00::2]:40000"),
            destination: addr("[2606:4700::1111]:443"),
            payload: vec![7; 300],
        };
        let packet = v6.to_packet().unwrap();
        assert_eq!(packet.family, ProtocolFamily::V6);
        assert_eq!(packet.len(), IPV6_HEADER_LEN + UDP_HEADER_LEN + 300);
        assert_eq!(UdpDatagram::parse(&packet), Some(v6));
    }

    #[test]
    fn test_non_udp_and_fragments_skipped() {
        let mut tcp = dns_query().to_packet().unwrap();
        tcp.data[9] = 6;
        assert_eq!(UdpDatagram::parse(&tcp), None);

        let mut fragment = dns_query().to_packet().unwrap();
        fragment.data[6] = 0x20;
        assert_eq!(UdpDatagram::parse(&fragment), None);

        let truncated = Packet::new(ProtocolFamily::V4, vec![0x45; 12]);
        assert_eq!(UdpDatagram::parse(&truncated), None);

        let mixed = UdpDatagram {
            source: addr("10.0.0.1:1"),
            destination: addr("[::1]:2"),
            payload: Vec::new(),
        };
        assert!(mixed.to_packet().is_err());
    }

    #[test]
    fn test_socks_header() {
        let wrapped = encapsulate(addr("1.1.1.1:53"), b"hi");
        assert_eq!(&wrapped[..10], &[0, 0, 0, ATYP_IPV4, 1, 1, 1, 1, 0, 53]);
        assert_eq!(decapsulate(&wrapped).unwrap(), (addr("1.1.1.1:53"), &b"hi"[..]));

        let mut fragmented = wrapped.clone();
        fragmented[2] = 1;
        assert!(decapsulate(&fragmented).is_err());
        assert!(decapsulate(&[0, 0, 0, ATYP_DOMAIN, 3, b'a', b'b', b'c', 0, 53]).is_err());
        assert!(decapsulate(&[0, 0, 0, ATYP_IPV6, 1]).is_err());
    }

    #[test]
    fn test_generated_inbound_matches_link() {
        let descriptor = ServerDescriptor::new("s", "s.example.com", 443, ProtocolSettings::trojan("pw"));
        let config = Translator::default()
            .translate(&descriptor)
            .unwrap()
            .into_engine()
            .unwrap();
        let inbound = config.relay_inbound().unwrap();
        assert_eq!(inbound.protocol, INBOUND_PROTOCOL);
        check_inbound(inbound).unwrap();

        let mut other = inbound.clone();
        other.protocol = "dokodemo-door".to_string();
        assert!(check_inbound(&other).is_err());

        let mut no_udp = inbound.clone();
        no_udp.settings = json!({ "auth": "noauth", "udp": false });
        assert!(check_inbound(&no_udp).is_err());
    }

    /// SOCKS5 server granting one association whose relay echoes every datagram.
    async fn run_engine_inbound() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut control, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            control.read_exact(&mut greeting).await.unwrap();
            control.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await.unwrap();

            let mut request = [0u8; 10];
            control.read_exact(&mut request).await.unwrap();
            assert_eq!(request[1], CMD_UDP_ASSOCIATE);

            // Unspecified bind address: the client falls back to the TCP peer
            let mut reply = vec![SOCKS5_VERSION, REPLY_SUCCEEDED, 0, ATYP_IPV4, 0, 0, 0, 0];
            reply.extend_from_slice(&relay_port.to_be_bytes());
            control.write_all(&reply).await.unwrap();

            let mut buf = vec![0u8; MAX_DATAGRAM];
            while let Ok((n, from)) = relay.recv_from(&mut buf).await {
                let _ = relay.send_to(&buf[..n], from).await;
            }
        });
        target
    }

    #[tokio::test]
    async fn test_link_round_trip_through_association() {
        let target = run_engine_inbound().await;
        let inbound = Inbound {
            tag: "relay-in".into(),
            protocol: INBOUND_PROTOCOL.into(),
            listen: target.ip().to_string(),
            port: target.port(),
            settings: inbound_settings("127.0.0.1"),
            sniffing: None,
        };
        let link = SocksConnector.connect(&inbound).await.unwrap();

        let query = dns_query();
        let mut tcp = query.to_packet().unwrap();
        tcp.data[9] = 6;
        link.forward(&[tcp, query.to_packet().unwrap()]).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..50 {
            received.extend(link.receive().await.unwrap());
            if !received.is_empty() {
                break;
            }
        }

        assert_eq!(received.len(), 1);
        let reply = UdpDatagram::parse(&received[0]).unwrap();
        assert_eq!(reply.source, query.destination);
        assert_eq!(reply.destination, query.source);
        assert_eq!(reply.payload, b"query");
    }

    #[tokio::test]
    async fn test_connector_refuses_foreign_inbound() {
        let inbound = Inbound {
            tag: "relay-in".into(),
            protocol: "dokodemo-door".into(),
            listen: "127.0.0.1".into(),
            port: 1,
            settings: json!({}),
            sniffing: None,
        };
        let err = SocksConnector.connect(&inbound).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
