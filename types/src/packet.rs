//! Frame codec
//!
//! Parses the frames switches punt to the controller and builds the few
//! frames the controller originates itself (ARP replies, ICMP echo replies).
//!
//! ```text
//! Ethernet II ──┬── ARP
//!               ├── IPv4 ──┬── ICMP
//!               │          ├── TCP (ports)
//!               │          ├── UDP (ports)
//!               │          └── other
//!               └── other
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use crate::net::{
    MacAddr, ETH_TYPE_ARP, ETH_TYPE_IP, ETH_TYPE_VLAN, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};
use crate::{CpnError, CpnResult};

const ETH_HEADER_LEN: usize = 14;
const ARP_LEN: usize = 28;
const IPV4_MIN_HEADER_LEN: usize = 20;

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

const IPV4_FLAG_DF: u16 = 0x4000;
const DEFAULT_TTL: u8 = 64;

/// Parsed Ethernet II frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub network: NetworkLayer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkLayer {
    Arp(ArpPacket),
    Ipv4(Ipv4Packet),
    Other { ethertype: u16, payload: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub opcode: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn is_request(&self) -> bool {
        self.opcode == ARP_REQUEST
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub identification: u16,
    pub transport: TransportLayer,
}

impl Ipv4Packet {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, transport: TransportLayer) -> Self {
        Self {
            src,
            dst,
            ttl: DEFAULT_TTL,
            identification: 0,
            transport,
        }
    }

    pub fn protocol(&self) -> u8 {
        self.transport.protocol()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportLayer {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    Icmp(IcmpPacket),
    Other { protocol: u8, payload: Bytes },
}

impl TransportLayer {
    pub fn protocol(&self) -> u8 {
        match self {
            TransportLayer::Tcp { .. } => IPPROTO_TCP,
            TransportLayer::Udp { .. } => IPPROTO_UDP,
            TransportLayer::Icmp(_) => IPPROTO_ICMP,
            TransportLayer::Other { protocol, .. } => *protocol,
        }
    }

    /// (source, destination) port for TCP/UDP
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self {
            TransportLayer::Tcp { src_port, dst_port } | TransportLayer::Udp { src_port, dst_port } => {
                Some((*src_port, *dst_port))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Bytes,
}

impl IcmpPacket {
    pub fn is_echo_request(&self) -> bool {
        self.icmp_type == ICMP_ECHO_REQUEST
    }
}

fn need(buf: &Bytes, len: usize, what: &str) -> CpnResult<()> {
    if buf.remaining() < len {
        return Err(CpnError::MalformedFrame(format!(
            "{} truncated: {} < {} bytes",
            what,
            buf.remaining(),
            len
        )));
    }
    Ok(())
}

fn get_mac(buf: &mut Bytes) -> MacAddr {
    let mut octets = [0u8; 6];
    buf.copy_to_slice(&mut octets);
    MacAddr(octets)
}

fn get_ipv4(buf: &mut Bytes) -> Ipv4Addr {
    Ipv4Addr::from(buf.get_u32())
}

/// RFC 1071 one's-complement sum
fn checksum(chunks: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut odd: Option<u8> = None;
    for chunk in chunks {
        for &byte in chunk.iter() {
            match odd.take() {
                Some(hi) => sum += u32::from(u16::from_be_bytes([hi, byte])),
                None => odd = Some(byte),
            }
        }
    }
    if let Some(hi) = odd {
        sum += u32::from(u16::from_be_bytes([hi, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

impl EthernetFrame {
    pub fn new(dst: MacAddr, src: MacAddr, network: NetworkLayer) -> Self {
        Self { dst, src, network }
    }

    /// Parse a raw frame. 802.1Q tags are skipped.
    pub fn parse(data: &Bytes) -> CpnResult<Self> {
        let mut buf = data.clone();
        need(&buf, ETH_HEADER_LEN, "ethernet header")?;
        let dst = get_mac(&mut buf);
        let src = get_mac(&mut buf);
        let mut ethertype = buf.get_u16();
        while ethertype == ETH_TYPE_VLAN {
            need(&buf, 4, "vlan tag")?;
            buf.advance(2);
            ethertype = buf.get_u16();
        }

        let network = match ethertype {
            ETH_TYPE_ARP => NetworkLayer::Arp(Self::parse_arp(buf)?),
            ETH_TYPE_IP => NetworkLayer::Ipv4(Self::parse_ipv4(buf)?),
            other => NetworkLayer::Other {
                ethertype: other,
                payload: buf,
            },
        };
        Ok(Self { dst, src, network })
    }

    fn parse_arp(mut buf: Bytes) -> CpnResult<ArpPacket> {
        need(&buf, ARP_LEN, "arp")?;
        let htype = buf.get_u16();
        let ptype = buf.get_u16();
        let hlen = buf.get_u8();
        let plen = buf.get_u8();
        if htype != 1 || ptype != ETH_TYPE_IP || hlen != 6 || plen != 4 {
            return Err(CpnError::MalformedFrame(format!(
                "unsupported arp htype={} ptype={:#06x}",
                htype, ptype
            )));
        }
        let opcode = buf.get_u16();
        let sender_mac = get_mac(&mut buf);
        let sender_ip = get_ipv4(&mut buf);
        let target_mac = get_mac(&mut buf);
        let target_ip = get_ipv4(&mut buf);
        Ok(ArpPacket {
            opcode,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    fn parse_ipv4(mut buf: Bytes) -> CpnResult<Ipv4Packet> {
        need(&buf, IPV4_MIN_HEADER_LEN, "ipv4 header")?;
        let version_ihl = buf[0];
        if version_ihl >> 4 != 4 {
            return Err(CpnError::MalformedFrame(format!(
                "ip version {}",
                version_ihl >> 4
            )));
        }
        let header_len = usize::from(version_ihl & 0x0f) * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(CpnError::MalformedFrame(format!("ihl {}", header_len)));
        }
        need(&buf, header_len, "ipv4 options")?;
        let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        let identification = u16::from_be_bytes([buf[4], buf[5]]);
        let ttl = buf[8];
        let protocol = buf[9];

        buf.advance(12);
        let src = get_ipv4(&mut buf);
        let dst = get_ipv4(&mut buf);
        buf.advance(header_len - IPV4_MIN_HEADER_LEN);

        // Ethernet padding follows short packets
        if total_len >= header_len && total_len - header_len < buf.len() {
            buf.truncate(total_len - header_len);
        }

        let transport = match protocol {
            IPPROTO_TCP => {
                need(&buf, 20, "tcp header")?;
                TransportLayer::Tcp {
                    src_port: buf.get_u16(),
                    dst_port: buf.get_u16(),
                }
            }
            IPPROTO_UDP => {
                need(&buf, 8, "udp header")?;
                TransportLayer::Udp {
                    src_port: buf.get_u16(),
                    dst_port: buf.get_u16(),
                }
            }
            IPPROTO_ICMP => {
                need(&buf, 8, "icmp header")?;
                let icmp_type = buf.get_u8();
                let code = buf.get_u8();
                buf.advance(2);
                let identifier = buf.get_u16();
                let sequence = buf.get_u16();
                TransportLayer::Icmp(IcmpPacket {
                    icmp_type,
                    code,
                    identifier,
                    sequence,
                    payload: buf,
                })
            }
            other => TransportLayer::Other {
                protocol: other,
                payload: buf,
            },
        };

        Ok(Ipv4Packet {
            src,
            dst,
            ttl,
            identification,
            transport,
        })
    }

    pub fn arp(&self) -> Option<&ArpPacket> {
        match &self.network {
            NetworkLayer::Arp(arp) => Some(arp),
            _ => None,
        }
    }

    pub fn ipv4(&self) -> Option<&Ipv4Packet> {
        match &self.network {
            NetworkLayer::Ipv4(ip) => Some(ip),
            _ => None,
        }
    }

    pub fn ethertype(&self) -> u16 {
        match &self.network {
            NetworkLayer::Arp(_) => ETH_TYPE_ARP,
            NetworkLayer::Ipv4(_) => ETH_TYPE_IP,
            NetworkLayer::Other { ethertype, .. } => *ethertype,
        }
    }

    /// ARP frame (request when `target_mac` is zero and `dst` broadcast)
    pub fn arp_frame(
        opcode: u16,
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        let dst = if opcode == ARP_REQUEST {
            MacAddr::BROADCAST
        } else {
            target_mac
        };
        Self::new(
            dst,
            sender_mac,
            NetworkLayer::Arp(ArpPacket {
                opcode,
                sender_mac,
                sender_ip,
                target_mac,
                target_ip,
            }),
        )
    }

    /// Reply to an ARP request on behalf of `target_ip`
    pub fn arp_reply_to(request: &ArpPacket, answer_mac: MacAddr) -> Self {
        Self::arp_frame(
            ARP_REPLY,
            answer_mac,
            request.target_ip,
            request.sender_mac,
            request.sender_ip,
        )
    }

    /// ICMP echo reply for this frame, if it carries an echo request.
    ///
    /// L2 and L3 addresses are swapped; identifier, sequence and payload
    /// are echoed.
    pub fn echo_reply(&self) -> Option<Self> {
        let ip = self.ipv4()?;
        let icmp = match &ip.transport {
            TransportLayer::Icmp(icmp) if icmp.is_echo_request() => icmp,
            _ => return None,
        };
        let reply = Ipv4Packet {
            src: ip.dst,
            dst: ip.src,
            ttl: DEFAULT_TTL,
            identification: ip.identification,
            transport: TransportLayer::Icmp(IcmpPacket {
                icmp_type: ICMP_ECHO_REPLY,
                code: 0,
                identifier: icmp.identifier,
                sequence: icmp.sequence,
                payload: icmp.payload.clone(),
            }),
        };
        Some(Self::new(self.src, self.dst, NetworkLayer::Ipv4(reply)))
    }

    /// Serialize to wire format with checksums filled in
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(64);
        out.put_slice(&self.dst.0);
        out.put_slice(&self.src.0);
        out.put_u16(self.ethertype());
        match &self.network {
            NetworkLayer::Arp(arp) => {
                out.put_u16(1);
                out.put_u16(ETH_TYPE_IP);
                out.put_u8(6);
                out.put_u8(4);
                out.put_u16(arp.opcode);
                out.put_slice(&arp.sender_mac.0);
                out.put_u32(arp.sender_ip.into());
                out.put_slice(&arp.target_mac.0);
                out.put_u32(arp.target_ip.into());
            }
            NetworkLayer::Ipv4(ip) => Self::encode_ipv4(ip, &mut out),
            NetworkLayer::Other { payload, .. } => out.put_slice(payload),
        }
        out.freeze()
    }

    fn encode_ipv4(ip: &Ipv4Packet, out: &mut BytesMut) {
        let segment = Self::encode_transport(ip);

        let mut header = BytesMut::with_capacity(IPV4_MIN_HEADER_LEN);
        header.put_u8(0x45);
        header.put_u8(0);
        header.put_u16((IPV4_MIN_HEADER_LEN + segment.len()) as u16);
        header.put_u16(ip.identification);
        header.put_u16(IPV4_FLAG_DF);
        header.put_u8(ip.ttl);
        header.put_u8(ip.protocol());
        header.put_u16(0);
        header.put_u32(ip.src.into());
        header.put_u32(ip.dst.into());
        let sum = checksum(&[&header[..]]);
        header[10..12].copy_from_slice(&sum.to_be_bytes());

        out.put_slice(&header);
        out.put_slice(&segment);
    }

    fn encode_transport(ip: &Ipv4Packet) -> BytesMut {
        let mut seg = BytesMut::new();
        match &ip.transport {
            TransportLayer::Tcp { src_port, dst_port } => {
                seg.put_u16(*src_port);
                seg.put_u16(*dst_port);
                seg.put_u32(0); // seq
                seg.put_u32(0); // ack
                seg.put_u8(5 << 4);
                seg.put_u8(0x02); // SYN
                seg.put_u16(0xffff);
                seg.put_u16(0);
                seg.put_u16(0);
                let sum = Self::pseudo_checksum(ip, &seg);
                seg[16..18].copy_from_slice(&sum.to_be_bytes());
            }
            TransportLayer::Udp { src_port, dst_port } => {
                seg.put_u16(*src_port);
                seg.put_u16(*dst_port);
                seg.put_u16(8);
                seg.put_u16(0);
                let sum = Self::pseudo_checksum(ip, &seg);
                seg[6..8].copy_from_slice(&sum.to_be_bytes());
            }
            TransportLayer::Icmp(icmp) => {
                seg.put_u8(icmp.icmp_type);
                seg.put_u8(icmp.code);
                seg.put_u16(0);
                seg.put_u16(icmp.identifier);
                seg.put_u16(icmp.sequence);
                seg.put_slice(&icmp.payload);
                let sum = checksum(&[&seg[..]]);
                seg[2..4].copy_from_slice(&sum.to_be_bytes());
            }
            TransportLayer::Other { payload, .. } => seg.put_slice(payload),
        }
        seg
    }

    fn pseudo_checksum(ip: &Ipv4Packet, segment: &[u8]) -> u16 {
        let src = ip.src.octets();
        let dst = ip.dst.octets();
        let len = (segment.len() as u16).to_be_bytes();
        checksum(&[&src[..], &dst[..], &[0, ip.protocol()][..], &len[..], segment])
    }
}
