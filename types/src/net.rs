//! Switch, host and service identifiers

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::CpnError;

/// Datapath identifier of a switch
pub type Dpid = u64;

/// Switch port number
pub type PortNo = u32;

pub const ETH_TYPE_IP: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// 48-bit Ethernet address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = CpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| CpnError::InvalidAddress(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| CpnError::InvalidAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(CpnError::InvalidAddress(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Transport protocol of an anycast service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    /// IP protocol number carried in the IPv4 header
    pub fn ip_proto(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => IPPROTO_TCP,
            TransportProtocol::Udp => IPPROTO_UDP,
        }
    }

    pub fn from_ip_proto(proto: u8) -> Option<Self> {
        match proto {
            IPPROTO_TCP => Some(TransportProtocol::Tcp),
            IPPROTO_UDP => Some(TransportProtocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "tcp"),
            TransportProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Anycast service identifier: the address clients talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub protocol: TransportProtocol,
}

impl ServiceId {
    pub fn new(ip: Ipv4Addr, port: u16, protocol: TransportProtocol) -> Self {
        Self { ip, port, protocol }
    }

    pub fn tcp(ip: Ipv4Addr, port: u16) -> Self {
        Self::new(ip, port, TransportProtocol::Tcp)
    }

    pub fn udp(ip: Ipv4Addr, port: u16) -> Self {
        Self::new(ip, port, TransportProtocol::Udp)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.protocol)
    }
}

/// One concrete backend behind an anycast service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ServiceInstance {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Edge attribute used to rank paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PathMetric {
    #[default]
    #[serde(rename = "hop")]
    Hop,
    #[serde(rename = "delay")]
    Delay,
    #[serde(rename = "bw")]
    Bandwidth,
}

impl FromStr for PathMetric {
    type Err = CpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hop" => Ok(PathMetric::Hop),
            "delay" => Ok(PathMetric::Delay),
            "bw" | "bandwidth" => Ok(PathMetric::Bandwidth),
            other => Err(CpnError::InvalidData(format!("unknown path metric: {}", other))),
        }
    }
}

impl fmt::Display for PathMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathMetric::Hop => write!(f, "hop"),
            PathMetric::Delay => write!(f, "delay"),
            PathMetric::Bandwidth => write!(f, "bw"),
        }
    }
}
