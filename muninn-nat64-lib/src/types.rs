use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Network-layer family of a packet or a translation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L3Proto {
    V6,
    V4,
}

/// Transport protocols the translator keeps state for.
///
/// ICMP is included because echo identifiers behave like ports for
/// binding purposes (RFC 6146 section 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
}

impl L4Proto {
    pub const ALL: [L4Proto; 3] = [L4Proto::Tcp, L4Proto::Udp, L4Proto::Icmp];

    pub fn as_str(&self) -> &'static str {
        match self {
            L4Proto::Tcp => "tcp",
            L4Proto::Udp => "udp",
            L4Proto::Icmp => "icmp",
        }
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An IPv6 address plus a port (or ICMP echo identifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportAddr6 {
    pub addr: Ipv6Addr,
    pub port: u16,
}

impl TransportAddr6 {
    pub fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for TransportAddr6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.port)
    }
}

/// An IPv4 address plus a port (or ICMP echo identifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportAddr4 {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl TransportAddr4 {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for TransportAddr4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.port)
    }
}

/// 5-tuple of an IPv6 packet as the translator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple6 {
    pub src: TransportAddr6,
    pub dst: TransportAddr6,
    pub proto: L4Proto,
}

/// 5-tuple of an IPv4 packet as the translator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple4 {
    pub src: TransportAddr4,
    pub dst: TransportAddr4,
    pub proto: L4Proto,
}

/// The tuple of the packet under translation. ICMP errors carry the
/// tuple of their *inner* packet, with source and destination reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tuple {
    V6(Tuple6),
    V4(Tuple4),
}

impl Tuple {
    pub fn proto(&self) -> L4Proto {
        match self {
            Tuple::V6(t) => t.proto,
            Tuple::V4(t) => t.proto,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tuple::V6(t) => write!(f, "{} -> {} ({})", t.src, t.dst, t.proto),
            Tuple::V4(t) => write!(f, "{} -> {} ({})", t.src, t.dst, t.proto),
        }
    }
}

/// What happened to a packet. Every packet gets exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep going; the packet translated (or will).
    Continue,
    /// Not ours; hand back to the network stack untranslated.
    Accept,
    /// Discard. The relevant counter has already been bumped.
    Drop,
    /// Held in an internal queue; the caller must not reuse the buffer.
    Stolen,
}

/// Inclusive port (or ICMP id) range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }

    pub fn count(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }

    /// The portion of this range that falls in the same privileged/
    /// unprivileged class as `port`, if any.
    pub fn same_class(&self, port: u16) -> Option<PortRange> {
        let (lo, hi) = if port < 1024 { (0, 1023) } else { (1024, u16::MAX) };
        let min = self.min.max(lo);
        let max = self.max.min(hi);
        (min <= max).then_some(PortRange { min, max })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}
