//! Parsed packet model.
//!
//! Parsing happens once, up front; everything downstream works on the
//! decoded headers. A parse failure is already a verdict: the packet
//! drops and a counter tells why.

use std::net::{Ipv4Addr, Ipv6Addr};

use etherparse::{
    Icmpv4Header, Icmpv4Type, Icmpv6Header, Icmpv6Type, IpNumber, Ipv4Header, Ipv6FragmentHeader,
    Ipv6Header, TcpHeader, UdpHeader,
};

use crate::icmp::IcmpKind;
use crate::stats::StatId;
use crate::types::{L4Proto, TransportAddr4, TransportAddr6, Tuple, Tuple4, Tuple6};

/// Why a packet stopped translating: the counter to bump and,
/// sometimes, an ICMP error owed to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakdown {
    pub stat: StatId,
    pub icmp: Option<IcmpKind>,
}

impl Breakdown {
    pub fn drop(stat: StatId) -> Self {
        Self { stat, icmp: None }
    }

    pub fn with_icmp(stat: StatId, icmp: IcmpKind) -> Self {
        Self { stat, icmp: Some(icmp) }
    }
}

/// Transport header of the packet under translation.
#[derive(Debug, Clone)]
pub enum L4Hdr {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmp4(Icmpv4Header),
    Icmp6(Icmpv6Header),
}

impl L4Hdr {
    pub fn proto(&self) -> L4Proto {
        match self {
            L4Hdr::Tcp(_) => L4Proto::Tcp,
            L4Hdr::Udp(_) => L4Proto::Udp,
            L4Hdr::Icmp4(_) | L4Hdr::Icmp6(_) => L4Proto::Icmp,
        }
    }
}

/// A parsed IPv6 packet. `payload` holds the bytes after the transport
/// header (for ICMP errors, the offending inner packet).
#[derive(Debug, Clone)]
pub struct Pkt6 {
    pub hdr: Ipv6Header,
    pub frag: Option<Ipv6FragmentHeader>,
    pub l4: L4Hdr,
    pub payload: Vec<u8>,
    pub mark: u32,
}

/// A parsed IPv4 packet.
#[derive(Debug, Clone)]
pub struct Pkt4 {
    pub hdr: Ipv4Header,
    pub l4: L4Hdr,
    pub payload: Vec<u8>,
    pub mark: u32,
}

#[derive(Debug, Clone)]
pub enum IpPkt {
    V6(Pkt6),
    V4(Pkt4),
}

impl Pkt6 {
    pub fn src(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.hdr.source)
    }

    pub fn dst(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.hdr.destination)
    }

    pub fn is_icmp_error(&self) -> bool {
        matches!(
            &self.l4,
            L4Hdr::Icmp6(h) if icmp6_type_is_error(&h.icmp_type)
        )
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.l4 {
            L4Hdr::Tcp(h) => Some(h),
            _ => None,
        }
    }
}

impl Pkt4 {
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.hdr.source)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.hdr.destination)
    }

    pub fn is_fragment(&self) -> bool {
        self.hdr.more_fragments || self.hdr.fragment_offset.value() != 0
    }

    pub fn is_icmp_error(&self) -> bool {
        matches!(
            &self.l4,
            L4Hdr::Icmp4(h) if icmp4_type_is_error(&h.icmp_type)
        )
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.l4 {
            L4Hdr::Tcp(h) => Some(h),
            _ => None,
        }
    }
}

pub fn icmp4_type_is_error(t: &Icmpv4Type) -> bool {
    matches!(
        t,
        Icmpv4Type::DestinationUnreachable(_)
            | Icmpv4Type::TimeExceeded(_)
            | Icmpv4Type::ParameterProblem(_)
    )
}

pub fn icmp6_type_is_error(t: &Icmpv6Type) -> bool {
    matches!(
        t,
        Icmpv6Type::DestinationUnreachable(_)
            | Icmpv6Type::PacketTooBig { .. }
            | Icmpv6Type::TimeExceeded(_)
            | Icmpv6Type::ParameterProblem(_)
    )
}

/// Parses an IPv6 frame, walking extension headers. Only the fragment
/// header survives translation; hop-by-hop and destination options are
/// skipped, and a routing header with segments left is an error the
/// sender gets told about.
pub fn parse6(frame: &[u8], mark: u32) -> Result<Pkt6, Breakdown> {
    let (hdr, rest) =
        Ipv6Header::from_slice(frame).map_err(|_| Breakdown::drop(StatId::Hdr6))?;

    let payload_len = usize::from(hdr.payload_length);
    if rest.len() < payload_len {
        return Err(Breakdown::drop(StatId::TruncatedPacket));
    }
    let mut data = &rest[..payload_len];
    let mut next = hdr.next_header;
    let mut frag: Option<Ipv6FragmentHeader> = None;

    loop {
        match next {
            IpNumber::IPV6_HEADER_HOP_BY_HOP | IpNumber::IPV6_DESTINATION_OPTIONS => {
                if data.len() < 8 {
                    return Err(Breakdown::drop(StatId::TruncatedPacket));
                }
                let ext_len = 8 + usize::from(data[1]) * 8;
                if data.len() < ext_len {
                    return Err(Breakdown::drop(StatId::TruncatedPacket));
                }
                next = IpNumber(data[0]);
                data = &data[ext_len..];
            }
            IpNumber::IPV6_ROUTE_HEADER => {
                if data.len() < 8 {
                    return Err(Breakdown::drop(StatId::TruncatedPacket));
                }
                if data[3] != 0 {
                    // Segments left; a router would bounce this. The
                    // pointer names the offending octet in the packet.
                    let at = Ipv6Header::LEN + (payload_len - data.len()) + 3;
                    return Err(Breakdown::with_icmp(
                        StatId::SegmentsLeft64,
                        IcmpKind::HdrField { pointer: at as u32 },
                    ));
                }
                let ext_len = 8 + usize::from(data[1]) * 8;
                if data.len() < ext_len {
                    return Err(Breakdown::drop(StatId::TruncatedPacket));
                }
                next = IpNumber(data[0]);
                data = &data[ext_len..];
            }
            IpNumber::IPV6_FRAGMENTATION_HEADER => {
                let (fh, after) = Ipv6FragmentHeader::from_slice(data)
                    .map_err(|_| Breakdown::drop(StatId::TruncatedPacket))?;
                next = fh.next_header;
                frag = Some(fh);
                data = after;
            }
            _ => break,
        }
    }

    if let Some(fh) = &frag {
        if fh.fragment_offset.value() != 0 {
            // Reassembly belongs to the companion fragment database,
            // which this translator does not ship.
            return Err(Breakdown::drop(StatId::Unknown));
        }
    }

    let l4 = parse_l4(next, data, false)?;
    if frag.is_some() {
        if let L4Hdr::Icmp6(_) = l4 {
            return Err(Breakdown::drop(StatId::FragmentedPing));
        }
    }
    let l4_len = l4_header_len(&l4);
    let payload = data[l4_len..].to_vec();

    Ok(Pkt6 { hdr, frag, l4, payload, mark })
}

/// Parses an IPv4 frame.
pub fn parse4(frame: &[u8], mark: u32) -> Result<Pkt4, Breakdown> {
    let (hdr, rest) =
        Ipv4Header::from_slice(frame).map_err(|_| Breakdown::drop(StatId::Hdr4))?;

    let total = usize::from(hdr.total_len);
    let hdr_len = hdr.header_len();
    if total < hdr_len || frame.len() < total {
        return Err(Breakdown::drop(StatId::TruncatedPacket));
    }
    let data = &rest[..total - hdr_len];

    if hdr.fragment_offset.value() != 0 {
        // Non-first fragment; see the note in parse6.
        return Err(Breakdown::drop(StatId::Unknown));
    }

    let l4 = parse_l4(hdr.protocol, data, true)?;
    if hdr.more_fragments {
        if let L4Hdr::Icmp4(_) = l4 {
            return Err(Breakdown::drop(StatId::FragmentedPing));
        }
    }
    let l4_len = l4_header_len(&l4);
    let payload = data[l4_len..].to_vec();

    Ok(Pkt4 { hdr, l4, payload, mark })
}

fn parse_l4(proto: IpNumber, data: &[u8], is_v4: bool) -> Result<L4Hdr, Breakdown> {
    match proto {
        IpNumber::TCP => {
            let (tcp, _) =
                TcpHeader::from_slice(data).map_err(|_| Breakdown::drop(StatId::TruncatedPacket))?;
            Ok(L4Hdr::Tcp(tcp))
        }
        IpNumber::UDP => {
            let (udp, _) =
                UdpHeader::from_slice(data).map_err(|_| Breakdown::drop(StatId::TruncatedPacket))?;
            Ok(L4Hdr::Udp(udp))
        }
        IpNumber::ICMP if is_v4 => {
            let (icmp, _) = Icmpv4Header::from_slice(data)
                .map_err(|_| Breakdown::drop(StatId::TruncatedPacket))?;
            Ok(L4Hdr::Icmp4(icmp))
        }
        IpNumber::IPV6_ICMP if !is_v4 => {
            let (icmp, _) = Icmpv6Header::from_slice(data)
                .map_err(|_| Breakdown::drop(StatId::TruncatedPacket))?;
            Ok(L4Hdr::Icmp6(icmp))
        }
        _ => Err(Breakdown::drop(StatId::UnknownL4Proto)),
    }
}

fn l4_header_len(l4: &L4Hdr) -> usize {
    match l4 {
        L4Hdr::Tcp(h) => usize::from(h.header_len()),
        L4Hdr::Udp(_) => 8,
        L4Hdr::Icmp4(h) => h.header_len(),
        L4Hdr::Icmp6(h) => h.header_len(),
    }
}

/// The transport header of an ICMP error payload, kept as raw bytes.
/// Error payloads are routinely truncated, so only the fields the
/// translator rewrites are decoded; the rest is copied through.
#[derive(Debug, Clone)]
pub struct InnerPkt {
    pub proto: L4Proto,
    pub src_port: u16,
    pub dst_port: u16,
    /// Transport header and payload, verbatim.
    pub l4_bytes: Vec<u8>,
    pub l3: InnerL3,
}

#[derive(Debug, Clone)]
pub enum InnerL3 {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

/// Parses the packet embedded in an ICMP error. `outer_is_v4` picks the
/// expected family; a mismatch is a malformed error.
pub fn parse_inner(payload: &[u8], outer_is_v4: bool) -> Result<InnerPkt, Breakdown> {
    if outer_is_v4 {
        let (hdr, rest) =
            Ipv4Header::from_slice(payload).map_err(|_| Breakdown::drop(StatId::Hdr4))?;
        let (proto, src_port, dst_port) = inner_ports(hdr.protocol, rest, true)?;
        Ok(InnerPkt {
            proto,
            src_port,
            dst_port,
            l4_bytes: rest.to_vec(),
            l3: InnerL3::V4(hdr),
        })
    } else {
        let (hdr, rest) =
            Ipv6Header::from_slice(payload).map_err(|_| Breakdown::drop(StatId::Hdr6))?;
        // Extension headers inside an error payload are rare enough
        // that anything but a plain transport header is untranslatable.
        let (proto, src_port, dst_port) = inner_ports(hdr.next_header, rest, false)?;
        Ok(InnerPkt {
            proto,
            src_port,
            dst_port,
            l4_bytes: rest.to_vec(),
            l3: InnerL3::V6(hdr),
        })
    }
}

fn inner_ports(
    proto: IpNumber,
    l4: &[u8],
    is_v4: bool,
) -> Result<(L4Proto, u16, u16), Breakdown> {
    match proto {
        IpNumber::TCP | IpNumber::UDP => {
            if l4.len() < 4 {
                return Err(Breakdown::drop(StatId::TruncatedPacket));
            }
            let src = u16::from_be_bytes([l4[0], l4[1]]);
            let dst = u16::from_be_bytes([l4[2], l4[3]]);
            let proto = if proto == IpNumber::TCP { L4Proto::Tcp } else { L4Proto::Udp };
            Ok((proto, src, dst))
        }
        IpNumber::ICMP if is_v4 => inner_echo_id(l4, &[0, 8]),
        IpNumber::IPV6_ICMP if !is_v4 => inner_echo_id(l4, &[128, 129]),
        _ => Err(Breakdown::drop(StatId::UnknownProtoInner)),
    }
}

/// An ICMP error about an ICMP packet is only translatable when the
/// inner message is an echo; an inner error would be an error about an
/// error.
fn inner_echo_id(l4: &[u8], echo_types: &[u8]) -> Result<(L4Proto, u16, u16), Breakdown> {
    if l4.len() < 6 {
        return Err(Breakdown::drop(StatId::TruncatedPacket));
    }
    if !echo_types.contains(&l4[0]) {
        return Err(Breakdown::drop(StatId::UnknownProtoInner));
    }
    let id = u16::from_be_bytes([l4[4], l4[5]]);
    Ok((L4Proto::Icmp, id, id))
}

/// Step 1 of the pipeline: the tuple the rest of the translator works
/// on. ICMP errors report the *inner* tuple with source and destination
/// swapped, so state lookups see the flow the error is about.
pub fn determine_tuple(pkt: &IpPkt) -> Result<Tuple, Breakdown> {
    match pkt {
        IpPkt::V6(p) => {
            let (src_port, dst_port) = match &p.l4 {
                L4Hdr::Tcp(h) => (h.source_port, h.destination_port),
                L4Hdr::Udp(h) => (h.source_port, h.destination_port),
                L4Hdr::Icmp6(h) => match &h.icmp_type {
                    Icmpv6Type::EchoRequest(e) | Icmpv6Type::EchoReply(e) => (e.id, e.id),
                    t if icmp6_type_is_error(t) => {
                        let inner = parse_inner(&p.payload, false)?;
                        let InnerL3::V6(ih) = &inner.l3 else {
                            return Err(Breakdown::drop(StatId::UnknownProtoInner));
                        };
                        if inner.proto == L4Proto::Icmp && is_inner_icmp6_error(&inner.l4_bytes) {
                            return Err(Breakdown::drop(StatId::DoubleIcmp6Error));
                        }
                        return Ok(Tuple::V6(Tuple6 {
                            src: TransportAddr6::new(
                                Ipv6Addr::from(ih.destination),
                                inner.dst_port,
                            ),
                            dst: TransportAddr6::new(Ipv6Addr::from(ih.source), inner.src_port),
                            proto: inner.proto,
                        }));
                    }
                    _ => return Err(Breakdown::drop(StatId::UnknownIcmp6Type)),
                },
                L4Hdr::Icmp4(_) => return Err(Breakdown::drop(StatId::UnknownL4Proto)),
            };
            Ok(Tuple::V6(Tuple6 {
                src: TransportAddr6::new(p.src(), src_port),
                dst: TransportAddr6::new(p.dst(), dst_port),
                proto: p.l4.proto(),
            }))
        }
        IpPkt::V4(p) => {
            let (src_port, dst_port) = match &p.l4 {
                L4Hdr::Tcp(h) => (h.source_port, h.destination_port),
                L4Hdr::Udp(h) => (h.source_port, h.destination_port),
                L4Hdr::Icmp4(h) => match &h.icmp_type {
                    Icmpv4Type::EchoRequest(e) | Icmpv4Type::EchoReply(e) => (e.id, e.id),
                    t if icmp4_type_is_error(t) => {
                        let inner = parse_inner(&p.payload, true)?;
                        let InnerL3::V4(ih) = &inner.l3 else {
                            return Err(Breakdown::drop(StatId::UnknownProtoInner));
                        };
                        if inner.proto == L4Proto::Icmp && is_inner_icmp4_error(&inner.l4_bytes) {
                            return Err(Breakdown::drop(StatId::DoubleIcmp4Error));
                        }
                        return Ok(Tuple::V4(Tuple4 {
                            src: TransportAddr4::new(
                                Ipv4Addr::from(ih.destination),
                                inner.dst_port,
                            ),
                            dst: TransportAddr4::new(Ipv4Addr::from(ih.source), inner.src_port),
                            proto: inner.proto,
                        }));
                    }
                    _ => return Err(Breakdown::drop(StatId::UnknownIcmp4Type)),
                },
                L4Hdr::Icmp6(_) => return Err(Breakdown::drop(StatId::UnknownL4Proto)),
            };
            Ok(Tuple::V4(Tuple4 {
                src: TransportAddr4::new(p.src(), src_port),
                dst: TransportAddr4::new(p.dst(), dst_port),
                proto: p.l4.proto(),
            }))
        }
    }
}

fn is_inner_icmp4_error(l4: &[u8]) -> bool {
    matches!(l4.first(), Some(3 | 11 | 12))
}

fn is_inner_icmp6_error(l4: &[u8]) -> bool {
    matches!(l4.first(), Some(1 | 2 | 3 | 4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn determines_a_udp6_tuple() {
        let mut frame = Vec::new();
        PacketBuilder::ipv6([1u8; 16], [2u8; 16], 64)
            .udp(9000, 53)
            .write(&mut frame, b"hi")
            .unwrap();

        let pkt = parse6(&frame, 0).unwrap();
        let tuple = determine_tuple(&IpPkt::V6(pkt)).unwrap();
        match tuple {
            Tuple::V6(t) => {
                assert_eq!(t.src.port, 9000);
                assert_eq!(t.dst.port, 53);
                assert_eq!(t.proto, L4Proto::Udp);
            }
            Tuple::V4(_) => panic!("expected a v6 tuple"),
        }
    }

    #[test]
    fn icmp4_error_reverses_the_inner_tuple() {
        // Inner packet: 198.51.100.1:40000 -> 203.0.113.5:53 (UDP).
        let mut inner = Vec::new();
        PacketBuilder::ipv4([198, 51, 100, 1], [203, 0, 113, 5], 64)
            .udp(40000, 53)
            .write(&mut inner, b"query")
            .unwrap();

        let mut frame = Vec::new();
        PacketBuilder::ipv4([203, 0, 113, 1], [198, 51, 100, 1], 64)
            .icmpv4(Icmpv4Type::TimeExceeded(
                etherparse::icmpv4::TimeExceededCode::TtlExceededInTransit,
            ))
            .write(&mut frame, &inner)
            .unwrap();

        let pkt = parse4(&frame, 0).unwrap();
        assert!(pkt.is_icmp_error());
        let tuple = determine_tuple(&IpPkt::V4(pkt)).unwrap();
        match tuple {
            Tuple::V4(t) => {
                assert_eq!(t.src, TransportAddr4::new("203.0.113.5".parse().unwrap(), 53));
                assert_eq!(t.dst, TransportAddr4::new("198.51.100.1".parse().unwrap(), 40000));
                assert_eq!(t.proto, L4Proto::Udp);
            }
            Tuple::V6(_) => panic!("expected a v4 tuple"),
        }
    }

    #[test]
    fn echo_id_becomes_both_ports() {
        let mut frame = Vec::new();
        PacketBuilder::ipv6([1u8; 16], [2u8; 16], 64)
            .icmpv6(Icmpv6Type::EchoRequest(etherparse::IcmpEchoHeader { id: 77, seq: 1 }))
            .write(&mut frame, b"ping")
            .unwrap();

        let pkt = parse6(&frame, 0).unwrap();
        let Tuple::V6(t) = determine_tuple(&IpPkt::V6(pkt)).unwrap() else {
            panic!("expected a v6 tuple");
        };
        assert_eq!(t.src.port, 77);
        assert_eq!(t.dst.port, 77);
        assert_eq!(t.proto, L4Proto::Icmp);
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(parse6(&[0u8; 10], 0).is_err());
        assert!(parse4(&[0u8; 10], 0).is_err());
    }
}
