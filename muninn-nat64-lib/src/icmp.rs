//! ICMP error emission.
//!
//! Failures on the packet path sometimes owe the sender an error of the
//! *incoming* packet's family. The error is built here from the
//! original frame and handed to the egress hook. At most one error is
//! ever produced per original packet, and never in response to another
//! ICMP error.

use etherparse::{
    icmpv4, icmpv6, Icmpv4Header, Icmpv4Type, Icmpv6Header, Icmpv6Type, IpNumber, Ipv4Header,
    Ipv6Header,
};
use tracing::debug;

use crate::hooks::Egress;
use crate::packet::{IpPkt, Pkt4, Pkt6};
use crate::stats::{StatId, Stats};
use crate::types::L3Proto;

/// The errors the core can owe a sender. The numeric info (MTU,
/// pointer) rides along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpKind {
    AddrUnreachable,
    PortUnreachable,
    ProtoUnreachable,
    TtlExpired,
    FragNeeded { mtu: u16 },
    HdrField { pointer: u32 },
    FilterProhibited,
}

/// Largest ICMPv4 error datagram (RFC 792 tradition).
const ICMP4_MAX_TOTAL: usize = 576;
/// ICMPv6 errors must fit the IPv6 minimum MTU (RFC 4443).
const ICMP6_MAX_TOTAL: usize = 1280;

/// Builds and emits the error owed for `pkt`, suppressing it when the
/// original is itself an ICMP error.
pub fn send_error(egress: &dyn Egress, stats: &Stats, pkt: &IpPkt, kind: IcmpKind) {
    match pkt {
        IpPkt::V4(p) => {
            if p.is_icmp_error() {
                return;
            }
            match build_error4(p, kind) {
                Some(frame) => {
                    stats.inc(StatId::Icmp4ErrSuccess);
                    egress.send(L3Proto::V4, frame);
                }
                None => stats.inc(StatId::Icmp4ErrFailure),
            }
        }
        IpPkt::V6(p) => {
            if p.is_icmp_error() {
                return;
            }
            match build_error6(p, kind) {
                Some(frame) => {
                    stats.inc(StatId::Icmp6ErrSuccess);
                    egress.send(L3Proto::V6, frame);
                }
                None => stats.inc(StatId::Icmp6ErrFailure),
            }
        }
    }
}

fn icmp4_type(kind: IcmpKind) -> Option<Icmpv4Type> {
    Some(match kind {
        IcmpKind::AddrUnreachable => {
            Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Host)
        }
        IcmpKind::PortUnreachable => {
            Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Port)
        }
        IcmpKind::ProtoUnreachable => {
            Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Protocol)
        }
        IcmpKind::TtlExpired => {
            Icmpv4Type::TimeExceeded(icmpv4::TimeExceededCode::TtlExceededInTransit)
        }
        IcmpKind::FragNeeded { mtu } => Icmpv4Type::DestinationUnreachable(
            icmpv4::DestUnreachableHeader::FragmentationNeeded { next_hop_mtu: mtu },
        ),
        IcmpKind::HdrField { pointer } => {
            let pointer = u8::try_from(pointer).ok()?;
            Icmpv4Type::ParameterProblem(icmpv4::ParameterProblemHeader::PointerIndicatesError(
                pointer,
            ))
        }
        IcmpKind::FilterProhibited => {
            Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::FilterProhibited)
        }
    })
}

fn icmp6_type(kind: IcmpKind) -> Icmpv6Type {
    match kind {
        IcmpKind::AddrUnreachable => {
            Icmpv6Type::DestinationUnreachable(icmpv6::DestUnreachableCode::Address)
        }
        IcmpKind::PortUnreachable => {
            Icmpv6Type::DestinationUnreachable(icmpv6::DestUnreachableCode::Port)
        }
        IcmpKind::ProtoUnreachable => Icmpv6Type::ParameterProblem(icmpv6::ParameterProblemHeader {
            code: icmpv6::ParameterProblemCode::UnrecognizedNextHeader,
            pointer: 6,
        }),
        IcmpKind::TtlExpired => Icmpv6Type::TimeExceeded(icmpv6::TimeExceededCode::HopLimitExceeded),
        IcmpKind::FragNeeded { mtu } => Icmpv6Type::PacketTooBig { mtu: u32::from(mtu) },
        IcmpKind::HdrField { pointer } => {
            Icmpv6Type::ParameterProblem(icmpv6::ParameterProblemHeader {
                code: icmpv6::ParameterProblemCode::ErroneousHeaderField,
                pointer,
            })
        }
        IcmpKind::FilterProhibited => {
            Icmpv6Type::DestinationUnreachable(icmpv6::DestUnreachableCode::Prohibited)
        }
    }
}

/// The error's source is the address the offending packet was sent to;
/// that is the one address in the exchange this translator answers for.
fn build_error4(original: &Pkt4, kind: IcmpKind) -> Option<Vec<u8>> {
    let mut icmp = Icmpv4Header::new(icmp4_type(kind)?);

    let mut embedded = Vec::new();
    if original.hdr.write(&mut embedded).is_err() {
        debug!("could not re-serialize the offending IPv4 header");
        return None;
    }
    append_l4(&mut embedded, &original.l4, &original.payload);
    let keep = embedded
        .len()
        .min(ICMP4_MAX_TOTAL - Ipv4Header::MIN_LEN - icmp.header_len());
    embedded.truncate(keep);

    icmp.update_checksum(&embedded);

    let total = Ipv4Header::MIN_LEN + icmp.header_len() + embedded.len();
    let mut hdr = Ipv4Header {
        total_len: total as u16,
        time_to_live: 64,
        protocol: IpNumber::ICMP,
        source: original.hdr.destination,
        destination: original.hdr.source,
        ..Default::default()
    };
    hdr.header_checksum = hdr.calc_header_checksum();

    let mut frame = Vec::with_capacity(total);
    hdr.write(&mut frame).ok()?;
    icmp.write(&mut frame).ok()?;
    frame.extend_from_slice(&embedded);
    Some(frame)
}

fn build_error6(original: &Pkt6, kind: IcmpKind) -> Option<Vec<u8>> {
    let mut icmp = Icmpv6Header::new(icmp6_type(kind));

    let mut embedded = Vec::new();
    if original.hdr.write(&mut embedded).is_err() {
        debug!("could not re-serialize the offending IPv6 header");
        return None;
    }
    append_l4(&mut embedded, &original.l4, &original.payload);
    let keep = embedded
        .len()
        .min(ICMP6_MAX_TOTAL - Ipv6Header::LEN - icmp.header_len());
    embedded.truncate(keep);

    let source = original.hdr.destination;
    let destination = original.hdr.source;
    icmp.update_checksum(source, destination, &embedded).ok()?;

    let hdr = Ipv6Header {
        payload_length: (icmp.header_len() + embedded.len()) as u16,
        next_header: IpNumber::IPV6_ICMP,
        hop_limit: 64,
        source,
        destination,
        ..Default::default()
    };

    let mut frame = Vec::with_capacity(Ipv6Header::LEN + usize::from(hdr.payload_length));
    hdr.write(&mut frame).ok()?;
    icmp.write(&mut frame).ok()?;
    frame.extend_from_slice(&embedded);
    Some(frame)
}

fn append_l4(buf: &mut Vec<u8>, l4: &crate::packet::L4Hdr, payload: &[u8]) {
    use crate::packet::L4Hdr;
    match l4 {
        L4Hdr::Tcp(h) => {
            let _ = h.write(buf);
        }
        L4Hdr::Udp(h) => {
            let _ = h.write(buf);
        }
        L4Hdr::Icmp4(h) => {
            let _ = h.write(buf);
        }
        L4Hdr::Icmp6(h) => {
            let _ = h.write(buf);
        }
    }
    buf.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::RecordingEgress;
    use crate::packet::{parse4, parse6};
    use etherparse::PacketBuilder;

    fn udp4_frame() -> Vec<u8> {
        let mut frame = Vec::new();
        PacketBuilder::ipv4([203, 0, 113, 5], [198, 51, 100, 1], 64)
            .udp(53, 40000)
            .write(&mut frame, b"payload")
            .unwrap();
        frame
    }

    #[test]
    fn emits_a_frag_needed_error() {
        let egress = RecordingEgress::new();
        let stats = Stats::new();
        let pkt = IpPkt::V4(parse4(&udp4_frame(), 0).unwrap());

        send_error(&egress, &stats, &pkt, IcmpKind::FragNeeded { mtu: 1260 });

        let frames = egress.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(stats.get(StatId::Icmp4ErrSuccess), 1);

        let err = parse4(&frames[0].1, 0).unwrap();
        // Error goes back to the offender, from the address it targeted.
        assert_eq!(err.hdr.source, [198, 51, 100, 1]);
        assert_eq!(err.hdr.destination, [203, 0, 113, 5]);
        assert!(err.is_icmp_error());
    }

    #[test]
    fn never_answers_an_error_with_an_error() {
        let egress = RecordingEgress::new();
        let stats = Stats::new();

        let mut inner = udp4_frame();
        inner.truncate(28);
        let mut frame = Vec::new();
        PacketBuilder::ipv4([192, 0, 2, 1], [198, 51, 100, 1], 64)
            .icmpv4(Icmpv4Type::TimeExceeded(
                icmpv4::TimeExceededCode::TtlExceededInTransit,
            ))
            .write(&mut frame, &inner)
            .unwrap();
        let pkt = IpPkt::V4(parse4(&frame, 0).unwrap());

        send_error(&egress, &stats, &pkt, IcmpKind::AddrUnreachable);
        assert!(egress.take().is_empty());
        assert_eq!(stats.get(StatId::Icmp4ErrFailure), 0);
    }

    #[test]
    fn icmp6_errors_fit_the_minimum_mtu() {
        let egress = RecordingEgress::new();
        let stats = Stats::new();

        let mut frame = Vec::new();
        PacketBuilder::ipv6([1u8; 16], [2u8; 16], 64)
            .udp(9000, 53)
            .write(&mut frame, &vec![0u8; 1400])
            .unwrap();
        let pkt = IpPkt::V6(parse6(&frame, 0).unwrap());

        send_error(&egress, &stats, &pkt, IcmpKind::AddrUnreachable);
        let frames = egress.take();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].1.len() <= 1280);
    }
}
