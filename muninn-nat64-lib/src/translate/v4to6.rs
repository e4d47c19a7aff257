//! The IPv4 → IPv6 direction.

use etherparse::{
    icmpv4, icmpv6, IcmpEchoHeader, Icmpv4Type, Icmpv6Header, Icmpv6Type, IpNumber,
    Ipv6FlowLabel, Ipv6FragmentHeader, Ipv6Header, UdpHeader,
};

use super::{out_ports, OutL3, OutPkt, XlationCtx};
use crate::config::next_lower_plateau;
use crate::icmp::IcmpKind;
use crate::packet::{parse_inner, Breakdown, InnerL3, InnerPkt, IpPkt, L4Hdr, Pkt4};
use crate::stats::StatId;
use crate::types::{L4Proto, Tuple};

fn in4<'a>(ctx: &XlationCtx<'a>) -> &'a Pkt4 {
    match ctx.in_pkt {
        IpPkt::V4(p) => p,
        IpPkt::V6(_) => unreachable!("4to6 steps invoked on an IPv6 packet"),
    }
}

pub(super) fn create_out(ctx: &XlationCtx<'_>) -> Result<OutPkt, Breakdown> {
    Ok(OutPkt {
        l3: OutL3::V6 { hdr: Ipv6Header::default(), frag: None },
        l4: in4(ctx).l4.clone(),
        payload: Vec::new(),
    })
}

pub(super) fn l3_hdr(ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let pkt = in4(ctx);
    let tuple = match ctx.out_tuple {
        Tuple::V6(t) => t,
        Tuple::V4(_) => return Err(Breakdown::drop(StatId::Unknown)),
    };

    if pkt.hdr.time_to_live <= 1 {
        return Err(Breakdown::with_icmp(StatId::Ttl46, IcmpKind::TtlExpired));
    }

    let tos = (u8::from(pkt.hdr.dscp.value()) << 2) | pkt.hdr.ecn.value();
    let traffic_class = if ctx.cfg.translate.reset_traffic_class { 0 } else { tos };

    let next_header = match pkt.l4.proto() {
        L4Proto::Tcp => IpNumber::TCP,
        L4Proto::Udp => IpNumber::UDP,
        L4Proto::Icmp => IpNumber::IPV6_ICMP,
    };

    // RFC 6145 section 4.1: a clear DF means the sender tolerates
    // fragmentation, so the identification must survive in a fragment
    // header (it also makes later division possible).
    let frag = (pkt.is_fragment() || !pkt.hdr.dont_fragment).then(|| Ipv6FragmentHeader {
        next_header,
        fragment_offset: pkt.hdr.fragment_offset,
        more_fragments: pkt.hdr.more_fragments,
        identification: u32::from(pkt.hdr.identification),
    });

    let hdr = Ipv6Header {
        traffic_class,
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length: 0, // l3_post, once the payload exists
        next_header: if frag.is_some() { IpNumber::IPV6_FRAGMENTATION_HEADER } else { next_header },
        hop_limit: pkt.hdr.time_to_live - 1,
        source: tuple.src.addr.octets(),
        destination: tuple.dst.addr.octets(),
    };

    out.l3 = OutL3::V6 { hdr, frag };
    Ok(())
}

pub(super) fn l3_payload(ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let pkt = in4(ctx);
    let (src_port, dst_port) = out_ports(ctx.out_tuple);

    match &pkt.l4 {
        L4Hdr::Udp(udp) => {
            if udp.checksum == 0 && pkt.is_fragment() {
                // The only checksum donor would be the reassembled
                // datagram, which never exists here.
                return Err(Breakdown::drop(StatId::FragmentedZeroCsum46));
            }
            out.l4 = L4Hdr::Udp(UdpHeader {
                source_port: src_port,
                destination_port: dst_port,
                length: udp.length,
                checksum: 0,
            });
            out.payload = pkt.payload.clone();
        }
        L4Hdr::Tcp(tcp) => {
            let mut tcp = tcp.clone();
            tcp.source_port = src_port;
            tcp.destination_port = dst_port;
            tcp.checksum = 0;
            out.l4 = L4Hdr::Tcp(tcp);
            out.payload = pkt.payload.clone();
        }
        L4Hdr::Icmp4(icmp) => {
            let (icmp6, payload) = translate_icmp(ctx, pkt, &icmp.icmp_type, src_port)?;
            out.l4 = L4Hdr::Icmp6(Icmpv6Header::new(icmp6));
            out.payload = payload;
        }
        L4Hdr::Icmp6(_) => return Err(Breakdown::drop(StatId::UnknownL4Proto)),
    }
    Ok(())
}

pub(super) fn l3_post(_ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let payload_len = super::out_len(out) - Ipv6Header::LEN;
    let OutL3::V6 { hdr, .. } = &mut out.l3 else {
        return Err(Breakdown::drop(StatId::Unknown));
    };
    hdr.payload_length =
        u16::try_from(payload_len).map_err(|_| Breakdown::drop(StatId::Unknown))?;
    if let L4Hdr::Udp(udp) = &mut out.l4 {
        udp.length = u16::try_from(8 + out.payload.len())
            .map_err(|_| Breakdown::drop(StatId::Unknown))?;
    }
    Ok(())
}

pub(super) fn route(ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let OutL3::V6 { hdr, .. } = &out.l3 else {
        return Err(Breakdown::drop(StatId::Unknown));
    };
    ctx.route = Some(
        ctx.xlator
            .router
            .route6(hdr.destination.into())
            .ok_or_else(|| Breakdown::drop(StatId::FailedRoutes))?,
    );
    Ok(())
}

pub(super) fn l4_post(_ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let OutL3::V6 { hdr, .. } = &out.l3 else {
        return Err(Breakdown::drop(StatId::Unknown));
    };
    let (source, destination) = (hdr.source, hdr.destination);
    match &mut out.l4 {
        L4Hdr::Udp(udp) => {
            udp.checksum = udp
                .calc_checksum_ipv6_raw(source, destination, &out.payload)
                .map_err(|_| Breakdown::drop(StatId::Unknown))?;
        }
        L4Hdr::Tcp(tcp) => {
            tcp.checksum = tcp
                .calc_checksum_ipv6_raw(source, destination, &out.payload)
                .map_err(|_| Breakdown::drop(StatId::Unknown))?;
        }
        L4Hdr::Icmp6(icmp) => {
            icmp.update_checksum(source, destination, &out.payload)
                .map_err(|_| Breakdown::drop(StatId::IcmpCsum46))?;
        }
        L4Hdr::Icmp4(_) => return Err(Breakdown::drop(StatId::Unknown)),
    }
    Ok(())
}

/// ICMPv4 → ICMPv6 type and code mapping (RFC 6145 section 4.2).
/// Returns the v6 type plus the outgoing ICMP payload (translated inner
/// packet for errors, verbatim data for echoes).
fn translate_icmp(
    ctx: &XlationCtx<'_>,
    pkt: &Pkt4,
    in_type: &Icmpv4Type,
    echo_id: u16,
) -> Result<(Icmpv6Type, Vec<u8>), Breakdown> {
    let out_type = match in_type {
        Icmpv4Type::EchoRequest(e) => {
            return Ok((
                Icmpv6Type::EchoRequest(IcmpEchoHeader { id: echo_id, seq: e.seq }),
                pkt.payload.clone(),
            ));
        }
        Icmpv4Type::EchoReply(e) => {
            return Ok((
                Icmpv6Type::EchoReply(IcmpEchoHeader { id: echo_id, seq: e.seq }),
                pkt.payload.clone(),
            ));
        }

        Icmpv4Type::DestinationUnreachable(code) => {
            use icmpv4::DestUnreachableHeader as V4;
            use icmpv6::DestUnreachableCode as V6;
            match code {
                V4::Network
                | V4::Host
                | V4::SourceRouteFailed
                | V4::NetworkUnknown
                | V4::HostUnknown
                | V4::Isolated
                | V4::TosNetwork
                | V4::TosHost => Icmpv6Type::DestinationUnreachable(V6::NoRoute),
                V4::Protocol => Icmpv6Type::ParameterProblem(icmpv6::ParameterProblemHeader {
                    code: icmpv6::ParameterProblemCode::UnrecognizedNextHeader,
                    pointer: 6,
                }),
                V4::Port => Icmpv6Type::DestinationUnreachable(V6::Port),
                V4::FragmentationNeeded { next_hop_mtu } => {
                    Icmpv6Type::PacketTooBig { mtu: u32::from(ptb_mtu(ctx, pkt, *next_hop_mtu)) }
                }
                V4::NetworkProhibited
                | V4::HostProhibited
                | V4::FilterProhibited
                | V4::HostPrecedenceViolation
                | V4::PrecedenceCutoff => Icmpv6Type::DestinationUnreachable(V6::Prohibited),
            }
        }

        Icmpv4Type::TimeExceeded(code) => Icmpv6Type::TimeExceeded(match code {
            icmpv4::TimeExceededCode::TtlExceededInTransit => {
                icmpv6::TimeExceededCode::HopLimitExceeded
            }
            icmpv4::TimeExceededCode::FragmentReassemblyTimeExceeded => {
                icmpv6::TimeExceededCode::FragmentReassemblyTimeExceeded
            }
        }),

        Icmpv4Type::ParameterProblem(header) => match header {
            icmpv4::ParameterProblemHeader::PointerIndicatesError(ptr) => {
                let pointer = translate_pointer_4to6(*ptr).ok_or_else(|| {
                    Breakdown::drop(StatId::UntranslatableParamProbPtr46)
                })?;
                Icmpv6Type::ParameterProblem(icmpv6::ParameterProblemHeader {
                    code: icmpv6::ParameterProblemCode::ErroneousHeaderField,
                    pointer: u32::from(pointer),
                })
            }
            icmpv4::ParameterProblemHeader::MissingRequiredOption
            | icmpv4::ParameterProblemHeader::BadLength => {
                return Err(Breakdown::drop(StatId::UntranslatableParamProb46));
            }
        },

        _ => return Err(Breakdown::drop(StatId::UnknownIcmp4Type)),
    };

    let inner = parse_inner(&pkt.payload, true)?;
    let payload = translate_inner(ctx.out_tuple, &inner)?;
    Ok((out_type, payload))
}

/// Next-hop MTU of a translated "packet too big". A zeroed MTU comes
/// from an RFC 1191-ignorant router; the plateau table fills it in from
/// the offending packet's total length.
fn ptb_mtu(ctx: &XlationCtx<'_>, pkt: &Pkt4, next_hop_mtu: u16) -> u16 {
    let translate = &ctx.cfg.translate;
    let mtu = if next_hop_mtu == 0 {
        let inner_total = inner_total_len(&pkt.payload);
        next_lower_plateau(&translate.mtu_plateaus, inner_total)
    } else {
        next_hop_mtu
    };
    // The v6 path adds 20 bytes of header.
    let mtu = mtu.saturating_add(20);
    if translate.lower_mtu_fail && mtu < 1280 {
        1280
    } else {
        mtu
    }
}

fn inner_total_len(payload: &[u8]) -> u16 {
    match payload.get(2..4) {
        Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
        None => 0,
    }
}

/// IPv4 header byte offset → IPv6 header byte offset, where a
/// counterpart exists.
fn translate_pointer_4to6(ptr: u8) -> Option<u8> {
    match ptr {
        0 => Some(0),        // version
        1 => Some(1),        // TOS → traffic class
        2 | 3 => Some(4),    // total length → payload length
        8 => Some(7),        // TTL → hop limit
        9 => Some(6),        // protocol → next header
        12..=15 => Some(8),  // source address
        16..=19 => Some(24), // destination address
        _ => None,           // id, flags, offset, checksum, options
    }
}

/// The "inner entry point": builds the translated offending packet for
/// an outgoing ICMPv6 error. Only the network header is rebuilt; the
/// transport bytes travel as-is with their ports rewritten, since the
/// payload is usually truncated mid-packet.
fn translate_inner(out_tuple: &Tuple, inner: &InnerPkt) -> Result<Vec<u8>, Breakdown> {
    let tuple = match out_tuple {
        Tuple::V6(t) => t,
        Tuple::V4(_) => return Err(Breakdown::drop(StatId::Unknown)),
    };
    let InnerL3::V4(in_hdr) = &inner.l3 else {
        return Err(Breakdown::drop(StatId::UnknownProtoInner));
    };

    let next_header = match inner.proto {
        L4Proto::Tcp => IpNumber::TCP,
        L4Proto::Udp => IpNumber::UDP,
        L4Proto::Icmp => IpNumber::IPV6_ICMP,
    };

    // Lengths reflect the original datagram, not the surviving bytes.
    let hdr = Ipv6Header {
        traffic_class: (u8::from(in_hdr.dscp.value()) << 2) | in_hdr.ecn.value(),
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length: in_hdr.total_len.saturating_sub(in_hdr.header_len() as u16),
        next_header,
        hop_limit: in_hdr.time_to_live,
        // The inner flow runs opposite to the outer one.
        source: tuple.dst.addr.octets(),
        destination: tuple.src.addr.octets(),
    };

    let mut bytes = Vec::with_capacity(Ipv6Header::LEN + inner.l4_bytes.len());
    hdr.write(&mut bytes).map_err(|_| Breakdown::drop(StatId::Unknown))?;
    let l4_start = bytes.len();
    bytes.extend_from_slice(&inner.l4_bytes);
    patch_inner_l4(&mut bytes[l4_start..], inner.proto, tuple.dst.port, tuple.src.port, true);
    Ok(bytes)
}

/// Rewrites the ports (or echo id and type) of a raw inner transport
/// header. `to_v6` says which echo type numbers to emit.
pub(super) fn patch_inner_l4(
    l4: &mut [u8],
    proto: L4Proto,
    src_port: u16,
    dst_port: u16,
    to_v6: bool,
) {
    match proto {
        L4Proto::Tcp | L4Proto::Udp => {
            if l4.len() >= 4 {
                l4[0..2].copy_from_slice(&src_port.to_be_bytes());
                l4[2..4].copy_from_slice(&dst_port.to_be_bytes());
            }
        }
        L4Proto::Icmp => {
            if l4.len() >= 6 {
                l4[0] = match (to_v6, l4[0]) {
                    (true, 8) => 128,
                    (true, 0) => 129,
                    (false, 128) => 8,
                    (false, 129) => 0,
                    (_, other) => other,
                };
                l4[4..6].copy_from_slice(&src_port.to_be_bytes());
            }
        }
    }
}
