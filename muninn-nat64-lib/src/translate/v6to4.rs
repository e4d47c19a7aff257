//! The IPv6 → IPv4 direction.

use etherparse::{
    icmpv4, icmpv6, IcmpEchoHeader, Icmpv4Header, Icmpv4Type, Icmpv6Type, IpFragOffset, IpNumber,
    Ipv4Dscp, Ipv4Ecn, Ipv4Header, Ipv4Options, UdpHeader,
};

use super::v4to6::patch_inner_l4;
use super::{out_ports, OutL3, OutPkt, XlationCtx};
use crate::icmp::IcmpKind;
use crate::packet::{parse_inner, Breakdown, InnerL3, InnerPkt, IpPkt, L4Hdr, Pkt6};
use crate::stats::StatId;
use crate::types::{L4Proto, Tuple};

fn in6<'a>(ctx: &XlationCtx<'a>) -> &'a Pkt6 {
    match ctx.in_pkt {
        IpPkt::V6(p) => p,
        IpPkt::V4(_) => unreachable!("6to4 steps invoked on an IPv4 packet"),
    }
}

pub(super) fn create_out(ctx: &XlationCtx<'_>) -> Result<OutPkt, Breakdown> {
    Ok(OutPkt {
        l3: OutL3::V4(Ipv4Header::default()),
        l4: in6(ctx).l4.clone(),
        payload: Vec::new(),
    })
}

pub(super) fn l3_hdr(ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let pkt = in6(ctx);
    let tuple = match ctx.out_tuple {
        Tuple::V4(t) => t,
        Tuple::V6(_) => return Err(Breakdown::drop(StatId::Unknown)),
    };
    let translate = &ctx.cfg.translate;

    if pkt.hdr.hop_limit <= 1 {
        return Err(Breakdown::with_icmp(StatId::Ttl64, IcmpKind::TtlExpired));
    }

    let tos = if translate.reset_tos { translate.new_tos } else { pkt.hdr.traffic_class };

    let (identification, dont_fragment, more_fragments, fragment_offset) = match &pkt.frag {
        Some(frag) => (
            frag.identification as u16,
            false,
            frag.more_fragments,
            frag.fragment_offset,
        ),
        None => {
            let id = if translate.build_ipv4_id { ctx.xlator.next_ipv4_id() } else { 0 };
            // Small packets may travel DF-clear so ICMPv4-filtering
            // black holes can still fragment them downstream.
            let out_total = 20 + u32::from(pkt.hdr.payload_length);
            let df = translate.df_always_on || out_total > 1260;
            (id, df, false, IpFragOffset::ZERO)
        }
    };

    let protocol = match pkt.l4.proto() {
        L4Proto::Tcp => IpNumber::TCP,
        L4Proto::Udp => IpNumber::UDP,
        L4Proto::Icmp => IpNumber::ICMP,
    };

    out.l3 = OutL3::V4(Ipv4Header {
        dscp: Ipv4Dscp::try_new(tos >> 2).unwrap_or(Ipv4Dscp::ZERO),
        ecn: Ipv4Ecn::try_new(tos & 0b11).unwrap_or(Ipv4Ecn::ZERO),
        total_len: 0, // l3_post
        identification,
        dont_fragment,
        more_fragments,
        fragment_offset,
        time_to_live: pkt.hdr.hop_limit - 1,
        protocol,
        header_checksum: 0,
        source: tuple.src.addr.octets(),
        destination: tuple.dst.addr.octets(),
        options: Ipv4Options::default(),
    });
    Ok(())
}

pub(super) fn l3_payload(ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let pkt = in6(ctx);
    let (src_port, dst_port) = out_ports(ctx.out_tuple);

    match &pkt.l4 {
        L4Hdr::Udp(udp) => {
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
        L4Hdr::Icmp6(icmp) => {
            let (icmp4, payload) = translate_icmp(ctx, pkt, &icmp.icmp_type, src_port)?;
            out.l4 = L4Hdr::Icmp4(Icmpv4Header::new(icmp4));
            out.payload = payload;
        }
        L4Hdr::Icmp4(_) => return Err(Breakdown::drop(StatId::UnknownL4Proto)),
    }
    Ok(())
}

pub(super) fn l3_post(_ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let total = super::out_len(out);
    let OutL3::V4(hdr) = &mut out.l3 else {
        return Err(Breakdown::drop(StatId::Unknown));
    };
    hdr.total_len = u16::try_from(total).map_err(|_| Breakdown::drop(StatId::Unknown))?;
    hdr.header_checksum = hdr.calc_header_checksum();
    if let L4Hdr::Udp(udp) = &mut out.l4 {
        udp.length = u16::try_from(8 + out.payload.len())
            .map_err(|_| Breakdown::drop(StatId::Unknown))?;
    }
    Ok(())
}

pub(super) fn route(ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let OutL3::V4(hdr) = &out.l3 else {
        return Err(Breakdown::drop(StatId::Unknown));
    };
    ctx.route = Some(
        ctx.xlator
            .router
            .route4(hdr.destination.into())
            .ok_or_else(|| Breakdown::drop(StatId::FailedRoutes))?,
    );
    Ok(())
}

pub(super) fn l4_post(_ctx: &mut XlationCtx<'_>, out: &mut OutPkt) -> Result<(), Breakdown> {
    let OutL3::V4(hdr) = &out.l3 else {
        return Err(Breakdown::drop(StatId::Unknown));
    };
    let (source, destination) = (hdr.source, hdr.destination);
    match &mut out.l4 {
        L4Hdr::Udp(udp) => {
            udp.checksum = udp
                .calc_checksum_ipv4_raw(source, destination, &out.payload)
                .map_err(|_| Breakdown::drop(StatId::Unknown))?;
        }
        L4Hdr::Tcp(tcp) => {
            tcp.checksum = tcp
                .calc_checksum_ipv4_raw(source, destination, &out.payload)
                .map_err(|_| Breakdown::drop(StatId::Unknown))?;
        }
        L4Hdr::Icmp4(icmp) => {
            icmp.update_checksum(&out.payload);
        }
        L4Hdr::Icmp6(_) => return Err(Breakdown::drop(StatId::Unknown)),
    }
    Ok(())
}

/// ICMPv6 → ICMPv4 type and code mapping (RFC 6145 section 5.2).
fn translate_icmp(
    ctx: &XlationCtx<'_>,
    pkt: &Pkt6,
    in_type: &Icmpv6Type,
    echo_id: u16,
) -> Result<(Icmpv4Type, Vec<u8>), Breakdown> {
    let out_type = match in_type {
        Icmpv6Type::EchoRequest(e) => {
            return Ok((
                Icmpv4Type::EchoRequest(IcmpEchoHeader { id: echo_id, seq: e.seq }),
                pkt.payload.clone(),
            ));
        }
        Icmpv6Type::EchoReply(e) => {
            return Ok((
                Icmpv4Type::EchoReply(IcmpEchoHeader { id: echo_id, seq: e.seq }),
                pkt.payload.clone(),
            ));
        }

        Icmpv6Type::DestinationUnreachable(code) => {
            use icmpv4::DestUnreachableHeader as V4;
            use icmpv6::DestUnreachableCode as V6;
            Icmpv4Type::DestinationUnreachable(match code {
                V6::NoRoute | V6::BeyondScope | V6::Address => V4::Host,
                V6::Prohibited => V4::HostProhibited,
                V6::SourceAddressFailedPolicy | V6::RejectRoute => V4::Host,
                V6::Port => V4::Port,
            })
        }

        Icmpv6Type::PacketTooBig { mtu } => {
            let next_hop_mtu =
                u16::try_from(mtu.saturating_sub(20)).unwrap_or(u16::MAX);
            Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::FragmentationNeeded {
                next_hop_mtu,
            })
        }

        Icmpv6Type::TimeExceeded(code) => Icmpv4Type::TimeExceeded(match code {
            icmpv6::TimeExceededCode::HopLimitExceeded => {
                icmpv4::TimeExceededCode::TtlExceededInTransit
            }
            icmpv6::TimeExceededCode::FragmentReassemblyTimeExceeded => {
                icmpv4::TimeExceededCode::FragmentReassemblyTimeExceeded
            }
        }),

        Icmpv6Type::ParameterProblem(header) => match header.code {
            icmpv6::ParameterProblemCode::ErroneousHeaderField => {
                let pointer = translate_pointer_6to4(header.pointer).ok_or_else(|| {
                    Breakdown::drop(StatId::UntranslatableParamProbPtr64)
                })?;
                Icmpv4Type::ParameterProblem(
                    icmpv4::ParameterProblemHeader::PointerIndicatesError(pointer),
                )
            }
            icmpv6::ParameterProblemCode::UnrecognizedNextHeader => {
                Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::Protocol)
            }
            _ => return Err(Breakdown::drop(StatId::UntranslatableParamProb64)),
        },

        _ => return Err(Breakdown::drop(StatId::UnknownIcmp6Type)),
    };

    let inner = parse_inner(&pkt.payload, false)?;
    let payload = translate_inner(ctx.out_tuple, &inner)?;
    Ok((out_type, payload))
}

/// IPv6 header byte offset → IPv4 header byte offset.
fn translate_pointer_6to4(ptr: u32) -> Option<u8> {
    match ptr {
        0 => Some(0),         // version
        1 => Some(1),         // traffic class → TOS
        4 | 5 => Some(2),     // payload length → total length
        6 => Some(9),         // next header → protocol
        7 => Some(8),         // hop limit → TTL
        8..=23 => Some(12),   // source address
        24..=39 => Some(16),  // destination address
        _ => None,            // flow label and friends
    }
}

/// Inner entry point for outgoing ICMPv4 errors; see the v4to6 twin.
fn translate_inner(out_tuple: &Tuple, inner: &InnerPkt) -> Result<Vec<u8>, Breakdown> {
    let tuple = match out_tuple {
        Tuple::V4(t) => t,
        Tuple::V6(_) => return Err(Breakdown::drop(StatId::Unknown)),
    };
    let InnerL3::V6(in_hdr) = &inner.l3 else {
        return Err(Breakdown::drop(StatId::UnknownProtoInner));
    };

    let protocol = match inner.proto {
        L4Proto::Tcp => IpNumber::TCP,
        L4Proto::Udp => IpNumber::UDP,
        L4Proto::Icmp => IpNumber::ICMP,
    };

    let mut hdr = Ipv4Header {
        dscp: Ipv4Dscp::try_new(in_hdr.traffic_class >> 2).unwrap_or(Ipv4Dscp::ZERO),
        ecn: Ipv4Ecn::try_new(in_hdr.traffic_class & 0b11).unwrap_or(Ipv4Ecn::ZERO),
        total_len: in_hdr.payload_length.saturating_add(Ipv4Header::MIN_LEN_U16),
        identification: 0,
        dont_fragment: false,
        more_fragments: false,
        fragment_offset: IpFragOffset::ZERO,
        time_to_live: in_hdr.hop_limit,
        protocol,
        header_checksum: 0,
        source: tuple.dst.addr.octets(),
        destination: tuple.src.addr.octets(),
        options: Ipv4Options::default(),
    };
    hdr.header_checksum = hdr.calc_header_checksum();

    let mut bytes = Vec::with_capacity(Ipv4Header::MIN_LEN + inner.l4_bytes.len());
    hdr.write(&mut bytes).map_err(|_| Breakdown::drop(StatId::Unknown))?;
    let l4_start = bytes.len();
    bytes.extend_from_slice(&inner.l4_bytes);
    patch_inner_l4(&mut bytes[l4_start..], inner.proto, tuple.dst.port, tuple.src.port, false);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_map_6to4() {
        assert_eq!(translate_pointer_6to4(0), Some(0));
        assert_eq!(translate_pointer_6to4(4), Some(2));
        assert_eq!(translate_pointer_6to4(6), Some(9));
        assert_eq!(translate_pointer_6to4(7), Some(8));
        assert_eq!(translate_pointer_6to4(10), Some(12));
        assert_eq!(translate_pointer_6to4(30), Some(16));
        assert_eq!(translate_pointer_6to4(2), None, "flow label has no v4 field");
    }
}
