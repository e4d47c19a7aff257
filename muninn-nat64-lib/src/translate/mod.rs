//! Translating the Packet (RFC 6146 section 3.7) over the RFC 6145
//! header mappings.
//!
//! A per-(family, protocol) step table drives the work:
//! `create_out → l3_hdr → l3_payload → l3_post → route → l4_post`,
//! then fragmentation. Inner packets (ICMP error payloads) run only the
//! first two steps through their own entry point; they are routinely
//! truncated, so fixing lengths and checksums would fabricate data.

mod fragment;
mod v4to6;
mod v6to4;

use etherparse::{Ipv4Header, Ipv6FragmentHeader, Ipv6Header};

use crate::config::GlobalConfig;
use crate::hooks::RouteInfo;
use crate::instance::Xlator;
use crate::packet::{Breakdown, IpPkt, L4Hdr};
use crate::stats::StatId;
use crate::types::{L3Proto, Tuple};

/// Outgoing network header under construction.
#[derive(Debug, Clone)]
pub enum OutL3 {
    V4(Ipv4Header),
    V6 {
        hdr: Ipv6Header,
        frag: Option<Ipv6FragmentHeader>,
    },
}

/// The packet being built. Headers stay decoded until the final
/// assembly so the post-passes can patch them.
#[derive(Debug, Clone)]
pub struct OutPkt {
    pub l3: OutL3,
    pub l4: L4Hdr,
    pub payload: Vec<u8>,
}

/// Shared state of one translation run.
pub struct XlationCtx<'a> {
    pub xlator: &'a Xlator,
    pub cfg: &'a GlobalConfig,
    pub in_pkt: &'a IpPkt,
    pub out_tuple: &'a Tuple,
    pub route: Option<RouteInfo>,
}

type Step = fn(&mut XlationCtx<'_>, &mut OutPkt) -> Result<(), Breakdown>;

/// The six functions that turn one family into the other.
struct TranslationSteps {
    create_out: fn(&XlationCtx<'_>) -> Result<OutPkt, Breakdown>,
    l3_hdr: Step,
    l3_payload: Step,
    l3_post: Step,
    route: Step,
    l4_post: Step,
}

static STEPS_6TO4: TranslationSteps = TranslationSteps {
    create_out: v6to4::create_out,
    l3_hdr: v6to4::l3_hdr,
    l3_payload: v6to4::l3_payload,
    l3_post: v6to4::l3_post,
    route: v6to4::route,
    l4_post: v6to4::l4_post,
};

static STEPS_4TO6: TranslationSteps = TranslationSteps {
    create_out: v4to6::create_out,
    l3_hdr: v4to6::l3_hdr,
    l3_payload: v4to6::l3_payload,
    l3_post: v4to6::l3_post,
    route: v4to6::route,
    l4_post: v4to6::l4_post,
};

fn steps_for(in_family: L3Proto) -> &'static TranslationSteps {
    // The three protocols share the step set within a direction; the
    // payload step dispatches on the transport itself.
    match in_family {
        L3Proto::V6 => &STEPS_6TO4,
        L3Proto::V4 => &STEPS_4TO6,
    }
}

/// Runs the whole table for one packet. On success the caller gets one
/// or more ready-to-send frames (more than one only after IPv6
/// fragmentation).
pub fn translating_the_packet(
    xlator: &Xlator,
    cfg: &GlobalConfig,
    in_pkt: &IpPkt,
    out_tuple: &Tuple,
) -> Result<Vec<(L3Proto, Vec<u8>)>, Breakdown> {
    let in_family = match in_pkt {
        IpPkt::V6(_) => L3Proto::V6,
        IpPkt::V4(_) => L3Proto::V4,
    };
    let steps = steps_for(in_family);

    let mut ctx = XlationCtx { xlator, cfg, in_pkt, out_tuple, route: None };
    let mut out = (steps.create_out)(&ctx)?;
    (steps.l3_hdr)(&mut ctx, &mut out)?;
    (steps.l3_payload)(&mut ctx, &mut out)?;
    (steps.l3_post)(&mut ctx, &mut out)?;
    (steps.route)(&mut ctx, &mut out)?;
    (steps.l4_post)(&mut ctx, &mut out)?;

    fragment::fragment_if_too_big(&ctx, out)
}

/// Serializes the finished packet.
pub(super) fn assemble(out: &OutPkt) -> Result<(L3Proto, Vec<u8>), Breakdown> {
    let mut frame = Vec::with_capacity(out_len(out));
    match &out.l3 {
        OutL3::V4(hdr) => {
            hdr.write(&mut frame)
                .map_err(|_| Breakdown::drop(StatId::Unknown))?;
        }
        OutL3::V6 { hdr, frag } => {
            hdr.write(&mut frame)
                .map_err(|_| Breakdown::drop(StatId::Unknown))?;
            if let Some(frag) = frag {
                frag.write(&mut frame)
                    .map_err(|_| Breakdown::drop(StatId::Unknown))?;
            }
        }
    }
    write_l4(&mut frame, &out.l4)?;
    frame.extend_from_slice(&out.payload);
    let family = match out.l3 {
        OutL3::V4(_) => L3Proto::V4,
        OutL3::V6 { .. } => L3Proto::V6,
    };
    Ok((family, frame))
}

fn write_l4(frame: &mut Vec<u8>, l4: &L4Hdr) -> Result<(), Breakdown> {
    let ok = match l4 {
        L4Hdr::Tcp(h) => h.write(frame).is_ok(),
        L4Hdr::Udp(h) => h.write(frame).is_ok(),
        L4Hdr::Icmp4(h) => h.write(frame).is_ok(),
        L4Hdr::Icmp6(h) => h.write(frame).is_ok(),
    };
    ok.then_some(()).ok_or_else(|| Breakdown::drop(StatId::Unknown))
}

pub(super) fn out_len(out: &OutPkt) -> usize {
    let l3 = match &out.l3 {
        OutL3::V4(hdr) => hdr.header_len(),
        OutL3::V6 { frag, .. } => Ipv6Header::LEN + frag.as_ref().map_or(0, |_| 8),
    };
    l3 + l4_len(&out.l4) + out.payload.len()
}

pub(super) fn l4_len(l4: &L4Hdr) -> usize {
    match l4 {
        L4Hdr::Tcp(h) => usize::from(h.header_len()),
        L4Hdr::Udp(_) => 8,
        L4Hdr::Icmp4(h) => h.header_len(),
        L4Hdr::Icmp6(h) => h.header_len(),
    }
}

/// Out-tuple ports, with the ICMP identifier folded in.
pub(super) fn out_ports(tuple: &Tuple) -> (u16, u16) {
    match tuple {
        Tuple::V6(t) => (t.src.port, t.dst.port),
        Tuple::V4(t) => (t.src.port, t.dst.port),
    }
}
