//! The per-packet pipeline.
//!
//! `process` is the one entry point the packet hook calls. It owns the
//! step order of the whole translator:
//! determine tuple → filtering & updating → compute outgoing tuple →
//! translate → fragment. Every packet leaves with exactly one verdict.

use tracing::debug;

use crate::bib::Session;
use crate::config::GlobalConfig;
use crate::filtering::{self, FilterVerdict};
use crate::icmp;
use crate::instance::Xlator;
use crate::packet::{self, Breakdown, IpPkt};
use crate::rfc6052;
use crate::stats::StatId;
use crate::translate;
use crate::types::{
    L3Proto, L4Proto, TransportAddr4, TransportAddr6, Tuple, Tuple4, Tuple6, Verdict,
};

/// What became of one incoming frame.
#[derive(Debug)]
pub struct Outcome {
    pub verdict: Verdict,
    /// Frames to transmit on success: usually one, several after
    /// fragmentation or a simultaneous-open replay.
    pub frames: Vec<(L3Proto, Vec<u8>)>,
}

impl Outcome {
    fn just(verdict: Verdict) -> Self {
        Self { verdict, frames: Vec::new() }
    }
}

/// Translates one raw IP frame. `mark` is the traffic class the OS
/// stamped on the packet; it selects the pool4 sub-pool.
pub fn process(xlator: &Xlator, frame: &[u8], mark: u32) -> Outcome {
    let cfg = xlator.config.load_full();
    let cfg = cfg.as_ref();

    if !cfg.enabled {
        xlator.stats.inc(StatId::InstanceDisabled);
        return Outcome::just(Verdict::Accept);
    }

    // Step 0: parse. The version nibble picks the family.
    let pkt = match frame.first().map(|b| b >> 4) {
        Some(6) => {
            xlator.stats.inc(StatId::Received6);
            packet::parse6(frame, mark).map(IpPkt::V6)
        }
        Some(4) => {
            xlator.stats.inc(StatId::Received4);
            packet::parse4(frame, mark).map(IpPkt::V4)
        }
        _ => Err(Breakdown::drop(StatId::UnknownL4Proto)),
    };
    let pkt = match pkt {
        Ok(pkt) => pkt,
        Err(bd) => return breakdown(xlator, None, bd),
    };

    // Step 1: determine the incoming tuple.
    let tuple = match packet::determine_tuple(&pkt) {
        Ok(tuple) => tuple,
        Err(bd) => return breakdown(xlator, Some(&pkt), bd),
    };

    // Step 2: filtering and updating.
    let (session, replay) =
        match filtering::filtering_and_updating(xlator, cfg, &pkt, &tuple, frame) {
            FilterVerdict::Continue { session, replay } => (session, replay),
            FilterVerdict::Accept(stat) => {
                if let Some(stat) = stat {
                    xlator.stats.inc(stat);
                }
                return Outcome::just(Verdict::Accept);
            }
            FilterVerdict::Drop(bd) => return breakdown(xlator, Some(&pkt), bd),
            FilterVerdict::Stolen => {
                xlator.stats.inc(StatId::PktQueueStored);
                return Outcome::just(Verdict::Stolen);
            }
        };

    // Steps 3 and 4: compute the outgoing tuple, translate, fragment.
    let out_tuple = match compute_out_tuple(xlator, cfg, &tuple, session.as_ref()) {
        Ok(out_tuple) => out_tuple,
        Err(bd) => return breakdown(xlator, Some(&pkt), bd),
    };
    let mut frames = match translate::translating_the_packet(xlator, cfg, &pkt, &out_tuple) {
        Ok(frames) => frames,
        Err(bd) => return breakdown(xlator, Some(&pkt), bd),
    };

    // A retained v4 SYN whose binding just appeared translates now,
    // behind the packet that opened the way.
    if let Some(stored) = replay {
        debug!("replaying a retained v4 SYN");
        let replay_outcome = process(xlator, &stored.frame, stored.mark);
        frames.extend(replay_outcome.frames);
    }

    xlator.stats.inc(StatId::Success);
    Outcome { verdict: Verdict::Continue, frames }
}

fn breakdown(xlator: &Xlator, pkt: Option<&IpPkt>, bd: Breakdown) -> Outcome {
    xlator.stats.inc(bd.stat);
    if let (Some(pkt), Some(kind)) = (pkt, bd.icmp) {
        icmp::send_error(xlator.egress.as_ref(), &xlator.stats, pkt, kind);
    }
    Outcome::just(Verdict::Drop)
}

/// Step 3: the outgoing tuple. Packets that went through F&U take it
/// straight from their session; ICMP errors (which bypass F&U) consult
/// the BIB read-only.
fn compute_out_tuple(
    xlator: &Xlator,
    cfg: &GlobalConfig,
    tuple: &Tuple,
    session: Option<&Session>,
) -> Result<Tuple, Breakdown> {
    match (tuple, session) {
        (Tuple::V6(_), Some(s)) => Ok(Tuple::V4(Tuple4 {
            src: s.src4,
            dst: s.dst4,
            proto: s.proto,
        })),
        (Tuple::V4(_), Some(s)) => Ok(Tuple::V6(Tuple6 {
            src: s.dst6,
            dst: s.src6,
            proto: s.proto,
        })),
        (Tuple::V6(t), None) => {
            let pool6 = cfg.pool6.as_ref().ok_or(Breakdown::drop(StatId::Pool6Unset))?;
            let bib = xlator
                .bib
                .find6(t.proto, t.src)
                .ok_or(Breakdown::drop(StatId::Src64))?;
            let dst_addr = rfc6052::extract(pool6, t.dst.addr)
                .ok_or(Breakdown::drop(StatId::Dst64))?;
            let (src_port, dst_port) = match t.proto {
                L4Proto::Icmp => (bib.v4.port, bib.v4.port),
                _ => (bib.v4.port, t.dst.port),
            };
            Ok(Tuple::V4(Tuple4 {
                src: TransportAddr4::new(bib.v4.addr, src_port),
                dst: TransportAddr4::new(dst_addr, dst_port),
                proto: t.proto,
            }))
        }
        (Tuple::V4(t), None) => {
            let pool6 = cfg.pool6.as_ref().ok_or(Breakdown::drop(StatId::Pool6Unset))?;
            let bib = xlator
                .bib
                .find4(t.proto, t.dst)
                .ok_or(Breakdown::drop(StatId::Dst46))?;
            let src_addr = rfc6052::embed(pool6, t.src.addr);
            let (src_port, dst_port) = match t.proto {
                L4Proto::Icmp => (bib.v6.port, bib.v6.port),
                _ => (t.src.port, bib.v6.port),
            };
            Ok(Tuple::V6(Tuple6 {
                src: TransportAddr6::new(src_addr, src_port),
                dst: TransportAddr6::new(bib.v6.addr, dst_port),
                proto: t.proto,
            }))
        }
    }
}
