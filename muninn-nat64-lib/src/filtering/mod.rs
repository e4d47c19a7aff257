//! Filtering and Updating, RFC 6146 section 3.5: step 2 of the
//! pipeline.
//!
//! Decides whether the packet is this translator's business, then feeds
//! it to the BIB so bindings and sessions come into existence or get
//! refreshed. UDP and ICMP take the simple paths; TCP goes through the
//! state machine via the collision callback.

mod pktqueue;
mod tcp;

pub use pktqueue::{PktQueue, StoreError, StoredPkt};
pub use tcp::{tcp_expired_cb, tcp_state_machine, TcpPktSummary};

use std::time::Instant;

use tracing::debug;

use crate::bib::{self, Add4Error, AddOutcome, Session, TcpAdd4Error, TcpAdd6Error};
use crate::config::{Bib4MissAction, GlobalConfig};
use crate::icmp::IcmpKind;
use crate::instance::Xlator;
use crate::packet::{Breakdown, IpPkt, Pkt4, Pkt6};
use crate::rfc6052;
use crate::stats::StatId;
use crate::types::{L3Proto, L4Proto, TransportAddr4, TransportAddr6, Tuple, Tuple4, Tuple6};

/// The step's outcome, consumed by the pipeline driver.
#[derive(Debug)]
pub enum FilterVerdict {
    /// Keep translating. ICMP errors bypass the tables, so the session
    /// can be absent. A drained retained SYN rides along when the
    /// packet completed a simultaneous open.
    Continue {
        session: Option<Session>,
        replay: Option<StoredPkt>,
    },
    /// Not ours; the optional counter says why.
    Accept(Option<StatId>),
    Drop(Breakdown),
    /// The frame is now owned by the retention queue.
    Stolen,
}

pub fn filtering_and_updating(
    xlator: &Xlator,
    cfg: &GlobalConfig,
    pkt: &IpPkt,
    tuple: &Tuple,
    frame: &[u8],
) -> FilterVerdict {
    match (pkt, tuple) {
        (IpPkt::V6(p), Tuple::V6(t)) => filter6(xlator, cfg, p, t),
        (IpPkt::V4(p), Tuple::V4(t)) => filter4(xlator, cfg, p, t, frame),
        _ => FilterVerdict::Drop(Breakdown::drop(StatId::Unknown)),
    }
}

fn filter6(xlator: &Xlator, cfg: &GlobalConfig, pkt: &Pkt6, tuple: &Tuple6) -> FilterVerdict {
    let Some(pool6) = &cfg.pool6 else {
        return FilterVerdict::Drop(Breakdown::drop(StatId::Pool6Unset));
    };

    // Boundary checks: loops die, foreign traffic passes through.
    if rfc6052::contains(pool6, pkt.src()) {
        debug!("hairpinning loop; dropping");
        return FilterVerdict::Drop(Breakdown::drop(StatId::HairpinLoop));
    }
    if !rfc6052::contains(pool6, pkt.dst()) {
        return FilterVerdict::Accept(Some(StatId::Pool6Mismatch));
    }

    // ICMP errors must not create or refresh state.
    if pkt.is_icmp_error() {
        return FilterVerdict::Continue { session: None, replay: None };
    }

    match tuple.proto {
        L4Proto::Udp => simple6(xlator, cfg, pool6, tuple, pkt.mark),
        L4Proto::Icmp => {
            if cfg.filtering.drop_icmp6_info {
                debug!("ICMPv6 ping dropped by policy");
                return FilterVerdict::Drop(Breakdown::drop(StatId::Icmp6Filter));
            }
            simple6(xlator, cfg, pool6, tuple, pkt.mark)
        }
        L4Proto::Tcp => tcp6(xlator, cfg, pool6, pkt, tuple),
    }
}

fn filter4(
    xlator: &Xlator,
    cfg: &GlobalConfig,
    pkt: &Pkt4,
    tuple: &Tuple4,
    frame: &[u8],
) -> FilterVerdict {
    if !xlator.pool4.contains(tuple.proto, tuple.dst) {
        return FilterVerdict::Accept(Some(StatId::Pool4Mismatch));
    }

    if pkt.is_icmp_error() {
        return FilterVerdict::Continue { session: None, replay: None };
    }

    let Some(pool6) = &cfg.pool6 else {
        return FilterVerdict::Drop(Breakdown::drop(StatId::Pool6Unset));
    };

    match tuple.proto {
        L4Proto::Udp | L4Proto::Icmp => simple4(xlator, cfg, pool6, tuple),
        L4Proto::Tcp => tcp4(xlator, cfg, pool6, pkt, tuple, frame),
    }
}

/// First halves of RFC 6146 sections 3.5.1 and 3.5.3.
fn simple6(
    xlator: &Xlator,
    cfg: &GlobalConfig,
    pool6: &ipnet::Ipv6Net,
    tuple: &Tuple6,
    mark: u32,
) -> FilterVerdict {
    let dst4 = match xlat_dst_6to4(pool6, tuple) {
        Some(dst4) => dst4,
        None => return FilterVerdict::Drop(Breakdown::drop(StatId::UntranslatableDst6)),
    };
    let Some(masks) = xlator.pool4.find(tuple, cfg.filtering.f_args, mark) else {
        return FilterVerdict::Drop(Breakdown::drop(StatId::MaskDomainNotFound));
    };

    match xlator.bib.add6(masks, tuple, dst4, &cfg.timeouts) {
        Ok(outcome) => succeed(xlator, outcome, None),
        Err(TcpAdd6Error::Exhausted) => {
            debug!("pool4 exhausted for {tuple:?}");
            FilterVerdict::Drop(Breakdown::drop(StatId::MaskDomainNotFound))
        }
        Err(TcpAdd6Error::SynExpected) => {
            FilterVerdict::Drop(Breakdown::drop(StatId::Unknown))
        }
    }
}

/// Second halves of RFC 6146 sections 3.5.1 and 3.5.3.
fn simple4(
    xlator: &Xlator,
    cfg: &GlobalConfig,
    pool6: &ipnet::Ipv6Net,
    tuple: &Tuple4,
) -> FilterVerdict {
    let dst6 = TransportAddr6::new(rfc6052::embed(pool6, tuple.src.addr), tuple.src.port);

    let adf = cfg.filtering.address_dependent_filtering;
    match xlator.bib.add4(dst6, tuple, adf, &cfg.timeouts) {
        Ok(outcome) => succeed(xlator, outcome, None),
        Err(Add4Error::NoBib) => {
            debug!("no BIB entry for {}", tuple.dst);
            bib4_miss(cfg)
        }
        Err(Add4Error::Filtered) => adf_reject(),
    }
}

/// IPv6 half of RFC 6146 section 3.5.2.
fn tcp6(
    xlator: &Xlator,
    cfg: &GlobalConfig,
    pool6: &ipnet::Ipv6Net,
    pkt: &Pkt6,
    tuple: &Tuple6,
) -> FilterVerdict {
    let dst4 = match xlat_dst_6to4(pool6, tuple) {
        Some(dst4) => dst4,
        None => return FilterVerdict::Drop(Breakdown::drop(StatId::UntranslatableDst6)),
    };
    let Some(masks) = xlator.pool4.find(tuple, cfg.filtering.f_args, pkt.mark) else {
        return FilterVerdict::Drop(Breakdown::drop(StatId::MaskDomainNotFound));
    };

    let summary = summarize6(pkt);
    let mut cb = |state: &mut bib::SessionState| tcp_state_machine(&summary, state);

    match xlator.bib.add_tcp6(masks, tuple, dst4, summary.syn, &cfg.timeouts, &mut cb) {
        Ok(outcome) => {
            // A v4 SYN may have been waiting for exactly this binding.
            let replay = outcome
                .created()
                .then(|| xlator.pktqueue.drain(&outcome.session().src4))
                .flatten();
            succeed(xlator, outcome, replay)
        }
        Err(TcpAdd6Error::SynExpected) => {
            FilterVerdict::Drop(Breakdown::drop(StatId::Syn6Expected))
        }
        Err(TcpAdd6Error::Exhausted) => {
            FilterVerdict::Drop(Breakdown::drop(StatId::MaskDomainNotFound))
        }
    }
}

/// IPv4 half of RFC 6146 section 3.5.2.
fn tcp4(
    xlator: &Xlator,
    cfg: &GlobalConfig,
    pool6: &ipnet::Ipv6Net,
    pkt: &Pkt4,
    tuple: &Tuple4,
    frame: &[u8],
) -> FilterVerdict {
    let dst6 = TransportAddr6::new(rfc6052::embed(pool6, tuple.src.addr), tuple.src.port);

    let summary = summarize4(pkt);
    let adf = cfg.filtering.address_dependent_filtering;
    let mut cb = |state: &mut bib::SessionState| tcp_state_machine(&summary, state);

    match xlator.bib.add_tcp4(dst6, tuple, summary.syn, adf, &cfg.timeouts, &mut cb) {
        Ok(outcome) => succeed(xlator, outcome, None),
        Err(TcpAdd4Error::Filtered) => adf_reject(),
        Err(TcpAdd4Error::SynExpected) => {
            FilterVerdict::Drop(Breakdown::drop(StatId::Syn4Expected))
        }
        Err(TcpAdd4Error::NoBib) if !summary.syn => bib4_miss(cfg),
        Err(TcpAdd4Error::NoBib) => {
            // Externally-initiated SYN. With filtering on it is
            // rejected outright; otherwise it waits for a v6 opener.
            if adf {
                return FilterVerdict::Drop(Breakdown::with_icmp(
                    StatId::V4Syn,
                    IcmpKind::FilterProhibited,
                ));
            }
            let deadline = Instant::now() + cfg.timeouts.tcp_v4_syn();
            match xlator.pktqueue.store(
                tuple.dst,
                frame.to_vec(),
                pkt.mark,
                deadline,
                cfg.filtering.max_stored_pkts,
            ) {
                Ok(()) => FilterVerdict::Stolen,
                Err(StoreError::Exists) => {
                    FilterVerdict::Drop(Breakdown::drop(StatId::PktQueueExists))
                }
                Err(StoreError::Full) => {
                    FilterVerdict::Drop(Breakdown::drop(StatId::PktQueueFull))
                }
            }
        }
    }
}

fn succeed(xlator: &Xlator, outcome: AddOutcome, replay: Option<StoredPkt>) -> FilterVerdict {
    let session = *outcome.session();
    bib::warn_if_closed(&session);
    // Advertised even when nothing changed; see the joold module.
    xlator.joold.advertise(&session);
    FilterVerdict::Continue { session: Some(session), replay }
}

fn bib4_miss(cfg: &GlobalConfig) -> FilterVerdict {
    match cfg.filtering.bib4_miss_action {
        Bib4MissAction::Accept => FilterVerdict::Accept(Some(StatId::Bib4NotFound)),
        Bib4MissAction::Drop => FilterVerdict::Drop(Breakdown::drop(StatId::Bib4NotFound)),
    }
}

fn adf_reject() -> FilterVerdict {
    debug!("blocked by address-dependent filtering");
    FilterVerdict::Drop(Breakdown::with_icmp(
        StatId::AdfRejected,
        IcmpKind::FilterProhibited,
    ))
}

fn xlat_dst_6to4(pool6: &ipnet::Ipv6Net, tuple: &Tuple6) -> Option<TransportAddr4> {
    rfc6052::extract(pool6, tuple.dst.addr)
        .map(|addr| TransportAddr4::new(addr, tuple.dst.port))
}

fn summarize6(pkt: &Pkt6) -> TcpPktSummary {
    let (syn, fin, rst) = match pkt.tcp() {
        Some(tcp) => (tcp.syn, tcp.fin, tcp.rst),
        None => (false, false, false),
    };
    TcpPktSummary { dir: L3Proto::V6, syn, fin, rst }
}

fn summarize4(pkt: &Pkt4) -> TcpPktSummary {
    let (syn, fin, rst) = match pkt.tcp() {
        Some(tcp) => (tcp.syn, tcp.fin, tcp.rst),
        None => (false, false, false),
    };
    TcpPktSummary { dir: L3Proto::V4, syn, fin, rst }
}
