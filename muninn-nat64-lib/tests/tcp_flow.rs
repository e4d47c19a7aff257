//! TCP state machine and retention-queue behavior, end to end.

mod common;

use std::time::{Duration, Instant};

use common::*;
use muninn_nat64_lib::bib::SessionState;
use muninn_nat64_lib::config::{field, GlobalConfig};
use muninn_nat64_lib::filtering::tcp_expired_cb;
use muninn_nat64_lib::packet::{parse4, parse6, L4Hdr};
use muninn_nat64_lib::stats::StatId;
use muninn_nat64_lib::types::{L3Proto, L4Proto, Verdict};
use muninn_nat64_lib::xlation::process;

const DST6: &str = "64:ff9b::cb00:7105";

fn tcp_state(xl: &muninn_nat64_lib::instance::Xlator) -> SessionState {
    let cfg = xl.config.load_full();
    let sessions = xl.bib.foreach_session(L4Proto::Tcp, None, 16, &cfg.timeouts);
    assert_eq!(sessions.len(), 1, "expected exactly one TCP session");
    sessions[0].state
}

#[test]
fn handshake_fin_exchange_and_expiry() {
    let (xl, _) = xlator();

    // v6 SYN opens the session.
    let syn6 = tcp6_frame("2001:db8::1", 9000, DST6, 80, SYN);
    assert_eq!(process(&xl, &syn6, 0).verdict, Verdict::Continue);
    assert_eq!(tcp_state(&xl), SessionState::V6Init);

    // SYN-ACK from the v4 peer establishes.
    let synack4 = tcp4_frame("203.0.113.5", 80, "198.51.100.1", 40000, SYNACK);
    assert_eq!(process(&xl, &synack4, 0).verdict, Verdict::Continue);
    assert_eq!(tcp_state(&xl), SessionState::Established);

    // FIN from the v6 side, then the v4 side.
    let fin6 = tcp6_frame("2001:db8::1", 9000, DST6, 80, FIN);
    process(&xl, &fin6, 0);
    assert_eq!(tcp_state(&xl), SessionState::V6FinRcv);

    let fin4 = tcp4_frame("203.0.113.5", 80, "198.51.100.1", 40000, FIN);
    process(&xl, &fin4, 0);
    assert_eq!(tcp_state(&xl), SessionState::V4FinV6FinRcv);

    // Only the transitory timer closes the terminal state.
    let cfg = xl.config.load_full();
    let soon = Instant::now() + Duration::from_secs(cfg.timeouts.tcp_trans_secs + 1);
    let report = xl.bib.clean(soon, &cfg.timeouts, &mut tcp_expired_cb);
    assert_eq!(report.removed, 1);
    assert_eq!(xl.bib.session_count(L4Proto::Tcp), 0);
    assert_eq!(xl.bib.bib_count(L4Proto::Tcp), 0);
}

#[test]
fn retransmitted_syn_keeps_the_binding() {
    let (xl, _) = xlator();
    let syn6 = tcp6_frame("2001:db8::1", 9000, DST6, 80, SYN);

    let first = process(&xl, &syn6, 0);
    let second = process(&xl, &syn6, 0);
    assert_eq!(first.verdict, Verdict::Continue);
    assert_eq!(second.verdict, Verdict::Continue);

    let a = parse4(&first.frames[0].1, 0).unwrap();
    let b = parse4(&second.frames[0].1, 0).unwrap();
    let (L4Hdr::Tcp(ta), L4Hdr::Tcp(tb)) = (&a.l4, &b.l4) else { panic!("expected TCP") };
    assert_eq!(ta.source_port, tb.source_port, "retransmit must reuse the mask");
    assert_eq!(xl.bib.session_count(L4Proto::Tcp), 1);
}

#[test]
fn v6_non_syn_without_session_is_dropped() {
    let (xl, _) = xlator();
    let data6 = tcp6_frame("2001:db8::1", 9000, DST6, 80, DATA);
    assert_eq!(process(&xl, &data6, 0).verdict, Verdict::Drop);
    assert_eq!(xl.stats.get(StatId::Syn6Expected), 1);
}

#[test]
fn v4_first_syn_waits_and_replays_on_simultaneous_open() {
    let (xl, _) = xlator();

    // The TCP pool has a single candidate, so the v6 opener will take
    // exactly the address this SYN targeted.
    let syn4 = tcp4_frame("203.0.113.5", 80, "198.51.100.1", 40000, SYN);
    let outcome = process(&xl, &syn4, 0);
    assert_eq!(outcome.verdict, Verdict::Stolen);
    assert_eq!(xl.stats.get(StatId::PktQueueStored), 1);
    assert!(!xl.pktqueue.is_empty());

    let syn6 = tcp6_frame("2001:db8::1", 9000, DST6, 80, SYN);
    let outcome = process(&xl, &syn6, 0);
    assert_eq!(outcome.verdict, Verdict::Continue);
    assert_eq!(outcome.frames.len(), 2, "opener plus the replayed SYN");
    assert!(xl.pktqueue.is_empty());

    // The replay went 4→6: the stored SYN reached the v6 node.
    let (family, replayed) = &outcome.frames[1];
    assert_eq!(*family, L3Proto::V6);
    let pkt = parse6(replayed, 0).unwrap();
    assert_eq!(pkt.dst(), v6("2001:db8::1"));
    let L4Hdr::Tcp(tcp) = &pkt.l4 else { panic!("expected TCP") };
    assert!(tcp.syn);
    assert_eq!(tcp.destination_port, 9000);
}

#[test]
fn v4_first_syn_with_adf_is_rejected_loudly() {
    let (xl, egress) = xlator();
    let mut values = GlobalConfig::default();
    values.filtering.address_dependent_filtering = true;
    xl.set_global(field::ADF, &values).unwrap();

    let syn4 = tcp4_frame("203.0.113.5", 80, "198.51.100.1", 40000, SYN);
    assert_eq!(process(&xl, &syn4, 0).verdict, Verdict::Drop);
    assert_eq!(xl.stats.get(StatId::V4Syn), 1);

    let frames = egress.take();
    assert_eq!(frames.len(), 1, "filter-prohibited ICMP owed to the sender");
    assert_eq!(frames[0].0, L3Proto::V4);
}

#[test]
fn retained_syn_expires_into_host_unreachable() {
    let (xl, egress) = xlator();
    let syn4 = tcp4_frame("203.0.113.5", 80, "198.51.100.1", 40000, SYN);
    assert_eq!(process(&xl, &syn4, 0).verdict, Verdict::Stolen);
    egress.take();

    let cfg = xl.config.load_full();
    xl.tick(Instant::now() + Duration::from_secs(cfg.timeouts.tcp_v4_syn_secs + 1));

    assert!(xl.pktqueue.is_empty());
    let frames = egress.take();
    assert_eq!(frames.len(), 1);
    let err = parse4(&frames[0].1, 0).unwrap();
    assert!(err.is_icmp_error());
    assert_eq!(err.dst(), v4("203.0.113.5"));
}

#[test]
fn rst_then_data_recovers_established() {
    let (xl, _) = xlator();
    process(&xl, &tcp6_frame("2001:db8::1", 9000, DST6, 80, SYN), 0);
    process(&xl, &tcp4_frame("203.0.113.5", 80, "198.51.100.1", 40000, SYNACK), 0);

    let rst = TcpFlags { syn: false, fin: false, rst: true, ack: false };
    process(&xl, &tcp4_frame("203.0.113.5", 80, "198.51.100.1", 40000, rst), 0);
    assert_eq!(tcp_state(&xl), SessionState::Trans);

    process(&xl, &tcp6_frame("2001:db8::1", 9000, DST6, 80, DATA), 0);
    assert_eq!(tcp_state(&xl), SessionState::Established);
}
