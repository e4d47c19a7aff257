//! Shared scaffolding for the end-to-end pipeline tests.
#![allow(dead_code)]

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use etherparse::{IpNumber, Ipv4Header, Ipv6Header, TcpHeader, UdpHeader};
use muninn_nat64_lib::config::GlobalConfig;
use muninn_nat64_lib::hooks::{RecordingEgress, StaticRouter};
use muninn_nat64_lib::instance::Xlator;
use muninn_nat64_lib::pool4::Pool4Sample;
use muninn_nat64_lib::types::{L4Proto, PortRange};

pub const POOL6: &str = "64:ff9b::/96";

/// A translator with the well-known prefix and one pool4 slice per
/// protocol: UDP 40000-40001, TCP 40000-40000, ICMP 100-200.
pub fn xlator() -> (Arc<Xlator>, Arc<RecordingEgress>) {
    let egress = Arc::new(RecordingEgress::new());
    let config = GlobalConfig {
        pool6: Some(POOL6.parse().unwrap()),
        ..GlobalConfig::default()
    };
    let xlator = Xlator::new(
        "test",
        config,
        egress.clone(),
        Arc::new(StaticRouter::default()),
    );
    for (proto, min, max) in [
        (L4Proto::Udp, 40000, 40001),
        (L4Proto::Tcp, 40000, 40000),
        (L4Proto::Icmp, 100, 200),
    ] {
        xlator.pool4.add(Pool4Sample {
            mark: 0,
            proto,
            prefix: "198.51.100.1/32".parse().unwrap(),
            ports: PortRange::new(min, max),
        });
    }
    (xlator, egress)
}

pub fn v6(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

pub fn v4(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn udp6_frame(src: &str, sport: u16, dst: &str, dport: u16, payload: &[u8]) -> Vec<u8> {
    let hdr = Ipv6Header {
        payload_length: (8 + payload.len()) as u16,
        next_header: IpNumber::UDP,
        hop_limit: 64,
        source: v6(src).octets(),
        destination: v6(dst).octets(),
        ..Default::default()
    };
    let mut udp = UdpHeader {
        source_port: sport,
        destination_port: dport,
        length: (8 + payload.len()) as u16,
        checksum: 0,
    };
    udp.checksum = udp
        .calc_checksum_ipv6_raw(hdr.source, hdr.destination, payload)
        .unwrap();

    let mut frame = Vec::new();
    hdr.write(&mut frame).unwrap();
    udp.write(&mut frame).unwrap();
    frame.extend_from_slice(payload);
    frame
}

pub fn udp4_frame(
    src: &str,
    sport: u16,
    dst: &str,
    dport: u16,
    payload: &[u8],
    df: bool,
) -> Vec<u8> {
    let mut hdr = Ipv4Header {
        total_len: (20 + 8 + payload.len()) as u16,
        time_to_live: 64,
        protocol: IpNumber::UDP,
        dont_fragment: df,
        source: v4(src).octets(),
        destination: v4(dst).octets(),
        ..Default::default()
    };
    hdr.header_checksum = hdr.calc_header_checksum();
    let mut udp = UdpHeader {
        source_port: sport,
        destination_port: dport,
        length: (8 + payload.len()) as u16,
        checksum: 0,
    };
    udp.checksum = udp
        .calc_checksum_ipv4_raw(hdr.source, hdr.destination, payload)
        .unwrap();

    let mut frame = Vec::new();
    hdr.write(&mut frame).unwrap();
    udp.write(&mut frame).unwrap();
    frame.extend_from_slice(payload);
    frame
}

pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack: bool,
}

pub fn tcp6_frame(src: &str, sport: u16, dst: &str, dport: u16, flags: TcpFlags) -> Vec<u8> {
    let mut tcp = TcpHeader::new(sport, dport, 1000, 8192);
    tcp.syn = flags.syn;
    tcp.fin = flags.fin;
    tcp.rst = flags.rst;
    tcp.ack = flags.ack;

    let hdr = Ipv6Header {
        payload_length: TcpHeader::MIN_LEN as u16,
        next_header: IpNumber::TCP,
        hop_limit: 64,
        source: v6(src).octets(),
        destination: v6(dst).octets(),
        ..Default::default()
    };
    tcp.checksum = tcp.calc_checksum_ipv6(&hdr, &[]).unwrap();

    let mut frame = Vec::new();
    hdr.write(&mut frame).unwrap();
    tcp.write(&mut frame).unwrap();
    frame
}

pub fn tcp4_frame(src: &str, sport: u16, dst: &str, dport: u16, flags: TcpFlags) -> Vec<u8> {
    let mut tcp = TcpHeader::new(sport, dport, 2000, 8192);
    tcp.syn = flags.syn;
    tcp.fin = flags.fin;
    tcp.rst = flags.rst;
    tcp.ack = flags.ack;

    let mut hdr = Ipv4Header {
        total_len: 20 + TcpHeader::MIN_LEN as u16,
        time_to_live: 64,
        protocol: IpNumber::TCP,
        dont_fragment: true,
        source: v4(src).octets(),
        destination: v4(dst).octets(),
        ..Default::default()
    };
    hdr.header_checksum = hdr.calc_header_checksum();
    tcp.checksum = tcp.calc_checksum_ipv4(&hdr, &[]).unwrap();

    let mut frame = Vec::new();
    hdr.write(&mut frame).unwrap();
    tcp.write(&mut frame).unwrap();
    frame
}

pub const SYN: TcpFlags = TcpFlags { syn: true, fin: false, rst: false, ack: false };
pub const SYNACK: TcpFlags = TcpFlags { syn: true, fin: false, rst: false, ack: true };
pub const FIN: TcpFlags = TcpFlags { syn: false, fin: true, rst: false, ack: true };
pub const DATA: TcpFlags = TcpFlags { syn: false, fin: false, rst: false, ack: true };
