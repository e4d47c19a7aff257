//! RFC 6052 address embedding.
//!
//! Pool6 is a single IPv6 prefix whose suffix encodes an IPv4 address.
//! The prefix length decides where the four IPv4 octets land; bits 64-71
//! (the "u" octet) are always zero and are skipped by the layouts that
//! straddle them.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::Ipv6Net;

/// The prefix lengths RFC 6052 section 2.2 defines.
pub const VALID_PREFIX_LENGTHS: [u8; 6] = [32, 40, 48, 56, 64, 96];

pub fn is_valid_prefix(prefix: &Ipv6Net) -> bool {
    VALID_PREFIX_LENGTHS.contains(&prefix.prefix_len())
}

/// Byte positions of the embedded IPv4 address for each prefix length.
fn v4_offsets(prefix_len: u8) -> [usize; 4] {
    match prefix_len {
        32 => [4, 5, 6, 7],
        40 => [5, 6, 7, 9],
        48 => [6, 7, 9, 10],
        56 => [7, 9, 10, 11],
        64 => [9, 10, 11, 12],
        _ => [12, 13, 14, 15],
    }
}

/// Builds the IPv6 representation of `addr` under `prefix`
/// (RFC 6052 section 2.3, the 4-to-6 direction).
pub fn embed(prefix: &Ipv6Net, addr: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.network().octets();
    let v4 = addr.octets();
    for (i, &pos) in v4_offsets(prefix.prefix_len()).iter().enumerate() {
        octets[pos] = v4[i];
    }
    octets[8] = 0; // the "u" octet
    Ipv6Addr::from(octets)
}

/// Recovers the IPv4 address embedded in `addr`, or `None` when `addr`
/// does not belong to `prefix` (the 6-to-4 direction).
pub fn extract(prefix: &Ipv6Net, addr: Ipv6Addr) -> Option<Ipv4Addr> {
    if !prefix.contains(&addr) {
        return None;
    }
    let octets = addr.octets();
    let pos = v4_offsets(prefix.prefix_len());
    Some(Ipv4Addr::new(
        octets[pos[0]],
        octets[pos[1]],
        octets[pos[2]],
        octets[pos[3]],
    ))
}

pub fn contains(prefix: &Ipv6Net, addr: Ipv6Addr) -> bool {
    prefix.contains(&addr)
}
