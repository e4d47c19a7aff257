//! The mask domain: every `(address, port)` a packet class may bind to,
//! walked in a deterministic order.
//!
//! Determinism is a correctness requirement, not an optimization: a
//! retransmitted SYN that races its own BIB insert must land on the
//! same candidate, so the walk starts at a position derived from a
//! fixed-seed hash of the tuple and proceeds in slice, then address,
//! then port order.

use std::hash::{BuildHasher, Hash, Hasher};

use ipnet::Ipv4Net;

use super::db::{addr_at, addr_count};
use crate::config::f_args;
use crate::types::{L4Proto, PortRange, TransportAddr4, Tuple6};

/// Seeds are constants on purpose; see the module comment.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x6d75_6e69_6e6e_3634,
    0x7033_6f6c_3464_6221,
    0x9e37_79b9_7f4a_7c15,
    0x517c_c1b7_2722_0a95,
);

struct Slice {
    prefix: Ipv4Net,
    first_port: u16,
    port_step: u16,
    ports_per_addr: u32,
    candidates: u32,
}

pub struct MaskDomain {
    slices: Vec<Slice>,
    total: u32,
    start: u32,
    emitted: u32,
}

impl MaskDomain {
    /// Builds the domain for `tuple` over the given pool slices.
    ///
    /// Port parity is preserved for TCP/UDP and the candidate set is
    /// restricted to the source port's privileged/unprivileged class,
    /// each dropped in turn when it would leave the domain empty.
    pub(super) fn new(
        slices: &[(Ipv4Net, PortRange)],
        tuple: &Tuple6,
        f_args_mask: u8,
    ) -> Option<MaskDomain> {
        let parity = match tuple.proto {
            L4Proto::Tcp | L4Proto::Udp => Some(tuple.src.port & 1),
            L4Proto::Icmp => None,
        };

        let attempts: [(bool, Option<u16>); 4] =
            [(true, parity), (true, None), (false, parity), (false, None)];

        let built = attempts.iter().find_map(|&(class_restricted, parity)| {
            let built = build_slices(slices, tuple.src.port, class_restricted, parity);
            (!built.is_empty()).then_some(built)
        })?;

        let total: u32 = built.iter().map(|s| s.candidates).sum();
        let start = (hash_tuple(tuple, f_args_mask) % u64::from(total)) as u32;

        Some(MaskDomain { slices: built, total, start, emitted: 0 })
    }

    /// Number of candidates the walk will produce.
    pub fn len(&self) -> u32 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn candidate(&self, mut n: u32) -> TransportAddr4 {
        for slice in &self.slices {
            if n < slice.candidates {
                let addr_idx = n / slice.ports_per_addr;
                let port_idx = n % slice.ports_per_addr;
                let addr = addr_at(&slice.prefix, u64::from(addr_idx));
                let port = slice.first_port + (port_idx as u16) * slice.port_step;
                return TransportAddr4::new(addr, port);
            }
            n -= slice.candidates;
        }
        unreachable!("candidate index past the domain total");
    }
}

impl Iterator for MaskDomain {
    type Item = TransportAddr4;

    fn next(&mut self) -> Option<TransportAddr4> {
        if self.emitted >= self.total {
            return None;
        }
        let n = (self.start + self.emitted) % self.total;
        self.emitted += 1;
        Some(self.candidate(n))
    }
}

fn build_slices(
    slices: &[(Ipv4Net, PortRange)],
    src_port: u16,
    class_restricted: bool,
    parity: Option<u16>,
) -> Vec<Slice> {
    slices
        .iter()
        .filter_map(|&(prefix, ports)| {
            let ports = if class_restricted { ports.same_class(src_port)? } else { ports };

            let (first_port, port_step, ports_per_addr) = match parity {
                None => (ports.min, 1, ports.count()),
                Some(parity) => {
                    let first =
                        if ports.min & 1 == parity { ports.min } else { ports.min.checked_add(1)? };
                    if first > ports.max {
                        return None;
                    }
                    (first, 2, u32::from(ports.max - first) / 2 + 1)
                }
            };

            let addrs = addr_count(&prefix);
            let candidates = u32::try_from(addrs * u64::from(ports_per_addr)).ok()?;
            (candidates > 0).then_some(Slice {
                prefix,
                first_port,
                port_step,
                ports_per_addr,
                candidates,
            })
        })
        .collect()
}

fn hash_tuple(tuple: &Tuple6, mask: u8) -> u64 {
    let state = ahash::RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
    let mut hasher = state.build_hasher();
    if mask & f_args::SRC_ADDR != 0 {
        tuple.src.addr.hash(&mut hasher);
    }
    if mask & f_args::SRC_PORT != 0 {
        tuple.src.port.hash(&mut hasher);
    }
    if mask & f_args::DST_ADDR != 0 {
        tuple.dst.addr.hash(&mut hasher);
    }
    if mask & f_args::DST_PORT != 0 {
        tuple.dst.port.hash(&mut hasher);
    }
    if mask & f_args::PROTO != 0 {
        (tuple.proto as u8).hash(&mut hasher);
    }
    hasher.finish()
}
