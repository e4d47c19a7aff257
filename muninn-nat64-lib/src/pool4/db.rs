//! The pool of IPv4 transport addresses this translator masks as.
//!
//! Samples are segmented by `(mark, proto)` so different traffic
//! classes draw from disjoint sub-pools. Lookups on the packet path
//! take the read side only; mutation is administrative.

use std::net::Ipv4Addr;
use std::sync::RwLock;

use ahash::AHashMap;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::mask::MaskDomain;
use crate::types::{L4Proto, PortRange, TransportAddr4, Tuple6};

/// One advertised slice of the pool, as configured and as listed back
/// out through the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool4Sample {
    pub mark: u32,
    pub proto: L4Proto,
    pub prefix: Ipv4Net,
    pub ports: PortRange,
}

#[derive(Default)]
pub struct Pool4Db {
    tables: RwLock<AHashMap<(u32, L4Proto), Vec<(Ipv4Net, PortRange)>>>,
}

impl Pool4Db {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slice. Re-adding an identical `(mark, proto, prefix,
    /// ports)` tuple is a no-op.
    pub fn add(&self, sample: Pool4Sample) {
        let mut tables = self.write_tables();
        let slices = tables.entry((sample.mark, sample.proto)).or_default();
        if !slices.contains(&(sample.prefix, sample.ports)) {
            slices.push((sample.prefix, sample.ports));
        }
    }

    /// Removes an exact slice. Unknown slices are silently ignored,
    /// matching the add() idempotence.
    pub fn rm(&self, sample: Pool4Sample) {
        let mut tables = self.write_tables();
        if let Some(slices) = tables.get_mut(&(sample.mark, sample.proto)) {
            slices.retain(|s| *s != (sample.prefix, sample.ports));
            if slices.is_empty() {
                tables.remove(&(sample.mark, sample.proto));
            }
        }
    }

    pub fn flush(&self) {
        self.write_tables().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.read_tables().is_empty()
    }

    /// Whether inbound traffic to `taddr` belongs to this translator.
    /// The packet mark plays no part here; any class claims the
    /// address.
    pub fn contains(&self, proto: L4Proto, taddr: TransportAddr4) -> bool {
        self.read_tables().iter().any(|((_, p), slices)| {
            *p == proto
                && slices.iter().any(|(prefix, ports)| {
                    prefix.contains(&taddr.addr) && ports.contains(taddr.port)
                })
        })
    }

    /// Candidate generator for a new v6-initiated binding. `None` when
    /// no sample covers `(mark, proto)`; the caller must drop.
    pub fn find(&self, tuple: &Tuple6, f_args: u8, mark: u32) -> Option<MaskDomain> {
        let tables = self.read_tables();
        let slices = tables.get(&(mark, tuple.proto))?;
        MaskDomain::new(slices, tuple, f_args)
    }

    /// Samples in deterministic (mark, proto, insertion) order,
    /// starting after `offset` when given. Capped at `max` entries so
    /// the control plane can page.
    pub fn foreach(&self, offset: Option<Pool4Sample>, max: usize) -> Vec<Pool4Sample> {
        let tables = self.read_tables();
        let mut keys: Vec<_> = tables.keys().copied().collect();
        keys.sort_unstable_by_key(|(mark, proto)| (*mark, *proto as usize));

        let mut out = Vec::new();
        let mut seen_offset = offset.is_none();
        for key in keys {
            for &(prefix, ports) in &tables[&key] {
                let sample = Pool4Sample { mark: key.0, proto: key.1, prefix, ports };
                if !seen_offset {
                    seen_offset = Some(sample) == offset;
                    continue;
                }
                out.push(sample);
                if out.len() == max {
                    return out;
                }
            }
        }
        out
    }

    /// (tables, samples, transport addresses), the shape the control
    /// plane reports.
    pub fn count(&self) -> (u32, u64, u64) {
        let tables = self.read_tables();
        let mut samples = 0u64;
        let mut taddrs = 0u64;
        for slices in tables.values() {
            samples += slices.len() as u64;
            for (prefix, ports) in slices {
                taddrs += addr_count(prefix) * u64::from(ports.count());
            }
        }
        (tables.len() as u32, samples, taddrs)
    }

    fn read_tables(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, AHashMap<(u32, L4Proto), Vec<(Ipv4Net, PortRange)>>> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_tables(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, AHashMap<(u32, L4Proto), Vec<(Ipv4Net, PortRange)>>> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

pub(super) fn addr_count(prefix: &Ipv4Net) -> u64 {
    1u64 << (32 - prefix.prefix_len())
}

pub(super) fn addr_at(prefix: &Ipv4Net, index: u64) -> Ipv4Addr {
    let base = u32::from(prefix.network());
    Ipv4Addr::from(base + index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mark: u32, proto: L4Proto, prefix: &str, min: u16, max: u16) -> Pool4Sample {
        Pool4Sample {
            mark,
            proto,
            prefix: prefix.parse().unwrap(),
            ports: PortRange::new(min, max),
        }
    }

    #[test]
    fn add_is_idempotent() {
        let db = Pool4Db::new();
        let s = sample(0, L4Proto::Udp, "198.51.100.1/32", 40000, 40001);
        db.add(s);
        db.add(s);
        assert_eq!(db.count(), (1, 1, 2));
    }

    #[test]
    fn contains_ignores_mark() {
        let db = Pool4Db::new();
        db.add(sample(7, L4Proto::Udp, "198.51.100.1/32", 40000, 40001));
        assert!(db.contains(
            L4Proto::Udp,
            TransportAddr4::new("198.51.100.1".parse().unwrap(), 40000)
        ));
        assert!(!db.contains(
            L4Proto::Udp,
            TransportAddr4::new("198.51.100.1".parse().unwrap(), 39999)
        ));
        assert!(!db.contains(
            L4Proto::Tcp,
            TransportAddr4::new("198.51.100.1".parse().unwrap(), 40000)
        ));
    }

    #[test]
    fn rm_and_flush() {
        let db = Pool4Db::new();
        let s = sample(0, L4Proto::Tcp, "192.0.2.0/31", 100, 200);
        db.add(s);
        db.rm(s);
        assert!(db.is_empty());

        db.add(s);
        db.flush();
        assert!(db.is_empty());
    }

    #[test]
    fn foreach_pages_with_offset() {
        let db = Pool4Db::new();
        db.add(sample(0, L4Proto::Udp, "198.51.100.1/32", 1, 10));
        db.add(sample(0, L4Proto::Udp, "198.51.100.2/32", 1, 10));
        db.add(sample(1, L4Proto::Udp, "198.51.100.3/32", 1, 10));

        let first = db.foreach(None, 2);
        assert_eq!(first.len(), 2);
        let rest = db.foreach(Some(first[1]), 16);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].mark, 1);
    }
}
