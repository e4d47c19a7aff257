//! Translator instances and the registry that names them.
//!
//! One process can host several translators; each is a self-contained
//! value (config snapshot, pool4, BIB, queues, counters) so there is no
//! global mutable state to trip over.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use etherparse::{IpNumber, Ipv6Header, TcpHeader};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bib::{Bib, Session};
use crate::config::{GlobalConfig, InstanceConfig};
use crate::error::{Nat64Error, Result};
use crate::filtering::{tcp_expired_cb, PktQueue};
use crate::hooks::{Egress, Router};
use crate::icmp::{self, IcmpKind};
use crate::joold::Joold;
use crate::packet::{parse4, IpPkt};
use crate::pool4::{Pool4Db, Pool4Sample};
use crate::stats::Stats;
use crate::types::L3Proto;

pub const MAX_INSTANCE_NAME_LEN: usize = 15;

/// Flavors of translator the control plane knows about. Only the
/// stateful one exists in this build; the others are rejected with an
/// explicit error instead of silently misbehaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XlatorKind {
    Nat64,
    Siit,
    Mapt,
}

pub struct Xlator {
    pub name: String,
    pub kind: XlatorKind,
    pub config: ArcSwap<GlobalConfig>,
    pub pool4: Pool4Db,
    pub bib: Bib,
    pub pktqueue: PktQueue,
    pub stats: Arc<Stats>,
    pub joold: Joold,
    pub egress: Arc<dyn Egress>,
    pub router: Arc<dyn Router>,
    ipv4_id: AtomicU16,
}

impl Xlator {
    pub fn new(
        name: impl Into<String>,
        config: GlobalConfig,
        egress: Arc<dyn Egress>,
        router: Arc<dyn Router>,
    ) -> Arc<Xlator> {
        let stats = Arc::new(Stats::new());
        Arc::new(Xlator {
            name: name.into(),
            kind: XlatorKind::Nat64,
            config: ArcSwap::from_pointee(config),
            pool4: Pool4Db::new(),
            bib: Bib::new(stats.clone()),
            pktqueue: PktQueue::new(),
            stats,
            joold: Joold::new(),
            egress,
            router,
            ipv4_id: AtomicU16::new(0),
        })
    }

    /// Builds an instance from its bootstrap stanza, pool4 included.
    pub fn from_config(
        cfg: &InstanceConfig,
        egress: Arc<dyn Egress>,
        router: Arc<dyn Router>,
    ) -> Arc<Xlator> {
        let mut global = cfg.global.clone();
        // The loader validated the list; this puts it in lookup order.
        if let Ok(plateaus) =
            crate::config::normalize_plateaus(global.translate.mtu_plateaus.clone())
        {
            global.translate.mtu_plateaus = plateaus;
        }
        let xlator = Xlator::new(cfg.name.clone(), global, egress, router);
        for slice in &cfg.pool4 {
            xlator.pool4.add(Pool4Sample {
                mark: slice.mark,
                proto: slice.proto,
                prefix: slice.prefix,
                ports: slice.ports,
            });
        }
        xlator
    }

    /// GLOBAL set: build the next snapshot, validate, publish whole.
    /// Readers holding the old `Arc` finish with it; the swap is the
    /// grace period.
    pub fn set_global(&self, mask: u32, values: &GlobalConfig) -> Result<()> {
        let next = self.config.load().apply(mask, values)?;
        self.config.store(Arc::new(next));
        Ok(())
    }

    /// Identification for translated IPv4 headers when `build_ipv4_id`
    /// is on. A wrapping counter spreads ids without a lock.
    pub fn next_ipv4_id(&self) -> u16 {
        self.ipv4_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// The periodic timer context: evict expired sessions, emit TCP
    /// probes, and answer expired retained SYNs. Frame emission happens
    /// after every table lock is back down.
    pub fn tick(&self, now: Instant) {
        let cfg = self.config.load();

        let report = self.bib.clean(now, &cfg.timeouts, &mut tcp_expired_cb);
        if report.removed > 0 {
            debug!(instance = %self.name, removed = report.removed, "expired sessions");
        }
        for session in &report.probes {
            if let Some(frame) = build_tcp_probe(session) {
                self.egress.send(L3Proto::V6, frame);
            }
        }

        for stored in self.pktqueue.expire(now) {
            if let Ok(pkt) = parse4(&stored.frame, stored.mark) {
                icmp::send_error(
                    self.egress.as_ref(),
                    &self.stats,
                    &IpPkt::V4(pkt),
                    IcmpKind::AddrUnreachable,
                );
            }
        }
    }
}

/// An empty ACK toward the v6 endpoint, asking a quiet established
/// session to prove it is still alive (RFC 6146 section 3.5.2.2).
fn build_tcp_probe(session: &Session) -> Option<Vec<u8>> {
    let mut tcp = TcpHeader::new(session.dst6.port, session.src6.port, 0, 8192);
    tcp.ack = true;

    let hdr = Ipv6Header {
        payload_length: u16::try_from(tcp.header_len()).ok()?,
        next_header: IpNumber::TCP,
        hop_limit: 64,
        source: session.dst6.addr.octets(),
        destination: session.src6.addr.octets(),
        ..Default::default()
    };
    tcp.checksum = tcp.calc_checksum_ipv6(&hdr, &[]).ok()?;

    let mut frame = Vec::with_capacity(Ipv6Header::LEN + usize::from(hdr.payload_length));
    hdr.write(&mut frame).ok()?;
    tcp.write(&mut frame).ok()?;
    Some(frame)
}

/// Name → instance. The registry is the control plane's root object.
#[derive(Default)]
pub struct InstanceRegistry {
    map: RwLock<AHashMap<String, Arc<Xlator>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: XlatorKind, xlator: Arc<Xlator>) -> Result<()> {
        if kind != XlatorKind::Nat64 {
            return Err(Nat64Error::StatefulOnly(
                "only NAT64 instances exist in this build",
            ));
        }
        if xlator.name.is_empty() || xlator.name.len() > MAX_INSTANCE_NAME_LEN {
            return Err(Nat64Error::Invalid(format!(
                "instance name '{}' must be 1-{} bytes",
                xlator.name, MAX_INSTANCE_NAME_LEN
            )));
        }
        let mut map = self.write();
        if map.contains_key(&xlator.name) {
            return Err(Nat64Error::Exists(format!("instance '{}'", xlator.name)));
        }
        info!(instance = %xlator.name, "instance created");
        map.insert(xlator.name.clone(), xlator);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Xlator>> {
        self.read().get(name).cloned()
    }

    pub fn rm(&self, name: &str) -> Result<()> {
        self.write()
            .remove(name)
            .map(|xlator| info!(instance = %xlator.name, "instance removed"))
            .ok_or_else(|| Nat64Error::NotFound(format!("instance '{name}'")))
    }

    pub fn flush(&self) {
        self.write().clear();
    }

    /// `(name, kind)` pairs, sorted by name for stable listings.
    pub fn foreach(&self) -> Vec<(String, XlatorKind)> {
        let mut out: Vec<_> = self
            .read()
            .values()
            .map(|x| (x.name.clone(), x.kind))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// INSTANCE hello: does the name resolve?
    pub fn hello(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn tick_all(&self, now: Instant) {
        let instances: Vec<Arc<Xlator>> = self.read().values().cloned().collect();
        for xlator in instances {
            xlator.tick(now);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AHashMap<String, Arc<Xlator>>> {
        self.map.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AHashMap<String, Arc<Xlator>>> {
        self.map.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{RecordingEgress, StaticRouter};

    fn xlator(name: &str) -> Arc<Xlator> {
        Xlator::new(
            name,
            GlobalConfig::default(),
            Arc::new(RecordingEgress::new()),
            Arc::new(StaticRouter::default()),
        )
    }

    #[test]
    fn registry_add_get_rm() {
        let registry = InstanceRegistry::new();
        registry.add(XlatorKind::Nat64, xlator("default")).unwrap();
        assert!(registry.hello("default"));
        assert!(registry.add(XlatorKind::Nat64, xlator("default")).is_err());

        registry.rm("default").unwrap();
        assert!(!registry.hello("default"));
        assert!(registry.rm("default").is_err());
    }

    #[test]
    fn stateless_kinds_are_rejected() {
        let registry = InstanceRegistry::new();
        let err = registry.add(XlatorKind::Siit, xlator("siit"));
        assert!(matches!(err, Err(Nat64Error::StatefulOnly(_))));
    }

    #[test]
    fn name_length_is_bounded() {
        let registry = InstanceRegistry::new();
        let err = registry.add(XlatorKind::Nat64, xlator("a-very-long-instance-name"));
        assert!(err.is_err());
    }

    #[test]
    fn ipv4_ids_change_between_calls() {
        let x = xlator("ids");
        assert_ne!(x.next_ipv4_id(), x.next_ipv4_id());
    }

    #[test]
    fn config_swap_is_atomic_per_reader() {
        let x = xlator("swap");
        let before = x.config.load_full();
        let mut values = GlobalConfig::default();
        values.timeouts.udp_secs = 1;
        x.set_global(crate::config::field::TIMEOUT_UDP, &values).unwrap();
        // The old snapshot is still intact for anyone holding it.
        assert_eq!(before.timeouts.udp_secs, 300);
        assert_eq!(x.config.load().timeouts.udp_secs, 1);
    }
}
