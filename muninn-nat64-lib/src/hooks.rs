//! Seams to the outside world.
//!
//! The operating system owns packet delivery and routing; the translator
//! only ever talks to these traits. Tests plug in recorders, the daemon
//! plugs in whatever transport it was built around.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use crate::types::L3Proto;

/// Route metadata the translator needs before the L4 post-pass: the
/// egress MTU decides fragmentation and "packet too big" reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteInfo {
    pub mtu: u16,
}

/// Routing lookup. `None` means the destination is unreachable, which
/// drops the packet and bumps the failed-routes counter.
pub trait Router: Send + Sync {
    fn route4(&self, dst: Ipv4Addr) -> Option<RouteInfo>;
    fn route6(&self, dst: Ipv6Addr) -> Option<RouteInfo>;
}

/// Egress for frames the translator originates on its own: ICMP errors
/// and TCP probes. Translated packets are returned to the caller of the
/// pipeline instead.
pub trait Egress: Send + Sync {
    fn send(&self, family: L3Proto, frame: Vec<u8>);
}

/// Fixed-MTU router, fine for a single-homed deployment and for tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticRouter {
    pub mtu4: u16,
    pub mtu6: u16,
}

impl Default for StaticRouter {
    fn default() -> Self {
        Self { mtu4: 1500, mtu6: 1500 }
    }
}

impl Router for StaticRouter {
    fn route4(&self, _dst: Ipv4Addr) -> Option<RouteInfo> {
        Some(RouteInfo { mtu: self.mtu4 })
    }

    fn route6(&self, _dst: Ipv6Addr) -> Option<RouteInfo> {
        Some(RouteInfo { mtu: self.mtu6 })
    }
}

/// Collects every frame it is handed. Tests assert on the contents;
/// the daemon uses it until a real forwarder is wired in.
#[derive(Default)]
pub struct RecordingEgress {
    frames: Mutex<Vec<(L3Proto, Vec<u8>)>>,
}

impl RecordingEgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(L3Proto, Vec<u8>)> {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *frames)
    }
}

impl Egress for RecordingEgress {
    fn send(&self, family: L3Proto, frame: Vec<u8>) {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((family, frame));
    }
}
