use std::time::Duration;

use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};

use super::translate::{normalize_plateaus, TranslateConfig};
use crate::error::{Nat64Error, Result};
use crate::rfc6052;
use crate::types::L4Proto;

/// Bits for the field mask of a GLOBAL set request. Only the named
/// fields of the payload are applied; the rest of the snapshot is
/// carried over unchanged.
pub mod field {
    pub const ENABLED: u32 = 1 << 0;
    pub const POOL6: u32 = 1 << 1;
    pub const ADF: u32 = 1 << 2;
    pub const DROP_ICMP6_INFO: u32 = 1 << 3;
    pub const BIB4_MISS_ACTION: u32 = 1 << 4;
    pub const F_ARGS: u32 = 1 << 5;
    pub const MAX_STORED_PKTS: u32 = 1 << 6;
    pub const TIMEOUT_UDP: u32 = 1 << 7;
    pub const TIMEOUT_ICMP: u32 = 1 << 8;
    pub const TIMEOUT_TCP_EST: u32 = 1 << 9;
    pub const TIMEOUT_TCP_TRANS: u32 = 1 << 10;
    pub const TIMEOUT_TCP_V4_SYN: u32 = 1 << 11;
    pub const RESET_TCLASS: u32 = 1 << 12;
    pub const RESET_TOS: u32 = 1 << 13;
    pub const NEW_TOS: u32 = 1 << 14;
    pub const DF_ALWAYS_ON: u32 = 1 << 15;
    pub const BUILD_IPV4_ID: u32 = 1 << 16;
    pub const LOWER_MTU_FAIL: u32 = 1 << 17;
    pub const MIN_IPV6_MTU: u32 = 1 << 18;
    pub const MTU_PLATEAUS: u32 = 1 << 19;
}

/// Tuple fields hashed to pick the first pool4 candidate (`f_args`).
pub mod f_args {
    pub const SRC_ADDR: u8 = 1 << 3;
    pub const SRC_PORT: u8 = 1 << 2;
    pub const DST_ADDR: u8 = 1 << 1;
    pub const DST_PORT: u8 = 1 << 0;
    pub const PROTO: u8 = 1 << 4;

    /// Source address, destination address, destination port.
    pub const DEFAULT: u8 = SRC_ADDR | DST_ADDR | DST_PORT;
}

/// What to do with an inbound IPv4 packet whose destination has no BIB
/// entry. The original implementation never settled this; it is a
/// switch here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bib4MissAction {
    /// Hand the packet back to the network stack untranslated.
    Accept,
    /// Discard it.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteringConfig {
    /// RFC 6146 section 3.5.1.2: only let an external peer in when some
    /// session already talks to that peer's address.
    pub address_dependent_filtering: bool,
    /// Policy-drop ICMPv6 informational messages (ping6).
    pub drop_icmp6_info: bool,
    pub bib4_miss_action: Bib4MissAction,
    /// See [`f_args`].
    pub f_args: u8,
    /// Capacity of the v4-SYN retention queue.
    pub max_stored_pkts: usize,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            address_dependent_filtering: false,
            drop_icmp6_info: false,
            bib4_miss_action: Bib4MissAction::Accept,
            f_args: f_args::DEFAULT,
            max_stored_pkts: 10,
        }
    }
}

/// Session expiration classes. UDP and ICMP only ever use `Est`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    Est,
    Trans,
}

/// Session lifetimes, in seconds. Defaults follow RFC 6146 section 4.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub udp_secs: u64,
    pub icmp_secs: u64,
    pub tcp_est_secs: u64,
    pub tcp_trans_secs: u64,
    /// Retention of an unmatched v4-side SYN.
    pub tcp_v4_syn_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            udp_secs: 300,
            icmp_secs: 60,
            tcp_est_secs: 7200,
            tcp_trans_secs: 240,
            tcp_v4_syn_secs: 6,
        }
    }
}

impl Timeouts {
    pub fn session(&self, proto: L4Proto, timer: TimerType) -> Duration {
        let secs = match (proto, timer) {
            (L4Proto::Tcp, TimerType::Est) => self.tcp_est_secs,
            (L4Proto::Tcp, TimerType::Trans) => self.tcp_trans_secs,
            (L4Proto::Udp, _) => self.udp_secs,
            (L4Proto::Icmp, _) => self.icmp_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn tcp_v4_syn(&self) -> Duration {
        Duration::from_secs(self.tcp_v4_syn_secs)
    }
}

/// One instance's whole runtime configuration. Readers get it through
/// an `ArcSwap` load; writers build a new value and publish it whole,
/// so a reader never sees a half-updated snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub enabled: bool,
    pub pool6: Option<Ipv6Net>,
    pub filtering: FilteringConfig,
    pub timeouts: Timeouts,
    pub translate: TranslateConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool6: None,
            filtering: FilteringConfig::default(),
            timeouts: Timeouts::default(),
            translate: TranslateConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Returns a new snapshot with the masked fields taken from
    /// `values`. Validation happens here, before anything is published.
    pub fn apply(&self, mask: u32, values: &GlobalConfig) -> Result<GlobalConfig> {
        let mut next = self.clone();

        if mask & field::ENABLED != 0 {
            next.enabled = values.enabled;
        }
        if mask & field::POOL6 != 0 {
            if let Some(prefix) = &values.pool6 {
                if !rfc6052::is_valid_prefix(prefix) {
                    return Err(Nat64Error::Config(format!(
                        "{prefix} is not a valid RFC 6052 prefix length"
                    )));
                }
            }
            next.pool6 = values.pool6;
        }
        if mask & field::ADF != 0 {
            next.filtering.address_dependent_filtering =
                values.filtering.address_dependent_filtering;
        }
        if mask & field::DROP_ICMP6_INFO != 0 {
            next.filtering.drop_icmp6_info = values.filtering.drop_icmp6_info;
        }
        if mask & field::BIB4_MISS_ACTION != 0 {
            next.filtering.bib4_miss_action = values.filtering.bib4_miss_action;
        }
        if mask & field::F_ARGS != 0 {
            next.filtering.f_args = values.filtering.f_args;
        }
        if mask & field::MAX_STORED_PKTS != 0 {
            next.filtering.max_stored_pkts = values.filtering.max_stored_pkts;
        }
        if mask & field::TIMEOUT_UDP != 0 {
            next.timeouts.udp_secs = values.timeouts.udp_secs;
        }
        if mask & field::TIMEOUT_ICMP != 0 {
            next.timeouts.icmp_secs = values.timeouts.icmp_secs;
        }
        if mask & field::TIMEOUT_TCP_EST != 0 {
            next.timeouts.tcp_est_secs = values.timeouts.tcp_est_secs;
        }
        if mask & field::TIMEOUT_TCP_TRANS != 0 {
            next.timeouts.tcp_trans_secs = values.timeouts.tcp_trans_secs;
        }
        if mask & field::TIMEOUT_TCP_V4_SYN != 0 {
            next.timeouts.tcp_v4_syn_secs = values.timeouts.tcp_v4_syn_secs;
        }
        if mask & field::RESET_TCLASS != 0 {
            next.translate.reset_traffic_class = values.translate.reset_traffic_class;
        }
        if mask & field::RESET_TOS != 0 {
            next.translate.reset_tos = values.translate.reset_tos;
        }
        if mask & field::NEW_TOS != 0 {
            next.translate.new_tos = values.translate.new_tos;
        }
        if mask & field::DF_ALWAYS_ON != 0 {
            next.translate.df_always_on = values.translate.df_always_on;
        }
        if mask & field::BUILD_IPV4_ID != 0 {
            next.translate.build_ipv4_id = values.translate.build_ipv4_id;
        }
        if mask & field::LOWER_MTU_FAIL != 0 {
            next.translate.lower_mtu_fail = values.translate.lower_mtu_fail;
        }
        if mask & field::MIN_IPV6_MTU != 0 {
            if values.translate.min_ipv6_mtu < 1280 {
                return Err(Nat64Error::Config(
                    "min-ipv6-mtu must be at least 1280".into(),
                ));
            }
            next.translate.min_ipv6_mtu = values.translate.min_ipv6_mtu;
        }
        if mask & field::MTU_PLATEAUS != 0 {
            next.translate.mtu_plateaus =
                normalize_plateaus(values.translate.mtu_plateaus.clone())?;
        }

        Ok(next)
    }
}
