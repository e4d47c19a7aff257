use serde::{Deserialize, Serialize};

use crate::error::{Nat64Error, Result};

/// RFC 1191 section 7.1 plateau table. Used to guess a next-hop MTU when
/// an ICMPv4 "fragmentation needed" arrives with its MTU field zeroed.
pub const DEFAULT_PLATEAUS: [u16; 11] =
    [65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296, 68];

/// Knobs of the header-translation step (RFC 7915 leaves most of these
/// to operator policy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateConfig {
    /// Zero the IPv6 traffic class instead of copying TOS into it.
    pub reset_traffic_class: bool,
    /// Ignore the IPv6 traffic class and write `new_tos` into IPv4 TOS.
    pub reset_tos: bool,
    pub new_tos: u8,
    /// Always set DF on translated IPv4 packets.
    pub df_always_on: bool,
    /// Generate IPv4 identification values instead of writing zero.
    pub build_ipv4_id: bool,
    /// Clamp "packet too big" MTUs below 1280 up to 1280.
    pub lower_mtu_fail: bool,
    /// Largest IPv6 packet the v4→v6 direction will emit unfragmented.
    pub min_ipv6_mtu: u16,
    /// Descending, zero-free, deduplicated. [`normalize_plateaus`]
    /// maintains the invariant on every update.
    pub mtu_plateaus: Vec<u16>,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            reset_traffic_class: false,
            reset_tos: false,
            new_tos: 0,
            df_always_on: false,
            build_ipv4_id: true,
            lower_mtu_fail: true,
            min_ipv6_mtu: 1280,
            mtu_plateaus: DEFAULT_PLATEAUS.to_vec(),
        }
    }
}

/// Sorts descending, then strips zeros and duplicates. An empty or
/// all-zero list is a configuration error.
pub fn normalize_plateaus(mut plateaus: Vec<u16>) -> Result<Vec<u16>> {
    if plateaus.is_empty() {
        return Err(Nat64Error::Config("the MTU plateau list is empty".into()));
    }
    plateaus.sort_unstable_by(|a, b| b.cmp(a));
    plateaus.dedup();
    plateaus.retain(|&p| p != 0);
    if plateaus.is_empty() {
        return Err(Nat64Error::Config(
            "the MTU plateau list contains nothing but zeroes".into(),
        ));
    }
    Ok(plateaus)
}

/// Largest plateau strictly below `total_len`, or the smallest plateau
/// when even that does not fit.
pub fn next_lower_plateau(plateaus: &[u16], total_len: u16) -> u16 {
    plateaus
        .iter()
        .copied()
        .find(|&p| p < total_len)
        .unwrap_or_else(|| plateaus.last().copied().unwrap_or(68))
}
