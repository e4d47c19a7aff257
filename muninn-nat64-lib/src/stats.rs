use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Every event the translator counts. One counter per variant, per
/// instance. Exposure (scraping, formatting) is someone else's problem;
/// the packet path only ever increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum StatId {
    Received6,
    Received4,
    Success,

    BibEntries,
    Sessions,

    Enomem,

    InstanceDisabled,
    Pool6Unset,

    TruncatedPacket,
    Hdr6,
    Hdr4,

    UnknownL4Proto,
    UnknownIcmp6Type,
    UnknownIcmp4Type,
    DoubleIcmp6Error,
    DoubleIcmp4Error,
    UnknownProtoInner,
    FragmentedPing,

    HairpinLoop,
    Pool6Mismatch,
    Pool4Mismatch,
    Icmp6Filter,
    UntranslatableDst6,
    UntranslatableDst4,
    MaskDomainNotFound,
    Bib6NotFound,
    Bib4NotFound,
    SessionNotFound,
    AdfRejected,
    V4Syn,
    Syn6Expected,
    Syn4Expected,

    PktQueueStored,
    PktQueueExists,
    PktQueueFull,

    Src64,
    Dst64,
    IcmpCsum64,
    UntranslatableDestUnreach64,
    UntranslatableParamProb64,
    UntranslatableParamProbPtr64,
    Ttl64,
    FragThenExt64,
    SegmentsLeft64,

    Src46,
    Dst46,
    IcmpCsum46,
    UntranslatableDestUnreach46,
    UntranslatableParamProb46,
    UntranslatableParamProbPtr46,
    Ttl46,
    SourceRoute46,
    FragmentedZeroCsum46,

    FailedRoutes,
    PktTooBig,

    Icmp6ErrSuccess,
    Icmp6ErrFailure,
    Icmp4ErrSuccess,
    Icmp4ErrFailure,

    Unknown,
}

impl StatId {
    pub const COUNT: usize = StatId::Unknown as usize + 1;

    pub fn name(&self) -> &'static str {
        match self {
            StatId::Received6 => "received6",
            StatId::Received4 => "received4",
            StatId::Success => "success",
            StatId::BibEntries => "bib-entries",
            StatId::Sessions => "sessions",
            StatId::Enomem => "enomem",
            StatId::InstanceDisabled => "instance-disabled",
            StatId::Pool6Unset => "pool6-unset",
            StatId::TruncatedPacket => "truncated-packet",
            StatId::Hdr6 => "hdr6",
            StatId::Hdr4 => "hdr4",
            StatId::UnknownL4Proto => "unknown-l4-proto",
            StatId::UnknownIcmp6Type => "unknown-icmp6-type",
            StatId::UnknownIcmp4Type => "unknown-icmp4-type",
            StatId::DoubleIcmp6Error => "double-icmp6-error",
            StatId::DoubleIcmp4Error => "double-icmp4-error",
            StatId::UnknownProtoInner => "unknown-proto-inner",
            StatId::FragmentedPing => "fragmented-ping",
            StatId::HairpinLoop => "hairpin-loop",
            StatId::Pool6Mismatch => "pool6-mismatch",
            StatId::Pool4Mismatch => "pool4-mismatch",
            StatId::Icmp6Filter => "icmp6-filter",
            StatId::UntranslatableDst6 => "untranslatable-dst6",
            StatId::UntranslatableDst4 => "untranslatable-dst4",
            StatId::MaskDomainNotFound => "mask-domain-not-found",
            StatId::Bib6NotFound => "bib6-not-found",
            StatId::Bib4NotFound => "bib4-not-found",
            StatId::SessionNotFound => "session-not-found",
            StatId::AdfRejected => "adf-rejected",
            StatId::V4Syn => "v4-syn",
            StatId::Syn6Expected => "syn6-expected",
            StatId::Syn4Expected => "syn4-expected",
            StatId::PktQueueStored => "pktqueue-stored",
            StatId::PktQueueExists => "pktqueue-exists",
            StatId::PktQueueFull => "pktqueue-full",
            StatId::Src64 => "6to4-src",
            StatId::Dst64 => "6to4-dst",
            StatId::IcmpCsum64 => "6to4-icmp-csum",
            StatId::UntranslatableDestUnreach64 => "6to4-untranslatable-dest-unreach",
            StatId::UntranslatableParamProb64 => "6to4-untranslatable-param-prob",
            StatId::UntranslatableParamProbPtr64 => "6to4-untranslatable-param-prob-ptr",
            StatId::Ttl64 => "6to4-ttl",
            StatId::FragThenExt64 => "6to4-frag-then-ext",
            StatId::SegmentsLeft64 => "6to4-segments-left",
            StatId::Src46 => "4to6-src",
            StatId::Dst46 => "4to6-dst",
            StatId::IcmpCsum46 => "4to6-icmp-csum",
            StatId::UntranslatableDestUnreach46 => "4to6-untranslatable-dest-unreach",
            StatId::UntranslatableParamProb46 => "4to6-untranslatable-param-prob",
            StatId::UntranslatableParamProbPtr46 => "4to6-untranslatable-param-prob-ptr",
            StatId::Ttl46 => "4to6-ttl",
            StatId::SourceRoute46 => "4to6-source-route",
            StatId::FragmentedZeroCsum46 => "4to6-fragmented-zero-csum",
            StatId::FailedRoutes => "failed-routes",
            StatId::PktTooBig => "pkt-too-big",
            StatId::Icmp6ErrSuccess => "icmp6err-success",
            StatId::Icmp6ErrFailure => "icmp6err-failure",
            StatId::Icmp4ErrSuccess => "icmp4err-success",
            StatId::Icmp4ErrFailure => "icmp4err-failure",
            StatId::Unknown => "unknown",
        }
    }
}

/// Per-instance counter block. Plain relaxed atomics; the numbers are
/// diagnostic, not synchronization.
pub struct Stats {
    counters: [AtomicU64; StatId::COUNT],
}

impl Stats {
    pub fn new() -> Self {
        Self { counters: std::array::from_fn(|_| AtomicU64::new(0)) }
    }

    #[inline]
    pub fn inc(&self, id: StatId) {
        self.counters[id as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Used by the BIB/session gauges when entries go away.
    #[inline]
    pub fn dec(&self, id: StatId) {
        self.counters[id as usize].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self, id: StatId) -> u64 {
        self.counters[id as usize].load(Ordering::Relaxed)
    }

    /// Snapshot of the nonzero counters, in declaration order.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        (0..StatId::COUNT)
            .filter_map(|i| {
                let value = self.counters[i].load(Ordering::Relaxed);
                // The discriminants are dense, so this transmute-free
                // lookup is just a reverse walk of the declaration.
                (value != 0).then(|| (Self::id_at(i).name(), value))
            })
            .collect()
    }

    fn id_at(index: usize) -> StatId {
        use StatId::*;
        const ALL: [StatId; StatId::COUNT] = [
            Received6, Received4, Success, BibEntries, Sessions, Enomem, InstanceDisabled,
            Pool6Unset, TruncatedPacket, Hdr6, Hdr4, UnknownL4Proto, UnknownIcmp6Type,
            UnknownIcmp4Type, DoubleIcmp6Error, DoubleIcmp4Error, UnknownProtoInner,
            FragmentedPing, HairpinLoop, Pool6Mismatch, Pool4Mismatch, Icmp6Filter,
            UntranslatableDst6, UntranslatableDst4, MaskDomainNotFound, Bib6NotFound,
            Bib4NotFound, SessionNotFound, AdfRejected, V4Syn, Syn6Expected, Syn4Expected,
            PktQueueStored, PktQueueExists, PktQueueFull, Src64, Dst64, IcmpCsum64,
            UntranslatableDestUnreach64, UntranslatableParamProb64, UntranslatableParamProbPtr64,
            Ttl64, FragThenExt64, SegmentsLeft64, Src46, Dst46, IcmpCsum46,
            UntranslatableDestUnreach46, UntranslatableParamProb46, UntranslatableParamProbPtr46,
            Ttl46, SourceRoute46, FragmentedZeroCsum46, FailedRoutes, PktTooBig,
            Icmp6ErrSuccess, Icmp6ErrFailure, Icmp4ErrSuccess, Icmp4ErrFailure, Unknown,
        ];
        ALL[index]
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_count() {
        let stats = Stats::new();
        assert_eq!(stats.get(StatId::Success), 0);
        stats.inc(StatId::Success);
        stats.inc(StatId::Success);
        assert_eq!(stats.get(StatId::Success), 2);
    }

    #[test]
    fn snapshot_only_reports_touched_counters() {
        let stats = Stats::new();
        stats.inc(StatId::HairpinLoop);
        let snap = stats.snapshot();
        assert_eq!(snap, vec![("hairpin-loop", 1)]);
    }

    #[test]
    fn id_at_round_trips_every_discriminant() {
        for i in 0..StatId::COUNT {
            assert_eq!(Stats::id_at(i) as usize, i);
        }
    }
}
