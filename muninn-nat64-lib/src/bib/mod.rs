//! The Binding Information Base and its session table.
//!
//! Three independent tables (TCP, UDP, ICMP), each holding BIB entries
//! indexed by both transport addresses plus the sessions that reference
//! them. All mutation happens under a per-table mutex; TCP collision
//! callbacks run inside that critical section and must not call back
//! into the table.

mod expirer;
mod session;

pub use session::{BibEntry, Session, SessionFate, SessionState};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use ahash::AHashMap;
use ipnet::Ipv4Net;
use tracing::debug;

use crate::config::{TimerType, Timeouts};
use crate::error::{Nat64Error, Result};
use crate::pool4::MaskDomain;
use crate::stats::{StatId, Stats};
use crate::types::{L4Proto, PortRange, TransportAddr4, TransportAddr6, Tuple4, Tuple6};
use expirer::ExpireQueue;

/// Success shape shared by every insertion path. An idempotent
/// retransmit reports `Existed`; both variants carry the live session.
#[derive(Debug, Clone)]
pub enum AddOutcome {
    Created(Session),
    Existed(Session),
}

impl AddOutcome {
    pub fn session(&self) -> &Session {
        match self {
            AddOutcome::Created(s) | AddOutcome::Existed(s) => s,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, AddOutcome::Created(_))
    }
}

/// Failures of the simple (UDP/ICMP) inbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Add4Error {
    /// No BIB entry claims the destination.
    NoBib,
    /// Address-dependent filtering rejected the peer.
    Filtered,
}

/// Failures of the v6 TCP path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpAdd6Error {
    /// Only a SYN may create TCP state.
    SynExpected,
    /// The mask domain ran out of free candidates.
    Exhausted,
}

/// Failures of the v4 TCP path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpAdd4Error {
    NoBib,
    Filtered,
    SynExpected,
}

/// Decides the fate of a colliding or expiring session. Runs under the
/// table lock.
pub type FateCb<'a> = &'a mut dyn FnMut(&mut SessionState) -> SessionFate;

struct BibRec {
    v6: TransportAddr6,
    v4: TransportAddr4,
    is_static: bool,
    sessions: Vec<u64>,
}

struct SessionRec {
    src6: TransportAddr6,
    dst6: TransportAddr6,
    local4: TransportAddr4,
    dst4: TransportAddr4,
    bib: u64,
    state: SessionState,
    timer: TimerType,
    update_time: Instant,
    epoch: u64,
}

#[derive(Default)]
struct TableInner {
    bib_by6: AHashMap<TransportAddr6, u64>,
    bib_by4: AHashMap<TransportAddr4, u64>,
    bibs: AHashMap<u64, BibRec>,
    sessions: AHashMap<u64, SessionRec>,
    sess_by6: AHashMap<(TransportAddr6, TransportAddr6), u64>,
    sess_by4: AHashMap<(TransportAddr4, TransportAddr4), u64>,
    est: ExpireQueue,
    trans: ExpireQueue,
    next_id: u64,
    next_epoch: u64,
}

struct BibTable {
    proto: L4Proto,
    inner: Mutex<TableInner>,
}

/// Probe requests gathered during a clean pass. Emission happens after
/// the table lock is dropped.
#[derive(Debug, Default)]
pub struct CleanReport {
    pub probes: Vec<Session>,
    pub removed: u64,
}

pub struct Bib {
    stats: Arc<Stats>,
    tcp: BibTable,
    udp: BibTable,
    icmp: BibTable,
}

impl Bib {
    pub fn new(stats: Arc<Stats>) -> Self {
        let table = |proto| BibTable { proto, inner: Mutex::new(TableInner::default()) };
        Self {
            stats,
            tcp: table(L4Proto::Tcp),
            udp: table(L4Proto::Udp),
            icmp: table(L4Proto::Icmp),
        }
    }

    fn table(&self, proto: L4Proto) -> &BibTable {
        match proto {
            L4Proto::Tcp => &self.tcp,
            L4Proto::Udp => &self.udp,
            L4Proto::Icmp => &self.icmp,
        }
    }

    /// Outbound simple path (UDP/ICMP): make sure a BIB entry and a
    /// session exist for `tuple`, allocating from `masks` when the BIB
    /// entry is new.
    pub fn add6(
        &self,
        masks: MaskDomain,
        tuple: &Tuple6,
        dst4: TransportAddr4,
        timeouts: &Timeouts,
    ) -> std::result::Result<AddOutcome, TcpAdd6Error> {
        let table = self.table(tuple.proto);
        let mut inner = lock(table);
        let now = Instant::now();

        if let Some(&sid) = inner.sess_by6.get(&(tuple.src, tuple.dst)) {
            refresh(&mut inner, sid, TimerType::Est, now, tuple.proto, timeouts);
            return Ok(AddOutcome::Existed(snapshot(&inner, sid, tuple.proto, now, timeouts)));
        }

        let bid = match inner.bib_by6.get(&tuple.src) {
            Some(&bid) => bid,
            None => {
                let v4 = self.allocate(&mut inner, masks).ok_or(TcpAdd6Error::Exhausted)?;
                self.create_bib(&mut inner, tuple.src, v4, false)
            }
        };

        let sid = self.create_session(
            &mut inner,
            bid,
            tuple.src,
            tuple.dst,
            dst4,
            SessionState::Open,
            TimerType::Est,
            now,
            tuple.proto,
            timeouts,
        );
        Ok(AddOutcome::Created(snapshot(&inner, sid, tuple.proto, now, timeouts)))
    }

    /// Inbound simple path (UDP/ICMP).
    pub fn add4(
        &self,
        dst6: TransportAddr6,
        tuple: &Tuple4,
        adf: bool,
        timeouts: &Timeouts,
    ) -> std::result::Result<AddOutcome, Add4Error> {
        let table = self.table(tuple.proto);
        let mut inner = lock(table);
        let now = Instant::now();

        if let Some(&sid) = inner.sess_by4.get(&(tuple.dst, tuple.src)) {
            refresh(&mut inner, sid, TimerType::Est, now, tuple.proto, timeouts);
            return Ok(AddOutcome::Existed(snapshot(&inner, sid, tuple.proto, now, timeouts)));
        }

        let &bid = inner.bib_by4.get(&tuple.dst).ok_or(Add4Error::NoBib)?;
        if adf && !knows_peer(&inner, bid, tuple.src) {
            return Err(Add4Error::Filtered);
        }

        let bib_v6 = inner.bibs[&bid].v6;
        let sid = self.create_session(
            &mut inner,
            bid,
            bib_v6,
            dst6,
            tuple.src,
            SessionState::Open,
            TimerType::Est,
            now,
            tuple.proto,
            timeouts,
        );
        Ok(AddOutcome::Created(snapshot(&inner, sid, tuple.proto, now, timeouts)))
    }

    /// Outbound TCP path. Collisions are arbitrated by `cb`, which runs
    /// under the table lock.
    pub fn add_tcp6(
        &self,
        masks: MaskDomain,
        tuple: &Tuple6,
        dst4: TransportAddr4,
        syn: bool,
        timeouts: &Timeouts,
        cb: FateCb<'_>,
    ) -> std::result::Result<AddOutcome, TcpAdd6Error> {
        let table = self.table(L4Proto::Tcp);
        let mut inner = lock(table);
        let now = Instant::now();

        if let Some(&sid) = inner.sess_by6.get(&(tuple.src, tuple.dst)) {
            let before = snapshot(&inner, sid, L4Proto::Tcp, now, timeouts);
            self.collide(&mut inner, sid, now, timeouts, cb);
            // The callback may have decided the session's death; report
            // the last state the packet saw in that case.
            let session = if inner.sessions.contains_key(&sid) {
                snapshot(&inner, sid, L4Proto::Tcp, now, timeouts)
            } else {
                before
            };
            return Ok(AddOutcome::Existed(session));
        }

        if !syn {
            return Err(TcpAdd6Error::SynExpected);
        }

        let bid = match inner.bib_by6.get(&tuple.src) {
            Some(&bid) => bid,
            None => {
                let v4 = self.allocate(&mut inner, masks).ok_or(TcpAdd6Error::Exhausted)?;
                self.create_bib(&mut inner, tuple.src, v4, false)
            }
        };

        let sid = self.create_session(
            &mut inner,
            bid,
            tuple.src,
            tuple.dst,
            dst4,
            SessionState::V6Init,
            TimerType::Trans,
            now,
            L4Proto::Tcp,
            timeouts,
        );
        Ok(AddOutcome::Created(snapshot(&inner, sid, L4Proto::Tcp, now, timeouts)))
    }

    /// Inbound TCP path. A miss with `syn` set is the retention-queue
    /// case and stays the caller's problem.
    pub fn add_tcp4(
        &self,
        dst6: TransportAddr6,
        tuple: &Tuple4,
        syn: bool,
        adf: bool,
        timeouts: &Timeouts,
        cb: FateCb<'_>,
    ) -> std::result::Result<AddOutcome, TcpAdd4Error> {
        let table = self.table(L4Proto::Tcp);
        let mut inner = lock(table);
        let now = Instant::now();

        if let Some(&sid) = inner.sess_by4.get(&(tuple.dst, tuple.src)) {
            let before = snapshot(&inner, sid, L4Proto::Tcp, now, timeouts);
            self.collide(&mut inner, sid, now, timeouts, cb);
            let session = if inner.sessions.contains_key(&sid) {
                snapshot(&inner, sid, L4Proto::Tcp, now, timeouts)
            } else {
                before
            };
            return Ok(AddOutcome::Existed(session));
        }

        let &bid = inner.bib_by4.get(&tuple.dst).ok_or(TcpAdd4Error::NoBib)?;
        if adf && !knows_peer(&inner, bid, tuple.src) {
            return Err(TcpAdd4Error::Filtered);
        }
        if !syn {
            return Err(TcpAdd4Error::SynExpected);
        }

        let bib_v6 = inner.bibs[&bid].v6;
        let sid = self.create_session(
            &mut inner,
            bid,
            bib_v6,
            dst6,
            tuple.src,
            SessionState::V4Init,
            TimerType::Trans,
            now,
            L4Proto::Tcp,
            timeouts,
        );
        Ok(AddOutcome::Created(snapshot(&inner, sid, L4Proto::Tcp, now, timeouts)))
    }

    pub fn find6(&self, proto: L4Proto, v6: TransportAddr6) -> Option<BibEntry> {
        let inner = lock(self.table(proto));
        let &bid = inner.bib_by6.get(&v6)?;
        Some(bib_snapshot(&inner.bibs[&bid], proto))
    }

    pub fn find4(&self, proto: L4Proto, v4: TransportAddr4) -> Option<BibEntry> {
        let inner = lock(self.table(proto));
        let &bid = inner.bib_by4.get(&v4)?;
        Some(bib_snapshot(&inner.bibs[&bid], proto))
    }

    /// Administrator-installed mapping, exempt from eviction.
    pub fn add_static(
        &self,
        proto: L4Proto,
        v6: TransportAddr6,
        v4: TransportAddr4,
    ) -> Result<()> {
        let table = self.table(proto);
        let mut inner = lock(table);
        if inner.bib_by6.contains_key(&v6) || inner.bib_by4.contains_key(&v4) {
            return Err(Nat64Error::Exists(format!("BIB entry for {v6} or {v4}")));
        }
        self.create_bib(&mut inner, v6, v4, true);
        Ok(())
    }

    /// Removes the entry masked as `v4` along with every session under
    /// it, static or not.
    pub fn rm_entry(&self, proto: L4Proto, v4: TransportAddr4) -> Result<()> {
        let table = self.table(proto);
        let mut inner = lock(table);
        let &bid = inner
            .bib_by4
            .get(&v4)
            .ok_or_else(|| Nat64Error::NotFound(format!("BIB entry for {v4}")))?;
        self.remove_bib_tree(&mut inner, bid);
        Ok(())
    }

    /// Evicts every binding whose v4 side fell out of pool4.
    pub fn delete_taddr4s(&self, proto: L4Proto, prefix: Ipv4Net, ports: Option<PortRange>) {
        let table = self.table(proto);
        let mut inner = lock(table);
        let doomed: Vec<u64> = inner
            .bibs
            .iter()
            .filter(|(_, rec)| {
                prefix.contains(&rec.v4.addr)
                    && ports.map_or(true, |range| range.contains(rec.v4.port))
            })
            .map(|(&bid, _)| bid)
            .collect();
        for bid in doomed {
            self.remove_bib_tree(&mut inner, bid);
        }
    }

    pub fn bib_count(&self, proto: L4Proto) -> u64 {
        lock(self.table(proto)).bibs.len() as u64
    }

    pub fn session_count(&self, proto: L4Proto) -> u64 {
        lock(self.table(proto)).sessions.len() as u64
    }

    /// BIB entries ordered by their v4 key, for paged listing.
    pub fn foreach_bib(
        &self,
        proto: L4Proto,
        offset: Option<TransportAddr4>,
        max: usize,
    ) -> Vec<BibEntry> {
        let inner = lock(self.table(proto));
        let mut entries: Vec<BibEntry> =
            inner.bibs.values().map(|rec| bib_snapshot(rec, proto)).collect();
        entries.sort_unstable_by_key(|e| (e.v4.addr, e.v4.port));
        page(entries, max, |e| offset.map_or(false, |o| (e.v4.addr, e.v4.port) <= (o.addr, o.port)))
    }

    /// Sessions ordered by (local v4, remote v4), for paged listing.
    pub fn foreach_session(
        &self,
        proto: L4Proto,
        offset: Option<(TransportAddr4, TransportAddr4)>,
        max: usize,
        timeouts: &Timeouts,
    ) -> Vec<Session> {
        let inner = lock(self.table(proto));
        let now = Instant::now();
        let mut entries: Vec<Session> = inner
            .sessions
            .keys()
            .map(|&sid| snapshot(&inner, sid, proto, now, timeouts))
            .collect();
        entries.sort_unstable_by_key(|s| (s.src4.addr, s.src4.port, s.dst4.addr, s.dst4.port));
        page(entries, max, |s| {
            offset.map_or(false, |(local, remote)| {
                (s.src4.addr, s.src4.port, s.dst4.addr, s.dst4.port)
                    <= (local.addr, local.port, remote.addr, remote.port)
            })
        })
    }

    /// Timer tick. Evicts expired sessions; TCP fates come from
    /// `tcp_cb`, everything else just dies. Probe emission is returned
    /// to the caller so it happens outside the lock.
    pub fn clean(&self, now: Instant, timeouts: &Timeouts, tcp_cb: FateCb<'_>) -> CleanReport {
        let mut report = CleanReport::default();
        self.clean_table(&self.tcp, now, timeouts, tcp_cb, &mut report);
        let mut simple = |state: &mut SessionState| {
            let _ = state;
            SessionFate::Rm
        };
        self.clean_table(&self.udp, now, timeouts, &mut simple, &mut report);
        self.clean_table(&self.icmp, now, timeouts, &mut simple, &mut report);
        report
    }

    pub fn flush(&self) {
        for table in [&self.tcp, &self.udp, &self.icmp] {
            let mut inner = lock(table);
            for _ in 0..inner.sessions.len() {
                self.stats.dec(StatId::Sessions);
            }
            for _ in 0..inner.bibs.len() {
                self.stats.dec(StatId::BibEntries);
            }
            *inner = TableInner::default();
        }
    }

    fn clean_table(
        &self,
        table: &BibTable,
        now: Instant,
        timeouts: &Timeouts,
        cb: FateCb<'_>,
        report: &mut CleanReport,
    ) {
        let proto = table.proto;
        let mut inner = lock(table);
        for timer in [TimerType::Est, TimerType::Trans] {
            loop {
                let marker = match timer {
                    TimerType::Est => inner.est.pop_expired(now),
                    TimerType::Trans => inner.trans.pop_expired(now),
                };
                let Some(marker) = marker else { break };
                let Some(rec) = inner.sessions.get_mut(&marker.sid) else {
                    continue;
                };
                if rec.epoch != marker.epoch {
                    continue; // A later refresh owns this session now.
                }

                match cb(&mut rec.state) {
                    SessionFate::Probe => {
                        refresh(&mut inner, marker.sid, TimerType::Trans, now, proto, timeouts);
                        report.probes.push(snapshot(&inner, marker.sid, proto, now, timeouts));
                    }
                    SessionFate::TimerEst => {
                        refresh(&mut inner, marker.sid, TimerType::Est, now, proto, timeouts);
                    }
                    SessionFate::TimerTrans => {
                        refresh(&mut inner, marker.sid, TimerType::Trans, now, proto, timeouts);
                    }
                    SessionFate::Preserve | SessionFate::Rm => {
                        self.remove_session(&mut inner, marker.sid);
                        report.removed += 1;
                    }
                }
            }
        }
    }

    fn collide(
        &self,
        inner: &mut TableInner,
        sid: u64,
        now: Instant,
        timeouts: &Timeouts,
        cb: FateCb<'_>,
    ) {
        let Some(rec) = inner.sessions.get_mut(&sid) else { return };
        match cb(&mut rec.state) {
            SessionFate::Preserve => {}
            SessionFate::TimerEst | SessionFate::Probe => {
                refresh(inner, sid, TimerType::Est, now, L4Proto::Tcp, timeouts);
            }
            SessionFate::TimerTrans => {
                refresh(inner, sid, TimerType::Trans, now, L4Proto::Tcp, timeouts);
            }
            SessionFate::Rm => {
                self.remove_session(inner, sid);
            }
        }
    }

    fn allocate(&self, inner: &mut TableInner, masks: MaskDomain) -> Option<TransportAddr4> {
        let mut masks = masks;
        masks.find(|candidate| !inner.bib_by4.contains_key(candidate))
    }

    fn create_bib(
        &self,
        inner: &mut TableInner,
        v6: TransportAddr6,
        v4: TransportAddr4,
        is_static: bool,
    ) -> u64 {
        inner.next_id += 1;
        let bid = inner.next_id;
        inner.bib_by6.insert(v6, bid);
        inner.bib_by4.insert(v4, bid);
        inner.bibs.insert(bid, BibRec { v6, v4, is_static, sessions: Vec::new() });
        self.stats.inc(StatId::BibEntries);
        bid
    }

    #[allow(clippy::too_many_arguments)]
    fn create_session(
        &self,
        inner: &mut TableInner,
        bid: u64,
        src6: TransportAddr6,
        mut dst6: TransportAddr6,
        mut dst4: TransportAddr4,
        state: SessionState,
        timer: TimerType,
        now: Instant,
        proto: L4Proto,
        timeouts: &Timeouts,
    ) -> u64 {
        let local4 = inner.bibs[&bid].v4;
        if proto == L4Proto::Icmp {
            // Both sides of an ICMP flow share one identifier per
            // family: the v6 side uses the client's, the v4 side ours.
            dst6.port = src6.port;
            dst4.port = local4.port;
        }

        inner.next_id += 1;
        let sid = inner.next_id;
        inner.sessions.insert(
            sid,
            SessionRec {
                src6,
                dst6,
                local4,
                dst4,
                bib: bid,
                state,
                timer,
                update_time: now,
                epoch: 0,
            },
        );
        inner.sess_by6.insert((src6, dst6), sid);
        inner.sess_by4.insert((local4, dst4), sid);
        if let Some(bib) = inner.bibs.get_mut(&bid) {
            bib.sessions.push(sid);
        }
        self.stats.inc(StatId::Sessions);
        refresh(inner, sid, timer, now, proto, timeouts);
        sid
    }

    fn remove_session(&self, inner: &mut TableInner, sid: u64) {
        let Some(rec) = inner.sessions.remove(&sid) else { return };
        inner.sess_by6.remove(&(rec.src6, rec.dst6));
        inner.sess_by4.remove(&(rec.local4, rec.dst4));
        self.stats.dec(StatId::Sessions);

        let remove_bib = match inner.bibs.get_mut(&rec.bib) {
            Some(bib) => {
                bib.sessions.retain(|&s| s != sid);
                bib.sessions.is_empty() && !bib.is_static
            }
            None => false,
        };
        if remove_bib {
            self.remove_bib(inner, rec.bib);
        }
    }

    fn remove_bib(&self, inner: &mut TableInner, bid: u64) {
        if let Some(rec) = inner.bibs.remove(&bid) {
            inner.bib_by6.remove(&rec.v6);
            inner.bib_by4.remove(&rec.v4);
            self.stats.dec(StatId::BibEntries);
        }
    }

    fn remove_bib_tree(&self, inner: &mut TableInner, bid: u64) {
        let sids = match inner.bibs.get(&bid) {
            Some(rec) => rec.sessions.clone(),
            None => return,
        };
        for sid in sids {
            self.remove_session(inner, sid);
        }
        // Dynamic entries die with their last session; statics (and
        // session-less entries) need the explicit push.
        self.remove_bib(inner, bid);
    }
}

fn lock(table: &BibTable) -> MutexGuard<'_, TableInner> {
    table.inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn knows_peer(inner: &TableInner, bid: u64, peer: TransportAddr4) -> bool {
    inner.bibs[&bid]
        .sessions
        .iter()
        .any(|sid| inner.sessions[sid].dst4.addr == peer.addr)
}

fn refresh(
    inner: &mut TableInner,
    sid: u64,
    timer: TimerType,
    now: Instant,
    proto: L4Proto,
    timeouts: &Timeouts,
) {
    inner.next_epoch += 1;
    let epoch = inner.next_epoch;
    let Some(rec) = inner.sessions.get_mut(&sid) else { return };
    rec.timer = timer;
    rec.update_time = now;
    rec.epoch = epoch;
    let deadline = now + timeouts.session(proto, timer);
    match timer {
        TimerType::Est => inner.est.arm(sid, epoch, deadline),
        TimerType::Trans => inner.trans.arm(sid, epoch, deadline),
    }
}

fn snapshot(
    inner: &TableInner,
    sid: u64,
    proto: L4Proto,
    now: Instant,
    timeouts: &Timeouts,
) -> Session {
    let rec = &inner.sessions[&sid];
    let deadline = rec.update_time + timeouts.session(proto, rec.timer);
    Session {
        src6: rec.src6,
        dst6: rec.dst6,
        src4: rec.local4,
        dst4: rec.dst4,
        proto,
        state: rec.state,
        expires_secs: deadline.saturating_duration_since(now).as_secs(),
    }
}

fn bib_snapshot(rec: &BibRec, proto: L4Proto) -> BibEntry {
    BibEntry { v6: rec.v6, v4: rec.v4, proto, is_static: rec.is_static }
}

fn page<T>(entries: Vec<T>, max: usize, mut skip: impl FnMut(&T) -> bool) -> Vec<T> {
    entries
        .into_iter()
        .filter(|e| !skip(e))
        .take(max)
        .collect()
}

/// Debug aid: a snapshot claiming to be CLOSED means the sentinel
/// leaked into the table.
pub(crate) fn warn_if_closed(session: &Session) {
    if session.state == SessionState::Closed {
        debug!(%session, "closed session observed in the table");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool4::Pool4Db;
    use crate::pool4::Pool4Sample;
    use crate::types::PortRange;

    fn stats() -> Arc<Stats> {
        Arc::new(Stats::new())
    }

    fn timeouts() -> Timeouts {
        Timeouts::default()
    }

    fn taddr6(s: &str, port: u16) -> TransportAddr6 {
        TransportAddr6::new(s.parse().unwrap(), port)
    }

    fn taddr4(s: &str, port: u16) -> TransportAddr4 {
        TransportAddr4::new(s.parse().unwrap(), port)
    }

    fn tuple6(proto: L4Proto) -> Tuple6 {
        Tuple6 {
            src: taddr6("2001:db8::1", 9000),
            dst: taddr6("64:ff9b::cb00:7105", 53),
            proto,
        }
    }

    fn pool() -> Pool4Db {
        let db = Pool4Db::new();
        db.add(Pool4Sample {
            mark: 0,
            proto: L4Proto::Udp,
            prefix: "198.51.100.1/32".parse().unwrap(),
            ports: PortRange::new(40000, 40001),
        });
        db.add(Pool4Sample {
            mark: 0,
            proto: L4Proto::Tcp,
            prefix: "198.51.100.1/32".parse().unwrap(),
            ports: PortRange::new(40000, 40009),
        });
        db
    }

    fn masks(db: &Pool4Db, proto: L4Proto) -> MaskDomain {
        db.find(&tuple6(proto), crate::config::f_args::DEFAULT, 0).unwrap()
    }

    #[test]
    fn add6_creates_then_reports_existing() {
        let bib = Bib::new(stats());
        let db = pool();
        let tuple = tuple6(L4Proto::Udp);
        let dst4 = taddr4("203.0.113.5", 53);

        let first = bib.add6(masks(&db, L4Proto::Udp), &tuple, dst4, &timeouts()).unwrap();
        assert!(first.created());
        let again = bib.add6(masks(&db, L4Proto::Udp), &tuple, dst4, &timeouts()).unwrap();
        assert!(!again.created());
        assert_eq!(first.session().src4, again.session().src4);
        assert_eq!(bib.bib_count(L4Proto::Udp), 1);
        assert_eq!(bib.session_count(L4Proto::Udp), 1);
    }

    #[test]
    fn add4_requires_a_bib_entry() {
        let bib = Bib::new(stats());
        let tuple = Tuple4 {
            src: taddr4("203.0.113.5", 53),
            dst: taddr4("198.51.100.1", 40000),
            proto: L4Proto::Udp,
        };
        let err = bib.add4(taddr6("64:ff9b::cb00:7105", 53), &tuple, false, &timeouts());
        assert!(matches!(err, Err(Add4Error::NoBib)));
    }

    #[test]
    fn adf_rejects_unknown_peers() {
        let bib = Bib::new(stats());
        let db = pool();
        let tuple = tuple6(L4Proto::Udp);
        bib.add6(masks(&db, L4Proto::Udp), &tuple, taddr4("203.0.113.5", 53), &timeouts())
            .unwrap();
        let local4 = bib.find6(L4Proto::Udp, tuple.src).unwrap().v4;

        let stranger = Tuple4 {
            src: taddr4("192.0.2.99", 1234),
            dst: local4,
            proto: L4Proto::Udp,
        };
        let err = bib.add4(taddr6("64:ff9b::c000:263", 1234), &stranger, true, &timeouts());
        assert!(matches!(err, Err(Add4Error::Filtered)));

        // Same peer address, different port: allowed.
        let known = Tuple4 {
            src: taddr4("203.0.113.5", 9999),
            dst: local4,
            proto: L4Proto::Udp,
        };
        assert!(bib.add4(taddr6("64:ff9b::cb00:7105", 9999), &known, true, &timeouts()).is_ok());
    }

    #[test]
    fn dynamic_bib_dies_with_its_last_session() {
        let bib = Bib::new(stats());
        let db = pool();
        let tuple = tuple6(L4Proto::Udp);
        bib.add6(masks(&db, L4Proto::Udp), &tuple, taddr4("203.0.113.5", 53), &timeouts())
            .unwrap();

        let far_future = Instant::now() + std::time::Duration::from_secs(100_000);
        let report = bib.clean(far_future, &timeouts(), &mut |_| SessionFate::Rm);
        assert_eq!(report.removed, 1);
        assert_eq!(bib.bib_count(L4Proto::Udp), 0);
        assert_eq!(bib.session_count(L4Proto::Udp), 0);
    }

    #[test]
    fn static_bib_survives_eviction() {
        let bib = Bib::new(stats());
        bib.add_static(L4Proto::Udp, taddr6("2001:db8::1", 9000), taddr4("198.51.100.1", 40000))
            .unwrap();
        let far_future = Instant::now() + std::time::Duration::from_secs(100_000);
        bib.clean(far_future, &timeouts(), &mut |_| SessionFate::Rm);
        assert_eq!(bib.bib_count(L4Proto::Udp), 1);

        let dup = bib.add_static(
            L4Proto::Udp,
            taddr6("2001:db8::1", 9000),
            taddr4("198.51.100.1", 40001),
        );
        assert!(dup.is_err());
    }

    #[test]
    fn tcp_session_requires_syn() {
        let bib = Bib::new(stats());
        let db = pool();
        let tuple = tuple6(L4Proto::Tcp);
        let mut cb = |_: &mut SessionState| SessionFate::Preserve;
        let err = bib.add_tcp6(
            masks(&db, L4Proto::Tcp),
            &tuple,
            taddr4("203.0.113.5", 53),
            false,
            &timeouts(),
            &mut cb,
        );
        assert!(matches!(err, Err(TcpAdd6Error::SynExpected)));
    }

    #[test]
    fn retransmitted_syn_reuses_the_binding() {
        let bib = Bib::new(stats());
        let db = pool();
        let tuple = tuple6(L4Proto::Tcp);
        let mut cb = |_: &mut SessionState| SessionFate::TimerTrans;

        let first = bib
            .add_tcp6(masks(&db, L4Proto::Tcp), &tuple, taddr4("203.0.113.5", 53), true,
                &timeouts(), &mut cb)
            .unwrap();
        let second = bib
            .add_tcp6(masks(&db, L4Proto::Tcp), &tuple, taddr4("203.0.113.5", 53), true,
                &timeouts(), &mut cb)
            .unwrap();
        assert!(first.created());
        assert!(!second.created());
        assert_eq!(first.session().src4, second.session().src4);
    }

    #[test]
    fn established_sessions_probe_then_die() {
        let bib = Bib::new(stats());
        let db = pool();
        let tuple = tuple6(L4Proto::Tcp);
        let mut syn_cb = |state: &mut SessionState| {
            *state = SessionState::Established;
            SessionFate::TimerEst
        };
        bib.add_tcp6(masks(&db, L4Proto::Tcp), &tuple, taddr4("203.0.113.5", 53), true,
            &timeouts(), &mut syn_cb)
            .unwrap();
        bib.add_tcp6(masks(&db, L4Proto::Tcp), &tuple, taddr4("203.0.113.5", 53), true,
            &timeouts(), &mut syn_cb)
            .unwrap();

        let mut expiry = |state: &mut SessionState| match state {
            SessionState::Established => {
                *state = SessionState::Trans;
                SessionFate::Probe
            }
            _ => SessionFate::Rm,
        };

        let after_est = Instant::now() + timeouts().session(L4Proto::Tcp, TimerType::Est)
            + std::time::Duration::from_secs(1);
        let report = bib.clean(after_est, &timeouts(), &mut expiry);
        assert_eq!(report.probes.len(), 1);
        assert_eq!(report.probes[0].state, SessionState::Trans);
        assert_eq!(bib.session_count(L4Proto::Tcp), 1);

        let after_trans = after_est + timeouts().session(L4Proto::Tcp, TimerType::Trans)
            + std::time::Duration::from_secs(1);
        let report = bib.clean(after_trans, &timeouts(), &mut expiry);
        assert_eq!(report.removed, 1);
        assert_eq!(bib.session_count(L4Proto::Tcp), 0);
    }

    #[test]
    fn refresh_outruns_the_reaper() {
        let bib = Bib::new(stats());
        let db = pool();
        let tuple = tuple6(L4Proto::Udp);
        let dst4 = taddr4("203.0.113.5", 53);
        bib.add6(masks(&db, L4Proto::Udp), &tuple, dst4, &timeouts()).unwrap();
        // Refresh rearms with a fresh epoch; the first marker is stale.
        bib.add6(masks(&db, L4Proto::Udp), &tuple, dst4, &timeouts()).unwrap();

        let just_past_first = Instant::now() + std::time::Duration::from_secs(299);
        let report = bib.clean(just_past_first, &timeouts(), &mut |_| SessionFate::Rm);
        assert_eq!(report.removed, 0);
        assert_eq!(bib.session_count(L4Proto::Udp), 1);

        // Far enough out, both markers expire; the stale one must not
        // count as a second removal.
        let far_future = Instant::now() + std::time::Duration::from_secs(100_000);
        let report = bib.clean(far_future, &timeouts(), &mut |_| SessionFate::Rm);
        assert_eq!(report.removed, 1);
        assert_eq!(bib.session_count(L4Proto::Udp), 0);
    }

    #[test]
    fn icmp_sessions_share_identifiers_per_family() {
        let bib = Bib::new(stats());
        let db = Pool4Db::new();
        db.add(Pool4Sample {
            mark: 0,
            proto: L4Proto::Icmp,
            prefix: "198.51.100.1/32".parse().unwrap(),
            ports: PortRange::new(100, 200),
        });
        let tuple = Tuple6 {
            src: taddr6("2001:db8::1", 77),
            dst: taddr6("64:ff9b::cb00:7105", 77),
            proto: L4Proto::Icmp,
        };
        let masks = db.find(&tuple, crate::config::f_args::DEFAULT, 0).unwrap();
        let out = bib.add6(masks, &tuple, taddr4("203.0.113.5", 77), &timeouts()).unwrap();
        let s = out.session();
        assert_eq!(s.dst6.port, 77, "v6 side keeps the client id");
        assert_eq!(s.dst4.port, s.src4.port, "v4 side uses the allocated id");
    }
}
