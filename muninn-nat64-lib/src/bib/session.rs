use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{L4Proto, TransportAddr4, TransportAddr6};

/// Session lifecycle states. TCP walks the RFC 6146 section 3.5.2
/// machine; UDP and ICMP sessions stay in `Open` until they expire.
///
/// `Closed` is a transient sentinel used while tearing a session down.
/// It must never be observable in the table; finding one there is a bug
/// that gets logged and repaired by eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Open,
    V6Init,
    V4Init,
    Established,
    V4FinRcv,
    V6FinRcv,
    V4FinV6FinRcv,
    Trans,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Open => "OPEN",
            SessionState::V6Init => "V6_INIT",
            SessionState::V4Init => "V4_INIT",
            SessionState::Established => "ESTABLISHED",
            SessionState::V4FinRcv => "V4_FIN_RCV",
            SessionState::V6FinRcv => "V6_FIN_RCV",
            SessionState::V4FinV6FinRcv => "V4_FIN_V6_FIN_RCV",
            SessionState::Trans => "TRANS",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// What should happen to a session, decided by the collision callback
/// (packet context) or the expiration callback (timer context) while
/// the table lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFate {
    /// No state or timer change.
    Preserve,
    /// Restart the "established" timeout.
    TimerEst,
    /// Restart the "transitory" timeout.
    TimerTrans,
    /// Keep the session on the transitory timer and probe the v6 end.
    Probe,
    /// Remove the session now.
    Rm,
}

/// Public snapshot of a session entry. `src4` is the translator-owned
/// transport address (the BIB's v4 side); `dst4` is the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub src6: TransportAddr6,
    pub dst6: TransportAddr6,
    pub src4: TransportAddr4,
    pub dst4: TransportAddr4,
    pub proto: L4Proto,
    pub state: SessionState,
    /// Time left until the expirer fires, as of the snapshot.
    pub expires_secs: u64,
}

impl Session {
    pub fn expires_in(&self) -> Duration {
        Duration::from_secs(self.expires_secs)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} | {} - {} ({}, {})",
            self.src6, self.dst6, self.src4, self.dst4, self.proto, self.state
        )
    }
}

/// Public snapshot of a BIB entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BibEntry {
    pub v6: TransportAddr6,
    pub v4: TransportAddr4,
    pub proto: L4Proto,
    pub is_static: bool,
}

impl fmt::Display for BibEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} ({}{})",
            self.v6,
            self.v4,
            self.proto,
            if self.is_static { ", static" } else { "" }
        )
    }
}
