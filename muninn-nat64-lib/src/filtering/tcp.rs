//! The RFC 6146 section 3.5.2 TCP state machine.
//!
//! Both callbacks run while the table lock is held, so they only look
//! at the packet summary and the session state; timers and removal are
//! applied by the table from the returned fate.

use tracing::warn;

use crate::bib::{SessionFate, SessionState};
use crate::types::L3Proto;

/// The fields of a TCP packet the state machine cares about.
#[derive(Debug, Clone, Copy)]
pub struct TcpPktSummary {
    /// Family the packet arrived on.
    pub dir: L3Proto,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Packet-driven transition (the collision callback).
pub fn tcp_state_machine(pkt: &TcpPktSummary, state: &mut SessionState) -> SessionFate {
    match *state {
        SessionState::V4Init => v4_init(pkt, state),
        SessionState::V6Init => v6_init(pkt, state),
        SessionState::Established => established(pkt, state),
        SessionState::V4FinRcv => v4_fin_rcv(pkt, state),
        SessionState::V6FinRcv => v6_fin_rcv(pkt, state),
        SessionState::V4FinV6FinRcv => SessionFate::Preserve,
        SessionState::Trans => trans(pkt, state),
        SessionState::Open | SessionState::Closed => {
            warn!(%state, "invalid TCP session state; evicting");
            SessionFate::Rm
        }
    }
}

/// Timer-driven transition. Established sessions get probed and demoted
/// to transitory; everything else dies.
pub fn tcp_expired_cb(state: &mut SessionState) -> SessionFate {
    match *state {
        SessionState::Established => {
            *state = SessionState::Trans;
            SessionFate::Probe
        }
        SessionState::V4Init
        | SessionState::V6Init
        | SessionState::V4FinRcv
        | SessionState::V6FinRcv
        | SessionState::V4FinV6FinRcv
        | SessionState::Trans => {
            *state = SessionState::Closed;
            SessionFate::Rm
        }
        SessionState::Open | SessionState::Closed => {
            warn!(%state, "invalid TCP session state on expiry; evicting");
            SessionFate::Rm
        }
    }
}

fn v4_init(pkt: &TcpPktSummary, state: &mut SessionState) -> SessionFate {
    if pkt.dir == L3Proto::V6 && pkt.syn {
        *state = SessionState::Established;
        return SessionFate::TimerEst;
    }
    SessionFate::Preserve
}

fn v6_init(pkt: &TcpPktSummary, state: &mut SessionState) -> SessionFate {
    if pkt.syn {
        match pkt.dir {
            L3Proto::V4 => {
                *state = SessionState::Established;
                return SessionFate::TimerEst;
            }
            L3Proto::V6 => return SessionFate::TimerTrans,
        }
    }
    SessionFate::Preserve
}

fn established(pkt: &TcpPktSummary, state: &mut SessionState) -> SessionFate {
    if pkt.fin {
        *state = match pkt.dir {
            L3Proto::V4 => SessionState::V4FinRcv,
            L3Proto::V6 => SessionState::V6FinRcv,
        };
        SessionFate::Preserve
    } else if pkt.rst {
        *state = SessionState::Trans;
        SessionFate::TimerTrans
    } else {
        SessionFate::TimerEst
    }
}

fn v4_fin_rcv(pkt: &TcpPktSummary, state: &mut SessionState) -> SessionFate {
    if pkt.dir == L3Proto::V6 && pkt.fin {
        *state = SessionState::V4FinV6FinRcv;
        return SessionFate::TimerTrans;
    }
    SessionFate::TimerEst
}

fn v6_fin_rcv(pkt: &TcpPktSummary, state: &mut SessionState) -> SessionFate {
    if pkt.dir == L3Proto::V4 && pkt.fin {
        *state = SessionState::V4FinV6FinRcv;
        return SessionFate::TimerTrans;
    }
    SessionFate::TimerEst
}

fn trans(pkt: &TcpPktSummary, state: &mut SessionState) -> SessionFate {
    if !pkt.rst {
        *state = SessionState::Established;
        return SessionFate::TimerEst;
    }
    SessionFate::Preserve
}
