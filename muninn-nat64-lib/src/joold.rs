//! Session synchronization feed.
//!
//! Every F&U success advertises its session here, even when nothing
//! about it changed; the peer's applier is idempotent and filtering the
//! no-change cases would need translator context in layers that should
//! not have it. The feed is advisory: a full queue drops the update
//! rather than stall the packet path.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;

use crate::bib::Session;

#[derive(Default)]
pub struct Joold {
    tx: Mutex<Option<mpsc::Sender<Session>>>,
}

impl Joold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the feed, replacing any previous subscriber.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Session> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.lock() = Some(tx);
        rx
    }

    pub fn unsubscribe(&self) {
        *self.lock() = None;
    }

    /// Best effort; back-pressure and a closed receiver both just drop
    /// the update.
    pub fn advertise(&self, session: &Session) {
        let guard = self.lock();
        let Some(tx) = guard.as_ref() else { return };
        if tx.try_send(*session).is_err() {
            trace!(%session, "joold queue full; dropping advisory update");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Session>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bib::SessionState;
    use crate::types::{L4Proto, TransportAddr4, TransportAddr6};

    fn session() -> Session {
        Session {
            src6: TransportAddr6::new("2001:db8::1".parse().unwrap(), 9000),
            dst6: TransportAddr6::new("64:ff9b::cb00:7105".parse().unwrap(), 53),
            src4: TransportAddr4::new("198.51.100.1".parse().unwrap(), 40000),
            dst4: TransportAddr4::new("203.0.113.5".parse().unwrap(), 53),
            proto: L4Proto::Udp,
            state: SessionState::Open,
            expires_secs: 300,
        }
    }

    #[test]
    fn advertise_without_subscriber_is_a_no_op() {
        let joold = Joold::new();
        joold.advertise(&session());
    }

    #[tokio::test]
    async fn subscriber_receives_and_overflow_drops() {
        let joold = Joold::new();
        let mut rx = joold.subscribe(1);

        joold.advertise(&session());
        joold.advertise(&session()); // queue full, dropped

        assert_eq!(rx.recv().await.unwrap().src4.port, 40000);
        assert!(rx.try_recv().is_err());
    }
}
