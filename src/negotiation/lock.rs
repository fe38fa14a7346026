//! Cross-party negotiation lock
//!
//! Mutual exclusion between exactly two parties over an unreliable,
//! reorderable in-band channel. Acquisition is an explicit poll/timeout
//! state machine: send a "lock", wait for the typed response, retry after
//! the poll interval on a negative answer, give up at the absolute
//! deadline. Lock messages are safe to retry; release is idempotent and
//! best-effort.
//!
//! The very first offer/answer cycle of a session is exempt from locking
//! (there is nothing to race against yet); `mark_first_done` flips the
//! one-shot flag once that cycle completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::error::{CallError, Result};
use crate::rtcmsg::RtcMessage;

/// Lock ownership as seen by this party
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    /// We hold the lock and may negotiate
    HeldBySelf,
    /// The remote party holds the lock; grant nothing until unlock
    HeldByPeer,
    /// A lock request is in flight, awaiting the response
    WaitingResponse,
}

pub struct NegotiationLock {
    state: SyncMutex<LockState>,
    first_done: AtomicBool,
    outbound: mpsc::Sender<RtcMessage>,
    response_tx: mpsc::Sender<bool>,
    responses: Mutex<mpsc::Receiver<bool>>,
    poll_interval: Duration,
    timeout: Duration,
}

impl NegotiationLock {
    pub fn new(
        outbound: mpsc::Sender<RtcMessage>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        let (response_tx, responses) = mpsc::channel(8);
        Self {
            state: SyncMutex::new(LockState::Free),
            first_done: AtomicBool::new(false),
            outbound,
            response_tx,
            responses: Mutex::new(responses),
            poll_interval,
            timeout,
        }
    }

    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    /// Whether the first (lock-exempt) negotiation has completed
    pub fn first_negotiation_done(&self) -> bool {
        self.first_done.load(Ordering::SeqCst)
    }

    pub fn mark_first_done(&self) {
        self.first_done.store(true, Ordering::SeqCst);
    }

    /// Acquire the lock, retrying on negative responses until the absolute
    /// deadline. Timeout, transport closure and session close are hard
    /// failures: the caller must abandon the attempted offer.
    pub async fn acquire(&self, mut close_rx: watch::Receiver<bool>) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut responses = self.responses.lock().await;
        // Responses to an earlier, abandoned attempt must not leak into
        // this one.
        while responses.try_recv().is_ok() {}

        loop {
            {
                let mut state = self.state.lock();
                match *state {
                    LockState::HeldBySelf => return Ok(()),
                    _ => *state = LockState::WaitingResponse,
                }
            }
            // The send itself must respect the deadline and the close
            // signal: a stalled in-band writer cannot block acquisition.
            tokio::select! {
                sent = self.outbound.send(RtcMessage::Lock) => {
                    if sent.is_err() {
                        *self.state.lock() = LockState::Free;
                        return Err(CallError::LockFailed("in-band channel closed".to_string()));
                    }
                }
                _ = tokio::time::sleep(deadline.saturating_duration_since(Instant::now())) => {
                    *self.state.lock() = LockState::Free;
                    return Err(CallError::LockFailed(format!(
                        "no grant within {:?}",
                        self.timeout
                    )));
                }
                _ = close_rx.changed() => {
                    if *close_rx.borrow() {
                        *self.state.lock() = LockState::Free;
                        return Err(CallError::Closed);
                    }
                    continue;
                }
            }

            let wait = self
                .poll_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            let granted = tokio::select! {
                response = responses.recv() => match response {
                    Some(granted) => Some(granted),
                    None => {
                        *self.state.lock() = LockState::Free;
                        return Err(CallError::LockFailed("response channel closed".to_string()));
                    }
                },
                _ = tokio::time::sleep(wait) => None,
                _ = close_rx.changed() => {
                    if *close_rx.borrow() {
                        *self.state.lock() = LockState::Free;
                        return Err(CallError::Closed);
                    }
                    None
                }
            };

            match granted {
                Some(true) => {
                    *self.state.lock() = LockState::HeldBySelf;
                    return Ok(());
                }
                Some(false) => {
                    // Denied: back off for one poll interval so the peer's
                    // own attempt can make progress, then retry.
                    *self.state.lock() = LockState::Free;
                    debug!("Negotiation lock denied, retrying");
                    tokio::time::sleep(self.poll_interval).await;
                }
                None => debug!("Negotiation lock response pending, re-sending"),
            }

            if Instant::now() >= deadline {
                *self.state.lock() = LockState::Free;
                return Err(CallError::LockFailed(format!(
                    "no grant within {:?}",
                    self.timeout
                )));
            }
        }
    }

    /// Idempotent best-effort release after a lock-protected negotiation
    pub async fn release(&self) {
        {
            let mut state = self.state.lock();
            if *state != LockState::HeldBySelf {
                debug!("Release without held lock (state {:?})", *state);
            }
            *state = LockState::Free;
        }
        if self.outbound.send(RtcMessage::Unlock).await.is_err() {
            warn!("Failed to send unlock, channel closed");
        }
    }

    /// Inbound "lock" request from the peer: grant only while free
    pub fn handle_request(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            LockState::Free => {
                *state = LockState::HeldByPeer;
                true
            }
            _ => false,
        }
    }

    /// Inbound "unlock" from the peer
    pub fn handle_unlock(&self) {
        let mut state = self.state.lock();
        if *state == LockState::HeldByPeer {
            *state = LockState::Free;
        }
    }

    /// Inbound response to our own "lock" request
    pub fn handle_response(&self, granted: bool) {
        if self.response_tx.try_send(granted).is_err() {
            debug!("Dropping redundant lock response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn lock_pair() -> (Arc<NegotiationLock>, mpsc::Receiver<RtcMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let lock = Arc::new(NegotiationLock::new(
            tx,
            Duration::from_millis(20),
            Duration::from_millis(500),
        ));
        (lock, rx)
    }

    #[tokio::test]
    async fn test_acquire_on_grant() {
        let (lock, mut outbound) = lock_pair();
        let (_close_tx, close_rx) = watch::channel(false);

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(close_rx).await })
        };

        assert_eq!(outbound.recv().await.unwrap(), RtcMessage::Lock);
        lock.handle_response(true);
        waiter.await.unwrap().unwrap();
        assert_eq!(lock.state(), LockState::HeldBySelf);

        lock.release().await;
        assert_eq!(lock.state(), LockState::Free);
        // Release emits an unlock on the channel.
        assert_eq!(outbound.recv().await.unwrap(), RtcMessage::Unlock);
    }

    #[tokio::test]
    async fn test_denied_then_granted() {
        let (lock, mut outbound) = lock_pair();
        let (_close_tx, close_rx) = watch::channel(false);

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(close_rx).await })
        };

        assert_eq!(outbound.recv().await.unwrap(), RtcMessage::Lock);
        lock.handle_response(false);
        // The retry goes out after the poll interval.
        assert_eq!(outbound.recv().await.unwrap(), RtcMessage::Lock);
        lock.handle_response(true);
        waiter.await.unwrap().unwrap();
        assert_eq!(lock.state(), LockState::HeldBySelf);
    }

    #[tokio::test]
    async fn test_timeout_is_hard_failure() {
        let (tx, _outbound) = mpsc::channel(32);
        let lock = NegotiationLock::new(tx, Duration::from_millis(10), Duration::from_millis(50));
        let (_close_tx, close_rx) = watch::channel(false);

        match lock.acquire(close_rx).await {
            Err(CallError::LockFailed(_)) => {}
            other => panic!("expected lock failure, got {other:?}"),
        }
        assert_eq!(lock.state(), LockState::Free);
    }

    #[tokio::test]
    async fn test_full_outbound_channel_fails_at_deadline() {
        // The receiver is alive but never drains, so the channel stays full.
        let (tx, _stalled_rx) = mpsc::channel(1);
        tx.try_send(RtcMessage::Ping).unwrap();
        let lock = NegotiationLock::new(tx, Duration::from_millis(10), Duration::from_millis(100));
        let (_close_tx, close_rx) = watch::channel(false);

        let attempt = tokio::time::timeout(Duration::from_secs(2), lock.acquire(close_rx)).await;
        match attempt {
            Ok(Err(CallError::LockFailed(_))) => {}
            other => panic!("expected lock failure at the deadline, got {other:?}"),
        }
        assert_eq!(lock.state(), LockState::Free);
    }

    #[tokio::test]
    async fn test_close_aborts_even_with_stalled_channel() {
        let (tx, _stalled_rx) = mpsc::channel(1);
        tx.try_send(RtcMessage::Ping).unwrap();
        let lock = Arc::new(NegotiationLock::new(
            tx,
            Duration::from_millis(10),
            Duration::from_secs(30),
        ));
        let (close_tx, close_rx) = watch::channel(false);

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(close_rx).await })
        };
        close_tx.send(true).unwrap();
        match waiter.await.unwrap() {
            Err(CallError::Closed) => {}
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_aborts_acquisition() {
        let (lock, _outbound) = lock_pair();
        let (close_tx, close_rx) = watch::channel(false);

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(close_rx).await })
        };
        close_tx.send(true).unwrap();
        match waiter.await.unwrap() {
            Err(CallError::Closed) => {}
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_grant_only_while_free() {
        let (lock, _outbound) = lock_pair();
        assert!(lock.handle_request());
        assert_eq!(lock.state(), LockState::HeldByPeer);
        // Second request while held is denied.
        assert!(!lock.handle_request());
        lock.handle_unlock();
        assert_eq!(lock.state(), LockState::Free);
        assert!(lock.handle_request());
    }

    /// Wire two locks back to back and fire acquisitions from both sides
    /// concurrently: at no point may both parties hold the lock.
    #[tokio::test]
    async fn test_glare_never_double_grants() {
        let (a, mut a_out) = lock_pair();
        let (b, mut b_out) = lock_pair();
        let (_close_tx, close_rx) = watch::channel(false);

        // Message pumps: deliver each side's outbound to the other side.
        {
            let (a, b) = (a.clone(), b.clone());
            tokio::spawn(async move {
                while let Some(msg) = a_out.recv().await {
                    match msg {
                        RtcMessage::Lock => {
                            let granted = b.handle_request();
                            a.handle_response(granted);
                        }
                        RtcMessage::Unlock => b.handle_unlock(),
                        _ => {}
                    }
                }
            });
        }
        {
            let (a, b) = (a.clone(), b.clone());
            tokio::spawn(async move {
                while let Some(msg) = b_out.recv().await {
                    match msg {
                        RtcMessage::Lock => {
                            let granted = a.handle_request();
                            b.handle_response(granted);
                        }
                        RtcMessage::Unlock => a.handle_unlock(),
                        _ => {}
                    }
                }
            });
        }

        let mut grants = 0;
        for _ in 0..5 {
            let fut_a = {
                let (lock, close) = (a.clone(), close_rx.clone());
                tokio::spawn(async move { lock.acquire(close).await })
            };
            let fut_b = {
                let (lock, close) = (b.clone(), close_rx.clone());
                tokio::spawn(async move { lock.acquire(close).await })
            };
            let (res_a, res_b) = (fut_a.await.unwrap(), fut_b.await.unwrap());

            // Never both held at once.
            assert!(
                !(a.state() == LockState::HeldBySelf && b.state() == LockState::HeldBySelf),
                "both parties hold the negotiation lock"
            );

            if res_a.is_ok() {
                grants += 1;
                a.release().await;
            }
            if res_b.is_ok() {
                grants += 1;
                b.release().await;
            }
            // Let the unlock pumps settle before the next round.
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        // Contention may starve individual rounds, but not all of them.
        assert!(grants > 0, "no acquisition ever succeeded");
    }
}
