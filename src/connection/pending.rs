//! Request/response correlation.
//!
//! Each in-flight RPC owns one entry keyed by its `seq`. The entry is
//! inserted before the request is written, so a response can never arrive
//! ahead of its waiter.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::message::Message;
use crate::{HtspError, Result};

type Waiter = oneshot::Sender<Result<Message>>;

/// Correlation table of in-flight requests.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    next_seq: u32,
    waiters: HashMap<u32, Waiter>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a `seq` no other in-flight request holds and register its waiter.
    pub fn register(&self) -> (u32, oneshot::Receiver<Result<Message>>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let seq = loop {
            inner.next_seq = inner.next_seq.wrapping_add(1);
            let candidate = inner.next_seq;
            if candidate != 0 && !inner.waiters.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.waiters.insert(seq, tx);
        trace!(seq, in_flight = inner.waiters.len(), "Registered pending request");
        (seq, rx)
    }

    /// Hand `msg` to the waiter for `seq`.
    ///
    /// Returns the message back when nobody is waiting for it, so the caller
    /// can treat it as a push instead.
    pub fn complete(&self, seq: u32, msg: Message) -> Option<Message> {
        let waiter = self.inner.lock().waiters.remove(&seq);
        match waiter {
            Some(tx) => {
                if tx.send(Ok(msg)).is_err() {
                    debug!(seq, "Response arrived after its caller gave up");
                }
                None
            }
            None => Some(msg),
        }
    }

    /// Drop the entry for `seq` (timeout or failed write).
    pub fn cancel(&self, seq: u32) -> bool {
        self.inner.lock().waiters.remove(&seq).is_some()
    }

    /// Fail every waiter; used when the connection epoch ends.
    pub fn fail_all(&self, reason: &str) -> usize {
        let waiters: Vec<(u32, Waiter)> = self.inner.lock().waiters.drain().collect();
        let count = waiters.len();
        for (seq, tx) in waiters {
            trace!(seq, "Failing pending request");
            let _ = tx.send(Err(HtspError::connection_lost(reason)));
        }
        if count > 0 {
            debug!(count, reason, "Failed pending requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn set_next_seq(&self, seq: u32) {
        self.inner.lock().next_seq = seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn seqs_are_unique_while_in_flight() {
        let pending = PendingRequests::new();
        let mut seen = HashSet::new();
        let mut receivers = Vec::new();
        for _ in 0..1000 {
            let (seq, rx) = pending.register();
            assert!(seen.insert(seq));
            receivers.push(rx);
        }
        assert_eq!(pending.len(), 1000);
    }

    #[test]
    fn wrap_around_skips_zero_and_occupied_seqs() {
        let pending = PendingRequests::new();
        let (first, _rx1) = pending.register();
        assert_eq!(first, 1);

        pending.set_next_seq(u32::MAX - 1);
        let (a, _rx2) = pending.register();
        let (b, _rx3) = pending.register();
        assert_eq!(a, u32::MAX);
        // 0 is never used and 1 is still in flight.
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn response_goes_to_matching_waiter_only() {
        let pending = PendingRequests::new();
        let (seq_a, rx_a) = pending.register();
        let (seq_b, rx_b) = pending.register();

        assert!(pending.complete(seq_b, Message::new().with("tag", "b")).is_none());
        assert!(pending.complete(seq_a, Message::new().with("tag", "a")).is_none());

        assert_eq!(rx_a.await.unwrap().unwrap().get_str("tag"), Some("a"));
        assert_eq!(rx_b.await.unwrap().unwrap().get_str("tag"), Some("b"));
        assert!(pending.is_empty());
    }

    #[test]
    fn second_response_for_same_seq_is_returned_not_delivered() {
        let pending = PendingRequests::new();
        let (seq, _rx) = pending.register();
        assert!(pending.complete(seq, Message::new()).is_none());
        assert!(pending.complete(seq, Message::new()).is_some());
    }

    #[tokio::test]
    async fn fail_all_fails_every_waiter() {
        let pending = PendingRequests::new();
        let receivers: Vec<_> = (0..5).map(|_| pending.register().1).collect();
        assert_eq!(pending.fail_all("socket closed"), 5);
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(HtspError::ConnectionLost { .. })));
        }
        assert!(pending.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_each_get_their_own_response() {
        let pending = Arc::new(PendingRequests::new());
        let mut tasks = Vec::new();
        for i in 0..64u32 {
            let pending = Arc::clone(&pending);
            tasks.push(tokio::spawn(async move {
                let (seq, rx) = pending.register();
                (i, seq, rx)
            }));
        }

        let mut waiting = Vec::new();
        for task in tasks {
            waiting.push(task.await.unwrap());
        }
        // Answer in reverse order, tagging each response with its seq.
        for (_, seq, _) in waiting.iter().rev() {
            let _ = pending.complete(*seq, Message::new().with("echo", *seq));
        }
        for (_, seq, rx) in waiting {
            assert_eq!(rx.await.unwrap().unwrap().get_u32("echo"), Some(seq));
        }
    }
}
