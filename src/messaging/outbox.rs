//! Outbound bus queue with depth-scaled flush backoff
//!
//! Messages are never dropped: a bus that reports "try again" re-arms the
//! flush on a timer whose delay grows with queue depth, capped at one second.

use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Queue depth that earns a warning.
pub const QUEUE_WARN: usize = 200;
/// Queue depth that earns an error.
pub const QUEUE_ERROR: usize = 1_000;
/// Ceiling on the re-arm delay.
pub const MAX_FLUSH_DELAY_MS: u64 = 1_000;

/// Send attempts per message before escalating.
pub const SEND_RETRY_LIMIT: u32 = 5;
/// Connect attempts before giving up on the bus.
pub const CONNECT_RETRY_LIMIT: u32 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus busy, try again")]
    TryAgain,
    #[error("bus connection down")]
    Down,
}

#[derive(Debug)]
struct QueuedMsg {
    wire: Vec<u8>,
    attempts: u32,
}

/// What a flush pass tells the caller to do next.
#[derive(Debug, PartialEq, Eq)]
pub struct FlushOutcome {
    pub sent: usize,
    /// Re-arm the flush after this long; `None` means the queue drained.
    pub retry_after: Option<Duration>,
    /// Messages that exhausted their retry budget this pass.
    pub escalated: usize,
}

#[derive(Default)]
pub struct Outbox {
    queue: VecDeque<QueuedMsg>,
    next_id: u64,
    warned: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_id: 0,
            warned: false,
        }
    }

    /// Hand out the next per-sender envelope id.
    pub fn next_msg_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn push(&mut self, wire: Vec<u8>) {
        self.queue.push_back(QueuedMsg { wire, attempts: 0 });
        let depth = self.queue.len();
        if depth > QUEUE_ERROR {
            error!("Outbound queue at {} messages", depth);
        } else if depth > QUEUE_WARN && !self.warned {
            warn!("Outbound queue backing up: {} messages", depth);
            self.warned = true;
        } else if depth <= QUEUE_WARN {
            self.warned = false;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Delay before the next flush attempt, scaled by backlog.
    fn backoff(&self) -> Duration {
        let ms = ((self.queue.len() as u64) * 10).clamp(10, MAX_FLUSH_DELAY_MS);
        Duration::from_millis(ms)
    }

    /// Drain as much of the queue as the bus will take, in order.
    pub fn flush<F>(&mut self, mut send: F) -> FlushOutcome
    where
        F: FnMut(&[u8]) -> Result<(), BusError>,
    {
        let mut sent = 0;
        let mut escalated = 0;
        while let Some(front) = self.queue.front_mut() {
            match send(&front.wire) {
                Ok(()) => {
                    self.queue.pop_front();
                    sent += 1;
                }
                Err(BusError::TryAgain) => {
                    front.attempts += 1;
                    if front.attempts >= SEND_RETRY_LIMIT {
                        error!(
                            "Message still unsendable after {} attempts; keeping it queued",
                            front.attempts
                        );
                        escalated += 1;
                    }
                    return FlushOutcome {
                        sent,
                        retry_after: Some(self.backoff()),
                        escalated,
                    };
                }
                Err(BusError::Down) => {
                    // Ordering must survive a reconnect; leave everything.
                    return FlushOutcome {
                        sent,
                        retry_after: Some(Duration::from_millis(MAX_FLUSH_DELAY_MS)),
                        escalated,
                    };
                }
            }
        }
        FlushOutcome {
            sent,
            retry_after: None,
            escalated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_drains_in_order() {
        let mut outbox = Outbox::new();
        outbox.push(vec![1]);
        outbox.push(vec![2]);
        let mut seen = Vec::new();
        let outcome = outbox.flush(|wire| {
            seen.push(wire[0]);
            Ok(())
        });
        assert_eq!(outcome.sent, 2);
        assert_eq!(outcome.retry_after, None);
        assert_eq!(seen, vec![1, 2]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_try_again_rearms_with_backoff() {
        let mut outbox = Outbox::new();
        for i in 0..50u8 {
            outbox.push(vec![i]);
        }
        let outcome = outbox.flush(|_| Err(BusError::TryAgain));
        assert_eq!(outcome.sent, 0);
        let delay = outcome.retry_after.unwrap();
        assert_eq!(delay, Duration::from_millis(500));
        assert_eq!(outbox.len(), 50);
    }

    #[test]
    fn test_backoff_capped_at_one_second() {
        let mut outbox = Outbox::new();
        for _ in 0..5_000 {
            outbox.push(vec![0]);
        }
        let outcome = outbox.flush(|_| Err(BusError::TryAgain));
        assert_eq!(outcome.retry_after.unwrap(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_nothing_dropped_on_bus_down() {
        let mut outbox = Outbox::new();
        outbox.push(vec![1]);
        outbox.push(vec![2]);
        let mut calls = 0;
        let outcome = outbox.flush(|_| {
            calls += 1;
            if calls == 1 { Ok(()) } else { Err(BusError::Down) }
        });
        assert_eq!(outcome.sent, 1);
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_retry_budget_escalates() {
        let mut outbox = Outbox::new();
        outbox.push(vec![1]);
        let mut escalated = 0;
        for _ in 0..SEND_RETRY_LIMIT {
            let outcome = outbox.flush(|_| Err(BusError::TryAgain));
            escalated += outcome.escalated;
        }
        assert_eq!(escalated, 1);
        // Escalation reports, but the message is still queued.
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_msg_ids_monotone() {
        let mut outbox = Outbox::new();
        let a = outbox.next_msg_id();
        let b = outbox.next_msg_id();
        assert!(b > a);
    }
}
