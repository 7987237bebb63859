use std::pin::pin;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};
use crate::wait::WaitError;

struct CreditState {
    available: i64,
    max: i64,
    last_credit_request: Option<Instant>,
    num_blockings: u64,
    /// incremented by `reset`, telling blocked waiters that the credit they were waiting for is
    ///  gone
    epoch: u64,
}

/// Credits for a single peer, i.e. the number of bytes that may be sent to the peer (or
///  received from it) before more credits are needed.
///
/// `available` is always in `[0, max]`.
pub struct Credit {
    state: Mutex<CreditState>,
    credit_request_interval: Duration,
    changed: Notify,
}

impl Credit {
    pub fn new(max: i64, credit_request_interval: Duration) -> Credit {
        assert!(max >= 0, "max credits must not be negative: {}", max);
        Credit {
            state: Mutex::new(CreditState {
                available: max,
                max,
                last_credit_request: None,
                num_blockings: 0,
                epoch: 0,
            }),
            credit_request_interval,
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CreditState> {
        self.state.lock().expect("credit lock poisoned")
    }

    pub fn available(&self) -> i64 {
        self.lock().available
    }

    pub fn max(&self) -> i64 {
        self.lock().max
    }

    /// number of calls to [Credit::decrement_if_enough] that had to wait for credits
    pub fn num_blockings(&self) -> u64 {
        self.lock().num_blockings
    }

    /// Consumes `amount` credits, waiting for them to be replenished if there are not enough.
    ///  Returns [WaitError::TimedOut] if there are still not enough credits after `timeout`,
    ///  and [WaitError::Interrupted] if the credit is reset while waiting.
    pub async fn decrement_if_enough(&self, amount: i64, timeout: Duration) -> Result<(), WaitError> {
        assert!(amount >= 0, "cannot decrement a negative amount of credits: {}", amount);

        let deadline = Instant::now() + timeout;
        let epoch = self.lock().epoch;
        let mut blocked = false;

        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.epoch != epoch {
                    debug!("credit was reset while waiting for {} credits", amount);
                    return Err(WaitError::Interrupted);
                }
                if state.available >= amount {
                    state.available -= amount;
                    trace!("consumed {} credits, {} left", amount, state.available);
                    return Ok(());
                }
                if !blocked {
                    blocked = true;
                    state.num_blockings += 1;
                    trace!("waiting for {} credits, {} available", amount, state.available);
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                debug!("timed out waiting for {} credits", amount);
                return Err(WaitError::TimedOut);
            }
        }
    }

    /// Receiver side bookkeeping: consumes `amount` credits (never going below zero) without
    ///  blocking. If that leaves `min` credits or less, the credit is topped up to `max`, and the
    ///  number of credits that were added is returned so they can be granted to the sender.
    ///  Returns 0 otherwise.
    pub fn decrement_and_get(&self, amount: i64, min: i64, max: i64) -> i64 {
        let mut state = self.lock();
        state.available = std::cmp::max(0, state.available - amount);
        if state.available > min {
            return 0;
        }

        let to_grant = max - state.available;
        state.available = max;
        state.max = max;
        to_grant
    }

    /// Adds credits, never going above `max`, and wakes up every blocked waiter so they can
    ///  re-check. Returns the new number of available credits.
    pub fn increment(&self, amount: i64, max: i64) -> i64 {
        let available = {
            let mut state = self.lock();
            state.max = max;
            state.available = std::cmp::min(max, state.available.saturating_add(amount));
            state.available
        };
        self.changed.notify_waiters();
        available
    }

    /// Returns true if available credits are below `min_threshold` and no credit request was
    ///  signalled during the last credit request interval. A `true` result is recorded as a credit
    ///  request.
    pub fn need_to_send_credit_request(&self, min_threshold: i64) -> bool {
        let mut state = self.lock();
        if state.available >= min_threshold {
            return false;
        }

        let now = Instant::now();
        match state.last_credit_request {
            Some(last) if now.duration_since(last) < self.credit_request_interval => false,
            _ => {
                state.last_credit_request = Some(now);
                true
            }
        }
    }

    /// Restores the maximum credits and releases all blocked waiters with
    ///  [WaitError::Interrupted].
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            state.epoch += 1;
            state.available = state.max;
            state.last_credit_request = None;
        }
        self.changed.notify_waiters();
    }
}
