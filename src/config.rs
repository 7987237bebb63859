use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use crate::seqno::Seqno;

/// Configuration of the delivery core. The core only consumes these values - it does not own
///  or persist them.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// the seqno of the first message of every sender
    pub first_seqno: Seqno,

    /// number of slots per row of the sequence tables. Bigger rows mean fewer structural
    ///  changes but more memory for sparsely populated windows.
    pub row_size: usize,
    pub initial_rows: usize,
    /// Seqnos this far above a window's low-water mark or more are dropped. This bounds the
    ///  memory a single message with a bogus seqno can make a window allocate.
    pub max_window_span: u64,

    /// Retransmission back-off of unacknowledged messages: the n-th retransmission is sent
    ///  `retransmit_intervals[n]` after the previous one, with the last interval repeated
    ///  indefinitely.
    pub retransmit_intervals: Arc<[Duration]>,

    /// Maximum number of unacknowledged messages per destination. Adding a message to a full
    ///  send window waits until acks make room. `None` means unbounded.
    pub send_window_capacity: Option<usize>,

    /// If true, messages are removed from the receive window as soon as they are drained for
    ///  delivery. If false, they are retained until they are purged explicitly based on a
    ///  stability point, e.g. to allow serving retransmissions to other members.
    pub discard_delivered: bool,

    /// interval for checking receive windows for gaps and requesting retransmission
    pub retransmit_request_interval: Duration,
    /// upper bound for the number of seqnos requested in a single retransmit request
    pub max_missing_per_request: usize,

    pub max_credits: i64,
    /// When the credits a receiver granted a sender drop to this value, the receiver sends a
    ///  replenishment.
    pub min_credits: i64,
    /// requests for credits are sent at most once per this interval
    pub credit_request_interval: Duration,
    /// the maximum time a send blocks waiting for credits
    pub max_block_time: Duration,

    /// maximum number of messages handed upward in a single batch
    pub delivery_batch_size: usize,
}

impl DeliveryConfig {
    pub fn new() -> DeliveryConfig {
        DeliveryConfig {
            first_seqno: Seqno::from_raw(1),
            row_size: 1024,
            initial_rows: 4,
            max_window_span: 1 << 24,
            retransmit_intervals: Arc::from(vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]),
            send_window_capacity: None,
            discard_delivered: true,
            retransmit_request_interval: Duration::from_millis(500),
            max_missing_per_request: 512,
            max_credits: 4_000_000,
            min_credits: 1_000_000,
            credit_request_interval: Duration::from_millis(500),
            max_block_time: Duration::from_secs(5),
            delivery_batch_size: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.row_size == 0 {
            bail!("row size must be positive");
        }
        if self.max_window_span == 0 {
            bail!("max window span must be positive");
        }
        if self.retransmit_intervals.is_empty() {
            bail!("at least one retransmit interval is required");
        }
        if self.retransmit_intervals.iter().any(|d| d.is_zero()) {
            bail!("retransmit intervals must be positive");
        }
        if self.send_window_capacity == Some(0) {
            bail!("send window capacity must be positive if present");
        }
        if self.max_missing_per_request == 0 {
            bail!("max missing per request must be positive");
        }
        if self.max_credits <= 0 {
            bail!("max credits must be positive");
        }
        if self.min_credits < 0 || self.min_credits > self.max_credits {
            bail!("min credits must be between 0 and max credits ({}), was {}", self.max_credits, self.min_credits);
        }
        if self.delivery_batch_size == 0 {
            bail!("delivery batch size must be positive");
        }
        Ok(())
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::new()
    }
}
