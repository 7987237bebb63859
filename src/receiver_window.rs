use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};
use crate::config::DeliveryConfig;
use crate::downstream::{Downstream, StreamKind};
use crate::member_addr::MemberAddr;
use crate::message::MessageEntry;
use crate::scheduler::{RetransmitScheduler, TaskHandle, TaskOutcome};
use crate::seqno::Seqno;
use crate::seqno_range::SeqnoRange;
use crate::table::SequenceTable;
use crate::wait::WaitError;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AddOutcome {
    /// the message is in sequence (possibly after filling a gap) and ready to be drained
    Delivered,
    /// the message is out of sequence and is kept until the gap before it is filled
    Buffered,
    /// the message was received before (or is below the window) and is ignored
    Duplicate,
    /// the message is too far ahead of the window and is dropped
    Rejected,
}

/// Receive window for the messages of a single source (on a single stream).
///
/// Messages can arrive in any order and any number of times, and they can be added concurrently
///  from any number of callers. The window keeps track of the next expected seqno: Whenever that
///  seqno arrives, the window advances over all contiguous seqnos that are already buffered.
///  Everything below the next expected seqno is ready for delivery and is handed out (in
///  ascending order) by [ReceiverWindow::drain].
///
/// A single consumer is assumed: concurrent drains are serialized, so they do not break
///  ordering, but they are not useful either.
pub struct ReceiverWindow {
    source: MemberAddr,
    kind: StreamKind,
    config: Arc<DeliveryConfig>,
    table: SequenceTable<MessageEntry>,

    /// Everything below this was received. Advancing it is the only thing adders need to
    ///  coordinate on.
    next_expected: Mutex<Seqno>,
    /// The last seqno that was handed out by `drain`. Holding this lock serializes consumers.
    highest_delivered: Mutex<Option<Seqno>>,
    deliverable: Notify,
    closed: AtomicBool,

    downstream: Arc<dyn Downstream>,
    retransmit_request_task: Mutex<Option<TaskHandle>>,
    /// Highest received seqno as of the previous check for missing messages. Gaps above this
    ///  were only just discovered and are given one more interval to be filled by late arrivals
    ///  before retransmission is requested. Stored as raw value plus one, 0 for none.
    request_horizon: AtomicU64,
}

impl ReceiverWindow {
    pub fn new(
        source: MemberAddr,
        kind: StreamKind,
        config: Arc<DeliveryConfig>,
        downstream: Arc<dyn Downstream>,
    ) -> ReceiverWindow {
        ReceiverWindow {
            source,
            kind,
            table: SequenceTable::new(config.first_seqno, config.row_size, config.initial_rows),
            next_expected: Mutex::new(config.first_seqno),
            highest_delivered: Mutex::new(None),
            deliverable: Notify::new(),
            closed: AtomicBool::new(false),
            downstream,
            retransmit_request_task: Mutex::new(None),
            request_horizon: AtomicU64::new(0),
            config,
        }
    }

    pub fn source(&self) -> MemberAddr {
        self.source
    }

    pub fn add(&self, seqno: Seqno, payload: Bytes) -> AddOutcome {
        if self.closed.load(Ordering::Acquire) {
            debug!("message {} from {:?} arrived after the receive window was closed - ignoring", seqno, self.source);
            return AddOutcome::Duplicate;
        }

        let next_expected = self.next_expected();
        if seqno < next_expected {
            trace!("message {} from {:?} is below the next expected seqno - duplicate", seqno, self.source);
            return AddOutcome::Duplicate;
        }
        if seqno - next_expected >= self.config.max_window_span {
            warn!("message {} from {:?} is {} or more ahead of next expected seqno {} - dropping",
                seqno, self.source, self.config.max_window_span, next_expected);
            return AddOutcome::Rejected;
        }

        if !self.table.put(seqno, MessageEntry::new(seqno, payload)) {
            trace!("message {} from {:?} was received before - duplicate", seqno, self.source);
            return AddOutcome::Duplicate;
        }

        let (advanced, delivered) = {
            let mut next_expected = self.next_expected.lock().expect("receive window lock poisoned");
            let before = *next_expected;
            while self.table.contains(*next_expected) {
                *next_expected = next_expected.next();
            }
            (*next_expected > before, seqno < *next_expected)
        };

        if advanced {
            self.deliverable.notify_waiters();
        }

        if delivered {
            trace!("message {} from {:?} is deliverable", seqno, self.source);
            AddOutcome::Delivered
        }
        else {
            trace!("message {} from {:?} is out of sequence - buffering", seqno, self.source);
            AddOutcome::Buffered
        }
    }

    /// The source announced that its stream to us starts at `start`, e.g. because we joined the
    ///  view after it sent earlier messages: Seqnos below `start` will never arrive, so the
    ///  window skips them instead of waiting. Returns `true` if the window moved.
    pub fn set_start(&self, start: Seqno) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let mut highest_delivered = self.highest_delivered.lock().expect("receive window lock poisoned");
        {
            let mut next_expected = self.next_expected.lock().expect("receive window lock poisoned");
            if start <= *next_expected {
                trace!("stream start {} from {:?} is not above next expected seqno {} - ignoring", start, self.source, *next_expected);
                return false;
            }

            if let Some(last_skipped) = start.prev() {
                let num_dropped = self.table.purge(last_skipped).len();
                if num_dropped > 0 {
                    debug!("dropped {} messages from {:?} below the start of its stream", num_dropped, self.source);
                }
            }
            *next_expected = start;
            while self.table.contains(*next_expected) {
                *next_expected = next_expected.next();
            }
        }
        *highest_delivered = start.prev();
        drop(highest_delivered);

        debug!("stream from {:?} starts at {} - skipping everything below", self.source, start);
        self.deliverable.notify_waiters();
        true
    }

    /// Hands out up to `max` deliverable messages in ascending seqno order, without blocking.
    ///  Returns an empty vec if no message is ready.
    pub fn drain(&self, max: usize) -> Vec<MessageEntry> {
        let mut highest_delivered = self.highest_delivered.lock().expect("receive window lock poisoned");

        let Some(up_to) = self.next_expected().prev() else {
            return Vec::new();
        };
        let start = highest_delivered.map(|s| s.next()).unwrap_or(self.config.first_seqno);
        if start > up_to || max == 0 {
            return Vec::new();
        }

        let batch: Vec<MessageEntry> = if self.config.discard_delivered {
            self.table.remove_up_to(up_to, max)
                .into_iter()
                .map(|(_, entry)| entry)
                .collect()
        }
        else {
            self.table.range_snapshot(start, up_to, max)
                .into_iter()
                .map(|(_, entry)| entry)
                .collect()
        };

        if let Some(last) = batch.last() {
            debug_assert_eq!(batch[0].seqno, start);
            *highest_delivered = Some(last.seqno);
            trace!("draining {} messages from {:?}: {}..={}", batch.len(), self.source, start, last.seqno);
        }
        batch
    }

    /// Like [ReceiverWindow::drain], but waits until at least one message is deliverable. Waiting
    ///  ends with [WaitError::TimedOut] after `timeout` (if given), or with
    ///  [WaitError::Interrupted] if the window is reset.
    pub async fn drain_blocking(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<MessageEntry>, WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut notified = pin!(self.deliverable.notified());
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(WaitError::Interrupted);
            }

            let batch = self.drain(max);
            if !batch.is_empty() {
                return Ok(batch);
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return Err(WaitError::TimedOut);
                    }
                }
            }
        }
    }

    /// The gaps between the next expected seqno and the highest received seqno, as ranges of
    ///  missing seqnos in ascending order.
    pub fn missing_ranges(&self) -> Vec<SeqnoRange> {
        match self.digest() {
            Some(digest) => digest.missing_runs(),
            None => Vec::new(),
        }
    }

    /// A bitmap of received seqnos from the next expected seqno up to the highest received
    ///  seqno, or `None` if there is no gap.
    pub fn digest(&self) -> Option<SeqnoRange> {
        let next_expected = self.next_expected();
        let highest_received = self.highest_received()?;
        if highest_received < next_expected {
            return None;
        }
        Some(self.table.missing(next_expected, highest_received))
    }

    /// Drops delivered messages up to `stability_point`, i.e. messages that every member is
    ///  known to have received. Messages that were not drained yet are never purged.
    pub fn purge(&self, stability_point: Seqno) -> usize {
        let highest_delivered = *self.highest_delivered.lock().expect("receive window lock poisoned");
        let Some(highest_delivered) = highest_delivered else {
            return 0;
        };
        let num_purged = self.table.purge(std::cmp::min(stability_point, highest_delivered)).len();
        if num_purged > 0 {
            debug!("purged {} delivered messages from {:?} up to {}", num_purged, self.source, stability_point);
        }
        num_purged
    }

    pub fn next_expected(&self) -> Seqno {
        *self.next_expected.lock().expect("receive window lock poisoned")
    }

    pub fn highest_delivered(&self) -> Option<Seqno> {
        *self.highest_delivered.lock().expect("receive window lock poisoned")
    }

    pub fn highest_received(&self) -> Option<Seqno> {
        self.table.high_water_mark()
    }

    /// number of messages held by the window, both deliverable and buffered out of sequence
    pub fn size(&self) -> usize {
        self.table.size()
    }

    /// Starts periodic checks for missing messages, sending a retransmit request to the source
    ///  whenever there are gaps. The task stops when the window is reset or dropped.
    pub fn start_retransmit_requests(self: &Arc<Self>, scheduler: &RetransmitScheduler) {
        let weak: Weak<ReceiverWindow> = Arc::downgrade(self);
        let handle = scheduler.schedule_at_fixed_rate(self.config.retransmit_request_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(window) if !window.closed.load(Ordering::Acquire) => {
                        window.request_missing().await;
                        TaskOutcome::Reschedule
                    }
                    _ => TaskOutcome::Done,
                }
            }
        });

        let prev = self.retransmit_request_task.lock().expect("receive window lock poisoned")
            .replace(handle);
        if let Some(prev) = prev {
            prev.cancel();
        }
    }

    /// Sends one retransmit request for the gaps that were already known at the previous check,
    ///  limited to the configured maximum number of seqnos.
    pub async fn request_missing(&self) {
        let horizon = self.request_horizon.swap(
            self.highest_received().map(|s| s.to_raw() + 1).unwrap_or(0),
            Ordering::AcqRel);
        let Some(horizon) = horizon.checked_sub(1).map(Seqno::from_raw) else {
            return;
        };

        let mut ranges = Vec::new();
        let mut budget = self.config.max_missing_per_request as u64;
        for range in self.missing_ranges() {
            if range.low() > horizon || budget == 0 {
                break;
            }
            let high = std::cmp::min(range.high(), horizon);
            let high = std::cmp::min(high, range.low() + (budget - 1));
            let range = SeqnoRange::new(range.low(), high);
            budget -= range.len();
            ranges.push(range);
        }

        if ranges.is_empty() {
            trace!("no missing messages from {:?} to request", self.source);
            return;
        }

        debug!("requesting retransmission from {:?}: {:?}", self.source, ranges);
        self.downstream.retransmit_request(self.source, self.kind, ranges).await;
    }

    /// Clears the window, stops retransmit requests and interrupts blocked consumers. This is
    ///  for when the source left the view.
    pub fn reset(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.retransmit_request_task.lock().expect("receive window lock poisoned").take() {
            handle.cancel();
        }
        let num_discarded = self.table.purge(Seqno::MAX).len();
        debug!("reset receive window for {:?}: discarded {} messages", self.source, num_discarded);
        self.deliverable.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::MockDownstream;
    use crate::test_util::member::test_member_addr_from_number;
    use mockall::predicate::{always, eq};
    use rand::Rng;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::time;

    fn s(raw: u64) -> Seqno {
        Seqno::from_raw(raw)
    }

    fn config(discard_delivered: bool) -> Arc<DeliveryConfig> {
        let mut config = DeliveryConfig::new();
        config.row_size = 8;
        config.initial_rows = 1;
        config.discard_delivered = discard_delivered;
        config.retransmit_request_interval = Duration::from_millis(100);
        config.max_missing_per_request = 5;
        Arc::new(config)
    }

    fn window_with(config: Arc<DeliveryConfig>, downstream: MockDownstream) -> ReceiverWindow {
        ReceiverWindow::new(
            test_member_addr_from_number(1),
            StreamKind::Multicast,
            config,
            Arc::new(downstream),
        )
    }

    fn window(discard_delivered: bool) -> ReceiverWindow {
        window_with(config(discard_delivered), MockDownstream::new())
    }

    fn drained_seqnos(window: &ReceiverWindow, max: usize) -> Vec<u64> {
        window.drain(max).into_iter().map(|e| e.seqno.to_raw()).collect()
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[rstest]
    #[case::in_order(vec![1,2,3], vec![AddOutcome::Delivered, AddOutcome::Delivered, AddOutcome::Delivered])]
    #[case::gap(vec![1,3], vec![AddOutcome::Delivered, AddOutcome::Buffered])]
    #[case::gap_filled(vec![2,3,1], vec![AddOutcome::Buffered, AddOutcome::Buffered, AddOutcome::Delivered])]
    #[case::duplicate_delivered(vec![1,1], vec![AddOutcome::Delivered, AddOutcome::Duplicate])]
    #[case::duplicate_buffered(vec![3,3], vec![AddOutcome::Buffered, AddOutcome::Duplicate])]
    fn test_add(#[case] seqnos: Vec<u64>, #[case] expected: Vec<AddOutcome>) {
        let window = window(true);
        let actual = seqnos.into_iter()
            .map(|n| window.add(s(n), Bytes::from(vec![n as u8])))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::discard(true)]
    #[case::retain(false)]
    fn test_gap_handling(#[case] discard_delivered: bool) {
        let window = window(discard_delivered);
        for n in [1, 2, 3, 5] {
            window.add(s(n), Bytes::from(vec![n as u8]));
        }
        assert_eq!(window.missing_ranges().iter().map(|r| r.bounds()).collect::<Vec<_>>(), vec![(4, 4)]);
        assert_eq!(drained_seqnos(&window, 100), vec![1, 2, 3]);

        assert_eq!(window.add(s(4), Bytes::from_static(&[4])), AddOutcome::Delivered);
        assert!(window.missing_ranges().is_empty());

        let drained = window.drain(100);
        assert_eq!(drained.iter().map(|e| e.seqno.to_raw()).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(drained[1].payload, Bytes::from_static(&[5]));
        assert!(window.drain(100).is_empty());
        assert_eq!(window.highest_delivered(), Some(s(5)));
    }

    #[test]
    fn test_drain_max() {
        let window = window(true);
        for n in 1..=10 {
            window.add(s(n), Bytes::new());
        }
        assert_eq!(drained_seqnos(&window, 3), vec![1, 2, 3]);
        assert_eq!(drained_seqnos(&window, 3), vec![4, 5, 6]);
        assert_eq!(drained_seqnos(&window, 100), vec![7, 8, 9, 10]);
        assert_eq!(window.size(), 0);
    }

    #[rstest]
    #[case::discard(true)]
    #[case::retain(false)]
    fn test_no_redelivery_after_drain(#[case] discard_delivered: bool) {
        let window = window(discard_delivered);
        window.add(s(1), Bytes::new());
        window.add(s(2), Bytes::new());
        assert_eq!(drained_seqnos(&window, 100), vec![1, 2]);

        assert_eq!(window.add(s(1), Bytes::new()), AddOutcome::Duplicate);
        assert_eq!(window.add(s(2), Bytes::new()), AddOutcome::Duplicate);
        assert!(window.drain(100).is_empty());
    }

    #[test]
    fn test_purge_retained() {
        let window = window(false);
        for n in 1..=6 {
            window.add(s(n), Bytes::new());
        }
        assert_eq!(window.size(), 6);
        assert_eq!(drained_seqnos(&window, 4), vec![1, 2, 3, 4]);
        assert_eq!(window.size(), 6);

        // undelivered messages are not purged even if the stability point is above them
        assert_eq!(window.purge(s(6)), 4);
        assert_eq!(window.size(), 2);
        assert_eq!(drained_seqnos(&window, 100), vec![5, 6]);
        assert_eq!(window.add(s(3), Bytes::new()), AddOutcome::Duplicate);
    }

    #[test]
    fn test_digest() {
        let window = window(true);
        assert!(window.digest().is_none());
        for n in [1, 3, 4, 7] {
            window.add(s(n), Bytes::new());
        }
        let digest = window.digest().unwrap();
        assert_eq!(digest.bounds(), (2, 7));
        assert_eq!(digest.received().map(|s| s.to_raw()).collect::<Vec<_>>(), vec![3, 4, 7]);
        assert_eq!(window.missing_ranges().iter().map(|r| r.bounds()).collect::<Vec<_>>(), vec![(2, 2), (5, 6)]);
    }

    #[test]
    fn test_drain_blocking() {
        paused_runtime().block_on(async {
            let window = Arc::new(window(true));

            let window2 = window.clone();
            let consumer = tokio::spawn(async move {
                window2.drain_blocking(10, None).await
            });

            time::sleep(Duration::from_millis(10)).await;
            window.add(s(2), Bytes::new());
            time::sleep(Duration::from_millis(10)).await;
            assert!(!consumer.is_finished());

            window.add(s(1), Bytes::new());
            let drained = consumer.await.unwrap().unwrap();
            assert_eq!(drained.iter().map(|e| e.seqno.to_raw()).collect::<Vec<_>>(), vec![1, 2]);
        });
    }

    #[test]
    fn test_drain_blocking_timeout() {
        paused_runtime().block_on(async {
            let window = window(true);
            assert_eq!(window.drain_blocking(10, Some(Duration::from_millis(100))).await.unwrap_err(), WaitError::TimedOut);
        });
    }

    #[test]
    fn test_drain_blocking_interrupted_by_reset() {
        paused_runtime().block_on(async {
            let window = Arc::new(window(true));
            window.add(s(3), Bytes::new());

            let window2 = window.clone();
            let consumer = tokio::spawn(async move {
                window2.drain_blocking(10, Some(Duration::from_secs(100))).await
            });
            time::sleep(Duration::from_millis(10)).await;

            window.reset();
            assert_eq!(consumer.await.unwrap().unwrap_err(), WaitError::Interrupted);
            assert_eq!(window.size(), 0);
            assert_eq!(window.add(s(1), Bytes::new()), AddOutcome::Duplicate);
        });
    }

    #[test]
    fn test_retransmit_requests_after_grace_period() {
        paused_runtime().block_on(async {
            let mut downstream = MockDownstream::new();
            downstream.expect_retransmit_request()
                .with(eq(test_member_addr_from_number(1)), eq(StreamKind::Multicast), always())
                .times(1)
                .returning(|_, _, ranges| {
                    assert_eq!(ranges.iter().map(|r| r.bounds()).collect::<Vec<_>>(), vec![(2, 3)]);
                });

            let window = Arc::new(window_with(config(true), downstream));
            window.start_retransmit_requests(&RetransmitScheduler::new());

            window.add(s(1), Bytes::new());
            window.add(s(4), Bytes::new());

            // first check: the gap was just discovered, no request yet
            time::sleep(Duration::from_millis(150)).await;
            // second check: request
            time::sleep(Duration::from_millis(100)).await;

            window.add(s(2), Bytes::new());
            window.add(s(3), Bytes::new());
            // no more gaps, no more requests
            time::sleep(Duration::from_millis(500)).await;
            window.reset();
        });
    }

    #[rstest]
    #[case::limited(vec![1, 20], vec![(2, 6)])]
    #[case::several_ranges(vec![1, 3, 5, 20], vec![(2, 2), (4, 4), (6, 8)])]
    fn test_request_missing_limit(#[case] received: Vec<u64>, #[case] expected: Vec<(u64, u64)>) {
        paused_runtime().block_on(async {
            let mut downstream = MockDownstream::new();
            downstream.expect_retransmit_request()
                .times(1)
                .returning(move |_, _, ranges| {
                    assert_eq!(ranges.iter().map(|r| r.bounds()).collect::<Vec<_>>(), expected);
                });

            let window = window_with(config(true), downstream);
            for n in received {
                window.add(s(n), Bytes::new());
            }
            // establish the horizon, then request
            window.request_missing().await;
            window.request_missing().await;
        });
    }

    #[test]
    fn test_add_too_far_ahead() {
        let mut config = DeliveryConfig::new();
        config.row_size = 4;
        config.initial_rows = 1;
        config.max_window_span = 16;
        let window = window_with(Arc::new(config), MockDownstream::new());

        assert_eq!(window.add(s(17), Bytes::new()), AddOutcome::Rejected);
        assert_eq!(window.add(s(1 << 50), Bytes::new()), AddOutcome::Rejected);
        assert_eq!(window.add(s(u64::MAX), Bytes::new()), AddOutcome::Rejected);
        assert_eq!(window.size(), 0);
        assert_eq!(window.highest_received(), None);

        assert_eq!(window.add(s(16), Bytes::new()), AddOutcome::Buffered);
        for n in 1..=3 {
            assert_eq!(window.add(s(n), Bytes::new()), AddOutcome::Delivered);
        }
        // the span moves with the window
        assert_eq!(window.add(s(19), Bytes::new()), AddOutcome::Buffered);
        assert_eq!(window.add(s(20), Bytes::new()), AddOutcome::Rejected);
    }

    #[rstest]
    #[case::discard(true)]
    #[case::retain(false)]
    fn test_set_start(#[case] discard_delivered: bool) {
        let window = window(discard_delivered);
        for n in [5, 6, 8] {
            assert_eq!(window.add(s(n), Bytes::from(vec![n as u8])), AddOutcome::Buffered);
        }
        assert!(drained_seqnos(&window, 100).is_empty());

        assert!(window.set_start(s(5)));
        assert_eq!(window.next_expected(), s(7));
        assert_eq!(window.highest_delivered(), Some(s(4)));
        assert_eq!(drained_seqnos(&window, 100), vec![5, 6]);
        assert_eq!(window.missing_ranges().iter().map(|r| r.bounds()).collect::<Vec<_>>(), vec![(7, 7)]);

        assert_eq!(window.add(s(7), Bytes::from_static(&[7])), AddOutcome::Delivered);
        assert_eq!(drained_seqnos(&window, 100), vec![7, 8]);
    }

    #[test]
    fn test_set_start_drops_messages_below() {
        let window = window(true);
        assert_eq!(window.add(s(2), Bytes::from_static(&[2])), AddOutcome::Buffered);

        assert!(window.set_start(s(4)));
        assert_eq!(window.size(), 0);
        assert_eq!(window.add(s(2), Bytes::from_static(&[2])), AddOutcome::Duplicate);
        assert_eq!(window.add(s(3), Bytes::from_static(&[3])), AddOutcome::Duplicate);
        assert!(drained_seqnos(&window, 100).is_empty());

        assert_eq!(window.add(s(4), Bytes::from_static(&[4])), AddOutcome::Delivered);
        assert_eq!(drained_seqnos(&window, 100), vec![4]);
    }

    #[rstest]
    #[case::at_next_expected(3)]
    #[case::below_next_expected(2)]
    fn test_set_start_not_above_next_expected(#[case] start: u64) {
        let window = window(true);
        window.add(s(1), Bytes::from_static(&[1]));
        window.add(s(2), Bytes::from_static(&[2]));

        assert!(!window.set_start(s(start)));
        assert_eq!(window.next_expected(), s(3));
        assert_eq!(drained_seqnos(&window, 100), vec![1, 2]);
    }

    #[test]
    fn test_set_start_after_reset() {
        let window = window(true);
        window.reset();
        assert!(!window.set_start(s(10)));
    }

    #[rstest]
    #[case::in_sequence(3, vec![1, 2], AddOutcome::Delivered, vec![1, 2, 3])]
    #[case::out_of_sequence(4, vec![1], AddOutcome::Buffered, vec![1])]
    fn test_concurrent_add_same_seqno(#[case] seqno: u64, #[case] initial: Vec<u64>, #[case] expected_outcome: AddOutcome, #[case] expected_drained: Vec<u64>) {
        const NUM_TASKS: u64 = 32;

        Builder::new_multi_thread()
            .worker_threads(8)
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                let window = Arc::new(window(true));
                for &n in &initial {
                    window.add(s(n), Bytes::from(vec![n as u8]));
                }

                let mut handles = Vec::new();
                for task_no in 0..NUM_TASKS {
                    let window = window.clone();
                    handles.push(tokio::spawn(async move {
                        window.add(s(seqno), Bytes::from(vec![task_no as u8]))
                    }));
                }

                let mut outcomes = Vec::new();
                for handle in handles {
                    outcomes.push(handle.await.unwrap());
                }
                assert_eq!(outcomes.iter().filter(|&&o| o == expected_outcome).count(), 1);
                assert_eq!(outcomes.iter().filter(|&&o| o == AddOutcome::Duplicate).count() as u64, NUM_TASKS - 1);

                assert_eq!(drained_seqnos(&window, 100), expected_drained);
                assert!(window.drain(100).is_empty());
                assert_eq!(window.size(), if expected_outcome == AddOutcome::Buffered { 1 } else { 0 });
            });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_adds_exactly_once() {
        const NUM_SEQNOS: u64 = 1_000_000;
        const NUM_PRODUCERS: usize = 50;
        const BLOCK_SIZE: u64 = 16;

        let mut config = DeliveryConfig::new();
        config.row_size = 1024;
        let window = Arc::new(window_with(Arc::new(config), MockDownstream::new()));

        // producers pull blocks of seqnos from a shared counter and add each block in reverse
        //  order, with some random re-sends, for gaps and out-of-order arrivals and duplicates
        let next_block = Arc::new(AtomicU64::new(1));
        let mut producers = Vec::new();
        for _ in 0..NUM_PRODUCERS {
            let window = window.clone();
            let next_block = next_block.clone();
            producers.push(tokio::spawn(async move {
                let mut num_delivered_or_buffered = 0u64;
                loop {
                    let first = next_block.fetch_add(BLOCK_SIZE, Ordering::AcqRel);
                    if first > NUM_SEQNOS {
                        break;
                    }
                    let last = std::cmp::min(first + BLOCK_SIZE - 1, NUM_SEQNOS);
                    for n in (first..=last).rev() {
                        if window.add(s(n), Bytes::new()) != AddOutcome::Duplicate {
                            num_delivered_or_buffered += 1;
                        }
                        if rand::thread_rng().gen_bool(0.05) {
                            // re-send something this producer added already
                            let resend = rand::thread_rng().gen_range(n..=last);
                            assert_eq!(window.add(s(resend), Bytes::new()), AddOutcome::Duplicate);
                        }
                    }
                    tokio::task::yield_now().await;
                }
                num_delivered_or_buffered
            }));
        }

        let window2 = window.clone();
        let consumer = tokio::spawn(async move {
            let mut expected = 1u64;
            while expected <= NUM_SEQNOS {
                let batch = window2.drain_blocking(1000, Some(Duration::from_secs(60))).await.unwrap();
                for entry in batch {
                    assert_eq!(entry.seqno.to_raw(), expected);
                    expected += 1;
                }
            }
            expected - 1
        });

        let mut total_accepted = 0;
        for producer in producers {
            total_accepted += producer.await.unwrap();
        }
        assert_eq!(total_accepted, NUM_SEQNOS);
        assert_eq!(consumer.await.unwrap(), NUM_SEQNOS);
        assert_eq!(window.size(), 0);
        assert!(window.drain(10).is_empty());
    }
}
