use std::pin::pin;
use std::sync::{Arc, Mutex};
use anyhow::bail;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, trace};
use crate::config::DeliveryConfig;
use crate::downstream::{Downstream, StreamKind};
use crate::member_addr::MemberAddr;
use crate::message::MessageEntry;
use crate::scheduler::{RetransmitScheduler, TaskHandle, TaskOutcome};
use crate::seqno::Seqno;
use crate::seqno_range::SeqnoRange;
use crate::table::SequenceTable;

struct SendEntry {
    message: MessageEntry,
    retransmit_task: Option<TaskHandle>,
}

impl SendEntry {
    fn cancel_retransmission(&self) {
        if let Some(task) = &self.retransmit_task {
            task.cancel();
        }
    }
}

struct SenderState {
    /// The first seqno that was added. Everything below was never buffered for this
    ///  destination, e.g. because it joined the view after those multicasts were sent.
    first_added: Option<Seqno>,
    /// highest seqno that was added
    highest_sent: Option<Seqno>,
    /// cumulative ack point: everything up to and including this was acknowledged
    highest_acked: Option<Seqno>,
    closed: bool,
}

/// Buffer of messages sent to a single destination (on a single stream) that were not
///  acknowledged yet.
///
/// Every buffered message has a retransmission task that re-sends it with back-off until it is
///  acknowledged. Acks are cumulative; acking removes the messages and cancels their tasks.
///  Since cancellation may lose the race against a task that is just firing, the task looks the
///  message up in the table before every retransmission and finishes if it is gone.
pub struct SenderWindow {
    destination: MemberAddr,
    kind: StreamKind,
    config: Arc<DeliveryConfig>,
    table: Arc<SequenceTable<SendEntry>>,
    scheduler: RetransmitScheduler,
    downstream: Arc<dyn Downstream>,
    state: Mutex<SenderState>,
    room_available: Notify,
}

impl SenderWindow {
    pub fn new(
        destination: MemberAddr,
        kind: StreamKind,
        config: Arc<DeliveryConfig>,
        scheduler: RetransmitScheduler,
        downstream: Arc<dyn Downstream>,
    ) -> SenderWindow {
        let table = Arc::new(SequenceTable::new(config.first_seqno, config.row_size, config.initial_rows));

        SenderWindow {
            destination,
            kind,
            config,
            table,
            scheduler,
            downstream,
            state: Mutex::new(SenderState {
                first_added: None,
                highest_sent: None,
                highest_acked: None,
                closed: false,
            }),
            room_available: Notify::new(),
        }
    }

    pub fn destination(&self) -> MemberAddr {
        self.destination
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SenderState> {
        self.state.lock().expect("sender window lock poisoned")
    }

    /// Buffers a message and arms its retransmission task. Returns `Ok(false)` if the seqno is
    ///  already buffered or was acknowledged before.
    ///
    /// If the window has a capacity and is full, this waits for acks to make room. It fails if
    ///  the window is reset, either before or while waiting.
    pub async fn add(&self, seqno: Seqno, payload: Bytes) -> anyhow::Result<bool> {
        let announce_start;
        loop {
            let mut notified = pin!(self.room_available.notified());
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();
                if state.closed {
                    bail!("send window for {:?} is closed", self.destination);
                }

                let is_full = self.config.send_window_capacity
                    .is_some_and(|capacity| self.table.size() >= capacity);

                if !is_full {
                    let is_first = state.first_added.is_none();
                    if is_first {
                        // the window starts at the first message, wherever that is
                        if let Some(below_first) = seqno.prev() {
                            self.table.purge(below_first);
                        }
                    }

                    let entry = SendEntry {
                        message: MessageEntry::new(seqno, payload),
                        retransmit_task: None,
                    };
                    if !self.table.put(seqno, entry) {
                        debug!("seqno {} for {:?} is already buffered or acknowledged - ignoring", seqno, self.destination);
                        return Ok(false);
                    }
                    if is_first {
                        state.first_added = Some(seqno);
                    }
                    state.highest_sent = state.highest_sent.max(Some(seqno));
                    announce_start = is_first && seqno > self.config.first_seqno;
                    break;
                }
            }

            trace!("send window for {:?} is full - waiting for acks", self.destination);
            notified.await;
        }

        let mut handle = Some(self.schedule_retransmission(seqno, announce_start));
        self.table.update(seqno, |entry| entry.retransmit_task = handle.take());
        if let Some(handle) = handle {
            trace!("seqno {} was acked before its retransmission was armed", seqno);
            handle.cancel();
        }

        if announce_start {
            debug!("stream to {:?} starts at {} - announcing start", self.destination, seqno);
            self.downstream.stream_start(self.destination, self.kind, seqno).await;
        }
        Ok(true)
    }

    /// Arms the retransmission task for `seqno`. If the message starts a stream above the
    ///  configured first seqno, every retransmission is preceded by the stream start so the
    ///  receiver does not wait for seqnos that were never sent to it.
    fn schedule_retransmission(&self, seqno: Seqno, announce_start: bool) -> TaskHandle {
        let table = self.table.clone();
        let downstream = self.downstream.clone();
        let destination = self.destination;
        let kind = self.kind;

        self.scheduler.schedule_backoff(self.config.retransmit_intervals.clone(), move |attempt| {
            let table = table.clone();
            let downstream = downstream.clone();
            async move {
                let payload = table.update(seqno, |entry| {
                    entry.message.retransmit_count += 1;
                    entry.message.payload.clone()
                });

                match payload {
                    None => {
                        trace!("seqno {} for {:?} was acknowledged - stopping retransmission", seqno, destination);
                        TaskOutcome::Done
                    }
                    Some(payload) => {
                        debug!("retransmitting seqno {} to {:?} (attempt {})", seqno, destination, attempt + 1);
                        if announce_start {
                            downstream.stream_start(destination, kind, seqno).await;
                        }
                        downstream.retransmit(destination, kind, seqno, payload).await;
                        TaskOutcome::Reschedule
                    }
                }
            }
        })
    }

    /// Cumulative ack: removes everything up to and including `seqno`. Acking a seqno that was
    ///  acked before (or is below a previous ack) is a no-op. Returns the number of removed
    ///  messages.
    pub fn ack(&self, seqno: Seqno) -> usize {
        let removed = {
            let mut state = self.lock_state();
            if state.highest_acked.is_some_and(|acked| seqno <= acked) {
                trace!("ack {} from {:?} is not above previous ack {:?} - ignoring", seqno, self.destination, state.highest_acked);
                return 0;
            }

            // never move the low-water mark past what was actually sent
            let Some(highest_sent) = state.highest_sent else {
                debug!("ack {} from {:?} before anything was sent - ignoring", seqno, self.destination);
                return 0;
            };
            let effective = std::cmp::min(seqno, highest_sent);
            if seqno > highest_sent {
                debug!("ack {} from {:?} is above highest sent seqno {} - truncating", seqno, self.destination, highest_sent);
            }
            if state.highest_acked.is_some_and(|acked| effective <= acked) {
                return 0;
            }

            state.highest_acked = Some(effective);
            self.table.purge(effective)
        };

        for (_, entry) in &removed {
            entry.cancel_retransmission();
        }
        trace!("ack {} from {:?} removed {} messages", seqno, self.destination, removed.len());

        if !removed.is_empty() {
            self.room_available.notify_waiters();
        }
        removed.len()
    }

    /// Selective ack of `[low, high]`: removes exactly the messages in that range without moving
    ///  the cumulative ack point.
    pub fn ack_range(&self, low: Seqno, high: Seqno) -> usize {
        assert!(low <= high, "malformed ack range [{}, {}]", low, high);

        let mut num_removed = 0;
        for seqno in low.to_inclusive(high) {
            if let Some(entry) = self.table.remove(seqno) {
                entry.cancel_retransmission();
                num_removed += 1;
            }
        }
        if num_removed > 0 {
            self.room_available.notify_waiters();
        }
        num_removed
    }

    /// Re-sends the messages the receiver reported as missing (i.e. the cleared bits) in
    ///  `ranges`. Returns the number of retransmitted messages.
    ///
    /// If the receiver asks for seqnos below the first one this window ever buffered, it can
    ///  never get them from here, so it is told where the stream starts instead.
    pub async fn retransmit(&self, ranges: &[SeqnoRange]) -> usize {
        let first_added = self.lock_state().first_added;
        if let Some(first_added) = first_added {
            let is_before_start = ranges.iter()
                .any(|range| range.missing().next().is_some_and(|seqno| seqno < first_added));
            if is_before_start {
                debug!("{:?} requested seqnos before the start of the stream at {} - announcing start", self.destination, first_added);
                self.downstream.stream_start(self.destination, self.kind, first_added).await;
            }
        }

        let mut num_sent = 0;
        for range in ranges {
            for seqno in range.missing() {
                let payload = self.table.update(seqno, |entry| {
                    entry.message.retransmit_count += 1;
                    entry.message.payload.clone()
                });
                match payload {
                    Some(payload) => {
                        trace!("retransmitting seqno {} to {:?} on request", seqno, self.destination);
                        self.downstream.retransmit(self.destination, self.kind, seqno, payload).await;
                        num_sent += 1;
                    }
                    None => {
                        debug!("{:?} requested seqno {} which is not in the send window", self.destination, seqno);
                    }
                }
            }
        }
        num_sent
    }

    /// the smallest seqno that is still buffered
    pub fn get_lowest(&self) -> Option<Seqno> {
        self.table.lowest()
    }

    pub fn first_added(&self) -> Option<Seqno> {
        self.lock_state().first_added
    }

    pub fn highest_sent(&self) -> Option<Seqno> {
        self.lock_state().highest_sent
    }

    pub fn highest_acked(&self) -> Option<Seqno> {
        self.lock_state().highest_acked
    }

    pub fn retransmit_count(&self, seqno: Seqno) -> Option<u32> {
        self.table.update(seqno, |entry| entry.message.retransmit_count)
    }

    pub fn size(&self) -> usize {
        self.table.size()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Cancels all retransmissions, drops all buffered messages and fails all pending and
    ///  future `add` calls. This is for when the destination left the view.
    pub fn reset(&self) {
        let removed = {
            let mut state = self.lock_state();
            state.closed = true;
            self.table.purge(Seqno::MAX)
        };
        for (_, entry) in &removed {
            entry.cancel_retransmission();
        }
        debug!("reset send window for {:?}: discarded {} unacknowledged messages", self.destination, removed.len());

        self.room_available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::MockDownstream;
    use crate::test_util::member::test_member_addr_from_number;
    use mockall::predicate::eq;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time::{self, Instant};

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    fn config(intervals_ms: &[u64], capacity: Option<usize>) -> Arc<DeliveryConfig> {
        let mut config = DeliveryConfig::new();
        config.row_size = 4;
        config.initial_rows = 1;
        config.retransmit_intervals = intervals_ms.iter().map(|&ms| Duration::from_millis(ms)).collect();
        config.send_window_capacity = capacity;
        Arc::new(config)
    }

    fn window(config: Arc<DeliveryConfig>, downstream: MockDownstream) -> SenderWindow {
        SenderWindow::new(
            test_member_addr_from_number(2),
            StreamKind::Unicast,
            config,
            RetransmitScheduler::new(),
            Arc::new(downstream),
        )
    }

    fn s(raw: u64) -> Seqno {
        Seqno::from_raw(raw)
    }

    #[rstest]
    #[case::nothing(vec![1,2,3], 0, 3)]
    #[case::first(vec![1,2,3], 1, 2)]
    #[case::all(vec![1,2,3], 3, 0)]
    #[case::above_highest_sent(vec![1,2,3], 10, 0)]
    #[case::with_gaps(vec![1,3,5,7], 4, 2)]
    fn test_ack(#[case] seqnos: Vec<u64>, #[case] ack: u64, #[case] expected_size: usize) {
        paused_runtime().block_on(async {
            let window = window(config(&[10_000], None), MockDownstream::new());
            for &seqno in &seqnos {
                assert!(window.add(s(seqno), Bytes::from_static(b"x")).await.unwrap());
            }

            window.ack(s(ack));
            assert_eq!(window.size(), expected_size);
            assert_eq!(window.size(), seqnos.iter().filter(|&&n| n > ack).count());

            // re-acking the same or lower seqnos changes nothing further
            assert_eq!(window.ack(s(ack)), 0);
            assert_eq!(window.ack(s(ack.saturating_sub(1))), 0);
            assert_eq!(window.size(), expected_size);
        });
    }

    #[test]
    fn test_add_duplicate_and_acked() {
        paused_runtime().block_on(async {
            let window = window(config(&[10_000], None), MockDownstream::new());
            assert!(window.add(s(1), Bytes::from_static(b"a")).await.unwrap());
            assert!(!window.add(s(1), Bytes::from_static(b"b")).await.unwrap());
            window.ack(s(1));
            assert!(!window.add(s(1), Bytes::from_static(b"c")).await.unwrap());
            assert!(window.add(s(2), Bytes::from_static(b"d")).await.unwrap());
            assert_eq!(window.get_lowest(), Some(s(2)));
            assert_eq!(window.highest_sent(), Some(s(2)));
            assert_eq!(window.highest_acked(), Some(s(1)));
        });
    }

    #[test]
    fn test_ack_range() {
        paused_runtime().block_on(async {
            let window = window(config(&[10_000], None), MockDownstream::new());
            for seqno in 1..=6 {
                window.add(s(seqno), Bytes::from_static(b"x")).await.unwrap();
            }
            assert_eq!(window.ack_range(s(2), s(4)), 3);
            assert_eq!(window.ack_range(s(2), s(4)), 0);
            assert_eq!(window.size(), 3);
            assert_eq!(window.get_lowest(), Some(s(1)));
            assert_eq!(window.highest_acked(), None);
        });
    }

    #[test]
    fn test_backoff_timing() {
        paused_runtime().block_on(async {
            let start = Instant::now();
            let fired = Arc::new(Mutex::new(Vec::new()));

            let mut downstream = MockDownstream::new();
            let fired2 = fired.clone();
            downstream.expect_retransmit()
                .with(eq(test_member_addr_from_number(2)), eq(StreamKind::Unicast), eq(s(1)), eq(Bytes::from_static(b"abc")))
                .returning(move |_, _, _, _| fired2.lock().unwrap().push(start.elapsed().as_millis() as u64));

            let window = window(config(&[1000, 2000, 4000, 8000], None), downstream);
            window.add(s(1), Bytes::from_static(b"abc")).await.unwrap();

            time::sleep(Duration::from_millis(15_500)).await;

            // retransmissions 1s, then 2s, then 4s, then 8s apart
            let expected = [1000u64, 3000, 7000, 15000];
            let fired = fired.lock().unwrap().clone();
            assert_eq!(fired.len(), expected.len());
            for (actual, expected) in fired.iter().zip(expected) {
                let tolerance = expected * 3 / 10;
                assert!(actual.abs_diff(expected) <= tolerance, "retransmission at {} ms, expected {} ms", actual, expected);
            }
            assert_eq!(window.retransmit_count(s(1)), Some(4));
        });
    }

    #[test]
    fn test_no_retransmission_after_ack() {
        paused_runtime().block_on(async {
            let mut downstream = MockDownstream::new();
            downstream.expect_retransmit()
                .times(1)
                .returning(|_, _, _, _| ());

            let window = window(config(&[1000], None), downstream);
            window.add(s(1), Bytes::from_static(b"abc")).await.unwrap();

            time::sleep(Duration::from_millis(1500)).await;
            window.ack(s(1));
            time::sleep(Duration::from_millis(5000)).await;
        });
    }

    #[test]
    fn test_retransmit_on_request() {
        paused_runtime().block_on(async {
            let mut downstream = MockDownstream::new();
            for seqno in [2u64, 4] {
                downstream.expect_retransmit()
                    .with(eq(test_member_addr_from_number(2)), eq(StreamKind::Unicast), eq(s(seqno)), eq(Bytes::from(vec![seqno as u8])))
                    .times(1)
                    .returning(|_, _, _, _| ());
            }

            let window = window(config(&[100_000], None), downstream);
            for seqno in 1..=4u64 {
                window.add(s(seqno), Bytes::from(vec![seqno as u8])).await.unwrap();
            }
            window.ack(s(1));

            // 1 is acked already, 3 was received by the peer, 5 was never sent
            let mut range = SeqnoRange::from_raw(1, 5);
            range.set(s(3));
            assert_eq!(window.retransmit(&[range]).await, 2);
        });
    }

    #[rstest]
    #[case::before_start(vec![(1, 5)], 2, 2)]
    #[case::from_start(vec![(4, 5)], 1, 2)]
    #[case::several_ranges(vec![(2, 2), (5, 5)], 2, 1)]
    fn test_retransmit_announces_stream_start(#[case] requested: Vec<(u64, u64)>, #[case] expected_starts: usize, #[case] expected_retransmits: usize) {
        paused_runtime().block_on(async {
            let mut downstream = MockDownstream::new();
            downstream.expect_stream_start()
                .with(eq(test_member_addr_from_number(2)), eq(StreamKind::Unicast), eq(s(4)))
                .times(expected_starts)
                .return_const(());
            downstream.expect_retransmit()
                .times(expected_retransmits)
                .return_const(());

            let window = window(config(&[100_000], None), downstream);
            window.add(s(4), Bytes::from_static(b"d")).await.unwrap();
            window.add(s(5), Bytes::from_static(b"e")).await.unwrap();
            assert_eq!(window.first_added(), Some(s(4)));

            let ranges = requested.into_iter()
                .map(|(low, high)| SeqnoRange::from_raw(low, high))
                .collect::<Vec<_>>();
            assert_eq!(window.retransmit(&ranges).await, expected_retransmits);
        });
    }

    #[test]
    fn test_stream_start_precedes_first_message_retransmissions() {
        paused_runtime().block_on(async {
            let mut downstream = MockDownstream::new();
            downstream.expect_stream_start()
                .with(eq(test_member_addr_from_number(2)), eq(StreamKind::Unicast), eq(s(10)))
                .times(3)
                .return_const(());
            downstream.expect_retransmit()
                .with(eq(test_member_addr_from_number(2)), eq(StreamKind::Unicast), eq(s(10)), eq(Bytes::from_static(b"j")))
                .times(2)
                .return_const(());
            downstream.expect_retransmit()
                .with(eq(test_member_addr_from_number(2)), eq(StreamKind::Unicast), eq(s(11)), eq(Bytes::from_static(b"k")))
                .times(2)
                .return_const(());

            let window = window(config(&[100], None), downstream);
            window.add(s(10), Bytes::from_static(b"j")).await.unwrap();
            window.add(s(11), Bytes::from_static(b"k")).await.unwrap();
            assert_eq!(window.get_lowest(), Some(s(10)));

            time::sleep(Duration::from_millis(250)).await;
            window.ack(s(11));
            time::sleep(Duration::from_secs(10)).await;
            assert_eq!(window.size(), 0);
        });
    }

    #[test]
    fn test_retransmit_before_anything_was_added() {
        paused_runtime().block_on(async {
            let window = window(config(&[100_000], None), MockDownstream::new());
            assert_eq!(window.retransmit(&[SeqnoRange::from_raw(1, 3)]).await, 0);
            assert_eq!(window.first_added(), None);
        });
    }

    #[test]
    fn test_capacity_blocks_until_ack() {
        paused_runtime().block_on(async {
            let window = Arc::new(window(config(&[100_000], Some(2)), MockDownstream::new()));
            window.add(s(1), Bytes::from_static(b"a")).await.unwrap();
            window.add(s(2), Bytes::from_static(b"b")).await.unwrap();

            let window2 = window.clone();
            let blocked = tokio::spawn(async move {
                window2.add(s(3), Bytes::from_static(b"c")).await
            });

            time::sleep(Duration::from_millis(100)).await;
            assert!(!blocked.is_finished());

            window.ack(s(1));
            assert!(blocked.await.unwrap().unwrap());
            assert_eq!(window.size(), 2);
        });
    }

    #[test]
    fn test_reset_releases_blocked_add() {
        paused_runtime().block_on(async {
            let mut downstream = MockDownstream::new();
            downstream.expect_retransmit().never();

            let window = Arc::new(window(config(&[1000], Some(1)), downstream));
            window.add(s(1), Bytes::from_static(b"a")).await.unwrap();

            let window2 = window.clone();
            let blocked = tokio::spawn(async move {
                window2.add(s(2), Bytes::from_static(b"b")).await
            });
            time::sleep(Duration::from_millis(100)).await;

            window.reset();
            assert!(blocked.await.unwrap().is_err());
            assert_eq!(window.size(), 0);
            assert!(window.is_closed());
            assert!(window.add(s(3), Bytes::from_static(b"c")).await.is_err());

            // cancelled tasks do not fire
            time::sleep(Duration::from_millis(5000)).await;
        });
    }
}
