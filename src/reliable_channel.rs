use std::sync::{Arc, RwLock};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};
use crate::config::DeliveryConfig;
use crate::credit::{Credit, CreditMap};
use crate::downstream::{DeliveryHandler, Destination, Downstream, StreamKind};
use crate::member_addr::MemberAddr;
use crate::receiver_window::{AddOutcome, ReceiverWindow};
use crate::scheduler::RetransmitScheduler;
use crate::sender_window::SenderWindow;
use crate::seqno::Seqno;
use crate::seqno_range::SeqnoRange;

type StreamKey = (MemberAddr, StreamKind);

/// everything that is kept per source and stream on the receiving side
struct ReceiveSide {
    window: Arc<ReceiverWindow>,
    /// credits granted to the source, replenished when they run low
    credit: Credit,
    /// Draining and handing messages upward happens under this lock, so batches of the same
    ///  source can not overtake each other.
    delivering: tokio::sync::Mutex<()>,
}

/// ReliableChannel is the place where the windows and credits come together: It has the API for
///  sending messages to a single member or to all members, and for feeding in everything the
///  transport receives from peers (messages, acks, retransmit requests, credits).
///
/// Per-peer state is created lazily when it is first needed, and it is dropped when the peer
///  leaves the view. Seqnos are assigned by the caller, one sequence per destination for
///  unicast and one for multicast.
///
/// A multicast is emitted once for all members, but it is buffered per member, so acks and
///  retransmissions are tracked for each member individually. Multicasts are not looped back:
///  the caller is not part of its own multicast destinations.
pub struct ReliableChannel {
    self_addr: MemberAddr,
    config: Arc<DeliveryConfig>,
    scheduler: RetransmitScheduler,
    downstream: Arc<dyn Downstream>,
    handler: Arc<dyn DeliveryHandler>,

    view: RwLock<Vec<MemberAddr>>,
    send_windows: RwLock<FxHashMap<StreamKey, Arc<SenderWindow>>>,
    receive_sides: RwLock<FxHashMap<StreamKey, Arc<ReceiveSide>>>,
    send_credits: RwLock<FxHashMap<MemberAddr, Arc<Credit>>>,
    multicast_credits: CreditMap,
}

impl ReliableChannel {
    pub fn new(
        self_addr: MemberAddr,
        config: Arc<DeliveryConfig>,
        downstream: Arc<dyn Downstream>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> anyhow::Result<ReliableChannel> {
        Self::with_scheduler(self_addr, config, RetransmitScheduler::new(), downstream, handler)
    }

    pub fn with_scheduler(
        self_addr: MemberAddr,
        config: Arc<DeliveryConfig>,
        scheduler: RetransmitScheduler,
        downstream: Arc<dyn Downstream>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> anyhow::Result<ReliableChannel> {
        config.validate()?;

        Ok(ReliableChannel {
            self_addr,
            multicast_credits: CreditMap::new(config.max_credits, config.credit_request_interval),
            config,
            scheduler,
            downstream,
            handler,
            view: Default::default(),
            send_windows: Default::default(),
            receive_sides: Default::default(),
            send_credits: Default::default(),
        })
    }

    pub fn self_addr(&self) -> MemberAddr {
        self.self_addr
    }

    pub fn view(&self) -> Vec<MemberAddr> {
        self.view.read().expect("view lock poisoned").clone()
    }

    /// Sends a message, waiting for credits if necessary. Fails if there are not enough credits
    ///  within the configured maximum block time, if the destination is not a member, or if the
    ///  destination leaves the view while waiting. Failed sends are not retried.
    ///
    /// Sending a seqno that was sent before (to the same destination) is a no-op.
    pub async fn send(&self, destination: Destination, seqno: Seqno, payload: Bytes) -> anyhow::Result<()> {
        let amount = payload.len() as i64;

        let windows = match destination {
            Destination::Unicast(to) => {
                let Some(credit) = self.send_credit(to) else {
                    bail!("cannot send to {:?}: not a member of the current view", to);
                };
                if credit.need_to_send_credit_request(amount) {
                    debug!("not enough credits for sending {} bytes to {:?} - requesting credits", amount, to);
                    self.downstream.need_credit(destination, credit.max() - credit.available()).await;
                }
                if let Err(e) = credit.decrement_if_enough(amount, self.config.max_block_time).await {
                    bail!("no credits for sending {} to {:?}: {}", seqno, to, e);
                }

                match self.sender_window(to, StreamKind::Unicast) {
                    Some(window) => vec![window],
                    None => bail!("cannot send {} to {:?}: it left the view", seqno, to),
                }
            }
            Destination::Multicast => {
                if self.multicast_credits.min_credits() < amount && self.multicast_credits.need_to_send_credit_request() {
                    debug!("not enough multicast credits for sending {} bytes - requesting credits from {:?}",
                        amount, self.multicast_credits.members_with_insufficient_credits(amount));
                    let requested = self.multicast_credits.max_credits() - self.multicast_credits.min_credits();
                    self.downstream.need_credit(destination, requested).await;
                }
                if let Err(e) = self.multicast_credits.decrement(amount, self.config.max_block_time).await {
                    bail!("no credits for multicasting {}: {}", seqno, e);
                }

                self.multicast_members().into_iter()
                    .filter_map(|member| self.sender_window(member, StreamKind::Multicast))
                    .collect()
            }
        };

        let mut is_new = windows.is_empty();
        for window in windows {
            match window.add(seqno, payload.clone()).await {
                Ok(added) => is_new |= added,
                Err(e) if matches!(destination, Destination::Multicast) => {
                    debug!("not buffering multicast {} for {:?}: {}", seqno, window.destination(), e);
                }
                Err(e) => return Err(e),
            }
        }
        if !is_new {
            debug!("message {} to {:?} was sent before - ignoring", seqno, destination);
            return Ok(());
        }

        trace!("sending message {} to {:?}", seqno, destination);
        self.downstream.send_message(destination, seqno, payload).await;
        Ok(())
    }

    fn multicast_members(&self) -> Vec<MemberAddr> {
        self.view.read().expect("view lock poisoned")
            .iter()
            .filter(|&&m| m != self.self_addr)
            .copied()
            .collect()
    }

    /// Handles a message received from `source`, handing all messages that are now in sequence
    ///  to the delivery handler.
    pub async fn on_message(&self, source: MemberAddr, kind: StreamKind, seqno: Seqno, payload: Bytes) {
        let Some(receive_side) = self.receive_side(source, kind) else {
            debug!("received message {} from {:?} which is not a member - dropping", seqno, source);
            return;
        };
        let len = payload.len() as i64;

        match receive_side.window.add(seqno, payload) {
            AddOutcome::Duplicate | AddOutcome::Rejected => return,
            AddOutcome::Buffered => {}
            AddOutcome::Delivered => self.deliver_ready(source, kind, &receive_side).await,
        }

        let granted = receive_side.credit.decrement_and_get(len, self.config.min_credits, self.config.max_credits);
        if granted > 0 {
            trace!("granting {} credits to {:?}", granted, source);
            self.downstream.grant_credits(source, kind, granted).await;
        }
    }

    async fn deliver_ready(&self, source: MemberAddr, kind: StreamKind, receive_side: &ReceiveSide) {
        let _delivering = receive_side.delivering.lock().await;
        loop {
            let mut batch = receive_side.window.drain(self.config.delivery_batch_size);
            match batch.len() {
                0 => break,
                1 => {
                    if let Some(msg) = batch.pop() {
                        self.handler.deliver(source, kind, msg.seqno, msg.payload).await;
                    }
                }
                _ => {
                    let batch = batch.into_iter()
                        .map(|msg| (msg.seqno, msg.payload))
                        .collect();
                    self.handler.deliver_batch(source, kind, batch).await;
                }
            }
        }
    }

    /// cumulative ack from `source`
    pub fn ack(&self, source: MemberAddr, kind: StreamKind, seqno: Seqno) {
        match self.existing_sender_window(source, kind) {
            Some(window) => { window.ack(seqno); }
            None => debug!("received ack {} from {:?} without a send window - ignoring", seqno, source),
        }
    }

    /// selective ack for `[low, high]` from `source`
    pub fn ack_range(&self, source: MemberAddr, kind: StreamKind, low: Seqno, high: Seqno) {
        match self.existing_sender_window(source, kind) {
            Some(window) => { window.ack_range(low, high); }
            None => debug!("received ack for {}..={} from {:?} without a send window - ignoring", low, high, source),
        }
    }

    pub async fn on_retransmit_request(&self, source: MemberAddr, kind: StreamKind, ranges: Vec<SeqnoRange>) {
        match self.existing_sender_window(source, kind) {
            Some(window) => {
                let num_retransmitted = window.retransmit(&ranges).await;
                trace!("retransmitted {} messages to {:?} on request", num_retransmitted, source);
            }
            None => warn!("received retransmit request from {:?} without a send window: {:?}", source, ranges),
        }
    }

    /// `source` announced that its stream of `kind` to us starts at `first`, so missing seqnos
    ///  below will never arrive. Messages that were waiting behind them are delivered.
    pub async fn on_stream_start(&self, source: MemberAddr, kind: StreamKind, first: Seqno) {
        let Some(receive_side) = self.receive_side(source, kind) else {
            debug!("received stream start {} from {:?} which is not a member - ignoring", first, source);
            return;
        };
        if receive_side.window.set_start(first) {
            self.deliver_ready(source, kind, &receive_side).await;
        }
    }

    /// credits granted by `source`
    pub fn replenish(&self, source: MemberAddr, kind: StreamKind, credits: i64) {
        match kind {
            StreamKind::Unicast => {
                let credit = self.send_credits.read().expect("credits lock poisoned")
                    .get(&source)
                    .cloned();
                match credit {
                    Some(credit) => { credit.increment(credits, self.config.max_credits); }
                    None => debug!("received {} credits from {:?} without a send credit - ignoring", credits, source),
                }
            }
            StreamKind::Multicast => self.multicast_credits.replenish(&source, credits),
        }
    }

    /// `source` ran out of the credits it has for sending to us, e.g. because a credit grant was
    ///  lost: grant what it asks for, up to max credits.
    pub async fn on_credit_request(&self, source: MemberAddr, kind: StreamKind, requested: i64) {
        if requested <= 0 {
            return;
        }
        let receive_side = self.receive_sides.read().expect("receive lock poisoned")
            .get(&(source, kind))
            .cloned();
        let Some(receive_side) = receive_side else {
            debug!("received credit request from {:?} without a receive window - ignoring", source);
            return;
        };

        let granted = std::cmp::min(requested, self.config.max_credits);
        receive_side.credit.increment(granted, self.config.max_credits);
        debug!("granting {} credits to {:?} on request", granted, source);
        self.downstream.grant_credits(source, kind, granted).await;
    }

    /// Drops delivered messages from `source` up to `stability_point`. This is only relevant if
    ///  delivered messages are retained.
    pub fn stable(&self, source: MemberAddr, kind: StreamKind, stability_point: Seqno) {
        let receive_side = self.receive_sides.read().expect("receive lock poisoned")
            .get(&(source, kind))
            .cloned();
        if let Some(receive_side) = receive_side {
            receive_side.window.purge(stability_point);
        }
    }

    /// Installs a new view. All state for members that are no longer in the view is dropped:
    ///  retransmissions stop, and sends that are blocked on their credits fail.
    ///
    /// NB: Per-peer state is only ever created while holding the view lock for reading, after
    ///      checking membership. Departed state is removed while holding it for writing, so no
    ///      state for a departed member can be created after this returns.
    pub fn on_view_change(&self, members: &[MemberAddr]) {
        info!("new view: {:?}", members);

        let is_departed = |member: &MemberAddr| !members.contains(member);

        let (departed_send_windows, departed_receive_sides, departed_credits) = {
            let mut view = self.view.write().expect("view lock poisoned");
            *view = members.to_vec();
            (
                Self::remove_departed(&self.send_windows, |(m, _)| is_departed(m)),
                Self::remove_departed(&self.receive_sides, |(m, _)| is_departed(m)),
                Self::remove_departed(&self.send_credits, is_departed),
            )
        };

        for window in departed_send_windows {
            window.reset();
        }
        for receive_side in departed_receive_sides {
            receive_side.window.reset();
            receive_side.credit.reset();
        }
        for credit in departed_credits {
            credit.reset();
        }

        let current_members = self.multicast_credits.members();
        for member in current_members.iter().filter(|&m| is_departed(m)) {
            debug!("{:?} left the view", member);
        }
        self.multicast_credits.retain_members(members);
        for &member in members {
            if member != self.self_addr {
                self.multicast_credits.add_member(member);
            }
        }
    }

    fn remove_departed<K: Copy + Eq + std::hash::Hash, V>(map: &RwLock<FxHashMap<K, Arc<V>>>, is_departed: impl Fn(&K) -> bool) -> Vec<Arc<V>> {
        let mut map = map.write().expect("lock poisoned");
        let departed = map.keys()
            .filter(|&k| is_departed(k))
            .copied()
            .collect::<Vec<_>>();
        departed.iter()
            .filter_map(|k| map.remove(k))
            .collect()
    }

    /// number of messages to `destination` that are not acknowledged yet
    pub fn num_unacked(&self, destination: MemberAddr, kind: StreamKind) -> usize {
        self.existing_sender_window(destination, kind)
            .map(|w| w.size())
            .unwrap_or(0)
    }

    pub fn highest_delivered(&self, source: MemberAddr, kind: StreamKind) -> Option<Seqno> {
        self.receive_sides.read().expect("receive lock poisoned")
            .get(&(source, kind))
            .and_then(|r| r.window.highest_delivered())
    }

    pub fn missing(&self, source: MemberAddr, kind: StreamKind) -> Vec<SeqnoRange> {
        self.receive_sides.read().expect("receive lock poisoned")
            .get(&(source, kind))
            .map(|r| r.window.missing_ranges())
            .unwrap_or_default()
    }

    pub fn available_credits(&self, destination: Destination) -> i64 {
        match destination {
            Destination::Unicast(to) => self.send_credits.read().expect("credits lock poisoned")
                .get(&to)
                .map(|c| c.available())
                .unwrap_or(self.config.max_credits),
            Destination::Multicast => self.multicast_credits.min_credits(),
        }
    }

    fn existing_sender_window(&self, peer: MemberAddr, kind: StreamKind) -> Option<Arc<SenderWindow>> {
        self.send_windows.read().expect("send lock poisoned")
            .get(&(peer, kind))
            .cloned()
    }

    /// Returns the existing entry for `key`, or creates one if `peer` is a member of the current
    ///  view. The view lock is held while inserting, see [ReliableChannel::on_view_change].
    fn get_or_create<K: Copy + Eq + std::hash::Hash, V>(
        &self,
        map: &RwLock<FxHashMap<K, Arc<V>>>,
        key: K,
        peer: MemberAddr,
        create: impl FnOnce() -> V,
    ) -> Option<Arc<V>> {
        if let Some(existing) = map.read().expect("lock poisoned").get(&key) {
            return Some(existing.clone());
        }

        let view = self.view.read().expect("view lock poisoned");
        if !view.contains(&peer) {
            return None;
        }
        let result = map.write().expect("lock poisoned")
            .entry(key)
            .or_insert_with(|| Arc::new(create()))
            .clone();
        Some(result)
    }

    fn sender_window(&self, peer: MemberAddr, kind: StreamKind) -> Option<Arc<SenderWindow>> {
        self.get_or_create(&self.send_windows, (peer, kind), peer, || {
            debug!("initializing {:?} send window for {:?}", kind, peer);
            SenderWindow::new(peer, kind, self.config.clone(), self.scheduler.clone(), self.downstream.clone())
        })
    }

    fn receive_side(&self, peer: MemberAddr, kind: StreamKind) -> Option<Arc<ReceiveSide>> {
        self.get_or_create(&self.receive_sides, (peer, kind), peer, || {
            debug!("initializing {:?} receive window for {:?}", kind, peer);
            let window = Arc::new(ReceiverWindow::new(peer, kind, self.config.clone(), self.downstream.clone()));
            window.start_retransmit_requests(&self.scheduler);
            ReceiveSide {
                window,
                credit: Credit::new(self.config.max_credits, self.config.credit_request_interval),
                delivering: Default::default(),
            }
        })
    }

    fn send_credit(&self, peer: MemberAddr) -> Option<Arc<Credit>> {
        self.get_or_create(&self.send_credits, peer, peer, || {
            Credit::new(self.config.max_credits, self.config.credit_request_interval)
        })
    }
}
