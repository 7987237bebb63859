use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::time;
use tracing::trace;
use crate::downstream::{Destination, Downstream, StreamKind};
use crate::member_addr::MemberAddr;
use crate::reliable_channel::ReliableChannel;
use crate::seqno::Seqno;
use crate::seqno_range::SeqnoRange;

#[derive(Debug, Clone)]
pub struct LossyNetworkConfig {
    /// probability of a packet being dropped
    pub drop_probability: f64,
    /// probability of a packet that is not dropped being delivered twice
    pub duplicate_probability: f64,
    /// Every packet is delayed by a random duration up to this, so packets overtake each other
    pub max_delay: Duration,
}

impl LossyNetworkConfig {
    pub fn new() -> LossyNetworkConfig {
        LossyNetworkConfig {
            drop_probability: 0.1,
            duplicate_probability: 0.1,
            max_delay: Duration::from_millis(20),
        }
    }
}

impl Default for LossyNetworkConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum Packet {
    Message { kind: StreamKind, seqno: Seqno, payload: Bytes },
    Ack { kind: StreamKind, seqno: Seqno },
    RetransmitRequest { kind: StreamKind, ranges: Vec<SeqnoRange> },
    StreamStart { kind: StreamKind, first: Seqno },
    CreditRequest { kind: StreamKind, requested: i64 },
    Credits { kind: StreamKind, credits: i64 },
}

/// An in-memory network connecting [ReliableChannel]s, dropping, duplicating and reordering
///  packets at random. Receivers acknowledge the highest delivered seqno for every message they
///  get, like a protocol layer on top of the channel would.
pub struct LossyNetwork {
    config: LossyNetworkConfig,
    channels: RwLock<FxHashMap<MemberAddr, Weak<ReliableChannel>>>,
    num_dropped: AtomicU64,
    num_duplicated: AtomicU64,
}

impl LossyNetwork {
    pub fn new(config: LossyNetworkConfig) -> Arc<LossyNetwork> {
        Arc::new(LossyNetwork {
            config,
            channels: Default::default(),
            num_dropped: AtomicU64::new(0),
            num_duplicated: AtomicU64::new(0),
        })
    }

    /// the [Downstream] for the channel of `member`
    pub fn link(self: &Arc<Self>, member: MemberAddr) -> Arc<LossyLink> {
        Arc::new(LossyLink {
            from: member,
            network: self.clone(),
        })
    }

    pub fn register(&self, channel: &Arc<ReliableChannel>) {
        self.channels.write().expect("channels lock poisoned")
            .insert(channel.self_addr(), Arc::downgrade(channel));
    }

    pub fn num_dropped(&self) -> u64 {
        self.num_dropped.load(Ordering::Relaxed)
    }

    pub fn num_duplicated(&self) -> u64 {
        self.num_duplicated.load(Ordering::Relaxed)
    }

    fn channel(&self, addr: &MemberAddr) -> Option<Arc<ReliableChannel>> {
        self.channels.read().expect("channels lock poisoned")
            .get(addr)
            .and_then(|c| c.upgrade())
    }

    fn members_except(&self, addr: &MemberAddr) -> Vec<MemberAddr> {
        self.channels.read().expect("channels lock poisoned")
            .keys()
            .filter(|&m| m != addr)
            .copied()
            .collect()
    }

    fn send_packet(self: &Arc<Self>, from: MemberAddr, to: MemberAddr, packet: Packet) {
        let (is_dropped, is_duplicated) = {
            let mut rng = rand::thread_rng();
            (rng.gen_bool(self.config.drop_probability), rng.gen_bool(self.config.duplicate_probability))
        };

        if is_dropped {
            trace!("dropping packet {:?} -> {:?}: {:?}", from, to, packet);
            self.num_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let num_copies = if is_duplicated {
            self.num_duplicated.fetch_add(1, Ordering::Relaxed);
            2
        }
        else {
            1
        };

        for _ in 0..num_copies {
            let delay = self.random_delay();
            let network = self.clone();
            let packet = packet.clone();
            tokio::spawn(async move {
                time::sleep(delay).await;
                network.on_packet(from, to, packet).await;
            });
        }
    }

    fn random_delay(&self) -> Duration {
        let max_micros = self.config.max_delay.as_micros() as u64;
        if max_micros == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=max_micros))
    }

    async fn on_packet(self: &Arc<Self>, from: MemberAddr, to: MemberAddr, packet: Packet) {
        let Some(target) = self.channel(&to) else {
            trace!("no channel for {:?} - dropping packet", to);
            return;
        };

        match packet {
            Packet::Message { kind, seqno, payload } => {
                target.on_message(from, kind, seqno, payload).await;
                if let Some(highest_delivered) = target.highest_delivered(from, kind) {
                    self.send_packet(to, from, Packet::Ack { kind, seqno: highest_delivered });
                }
            }
            Packet::Ack { kind, seqno } => target.ack(from, kind, seqno),
            Packet::RetransmitRequest { kind, ranges } => target.on_retransmit_request(from, kind, ranges).await,
            Packet::StreamStart { kind, first } => {
                target.on_stream_start(from, kind, first).await;
                if let Some(highest_delivered) = target.highest_delivered(from, kind) {
                    self.send_packet(to, from, Packet::Ack { kind, seqno: highest_delivered });
                }
            }
            Packet::CreditRequest { kind, requested } => target.on_credit_request(from, kind, requested).await,
            Packet::Credits { kind, credits } => target.replenish(from, kind, credits),
        }
    }
}

/// The [Downstream] of a single channel on a [LossyNetwork]
pub struct LossyLink {
    from: MemberAddr,
    network: Arc<LossyNetwork>,
}

impl LossyLink {
    fn destinations(&self, destination: Destination) -> Vec<MemberAddr> {
        match destination {
            Destination::Unicast(to) => vec![to],
            Destination::Multicast => self.network.members_except(&self.from),
        }
    }
}

#[async_trait]
impl Downstream for LossyLink {
    async fn send_message(&self, to: Destination, seqno: Seqno, payload: Bytes) {
        let kind = to.stream_kind();
        for to in self.destinations(to) {
            self.network.send_packet(self.from, to, Packet::Message { kind, seqno, payload: payload.clone() });
        }
    }

    async fn retransmit(&self, to: MemberAddr, kind: StreamKind, seqno: Seqno, payload: Bytes) {
        self.network.send_packet(self.from, to, Packet::Message { kind, seqno, payload });
    }

    async fn retransmit_request(&self, source: MemberAddr, kind: StreamKind, ranges: Vec<SeqnoRange>) {
        self.network.send_packet(self.from, source, Packet::RetransmitRequest { kind, ranges });
    }

    async fn stream_start(&self, to: MemberAddr, kind: StreamKind, first: Seqno) {
        self.network.send_packet(self.from, to, Packet::StreamStart { kind, first });
    }

    async fn need_credit(&self, destination: Destination, requested: i64) {
        let kind = destination.stream_kind();
        for to in self.destinations(destination) {
            self.network.send_packet(self.from, to, Packet::CreditRequest { kind, requested });
        }
    }

    async fn grant_credits(&self, to: MemberAddr, kind: StreamKind, credits: i64) {
        self.network.send_packet(self.from, to, Packet::Credits { kind, credits });
    }
}
