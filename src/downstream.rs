use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::member_addr::MemberAddr;
use crate::seqno::Seqno;
use crate::seqno_range::SeqnoRange;

/// Each sender has one sequence of seqnos per unicast destination and one for its multicasts.
///  Acks, retransmissions and credits always refer to one of these streams.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum StreamKind {
    Unicast,
    Multicast,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Destination {
    Unicast(MemberAddr),
    /// all members of the current view
    Multicast,
}

impl Destination {
    pub fn stream_kind(&self) -> StreamKind {
        match self {
            Destination::Unicast(_) => StreamKind::Unicast,
            Destination::Multicast => StreamKind::Multicast,
        }
    }
}

/// The transport side of the delivery core: everything the core wants to put on the wire goes
///  through this trait. Encoding and the actual I/O are the implementor's business.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Downstream: Send + Sync + 'static {
    /// first transmission of a message
    async fn send_message(&self, to: Destination, seqno: Seqno, payload: Bytes);

    /// re-sending a buffered message, either because it was not acknowledged in time or because
    ///  the receiver requested it
    async fn retransmit(&self, to: MemberAddr, kind: StreamKind, seqno: Seqno, payload: Bytes);

    /// ask `source` to resend the missing seqnos in `ranges`
    async fn retransmit_request(&self, source: MemberAddr, kind: StreamKind, ranges: Vec<SeqnoRange>);

    /// Tell `to` that our stream of `kind` to it starts at `first`: seqnos below were never
    ///  sent to it and will never be retransmitted. The receiving side passes this to
    ///  [crate::reliable_channel::ReliableChannel::on_stream_start].
    async fn stream_start(&self, to: MemberAddr, kind: StreamKind, first: Seqno);

    /// A sender is running out of credits for `destination` and should ask for `requested` more,
    ///  i.e. the transport should send a credit request that ends up in
    ///  [crate::reliable_channel::ReliableChannel::on_credit_request] on the receiving side.
    ///  This is debounced by the core.
    async fn need_credit(&self, destination: Destination, requested: i64);

    /// grant `credits` to a sender that consumed them
    async fn grant_credits(&self, to: MemberAddr, kind: StreamKind, credits: i64);
}

/// The application side of the delivery core: messages are handed upward through this trait,
///  per source in increasing seqno order.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn deliver(&self, source: MemberAddr, kind: StreamKind, seqno: Seqno, payload: Bytes);

    /// Hand-off of several consecutive messages at once. The default implementation delivers
    ///  them one by one.
    async fn deliver_batch(&self, source: MemberAddr, kind: StreamKind, batch: Vec<(Seqno, Bytes)>) {
        for (seqno, payload) in batch {
            self.deliver(source, kind, seqno, payload).await;
        }
    }
}
