use bytes::Bytes;
use tokio::time::Instant;
use crate::seqno::Seqno;

/// A message as it is held in a window, owned by the table slot for its seqno
#[derive(Clone, Debug)]
pub struct MessageEntry {
    pub seqno: Seqno,
    pub payload: Bytes,
    pub first_sent: Instant,
    pub retransmit_count: u32,
}

impl MessageEntry {
    pub fn new(seqno: Seqno, payload: Bytes) -> MessageEntry {
        MessageEntry {
            seqno,
            payload,
            first_sent: Instant::now(),
            retransmit_count: 0,
        }
    }
}
