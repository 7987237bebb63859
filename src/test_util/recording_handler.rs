use std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use crate::downstream::{DeliveryHandler, StreamKind};
use crate::member_addr::MemberAddr;
use crate::seqno::Seqno;

/// [DeliveryHandler] that records the seqnos it gets per source and stream, in the order they
///  were delivered
#[derive(Default)]
pub struct RecordingHandler {
    delivered: Mutex<FxHashMap<(MemberAddr, StreamKind), Vec<Seqno>>>,
}

impl RecordingHandler {
    pub fn delivered(&self, source: MemberAddr, kind: StreamKind) -> Vec<Seqno> {
        self.delivered.lock().expect("recording lock poisoned")
            .get(&(source, kind))
            .cloned()
            .unwrap_or_default()
    }

    pub fn num_delivered(&self, source: MemberAddr, kind: StreamKind) -> usize {
        self.delivered.lock().expect("recording lock poisoned")
            .get(&(source, kind))
            .map(|d| d.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn deliver(&self, source: MemberAddr, kind: StreamKind, seqno: Seqno, _payload: Bytes) {
        self.delivered.lock().expect("recording lock poisoned")
            .entry((source, kind))
            .or_default()
            .push(seqno);
    }
}
