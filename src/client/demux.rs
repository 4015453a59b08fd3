//! Channel demultiplexer at the application boundary
//!
//! Outbound payloads are prefixed with a one-byte channel tag; inbound
//! payloads are routed by that tag, stripped, to the registered sink.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type ChannelSink = Arc<dyn Fn(Bytes) + Send + Sync>;

#[derive(Default)]
pub struct ChannelDemux {
    channels: RwLock<HashMap<u8, ChannelSink>>,
    unrouted: AtomicU64,
}

impl ChannelDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix `payload` with `tag`
    pub fn tag(tag: u8, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(tag);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Returns the sink previously registered for `tag`
    pub fn register(&self, tag: u8, sink: ChannelSink) -> Option<ChannelSink> {
        self.channels.write().insert(tag, sink)
    }

    pub fn unregister(&self, tag: u8) -> Option<ChannelSink> {
        self.channels.write().remove(&tag)
    }

    /// Hand one inbound payload to its channel. False when empty or untagged.
    pub fn dispatch(&self, mut payload: Bytes) -> bool {
        if payload.is_empty() {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let tag = payload[0];
        let sink = self.channels.read().get(&tag).cloned();
        match sink {
            Some(sink) => {
                let _ = payload.split_to(1);
                sink(payload);
                true
            }
            None => {
                tracing::trace!("No channel registered for tag {}", tag);
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Payloads dropped for lack of a channel
    pub fn unrouted(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }
}
