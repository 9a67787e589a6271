//! Bounded packet queue between the read loop and the consumer.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

use super::streams::StreamDescriptor;
use crate::config::QueuePolicy;

/// One elementary-stream packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DemuxPacket {
    /// Local stream id from the stream table.
    pub stream_id: u32,
    /// Presentation time in `TIME_BASE` ticks.
    pub pts: Option<i64>,
    /// Decode time in `TIME_BASE` ticks.
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    /// `I`, `P` or `B` when the server reports it.
    pub frame_type: Option<char>,
    pub payload: Bytes,
}

/// What [`super::Demuxer::read`] hands out.
#[derive(Debug, Clone, PartialEq)]
pub enum DemuxItem {
    Packet(DemuxPacket),
    /// The stream layout changed; refresh the track list.
    StreamChange(Arc<[StreamDescriptor]>),
}

struct QueueInner {
    items: VecDeque<DemuxItem>,
    packets: usize,
}

/// Bounded FIFO of [`DemuxItem`]s.
///
/// Only packets count against the capacity; layout changes are never dropped.
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    policy: QueuePolicy,
    dropped: AtomicU64,
}

impl PacketQueue {
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner { items: VecDeque::new(), packets: 0 }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `item`; returns false if the policy refused it.
    pub fn push(&self, item: DemuxItem) -> bool {
        {
            let mut inner = self.inner.lock();
            if let DemuxItem::Packet(_) = item {
                if inner.packets >= self.capacity {
                    match self.policy {
                        QueuePolicy::DropNewest => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            trace!("Packet queue full, dropping incoming packet");
                            return false;
                        }
                        QueuePolicy::DropOldest => {
                            if let Some(pos) =
                                inner.items.iter().position(|i| matches!(i, DemuxItem::Packet(_)))
                            {
                                inner.items.remove(pos);
                                inner.packets -= 1;
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                trace!("Packet queue full, dropping oldest packet");
                            }
                        }
                    }
                }
                inner.packets += 1;
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<DemuxItem> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front()?;
        if let DemuxItem::Packet(_) = item {
            inner.packets -= 1;
        }
        Some(item)
    }

    /// Pop, waiting at most `timeout` for something to arrive.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<DemuxItem> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return self.pop();
            }
        }
    }

    /// Drop every queued packet, keeping pending layout changes.
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.packets;
        inner.items.retain(|i| !matches!(i, DemuxItem::Packet(_)));
        inner.packets = 0;
        before
    }

    /// Drop the oldest packets until at most `keep` remain.
    pub fn trim(&self, keep: usize) -> usize {
        let mut inner = self.inner.lock();
        let excess = inner.packets.saturating_sub(keep);
        let mut removed = 0;
        inner.items.retain(|i| {
            if removed < excess && matches!(i, DemuxItem::Packet(_)) {
                removed += 1;
                false
            } else {
                true
            }
        });
        inner.packets -= removed;
        removed
    }

    /// Drop everything, layout changes included.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.packets = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn packet_count(&self) -> usize {
        self.inner.lock().packets
    }

    /// Packets refused or evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(n: i64) -> DemuxItem {
        DemuxItem::Packet(DemuxPacket {
            stream_id: 1,
            pts: Some(n),
            dts: Some(n),
            duration: None,
            frame_type: None,
            payload: Bytes::from_static(b"x"),
        })
    }

    fn pts(item: &DemuxItem) -> Option<i64> {
        match item {
            DemuxItem::Packet(p) => p.pts,
            DemuxItem::StreamChange(_) => None,
        }
    }

    #[test]
    fn drop_oldest_evicts_head_packet() {
        let queue = PacketQueue::new(2, QueuePolicy::DropOldest);
        assert!(queue.push(packet(1)));
        assert!(queue.push(packet(2)));
        assert!(queue.push(packet(3)));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().as_ref().and_then(pts), Some(2));
        assert_eq!(queue.pop().as_ref().and_then(pts), Some(3));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn drop_newest_refuses_incoming_packet() {
        let queue = PacketQueue::new(1, QueuePolicy::DropNewest);
        assert!(queue.push(packet(1)));
        assert!(!queue.push(packet(2)));
        assert_eq!(queue.pop().as_ref().and_then(pts), Some(1));
    }

    #[test]
    fn layout_changes_ignore_capacity_and_survive_flush() {
        let queue = PacketQueue::new(1, QueuePolicy::DropNewest);
        queue.push(packet(1));
        assert!(queue.push(DemuxItem::StreamChange(Arc::from(Vec::new()))));
        queue.push(packet(2));
        assert_eq!(queue.flush(), 1);
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.pop(), Some(DemuxItem::StreamChange(_))));
        assert_eq!(queue.packet_count(), 0);
    }

    #[test]
    fn trim_keeps_newest_packets() {
        let queue = PacketQueue::new(100, QueuePolicy::DropOldest);
        for n in 0..10 {
            queue.push(packet(n));
        }
        assert_eq!(queue.trim(3), 7);
        assert_eq!(queue.packet_count(), 3);
        assert_eq!(queue.pop().as_ref().and_then(pts), Some(7));
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_when_idle() {
        let queue = PacketQueue::new(10, QueuePolicy::DropOldest);
        assert!(queue.pop_timeout(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn pop_timeout_wakes_on_push() {
        let queue = Arc::new(PacketQueue::new(10, QueuePolicy::DropOldest));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(packet(42));
        });
        let item = queue.pop_timeout(Duration::from_secs(2)).await;
        assert_eq!(item.as_ref().and_then(pts), Some(42));
    }
}
