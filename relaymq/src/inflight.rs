use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU16;
use std::sync::Arc;

use tokio::sync::{oneshot, Notify};

use relaymq_codec::Publish;

use crate::types::PacketId;
use crate::utils::{timestamp_millis, TimestampMillis};

/// The session or connection ended before the in-flight exchange finished;
/// the submitter's delivery guarantee could not be confirmed.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("submission abandoned, session or connection terminated")]
pub struct Abandoned;

/// Outbound QoS state, waiting for the peer's next acknowledgement.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum OutboundStatus {
    /// QoS 1, PUBACK outstanding
    AwaitingAck,
    /// QoS 2, PUBREC outstanding
    AwaitingRec,
    /// QoS 2, PUBREL sent, PUBCOMP outstanding
    AwaitingComp,
}

/// One outbound in-flight message plus the submitter's completion signal.
#[derive(Debug)]
pub struct OutInflightMessage {
    pub publish: Publish,
    pub status: OutboundStatus,
    pub update_time: TimestampMillis,
    done: Option<oneshot::Sender<()>>,
}

impl OutInflightMessage {
    #[inline]
    pub fn new(status: OutboundStatus, publish: Publish) -> Self {
        Self { publish, status, update_time: timestamp_millis(), done: None }
    }

    /// The submitter awaits the paired receiver; a dropped sender reads as
    /// [`Abandoned`] on that side.
    #[inline]
    pub fn with_signal(mut self, done: oneshot::Sender<()>) -> Self {
        self.done = Some(done);
        self
    }

    #[inline]
    pub fn update_status(&mut self, status: OutboundStatus) {
        self.update_time = timestamp_millis();
        self.status = status;
    }

    /// Terminal transition observed; unblock the submitter.
    #[inline]
    pub fn complete(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

/// Outbound in-flight window and the session's packet-identifier allocator.
///
/// A rotating cursor hands out identifiers not present in this window nor in
/// the caller-supplied reservation check (the inbound window). Removal of an
/// entry notifies allocation waiters so an exhausted submitter can retry.
pub struct OutInflight {
    cap: usize,
    next: u16,
    queue: BTreeMap<PacketId, OutInflightMessage>,
    freed: Arc<Notify>,
}

impl OutInflight {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, next: 1, queue: BTreeMap::new(), freed: Arc::new(Notify::new()) }
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.queue.len() < self.cap
    }

    /// Next free identifier, or `None` when all 65535 are taken.
    #[inline]
    pub fn next_id(&mut self, reserved: impl Fn(PacketId) -> bool) -> Option<PacketId> {
        for _ in 0..=u16::MAX {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if let Some(pid) = NonZeroU16::new(id) {
                if !self.queue.contains_key(&pid) && !reserved(pid) {
                    return Some(pid);
                }
            }
        }
        None
    }

    #[inline]
    pub fn push(&mut self, packet_id: PacketId, m: OutInflightMessage) -> Option<OutInflightMessage> {
        self.queue.insert(packet_id, m)
    }

    #[inline]
    pub fn get(&self, packet_id: &PacketId) -> Option<&OutInflightMessage> {
        self.queue.get(packet_id)
    }

    #[inline]
    pub fn update_status(&mut self, packet_id: &PacketId, status: OutboundStatus) -> bool {
        if let Some(m) = self.queue.get_mut(packet_id) {
            m.update_status(status);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn remove(&mut self, packet_id: &PacketId) -> Option<OutInflightMessage> {
        let removed = self.queue.remove(packet_id);
        if removed.is_some() {
            self.freed.notify_waiters();
        }
        removed
    }

    #[inline]
    pub fn exist(&self, packet_id: &PacketId) -> bool {
        self.queue.contains_key(packet_id)
    }

    /// Waiters are woken whenever an identifier frees up.
    #[inline]
    pub fn freed(&self) -> Arc<Notify> {
        self.freed.clone()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&PacketId, &OutInflightMessage)> {
        self.queue.iter()
    }

    /// Drop every entry; pending submitters observe abandonment.
    #[inline]
    pub fn clear(&mut self) {
        self.queue.clear();
        self.freed.notify_waiters();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Inbound QoS-2 window: publishes received but not yet released.
#[derive(Default)]
pub struct InInflight {
    cached: BTreeSet<PacketId>,
}

impl InInflight {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the identifier is already pending, i.e. the
    /// publish is a duplicate and must not be fanned out again.
    #[inline]
    pub fn add(&mut self, pid: PacketId) -> bool {
        self.cached.insert(pid)
    }

    /// Duplicate releases are tolerated, so a missing identifier is fine.
    #[inline]
    pub fn remove(&mut self, pid: &PacketId) -> bool {
        self.cached.remove(pid)
    }

    #[inline]
    pub fn contains(&self, pid: &PacketId) -> bool {
        self.cached.contains(pid)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cached.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use bytestring::ByteString;
    use relaymq_codec::QoS;

    use super::*;

    fn publish(qos: QoS) -> Publish {
        Publish {
            dup: false,
            retain: false,
            qos,
            topic: ByteString::from_static("t"),
            packet_id: None,
            payload: Bytes::from_static(b"x"),
        }
    }

    fn pid(v: u16) -> PacketId {
        NonZeroU16::new(v).unwrap()
    }

    #[test]
    fn test_alloc_skips_in_use() {
        let mut w = OutInflight::new(16);
        let id1 = w.next_id(|_| false).unwrap();
        w.push(id1, OutInflightMessage::new(OutboundStatus::AwaitingAck, publish(QoS::AtLeastOnce)));
        let id2 = w.next_id(|_| false).unwrap();
        assert_ne!(id1, id2);

        // ids held by the inbound window are skipped too
        let id3 = w.next_id(|p| p == pid(3)).unwrap();
        assert_ne!(id3, pid(3));
    }

    #[test]
    fn test_alloc_recycles_after_remove() {
        let mut w = OutInflight::new(16);
        let id = w.next_id(|_| false).unwrap();
        w.push(id, OutInflightMessage::new(OutboundStatus::AwaitingRec, publish(QoS::ExactlyOnce)));
        assert!(w.exist(&id));
        assert!(w.remove(&id).is_some());
        assert!(!w.exist(&id));

        // the cursor wraps round to the freed id eventually
        let mut seen = false;
        for _ in 0..u16::MAX {
            if w.next_id(|_| false).unwrap() == id {
                seen = true;
                break;
            }
        }
        assert!(seen);
    }

    #[test]
    fn test_alloc_exhaustion() {
        let mut w = OutInflight::new(usize::MAX);
        for _ in 0..u16::MAX {
            let id = w.next_id(|_| false).unwrap();
            w.push(id, OutInflightMessage::new(OutboundStatus::AwaitingAck, publish(QoS::AtLeastOnce)));
        }
        assert_eq!(w.len(), u16::MAX as usize);
        assert!(w.next_id(|_| false).is_none());

        w.remove(&pid(777));
        assert_eq!(w.next_id(|_| false), Some(pid(777)));
    }

    #[tokio::test]
    async fn test_completion_signal() {
        let mut w = OutInflight::new(16);
        let (tx, rx) = oneshot::channel();
        let m = OutInflightMessage::new(OutboundStatus::AwaitingAck, publish(QoS::AtLeastOnce))
            .with_signal(tx);
        w.push(pid(1), m);

        w.remove(&pid(1)).unwrap().complete();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_signal() {
        let mut w = OutInflight::new(16);
        let (tx, rx) = oneshot::channel();
        let m = OutInflightMessage::new(OutboundStatus::AwaitingAck, publish(QoS::AtLeastOnce))
            .with_signal(tx);
        w.push(pid(1), m);

        w.clear();
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_in_inflight_dedup() {
        let mut w = InInflight::new();
        assert!(w.add(pid(7)));
        assert!(!w.add(pid(7)));
        assert!(w.remove(&pid(7)));
        assert!(!w.remove(&pid(7)));
    }
}
