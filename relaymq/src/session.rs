use std::fmt;
use std::ops::Deref;
use std::pin::pin;
use std::str::FromStr;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, RwLock};
use tokio::time::{sleep, Duration, Instant};

use relaymq_codec::{LastWill, Packet, Publish, QoS, SubscribeReturnCode};
use relaymq_net::{MqttError, MqttStream};

use crate::context::ServerContext;
use crate::inflight::{InInflight, OutInflight, OutInflightMessage, OutboundStatus};
use crate::queue::Queue;
use crate::topic::Topic;
use crate::types::{HashMap, Id, Message, PacketId, Reason, Rx, TopicFilter, Tx};
use crate::utils::{timestamp_millis, TimestampMillis};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u8 {
        const Kicked = 0b00000001;
        const DisconnectReceived = 0b00000010;
    }
}

/// Per-client persistent state, shared between the broker (for routing) and
/// at most one bound connection task group (for I/O).
///
/// The broker pushes routed messages straight onto the two delivery queues,
/// so a persistent session keeps accumulating guaranteed messages while
/// detached.
#[derive(Clone)]
pub struct Session(Arc<_Session>);

impl Deref for Session {
    type Target = _Session;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Session {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session {:?}", self.id)
    }
}

pub struct _Session {
    pub id: Id,
    pub clean_session: bool,
    pub created_at: TimestampMillis,
    /// (topic filter, granted QoS); duplicates collapse to the latest grant.
    pub subscriptions: RwLock<HashMap<TopicFilter, QoS>>,
    pub out_inflight: RwLock<OutInflight>,
    pub in_inflight: RwLock<InInflight>,
    /// QoS-0 deliveries. Overflow silently drops the incoming message.
    pub burst_queue: Queue<Publish>,
    /// QoS 1/2 deliveries. Overflow terminates the session.
    pub deliver_queue: Queue<Publish>,
}

impl Session {
    #[inline]
    pub fn new(
        id: Id,
        clean_session: bool,
        max_inflight: usize,
        max_burst_len: usize,
        max_mqueue_len: usize,
    ) -> Self {
        Session(Arc::new(_Session {
            id,
            clean_session,
            created_at: timestamp_millis(),
            subscriptions: RwLock::new(HashMap::default()),
            out_inflight: RwLock::new(OutInflight::new(max_inflight)),
            in_inflight: RwLock::new(InInflight::new()),
            burst_queue: Queue::new(max_burst_len),
            deliver_queue: Queue::new(max_mqueue_len),
        }))
    }

    #[inline]
    pub async fn subscriptions_add(&self, topic_filter: TopicFilter, qos: QoS) -> Option<QoS> {
        self.subscriptions.write().await.insert(topic_filter, qos)
    }

    #[inline]
    pub async fn subscriptions_remove(&self, topic_filter: &str) -> Option<QoS> {
        self.subscriptions.write().await.remove(topic_filter)
    }

    #[inline]
    pub async fn to_topic_filters(&self) -> Vec<TopicFilter> {
        self.subscriptions.read().await.keys().cloned().collect()
    }

    /// Allocate a fresh packet identifier, suspending on a free-slot
    /// notification while all 65535 are in flight.
    pub(crate) async fn alloc_packet_id(&self) -> PacketId {
        loop {
            let freed = {
                let mut out = self.out_inflight.write().await;
                let inbound = self.in_inflight.read().await;
                if let Some(id) = out.next_id(|p| inbound.contains(&p)) {
                    return id;
                }
                out.freed()
            };
            let mut notified = pin!(freed.notified());
            notified.as_mut().enable();
            {
                let mut out = self.out_inflight.write().await;
                let inbound = self.in_inflight.read().await;
                if let Some(id) = out.next_id(|p| inbound.contains(&p)) {
                    return id;
                }
            }
            notified.await;
        }
    }

    /// Destroy delivery state, abandoning pending submitters.
    pub(crate) async fn abandon(&self) {
        self.out_inflight.write().await.clear();
        while self.deliver_queue.pop().is_some() {}
        while self.burst_queue.pop().is_some() {}
    }
}

/// The connection task group bound to one session: input, output,
/// keep-alive and the two queue drains, raced as arms of one event loop.
/// The first arm to fail stops the others and releases the transport.
pub struct SessionState {
    pub scx: ServerContext,
    pub session: Session,
    tx: Tx,
    rx: Rx,
    keep_alive: u16,
    /// The current connection's clean-session flag; it, not the flag the
    /// session was created under, decides persistence at disconnect.
    clean_session: bool,
    will: Option<LastWill>,
    kick_reply: Option<oneshot::Sender<()>>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionState {{ {:?} }}", self.session.id)
    }
}

impl SessionState {
    #[inline]
    pub(crate) fn new(
        scx: ServerContext,
        session: Session,
        will: Option<LastWill>,
        keep_alive: u16,
        clean_session: bool,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self { scx, session, tx, rx, keep_alive, clean_session, will, kick_reply: None }
    }

    #[inline]
    pub fn tx(&self) -> &Tx {
        &self.tx
    }

    #[inline]
    pub(crate) async fn run<Io>(mut self, mut sink: MqttStream<Io>) -> crate::Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let mut flags = StateFlags::empty();
        self.scx.connections.inc();
        let res = self.run_loop(&mut sink, &mut flags).await;
        self.scx.connections.dec();

        match &res {
            Ok(()) => log::info!("{:?} exit ...", self.session.id),
            Err(reason) => log::info!("{:?} exit, reason: {}", self.session.id, reason),
        }

        let _ = sink.close().await;

        // The wind-down is complete only once the transport is released;
        // a takeover waits on this.
        if let Some(done) = self.kick_reply.take() {
            let _ = done.send(());
        }

        // Takeover and orderly DISCONNECT both suppress the will.
        if !flags.contains(StateFlags::DisconnectReceived) && !flags.contains(StateFlags::Kicked) {
            if let Some(will) = self.will.take() {
                let p = Publish {
                    dup: false,
                    retain: will.retain,
                    qos: will.qos,
                    topic: will.topic,
                    packet_id: None,
                    payload: will.message,
                };
                if let Err(e) = self.scx.shared.publish(p).await {
                    log::warn!("{:?} publish last will error, {:?}", self.session.id, e);
                }
            }
        }

        if flags.contains(StateFlags::Kicked) {
            // the new connection owns the session now
        } else if matches!(res, Err(Reason::MessageQueueFull)) {
            // the terminating publisher already dropped the session
        } else if self.clean_session {
            self.scx.shared.close_session(&self.session).await;
        } else {
            self.scx.shared.detach(&self.session).await;
        }

        Ok(())
    }

    async fn run_loop<Io>(
        &mut self,
        sink: &mut MqttStream<Io>,
        flags: &mut StateFlags,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        log::debug!("{:?} start event loop, keep_alive: {}", self.session.id, self.keep_alive);

        // the broker allows 1.5 x keepAlive of silence before teardown
        let keep_alive_interval = if self.keep_alive == 0 {
            Duration::from_secs(u32::MAX as u64)
        } else {
            Duration::from_millis(
                (f64::from(self.keep_alive) * f64::from(sink.cfg.keepalive_backoff) * 2.0 * 1000.0) as u64,
            )
        };
        let keep_alive_delay = sleep(keep_alive_interval);
        tokio::pin!(keep_alive_delay);

        // output mailbox: every outbound packet funnels through here and is
        // written to the wire in mailbox order
        let (out_tx, mut out_rx) = mpsc::unbounded::<Packet>();

        self.retransmit(&out_tx).await;

        loop {
            let has_credit = self.session.out_inflight.read().await.has_credit();

            tokio::select! {
                _ = keep_alive_delay.as_mut() => {
                    return Err(Reason::ConnectKeepaliveTimeout);
                }

                msg = self.rx.next() => {
                    match msg {
                        Some(Message::Kick(done, by_id)) => {
                            log::debug!("{:?} kicked by {:?}", self.session.id, by_id);
                            flags.insert(StateFlags::Kicked);
                            self.kick_reply = Some(done);
                            return Err(Reason::ConnectKicked);
                        }
                        Some(Message::Terminate(reason)) => {
                            return Err(reason);
                        }
                        None => {
                            return Err(Reason::TransportError("session channel closed".into()));
                        }
                    }
                }

                pkt = sink.next() => {
                    keep_alive_delay.as_mut().reset(Instant::now() + keep_alive_interval);
                    match pkt {
                        Some(Ok(pkt)) => {
                            if self.handle_packet(pkt, &out_tx).await? {
                                flags.insert(StateFlags::DisconnectReceived);
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => {
                            return Err(match e.downcast_ref::<MqttError>() {
                                Some(MqttError::Decode(_)) => Reason::protocol_violation(e.to_string()),
                                _ => Reason::TransportError(e.to_string().into()),
                            });
                        }
                        None => {
                            return Err(Reason::ConnectRemoteClose);
                        }
                    }
                }

                Some(pkt) = out_rx.next() => {
                    sink.send(pkt).await.map_err(|e| Reason::TransportError(e.to_string().into()))?;
                }

                p = self.session.burst_queue.pop_wait() => {
                    let _ = out_tx.unbounded_send(Packet::Publish(p));
                }

                p = self.session.deliver_queue.pop_wait(), if has_credit => {
                    self.deliver(p, &out_tx).await;
                }
            }
        }
    }

    /// Unfinished QoS state from a previous binding of this session goes out
    /// again first, marked as duplicates.
    async fn retransmit(&self, out_tx: &mpsc::UnboundedSender<Packet>) {
        let out = self.session.out_inflight.read().await;
        for (packet_id, m) in out.iter() {
            match m.status {
                OutboundStatus::AwaitingAck | OutboundStatus::AwaitingRec => {
                    let mut p = m.publish.clone();
                    p.dup = true;
                    p.packet_id = Some(*packet_id);
                    let _ = out_tx.unbounded_send(Packet::Publish(p));
                }
                OutboundStatus::AwaitingComp => {
                    let _ = out_tx.unbounded_send(Packet::PublishRelease { packet_id: *packet_id });
                }
            }
        }
    }

    /// Broker-side dispatch of one inbound packet. `Ok(true)` is an orderly
    /// DISCONNECT.
    async fn handle_packet(
        &mut self,
        pkt: Packet,
        out_tx: &mpsc::UnboundedSender<Packet>,
    ) -> std::result::Result<bool, Reason> {
        match pkt {
            Packet::Publish(publish) => {
                self.handle_publish(publish, out_tx).await?;
            }

            Packet::PublishAck { packet_id } => {
                let removed = {
                    let mut out = self.session.out_inflight.write().await;
                    match out.get(&packet_id).map(|m| m.status) {
                        Some(OutboundStatus::AwaitingAck) => out.remove(&packet_id),
                        _ => {
                            return Err(Reason::protocol_violation(format!(
                                "unexpected PUBACK, packet_id: {}",
                                packet_id
                            )));
                        }
                    }
                };
                if let Some(m) = removed {
                    m.complete();
                }
            }

            Packet::PublishReceived { packet_id } => {
                {
                    let mut out = self.session.out_inflight.write().await;
                    match out.get(&packet_id).map(|m| m.status) {
                        Some(OutboundStatus::AwaitingRec) => {
                            out.update_status(&packet_id, OutboundStatus::AwaitingComp);
                        }
                        _ => {
                            return Err(Reason::protocol_violation(format!(
                                "unexpected PUBREC, packet_id: {}",
                                packet_id
                            )));
                        }
                    }
                }
                let _ = out_tx.unbounded_send(Packet::PublishRelease { packet_id });
            }

            Packet::PublishComplete { packet_id } => {
                // a duplicate PUBCOMP for an already-released id is tolerated
                let removed = {
                    let mut out = self.session.out_inflight.write().await;
                    match out.get(&packet_id).map(|m| m.status) {
                        Some(OutboundStatus::AwaitingComp) => out.remove(&packet_id),
                        Some(_) => {
                            return Err(Reason::protocol_violation(format!(
                                "unexpected PUBCOMP, packet_id: {}",
                                packet_id
                            )));
                        }
                        None => None,
                    }
                };
                if let Some(m) = removed {
                    m.complete();
                }
            }

            Packet::PublishRelease { packet_id } => {
                // duplicates tolerated: the entry may already be gone
                self.session.in_inflight.write().await.remove(&packet_id);
                let _ = out_tx.unbounded_send(Packet::PublishComplete { packet_id });
            }

            Packet::Subscribe { packet_id, topic_filters } => {
                if topic_filters.is_empty() {
                    return Err(Reason::protocol_violation("SUBSCRIBE with no topic filters"));
                }
                let mut status = Vec::with_capacity(topic_filters.len());
                for (topic_filter, qos) in topic_filters {
                    match self.subscribe(topic_filter, qos).await {
                        Ok(granted) => status.push(SubscribeReturnCode::Success(granted)),
                        Err(e) => {
                            log::debug!("{:?} subscribe failed, {:?}", self.session.id, e);
                            status.push(SubscribeReturnCode::Failure);
                        }
                    }
                }
                let _ = out_tx.unbounded_send(Packet::SubscribeAck { packet_id, status });
            }

            Packet::Unsubscribe { packet_id, topic_filters } => {
                for topic_filter in topic_filters {
                    self.unsubscribe(&topic_filter).await;
                }
                let _ = out_tx.unbounded_send(Packet::UnsubscribeAck { packet_id });
            }

            Packet::PingRequest => {
                let _ = out_tx.unbounded_send(Packet::PingResponse);
            }

            Packet::Disconnect => {
                // orderly shutdown drops the will
                self.will = None;
                return Ok(true);
            }

            pkt => {
                return Err(Reason::protocol_violation(format!(
                    "unexpected packet, type: {}",
                    pkt.packet_type()
                )));
            }
        }
        Ok(false)
    }

    async fn handle_publish(
        &mut self,
        publish: Publish,
        out_tx: &mpsc::UnboundedSender<Packet>,
    ) -> std::result::Result<(), Reason> {
        match Topic::from_str(&publish.topic) {
            Ok(t) if t.is_name() => {}
            _ => {
                return Err(Reason::protocol_violation(format!(
                    "invalid publish topic: {}",
                    publish.topic
                )));
            }
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.fan_out(publish).await;
            }
            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| Reason::protocol_violation("QoS 1 publish without packet id"))?;
                self.fan_out(publish).await;
                let _ = out_tx.unbounded_send(Packet::PublishAck { packet_id });
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| Reason::protocol_violation("QoS 2 publish without packet id"))?;
                // an id still pending marks a duplicate: acknowledge, don't re-route
                let fresh = self.session.in_inflight.write().await.add(packet_id);
                if fresh {
                    self.fan_out(publish).await;
                }
                let _ = out_tx.unbounded_send(Packet::PublishReceived { packet_id });
            }
        }
        Ok(())
    }

    #[inline]
    async fn fan_out(&self, publish: Publish) {
        if let Err(e) = self.scx.shared.publish(publish).await {
            log::warn!("{:?} fan out error, {:?}", self.session.id, e);
        }
    }

    async fn subscribe(&self, topic_filter: TopicFilter, qos: QoS) -> crate::Result<QoS> {
        let granted = qos.less_value(self.scx.max_qos);
        self.scx.router.add(&topic_filter, self.session.id.key, granted).await?;
        self.session.subscriptions_add(topic_filter, granted).await;
        Ok(granted)
    }

    async fn unsubscribe(&self, topic_filter: &str) {
        if let Err(e) = self.scx.router.remove(topic_filter, self.session.id.key).await {
            log::warn!("{:?} unsubscribe, error: {:?}", self.session.id, e);
        }
        self.session.subscriptions_remove(topic_filter).await;
    }

    /// Deliver one guaranteed-queue message: assign an identifier, record the
    /// in-flight state, queue the PUBLISH on the output mailbox.
    async fn deliver(&self, mut publish: Publish, out_tx: &mpsc::UnboundedSender<Packet>) {
        debug_assert!(publish.qos != QoS::AtMostOnce);

        let packet_id = self.session.alloc_packet_id().await;
        publish.packet_id = Some(packet_id);
        publish.dup = false;

        let status = match publish.qos {
            QoS::AtLeastOnce => OutboundStatus::AwaitingAck,
            _ => OutboundStatus::AwaitingRec,
        };
        self.session
            .out_inflight
            .write()
            .await
            .push(packet_id, OutInflightMessage::new(status, publish.clone()));

        let _ = out_tx.unbounded_send(Packet::Publish(publish));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn session() -> Session {
        Session::new(Id::new(1, "c1".into(), None, None), false, 16, 8, 8)
    }

    #[tokio::test]
    async fn test_alloc_packet_id_waits_for_free_slot() {
        let s = Session::new(Id::new(1, "c1".into(), None, None), false, usize::MAX, 8, 8);

        // exhaust the identifier space
        {
            let mut out = s.out_inflight.write().await;
            for _ in 0..u16::MAX {
                let id = out.next_id(|_| false).unwrap();
                out.push(
                    id,
                    OutInflightMessage::new(
                        OutboundStatus::AwaitingAck,
                        Publish {
                            dup: false,
                            retain: false,
                            qos: QoS::AtLeastOnce,
                            topic: "t".into(),
                            packet_id: None,
                            payload: bytes::Bytes::new(),
                        },
                    ),
                );
            }
        }

        let s2 = s.clone();
        let waiter = tokio::spawn(async move { s2.alloc_packet_id().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // free one slot; the waiter must return exactly that identifier
        let freed = PacketId::new(1234).unwrap();
        s.out_inflight.write().await.remove(&freed);

        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, freed);
    }

    #[tokio::test]
    async fn test_subscriptions_collapse() {
        let s = session();
        assert_eq!(s.subscriptions_add("a/+".into(), QoS::AtMostOnce).await, None);
        assert_eq!(s.subscriptions_add("a/+".into(), QoS::AtLeastOnce).await, Some(QoS::AtMostOnce));
        assert_eq!(s.subscriptions.read().await.len(), 1);
        assert_eq!(s.subscriptions_remove("a/+").await, Some(QoS::AtLeastOnce));
    }
}
