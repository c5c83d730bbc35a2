//! Reconnecting MQTT 3.1.1 client built on the same in-flight state machine
//! and packet-identifier allocator as the broker side.
//!
//! A background task owns the transport: it establishes a connection via the
//! supplied factory, performs CONNECT/CONNACK, then races input, output and
//! keep-alive. Submitter-facing calls travel over a command channel; packet
//! identifiers are assigned only inside the connection task, so allocation
//! never races.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::{oneshot, Notify, RwLock};
use tokio::time::{sleep, Duration, Instant};

use relaymq_codec::{
    Connect, ConnectAckReason, LastWill, Packet, Publish, QoS, SubscribeReturnCode,
};
use relaymq_net::{BoxIo, Builder, MqttStream};

use crate::inflight::{Abandoned, InInflight, OutInflight, OutInflightMessage, OutboundStatus};
use crate::types::{ClientId, HashMap, PacketId, Password, Reason, TopicFilter, TopicName, UserName};
use crate::Result;

/// Builds a fresh transport for each (re)connection attempt.
pub type ConnectFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<MqttStream<BoxIo>>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub client_id: ClientId,
    pub clean_session: bool,
    /// Seconds; a PINGREQ goes out after half of this without outbound
    /// activity. Zero disables keep-alive.
    pub keep_alive: u16,
    pub username: Option<UserName>,
    pub password: Option<Password>,
    pub last_will: Option<LastWill>,
    pub reconnect_interval: Duration,
    /// Outbound in-flight window size.
    pub max_inflight: usize,
}

impl ClientOptions {
    pub fn new<C: Into<ClientId>>(client_id: C) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            last_will: None,
            reconnect_interval: Duration::from_secs(2),
            max_inflight: 16,
        }
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn username<U: Into<UserName>>(mut self, username: U) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password<P: Into<Password>>(mut self, password: P) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn last_will(mut self, last_will: LastWill) -> Self {
        self.last_will = Some(last_will);
        self
    }

    pub fn reconnect_interval(mut self, reconnect_interval: Duration) -> Self {
        self.reconnect_interval = reconnect_interval;
        self
    }

    pub fn max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }
}

enum Command {
    /// QoS 0 carries no signal; QoS 1/2 resolve on PUBACK / PUBCOMP.
    Publish(Publish, Option<oneshot::Sender<()>>),
    Subscribe(Vec<(TopicFilter, QoS)>, oneshot::Sender<Vec<SubscribeReturnCode>>),
    Unsubscribe(Vec<TopicFilter>, oneshot::Sender<()>),
    Disconnect,
}

/// Append-only log of inbound publishes with per-observer cursors. A slow
/// observer retains its unread tail; it never blocks the connection task.
pub struct MessageLog {
    entries: std::sync::RwLock<Vec<Publish>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MessageLog {
    fn new() -> Self {
        Self { entries: std::sync::RwLock::new(Vec::new()), notify: Notify::new(), closed: AtomicBool::new(false) }
    }

    fn push(&self, p: Publish) {
        if let Ok(mut entries) = self.entries.write() {
            entries.push(p);
        }
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    fn get(&self, idx: usize) -> Option<Publish> {
        self.entries.read().ok().and_then(|e| e.get(idx).cloned())
    }
}

/// A lazy, forkable stream over the client's inbound publishes.
pub struct MessageStream {
    log: Arc<MessageLog>,
    cursor: usize,
}

impl MessageStream {
    /// An independent observer positioned at this stream's current cursor.
    pub fn fork(&self) -> MessageStream {
        MessageStream { log: self.log.clone(), cursor: self.cursor }
    }

    /// Next inbound publish; `None` once the client is closed and the tail
    /// is drained.
    pub async fn recv(&mut self) -> Option<Publish> {
        loop {
            if let Some(p) = self.log.get(self.cursor) {
                self.cursor += 1;
                return Some(p);
            }
            let mut notified = pin!(self.log.notify.notified());
            notified.as_mut().enable();
            if let Some(p) = self.log.get(self.cursor) {
                self.cursor += 1;
                return Some(p);
            }
            if self.log.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

struct ClientInner {
    opts: ClientOptions,
    log: Arc<MessageLog>,
    out_inflight: RwLock<OutInflight>,
    in_inflight: RwLock<InInflight>,
    closed: AtomicBool,
}

/// Handle to the background connection task. Dropping every clone closes
/// the command channel, which stops the task.
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl MqttClient {
    /// Spawn the reconnecting connection task and hand back the client.
    pub fn connect(opts: ClientOptions, factory: ConnectFactory) -> MqttClient {
        let (cmd_tx, cmd_rx) = mpsc::unbounded();
        let max_inflight = opts.max_inflight;
        let inner = Arc::new(ClientInner {
            opts,
            log: Arc::new(MessageLog::new()),
            out_inflight: RwLock::new(OutInflight::new(max_inflight)),
            in_inflight: RwLock::new(InInflight::new()),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(client_loop(inner.clone(), factory, cmd_rx));
        MqttClient { inner, cmd_tx }
    }

    /// Plain TCP convenience constructor.
    pub fn connect_tcp(addr: SocketAddr, opts: ClientOptions) -> MqttClient {
        let cfg = Arc::new(Builder::new());
        let factory: ConnectFactory =
            Arc::new(move || MqttStream::connect_tcp(addr, cfg.clone()).boxed());
        Self::connect(opts, factory)
    }

    /// QoS 0 returns as soon as the message is queued; QoS 1/2 resolve when
    /// the corresponding PUBACK / PUBCOMP arrives.
    pub async fn publish<T, P>(&self, qos: QoS, retain: bool, topic: T, payload: P) -> Result<()>
    where
        T: Into<TopicName>,
        P: Into<Bytes>,
    {
        let publish = Publish {
            dup: false,
            retain,
            qos,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        };
        if qos == QoS::AtMostOnce {
            self.cmd_tx.unbounded_send(Command::Publish(publish, None)).map_err(|_| Abandoned)?;
            Ok(())
        } else {
            let (done_tx, done_rx) = oneshot::channel();
            self.cmd_tx
                .unbounded_send(Command::Publish(publish, Some(done_tx)))
                .map_err(|_| Abandoned)?;
            done_rx.await.map_err(|_| Abandoned)?;
            Ok(())
        }
    }

    /// Blocks until SUBACK; returns the per-filter grants.
    pub async fn subscribe(
        &self,
        topic_filters: Vec<(TopicFilter, QoS)>,
    ) -> Result<Vec<SubscribeReturnCode>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .unbounded_send(Command::Subscribe(topic_filters, done_tx))
            .map_err(|_| Abandoned)?;
        Ok(done_rx.await.map_err(|_| Abandoned)?)
    }

    /// Blocks until UNSUBACK.
    pub async fn unsubscribe(&self, topic_filters: Vec<TopicFilter>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .unbounded_send(Command::Unsubscribe(topic_filters, done_tx))
            .map_err(|_| Abandoned)?;
        done_rx.await.map_err(|_| Abandoned)?;
        Ok(())
    }

    /// Inbound publishes from this point on.
    pub fn messages(&self) -> MessageStream {
        MessageStream { log: self.inner.log.clone(), cursor: self.inner.log.len() }
    }

    /// Orderly shutdown: DISCONNECT, close the transport, stop reconnecting.
    pub fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.unbounded_send(Command::Disconnect);
    }
}

enum ConnExit {
    Stop,
    Lost(Reason),
}

async fn client_loop(
    inner: Arc<ClientInner>,
    factory: ConnectFactory,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        let mut sink = match (factory)().await {
            Ok(sink) => sink,
            Err(e) => {
                log::warn!("{:?} connect failed, {:?}", inner.opts.client_id, e);
                sleep(inner.opts.reconnect_interval).await;
                continue;
            }
        };

        let connect = Connect {
            protocol: Default::default(),
            clean_session: inner.opts.clean_session,
            keep_alive: inner.opts.keep_alive,
            last_will: inner.opts.last_will.clone(),
            client_id: inner.opts.client_id.clone(),
            username: inner.opts.username.clone(),
            password: inner.opts.password.clone(),
        };
        if let Err(e) = sink.send_connect(connect).await {
            log::warn!("{:?} send CONNECT failed, {:?}", inner.opts.client_id, e);
            sleep(inner.opts.reconnect_interval).await;
            continue;
        }

        let session_present = match sink.recv(sink.cfg.handshake_timeout).await {
            Ok(Some(Packet::ConnectAck(ack))) => {
                if ack.return_code == ConnectAckReason::ConnectionAccepted {
                    ack.session_present
                } else {
                    log::warn!("{:?} {}", inner.opts.client_id, ack.return_code.reason());
                    sleep(inner.opts.reconnect_interval).await;
                    continue;
                }
            }
            other => {
                log::warn!("{:?} CONNACK not received, {:?}", inner.opts.client_id, other);
                sleep(inner.opts.reconnect_interval).await;
                continue;
            }
        };
        log::debug!("{:?} connected, session_present: {}", inner.opts.client_id, session_present);

        match run_connection(&inner, &mut sink, &mut cmd_rx).await {
            ConnExit::Stop => break,
            ConnExit::Lost(reason) => {
                log::info!("{:?} connection lost: {}", inner.opts.client_id, reason);
                let _ = sink.close().await;
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                if inner.opts.clean_session {
                    // the broker discarded the session; so do we
                    inner.out_inflight.write().await.clear();
                }
                sleep(inner.opts.reconnect_interval).await;
            }
        }
    }

    // no further connection will confirm anything; unblock the submitters
    inner.out_inflight.write().await.clear();
    inner.log.close();
}

enum Pending {
    Sub(oneshot::Sender<Vec<SubscribeReturnCode>>),
    Unsub(oneshot::Sender<()>),
}

async fn run_connection(
    inner: &Arc<ClientInner>,
    sink: &mut MqttStream<BoxIo>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> ConnExit {
    // SUBSCRIBE/UNSUBSCRIBE awaiting their acks; dropped on connection loss,
    // which surfaces as abandonment to the submitters
    let mut pending: HashMap<PacketId, Pending> = HashMap::default();
    // QoS >= 1 publishes parked while the in-flight window is full; only
    // these wait for credit, control commands never do
    let mut deferred: VecDeque<(Publish, Option<oneshot::Sender<()>>)> = VecDeque::new();
    let (out_tx, mut out_rx) = mpsc::unbounded::<Packet>();

    // half the keep-alive window with no outbound traffic triggers a ping
    let ping_interval = if inner.opts.keep_alive == 0 {
        Duration::from_secs(u32::MAX as u64)
    } else {
        Duration::from_millis(u64::from(inner.opts.keep_alive) * 1000 / 2)
    };
    let ping_delay = sleep(ping_interval);
    tokio::pin!(ping_delay);
    let mut activity = false;

    retransmit(inner, &out_tx).await;

    loop {
        let has_credit = inner.out_inflight.read().await.has_credit();

        tokio::select! {
            _ = ping_delay.as_mut() => {
                if !std::mem::replace(&mut activity, false) {
                    let _ = out_tx.unbounded_send(Packet::PingRequest);
                }
                ping_delay.as_mut().reset(Instant::now() + ping_interval);
            }

            _ = futures::future::ready(()), if has_credit && !deferred.is_empty() => {
                if let Some((publish, done)) = deferred.pop_front() {
                    deliver_publish(inner, publish, done, &pending, &out_tx).await;
                }
            }

            cmd = cmd_rx.next() => {
                match cmd {
                    None => return ConnExit::Stop,
                    Some(Command::Disconnect) => {
                        let _ = sink.send_disconnect().await;
                        let _ = sink.close().await;
                        return ConnExit::Stop;
                    }
                    Some(Command::Publish(publish, done)) => {
                        if publish.qos == QoS::AtMostOnce {
                            let _ = out_tx.unbounded_send(Packet::Publish(publish));
                        } else if has_credit && deferred.is_empty() {
                            deliver_publish(inner, publish, done, &pending, &out_tx).await;
                        } else {
                            // keeps QoS >= 1 publishes in submission order
                            deferred.push_back((publish, done));
                        }
                    }
                    Some(Command::Subscribe(topic_filters, done)) => {
                        let packet_id = alloc_id(inner, &pending).await;
                        pending.insert(packet_id, Pending::Sub(done));
                        let _ = out_tx.unbounded_send(Packet::Subscribe { packet_id, topic_filters });
                    }
                    Some(Command::Unsubscribe(topic_filters, done)) => {
                        let packet_id = alloc_id(inner, &pending).await;
                        pending.insert(packet_id, Pending::Unsub(done));
                        let _ = out_tx.unbounded_send(Packet::Unsubscribe { packet_id, topic_filters });
                    }
                }
            }

            pkt = sink.next() => {
                match pkt {
                    Some(Ok(pkt)) => {
                        if let Err(reason) = handle_inbound(inner, pkt, &mut pending, &out_tx).await {
                            return ConnExit::Lost(reason);
                        }
                    }
                    Some(Err(e)) => {
                        return ConnExit::Lost(Reason::TransportError(e.to_string().into()));
                    }
                    None => {
                        return ConnExit::Lost(Reason::ConnectRemoteClose);
                    }
                }
            }

            Some(pkt) = out_rx.next() => {
                if let Err(e) = sink.send(pkt).await {
                    return ConnExit::Lost(Reason::TransportError(e.to_string().into()));
                }
                activity = true;
            }
        }
    }
}

/// Assign an identifier to a QoS >= 1 publish, record the in-flight state
/// with the submitter's signal, queue the PUBLISH on the output mailbox.
async fn deliver_publish(
    inner: &Arc<ClientInner>,
    mut publish: Publish,
    done: Option<oneshot::Sender<()>>,
    pending: &HashMap<PacketId, Pending>,
    out_tx: &mpsc::UnboundedSender<Packet>,
) {
    let packet_id = alloc_id(inner, pending).await;
    publish.packet_id = Some(packet_id);
    let status = match publish.qos {
        QoS::AtLeastOnce => OutboundStatus::AwaitingAck,
        _ => OutboundStatus::AwaitingRec,
    };
    let mut m = OutInflightMessage::new(status, publish.clone());
    if let Some(done) = done {
        m = m.with_signal(done);
    }
    inner.out_inflight.write().await.push(packet_id, m);
    let _ = out_tx.unbounded_send(Packet::Publish(publish));
}

/// Identifier allocation happens only here, in the connection task, against
/// both in-flight maps and the pending (UN)SUBSCRIBE acks.
async fn alloc_id(inner: &Arc<ClientInner>, pending: &HashMap<PacketId, Pending>) -> PacketId {
    loop {
        let freed = {
            let mut out = inner.out_inflight.write().await;
            let inbound = inner.in_inflight.read().await;
            if let Some(id) = out.next_id(|p| inbound.contains(&p) || pending.contains_key(&p)) {
                return id;
            }
            out.freed()
        };
        let mut notified = pin!(freed.notified());
        notified.as_mut().enable();
        {
            let mut out = inner.out_inflight.write().await;
            let inbound = inner.in_inflight.read().await;
            if let Some(id) = out.next_id(|p| inbound.contains(&p) || pending.contains_key(&p)) {
                return id;
            }
        }
        notified.await;
    }
}

async fn retransmit(inner: &Arc<ClientInner>, out_tx: &mpsc::UnboundedSender<Packet>) {
    let out = inner.out_inflight.read().await;
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

async fn handle_inbound(
    inner: &Arc<ClientInner>,
    pkt: Packet,
    pending: &mut HashMap<PacketId, Pending>,
    out_tx: &mpsc::UnboundedSender<Packet>,
) -> std::result::Result<(), Reason> {
    match pkt {
        Packet::Publish(publish) => match publish.qos {
            QoS::AtMostOnce => {
                inner.log.push(publish);
            }
            QoS::AtLeastOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| Reason::protocol_violation("QoS 1 publish without packet id"))?;
                inner.log.push(publish);
                let _ = out_tx.unbounded_send(Packet::PublishAck { packet_id });
            }
            QoS::ExactlyOnce => {
                let packet_id = publish
                    .packet_id
                    .ok_or_else(|| Reason::protocol_violation("QoS 2 publish without packet id"))?;
                let fresh = inner.in_inflight.write().await.add(packet_id);
                if fresh {
                    inner.log.push(publish);
                }
                let _ = out_tx.unbounded_send(Packet::PublishReceived { packet_id });
            }
        },

        Packet::PublishRelease { packet_id } => {
            inner.in_inflight.write().await.remove(&packet_id);
            let _ = out_tx.unbounded_send(Packet::PublishComplete { packet_id });
        }

        Packet::PublishAck { packet_id } => {
            let removed = {
                let mut out = inner.out_inflight.write().await;
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
                let mut out = inner.out_inflight.write().await;
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
            let removed = {
                let mut out = inner.out_inflight.write().await;
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

        Packet::SubscribeAck { packet_id, status } => match pending.remove(&packet_id) {
            Some(Pending::Sub(done)) => {
                let _ = done.send(status);
            }
            _ => {
                return Err(Reason::protocol_violation(format!(
                    "unexpected SUBACK, packet_id: {}",
                    packet_id
                )));
            }
        },

        Packet::UnsubscribeAck { packet_id } => match pending.remove(&packet_id) {
            Some(Pending::Unsub(done)) => {
                let _ = done.send(());
            }
            _ => {
                return Err(Reason::protocol_violation(format!(
                    "unexpected UNSUBACK, packet_id: {}",
                    packet_id
                )));
            }
        },

        Packet::PingResponse => {}

        pkt => {
            return Err(Reason::protocol_violation(format!(
                "unexpected packet, type: {}",
                pkt.packet_type()
            )));
        }
    }
    Ok(())
}
