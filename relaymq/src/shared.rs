use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use relaymq_codec::{Publish, QoS};

use crate::router::Router;
use crate::session::Session;
use crate::store::SessionStore;
use crate::types::{ClientId, DashMap, Id, Message, Reason, SessionKey, Tx, UserName};
use crate::Result;

#[derive(Clone)]
struct Peer {
    session: Session,
    tx: Option<Tx>,
}

/// The broker's session directory.
///
/// `peers` holds every routable session by key, attached or detached;
/// `clients` indexes the currently attached ones by client identifier.
/// Detached persistent sessions additionally go through the [`SessionStore`]
/// seam. Registry operations per client id are serialized by `lockers`, so
/// a takeover settles before the next CONNECT for the same id proceeds.
#[derive(Clone)]
pub struct Shared {
    router: Router,
    store: Arc<dyn SessionStore>,
    lockers: Arc<DashMap<ClientId, Arc<Mutex<()>>>>,
    peers: Arc<DashMap<SessionKey, Peer>>,
    clients: Arc<DashMap<ClientId, SessionKey>>,
    next_key: Arc<AtomicU64>,
}

impl Shared {
    #[inline]
    pub fn new(router: Router, store: Arc<dyn SessionStore>) -> Shared {
        Self {
            router,
            store,
            lockers: Arc::new(DashMap::default()),
            peers: Arc::new(DashMap::default()),
            clients: Arc::new(DashMap::default()),
            next_key: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Locate or create the session for a CONNECT, kicking out any
    /// connection currently bound to the same client identifier.
    ///
    /// Returns the session and the CONNACK `session_present` flag.
    pub async fn open_session(
        &self,
        client_id: ClientId,
        clean_session: bool,
        remote_addr: Option<SocketAddr>,
        username: Option<UserName>,
        max_inflight: usize,
        max_burst_len: usize,
        max_mqueue_len: usize,
    ) -> Result<(Session, bool)> {
        let locker =
            self.lockers.entry(client_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let _guard = locker.lock().await;

        // previous owner of this client id, live or stored
        let mut prev = None;
        if let Some(key) = self.clients.get(&client_id).map(|e| *e.value()) {
            if let Some(peer) = self.peers.get(&key).map(|e| e.value().clone()) {
                if let Some(tx) = &peer.tx {
                    self.kick(tx.clone(), &client_id).await;
                }
                prev = Some(peer.session);
            }
            self.clients.remove(&client_id);
        } else if let Some(session) = self.store.load(&client_id).await {
            prev = Some(session);
        }

        let (session, session_present) = if clean_session {
            if let Some(prev) = prev.take() {
                self.close_session(&prev).await;
            }
            (self.create(client_id.clone(), true, remote_addr, username, max_inflight, max_burst_len, max_mqueue_len), false)
        } else if let Some(prev) = prev {
            log::debug!("{:?} session resumed", prev.id);
            self.peers.insert(prev.id.key, Peer { session: prev.clone(), tx: None });
            (prev, true)
        } else {
            (self.create(client_id.clone(), false, remote_addr, username, max_inflight, max_burst_len, max_mqueue_len), false)
        };

        self.clients.insert(client_id, session.id.key);
        Ok((session, session_present))
    }

    fn create(
        &self,
        client_id: ClientId,
        clean_session: bool,
        remote_addr: Option<SocketAddr>,
        username: Option<UserName>,
        max_inflight: usize,
        max_burst_len: usize,
        max_mqueue_len: usize,
    ) -> Session {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst) + 1;
        let id = Id::new(key, client_id, remote_addr, username);
        log::debug!("{:?} session created", id);
        let session = Session::new(id, clean_session, max_inflight, max_burst_len, max_mqueue_len);
        self.peers.insert(key, Peer { session: session.clone(), tx: None });
        session
    }

    /// Exclusively bind a connection task group to the session.
    #[inline]
    pub fn bind(&self, key: SessionKey, tx: Tx) {
        if let Some(mut peer) = self.peers.get_mut(&key) {
            peer.tx = Some(tx);
        }
    }

    /// Cancel the old connection and wait for its transport to be released.
    async fn kick(&self, tx: Tx, client_id: &ClientId) {
        let (done_tx, done_rx) = oneshot::channel();
        if tx.unbounded_send(Message::Kick(done_tx, client_id.clone())).is_ok() {
            match tokio::time::timeout(Duration::from_secs(5), done_rx).await {
                Ok(Ok(())) => {
                    log::debug!("{:?} kicked", client_id);
                }
                Ok(Err(e)) => {
                    log::warn!("{:?} kick, recv result is {:?}", client_id, e);
                }
                Err(_) => {
                    log::warn!("{:?} kick, recv result is Timeout", client_id);
                }
            }
        }
    }

    /// A persistent session lost its connection; it stays routable and its
    /// latest state goes to the store.
    pub async fn detach(&self, session: &Session) {
        let key = session.id.key;
        match self.peers.get_mut(&key) {
            Some(mut peer) => peer.tx = None,
            // already closed (terminated or taken over); nothing to keep
            None => return,
        }
        self.clients.remove_if(&session.id.client_id, |_, k| *k == key);
        self.store.save(session.clone()).await;
        log::debug!("{:?} session detached", session.id);
    }

    /// Remove the session everywhere: registry, trie, store. Pending
    /// submitters observe abandonment.
    pub async fn close_session(&self, session: &Session) {
        let key = session.id.key;
        self.clients.remove_if(&session.id.client_id, |_, k| *k == key);
        self.peers.remove(&key);
        self.router.remove_all(key).await;
        self.store.delete(&session.id.client_id).await;
        session.abandon().await;
        log::debug!("{:?} session closed", session.id);
    }

    /// Guaranteed queue overflow or administrative close: the session dies,
    /// and a bound connection is told to stop.
    pub async fn terminate(&self, key: SessionKey, reason: Reason) {
        let peer = match self.peers.get(&key).map(|e| e.value().clone()) {
            Some(peer) => peer,
            None => return,
        };
        log::warn!("{:?} session terminated, reason: {}", peer.session.id, reason);
        self.close_session(&peer.session).await;
        if let Some(tx) = peer.tx {
            let _ = tx.unbounded_send(Message::Terminate(reason));
        }
    }

    /// Route one publish to every matching session (§ fan-out).
    ///
    /// Per destination the delivered QoS is `min(publish, granted)`. A full
    /// best-effort queue silently drops this message for that destination; a
    /// full guaranteed queue terminates that destination, leaving the others
    /// untouched.
    pub async fn publish(&self, publish: Publish) -> Result<()> {
        let matched = self.router.matches(&publish.topic).await?;
        for (key, granted) in matched {
            let peer = match self.peers.get(&key).map(|e| e.value().clone()) {
                Some(peer) => peer,
                None => continue,
            };

            let mut p = publish.clone();
            p.dup = false;
            p.retain = false;
            p.packet_id = None;
            p.qos = p.qos.less_value(granted);

            if p.qos == QoS::AtMostOnce {
                if peer.session.burst_queue.push(p).is_err() {
                    log::debug!("{:?} burst queue is full, message dropped", peer.session.id);
                }
            } else if peer.session.deliver_queue.push(p).is_err() {
                self.terminate(key, Reason::MessageQueueFull).await;
            }
        }
        Ok(())
    }

    #[inline]
    pub fn session(&self, key: SessionKey) -> Option<Session> {
        self.peers.get(&key).map(|e| e.value().session.clone())
    }

    #[inline]
    pub fn session_by_client(&self, client_id: &str) -> Option<Session> {
        self.clients.get(client_id).and_then(|e| self.session(*e.value()))
    }

    #[inline]
    pub fn tx(&self, key: SessionKey) -> Option<Tx> {
        self.peers.get(&key).and_then(|e| e.value().tx.clone())
    }

    #[inline]
    pub fn exist(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Routable sessions, attached and detached.
    #[inline]
    pub fn sessions_count(&self) -> usize {
        self.peers.len()
    }

    /// Currently attached sessions.
    #[inline]
    pub fn clients_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::store::MemoryStore;

    use super::*;

    fn shared() -> Shared {
        Shared::new(Router::new(), Arc::new(MemoryStore::new()))
    }

    fn publish(topic: &'static str, qos: QoS) -> Publish {
        Publish {
            dup: false,
            retain: false,
            qos,
            topic: topic.into(),
            packet_id: None,
            payload: Bytes::from_static(b"m"),
        }
    }

    #[tokio::test]
    async fn test_open_session_clean_discards_state() {
        let s = shared();
        let (s1, present) = s.open_session("c".into(), false, None, None, 16, 8, 8).await.unwrap();
        assert!(!present);
        s.detach(&s1).await;

        // reconnect without clean session resumes
        let (s2, present) = s.open_session("c".into(), false, None, None, 16, 8, 8).await.unwrap();
        assert!(present);
        assert_eq!(s2.id.key, s1.id.key);
        s.detach(&s2).await;

        // clean session destroys the stored state
        let (s3, present) = s.open_session("c".into(), true, None, None, 16, 8, 8).await.unwrap();
        assert!(!present);
        assert_ne!(s3.id.key, s1.id.key);
    }

    #[tokio::test]
    async fn test_fan_out_downgrades_qos() {
        let s = shared();
        let (sub, _) = s.open_session("sub".into(), true, None, None, 16, 8, 8).await.unwrap();
        s.router.add("a/+", sub.id.key, QoS::AtMostOnce).await.unwrap();

        s.publish(publish("a/b", QoS::ExactlyOnce)).await.unwrap();

        let got = sub.burst_queue.pop().expect("queued");
        assert_eq!(got.qos, QoS::AtMostOnce);
        assert_eq!(got.topic, "a/b");
        assert!(got.packet_id.is_none());
        assert!(sub.deliver_queue.is_empty());
    }

    #[tokio::test]
    async fn test_guaranteed_overflow_terminates_only_that_session() {
        let s = shared();
        let (bad, _) = s.open_session("bad".into(), false, None, None, 16, 8, 1).await.unwrap();
        let (good, _) = s.open_session("good".into(), false, None, None, 16, 8, 8).await.unwrap();
        s.router.add("t", bad.id.key, QoS::AtLeastOnce).await.unwrap();
        s.router.add("t", good.id.key, QoS::AtLeastOnce).await.unwrap();

        s.publish(publish("t", QoS::AtLeastOnce)).await.unwrap();
        s.publish(publish("t", QoS::AtLeastOnce)).await.unwrap();

        // the overflowing session is gone from the registry
        assert!(s.session(bad.id.key).is_none());
        assert!(!s.exist("bad"));

        // the healthy one keeps both messages
        assert_eq!(good.deliver_queue.len(), 2);
        assert!(s.session(good.id.key).is_some());
    }

    #[tokio::test]
    async fn test_detached_session_keeps_receiving() {
        let s = shared();
        let (sub, _) = s.open_session("sub".into(), false, None, None, 16, 8, 8).await.unwrap();
        s.router.add("t/#", sub.id.key, QoS::AtLeastOnce).await.unwrap();
        s.detach(&sub).await;

        s.publish(publish("t/x", QoS::AtLeastOnce)).await.unwrap();
        assert_eq!(sub.deliver_queue.len(), 1);
    }
}
