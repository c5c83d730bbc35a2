//! Broker-side MQTT 3.1.1 connection workflow: first-packet CONNECT,
//! authentication, session open or takeover, CONNACK, then the long-running
//! session event loop.

use scopeguard::defer;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use relaymq_codec::ConnectAckReason;
use relaymq_net::MqttStream;

use crate::auth::AuthRequest;
use crate::context::ServerContext;
use crate::session::SessionState;
use crate::types::ClientId;
use crate::{Error, Result};

enum HandshakeError {
    /// CONNECT was seen but refused; the peer gets a CONNACK with the code.
    Refused(ConnectAckReason, Error),
    /// Protocol violation or authenticator failure; close without CONNACK.
    Fatal(Error),
}

pub(crate) async fn process<Io>(scx: ServerContext, mut sink: MqttStream<Io>) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let state = {
        scx.handshakings.inc();
        defer! {
            scx.handshakings.dec();
        }

        match handshake(&scx, &mut sink).await {
            Ok(state) => state,
            Err(HandshakeError::Refused(ack_code, e)) => {
                log::info!(
                    "Connection Refused, remote_addr: {:?}, ack_code: {:?}, reason: {:?}",
                    sink.remote_addr,
                    ack_code,
                    e
                );
                let _ = sink.send_connect_ack(ack_code, false).await;
                let _ = sink.close().await;
                return Err(e);
            }
            Err(HandshakeError::Fatal(e)) => {
                log::info!("Connection Refused, remote_addr: {:?}, reason: {:?}", sink.remote_addr, e);
                let _ = sink.close().await;
                return Err(e);
            }
        }
    };

    state.run(sink).await
}

async fn handshake<Io>(
    scx: &ServerContext,
    sink: &mut MqttStream<Io>,
) -> std::result::Result<SessionState, HandshakeError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let cfg = sink.cfg.clone();

    // anything other than a well-formed CONNECT closes the stream silently
    let mut c = sink.recv_connect(cfg.handshake_timeout).await.map_err(HandshakeError::Fatal)?;

    log::debug!(
        "new Connection: remote_addr: {:?}, client_id: {:?}, clean_session: {}, keep_alive: {}",
        sink.remote_addr,
        c.client_id,
        c.clean_session,
        c.keep_alive
    );

    if c.keep_alive == 0 && !cfg.allow_zero_keepalive {
        return Err(HandshakeError::Refused(
            ConnectAckReason::ServiceUnavailable,
            anyhow::anyhow!("zero keepalive is not allowed"),
        ));
    }
    if c.keep_alive != 0 && (c.keep_alive < cfg.min_keepalive || c.keep_alive > cfg.max_keepalive) {
        return Err(HandshakeError::Refused(
            ConnectAckReason::ServiceUnavailable,
            anyhow::anyhow!("keepalive {} out of bounds", c.keep_alive),
        ));
    }

    if c.client_id.is_empty() {
        if c.clean_session {
            c.client_id = ClientId::from(
                Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_owned(),
            );
        } else {
            return Err(HandshakeError::Refused(
                ConnectAckReason::IdentifierRejected,
                anyhow::anyhow!("empty client id without clean session"),
            ));
        }
    }

    if cfg.max_clientid_len > 0 && c.client_id.len() > cfg.max_clientid_len {
        return Err(HandshakeError::Refused(
            ConnectAckReason::IdentifierRejected,
            anyhow::anyhow!("client_id is too long"),
        ));
    }

    if !cfg.allow_anonymous && c.username.is_none() {
        return Err(HandshakeError::Refused(
            ConnectAckReason::NotAuthorized,
            anyhow::anyhow!("anonymous connections are not allowed"),
        ));
    }

    let auth_req = AuthRequest {
        client_id: c.client_id.clone(),
        clean_session: c.clean_session,
        username: c.username.clone(),
        password: c.password.clone(),
        http_head: sink.link.http_head.clone(),
        tls: sink.link.tls,
        peer_certs: sink.link.peer_certs.clone(),
    };
    let principal = match scx.auth.authenticate(&auth_req).await {
        // an authenticator crash must not leak its error class to the peer
        Err(e) => return Err(HandshakeError::Fatal(e)),
        Ok(None) => {
            return Err(HandshakeError::Refused(
                ConnectAckReason::NotAuthorized,
                anyhow::anyhow!("authentication rejected"),
            ));
        }
        Ok(Some(principal)) => principal,
    };
    log::debug!("{:?} authenticated as {:?}", c.client_id, principal.name);

    let (session, session_present) = scx
        .shared
        .open_session(
            c.client_id.clone(),
            c.clean_session,
            Some(sink.remote_addr),
            c.username.clone(),
            cfg.max_inflight.get() as usize,
            cfg.max_burst_len,
            cfg.max_mqueue_len,
        )
        .await
        .map_err(|e| HandshakeError::Refused(ConnectAckReason::ServiceUnavailable, e))?;

    let state = SessionState::new(scx.clone(), session, c.last_will.take(), c.keep_alive, c.clean_session);
    scx.shared.bind(state.session.id.key, state.tx().clone());

    sink.send_connect_ack(ConnectAckReason::ConnectionAccepted, session_present)
        .await
        .map_err(HandshakeError::Fatal)?;

    Ok(state)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::num::NonZeroU16;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use bytestring::ByteString;
    use tokio::io::DuplexStream;

    use relaymq_codec::{Connect, LastWill, Packet, Publish, QoS, SubscribeReturnCode};
    use relaymq_net::{Builder, LinkInfo, MqttStream};

    use super::*;
    use crate::auth::{AuthRequest, Authenticator, Principal};
    use crate::context::ServerContext;

    const TM: Duration = Duration::from_secs(5);

    fn pid(n: u16) -> NonZeroU16 {
        NonZeroU16::new(n).unwrap()
    }

    fn attach(scx: &ServerContext, cfg: Arc<Builder>, buf: usize) -> MqttStream<DuplexStream> {
        let (a, b) = tokio::io::duplex(buf);
        let laddr: SocketAddr = ([127, 0, 0, 1], 1883).into();
        tokio::spawn(process(scx.clone(), MqttStream::new(a, laddr, cfg.clone(), LinkInfo::default())));
        MqttStream::new(b, laddr, cfg, LinkInfo::default())
    }

    fn connect_packet(client_id: &str, clean_session: bool, keep_alive: u16) -> Connect {
        Connect {
            protocol: Default::default(),
            clean_session,
            keep_alive,
            last_will: None,
            client_id: ByteString::from(client_id.to_owned()),
            username: None,
            password: None,
        }
    }

    async fn connect(
        scx: &ServerContext,
        cfg: Arc<Builder>,
        client_id: &str,
        clean_session: bool,
    ) -> (MqttStream<DuplexStream>, bool) {
        let mut c = attach(scx, cfg, 64 * 1024);
        c.send_connect(connect_packet(client_id, clean_session, 30)).await.unwrap();
        match c.recv(TM).await.unwrap() {
            Some(Packet::ConnectAck(ack)) => {
                assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted);
                (c, ack.session_present)
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(c: &mut MqttStream<DuplexStream>, id: u16, filter: &str, qos: QoS) {
        c.send(Packet::Subscribe {
            packet_id: pid(id),
            topic_filters: vec![(ByteString::from(filter.to_owned()), qos)],
        })
        .await
        .unwrap();
        match c.recv(TM).await.unwrap() {
            Some(Packet::SubscribeAck { packet_id, status }) => {
                assert_eq!(packet_id, pid(id));
                assert_eq!(status, vec![SubscribeReturnCode::Success(qos)]);
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    fn publish(topic: &str, qos: QoS, payload: &'static [u8], id: Option<u16>) -> Publish {
        Publish {
            dup: false,
            retain: false,
            qos,
            topic: ByteString::from(topic.to_owned()),
            packet_id: id.map(pid),
            payload: Bytes::from_static(payload),
        }
    }

    async fn recv_publish(c: &mut MqttStream<DuplexStream>) -> Publish {
        match c.recv(TM).await.unwrap() {
            Some(Packet::Publish(p)) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_qos0_fan_out() {
        let scx = ServerContext::new().build();
        let cfg = Arc::new(Builder::new());

        let (mut s1, _) = connect(&scx, cfg.clone(), "s1", true).await;
        subscribe(&mut s1, 1, "a/+", QoS::AtMostOnce).await;
        let (mut s2, _) = connect(&scx, cfg.clone(), "s2", true).await;
        subscribe(&mut s2, 1, "#", QoS::AtMostOnce).await;

        let (mut p, _) = connect(&scx, cfg, "pub", true).await;
        p.send_publish(publish("a/b", QoS::AtMostOnce, b"hi", None)).await.unwrap();

        for s in [&mut s1, &mut s2] {
            let got = recv_publish(s).await;
            assert_eq!(got.topic, "a/b");
            assert_eq!(got.payload.as_ref(), b"hi");
            assert_eq!(got.qos, QoS::AtMostOnce);
        }
    }

    #[tokio::test]
    async fn test_qos2_full_handshake() {
        let scx = ServerContext::new().build();
        let cfg = Arc::new(Builder::new());

        let (mut s, _) = connect(&scx, cfg.clone(), "s", true).await;
        subscribe(&mut s, 1, "x", QoS::ExactlyOnce).await;

        let (mut p, _) = connect(&scx, cfg, "p", true).await;
        p.send_publish(publish("x", QoS::ExactlyOnce, b"P", Some(7))).await.unwrap();
        match p.recv(TM).await.unwrap() {
            Some(Packet::PublishReceived { packet_id }) => assert_eq!(packet_id, pid(7)),
            other => panic!("expected PUBREC, got {:?}", other),
        }

        // a duplicate before the release is acknowledged but not re-routed
        let mut dup = publish("x", QoS::ExactlyOnce, b"P", Some(7));
        dup.dup = true;
        p.send_publish(dup).await.unwrap();
        match p.recv(TM).await.unwrap() {
            Some(Packet::PublishReceived { packet_id }) => assert_eq!(packet_id, pid(7)),
            other => panic!("expected PUBREC, got {:?}", other),
        }

        p.send_publish_release(pid(7)).await.unwrap();
        match p.recv(TM).await.unwrap() {
            Some(Packet::PublishComplete { packet_id }) => assert_eq!(packet_id, pid(7)),
            other => panic!("expected PUBCOMP, got {:?}", other),
        }

        // subscriber side of the exactly-once exchange
        let got = recv_publish(&mut s).await;
        assert_eq!(got.qos, QoS::ExactlyOnce);
        assert_eq!(got.payload.as_ref(), b"P");
        let sub_id = got.packet_id.unwrap();
        s.send_publish_received(sub_id).await.unwrap();
        match s.recv(TM).await.unwrap() {
            Some(Packet::PublishRelease { packet_id }) => assert_eq!(packet_id, sub_id),
            other => panic!("expected PUBREL, got {:?}", other),
        }
        s.send_publish_complete(sub_id).await.unwrap();

        // exactly one copy arrived: the next message is the probe
        p.send_publish(publish("x", QoS::AtMostOnce, b"probe", None)).await.unwrap();
        assert_eq!(recv_publish(&mut s).await.payload.as_ref(), b"probe");

        // identifier 7 is reusable afterwards
        p.send_publish(publish("x", QoS::ExactlyOnce, b"again", Some(7))).await.unwrap();
        match p.recv(TM).await.unwrap() {
            Some(Packet::PublishReceived { packet_id }) => assert_eq!(packet_id, pid(7)),
            other => panic!("expected PUBREC, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wildcard_excludes_metadata_topics() {
        let scx = ServerContext::new().build();
        let cfg = Arc::new(Builder::new());

        let (mut all, _) = connect(&scx, cfg.clone(), "all", true).await;
        subscribe(&mut all, 1, "#", QoS::AtMostOnce).await;
        let (mut sys, _) = connect(&scx, cfg.clone(), "sys", true).await;
        subscribe(&mut sys, 1, "$SYS/#", QoS::AtMostOnce).await;

        let (mut p, _) = connect(&scx, cfg, "p", true).await;
        p.send_publish(publish("$SYS/info", QoS::AtMostOnce, b"i", None)).await.unwrap();
        p.send_publish(publish("plain", QoS::AtMostOnce, b"j", None)).await.unwrap();

        assert_eq!(recv_publish(&mut sys).await.topic, "$SYS/info");
        // the `#` subscriber sees only the non-metadata topic
        assert_eq!(recv_publish(&mut all).await.topic, "plain");
    }

    #[tokio::test]
    async fn test_session_takeover_keeps_subscriptions_and_suppresses_will() {
        let scx = ServerContext::new().build();
        let cfg = Arc::new(Builder::new());

        let (mut watcher, _) = connect(&scx, cfg.clone(), "watcher", true).await;
        subscribe(&mut watcher, 1, "will/t", QoS::AtMostOnce).await;

        // first owner of the client id, with a will
        let mut a = attach(&scx, cfg.clone(), 64 * 1024);
        let mut c = connect_packet("c", false, 30);
        c.last_will = Some(LastWill {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: ByteString::from_static("will/t"),
            message: Bytes::from_static(b"gone"),
        });
        a.send_connect(c).await.unwrap();
        match a.recv(TM).await.unwrap() {
            Some(Packet::ConnectAck(ack)) => assert!(!ack.session_present),
            other => panic!("expected CONNACK, got {:?}", other),
        }
        subscribe(&mut a, 1, "t/#", QoS::AtMostOnce).await;

        // takeover: same client id, new connection
        let (mut a2, session_present) = connect(&scx, cfg.clone(), "c", false).await;
        assert!(session_present);

        // the old connection is torn down
        assert!(matches!(a.recv(TM).await, Ok(None) | Err(_)));

        // subscription survived the takeover
        let (mut p, _) = connect(&scx, cfg, "p", true).await;
        p.send_publish(publish("t/x", QoS::AtMostOnce, b"m", None)).await.unwrap();
        assert_eq!(recv_publish(&mut a2).await.topic, "t/x");

        // the will was not published: the watcher's next message is the probe
        p.send_publish(publish("will/t", QoS::AtMostOnce, b"probe", None)).await.unwrap();
        assert_eq!(recv_publish(&mut watcher).await.payload.as_ref(), b"probe");
    }

    #[tokio::test]
    async fn test_will_published_on_abnormal_disconnect() {
        let scx = ServerContext::new().build();
        let cfg = Arc::new(Builder::new());

        let (mut watcher, _) = connect(&scx, cfg.clone(), "watcher", true).await;
        subscribe(&mut watcher, 1, "wt", QoS::AtMostOnce).await;

        let mut b = attach(&scx, cfg, 64 * 1024);
        let mut c = connect_packet("b", true, 30);
        c.last_will = Some(LastWill {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: ByteString::from_static("wt"),
            message: Bytes::from_static(b"crashed"),
        });
        b.send_connect(c).await.unwrap();
        assert!(matches!(b.recv(TM).await.unwrap(), Some(Packet::ConnectAck(_))));

        // drop without DISCONNECT
        drop(b);

        assert_eq!(recv_publish(&mut watcher).await.payload.as_ref(), b"crashed");
    }

    #[tokio::test]
    async fn test_orderly_disconnect_drops_will() {
        let scx = ServerContext::new().build();
        let cfg = Arc::new(Builder::new());

        let (mut watcher, _) = connect(&scx, cfg.clone(), "watcher", true).await;
        subscribe(&mut watcher, 1, "wt", QoS::AtMostOnce).await;

        let mut b = attach(&scx, cfg.clone(), 64 * 1024);
        let mut c = connect_packet("b", true, 30);
        c.last_will = Some(LastWill {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: ByteString::from_static("wt"),
            message: Bytes::from_static(b"crashed"),
        });
        b.send_connect(c).await.unwrap();
        assert!(matches!(b.recv(TM).await.unwrap(), Some(Packet::ConnectAck(_))));
        b.send_disconnect().await.unwrap();
        drop(b);

        let (mut p, _) = connect(&scx, cfg, "p", true).await;
        p.send_publish(publish("wt", QoS::AtMostOnce, b"probe", None)).await.unwrap();
        assert_eq!(recv_publish(&mut watcher).await.payload.as_ref(), b"probe");
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_timeout() {
        let scx = ServerContext::new().build();
        let cfg = Arc::new(Builder::new());

        let mut c = attach(&scx, cfg, 64 * 1024);
        c.send_connect(connect_packet("quiet", true, 10)).await.unwrap();
        assert!(matches!(c.recv(TM).await.unwrap(), Some(Packet::ConnectAck(_))));

        // then total silence; with the default backoff the broker allows
        // 1.5 x keepAlive
        let start = tokio::time::Instant::now();
        let res = c.recv(Duration::from_secs(60)).await;
        let elapsed = start.elapsed();

        assert!(matches!(res, Ok(None) | Err(_)), "connection should be torn down, got {:?}", res);
        assert!(elapsed >= Duration::from_secs(10), "torn down too early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(16), "torn down too late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_guaranteed_queue_overflow_drops_session() {
        let scx = ServerContext::new().build();
        let sub_cfg = Arc::new(Builder::new().max_mqueue_len(2).send_timeout(Duration::from_secs(1)));
        let cfg = Arc::new(Builder::new());

        // tiny transport buffer: the subscriber stops reading, its output
        // stalls, the guaranteed queue fills
        let mut s = attach(&scx, sub_cfg, 64);
        s.send_connect(connect_packet("sub", false, 30)).await.unwrap();
        assert!(matches!(s.recv(TM).await.unwrap(), Some(Packet::ConnectAck(_))));
        subscribe(&mut s, 1, "t", QoS::AtLeastOnce).await;

        let (mut p, _) = connect(&scx, cfg, "p", true).await;
        for i in 0..10u16 {
            p.send_publish(publish("t", QoS::AtLeastOnce, &[0u8; 200], Some(i + 1))).await.unwrap();
            match p.recv(TM).await.unwrap() {
                Some(Packet::PublishAck { .. }) => {}
                other => panic!("expected PUBACK, got {:?}", other),
            }
        }

        // the overflowing subscriber is dropped from the registry
        let mut gone = false;
        for _ in 0..100 {
            if !scx.shared.exist("sub") && scx.shared.session_by_client("sub").is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "session should be terminated on guaranteed queue overflow");
    }

    #[tokio::test]
    async fn test_first_packet_must_be_connect() {
        let scx = ServerContext::new().build();
        let cfg = Arc::new(Builder::new());

        let mut c = attach(&scx, cfg, 4096);
        c.send_ping_request().await.unwrap();
        // closed without any CONNACK
        assert!(matches!(c.recv(TM).await, Ok(None) | Err(_)));
    }

    struct RejectAll;

    #[async_trait::async_trait]
    impl Authenticator for RejectAll {
        async fn authenticate(&self, _req: &AuthRequest) -> crate::Result<Option<Principal>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_rejected_authentication_gets_connack() {
        let scx = ServerContext::new().authenticator(RejectAll).build();
        let cfg = Arc::new(Builder::new());

        let mut c = attach(&scx, cfg, 4096);
        c.send_connect(connect_packet("c", true, 30)).await.unwrap();
        match c.recv(TM).await.unwrap() {
            Some(Packet::ConnectAck(ack)) => {
                assert_eq!(ack.return_code, ConnectAckReason::NotAuthorized);
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_persistent_session_redelivers_after_reconnect() {
        let scx = ServerContext::new().build();
        let cfg = Arc::new(Builder::new());

        let (mut s, present) = connect(&scx, cfg.clone(), "sub", false).await;
        assert!(!present);
        subscribe(&mut s, 1, "q", QoS::AtLeastOnce).await;
        // connection drops without DISCONNECT
        drop(s);

        // give the broker a moment to detach the session
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (mut p, _) = connect(&scx, cfg.clone(), "p", true).await;
        p.send_publish(publish("q", QoS::AtLeastOnce, b"offline", Some(1))).await.unwrap();
        assert!(matches!(p.recv(TM).await.unwrap(), Some(Packet::PublishAck { .. })));

        // the reconnect resumes the session and drains the queued message
        let (mut s, present) = connect(&scx, cfg, "sub", false).await;
        assert!(present);
        let got = recv_publish(&mut s).await;
        assert_eq!(got.payload.as_ref(), b"offline");
        assert_eq!(got.qos, QoS::AtLeastOnce);
        s.send_publish_ack(got.packet_id.unwrap()).await.unwrap();
    }
}
