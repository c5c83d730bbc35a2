use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use relaymq_codec::{Codec, Connect, ConnectAck, ConnectAckReason, Packet, Publish, SubscribeReturnCode};

use crate::error::MqttError;
use crate::{Builder, Error, Result};

/// Marker for type-erased byte streams, so reconnecting clients can hold one
/// stream type across transport flavours.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxIo = Box<dyn Io>;

/// Request line and headers of the WebSocket upgrade, kept for the
/// authenticator.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestHead {
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequestHead {
    pub(crate) fn from_request<B>(req: &tokio_tungstenite::tungstenite::http::Request<B>) -> Self {
        Self {
            uri: req.uri().to_string(),
            headers: req
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// What the lower transport layers learned during their handshakes.
#[derive(Debug, Clone, Default)]
pub struct LinkInfo {
    /// Connection arrived over TLS.
    pub tls: bool,
    /// Peer certificate chain (DER), if the peer presented one.
    pub peer_certs: Option<Vec<Bytes>>,
    /// HTTP request head of the WebSocket upgrade, if any.
    pub http_head: Option<HttpRequestHead>,
}

/// A framed MQTT 3.1.1 packet stream over any byte-stream transport.
pub struct MqttStream<Io> {
    pub io: Framed<Io, Codec>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
    pub link: LinkInfo,
}

impl MqttStream<BoxIo> {
    /// Client-side plain TCP transport.
    pub async fn connect_tcp(addr: SocketAddr, cfg: Arc<Builder>) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(cfg.nodelay)?;
        Ok(MqttStream::new(Box::new(socket) as BoxIo, addr, cfg, LinkInfo::default()))
    }
}

impl<Io> MqttStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>, link: LinkInfo) -> Self {
        let codec = Codec::new(cfg.max_packet_size);
        MqttStream { io: Framed::new(io, codec), remote_addr, cfg, link }
    }

    #[inline]
    pub async fn send_disconnect(&mut self) -> Result<()> {
        self.send(Packet::Disconnect).await
    }

    #[inline]
    pub async fn send_publish(&mut self, publish: Publish) -> Result<()> {
        self.send(Packet::Publish(publish)).await
    }

    #[inline]
    pub async fn send_publish_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishAck { packet_id }).await
    }

    #[inline]
    pub async fn send_publish_received(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishReceived { packet_id }).await
    }

    #[inline]
    pub async fn send_publish_release(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishRelease { packet_id }).await
    }

    #[inline]
    pub async fn send_publish_complete(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishComplete { packet_id }).await
    }

    #[inline]
    pub async fn send_subscribe_ack(
        &mut self,
        packet_id: NonZeroU16,
        status: Vec<SubscribeReturnCode>,
    ) -> Result<()> {
        self.send(Packet::SubscribeAck { packet_id, status }).await
    }

    #[inline]
    pub async fn send_unsubscribe_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::UnsubscribeAck { packet_id }).await
    }

    #[inline]
    pub async fn send_connect(&mut self, connect: Connect) -> Result<()> {
        self.send(Packet::Connect(Box::new(connect))).await
    }

    #[inline]
    pub async fn send_connect_ack(
        &mut self,
        return_code: ConnectAckReason,
        session_present: bool,
    ) -> Result<()> {
        self.send(Packet::ConnectAck(ConnectAck { session_present, return_code })).await
    }

    #[inline]
    pub async fn send_ping_request(&mut self) -> Result<()> {
        self.send(Packet::PingRequest).await
    }

    #[inline]
    pub async fn send_ping_response(&mut self) -> Result<()> {
        self.send(Packet::PingResponse).await
    }

    #[inline]
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        let send_timeout = self.cfg.send_timeout;
        if send_timeout.is_zero() {
            self.io.send(packet).await?;
            Ok(())
        } else {
            match tokio::time::timeout(send_timeout, self.io.send(packet)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MqttError::Encode(e)),
                Err(_) => Err(MqttError::WriteTimeout),
            }?;
            Ok(())
        }
    }

    #[inline]
    pub async fn flush(&mut self) -> Result<()> {
        let send_timeout = self.cfg.send_timeout;
        if send_timeout.is_zero() {
            self.io.flush().await?;
            Ok(())
        } else {
            match tokio::time::timeout(send_timeout, self.io.flush()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MqttError::Encode(e)),
                Err(_) => Err(MqttError::FlushTimeout),
            }?;
            Ok(())
        }
    }

    #[inline]
    pub async fn close(&mut self) -> Result<()> {
        let send_timeout = self.cfg.send_timeout;
        if send_timeout.is_zero() {
            self.io.close().await?;
            Ok(())
        } else {
            match tokio::time::timeout(send_timeout, self.io.close()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MqttError::Encode(e)),
                Err(_) => Err(MqttError::CloseTimeout),
            }?;
            Ok(())
        }
    }

    /// Receive the next packet, bounded by `tm`. `Ok(None)` signals orderly
    /// close of the transport.
    #[inline]
    pub async fn recv(&mut self, tm: Duration) -> Result<Option<Packet>> {
        match tokio::time::timeout(tm, self.next()).await {
            Ok(Some(Ok(msg))) => Ok(Some(msg)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
            Err(_) => Err(MqttError::ReadTimeout.into()),
        }
    }

    /// Await the first packet of the stream, which must be CONNECT.
    #[inline]
    pub async fn recv_connect(&mut self, tm: Duration) -> Result<Box<Connect>> {
        match self.recv(tm).await {
            Ok(Some(Packet::Connect(connect))) => Ok(connect),
            Err(e) => Err(e),
            _ => Err(MqttError::InvalidProtocol.into()),
        }
    }
}

impl<Io> futures::Stream for MqttStream<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Packet>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = Pin::new(&mut self.io).poll_next(cx);
        Poll::Ready(match futures::ready!(next) {
            Some(Ok(packet)) => Some(Ok(packet)),
            Some(Err(e)) => Some(Err(Error::from(MqttError::Decode(e)))),
            None => None,
        })
    }
}
