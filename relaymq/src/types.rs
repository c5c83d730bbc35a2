use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroU16;

use bytestring::ByteString;
use tokio::sync::oneshot;

use crate::utils::{timestamp_millis, TimestampMillis};

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/// Client identifier, unique per live session in a broker.
pub type ClientId = ByteString;
/// Topic a PUBLISH targets; never contains wildcards.
pub type TopicName = ByteString;
/// Subscription filter; may contain `+` and `#` wildcards.
pub type TopicFilter = ByteString;
/// Per-broker handle for a session, independent of the client identifier.
pub type SessionKey = u64;
/// In-flight packet identifier, `[1, 65535]`.
pub type PacketId = NonZeroU16;

pub type UserName = ByteString;
pub type Password = bytes::Bytes;

/// Control-plane sender bound to a connection task group.
pub type Tx = futures::channel::mpsc::UnboundedSender<Message>;
pub type Rx = futures::channel::mpsc::UnboundedReceiver<Message>;

/// Messages delivered to a bound connection, out of band of the transport.
#[derive(Debug)]
pub enum Message {
    /// A new connection claimed this session; wind down, reply when the
    /// transport is released, and do not publish the will.
    Kick(oneshot::Sender<()>, ClientId),
    /// The session is gone (queue overflow or administrative close).
    Terminate(Reason),
}

/// Why a connection (or session) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// Orderly DISCONNECT from the peer.
    ConnectDisconnect,
    /// Transport closed without DISCONNECT.
    ConnectRemoteClose,
    /// No inbound activity within the keep-alive window.
    ConnectKeepaliveTimeout,
    /// Session taken over by a new connection with the same client id.
    ConnectKicked,
    /// The peer broke the protocol; the connection is closed without response.
    ProtocolViolation(ByteString),
    /// Guaranteed delivery queue overflowed.
    MessageQueueFull,
    /// Read, write or close failure on the transport.
    TransportError(ByteString),
    /// The authenticator failed internally.
    AuthenticateFailed,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::ConnectDisconnect => write!(f, "Disconnect"),
            Reason::ConnectRemoteClose => write!(f, "Remote close"),
            Reason::ConnectKeepaliveTimeout => write!(f, "Keepalive timeout"),
            Reason::ConnectKicked => write!(f, "Kicked"),
            Reason::ProtocolViolation(r) => write!(f, "Protocol violation: {}", r),
            Reason::MessageQueueFull => write!(f, "Message queue is full"),
            Reason::TransportError(r) => write!(f, "Transport error: {}", r),
            Reason::AuthenticateFailed => write!(f, "Authenticate failed"),
        }
    }
}

impl Reason {
    #[inline]
    pub fn protocol_violation<S: Into<ByteString>>(reason: S) -> Self {
        Reason::ProtocolViolation(reason.into())
    }
}

impl From<anyhow::Error> for Reason {
    fn from(e: anyhow::Error) -> Self {
        Reason::TransportError(ByteString::from(e.to_string()))
    }
}

/// Identity of one session: registry key, client id and connection facts.
#[derive(Clone)]
pub struct Id {
    pub key: SessionKey,
    pub client_id: ClientId,
    pub remote_addr: Option<SocketAddr>,
    pub username: Option<UserName>,
    pub create_time: TimestampMillis,
}

impl Id {
    #[inline]
    pub fn new(
        key: SessionKey,
        client_id: ClientId,
        remote_addr: Option<SocketAddr>,
        username: Option<UserName>,
    ) -> Self {
        Self { key, client_id, remote_addr, username, create_time: timestamp_millis() }
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}",
            self.key,
            self.remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            self.client_id
        )
    }
}

impl PartialEq for Id {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.client_id == other.client_id
    }
}

impl Eq for Id {}
