#![deny(unsafe_code)]

//! Transport stack: stacked byte-stream layers (TCP, TLS, WebSocket) behind
//! one framed MQTT packet stream.
//!
//! A [`Builder`] binds a listener; its [`Acceptor`] finishes the upper-layer
//! handshakes for the flavour in use (`tcp` / `tls` / `ws` / `wss`) and hands
//! back an [`MqttStream`] speaking decoded control packets. Handshake
//! failures only fail the connection at hand, never the accept loop.

mod builder;
mod error;
mod stream;
mod ws;

pub use builder::{Acceptor, Builder, Listener, TlsListener};
pub use error::MqttError;
pub use stream::{BoxIo, HttpRequestHead, LinkInfo, MqttStream};
pub use ws::WsStream;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
