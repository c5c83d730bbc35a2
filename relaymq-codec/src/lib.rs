#![deny(unsafe_code)]

//! MQTT 3.1.1 control packet codec.
//!
//! Decodes a byte stream into [`Packet`] values and encodes outbound
//! packets, via [`Codec`] implementing `tokio_util`'s `Encoder`/`Decoder`
//! pair. The broker and client cores consume packets from here; nothing in
//! this crate knows about sessions or routing.

#[macro_use]
mod utils;

mod codec;
mod decode;
mod encode;
pub mod error;
mod packet;
pub mod types;

pub use codec::Codec;
pub use packet::{Connect, ConnectAck, ConnectAckReason, LastWill, Packet, Publish, SubscribeReturnCode};
pub use types::QoS;
