#![deny(unsafe_code)]

//! MQTT 3.1.1 broker and client core.
//!
//! The broker side routes every inbound PUBLISH through a wildcard
//! subscription trie to the matching sessions, honouring each grant's QoS;
//! per-client sessions survive reconnects unless opened clean, and a second
//! CONNECT with the same client identifier takes the session over. The
//! client side is symmetric, reusing the same in-flight state machine and
//! packet-identifier allocator behind a reconnecting background task.
//!
//! ```rust,no_run
//! use relaymq::context::ServerContext;
//! use relaymq::net::Builder;
//! use relaymq::server::{Listening, MqttServer};
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> relaymq::Result<()> {
//!     let scx = ServerContext::new().build();
//!
//!     MqttServer::new(scx)
//!         .listener(Listening::Tcp(
//!             Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 1883).into()).bind()?,
//!         ))
//!         .listener(Listening::Ws(
//!             Builder::new().name("external/ws").laddr(([0, 0, 0, 0], 8080).into()).bind()?,
//!         ))
//!         .build()
//!         .run()
//!         .await
//! }
//! ```

pub mod auth; // Pluggable connection authentication
pub mod client; // Reconnecting MQTT client core
pub mod context; // Broker-wide shared context
pub mod inflight; // In-flight windows and packet-identifier allocation
pub mod queue; // Bounded delivery queues
pub mod router; // Subscription routing
pub mod server; // Listener accept loops
pub mod session; // Session state and the per-connection event loop
pub mod shared; // Session registry and fan-out
pub mod store; // Session store seam
pub mod topic; // Topic parsing and validation
pub mod trie; // Topic filter trie
pub mod types; // Common data types
pub mod utils; // Small helpers

mod v3; // MQTT 3.1.1 broker-side connection workflow

pub use relaymq_codec as codec;
pub use relaymq_net as net;

pub use net::{Error, Result};
