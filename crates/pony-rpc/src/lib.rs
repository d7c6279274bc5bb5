//! Messaging fabric shared by the ponycloud daemons.
//!
//! One hub binds a listening endpoint; agents connect to it and are addressed
//! by identity. Every send resolves to exactly one live connection or fails
//! synchronously.
//!
//! # Architecture
//!
//! - [`protocol`]: wire packets (handshake and routed messages)
//! - [`codec`]: length-prefixed JSON framing
//! - [`address`]: `tcp://` and `ipc://` endpoint addresses
//! - [`backoff`]: reconnect delay policy
//! - [`transport`]: listening and supervised outbound sockets
//! - [`router`]: route table, sending and inbound events
//! - [`error`]: error types and the `Result` alias
//!
//! # Example
//!
//! ```no_run
//! use pony_rpc::{Backoff, ConnectOptions, Router, RouterEvent};
//! use pony_types::Identity;
//!
//! # async fn example() -> pony_rpc::Result<()> {
//! let hub = Identity::new("sparkle").expect("valid identity");
//! let mut router = Router::connect(ConnectOptions {
//!     address: "ipc:///run/ponycloud/sparkle.sock".to_string(),
//!     identity: Some(Identity::new("twilight").expect("valid identity")),
//!     default_recipient: hub,
//!     backoff: Backoff::default(),
//! })?;
//!
//! while let Some(event) = router.recv().await {
//!     if let RouterEvent::PeerConnected(_) = event {
//!         router.handle().send("status", serde_json::json!({}), None)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod backoff;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod router;
pub mod transport;

pub use address::{Address, AddressError};
pub use backoff::Backoff;
pub use codec::{CodecError, Frame, MAX_FRAME_SIZE, PacketCodec};
pub use error::{Result, RouterError, TransportError};
pub use protocol::{HANDSHAKE_TIMEOUT, Message, Packet};
pub use router::{ConnectOptions, RouteTable, Router, RouterEvent, RouterHandle};
pub use transport::{ConnectionId, Link, Transport, TransportEvent};

pub use pony_types::{Identity, Role};
