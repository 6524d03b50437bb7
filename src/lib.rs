//! Chat-Room Service Client Library
//!
//! Maintains a persistent real-time session with a chat-room service over
//! a websocket transport: connect, authenticate, join a room, translate
//! the service's wire messages into structured events, keep a local view
//! of room state, and deliver events to registered handlers in a
//! well-defined order, reconnecting with backoff across transient network
//! failures.
//!
//! # Architecture
//! Layers, leaf-first:
//! - [`codec`] encodes outbound commands and decodes inbound frames
//! - [`transport`] owns the raw websocket connection plus keepalive
//! - [`auth`] runs the login handshake
//! - [`room`] holds the roster and room flags, mutated only by applying
//!   decoded messages
//! - [`event`] maps messages to ordered handler delivery
//! - [`session`] orchestrates it all on one background task
//! - [`client`] is the facade applications talk to
//!
//! Per inbound frame the order is fixed: decode, apply to room state,
//! translate, dispatch. Handlers therefore always observe the post-update
//! roster.
//!
//! # Example
//! ```ignore
//! use chat_client_v1::{Client, ClientConfig, EventKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::new("wss://chat.example.com/ws", "lobby")
//!         .with_nick("rusty");
//!     let mut client = Client::new(config);
//!
//!     client.on(EventKind::ChatMessage, |event| async move {
//!         println!("{:?}", event);
//!         Ok(())
//!     });
//!
//!     client.start().unwrap();
//!     client.send_chat("hello").await.unwrap();
//!     client.stop().await.unwrap();
//! }
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod error;
pub mod event;
pub mod room;
pub mod session;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use auth::{AuthConfig, Identity};
pub use client::{Client, ClientConfig};
pub use codec::{BanInfo, Command, Message, RoomInfo, UserInfo};
pub use error::{
    ActionError, AuthError, AuthFailure, ConnectError, DecodeError, EncodeError, HandlerError,
    PermissionError, SessionError, TransportError,
};
pub use event::{DisconnectReason, Dispatcher, ErrorSink, Event, EventKind};
pub use room::{RoomState, UserRecord};
pub use session::{SessionManager, SessionState};
pub use transport::{Connector, Transport, WsConnector, WsTransport};
pub use types::{Handle, HandlerId, UserLevel};
