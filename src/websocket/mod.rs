//! WebSocket (RFC 6455) servers and clients on top of the TCP layer.
//!
//! ```no_run
//! use netcore::websocket::{WsCallbacks, WsServer};
//! use netcore::{Executor, WsConfig};
//!
//! let executor = Executor::new("ws", 2)?;
//! let callbacks = WsCallbacks::new().on_text(|session, text| {
//!     let _ = session.send_text(text);
//! });
//! let server = WsServer::bind(
//!     executor.handle(),
//!     "127.0.0.1:9001".parse().unwrap(),
//!     WsConfig::default(),
//!     None,
//!     callbacks,
//! )?;
//! # drop(server);
//! # Ok::<(), netcore::Error>(())
//! ```

pub(crate) mod client;
pub(crate) mod frame;
pub(crate) mod handshake;
pub(crate) mod server;
pub(crate) mod session;

pub use client::WsClient;
pub use frame::{Frame, FrameDecoder, FrameError, Message, MessageReader, Opcode, Role, close_code};
pub use handshake::{HandshakeError, compute_accept_key, generate_client_key};
pub use server::WsServer;
pub use session::{
    WsBytesCallback, WsCallbacks, WsCloseCallback, WsErrorCallback, WsOpenCallback, WsSession,
    WsTextCallback,
};
