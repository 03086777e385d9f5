//! TCP and UDP networking on the executor's reactor.
//!
//! - [`TcpServer`] / [`TcpClient`]: connections driven by an executor,
//!   optionally secured with TLS, reported through a [`ConnectionHandler`]
//! - [`SyncTcpClient`] / [`SyncUdpNode`]: blocking calls with deadlines over
//!   a private reactor
//! - [`UdpNode`]: datagrams with a receive callback and an ordered send queue
//! - [`ConnectionState`]: the connection lifecycle as a pure state machine
//!
//! # Example
//!
//! ```no_run
//! use netcore::{ConnectionCallbacks, Executor, SocketConfig, TcpServer};
//!
//! let executor = Executor::new("echo", 2)?;
//! let callbacks = ConnectionCallbacks::new().on_data(|connection, data| {
//!     let _ = connection.send(data.to_vec());
//! });
//!
//! let server = TcpServer::bind(
//!     executor.handle(),
//!     "127.0.0.1:0".parse().unwrap(),
//!     SocketConfig::default(),
//!     callbacks,
//! )?;
//! println!("listening on {}", server.local_addr());
//! # Ok::<(), netcore::Error>(())
//! ```

pub(crate) mod connection;
pub(crate) mod state;
pub(crate) mod sync_tcp;
pub(crate) mod tcp_client;
pub(crate) mod tcp_listener;
pub(crate) mod tcp_server;
pub(crate) mod tcp_stream;
pub(crate) mod tls;
pub(crate) mod transport;
pub(crate) mod udp;

pub use connection::{
    CloseCallback, ConnectionCallbacks, ConnectionHandler, DataCallback, OpenCallback,
    TcpConnection,
};
pub use state::{ConnectionEvent, ConnectionState};
pub use sync_tcp::SyncTcpClient;
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
pub use udp::{RecvCallback, SyncUdpNode, UdpCallbacks, UdpCloseCallback, UdpNode, UdpSender};
