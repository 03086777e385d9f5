//! Reactor-backed networking and concurrency toolkit.
//!
//! The crate is built around a small epoll reactor and named executors whose
//! worker threads drive it. On top of those sit the pieces applications
//! compose:
//!
//! # Architecture
//!
//! - **Executor**: named worker pool running posted [`Task`]s and spawned futures
//! - **Diagnose**: explicit diagnostics context recording task lifecycles
//! - **BoundedQueue**: blocking bounded queue with push strategies for backpressure
//! - **TimeoutTimer**: re-armable single-shot timer driven by the reactor
//! - **net**: TCP servers and clients (optionally TLS), UDP nodes, and
//!   blocking socket variants with deadlines
//! - **http**: request parser, router and a one-request-per-connection server
//! - **websocket**: RFC 6455 sessions for servers and clients
//!
//! # Example
//!
//! ```
//! use netcore::{Executor, Task};
//!
//! let executor = Executor::new("example", 2)?;
//! let task = Task::new("answer", |task| println!("running {}", task.name()));
//! executor.post_task(&task)?;
//! task.join()?;
//! # Ok::<(), netcore::Error>(())
//! ```

pub mod config;
pub mod diagnose;
pub mod error;
pub mod http;
pub mod net;
pub mod queue;
pub(crate) mod reactor;
pub mod runtime;
pub mod time;
pub(crate) mod utils;
pub mod websocket;

pub use config::{
    CertFormat, ExecutorConfig, HttpConfig, SocketConfig, TlsConfig, UdpConfig, VerifyMode, WsConfig,
};
pub use diagnose::{Diagnose, DiagnoseHook, DiagnoseSnapshot};
pub use error::{Error, ErrorKind, Result};
pub use net::{
    ConnectionCallbacks, ConnectionHandler, ConnectionState, SyncTcpClient, SyncUdpNode,
    TcpClient, TcpConnection, TcpServer, UdpCallbacks, UdpNode, UdpSender,
};
pub use queue::{BoundedQueue, PushStrategy};
pub use runtime::{Executor, Handle, JoinHandle, Task, TaskState};
pub use time::TimeoutTimer;
