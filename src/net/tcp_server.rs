//! Accepting TCP server with an id-keyed connection registry.

use crate::config::{SocketConfig, TlsConfig};
use crate::error::Result;
use crate::net::connection::{
    ConnectionCallbacks, ConnectionHandler, Establish, TcpConnection, TlsSettings, establish,
};
use crate::net::tcp_listener::TcpListener;
use crate::net::tcp_stream::TcpStream;
use crate::net::tls::TlsContext;
use crate::runtime::{Handle, JoinHandle};

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

/// One-shot flag that wakes a single waiting future.
#[derive(Default)]
pub(crate) struct StopSignal {
    stopped: AtomicBool,
    waker: AtomicWaker,
}

impl StopSignal {
    /// Returns `true` if the signal was not already raised.
    pub(crate) fn raise(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::AcqRel);
        self.waker.wake();
        first
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn poll_raised(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.waker.register(cx.waker());
        if self.is_raised() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

type HandlerFactory = Box<dyn Fn() -> Box<dyn ConnectionHandler> + Send + Sync>;

struct ServerInner {
    handle: Handle,
    local_addr: SocketAddr,
    socket: SocketConfig,
    tls: Option<TlsSettings>,
    factory: HandlerFactory,
    connections: Mutex<HashMap<u64, Arc<TcpConnection>>>,
    stop: StopSignal,
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = poll_fn(|cx| {
                if self.stop.poll_raised(cx).is_ready() {
                    return Poll::Ready(None);
                }
                listener.poll_accept(cx).map(Some)
            })
            .await;

            let (stream, peer) = match accepted {
                None => break,
                Some(Ok(accepted)) => accepted,
                Some(Err(err)) => {
                    // Typically EMFILE or ECONNABORTED; keep serving.
                    warn!(addr = %self.local_addr, error = %err, "accept failed");
                    continue;
                }
            };

            trace!(addr = %self.local_addr, %peer, "accepted connection");
            drop(self.handle.spawn(self.clone().serve(stream)));
        }

        debug!(addr = %self.local_addr, "server stopped accepting");
    }

    async fn serve(self: Arc<Self>, stream: std::net::TcpStream) {
        let stream = match TcpStream::from_std(self.handle.reactor().clone(), stream) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(addr = %self.local_addr, error = %err, "cannot register accepted socket");
                return;
            }
        };
        if let Some(nodelay) = self.socket.nodelay {
            if let Err(err) = stream.socket().set_nodelay(nodelay) {
                warn!(error = %err, "cannot set TCP_NODELAY");
            }
        }

        let registry: Weak<ServerInner> = Arc::downgrade(&self);
        let params = Establish {
            handle: &self.handle,
            tls: self.tls.as_ref(),
            read_len: self.socket.read_len(),
            on_finish: Some(Box::new(move |connection: &Arc<TcpConnection>| {
                if let Some(server) = registry.upgrade() {
                    server.connections.lock().remove(&connection.id());
                }
            })),
        };

        let connection = match establish(params, stream, (self.factory)()).await {
            Ok(connection) => connection,
            Err(_) => return,
        };

        // `stop` raises its flag before draining under this lock, so checking
        // it here means a late connection is either drained or never inserted.
        let mut connections = self.connections.lock();
        if self.stop.is_raised() {
            drop(connections);
            connection.close();
            return;
        }

        // The driver removes the entry under this lock after reaching
        // `Closed`, so a connection that already finished is never inserted.
        if !connection.state().is_terminating() {
            connections.insert(connection.id(), connection);
        }
    }
}

/// TCP server accepting connections on an executor.
///
/// Accepted sockets are registered with the executor's reactor; every
/// connection gets its own handler from the server's factory. Dropping the
/// server stops it.
pub struct TcpServer {
    inner: Arc<ServerInner>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// Starts a plain TCP server dispatching to `callbacks`.
    pub fn bind(
        handle: &Handle,
        addr: SocketAddr,
        config: SocketConfig,
        callbacks: ConnectionCallbacks,
    ) -> Result<Self> {
        Self::bind_with(handle, addr, config, None, move || callbacks.clone())
    }

    /// Starts a TLS server dispatching to `callbacks`.
    pub fn bind_tls(
        handle: &Handle,
        addr: SocketAddr,
        config: SocketConfig,
        tls: &TlsConfig,
        callbacks: ConnectionCallbacks,
    ) -> Result<Self> {
        Self::bind_with(handle, addr, config, Some(tls), move || callbacks.clone())
    }

    /// Starts a server creating one handler per connection with `factory`.
    pub fn bind_with<H, F>(
        handle: &Handle,
        addr: SocketAddr,
        config: SocketConfig,
        tls: Option<&TlsConfig>,
        factory: F,
    ) -> Result<Self>
    where
        H: ConnectionHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        config.validate()?;
        let tls = match tls {
            Some(tls) => Some(TlsSettings {
                context: TlsContext::server(tls)?,
                handshake_timeout: tls.handshake_timeout,
            }),
            None => None,
        };

        let listener = TcpListener::bind(handle.reactor().clone(), addr, &config)?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(ServerInner {
            handle: handle.clone(),
            local_addr,
            socket: config,
            tls,
            factory: Box::new(move || -> Box<dyn ConnectionHandler> { Box::new(factory()) }),
            connections: Mutex::new(HashMap::new()),
            stop: StopSignal::default(),
        });

        let accept = handle.spawn(inner.clone().accept_loop(listener));
        debug!(addr = %local_addr, tls = inner.tls.is_some(), "server listening");

        Ok(Self {
            inner,
            accept: Mutex::new(Some(accept)),
        })
    }

    /// The bound address, with the actual port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn connection(&self, id: u64) -> Option<Arc<TcpConnection>> {
        self.inner.connections.lock().get(&id).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<TcpConnection>> {
        self.inner.connections.lock().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Queues `data` on every open connection and returns how many accepted it.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        self.connections()
            .iter()
            .filter(|connection| connection.send(data.to_vec()).is_ok())
            .count()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_raised()
    }

    /// Stops accepting and closes every connection.
    ///
    /// Off the executor's workers this also waits for the listener to be
    /// released.
    pub fn stop(&self) {
        if !self.inner.stop.raise() {
            return;
        }

        let connections: Vec<_> = self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close();
        }

        let accept = self.accept.lock().take();
        if let Some(accept) = accept {
            if Handle::current().is_none() {
                // Errors mean the executor already abandoned the loop.
                let _ = accept.join();
            }
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.inner.local_addr)
            .field("tls", &self.inner.tls.is_some())
            .field("connections", &self.connection_count())
            .finish()
    }
}
