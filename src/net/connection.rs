//! Reactor-driven TCP connections.
//!
//! Each connection is serviced by one spawned future, the [`Driver`]. It
//! flushes the ordered write queue, then reads with a fixed budget and hands
//! inbound bytes to the connection's [`ConnectionHandler`]. Application code
//! holds the shared [`TcpConnection`] to send and close.

use crate::error::{Error, Result, panic_message};
use crate::net::state::{ConnectionEvent, ConnectionState};
use crate::net::tcp_stream::TcpStream;
use crate::net::tls::{TlsContext, TlsStream};
use crate::net::transport::Transport;
use crate::runtime::Handle;
use crate::time::timeout;

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, error, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Reads performed per poll before yielding to other work.
const READ_BUDGET: usize = 16;

/// Per-connection protocol logic.
///
/// One handler instance serves one connection, and its methods are never
/// called concurrently. Returning an error from [`on_data`] closes the
/// connection with that error.
///
/// [`on_data`]: ConnectionHandler::on_data
pub trait ConnectionHandler: Send + 'static {
    fn on_open(&mut self, _connection: &Arc<TcpConnection>) {}

    fn on_data(&mut self, connection: &Arc<TcpConnection>, data: &[u8]) -> Result<()>;

    /// Called exactly once, with `None` after a graceful close.
    fn on_close(&mut self, _connection: &Arc<TcpConnection>, _error: Option<&Error>) {}
}

pub type OpenCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type DataCallback = Arc<dyn Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>, Option<&Error>) + Send + Sync>;

/// Closure-based [`ConnectionHandler`] shared by every connection of a
/// server or client.
#[derive(Clone, Default)]
pub struct ConnectionCallbacks {
    on_open: Option<OpenCallback>,
    on_data: Option<DataCallback>,
    on_close: Option<CloseCallback>,
}

impl ConnectionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(callback));
        self
    }

    pub fn on_data<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<TcpConnection>, &[u8]) + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(callback));
        self
    }

    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<TcpConnection>, Option<&Error>) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(callback));
        self
    }
}

impl ConnectionHandler for ConnectionCallbacks {
    fn on_open(&mut self, connection: &Arc<TcpConnection>) {
        if let Some(callback) = &self.on_open {
            callback(connection);
        }
    }

    fn on_data(&mut self, connection: &Arc<TcpConnection>, data: &[u8]) -> Result<()> {
        if let Some(callback) = &self.on_data {
            callback(connection, data);
        }
        Ok(())
    }

    fn on_close(&mut self, connection: &Arc<TcpConnection>, error: Option<&Error>) {
        if let Some(callback) = &self.on_close {
            callback(connection, error);
        }
    }
}

impl fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Outbox {
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    close_requested: bool,
}

/// A live TCP connection, optionally secured with TLS.
pub struct TcpConnection {
    id: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    tls: bool,
    state: Mutex<ConnectionState>,
    outbox: Mutex<Outbox>,
    driver: AtomicWaker,
}

impl TcpConnection {
    fn new(local_addr: SocketAddr, peer_addr: SocketAddr, tls: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            local_addr,
            peer_addr,
            tls,
            state: Mutex::new(ConnectionState::Connecting),
            outbox: Mutex::new(Outbox::default()),
            driver: AtomicWaker::new(),
        })
    }

    /// Process-unique, increasing connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Queues `data` for sending. Writes go out in the order they were queued.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let data = data.into();
        if self.state().is_terminating() {
            return Err(Error::Closed);
        }

        let mut outbox = self.outbox.lock();
        if outbox.close_requested {
            return Err(Error::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }
        outbox.queued_bytes += data.len();
        outbox.queue.push_back(data);
        drop(outbox);

        self.driver.wake();
        Ok(())
    }

    /// Bytes queued but not yet handed to the socket.
    pub fn pending_bytes(&self) -> usize {
        self.outbox.lock().queued_bytes
    }

    /// Closes the connection once every queued write has been flushed.
    ///
    /// Later sends fail with [`Error::Closed`]. Calling it again has no effect.
    pub fn close(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.close_requested {
                return;
            }
            outbox.close_requested = true;
        }

        // Already closing or closed is fine.
        let _ = self.apply(ConnectionEvent::CloseRequested);
        self.driver.wake();
    }

    pub(crate) fn apply(&self, event: ConnectionEvent) -> Result<ConnectionState> {
        let mut state = self.state.lock();
        let next = state.transition(event)?;
        *state = next;
        Ok(next)
    }

    fn next_outgoing(&self) -> Next {
        let mut outbox = self.outbox.lock();
        match outbox.queue.pop_front() {
            Some(data) => {
                outbox.queued_bytes -= data.len();
                Next::Data(data)
            }
            None if outbox.close_requested => Next::Close,
            None => Next::Idle,
        }
    }

    fn discard_outgoing(&self) {
        let mut outbox = self.outbox.lock();
        outbox.close_requested = true;
        outbox.queue.clear();
        outbox.queued_bytes = 0;
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.tls)
            .field("state", &self.state())
            .finish()
    }
}

enum Next {
    Data(Vec<u8>),
    Close,
    Idle,
}

enum Outcome {
    LocalClose,
    RemoteClose,
    Failed(Error),
}

pub(crate) type FinishHook = Box<dyn FnOnce(&Arc<TcpConnection>) + Send>;

/// Runs `f`, turning a panic into an error.
fn guarded<R>(connection: &TcpConnection, what: &str, f: impl FnOnce() -> R) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        error!(connection = connection.id, callback = what, panic = %message, "connection callback panicked");
        Error::Panicked(message)
    })
}

struct Driver {
    connection: Arc<TcpConnection>,
    transport: Transport,
    handler: Box<dyn ConnectionHandler>,
    buf: Vec<u8>,
    writing: Option<(Vec<u8>, usize)>,
    on_finish: Option<FinishHook>,
    done: bool,
}

impl Driver {
    /// Flushes queued writes. Ready with `true` once a requested close may
    /// proceed.
    fn poll_write_side(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        loop {
            if let Some((data, offset)) = &mut self.writing {
                while *offset < data.len() {
                    let n = match self.transport.poll_write(cx, &data[*offset..]) {
                        Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                        Poll::Ready(Ok(n)) => n,
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                        Poll::Pending => return Poll::Pending,
                    };
                    *offset += n;
                }
                self.writing = None;
            }

            match self.connection.next_outgoing() {
                Next::Data(data) => self.writing = Some((data, 0)),
                Next::Close => {
                    return self.transport.poll_flush(cx).map_ok(|()| true);
                }
                Next::Idle => {
                    return self.transport.poll_flush(cx).map_ok(|()| false);
                }
            }
        }
    }

    fn step(&mut self, cx: &mut Context<'_>) -> Poll<Outcome> {
        self.connection.driver.register(cx.waker());

        for _ in 0..READ_BUDGET {
            match self.poll_write_side(cx) {
                Poll::Ready(Ok(true)) => return Poll::Ready(Outcome::LocalClose),
                Poll::Ready(Err(err)) => return Poll::Ready(Outcome::Failed(err.into())),
                Poll::Ready(Ok(false)) | Poll::Pending => {}
            }

            let n = match self.transport.poll_read(cx, &mut self.buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(0)) => return Poll::Ready(Outcome::RemoteClose),
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Poll::Ready(Outcome::RemoteClose);
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Outcome::Failed(err.into())),
            };

            let connection = &self.connection;
            let handler = &mut self.handler;
            let data = &self.buf[..n];
            match guarded(connection, "on_data", || handler.on_data(connection, data)) {
                Ok(Ok(())) => {}
                Ok(Err(err)) | Err(err) => return Poll::Ready(Outcome::Failed(err)),
            }
        }

        // Budget spent: let other futures run.
        cx.waker().wake_by_ref();
        Poll::Pending
    }

    fn finish(&mut self, outcome: Outcome) {
        self.done = true;

        let (event, error) = match outcome {
            Outcome::LocalClose => (ConnectionEvent::CloseRequested, None),
            Outcome::RemoteClose => (ConnectionEvent::RemoteClosed, None),
            Outcome::Failed(err) => (ConnectionEvent::Failed, Some(err)),
        };

        let connection = self.connection.clone();
        connection.discard_outgoing();
        let _ = connection.apply(event);
        self.transport.shutdown();
        let _ = connection.apply(ConnectionEvent::Finished);

        match &error {
            Some(err) if !err.is_disconnect() => {
                warn!(connection = connection.id, peer = %connection.peer_addr, error = %err, "connection failed");
            }
            _ => debug!(connection = connection.id, peer = %connection.peer_addr, "connection closed"),
        }

        let handler = &mut self.handler;
        let _ = guarded(&connection, "on_close", || handler.on_close(&connection, error.as_ref()));

        if let Some(on_finish) = self.on_finish.take() {
            on_finish(&connection);
        }
    }
}

impl Future for Driver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(());
        }

        let outcome = std::task::ready!(this.step(cx));
        this.finish(outcome);
        Poll::Ready(())
    }
}

impl Drop for Driver {
    // The executor stopped before the connection closed.
    fn drop(&mut self) {
        if !self.done {
            self.finish(Outcome::Failed(Error::Aborted));
        }
    }
}

/// TLS role and handshake bound for new connections.
#[derive(Clone)]
pub(crate) struct TlsSettings {
    pub(crate) context: TlsContext,
    pub(crate) handshake_timeout: Duration,
}

/// Parameters shared by [`establish`] callers.
pub(crate) struct Establish<'a> {
    pub(crate) handle: &'a Handle,
    pub(crate) tls: Option<&'a TlsSettings>,
    pub(crate) read_len: usize,
    pub(crate) on_finish: Option<FinishHook>,
}

/// Takes a connected socket through the handshake, reports it open and
/// spawns its driver.
///
/// A failed handshake closes the connection, reports the error to
/// `on_close`, and returns it.
pub(crate) async fn establish(
    params: Establish<'_>,
    tcp: TcpStream,
    mut handler: Box<dyn ConnectionHandler>,
) -> Result<Arc<TcpConnection>> {
    let connection = TcpConnection::new(tcp.local_addr()?, tcp.peer_addr()?, params.tls.is_some());
    connection.apply(ConnectionEvent::Established {
        tls: params.tls.is_some(),
    })?;

    let transport = match params.tls {
        None => Transport::Plain(tcp),
        Some(settings) => match handshake(settings, tcp, connection.peer_addr).await {
            Ok(stream) => {
                connection.apply(ConnectionEvent::HandshakeSucceeded)?;
                Transport::Tls(Box::new(stream))
            }
            Err(err) => {
                let _ = connection.apply(ConnectionEvent::HandshakeFailed);
                connection.discard_outgoing();
                warn!(peer = %connection.peer_addr, error = %err, "TLS handshake failed");
                let _ = guarded(&connection, "on_close", || handler.on_close(&connection, Some(&err)));
                return Err(err);
            }
        },
    };

    debug!(connection = connection.id, peer = %connection.peer_addr, tls = transport.is_tls(), "connection open");
    let _ = guarded(&connection, "on_open", || handler.on_open(&connection));

    let driver = Driver {
        connection: connection.clone(),
        transport,
        handler,
        buf: vec![0; params.read_len],
        writing: None,
        on_finish: params.on_finish,
        done: false,
    };
    // Detached: the driver ends with the connection.
    drop(params.handle.spawn(driver));

    Ok(connection)
}

async fn handshake(settings: &TlsSettings, tcp: TcpStream, peer: SocketAddr) -> Result<TlsStream> {
    let session = settings.context.session(peer)?;
    let mut stream = TlsStream::new(tcp, session);

    let result = match timeout(settings.handshake_timeout, stream.handshake()).await {
        Ok(result) => result,
        Err(_) => Err(Error::tls(format!(
            "handshake timed out after {:?}",
            settings.handshake_timeout
        ))),
    };

    match result {
        Ok(()) => Ok(stream),
        Err(err) => {
            stream.shutdown();
            Err(err)
        }
    }
}
