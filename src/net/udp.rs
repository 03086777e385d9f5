//! UDP nodes: an executor-driven [`UdpNode`] and a blocking [`SyncUdpNode`].

use crate::config::UdpConfig;
use crate::error::{Error, Result, panic_message};
use crate::net::tcp_stream::apply_options;
use crate::reactor::{Direction, Reactor, Registration};
use crate::runtime::{Handle, block_on_for};

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, poll_fn};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, error};

/// Largest datagram a node receives in one piece.
const MAX_DATAGRAM: usize = 64 * 1024;

const RECV_BUDGET: usize = 32;

pub(crate) struct UdpSocket {
    registration: Registration,
    inner: std::net::UdpSocket,
}

impl UdpSocket {
    pub(crate) fn bind(reactor: Arc<Reactor>, addr: SocketAddr, config: &UdpConfig) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(config.socket.reuse_address)?;
        socket.set_broadcast(config.broadcast)?;
        apply_options(&SockRef::from(&socket), &config.socket)?;
        socket.bind(&addr.into())?;

        let inner: std::net::UdpSocket = socket.into();
        let registration = Registration::new(reactor, inner.as_raw_fd())?;
        Ok(Self {
            registration,
            inner,
        })
    }

    pub(crate) fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        self.registration
            .poll_io(cx, Direction::Read, || self.inner.recv_from(buf))
    }

    pub(crate) fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        self.registration
            .poll_io(cx, Direction::Write, || self.inner.send_to(buf, target))
    }

    pub(crate) async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        poll_fn(|cx| self.poll_recv_from(cx, buf)).await
    }

    pub(crate) async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        poll_fn(|cx| self.poll_send_to(cx, buf, target)).await
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub(crate) fn socket(&self) -> SockRef<'_> {
        SockRef::from(&self.inner)
    }
}

pub type RecvCallback = Arc<dyn Fn(&UdpSender, &[u8], SocketAddr) + Send + Sync>;
pub type UdpCloseCallback = Arc<dyn Fn(Option<&Error>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct UdpCallbacks {
    on_recv: Option<RecvCallback>,
    on_close: Option<UdpCloseCallback>,
}

impl UdpCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_recv<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UdpSender, &[u8], SocketAddr) + Send + Sync + 'static,
    {
        self.on_recv = Some(Arc::new(callback));
        self
    }

    /// Called once when the node stops, with the error that stopped it.
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&Error>) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for UdpCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpCallbacks")
            .field("on_recv", &self.on_recv.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

#[derive(Default)]
struct SendQueue {
    datagrams: VecDeque<(Vec<u8>, SocketAddr)>,
    closed: bool,
}

struct UdpShared {
    local_addr: SocketAddr,
    queue: Mutex<SendQueue>,
    driver: AtomicWaker,
}

/// Cloneable sending half of a [`UdpNode`], handed to receive callbacks.
#[derive(Clone)]
pub struct UdpSender {
    shared: Arc<UdpShared>,
}

impl UdpSender {
    /// Queues one datagram. Datagrams leave in the order they were queued.
    pub fn send_to(&self, data: impl Into<Vec<u8>>, target: SocketAddr) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return Err(Error::Closed);
        }
        queue.datagrams.push_back((data.into(), target));
        drop(queue);

        self.shared.driver.wake();
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Stops the node after the queued datagrams are sent.
    pub fn close(&self) {
        self.shared.queue.lock().closed = true;
        self.shared.driver.wake();
    }
}

impl fmt::Debug for UdpSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSender")
            .field("local_addr", &self.shared.local_addr)
            .finish()
    }
}

struct UdpDriver {
    socket: UdpSocket,
    sender: UdpSender,
    callbacks: UdpCallbacks,
    buf: Vec<u8>,
    done: bool,
}

impl UdpDriver {
    fn poll_send_queue(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        loop {
            let (data, target) = {
                let mut queue = self.sender.shared.queue.lock();
                match queue.datagrams.pop_front() {
                    Some(datagram) => datagram,
                    None => return Poll::Ready(Ok(queue.closed)),
                }
            };

            match self.socket.poll_send_to(cx, &data, target) {
                Poll::Ready(Ok(_)) => {}
                // One unreachable peer must not stop the node.
                Poll::Ready(Err(err)) if is_transient(&err) => {
                    debug!(%target, error = %err, "datagram dropped");
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => {
                    self.sender.shared.queue.lock().datagrams.push_front((data, target));
                    return Poll::Pending;
                }
            }
        }
    }

    fn step(&mut self, cx: &mut Context<'_>) -> Poll<Option<Error>> {
        self.sender.shared.driver.register(cx.waker());

        for _ in 0..RECV_BUDGET {
            match self.poll_send_queue(cx) {
                Poll::Ready(Ok(true)) => return Poll::Ready(None),
                Poll::Ready(Err(err)) => return Poll::Ready(Some(err.into())),
                Poll::Ready(Ok(false)) | Poll::Pending => {}
            }

            let (n, peer) = match self.socket.poll_recv_from(cx, &mut self.buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(received)) => received,
                Poll::Ready(Err(err)) if is_transient(&err) => continue,
                Poll::Ready(Err(err)) => return Poll::Ready(Some(err.into())),
            };

            if let Some(on_recv) = &self.callbacks.on_recv {
                let sender = &self.sender;
                let data = &self.buf[..n];
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_recv(sender, data, peer))) {
                    error!(panic = %panic_message(payload.as_ref()), "udp receive callback panicked");
                }
            }
        }

        cx.waker().wake_by_ref();
        Poll::Pending
    }

    fn finish(&mut self, error: Option<Error>) {
        self.done = true;
        {
            let mut queue = self.sender.shared.queue.lock();
            queue.closed = true;
            queue.datagrams.clear();
        }
        debug!(addr = %self.sender.shared.local_addr, "udp node closed");

        if let Some(on_close) = &self.callbacks.on_close {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_close(error.as_ref()))) {
                error!(panic = %panic_message(payload.as_ref()), "udp close callback panicked");
            }
        }
    }
}

impl Future for UdpDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(());
        }
        let error = std::task::ready!(this.step(cx));
        this.finish(error);
        Poll::Ready(())
    }
}

impl Drop for UdpDriver {
    fn drop(&mut self) {
        if !self.done {
            self.finish(Some(Error::Aborted));
        }
    }
}

/// ICMP feedback surfaced on later calls; the socket itself is fine.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    ) || err.raw_os_error() == Some(libc::EHOSTUNREACH)
        || err.raw_os_error() == Some(libc::ENETUNREACH)
}

/// A UDP socket serviced by an executor.
///
/// Incoming datagrams go to the receive callback; outgoing datagrams are
/// queued and sent in order. Dropping the node closes it.
pub struct UdpNode {
    sender: UdpSender,
}

impl UdpNode {
    pub fn bind(
        handle: &Handle,
        addr: SocketAddr,
        config: UdpConfig,
        callbacks: UdpCallbacks,
    ) -> Result<Self> {
        config.socket.validate()?;
        let socket = UdpSocket::bind(handle.reactor().clone(), addr, &config)?;
        let local_addr = socket.local_addr()?;

        let sender = UdpSender {
            shared: Arc::new(UdpShared {
                local_addr,
                queue: Mutex::new(SendQueue::default()),
                driver: AtomicWaker::new(),
            }),
        };
        let driver = UdpDriver {
            socket,
            sender: sender.clone(),
            callbacks,
            buf: vec![0; MAX_DATAGRAM],
            done: false,
        };

        drop(handle.spawn(driver));
        debug!(addr = %local_addr, broadcast = config.broadcast, "udp node bound");

        Ok(Self { sender })
    }

    pub fn send_to(&self, data: impl Into<Vec<u8>>, target: SocketAddr) -> Result<()> {
        self.sender.send_to(data, target)
    }

    pub fn sender(&self) -> UdpSender {
        self.sender.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sender.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

impl Drop for UdpNode {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for UdpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpNode")
            .field("local_addr", &self.local_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A UDP socket whose calls block the calling thread for at most their
/// deadline. A zero deadline waits indefinitely.
///
/// Options are set before [`open`](Self::open); afterwards the setters fail
/// with [`Error::InvalidState`].
pub struct SyncUdpNode {
    socket: Option<UdpSocket>,
    reactor: Arc<Reactor>,
    config: UdpConfig,
}

impl SyncUdpNode {
    pub fn new() -> Result<Self> {
        Self::with_config(UdpConfig::default())
    }

    pub fn with_config(config: UdpConfig) -> Result<Self> {
        config.socket.validate()?;
        Ok(Self {
            socket: None,
            reactor: Arc::new(Reactor::new()?),
            config,
        })
    }

    fn options(&mut self) -> Result<&mut UdpConfig> {
        if self.socket.is_some() {
            return Err(Error::invalid_state("socket options can only be changed before open"));
        }
        Ok(&mut self.config)
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or(Error::NotConnected)
    }

    pub fn set_send_buffer_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::config("send buffer size must be greater than zero"));
        }
        self.options()?.socket.send_buffer_size = Some(size);
        Ok(())
    }

    pub fn set_recv_buffer_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::config("receive buffer size must be greater than zero"));
        }
        self.options()?.socket.recv_buffer_size = Some(size);
        Ok(())
    }

    pub fn set_broadcast(&mut self, broadcast: bool) -> Result<()> {
        self.options()?.broadcast = broadcast;
        Ok(())
    }

    pub fn send_buffer_size(&self) -> Result<usize> {
        match &self.socket {
            Some(socket) => Ok(socket.socket().send_buffer_size()?),
            None => self.config.socket.send_buffer_size.ok_or(Error::NotConnected),
        }
    }

    pub fn recv_buffer_size(&self) -> Result<usize> {
        match &self.socket {
            Some(socket) => Ok(socket.socket().recv_buffer_size()?),
            None => self.config.socket.recv_buffer_size.ok_or(Error::NotConnected),
        }
    }

    pub fn broadcast(&self) -> Result<bool> {
        match &self.socket {
            Some(socket) => Ok(socket.socket().broadcast()?),
            None => Ok(self.config.broadcast),
        }
    }

    /// Binds the socket to `addr`.
    pub fn open(&mut self, addr: SocketAddr) -> Result<()> {
        if self.socket.is_some() {
            return Err(Error::invalid_state("already open"));
        }
        let socket = UdpSocket::bind(self.reactor.clone(), addr, &self.config)?;
        self.socket = Some(socket);
        Ok(())
    }

    pub fn send_to(&self, data: &[u8], target: SocketAddr, timeout: Duration) -> Result<usize> {
        let socket = self.socket()?;
        let sent = block_on_for(&self.reactor, socket.send_to(data, target), timeout)
            .ok_or(Error::Timeout(timeout))??;
        Ok(sent)
    }

    /// Receives one datagram into `buf`; excess bytes of a larger datagram
    /// are discarded.
    pub fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> Result<(usize, SocketAddr)> {
        let socket = self.socket()?;
        let received = block_on_for(&self.reactor, socket.recv_from(buf), timeout)
            .ok_or(Error::Timeout(timeout))??;
        Ok(received)
    }

    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("sync udp node closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }
}

impl fmt::Debug for SyncUdpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncUdpNode")
            .field("open", &self.is_open())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn datagram_round_trip() {
        let mut a = SyncUdpNode::new().unwrap();
        let mut b = SyncUdpNode::new().unwrap();
        a.open(loopback()).unwrap();
        b.open(loopback()).unwrap();

        let target = b.local_addr().unwrap();
        a.send_to(b"hello", target, Duration::from_secs(1)).unwrap();

        let mut buf = [0; 16];
        let (n, from) = b.recv_from(&mut buf, Duration::from_secs(3)).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn recv_times_out_without_traffic() {
        let mut node = SyncUdpNode::new().unwrap();
        node.open(loopback()).unwrap();

        let started = Instant::now();
        let mut buf = [0; 16];
        let err = node.recv_from(&mut buf, Duration::from_millis(100)).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn options_are_frozen_after_open() {
        let mut node = SyncUdpNode::new().unwrap();
        node.set_broadcast(true).unwrap();
        node.open(loopback()).unwrap();

        assert!(node.broadcast().unwrap());
        assert!(matches!(node.set_broadcast(false), Err(Error::InvalidState(_))));
        node.close();
        assert!(node.set_broadcast(false).is_ok());
    }
}
