//! Non-blocking TCP stream registered with a reactor.

use crate::config::SocketConfig;
use crate::reactor::{Direction, Reactor, Registration};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::future::poll_fn;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Applies the pre-connect options of `config` to `socket`.
pub(crate) fn apply_options(socket: &SockRef<'_>, config: &SocketConfig) -> io::Result<()> {
    if let Some(size) = config.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    Ok(())
}

pub(crate) struct TcpStream {
    // Declared first: deregisters before the descriptor closes.
    registration: Registration,
    inner: std::net::TcpStream,
}

impl TcpStream {
    /// Wraps an accepted or connected socket.
    pub(crate) fn from_std(reactor: Arc<Reactor>, inner: std::net::TcpStream) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        let registration = Registration::new(reactor, inner.as_raw_fd())?;
        Ok(Self {
            registration,
            inner,
        })
    }

    /// Connects to `addr` without blocking the thread.
    ///
    /// Options from `config` are applied before the connect is issued; the
    /// caller bounds the wait with `config.connect_timeout`.
    pub(crate) async fn connect(
        reactor: Arc<Reactor>,
        addr: SocketAddr,
        config: &SocketConfig,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        apply_options(&SockRef::from(&socket), config)?;
        if let Some(nodelay) = config.nodelay {
            socket.set_nodelay(nodelay)?;
        }
        if config.local_port != 0 {
            socket.set_reuse_address(config.reuse_address)?;
            let local: SocketAddr = match addr {
                SocketAddr::V4(_) => ([0, 0, 0, 0], config.local_port).into(),
                SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, config.local_port).into(),
            };
            socket.bind(&local.into())?;
        }

        let in_progress = match socket.connect(&addr.into()) {
            Ok(()) => false,
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                true
            }
            Err(err) => return Err(err),
        };

        let stream = Self::from_std(reactor, socket.into())?;
        if in_progress {
            poll_fn(|cx| {
                stream
                    .registration
                    .poll_io(cx, Direction::Write, || stream.connect_result())
            })
            .await?;
        }

        Ok(stream)
    }

    fn connect_result(&self) -> io::Result<()> {
        if let Some(err) = self.inner.take_error()? {
            return Err(err);
        }
        match self.inner.peer_addr() {
            Ok(_) => Ok(()),
            // Still in progress; wait for the next writable event.
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                Err(io::ErrorKind::WouldBlock.into())
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        self.registration
            .poll_io(cx, Direction::Read, || (&self.inner).read(buf))
    }

    pub(crate) fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.registration
            .poll_io(cx, Direction::Write, || (&self.inner).write(buf))
    }

    /// Reads TLS records from the socket into `conn`.
    pub(crate) fn poll_read_tls(
        &self,
        cx: &mut Context<'_>,
        conn: &mut rustls::Connection,
    ) -> Poll<io::Result<usize>> {
        self.registration
            .poll_io(cx, Direction::Read, || conn.read_tls(&mut &self.inner))
    }

    /// Writes pending TLS records from `conn` to the socket.
    pub(crate) fn poll_write_tls(
        &self,
        cx: &mut Context<'_>,
        conn: &mut rustls::Connection,
    ) -> Poll<io::Result<usize>> {
        self.registration
            .poll_io(cx, Direction::Write, || conn.write_tls(&mut &self.inner))
    }

    /// One non-blocking attempt to write pending TLS records.
    pub(crate) fn try_write_tls(&self, conn: &mut rustls::Connection) -> io::Result<usize> {
        conn.write_tls(&mut &self.inner)
    }

    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        poll_fn(|cx| self.poll_read(cx, buf)).await
    }

    pub(crate) async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = poll_fn(|cx| self.poll_write(cx, buf)).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        // The peer may already be gone.
        let _ = self.inner.shutdown(Shutdown::Both);
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub(crate) fn socket(&self) -> SockRef<'_> {
        SockRef::from(&self.inner)
    }
}
