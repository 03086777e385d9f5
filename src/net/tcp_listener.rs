//! Non-blocking TCP listener.

use crate::config::SocketConfig;
use crate::net::tcp_stream::apply_options;
use crate::reactor::{Direction, Reactor, Registration};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::task::{Context, Poll};

const BACKLOG: i32 = 1024;

pub(crate) struct TcpListener {
    registration: Registration,
    inner: std::net::TcpListener,
}

impl TcpListener {
    /// Binds and listens on `addr`.
    pub(crate) fn bind(reactor: Arc<Reactor>, addr: SocketAddr, config: &SocketConfig) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(config.reuse_address)?;
        apply_options(&SockRef::from(&socket), config)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;

        let inner: std::net::TcpListener = socket.into();
        let registration = Registration::new(reactor, inner.as_raw_fd())?;

        Ok(Self {
            registration,
            inner,
        })
    }

    pub(crate) fn poll_accept(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<(std::net::TcpStream, SocketAddr)>> {
        self.registration
            .poll_io(cx, Direction::Read, || self.inner.accept())
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
